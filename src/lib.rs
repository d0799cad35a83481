pub mod app;
pub mod config;
pub mod connection;
pub mod credentials;
pub mod db;
pub mod error;
pub mod export;
pub mod http;
pub mod mail;
pub mod query;
pub mod scheduler;
pub mod store;
pub mod stream;
