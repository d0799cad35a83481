pub mod models;
pub mod queries;

pub use queries::{create_pool, create_pool_with, run_migrations};
