use clap::Parser;
use querycron::app::AppState;
use querycron::config::local::LogFormat;
use querycron::config::LocalConfig;
use querycron::scheduler::executor::JobExecution;
use querycron::{db, error, http};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const EXPIRY_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(name = "querycron")]
#[command(about = "Scheduled SQL jobs with live result tracking", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Run one job synchronously, print its tracker and exit.
    #[arg(long, value_name = "JOB_ID")]
    run_job: Option<i32>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = run(args).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> error::Result<()> {
    let config = LocalConfig::from_file(&args.config)?;

    setup_logging(&config)?;

    info!("========================================");
    info!("  querycron - SQL job scheduler");
    info!("========================================");
    info!(
        "Database: {}:{}/{}",
        config.database.host, config.database.port, config.database.name
    );
    info!("HTTP Bind: {}", config.server.http_bind);
    info!("Log File: {}", config.server.log_file);
    info!("Exports: {}", config.exports.directory.display());
    info!(
        "Workers: {} (queue capacity {})",
        config.executor.workers, config.executor.queue_capacity
    );
    info!("========================================");

    info!("Connecting to database...");
    let pool = db::create_pool_with(config.connect_options()?).await?;
    debug!("Database connection established");

    info!("Running database migrations...");
    db::run_migrations(&pool).await?;
    debug!("Database migrations completed");

    let http_bind = config.server.http_bind.clone();
    let (state, queue) = AppState::new(config, pool)?;
    state.exports.ensure_directory()?;

    if let Some(job_id) = args.run_job {
        info!("Running job {} once", job_id);
        drop(queue);

        let tracker = state
            .executor
            .execute(JobExecution::manual(job_id))
            .await?
            .ok_or_else(|| error::DatabaseError::NotFound(format!("Job {}", job_id)))?;

        match serde_json::to_string_pretty(&tracker) {
            Ok(printed) => println!("{}", printed),
            Err(_) => println!("{:?}", tracker),
        }
        return Ok(());
    }

    let interrupted = state.recover_interrupted().await?;
    if interrupted > 0 {
        warn!("{} trackers were left unfinished by a previous run", interrupted);
    }

    state.seed_stream().await?;
    let state = Arc::new(state);

    let scheduler_handle = {
        let scheduler = state.scheduler.clone();
        tokio::spawn(async move {
            if let Err(e) = scheduler.start().await {
                error!("Scheduler error: {}", e);
            }
        })
    };

    let executor_handle = {
        let executor = state.executor.clone();
        tokio::spawn(async move {
            if let Err(e) = executor.start(queue).await {
                error!("Executor error: {}", e);
            }
        })
    };

    let sweep_handle = {
        let state = state.clone();
        tokio::spawn(async move {
            state.sweep_expired_results(EXPIRY_SWEEP_INTERVAL).await;
        })
    };

    let listener = tokio::net::TcpListener::bind(&http_bind)
        .await
        .map_err(|e| {
            error::ConfigError::ValidationFailed(format!("Cannot bind {}: {}", http_bind, e))
        })?;
    info!("HTTP server listening on {}", http_bind);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, http::build_router(state)).await {
            error!("HTTP server error: {}", e);
        }
    });

    tokio::select! {
        _ = scheduler_handle => {
            info!("Scheduler task completed");
        }
        _ = executor_handle => {
            info!("Executor task completed");
        }
        _ = sweep_handle => {
            info!("Result expiry task completed");
        }
        _ = server_handle => {
            info!("HTTP server task completed");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Shutting down...");
    Ok(())
}

fn setup_logging(config: &LocalConfig) -> error::Result<()> {
    let log_file = Path::new(&config.server.log_file);
    let directory = log_file
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = log_file.file_name().ok_or_else(|| {
        error::ConfigError::ValidationFailed("server.log_file must name a file".to_string())
    })?;
    let file_appender = tracing_appender::rolling::daily(directory, file_name);

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|e| error::ConfigError::ValidationFailed(format!("Invalid log filter: {}", e)))?;

    let json = config.server.log_format == LogFormat::Json;

    let (text_file, json_file) = if json {
        (None, Some(fmt::layer().json().with_writer(file_appender)))
    } else {
        (
            Some(fmt::layer().with_ansi(false).with_writer(file_appender)),
            None,
        )
    };
    let (text_stdout, json_stdout) = if json {
        (None, Some(fmt::layer().json().with_writer(std::io::stdout)))
    } else {
        (Some(fmt::layer().with_writer(std::io::stdout)), None)
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(text_file)
        .with(json_file)
        .with(text_stdout)
        .with(json_stdout)
        .init();

    Ok(())
}
