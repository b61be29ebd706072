use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use dotenvy::dotenv;
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use mirador_cli::{Command, Config};
use mirador_client::ListingsClientFactory;
use mirador_core::{AppError, RecordStore, SyncEngine};
use mirador_db::RecordRepository;

type Engine = SyncEngine<RecordRepository, ListingsClientFactory>;

/// How long `serve` waits for a cancelled cycle to wind down after Ctrl-C.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenv().ok();

    // Parse command line arguments
    let config = Config::parse();

    // Setup logging (stderr to keep stdout clean for JSON output)
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::from(config.log_level))
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to install tracing subscriber")?;

    if let Err(e) = run(config).await {
        if let Some(app_error) = e.downcast_ref::<AppError>() {
            eprintln!("\n{}\n", app_error.user_message());
        }
        return Err(e);
    }
    Ok(())
}

async fn run(config: Config) -> anyhow::Result<()> {
    let engine_config = config.engine_config()?;

    // Database connection
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;

    let repo = RecordRepository::new(pool);
    repo.migrate().await?;

    let engine: Engine = SyncEngine::new(repo.clone(), ListingsClientFactory, engine_config);

    // Execute command
    match config.command {
        Command::Serve => serve(&engine).await?,
        Command::Sync { force } => sync(&engine, force).await?,
        Command::Cleanup => {
            let report = engine.cleanup().await?;
            print_json(&report)?;
        }
        Command::Status => status(&engine, &repo).await?,
        Command::Show { id } => show(&repo, id).await?,
    }

    Ok(())
}

/// Run the scheduler until Ctrl-C, then cancel any in-flight cycle.
async fn serve(engine: &Engine) -> anyhow::Result<()> {
    engine.start();
    info!("Serving; press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    info!("Shutting down...");
    engine.stop();

    let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
    while engine.get_status().running {
        if tokio::time::Instant::now() >= deadline {
            warn!("Sync cycle still running at shutdown, abandoning it");
            break;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    if let Some(last) = engine.get_status().last_cycle {
        print_json(&last)?;
    }
    Ok(())
}

/// Run one cycle: manual trigger with `--force`, gated otherwise.
async fn sync(engine: &Engine, force: bool) -> anyhow::Result<()> {
    if force {
        let stats = engine.trigger_manual_sync().await?;
        return print_json(&stats);
    }

    match engine.run_scheduled().await? {
        Some(stats) => print_json(&stats),
        None => {
            let status = engine.get_status();
            info!("Sync skipped; use --force to run anyway");
            print_json(&json!({ "skipped": true, "gate": status.last_gate }))
        }
    }
}

async fn status(engine: &Engine, repo: &RecordRepository) -> anyhow::Result<()> {
    let gate = engine.check_gate().await?;
    let store = repo.get_stats().await?;
    let engine_status = engine.get_status();

    print_json(&json!({
        "gate": gate,
        "store": store,
        "config": engine_status.config,
    }))
}

async fn show(repo: &RecordRepository, id: i64) -> anyhow::Result<()> {
    match repo.find_by_external_id(id).await? {
        Some(record) => print_json(&record),
        None => anyhow::bail!("Listing {} is not in the local cache", id),
    }
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    let out = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{}", out);
    Ok(())
}
