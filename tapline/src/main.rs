//! tapline - operator CLI for the telemetry batching pipeline
//!
//! This tool provides commands for:
//! - Checking delivery configuration and the local backlog
//! - Listing records waiting in the event store
//! - Flushing the backlog to the collector
//! - Queueing synthetic touch samples for pipeline testing
//!
//! Uses XDG Base Directory specification for file locations:
//! - Event store: $XDG_DATA_HOME/tapline/events.db (~/.local/share/tapline/events.db)
//! - Config: $XDG_CONFIG_HOME/tapline/config.toml (~/.config/tapline/config.toml)
//! - Logs: $XDG_STATE_HOME/tapline/tapline.log

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tapline_core::{
    BatchCoordinator, Config, DeliveryClient, DeliveryError, EventRecord, EventStore,
    HttpDeliveryClient, SharedConnectivity, SqliteEventStore, TouchAction, TouchSample,
};

#[derive(Parser)]
#[command(name = "tapline")]
#[command(about = "Inspect and flush the tapline event backlog")]
#[command(version)]
struct Args {
    /// Verbose output (writes a log file)
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show delivery configuration and backlog size
    Status,

    /// List records waiting for delivery
    Pending {
        /// Maximum number of records to show
        #[arg(short, long, default_value_t = 20)]
        limit: usize,

        /// Print one JSON object per line
        #[arg(long)]
        json: bool,
    },

    /// Deliver every stored record now
    Flush,

    /// Queue a synthetic touch sample
    TrackTouch {
        #[arg(long, allow_hyphen_values = true)]
        x: f32,

        #[arg(long, allow_hyphen_values = true)]
        y: f32,

        /// down, move, up or cancel
        #[arg(long, default_value = "down")]
        action: TouchAction,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    Config::ensure_xdg_env();

    // Load configuration
    let config = Config::load().context("failed to load configuration")?;

    let _log_guard = if args.verbose {
        Some(tapline_core::logging::init(&config.logging).context("failed to initialize logging")?)
    } else {
        None
    };

    match args.command {
        Command::Status => cmd_status(&config),
        Command::Pending { limit, json } => cmd_pending(&config, limit, json),
        Command::Flush => cmd_flush(&config),
        Command::TrackTouch { x, y, action } => cmd_track_touch(&config, action, x, y),
    }
}

/// Single-threaded runtime; one command runs at a time
fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")
}

fn open_store(config: &Config) -> Result<Option<SqliteEventStore>> {
    let db_path = config.storage.database_path();
    if !db_path.exists() {
        println!("Event store not found at {}", db_path.display());
        return Ok(None);
    }
    let store = SqliteEventStore::open(&db_path).context("failed to open event store")?;
    Ok(Some(store))
}

fn cmd_status(config: &Config) -> Result<()> {
    println!("Tapline Configuration");
    println!("=====================");
    println!();

    let delivery = &config.delivery;

    println!("Delivery:        {}", delivery.enabled);
    println!(
        "Endpoint:        {}",
        delivery.endpoint.as_deref().unwrap_or("<not set>")
    );
    println!(
        "API Key:         {}",
        if delivery.api_key.is_some() {
            "<set>"
        } else {
            "<not set>"
        }
    );
    println!("Batch Size:      {}", config.batching.max_batch_size);
    println!("Batch Time:      {}s", config.batching.max_batch_time_secs);
    println!("Timeout:         {}s", delivery.timeout_secs);
    println!("Max Retries:     {}", delivery.max_retries);
    println!(
        "Event Store:     {}",
        config.storage.database_path().display()
    );

    println!();
    let db_path = config.storage.database_path();
    if db_path.exists() {
        let store = SqliteEventStore::open(&db_path).context("failed to open event store")?;
        let pending = runtime()?.block_on(store.count())?;
        println!("Pending Records: {}", pending);
    } else {
        println!("Pending Records: 0 (no event store yet)");
    }

    println!();
    if delivery.is_ready() {
        println!("Status: Ready to deliver");
    } else if delivery.enabled {
        println!("Status: Not ready (missing required configuration)");
    } else {
        println!("Status: Delivery disabled, records are kept locally");
        println!();
        println!("Enable delivery in config.toml:");
        println!();
        println!("  [delivery]");
        println!("  enabled = true");
        println!("  endpoint = \"https://collector.example.com\"");
        println!("  api_key = \"tk_live_xxxxxxxxxxxx\"");
    }

    Ok(())
}

fn cmd_pending(config: &Config, limit: usize, json: bool) -> Result<()> {
    let Some(store) = open_store(config)? else {
        return Ok(());
    };

    let records = runtime()?
        .block_on(store.load_pending())
        .context("failed to load pending records")?;

    if json {
        for record in records.iter().take(limit) {
            println!("{}", serde_json::to_string(record)?);
        }
        return Ok(());
    }

    if records.is_empty() {
        println!("No pending records.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<19}  {:<12}  {}",
        "ID", "Recorded", "Kind", "Payload"
    );
    println!("{:-<100}", "");

    for record in records.iter().take(limit) {
        let payload = record.payload.to_string();
        let payload = if payload.len() > 40 {
            format!("{}...", payload.chars().take(37).collect::<String>())
        } else {
            payload
        };

        println!(
            "{:<36}  {:<19}  {:<12}  {}",
            record.id,
            record.recorded_at.format("%Y-%m-%d %H:%M:%S"),
            record.kind.as_str(),
            payload
        );
    }

    if records.len() > limit {
        println!();
        println!("... and {} more", records.len() - limit);
    }

    Ok(())
}

fn cmd_flush(config: &Config) -> Result<()> {
    if !config.delivery.is_ready() {
        println!("Delivery is not configured. Run 'status' for details.");
        return Ok(());
    }

    let Some(store) = open_store(config)? else {
        return Ok(());
    };

    let client = HttpDeliveryClient::new(config.delivery.clone())
        .context("failed to create delivery client")?;

    runtime()?.block_on(async {
        // Start offline so the stored backlog is merged but not sent yet
        let connectivity = Arc::new(SharedConnectivity::offline());
        let coordinator = BatchCoordinator::builder(Arc::new(client))
            .store(Arc::new(store))
            .connectivity(connectivity.clone())
            .batching(&config.batching)
            .start()
            .await
            .context("failed to start coordinator")?;

        let pending = coordinator.pending_len();
        if pending == 0 {
            println!("No pending records to flush.");
            coordinator.shutdown().await?;
            return anyhow::Ok(());
        }

        println!("Flushing {} pending record(s)...", pending);
        tracing::info!(pending, "Manual flush");

        connectivity.set_available(true);
        let result = coordinator.flush().await;
        let sent = coordinator.stats().events_sent;
        coordinator
            .shutdown()
            .await
            .context("failed to persist remaining records")?;

        result.context("flush failed, records kept for the next attempt")?;
        println!("Flushed {} record(s)", sent);
        anyhow::Ok(())
    })
}

fn cmd_track_touch(config: &Config, action: TouchAction, x: f32, y: f32) -> Result<()> {
    let db_path = config.storage.database_path();
    let store = SqliteEventStore::open(&db_path).context("failed to open event store")?;
    let record = TouchSample::new(action, x, y).into_record();
    let id = record.id;

    let pending = runtime()?.block_on(async {
        // Queue only; `flush` delivers
        let coordinator = BatchCoordinator::builder(Arc::new(QueueOnly))
            .store(Arc::new(store))
            .connectivity(Arc::new(SharedConnectivity::offline()))
            .batching(&config.batching)
            .start()
            .await
            .context("failed to start coordinator")?;

        coordinator.add_event(record);
        let pending = coordinator.pending_len();
        coordinator
            .shutdown()
            .await
            .context("failed to persist record")?;
        anyhow::Ok(pending)
    })?;

    println!("Queued touch {}", id);
    println!("{} record(s) pending", pending);
    Ok(())
}

/// Client for commands that never go online
struct QueueOnly;

#[async_trait]
impl DeliveryClient for QueueOnly {
    async fn send(&self, _records: &[EventRecord]) -> Result<(), DeliveryError> {
        Err(DeliveryError::Offline)
    }
}
