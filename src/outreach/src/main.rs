//! Outreach: runs the sequence engine's poller against in-process
//! collaborators.
//!
//! Main entry point that loads configuration, wires the engine and runs the
//! scheduler until Ctrl-C.

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use outreach_core::event_bus::TracingSink;
use outreach_core::AppConfig;
use outreach_sequences::collaborators::ContactRecord;
use outreach_sequences::memory::InMemoryBackends;
use outreach_sequences::types::TriggerEventType;
use outreach_sequences::{SequenceEngine, SequenceScheduler};
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Json,
    Pretty,
}

#[derive(Parser, Debug)]
#[command(name = "outreach")]
#[command(about = "Email sequence execution engine")]
#[command(version)]
struct Cli {
    /// Path to a TOML/YAML/JSON config file
    #[arg(long, env = "OUTREACH_CONFIG")]
    config: Option<String>,

    /// Node identifier (overrides config)
    #[arg(long, env = "OUTREACH__NODE_ID")]
    node_id: Option<String>,

    /// Seconds between poller cycles (overrides config)
    #[arg(long)]
    poll_interval: Option<u64>,

    #[arg(long, value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,

    /// Seed a demo sequence, trigger and contacts on startup
    #[arg(long, default_value_t = false)]
    seed_demo: bool,
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "outreach=info,outreach_sequences=info".into());
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

async fn seed_demo(engine: &SequenceEngine, backends: &InMemoryBackends) -> anyhow::Result<()> {
    let seed = engine
        .seed_demo("demo-owner")
        .context("seeding demo sequence")?;

    let people = [
        ("demo-1", "Ada", "Lovelace", "Analytical Engines", 72.0),
        ("demo-2", "Grace", "Hopper", "Navy Labs", 55.0),
        ("demo-3", "Alan", "Turing", "Bletchley", 20.0),
    ];
    for (id, first, last, company, score) in people {
        let mut contact = ContactRecord::new(id, format!("{}@example.com", first.to_lowercase()));
        contact.first_name = Some(first.to_string());
        contact.last_name = Some(last.to_string());
        contact.company = Some(company.to_string());
        contact.lead_score = Some(score);
        backends.contacts.upsert(contact);

        let payload = serde_json::json!({"contact_id": id, "lead_score": score});
        let report = engine
            .evaluate_trigger(TriggerEventType::LeadScoreChanged, &payload)
            .await?;
        info!(contact_id = id, enrolled = report.enrolled.len(), "Demo trigger evaluated");
    }

    info!(sequence_id = %seed.sequence_id, "Demo data seeded");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    info!("Outreach starting up");

    let mut config = AppConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });
    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(secs) = cli.poll_interval {
        config.scheduler.poll_interval_secs = secs;
    }

    info!(
        node_id = %config.node_id,
        poll_secs = config.scheduler.poll_interval_secs,
        batch_size = config.scheduler.batch_size,
        max_concurrency = config.scheduler.max_concurrency,
        "Configuration loaded"
    );

    let backends = InMemoryBackends::new();
    let engine = SequenceEngine::from_config(&config, backends.collaborators(config.timeouts.clone()))
        .with_event_sink(Arc::new(TracingSink));

    if cli.seed_demo {
        seed_demo(&engine, &backends).await?;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = SequenceScheduler::new(engine, &config).spawn(shutdown_rx);

    info!("Outreach is running");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown requested");

    if shutdown_tx.send(true).is_err() {
        warn!("Scheduler already stopped");
    }
    if let Err(e) = scheduler.await {
        error!(error = %e, "Scheduler task failed");
    }
    info!("Outreach stopped");
    Ok(())
}
