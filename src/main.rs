use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reqwest::Url;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;
use wadispatch::realtime::{NoopSink, RealtimeSink, WebhookSink};
use wadispatch::whatsapp::WhatsAppClient;
use wadispatch::{campaign, config, db, worker};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the worker pool until interrupted
    Run,
    /// Set a draft campaign processing and dispatch its recipients
    Start { campaign_id: String },
    /// Pause a processing campaign
    Pause { campaign_id: String },
    /// Resume a paused campaign, re-dispatching pending recipients
    Resume { campaign_id: String },
    /// Cancel a campaign (terminal)
    Cancel { campaign_id: String },
    /// Print an example configuration file
    InitConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();

    if let Command::InitConfig = args.command {
        print!("{}", config::example());
        return Ok(());
    }

    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/wadispatch.db", cfg.app.data_dir));

    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    match args.command {
        Command::Run => {
            let api_base =
                Url::parse(&cfg.whatsapp.api_base).context("invalid whatsapp.api_base")?;
            let sender: Arc<dyn wadispatch::whatsapp::WhatsAppService> =
                Arc::new(WhatsAppClient::with_base_url(api_base));
            let sink: Arc<dyn RealtimeSink> = if cfg.realtime.webhook_url.trim().is_empty() {
                Arc::new(NoopSink)
            } else {
                let endpoint =
                    Url::parse(&cfg.realtime.webhook_url).context("invalid realtime.webhook_url")?;
                Arc::new(WebhookSink::new(endpoint))
            };

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let pool_task = tokio::spawn(worker::run_pool(
                pool.clone(),
                sender,
                sink,
                cfg.worker_config(),
                shutdown_rx,
            ));

            info!(workers = cfg.app.workers, "worker pool started");
            tokio::signal::ctrl_c().await?;
            info!("shutdown requested; letting in-flight jobs finish");
            let _ = shutdown_tx.send(true);
            pool_task.await?;
        }
        Command::Start { campaign_id } => {
            let dispatched = campaign::start_campaign(&pool, &campaign_id).await?;
            info!(campaign_id, dispatched, "campaign started");
        }
        Command::Pause { campaign_id } => {
            campaign::pause_campaign(&pool, &campaign_id).await?;
            info!(campaign_id, "campaign paused");
        }
        Command::Resume { campaign_id } => {
            let dispatched = campaign::resume_campaign(&pool, &campaign_id).await?;
            info!(campaign_id, dispatched, "campaign resumed");
        }
        Command::Cancel { campaign_id } => {
            campaign::cancel_campaign(&pool, &campaign_id).await?;
            info!(campaign_id, "campaign cancelled");
        }
        Command::InitConfig => unreachable!(),
    }

    Ok(())
}
