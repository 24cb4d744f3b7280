use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use reqwest::Url;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod crypto;
mod db;
mod diff;
mod error;
mod extract;
mod models;
mod notify;
mod outbox;
mod portal;
mod report;
mod retry;
mod scan;
mod scheduler;
mod store;
#[cfg(test)]
mod testing;

use config::TrackerConfig;
use crypto::PasswordCipher;
use db::PgStore;
use notify::TelegramNotifier;
use outbox::{DrainSettings, OutboxDrainer};
use portal::{PortalClient, PortalSettings};
use retry::{RetryClassifier, SystemClock};
use scan::Pipeline;
use scheduler::{Scheduler, SchedulerSettings};
use store::Persistence;

#[derive(Parser)]
#[command(name = "grades-tracker")]
#[command(about = "Watches the student portal and announces grade changes", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Enrol portal credentials from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Run the scan scheduler and the outbox drainer until Ctrl-C
    Run,
    /// Scan every tracked user once and exit
    ScanOnce,
    /// Deliver one batch of pending grade changes and exit
    DrainOnce {
        #[arg(long)]
        limit: Option<i64>,
    },
    /// Print the stored progress table of one user
    Snapshot {
        #[arg(long)]
        user_id: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,grades_tracker=debug")),
        )
        .init();

    let cli = Cli::parse();
    let config = TrackerConfig::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .connect(&config.database_url)
        .await
        .context("failed to connect to Postgres")?;

    match cli.command {
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Import { csv } => {
            let cipher = PasswordCipher::from_hex(config.require_encryption_key()?)?;
            let imported = db::import_csv(&pool, &cipher, &csv).await?;
            println!("Imported {imported} credentials from {}.", csv.display());
        }
        Commands::Run => run(&config, pool).await?,
        Commands::ScanOnce => {
            let scheduler = build_scheduler(&config, pool)?;
            let dispatched = scheduler.run_once().await?;
            println!("Scanned {dispatched} users.");
        }
        Commands::DrainOnce { limit } => {
            let mut config = config;
            if let Some(limit) = limit {
                config.outbox_batch_size = limit.max(1);
            }
            let drainer = build_drainer(&config, pool)?;
            let report = drainer.drain_once().await?;
            println!(
                "Delivered {}, failed {}, revoked {} unreachable users.",
                report.delivered, report.failed, report.unreachable_users
            );
        }
        Commands::Snapshot { user_id } => {
            let store = PgStore::new(pool);
            match store.get_snapshot(user_id).await? {
                Some(table) => print!("{}", report::render_progress_table(&table)),
                None => println!("No snapshot stored for user {user_id}."),
            }
        }
    }

    Ok(())
}

async fn run(config: &TrackerConfig, pool: PgPool) -> anyhow::Result<()> {
    let scheduler = build_scheduler(config, pool.clone())?;
    let drainer = build_drainer(config, pool)?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown requested");
            }
            cancel.cancel();
        });
    }

    let (scanned, ()) = tokio::join!(scheduler.run(cancel.clone()), drainer.run(cancel));
    scanned?;
    Ok(())
}

fn notifier(config: &TrackerConfig) -> anyhow::Result<Arc<TelegramNotifier>> {
    let notifier = TelegramNotifier::new(config.require_bot_token()?, config.http_timeout)
        .context("failed to build Telegram client")?;
    Ok(Arc::new(notifier))
}

fn build_scheduler(
    config: &TrackerConfig,
    pool: PgPool,
) -> anyhow::Result<Scheduler<PortalClient, impl Fn() -> Result<PortalClient, error::PortalError>>>
{
    let store = Arc::new(PgStore::new(pool));
    let cipher = PasswordCipher::from_hex(config.require_encryption_key()?)?;
    let retries = RetryClassifier::new(
        config.retry_threshold,
        config.retry_ttl,
        Arc::new(SystemClock),
    );
    let pipeline = Arc::new(Pipeline::new(
        store.clone(),
        notifier(config)?,
        retries,
        cipher,
    ));

    let portal_settings = PortalSettings {
        login_url: Url::parse(&config.portal_login_url)
            .with_context(|| format!("invalid PORTAL_LOGIN_URL {}", config.portal_login_url))?,
        grades_url: Url::parse(&config.portal_grades_url)
            .with_context(|| format!("invalid PORTAL_GRADES_URL {}", config.portal_grades_url))?,
        timeout: config.http_timeout,
    };

    Ok(Scheduler::new(
        SchedulerSettings {
            interval: config.scan_interval,
            pool_size: config.worker_pool_size,
            pacing_delay: config.pacing_delay,
            user_deadline: config.user_deadline,
        },
        store,
        pipeline,
        move || PortalClient::new(portal_settings.clone()),
    ))
}

fn build_drainer(config: &TrackerConfig, pool: PgPool) -> anyhow::Result<OutboxDrainer> {
    let store = Arc::new(PgStore::new(pool));
    Ok(OutboxDrainer::new(
        DrainSettings {
            interval: config.outbox_interval,
            batch_size: config.outbox_batch_size,
            lease: config.outbox_lease,
        },
        store.clone(),
        store,
        notifier(config)?,
    ))
}
