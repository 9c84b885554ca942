use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use cronhook::api;
use cronhook::config::Config;
use cronhook::db;
use cronhook::jobs::{Dispatcher, HttpWebhookSender, JobStore, JobsRepo, MemoryJobStore};

#[derive(Debug, Parser)]
#[command(name = "cronhook-worker", about = "Delivers scheduled webhooks")]
struct Args {
    /// Run a single sweep and exit.
    #[arg(long)]
    once: bool,

    /// Do not start the management API even if API_ADDR is set. No
    /// PRIVATE_API_KEY is needed in this mode.
    #[arg(long)]
    no_api: bool,

    /// Keep jobs in process memory instead of Postgres.
    #[arg(long)]
    in_memory: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    cronhook::observability::init();

    let loaded = if args.no_api || args.once {
        Config::from_env_without_api()
    } else {
        Config::from_env()
    };
    let cfg = match loaded {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return Err(e);
        }
    };

    let api_addr = cfg.api_addr.clone();

    info!(
        worker_id = %cfg.worker_id,
        poll_interval_secs = cfg.poll_interval_secs,
        max_retry_attempts = cfg.max_retry_attempts,
        batch_size = cfg.dispatch_batch_size,
        max_concurrent = cfg.max_concurrent_deliveries,
        lease_seconds = cfg.lease_seconds,
        api = api_addr.as_deref().unwrap_or("disabled"),
        auth = if cfg.api_key.is_some() { "enabled" } else { "disabled" },
        store = if args.in_memory { "memory" } else { "postgres" },
        "cronhook starting"
    );

    let store: Arc<dyn JobStore> = if args.in_memory {
        MemoryJobStore::arc() as Arc<dyn JobStore>
    } else {
        let pool = db::make_pool(cfg.database_url()?).await?;
        if cfg.migrate_on_startup {
            db::run_migrations(&pool).await?;
            info!("migrations applied");
        }
        Arc::new(JobsRepo::new(pool))
    };

    let sender = Arc::new(HttpWebhookSender::new()?);
    let dispatcher = Dispatcher::new(store.clone(), sender, cfg.dispatch_config());

    if args.once {
        let report = dispatcher.sweep().await?;
        info!(?report, "single sweep finished");
        return Ok(());
    }

    let app = api::router(api::ApiState {
        jobs: store.clone(),
        api_key: cfg.api_key.clone(),
    });

    let api_handle = tokio::spawn(async move {
        if let Some(addr) = api_addr {
            let listener = tokio::net::TcpListener::bind(&addr).await?;
            info!(%addr, "management api listening");
            axum::serve(listener, app).await?;
        } else {
            std::future::pending::<()>().await;
        }
        Ok::<(), anyhow::Error>(())
    });

    let worker_handle = tokio::spawn(async move {
        dispatcher
            .run(async {
                let _ = tokio::signal::ctrl_c().await;
                info!("shutdown signal received");
            })
            .await;
    });

    tokio::select! {
        res = api_handle => res??,
        res = worker_handle => res?,
    }

    Ok(())
}
