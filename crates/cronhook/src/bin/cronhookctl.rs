use std::sync::Arc;

use anyhow::Context;
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use serde_json::json;
use uuid::Uuid;

use cronhook::config::Config;
use cronhook::db;
use cronhook::jobs::{Dispatcher, HttpWebhookSender, JobStore, JobsRepo, NewJob};

#[derive(Debug, Parser)]
#[command(name = "cronhookctl", about = "Operator tooling for the cronhook job table")]
struct Cli {
    /// Falls back to TEST_DATABASE_URL when unset.
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Delete every job.
    Reset,
    /// Insert `n` pending jobs targeting `url`, spread one second apart.
    Seed {
        n: u32,
        url: String,
    },
    /// Print job counts per status.
    Counts,
    /// Print one job as JSON.
    Show { id: Uuid },
    /// Run one dispatch sweep against the database and print the report.
    ///
    /// Uses the worker's configuration (retry limit, backoff, batch size,
    /// concurrency, lease), so invalid settings fail here as they would there.
    Sweep {
        /// Overrides WORKER_ID for this sweep.
        #[arg(long)]
        worker_id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    cronhook::observability::init();

    let cli = Cli::parse();
    let url = cli
        .database_url
        .or_else(|| std::env::var("TEST_DATABASE_URL").ok())
        .context("DATABASE_URL or TEST_DATABASE_URL must be set")?;

    let pool = db::make_pool(&url).await?;
    db::run_migrations(&pool).await?;
    let repo = JobsRepo::new(pool.clone());

    match cli.command {
        Command::Reset => {
            sqlx::query("TRUNCATE TABLE jobs").execute(&pool).await?;
            println!("reset OK");
        }
        Command::Seed { n, url } => {
            let now = Utc::now();
            for i in 0..n {
                let job = repo
                    .insert(NewJob {
                        webhook_url: url.clone(),
                        payload: json!({ "seq": i }),
                        scheduled_time: now + Duration::seconds(i64::from(i)),
                    })
                    .await?;
                println!("+ inserted job id={} scheduled_time={}", job.id, job.scheduled_time);
            }
        }
        Command::Counts => {
            let (pending, completed, failed) = repo.counts().await?;
            println!("jobs: pending={pending} completed={completed} failed={failed}");
        }
        Command::Show { id } => match repo.get(id).await? {
            Some(job) => println!("{}", serde_json::to_string_pretty(&job)?),
            None => anyhow::bail!("job {id} not found"),
        },
        Command::Sweep { worker_id } => {
            let mut cfg = Config::from_env_without_api()?.dispatch_config();
            if let Some(worker_id) = worker_id {
                cfg.worker_id = worker_id;
            }
            let dispatcher = Dispatcher::new(
                Arc::new(repo),
                Arc::new(HttpWebhookSender::new()?),
                cfg,
            );
            let report = dispatcher.sweep().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}
