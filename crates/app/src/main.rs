mod accounts;
mod accrual;
mod admin;
mod context;
mod digest;
mod error;
mod events;
mod identity;
mod member;
mod program;
mod router;
mod telemetry;
#[cfg(test)]
mod test_support;
mod withdrawal;
mod worker;

use std::net::SocketAddr;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;

use loyalty_storage::Database;
use loyalty_util::{load_env_file, AppConfig};

use crate::{
    accrual::DailyAccrualJob,
    context::LoyaltyContext,
    digest::WeeklyDigestJob,
    events::EventPublisher,
    program::ProgramService,
    worker::{Mailer, NotificationWorker},
};

#[derive(Debug, Parser)]
#[command(name = "loyalty", version, about = "Loyalty ledger and withdrawal service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the HTTP API.
    Serve,
    /// Apply pending migrations and exit.
    Migrate,
    /// Credit today's daily accrual.
    Accrue,
    /// Queue this week's digests.
    Digest,
    /// Deliver queued notifications.
    Notify {
        /// Process a single batch and exit instead of polling.
        #[arg(long)]
        once: bool,
        /// Rows per batch; defaults to WORKER_BATCH.
        #[arg(long)]
        limit: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let cli = Cli::parse();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;

    let database = Database::connect(&config.database_url).await?;
    database.run_migrations().await?;
    let context = LoyaltyContext::new(database, &config.program_code, config.timezone);
    ProgramService::new(context.clone()).import_legacy().await?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            let state = router::AppState::new(metrics, context);
            let addr: SocketAddr = config.bind_addr;
            info!(stage = "app", %addr, env = %config.environment.as_str(), "starting HTTP server");

            let listener = tokio::net::TcpListener::bind(addr).await?;
            axum::serve(listener, router::app_router(state)).await?;
        }
        Command::Migrate => {
            info!(stage = "app", "migrations applied");
        }
        Command::Accrue => {
            let report = DailyAccrualJob::new(context).run().await?;
            print_json(&report)?;
        }
        Command::Digest => {
            let events = EventPublisher::new(context.clone());
            let report = WeeklyDigestJob::new(context, events).run().await?;
            print_json(&report)?;
        }
        Command::Notify { once, limit } => {
            let mut notify = config.notify.clone();
            if let Some(limit) = limit {
                notify.batch = limit;
            }
            let mailer = Mailer::from_config(&notify)?;
            let worker = NotificationWorker::new(context, mailer, &notify);
            if once {
                let report = worker.process_batch(notify.batch).await?;
                print_json(&report)?;
            } else {
                info!(
                    stage = "notify",
                    batch = notify.batch,
                    interval_ms = notify.interval.as_millis() as u64,
                    dry_run = notify.dry_run,
                    "notification worker started"
                );
                worker.run_loop().await;
            }
        }
    }

    Ok(())
}

fn print_json<T: Serialize>(report: &T) -> Result<(), serde_json::Error> {
    println!("{}", serde_json::to_string(report)?);
    Ok(())
}
