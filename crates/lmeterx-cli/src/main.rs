use std::path::PathBuf;

use clap::{Parser, Subcommand};
use lmeterx_core::dispatcher::Dispatcher;
use lmeterx_core::store::Store;
use lmeterx_core::task::TaskStatus;
use lmeterx_core::{runner, Configuration};
use tokio_util::sync::CancellationToken;
use tracing::error;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "lmeterx-cli", about = "Runner and dispatcher for the LMeterX load-generation engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the long-lived dispatcher loop: claim tasks, spawn runners,
    /// supervise them, serve /health.
    Dispatcher,
    /// Run one task (optionally one shard of it) in this process.
    RunTask {
        task_id: Uuid,
        /// This process's shard index, when invoked as a dispatcher-spawned
        /// shard subprocess. Omit to run the whole task standalone.
        #[arg(long)]
        shard: Option<usize>,
        #[arg(long = "of")]
        of: Option<usize>,
    },
}

fn init_logging(log_dir: &str) {
    let file_appender = tracing_appender::rolling::daily(log_dir, "lmeterx.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    // Leaking the guard is deliberate: it must live for the process
    // lifetime to keep flushing the non-blocking writer.
    Box::leak(Box::new(guard));

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .with_writer(non_blocking)
        .with_ansi(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Configuration::from_env()?;
    init_logging(&config.log_dir);

    let cli = Cli::parse();
    let store = Store::connect(&config.database_url).await?;
    let self_exe = std::env::current_exe()?;

    match cli.command {
        Command::Dispatcher => {
            let dispatcher = Dispatcher::new(store, config, self_exe);
            dispatcher.run().await?;
        }
        Command::RunTask { task_id, shard, of } => {
            run_task_command(store, config, self_exe, task_id, shard, of).await?;
        }
    }

    Ok(())
}

async fn run_task_command(
    store: Store,
    config: Configuration,
    self_exe: PathBuf,
    task_id: Uuid,
    shard: Option<usize>,
    of: Option<usize>,
) -> Result<(), Box<dyn std::error::Error>> {
    let task = store.fetch_task(task_id).await?;

    match (shard, of) {
        (Some(shard_index), Some(shard_count)) => {
            // Spawned by a dispatcher's own run_task as a shard subprocess;
            // task status is owned by the parent, so we only print our
            // shard's raw summary as JSON to stdout for it to merge. We
            // still watch for STOPPING ourselves since the parent's
            // cancellation token lives in a different process.
            let cancel = CancellationToken::new();
            let watcher = runner::spawn_stop_watcher(store.clone(), task_id, cancel.clone(), config.poll_interval);
            let summary = runner::run_shard(&task, &config, &store, shard_index, shard_count, cancel).await?;
            watcher.abort();
            println!("{}", serde_json::to_string(&summary)?);
        }
        _ => {
            store.update_task_status(task_id, TaskStatus::Running, None).await?;
            let cancel = CancellationToken::new();
            let watcher = runner::spawn_stop_watcher(store.clone(), task_id, cancel.clone(), config.poll_interval);
            let outcome = runner::run_task(task, &config, &store, &self_exe, cancel.clone()).await;
            watcher.abort();

            match outcome {
                Ok(summary) => {
                    store.insert_final_summary(&summary).await?;
                    let status = if cancel.is_cancelled() {
                        TaskStatus::Stopped
                    } else if config.meets_success_floor(summary.success_rate) {
                        TaskStatus::Completed
                    } else {
                        TaskStatus::FailedRequests
                    };
                    store.update_task_status(task_id, status, None).await?;
                    println!("{}", serde_json::to_string_pretty(&summary)?);
                }
                Err(e) => {
                    error!(%task_id, error = %e, "run-task failed");
                    store.update_task_status(task_id, TaskStatus::Failed, Some(&e.to_string())).await?;
                    return Err(Box::new(e));
                }
            }
        }
    }

    Ok(())
}
