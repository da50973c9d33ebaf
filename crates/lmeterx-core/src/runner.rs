use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, AtomicUsize};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Configuration;
use crate::dataset::{Dataset, DatasetSource};
use crate::engine::{merge_shard_summaries, scheduler::Scheduler, FinalSummary, RealtimeRow, ShardSummary};
use crate::error::EngineError;
use crate::http::HttpClient;
use crate::parser::FieldMapping;
use crate::store::Store;
use crate::task::{Task, TaskStatus};

pub use crate::engine::virtual_user::VirtualUserConfig;

/// How many OS processes a task's load should be spread across. A single
/// process (shard_count == 1) is the common case; sharding only kicks in
/// for populations large enough that one Tokio runtime can't comfortably
/// drive them all.
pub fn shard_count(task: &Task, config: &Configuration) -> usize {
    let peak_users = task.load_profile.peak_users();
    if peak_users < config.multiprocess_threshold {
        return 1;
    }
    let cpu_count = num_cpus::get().max(1);
    if cpu_count <= 1 {
        return 1;
    }
    let by_population = (peak_users + config.min_users_per_process - 1) / config.min_users_per_process;
    by_population.clamp(1, cpu_count)
}

fn vu_config_for(task: &Task) -> Arc<VirtualUserConfig> {
    Arc::new(VirtualUserConfig {
        api_type: task.api_type,
        stream_mode: task.stream_mode,
        target_url: task.target_url.clone(),
        headers: task.headers.clone(),
        cookies: task.cookies.clone(),
        request_payload: task.request_payload.clone(),
    })
}

/// Runs exactly this shard's slice of a task's virtual-user population
/// in-process, streaming realtime rows to `store` as they're produced and
/// returning the raw, mergeable summary once every virtual user has exited.
pub async fn run_shard(
    task: &Task,
    config: &Configuration,
    store: &Store,
    shard_index: usize,
    shard_count: usize,
    cancel: CancellationToken,
) -> Result<ShardSummary, EngineError> {
    let image_root = Path::new(&config.upload_dir);
    let dataset = Arc::new(Dataset::load(&DatasetSource::File(PathBuf::from(&task.dataset_path)), image_root).await?);
    // Give each shard a distinct starting offset so two shards never begin
    // on the same entry.
    dataset.skip(shard_index);

    let mapping = Arc::new(FieldMapping::from_value(task.api_type, &task.field_mapping)?);
    let vu_config = vu_config_for(task);

    let population = population_for_shard(task.load_profile.peak_users(), shard_index, shard_count);
    let mut profile = task.load_profile.clone();
    scale_profile(&mut profile, population, task.load_profile.peak_users());

    let (event_tx, event_rx) = mpsc::channel(8 * population.max(1));
    let (row_tx, mut row_rx) = mpsc::channel(64);
    let active_users = Arc::new(AtomicUsize::new(0));
    let dropped = Arc::new(AtomicU64::new(0));

    // Built once per shard (not per virtual user): `reqwest::Client` pools
    // connections internally behind an `Arc`, so handing every VU a clone
    // of the same client is both cheap and the point of pooling at all.
    let mut builder = HttpClient::builder()
        .connect_timeout(config.connect_timeout)
        .read_timeout(config.read_timeout);
    if let Some(cert) = &task.cert_config {
        builder = builder.cert_config(cert).await?;
    }
    let shared_client = builder.build()?;
    let client_factory: Arc<dyn Fn() -> HttpClient + Send + Sync> = Arc::new(move || shared_client.clone());

    let scheduler = Scheduler::new(
        client_factory,
        dataset,
        mapping,
        vu_config,
        active_users.clone(),
        dropped.clone(),
        event_tx,
    );

    let task_id = task.id;
    let aggregator_handle = tokio::spawn(crate::engine::aggregator::run(
        task_id,
        event_rx,
        active_users,
        dropped,
        row_tx,
    ));

    let store_for_rows = store.clone();
    let row_forward = tokio::spawn(async move {
        while let Some(row) = row_rx.recv().await {
            if let Err(e) = store_for_rows.insert_realtime_row(&row).await {
                warn!(error = %e, "failed to persist realtime row");
            }
        }
    });

    scheduler
        .run(
            &profile,
            task.duration,
            task.spawn_rate,
            config.drain_timeout,
            cancel,
            |state| info!(shard = shard_index, %state, "scheduler state transition"),
        )
        .await;
    // Scheduler holds the last clone of the event sender; drop it so the
    // aggregator's channel closes once every virtual user has exited,
    // rather than waiting forever for a sender that will never send again.
    drop(scheduler);

    let shard_summary = aggregator_handle
        .await
        .map_err(|e| EngineError::Internal(e.to_string()))?;
    let _ = row_forward.await;

    Ok(shard_summary)
}

/// Splits a peak population evenly across shards, giving any remainder to
/// the first shards so `sum(population_for_shard(n, i, count)) == n`.
fn population_for_shard(total: usize, shard_index: usize, shard_count: usize) -> usize {
    let base = total / shard_count;
    let remainder = total % shard_count;
    base + usize::from(shard_index < remainder)
}

fn scale_profile(profile: &mut crate::task::LoadProfile, population: usize, original_peak: usize) {
    if original_peak == 0 {
        return;
    }
    match profile {
        crate::task::LoadProfile::Fixed { concurrent_users, .. } => {
            *concurrent_users = population;
        }
        crate::task::LoadProfile::Stepped {
            start_users,
            increment,
            max_users,
            ..
        } => {
            let ratio = population as f64 / original_peak as f64;
            *max_users = population;
            *start_users = ((*start_users as f64) * ratio).round().max(1.0) as usize;
            *increment = ((*increment as f64) * ratio).round().max(1.0) as usize;
        }
    }
}

/// Polls `store` for `task_id`'s status every `poll_interval` and fires
/// `cancel` the moment it observes `STOPPING`, so an in-flight Scheduler
/// starts draining instead of spawning further virtual users. Returns a
/// handle the caller must abort once its run finishes normally, or the
/// watcher polls forever.
pub fn spawn_stop_watcher(
    store: Store,
    task_id: Uuid,
    cancel: CancellationToken,
    poll_interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(poll_interval) => {}
            }
            match store.fetch_status(task_id).await {
                Ok(TaskStatus::Stopping) => {
                    info!(%task_id, "observed STOPPING, cancelling scheduler");
                    cancel.cancel();
                    return;
                }
                Ok(_) => {}
                Err(e) => warn!(%task_id, error = %e, "failed to poll task status for stop request"),
            }
        }
    })
}

/// Orchestrates a whole task: decides shard count, runs shard 0 in-process
/// and spawns the rest as `lmeterx-cli run-task --shard i --of n` child
/// processes, then merges every shard's raw summary into one. With
/// `shard_count == 1` this degenerates to running shard 0 alone, which is
/// exactly [`merge_shard_summaries`]'s one-shard identity case.
///
/// `cancel` is owned by the caller: it fires the Scheduler's cooperative
/// drain either because the caller observed `STOPPING` itself, or because
/// it was handed to [`spawn_stop_watcher`].
pub async fn run_task(
    task: Task,
    config: &Configuration,
    store: &Store,
    self_exe: &Path,
    cancel: CancellationToken,
) -> Result<FinalSummary, EngineError> {
    let shards = shard_count(&task, config);

    if shards == 1 {
        let shard = run_shard(&task, config, store, 0, 1, cancel).await?;
        return merge_shard_summaries(vec![shard])
            .ok_or_else(|| EngineError::Internal("empty shard summary set".to_string()));
    }

    info!(shards, task_id = %task.id, "splitting task across multiple processes");

    let mut children = Vec::new();
    for shard_index in 1..shards {
        let mut command = tokio::process::Command::new(self_exe);
        command
            .args([
                "run-task",
                "--shard",
                &shard_index.to_string(),
                "--of",
                &shards.to_string(),
                &task.id.to_string(),
            ])
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        children.push(command.spawn().map_err(EngineError::Io)?);
    }

    let local = run_shard(&task, config, store, 0, shards, cancel).await?;
    let mut summaries = vec![local];

    for mut child in children {
        let stdout = child.stdout.take();
        let status = child.wait().await.map_err(EngineError::Io)?;
        if !status.success() {
            warn!(?status, "shard process exited non-zero");
            continue;
        }
        if let Some(mut stdout) = stdout {
            use tokio::io::AsyncReadExt;
            let mut buf = String::new();
            stdout.read_to_string(&mut buf).await.map_err(EngineError::Io)?;
            match serde_json::from_str::<ShardSummary>(&buf) {
                Ok(summary) => summaries.push(summary),
                Err(e) => warn!(error = %e, "failed to parse shard summary"),
            }
        }
    }

    merge_shard_summaries(summaries).ok_or_else(|| EngineError::Internal("no shard summaries produced".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Configuration {
        Configuration {
            database_url: String::new(),
            multiprocess_threshold: 1000,
            min_users_per_process: 500,
            upload_dir: "/tmp".to_string(),
            data_dir: "/tmp".to_string(),
            log_dir: "/tmp".to_string(),
            connect_timeout: std::time::Duration::from_secs(5),
            read_timeout: std::time::Duration::from_secs(5),
            total_timeout: std::time::Duration::from_secs(5),
            drain_timeout: std::time::Duration::from_secs(5),
            poll_interval: std::time::Duration::from_secs(5),
            heartbeat_timeout: std::time::Duration::from_secs(5),
            health_port: 8080,
            success_rate_floor: 0.0,
        }
    }

    #[test]
    fn population_for_shard_sums_to_total() {
        let total = 17;
        let shards = 5;
        let sum: usize = (0..shards).map(|i| population_for_shard(total, i, shards)).sum();
        assert_eq!(sum, total);
    }

    #[test]
    fn population_for_shard_is_balanced() {
        let total = 10;
        let shards = 3;
        let pops: Vec<usize> = (0..shards).map(|i| population_for_shard(total, i, shards)).collect();
        assert_eq!(pops.iter().max().unwrap() - pops.iter().min().unwrap(), 1);
    }

    #[test]
    fn shard_count_below_threshold_is_one() {
        let cfg = config();
        let task = test_task(500);
        assert_eq!(shard_count(&task, &cfg), 1);
    }

    fn test_task(concurrent_users: usize) -> Task {
        Task {
            id: uuid::Uuid::new_v4(),
            name: "t".to_string(),
            created_by: "tester".to_string(),
            created_at: chrono::Utc::now(),
            status: crate::task::TaskStatus::Created,
            api_type: crate::task::ApiType::Generic,
            chat_type: crate::task::ChatType::TextOnly,
            stream_mode: crate::task::StreamMode::NonStreaming,
            model: None,
            target_url: "http://localhost".to_string(),
            headers: Default::default(),
            cookies: Default::default(),
            request_payload: serde_json::Value::Null,
            field_mapping: serde_json::Value::Null,
            dataset_path: "/tmp/dataset.jsonl".to_string(),
            load_profile: crate::task::LoadProfile::Fixed {
                concurrent_users,
                warmup: None,
            },
            spawn_rate: 10.0,
            duration: std::time::Duration::from_secs(1),
            cert_config: None,
            locked_by: None,
            pid: None,
            error_message: None,
        }
    }
}
