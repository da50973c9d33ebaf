use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::aggregator::RequestEvent;
use super::virtual_user::{VirtualUser, VirtualUserConfig};
use crate::dataset::Dataset;
use crate::http::HttpClient;
use crate::parser::FieldMapping;
use crate::task::LoadProfile;

/// Lifecycle state of a running scheduler, reported to the dispatcher/store
/// as the task progresses through its load profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Idle,
    Warmup,
    Ramp,
    Plateau,
    Drain,
    Done,
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SchedulerState::Idle => "idle",
            SchedulerState::Warmup => "warmup",
            SchedulerState::Ramp => "ramp",
            SchedulerState::Plateau => "plateau",
            SchedulerState::Drain => "drain",
            SchedulerState::Done => "done",
        };
        write!(f, "{s}")
    }
}

/// Drives virtual-user population according to a task's load profile,
/// spawning them onto a shared `JoinSet` and tracking `active_users` for the
/// aggregator's realtime rows. Shrinking the population (stepped profiles
/// never shrink, but a future profile kind might) cancels the
/// most-recently-spawned VUs first.
pub struct Scheduler {
    client_factory: Arc<dyn Fn() -> HttpClient + Send + Sync>,
    dataset: Arc<Dataset>,
    mapping: Arc<FieldMapping>,
    vu_config: Arc<VirtualUserConfig>,
    active_users: Arc<AtomicUsize>,
    dropped: Arc<AtomicU64>,
    tx: mpsc::Sender<RequestEvent>,
}

impl Scheduler {
    pub fn new(
        client_factory: Arc<dyn Fn() -> HttpClient + Send + Sync>,
        dataset: Arc<Dataset>,
        mapping: Arc<FieldMapping>,
        vu_config: Arc<VirtualUserConfig>,
        active_users: Arc<AtomicUsize>,
        dropped: Arc<AtomicU64>,
        tx: mpsc::Sender<RequestEvent>,
    ) -> Self {
        Self {
            client_factory,
            dataset,
            mapping,
            vu_config,
            active_users,
            dropped,
            tx,
        }
    }

    fn spawn_one(
        &self,
        join_set: &mut JoinSet<()>,
        shard_cancel: &CancellationToken,
        warmup_deadline: Option<Instant>,
    ) -> CancellationToken {
        let vu_cancel = shard_cancel.child_token();
        let vu = VirtualUser::new(
            (self.client_factory)(),
            self.dataset.clone(),
            self.mapping.clone(),
            self.vu_config.clone(),
        );
        let tx = self.tx.clone();
        let dropped = self.dropped.clone();
        let active_users = self.active_users.clone();
        active_users.fetch_add(1, Ordering::Relaxed);
        let cancel_for_task = vu_cancel.clone();
        join_set.spawn(async move {
            vu.run(cancel_for_task, warmup_deadline, tx, dropped).await;
            active_users.fetch_sub(1, Ordering::Relaxed);
        });
        vu_cancel
    }

    async fn pace(&self, spawn_rate: f64) {
        if spawn_rate > 0.0 {
            tokio::time::sleep(Duration::from_secs_f64(1.0 / spawn_rate)).await;
        }
    }

    /// Runs the whole scheduled population to completion (or until `cancel`
    /// fires), draining outstanding virtual users before returning.
    pub async fn run(
        &self,
        profile: &LoadProfile,
        duration: Duration,
        spawn_rate: f64,
        drain_timeout: Duration,
        cancel: CancellationToken,
        on_state: impl Fn(SchedulerState),
    ) {
        let mut join_set = JoinSet::new();
        let mut vu_tokens: Vec<CancellationToken> = Vec::new();

        match profile {
            LoadProfile::Fixed { concurrent_users, warmup } => {
                let warmup_deadline = warmup.map(|w| {
                    on_state(SchedulerState::Warmup);
                    Instant::now() + w
                });
                for _ in 0..*concurrent_users {
                    if cancel.is_cancelled() {
                        break;
                    }
                    vu_tokens.push(self.spawn_one(&mut join_set, &cancel, warmup_deadline));
                    self.pace(spawn_rate).await;
                }
                on_state(SchedulerState::Plateau);
                tokio::select! {
                    _ = tokio::time::sleep(duration) => {}
                    _ = cancel.cancelled() => {}
                }
            }
            LoadProfile::Stepped {
                start_users,
                increment,
                step_duration,
                max_users,
                sustain,
            } => {
                on_state(SchedulerState::Ramp);
                let mut current = 0usize;
                let target_initial = (*start_users).min(*max_users);
                while current < target_initial && !cancel.is_cancelled() {
                    vu_tokens.push(self.spawn_one(&mut join_set, &cancel, None));
                    current += 1;
                    self.pace(spawn_rate).await;
                }
                while current < *max_users && !cancel.is_cancelled() {
                    tokio::select! {
                        _ = tokio::time::sleep(*step_duration) => {}
                        _ = cancel.cancelled() => break,
                    }
                    let step_target = (current + increment).min(*max_users);
                    while current < step_target && !cancel.is_cancelled() {
                        vu_tokens.push(self.spawn_one(&mut join_set, &cancel, None));
                        current += 1;
                        self.pace(spawn_rate).await;
                    }
                }
                on_state(SchedulerState::Plateau);
                tokio::select! {
                    _ = tokio::time::sleep(*sustain) => {}
                    _ = cancel.cancelled() => {}
                }
            }
        }

        on_state(SchedulerState::Drain);
        cancel.cancel();
        let drained = tokio::time::timeout(drain_timeout, async {
            while join_set.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            join_set.abort_all();
            while join_set.join_next().await.is_some() {}
        }
        on_state(SchedulerState::Done);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduler_state_display_is_lowercase() {
        assert_eq!(SchedulerState::Warmup.to_string(), "warmup");
        assert_eq!(SchedulerState::Plateau.to_string(), "plateau");
    }

    #[test]
    fn scheduler_state_serde_roundtrip() {
        let state = SchedulerState::Ramp;
        let json = serde_json::to_string(&state).unwrap();
        assert_eq!(json, "\"ramp\"");
        let parsed: SchedulerState = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, state);
    }

    fn make_config() -> Arc<VirtualUserConfig> {
        Arc::new(VirtualUserConfig {
            api_type: crate::task::ApiType::Generic,
            stream_mode: crate::task::StreamMode::NonStreaming,
            target_url: "http://127.0.0.1:0".to_string(),
            headers: Default::default(),
            cookies: Default::default(),
            request_payload: serde_json::Value::Null,
        })
    }

    fn make_dataset() -> Arc<Dataset> {
        Arc::new(
            Dataset::from_entries(vec![crate::dataset::DatasetEntry {
                id: "0".to_string(),
                prompts: vec![],
                images: vec![],
                raw_payload: Some(serde_json::json!({"x": 1})),
            }])
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn fixed_profile_spawns_requested_user_count() {
        let (tx, _rx) = mpsc::channel(64);
        let active_users = Arc::new(AtomicUsize::new(0));
        let scheduler = Scheduler::new(
            Arc::new(|| HttpClient::builder().build().expect("client builds")),
            make_dataset(),
            Arc::new(FieldMapping::from_value(crate::task::ApiType::Generic, &serde_json::Value::Null).unwrap()),
            make_config(),
            active_users.clone(),
            Arc::new(AtomicU64::new(0)),
            tx,
        );
        let cancel = CancellationToken::new();
        let states = std::sync::Mutex::new(Vec::new());
        scheduler
            .run(
                &LoadProfile::Fixed { concurrent_users: 3, warmup: None },
                Duration::from_millis(10),
                1000.0,
                Duration::from_secs(1),
                cancel,
                |s| states.lock().unwrap().push(s),
            )
            .await;
        assert!(states.lock().unwrap().contains(&SchedulerState::Plateau));
        assert!(states.lock().unwrap().contains(&SchedulerState::Done));
    }
}
