use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::histogram::Histogram;
use crate::error::FailureKind;

/// One observation emitted by a virtual user. `label` partitions stats the
/// way the scenario cares about: `first_token` and `completion` for
/// streaming chat turns, `request` for a plain non-streaming call, or a
/// caller-chosen custom label for GENERIC tasks.
#[derive(Debug, Clone)]
pub struct RequestEvent {
    pub label: String,
    pub elapsed_ms: u64,
    pub ok: bool,
    pub http_status: Option<u16>,
    pub failure_kind: Option<FailureKind>,
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
    pub estimated: bool,
    pub warmup: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StatBlock {
    count: u64,
    failures: HashMap<String, u64>,
    sum_ms: u64,
    min_ms: u64,
    max_ms: u64,
    histogram: Histogram,
    prompt_tokens: u64,
    completion_tokens: u64,
    total_tokens: u64,
    estimated_any: bool,
}

impl StatBlock {
    fn record(&mut self, event: &RequestEvent) {
        self.count += 1;
        if self.count == 1 {
            self.min_ms = event.elapsed_ms;
            self.max_ms = event.elapsed_ms;
        } else {
            self.min_ms = self.min_ms.min(event.elapsed_ms);
            self.max_ms = self.max_ms.max(event.elapsed_ms);
        }
        self.sum_ms += event.elapsed_ms;
        self.histogram.record(event.elapsed_ms);

        if !event.ok {
            if let Some(kind) = event.failure_kind {
                *self.failures.entry(kind.to_string()).or_insert(0) += 1;
            }
        }

        self.prompt_tokens += event.prompt_tokens.unwrap_or(0);
        self.completion_tokens += event.completion_tokens.unwrap_or(0);
        self.total_tokens += event.total_tokens.unwrap_or(0);
        self.estimated_any |= event.estimated;
    }

    fn success_count(&self) -> u64 {
        self.count.saturating_sub(self.failures.values().sum())
    }

    fn mean_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum_ms as f64 / self.count as f64
        }
    }

    /// Combines another shard's block into this one. Sums and min/max
    /// combine trivially; the histogram merge is what makes this cheap
    /// regardless of how many raw samples either shard saw.
    fn merge(&mut self, other: &StatBlock) {
        if other.count == 0 {
            return;
        }
        self.min_ms = if self.count == 0 {
            other.min_ms
        } else {
            self.min_ms.min(other.min_ms)
        };
        self.max_ms = self.max_ms.max(other.max_ms);
        self.count += other.count;
        self.sum_ms += other.sum_ms;
        self.histogram.merge(&other.histogram);
        for (kind, count) in &other.failures {
            *self.failures.entry(kind.clone()).or_insert(0) += count;
        }
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
        self.estimated_any |= other.estimated_any;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeRow {
    pub task_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub current_users: usize,
    pub current_rps: f64,
    pub current_fail_per_sec: f64,
    pub avg_response_ms: f64,
    pub min_response_ms: u64,
    pub max_response_ms: u64,
    pub median_response_ms: u64,
    pub p95_response_ms: u64,
    pub total_requests: u64,
    pub total_failures: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelSummary {
    pub label: String,
    pub count: u64,
    pub failure_count: u64,
    pub mean_ms: f64,
    pub min_ms: u64,
    pub max_ms: u64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalSummary {
    pub task_id: Uuid,
    pub duration_secs: f64,
    pub total_requests: u64,
    pub total_failures: u64,
    pub success_rate: f64,
    pub rps: f64,
    pub completion_tps: f64,
    pub total_tps: f64,
    pub tokens_estimated: bool,
    pub events_dropped: u64,
    pub labels: Vec<LabelSummary>,
}

fn label_summary(name: &str, block: &StatBlock) -> LabelSummary {
    LabelSummary {
        label: name.to_string(),
        count: block.count,
        failure_count: block.failures.values().sum(),
        mean_ms: block.mean_ms(),
        min_ms: block.min_ms,
        max_ms: block.max_ms,
        p50_ms: block.histogram.percentile(50.0),
        p95_ms: block.histogram.percentile(95.0),
        p99_ms: block.histogram.percentile(99.0),
    }
}

/// Consumes `RequestEvent`s from a single bounded channel and is the only
/// owner of the running statistics, so no locking is needed on the hot
/// path. Emits one `RealtimeRow` per second via `row_tx` and returns the
/// `FinalSummary` once `rx` closes (every virtual user has exited).
pub struct Aggregator {
    task_id: Uuid,
    overall: StatBlock,
    overall_warmup: StatBlock,
    labels: HashMap<String, StatBlock>,
    window_count: u64,
    window_fail: u64,
    run_start: std::time::Instant,
    warmup_elapsed_ms: u64,
}

impl Aggregator {
    pub fn new(task_id: Uuid) -> Self {
        Self {
            task_id,
            overall: StatBlock::default(),
            overall_warmup: StatBlock::default(),
            labels: HashMap::new(),
            window_count: 0,
            window_fail: 0,
            run_start: std::time::Instant::now(),
            warmup_elapsed_ms: 0,
        }
    }

    fn record(&mut self, event: RequestEvent) {
        if event.warmup {
            self.overall_warmup.record(&event);
            self.warmup_elapsed_ms = self.warmup_elapsed_ms.max(event.elapsed_ms);
            return;
        }
        // RPS and total_requests only count one event per logical request:
        // "request" (non-streaming LLM / GENERIC) or "completion" (the
        // streaming terminal event). A streaming request also emits a
        // "first_token" event, which still gets its own latency stats
        // below but must not inflate the request rate.
        if matches!(event.label.as_str(), "request" | "completion") {
            self.overall.record(&event);
            self.window_count += 1;
            if !event.ok {
                self.window_fail += 1;
            }
        }
        self.labels.entry(event.label.clone()).or_default().record(&event);
    }

    fn realtime_row(&mut self, active_users: usize) -> RealtimeRow {
        let row = RealtimeRow {
            task_id: self.task_id,
            timestamp: Utc::now(),
            current_users: active_users,
            current_rps: self.window_count as f64,
            current_fail_per_sec: self.window_fail as f64,
            avg_response_ms: self.overall.mean_ms(),
            min_response_ms: self.overall.min_ms,
            max_response_ms: self.overall.max_ms,
            median_response_ms: self.overall.histogram.percentile(50.0),
            p95_response_ms: self.overall.histogram.percentile(95.0),
            total_requests: self.overall.count,
            total_failures: self.overall.failures.values().sum(),
        };
        self.window_count = 0;
        self.window_fail = 0;
        row
    }

    /// Converts the accumulated raw (mergeable) stats into a `ShardSummary`
    /// once this shard's virtual users are done. A single-process run is
    /// just the one-shard case of [`merge_shard_summaries`].
    fn finish(self, events_dropped: u64) -> ShardSummary {
        ShardSummary {
            task_id: self.task_id,
            duration_secs: self.run_start.elapsed().as_secs_f64().max(0.001),
            overall: self.overall,
            labels: self.labels,
            events_dropped,
        }
    }
}

/// The raw, mergeable output of one shard's aggregator. Kept separate from
/// [`FinalSummary`] (which is percentile-reduced and DB-persisted) so that
/// `merge_shard_summaries` can still merge histograms exactly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardSummary {
    pub task_id: Uuid,
    pub duration_secs: f64,
    overall: StatBlock,
    labels: HashMap<String, StatBlock>,
    pub events_dropped: u64,
}

impl ShardSummary {
    fn reduce(&self) -> FinalSummary {
        let success = self.overall.success_count();
        let mut labels: Vec<LabelSummary> = self
            .labels
            .iter()
            .map(|(name, block)| label_summary(name, block))
            .collect();
        labels.sort_by(|a, b| a.label.cmp(&b.label));

        FinalSummary {
            task_id: self.task_id,
            duration_secs: self.duration_secs,
            total_requests: self.overall.count,
            total_failures: self.overall.failures.values().sum(),
            success_rate: if self.overall.count == 0 {
                0.0
            } else {
                success as f64 / self.overall.count as f64
            },
            rps: success as f64 / self.duration_secs,
            completion_tps: self.labels.get("completion").map(|b| b.completion_tokens).unwrap_or(0) as f64
                / self.duration_secs,
            total_tps: self.overall.total_tokens as f64 / self.duration_secs,
            tokens_estimated: self.overall.estimated_any,
            events_dropped: self.events_dropped,
            labels,
        }
    }
}

/// Merges every shard's raw summary into one `FinalSummary`. With exactly
/// one shard this is the identity reduction, which is the boundary behavior
/// a single-process run and a one-shard multi-process run must share.
pub fn merge_shard_summaries(shards: Vec<ShardSummary>) -> Option<FinalSummary> {
    let mut iter = shards.into_iter();
    let mut merged = iter.next()?;
    for shard in iter {
        merged.overall.merge(&shard.overall);
        merged.duration_secs = merged.duration_secs.max(shard.duration_secs);
        merged.events_dropped += shard.events_dropped;
        for (label, block) in shard.labels {
            merged.labels.entry(label).or_default().merge(&block);
        }
    }
    Some(merged.reduce())
}

/// Drives the aggregator's consume loop: records events as they arrive and
/// emits a realtime row on every tick of a 1-second interval, until `rx`
/// is closed (all virtual users have exited).
pub async fn run(
    task_id: Uuid,
    mut rx: mpsc::Receiver<RequestEvent>,
    active_users: Arc<AtomicUsize>,
    dropped: Arc<AtomicU64>,
    row_tx: mpsc::Sender<RealtimeRow>,
) -> ShardSummary {
    let mut aggregator = Aggregator::new(task_id);
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            maybe_event = rx.recv() => {
                match maybe_event {
                    Some(event) => aggregator.record(event),
                    None => break,
                }
            }
            _ = ticker.tick() => {
                let row = aggregator.realtime_row(active_users.load(Ordering::Relaxed));
                let _ = row_tx.send(row).await;
            }
        }
    }

    aggregator.finish(dropped.load(Ordering::Relaxed))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(label: &str, ms: u64, ok: bool) -> RequestEvent {
        RequestEvent {
            label: label.to_string(),
            elapsed_ms: ms,
            ok,
            http_status: Some(if ok { 200 } else { 500 }),
            failure_kind: if ok { None } else { Some(FailureKind::HttpStatus(500)) },
            prompt_tokens: Some(10),
            completion_tokens: Some(20),
            total_tokens: Some(30),
            estimated: false,
            warmup: false,
        }
    }

    #[test]
    fn records_update_overall_and_label_blocks() {
        let mut aggregator = Aggregator::new(Uuid::new_v4());
        aggregator.record(event("completion", 100, true));
        aggregator.record(event("completion", 200, true));
        assert_eq!(aggregator.overall.count, 2);
        assert_eq!(aggregator.labels["completion"].count, 2);
    }

    #[test]
    fn warmup_events_are_excluded_from_overall_stats() {
        let mut aggregator = Aggregator::new(Uuid::new_v4());
        let mut warmup_event = event("request", 50, true);
        warmup_event.warmup = true;
        aggregator.record(warmup_event);
        assert_eq!(aggregator.overall.count, 0);
        assert_eq!(aggregator.overall_warmup.count, 1);
    }

    #[test]
    fn failures_are_tracked_by_kind() {
        let mut aggregator = Aggregator::new(Uuid::new_v4());
        aggregator.record(event("request", 100, false));
        assert_eq!(aggregator.overall.failures[&FailureKind::HttpStatus(500).to_string()], 1);
    }

    #[test]
    fn realtime_row_window_resets_after_read() {
        let mut aggregator = Aggregator::new(Uuid::new_v4());
        aggregator.record(event("request", 100, true));
        let row = aggregator.realtime_row(5);
        assert_eq!(row.current_rps, 1.0);
        assert_eq!(row.current_users, 5);
        let second_row = aggregator.realtime_row(5);
        assert_eq!(second_row.current_rps, 0.0);
    }

    #[test]
    fn final_summary_success_rate_and_counts() {
        let mut aggregator = Aggregator::new(Uuid::new_v4());
        aggregator.record(event("request", 100, true));
        aggregator.record(event("request", 100, true));
        aggregator.record(event("request", 100, false));
        let summary = aggregator.finish(0).reduce();
        assert_eq!(summary.total_requests, 3);
        assert_eq!(summary.total_failures, 1);
        assert!((summary.success_rate - (2.0 / 3.0)).abs() < 1e-9);
    }

    #[test]
    fn final_summary_carries_events_dropped() {
        let aggregator = Aggregator::new(Uuid::new_v4());
        let summary = aggregator.finish(42).reduce();
        assert_eq!(summary.events_dropped, 42);
    }

    #[test]
    fn tokens_estimated_flag_propagates_from_any_event() {
        let mut aggregator = Aggregator::new(Uuid::new_v4());
        let mut estimated_event = event("request", 100, true);
        estimated_event.estimated = true;
        aggregator.record(estimated_event);
        let summary = aggregator.finish(0).reduce();
        assert!(summary.tokens_estimated);
    }

    #[test]
    fn merging_two_shards_matches_running_both_in_one_aggregator() {
        let mut combined = Aggregator::new(Uuid::new_v4());
        let mut shard_a = Aggregator::new(Uuid::new_v4());
        let mut shard_b = Aggregator::new(Uuid::new_v4());
        for ms in [100, 200, 300] {
            combined.record(event("request", ms, true));
            shard_a.record(event("request", ms, true));
        }
        for ms in [150, 250] {
            combined.record(event("request", ms, true));
            shard_b.record(event("request", ms, true));
        }
        let merged = merge_shard_summaries(vec![shard_a.finish(0), shard_b.finish(0)]).unwrap();
        let single = combined.finish(0).reduce();
        assert_eq!(merged.total_requests, single.total_requests);
        assert_eq!(merged.total_requests, 5);
    }

    #[test]
    fn first_token_events_do_not_inflate_request_rate() {
        let mut aggregator = Aggregator::new(Uuid::new_v4());
        aggregator.record(event("first_token", 20, true));
        aggregator.record(event("completion", 100, true));
        assert_eq!(aggregator.overall.count, 1);
        assert_eq!(aggregator.window_count, 1);
        // Still tracked per-label for its own latency stats.
        assert_eq!(aggregator.labels["first_token"].count, 1);
        let summary = aggregator.finish(0).reduce();
        assert_eq!(summary.total_requests, 1);
    }

    #[test]
    fn merge_of_single_shard_is_identity() {
        let mut aggregator = Aggregator::new(Uuid::new_v4());
        aggregator.record(event("request", 100, true));
        let direct = aggregator.finish(0).reduce();
        let mut aggregator2 = Aggregator::new(direct.task_id);
        aggregator2.record(event("request", 100, true));
        let merged = merge_shard_summaries(vec![aggregator2.finish(0)]).unwrap();
        assert_eq!(merged.total_requests, direct.total_requests);
    }

    #[tokio::test]
    async fn run_emits_final_summary_when_channel_closes() {
        let (tx, rx) = mpsc::channel(8);
        let (row_tx, _row_rx) = mpsc::channel(8);
        let active_users = Arc::new(AtomicUsize::new(1));
        let dropped = Arc::new(AtomicU64::new(0));

        tx.send(event("request", 50, true)).await.unwrap();
        drop(tx);

        let summary = run(Uuid::new_v4(), rx, active_users, dropped, row_tx).await;
        assert_eq!(summary.reduce().total_requests, 1);
    }
}
