//! A compact, mergeable approximate-quantile sketch. Response times across a
//! whole run, or even just one label within it, can run into the millions
//! of samples; keeping every raw value (as a sort-on-demand `Vec<u64>`
//! would) is unbounded memory and doesn't merge cheaply across shards. This
//! buckets by a fixed log scale instead, so memory is constant regardless of
//! sample count and two shards' histograms merge in O(buckets).

const BUCKET_COUNT: usize = 512;
const MIN_MS: f64 = 1.0;
const MAX_MS: f64 = 600_000.0; // 10 minutes

/// Exponential-bucket histogram of millisecond latencies.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Histogram {
    counts: Vec<u64>,
    growth: f64,
    total: u64,
    under_min: u64,
    over_max: u64,
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

impl Histogram {
    pub fn new() -> Self {
        let growth = (MAX_MS / MIN_MS).powf(1.0 / BUCKET_COUNT as f64);
        Self {
            counts: vec![0; BUCKET_COUNT],
            growth,
            total: 0,
            under_min: 0,
            over_max: 0,
        }
    }

    fn bucket_for(&self, ms: f64) -> Option<usize> {
        if ms < MIN_MS {
            return None;
        }
        if ms >= MAX_MS {
            return None;
        }
        let idx = ((ms / MIN_MS).ln() / self.growth.ln()) as usize;
        Some(idx.min(BUCKET_COUNT - 1))
    }

    fn bucket_lower_bound(&self, idx: usize) -> u64 {
        (MIN_MS * self.growth.powi(idx as i32)).round() as u64
    }

    pub fn record(&mut self, ms: u64) {
        self.total += 1;
        match self.bucket_for(ms as f64) {
            Some(idx) => self.counts[idx] += 1,
            None if (ms as f64) < MIN_MS => self.under_min += 1,
            None => self.over_max += 1,
        }
    }

    pub fn merge(&mut self, other: &Histogram) {
        for (a, b) in self.counts.iter_mut().zip(other.counts.iter()) {
            *a += b;
        }
        self.total += other.total;
        self.under_min += other.under_min;
        self.over_max += other.over_max;
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Returns the approximate value at percentile `p` (0.0..=100.0) in
    /// milliseconds, or 0 if no samples were recorded.
    pub fn percentile(&self, p: f64) -> u64 {
        if self.total == 0 {
            return 0;
        }
        let target = ((p / 100.0) * self.total as f64).ceil() as u64;
        let mut cumulative = self.under_min;
        if cumulative >= target {
            return MIN_MS as u64;
        }
        for (idx, &count) in self.counts.iter().enumerate() {
            cumulative += count;
            if cumulative >= target {
                return self.bucket_lower_bound(idx);
            }
        }
        MAX_MS as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_histogram_percentile_is_zero() {
        let h = Histogram::new();
        assert_eq!(h.percentile(50.0), 0);
    }

    #[test]
    fn single_value_percentiles_approximate_it() {
        let mut h = Histogram::new();
        h.record(100);
        let p50 = h.percentile(50.0);
        assert!(p50 >= 95 && p50 <= 105, "p50 was {p50}");
    }

    #[test]
    fn percentiles_are_monotonic() {
        let mut h = Histogram::new();
        for ms in [10, 20, 30, 40, 50, 100, 200, 500, 1000, 5000] {
            h.record(ms);
        }
        let p50 = h.percentile(50.0);
        let p95 = h.percentile(95.0);
        let p99 = h.percentile(99.0);
        assert!(p50 <= p95);
        assert!(p95 <= p99);
    }

    #[test]
    fn merge_combines_counts() {
        let mut a = Histogram::new();
        let mut b = Histogram::new();
        for _ in 0..100 {
            a.record(50);
        }
        for _ in 0..100 {
            b.record(50);
        }
        a.merge(&b);
        assert_eq!(a.total(), 200);
        let p50 = a.percentile(50.0);
        assert!(p50 >= 45 && p50 <= 55);
    }

    #[test]
    fn merge_is_equivalent_to_recording_into_one() {
        let mut combined = Histogram::new();
        let mut a = Histogram::new();
        let mut b = Histogram::new();
        for ms in [10, 20, 30, 40, 50] {
            combined.record(ms);
            a.record(ms);
        }
        for ms in [60, 70, 80, 90, 100] {
            combined.record(ms);
            b.record(ms);
        }
        a.merge(&b);
        assert_eq!(a.total(), combined.total());
        assert_eq!(a.percentile(90.0), combined.percentile(90.0));
    }

    #[test]
    fn values_below_min_are_tracked_not_dropped() {
        let mut h = Histogram::new();
        h.record(0);
        assert_eq!(h.total(), 1);
        assert_eq!(h.under_min, 1);
    }

    #[test]
    fn values_above_max_are_tracked_not_dropped() {
        let mut h = Histogram::new();
        h.record(10_000_000);
        assert_eq!(h.total(), 1);
        assert_eq!(h.over_max, 1);
    }
}
