//! Latency statistics tracking for the exercise harness.
//!
//! Collects per-operation service times and reports min, max, average,
//! and a coarse histogram, so queue-depth and flow-control settings can
//! be compared across runs.

/// Tracks latency statistics with minimal overhead.
///
/// Accumulates measurements using simple arithmetic so the tracking
/// itself stays out of the measured path. Histogram buckets are sized at
/// 10 microsecond intervals with the last bucket open-ended.
pub struct LatencyStats {
    pub min: u64,
    pub max: u64,
    pub sum: u64,
    pub count: u64,
    pub buckets: [u64; 20],
}

impl LatencyStats {
    /// Creates an empty tracker. Min starts at `u64::MAX` so the first
    /// measurement becomes the minimum.
    pub fn new() -> Self {
        Self {
            min: u64::MAX,
            max: 0,
            sum: 0,
            count: 0,
            buckets: [0; 20],
        }
    }

    /// Records one latency measurement in nanoseconds.
    pub fn update(&mut self, nanos: u64) {
        if nanos < self.min {
            self.min = nanos;
        }
        if nanos > self.max {
            self.max = nanos;
        }
        self.sum += nanos;
        self.count += 1;

        let idx = (nanos / 10_000).min(19) as usize;
        self.buckets[idx] += 1;
    }

    /// Folds another tracker into this one, used to aggregate per-worker
    /// statistics after a parallel run.
    pub fn merge(&mut self, other: &LatencyStats) {
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.sum += other.sum;
        self.count += other.count;
        for (mine, theirs) in self.buckets.iter_mut().zip(other.buckets.iter()) {
            *mine += theirs;
        }
    }

    /// Average latency in nanoseconds, zero when nothing was recorded.
    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum as f64 / self.count as f64
        }
    }

    /// Prints a formatted latency report with automatic unit selection
    /// and the bucket distribution.
    pub fn print_report(&self) {
        println!("\nLatency Metrics (Service Time)");
        println!("Count: {}", self.count);

        let avg_ns = self.avg();
        if avg_ns < 1000.0 {
            println!("Min:   {:.2} ns", self.min as f64);
            println!("Avg:   {:.2} ns", avg_ns);
            println!("Max:   {:.2} ns", self.max as f64);
        } else {
            println!("Min:   {:.2} us", self.min as f64 / 1000.0);
            println!("Avg:   {:.2} us", avg_ns / 1000.0);
            println!("Max:   {:.2} us", self.max as f64 / 1000.0);
        }

        println!("Distribution (10us buckets):");
        for i in 0..20 {
            let count = self.buckets[i];
            if count > 0 {
                let range_end = if i == 19 { ">" } else { "" };
                println!("[{:3}-{:3}{} us]: {}", i * 10, (i + 1) * 10, range_end, count);
            }
        }
    }
}
