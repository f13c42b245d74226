//! Synthetic host metrics sourced from system introspection.

use std::time::{Duration, Instant};

use anyhow::Result;
use arrow::record_batch::RecordBatch;
use chrono::Utc;
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};

use crate::metrics_table::{MetricSample, MetricsRecordBuilder};

/// Samples CPU and memory usage of the local host.
///
/// `run_elapsed_ms` is measured from an instant captured when the sampler
/// is constructed, so values within one sampler are non-decreasing. Sampled
/// percentages are recorded as reported, without range validation.
pub struct HostSampler {
    system: System,
    what_to_refresh: RefreshKind,
    device: String,
    run_start: Instant,
}

impl HostSampler {
    pub fn new(device: &str) -> Self {
        let what_to_refresh = RefreshKind::nothing()
            .with_cpu(CpuRefreshKind::nothing().with_cpu_usage())
            .with_memory(MemoryRefreshKind::nothing().with_ram());
        Self {
            system: System::new_with_specifics(what_to_refresh),
            what_to_refresh,
            device: device.to_owned(),
            run_start: Instant::now(),
        }
    }

    /// Takes one observation of the host.
    pub fn sample(&mut self) -> MetricSample {
        self.system.refresh_specifics(self.what_to_refresh);
        let cpu_used = self.system.global_cpu_usage();
        let total_memory = self.system.total_memory();
        let memory_used = if total_memory == 0 {
            0.0
        } else {
            self.system.used_memory() as f32 / total_memory as f32 * 100.0
        };
        MetricSample {
            device: self.device.clone(),
            ts: Utc::now(),
            cpu_used,
            cpu_free: 100.0 - cpu_used,
            memory_used,
            memory_free: 100.0 - memory_used,
            run_elapsed_ms: elapsed_ms_saturating(self.run_start.elapsed()),
        }
    }

    /// Returns a columnar batch of exactly `n` samples.
    pub fn generate_batch(&mut self, n: usize) -> Result<RecordBatch> {
        let mut builder = MetricsRecordBuilder::with_capacity(n);
        for _ in 0..n {
            builder.append(&self.sample());
        }
        builder.finish()
    }
}

/// Milliseconds since run start, pinned to `i32::MAX` once the counter
/// outgrows the column type, keeping the sequence non-decreasing for
/// long-running producers.
fn elapsed_ms_saturating(elapsed: Duration) -> i32 {
    i32::try_from(elapsed.as_millis()).unwrap_or(i32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics_table::samples_from_batch;

    #[test]
    fn run_elapsed_saturates_instead_of_wrapping() {
        assert_eq!(elapsed_ms_saturating(Duration::from_millis(1234)), 1234);
        // more elapsed milliseconds than i32 can hold (~24.8 days)
        assert_eq!(
            elapsed_ms_saturating(Duration::from_secs(60 * 60 * 24 * 365)),
            i32::MAX
        );
    }

    #[test]
    fn generates_exactly_n_rows() {
        let mut sampler = HostSampler::new("testhost");
        let batch = sampler.generate_batch(10).unwrap();
        assert_eq!(batch.num_rows(), 10);
    }

    #[test]
    fn run_elapsed_is_non_decreasing_across_batches() {
        let mut sampler = HostSampler::new("testhost");
        let first = samples_from_batch(&sampler.generate_batch(5).unwrap()).unwrap();
        let second = samples_from_batch(&sampler.generate_batch(5).unwrap()).unwrap();
        let elapsed: Vec<i32> = first
            .iter()
            .chain(second.iter())
            .map(|s| s.run_elapsed_ms)
            .collect();
        assert!(elapsed.windows(2).all(|w| w[0] <= w[1]), "{elapsed:?}");
    }

    #[test]
    fn device_name_is_carried_through() {
        let mut sampler = HostSampler::new("node-7");
        let samples = samples_from_batch(&sampler.generate_batch(3).unwrap()).unwrap();
        assert!(samples.iter().all(|s| s.device == "node-7"));
    }
}
