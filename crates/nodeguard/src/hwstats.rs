use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Point-in-time reading for a whole process tree.
#[derive(Debug, Clone)]
pub struct ResourceSample {
    /// User + system CPU time summed over the tree.
    pub cpu_time: Duration,
    /// Bytes read + written by the tree.
    pub io_bytes: u64,
    /// Resident memory of the tree.
    pub mem_bytes: u64,
    /// Committed (virtual) memory of the tree.
    pub virt_bytes: u64,
    /// Received + sent bytes of the machine's network interfaces.
    pub net_bytes: u64,
    /// Number of processes that contributed to the sample.
    pub processes: usize,
    pub timestamp: Instant,
}

/// Whole-machine load, reported alongside the process figures.
#[derive(Debug, Clone)]
pub struct SystemSample {
    pub cpu_percent: f32,
    pub net_bytes: u64,
    pub memory_total: u64,
    pub memory_available: u64,
    /// Usage of the disk holding the task folder, if it could be read.
    pub disk_percent: Option<f32>,
    pub timestamp: Instant,
}

/// Aggregated resource usage of one watched process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub peak_mem_bytes: u64,
    pub peak_virt_bytes: u64,
    pub cpu_time_secs: f64,
    pub io_bytes: u64,
    pub net_bytes: u64,
    pub mean_system_cpu_percent: f32,
    pub peak_processes: usize,
    pub samples: u64,
    pub wall_time_secs: f64,
}

impl UsageSummary {
    pub fn add_sample(&mut self, sample: &ResourceSample, first: Option<&ResourceSample>) {
        self.peak_mem_bytes = self.peak_mem_bytes.max(sample.mem_bytes);
        self.peak_virt_bytes = self.peak_virt_bytes.max(sample.virt_bytes);
        self.peak_processes = self.peak_processes.max(sample.processes);
        self.cpu_time_secs = self.cpu_time_secs.max(sample.cpu_time.as_secs_f64());
        self.io_bytes = self.io_bytes.max(sample.io_bytes);
        if let Some(first) = first {
            self.net_bytes = sample.net_bytes.saturating_sub(first.net_bytes);
        }
        self.samples += 1;
    }

    pub fn add_system_sample(&mut self, sample: &SystemSample, count: u64) {
        // Running mean over `count` system samples
        let count = count.max(1) as f32;
        self.mean_system_cpu_percent += (sample.cpu_percent - self.mean_system_cpu_percent) / count;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(mem: u64, cpu_secs: u64, net: u64) -> ResourceSample {
        ResourceSample {
            cpu_time: Duration::from_secs(cpu_secs),
            io_bytes: 0,
            mem_bytes: mem,
            virt_bytes: mem * 2,
            net_bytes: net,
            processes: 1,
            timestamp: Instant::now(),
        }
    }

    #[test]
    fn test_usage_summary_peaks() {
        let mut usage = UsageSummary::default();
        let first = sample(100, 1, 1000);
        usage.add_sample(&first, None);
        usage.add_sample(&sample(300, 2, 1500), Some(&first));
        usage.add_sample(&sample(200, 3, 1800), Some(&first));
        assert_eq!(usage.peak_mem_bytes, 300);
        assert_eq!(usage.peak_virt_bytes, 600);
        assert_eq!(usage.cpu_time_secs, 3.0);
        assert_eq!(usage.net_bytes, 800);
        assert_eq!(usage.samples, 3);
    }

    #[test]
    fn test_mean_system_cpu() {
        let mut usage = UsageSummary::default();
        for (i, cpu) in [10.0, 20.0, 30.0].into_iter().enumerate() {
            let sample = SystemSample {
                cpu_percent: cpu,
                net_bytes: 0,
                memory_total: 0,
                memory_available: 0,
                disk_percent: None,
                timestamp: Instant::now(),
            };
            usage.add_system_sample(&sample, i as u64 + 1);
        }
        assert!((usage.mean_system_cpu_percent - 20.0).abs() < 1e-4);
    }
}
