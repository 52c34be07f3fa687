use std::path::Path;
use std::time::Instant;

use psutil::cpu::CpuPercentCollector;
use psutil::network::NetIoCountersCollector;

use crate::hwstats::SystemSample;
use crate::sampler::SystemSampler;

pub struct HwSampler {
    cpu_percent_collector: CpuPercentCollector,
    net_io_counters_collector: NetIoCountersCollector,
}

impl HwSampler {
    pub fn init() -> Result<Self, psutil::Error> {
        Ok(Self {
            cpu_percent_collector: CpuPercentCollector::new()?,
            net_io_counters_collector: Default::default(),
        })
    }

    pub fn fetch_system_state(&mut self, disk_path: Option<&Path>) -> Result<SystemSample, psutil::Error> {
        let cpu_percent = self.cpu_percent_collector.cpu_percent()?;
        let memory_usage = psutil::memory::virtual_memory()?;
        let net_io_counters = self.net_io_counters_collector.net_io_counters()?;
        let disk_percent = disk_path.and_then(|path| match psutil::disk::disk_usage(path) {
            Ok(usage) => Some(usage.percent()),
            Err(error) => {
                log::warn!("Unable to read disk usage of {}: {error:?}", path.display());
                None
            }
        });
        Ok(SystemSample {
            cpu_percent,
            net_bytes: net_io_counters.bytes_recv() + net_io_counters.bytes_sent(),
            memory_total: memory_usage.total(),
            memory_available: memory_usage.available(),
            disk_percent,
            timestamp: Instant::now(),
        })
    }
}

impl SystemSampler for HwSampler {
    fn sample(&mut self, disk_path: Option<&Path>) -> crate::Result<SystemSample> {
        Ok(self.fetch_system_state(disk_path)?)
    }
}
