use std::collections::VecDeque;
use std::path::Path;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use crate::Pid;
use crate::common::error::GuardError;
use crate::hwstats::{ResourceSample, SystemSample};
use crate::sampler::{ProcessTreeSampler, SystemSampler};
use crate::watchdog::{Observation, Watched};

pub const CYCLE: Duration = Duration::from_secs(10);

fn base() -> Instant {
    static BASE: OnceLock<Instant> = OnceLock::new();
    *BASE.get_or_init(Instant::now)
}

/// Sample of a process using a full core and writing 1 MiB/s.
pub fn busy_sample(cycle: u64) -> ResourceSample {
    ResourceSample {
        cpu_time: CYCLE * cycle as u32,
        io_bytes: cycle * CYCLE.as_secs() * 1024 * 1024,
        mem_bytes: 100 * 1024 * 1024,
        virt_bytes: 200 * 1024 * 1024,
        net_bytes: 0,
        processes: 2,
        timestamp: base() + CYCLE * cycle as u32,
    }
}

/// Sample of a process doing nothing at all.
pub fn quiet_sample(cycle: u64) -> ResourceSample {
    ResourceSample {
        cpu_time: Duration::from_millis(50),
        io_bytes: 4096,
        mem_bytes: 10 * 1024 * 1024,
        virt_bytes: 20 * 1024 * 1024,
        net_bytes: 0,
        processes: 1,
        timestamp: base() + CYCLE * cycle as u32,
    }
}

pub fn system_sample(disk_percent: Option<f32>) -> SystemSample {
    SystemSample {
        cpu_percent: 12.5,
        net_bytes: 0,
        memory_total: 64 * 1024 * 1024 * 1024,
        memory_available: 32 * 1024 * 1024 * 1024,
        disk_percent,
        timestamp: Instant::now(),
    }
}

pub fn observation(cycle: u64, sample: Option<ResourceSample>) -> Observation {
    Observation {
        elapsed: CYCLE * cycle as u32,
        running: true,
        exit_success: None,
        sample,
        system: None,
        new_lines: 0,
        fatal: None,
        cancel_requested: false,
    }
}

/// Returns queued samples, then reports the process as gone.
#[derive(Default)]
pub struct FixedSampler {
    pub samples: VecDeque<ResourceSample>,
}

impl ProcessTreeSampler for FixedSampler {
    fn sample(&mut self, root: Pid) -> crate::Result<ResourceSample> {
        self.samples
            .pop_front()
            .ok_or(GuardError::ProcessUnavailable(root))
    }
}

/// Reports the same disk usage forever.
pub struct FixedSystemSampler(pub Option<f32>);

impl SystemSampler for FixedSystemSampler {
    fn sample(&mut self, _disk_path: Option<&Path>) -> crate::Result<SystemSample> {
        Ok(system_sample(self.0))
    }
}

/// Process stand-in that stays alive until `lifetime` polls have been made.
pub struct FakeTarget {
    pub polls: u32,
    pub lifetime: Option<u32>,
    pub success: bool,
    pub lines: u64,
    pub fatal: Option<String>,
}

impl FakeTarget {
    pub fn forever() -> Self {
        Self {
            polls: 0,
            lifetime: None,
            success: true,
            lines: 0,
            fatal: None,
        }
    }
}

impl Watched for FakeTarget {
    fn pid(&self) -> Pid {
        4242
    }

    fn is_running(&mut self) -> bool {
        self.polls += 1;
        self.lifetime.is_none_or(|lifetime| self.polls < lifetime)
    }

    fn exit_success(&mut self) -> Option<bool> {
        match self.lifetime {
            Some(lifetime) if self.polls >= lifetime => Some(self.success),
            _ => None,
        }
    }

    fn output_lines(&self) -> u64 {
        self.lines
    }

    fn fatal_message(&self) -> Option<String> {
        self.fatal.clone()
    }
}

pub fn sh(script: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), script.to_string()]
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
