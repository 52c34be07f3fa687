use std::time::{Duration, Instant};

use psutil::network::NetIoCountersCollector;
use psutil::process::Process;

use crate::Pid;
use crate::common::error::GuardError;
use crate::hwstats::ResourceSample;
use crate::sampler::{ProcessTreeSampler, pid_running, task_processes};

/// Process tree sampler built on `psutil`.
///
/// CPU and memory come from `psutil`. CPU time includes the time of workers that already
/// exited and were waited for, so a pipeline of short-lived workers stays busy. I/O is read from the per-process accounting of
/// the kernel (`rchar` + `wchar`, i.e. bytes passed through read/write syscalls), which
/// is an estimate that also counts cached and pipe traffic.
pub struct PsutilTreeSampler {
    net_io_counters_collector: NetIoCountersCollector,
}

impl PsutilTreeSampler {
    pub fn new() -> Self {
        Self {
            net_io_counters_collector: Default::default(),
        }
    }

    fn net_bytes(&mut self) -> u64 {
        match self.net_io_counters_collector.net_io_counters() {
            Ok(counters) => counters.bytes_recv() + counters.bytes_sent(),
            Err(error) => {
                log::debug!("Cannot read network counters: {error:?}");
                0
            }
        }
    }
}

impl Default for PsutilTreeSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTreeSampler for PsutilTreeSampler {
    fn sample(&mut self, root: Pid) -> crate::Result<ResourceSample> {
        let mut pids = task_processes(root)?;
        if !pid_running(root) {
            // Workers of an exited root keep the task alive through its process group
            pids.retain(|pid| *pid != root);
            if pids.is_empty() {
                return Err(GuardError::ProcessUnavailable(root));
            }
        }

        let mut cpu_time = Duration::ZERO;
        let mut io_bytes = 0;
        let mut mem_bytes = 0;
        let mut virt_bytes = 0;
        let mut processes = 0;
        for pid in pids {
            let process = match Process::new(pid) {
                Ok(process) => process,
                Err(_) => {
                    log::trace!("Process {pid} vanished during sampling");
                    continue;
                }
            };
            processes += 1;
            if let Ok(times) = process.cpu_times() {
                // Reaped workers leave their time in the counters of the parent
                cpu_time += times.user()
                    + times.system()
                    + times.children_user()
                    + times.children_system();
            }
            if let Ok(memory) = process.memory_info() {
                mem_bytes += memory.rss();
                virt_bytes += memory.vms();
            }
            io_bytes += read_io_bytes(pid);
        }

        Ok(ResourceSample {
            cpu_time,
            io_bytes,
            mem_bytes,
            virt_bytes,
            net_bytes: self.net_bytes(),
            processes,
            timestamp: Instant::now(),
        })
    }
}

#[cfg(target_os = "linux")]
fn read_io_bytes(pid: Pid) -> u64 {
    match std::fs::read_to_string(format!("/proc/{pid}/io")) {
        Ok(content) => parse_proc_io(&content),
        Err(_) => 0,
    }
}

#[cfg(not(target_os = "linux"))]
fn read_io_bytes(_pid: Pid) -> u64 {
    0
}

/// Sums `rchar` and `wchar` from the content of `/proc/<pid>/io`.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_proc_io(content: &str) -> u64 {
    content
        .lines()
        .filter_map(|line| line.split_once(':'))
        .filter(|(key, _)| matches!(key.trim(), "rchar" | "wchar"))
        .filter_map(|(_, value)| value.trim().parse::<u64>().ok())
        .sum()
}
