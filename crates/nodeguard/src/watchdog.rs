//! Periodic supervision of a launched process tree.
//!
//! Every cycle the watchdog samples the tree, feeds the rates into the
//! [`ConfidenceFilter`] and checks the unconditional limits (fatal output, memory,
//! disk, wall time). The loop ends with a [`Verdict`]; stopping the process is left
//! to the caller.

use std::fmt::{Display, Formatter};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use humantime::format_duration;

use crate::Pid;
use crate::cancel::CancelToken;
use crate::common::utils::{format_bytes, try_sleep};
use crate::exitcode::codes::{
    ERR_CANCELED, ERR_DISK_FULL, ERR_FATAL_OUTPUT, ERR_MEMORY_LIMIT, ERR_TIMEOUT,
    ERR_VIRTUAL_MEMORY_LIMIT, WARN_DISK_SPACE,
};
use crate::filter::{Confidence, ConfidenceFilter, FilterConfig, IdleKind, Rates, WatchFlags};
use crate::hwstats::{ResourceSample, SystemSample, UsageSummary};
use crate::launcher::RunningProcess;
use crate::sampler::{ProcessTreeSampler, SystemSampler};

/// Lower bound of the cycle length and of the initial wait.
pub const MIN_CYCLE: Duration = Duration::from_millis(1200);
/// Watch time is never longer than this, whatever the configuration says.
pub const WATCH_TIME_CEILING: Duration = Duration::from_secs(72 * 3600);

const GIB: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Initializing,
    Running,
    IdleSuspected,
    TimedOut,
    ExitedClean,
    ExitedError,
}

/// Launched applications fall in two groups with different startup time and memory needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppProfile {
    Generic,
    /// The recording replay application: slow to start, memory hungry.
    Heavy,
}

#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    pub cycle: Duration,
    /// Grace period before the first sample.
    pub initial_wait: Duration,
    pub watch_time: Duration,
    pub watch: WatchFlags,
    pub filter: FilterConfig,
    /// Disk whose usage is checked every cycle.
    pub disk_path: Option<PathBuf>,
    pub disk_warn_percent: f32,
    pub disk_error_percent: f32,
    /// Resident memory ceiling of the whole tree, in bytes.
    pub memory_limit: Option<u64>,
    pub virtual_memory_limit: Option<u64>,
    /// Consecutive failed samples after which the process counts as gone.
    pub max_sampler_failures: u32,
    pub poll_step: Duration,
    /// The scheduler creates this file to cancel the task.
    pub cancel_file: Option<PathBuf>,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self::for_profile(AppProfile::Generic)
    }
}

impl WatchdogConfig {
    pub fn for_profile(profile: AppProfile) -> Self {
        let (initial_wait, memory_limit, virtual_memory_limit) = match profile {
            AppProfile::Generic => (Duration::from_secs(30), 16 * GIB, 64 * GIB),
            AppProfile::Heavy => (Duration::from_secs(120), 32 * GIB, 128 * GIB),
        };
        Self {
            cycle: Duration::from_secs(10),
            initial_wait,
            watch_time: Duration::from_secs(12 * 3600),
            watch: WatchFlags::default(),
            filter: FilterConfig::default(),
            disk_path: None,
            disk_warn_percent: 80.0,
            disk_error_percent: 90.0,
            memory_limit: Some(memory_limit),
            virtual_memory_limit: Some(virtual_memory_limit),
            max_sampler_failures: 3,
            poll_step: Duration::from_millis(200),
            cancel_file: None,
        }
    }

    /// Enforces the lower bounds of cycle and initial wait and the watch time ceiling.
    pub fn normalized(mut self) -> Self {
        if self.cycle < MIN_CYCLE {
            log::debug!("Cycle {:?} raised to {MIN_CYCLE:?}", self.cycle);
            self.cycle = MIN_CYCLE;
        }
        if self.initial_wait < MIN_CYCLE {
            self.initial_wait = MIN_CYCLE;
        }
        if self.watch_time.is_zero() || self.watch_time > WATCH_TIME_CEILING {
            log::debug!("Watch time {:?} capped to {WATCH_TIME_CEILING:?}", self.watch_time);
            self.watch_time = WATCH_TIME_CEILING;
        }
        self.max_sampler_failures = self.max_sampler_failures.max(1);
        if self.poll_step.is_zero() {
            self.poll_step = Duration::from_millis(200);
        }
        self
    }
}

/// A limit violation or notable finding, independent of the idle watches.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    FatalOutput(String),
    MemoryLimit { used: u64, limit: u64 },
    VirtualMemoryLimit { used: u64, limit: u64 },
    DiskFull(f32),
    DiskSpaceLow(f32),
}

impl Condition {
    pub fn exit_code_name(&self) -> &'static str {
        match self {
            Condition::FatalOutput(_) => ERR_FATAL_OUTPUT,
            Condition::MemoryLimit { .. } => ERR_MEMORY_LIMIT,
            Condition::VirtualMemoryLimit { .. } => ERR_VIRTUAL_MEMORY_LIMIT,
            Condition::DiskFull(_) => ERR_DISK_FULL,
            Condition::DiskSpaceLow(_) => WARN_DISK_SPACE,
        }
    }
}

impl Display for Condition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Condition::FatalOutput(line) => write!(f, "fatal output: {line}"),
            Condition::MemoryLimit { used, limit } => write!(
                f,
                "memory {} exceeds limit {}",
                format_bytes(*used),
                format_bytes(*limit)
            ),
            Condition::VirtualMemoryLimit { used, limit } => write!(
                f,
                "virtual memory {} exceeds limit {}",
                format_bytes(*used),
                format_bytes(*limit)
            ),
            Condition::DiskFull(percent) => write!(f, "disk {percent:.1}% full"),
            Condition::DiskSpaceLow(percent) => write!(f, "disk space low, {percent:.1}% used"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// The process exited (or can no longer be sampled).
    Exited,
    Idle(Vec<IdleKind>),
    TimedOut,
    Aborted(Condition),
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct WatchdogOutcome {
    pub state: WatchState,
    pub verdict: Verdict,
    /// Non fatal findings collected during the run.
    pub warnings: Vec<Condition>,
    pub usage: UsageSummary,
    pub cycles: u64,
    pub confidence: Confidence,
}

impl WatchdogOutcome {
    /// Whether the process still has to be brought down by the caller.
    pub fn needs_shutdown(&self) -> bool {
        self.verdict != Verdict::Exited
    }

    /// Exit codes to report for this outcome, with a human readable detail.
    pub fn exit_codes(&self) -> Vec<(&'static str, String)> {
        let mut codes: Vec<(&'static str, String)> = self
            .warnings
            .iter()
            .map(|warning| (warning.exit_code_name(), warning.to_string()))
            .collect();
        match &self.verdict {
            Verdict::Exited => {}
            Verdict::Idle(kinds) => codes.extend(kinds.iter().map(|kind| {
                (
                    kind.exit_code_name(),
                    format!("{kind} idle after {} cycles", self.cycles),
                )
            })),
            Verdict::TimedOut => codes.push((ERR_TIMEOUT, "watch time exceeded".to_string())),
            Verdict::Aborted(condition) => {
                codes.push((condition.exit_code_name(), condition.to_string()))
            }
            Verdict::Cancelled => codes.push((ERR_CANCELED, "cancellation requested".to_string())),
        }
        codes
    }
}

/// Everything the watchdog learns about the process in one cycle.
#[derive(Debug, Clone)]
pub struct Observation {
    /// Time since the process was started.
    pub elapsed: Duration,
    pub running: bool,
    /// `Some` once the process has exited.
    pub exit_success: Option<bool>,
    /// `None` when sampling failed.
    pub sample: Option<ResourceSample>,
    pub system: Option<SystemSample>,
    pub new_lines: u64,
    pub fatal: Option<String>,
    pub cancel_requested: bool,
}

/// What the watchdog needs from the supervised process.
pub trait Watched {
    fn pid(&self) -> Pid;
    fn is_running(&mut self) -> bool;
    fn exit_success(&mut self) -> Option<bool>;
    fn output_lines(&self) -> u64;
    fn fatal_message(&self) -> Option<String>;
}

impl Watched for RunningProcess {
    fn pid(&self) -> Pid {
        RunningProcess::pid(self)
    }

    fn is_running(&mut self) -> bool {
        self.running()
    }

    fn exit_success(&mut self) -> Option<bool> {
        self.exit_status().map(|status| status.success())
    }

    fn output_lines(&self) -> u64 {
        RunningProcess::output_lines(self)
    }

    fn fatal_message(&self) -> Option<String> {
        RunningProcess::fatal_message(self)
    }
}

pub struct Watchdog {
    config: WatchdogConfig,
    tree_sampler: Box<dyn ProcessTreeSampler>,
    system_sampler: Option<Box<dyn SystemSampler>>,
    filter: ConfidenceFilter,
    state: WatchState,
    previous: Option<ResourceSample>,
    first: Option<ResourceSample>,
    sampler_failures: u32,
    system_samples: u64,
    disk_warned: bool,
    warnings: Vec<Condition>,
    usage: UsageSummary,
    cycles: u64,
    resource_log: Option<BufWriter<File>>,
}

impl Watchdog {
    pub fn new(
        config: WatchdogConfig,
        tree_sampler: Box<dyn ProcessTreeSampler>,
        system_sampler: Option<Box<dyn SystemSampler>>,
    ) -> Self {
        let config = config.normalized();
        Self {
            filter: ConfidenceFilter::new(config.filter.clone()),
            config,
            tree_sampler,
            system_sampler,
            state: WatchState::Initializing,
            previous: None,
            first: None,
            sampler_failures: 0,
            system_samples: 0,
            disk_warned: false,
            warnings: Vec::new(),
            usage: UsageSummary::default(),
            cycles: 0,
            resource_log: None,
        }
    }

    /// Writes one line per cycle with the measured rates and confidences into `path`.
    pub fn with_resource_log(mut self, path: &Path) -> crate::Result<Self> {
        let mut writer = BufWriter::new(File::create(path)?);
        writeln!(
            writer,
            "timestamp,elapsed_s,cpu_percent,io_bytes_per_s,rss_bytes,vms_bytes,system_cpu_percent,net_bytes_per_s,conf_cpu,conf_io,conf_print"
        )?;
        self.resource_log = Some(writer);
        Ok(self)
    }

    pub fn config(&self) -> &WatchdogConfig {
        &self.config
    }

    pub fn state(&self) -> WatchState {
        self.state
    }

    pub fn confidence(&self) -> Confidence {
        self.filter.confidence()
    }

    fn set_state(&mut self, state: WatchState) {
        if self.state != state {
            log::info!("Watchdog: {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    /// Records the baseline sample taken at the end of the initial wait.
    pub fn begin(&mut self, baseline: Option<ResourceSample>) {
        if let Some(sample) = &baseline {
            self.usage.add_sample(sample, None);
            self.first = Some(sample.clone());
        }
        self.previous = baseline;
        self.set_state(WatchState::Running);
    }

    /// Evaluates one cycle. Returns the verdict once the loop has to end.
    pub fn step(&mut self, observation: Observation) -> Option<Verdict> {
        self.cycles += 1;
        self.usage.wall_time_secs = observation.elapsed.as_secs_f64();

        if observation.cancel_requested {
            return Some(Verdict::Cancelled);
        }
        if let Some(line) = observation.fatal {
            return Some(self.abort(Condition::FatalOutput(line)));
        }
        if !observation.running {
            return Some(self.exited(observation.exit_success));
        }

        let mut rates = None;
        match observation.sample {
            Some(sample) => {
                self.sampler_failures = 0;
                self.usage.add_sample(&sample, self.first.as_ref());
                if let Some(condition) = self.check_memory(&sample) {
                    return Some(self.abort(condition));
                }
                if let Some(previous) = &self.previous {
                    rates = Some(Rates::between(previous, &sample, observation.new_lines));
                }
                if self.first.is_none() {
                    self.first = Some(sample.clone());
                }
                self.previous = Some(sample);
            }
            None => {
                self.sampler_failures += 1;
                log::debug!(
                    "Sampling failed ({}/{})",
                    self.sampler_failures,
                    self.config.max_sampler_failures
                );
                if self.sampler_failures >= self.config.max_sampler_failures {
                    log::info!("Process tree can no longer be sampled, treating it as exited");
                    return Some(self.exited(observation.exit_success));
                }
            }
        }

        if let Some(system) = &observation.system {
            self.system_samples += 1;
            self.usage.add_system_sample(system, self.system_samples);
            if let Some(condition) = self.check_disk(system) {
                return Some(self.abort(condition));
            }
        }

        if observation.elapsed > self.config.watch_time {
            log::warn!(
                "Watch time {} exceeded",
                format_duration(self.config.watch_time)
            );
            self.set_state(WatchState::TimedOut);
            return Some(Verdict::TimedOut);
        }

        let Some(rates) = rates else {
            return None;
        };
        let confidence = self.filter.update(&rates);
        log::debug!(
            "Cycle {}: cpu {:.1}% io {:.0} B/s lines {} | confidence cpu {:.2} io {:.2} print {:.2}",
            self.cycles,
            rates.cpu_load,
            rates.io_bytes_per_sec,
            rates.new_lines,
            confidence.cpu,
            confidence.io,
            confidence.print
        );
        self.write_resource_line(observation.elapsed, &rates, observation.system.as_ref());

        let idle = self.filter.idle(&self.config.watch);
        if !idle.is_empty() {
            let kinds = idle
                .iter()
                .map(|kind| kind.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            log::warn!("Process looks idle: {kinds}");
            self.set_state(WatchState::IdleSuspected);
            return Some(Verdict::Idle(idle));
        }
        None
    }

    fn exited(&mut self, success: Option<bool>) -> Verdict {
        self.set_state(if success == Some(false) {
            WatchState::ExitedError
        } else {
            WatchState::ExitedClean
        });
        Verdict::Exited
    }

    fn abort(&mut self, condition: Condition) -> Verdict {
        log::warn!("Aborting watch: {condition}");
        self.set_state(WatchState::ExitedError);
        Verdict::Aborted(condition)
    }

    fn check_memory(&self, sample: &ResourceSample) -> Option<Condition> {
        if let Some(limit) = self.config.memory_limit {
            if sample.mem_bytes > limit {
                return Some(Condition::MemoryLimit {
                    used: sample.mem_bytes,
                    limit,
                });
            }
        }
        if let Some(limit) = self.config.virtual_memory_limit {
            if sample.virt_bytes > limit {
                return Some(Condition::VirtualMemoryLimit {
                    used: sample.virt_bytes,
                    limit,
                });
            }
        }
        None
    }

    fn check_disk(&mut self, system: &SystemSample) -> Option<Condition> {
        let percent = system.disk_percent?;
        if percent >= self.config.disk_error_percent {
            return Some(Condition::DiskFull(percent));
        }
        if percent >= self.config.disk_warn_percent && !self.disk_warned {
            self.disk_warned = true;
            let condition = Condition::DiskSpaceLow(percent);
            log::warn!("{condition}");
            self.warnings.push(condition);
        }
        None
    }

    fn write_resource_line(&mut self, elapsed: Duration, rates: &Rates, system: Option<&SystemSample>) {
        let Some(writer) = self.resource_log.as_mut() else {
            return;
        };
        let (rss, vms) = self
            .previous
            .as_ref()
            .map(|s| (s.mem_bytes, s.virt_bytes))
            .unwrap_or_default();
        let confidence = self.filter.confidence();
        let result = writeln!(
            writer,
            "{},{:.1},{:.2},{:.0},{},{},{},{:.0},{:.3},{:.3},{:.3}",
            chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
            elapsed.as_secs_f64(),
            rates.cpu_load,
            rates.io_bytes_per_sec,
            rss,
            vms,
            system
                .map(|s| format!("{:.1}", s.cpu_percent))
                .unwrap_or_default(),
            rates.net_bytes_per_sec,
            confidence.cpu,
            confidence.io,
            confidence.print
        )
        .and_then(|_| writer.flush());
        if let Err(error) = result {
            log::warn!("Cannot write resource log: {error}");
            self.resource_log = None;
        }
    }

    fn sample_tree(&mut self, pid: Pid) -> Option<ResourceSample> {
        match self.tree_sampler.sample(pid) {
            Ok(sample) => Some(sample),
            Err(error) => {
                log::debug!("Cannot sample process tree of {pid}: {error}");
                None
            }
        }
    }

    fn sample_system(&mut self) -> Option<SystemSample> {
        let sampler = self.system_sampler.as_mut()?;
        match sampler.sample(self.config.disk_path.as_deref()) {
            Ok(sample) => Some(sample),
            Err(error) => {
                log::debug!("Cannot sample system: {error}");
                None
            }
        }
    }

    fn observe(
        &mut self,
        target: &mut dyn Watched,
        started: Instant,
        cancel: &CancelToken,
        lines_seen: &mut u64,
    ) -> Observation {
        let cancel_requested = cancel.observe(self.config.cancel_file.as_deref());
        let running = target.is_running();
        let sample = if running {
            self.sample_tree(target.pid())
        } else {
            None
        };
        let system = if running { self.sample_system() } else { None };
        let lines = target.output_lines();
        let new_lines = lines.saturating_sub(*lines_seen);
        *lines_seen = lines;
        Observation {
            elapsed: started.elapsed(),
            running,
            exit_success: target.exit_success(),
            sample,
            system,
            new_lines,
            fatal: target.fatal_message(),
            cancel_requested,
        }
    }

    /// Supervises `target` until it exits or a verdict demands that it is stopped.
    pub fn run(mut self, target: &mut dyn Watched, cancel: &CancelToken) -> WatchdogOutcome {
        let started = Instant::now();
        let poll = self.config.poll_step;
        let cancel_file = self.config.cancel_file.clone();
        log::info!(
            "Watching process {} (initial wait {}, cycle {}, watch time {})",
            target.pid(),
            format_duration(self.config.initial_wait),
            format_duration(self.config.cycle),
            format_duration(self.config.watch_time)
        );
        self.set_state(WatchState::Initializing);
        try_sleep(self.config.initial_wait, poll, || {
            !target.is_running() || cancel.observe(cancel_file.as_deref())
        });

        let mut lines_seen = target.output_lines();
        let baseline = if target.is_running() {
            self.sample_tree(target.pid())
        } else {
            None
        };
        self.begin(baseline);

        let verdict = loop {
            let cycle_start = Instant::now();
            let observation = self.observe(target, started, cancel, &mut lines_seen);
            if let Some(verdict) = self.step(observation) {
                break verdict;
            }
            let remaining = self.config.cycle.saturating_sub(cycle_start.elapsed());
            try_sleep(remaining, poll, || {
                !target.is_running() || cancel.observe(cancel_file.as_deref())
            });
        };
        log::info!(
            "Watchdog finished after {} cycles: {verdict:?} ({:?})",
            self.cycles,
            self.state
        );
        WatchdogOutcome {
            state: self.state,
            verdict,
            warnings: std::mem::take(&mut self.warnings),
            usage: self.usage.clone(),
            cycles: self.cycles,
            confidence: self.filter.confidence(),
        }
    }
}
