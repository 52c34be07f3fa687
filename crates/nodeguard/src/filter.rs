//! Exponential smoothing of raw activity readings into per-resource confidence scores.
//!
//! A score is an activity level in `[0, 100]`. When it falls below the threshold of its
//! resource, the resource is considered idle. The smoothing keeps a single quiet
//! sample (a disk seek, a pause between two files) from killing a healthy task.

use std::fmt::{Display, Formatter};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::exitcode::codes::{ERR_CPU_IDLE, ERR_IO_IDLE, ERR_PRINT_IDLE};
use crate::hwstats::ResourceSample;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IdleKind {
    Cpu,
    Io,
    Print,
}

impl IdleKind {
    pub fn exit_code_name(&self) -> &'static str {
        match self {
            IdleKind::Cpu => ERR_CPU_IDLE,
            IdleKind::Io => ERR_IO_IDLE,
            IdleKind::Print => ERR_PRINT_IDLE,
        }
    }
}

impl Display for IdleKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            IdleKind::Cpu => "CPU",
            IdleKind::Io => "I/O",
            IdleKind::Print => "print",
        })
    }
}

/// Which resources take part in the idle decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchFlags {
    pub cpu: bool,
    pub io: bool,
    pub print: bool,
}

impl Default for WatchFlags {
    fn default() -> Self {
        Self {
            cpu: true,
            io: true,
            print: false,
        }
    }
}

impl WatchFlags {
    pub fn none() -> Self {
        Self {
            cpu: false,
            io: false,
            print: false,
        }
    }

    pub fn any(&self) -> bool {
        self.cpu || self.io || self.print
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EmaSettings {
    /// Weight of the newest reading.
    pub alpha: f64,
    /// Scores below this value mean idle.
    pub threshold: f64,
    /// Score before the first reading.
    pub initial: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub cpu: EmaSettings,
    pub io: EmaSettings,
    pub print: EmaSettings,
    /// I/O rates below this floor count as no I/O at all.
    pub io_floor_bytes_per_sec: f64,
    /// Score contributed by one new output line.
    pub print_line_weight: f64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            cpu: EmaSettings {
                alpha: 0.3,
                threshold: 2.1,
                initial: 5.0,
            },
            io: EmaSettings {
                alpha: 0.11,
                threshold: 5.0,
                initial: 6.5,
            },
            print: EmaSettings {
                alpha: 0.05,
                threshold: 3.0,
                initial: 5.0,
            },
            io_floor_bytes_per_sec: 6.0 * 1024.0,
            print_line_weight: 10.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Ema {
    value: f64,
    alpha: f64,
}

impl Ema {
    pub fn new(initial: f64, alpha: f64) -> Self {
        Self {
            value: initial.clamp(0.0, 100.0),
            alpha: alpha.clamp(0.0, 1.0),
        }
    }

    pub fn update(&mut self, sample: f64) -> f64 {
        let sample = sample.clamp(0.0, 100.0);
        self.value = self.value * (1.0 - self.alpha) + sample * self.alpha;
        self.value
    }

    pub fn value(&self) -> f64 {
        self.value
    }
}

/// Activity rates derived from two consecutive samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rates {
    /// Percentage of one core.
    pub cpu_load: f64,
    pub io_bytes_per_sec: f64,
    pub net_bytes_per_sec: f64,
    /// Output lines printed since the previous sample.
    pub new_lines: u64,
}

const MIN_RATE_INTERVAL: Duration = Duration::from_millis(1);

impl Rates {
    pub fn between(previous: &ResourceSample, current: &ResourceSample, new_lines: u64) -> Self {
        let elapsed = current
            .timestamp
            .saturating_duration_since(previous.timestamp)
            .max(MIN_RATE_INTERVAL)
            .as_secs_f64();
        let cpu = current.cpu_time.saturating_sub(previous.cpu_time).as_secs_f64();
        // Counters of a process that left the tree can make the sum shrink
        let io = current.io_bytes.saturating_sub(previous.io_bytes) as f64;
        let net = current.net_bytes.saturating_sub(previous.net_bytes) as f64;
        Self {
            cpu_load: cpu / elapsed * 100.0,
            io_bytes_per_sec: io / elapsed,
            net_bytes_per_sec: net / elapsed,
            new_lines,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Confidence {
    pub cpu: f64,
    pub io: f64,
    pub print: f64,
}

pub struct ConfidenceFilter {
    config: FilterConfig,
    cpu: Ema,
    io: Ema,
    print: Ema,
}

impl ConfidenceFilter {
    pub fn new(config: FilterConfig) -> Self {
        Self {
            cpu: Ema::new(config.cpu.initial, config.cpu.alpha),
            io: Ema::new(config.io.initial, config.io.alpha),
            print: Ema::new(config.print.initial, config.print.alpha),
            config,
        }
    }

    pub fn update(&mut self, rates: &Rates) -> Confidence {
        self.cpu.update(rates.cpu_load);
        let io_activity = if rates.io_bytes_per_sec >= self.config.io_floor_bytes_per_sec {
            100.0
        } else {
            0.0
        };
        self.io.update(io_activity);
        self.print
            .update(rates.new_lines as f64 * self.config.print_line_weight);
        self.confidence()
    }

    pub fn confidence(&self) -> Confidence {
        Confidence {
            cpu: self.cpu.value(),
            io: self.io.value(),
            print: self.print.value(),
        }
    }

    /// Enabled resources whose score is below their threshold.
    pub fn idle(&self, watch: &WatchFlags) -> Vec<IdleKind> {
        let mut idle = Vec::new();
        if watch.cpu && self.cpu.value() < self.config.cpu.threshold {
            idle.push(IdleKind::Cpu);
        }
        if watch.io && self.io.value() < self.config.io.threshold {
            idle.push(IdleKind::Io);
        }
        if watch.print && self.print.value() < self.config.print.threshold {
            idle.push(IdleKind::Print);
        }
        idle
    }
}
