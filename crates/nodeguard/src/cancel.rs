//! Cancellation requests and the escalating shutdown of a process tree.
//!
//! Every trigger (OS signal, watchdog verdict, scheduler cancel flag) only flips a
//! [`CancelToken`]. The thread that owns the launched process observes the token and
//! runs the single [`Canceller`] sequence: interrupt, terminate the tree, kill.

use std::fmt::{Display, Formatter};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::Pid;
use crate::common::utils::try_sleep;
use crate::exitcode::codes::ERR_FORCED_TERMINATION;

pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(120);
const DEFAULT_POLL_STEP: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelSource {
    /// OS signal delivered to the runner itself.
    Signal(i32),
    /// The scheduler's cancel marker was observed.
    Scheduler,
    Watchdog,
    Error,
}

impl Display for CancelSource {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelSource::Signal(signal) => write!(f, "signal {signal}"),
            CancelSource::Scheduler => f.write_str("scheduler"),
            CancelSource::Watchdog => f.write_str("watchdog"),
            CancelSource::Error => f.write_str("error"),
        }
    }
}

#[derive(Default)]
struct TokenInner {
    requested: AtomicBool,
    requests: AtomicU32,
    source: Mutex<Option<CancelSource>>,
}

/// Shared "cancellation requested" flag.
///
/// Cloning the token shares the flag. Only the first request records its source,
/// later ones just bump the repeat counter.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if this was the first request.
    pub fn request(&self, source: CancelSource) -> bool {
        let count = self.inner.requests.fetch_add(1, Ordering::SeqCst) + 1;
        let first = !self.inner.requested.swap(true, Ordering::SeqCst);
        if first {
            if let Ok(mut guard) = self.inner.source.lock() {
                *guard = Some(source);
            }
            log::info!("Cancellation requested by {source}");
        } else {
            log::debug!("Repeated cancellation request #{count} from {source} ignored");
        }
        first
    }

    /// Checks the flag and the scheduler's cancel marker. A marker that appeared is
    /// turned into a request.
    pub fn observe(&self, marker: Option<&Path>) -> bool {
        if self.is_requested() {
            return true;
        }
        match marker {
            Some(path) if path.exists() => {
                log::info!("Cancel marker {} found", path.display());
                self.request(CancelSource::Scheduler);
                true
            }
            _ => false,
        }
    }

    pub fn is_requested(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    pub fn request_count(&self) -> u32 {
        self.inner.requests.load(Ordering::SeqCst)
    }

    pub fn source(&self) -> Option<CancelSource> {
        self.inner.source.lock().ok().and_then(|guard| *guard)
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("requested", &self.is_requested())
            .field("requests", &self.request_count())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownStep {
    /// Application level request to stop (SIGINT to the process group).
    Interrupt,
    /// SIGTERM to every process of the tree, innermost first.
    Terminate,
    /// SIGKILL.
    Kill,
}

/// Something that can be brought down by the [`Canceller`].
pub trait Terminable {
    fn pid(&self) -> Pid;
    /// Records the processes that make up the target before the first signal, so that
    /// descendants surviving their parent are still waited for.
    fn snapshot(&mut self) {}
    /// Any process of the target still runs.
    fn is_alive(&mut self) -> bool;
    fn send(&mut self, step: ShutdownStep) -> crate::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    AlreadyExited,
    /// The process reacted to the interrupt.
    Graceful,
    Terminated,
    Killed,
}

impl ShutdownOutcome {
    /// The process had to be forced down, the application did not end on its own terms.
    pub fn forced(&self) -> bool {
        matches!(self, ShutdownOutcome::Terminated | ShutdownOutcome::Killed)
    }

    pub fn exit_code_name(&self) -> Option<&'static str> {
        self.forced().then_some(ERR_FORCED_TERMINATION)
    }
}

pub struct Canceller {
    grace: Duration,
    poll: Duration,
    outcome: Option<ShutdownOutcome>,
    sequences: u32,
}

impl Canceller {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            poll: DEFAULT_POLL_STEP,
            outcome: None,
            sequences: 0,
        }
    }

    pub fn with_poll_step(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    /// Runs the shutdown sequence once. Later calls return the first outcome.
    pub fn shutdown(&mut self, target: &mut dyn Terminable) -> ShutdownOutcome {
        if let Some(outcome) = self.outcome {
            log::debug!(
                "Shutdown of process {} already done ({outcome:?})",
                target.pid()
            );
            return outcome;
        }
        self.sequences += 1;
        let outcome = self.run_sequence(target);
        self.outcome = Some(outcome);
        outcome
    }

    pub fn outcome(&self) -> Option<ShutdownOutcome> {
        self.outcome
    }

    /// Number of shutdown sequences actually started.
    pub fn sequences(&self) -> u32 {
        self.sequences
    }

    fn run_sequence(&self, target: &mut dyn Terminable) -> ShutdownOutcome {
        let pid = target.pid();
        target.snapshot();
        if !target.is_alive() {
            log::debug!("Process {pid} already exited, nothing to cancel");
            return ShutdownOutcome::AlreadyExited;
        }
        for (step, outcome) in [
            (ShutdownStep::Interrupt, ShutdownOutcome::Graceful),
            (ShutdownStep::Terminate, ShutdownOutcome::Terminated),
            (ShutdownStep::Kill, ShutdownOutcome::Killed),
        ] {
            log::info!("Stopping process {pid}: {step:?}");
            if let Err(error) = target.send(step) {
                log::warn!("Cannot deliver {step:?} to process {pid}: {error}");
            }
            if try_sleep(self.grace, self.poll, || !target.is_alive()) {
                log::info!("Process {pid} stopped after {step:?}");
                return outcome;
            }
            log::warn!(
                "Process {pid} still alive {:.1}s after {step:?}",
                self.grace.as_secs_f64()
            );
        }
        log::error!("Process {pid} survived SIGKILL");
        ShutdownOutcome::Killed
    }
}
