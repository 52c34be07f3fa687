//! Starting of the watched application and its wrappers.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid as NixPid;
use regex::Regex;

use crate::Pid;
use crate::cancel::{ShutdownStep, Terminable};
use crate::common::error::GuardError;
use crate::common::utils::try_sleep;
use crate::Set;
use crate::sampler::{pid_running, process_group, task_processes};

mod output;
mod wrapper;

pub use output::{LineCallback, LineFilter, OutputCallback};
pub use wrapper::{WrapperChain, WrapperSpec};

use output::{OutputMonitor, ReaderContext, spawn_reader};

const POLL_STEP: Duration = Duration::from_millis(50);

/// Everything needed to start one process.
#[derive(Debug, Clone, Default)]
pub struct LaunchSpec {
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
    /// File receiving the kept stdout lines (appended).
    pub stdout_log: Option<PathBuf>,
    /// File receiving stderr lines. Without it stderr goes to `stdout_log`.
    pub stderr_log: Option<PathBuf>,
    pub filter: Option<LineFilter>,
    pub callbacks: Vec<OutputCallback>,
    /// Output lines matching any of these mark the run as fatally failed.
    pub fatal_patterns: Vec<Regex>,
}

impl LaunchSpec {
    pub fn new(args: Vec<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            args,
            cwd: cwd.into(),
            ..Default::default()
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn stdout_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdout_log = Some(path.into());
        self
    }

    pub fn stderr_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.stderr_log = Some(path.into());
        self
    }

    pub fn callback(mut self, callback: OutputCallback) -> Self {
        self.callbacks.push(callback);
        self
    }

    pub fn display_command(&self) -> String {
        self.args
            .iter()
            .map(|arg| {
                if arg.contains(char::is_whitespace) {
                    format!("{arg:?}")
                } else {
                    arg.clone()
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn open_log(path: &Path) -> crate::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

fn command_from_spec(spec: &LaunchSpec) -> crate::Result<Command> {
    if spec.args.is_empty() {
        return Err(GuardError::LaunchError("No command arguments".to_string()));
    }
    let mut command = Command::new(&spec.args[0]);
    command.args(&spec.args[1..]);

    // Own process group, so that signals for the task never hit the runner itself
    command.process_group(0);
    #[cfg(target_os = "linux")]
    unsafe {
        command.pre_exec(|| {
            // Take the task down when the runner dies.
            let _ = nix::sys::prctl::set_pdeathsig(Signal::SIGTERM);
            Ok(())
        });
    }

    if !spec.cwd.is_dir() {
        std::fs::create_dir_all(&spec.cwd).map_err(|error| {
            GuardError::LaunchError(format!(
                "Could not create working directory {}: {error:?}",
                spec.cwd.display()
            ))
        })?;
    }
    command.current_dir(&spec.cwd);
    command.envs(&spec.env);
    command.stdin(Stdio::null());
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());
    Ok(command)
}

fn map_spawn_error(error: std::io::Error, spec: &LaunchSpec) -> GuardError {
    let file = &spec.args[0];
    let context = match error.kind() {
        ErrorKind::NotFound => {
            let mut msg =
                format!("\nThe program that you have tried to execute (`{file}`) was not found.");
            let path = Path::new(file);
            if path.is_relative() && path.components().count() == 1 {
                let possible_path = spec.cwd.join(path);
                if possible_path.is_file() {
                    msg.push_str(&format!(
                        "\nThe file `{}` exists, maybe you have meant `./{}` instead?",
                        possible_path.display(),
                        path.display()
                    ));
                }
            }
            msg
        }
        ErrorKind::PermissionDenied => {
            format!(
                "\nThe program `{file}` is not executable. \
Try making it executable or add a shebang line to it."
            )
        }
        _ => String::new(),
    };
    GuardError::LaunchError(format!(
        "Cannot execute {:?}: {error}{context}",
        spec.display_command()
    ))
}

/// Handle of a launched process and the threads draining its output.
pub struct RunningProcess {
    child: Child,
    pid: Pid,
    monitor: Arc<OutputMonitor>,
    readers: Vec<JoinHandle<()>>,
    status: Option<ExitStatus>,
    /// Processes of the task seen when the shutdown started.
    known: Set<Pid>,
}

impl RunningProcess {
    pub fn spawn(spec: &LaunchSpec) -> crate::Result<Self> {
        let mut command = command_from_spec(spec)?;
        let stdout_sink = spec.stdout_log.as_deref().map(open_log).transpose()?;
        let stderr_sink = match (&spec.stderr_log, &stdout_sink) {
            (Some(path), _) => Some(open_log(path)?),
            (None, Some(file)) => Some(file.try_clone()?),
            (None, None) => None,
        };

        let mut child = command
            .spawn()
            .map_err(|error| map_spawn_error(error, spec))?;
        let pid = child.id();
        let display = spec.display_command();
        log::info!("Started process {pid}: {display}");

        let monitor = Arc::new(OutputMonitor::default());
        let mut readers = Vec::with_capacity(2);
        let streams: [(String, Option<Box<dyn std::io::Read + Send>>, Option<File>); 2] = [
            (
                format!("stdout-{pid}"),
                child
                    .stdout
                    .take()
                    .map(|s| Box::new(s) as Box<dyn std::io::Read + Send>),
                stdout_sink,
            ),
            (
                format!("stderr-{pid}"),
                child
                    .stderr
                    .take()
                    .map(|s| Box::new(s) as Box<dyn std::io::Read + Send>),
                stderr_sink,
            ),
        ];
        for (name, stream, sink) in streams {
            let Some(stream) = stream else { continue };
            let ctx = ReaderContext {
                name,
                sink,
                filter: spec.filter.clone(),
                callbacks: spec.callbacks.clone(),
                fatal_patterns: spec.fatal_patterns.clone(),
                monitor: monitor.clone(),
            };
            match spawn_reader(stream, ctx) {
                Ok(handle) => readers.push(handle),
                Err(error) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(error);
                }
            }
        }

        Ok(Self {
            child,
            pid,
            monitor,
            readers,
            status: None,
            known: Set::default(),
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Whether the OS process itself has not exited yet.
    pub fn process_alive(&mut self) -> bool {
        self.exit_status().is_none()
    }

    /// The process is alive or its output is still being drained.
    ///
    /// A process that exited while a grandchild keeps the pipe open is still running.
    pub fn running(&mut self) -> bool {
        self.process_alive() || self.monitor.readers_active()
    }

    pub fn exit_status(&mut self) -> Option<ExitStatus> {
        if self.status.is_none() {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    log::debug!("Process {} exited with {status}", self.pid);
                    self.status = Some(status);
                }
                Ok(None) => {}
                Err(error) => log::warn!("Cannot query status of process {}: {error}", self.pid),
            }
        }
        self.status
    }

    /// Exit code of the process, `None` while running or when ended by a signal.
    pub fn exit_code(&mut self) -> Option<i32> {
        self.exit_status().and_then(|status| status.code())
    }

    pub fn output_lines(&self) -> u64 {
        self.monitor.lines()
    }

    pub fn fatal_message(&self) -> Option<String> {
        self.monitor.fatal_message()
    }

    /// Last lines of output, for diagnostics.
    pub fn output_tail(&self) -> Vec<String> {
        self.monitor.tail()
    }

    pub fn wait_timeout(&mut self, timeout: Duration) -> Option<ExitStatus> {
        try_sleep(timeout, POLL_STEP, || !self.process_alive());
        self.exit_status()
    }

    pub fn send_signal(&self, signal: Signal) -> crate::Result<()> {
        let pgid = NixPid::from_raw(self.pid as i32);
        signal::killpg(pgid, Some(signal)).map_err(|error| {
            GuardError::GenericError(format!(
                "Cannot send signal {signal} to PGID {pgid}: {error:?}"
            ))
        })
    }

    /// Waits for the process to exit and for the readers to drain, each bounded by `timeout`.
    /// Readers still blocked after that (a grandchild holding the pipe) are left behind.
    pub fn close(&mut self, timeout: Duration) -> Option<ExitStatus> {
        let status = self.wait_timeout(timeout);
        let monitor = &self.monitor;
        try_sleep(timeout, POLL_STEP, || !monitor.readers_active());
        for reader in std::mem::take(&mut self.readers) {
            if reader.is_finished() {
                if reader.join().is_err() {
                    log::error!("Output reader of process {} panicked", self.pid);
                }
            } else {
                log::warn!("Output of process {} still open, detaching reader", self.pid);
            }
        }
        status
    }

    /// Whether the process or anything it started still runs. Checks the root, the
    /// members of its process group and the processes seen when the shutdown started.
    pub fn tree_alive(&mut self) -> bool {
        if self.process_alive() {
            return true;
        }
        self.known.retain(|pid| pid_running(*pid));
        if !self.known.is_empty() {
            return true;
        }
        match process_group(self.pid) {
            Ok(members) => !members.is_empty(),
            Err(error) => {
                log::debug!("Cannot list process group {}: {error}", self.pid);
                false
            }
        }
    }

    /// Processes of the task, innermost first. An exited root is left out.
    fn task_pids(&mut self) -> Vec<Pid> {
        let root_alive = self.process_alive();
        let mut pids = task_processes(self.pid).unwrap_or_else(|error| {
            log::debug!("Cannot list processes of {}: {error}", self.pid);
            Vec::new()
        });
        for pid in &self.known {
            if !pids.contains(pid) {
                pids.push(*pid);
            }
        }
        if !root_alive {
            pids.retain(|pid| *pid != self.pid);
        }
        pids.reverse();
        pids
    }

    fn signal_tree(&mut self, signal: Signal) {
        for pid in self.task_pids() {
            log::debug!("Sending {signal} to {pid}");
            if let Err(error) = signal::kill(NixPid::from_raw(pid as i32), signal) {
                log::debug!("Cannot send {signal} to {pid}: {error}");
            }
        }
    }

    fn kill_tree(&mut self) {
        self.signal_tree(Signal::SIGKILL);
        let _ = self.send_signal(Signal::SIGKILL);
        if self.process_alive() {
            let _ = self.child.kill();
        }
    }
}

impl Terminable for RunningProcess {
    fn pid(&self) -> Pid {
        self.pid
    }

    fn snapshot(&mut self) {
        match task_processes(self.pid) {
            Ok(pids) => self.known = pids.into_iter().filter(|pid| pid_running(*pid)).collect(),
            Err(error) => log::debug!("Cannot list processes of {}: {error}", self.pid),
        }
    }

    fn is_alive(&mut self) -> bool {
        self.tree_alive()
    }

    fn send(&mut self, step: ShutdownStep) -> crate::Result<()> {
        match step {
            ShutdownStep::Interrupt => self.send_signal(Signal::SIGINT),
            ShutdownStep::Terminate => {
                self.signal_tree(Signal::SIGTERM);
                Ok(())
            }
            ShutdownStep::Kill => {
                self.kill_tree();
                Ok(())
            }
        }
    }
}

impl Drop for RunningProcess {
    fn drop(&mut self) {
        let alive = self.process_alive();
        if alive || self.tree_alive() {
            log::debug!("Killing process group {} on drop", self.pid);
        }
        self.kill_tree();
        if alive {
            let _ = self.child.wait();
        }
    }
}
