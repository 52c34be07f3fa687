use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::cancel::{CancelToken, Canceller};
use crate::common::error::GuardError;
use crate::launcher::{LaunchSpec, OutputCallback, RunningProcess};

const READY_POLL: Duration = Duration::from_millis(100);

fn default_wrapper_timeout() -> u64 {
    60
}

/// Helper executable started before the main application (license checkout,
/// recording mount, a local service the application talks to).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WrapperSpec {
    pub name: String,
    pub args: Vec<String>,
    /// Output line signalling that the wrapper is ready. Without it the wrapper is
    /// ready as soon as it has started.
    #[serde(default)]
    pub ready_pattern: Option<String>,
    /// Output line signalling that the wrapper failed.
    #[serde(default)]
    pub error_pattern: Option<String>,
    #[serde(default = "default_wrapper_timeout")]
    pub timeout_secs: u64,
}

enum WrapperEvent {
    Ready,
    Failed(String),
}

fn compile(pattern: &Option<String>, wrapper: &str) -> crate::Result<Option<Regex>> {
    pattern
        .as_deref()
        .map(|pattern| {
            Regex::new(pattern).map_err(|error| {
                GuardError::WrapperError(format!("Invalid pattern of wrapper {wrapper}: {error}"))
            })
        })
        .transpose()
}

impl WrapperSpec {
    /// Starts the wrapper and blocks until it reports readiness or the task is cancelled.
    pub fn start(
        &self,
        cwd: &Path,
        env: &BTreeMap<String, String>,
        log_dir: Option<&Path>,
        cancel: &CancelToken,
        cancel_file: Option<&Path>,
    ) -> crate::Result<RunningProcess> {
        let ready = compile(&self.ready_pattern, &self.name)?;
        let failed = compile(&self.error_pattern, &self.name)?;
        let (sender, receiver) = mpsc::channel();

        let mut spec = LaunchSpec::new(self.args.clone(), cwd);
        spec.env = env.clone();
        if let Some(log_dir) = log_dir {
            spec.stdout_log = Some(log_dir.join(format!("wrapper_{}.log", self.name)));
        }
        if let Some(pattern) = ready.clone() {
            let sender = sender.clone();
            spec.callbacks.push(OutputCallback::new(pattern, move |_| {
                let _ = sender.send(WrapperEvent::Ready);
            }));
        }
        if let Some(pattern) = failed {
            let sender = sender.clone();
            spec.callbacks.push(OutputCallback::new(pattern, move |line| {
                let _ = sender.send(WrapperEvent::Failed(line.to_string()));
            }));
        }
        drop(sender);

        let mut process = RunningProcess::spawn(&spec)
            .map_err(|error| GuardError::WrapperError(format!("{}: {error}", self.name)))?;
        if ready.is_none() {
            log::info!("Wrapper {} started", self.name);
            return Ok(process);
        }

        let deadline = Instant::now() + Duration::from_secs(self.timeout_secs);
        loop {
            match receiver.recv_timeout(READY_POLL) {
                Ok(WrapperEvent::Ready) => {
                    log::info!("Wrapper {} is ready", self.name);
                    return Ok(process);
                }
                Ok(WrapperEvent::Failed(line)) => {
                    return Err(GuardError::WrapperError(format!(
                        "Wrapper {} reported an error: {line}",
                        self.name
                    )));
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {}
            }
            if cancel.observe(cancel_file) {
                return Err(GuardError::Cancelled(format!(
                    "wrapper {} was not ready yet",
                    self.name
                )));
            }
            if !process.running() {
                return Err(GuardError::WrapperError(format!(
                    "Wrapper {} exited before becoming ready ({:?})",
                    self.name,
                    process.exit_status()
                )));
            }
            if Instant::now() >= deadline {
                return Err(GuardError::WrapperError(format!(
                    "Wrapper {} not ready within {}s",
                    self.name, self.timeout_secs
                )));
            }
        }
    }
}

/// Wrappers started in order, stopped in reverse order.
pub struct WrapperChain {
    processes: Vec<(String, RunningProcess)>,
    grace: Duration,
}

impl WrapperChain {
    /// Starts all wrappers. On the first failure or on cancellation, the already started
    /// ones are stopped.
    pub fn start(
        specs: &[WrapperSpec],
        cwd: &Path,
        env: &BTreeMap<String, String>,
        log_dir: Option<PathBuf>,
        grace: Duration,
        cancel: &CancelToken,
        cancel_file: Option<&Path>,
    ) -> crate::Result<Self> {
        let mut chain = Self {
            processes: Vec::with_capacity(specs.len()),
            grace,
        };
        for spec in specs {
            if cancel.observe(cancel_file) {
                chain.stop();
                return Err(GuardError::Cancelled(format!(
                    "wrapper {} was not started",
                    spec.name
                )));
            }
            match spec.start(cwd, env, log_dir.as_deref(), cancel, cancel_file) {
                Ok(process) => chain.processes.push((spec.name.clone(), process)),
                Err(error) => {
                    chain.stop();
                    return Err(error);
                }
            }
        }
        Ok(chain)
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    pub fn stop(&mut self) {
        while let Some((name, mut process)) = self.processes.pop() {
            let outcome = Canceller::new(self.grace).shutdown(&mut process);
            log::debug!("Wrapper {name} stopped: {outcome:?}");
            process.close(self.grace);
        }
    }
}

impl Drop for WrapperChain {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn wrapper(name: &str, script: &str) -> WrapperSpec {
        WrapperSpec {
            name: name.to_string(),
            args: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            ready_pattern: Some("^ready$".to_string()),
            error_pattern: Some("^error".to_string()),
            timeout_secs: 10,
        }
    }

    #[test]
    fn test_wrapper_ready() {
        let dir = TempDir::new().unwrap();
        let spec = wrapper("w", "echo starting; echo ready; sleep 30");
        let mut process = spec
            .start(dir.path(), &BTreeMap::new(), None, &CancelToken::new(), None)
            .unwrap();
        assert!(process.process_alive());
    }

    #[test]
    fn test_wrapper_error_pattern() {
        let dir = TempDir::new().unwrap();
        let spec = wrapper("w", "echo 'error: no license'; sleep 30");
        let error = spec
            .start(dir.path(), &BTreeMap::new(), None, &CancelToken::new(), None)
            .err()
            .unwrap();
        assert!(error.to_string().contains("no license"));
    }

    #[test]
    fn test_wrapper_exits_early() {
        let dir = TempDir::new().unwrap();
        let spec = wrapper("w", "exit 1");
        assert!(
            spec.start(dir.path(), &BTreeMap::new(), None, &CancelToken::new(), None)
                .is_err()
        );
    }

    #[test]
    fn test_wrapper_timeout() {
        let dir = TempDir::new().unwrap();
        let mut spec = wrapper("w", "sleep 30");
        spec.timeout_secs = 1;
        let error = spec
            .start(dir.path(), &BTreeMap::new(), None, &CancelToken::new(), None)
            .err()
            .unwrap();
        assert!(error.to_string().contains("not ready"));
    }

    #[test]
    fn test_chain_stops_started_wrappers_on_failure() {
        let dir = TempDir::new().unwrap();
        let specs = vec![
            wrapper("first", "echo ready; sleep 30"),
            wrapper("second", "echo error; sleep 30"),
        ];
        let result = WrapperChain::start(
            &specs,
            dir.path(),
            &BTreeMap::new(),
            Some(dir.path().join("log")),
            Duration::from_secs(5),
            &CancelToken::new(),
            None,
        );
        assert!(result.is_err());
        assert!(dir.path().join("log/wrapper_first.log").exists());
    }

    #[test]
    fn test_cancel_interrupts_readiness_wait() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("cancel");
        let spec = wrapper("slow", "sleep 30");
        let token = CancelToken::new();
        let writer = {
            let marker = marker.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(300));
                std::fs::write(marker, "").unwrap();
            })
        };
        let started = Instant::now();
        let error = spec
            .start(dir.path(), &BTreeMap::new(), None, &token, Some(&marker))
            .err()
            .unwrap();
        writer.join().unwrap();
        assert!(matches!(error, GuardError::Cancelled(_)));
        assert!(token.is_requested());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_chain_not_started_when_cancelled() {
        let dir = TempDir::new().unwrap();
        let token = CancelToken::new();
        token.request(crate::cancel::CancelSource::Signal(15));
        let result = WrapperChain::start(
            &[wrapper("first", "echo ready; sleep 30")],
            dir.path(),
            &BTreeMap::new(),
            Some(dir.path().join("log")),
            Duration::from_secs(5),
            &token,
            None,
        );
        assert!(matches!(result, Err(GuardError::Cancelled(_))));
        assert!(!dir.path().join("log/wrapper_first.log").exists());
    }

    #[test]
    fn test_chain_without_patterns() {
        let dir = TempDir::new().unwrap();
        let mut spec = wrapper("plain", "sleep 30");
        spec.ready_pattern = None;
        let mut chain = WrapperChain::start(
            &[spec],
            dir.path(),
            &BTreeMap::new(),
            None,
            Duration::from_secs(5),
            &CancelToken::new(),
            None,
        )
        .unwrap();
        assert_eq!(chain.len(), 1);
        chain.stop();
        assert!(chain.is_empty());
    }
}
