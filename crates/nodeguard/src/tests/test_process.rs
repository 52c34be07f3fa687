use std::time::Duration;

use crate::cancel::{CancelSource, CancelToken, Canceller, ShutdownOutcome};
use crate::exitcode::codes::ERR_FORCED_TERMINATION;
use crate::filter::IdleKind;
use crate::launcher::{LaunchSpec, RunningProcess};
use crate::sampler::{PsutilTreeSampler, ProcessTreeSampler, pid_running, task_processes};
use crate::tests::utils::{init_logging, sh};
use crate::watchdog::{MIN_CYCLE, Verdict, Watchdog, WatchdogConfig};

fn spawn(script: &str, dir: &std::path::Path) -> RunningProcess {
    RunningProcess::spawn(&LaunchSpec::new(sh(script), dir)).unwrap()
}

fn canceller(grace_ms: u64) -> Canceller {
    Canceller::new(Duration::from_millis(grace_ms)).with_poll_step(Duration::from_millis(20))
}

#[test]
fn test_sleeping_process_is_reported_idle() {
    init_logging();
    let dir = tempfile::TempDir::new().unwrap();
    let mut process = spawn("sleep 60", dir.path());
    let config = WatchdogConfig {
        cycle: MIN_CYCLE,
        initial_wait: MIN_CYCLE,
        poll_step: Duration::from_millis(50),
        ..Default::default()
    };
    let dog = Watchdog::new(config, Box::new(PsutilTreeSampler::new()), None);
    let outcome = dog.run(&mut process, &CancelToken::new());
    assert_eq!(
        outcome.verdict,
        Verdict::Idle(vec![IdleKind::Cpu, IdleKind::Io])
    );

    let shutdown = canceller(5000).shutdown(&mut process);
    assert_eq!(shutdown, ShutdownOutcome::Graceful);
    assert!(!process.process_alive());
}

#[test]
fn test_exiting_process_is_noticed() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut process = spawn("echo hello; exit 4", dir.path());
    let dog = Watchdog::new(
        WatchdogConfig {
            initial_wait: Duration::from_secs(30),
            poll_step: Duration::from_millis(20),
            ..Default::default()
        },
        Box::new(PsutilTreeSampler::new()),
        None,
    );
    let outcome = dog.run(&mut process, &CancelToken::new());
    assert_eq!(outcome.verdict, Verdict::Exited);
    process.close(Duration::from_secs(5));
    assert_eq!(process.exit_code(), Some(4));
    assert_eq!(process.output_lines(), 1);
}

#[test]
fn test_tree_sampler_sees_children() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut process = spawn("sleep 30 & sleep 30 & wait", dir.path());
    std::thread::sleep(Duration::from_millis(300));
    let tree = task_processes(process.pid()).unwrap();
    assert_eq!(tree[0], process.pid());
    assert!(tree.len() >= 3);
    let sample = PsutilTreeSampler::new().sample(process.pid()).unwrap();
    assert!(sample.processes >= 3);
    assert!(sample.mem_bytes > 0);
    canceller(2000).shutdown(&mut process);
}

#[test]
fn test_ignored_interrupt_escalates_to_terminate() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut process = spawn("trap '' INT; sleep 60", dir.path());
    std::thread::sleep(Duration::from_millis(200));
    let outcome = canceller(500).shutdown(&mut process);
    assert_eq!(outcome, ShutdownOutcome::Terminated);
    assert_eq!(outcome.exit_code_name(), Some(ERR_FORCED_TERMINATION));
}

#[test]
fn test_ignored_terminate_escalates_to_kill() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut process = spawn("trap '' INT TERM; sleep 60", dir.path());
    std::thread::sleep(Duration::from_millis(200));
    let outcome = canceller(300).shutdown(&mut process);
    assert_eq!(outcome, ShutdownOutcome::Killed);
    assert!(!process.process_alive());
}

#[test]
fn test_repeated_triggers_single_sequence() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut process = spawn("sleep 60", dir.path());
    let token = CancelToken::new();
    let mut canceller = canceller(3000);
    let triggers = [
        CancelSource::Signal(15),
        CancelSource::Scheduler,
        CancelSource::Watchdog,
    ];
    for source in triggers {
        token.request(source);
        if token.is_requested() {
            canceller.shutdown(&mut process);
        }
    }
    assert_eq!(canceller.sequences(), 1);
    assert_eq!(canceller.outcome(), Some(ShutdownOutcome::Graceful));
    assert_eq!(token.request_count(), 3);
}

#[test]
fn test_missing_root_is_unavailable() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut process = spawn("exit 0", dir.path());
    let pid = process.pid();
    process.close(Duration::from_secs(5));
    let error = PsutilTreeSampler::new().sample(pid).err().unwrap();
    assert!(matches!(
        error,
        crate::common::error::GuardError::ProcessUnavailable(p) if p == pid
    ));
}

fn read_pid(path: &std::path::Path) -> crate::Pid {
    let mut content = String::new();
    crate::common::utils::try_sleep(Duration::from_secs(5), Duration::from_millis(20), || {
        content = std::fs::read_to_string(path).unwrap_or_default();
        content.ends_with('\n')
    });
    content.trim().parse().unwrap()
}

#[test]
fn test_descendant_ignoring_interrupt_is_terminated() {
    let dir = tempfile::TempDir::new().unwrap();
    // Background jobs of a non-interactive shell ignore SIGINT
    let mut process = spawn("sleep 300 & echo $! > worker.pid; sleep 300", dir.path());
    let worker = read_pid(&dir.path().join("worker.pid"));

    let outcome = canceller(500).shutdown(&mut process);
    assert_eq!(outcome, ShutdownOutcome::Terminated);
    assert_eq!(outcome.exit_code_name(), Some(ERR_FORCED_TERMINATION));
    assert!(!pid_running(worker));
    assert!(!process.tree_alive());
}

#[test]
fn test_orphaned_worker_is_sampled_and_stopped() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut process = spawn("sleep 300 & echo $! > worker.pid; exit 0", dir.path());
    let worker = read_pid(&dir.path().join("worker.pid"));
    crate::common::utils::try_sleep(Duration::from_secs(5), Duration::from_millis(20), || {
        !process.process_alive()
    });
    assert!(!process.process_alive());
    assert!(process.running());

    let sample = PsutilTreeSampler::new().sample(process.pid()).unwrap();
    assert_eq!(sample.processes, 1);
    assert!(process.tree_alive());

    let outcome = canceller(500).shutdown(&mut process);
    assert!(outcome.forced());
    assert!(!pid_running(worker));
}

#[test]
fn test_drop_kills_leftover_group() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut process = spawn(
        "sleep 300 > /dev/null 2>&1 & echo $! > worker.pid; exit 0",
        dir.path(),
    );
    let worker = read_pid(&dir.path().join("worker.pid"));
    process.close(Duration::from_secs(5));
    assert!(pid_running(worker));
    drop(process);
    let stopped = crate::common::utils::try_sleep(
        Duration::from_secs(5),
        Duration::from_millis(20),
        || !pid_running(worker),
    );
    assert!(stopped);
}

#[test]
fn test_cpu_time_of_exited_workers_is_counted() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut process = spawn(
        "while :; do sh -c 'i=0; while [ $i -lt 30000 ]; do i=$((i+1)); done'; done",
        dir.path(),
    );
    let mut sampler = PsutilTreeSampler::new();
    let first = sampler.sample(process.pid()).unwrap();
    std::thread::sleep(Duration::from_secs(2));
    let second = sampler.sample(process.pid()).unwrap();
    canceller(2000).shutdown(&mut process);

    let busy = second.cpu_time.saturating_sub(first.cpu_time);
    assert!(busy >= Duration::from_millis(800), "cpu time grew by {busy:?}");
}
