use std::path::PathBuf;
use std::time::{Duration, Instant};

use nodeguard::cancel::{CancelSource, CancelToken};
use nodeguard::exitcode::codes::*;
use nodeguard::exitcode::{ExitCodeTable, TaskState};
use nodeguard::filter::WatchFlags;
use nodeguard::launcher::WrapperSpec;
use nodeguard::sampler::pid_running;

use crate::store::{FALLBACK_FILE, read_fallback};
use crate::task::TaskRunner;
use crate::tests::utils::{TestEnv, fast_settings, run, subtask};

#[test]
fn test_clean_exit_is_finished() {
    let env = TestEnv::new();
    let config = env.job(vec![subtask("sim", "echo hello; echo oops >&2")]);
    let result = run(&fast_settings(), &config);

    assert_eq!(result.code_name, ERR_OK);
    assert_eq!(result.code, 0);
    assert_eq!(result.state, TaskState::Finished);
    assert_eq!(result.subtasks[0].process_exit, Some(0));
    assert_eq!(
        std::fs::read_to_string(env.copied("log/sim_stdout.log")).unwrap(),
        "hello\n"
    );
    assert_eq!(
        std::fs::read_to_string(env.copied("log/sim_stderr.log")).unwrap(),
        "oops\n"
    );
    assert!(result.copied_files >= 2);
    assert!(!env.work_dir().join("t1/tmp").exists());

    let stored = read_fallback(&env.copied("log").join(FALLBACK_FILE)).unwrap();
    assert_eq!(stored.code_name, ERR_OK);
    assert_eq!(stored.subtasks.len(), 1);
}

#[test]
fn test_idle_process_is_stopped_and_classified() {
    let env = TestEnv::new();
    let config = env.job(vec![subtask("sleeper", "sleep 60")]);
    let result = run(&fast_settings(), &config);

    assert_eq!(result.code_name, ERR_CPU_IDLE);
    assert_eq!(result.state, TaskState::Failed);
    assert!(result.history.iter().any(|e| e.name == ERR_IO_IDLE));
    assert!(!result.history.iter().any(|e| e.name == ERR_FORCED_TERMINATION));
    assert!(result.subtasks[0].usage.as_ref().unwrap().samples >= 4);
}

fn worker_pid(env: &TestEnv) -> nodeguard::Pid {
    std::fs::read_to_string(env.work_dir().join("t1/data/worker.pid"))
        .unwrap()
        .trim()
        .parse()
        .unwrap()
}

#[test]
fn test_worker_ignoring_interrupt_is_stopped() {
    let env = TestEnv::new();
    let script = r#"sleep 300 & echo $! > "$STARTER_DATA_DIR/worker.pid"; sleep 300"#;
    let config = env.job(vec![subtask("sim", script)]);
    let result = run(&fast_settings(), &config);

    assert_eq!(result.state, TaskState::Failed);
    assert!(result.history.iter().any(|e| e.name == ERR_FORCED_TERMINATION));
    assert!(!pid_running(worker_pid(&env)));
}

#[test]
fn test_worker_holding_output_is_watched_after_exit() {
    let env = TestEnv::new();
    let script = r#"sleep 300 & echo $! > "$STARTER_DATA_DIR/worker.pid"; exit 0"#;
    let config = env.job(vec![subtask("sim", script)]);
    let result = run(&fast_settings(), &config);

    assert_ne!(result.subtasks[0].verdict.as_deref(), Some("Exited"));
    assert!(result.history.iter().any(|e| e.name == ERR_CPU_IDLE));
    assert!(result.history.iter().any(|e| e.name == ERR_FORCED_TERMINATION));
    assert!(!pid_running(worker_pid(&env)));
}

#[test]
fn test_leftover_worker_is_stopped_after_exit() {
    let env = TestEnv::new();
    let script =
        r#"sleep 300 > /dev/null 2>&1 & echo $! > "$STARTER_DATA_DIR/worker.pid"; exit 0"#;
    let config = env.job(vec![subtask("sim", script)]);
    let result = run(&fast_settings(), &config);

    assert_eq!(result.subtasks[0].verdict.as_deref(), Some("Exited"));
    assert_eq!(result.subtasks[0].process_exit, Some(0));
    assert!(result.history.iter().any(|e| e.name == ERR_FORCED_TERMINATION));
    assert!(!pid_running(worker_pid(&env)));
}

#[test]
fn test_log_finding_fails_clean_exit() {
    let env = TestEnv::new();
    let script = r#"echo '<Message Severity="Fatal">access violation</Message>' > "$STARTER_LOG_DIR/mts.xml""#;
    let config = env.job(vec![subtask("replay", script).log_scan(Some(true))]);
    let result = run(&fast_settings(), &config);

    assert_eq!(result.subtasks[0].process_exit, Some(0));
    assert_eq!(result.code_name, ERR_MTS_CRASH);
    assert_eq!(result.state, TaskState::Failed);
    assert!(env.copied("log/00_replay/mts.xml").is_file());
}

#[test]
fn test_nonzero_exit() {
    let env = TestEnv::new();
    let config = env.job(vec![subtask("sim", "exit 3")]);
    let result = run(&fast_settings(), &config);
    assert_eq!(result.code_name, ERR_APP_EXIT);
    assert_eq!(result.subtasks[0].process_exit, Some(3));
}

#[test]
fn test_timeout_beats_less_severe_codes() {
    let env = TestEnv::new();
    let busy = subtask("busy", "while :; do :; done")
        .watch(WatchFlags {
            cpu: true,
            io: false,
            print: false,
        })
        .timeout_hours(0.0005);
    let config = env.job(vec![busy]);
    let result = run(&fast_settings(), &config);
    assert_eq!(result.code_name, ERR_TIMEOUT);
    assert!(!result.history.iter().any(|e| e.name == ERR_APP_EXIT));
}

#[test]
fn test_fatal_output_aborts() {
    let env = TestEnv::new();
    let config = env.job(vec![
        subtask("sim", "echo 'FATAL: license lost'; sleep 60")
            .fatal_patterns(vec!["^FATAL".to_string()]),
    ]);
    let result = run(&fast_settings(), &config);
    assert_eq!(result.code_name, ERR_FATAL_OUTPUT);
}

#[test]
fn test_skip_on_previous_code() {
    let env = TestEnv::new();
    let config = env.job(vec![
        subtask("first", "exit 2"),
        subtask("second", "touch second")
            .skip_on(vec![ERR_APP_EXIT.to_string()])
            .skip_count(Some(2)),
        subtask("third", "touch third"),
        subtask("fourth", "touch fourth"),
    ]);
    let result = run(&fast_settings(), &config);

    let skipped: Vec<bool> = result.subtasks.iter().map(|s| s.skipped).collect();
    assert_eq!(skipped, vec![false, true, true, false]);
    let root = env.work_dir().join("t1");
    assert!(!root.join("second").exists());
    assert!(!root.join("third").exists());
    assert!(root.join("fourth").is_file());
    assert_eq!(result.code_name, ERR_APP_EXIT);
    assert_eq!(
        result
            .history
            .iter()
            .filter(|e| e.name == WARN_SUBTASK_SKIPPED)
            .count(),
        2
    );
    assert_eq!(result.subtasks[1].state, TaskState::Finished);
}

#[test]
fn test_skip_on_follows_last_executed_subtask() {
    let env = TestEnv::new();
    let config = env.job(vec![
        subtask("first", "exit 2"),
        subtask("second", "true").skip_on(vec![ERR_APP_EXIT.to_string()]),
        subtask("third", "true").skip_on(vec![ERR_APP_EXIT.to_string()]),
    ]);
    let result = run(&fast_settings(), &config);
    let skipped: Vec<bool> = result.subtasks.iter().map(|s| s.skipped).collect();
    assert_eq!(skipped, vec![false, true, true]);
}

#[test]
fn test_skip_on_other_code_runs() {
    let env = TestEnv::new();
    let config = env.job(vec![
        subtask("first", "exit 0"),
        subtask("second", "touch second").skip_on(vec![ERR_APP_EXIT.to_string()]),
    ]);
    let result = run(&fast_settings(), &config);
    assert!(!result.subtasks[1].skipped);
    assert!(env.work_dir().join("t1/second").is_file());
    assert_eq!(result.code_name, ERR_OK);
}

#[test]
fn test_end_on_error() {
    let env = TestEnv::new();
    let mut config = env.job(vec![subtask("first", "exit 1"), subtask("second", "touch second")]);
    config.end_on_error = true;
    let result = run(&fast_settings(), &config);
    assert!(result.subtasks[1].skipped);
    assert!(!env.work_dir().join("t1/second").exists());
    assert_eq!(result.code_name, ERR_APP_EXIT);
}

#[test]
fn test_failures_do_not_stop_later_subtasks() {
    let env = TestEnv::new();
    let config = env.job(vec![subtask("first", "exit 1"), subtask("second", "touch second")]);
    let result = run(&fast_settings(), &config);
    assert!(!result.subtasks[1].skipped);
    assert!(env.work_dir().join("t1/second").is_file());
    assert_eq!(result.code_name, ERR_APP_EXIT);
    assert_eq!(result.history[0].source.as_deref(), Some("first"));
}

#[test]
fn test_cancel_before_start() {
    let env = TestEnv::new();
    let config = env.job(vec![subtask("a", "touch a"), subtask("b", "touch b")]);
    let settings = fast_settings();
    let token = CancelToken::new();
    token.request(CancelSource::Signal(15));
    let result = TaskRunner::new(&settings, &config, ExitCodeTable::builtin())
        .with_cancel_token(token)
        .run();
    assert_eq!(result.state, TaskState::Canceled);
    assert!(result.subtasks.iter().all(|s| s.skipped));
    assert_eq!(
        result.history.iter().filter(|e| e.name == ERR_CANCELED).count(),
        1
    );
}

#[test]
fn test_cancel_file_stops_running_subtask() {
    let env = TestEnv::new();
    let cancel_file = env.path().join("cancel");
    std::fs::write(&cancel_file, "").unwrap();
    let mut config = env.job(vec![subtask("a", "sleep 60"), subtask("b", "touch b")]);
    config.cancel_file = Some(cancel_file);
    let result = run(&fast_settings(), &config);
    assert_eq!(result.code_name, ERR_CANCELED);
    assert_eq!(result.state, TaskState::Canceled);
    assert!(!result.subtasks[0].skipped);
    assert!(result.subtasks[1].skipped);
}

#[test]
fn test_wrapper_failure() {
    let env = TestEnv::new();
    let wrapper = WrapperSpec {
        name: "license".to_string(),
        args: vec!["sh".to_string(), "-c".to_string(), "exit 1".to_string()],
        ready_pattern: Some("ready".to_string()),
        error_pattern: None,
        timeout_secs: 10,
    };
    let config = env.job(vec![subtask("sim", "touch ran").wrappers(vec![wrapper])]);
    let result = run(&fast_settings(), &config);
    assert_eq!(result.code_name, ERR_WRAPPER_FAILED);
    assert!(!env.work_dir().join("t1/ran").exists());
}

#[test]
fn test_cancel_while_wrapper_starts() {
    let env = TestEnv::new();
    let cancel_file = env.path().join("cancel");
    let wrapper = WrapperSpec {
        name: "license".to_string(),
        args: vec!["sh".to_string(), "-c".to_string(), "sleep 60".to_string()],
        ready_pattern: Some("^ready$".to_string()),
        error_pattern: None,
        timeout_secs: 60,
    };
    let mut config = env.job(vec![
        subtask("sim", "touch ran").wrappers(vec![wrapper]),
        subtask("next", "touch next"),
    ]);
    config.cancel_file = Some(cancel_file.clone());
    let writer = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(500));
        std::fs::write(cancel_file, "").unwrap();
    });
    let started = Instant::now();
    let result = run(&fast_settings(), &config);
    writer.join().unwrap();

    assert!(started.elapsed() < Duration::from_secs(30));
    assert_eq!(result.code_name, ERR_CANCELED);
    assert_eq!(result.state, TaskState::Canceled);
    assert!(!env.work_dir().join("t1/ran").exists());
    assert!(result.subtasks[1].skipped);
}

#[test]
fn test_wrapper_is_running_during_subtask() {
    let env = TestEnv::new();
    let wrapper = WrapperSpec {
        name: "service".to_string(),
        args: vec![
            "sh".to_string(),
            "-c".to_string(),
            "touch service.up; echo ready; sleep 60".to_string(),
        ],
        ready_pattern: Some("^ready$".to_string()),
        error_pattern: None,
        timeout_secs: 10,
    };
    let config = env.job(vec![
        subtask("sim", "test -f service.up && touch saw_service").wrappers(vec![wrapper]),
    ]);
    let result = run(&fast_settings(), &config);
    assert_eq!(result.code_name, ERR_OK);
    assert!(env.work_dir().join("t1/saw_service").is_file());
    assert!(env.copied("log/00_sim/wrapper_service.log").is_file());
}

#[test]
fn test_application_cannot_start() {
    let env = TestEnv::new();
    let config = env.job(vec![
        subtask("sim", "").args(Some(vec!["/nonexistent/simulator".to_string()])),
    ]);
    let result = run(&fast_settings(), &config);
    assert_eq!(result.code_name, ERR_APP_START);
    assert_eq!(result.subtasks[0].process_exit, None);
}

#[test]
fn test_folder_creation_failure() {
    let env = TestEnv::new();
    let blocker = env.path().join("blocker");
    std::fs::write(&blocker, "").unwrap();
    let mut config = env.job(vec![subtask("sim", "true")]);
    config.work_dir = blocker;
    config.result_dir = None;
    let result = run(&fast_settings(), &config);
    assert_eq!(result.code_name, ERR_FOLDER_CREATION);
    assert!(result.subtasks.is_empty());
}

#[test]
fn test_invalid_config_is_classified() {
    let env = TestEnv::new();
    let config = env.job(vec![subtask("sim", "true").skip_on(vec!["ERR_UNKNOWN".to_string()])]);
    let result = run(&fast_settings(), &config);
    assert_eq!(result.code_name, ERR_SCRIPT_MALFUNCTION);
}

#[test]
fn test_environment_is_exported() {
    let env = TestEnv::new();
    let script = r#"echo "$STARTER_TASK_NAME:$STARTER_SUBTASK_INDEX" > "$STARTER_DATA_DIR/env.txt""#;
    let config = env.job(vec![subtask("a", "true"), subtask("b", script)]);
    run(&fast_settings(), &config);
    assert_eq!(
        std::fs::read_to_string(env.copied("data/env.txt")).unwrap(),
        "t1:1\n"
    );
}

#[test]
fn test_extra_copy_back_paths() {
    let env = TestEnv::new();
    let config = env.job(vec![
        subtask("sim", "mkdir -p out && echo r > out/report.txt")
            .copy_back(vec![PathBuf::from("out")]),
    ]);
    let result = run(&fast_settings(), &config);
    assert_eq!(result.code_name, ERR_OK);
    assert_eq!(
        std::fs::read_to_string(env.copied("out/report.txt")).unwrap(),
        "r\n"
    );
}

#[test]
fn test_dry_run_executes_nothing() {
    let env = TestEnv::new();
    let config = env.job(vec![subtask("sim", "touch ran")]);
    let settings = fast_settings().with_dry_run(true);
    let result = run(&settings, &config);
    assert_eq!(result.code_name, ERR_OK);
    assert_eq!(result.subtasks[0].command, "sh -c \"touch ran\"");
    assert!(!env.work_dir().join("t1/ran").exists());
    assert!(!env.result_dir().exists());
}
