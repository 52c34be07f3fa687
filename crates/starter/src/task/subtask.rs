//! Execution of a single subtask: wrappers, application, watchdog, shutdown,
//! classification and log scan.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use nodeguard::cancel::{CancelToken, Canceller};
use nodeguard::common::error::GuardError;
use nodeguard::exitcode::codes::{
    ERR_APP_START, ERR_CANCELED, ERR_FOLDER_CREATION, ERR_SCRIPT_MALFUNCTION, ERR_WRAPPER_FAILED,
};
use nodeguard::exitcode::{ExitCode, ExitCodeTable};
use nodeguard::launcher::{LaunchSpec, RunningProcess, WrapperChain};
use nodeguard::sampler::{default_system_sampler, default_tree_sampler};
use nodeguard::watchdog::{Verdict, Watchdog, WatchdogConfig};

use crate::common::env::{
    STARTER_DATA_DIR, STARTER_LOG_DIR, STARTER_RECORDING, STARTER_SUBTASK_INDEX,
    STARTER_TASK_NAME, STARTER_TMP_DIR,
};
use crate::common::settings::StarterSettings;
use crate::common::utils::fs::ensure_dir;
use crate::config::SubtaskSpec;
use crate::logscan::LogScanner;
use crate::task::layout::TaskLayout;
use crate::task::result::SubtaskResult;

const MB: u64 = 1024 * 1024;
/// Time given to output readers after the application has exited.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared, read-only state every subtask of a task needs.
pub struct SubtaskContext<'a> {
    pub settings: &'a StarterSettings,
    pub layout: &'a TaskLayout,
    pub table: &'a Arc<ExitCodeTable>,
    pub cancel: &'a CancelToken,
    pub cancel_file: Option<&'a Path>,
    pub task_name: &'a str,
    pub scanner: Option<&'a LogScanner>,
}

pub struct SubtaskRun {
    pub exit_code: ExitCode,
    pub result: SubtaskResult,
}

fn subtask_env(
    ctx: &SubtaskContext,
    spec: &SubtaskSpec,
    index: usize,
    log_dir: &Path,
) -> BTreeMap<String, String> {
    let mut env = spec.env.clone();
    let path = |path: &Path| path.display().to_string();
    env.insert(STARTER_TASK_NAME.to_string(), ctx.task_name.to_string());
    env.insert(STARTER_SUBTASK_INDEX.to_string(), index.to_string());
    env.insert(STARTER_LOG_DIR.to_string(), path(log_dir));
    env.insert(STARTER_DATA_DIR.to_string(), path(ctx.layout.data_dir()));
    env.insert(STARTER_TMP_DIR.to_string(), path(ctx.layout.tmp_dir()));
    if let Some(recording) = &spec.recording {
        env.insert(STARTER_RECORDING.to_string(), path(recording));
    }
    env
}

/// Watchdog settings of a subtask: profile defaults, then the subtask's own
/// values, then the command line overrides.
pub fn watchdog_config(ctx: &SubtaskContext, spec: &SubtaskSpec) -> WatchdogConfig {
    let mut config = WatchdogConfig::for_profile(spec.profile());
    config.watch = spec.watch;
    config.watch_time = Duration::try_from_secs_f64(spec.timeout_hours * 3600.0)
        .unwrap_or(nodeguard::watchdog::WATCH_TIME_CEILING);
    if let Some(limit) = spec.memory_limit_mb {
        config.memory_limit = Some(limit * MB);
    }
    if let Some(limit) = spec.virtual_memory_limit_mb {
        config.virtual_memory_limit = Some(limit * MB);
    }
    if let Some(wait) = spec
        .initial_wait_secs
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    {
        config.initial_wait = wait;
    }
    config.disk_path = Some(ctx.layout.root().to_path_buf());
    config.cancel_file = ctx.cancel_file.map(|path| path.to_path_buf());
    ctx.settings.watchdog().apply(&mut config);
    config.normalized()
}

struct Launched {
    process_exit: Option<i32>,
    verdict: Option<String>,
    usage: Option<nodeguard::hwstats::UsageSummary>,
}

fn launch_and_watch(
    ctx: &SubtaskContext,
    spec: &SubtaskSpec,
    name: &str,
    launch: LaunchSpec,
    exit_code: &mut ExitCode,
) -> Launched {
    let mut process = match RunningProcess::spawn(&launch) {
        Ok(process) => process,
        Err(error) => {
            log::error!("Subtask {name} could not be started: {error}");
            exit_code.report_with_detail(ERR_APP_START, error.to_string());
            return Launched {
                process_exit: None,
                verdict: None,
                usage: None,
            };
        }
    };
    log::info!("Subtask {name} started as process {}", process.pid());

    let config = watchdog_config(ctx, spec);
    let system_sampler = || match default_system_sampler() {
        Ok(sampler) => Some(sampler),
        Err(error) => {
            log::warn!("System sampling unavailable: {error}");
            None
        }
    };
    let resource_log = ctx.layout.resource_log(name);
    let watchdog = match Watchdog::new(config.clone(), default_tree_sampler(), system_sampler())
        .with_resource_log(&resource_log)
    {
        Ok(watchdog) => watchdog,
        Err(error) => {
            log::warn!("Cannot write resource log {}: {error}", resource_log.display());
            Watchdog::new(config, default_tree_sampler(), system_sampler())
        }
    };

    let outcome = watchdog.run(&mut process, ctx.cancel);
    for (code, detail) in outcome.exit_codes() {
        exit_code.report_with_detail(code, detail);
    }
    let leftovers = outcome.verdict == Verdict::Exited && process.tree_alive();
    if leftovers {
        log::warn!("Subtask {name} exited but left processes behind, stopping them");
    }
    if outcome.needs_shutdown() || leftovers {
        let shutdown = Canceller::new(ctx.settings.cancel_grace()).shutdown(&mut process);
        log::info!("Subtask {name} shut down: {shutdown:?}");
        if let Some(code) = shutdown.exit_code_name() {
            exit_code.report_with_detail(code, format!("shutdown ended with {shutdown:?}"));
        }
    }
    process.close(CLOSE_TIMEOUT);
    let process_exit = process.exit_code();
    if outcome.verdict == Verdict::Exited {
        if process_exit != Some(0) {
            let tail = process.output_tail();
            if !tail.is_empty() {
                log::warn!(
                    "Subtask {name} ended with {process_exit:?}, last output:\n{}",
                    tail.join("\n")
                );
            }
        }
        exit_code.report_process_exit(process_exit);
    }
    Launched {
        process_exit,
        verdict: Some(format!("{:?}", outcome.verdict)),
        usage: Some(outcome.usage),
    }
}

/// Runs one subtask to completion. Never fails, every problem ends up in the
/// returned exit code.
pub fn run_subtask(ctx: &SubtaskContext, index: usize, spec: &SubtaskSpec) -> SubtaskRun {
    let name = spec.display_name(index);
    let mut exit_code = ExitCode::new(ctx.table.clone());
    let started = Utc::now();
    let mut result = SubtaskResult {
        index,
        name: name.clone(),
        command: String::new(),
        skipped: false,
        code: 0,
        code_name: String::new(),
        state: exit_code.state(),
        process_exit: None,
        verdict: None,
        usage: None,
        resource_log: None,
        started: Some(started),
        finished: None,
    };

    execute(ctx, spec, index, &mut exit_code, &mut result);

    result.code = exit_code.code();
    result.code_name = exit_code.name().to_string();
    result.state = exit_code.state();
    result.finished = Some(Utc::now());
    log::info!(
        "Subtask {name} finished: {} ({}) [{}]",
        exit_code.name(),
        exit_code.code(),
        exit_code.state()
    );
    SubtaskRun { exit_code, result }
}

fn execute(
    ctx: &SubtaskContext,
    spec: &SubtaskSpec,
    index: usize,
    exit_code: &mut ExitCode,
    result: &mut SubtaskResult,
) {
    let name = result.name.clone();
    let log_dir = ctx.layout.subtask_log_dir(index, &name);
    let cwd = spec.resolve_cwd(ctx.layout.root());
    if let Err(error) = ensure_dir(&log_dir).and_then(|_| ensure_dir(&cwd)) {
        log::error!("Folders of subtask {name} cannot be created: {error}");
        exit_code.report_with_detail(ERR_FOLDER_CREATION, error.to_string());
        return;
    }

    let launch = match prepare_launch(ctx, spec, index, &name, &log_dir, &cwd) {
        Ok(launch) => launch,
        Err(error) => {
            log::error!("Subtask {name} cannot be prepared: {error}");
            exit_code.report_with_detail(ERR_SCRIPT_MALFUNCTION, error.to_string());
            return;
        }
    };
    result.command = launch.display_command();
    if ctx.settings.dry_run() {
        log::info!("Dry run, subtask {name} would execute: {}", result.command);
        return;
    }

    log::info!("Starting subtask {name}: {}", result.command);
    let mut wrappers = match WrapperChain::start(
        &spec.wrappers,
        &cwd,
        &launch.env,
        Some(log_dir.clone()),
        ctx.settings.cancel_grace(),
        ctx.cancel,
        ctx.cancel_file,
    ) {
        Ok(wrappers) => wrappers,
        Err(GuardError::Cancelled(detail)) => {
            log::info!("Subtask {name} cancelled while starting wrappers");
            exit_code.report_with_detail(ERR_CANCELED, detail);
            return;
        }
        Err(error) => {
            log::error!("Wrappers of subtask {name} failed: {error}");
            exit_code.report_with_detail(ERR_WRAPPER_FAILED, error.to_string());
            return;
        }
    };
    if ctx.cancel.observe(ctx.cancel_file) {
        log::info!("Subtask {name} cancelled before the application started");
        wrappers.stop();
        exit_code.report_with_detail(ERR_CANCELED, "cancellation requested before start");
        return;
    }
    let launched = launch_and_watch(ctx, spec, &name, launch, exit_code);
    wrappers.stop();

    result.process_exit = launched.process_exit;
    result.verdict = launched.verdict;
    result.usage = launched.usage;
    result.resource_log = Some(ctx.layout.resource_log(&name)).filter(|path| path.is_file());
    scan_logs(ctx, spec, &name, &log_dir, exit_code);
}

fn prepare_launch(
    ctx: &SubtaskContext,
    spec: &SubtaskSpec,
    index: usize,
    name: &str,
    log_dir: &Path,
    cwd: &Path,
) -> crate::Result<LaunchSpec> {
    let mut launch = LaunchSpec::new(spec.command(ctx.layout.root())?, cwd)
        .stdout_log(ctx.layout.stdout_log(name))
        .stderr_log(ctx.layout.stderr_log(name));
    launch.env = subtask_env(ctx, spec, index, log_dir);
    launch.filter = spec.output_filter.as_ref().map(|f| f.compile()).transpose()?;
    launch.fatal_patterns = spec.compile_fatal_patterns()?;
    Ok(launch)
}

fn scan_logs(
    ctx: &SubtaskContext,
    spec: &SubtaskSpec,
    name: &str,
    log_dir: &Path,
    exit_code: &mut ExitCode,
) {
    let Some(scanner) = ctx.scanner.filter(|_| spec.log_scan_enabled()) else {
        return;
    };
    match scanner.scan_dir(log_dir) {
        Ok(report) => report.apply(exit_code),
        Err(error) => log::warn!("Log scan of subtask {name} failed: {error}"),
    }
}
