use std::path::Path;

use anyhow::Context;
use clap::{CommandFactory, FromArgMatches};

use starter::common::cli::{CheckOpts, CommonOpts, ReportOpts, RootOptions, RunOpts, SubCommand};
use starter::common::settings::{StarterSettings, WatchdogOverrides};
use starter::common::setup::setup_logging;
use starter::common::utils::fs::absolute_path;
use starter::config::JobConfig;
use starter::nodeguard::cancel::CancelToken;
use starter::nodeguard::filter::FilterConfig;
use starter::nodeguard::signal::SignalThread;
use starter::store::ResultStore;
use starter::task::subtask::{SubtaskContext, watchdog_config};
use starter::task::{TaskRunResult, TaskRunner, load_exit_code_table};

fn make_settings(common: &CommonOpts) -> StarterSettings {
    StarterSettings::new(common.verbose, common.debug)
        .with_database(common.db.clone())
        .with_exit_code_table(common.exit_codes.clone())
}

fn load_job(path: &Path) -> anyhow::Result<JobConfig> {
    let path = absolute_path(path.to_path_buf())?;
    JobConfig::load(&path).with_context(|| format!("Cannot load job {}", path.display()))
}

/// Maps the final exit code onto a process exit status.
fn exit_status(code: i32) -> i32 {
    code.clamp(0, 255)
}

fn print_result(result: &TaskRunResult) {
    println!(
        "Task {}: {} ({}) - {} [{}]",
        result.task_name, result.code, result.code_name, result.description, result.state
    );
    if let Some(warning) = &result.warning {
        println!("Warning: {warning}");
    }
    for subtask in &result.subtasks {
        let status = if subtask.skipped { "skipped" } else { "ran" };
        println!(
            "  #{} {:<20} {:<8} {} ({})",
            subtask.index, subtask.name, status, subtask.code_name, subtask.code
        );
    }
    if !result.history.is_empty() {
        println!("History:");
    }
    for entry in &result.history {
        println!(
            "  {} {:>4} {}{}{}",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            entry.code,
            entry.name,
            entry
                .source
                .as_ref()
                .map(|source| format!(" [{source}]"))
                .unwrap_or_default(),
            entry
                .detail
                .as_ref()
                .map(|detail| format!(": {detail}"))
                .unwrap_or_default(),
        );
    }
}

// Commands

fn command_run(settings: StarterSettings, opts: RunOpts) -> anyhow::Result<i32> {
    let filter = opts
        .filter_config
        .as_deref()
        .map(|path| -> anyhow::Result<FilterConfig> {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Cannot read {}", path.display()))?;
            Ok(serde_json::from_str(&content)?)
        })
        .transpose()?;
    let settings = settings
        .with_dry_run(opts.dry_run)
        .with_cancel_grace(*opts.cancel_grace)
        .with_watchdog(WatchdogOverrides {
            cycle: opts.cycle.map(Into::into),
            initial_wait: opts.initial_wait.map(Into::into),
            filter,
        });

    let config = load_job(&opts.job)?;
    let table = load_exit_code_table(&settings, Some(&config));
    let token = CancelToken::new();
    let _signals = SignalThread::spawn(token.clone()).context("Cannot install signal handlers")?;

    let result = TaskRunner::new(&settings, &config, table)
        .with_cancel_token(token)
        .run();
    print_result(&result);
    Ok(exit_status(result.code))
}

fn command_check(settings: StarterSettings, opts: CheckOpts) -> anyhow::Result<i32> {
    let config = load_job(&opts.job)?;
    let table = std::sync::Arc::new(load_exit_code_table(&settings, Some(&config)));
    config.validate(&table)?;

    let layout = starter::task::layout::TaskLayout::new(config.task_root());
    let token = CancelToken::new();
    let ctx = SubtaskContext {
        settings: &settings,
        layout: &layout,
        table: &table,
        cancel: &token,
        cancel_file: config.cancel_file.as_deref(),
        task_name: &config.task_name,
        scanner: None,
    };
    println!("Task {} in {}", config.task_name, layout.root().display());
    for (index, spec) in config.subtasks.iter().enumerate() {
        let watchdog = watchdog_config(&ctx, spec);
        println!("#{index} {} ({:?})", spec.display_name(index), spec.kind);
        println!("  command:      {}", spec.command(layout.root())?.join(" "));
        println!("  cwd:          {}", spec.resolve_cwd(layout.root()).display());
        println!(
            "  watchdog:     cycle {:?}, initial wait {:?}, watch time {:?}",
            watchdog.cycle, watchdog.initial_wait, watchdog.watch_time
        );
        println!(
            "  watches:      cpu {}, io {}, print {}",
            spec.watch.cpu, spec.watch.io, spec.watch.print
        );
        if !spec.wrappers.is_empty() {
            let names: Vec<&str> = spec.wrappers.iter().map(|w| w.name.as_str()).collect();
            println!("  wrappers:     {}", names.join(", "));
        }
        if !spec.skip_on.is_empty() {
            println!(
                "  skip on:      {} (count {})",
                spec.skip_on.join(", "),
                spec.skip_count()
            );
        }
        println!("  log scan:     {}", spec.log_scan_enabled());
    }
    Ok(0)
}

fn command_exit_codes(settings: StarterSettings) -> anyhow::Result<i32> {
    let table = load_exit_code_table(&settings, None);
    println!("{:>5} {:>10}  {:<26} {:<15} DESCRIPTION", "CODE", "PRIORITY", "NAME", "CATEGORY");
    for info in table.entries_by_priority() {
        println!(
            "{:>5} {:>10}  {:<26} {:<15} {}{}",
            info.code,
            info.priority,
            info.name,
            info.category.to_string(),
            info.description,
            if info.unfailing { " (unfailing)" } else { "" }
        );
    }
    Ok(0)
}

fn command_report(settings: StarterSettings, opts: ReportOpts) -> anyhow::Result<i32> {
    let db = settings
        .database()
        .context("The report command needs a database (--db or STARTER_DB)")?;
    let store = ResultStore::open(db).with_context(|| format!("Cannot open {}", db.display()))?;
    match store.load(&opts.task)? {
        Some(result) => {
            print_result(&result);
            Ok(0)
        }
        None => anyhow::bail!("No result stored for task {}", opts.task),
    }
}

fn main() -> anyhow::Result<()> {
    let matches = RootOptions::command().get_matches();
    let top_opts = match RootOptions::from_arg_matches(&matches) {
        Ok(opts) => opts,
        Err(error) => error.exit(),
    };

    setup_logging(top_opts.common.verbose);

    let settings = make_settings(&top_opts.common);

    let result = match top_opts.subcmd {
        SubCommand::Run(opts) => command_run(settings, opts),
        SubCommand::Check(opts) => command_check(settings, opts),
        SubCommand::ExitCodes => command_exit_codes(settings),
        SubCommand::Report(opts) => command_report(settings, opts),
    };

    match result {
        Ok(0) => Ok(()),
        Ok(status) => std::process::exit(status),
        Err(error) => {
            log::error!("{error:?}");
            std::process::exit(1);
        }
    }
}
