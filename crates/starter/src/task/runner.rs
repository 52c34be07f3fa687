//! Sequencing of the subtasks of one task.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;

use nodeguard::cancel::CancelToken;
use nodeguard::exitcode::codes::{
    ERR_CANCELED, ERR_DB_WRITE, ERR_FOLDER_CREATION, ERR_SCRIPT_MALFUNCTION, WARN_SUBTASK_SKIPPED,
};
use nodeguard::exitcode::{ExitCode, ExitCodeTable, TaskState};

use crate::common::settings::StarterSettings;
use crate::config::JobConfig;
use crate::logscan::LogScanner;
use crate::store::{ResultStore, write_fallback};
use crate::task::copyback::CopyBack;
use crate::task::layout::TaskLayout;
use crate::task::result::{SubtaskResult, TaskRunResult};
use crate::task::subtask::{SubtaskContext, run_subtask};

/// Loads the exit code table: database first, then a JSON file (command line before
/// job configuration), then the built-in table.
pub fn load_exit_code_table(
    settings: &StarterSettings,
    config: Option<&JobConfig>,
) -> ExitCodeTable {
    if let Some(db) = settings.database().filter(|path| path.is_file()) {
        match ResultStore::open(db).and_then(|store| store.load_exit_codes()) {
            Ok(Some(table)) => {
                log::debug!("Exit code table loaded from {}", db.display());
                return table;
            }
            Ok(None) => {}
            Err(error) => log::warn!("Cannot read exit codes from {}: {error}", db.display()),
        }
    }
    let file = settings
        .exit_code_table()
        .or_else(|| config.and_then(|c| c.exit_code_table.as_deref()));
    if let Some(file) = file {
        match ExitCodeTable::load_json(file) {
            Ok(table) => {
                log::debug!("Exit code table loaded from {}", file.display());
                return table;
            }
            Err(error) => log::warn!("Cannot read exit codes from {}: {error}", file.display()),
        }
    }
    ExitCodeTable::builtin()
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Why a subtask is not executed.
#[derive(Debug)]
enum Skip {
    Cancelled,
    EndOnError,
    SkipOn(String),
}

pub struct TaskRunner<'a> {
    settings: &'a StarterSettings,
    config: &'a JobConfig,
    table: Arc<ExitCodeTable>,
    cancel: CancelToken,
}

impl<'a> TaskRunner<'a> {
    pub fn new(settings: &'a StarterSettings, config: &'a JobConfig, table: ExitCodeTable) -> Self {
        Self {
            settings,
            config,
            table: Arc::new(table),
            cancel: CancelToken::new(),
        }
    }

    /// Shares the token with a signal thread or any other cancellation source.
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Runs the whole task. Every failure, including a failed setup, ends up
    /// classified in the returned result.
    pub fn run(&self) -> TaskRunResult {
        let started = Utc::now();
        let mut exit_code = ExitCode::new(self.table.clone());
        let layout = TaskLayout::new(self.config.task_root());
        log::info!(
            "Starting task {} with {} subtask(s) in {}",
            self.config.task_name,
            self.config.subtasks.len(),
            layout.root().display()
        );

        let subtasks = match self.prepare(&layout) {
            Ok(scanner) => self.run_subtasks(&layout, &scanner, &mut exit_code),
            Err((code, detail)) => {
                log::error!("Task {} cannot start: {detail}", self.config.task_name);
                exit_code.report_with_detail(code, detail);
                Vec::new()
            }
        };

        let copied = self.copy_back(&layout, &mut exit_code);
        if !self.settings.debug() {
            layout.remove_tmp();
        }
        let result = self.persist(&layout, &mut exit_code, subtasks, copied, started);
        log::info!("Task {} finished\n{}", self.config.task_name, exit_code.format_summary());
        result
    }

    fn prepare(&self, layout: &TaskLayout) -> Result<LogScanner, (&'static str, String)> {
        self.config
            .validate(&self.table)
            .map_err(|error| (ERR_SCRIPT_MALFUNCTION, error.to_string()))?;
        layout
            .create()
            .map_err(|error| (ERR_FOLDER_CREATION, error.to_string()))?;
        self.config
            .log_scan
            .compile()
            .map_err(|error| (ERR_SCRIPT_MALFUNCTION, error.to_string()))
    }

    fn run_subtasks(
        &self,
        layout: &TaskLayout,
        scanner: &LogScanner,
        exit_code: &mut ExitCode,
    ) -> Vec<SubtaskResult> {
        let ctx = SubtaskContext {
            settings: self.settings,
            layout,
            table: &self.table,
            cancel: &self.cancel,
            cancel_file: self.config.cancel_file.as_deref(),
            task_name: &self.config.task_name,
            scanner: Some(scanner),
        };
        let mut results = Vec::with_capacity(self.config.subtasks.len());
        let mut previous: Option<String> = None;
        let mut pending_skips: u32 = 0;

        for (index, spec) in self.config.subtasks.iter().enumerate() {
            let name = spec.display_name(index);
            let skip = if self.cancel.is_requested() || exit_code.state() == TaskState::Canceled {
                Some(Skip::Cancelled)
            } else if self.config.end_on_error && exit_code.state() == TaskState::Failed {
                Some(Skip::EndOnError)
            } else {
                let triggered = previous
                    .as_ref()
                    .filter(|code| pending_skips == 0 && spec.skip_on.contains(code));
                if let Some(code) = triggered {
                    pending_skips = spec.skip_count();
                    log::debug!("Previous subtask ended with {code}, skipping {pending_skips} subtask(s)");
                }
                if pending_skips > 0 {
                    pending_skips -= 1;
                    previous.clone().map(Skip::SkipOn)
                } else {
                    None
                }
            };

            if let Some(skip) = skip {
                let mut skipped = ExitCode::new(self.table.clone());
                match &skip {
                    Skip::Cancelled => {
                        if exit_code.state() != TaskState::Canceled {
                            skipped.report_with_detail(
                                ERR_CANCELED,
                                "cancellation requested before start",
                            );
                        }
                    }
                    Skip::EndOnError => {
                        skipped
                            .report_with_detail(WARN_SUBTASK_SKIPPED, "an earlier subtask failed");
                    }
                    Skip::SkipOn(code) => {
                        skipped.report_with_detail(
                            WARN_SUBTASK_SKIPPED,
                            format!("previous subtask ended with {code}"),
                        );
                    }
                }
                log::info!("Skipping subtask {name}: {skip:?}");
                exit_code.merge(&skipped, &name);
                let command = spec
                    .command(layout.root())
                    .map(|args| args.join(" "))
                    .unwrap_or_default();
                results.push(SubtaskResult::skipped(index, name, command, &skipped));
                continue;
            }

            let run = catch_unwind(AssertUnwindSafe(|| run_subtask(&ctx, index, spec)));
            let (subtask_code, result) = match run {
                Ok(run) => (run.exit_code, run.result),
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    log::error!("Subtask {name} panicked: {message}");
                    let mut code = ExitCode::new(self.table.clone());
                    code.report_with_detail(ERR_SCRIPT_MALFUNCTION, format!("panic: {message}"));
                    let mut result =
                        SubtaskResult::skipped(index, name.clone(), String::new(), &code);
                    result.skipped = false;
                    (code, result)
                }
            };
            exit_code.merge(&subtask_code, &name);
            previous = Some(subtask_code.name().to_string());
            results.push(result);
        }
        results
    }

    fn copy_back(&self, layout: &TaskLayout, exit_code: &mut ExitCode) -> u64 {
        let Some(result_dir) = &self.config.result_dir else {
            return 0;
        };
        if self.settings.dry_run() || !layout.root().is_dir() {
            return 0;
        }
        let extra: Vec<PathBuf> = self
            .config
            .subtasks
            .iter()
            .flat_map(|spec| spec.copy_back.iter().cloned())
            .collect();
        CopyBack::new(
            layout,
            result_dir,
            &self.config.task_name,
            self.config.copy_back_retries,
        )
        .run(&extra, exit_code)
    }

    /// Writes the result to the database. Without a database, or when writing fails,
    /// the result goes to `result.json` in the copied (or local) log folder.
    fn persist(
        &self,
        layout: &TaskLayout,
        exit_code: &mut ExitCode,
        subtasks: Vec<SubtaskResult>,
        copied: u64,
        started: chrono::DateTime<Utc>,
    ) -> TaskRunResult {
        let task_name = &self.config.task_name;
        if self.settings.dry_run() {
            return TaskRunResult::new(task_name, exit_code, subtasks, copied, started);
        }
        if let Some(db) = self.settings.database() {
            let result =
                TaskRunResult::new(task_name, exit_code, subtasks.clone(), copied, started);
            match ResultStore::open(db).and_then(|mut store| store.save(&result)) {
                Ok(_) => {
                    log::info!("Result of task {task_name} written to {}", db.display());
                    return result;
                }
                Err(error) => {
                    log::error!("Cannot write result to {}: {error}", db.display());
                    exit_code.report_with_detail(ERR_DB_WRITE, error.to_string());
                }
            }
        }

        let result = TaskRunResult::new(task_name, exit_code, subtasks, copied, started);
        let log_dir = self
            .config
            .result_dir
            .as_ref()
            .map(|dir| dir.join(task_name).join("log"))
            .filter(|dir| dir.is_dir())
            .unwrap_or_else(|| layout.log_dir().to_path_buf());
        if !log_dir.is_dir() {
            log::error!("No folder to write the result of task {task_name} to");
            return result;
        }
        match write_fallback(&result, &log_dir) {
            Ok(path) => log::info!("Result of task {task_name} written to {}", path.display()),
            Err(error) => log::error!("Cannot write result to {}: {error}", log_dir.display()),
        }
        result
    }
}
