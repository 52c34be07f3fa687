use std::path::{Path, PathBuf};
use std::time::Duration;

use derive_builder::Builder;

use nodeguard::exitcode::ExitCodeTable;
use nodeguard::filter::WatchFlags;
use nodeguard::launcher::WrapperSpec;
use nodeguard::watchdog::MIN_CYCLE;

use crate::common::settings::{StarterSettings, WatchdogOverrides};
use crate::config::{JobConfig, LaunchKind, SubtaskSpec};
use crate::logscan::LogScanConfig;
use crate::task::{TaskRunResult, TaskRunner};

#[derive(Builder, Clone)]
#[builder(pattern = "owned")]
pub struct SubtaskConfig {
    #[builder(default, setter(into))]
    name: String,
    /// Shell script executed with `sh -c`.
    #[builder(default = "\"true\".to_string()", setter(into))]
    script: String,
    #[builder(default)]
    args: Option<Vec<String>>,
    #[builder(default)]
    kind: LaunchKind,
    #[builder(default)]
    watch: WatchFlags,
    #[builder(default = "12.0")]
    timeout_hours: f64,
    #[builder(default)]
    skip_on: Vec<String>,
    #[builder(default)]
    skip_count: Option<u32>,
    #[builder(default)]
    wrappers: Vec<WrapperSpec>,
    #[builder(default)]
    fatal_patterns: Vec<String>,
    #[builder(default)]
    copy_back: Vec<PathBuf>,
    #[builder(default)]
    log_scan: Option<bool>,
}

impl From<SubtaskConfig> for SubtaskSpec {
    fn from(config: SubtaskConfig) -> Self {
        let SubtaskConfig {
            name,
            script,
            args,
            kind,
            watch,
            timeout_hours,
            skip_on,
            skip_count,
            wrappers,
            fatal_patterns,
            copy_back,
            log_scan,
        } = config;
        SubtaskSpec {
            name,
            kind,
            args: args.unwrap_or_else(|| vec!["sh".to_string(), "-c".to_string(), script]),
            watch,
            timeout_hours,
            skip_on,
            skip_count,
            wrappers,
            fatal_patterns,
            copy_back,
            log_scan,
            ..Default::default()
        }
    }
}

pub fn subtask(name: &str, script: &str) -> SubtaskConfigBuilder {
    SubtaskConfigBuilder::default().name(name).script(script)
}

/// Temporary work and result folders of one test task.
pub struct TestEnv {
    pub dir: tempfile::TempDir,
}

impl TestEnv {
    pub fn new() -> Self {
        init_logging();
        Self {
            dir: tempfile::TempDir::new().unwrap(),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn work_dir(&self) -> PathBuf {
        self.path().join("work")
    }

    pub fn result_dir(&self) -> PathBuf {
        self.path().join("results")
    }

    /// Task folder after the copy-back.
    pub fn copied(&self, path: &str) -> PathBuf {
        self.result_dir().join("t1").join(path)
    }

    pub fn job(&self, subtasks: Vec<SubtaskConfigBuilder>) -> JobConfig {
        JobConfig {
            task_name: "t1".to_string(),
            work_dir: self.work_dir(),
            result_dir: Some(self.result_dir()),
            end_on_error: false,
            cancel_file: None,
            exit_code_table: None,
            log_scan: LogScanConfig::default(),
            copy_back_retries: 0,
            subtasks: subtasks
                .into_iter()
                .map(|builder| builder.build().unwrap().into())
                .collect(),
        }
    }
}

/// Settings with the shortest possible watchdog timings.
pub fn fast_settings() -> StarterSettings {
    StarterSettings::default()
        .with_cancel_grace(Duration::from_secs(3))
        .with_watchdog(WatchdogOverrides {
            cycle: Some(MIN_CYCLE),
            initial_wait: Some(MIN_CYCLE),
            filter: None,
        })
}

pub fn run(settings: &StarterSettings, config: &JobConfig) -> TaskRunResult {
    TaskRunner::new(settings, config, ExitCodeTable::builtin()).run()
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
