use std::path::{Path, PathBuf};
use std::time::Duration;

use nodeguard::cancel::DEFAULT_GRACE_PERIOD;
use nodeguard::filter::FilterConfig;
use nodeguard::watchdog::WatchdogConfig;

/// Watchdog values given on the command line, applied on top of the profile
/// defaults of every subtask.
#[derive(Debug, Clone, Default)]
pub struct WatchdogOverrides {
    pub cycle: Option<Duration>,
    pub initial_wait: Option<Duration>,
    pub filter: Option<FilterConfig>,
}

impl WatchdogOverrides {
    pub fn apply(&self, config: &mut WatchdogConfig) {
        if let Some(cycle) = self.cycle {
            config.cycle = cycle;
        }
        if let Some(initial_wait) = self.initial_wait {
            config.initial_wait = initial_wait;
        }
        if let Some(filter) = &self.filter {
            config.filter = filter.clone();
        }
    }
}

/// Process-wide settings, created once in `main` and passed around by reference.
#[derive(Debug, Clone)]
pub struct StarterSettings {
    verbose: bool,
    /// Keeps the tmp folder of the task.
    debug: bool,
    dry_run: bool,
    database: Option<PathBuf>,
    exit_code_table: Option<PathBuf>,
    cancel_grace: Duration,
    watchdog: WatchdogOverrides,
}

impl Default for StarterSettings {
    fn default() -> Self {
        Self {
            verbose: false,
            debug: false,
            dry_run: false,
            database: None,
            exit_code_table: None,
            cancel_grace: DEFAULT_GRACE_PERIOD,
            watchdog: WatchdogOverrides::default(),
        }
    }
}

impl StarterSettings {
    pub fn new(verbose: bool, debug: bool) -> Self {
        Self {
            verbose,
            debug,
            ..Default::default()
        }
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_database(mut self, database: Option<PathBuf>) -> Self {
        self.database = database;
        self
    }

    pub fn with_exit_code_table(mut self, path: Option<PathBuf>) -> Self {
        self.exit_code_table = path;
        self
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    pub fn with_watchdog(mut self, overrides: WatchdogOverrides) -> Self {
        self.watchdog = overrides;
        self
    }

    pub fn verbose(&self) -> bool {
        self.verbose
    }

    pub fn debug(&self) -> bool {
        self.debug
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn database(&self) -> Option<&Path> {
        self.database.as_deref()
    }

    pub fn exit_code_table(&self) -> Option<&Path> {
        self.exit_code_table.as_deref()
    }

    pub fn cancel_grace(&self) -> Duration {
        self.cancel_grace
    }

    pub fn watchdog(&self) -> &WatchdogOverrides {
        &self.watchdog
    }
}
