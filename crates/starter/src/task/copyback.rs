use std::path::{Path, PathBuf};
use std::time::Duration;

use nodeguard::exitcode::ExitCode;
use nodeguard::exitcode::codes::{ERR_COPY_BACK, WARN_COPY_RETRY};

use crate::common::utils::fs::copy_tree;
use crate::task::layout::TaskLayout;

pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Copies the log and data folders of a task, plus `extra` paths relative to the task
/// folder, into `<result_dir>/<task name>`.
pub struct CopyBack<'a> {
    layout: &'a TaskLayout,
    target: PathBuf,
    retries: u32,
    retry_delay: Duration,
}

impl<'a> CopyBack<'a> {
    pub fn new(layout: &'a TaskLayout, result_dir: &Path, task_name: &str, retries: u32) -> Self {
        Self {
            layout,
            target: result_dir.join(task_name),
            retries,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    fn copy_with_retries(&self, source: &Path, target: &Path) -> Result<(u64, u32), String> {
        let mut attempt = 0;
        loop {
            match copy_tree(source, target) {
                Ok(files) => return Ok((files, attempt)),
                Err(error) if attempt < self.retries => {
                    attempt += 1;
                    log::warn!(
                        "Copying {} failed ({error}), retry {attempt}/{}",
                        source.display(),
                        self.retries
                    );
                    std::thread::sleep(self.retry_delay);
                }
                Err(error) => return Err(error.to_string()),
            }
        }
    }

    /// Runs the copy. Failures are reported into `exit_code`, the number of copied
    /// files is returned.
    pub fn run(&self, extra: &[PathBuf], exit_code: &mut ExitCode) -> u64 {
        let mut sources: Vec<PathBuf> = vec![
            self.layout.log_dir().to_path_buf(),
            self.layout.data_dir().to_path_buf(),
        ];
        for path in extra {
            let source = self.layout.root().join(path);
            if !sources.contains(&source) {
                sources.push(source);
            }
        }

        let mut copied = 0;
        for source in sources {
            let Ok(relative) = source.strip_prefix(self.layout.root()) else {
                continue;
            };
            if !source.exists() {
                if relative != Path::new("log") && relative != Path::new("data") {
                    exit_code.report_with_detail(
                        ERR_COPY_BACK,
                        format!("{} does not exist", source.display()),
                    );
                }
                continue;
            }
            match self.copy_with_retries(&source, &self.target.join(relative)) {
                Ok((files, retries)) => {
                    copied += files;
                    if retries > 0 {
                        exit_code.report_with_detail(
                            WARN_COPY_RETRY,
                            format!("{} copied after {retries} retries", source.display()),
                        );
                    }
                }
                Err(error) => {
                    log::error!("Copy-back of {} failed: {error}", source.display());
                    exit_code.report_with_detail(
                        ERR_COPY_BACK,
                        format!("{}: {error}", source.display()),
                    );
                }
            }
        }
        log::info!("Copied {copied} file(s) to {}", self.target.display());
        copied
    }
}
