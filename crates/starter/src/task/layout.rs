use std::path::{Path, PathBuf};

use crate::common::utils::fs::ensure_dir;

/// Folders of one task below `<work_dir>/<task_name>`.
///
/// `log` and `data` are copied back to durable storage, `tmp` is removed at the end
/// unless the starter runs in debug mode.
#[derive(Debug, Clone)]
pub struct TaskLayout {
    root: PathBuf,
    log: PathBuf,
    data: PathBuf,
    tmp: PathBuf,
}

impl TaskLayout {
    pub fn new(root: PathBuf) -> Self {
        Self {
            log: root.join("log"),
            data: root.join("data"),
            tmp: root.join("tmp"),
            root,
        }
    }

    pub fn create(&self) -> crate::Result<()> {
        for dir in [&self.root, &self.log, &self.data, &self.tmp] {
            ensure_dir(dir)?;
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn log_dir(&self) -> &Path {
        &self.log
    }

    pub fn data_dir(&self) -> &Path {
        &self.data
    }

    pub fn tmp_dir(&self) -> &Path {
        &self.tmp
    }

    /// Folder receiving the application logs and wrapper logs of one subtask.
    pub fn subtask_log_dir(&self, index: usize, name: &str) -> PathBuf {
        self.log.join(format!("{index:02}_{name}"))
    }

    pub fn stdout_log(&self, name: &str) -> PathBuf {
        self.log.join(format!("{name}_stdout.log"))
    }

    pub fn stderr_log(&self, name: &str) -> PathBuf {
        self.log.join(format!("{name}_stderr.log"))
    }

    pub fn resource_log(&self, name: &str) -> PathBuf {
        self.log.join(format!("{name}_resources.csv"))
    }

    pub fn remove_tmp(&self) {
        if let Err(error) = std::fs::remove_dir_all(&self.tmp) {
            if error.kind() != std::io::ErrorKind::NotFound {
                log::warn!("Cannot remove {}: {error}", self.tmp.display());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_paths() {
        let layout = TaskLayout::new(PathBuf::from("/w/task"));
        assert_eq!(layout.subtask_log_dir(3, "sim"), PathBuf::from("/w/task/log/03_sim"));
        assert_eq!(layout.stdout_log("sim"), PathBuf::from("/w/task/log/sim_stdout.log"));
        assert_eq!(layout.stderr_log("sim"), PathBuf::from("/w/task/log/sim_stderr.log"));
    }

    #[test]
    fn test_create_and_remove_tmp() {
        let dir = tempfile::TempDir::new().unwrap();
        let layout = TaskLayout::new(dir.path().join("t1"));
        layout.create().unwrap();
        assert!(layout.data_dir().is_dir());
        assert!(layout.tmp_dir().is_dir());
        layout.remove_tmp();
        assert!(!layout.tmp_dir().exists());
        layout.remove_tmp();
    }

    #[test]
    fn test_create_fails_below_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("file");
        std::fs::write(&file, "").unwrap();
        assert!(TaskLayout::new(file.join("t1")).create().is_err());
    }
}
