use std::fmt::{Display, Formatter};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::Map;
use crate::common::error::GuardError;
use crate::exitcode::codes::*;

/// Broad family of an exit code. Decides how a winning code maps to a task state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Success,
    Infrastructure,
    Watchdog,
    Application,
    LogFinding,
    Cancellation,
    Warning,
}

impl Display for Category {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Category::Success => "success",
            Category::Infrastructure => "infrastructure",
            Category::Watchdog => "watchdog",
            Category::Application => "application",
            Category::LogFinding => "log finding",
            Category::Cancellation => "cancellation",
            Category::Warning => "warning",
        };
        f.write_str(name)
    }
}

/// One row of the exit-code table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitCodeInfo {
    pub name: String,
    pub code: i32,
    /// Lower number means more severe.
    pub priority: u32,
    pub description: String,
    pub category: Category,
    /// Unfailing codes are tracked as warnings and never fail a task.
    #[serde(default)]
    pub unfailing: bool,
}

impl ExitCodeInfo {
    fn new(
        name: &str,
        code: i32,
        priority: u32,
        category: Category,
        unfailing: bool,
        description: &str,
    ) -> Self {
        Self {
            name: name.to_string(),
            code,
            priority,
            description: description.to_string(),
            category,
            unfailing,
        }
    }
}

/// Read-only mapping of exit codes to their priority and description.
#[derive(Debug, Clone)]
pub struct ExitCodeTable {
    entries: Vec<ExitCodeInfo>,
    by_name: Map<String, usize>,
    by_code: Map<i32, usize>,
}

/// Codes the runtime itself reports; a loaded table is completed with these
/// when it does not define them.
const REQUIRED: &[&str] = &[
    ERR_OK,
    ERR_SCRIPT_MALFUNCTION,
    ERR_FOLDER_CREATION,
    ERR_COPY_BACK,
    ERR_DB_WRITE,
    ERR_DISK_FULL,
    ERR_CPU_IDLE,
    ERR_IO_IDLE,
    ERR_PRINT_IDLE,
    ERR_TIMEOUT,
    ERR_MEMORY_LIMIT,
    ERR_VIRTUAL_MEMORY_LIMIT,
    ERR_FORCED_TERMINATION,
    ERR_APP_START,
    ERR_WRAPPER_FAILED,
    ERR_APP_EXIT,
    ERR_FATAL_OUTPUT,
    ERR_CANCELED,
    WARN_DISK_SPACE,
    WARN_SUBTASK_SKIPPED,
    WARN_COPY_RETRY,
];

fn builtin_entries() -> Vec<ExitCodeInfo> {
    use Category::*;
    vec![
        ExitCodeInfo::new(ERR_OK, 0, u32::MAX, Success, false, "Task finished successfully"),
        ExitCodeInfo::new(ERR_CANCELED, 501, 5, Cancellation, false, "Task canceled by user or signal"),
        ExitCodeInfo::new(ERR_SCRIPT_MALFUNCTION, 1, 10, Infrastructure, false, "Starter malfunction"),
        ExitCodeInfo::new(ERR_APP_START, 301, 15, Application, false, "Application could not be started"),
        ExitCodeInfo::new(ERR_WRAPPER_FAILED, 302, 16, Application, false, "Wrapper executable failed"),
        ExitCodeInfo::new(ERR_FOLDER_CREATION, 101, 20, Infrastructure, false, "Task folder could not be created"),
        ExitCodeInfo::new(ERR_MTS_CRASH, 401, 22, LogFinding, false, "MTS crash found in log"),
        ExitCodeInfo::new(ERR_DISK_FULL, 104, 25, Infrastructure, false, "Disk usage above error threshold"),
        ExitCodeInfo::new(ERR_FATAL_OUTPUT, 304, 27, Application, false, "Fatal message in application output"),
        ExitCodeInfo::new(ERR_MEMORY_LIMIT, 205, 28, Watchdog, false, "Memory ceiling exceeded"),
        ExitCodeInfo::new(ERR_VIRTUAL_MEMORY_LIMIT, 206, 29, Watchdog, false, "Virtual memory ceiling exceeded"),
        ExitCodeInfo::new(ERR_TIMEOUT, 204, 30, Watchdog, false, "Watch time exceeded"),
        ExitCodeInfo::new(ERR_CPU_IDLE, 201, 32, Watchdog, false, "Application CPU idle"),
        ExitCodeInfo::new(ERR_IO_IDLE, 202, 33, Watchdog, false, "Application I/O idle"),
        ExitCodeInfo::new(ERR_PRINT_IDLE, 203, 34, Watchdog, false, "Application stopped printing output"),
        ExitCodeInfo::new(ERR_MTS_EXCEPTION, 402, 35, LogFinding, false, "MTS exception found in log"),
        ExitCodeInfo::new(ERR_COPY_BACK, 102, 40, Infrastructure, false, "Result copy-back failed"),
        ExitCodeInfo::new(ERR_MTS_RECORDING, 404, 44, LogFinding, false, "MTS could not read the recording"),
        ExitCodeInfo::new(ERR_MTS_ERROR, 403, 45, LogFinding, false, "MTS error found in log"),
        ExitCodeInfo::new(ERR_MTS_SYNC, 405, 46, LogFinding, false, "MTS signal synchronization error"),
        ExitCodeInfo::new(ERR_FORCED_TERMINATION, 502, 48, Watchdog, false, "Application had to be terminated forcefully"),
        ExitCodeInfo::new(ERR_APP_EXIT, 303, 50, Application, false, "Application exited with a non-zero code"),
        ExitCodeInfo::new(ERR_DB_WRITE, 103, 60, Infrastructure, false, "Result could not be written to the database"),
        ExitCodeInfo::new(WARN_DISK_SPACE, 901, 900, Warning, true, "Disk usage above warning threshold"),
        ExitCodeInfo::new(WARN_MTS_WARNING, 902, 910, Warning, true, "MTS warning found in log"),
        ExitCodeInfo::new(WARN_SUBTASK_SKIPPED, 903, 920, Warning, true, "Subtask skipped"),
        ExitCodeInfo::new(WARN_COPY_RETRY, 904, 930, Warning, true, "Copy-back needed a retry"),
    ]
}

impl ExitCodeTable {
    /// Table used when neither the database nor a table file provides one.
    pub fn builtin() -> Self {
        // The built-in entries are unique and complete.
        Self::index(builtin_entries())
    }

    /// Builds a table from externally loaded rows.
    ///
    /// Names and codes have to be unique. Codes the runtime needs are taken from the
    /// built-in table when missing, and `ERR_OK` is always forced to the lowest priority.
    pub fn from_entries(mut entries: Vec<ExitCodeInfo>) -> crate::Result<Self> {
        {
            let mut names = crate::Set::default();
            let mut codes = crate::Set::default();
            for entry in &entries {
                if !names.insert(entry.name.as_str()) {
                    return Err(GuardError::InvalidTable(format!(
                        "duplicate name `{}`",
                        entry.name
                    )));
                }
                if !codes.insert(entry.code) {
                    return Err(GuardError::InvalidTable(format!(
                        "duplicate code {} (`{}`)",
                        entry.code, entry.name
                    )));
                }
            }
        }

        for builtin in builtin_entries() {
            if REQUIRED.contains(&builtin.name.as_str())
                && !entries.iter().any(|e| e.name == builtin.name)
            {
                if entries.iter().any(|e| e.code == builtin.code) {
                    return Err(GuardError::InvalidTable(format!(
                        "code {} is taken, but required code `{}` is missing",
                        builtin.code, builtin.name
                    )));
                }
                log::debug!("Exit code `{}` missing in table, using built-in", builtin.name);
                entries.push(builtin);
            }
        }

        for entry in entries.iter_mut() {
            if entry.name == ERR_OK {
                entry.priority = u32::MAX;
                entry.unfailing = false;
            } else if entry.priority == u32::MAX {
                entry.priority = u32::MAX - 1;
            }
        }
        Ok(Self::index(entries))
    }

    /// Loads a JSON array of [`ExitCodeInfo`] rows.
    pub fn load_json(path: &Path) -> crate::Result<Self> {
        let file = std::fs::File::open(path)?;
        let entries: Vec<ExitCodeInfo> = serde_json::from_reader(std::io::BufReader::new(file))?;
        log::debug!(
            "Loaded {} exit codes from {}",
            entries.len(),
            path.display()
        );
        Self::from_entries(entries)
    }

    fn index(entries: Vec<ExitCodeInfo>) -> Self {
        let mut by_name = Map::default();
        let mut by_code = Map::default();
        for (index, entry) in entries.iter().enumerate() {
            by_name.insert(entry.name.clone(), index);
            by_code.insert(entry.code, index);
        }
        Self {
            entries,
            by_name,
            by_code,
        }
    }

    pub fn get(&self, name: &str) -> Option<&ExitCodeInfo> {
        self.index_of(name).map(|i| &self.entries[i])
    }

    pub fn by_code(&self, code: i32) -> Option<&ExitCodeInfo> {
        self.by_code.get(&code).map(|i| &self.entries[*i])
    }

    pub(crate) fn index_of(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    pub(crate) fn at(&self, index: usize) -> &ExitCodeInfo {
        &self.entries[index]
    }

    /// Entries sorted by priority, most severe first.
    pub fn entries_by_priority(&self) -> Vec<&ExitCodeInfo> {
        let mut entries: Vec<_> = self.entries.iter().collect();
        entries.sort_by_key(|e| (e.priority, e.code));
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, code: i32, priority: u32) -> ExitCodeInfo {
        ExitCodeInfo::new(name, code, priority, Category::Application, false, "test")
    }

    #[test]
    fn test_builtin_ok_has_lowest_priority() {
        let table = ExitCodeTable::builtin();
        let ok = table.get(ERR_OK).unwrap();
        assert!(table.entries_by_priority().iter().all(|e| e.priority <= ok.priority));
        assert_eq!(table.entries_by_priority().last().unwrap().name, ERR_OK);
    }

    #[test]
    fn test_builtin_lookup_by_code() {
        let table = ExitCodeTable::builtin();
        assert_eq!(table.by_code(204).unwrap().name, ERR_TIMEOUT);
        assert!(table.by_code(12345).is_none());
    }

    #[test]
    fn test_from_entries_forces_ok_priority() {
        let table = ExitCodeTable::from_entries(vec![entry(ERR_OK, 0, 1), entry("ERR_X", 7, 1)])
            .unwrap();
        assert_eq!(table.get(ERR_OK).unwrap().priority, u32::MAX);
        assert_eq!(table.get("ERR_X").unwrap().priority, 1);
    }

    #[test]
    fn test_from_entries_completes_required_codes() {
        let table = ExitCodeTable::from_entries(vec![entry("ERR_CUSTOM", 77, 3)]).unwrap();
        for name in REQUIRED {
            assert!(table.get(name).is_some(), "{name} is missing");
        }
        assert_eq!(table.get("ERR_CUSTOM").unwrap().code, 77);
    }

    #[test]
    fn test_from_entries_rejects_duplicates() {
        assert!(matches!(
            ExitCodeTable::from_entries(vec![entry("A", 7, 1), entry("A", 8, 1)]),
            Err(GuardError::InvalidTable(_))
        ));
        assert!(matches!(
            ExitCodeTable::from_entries(vec![entry("A", 7, 1), entry("B", 7, 1)]),
            Err(GuardError::InvalidTable(_))
        ));
    }

    #[test]
    fn test_from_entries_rejects_taken_required_code() {
        // 204 belongs to the required ERR_TIMEOUT
        assert!(ExitCodeTable::from_entries(vec![entry("ERR_MINE", 204, 1)]).is_err());
    }

    #[test]
    fn test_load_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("codes.json");
        std::fs::write(
            &path,
            r#"[{"name": "ERR_OK", "code": 0, "priority": 3, "description": "ok", "category": "success"},
                {"name": "WARN_NOTE", "code": 950, "priority": 999, "description": "note",
                 "category": "warning", "unfailing": true}]"#,
        )
        .unwrap();
        let table = ExitCodeTable::load_json(&path).unwrap();
        assert_eq!(table.get(ERR_OK).unwrap().priority, u32::MAX);
        assert!(table.get("WARN_NOTE").unwrap().unfailing);
    }
}
