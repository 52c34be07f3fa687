//! Names of the exit codes reported by the runtime and the starter.

pub const ERR_OK: &str = "ERR_OK";
pub const ERR_SCRIPT_MALFUNCTION: &str = "ERR_SCRIPT_MALFUNCTION";

// Infrastructure
pub const ERR_FOLDER_CREATION: &str = "ERR_FOLDER_CREATION";
pub const ERR_COPY_BACK: &str = "ERR_COPY_BACK";
pub const ERR_DB_WRITE: &str = "ERR_DB_WRITE";
pub const ERR_DISK_FULL: &str = "ERR_DISK_FULL";

// Resource watchdog
pub const ERR_CPU_IDLE: &str = "ERR_CPU_IDLE";
pub const ERR_IO_IDLE: &str = "ERR_IO_IDLE";
pub const ERR_PRINT_IDLE: &str = "ERR_PRINT_IDLE";
pub const ERR_TIMEOUT: &str = "ERR_TIMEOUT";
pub const ERR_MEMORY_LIMIT: &str = "ERR_MEMORY_LIMIT";
pub const ERR_VIRTUAL_MEMORY_LIMIT: &str = "ERR_VIRTUAL_MEMORY_LIMIT";
pub const ERR_FORCED_TERMINATION: &str = "ERR_FORCED_TERMINATION";

// Application
pub const ERR_APP_START: &str = "ERR_APP_START";
pub const ERR_WRAPPER_FAILED: &str = "ERR_WRAPPER_FAILED";
pub const ERR_APP_EXIT: &str = "ERR_APP_EXIT";
pub const ERR_FATAL_OUTPUT: &str = "ERR_FATAL_OUTPUT";

// MTS log findings
pub const ERR_MTS_CRASH: &str = "ERR_MTS_CRASH";
pub const ERR_MTS_EXCEPTION: &str = "ERR_MTS_EXCEPTION";
pub const ERR_MTS_ERROR: &str = "ERR_MTS_ERROR";
pub const ERR_MTS_RECORDING: &str = "ERR_MTS_RECORDING";
pub const ERR_MTS_SYNC: &str = "ERR_MTS_SYNC";

pub const ERR_CANCELED: &str = "ERR_CANCELED";

// Unfailing
pub const WARN_DISK_SPACE: &str = "WARN_DISK_SPACE";
pub const WARN_MTS_WARNING: &str = "WARN_MTS_WARNING";
pub const WARN_SUBTASK_SKIPPED: &str = "WARN_SUBTASK_SKIPPED";
pub const WARN_COPY_RETRY: &str = "WARN_COPY_RETRY";
