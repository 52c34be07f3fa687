pub mod codes;
mod classifier;
mod table;

pub use classifier::{ExitCode, HistoryEntry, TaskState};
pub use table::{Category, ExitCodeInfo, ExitCodeTable};
