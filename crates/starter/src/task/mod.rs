pub mod copyback;
pub mod layout;
pub mod result;
pub mod runner;
pub mod subtask;

pub use result::{SubtaskResult, TaskRunResult};
pub use runner::{TaskRunner, load_exit_code_table};
