macro_rules! create_starter_env {
    ($name: literal) => {
        concat!("STARTER_", $name)
    };
}

/// Known environment variables, exported to every subtask
pub const STARTER_TASK_NAME: &str = create_starter_env!("TASK_NAME");
pub const STARTER_SUBTASK_INDEX: &str = create_starter_env!("SUBTASK_INDEX");
pub const STARTER_LOG_DIR: &str = create_starter_env!("LOG_DIR");
pub const STARTER_DATA_DIR: &str = create_starter_env!("DATA_DIR");
pub const STARTER_TMP_DIR: &str = create_starter_env!("TMP_DIR");
pub const STARTER_RECORDING: &str = create_starter_env!("RECORDING");

/// Read by the starter itself
pub const STARTER_DB: &str = create_starter_env!("DB");
pub const STARTER_DEBUG: &str = create_starter_env!("DEBUG");
