pub mod common;
pub mod config;
pub mod logscan;
pub mod store;
pub mod task;

#[cfg(test)]
pub(crate) mod tests;

pub type Error = crate::common::error::StarterError;
pub type Result<T> = std::result::Result<T, Error>;

// Reexports
pub use nodeguard;

pub const STARTER_VERSION: &str = env!("CARGO_PKG_VERSION");
