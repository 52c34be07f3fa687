pub mod cancel;
pub mod common;
pub mod exitcode;
pub mod filter;
pub mod hwstats;
pub mod launcher;
pub mod sampler;
pub mod signal;
pub mod watchdog;

#[cfg(test)]
pub(crate) mod tests;

pub use crate::common::{Map, Set};

/// Operating system process identifier.
pub type Pid = u32;

pub type Error = crate::common::error::GuardError;
pub type Result<T> = std::result::Result<T, Error>;
