#[cfg(test)]
mod test_runner;

pub mod utils;
