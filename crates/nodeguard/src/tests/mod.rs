#[cfg(test)]
mod test_process;

pub mod utils;
