use std::time::{Duration, Instant};

/// Sleeps for at most `duration`, waking up every `step` to evaluate `interrupt`.
///
/// Returns `true` if the sleep was cut short because `interrupt` returned `true`.
/// All waiting in the runtime goes through this function so that cancellation requests
/// and process exits are noticed within one `step`.
pub fn try_sleep<F: FnMut() -> bool>(duration: Duration, step: Duration, mut interrupt: F) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if interrupt() {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        std::thread::sleep(step.min(deadline - now));
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
