use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

use crate::cancel::{CancelSource, CancelToken};

/// Background thread that turns termination signals into cancellation requests.
///
/// The thread never touches classifier or process state, it only flips the token.
/// The thread is stopped and joined when the value is dropped.
pub struct SignalThread {
    signal_thread: Option<std::thread::JoinHandle<()>>,
    signal_handle: signal_hook::iterator::Handle,
}

impl SignalThread {
    pub fn spawn(token: CancelToken) -> crate::Result<Self> {
        let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;
        let signal_handle = signals.handle();
        let signal_thread = std::thread::Builder::new()
            .name("signals".to_string())
            .spawn(move || {
                for signal in &mut signals {
                    log::debug!("Received signal {signal}");
                    token.request(CancelSource::Signal(signal));
                }
            })?;
        Ok(Self {
            signal_handle,
            signal_thread: Some(signal_thread),
        })
    }
}

impl Drop for SignalThread {
    fn drop(&mut self) {
        self.signal_handle.close();
        if let Some(thread) = self.signal_thread.take() {
            if thread.join().is_err() {
                log::error!("Signal thread crashed");
            }
        }
    }
}
