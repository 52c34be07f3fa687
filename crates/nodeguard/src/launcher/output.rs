use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use bstr::ByteSlice;
use regex::Regex;

const TAIL_LINES: usize = 20;

/// Decides which output lines are kept (logged and counted as print activity).
#[derive(Debug, Clone)]
pub enum LineFilter {
    /// Drop lines matching the pattern.
    Suppress(Regex),
    /// Keep only lines matching the pattern.
    Select(Regex),
}

impl LineFilter {
    pub fn keep(&self, line: &str) -> bool {
        match self {
            LineFilter::Suppress(regex) => !regex.is_match(line),
            LineFilter::Select(regex) => regex.is_match(line),
        }
    }
}

pub type LineCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Invokes `callback` for every output line matching `pattern`, filtered or not.
#[derive(Clone)]
pub struct OutputCallback {
    pub pattern: Regex,
    pub callback: LineCallback,
}

impl OutputCallback {
    pub fn new(pattern: Regex, callback: impl Fn(&str) + Send + Sync + 'static) -> Self {
        Self {
            pattern,
            callback: Arc::new(callback),
        }
    }
}

impl std::fmt::Debug for OutputCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputCallback")
            .field("pattern", &self.pattern.as_str())
            .finish()
    }
}

/// State shared between the reader threads and the process handle.
#[derive(Default)]
pub(crate) struct OutputMonitor {
    lines: AtomicU64,
    active_readers: AtomicUsize,
    fatal: Mutex<Option<String>>,
    tail: Mutex<VecDeque<String>>,
}

impl OutputMonitor {
    pub fn lines(&self) -> u64 {
        self.lines.load(Ordering::SeqCst)
    }

    pub fn readers_active(&self) -> bool {
        self.active_readers.load(Ordering::SeqCst) > 0
    }

    pub fn fatal_message(&self) -> Option<String> {
        self.fatal.lock().ok().and_then(|fatal| fatal.clone())
    }

    pub fn tail(&self) -> Vec<String> {
        self.tail
            .lock()
            .map(|tail| tail.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn record_line(&self, line: &str) {
        self.lines.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut tail) = self.tail.lock() {
            if tail.len() == TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line.to_string());
        }
    }

    fn record_fatal(&self, line: &str) {
        if let Ok(mut fatal) = self.fatal.lock() {
            if fatal.is_none() {
                log::warn!("Fatal message in output: {line}");
                *fatal = Some(line.to_string());
            }
        }
    }
}

/// Decrements the active reader count even if a callback panics.
struct ReaderGuard(Arc<OutputMonitor>);

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        self.0.active_readers.fetch_sub(1, Ordering::SeqCst);
    }
}

pub(crate) struct ReaderContext {
    pub name: String,
    pub sink: Option<File>,
    pub filter: Option<LineFilter>,
    pub callbacks: Vec<OutputCallback>,
    pub fatal_patterns: Vec<Regex>,
    pub monitor: Arc<OutputMonitor>,
}

pub(crate) fn spawn_reader<R: Read + Send + 'static>(
    stream: R,
    ctx: ReaderContext,
) -> crate::Result<JoinHandle<()>> {
    ctx.monitor.active_readers.fetch_add(1, Ordering::SeqCst);
    let guard = ReaderGuard(ctx.monitor.clone());
    let handle = std::thread::Builder::new()
        .name(ctx.name.clone())
        .spawn(move || {
            let _guard = guard;
            drain(stream, ctx);
        });
    // On spawn failure the closure (and the guard) is dropped, so the counter is restored
    Ok(handle?)
}

fn drain<R: Read>(stream: R, ctx: ReaderContext) {
    let ReaderContext {
        name,
        sink,
        filter,
        callbacks,
        fatal_patterns,
        monitor,
    } = ctx;
    let mut reader = BufReader::new(stream);
    let mut sink = sink.map(BufWriter::new);
    let mut buffer = Vec::new();
    loop {
        buffer.clear();
        match reader.read_until(b'\n', &mut buffer) {
            Ok(0) => break,
            Ok(_) => {}
            Err(error) => {
                log::debug!("Reading {name} failed: {error}");
                break;
            }
        }
        let line = buffer.trim_end_with(|c| c == '\n' || c == '\r');
        let line = line.to_str_lossy();

        for callback in &callbacks {
            if callback.pattern.is_match(&line) {
                (callback.callback)(&line);
            }
        }
        if fatal_patterns.iter().any(|pattern| pattern.is_match(&line)) {
            monitor.record_fatal(&line);
        }
        if filter.as_ref().is_some_and(|filter| !filter.keep(&line)) {
            continue;
        }
        monitor.record_line(&line);
        log::trace!("[{name}] {line}");
        if let Some(writer) = sink.as_mut() {
            if let Err(error) = writeln!(writer, "{line}").and_then(|_| writer.flush()) {
                log::warn!("Cannot write {name} log: {error}");
                sink = None;
            }
        }
    }
    log::debug!("Reader {name} finished");
}
