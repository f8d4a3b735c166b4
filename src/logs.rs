//! Append-only text sinks for dial-up tool output.
use std::{
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use chrono::Local;
use tracing::warn;

use crate::constants::MARKER_TIMESTAMP_FORMAT;

/// Destination for relayed child output and supervisor markers.
///
/// Text is appended verbatim; implementations must not reorder or transform it.
pub trait LogSink {
    fn append(&mut self, text: &str);
}

impl<S: LogSink + ?Sized> LogSink for Box<S> {
    fn append(&mut self, text: &str) {
        (**self).append(text)
    }
}

/// Formats a marker line prefixed with the local time.
pub fn timestamped(marker: &str) -> String {
    format!("[{}] {marker}\n", Local::now().format(MARKER_TIMESTAMP_FORMAT))
}

/// Writes to the supervisor's standard output.
#[derive(Debug, Default)]
pub struct ConsoleSink;

impl LogSink for ConsoleSink {
    fn append(&mut self, text: &str) {
        let mut stdout = io::stdout().lock();
        let _ = stdout.write_all(text.as_bytes());
        let _ = stdout.flush();
    }
}

/// Appends to a file, creating parent directories on open.
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    file: File,
}

impl FileSink {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LogSink for FileSink {
    fn append(&mut self, text: &str) {
        if let Err(err) = self.file.write_all(text.as_bytes()) {
            warn!("Failed to append to dial log {:?}: {err}", self.path);
        }
    }
}

/// Fans every append out to several sinks in order.
#[derive(Default)]
pub struct TeeSink {
    sinks: Vec<Box<dyn LogSink + Send>>,
}

impl TeeSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl LogSink + Send + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }
}

impl LogSink for TeeSink {
    fn append(&mut self, text: &str) {
        for sink in &mut self.sinks {
            sink.append(text);
        }
    }
}

/// In-memory sink whose contents can be read through any clone.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    buffer: Arc<Mutex<String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        self.buffer
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

impl LogSink for MemorySink {
    fn append(&mut self, text: &str) {
        match self.buffer.lock() {
            Ok(mut guard) => guard.push_str(text),
            Err(poisoned) => poisoned.into_inner().push_str(text),
        }
    }
}
