//! Relays child output into the log sink as streams become readable.
use std::{collections::HashMap, io};

use tracing::{debug, trace};

use crate::{
    constants::{READ_CHUNK_SIZE, SIBLING_DRAIN_CHUNKS},
    logs::LogSink,
    process::{ProcessManager, StreamToken},
    reactor::Reactor,
};

/// Result of handling one readiness notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Bytes were read and forwarded.
    Forwarded(usize),
    /// Spurious wakeup; nothing was available.
    Idle,
    /// The stream ended and both streams of the process were released.
    Closed,
    /// The token does not belong to a registered stream.
    Stale,
}

/// Drains child output pipes into a [`LogSink`].
pub struct OutputRelay {
    sink: Box<dyn LogSink + Send>,
    buf: Vec<u8>,
    // Trailing bytes of a multi-byte character split across reads.
    partial: HashMap<StreamToken, Vec<u8>>,
}

impl OutputRelay {
    pub fn new(sink: impl LogSink + Send + 'static) -> Self {
        Self {
            sink: Box::new(sink),
            buf: vec![0; READ_CHUNK_SIZE],
            partial: HashMap::new(),
        }
    }

    /// Appends supervisor text (markers, errors) directly to the sink.
    pub fn append(&mut self, text: &str) {
        self.sink.append(text);
    }

    /// Handles a readiness notification for `token`.
    ///
    /// Performs at most one bounded read. A zero-length read or a read error
    /// ends the process's output: whatever the sibling stream already holds is
    /// drained, then both streams are deregistered.
    pub fn on_readable(
        &mut self,
        token: StreamToken,
        processes: &mut ProcessManager,
        reactor: &mut Reactor,
    ) -> RelayOutcome {
        if !reactor.is_registered(token) {
            return RelayOutcome::Stale;
        }
        let Some(process) = processes.process_for_mut(token) else {
            return RelayOutcome::Stale;
        };

        match process.read_stream(token.kind, &mut self.buf) {
            Ok(0) => {
                trace!("Stream {token} reached end-of-stream");
            }
            Ok(read) => {
                let chunk = self.buf[..read].to_vec();
                self.forward(token, &chunk);
                return RelayOutcome::Forwarded(read);
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return RelayOutcome::Idle,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return RelayOutcome::Idle,
            Err(err) => {
                debug!("Read from {token} failed, treating as end-of-stream: {err}");
            }
        }

        self.flush_partial(token);
        self.drain_sibling(token, processes, reactor);
        processes.finish(token, reactor);
        RelayOutcome::Closed
    }

    /// Drops held-back UTF-8 tails of streams that are no longer registered,
    /// such as those of a process killed and replaced mid-character. Returns
    /// how many were dropped.
    pub fn discard_released(&mut self, reactor: &Reactor) -> usize {
        let before = self.partial.len();
        self.partial.retain(|token, _| reactor.is_registered(*token));
        let dropped = before - self.partial.len();
        if dropped > 0 {
            debug!("Dropped {dropped} incomplete tail(s) of released streams");
        }
        dropped
    }

    /// Number of streams currently holding back an incomplete character.
    pub fn pending_tails(&self) -> usize {
        self.partial.len()
    }

    fn drain_sibling(
        &mut self,
        token: StreamToken,
        processes: &mut ProcessManager,
        reactor: &Reactor,
    ) {
        let sibling = token.sibling();
        if reactor.is_registered(sibling)
            && let Some(process) = processes.process_for_mut(sibling)
        {
            for _ in 0..SIBLING_DRAIN_CHUNKS {
                match process.read_stream(sibling.kind, &mut self.buf) {
                    Ok(0) | Err(_) => break,
                    Ok(read) => {
                        let chunk = self.buf[..read].to_vec();
                        self.forward(sibling, &chunk);
                    }
                }
            }
        }
        self.flush_partial(sibling);
    }

    fn forward(&mut self, token: StreamToken, chunk: &[u8]) {
        let mut bytes = self.partial.remove(&token).unwrap_or_default();
        bytes.extend_from_slice(chunk);

        let complete = match std::str::from_utf8(&bytes) {
            Ok(_) => bytes.len(),
            // Incomplete sequence at the very end: hold it for the next read.
            Err(err) if err.error_len().is_none() => err.valid_up_to(),
            Err(_) => bytes.len(),
        };

        if complete < bytes.len() {
            self.partial.insert(token, bytes[complete..].to_vec());
        }
        if complete > 0 {
            let text = String::from_utf8_lossy(&bytes[..complete]);
            self.sink.append(&text);
        }
    }

    fn flush_partial(&mut self, token: StreamToken) {
        if let Some(rest) = self.partial.remove(&token) {
            self.sink.append(&String::from_utf8_lossy(&rest));
        }
    }
}
