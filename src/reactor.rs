//! Level-triggered readiness multiplexing over `poll(2)`.
use std::{collections::BTreeSet, os::fd::BorrowedFd, time::Duration};

use nix::{
    errno::Errno,
    poll::{PollFd, PollFlags, PollTimeout, poll},
};
use tracing::{debug, trace};

use crate::{
    error::DialupError,
    process::{ProcessManager, StreamToken},
};

/// Source that became ready during a [`Reactor::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// A registered child output stream has data or reached end-of-stream.
    Stream(StreamToken),
    /// The control listener has a pending connection.
    Control,
    /// An accepted control connection can be read or written.
    Client(u64),
}

/// Poll interest for one accepted control connection.
#[derive(Debug, Clone, Copy)]
pub struct ClientInterest<'fd> {
    pub id: u64,
    pub fd: BorrowedFd<'fd>,
    /// Set while a response is still waiting to be written.
    pub writable: bool,
}

/// Registration table for child output streams.
///
/// Descriptors are not stored here: they stay owned by the
/// [`ProcessManager`] and are borrowed for the duration of each wait.
#[derive(Debug, Default)]
pub struct Reactor {
    registered: BTreeSet<StreamToken>,
    deregistrations: u64,
}

impl Reactor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, token: StreamToken) -> bool {
        let inserted = self.registered.insert(token);
        if inserted {
            trace!("Registered stream {token}");
        }
        inserted
    }

    /// Removes a registration. Returns `false` if the token was not registered.
    pub fn deregister(&mut self, token: StreamToken) -> bool {
        let removed = self.registered.remove(&token);
        if removed {
            self.deregistrations += 1;
            trace!("Deregistered stream {token}");
        }
        removed
    }

    pub fn is_registered(&self, token: StreamToken) -> bool {
        self.registered.contains(&token)
    }

    pub fn registered(&self) -> impl Iterator<Item = StreamToken> + '_ {
        self.registered.iter().copied()
    }

    pub fn registered_count(&self) -> usize {
        self.registered.len()
    }

    /// Total number of successful deregistrations since creation.
    pub fn deregistration_count(&self) -> u64 {
        self.deregistrations
    }

    /// Waits up to `timeout` for any registered stream, the control listener or
    /// a control connection to become ready.
    ///
    /// Readable, hang-up and error conditions all count as ready so the relay
    /// observes end-of-stream. An interrupted wait reports nothing ready.
    pub fn wait(
        &self,
        processes: &ProcessManager,
        control: Option<BorrowedFd<'_>>,
        clients: &[ClientInterest<'_>],
        timeout: Duration,
    ) -> Result<Vec<Readiness>, DialupError> {
        let capacity = self.registered.len() + clients.len() + 1;
        let mut sources = Vec::with_capacity(capacity);
        let mut fds = Vec::with_capacity(capacity);

        for token in &self.registered {
            if let Some(fd) = processes.stream_fd(*token) {
                sources.push(Readiness::Stream(*token));
                fds.push(PollFd::new(fd, PollFlags::POLLIN));
            }
        }
        if let Some(fd) = control {
            sources.push(Readiness::Control);
            fds.push(PollFd::new(fd, PollFlags::POLLIN));
        }
        for client in clients {
            let mut flags = PollFlags::POLLIN;
            if client.writable {
                flags |= PollFlags::POLLOUT;
            }
            sources.push(Readiness::Client(client.id));
            fds.push(PollFd::new(client.fd, flags));
        }

        let millis = timeout.as_millis().min(u128::from(u16::MAX)) as u16;
        match poll(&mut fds, PollTimeout::from(millis)) {
            Ok(0) => return Ok(Vec::new()),
            Ok(_) => {}
            Err(Errno::EINTR) => {
                debug!("Readiness wait interrupted");
                return Ok(Vec::new());
            }
            Err(err) => return Err(err.into()),
        }

        let ready_mask = PollFlags::POLLIN
            | PollFlags::POLLOUT
            | PollFlags::POLLHUP
            | PollFlags::POLLERR
            | PollFlags::POLLNVAL;
        Ok(fds
            .iter()
            .zip(sources)
            .filter(|(fd, _)| fd.revents().is_some_and(|events| events.intersects(ready_mask)))
            .map(|(_, source)| source)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{CommandSpec, Role, StreamKind};
    use std::{
        io::Write,
        os::{fd::AsFd, unix::net::UnixStream},
        time::Instant,
    };

    fn token(generation: u64, kind: StreamKind) -> StreamToken {
        StreamToken {
            role: Role::Connect,
            kind,
            generation,
        }
    }

    #[test]
    fn deregister_is_counted_once() {
        let mut reactor = Reactor::new();
        let stdout = token(0, StreamKind::Stdout);

        assert!(reactor.register(stdout));
        assert!(!reactor.register(stdout));
        assert!(reactor.deregister(stdout));
        assert!(!reactor.deregister(stdout));
        assert_eq!(reactor.deregistration_count(), 1);
        assert_eq!(reactor.registered_count(), 0);
    }

    #[test]
    fn wait_times_out_without_sources() {
        let reactor = Reactor::new();
        let processes = ProcessManager::new();

        let started = Instant::now();
        let ready = reactor
            .wait(&processes, None, &[], Duration::from_millis(50))
            .unwrap();

        assert!(ready.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn wait_reports_readable_client() {
        let reactor = Reactor::new();
        let processes = ProcessManager::new();
        let (mut peer, conn) = UnixStream::pair().unwrap();
        let interest = [ClientInterest {
            id: 7,
            fd: conn.as_fd(),
            writable: false,
        }];

        let idle = reactor
            .wait(&processes, None, &interest, Duration::ZERO)
            .unwrap();
        assert!(idle.is_empty());

        peer.write_all(b"{}\n").unwrap();
        let ready = reactor
            .wait(&processes, None, &interest, Duration::from_secs(1))
            .unwrap();
        assert_eq!(ready, vec![Readiness::Client(7)]);
    }

    #[test]
    fn wait_reports_stream_with_output() {
        let mut reactor = Reactor::new();
        let mut processes = ProcessManager::new();
        let handle = processes
            .start(
                Role::Connect,
                &CommandSpec::new("sh", vec!["-c".into(), "echo ready; sleep 5".into()]),
                &mut reactor,
            )
            .unwrap();

        let ready = reactor
            .wait(&processes, None, &[], Duration::from_secs(5))
            .unwrap();

        assert!(ready.contains(&Readiness::Stream(token(
            handle.generation,
            StreamKind::Stdout
        ))));

        processes.stop_all(&mut reactor);
    }
}
