use mio::event::Source;
use mio::{Events, Interest, Poll, Token};
use std::fmt;
use std::io;
use std::time::Duration;

/// Readiness reported for one token in a single wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub token: Token,
    pub readable: bool,
    /// Peer hung up (read side closed) or the socket reported an error.
    pub hangup: bool,
}

/// Event loop for handling I/O events
///
/// Readiness is edge-triggered: a source is reported once per state change,
/// so handlers must consume everything they were woken for.
pub struct EventLoop {
    poll: Poll,
    events: Events,
    armed: usize,
}

impl EventLoop {
    /// Create a new event loop able to report `capacity` events per wait
    pub fn new(capacity: usize) -> io::Result<Self> {
        Ok(EventLoop {
            poll: Poll::new()?,
            events: Events::with_capacity(capacity.max(1)),
            armed: 0,
        })
    }

    /// Arm a source for the given interests
    pub fn arm<S: Source + ?Sized>(
        &mut self,
        source: &mut S,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.poll.registry().register(source, token, interests)?;
        self.armed += 1;
        Ok(())
    }

    /// Re-arm an already registered source, picking up readiness that arrived
    /// while it was quiet
    pub fn rearm<S: Source + ?Sized>(
        &mut self,
        source: &mut S,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.poll.registry().reregister(source, token, interests)
    }

    /// Remove a source from the wait set
    pub fn disarm<S: Source + ?Sized>(&mut self, source: &mut S) -> io::Result<()> {
        self.poll.registry().deregister(source)?;
        self.armed = self.armed.saturating_sub(1);
        Ok(())
    }

    /// Number of sources currently in the wait set
    pub fn armed(&self) -> usize {
        self.armed
    }

    /// Block until at least one source is ready or `timeout` passes.
    ///
    /// An empty result means the timeout elapsed. Signal interruptions are
    /// reported as an empty wait as well; callers recompute their budget.
    pub fn wait(&mut self, timeout: Option<Duration>) -> io::Result<Vec<Readiness>> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(e) => return Err(e),
        }

        Ok(self
            .events
            .iter()
            .map(|event| Readiness {
                token: event.token(),
                readable: event.is_readable(),
                hangup: event.is_read_closed() || event.is_error(),
            })
            .collect())
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("poll", &self.poll)
            .field("armed", &self.armed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::net::{TcpListener, TcpStream};

    const SERVER: Token = Token(0);

    #[test]
    fn test_wait_times_out_when_idle() {
        let mut event_loop = EventLoop::new(8).unwrap();
        let mut listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        event_loop.arm(&mut listener, SERVER, Interest::READABLE).unwrap();

        let ready = event_loop.wait(Some(Duration::from_millis(20))).unwrap();
        assert!(ready.is_empty());
        assert_eq!(event_loop.armed(), 1);
    }

    #[test]
    fn test_listener_reports_incoming_connection() {
        let mut event_loop = EventLoop::new(8).unwrap();
        let mut listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        event_loop.arm(&mut listener, SERVER, Interest::READABLE).unwrap();

        let _client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let ready = event_loop.wait(Some(Duration::from_secs(5))).unwrap();
        assert!(ready.iter().any(|r| r.token == SERVER && r.readable));

        event_loop.disarm(&mut listener).unwrap();
        assert_eq!(event_loop.armed(), 0);
    }
}
