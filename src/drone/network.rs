//! Connect to the queen, retrying while refused

use std::io;
use std::net::{SocketAddr, TcpStream};
use std::thread;
use std::time::Duration;

use log::{debug, warn};

/// How long and how often to retry a refused connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_attempts: None,
        }
    }
}

/// Connect to the queen, retrying while the connection is refused.
///
/// Any other failure is returned immediately, as is the last refusal once
/// `max_attempts` is used up.
pub fn connect(addr: SocketAddr, policy: RetryPolicy) -> io::Result<TcpStream> {
    let mut attempts: u32 = 0;
    loop {
        attempts = attempts.saturating_add(1);
        match TcpStream::connect(addr) {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                debug!("connected to {} after {} attempt(s)", addr, attempts);
                return Ok(stream);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                if policy.max_attempts.is_some_and(|max| attempts >= max) {
                    return Err(e);
                }
                warn!(
                    "queen at {} refused connection (attempt {}), retrying in {:?}",
                    addr, attempts, policy.interval
                );
                metrics::counter!("hive_drone_connect_retries_total").increment(1);
                thread::sleep(policy.interval);
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn closed_port() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let policy = RetryPolicy {
            interval: Duration::from_millis(5),
            max_attempts: Some(3),
        };
        let err = connect(closed_port(), policy).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }

    #[test]
    fn test_connects_to_live_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = connect(listener.local_addr().unwrap(), RetryPolicy::default()).unwrap();
        assert!(stream.nodelay().unwrap());
    }
}
