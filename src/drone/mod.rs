//! Drone: the worker side of a job
//!
//! A drone connects to the queen, reports how many cores it will use, receives
//! one task record, fans the work out over pinned threads and sends back one
//! aggregated result.

pub mod accumulator;
pub mod affinity;
pub mod dispatch;
pub mod network;

use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use log::{debug, info, warn};
use thiserror::Error;

use crate::proto::wire::{self, Field};
use crate::proto::{ProtocolError, Record, Release};

pub use accumulator::Accumulator;
pub use dispatch::{CorePool, DispatchError, Partition};
pub use network::RetryPolicy;

/// Default wait for the queen's end-of-work sentinel
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(10);

/// Drone错误类型
#[derive(Error, Debug)]
pub enum DroneError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("unable to connect to queen at {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),
    #[error("connection to queen already closed")]
    Closed,
}

/// Drone configuration
#[derive(Debug, Clone)]
pub struct DroneConfig {
    server: SocketAddr,
    cores: usize,
    task_size: usize,
    deadline: Duration,
    retry: RetryPolicy,
}

impl DroneConfig {
    pub fn new(server: SocketAddr, cores: usize, task_size: usize) -> Result<Self, DroneError> {
        if cores == 0 || i32::try_from(cores).is_err() {
            return Err(DroneError::Config(format!("invalid core count: {}", cores)));
        }
        if task_size == 0 {
            return Err(DroneError::Config("task size must be positive".into()));
        }
        Ok(Self {
            server,
            cores,
            task_size,
            deadline: DEFAULT_DEADLINE,
            retry: RetryPolicy::default(),
        })
    }

    /// Resolve `node:service` to exactly one IPv4 address.
    pub fn resolve(node: &str, service: &str, cores: usize, task_size: usize) -> Result<Self, DroneError> {
        let port: u16 = service
            .parse()
            .map_err(|_| DroneError::Config(format!("invalid port: {:?}", service)))?;
        let mut addrs: Vec<SocketAddr> = (node, port)
            .to_socket_addrs()
            .map_err(|e| DroneError::Config(format!("unable to resolve {}: {}", node, e)))?
            .filter(SocketAddr::is_ipv4)
            .collect();
        addrs.sort();
        addrs.dedup();

        match addrs.as_slice() {
            [addr] => Self::new(*addr, cores, task_size),
            [] => Err(DroneError::Config(format!("no IPv4 address for {}", node))),
            _ => Err(DroneError::Config(format!(
                "ambiguous resolution for {}: {} addresses",
                node,
                addrs.len()
            ))),
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry.interval = interval;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.retry.max_attempts = Some(attempts);
        self
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    pub fn cores(&self) -> usize {
        self.cores
    }

    pub fn task_size(&self) -> usize {
        self.task_size
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    pub fn retry(&self) -> RetryPolicy {
        self.retry
    }
}

/// Drone's connection to the queen and the task it received
#[derive(Debug)]
pub struct Drone {
    config: DroneConfig,
    stream: Option<TcpStream>,
    task: Vec<u8>,
    pool: CorePool,
}

impl Drone {
    /// Connect, report the core count and receive the task record.
    ///
    /// The core count is validated before any connection attempt. On failure
    /// the connection is closed before returning.
    pub fn connect(config: DroneConfig) -> Result<Self, DroneError> {
        let pool = CorePool::new(config.cores)?;
        let stream = network::connect(config.server, config.retry).map_err(|source| DroneError::Connect {
            addr: config.server,
            source,
        })?;
        info!("connected to queen at {}", config.server);

        let mut drone = Self {
            config,
            stream: Some(stream),
            task: Vec::new(),
            pool,
        };
        drone.handshake()?;
        Ok(drone)
    }

    fn handshake(&mut self) -> Result<(), DroneError> {
        let cores = i32::try_from(self.config.cores)
            .map_err(|_| DroneError::Config(format!("invalid core count: {}", self.config.cores)))?;
        let mut task = vec![0u8; self.config.task_size];

        let stream = self.stream_mut()?;
        wire::write_core_count(stream, cores)?;
        debug!("reported {} cores", cores);
        wire::read_exact(stream, &mut task, Field::Task)?;

        info!("received {} byte task", task.len());
        self.task = task;
        Ok(())
    }

    fn stream_mut(&mut self) -> Result<&mut TcpStream, DroneError> {
        self.stream.as_mut().ok_or(DroneError::Closed)
    }

    pub fn config(&self) -> &DroneConfig {
        &self.config
    }

    /// Raw task record as received
    pub fn task(&self) -> &[u8] {
        &self.task
    }

    pub fn decode_task<R: Record>(&self) -> Result<R, ProtocolError> {
        R::read_from(&self.task)
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Partition `task` over the configured cores and fold the partials.
    pub fn distribute<T, R, C, F>(
        &self,
        task: &T,
        compute: C,
        accumulator: &Accumulator<R, F>,
    ) -> Result<Duration, DroneError>
    where
        T: Partition + Sync,
        R: Send,
        C: Fn(&T) -> R + Sync,
        F: Fn(&mut R, R) + Sync,
    {
        Ok(self.pool.distribute(task, compute, accumulator)?)
    }

    /// Send the result: length first, then the bytes.
    pub fn send_result(&mut self, result: &[u8]) -> Result<(), DroneError> {
        let sent = wire::write_result(self.stream_mut()?, result);
        if let Err(e) = sent {
            self.close();
            return Err(e.into());
        }
        debug!("sent {} byte result", result.len());
        Ok(())
    }

    /// Wait for the queen to release this drone, then close.
    pub fn finish(&mut self) -> Result<Release, DroneError> {
        let deadline = self.config.deadline;
        let stream = self.stream_mut()?;
        let released = stream
            .set_read_timeout(Some(deadline))
            .map_err(|source| ProtocolError::Io {
                field: Field::Sentinel,
                source,
            })
            .and_then(|()| wire::read_sentinel(stream));
        self.close();

        let release = released?;
        match release {
            Release::Graceful => info!("released by queen"),
            Release::Abrupt => warn!("queen closed the connection without a sentinel"),
        }
        Ok(release)
    }

    /// Close the connection; returns `false` if it was already closed.
    pub fn close(&mut self) -> bool {
        let Some(stream) = self.stream.take() else {
            return false;
        };
        let _ = stream.shutdown(Shutdown::Both);
        debug!("connection to {} closed", self.config.server);
        true
    }
}

impl Drop for Drone {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:9".parse().unwrap()
    }

    #[test]
    fn test_config_validation() {
        assert!(DroneConfig::new(addr(), 0, 32).is_err());
        assert!(DroneConfig::new(addr(), 1, 0).is_err());
        let config = DroneConfig::new(addr(), 2, 32).unwrap();
        assert_eq!(config.deadline(), DEFAULT_DEADLINE);
        assert_eq!(config.retry().interval, Duration::from_secs(1));
        assert!(config.retry().max_attempts.is_none());
    }

    #[test]
    fn test_resolve_loopback() {
        let config = DroneConfig::resolve("127.0.0.1", "4000", 1, 8).unwrap();
        assert_eq!(config.server(), "127.0.0.1:4000".parse().unwrap());
    }

    #[test]
    fn test_resolve_rejects_bad_service() {
        assert!(matches!(
            DroneConfig::resolve("127.0.0.1", "nope", 1, 8),
            Err(DroneError::Config(_))
        ));
    }

    #[test]
    fn test_too_many_cores_fails_before_connecting() {
        let config = DroneConfig::new(addr(), num_cpus::get() + 1, 8).unwrap();
        assert!(matches!(
            Drone::connect(config),
            Err(DroneError::Dispatch(DispatchError::Oversubscribed { .. }))
        ));
    }
}
