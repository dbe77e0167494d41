//! Queen: the coordinator side of a job
//!
//! A queen accepts exactly `N` drones, learns their core counts, hands each
//! one task record and collects one result per drone before a deadline. All
//! of it runs on one thread around a single readiness wait:
//!
//! 1. **Gather**: the listener and every accepted connection share the wait
//!    set. Each drone first reports its core count.
//! 2. **Collect**: the listener is closed, tasks go out in slot order, and
//!    the wait is bounded by what is left of the deadline.
//!
//! A job is all-or-nothing. Any protocol violation, hangup or expired
//! deadline closes every open connection and no output is returned.

pub mod deadline;
pub mod network;
pub mod slot;

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::ops::Range;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, error, info, warn};
use mio::net::TcpListener;
use mio::unix::SourceFd;
use mio::{Interest, Token};
use thiserror::Error;

use crate::event_loop::{EventLoop, Readiness};
use crate::proto::{ProtocolError, Record};

pub use deadline::Deadline;
pub use slot::{Phase, StateError, WorkerSlot, WorkerState};
use slot::{ReadAction, SlotError};

/// Default cap on a single declared result length
pub const DEFAULT_MAX_RESULT_LEN: usize = 64 * 1024 * 1024;

const LISTENER: Token = Token(0);

fn slot_token(index: usize) -> Token {
    Token(index + 1)
}

/// 队列执行错误类型
#[derive(Error, Debug)]
pub enum QueenError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("invalid job: {0}")]
    InvalidJob(String),
    #[error("{context}: {source}")]
    Transport {
        context: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("drone {slot}: {source}")]
    Protocol {
        slot: usize,
        #[source]
        source: ProtocolError,
    },
    #[error("drone {slot} hung up while {state:?}")]
    Hangup { slot: usize, state: WorkerState },
    #[error("drone {slot}: {source}")]
    State {
        slot: usize,
        #[source]
        source: StateError,
    },
    #[error("deadline of {budget:?} exceeded during {phase} phase")]
    DeadlineExceeded { phase: Phase, budget: Duration },
}

impl QueenError {
    fn transport(context: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| QueenError::Transport { context, source }
    }

    fn state(slot: usize) -> impl FnOnce(StateError) -> Self {
        move |source| QueenError::State { slot, source }
    }

    fn expired(phase: Phase, deadline: &Deadline) -> Self {
        QueenError::DeadlineExceeded {
            phase,
            budget: deadline.budget(),
        }
    }

    /// Classify a slot failure; socket timeouts under a deadline count as expiry
    fn from_slot(slot: usize, err: SlotError, phase: Phase, deadline: Option<&Deadline>) -> Self {
        match (err, deadline) {
            (SlotError::State(source), _) => QueenError::State { slot, source },
            (SlotError::Protocol(source), Some(deadline)) if source.is_timeout() => {
                QueenError::expired(phase, deadline)
            }
            (SlotError::Protocol(source), _) => QueenError::Protocol { slot, source },
        }
    }

    /// Whether the job failed because time ran out
    pub fn is_deadline(&self) -> bool {
        matches!(self, QueenError::DeadlineExceeded { .. })
    }
}

/// Queen configuration, immutable once built
#[derive(Debug, Clone)]
pub struct QueenConfig {
    listen_addr: SocketAddr,
    num_nodes: usize,
    deadline: Duration,
    accept_timeout: Option<Duration>,
    max_result_len: usize,
}

impl QueenConfig {
    pub fn new(listen_addr: SocketAddr, deadline: Duration, num_nodes: usize) -> Result<Self, QueenError> {
        if num_nodes == 0 {
            return Err(QueenError::Config("number of nodes must be positive".into()));
        }
        if deadline.is_zero() {
            return Err(QueenError::Config("deadline must be positive".into()));
        }
        Ok(Self {
            listen_addr,
            num_nodes,
            deadline,
            accept_timeout: None,
            max_result_len: DEFAULT_MAX_RESULT_LEN,
        })
    }

    /// Resolve `node:service` to an IPv4 listen address
    pub fn resolve(node: &str, service: &str, deadline: Duration, num_nodes: usize) -> Result<Self, QueenError> {
        let port: u16 = service
            .parse()
            .map_err(|_| QueenError::Config(format!("invalid port: {:?}", service)))?;
        let addr = (node, port)
            .to_socket_addrs()
            .map_err(|e| QueenError::Config(format!("unable to resolve {}: {}", node, e)))?
            .find(SocketAddr::is_ipv4)
            .ok_or_else(|| QueenError::Config(format!("no IPv4 address for {}", node)))?;
        Self::new(addr, deadline, num_nodes)
    }

    /// Bound the connection phase as well; by default it waits forever
    pub fn with_accept_timeout(mut self, timeout: Duration) -> Self {
        self.accept_timeout = Some(timeout);
        self
    }

    pub fn with_max_result_len(mut self, limit: usize) -> Self {
        self.max_result_len = limit;
        self
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    pub fn accept_timeout(&self) -> Option<Duration> {
        self.accept_timeout
    }

    pub fn max_result_len(&self) -> usize {
        self.max_result_len
    }
}

/// Where one drone's result sits in the output buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultSpan {
    pub slot: usize,
    pub range: Range<usize>,
}

/// Final view of one slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotSummary {
    pub cores: i32,
    pub state: WorkerState,
}

/// Results of a successful job, in arrival order
#[derive(Debug, Clone)]
pub struct JobOutput {
    data: Bytes,
    spans: Vec<ResultSpan>,
    slots: Vec<SlotSummary>,
    elapsed: Duration,
}

impl JobOutput {
    /// All result records back to back
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Bytes {
        self.data
    }

    pub fn spans(&self) -> &[ResultSpan] {
        &self.spans
    }

    /// `(slot, record)` pairs in the order results arrived
    pub fn results(&self) -> impl Iterator<Item = (usize, &[u8])> + '_ {
        self.spans
            .iter()
            .map(move |span| (span.slot, &self.data[span.range.clone()]))
    }

    /// Decode every result as `R`
    pub fn decode<R: Record>(&self) -> Result<Vec<R>, ProtocolError> {
        self.results().map(|(_, bytes)| R::read_from(bytes)).collect()
    }

    pub fn slots(&self) -> &[SlotSummary] {
        &self.slots
    }

    pub fn total_cores(&self) -> i64 {
        self.slots.iter().map(|s| i64::from(s.cores)).sum()
    }

    /// Time from dispatch start to the last result
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }
}

/// Coordinator bound to its listen address
#[derive(Debug)]
pub struct Queen {
    config: QueenConfig,
    listener: Option<TcpListener>,
    listener_armed: bool,
    event_loop: EventLoop,
}

impl Queen {
    /// Bind the listener; drones may start connecting right away
    pub fn bind(config: QueenConfig) -> Result<Self, QueenError> {
        let listener = network::listen(config.listen_addr, config.num_nodes)
            .map_err(QueenError::transport("unable to bind listener"))?;
        let event_loop = EventLoop::new(config.num_nodes + 1)
            .map_err(QueenError::transport("unable to create event loop"))?;
        info!(
            "queen listening on {} for {} drones",
            config.listen_addr, config.num_nodes
        );

        Ok(Self {
            config,
            listener: Some(listener),
            listener_armed: false,
            event_loop,
        })
    }

    pub fn config(&self) -> &QueenConfig {
        &self.config
    }

    /// Actual bound address (useful when binding port 0)
    pub fn local_addr(&self) -> Result<SocketAddr, QueenError> {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| QueenError::Config("listener already closed".into()))?;
        listener
            .local_addr()
            .map_err(QueenError::transport("unable to read listener address"))
    }

    /// Run one job: `tasks` holds `num_nodes` records of `record_size` bytes.
    pub fn run(mut self, record_size: usize, tasks: &[u8]) -> Result<JobOutput, QueenError> {
        let n = self.config.num_nodes;
        if record_size == 0 {
            return Err(QueenError::InvalidJob("record size must be positive".into()));
        }
        if record_size.checked_mul(n) != Some(tasks.len()) {
            return Err(QueenError::InvalidJob(format!(
                "expected {} task records of {} bytes, got {} bytes",
                n,
                record_size,
                tasks.len()
            )));
        }

        let mut slots: Vec<WorkerSlot> = (0..n).map(WorkerSlot::new).collect();
        let outcome = self.drive(&mut slots, record_size, tasks);
        match &outcome {
            Ok(output) => {
                info!(
                    "job finished: {} results, {} bytes in {:?}",
                    output.spans.len(),
                    output.data.len(),
                    output.elapsed
                );
                metrics::counter!("hive_queen_jobs_total", "outcome" => "ok").increment(1);
            }
            Err(e) => {
                error!("job aborted: {}", e);
                self.teardown(&mut slots);
                let label = if e.is_deadline() { "deadline" } else { "error" };
                metrics::counter!("hive_queen_jobs_total", "outcome" => label).increment(1);
            }
        }
        outcome
    }

    fn drive(&mut self, slots: &mut [WorkerSlot], record_size: usize, tasks: &[u8]) -> Result<JobOutput, QueenError> {
        self.gather(slots)?;
        info!("all {} drones connected and reported", slots.len());
        self.close_listener();

        let deadline = Deadline::start(self.config.deadline);
        self.dispatch(slots, record_size, tasks, &deadline)?;
        let (data, spans) = self.collect(slots, &deadline)?;

        let slots = slots
            .iter()
            .map(|slot| SlotSummary {
                cores: slot.cores().unwrap_or(0),
                state: slot.state(),
            })
            .collect();
        Ok(JobOutput {
            data: Bytes::from(data),
            spans,
            slots,
            elapsed: deadline.elapsed(),
        })
    }

    /// Accept `N` drones and read their core counts.
    fn gather(&mut self, slots: &mut [WorkerSlot]) -> Result<(), QueenError> {
        let n = slots.len();
        let deadline = self.config.accept_timeout.map(Deadline::start);
        let mut connected = 0;
        let mut reported = 0;

        if let Some(listener) = self.listener.as_mut() {
            self.event_loop
                .arm(listener, LISTENER, Interest::READABLE)
                .map_err(QueenError::transport("unable to arm listener"))?;
            self.listener_armed = true;
        }

        while reported < n {
            let timeout = match &deadline {
                Some(d) => Some(d.remaining().ok_or_else(|| QueenError::expired(Phase::Gather, d))?),
                None => None,
            };
            let ready = self
                .event_loop
                .wait(timeout)
                .map_err(QueenError::transport("unable to wait for drone readiness"))?;

            for event in ready {
                if event.token == LISTENER {
                    connected = self.accept_pending(slots, connected)?;
                    continue;
                }
                if self.on_gather_event(slots, event, deadline.as_ref())? {
                    reported += 1;
                }
            }
        }
        Ok(())
    }

    /// Accept whatever is pending, up to capacity, then disarm the listener
    /// once every slot is taken.
    fn accept_pending(&mut self, slots: &mut [WorkerSlot], mut connected: usize) -> Result<usize, QueenError> {
        let Some(listener) = self.listener.as_mut() else {
            return Ok(connected);
        };

        while connected < slots.len() {
            let accepted = network::accept(listener)
                .map_err(QueenError::transport("unable to accept drone connection"))?;
            let Some((stream, peer)) = accepted else {
                break;
            };

            let index = connected;
            let slot = &mut slots[index];
            slot.attach(stream).map_err(QueenError::state(index))?;
            if let Some(fd) = slot.raw_fd() {
                self.event_loop
                    .arm(&mut SourceFd(&fd), slot_token(index), Interest::READABLE)
                    .map_err(QueenError::transport("unable to arm drone connection"))?;
            }
            info!("drone {} connected from {}", index, peer);
            connected += 1;
        }

        if connected == slots.len() && self.listener_armed {
            self.event_loop
                .disarm(listener)
                .map_err(QueenError::transport("unable to disarm listener"))?;
            self.listener_armed = false;
            debug!("capacity reached, listener disarmed");
        }
        Ok(connected)
    }

    /// Returns whether the event completed a core count report.
    fn on_gather_event(
        &mut self,
        slots: &mut [WorkerSlot],
        event: Readiness,
        deadline: Option<&Deadline>,
    ) -> Result<bool, QueenError> {
        let Some(slot) = event.token.0.checked_sub(1).and_then(|i| slots.get_mut(i)) else {
            warn!("readiness for unknown token {:?}", event.token);
            return Ok(false);
        };
        let index = slot.index();
        let mut reported = false;

        if event.readable {
            let action = slot
                .state()
                .on_readable(Phase::Gather)
                .map_err(QueenError::state(index))?;
            if action == ReadAction::ReadInfo {
                let budget = match deadline {
                    Some(d) => Some(d.remaining().ok_or_else(|| QueenError::expired(Phase::Gather, d))?),
                    None => None,
                };
                slot.read_info(budget)
                    .map_err(|e| QueenError::from_slot(index, e, Phase::Gather, deadline))?;
                reported = true;
            }
        }

        if event.hangup && slot.state() != WorkerState::Done {
            return Err(QueenError::Hangup {
                slot: index,
                state: slot.state(),
            });
        }
        Ok(reported)
    }

    fn close_listener(&mut self) {
        if let Some(mut listener) = self.listener.take() {
            if self.listener_armed {
                let _ = self.event_loop.disarm(&mut listener);
                self.listener_armed = false;
            }
            debug!("listener closed");
        }
    }

    /// Send every slot its task record, in slot order.
    fn dispatch(
        &mut self,
        slots: &mut [WorkerSlot],
        record_size: usize,
        tasks: &[u8],
        deadline: &Deadline,
    ) -> Result<(), QueenError> {
        for (slot, record) in slots.iter_mut().zip(tasks.chunks_exact(record_size)) {
            let index = slot.index();
            let budget = deadline
                .remaining()
                .ok_or_else(|| QueenError::expired(Phase::Collect, deadline))?;
            slot.send_task(record, budget)
                .map_err(|e| QueenError::from_slot(index, e, Phase::Collect, Some(deadline)))?;

            let fd = slot.raw_fd().ok_or(QueenError::State {
                slot: index,
                source: StateError::Detached { state: slot.state() },
            })?;
            self.event_loop
                .rearm(&mut SourceFd(&fd), slot_token(index), Interest::READABLE)
                .map_err(QueenError::transport("unable to arm drone connection"))?;
            debug!("task sent to drone {}", index);
        }
        Ok(())
    }

    /// Wait for one result per slot within the deadline.
    fn collect(
        &mut self,
        slots: &mut [WorkerSlot],
        deadline: &Deadline,
    ) -> Result<(Vec<u8>, Vec<ResultSpan>), QueenError> {
        let n = slots.len();
        let limit = self.config.max_result_len;
        let mut data = Vec::new();
        let mut spans = Vec::with_capacity(n);

        while spans.len() < n {
            let remaining = deadline
                .remaining()
                .ok_or_else(|| QueenError::expired(Phase::Collect, deadline))?;
            let ready = self
                .event_loop
                .wait(Some(remaining))
                .map_err(QueenError::transport("unable to wait for drone results"))?;

            for event in ready {
                let Some(slot) = event.token.0.checked_sub(1).and_then(|i| slots.get_mut(i)) else {
                    warn!("readiness for unknown token {:?}", event.token);
                    continue;
                };
                let index = slot.index();

                if event.readable {
                    let action = slot
                        .state()
                        .on_readable(Phase::Collect)
                        .map_err(QueenError::state(index))?;
                    if action == ReadAction::ReadAnswer {
                        let budget = deadline
                            .remaining()
                            .ok_or_else(|| QueenError::expired(Phase::Collect, deadline))?;
                        let start = data.len();
                        let len = slot
                            .read_answer(&mut data, limit, budget)
                            .map_err(|e| QueenError::from_slot(index, e, Phase::Collect, Some(deadline)))?;
                        spans.push(ResultSpan {
                            slot: index,
                            range: start..start + len,
                        });
                        metrics::histogram!("hive_queen_results_bytes").record(len as f64);

                        // 完成的连接不再参与后续轮询
                        if let Some(fd) = slot.raw_fd() {
                            self.event_loop
                                .disarm(&mut SourceFd(&fd))
                                .map_err(QueenError::transport("unable to disarm drone connection"))?;
                        }
                        slot.close();
                        info!("drone {} answered with {} bytes", index, len);
                    }
                }

                if event.hangup && slot.state() != WorkerState::Done {
                    return Err(QueenError::Hangup {
                        slot: index,
                        state: slot.state(),
                    });
                }
            }
        }
        Ok((data, spans))
    }

    /// Close every open connection once, sentinel first.
    fn teardown(&mut self, slots: &mut [WorkerSlot]) {
        for slot in slots.iter_mut() {
            if let Some(fd) = slot.raw_fd() {
                let _ = self.event_loop.disarm(&mut SourceFd(&fd));
            }
            if slot.close() {
                warn!("drone {} force-closed while {:?}", slot.index(), slot.state());
            }
        }
        self.close_listener();
    }
}

/// Bind, run one job and tear everything down.
pub fn start_job(config: QueenConfig, record_size: usize, tasks: &[u8]) -> Result<JobOutput, QueenError> {
    Queen::bind(config)?.run(record_size, tasks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn test_config_rejects_zero_nodes() {
        let err = QueenConfig::new(loopback(), Duration::from_secs(1), 0).unwrap_err();
        assert!(matches!(err, QueenError::Config(_)));
    }

    #[test]
    fn test_config_rejects_zero_deadline() {
        assert!(QueenConfig::new(loopback(), Duration::ZERO, 2).is_err());
    }

    #[test]
    fn test_resolve_localhost() {
        let config = QueenConfig::resolve("localhost", "0", Duration::from_secs(5), 3).unwrap();
        assert!(config.listen_addr().is_ipv4());
        assert_eq!(config.num_nodes(), 3);
        assert_eq!(config.max_result_len(), DEFAULT_MAX_RESULT_LEN);
        assert!(config.accept_timeout().is_none());
    }

    #[test]
    fn test_resolve_rejects_bad_port() {
        assert!(QueenConfig::resolve("127.0.0.1", "http-ish", Duration::from_secs(5), 1).is_err());
    }

    #[test]
    fn test_run_rejects_mismatched_task_buffer() {
        let config = QueenConfig::new(loopback(), Duration::from_secs(1), 2).unwrap();
        let queen = Queen::bind(config).unwrap();
        let err = queen.run(8, &[0u8; 12]).unwrap_err();
        assert!(matches!(err, QueenError::InvalidJob(_)));
    }

    #[test]
    fn test_gather_times_out_without_drones() {
        let config = QueenConfig::new(loopback(), Duration::from_secs(1), 1)
            .unwrap()
            .with_accept_timeout(Duration::from_millis(50));
        let started = Instant::now();
        let err = start_job(config, 4, &[0u8; 4]).unwrap_err();
        assert!(matches!(
            err,
            QueenError::DeadlineExceeded { phase: Phase::Gather, .. }
        ));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
