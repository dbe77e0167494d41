//! Per-drone connection slot and its protocol state machine

use std::fmt;
use std::io::Write;
use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use log::debug;
use thiserror::Error;

use crate::proto::wire::{self, ProtocolError};

/// Protocol state of one drone connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// No connection accepted yet.
    Empty,
    /// Connected, core count not yet read.
    AwaitingInfo,
    /// Core count known, task not yet sent.
    AwaitingTask,
    /// Task sent, result owed.
    AwaitingAnswer,
    /// Result received and connection closed.
    Done,
}

/// Something that moves a slot forward
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotEvent {
    Accepted,
    InfoReceived,
    TaskSent,
    AnswerReceived,
}

/// Readiness loop phase a readable event was observed in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Accepting connections and reading core counts.
    Gather,
    /// Tasks dispatched, waiting for results.
    Collect,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Gather => f.write_str("gather"),
            Phase::Collect => f.write_str("collect"),
        }
    }
}

/// What to do with a readable slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadAction {
    ReadInfo,
    ReadAnswer,
    Ignore,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateError {
    #[error("illegal transition: {event:?} while {state:?}")]
    Transition { state: WorkerState, event: SlotEvent },
    #[error("slot became readable while {state:?} during {phase} phase")]
    UnexpectedReadable { state: WorkerState, phase: Phase },
    #[error("slot has no open connection while {state:?}")]
    Detached { state: WorkerState },
}

impl WorkerState {
    /// Transition function; any pair not listed is rejected
    pub fn next(self, event: SlotEvent) -> Result<WorkerState, StateError> {
        use SlotEvent::*;
        use WorkerState::*;

        match (self, event) {
            (Empty, Accepted) => Ok(AwaitingInfo),
            (AwaitingInfo, InfoReceived) => Ok(AwaitingTask),
            (AwaitingTask, TaskSent) => Ok(AwaitingAnswer),
            (AwaitingAnswer, AnswerReceived) => Ok(Done),
            (state, event) => Err(StateError::Transition { state, event }),
        }
    }

    /// Reaction to a readable event
    pub fn on_readable(self, phase: Phase) -> Result<ReadAction, StateError> {
        use WorkerState::*;

        match (phase, self) {
            (Phase::Gather, AwaitingInfo) => Ok(ReadAction::ReadInfo),
            (Phase::Gather, AwaitingTask) => Ok(ReadAction::Ignore),
            (Phase::Collect, AwaitingAnswer) => Ok(ReadAction::ReadAnswer),
            (Phase::Collect, AwaitingTask | Done) => Ok(ReadAction::Ignore),
            (phase, state) => Err(StateError::UnexpectedReadable { state, phase }),
        }
    }
}

/// Queen-side record of one drone connection
#[derive(Debug)]
pub struct WorkerSlot {
    index: usize,
    stream: Option<TcpStream>,
    cores: Option<i32>,
    state: WorkerState,
}

impl WorkerSlot {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            stream: None,
            cores: None,
            state: WorkerState::Empty,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Core count reported by the drone, once read
    pub fn cores(&self) -> Option<i32> {
        self.cores
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.stream.as_ref().map(|s| s.as_raw_fd())
    }

    fn advance(&mut self, event: SlotEvent) -> Result<(), StateError> {
        let next = self.state.next(event)?;
        debug!("slot {}: {:?} -> {:?}", self.index, self.state, next);
        self.state = next;
        Ok(())
    }

    /// Take ownership of an accepted connection.
    pub fn attach(&mut self, stream: TcpStream) -> Result<(), StateError> {
        self.advance(SlotEvent::Accepted)?;
        self.stream = Some(stream);
        Ok(())
    }

    fn stream(&mut self) -> Result<&mut TcpStream, StateError> {
        let state = self.state;
        self.stream.as_mut().ok_or(StateError::Detached { state })
    }

    /// Read the reported core count; `budget` bounds the read when set.
    pub fn read_info(&mut self, budget: Option<Duration>) -> Result<i32, SlotError> {
        self.state.next(SlotEvent::InfoReceived)?;
        let stream = self.stream()?;
        stream
            .set_read_timeout(budget)
            .map_err(|source| ProtocolError::Io { field: wire::Field::CoreCount, source })?;
        let cores = wire::read_core_count(stream)?;
        self.cores = Some(cores);
        self.advance(SlotEvent::InfoReceived)?;
        debug!("slot {}: drone reports {} cores", self.index, cores);
        Ok(cores)
    }

    /// Write the task record; the write blocks for at most `budget`.
    pub fn send_task(&mut self, record: &[u8], budget: Duration) -> Result<(), SlotError> {
        self.state.next(SlotEvent::TaskSent)?;
        let stream = self.stream()?;
        stream
            .set_write_timeout(Some(budget))
            .map_err(|source| ProtocolError::Io { field: wire::Field::Task, source })?;
        wire::write_exact(stream, record, wire::Field::Task)?;
        self.advance(SlotEvent::TaskSent)?;
        Ok(())
    }

    /// Read the result into `out`; the read blocks for at most `budget`.
    pub fn read_answer(
        &mut self,
        out: &mut Vec<u8>,
        limit: usize,
        budget: Duration,
    ) -> Result<usize, SlotError> {
        self.state.next(SlotEvent::AnswerReceived)?;
        let stream = self.stream()?;
        stream
            .set_read_timeout(Some(budget))
            .map_err(|source| ProtocolError::Io { field: wire::Field::ResultLen, source })?;
        let len = wire::read_result(stream, out, limit)?;
        self.advance(SlotEvent::AnswerReceived)?;
        Ok(len)
    }

    /// Write the end-of-work sentinel and close the connection.
    ///
    /// Returns `false` when the slot had no open connection. The sentinel is
    /// best effort and never blocks: it is dropped if the peer is gone or its
    /// buffers are full.
    pub fn close(&mut self) -> bool {
        let Some(mut stream) = self.stream.take() else {
            return false;
        };
        let sent = stream
            .set_nonblocking(true)
            .map_err(|source| ProtocolError::Io { field: wire::Field::Sentinel, source })
            .and_then(|()| wire::write_sentinel(&mut stream));
        if let Err(e) = sent {
            debug!("slot {}: sentinel not delivered: {}", self.index, e);
        }
        let _ = stream.flush();
        debug!("slot {}: closed while {:?}", self.index, self.state);
        true
    }
}

/// Failure while driving one slot
#[derive(Error, Debug)]
pub enum SlotError {
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
