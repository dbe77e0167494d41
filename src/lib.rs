//! HivePool 核心库入口
//!
//! One-shot fan-out of fixed-size tasks from a coordinator (the queen) to `N`
//! worker processes (drones) over TCP, with a global deadline on the results.
//!
//! ```no_run
//! use std::time::Duration;
//! use hive_pool::integral::{self, IntegralTask};
//! use hive_pool::proto::{encode_all, Record};
//! use hive_pool::queen::{start_job, QueenConfig};
//!
//! # fn main() -> hive_pool::Result<()> {
//! let config = QueenConfig::resolve("127.0.0.1", "4000", Duration::from_secs(10), 3)?;
//! let tasks = integral::plan(0.0, 10.0, 1e-6, 3);
//! let output = start_job(config, IntegralTask::SIZE, &encode_all(&tasks))?;
//! let total: f64 = output.decode::<f64>()?.iter().sum();
//! # Ok(())
//! # }
//! ```

pub mod drone;
pub mod event_loop;
pub mod integral;
pub mod proto;
pub mod queen;

use crate::drone::{DispatchError, DroneError};
use crate::proto::ProtocolError;
use crate::queen::QueenError;

#[derive(thiserror::Error, Debug)]
pub enum PoolError {
    #[error("queen error: {0}")]
    Queen(#[from] QueenError),

    #[error("drone error: {0}")]
    Drone(#[from] DroneError),

    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

pub type Result<T> = std::result::Result<T, PoolError>;

// 公开导出模块的公共接口
pub use drone::{Accumulator, CorePool, Drone, DroneConfig, Partition};
pub use proto::{Record, Release};
pub use queen::{start_job, JobOutput, Queen, QueenConfig, WorkerState};
