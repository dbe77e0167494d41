//! One pinned compute thread per requested core

use std::io;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info};
use thiserror::Error;

use super::accumulator::Accumulator;
use super::affinity::{self, CpuMap};

/// Splits a task into per-core parts
pub trait Partition: Sized {
    /// Produce exactly `parts` sub-tasks covering the whole task.
    fn partition(&self, parts: usize) -> Vec<Self>;
}

/// 分发错误类型
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("core count must be positive")]
    NoCores,
    #[error("{requested} cores requested but only {available} available")]
    Oversubscribed { requested: usize, available: usize },
    #[error("partitioner produced {actual} parts for {expected} cores")]
    PartitionMismatch { expected: usize, actual: usize },
    #[error("{context}: {source}")]
    Affinity {
        context: String,
        #[source]
        source: io::Error,
    },
    #[error("unable to spawn dispatch thread {thread}: {source}")]
    Spawn {
        thread: usize,
        #[source]
        source: io::Error,
    },
    #[error("dispatch thread {0} panicked")]
    Panicked(usize),
}

/// Fixed set of compute threads, one per requested core
#[derive(Debug, Clone)]
pub struct CorePool {
    cores: usize,
    cpus: Option<CpuMap>,
}

impl CorePool {
    /// `cores` must be between 1 and the number of available processors.
    pub fn new(cores: usize) -> Result<Self, DispatchError> {
        if cores == 0 {
            return Err(DispatchError::NoCores);
        }
        let available = num_cpus::get();
        if cores > available {
            return Err(DispatchError::Oversubscribed {
                requested: cores,
                available,
            });
        }

        let cpus = if cores > 1 {
            let map = CpuMap::current().map_err(|source| DispatchError::Affinity {
                context: "unable to read CPU affinity set".into(),
                source,
            })?;
            Some(map)
        } else {
            None
        };
        Ok(Self { cores, cpus })
    }

    pub fn cores(&self) -> usize {
        self.cores
    }

    /// Partition `task` across the pool and run it.
    pub fn distribute<T, R, C, F>(
        &self,
        task: &T,
        compute: C,
        accumulator: &Accumulator<R, F>,
    ) -> Result<Duration, DispatchError>
    where
        T: Partition + Sync,
        R: Send,
        C: Fn(&T) -> R + Sync,
        F: Fn(&mut R, R) + Sync,
    {
        let parts = task.partition(self.cores);
        self.run(&parts, compute, accumulator)
    }

    /// Compute every part and fold the partials into `accumulator`.
    ///
    /// Returns the wall-clock time from dispatch to the last join.
    pub fn run<P, R, C, F>(
        &self,
        parts: &[P],
        compute: C,
        accumulator: &Accumulator<R, F>,
    ) -> Result<Duration, DispatchError>
    where
        P: Sync,
        R: Send,
        C: Fn(&P) -> R + Sync,
        F: Fn(&mut R, R) + Sync,
    {
        if parts.len() != self.cores {
            return Err(DispatchError::PartitionMismatch {
                expected: self.cores,
                actual: parts.len(),
            });
        }

        let started = Instant::now();
        match &self.cpus {
            Some(cpus) if self.cores > 1 => Self::fan_out(cpus, parts, &compute, accumulator)?,
            _ => accumulator.add(compute(&parts[0])),
        }
        let elapsed = started.elapsed();

        info!("computed {} parts in {:?}", self.cores, elapsed);
        metrics::histogram!("hive_drone_dispatch_seconds").record(elapsed.as_secs_f64());
        Ok(elapsed)
    }

    fn fan_out<P, R, C, F>(
        cpus: &CpuMap,
        parts: &[P],
        compute: &C,
        accumulator: &Accumulator<R, F>,
    ) -> Result<(), DispatchError>
    where
        P: Sync,
        R: Send,
        C: Fn(&P) -> R + Sync,
        F: Fn(&mut R, R) + Sync,
    {
        thread::scope(|scope| {
            let mut handles = Vec::with_capacity(parts.len());
            let mut failure = None;

            for (index, part) in parts.iter().enumerate() {
                let cpu = cpus.cpu_for(index);
                let spawned = thread::Builder::new()
                    .name(format!("hive-core-{}", index))
                    .spawn_scoped(scope, move || -> Result<(), DispatchError> {
                        affinity::pin_current(cpu).map_err(|source| DispatchError::Affinity {
                            context: format!("unable to pin thread {} to cpu {}", index, cpu),
                            source,
                        })?;
                        debug!("thread {} pinned to cpu {}", index, cpu);
                        accumulator.add(compute(part));
                        Ok(())
                    });
                match spawned {
                    Ok(handle) => handles.push((index, handle)),
                    Err(source) => {
                        failure = Some(DispatchError::Spawn { thread: index, source });
                        break;
                    }
                }
            }

            // 必须全部join，未join的panic会在scope结束时传播
            for (index, handle) in handles {
                match handle.join() {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        failure.get_or_insert(e);
                    }
                    Err(_) => {
                        failure.get_or_insert(DispatchError::Panicked(index));
                    }
                }
            }

            match failure {
                Some(e) => Err(e),
                None => Ok(()),
            }
        })
    }
}
