//! CPU pinning for dispatch threads
//!
//! Logical CPU `k` is the `k`-th CPU in the process's allowed set, so pinning
//! stays valid inside containers and under `taskset`.

use std::io;

/// Allowed CPUs of this process, in ascending order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuMap {
    cpus: Vec<usize>,
}

impl CpuMap {
    pub fn current() -> io::Result<Self> {
        let cpus = imp::allowed()?;
        if cpus.is_empty() {
            return Err(io::Error::new(io::ErrorKind::Other, "empty CPU affinity set"));
        }
        Ok(Self { cpus })
    }

    pub fn from_cpus(cpus: Vec<usize>) -> Option<Self> {
        (!cpus.is_empty()).then_some(Self { cpus })
    }

    pub fn len(&self) -> usize {
        self.cpus.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cpus.is_empty()
    }

    /// System CPU id behind logical CPU `logical`
    pub fn cpu_for(&self, logical: usize) -> usize {
        self.cpus[logical % self.cpus.len()]
    }
}

/// Pin the calling thread to system CPU `cpu`.
pub fn pin_current(cpu: usize) -> io::Result<()> {
    imp::pin(cpu)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
mod imp {
    use std::io;

    use nix::sched::{sched_getaffinity, sched_setaffinity, CpuSet};
    use nix::unistd::Pid;

    pub fn allowed() -> io::Result<Vec<usize>> {
        let set = sched_getaffinity(Pid::from_raw(0)).map_err(io::Error::from)?;
        Ok((0..CpuSet::count())
            .filter(|&cpu| set.is_set(cpu).unwrap_or(false))
            .collect())
    }

    pub fn pin(cpu: usize) -> io::Result<()> {
        let mut set = CpuSet::new();
        set.set(cpu).map_err(io::Error::from)?;
        // pid 0 targets the calling thread
        sched_setaffinity(Pid::from_raw(0), &set).map_err(io::Error::from)
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
mod imp {
    use std::io;

    pub fn allowed() -> io::Result<Vec<usize>> {
        Ok((0..num_cpus::get()).collect())
    }

    pub fn pin(cpu: usize) -> io::Result<()> {
        log::debug!("thread affinity unsupported on this platform, cpu {} not pinned", cpu);
        Ok(())
    }
}
