//! Lock-guarded fold of partial results

use parking_lot::Mutex;

/// Aggregate shared by the dispatch threads
///
/// Every [`add`](Accumulator::add) runs the combine function under one lock,
/// so partials are folded one at a time. The order they arrive in is not
/// fixed.
pub struct Accumulator<T, F> {
    value: Mutex<T>,
    combine: F,
}

impl<T, F> Accumulator<T, F>
where
    F: Fn(&mut T, T),
{
    pub fn new(initial: T, combine: F) -> Self {
        Self {
            value: Mutex::new(initial),
            combine,
        }
    }

    /// Fold one partial result into the aggregate
    pub fn add(&self, partial: T) {
        let mut value = self.value.lock();
        (self.combine)(&mut value, partial);
    }

    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T: Clone, F> Accumulator<T, F> {
    /// Copy of the current aggregate
    pub fn snapshot(&self) -> T {
        self.value.lock().clone()
    }
}

impl<T: std::fmt::Debug, F> std::fmt::Debug for Accumulator<T, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Accumulator").field("value", &self.value).finish()
    }
}

/// Accumulator that sums `f64` partials, the fold used for integrals
pub fn summing(initial: f64) -> Accumulator<f64, fn(&mut f64, f64)> {
    fn add(total: &mut f64, partial: f64) {
        *total += partial;
    }
    Accumulator::new(initial, add as fn(&mut f64, f64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_concurrent_adds_are_exact() {
        const THREADS: u64 = 8;
        const ADDS: u64 = 10_000;

        let acc = Accumulator::new(0u64, |total: &mut u64, partial| *total += partial);
        thread::scope(|s| {
            for _ in 0..THREADS {
                s.spawn(|| {
                    for _ in 0..ADDS {
                        acc.add(1);
                    }
                });
            }
        });

        assert_eq!(acc.into_inner(), THREADS * ADDS);
    }

    #[test]
    fn test_combine_sees_every_partial() {
        let acc = Accumulator::new(Vec::new(), |all: &mut Vec<u32>, mut part: Vec<u32>| {
            all.append(&mut part)
        });
        acc.add(vec![3]);
        acc.add(vec![1, 2]);

        let mut all = acc.into_inner();
        all.sort_unstable();
        assert_eq!(all, vec![1, 2, 3]);
    }

    #[test]
    fn test_summing() {
        let acc = summing(1.5);
        acc.add(2.0);
        assert_eq!(acc.snapshot(), 3.5);
    }
}
