//! Midpoint-rule integration of `sin(x)`, the reference job
//!
//! The queen plans one [`IntegralTask`] per drone over `[left, right]`; each
//! drone splits its task again across its cores and sums the partials.

use crate::drone::Partition;
use crate::proto::record::check_size;
use crate::proto::{ProtocolError, Record};

/// Default integration interval and precision
pub const DEFAULT_LEFT: f64 = 1.0;
pub const DEFAULT_RIGHT: f64 = 2_000_000.0;
pub const DEFAULT_PRECISION: f64 = 1e-7;

/// A run of `steps` rectangles of width `step` starting at `left`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntegralTask {
    pub left: f64,
    pub step: f64,
    pub steps: u64,
}

impl IntegralTask {
    /// Right edge of the covered interval
    pub fn right(&self) -> f64 {
        self.left + self.step * self.steps as f64
    }
}

// Layout: size header (u64), left, step, steps. Native byte order.
impl Record for IntegralTask {
    const SIZE: usize = 32;

    fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&(Self::SIZE as u64).to_ne_bytes());
        buf.extend_from_slice(&self.left.to_ne_bytes());
        buf.extend_from_slice(&self.step.to_ne_bytes());
        buf.extend_from_slice(&self.steps.to_ne_bytes());
    }

    fn read_from(bytes: &[u8]) -> Result<Self, ProtocolError> {
        check_size(Self::SIZE, bytes)?;
        let word = |i: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[i * 8..(i + 1) * 8]);
            raw
        };

        let header = u64::from_ne_bytes(word(0));
        if header != Self::SIZE as u64 {
            return Err(ProtocolError::RecordSize {
                expected: Self::SIZE,
                actual: usize::try_from(header).unwrap_or(usize::MAX),
            });
        }
        Ok(Self {
            left: f64::from_ne_bytes(word(1)),
            step: f64::from_ne_bytes(word(2)),
            steps: u64::from_ne_bytes(word(3)),
        })
    }
}

impl Partition for IntegralTask {
    fn partition(&self, parts: usize) -> Vec<Self> {
        let mut left = self.left;
        split_units(self.steps, parts)
            .into_iter()
            .map(|steps| {
                let part = IntegralTask {
                    left,
                    step: self.step,
                    steps,
                };
                left += self.step * steps as f64;
                part
            })
            .collect()
    }
}

/// Split `total` units into `parts` runs; the first `total % parts` get one extra.
pub fn split_units(total: u64, parts: usize) -> Vec<u64> {
    if parts == 0 {
        return Vec::new();
    }
    let parts_u64 = parts as u64;
    let base = total / parts_u64;
    let extra = total % parts_u64;
    (0..parts_u64)
        .map(|i| if i < extra { base + 1 } else { base })
        .collect()
}

/// Rectangle width that keeps the midpoint error under `precision`
fn step_for(right: f64, precision: f64) -> f64 {
    let max_ddf = right.sin();
    if max_ddf == 0.0 {
        return 1.0;
    }
    (24.0 * precision / max_ddf.abs()).sqrt()
}

/// Plan one task per node covering `[left, right]`.
pub fn plan(left: f64, right: f64, precision: f64, nodes: usize) -> Vec<IntegralTask> {
    let step = step_for(right, precision);
    let steps = ((right - left).abs() / step).ceil() as u64 + 2;
    let whole = IntegralTask {
        left,
        step: (right - left) / steps as f64,
        steps,
    };
    whole.partition(nodes)
}

/// Σ step · sin(left + step/2 + k·step) over the task's rectangles
pub fn midpoint_sin(task: &IntegralTask) -> f64 {
    let start = task.left + task.step / 2.0;
    (0..task.steps)
        .map(|k| task.step * (start + k as f64 * task.step).sin())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    #[test]
    fn test_split_units_example() {
        assert_eq!(split_units(10, 3), vec![4, 3, 3]);
        assert_eq!(split_units(2, 4), vec![1, 1, 0, 0]);
        assert!(split_units(5, 0).is_empty());
    }

    proptest! {
        #[test]
        fn split_units_conserves_total(total in 0u64..1_000_000, parts in 1usize..64) {
            let split = split_units(total, parts);
            prop_assert_eq!(split.len(), parts);
            prop_assert_eq!(split.iter().sum::<u64>(), total);
            let max = *split.iter().max().unwrap();
            let min = *split.iter().min().unwrap();
            prop_assert!(max - min <= 1);
        }
    }

    #[test]
    fn test_plan_covers_interval() {
        let tasks = plan(0.0, 10.0, 1e-4, 3);
        assert_eq!(tasks.len(), 3);
        assert_relative_eq!(tasks[0].left, 0.0);
        for pair in tasks.windows(2) {
            assert_relative_eq!(pair[0].right(), pair[1].left, epsilon = 1e-9);
        }
        assert_relative_eq!(tasks[2].right(), 10.0, epsilon = 1e-9);
    }

    #[test]
    fn test_midpoint_matches_closed_form() {
        let tasks = plan(0.0, 10.0, 1e-4, 1);
        let expected = 1.0 - 10.0f64.cos();
        assert_relative_eq!(midpoint_sin(&tasks[0]), expected, epsilon = 1e-3);
    }

    #[test]
    fn test_partition_preserves_sum() {
        let whole = plan(0.0, 3.0, 1e-6, 1)[0];
        let parts = whole.partition(4);
        assert_eq!(parts.iter().map(|p| p.steps).sum::<u64>(), whole.steps);
        let summed: f64 = parts.iter().map(midpoint_sin).sum();
        assert_relative_eq!(summed, midpoint_sin(&whole), epsilon = 1e-9);
    }

    #[test]
    fn test_task_record_layout() {
        let task = IntegralTask {
            left: 1.5,
            step: 0.25,
            steps: 7,
        };
        let bytes = task.to_bytes();
        assert_eq!(bytes.len(), IntegralTask::SIZE);
        assert_eq!(&bytes[..8], &32u64.to_ne_bytes());
        assert_eq!(IntegralTask::read_from(&bytes).unwrap(), task);
    }

    #[test]
    fn test_bad_size_header_rejected() {
        let mut bytes = IntegralTask {
            left: 0.0,
            step: 1.0,
            steps: 1,
        }
        .to_bytes();
        bytes[..8].copy_from_slice(&16u64.to_ne_bytes());
        assert!(IntegralTask::read_from(&bytes).is_err());
    }
}
