use std::time::Duration;

/// Yields the same delay forever. Combine with [Iterator::take] to bound the attempts.
#[derive(Debug, Clone, Copy)]
pub struct Interval {
    duration: Duration,
}

impl Interval {
    pub fn from_millis(millis: u64) -> Self {
        Self {
            duration: Duration::from_millis(millis),
        }
    }
}

impl Iterator for Interval {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.duration)
    }
}
