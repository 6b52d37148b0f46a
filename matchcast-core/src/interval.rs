use std::time::Duration;

use thiserror::Error;

use crate::model::Interval;

#[derive(Debug, Error, PartialEq)]
pub enum IntervalError {
    #[error("video duration must be positive and finite (got {0})")]
    InvalidDuration(f64),
    #[error("analysis window must be positive and finite (got {0})")]
    InvalidWindow(f64),
}

pub type IntervalResult<T> = std::result::Result<T, IntervalError>;

/// Decomposes a video duration into fixed analysis windows. Iteration is
/// restartable and always yields the same sequence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntervalSplitter {
    duration: Duration,
    window: Duration,
}

impl IntervalSplitter {
    pub fn new(duration: Duration, window: Duration) -> IntervalResult<Self> {
        if duration.is_zero() {
            return Err(IntervalError::InvalidDuration(0.0));
        }
        if window.is_zero() {
            return Err(IntervalError::InvalidWindow(0.0));
        }
        Ok(Self { duration, window })
    }

    pub fn from_seconds(duration: f64, window: f64) -> IntervalResult<Self> {
        if !duration.is_finite() || duration <= 0.0 {
            return Err(IntervalError::InvalidDuration(duration));
        }
        if !window.is_finite() || window <= 0.0 {
            return Err(IntervalError::InvalidWindow(window));
        }
        Self::new(
            Duration::from_secs_f64(duration),
            Duration::from_secs_f64(window),
        )
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn len(&self) -> usize {
        let full = self.duration.as_nanos() / self.window.as_nanos();
        let partial = self.duration.as_nanos() % self.window.as_nanos() != 0;
        full as usize + usize::from(partial)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> Intervals {
        Intervals {
            splitter: *self,
            next: 0,
            total: self.len(),
        }
    }

    pub fn intervals(&self) -> Vec<Interval> {
        self.iter().collect()
    }

    /// Advisory segment estimate used for progress reporting.
    pub fn expected_segments(&self) -> usize {
        (self.duration.as_secs() / 30).max(1) as usize
    }
}

impl IntoIterator for &IntervalSplitter {
    type Item = Interval;
    type IntoIter = Intervals;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[derive(Debug, Clone)]
pub struct Intervals {
    splitter: IntervalSplitter,
    next: usize,
    total: usize,
}

impl Iterator for Intervals {
    type Item = Interval;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.total {
            return None;
        }
        let index = self.next;
        self.next += 1;
        let start = self.splitter.window * index as u32;
        let end = (start + self.splitter.window).min(self.splitter.duration);
        Some(Interval { index, start, end })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.total - self.next;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Intervals {}
