//! Frames and the window state persisted by storage backends.

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

/// A single time bucket and its counter value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    /// Start of the bucket, aligned to the frame step.
    pub bucket_start: DateTime<FixedOffset>,
    /// Counter value for the bucket.
    pub value: i64,
}

/// The frame ring and running sum of one gate.
///
/// `values[0]` belongs to the bucket starting at `head`; `values[i]` to the
/// bucket `i` frame steps earlier. A state with no `head` has never been used
/// (or was cleared) and behaves like a window idle for longer than its size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowState {
    pub(crate) head: Option<i64>,
    pub(crate) values: Vec<i64>,
    pub(crate) sum: i64,
}

impl WindowState {
    /// An unused window of `frame_count` zero frames.
    pub fn empty(frame_count: usize) -> Self {
        Self {
            head: None,
            values: vec![0; frame_count],
            sum: 0,
        }
    }

    /// Rebuild a state from its stored parts.
    ///
    /// Missing trailing frames are treated as zero and extra frames are dropped,
    /// so a backend never hands the engine a ring of the wrong length. A ring
    /// repaired this way gets its sum recomputed from the kept frames.
    pub fn from_parts(head: Option<i64>, mut values: Vec<i64>, sum: i64, frame_count: usize) -> Self {
        if values.len() == frame_count {
            return Self { head, values, sum };
        }
        values.resize(frame_count, 0);
        let sum = values.iter().fold(0i64, |acc, v| acc.saturating_add(*v));
        Self { head, values, sum }
    }

    /// Start of the current bucket in Unix milliseconds, if the window was ever used.
    pub fn head_millis(&self) -> Option<i64> {
        self.head
    }

    /// Frame values, newest first.
    pub fn values(&self) -> &[i64] {
        &self.values
    }

    /// Running window sum.
    pub fn sum(&self) -> i64 {
        self.sum
    }

    /// Value of the newest frame.
    pub fn current_value(&self) -> i64 {
        self.values.first().copied().unwrap_or(0)
    }

    /// True until the first update after creation or a clear.
    pub fn is_fresh(&self) -> bool {
        self.head.is_none()
    }

    /// Whether the running sum matches the frame values.
    pub fn sum_is_consistent(&self) -> bool {
        self.values.iter().sum::<i64>() == self.sum
    }

    pub(crate) fn reset(&mut self, head: Option<i64>) {
        self.values.iter_mut().for_each(|v| *v = 0);
        self.sum = 0;
        self.head = head;
    }
}
