//! Bucket arithmetic, sliding and the admission function.
//!
//! Everything here is pure: backends call [`WindowLayout::apply`] inside their
//! own atomicity primitive, and the remote backend's server-side script is a
//! line-for-line port of the same function.

use std::time::Duration;

use chrono::{DateTime, FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};
use tracing::trace;

use super::frame::{Frame, WindowState};
use crate::error::{GateError, Result};

/// Largest magnitude of an amount, a limit, a frame value or the window sum.
///
/// Two values of this size still add up exactly in an `f64`, which is what
/// the remote script computes with.
pub const MAX_MAGNITUDE: i64 = 1 << 52;

/// How decrements that would take a frame or the window below zero are handled.
///
/// Has no default; every gate names one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FloorPolicy {
    /// Refuse the decrement with an underflow error.
    Reject,
    /// Shrink the decrement so neither the frame nor the sum drops below zero.
    Clamp,
    /// Apply the decrement as is; values may go negative.
    Allow,
}

impl FloorPolicy {
    /// Wire name shared with the remote script.
    pub fn as_str(&self) -> &'static str {
        match self {
            FloorPolicy::Reject => "reject",
            FloorPolicy::Clamp => "clamp",
            FloorPolicy::Allow => "allow",
        }
    }
}

/// Frame and window limits. Zero disables a limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Limits {
    /// Maximum value of the current frame.
    pub frame: i64,
    /// Maximum window sum.
    pub window: i64,
}

impl Limits {
    /// Validate and build limits.
    pub fn new(frame: u64, window: u64) -> Result<Self> {
        let frame = i64::try_from(frame)
            .map_err(|_| GateError::Config(format!("frame limit {} is too large", frame)))?;
        let window = i64::try_from(window)
            .map_err(|_| GateError::Config(format!("window limit {} is too large", window)))?;
        if frame > MAX_MAGNITUDE || window > MAX_MAGNITUDE {
            return Err(GateError::Config(format!(
                "limits can not exceed {}",
                MAX_MAGNITUDE
            )));
        }
        if window > 0 && frame > window {
            return Err(GateError::Config(format!(
                "frame limit ({}) can not exceed window limit ({}) when both are set",
                frame, window
            )));
        }
        Ok(Self { frame, window })
    }

    /// An increment larger than a set limit, or any amount beyond
    /// [`MAX_MAGNITUDE`], can never be admitted.
    pub fn unsatisfiable(&self, amount: i64) -> Option<Breach> {
        if amount.unsigned_abs() > MAX_MAGNITUDE.unsigned_abs() {
            return Some(Breach::new(BreachKind::Overflow, MAX_MAGNITUDE, 0, amount));
        }
        if self.frame > 0 && amount > self.frame {
            return Some(Breach::new(BreachKind::FrameLimit, self.frame, 0, amount));
        }
        if self.window > 0 && amount > self.window {
            return Some(Breach::new(BreachKind::WindowLimit, self.window, 0, amount));
        }
        None
    }
}

/// One atomic read-modify-write request against a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Update {
    /// Caller's notion of now, Unix milliseconds.
    pub now_ms: i64,
    /// Signed amount; negative values are decrements.
    pub amount: i64,
    pub limits: Limits,
    pub floor: FloorPolicy,
    /// `false` turns the update into a read-only probe (the slide is still stored).
    pub commit: bool,
}

impl Update {
    /// A committing update of `amount`.
    pub fn commit(now_ms: i64, amount: i64, limits: Limits, floor: FloorPolicy) -> Self {
        Self {
            now_ms,
            amount,
            limits,
            floor,
            commit: true,
        }
    }

    /// A probe that reports whether a limit has been reached.
    pub fn probe(now_ms: i64, limits: Limits, floor: FloorPolicy) -> Self {
        Self {
            now_ms,
            amount: 0,
            limits,
            floor,
            commit: false,
        }
    }
}

/// Which constraint an update ran into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BreachKind {
    FrameLimit,
    WindowLimit,
    FrameUnderflow,
    WindowUnderflow,
    /// The frame value or the sum would leave `±MAX_MAGNITUDE`.
    Overflow,
}

impl BreachKind {
    /// Numeric code used by the remote script.
    pub fn code(&self) -> i64 {
        match self {
            BreachKind::FrameLimit => 1,
            BreachKind::WindowLimit => 2,
            BreachKind::FrameUnderflow => 3,
            BreachKind::WindowUnderflow => 4,
            BreachKind::Overflow => 5,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(BreachKind::FrameLimit),
            2 => Some(BreachKind::WindowLimit),
            3 => Some(BreachKind::FrameUnderflow),
            4 => Some(BreachKind::WindowUnderflow),
            5 => Some(BreachKind::Overflow),
            _ => None,
        }
    }
}

/// A violated limit (or floor) with the values that violated it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Breach {
    pub kind: BreachKind,
    /// Configured limit; zero for floor breaches.
    pub limit: i64,
    /// Frame value or window sum before the update.
    pub current: i64,
    /// Attempted amount.
    pub amount: i64,
}

impl Breach {
    pub fn new(kind: BreachKind, limit: i64, current: i64, amount: i64) -> Self {
        Self {
            kind,
            limit,
            current,
            amount,
        }
    }

    /// How far past the limit (or below zero) the update would have gone.
    pub fn excess(&self) -> i64 {
        match self.kind {
            BreachKind::FrameLimit | BreachKind::WindowLimit => {
                self.current.saturating_add(self.amount) - self.limit
            }
            BreachKind::FrameUnderflow | BreachKind::WindowUnderflow => {
                -(self.current.saturating_add(self.amount))
            }
            BreachKind::Overflow => {
                self.current.saturating_add(self.amount).saturating_abs() - self.limit
            }
        }
    }

    /// Whether waiting for time to pass can resolve this breach.
    pub fn is_limit(&self) -> bool {
        matches!(self.kind, BreachKind::FrameLimit | BreachKind::WindowLimit)
    }
}

impl From<Breach> for GateError {
    fn from(breach: Breach) -> Self {
        let Breach {
            kind,
            limit,
            current,
            amount,
        } = breach;
        match kind {
            BreachKind::FrameLimit => GateError::FrameLimit {
                limit,
                current,
                amount,
            },
            BreachKind::WindowLimit => GateError::WindowLimit {
                limit,
                current,
                amount,
            },
            BreachKind::FrameUnderflow => GateError::FrameUnderflow { current, amount },
            BreachKind::WindowUnderflow => GateError::WindowUnderflow { current, amount },
            BreachKind::Overflow => GateError::Overflow { current, amount },
        }
    }
}

/// Values of the current frame and the window right after an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub frame_value: i64,
    pub window_sum: i64,
}

/// Outcome of [`WindowLayout::apply`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// The update was committed (or the probe found room).
    Admitted(Admission),
    /// Nothing was committed. Frame checks come first.
    Rejected(Vec<Breach>),
}

impl Verdict {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Verdict::Admitted(_))
    }
}

/// What a slide did to the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slide {
    /// Now is still inside the stored current bucket (or behind it).
    Unchanged,
    /// The ring advanced by this many frames.
    Advanced(usize),
    /// The window was unused or idle for at least its whole size.
    Reset,
}

/// Geometry of a window: frame step, frame count and bucket alignment offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowLayout {
    frame_step_ms: i64,
    frame_count: usize,
    offset_ms: i64,
}

impl WindowLayout {
    /// Validate a window size and frame step.
    ///
    /// The step must be a positive whole number of milliseconds, no longer
    /// than the window, and divide it exactly.
    pub fn new(window_size: Duration, frame_step: Duration) -> Result<Self> {
        if frame_step.is_zero() {
            return Err(GateError::Config("frame step must be positive".to_string()));
        }
        if frame_step.subsec_nanos() % 1_000_000 != 0 || window_size.subsec_nanos() % 1_000_000 != 0
        {
            return Err(GateError::Config(
                "window size and frame step must be whole milliseconds".to_string(),
            ));
        }
        if frame_step > window_size {
            return Err(GateError::Config(format!(
                "frame step ({:?}) can not exceed window size ({:?})",
                frame_step, window_size
            )));
        }
        let step = frame_step.as_millis();
        let window = window_size.as_millis();
        if window % step != 0 {
            return Err(GateError::Config(format!(
                "window size ({:?}) must be divisible by frame step ({:?})",
                window_size, frame_step
            )));
        }
        let frame_step_ms = i64::try_from(step)
            .map_err(|_| GateError::Config("frame step is too large".to_string()))?;
        let frame_count = usize::try_from(window / step)
            .map_err(|_| GateError::Config("too many frames".to_string()))?;
        Ok(Self {
            frame_step_ms,
            frame_count,
            offset_ms: 0,
        })
    }

    /// Align buckets to the given UTC offset instead of UTC.
    pub fn with_offset(mut self, offset: FixedOffset) -> Self {
        self.offset_ms = i64::from(offset.local_minus_utc()) * 1_000;
        self
    }

    pub fn frame_step_ms(&self) -> i64 {
        self.frame_step_ms
    }

    pub fn frame_step(&self) -> Duration {
        Duration::from_millis(self.frame_step_ms as u64)
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    pub fn window_size_ms(&self) -> i64 {
        self.frame_step_ms * self.frame_count as i64
    }

    pub fn window_size(&self) -> Duration {
        Duration::from_millis(self.window_size_ms() as u64)
    }

    pub fn offset_ms(&self) -> i64 {
        self.offset_ms
    }

    pub fn offset(&self) -> FixedOffset {
        FixedOffset::east_opt((self.offset_ms / 1_000) as i32).unwrap_or_else(|| Utc.fix())
    }

    /// Floor `now_ms` to the start of its bucket in the layout's time zone.
    pub fn current_bucket_start(&self, now_ms: i64) -> i64 {
        let local = now_ms + self.offset_ms;
        local - local.rem_euclid(self.frame_step_ms) - self.offset_ms
    }

    /// Time left until the bucket containing `now_ms` ends.
    pub fn until_next_frame(&self, now_ms: i64) -> Duration {
        let next = self.current_bucket_start(now_ms) + self.frame_step_ms;
        Duration::from_millis((next - now_ms).max(0) as u64)
    }

    /// Advance the ring so that `values[0]` is the bucket containing `now_ms`.
    ///
    /// Frames that fall out of the window are subtracted from the sum and
    /// replaced with zero frames for every skipped bucket, so the ring stays
    /// contiguous after any idle gap.
    pub fn slide(&self, state: &mut WindowState, now_ms: i64) -> Slide {
        let bucket = self.current_bucket_start(now_ms);

        let head = match state.head {
            Some(head) if state.values.len() == self.frame_count => head,
            _ => {
                state.values.resize(self.frame_count, 0);
                state.reset(Some(bucket));
                return Slide::Reset;
            }
        };

        if bucket <= head {
            return Slide::Unchanged;
        }

        let shift = (bucket - head) / self.frame_step_ms;
        if shift >= self.frame_count as i64 {
            state.reset(Some(bucket));
            return Slide::Reset;
        }

        let shift = shift as usize;
        state.values.rotate_right(shift);
        let dropped = state.values[..shift]
            .iter()
            .fold(0i64, |acc, v| acc.saturating_add(*v));
        state.values[..shift].iter_mut().for_each(|v| *v = 0);
        state.sum = state.sum.saturating_sub(dropped);
        state.head = Some(bucket);
        Slide::Advanced(shift)
    }

    /// The admission function: slide, evaluate limits, then commit or reject.
    ///
    /// On rejection only the slide is kept; the frame and the sum are left
    /// untouched.
    pub fn apply(&self, state: &mut WindowState, update: &Update) -> Verdict {
        match self.slide(state, update.now_ms) {
            Slide::Unchanged => {}
            Slide::Advanced(frames) => {
                trace!(frames = frames, head = ?state.head, sum = state.sum, "Window advanced");
            }
            Slide::Reset => trace!(head = ?state.head, "Window reset"),
        }

        let current = state.current_value();
        let sum = state.sum;
        let limits = update.limits;

        if !update.commit {
            return probe(current, sum, limits);
        }

        let amount = update.amount;
        let mut delta = amount;
        let mut breaches = Vec::new();

        if amount > 0 {
            if limits.frame > 0 && current.saturating_add(amount) > limits.frame {
                breaches.push(Breach::new(BreachKind::FrameLimit, limits.frame, current, amount));
            }
            if limits.window > 0 && sum.saturating_add(amount) > limits.window {
                breaches.push(Breach::new(BreachKind::WindowLimit, limits.window, sum, amount));
            }
        } else if amount < 0 {
            match update.floor {
                FloorPolicy::Reject => {
                    if current.saturating_add(amount) < 0 {
                        breaches.push(Breach::new(BreachKind::FrameUnderflow, 0, current, amount));
                    }
                    if sum.saturating_add(amount) < 0 {
                        breaches.push(Breach::new(BreachKind::WindowUnderflow, 0, sum, amount));
                    }
                }
                FloorPolicy::Clamp => {
                    delta = amount.max(-current.max(0)).max(-sum.max(0));
                }
                FloorPolicy::Allow => {}
            }
        }

        if !breaches.is_empty() {
            return Verdict::Rejected(breaches);
        }
        if delta == 0 {
            return Verdict::Admitted(Admission {
                frame_value: current,
                window_sum: sum,
            });
        }

        let in_range = |v: &i64| v.unsigned_abs() <= MAX_MAGNITUDE.unsigned_abs();
        let frame_value = current.checked_add(delta).filter(in_range);
        let window_sum = sum.checked_add(delta).filter(in_range);
        let (frame_value, window_sum) = match (frame_value, window_sum) {
            (Some(frame_value), Some(window_sum)) => (frame_value, window_sum),
            (None, _) => {
                return Verdict::Rejected(vec![Breach::new(BreachKind::Overflow, MAX_MAGNITUDE, current, amount)])
            }
            (_, None) => {
                return Verdict::Rejected(vec![Breach::new(BreachKind::Overflow, MAX_MAGNITUDE, sum, amount)])
            }
        };
        state.values[0] = frame_value;
        state.sum = window_sum;
        Verdict::Admitted(Admission {
            frame_value: state.values[0],
            window_sum: state.sum,
        })
    }

    /// Frames of `state` with their bucket starts, newest first.
    ///
    /// An unused state is shown as zero frames ending at the bucket containing `now_ms`.
    pub fn frames(&self, state: &WindowState, now_ms: i64) -> Vec<Frame> {
        let head = state
            .head
            .unwrap_or_else(|| self.current_bucket_start(now_ms));
        let offset = self.offset();
        (0..self.frame_count)
            .map(|i| Frame {
                bucket_start: self.to_datetime(head - i as i64 * self.frame_step_ms, offset),
                value: state.values.get(i).copied().unwrap_or(0),
            })
            .collect()
    }

    /// Rebuild a state from frames, checking alignment, contiguity and the sum.
    pub fn state_from_frames(&self, frames: &[Frame], sum: i64) -> Result<WindowState> {
        if frames.len() != self.frame_count {
            return Err(GateError::Snapshot(format!(
                "expected {} frames, got {}",
                self.frame_count,
                frames.len()
            )));
        }

        let head = frames[0].bucket_start.timestamp_millis();
        if self.current_bucket_start(head) != head {
            return Err(GateError::Snapshot(format!(
                "bucket start {} is not aligned to the frame step",
                frames[0].bucket_start
            )));
        }
        for (i, frame) in frames.iter().enumerate() {
            let expected = head - i as i64 * self.frame_step_ms;
            if frame.bucket_start.timestamp_millis() != expected {
                return Err(GateError::Snapshot(format!(
                    "frame {} starts at {}, expected a contiguous bucket",
                    i, frame.bucket_start
                )));
            }
        }

        let values: Vec<i64> = frames.iter().map(|f| f.value).collect();
        let total: i64 = values.iter().sum();
        if total != sum {
            return Err(GateError::Snapshot(format!(
                "sum {} does not match frame total {}",
                sum, total
            )));
        }

        Ok(WindowState {
            head: Some(head),
            values,
            sum,
        })
    }

    fn to_datetime(&self, millis: i64, offset: FixedOffset) -> DateTime<FixedOffset> {
        DateTime::<Utc>::from_timestamp_millis(millis)
            .unwrap_or_default()
            .with_timezone(&offset)
    }
}

fn probe(current: i64, sum: i64, limits: Limits) -> Verdict {
    let mut breaches = Vec::new();
    if limits.frame > 0 && current >= limits.frame {
        breaches.push(Breach::new(BreachKind::FrameLimit, limits.frame, current, 0));
    }
    if limits.window > 0 && sum >= limits.window {
        breaches.push(Breach::new(BreachKind::WindowLimit, limits.window, sum, 0));
    }
    if breaches.is_empty() {
        Verdict::Admitted(Admission {
            frame_value: current,
            window_sum: sum,
        })
    } else {
        Verdict::Rejected(breaches)
    }
}
