//! The admission controller.
//!
//! A [`Gate`] turns the window engine and a storage backend into the public
//! operations: attempt an increment (failing fast or waiting for capacity),
//! decrement, probe, clear, snapshot and restore.
//!
//! Every decision is made inside one `atomic_update` call; waiting in
//! [`Mode::Block`] happens between calls and never holds the backend's lock.

mod blocking;
mod snapshot;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{FixedOffset, Offset, Utc};
use rand::Rng;
use tokio::sync::Notify;
use tracing::{debug, info, trace, warn};

pub use blocking::BlockingGate;
pub use snapshot::GateSnapshot;
pub use crate::window::Admission;

use crate::clock::{Clock, SystemClock};
use crate::config::{BackendConfig, GateConfig};
use crate::error::{GateError, Result};
use crate::storage::{self, BackendKind, StorageBackend};
use crate::window::{Breach, FloorPolicy, Frame, Limits, Update, Verdict, WindowLayout};

/// Upper bound on the random delay added to block-mode retries.
const MAX_RETRY_JITTER: Duration = Duration::from_millis(25);

/// What to do when an increment is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Return the throttling error immediately.
    FailFast,
    /// Wait for capacity and retry until admitted or cancelled.
    Block,
}

/// Validated settings of a gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateOptions {
    pub name: String,
    pub window_size: Duration,
    pub frame_step: Duration,
    /// Maximum value of the current frame (0 disables)
    pub frame_limit: u64,
    /// Maximum window sum (0 disables)
    pub window_limit: u64,
    pub floor: FloorPolicy,
    /// Offset frame buckets are aligned to
    pub timezone: FixedOffset,
}

impl GateOptions {
    /// Options with both limits disabled and buckets aligned to UTC.
    pub fn new(
        name: impl Into<String>,
        window_size: Duration,
        frame_step: Duration,
        floor: FloorPolicy,
    ) -> Self {
        Self {
            name: name.into(),
            window_size,
            frame_step,
            frame_limit: 0,
            window_limit: 0,
            floor,
            timezone: Utc.fix(),
        }
    }

    pub fn frame_limit(mut self, limit: u64) -> Self {
        self.frame_limit = limit;
        self
    }

    pub fn window_limit(mut self, limit: u64) -> Self {
        self.window_limit = limit;
        self
    }

    pub fn timezone(mut self, timezone: FixedOffset) -> Self {
        self.timezone = timezone;
        self
    }

    /// Frame geometry these options describe.
    pub fn layout(&self) -> Result<WindowLayout> {
        Ok(WindowLayout::new(self.window_size, self.frame_step)?.with_offset(self.timezone))
    }

    fn limits(&self) -> Result<Limits> {
        Limits::new(self.frame_limit, self.window_limit)
    }
}

/// A named sliding-window admission gate.
///
/// Cloning is cheap and clones share the backend, so waiters on one clone are
/// woken by decrements on another.
#[derive(Debug, Clone)]
pub struct Gate {
    name: String,
    layout: WindowLayout,
    limits: Limits,
    floor: FloorPolicy,
    clock: Arc<dyn Clock>,
    backend: Arc<dyn StorageBackend>,
    released: Arc<Notify>,
}

impl Gate {
    /// Validate `options` and open the backend described by `backend`.
    pub async fn open(options: GateOptions, backend: &BackendConfig) -> Result<Self> {
        let layout = options.layout()?;
        options.limits()?;
        let storage = storage::connect(&options.name, layout, backend).await?;
        Self::with_backend(options, storage)
    }

    /// Open the gate described by a configuration file.
    pub async fn from_config(config: &GateConfig) -> Result<Self> {
        config.validate()?;
        Self::open(config.options()?, &config.backend).await
    }

    /// Build a gate on an already opened backend.
    pub fn with_backend(options: GateOptions, backend: Arc<dyn StorageBackend>) -> Result<Self> {
        if options.name.trim().is_empty() {
            return Err(GateError::Config("gate name must not be empty".to_string()));
        }
        let layout = options.layout()?;
        if backend.layout() != &layout {
            return Err(GateError::Config(format!(
                "backend layout {:?} does not match gate layout {:?}",
                backend.layout(),
                layout
            )));
        }

        Ok(Self {
            limits: options.limits()?,
            name: options.name,
            layout,
            floor: options.floor,
            clock: Arc::new(SystemClock),
            backend,
            released: Arc::new(Notify::new()),
        })
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn layout(&self) -> &WindowLayout {
        &self.layout
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    pub fn floor(&self) -> FloorPolicy {
        self.floor
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    /// Attempt to add `amount` (negative to subtract) to the current frame.
    ///
    /// Rejected increments either fail with the first breached limit
    /// ([`Mode::FailFast`]) or wait for the next frame boundary, or a decrement
    /// on this gate, and retry ([`Mode::Block`]). The wait is cancelled by
    /// dropping the returned future. Amounts that can never fit and underflow
    /// rejections fail immediately in either mode.
    pub async fn attempt(&self, amount: i64, mode: Mode) -> Result<Admission> {
        if let Some(breach) = self.limits.unsatisfiable(amount) {
            debug!(
                gate = %self.name,
                amount = amount,
                limit = breach.limit,
                "Amount can never be admitted"
            );
            return Err(breach.into());
        }

        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            let now = self.now_ms();
            trace!(gate = %self.name, amount = amount, now = now, "Attempting admission");

            let update = Update::commit(now, amount, self.limits, self.floor);
            let breaches = match self.backend.atomic_update(&update).await? {
                Verdict::Admitted(admission) => {
                    trace!(
                        gate = %self.name,
                        frame_value = admission.frame_value,
                        window_sum = admission.window_sum,
                        "Admitted"
                    );
                    if amount < 0 {
                        self.released.notify_waiters();
                    }
                    return Ok(admission);
                }
                Verdict::Rejected(breaches) => breaches,
            };

            let breach = first_breach(&breaches)?;
            if mode == Mode::FailFast || !breaches.iter().all(Breach::is_limit) {
                debug!(
                    gate = %self.name,
                    kind = ?breach.kind,
                    limit = breach.limit,
                    current = breach.current,
                    amount = amount,
                    "Rejected"
                );
                return Err(breach.into());
            }

            let wait = self.layout.until_next_frame(now) + self.jitter();
            debug!(
                gate = %self.name,
                kind = ?breach.kind,
                current = breach.current,
                wait_ms = wait.as_millis() as u64,
                "Waiting for capacity"
            );
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = &mut released => {
                    trace!(gate = %self.name, "Woken by released capacity");
                }
            }
        }
    }

    /// Add `amount`, waiting as long as it takes.
    pub async fn acquire(&self, amount: i64) -> Result<Admission> {
        self.attempt(amount, Mode::Block).await
    }

    /// Add `amount` or fail with a throttling error.
    pub async fn try_acquire(&self, amount: i64) -> Result<Admission> {
        self.attempt(amount, Mode::FailFast).await
    }

    /// Add `amount`, waiting at most `timeout`.
    pub async fn acquire_timeout(&self, amount: i64, timeout: Duration) -> Result<Admission> {
        tokio::time::timeout(timeout, self.attempt(amount, Mode::Block))
            .await
            .map_err(|_| GateError::Timeout(timeout))?
    }

    /// Subtract `amount` from the current frame and wake waiters.
    ///
    /// Decrements are never checked against the limits; the floor policy
    /// decides what happens below zero.
    pub async fn decrement(&self, amount: i64) -> Result<Admission> {
        self.attempt(-amount.saturating_abs(), Mode::FailFast).await
    }

    /// Fail with a throttling error if a limit has already been reached.
    pub async fn check_limits(&self) -> Result<Admission> {
        let update = Update::probe(self.now_ms(), self.limits, self.floor);
        match self.backend.atomic_update(&update).await? {
            Verdict::Admitted(admission) => Ok(admission),
            Verdict::Rejected(breaches) => Err(first_breach(&breaches)?.into()),
        }
    }

    /// Reset every frame and the sum to zero.
    pub async fn clear(&self) -> Result<()> {
        self.backend.clear().await?;
        self.released.notify_waiters();
        info!(gate = %self.name, "Gate cleared");
        Ok(())
    }

    /// Capture the stored state for persistence.
    pub async fn snapshot(&self) -> Result<GateSnapshot> {
        let state = self.backend.snapshot().await?;
        Ok(GateSnapshot {
            name: self.name.clone(),
            window_size_ms: self.layout.window_size_ms(),
            frame_step_ms: self.layout.frame_step_ms(),
            frames: self.layout.frames(&state, self.now_ms()),
            sum: state.sum(),
        })
    }

    /// Replace the stored state with `snapshot`.
    ///
    /// Snapshots taken with a different window size or frame step, or whose
    /// frames are not contiguous or do not add up to their sum, are rejected.
    pub async fn restore(&self, snapshot: &GateSnapshot) -> Result<()> {
        if snapshot.window_size_ms != self.layout.window_size_ms()
            || snapshot.frame_step_ms != self.layout.frame_step_ms()
        {
            return Err(GateError::Snapshot(format!(
                "snapshot window {}ms / step {}ms does not match gate window {}ms / step {}ms",
                snapshot.window_size_ms,
                snapshot.frame_step_ms,
                self.layout.window_size_ms(),
                self.layout.frame_step_ms()
            )));
        }
        if snapshot.name != self.name {
            warn!(
                gate = %self.name,
                snapshot = %snapshot.name,
                "Restoring a snapshot taken from another gate"
            );
        }

        let state = self.layout.state_from_frames(&snapshot.frames, snapshot.sum)?;
        self.backend.restore(&state).await?;
        self.released.notify_waiters();
        info!(gate = %self.name, sum = snapshot.sum, "Gate restored");
        Ok(())
    }

    /// Frames as of now, newest first, with bucket starts in the gate's time zone.
    ///
    /// The view is stale as soon as it is returned and must not be used for
    /// admission decisions.
    pub async fn state(&self) -> Result<Vec<Frame>> {
        let now = self.now_ms();
        let mut state = self.backend.read().await?;
        self.layout.slide(&mut state, now);
        Ok(self.layout.frames(&state, now))
    }

    /// Window sum as of now (stale, see [`Gate::state`]).
    pub async fn sum(&self) -> Result<i64> {
        let mut state = self.backend.read().await?;
        self.layout.slide(&mut state, self.now_ms());
        Ok(state.sum())
    }

    /// The frame containing now.
    pub async fn current_frame(&self) -> Result<Frame> {
        self.state().await?.first().copied().ok_or_else(no_frames)
    }

    /// The oldest frame still in the window.
    pub async fn last_frame(&self) -> Result<Frame> {
        self.state().await?.last().copied().ok_or_else(no_frames)
    }

    /// Admit `amount`, then run `work`.
    ///
    /// Admission is one-shot; nothing is given back when `work` finishes.
    pub async fn throttled<F, T>(&self, amount: i64, mode: Mode, work: F) -> Result<T>
    where
        F: Future<Output = T>,
    {
        self.attempt(amount, mode).await?;
        Ok(work.await)
    }

    fn now_ms(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }

    fn jitter(&self) -> Duration {
        let max = (self.layout.frame_step() / 20).min(MAX_RETRY_JITTER);
        let max_ms = max.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }
}

fn first_breach(breaches: &[Breach]) -> Result<Breach> {
    breaches
        .first()
        .copied()
        .ok_or_else(|| GateError::Backend("rejection without a breach".to_string()))
}

fn no_frames() -> GateError {
    GateError::Backend("window has no frames".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::{LocalBackend, SharedBackend};
    use crate::window::MAX_MAGNITUDE;

    const SECOND: Duration = Duration::from_secs(1);
    const T0: i64 = 1_704_067_200_000;

    fn options(window: u64, step: u64) -> GateOptions {
        GateOptions::new(
            "test-gate",
            Duration::from_secs(window),
            Duration::from_secs(step),
            FloorPolicy::Reject,
        )
    }

    async fn local_gate(options: GateOptions) -> (Gate, ManualClock) {
        let clock = ManualClock::from_millis(T0);
        let gate = Gate::open(options, &BackendConfig::Local)
            .await
            .unwrap()
            .with_clock(Arc::new(clock.clone()));
        (gate, clock)
    }

    fn values(frames: &[Frame]) -> Vec<i64> {
        frames.iter().map(|f| f.value).collect()
    }

    #[tokio::test]
    async fn test_concrete_scenario() {
        let (gate, clock) = local_gate(options(10, 1).frame_limit(2).window_limit(5)).await;

        assert!(gate.try_acquire(1).await.is_ok());
        assert!(gate.try_acquire(1).await.is_ok());
        for _ in 0..4 {
            match gate.try_acquire(1).await {
                Err(GateError::FrameLimit {
                    limit,
                    current,
                    amount,
                }) => assert_eq!((limit, current, amount), (2, 2, 1)),
                other => panic!("expected frame limit, got {:?}", other),
            }
        }

        clock.advance(SECOND);
        let admission = gate.try_acquire(1).await.unwrap();
        assert_eq!(admission.frame_value, 1);
        assert_eq!(admission.window_sum, 3);

        clock.advance(SECOND);
        assert_eq!(gate.try_acquire(1).await.unwrap().window_sum, 4);
        clock.advance(SECOND);
        assert_eq!(gate.try_acquire(1).await.unwrap().window_sum, 5);

        clock.advance(SECOND);
        match gate.try_acquire(1).await {
            Err(GateError::WindowLimit {
                limit,
                current,
                amount,
            }) => assert_eq!((limit, current, amount), (5, 5, 1)),
            other => panic!("expected window limit, got {:?}", other),
        }
        assert_eq!(gate.current_frame().await.unwrap().value, 0);
    }

    #[tokio::test]
    async fn test_idle_gate_behaves_like_fresh_gate() {
        let (used, clock) = local_gate(options(10, 1)).await;
        for _ in 0..5 {
            used.try_acquire(2).await.unwrap();
            clock.advance(SECOND);
        }
        clock.advance(Duration::from_secs(30));
        used.try_acquire(4).await.unwrap();

        let (fresh, fresh_clock) = local_gate(options(10, 1)).await;
        fresh_clock.set(clock.now());
        fresh.try_acquire(4).await.unwrap();

        assert_eq!(used.state().await.unwrap(), fresh.state().await.unwrap());
        assert_eq!(values(&used.state().await.unwrap()), vec![4, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(used.sum().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_gap_filling_keeps_frames_contiguous() {
        let (gate, clock) = local_gate(options(6, 1)).await;
        for amount in 1..=3 {
            gate.try_acquire(amount).await.unwrap();
            clock.advance(SECOND);
        }
        clock.advance(2 * SECOND);
        gate.try_acquire(5).await.unwrap();

        let frames = gate.state().await.unwrap();
        assert_eq!(values(&frames), vec![5, 0, 0, 3, 2, 1]);
        assert_eq!(frames[0].bucket_start.timestamp_millis(), T0 + 5_000);
        for pair in frames.windows(2) {
            assert_eq!(pair[0].bucket_start - pair[1].bucket_start, chrono::Duration::seconds(1));
        }
        assert_eq!(gate.last_frame().await.unwrap().bucket_start.timestamp_millis(), T0);
        assert_eq!(gate.sum().await.unwrap(), 11);
    }

    #[tokio::test]
    async fn test_state_reflects_elapsed_time_without_writes() {
        let (gate, clock) = local_gate(options(3, 1)).await;
        gate.try_acquire(2).await.unwrap();
        clock.advance(3 * SECOND);
        assert_eq!(gate.sum().await.unwrap(), 0);
        assert_eq!(values(&gate.state().await.unwrap()), vec![0, 0, 0]);
    }

    #[tokio::test]
    async fn test_zero_amount_is_a_no_op() {
        let (gate, _clock) = local_gate(options(10, 1).frame_limit(1)).await;
        gate.try_acquire(1).await.unwrap();

        let admission = gate.try_acquire(0).await.unwrap();
        assert_eq!(admission.frame_value, 1);
        assert_eq!(gate.sum().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_check_limits() {
        let (gate, _clock) = local_gate(options(10, 1).frame_limit(2).window_limit(5)).await;
        assert!(gate.check_limits().await.is_ok());

        gate.try_acquire(2).await.unwrap();
        match gate.check_limits().await {
            Err(GateError::FrameLimit { current, amount, .. }) => {
                assert_eq!(current, 2);
                assert_eq!(amount, 0);
            }
            other => panic!("expected frame limit, got {:?}", other),
        }
        assert_eq!(gate.sum().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_decrements_and_floor() {
        let (gate, _clock) = local_gate(options(10, 1).frame_limit(2)).await;
        gate.try_acquire(2).await.unwrap();

        let admission = gate.decrement(1).await.unwrap();
        assert_eq!(admission.frame_value, 1);

        let err = gate.decrement(5).await.unwrap_err();
        assert!(err.is_underflow(), "got {:?}", err);
        assert_eq!(gate.sum().await.unwrap(), 1);

        // Underflow is never waited on.
        let blocked = tokio::time::timeout(SECOND, gate.attempt(-5, Mode::Block)).await;
        assert!(matches!(blocked, Ok(Err(GateError::FrameUnderflow { .. }))));
    }

    #[tokio::test]
    async fn test_huge_amounts_are_rejected_without_corrupting_state() {
        let (gate, _clock) = local_gate(options(10, 1)).await;
        let err = gate.try_acquire(i64::MAX).await.unwrap_err();
        assert!(matches!(err, GateError::Overflow { .. }), "got {:?}", err);
        assert_eq!(gate.try_acquire(1).await.unwrap().window_sum, 1);

        let allowing = GateOptions::new("allow", Duration::from_secs(10), SECOND, FloorPolicy::Allow);
        let (gate, _clock) = local_gate(allowing).await;
        assert!(matches!(gate.decrement(i64::MAX).await, Err(GateError::Overflow { .. })));
        let blocked = tokio::time::timeout(SECOND, gate.attempt(i64::MIN, Mode::Block)).await;
        assert!(matches!(blocked, Ok(Err(GateError::Overflow { .. }))));
        assert_eq!(gate.decrement(2).await.unwrap().window_sum, -2);

        gate.decrement(MAX_MAGNITUDE - 2).await.unwrap();
        assert!(matches!(gate.decrement(1).await, Err(GateError::Overflow { .. })));
        assert_eq!(gate.sum().await.unwrap(), -MAX_MAGNITUDE);
    }

    #[tokio::test]
    async fn test_clamp_floor() {
        let clamping = GateOptions::new("clamp", Duration::from_secs(10), SECOND, FloorPolicy::Clamp);
        let (gate, _clock) = local_gate(clamping).await;
        gate.try_acquire(2).await.unwrap();

        let admission = gate.decrement(5).await.unwrap();
        assert_eq!(admission.frame_value, 0);
        assert_eq!(admission.window_sum, 0);
    }

    #[tokio::test]
    async fn test_unsatisfiable_amount_fails_even_when_blocking() {
        let (gate, _clock) = local_gate(options(10, 1).frame_limit(2).window_limit(5)).await;
        let result = tokio::time::timeout(SECOND, gate.acquire(3)).await;
        assert!(matches!(result, Ok(Err(GateError::FrameLimit { .. }))));
        assert_eq!(gate.sum().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_block_wakes_on_decrement() {
        let (gate, _clock) = local_gate(options(600, 60).frame_limit(1)).await;
        gate.try_acquire(1).await.unwrap();

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.acquire(1).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        gate.decrement(1).await.unwrap();
        let admission = tokio::time::timeout(SECOND, waiter)
            .await
            .expect("waiter was not woken")
            .unwrap()
            .unwrap();
        assert_eq!(admission.frame_value, 1);
    }

    #[tokio::test]
    async fn test_block_wakes_on_clear() {
        let (gate, _clock) = local_gate(options(600, 60).window_limit(1)).await;
        gate.try_acquire(1).await.unwrap();

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.acquire(1).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        gate.clear().await.unwrap();
        let admission = tokio::time::timeout(SECOND, waiter).await.unwrap().unwrap().unwrap();
        assert_eq!(admission.window_sum, 1);
    }

    #[tokio::test]
    async fn test_block_retries_at_frame_boundary() {
        let opts = GateOptions::new(
            "boundary",
            Duration::from_millis(1_000),
            Duration::from_millis(100),
            FloorPolicy::Reject,
        )
        .frame_limit(1);
        let gate = Gate::open(opts, &BackendConfig::Local).await.unwrap();

        gate.try_acquire(1).await.unwrap();
        let admission = gate.acquire_timeout(1, Duration::from_secs(2)).await.unwrap();
        assert_eq!(admission.frame_value, 1);
        assert_eq!(gate.sum().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_acquire_timeout() {
        let (gate, _clock) = local_gate(options(600, 60).frame_limit(1)).await;
        gate.try_acquire(1).await.unwrap();

        let err = gate
            .acquire_timeout(1, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::Timeout(_)));
        assert_eq!(gate.sum().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_throttled_runs_work_only_when_admitted() {
        let (gate, _clock) = local_gate(options(10, 1).frame_limit(1)).await;

        let value = gate.throttled(1, Mode::FailFast, async { 42 }).await.unwrap();
        assert_eq!(value, 42);

        let mut ran = false;
        let result = gate
            .throttled(1, Mode::FailFast, async {
                ran = true;
            })
            .await;
        assert!(result.unwrap_err().is_throttling());
        assert!(!ran);
    }

    #[tokio::test]
    async fn test_clear() {
        let (gate, clock) = local_gate(options(10, 1)).await;
        gate.try_acquire(3).await.unwrap();
        clock.advance(SECOND);
        gate.try_acquire(2).await.unwrap();

        gate.clear().await.unwrap();
        assert_eq!(gate.sum().await.unwrap(), 0);
        assert!(values(&gate.state().await.unwrap()).iter().all(|v| *v == 0));
        assert_eq!(gate.limits(), Limits::new(0, 0).unwrap());
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let (source, clock) = local_gate(options(5, 1)).await;
        for amount in [1, 2, 3] {
            source.try_acquire(amount).await.unwrap();
            clock.advance(SECOND);
        }
        let snapshot = source.snapshot().await.unwrap();
        assert_eq!(snapshot.sum, 6);
        assert_eq!(snapshot.frames.len(), 5);

        let (target, target_clock) = local_gate(options(5, 1)).await;
        target_clock.set(clock.now());
        target.restore(&snapshot).await.unwrap();

        assert_eq!(target.state().await.unwrap(), source.state().await.unwrap());
        assert_eq!(target.snapshot().await.unwrap(), snapshot);
    }

    #[tokio::test]
    async fn test_restore_rejects_mismatched_snapshot() {
        let (source, _clock) = local_gate(options(10, 2)).await;
        source.try_acquire(1).await.unwrap();
        let snapshot = source.snapshot().await.unwrap();

        let (target, _clock) = local_gate(options(10, 1)).await;
        assert!(matches!(target.restore(&snapshot).await, Err(GateError::Snapshot(_))));

        let mut tampered = snapshot.clone();
        tampered.sum += 1;
        assert!(matches!(source.restore(&tampered).await, Err(GateError::Snapshot(_))));
    }

    #[tokio::test]
    async fn test_snapshot_of_unused_gate() {
        let (gate, _clock) = local_gate(options(3, 1)).await;
        let snapshot = gate.snapshot().await.unwrap();
        assert_eq!(snapshot.sum, 0);
        assert_eq!(snapshot.frames[0].bucket_start.timestamp_millis(), T0);
        gate.restore(&snapshot).await.unwrap();
        assert_eq!(gate.sum().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_frames_use_gate_timezone() {
        let plus_two = FixedOffset::east_opt(2 * 3_600).unwrap();
        let daily = GateOptions::new(
            "daily",
            Duration::from_secs(7 * 86_400),
            Duration::from_secs(86_400),
            FloorPolicy::Reject,
        )
        .timezone(plus_two);
        let (gate, _clock) = local_gate(daily).await;
        gate.try_acquire(1).await.unwrap();

        let current = gate.current_frame().await.unwrap();
        assert_eq!(current.bucket_start.offset(), &plus_two);
        assert_eq!(current.bucket_start.to_rfc3339(), "2024-01-01T00:00:00+02:00");
    }

    #[tokio::test]
    async fn test_invalid_options() {
        let bad_step = GateOptions::new("bad", Duration::from_secs(10), Duration::from_secs(3), FloorPolicy::Reject);
        assert!(matches!(Gate::open(bad_step, &BackendConfig::Local).await, Err(GateError::Config(_))));

        let bad_limits = options(10, 1).frame_limit(6).window_limit(5);
        assert!(matches!(Gate::open(bad_limits, &BackendConfig::Local).await, Err(GateError::Config(_))));

        let unnamed = GateOptions::new("", Duration::from_secs(10), SECOND, FloorPolicy::Reject);
        assert!(matches!(Gate::open(unnamed, &BackendConfig::Local).await, Err(GateError::Config(_))));

        let layout = WindowLayout::new(Duration::from_secs(5), SECOND).unwrap();
        let backend: Arc<dyn StorageBackend> = Arc::new(LocalBackend::new(layout));
        assert!(matches!(Gate::with_backend(options(10, 1), backend), Err(GateError::Config(_))));
    }

    async fn concurrent_admissions(gate: Gate, callers: usize) -> usize {
        let tasks = (0..callers).map(|_| {
            let gate = gate.clone();
            tokio::spawn(async move { gate.try_acquire(1).await })
        });

        let mut admitted = 0;
        for result in futures::future::join_all(tasks).await {
            match result.unwrap() {
                Ok(_) => admitted += 1,
                Err(err) => assert!(err.is_throttling(), "got {:?}", err),
            }
        }
        admitted
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_local() {
        let (gate, _clock) = local_gate(options(10, 1).frame_limit(20)).await;
        assert_eq!(concurrent_admissions(gate.clone(), 64).await, 20);
        assert_eq!(gate.current_frame().await.unwrap().value, 20);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_shared() {
        let dir = std::env::temp_dir().join(format!("framegate-gate-{}", uuid::Uuid::new_v4()));
        let opts = options(10, 1).frame_limit(20);
        let name = format!("gate-{}", uuid::Uuid::new_v4());
        let backend = SharedBackend::open_in(&dir, &name, opts.layout().unwrap())
            .await
            .unwrap();
        let gate = Gate::with_backend(opts, Arc::new(backend))
            .unwrap()
            .with_clock(Arc::new(ManualClock::from_millis(T0)));

        assert_eq!(concurrent_admissions(gate.clone(), 64).await, 20);
        assert_eq!(gate.current_frame().await.unwrap().value, 20);
        assert_eq!(gate.backend_kind(), BackendKind::Shared);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
