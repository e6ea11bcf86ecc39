//! A gate for plain OS threads.

use std::time::Duration;

use tokio::runtime::{Builder, Runtime};

use super::{Admission, Gate, GateOptions, GateSnapshot, Mode};
use crate::config::BackendConfig;
use crate::error::Result;
use crate::window::Frame;

/// Synchronous facade over [`Gate`].
///
/// Drives the same admission logic on an owned runtime, so a blocked caller
/// parks its thread instead of yielding to a scheduler. Any number of threads
/// may share one `BlockingGate`. Must not be created or dropped inside an
/// async context.
#[derive(Debug)]
pub struct BlockingGate {
    runtime: Runtime,
    gate: Gate,
}

impl BlockingGate {
    /// Open a gate on a fresh runtime.
    pub fn open(options: GateOptions, backend: &BackendConfig) -> Result<Self> {
        let runtime = runtime()?;
        let gate = runtime.block_on(Gate::open(options, backend))?;
        Ok(Self { runtime, gate })
    }

    /// Wrap an existing gate.
    pub fn from_gate(gate: Gate) -> Result<Self> {
        Ok(Self {
            runtime: runtime()?,
            gate,
        })
    }

    /// The async gate underneath.
    pub fn gate(&self) -> &Gate {
        &self.gate
    }

    pub fn attempt(&self, amount: i64, mode: Mode) -> Result<Admission> {
        self.runtime.block_on(self.gate.attempt(amount, mode))
    }

    pub fn acquire(&self, amount: i64) -> Result<Admission> {
        self.attempt(amount, Mode::Block)
    }

    pub fn try_acquire(&self, amount: i64) -> Result<Admission> {
        self.attempt(amount, Mode::FailFast)
    }

    pub fn acquire_timeout(&self, amount: i64, timeout: Duration) -> Result<Admission> {
        self.runtime.block_on(self.gate.acquire_timeout(amount, timeout))
    }

    pub fn decrement(&self, amount: i64) -> Result<Admission> {
        self.runtime.block_on(self.gate.decrement(amount))
    }

    pub fn check_limits(&self) -> Result<Admission> {
        self.runtime.block_on(self.gate.check_limits())
    }

    pub fn clear(&self) -> Result<()> {
        self.runtime.block_on(self.gate.clear())
    }

    pub fn snapshot(&self) -> Result<GateSnapshot> {
        self.runtime.block_on(self.gate.snapshot())
    }

    pub fn restore(&self, snapshot: &GateSnapshot) -> Result<()> {
        self.runtime.block_on(self.gate.restore(snapshot))
    }

    pub fn state(&self) -> Result<Vec<Frame>> {
        self.runtime.block_on(self.gate.state())
    }

    pub fn sum(&self) -> Result<i64> {
        self.runtime.block_on(self.gate.sum())
    }

    /// Admit `amount`, then run `work` on the calling thread.
    pub fn throttled<T>(&self, amount: i64, mode: Mode, work: impl FnOnce() -> T) -> Result<T> {
        self.attempt(amount, mode)?;
        Ok(work())
    }
}

fn runtime() -> Result<Runtime> {
    Ok(Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("framegate-blocking")
        .enable_all()
        .build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::GateError;
    use crate::window::FloorPolicy;
    use std::sync::Arc;
    use std::thread;

    fn options() -> GateOptions {
        GateOptions::new(
            "blocking",
            Duration::from_secs(600),
            Duration::from_secs(60),
            FloorPolicy::Reject,
        )
        .frame_limit(10)
    }

    #[test]
    fn test_threads_share_limit() {
        let gate = Arc::new(BlockingGate::open(options(), &BackendConfig::Local).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gate = Arc::clone(&gate);
                thread::spawn(move || {
                    (0..5)
                        .filter(|_| gate.try_acquire(1).is_ok())
                        .count()
                })
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        // A frame boundary may fall inside the test; every frame still admits at most 10.
        assert!(admitted >= 10 && admitted <= 20, "admitted {}", admitted);
        assert!(gate.state().unwrap()[0].value <= 10);
    }

    #[test]
    fn test_blocked_thread_wakes_on_decrement() {
        let inner = {
            let rt = runtime().unwrap();
            rt.block_on(Gate::open(options().frame_limit(1), &BackendConfig::Local))
                .unwrap()
                .with_clock(Arc::new(ManualClock::from_millis(1_704_067_200_000)))
        };
        let gate = Arc::new(BlockingGate::from_gate(inner).unwrap());
        gate.try_acquire(1).unwrap();

        let waiter = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || gate.acquire_timeout(1, Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(50));
        gate.decrement(1).unwrap();

        let admission = waiter.join().unwrap().unwrap();
        assert_eq!(admission.frame_value, 1);
    }

    #[test]
    fn test_timeout_and_throttled() {
        let inner = {
            let rt = runtime().unwrap();
            rt.block_on(Gate::open(options().frame_limit(1), &BackendConfig::Local))
                .unwrap()
                .with_clock(Arc::new(ManualClock::from_millis(1_704_067_200_000)))
        };
        let gate = BlockingGate::from_gate(inner).unwrap();

        assert_eq!(gate.throttled(1, Mode::FailFast, || "done").unwrap(), "done");
        assert!(matches!(
            gate.acquire_timeout(1, Duration::from_millis(50)),
            Err(GateError::Timeout(_))
        ));
        assert!(gate.check_limits().unwrap_err().is_throttling());

        let snapshot = gate.snapshot().unwrap();
        gate.clear().unwrap();
        assert_eq!(gate.sum().unwrap(), 0);
        gate.restore(&snapshot).unwrap();
        assert_eq!(gate.sum().unwrap(), 1);
    }
}
