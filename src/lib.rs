//! Framegate - Sliding-Window Admission Control
//!
//! A gate counts events in a moving time window split into fixed-duration
//! frames and enforces a per-frame and a whole-window limit. Callers either
//! fail fast when a limit is reached or wait until capacity frees up. The
//! same semantics hold for threads in one process ([`storage::LocalBackend`]),
//! processes on one host ([`storage::SharedBackend`]) and processes on many
//! hosts sharing Redis ([`storage::RemoteBackend`]).

pub mod clock;
pub mod config;
pub mod error;
pub mod gate;
pub mod storage;
pub mod window;

pub use config::{BackendConfig, GateConfig, RemoteConfig};
pub use error::{GateError, Result};
pub use gate::{Admission, BlockingGate, Gate, GateOptions, GateSnapshot, Mode};
pub use window::{FloorPolicy, Frame};
