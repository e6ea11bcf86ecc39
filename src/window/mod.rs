//! Sliding window of fixed-duration frames.
//!
//! The window engine maps wall-clock time to frame positions and keeps the
//! frame ring and its running sum consistent as time advances.

mod engine;
mod frame;

pub use engine::{
    Admission, Breach, BreachKind, FloorPolicy, Limits, Slide, Update, Verdict, WindowLayout,
    MAX_MAGNITUDE,
};
pub use frame::{Frame, WindowState};
