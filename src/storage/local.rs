//! In-process storage.

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{BackendKind, StorageBackend};
use crate::error::{GateError, Result};
use crate::window::{Update, Verdict, WindowLayout, WindowState};

/// Window state held in process memory behind a mutex.
///
/// Safe across threads and tasks of one process. Independently launched
/// processes each get their own copy; use [`super::SharedBackend`] or
/// [`super::RemoteBackend`] for those.
#[derive(Debug)]
pub struct LocalBackend {
    layout: WindowLayout,
    state: Mutex<WindowState>,
}

impl LocalBackend {
    /// Create an unused window.
    pub fn new(layout: WindowLayout) -> Self {
        Self {
            layout,
            state: Mutex::new(WindowState::empty(layout.frame_count())),
        }
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn layout(&self) -> &WindowLayout {
        &self.layout
    }

    async fn read(&self) -> Result<WindowState> {
        Ok(self.state.lock().clone())
    }

    async fn atomic_update(&self, update: &Update) -> Result<Verdict> {
        let mut state = self.state.lock();
        Ok(self.layout.apply(&mut state, update))
    }

    async fn clear(&self) -> Result<()> {
        self.state.lock().reset(None);
        Ok(())
    }

    async fn restore(&self, state: &WindowState) -> Result<()> {
        if state.values().len() != self.layout.frame_count() {
            return Err(GateError::Snapshot(format!(
                "expected {} frames, got {}",
                self.layout.frame_count(),
                state.values().len()
            )));
        }
        *self.state.lock() = state.clone();
        Ok(())
    }
}
