//! Storage backends for window state.
//!
//! A backend persists one gate's frame ring and running sum and provides the
//! atomicity primitive that makes "slide, compare to limits, commit" a single
//! indivisible step under its sharing model:
//!
//! - [`LocalBackend`]: one process, many threads or tasks (in-process mutex).
//! - [`SharedBackend`]: many processes on one host (shared memory segment
//!   guarded by a file lock).
//! - [`RemoteBackend`]: many processes on any host (Redis, server-side script).

mod local;
mod remote;
mod shared;

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

pub use local::LocalBackend;
pub use remote::{RemoteBackend, RemoteClient, RemoteKeys, RemoteOptions};
pub use shared::SharedBackend;

use crate::config::BackendConfig;
use crate::error::Result;
use crate::window::{Update, Verdict, WindowLayout, WindowState};

/// Which sharing model a backend implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Local,
    Shared,
    Remote,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BackendKind::Local => "local",
            BackendKind::Shared => "shared",
            BackendKind::Remote => "remote",
        };
        f.write_str(name)
    }
}

/// Trait for window state storage.
///
/// `atomic_update` is linearizable per gate: concurrent callers observe a
/// total order of updates and no two updates interleave their read and write
/// halves. Nothing is guaranteed across different gates.
///
/// The update function is passed as data ([`Update`]) rather than a closure so
/// the remote backend can run it on the server. Every implementation must
/// produce exactly what [`WindowLayout::apply`] produces for the same state.
#[async_trait]
pub trait StorageBackend: Send + Sync + Debug {
    /// The sharing model of this backend.
    fn kind(&self) -> BackendKind;

    /// The layout this backend was opened with.
    fn layout(&self) -> &WindowLayout;

    /// Read the stored state.
    ///
    /// The result may be stale as soon as it is returned and must not be used
    /// for admission decisions.
    async fn read(&self) -> Result<WindowState>;

    /// Slide, evaluate and (if admitted) commit `update` as one atomic step.
    async fn atomic_update(&self, update: &Update) -> Result<Verdict>;

    /// Reset every frame and the sum to zero.
    async fn clear(&self) -> Result<()>;

    /// State to persist for recovery.
    async fn snapshot(&self) -> Result<WindowState> {
        self.read().await
    }

    /// Replace the stored state.
    async fn restore(&self, state: &WindowState) -> Result<()>;
}

/// Open the backend described by `config` for the gate `name`.
pub async fn connect(
    name: &str,
    layout: WindowLayout,
    config: &BackendConfig,
) -> Result<Arc<dyn StorageBackend>> {
    let backend: Arc<dyn StorageBackend> = match config {
        BackendConfig::Local => Arc::new(LocalBackend::new(layout)),
        BackendConfig::Shared { dir } => {
            let backend = match dir {
                Some(dir) => SharedBackend::open_in(dir, name, layout).await?,
                None => SharedBackend::open(name, layout).await?,
            };
            Arc::new(backend)
        }
        BackendConfig::Remote(remote) => {
            let options = RemoteOptions::from_config(remote);
            Arc::new(RemoteBackend::connect(name, layout, options).await?)
        }
    };

    info!(
        gate = %name,
        backend = %backend.kind(),
        frames = layout.frame_count(),
        frame_step_ms = layout.frame_step_ms(),
        "Storage backend ready"
    );
    Ok(backend)
}
