//! Cross-process storage in a named shared memory segment.
//!
//! The segment is a fixed-layout block, little endian:
//!
//! ```text
//! offset  size  field
//!      0     8  magic "FRMGATE1"
//!      8     8  frame count
//!     16     8  frame step (ms)
//!     24     8  bucket alignment offset (ms)
//!     32     8  current bucket start (ms), i64::MIN when unused
//!     40     8  window sum
//!     48   8*n  frame values, newest first
//! ```
//!
//! It lives in a file under `/dev/shm` (or the temp dir where that does not
//! exist) mapped into every process that opens the gate. Every access holds
//! an exclusive `flock` on a sibling lock file, plus an in-process mutex
//! because `flock` does not exclude threads sharing one open file.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use fs2::FileExt;
use memmap2::{MmapMut, MmapOptions};
use parking_lot::Mutex;
use tracing::{debug, info};

use super::{BackendKind, StorageBackend};
use crate::error::{GateError, Result};
use crate::window::{Update, Verdict, WindowLayout, WindowState};

const MAGIC: &[u8; 8] = b"FRMGATE1";
const OFF_COUNT: usize = 8;
const OFF_STEP: usize = 16;
const OFF_OFFSET: usize = 24;
const OFF_HEAD: usize = 32;
const OFF_SUM: usize = 40;
const HEADER_LEN: usize = 48;
const NO_HEAD: i64 = i64::MIN;

/// Window state in a shared memory segment, safe across processes of one host.
///
/// Data lives until [`SharedBackend::unlink`] is called or the host's shared
/// memory is torn down (for `/dev/shm`, a reboot).
#[derive(Debug)]
pub struct SharedBackend {
    layout: WindowLayout,
    segment: Arc<Segment>,
}

impl SharedBackend {
    /// Open (or create) the segment for gate `name` in the default directory.
    pub async fn open(name: &str, layout: WindowLayout) -> Result<Self> {
        Self::open_in(default_dir(), name, layout).await
    }

    /// Open (or create) the segment for gate `name` in `dir`.
    ///
    /// Fails with a configuration error if the name is not usable as a file
    /// name or an existing segment was created with a different layout.
    pub async fn open_in(dir: impl AsRef<Path>, name: &str, layout: WindowLayout) -> Result<Self> {
        validate_name(name)?;
        let dir = dir.as_ref().to_path_buf();
        let name = name.to_string();
        let segment = tokio::task::spawn_blocking(move || Segment::open(&dir, &name, layout))
            .await
            .map_err(|e| GateError::Backend(format!("shared storage task failed: {}", e)))??;

        Ok(Self {
            layout,
            segment: Arc::new(segment),
        })
    }

    /// Path of the segment file.
    pub fn path(&self) -> &Path {
        &self.segment.data_path
    }

    /// Remove the segment file.
    ///
    /// Only call this once every handle on the gate, in every process, is
    /// closed: handles that already mapped the segment keep updating the old
    /// mapping while the next open creates a fresh one. The lock file stays
    /// in place so every handle keeps locking the same inode.
    pub async fn unlink(&self) -> Result<()> {
        self.run(|segment| {
            segment.locked(|_| remove_if_exists(&segment.data_path))??;
            info!(gate = %segment.name, "Shared segment unlinked");
            Ok(())
        })
        .await
    }

    /// Path of the lock file guarding the segment.
    pub fn lock_path(&self) -> &Path {
        &self.segment.lock_path
    }

    async fn run<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Segment) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let segment = Arc::clone(&self.segment);
        tokio::task::spawn_blocking(move || f(&segment))
            .await
            .map_err(|e| GateError::Backend(format!("shared storage task failed: {}", e)))?
    }
}

#[async_trait]
impl StorageBackend for SharedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Shared
    }

    fn layout(&self) -> &WindowLayout {
        &self.layout
    }

    async fn read(&self) -> Result<WindowState> {
        let count = self.layout.frame_count();
        self.run(move |segment| segment.locked(|buf| load_state(buf, count)))
            .await
    }

    async fn atomic_update(&self, update: &Update) -> Result<Verdict> {
        let update = *update;
        let layout = self.layout;
        self.run(move |segment| {
            segment.locked(|buf| {
                let mut state = load_state(buf, layout.frame_count());
                let verdict = layout.apply(&mut state, &update);
                store_state(buf, &state);
                verdict
            })
        })
        .await
    }

    async fn clear(&self) -> Result<()> {
        let count = self.layout.frame_count();
        self.run(move |segment| {
            segment.locked(|buf| store_state(buf, &WindowState::empty(count)))
        })
        .await
    }

    async fn restore(&self, state: &WindowState) -> Result<()> {
        if state.values().len() != self.layout.frame_count() {
            return Err(GateError::Snapshot(format!(
                "expected {} frames, got {}",
                self.layout.frame_count(),
                state.values().len()
            )));
        }
        let state = state.clone();
        self.run(move |segment| segment.locked(|buf| store_state(buf, &state)))
            .await
    }
}

#[derive(Debug)]
struct Segment {
    name: String,
    data_path: PathBuf,
    lock_path: PathBuf,
    lock_file: File,
    map: Mutex<MmapMut>,
}

impl Segment {
    fn open(dir: &Path, name: &str, layout: WindowLayout) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let data_path = dir.join(format!("framegate.{}.seg", name));
        let lock_path = dir.join(format!("framegate.{}.lock", name));
        let len = HEADER_LEN + 8 * layout.frame_count();

        let lock_file = open_rw(&lock_path)?;
        let map = {
            let _lock = FileLock::exclusive(&lock_file)?;
            let data_file = open_rw(&data_path)?;
            let existing = data_file.metadata()?.len();
            let fresh = existing == 0;
            if fresh {
                data_file.set_len(len as u64)?;
            } else if existing != len as u64 {
                return Err(GateError::Config(format!(
                    "shared segment {} has {} bytes, expected {} for {} frames",
                    data_path.display(),
                    existing,
                    len,
                    layout.frame_count()
                )));
            }

            // SAFETY: the file has exactly `len` bytes and is never truncated
            // while mapped; every read and write of the mapping happens while
            // holding the segment's exclusive lock.
            let mut map = unsafe { MmapOptions::new().len(len).map_mut(&data_file)? };

            if fresh {
                init_header(&mut map, &layout);
                debug!(gate = %name, path = %data_path.display(), "Created shared segment");
            } else {
                check_header(&map, &layout, &data_path)?;
                debug!(gate = %name, path = %data_path.display(), "Attached to shared segment");
            }
            map
        };

        Ok(Self {
            name: name.to_string(),
            data_path,
            lock_path,
            lock_file,
            map: Mutex::new(map),
        })
    }

    /// Run `f` over the mapped bytes while holding both locks.
    fn locked<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let mut map = self.map.lock();
        let _lock = FileLock::exclusive(&self.lock_file)?;
        Ok(f(&mut map[..]))
    }
}

struct FileLock<'a>(&'a File);

impl<'a> FileLock<'a> {
    fn exclusive(file: &'a File) -> io::Result<Self> {
        FileExt::lock_exclusive(file)?;
        Ok(Self(file))
    }
}

impl Drop for FileLock<'_> {
    fn drop(&mut self) {
        let _ = FileExt::unlock(self.0);
    }
}

fn default_dir() -> PathBuf {
    let shm = Path::new("/dev/shm");
    if shm.is_dir() {
        shm.to_path_buf()
    } else {
        std::env::temp_dir()
    }
}

fn validate_name(name: &str) -> Result<()> {
    let usable = !name.is_empty()
        && name.len() <= 200
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if usable {
        Ok(())
    } else {
        Err(GateError::Config(format!(
            "gate name {:?} can not name a shared segment (use [A-Za-z0-9._-], up to 200 chars)",
            name
        )))
    }
}

fn open_rw(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

fn read_i64(buf: &[u8], at: usize) -> i64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    i64::from_le_bytes(bytes)
}

fn write_i64(buf: &mut [u8], at: usize, value: i64) {
    buf[at..at + 8].copy_from_slice(&value.to_le_bytes());
}

fn init_header(buf: &mut [u8], layout: &WindowLayout) {
    buf[..8].copy_from_slice(MAGIC);
    write_i64(buf, OFF_COUNT, layout.frame_count() as i64);
    write_i64(buf, OFF_STEP, layout.frame_step_ms());
    write_i64(buf, OFF_OFFSET, layout.offset_ms());
    store_state(buf, &WindowState::empty(layout.frame_count()));
}

fn check_header(buf: &[u8], layout: &WindowLayout, path: &Path) -> Result<()> {
    if &buf[..8] != MAGIC {
        return Err(GateError::Config(format!(
            "{} is not a gate segment",
            path.display()
        )));
    }
    let count = read_i64(buf, OFF_COUNT);
    let step = read_i64(buf, OFF_STEP);
    let offset = read_i64(buf, OFF_OFFSET);
    if count != layout.frame_count() as i64
        || step != layout.frame_step_ms()
        || offset != layout.offset_ms()
    {
        return Err(GateError::Config(format!(
            "shared segment {} was created with {} frames of {}ms (offset {}ms), \
             this gate uses {} frames of {}ms (offset {}ms)",
            path.display(),
            count,
            step,
            offset,
            layout.frame_count(),
            layout.frame_step_ms(),
            layout.offset_ms()
        )));
    }
    Ok(())
}

fn load_state(buf: &[u8], frame_count: usize) -> WindowState {
    let head = match read_i64(buf, OFF_HEAD) {
        NO_HEAD => None,
        head => Some(head),
    };
    let values = (0..frame_count)
        .map(|i| read_i64(buf, HEADER_LEN + 8 * i))
        .collect();
    WindowState::from_parts(head, values, read_i64(buf, OFF_SUM), frame_count)
}

fn store_state(buf: &mut [u8], state: &WindowState) {
    write_i64(buf, OFF_HEAD, state.head_millis().unwrap_or(NO_HEAD));
    write_i64(buf, OFF_SUM, state.sum());
    for (i, value) in state.values().iter().enumerate() {
        write_i64(buf, HEADER_LEN + 8 * i, *value);
    }
}
