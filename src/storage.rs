//! On-disk destinations for the capture loop: the per-camera clip store
//! and the transient live-stream directory.

use crate::error::{Result, SentrycamError};
use crate::frame::FrameRecord;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

fn ensure_dir(path: &Path) -> Result<()> {
    // create_dir_all treats an existing directory as success; any other
    // failure is fatal to camera construction.
    fs::create_dir_all(path).map_err(|source| SentrycamError::Permission {
        path: path.to_path_buf(),
        source,
    })
}

/// Persists finished recording sessions as clip files.
///
/// The on-disk encoding is opaque to the rest of the system: frames are
/// handed over in order and a single clip path comes back.
pub struct ClipStore {
    dir: PathBuf,
}

impl ClipStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        ensure_dir(&dir)?;
        info!("Clip directory ready at {}", dir.display());
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write all frames, oldest first, into one clip named by the flush
    /// timestamp. Zero frames is an error and writes nothing.
    pub fn persist(&self, frames: &[FrameRecord]) -> Result<PathBuf> {
        if frames.is_empty() {
            return Err(SentrycamError::EmptyClip);
        }

        // Millisecond precision keeps two flushes in the same second from
        // colliding on one file name.
        let name = chrono::Local::now()
            .format("%Y-%m-%d_%H-%M-%S%.3f.avi")
            .to_string();
        let path = self.dir.join(name);

        let file = fs::File::create(&path)?;
        let mut writer = std::io::BufWriter::new(file);
        for frame in frames {
            writer.write_all(&frame.data)?;
        }
        writer.flush()?;

        info!("Saved a clip of {} frames to {}", frames.len(), path.display());
        Ok(path)
    }
}

/// Writes live frames into the shared stream directory under monotonically
/// increasing names. The viewer deletes each file after rendering it, so
/// the directory is a mailbox, not a store.
pub struct StreamPublisher {
    dir: PathBuf,
    next: u64,
}

impl StreamPublisher {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        ensure_dir(&dir)?;
        info!("Stream directory ready at {}", dir.display());
        Ok(Self { dir, next: 0 })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn publish(&mut self, frame: &FrameRecord) -> Result<PathBuf> {
        let path = self.dir.join(format!("{}.jpg", self.next));
        self.next += 1;
        fs::write(&path, frame.data.as_slice())?;
        debug!("Published stream frame {}", path.display());
        Ok(path)
    }
}
