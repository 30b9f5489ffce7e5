//! Durable storage for the persistent Raft state blob.
//!
//! The consensus core only needs "durably save blob" / "load last saved
//! blob"; the blob layout itself is an internal contract between a peer's
//! writes and its own reads after restart (see `raft::persist`).

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::Mutex;

/// Stable storage for a single peer's persistent state.
///
/// A `save` must be durable before it returns: once it succeeds, a crash
/// followed by `load` observes the saved bytes.
pub trait Storage: Send + Sync {
    fn save(&self, blob: &[u8]) -> io::Result<()>;

    /// Returns the most recently saved blob, or `None` for a fresh peer.
    fn load(&self) -> io::Result<Option<Vec<u8>>>;
}

/// In-memory storage for tests.
///
/// Sharing one instance across node incarnations simulates state that
/// survives a crash/restart.
#[derive(Default)]
pub struct MemoryStorage {
    blob: Mutex<Option<Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn save(&self, blob: &[u8]) -> io::Result<()> {
        *self.blob.lock().expect("storage lock poisoned") = Some(blob.to_vec());
        Ok(())
    }

    fn load(&self) -> io::Result<Option<Vec<u8>>> {
        Ok(self.blob.lock().expect("storage lock poisoned").clone())
    }
}

/// File-backed storage holding the state blob in a single file.
///
/// Writes go to a temp file which is fsynced and renamed over the target,
/// so a crash mid-write leaves the previous blob intact.
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    /// Create storage rooted at `dir`; the directory is created if missing.
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            path: dir.join("raft-state.json"),
        })
    }
}

impl Storage for FileStorage {
    fn save(&self, blob: &[u8]) -> io::Result<()> {
        let temp_path = self.path.with_extension("tmp");
        let mut file = File::create(&temp_path)?;
        file.write_all(blob)?;
        file.sync_all()?;
        fs::rename(&temp_path, &self.path)?;
        Ok(())
    }

    fn load(&self) -> io::Result<Option<Vec<u8>>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let mut file = File::open(&self.path)?;
        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;
        Ok(Some(contents))
    }
}
