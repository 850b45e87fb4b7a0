//! # raft-storage
//!
//! why: provide durable persistence for raft state using standard rust fs apis
//! relations: used by raft-peer, which writes RaftNode::encode_state() and snapshot bytes here
//! what: Storage trait, FileStorage implementation, InMemoryStorage for testing and restarts

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

/// trait for durable storage of raft state
///
/// the persister treats both blobs as opaque bytes. state and snapshot are
/// written together when they change together, so a crash never leaves a
/// snapshot paired with a log that does not match it.
pub trait Storage: Send {
    /// replace the persisted raft state, keeping the snapshot
    fn save_raft_state(&mut self, state: &[u8]) -> io::Result<()>;

    /// replace state and snapshot in one atomic write
    fn save_state_and_snapshot(&mut self, state: &[u8], snapshot: &[u8]) -> io::Result<()>;

    /// last persisted raft state, `None` for a fresh peer
    fn read_raft_state(&self) -> io::Result<Option<Vec<u8>>>;

    /// last persisted snapshot, `None` if never compacted
    fn read_snapshot(&self) -> io::Result<Option<Vec<u8>>>;

    /// size in bytes of the persisted raft state
    fn raft_state_size(&self) -> usize;

    /// clear all persisted state (for testing)
    fn clear(&mut self) -> io::Result<()>;
}

/// on-disk and in-memory layout of one persisted image
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct Persisted {
    state: Vec<u8>,
    snapshot: Vec<u8>,
}

fn non_empty(bytes: &[u8]) -> Option<Vec<u8>> {
    (!bytes.is_empty()).then(|| bytes.to_vec())
}

// -- file storage implementation --

/// file-based storage implementation using std::fs
///
/// stores both blobs in `raft.json` inside the given directory. every save
/// goes to a temp file, is synced, then renamed over the old image.
pub struct FileStorage {
    /// directory path for storing state files
    dir: PathBuf,
    /// copy of what is on disk
    cached: Persisted,
}

impl FileStorage {
    /// create a new filestorage at the given directory
    /// creates the directory if it doesn't exist, loads an existing image if present
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let mut storage = Self {
            dir,
            cached: Persisted::default(),
        };
        storage.cached = storage.load()?;
        Ok(storage)
    }

    /// get the path to the image file
    fn image_path(&self) -> PathBuf {
        self.dir.join("raft.json")
    }

    fn load(&self) -> io::Result<Persisted> {
        let path = self.image_path();
        if !path.exists() {
            return Ok(Persisted::default());
        }

        let mut file = File::open(&path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;

        serde_json::from_str(&contents).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    fn write(&mut self, image: Persisted) -> io::Result<()> {
        let json = serde_json::to_string(&image)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        // atomic write: write to temp file then rename
        let temp_path = self.dir.join("raft.tmp");
        let mut file = File::create(&temp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        fs::rename(&temp_path, self.image_path())?;

        self.cached = image;
        Ok(())
    }
}

impl Storage for FileStorage {
    fn save_raft_state(&mut self, state: &[u8]) -> io::Result<()> {
        let image = Persisted {
            state: state.to_vec(),
            snapshot: self.cached.snapshot.clone(),
        };
        self.write(image)
    }

    fn save_state_and_snapshot(&mut self, state: &[u8], snapshot: &[u8]) -> io::Result<()> {
        self.write(Persisted {
            state: state.to_vec(),
            snapshot: snapshot.to_vec(),
        })
    }

    fn read_raft_state(&self) -> io::Result<Option<Vec<u8>>> {
        Ok(non_empty(&self.cached.state))
    }

    fn read_snapshot(&self) -> io::Result<Option<Vec<u8>>> {
        Ok(non_empty(&self.cached.snapshot))
    }

    fn raft_state_size(&self) -> usize {
        self.cached.state.len()
    }

    fn clear(&mut self) -> io::Result<()> {
        match fs::remove_file(self.image_path()) {
            Ok(()) => {}
            // never saved anything
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        self.cached = Persisted::default();
        Ok(())
    }
}

// -- in-memory storage implementation --

/// in-memory storage for testing
///
/// clones share one image, so a test harness can keep a handle while the
/// peer owns another. `snapshot_copy` detaches an independent image, which
/// is how a crashed peer is restarted from exactly what it had persisted.
#[derive(Clone, Default)]
pub struct InMemoryStorage {
    inner: Arc<Mutex<Persisted>>,
}

impl InMemoryStorage {
    /// create a new in-memory storage
    pub fn new() -> Self {
        Self::default()
    }

    /// independent copy of the current image
    pub fn snapshot_copy(&self) -> Self {
        let image = self.inner.lock().clone();
        Self {
            inner: Arc::new(Mutex::new(image)),
        }
    }
}

impl Storage for InMemoryStorage {
    fn save_raft_state(&mut self, state: &[u8]) -> io::Result<()> {
        self.inner.lock().state = state.to_vec();
        Ok(())
    }

    fn save_state_and_snapshot(&mut self, state: &[u8], snapshot: &[u8]) -> io::Result<()> {
        let mut image = self.inner.lock();
        image.state = state.to_vec();
        image.snapshot = snapshot.to_vec();
        Ok(())
    }

    fn read_raft_state(&self) -> io::Result<Option<Vec<u8>>> {
        Ok(non_empty(&self.inner.lock().state))
    }

    fn read_snapshot(&self) -> io::Result<Option<Vec<u8>>> {
        Ok(non_empty(&self.inner.lock().snapshot))
    }

    fn raft_state_size(&self) -> usize {
        self.inner.lock().state.len()
    }

    fn clear(&mut self) -> io::Result<()> {
        *self.inner.lock() = Persisted::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn in_memory_storage_starts_empty() {
        let storage = InMemoryStorage::new();

        assert_eq!(storage.read_raft_state().unwrap(), None);
        assert_eq!(storage.read_snapshot().unwrap(), None);
        assert_eq!(storage.raft_state_size(), 0);
    }

    #[test]
    fn in_memory_save_state_keeps_snapshot() {
        let mut storage = InMemoryStorage::new();

        storage.save_state_and_snapshot(b"s1", b"snap").unwrap();
        storage.save_raft_state(b"s2").unwrap();

        assert_eq!(storage.read_raft_state().unwrap(), Some(b"s2".to_vec()));
        assert_eq!(storage.read_snapshot().unwrap(), Some(b"snap".to_vec()));
    }

    #[test]
    fn in_memory_clones_share_the_image() {
        let mut storage = InMemoryStorage::new();
        let observer = storage.clone();

        storage.save_raft_state(b"shared").unwrap();

        assert_eq!(observer.read_raft_state().unwrap(), Some(b"shared".to_vec()));
    }

    #[test]
    fn file_storage_persists_state() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();

        storage.save_raft_state(b"term=7").unwrap();

        assert_eq!(storage.read_raft_state().unwrap(), Some(b"term=7".to_vec()));
        assert_eq!(storage.raft_state_size(), 6);
    }

    #[test]
    fn file_storage_survives_restart() {
        let dir = tempdir().unwrap();

        // first "session"
        {
            let mut storage = FileStorage::new(dir.path()).unwrap();
            storage.save_state_and_snapshot(b"state", b"snapshot").unwrap();
        }

        // "restart" - new storage instance
        {
            let storage = FileStorage::new(dir.path()).unwrap();
            assert_eq!(storage.read_raft_state().unwrap(), Some(b"state".to_vec()));
            assert_eq!(storage.read_snapshot().unwrap(), Some(b"snapshot".to_vec()));
        }
    }

    #[test]
    fn file_storage_leaves_no_temp_file() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();

        storage.save_raft_state(b"x").unwrap();

        assert!(dir.path().join("raft.json").exists());
        assert!(!dir.path().join("raft.tmp").exists());
    }
}
