//! Durable key-value storage.
//!
//! The alarm core only needs string keys mapped to string values that survive
//! a process restart. [`FileStore`] keeps them in one JSON object on disk that
//! several processes may share;
//! [`MemoryStore`] is for tests and embedders that persist elsewhere.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use parking_lot::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("corrupt store contents: {0}")]
    Corrupt(#[from] serde_json::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> StoreResult<Option<String>>;

    fn put(&self, key: &str, value: &str) -> StoreResult<()>;

    /// Removing a missing key is not an error.
    fn remove(&self, key: &str) -> StoreResult<()>;

    fn keys(&self) -> StoreResult<Vec<String>>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> StoreResult<()> {
        self.entries
            .lock()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> StoreResult<()> {
        self.entries.lock().remove(key);
        Ok(())
    }

    fn keys(&self) -> StoreResult<Vec<String>> {
        Ok(self.entries.lock().keys().cloned().collect())
    }
}

/// A JSON object on disk, shareable between processes.
///
/// Nothing is cached. Reads load the file; writes reload, modify and rewrite
/// it while holding an exclusive lock on a sibling `.lock` file, so a daemon
/// and the CLI can work on the same store without losing each other's
/// changes. New contents go to a temporary file that is synced and then
/// renamed over the original, so a crash leaves either the old or the new
/// contents.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl FileStore {
    /// Open the store at `path`. A missing file is an empty store; one that
    /// does not parse is an error.
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        let store = Self {
            lock_path: sibling(&path, "lock"),
            path,
        };
        store.load()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> StoreResult<BTreeMap<String, String>> {
        match fs::read(&self.path) {
            Ok(bytes) if bytes.is_empty() => Ok(BTreeMap::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(source) => Err(StoreError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }

    /// Apply `change` to the current contents, writing them back if it
    /// reports a modification.
    fn update(
        &self,
        change: impl FnOnce(&mut BTreeMap<String, String>) -> bool,
    ) -> StoreResult<()> {
        let _lock = self.lock()?;
        let mut entries = self.load()?;
        if change(&mut entries) {
            self.persist(&entries)?;
        }
        Ok(())
    }

    /// The lock is released when the returned file is dropped.
    fn lock(&self) -> StoreResult<File> {
        let io_err = |source| StoreError::Io {
            path: self.lock_path.clone(),
            source,
        };

        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(io_err)?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.lock_path)
            .map_err(io_err)?;
        FileExt::lock_exclusive(&file).map_err(io_err)?;
        Ok(file)
    }

    fn persist(&self, entries: &BTreeMap<String, String>) -> StoreResult<()> {
        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };

        let tmp = sibling(&self.path, "tmp");
        let bytes = serde_json::to_vec_pretty(entries)?;
        {
            let mut file = File::create(&tmp).map_err(io_err)?;
            file.write_all(&bytes).map_err(io_err)?;
            file.sync_all().map_err(io_err)?;
        }
        fs::rename(&tmp, &self.path).map_err(io_err)
    }
}

/// `path` with `.extension` appended to its file name.
fn sibling(path: &Path, extension: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(extension);
    PathBuf::from(name)
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.load()?.remove(key))
    }

    fn put(&self, key: &str, value: &str) -> StoreResult<()> {
        self.update(|entries| {
            entries.insert(key.to_string(), value.to_string());
            true
        })
    }

    fn remove(&self, key: &str) -> StoreResult<()> {
        self.update(|entries| entries.remove(key).is_some())
    }

    fn keys(&self) -> StoreResult<Vec<String>> {
        Ok(self.load()?.into_keys().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_put_get_remove() {
        let store = MemoryStore::new();
        assert_eq!(store.get("a").unwrap(), None);

        store.put("a", "1").unwrap();
        store.put("b", "2").unwrap();
        assert_eq!(store.get("a").unwrap().as_deref(), Some("1"));
        assert_eq!(store.keys().unwrap(), vec!["a", "b"]);

        store.remove("a").unwrap();
        store.remove("missing").unwrap();
        assert_eq!(store.keys().unwrap(), vec!["b"]);
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("alarms.json");

        {
            let store = FileStore::open(&path).unwrap();
            store.put("__alarm_id__1", "{}").unwrap();
            store.put("__alarm_id__2", "{}").unwrap();
            store.remove("__alarm_id__1").unwrap();
        }

        let reopened = FileStore::open(&path).unwrap();
        assert_eq!(reopened.keys().unwrap(), vec!["__alarm_id__2"]);
        assert_eq!(reopened.path(), path.as_path());
    }

    #[test]
    fn file_store_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alarms.json");
        fs::write(&path, b"not json").unwrap();

        assert!(matches!(
            FileStore::open(&path),
            Err(StoreError::Corrupt(_))
        ));
    }

    #[test]
    fn file_store_treats_empty_file_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alarms.json");
        fs::write(&path, b"").unwrap();

        let store = FileStore::open(&path).unwrap();
        assert!(store.keys().unwrap().is_empty());
    }

    #[test]
    fn file_store_sees_writes_from_another_handle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alarms.json");
        let daemon = FileStore::open(&path).unwrap();
        let cli = FileStore::open(&path).unwrap();

        cli.put("__alarm_id__5", "{}").unwrap();
        assert_eq!(daemon.keys().unwrap(), vec!["__alarm_id__5"]);
        assert_eq!(daemon.get("__alarm_id__5").unwrap().as_deref(), Some("{}"));

        daemon.put("__alarm_id__6", "{}").unwrap();
        let reopened = FileStore::open(&path).unwrap();
        assert_eq!(
            reopened.keys().unwrap(),
            vec!["__alarm_id__5", "__alarm_id__6"]
        );

        cli.remove("__alarm_id__5").unwrap();
        daemon.put("__alarm_id__7", "{}").unwrap();
        assert_eq!(
            reopened.keys().unwrap(),
            vec!["__alarm_id__6", "__alarm_id__7"]
        );
    }

    #[test]
    fn file_store_concurrent_writers_lose_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alarms.json");

        let writers: Vec<_> = (0..4)
            .map(|writer| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let store = FileStore::open(&path).unwrap();
                    for n in 0..20 {
                        store.put(&format!("{writer}-{n:02}"), "{}").unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        assert_eq!(FileStore::open(&path).unwrap().keys().unwrap().len(), 80);
    }
}
