//! Atomic, lock-protected JSON files.
//!
//! Writes go to a temporary sibling and are renamed into place while an
//! exclusive `fs2` lock is held on a `.lock` sibling; reads take a shared
//! lock. [`JsonFile::update`] holds the exclusive lock across the read and
//! the write, so concurrent read-modify-write cycles never lose an update.
//! A file that fails to parse is moved aside to `<name>.corrupt` and treated
//! as absent.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::error::{OverseerError, Result};
use crate::registry::lock;

/// Temporary file suffix for atomic writes.
const TMP_SUFFIX: &str = ".tmp";

/// Lock file suffix for concurrent access prevention.
const LOCK_SUFFIX: &str = ".lock";

/// Suffix for files that failed to parse.
const CORRUPT_SUFFIX: &str = ".corrupt";

/// Map an arbitrary id to a plain file stem: characters outside
/// `[A-Za-z0-9_-]` become `_`.
#[must_use]
pub fn file_stem(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// A single JSON document on disk.
///
/// Clones share one in-process update lock; separate handles on the same
/// path are still serialised by the file lock.
#[derive(Debug, Clone)]
pub struct JsonFile {
    path: PathBuf,
    updates: Arc<Mutex<()>>,
}

impl JsonFile {
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            updates: Arc::new(Mutex::new(())),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(suffix);
        PathBuf::from(name)
    }

    #[must_use]
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Take the exclusive lock. Released when the returned file is dropped.
    fn lock_exclusive(&self) -> Result<File> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let lock_file = File::create(self.sibling(LOCK_SUFFIX))?;
        FileExt::lock_exclusive(&lock_file).map_err(|e| {
            OverseerError::persistence(format!(
                "Failed to acquire lock for {}: {e}",
                self.path.display()
            ))
        })?;
        Ok(lock_file)
    }

    /// Serialize `value` and atomically replace the file.
    pub fn save<T: Serialize>(&self, value: &T) -> Result<()> {
        let _lock = self.lock_exclusive()?;
        self.write_locked(value)
    }

    /// Load and parse the file. `Ok(None)` when absent or corrupted.
    pub fn load<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let lock_path = self.sibling(LOCK_SUFFIX);
        let _lock = if lock_path.exists() {
            let lock_file = File::open(&lock_path)?;
            FileExt::lock_shared(&lock_file).map_err(|e| {
                OverseerError::persistence(format!(
                    "Failed to acquire lock for {}: {e}",
                    self.path.display()
                ))
            })?;
            Some(lock_file)
        } else {
            None
        };

        self.read_locked()
    }

    /// Read, modify and write back under one exclusive lock.
    ///
    /// A missing or corrupted file starts from `T::default()`. Returns what
    /// `f` returns; nothing is written if reading fails.
    pub fn update<T, R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R>
    where
        T: Serialize + DeserializeOwned + Default,
    {
        let _updating = lock(&self.updates);
        let _lock = self.lock_exclusive()?;

        let mut value: T = self.read_locked()?.unwrap_or_default();
        let result = f(&mut value);
        self.write_locked(&value)?;
        Ok(result)
    }

    fn write_locked<T: Serialize>(&self, value: &T) -> Result<()> {
        let tmp_path = self.sibling(TMP_SUFFIX);
        let json = serde_json::to_string_pretty(value)?;

        let mut tmp_file = File::create(&tmp_path)?;
        tmp_file.write_all(json.as_bytes())?;
        tmp_file.sync_all()?;

        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    fn read_locked<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        let mut file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut contents = String::new();
        file.read_to_string(&mut contents)?;

        match serde_json::from_str(&contents) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                let aside = self.sibling(CORRUPT_SUFFIX);
                warn!(
                    "Corrupted file at {}: {}. Moving it to {} and starting fresh.",
                    self.path.display(),
                    e,
                    aside.display()
                );
                let _ = fs::rename(&self.path, &aside);
                Ok(None)
            }
        }
    }

    /// Delete the file if it exists.
    pub fn delete(&self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Doc {
        name: String,
        count: u32,
    }

    #[test]
    fn test_save_then_load() {
        let temp = TempDir::new().unwrap();
        let file = JsonFile::new(temp.path().join("nested/doc.json"));
        let doc = Doc {
            name: "a".into(),
            count: 3,
        };

        file.save(&doc).expect("save");
        assert!(file.exists());
        assert!(!temp.path().join("nested/doc.json.tmp").exists());

        let loaded: Doc = file.load().expect("load").expect("present");
        assert_eq!(loaded, doc);
    }

    #[test]
    fn test_load_missing_is_none() {
        let temp = TempDir::new().unwrap();
        let file = JsonFile::new(temp.path().join("missing.json"));
        let loaded: Option<Doc> = file.load().expect("load");
        assert!(loaded.is_none());
    }

    #[test]
    fn test_corrupted_file_is_moved_aside() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("doc.json");
        fs::write(&path, "{ not json").unwrap();

        let file = JsonFile::new(&path);
        let loaded: Option<Doc> = file.load().expect("load");
        assert!(loaded.is_none());
        assert!(!path.exists());
        assert!(temp.path().join("doc.json.corrupt").exists());
    }

    #[test]
    fn test_file_stem() {
        assert_eq!(file_stem("sess/1:a"), "sess_1_a");
        assert_eq!(file_stem("plain-id_2"), "plain-id_2");
    }

    #[test]
    fn test_update_creates_and_modifies() {
        let temp = TempDir::new().unwrap();
        let file = JsonFile::new(temp.path().join("counts.json"));

        let before = file
            .update(|counts: &mut HashMap<String, u32>| counts.insert("a".into(), 1))
            .unwrap();
        assert!(before.is_none());
        file.update(|counts: &mut HashMap<String, u32>| {
            *counts.entry("a".into()).or_default() += 1;
        })
        .unwrap();

        let counts: HashMap<String, u32> = file.load().unwrap().unwrap();
        assert_eq!(counts.get("a"), Some(&2));
    }

    #[test]
    fn test_concurrent_updates_are_not_lost() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("counts.json");
        let shared = JsonFile::new(&path);
        let separate = JsonFile::new(&path);

        std::thread::scope(|s| {
            for (key, file) in [("a", shared.clone()), ("b", shared.clone()), ("c", separate)] {
                s.spawn(move || {
                    for _ in 0..100 {
                        file.update(|counts: &mut HashMap<String, u32>| {
                            *counts.entry(key.to_string()).or_default() += 1;
                        })
                        .unwrap();
                    }
                });
            }
        });

        let counts: HashMap<String, u32> = shared.load().unwrap().unwrap();
        assert_eq!(counts.get("a"), Some(&100));
        assert_eq!(counts.get("b"), Some(&100));
        assert_eq!(counts.get("c"), Some(&100));
    }

    #[test]
    fn test_delete() {
        let temp = TempDir::new().unwrap();
        let file = JsonFile::new(temp.path().join("doc.json"));
        file.save(&Doc {
            name: "x".into(),
            count: 0,
        })
        .unwrap();
        file.delete().expect("delete");
        assert!(!file.exists());
        file.delete().expect("deleting twice is fine");
    }
}
