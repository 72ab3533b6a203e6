//! Persistent record of what every instanced stage last produced.
//!
//! Entries are namespaced by stage name and then by instance key. An entry
//! exists for every instance that was processed and not yet torn down. When
//! processing failed, the entry stays behind marked as failed, so that the
//! next build either retries the instance or cleans up after it.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::sync::{Mutex, MutexGuard, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::core::Hash32;
use crate::error::CacheError;

/// What the last build left behind for one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Fingerprint of the content last processed.
    pub fingerprint: Hash32,
    /// Whatever the lifecycle last returned, needed to undo it on deletion.
    /// Missing when the instance never got that far.
    #[serde(default)]
    pub output: Option<serde_json::Value>,
    /// The last operation on the instance failed and may have left partial
    /// artifacts around.
    #[serde(default)]
    pub failed: bool,
}

impl CacheEntry {
    pub fn succeeded(fingerprint: Hash32, output: serde_json::Value) -> Self {
        Self {
            fingerprint,
            output: Some(output),
            failed: false,
        }
    }

    /// Records a failed operation, keeping whatever output was known before.
    pub fn failure(fingerprint: Hash32, output: Option<serde_json::Value>) -> Self {
        Self {
            fingerprint,
            output,
            failed: true,
        }
    }
}

type Entries = BTreeMap<String, BTreeMap<String, CacheEntry>>;

#[derive(Debug, Default)]
pub struct CacheStore {
    path: Option<Utf8PathBuf>,
    entries: Mutex<Entries>,
}

impl CacheStore {
    /// A store that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Opens the store persisted at `path`. A missing file is an empty store.
    pub fn load(path: impl AsRef<Utf8Path>) -> Result<Self, CacheError> {
        let path = path.as_ref();

        let entries = match File::open(path) {
            Ok(file) => ciborium::from_reader::<Entries, _>(BufReader::new(file))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Entries::new(),
            Err(source) => {
                return Err(CacheError::Io {
                    path: path.to_owned(),
                    source,
                });
            }
        };

        tracing::debug!(path = %path, stages = entries.len(), "loaded cache state");

        Ok(Self {
            path: Some(path.to_owned()),
            entries: Mutex::new(entries),
        })
    }

    /// Writes the store back to where it was loaded from. In-memory stores
    /// do nothing.
    pub fn save(&self) -> Result<(), CacheError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let io = |source| CacheError::Io {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io)?;
        }

        // Written next to the target and renamed, so a crash mid-write keeps
        // the previous state intact.
        let staging = path.with_extension("tmp");
        {
            let entries = self.lock();
            let file = File::create(&staging).map_err(io)?;
            let mut writer = BufWriter::new(file);
            ciborium::into_writer(&*entries, &mut writer)?;
            writer.flush().map_err(io)?;
        }
        fs::rename(&staging, path).map_err(io)?;

        Ok(())
    }

    pub fn get(&self, stage: &str, key: &str) -> Option<CacheEntry> {
        self.lock().get(stage)?.get(key).cloned()
    }

    pub fn put(&self, stage: &str, key: &str, entry: CacheEntry) {
        self.lock()
            .entry(stage.to_owned())
            .or_default()
            .insert(key.to_owned(), entry);
    }

    pub fn delete(&self, stage: &str, key: &str) -> Option<CacheEntry> {
        let mut entries = self.lock();
        let namespace = entries.get_mut(stage)?;
        let removed = namespace.remove(key);

        if namespace.is_empty() {
            entries.remove(stage);
        }

        removed
    }

    /// Snapshot of every entry recorded for `stage`.
    pub fn entries(&self, stage: &str) -> BTreeMap<String, CacheEntry> {
        self.lock().get(stage).cloned().unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
