//! On-disk endpoint cache.
//!
//! One JSON file per known endpoint (`available_server_<n>.json`) plus one
//! file for the endpoint the instance is registered against
//! (`current_server.json`).  Files are written through a temporary file in
//! the same directory and renamed into place, so a reader never observes a
//! half-written record.

use std::fs;
use std::io::{ErrorKind, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use tempfile::NamedTempFile;

use crate::error::{Error, Result};
use crate::types::EndpointRecord;

const CURRENT_FILE: &str = "current_server.json";
const AVAILABLE_PREFIX: &str = "available_server_";
const SUFFIX: &str = ".json";

/// Where a record is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSlot {
    Current,
    Available(u32),
}

/// Snapshot returned by [`EndpointCache::load`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CachedEndpoints {
    pub current: Option<EndpointRecord>,
    pub available: Vec<EndpointRecord>,
}

pub struct EndpointCache {
    dir: PathBuf,
}

impl EndpointCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn slot_path(&self, slot: CacheSlot) -> PathBuf {
        match slot {
            CacheSlot::Current => self.dir.join(CURRENT_FILE),
            CacheSlot::Available(n) => self.dir.join(format!("{AVAILABLE_PREFIX}{n}{SUFFIX}")),
        }
    }

    /// Read the current target and every available endpoint, ordered by slot.
    pub fn load(&self) -> Result<CachedEndpoints> {
        let current = self.read_record(&self.slot_path(CacheSlot::Current))?;
        let mut available = Vec::new();
        for (_, path) in self.available_slots()? {
            if let Some(record) = self.read_record(&path)? {
                available.push(record);
            }
        }
        debug!(
            "Loaded endpoint cache from {}: current={}, available={}",
            self.dir.display(),
            current.is_some(),
            available.len()
        );
        Ok(CachedEndpoints { current, available })
    }

    pub fn contains(&self, slot: CacheSlot) -> bool {
        self.slot_path(slot).is_file()
    }

    /// Write `record` into `slot`, replacing what was there.
    pub fn persist(&self, record: &EndpointRecord, slot: CacheSlot) -> Result<()> {
        let path = self.slot_path(slot);
        fs::create_dir_all(&self.dir).map_err(|e| Error::cache_io(&self.dir, e))?;

        let mut tmp = NamedTempFile::new_in(&self.dir).map_err(|e| Error::cache_io(&self.dir, e))?;
        tmp.as_file()
            .set_permissions(fs::Permissions::from_mode(0o600))
            .map_err(|e| Error::cache_io(tmp.path(), e))?;
        let body = serde_json::to_vec_pretty(record)
            .map_err(|e| Error::cache_io(&path, std::io::Error::new(ErrorKind::InvalidData, e)))?;
        tmp.write_all(&body).map_err(|e| Error::cache_io(tmp.path(), e))?;
        tmp.persist(&path).map_err(|e| Error::cache_io(&path, e.error))?;

        debug!("Cached {} in {}", record.fqdn, path.display());
        Ok(())
    }

    /// Persist into the next unused available slot and return it.
    pub fn persist_new(&self, record: &EndpointRecord) -> Result<CacheSlot> {
        let slot = self.next_free_slot()?;
        self.persist(record, slot)?;
        Ok(slot)
    }

    /// One past the highest slot index on disk, so slots never collide.
    pub fn next_free_slot(&self) -> Result<CacheSlot> {
        let next = self
            .available_slots()?
            .last()
            .map(|(n, _)| n + 1)
            .unwrap_or(0);
        Ok(CacheSlot::Available(next))
    }

    pub fn remove(&self, slot: CacheSlot) -> Result<()> {
        let path = self.slot_path(slot);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::cache_io(path, e)),
        }
    }

    /// Remove every cached record, the current target included.
    pub fn purge_all(&self) -> Result<()> {
        self.remove(CacheSlot::Current)?;
        for (n, _) in self.available_slots()? {
            self.remove(CacheSlot::Available(n))?;
        }
        info!("Purged endpoint cache in {}", self.dir.display());
        Ok(())
    }

    fn available_slots(&self) -> Result<Vec<(u32, PathBuf)>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::cache_io(&self.dir, e)),
        };

        let mut slots = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Error::cache_io(&self.dir, e))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let index = name
                .strip_prefix(AVAILABLE_PREFIX)
                .and_then(|rest| rest.strip_suffix(SUFFIX))
                .and_then(|n| n.parse::<u32>().ok());
            if let Some(n) = index {
                slots.push((n, entry.path()));
            }
        }
        slots.sort_by_key(|(n, _)| *n);
        Ok(slots)
    }

    fn read_record(&self, path: &Path) -> Result<Option<EndpointRecord>> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::cache_io(path, e)),
        };
        match serde_json::from_slice(&bytes) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!("Ignoring unreadable cache entry {}: {}", path.display(), e);
                Ok(None)
            }
        }
    }
}
