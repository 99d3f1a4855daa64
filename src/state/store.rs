//! Versioned key-value state stores.
//!
//! A store instance is identified by `(operator id, partition id)` and opened
//! at a version: version `v` is the state left behind by `v` commits, so
//! micro-batch `b` opens version `b` and its commit publishes `b + 1`. Version
//! 0 is always the empty state.
//!
//! Keys and values are opaque bytes grouped into named column families; user
//! state and timers live in separate families of the same store.
//!
//! Two providers share one store implementation:
//! - [`MemoryStateStoreProvider`]: snapshots held in process memory.
//! - [`FileStateStoreProvider`]: one postcard snapshot file per version, with a
//!   SHA-256 checksum verified on load.

use crate::error::ExecError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::fs::{create_dir_all, read, read_dir, remove_file};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// Column family for user state when no name is given.
pub const DEFAULT_COL_FAMILY: &str = "default";
/// Column family holding registered timers.
pub const TIMERS_COL_FAMILY: &str = "$timers";

const SNAPSHOT_SUFFIX: &str = "snapshot";

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateStoreId {
    pub operator_id: u64,
    pub partition_id: usize,
}

impl StateStoreId {
    #[must_use]
    pub const fn new(operator_id: u64, partition_id: usize) -> Self {
        Self {
            operator_id,
            partition_id,
        }
    }
}

/// The whole content of one store version.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    families: BTreeMap<String, BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl StateSnapshot {
    #[must_use]
    pub fn num_keys(&self) -> usize {
        self.families.values().map(BTreeMap::len).sum()
    }
}

/// Lifecycle of an opened store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreStatus {
    Updating,
    Committed,
    Aborted,
}

/// One opened version of a partition's state.
///
/// Updates are staged in memory. [`commit`](Self::commit) publishes them as
/// the next version; [`abort`](Self::abort) discards them. Exactly one of the
/// two may happen.
pub trait StateStore: Send + Debug {
    fn id(&self) -> &StateStoreId;

    /// The version this store was opened at.
    fn version(&self) -> u64;

    fn status(&self) -> StoreStatus;

    /// # Errors
    ///
    /// Returns a state store error once the store is no longer updating.
    fn get(&self, family: &str, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// # Errors
    ///
    /// Returns a state store error once the store is no longer updating.
    fn put(&mut self, family: &str, key: Vec<u8>, value: Vec<u8>) -> Result<()>;

    /// Remove `key`, returning whether it was present.
    ///
    /// # Errors
    ///
    /// Returns a state store error once the store is no longer updating.
    fn remove(&mut self, family: &str, key: &[u8]) -> Result<bool>;

    /// Every entry of `family` in key order.
    ///
    /// # Errors
    ///
    /// Returns a state store error once the store is no longer updating.
    fn entries(&self, family: &str) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Publish staged updates as version `version() + 1`.
    ///
    /// # Errors
    ///
    /// Returns a state store error if the store is not updating or the
    /// snapshot cannot be written.
    fn commit(&mut self) -> Result<u64>;

    /// Discard staged updates. A no-op once committed or aborted.
    fn abort(&mut self);
}

/// Opens store versions. Shared by every task of an execution.
pub trait StateStoreProvider: Send + Sync + Debug {
    /// Open `id` at `version`.
    ///
    /// # Errors
    ///
    /// Returns a state store error if the version does not exist or its
    /// snapshot is corrupt.
    fn get_store(&self, id: &StateStoreId, version: u64) -> Result<Box<dyn StateStore>>;

    /// Highest committed version of `id`, 0 if nothing was committed.
    ///
    /// # Errors
    ///
    /// Returns a state store error if the backing storage cannot be read.
    fn latest_version(&self, id: &StateStoreId) -> Result<u64>;
}

fn store_err(msg: impl Into<String>) -> anyhow::Error {
    ExecError::StateStore(msg.into()).into()
}

#[derive(Debug, Clone)]
enum Backend {
    Memory(Arc<Mutex<HashMap<(StateStoreId, u64), StateSnapshot>>>),
    Files { root: PathBuf, retain: Option<usize> },
}

impl Backend {
    fn load(&self, id: &StateStoreId, version: u64) -> Result<StateSnapshot> {
        if version == 0 {
            return Ok(StateSnapshot::default());
        }
        match self {
            Self::Memory(versions) => versions
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&(id.clone(), version))
                .cloned()
                .ok_or_else(|| store_err(format!("{id:?} has no version {version}"))),
            Self::Files { root, .. } => load_snapshot(&snapshot_path(root, id, version)),
        }
    }

    fn save(&self, id: &StateStoreId, version: u64, snapshot: &StateSnapshot) -> Result<()> {
        match self {
            Self::Memory(versions) => {
                versions
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert((id.clone(), version), snapshot.clone());
                Ok(())
            }
            Self::Files { root, retain } => {
                save_snapshot(&snapshot_path(root, id, version), snapshot)?;
                if let Some(keep) = retain {
                    cleanup_old_versions(&partition_dir(root, id), *keep)?;
                }
                Ok(())
            }
        }
    }

    fn latest(&self, id: &StateStoreId) -> Result<u64> {
        match self {
            Self::Memory(versions) => Ok(versions
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .keys()
                .filter(|(i, _)| i == id)
                .map(|(_, v)| *v)
                .max()
                .unwrap_or(0)),
            Self::Files { root, .. } => {
                Ok(list_versions(&partition_dir(root, id))?.into_iter().max().unwrap_or(0))
            }
        }
    }
}

/// On-disk wrapper: the encoded snapshot and its checksum.
#[derive(Serialize, Deserialize)]
struct SnapshotFile {
    version: u64,
    checksum: String,
    payload: Vec<u8>,
}

/// Hex SHA-256 of `data`.
#[must_use]
pub fn compute_checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().iter().map(|b| format!("{b:02x}")).collect()
}

fn partition_dir(root: &Path, id: &StateStoreId) -> PathBuf {
    root.join(id.operator_id.to_string())
        .join(id.partition_id.to_string())
}

fn snapshot_path(root: &Path, id: &StateStoreId, version: u64) -> PathBuf {
    partition_dir(root, id).join(format!("{version}.{SNAPSHOT_SUFFIX}"))
}

fn load_snapshot(path: &Path) -> Result<StateSnapshot> {
    let bytes = read(path).map_err(|e| store_err(format!("read {}: {e}", path.display())))?;
    let file: SnapshotFile = postcard::from_bytes(&bytes)
        .map_err(|e| store_err(format!("decode {}: {e}", path.display())))?;
    if compute_checksum(&file.payload) != file.checksum {
        return Err(store_err(format!(
            "checksum mismatch in {} (version {})",
            path.display(),
            file.version
        )));
    }
    postcard::from_bytes(&file.payload)
        .map_err(|e| store_err(format!("decode state in {}: {e}", path.display())))
}

fn save_snapshot(path: &Path, snapshot: &StateSnapshot) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| store_err(format!("{} has no parent directory", path.display())))?;
    create_dir_all(dir).map_err(|e| store_err(format!("mkdir -p {}: {e}", dir.display())))?;
    let payload = postcard::to_allocvec(snapshot).context("encode state snapshot")?;
    let version = path
        .file_stem()
        .and_then(|s| s.to_str())
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    let file = SnapshotFile {
        version,
        checksum: compute_checksum(&payload),
        payload,
    };
    let encoded = postcard::to_allocvec(&file).context("encode snapshot file")?;
    let mut tmp = NamedTempFile::new_in(dir)
        .map_err(|e| store_err(format!("create temp file in {}: {e}", dir.display())))?;
    tmp.write_all(&encoded)
        .and_then(|()| tmp.as_file().sync_all())
        .map_err(|e| store_err(format!("write {}: {e}", path.display())))?;
    tmp.persist(path)
        .map_err(|e| store_err(format!("publish {}: {e}", path.display())))?;
    Ok(())
}

fn list_versions(dir: &Path) -> Result<Vec<u64>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let entries = read_dir(dir).map_err(|e| store_err(format!("list {}: {e}", dir.display())))?;
    Ok(entries
        .filter_map(Result::ok)
        .filter_map(|entry| {
            entry.file_name().to_str().and_then(|name| {
                name.strip_suffix(SNAPSHOT_SUFFIX)
                    .and_then(|s| s.strip_suffix('.'))
                    .and_then(|s| s.parse().ok())
            })
        })
        .collect())
}

fn cleanup_old_versions(dir: &Path, keep: usize) -> Result<()> {
    let mut versions = list_versions(dir)?;
    if versions.len() <= keep {
        return Ok(());
    }
    versions.sort_unstable();
    let excess = versions.len() - keep;
    for v in versions.into_iter().take(excess) {
        let path = dir.join(format!("{v}.{SNAPSHOT_SUFFIX}"));
        if let Err(e) = remove_file(&path) {
            warn!(path = %path.display(), error = %e, "could not remove old state snapshot");
        }
    }
    Ok(())
}

#[derive(Debug)]
struct VersionedStore {
    id: StateStoreId,
    version: u64,
    data: StateSnapshot,
    status: StoreStatus,
    backend: Backend,
}

impl VersionedStore {
    fn ensure_updating(&self) -> Result<()> {
        if self.status != StoreStatus::Updating {
            return Err(store_err(format!(
                "{:?} version {} is {:?}",
                self.id, self.version, self.status
            )));
        }
        Ok(())
    }
}

impl StateStore for VersionedStore {
    fn id(&self) -> &StateStoreId {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn status(&self) -> StoreStatus {
        self.status
    }

    fn get(&self, family: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.ensure_updating()?;
        Ok(self
            .data
            .families
            .get(family)
            .and_then(|f| f.get(key))
            .cloned())
    }

    fn put(&mut self, family: &str, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        self.ensure_updating()?;
        self.data
            .families
            .entry(family.to_string())
            .or_default()
            .insert(key, value);
        Ok(())
    }

    fn remove(&mut self, family: &str, key: &[u8]) -> Result<bool> {
        self.ensure_updating()?;
        Ok(self
            .data
            .families
            .get_mut(family)
            .is_some_and(|f| f.remove(key).is_some()))
    }

    fn entries(&self, family: &str) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.ensure_updating()?;
        Ok(self
            .data
            .families
            .get(family)
            .map(|f| f.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    fn commit(&mut self) -> Result<u64> {
        self.ensure_updating()?;
        let start = Instant::now();
        let next = self.version + 1;
        self.backend.save(&self.id, next, &self.data)?;
        self.status = StoreStatus::Committed;
        info!(
            operator = self.id.operator_id,
            partition = self.id.partition_id,
            version = next,
            keys = self.data.num_keys(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "committed state store"
        );
        Ok(next)
    }

    fn abort(&mut self) {
        if self.status == StoreStatus::Updating {
            self.status = StoreStatus::Aborted;
            debug!(
                operator = self.id.operator_id,
                partition = self.id.partition_id,
                version = self.version,
                "aborted state store"
            );
        }
    }
}

/// Keeps every committed version in memory.
#[derive(Debug, Default, Clone)]
pub struct MemoryStateStoreProvider {
    versions: Arc<Mutex<HashMap<(StateStoreId, u64), StateSnapshot>>>,
}

impl MemoryStateStoreProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStoreProvider for MemoryStateStoreProvider {
    fn get_store(&self, id: &StateStoreId, version: u64) -> Result<Box<dyn StateStore>> {
        let backend = Backend::Memory(Arc::clone(&self.versions));
        let data = backend.load(id, version)?;
        Ok(Box::new(VersionedStore {
            id: id.clone(),
            version,
            data,
            status: StoreStatus::Updating,
            backend,
        }))
    }

    fn latest_version(&self, id: &StateStoreId) -> Result<u64> {
        Backend::Memory(Arc::clone(&self.versions)).latest(id)
    }
}

/// Writes one snapshot file per committed version under
/// `<root>/<operator>/<partition>/<version>.snapshot`.
#[derive(Debug, Clone)]
pub struct FileStateStoreProvider {
    root: PathBuf,
    retain: Option<usize>,
}

impl FileStateStoreProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            retain: None,
        }
    }

    /// Keep only the newest `versions` snapshots per partition.
    #[must_use]
    pub fn with_retention(mut self, versions: usize) -> Self {
        self.retain = Some(versions.max(1));
        self
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the snapshot file for `version`.
    #[must_use]
    pub fn snapshot_path(&self, id: &StateStoreId, version: u64) -> PathBuf {
        snapshot_path(&self.root, id, version)
    }

    fn backend(&self) -> Backend {
        Backend::Files {
            root: self.root.clone(),
            retain: self.retain,
        }
    }
}

impl StateStoreProvider for FileStateStoreProvider {
    fn get_store(&self, id: &StateStoreId, version: u64) -> Result<Box<dyn StateStore>> {
        let backend = self.backend();
        let data = backend.load(id, version)?;
        debug!(
            root = %self.root.display(),
            operator = id.operator_id,
            partition = id.partition_id,
            version,
            "opened state store"
        );
        Ok(Box::new(VersionedStore {
            id: id.clone(),
            version,
            data,
            status: StoreStatus::Updating,
            backend,
        }))
    }

    fn latest_version(&self, id: &StateStoreId) -> Result<u64> {
        self.backend().latest(id)
    }
}
