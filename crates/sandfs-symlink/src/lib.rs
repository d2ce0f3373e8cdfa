//! # sandfs-symlink
//!
//! Symlink emulation layer for sandfs.
//!
//! The backend has no symbolic link primitive, so links live in a persisted
//! path→target table backed by a single metadata blob. The table is loaded
//! lazily, cached in memory, and written back wholesale on every mutation -
//! write-through, so there is never a window where memory and disk
//! disagree. Resolution follows chains with a hard depth bound of
//! [`MAX_LINK_DEPTH`] hops; exceeding it is a cycle error, never a hang.
//!
//! Targets are plain strings: a link may name a target that does not exist
//! (dangling), and several links may share one target.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use sandfs_backend::{AccessSession, BackendError, BlobBackend, WriteStream};
use sandfs_config::{path, Config};
use sandfs_lock::LockRegistry;

/// Chain resolution gives up after this many hops. The bound is fixed and
/// independent of table size.
pub const MAX_LINK_DEPTH: usize = 10;

/// Errors raised by the link table
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("link already exists: {0}")]
    AlreadyExists(String),

    #[error("not a symbolic link: {0}")]
    NotALink(String),

    #[error("no such path: {0}")]
    NotFound(String),

    #[error("too many levels of symbolic links: {0}")]
    TooManyLinks(String),

    #[error("link table serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, LinkError>;

/// In-memory table state.
///
/// `Unloaded` and loaded-empty are distinct: the empty-table fast path in
/// [`LinkTable::resolve`] must not cost a blob read per call once the table
/// is known to be empty.
#[derive(Debug)]
enum TableCache {
    Unloaded,
    Loaded(HashMap<String, String>),
}

#[derive(Debug)]
struct LinkState {
    table: TableCache,
    /// Link path → final non-link path, cleared on every mutation.
    resolved: HashMap<String, String>,
}

/// Path→target table emulating symbolic links over the blob backend.
///
/// Every operation that touches the backing blob runs under the table's
/// resource key in the shared [`LockRegistry`].
pub struct LinkTable<B: BlobBackend> {
    backend: Arc<B>,
    blob_name: String,
    resource: String,
    locks: Arc<LockRegistry>,
    state: Mutex<LinkState>,
}

impl<B: BlobBackend> LinkTable<B> {
    /// Create a table with the default blob name.
    pub fn new(backend: Arc<B>, locks: Arc<LockRegistry>) -> Self {
        Self::from_config(backend, locks, &Config::default())
    }

    /// Create a table configured from a [`Config`].
    pub fn from_config(backend: Arc<B>, locks: Arc<LockRegistry>, config: &Config) -> Self {
        Self::with_blob_name(backend, locks, config.links.blob_name.clone())
    }

    /// Create a table with an explicit blob name.
    pub fn with_blob_name(
        backend: Arc<B>,
        locks: Arc<LockRegistry>,
        blob_name: impl Into<String>,
    ) -> Self {
        let blob_name = blob_name.into();
        let resource = format!("links:{}", blob_name);
        Self {
            backend,
            blob_name,
            resource,
            locks,
            state: Mutex::new(LinkState {
                table: TableCache::Unloaded,
                resolved: HashMap::new(),
            }),
        }
    }

    /// Create a link at `path` pointing to `target`.
    ///
    /// `existence_check` is a capability supplied by the caller, which is
    /// the only party that knows whether the backend already has a real
    /// file or directory at `path`. The check aborts insertion by returning
    /// an error - except [`LinkError::NotFound`], which is clearance to
    /// proceed, exactly like a stat probe that throws on absent paths.
    #[instrument(skip(self, existence_check), level = "debug")]
    pub async fn symlink<F, Fut>(&self, target: &str, link_path: &str, existence_check: F) -> Result<()>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let target = path::normalize(target);
        let link_path = path::normalize(link_path);

        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await?;
        let LinkState {
            table: TableCache::Loaded(table),
            resolved,
        } = &mut *state
        else {
            unreachable!("table loaded above")
        };

        if table.contains_key(&link_path) {
            return Err(LinkError::AlreadyExists(link_path));
        }
        match existence_check(link_path.clone()).await {
            Ok(()) | Err(LinkError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        table.insert(link_path.clone(), target.clone());
        resolved.clear();
        self.persist(table).await?;
        sandfs_config::log_links_debug!(
            "symlink created",
            link = link_path.as_str(),
            target = target.as_str(),
        );
        Ok(())
    }

    /// Create many links in one table mutation and one persist.
    ///
    /// Each element is `(target, link_path)`. All paths are validated
    /// against the in-memory table (and against each other) before any
    /// existence-check I/O runs; the checks themselves run concurrently.
    /// Any aborting check failure leaves the table untouched.
    pub async fn symlink_batch<F, Fut>(
        &self,
        links: &[(String, String)],
        existence_check: F,
    ) -> Result<()>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        if links.is_empty() {
            return Ok(());
        }
        let normalized: Vec<(String, String)> = links
            .iter()
            .map(|(target, link)| (path::normalize(target), path::normalize(link)))
            .collect();

        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await?;
        let LinkState {
            table: TableCache::Loaded(table),
            resolved,
        } = &mut *state
        else {
            unreachable!("table loaded above")
        };

        let mut seen = HashSet::new();
        for (_, link) in &normalized {
            if table.contains_key(link) || !seen.insert(link.clone()) {
                return Err(LinkError::AlreadyExists(link.clone()));
            }
        }

        let checks = normalized
            .iter()
            .map(|(_, link)| existence_check(link.clone()));
        for result in futures::future::join_all(checks).await {
            match result {
                Ok(()) | Err(LinkError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        for (target, link) in normalized {
            table.insert(link, target);
        }
        resolved.clear();
        self.persist(table).await?;
        debug!(links = links.len(), "symlink batch created");
        Ok(())
    }

    /// Immediate target of a link - one hop, not fully resolved.
    pub async fn readlink(&self, link_path: &str) -> Result<String> {
        let link_path = path::normalize(link_path);
        let mut state = self.state.lock().await;
        let table = self.loaded_table(&mut state).await?;
        table
            .get(&link_path)
            .cloned()
            .ok_or(LinkError::NotALink(link_path))
    }

    /// Follow the chain from `start` to its final non-link path.
    ///
    /// The overwhelmingly common case is an empty table, which costs one
    /// count check. A previously resolved non-trivial chain is answered
    /// from the resolved-path cache without walking.
    pub async fn resolve(&self, start: &str) -> Result<String> {
        self.resolve_with_depth(start, MAX_LINK_DEPTH).await
    }

    /// [`LinkTable::resolve`] with an explicit hop bound.
    pub async fn resolve_with_depth(&self, start: &str, max_depth: usize) -> Result<String> {
        let start = path::normalize(start);
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await?;
        let LinkState {
            table: TableCache::Loaded(table),
            resolved,
        } = &mut *state
        else {
            unreachable!("table loaded above")
        };

        if table.is_empty() {
            return Ok(start);
        }
        if let Some(hit) = resolved.get(&start) {
            return Ok(hit.clone());
        }

        let mut current = start.clone();
        let mut hops = 0;
        while let Some(target) = table.get(&current) {
            hops += 1;
            if hops > max_depth {
                return Err(LinkError::TooManyLinks(start));
            }
            current = target.clone();
        }

        // A trivial resolution is not worth a cache slot.
        if current != start {
            resolved.insert(start, current.clone());
        }
        Ok(current)
    }

    /// Remove a link. Returns whether one existed.
    #[instrument(skip(self), level = "debug")]
    pub async fn unlink(&self, link_path: &str) -> Result<bool> {
        let link_path = path::normalize(link_path);
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await?;
        let LinkState {
            table: TableCache::Loaded(table),
            resolved,
        } = &mut *state
        else {
            unreachable!("table loaded above")
        };

        if table.remove(&link_path).is_none() {
            return Ok(false);
        }
        resolved.clear();
        self.persist(table).await?;
        debug!(link = %link_path, "symlink removed");
        Ok(true)
    }

    /// Move a link to a new path, keeping its target.
    ///
    /// Returns false when `old_path` is not a link; the caller then handles
    /// the rename as a plain file move.
    pub async fn rename(&self, old_path: &str, new_path: &str) -> Result<bool> {
        let old_path = path::normalize(old_path);
        let new_path = path::normalize(new_path);
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await?;
        let LinkState {
            table: TableCache::Loaded(table),
            resolved,
        } = &mut *state
        else {
            unreachable!("table loaded above")
        };

        let Some(target) = table.remove(&old_path) else {
            return Ok(false);
        };
        table.insert(new_path.clone(), target);
        resolved.clear();
        self.persist(table).await?;
        debug!(from = %old_path, to = %new_path, "symlink renamed");
        Ok(true)
    }

    /// Link paths whose parent directory is `dir_path`, sorted.
    ///
    /// Directory listings use this to present link names even when the
    /// backend has no real entry for them.
    pub async fn links_in_directory(&self, dir_path: &str) -> Result<Vec<String>> {
        let dir_path = path::normalize(dir_path);
        let mut state = self.state.lock().await;
        let table = self.loaded_table(&mut state).await?;
        let mut links: Vec<String> = table
            .keys()
            .filter(|link| path::parent_of(link).as_deref() == Some(dir_path.as_str()))
            .cloned()
            .collect();
        links.sort();
        Ok(links)
    }

    /// Number of links in the table.
    pub async fn len(&self) -> Result<usize> {
        let mut state = self.state.lock().await;
        let table = self.loaded_table(&mut state).await?;
        Ok(table.len())
    }

    /// Whether the table holds no links.
    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Drop in-memory state to empty without touching the backing blob.
    ///
    /// Used for bulk clears where the caller destroys the blob itself.
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        state.table = TableCache::Loaded(HashMap::new());
        state.resolved.clear();
    }

    /// Forget in-memory state so the next access re-reads the blob.
    pub async fn invalidate(&self) {
        let mut state = self.state.lock().await;
        state.table = TableCache::Unloaded;
        state.resolved.clear();
    }

    async fn ensure_loaded(&self, state: &mut LinkState) -> Result<()> {
        if matches!(state.table, TableCache::Unloaded) {
            state.table = TableCache::Loaded(self.load_table().await?);
        }
        Ok(())
    }

    /// Load-if-needed, for read-only callers.
    async fn loaded_table<'a>(
        &self,
        state: &'a mut LinkState,
    ) -> Result<&'a HashMap<String, String>> {
        self.ensure_loaded(state).await?;
        match &state.table {
            TableCache::Loaded(table) => Ok(table),
            TableCache::Unloaded => unreachable!("table loaded above"),
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn load_table(&self) -> Result<HashMap<String, String>> {
        let _guard = self.locks.acquire(&self.resource).await;
        if !self.backend.exists(&self.blob_name).await? {
            return Ok(HashMap::new());
        }
        let mut session = self.backend.open_session(&self.blob_name, false).await?;
        let size = session.size().await? as usize;
        let mut buf = vec![0u8; size];
        if size > 0 {
            let n = session.read_at(&mut buf, 0).await?;
            buf.truncate(n);
        }
        session.close().await?;
        if buf.is_empty() {
            return Ok(HashMap::new());
        }
        let table: HashMap<String, String> = serde_json::from_slice(&buf)?;
        debug!(blob = %self.blob_name, links = table.len(), "link table loaded");
        Ok(table)
    }

    /// Write the whole table back - every mutation flushes synchronously.
    async fn persist(&self, table: &HashMap<String, String>) -> Result<()> {
        let bytes = serde_json::to_vec(table)?;
        let _guard = self.locks.acquire(&self.resource).await;
        let mut stream = self.backend.open_stream(&self.blob_name).await?;
        stream.write(&bytes).await?;
        stream.close().await?;
        Ok(())
    }
}
