//! # sandfs-pack
//!
//! Packed storage engine for sandfs.
//!
//! The backend charges per handle: every logical file touched is at least
//! one handle acquisition and one session. Batches of small files are
//! instead multiplexed into a single physical pack blob with a
//! self-describing index, so a whole batch costs one session regardless of
//! how many logical files it carries.
//!
//! ## Pack blob layout
//!
//! ```text
//! +----------------------+
//! | index length (u32 LE)|
//! | checksum     (u32 LE)|  CRC32 over everything after byte 8
//! +----------------------+
//! | JSON index           |  path -> { offset, size, original_size? }
//! +----------------------+
//! | entry payloads       |  concatenated in write order
//! +----------------------+
//! ```
//!
//! A checksum of 0 is a sentinel: integrity checking was disabled for that
//! write and the loader skips verification. Entry offsets are absolute from
//! the start of the blob, which is why the index length feeds back into the
//! offsets it describes and header sizing iterates to a fixed point.

mod codec;

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use sandfs_backend::{AccessSession, BackendError, BlobBackend};
use sandfs_config::{path, Config};
use sandfs_lock::LockRegistry;

/// Size of the `[index length][checksum]` prefix.
const HEADER_SIZE: u64 = 8;

/// Fixed-point header sizing must settle within this many rounds.
const MAX_LAYOUT_ROUNDS: usize = 10;

/// Errors that can occur during pack operations
#[derive(Error, Debug)]
pub enum PackError {
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("pack blob corrupted: checksum mismatch (stored {stored:#010x}, computed {computed:#010x})")]
    Corrupted { stored: u32, computed: u32 },

    #[error("entry {path} is marked compressed but failed to inflate: {reason}")]
    Decompress { path: String, reason: String },

    #[error("index serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("invalid pack blob: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, PackError>;

/// Index record for one packed logical file.
///
/// `original_size` is present exactly when the stored bytes are
/// DEFLATE-compressed; its absence means `size` bytes are stored verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackEntry {
    /// Absolute offset of the payload within the blob (at least 8)
    pub offset: u64,
    /// Stored payload length in bytes
    pub size: u64,
    /// Uncompressed length, when the payload is compressed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_size: Option<u64>,
}

impl PackEntry {
    /// Logical (uncompressed) size of the entry.
    pub fn logical_size(&self) -> u64 {
        self.original_size.unwrap_or(self.size)
    }
}

/// Mapping from normalized absolute path to its pack record.
pub type PackIndex = HashMap<String, PackEntry>;

/// Engine toggles, normally sourced from [`sandfs_config::PackConfig`].
#[derive(Debug, Clone)]
pub struct PackOptions {
    pub compression: bool,
    pub verify_checksums: bool,
}

impl Default for PackOptions {
    fn default() -> Self {
        Self {
            compression: true,
            verify_checksums: true,
        }
    }
}

/// In-memory index state.
///
/// `Unloaded` and an empty loaded index are distinct on purpose: the first
/// access after construction or [`PackStore::invalidate`] re-derives
/// authority from the persisted blob, while a legitimately empty pack costs
/// nothing on repeat queries.
#[derive(Debug)]
enum IndexCache {
    Unloaded,
    Loaded(PackIndex),
}

/// Packed storage engine over one backing blob.
///
/// All session I/O on the pack blob runs under the blob's resource key in
/// the shared [`LockRegistry`], honoring the backend's one-session-per-blob
/// restriction.
pub struct PackStore<B: BlobBackend> {
    backend: Arc<B>,
    blob_name: String,
    resource: String,
    locks: Arc<LockRegistry>,
    cache: Mutex<IndexCache>,
    options: PackOptions,
}

/// One payload staged for `write_batch`, after compression.
struct Prepared {
    path: String,
    data: Vec<u8>,
    original_size: Option<u64>,
}

impl<B: BlobBackend> PackStore<B> {
    /// Create a store with default options and blob name.
    pub fn new(backend: Arc<B>, locks: Arc<LockRegistry>) -> Self {
        Self::from_config(backend, locks, &Config::default())
    }

    /// Create a store configured from a [`Config`].
    pub fn from_config(backend: Arc<B>, locks: Arc<LockRegistry>, config: &Config) -> Self {
        Self::with_options(
            backend,
            locks,
            config.pack.blob_name.clone(),
            PackOptions {
                compression: config.pack.compression,
                verify_checksums: config.pack.verify_checksums,
            },
        )
    }

    /// Create a store with explicit blob name and options.
    pub fn with_options(
        backend: Arc<B>,
        locks: Arc<LockRegistry>,
        blob_name: impl Into<String>,
        options: PackOptions,
    ) -> Self {
        let blob_name = blob_name.into();
        let resource = format!("pack:{}", blob_name);
        Self {
            backend,
            blob_name,
            resource,
            locks,
            cache: Mutex::new(IndexCache::Unloaded),
            options,
        }
    }

    /// Store a batch of logical files as one atomic blob rewrite.
    ///
    /// The batch replaces the whole pack: any path previously packed but not
    /// present here is no longer retrievable afterwards. An empty batch is a
    /// no-op that touches neither memory nor the blob.
    #[instrument(skip(self, entries), fields(count = entries.len()), level = "debug")]
    pub async fn write_batch(&self, entries: Vec<(String, Vec<u8>)>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut prepared = Vec::with_capacity(entries.len());
        for (raw_path, bytes) in entries {
            let path = path::normalize(&raw_path);
            let (data, original_size) = if self.options.compression {
                match codec::maybe_compress(&bytes) {
                    Some(compressed) => {
                        let original = bytes.len() as u64;
                        (compressed, Some(original))
                    }
                    None => (bytes, None),
                }
            } else {
                (bytes, None)
            };
            prepared.push(Prepared {
                path,
                data,
                original_size,
            });
        }

        let (index_bytes, index) = layout(&prepared)?;
        let mut payload = Vec::with_capacity(prepared.iter().map(|p| p.data.len()).sum());
        for entry in &prepared {
            payload.extend_from_slice(&entry.data);
        }
        let blob = assemble_blob(&index_bytes, &payload, self.options.verify_checksums);

        let mut cache = self.cache.lock().await;
        let _guard = self.locks.acquire(&self.resource).await;
        // Failing before the first write leaves the in-memory index valid;
        // failing after it leaves disk in an unknown state, so the cache
        // drops to Unloaded and the next access re-reads authority.
        let mut session = self.backend.open_session(&self.blob_name, true).await?;
        if let Err(e) = session.write_at(&blob, 0).await {
            *cache = IndexCache::Unloaded;
            return Err(e.into());
        }
        if let Err(e) = session.truncate(blob.len() as u64).await {
            *cache = IndexCache::Unloaded;
            return Err(e.into());
        }
        if let Err(e) = session.close().await {
            *cache = IndexCache::Unloaded;
            return Err(e.into());
        }
        sandfs_config::log_pack_debug!(
            "pack batch written",
            blob = self.blob_name.as_str(),
            entries = index.len(),
            bytes = blob.len(),
        );
        *cache = IndexCache::Loaded(index);
        Ok(())
    }

    /// Fetch a batch of logical files.
    ///
    /// The index is loaded (or reused) once for the whole batch, and all
    /// present entries are read through a single session. Absent paths yield
    /// `None` at their position rather than failing the batch.
    pub async fn read_batch<S: AsRef<str>>(&self, paths: &[S]) -> Result<Vec<Option<Vec<u8>>>> {
        if paths.is_empty() {
            return Ok(Vec::new());
        }
        let mut cache = self.cache.lock().await;
        let index = self.ensure_loaded(&mut cache).await?;

        let plan: Vec<Option<PackEntry>> = paths
            .iter()
            .map(|p| index.get(&path::normalize(p.as_ref())).cloned())
            .collect();
        let mut results: Vec<Option<Vec<u8>>> = vec![None; paths.len()];
        if plan.iter().all(Option::is_none) {
            return Ok(results);
        }

        let _guard = self.locks.acquire(&self.resource).await;
        let mut session = self.backend.open_session(&self.blob_name, false).await?;
        for (slot, entry) in plan.iter().enumerate() {
            let Some(entry) = entry else { continue };
            let mut buf = vec![0u8; entry.size as usize];
            read_exact(&mut session, &mut buf, entry.offset).await?;
            let data = match entry.original_size {
                Some(original) => codec::decompress(&buf, original as usize).map_err(|e| {
                    PackError::Decompress {
                        path: paths[slot].as_ref().to_string(),
                        reason: e.to_string(),
                    }
                })?,
                None => buf,
            };
            results[slot] = Some(data);
        }
        session.close().await?;
        Ok(results)
    }

    /// Fetch a single logical file. `None` when not packed.
    pub async fn read(&self, path: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.read_batch(&[path]).await?.pop().flatten())
    }

    /// Logical size of a packed file without touching its payload bytes.
    pub async fn size_of(&self, path: &str) -> Result<Option<u64>> {
        let normalized = path::normalize(path);
        let mut cache = self.cache.lock().await;
        let index = self.ensure_loaded(&mut cache).await?;
        Ok(index.get(&normalized).map(PackEntry::logical_size))
    }

    /// Whether a path is currently packed.
    pub async fn has(&self, path: &str) -> Result<bool> {
        let normalized = path::normalize(path);
        let mut cache = self.cache.lock().await;
        let index = self.ensure_loaded(&mut cache).await?;
        Ok(index.contains_key(&normalized))
    }

    /// Whether the pack holds no entries.
    pub async fn is_empty(&self) -> Result<bool> {
        let mut cache = self.cache.lock().await;
        let index = self.ensure_loaded(&mut cache).await?;
        Ok(index.is_empty())
    }

    /// Number of packed entries.
    pub async fn len(&self) -> Result<usize> {
        let mut cache = self.cache.lock().await;
        let index = self.ensure_loaded(&mut cache).await?;
        Ok(index.len())
    }

    /// All packed paths, in no particular order.
    pub async fn paths(&self) -> Result<Vec<String>> {
        let mut cache = self.cache.lock().await;
        let index = self.ensure_loaded(&mut cache).await?;
        Ok(index.keys().cloned().collect())
    }

    /// Drop a path from the pack. Returns whether it was packed.
    ///
    /// The removed entry's payload bytes are left in place as dead space;
    /// only the index stops referencing them. The payload region shifts as a
    /// block by the index-length delta, and space is reclaimed on the next
    /// [`PackStore::write_batch`].
    #[instrument(skip(self), level = "debug")]
    pub async fn remove(&self, path: &str) -> Result<bool> {
        let normalized = path::normalize(path);
        let mut cache = self.cache.lock().await;
        let index = self.ensure_loaded(&mut cache).await?;
        if !index.contains_key(&normalized) {
            return Ok(false);
        }
        let remaining: Vec<(String, PackEntry)> = index
            .iter()
            .filter(|(p, _)| *p != &normalized)
            .map(|(p, e)| (p.clone(), e.clone()))
            .collect();

        let _guard = self.locks.acquire(&self.resource).await;
        let mut session = self.backend.open_session(&self.blob_name, true).await?;
        let total = session.size().await?;
        let mut header = [0u8; HEADER_SIZE as usize];
        read_exact(&mut session, &mut header, 0).await?;
        let old_index_len = u32::from_le_bytes(header[0..4].try_into().unwrap()) as u64;
        let old_payload_start = HEADER_SIZE + old_index_len;
        if old_payload_start > total {
            return Err(PackError::Invalid(format!(
                "index length {} exceeds blob size {}",
                old_index_len, total
            )));
        }
        let mut payload = vec![0u8; (total - old_payload_start) as usize];
        read_exact(&mut session, &mut payload, old_payload_start).await?;

        let (index_bytes, new_index) = layout_rebased(&remaining, old_payload_start)?;
        let blob = assemble_blob(&index_bytes, &payload, self.options.verify_checksums);

        if let Err(e) = session.write_at(&blob, 0).await {
            *cache = IndexCache::Unloaded;
            return Err(e.into());
        }
        if let Err(e) = session.truncate(blob.len() as u64).await {
            *cache = IndexCache::Unloaded;
            return Err(e.into());
        }
        if let Err(e) = session.close().await {
            *cache = IndexCache::Unloaded;
            return Err(e.into());
        }
        debug!(blob = %self.blob_name, path = %normalized, "entry removed");
        *cache = IndexCache::Loaded(new_index);
        Ok(true)
    }

    /// Drop the in-memory index to loaded-empty without touching the blob.
    ///
    /// Used when the whole virtual filesystem is being cleared and the
    /// caller destroys the backing blob itself.
    pub async fn reset(&self) {
        *self.cache.lock().await = IndexCache::Loaded(PackIndex::new());
    }

    /// Forget the in-memory index so the next access re-reads the blob.
    ///
    /// A second engine instance in another execution context shares no
    /// memory with this one; after its writes, the persisted header and
    /// checksum are the only authority.
    pub async fn invalidate(&self) {
        *self.cache.lock().await = IndexCache::Unloaded;
    }

    /// Load the index if the cache is still `Unloaded`.
    async fn ensure_loaded<'a>(&self, cache: &'a mut IndexCache) -> Result<&'a mut PackIndex> {
        if matches!(cache, IndexCache::Unloaded) {
            *cache = IndexCache::Loaded(self.load_index().await?);
        }
        match cache {
            IndexCache::Loaded(index) => Ok(index),
            IndexCache::Unloaded => unreachable!("cache loaded above"),
        }
    }

    /// Read and verify the persisted index.
    #[instrument(skip(self), level = "debug")]
    async fn load_index(&self) -> Result<PackIndex> {
        let _guard = self.locks.acquire(&self.resource).await;
        let mut session = self.backend.open_session(&self.blob_name, true).await?;
        let total = session.size().await?;
        if total < HEADER_SIZE {
            session.close().await?;
            return Ok(PackIndex::new());
        }
        let mut header = [0u8; HEADER_SIZE as usize];
        read_exact(&mut session, &mut header, 0).await?;
        let index_len = u32::from_le_bytes(header[0..4].try_into().unwrap()) as u64;
        let stored_crc = u32::from_le_bytes(header[4..8].try_into().unwrap());
        if HEADER_SIZE + index_len > total {
            return Err(PackError::Invalid(format!(
                "index length {} exceeds blob size {}",
                index_len, total
            )));
        }

        // A stored checksum of 0 means integrity checking was disabled for
        // this write; corruption must surface, never read as an empty pack.
        let index: PackIndex = if self.options.verify_checksums && stored_crc != 0 {
            let mut body = vec![0u8; (total - HEADER_SIZE) as usize];
            read_exact(&mut session, &mut body, HEADER_SIZE).await?;
            let computed = crc32fast::hash(&body);
            if computed != stored_crc {
                return Err(PackError::Corrupted {
                    stored: stored_crc,
                    computed,
                });
            }
            serde_json::from_slice(&body[..index_len as usize])?
        } else {
            let mut raw = vec![0u8; index_len as usize];
            read_exact(&mut session, &mut raw, HEADER_SIZE).await?;
            serde_json::from_slice(&raw)?
        };
        session.close().await?;
        debug!(blob = %self.blob_name, entries = index.len(), "pack index loaded");
        Ok(index)
    }
}

/// Read exactly `buf.len()` bytes or fail as a truncated blob.
async fn read_exact<S: AccessSession>(
    session: &mut S,
    buf: &mut [u8],
    offset: u64,
) -> Result<()> {
    let n = session.read_at(buf, offset).await?;
    if n != buf.len() {
        return Err(PackError::Invalid(format!(
            "truncated blob: wanted {} bytes at offset {}, got {}",
            buf.len(),
            offset,
            n
        )));
    }
    Ok(())
}

/// Compute entry offsets and the serialized index for a fresh batch.
///
/// The serialized index's length depends on the offsets it records, and the
/// offsets depend on where the index ends. Header sizing therefore iterates
/// to a fixed point: offsets grow monotonically with the assumed index
/// length, so the loop settles in two or three rounds.
fn layout(entries: &[Prepared]) -> Result<(Vec<u8>, PackIndex)> {
    let mut assumed_len = 0usize;
    for _ in 0..MAX_LAYOUT_ROUNDS {
        let mut index = PackIndex::with_capacity(entries.len());
        let mut offset = HEADER_SIZE + assumed_len as u64;
        for entry in entries {
            index.insert(
                entry.path.clone(),
                PackEntry {
                    offset,
                    size: entry.data.len() as u64,
                    original_size: entry.original_size,
                },
            );
            offset += entry.data.len() as u64;
        }
        let bytes = serde_json::to_vec(&index)?;
        if bytes.len() == assumed_len {
            return Ok((bytes, index));
        }
        assumed_len = bytes.len();
    }
    Err(PackError::Invalid(format!(
        "header sizing did not settle after {} rounds",
        MAX_LAYOUT_ROUNDS
    )))
}

/// Re-derive the index after a removal, preserving the payload region's
/// internal layout and shifting every offset by the index-length delta.
fn layout_rebased(
    entries: &[(String, PackEntry)],
    old_payload_start: u64,
) -> Result<(Vec<u8>, PackIndex)> {
    let mut assumed_len = 0usize;
    for _ in 0..MAX_LAYOUT_ROUNDS {
        let new_payload_start = HEADER_SIZE + assumed_len as u64;
        let index: PackIndex = entries
            .iter()
            .map(|(path, entry)| {
                (
                    path.clone(),
                    PackEntry {
                        offset: entry.offset - old_payload_start + new_payload_start,
                        size: entry.size,
                        original_size: entry.original_size,
                    },
                )
            })
            .collect();
        let bytes = serde_json::to_vec(&index)?;
        if bytes.len() == assumed_len {
            return Ok((bytes, index));
        }
        assumed_len = bytes.len();
    }
    Err(PackError::Invalid(format!(
        "header sizing did not settle after {} rounds",
        MAX_LAYOUT_ROUNDS
    )))
}

/// Build the full blob: placeholder header, index, payload, then checksum.
fn assemble_blob(index_bytes: &[u8], payload: &[u8], checksum_enabled: bool) -> Vec<u8> {
    let mut blob = Vec::with_capacity(HEADER_SIZE as usize + index_bytes.len() + payload.len());
    blob.extend_from_slice(&[0u8; HEADER_SIZE as usize]);
    blob.extend_from_slice(index_bytes);
    blob.extend_from_slice(payload);
    let crc = if checksum_enabled {
        crc32fast::hash(&blob[HEADER_SIZE as usize..])
    } else {
        0
    };
    blob[0..4].copy_from_slice(&(index_bytes.len() as u32).to_le_bytes());
    blob[4..8].copy_from_slice(&crc.to_le_bytes());
    blob
}
