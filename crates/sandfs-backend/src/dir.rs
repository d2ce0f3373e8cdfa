//! Directory-backed blob backend.
//!
//! One file per named blob under a root directory. Used by tests and by
//! native embeddings; the production substrate provides its own handles.

use std::collections::HashSet;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

use crate::{AccessSession, BackendError, BlobBackend, Result, WriteStream};

/// Shared registry of blob names with an open exclusive session or stream.
type OpenSet = Arc<Mutex<HashSet<String>>>;

/// Blob backend storing each blob as one file under a root directory.
#[derive(Debug, Clone)]
pub struct DirBackend {
    root: PathBuf,
    open: OpenSet,
}

impl DirBackend {
    /// Create a backend rooted at the given directory.
    ///
    /// The directory is created if it doesn't exist.
    pub fn new<P: AsRef<Path>>(root: P) -> std::io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            open: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    /// Host file backing the named blob.
    ///
    /// Blob names are flat identifiers; separators are folded so a name can
    /// never escape the root.
    fn blob_path(&self, name: &str) -> PathBuf {
        let safe: String = name
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        self.root.join(safe)
    }

    /// Reserve exclusivity for `name`, or fail with `SessionBusy`.
    fn reserve(&self, name: &str) -> Result<()> {
        let mut open = self.open.lock().unwrap();
        if !open.insert(name.to_string()) {
            return Err(BackendError::SessionBusy(name.to_string()));
        }
        Ok(())
    }

    fn release(open: &OpenSet, name: &str) {
        open.lock().unwrap().remove(name);
    }
}

impl BlobBackend for DirBackend {
    type Session = DirSession;
    type Stream = DirStream;

    async fn open_session(&self, name: &str, create: bool) -> Result<DirSession> {
        self.reserve(name)?;
        let path = self.blob_path(name);
        if !create && fs::metadata(&path).await.is_err() {
            Self::release(&self.open, name);
            return Err(BackendError::NotFound(name.to_string()));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .open(&path)
            .await;
        let file = match file {
            Ok(f) => f,
            Err(e) => {
                Self::release(&self.open, name);
                return Err(BackendError::Io(e));
            }
        };
        debug!(blob = name, "session opened");
        Ok(DirSession {
            name: name.to_string(),
            file,
            open: self.open.clone(),
            released: false,
        })
    }

    async fn open_stream(&self, name: &str) -> Result<DirStream> {
        self.reserve(name)?;
        let final_path = self.blob_path(name);
        // Suffix the full file name; with_extension would fold distinct
        // blob names onto one temp path.
        let tmp_path = {
            let mut tmp_name = final_path
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_default();
            tmp_name.push(format!(".tmp.{}", std::process::id()));
            final_path.with_file_name(tmp_name)
        };
        let file = match File::create(&tmp_path).await {
            Ok(f) => f,
            Err(e) => {
                Self::release(&self.open, name);
                return Err(BackendError::Io(e));
            }
        };
        Ok(DirStream {
            name: name.to_string(),
            tmp_path,
            final_path,
            file,
            open: self.open.clone(),
            released: false,
        })
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        Ok(fs::metadata(self.blob_path(name)).await.is_ok())
    }

    async fn remove(&self, name: &str) -> Result<bool> {
        match fs::remove_file(self.blob_path(name)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(BackendError::Io(e)),
        }
    }
}

/// Exclusive random-access session over one blob file.
#[derive(Debug)]
pub struct DirSession {
    name: String,
    file: File,
    open: OpenSet,
    released: bool,
}

impl AccessSession for DirSession {
    async fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.file.seek(SeekFrom::Start(offset)).await?;
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    async fn write_at(&mut self, data: &[u8], offset: u64) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.write_all(data).await?;
        Ok(())
    }

    async fn truncate(&mut self, size: u64) -> Result<()> {
        self.file.set_len(size).await?;
        Ok(())
    }

    async fn size(&mut self) -> Result<u64> {
        Ok(self.file.metadata().await?.len())
    }

    async fn close(mut self) -> Result<()> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        DirBackend::release(&self.open, &self.name);
        self.released = true;
        debug!(blob = %self.name, "session closed");
        Ok(())
    }
}

impl Drop for DirSession {
    fn drop(&mut self) {
        if !self.released {
            DirBackend::release(&self.open, &self.name);
        }
    }
}

/// Buffered stream replacing one blob atomically on close.
///
/// Bytes accumulate in a temp file next to the target; close syncs and
/// renames over it, so a crash mid-stream leaves the old content intact.
#[derive(Debug)]
pub struct DirStream {
    name: String,
    tmp_path: PathBuf,
    final_path: PathBuf,
    file: File,
    open: OpenSet,
    released: bool,
}

impl WriteStream for DirStream {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.file.write_all(data).await?;
        Ok(())
    }

    async fn close(mut self) -> Result<()> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        fs::rename(&self.tmp_path, &self.final_path).await?;
        DirBackend::release(&self.open, &self.name);
        self.released = true;
        debug!(blob = %self.name, "stream committed");
        Ok(())
    }
}

impl Drop for DirStream {
    fn drop(&mut self) {
        if !self.released {
            DirBackend::release(&self.open, &self.name);
            let _ = std::fs::remove_file(&self.tmp_path);
        }
    }
}
