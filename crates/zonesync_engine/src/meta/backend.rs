//! Byte stores behind the metadata journal.

use crate::error::{MetaError, MetaResult};
use fs2::FileExt;
use parking_lot::Mutex;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

/// An append-only byte store for the metadata journal.
///
/// Backends know nothing about frames. The journal owns the format.
///
/// # Invariants
///
/// - `append` writes at the end and returns the offset written at
/// - a failed `append` leaves the size it started from
/// - after `sync` returns, appended bytes survive process termination
/// - `replace` swaps the whole content atomically
pub trait MetaBackend: Send {
    /// Reads the full content.
    fn read_all(&self) -> MetaResult<Vec<u8>>;

    /// Appends bytes, returning the offset they were written at.
    fn append(&mut self, data: &[u8]) -> MetaResult<u64>;

    /// Makes appended bytes durable.
    fn sync(&mut self) -> MetaResult<()>;

    /// Replaces the whole content with `data`.
    fn replace(&mut self, data: &[u8]) -> MetaResult<()>;

    /// Current size in bytes.
    fn size(&self) -> MetaResult<u64>;

    /// Returns false if every write is refused.
    fn is_writable(&self) -> bool {
        true
    }
}

/// A file-backed journal store.
///
/// A writable backend holds an exclusive lock on a sibling `.lock` file for
/// as long as it lives, so a second writer of the same journal is refused.
/// The lock lives outside the journal because `replace` writes a sibling
/// temporary file, syncs it, and renames it over the journal.
#[derive(Debug)]
pub struct FileMetaBackend {
    path: PathBuf,
    file: File,
    size: u64,
    /// Lock file handle, `None` when opened read-only.
    lock: Option<File>,
    #[cfg(test)]
    fail_write_after: Option<usize>,
}

impl FileMetaBackend {
    /// Opens or creates the journal at `path` for writing.
    ///
    /// # Errors
    ///
    /// Returns [`MetaError::Locked`] if another backend holds the journal,
    /// or an I/O error if the file cannot be opened or created.
    pub fn open(path: &Path) -> MetaResult<Self> {
        let lock = Self::lock(path)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            file,
            size,
            lock: Some(lock),
            #[cfg(test)]
            fail_write_after: None,
        })
    }

    /// Opens an existing journal for reading only.
    ///
    /// No lock is taken and every write fails with [`MetaError::ReadOnly`],
    /// so the file is never changed, even if its tail is torn.
    ///
    /// # Errors
    ///
    /// Returns an error if the file does not exist or cannot be read.
    pub fn open_read_only(path: &Path) -> MetaResult<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            file,
            size,
            lock: None,
            #[cfg(test)]
            fail_write_after: None,
        })
    }

    /// Opens or creates the journal, creating parent directories first.
    ///
    /// # Errors
    ///
    /// Returns an error if directories cannot be created or the file cannot
    /// be opened.
    pub fn open_with_create_dirs(path: &Path) -> MetaResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        Self::open(path)
    }

    /// Path of the journal file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(path: &Path) -> MetaResult<File> {
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(sibling(path, ".lock"))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(MetaError::Locked {
                path: path.to_path_buf(),
            });
        }
        Ok(lock_file)
    }

    fn check_writable(&self) -> MetaResult<()> {
        if self.lock.is_none() {
            return Err(MetaError::ReadOnly);
        }
        Ok(())
    }

    /// Makes the next append write only `bytes` bytes and then fail.
    #[cfg(test)]
    pub(crate) fn fail_next_write_after(&mut self, bytes: usize) {
        self.fail_write_after = Some(bytes);
    }

    fn write_frame(&mut self, data: &[u8]) -> io::Result<()> {
        #[cfg(test)]
        if let Some(limit) = self.fail_write_after.take() {
            self.file.write_all(&data[..limit.min(data.len())])?;
            return Err(io::Error::new(io::ErrorKind::Other, "injected short write"));
        }
        self.file.write_all(data)
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

impl MetaBackend for FileMetaBackend {
    fn read_all(&self) -> MetaResult<Vec<u8>> {
        let mut file = &self.file;
        file.seek(SeekFrom::Start(0))?;
        let mut data = Vec::with_capacity(self.size as usize);
        file.read_to_end(&mut data)?;
        Ok(data)
    }

    fn append(&mut self, data: &[u8]) -> MetaResult<u64> {
        self.check_writable()?;
        let offset = self.size;
        if data.is_empty() {
            return Ok(offset);
        }
        self.file.seek(SeekFrom::End(0))?;
        if let Err(e) = self.write_frame(data) {
            // Cut any partial frame so the next append lands on a frame boundary.
            if let Err(trunc) = self.file.set_len(self.size) {
                warn!(error = %trunc, "failed to truncate partial journal write");
            }
            return Err(e.into());
        }
        self.size += data.len() as u64;
        Ok(offset)
    }

    fn sync(&mut self) -> MetaResult<()> {
        self.check_writable()?;
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    fn replace(&mut self, data: &[u8]) -> MetaResult<()> {
        self.check_writable()?;
        let temp = sibling(&self.path, ".tmp");
        {
            let mut out = File::create(&temp)?;
            out.write_all(data)?;
            out.sync_all()?;
        }
        fs::rename(&temp, &self.path)?;
        self.file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        self.size = self.file.metadata()?.len();
        Ok(())
    }

    fn size(&self) -> MetaResult<u64> {
        Ok(self.size)
    }

    fn is_writable(&self) -> bool {
        self.lock.is_some()
    }
}

/// An in-memory journal store.
///
/// Clones share the same bytes, so a test can drop a metadata store and
/// reopen it over the same content.
#[derive(Debug, Clone, Default)]
pub struct MemoryMetaBackend {
    data: Arc<Mutex<Vec<u8>>>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryMetaBackend {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store holding `data`.
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(Mutex::new(data)),
            fail_writes: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Copy of the current content.
    pub fn data(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    /// Makes writes fail with an I/O error while set.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> MetaResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "injected write failure").into());
        }
        Ok(())
    }
}

impl MetaBackend for MemoryMetaBackend {
    fn read_all(&self) -> MetaResult<Vec<u8>> {
        Ok(self.data())
    }

    fn append(&mut self, new_data: &[u8]) -> MetaResult<u64> {
        self.check_writable()?;
        let mut data = self.data.lock();
        let offset = data.len() as u64;
        data.extend_from_slice(new_data);
        Ok(offset)
    }

    fn sync(&mut self) -> MetaResult<()> {
        self.check_writable()
    }

    fn replace(&mut self, new_data: &[u8]) -> MetaResult<()> {
        self.check_writable()?;
        *self.data.lock() = new_data.to_vec();
        Ok(())
    }

    fn size(&self) -> MetaResult<u64> {
        Ok(self.data.lock().len() as u64)
    }
}
