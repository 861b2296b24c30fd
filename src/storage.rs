//! Maps the concatenated byte stream of a torrent onto the files on disk.

use std::{
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tracing::{debug, trace};

use crate::metainfo::FileEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overlap {
    None,
    Partial,
    Full,
}

/// The part of a stream range that falls into one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bounds {
    /// Offset into the caller's buffer.
    pub data_offset: usize,
    pub data_length: usize,
    /// Offset into the file.
    pub file_offset: u64,
}

/// Outcome of an I/O attempt on a unit that may be in use.
#[derive(Debug, PartialEq, Eq)]
pub enum Transfer<T> {
    Done(T),
    Busy,
}

#[derive(Debug)]
pub struct FileUnit {
    path: PathBuf,
    offset: u64,
    length: u64,
    file: Arc<std::fs::File>,
    busy: AtomicBool,
}

pub(crate) struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl FileUnit {
    async fn open(dir: &Path, entry: &FileEntry) -> Result<Self, StorageError> {
        let path = dir.join(&entry.path);
        let open_error = |error| StorageError::Open {
            path: path.clone(),
            error,
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(open_error)?;
        }
        let file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .await
            .map_err(open_error)?;
        let current = file.metadata().await.map_err(open_error)?.len();
        if current != entry.length {
            file.set_len(entry.length).await.map_err(open_error)?;
        }
        debug!(path = %path.display(), length = entry.length, "opened file");

        Ok(Self {
            file: Arc::new(file.into_std().await),
            path,
            offset: entry.offset,
            length: entry.length,
            busy: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// How the stream range `offset..offset + length` relates to this file.
    pub fn contains(&self, offset: u64, length: u64) -> Overlap {
        let end = offset + length;
        let file_end = self.offset + self.length;
        if offset >= self.offset && end <= file_end && self.length > 0 {
            Overlap::Full
        } else if offset < file_end && end > self.offset {
            Overlap::Partial
        } else {
            Overlap::None
        }
    }

    pub fn bounds(&self, offset: u64, length: u64) -> Bounds {
        let data_start = self.offset.max(offset);
        let data_end = (self.offset + self.length).min(offset + length);
        Bounds {
            data_offset: (data_start - offset) as usize,
            data_length: data_end.saturating_sub(data_start) as usize,
            file_offset: offset.saturating_sub(self.offset),
        }
    }

    pub(crate) fn try_acquire(&self) -> Option<BusyGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| BusyGuard(&self.busy))
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub async fn read_at(&self, file_offset: u64, len: usize) -> Result<Transfer<Vec<u8>>, StorageError> {
        let Some(_guard) = self.try_acquire() else {
            return Ok(Transfer::Busy);
        };
        let file = Arc::clone(&self.file);
        let result = tokio::task::spawn_blocking(move || {
            let mut buf = vec![0; len];
            file.read_exact_at(&mut buf, file_offset).map(|()| buf)
        })
        .await?;
        result
            .map(Transfer::Done)
            .map_err(|error| self.io_error(error))
    }

    pub async fn write_at(&self, file_offset: u64, data: Bytes) -> Result<Transfer<usize>, StorageError> {
        let Some(_guard) = self.try_acquire() else {
            return Ok(Transfer::Busy);
        };
        let file = Arc::clone(&self.file);
        let len = data.len();
        let result = tokio::task::spawn_blocking(move || file.write_all_at(&data, file_offset)).await?;
        result
            .map(|()| Transfer::Done(len))
            .map_err(|error| self.io_error(error))
    }

    fn io_error(&self, error: std::io::Error) -> StorageError {
        StorageError::Io {
            path: self.path.clone(),
            error,
        }
    }
}

/// All file units of a torrent plus the retry policy for busy units.
#[derive(Debug)]
pub struct Storage {
    units: Vec<FileUnit>,
    retry_delay: Duration,
    retry_limit: u32,
}

impl Storage {
    pub async fn open(
        dir: &Path,
        entries: &[FileEntry],
        retry_delay: Duration,
        retry_limit: u32,
    ) -> Result<Self, StorageError> {
        let mut units = Vec::with_capacity(entries.len());
        for entry in entries {
            units.push(FileUnit::open(dir, entry).await?);
        }
        Ok(Self {
            units,
            retry_delay,
            retry_limit,
        })
    }

    pub fn units(&self) -> &[FileUnit] {
        &self.units
    }

    /// The units overlapping a stream range, in stream order.
    pub fn overlapping(&self, offset: u64, length: u64) -> impl Iterator<Item = (usize, &FileUnit)> {
        self.units
            .iter()
            .enumerate()
            .filter(move |(_, unit)| unit.contains(offset, length) != Overlap::None)
    }

    /// Single attempt to read from one unit; reports busy instead of waiting.
    pub async fn try_read(
        &self,
        unit: usize,
        offset: u64,
        length: u64,
    ) -> Result<Transfer<(Bounds, Vec<u8>)>, StorageError> {
        let unit = &self.units[unit];
        let bounds = unit.bounds(offset, length);
        Ok(match unit.read_at(bounds.file_offset, bounds.data_length).await? {
            Transfer::Done(bytes) => Transfer::Done((bounds, bytes)),
            Transfer::Busy => Transfer::Busy,
        })
    }

    /// Reads a stream range spanning any number of files, waiting out busy units.
    pub async fn read_range(&self, offset: u64, length: u64) -> Result<Bytes, StorageError> {
        let mut buf = BytesMut::zeroed(length as usize);
        for (i, _) in self.overlapping(offset, length) {
            let (bounds, bytes) = self
                .retry(|| self.try_read(i, offset, length))
                .await?;
            buf[bounds.data_offset..bounds.data_offset + bounds.data_length]
                .copy_from_slice(&bytes);
        }
        Ok(buf.freeze())
    }

    /// Writes `data` at stream `offset` into every file it overlaps, waiting out busy units.
    pub async fn write_range(&self, offset: u64, data: Bytes) -> Result<usize, StorageError> {
        let length = data.len() as u64;
        let mut written = 0;
        for (_, unit) in self.overlapping(offset, length) {
            let bounds = unit.bounds(offset, length);
            let part = data.slice(bounds.data_offset..bounds.data_offset + bounds.data_length);
            written += self
                .retry(|| unit.write_at(bounds.file_offset, part.clone()))
                .await?;
        }
        Ok(written)
    }

    async fn retry<T, F, Fut>(&self, mut attempt: F) -> Result<T, StorageError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<Transfer<T>, StorageError>>,
    {
        for _ in 0..=self.retry_limit {
            match attempt().await? {
                Transfer::Done(value) => return Ok(value),
                Transfer::Busy => {
                    trace!("storage busy, retrying");
                    tokio::time::sleep(self.retry_delay).await;
                }
            }
        }
        Err(StorageError::Busy)
    }
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to open the file at the path `{path}` with the error: `{error}`")]
    Open {
        path: PathBuf,
        error: std::io::Error,
    },
    #[error("An error occured when accessing the file `{path}`: `{error}`")]
    Io {
        path: PathBuf,
        error: std::io::Error,
    },
    #[error("The storage stayed busy for too long.")]
    Busy,
    #[error("The blocking storage task failed: `{0}`")]
    Join(#[from] tokio::task::JoinError),
}
