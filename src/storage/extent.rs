//! Extent: the leaf of a storage tree
//!
//! An extent is a byte range of a regular file. Logical offset 0 of the
//! extent sits at `sacred` bytes into the file.

use super::{resolve_seek, StorageError, StorageResult, SyncMode};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// File-backed extent
#[derive(Debug)]
pub struct Extent {
    name: String,
    path: PathBuf,
    /// File offset of logical byte 0
    sacred: u64,
    len: u64,
    /// Logical cursor
    off: u64,
    file: Option<File>,
}

impl Extent {
    pub fn new<P: AsRef<Path>>(name: &str, path: P, sacred: u64, len: u64) -> Self {
        Self {
            name: name.to_string(),
            path: path.as_ref().to_path_buf(),
            sacred,
            len,
            off: 0,
            file: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.len
    }

    pub fn position(&self) -> u64 {
        self.off
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Open (creating if needed) the backing file.
    ///
    /// The file is extended so that the whole extent is addressable.
    pub fn open(&mut self) -> StorageResult<()> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;

        let required = self.sacred.checked_add(self.len).ok_or_else(|| {
            StorageError::Geometry(format!(
                "extent {}: offset {} + size {} overflows",
                self.name, self.sacred, self.len
            ))
        })?;
        if file.metadata()?.len() < required {
            file.set_len(required)?;
        }

        log::debug!(
            "Opened extent {} ({:?} @ {}, {} bytes)",
            self.name,
            self.path,
            self.sacred,
            self.len
        );
        self.file = Some(file);
        self.off = 0;
        Ok(())
    }

    pub fn close(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = file.sync_all() {
                log::warn!("Failed to sync extent {} on close: {}", self.name, e);
            }
        }
    }

    pub fn seek(&mut self, pos: SeekFrom) -> StorageResult<u64> {
        let offset = resolve_seek(pos, self.off, self.len)?;
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| StorageError::NotOpen(self.name.clone()))?;
        file.seek(SeekFrom::Start(self.sacred + offset))?;
        self.off = offset;
        Ok(offset)
    }

    /// Read from the cursor, never past the end of the extent.
    pub fn read(&mut self, buf: &mut [u8]) -> StorageResult<usize> {
        let n = self.clamp(buf.len())?;
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| StorageError::NotOpen(self.name.clone()))?;
        file.seek(SeekFrom::Start(self.sacred + self.off))?;
        file.read_exact(&mut buf[..n])?;
        self.off += n as u64;
        Ok(n)
    }

    /// Write at the cursor, never past the end of the extent.
    pub fn write(&mut self, buf: &[u8]) -> StorageResult<usize> {
        let n = self.clamp(buf.len())?;
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| StorageError::NotOpen(self.name.clone()))?;
        file.seek(SeekFrom::Start(self.sacred + self.off))?;
        file.write_all(&buf[..n])?;
        self.off += n as u64;
        Ok(n)
    }

    pub fn sync_range(&mut self, how: SyncMode, from: u64, len: u64) -> StorageResult<()> {
        match from.checked_add(len) {
            Some(end) if end <= self.len => {}
            _ => {
                return Err(StorageError::OutOfRange {
                    offset: from,
                    size: self.len,
                })
            }
        }
        let file = self
            .file
            .as_ref()
            .ok_or_else(|| StorageError::NotOpen(self.name.clone()))?;
        flush_range(file, how, self.sacred + from, len)?;
        Ok(())
    }

    /// Bytes that can move from the cursor for a request of `requested` bytes.
    fn clamp(&self, requested: usize) -> StorageResult<usize> {
        if requested == 0 {
            return Ok(0);
        }
        if self.off >= self.len {
            return Err(StorageError::OutOfRange {
                offset: self.off,
                size: self.len,
            });
        }
        Ok((self.len - self.off).min(requested as u64) as usize)
    }
}

#[cfg(target_os = "linux")]
fn flush_range(file: &File, how: SyncMode, offset: u64, len: u64) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    if how == SyncMode::Data {
        let flags = libc::SYNC_FILE_RANGE_WAIT_BEFORE
            | libc::SYNC_FILE_RANGE_WRITE
            | libc::SYNC_FILE_RANGE_WAIT_AFTER;
        // SAFETY: the descriptor stays owned by `file` for the whole call.
        let rc = unsafe {
            libc::sync_file_range(file.as_raw_fd(), offset as _, len as _, flags)
        };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ENOSYS) | Some(libc::EINVAL) | Some(libc::ESPIPE) => {
                log::debug!("sync_file_range unsupported ({}), using fdatasync", err);
            }
            _ => return Err(err),
        }
    }
    full_sync(file, how)
}

#[cfg(not(target_os = "linux"))]
fn flush_range(file: &File, how: SyncMode, _offset: u64, _len: u64) -> io::Result<()> {
    full_sync(file, how)
}

fn full_sync(file: &File, how: SyncMode) -> io::Result<()> {
    match how {
        SyncMode::Data => file.sync_data(),
        SyncMode::File => file.sync_all(),
    }
}
