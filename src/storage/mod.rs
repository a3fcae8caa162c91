//! Extent/device storage trees
//!
//! A LUN is backed by a tree of nodes. Leaf extents map a byte range of a
//! backing file, devices combine ordered child nodes as RAID0 (concatenated
//! by cumulative offset) or RAID1 (mirrored).

pub mod build;
pub mod device;
pub mod extent;

use std::io::SeekFrom;
use thiserror::Error;

pub use build::build_tree;
pub use device::{Device, RaidLevel};
pub use extent::Extent;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("offset out of range: {offset} (size: {size})")]
    OutOfRange { offset: u64, size: u64 },

    #[error("short transfer on {node}: expected {expected} bytes, got {actual}")]
    ShortTransfer {
        node: String,
        expected: usize,
        actual: usize,
    },

    #[error("{0} is not open")]
    NotOpen(String),

    #[error("mirror {device}: child {child} failed: {source}")]
    MirrorFailed {
        device: String,
        child: String,
        #[source]
        source: Box<StorageError>,
    },

    #[error("invalid geometry: {0}")]
    Geometry(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Flush strength for `sync_range`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Data only (fdatasync semantics)
    Data,
    /// Data and metadata (fsync semantics)
    File,
}

/// A node of the storage tree: a leaf extent or a composite device.
#[derive(Debug)]
pub enum Node {
    Extent(Extent),
    Device(Device),
}

impl Node {
    pub fn name(&self) -> &str {
        match self {
            Node::Extent(extent) => extent.name(),
            Node::Device(device) => device.name(),
        }
    }

    /// Open every leaf below this node.
    pub fn open(&mut self) -> StorageResult<()> {
        match self {
            Node::Extent(extent) => extent.open(),
            Node::Device(device) => device.open(),
        }
    }

    /// Sync and close every leaf below this node.
    pub fn close(&mut self) {
        match self {
            Node::Extent(extent) => extent.close(),
            Node::Device(device) => device.close(),
        }
    }

    /// Logical size in bytes
    pub fn size(&self) -> u64 {
        match self {
            Node::Extent(extent) => extent.size(),
            Node::Device(device) => device.size(),
        }
    }

    /// Current logical cursor
    pub fn position(&self) -> u64 {
        match self {
            Node::Extent(extent) => extent.position(),
            Node::Device(device) => device.position(),
        }
    }

    pub fn seek(&mut self, pos: SeekFrom) -> StorageResult<u64> {
        match self {
            Node::Extent(extent) => extent.seek(pos),
            Node::Device(device) => device.seek(pos),
        }
    }

    pub fn read(&mut self, buf: &mut [u8]) -> StorageResult<usize> {
        match self {
            Node::Extent(extent) => extent.read(buf),
            Node::Device(device) => device.read(buf),
        }
    }

    pub fn write(&mut self, buf: &[u8]) -> StorageResult<usize> {
        match self {
            Node::Extent(extent) => extent.write(buf),
            Node::Device(device) => device.write(buf),
        }
    }

    /// Flush `len` bytes starting at logical offset `from`.
    pub fn sync_range(&mut self, how: SyncMode, from: u64, len: u64) -> StorageResult<()> {
        match self {
            Node::Extent(extent) => extent.sync_range(how, from, len),
            Node::Device(device) => device.sync_range(how, from, len),
        }
    }

    /// Seek to `offset` and fill `buf` completely.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> StorageResult<()> {
        self.seek(SeekFrom::Start(offset))?;
        let actual = self.read(buf)?;
        if actual != buf.len() {
            return Err(StorageError::ShortTransfer {
                node: self.name().to_string(),
                expected: buf.len(),
                actual,
            });
        }
        Ok(())
    }

    /// Seek to `offset` and write all of `buf`.
    pub fn write_at(&mut self, offset: u64, buf: &[u8]) -> StorageResult<()> {
        self.seek(SeekFrom::Start(offset))?;
        let actual = self.write(buf)?;
        if actual != buf.len() {
            return Err(StorageError::ShortTransfer {
                node: self.name().to_string(),
                expected: buf.len(),
                actual,
            });
        }
        Ok(())
    }
}

/// Resolve a seek request against a cursor and a size.
///
/// The resulting offset must address a byte inside the node.
pub(crate) fn resolve_seek(pos: SeekFrom, current: u64, size: u64) -> StorageResult<u64> {
    let target = match pos {
        SeekFrom::Start(offset) => Some(offset),
        SeekFrom::Current(delta) => current.checked_add_signed(delta),
        SeekFrom::End(delta) => size.checked_add_signed(delta),
    };

    match target {
        Some(offset) if offset < size => Ok(offset),
        Some(offset) => Err(StorageError::OutOfRange { offset, size }),
        None => Err(StorageError::OutOfRange { offset: 0, size }),
    }
}
