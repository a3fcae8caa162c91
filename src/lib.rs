//! iSCSI target storage emulation
//!
//! This crate implements the storage side of an iSCSI target: LUNs backed by
//! trees of file extents combined as RAID0 (concatenation) or RAID1
//! (mirroring), a SCSI block command engine serving them, and an
//! object-based storage (OSD) engine keeping objects as files. The session
//! layer hands commands to a [`Target`] and moves payload bytes through a
//! [`DataTransfer`] callback.

pub mod config;
pub mod disk;
pub mod osd;
pub mod scsi;
pub mod storage;
pub mod target;

pub use config::Config;
pub use scsi::{DataTransfer, ScsiCommand, ScsiError, ScsiStatus, Session};
pub use storage::StorageError;
pub use target::{InitError, Target};
