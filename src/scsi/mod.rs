//! SCSI command plumbing shared by the disk and OSD engines
//!
//! The session layer hands an engine a [`ScsiCommand`] together with a
//! [`Session`] whose [`DataTransfer`] moves payload bytes to and from the
//! initiator. Engines never return errors to the session layer: every
//! failure ends up as CHECK CONDITION with sense data in the command.

pub mod cdb;
pub mod response;
pub mod sense;
pub mod transfer;

pub use sense::Sense;
pub use transfer::{BufferedTransfer, DataTransfer};

use crate::osd::OsdError;
use crate::storage::StorageError;
use thiserror::Error;

/// Largest data transfer a single command may move (staging buffer size)
pub const MAX_TRANSFER: usize = 1024 * 1024;

/// SCSI status byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ScsiStatus {
    Good = 0x00,
    CheckCondition = 0x02,
}

/// Direction of the data phase, from the initiator's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataDirection {
    None,
    /// Data-In: target to initiator
    Read,
    /// Data-Out: initiator to target
    Write,
}

/// How a handler delivered its Data-In
#[derive(Debug)]
pub enum Reply {
    /// Single-buffer response carried on the command
    Data(Vec<u8>),
    /// Byte count already sent through the session transfer
    Sent(usize),
}

/// A command in flight: request fields in, result fields out
#[derive(Debug, Clone)]
pub struct ScsiCommand {
    /// Command descriptor block
    pub cdb: Vec<u8>,
    /// Addressed logical unit
    pub lun: u64,
    /// Data phase direction
    pub direction: DataDirection,
    /// Data-Out bytes already delivered with the command (immediate data)
    pub immediate_data: Vec<u8>,

    /// Completion status
    pub status: ScsiStatus,
    /// Data-In payload for single-buffer responses
    pub data: Vec<u8>,
    /// Number of Data-In bytes produced (via `data` or the transfer)
    pub length: u32,
    /// Fixed-format sense data when `status` is CHECK CONDITION
    pub sense: Vec<u8>,
}

impl ScsiCommand {
    pub fn new(lun: u64, cdb: &[u8]) -> Self {
        Self {
            cdb: cdb.to_vec(),
            lun,
            direction: DataDirection::None,
            immediate_data: Vec::new(),
            status: ScsiStatus::Good,
            data: Vec::new(),
            length: 0,
            sense: Vec::new(),
        }
    }

    /// Attach Data-Out bytes delivered with the command.
    pub fn with_immediate_data(mut self, data: Vec<u8>) -> Self {
        self.direction = DataDirection::Write;
        self.immediate_data = data;
        self
    }

    pub fn opcode(&self) -> u8 {
        self.cdb.first().copied().unwrap_or(0xff)
    }

    /// Complete with GOOD status and a single-buffer response.
    pub fn complete(&mut self, data: Vec<u8>) -> ScsiStatus {
        if !data.is_empty() {
            self.direction = DataDirection::Read;
        }
        self.length = data.len() as u32;
        self.data = data;
        self.sense.clear();
        self.status = ScsiStatus::Good;
        self.status
    }

    /// Complete with GOOD status after `length` bytes went out via the transfer.
    pub fn complete_transferred(&mut self, length: usize) -> ScsiStatus {
        if length > 0 {
            self.direction = DataDirection::Read;
        }
        self.length = length as u32;
        self.data.clear();
        self.sense.clear();
        self.status = ScsiStatus::Good;
        self.status
    }

    /// Complete with CHECK CONDITION; no data is returned.
    pub fn fail(&mut self, sense: Sense) -> ScsiStatus {
        self.data.clear();
        self.length = 0;
        self.sense = sense.to_bytes();
        self.status = ScsiStatus::CheckCondition;
        self.status
    }

    /// Complete from a handler result, logging failures.
    pub fn finish(&mut self, result: Result<Reply, ScsiError>) -> ScsiStatus {
        match result {
            Ok(Reply::Data(data)) => self.complete(data),
            Ok(Reply::Sent(length)) => self.complete_transferred(length),
            Err(e) => {
                if e.is_io() {
                    log::error!("LUN {} opcode 0x{:02x}: {}", self.lun, self.opcode(), e);
                } else {
                    log::warn!("LUN {} opcode 0x{:02x}: {}", self.lun, self.opcode(), e);
                }
                self.fail(e.sense())
            }
        }
    }

    /// Pull `buf.len()` Data-Out bytes: immediate data first, then the transfer.
    pub fn receive(
        &self,
        transfer: &mut dyn DataTransfer,
        buf: &mut [u8],
    ) -> Result<(), ScsiError> {
        let immediate = self.immediate_data.len().min(buf.len());
        buf[..immediate].copy_from_slice(&self.immediate_data[..immediate]);
        if immediate < buf.len() {
            transfer.receive(&mut buf[immediate..])?;
        }
        Ok(())
    }
}

/// The per-connection context an engine executes commands under
pub struct Session<'a> {
    /// Session identifier, for logging
    pub id: u64,
    /// Initiator IQN
    pub initiator: String,
    /// Moves Data-Out/Data-In bytes
    pub transfer: &'a mut dyn DataTransfer,
}

impl<'a> Session<'a> {
    pub fn new(id: u64, initiator: &str, transfer: &'a mut dyn DataTransfer) -> Self {
        Self {
            id,
            initiator: initiator.to_string(),
            transfer,
        }
    }
}

/// Command-level failures, each mapped to sense data
#[derive(Debug, Error)]
pub enum ScsiError {
    #[error("unsupported opcode 0x{0:02x}")]
    UnsupportedOpcode(u8),

    #[error("CDB too short: expected {expected} bytes, got {actual}")]
    CdbTooShort { expected: usize, actual: usize },

    #[error("invalid field in CDB: {0}")]
    InvalidField(String),

    #[error("LUN {0} not supported")]
    LunNotSupported(u64),

    #[error("mode page control {0:02b} not supported")]
    PageControlUnsupported(u8),

    #[error("LBA out of range: {lba} + {blocks} > {capacity}")]
    LbaOutOfRange { lba: u64, blocks: u64, capacity: u64 },

    #[error("transfer of {0} bytes exceeds the {max} byte limit", max = MAX_TRANSFER)]
    TransferTooLarge(u64),

    #[error("parameter list error: {0}")]
    ParameterList(String),

    #[error("no free reservation key slots")]
    RegistrationsFull,

    #[error("logical unit not ready")]
    NotReady,

    #[error("read failed: {0}")]
    Read(#[source] StorageError),

    #[error("write failed: {0}")]
    Write(#[source] StorageError),

    #[error("cache sync failed: {0}")]
    Sync(#[source] StorageError),

    #[error("data transfer failed: {0}")]
    Transfer(#[from] std::io::Error),

    #[error("object storage: {0}")]
    Osd(#[from] OsdError),
}

impl ScsiError {
    /// Sense data reported for this failure
    pub fn sense(&self) -> Sense {
        match self {
            ScsiError::UnsupportedOpcode(_) => Sense::INVALID_OPCODE,
            ScsiError::CdbTooShort { .. } | ScsiError::InvalidField(_) => Sense::INVALID_FIELD,
            ScsiError::LunNotSupported(_) | ScsiError::PageControlUnsupported(_) => {
                Sense::LUN_NOT_SUPPORTED
            }
            ScsiError::LbaOutOfRange { .. } => Sense::LBA_OUT_OF_RANGE,
            ScsiError::TransferTooLarge(_) => Sense::INVALID_FIELD,
            ScsiError::ParameterList(_) => Sense::PARAMETER_LIST_LENGTH,
            ScsiError::RegistrationsFull => Sense::INSUFFICIENT_REGISTRATION_RESOURCES,
            ScsiError::NotReady => Sense::NOT_READY,
            ScsiError::Read(_) => Sense::UNRECOVERED_READ_ERROR,
            ScsiError::Write(_) | ScsiError::Sync(_) => Sense::WRITE_ERROR,
            ScsiError::Transfer(_) => Sense::INTERNAL_TARGET_FAILURE,
            ScsiError::Osd(e) => e.sense(),
        }
    }

    /// Whether this is a backing-store failure rather than a bad request
    pub fn is_io(&self) -> bool {
        match self {
            ScsiError::Read(_)
            | ScsiError::Write(_)
            | ScsiError::Sync(_)
            | ScsiError::Transfer(_) => true,
            ScsiError::Osd(e) => e.is_io(),
            _ => false,
        }
    }
}

/// A SCSI logical unit provider (block disk or OSD)
pub trait ScsiDevice: Send + Sync {
    /// Execute one command to completion, filling in the result fields.
    fn execute(&self, session: &mut Session<'_>, cmd: &mut ScsiCommand) -> ScsiStatus;

    /// Number of configured LUNs
    fn lun_count(&self) -> u32;

    /// Flush and release backing storage.
    fn shutdown(&self) -> Result<(), StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fail_sets_sense() {
        let mut cmd = ScsiCommand::new(0, &[0xff]);
        let status = cmd.fail(Sense::INVALID_OPCODE);
        assert_eq!(status, ScsiStatus::CheckCondition);
        assert_eq!(cmd.sense.len(), 18);
        assert_eq!(cmd.sense[2], 0x05);
        assert_eq!(cmd.sense[12], 0x20);
        assert_eq!(cmd.length, 0);
    }

    #[test]
    fn test_complete_sets_length() {
        let mut cmd = ScsiCommand::new(0, &[0x12]);
        cmd.complete(vec![1, 2, 3]);
        assert_eq!(cmd.status, ScsiStatus::Good);
        assert_eq!(cmd.length, 3);
        assert_eq!(cmd.direction, DataDirection::Read);
    }

    #[test]
    fn test_finish_logs_and_fails() {
        let mut cmd = ScsiCommand::new(3, &[0x28]);
        let status = cmd.finish(Err(ScsiError::LunNotSupported(3)));
        assert_eq!(status, ScsiStatus::CheckCondition);
        assert_eq!(cmd.sense[12], 0x25);

        let status = cmd.finish(Ok(Reply::Sent(512)));
        assert_eq!(status, ScsiStatus::Good);
        assert_eq!(cmd.length, 512);
        assert!(cmd.sense.is_empty());
    }

    #[test]
    fn test_receive_uses_immediate_data_first() {
        let cmd = ScsiCommand::new(0, &[0x2a]).with_immediate_data(vec![1, 2]);
        let mut transfer = BufferedTransfer::new(vec![3, 4, 5]);
        let mut buf = [0u8; 4];
        cmd.receive(&mut transfer, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn test_error_sense_mapping() {
        assert_eq!(
            ScsiError::LbaOutOfRange { lba: 1, blocks: 2, capacity: 2 }.sense(),
            Sense::LBA_OUT_OF_RANGE
        );
        assert_eq!(ScsiError::UnsupportedOpcode(0xee).sense(), Sense::INVALID_OPCODE);
        assert!(ScsiError::Read(StorageError::NotOpen("x".into())).is_io());
        assert!(!ScsiError::NotReady.is_io());
    }
}
