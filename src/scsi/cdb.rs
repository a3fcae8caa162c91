//! CDB opcodes and field decoding
//!
//! All multi-byte CDB fields are big-endian by definition, whatever the
//! host byte order.

use super::ScsiError;
use byteorder::{BigEndian, ByteOrder};

/// SCSI opcodes
pub mod opcodes {
    pub const TEST_UNIT_READY: u8 = 0x00;
    pub const READ_6: u8 = 0x08;
    pub const WRITE_6: u8 = 0x0a;
    pub const INQUIRY: u8 = 0x12;
    pub const RESERVE_6: u8 = 0x16;
    pub const RELEASE_6: u8 = 0x17;
    pub const MODE_SENSE_6: u8 = 0x1a;
    pub const READ_CAPACITY_10: u8 = 0x25;
    pub const READ_10: u8 = 0x28;
    pub const WRITE_10: u8 = 0x2a;
    pub const WRITE_VERIFY: u8 = 0x2e;
    pub const SYNC_CACHE: u8 = 0x35;
    pub const RESERVE_10: u8 = 0x56;
    pub const RELEASE_10: u8 = 0x57;
    pub const MODE_SENSE_10: u8 = 0x5a;
    pub const PERSISTENT_RESERVE_IN: u8 = 0x5e;
    pub const PERSISTENT_RESERVE_OUT: u8 = 0x5f;
    pub const OSD_COMMAND: u8 = 0x7f;
    pub const READ_16: u8 = 0x88;
    pub const WRITE_16: u8 = 0x8a;
    pub const SERVICE_ACTION_IN_16: u8 = 0x9e; // Service action 0x10: READ CAPACITY (16)
    pub const REPORT_LUNS: u8 = 0xa0;
}

/// Fail unless the CDB holds at least `len` bytes.
pub fn require(cdb: &[u8], len: usize) -> Result<(), ScsiError> {
    if cdb.len() < len {
        return Err(ScsiError::CdbTooShort {
            expected: len,
            actual: cdb.len(),
        });
    }
    Ok(())
}

pub fn read_u16(cdb: &[u8], at: usize) -> u16 {
    BigEndian::read_u16(&cdb[at..at + 2])
}

pub fn read_u24(cdb: &[u8], at: usize) -> u32 {
    BigEndian::read_u24(&cdb[at..at + 3])
}

pub fn read_u32(cdb: &[u8], at: usize) -> u32 {
    BigEndian::read_u32(&cdb[at..at + 4])
}

pub fn read_u64(cdb: &[u8], at: usize) -> u64 {
    BigEndian::read_u64(&cdb[at..at + 8])
}

/// Starting LBA and block count of a READ/WRITE command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRange {
    pub lba: u64,
    pub blocks: u32,
}

/// Parse the LBA and transfer length of a READ/WRITE/WRITE AND VERIFY CDB.
pub fn parse_read_write(cdb: &[u8]) -> Result<BlockRange, ScsiError> {
    require(cdb, 1)?;

    match cdb[0] {
        opcodes::READ_6 | opcodes::WRITE_6 => {
            require(cdb, 6)?;
            // 21-bit LBA; a length of 0 means 256 blocks
            let lba = u64::from(read_u24(cdb, 1) & 0x001f_ffff);
            let blocks = if cdb[4] == 0 { 256 } else { u32::from(cdb[4]) };
            Ok(BlockRange { lba, blocks })
        }
        opcodes::READ_10 | opcodes::WRITE_10 | opcodes::WRITE_VERIFY => {
            require(cdb, 10)?;
            let lba = u64::from(read_u32(cdb, 2));
            let blocks = u32::from(read_u16(cdb, 7));
            Ok(BlockRange { lba, blocks })
        }
        opcodes::READ_16 | opcodes::WRITE_16 => {
            require(cdb, 16)?;
            let lba = read_u64(cdb, 2);
            let blocks = read_u32(cdb, 10);
            Ok(BlockRange { lba, blocks })
        }
        opcode => Err(ScsiError::UnsupportedOpcode(opcode)),
    }
}

/// Copy `src` into `dest`, truncating or padding with spaces.
pub fn copy_padded(dest: &mut [u8], src: &str) {
    let bytes = src.as_bytes();
    let n = bytes.len().min(dest.len());
    dest[..n].copy_from_slice(&bytes[..n]);
    dest[n..].fill(b' ');
}

/// Cut a response down to the initiator's allocation length.
pub fn truncate_to(mut data: Vec<u8>, allocation_length: usize) -> Vec<u8> {
    data.truncate(allocation_length);
    data
}
