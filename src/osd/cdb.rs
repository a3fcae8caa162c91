//! OSD variable-length CDB
//!
//! Layout of the 200-byte extended CDB, all fields big-endian:
//!
//! ```text
//!  0      opcode 7Fh          36..44  length
//!  7      additional length   44..52  offset
//!  8..10  service action      52..64  get attribute page/index/alloc length
//! 12..16  GroupID             64..76  set attribute page/index/length
//! 16..24  UserID
//! ```

use crate::scsi::cdb::{opcodes, read_u16, read_u32, read_u64, require};
use crate::scsi::ScsiError;
use byteorder::{BigEndian, ByteOrder};

/// Total length of an OSD CDB
pub const OSD_CDB_LEN: usize = 200;

/// Additional CDB length for a 200-byte CDB
pub const ADDITIONAL_CDB_LENGTH: u8 = 0xc0;

/// Attribute list entry header: page, index, value length
pub const ATTRIBUTE_ENTRY_HEADER: usize = 10;

/// OSD service actions
pub mod service_action {
    pub const CREATE: u16 = 0x8802;
    pub const READ: u16 = 0x8805;
    pub const WRITE: u16 = 0x8806;
    pub const REMOVE: u16 = 0x880a;
    pub const CREATE_GROUP: u16 = 0x880b;
    pub const REMOVE_GROUP: u16 = 0x880c;
    pub const GET_ATTR: u16 = 0x880e;
    pub const SET_ATTR: u16 = 0x880f;
}

mod offset {
    pub const ADDITIONAL_LENGTH: usize = 7;
    pub const SERVICE_ACTION: usize = 8;
    pub const GROUP_ID: usize = 12;
    pub const USER_ID: usize = 16;
    pub const LENGTH: usize = 36;
    pub const OFFSET: usize = 44;
    pub const GET_PAGE: usize = 52;
    pub const GET_INDEX: usize = 56;
    pub const GET_LENGTH: usize = 60;
    pub const SET_PAGE: usize = 64;
    pub const SET_INDEX: usize = 68;
    pub const SET_LENGTH: usize = 72;
}

/// An attribute addressed by page and index, with a byte length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeRef {
    pub page: u32,
    pub index: u32,
    /// Allocation length (get) or value length (set)
    pub length: u32,
}

/// Decoded OSD command
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OsdCdb {
    pub action: u16,
    pub group_id: u32,
    pub user_id: u64,
    pub length: u64,
    pub offset: u64,
    /// Attribute to return after any READ data
    pub get: Option<AttributeRef>,
    /// Attribute whose value follows any WRITE data
    pub set: Option<AttributeRef>,
}

impl OsdCdb {
    pub fn new(action: u16) -> Self {
        Self {
            action,
            ..Default::default()
        }
    }

    pub fn parse(cdb: &[u8]) -> Result<Self, ScsiError> {
        require(cdb, OSD_CDB_LEN)?;
        if cdb[0] != opcodes::OSD_COMMAND {
            return Err(ScsiError::UnsupportedOpcode(cdb[0]));
        }
        if cdb[offset::ADDITIONAL_LENGTH] != ADDITIONAL_CDB_LENGTH {
            return Err(ScsiError::InvalidField(format!(
                "additional CDB length 0x{:02x}",
                cdb[offset::ADDITIONAL_LENGTH]
            )));
        }

        let attribute = |page_at: usize, index_at: usize, length_at: usize| {
            let page = read_u32(cdb, page_at);
            (page != 0).then(|| AttributeRef {
                page,
                index: read_u32(cdb, index_at),
                length: read_u32(cdb, length_at),
            })
        };

        Ok(Self {
            action: read_u16(cdb, offset::SERVICE_ACTION),
            group_id: read_u32(cdb, offset::GROUP_ID),
            user_id: read_u64(cdb, offset::USER_ID),
            length: read_u64(cdb, offset::LENGTH),
            offset: read_u64(cdb, offset::OFFSET),
            get: attribute(offset::GET_PAGE, offset::GET_INDEX, offset::GET_LENGTH),
            set: attribute(offset::SET_PAGE, offset::SET_INDEX, offset::SET_LENGTH),
        })
    }

    /// Encode as a 200-byte CDB, for initiators and tests.
    pub fn encode(&self) -> Vec<u8> {
        let mut cdb = vec![0u8; OSD_CDB_LEN];
        cdb[0] = opcodes::OSD_COMMAND;
        cdb[offset::ADDITIONAL_LENGTH] = ADDITIONAL_CDB_LENGTH;
        BigEndian::write_u16(&mut cdb[offset::SERVICE_ACTION..], self.action);
        BigEndian::write_u32(&mut cdb[offset::GROUP_ID..], self.group_id);
        BigEndian::write_u64(&mut cdb[offset::USER_ID..], self.user_id);
        BigEndian::write_u64(&mut cdb[offset::LENGTH..], self.length);
        BigEndian::write_u64(&mut cdb[offset::OFFSET..], self.offset);
        if let Some(get) = self.get {
            BigEndian::write_u32(&mut cdb[offset::GET_PAGE..], get.page);
            BigEndian::write_u32(&mut cdb[offset::GET_INDEX..], get.index);
            BigEndian::write_u32(&mut cdb[offset::GET_LENGTH..], get.length);
        }
        if let Some(set) = self.set {
            BigEndian::write_u32(&mut cdb[offset::SET_PAGE..], set.page);
            BigEndian::write_u32(&mut cdb[offset::SET_INDEX..], set.index);
            BigEndian::write_u32(&mut cdb[offset::SET_LENGTH..], set.length);
        }
        cdb
    }
}

/// `[page u32][index u32][len u16][value]`
pub fn attribute_entry(page: u32, index: u32, value: &[u8]) -> Vec<u8> {
    let mut entry = Vec::with_capacity(ATTRIBUTE_ENTRY_HEADER + value.len());
    entry.extend_from_slice(&page.to_be_bytes());
    entry.extend_from_slice(&index.to_be_bytes());
    entry.extend_from_slice(&(value.len() as u16).to_be_bytes());
    entry.extend_from_slice(value);
    entry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_field_offsets() {
        let mut cdb = vec![0u8; OSD_CDB_LEN];
        cdb[0] = 0x7f;
        cdb[7] = 0xc0;
        cdb[8..10].copy_from_slice(&[0x88, 0x05]);
        cdb[12..16].copy_from_slice(&0x1234_5678u32.to_be_bytes());
        cdb[16..24].copy_from_slice(&0x9abcu64.to_be_bytes());
        cdb[36..44].copy_from_slice(&4096u64.to_be_bytes());
        cdb[44..52].copy_from_slice(&512u64.to_be_bytes());
        cdb[52..56].copy_from_slice(&1u32.to_be_bytes());
        cdb[56..60].copy_from_slice(&2u32.to_be_bytes());
        cdb[60..64].copy_from_slice(&18u32.to_be_bytes());

        let osd = OsdCdb::parse(&cdb).unwrap();
        assert_eq!(osd.action, service_action::READ);
        assert_eq!(osd.group_id, 0x1234_5678);
        assert_eq!(osd.user_id, 0x9abc);
        assert_eq!(osd.length, 4096);
        assert_eq!(osd.offset, 512);
        assert_eq!(
            osd.get,
            Some(AttributeRef {
                page: 1,
                index: 2,
                length: 18
            })
        );
        assert_eq!(osd.set, None);
        assert_eq!(osd.encode(), cdb);
    }

    #[test]
    fn test_parse_rejects_bad_length() {
        let mut cdb = OsdCdb::new(service_action::CREATE).encode();
        cdb[7] = 0x10;
        assert!(matches!(OsdCdb::parse(&cdb), Err(ScsiError::InvalidField(_))));
        assert!(matches!(
            OsdCdb::parse(&cdb[..100]),
            Err(ScsiError::CdbTooShort { .. })
        ));
    }

    #[test]
    fn test_attribute_entry() {
        let entry = attribute_entry(0x4000_0001, 1, &[0, 0, 0, 7]);
        assert_eq!(
            entry,
            [0x40, 0, 0, 1, 0, 0, 0, 1, 0, 4, 0, 0, 0, 7]
        );
    }
}
