//! Fixed-format sense data

/// Sense keys
pub mod sense_key {
    pub const NOT_READY: u8 = 0x02;
    pub const MEDIUM_ERROR: u8 = 0x03;
    pub const HARDWARE_ERROR: u8 = 0x04;
    pub const ILLEGAL_REQUEST: u8 = 0x05;
    pub const DATA_PROTECT: u8 = 0x07;
}

/// Sense key plus additional sense code/qualifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sense {
    pub key: u8,
    pub asc: u8,
    pub ascq: u8,
}

impl Sense {
    /// Length of fixed-format sense data
    pub const LEN: usize = 18;

    pub const NOT_READY: Sense = Sense::new(sense_key::NOT_READY, 0x04, 0x00);
    pub const WRITE_ERROR: Sense = Sense::new(sense_key::MEDIUM_ERROR, 0x0c, 0x00);
    pub const UNRECOVERED_READ_ERROR: Sense = Sense::new(sense_key::MEDIUM_ERROR, 0x11, 0x00);
    pub const PARAMETER_LIST_LENGTH: Sense = Sense::new(sense_key::ILLEGAL_REQUEST, 0x1a, 0x00);
    pub const INVALID_OPCODE: Sense = Sense::new(sense_key::ILLEGAL_REQUEST, 0x20, 0x00);
    pub const LBA_OUT_OF_RANGE: Sense = Sense::new(sense_key::ILLEGAL_REQUEST, 0x21, 0x00);
    pub const INVALID_FIELD: Sense = Sense::new(sense_key::ILLEGAL_REQUEST, 0x24, 0x00);
    pub const LUN_NOT_SUPPORTED: Sense = Sense::new(sense_key::ILLEGAL_REQUEST, 0x25, 0x00);
    pub const INTERNAL_TARGET_FAILURE: Sense = Sense::new(sense_key::HARDWARE_ERROR, 0x44, 0x00);
    pub const INSUFFICIENT_RESOURCES: Sense = Sense::new(sense_key::ILLEGAL_REQUEST, 0x55, 0x03);
    pub const INSUFFICIENT_REGISTRATION_RESOURCES: Sense =
        Sense::new(sense_key::ILLEGAL_REQUEST, 0x55, 0x04);
    pub const QUOTA_ERROR: Sense = Sense::new(sense_key::DATA_PROTECT, 0x55, 0x07);

    pub const fn new(key: u8, asc: u8, ascq: u8) -> Self {
        Self { key, asc, ascq }
    }

    /// Encode as 18-byte fixed-format sense data (response code 70h).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = vec![0u8; Self::LEN];
        data[0] = 0x70; // Current error, fixed format
        data[2] = self.key & 0x0f;
        data[7] = (Self::LEN - 8) as u8; // Additional sense length
        data[12] = self.asc;
        data[13] = self.ascq;
        data
    }
}
