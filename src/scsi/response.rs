//! Response blocks common to every device type

use super::cdb::{copy_padded, read_u16, read_u32, require, truncate_to};
use super::ScsiError;

/// Peripheral device types
pub mod device_type {
    pub const DIRECT_ACCESS: u8 = 0x00;
    pub const OSD: u8 = 0x11;
    /// Peripheral qualifier 011b + type 1Fh: no device at this LUN
    pub const NOT_PRESENT: u8 = 0x7f;
}

/// Length of the standard INQUIRY response
pub const STANDARD_INQUIRY_LEN: usize = 36;

/// Product strings reported by INQUIRY
#[derive(Debug, Clone)]
pub struct Identity {
    /// Vendor identification (8 chars)
    pub vendor: String,
    /// Product identification (16 chars)
    pub product: String,
    /// Product revision (4 chars)
    pub revision: String,
}

impl Identity {
    pub fn new(vendor: &str, product: &str, revision: &str) -> Self {
        Self {
            vendor: vendor.to_string(),
            product: product.to_string(),
            revision: revision.to_string(),
        }
    }
}

/// Build the standard INQUIRY data for a peripheral byte.
pub fn standard_inquiry(peripheral: u8, identity: &Identity) -> Vec<u8> {
    let mut response = vec![0u8; STANDARD_INQUIRY_LEN];
    response[0] = peripheral;
    response[1] = 0x00; // Removable: no
    response[2] = 0x05; // Version: SPC-3
    response[3] = 0x02; // Response data format: 2
    response[4] = (STANDARD_INQUIRY_LEN - 5) as u8; // Additional length
    response[7] = 0x02; // CmdQue

    copy_padded(&mut response[8..16], &identity.vendor);
    copy_padded(&mut response[16..32], &identity.product);
    copy_padded(&mut response[32..36], &identity.revision);

    response
}

/// INQUIRY allocation length (bytes 3-4)
pub fn inquiry_allocation_length(cdb: &[u8]) -> Result<usize, ScsiError> {
    require(cdb, 6)?;
    Ok(read_u16(cdb, 3) as usize)
}

/// INQUIRY for a LUN that does not exist: GOOD status, "no device" block.
/// Such a LUN has no VPD pages.
pub fn missing_lun_inquiry(cdb: &[u8], identity: &Identity) -> Result<Vec<u8>, ScsiError> {
    let allocation_length = inquiry_allocation_length(cdb)?;
    if cdb[1] & 0x01 != 0 {
        return Err(ScsiError::InvalidField("EVPD on absent LUN".to_string()));
    }
    let response = standard_inquiry(device_type::NOT_PRESENT, identity);
    Ok(truncate_to(response, allocation_length))
}

/// REPORT LUNS: list length, 4 reserved bytes, one 8-byte LUN per entry.
pub fn report_luns(cdb: &[u8], luns: u32) -> Result<Vec<u8>, ScsiError> {
    require(cdb, 12)?;
    let allocation_length = read_u32(cdb, 6) as usize;

    let list_length = luns * 8;
    let mut response = Vec::with_capacity(8 + list_length as usize);
    response.extend_from_slice(&list_length.to_be_bytes());
    response.extend_from_slice(&[0u8; 4]);
    for lun in 0..luns {
        response.extend_from_slice(&u64::from(lun).to_be_bytes());
    }

    Ok(truncate_to(response, allocation_length))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scsi::cdb::opcodes;

    fn identity() -> Identity {
        Identity::new("VoE", "Virtual Disk", "1.0")
    }

    #[test]
    fn test_standard_inquiry_layout() {
        let data = standard_inquiry(device_type::DIRECT_ACCESS, &identity());
        assert_eq!(data.len(), 36);
        assert_eq!(data[0], 0x00);
        assert_eq!(data[4], 31);
        assert_eq!(&data[8..16], b"VoE     ");
        assert_eq!(&data[16..32], b"Virtual Disk    ");
        assert_eq!(&data[32..36], b"1.0 ");
    }

    #[test]
    fn test_missing_lun_inquiry() {
        let cdb = [opcodes::INQUIRY, 0, 0, 0, 36, 0];
        let data = missing_lun_inquiry(&cdb, &identity()).unwrap();
        assert_eq!(data.len(), 36);
        assert_eq!(data[0], 0x7f);

        let evpd = [opcodes::INQUIRY, 1, 0x80, 0, 36, 0];
        assert!(matches!(
            missing_lun_inquiry(&evpd, &identity()),
            Err(ScsiError::InvalidField(_))
        ));
    }

    #[test]
    fn test_report_luns() {
        let mut cdb = [0u8; 12];
        cdb[0] = opcodes::REPORT_LUNS;
        cdb[6..10].copy_from_slice(&4096u32.to_be_bytes());

        let data = report_luns(&cdb, 3).unwrap();
        assert_eq!(data.len(), 8 + 3 * 8);
        assert_eq!(u32::from_be_bytes([data[0], data[1], data[2], data[3]]), 24);
        for lun in 0..3u64 {
            let at = 8 + lun as usize * 8;
            let mut entry = [0u8; 8];
            entry.copy_from_slice(&data[at..at + 8]);
            assert_eq!(u64::from_be_bytes(entry), lun);
        }
    }

    #[test]
    fn test_report_luns_truncated() {
        let mut cdb = [0u8; 12];
        cdb[0] = opcodes::REPORT_LUNS;
        cdb[9] = 16;
        let data = report_luns(&cdb, 4).unwrap();
        assert_eq!(data.len(), 16);
        assert_eq!(data[3], 32);
    }
}
