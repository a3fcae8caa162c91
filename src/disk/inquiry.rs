//! INQUIRY and vital product data pages

use crate::scsi::cdb::{copy_padded, truncate_to};
use crate::scsi::response::{device_type, inquiry_allocation_length, standard_inquiry, Identity};
use crate::scsi::ScsiError;
use uuid::Uuid;

/// VPD page codes
pub mod vpd_page {
    pub const SUPPORTED_PAGES: u8 = 0x00;
    pub const UNIT_SERIAL_NUMBER: u8 = 0x80;
    pub const DEVICE_IDENTIFICATION: u8 = 0x83;
    pub const EXTENDED_INQUIRY_DATA: u8 = 0x86;
}

const PROTOCOL_ISCSI: u8 = 0x05;
const CODESET_ASCII: u8 = 0x02;
const CODESET_UTF8: u8 = 0x03;
const PIV: u8 = 0x80;

const ASSOCIATION_LOGICAL_UNIT: u8 = 0x00;
const ASSOCIATION_TARGET_PORT: u8 = 0x01;
const ASSOCIATION_TARGET_DEVICE: u8 = 0x02;

const DESIGNATOR_T10_VENDOR_ID: u8 = 0x01;
const DESIGNATOR_SCSI_NAME: u8 = 0x08;

const EXTENDED_INQUIRY_LEN: usize = 64;

/// What a LUN reports about itself
pub struct LunIdentity<'a> {
    pub iqn: &'a str,
    pub lun: u64,
    pub uuid: &'a Uuid,
    pub product: &'a Identity,
}

/// Handle INQUIRY, plain or EVPD.
pub fn inquiry(cdb: &[u8], id: &LunIdentity<'_>) -> Result<Vec<u8>, ScsiError> {
    let allocation_length = inquiry_allocation_length(cdb)?;
    let evpd = cdb[1] & 0x01 != 0;
    let page_code = cdb[2];

    let response = if !evpd {
        if page_code != 0 {
            return Err(ScsiError::InvalidField(format!(
                "page code 0x{:02x} without EVPD",
                page_code
            )));
        }
        standard_inquiry(device_type::DIRECT_ACCESS, id.product)
    } else {
        match page_code {
            vpd_page::SUPPORTED_PAGES => vpd(
                vpd_page::SUPPORTED_PAGES,
                &[
                    vpd_page::SUPPORTED_PAGES,
                    vpd_page::UNIT_SERIAL_NUMBER,
                    vpd_page::DEVICE_IDENTIFICATION,
                    vpd_page::EXTENDED_INQUIRY_DATA,
                ],
            ),
            vpd_page::UNIT_SERIAL_NUMBER => vpd(
                vpd_page::UNIT_SERIAL_NUMBER,
                id.uuid.simple().to_string().as_bytes(),
            ),
            vpd_page::DEVICE_IDENTIFICATION => {
                vpd(vpd_page::DEVICE_IDENTIFICATION, &device_identification(id))
            }
            vpd_page::EXTENDED_INQUIRY_DATA => extended_inquiry_data(),
            other => {
                return Err(ScsiError::InvalidField(format!("VPD page 0x{:02x}", other)));
            }
        }
    };

    Ok(truncate_to(response, allocation_length))
}

/// Wrap a VPD payload with its 4-byte page header.
fn vpd(page_code: u8, payload: &[u8]) -> Vec<u8> {
    let mut page = Vec::with_capacity(4 + payload.len());
    page.push(device_type::DIRECT_ACCESS);
    page.push(page_code);
    page.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    page.extend_from_slice(payload);
    page
}

/// Designation descriptors: target name, target port name, LU name, T10 ID.
fn device_identification(id: &LunIdentity<'_>) -> Vec<u8> {
    let mut descriptors = Vec::new();

    designator(
        &mut descriptors,
        CODESET_UTF8,
        ASSOCIATION_TARGET_DEVICE,
        DESIGNATOR_SCSI_NAME,
        &scsi_name(id.iqn),
    );
    designator(
        &mut descriptors,
        CODESET_UTF8,
        ASSOCIATION_TARGET_PORT,
        DESIGNATOR_SCSI_NAME,
        &scsi_name(&format!("{},t,{:#x}", id.iqn, id.lun)),
    );
    designator(
        &mut descriptors,
        CODESET_UTF8,
        ASSOCIATION_LOGICAL_UNIT,
        DESIGNATOR_SCSI_NAME,
        &scsi_name(&format!("{},L,{:#x},{}", id.iqn, id.lun, id.uuid.simple())),
    );

    let mut t10 = vec![0u8; 8];
    copy_padded(&mut t10, &id.product.vendor);
    t10.extend_from_slice(id.uuid.hyphenated().to_string().as_bytes());
    designator(
        &mut descriptors,
        CODESET_ASCII,
        ASSOCIATION_LOGICAL_UNIT,
        DESIGNATOR_T10_VENDOR_ID,
        &t10,
    );

    descriptors
}

/// `[protocol|codeset][PIV|association|type][reserved][length][value]`
fn designator(out: &mut Vec<u8>, codeset: u8, association: u8, kind: u8, value: &[u8]) {
    out.push((PROTOCOL_ISCSI << 4) | codeset);
    out.push(PIV | (association << 4) | kind);
    out.push(0x00);
    out.push(value.len() as u8);
    out.extend_from_slice(value);
}

/// SCSI name strings are NUL terminated and padded to a multiple of 4.
fn scsi_name(name: &str) -> Vec<u8> {
    let bytes = name.as_bytes();
    let mut value = bytes[..bytes.len().min(251)].to_vec();
    value.push(0);
    while value.len() % 4 != 0 {
        value.push(0);
    }
    value
}

fn extended_inquiry_data() -> Vec<u8> {
    let mut page = vec![0u8; EXTENDED_INQUIRY_LEN];
    page[0] = device_type::DIRECT_ACCESS;
    page[1] = vpd_page::EXTENDED_INQUIRY_DATA;
    page[2..4].copy_from_slice(&((EXTENDED_INQUIRY_LEN - 4) as u16).to_be_bytes());
    page[5] = 0x01; // SIMPSUP
    page
}
