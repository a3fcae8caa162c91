//! Capacity and mode-parameter responses

use super::Geometry;
use crate::scsi::cdb::{read_u16, read_u32, require, truncate_to};
use crate::scsi::ScsiError;

/// Page control value asking for changeable values
const PAGE_CONTROL_CHANGEABLE: u8 = 0x01;

/// SERVICE ACTION IN (16) action for READ CAPACITY (16)
const READ_CAPACITY_16: u8 = 0x10;

/// Block descriptor length in mode parameter headers
const BLOCK_DESCRIPTOR_LEN: usize = 8;

/// READ CAPACITY (10): last LBA and block length, big-endian.
pub fn read_capacity_10(geometry: &Geometry) -> Vec<u8> {
    let max_lba = geometry.blocks.saturating_sub(1).min(0xffff_ffff) as u32;

    let mut response = Vec::with_capacity(8);
    response.extend_from_slice(&max_lba.to_be_bytes());
    response.extend_from_slice(&geometry.blocklen.to_be_bytes());
    response
}

/// SERVICE ACTION IN (16); only READ CAPACITY (16) is implemented.
pub fn service_action_in(cdb: &[u8], geometry: &Geometry) -> Result<Vec<u8>, ScsiError> {
    require(cdb, 16)?;
    let action = cdb[1] & 0x1f;
    if action != READ_CAPACITY_16 {
        return Err(ScsiError::InvalidField(format!(
            "service action in 0x{:02x}",
            action
        )));
    }
    let allocation_length = read_u32(cdb, 10) as usize;

    let mut response = Vec::with_capacity(32);
    response.extend_from_slice(&geometry.blocks.saturating_sub(1).to_be_bytes());
    response.extend_from_slice(&geometry.blocklen.to_be_bytes());
    response.resize(32, 0);

    Ok(truncate_to(response, allocation_length))
}

/// MODE SENSE (6): 4-byte header plus one block descriptor.
pub fn mode_sense_6(cdb: &[u8], geometry: &Geometry) -> Result<Vec<u8>, ScsiError> {
    require(cdb, 6)?;
    check_page_control(cdb)?;
    let allocation_length = cdb[4] as usize;

    let mut response = Vec::with_capacity(4 + BLOCK_DESCRIPTOR_LEN);
    response.push((4 + BLOCK_DESCRIPTOR_LEN - 1) as u8); // Mode data length
    response.push(0x00); // Medium type
    response.push(0x00); // Device-specific parameter
    response.push(BLOCK_DESCRIPTOR_LEN as u8);
    response.extend_from_slice(&block_descriptor(geometry));

    Ok(truncate_to(response, allocation_length))
}

/// MODE SENSE (10): 8-byte header plus one block descriptor.
pub fn mode_sense_10(cdb: &[u8], geometry: &Geometry) -> Result<Vec<u8>, ScsiError> {
    require(cdb, 10)?;
    check_page_control(cdb)?;
    let allocation_length = read_u16(cdb, 7) as usize;

    let mut response = Vec::with_capacity(8 + BLOCK_DESCRIPTOR_LEN);
    response.extend_from_slice(&((8 + BLOCK_DESCRIPTOR_LEN - 2) as u16).to_be_bytes());
    response.push(0x00); // Medium type
    response.push(0x00); // Device-specific parameter
    response.extend_from_slice(&[0x00, 0x00]); // LONGLBA clear, reserved
    response.extend_from_slice(&(BLOCK_DESCRIPTOR_LEN as u16).to_be_bytes());
    response.extend_from_slice(&block_descriptor(geometry));

    Ok(truncate_to(response, allocation_length))
}

fn check_page_control(cdb: &[u8]) -> Result<(), ScsiError> {
    let page_control = cdb[2] >> 6;
    if page_control == PAGE_CONTROL_CHANGEABLE {
        return Err(ScsiError::PageControlUnsupported(page_control));
    }
    Ok(())
}

/// Density code 0, 24-bit block count, 24-bit block length.
fn block_descriptor(geometry: &Geometry) -> [u8; BLOCK_DESCRIPTOR_LEN] {
    let blocks = geometry.blocks.min(0x00ff_ffff) as u32;
    let mut descriptor = [0u8; BLOCK_DESCRIPTOR_LEN];
    descriptor[1..4].copy_from_slice(&blocks.to_be_bytes()[1..]);
    descriptor[5..8].copy_from_slice(&geometry.blocklen.to_be_bytes()[1..]);
    descriptor
}
