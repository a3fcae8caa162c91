//! Persistent reservation key bookkeeping
//!
//! Keys live in memory only, so a freshly started target reports no
//! registrations, as a device that has just powered on would.

use crate::scsi::cdb::{read_u16, read_u32, read_u64, require, truncate_to};
use crate::scsi::ScsiError;

/// Most keys a LUN will hold
pub const MAX_RESERVATION_KEYS: usize = 32;

/// PERSISTENT RESERVE OUT parameter list length
pub const PARAMETER_LIST_LEN: usize = 24;

/// PERSISTENT RESERVE IN service actions
pub mod reserve_in {
    pub const READ_KEYS: u8 = 0x00;
    pub const READ_RESERVATION: u8 = 0x01;
    pub const REPORT_CAPABILITIES: u8 = 0x02;
}

/// PERSISTENT RESERVE OUT service actions
pub mod reserve_out {
    pub const REGISTER: u8 = 0x00;
    pub const CLEAR: u8 = 0x03;
    pub const REGISTER_AND_IGNORE_EXISTING_KEY: u8 = 0x06;
}

/// REPORT CAPABILITIES response: length 8, TMV set, type mask.
const CAPABILITIES: [u8; 8] = [0x00, 0x08, 0x00, 0x80, 0xea, 0x01, 0x00, 0x00];

/// Registered reservation keys of one LUN
#[derive(Debug, Default)]
pub struct ReservationKeys {
    generation: u32,
    keys: Vec<u64>,
}

impl ReservationKeys {
    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn keys(&self) -> &[u64] {
        &self.keys
    }

    /// Register `key`, replacing `existing` when it is registered.
    pub fn register(&mut self, existing: u64, key: u64) -> Result<(), ScsiError> {
        if let Some(slot) = self.keys.iter_mut().find(|k| **k == existing) {
            *slot = key;
        } else if !self.keys.contains(&key) {
            if self.keys.len() >= MAX_RESERVATION_KEYS {
                return Err(ScsiError::RegistrationsFull);
            }
            self.keys.push(key);
        }
        self.generation = self.generation.wrapping_add(1);
        Ok(())
    }

    pub fn unregister(&mut self, key: u64) {
        self.keys.retain(|k| *k != key);
        self.generation = self.generation.wrapping_add(1);
    }

    pub fn clear(&mut self) {
        self.keys.clear();
        self.generation = self.generation.wrapping_add(1);
    }
}

/// PERSISTENT RESERVE IN
pub fn reserve_in(cdb: &[u8], keys: &ReservationKeys) -> Result<Vec<u8>, ScsiError> {
    require(cdb, 10)?;
    let action = cdb[1] & 0x1f;
    let allocation_length = read_u16(cdb, 7) as usize;

    let response = match action {
        reserve_in::READ_KEYS => {
            let mut response = Vec::with_capacity(8 + keys.keys.len() * 8);
            response.extend_from_slice(&keys.generation.to_be_bytes());
            response.extend_from_slice(&((keys.keys.len() * 8) as u32).to_be_bytes());
            for key in &keys.keys {
                response.extend_from_slice(&key.to_be_bytes());
            }
            response
        }
        reserve_in::READ_RESERVATION => {
            // No reservation is ever held.
            let mut response = Vec::with_capacity(8);
            response.extend_from_slice(&keys.generation.to_be_bytes());
            response.extend_from_slice(&0u32.to_be_bytes());
            response
        }
        reserve_in::REPORT_CAPABILITIES => CAPABILITIES.to_vec(),
        other => {
            return Err(ScsiError::InvalidField(format!(
                "persistent reserve in action 0x{:02x}",
                other
            )));
        }
    };

    Ok(truncate_to(response, allocation_length))
}

/// Parameter list length of a PERSISTENT RESERVE OUT CDB
pub fn reserve_out_parameter_length(cdb: &[u8]) -> Result<usize, ScsiError> {
    require(cdb, 10)?;
    let length = read_u32(cdb, 5) as usize;
    if length != PARAMETER_LIST_LEN {
        return Err(ScsiError::ParameterList(format!(
            "expected {} bytes, got {}",
            PARAMETER_LIST_LEN, length
        )));
    }
    Ok(length)
}

/// PERSISTENT RESERVE OUT with its parameter list
pub fn reserve_out(
    cdb: &[u8],
    parameters: &[u8],
    keys: &mut ReservationKeys,
) -> Result<(), ScsiError> {
    require(cdb, 10)?;
    if parameters.len() < PARAMETER_LIST_LEN {
        return Err(ScsiError::ParameterList(format!(
            "{} byte parameter list",
            parameters.len()
        )));
    }
    let action = cdb[1] & 0x1f;
    let reservation_key = read_u64(parameters, 0);
    let service_action_key = read_u64(parameters, 8);

    match action {
        reserve_out::REGISTER | reserve_out::REGISTER_AND_IGNORE_EXISTING_KEY => {
            if service_action_key == 0 {
                log::debug!("unregistering key {:#018x}", reservation_key);
                keys.unregister(reservation_key);
            } else {
                log::debug!("registering key {:#018x}", service_action_key);
                keys.register(reservation_key, service_action_key)?;
            }
            Ok(())
        }
        reserve_out::CLEAR => {
            keys.clear();
            Ok(())
        }
        other => Err(ScsiError::InvalidField(format!(
            "persistent reserve out action 0x{:02x}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scsi::cdb::opcodes;
    use crate::scsi::Sense;

    fn in_cdb(action: u8) -> [u8; 10] {
        [opcodes::PERSISTENT_RESERVE_IN, action, 0, 0, 0, 0, 0, 0x10, 0x00, 0]
    }

    fn out_cdb(action: u8) -> [u8; 10] {
        [opcodes::PERSISTENT_RESERVE_OUT, action, 0, 0, 0, 0, 0, 0, 24, 0]
    }

    fn parameters(reservation_key: u64, service_action_key: u64) -> Vec<u8> {
        let mut params = vec![0u8; PARAMETER_LIST_LEN];
        params[0..8].copy_from_slice(&reservation_key.to_be_bytes());
        params[8..16].copy_from_slice(&service_action_key.to_be_bytes());
        params
    }

    #[test]
    fn test_read_keys_after_power_on() {
        let keys = ReservationKeys::default();
        let data = reserve_in(&in_cdb(reserve_in::READ_KEYS), &keys).unwrap();
        assert_eq!(data, [0u8; 8]);
    }

    #[test]
    fn test_report_capabilities() {
        let keys = ReservationKeys::default();
        let data = reserve_in(&in_cdb(reserve_in::REPORT_CAPABILITIES), &keys).unwrap();
        assert_eq!(data.len(), 8);
        assert_eq!(&data[..2], &[0x00, 0x08]);
    }

    #[test]
    fn test_register_and_read_keys() {
        let mut keys = ReservationKeys::default();
        reserve_out(&out_cdb(reserve_out::REGISTER), &parameters(0, 0xabcd), &mut keys).unwrap();
        reserve_out(&out_cdb(reserve_out::REGISTER), &parameters(0, 0x1234), &mut keys).unwrap();

        let data = reserve_in(&in_cdb(reserve_in::READ_KEYS), &keys).unwrap();
        assert_eq!(&data[0..4], &2u32.to_be_bytes());
        assert_eq!(&data[4..8], &16u32.to_be_bytes());
        assert_eq!(&data[8..16], &0xabcdu64.to_be_bytes());
        assert_eq!(&data[16..24], &0x1234u64.to_be_bytes());

        // Unregister with a zero service action key.
        reserve_out(&out_cdb(reserve_out::REGISTER), &parameters(0xabcd, 0), &mut keys).unwrap();
        assert_eq!(keys.keys(), &[0x1234]);

        reserve_out(&out_cdb(reserve_out::CLEAR), &parameters(0x1234, 0), &mut keys).unwrap();
        assert!(keys.keys().is_empty());
        assert_eq!(keys.generation(), 4);
    }

    #[test]
    fn test_register_replaces_existing_key() {
        let mut keys = ReservationKeys::default();
        keys.register(0, 1).unwrap();
        keys.register(1, 2).unwrap();
        assert_eq!(keys.keys(), &[2]);
    }

    #[test]
    fn test_key_table_bounded() {
        let mut keys = ReservationKeys::default();
        for key in 1..=MAX_RESERVATION_KEYS as u64 {
            keys.register(0, key).unwrap();
        }
        let err = keys.register(0, 999).unwrap_err();
        assert_eq!(err.sense(), Sense::INSUFFICIENT_REGISTRATION_RESOURCES);
        assert_eq!(keys.keys().len(), MAX_RESERVATION_KEYS);
    }

    #[test]
    fn test_parameter_length_checked() {
        assert_eq!(
            reserve_out_parameter_length(&out_cdb(reserve_out::REGISTER)).unwrap(),
            24
        );
        let mut cdb = out_cdb(reserve_out::REGISTER);
        cdb[8] = 8;
        assert!(reserve_out_parameter_length(&cdb).is_err());
    }

    #[test]
    fn test_unsupported_out_action() {
        let mut keys = ReservationKeys::default();
        assert!(reserve_out(&out_cdb(0x01), &parameters(0, 1), &mut keys).is_err());
    }
}
