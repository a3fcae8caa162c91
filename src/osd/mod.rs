//! Object-based storage (OSD) engine
//!
//! Objects are addressed by (GroupID, UserID) and stored as plain files
//! under `<directory>/lun_<n>/`. Every command may piggy-back one attribute
//! set (value after any WRITE data) and one attribute get (entry after any
//! READ data).

pub mod cdb;
pub mod store;

use crate::config::Config;
use crate::scsi::cdb::{opcodes, require, truncate_to};
use crate::scsi::response::{
    device_type, inquiry_allocation_length, missing_lun_inquiry, report_luns, standard_inquiry,
    Identity,
};
use crate::scsi::{
    Reply, ScsiCommand, ScsiDevice, ScsiError, ScsiStatus, Sense, Session, MAX_TRANSFER,
};
use crate::storage::StorageError;
use crate::target::InitError;
use cdb::{attribute_entry, service_action, OsdCdb, ATTRIBUTE_ENTRY_HEADER};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use store::{attr_page, attribute_len, ObjectStore, VENDOR_ATTRIBUTE_LEN};
use thiserror::Error;

/// Object store failures
#[derive(Debug, Error)]
pub enum OsdError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("no free ID after {attempts} attempts")]
    IdSpaceExhausted { attempts: usize },

    #[error("unsupported attribute page 0x{page:08x} index {index}")]
    UnsupportedAttribute { page: u32, index: u32 },

    #[error("attribute length mismatch: expected {expected}, got {actual}")]
    AttributeLength { expected: usize, actual: usize },

    #[error("write to byte {end} exceeds capacity {capacity}")]
    CapacityExceeded { end: u64, capacity: u64 },

    #[error("unsupported service action 0x{0:04x}")]
    UnsupportedServiceAction(u16),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl OsdError {
    /// Sense data reported for this failure
    pub fn sense(&self) -> Sense {
        match self {
            OsdError::NotFound(_)
            | OsdError::AlreadyExists(_)
            | OsdError::UnsupportedAttribute { .. }
            | OsdError::AttributeLength { .. }
            | OsdError::UnsupportedServiceAction(_) => Sense::INVALID_FIELD,
            OsdError::IdSpaceExhausted { .. } => Sense::INSUFFICIENT_RESOURCES,
            OsdError::CapacityExceeded { .. } => Sense::QUOTA_ERROR,
            OsdError::Io(_) => Sense::INTERNAL_TARGET_FAILURE,
        }
    }

    pub fn is_io(&self) -> bool {
        matches!(self, OsdError::Io(_))
    }
}

/// OSD target serving one object store per LUN
pub struct OsdEngine {
    identity: Identity,
    stores: Vec<Mutex<ObjectStore>>,
    running: AtomicBool,
}

impl OsdEngine {
    /// Create `<directory>/lun_<n>` for every configured LUN.
    pub fn new(config: &Config) -> Result<Self, InitError> {
        let osd = config
            .osd
            .as_ref()
            .ok_or_else(|| InitError::Geometry("no [osd] section".to_string()))?;

        let mut stores = Vec::with_capacity(osd.luns as usize);
        for lun in 0..osd.luns {
            let path = osd.directory.join(format!("lun_{}", lun));
            let store = ObjectStore::open(&path, osd.capacity_bytes())
                .map_err(|source| InitError::Directory { path: path.clone(), source })?;
            log::info!(
                "OSD LUN {}: {} ({} MiB)",
                lun,
                path.display(),
                osd.capacity
            );
            stores.push(Mutex::new(store));
        }

        Ok(Self {
            identity: Identity::new("VoE", "Object Store", "1.0"),
            stores,
            running: AtomicBool::new(true),
        })
    }

    fn store(&self, lun: u64) -> Option<&Mutex<ObjectStore>> {
        usize::try_from(lun).ok().and_then(|n| self.stores.get(n))
    }

    fn dispatch(
        &self,
        session: &mut Session<'_>,
        cmd: &ScsiCommand,
    ) -> Result<Reply, ScsiError> {
        let cdb = cmd.cdb.as_slice();
        require(cdb, 1)?;

        if !self.running.load(Ordering::Acquire) {
            return Err(ScsiError::NotReady);
        }

        if cdb[0] == opcodes::REPORT_LUNS {
            return report_luns(cdb, self.lun_count()).map(Reply::Data);
        }

        let store = match self.store(cmd.lun) {
            Some(store) => store,
            None if cdb[0] == opcodes::INQUIRY => {
                return missing_lun_inquiry(cdb, &self.identity).map(Reply::Data);
            }
            None => return Err(ScsiError::LunNotSupported(cmd.lun)),
        };

        match cdb[0] {
            opcodes::TEST_UNIT_READY => Ok(Reply::Data(Vec::new())),
            opcodes::INQUIRY => {
                let allocation_length = inquiry_allocation_length(cdb)?;
                if cdb[1] & 0x01 != 0 {
                    return Err(ScsiError::InvalidField("EVPD on OSD LUN".to_string()));
                }
                let response = standard_inquiry(device_type::OSD, &self.identity);
                Ok(Reply::Data(truncate_to(response, allocation_length)))
            }
            opcodes::OSD_COMMAND => {
                let store = store.lock().unwrap_or_else(PoisonError::into_inner);
                self.osd_command(session, cmd, &store).map(Reply::Sent)
            }
            opcode => Err(ScsiError::UnsupportedOpcode(opcode)),
        }
    }

    /// Run one 7Fh command; returns the Data-In byte count sent.
    fn osd_command(
        &self,
        session: &mut Session<'_>,
        cmd: &ScsiCommand,
        store: &ObjectStore,
    ) -> Result<usize, ScsiError> {
        let osd = OsdCdb::parse(&cmd.cdb)?;
        log::debug!(
            "LUN {} OSD action 0x{:04x} group 0x{:x} user 0x{:x} length {} offset {}",
            cmd.lun,
            osd.action,
            osd.group_id,
            osd.user_id,
            osd.length,
            osd.offset
        );

        let write_len = match osd.action {
            service_action::WRITE => transfer_len(osd.length)?,
            _ => 0,
        };
        let read_len = match osd.action {
            service_action::READ => transfer_len(osd.length)?,
            _ => 0,
        };
        let set_len = osd.set.map_or(0, |set| set.length as usize);
        if set_len > VENDOR_ATTRIBUTE_LEN {
            return Err(OsdError::AttributeLength {
                expected: VENDOR_ATTRIBUTE_LEN,
                actual: set_len,
            }
            .into());
        }

        // Attribute requests are checked before the store changes, so a bad
        // one never leaves a created object behind.
        if let Some(set) = osd.set {
            if set.page != attr_page::VENDOR {
                return Err(OsdError::UnsupportedAttribute {
                    page: set.page,
                    index: set.index,
                }
                .into());
            }
        }
        if let Some(get) = osd.get {
            if let Some(value_len) = attribute_len(get.page, get.index)? {
                check_entry_len(get.length, ATTRIBUTE_ENTRY_HEADER + value_len)?;
            }
        }

        // Data-Out: WRITE payload, then the set-attribute value.
        let mut data_out = vec![0u8; write_len + set_len];
        if !data_out.is_empty() {
            cmd.receive(&mut *session.transfer, &mut data_out)?;
        }
        let (payload, set_value) = data_out.split_at(write_len);

        let mut group_id = osd.group_id;
        let mut user_id = osd.user_id;
        let mut read_data = Vec::new();

        match osd.action {
            service_action::CREATE_GROUP => {
                group_id = store.create_group(osd.group_id)?;
                log::info!("LUN {}: created group 0x{:x}", cmd.lun, group_id);
            }
            service_action::REMOVE_GROUP => store.remove_group(group_id)?,
            service_action::CREATE => {
                user_id = store.create(group_id, osd.user_id)?;
                log::debug!("LUN {}: created object 0x{:x}/0x{:x}", cmd.lun, group_id, user_id);
            }
            service_action::REMOVE => store.remove(group_id, user_id)?,
            service_action::WRITE => store.write(group_id, user_id, osd.offset, payload)?,
            service_action::READ => {
                read_data = store.read(group_id, user_id, osd.offset, read_len)?;
            }
            service_action::GET_ATTR | service_action::SET_ATTR => {}
            other => return Err(OsdError::UnsupportedServiceAction(other).into()),
        }

        let entry = match attributes(store, &osd, group_id, user_id, set_value) {
            Ok(entry) => entry,
            Err(e) => {
                undo_create(store, osd.action, group_id, user_id);
                return Err(e.into());
            }
        };

        let sent = read_data.len() + entry.len();
        if sent > 0 {
            session.transfer.send(&[read_data.as_slice(), entry.as_slice()])?;
        }
        Ok(sent)
    }
}

/// Apply the piggy-backed set, then build the get entry.
fn attributes(
    store: &ObjectStore,
    osd: &OsdCdb,
    group_id: u32,
    user_id: u64,
    set_value: &[u8],
) -> Result<Vec<u8>, OsdError> {
    if let Some(set) = osd.set {
        store.set_attr(group_id, user_id, set.page, set.index, set_value)?;
    }

    match osd.get {
        Some(get) => {
            let value = store.get_attr(group_id, user_id, get.page, get.index)?;
            let entry = attribute_entry(get.page, get.index, &value);
            check_entry_len(get.length, entry.len())?;
            Ok(entry)
        }
        None => Ok(Vec::new()),
    }
}

fn check_entry_len(allocation: u32, actual: usize) -> Result<(), OsdError> {
    if allocation as usize != actual {
        return Err(OsdError::AttributeLength {
            expected: allocation as usize,
            actual,
        });
    }
    Ok(())
}

/// Remove what a failed CREATE or CREATE_GROUP made; the initiator never
/// learned its ID.
fn undo_create(store: &ObjectStore, action: u16, group_id: u32, user_id: u64) {
    let undone = match action {
        service_action::CREATE_GROUP => store.remove_group(group_id),
        service_action::CREATE => store.remove(group_id, user_id),
        _ => return,
    };
    match undone {
        Ok(()) => log::warn!("rolled back create of 0x{:x}/0x{:x}", group_id, user_id),
        Err(e) => log::error!(
            "cannot roll back create of 0x{:x}/0x{:x}: {}",
            group_id,
            user_id,
            e
        ),
    }
}

/// READ/WRITE lengths share the staging cap of the block engine.
fn transfer_len(length: u64) -> Result<usize, ScsiError> {
    if length > MAX_TRANSFER as u64 {
        return Err(ScsiError::TransferTooLarge(length));
    }
    Ok(length as usize)
}

impl ScsiDevice for OsdEngine {
    fn execute(&self, session: &mut Session<'_>, cmd: &mut ScsiCommand) -> ScsiStatus {
        log::debug!(
            "session {}: LUN {} opcode 0x{:02x}",
            session.id,
            cmd.lun,
            cmd.opcode()
        );
        let result = self.dispatch(session, cmd);
        cmd.finish(result)
    }

    fn lun_count(&self) -> u32 {
        self.stores.len() as u32
    }

    fn shutdown(&self) -> Result<(), StorageError> {
        // Object files are closed after every command.
        self.running.store(false, Ordering::Release);
        log::info!("OSD engine stopped ({} LUNs)", self.stores.len());
        Ok(())
    }
}
