//! Block disk engine
//!
//! Serves each configured LUN from its own extent/device tree. Commands run
//! to completion under the LUN's mutex; every failure becomes CHECK
//! CONDITION with sense data on the command.

pub mod inquiry;
pub mod pages;
pub mod reservation;

use crate::config::Config;
use crate::scsi::cdb::{opcodes, parse_read_write, read_u16, read_u32, require, BlockRange};
use crate::scsi::response::{missing_lun_inquiry, report_luns, Identity};
use crate::scsi::{
    Reply, ScsiCommand, ScsiDevice, ScsiError, ScsiStatus, Session, MAX_TRANSFER,
};
use crate::storage::{build_tree, Node, StorageError, SyncMode};
use crate::target::InitError;
use inquiry::LunIdentity;
use reservation::ReservationKeys;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

/// Block geometry of a LUN
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Bytes per block
    pub blocklen: u32,
    /// Number of blocks
    pub blocks: u64,
}

impl Geometry {
    /// Capacity in bytes
    pub fn capacity(&self) -> u64 {
        self.blocks * u64::from(self.blocklen)
    }

    /// Reject ranges that run past the last block.
    pub fn check(&self, lba: u64, blocks: u64) -> Result<(), ScsiError> {
        match lba.checked_add(blocks) {
            Some(end) if end <= self.blocks => Ok(()),
            _ => Err(ScsiError::LbaOutOfRange {
                lba,
                blocks,
                capacity: self.blocks,
            }),
        }
    }

    /// Byte offset and length of a READ/WRITE range, bounded by the staging buffer.
    pub fn byte_range(&self, range: BlockRange) -> Result<(u64, usize), ScsiError> {
        self.check(range.lba, u64::from(range.blocks))?;
        let bytes = u64::from(range.blocks) * u64::from(self.blocklen);
        if bytes > MAX_TRANSFER as u64 {
            return Err(ScsiError::TransferTooLarge(bytes));
        }
        Ok((range.lba * u64::from(self.blocklen), bytes as usize))
    }
}

/// Mutable state of a LUN, guarded by its mutex
struct LunState {
    tree: Node,
    keys: ReservationKeys,
    /// Staging buffer for READ/WRITE data, never larger than MAX_TRANSFER
    staging: Vec<u8>,
}

/// A logical unit backed by a storage tree
pub struct Lun {
    number: u64,
    geometry: Geometry,
    uuid: Uuid,
    state: Mutex<LunState>,
}

impl Lun {
    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn uuid(&self) -> &Uuid {
        &self.uuid
    }

    fn lock(&self) -> MutexGuard<'_, LunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// SCSI block device serving one or more LUNs
pub struct DiskEngine {
    iqn: String,
    identity: Identity,
    luns: Vec<Lun>,
    running: AtomicBool,
}

impl DiskEngine {
    /// Build and open the storage tree of every configured LUN.
    pub fn new(config: &Config) -> Result<Self, InitError> {
        let disk = config
            .disk
            .as_ref()
            .ok_or_else(|| InitError::Geometry("no [disk] section".to_string()))?;
        let blocklen = disk.blocklen;

        let mut luns = Vec::with_capacity(disk.lun_count() as usize);
        for (number, lun) in disk.lun.iter().take(disk.lun_count() as usize).enumerate() {
            let mut tree = build_tree(config, &lun.root)?;
            let size = tree.size();

            let blocks = match disk.blocks {
                Some(blocks) => {
                    let needed = blocks.checked_mul(u64::from(blocklen));
                    if needed.map_or(true, |bytes| bytes > size) {
                        return Err(InitError::Geometry(format!(
                            "{} blocks of {} bytes do not fit in {} ({} bytes)",
                            blocks, blocklen, lun.root, size
                        )));
                    }
                    blocks
                }
                None => size / u64::from(blocklen),
            };
            if blocks == 0 {
                return Err(InitError::Geometry(format!(
                    "{} ({} bytes) is smaller than one {} byte block",
                    lun.root, size, blocklen
                )));
            }

            tree.open().map_err(|source| InitError::Storage {
                root: lun.root.clone(),
                source,
            })?;

            let geometry = Geometry { blocklen, blocks };
            let uuid = Uuid::new_v4();
            log::info!(
                "LUN {}: {} ({} x {} bytes, {} MiB, uuid {})",
                number,
                lun.root,
                blocks,
                blocklen,
                geometry.capacity() / (1024 * 1024),
                uuid
            );

            luns.push(Lun {
                number: number as u64,
                geometry,
                uuid,
                state: Mutex::new(LunState {
                    tree,
                    keys: ReservationKeys::default(),
                    staging: Vec::with_capacity(MAX_TRANSFER),
                }),
            });
        }

        Ok(Self {
            iqn: config.target.iqn(),
            identity: Identity::new("VoE", "Virtual Disk", "1.0"),
            luns,
            running: AtomicBool::new(true),
        })
    }

    pub fn iqn(&self) -> &str {
        &self.iqn
    }

    pub fn luns(&self) -> &[Lun] {
        &self.luns
    }

    fn lun(&self, number: u64) -> Option<&Lun> {
        usize::try_from(number).ok().and_then(|n| self.luns.get(n))
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

        let lun = match self.lun(cmd.lun) {
            Some(lun) => lun,
            None if cdb[0] == opcodes::INQUIRY => {
                return missing_lun_inquiry(cdb, &self.identity).map(Reply::Data);
            }
            None => return Err(ScsiError::LunNotSupported(cmd.lun)),
        };

        match cdb[0] {
            opcodes::TEST_UNIT_READY
            | opcodes::RESERVE_6
            | opcodes::RESERVE_10
            | opcodes::RELEASE_6
            | opcodes::RELEASE_10 => Ok(Reply::Data(Vec::new())),

            opcodes::INQUIRY => {
                let id = LunIdentity {
                    iqn: &self.iqn,
                    lun: lun.number,
                    uuid: &lun.uuid,
                    product: &self.identity,
                };
                inquiry::inquiry(cdb, &id).map(Reply::Data)
            }

            opcodes::READ_CAPACITY_10 => Ok(Reply::Data(pages::read_capacity_10(&lun.geometry))),
            opcodes::SERVICE_ACTION_IN_16 => {
                pages::service_action_in(cdb, &lun.geometry).map(Reply::Data)
            }
            opcodes::MODE_SENSE_6 => pages::mode_sense_6(cdb, &lun.geometry).map(Reply::Data),
            opcodes::MODE_SENSE_10 => pages::mode_sense_10(cdb, &lun.geometry).map(Reply::Data),

            opcodes::READ_6 | opcodes::READ_10 | opcodes::READ_16 => {
                self.read(session, cmd, lun).map(Reply::Sent)
            }
            opcodes::WRITE_6 | opcodes::WRITE_10 | opcodes::WRITE_16 | opcodes::WRITE_VERIFY => {
                self.write(session, cmd, lun).map(|_| Reply::Data(Vec::new()))
            }
            opcodes::SYNC_CACHE => self.sync_cache(cdb, lun).map(|_| Reply::Data(Vec::new())),

            opcodes::PERSISTENT_RESERVE_IN => {
                let state = lun.lock();
                reservation::reserve_in(cdb, &state.keys).map(Reply::Data)
            }
            opcodes::PERSISTENT_RESERVE_OUT => {
                let length = reservation::reserve_out_parameter_length(cdb)?;
                let mut parameters = vec![0u8; length];
                cmd.receive(&mut *session.transfer, &mut parameters)?;
                let mut state = lun.lock();
                reservation::reserve_out(cdb, &parameters, &mut state.keys)?;
                Ok(Reply::Data(Vec::new()))
            }

            opcode => Err(ScsiError::UnsupportedOpcode(opcode)),
        }
    }

    /// READ (6/10/16): stage the range, then send it as Data-In.
    fn read(
        &self,
        session: &mut Session<'_>,
        cmd: &ScsiCommand,
        lun: &Lun,
    ) -> Result<usize, ScsiError> {
        let range = parse_read_write(&cmd.cdb)?;
        let (offset, len) = lun.geometry.byte_range(range)?;
        log::debug!(
            "LUN {} read lba {} blocks {}",
            lun.number,
            range.lba,
            range.blocks
        );
        if len == 0 {
            return Ok(0);
        }

        let mut guard = lun.lock();
        let state = &mut *guard;
        state.staging.resize(len, 0);
        state
            .tree
            .read_at(offset, &mut state.staging[..len])
            .map_err(ScsiError::Read)?;
        session.transfer.send(&[&state.staging[..len]])?;
        Ok(len)
    }

    /// WRITE (6/10/16) and WRITE AND VERIFY: receive Data-Out, then write it.
    fn write(
        &self,
        session: &mut Session<'_>,
        cmd: &ScsiCommand,
        lun: &Lun,
    ) -> Result<(), ScsiError> {
        let range = parse_read_write(&cmd.cdb)?;
        let (offset, len) = lun.geometry.byte_range(range)?;
        log::debug!(
            "LUN {} write lba {} blocks {}",
            lun.number,
            range.lba,
            range.blocks
        );
        if len == 0 {
            return Ok(());
        }

        let mut guard = lun.lock();
        let state = &mut *guard;
        state.staging.resize(len, 0);
        cmd.receive(&mut *session.transfer, &mut state.staging[..len])?;
        state
            .tree
            .write_at(offset, &state.staging[..len])
            .map_err(ScsiError::Write)?;

        if cmd.opcode() == opcodes::WRITE_VERIFY {
            state
                .tree
                .sync_range(SyncMode::Data, offset, len as u64)
                .map_err(ScsiError::Sync)?;
        }
        Ok(())
    }

    /// SYNCHRONIZE CACHE (10); a block count of 0 means to the last block.
    fn sync_cache(&self, cdb: &[u8], lun: &Lun) -> Result<(), ScsiError> {
        require(cdb, 10)?;
        let lba = u64::from(read_u32(cdb, 2));
        let requested = u64::from(read_u16(cdb, 7));
        let geometry = lun.geometry;

        let blocks = if requested == 0 {
            geometry.blocks.saturating_sub(lba)
        } else {
            requested
        };
        if lba > geometry.blocks {
            return Err(ScsiError::LbaOutOfRange {
                lba,
                blocks,
                capacity: geometry.blocks,
            });
        }
        geometry.check(lba, blocks)?;
        log::debug!("LUN {} sync lba {} blocks {}", lun.number, lba, blocks);
        if blocks == 0 {
            return Ok(());
        }

        let blocklen = u64::from(geometry.blocklen);
        lun.lock()
            .tree
            .sync_range(SyncMode::Data, lba * blocklen, blocks * blocklen)
            .map_err(ScsiError::Sync)
    }
}

impl ScsiDevice for DiskEngine {
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
        self.luns.len() as u32
    }

    fn shutdown(&self) -> Result<(), StorageError> {
        self.running.store(false, Ordering::Release);

        let mut first_error = None;
        for lun in &self.luns {
            let mut state = lun.lock();
            let size = state.tree.size();
            if let Err(e) = state.tree.sync_range(SyncMode::File, 0, size) {
                log::error!("LUN {}: sync on shutdown failed: {}", lun.number, e);
                first_error.get_or_insert(e);
            }
            state.tree.close();
            log::info!("LUN {} closed", lun.number);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
