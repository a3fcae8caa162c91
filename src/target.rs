//! Target front end
//!
//! Owns the configured engine and routes every command from the session
//! layer to it.

use crate::config::{Config, ConfigError};
use crate::disk::DiskEngine;
use crate::osd::OsdEngine;
use crate::scsi::{ScsiCommand, ScsiDevice, ScsiStatus, Session};
use crate::storage::StorageError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that stop a target from starting
#[derive(Debug, Error)]
pub enum InitError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("cannot open storage for {root}: {source}")]
    Storage {
        root: String,
        #[source]
        source: StorageError,
    },

    #[error("invalid geometry: {0}")]
    Geometry(String),

    #[error("cannot create {}: {source}", path.display())]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A configured iSCSI target
pub struct Target {
    iqn: String,
    device: Box<dyn ScsiDevice>,
}

impl Target {
    /// Validate the configuration and bring up its engine.
    pub fn init(config: &Config) -> Result<Self, InitError> {
        config.validate()?;
        let iqn = config.target.iqn();

        let device: Box<dyn ScsiDevice> = if config.disk.is_some() {
            Box::new(DiskEngine::new(config)?)
        } else {
            Box::new(OsdEngine::new(config)?)
        };

        log::info!("Target {} ready with {} LUN(s)", iqn, device.lun_count());
        Ok(Self { iqn, device })
    }

    pub fn iqn(&self) -> &str {
        &self.iqn
    }

    pub fn lun_count(&self) -> u32 {
        self.device.lun_count()
    }

    /// Execute one command; results are written into `cmd`.
    pub fn command(&self, session: &mut Session<'_>, cmd: &mut ScsiCommand) -> ScsiStatus {
        self.device.execute(session, cmd)
    }

    /// Flush and close all backing storage.
    pub fn shutdown(&self) -> Result<(), StorageError> {
        log::info!("Shutting down target {}", self.iqn);
        self.device.shutdown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scsi::cdb::opcodes;
    use crate::scsi::BufferedTransfer;
    use tempfile::TempDir;

    fn disk_config(dir: &TempDir) -> Config {
        Config::parse(&format!(
            r#"
[target]
alias = "probe"

[[extent]]
name = "a"
path = "{a}"
size = 262144

[[extent]]
name = "b"
path = "{b}"
size = 262144

[[device]]
name = "mirror"
raid = "raid1"
children = ["a", "b"]

[disk]
blocklen = 512

[[disk.lun]]
root = "mirror"
"#,
            a = dir.path().join("a.img").display(),
            b = dir.path().join("b.img").display(),
        ))
        .unwrap()
    }

    #[test]
    fn test_disk_target() {
        let dir = TempDir::new().unwrap();
        let target = Target::init(&disk_config(&dir)).unwrap();
        assert_eq!(target.lun_count(), 1);
        assert!(target.iqn().ends_with(":storage.probe"));

        let mut transfer = BufferedTransfer::new(vec![0x42; 512]);
        let mut session = Session::new(1, "iqn.2026-10.test:initiator", &mut transfer);
        let mut write = ScsiCommand::new(0, &[opcodes::WRITE_10, 0, 0, 0, 0, 9, 0, 0, 1, 0]);
        assert_eq!(target.command(&mut session, &mut write), ScsiStatus::Good);
        target.shutdown().unwrap();

        // Both mirror halves hold the block.
        for name in ["a.img", "b.img"] {
            let data = std::fs::read(dir.path().join(name)).unwrap();
            assert_eq!(&data[9 * 512..10 * 512], &[0x42u8; 512][..]);
        }
    }

    #[test]
    fn test_osd_target() {
        let dir = TempDir::new().unwrap();
        let config = Config::parse(&format!(
            "[osd]\nluns = 3\ndirectory = \"{}\"\n",
            dir.path().display()
        ))
        .unwrap();
        let target = Target::init(&config).unwrap();
        assert_eq!(target.lun_count(), 3);
        target.shutdown().unwrap();
    }

    #[test]
    fn test_missing_backing_directory() {
        let dir = TempDir::new().unwrap();
        let mut config = disk_config(&dir);
        config.extent[0].path = dir.path().join("missing").join("a.img");
        assert!(matches!(
            Target::init(&config),
            Err(InitError::Storage { .. })
        ));
    }

    #[test]
    fn test_oversized_raid0_rejected() {
        let dir = TempDir::new().unwrap();
        let mut body = String::new();
        for name in ["a", "b", "c"] {
            body.push_str(&format!(
                "[[extent]]\nname = \"{}\"\npath = \"{}\"\nsize = 9223372036854775807\n\n",
                name,
                dir.path().join(name).display()
            ));
        }
        body.push_str(
            "[[device]]\nname = \"big\"\nraid = \"raid0\"\nchildren = [\"a\", \"b\", \"c\"]\n\n",
        );
        body.push_str("[disk]\n\n[[disk.lun]]\nroot = \"big\"\n");
        let config = Config::parse(&body).unwrap();
        assert!(matches!(Target::init(&config), Err(InitError::Config(_))));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = TempDir::new().unwrap();
        let mut config = disk_config(&dir);
        config.osd = Some(Default::default());
        assert!(matches!(Target::init(&config), Err(InitError::Config(_))));
    }
}
