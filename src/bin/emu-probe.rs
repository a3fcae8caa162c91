//! Probe a target configuration
//!
//! Usage:
//!   emu-probe [OPTIONS] <CONFIG>
//!
//! Brings up the target described by CONFIG, sends the discovery commands an
//! initiator would (TEST UNIT READY, INQUIRY, READ CAPACITY, REPORT LUNS) to
//! every LUN, logs hex dumps of the responses and shuts the target down.

use anyhow::{bail, Context, Result};
use clap::Parser;
use env_logger::Env;
use iscsi_emu::config::Config;
use iscsi_emu::scsi::cdb::opcodes;
use iscsi_emu::scsi::BufferedTransfer;
use iscsi_emu::{ScsiCommand, ScsiStatus, Session, Target};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "emu-probe")]
#[command(about = "Run discovery commands against a target configuration", long_about = None)]
struct Args {
    /// Path to configuration file (TOML)
    config: PathBuf,

    /// Disk engine option override, e.g. blocklen=4096 (repeatable)
    #[arg(short = 'o', long = "option")]
    options: Vec<String>,

    /// Log level (defaults to target.log_level from the configuration)
    #[arg(short, long)]
    log_level: Option<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;

    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.target.log_level.clone());
    env_logger::Builder::from_env(Env::default().default_filter_or(level)).init();

    log::info!("emu-probe v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Loaded configuration from {}", args.config.display());

    for option in &args.options {
        let (key, value) = option
            .split_once('=')
            .with_context(|| format!("option {:?} is not key=value", option))?;
        if let Some(disk) = config.disk.as_mut() {
            disk.set_option(key, value)?;
        } else if let Some(osd) = config.osd.as_mut() {
            osd.set_option(key, value)?;
        }
    }

    let target = Target::init(&config).context("failed to start target")?;
    log::info!("Target {}", target.iqn());

    let mut transfer = BufferedTransfer::default();
    let mut session = Session::new(0, "iqn.2026-10.local.voe:emu-probe", &mut transfer);

    let mut report_luns = [0u8; 12];
    report_luns[0] = opcodes::REPORT_LUNS;
    report_luns[6..10].copy_from_slice(&4096u32.to_be_bytes());
    probe(&target, &mut session, 0, "REPORT LUNS", &report_luns)?;

    for lun in 0..u64::from(target.lun_count()) {
        let test_unit_ready = [opcodes::TEST_UNIT_READY, 0, 0, 0, 0, 0];
        probe(&target, &mut session, lun, "TEST UNIT READY", &test_unit_ready)?;

        let inquiry = [opcodes::INQUIRY, 0, 0, 0, 36, 0];
        probe(&target, &mut session, lun, "INQUIRY", &inquiry)?;

        if config.disk.is_some() {
            let read_capacity = [opcodes::READ_CAPACITY_10, 0, 0, 0, 0, 0, 0, 0, 0, 0];
            let data = probe(&target, &mut session, lun, "READ CAPACITY", &read_capacity)?;
            if data.len() == 8 {
                let max_lba = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
                let blocklen = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
                log::info!(
                    "LUN {}: {} blocks of {} bytes",
                    lun,
                    u64::from(max_lba) + 1,
                    blocklen
                );
            }
        }
    }

    target.shutdown().context("shutdown failed")?;
    Ok(())
}

/// Run one command and log its response.
fn probe(
    target: &Target,
    session: &mut Session<'_>,
    lun: u64,
    name: &str,
    cdb: &[u8],
) -> Result<Vec<u8>> {
    let mut cmd = ScsiCommand::new(lun, cdb);
    let status = target.command(session, &mut cmd);
    if status != ScsiStatus::Good {
        bail!(
            "LUN {} {}: status {:?}, sense {}",
            lun,
            name,
            status,
            hex::encode(&cmd.sense)
        );
    }
    log::info!("LUN {} {}: {} bytes", lun, name, cmd.length);
    if !cmd.data.is_empty() {
        log::info!("  {}", hex::encode(&cmd.data));
    }
    Ok(cmd.data)
}
