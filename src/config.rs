//! Configuration file parsing
//!
//! Parses TOML configuration files describing the storage trees and the
//! engine (block disk or OSD) that serves them.

use crate::storage::RaidLevel;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Block lengths a disk LUN may be configured with
pub const VALID_BLOCK_LENGTHS: [u32; 5] = [512, 1024, 2048, 4096, 8192];

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Target configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Target identity and logging
    #[serde(default)]
    pub target: TargetConfig,

    /// Leaf extents
    #[serde(default)]
    pub extent: Vec<ExtentConfig>,

    /// Composite devices
    #[serde(default)]
    pub device: Vec<DeviceConfig>,

    /// Block disk engine
    #[serde(default)]
    pub disk: Option<DiskConfig>,

    /// Object storage engine
    #[serde(default)]
    pub osd: Option<OsdConfig>,
}

/// Target identity
#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    /// Target IQN; generated from `alias` when absent
    #[serde(default)]
    pub name: Option<String>,

    /// Short name used for generated IQNs
    #[serde(default = "default_alias")]
    pub alias: String,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_alias() -> String {
    "target0".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            name: None,
            alias: default_alias(),
            log_level: default_log_level(),
        }
    }
}

impl TargetConfig {
    /// The IQN this target answers to
    pub fn iqn(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| generate_iqn(&self.alias))
    }
}

/// A byte range of a backing file
#[derive(Debug, Clone, Deserialize)]
pub struct ExtentConfig {
    pub name: String,

    /// Backing file (created if missing)
    pub path: PathBuf,

    /// File offset where the extent starts
    #[serde(default)]
    pub offset: u64,

    /// Extent length in bytes
    pub size: u64,
}

/// A RAID composition of other nodes
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    pub raid: RaidLevel,
    pub children: Vec<String>,
}

/// Block disk engine settings
#[derive(Debug, Clone, Deserialize)]
pub struct DiskConfig {
    /// Block length in bytes
    #[serde(default = "default_blocklen")]
    pub blocklen: u32,

    /// Blocks per LUN (defaults to the tree size divided by `blocklen`)
    #[serde(default)]
    pub blocks: Option<u64>,

    /// Number of LUNs exported (defaults to every `[[disk.lun]]`)
    #[serde(default)]
    pub luns: Option<u32>,

    /// Storage tree root of each LUN, in LUN order
    #[serde(default)]
    pub lun: Vec<LunConfig>,
}

fn default_blocklen() -> u32 {
    512
}

/// A disk LUN
#[derive(Debug, Clone, Deserialize)]
pub struct LunConfig {
    /// Name of the extent or device backing this LUN
    pub root: String,
}

impl DiskConfig {
    /// Number of LUNs that will be exported
    pub fn lun_count(&self) -> u32 {
        self.luns.unwrap_or(self.lun.len() as u32)
    }

    /// Apply a `key=value` override.
    pub fn set_option(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "blocklen" => {
                let blocklen = parse_number(key, value)?;
                check_blocklen(blocklen)?;
                self.blocklen = blocklen;
            }
            "blocks" => self.blocks = Some(parse_number(key, value)?),
            "luns" => self.luns = Some(parse_number(key, value)?),
            _ => {
                return Err(ConfigError::Invalid(format!("unknown disk option: {}", key)));
            }
        }
        log::debug!("disk option {} = {}", key, value);
        Ok(())
    }
}

/// Object storage engine settings
#[derive(Debug, Clone, Deserialize)]
pub struct OsdConfig {
    /// Capacity in MiB
    #[serde(default = "default_capacity")]
    pub capacity: u64,

    /// Number of LUNs, each with its own directory
    #[serde(default = "default_osd_luns")]
    pub luns: u32,

    /// Base directory holding `lun_<n>/`
    #[serde(default = "default_directory")]
    pub directory: PathBuf,
}

fn default_capacity() -> u64 {
    1024
}

fn default_osd_luns() -> u32 {
    1
}

fn default_directory() -> PathBuf {
    PathBuf::from("/tmp/iscsi-osd")
}

impl Default for OsdConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            luns: default_osd_luns(),
            directory: default_directory(),
        }
    }
}

impl OsdConfig {
    /// Capacity in bytes
    pub fn capacity_bytes(&self) -> u64 {
        self.capacity.saturating_mul(1024 * 1024)
    }

    /// Apply a `key=value` override.
    pub fn set_option(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "capacity" => self.capacity = parse_number(key, value)?,
            "luns" => self.luns = parse_number(key, value)?,
            "directory" => self.directory = PathBuf::from(value),
            _ => {
                return Err(ConfigError::Invalid(format!("unknown osd option: {}", key)));
            }
        }
        log::debug!("osd option {} = {}", key, value);
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("{}: not a number: {:?}", key, value)))
}

fn check_blocklen(blocklen: u32) -> Result<(), ConfigError> {
    if VALID_BLOCK_LENGTHS.contains(&blocklen) {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!(
            "block length {} not one of {:?}",
            blocklen, VALID_BLOCK_LENGTHS
        )))
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from a string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        match (&self.disk, &self.osd) {
            (Some(_), Some(_)) => {
                return Err(ConfigError::Invalid(
                    "[disk] and [osd] are mutually exclusive".to_string(),
                ))
            }
            (None, None) => {
                return Err(ConfigError::Invalid(
                    "either [disk] or [osd] is required".to_string(),
                ))
            }
            _ => {}
        }

        self.validate_nodes()?;

        if let Some(disk) = &self.disk {
            check_blocklen(disk.blocklen)?;

            let luns = disk.lun_count() as usize;
            if luns == 0 {
                return Err(ConfigError::Invalid("disk has no LUNs".to_string()));
            }
            if luns > disk.lun.len() {
                return Err(ConfigError::Invalid(format!(
                    "luns = {} but only {} [[disk.lun]] defined",
                    luns,
                    disk.lun.len()
                )));
            }
            if disk.blocks == Some(0) {
                return Err(ConfigError::Invalid("blocks must be non-zero".to_string()));
            }

            let mut roots = HashSet::new();
            for lun in &disk.lun[..luns] {
                if !self.has_node(&lun.root) {
                    return Err(ConfigError::Invalid(format!(
                        "LUN root {} is not a defined extent or device",
                        lun.root
                    )));
                }
                if !roots.insert(lun.root.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "{} backs more than one LUN",
                        lun.root
                    )));
                }
            }
        }

        if let Some(osd) = &self.osd {
            if osd.luns == 0 {
                return Err(ConfigError::Invalid("osd has no LUNs".to_string()));
            }
            if osd.capacity == 0 {
                return Err(ConfigError::Invalid("osd capacity must be non-zero".to_string()));
            }
        }

        Ok(())
    }

    /// Whether `name` is a defined extent or device
    pub fn has_node(&self, name: &str) -> bool {
        self.extent.iter().any(|e| e.name == name) || self.device.iter().any(|d| d.name == name)
    }

    /// Check the extent/device graph forms a forest.
    fn validate_nodes(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for name in self
            .extent
            .iter()
            .map(|e| &e.name)
            .chain(self.device.iter().map(|d| &d.name))
        {
            if !seen.insert(name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate node name: {}", name)));
            }
        }

        for extent in &self.extent {
            if extent.size == 0 {
                return Err(ConfigError::Invalid(format!(
                    "extent {} has zero size",
                    extent.name
                )));
            }
            if extent.offset.checked_add(extent.size).is_none() {
                return Err(ConfigError::Invalid(format!(
                    "extent {} ends past the largest file offset",
                    extent.name
                )));
            }
        }

        // Each node may have at most one parent.
        let mut parents: HashMap<&str, &str> = HashMap::new();
        for device in &self.device {
            if device.children.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "device {} has no children",
                    device.name
                )));
            }
            for child in &device.children {
                if !seen.contains(child.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "device {} references unknown node {}",
                        device.name, child
                    )));
                }
                if let Some(other) = parents.insert(child.as_str(), device.name.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "node {} is used by both {} and {}",
                        child, other, device.name
                    )));
                }
            }
        }

        // With single parents, a cycle shows up as a parent chain revisiting a node.
        for device in &self.device {
            let mut current = device.name.as_str();
            let mut steps = 0;
            while let Some(parent) = parents.get(current) {
                if *parent == device.name || steps > self.device.len() {
                    return Err(ConfigError::Invalid(format!(
                        "device {} is part of a cycle",
                        device.name
                    )));
                }
                current = *parent;
                steps += 1;
            }
        }

        // A LUN root must be a top-level node.
        if let Some(disk) = &self.disk {
            for lun in &disk.lun {
                if let Some(parent) = parents.get(lun.root.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "LUN root {} is already a child of {}",
                        lun.root, parent
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Generate an IQN for a target alias
pub fn generate_iqn(alias: &str) -> String {
    // Format: iqn.YYYY-MM.local.voe:storage.alias
    let date_str = chrono::Utc::now().format("%Y-%m").to_string();

    // Sanitize alias: lowercase, replace non-alphanumeric with dash
    let sanitized = alias
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>();

    format!("iqn.{}.local.voe:storage.{}", date_str, sanitized)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DISK_CONFIG: &str = r#"
[target]
name = "iqn.2026-10.local.voe:storage.disk0"
log_level = "debug"

[[extent]]
name = "extent0"
path = "/data/extent0.img"
size = 1048576

[[extent]]
name = "extent1"
path = "/data/extent1.img"
offset = 4096
size = 1048576

[[device]]
name = "device0"
raid = "raid0"
children = ["extent0", "extent1"]

[disk]
blocklen = 4096

[[disk.lun]]
root = "device0"
"#;

    #[test]
    fn test_parse_disk_config() {
        let config = Config::parse(DISK_CONFIG).unwrap();
        assert_eq!(config.target.iqn(), "iqn.2026-10.local.voe:storage.disk0");
        assert_eq!(config.target.log_level, "debug");
        assert_eq!(config.extent.len(), 2);
        assert_eq!(config.extent[1].offset, 4096);
        assert_eq!(config.device[0].raid, RaidLevel::Raid0);

        let disk = config.disk.as_ref().unwrap();
        assert_eq!(disk.blocklen, 4096);
        assert_eq!(disk.lun_count(), 1);
        assert!(config.osd.is_none());
    }

    #[test]
    fn test_parse_osd_config() {
        let config = Config::parse(
            r#"
[osd]
capacity = 64
luns = 2
directory = "/srv/osd"
"#,
        )
        .unwrap();
        let osd = config.osd.as_ref().unwrap();
        assert_eq!(osd.capacity_bytes(), 64 * 1024 * 1024);
        assert_eq!(osd.luns, 2);
        assert_eq!(osd.directory, PathBuf::from("/srv/osd"));
    }

    #[test]
    fn test_generated_iqn() {
        let config = Config::parse("[target]\nalias = \"My Disk\"\n[osd]\n").unwrap();
        let iqn = config.target.iqn();
        assert!(iqn.starts_with("iqn."));
        assert!(iqn.ends_with(".local.voe:storage.my-disk"));
    }

    #[test]
    fn test_engine_required() {
        let result = Config::parse("[target]\nalias = \"x\"\n");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_bad_block_length() {
        let config = DISK_CONFIG.replace("blocklen = 4096", "blocklen = 1000");
        assert!(matches!(Config::parse(&config), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_extent_end_overflow_error() {
        let mut config = Config::parse(DISK_CONFIG).unwrap();
        config.extent[1].offset = u64::MAX - 4096;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_unknown_child_error() {
        let config = DISK_CONFIG.replace("\"extent1\"]", "\"extent9\"]");
        assert!(matches!(Config::parse(&config), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_shared_child_error() {
        let config = format!(
            "{}\n[[device]]\nname = \"device1\"\nraid = \"raid1\"\nchildren = [\"extent0\"]\n",
            DISK_CONFIG
        );
        assert!(matches!(Config::parse(&config), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_cycle_error() {
        let config = r#"
[[extent]]
name = "e"
path = "/data/e"
size = 512

[[device]]
name = "a"
raid = "raid0"
children = ["b"]

[[device]]
name = "b"
raid = "raid0"
children = ["a"]

[disk]
[[disk.lun]]
root = "e"
"#;
        assert!(matches!(Config::parse(config), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_luns_exceeding_roots_error() {
        let config = DISK_CONFIG.replace("blocklen = 4096", "blocklen = 4096\nluns = 2");
        assert!(matches!(Config::parse(&config), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_set_option() {
        let mut config = Config::parse(DISK_CONFIG).unwrap();
        let disk = config.disk.as_mut().unwrap();
        disk.set_option("blocklen", "512").unwrap();
        disk.set_option("blocks", "1000").unwrap();
        assert_eq!(disk.blocklen, 512);
        assert_eq!(disk.blocks, Some(1000));
        assert!(disk.set_option("blocklen", "513").is_err());
        assert!(disk.set_option("blocks", "lots").is_err());
        assert!(disk.set_option("colour", "blue").is_err());

        let mut osd = OsdConfig::default();
        osd.set_option("directory", "/var/osd").unwrap();
        osd.set_option("capacity", "10").unwrap();
        assert_eq!(osd.directory, PathBuf::from("/var/osd"));
        assert_eq!(osd.capacity_bytes(), 10 * 1024 * 1024);
    }
}
