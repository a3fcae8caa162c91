//! Composite devices (RAID0 concatenation, RAID1 mirror)

use super::{resolve_seek, Node, StorageError, StorageResult, SyncMode};
use serde::Deserialize;
use std::fmt;
use std::io::SeekFrom;

/// How a device combines its children
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RaidLevel {
    /// Children laid end to end by cumulative offset
    Raid0,
    /// Every child holds the same bytes
    Raid1,
}

impl fmt::Display for RaidLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RaidLevel::Raid0 => write!(f, "RAID0"),
            RaidLevel::Raid1 => write!(f, "RAID1"),
        }
    }
}

/// A composite node owning an ordered list of children
#[derive(Debug)]
pub struct Device {
    name: String,
    raid: RaidLevel,
    children: Vec<Node>,
    len: u64,
    off: u64,
}

impl Device {
    /// Build a device, checking the RAID geometry of its children.
    pub fn new(name: &str, raid: RaidLevel, children: Vec<Node>) -> StorageResult<Self> {
        if children.is_empty() {
            return Err(StorageError::Geometry(format!("device {} has no children", name)));
        }

        let len = match raid {
            RaidLevel::Raid0 => children
                .iter()
                .try_fold(0u64, |total, child| total.checked_add(child.size()))
                .ok_or_else(|| {
                    StorageError::Geometry(format!(
                        "RAID0 device {}: total size overflows",
                        name
                    ))
                })?,
            RaidLevel::Raid1 => {
                let len = children[0].size();
                if let Some(odd) = children.iter().find(|child| child.size() != len) {
                    return Err(StorageError::Geometry(format!(
                        "RAID1 device {}: child {} is {} bytes, expected {}",
                        name,
                        odd.name(),
                        odd.size(),
                        len
                    )));
                }
                len
            }
        };

        Ok(Self {
            name: name.to_string(),
            raid,
            children,
            len,
            off: 0,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn raid(&self) -> RaidLevel {
        self.raid
    }

    pub fn children(&self) -> &[Node] {
        &self.children
    }

    pub fn size(&self) -> u64 {
        self.len
    }

    pub fn position(&self) -> u64 {
        self.off
    }

    /// Open every child; on failure the ones already opened are closed again.
    pub fn open(&mut self) -> StorageResult<()> {
        for index in 0..self.children.len() {
            if let Err(e) = self.children[index].open() {
                log::error!(
                    "Device {}: failed to open child {}: {}",
                    self.name,
                    self.children[index].name(),
                    e
                );
                for child in &mut self.children[..index] {
                    child.close();
                }
                return Err(e);
            }
        }
        self.off = 0;
        Ok(())
    }

    pub fn close(&mut self) {
        for child in &mut self.children {
            child.close();
        }
    }

    pub fn seek(&mut self, pos: SeekFrom) -> StorageResult<u64> {
        let offset = resolve_seek(pos, self.off, self.len)?;
        match self.raid {
            RaidLevel::Raid0 => {
                let (index, sub) = self.locate(offset)?;
                self.children[index].seek(SeekFrom::Start(sub))?;
            }
            RaidLevel::Raid1 => {
                for child in &mut self.children {
                    child.seek(SeekFrom::Start(offset))?;
                }
            }
        }
        self.off = offset;
        Ok(offset)
    }

    pub fn read(&mut self, buf: &mut [u8]) -> StorageResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        match self.raid {
            RaidLevel::Raid0 => self.read_raid0(buf),
            RaidLevel::Raid1 => {
                let offset = self.off;
                let child = &mut self.children[0];
                child.read_at(offset, buf)?;
                self.off += buf.len() as u64;
                Ok(buf.len())
            }
        }
    }

    pub fn write(&mut self, buf: &[u8]) -> StorageResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        match self.raid {
            RaidLevel::Raid0 => self.write_raid0(buf),
            RaidLevel::Raid1 => {
                let offset = self.off;
                for child in &mut self.children {
                    if let Err(e) = child.write_at(offset, buf) {
                        return Err(StorageError::MirrorFailed {
                            device: self.name.clone(),
                            child: child.name().to_string(),
                            source: Box::new(e),
                        });
                    }
                }
                self.off += buf.len() as u64;
                Ok(buf.len())
            }
        }
    }

    pub fn sync_range(&mut self, how: SyncMode, from: u64, len: u64) -> StorageResult<()> {
        let end = match from.checked_add(len) {
            Some(end) if end <= self.len => end,
            _ => {
                return Err(StorageError::OutOfRange {
                    offset: from,
                    size: self.len,
                })
            }
        };

        match self.raid {
            RaidLevel::Raid0 => {
                let mut pos = from;
                while pos < end {
                    let (index, sub) = self.locate(pos)?;
                    let child = &mut self.children[index];
                    let n = (end - pos).min(child.size() - sub);
                    child.sync_range(how, sub, n)?;
                    pos += n;
                }
                Ok(())
            }
            RaidLevel::Raid1 => {
                for child in &mut self.children {
                    child.sync_range(how, from, len)?;
                }
                Ok(())
            }
        }
    }

    /// Map a logical offset to (child index, offset within child).
    fn locate(&self, offset: u64) -> StorageResult<(usize, u64)> {
        let mut base = 0u64;
        for (index, child) in self.children.iter().enumerate() {
            let size = child.size();
            if offset < base + size {
                return Ok((index, offset - base));
            }
            base += size;
        }
        Err(StorageError::OutOfRange {
            offset,
            size: self.len,
        })
    }

    fn read_raid0(&mut self, buf: &mut [u8]) -> StorageResult<usize> {
        let mut done = 0usize;
        while done < buf.len() {
            let (index, sub) = self.locate(self.off)?;
            let child = &mut self.children[index];
            let n = ((buf.len() - done) as u64).min(child.size() - sub) as usize;

            child.seek(SeekFrom::Start(sub))?;
            let actual = child.read(&mut buf[done..done + n])?;
            if actual != n {
                return Err(StorageError::ShortTransfer {
                    node: child.name().to_string(),
                    expected: n,
                    actual,
                });
            }

            done += n;
            self.off += n as u64;
        }
        Ok(done)
    }

    fn write_raid0(&mut self, buf: &[u8]) -> StorageResult<usize> {
        let mut done = 0usize;
        while done < buf.len() {
            let (index, sub) = self.locate(self.off)?;
            let child = &mut self.children[index];
            let n = ((buf.len() - done) as u64).min(child.size() - sub) as usize;

            child.seek(SeekFrom::Start(sub))?;
            let actual = child.write(&buf[done..done + n])?;
            if actual != n {
                return Err(StorageError::ShortTransfer {
                    node: child.name().to_string(),
                    expected: n,
                    actual,
                });
            }

            done += n;
            self.off += n as u64;
        }
        Ok(done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Extent;
    use tempfile::TempDir;

    fn extent(dir: &TempDir, name: &str, sacred: u64, len: u64) -> Node {
        Node::Extent(Extent::new(name, dir.path().join(name), sacred, len))
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + i / 251) as u8).collect()
    }

    #[test]
    fn test_raid0_size_is_sum() {
        let dir = TempDir::new().unwrap();
        let device = Device::new(
            "device0",
            RaidLevel::Raid0,
            vec![extent(&dir, "e0", 0, 100), extent(&dir, "e1", 0, 300)],
        )
        .unwrap();
        assert_eq!(device.size(), 400);
    }

    #[test]
    fn test_raid0_size_overflow() {
        let dir = TempDir::new().unwrap();
        let half = u64::MAX / 2;
        let result = Device::new(
            "device0",
            RaidLevel::Raid0,
            vec![
                extent(&dir, "e0", 0, half),
                extent(&dir, "e1", 0, half),
                extent(&dir, "e2", 0, half),
            ],
        );
        assert!(matches!(result, Err(StorageError::Geometry(_))));
    }

    #[test]
    fn test_raid1_rejects_mismatched_children() {
        let dir = TempDir::new().unwrap();
        let result = Device::new(
            "mirror",
            RaidLevel::Raid1,
            vec![extent(&dir, "e0", 0, 100), extent(&dir, "e1", 0, 200)],
        );
        assert!(matches!(result, Err(StorageError::Geometry(_))));
    }

    #[test]
    fn test_raid0_matches_concatenated_children() {
        let dir = TempDir::new().unwrap();
        let sizes = [37u64, 100, 1, 64];
        let children = sizes
            .iter()
            .enumerate()
            .map(|(i, &len)| extent(&dir, &format!("e{}", i), 13 * i as u64, len))
            .collect();
        let mut node = Node::Device(Device::new("device0", RaidLevel::Raid0, children).unwrap());
        node.open().unwrap();

        let total = sizes.iter().sum::<u64>() as usize;
        let data = pattern(total);
        node.write_at(0, &data).unwrap();

        // Every offset, every length up to the end, crossing child boundaries.
        for offset in 0..total {
            let len = (total - offset).min(70);
            let mut buf = vec![0u8; len];
            node.read_at(offset as u64, &mut buf).unwrap();
            assert_eq!(buf, &data[offset..offset + len], "offset {}", offset);
        }

        // Children hold the concatenation in order.
        node.close();
        let mut expected_start = 0usize;
        for (i, &len) in sizes.iter().enumerate() {
            let raw = std::fs::read(dir.path().join(format!("e{}", i))).unwrap();
            let sacred = 13 * i;
            assert_eq!(
                &raw[sacred..sacred + len as usize],
                &data[expected_start..expected_start + len as usize]
            );
            expected_start += len as usize;
        }
    }

    #[test]
    fn test_raid0_nested_device() {
        let dir = TempDir::new().unwrap();
        let inner = Node::Device(
            Device::new(
                "inner",
                RaidLevel::Raid0,
                vec![extent(&dir, "a", 0, 10), extent(&dir, "b", 0, 10)],
            )
            .unwrap(),
        );
        let mut outer = Node::Device(
            Device::new("outer", RaidLevel::Raid0, vec![inner, extent(&dir, "c", 0, 10)]).unwrap(),
        );
        outer.open().unwrap();

        let data = pattern(30);
        outer.write_at(0, &data).unwrap();
        let mut buf = vec![0u8; 15];
        outer.read_at(8, &mut buf).unwrap();
        assert_eq!(buf, &data[8..23]);
        assert_eq!(outer.position(), 23);
    }

    #[test]
    fn test_raid0_out_of_range() {
        let dir = TempDir::new().unwrap();
        let mut node = Node::Device(
            Device::new(
                "device0",
                RaidLevel::Raid0,
                vec![extent(&dir, "e0", 0, 10), extent(&dir, "e1", 0, 10)],
            )
            .unwrap(),
        );
        node.open().unwrap();

        assert!(matches!(
            node.seek(SeekFrom::Start(20)),
            Err(StorageError::OutOfRange { offset: 20, size: 20 })
        ));

        // A read running off the end fails instead of returning short.
        let mut buf = vec![0u8; 8];
        assert!(node.read_at(15, &mut buf).is_err());
    }

    #[test]
    fn test_raid1_mirror_consistency() {
        let dir = TempDir::new().unwrap();
        let mut node = Node::Device(
            Device::new(
                "mirror",
                RaidLevel::Raid1,
                vec![
                    extent(&dir, "m0", 0, 256),
                    extent(&dir, "m1", 64, 256),
                    extent(&dir, "m2", 7, 256),
                ],
            )
            .unwrap(),
        );
        node.open().unwrap();
        assert_eq!(node.size(), 256);

        let data = pattern(100);
        node.write_at(50, &data).unwrap();

        let mut buf = vec![0u8; 100];
        node.read_at(50, &mut buf).unwrap();
        assert_eq!(buf, data);

        if let Node::Device(device) = &mut node {
            for child in device.children.iter_mut() {
                let mut copy = vec![0u8; 100];
                child.read_at(50, &mut copy).unwrap();
                assert_eq!(copy, data, "child {}", child.name());
            }
        }
    }

    #[test]
    fn test_raid1_write_fails_if_any_child_fails() {
        let dir = TempDir::new().unwrap();
        let mut device = Device::new(
            "mirror",
            RaidLevel::Raid1,
            vec![extent(&dir, "m0", 0, 64), extent(&dir, "m1", 0, 64)],
        )
        .unwrap();
        device.open().unwrap();
        device.children[1].close();

        let result = device.write(&[1u8; 16]);
        assert!(matches!(result, Err(StorageError::MirrorFailed { .. })));
    }

    #[test]
    fn test_open_failure_closes_siblings() {
        let dir = TempDir::new().unwrap();
        let good = extent(&dir, "good", 0, 64);
        let bad = Node::Extent(Extent::new("bad", dir.path().join("missing/dir/bad"), 0, 64));
        let mut device = Device::new("device0", RaidLevel::Raid0, vec![good, bad]).unwrap();

        assert!(device.open().is_err());
        match &device.children[0] {
            Node::Extent(extent) => assert!(!extent.is_open()),
            Node::Device(_) => unreachable!(),
        }
    }

    #[test]
    fn test_sync_range_across_children() {
        let dir = TempDir::new().unwrap();
        let mut node = Node::Device(
            Device::new(
                "device0",
                RaidLevel::Raid0,
                vec![extent(&dir, "e0", 0, 512), extent(&dir, "e1", 0, 512)],
            )
            .unwrap(),
        );
        node.open().unwrap();
        node.write_at(0, &pattern(1024)).unwrap();

        node.sync_range(SyncMode::Data, 256, 512).unwrap();
        node.sync_range(SyncMode::File, 0, 1024).unwrap();
        assert!(node.sync_range(SyncMode::Data, 1000, 100).is_err());
    }
}
