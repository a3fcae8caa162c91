//! Directory-backed object store for one OSD LUN
//!
//! ```text
//! <root>/0x<GroupID>/                   group
//! <root>/0x<GroupID>/0x<UserID>         object body
//! <root>/0x<GroupID>/0x<UserID>.0x<page>.<index>   attribute value
//! ```

use super::OsdError;
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Draws before ID allocation gives up
pub const MAX_ID_ATTEMPTS: usize = 16;

/// Length of a vendor attribute blob
pub const VENDOR_ATTRIBUTE_LEN: usize = 480;

/// Attribute pages understood by the store
pub mod attr_page {
    /// Group information page; index 1 is the GroupID (4 bytes)
    pub const GROUP_INFO: u32 = 0x4000_0001;
    /// Object information page; index 1 GroupID (4 bytes), index 2 UserID (8 bytes)
    pub const OBJECT_INFO: u32 = 0x0000_0001;
    /// Opaque vendor blob stored beside the object
    pub const VENDOR: u32 = 0x3000_0000;
}

/// Value length of a built-in attribute; `None` for vendor blobs, whose
/// length is whatever was stored.
pub fn attribute_len(page: u32, index: u32) -> Result<Option<usize>, OsdError> {
    match (page, index) {
        (attr_page::GROUP_INFO, 1) | (attr_page::OBJECT_INFO, 1) => Ok(Some(4)),
        (attr_page::OBJECT_INFO, 2) => Ok(Some(8)),
        (attr_page::VENDOR, _) => Ok(None),
        _ => Err(OsdError::UnsupportedAttribute { page, index }),
    }
}

/// Objects of one LUN, rooted at `<directory>/lun_<n>`
#[derive(Debug)]
pub struct ObjectStore {
    root: PathBuf,
    capacity: u64,
}

impl ObjectStore {
    /// Open the store, creating its directory if needed.
    pub fn open<P: AsRef<Path>>(root: P, capacity: u64) -> io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root, capacity })
    }

    fn group_path(&self, group_id: u32) -> PathBuf {
        self.root.join(format!("0x{:x}", group_id))
    }

    fn object_path(&self, group_id: u32, user_id: u64) -> PathBuf {
        self.group_path(group_id).join(format!("0x{:x}", user_id))
    }

    fn attribute_path(&self, group_id: u32, user_id: u64, page: u32, index: u32) -> PathBuf {
        self.group_path(group_id)
            .join(format!("0x{:x}.0x{:x}.{}", user_id, page, index))
    }

    /// Create a group; a zero ID asks for a random one.
    pub fn create_group(&self, requested: u32) -> Result<u32, OsdError> {
        if requested != 0 {
            create_group_dir(&self.group_path(requested), requested)?;
            return Ok(requested);
        }

        for _ in 0..MAX_ID_ATTEMPTS {
            let group_id = random_id();
            match create_group_dir(&self.group_path(group_id), group_id) {
                Ok(()) => return Ok(group_id),
                Err(OsdError::AlreadyExists(_)) => {
                    log::debug!("GroupID 0x{:x} taken, redrawing", group_id);
                }
                Err(e) => return Err(e),
            }
        }
        Err(OsdError::IdSpaceExhausted {
            attempts: MAX_ID_ATTEMPTS,
        })
    }

    /// Remove an empty group.
    pub fn remove_group(&self, group_id: u32) -> Result<(), OsdError> {
        fs::remove_dir(self.group_path(group_id))
            .map_err(|e| missing(e, || format!("group 0x{:x}", group_id)))
    }

    /// Create an object in a group; a zero ID asks for a random one.
    pub fn create(&self, group_id: u32, requested: u64) -> Result<u64, OsdError> {
        if !self.group_path(group_id).is_dir() {
            return Err(OsdError::NotFound(format!("group 0x{:x}", group_id)));
        }

        if requested != 0 {
            self.create_object_file(group_id, requested)?;
            return Ok(requested);
        }

        for _ in 0..MAX_ID_ATTEMPTS {
            let user_id = u64::from(random_id());
            match self.create_object_file(group_id, user_id) {
                Ok(()) => return Ok(user_id),
                Err(OsdError::AlreadyExists(_)) => {
                    log::debug!("UserID 0x{:x} taken, redrawing", user_id);
                }
                Err(e) => return Err(e),
            }
        }
        Err(OsdError::IdSpaceExhausted {
            attempts: MAX_ID_ATTEMPTS,
        })
    }

    fn create_object_file(&self, group_id: u32, user_id: u64) -> Result<(), OsdError> {
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.object_path(group_id, user_id))
        {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(OsdError::AlreadyExists(
                format!("object 0x{:x}/0x{:x}", group_id, user_id),
            )),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove an object and every attribute stored for it.
    pub fn remove(&self, group_id: u32, user_id: u64) -> Result<(), OsdError> {
        let object = self.object_path(group_id, user_id);
        if !object.is_file() {
            return Err(OsdError::NotFound(format!(
                "object 0x{:x}/0x{:x}",
                group_id, user_id
            )));
        }

        let prefix = format!("0x{:x}.", user_id);
        for entry in fs::read_dir(self.group_path(group_id))? {
            let entry = entry?;
            if entry.file_name().to_string_lossy().starts_with(&prefix) {
                log::debug!("removing attribute {}", entry.path().display());
                fs::remove_file(entry.path())?;
            }
        }

        fs::remove_file(object)?;
        Ok(())
    }

    /// Write `data` at `offset` within an object.
    pub fn write(
        &self,
        group_id: u32,
        user_id: u64,
        offset: u64,
        data: &[u8],
    ) -> Result<(), OsdError> {
        let end = offset.checked_add(data.len() as u64);
        match end {
            Some(end) if end <= self.capacity => {}
            _ => {
                return Err(OsdError::CapacityExceeded {
                    end: end.unwrap_or(u64::MAX),
                    capacity: self.capacity,
                })
            }
        }

        let mut file = self.open_object(group_id, user_id, true)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    /// Read up to `len` bytes at `offset`; reads stop at the end of the object.
    pub fn read(
        &self,
        group_id: u32,
        user_id: u64,
        offset: u64,
        len: usize,
    ) -> Result<Vec<u8>, OsdError> {
        let mut file = self.open_object(group_id, user_id, false)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut data = Vec::with_capacity(len);
        file.take(len as u64).read_to_end(&mut data)?;
        Ok(data)
    }

    fn open_object(&self, group_id: u32, user_id: u64, write: bool) -> Result<File, OsdError> {
        OpenOptions::new()
            .read(!write)
            .write(write)
            .open(self.object_path(group_id, user_id))
            .map_err(|e| missing(e, || format!("object 0x{:x}/0x{:x}", group_id, user_id)))
    }

    /// Value of an attribute.
    pub fn get_attr(
        &self,
        group_id: u32,
        user_id: u64,
        page: u32,
        index: u32,
    ) -> Result<Vec<u8>, OsdError> {
        match (page, index) {
            (attr_page::GROUP_INFO, 1) => {
                if !self.group_path(group_id).is_dir() {
                    return Err(OsdError::NotFound(format!("group 0x{:x}", group_id)));
                }
                Ok(group_id.to_be_bytes().to_vec())
            }
            (attr_page::OBJECT_INFO, 1 | 2) => {
                if !self.object_path(group_id, user_id).is_file() {
                    return Err(OsdError::NotFound(format!(
                        "object 0x{:x}/0x{:x}",
                        group_id, user_id
                    )));
                }
                if index == 1 {
                    Ok(group_id.to_be_bytes().to_vec())
                } else {
                    Ok(user_id.to_be_bytes().to_vec())
                }
            }
            (attr_page::VENDOR, _) => fs::read(self.attribute_path(group_id, user_id, page, index))
                .map_err(|e| {
                    missing(e, || {
                        format!("attribute 0x{:x}/{} of 0x{:x}", page, index, user_id)
                    })
                }),
            _ => Err(OsdError::UnsupportedAttribute { page, index }),
        }
    }

    /// Store an attribute value; only the vendor page is writable.
    pub fn set_attr(
        &self,
        group_id: u32,
        user_id: u64,
        page: u32,
        index: u32,
        value: &[u8],
    ) -> Result<(), OsdError> {
        if page != attr_page::VENDOR {
            return Err(OsdError::UnsupportedAttribute { page, index });
        }
        if value.len() > VENDOR_ATTRIBUTE_LEN {
            return Err(OsdError::AttributeLength {
                expected: VENDOR_ATTRIBUTE_LEN,
                actual: value.len(),
            });
        }
        if !self.object_path(group_id, user_id).is_file() {
            return Err(OsdError::NotFound(format!(
                "object 0x{:x}/0x{:x}",
                group_id, user_id
            )));
        }
        fs::write(self.attribute_path(group_id, user_id, page, index), value)?;
        Ok(())
    }
}

fn create_group_dir(path: &Path, group_id: u32) -> Result<(), OsdError> {
    match fs::create_dir(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(OsdError::AlreadyExists(format!(
            "group 0x{:x}",
            group_id
        ))),
        Err(e) => Err(e.into()),
    }
}

/// Non-zero pseudo-random 32-bit ID
fn random_id() -> u32 {
    loop {
        let id = rand::random::<u32>();
        if id != 0 {
            return id;
        }
    }
}

fn missing<F: FnOnce() -> String>(e: io::Error, what: F) -> OsdError {
    if e.kind() == ErrorKind::NotFound {
        OsdError::NotFound(what())
    } else {
        OsdError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> ObjectStore {
        ObjectStore::open(dir.path().join("lun_0"), 1024 * 1024).unwrap()
    }

    #[test]
    fn test_layout() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let group = store.create_group(0x10).unwrap();
        let user = store.create(group, 0xab).unwrap();
        store.set_attr(group, user, attr_page::VENDOR, 3, b"blob").unwrap();

        let group_dir = dir.path().join("lun_0").join("0x10");
        assert!(group_dir.join("0xab").is_file());
        assert!(group_dir.join("0xab.0x30000000.3").is_file());
    }

    #[test]
    fn test_random_ids() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let group = store.create_group(0).unwrap();
        assert_ne!(group, 0);
        let user = store.create(group, 0).unwrap();
        assert_ne!(user, 0);
        assert!(user <= u64::from(u32::MAX));
        assert_ne!(store.create(group, 0).unwrap(), user);
    }

    #[test]
    fn test_explicit_id_collision() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.create_group(5).unwrap();
        assert!(matches!(
            store.create_group(5),
            Err(OsdError::AlreadyExists(_))
        ));
        store.create(5, 9).unwrap();
        assert!(matches!(store.create(5, 9), Err(OsdError::AlreadyExists(_))));
    }

    #[test]
    fn test_create_in_missing_group() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        assert!(matches!(store.create(77, 0), Err(OsdError::NotFound(_))));
    }

    #[test]
    fn test_write_read() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.create_group(1).unwrap();
        store.create(1, 2).unwrap();
        store.write(1, 2, 100, b"object data").unwrap();

        assert_eq!(store.read(1, 2, 100, 11).unwrap(), b"object data");
        assert_eq!(store.read(1, 2, 0, 4).unwrap(), [0u8; 4]);
        // Stops at the end of the object.
        assert_eq!(store.read(1, 2, 107, 100).unwrap(), b"data");
    }

    #[test]
    fn test_write_past_capacity() {
        let dir = TempDir::new().unwrap();
        let store = ObjectStore::open(dir.path(), 16).unwrap();
        store.create_group(1).unwrap();
        store.create(1, 1).unwrap();
        store.write(1, 1, 8, &[1u8; 8]).unwrap();
        assert!(matches!(
            store.write(1, 1, 9, &[1u8; 8]),
            Err(OsdError::CapacityExceeded { end: 17, capacity: 16 })
        ));
    }

    #[test]
    fn test_remove_cascades_attributes() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.create_group(1).unwrap();
        store.create(1, 0x2).unwrap();
        store.create(1, 0x22).unwrap();
        store.set_attr(1, 0x2, attr_page::VENDOR, 1, &[7u8; 480]).unwrap();
        store.set_attr(1, 0x2, attr_page::VENDOR, 2, &[8u8; 10]).unwrap();
        store.set_attr(1, 0x22, attr_page::VENDOR, 1, &[9u8; 10]).unwrap();

        store.remove(1, 0x2).unwrap();

        let names: Vec<String> = fs::read_dir(store.group_path(1))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert!(names.iter().all(|n| !n.starts_with("0x2.") && n != "0x2"));
        assert!(names.contains(&"0x22".to_string()));
        assert!(names.contains(&"0x22.0x30000000.1".to_string()));

        assert!(matches!(
            store.get_attr(1, 0x2, attr_page::OBJECT_INFO, 2),
            Err(OsdError::NotFound(_))
        ));
        assert!(matches!(store.remove(1, 0x2), Err(OsdError::NotFound(_))));
    }

    #[test]
    fn test_info_attributes() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.create_group(0x44).unwrap();
        store.create(0x44, 0x55).unwrap();
        assert_eq!(
            store.get_attr(0x44, 0, attr_page::GROUP_INFO, 1).unwrap(),
            0x44u32.to_be_bytes()
        );
        assert_eq!(
            store.get_attr(0x44, 0x55, attr_page::OBJECT_INFO, 1).unwrap(),
            0x44u32.to_be_bytes()
        );
        assert_eq!(
            store.get_attr(0x44, 0x55, attr_page::OBJECT_INFO, 2).unwrap(),
            0x55u64.to_be_bytes()
        );
        assert!(matches!(
            store.get_attr(0x44, 0x55, 0x9, 1),
            Err(OsdError::UnsupportedAttribute { page: 0x9, index: 1 })
        ));

        // Built-in values always have their fixed length.
        for (page, index) in [
            (attr_page::GROUP_INFO, 1),
            (attr_page::OBJECT_INFO, 1),
            (attr_page::OBJECT_INFO, 2),
        ] {
            let value = store.get_attr(0x44, 0x55, page, index).unwrap();
            assert_eq!(attribute_len(page, index).unwrap(), Some(value.len()));
        }
        assert_eq!(attribute_len(attr_page::VENDOR, 7).unwrap(), None);
        assert!(attribute_len(attr_page::GROUP_INFO, 2).is_err());
    }

    #[test]
    fn test_vendor_attribute_limits() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.create_group(1).unwrap();
        store.create(1, 1).unwrap();
        assert!(matches!(
            store.set_attr(1, 1, attr_page::VENDOR, 1, &[0u8; 481]),
            Err(OsdError::AttributeLength { .. })
        ));
        assert!(matches!(
            store.set_attr(1, 1, attr_page::OBJECT_INFO, 2, &[0u8; 8]),
            Err(OsdError::UnsupportedAttribute { .. })
        ));
        assert!(matches!(
            store.get_attr(1, 1, attr_page::VENDOR, 4),
            Err(OsdError::NotFound(_))
        ));
    }

    #[test]
    fn test_remove_group() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.create_group(3).unwrap();
        store.create(3, 4).unwrap();
        assert!(matches!(store.remove_group(3), Err(OsdError::Io(_))));
        store.remove(3, 4).unwrap();
        store.remove_group(3).unwrap();
        assert!(matches!(store.remove_group(3), Err(OsdError::NotFound(_))));
    }
}
