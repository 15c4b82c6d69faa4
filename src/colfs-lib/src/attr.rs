use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::{FsError, FsResult};

pub const S_IFMT: u32 = 0o170000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFLNK: u32 = 0o120000;

pub const PERM_MASK: u32 = 0o7777;

/// Sentinel uid/gid meaning "leave unchanged" in chown. The kernel cannot
/// express a negative id, so all-ones is reserved for it.
pub const CHOWN_KEEP: u32 = u32::MAX;

/// Current wall clock as (seconds, nanoseconds) since the epoch.
pub fn unix_now() -> (u64, u32) {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    (now.as_secs(), now.subsec_nanos())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct EntryOwner {
    pub uid: u32,
    pub gid: u32,
}

/// POSIX attributes as they are serialized into the metadata column.
/// The field names are part of the storage format and must not change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct EntryAttr {
    pub ino: u64,
    pub size: u64,
    pub blocks: u64,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
    pub atimensec: u32,
    pub mtimensec: u32,
    pub ctimensec: u32,
    pub mode: u32,
    pub nlink: u32,
    pub owner: EntryOwner,
    pub rdev: u32,
    pub blksize: u32,
    pub padding: u32,
}

impl EntryAttr {
    fn stamped(mode: u32, nlink: u32, uid: u32, gid: u32) -> Self {
        let (secs, nsec) = unix_now();
        Self {
            atime: secs,
            mtime: secs,
            ctime: secs,
            atimensec: nsec,
            mtimensec: nsec,
            ctimensec: nsec,
            mode,
            nlink,
            owner: EntryOwner { uid, gid },
            blksize: 4096,
            ..Default::default()
        }
    }

    pub fn new_file(perm: u32, uid: u32, gid: u32) -> Self {
        Self::stamped(S_IFREG | (perm & PERM_MASK), 1, uid, gid)
    }

    pub fn new_dir(perm: u32, uid: u32, gid: u32) -> Self {
        Self::stamped(S_IFDIR | (perm & PERM_MASK), 2, uid, gid)
    }

    pub fn new_symlink(uid: u32, gid: u32) -> Self {
        Self::stamped(S_IFLNK | 0o777, 1, uid, gid)
    }

    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & S_IFMT == S_IFLNK
    }

    pub fn is_regular(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    /// Replace the permission bits, keeping the file-type bits.
    pub fn set_perm(&mut self, mode: u32) {
        self.mode = (self.mode & !PERM_MASK) | (mode & PERM_MASK);
    }
}

/// The metadata blob stored next to the hash in every namespace row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EntryMeta {
    #[serde(rename = "Attr")]
    pub attr: EntryAttr,
    #[serde(rename = "XAttr", skip_serializing_if = "Option::is_none")]
    pub xattr: Option<HashMap<String, String>>,
}

impl EntryMeta {
    pub fn new(attr: EntryAttr) -> Self {
        Self { attr, xattr: None }
    }

    pub fn encode(&self) -> FsResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| FsError::EncodeError(format!("metadata encode failed: {}", e)))
    }

    pub fn decode(data: &[u8]) -> FsResult<Self> {
        serde_json::from_slice(data).map_err(|e| FsError::EncodeError(format!("metadata decode failed: {}", e)))
    }
}
