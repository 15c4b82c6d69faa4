use fuser::{
    FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use libc::{EEXIST, EINVAL, EIO, ENOENT, ENOTDIR, ENOTEMPTY};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::runtime::Runtime;

use colfs_lib::{
    join_path, unix_now, EntryAttr, FsError, FsResult, MountConfig, CHOWN_KEEP, PERM_MASK,
    S_IFDIR, S_IFLNK, S_IFMT,
};
use fs_buffer::FileCache;
use fs_store::{CqlSession, DbSessionRef, FileStore};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/colfs/colfs.json";

const ROOT_INODE: u64 = 1;

/// Upper bound on the kernel reply TTLs; anything longer is a config typo.
const MAX_TTL_SECS: f64 = 86400.0;

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub mountpoint: PathBuf,
    pub config_path: Option<PathBuf>,
    pub overrides: ConfigOverrides,
}

/// Command-line overrides layered on top of the config file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub server: Option<String>,
    pub keyspace: Option<String>,
    pub owner_id: Option<i32>,
    pub environment: Option<String>,
    pub consistency: Option<String>,
    pub entry_ttl_secs: Option<f64>,
    pub negative_ttl_secs: Option<f64>,
    pub fcache_ttl_secs: Option<u64>,
    pub cache_enabled: Option<bool>,
    pub cache_size_bytes: Option<u64>,
}

impl ConfigOverrides {
    fn apply(&self, config: &mut MountConfig) {
        if let Some(server) = &self.server {
            config.server = server.clone();
        }
        if let Some(keyspace) = &self.keyspace {
            config.keyspace = keyspace.clone();
        }
        if let Some(owner_id) = self.owner_id {
            config.owner_id = owner_id;
        }
        if let Some(environment) = &self.environment {
            config.environment = environment.clone();
        }
        if let Some(consistency) = &self.consistency {
            config.consistency = consistency.clone();
        }
        if let Some(entry_ttl) = self.entry_ttl_secs {
            config.entry_ttl_secs = entry_ttl;
        }
        if let Some(negative_ttl) = self.negative_ttl_secs {
            config.negative_ttl_secs = negative_ttl;
        }
        if let Some(fcache_ttl) = self.fcache_ttl_secs {
            config.fcache_ttl_secs = fcache_ttl;
        }
        if let Some(cache_enabled) = self.cache_enabled {
            config.cache_enabled = cache_enabled;
        }
        if let Some(cache_size) = self.cache_size_bytes {
            config.cache_size_bytes = cache_size;
        }
    }
}

/// Attributes synthesized for the mount root, seeded from the mount-point
/// directory at startup. chmod/chown on the root only touch these values.
#[derive(Debug, Clone, Copy)]
pub struct RootAttrs {
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
}

struct InodeTable {
    next_inode: AtomicU64,
    inode_to_path: RwLock<HashMap<u64, String>>,
    path_to_inode: RwLock<HashMap<String, u64>>,
}

impl InodeTable {
    fn new() -> Self {
        let mut inode_to_path = HashMap::new();
        let mut path_to_inode = HashMap::new();
        inode_to_path.insert(ROOT_INODE, String::new());
        path_to_inode.insert(String::new(), ROOT_INODE);
        Self {
            next_inode: AtomicU64::new(2),
            inode_to_path: RwLock::new(inode_to_path),
            path_to_inode: RwLock::new(path_to_inode),
        }
    }

    fn get_path(&self, inode: u64) -> Option<String> {
        self.inode_to_path.read().ok()?.get(&inode).cloned()
    }

    fn remember(&self, inode: u64, path: String) {
        if let Ok(mut map) = self.inode_to_path.write() {
            map.insert(inode, path.clone());
        }
        if let Ok(mut map) = self.path_to_inode.write() {
            map.insert(path, inode);
        }
    }

    fn get_or_create(&self, path: &str) -> u64 {
        if let Ok(map) = self.path_to_inode.read() {
            if let Some(inode) = map.get(path) {
                return *inode;
            }
        }
        let inode = self.next_inode.fetch_add(1, Ordering::SeqCst);
        self.remember(inode, path.to_string());
        inode
    }

    fn remove_path_recursive(&self, path: &str) {
        let mut inode_to_path = match self.inode_to_path.write() {
            Ok(v) => v,
            Err(_) => return,
        };
        let mut path_to_inode = match self.path_to_inode.write() {
            Ok(v) => v,
            Err(_) => return,
        };

        let prefix = format!("{}/", path);
        let removed: Vec<String> = path_to_inode
            .keys()
            .filter(|candidate| *candidate == path || candidate.starts_with(&prefix))
            .cloned()
            .collect();
        for removed_path in removed {
            if let Some(inode) = path_to_inode.remove(&removed_path) {
                inode_to_path.remove(&inode);
            }
        }
    }

    fn rename_path_recursive(&self, old_path: &str, new_path: &str) {
        let mut inode_to_path = match self.inode_to_path.write() {
            Ok(v) => v,
            Err(_) => return,
        };
        let mut path_to_inode = match self.path_to_inode.write() {
            Ok(v) => v,
            Err(_) => return,
        };

        let old_prefix = format!("{}/", old_path);
        let mut moved: Vec<(String, u64)> = path_to_inode
            .iter()
            .filter_map(|(path, inode)| {
                if path == old_path || path.starts_with(&old_prefix) {
                    Some((path.clone(), *inode))
                } else {
                    None
                }
            })
            .collect();
        if moved.is_empty() {
            return;
        }

        // anything already living under the target path is replaced
        let new_prefix = format!("{}/", new_path);
        let replaced: Vec<String> = path_to_inode
            .keys()
            .filter(|path| *path == new_path || path.starts_with(&new_prefix))
            .cloned()
            .collect();
        for replaced_path in replaced {
            if let Some(inode) = path_to_inode.remove(&replaced_path) {
                inode_to_path.remove(&inode);
            }
        }

        moved.sort_by_key(|(path, _)| path.len());
        for (old, inode) in moved {
            path_to_inode.remove(&old);
            let suffix = old.strip_prefix(old_path).unwrap_or("");
            let new_full_path = format!("{}{}", new_path, suffix);
            path_to_inode.insert(new_full_path.clone(), inode);
            inode_to_path.insert(inode, new_full_path);
        }
    }
}

struct HandleTable {
    next_fh: AtomicU64,
    handles: Mutex<HashMap<u64, fs_buffer::FileHandle>>,
}

impl HandleTable {
    fn new() -> Self {
        Self {
            next_fh: AtomicU64::new(1),
            handles: Mutex::new(HashMap::new()),
        }
    }

    fn insert(&self, handle: fs_buffer::FileHandle) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut map) = self.handles.lock() {
            map.insert(fh, handle);
        }
        fh
    }

    fn with_handle_mut<F, T>(&self, fh: u64, f: F) -> Result<T, i32>
    where
        F: FnOnce(&mut fs_buffer::FileHandle) -> Result<T, i32>,
    {
        let mut map = self.handles.lock().map_err(|_| EIO)?;
        let handle = map.get_mut(&fh).ok_or(libc::EBADF)?;
        f(handle)
    }

    fn remove(&self, fh: u64) -> Option<fs_buffer::FileHandle> {
        self.handles.lock().ok()?.remove(&fh)
    }
}

pub struct ColFs {
    runtime: Runtime,
    store: Arc<FileStore>,
    files: Arc<FileCache>,
    inode_table: InodeTable,
    handle_table: HandleTable,
    root: RwLock<RootAttrs>,
    reply_ttl: Duration,
}

fn system_time(secs: u64, nsec: u32) -> SystemTime {
    UNIX_EPOCH + Duration::new(secs, nsec)
}

fn time_pair(t: SystemTime) -> (u64, u32) {
    let since = t.duration_since(UNIX_EPOCH).unwrap_or_default();
    (since.as_secs(), since.subsec_nanos())
}

fn kind_of(mode: u32) -> FileType {
    match mode & S_IFMT {
        S_IFDIR => FileType::Directory,
        S_IFLNK => FileType::Symlink,
        _ => FileType::RegularFile,
    }
}

fn map_fs_err(err: FsError) -> i32 {
    match err {
        FsError::NotFound(_) => ENOENT,
        FsError::AlreadyExists(_) => EEXIST,
        FsError::NotDirectory(_) => ENOTDIR,
        FsError::NotEmpty(_) => ENOTEMPTY,
        FsError::InvalidParam(_) => EINVAL,
        FsError::IoError(_) | FsError::DbError(_) | FsError::EncodeError(_) => EIO,
    }
}

impl ColFs {
    pub fn new(runtime: Runtime, store: Arc<FileStore>, root: RootAttrs, reply_ttl: Duration) -> Self {
        Self {
            runtime,
            store,
            files: Arc::new(FileCache::new()),
            inode_table: InodeTable::new(),
            handle_table: HandleTable::new(),
            root: RwLock::new(root),
            reply_ttl,
        }
    }

    fn path_from_parent(&self, parent: u64, name: &str) -> Result<String, i32> {
        let parent_path = self.inode_table.get_path(parent).ok_or(ENOENT)?;
        Ok(join_path(&parent_path, name))
    }

    fn build_attr(&self, ino: u64, attr: &EntryAttr) -> FileAttr {
        FileAttr {
            ino,
            size: attr.size,
            blocks: attr.blocks,
            atime: system_time(attr.atime, attr.atimensec),
            mtime: system_time(attr.mtime, attr.mtimensec),
            ctime: system_time(attr.ctime, attr.ctimensec),
            crtime: system_time(attr.ctime, attr.ctimensec),
            kind: kind_of(attr.mode),
            perm: (attr.mode & PERM_MASK) as u16,
            nlink: attr.nlink.max(1),
            uid: attr.owner.uid,
            gid: attr.owner.gid,
            rdev: attr.rdev,
            blksize: if attr.blksize == 0 { 4096 } else { attr.blksize },
            flags: 0,
        }
    }

    fn root_attr(&self) -> FileAttr {
        let root = match self.root.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        };
        FileAttr {
            ino: ROOT_INODE,
            size: 0,
            blocks: 0,
            atime: UNIX_EPOCH,
            mtime: UNIX_EPOCH,
            ctime: UNIX_EPOCH,
            crtime: UNIX_EPOCH,
            kind: FileType::Directory,
            perm: (root.mode & PERM_MASK) as u16,
            nlink: 2,
            uid: root.uid,
            gid: root.gid,
            rdev: 0,
            blksize: 4096,
            flags: 0,
        }
    }

    fn getattr_path(&self, path: &str) -> Result<(u64, FileAttr), i32> {
        if path.is_empty() {
            return Ok((ROOT_INODE, self.root_attr()));
        }
        let record = self
            .runtime
            .block_on(self.store.get_filedata(path))
            .map_err(map_fs_err)?;
        let ino = self.inode_table.get_or_create(path);
        Ok((ino, self.build_attr(ino, &record.meta.attr)))
    }

    pub(crate) fn lookup_entry(&self, parent: u64, name: &str) -> Result<(u64, FileAttr), i32> {
        let path = self.path_from_parent(parent, name)?;
        self.getattr_path(&path)
    }

    pub(crate) fn getattr_entry(&self, ino: u64) -> Result<(u64, FileAttr), i32> {
        let path = self.inode_table.get_path(ino).ok_or(ENOENT)?;
        self.getattr_path(&path)
    }

    pub(crate) fn readdir_entries(
        &self,
        ino: u64,
        offset: i64,
    ) -> Result<Vec<(u64, FileType, String, i64)>, i32> {
        let path = self.inode_table.get_path(ino).ok_or(ENOENT)?;
        let listing = self
            .runtime
            .block_on(self.store.list_directory(&path))
            .map_err(map_fs_err)?;

        let mut out = Vec::new();
        let mut idx = offset;
        if offset == 0 {
            out.push((ino, FileType::Directory, ".".to_string(), 1));
            out.push((ino, FileType::Directory, "..".to_string(), 2));
            idx = 2;
        }
        for (mode, name) in listing.into_iter().skip((idx - 2).max(0) as usize) {
            let child_path = join_path(&path, &name);
            let child_ino = self.inode_table.get_or_create(&child_path);
            idx += 1;
            out.push((child_ino, kind_of(mode), name, idx));
        }
        Ok(out)
    }

    pub(crate) fn mkdir_path(&self, parent: u64, name: &str, mode: u32, uid: u32, gid: u32) -> Result<FileAttr, i32> {
        let path = self.path_from_parent(parent, name)?;
        match self.runtime.block_on(self.store.get_filedata(&path)) {
            Ok(_) => return Err(EEXIST),
            Err(FsError::NotFound(_)) => {}
            Err(err) => return Err(map_fs_err(err)),
        }
        let attr = EntryAttr::new_dir(mode, uid, gid);
        self.runtime
            .block_on(self.store.make_directory(&path, &attr))
            .map_err(map_fs_err)?;
        let ino = self.inode_table.get_or_create(&path);
        Ok(self.build_attr(ino, &attr))
    }

    pub(crate) fn rmdir_path(&self, parent: u64, name: &str) -> Result<(), i32> {
        let path = self.path_from_parent(parent, name)?;
        let record = self
            .runtime
            .block_on(self.store.get_filedata(&path))
            .map_err(map_fs_err)?;
        if !record.meta.attr.is_dir() {
            return Err(ENOTDIR);
        }
        let children = self
            .runtime
            .block_on(self.store.list_directory(&path))
            .map_err(map_fs_err)?;
        if !children.is_empty() {
            return Err(ENOTEMPTY);
        }
        self.runtime
            .block_on(self.store.delete_file(&path))
            .map_err(map_fs_err)?;
        self.store.evict_dir(&path);
        self.inode_table.remove_path_recursive(&path);
        Ok(())
    }

    pub(crate) fn create_file_op(
        &self,
        parent: u64,
        name: &str,
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> Result<(FileAttr, u64), i32> {
        let path = self.path_from_parent(parent, name)?;
        let attr = EntryAttr::new_file(mode, uid, gid);
        let handle = self
            .runtime
            .block_on(self.files.create(&self.store, &path, attr))
            .map_err(map_fs_err)?;
        let ino = self.inode_table.get_or_create(&path);
        let reply_attr = self.build_attr(ino, &handle.attr());
        let fh = self.handle_table.insert(handle);
        Ok((reply_attr, fh))
    }

    pub(crate) fn open_file_op(&self, ino: u64) -> Result<u64, i32> {
        let path = self.inode_table.get_path(ino).ok_or(ENOENT)?;
        if path.is_empty() {
            return Err(libc::EISDIR);
        }
        let handle = self
            .runtime
            .block_on(self.files.open(&self.store, &path))
            .map_err(map_fs_err)?;
        Ok(self.handle_table.insert(handle))
    }

    pub(crate) fn read_op(&self, fh: u64, offset: i64, size: u32) -> Result<Vec<u8>, i32> {
        self.handle_table
            .with_handle_mut(fh, |handle| Ok(handle.read(offset.max(0) as u64, size)))
    }

    pub(crate) fn write_op(&self, fh: u64, offset: i64, data: &[u8]) -> Result<u32, i32> {
        self.handle_table
            .with_handle_mut(fh, |handle| Ok(handle.write(data, offset.max(0) as u64)))
    }

    pub(crate) fn flush_op(&self, fh: u64) -> Result<(), i32> {
        self.handle_table.with_handle_mut(fh, |handle| {
            self.runtime
                .block_on(handle.flush(&self.store))
                .map_err(map_fs_err)
        })
    }

    pub(crate) fn release_op(&self, fh: u64) -> Result<(), i32> {
        if let Some(handle) = self.handle_table.remove(fh) {
            self.runtime
                .block_on(self.files.release(&self.store, handle))
                .map_err(map_fs_err)?;
        }
        Ok(())
    }

    pub(crate) fn unlink_path(&self, parent: u64, name: &str) -> Result<(), i32> {
        let path = self.path_from_parent(parent, name)?;
        self.runtime
            .block_on(self.store.delete_file(&path))
            .map_err(map_fs_err)?;
        self.inode_table.remove_path_recursive(&path);
        Ok(())
    }

    pub(crate) fn symlink_op(
        &self,
        parent: u64,
        name: &str,
        target: &str,
        uid: u32,
        gid: u32,
    ) -> Result<FileAttr, i32> {
        let path = self.path_from_parent(parent, name)?;
        let mut attr = EntryAttr::new_symlink(uid, gid);
        attr.size = target.len() as u64;
        // the target bytes live in the hash column; no body row is written
        self.runtime
            .block_on(self.store.create_file(&path, &attr, target.as_bytes()))
            .map_err(map_fs_err)?;
        let ino = self.inode_table.get_or_create(&path);
        Ok(self.build_attr(ino, &attr))
    }

    pub(crate) fn readlink_op(&self, ino: u64) -> Result<Vec<u8>, i32> {
        let path = self.inode_table.get_path(ino).ok_or(ENOENT)?;
        let record = self
            .runtime
            .block_on(self.store.get_filedata(&path))
            .map_err(map_fs_err)?;
        Ok(record.hash)
    }

    pub(crate) fn link_op(&self, ino: u64, newparent: u64, newname: &str) -> Result<(u64, FileAttr), i32> {
        let src = self.inode_table.get_path(ino).ok_or(ENOENT)?;
        let dst = self.path_from_parent(newparent, newname)?;
        self.runtime
            .block_on(self.store.copy_file(&src, &dst))
            .map_err(map_fs_err)?;
        self.getattr_path(&dst)
    }

    pub(crate) fn rename_op(
        &self,
        parent: u64,
        name: &str,
        newparent: u64,
        newname: &str,
    ) -> Result<(), i32> {
        let old_path = self.path_from_parent(parent, name)?;
        let new_path = self.path_from_parent(newparent, newname)?;
        let (_, attr) = self.getattr_path(&old_path)?;
        self.runtime
            .block_on(self.store.rename(&old_path, &new_path))
            .map_err(map_fs_err)?;
        if attr.kind == FileType::Directory {
            // children stay keyed by the directory's UUID; drop stale
            // resolved prefixes so the new path re-resolves
            self.store.evict_dir(&old_path);
        }
        self.inode_table.rename_path_recursive(&old_path, &new_path);
        Ok(())
    }

    pub(crate) fn statfs_op(&self) -> Result<u64, i32> {
        self.runtime
            .block_on(self.store.file_count())
            .map_err(map_fs_err)
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn setattr_entry(
        &self,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<(u64, u32)>,
        mtime: Option<(u64, u32)>,
        fh: Option<u64>,
    ) -> Result<FileAttr, i32> {
        let path = self.inode_table.get_path(ino).ok_or(ENOENT)?;

        if path.is_empty() {
            let mut root = self.root.write().map_err(|_| EIO)?;
            if let Some(mode) = mode {
                root.mode = (root.mode & !PERM_MASK) | (mode & PERM_MASK);
            }
            if let Some(uid) = uid {
                root.uid = uid;
            }
            if let Some(gid) = gid {
                root.gid = gid;
            }
            drop(root);
            return Ok(self.root_attr());
        }

        if let Some(new_size) = size {
            // truncation is only offered through an open handle
            let Some(fh) = fh else { return Err(EINVAL) };
            self.handle_table
                .with_handle_mut(fh, |handle| handle.truncate(new_size).map_err(map_fs_err))?;
        }

        let wants_meta =
            mode.is_some() || uid.is_some() || gid.is_some() || atime.is_some() || mtime.is_some();
        if wants_meta {
            if let Some(fh) = fh {
                self.handle_table.with_handle_mut(fh, |handle| {
                    if let Some(mode) = mode {
                        self.runtime
                            .block_on(handle.chmod(&self.store, mode))
                            .map_err(map_fs_err)?;
                    }
                    if uid.is_some() || gid.is_some() {
                        self.runtime
                            .block_on(handle.chown(
                                &self.store,
                                uid.unwrap_or(CHOWN_KEEP),
                                gid.unwrap_or(CHOWN_KEEP),
                            ))
                            .map_err(map_fs_err)?;
                    }
                    if atime.is_some() || mtime.is_some() {
                        let attr = handle.attr();
                        let atime = atime.unwrap_or((attr.atime, attr.atimensec));
                        let mtime = mtime.unwrap_or((attr.mtime, attr.mtimensec));
                        self.runtime
                            .block_on(handle.utimens(&self.store, atime, mtime))
                            .map_err(map_fs_err)?;
                    }
                    Ok(())
                })?;
            } else {
                let mut record = self
                    .runtime
                    .block_on(self.store.get_filedata(&path))
                    .map_err(map_fs_err)?;
                if let Some(mode) = mode {
                    record.meta.attr.set_perm(mode);
                }
                if let Some(uid) = uid {
                    if uid != CHOWN_KEEP {
                        record.meta.attr.owner.uid = uid;
                    }
                }
                if let Some(gid) = gid {
                    if gid != CHOWN_KEEP {
                        record.meta.attr.owner.gid = gid;
                    }
                }
                if let Some((secs, nsec)) = atime {
                    record.meta.attr.atime = secs;
                    record.meta.attr.atimensec = nsec;
                }
                if let Some((secs, nsec)) = mtime {
                    record.meta.attr.mtime = secs;
                    record.meta.attr.mtimensec = nsec;
                }
                self.runtime
                    .block_on(self.store.write_metadata(&path, &record.meta))
                    .map_err(map_fs_err)?;
            }
        }

        if let Some(fh) = fh {
            let attr = self.handle_table.with_handle_mut(fh, |handle| Ok(handle.attr()))?;
            return Ok(self.build_attr(ino, &attr));
        }
        self.getattr_entry(ino).map(|(_, attr)| attr)
    }
}

impl Filesystem for ColFs {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &std::ffi::OsStr, reply: ReplyEntry) {
        let name = match name.to_str() {
            Some(v) => v,
            None => {
                reply.error(EINVAL);
                return;
            }
        };
        match self.lookup_entry(parent, name) {
            Ok((_ino, attr)) => reply.entry(&self.reply_ttl, &attr, 0),
            Err(code) => reply.error(code),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        match self.getattr_entry(ino) {
            Ok((_ino, attr)) => reply.attr(&self.reply_ttl, &attr),
            Err(code) => reply.error(code),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        debug!(
            "setattr ino={} mode={:?} uid={:?} gid={:?} size={:?} fh={:?}",
            ino, mode, uid, gid, size, fh
        );
        let now = unix_now();
        let atime = atime.map(|v| match v {
            TimeOrNow::SpecificTime(t) => time_pair(t),
            TimeOrNow::Now => now,
        });
        let mtime = mtime.map(|v| match v {
            TimeOrNow::SpecificTime(t) => time_pair(t),
            TimeOrNow::Now => now,
        });
        match self.setattr_entry(ino, mode, uid, gid, size, atime, mtime, fh) {
            Ok(attr) => reply.attr(&self.reply_ttl, &attr),
            Err(code) => reply.error(code),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        match self.readlink_op(ino) {
            Ok(target) => reply.data(&target),
            Err(code) => reply.error(code),
        }
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &std::ffi::OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let name = match name.to_str() {
            Some(v) => v,
            None => {
                reply.error(EINVAL);
                return;
            }
        };
        match self.mkdir_path(parent, name, mode, req.uid(), req.gid()) {
            Ok(attr) => reply.entry(&self.reply_ttl, &attr, 0),
            Err(code) => reply.error(code),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &std::ffi::OsStr, reply: ReplyEmpty) {
        let name = match name.to_str() {
            Some(v) => v,
            None => {
                reply.error(EINVAL);
                return;
            }
        };
        match self.unlink_path(parent, name) {
            Ok(_) => reply.ok(),
            Err(code) => reply.error(code),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &std::ffi::OsStr, reply: ReplyEmpty) {
        let name = match name.to_str() {
            Some(v) => v,
            None => {
                reply.error(EINVAL);
                return;
            }
        };
        match self.rmdir_path(parent, name) {
            Ok(_) => reply.ok(),
            Err(code) => reply.error(code),
        }
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        link_name: &std::ffi::OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let (name, target) = match (link_name.to_str(), target.to_str()) {
            (Some(name), Some(target)) => (name, target),
            _ => {
                reply.error(EINVAL);
                return;
            }
        };
        match self.symlink_op(parent, name, target, req.uid(), req.gid()) {
            Ok(attr) => reply.entry(&self.reply_ttl, &attr, 0),
            Err(code) => reply.error(code),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &std::ffi::OsStr,
        newparent: u64,
        newname: &std::ffi::OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (name, newname) = match (name.to_str(), newname.to_str()) {
            (Some(name), Some(newname)) => (name, newname),
            _ => {
                reply.error(EINVAL);
                return;
            }
        };
        match self.rename_op(parent, name, newparent, newname) {
            Ok(_) => reply.ok(),
            Err(code) => reply.error(code),
        }
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &std::ffi::OsStr,
        reply: ReplyEntry,
    ) {
        let newname = match newname.to_str() {
            Some(v) => v,
            None => {
                reply.error(EINVAL);
                return;
            }
        };
        match self.link_op(ino, newparent, newname) {
            Ok((_ino, attr)) => reply.entry(&self.reply_ttl, &attr, 0),
            Err(code) => reply.error(code),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.open_file_op(ino) {
            Ok(fh) => reply.opened(fh, 0),
            Err(code) => reply.error(code),
        }
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &std::ffi::OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let name = match name.to_str() {
            Some(v) => v,
            None => {
                reply.error(EINVAL);
                return;
            }
        };
        match self.create_file_op(parent, name, mode, req.uid(), req.gid()) {
            Ok((attr, fh)) => reply.created(&self.reply_ttl, &attr, 0, fh, 0),
            Err(code) => reply.error(code),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        match self.read_op(fh, offset, size) {
            Ok(data) => reply.data(&data),
            Err(code) => reply.error(code),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        match self.write_op(fh, offset, data) {
            Ok(written) => reply.written(written),
            Err(code) => reply.error(code),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        match self.flush_op(fh) {
            Ok(_) => reply.ok(),
            Err(code) => reply.error(code),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.release_op(fh) {
            Ok(_) => reply.ok(),
            Err(code) => reply.error(code),
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        match self.flush_op(fh) {
            Ok(_) => reply.ok(),
            Err(code) => reply.error(code),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
        reply.opened(0, 0);
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        match self.readdir_entries(ino, offset) {
            Ok(entries) => {
                for (inode, file_type, name, next_offset) in entries {
                    if reply.add(inode, next_offset, file_type, name) {
                        break;
                    }
                }
                reply.ok();
            }
            Err(code) => reply.error(code),
        }
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    fn fsyncdir(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        match self.statfs_op() {
            Ok(files) => reply.statfs(0, 0, 0, files, files * 2, 512, 255, 0),
            Err(code) => reply.error(code),
        }
    }

    fn access(&mut self, _req: &Request<'_>, _ino: u64, _mask: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _name: &std::ffi::OsStr,
        _value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _name: &std::ffi::OsStr,
        size: u32,
        reply: ReplyXattr,
    ) {
        if size == 0 {
            reply.size(0);
        } else {
            reply.data(&[]);
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, _ino: u64, size: u32, reply: ReplyXattr) {
        if size == 0 {
            reply.size(0);
        } else {
            reply.data(&[]);
        }
    }

    fn removexattr(&mut self, _req: &Request<'_>, _ino: u64, _name: &std::ffi::OsStr, reply: ReplyEmpty) {
        reply.ok();
    }
}

fn read_json_config(path: &Path) -> FsResult<MountConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| FsError::IoError(format!("read {} failed: {}", path.display(), e)))?;
    serde_json::from_str(&content)
        .map_err(|e| FsError::InvalidParam(format!("parse {} failed: {}", path.display(), e)))
}

pub(crate) fn load_config(options: &RunOptions) -> FsResult<MountConfig> {
    let mut config = match &options.config_path {
        Some(path) => read_json_config(path)?,
        None => {
            let default = Path::new(DEFAULT_CONFIG_PATH);
            if default.exists() {
                read_json_config(default)?
            } else {
                MountConfig::default()
            }
        }
    };
    options.overrides.apply(&mut config);
    // NaN and infinity parse as valid f64 literals; reject them here so the
    // Duration conversion at mount time cannot panic
    for (name, value) in [
        ("entry_ttl", config.entry_ttl_secs),
        ("negative_ttl", config.negative_ttl_secs),
    ] {
        if !(0.0..=MAX_TTL_SECS).contains(&value) {
            return Err(FsError::InvalidParam(format!(
                "{} must be between 0 and {} seconds: {}",
                name, MAX_TTL_SECS, value
            )));
        }
    }
    Ok(config)
}

fn mountpoint_root_attrs(mountpoint: &Path) -> FsResult<RootAttrs> {
    use std::os::unix::fs::MetadataExt;
    let meta = std::fs::metadata(mountpoint)
        .map_err(|e| FsError::IoError(format!("stat {} failed: {}", mountpoint.display(), e)))?;
    Ok(RootAttrs {
        uid: meta.uid(),
        gid: meta.gid(),
        mode: meta.mode(),
    })
}

pub fn run_colfs(options: RunOptions) -> FsResult<()> {
    let runtime = Runtime::new().map_err(|e| FsError::IoError(e.to_string()))?;
    let config = load_config(&options)?;
    let session: DbSessionRef = Arc::new(runtime.block_on(CqlSession::connect(&config))?);
    let store = Arc::new(FileStore::new(session, &config));
    let root = mountpoint_root_attrs(&options.mountpoint)?;
    let reply_ttl = Duration::from_secs_f64(config.entry_ttl_secs);

    info!(
        "mounting colfs at {:?} for {}:{}",
        options.mountpoint, config.owner_id, config.environment
    );
    let filesystem = ColFs::new(runtime, store, root, reply_ttl);
    let mount_options = vec![
        MountOption::FSName("colfs".to_string()),
        MountOption::DefaultPermissions,
    ];
    #[cfg(not(target_os = "macos"))]
    let mut mount_options = mount_options;
    #[cfg(not(target_os = "macos"))]
    mount_options.push(MountOption::AutoUnmount);
    match fuser::spawn_mount2(filesystem, &options.mountpoint, &mount_options) {
        Ok(session) => {
            println!("colfs mounted at {:?}", options.mountpoint);
            session.join();
            Ok(())
        }
        Err(err) => {
            warn!("mount failed: {}", err);
            Err(FsError::IoError(format!("mount failed: {}", err)))
        }
    }
}
