use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use colfs_lib::{EntryAttr, FsError, FsResult, CHOWN_KEEP};
use fs_store::FileStore;

#[derive(Debug)]
struct FileState {
    data: Vec<u8>,
    hash: Vec<u8>,
    attr: EntryAttr,
    dirty: bool,
}

/// In-memory record for one open path. Every handle on the path shares one
/// record; the state mutex is only held around buffer manipulation, never
/// across database I/O.
#[derive(Debug)]
pub struct FileData {
    path: String,
    refs: AtomicU32,
    state: Mutex<FileState>,
}

impl FileData {
    pub fn new(path: &str, hash: Vec<u8>, data: Vec<u8>, attr: EntryAttr) -> Arc<Self> {
        Arc::new(Self {
            path: path.to_string(),
            refs: AtomicU32::new(0),
            state: Mutex::new(FileState {
                data,
                hash,
                attr,
                dirty: false,
            }),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn ref_count(&self) -> u32 {
        self.refs.load(Ordering::SeqCst)
    }

    pub(crate) fn acquire(&self) {
        self.refs.fetch_add(1, Ordering::SeqCst);
    }

    /// Drop one reference, returning how many remain.
    pub(crate) fn release(&self) -> u32 {
        self.refs.fetch_sub(1, Ordering::SeqCst).saturating_sub(1)
    }

    fn state(&self) -> MutexGuard<'_, FileState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Buffered write. A write past the end zero-fills the gap; a write
    /// inside the body replaces everything from `offset` on.
    pub fn write(&self, buf: &[u8], offset: u64) -> u32 {
        let mut st = self.state();
        let offset = offset as usize;
        if offset > st.data.len() {
            st.data.resize(offset, 0);
        } else {
            st.data.truncate(offset);
        }
        st.data.extend_from_slice(buf);
        st.attr.size = st.data.len() as u64;
        st.dirty = true;
        buf.len() as u32
    }

    pub fn read(&self, offset: u64, size: u32) -> Vec<u8> {
        let st = self.state();
        let start = (offset as usize).min(st.data.len());
        let end = (start + size as usize).min(st.data.len());
        st.data[start..end].to_vec()
    }

    /// Shrink the buffered body. Growing a file through truncate is not
    /// supported.
    pub fn truncate(&self, size: u64) -> FsResult<()> {
        let mut st = self.state();
        let size = size as usize;
        if size > st.data.len() {
            return Err(FsError::InvalidParam(format!(
                "cannot grow {} to {} bytes",
                self.path, size
            )));
        }
        st.data.truncate(size);
        st.attr.size = st.data.len() as u64;
        st.dirty = true;
        Ok(())
    }

    /// Replace the permission bits, keeping the file-type bits.
    pub fn chmod(&self, mode: u32) {
        let mut st = self.state();
        st.attr.set_perm(mode);
        st.dirty = true;
    }

    /// Change ownership; `CHOWN_KEEP` leaves the respective id untouched.
    pub fn chown(&self, uid: u32, gid: u32) {
        let mut st = self.state();
        if uid != CHOWN_KEEP {
            st.attr.owner.uid = uid;
        }
        if gid != CHOWN_KEEP {
            st.attr.owner.gid = gid;
        }
        st.dirty = true;
    }

    pub fn utimens(&self, atime: (u64, u32), mtime: (u64, u32)) {
        let mut st = self.state();
        st.attr.atime = atime.0;
        st.attr.atimensec = atime.1;
        st.attr.mtime = mtime.0;
        st.attr.mtimensec = mtime.1;
        st.dirty = true;
    }

    pub fn attr(&self) -> EntryAttr {
        self.state().attr
    }

    pub fn is_dirty(&self) -> bool {
        self.state().dirty
    }

    /// Write the buffered body and attributes back if anything changed.
    /// The state lock is dropped across the store call; of concurrently
    /// mutated state, the last flush wins.
    pub async fn flush(&self, store: &FileStore) -> FsResult<()> {
        let (data, attr, old_hash) = {
            let st = self.state();
            if !st.dirty {
                return Ok(());
            }
            (st.data.clone(), st.attr, st.hash.clone())
        };
        let new_hash = store.update_file(&self.path, &data, &attr, &old_hash).await?;
        let mut st = self.state();
        st.hash = new_hash;
        st.dirty = false;
        Ok(())
    }
}

/// One open handle: a shared record plus a position cursor.
#[derive(Debug)]
pub struct FileHandle {
    data: Arc<FileData>,
    at: u64,
    closed: bool,
}

impl FileHandle {
    pub(crate) fn new(data: Arc<FileData>) -> Self {
        data.acquire();
        Self {
            data,
            at: 0,
            closed: false,
        }
    }

    pub fn file(&self) -> &Arc<FileData> {
        &self.data
    }

    pub fn path(&self) -> &str {
        self.data.path()
    }

    pub fn attr(&self) -> EntryAttr {
        self.data.attr()
    }

    pub fn read(&mut self, offset: u64, size: u32) -> Vec<u8> {
        let out = self.data.read(offset, size);
        // the cursor never leaves [0, len]
        self.at = offset.min(self.data.attr().size) + out.len() as u64;
        out
    }

    pub fn write(&mut self, buf: &[u8], offset: u64) -> u32 {
        let written = self.data.write(buf, offset);
        self.at = offset + written as u64;
        written
    }

    pub fn truncate(&mut self, size: u64) -> FsResult<()> {
        self.data.truncate(size)?;
        self.at = self.at.min(size);
        Ok(())
    }

    pub async fn flush(&self, store: &FileStore) -> FsResult<()> {
        self.data.flush(store).await
    }

    /// Handle-level attribute changes persist immediately.
    pub async fn chmod(&self, store: &FileStore, mode: u32) -> FsResult<()> {
        self.data.chmod(mode);
        self.data.flush(store).await
    }

    pub async fn chown(&self, store: &FileStore, uid: u32, gid: u32) -> FsResult<()> {
        self.data.chown(uid, gid);
        self.data.flush(store).await
    }

    pub async fn utimens(&self, store: &FileStore, atime: (u64, u32), mtime: (u64, u32)) -> FsResult<()> {
        self.data.utimens(atime, mtime);
        self.data.flush(store).await
    }

    pub(crate) fn mark_closed(&mut self) {
        self.closed = true;
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        if !self.closed {
            self.data.release();
        }
    }
}
