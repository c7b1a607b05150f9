//! VFS node bridge (component K): the operation table every in-memory
//! node is exposed through, the inode-id-keyed node cache, and the
//! "fast symlink" optimization.
//!
//! Lock nesting for any call that needs more than one of the five named
//! locks: `root` > `inodetable` > (the node's own lock) > `descriptor` >
//! `superblock` > `inodewrite`.

use alloc::sync::Arc;
use alloc::vec::Vec;
use substrate::BlockOps;

use crate::error::{KernelError, Result};
use crate::fs::inode::{FileType, Inode};
use crate::fs::{Ext2, Node, ROOT_INODE};

/// Symlink targets this short are stored inline in the inode's block-
/// pointer area instead of in a data block. `== 60` is inclusive of
/// inline storage, matching the format this engine is compatible with.
pub const FAST_SYMLINK_MAX: usize = 60;

/// Attribute snapshot returned by `getattr`, independent of the on-disk
/// inode's exact byte layout.
#[derive(Debug, Clone, Copy)]
pub struct Attr {
    pub mode: u16,
    pub uid: u16,
    pub gid: u16,
    pub size: u64,
    pub links: u16,
    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
}

/// One entry as returned by `getdents`.
#[derive(Debug, Clone)]
pub struct DirentEntry {
    pub inode: u32,
    pub type_tag: u8,
    pub name: Vec<u8>,
}

/// A patch applied by `setattr`; `None` fields are left unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct AttrPatch {
    pub mode: Option<u16>,
    pub uid: Option<u16>,
    pub gid: Option<u16>,
    pub mtime: Option<u32>,
}

impl<D: BlockOps> Ext2<D> {
    /// The filesystem's root directory node, opened (and cached) on first
    /// use under the `root` lock.
    pub fn root(&self) -> Result<Arc<Node>> {
        let mut slot = self.root_node.lock();
        if let Some(node) = slot.as_ref() {
            let node = node.clone();
            slot.unlock();
            return Ok(node);
        }
        let node = self.open(ROOT_INODE);
        let node = match node {
            Ok(n) => n,
            Err(e) => {
                slot.unlock();
                return Err(e);
            }
        };
        *slot = Some(node.clone());
        slot.unlock();
        Ok(node)
    }

    /// Open inode `ino`, serving from the inode-table cache under the
    /// `inodetable` lock when possible, otherwise reading it from disk and
    /// publishing the new node.
    pub fn open(&self, ino: u32) -> Result<Arc<Node>> {
        let mut table = self.inode_table.lock();
        if let Some(node) = table.get(&ino) {
            let node = node.clone();
            table.unlock();
            return Ok(node);
        }
        table.unlock();

        let inode = self.read_inode(ino)?;
        let node = Node::new(ino, inode);

        let mut table = self.inode_table.lock();
        let node = table.entry(ino).or_insert_with(|| node.clone()).clone();
        table.unlock();
        Ok(node)
    }

    /// Release a reference to `node`. The VFS is the sole decrement point
    /// for the reference count `open`/`lookup` publish; dropping the last
    /// `Arc` here is what actually frees it (the in-memory cache still
    /// holds one reference until some future eviction policy removes it).
    pub fn close(&self, node: Arc<Node>) {
        drop(node);
    }

    /// Resolve `name` within directory node `dir` and open the result.
    pub fn lookup(&self, dir: &Arc<Node>, name: &[u8]) -> Result<Arc<Node>> {
        let guard = dir.state.lock();
        if !guard.is_directory() {
            guard.unlock();
            return Err(KernelError::NotADirectory);
        }
        let result = Ext2::lookup(self, &guard, name);
        guard.unlock();
        self.open(result?)
    }

    pub fn getdents(&self, dir: &Arc<Node>) -> Result<Vec<DirentEntry>> {
        let guard = dir.state.lock();
        if !guard.is_directory() {
            guard.unlock();
            return Err(KernelError::NotADirectory);
        }
        let mut out = Vec::new();
        let result = self.scan_entries(&guard, |e| {
            out.push(DirentEntry {
                inode: e.inode,
                type_tag: e.type_tag,
                name: e.name.clone(),
            });
            None::<()>
        });
        guard.unlock();
        result?;
        Ok(out)
    }

    pub fn getattr(&self, node: &Arc<Node>) -> Attr {
        let guard = node.state.lock();
        let attr = Attr {
            mode: guard.mode,
            uid: guard.uid,
            gid: guard.gid,
            size: guard.size(),
            links: guard.links_count,
            atime: guard.atime,
            ctime: guard.ctime,
            mtime: guard.mtime,
        };
        guard.unlock();
        attr
    }

    pub fn setattr(&self, node: &Arc<Node>, patch: AttrPatch) -> Result<()> {
        let mut guard = node.state.lock();
        if let Some(mode) = patch.mode {
            guard.mode = (guard.mode & 0xF000) | (mode & 0x0FFF);
        }
        if let Some(uid) = patch.uid {
            guard.uid = uid;
        }
        if let Some(gid) = patch.gid {
            guard.gid = gid;
        }
        if let Some(mtime) = patch.mtime {
            guard.mtime = mtime;
        }
        let inode = *guard;
        let result = self.write_inode(node.ino, &inode);
        guard.unlock();
        result
    }

    /// Check `want` (a subset of the low 9 permission bits) against the
    /// node's mode. No notion of the calling user/group is modeled here;
    /// the embedding kernel's VFS layer owns credential checks and calls
    /// this only for the "does the mode bit exist at all" question.
    pub fn access(&self, node: &Arc<Node>, want: u16) -> bool {
        let guard = node.state.lock();
        let ok = guard.mode & want == want;
        guard.unlock();
        ok
    }

    /// Read a symlink's target, transparently following the fast-symlink
    /// inline-storage optimization.
    pub fn readlink(&self, node: &Arc<Node>) -> Result<Vec<u8>> {
        let guard = node.state.lock();
        if guard.file_type() != Some(FileType::Symlink) {
            guard.unlock();
            return Err(KernelError::InvalidArgument);
        }
        let size = guard.size() as usize;
        if size <= FAST_SYMLINK_MAX {
            let bytes = guard.symlink_inline_bytes();
            guard.unlock();
            return Ok(bytes[..size].to_vec());
        }
        let inode = *guard;
        guard.unlock();
        let mut buf = alloc::vec![0u8; size];
        self.read_data(&inode, 0, &mut buf)?;
        Ok(buf)
    }

    pub fn read(&self, node: &Arc<Node>, offset: u64, buf: &mut [u8]) -> Result<()> {
        let guard = node.state.lock();
        let result = self.read_data(&guard, offset, buf);
        guard.unlock();
        result
    }

    pub fn write(&self, node: &Arc<Node>, offset: u64, data: &[u8]) -> Result<()> {
        let mut guard = node.state.lock();
        let result = self.write_data(node.ino, &mut guard, offset, data);
        guard.unlock();
        result
    }

    pub fn resize_node(&self, node: &Arc<Node>, size: u64) -> Result<()> {
        let mut guard = node.state.lock();
        let mut inode = *guard;
        let result = self.resize(node.ino, &mut inode, size);
        *guard = inode;
        guard.unlock();
        result
    }

    pub fn link(&self, dir: &Arc<Node>, name: &[u8], target: &Arc<Node>) -> Result<()> {
        let mut dir_guard = dir.state.lock();
        if !dir_guard.is_directory() {
            dir_guard.unlock();
            return Err(KernelError::NotADirectory);
        }
        let mut target_guard = target.state.lock();
        let result = Ext2::link(
            self,
            dir.ino,
            &mut dir_guard,
            name,
            target.ino,
            &mut target_guard,
        );
        target_guard.unlock();
        dir_guard.unlock();
        result
    }

    pub fn create(
        &self,
        dir: &Arc<Node>,
        name: &[u8],
        kind: FileType,
        mode_bits: u16,
        now: u32,
    ) -> Result<Arc<Node>> {
        let mut dir_guard = dir.state.lock();
        let created = Ext2::create(self, dir.ino, &mut dir_guard, name, kind, mode_bits, now);
        dir_guard.unlock();
        let (id, inode) = created?;
        let node = Node::new(id, inode);
        let mut table = self.inode_table.lock();
        let node = table.entry(id).or_insert_with(|| node.clone()).clone();
        table.unlock();
        Ok(node)
    }

    /// Symbolic link creation is not provided by this bridge; callers
    /// needing a symlink construct the inode directly and write its
    /// target via the fast-symlink inline area or `write_data`.
    pub fn symlink(&self, _dir: &Arc<Node>, _name: &[u8], _target: &[u8]) -> Result<Arc<Node>> {
        Err(KernelError::NotSupported)
    }
}
