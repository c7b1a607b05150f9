//! On-disk inode record I/O (component G) and the block-address resolver
//! (component H).

use substrate::BlockOps;

use crate::error::{KernelError, Result};
use crate::fs::alloc_bitmap::{free_block, AllocKind};
use crate::fs::superblock;
use crate::fs::Ext2;

pub const INODE_RECORD_SIZE_MIN: usize = 128;

/// Number of on-disk block pointers an inode carries: 12 direct, then one
/// singly-, doubly-, and triply-indirect pointer — 60 bytes total, which
/// doubles as the fast-symlink inline-storage area.
pub const BLOCK_PTR_COUNT: usize = 15;
const DIRECT_COUNT: usize = 12;

pub const TYPE_FIFO: u16 = 0x1000;
pub const TYPE_CHARDEV: u16 = 0x2000;
pub const TYPE_DIR: u16 = 0x4000;
pub const TYPE_BLOCKDEV: u16 = 0x6000;
pub const TYPE_REGULAR: u16 = 0x8000;
pub const TYPE_SYMLINK: u16 = 0xA000;
pub const TYPE_SOCKET: u16 = 0xC000;
const TYPE_MASK: u16 = 0xF000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Fifo,
    CharDevice,
    Directory,
    BlockDevice,
    Regular,
    Symlink,
    Socket,
}

impl FileType {
    pub fn bits(self) -> u16 {
        match self {
            Self::Fifo => TYPE_FIFO,
            Self::CharDevice => TYPE_CHARDEV,
            Self::Directory => TYPE_DIR,
            Self::BlockDevice => TYPE_BLOCKDEV,
            Self::Regular => TYPE_REGULAR,
            Self::Symlink => TYPE_SYMLINK,
            Self::Socket => TYPE_SOCKET,
        }
    }

    fn from_bits(mode: u16) -> Option<Self> {
        Some(match mode & TYPE_MASK {
            TYPE_FIFO => Self::Fifo,
            TYPE_CHARDEV => Self::CharDevice,
            TYPE_DIR => Self::Directory,
            TYPE_BLOCKDEV => Self::BlockDevice,
            TYPE_REGULAR => Self::Regular,
            TYPE_SYMLINK => Self::Symlink,
            TYPE_SOCKET => Self::Socket,
            _ => return None,
        })
    }
}

/// The on-disk inode record, decoded into host-native fields.
#[derive(Debug, Clone, Copy)]
pub struct Inode {
    pub mode: u16,
    pub uid: u16,
    pub size_low: u32,
    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
    pub dtime: u32,
    pub gid: u16,
    pub links_count: u16,
    /// Count of allocated 512-byte sectors, regardless of the filesystem's
    /// block size.
    pub sectors: u32,
    pub flags: u32,
    /// 12 direct pointers, then singly/doubly/triply indirect, in that
    /// order. Doubles as 60 bytes of inline fast-symlink storage.
    pub block_ptrs: [u32; BLOCK_PTR_COUNT],
    pub generation: u32,
    pub size_high: u32,
}

impl Inode {
    pub fn zeroed() -> Self {
        Self {
            mode: 0,
            uid: 0,
            size_low: 0,
            atime: 0,
            ctime: 0,
            mtime: 0,
            dtime: 0,
            gid: 0,
            links_count: 0,
            sectors: 0,
            flags: 0,
            block_ptrs: [0; BLOCK_PTR_COUNT],
            generation: 0,
            size_high: 0,
        }
    }

    pub fn file_type(&self) -> Option<FileType> {
        FileType::from_bits(self.mode)
    }

    pub fn is_directory(&self) -> bool {
        self.file_type() == Some(FileType::Directory)
    }

    /// Full byte size. Directories store size only in the low half.
    pub fn size(&self) -> u64 {
        if self.is_directory() {
            self.size_low as u64
        } else {
            (self.size_high as u64) << 32 | self.size_low as u64
        }
    }

    pub fn set_size(&mut self, size: u64) {
        if self.is_directory() {
            self.size_low = size as u32;
        } else {
            self.size_low = size as u32;
            self.size_high = (size >> 32) as u32;
        }
    }

    pub fn direct(&self, i: usize) -> u32 {
        self.block_ptrs[i]
    }
    pub fn set_direct(&mut self, i: usize, v: u32) {
        self.block_ptrs[i] = v;
    }
    pub fn singly(&self) -> u32 {
        self.block_ptrs[DIRECT_COUNT]
    }
    pub fn set_singly(&mut self, v: u32) {
        self.block_ptrs[DIRECT_COUNT] = v;
    }
    pub fn doubly(&self) -> u32 {
        self.block_ptrs[DIRECT_COUNT + 1]
    }
    pub fn set_doubly(&mut self, v: u32) {
        self.block_ptrs[DIRECT_COUNT + 1] = v;
    }
    pub fn triply(&self) -> u32 {
        self.block_ptrs[DIRECT_COUNT + 2]
    }
    pub fn set_triply(&mut self, v: u32) {
        self.block_ptrs[DIRECT_COUNT + 2] = v;
    }

    /// The inline fast-symlink storage area: the same 60 bytes the block
    /// pointers occupy, reinterpreted byte-for-byte.
    pub fn symlink_inline_bytes(&self) -> [u8; BLOCK_PTR_COUNT * 4] {
        let mut out = [0u8; BLOCK_PTR_COUNT * 4];
        for (i, p) in self.block_ptrs.iter().enumerate() {
            out[i * 4..i * 4 + 4].copy_from_slice(&p.to_le_bytes());
        }
        out
    }

    pub fn set_symlink_inline_bytes(&mut self, bytes: &[u8]) {
        debug_assert!(bytes.len() <= BLOCK_PTR_COUNT * 4);
        let mut buf = [0u8; BLOCK_PTR_COUNT * 4];
        buf[..bytes.len()].copy_from_slice(bytes);
        for i in 0..BLOCK_PTR_COUNT {
            self.block_ptrs[i] = u32::from_le_bytes(buf[i * 4..i * 4 + 4].try_into().unwrap());
        }
    }

    pub fn from_bytes(b: &[u8]) -> Self {
        let u32_at = |o: usize| u32::from_le_bytes(b[o..o + 4].try_into().unwrap());
        let u16_at = |o: usize| u16::from_le_bytes(b[o..o + 2].try_into().unwrap());
        let mut block_ptrs = [0u32; BLOCK_PTR_COUNT];
        for (i, p) in block_ptrs.iter_mut().enumerate() {
            *p = u32_at(40 + i * 4);
        }
        Self {
            mode: u16_at(0),
            uid: u16_at(2),
            size_low: u32_at(4),
            atime: u32_at(8),
            ctime: u32_at(12),
            mtime: u32_at(16),
            dtime: u32_at(20),
            gid: u16_at(24),
            links_count: u16_at(26),
            sectors: u32_at(28),
            flags: u32_at(32),
            block_ptrs,
            generation: u32_at(100),
            size_high: u32_at(108),
        }
    }

    pub fn to_bytes(&self, record_size: usize) -> alloc::vec::Vec<u8> {
        let mut b = alloc::vec![0u8; record_size];
        b[0..2].copy_from_slice(&self.mode.to_le_bytes());
        b[2..4].copy_from_slice(&self.uid.to_le_bytes());
        b[4..8].copy_from_slice(&self.size_low.to_le_bytes());
        b[8..12].copy_from_slice(&self.atime.to_le_bytes());
        b[12..16].copy_from_slice(&self.ctime.to_le_bytes());
        b[16..20].copy_from_slice(&self.mtime.to_le_bytes());
        b[20..24].copy_from_slice(&self.dtime.to_le_bytes());
        b[24..26].copy_from_slice(&self.gid.to_le_bytes());
        b[26..28].copy_from_slice(&self.links_count.to_le_bytes());
        b[28..32].copy_from_slice(&self.sectors.to_le_bytes());
        b[32..36].copy_from_slice(&self.flags.to_le_bytes());
        for (i, p) in self.block_ptrs.iter().enumerate() {
            b[40 + i * 4..44 + i * 4].copy_from_slice(&p.to_le_bytes());
        }
        b[100..104].copy_from_slice(&self.generation.to_le_bytes());
        b[108..112].copy_from_slice(&self.size_high.to_le_bytes());
        b
    }
}

/// Resolve inode `id` to its `(group, index-within-group)`.
pub fn locate(id: u32, inodes_per_group: u32) -> (usize, usize) {
    let group = (id - 1) / inodes_per_group;
    let index = (id - 1) % inodes_per_group;
    (group as usize, index as usize)
}

/// Where a logical block's on-disk pointer physically lives.
enum Slot {
    /// One of the inode's 12 direct pointers.
    Direct(u32),
    /// Slot `index` of the indirect table at block `table`.
    InTable { table: u32, index: u32 },
}

impl<D: BlockOps> Ext2<D> {
    /// Read inode `id` from disk. Lock-free, per spec: concurrent readers
    /// never contend, and a reader racing a write sees either the old or
    /// new record, never a torn one, because records never cross the
    /// single-sector transfers `read_bytes`/`write_bytes` perform... in
    /// practice torn reads are possible across a sector boundary, which is
    /// why writers hold `inodewrite` for the whole record.
    pub fn read_inode(&self, id: u32) -> Result<Inode> {
        let (offset, record_size) = self.inode_offset(id)?;
        let mut raw = alloc::vec![0u8; record_size];
        superblock::read_bytes(&self.dev, offset, &mut raw)?;
        Ok(Inode::from_bytes(&raw))
    }

    /// Write inode `id` back to disk, serialized by the `inodewrite` lock.
    pub fn write_inode(&self, id: u32, inode: &Inode) -> Result<()> {
        let (offset, record_size) = self.inode_offset(id)?;
        let guard = self.inode_write.lock();
        let bytes = inode.to_bytes(record_size);
        let result = superblock::write_bytes(&self.dev, offset, &bytes);
        guard.unlock();
        result
    }

    fn inode_offset(&self, id: u32) -> Result<(usize, usize)> {
        let sb = self.superblock.lock();
        let inodes_per_group = sb.inodes_per_group;
        let record_size = sb.inode_size as usize;
        let block_size = sb.block_size();
        sb.unlock();

        let (group, index) = locate(id, inodes_per_group);
        let descriptors = self.descriptors.lock();
        let desc = *descriptors
            .get(group)
            .ok_or(KernelError::FilesystemCorrupted("inode group out of range"))?;
        descriptors.unlock();

        let offset = desc.inode_table as usize * block_size + index * record_size;
        Ok((offset, record_size))
    }

    /// Grow or shrink `inode`'s data-block tree to hold exactly
    /// `new_size` bytes, persisting the updated inode afterward.
    pub fn resize(&self, id: u32, inode: &mut Inode, new_size: u64) -> Result<()> {
        let block_size = self.block_size() as u64;
        let new_blocks = new_size.div_ceil(block_size);
        let old_blocks = inode.size().div_ceil(block_size);

        if new_blocks > old_blocks {
            for i in old_blocks..new_blocks {
                self.block_for_write(inode, i as u32)?;
            }
        } else if new_blocks < old_blocks {
            for i in (new_blocks..old_blocks).rev() {
                self.free_block_at(inode, i as u32)?;
            }
        }

        inode.set_size(new_size);
        self.write_inode(id, inode)
    }

    /// Resolve logical block `n` without allocating anything; `0` means
    /// "hole".
    pub fn get_block(&self, inode: &Inode, n: u32) -> Result<u32> {
        let mut copy = *inode;
        match self.locate_slot(&mut copy, n, false)? {
            None => Ok(0),
            Some(Slot::Direct(i)) => Ok(copy.direct(i as usize)),
            Some(Slot::InTable { table, index }) => self.read_indirect_slot(table, index),
        }
    }

    /// Resolve logical block `n`, allocating the leaf (zero-filled) and
    /// every missing intermediate on the way down if it is currently a
    /// hole. Bumps `inode.sectors` for each frame this call allocates.
    pub fn block_for_write(&self, inode: &mut Inode, n: u32) -> Result<u32> {
        let slot = self
            .locate_slot(inode, n, true)?
            .expect("allow_alloc=true always resolves a slot");
        let block_size = self.block_size();
        match slot {
            Slot::Direct(i) => {
                let old = inode.direct(i as usize);
                if old != 0 {
                    return Ok(old);
                }
                let block = crate::fs::alloc_bitmap::allocate(self, AllocKind::Block)?;
                superblock::write_bytes(
                    &self.dev,
                    block as usize * block_size,
                    &alloc::vec![0u8; block_size],
                )?;
                inode.set_direct(i as usize, block);
                inode.sectors += (block_size / 512) as u32;
                Ok(block)
            }
            Slot::InTable { table, index } => {
                let old = self.read_indirect_slot(table, index)?;
                if old != 0 {
                    return Ok(old);
                }
                let block = crate::fs::alloc_bitmap::allocate(self, AllocKind::Block)?;
                superblock::write_bytes(
                    &self.dev,
                    block as usize * block_size,
                    &alloc::vec![0u8; block_size],
                )?;
                self.write_indirect_slot(table, index, block)?;
                inode.sectors += (block_size / 512) as u32;
                Ok(block)
            }
        }
    }

    /// Free the data block backing logical block `n`, if any, clearing its
    /// pointer slot and shrinking `inode.sectors` accordingly. A no-op on
    /// a hole.
    fn free_block_at(&self, inode: &mut Inode, n: u32) -> Result<()> {
        let slot = match self.locate_slot(inode, n, false)? {
            Some(s) => s,
            None => return Ok(()),
        };
        let block_size = self.block_size();
        match slot {
            Slot::Direct(i) => {
                let old = inode.direct(i as usize);
                if old != 0 {
                    inode.set_direct(i as usize, 0);
                    free_block(self, old)?;
                    inode.sectors = inode.sectors.saturating_sub((block_size / 512) as u32);
                }
            }
            Slot::InTable { table, index } => {
                let old = self.read_indirect_slot(table, index)?;
                if old != 0 {
                    self.write_indirect_slot(table, index, 0)?;
                    free_block(self, old)?;
                    inode.sectors = inode.sectors.saturating_sub((block_size / 512) as u32);
                }
            }
        }
        Ok(())
    }

    /// Descend direct/singly/doubly/triply to find where logical block
    /// `n`'s pointer lives, allocating missing intermediate tables (never
    /// the leaf itself) when `allow_alloc` is set. Returns `None` only
    /// when `allow_alloc` is false and an intermediate is missing.
    fn locate_slot(&self, inode: &mut Inode, n: u32, allow_alloc: bool) -> Result<Option<Slot>> {
        let e = (self.block_size() / 4) as u32;
        if n < DIRECT_COUNT as u32 {
            return Ok(Some(Slot::Direct(n)));
        }
        let n = n - DIRECT_COUNT as u32;
        if n < e {
            let table = match self.ensure_indirect(inode.singly(), inode, allow_alloc)? {
                Some(t) => t,
                None => return Ok(None),
            };
            if table != inode.singly() {
                inode.set_singly(table);
            }
            return Ok(Some(Slot::InTable { table, index: n }));
        }
        let n = n - e;
        if n < e * e {
            let outer = n / e;
            let inner = n % e;
            let doubly = match self.ensure_indirect(inode.doubly(), inode, allow_alloc)? {
                Some(t) => t,
                None => return Ok(None),
            };
            if doubly != inode.doubly() {
                inode.set_doubly(doubly);
            }
            let singly_cur = self.read_indirect_slot(doubly, outer)?;
            let singly = match self.ensure_indirect(singly_cur, inode, allow_alloc)? {
                Some(t) => t,
                None => return Ok(None),
            };
            if singly != singly_cur {
                self.write_indirect_slot(doubly, outer, singly)?;
            }
            return Ok(Some(Slot::InTable {
                table: singly,
                index: inner,
            }));
        }
        let n = n - e * e;
        let outer = n / (e * e);
        let rem = n % (e * e);
        let mid = rem / e;
        let inner = rem % e;
        let triply = match self.ensure_indirect(inode.triply(), inode, allow_alloc)? {
            Some(t) => t,
            None => return Ok(None),
        };
        if triply != inode.triply() {
            inode.set_triply(triply);
        }
        let doubly_cur = self.read_indirect_slot(triply, outer)?;
        let doubly = match self.ensure_indirect(doubly_cur, inode, allow_alloc)? {
            Some(t) => t,
            None => return Ok(None),
        };
        if doubly != doubly_cur {
            self.write_indirect_slot(triply, outer, doubly)?;
        }
        let singly_cur = self.read_indirect_slot(doubly, mid)?;
        let singly = match self.ensure_indirect(singly_cur, inode, allow_alloc)? {
            Some(t) => t,
            None => return Ok(None),
        };
        if singly != singly_cur {
            self.write_indirect_slot(doubly, mid, singly)?;
        }
        Ok(Some(Slot::InTable {
            table: singly,
            index: inner,
        }))
    }

    /// `current` if non-zero; else a freshly allocated, zero-filled
    /// indirect table if `allow_alloc`; else `None`.
    fn ensure_indirect(&self, current: u32, inode: &mut Inode, allow_alloc: bool) -> Result<Option<u32>> {
        if current != 0 {
            return Ok(Some(current));
        }
        if !allow_alloc {
            return Ok(None);
        }
        Ok(Some(self.alloc_indirect_block(inode)?))
    }

    fn read_indirect_slot(&self, table: u32, slot: u32) -> Result<u32> {
        let block_size = self.block_size();
        let offset = table as usize * block_size + slot as usize * 4;
        let mut raw = [0u8; 4];
        superblock::read_bytes(&self.dev, offset, &mut raw)?;
        Ok(u32::from_le_bytes(raw))
    }

    fn write_indirect_slot(&self, table: u32, slot: u32, value: u32) -> Result<()> {
        let block_size = self.block_size();
        let offset = table as usize * block_size + slot as usize * 4;
        superblock::write_bytes(&self.dev, offset, &value.to_le_bytes())
    }

    /// Allocate one zero-filled block to serve as a new indirect table,
    /// bumping the inode's sector count to account for it.
    fn alloc_indirect_block(&self, inode: &mut Inode) -> Result<u32> {
        let block = crate::fs::alloc_bitmap::allocate(self, AllocKind::Block)?;
        let block_size = self.block_size();
        let zeros = alloc::vec![0u8; block_size];
        superblock::write_bytes(&self.dev, block as usize * block_size, &zeros)?;
        inode.sectors += (block_size / 512) as u32;
        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inode_roundtrip() {
        let mut inode = Inode::zeroed();
        inode.mode = TYPE_REGULAR | 0o644;
        inode.set_size(12345);
        inode.set_direct(0, 10);
        inode.links_count = 1;
        let bytes = inode.to_bytes(128);
        let back = Inode::from_bytes(&bytes);
        assert_eq!(back.size(), 12345);
        assert_eq!(back.direct(0), 10);
        assert_eq!(back.file_type(), Some(FileType::Regular));
    }

    #[test]
    fn directory_size_ignores_high_half() {
        let mut inode = Inode::zeroed();
        inode.mode = TYPE_DIR;
        inode.size_high = 7;
        inode.set_size(4096);
        assert_eq!(inode.size(), 4096);
        assert_eq!(inode.size_high, 7);
    }

    #[test]
    fn locate_maps_inode_1_to_group_0_index_0() {
        assert_eq!(locate(1, 128), (0, 0));
        assert_eq!(locate(128, 128), (0, 127));
        assert_eq!(locate(129, 128), (1, 0));
    }

    #[test]
    fn symlink_inline_roundtrip() {
        let mut inode = Inode::zeroed();
        let target = b"/usr/bin/env";
        inode.set_symlink_inline_bytes(target);
        let bytes = inode.symlink_inline_bytes();
        assert_eq!(&bytes[..target.len()], target);
    }
}
