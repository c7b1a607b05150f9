//! Directory operations (component J): a directory's data is a sequence
//! of variable-length entries that tile each block exactly and never
//! cross a block boundary.

use alloc::vec::Vec;
use substrate::BlockOps;

use crate::error::{KernelError, Result};
use crate::fs::alloc_bitmap::{allocate, AllocKind};
use crate::fs::inode::{FileType, Inode};
use crate::fs::Ext2;

const ENTRY_HEADER_LEN: usize = 8;
const MAX_NAME_LEN: usize = 255;

/// Round `n` up to the next multiple of `to` (`to` a power of two).
pub fn round_up(n: usize, to: usize) -> usize {
    (n + to - 1) & !(to - 1)
}

fn type_tag(kind: FileType) -> u8 {
    match kind {
        FileType::Regular => 1,
        FileType::Directory => 2,
        FileType::CharDevice => 3,
        FileType::BlockDevice => 4,
        FileType::Fifo => 5,
        FileType::Socket => 6,
        FileType::Symlink => 7,
    }
}

/// A decoded directory entry and the byte offset within the directory it
/// was read from.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub offset: usize,
    pub inode: u32,
    pub rec_len: u16,
    pub type_tag: u8,
    pub name: Vec<u8>,
}

impl DirEntry {
    fn encode(&self) -> Vec<u8> {
        let mut b = alloc::vec![0u8; self.rec_len as usize];
        b[0..4].copy_from_slice(&self.inode.to_le_bytes());
        b[4..6].copy_from_slice(&self.rec_len.to_le_bytes());
        b[6] = self.name.len() as u8;
        b[7] = self.type_tag;
        b[8..8 + self.name.len()].copy_from_slice(&self.name);
        b
    }

    fn decode(buf: &[u8], offset: usize) -> Option<Self> {
        if offset + ENTRY_HEADER_LEN > buf.len() {
            return None;
        }
        let inode = u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap());
        let rec_len = u16::from_le_bytes(buf[offset + 4..offset + 6].try_into().unwrap());
        let name_len = buf[offset + 6] as usize;
        let type_tag = buf[offset + 7];
        if rec_len == 0 || offset + rec_len as usize > buf.len() {
            return None;
        }
        let name = buf[offset + 8..offset + 8 + name_len].to_vec();
        Some(Self {
            offset,
            inode,
            rec_len,
            type_tag,
            name,
        })
    }

    /// Bytes this entry's header + name actually need, rounded up to the
    /// entry-alignment granularity — as opposed to `rec_len`, which may be
    /// padded further to absorb trailing free space in the block.
    fn true_size(&self) -> usize {
        round_up(ENTRY_HEADER_LEN + self.name.len(), 4)
    }
}

impl<D: BlockOps> Ext2<D> {
    /// Stream `dir`'s data block-by-block, calling `f` with each decoded
    /// entry in order. Stops early if `f` returns `Some`.
    pub(crate) fn scan_entries<R>(
        &self,
        dir: &Inode,
        mut f: impl FnMut(&DirEntry) -> Option<R>,
    ) -> Result<Option<R>> {
        let block_size = self.block_size();
        let block_count = (dir.size() as usize).div_ceil(block_size);
        for b in 0..block_count {
            let block = self.get_block(dir, b as u32)?;
            if block == 0 {
                continue;
            }
            let mut buf = alloc::vec![0u8; block_size];
            crate::fs::superblock::read_bytes(&self.dev, block as usize * block_size, &mut buf)?;

            let mut offset = 0;
            while offset < block_size {
                let entry = match DirEntry::decode(&buf, offset) {
                    Some(e) => e,
                    None => break,
                };
                let rec_len = entry.rec_len as usize;
                if entry.inode != 0 {
                    if let Some(r) = f(&entry) {
                        return Ok(Some(r));
                    }
                }
                offset += rec_len;
            }
        }
        Ok(None)
    }

    /// Find `name` in `dir`, returning its inode id on an exact, byte-exact
    /// match.
    pub fn lookup(&self, dir: &Inode, name: &[u8]) -> Result<u32> {
        self.scan_entries(dir, |e| if e.name == name { Some(e.inode) } else { None })?
            .ok_or(KernelError::NotFound)
    }

    /// Insert a `(name -> id)` entry of kind `kind` into `dir`, splitting
    /// an existing entry's trailing free space if one has room, else
    /// growing the directory by one block.
    pub fn insert(&self, dir_id: u32, dir: &mut Inode, name: &[u8], id: u32, kind: FileType) -> Result<()> {
        if name.len() > MAX_NAME_LEN {
            return Err(KernelError::NameTooLong);
        }
        if self.lookup(dir, name).is_ok() {
            return Err(KernelError::AlreadyExists);
        }

        let needed = round_up(ENTRY_HEADER_LEN + name.len(), 4);
        let block_size = self.block_size();
        let block_count = (dir.size() as usize).div_ceil(block_size);

        for b in 0..block_count {
            let block = self.get_block(dir, b as u32)?;
            if block == 0 {
                continue;
            }
            let mut buf = alloc::vec![0u8; block_size];
            crate::fs::superblock::read_bytes(&self.dev, block as usize * block_size, &mut buf)?;

            let mut offset = 0;
            while offset < block_size {
                let entry = match DirEntry::decode(&buf, offset) {
                    Some(e) => e,
                    None => break,
                };
                let rec_len = entry.rec_len as usize;
                let true_size = entry.true_size();
                let free = rec_len.saturating_sub(if entry.inode == 0 { 0 } else { true_size });

                if entry.inode == 0 && rec_len >= needed {
                    // A free (tombstone) slot large enough to reuse whole.
                    let new_entry = DirEntry {
                        offset,
                        inode: id,
                        rec_len: rec_len as u16,
                        type_tag: type_tag(kind),
                        name: name.to_vec(),
                    };
                    buf[offset..offset + rec_len].copy_from_slice(&new_entry.encode());
                    crate::fs::superblock::write_bytes(
                        &self.dev,
                        block as usize * block_size,
                        &buf,
                    )?;
                    return Ok(());
                }

                if entry.inode != 0 && needed <= free {
                    let mut shrunk = entry.clone();
                    shrunk.rec_len = true_size as u16;
                    buf[offset..offset + true_size].copy_from_slice(&shrunk.encode());

                    let new_offset = offset + true_size;
                    let new_entry = DirEntry {
                        offset: new_offset,
                        inode: id,
                        rec_len: free as u16,
                        type_tag: type_tag(kind),
                        name: name.to_vec(),
                    };
                    buf[new_offset..new_offset + free].copy_from_slice(&new_entry.encode());

                    crate::fs::superblock::write_bytes(
                        &self.dev,
                        block as usize * block_size,
                        &buf,
                    )?;
                    return Ok(());
                }

                offset += rec_len;
            }
        }

        // No existing entry had room: grow the directory by one block and
        // write a single entry spanning it.
        let old_size = dir.size();
        let new_size = old_size + block_size as u64;
        self.resize(dir_id, dir, new_size)?;
        let new_block_index = (old_size as usize / block_size) as u32;
        let block = self.get_block(dir, new_block_index)?;

        let entry = DirEntry {
            offset: 0,
            inode: id,
            rec_len: block_size as u16,
            type_tag: type_tag(kind),
            name: name.to_vec(),
        };
        let mut buf = alloc::vec![0u8; block_size];
        buf[0..entry.rec_len as usize].copy_from_slice(&entry.encode());
        crate::fs::superblock::write_bytes(&self.dev, block as usize * block_size, &buf)
    }

    /// Allocate a new inode, populate it per `kind`, persist it, link it
    /// into `parent` as `name`, and return its id and in-memory record.
    /// Directories additionally get `.`/`..` entries and bump the parent's
    /// link count and directory count.
    pub fn create(
        &self,
        parent_id: u32,
        parent: &mut Inode,
        name: &[u8],
        kind: FileType,
        mode_bits: u16,
        now: u32,
    ) -> Result<(u32, Inode)> {
        if !parent.is_directory() {
            return Err(KernelError::NotADirectory);
        }
        let id = allocate(self, AllocKind::Inode)?;

        let mut inode = Inode::zeroed();
        inode.mode = kind.bits() | (mode_bits & 0x0FFF);
        inode.links_count = if kind == FileType::Directory { 2 } else { 1 };
        inode.atime = now;
        inode.ctime = now;
        inode.mtime = now;
        self.write_inode(id, &inode)?;

        self.insert(parent_id, parent, name, id, kind)?;

        if kind == FileType::Directory {
            self.resize(id, &mut inode, self.block_size() as u64)?;
            self.insert(id, &mut inode, b".", id, FileType::Directory)?;
            self.insert(id, &mut inode, b"..", parent_id, FileType::Directory)?;
            self.write_inode(id, &inode)?;

            parent.links_count += 1;
            self.write_inode(parent_id, parent)?;
            self.bump_group_dir_count(parent_id)?;
        }

        Ok((id, inode))
    }

    /// Hard-link an existing `node` into `dir` as `name`. Same-filesystem
    /// only: cross-filesystem links are rejected by construction since
    /// this type only ever names inodes on its own device.
    pub fn link(&self, dir_id: u32, dir: &mut Inode, name: &[u8], target_id: u32, target: &mut Inode) -> Result<()> {
        let kind = target.file_type().ok_or(KernelError::InvalidArgument)?;
        self.insert(dir_id, dir, name, target_id, kind)?;
        target.links_count += 1;
        self.write_inode(target_id, target)
    }

    fn bump_group_dir_count(&self, inode_id: u32) -> Result<()> {
        let sb = self.superblock.lock();
        let inodes_per_group = sb.inodes_per_group;
        sb.unlock();
        let (group, _) = crate::fs::inode::locate(inode_id, inodes_per_group);

        let mut descriptors = self.descriptors.lock();
        descriptors[group].used_dirs += 1;
        let offset = {
            let sb = self.superblock.lock();
            let off = crate::fs::superblock::descriptor_offset(&sb, group);
            sb.unlock();
            off
        };
        let bytes = descriptors[group].to_bytes();
        let result = crate::fs::superblock::write_bytes(&self.dev, offset, &bytes);
        descriptors.unlock();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::tests::format_minimal;
    use crate::fs::mount;

    fn make_root<D: BlockOps>(fs: &Ext2<D>) -> Inode {
        let mut root = Inode::zeroed();
        root.mode = FileType::Directory.bits() | 0o755;
        root.links_count = 2;
        fs.resize(crate::fs::ROOT_INODE, &mut root, fs.block_size() as u64)
            .unwrap();
        fs.insert(crate::fs::ROOT_INODE, &mut root, b".", crate::fs::ROOT_INODE, FileType::Directory)
            .unwrap();
        fs.insert(crate::fs::ROOT_INODE, &mut root, b"..", crate::fs::ROOT_INODE, FileType::Directory)
            .unwrap();
        root
    }

    #[test]
    fn insert_then_lookup_roundtrip() {
        let dev = format_minimal(8192, 128);
        let fs = mount(dev).unwrap();
        let mut root = make_root(&fs);

        let (id, _) = fs
            .create(crate::fs::ROOT_INODE, &mut root, b"hello.txt", FileType::Regular, 0o644, 0)
            .unwrap();
        assert_eq!(fs.lookup(&root, b"hello.txt").unwrap(), id);
    }

    #[test]
    fn create_directory_has_dot_and_dotdot() {
        let dev = format_minimal(8192, 128);
        let fs = mount(dev).unwrap();
        let mut root = make_root(&fs);
        let root_links_before = root.links_count;

        let (sub_id, sub) = fs
            .create(crate::fs::ROOT_INODE, &mut root, b"sub", FileType::Directory, 0o755, 0)
            .unwrap();

        assert_eq!(fs.lookup(&sub, b".").unwrap(), sub_id);
        assert_eq!(fs.lookup(&sub, b"..").unwrap(), crate::fs::ROOT_INODE);
        assert_eq!(root.links_count, root_links_before + 1);
    }

    #[test]
    fn directory_split_matches_scenario_s5() {
        let dev = format_minimal(8192, 128);
        let fs = mount(dev).unwrap();
        let mut root = make_root(&fs);

        // Re-lay the root's single block so its only entry is `"a"` sized
        // to span the whole block, matching S5's setup.
        let block_size = fs.block_size();
        let block = fs.get_block(&root, 0).unwrap();
        let entry = DirEntry {
            offset: 0,
            inode: 999,
            rec_len: block_size as u16,
            type_tag: type_tag(FileType::Regular),
            name: b"a".to_vec(),
        };
        let mut buf = alloc::vec![0u8; block_size];
        buf[0..entry.rec_len as usize].copy_from_slice(&entry.encode());
        crate::fs::superblock::write_bytes(&fs.dev, block as usize * block_size, &buf).unwrap();

        fs.insert(crate::fs::ROOT_INODE, &mut root, b"bb", 1000, FileType::Regular)
            .unwrap();

        assert_eq!(fs.lookup(&root, b"a").unwrap(), 999);
        assert_eq!(fs.lookup(&root, b"bb").unwrap(), 1000);
    }

    #[test]
    fn round_up_matches_spec_formula() {
        assert_eq!(round_up(8 + 1, 4), 12);
        assert_eq!(round_up(8 + 2, 4), 12);
        assert_eq!(round_up(8 + 3, 4), 12);
        assert_eq!(round_up(8 + 4, 4), 12);
        assert_eq!(round_up(8 + 5, 4), 16);
    }
}
