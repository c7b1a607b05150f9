//! Bitmap allocator (component F): allocate and free blocks and inodes by
//! scanning per-group bitmaps, keeping the descriptor and superblock
//! counts consistent with the bitmaps under their respective locks.

use substrate::BlockOps;

use crate::error::{KernelError, Result};
use crate::fs::superblock;
use crate::fs::Ext2;

/// Which kind of on-disk structure is being allocated: blocks and inodes
/// use the same scan but different bitmaps, counts, and cached hints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocKind {
    Block,
    Inode,
}

pub fn allocate<D: BlockOps>(fs: &Ext2<D>, kind: AllocKind) -> Result<u32> {
    let desc_guard = fs.descriptors.lock();

    {
        let sb = fs.superblock.lock();
        let unallocated = match kind {
            AllocKind::Block => sb.unallocated_blocks,
            AllocKind::Inode => sb.unallocated_inodes,
        };
        sb.unlock();
        if unallocated == 0 {
            desc_guard.unlock();
            return Err(KernelError::NoSpace);
        }
    }

    let hint = match kind {
        AllocKind::Block => &fs.lowest_free_block_group,
        AllocKind::Inode => &fs.lowest_free_inode_group,
    };
    let group_count = desc_guard.len();
    let mut group = hint.load(core::sync::atomic::Ordering::SeqCst).min(group_count.saturating_sub(1));
    let found_group = loop {
        if group >= group_count {
            desc_guard.unlock();
            return Err(KernelError::NoSpace);
        }
        let free = match kind {
            AllocKind::Block => desc_guard[group].free_blocks,
            AllocKind::Inode => desc_guard[group].free_inodes,
        };
        if free > 0 {
            break group;
        }
        group += 1;
    };
    hint.store(found_group, core::sync::atomic::Ordering::SeqCst);

    let structures_per_group = match kind {
        AllocKind::Block => fs.group_blocks(found_group),
        AllocKind::Inode => fs.group_inodes() as usize,
    };
    let bitmap_block = match kind {
        AllocKind::Block => desc_guard[found_group].block_bitmap,
        AllocKind::Inode => desc_guard[found_group].inode_bitmap,
    };
    let bitmap_bytes = structures_per_group.div_ceil(8);
    let bitmap_offset = fs.block_byte_offset(bitmap_block);

    let mut bitmap = alloc::vec![0u8; bitmap_bytes];
    if let Err(e) = superblock::read_bytes(&fs.dev, bitmap_offset, &mut bitmap) {
        desc_guard.unlock();
        return Err(e);
    }

    let local_index = match find_free_bit(&bitmap) {
        Some(i) => i,
        None => {
            desc_guard.unlock();
            return Err(KernelError::FilesystemCorrupted(
                "descriptor free count disagrees with bitmap",
            ));
        }
    };
    bitmap[local_index / 8] |= 1 << (local_index % 8);
    if let Err(e) = superblock::write_bytes(&fs.dev, bitmap_offset, &bitmap) {
        desc_guard.unlock();
        return Err(e);
    }

    {
        let mut descriptors = desc_guard;
        match kind {
            AllocKind::Block => descriptors[found_group].free_blocks -= 1,
            AllocKind::Inode => descriptors[found_group].free_inodes -= 1,
        }
        let now_empty = match kind {
            AllocKind::Block => descriptors[found_group].free_blocks == 0,
            AllocKind::Inode => descriptors[found_group].free_inodes == 0,
        };
        let offset = fs.descriptor_byte_offset(found_group);
        let bytes = descriptors[found_group].to_bytes();
        let result = superblock::write_bytes(&fs.dev, offset, &bytes);
        descriptors.unlock();
        result?;
        if now_empty {
            hint.fetch_max(found_group as usize + 1, core::sync::atomic::Ordering::SeqCst);
        }
    }

    {
        let mut sb = fs.superblock.lock();
        match kind {
            AllocKind::Block => sb.unallocated_blocks -= 1,
            AllocKind::Inode => sb.unallocated_inodes -= 1,
        }
        let bytes = sb.to_bytes();
        let result = superblock::write_bytes(&fs.dev, superblock::SUPERBLOCK_OFFSET, &bytes);
        sb.unlock();
        result?;
    }

    let group_size = match kind {
        AllocKind::Block => fs.blocks_per_group(),
        AllocKind::Inode => fs.group_inodes(),
    };
    let id = found_group as u32 * group_size + local_index as u32;
    Ok(match kind {
        // Block numbers are zero-based on disk; inode numbers are 1-based.
        AllocKind::Block => id,
        AllocKind::Inode => id + 1,
    })
}

pub fn free<D: BlockOps>(fs: &Ext2<D>, id: u32, kind: AllocKind) -> Result<()> {
    let group_size = match kind {
        AllocKind::Block => fs.blocks_per_group(),
        AllocKind::Inode => fs.group_inodes(),
    };
    let (group, local_index) = match kind {
        AllocKind::Block => ((id / group_size) as usize, (id % group_size) as usize),
        AllocKind::Inode => {
            let zero_based = id - 1;
            ((zero_based / group_size) as usize, (zero_based % group_size) as usize)
        }
    };

    let desc_guard = fs.descriptors.lock();
    let bitmap_block = match kind {
        AllocKind::Block => desc_guard[group].block_bitmap,
        AllocKind::Inode => desc_guard[group].inode_bitmap,
    };
    let structures_per_group = match kind {
        AllocKind::Block => fs.group_blocks(group),
        AllocKind::Inode => fs.group_inodes() as usize,
    };
    let bitmap_bytes = structures_per_group.div_ceil(8);
    let bitmap_offset = fs.block_byte_offset(bitmap_block);

    let mut bitmap = alloc::vec![0u8; bitmap_bytes];
    if let Err(e) = superblock::read_bytes(&fs.dev, bitmap_offset, &mut bitmap) {
        desc_guard.unlock();
        return Err(e);
    }
    bitmap[local_index / 8] &= !(1 << (local_index % 8));
    if let Err(e) = superblock::write_bytes(&fs.dev, bitmap_offset, &bitmap) {
        desc_guard.unlock();
        return Err(e);
    }

    {
        let mut descriptors = desc_guard;
        match kind {
            AllocKind::Block => descriptors[group].free_blocks += 1,
            AllocKind::Inode => descriptors[group].free_inodes += 1,
        }
        let offset = fs.descriptor_byte_offset(group);
        let bytes = descriptors[group].to_bytes();
        let result = superblock::write_bytes(&fs.dev, offset, &bytes);
        descriptors.unlock();
        result?;
    }

    let hint = match kind {
        AllocKind::Block => &fs.lowest_free_block_group,
        AllocKind::Inode => &fs.lowest_free_inode_group,
    };
    hint.fetch_min(group, core::sync::atomic::Ordering::SeqCst);

    {
        let mut sb = fs.superblock.lock();
        match kind {
            AllocKind::Block => sb.unallocated_blocks += 1,
            AllocKind::Inode => sb.unallocated_inodes += 1,
        }
        let bytes = sb.to_bytes();
        let result = superblock::write_bytes(&fs.dev, superblock::SUPERBLOCK_OFFSET, &bytes);
        sb.unlock();
        result?;
    }

    Ok(())
}

pub fn free_block<D: BlockOps>(fs: &Ext2<D>, block: u32) -> Result<()> {
    free(fs, block, AllocKind::Block)
}

/// Scan a bitmap byte-at-a-time for a clear bit, using
/// count-trailing-zeros on the bitwise complement of each byte.
fn find_free_bit(bitmap: &[u8]) -> Option<usize> {
    for (byte_idx, &byte) in bitmap.iter().enumerate() {
        let inverted = !byte;
        if inverted != 0 {
            let bit = inverted.trailing_zeros() as usize;
            return Some(byte_idx * 8 + bit);
        }
    }
    None
}

impl<D: BlockOps> Ext2<D> {
    fn blocks_per_group(&self) -> u32 {
        let sb = self.superblock.lock();
        let v = sb.blocks_per_group;
        sb.unlock();
        v
    }

    fn group_blocks(&self, group: usize) -> usize {
        let sb = self.superblock.lock();
        let total = sb.total_blocks;
        let per_group = sb.blocks_per_group;
        sb.unlock();
        let start = group as u32 * per_group;
        (total.saturating_sub(start)).min(per_group) as usize
    }

    fn group_inodes(&self) -> u32 {
        let sb = self.superblock.lock();
        let v = sb.inodes_per_group;
        sb.unlock();
        v
    }

    fn block_byte_offset(&self, block: u32) -> usize {
        let sb = self.superblock.lock();
        let off = superblock::block_offset(&sb, block);
        sb.unlock();
        off
    }

    fn descriptor_byte_offset(&self, group: usize) -> usize {
        let sb = self.superblock.lock();
        let off = superblock::descriptor_offset(&sb, group);
        sb.unlock();
        off
    }
}
