//! Superblock and block-group-descriptor store (component E).
//!
//! Both records are read once at mount and cached in memory; every mutation
//! re-serializes the in-memory copy back to the backing device under the
//! appropriate mutex. Neither is ever read back from disk again after
//! mount — callers that need the current count go through this store, not
//! through a fresh disk read.

use substrate::{BlockOps, Sector};

use crate::error::{KernelError, Result};

/// Signature that must appear in a valid ext2 superblock.
pub const EXT2_MAGIC: u16 = 0xEF53;

/// Byte offset of the superblock from the start of the device.
pub const SUPERBLOCK_OFFSET: usize = 1024;
/// Size in bytes of the on-disk superblock record.
pub const SUPERBLOCK_SIZE: usize = 1024;

/// The on-disk superblock, decoded into host-native fields. Field order
/// matches the on-disk layout; `raw_bytes`/`from_raw_bytes` (de)serialize
/// it for I/O.
#[derive(Debug, Clone, Copy)]
pub struct Superblock {
    pub total_inodes: u32,
    pub total_blocks: u32,
    pub reserved_blocks: u32,
    pub unallocated_blocks: u32,
    pub unallocated_inodes: u32,
    pub superblock_block_num: u32,
    pub block_size_shift: u32,
    pub fragment_size_shift: u32,
    pub blocks_per_group: u32,
    pub fragments_per_group: u32,
    pub inodes_per_group: u32,
    pub last_mount_time: u32,
    pub last_write_time: u32,
    pub mounts_since_check: u16,
    pub max_mounts_before_check: u16,
    pub signature: u16,
    pub fs_state: u16,
    pub error_behavior: u16,
    pub version_minor: u16,
    pub last_check_time: u32,
    pub check_interval: u32,
    pub os_id: u32,
    pub version_major: u32,
    /// First inode usable for user files. Reserved inodes (the bad-blocks
    /// inode, the root directory, ...) sit below this.
    pub first_usable_inode: u32,
    /// Size in bytes of one on-disk inode record.
    pub inode_size: u16,
    pub required_features: u32,
    pub readonly_features: u32,
}

/// The only required-feature bits this implementation understands. Any
/// other bit set in `required_features` must fail mount (ext2 base format
/// with indirect blocks only; no journaling, no extents, no 64-bit).
pub const SUPPORTED_REQUIRED_FEATURES: u32 = 0;

impl Superblock {
    pub fn block_size(&self) -> usize {
        1024usize << self.block_size_shift
    }

    pub fn group_count(&self) -> usize {
        (self.total_blocks as usize).div_ceil(self.blocks_per_group as usize)
    }

    /// Decode from the 1024-byte on-disk record.
    pub fn from_bytes(b: &[u8; SUPERBLOCK_SIZE]) -> Self {
        let u32_at = |o: usize| u32::from_le_bytes(b[o..o + 4].try_into().unwrap());
        let u16_at = |o: usize| u16::from_le_bytes(b[o..o + 2].try_into().unwrap());
        let version_major = u32_at(76);
        let (first_usable_inode, inode_size, required_features, readonly_features) =
            if version_major >= 1 {
                (u32_at(84), u16_at(88), u32_at(96), u32_at(100))
            } else {
                (11, 128, 0, 0)
            };
        Self {
            total_inodes: u32_at(0),
            total_blocks: u32_at(4),
            reserved_blocks: u32_at(8),
            unallocated_blocks: u32_at(12),
            unallocated_inodes: u32_at(16),
            superblock_block_num: u32_at(20),
            block_size_shift: u32_at(24),
            fragment_size_shift: u32_at(28),
            blocks_per_group: u32_at(32),
            fragments_per_group: u32_at(36),
            inodes_per_group: u32_at(40),
            last_mount_time: u32_at(44),
            last_write_time: u32_at(48),
            mounts_since_check: u16_at(52),
            max_mounts_before_check: u16_at(54),
            signature: u16_at(56),
            fs_state: u16_at(58),
            error_behavior: u16_at(60),
            version_minor: u16_at(62),
            last_check_time: u32_at(64),
            check_interval: u32_at(68),
            os_id: u32_at(72),
            version_major,
            first_usable_inode,
            inode_size,
            required_features,
            readonly_features,
        }
    }

    pub fn to_bytes(&self) -> [u8; SUPERBLOCK_SIZE] {
        let mut b = [0u8; SUPERBLOCK_SIZE];
        let put_u32 = |b: &mut [u8; SUPERBLOCK_SIZE], o: usize, v: u32| {
            b[o..o + 4].copy_from_slice(&v.to_le_bytes());
        };
        let put_u16 = |b: &mut [u8; SUPERBLOCK_SIZE], o: usize, v: u16| {
            b[o..o + 2].copy_from_slice(&v.to_le_bytes());
        };
        put_u32(&mut b, 0, self.total_inodes);
        put_u32(&mut b, 4, self.total_blocks);
        put_u32(&mut b, 8, self.reserved_blocks);
        put_u32(&mut b, 12, self.unallocated_blocks);
        put_u32(&mut b, 16, self.unallocated_inodes);
        put_u32(&mut b, 20, self.superblock_block_num);
        put_u32(&mut b, 24, self.block_size_shift);
        put_u32(&mut b, 28, self.fragment_size_shift);
        put_u32(&mut b, 32, self.blocks_per_group);
        put_u32(&mut b, 36, self.fragments_per_group);
        put_u32(&mut b, 40, self.inodes_per_group);
        put_u32(&mut b, 44, self.last_mount_time);
        put_u32(&mut b, 48, self.last_write_time);
        put_u16(&mut b, 52, self.mounts_since_check);
        put_u16(&mut b, 54, self.max_mounts_before_check);
        put_u16(&mut b, 56, self.signature);
        put_u16(&mut b, 58, self.fs_state);
        put_u16(&mut b, 60, self.error_behavior);
        put_u16(&mut b, 62, self.version_minor);
        put_u32(&mut b, 64, self.last_check_time);
        put_u32(&mut b, 68, self.check_interval);
        put_u32(&mut b, 72, self.os_id);
        put_u32(&mut b, 76, self.version_major);
        if self.version_major >= 1 {
            put_u32(&mut b, 84, self.first_usable_inode);
            put_u16(&mut b, 88, self.inode_size);
            put_u32(&mut b, 96, self.required_features);
            put_u32(&mut b, 100, self.readonly_features);
        }
        b
    }
}

/// Per-block-group on-disk record: bitmap locations, table location, and
/// free counts.
#[derive(Debug, Clone, Copy, Default)]
pub struct GroupDescriptor {
    pub block_bitmap: u32,
    pub inode_bitmap: u32,
    pub inode_table: u32,
    pub free_blocks: u16,
    pub free_inodes: u16,
    pub used_dirs: u16,
}

pub const DESCRIPTOR_SIZE: usize = 32;

impl GroupDescriptor {
    pub fn from_bytes(b: &[u8]) -> Self {
        let u32_at = |o: usize| u32::from_le_bytes(b[o..o + 4].try_into().unwrap());
        let u16_at = |o: usize| u16::from_le_bytes(b[o..o + 2].try_into().unwrap());
        Self {
            block_bitmap: u32_at(0),
            inode_bitmap: u32_at(4),
            inode_table: u32_at(8),
            free_blocks: u16_at(12),
            free_inodes: u16_at(14),
            used_dirs: u16_at(16),
        }
    }

    pub fn to_bytes(&self) -> [u8; DESCRIPTOR_SIZE] {
        let mut b = [0u8; DESCRIPTOR_SIZE];
        b[0..4].copy_from_slice(&self.block_bitmap.to_le_bytes());
        b[4..8].copy_from_slice(&self.inode_bitmap.to_le_bytes());
        b[8..12].copy_from_slice(&self.inode_table.to_le_bytes());
        b[12..14].copy_from_slice(&self.free_blocks.to_le_bytes());
        b[14..16].copy_from_slice(&self.free_inodes.to_le_bytes());
        b[16..18].copy_from_slice(&self.used_dirs.to_le_bytes());
        b
    }
}

/// Read `len` bytes at byte offset `offset` from `dev`, a sector at a time.
/// Short transfers surface as [`KernelError::IoError`].
pub fn read_bytes(dev: &dyn BlockOps, offset: usize, out: &mut [u8]) -> Result<()> {
    let mut done = 0;
    while done < out.len() {
        let abs = offset + done;
        let sector = Sector(abs / 512);
        let in_sector = abs % 512;
        let mut buf = [0u8; 512];
        if !dev.read(sector, &mut buf) {
            return Err(KernelError::IoError);
        }
        let take = (512 - in_sector).min(out.len() - done);
        out[done..done + take].copy_from_slice(&buf[in_sector..in_sector + take]);
        done += take;
    }
    Ok(())
}

/// Write `data` at byte offset `offset` into `dev`, read-modify-writing
/// partial sectors. Short transfers surface as [`KernelError::IoError`].
pub fn write_bytes(dev: &dyn BlockOps, offset: usize, data: &[u8]) -> Result<()> {
    let mut done = 0;
    while done < data.len() {
        let abs = offset + done;
        let sector = Sector(abs / 512);
        let in_sector = abs % 512;
        let take = (512 - in_sector).min(data.len() - done);
        let mut buf = [0u8; 512];
        if take != 512 {
            if !dev.read(sector, &mut buf) {
                return Err(KernelError::IoError);
            }
        }
        buf[in_sector..in_sector + take].copy_from_slice(&data[done..done + take]);
        if !dev.write(sector, &buf) {
            return Err(KernelError::IoError);
        }
        done += take;
    }
    Ok(())
}

/// Byte offset of the descriptor table's `group`-th entry. The table is
/// appended immediately after the block containing the superblock.
pub fn descriptor_offset(sb: &Superblock, group: usize) -> usize {
    let first_data_block = if sb.block_size_shift == 0 { 1 } else { 0 };
    let table_block = first_data_block + 1;
    table_block * sb.block_size() + group * DESCRIPTOR_SIZE
}

pub fn block_offset(sb: &Superblock, block: u32) -> usize {
    block as usize * sb.block_size()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Superblock {
        Superblock {
            total_inodes: 128,
            total_blocks: 8192,
            reserved_blocks: 0,
            unallocated_blocks: 8000,
            unallocated_inodes: 117,
            superblock_block_num: 1,
            block_size_shift: 0,
            fragment_size_shift: 0,
            blocks_per_group: 8192,
            fragments_per_group: 8192,
            inodes_per_group: 128,
            last_mount_time: 0,
            last_write_time: 0,
            mounts_since_check: 0,
            max_mounts_before_check: 20,
            signature: EXT2_MAGIC,
            fs_state: 1,
            error_behavior: 1,
            version_minor: 0,
            last_check_time: 0,
            check_interval: 0,
            os_id: 0,
            version_major: 1,
            first_usable_inode: 11,
            inode_size: 128,
            required_features: 0,
            readonly_features: 0,
        }
    }

    #[test]
    fn superblock_roundtrip() {
        let sb = sample();
        let bytes = sb.to_bytes();
        let back = Superblock::from_bytes(&bytes);
        assert_eq!(back.signature, EXT2_MAGIC);
        assert_eq!(back.total_blocks, sb.total_blocks);
        assert_eq!(back.unallocated_blocks, sb.unallocated_blocks);
        assert_eq!(back.block_size(), 1024);
    }

    #[test]
    fn descriptor_roundtrip() {
        let desc = GroupDescriptor {
            block_bitmap: 3,
            inode_bitmap: 4,
            inode_table: 5,
            free_blocks: 100,
            free_inodes: 50,
            used_dirs: 2,
        };
        let back = GroupDescriptor::from_bytes(&desc.to_bytes());
        assert_eq!(back.block_bitmap, 3);
        assert_eq!(back.free_blocks, 100);
    }
}
