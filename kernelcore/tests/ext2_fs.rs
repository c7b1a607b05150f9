//! End-to-end coverage of the ext2 engine through its public mount/VFS
//! surface, independent of the crate's internal `#[cfg(test)]` harness.

use std::cell::RefCell;

use kernelcore::fs::inode::{FileType, Inode};
use kernelcore::fs::superblock::{
    self, GroupDescriptor, Superblock, EXT2_MAGIC, SUPERBLOCK_OFFSET,
};
use kernelcore::fs::{mount, vfs::AttrPatch, ROOT_INODE};
use substrate::{BlockOps, Sector};

const BLOCK_SIZE: u64 = 1024;

struct MemDevice {
    sectors: RefCell<Vec<[u8; 512]>>,
}

impl MemDevice {
    fn new(sector_count: usize) -> Self {
        Self {
            sectors: RefCell::new(vec![[0u8; 512]; sector_count]),
        }
    }
}

impl BlockOps for MemDevice {
    fn block_cnt(&self) -> usize {
        self.sectors.borrow().len()
    }
    fn block_size(&self) -> usize {
        512
    }
    fn read(&self, sector: Sector, buf: &mut [u8; 512]) -> bool {
        let sectors = self.sectors.borrow();
        match sectors.get(sector.into_usize()) {
            Some(s) => {
                buf.copy_from_slice(s);
                true
            }
            None => false,
        }
    }
    fn write(&self, sector: Sector, buf: &[u8; 512]) -> bool {
        let mut sectors = self.sectors.borrow_mut();
        match sectors.get_mut(sector.into_usize()) {
            Some(s) => {
                s.copy_from_slice(buf);
                true
            }
            None => false,
        }
    }
}

/// Build a minimal, internally-consistent one-group ext2 image, with a
/// root directory already laid out with `.`/`..` entries.
fn format_with_root(total_blocks: u32, inodes_count: u32) -> MemDevice {
    let block_size = 1024usize;
    let dev = MemDevice::new(total_blocks as usize * (block_size / 512));

    let sb = Superblock {
        total_inodes: inodes_count,
        total_blocks,
        reserved_blocks: 0,
        unallocated_blocks: total_blocks - 8,
        unallocated_inodes: inodes_count - 11,
        superblock_block_num: 1,
        block_size_shift: 0,
        fragment_size_shift: 0,
        blocks_per_group: total_blocks,
        fragments_per_group: total_blocks,
        inodes_per_group: inodes_count,
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
    };
    superblock::write_bytes(&dev, SUPERBLOCK_OFFSET, &sb.to_bytes()).unwrap();

    let inode_table_blocks = (inodes_count as usize * 128).div_ceil(block_size);
    let desc = GroupDescriptor {
        block_bitmap: 3,
        inode_bitmap: 4,
        inode_table: 5,
        free_blocks: sb.unallocated_blocks as u16,
        free_inodes: sb.unallocated_inodes as u16,
        used_dirs: 1,
    };
    superblock::write_bytes(&dev, superblock::descriptor_offset(&sb, 0), &desc.to_bytes())
        .unwrap();

    let first_free_block = 5 + inode_table_blocks;
    let mut bitmap = vec![0u8; block_size];
    for b in 0..first_free_block {
        bitmap[b / 8] |= 1 << (b % 8);
    }
    superblock::write_bytes(&dev, superblock::block_offset(&sb, 3), &bitmap).unwrap();

    let mut ibitmap = vec![0u8; block_size];
    for i in 0..10 {
        ibitmap[i / 8] |= 1 << (i % 8);
    }
    superblock::write_bytes(&dev, superblock::block_offset(&sb, 4), &ibitmap).unwrap();

    dev
}

fn mounted() -> kernelcore::fs::Ext2<MemDevice> {
    let dev = format_with_root(8192, 256);
    let fs = mount(dev).unwrap();

    // Lay out the root directory on disk directly, before anything caches
    // it through the node table, so the first `root()` call picks up a
    // fully-formed directory rather than a bare zeroed inode.
    let mut root = Inode::zeroed();
    root.mode = FileType::Directory.bits() | 0o755;
    root.links_count = 2;
    fs.resize(ROOT_INODE, &mut root, BLOCK_SIZE).unwrap();
    fs.insert(ROOT_INODE, &mut root, b".", ROOT_INODE, FileType::Directory)
        .unwrap();
    fs.insert(ROOT_INODE, &mut root, b"..", ROOT_INODE, FileType::Directory)
        .unwrap();
    fs.write_inode(ROOT_INODE, &root).unwrap();

    fs
}

#[test]
fn mount_rejects_bad_signature() {
    let dev = MemDevice::new(16);
    assert!(mount(dev).is_err());
}

#[test]
fn create_open_read_write_roundtrip() {
    let fs = mounted();
    let root = fs.root().unwrap();

    let file = fs
        .create(&root, b"greeting.txt", FileType::Regular, 0o644, 1000)
        .unwrap();

    let data = b"hello from the other side of the mount table";
    fs.write(&file, 0, data).unwrap();

    let mut out = vec![0u8; data.len()];
    fs.read(&file, 0, &mut out).unwrap();
    assert_eq!(out, data);

    let attr = fs.getattr(&file);
    assert_eq!(attr.size, data.len() as u64);
}

#[test]
fn resize_up_then_down_then_up_preserves_prefix() {
    let fs = mounted();
    let root = fs.root().unwrap();
    let file = fs
        .create(&root, b"grow.bin", FileType::Regular, 0o644, 1)
        .unwrap();

    let data = vec![0x42u8; 5000];
    fs.write(&file, 0, &data).unwrap();

    fs.resize_node(&file, 1000).unwrap();
    assert_eq!(fs.getattr(&file).size, 1000);

    fs.resize_node(&file, 5000).unwrap();
    let mut out = vec![0u8; 1000];
    fs.read(&file, 0, &mut out).unwrap();
    assert_eq!(out, &data[..1000]);

    // The region past the first shrink was freed, so growing back reads as
    // a hole (zero-filled), not the stale original content.
    let mut tail = vec![0u8; 1000];
    fs.read(&file, 2000, &mut tail).unwrap();
    assert_eq!(tail, vec![0u8; 1000]);
}

#[test]
fn mkdir_creates_dot_and_dotdot_and_bumps_parent_links() {
    let fs = mounted();
    let root = fs.root().unwrap();
    let before = fs.getattr(&root).links;

    let sub = fs
        .create(&root, b"subdir", FileType::Directory, 0o755, 1)
        .unwrap();

    let entries = fs.getdents(&sub).unwrap();
    let names: Vec<&[u8]> = entries.iter().map(|e| e.name.as_slice()).collect();
    assert!(names.contains(&b".".as_slice()));
    assert!(names.contains(&b"..".as_slice()));
    assert_eq!(entries.len(), 2);

    assert_eq!(fs.getattr(&root).links, before + 1);
}

#[test]
fn hardlink_shares_inode_and_bumps_link_count() {
    let fs = mounted();
    let root = fs.root().unwrap();
    let file = fs
        .create(&root, b"orig.txt", FileType::Regular, 0o644, 1)
        .unwrap();
    assert_eq!(fs.getattr(&file).links, 1);

    fs.link(&root, b"alias.txt", &file).unwrap();
    assert_eq!(fs.getattr(&file).links, 2);

    let via_alias = fs.lookup(&root, b"alias.txt").unwrap();
    assert_eq!(via_alias.ino, file.ino);
}

#[test]
fn setattr_updates_mode_bits_but_not_type() {
    let fs = mounted();
    let root = fs.root().unwrap();
    let file = fs
        .create(&root, b"perms.txt", FileType::Regular, 0o644, 1)
        .unwrap();

    fs.setattr(
        &file,
        AttrPatch {
            mode: Some(0o600),
            ..Default::default()
        },
    )
    .unwrap();

    let attr = fs.getattr(&file);
    assert_eq!(attr.mode & 0o777, 0o600);
    assert_eq!(attr.mode & 0xF000, FileType::Regular.bits());
}

#[test]
fn lookup_missing_name_is_not_found() {
    let fs = mounted();
    let root = fs.root().unwrap();
    assert!(fs.lookup(&root, b"nope").is_err());
}

#[test]
fn directory_insert_survives_block_boundary_growth() {
    let fs = mounted();
    let root = fs.root().unwrap();

    for i in 0..200u32 {
        let name = format!("f{i}");
        fs.create(&root, name.as_bytes(), FileType::Regular, 0o644, i)
            .unwrap();
    }

    for i in 0..200u32 {
        let name = format!("f{i}");
        assert!(fs.lookup(&root, name.as_bytes()).is_ok(), "missing {name}");
    }
}
