//! Flat single-level file system (C5): one inode block, one free-block
//! bitmap block, contiguous-run data blocks. No indirection, no extents —
//! a known limitation carried over unchanged from spec.md §3.
//!
//! Every operation round-trips through `BlockDevice` (composed, not a
//! concrete `BlockingDisk`, so this module is host-testable against a plain
//! `Vec`-backed stand-in the way `frame_pool`'s `Bitmap` and `disk`'s
//! `MemDisk` are). On real hardware `BlockDevice` is implemented by a small
//! adapter that threads the running thread's `Tcb` and the kernel
//! `Scheduler` through to `BlockingDisk::read`/`write` — see
//! `DiskBlockDevice` below — which is how a call to `File::Read` ends up
//! parking on C4 and resuming through C3, per §2's data-flow paragraph.
//!
//! Grounded on `examples/original_source/mp7/file_system.C`: the on-disk
//! byte layout, the inode-hole reuse scan, and the free-bitmap stride-8
//! encoding are all taken from there, with the bugs spec.md's REDESIGN
//! FLAGS calls out deliberately fixed rather than copied (see inline notes).

use core::convert::TryInto;

pub const SECTOR_SIZE: usize = crate::disk::SECTOR_SIZE;
const INODE_SIZE: usize = 16;
const INODE_TABLE_OFFSET: usize = 8;
/// How many 16-byte inode slots fit after the 8-byte header in one sector.
const MAX_INODES: usize = (SECTOR_SIZE - INODE_TABLE_OFFSET) / INODE_SIZE;
const BITMAP_STRIDE: usize = 8;
const BITMAP_ALLOC: u32 = 0x8000;
/// Blocks 0 and 1 (inode block, free-bitmap block) are permanently reserved;
/// encoded as a single sentinel word at bitmap offset 0 so the ordinary
/// free-scan (which only ever sets/clears the 0x8000 bit) naturally treats
/// entry 0 as forever-occupied without special-casing it.
const RESERVED_SENTINEL: u32 = 0xC000;

/// Configurable cap on file size, generalizing the original's hardcoded
/// `size_in_bytes < 32*512` (16 KiB) self-test budget (`SPEC_FULL.md` §3)
/// into a named constant instead of a magic number.
pub const MAX_FILE_BLOCKS: u32 = 32;

/// The capability a file system needs from the disk layer: sector
/// read/write, nothing else. The real implementation (`DiskBlockDevice`)
/// composes a `BlockingDisk` plus the scheduler/thread context a blocking
/// read or write needs to park and resume through C3.
pub trait BlockDevice {
    fn read_block(&mut self, block_no: u32, buf: &mut [u8; SECTOR_SIZE]);
    fn write_block(&mut self, block_no: u32, buf: &mut [u8; SECTOR_SIZE]);
}

#[cfg(not(test))]
pub use hw::DiskBlockDevice;

#[cfg(not(test))]
mod hw {
    use super::BlockDevice;
    use crate::disk::{BlockingDisk, SimpleDiskIo, SECTOR_SIZE};
    use crate::scheduler::{Scheduler, Tcb};

    /// Adapter binding a `BlockingDisk` to the running thread's context, so
    /// `FileSystem`'s generic `BlockDevice` calls turn into blocking reads
    /// and writes that may park `current` and yield through `sched`.
    pub struct DiskBlockDevice<'a, D: SimpleDiskIo> {
        pub disk: &'a mut BlockingDisk<D>,
        pub sched: &'a mut Scheduler,
        pub current: *mut Tcb,
    }

    impl<'a, D: SimpleDiskIo> BlockDevice for DiskBlockDevice<'a, D> {
        fn read_block(&mut self, block_no: u32, buf: &mut [u8; SECTOR_SIZE]) {
            self.disk.read(self.sched, self.current, block_no, buf);
        }

        fn write_block(&mut self, block_no: u32, buf: &mut [u8; SECTOR_SIZE]) {
            self.disk.write(self.sched, self.current, block_no, buf);
        }
    }
}

/// A live file handle: not itself cached anywhere, just enough state to
/// serve sequential Read/Write against the disk. `inode_offset` is the
/// byte offset of this file's inode record within block 0, spec'd so that
/// `Write` can persist a grown `size_in_bytes` without re-scanning.
pub struct FileHandle {
    pub file_id: u32,
    pub start_block: u32,
    pub size_in_bytes: u32,
    pub inode_offset: usize,
    pub current_pos: u32,
}

/// Write the inode block `(size, num_created=0)` and the free-bitmap block
/// with blocks 0/1 marked reserved, zero elsewhere.
pub fn format<D: BlockDevice>(disk: &mut D, size_in_sectors: u32) {
    let mut inode_block = [0u8; SECTOR_SIZE];
    inode_block[0..4].copy_from_slice(&size_in_sectors.to_le_bytes());
    inode_block[4..8].copy_from_slice(&0u32.to_le_bytes());
    disk.write_block(0, &mut inode_block);

    let mut bitmap_block = [0u8; SECTOR_SIZE];
    bitmap_block[0..4].copy_from_slice(&RESERVED_SENTINEL.to_le_bytes());
    disk.write_block(1, &mut bitmap_block);
}

/// Trivially-durable file system: every lookup re-reads block 0 (and block
/// 1, when it touches block allocation) rather than caching anything in
/// memory, at the cost of an I/O round trip per operation.
pub struct FileSystem<'d, D: BlockDevice> {
    disk: &'d mut D,
}

impl<'d, D: BlockDevice> FileSystem<'d, D> {
    /// Remember the disk handle; no other state is cached.
    pub fn mount(disk: &'d mut D) -> Self {
        FileSystem { disk }
    }

    fn read_inode_block(&mut self) -> ([u8; SECTOR_SIZE], u32) {
        let mut block = [0u8; SECTOR_SIZE];
        self.disk.read_block(0, &mut block);
        let num_created = u32::from_le_bytes(block[4..8].try_into().unwrap());
        (block, num_created)
    }

    fn inode_at(block: &[u8; SECTOR_SIZE], slot: u32) -> (u32, u32, u32, u32, usize) {
        let off = INODE_TABLE_OFFSET + (slot as usize) * INODE_SIZE;
        let id = u32::from_le_bytes(block[off..off + 4].try_into().unwrap());
        let size = u32::from_le_bytes(block[off + 4..off + 8].try_into().unwrap());
        let start_block = u32::from_le_bytes(block[off + 8..off + 12].try_into().unwrap());
        let is_deleted = u32::from_le_bytes(block[off + 12..off + 16].try_into().unwrap());
        (id, size, start_block, is_deleted, off)
    }

    /// Scan the inode array; return a fresh handle for the first
    /// non-deleted matching inode.
    pub fn lookup_file(&mut self, file_id: u32) -> Option<FileHandle> {
        let (block, num_created) = self.read_inode_block();
        for slot in 0..num_created {
            let (id, size, start_block, is_deleted, off) = Self::inode_at(&block, slot);
            if id == file_id && is_deleted == 0 {
                return Some(FileHandle {
                    file_id,
                    start_block,
                    size_in_bytes: size,
                    inode_offset: off,
                    current_pos: 0,
                });
            }
        }
        None
    }

    /// Find a free inode slot (a deleted hole in `[0, num_created)`, else
    /// `num_created` itself) and a free data block, then persist both.
    ///
    /// `num_created` is treated as "highest slot index ever used", per the
    /// resolved open question in `SPEC_FULL.md` §4: reusing a hole leaves
    /// `num_created` untouched, while appending at the end grows it.
    pub fn create_file(&mut self, file_id: u32) -> bool {
        let (mut inode_block, num_created) = self.read_inode_block();
        let fs_size = u32::from_le_bytes(inode_block[0..4].try_into().unwrap());

        let mut slot = num_created;
        for i in 0..num_created {
            let (_, _, _, is_deleted, _) = Self::inode_at(&inode_block, i);
            if is_deleted == 1 {
                slot = i;
                break;
            }
        }
        let appending = slot == num_created;
        if appending && INODE_TABLE_OFFSET + (num_created as usize + 1) * INODE_SIZE > SECTOR_SIZE
        {
            return false;
        }
        if appending && num_created as usize >= MAX_INODES {
            return false;
        }

        let mut bitmap_block = [0u8; SECTOR_SIZE];
        self.disk.read_block(1, &mut bitmap_block);

        // Stride-8 scan from offset 0: entry 0 carries the permanent
        // reserved sentinel, so it is skipped by the ordinary `& 0x8000`
        // test without any special-cased start offset (the original scan
        // started at byte 2, which is mis-aligned with its own stride-8
        // entries and corrupts every subsequent read — not copied here).
        let mut found = None;
        let mut offset = 0usize;
        while offset + 4 <= SECTOR_SIZE {
            let val = u32::from_le_bytes(bitmap_block[offset..offset + 4].try_into().unwrap());
            if (val & BITMAP_ALLOC) == 0 {
                let block_num = (offset as u32) * 8;
                if block_num < fs_size {
                    found = Some((offset, block_num));
                    break;
                }
            }
            offset += BITMAP_STRIDE;
        }

        let (bm_off, block_num) = match found {
            Some(x) => x,
            None => return false,
        };

        bitmap_block[bm_off..bm_off + 4].copy_from_slice(&BITMAP_ALLOC.to_le_bytes());

        let off = INODE_TABLE_OFFSET + (slot as usize) * INODE_SIZE;
        inode_block[off..off + 4].copy_from_slice(&file_id.to_le_bytes());
        inode_block[off + 4..off + 8].copy_from_slice(&0u32.to_le_bytes());
        inode_block[off + 8..off + 12].copy_from_slice(&block_num.to_le_bytes());
        inode_block[off + 12..off + 16].copy_from_slice(&0u32.to_le_bytes());

        if appending {
            inode_block[4..8].copy_from_slice(&(num_created + 1).to_le_bytes());
        }

        self.disk.write_block(1, &mut bitmap_block);
        self.disk.write_block(0, &mut inode_block);
        true
    }

    /// Mark the inode deleted and free its starting block.
    pub fn delete_file(&mut self, file_id: u32) -> bool {
        let (mut inode_block, num_created) = self.read_inode_block();

        for slot in 0..num_created {
            let (id, _, start_block, is_deleted, off) = Self::inode_at(&inode_block, slot);
            if id == file_id && is_deleted == 0 {
                inode_block[off + 12..off + 16].copy_from_slice(&1u32.to_le_bytes());

                let mut bitmap_block = [0u8; SECTOR_SIZE];
                self.disk.read_block(1, &mut bitmap_block);
                let bm_off = (start_block / 8) as usize;
                bitmap_block[bm_off..bm_off + 4].copy_from_slice(&0u32.to_le_bytes());

                self.disk.write_block(1, &mut bitmap_block);
                self.disk.write_block(0, &mut inode_block);
                return true;
            }
        }
        false
    }

    fn persist_size(&mut self, f: &FileHandle) {
        let mut inode_block = [0u8; SECTOR_SIZE];
        self.disk.read_block(0, &mut inode_block);
        inode_block[f.inode_offset + 4..f.inode_offset + 8]
            .copy_from_slice(&f.size_in_bytes.to_le_bytes());
        self.disk.write_block(0, &mut inode_block);
    }

    /// Sequential read of up to `n` bytes (capped by `buf.len()` and by how
    /// much of the file remains). Returns the number of bytes actually
    /// transferred and advances `f.current_pos` by exactly that amount.
    ///
    /// The original's terminal branch advanced `current_pos` by a variable
    /// it had already zeroed out a line earlier (a copy-paste no-op, per
    /// spec.md's REDESIGN FLAGS); here the per-chunk advance is computed
    /// and applied in the same step, every iteration, so there is no
    /// separate "final" branch to get wrong.
    pub fn read(&mut self, f: &mut FileHandle, n: u32, buf: &mut [u8]) -> u32 {
        let remaining_in_file = f.size_in_bytes.saturating_sub(f.current_pos);
        let to_read = n.min(remaining_in_file).min(buf.len() as u32);

        let mut done = 0u32;
        let mut sector = [0u8; SECTOR_SIZE];
        while done < to_read {
            let block_no = f.start_block + f.current_pos / SECTOR_SIZE as u32;
            let sector_off = (f.current_pos % SECTOR_SIZE as u32) as usize;
            self.disk.read_block(block_no, &mut sector);

            let chunk = (SECTOR_SIZE - sector_off).min((to_read - done) as usize);
            buf[done as usize..done as usize + chunk]
                .copy_from_slice(&sector[sector_off..sector_off + chunk]);

            done += chunk as u32;
            f.current_pos += chunk as u32;
        }
        done
    }

    /// Sequential write of up to `n` bytes from `buf`, read-modify-write
    /// per touched sector. Extends `size_in_bytes` (and persists the new
    /// length in the on-disk inode) when the write grows the file.
    pub fn write(&mut self, f: &mut FileHandle, n: u32, buf: &[u8]) -> u32 {
        let to_write = n.min(buf.len() as u32);

        let mut done = 0u32;
        let mut sector = [0u8; SECTOR_SIZE];
        while done < to_write {
            let block_no = f.start_block + f.current_pos / SECTOR_SIZE as u32;
            let sector_off = (f.current_pos % SECTOR_SIZE as u32) as usize;
            self.disk.read_block(block_no, &mut sector);

            let chunk = (SECTOR_SIZE - sector_off).min((to_write - done) as usize);
            sector[sector_off..sector_off + chunk]
                .copy_from_slice(&buf[done as usize..done as usize + chunk]);
            self.disk.write_block(block_no, &mut sector);

            done += chunk as u32;
            f.current_pos += chunk as u32;
        }

        if f.current_pos > f.size_in_bytes {
            f.size_in_bytes = f.current_pos;
            assert!(
                f.size_in_bytes <= MAX_FILE_BLOCKS * SECTOR_SIZE as u32,
                "file grew past the configured size budget"
            );
            self.persist_size(f);
        }
        done
    }

    /// Zero the file's size in place (its data blocks are left as-is; only
    /// the recorded length changes).
    pub fn rewrite(&mut self, f: &mut FileHandle) {
        f.size_in_bytes = 0;
        f.current_pos = 0;
        self.persist_size(f);
    }

    /// Reset the read/write position only; `size_in_bytes` is untouched.
    pub fn reset(&mut self, f: &mut FileHandle) {
        f.current_pos = 0;
    }

    /// True once `current_pos` has reached `size_in_bytes` (including at
    /// position 0 of a zero-length file).
    pub fn eof(&self, f: &FileHandle) -> bool {
        f.current_pos == f.size_in_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct VecDisk {
        blocks: Vec<[u8; SECTOR_SIZE]>,
    }

    impl VecDisk {
        fn new(n: usize) -> Self {
            VecDisk {
                blocks: vec![[0u8; SECTOR_SIZE]; n],
            }
        }
    }

    impl BlockDevice for VecDisk {
        fn read_block(&mut self, block_no: u32, buf: &mut [u8; SECTOR_SIZE]) {
            buf.copy_from_slice(&self.blocks[block_no as usize]);
        }
        fn write_block(&mut self, block_no: u32, buf: &mut [u8; SECTOR_SIZE]) {
            self.blocks[block_no as usize].copy_from_slice(buf);
        }
    }

    fn formatted(n_blocks: usize) -> VecDisk {
        let mut disk = VecDisk::new(n_blocks);
        format(&mut disk, n_blocks as u32);
        disk
    }

    #[test]
    fn create_lookup_write_reset_read_roundtrip() {
        let mut disk = formatted(256);
        let mut fs = FileSystem::mount(&mut disk);

        assert!(fs.create_file(7));
        let mut f = fs.lookup_file(7).expect("just created");

        let written = fs.write(&mut f, 5, b"hello");
        assert_eq!(written, 5);
        assert_eq!(f.size_in_bytes, 5);

        fs.reset(&mut f);
        assert_eq!(f.current_pos, 0);

        let mut buf = [0u8; 5];
        let got = fs.read(&mut f, 5, &mut buf);
        assert_eq!(got, 5);
        assert_eq!(&buf, b"hello");
        assert!(fs.eof(&f));
    }

    #[test]
    fn lookup_of_unknown_id_is_none() {
        let mut disk = formatted(256);
        let mut fs = FileSystem::mount(&mut disk);
        assert!(fs.lookup_file(42).is_none());
    }

    #[test]
    fn delete_then_lookup_is_none_and_block_is_freed() {
        let mut disk = formatted(256);
        let mut fs = FileSystem::mount(&mut disk);

        assert!(fs.create_file(7));
        let f = fs.lookup_file(7).unwrap();
        let start_block = f.start_block;

        assert!(fs.delete_file(7));
        assert!(fs.lookup_file(7).is_none());

        let mut bitmap_block = [0u8; SECTOR_SIZE];
        fs.disk.read_block(1, &mut bitmap_block);
        let bm_off = (start_block / 8) as usize;
        let val = u32::from_le_bytes(bitmap_block[bm_off..bm_off + 4].try_into().unwrap());
        assert_eq!(val & BITMAP_ALLOC, 0, "freed block must be marked free");
    }

    #[test]
    fn delete_of_unknown_id_fails() {
        let mut disk = formatted(256);
        let mut fs = FileSystem::mount(&mut disk);
        assert!(!fs.delete_file(99));
    }

    #[test]
    fn deleted_slot_is_reused_before_growing_num_created() {
        let mut disk = formatted(256);
        let mut fs = FileSystem::mount(&mut disk);

        assert!(fs.create_file(1));
        assert!(fs.create_file(2));
        assert!(fs.delete_file(1));
        assert!(fs.create_file(3));

        let mut inode_block = [0u8; SECTOR_SIZE];
        fs.disk.read_block(0, &mut inode_block);
        let num_created = u32::from_le_bytes(inode_block[4..8].try_into().unwrap());
        assert_eq!(num_created, 2, "reusing a hole must not grow num_created");

        assert!(fs.lookup_file(3).is_some());
        assert!(fs.lookup_file(1).is_none());
        assert!(fs.lookup_file(2).is_some());
    }

    #[test]
    fn write_spanning_multiple_sectors_reads_back_whole() {
        let mut disk = formatted(256);
        let mut fs = FileSystem::mount(&mut disk);
        assert!(fs.create_file(1));
        let mut f = fs.lookup_file(1).unwrap();

        let mut payload = [0u8; SECTOR_SIZE + 100];
        for (i, b) in payload.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        let written = fs.write(&mut f, payload.len() as u32, &payload);
        assert_eq!(written, payload.len() as u32);

        fs.reset(&mut f);
        let mut readback = [0u8; SECTOR_SIZE + 100];
        let got = fs.read(&mut f, readback.len() as u32, &mut readback);
        assert_eq!(got as usize, payload.len());
        assert_eq!(&readback[..], &payload[..]);
    }

    #[test]
    fn rewrite_zeroes_size_but_leaves_position_alone_until_reset() {
        let mut disk = formatted(256);
        let mut fs = FileSystem::mount(&mut disk);
        assert!(fs.create_file(1));
        let mut f = fs.lookup_file(1).unwrap();
        fs.write(&mut f, 5, b"hello");
        fs.rewrite(&mut f);
        assert_eq!(f.size_in_bytes, 0);
        assert_eq!(f.current_pos, 0);
        assert!(fs.eof(&f));
    }

    #[test]
    fn zero_length_file_is_eof_at_position_zero() {
        let mut disk = formatted(256);
        let mut fs = FileSystem::mount(&mut disk);
        assert!(fs.create_file(1));
        let f = fs.lookup_file(1).unwrap();
        assert!(fs.eof(&f));
    }
}
