//! Superblock: geometry, dirty flag, and the allocation bitmaps.
//!
//! Disk layout, in sectors:
//!
//! ```text
//! [ 0 .. SUPER_SECTORS )            superblock (this module)
//! [ SUPER_SECTORS .. BLOCK_START )  inode table, 8 records per sector
//! [ BLOCK_START .. BLOCK_COUNT )    data region
//! ```
//!
//! The superblock region holds a small header followed by the inode bitmap
//! and the block bitmap. Block-bitmap bit `j` covers data sector
//! `j + BLOCK_START`; since the image is exactly `BLOCK_COUNT` sectors,
//! the trailing `BLOCK_START` bits fall past the end of the image and the
//! allocators skip them, along with bit 0.

use std::convert::TryInto;
use std::time::{SystemTime, UNIX_EPOCH};

use log::debug;
use static_assertions::const_assert;

use super::inode::IPB;
use super::{BLOCK_COUNT, INODE_COUNT};
use crate::disk::Disk;
use crate::error::{FsError, Result};
use crate::param::BSIZE;

pub const INODE_BITMAP_BYTES: usize = INODE_COUNT as usize / 8;
pub const BLOCK_BITMAP_BYTES: usize = BLOCK_COUNT as usize / 8;

/// block_count, inode_count, dirty flag, stamp, allocation cursor.
const HEADER_BYTES: usize = 20;
const INODE_BITMAP_OFF: usize = HEADER_BYTES;
const BLOCK_BITMAP_OFF: usize = INODE_BITMAP_OFF + INODE_BITMAP_BYTES;

/// Sectors occupied by the superblock region, header and bitmaps included.
pub const SUPER_SECTORS: u32 =
    ((BLOCK_BITMAP_OFF + BLOCK_BITMAP_BYTES + BSIZE - 1) / BSIZE) as u32;

/// First sector of the inode table.
pub const INODE_START: u32 = SUPER_SECTORS;

/// Sectors occupied by the inode table.
pub const INODE_SECTORS: u32 = INODE_COUNT / IPB as u32;

/// First sector of the data region.
pub const BLOCK_START: u32 = INODE_START + INODE_SECTORS;

// The bitmap widths are load-bearing for these offsets.
const_assert!(SUPER_SECTORS == 514);
const_assert!(BLOCK_START == 1010);
const_assert!(INODE_COUNT as usize % 8 == 0);
const_assert!(BLOCK_COUNT as usize % 8 == 0);

pub struct Superblock {
    pub block_count: u32,
    pub inode_count: u32,
    dirty: bool,
    stamp: u32,
    /// Where the rotating block scan resumes.
    alloc_cursor: u32,
    inode_bitmap: Box<[u8]>,
    block_bitmap: Box<[u8]>,
}

impl Superblock {
    /// An unformatted superblock: zero counts, empty bitmaps. Allocation
    /// fails until `format` establishes the geometry.
    pub fn new() -> Superblock {
        Superblock {
            block_count: 0,
            inode_count: 0,
            dirty: false,
            stamp: 0,
            alloc_cursor: 0,
            inode_bitmap: vec![0; INODE_BITMAP_BYTES].into_boxed_slice(),
            block_bitmap: vec![0; BLOCK_BITMAP_BYTES].into_boxed_slice(),
        }
    }

    /// Resets counts, cursor and both bitmaps to a freshly formatted state.
    pub fn format(&mut self) {
        self.block_count = BLOCK_COUNT;
        self.inode_count = INODE_COUNT;
        self.stamp = unix_now();
        self.dirty = true;
        self.alloc_cursor = 0;
        self.inode_bitmap.fill(0);
        self.block_bitmap.fill(0);
    }

    /// Whether the stored counts match the compiled-in geometry.
    pub fn is_formatted(&self) -> bool {
        self.block_count == BLOCK_COUNT && self.inode_count == INODE_COUNT
    }

    /// Reads the whole superblock region from sector 0.
    pub fn load(disk: &mut Disk) -> Result<Superblock> {
        let raw = disk.read(0, SUPER_SECTORS as usize)?;
        let word = |off: usize| u32::from_le_bytes(raw[off..off + 4].try_into().expect("header word"));
        let mut sb = Superblock::new();
        sb.block_count = word(0);
        sb.inode_count = word(4);
        sb.dirty = word(8) != 0;
        sb.stamp = word(12);
        sb.alloc_cursor = word(16);
        sb.inode_bitmap
            .copy_from_slice(&raw[INODE_BITMAP_OFF..INODE_BITMAP_OFF + INODE_BITMAP_BYTES]);
        sb.block_bitmap
            .copy_from_slice(&raw[BLOCK_BITMAP_OFF..BLOCK_BITMAP_OFF + BLOCK_BITMAP_BYTES]);
        Ok(sb)
    }

    /// Writes the whole superblock region back, clearing the dirty flag
    /// and refreshing the stamp.
    pub fn store(&mut self, disk: &mut Disk) -> Result<()> {
        self.dirty = false;
        self.stamp = unix_now();
        let mut raw = vec![0u8; SUPER_SECTORS as usize * BSIZE];
        raw[0..4].copy_from_slice(&self.block_count.to_le_bytes());
        raw[4..8].copy_from_slice(&self.inode_count.to_le_bytes());
        raw[8..12].copy_from_slice(&(self.dirty as u32).to_le_bytes());
        raw[12..16].copy_from_slice(&self.stamp.to_le_bytes());
        raw[16..20].copy_from_slice(&self.alloc_cursor.to_le_bytes());
        raw[INODE_BITMAP_OFF..INODE_BITMAP_OFF + INODE_BITMAP_BYTES]
            .copy_from_slice(&self.inode_bitmap);
        raw[BLOCK_BITMAP_OFF..BLOCK_BITMAP_OFF + BLOCK_BITMAP_BYTES]
            .copy_from_slice(&self.block_bitmap);
        disk.write(0, &raw)
    }

    /// Takes the first free inode number. Inode 0 is reserved.
    pub fn alloc_inode(&mut self) -> Result<u32> {
        for i in 1..self.inode_count {
            if !bit_test(&self.inode_bitmap, i) {
                bit_set(&mut self.inode_bitmap, i);
                self.dirty = true;
                debug!("alloc inode {}", i);
                return Ok(i);
            }
        }
        Err(FsError::OutOfInodes)
    }

    pub fn free_inode(&mut self, id: u32) {
        debug_assert!(bit_test(&self.inode_bitmap, id), "freeing free inode");
        bit_clear(&mut self.inode_bitmap, id);
        self.dirty = true;
    }

    /// Rotating first-fit over the block bitmap. The scan resumes where
    /// the previous allocation succeeded and wraps modulo `block_count`,
    /// skipping bit 0 and the tail bits that fall past the image.
    pub fn alloc_block(&mut self) -> Result<u32> {
        let total = self.block_count;
        if total <= BLOCK_START {
            return Err(FsError::OutOfBlocks);
        }
        let usable = total - BLOCK_START;
        for step in 0..total {
            let j = (self.alloc_cursor + step) % total;
            if j == 0 || j >= usable {
                continue;
            }
            if !bit_test(&self.block_bitmap, j) {
                bit_set(&mut self.block_bitmap, j);
                self.alloc_cursor = (j + 1) % total;
                self.dirty = true;
                return Ok(BLOCK_START + j);
            }
        }
        Err(FsError::OutOfBlocks)
    }

    /// Linear first-fit for `n` consecutive free blocks; returns the first
    /// physical sector. Nothing in the file system proper needs contiguous
    /// runs; this exists for raw-image consumers.
    pub fn alloc_contiguous_blocks(&mut self, n: u32) -> Result<u32> {
        if n == 0 {
            return Err(FsError::InvalidArg("empty contiguous request"));
        }
        let total = self.block_count;
        if total <= BLOCK_START {
            return Err(FsError::OutOfBlocks);
        }
        let usable = total - BLOCK_START;
        let mut j = 1;
        while j + n <= usable {
            match (j..j + n).find(|&k| bit_test(&self.block_bitmap, k)) {
                Some(k) => j = k + 1,
                None => {
                    for k in j..j + n {
                        bit_set(&mut self.block_bitmap, k);
                    }
                    self.dirty = true;
                    return Ok(BLOCK_START + j);
                }
            }
        }
        Err(FsError::OutOfBlocks)
    }

    pub fn free_block(&mut self, sector: u32) {
        debug_assert!(sector >= BLOCK_START);
        let j = sector - BLOCK_START;
        debug_assert!(bit_test(&self.block_bitmap, j), "freeing free block");
        bit_clear(&mut self.block_bitmap, j);
        self.dirty = true;
    }

    pub fn inode_in_use(&self, id: u32) -> bool {
        bit_test(&self.inode_bitmap, id)
    }

    pub fn block_in_use(&self, sector: u32) -> bool {
        sector >= BLOCK_START && bit_test(&self.block_bitmap, sector - BLOCK_START)
    }
}

fn bit_test(map: &[u8], i: u32) -> bool {
    map[i as usize / 8] & (1 << (i % 8)) != 0
}

fn bit_set(map: &mut [u8], i: u32) {
    map[i as usize / 8] |= 1 << (i % 8);
}

fn bit_clear(map: &mut [u8], i: u32) {
    map[i as usize / 8] &= !(1 << (i % 8));
}

fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}
