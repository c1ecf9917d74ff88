//! Buffer cache.
//!
//! The buffer cache is a fixed pool of slots holding cached copies of disk
//! sector contents. Caching sectors in memory reduces the number of disk
//! transfers; because this system is single-threaded, the cache also acts
//! as the single point of truth for a sector between flushes.
//!
//! Interface:
//! * To get a buffer for a particular sector, call `get`.
//! * For a freshly allocated sector, call `get_zeroed`; it never touches
//!   the disk and leaves the slot dirty, so a recycled sector cannot leak
//!   stale bytes into an index block or a file tail.
//! * `write` copies bytes into a cached sector and marks it dirty; a write
//!   that ends exactly on the sector's last byte is flushed eagerly, which
//!   keeps sequential appends from piling up dirty slots.
//! * The cache is otherwise write-back: dirty slots reach the disk on
//!   eviction and on `flush_all`.
//!
//! A handle returned by `get` is valid only until the next call that can
//! evict, which the borrow checker enforces here: the handle borrows the
//! cache itself.

use std::collections::VecDeque;
use std::mem;

use log::trace;
use zerocopy::{FromBytes, LayoutVerified};

use crate::disk::Disk;
use crate::error::Result;
use crate::param::{BSIZE, NBUF};

/// One sector's worth of cached bytes. The alignment makes the `u32`
/// pointer view of index sectors well-formed.
#[repr(align(4))]
pub struct BufData(pub [u8; BSIZE]);

impl BufData {
    /// The sector viewed as an array of block pointers.
    pub fn ptrs(&self) -> &[u32] {
        LayoutVerified::<_, [u32]>::new_slice(&self.0[..])
            .expect("sector is pointer-aligned")
            .into_slice()
    }

    /// Copies out the record of type `T` stored at byte offset `off`.
    pub fn read_record<T: FromBytes + Copy>(&self, off: usize) -> T {
        let lv = LayoutVerified::<_, T>::new(&self.0[off..off + mem::size_of::<T>()])
            .expect("record is aligned and within the sector");
        *lv
    }
}

impl std::ops::Deref for BufData {
    type Target = [u8; BSIZE];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// One cache slot. `blockno == 0` marks a free slot; sector 0 belongs to
/// the superblock, which never travels through the cache.
pub struct BufEntry {
    blockno: u32,
    dirty: bool,
    data: BufData,
}

impl BufEntry {
    fn new() -> Self {
        Self {
            blockno: 0,
            dirty: false,
            data: BufData([0; BSIZE]),
        }
    }

    pub fn blockno(&self) -> u32 {
        self.blockno
    }

    pub fn data(&self) -> &BufData {
        &self.data
    }
}

pub struct Bcache {
    disk: Disk,
    bufs: Vec<BufEntry>,
    /// Loaded slots, least recently used at the front.
    lru: VecDeque<usize>,
    free: Vec<usize>,
}

impl Bcache {
    pub fn new(disk: Disk) -> Bcache {
        Bcache {
            disk,
            bufs: (0..NBUF).map(|_| BufEntry::new()).collect(),
            lru: VecDeque::with_capacity(NBUF),
            free: (0..NBUF).rev().collect(),
        }
    }

    /// Direct access to the backing device, for the superblock region and
    /// image formatting, which bypass the sector cache.
    pub fn disk_mut(&mut self) -> &mut Disk {
        &mut self.disk
    }

    /// Returns the slot mirroring `blockno`, loading it from disk on a miss.
    pub fn get(&mut self, blockno: u32) -> Result<&mut BufEntry> {
        debug_assert_ne!(blockno, 0, "sector 0 never travels through the cache");
        if let Some(pos) = self.bufs.iter().position(|b| b.blockno == blockno) {
            touch(&mut self.lru, pos);
            return Ok(&mut self.bufs[pos]);
        }
        let idx = self.take_slot()?;
        self.disk.read_into(blockno, &mut self.bufs[idx].data.0)?;
        self.bufs[idx].blockno = blockno;
        self.bufs[idx].dirty = false;
        self.lru.push_back(idx);
        Ok(&mut self.bufs[idx])
    }

    /// Binds a slot to `blockno` without reading the disk, zero-filled and
    /// dirty. For freshly allocated sectors only.
    pub fn get_zeroed(&mut self, blockno: u32) -> Result<&mut BufEntry> {
        debug_assert_ne!(blockno, 0);
        let idx = if let Some(pos) = self.bufs.iter().position(|b| b.blockno == blockno) {
            touch(&mut self.lru, pos);
            pos
        } else {
            let idx = self.take_slot()?;
            self.bufs[idx].blockno = blockno;
            self.lru.push_back(idx);
            idx
        };
        self.bufs[idx].data.0.fill(0);
        self.bufs[idx].dirty = true;
        Ok(&mut self.bufs[idx])
    }

    /// Copies `bytes` into the cached sector at `offset` and marks it
    /// dirty. A write that lands on the sector's last byte flushes the
    /// slot immediately.
    pub fn write(&mut self, blockno: u32, offset: usize, bytes: &[u8]) -> Result<()> {
        let end = offset + bytes.len();
        debug_assert!(end <= BSIZE);
        let buf = self.get(blockno)?;
        buf.data.0[offset..end].copy_from_slice(bytes);
        buf.dirty = true;
        if end == BSIZE {
            self.flush_block(blockno)?;
        }
        Ok(())
    }

    /// Writes the slot for `blockno` back to disk if it is loaded dirty.
    pub fn flush_block(&mut self, blockno: u32) -> Result<()> {
        if let Some(pos) = self.bufs.iter().position(|b| b.blockno == blockno) {
            if self.bufs[pos].dirty {
                self.disk.write(blockno, &self.bufs[pos].data.0)?;
                self.bufs[pos].dirty = false;
            }
        }
        Ok(())
    }

    /// Writes every dirty slot back to disk.
    pub fn flush_all(&mut self) -> Result<()> {
        for idx in 0..self.bufs.len() {
            if self.bufs[idx].blockno != 0 && self.bufs[idx].dirty {
                self.disk.write(self.bufs[idx].blockno, &self.bufs[idx].data.0)?;
                self.bufs[idx].dirty = false;
            }
        }
        Ok(())
    }

    /// Drops every slot without write-back. Used when the image itself is
    /// being reformatted underneath the cache.
    pub fn invalidate_all(&mut self) {
        for buf in &mut self.bufs {
            buf.blockno = 0;
            buf.dirty = false;
        }
        self.lru.clear();
        self.free = (0..NBUF).rev().collect();
    }

    /// Pops a free slot, or evicts the least recently used loaded slot,
    /// flushing it first when dirty.
    fn take_slot(&mut self) -> Result<usize> {
        if let Some(idx) = self.free.pop() {
            return Ok(idx);
        }
        let idx = self.lru.pop_front().expect("cache has no slots at all");
        if self.bufs[idx].dirty {
            trace!("evicting dirty sector {}", self.bufs[idx].blockno);
            self.disk.write(self.bufs[idx].blockno, &self.bufs[idx].data.0)?;
            self.bufs[idx].dirty = false;
        }
        Ok(idx)
    }
}

fn touch(lru: &mut VecDeque<usize>, idx: usize) {
    if let Some(pos) = lru.iter().position(|&i| i == idx) {
        lru.remove(pos);
    }
    lru.push_back(idx);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::BSIZE;

    fn scratch_cache(sectors: u64) -> (tempfile::TempDir, Bcache) {
        let dir = tempfile::tempdir().unwrap();
        let disk = Disk::open(dir.path().join("img"), sectors * BSIZE as u64).unwrap();
        (dir, Bcache::new(disk))
    }

    #[test]
    fn hit_returns_cached_contents() {
        let (_dir, mut cache) = scratch_cache(64);
        cache.write(1, 0, b"hello").unwrap();
        assert_eq!(&cache.get(1).unwrap().data()[..5], b"hello");
        // The write did not reach the last byte, so the disk still holds zeroes.
        assert_eq!(cache.disk_mut().read(1, 1).unwrap(), vec![0u8; BSIZE]);
    }

    #[test]
    fn tail_write_flushes_eagerly() {
        let (_dir, mut cache) = scratch_cache(64);
        cache.write(1, BSIZE - 4, &[1, 2, 3, 4]).unwrap();
        let on_disk = cache.disk_mut().read(1, 1).unwrap();
        assert_eq!(&on_disk[BSIZE - 4..], &[1, 2, 3, 4]);
    }

    #[test]
    fn eviction_writes_dirty_slot_back() {
        let (_dir, mut cache) = scratch_cache(64);
        cache.write(1, 0, b"dirty").unwrap();
        // Fill the rest of the pool and one more to evict sector 1.
        for blockno in 2..2 + NBUF as u32 {
            cache.get(blockno).unwrap();
        }
        let on_disk = cache.disk_mut().read(1, 1).unwrap();
        assert_eq!(&on_disk[..5], b"dirty");
    }

    #[test]
    fn lru_evicts_least_recently_used() {
        let (_dir, mut cache) = scratch_cache(64);
        for blockno in 1..=NBUF as u32 {
            cache.write(blockno, 0, &[blockno as u8]).unwrap();
        }
        // Touch sector 1 so sector 2 is now the eviction candidate.
        cache.get(1).unwrap();
        cache.get(NBUF as u32 + 1).unwrap();
        let loaded: Vec<u32> = cache.bufs.iter().map(|b| b.blockno).collect();
        assert!(loaded.contains(&1));
        assert!(!loaded.contains(&2));
    }

    #[test]
    fn get_zeroed_ignores_disk_contents() {
        let (_dir, mut cache) = scratch_cache(64);
        cache.disk_mut().write(3, &vec![0xffu8; BSIZE]).unwrap();
        assert_eq!(cache.get_zeroed(3).unwrap().data()[..], [0u8; BSIZE][..]);
        // The zeroes are dirty and reach the disk on flush.
        cache.flush_all().unwrap();
        assert_eq!(cache.disk_mut().read(3, 1).unwrap(), vec![0u8; BSIZE]);
    }

    #[test]
    fn ptr_view_reads_little_endian_words() {
        let (_dir, mut cache) = scratch_cache(64);
        cache.write(1, 8, &77u32.to_le_bytes()).unwrap();
        assert_eq!(cache.get(1).unwrap().data().ptrs()[2], 77);
    }
}
