//! Inodes.
//!
//! An inode describes a single file or directory: its type, its size in
//! bytes, and the ten block pointers that index its content. The on-disk
//! form is the 64-byte `Dinode`, packed eight per sector starting at
//! `INODE_START`; the in-memory form adds the inode number and a dirty
//! marker and lives in a fixed pool with LRU replacement (`Itable`).
//!
//! Content is addressed through a mixed index tree:
//!
//! * pointers 0..5   reference data blocks directly,
//! * pointers 5..7   each reference an index sector of 128 data pointers,
//! * pointers 7..9   each reference a two-level tree (128 * 128 blocks),
//! * pointer  9      references a three-level tree (128^3 blocks).
//!
//! A zero pointer anywhere means "not allocated"; `map_block` surfaces it
//! as sector 0 and callers treat it as a hole. Every sector allocated for
//! the tree is bound through `Bcache::get_zeroed` first, so a recycled
//! sector can never inject stale pointers into the walk.
//!
//! A handle returned by `Itable::get` stays valid only while no other
//! table call can evict it; the borrow checker enforces exactly that by
//! tying the handle's lifetime to the table borrow.

use std::collections::VecDeque;
use std::mem;

use arrayvec::ArrayVec;
use log::trace;
use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use super::dir::DIRENT_SIZE;
use super::superblock::{Superblock, INODE_START};
use crate::bio::Bcache;
use crate::error::{FsError, Result};
use crate::param::{BSIZE, NINODE};

/// Block pointers per inode.
pub const NPTRS: usize = 10;

/// Directly addressed blocks.
pub const NDIRECT: usize = 5;

/// Pointers per index sector.
pub const NINDIRECT: usize = BSIZE / mem::size_of::<u32>();

/// Largest file the pointer tree can address, in blocks.
pub const MAXFILE: usize = NDIRECT
    + 2 * NINDIRECT
    + 2 * NINDIRECT * NINDIRECT
    + NINDIRECT * NINDIRECT * NINDIRECT;

pub const DINODE_SIZE: usize = mem::size_of::<Dinode>();

/// Inodes per sector.
pub const IPB: usize = BSIZE / DINODE_SIZE;

const_assert!(DINODE_SIZE == 64);
const_assert!(BSIZE % DINODE_SIZE == 0);
const_assert!(MAXFILE == 2_130_181);

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum InodeType {
    None,
    File,
    Dir,
}

impl InodeType {
    fn from_raw(raw: u32) -> InodeType {
        match raw {
            1 => InodeType::File,
            2 => InodeType::Dir,
            _ => InodeType::None,
        }
    }

    fn as_raw(self) -> u32 {
        match self {
            InodeType::None => 0,
            InodeType::File => 1,
            InodeType::Dir => 2,
        }
    }
}

/// On-disk inode record.
#[repr(C)]
#[derive(Copy, Clone, AsBytes, FromBytes)]
pub struct Dinode {
    typ: u32,
    size: u32,
    addrs: [u32; NPTRS],
    _pad: [u32; 4],
}

/// In-memory inode. `inode_id == 0` marks a vacant pool slot.
#[derive(Clone)]
pub struct Inode {
    pub inode_id: u32,
    pub typ: InodeType,
    pub size: u32,
    pub addrs: [u32; NPTRS],
    pub dirty: bool,
}

impl Inode {
    fn vacant() -> Inode {
        Inode {
            inode_id: 0,
            typ: InodeType::None,
            size: 0,
            addrs: [0; NPTRS],
            dirty: false,
        }
    }

    fn from_dinode(inode_id: u32, din: &Dinode) -> Inode {
        Inode {
            inode_id,
            typ: InodeType::from_raw(din.typ),
            size: din.size,
            addrs: din.addrs,
            dirty: false,
        }
    }

    pub fn to_dinode(&self) -> Dinode {
        Dinode {
            typ: self.typ.as_raw(),
            size: self.size,
            addrs: self.addrs,
            _pad: [0; 4],
        }
    }

    /// Sector and byte offset of inode `id` in the inode table region.
    pub fn disk_location(id: u32) -> (u32, usize) {
        (id / IPB as u32 + INODE_START, (id as usize % IPB) * DINODE_SIZE)
    }

    pub fn is_dir(&self) -> bool {
        self.typ == InodeType::Dir
    }

    pub fn is_file(&self) -> bool {
        self.typ == InodeType::File
    }

    /// Number of directory entries, counting tombstones.
    pub fn entry_count(&self) -> u32 {
        debug_assert!(self.is_dir());
        self.size / DIRENT_SIZE as u32
    }

    /// Physical sector behind logical block `bn`, or 0 for a hole.
    pub fn map_block(&self, cache: &mut Bcache, bn: u32) -> Result<u32> {
        let (slot, chain) = index_path(bn)?;
        let mut sector = self.addrs[slot];
        for &k in &chain {
            if sector == 0 {
                return Ok(0);
            }
            sector = cache.get(sector)?.data().ptrs()[k as usize];
        }
        Ok(sector)
    }

    /// Like `map_block`, but allocates the leaf and every missing index
    /// sector on the way down.
    pub fn map_or_alloc(
        &mut self,
        sb: &mut Superblock,
        cache: &mut Bcache,
        bn: u32,
    ) -> Result<u32> {
        let (slot, chain) = index_path(bn)?;
        let mut sector = self.addrs[slot];
        if sector == 0 {
            sector = alloc_zeroed(sb, cache)?;
            self.addrs[slot] = sector;
            self.dirty = true;
        }
        for &k in &chain {
            let next = cache.get(sector)?.data().ptrs()[k as usize];
            sector = if next == 0 {
                let child = alloc_zeroed(sb, cache)?;
                cache.write(sector, k as usize * mem::size_of::<u32>(), &child.to_le_bytes())?;
                child
            } else {
                next
            };
        }
        Ok(sector)
    }

    /// Fills the first missing slot of the tree in lexicographic order,
    /// allocating intermediate index chains down to the leaf in the same
    /// call, and returns the new leaf sector.
    pub fn alloc_next(&mut self, sb: &mut Superblock, cache: &mut Bcache) -> Result<u32> {
        for i in 0..NDIRECT {
            if self.addrs[i] == 0 {
                let leaf = alloc_zeroed(sb, cache)?;
                self.addrs[i] = leaf;
                self.dirty = true;
                return Ok(leaf);
            }
        }
        for i in NDIRECT..NPTRS {
            if self.addrs[i] == 0 {
                self.addrs[i] = alloc_zeroed(sb, cache)?;
                self.dirty = true;
            }
            if let Some(leaf) = fill_first_hole(sb, cache, self.addrs[i], slot_depth(i))? {
                return Ok(leaf);
            }
        }
        Err(FsError::OutOfBlocks)
    }

    /// Frees every data and index block of the tree and zeroes the
    /// pointer array.
    pub fn truncate(&mut self, sb: &mut Superblock, cache: &mut Bcache) -> Result<()> {
        for i in 0..NPTRS {
            if self.addrs[i] != 0 {
                free_tree(sb, cache, self.addrs[i], slot_depth(i))?;
                self.addrs[i] = 0;
            }
        }
        self.size = 0;
        self.dirty = true;
        Ok(())
    }

    /// Appends every allocated sector of the tree, index blocks included.
    pub fn collect_blocks(&self, cache: &mut Bcache, out: &mut Vec<u32>) -> Result<()> {
        for i in 0..NPTRS {
            if self.addrs[i] != 0 {
                collect_tree(cache, self.addrs[i], slot_depth(i), out)?;
            }
        }
        Ok(())
    }
}

/// Index-tree depth hanging off pointer slot `i`.
fn slot_depth(i: usize) -> u32 {
    match i {
        0..=4 => 0,
        5 | 6 => 1,
        7 | 8 => 2,
        _ => 3,
    }
}

/// Decomposes a logical block number into a pointer slot and the entry
/// indices of the index sectors on the way to the leaf.
fn index_path(bn: u32) -> Result<(usize, ArrayVec<u32, 3>)> {
    let p = NINDIRECT as u32;
    let mut chain = ArrayVec::new();
    let mut bn = bn;
    if bn < NDIRECT as u32 {
        return Ok((bn as usize, chain));
    }
    bn -= NDIRECT as u32;
    if bn < 2 * p {
        chain.push(bn % p);
        return Ok((NDIRECT + (bn / p) as usize, chain));
    }
    bn -= 2 * p;
    if bn < 2 * p * p {
        chain.push((bn / p) % p);
        chain.push(bn % p);
        return Ok((7 + (bn / (p * p)) as usize, chain));
    }
    bn -= 2 * p * p;
    if bn < p * p * p {
        chain.push(bn / (p * p));
        chain.push((bn / p) % p);
        chain.push(bn % p);
        return Ok((9, chain));
    }
    Err(FsError::InvalidArg("logical block beyond index capacity"))
}

fn alloc_zeroed(sb: &mut Superblock, cache: &mut Bcache) -> Result<u32> {
    let sector = sb.alloc_block()?;
    cache.get_zeroed(sector)?;
    Ok(sector)
}

fn fill_first_hole(
    sb: &mut Superblock,
    cache: &mut Bcache,
    sector: u32,
    depth: u32,
) -> Result<Option<u32>> {
    debug_assert!(depth >= 1);
    let ptrs = cache.get(sector)?.data().ptrs().to_vec();
    for (k, &p) in ptrs.iter().enumerate() {
        if p == 0 {
            let child = alloc_zeroed(sb, cache)?;
            cache.write(sector, k * mem::size_of::<u32>(), &child.to_le_bytes())?;
            let leaf = chain_down(sb, cache, child, depth - 1)?;
            return Ok(Some(leaf));
        }
        if depth > 1 {
            if let Some(leaf) = fill_first_hole(sb, cache, p, depth - 1)? {
                return Ok(Some(leaf));
            }
        }
    }
    Ok(None)
}

/// Descends from a freshly allocated index sector, allocating entry 0 at
/// each level, and returns the leaf.
fn chain_down(sb: &mut Superblock, cache: &mut Bcache, sector: u32, depth: u32) -> Result<u32> {
    let mut cur = sector;
    for _ in 0..depth {
        let child = alloc_zeroed(sb, cache)?;
        cache.write(cur, 0, &child.to_le_bytes())?;
        cur = child;
    }
    Ok(cur)
}

fn free_tree(sb: &mut Superblock, cache: &mut Bcache, sector: u32, depth: u32) -> Result<()> {
    if depth > 0 {
        let ptrs = cache.get(sector)?.data().ptrs().to_vec();
        for &p in ptrs.iter().filter(|&&p| p != 0) {
            free_tree(sb, cache, p, depth - 1)?;
        }
    }
    sb.free_block(sector);
    Ok(())
}

fn collect_tree(cache: &mut Bcache, sector: u32, depth: u32, out: &mut Vec<u32>) -> Result<()> {
    out.push(sector);
    if depth > 0 {
        let ptrs = cache.get(sector)?.data().ptrs().to_vec();
        for &p in ptrs.iter().filter(|&&p| p != 0) {
            collect_tree(cache, p, depth - 1, out)?;
        }
    }
    Ok(())
}

/// Fixed pool of in-memory inodes with LRU replacement. Evicting a dirty
/// slot serialises it back through the block cache.
pub struct Itable {
    slots: Vec<Inode>,
    /// Loaded slots, least recently used at the front.
    lru: VecDeque<usize>,
    free: Vec<usize>,
}

impl Itable {
    pub fn new() -> Itable {
        Itable {
            slots: vec![Inode::vacant(); NINODE],
            lru: VecDeque::with_capacity(NINODE),
            free: (0..NINODE).rev().collect(),
        }
    }

    /// Drops every slot without write-back (reformat).
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = Inode::vacant();
        }
        self.lru.clear();
        self.free = (0..NINODE).rev().collect();
    }

    /// Returns the in-memory inode for `id`, reading it through the block
    /// cache on a miss.
    pub fn get<'a>(&'a mut self, cache: &mut Bcache, id: u32) -> Result<&'a mut Inode> {
        debug_assert_ne!(id, 0, "inode 0 is reserved");
        if let Some(pos) = self.slots.iter().position(|s| s.inode_id == id) {
            touch(&mut self.lru, pos);
            return Ok(&mut self.slots[pos]);
        }
        let idx = self.take_slot(cache)?;
        let (sector, off) = Inode::disk_location(id);
        let din: Dinode = cache.get(sector)?.data().read_record(off);
        self.slots[idx] = Inode::from_dinode(id, &din);
        self.lru.push_back(idx);
        Ok(&mut self.slots[idx])
    }

    /// Allocates a fresh inode number from the bitmap and initialises its
    /// slot from scratch; the stale on-disk record is never read.
    pub fn alloc<'a>(
        &'a mut self,
        cache: &mut Bcache,
        sb: &mut Superblock,
        typ: InodeType,
    ) -> Result<&'a mut Inode> {
        let id = sb.alloc_inode()?;
        let idx = self.take_slot(cache)?;
        self.slots[idx] = Inode {
            inode_id: id,
            typ,
            size: 0,
            addrs: [0; NPTRS],
            dirty: true,
        };
        self.lru.push_back(idx);
        Ok(&mut self.slots[idx])
    }

    /// Serialises one inode into its slot of the inode table region.
    pub fn write_back(ip: &Inode, cache: &mut Bcache) -> Result<()> {
        let (sector, off) = Inode::disk_location(ip.inode_id);
        cache.write(sector, off, ip.to_dinode().as_bytes())
    }

    /// Releases the slot holding `id`, if loaded, without write-back.
    pub fn forget(&mut self, id: u32) {
        if let Some(pos) = self.slots.iter().position(|s| s.inode_id == id) {
            self.slots[pos] = Inode::vacant();
            if let Some(p) = self.lru.iter().position(|&i| i == pos) {
                self.lru.remove(p);
            }
            self.free.push(pos);
        }
    }

    /// Writes every dirty loaded inode back through the block cache.
    pub fn flush(&mut self, cache: &mut Bcache) -> Result<()> {
        for idx in 0..self.slots.len() {
            if self.slots[idx].inode_id != 0 && self.slots[idx].dirty {
                Itable::write_back(&self.slots[idx], cache)?;
                self.slots[idx].dirty = false;
            }
        }
        Ok(())
    }

    fn take_slot(&mut self, cache: &mut Bcache) -> Result<usize> {
        if let Some(idx) = self.free.pop() {
            return Ok(idx);
        }
        let idx = self.lru.pop_front().expect("inode pool has no slots at all");
        if self.slots[idx].dirty {
            trace!("evicting dirty inode {}", self.slots[idx].inode_id);
            Itable::write_back(&self.slots[idx], cache)?;
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
