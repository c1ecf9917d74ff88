//! File system implementation. Five layers:
//!   + Disk: whole-sector transfers against the backing image.
//!   + Cache: write-back buffer pool over the disk (`crate::bio`).
//!   + Allocation: superblock bitmaps for inodes and data blocks.
//!   + Files: the inode table and the mixed direct/indirect index tree.
//!   + Directories and names: packed 32-byte entries and path walking.
//!
//! This module holds the façade that ties the layers together: directory
//! operations, the open-file table calls, format/mount/save, and the
//! consistency checker. The lower layers live in the submodules.

use std::cmp;
use std::collections::HashSet;

use itertools::Itertools;
use zerocopy::AsBytes;
use log::{error, info};

pub mod dir;
pub mod inode;
pub mod path;
pub mod superblock;

pub use dir::{DirEntry, DIRENT_SIZE, DIRSIZ, ENTRIES_PER_BLOCK};
pub use inode::{Inode, InodeType, Itable, MAXFILE, NDIRECT, NINDIRECT, NPTRS};
pub use path::{FileName, Path};
pub use superblock::{Superblock, BLOCK_START, INODE_START, SUPER_SECTORS};

use crate::bio::Bcache;
use crate::disk::Disk;
use crate::error::{FsError, Result};
use crate::file::FileTable;
use crate::param::BSIZE;

/// Root directory i-number. Inode 0 is reserved and never allocated.
pub const ROOTINO: u32 = 1;

/// Total inodes, the reserved inode 0 included.
pub const INODE_COUNT: u32 = 3968;

/// Total sectors in the image; the data region runs from `BLOCK_START`
/// to this bound.
pub const BLOCK_COUNT: u32 = 2_097_152;

pub struct FileSystem {
    cache: Bcache,
    superblock: Superblock,
    itable: Itable,
    files: FileTable,
    /// Current directory; always a DIR inode.
    cwd: u32,
}

impl FileSystem {
    /// Mounts the file system on `disk`. An unformatted image mounts, but
    /// every operation fails until `format` runs. If `/root` exists the
    /// current directory starts there, else at `/`.
    pub fn new(disk: Disk) -> Result<FileSystem> {
        let mut cache = Bcache::new(disk);
        let superblock = Superblock::load(cache.disk_mut())?;
        let mut fs = FileSystem {
            cache,
            superblock,
            itable: Itable::new(),
            files: FileTable::new(),
            cwd: ROOTINO,
        };
        if fs.superblock.is_formatted() {
            info!("mounted file system");
            if fs.exist("/root") {
                fs.cd("/root")?;
            }
        }
        Ok(fs)
    }

    /// Zeroes the image and rebuilds an empty file system: fresh
    /// superblock, empty pools, and a root directory whose `.` and `..`
    /// both point at itself.
    pub fn format(&mut self) -> Result<()> {
        self.cache.invalidate_all();
        self.cache.disk_mut().format()?;
        self.superblock.format();
        self.itable.clear();
        self.files.clear();

        let root_block = {
            let ip = self
                .itable
                .alloc(&mut self.cache, &mut self.superblock, InodeType::Dir)?;
            debug_assert_eq!(ip.inode_id, ROOTINO);
            let block = self.superblock.alloc_block()?;
            ip.addrs[0] = block;
            ip.size = 2 * DIRENT_SIZE as u32;
            ip.dirty = true;
            block
        };
        self.cache.get_zeroed(root_block)?;
        self.cache
            .write(root_block, 0, DirEntry::new(ROOTINO, ".").as_bytes())?;
        self.cache.write(
            root_block,
            DIRENT_SIZE,
            DirEntry::new(ROOTINO, "..").as_bytes(),
        )?;
        self.cwd = ROOTINO;
        self.save()?;
        info!("formatted file system");
        Ok(())
    }

    /// `format`, then the conventional top-level directories, then
    /// `cd /root`.
    pub fn init(&mut self) -> Result<()> {
        self.format()?;
        for name in &["root", "home", "etc", "bin", "usr", "dev"] {
            self.mkdir(name)?;
        }
        self.cd("/root")
    }

    /// Flushes every dirty inode, every dirty cached sector and the
    /// superblock region down to the host file.
    pub fn save(&mut self) -> Result<()> {
        self.itable.flush(&mut self.cache)?;
        self.cache.flush_all()?;
        self.superblock.store(self.cache.disk_mut())?;
        self.cache.disk_mut().sync()
    }

    // Directory operations ------------------------------------------------

    /// Names in the current directory, tombstones skipped.
    pub fn ls(&mut self) -> Result<Vec<String>> {
        let cwd = self.cwd;
        let ip = self.itable.get(&mut self.cache, cwd)?;
        if !ip.is_dir() {
            return Err(FsError::NotADirectory(".".to_string()));
        }
        let mut names = Vec::new();
        for i in 0..ip.entry_count() {
            let entry = dir::read_entry(ip, &mut self.cache, i)?;
            if !entry.is_tombstone() {
                names.push(entry.name_string());
            }
        }
        Ok(names)
    }

    /// Absolute path of the current directory, recovered by walking `..`
    /// up to the root and finding each directory's name in its parent.
    pub fn pwd(&mut self) -> Result<String> {
        let mut components = Vec::new();
        let mut cur = self.cwd;
        while cur != ROOTINO {
            let dotdot = FileName::new("..").expect("`..` is a valid name");
            let parent = self
                .dir_lookup(cur, &dotdot)?
                .ok_or_else(|| FsError::NotFound("..".to_string()))?
                .1
                .inode_id;
            components.push(self.entry_name_of(parent, cur)?);
            cur = parent;
        }
        components.reverse();
        Ok(format!("/{}", components.iter().join("/")))
    }

    /// Final component of `pwd`, or `/` at the root.
    pub fn current_dir(&mut self) -> Result<String> {
        let p = self.pwd()?;
        Ok(match p.rfind('/') {
            Some(pos) if p.len() > 1 => p[pos + 1..].to_string(),
            _ => "/".to_string(),
        })
    }

    /// Changes the current directory. An empty path is a no-op.
    pub fn cd(&mut self, path: &str) -> Result<()> {
        if path.is_empty() {
            return Ok(());
        }
        let id = self.resolve(&Path::new(path))?;
        let ip = self.itable.get(&mut self.cache, id)?;
        if !ip.is_dir() {
            return Err(FsError::NotADirectory(path.to_string()));
        }
        self.cwd = id;
        Ok(())
    }

    /// Creates a directory in the current directory.
    pub fn mkdir(&mut self, name: &str) -> Result<()> {
        let name = FileName::new(name)?;
        if self.dir_lookup(self.cwd, &name)?.is_some() {
            return Err(FsError::AlreadyExists(name.as_str().to_string()));
        }
        let parent = self.cwd;
        let (child, child_block) = {
            let ip = self
                .itable
                .alloc(&mut self.cache, &mut self.superblock, InodeType::Dir)?;
            let block = self.superblock.alloc_block()?;
            ip.addrs[0] = block;
            ip.size = 2 * DIRENT_SIZE as u32;
            (ip.inode_id, block)
        };
        self.cache.get_zeroed(child_block)?;
        self.cache
            .write(child_block, 0, DirEntry::new(child, ".").as_bytes())?;
        self.cache.write(
            child_block,
            DIRENT_SIZE,
            DirEntry::new(parent, "..").as_bytes(),
        )?;
        self.dir_add(parent, &name, child)
    }

    /// Creates an empty file in the current directory.
    pub fn touch(&mut self, name: &str) -> Result<()> {
        let name = FileName::new(name)?;
        if self.dir_lookup(self.cwd, &name)?.is_some() {
            return Err(FsError::AlreadyExists(name.as_str().to_string()));
        }
        let parent = self.cwd;
        let child = self
            .itable
            .alloc(&mut self.cache, &mut self.superblock, InodeType::File)?
            .inode_id;
        self.dir_add(parent, &name, child)
    }

    /// Removes a file or an empty directory from the current directory.
    /// The last entry is compacted into the vacated slot, so live entries
    /// stay packed at the front.
    pub fn rm(&mut self, name: &str) -> Result<()> {
        let name = FileName::new(name)?;
        let (slot, entry) = self
            .dir_lookup(self.cwd, &name)?
            .ok_or_else(|| FsError::NotFound(name.as_str().to_string()))?;
        let target = entry.inode_id;
        {
            let ip = self.itable.get(&mut self.cache, target)?;
            if ip.is_dir() && ip.entry_count() > 2 {
                return Err(FsError::DirNotEmpty(name.as_str().to_string()));
            }
            ip.truncate(&mut self.superblock, &mut self.cache)?;
            ip.typ = InodeType::None;
            ip.dirty = false;
            Itable::write_back(ip, &mut self.cache)?;
        }
        self.itable.forget(target);
        self.superblock.free_inode(target);

        let parent = self.cwd;
        let ip = self.itable.get(&mut self.cache, parent)?;
        let last = ip.entry_count() - 1;
        let moved = dir::read_entry(ip, &mut self.cache, last)?;
        dir::write_entry(ip, &mut self.cache, slot, &moved)?;
        dir::write_entry(ip, &mut self.cache, last, &DirEntry::tombstone())?;
        ip.size -= DIRENT_SIZE as u32;
        ip.dirty = true;
        Ok(())
    }

    /// Whether `path` resolves.
    pub fn exist(&mut self, path: &str) -> bool {
        self.resolve(&Path::new(path)).is_ok()
    }

    // File operations ------------------------------------------------------

    /// Opens the file at `path`; the returned descriptor starts at
    /// offset 0. A file can be open through at most one descriptor.
    pub fn open(&mut self, path: &str) -> Result<usize> {
        let p = Path::new(path);
        let id = self.resolve(&p)?;
        {
            let ip = self.itable.get(&mut self.cache, id)?;
            if ip.is_dir() {
                return Err(FsError::IsADirectory(path.to_string()));
            }
        }
        if let Some(fd) = self.files.find_by_inode(id) {
            return Err(FsError::AlreadyOpen {
                path: path.to_string(),
                fd,
            });
        }
        let last = p.file_name().unwrap_or("");
        let name = FileName::new(last)?;
        self.files.open(id, &name)
    }

    pub fn close(&mut self, fd: usize) -> Result<()> {
        self.files.close(fd)
    }

    /// Moves the descriptor's offset. Positions past EOF are legal: reads
    /// there return nothing, writes there extend the file.
    pub fn seek(&mut self, fd: usize, offset: u32) -> Result<()> {
        self.files.get_mut(fd)?.offset = offset;
        Ok(())
    }

    /// Writes `data` at the descriptor's offset, allocating every block
    /// the write straddles, and advances the offset. On `OutOfBlocks` the
    /// file keeps the sectors already written.
    pub fn write(&mut self, fd: usize, data: &[u8]) -> Result<usize> {
        let file = self.files.get_mut(fd)?;
        let id = file.inode_id;
        let ip = self.itable.get(&mut self.cache, id)?;
        let start = file.offset as u64;
        if start + data.len() as u64 > (MAXFILE * BSIZE) as u64 {
            return Err(FsError::InvalidArg("write would exceed the maximum file size"));
        }
        let mut cur = start;
        let mut done = 0;
        while done < data.len() {
            let bn = (cur / BSIZE as u64) as u32;
            let sector = ip.map_or_alloc(&mut self.superblock, &mut self.cache, bn)?;
            let boff = (cur % BSIZE as u64) as usize;
            let n = cmp::min(BSIZE - boff, data.len() - done);
            self.cache.write(sector, boff, &data[done..done + n])?;
            cur += n as u64;
            done += n;
            ip.size = cmp::max(ip.size, cur as u32);
            ip.dirty = true;
            file.offset = cur as u32;
        }
        Ok(done)
    }

    /// Reads up to `buf.len()` bytes at the descriptor's offset, stopping
    /// at end of file, and advances the offset by the bytes read. A hole
    /// inside the file fails with `BlockNotAllocated`.
    pub fn read(&mut self, fd: usize, buf: &mut [u8]) -> Result<usize> {
        let file = self.files.get_mut(fd)?;
        let id = file.inode_id;
        let ip = self.itable.get(&mut self.cache, id)?;
        let mut cur = file.offset as u64;
        let end = cmp::min(cur + buf.len() as u64, ip.size as u64);
        let mut done = 0;
        while cur < end {
            let bn = (cur / BSIZE as u64) as u32;
            let sector = ip.map_block(&mut self.cache, bn)?;
            if sector == 0 {
                return Err(FsError::BlockNotAllocated(bn));
            }
            let boff = (cur % BSIZE as u64) as usize;
            let n = cmp::min(BSIZE - boff, (end - cur) as usize);
            let cached = self.cache.get(sector)?;
            buf[done..done + n].copy_from_slice(&cached.data()[boff..boff + n]);
            cur += n as u64;
            done += n;
            file.offset = cur as u32;
        }
        Ok(done)
    }

    /// The whole content of the file at `path`, through a scratch
    /// descriptor.
    pub fn cat(&mut self, path: &str) -> Result<Vec<u8>> {
        let fd = self.open(path)?;
        let size = {
            let id = self.files.get_mut(fd)?.inode_id;
            self.itable.get(&mut self.cache, id)?.size
        };
        let mut buf = vec![0; size as usize];
        let read = self.read(fd, &mut buf);
        self.close(fd)?;
        buf.truncate(read?);
        Ok(buf)
    }

    /// Active descriptors and the names they were opened under.
    pub fn flist(&self) -> Vec<(usize, String)> {
        self.files
            .iter_busy()
            .map(|(fd, f)| (fd, f.name().to_string()))
            .collect()
    }

    /// Size in bytes of the file or directory at `path`.
    pub fn file_size(&mut self, path: &str) -> Result<u32> {
        let id = self.resolve(&Path::new(path))?;
        Ok(self.itable.get(&mut self.cache, id)?.size)
    }

    // Consistency ----------------------------------------------------------

    /// Verifies the structural invariants on the live image: every sector
    /// reachable through the inodes' index trees is marked in the block
    /// bitmap and vice versa, every reachable inode is marked in the inode
    /// bitmap and vice versa, and every directory is well-formed.
    pub fn fsck(&mut self) -> Result<()> {
        if !self.superblock.is_formatted() {
            return Err(FsError::Inconsistent("superblock geometry mismatch".into()));
        }
        let mut seen: HashSet<u32> = HashSet::new();
        let mut used = vec![false; BLOCK_COUNT as usize];
        let mut pending = vec![(ROOTINO, ROOTINO)];
        seen.insert(ROOTINO);
        while let Some((id, parent)) = pending.pop() {
            let (typ, size, blocks, entries) = {
                let ip = self.itable.get(&mut self.cache, id)?;
                let mut blocks = Vec::new();
                ip.collect_blocks(&mut self.cache, &mut blocks)?;
                let mut entries = Vec::new();
                if ip.is_dir() {
                    for i in 0..ip.entry_count() {
                        entries.push(dir::read_entry(ip, &mut self.cache, i)?);
                    }
                }
                (ip.typ, ip.size, blocks, entries)
            };
            if typ == InodeType::None {
                return Err(FsError::Inconsistent(format!(
                    "reachable inode {} is unallocated",
                    id
                )));
            }
            for s in blocks {
                if s < BLOCK_START || s >= BLOCK_COUNT {
                    return Err(FsError::Inconsistent(format!(
                        "inode {} points outside the data region: sector {}",
                        id, s
                    )));
                }
                if used[s as usize] {
                    return Err(FsError::Inconsistent(format!(
                        "sector {} referenced twice",
                        s
                    )));
                }
                used[s as usize] = true;
            }
            if typ == InodeType::Dir {
                if size % DIRENT_SIZE as u32 != 0 {
                    return Err(FsError::Inconsistent(format!(
                        "directory {} size {} is not a multiple of the entry size",
                        id, size
                    )));
                }
                if entries.len() < 2
                    || entries[0].name_bytes() != b"."
                    || entries[1].name_bytes() != b".."
                {
                    return Err(FsError::Inconsistent(format!(
                        "directory {} does not start with . and ..",
                        id
                    )));
                }
                if entries[0].inode_id != id || entries[1].inode_id != parent {
                    return Err(FsError::Inconsistent(format!(
                        "directory {} has wrong . or .. targets",
                        id
                    )));
                }
                for entry in entries.iter().skip(2) {
                    if entry.is_tombstone() {
                        continue;
                    }
                    if seen.insert(entry.inode_id) {
                        pending.push((entry.inode_id, id));
                    }
                }
            }
        }
        for id in 1..INODE_COUNT {
            if self.superblock.inode_in_use(id) != seen.contains(&id) {
                return Err(FsError::Inconsistent(format!(
                    "inode bitmap disagrees with the directory tree at inode {}",
                    id
                )));
            }
        }
        for j in 0..BLOCK_COUNT - BLOCK_START {
            let sector = BLOCK_START + j;
            if self.superblock.block_in_use(sector) != used[sector as usize] {
                return Err(FsError::Inconsistent(format!(
                    "block bitmap disagrees with the index trees at sector {}",
                    sector
                )));
            }
        }
        Ok(())
    }

    // Internals ------------------------------------------------------------

    /// Walks `path` component by component and returns the target's
    /// i-number. Every traversed component must be a directory.
    fn resolve(&mut self, path: &Path<'_>) -> Result<u32> {
        let mut cur = if path.is_absolute() { ROOTINO } else { self.cwd };
        for component in path.components() {
            let name = FileName::new(component)?;
            {
                let ip = self.itable.get(&mut self.cache, cur)?;
                if !ip.is_dir() {
                    return Err(FsError::NotADirectory(component.to_string()));
                }
            }
            cur = self
                .dir_lookup(cur, &name)?
                .map(|(_, entry)| entry.inode_id)
                .ok_or_else(|| FsError::NotFound(path.as_str().to_string()))?;
        }
        Ok(cur)
    }

    /// Linear scan of a directory for `name`; returns the entry and its
    /// slot index.
    fn dir_lookup(&mut self, dir_id: u32, name: &FileName<'_>) -> Result<Option<(u32, DirEntry)>> {
        let ip = self.itable.get(&mut self.cache, dir_id)?;
        if !ip.is_dir() {
            return Err(FsError::NotADirectory(name.as_str().to_string()));
        }
        for i in 0..ip.entry_count() {
            let entry = dir::read_entry(ip, &mut self.cache, i)?;
            if !entry.is_tombstone() && entry.name_matches(name) {
                return Ok(Some((i, entry)));
            }
        }
        Ok(None)
    }

    /// Inserts `(name, child)` into a directory: the first tombstone is
    /// reused in place, otherwise the entry goes after the current tail,
    /// extending the directory by one block when the tail sector is full.
    /// The target slot is recomputed after any allocation.
    fn dir_add(&mut self, dir_id: u32, name: &FileName<'_>, child: u32) -> Result<()> {
        let ip = self.itable.get(&mut self.cache, dir_id)?;
        let count = ip.entry_count();
        let entry = DirEntry::new(child, name.as_str());
        for i in 0..count {
            if dir::read_entry(ip, &mut self.cache, i)?.is_tombstone() {
                return dir::write_entry(ip, &mut self.cache, i, &entry);
            }
        }
        if count % ENTRIES_PER_BLOCK == 0 {
            ip.alloc_next(&mut self.superblock, &mut self.cache)?;
        }
        dir::write_entry(ip, &mut self.cache, count, &entry)?;
        ip.size += DIRENT_SIZE as u32;
        ip.dirty = true;
        Ok(())
    }

    /// Name under which `child` appears in directory `parent`.
    fn entry_name_of(&mut self, parent: u32, child: u32) -> Result<String> {
        let ip = self.itable.get(&mut self.cache, parent)?;
        for i in 0..ip.entry_count() {
            let entry = dir::read_entry(ip, &mut self.cache, i)?;
            if !entry.is_tombstone() && entry.inode_id == child {
                return Ok(entry.name_string());
            }
        }
        Err(FsError::NotFound(format!("inode {} in parent {}", child, parent)))
    }
}

impl Drop for FileSystem {
    /// Destruction flushes all dirty state, whatever path led here.
    fn drop(&mut self) {
        if let Err(e) = self.save() {
            error!("flush on drop failed: {}", e);
        }
    }
}
