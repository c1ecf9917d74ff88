//! Directory entries.
//!
//! A directory is a DIR-typed inode whose content is a packed array of
//! 32-byte entries; sixteen fit per sector. An entry with `inode_id == 0`
//! is a tombstone, reusable in place. Entry 0 of every directory is `.`
//! and entry 1 is `..`; the root's `..` points at the root itself.

use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use super::inode::Inode;
use super::path::FileName;
use crate::bio::Bcache;
use crate::error::{FsError, Result};
use crate::param::BSIZE;

/// Width of the name field; usable names are one byte shorter so the NUL
/// terminator always fits.
pub const DIRSIZ: usize = 28;

pub const DIRENT_SIZE: usize = std::mem::size_of::<DirEntry>();

/// Directory entries per sector.
pub const ENTRIES_PER_BLOCK: u32 = (BSIZE / DIRENT_SIZE) as u32;

const_assert!(DIRENT_SIZE == 32);
const_assert!(BSIZE % DIRENT_SIZE == 0);

#[repr(C)]
#[derive(Copy, Clone, AsBytes, FromBytes)]
pub struct DirEntry {
    pub inode_id: u32,
    name: [u8; DIRSIZ],
}

impl DirEntry {
    pub fn new(inode_id: u32, name: &str) -> DirEntry {
        debug_assert!(!name.is_empty() && name.len() < DIRSIZ);
        let mut entry = DirEntry {
            inode_id,
            name: [0; DIRSIZ],
        };
        entry.name[..name.len()].copy_from_slice(name.as_bytes());
        entry
    }

    pub fn tombstone() -> DirEntry {
        DirEntry {
            inode_id: 0,
            name: [0; DIRSIZ],
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.inode_id == 0
    }

    /// The stored name, up to the first NUL.
    pub fn name_bytes(&self) -> &[u8] {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(DIRSIZ);
        &self.name[..len]
    }

    pub fn name_string(&self) -> String {
        String::from_utf8_lossy(self.name_bytes()).into_owned()
    }

    pub fn name_matches(&self, name: &FileName<'_>) -> bool {
        self.name_bytes() == name.as_bytes()
    }
}

/// Reads directory entry `i` of `ip` through the index walk.
pub fn read_entry(ip: &Inode, cache: &mut Bcache, i: u32) -> Result<DirEntry> {
    let bn = i / ENTRIES_PER_BLOCK;
    let sector = ip.map_block(cache, bn)?;
    if sector == 0 {
        return Err(FsError::BlockNotAllocated(bn));
    }
    let off = (i % ENTRIES_PER_BLOCK) as usize * DIRENT_SIZE;
    Ok(cache.get(sector)?.data().read_record(off))
}

/// Writes directory entry `i` of `ip` in place. The slot's sector must
/// already be allocated; extending the directory is the caller's business.
pub fn write_entry(ip: &Inode, cache: &mut Bcache, i: u32, entry: &DirEntry) -> Result<()> {
    let bn = i / ENTRIES_PER_BLOCK;
    let sector = ip.map_block(cache, bn)?;
    if sector == 0 {
        return Err(FsError::BlockNotAllocated(bn));
    }
    let off = (i % ENTRIES_PER_BLOCK) as usize * DIRENT_SIZE;
    cache.write(sector, off, entry.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_nul_padded() {
        let e = DirEntry::new(9, "abc");
        assert_eq!(e.name_bytes(), b"abc");
        assert_eq!(e.as_bytes().len(), 32);
        assert_eq!(&e.as_bytes()[4..8], b"abc\0");
    }

    #[test]
    fn full_width_names_have_no_terminator_overrun() {
        let name = "x".repeat(DIRSIZ - 1);
        let e = DirEntry::new(1, &name);
        assert_eq!(e.name_bytes().len(), DIRSIZ - 1);
        assert_eq!(e.name_string(), name);
    }

    #[test]
    fn matching_compares_exact_bytes() {
        let e = DirEntry::new(1, "abc");
        let abc = crate::fs::path::FileName::new("abc").unwrap();
        let ab = crate::fs::path::FileName::new("ab").unwrap();
        assert!(e.name_matches(&abc));
        assert!(!e.name_matches(&ab));
        assert!(DirEntry::tombstone().is_tombstone());
    }
}
