//! The open-file table.
//!
//! A fixed pool of slots; the slot index is the file descriptor handed to
//! callers. A slot is in use while its reference count is positive. At
//! most one slot may reference a given inode, so two descriptors never
//! race on one file's offset.

use arrayvec::ArrayString;

use crate::error::{FsError, Result};
use crate::fs::path::FileName;
use crate::fs::DIRSIZ;
use crate::param::NFILE;

pub struct File {
    pub inode_id: u32,
    pub offset: u32,
    pub ref_count: u32,
    name: ArrayString<DIRSIZ>,
}

impl File {
    fn vacant() -> File {
        File {
            inode_id: 0,
            offset: 0,
            ref_count: 0,
            name: ArrayString::new(),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.ref_count > 0
    }

    fn clear(&mut self) {
        self.inode_id = 0;
        self.offset = 0;
        self.ref_count = 0;
        self.name.clear();
    }

    /// The file name recorded at open time, for listings.
    pub fn name(&self) -> &str {
        &self.name
    }
}

pub struct FileTable {
    files: Vec<File>,
}

impl FileTable {
    pub fn new() -> FileTable {
        FileTable {
            files: (0..NFILE).map(|_| File::vacant()).collect(),
        }
    }

    pub fn clear(&mut self) {
        for file in &mut self.files {
            file.clear();
        }
    }

    /// The descriptor of the active slot holding `inode_id`, if any.
    pub fn find_by_inode(&self, inode_id: u32) -> Option<usize> {
        self.files
            .iter()
            .position(|f| f.is_busy() && f.inode_id == inode_id)
    }

    /// Claims the first free slot for `inode_id` at offset 0.
    pub fn open(&mut self, inode_id: u32, name: &FileName<'_>) -> Result<usize> {
        debug_assert!(self.find_by_inode(inode_id).is_none());
        let fd = self
            .files
            .iter()
            .position(|f| !f.is_busy())
            .ok_or(FsError::TooManyOpenFiles)?;
        let file = &mut self.files[fd];
        file.inode_id = inode_id;
        file.offset = 0;
        file.ref_count = 1;
        file.name.clear();
        file.name.push_str(name.as_str());
        Ok(fd)
    }

    /// Drops one reference; the slot empties when the count hits zero.
    pub fn close(&mut self, fd: usize) -> Result<()> {
        let file = self
            .files
            .get_mut(fd)
            .filter(|f| f.is_busy())
            .ok_or(FsError::NotOpen(fd))?;
        file.ref_count -= 1;
        if file.ref_count == 0 {
            file.clear();
        }
        Ok(())
    }

    pub fn get_mut(&mut self, fd: usize) -> Result<&mut File> {
        self.files
            .get_mut(fd)
            .filter(|f| f.is_busy())
            .ok_or(FsError::NotOpen(fd))
    }

    /// Active slots, in descriptor order.
    pub fn iter_busy(&self) -> impl Iterator<Item = (usize, &File)> {
        self.files.iter().enumerate().filter(|(_, f)| f.is_busy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> FileName<'_> {
        FileName::new(s).unwrap()
    }

    #[test]
    fn descriptors_are_slot_indices() {
        let mut table = FileTable::new();
        assert_eq!(table.open(5, &name("a")).unwrap(), 0);
        assert_eq!(table.open(6, &name("b")).unwrap(), 1);
        table.close(0).unwrap();
        // The freed slot is handed out again first.
        assert_eq!(table.open(7, &name("c")).unwrap(), 0);
    }

    #[test]
    fn close_of_vacant_slot_fails() {
        let mut table = FileTable::new();
        assert!(matches!(table.close(0), Err(FsError::NotOpen(0))));
        assert!(matches!(table.close(99), Err(FsError::NotOpen(99))));
    }

    #[test]
    fn table_exhaustion() {
        let mut table = FileTable::new();
        for i in 0..NFILE as u32 {
            table.open(i + 1, &name("f")).unwrap();
        }
        assert!(matches!(
            table.open(100, &name("g")),
            Err(FsError::TooManyOpenFiles)
        ));
    }

    #[test]
    fn find_by_inode_sees_only_busy_slots() {
        let mut table = FileTable::new();
        let fd = table.open(9, &name("x")).unwrap();
        assert_eq!(table.find_by_inode(9), Some(fd));
        table.close(fd).unwrap();
        assert_eq!(table.find_by_inode(9), None);
    }
}
