//! Sector-granular access to the backing disk image.
//!
//! The image is a single host file of fixed size, addressed in 512-byte
//! sectors. Every transfer moves whole sectors; byte-level host-file
//! mechanics never leak past this module.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::info;

use crate::error::{FsError, Result};
use crate::param::BSIZE;

pub struct Disk {
    file: std::fs::File,
    path: PathBuf,
    size: u64,
}

impl Disk {
    /// Opens the image at `path`, creating it as `size` zero bytes if it
    /// does not exist yet. An existing image keeps its recorded size.
    pub fn open<P: AsRef<Path>>(path: P, size: u64) -> Result<Disk> {
        let path = path.as_ref().to_path_buf();
        let exists = path.exists();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        let size = if exists {
            file.metadata()?.len()
        } else {
            file.set_len(size)?;
            size
        };
        if size == 0 || size % BSIZE as u64 != 0 {
            return Err(FsError::InvalidArg("image size is not sector-aligned"));
        }
        info!("opened {}: {} sectors", path.display(), size / BSIZE as u64);
        Ok(Disk { file, path, size })
    }

    /// Number of sectors the image holds.
    pub fn sectors(&self) -> u32 {
        (self.size / BSIZE as u64) as u32
    }

    fn check_range(&self, block_no: u32, count: usize) -> Result<()> {
        if block_no as u64 + count as u64 > self.size / BSIZE as u64 {
            return Err(FsError::InvalidArg("sector range beyond end of image"));
        }
        Ok(())
    }

    /// Reads `count` whole sectors starting at `block_no`.
    pub fn read(&mut self, block_no: u32, count: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0; count * BSIZE];
        self.read_into(block_no, &mut buf)?;
        Ok(buf)
    }

    /// Reads into a caller buffer whose length selects the sector count.
    pub fn read_into(&mut self, block_no: u32, buf: &mut [u8]) -> Result<()> {
        if buf.len() % BSIZE != 0 {
            return Err(FsError::InvalidArg("transfer is not whole sectors"));
        }
        self.check_range(block_no, buf.len() / BSIZE)?;
        self.file
            .seek(SeekFrom::Start(block_no as u64 * BSIZE as u64))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    /// Writes whole sectors starting at `block_no`.
    pub fn write(&mut self, block_no: u32, data: &[u8]) -> Result<()> {
        if data.len() % BSIZE != 0 {
            return Err(FsError::InvalidArg("transfer is not whole sectors"));
        }
        self.check_range(block_no, data.len() / BSIZE)?;
        self.file
            .seek(SeekFrom::Start(block_no as u64 * BSIZE as u64))?;
        self.file.write_all(data)?;
        Ok(())
    }

    /// Truncates the image back to its full size of zero bytes and keeps
    /// the handle open for read/write.
    pub fn format(&mut self) -> Result<()> {
        self.file.set_len(0)?;
        self.file.set_len(self.size)?;
        self.file.seek(SeekFrom::Start(0))?;
        info!("zeroed image {}", self.path.display());
        Ok(())
    }

    /// Flushes pending writes down to the host file system.
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}
