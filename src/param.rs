//! System-wide tunables.

/// Sector size in bytes; the unit of all disk transfers.
pub const BSIZE: usize = 512;

/// Size of the disk block cache.
pub const NBUF: usize = 16;

/// Maximum number of in-memory inodes.
pub const NINODE: usize = 100;

/// Open files per system.
pub const NFILE: usize = 16;

/// Default path of the backing disk image.
pub const DISK_PATH: &str = "disk.img";

/// Default size of the backing disk image in bytes.
pub const DISK_SIZE: u64 = 1 << 30;
