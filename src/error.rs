//! Error taxonomy of the file-system core.
//!
//! Every failure is reported synchronously to the caller and never retried.
//! Apart from `Io`, which may leave the core in an inconsistent state, the
//! failing operation leaves state unchanged unless its documentation says
//! otherwise (a write that runs out of blocks keeps the sectors already
//! written).

use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, FsError>;

#[derive(Debug, Error)]
pub enum FsError {
    /// The backing image failed a transfer; callers should abort.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid argument: {0}")]
    InvalidArg(&'static str),

    #[error("no free inode")]
    OutOfInodes,

    #[error("no free block")]
    OutOfBlocks,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("directory not empty: {0}")]
    DirNotEmpty(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("name too long: {0}")]
    NameTooLong(String),

    #[error("{path} already opened, fd=[{fd}]")]
    AlreadyOpen { path: String, fd: usize },

    #[error("no open file, fd=[{0}]")]
    NotOpen(usize),

    #[error("exceeded maximum number of open files")]
    TooManyOpenFiles,

    /// A read walked into a hole: logical block with no sector behind it.
    #[error("block not allocated: {0}")]
    BlockNotAllocated(u32),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Raised only by the consistency checker.
    #[error("filesystem inconsistency: {0}")]
    Inconsistent(String),
}
