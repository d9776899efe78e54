//! FAT12/16/32 volume engine and file handles.
//!
//! A [`Volume`] owns the block device and its single [`BlockCache`]. File and
//! directory handles hold no reference to the volume; every operation that
//! touches the medium takes `&mut Volume<D>` explicitly.

use core::fmt;

mod cache;
mod dir;
mod entry;
mod file;
mod geometry;
mod volume;


pub use cache::{BlockCache, FatMirror};
pub use entry::{
    make_83_name, Attributes, DirEntry, FatTimestamp, TimestampKind, DIR_ENTRY_SIZE,
    DIR_NAME_DELETED, DIR_NAME_FREE,
};
pub use file::{FileHandle, FileKind, OpenMode};
pub use geometry::{FatWidth, VolumeGeometry};
pub use volume::Volume;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FatError<E> {
    /// The block device failed while the cache was filled or flushed.
    CacheIo(E),
    NoValidPartition,
    BadBootSector,
    BadCluster(u32),
    InvalidName,
    InvalidArgument,
    NotFound,
    AlreadyExists,
    IsADirectory,
    NotADirectory,
    DirectoryNotEmpty,
    DiskFull,
    /// A fixed-size FAT12/16 root directory has no free slot.
    DirectoryFull,
    SeekBeyondEnd,
    /// The entry is read-only, or the handle was not opened for writing.
    ReadOnly,
    /// The handle was not opened for reading.
    WriteOnly,
    NotOpen,
    AlreadyOpen,
    NotContiguous,
}

impl<E: fmt::Debug> fmt::Display for FatError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CacheIo(err) => write!(f, "block device error: {:?}", err),
            Self::NoValidPartition => write!(f, "no FAT partition found"),
            Self::BadBootSector => write!(f, "invalid FAT boot sector"),
            Self::BadCluster(cluster) => write!(f, "cluster {} out of range", cluster),
            Self::InvalidName => write!(f, "invalid 8.3 name"),
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::NotFound => write!(f, "file not found"),
            Self::AlreadyExists => write!(f, "file already exists"),
            Self::IsADirectory => write!(f, "is a directory"),
            Self::NotADirectory => write!(f, "not a directory"),
            Self::DirectoryNotEmpty => write!(f, "directory not empty"),
            Self::DiskFull => write!(f, "no free clusters"),
            Self::DirectoryFull => write!(f, "root directory full"),
            Self::SeekBeyondEnd => write!(f, "seek beyond end of file"),
            Self::ReadOnly => write!(f, "file is read-only"),
            Self::WriteOnly => write!(f, "file not open for reading"),
            Self::NotOpen => write!(f, "file not open"),
            Self::AlreadyOpen => write!(f, "handle already open"),
            Self::NotContiguous => write!(f, "file is not contiguous"),
        }
    }
}
