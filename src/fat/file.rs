use bitflags::bitflags;
use heapless::String;

use crate::block::{BlockDevice, BLOCK_SIZE};

use super::{
    entry::{make_83_name, DirEntry, FatTimestamp, TimestampKind, DIR_ENTRY_SIZE},
    DIR_NAME_DELETED, DIR_NAME_FREE, FatError, FatWidth, Volume,
};

static ZERO_BLOCK: [u8; BLOCK_SIZE] = [0; BLOCK_SIZE];

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct OpenMode: u8 {
        const READ = 0x01;
        const WRITE = 0x02;
        /// Every write goes to the end of the file.
        const APPEND = 0x04;
        /// Sync after every write.
        const SYNC = 0x08;
        const CREATE = 0x10;
        /// With CREATE, fail if the file exists.
        const EXCL = 0x20;
        const TRUNC = 0x40;
        /// Reads that do not fill whole blocks go straight to the device
        /// instead of through the volume cache.
        const UNBUFFERED = 0x80;
    }
}

impl OpenMode {
    pub const RDWR: Self = Self::READ.union(Self::WRITE);
    /// Read, write and create; writes append.
    pub const FILE_WRITE: Self = Self::RDWR.union(Self::CREATE).union(Self::APPEND);

    const KEPT: Self = Self::RDWR
        .union(Self::APPEND)
        .union(Self::SYNC)
        .union(Self::UNBUFFERED);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum FileKind {
    #[default]
    Closed,
    Normal,
    RootFat16,
    RootFat32,
    SubDir,
}

/// Block and slot of a directory entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) struct EntryLocation {
    pub(super) block: u32,
    pub(super) index: u8,
}

impl EntryLocation {
    fn offset(self) -> usize {
        self.index as usize * DIR_ENTRY_SIZE
    }
}

pub(super) fn read_entry<D: BlockDevice>(
    vol: &mut Volume<D>,
    location: EntryLocation,
) -> Result<DirEntry, FatError<D::Error>> {
    let block = vol.cache_read(location.block)?;
    let offset = location.offset();
    Ok(DirEntry::decode(&block[offset..offset + DIR_ENTRY_SIZE]))
}

pub(super) fn write_entry<D: BlockDevice>(
    vol: &mut Volume<D>,
    location: EntryLocation,
    entry: &DirEntry,
) -> Result<(), FatError<D::Error>> {
    let block = vol.cache_write(location.block)?;
    let offset = location.offset();
    entry.encode(&mut block[offset..offset + DIR_ENTRY_SIZE]);
    Ok(())
}

/// One open file or directory.
///
/// `cur_cluster` is the cluster holding byte `position - 1`, or 0 at
/// position 0. A write-mode handle may sit past `file_size` after a seek;
/// `cur_cluster` then still describes `file_size`.
#[derive(Debug, Default)]
pub struct FileHandle {
    pub(super) kind: FileKind,
    pub(super) flags: OpenMode,
    pub(super) dir_dirty: bool,
    pub(super) cur_cluster: u32,
    pub(super) position: u32,
    pub(super) first_cluster: u32,
    pub(super) file_size: u32,
    pub(super) entry: Option<EntryLocation>,
}

impl FileHandle {
    pub const fn new() -> Self {
        Self {
            kind: FileKind::Closed,
            flags: OpenMode::empty(),
            dir_dirty: false,
            cur_cluster: 0,
            position: 0,
            first_cluster: 0,
            file_size: 0,
            entry: None,
        }
    }

    pub fn kind(&self) -> FileKind {
        self.kind
    }

    pub fn mode(&self) -> OpenMode {
        self.flags
    }

    pub fn is_open(&self) -> bool {
        self.kind != FileKind::Closed
    }

    pub fn is_file(&self) -> bool {
        self.kind == FileKind::Normal
    }

    pub fn is_dir(&self) -> bool {
        matches!(
            self.kind,
            FileKind::RootFat16 | FileKind::RootFat32 | FileKind::SubDir
        )
    }

    pub fn is_root(&self) -> bool {
        matches!(self.kind, FileKind::RootFat16 | FileKind::RootFat32)
    }

    pub fn is_sub_dir(&self) -> bool {
        self.kind == FileKind::SubDir
    }

    pub fn file_size(&self) -> u32 {
        self.file_size
    }

    pub fn position(&self) -> u32 {
        self.position
    }

    pub fn first_cluster(&self) -> u32 {
        self.first_cluster
    }

    pub fn current_cluster(&self) -> u32 {
        self.cur_cluster
    }

    pub(super) fn ensure_closed<E>(&self) -> Result<(), FatError<E>> {
        if self.is_open() {
            return Err(FatError::AlreadyOpen);
        }
        Ok(())
    }

    pub fn open_root<D: BlockDevice>(
        &mut self,
        vol: &mut Volume<D>,
    ) -> Result<(), FatError<D::Error>> {
        self.ensure_closed()?;
        let geometry = *vol.geometry();
        let mut root = Self::new();
        match geometry.width {
            FatWidth::Fat32 => {
                root.kind = FileKind::RootFat32;
                root.first_cluster = geometry.root_dir_start;
                root.file_size = vol.chain_size(geometry.root_dir_start)?;
            }
            FatWidth::Fat12 | FatWidth::Fat16 => {
                root.kind = FileKind::RootFat16;
                root.file_size = geometry.root_dir_entries as u32 * DIR_ENTRY_SIZE as u32;
            }
        }
        root.flags = OpenMode::READ;
        *self = root;
        Ok(())
    }

    /// Opens `name` in directory `dir`. On failure the handle stays closed.
    pub fn open<D: BlockDevice>(
        &mut self,
        vol: &mut Volume<D>,
        dir: &mut FileHandle,
        name: &str,
        mode: OpenMode,
    ) -> Result<(), FatError<D::Error>> {
        self.ensure_closed()?;
        let name = make_83_name(name).ok_or(FatError::InvalidName)?;
        *self = Self::open_in(vol, dir, &name, mode, true)?;
        Ok(())
    }

    /// Creates `name` with `size` bytes of contiguous clusters. The content
    /// is whatever the clusters held before.
    pub fn create_contiguous<D: BlockDevice>(
        &mut self,
        vol: &mut Volume<D>,
        dir: &mut FileHandle,
        name: &str,
        size: u32,
    ) -> Result<(), FatError<D::Error>> {
        self.ensure_closed()?;
        if size == 0 {
            return Err(FatError::InvalidArgument);
        }
        let name = make_83_name(name).ok_or(FatError::InvalidName)?;
        let mut file = Self::open_in(
            vol,
            dir,
            &name,
            OpenMode::CREATE | OpenMode::EXCL | OpenMode::RDWR,
            false,
        )?;

        let shift = vol.geometry().cluster_size_shift as u32 + 9;
        let count = ((size - 1) >> shift) + 1;
        let first = match vol.alloc_contiguous(count, None) {
            Ok(first) => first,
            Err(err) => {
                let _ = file.remove(vol);
                return Err(err);
            }
        };
        file.first_cluster = first;
        file.file_size = size;
        file.dir_dirty = true;
        file.sync(vol)?;
        *self = file;
        Ok(())
    }

    /// Scans `dir` for `name`, creating it if `mode` asks for that.
    /// `alloc_first` gives a new file its first cluster up front.
    pub(super) fn open_in<D: BlockDevice>(
        vol: &mut Volume<D>,
        dir: &mut FileHandle,
        name: &[u8; 11],
        mode: OpenMode,
        alloc_first: bool,
    ) -> Result<Self, FatError<D::Error>> {
        if !dir.is_dir() {
            return Err(FatError::NotADirectory);
        }
        // Another handle on the same directory may have grown it.
        if dir.kind != FileKind::RootFat16 {
            dir.file_size = vol.chain_size(dir.first_cluster)?;
        }
        dir.rewind();

        let mut empty = None;
        while let Some(location) = dir.read_dir_cache(vol)? {
            let block = vol.cache_read(location.block)?;
            let offset = location.offset();
            let slot = &block[offset..offset + DIR_ENTRY_SIZE];
            if slot[0] == DIR_NAME_FREE || slot[0] == DIR_NAME_DELETED {
                if empty.is_none() {
                    empty = Some(location);
                }
                if slot[0] == DIR_NAME_FREE {
                    break;
                }
            } else if slot[0..11] == name[..] {
                if mode.contains(OpenMode::CREATE | OpenMode::EXCL) {
                    return Err(FatError::AlreadyExists);
                }
                return Self::open_cached_entry(vol, location, mode);
            }
        }

        if !mode.contains(OpenMode::CREATE | OpenMode::WRITE) {
            return Err(FatError::NotFound);
        }

        let location = match empty {
            Some(location) => location,
            None if dir.kind == FileKind::RootFat16 => return Err(FatError::DirectoryFull),
            None => EntryLocation {
                block: dir.add_dir_cluster(vol)?,
                index: 0,
            },
        };

        let mut entry = DirEntry::new(*name, vol.now());
        if alloc_first {
            entry.first_cluster = vol.alloc_contiguous(1, None)?;
        }
        let block = vol.cache_write(location.block)?;
        let offset = location.offset();
        let slot = &mut block[offset..offset + DIR_ENTRY_SIZE];
        slot.fill(0);
        entry.encode(slot);
        vol.flush()?;
        log::debug!(
            "fat: create name={} block={} slot={} cluster={}",
            entry.display_name(),
            location.block,
            location.index,
            entry.first_cluster
        );

        Self::open_cached_entry(vol, location, mode)
    }

    pub(super) fn open_cached_entry<D: BlockDevice>(
        vol: &mut Volume<D>,
        location: EntryLocation,
        mode: OpenMode,
    ) -> Result<Self, FatError<D::Error>> {
        let entry = read_entry(vol, location)?;
        if mode.intersects(OpenMode::WRITE | OpenMode::TRUNC) {
            if entry.is_dir() {
                return Err(FatError::IsADirectory);
            }
            if entry.is_read_only() {
                return Err(FatError::ReadOnly);
            }
        }

        let (kind, file_size) = if entry.is_file() {
            (FileKind::Normal, entry.size)
        } else if entry.is_dir() {
            (FileKind::SubDir, vol.chain_size(entry.first_cluster)?)
        } else {
            return Err(FatError::NotFound);
        };

        let mut file = Self {
            kind,
            flags: mode & OpenMode::KEPT,
            dir_dirty: false,
            cur_cluster: 0,
            position: 0,
            first_cluster: entry.first_cluster,
            file_size,
            entry: Some(location),
        };
        if mode.contains(OpenMode::TRUNC) {
            file.truncate(vol, 0)?;
        }
        Ok(file)
    }

    /// Device block holding byte `position`, following the chain when the
    /// position enters a new cluster.
    fn block_for_position<D: BlockDevice>(
        &mut self,
        vol: &mut Volume<D>,
    ) -> Result<u32, FatError<D::Error>> {
        let geometry = *vol.geometry();
        if self.kind == FileKind::RootFat16 {
            return Ok(geometry.root_dir_start + (self.position >> 9));
        }
        let block_of_cluster = geometry.block_of_cluster(self.position);
        if self.position & 0x1FF == 0 && block_of_cluster == 0 {
            self.cur_cluster = if self.position == 0 {
                self.first_cluster
            } else {
                vol.fat_get(self.cur_cluster)?
            };
        }
        if self.cur_cluster < 2
            || self.cur_cluster > geometry.last_cluster()
            || vol.is_eoc(self.cur_cluster)
        {
            return Err(FatError::BadCluster(self.cur_cluster));
        }
        Ok(geometry.cluster_start_block(self.cur_cluster) + block_of_cluster)
    }

    /// Location of the entry at the cursor; advances the cursor one entry.
    pub(super) fn read_dir_cache<D: BlockDevice>(
        &mut self,
        vol: &mut Volume<D>,
    ) -> Result<Option<EntryLocation>, FatError<D::Error>> {
        if !self.is_dir() {
            return Err(FatError::NotADirectory);
        }
        if self.position >= self.file_size {
            return Ok(None);
        }
        let index = ((self.position >> 5) & 0x0F) as u8;
        let block = self.block_for_position(vol)?;
        self.position += DIR_ENTRY_SIZE as u32;
        Ok(Some(EntryLocation { block, index }))
    }

    /// Reads up to `buf.len()` bytes. Returns 0 at end of file.
    pub fn read<D: BlockDevice>(
        &mut self,
        vol: &mut Volume<D>,
        buf: &mut [u8],
    ) -> Result<usize, FatError<D::Error>> {
        if !self.is_open() {
            return Err(FatError::NotOpen);
        }
        if !self.flags.contains(OpenMode::READ) {
            return Err(FatError::WriteOnly);
        }

        let available = self.file_size.saturating_sub(self.position) as usize;
        let len = buf.len().min(available);
        let mut done = 0;
        while done < len {
            let offset = self.position as usize & (BLOCK_SIZE - 1);
            let chunk = (len - done).min(BLOCK_SIZE - offset);
            let block = self.block_for_position(vol)?;
            let dst = &mut buf[done..done + chunk];
            match dst.first_chunk_mut::<BLOCK_SIZE>() {
                Some(whole) => vol.read_direct(block, whole)?,
                None if self.flags.contains(OpenMode::UNBUFFERED) => {
                    vol.read_partial(block, offset, dst)?
                }
                None => {
                    let data = vol.cache_read(block)?;
                    dst.copy_from_slice(&data[offset..offset + chunk]);
                }
            }
            self.position += chunk as u32;
            done += chunk;
        }
        Ok(len)
    }

    /// Writes all of `data` at the cursor, growing the chain as needed.
    ///
    /// If a seek left the cursor past the end of file, the gap is filled
    /// with zeros first.
    pub fn write<D: BlockDevice>(
        &mut self,
        vol: &mut Volume<D>,
        data: &[u8],
    ) -> Result<usize, FatError<D::Error>> {
        match self.kind {
            FileKind::Normal => {}
            FileKind::Closed => return Err(FatError::NotOpen),
            _ => return Err(FatError::IsADirectory),
        }
        if !self.flags.contains(OpenMode::WRITE) {
            return Err(FatError::ReadOnly);
        }

        if self.flags.contains(OpenMode::APPEND) && self.position != self.file_size {
            self.seek_set(vol, self.file_size)?;
        }
        if self.position > self.file_size {
            let gap_end = self.position;
            self.seek_set(vol, self.file_size)?;
            while self.position < gap_end {
                let len = ((gap_end - self.position) as usize).min(BLOCK_SIZE);
                self.write_bytes(vol, &ZERO_BLOCK[..len])?;
            }
        }
        self.write_bytes(vol, data)?;

        if self.position > self.file_size {
            self.file_size = self.position;
            self.dir_dirty = true;
        } else if vol.clock().is_some() && !data.is_empty() {
            self.dir_dirty = true;
        }
        if self.flags.contains(OpenMode::SYNC) {
            self.sync(vol)?;
        }
        Ok(data.len())
    }

    fn write_bytes<D: BlockDevice>(
        &mut self,
        vol: &mut Volume<D>,
        data: &[u8],
    ) -> Result<(), FatError<D::Error>> {
        let geometry = *vol.geometry();
        let mut done = 0;
        while done < data.len() {
            let block_of_cluster = geometry.block_of_cluster(self.position);
            let offset = self.position as usize & (BLOCK_SIZE - 1);
            if block_of_cluster == 0 && offset == 0 {
                if self.cur_cluster == 0 {
                    if self.first_cluster == 0 {
                        self.add_cluster(vol)?;
                    } else {
                        self.cur_cluster = self.first_cluster;
                    }
                } else {
                    let next = vol.fat_get(self.cur_cluster)?;
                    if vol.is_eoc(next) {
                        self.add_cluster(vol)?;
                    } else {
                        self.cur_cluster = next;
                    }
                }
            }

            if self.cur_cluster < 2 || self.cur_cluster > geometry.last_cluster() {
                return Err(FatError::BadCluster(self.cur_cluster));
            }

            let chunk = (data.len() - done).min(BLOCK_SIZE - offset);
            let block = geometry.cluster_start_block(self.cur_cluster) + block_of_cluster;
            let src = &data[done..done + chunk];
            match src.first_chunk::<BLOCK_SIZE>() {
                Some(whole) => vol.write_direct(block, whole)?,
                None => {
                    // A fresh block past the end of file needs no read.
                    let cached = if offset == 0 && self.position >= self.file_size {
                        vol.cache_claim(block)?
                    } else {
                        vol.cache_write(block)?
                    };
                    cached[offset..offset + chunk].copy_from_slice(src);
                }
            }
            self.position += chunk as u32;
            done += chunk;
        }
        Ok(())
    }

    /// Appends one cluster after `cur_cluster` and makes it current.
    fn add_cluster<D: BlockDevice>(
        &mut self,
        vol: &mut Volume<D>,
    ) -> Result<(), FatError<D::Error>> {
        let extend_from = (self.cur_cluster != 0).then_some(self.cur_cluster);
        self.cur_cluster = vol.alloc_contiguous(1, extend_from)?;
        if self.first_cluster == 0 {
            self.first_cluster = self.cur_cluster;
        }
        self.dir_dirty = true;
        Ok(())
    }

    /// Grows a directory by one zeroed cluster and returns its first block,
    /// which is left resident in the cache.
    pub(super) fn add_dir_cluster<D: BlockDevice>(
        &mut self,
        vol: &mut Volume<D>,
    ) -> Result<u32, FatError<D::Error>> {
        self.add_cluster(vol)?;
        let geometry = *vol.geometry();
        let first_block = geometry.cluster_start_block(self.cur_cluster);
        for i in (0..geometry.blocks_per_cluster as u32).rev() {
            vol.cache_claim(first_block + i)?;
        }
        self.file_size += geometry.cluster_size_bytes();
        Ok(first_block)
    }

    /// Moves the cursor to `pos`.
    ///
    /// Read-only handles cannot move past the end of file. A writable file
    /// can; the gap is zero-filled by the next `write`.
    pub fn seek_set<D: BlockDevice>(
        &mut self,
        vol: &mut Volume<D>,
        pos: u32,
    ) -> Result<(), FatError<D::Error>> {
        if !self.is_open() {
            return Err(FatError::NotOpen);
        }
        let target = pos;
        let pos = if pos > self.file_size {
            if !(self.is_file() && self.flags.contains(OpenMode::WRITE)) {
                return Err(FatError::SeekBeyondEnd);
            }
            self.file_size
        } else {
            pos
        };

        if self.kind == FileKind::RootFat16 || pos == 0 {
            self.cur_cluster = 0;
            self.position = target;
            return Ok(());
        }

        let shift = vol.geometry().cluster_size_shift as u32 + 9;
        let mut hops = (pos - 1) >> shift;
        let restart = self.position == 0
            || self.position > self.file_size
            || hops < ((self.position - 1) >> shift);
        if restart {
            self.cur_cluster = self.first_cluster;
        } else {
            hops -= (self.position - 1) >> shift;
        }
        for _ in 0..hops {
            self.cur_cluster = vol.fat_get(self.cur_cluster)?;
        }
        self.position = target;
        Ok(())
    }

    pub fn seek_cur<D: BlockDevice>(
        &mut self,
        vol: &mut Volume<D>,
        delta: i32,
    ) -> Result<(), FatError<D::Error>> {
        let target = self.position as i64 + delta as i64;
        let target = u32::try_from(target).map_err(|_| FatError::SeekBeyondEnd)?;
        self.seek_set(vol, target)
    }

    pub fn seek_end<D: BlockDevice>(
        &mut self,
        vol: &mut Volume<D>,
    ) -> Result<(), FatError<D::Error>> {
        self.seek_set(vol, self.file_size)
    }

    pub fn rewind(&mut self) {
        self.position = 0;
        self.cur_cluster = 0;
    }

    /// Shortens the file to `length` bytes and frees the clusters past it.
    pub fn truncate<D: BlockDevice>(
        &mut self,
        vol: &mut Volume<D>,
        length: u32,
    ) -> Result<(), FatError<D::Error>> {
        match self.kind {
            FileKind::Normal => {}
            FileKind::Closed => return Err(FatError::NotOpen),
            _ => return Err(FatError::IsADirectory),
        }
        if !self.flags.contains(OpenMode::WRITE) {
            return Err(FatError::ReadOnly);
        }
        if length > self.file_size {
            return Err(FatError::SeekBeyondEnd);
        }
        if self.file_size == 0 && self.first_cluster == 0 {
            return Ok(());
        }

        let new_position = self.position.min(length);
        self.seek_set(vol, length)?;
        if length == 0 {
            if self.first_cluster != 0 {
                vol.free_chain(self.first_cluster)?;
                self.first_cluster = 0;
            }
        } else {
            let next = vol.fat_get(self.cur_cluster)?;
            if !vol.is_eoc(next) {
                vol.free_chain(next)?;
                vol.fat_put_eoc(self.cur_cluster)?;
            }
        }
        self.file_size = length;
        self.dir_dirty = true;
        self.sync(vol)?;
        self.seek_set(vol, new_position)
    }

    /// Writes the directory entry back if it changed, then flushes the cache.
    pub fn sync<D: BlockDevice>(&mut self, vol: &mut Volume<D>) -> Result<(), FatError<D::Error>> {
        self.sync_entry(vol)?;
        vol.flush()
    }

    /// [`sync`](Self::sync) without waiting for the device to finish the
    /// last block. Pair with [`available_for_write`](Self::available_for_write).
    pub fn sync_nonblocking<D: BlockDevice>(
        &mut self,
        vol: &mut Volume<D>,
    ) -> Result<(), FatError<D::Error>> {
        self.sync_entry(vol)?;
        vol.flush_nonblocking()
    }

    /// Bytes that fit in the current block without another device write,
    /// or 0 while the device is still busy.
    pub fn available_for_write<D: BlockDevice>(&self, vol: &mut Volume<D>) -> usize {
        if !self.is_file() || !self.flags.contains(OpenMode::WRITE) || vol.is_busy() {
            return 0;
        }
        BLOCK_SIZE - (self.position as usize & (BLOCK_SIZE - 1))
    }

    fn sync_entry<D: BlockDevice>(
        &mut self,
        vol: &mut Volume<D>,
    ) -> Result<(), FatError<D::Error>> {
        if !self.is_open() {
            return Err(FatError::NotOpen);
        }
        if self.dir_dirty {
            if let Some(location) = self.entry {
                let mut entry = read_entry(vol, location)?;
                if !self.is_dir() {
                    entry.size = self.file_size;
                }
                entry.first_cluster = self.first_cluster;
                if let Some(now) = vol.clock() {
                    entry.write_date = now.date;
                    entry.write_time = now.time;
                    entry.access_date = now.date;
                }
                write_entry(vol, location, &entry)?;
            }
            self.dir_dirty = false;
        }
        Ok(())
    }

    /// Syncs and closes. On a failed sync the handle stays open.
    pub fn close<D: BlockDevice>(&mut self, vol: &mut Volume<D>) -> Result<(), FatError<D::Error>> {
        self.sync(vol)?;
        *self = Self::new();
        Ok(())
    }

    /// Sets the stamps selected by `kinds` on the directory entry.
    #[allow(clippy::too_many_arguments)]
    pub fn timestamp<D: BlockDevice>(
        &mut self,
        vol: &mut Volume<D>,
        kinds: TimestampKind,
        year: u16,
        month: u8,
        day: u8,
        hour: u8,
        minute: u8,
        second: u8,
    ) -> Result<(), FatError<D::Error>> {
        if !self.is_open() {
            return Err(FatError::NotOpen);
        }
        let stamp = FatTimestamp::new(year, month, day, hour, minute, second)
            .ok_or(FatError::InvalidArgument)?;
        let location = self.entry.ok_or(FatError::InvalidArgument)?;

        let mut entry = read_entry(vol, location)?;
        if kinds.contains(TimestampKind::ACCESS) {
            entry.access_date = stamp.date;
        }
        if kinds.contains(TimestampKind::CREATE) {
            entry.creation_date = stamp.date;
            entry.creation_time = stamp.time;
            entry.creation_tenths = if second & 1 == 1 { 100 } else { 0 };
        }
        if kinds.contains(TimestampKind::WRITE) {
            entry.write_date = stamp.date;
            entry.write_time = stamp.time;
        }
        write_entry(vol, location, &entry)?;
        self.sync(vol)
    }

    /// Synced copy of this handle's directory entry. The root has none.
    pub fn dir_entry<D: BlockDevice>(
        &mut self,
        vol: &mut Volume<D>,
    ) -> Result<DirEntry, FatError<D::Error>> {
        self.sync(vol)?;
        let location = self.entry.ok_or(FatError::InvalidArgument)?;
        read_entry(vol, location)
    }

    /// `NAME.EXT`, or `/` for the root.
    pub fn name<D: BlockDevice>(
        &mut self,
        vol: &mut Volume<D>,
    ) -> Result<String<12>, FatError<D::Error>> {
        if self.is_root() {
            let mut root = String::new();
            let _ = root.push('/');
            return Ok(root);
        }
        Ok(self.dir_entry(vol)?.display_name())
    }

    /// First and last device block of a file stored in one run of clusters.
    pub fn contiguous_range<D: BlockDevice>(
        &self,
        vol: &mut Volume<D>,
    ) -> Result<(u32, u32), FatError<D::Error>> {
        if self.first_cluster == 0 {
            return Err(FatError::NotContiguous);
        }
        let geometry = *vol.geometry();
        let mut cluster = self.first_cluster;
        loop {
            let next = vol.fat_get(cluster)?;
            if next != cluster + 1 {
                if !vol.is_eoc(next) {
                    return Err(FatError::NotContiguous);
                }
                return Ok((
                    geometry.cluster_start_block(self.first_cluster),
                    geometry.cluster_start_block(cluster) + geometry.blocks_per_cluster as u32 - 1,
                ));
            }
            cluster = next;
        }
    }

    /// Frees the file's clusters and marks its entry deleted. The handle is
    /// closed afterwards.
    pub fn remove<D: BlockDevice>(&mut self, vol: &mut Volume<D>) -> Result<(), FatError<D::Error>> {
        self.truncate(vol, 0)?;
        let location = self.entry.ok_or(FatError::NotFound)?;
        let block = vol.cache_write(location.block)?;
        block[location.offset()] = DIR_NAME_DELETED;
        *self = Self::new();
        vol.flush()
    }

    /// Removes the file `name` from `dir`.
    pub fn remove_path<D: BlockDevice>(
        vol: &mut Volume<D>,
        dir: &mut FileHandle,
        name: &str,
    ) -> Result<(), FatError<D::Error>> {
        let mut file = Self::new();
        file.open(vol, dir, name, OpenMode::WRITE)?;
        file.remove(vol)
    }
}
