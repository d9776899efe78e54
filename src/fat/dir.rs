use crate::block::BlockDevice;

use super::{
    entry::{make_83_name, Attributes, DirEntry},
    file::{read_entry, write_entry, FileHandle, FileKind, OpenMode},
    FatError, Volume,
};

const DOT_NAME: [u8; 11] = *b".          ";
const DOT_DOT_NAME: [u8; 11] = *b"..         ";

impl FileHandle {
    /// Creates subdirectory `name` in `parent` with its `.` and `..` entries
    /// and leaves it open for reading.
    pub fn make_dir<D: BlockDevice>(
        &mut self,
        vol: &mut Volume<D>,
        parent: &mut FileHandle,
        name: &str,
    ) -> Result<(), FatError<D::Error>> {
        self.ensure_closed()?;
        let name = make_83_name(name).ok_or(FatError::InvalidName)?;
        let mut dir = Self::open_in(
            vol,
            parent,
            &name,
            OpenMode::CREATE | OpenMode::EXCL | OpenMode::RDWR,
            true,
        )?;

        let geometry = *vol.geometry();
        let first_block = geometry.cluster_start_block(dir.first_cluster);
        for i in (0..geometry.blocks_per_cluster as u32).rev() {
            vol.cache_claim(first_block + i)?;
        }

        let location = dir.entry.ok_or(FatError::NotFound)?;
        let mut entry = read_entry(vol, location)?;
        entry.attributes = Attributes::DIRECTORY;
        write_entry(vol, location, &entry)?;

        let dot = DirEntry {
            name: DOT_NAME,
            ..entry
        };
        let dot_dot = DirEntry {
            name: DOT_DOT_NAME,
            first_cluster: if parent.is_root() {
                0
            } else {
                parent.first_cluster
            },
            ..entry
        };
        let block = vol.cache_write(first_block)?;
        dot.encode(&mut block[..32]);
        dot_dot.encode(&mut block[32..64]);

        dir.kind = FileKind::SubDir;
        dir.flags = OpenMode::READ;
        dir.file_size = geometry.cluster_size_bytes();
        dir.cur_cluster = dir.first_cluster;
        dir.position = 64;
        vol.flush()?;

        log::debug!(
            "fat: mkdir name={} cluster={}",
            entry.display_name(),
            dir.first_cluster
        );
        *self = dir;
        Ok(())
    }

    /// Removes this directory if it holds nothing but `.` and `..`. The
    /// handle is closed afterwards.
    pub fn rm_dir<D: BlockDevice>(&mut self, vol: &mut Volume<D>) -> Result<(), FatError<D::Error>> {
        if !self.is_sub_dir() {
            return Err(FatError::NotADirectory);
        }
        self.rewind();
        while let Some(location) = self.read_dir_cache(vol)? {
            let entry = read_entry(vol, location)?;
            if entry.is_free() {
                break;
            }
            if entry.is_deleted() || entry.is_dot() {
                continue;
            }
            if entry.is_file_or_subdir() {
                return Err(FatError::DirectoryNotEmpty);
            }
        }

        self.kind = FileKind::Normal;
        self.flags |= OpenMode::WRITE;
        self.remove(vol)
    }

    /// Next file or subdirectory entry at the directory cursor, skipping
    /// deleted slots, `.`, `..` and volume labels. `None` at the end.
    pub fn read_dir<D: BlockDevice>(
        &mut self,
        vol: &mut Volume<D>,
    ) -> Result<Option<DirEntry>, FatError<D::Error>> {
        if !self.is_dir() {
            return Err(FatError::NotADirectory);
        }
        if self.position & 0x1F != 0 {
            return Err(FatError::InvalidArgument);
        }
        while let Some(location) = self.read_dir_cache(vol)? {
            let entry = read_entry(vol, location)?;
            if entry.is_free() {
                return Ok(None);
            }
            if entry.is_deleted() || entry.is_dot() || !entry.is_file_or_subdir() {
                continue;
            }
            return Ok(Some(entry));
        }
        Ok(None)
    }

    /// Opens the next file or subdirectory after the directory cursor.
    pub fn open_next<D: BlockDevice>(
        &mut self,
        vol: &mut Volume<D>,
        mode: OpenMode,
    ) -> Result<Option<FileHandle>, FatError<D::Error>> {
        if !self.is_dir() {
            return Err(FatError::NotADirectory);
        }
        if self.position & 0x1F != 0 {
            return Err(FatError::InvalidArgument);
        }
        while let Some(location) = self.read_dir_cache(vol)? {
            let entry = read_entry(vol, location)?;
            if entry.is_free() {
                return Ok(None);
            }
            if entry.is_deleted() || entry.is_dot() || !entry.is_file_or_subdir() {
                continue;
            }
            return Self::open_cached_entry(vol, location, mode).map(Some);
        }
        Ok(None)
    }

    /// Opens the entry in slot `index` of `dir`. Leaves the directory cursor
    /// just past that slot.
    pub fn open_index<D: BlockDevice>(
        &mut self,
        vol: &mut Volume<D>,
        dir: &mut FileHandle,
        index: u16,
        mode: OpenMode,
    ) -> Result<(), FatError<D::Error>> {
        self.ensure_closed()?;
        if mode.contains(OpenMode::CREATE | OpenMode::EXCL) {
            return Err(FatError::InvalidArgument);
        }
        if !dir.is_dir() {
            return Err(FatError::NotADirectory);
        }
        dir.seek_set(vol, index as u32 * 32)?;
        let location = dir.read_dir_cache(vol)?.ok_or(FatError::NotFound)?;
        let entry = read_entry(vol, location)?;
        if entry.is_free() || entry.is_deleted() || entry.is_dot() {
            return Err(FatError::NotFound);
        }
        *self = Self::open_cached_entry(vol, location, mode)?;
        Ok(())
    }
}
