use crate::block::{BlockDevice, BLOCK_SIZE};

/// Where the other copies of a resident FAT block live.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FatMirror {
    /// Distance in blocks between FAT copies.
    pub stride: u32,
    /// Total number of FAT copies, including the resident one.
    pub copies: u8,
}

/// The single block buffer of a volume.
///
/// Only one block is resident at a time. Switching to another block writes
/// the resident one back first if it is dirty; a dirty FAT block is written
/// to every FAT copy.
pub struct BlockCache {
    data: [u8; BLOCK_SIZE],
    block: Option<u32>,
    dirty: bool,
    mirror: Option<FatMirror>,
}

impl Default for BlockCache {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockCache {
    pub const fn new() -> Self {
        Self {
            data: [0; BLOCK_SIZE],
            block: None,
            dirty: false,
            mirror: None,
        }
    }

    pub fn block(&self) -> Option<u32> {
        self.block
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Makes `lba` resident. With `for_write` the line is marked dirty.
    pub fn load<D: BlockDevice>(
        &mut self,
        device: &mut D,
        lba: u32,
        for_write: bool,
    ) -> Result<&mut [u8; BLOCK_SIZE], D::Error> {
        if self.block != Some(lba) {
            self.flush(device, true)?;
            self.mirror = None;
            if let Err(err) = device.read_block(lba, &mut self.data) {
                self.block = None;
                return Err(err);
            }
            self.block = Some(lba);
        }
        if for_write {
            self.dirty = true;
        }
        Ok(&mut self.data)
    }

    /// Like [`load`](Self::load) for writing, and records the FAT copies the
    /// block must be mirrored to on flush.
    pub fn load_fat<D: BlockDevice>(
        &mut self,
        device: &mut D,
        lba: u32,
        mirror: FatMirror,
    ) -> Result<&mut [u8; BLOCK_SIZE], D::Error> {
        self.load(device, lba, true)?;
        if mirror.copies > 1 {
            self.mirror = Some(mirror);
        }
        Ok(&mut self.data)
    }

    /// Makes `lba` resident as a zero-filled dirty block without reading it.
    pub fn claim<D: BlockDevice>(
        &mut self,
        device: &mut D,
        lba: u32,
    ) -> Result<&mut [u8; BLOCK_SIZE], D::Error> {
        self.flush(device, true)?;
        self.mirror = None;
        self.data.fill(0);
        self.block = Some(lba);
        self.dirty = true;
        Ok(&mut self.data)
    }

    /// Writes the line back if dirty. Without `blocking` only the final
    /// write (the last FAT copy, or the block itself) skips the busy wait.
    pub fn flush<D: BlockDevice>(
        &mut self,
        device: &mut D,
        blocking: bool,
    ) -> Result<(), D::Error> {
        if !self.dirty {
            return Ok(());
        }
        let Some(lba) = self.block else {
            self.dirty = false;
            return Ok(());
        };
        let copies = self.mirror.map_or(1, |mirror| mirror.copies as u32);
        let stride = self.mirror.map_or(0, |mirror| mirror.stride);
        for copy in 0..copies {
            let last = copy + 1 == copies;
            device.write_block(lba + copy * stride, &self.data, blocking || !last)?;
        }
        self.dirty = false;
        self.mirror = None;
        Ok(())
    }

    /// Drops `lba` without writing it back, after the caller overwrote the
    /// whole block on the device.
    pub fn invalidate(&mut self, lba: u32) {
        if self.block == Some(lba) {
            self.block = None;
            self.dirty = false;
            self.mirror = None;
        }
    }

    /// Contents of `lba` if it is resident.
    pub fn peek(&self, lba: u32) -> Option<&[u8; BLOCK_SIZE]> {
        (self.block == Some(lba)).then_some(&self.data)
    }
}
