use core::fmt::Debug;

use crate::card::CardType;

pub const BLOCK_SIZE: usize = 512;

/// Flat array of 512-byte blocks.
///
/// `SdCard` implements this over SPI; anything else that can move whole
/// blocks (a RAM disk in tests, an image file on a host) can stand in for it.
pub trait BlockDevice {
    type Error: Debug;

    fn read_block(&mut self, lba: u32, out: &mut [u8; BLOCK_SIZE]) -> Result<(), Self::Error>;

    /// With `blocking == false` the device may return before the block is
    /// programmed; the next access waits for it.
    fn write_block(
        &mut self,
        lba: u32,
        data: &[u8; BLOCK_SIZE],
        blocking: bool,
    ) -> Result<(), Self::Error>;

    fn is_busy(&mut self) -> bool;

    /// Reads `out.len()` bytes starting at byte `offset` of block `lba`.
    /// The range must lie inside the block.
    fn read_partial(
        &mut self,
        lba: u32,
        offset: usize,
        out: &mut [u8],
    ) -> Result<(), Self::Error> {
        let mut block = [0u8; BLOCK_SIZE];
        self.read_block(lba, &mut block)?;
        out.copy_from_slice(&block[offset..offset + out.len()]);
        Ok(())
    }

    fn card_type(&self) -> Option<CardType> {
        None
    }
}

impl<T: BlockDevice + ?Sized> BlockDevice for &mut T {
    type Error = T::Error;

    fn read_block(&mut self, lba: u32, out: &mut [u8; BLOCK_SIZE]) -> Result<(), Self::Error> {
        (**self).read_block(lba, out)
    }

    fn write_block(
        &mut self,
        lba: u32,
        data: &[u8; BLOCK_SIZE],
        blocking: bool,
    ) -> Result<(), Self::Error> {
        (**self).write_block(lba, data, blocking)
    }

    fn is_busy(&mut self) -> bool {
        (**self).is_busy()
    }

    fn read_partial(
        &mut self,
        lba: u32,
        offset: usize,
        out: &mut [u8],
    ) -> Result<(), Self::Error> {
        (**self).read_partial(lba, offset, out)
    }

    fn card_type(&self) -> Option<CardType> {
        (**self).card_type()
    }
}
