use embedded_hal::{delay::DelayNs, digital::OutputPin};

use super::{SdCard, SdCardError, SdSpi, CMD10};

/// Card-specific data register.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Csd([u8; 16]);

impl Csd {
    pub fn new(raw: [u8; 16]) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> &[u8; 16] {
        &self.0
    }

    /// CSD_STRUCTURE: 0 for standard capacity, 1 for SDHC/SDXC.
    pub fn version(&self) -> u8 {
        self.bits(127, 126) as u8
    }

    pub fn erase_single_block(&self) -> bool {
        self.bits(46, 46) == 1
    }

    /// Capacity in 512-byte blocks, `None` for an unknown structure version.
    pub fn card_size_blocks(&self) -> Option<u32> {
        match self.version() {
            0 => {
                let c_size = self.bits(73, 62);
                let c_size_mult = self.bits(49, 47);
                let read_bl_len = self.bits(83, 80);
                let shift = (c_size_mult + 2 + read_bl_len).checked_sub(9)?;
                (c_size + 1).checked_shl(shift)
            }
            1 => {
                let c_size = self.bits(69, 48);
                (c_size + 1).checked_mul(1024)
            }
            _ => None,
        }
    }

    fn bits(&self, msb: u8, lsb: u8) -> u32 {
        let mut value = 0u32;
        for bit in (lsb..=msb).rev() {
            let byte_idx = (127 - bit) / 8;
            let bit_in_byte = bit % 8;
            let b = (self.0[byte_idx as usize] >> bit_in_byte) & 1;
            value = (value << 1) | (b as u32);
        }
        value
    }
}

/// Card identification register.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Cid([u8; 16]);

impl Cid {
    pub fn new(raw: [u8; 16]) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn manufacturer_id(&self) -> u8 {
        self.0[0]
    }

    pub fn oem_id(&self) -> [u8; 2] {
        [self.0[1], self.0[2]]
    }

    pub fn product_name(&self) -> [u8; 5] {
        [self.0[3], self.0[4], self.0[5], self.0[6], self.0[7]]
    }

    /// (major, minor) from the BCD revision byte.
    pub fn product_revision(&self) -> (u8, u8) {
        (self.0[8] >> 4, self.0[8] & 0x0F)
    }

    pub fn serial_number(&self) -> u32 {
        u32::from_be_bytes([self.0[9], self.0[10], self.0[11], self.0[12]])
    }

    /// (year, month) of manufacture.
    pub fn manufacturing_date(&self) -> (u16, u8) {
        let year = ((self.0[13] & 0x0F) << 4) | (self.0[14] >> 4);
        (2000 + year as u16, self.0[14] & 0x0F)
    }
}

impl<SPI, CS, DELAY> SdCard<SPI, CS, DELAY>
where
    SPI: SdSpi,
    CS: OutputPin,
    DELAY: DelayNs,
{
    pub fn read_csd(&mut self) -> Result<Csd, SdCardError> {
        let result = self.read_csd_inner();
        self.settle("read_csd", result)
    }

    pub fn read_cid(&mut self) -> Result<Cid, SdCardError> {
        let result = self.read_register_inner(CMD10).map(Cid::new);
        self.settle("read_cid", result)
    }

    /// Capacity in 512-byte blocks.
    pub fn card_size(&mut self) -> Result<u32, SdCardError> {
        let result = self
            .read_csd_inner()
            .and_then(|csd| csd.card_size_blocks().ok_or(SdCardError::BadCsd));
        self.settle("card_size", result)
    }

    pub fn erase_single_block_enabled(&mut self) -> Result<bool, SdCardError> {
        let result = self.read_csd_inner().map(|csd| csd.erase_single_block());
        self.settle("read_csd", result)
    }
}
