use embassy_time::{Duration, Instant};
use embedded_hal::{delay::DelayNs, digital::OutputPin};

use super::{
    spi_error, BusyOp, CardState, OpenRead, SdCard, SdCardError, SdSpi, ACMD23, CMD0, CMD13,
    CMD17, CMD24, CMD25, CMD32, CMD33, CMD38, CMD55, CMD8, DATA_RES_ACCEPTED, DATA_RES_MASK,
    DATA_START_BLOCK, R1_READY_STATE, STOP_TRAN_TOKEN, WRITE_MULTIPLE_TOKEN,
};
use crate::block::BLOCK_SIZE;

const CMD0_CRC: u8 = 0x95;
const CMD8_CRC: u8 = 0x87;
const RESPONSE_POLLS: u16 = 0xFF;

impl<SPI, CS, DELAY> SdCard<SPI, CS, DELAY>
where
    SPI: SdSpi,
    CS: OutputPin,
    DELAY: DelayNs,
{
    pub fn read_block(
        &mut self,
        lba: u32,
        out: &mut [u8; BLOCK_SIZE],
    ) -> Result<(), SdCardError> {
        let result = self.read_block_inner(lba, out);
        self.settle("read", result)
    }

    /// Reads `out.len()` bytes at byte `offset` of block `lba`.
    ///
    /// Outside partial-block mode the block is closed again before
    /// returning. Inside it the block stays open until it is read to the
    /// end, [`read_end`](Self::read_end) is called, or another command is
    /// sent. A read at a lower offset or in another block reopens.
    pub fn read_data(
        &mut self,
        lba: u32,
        offset: usize,
        out: &mut [u8],
    ) -> Result<(), SdCardError> {
        let result = self.read_data_inner(lba, offset, out);
        self.settle("read_data", result)
    }

    /// Clocks out the rest of an open block and releases the card.
    pub fn read_end(&mut self) -> Result<(), SdCardError> {
        let result = self.read_end_inner();
        self.settle("read_end", result)
    }

    /// Reads a 16-byte register (CSD with CMD9, CID with CMD10).
    pub fn read_register(&mut self, cmd: u8) -> Result<[u8; 16], SdCardError> {
        let result = self.read_register_inner(cmd);
        self.settle("read_register", result)
    }

    /// Single-block write. With `blocking` the call returns only after the
    /// card finished programming and CMD13 reports a clean status.
    pub fn write_block(
        &mut self,
        lba: u32,
        data: &[u8; BLOCK_SIZE],
        blocking: bool,
    ) -> Result<(), SdCardError> {
        let result = self.write_block_inner(lba, data, blocking);
        self.settle("write", result)
    }

    /// Opens a multi-block write at `lba`, asking the card to pre-erase
    /// `erase_count` blocks.
    pub fn write_start(&mut self, lba: u32, erase_count: u32) -> Result<(), SdCardError> {
        let result = self.write_start_inner(lba, erase_count);
        self.settle("write_start", result)
    }

    pub fn write_data(&mut self, data: &[u8; BLOCK_SIZE]) -> Result<(), SdCardError> {
        let result = self.write_data_inner(data);
        self.settle("write_data", result)
    }

    pub fn write_stop(&mut self) -> Result<(), SdCardError> {
        let result = self.write_stop_inner();
        self.settle("write_stop", result)
    }

    /// Erases `first_block..=last_block`.
    pub fn erase(&mut self, first_block: u32, last_block: u32) -> Result<(), SdCardError> {
        let result = self.erase_inner(first_block, last_block);
        if result.is_ok() {
            log::debug!("sdcard: erase_ok first={} last={}", first_block, last_block);
        }
        self.settle("erase", result)
    }

    pub fn is_busy(&mut self) -> bool {
        if self.open_read.is_some() {
            return false;
        }
        if self.chip_select_low().is_err() {
            return true;
        }
        let busy = !matches!(self.transfer_byte(0xFF), Ok(0xFF));
        let _ = self.chip_select_high();
        busy
    }

    fn read_block_inner(
        &mut self,
        lba: u32,
        out: &mut [u8; BLOCK_SIZE],
    ) -> Result<(), SdCardError> {
        let card_type = self.ready_type()?;
        let r1 = self.card_command(CMD17, self.block_arg(card_type, lba))?;
        if r1 != R1_READY_STATE {
            return Err(SdCardError::Protocol {
                cmd: CMD17,
                status: r1,
            });
        }
        self.wait_start_block()?;
        self.receive(out)?;
        // Data CRC16 is ignored in SPI mode.
        self.send_dummy_clocks(2)?;
        self.end_transaction()?;
        log::trace!("sdcard: read lba={}", lba);
        Ok(())
    }

    fn read_data_inner(
        &mut self,
        lba: u32,
        offset: usize,
        out: &mut [u8],
    ) -> Result<(), SdCardError> {
        let card_type = self.ready_type()?;
        if offset + out.len() > BLOCK_SIZE {
            return Err(SdCardError::OutOfBlock);
        }
        if out.is_empty() {
            return Ok(());
        }

        let resumable = self
            .open_read
            .filter(|open| open.lba == lba && open.offset <= offset);
        let position = match resumable {
            Some(open) => open.offset,
            None => {
                self.read_end_inner()?;
                let r1 = self.card_command(CMD17, self.block_arg(card_type, lba))?;
                if r1 != R1_READY_STATE {
                    return Err(SdCardError::Protocol {
                        cmd: CMD17,
                        status: r1,
                    });
                }
                self.wait_start_block()?;
                self.state = CardState::Busy(BusyOp::BlockRead);
                0
            }
        };
        self.send_dummy_clocks(offset - position)?;
        self.receive(out)?;
        self.open_read = Some(OpenRead {
            lba,
            offset: offset + out.len(),
        });
        if !self.partial_block_read || offset + out.len() == BLOCK_SIZE {
            self.read_end_inner()?;
        }
        log::trace!(
            "sdcard: read_data lba={} offset={} len={}",
            lba,
            offset,
            out.len()
        );
        Ok(())
    }

    fn read_end_inner(&mut self) -> Result<(), SdCardError> {
        let Some(open) = self.open_read.take() else {
            return Ok(());
        };
        // Rest of the block, then the CRC16.
        self.send_dummy_clocks(BLOCK_SIZE - open.offset + 2)?;
        self.end_transaction()?;
        if matches!(self.state, CardState::Busy(BusyOp::BlockRead)) {
            self.state = CardState::Idle;
        }
        Ok(())
    }

    pub(super) fn read_register_inner(&mut self, cmd: u8) -> Result<[u8; 16], SdCardError> {
        self.ready_type()?;
        let r1 = self.card_command(cmd, 0)?;
        if r1 != R1_READY_STATE {
            return Err(SdCardError::Protocol { cmd, status: r1 });
        }
        self.wait_start_block()?;
        let mut register = [0u8; 16];
        self.receive(&mut register)?;
        self.send_dummy_clocks(2)?;
        self.end_transaction()?;
        Ok(register)
    }

    fn write_block_inner(
        &mut self,
        lba: u32,
        data: &[u8; BLOCK_SIZE],
        blocking: bool,
    ) -> Result<(), SdCardError> {
        let card_type = self.ready_type()?;
        self.guard_block_zero(lba)?;
        if self.write_session {
            return Err(SdCardError::WriteSessionActive);
        }
        let r1 = self.card_command(CMD24, self.block_arg(card_type, lba))?;
        if r1 != R1_READY_STATE {
            return Err(SdCardError::Protocol {
                cmd: CMD24,
                status: r1,
            });
        }
        self.write_data_token(DATA_START_BLOCK, data)?;

        if blocking {
            if !self.wait_not_busy(self.config.write_timeout_ms)? {
                return Err(SdCardError::WriteTimeout);
            }
            // R2 response: both bytes must be zero.
            let r1 = self.card_command(CMD13, 0)?;
            let r2 = self.transfer_byte(0xFF)?;
            if r1 != R1_READY_STATE || r2 != 0 {
                self.last_status = r1 | r2;
                return Err(SdCardError::WriteProgramming(r1 | r2));
            }
        } else {
            self.state = CardState::Busy(BusyOp::Programming);
        }
        self.end_transaction()?;
        log::trace!("sdcard: write lba={} blocking={}", lba, blocking);
        Ok(())
    }

    fn write_start_inner(&mut self, lba: u32, erase_count: u32) -> Result<(), SdCardError> {
        let card_type = self.ready_type()?;
        self.guard_block_zero(lba)?;
        if self.write_session {
            return Err(SdCardError::WriteSessionActive);
        }
        let r1 = self.card_acmd(ACMD23, erase_count)?;
        if r1 != R1_READY_STATE {
            return Err(SdCardError::Protocol {
                cmd: ACMD23,
                status: r1,
            });
        }
        let r1 = self.card_command(CMD25, self.block_arg(card_type, lba))?;
        if r1 != R1_READY_STATE {
            return Err(SdCardError::Protocol {
                cmd: CMD25,
                status: r1,
            });
        }
        self.write_session = true;
        self.state = CardState::Busy(BusyOp::MultiBlockWrite);
        log::debug!("sdcard: write_start lba={} erase_count={}", lba, erase_count);
        Ok(())
    }

    fn write_data_inner(&mut self, data: &[u8; BLOCK_SIZE]) -> Result<(), SdCardError> {
        if !self.write_session {
            return Err(SdCardError::NoWriteSession);
        }
        if !self.wait_not_busy(self.config.write_timeout_ms)? {
            return Err(SdCardError::WriteTimeout);
        }
        self.write_data_token(WRITE_MULTIPLE_TOKEN, data)
    }

    fn write_stop_inner(&mut self) -> Result<(), SdCardError> {
        if !self.write_session {
            return Err(SdCardError::NoWriteSession);
        }
        if !self.wait_not_busy(self.config.write_timeout_ms)? {
            return Err(SdCardError::StopTransmission);
        }
        self.transfer_byte(STOP_TRAN_TOKEN)?;
        if !self.wait_not_busy(self.config.write_timeout_ms)? {
            return Err(SdCardError::StopTransmission);
        }
        self.end_transaction()?;
        self.write_session = false;
        self.state = CardState::Idle;
        Ok(())
    }

    fn erase_inner(&mut self, first_block: u32, last_block: u32) -> Result<(), SdCardError> {
        let card_type = self.ready_type()?;
        if !self.read_csd_inner()?.erase_single_block() {
            return Err(SdCardError::EraseSingleBlockUnsupported);
        }
        let first = self.block_arg(card_type, first_block);
        let last = self.block_arg(card_type, last_block);
        for (cmd, arg) in [(CMD32, first), (CMD33, last), (CMD38, 0)] {
            let r1 = self.card_command(cmd, arg)?;
            if r1 != R1_READY_STATE {
                return Err(SdCardError::Protocol { cmd, status: r1 });
            }
        }
        if !self.wait_not_busy(self.config.erase_timeout_ms)? {
            return Err(SdCardError::EraseTimeout);
        }
        self.end_transaction()
    }

    pub(super) fn read_csd_inner(&mut self) -> Result<super::Csd, SdCardError> {
        self.read_register_inner(super::CMD9).map(super::Csd::new)
    }

    fn guard_block_zero(&self, lba: u32) -> Result<(), SdCardError> {
        if lba == 0 && !self.config.allow_block_zero_write {
            return Err(SdCardError::WriteBlockZero);
        }
        Ok(())
    }

    fn write_data_token(&mut self, token: u8, data: &[u8; BLOCK_SIZE]) -> Result<(), SdCardError> {
        self.transfer_byte(token)?;
        self.spi.write(data).map_err(spi_error)?;
        // Dummy CRC16.
        self.send_dummy_clocks(2)?;
        let status = self.transfer_byte(0xFF)?;
        self.last_status = status;
        if (status & DATA_RES_MASK) != DATA_RES_ACCEPTED {
            return Err(SdCardError::WriteRejected(status));
        }
        Ok(())
    }

    /// Sends a command frame and returns its R1. Chip select stays low so the
    /// caller can clock out the rest of the response.
    pub(super) fn card_command(&mut self, cmd: u8, arg: u32) -> Result<u8, SdCardError> {
        self.read_end_inner()?;
        self.chip_select_low()?;
        let _ = self.wait_not_busy(self.config.read_timeout_ms)?;
        if matches!(self.state, CardState::Busy(BusyOp::Programming)) {
            self.state = CardState::Idle;
        }

        let crc = match cmd {
            CMD0 => CMD0_CRC,
            CMD8 => CMD8_CRC,
            _ => 0xFF,
        };
        let arg = arg.to_be_bytes();
        let frame = [0x40 | cmd, arg[0], arg[1], arg[2], arg[3], crc];
        self.spi.write(&frame).map_err(spi_error)?;

        let mut r1 = 0xFF;
        for _ in 0..RESPONSE_POLLS {
            r1 = self.transfer_byte(0xFF)?;
            if (r1 & 0x80) == 0 {
                break;
            }
        }
        self.last_status = r1;
        Ok(r1)
    }

    pub(super) fn card_acmd(&mut self, cmd: u8, arg: u32) -> Result<u8, SdCardError> {
        self.card_command(CMD55, 0)?;
        self.card_command(cmd, arg)
    }

    fn wait_start_block(&mut self) -> Result<(), SdCardError> {
        let started = Instant::now();
        let timeout = Duration::from_millis(self.config.read_timeout_ms);
        loop {
            let token = self.transfer_byte(0xFF)?;
            if token != 0xFF {
                self.last_status = token;
                if token != DATA_START_BLOCK {
                    return Err(SdCardError::BadStartToken(token));
                }
                return Ok(());
            }
            if started.elapsed() > timeout {
                return Err(SdCardError::ReadTimeout);
            }
        }
    }

    /// Clocks until the card releases MISO (reads 0xFF). `Ok(false)` on timeout.
    fn wait_not_busy(&mut self, timeout_ms: u64) -> Result<bool, SdCardError> {
        let started = Instant::now();
        let timeout = Duration::from_millis(timeout_ms);
        loop {
            if self.transfer_byte(0xFF)? == 0xFF {
                return Ok(true);
            }
            if started.elapsed() >= timeout {
                return Ok(false);
            }
        }
    }

    pub(super) fn transfer_byte(&mut self, byte: u8) -> Result<u8, SdCardError> {
        let mut frame = [byte];
        self.spi.transfer_in_place(&mut frame).map_err(spi_error)?;
        Ok(frame[0])
    }

    /// Clocks out `out.len()` bytes with MOSI held high.
    pub(super) fn receive(&mut self, out: &mut [u8]) -> Result<(), SdCardError> {
        out.fill(0xFF);
        self.spi.transfer_in_place(out).map_err(spi_error)
    }

    pub(super) fn send_dummy_clocks(&mut self, bytes: usize) -> Result<(), SdCardError> {
        for _ in 0..bytes {
            self.transfer_byte(0xFF)?;
        }
        Ok(())
    }

    pub(super) fn chip_select_low(&mut self) -> Result<(), SdCardError> {
        self.cs.set_low().map_err(|_| SdCardError::ChipSelect)
    }

    pub(super) fn chip_select_high(&mut self) -> Result<(), SdCardError> {
        self.cs.set_high().map_err(|_| SdCardError::ChipSelect)
    }

    pub(super) fn end_transaction(&mut self) -> Result<(), SdCardError> {
        self.chip_select_high()?;
        self.transfer_byte(0xFF)?;
        Ok(())
    }
}
