use embassy_time::{Duration, Instant};
use embedded_hal::{delay::DelayNs, digital::OutputPin};

use super::{
    spi_error, CardState, CardType, SdCard, SdCardError, SdSpi, ACMD41, CMD0, CMD16, CMD58,
    CMD8, R1_IDLE_STATE, R1_ILLEGAL_COMMAND, R1_READY_STATE,
};
use crate::block::BLOCK_SIZE;

const CMD8_CHECK_PATTERN: u32 = 0x0000_01AA;
const ACMD41_HCS: u32 = 0x4000_0000;
const OCR_POWER_UP_AND_CCS: u8 = 0xC0;

impl<SPI, CS, DELAY> SdCard<SPI, CS, DELAY>
where
    SPI: SdSpi,
    CS: OutputPin,
    DELAY: DelayNs,
{
    /// Runs the SPI-mode identification handshake, then switches the bus to
    /// `clock_khz`.
    pub fn initialize(&mut self, clock_khz: u32) -> Result<CardType, SdCardError> {
        self.card_type = None;
        self.write_session = false;
        self.open_read = None;
        self.state = CardState::Uninitialized;

        let result = self.run_init_sequence(clock_khz);
        if let Ok(card_type) = result {
            self.card_type = Some(card_type);
            log::info!(
                "sdcard: init_ok type={:?} clock_khz={}",
                card_type,
                clock_khz
            );
        }
        self.settle("init", result)
    }

    fn run_init_sequence(&mut self, clock_khz: u32) -> Result<CardType, SdCardError> {
        let started = Instant::now();
        let timeout = Duration::from_millis(self.config.init_timeout_ms);

        self.spi
            .set_clock_khz(self.config.init_clock_khz)
            .map_err(spi_error)?;
        self.chip_select_high()?;
        // At least 74 clocks with CS high before the first command.
        self.send_dummy_clocks(10)?;
        self.chip_select_low()?;

        loop {
            let r1 = self.card_command(CMD0, 0)?;
            if r1 == R1_IDLE_STATE {
                break;
            }
            if started.elapsed() > timeout {
                return Err(SdCardError::InitTimeout {
                    cmd: CMD0,
                    status: r1,
                });
            }
        }
        self.state = CardState::Idle;

        let cmd8_r1 = self.card_command(CMD8, CMD8_CHECK_PATTERN)?;
        let version = if (cmd8_r1 & R1_ILLEGAL_COMMAND) != 0 {
            CardType::Sd1
        } else {
            let mut r7 = [0u8; 4];
            self.receive(&mut r7)?;
            self.last_status = r7[3];
            if r7[3] != 0xAA {
                return Err(SdCardError::Protocol {
                    cmd: CMD8,
                    status: r7[3],
                });
            }
            CardType::Sd2
        };
        log::debug!("sdcard: cmd8 r1={:#04x} version={:?}", cmd8_r1, version);

        let acmd41_arg = if version == CardType::Sd2 { ACMD41_HCS } else { 0 };
        loop {
            let r1 = self.card_acmd(ACMD41, acmd41_arg)?;
            if r1 == R1_READY_STATE {
                break;
            }
            if started.elapsed() > timeout {
                return Err(SdCardError::InitTimeout {
                    cmd: ACMD41,
                    status: r1,
                });
            }
            self.delay.delay_us(self.config.poll_interval_us);
        }

        let card_type = if version == CardType::Sd2 {
            let r1 = self.card_command(CMD58, 0)?;
            if r1 != R1_READY_STATE {
                return Err(SdCardError::Protocol {
                    cmd: CMD58,
                    status: r1,
                });
            }
            let mut ocr = [0u8; 4];
            self.receive(&mut ocr)?;
            log::debug!("sdcard: ocr={:02x?}", ocr);
            if (ocr[0] & OCR_POWER_UP_AND_CCS) == OCR_POWER_UP_AND_CCS {
                CardType::Sdhc
            } else {
                CardType::Sd2
            }
        } else {
            let r1 = self.card_command(CMD16, BLOCK_SIZE as u32)?;
            if r1 != R1_READY_STATE {
                return Err(SdCardError::Protocol {
                    cmd: CMD16,
                    status: r1,
                });
            }
            CardType::Sd1
        };

        self.end_transaction()?;
        self.spi.set_clock_khz(clock_khz).map_err(spi_error)?;
        Ok(card_type)
    }
}
