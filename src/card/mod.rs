//! SD/SDHC command/response protocol over SPI.
//!
//! One [`SdCard`] owns the bus, the chip-select line and a delay source. All
//! operations are blocking and bounded by the timeouts in [`SdCardConfig`];
//! nothing is retried here.

use core::fmt;

use embedded_hal::{delay::DelayNs, digital::OutputPin, spi::SpiBus};

use crate::block::{BlockDevice, BLOCK_SIZE};

mod init;
mod io;
mod registers;

pub use registers::{Cid, Csd};

pub(crate) const CMD0: u8 = 0x00;
pub(crate) const CMD8: u8 = 0x08;
pub(crate) const CMD9: u8 = 0x09;
pub(crate) const CMD10: u8 = 0x0A;
pub(crate) const CMD13: u8 = 0x0D;
pub(crate) const CMD16: u8 = 0x10;
pub(crate) const CMD17: u8 = 0x11;
pub(crate) const CMD24: u8 = 0x18;
pub(crate) const CMD25: u8 = 0x19;
pub(crate) const CMD32: u8 = 0x20;
pub(crate) const CMD33: u8 = 0x21;
pub(crate) const CMD38: u8 = 0x26;
pub(crate) const CMD55: u8 = 0x37;
pub(crate) const CMD58: u8 = 0x3A;
pub(crate) const ACMD23: u8 = 0x17;
pub(crate) const ACMD41: u8 = 0x29;

pub(crate) const R1_READY_STATE: u8 = 0x00;
pub(crate) const R1_IDLE_STATE: u8 = 0x01;
pub(crate) const R1_ILLEGAL_COMMAND: u8 = 0x04;
pub(crate) const WRITE_MULTIPLE_TOKEN: u8 = 0xFC;
pub(crate) const STOP_TRAN_TOKEN: u8 = 0xFD;
pub(crate) const DATA_START_BLOCK: u8 = 0xFE;
pub(crate) const DATA_RES_MASK: u8 = 0x1F;
pub(crate) const DATA_RES_ACCEPTED: u8 = 0x05;

pub const SD_INIT_TIMEOUT_MS: u64 = 2_000;
pub const SD_ERASE_TIMEOUT_MS: u64 = 10_000;
pub const SD_READ_TIMEOUT_MS: u64 = 300;
pub const SD_WRITE_TIMEOUT_MS: u64 = 600;
pub const SD_INIT_CLOCK_KHZ: u32 = 400;

/// SPI bus that can also be re-clocked between the slow identification phase
/// and the data phase.
pub trait SdSpi: SpiBus<u8> {
    fn set_clock_khz(&mut self, khz: u32) -> Result<(), Self::Error>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SdCardConfig {
    pub init_clock_khz: u32,
    pub init_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub erase_timeout_ms: u64,
    /// Pause between ACMD41 polls.
    pub poll_interval_us: u32,
    pub allow_block_zero_write: bool,
}

impl Default for SdCardConfig {
    fn default() -> Self {
        Self {
            init_clock_khz: SD_INIT_CLOCK_KHZ,
            init_timeout_ms: SD_INIT_TIMEOUT_MS,
            read_timeout_ms: SD_READ_TIMEOUT_MS,
            write_timeout_ms: SD_WRITE_TIMEOUT_MS,
            erase_timeout_ms: SD_ERASE_TIMEOUT_MS,
            poll_interval_us: 1_000,
            allow_block_zero_write: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CardType {
    Sd1,
    Sd2,
    Sdhc,
}

impl CardType {
    /// SDHC takes block numbers as command arguments, older cards take byte
    /// offsets.
    pub fn is_block_addressed(self) -> bool {
        matches!(self, Self::Sdhc)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BusyOp {
    Programming,
    MultiBlockWrite,
    /// A partial read holds a block open.
    BlockRead,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CardState {
    Uninitialized,
    Idle,
    Ready(CardType),
    Busy(BusyOp),
    Error(SdCardError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SdCardError {
    Spi(embedded_hal::spi::ErrorKind),
    ChipSelect,
    NotInitialized,
    /// CMD0 or ACMD41 did not report the expected state in time.
    InitTimeout { cmd: u8, status: u8 },
    /// The card answered `cmd` with an unexpected response byte.
    Protocol { cmd: u8, status: u8 },
    ReadTimeout,
    BadStartToken(u8),
    WriteRejected(u8),
    WriteTimeout,
    WriteProgramming(u8),
    WriteBlockZero,
    StopTransmission,
    WriteSessionActive,
    NoWriteSession,
    EraseSingleBlockUnsupported,
    EraseTimeout,
    BadCsd,
    /// A partial read reaches past the end of the block.
    OutOfBlock,
}

impl SdCardError {
    /// Diagnostic code of the Arduino SD library family, for tooling that
    /// already knows those numbers. Host-side faults report 0xFF.
    pub fn code(&self) -> u8 {
        match *self {
            Self::InitTimeout { cmd: CMD0, .. } => 0x01,
            Self::InitTimeout { .. } => 0x08,
            Self::Protocol { cmd, .. } => match cmd {
                CMD0 => 0x01,
                CMD8 => 0x02,
                CMD17 => 0x03,
                CMD24 => 0x04,
                CMD25 => 0x05,
                CMD58 => 0x06,
                ACMD23 => 0x07,
                ACMD41 => 0x08,
                CMD9 | CMD10 => 0x0E,
                CMD32 | CMD33 | CMD38 => 0x0A,
                _ => 0xFF,
            },
            Self::BadCsd => 0x09,
            Self::EraseSingleBlockUnsupported => 0x0B,
            Self::EraseTimeout => 0x0C,
            Self::BadStartToken(_) => 0x0D,
            Self::ReadTimeout => 0x0F,
            Self::StopTransmission => 0x10,
            Self::WriteRejected(_) => 0x11,
            Self::WriteBlockZero => 0x12,
            Self::NoWriteSession | Self::WriteSessionActive => 0x13,
            Self::WriteProgramming(_) => 0x14,
            Self::WriteTimeout => 0x15,
            Self::Spi(_) | Self::ChipSelect | Self::NotInitialized | Self::OutOfBlock => 0xFF,
        }
    }
}

impl fmt::Display for SdCardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spi(kind) => write!(f, "SPI bus error: {:?}", kind),
            Self::ChipSelect => write!(f, "chip select line error"),
            Self::NotInitialized => write!(f, "card not initialized"),
            Self::InitTimeout { cmd, status } => {
                write!(f, "init timeout on CMD{} (status {:#04x})", cmd, status)
            }
            Self::Protocol { cmd, status } => {
                write!(f, "unexpected response to CMD{}: {:#04x}", cmd, status)
            }
            Self::ReadTimeout => write!(f, "timeout waiting for data start token"),
            Self::BadStartToken(token) => write!(f, "bad data start token {:#04x}", token),
            Self::WriteRejected(status) => write!(f, "write data rejected ({:#04x})", status),
            Self::WriteTimeout => write!(f, "timeout waiting for write to finish"),
            Self::WriteProgramming(status) => {
                write!(f, "card reported programming error ({:#04x})", status)
            }
            Self::WriteBlockZero => write!(f, "write to block zero refused"),
            Self::StopTransmission => write!(f, "multi-block stop failed"),
            Self::WriteSessionActive => write!(f, "multi-block write already open"),
            Self::NoWriteSession => write!(f, "no multi-block write open"),
            Self::EraseSingleBlockUnsupported => write!(f, "card cannot erase single blocks"),
            Self::EraseTimeout => write!(f, "erase timeout"),
            Self::BadCsd => write!(f, "unknown CSD structure"),
            Self::OutOfBlock => write!(f, "read range outside the block"),
        }
    }
}

pub(crate) fn spi_error<E: embedded_hal::spi::Error>(err: E) -> SdCardError {
    SdCardError::Spi(err.kind())
}

/// Block left open by a partial read, and how far it has been clocked out.
#[derive(Clone, Copy, Debug)]
struct OpenRead {
    lba: u32,
    offset: usize,
}

pub struct SdCard<SPI, CS, DELAY> {
    spi: SPI,
    cs: CS,
    delay: DELAY,
    config: SdCardConfig,
    card_type: Option<CardType>,
    state: CardState,
    last_error: Option<SdCardError>,
    last_status: u8,
    write_session: bool,
    partial_block_read: bool,
    open_read: Option<OpenRead>,
}

impl<SPI, CS, DELAY> SdCard<SPI, CS, DELAY>
where
    SPI: SdSpi,
    CS: OutputPin,
    DELAY: DelayNs,
{
    /// Takes the bus without touching it. [`initialize`](Self::initialize)
    /// drives chip select high before anything else and reports a pin
    /// failure as [`SdCardError::ChipSelect`].
    pub fn new(spi: SPI, cs: CS, delay: DELAY, config: SdCardConfig) -> Self {
        Self {
            spi,
            cs,
            delay,
            config,
            card_type: None,
            state: CardState::Uninitialized,
            last_error: None,
            last_status: 0,
            write_session: false,
            partial_block_read: false,
            open_read: None,
        }
    }

    pub fn config(&self) -> &SdCardConfig {
        &self.config
    }

    /// In partial-block mode [`read_data`](Self::read_data) leaves its block
    /// open, so the next read further into the same block needs no new
    /// command. Switching the mode off closes an open block.
    pub fn set_partial_block_read(&mut self, enabled: bool) -> Result<(), SdCardError> {
        if !enabled && self.open_read.is_some() {
            self.read_end()?;
        }
        self.partial_block_read = enabled;
        Ok(())
    }

    pub fn card_type(&self) -> Option<CardType> {
        self.card_type
    }

    pub fn is_initialized(&self) -> bool {
        self.card_type.is_some()
    }

    pub fn state(&self) -> CardState {
        self.state
    }

    pub fn last_error(&self) -> Option<SdCardError> {
        self.last_error
    }

    /// Last R1 status or data token seen on the bus.
    pub fn last_status(&self) -> u8 {
        self.last_status
    }

    pub fn error_code(&self) -> u8 {
        self.last_error.map(|err| err.code()).unwrap_or(0)
    }

    /// Forget the card, e.g. after it was pulled.
    pub fn invalidate(&mut self) {
        self.card_type = None;
        self.write_session = false;
        self.open_read = None;
        self.state = CardState::Uninitialized;
    }

    pub fn release(self) -> (SPI, CS, DELAY) {
        (self.spi, self.cs, self.delay)
    }

    fn ready_type(&self) -> Result<CardType, SdCardError> {
        self.card_type.ok_or(SdCardError::NotInitialized)
    }

    fn block_arg(&self, card_type: CardType, lba: u32) -> u32 {
        if card_type.is_block_addressed() {
            lba
        } else {
            lba.saturating_mul(BLOCK_SIZE as u32)
        }
    }

    fn settle<T>(&mut self, op: &str, result: Result<T, SdCardError>) -> Result<T, SdCardError> {
        match result {
            Ok(value) => {
                self.last_error = None;
                if !matches!(self.state, CardState::Busy(_)) {
                    self.state = match self.card_type {
                        Some(card_type) => CardState::Ready(card_type),
                        None => CardState::Uninitialized,
                    };
                }
                Ok(value)
            }
            Err(err) => {
                let _ = self.end_transaction();
                self.write_session = false;
                self.open_read = None;
                self.last_error = Some(err);
                self.state = CardState::Error(err);
                log::warn!(
                    "sdcard: {}_error err={:?} code={:#04x} status={:#04x}",
                    op,
                    err,
                    err.code(),
                    self.last_status
                );
                Err(err)
            }
        }
    }
}

impl<SPI, CS, DELAY> BlockDevice for SdCard<SPI, CS, DELAY>
where
    SPI: SdSpi,
    CS: OutputPin,
    DELAY: DelayNs,
{
    type Error = SdCardError;

    fn read_block(&mut self, lba: u32, out: &mut [u8; BLOCK_SIZE]) -> Result<(), Self::Error> {
        SdCard::read_block(self, lba, out)
    }

    fn write_block(
        &mut self,
        lba: u32,
        data: &[u8; BLOCK_SIZE],
        blocking: bool,
    ) -> Result<(), Self::Error> {
        SdCard::write_block(self, lba, data, blocking)
    }

    fn is_busy(&mut self) -> bool {
        SdCard::is_busy(self)
    }

    fn read_partial(
        &mut self,
        lba: u32,
        offset: usize,
        out: &mut [u8],
    ) -> Result<(), Self::Error> {
        SdCard::read_data(self, lba, offset, out)
    }

    fn card_type(&self) -> Option<CardType> {
        self.card_type
    }
}
