#![allow(dead_code)]

use std::{cell::RefCell, collections::BTreeMap, collections::VecDeque, convert::Infallible, rc::Rc};

use embedded_hal::{
    delay::DelayNs,
    digital::{ErrorType as PinErrorType, OutputPin},
    spi::{ErrorType as SpiErrorType, SpiBus},
};
use sdfat::{BlockDevice, SdSpi, BLOCK_SIZE};

pub type Block = [u8; BLOCK_SIZE];

/// Sparse in-memory block device. Unwritten blocks read as zeros.
#[derive(Default, Clone)]
pub struct RamDisk {
    pub blocks: BTreeMap<u32, Block>,
    pub writes: Vec<u32>,
}

impl RamDisk {
    pub fn block(&self, lba: u32) -> Block {
        self.blocks.get(&lba).copied().unwrap_or([0; BLOCK_SIZE])
    }

    pub fn put(&mut self, lba: u32, data: Block) {
        self.blocks.insert(lba, data);
    }
}

impl BlockDevice for RamDisk {
    type Error = Infallible;

    fn read_block(&mut self, lba: u32, out: &mut Block) -> Result<(), Infallible> {
        *out = self.block(lba);
        Ok(())
    }

    fn write_block(&mut self, lba: u32, data: &Block, _blocking: bool) -> Result<(), Infallible> {
        self.writes.push(lba);
        self.put(lba, *data);
        Ok(())
    }

    fn is_busy(&mut self) -> bool {
        false
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Width {
    Fat12,
    Fat16,
    Fat32,
}

/// Shape of a freshly formatted volume. Two FAT copies, 512-byte sectors.
#[derive(Clone, Copy, Debug)]
pub struct Layout {
    pub width: Width,
    pub total_blocks: u32,
    pub blocks_per_cluster: u8,
    pub reserved: u16,
    pub fat_blocks: u32,
    pub root_entries: u16,
}

impl Layout {
    pub fn fat_start(&self, partition_start: u32) -> u32 {
        partition_start + self.reserved as u32
    }

    pub fn data_start(&self, partition_start: u32) -> u32 {
        let root_blocks = (self.root_entries as u32 * 32).div_ceil(BLOCK_SIZE as u32);
        self.fat_start(partition_start) + 2 * self.fat_blocks + root_blocks
    }

    pub fn cluster_count(&self) -> u32 {
        (self.total_blocks - self.data_start(0)) / self.blocks_per_cluster as u32
    }
}

/// 2003 one-block clusters.
pub const FAT12: Layout = Layout {
    width: Width::Fat12,
    total_blocks: 2048,
    blocks_per_cluster: 1,
    reserved: 1,
    fat_blocks: 6,
    root_entries: 512,
};

/// 8095 one-block clusters.
pub const FAT16: Layout = Layout {
    width: Width::Fat16,
    total_blocks: 8192,
    blocks_per_cluster: 1,
    reserved: 1,
    fat_blocks: 32,
    root_entries: 512,
};

/// 4200 two-block clusters.
pub const FAT16_1K: Layout = Layout {
    width: Width::Fat16,
    total_blocks: 8467,
    blocks_per_cluster: 2,
    reserved: 1,
    fat_blocks: 17,
    root_entries: 512,
};

/// 70000 one-block clusters, root directory in cluster 2.
pub const FAT32: Layout = Layout {
    width: Width::Fat32,
    total_blocks: 71_126,
    blocks_per_cluster: 1,
    reserved: 32,
    fat_blocks: 547,
    root_entries: 0,
};

pub fn boot_sector(layout: &Layout) -> Block {
    let mut boot = [0u8; BLOCK_SIZE];
    boot[0..3].copy_from_slice(&[0xEB, 0x3C, 0x90]);
    boot[3..11].copy_from_slice(b"SDFATTST");
    boot[11..13].copy_from_slice(&512u16.to_le_bytes());
    boot[13] = layout.blocks_per_cluster;
    boot[14..16].copy_from_slice(&layout.reserved.to_le_bytes());
    boot[16] = 2;
    boot[17..19].copy_from_slice(&layout.root_entries.to_le_bytes());
    boot[21] = 0xF8;
    match layout.width {
        Width::Fat32 => {
            boot[32..36].copy_from_slice(&layout.total_blocks.to_le_bytes());
            boot[36..40].copy_from_slice(&layout.fat_blocks.to_le_bytes());
            boot[44..48].copy_from_slice(&2u32.to_le_bytes());
        }
        Width::Fat12 | Width::Fat16 => {
            boot[19..21].copy_from_slice(&(layout.total_blocks as u16).to_le_bytes());
            boot[22..24].copy_from_slice(&(layout.fat_blocks as u16).to_le_bytes());
        }
    }
    boot[510] = 0x55;
    boot[511] = 0xAA;
    boot
}

fn write_volume(disk: &mut RamDisk, layout: &Layout, start: u32) {
    disk.put(start, boot_sector(layout));
    let head: &[u8] = match layout.width {
        Width::Fat12 => &[0xF8, 0xFF, 0xFF],
        Width::Fat16 => &[0xF8, 0xFF, 0xFF, 0xFF],
        Width::Fat32 => &[
            0xF8, 0xFF, 0xFF, 0x0F, 0xFF, 0xFF, 0xFF, 0x0F, 0xFF, 0xFF, 0xFF, 0x0F,
        ],
    };
    let mut fat = [0u8; BLOCK_SIZE];
    fat[..head.len()].copy_from_slice(head);
    disk.put(layout.fat_start(start), fat);
    disk.put(layout.fat_start(start) + layout.fat_blocks, fat);
}

/// Volume without a partition table.
pub fn format(layout: &Layout) -> RamDisk {
    let mut disk = RamDisk::default();
    write_volume(&mut disk, layout, 0);
    disk
}

/// MBR with a single partition of `part_type` starting at `start`.
pub fn format_partitioned(layout: &Layout, start: u32, part_type: u8) -> RamDisk {
    let mut disk = RamDisk::default();
    let mut mbr = [0u8; BLOCK_SIZE];
    let entry = 446;
    mbr[entry] = 0x00;
    mbr[entry + 4] = part_type;
    mbr[entry + 8..entry + 12].copy_from_slice(&start.to_le_bytes());
    mbr[entry + 12..entry + 16].copy_from_slice(&layout.total_blocks.to_le_bytes());
    mbr[510] = 0x55;
    mbr[511] = 0xAA;
    disk.put(0, mbr);
    write_volume(&mut disk, layout, start);
    disk
}

/// Deterministic test payload.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u32).wrapping_mul(31).wrapping_add(seed as u32) as u8)
        .collect()
}

// ---------------------------------------------------------------------------
// SD card simulator

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SimKind {
    V1,
    V2Standard,
    V2Sdhc,
}

#[derive(Debug, PartialEq, Eq)]
enum Receive {
    Command,
    /// Waiting for the 0xFE token of a single-block write.
    SingleToken { lba: u32 },
    /// Inside CMD25; waiting for 0xFC or 0xFD.
    MultiToken { lba: u32 },
    Data { lba: u32, multi: bool, buf: Vec<u8> },
}

pub struct SimState {
    pub kind: SimKind,
    pub blocks: BTreeMap<u32, Block>,
    pub csd: [u8; 16],
    pub cid: [u8; 16],
    /// Every command received as (index, argument).
    pub commands: Vec<(u8, u32)>,
    pub clock_khz: Vec<u32>,
    /// ACMD41 polls answered "idle" before the card reports ready.
    pub acmd41_idle_polls: u32,
    pub ignore_cmd0: bool,
    /// Busy bytes clocked out after a write or erase.
    pub busy_after_write: u32,
    pub pre_erase: Option<u32>,
    /// Token sent before read data. 0xFF sends no token and no data.
    pub start_token: u8,
    /// Data response token after a written block.
    pub data_response: u8,
    /// R2 bytes answered to CMD13.
    pub cmd13_status: [u8; 2],
    /// Replaces the check pattern echoed in the CMD8 response.
    pub cmd8_echo: Option<u8>,
    cs_low: bool,
    app_cmd: bool,
    frame: Vec<u8>,
    out: VecDeque<u8>,
    busy: u32,
    mode: Receive,
    erase_first: u32,
    erase_last: u32,
}

impl SimState {
    fn new(kind: SimKind) -> Self {
        Self {
            kind,
            blocks: BTreeMap::new(),
            csd: csd_v2(0x3FFF, true),
            cid: [0; 16],
            commands: Vec::new(),
            clock_khz: Vec::new(),
            acmd41_idle_polls: 2,
            ignore_cmd0: false,
            busy_after_write: 4,
            pre_erase: None,
            start_token: 0xFE,
            data_response: 0xE5,
            cmd13_status: [0x00, 0x00],
            cmd8_echo: None,
            cs_low: false,
            app_cmd: false,
            frame: Vec::new(),
            out: VecDeque::new(),
            busy: 0,
            mode: Receive::Command,
            erase_first: 0,
            erase_last: 0,
        }
    }

    pub fn block(&self, lba: u32) -> Block {
        self.blocks.get(&lba).copied().unwrap_or([0; BLOCK_SIZE])
    }

    pub fn is_busy(&self) -> bool {
        self.busy > 0
    }

    fn to_lba(&self, arg: u32) -> u32 {
        match self.kind {
            SimKind::V2Sdhc => arg,
            _ => arg / BLOCK_SIZE as u32,
        }
    }

    fn exchange(&mut self, input: u8) -> u8 {
        if !self.cs_low {
            return 0xFF;
        }
        let output = if let Some(byte) = self.out.pop_front() {
            byte
        } else if self.busy > 0 {
            self.busy -= 1;
            0x00
        } else {
            0xFF
        };
        self.accept(input);
        output
    }

    fn accept(&mut self, input: u8) {
        match std::mem::replace(&mut self.mode, Receive::Command) {
            Receive::Command => {
                if !self.frame.is_empty() || (input & 0xC0) == 0x40 {
                    self.frame.push(input);
                    if self.frame.len() == 6 {
                        let frame = std::mem::take(&mut self.frame);
                        self.command(
                            frame[0] & 0x3F,
                            u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]),
                        );
                    }
                }
            }
            Receive::SingleToken { lba } => {
                self.mode = if input == 0xFE {
                    Receive::Data {
                        lba,
                        multi: false,
                        buf: Vec::new(),
                    }
                } else {
                    Receive::SingleToken { lba }
                };
            }
            Receive::MultiToken { lba } => {
                self.mode = match input {
                    0xFC => Receive::Data {
                        lba,
                        multi: true,
                        buf: Vec::new(),
                    },
                    0xFD => {
                        self.busy = self.busy_after_write;
                        Receive::Command
                    }
                    _ => Receive::MultiToken { lba },
                };
            }
            Receive::Data {
                lba,
                multi,
                mut buf,
            } => {
                buf.push(input);
                if buf.len() < BLOCK_SIZE + 2 {
                    self.mode = Receive::Data { lba, multi, buf };
                    return;
                }
                let mut block = [0u8; BLOCK_SIZE];
                block.copy_from_slice(&buf[..BLOCK_SIZE]);
                self.blocks.insert(lba, block);
                self.out.push_back(self.data_response);
                self.busy = self.busy_after_write;
                if multi {
                    self.mode = Receive::MultiToken { lba: lba + 1 };
                }
            }
        }
    }

    fn respond(&mut self, bytes: &[u8]) {
        self.out.push_back(0xFF);
        self.out.extend(bytes.iter().copied());
    }

    fn respond_data(&mut self, data: &[u8]) {
        if self.start_token == 0xFF {
            self.respond(&[0x00]);
            return;
        }
        self.respond(&[0x00, 0xFF, self.start_token]);
        self.out.extend(data.iter().copied());
        self.out.extend([0xFF, 0xFF]);
    }

    fn command(&mut self, cmd: u8, arg: u32) {
        self.commands.push((cmd, arg));
        let app = std::mem::replace(&mut self.app_cmd, false);
        match (app, cmd) {
            (_, 0) => {
                if !self.ignore_cmd0 {
                    self.respond(&[0x01]);
                }
            }
            (_, 8) => match self.kind {
                SimKind::V1 => self.respond(&[0x05]),
                _ => {
                    let check = self.cmd8_echo.unwrap_or((arg & 0xFF) as u8);
                    self.respond(&[0x01, 0x00, 0x00, 0x01, check]);
                }
            },
            (_, 55) => {
                self.app_cmd = true;
                let r1 = if self.acmd41_idle_polls > 0 { 0x01 } else { 0x00 };
                self.respond(&[r1]);
            }
            (true, 41) => {
                if self.acmd41_idle_polls > 0 {
                    self.acmd41_idle_polls -= 1;
                    self.respond(&[0x01]);
                } else {
                    self.respond(&[0x00]);
                }
            }
            (true, 23) => {
                self.pre_erase = Some(arg);
                self.respond(&[0x00]);
            }
            (_, 58) => {
                let ccs = if self.kind == SimKind::V2Sdhc { 0x40 } else { 0x00 };
                self.respond(&[0x00, 0x80 | ccs, 0xFF, 0x80, 0x00]);
            }
            (_, 16) => self.respond(&[0x00]),
            (_, 9) => {
                let csd = self.csd;
                self.respond_data(&csd);
            }
            (_, 10) => {
                let cid = self.cid;
                self.respond_data(&cid);
            }
            (_, 13) => {
                let status = self.cmd13_status;
                self.respond(&status);
            }
            (_, 17) => {
                let block = self.block(self.to_lba(arg));
                self.respond_data(&block);
            }
            (_, 24) => {
                self.mode = Receive::SingleToken {
                    lba: self.to_lba(arg),
                };
                self.respond(&[0x00]);
            }
            (_, 25) => {
                self.mode = Receive::MultiToken {
                    lba: self.to_lba(arg),
                };
                self.respond(&[0x00]);
            }
            (_, 32) => {
                self.erase_first = self.to_lba(arg);
                self.respond(&[0x00]);
            }
            (_, 33) => {
                self.erase_last = self.to_lba(arg);
                self.respond(&[0x00]);
            }
            (_, 38) => {
                for lba in self.erase_first..=self.erase_last {
                    self.blocks.remove(&lba);
                }
                self.busy = self.busy_after_write;
                self.respond(&[0x00]);
            }
            _ => self.respond(&[0x04]),
        }
    }
}

pub type Sim = Rc<RefCell<SimState>>;

pub fn sim(kind: SimKind) -> Sim {
    Rc::new(RefCell::new(SimState::new(kind)))
}

pub struct SimSpi(pub Sim);

impl SpiErrorType for SimSpi {
    type Error = Infallible;
}

impl SpiBus<u8> for SimSpi {
    fn read(&mut self, words: &mut [u8]) -> Result<(), Infallible> {
        let mut state = self.0.borrow_mut();
        for word in words {
            *word = state.exchange(0xFF);
        }
        Ok(())
    }

    fn write(&mut self, words: &[u8]) -> Result<(), Infallible> {
        let mut state = self.0.borrow_mut();
        for &word in words {
            state.exchange(word);
        }
        Ok(())
    }

    fn transfer(&mut self, read: &mut [u8], write: &[u8]) -> Result<(), Infallible> {
        let mut state = self.0.borrow_mut();
        for i in 0..read.len().max(write.len()) {
            let out = state.exchange(write.get(i).copied().unwrap_or(0xFF));
            if let Some(slot) = read.get_mut(i) {
                *slot = out;
            }
        }
        Ok(())
    }

    fn transfer_in_place(&mut self, words: &mut [u8]) -> Result<(), Infallible> {
        let mut state = self.0.borrow_mut();
        for word in words {
            *word = state.exchange(*word);
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Infallible> {
        Ok(())
    }
}

impl SdSpi for SimSpi {
    fn set_clock_khz(&mut self, khz: u32) -> Result<(), Infallible> {
        self.0.borrow_mut().clock_khz.push(khz);
        Ok(())
    }
}

pub struct SimCs(pub Sim);

impl PinErrorType for SimCs {
    type Error = Infallible;
}

impl OutputPin for SimCs {
    fn set_low(&mut self) -> Result<(), Infallible> {
        self.0.borrow_mut().cs_low = true;
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Infallible> {
        let mut state = self.0.borrow_mut();
        state.cs_low = false;
        state.out.clear();
        state.frame.clear();
        state.mode = Receive::Command;
        Ok(())
    }
}

pub struct NoDelay;

impl DelayNs for NoDelay {
    fn delay_ns(&mut self, _ns: u32) {}
}

/// CSD version 2 with the given C_SIZE.
pub fn csd_v2(c_size: u32, erase_single_block: bool) -> [u8; 16] {
    let mut csd = [0u8; 16];
    csd[0] = 0x40;
    csd[7] = ((c_size >> 16) & 0x3F) as u8;
    csd[8] = (c_size >> 8) as u8;
    csd[9] = c_size as u8;
    if erase_single_block {
        csd[10] = 0x40;
    }
    csd
}
