use crate::block::BLOCK_SIZE;

use super::DIR_ENTRY_SIZE;

const BOOT_SIGNATURE: [u8; 2] = [0x55, 0xAA];
const MBR_TABLE_OFFSET: usize = 446;
const MBR_ENTRY_SIZE: usize = 16;
const MIN_PARTITION_SECTORS: u32 = 100;
const FAT12_MAX_CLUSTERS: u32 = 4085;
const FAT16_MAX_CLUSTERS: u32 = 65525;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FatWidth {
    Fat12,
    Fat16,
    Fat32,
}

impl FatWidth {
    pub fn from_cluster_count(clusters: u32) -> Self {
        if clusters < FAT12_MAX_CLUSTERS {
            Self::Fat12
        } else if clusters < FAT16_MAX_CLUSTERS {
            Self::Fat16
        } else {
            Self::Fat32
        }
    }

    /// Smallest entry value that terminates a chain.
    pub fn eoc_min(self) -> u32 {
        match self {
            Self::Fat12 => 0x0FF8,
            Self::Fat16 => 0xFFF8,
            Self::Fat32 => 0x0FFF_FFF8,
        }
    }

    /// Value written to mark the end of a chain.
    pub fn eoc_mark(self) -> u32 {
        self.entry_mask()
    }

    pub fn entry_mask(self) -> u32 {
        match self {
            Self::Fat12 => 0x0FFF,
            Self::Fat16 => 0xFFFF,
            Self::Fat32 => 0x0FFF_FFFF,
        }
    }
}

/// Layout of a mounted volume. Block numbers are absolute device blocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VolumeGeometry {
    pub width: FatWidth,
    pub partition_start: u32,
    pub blocks_per_cluster: u8,
    pub cluster_size_shift: u8,
    pub fat_start_block: u32,
    pub fat_count: u8,
    pub blocks_per_fat: u32,
    pub data_start_block: u32,
    /// First block of the fixed root directory (FAT12/16) or the root
    /// directory's first cluster (FAT32).
    pub root_dir_start: u32,
    pub root_dir_entries: u16,
    pub cluster_count: u32,
}

impl VolumeGeometry {
    pub fn cluster_size_bytes(&self) -> u32 {
        (BLOCK_SIZE as u32) << self.cluster_size_shift
    }

    pub fn cluster_start_block(&self, cluster: u32) -> u32 {
        self.data_start_block + ((cluster - 2) << self.cluster_size_shift)
    }

    /// Block index within its cluster of the byte at `position`.
    pub fn block_of_cluster(&self, position: u32) -> u32 {
        (position >> 9) & (self.blocks_per_cluster as u32 - 1)
    }

    pub fn block_number(&self, cluster: u32, position: u32) -> u32 {
        self.cluster_start_block(cluster) + self.block_of_cluster(position)
    }

    /// Highest valid cluster number.
    pub fn last_cluster(&self) -> u32 {
        self.cluster_count + 1
    }
}

/// Start of the first MBR entry that looks like a FAT partition.
pub(crate) fn first_fat_partition(sector0: &[u8; BLOCK_SIZE]) -> Option<u32> {
    if sector0[510..512] != BOOT_SIGNATURE {
        return None;
    }
    (0..4).find_map(|i| {
        let base = MBR_TABLE_OFFSET + i * MBR_ENTRY_SIZE;
        let part_type = sector0[base + 4];
        let is_fat = matches!(part_type, 0x01 | 0x04 | 0x06 | 0x0B | 0x0C | 0x0E);
        let start = read_u32(sector0, base + 8);
        let sectors = read_u32(sector0, base + 12);
        (is_fat && start != 0 && sectors >= MIN_PARTITION_SECTORS).then_some(start)
    })
}

/// Decodes the BIOS parameter block of the boot sector at `partition_start`.
pub(crate) fn parse_boot_sector(
    partition_start: u32,
    boot: &[u8; BLOCK_SIZE],
) -> Option<VolumeGeometry> {
    if boot[510..512] != BOOT_SIGNATURE {
        return None;
    }

    let bytes_per_sector = read_u16(boot, 11);
    if bytes_per_sector as usize != BLOCK_SIZE {
        log::debug!("fat: boot_reject bytes_per_sector={}", bytes_per_sector);
        return None;
    }

    let blocks_per_cluster = boot[13];
    if blocks_per_cluster == 0 || !blocks_per_cluster.is_power_of_two() {
        log::debug!("fat: boot_reject sectors_per_cluster={}", blocks_per_cluster);
        return None;
    }
    let cluster_size_shift = blocks_per_cluster.trailing_zeros() as u8;

    let reserved = read_u16(boot, 14) as u32;
    let fat_count = boot[16];
    if reserved == 0 || fat_count == 0 {
        return None;
    }

    let root_dir_entries = read_u16(boot, 17);
    let fat16_size = read_u16(boot, 22) as u32;
    let blocks_per_fat = if fat16_size != 0 {
        fat16_size
    } else {
        read_u32(boot, 36)
    };
    let total16 = read_u16(boot, 19) as u32;
    let total_blocks = if total16 != 0 {
        total16
    } else {
        read_u32(boot, 32)
    };
    if blocks_per_fat == 0 || total_blocks == 0 {
        return None;
    }

    let fat_start_block = partition_start.checked_add(reserved)?;
    let root_start = fat_start_block.checked_add(blocks_per_fat.checked_mul(fat_count as u32)?)?;
    let root_dir_blocks =
        (root_dir_entries as u32 * DIR_ENTRY_SIZE as u32).div_ceil(BLOCK_SIZE as u32);
    let data_start_block = root_start.checked_add(root_dir_blocks)?;

    let used = data_start_block - partition_start;
    if total_blocks <= used {
        return None;
    }
    let cluster_count = (total_blocks - used) >> cluster_size_shift;
    let width = FatWidth::from_cluster_count(cluster_count);

    let root_dir_start = match width {
        FatWidth::Fat32 => {
            let root_cluster = read_u32(boot, 44);
            if root_dir_entries != 0 || root_cluster < 2 || root_cluster > cluster_count + 1 {
                return None;
            }
            root_cluster
        }
        _ => {
            if root_dir_entries == 0 {
                return None;
            }
            root_start
        }
    };

    Some(VolumeGeometry {
        width,
        partition_start,
        blocks_per_cluster,
        cluster_size_shift,
        fat_start_block,
        fat_count,
        blocks_per_fat,
        data_start_block,
        root_dir_start,
        root_dir_entries,
        cluster_count,
    })
}

fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}
