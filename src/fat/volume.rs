use crate::{
    block::{BlockDevice, BLOCK_SIZE},
    card::CardType,
};

use super::{
    cache::{BlockCache, FatMirror},
    geometry::{first_fat_partition, parse_boot_sector, FatWidth, VolumeGeometry},
    FatError, FatTimestamp,
};

/// A mounted FAT volume: the block device, its one cache line and the
/// decoded layout.
pub struct Volume<D: BlockDevice> {
    device: D,
    cache: BlockCache,
    geometry: VolumeGeometry,
    alloc_cursor: u32,
    date_time: Option<fn() -> FatTimestamp>,
}

impl<D: BlockDevice> Volume<D> {
    /// Mounts the first FAT partition of `device`, or block 0 as a
    /// partitionless volume.
    pub fn init(mut device: D) -> Result<Self, FatError<D::Error>> {
        let mut cache = BlockCache::new();
        let sector0 = *cache.load(&mut device, 0, false).map_err(FatError::CacheIo)?;

        let mut geometry = None;
        let partition = first_fat_partition(&sector0);
        if let Some(start) = partition {
            let boot = cache
                .load(&mut device, start, false)
                .map_err(FatError::CacheIo)?;
            geometry = parse_boot_sector(start, boot);
            if geometry.is_none() {
                log::warn!("fat: partition_boot_invalid start={}", start);
            }
        }
        let geometry = match geometry.or_else(|| parse_boot_sector(0, &sector0)) {
            Some(geometry) => geometry,
            None if partition.is_some() => return Err(FatError::BadBootSector),
            None => return Err(FatError::NoValidPartition),
        };

        log::info!(
            "fat: mount_ok width={:?} clusters={} blocks_per_cluster={} partition_start={}",
            geometry.width,
            geometry.cluster_count,
            geometry.blocks_per_cluster,
            geometry.partition_start
        );

        Ok(Self {
            device,
            cache,
            geometry,
            alloc_cursor: 2,
            date_time: None,
        })
    }

    pub fn geometry(&self) -> &VolumeGeometry {
        &self.geometry
    }

    pub fn width(&self) -> FatWidth {
        self.geometry.width
    }

    pub fn device(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn card_type(&self) -> Option<CardType> {
        self.device.card_type()
    }

    /// True while the device is still programming a non-blocking write.
    pub fn is_busy(&mut self) -> bool {
        self.device.is_busy()
    }

    /// Next cluster the allocator will look at first.
    pub fn alloc_cursor(&self) -> u32 {
        self.alloc_cursor
    }

    /// Clock used to stamp directory entries. Without one, new entries get
    /// [`FatTimestamp::DEFAULT`] and `sync` leaves stamps alone.
    pub fn set_date_time_source(&mut self, source: Option<fn() -> FatTimestamp>) {
        self.date_time = source;
    }

    pub(crate) fn clock(&self) -> Option<FatTimestamp> {
        self.date_time.map(|now| now())
    }

    pub(crate) fn now(&self) -> FatTimestamp {
        self.clock().unwrap_or(FatTimestamp::DEFAULT)
    }

    /// Writes back the cache line. Must be called before the medium is
    /// removed.
    pub fn flush(&mut self) -> Result<(), FatError<D::Error>> {
        self.cache
            .flush(&mut self.device, true)
            .map_err(FatError::CacheIo)
    }

    /// Like [`flush`](Self::flush), but the last block write does not wait
    /// for the device to finish programming. Poll [`is_busy`](Self::is_busy)
    /// before the next access if stalling matters.
    pub fn flush_nonblocking(&mut self) -> Result<(), FatError<D::Error>> {
        self.cache
            .flush(&mut self.device, false)
            .map_err(FatError::CacheIo)
    }

    /// Flushes and returns the device.
    pub fn release(mut self) -> Result<D, FatError<D::Error>> {
        self.flush()?;
        Ok(self.device)
    }

    pub fn is_eoc(&self, value: u32) -> bool {
        value >= self.geometry.width.eoc_min()
    }

    /// Reads the FAT entry of `cluster`.
    pub fn fat_get(&mut self, cluster: u32) -> Result<u32, FatError<D::Error>> {
        if cluster > self.geometry.last_cluster() {
            return Err(FatError::BadCluster(cluster));
        }
        let fat_start = self.geometry.fat_start_block;
        match self.geometry.width {
            FatWidth::Fat12 => {
                let offset = cluster + cluster / 2;
                let lba = fat_start + offset / BLOCK_SIZE as u32;
                let index = offset as usize % BLOCK_SIZE;
                let block = self.cache_read(lba)?;
                let lo = block[index];
                let hi = block.get(index + 1).copied();
                // Entry straddles two FAT blocks.
                let hi = match hi {
                    Some(hi) => hi,
                    None => self.cache_read(lba + 1)?[0],
                };
                let packed = u16::from_le_bytes([lo, hi]) as u32;
                Ok(if cluster & 1 == 1 {
                    packed >> 4
                } else {
                    packed & 0x0FFF
                })
            }
            FatWidth::Fat16 => {
                let offset = cluster * 2;
                let lba = fat_start + offset / BLOCK_SIZE as u32;
                let index = offset as usize % BLOCK_SIZE;
                let block = self.cache_read(lba)?;
                Ok(u16::from_le_bytes([block[index], block[index + 1]]) as u32)
            }
            FatWidth::Fat32 => {
                let offset = cluster * 4;
                let lba = fat_start + offset / BLOCK_SIZE as u32;
                let index = offset as usize % BLOCK_SIZE;
                let block = self.cache_read(lba)?;
                let raw = u32::from_le_bytes([
                    block[index],
                    block[index + 1],
                    block[index + 2],
                    block[index + 3],
                ]);
                Ok(raw & 0x0FFF_FFFF)
            }
        }
    }

    /// Writes the FAT entry of `cluster`. The block is written to every FAT
    /// copy when it leaves the cache.
    pub fn fat_put(&mut self, cluster: u32, value: u32) -> Result<(), FatError<D::Error>> {
        // Entries 0 and 1 are reserved.
        if cluster < 2 || cluster > self.geometry.last_cluster() {
            return Err(FatError::BadCluster(cluster));
        }
        let fat_start = self.geometry.fat_start_block;
        match self.geometry.width {
            FatWidth::Fat12 => {
                let offset = cluster + cluster / 2;
                let lba = fat_start + offset / BLOCK_SIZE as u32;
                let index = offset as usize % BLOCK_SIZE;
                let odd = cluster & 1 == 1;
                let value = if odd {
                    (value & 0x0FFF) << 4
                } else {
                    value & 0x0FFF
                };

                let block = self.fat_block_for_write(lba)?;
                block[index] = if odd {
                    (block[index] & 0x0F) | (value as u8 & 0xF0)
                } else {
                    value as u8
                };
                let (lba, index) = if index == BLOCK_SIZE - 1 {
                    (lba + 1, 0)
                } else {
                    (lba, index + 1)
                };
                let block = self.fat_block_for_write(lba)?;
                block[index] = if odd {
                    (value >> 8) as u8
                } else {
                    (block[index] & 0xF0) | ((value >> 8) as u8 & 0x0F)
                };
            }
            FatWidth::Fat16 => {
                let offset = cluster * 2;
                let lba = fat_start + offset / BLOCK_SIZE as u32;
                let index = offset as usize % BLOCK_SIZE;
                let block = self.fat_block_for_write(lba)?;
                block[index..index + 2].copy_from_slice(&(value as u16).to_le_bytes());
            }
            FatWidth::Fat32 => {
                let offset = cluster * 4;
                let lba = fat_start + offset / BLOCK_SIZE as u32;
                let index = offset as usize % BLOCK_SIZE;
                let block = self.fat_block_for_write(lba)?;
                let old = u32::from_le_bytes([
                    block[index],
                    block[index + 1],
                    block[index + 2],
                    block[index + 3],
                ]);
                let new = (old & 0xF000_0000) | (value & 0x0FFF_FFFF);
                block[index..index + 4].copy_from_slice(&new.to_le_bytes());
            }
        }
        Ok(())
    }

    pub fn fat_put_eoc(&mut self, cluster: u32) -> Result<(), FatError<D::Error>> {
        self.fat_put(cluster, self.geometry.width.eoc_mark())
    }

    /// Allocates `count` free clusters in one contiguous run and chains them.
    ///
    /// With `extend_from` the search starts right after that cluster and the
    /// run is linked from it; otherwise it starts at the allocation cursor,
    /// which then moves past the run. The search wraps to cluster 2 once.
    ///
    /// `extend_from` must be the last cluster of its chain, or the call
    /// fails with `BadCluster` and the FAT is left untouched.
    pub fn alloc_contiguous(
        &mut self,
        count: u32,
        extend_from: Option<u32>,
    ) -> Result<u32, FatError<D::Error>> {
        if count == 0 {
            return Err(FatError::InvalidArgument);
        }
        if let Some(prev) = extend_from {
            let next = self.fat_get(prev)?;
            if !self.is_eoc(next) {
                log::warn!(
                    "fat: alloc_failed prev={} next={} reason=not_chain_end",
                    prev,
                    next
                );
                return Err(FatError::BadCluster(prev));
            }
        }
        let fat_end = self.geometry.last_cluster();
        let mut begin = match extend_from {
            Some(cluster) => cluster + 1,
            None => self.alloc_cursor,
        };
        if begin < 2 {
            begin = 2;
        }
        let mut end = begin;
        let mut scanned = 0u32;
        loop {
            if scanned >= self.geometry.cluster_count {
                log::warn!("fat: alloc_failed count={} reason=disk_full", count);
                return Err(FatError::DiskFull);
            }
            if end > fat_end {
                begin = 2;
                end = 2;
            }
            if self.fat_get(end)? != 0 {
                begin = end + 1;
            } else if end - begin + 1 == count {
                break;
            }
            scanned += 1;
            end += 1;
        }

        self.fat_put_eoc(end)?;
        for cluster in (begin..end).rev() {
            self.fat_put(cluster, cluster + 1)?;
        }
        match extend_from {
            Some(prev) => self.fat_put(prev, begin)?,
            None => self.alloc_cursor = end + 1,
        }
        log::debug!("fat: alloc first={} count={}", begin, count);
        Ok(begin)
    }

    /// Releases every cluster of the chain starting at `first`.
    pub fn free_chain(&mut self, first: u32) -> Result<(), FatError<D::Error>> {
        let mut cluster = first;
        let mut visited = 0u32;
        loop {
            if cluster < 2 || visited > self.geometry.cluster_count {
                return Err(FatError::BadCluster(cluster));
            }
            visited += 1;
            let next = self.fat_get(cluster)?;
            self.fat_put(cluster, 0)?;
            if cluster < self.alloc_cursor {
                self.alloc_cursor = cluster;
            }
            if self.is_eoc(next) || next < 2 {
                break;
            }
            cluster = next;
        }
        log::debug!("fat: free_chain first={} clusters={}", first, visited);
        Ok(())
    }

    /// Size in bytes of the chain starting at `first`.
    pub fn chain_size(&mut self, first: u32) -> Result<u32, FatError<D::Error>> {
        let cluster_bytes = self.geometry.cluster_size_bytes();
        let mut cluster = first;
        let mut size = 0u32;
        loop {
            if cluster < 2 || size / cluster_bytes > self.geometry.cluster_count {
                return Err(FatError::BadCluster(cluster));
            }
            size = size.saturating_add(cluster_bytes);
            cluster = self.fat_get(cluster)?;
            if self.is_eoc(cluster) {
                return Ok(size);
            }
        }
    }

    pub fn block_number(&self, cluster: u32, position: u32) -> u32 {
        self.geometry.block_number(cluster, position)
    }

    pub(crate) fn cache_read(
        &mut self,
        lba: u32,
    ) -> Result<&[u8; BLOCK_SIZE], FatError<D::Error>> {
        match self.cache.load(&mut self.device, lba, false) {
            Ok(block) => Ok(block),
            Err(err) => Err(FatError::CacheIo(err)),
        }
    }

    pub(crate) fn cache_write(
        &mut self,
        lba: u32,
    ) -> Result<&mut [u8; BLOCK_SIZE], FatError<D::Error>> {
        self.cache
            .load(&mut self.device, lba, true)
            .map_err(FatError::CacheIo)
    }

    /// Zero-filled dirty cache line for `lba`; the old contents are not read.
    pub(crate) fn cache_claim(
        &mut self,
        lba: u32,
    ) -> Result<&mut [u8; BLOCK_SIZE], FatError<D::Error>> {
        self.cache
            .claim(&mut self.device, lba)
            .map_err(FatError::CacheIo)
    }

    /// Reads a whole block past the cache, using the cached copy if `lba`
    /// is resident.
    pub(crate) fn read_direct(
        &mut self,
        lba: u32,
        out: &mut [u8; BLOCK_SIZE],
    ) -> Result<(), FatError<D::Error>> {
        if let Some(block) = self.cache.peek(lba) {
            out.copy_from_slice(block);
            return Ok(());
        }
        self.device.read_block(lba, out).map_err(FatError::CacheIo)
    }

    /// Reads part of a block past the cache, using the cached copy if `lba`
    /// is resident.
    pub(crate) fn read_partial(
        &mut self,
        lba: u32,
        offset: usize,
        out: &mut [u8],
    ) -> Result<(), FatError<D::Error>> {
        if let Some(block) = self.cache.peek(lba) {
            out.copy_from_slice(&block[offset..offset + out.len()]);
            return Ok(());
        }
        self.device
            .read_partial(lba, offset, out)
            .map_err(FatError::CacheIo)
    }

    /// Writes a whole block past the cache and drops a stale cached copy.
    pub(crate) fn write_direct(
        &mut self,
        lba: u32,
        data: &[u8; BLOCK_SIZE],
    ) -> Result<(), FatError<D::Error>> {
        self.cache.invalidate(lba);
        self.device
            .write_block(lba, data, true)
            .map_err(FatError::CacheIo)
    }

    fn fat_block_for_write(
        &mut self,
        lba: u32,
    ) -> Result<&mut [u8; BLOCK_SIZE], FatError<D::Error>> {
        let mirror = FatMirror {
            stride: self.geometry.blocks_per_fat,
            copies: self.geometry.fat_count,
        };
        self.cache
            .load_fat(&mut self.device, lba, mirror)
            .map_err(FatError::CacheIo)
    }
}
