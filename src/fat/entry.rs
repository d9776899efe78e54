use bitflags::bitflags;
use heapless::String;

pub const DIR_ENTRY_SIZE: usize = 32;
pub const DIR_NAME_FREE: u8 = 0x00;
pub const DIR_NAME_DELETED: u8 = 0xE5;

const ILLEGAL_NAME_CHARS: &[u8] = b"|<>^+=?/[];,*\"\\";

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct Attributes: u8 {
        const READ_ONLY = 0x01;
        const HIDDEN = 0x02;
        const SYSTEM = 0x04;
        const VOLUME_ID = 0x08;
        const DIRECTORY = 0x10;
        const ARCHIVE = 0x20;
    }
}

impl Attributes {
    pub const LONG_NAME: Self = Self::from_bits_retain(0x0F);
}

bitflags! {
    /// Which stamps [`FileHandle::timestamp`](super::FileHandle::timestamp) sets.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct TimestampKind: u8 {
        const ACCESS = 0x01;
        const CREATE = 0x02;
        const WRITE = 0x04;
    }
}

/// Packed FAT date and time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FatTimestamp {
    pub date: u16,
    pub time: u16,
}

impl FatTimestamp {
    /// 2000-01-01 01:00:00, used when no clock is configured.
    pub const DEFAULT: Self = Self {
        date: ((2000 - 1980) << 9) | (1 << 5) | 1,
        time: 1 << 11,
    };

    /// `None` unless the fields fit the FAT encoding (years 1980-2107).
    pub fn new(year: u16, month: u8, day: u8, hour: u8, minute: u8, second: u8) -> Option<Self> {
        if !(1980..=2107).contains(&year)
            || !(1..=12).contains(&month)
            || !(1..=31).contains(&day)
            || hour > 23
            || minute > 59
            || second > 59
        {
            return None;
        }
        Some(Self {
            date: ((year - 1980) << 9) | ((month as u16) << 5) | day as u16,
            time: ((hour as u16) << 11) | ((minute as u16) << 5) | (second as u16 >> 1),
        })
    }

    pub fn year(&self) -> u16 {
        1980 + (self.date >> 9)
    }

    pub fn month(&self) -> u8 {
        ((self.date >> 5) & 0x0F) as u8
    }

    pub fn day(&self) -> u8 {
        (self.date & 0x1F) as u8
    }

    pub fn hour(&self) -> u8 {
        (self.time >> 11) as u8
    }

    pub fn minute(&self) -> u8 {
        ((self.time >> 5) & 0x3F) as u8
    }

    pub fn second(&self) -> u8 {
        ((self.time & 0x1F) << 1) as u8
    }
}

/// One decoded 32-byte short-name directory record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: [u8; 11],
    pub attributes: Attributes,
    pub creation_tenths: u8,
    pub creation_time: u16,
    pub creation_date: u16,
    pub access_date: u16,
    pub write_time: u16,
    pub write_date: u16,
    pub first_cluster: u32,
    pub size: u32,
}

impl DirEntry {
    /// An empty file entry named `name`, all stamps set to `now`.
    pub fn new(name: [u8; 11], now: FatTimestamp) -> Self {
        Self {
            name,
            attributes: Attributes::empty(),
            creation_tenths: 0,
            creation_time: now.time,
            creation_date: now.date,
            access_date: now.date,
            write_time: now.time,
            write_date: now.date,
            first_cluster: 0,
            size: 0,
        }
    }

    pub fn decode(raw: &[u8]) -> Self {
        let mut name = [0u8; 11];
        name.copy_from_slice(&raw[0..11]);
        let cluster_high = u16::from_le_bytes([raw[20], raw[21]]) as u32;
        let cluster_low = u16::from_le_bytes([raw[26], raw[27]]) as u32;
        Self {
            name,
            attributes: Attributes::from_bits_retain(raw[11]),
            creation_tenths: raw[13],
            creation_time: u16::from_le_bytes([raw[14], raw[15]]),
            creation_date: u16::from_le_bytes([raw[16], raw[17]]),
            access_date: u16::from_le_bytes([raw[18], raw[19]]),
            write_time: u16::from_le_bytes([raw[22], raw[23]]),
            write_date: u16::from_le_bytes([raw[24], raw[25]]),
            first_cluster: (cluster_high << 16) | cluster_low,
            size: u32::from_le_bytes([raw[28], raw[29], raw[30], raw[31]]),
        }
    }

    /// Writes the record into `raw`, leaving the reserved byte 12 untouched.
    pub fn encode(&self, raw: &mut [u8]) {
        raw[0..11].copy_from_slice(&self.name);
        raw[11] = self.attributes.bits();
        raw[13] = self.creation_tenths;
        raw[14..16].copy_from_slice(&self.creation_time.to_le_bytes());
        raw[16..18].copy_from_slice(&self.creation_date.to_le_bytes());
        raw[18..20].copy_from_slice(&self.access_date.to_le_bytes());
        raw[20..22].copy_from_slice(&((self.first_cluster >> 16) as u16).to_le_bytes());
        raw[22..24].copy_from_slice(&self.write_time.to_le_bytes());
        raw[24..26].copy_from_slice(&self.write_date.to_le_bytes());
        raw[26..28].copy_from_slice(&(self.first_cluster as u16).to_le_bytes());
        raw[28..32].copy_from_slice(&self.size.to_le_bytes());
    }

    /// End-of-directory marker; no used entry follows.
    pub fn is_free(&self) -> bool {
        self.name[0] == DIR_NAME_FREE
    }

    pub fn is_deleted(&self) -> bool {
        self.name[0] == DIR_NAME_DELETED
    }

    /// `.` or `..`
    pub fn is_dot(&self) -> bool {
        self.name[0] == b'.'
    }

    pub fn is_dir(&self) -> bool {
        (self.attributes & (Attributes::DIRECTORY | Attributes::VOLUME_ID))
            == Attributes::DIRECTORY
    }

    pub fn is_file(&self) -> bool {
        !self
            .attributes
            .intersects(Attributes::DIRECTORY | Attributes::VOLUME_ID)
    }

    pub fn is_file_or_subdir(&self) -> bool {
        !self.attributes.contains(Attributes::VOLUME_ID)
    }

    pub fn is_read_only(&self) -> bool {
        self.attributes.contains(Attributes::READ_ONLY)
    }

    pub fn created(&self) -> FatTimestamp {
        FatTimestamp {
            date: self.creation_date,
            time: self.creation_time,
        }
    }

    pub fn modified(&self) -> FatTimestamp {
        FatTimestamp {
            date: self.write_date,
            time: self.write_time,
        }
    }

    /// `NAME.EXT`, without padding.
    pub fn display_name(&self) -> String<12> {
        display_name(&self.name)
    }
}

/// Renders a padded 8.3 name as `NAME.EXT`.
pub fn display_name(raw: &[u8; 11]) -> String<12> {
    let mut out = String::new();
    for &b in raw[0..8].iter().take_while(|&&b| b != b' ') {
        let _ = out.push(b as char);
    }
    if raw[8] != b' ' {
        let _ = out.push('.');
        for &b in raw[8..11].iter().take_while(|&&b| b != b' ') {
            let _ = out.push(b as char);
        }
    }
    out
}

/// Converts `NAME.EXT` to the padded upper-case on-disk form.
///
/// Returns `None` for empty names, a second dot, an over-long base or
/// extension, or characters FAT does not allow in short names.
pub fn make_83_name(name: &str) -> Option<[u8; 11]> {
    let mut out = [b' '; 11];
    let mut limit = 7;
    let mut i = 0;
    for c in name.bytes() {
        if c == b'.' {
            if limit == 10 {
                return None;
            }
            limit = 10;
            i = 8;
            continue;
        }
        if ILLEGAL_NAME_CHARS.contains(&c) || i > limit || !(0x21..=0x7E).contains(&c) {
            return None;
        }
        out[i] = c.to_ascii_uppercase();
        i += 1;
    }
    (out[0] != b' ').then_some(out)
}
