mod common;

use std::collections::BTreeSet;

use common::{format, pattern, RamDisk, FAT12, FAT16, FAT16_1K, FAT32};
use sdfat::{
    fat::{FatTimestamp, TimestampKind},
    BlockDevice, FatError, FileHandle, FileKind, OpenMode, SdFs, Volume,
};

fn mount(disk: RamDisk) -> SdFs<RamDisk> {
    SdFs::begin(disk).unwrap()
}

fn read_all<D: BlockDevice>(vol: &mut Volume<D>, file: &mut FileHandle, chunk: usize) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = vec![0u8; chunk];
    loop {
        let n = file.read(vol, &mut buf).unwrap();
        if n == 0 {
            return out;
        }
        out.extend_from_slice(&buf[..n]);
    }
}

fn chain<D: BlockDevice>(vol: &mut Volume<D>, first: u32) -> Vec<u32> {
    let mut clusters = vec![first];
    let mut cluster = first;
    loop {
        let next = vol.fat_get(cluster).unwrap();
        if vol.is_eoc(next) {
            return clusters;
        }
        clusters.push(next);
        cluster = next;
    }
}

fn round_trip(disk: RamDisk) {
    let mut fs = mount(disk);
    let data = pattern(5000, 7);

    let mut file = fs.open("/DATA.BIN", OpenMode::FILE_WRITE).unwrap();
    for piece in data.chunks(700) {
        assert_eq!(file.write(fs.volume(), piece).unwrap(), piece.len());
    }
    assert_eq!(file.file_size(), 5000);

    file.seek_set(fs.volume(), 0).unwrap();
    let mut back = vec![0u8; 5000];
    assert_eq!(file.read(fs.volume(), &mut back).unwrap(), 5000);
    assert_eq!(back, data);
    assert_eq!(file.read(fs.volume(), &mut back).unwrap(), 0);
    file.close(fs.volume()).unwrap();

    let disk = fs.end().unwrap();
    let mut fs = mount(disk);
    let mut file = fs.open("DATA.BIN", OpenMode::READ).unwrap();
    assert_eq!(file.file_size(), 5000);
    assert_eq!(read_all(fs.volume(), &mut file, 300), data);
}

#[test]
fn round_trip_fat12() {
    round_trip(format(&FAT12));
}

#[test]
fn round_trip_fat16_two_block_clusters() {
    round_trip(format(&FAT16_1K));
}

#[test]
fn round_trip_fat32() {
    round_trip(format(&FAT32));
}

#[test]
fn append_mode_starts_at_end_of_file() {
    let mut fs = mount(format(&FAT16));
    let mut file = fs.open("LOG.TXT", OpenMode::FILE_WRITE).unwrap();
    file.write(fs.volume(), b"first line\n").unwrap();
    file.close(fs.volume()).unwrap();

    let mut file = fs.open("LOG.TXT", OpenMode::FILE_WRITE).unwrap();
    assert_eq!(file.position(), 11);
    // Appends even after the cursor was moved back.
    file.seek_set(fs.volume(), 0).unwrap();
    file.write(fs.volume(), b"second\n").unwrap();
    file.close(fs.volume()).unwrap();

    let mut file = fs.open("LOG.TXT", OpenMode::READ).unwrap();
    assert_eq!(read_all(fs.volume(), &mut file, 64), b"first line\nsecond\n");
}

#[test]
fn open_modes_are_enforced() {
    let mut fs = mount(format(&FAT16));
    assert_eq!(
        fs.open("MISSING.TXT", OpenMode::READ).unwrap_err(),
        FatError::NotFound
    );

    let mut file = fs
        .open("A.TXT", OpenMode::WRITE | OpenMode::CREATE)
        .unwrap();
    let mut buf = [0u8; 4];
    assert_eq!(file.read(fs.volume(), &mut buf), Err(FatError::WriteOnly));
    file.write(fs.volume(), b"abc").unwrap();
    file.close(fs.volume()).unwrap();

    assert_eq!(
        fs.open("A.TXT", OpenMode::RDWR | OpenMode::CREATE | OpenMode::EXCL)
            .unwrap_err(),
        FatError::AlreadyExists
    );

    let mut file = fs.open("A.TXT", OpenMode::READ).unwrap();
    assert_eq!(file.write(fs.volume(), b"x"), Err(FatError::ReadOnly));
    assert_eq!(file.truncate(fs.volume(), 0), Err(FatError::ReadOnly));
    assert_eq!(file.read(fs.volume(), &mut buf).unwrap(), 3);
    assert_eq!(&buf[..3], b"abc");

    assert_eq!(
        fs.open("BAD*NAME.TXT", OpenMode::READ).unwrap_err(),
        FatError::InvalidName
    );
}

#[test]
fn closed_handle_refuses_io() {
    let mut fs = mount(format(&FAT16));
    let mut file = FileHandle::new();
    let mut buf = [0u8; 1];
    assert_eq!(file.kind(), FileKind::Closed);
    assert_eq!(file.read(fs.volume(), &mut buf), Err(FatError::NotOpen));
    assert_eq!(file.write(fs.volume(), b"x"), Err(FatError::NotOpen));
    assert_eq!(file.sync(fs.volume()), Err(FatError::NotOpen));

    let (vol, root) = fs.parts();
    file.open(vol, root, "NEW.TXT", OpenMode::FILE_WRITE).unwrap();
    assert_eq!(
        file.open(vol, root, "NEW.TXT", OpenMode::READ),
        Err(FatError::AlreadyOpen)
    );
}

#[test]
fn read_only_seek_stops_at_end_of_file() {
    let mut fs = mount(format(&FAT16));
    let mut file = fs.open("S.TXT", OpenMode::FILE_WRITE).unwrap();
    file.write(fs.volume(), &pattern(1500, 1)).unwrap();
    file.close(fs.volume()).unwrap();

    let mut file = fs.open("S.TXT", OpenMode::READ).unwrap();
    assert_eq!(
        file.seek_set(fs.volume(), 1501),
        Err(FatError::SeekBeyondEnd)
    );
    file.seek_set(fs.volume(), 1200).unwrap();
    file.seek_cur(fs.volume(), -700).unwrap();
    assert_eq!(file.position(), 500);
    let mut buf = [0u8; 4];
    file.read(fs.volume(), &mut buf).unwrap();
    assert_eq!(&buf[..], &pattern(1500, 1)[500..504]);

    file.seek_end(fs.volume()).unwrap();
    assert_eq!(file.position(), 1500);
    assert_eq!(file.seek_cur(fs.volume(), -2000), Err(FatError::SeekBeyondEnd));
}

#[test]
fn write_after_seek_past_end_fills_gap_with_zeros() {
    let mut disk = format(&FAT16);
    // Stale data in the clusters the file will get.
    let data_start = FAT16.data_start(0);
    for lba in data_start..data_start + 16 {
        disk.put(lba, [0xAA; 512]);
    }
    let mut fs = mount(disk);

    let mut file = fs.open("GAP.BIN", OpenMode::RDWR | OpenMode::CREATE).unwrap();
    file.write(fs.volume(), b"head").unwrap();
    file.seek_set(fs.volume(), 3000).unwrap();
    assert_eq!(file.position(), 3000);
    assert_eq!(file.file_size(), 4);
    file.write(fs.volume(), b"END").unwrap();
    assert_eq!(file.file_size(), 3003);

    file.rewind();
    let back = read_all(fs.volume(), &mut file, 512);
    assert_eq!(&back[..4], b"head");
    assert!(back[4..3000].iter().all(|&b| b == 0));
    assert_eq!(&back[3000..], b"END");
}

#[test]
fn truncate_releases_tail_clusters() {
    let mut fs = mount(format(&FAT16));
    let mut file = fs.open("T.BIN", OpenMode::FILE_WRITE).unwrap();
    file.write(fs.volume(), &pattern(3000, 3)).unwrap();
    let clusters = chain(fs.volume(), file.first_cluster());
    assert_eq!(clusters.len(), 6);

    file.truncate(fs.volume(), 1000).unwrap();
    assert_eq!(file.file_size(), 1000);
    assert_eq!(file.position(), 1000);
    assert_eq!(chain(fs.volume(), file.first_cluster()), clusters[..2]);
    for &freed in &clusters[2..] {
        assert_eq!(fs.volume().fat_get(freed).unwrap(), 0);
    }
    assert_eq!(
        file.truncate(fs.volume(), 2000),
        Err(FatError::SeekBeyondEnd)
    );

    file.seek_set(fs.volume(), 0).unwrap();
    assert_eq!(read_all(fs.volume(), &mut file, 256), pattern(3000, 3)[..1000]);
}

#[test]
fn trunc_flag_empties_existing_file() {
    let mut fs = mount(format(&FAT16));
    let mut file = fs.open("R.TXT", OpenMode::FILE_WRITE).unwrap();
    file.write(fs.volume(), &pattern(2000, 9)).unwrap();
    let first = file.first_cluster();
    file.close(fs.volume()).unwrap();

    let mut file = fs.open("R.TXT", OpenMode::RDWR | OpenMode::TRUNC).unwrap();
    assert_eq!(file.file_size(), 0);
    assert_eq!(file.first_cluster(), 0);
    assert_eq!(fs.volume().fat_get(first).unwrap(), 0);

    file.write(fs.volume(), b"fresh").unwrap();
    file.close(fs.volume()).unwrap();
    let mut file = fs.open("R.TXT", OpenMode::READ).unwrap();
    assert_eq!(read_all(fs.volume(), &mut file, 16), b"fresh");
}

#[test]
fn open_files_never_share_clusters() {
    let mut fs = mount(format(&FAT16));
    let mut a = fs.open("A.BIN", OpenMode::FILE_WRITE).unwrap();
    let mut b = fs.open("B.BIN", OpenMode::FILE_WRITE).unwrap();
    let data_a = pattern(4200, 0x10);
    let data_b = pattern(4200, 0x20);
    for (pa, pb) in data_a.chunks(700).zip(data_b.chunks(700)) {
        a.write(fs.volume(), pa).unwrap();
        b.write(fs.volume(), pb).unwrap();
    }

    let chain_a = chain(fs.volume(), a.first_cluster());
    let chain_b = chain(fs.volume(), b.first_cluster());
    assert_eq!(chain_a.len(), 9);
    assert_eq!(chain_b.len(), 9);
    let set_a: BTreeSet<u32> = chain_a.iter().copied().collect();
    let set_b: BTreeSet<u32> = chain_b.iter().copied().collect();
    assert_eq!(set_a.len(), 9);
    assert!(set_a.is_disjoint(&set_b));

    assert_eq!(
        a.contiguous_range(fs.volume()),
        Err(FatError::NotContiguous)
    );

    a.close(fs.volume()).unwrap();
    b.close(fs.volume()).unwrap();
    let mut a = fs.open("A.BIN", OpenMode::READ).unwrap();
    assert_eq!(read_all(fs.volume(), &mut a, 512), data_a);
    let mut b = fs.open("B.BIN", OpenMode::READ).unwrap();
    assert_eq!(read_all(fs.volume(), &mut b, 512), data_b);
}

#[test]
fn contiguous_file_covers_one_run() {
    let mut fs = mount(format(&FAT16_1K));
    let mut file = FileHandle::new();
    let (vol, root) = fs.parts();
    file.create_contiguous(vol, root, "BIG.DAT", 10_000).unwrap();
    assert_eq!(file.file_size(), 10_000);

    let (first, last) = file.contiguous_range(vol).unwrap();
    // 10 clusters of two blocks.
    assert_eq!(last - first + 1, 20);
    assert_eq!(first, vol.block_number(file.first_cluster(), 0));
    file.close(vol).unwrap();

    let mut again = FileHandle::new();
    assert_eq!(
        again.create_contiguous(vol, root, "BIG.DAT", 10),
        Err(FatError::AlreadyExists)
    );
    assert_eq!(
        again.create_contiguous(vol, root, "ZERO.DAT", 0),
        Err(FatError::InvalidArgument)
    );
}

fn fixed_clock() -> FatTimestamp {
    FatTimestamp::new(2024, 5, 17, 13, 45, 30).unwrap()
}

#[test]
fn entries_carry_clock_and_explicit_stamps() {
    let mut fs = mount(format(&FAT16));
    fs.volume().set_date_time_source(Some(fixed_clock));

    let mut file = fs.open("STAMP.TXT", OpenMode::FILE_WRITE).unwrap();
    file.write(fs.volume(), b"x").unwrap();
    let entry = file.dir_entry(fs.volume()).unwrap();
    assert_eq!(entry.created(), fixed_clock());
    assert_eq!(entry.modified(), fixed_clock());
    assert_eq!(entry.size, 1);

    file.timestamp(fs.volume(), TimestampKind::WRITE, 2030, 1, 2, 3, 4, 6)
        .unwrap();
    let entry = file.dir_entry(fs.volume()).unwrap();
    assert_eq!(
        entry.modified(),
        FatTimestamp::new(2030, 1, 2, 3, 4, 6).unwrap()
    );
    assert_eq!(entry.created(), fixed_clock());
    assert_eq!(
        file.timestamp(fs.volume(), TimestampKind::ACCESS, 1970, 1, 1, 0, 0, 0),
        Err(FatError::InvalidArgument)
    );
    assert_eq!(file.name(fs.volume()).unwrap().as_str(), "STAMP.TXT");
}

#[test]
fn entries_default_to_2000_without_clock() {
    let mut fs = mount(format(&FAT16));
    let mut file = fs.open("PLAIN.TXT", OpenMode::FILE_WRITE).unwrap();
    let entry = file.dir_entry(fs.volume()).unwrap();
    assert_eq!(entry.created(), FatTimestamp::DEFAULT);
}

#[test]
fn directories_cannot_be_written() {
    let mut fs = mount(format(&FAT16));
    fs.mkdir("DOCS").unwrap();
    assert_eq!(
        fs.open("DOCS", OpenMode::RDWR).unwrap_err(),
        FatError::IsADirectory
    );

    let mut dir = fs.open("DOCS", OpenMode::READ).unwrap();
    assert!(dir.is_sub_dir());
    assert_eq!(dir.write(fs.volume(), b"x"), Err(FatError::IsADirectory));
}

#[test]
fn sync_flag_persists_every_write() {
    let mut fs = mount(format(&FAT16));
    let mut file = fs
        .open("SYNC.TXT", OpenMode::FILE_WRITE | OpenMode::SYNC)
        .unwrap();
    file.write(fs.volume(), b"durable").unwrap();

    // Read the entry through a second handle without closing the first.
    let mut other = fs.open("SYNC.TXT", OpenMode::READ).unwrap();
    assert_eq!(other.file_size(), 7);
    assert_eq!(read_all(fs.volume(), &mut other, 16), b"durable");
}

#[test]
fn write_into_a_broken_chain_reports_bad_cluster() {
    let mut fs = mount(format(&FAT16));
    let mut file = fs.open("/LOG.TXT", OpenMode::FILE_WRITE).unwrap();
    file.write(fs.volume(), &[1; 512]).unwrap();
    file.sync(fs.volume()).unwrap();

    // Point the first cluster at a free entry instead of end of chain.
    let first = file.first_cluster();
    let next = fs.volume().fat_get(first).unwrap();
    assert!(fs.volume().is_eoc(next));
    fs.volume().fat_put(first, 0).unwrap();

    assert_eq!(
        file.write(fs.volume(), &[2; 10]),
        Err(FatError::BadCluster(0))
    );
}
