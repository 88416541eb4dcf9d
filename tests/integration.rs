// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end scenarios against the public `FileSystem` facade, exercising
//! a fake in-memory driver the same way the teacher's own tests exercise
//! `ufs` against a byte slice instead of real hardware.

use pifs::test_support::RamFlash;
use pifs::{Additive, Config, Error, FileSystem, Geometry, OpenOptions, SeekFrom};

struct SmallCfg;

impl Config for SmallCfg {
    const MAX_OPEN_FILES: usize = 4;
    const MAX_OPEN_DIRS: usize = 2;
    const MAX_ENTRIES: usize = 16;
    const MAX_FILENAME_LEN: usize = 23;
    const MAX_DELTA_PAGES: usize = 4;
    const LEAST_WORN_COUNT: usize = 3;
    const MOST_WORN_COUNT: usize = 3;
    const MAX_TASKS: usize = 2;
    const MERGE_DATA_PAGE_THRESHOLD: usize = 2;
    const STATIC_WEAR_LIMIT: u32 = 50;
    const STATIC_WEAR_PERCENT: u32 = 50;
}

const NAME_LEN: usize = 24;
const PAGE_SIZE: usize = 128;
const PAGES_PER_BLOCK: usize = 8;
const BLOCK_COUNT: usize = 20;

type Flash = RamFlash<PAGE_SIZE, PAGES_PER_BLOCK, BLOCK_COUNT>;
type Fs = FileSystem<Flash, Additive, SmallCfg, NAME_LEN, PAGE_SIZE, 4, 2, 2>;

fn geo() -> Geometry {
    Geometry {
        block_count: BLOCK_COUNT as u32,
        reserved_blocks: 1,
        pages_per_block: PAGES_PER_BLOCK as u32,
        page_size: PAGE_SIZE as u32,
        management_blocks: 2,
    }
}

fn formatted() -> Fs {
    FileSystem::format(Flash::new(), geo()).unwrap()
}

#[test]
fn format_idempotence_reports_full_capacity_and_no_files() {
    let fs = formatted();
    let free_before = fs.free_space().unwrap();
    assert!(free_before > 0);
    assert!(!fs.exists(0, b"anything").unwrap());

    // Formatting again starts a fresh device with the same capacity.
    let fs2: Fs = FileSystem::format(Flash::new(), geo()).unwrap();
    assert_eq!(fs2.free_space().unwrap(), free_before);
}

#[test]
fn round_trip_write_then_read() {
    let fs = formatted();
    let payload = b"the quick brown fox jumps over the lazy dog";

    let fd = fs.open(0, b"fox.txt", OpenOptions::default().write(true).create(true)).unwrap();
    assert_eq!(fs.write(fd, payload).unwrap(), payload.len());
    fs.close(fd).unwrap();

    let fd = fs.open(0, b"fox.txt", OpenOptions::default().read(true)).unwrap();
    let mut buf = [0u8; 64];
    let n = fs.read(fd, &mut buf).unwrap();
    assert_eq!(&buf[..n], payload);
    assert!(fs.eof(fd).unwrap());
    fs.close(fd).unwrap();
}

#[test]
fn append_law_concatenates_across_opens() {
    let fs = formatted();

    let fd = fs.open(0, b"log.txt", OpenOptions::default().write(true).create(true)).unwrap();
    fs.write(fd, b"first-").unwrap();
    fs.close(fd).unwrap();

    let fd = fs.open(0, b"log.txt", OpenOptions::default().write(true).append(true)).unwrap();
    fs.write(fd, b"second").unwrap();
    fs.close(fd).unwrap();

    let fd = fs.open(0, b"log.txt", OpenOptions::default().read(true)).unwrap();
    let mut buf = [0u8; 32];
    let n = fs.read(fd, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"first-second");
    fs.close(fd).unwrap();
}

#[test]
fn seek_and_overwrite_within_file() {
    let fs = formatted();

    let fd = fs.open(0, b"s.bin", OpenOptions::default().write(true).create(true)).unwrap();
    fs.write(fd, b"0123456789").unwrap();
    fs.seek(fd, SeekFrom::Start(3)).unwrap();
    fs.write(fd, b"XYZ").unwrap();
    fs.close(fd).unwrap();

    let fd = fs.open(0, b"s.bin", OpenOptions::default().read(true)).unwrap();
    let mut buf = [0u8; 10];
    fs.read(fd, &mut buf).unwrap();
    assert_eq!(&buf, b"012XYZ6789");
    fs.close(fd).unwrap();
}

#[test]
fn delete_reclaims_space_and_hides_the_file() {
    let fs = formatted();
    let before = fs.free_space().unwrap();

    let fd = fs.open(0, b"junk.bin", OpenOptions::default().write(true).create(true)).unwrap();
    fs.write(fd, &[0xAAu8; PAGE_SIZE * 2]).unwrap();
    fs.close(fd).unwrap();
    assert!(fs.free_space().unwrap() < before);

    fs.remove(0, b"junk.bin").unwrap();
    assert!(!fs.exists(0, b"junk.bin").unwrap());

    // Space is no smaller than before the file was written, once merge has
    // run over the released pages.
    fs.merge().unwrap();
    assert!(fs.free_space().unwrap() >= before);
}

#[test]
fn rename_preserves_file_contents() {
    let fs = formatted();

    let fd = fs.open(0, b"old.txt", OpenOptions::default().write(true).create(true)).unwrap();
    fs.write(fd, b"payload").unwrap();
    fs.close(fd).unwrap();

    fs.rename(0, b"old.txt", b"new.txt").unwrap();
    assert!(!fs.exists(0, b"old.txt").unwrap());

    let fd = fs.open(0, b"new.txt", OpenOptions::default().read(true)).unwrap();
    let mut buf = [0u8; 7];
    fs.read(fd, &mut buf).unwrap();
    assert_eq!(&buf, b"payload");
    fs.close(fd).unwrap();
}

#[test]
fn copy_duplicates_contents_under_a_new_name() {
    let fs = formatted();

    let fd = fs.open(0, b"src.bin", OpenOptions::default().write(true).create(true)).unwrap();
    fs.write(fd, &[0x5Au8; 50]).unwrap();
    fs.close(fd).unwrap();

    fs.copy(0, b"src.bin", b"dst.bin").unwrap();
    assert_eq!(fs.file_size(0, b"src.bin").unwrap(), 50);
    assert_eq!(fs.file_size(0, b"dst.bin").unwrap(), 50);

    let fd = fs.open(0, b"dst.bin", OpenOptions::default().read(true)).unwrap();
    let mut buf = [0u8; 50];
    fs.read(fd, &mut buf).unwrap();
    assert!(buf.iter().all(|&b| b == 0x5A));
    fs.close(fd).unwrap();
}

#[test]
fn directories_support_nested_files_and_chdir() {
    let fs = formatted();

    fs.mkdir(0, b"docs").unwrap();
    fs.chdir(0, b"docs").unwrap();
    let fd = fs.open(0, b"note.txt", OpenOptions::default().write(true).create(true)).unwrap();
    fs.write(fd, b"hi").unwrap();
    fs.close(fd).unwrap();
    fs.chdir(0, b"..").unwrap();

    assert!(fs.exists(0, b"docs").unwrap());
    fs.chdir(0, b"docs").unwrap();
    assert!(fs.exists(0, b"note.txt").unwrap());

    let dh = fs.open_dir(0, b".").unwrap();
    let mut names = 0;
    while fs.read_dir(dh).unwrap().is_some() {
        names += 1;
    }
    fs.close_dir(dh).unwrap();
    assert_eq!(names, 3); // ".", "..", "note.txt"
}

#[test]
fn rmdir_rejects_non_empty_directory() {
    let fs = formatted();
    fs.mkdir(0, b"full").unwrap();
    fs.chdir(0, b"full").unwrap();
    let fd = fs.open(0, b"a.txt", OpenOptions::default().write(true).create(true)).unwrap();
    fs.close(fd).unwrap();
    fs.chdir(0, b"..").unwrap();

    assert_eq!(fs.rmdir(0, b"full"), Err(Error::DirectoryNotEmpty));
}

#[test]
fn create_new_on_existing_file_fails() {
    let fs = formatted();
    let fd = fs.open(0, b"dup.txt", OpenOptions::default().write(true).create(true)).unwrap();
    fs.close(fd).unwrap();

    assert_eq!(
        fs.open(0, b"dup.txt", OpenOptions::default().write(true).create_new(true)),
        Err(Error::FileAlreadyExists)
    );
}

#[test]
fn merge_recovers_space_from_overwritten_deltas() {
    let fs = formatted();

    let fd = fs.open(0, b"hot.bin", OpenOptions::default().write(true).create(true)).unwrap();
    fs.write(fd, &[0x00u8; PAGE_SIZE]).unwrap();
    fs.close(fd).unwrap();

    // Repeated in-place overwrites redirect through the delta map rather
    // than erasing; each one leaves the previous data page released.
    for i in 0..6u8 {
        let fd = fs.open(0, b"hot.bin", OpenOptions::default().write(true)).unwrap();
        fs.seek(fd, SeekFrom::Start(0)).unwrap();
        fs.write(fd, &[i; 4]).unwrap();
        fs.close(fd).unwrap();
    }

    let released_before = fs.to_be_released_space().unwrap();
    assert!(released_before > 0);

    fs.merge().unwrap();
    assert!(fs.to_be_released_space().unwrap() < released_before);

    let fd = fs.open(0, b"hot.bin", OpenOptions::default().read(true)).unwrap();
    let mut buf = [0u8; 4];
    fs.read(fd, &mut buf).unwrap();
    assert_eq!(buf, [5u8; 4]);
    fs.close(fd).unwrap();
}

#[test]
fn static_wear_level_migrates_without_losing_data() {
    let fs = formatted();

    let fd = fs.open(0, b"steady.bin", OpenOptions::default().write(true).create(true)).unwrap();
    fs.write(fd, b"steady-bytes").unwrap();
    fs.close(fd).unwrap();

    // Hammer a throwaway file with writes so some data blocks wear faster
    // than the block backing "steady.bin", giving static wear leveling a
    // gap to act on.
    for i in 0..20u8 {
        let fd = fs.open(0, b"churn.bin", OpenOptions::default().write(true).create(true).truncate(true)).unwrap();
        fs.write(fd, &[i; PAGE_SIZE]).unwrap();
        fs.close(fd).unwrap();
        fs.merge().unwrap();
    }

    fs.static_wear_level(4).unwrap();

    let fd = fs.open(0, b"steady.bin", OpenOptions::default().read(true)).unwrap();
    let mut buf = [0u8; 12];
    fs.read(fd, &mut buf).unwrap();
    assert_eq!(&buf, b"steady-bytes");
    fs.close(fd).unwrap();
}

#[test]
fn open_dir_rejects_a_plain_file() {
    let fs = formatted();
    let fd = fs.open(0, b"plain.txt", OpenOptions::default().write(true).create(true)).unwrap();
    fs.close(fd).unwrap();

    assert_eq!(fs.open_dir(0, b"plain.txt"), Err(Error::IsNotDirectory));
}
