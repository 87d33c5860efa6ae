use std::fs;
use std::path::PathBuf;

use tempfile::TempDir;

use crate::{page_size, Error, MappedFile, ResizableFile, ResizableMemory, WritableMappedFile};

const HELLO: &[u8] = b"hello world!\0";

fn fixture_file(contents: &[u8]) -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.dat");
    fs::write(&path, contents).unwrap();
    (dir, path)
}

#[test]
fn read_only_round_trip() {
    let (_dir, path) = fixture_file(&42u32.to_le_bytes());

    let mapped = MappedFile::open(&path).unwrap();
    assert_eq!(mapped.len(), 4);
    assert!(!mapped.as_ptr().is_null());
    assert_eq!(
        u32::from_le_bytes(mapped.as_slice().try_into().unwrap()),
        42
    );
}

#[test]
fn read_only_missing_file_reports_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("missing.dat");

    match MappedFile::open(&path) {
        Err(Error::MappedFile(e)) => assert_eq!(e.path(), path),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("open unexpectedly succeeded"),
    }
}

#[test]
fn read_only_empty_file_maps_to_nothing() {
    let (_dir, path) = fixture_file(b"");

    let mapped = MappedFile::open(&path).unwrap();
    assert!(mapped.is_empty());
    assert!(mapped.as_ptr().is_null());
    assert!(mapped.as_slice().is_empty());
}

#[test]
fn writable_in_place_mutation() {
    let (_dir, path) = fixture_file(&42u32.to_le_bytes());

    {
        let mut mapped = WritableMappedFile::open(&path).unwrap();
        assert!(mapped.len() >= 4);
        mapped.as_mut_slice()[..4].copy_from_slice(&123u32.to_le_bytes());
    }

    assert_eq!(fs::read(&path).unwrap(), 123u32.to_le_bytes());
}

#[test]
fn writable_flush_range_checks_bounds() {
    let (_dir, path) = fixture_file(&[0u8; 16]);

    let mapped = WritableMappedFile::open(&path).unwrap();
    mapped.flush_range(8, 8).unwrap();
    mapped.flush_range(16, 0).unwrap();
    assert!(mapped.flush_range(8, 9).is_err());
    assert!(mapped.flush_range(usize::MAX, 2).is_err());
}

#[test]
fn writable_requires_existing_file() {
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
        WritableMappedFile::open(dir.path().join("missing.dat")),
        Err(Error::MappedFile(_))
    ));
}

#[test]
fn resizable_file_grow_keeps_address_and_contents() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("grow.dat");

    {
        let mut file = ResizableFile::open(&path, 4096).unwrap();
        assert!(file.as_ptr().is_null());
        assert_eq!(file.len(), 0);

        file.resize(13).unwrap();
        assert_eq!(file.len(), 13);
        file.as_mut_slice().copy_from_slice(HELLO);
        let before = file.as_ptr();

        file.resize(1500).unwrap();
        assert_eq!(file.len(), 1500);
        assert_eq!(file.as_ptr(), before);
        assert_eq!(&file.as_slice()[..13], HELLO);

        file.resize(4096).unwrap();
        assert_eq!(file.len(), 4096);
        assert_eq!(file.as_ptr(), before);
        assert_eq!(&file.as_slice()[..13], HELLO);

        let len = file.len();
        file.as_mut_slice()[len - 3..].copy_from_slice(b"EOF");
    }

    // Reopening with a larger capacity picks up the previous contents.
    let file = ResizableFile::open(&path, 8192).unwrap();
    assert_eq!(file.len(), 4096);
    assert_eq!(&file.as_slice()[..13], HELLO);
    assert_eq!(&file.as_slice()[4096 - 3..], b"EOF");
}

#[test]
fn resizable_file_capacity_is_enforced() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("capped.dat");

    {
        let mut file = ResizableFile::open(&path, 1500).unwrap();
        assert!(matches!(file.resize(1501), Err(Error::OutOfMemory)));
        assert_eq!(file.len(), 0);

        // A failed resize does not poison the mapping.
        file.resize(1000).unwrap();
        assert_eq!(file.len(), 1000);
        file.resize(1500).unwrap();
    }
    assert_eq!(fs::metadata(&path).unwrap().len(), 1500);

    // The existing 1500-byte file does not fit a 1499-byte capacity, and
    // the failed construction leaves it untouched.
    assert!(matches!(
        ResizableFile::open(&path, 1499),
        Err(Error::OutOfMemory)
    ));
    assert_eq!(fs::metadata(&path).unwrap().len(), 1500);
}

#[test]
fn failed_resize_preserves_contents() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("preserved.dat");

    let mut file = ResizableFile::open(&path, 2000).unwrap();
    file.resize(100).unwrap();
    for (i, byte) in file.as_mut_slice().iter_mut().enumerate() {
        *byte = i as u8;
    }
    let before = file.as_ptr();

    assert!(matches!(file.resize(2001), Err(Error::OutOfMemory)));
    assert_eq!(file.len(), 100);
    assert_eq!(file.as_ptr(), before);
    for (i, byte) in file.as_slice().iter().enumerate() {
        assert_eq!(*byte, i as u8);
    }

    file.resize(200).unwrap();
    assert_eq!(file.as_ptr(), before);
}

#[test]
fn resizable_file_length_tracks_disk() {
    let (_dir, path) = fixture_file(&42u32.to_le_bytes());

    let mut last = 4usize;
    for size in [0usize, 1, 2, 4000, 4095, 4096, 4097, 10000, 0, 4097, 4096, 4095, 42] {
        let mut file = ResizableFile::open(&path, 10000).unwrap();
        assert_eq!(file.len(), last);

        file.resize(size).unwrap();
        assert_eq!(file.len(), size);
        assert_eq!(fs::metadata(&path).unwrap().len(), size as u64);
        last = size;
    }
    assert_eq!(fs::metadata(&path).unwrap().len(), last as u64);
}

#[test]
fn resize_to_zero_tears_down_the_mapping() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("zero.dat");

    let mut file = ResizableFile::open(&path, 4096).unwrap();
    file.resize(13).unwrap();
    file.as_mut_slice().copy_from_slice(HELLO);

    file.resize(0).unwrap();
    assert!(file.as_ptr().is_null());
    assert_eq!(file.len(), 0);
    assert_eq!(fs::metadata(&path).unwrap().len(), 0);

    // Growing again is allowed; the base may differ after a full teardown.
    file.resize(10).unwrap();
    assert_eq!(file.len(), 10);
    assert!(!file.as_ptr().is_null());
}

#[test]
fn move_transfers_ownership_and_flushes_on_replace() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("moved.dat");
    let other = dir.path().join("other.dat");

    let mut file = ResizableFile::open(&path, 10000).unwrap();
    file.resize(13).unwrap();
    file.as_mut_slice().copy_from_slice(HELLO);
    let before = file.as_ptr();

    // A move does not touch the mapping.
    let mut file = file;
    assert_eq!(file.as_ptr(), before);
    assert_eq!(&file.as_slice()[..13], HELLO);

    // Replacing drops the old mapping, which releases its view before its
    // reservation and flushes the contents out.
    file = ResizableFile::open(&other, 1500).unwrap();
    assert_eq!(file.capacity(), 1500);
    assert_eq!(fs::read(&path).unwrap(), HELLO);
}

#[test]
fn resizable_memory_grow_keeps_address_and_contents() {
    let mut memory = ResizableMemory::new(0, 10000).unwrap();
    assert!(memory.as_ptr().is_null());
    assert_eq!(memory.len(), 0);
    assert_eq!(memory.capacity(), 10000);
    assert!(matches!(memory.resize(10001), Err(Error::OutOfMemory)));

    memory.resize(13).unwrap();
    assert_eq!(memory.len(), 13);
    memory.as_mut_slice().copy_from_slice(HELLO);
    let before = memory.as_ptr();

    memory.resize(1500).unwrap();
    assert_eq!(memory.len(), 1500);
    assert_eq!(memory.as_ptr(), before);
    assert_eq!(&memory.as_slice()[..13], HELLO);

    memory.resize(10000).unwrap();
    assert_eq!(memory.len(), 10000);
    assert_eq!(memory.as_ptr(), before);
    assert_eq!(&memory.as_slice()[..13], HELLO);
}

#[test]
fn resizable_memory_shrink_discards_the_tail() {
    let page = page_size();
    let mut memory = ResizableMemory::new(page * 2, page * 8).unwrap();

    let last = memory.len() - 1;
    memory.as_mut_slice()[last] = 0xCD;

    // Shrinking decommits the tail page; growing back finds zeroed pages at
    // the same addresses. (Darwin's MADV_DONTNEED keeps the old contents.)
    let before = memory.as_ptr();
    memory.resize(page).unwrap();
    memory.resize(page * 2).unwrap();
    assert_eq!(memory.as_ptr(), before);
    #[cfg(not(target_os = "macos"))]
    assert_eq!(memory.as_slice()[last], 0);
}

/// Walks every power-of-two high-water mark and checks the stamp written
/// there while growing is still intact.
fn verify_stamps(bytes: &[u8], len: usize) -> u8 {
    let mut stamp = 0u8;
    let mut i = 1usize;
    while i < len {
        stamp = stamp.wrapping_add(1);
        assert_eq!(bytes[i - 1], stamp, "stamp at offset {} is gone", i - 1);
        i *= 2;
    }
    stamp
}

#[cfg(target_pointer_width = "64")]
#[test]
fn resizable_memory_preserves_bytes_across_grow_and_shrink() {
    let mut memory = ResizableMemory::new(1, 1usize << 32).unwrap();
    let base = memory.as_ptr();
    memory.as_mut_slice()[0] = 1;

    let mut next = 1usize;
    while next * 2 <= 256 * 1024 * 1024 {
        next *= 2;
        memory.resize(next).unwrap();
        assert_eq!(memory.as_ptr(), base);
        let stamp = verify_stamps(memory.as_slice(), next);
        memory.as_mut_slice()[next - 1] = stamp.wrapping_add(1);
    }

    while next / 2 > 1 {
        next /= 2;
        memory.resize(next).unwrap();
        assert_eq!(memory.as_ptr(), base);
        verify_stamps(memory.as_slice(), next);
    }
}

#[cfg(target_pointer_width = "64")]
#[test]
fn resizable_file_preserves_bytes_across_grow_and_shrink() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ladder.dat");

    let mut file = ResizableFile::open(&path, 1usize << 32).unwrap();
    file.resize(1).unwrap();
    let base = file.as_ptr();
    file.as_mut_slice()[0] = 1;

    let mut next = 1usize;
    while next * 2 <= 256 * 1024 * 1024 {
        next *= 2;
        file.resize(next).unwrap();
        assert_eq!(file.as_ptr(), base);
        let stamp = verify_stamps(file.as_slice(), next);
        file.as_mut_slice()[next - 1] = stamp.wrapping_add(1);
    }

    while next / 2 > 1 {
        next /= 2;
        file.resize(next).unwrap();
        assert_eq!(file.as_ptr(), base);
        verify_stamps(file.as_slice(), next);
    }
}

#[test]
fn resizable_file_flush_range_checks_bounds() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("flushed.dat");

    let mut file = ResizableFile::open(&path, 4096).unwrap();
    file.flush().unwrap();

    file.resize(100).unwrap();
    file.as_mut_slice().fill(0x5A);
    file.flush().unwrap();
    file.flush_range(50, 50).unwrap();
    assert!(file.flush_range(50, 51).is_err());

    assert_eq!(fs::read(&path).unwrap(), vec![0x5A; 100]);
}

#[test]
fn capacity_is_fixed_at_construction() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fixed.dat");

    let mut file = ResizableFile::open(&path, 2048).unwrap();
    assert_eq!(file.capacity(), 2048);
    file.resize(100).unwrap();
    assert_eq!(file.capacity(), 2048);
    file.resize(0).unwrap();
    assert_eq!(file.capacity(), 2048);

    let mut memory = ResizableMemory::new(16, 4096).unwrap();
    assert_eq!(memory.capacity(), 4096);
    memory.resize(4096).unwrap();
    assert_eq!(memory.capacity(), 4096);
}

#[test]
fn oversized_capacity_is_a_logical_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("huge.dat");

    assert!(matches!(
        ResizableFile::open(&path, usize::MAX),
        Err(Error::OutOfMemory)
    ));
    assert!(matches!(
        ResizableMemory::new(0, usize::MAX),
        Err(Error::OutOfMemory)
    ));
}
