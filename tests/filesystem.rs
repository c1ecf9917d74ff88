//! End-to-end scenarios against a scratch image, plus the structural
//! invariants checked through `fsck` after every mutation.

use sfs::{Disk, FileSystem, FsError};

fn fresh() -> (tempfile::TempDir, FileSystem) {
    let dir = tempfile::tempdir().unwrap();
    let disk = Disk::open(dir.path().join("disk.img"), sfs::param::DISK_SIZE).unwrap();
    let mut fs = FileSystem::new(disk).unwrap();
    fs.format().unwrap();
    (dir, fs)
}

#[test]
fn mkdir_shows_in_listing() {
    let (_t, mut fs) = fresh();
    fs.mkdir("test").unwrap();
    assert!(fs.ls().unwrap().contains(&"test".to_string()));
    fs.fsck().unwrap();
}

#[test]
fn duplicate_mkdir_fails() {
    let (_t, mut fs) = fresh();
    fs.mkdir("test").unwrap();
    assert!(matches!(fs.mkdir("test"), Err(FsError::AlreadyExists(_))));
    fs.fsck().unwrap();
}

#[test]
fn nested_directories_and_pwd() {
    let (_t, mut fs) = fresh();
    fs.mkdir("d").unwrap();
    fs.cd("d").unwrap();
    fs.mkdir("e").unwrap();
    fs.cd("e").unwrap();
    assert_eq!(fs.pwd().unwrap(), "/d/e");
    fs.cd("..").unwrap();
    assert_eq!(fs.pwd().unwrap(), "/d");
    fs.cd("/").unwrap();
    assert_eq!(fs.pwd().unwrap(), "/");
    fs.fsck().unwrap();
}

#[test]
fn rm_of_populated_directory_fails() {
    let (_t, mut fs) = fresh();
    fs.mkdir("d").unwrap();
    fs.cd("d").unwrap();
    fs.mkdir("e").unwrap();
    fs.cd("..").unwrap();
    assert!(matches!(fs.rm("d"), Err(FsError::DirNotEmpty(_))));
    // Empty it out and removal goes through.
    fs.cd("d").unwrap();
    fs.rm("e").unwrap();
    fs.cd("..").unwrap();
    fs.rm("d").unwrap();
    assert_eq!(fs.ls().unwrap(), vec![".", ".."]);
    fs.fsck().unwrap();
}

#[test]
fn write_then_read_back() {
    let (_t, mut fs) = fresh();
    fs.touch("t").unwrap();
    let fd = fs.open("t").unwrap();
    assert_eq!(fs.write(fd, b"Hello, World!\0").unwrap(), 14);
    fs.close(fd).unwrap();

    let fd = fs.open("t").unwrap();
    let mut buf = [0u8; 14];
    assert_eq!(fs.read(fd, &mut buf).unwrap(), 14);
    assert_eq!(&buf, b"Hello, World!\0");
    fs.close(fd).unwrap();
    fs.fsck().unwrap();
}

#[test]
fn short_read_at_tail_then_extend() {
    let (_t, mut fs) = fresh();
    fs.touch("t").unwrap();
    let fd = fs.open("t").unwrap();
    fs.write(fd, &[b'a'; 800]).unwrap();
    fs.seek(fd, 500).unwrap();
    let mut buf = [0u8; 500];
    let got = fs.read(fd, &mut buf).unwrap();
    assert_eq!(got, 300);
    assert!(buf[..300].iter().all(|&b| b == b'a'));
    // The read left the offset at EOF; this write appends.
    fs.write(fd, &buf[..300]).unwrap();
    assert_eq!(fs.file_size("t").unwrap(), 1100);
    fs.close(fd).unwrap();
    fs.fsck().unwrap();
}

#[test]
fn seek_is_idempotent() {
    let (_t, mut fs) = fresh();
    fs.touch("t").unwrap();
    let fd = fs.open("t").unwrap();
    fs.write(fd, b"abcdef").unwrap();
    fs.seek(fd, 2).unwrap();
    fs.seek(fd, 2).unwrap();
    let mut buf = [0u8; 2];
    fs.read(fd, &mut buf).unwrap();
    assert_eq!(&buf, b"cd");
    fs.close(fd).unwrap();
}

#[test]
fn read_past_eof_returns_no_bytes() {
    let (_t, mut fs) = fresh();
    fs.touch("t").unwrap();
    let fd = fs.open("t").unwrap();
    fs.seek(fd, 100).unwrap();
    let mut buf = [0u8; 8];
    assert_eq!(fs.read(fd, &mut buf).unwrap(), 0);
    fs.close(fd).unwrap();
}

#[test]
fn multi_chunk_writes_concatenate() {
    let (_t, mut fs) = fresh();
    fs.touch("t").unwrap();
    let fd = fs.open("t").unwrap();
    let mut expected = Vec::new();
    for (i, &len) in [3usize, 700, 513, 12, 511].iter().enumerate() {
        let chunk: Vec<u8> = (0..len).map(|j| (i * 40 + j % 200) as u8).collect();
        fs.write(fd, &chunk).unwrap();
        expected.extend_from_slice(&chunk);
    }
    fs.seek(fd, 0).unwrap();
    let mut buf = vec![0u8; expected.len()];
    assert_eq!(fs.read(fd, &mut buf).unwrap(), expected.len());
    assert_eq!(buf, expected);
    fs.close(fd).unwrap();
    fs.fsck().unwrap();
}

#[test]
fn a_file_opens_through_one_descriptor_at_a_time() {
    let (_t, mut fs) = fresh();
    fs.touch("t").unwrap();
    let fd = fs.open("t").unwrap();
    match fs.open("t") {
        Err(FsError::AlreadyOpen { fd: seen, .. }) => assert_eq!(seen, fd),
        other => panic!("expected AlreadyOpen, got {:?}", other),
    }
    fs.close(fd).unwrap();
    // Closed, it opens again.
    let fd = fs.open("t").unwrap();
    fs.close(fd).unwrap();
}

#[test]
fn closing_a_vacant_descriptor_fails() {
    let (_t, mut fs) = fresh();
    fs.touch("t").unwrap();
    let fd = fs.open("t").unwrap();
    fs.close(fd).unwrap();
    assert!(matches!(fs.close(fd), Err(FsError::NotOpen(_))));
    assert!(matches!(fs.close(99), Err(FsError::NotOpen(99))));
}

#[test]
fn directories_do_not_open_and_files_do_not_cd() {
    let (_t, mut fs) = fresh();
    fs.mkdir("d").unwrap();
    fs.touch("f").unwrap();
    assert!(matches!(fs.open("d"), Err(FsError::IsADirectory(_))));
    assert!(matches!(fs.cd("f"), Err(FsError::NotADirectory(_))));
    // A file in the middle of a path is just as wrong.
    assert!(matches!(fs.cd("f/x"), Err(FsError::NotADirectory(_))));
}

#[test]
fn missing_names_are_not_found() {
    let (_t, mut fs) = fresh();
    assert!(matches!(fs.rm("nope"), Err(FsError::NotFound(_))));
    assert!(matches!(fs.open("nope"), Err(FsError::NotFound(_))));
    assert!(matches!(fs.cd("nope"), Err(FsError::NotFound(_))));
    assert!(!fs.exist("/nope"));
}

#[test]
fn over_long_names_are_rejected() {
    let (_t, mut fs) = fresh();
    let long = "x".repeat(28);
    assert!(matches!(fs.mkdir(&long), Err(FsError::NameTooLong(_))));
    assert!(matches!(fs.touch(&long), Err(FsError::NameTooLong(_))));
    assert!(fs.mkdir(&"x".repeat(27)).is_ok());
    fs.fsck().unwrap();
}

#[test]
fn rm_compacts_the_tail_entry_into_the_hole() {
    let (_t, mut fs) = fresh();
    for name in &["a", "b", "c"] {
        fs.mkdir(name).unwrap();
    }
    fs.rm("b").unwrap();
    assert_eq!(fs.ls().unwrap(), vec![".", "..", "a", "c"]);
    fs.mkdir("d").unwrap();
    assert_eq!(fs.ls().unwrap(), vec![".", "..", "a", "c", "d"]);
    fs.fsck().unwrap();
}

#[test]
fn create_delete_recreate_recycles_inodes_and_blocks() {
    let (_t, mut fs) = fresh();
    let names: Vec<String> = (0..40).map(|i| format!("n{}", i)).collect();
    for name in &names {
        fs.mkdir(name).unwrap();
    }
    for name in &names {
        fs.rm(name).unwrap();
    }
    assert_eq!(fs.ls().unwrap().len(), 2);
    for name in &names {
        fs.mkdir(name).unwrap();
    }
    let listing = fs.ls().unwrap();
    for name in &names {
        assert!(listing.contains(name), "{} missing after recreate", name);
    }
    fs.fsck().unwrap();
}

#[test]
fn many_directories_extend_the_parent_across_blocks() {
    let (_t, mut fs) = fresh();
    let n = 200;
    for i in 0..n {
        fs.mkdir(&format!("dir{:03}", i)).unwrap();
    }
    let listing = fs.ls().unwrap();
    assert_eq!(listing.len(), n + 2);
    for i in 0..n {
        assert!(listing.contains(&format!("dir{:03}", i)));
    }
    fs.fsck().unwrap();
}

#[test]
fn writing_after_a_far_seek_leaves_holes_behind() {
    let (_t, mut fs) = fresh();
    fs.touch("t").unwrap();
    let fd = fs.open("t").unwrap();
    fs.seek(fd, 2000).unwrap();
    fs.write(fd, b"x").unwrap();
    assert_eq!(fs.file_size("t").unwrap(), 2001);

    // The straddled block reads back, zero-filled around the byte.
    fs.seek(fd, 1990).unwrap();
    let mut tail = [0xffu8; 11];
    assert_eq!(fs.read(fd, &mut tail).unwrap(), 11);
    assert_eq!(&tail[..10], &[0u8; 10]);
    assert_eq!(tail[10], b'x');

    // The skipped range was never allocated and refuses to read.
    fs.seek(fd, 0).unwrap();
    let mut head = [0u8; 16];
    assert!(matches!(
        fs.read(fd, &mut head),
        Err(FsError::BlockNotAllocated(0))
    ));
    fs.close(fd).unwrap();
    fs.fsck().unwrap();
}

#[test]
fn cat_and_flist() {
    let (_t, mut fs) = fresh();
    fs.touch("notes").unwrap();
    let fd = fs.open("notes").unwrap();
    fs.write(fd, b"remember the milk").unwrap();
    assert_eq!(fs.flist(), vec![(fd, "notes".to_string())]);
    fs.close(fd).unwrap();
    assert_eq!(fs.cat("notes").unwrap(), b"remember the milk");
    assert!(fs.flist().is_empty());
}

#[test]
fn init_builds_the_standard_tree() {
    let (_t, mut fs) = fresh();
    fs.init().unwrap();
    assert_eq!(fs.pwd().unwrap(), "/root");
    fs.cd("/").unwrap();
    let listing = fs.ls().unwrap();
    for name in &["root", "home", "etc", "bin", "usr", "dev"] {
        assert!(listing.contains(&name.to_string()));
    }
    fs.fsck().unwrap();
}

#[test]
fn remount_preserves_the_tree_and_contents() {
    let t = tempfile::tempdir().unwrap();
    let image = t.path().join("disk.img");
    {
        let disk = Disk::open(&image, sfs::param::DISK_SIZE).unwrap();
        let mut fs = FileSystem::new(disk).unwrap();
        fs.format().unwrap();
        fs.mkdir("docs").unwrap();
        fs.cd("docs").unwrap();
        fs.mkdir("inner").unwrap();
        fs.touch("readme").unwrap();
        let fd = fs.open("readme").unwrap();
        fs.write(fd, b"persisted").unwrap();
        fs.close(fd).unwrap();
        // Dropping the file system flushes everything.
    }
    let disk = Disk::open(&image, sfs::param::DISK_SIZE).unwrap();
    let mut fs = FileSystem::new(disk).unwrap();
    assert_eq!(fs.ls().unwrap(), vec![".", "..", "docs"]);
    fs.cd("docs").unwrap();
    assert_eq!(fs.ls().unwrap(), vec![".", "..", "inner", "readme"]);
    assert_eq!(fs.cat("readme").unwrap(), b"persisted");
    fs.fsck().unwrap();
}

#[test]
fn remount_lands_in_slash_root_when_it_exists() {
    let t = tempfile::tempdir().unwrap();
    let image = t.path().join("disk.img");
    {
        let disk = Disk::open(&image, sfs::param::DISK_SIZE).unwrap();
        let mut fs = FileSystem::new(disk).unwrap();
        fs.init().unwrap();
    }
    let disk = Disk::open(&image, sfs::param::DISK_SIZE).unwrap();
    let mut fs = FileSystem::new(disk).unwrap();
    assert_eq!(fs.pwd().unwrap(), "/root");
}

#[test]
fn absolute_and_relative_paths_resolve_alike() {
    let (_t, mut fs) = fresh();
    fs.mkdir("a").unwrap();
    fs.cd("a").unwrap();
    fs.mkdir("b").unwrap();
    fs.touch("f").unwrap();
    assert!(fs.exist("/a/b"));
    assert!(fs.exist("b"));
    assert!(fs.exist("./b"));
    assert!(fs.exist("../a/b"));
    assert!(fs.exist("//a//b/"));
    let fd = fs.open("/a/f").unwrap();
    fs.close(fd).unwrap();
    fs.cd("/a/b").unwrap();
    assert_eq!(fs.pwd().unwrap(), "/a/b");
}
