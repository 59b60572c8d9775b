mod common;

use std::collections::BTreeSet;

use common::{FileOpts, ImageBuilder};
use sqfs::{Archive, FileType, SquashfsError, TraversalState};
use test_log::test;

fn nested_image() -> Vec<u8> {
    ImageBuilder::new(4096)
        .dir("a/b/c")
        .file("a/b/c/leaf", b"12345", FileOpts::default())
        .build()
}

#[test]
fn directory_enumeration_matches_resolution() {
    let image = ImageBuilder::new(4096)
        .file("alpha", b"a", FileOpts::default())
        .file("beta", b"bb", FileOpts::default())
        .dir("gamma")
        .file("gamma/inner", b"ccc", FileOpts::default())
        .symlink("lambda", "alpha")
        .build();
    let archive = Archive::from_slice(&image).unwrap();

    let root = archive.root().unwrap();
    let mut names = Vec::new();
    for entry in root.dir_iterator().unwrap() {
        let entry = entry.unwrap();
        names.push(entry.name().unwrap().to_string());

        let resolved = archive.open(entry.name().unwrap(), false).unwrap();
        assert_eq!(resolved.inode_ref(), entry.inode_ref());
        assert_eq!(resolved.inode_number(), entry.inode_number());
        assert_eq!(resolved.file_type(), entry.file_type());
    }

    let unique: BTreeSet<_> = names.iter().cloned().collect();
    assert_eq!(unique.len(), names.len(), "duplicate names");
    assert_eq!(
        unique,
        BTreeSet::from(["alpha".into(), "beta".into(), "gamma".into(), "lambda".into()])
    );
    // on-disk order is sorted
    let mut sorted = names.clone();
    sorted.sort();
    assert_eq!(names, sorted);
}

#[test]
fn lookup_finds_and_rejects() {
    let image = ImageBuilder::new(4096)
        .file("bar", b"x", FileOpts::default())
        .file("foo", b"y", FileOpts::default())
        .build();
    let archive = Archive::from_slice(&image).unwrap();
    let root = archive.root().unwrap();

    let entry = root.dir_iterator().unwrap().lookup(b"foo").unwrap();
    assert_eq!(entry.name_bytes(), b"foo");

    let err = root.dir_iterator().unwrap().lookup(b"baz");
    assert!(matches!(err, Err(SquashfsError::NoSuchEntry)));
}

#[test]
fn lookup_through_directory_index() {
    let image = ImageBuilder::new(4096)
        .extended_dirs()
        .file("bar", b"x", FileOpts::default())
        .file("foo", b"y", FileOpts::default())
        .file("quux", b"z", FileOpts::default())
        .build();
    let archive = Archive::from_slice(&image).unwrap();
    let root = archive.root().unwrap();

    let entry = root.dir_iterator().unwrap().lookup(b"quux").unwrap();
    assert_eq!(entry.name_bytes(), b"quux");
    let file = archive.open("/quux", false).unwrap();
    assert_eq!(file.inode_ref(), entry.inode_ref());
}

#[test]
fn traversal_visits_depth_first() {
    let image = nested_image();
    let archive = Archive::from_slice(&image).unwrap();
    let root = archive.root().unwrap();

    let mut traversal = archive.traversal(&root);
    let mut events = Vec::new();
    while let Some(state) = traversal.next() {
        events.push((state.unwrap(), traversal.path()));
    }

    use TraversalState::*;
    assert_eq!(
        events,
        vec![
            (DirectoryBegin, String::new()),
            (DirectoryBegin, "a".to_string()),
            (DirectoryBegin, "a/b".to_string()),
            (DirectoryBegin, "a/b/c".to_string()),
            (File, "a/b/c/leaf".to_string()),
            (DirectoryEnd, "a/b/c".to_string()),
            (DirectoryEnd, "a/b".to_string()),
            (DirectoryEnd, "a".to_string()),
            (DirectoryEnd, String::new()),
        ]
    );
}

#[test]
fn traversal_respects_max_depth() {
    let image = nested_image();
    let archive = Archive::from_slice(&image).unwrap();
    let root = archive.root().unwrap();

    let mut traversal = archive.traversal(&root);
    traversal.set_max_depth(1);
    let mut events = Vec::new();
    while let Some(state) = traversal.next() {
        events.push((state.unwrap(), traversal.path()));
    }

    use TraversalState::*;
    assert_eq!(
        events,
        vec![
            (DirectoryBegin, String::new()),
            (File, "a".to_string()),
            (DirectoryEnd, String::new()),
        ]
    );
}

#[test]
fn traversal_detects_directory_loop() {
    let image = ImageBuilder::new(4096).with_root_loop("a").build();
    let archive = Archive::from_slice(&image).unwrap();
    let root = archive.root().unwrap();

    let mut traversal = archive.traversal(&root);
    let mut steps = 0;
    let error = loop {
        match traversal.next() {
            Some(Ok(_)) => {
                steps += 1;
                assert!(steps <= 256, "loop not detected");
            }
            Some(Err(e)) => break e,
            None => panic!("traversal finished inside a loop"),
        }
    };
    assert!(matches!(error, SquashfsError::DirectoryRecursion));
}

#[test]
fn symlink_cycle_and_no_follow() {
    let image = ImageBuilder::new(4096)
        .symlink("a", "b")
        .symlink("b", "a")
        .build();
    let archive = Archive::from_slice(&image).unwrap();

    let err = archive.open("/a", true);
    assert!(matches!(err, Err(SquashfsError::TooManySymlinks)));

    let file = archive.open("/a", false).unwrap();
    assert_eq!(file.file_type(), FileType::Symlink);
    assert_eq!(file.symlink_target(), Some(&b"b"[..]));
}

#[test]
fn symlink_follow_reaches_target() {
    let image = ImageBuilder::new(4096)
        .file("hello", b"Hello, world!\n", FileOpts::default())
        .symlink("link", "hello")
        .dir("sub")
        .symlink("sub/up", "../hello")
        .build();
    let archive = Archive::from_slice(&image).unwrap();

    let file = archive.open("/link", true).unwrap();
    assert_eq!(file.file_type(), FileType::File);
    assert_eq!(file.size(), 14);

    let file = archive.open("/sub/up", true).unwrap();
    assert_eq!(file.size(), 14);

    // symlinks in intermediate components are followed either way
    let symlink = archive.open("/link", false).unwrap();
    assert_eq!(symlink.file_type(), FileType::Symlink);
    let resolved = symlink.resolve_symlink_all().unwrap();
    assert_eq!(resolved.file_type(), FileType::File);
}

#[test]
fn dot_and_dotdot_normalize() {
    let image = nested_image();
    let archive = Archive::from_slice(&image).unwrap();

    let direct = archive.open("/a/b/c/leaf", true).unwrap();
    let twisted = archive.open("/a/./b/../b/c/./leaf", true).unwrap();
    assert_eq!(direct.inode_ref(), twisted.inode_ref());

    // never past the root
    let above = archive.open("/../../a/b/c/leaf", true).unwrap();
    assert_eq!(above.inode_ref(), direct.inode_ref());
}

#[test]
fn open_non_directory_component_fails() {
    let image = ImageBuilder::new(4096)
        .file("plain", b"data", FileOpts::default())
        .build();
    let archive = Archive::from_slice(&image).unwrap();

    let err = archive.open("/plain/sub", true);
    assert!(matches!(err, Err(SquashfsError::NotADirectory)));

    let err = archive.open("/absent", true);
    assert!(matches!(err, Err(SquashfsError::NoSuchEntry)));
}

#[test]
fn parent_resolution_through_export_table() {
    let image = ImageBuilder::new(4096)
        .with_export_table()
        .dir("deep/deeper")
        .file("deep/deeper/leaf", b"x", FileOpts::default())
        .build();
    let archive = Archive::from_slice(&image).unwrap();

    // open a directory by ref only, then climb through the export table
    let inode_ref = archive.open("/deep/deeper", false).unwrap().inode_ref();
    let archive2 = Archive::from_slice(&image).unwrap();
    let dir = archive2.open_by_ref(inode_ref).unwrap();
    let parent = archive2.open_by_ref(dir.parent_ref().unwrap()).unwrap();
    assert_eq!(parent.file_type(), FileType::Directory);
    let entry = parent.dir_iterator().unwrap().lookup(b"deeper").unwrap();
    assert_eq!(entry.inode_ref(), inode_ref);
}
