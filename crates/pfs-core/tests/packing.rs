#![forbid(unsafe_code)]

use pfs_core::{
    DATA_START, Extent, Fs, FsConfig, MemByteDevice, MemoryMetadataStore, NodeKind, PfsError,
};
use proptest::prelude::*;
use std::collections::BTreeMap;

type MemFs = Fs<MemByteDevice, MemoryMetadataStore>;

fn mem_fs(capacity: usize) -> MemFs {
    Fs::open(
        MemByteDevice::new(capacity),
        MemoryMetadataStore::new(),
        FsConfig::default(),
    )
    .expect("open")
}

fn extent_of(fs: &MemFs, path: &str) -> Option<Extent> {
    fs.stat(path).expect("stat").extent
}

fn ext(begin: u64, end: u64) -> Option<Extent> {
    Extent::new(begin, end)
}

fn touch(fs: &mut MemFs, path: &str, bytes: &[u8]) {
    fs.create(path, NodeKind::File).expect("create");
    fs.set_content(path, bytes).expect("set");
}

#[test]
fn shrinking_head_file_migrates_it_behind_its_sibling() {
    let mut fs = mem_fs(100);

    touch(&mut fs, "/a", b"hello");
    assert_eq!(extent_of(&fs, "/a"), ext(6, 10));
    assert_eq!(fs.usage().high_water_mark, 10);

    touch(&mut fs, "/b", b"hi");
    assert_eq!(extent_of(&fs, "/b"), ext(11, 12));
    assert_eq!(fs.usage().high_water_mark, 12);

    fs.set_content("/a", b"H").expect("shrink");
    assert_eq!(extent_of(&fs, "/b"), ext(6, 7));
    assert_eq!(extent_of(&fs, "/a"), ext(8, 8));
    assert_eq!(fs.usage().high_water_mark, 8);
    assert_eq!(fs.get_content("/a").unwrap(), b"H");
    assert_eq!(fs.get_content("/b").unwrap(), b"hi");
    fs.check().unwrap();
}

#[test]
fn growing_head_file_preserves_siblings() {
    let mut fs = mem_fs(100);
    touch(&mut fs, "/a", b"aaa");
    touch(&mut fs, "/b", b"bb");
    touch(&mut fs, "/c", b"c");

    fs.set_content("/a", b"aaaaa").expect("grow");

    assert_eq!(extent_of(&fs, "/b"), ext(6, 7));
    assert_eq!(extent_of(&fs, "/c"), ext(8, 8));
    assert_eq!(extent_of(&fs, "/a"), ext(9, 13));
    assert_eq!(fs.get_content("/a").unwrap(), b"aaaaa");
    assert_eq!(fs.get_content("/b").unwrap(), b"bb");
    assert_eq!(fs.get_content("/c").unwrap(), b"c");
    fs.check().unwrap();
}

#[test]
fn tail_resize_leaves_other_extents_alone() {
    let mut fs = mem_fs(100);
    touch(&mut fs, "/a", b"aaa");
    touch(&mut fs, "/b", b"bb");

    fs.set_content("/b", b"bbbbbbb").expect("grow tail");
    assert_eq!(extent_of(&fs, "/a"), ext(6, 8));
    assert_eq!(extent_of(&fs, "/b"), ext(9, 15));

    fs.set_content("/b", b"b").expect("shrink tail");
    assert_eq!(extent_of(&fs, "/a"), ext(6, 8));
    assert_eq!(extent_of(&fs, "/b"), ext(9, 9));
    assert_eq!(fs.usage().high_water_mark, 9);
}

#[test]
fn removing_non_tail_file_collapses_the_gap() {
    let mut fs = mem_fs(100);
    touch(&mut fs, "/a", b"aaaa");
    touch(&mut fs, "/b", b"bb");
    touch(&mut fs, "/c", b"ccc");
    let before = fs.usage().high_water_mark;

    fs.remove_file("/a").expect("remove");

    assert_eq!(fs.usage().high_water_mark, before - 4);
    assert_eq!(extent_of(&fs, "/b"), ext(6, 7));
    assert_eq!(extent_of(&fs, "/c"), ext(8, 10));
    assert_eq!(fs.get_content("/c").unwrap(), b"ccc");
    assert!(matches!(fs.stat("/a"), Err(PfsError::NotFound(_))));
    fs.check().unwrap();
}

#[test]
fn capacity_boundary_is_exact_and_failures_are_atomic() {
    let mut fs = mem_fs(100);
    fs.create("/a", NodeKind::File).unwrap();
    fs.create("/b", NodeKind::File).unwrap();

    let fill = vec![b'x'; 100 - DATA_START as usize];
    fs.set_content("/a", &fill).expect("fill to last byte");
    assert_eq!(extent_of(&fs, "/a"), ext(6, 99));
    assert_eq!(fs.usage().free_bytes, 0);
    assert_eq!(fs.get_content("/a").unwrap(), fill);

    let snapshot = fs.snapshot().unwrap();
    let image = fs.device().snapshot();
    let saves = fs.metadata_store().saves();

    let err = fs.set_content("/b", b"y").unwrap_err();
    assert!(matches!(
        err,
        PfsError::NoSpace {
            requested: 1,
            available: 0
        }
    ));
    let err = fs.set_content("/a", &[b'x'; 95]).unwrap_err();
    assert!(matches!(err, PfsError::NoSpace { .. }));

    assert_eq!(fs.snapshot().unwrap(), snapshot);
    assert_eq!(fs.device().snapshot(), image);
    assert_eq!(fs.metadata_store().saves(), saves);
}

#[test]
fn largest_payload_is_capacity_minus_data_start() {
    let mut fs = mem_fs(100);
    fs.create("/a", NodeKind::File).unwrap();

    let too_big = vec![b'z'; 100 - DATA_START as usize + 1];
    assert!(matches!(
        fs.set_content("/a", &too_big),
        Err(PfsError::NoSpace {
            requested: 95,
            available: 94
        })
    ));
    assert!(fs.get_content("/a").unwrap().is_empty());

    fs.set_content("/a", &too_big[1..]).unwrap();
    assert_eq!(fs.get_content("/a").unwrap(), &too_big[1..]);
}

#[test]
fn fresh_file_is_empty_and_unallocated() {
    let mut fs = mem_fs(100);
    fs.create("/f", NodeKind::File).unwrap();
    assert!(fs.get_content("/f").unwrap().is_empty());
    let stat = fs.stat("/f").unwrap();
    assert_eq!(stat.size, Some(0));
    assert_eq!(stat.extent, None);
    assert_eq!(fs.usage().used_bytes, 0);
    assert_eq!(fs.list("/").unwrap()[0].size, Some(0));
}

#[test]
fn empty_payload_releases_the_extent() {
    let mut fs = mem_fs(100);
    touch(&mut fs, "/a", b"aaa");
    touch(&mut fs, "/b", b"bb");

    fs.set_content("/a", b"").expect("truncate");
    assert_eq!(extent_of(&fs, "/a"), None);
    assert_eq!(extent_of(&fs, "/b"), ext(6, 7));
    assert!(fs.get_content("/a").unwrap().is_empty());
    fs.check().unwrap();
}

#[test]
fn remove_dir_is_recursive_and_compacts() {
    let mut fs = mem_fs(100);
    fs.create("/d", NodeKind::Directory).unwrap();
    touch(&mut fs, "/d/x", b"xx");
    touch(&mut fs, "/keep", b"k");
    fs.create("/d/e", NodeKind::Directory).unwrap();
    touch(&mut fs, "/d/e/y", b"yyy");
    touch(&mut fs, "/last", b"ll");

    fs.remove_dir("/d").expect("rmdir");

    assert!(matches!(fs.stat("/d/e/y"), Err(PfsError::NotFound(_))));
    assert_eq!(extent_of(&fs, "/keep"), ext(6, 6));
    assert_eq!(extent_of(&fs, "/last"), ext(7, 8));
    assert_eq!(fs.get_content("/last").unwrap(), b"ll");
    assert_eq!(fs.usage().high_water_mark, 8);
    let names: Vec<String> = fs.list("/").unwrap().into_iter().map(|e| e.name).collect();
    assert_eq!(names, vec!["keep", "last"]);
    fs.check().unwrap();
}

#[test]
fn wrong_kind_and_missing_paths() {
    let mut fs = mem_fs(100);
    fs.create("/d", NodeKind::Directory).unwrap();
    fs.create("/f", NodeKind::File).unwrap();

    assert!(matches!(fs.get_content("/d"), Err(PfsError::IsDirectory(_))));
    assert!(matches!(fs.set_content("/d", b"x"), Err(PfsError::IsDirectory(_))));
    assert!(matches!(fs.remove_file("/d"), Err(PfsError::IsDirectory(_))));
    assert!(matches!(fs.list("/f"), Err(PfsError::NotDirectory(_))));
    assert!(matches!(fs.remove_dir("/f"), Err(PfsError::NotDirectory(_))));
    assert!(matches!(fs.create("/f/g", NodeKind::File), Err(PfsError::NotDirectory(_))));
    assert!(matches!(fs.create("/x/g", NodeKind::File), Err(PfsError::NotFound(_))));
    assert!(matches!(fs.get_content("/nope"), Err(PfsError::NotFound(_))));
    assert!(matches!(fs.create("/", NodeKind::Directory), Err(PfsError::Exists(_))));
    assert!(matches!(fs.remove_dir("/"), Err(PfsError::InvalidPath(_))));
    assert!(matches!(fs.get_content("/d/../f"), Err(PfsError::InvalidPath(_))));
    assert!(fs.list("d").unwrap().is_empty());
}

#[test]
fn repeated_separators_are_skipped() {
    let mut fs = mem_fs(100);
    fs.create("/d", NodeKind::Directory).unwrap();
    touch(&mut fs, "/d/f", b"abc");

    assert_eq!(fs.get_content("/d//f").unwrap(), b"abc");
    assert_eq!(fs.get_content("//d/f/").unwrap(), b"abc");

    fs.create("//g", NodeKind::File).unwrap();
    fs.set_content("/g", b"xy").unwrap();
    assert_eq!(fs.get_content("/g").unwrap(), b"xy");
    assert_eq!(fs.stat("g").unwrap().extent, ext(9, 10));

    assert!(matches!(fs.create("//", NodeKind::Directory), Err(PfsError::Exists(_))));
    assert!(matches!(fs.remove_dir("//"), Err(PfsError::InvalidPath(_))));
    fs.check().unwrap();
}

#[test]
fn list_reports_sizes_in_name_order() {
    let mut fs = mem_fs(100);
    touch(&mut fs, "/zeta", b"12345");
    fs.create("/alpha", NodeKind::Directory).unwrap();
    fs.create("/mid", NodeKind::File).unwrap();

    let rows: Vec<(String, NodeKind, Option<u64>)> = fs
        .list("/")
        .unwrap()
        .into_iter()
        .map(|e| (e.name, e.kind, e.size))
        .collect();
    assert_eq!(
        rows,
        vec![
            ("alpha".to_owned(), NodeKind::Directory, None),
            ("mid".to_owned(), NodeKind::File, Some(0)),
            ("zeta".to_owned(), NodeKind::File, Some(5)),
        ]
    );
}

// ── Random operation sequences ──────────────────────────────────────────────

const FILES: [&str; 5] = ["/a", "/b", "/c", "/d/x", "/d/y"];

#[derive(Debug, Clone)]
enum Op {
    Write(usize, Vec<u8>),
    Remove(usize),
    DropDir,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        6 => (0..FILES.len(), proptest::collection::vec(any::<u8>(), 0..40))
            .prop_map(|(i, bytes)| Op::Write(i, bytes)),
        2 => (0..FILES.len()).prop_map(Op::Remove),
        1 => Just(Op::DropDir),
    ]
}

fn ensure_file(fs: &mut MemFs, path: &str) {
    if path.starts_with("/d/") && fs.stat("/d").is_err() {
        fs.create("/d", NodeKind::Directory).unwrap();
    }
    if fs.stat(path).is_err() {
        fs.create(path, NodeKind::File).unwrap();
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn packing_holds_after_any_operation_sequence(
        ops in proptest::collection::vec(op_strategy(), 1..50),
    ) {
        let mut fs = mem_fs(256);
        let mut model: BTreeMap<&str, Vec<u8>> = BTreeMap::new();

        for op in ops {
            match op {
                Op::Write(i, bytes) => {
                    let path = FILES[i];
                    ensure_file(&mut fs, path);
                    let before = fs.snapshot().unwrap();
                    match fs.set_content(path, &bytes) {
                        Ok(()) => {
                            model.insert(path, bytes);
                        }
                        Err(PfsError::NoSpace { .. }) => {
                            prop_assert_eq!(fs.snapshot().unwrap(), before);
                        }
                        Err(other) => prop_assert!(false, "unexpected error: {other}"),
                    }
                }
                Op::Remove(i) => {
                    let path = FILES[i];
                    if model.remove(path).is_some() {
                        fs.remove_file(path).unwrap();
                    }
                }
                Op::DropDir => {
                    if fs.stat("/d").is_ok() {
                        fs.remove_dir("/d").unwrap();
                        model.retain(|path, _| !path.starts_with("/d/"));
                    }
                }
            }

            prop_assert!(fs.check().is_ok());
            let used: usize = model.values().map(Vec::len).sum();
            prop_assert_eq!(fs.usage().used_bytes, used as u64);
            for (path, bytes) in &model {
                prop_assert_eq!(&fs.get_content(path).unwrap(), bytes);
            }
        }
    }
}
