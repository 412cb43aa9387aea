use reftable::block_source::{BufBlockSource, FileBlockSource};
use reftable::options::WriteOptions;
use reftable::reader::Reader;
use reftable::record::{RefRecord, RefValue};
use reftable::stack::Stack;
use reftable::writer::Writer;

fn hash(b: u8) -> Vec<u8> {
    vec![b; 20]
}

#[test]
fn write_read_full_table_round_trip() {
    let mut out = Vec::new();
    let mut opts = WriteOptions::default();
    opts.block_size = 512;
    let mut w = Writer::new(&mut out, opts);
    w.set_limits(1, 1);

    let names: Vec<String> = (0..200).map(|i| format!("refs/heads/branch-{i:04}")).collect();
    for (i, name) in names.iter().enumerate() {
        w.add_ref(&RefRecord {
            ref_name: name.clone(),
            update_index: 1,
            value: RefValue::Direct { value: hash((i % 256) as u8) },
        })
        .unwrap();
    }
    let stats = w.close().unwrap();
    assert!(stats.ref_blocks > 1, "expected the scan to span multiple blocks");

    let reader = Reader::open(Box::new(BufBlockSource::new(out))).unwrap();
    for (i, name) in names.iter().enumerate() {
        let mut it = reader.seek_ref(name).unwrap();
        let rec = it.next_ref().unwrap().unwrap();
        assert_eq!(rec.ref_name, *name);
        assert_eq!(rec.value, RefValue::Direct { value: hash((i % 256) as u8) });
    }
}

#[test]
fn indexed_seek_matches_full_scan() {
    let mut opts = WriteOptions::default();
    opts.block_size = 256;
    opts.restart_interval = 4;
    let mut out = Vec::new();
    let mut w = Writer::new(&mut out, opts);
    w.set_limits(1, 1);
    for i in 0..500u32 {
        w.add_ref(&RefRecord {
            ref_name: format!("refs/heads/b{i:05}"),
            update_index: 1,
            value: RefValue::Direct { value: hash((i % 250) as u8) },
        })
        .unwrap();
    }
    w.close().unwrap();

    let reader = Reader::open(Box::new(BufBlockSource::new(out))).unwrap();
    let mut scan = reader.seek_ref("").unwrap();
    let mut names = Vec::new();
    while let Some(rec) = scan.next_ref().unwrap() {
        names.push(rec.ref_name);
    }
    assert_eq!(names.len(), 500);

    for name in &names {
        let mut it = reader.seek_ref(name).unwrap();
        let rec = it.next_ref().unwrap().unwrap();
        assert_eq!(&rec.ref_name, name);
    }
}

/// With a small enough block size and too few leaf blocks to clear
/// `Writer`'s index threshold, a ref section gets no top-level index at
/// all (`seek` falls straight through to the linear `start` offset) while
/// still spanning more than one block. `seek_from` has to walk forward
/// from the first block to find the one actually covering a later key.
#[test]
fn linear_seek_crosses_block_boundary_with_no_index() {
    let mut opts = WriteOptions::default();
    opts.block_size = 150;
    let mut out = Vec::new();
    let mut w = Writer::new(&mut out, opts);
    w.set_limits(1, 1);
    let names: Vec<String> = (0..10u8).map(|i| format!("k{i}")).collect();
    for (i, name) in names.iter().enumerate() {
        w.add_ref(&RefRecord {
            ref_name: name.clone(),
            update_index: 1,
            value: RefValue::Direct { value: hash(i as u8) },
        })
        .unwrap();
    }
    let stats = w.close().unwrap();
    assert!(
        (2..=3).contains(&stats.ref_blocks),
        "expected a handful of un-indexed ref blocks, got {}",
        stats.ref_blocks
    );

    let reader = Reader::open(Box::new(BufBlockSource::new(out))).unwrap();
    for (i, name) in names.iter().enumerate() {
        let mut it = reader.seek_ref(name).unwrap();
        let rec = it.next_ref().unwrap().unwrap();
        assert_eq!(&rec.ref_name, name);
        assert_eq!(rec.value, RefValue::Direct { value: hash(i as u8) });
    }
}

/// Force the ref section's top-level index itself to span more than one
/// block: enough leaf blocks to need an index, and a block size tight
/// enough that the final (threshold-satisfying) index level still doesn't
/// fit in a single block. The footer only records the first such block's
/// offset, so `descend_index` must walk its siblings to find the one
/// whose key range actually covers a later ref name.
#[test]
fn descend_index_crosses_block_boundary_in_top_level() {
    let mut opts = WriteOptions::default();
    opts.block_size = 80;
    opts.skip_index_objects = true;
    let mut out = Vec::new();
    let mut w = Writer::new(&mut out, opts);
    w.set_limits(1, 1);
    let names: Vec<String> = (0..40u32).map(|i| format!("k{i:02}")).collect();
    for (i, name) in names.iter().enumerate() {
        w.add_ref(&RefRecord {
            ref_name: name.clone(),
            update_index: 1,
            value: RefValue::Direct { value: hash(i as u8) },
        })
        .unwrap();
    }
    let stats = w.close().unwrap();
    assert!(stats.ref_blocks >= 15, "expected many small ref blocks, got {}", stats.ref_blocks);
    assert!(
        stats.index_blocks >= 2,
        "expected the top-level ref index to span multiple blocks, got {}",
        stats.index_blocks
    );

    let reader = Reader::open(Box::new(BufBlockSource::new(out))).unwrap();
    for (i, name) in names.iter().enumerate() {
        let mut it = reader.seek_ref(name).unwrap();
        let rec = it.next_ref().unwrap().unwrap();
        assert_eq!(&rec.ref_name, name);
        assert_eq!(rec.value, RefValue::Direct { value: hash(i as u8) });
    }
}

#[test]
fn refs_for_object_via_obj_index() {
    let mut out = Vec::new();
    let mut w = Writer::new(&mut out, WriteOptions::default());
    w.set_limits(1, 1);
    let target = hash(42);
    w.add_ref(&RefRecord {
        ref_name: "refs/heads/a".into(),
        update_index: 1,
        value: RefValue::Direct { value: hash(1) },
    })
    .unwrap();
    w.add_ref(&RefRecord {
        ref_name: "refs/heads/target".into(),
        update_index: 1,
        value: RefValue::Direct { value: target.clone() },
    })
    .unwrap();
    w.close().unwrap();

    let reader = Reader::open(Box::new(BufBlockSource::new(out))).unwrap();
    let offsets = reader.obj_offsets_for(&target).unwrap();
    assert!(!offsets.is_empty());

    let mut it = reftable::iter::IndexedTableRefIter::new(&reader, offsets);
    let mut seen_target = false;
    while let Some(rec) = it.next().unwrap() {
        if rec.ref_name == "refs/heads/target" {
            assert_eq!(rec.value, RefValue::Direct { value: target.clone() });
            seen_target = true;
        }
    }
    assert!(seen_target);
}

#[test]
fn corrupt_footer_crc_is_rejected() {
    let mut out = Vec::new();
    let mut w = Writer::new(&mut out, WriteOptions::default());
    w.set_limits(1, 1);
    w.add_ref(&RefRecord {
        ref_name: "refs/heads/main".into(),
        update_index: 1,
        value: RefValue::Direct { value: hash(1) },
    })
    .unwrap();
    w.close().unwrap();

    let last = out.len() - 1;
    out[last] ^= 0xff;

    let err = Reader::open(Box::new(BufBlockSource::new(out)));
    assert!(err.is_err());
}

#[test]
fn stack_add_survives_reopen() {
    let tmp = tempfile::tempdir().unwrap();

    {
        let mut stack = Stack::open(tmp.path(), WriteOptions::default()).unwrap();
        stack
            .add(|w| {
                w.add_ref(&RefRecord {
                    ref_name: "refs/heads/main".into(),
                    update_index: w.min_update_index(),
                    value: RefValue::Direct { value: hash(3) },
                })
            })
            .unwrap();
    }

    let mut reopened = Stack::open(tmp.path(), WriteOptions::default()).unwrap();
    let rec = reopened.seek_ref("refs/heads/main").unwrap().unwrap();
    assert_eq!(rec.value, RefValue::Direct { value: hash(3) });
    assert_eq!(reopened.next_update_index(), 2);
}

#[test]
fn rejects_directory_file_name_conflicts() {
    use reftable::refname::{validate_batch, PendingChange};

    let changes = vec![
        PendingChange { name: "refs/heads/a", deletion: false },
        PendingChange { name: "refs/heads/a/b", deletion: false },
    ];
    assert!(validate_batch(&changes, |_| Ok(false), |_| Ok(false)).is_err());
}

#[test]
fn file_block_source_reads_real_file() {
    let tmp = tempfile::NamedTempFile::new().unwrap();
    {
        let mut w = Writer::new(tmp.reopen().unwrap(), WriteOptions::default());
        w.set_limits(1, 1);
        w.add_ref(&RefRecord {
            ref_name: "refs/heads/main".into(),
            update_index: 1,
            value: RefValue::Direct { value: hash(9) },
        })
        .unwrap();
        w.close().unwrap();
    }

    let src = FileBlockSource::open(tmp.path()).unwrap();
    let reader = Reader::open(Box::new(src)).unwrap();
    let mut it = reader.seek_ref("refs/heads/main").unwrap();
    let rec = it.next_ref().unwrap().unwrap();
    assert_eq!(rec.value, RefValue::Direct { value: hash(9) });
}
