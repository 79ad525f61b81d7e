// Variant-R mercy recovery from candidate files against the solid bitmap

use sdbg_common::bytes::write_u64_le;
use sdbg_common::AtomicBitVector;
use sdbg_core::{mercy, stream_path, SequencePackage};
use std::fs::File;
use std::path::Path;

const K: usize = 5;
const MAX_READ_LEN: usize = 20;

fn offset_bits() -> u32 {
    // 20 positions fit in 5 bits
    5
}

fn cand_record(read_id: u64, offset: u64, kind: u64) -> u64 {
    (read_id << (offset_bits() + 2)) | (offset << 2) | kind
}

fn write_cand_file(prefix: &Path, fid: usize, records: &[u64]) {
    let path = stream_path(prefix, &format!(".mercy_cand.{fid}"));
    let mut f = File::create(path).unwrap();
    for &r in records {
        write_u64_le(&mut f, r).unwrap();
    }
}

#[test]
fn gap_between_no_out_and_no_in_is_rescued() {
    let dir = tempfile::tempdir().unwrap();
    let prefix = dir.path().join("graph");

    let mut package = SequencePackage::new();
    package.append_seq(&vec![0u8; 20]); // one 20-base read

    let stride = MAX_READ_LEN - K + 1;
    let is_solid = AtomicBitVector::with_len(stride);
    for p in [0, 1, 2, 10, 11, 12, 13, 14] {
        is_solid.set(p);
    }

    // the counter flagged position 3 as missing its outgoing edge and
    // position 10 as missing its incoming edge
    write_cand_file(
        &prefix,
        0,
        &[cand_record(0, 3, 2), cand_record(0, 10, 1)],
    );

    let num_mercy =
        mercy::resolve_read_mercy(&package, &is_solid, K, MAX_READ_LEN, &prefix, 1).unwrap();
    assert_eq!(num_mercy, 7);
    for p in 3..10 {
        assert!(is_solid.get(p), "position {p} should be rescued");
    }
    assert_eq!(is_solid.count_ones(), 15);
}

#[test]
fn no_in_before_no_out_short_circuits() {
    // A no-in position preceding every no-out position cannot bracket a
    // gap; the read is skipped untouched.
    let dir = tempfile::tempdir().unwrap();
    let prefix = dir.path().join("graph");

    let mut package = SequencePackage::new();
    package.append_seq(&vec![1u8; 20]);

    let stride = MAX_READ_LEN - K + 1;
    let is_solid = AtomicBitVector::with_len(stride);
    is_solid.set(0);
    is_solid.set(10);

    write_cand_file(
        &prefix,
        0,
        &[cand_record(0, 2, 1), cand_record(0, 9, 2)],
    );

    let num_mercy =
        mercy::resolve_read_mercy(&package, &is_solid, K, MAX_READ_LEN, &prefix, 1).unwrap();
    assert_eq!(num_mercy, 0);
    assert_eq!(is_solid.count_ones(), 2);
}

#[test]
fn candidates_split_across_files() {
    // Two reads, one candidate pair per file
    let dir = tempfile::tempdir().unwrap();
    let prefix = dir.path().join("graph");

    let mut package = SequencePackage::new();
    package.append_seq(&vec![0u8; 20]);
    package.append_seq(&vec![2u8; 20]);

    let stride = MAX_READ_LEN - K + 1;
    let is_solid = AtomicBitVector::with_len(2 * stride);
    for p in [0, 1, 5, 6] {
        is_solid.set(p); // read 0: solid 0..2, 5..7
    }
    for p in [stride, stride + 4] {
        is_solid.set(p); // read 1: solid at 0 and 4
    }

    write_cand_file(
        &prefix,
        0,
        &[cand_record(0, 2, 2), cand_record(0, 5, 1)],
    );
    write_cand_file(
        &prefix,
        1,
        &[cand_record(1, 1, 2), cand_record(1, 4, 1)],
    );

    let num_mercy =
        mercy::resolve_read_mercy(&package, &is_solid, K, MAX_READ_LEN, &prefix, 2).unwrap();
    // read 0 bridges 2..5 (3 positions), read 1 bridges 1..4 (3 positions)
    assert_eq!(num_mercy, 6);
    for p in 2..5 {
        assert!(is_solid.get(p));
    }
    for p in 1..4 {
        assert!(is_solid.get(stride + p));
    }
}
