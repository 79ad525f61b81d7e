// End-to-end read pipeline: packed reads + solid bitmap in, SdBG files out

use sdbg_common::AtomicBitVector;
use sdbg_core::{build_sdbg_from_reads, stream_path, BuildStats, ReadsInput, SdbgConfig, SequencePackage};
use std::path::Path;

fn encode(s: &str) -> Vec<u8> {
    s.bytes()
        .map(|c| match c {
            b'A' => 0,
            b'C' => 1,
            b'G' => 2,
            b'T' => 3,
            _ => panic!("bad base {c}"),
        })
        .collect()
}

fn test_config(prefix: &Path, kmer_k: usize, max_read_length: usize) -> SdbgConfig {
    let mut cfg = SdbgConfig::default();
    cfg.kmer_k = kmer_k;
    cfg.max_read_length = max_read_length;
    cfg.num_cpu_threads = 2;
    cfg.num_output_threads = 2;
    cfg.host_mem = 1 << 30;
    cfg.mem_flag = 0;
    cfg.output_prefix = prefix.to_path_buf();
    cfg
}

/// Reads + an all-solid bitmap over every full (k+1)-mer position.
fn all_solid_input(reads: &[&str], kmer_k: usize, max_read_length: usize) -> ReadsInput {
    let mut package = SequencePackage::new();
    for r in reads {
        package.append_seq(&encode(r));
    }
    let stride = max_read_length - kmer_k + 1;
    let is_solid = AtomicBitVector::with_len(package.size() as usize * stride);
    for (rid, r) in reads.iter().enumerate() {
        for pos in 0..r.len().saturating_sub(kmer_k) {
            is_solid.set(rid * stride + pos);
        }
    }
    ReadsInput { package, is_solid }
}

fn read_w(prefix: &Path, n: usize) -> Vec<u8> {
    let bytes = std::fs::read(stream_path(prefix, ".w")).unwrap();
    let words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
        .collect();
    (0..n)
        .map(|i| ((words[i / 8] >> (4 * (i % 8))) & 0xF) as u8)
        .collect()
}

fn read_bits(prefix: &Path, ext: &str, n: usize) -> Vec<bool> {
    let bytes = std::fs::read(stream_path(prefix, ext)).unwrap();
    let words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
        .collect();
    (0..n).map(|i| (words[i / 32] >> (i % 32)) & 1 == 1).collect()
}

fn read_f_lines(prefix: &Path) -> Vec<i64> {
    std::fs::read_to_string(stream_path(prefix, ".f"))
        .unwrap()
        .lines()
        .map(|l| l.parse().unwrap())
        .collect()
}

fn check_stream_consistency(prefix: &Path, stats: &BuildStats, kmer_k: usize) {
    let n = stats.total_edges as usize;
    // every per-edge stream advanced in lock-step
    let mul = std::fs::read(stream_path(prefix, ".mul")).unwrap();
    assert_eq!(mul.len(), n);
    let last = read_bits(prefix, ".last", n);
    assert_eq!(
        last.iter().filter(|&&b| b).count() as u64,
        stats.num_ones_in_last
    );
    let isd = read_bits(prefix, ".isd", n);
    assert_eq!(
        isd.iter().filter(|&&b| b).count() as u64,
        stats.num_dollar_nodes
    );
    let w = read_w(prefix, n);
    for c in 0..9u8 {
        assert_eq!(
            w.iter().filter(|&&x| x == c).count() as u64,
            stats.chars_in_w[c as usize]
        );
    }
    // .f trailer: total edges, k, dollar count
    let f = read_f_lines(prefix);
    assert_eq!(f[0], -1);
    assert_eq!(f[f.len() - 3], stats.total_edges as i64);
    assert_eq!(f[f.len() - 2], kmer_k as i64);
    assert_eq!(f[f.len() - 1], stats.num_dollar_nodes as i64);
    // cumulative counts never decrease
    for pair in f[1..f.len() - 2].windows(2) {
        assert!(pair[0] <= pair[1]);
    }
}

#[test]
fn single_read_with_boundaries() {
    let dir = tempfile::tempdir().unwrap();
    let prefix = dir.path().join("graph");
    let cfg = test_config(&prefix, 4, 15);
    let mut input = all_solid_input(&["AAAACCCC"], 4, 15);
    let stats = build_sdbg_from_reads(&cfg, &mut input).unwrap();

    // 4 solid edges on each strand plus one boundary record per terminus
    // and strand
    assert_eq!(stats.total_edges, 12);
    assert_eq!(stats.num_dollar_nodes, 2);
    assert_eq!(stats.num_dummy_edges, 2);
    assert_eq!(stats.num_ones_in_last, 10);
    assert_eq!(stats.chars_in_w, [2, 4, 1, 4, 1, 0, 0, 0, 0]);

    let mul = std::fs::read(stream_path(&prefix, ".mul")).unwrap();
    assert_eq!(mul, vec![0, 1, 1, 1, 0, 1, 0, 1, 1, 1, 0, 1]);
    let isd = read_bits(&prefix, ".isd", 12);
    let dollar_positions: Vec<usize> =
        isd.iter().enumerate().filter(|(_, &b)| b).map(|(i, _)| i).collect();
    assert_eq!(dollar_positions, vec![4, 10]);

    // one cumulative line per observed leading-base transition
    assert_eq!(read_f_lines(&prefix), vec![-1, 0, 4, 6, 10, 12, 4, 2]);
    check_stream_consistency(&prefix, &stats, 4);
}

#[test]
fn circularizing_read_merges_strand_duplicates() {
    // ACGTACGT: every (k+1)-mer's reverse complement is itself another
    // edge of the read, so boundary records collapse into the solid ones
    // and every edge is observed exactly twice.
    let dir = tempfile::tempdir().unwrap();
    let prefix = dir.path().join("graph");
    let cfg = test_config(&prefix, 4, 15);
    let mut input = all_solid_input(&["ACGTACGT"], 4, 15);
    let stats = build_sdbg_from_reads(&cfg, &mut input).unwrap();

    assert_eq!(stats.total_edges, 4);
    assert_eq!(stats.num_dollar_nodes, 0);
    assert_eq!(stats.num_dummy_edges, 0);
    assert_eq!(stats.num_ones_in_last, 4);

    assert_eq!(read_w(&prefix, 4), vec![4, 1, 2, 3]);
    assert_eq!(
        std::fs::read(stream_path(&prefix, ".mul")).unwrap(),
        vec![2, 2, 2, 2]
    );
    assert_eq!(read_f_lines(&prefix), vec![-1, 0, 1, 2, 3, 4, 4, 0]);
    check_stream_consistency(&prefix, &stats, 4);
}

#[test]
fn palindromic_edge_is_emitted_once() {
    // k=3, read ACGT: the only (k+1)-mer equals its own reverse
    // complement; it must contribute a single solid record.
    let dir = tempfile::tempdir().unwrap();
    let prefix = dir.path().join("graph");
    let cfg = test_config(&prefix, 3, 15);
    let mut input = all_solid_input(&["ACGT"], 3, 15);
    let stats = build_sdbg_from_reads(&cfg, &mut input).unwrap();

    assert_eq!(stats.total_edges, 3);
    assert_eq!(stats.num_dollar_nodes, 1);
    // exactly one record carries the palindromic edge (W = A+1)
    assert_eq!(stats.chars_in_w[1], 1);
    assert_eq!(read_w(&prefix, 3), vec![0, 1, 2]);
    check_stream_consistency(&prefix, &stats, 3);
}

#[test]
fn multiple_reads_accumulate_multiplicity() {
    // The same read three times: solid records triple their counts,
    // everything else is unchanged.
    let dir = tempfile::tempdir().unwrap();
    let prefix = dir.path().join("graph");
    let cfg = test_config(&prefix, 4, 15);
    let mut input = all_solid_input(&["ACGTACGT", "ACGTACGT", "ACGTACGT"], 4, 15);
    let stats = build_sdbg_from_reads(&cfg, &mut input).unwrap();

    assert_eq!(stats.total_edges, 4);
    assert_eq!(
        std::fs::read(stream_path(&prefix, ".mul")).unwrap(),
        vec![6, 6, 6, 6]
    );
    check_stream_consistency(&prefix, &stats, 4);
}

#[test]
fn solid_gaps_produce_inner_boundaries() {
    // Only the first and last (k+1)-mers of AAAACCCC are solid: the two
    // middle edges vanish and each solid edge gets its own boundaries.
    let dir = tempfile::tempdir().unwrap();
    let prefix = dir.path().join("graph");
    let cfg = test_config(&prefix, 4, 15);
    let mut input = all_solid_input(&["AAAACCCC"], 4, 15);
    let stride = 15 - 4 + 1;
    // clear positions 1 and 2 by rebuilding the bitmap
    let is_solid = AtomicBitVector::with_len(stride);
    is_solid.set(0);
    is_solid.set(3);
    input.is_solid = is_solid;
    let stats = build_sdbg_from_reads(&cfg, &mut input).unwrap();

    // each solid edge on each strand: 1 solid + left/right boundary
    // records, none of them mergeable
    assert_eq!(stats.chars_in_w[0], 4);
    assert_eq!(stats.num_dollar_nodes, 4);
    assert_eq!(stats.total_edges, 12);
    check_stream_consistency(&prefix, &stats, 4);
}
