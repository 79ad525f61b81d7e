// Mercy edge recovery
// Rescues (k+1)-mers bridging two solid stretches of a single read that the
// abundance filter dropped. Variant R works on the solid bitmap before the
// graph is built, from candidate files produced by the counting pass.
// Variant E runs on an already-sorted edge package, probing it by binary
// search while a prefetch thread keeps read batches coming.

use crate::kmer::Kmer;
use crate::packed_seq::SequencePackage;
use crate::sdbg_writer::stream_path;
use anyhow::{Context, Result};
use crossbeam::channel::bounded;
use rayon::prelude::*;
use rdst::RadixSort;
use sdbg_common::bytes::read_u64_array;
use sdbg_common::{AtomicBitVector, Multiplicity};
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::ops::Range;
use std::path::Path;
use std::sync::Mutex;
use std::thread;
use std::time::Instant;
use tracing::{debug, info};

/// Candidate record kinds in a `.mercy_cand` file
const CAND_NO_IN: u64 = 1;
const CAND_NO_OUT: u64 = 2;

/// Bits needed to hold an in-read offset up to `max_read_length`.
pub(crate) fn offset_num_bits(max_read_length: usize) -> u32 {
    let mut bits = 1;
    while (1usize << bits) - 1 < max_read_length {
        bits += 1;
    }
    bits
}

/// Variant R: consume the `.mercy_cand.<fid>` files and flip solid bits for
/// every in-read gap between a no-out position and a later no-in position.
/// Returns the number of rescued positions. Best-effort: an absent rescue is
/// not an error.
pub fn resolve_read_mercy(
    package: &SequencePackage,
    is_solid: &AtomicBitVector,
    kmer_k: usize,
    max_read_length: usize,
    output_prefix: &Path,
    num_mercy_files: usize,
) -> Result<u64> {
    let timer = Instant::now();
    let offset_bits = offset_num_bits(max_read_length);
    let offset_mask = (1u64 << offset_bits) - 1;
    let num_k1_per_read = max_read_length - kmer_k + 1;
    let read_marker = AtomicBitVector::with_len(package.size() as usize);
    let num_threads = rayon::current_num_threads();

    let mut num_mercy = 0u64;
    for fid in 0..num_mercy_files {
        let path = stream_path(output_prefix, &format!(".mercy_cand.{fid}"));
        let mut cands = read_u64_array(&path)
            .with_context(|| format!("failed to load mercy candidates {}", path.display()))?;
        debug!(file = %path.display(), records = cands.len(), "mercy candidate file");
        cands.radix_sort_unstable();

        // Partition on read boundaries so each read is owned by one worker
        let read_of = |record: u64| record >> (offset_bits + 2);
        let avg = cands.len().div_ceil(num_threads);
        let mut ranges: Vec<Range<usize>> = Vec::with_capacity(num_threads);
        let mut start = 0;
        for _ in 0..num_threads {
            let mut end = (start + avg).min(cands.len());
            while end > 0 && end < cands.len() && read_of(cands[end]) == read_of(cands[end - 1]) {
                end += 1;
            }
            ranges.push(start..end);
            start = end;
        }

        num_mercy += ranges
            .par_iter()
            .map(|range| {
                let mut no_in = vec![false; max_read_length + 1];
                let mut no_out = vec![false; max_read_length + 1];
                let mut has_solid_kmer = vec![false; max_read_length + 1];
                let mut rescued = 0u64;

                let mut i = range.start;
                while i < range.end {
                    let read_id = read_of(cands[i]);
                    debug_assert!(
                        !read_marker.get(read_id as usize),
                        "candidates of one read must land in one file"
                    );
                    read_marker.set(read_id as usize);

                    no_in.fill(false);
                    no_out.fill(false);
                    has_solid_kmer.fill(false);
                    let mut first_no_out = i64::MAX;
                    let mut last_no_in = -1i64;

                    while i < range.end && read_of(cands[i]) == read_id {
                        let off = ((cands[i] >> 2) & offset_mask) as usize;
                        match cands[i] & 3 {
                            CAND_NO_OUT => {
                                no_out[off] = true;
                                first_no_out = first_no_out.min(off as i64);
                            }
                            CAND_NO_IN => {
                                no_in[off] = true;
                                last_no_in = last_no_in.max(off as i64);
                            }
                            _ => {}
                        }
                        has_solid_kmer[off] = true;
                        i += 1;
                    }
                    // Only worth scanning when a no-in position can follow a
                    // no-out position
                    if last_no_in < first_no_out {
                        continue;
                    }

                    let read_len = package.length(read_id);
                    for p in 0..read_len.saturating_sub(kmer_k) {
                        if is_solid.get(read_id as usize * num_k1_per_read + p) {
                            has_solid_kmer[p] = true;
                            has_solid_kmer[p + 1] = true;
                        }
                    }

                    let mut last_no_out = -1i64;
                    for p in 0..(read_len + 1).saturating_sub(kmer_k) {
                        if no_in[p] && last_no_out != -1 {
                            for j in last_no_out as usize..p {
                                is_solid.set(read_id as usize * num_k1_per_read + j);
                            }
                            rescued += p as u64 - last_no_out as u64;
                        }
                        if has_solid_kmer[p] {
                            last_no_out = -1;
                        }
                        if no_out[p] {
                            last_no_out = p as i64;
                        }
                    }
                }
                rescued
            })
            .sum::<u64>();
    }

    info!(num_mercy, elapsed = ?timer.elapsed(), "mercy bitmap recovery done");
    Ok(num_mercy)
}

/// Stream of read batches for variant E. An empty package ends the stream.
pub trait ReadBatchSource: Send {
    fn next_batch(&mut self) -> Result<SequencePackage>;
}

/// Batch source over pre-built packages, mostly for tests and small inputs.
pub struct InMemoryBatchSource {
    batches: VecDeque<SequencePackage>,
}

impl InMemoryBatchSource {
    pub fn new(batches: Vec<SequencePackage>) -> Self {
        InMemoryBatchSource {
            batches: batches.into(),
        }
    }
}

impl ReadBatchSource for InMemoryBatchSource {
    fn next_batch(&mut self) -> Result<SequencePackage> {
        Ok(self.batches.pop_front().unwrap_or_default())
    }
}

/// 8-base prefix over the first packed word
const LOOKUP_PREFIX_CHARS: usize = 8;
const LOOKUP_SHIFT: u32 = 16;
const LOOKUP_SIZE: usize = 1 << 16;

/// Per-prefix [first, last] edge index table over the sorted edge package.
fn init_lookup_table(package: &SequencePackage) -> Vec<i64> {
    let mut table = vec![-1i64; LOOKUP_SIZE * 2];
    if package.is_empty() {
        return table;
    }

    let prefix_of =
        |i: u64| (package.kmer_at(i, 0, LOOKUP_PREFIX_CHARS).data[0] >> LOOKUP_SHIFT) as usize;

    let mut cur_prefix = prefix_of(0);
    table[cur_prefix * 2] = 0;
    for i in 1..package.size() {
        let prefix = prefix_of(i);
        if prefix > cur_prefix {
            table[cur_prefix * 2 + 1] = i as i64 - 1;
            cur_prefix = prefix;
            table[cur_prefix * 2] = i as i64;
        } else {
            debug_assert_eq!(prefix, cur_prefix, "edge package must be sorted");
        }
    }
    table[cur_prefix * 2 + 1] = package.size() as i64 - 1;
    table
}

/// Binary search for the first `n_chars` bases of `kmer` among the sorted
/// edges. Returns the matching edge id or -1.
fn binary_search_kmer(
    kmer: &Kmer,
    table: &[i64],
    package: &SequencePackage,
    n_chars: usize,
) -> i64 {
    let prefix = (kmer.data[0] >> LOOKUP_SHIFT) as usize;
    let mut l = table[prefix * 2];
    if l == -1 {
        return -1;
    }
    let mut r = table[prefix * 2 + 1];
    while l <= r {
        let mid = (l + r) / 2;
        let mid_kmer = package.kmer_at(mid as u64, 0, n_chars);
        match kmer.cmp_k(&mid_kmer, n_chars) {
            Ordering::Greater => l = mid + 1,
            Ordering::Less => r = mid - 1,
            Ordering::Equal => return mid,
        }
    }
    -1
}

/// Variant E: probe the sorted edge package for every read position, and on
/// each no-in -> no-out transition append the bridging (k+1)-mers as new
/// edges with multiplicity 1. Returns the number of edges added.
pub fn gen_mercy_edges(
    package: &mut SequencePackage,
    multiplicity: &mut Vec<Multiplicity>,
    kmer_k: usize,
    mut reads: Box<dyn ReadBatchSource>,
) -> Result<u64> {
    let timer = Instant::now();
    let table = init_lookup_table(package);

    // Prefetch thread: the next batch loads while the current one is probed
    let (batch_tx, batch_rx) = bounded::<Result<SequencePackage>>(1);
    let reader = thread::spawn(move || loop {
        let batch = reads.next_batch();
        let done = batch.as_ref().map(|p| p.is_empty()).unwrap_or(true);
        if batch_tx.send(batch).is_err() || done {
            break;
        }
    });

    let mut num_mercy_edges = 0u64;
    let mut num_mercy_reads = 0u64;
    let result: Result<()> = (|| {
        while let Ok(batch) = batch_rx.recv() {
            let rp = batch?;
            if rp.is_empty() {
                break;
            }
            num_mercy_reads += rp.size();

            let mercy_edges: Mutex<Vec<Kmer>> = Mutex::new(Vec::new());
            num_mercy_edges += (0..rp.size())
                .into_par_iter()
                .map(|read_id| probe_read(package, &table, kmer_k, &rp, read_id, &mercy_edges))
                .sum::<u64>();

            for edge in mercy_edges.into_inner().expect("mercy edge lock") {
                package.append_packed(&edge.data, kmer_k + 1);
            }
        }
        Ok(())
    })();
    // Unblock the reader if it is mid-send, then reap it
    drop(batch_rx);
    reader.join().ok();
    result?;

    multiplicity.extend(std::iter::repeat(1).take(num_mercy_edges as usize));
    info!(
        num_mercy_reads,
        num_mercy_edges,
        elapsed = ?timer.elapsed(),
        "mercy edge search done"
    );
    Ok(num_mercy_edges)
}

/// Classify every position of one read as has-in/has-out against the edge
/// package, then emit the bridging (k+1)-mers of each rescued gap.
fn probe_read(
    package: &SequencePackage,
    table: &[i64],
    kmer_k: usize,
    rp: &SequencePackage,
    read_id: u64,
    mercy_edges: &Mutex<Vec<Kmer>>,
) -> u64 {
    let read_len = rp.length(read_id);
    if read_len < kmer_k + 2 {
        return 0;
    }

    let mut has_in = vec![false; read_len];
    let mut has_out = vec![false; read_len];
    let mut kmer = rp.kmer_at(read_id, 0, kmer_k);
    let mut rev_kmer = kmer;
    rev_kmer.reverse_complement(kmer_k);

    for i in 0..=(read_len - kmer_k) {
        if !has_in[i] {
            if binary_search_kmer(&rev_kmer, table, package, kmer_k) != -1 {
                has_in[i] = true;
            } else {
                // Try the four left extensions; rev_kmer capped at base T
                // bounds the canonical-order search
                rev_kmer.set_base(kmer_k, 3);
                kmer.shift_preappend(0, kmer_k + 1);
                for c in 0..4 {
                    kmer.set_base(0, c);
                    if kmer.cmp_k(&rev_kmer, kmer_k + 1) == Ordering::Greater {
                        break;
                    }
                    if binary_search_kmer(&kmer, table, package, kmer_k + 1) != -1 {
                        has_in[i] = true;
                        break;
                    }
                }
                rev_kmer.set_base(kmer_k, 0);
                kmer.shift_append(0, kmer_k + 1);
            }
        }

        let edge_id = binary_search_kmer(&kmer, table, package, kmer_k);
        if edge_id != -1 {
            has_out[i] = true;
            // The found edge also certifies the next position's incoming
            // edge when its closing base matches the read
            if i + kmer_k < read_len
                && package.get_base(edge_id as u64, kmer_k) == rp.get_base(read_id, i + kmer_k)
            {
                has_in[i + 1] = true;
            }
        } else {
            kmer.set_base(kmer_k, 3);
            let next_char = if i + kmer_k < read_len {
                3 - rp.get_base(read_id, i + kmer_k)
            } else {
                0
            };
            rev_kmer.shift_preappend(next_char, kmer_k + 1);
            if rev_kmer.cmp_k(&kmer, kmer_k + 1) != Ordering::Greater
                && binary_search_kmer(&rev_kmer, table, package, kmer_k + 1) != -1
            {
                has_out[i] = true;
                has_in[i + 1] = true;
            } else {
                for c in 0..4 {
                    if c == next_char {
                        continue;
                    }
                    rev_kmer.set_base(0, c);
                    if rev_kmer.cmp_k(&kmer, kmer_k + 1) == Ordering::Greater {
                        break;
                    }
                    if binary_search_kmer(&rev_kmer, table, package, kmer_k + 1) != -1 {
                        has_out[i] = true;
                        break;
                    }
                }
            }
            kmer.set_base(kmer_k, 0);
            rev_kmer.shift_append(0, kmer_k + 1);
        }

        if i + kmer_k < read_len {
            let next = rp.get_base(read_id, i + kmer_k);
            kmer.shift_append(next, kmer_k);
            rev_kmer.shift_preappend(3 - next, kmer_k);
        }
    }

    let mut rescued = 0u64;
    let mut last_no_out = -1i64;
    for i in 0..=(read_len - kmer_k) {
        match (has_in[i], has_out[i]) {
            (true, false) => last_no_out = i as i64,
            (false, true) => {
                if last_no_out >= 0 {
                    let mut edges = mercy_edges.lock().expect("mercy edge lock");
                    for j in last_no_out as usize..i {
                        edges.push(Kmer::from_packed(
                            rp.packed_words(),
                            rp.start_index(read_id) as usize + j,
                            kmer_k + 1,
                        ));
                    }
                    rescued += i as u64 - last_no_out as u64;
                }
                last_no_out = -1;
            }
            (true, true) => last_no_out = -1,
            (false, false) => {}
        }
    }
    rescued
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_num_bits() {
        assert_eq!(offset_num_bits(1), 1);
        assert_eq!(offset_num_bits(3), 2);
        assert_eq!(offset_num_bits(100), 7);
        assert_eq!(offset_num_bits(255), 8);
        assert_eq!(offset_num_bits(256), 9);
    }

    #[test]
    fn test_lookup_table_brackets_prefix_runs() {
        let mut p = SequencePackage::new();
        // Three sorted 10-base edges, two sharing an 8-base prefix
        p.append_seq(&[0, 0, 0, 0, 0, 0, 0, 0, 1, 2]);
        p.append_seq(&[0, 0, 0, 0, 0, 0, 0, 0, 3, 0]);
        p.append_seq(&[1, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        let table = init_lookup_table(&p);

        let prefix0 = (p.kmer_at(0, 0, 8).data[0] >> LOOKUP_SHIFT) as usize;
        let prefix2 = (p.kmer_at(2, 0, 8).data[0] >> LOOKUP_SHIFT) as usize;
        assert_eq!(table[prefix0 * 2], 0);
        assert_eq!(table[prefix0 * 2 + 1], 1);
        assert_eq!(table[prefix2 * 2], 2);
        assert_eq!(table[prefix2 * 2 + 1], 2);

        let probe = p.kmer_at(1, 0, 10);
        assert_eq!(binary_search_kmer(&probe, &table, &p, 10), 1);
        let mut missing = probe;
        missing.set_base(9, 3);
        assert_eq!(binary_search_kmer(&missing, &table, &p, 10), -1);
    }
}
