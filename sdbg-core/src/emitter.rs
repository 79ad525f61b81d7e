// SdBG edge emission
// Walks one sorted lv2 batch, groups items by their shared (k-1)-base node
// label, collapses duplicate observations into edges with W/LAST/IS-DOLLAR
// flags and a multiplicity, and appends them to the output streams in key
// order. Group flags are computed in parallel partitions; the stream append
// is strictly serial.

use crate::sdbg_writer::SdbgWriter;
use crate::substring::StridedView;
use anyhow::{bail, Result};
use rayon::prelude::*;
use sdbg_common::{MAX_DUMMY_EDGES, MAX_MULTI, SENTINEL};
use std::ops::Range;
use tracing::{debug, info};

/// Where an edge's multiplicity comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountMode {
    /// Count duplicate observations in the sorted run (read pipeline).
    RunLength,
    /// Decode the complemented count stored in the flag word; ascending
    /// sort order puts the maximum of each run first (sequence pipeline).
    Stored,
}

#[derive(Debug, Clone)]
pub struct EmitterConfig {
    pub kmer_k: usize,
    pub words_per_substring: usize,
    pub words_per_dummy_node: usize,
    pub multi_bits: u32,
    pub count_mode: CountMode,
    pub num_output_threads: usize,
}

/// Counters accumulated over a whole build.
#[derive(Debug, Default, Clone)]
pub struct BuildStats {
    pub total_edges: u64,
    pub num_ones_in_last: u64,
    pub num_dollar_nodes: u64,
    pub num_dummy_edges: u64,
    pub chars_in_w: [u64; 9],
    pub num_mercy: u64,
}

// aux byte layout: W in bits 0..=3, LAST in bit 4, IS-DOLLAR in bit 5,
// bit 7 marks a slot that produces an edge.
const AUX_USED: u8 = 1 << 7;

pub struct Emitter {
    cfg: EmitterConfig,
    writer: SdbgWriter,
    stats: BuildStats,
    cur_suffix_first_char: i32,
    aux: Vec<u8>,
    counts: Vec<u16>,
}

impl Emitter {
    pub fn new(cfg: EmitterConfig, writer: SdbgWriter) -> Self {
        Emitter {
            cfg,
            writer,
            stats: BuildStats::default(),
            cur_suffix_first_char: -1,
            aux: Vec::new(),
            counts: Vec::new(),
        }
    }

    /// Process one sorted batch: flag computation in parallel partitions,
    /// then the ordered serial append.
    pub fn emit_batch(
        &mut self,
        view: StridedView<'_>,
        permutation: &[u32],
        pool: &rayon::ThreadPool,
    ) -> Result<()> {
        let n_items = view.stride;
        if n_items == 0 {
            return Ok(());
        }
        let cfg = self.cfg.clone();

        self.aux.clear();
        self.aux.resize(n_items, 0);
        self.counts.clear();
        self.counts.resize(n_items, 0);

        // Partition on group boundaries so no partition splits a node label
        let bounds = partition_bounds(view, permutation, n_items, &cfg);
        let mut jobs: Vec<(Range<usize>, &mut [u8], &mut [u16])> = Vec::new();
        let mut aux_rest = self.aux.as_mut_slice();
        let mut counts_rest = self.counts.as_mut_slice();
        let mut prev = 0;
        for &bound in &bounds[1..] {
            let (aux_head, aux_tail) = aux_rest.split_at_mut(bound - prev);
            let (counts_head, counts_tail) = counts_rest.split_at_mut(bound - prev);
            aux_rest = aux_tail;
            counts_rest = counts_tail;
            jobs.push((prev..bound, aux_head, counts_head));
            prev = bound;
        }

        pool.install(|| {
            jobs.into_par_iter().for_each(|(range, aux, counts)| {
                compute_partition(&cfg, view, permutation, range, aux, counts);
            });
        });

        self.append_serial(view, permutation)
    }

    /// The single-writer append; runs after the partition join.
    fn append_serial(&mut self, view: StridedView<'_>, permutation: &[u32]) -> Result<()> {
        for i in 0..view.stride {
            let aux = self.aux[i];
            if aux & AUX_USED == 0 {
                continue;
            }
            let item = permutation[i] as usize;

            while view.first_char(item) as i32 > self.cur_suffix_first_char {
                self.cur_suffix_first_char += 1;
                self.writer.put_f_line(self.stats.total_edges)?;
            }

            let w = aux & 0xF;
            let last = (aux >> 4) & 1 == 1;
            let is_dollar = (aux >> 5) & 1 == 1;
            self.writer.put_w(w)?;
            self.writer.put_last(last)?;
            self.writer.put_is_dollar(is_dollar)?;
            self.writer
                .put_multiplicity(self.counts[i], self.stats.total_edges)?;

            self.stats.total_edges += 1;
            self.stats.chars_in_w[w as usize] += 1;
            self.stats.num_ones_in_last += last as u64;

            if is_dollar {
                self.stats.num_dollar_nodes += 1;
                if self.stats.num_dollar_nodes >= MAX_DUMMY_EDGES {
                    bail!(
                        "too many dummy nodes (>= {MAX_DUMMY_EDGES}): the graph contains too \
                         many tips; remove more tips before rebuilding"
                    );
                }
                for word_idx in 0..self.cfg.words_per_dummy_node {
                    self.writer.put_dummy_word(view.word(item, word_idx))?;
                }
            }
            if w == 0 {
                self.stats.num_dummy_edges += 1;
            }
        }
        Ok(())
    }

    /// Write the `.f` trailer, flush everything and hand back the counters.
    pub fn finish(self, kmer_k: usize) -> Result<BuildStats> {
        let stats = self.stats;
        self.writer
            .finish(stats.total_edges, kmer_k, stats.num_dollar_nodes)?;
        info!(
            total_edges = stats.total_edges,
            ones_in_last = stats.num_ones_in_last,
            dollar_nodes = stats.num_dollar_nodes,
            dummy_edges = stats.num_dummy_edges,
            "graph emission finished"
        );
        debug!(chars_in_w = ?stats.chars_in_w, "W character histogram");
        Ok(stats)
    }
}

/// Split `n_items` into `num_output_threads` partitions, each extended
/// rightward past items sharing the previous item's node label. The last
/// partition absorbs the remainder.
fn partition_bounds(
    view: StridedView<'_>,
    permutation: &[u32],
    n_items: usize,
    cfg: &EmitterConfig,
) -> Vec<usize> {
    let num_threads = cfg.num_output_threads.max(1);
    let items_per_thread = n_items / num_threads;
    let mut bounds = Vec::with_capacity(num_threads + 1);
    bounds.push(0);

    let mut last_end = 0;
    for _ in 0..num_threads.saturating_sub(1) {
        let mut end = (last_end + items_per_thread).min(n_items);
        if end > 0 {
            while end < n_items
                && !view.is_diff_k_minus_1_mer(
                    permutation[end] as usize,
                    permutation[end - 1] as usize,
                    cfg.kmer_k,
                )
            {
                end += 1;
            }
        }
        bounds.push(end);
        last_end = end;
    }
    bounds.push(n_items);
    bounds
}

/// Group-collapse pass over one partition. `aux`/`counts` are the
/// partition's slices; index 0 corresponds to `range.start`.
fn compute_partition(
    cfg: &EmitterConfig,
    view: StridedView<'_>,
    permutation: &[u32],
    range: Range<usize>,
    aux: &mut [u8],
    counts: &mut [u16],
) {
    let k = cfg.kmer_k;
    let mb = cfg.multi_bits;

    let mut start_idx = range.start;
    while start_idx < range.end {
        let head_item = permutation[start_idx] as usize;
        let mut end_idx = start_idx + 1;
        while end_idx < range.end
            && !view.is_diff_k_minus_1_mer(head_item, permutation[end_idx] as usize, k)
        {
            end_idx += 1;
        }

        // Aggregate which (tail, prev) pairs are fully observed, and the
        // last slot per tail that can carry the LAST flag.
        let mut has_solid_tail = 0u8;
        let mut has_solid_prev = 0u8;
        let mut last_of_tail = [-1i64; 4];
        for i in start_idx..end_idx {
            let item = permutation[i] as usize;
            let tail = view.tail_char(item, k, mb);
            let prev = view.prev_char(item, mb);
            if tail != SENTINEL && prev != SENTINEL {
                has_solid_tail |= 1 << tail;
                has_solid_prev |= 1 << prev;
            }
            if tail != SENTINEL && (prev != SENTINEL || has_solid_tail & (1 << tail) == 0) {
                last_of_tail[tail as usize] = i as i64;
            }
        }

        // Collapse runs of equal (tail, prev) into single edges
        let mut emitted_prev = 0u8;
        let mut i = start_idx;
        while i < end_idx {
            let item = permutation[i] as usize;
            let tail = view.tail_char(item, k, mb);
            let prev = view.prev_char(item, mb);
            let mut j = i + 1;
            while j < end_idx {
                let next = permutation[j] as usize;
                if view.tail_char(next, k, mb) != tail || view.prev_char(next, mb) != prev {
                    break;
                }
                j += 1;
            }

            if tail == SENTINEL && has_solid_prev & (1 << prev) != 0 {
                i = j;
                continue;
            }
            if prev == SENTINEL && has_solid_tail & (1 << tail) != 0 {
                i = j;
                continue;
            }

            let is_dollar = tail == SENTINEL;
            let count = if is_dollar || prev == SENTINEL {
                0
            } else {
                match cfg.count_mode {
                    CountMode::RunLength => (j - i).min(MAX_MULTI as usize) as u16,
                    CountMode::Stored => MAX_MULTI - MAX_MULTI.min(view.count_field(item)),
                }
            };

            let w = if prev == SENTINEL {
                0
            } else if emitted_prev & (1 << prev) != 0 {
                prev + 5
            } else {
                prev + 1
            };
            emitted_prev |= 1 << prev;
            let last = tail != SENTINEL && last_of_tail[tail as usize] == (j - 1) as i64;

            aux[i - range.start] =
                AUX_USED | (u8::from(is_dollar) << 5) | (u8::from(last) << 4) | w;
            counts[i - range.start] = count;
            i = j;
        }

        start_idx = end_idx;
    }
}
