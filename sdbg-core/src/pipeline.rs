// Two-level external-sort pipeline
// Level 1 stores differential offsets of every edge occurrence, bucketed by
// a fixed-length prefix; level 2 extracts and sorts the packed substrings of
// one batch of buckets at a time. Memory for both levels is planned up
// front so the largest bucket always fits, and sorted batches stream to the
// emitter thread through a pair of rotating buffers.

use crate::emitter::{BuildStats, CountMode, Emitter, EmitterConfig};
use crate::sdbg_writer::SdbgWriter;
use crate::shared::SharedSlice;
use crate::sorter::{CpuSorter, Lv2Sorter};
use crate::substring::{StridedView, SubstringSlot};
use anyhow::{anyhow, ensure, Context, Result};
use crossbeam::channel::bounded;
use rayon::prelude::*;
use sdbg_common::W_CHAR_BITS;
use std::ops::Range;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;
use tracing::{debug, info};

/// Bytes per lv1 slot (one differential per edge occurrence).
pub const LV1_BYTES_PER_ITEM: u64 = 4;

/// Largest differential representable inline; anything bigger goes through
/// the overflow table.
pub const DIFFERENTIAL_LIMIT: i64 = (1 << 30) - 1;

const MAX_LV1_SCANS: f64 = 64.0;
const DEFAULT_LV1_SCANS: f64 = 8.0;
const MIN_LV2_BATCH: u64 = 2 * 1024 * 1024;
const MIN_LV2_BATCH_GPU: u64 = 64 * 1024 * 1024;
const GPU_BYTES_PER_ITEM: u64 = 16;
const GPU_RESERVE_BYTES: u64 = 1 << 30;

/// Engine configuration; the pipeline front-ends fill this from the build
/// config plus the frozen input's measured memory.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub num_cpu_threads: usize,
    pub num_output_threads: usize,
    pub host_mem: usize,
    pub gpu_mem: usize,
    /// 0 = minimum memory, 1 = automatic, 2 = use everything available.
    pub mem_flag: u8,
    pub mem_packed_seq: usize,
    pub output_prefix: PathBuf,
}

/// Capability an input variant plugs into the engine: bucket histograms,
/// offset generation, and substring extraction.
pub trait EdgeSource: Sync {
    fn num_buckets(&self) -> usize;

    fn num_seqs(&self) -> u64;

    fn kmer_k(&self) -> usize;

    /// Bits of multiplicity carried in each substring's flag word.
    fn multi_bits(&self) -> u32;

    fn count_mode(&self) -> CountMode;

    /// Count every edge occurrence of `seqs` into `sizes` (one counter per
    /// bucket).
    fn count_buckets(&self, seqs: Range<u64>, sizes: &mut [u64]);

    /// Differential base for a scan partition starting at `seq_id`.
    fn lv1_diff_base(&self, seq_id: u64) -> i64;

    /// Scan `seqs` and hand every (bucket, full offset) pair to the sink.
    /// Must visit occurrences in the same order as `count_buckets`.
    fn fill_offsets(&self, seqs: Range<u64>, sink: &mut OffsetSink<'_, '_>);

    /// Decode one full offset and write its substring into the slot.
    fn extract_one(&self, full_offset: i64, slot: &SubstringSlot<'_, '_>);
}

/// Per-worker lv1 writer: differential encoding against the previous offset
/// of each bucket, with the shared overflow table for large jumps.
pub struct OffsetSink<'a, 'b> {
    lv1_start_bucket: usize,
    lv1_end_bucket: usize,
    cursors: &'a mut [u64],
    prev_full: &'a mut [i64],
    lv1_items: &'a SharedSlice<'b, i32>,
    special: &'a Mutex<Vec<i64>>,
}

impl<'a, 'b> OffsetSink<'a, 'b> {
    pub fn new(
        lv1_buckets: Range<usize>,
        cursors: &'a mut [u64],
        prev_full: &'a mut [i64],
        lv1_items: &'a SharedSlice<'b, i32>,
        special: &'a Mutex<Vec<i64>>,
    ) -> Self {
        OffsetSink {
            lv1_start_bucket: lv1_buckets.start,
            lv1_end_bucket: lv1_buckets.end,
            cursors,
            prev_full,
            lv1_items,
            special,
        }
    }

    /// Whether `bucket` belongs to the current lv1 range. The sign-bit form
    /// compiles to two subtractions and keeps the hot scan branch-light.
    #[inline]
    pub fn in_current_range(&self, bucket: usize) -> bool {
        let b = bucket as i64;
        ((b - self.lv1_start_bucket as i64) ^ (b - self.lv1_end_bucket as i64)) < 0
    }

    /// Record one edge occurrence.
    #[inline]
    pub fn save(&mut self, bucket: usize, full_offset: i64) {
        if !self.in_current_range(bucket) {
            return;
        }
        let slot = self.cursors[bucket] as usize;
        self.cursors[bucket] += 1;
        let differential = full_offset - self.prev_full[bucket];
        if differential > DIFFERENTIAL_LIMIT {
            let mut special = self.special.lock().expect("lv1 overflow lock");
            let index = special.len();
            special.push(full_offset);
            // Slot values < 0 index the overflow table as -(index + 1)
            unsafe { self.lv1_items.write(slot, -(index as i32) - 1) };
        } else {
            debug_assert!(differential >= 0, "bucket offsets must be monotone per scan");
            unsafe { self.lv1_items.write(slot, differential as i32) };
        }
        self.prev_full[bucket] = full_offset;
    }
}

/// Flag-word width of one substring: k bases, prev-char field, non-sentinel
/// bit and the optional inline multiplicity.
pub fn words_per_substring(kmer_k: usize, multi_bits: u32) -> usize {
    (kmer_k * 2 + W_CHAR_BITS as usize + 1 + multi_bits as usize).div_ceil(32)
}

/// Packed words holding the k bases of a dummy-node label.
pub fn words_per_dummy_node(kmer_k: usize) -> usize {
    (kmer_k * 2).div_ceil(32)
}

#[derive(Debug, Clone, Copy)]
struct MemoryPlan {
    max_lv1_items: u64,
    max_lv2_items: u64,
}

/// Solve for the largest (lv1, lv2) item counts fitting `mem_avail`, given
/// the per-item costs and floors. lv2 is granted first (it bounds the
/// largest sortable bucket), lv1 takes the remainder but always spans at
/// least one full lv2 batch.
fn adjust_mem(
    mem_avail: u64,
    lv2_bytes_per_item: u64,
    min_lv1: u64,
    min_lv2: u64,
    desired_lv2: u64,
) -> Result<(u64, u64)> {
    let min_bytes = min_lv1 * LV1_BYTES_PER_ITEM + min_lv2 * lv2_bytes_per_item;
    ensure!(
        min_bytes <= mem_avail,
        "host memory infeasible: lv1/lv2 buffers need at least {min_bytes} bytes, \
         only {mem_avail} available; raise the memory budget"
    );
    let lv2_ceiling = ((mem_avail - min_lv1 * LV1_BYTES_PER_ITEM) / lv2_bytes_per_item).max(min_lv2);
    let lv2 = desired_lv2.clamp(min_lv2, lv2_ceiling);
    let lv1 = ((mem_avail - lv2 * lv2_bytes_per_item) / LV1_BYTES_PER_ITEM).max(min_lv1);
    Ok((lv1.max(lv2), lv2))
}

fn plan_memory(
    cfg: &PipelineConfig,
    num_buckets: usize,
    tot_bucket_size: u64,
    max_bucket_size: u64,
    lv2_bytes_per_item: u64,
) -> Result<MemoryPlan> {
    // Desired lv2 batch, clamped by the sort device when one is configured
    let desired_lv2 = if cfg.gpu_mem > 0 {
        ensure!(
            cfg.gpu_mem as u64 > GPU_RESERVE_BYTES,
            "gpu_mem must leave at least {GPU_RESERVE_BYTES} bytes of sort headroom"
        );
        let clamp = (cfg.gpu_mem as u64 - GPU_RESERVE_BYTES) / GPU_BYTES_PER_ITEM;
        let desired = clamp.min(max_bucket_size.max(MIN_LV2_BATCH_GPU));
        ensure!(
            max_bucket_size <= desired,
            "bucket too large for the device sorter: {max_bucket_size} items; \
             use the CPU sorter instead"
        );
        desired
    } else {
        max_bucket_size.max(MIN_LV2_BATCH)
    };

    let bookkeeping = num_buckets as u64 * 8 * (cfg.num_cpu_threads as u64 * 3 + 1);
    let mem_remained = (cfg.host_mem as u64)
        .checked_sub(cfg.mem_packed_seq as u64 + bookkeeping)
        .ok_or_else(|| {
            anyhow!(
                "host memory infeasible: {} bytes cannot hold the packed input ({}) \
                 plus bucket bookkeeping ({})",
                cfg.host_mem,
                cfg.mem_packed_seq,
                bookkeeping
            )
        })?;

    let min_lv1 = (tot_bucket_size as f64 / (MAX_LV1_SCANS - 0.5)) as u64;
    let min_lv2 = max_bucket_size.max(MIN_LV2_BATCH);

    let (max_lv1_items, max_lv2_items) = match cfg.mem_flag {
        1 => {
            let lv1 = desired_lv2.max((tot_bucket_size as f64 / (DEFAULT_LV1_SCANS - 0.5)) as u64);
            let needed = lv1 * LV1_BYTES_PER_ITEM + desired_lv2 * lv2_bytes_per_item;
            if needed > mem_remained {
                adjust_mem(mem_remained, lv2_bytes_per_item, min_lv1, min_lv2, desired_lv2)?
            } else {
                (lv1, desired_lv2)
            }
        }
        0 => {
            let lv1 = desired_lv2.max((tot_bucket_size as f64 / (MAX_LV1_SCANS - 0.5)) as u64);
            let needed = lv1 * LV1_BYTES_PER_ITEM + desired_lv2 * lv2_bytes_per_item;
            let budget = needed.min(mem_remained);
            adjust_mem(budget, lv2_bytes_per_item, min_lv1, min_lv2, desired_lv2)?
        }
        _ => adjust_mem(mem_remained, lv2_bytes_per_item, min_lv1, min_lv2, desired_lv2)?,
    };

    Ok(MemoryPlan {
        max_lv1_items,
        max_lv2_items,
    })
}

/// Even split of `num_items` into `num_parts` ranges.
fn partition_items(num_items: u64, num_parts: usize) -> Vec<Range<u64>> {
    let parts = num_parts.max(1) as u64;
    (0..parts)
        .map(|p| (p * num_items / parts)..((p + 1) * num_items / parts))
        .collect()
}

/// Greedy split of a bucket range into tasks of roughly equal item counts.
fn partition_buckets(sizes: &[u64], buckets: Range<usize>, num_parts: usize) -> Vec<Range<usize>> {
    let total: u64 = sizes[buckets.clone()].iter().sum();
    let target = total / num_parts.max(1) as u64 + 1;
    let mut tasks = Vec::new();
    let mut start = buckets.start;
    let mut acc = 0u64;
    for b in buckets.clone() {
        acc += sizes[b];
        if acc >= target {
            tasks.push(start..b + 1);
            start = b + 1;
            acc = 0;
        }
    }
    if start < buckets.end {
        tasks.push(start..buckets.end);
    }
    tasks
}

struct SortedBatch {
    substrings: Vec<u32>,
    permutation: Vec<u32>,
    n_items: usize,
}

/// Run the full pipeline for one edge source, producing the SdBG files
/// under `cfg.output_prefix` and returning the emission counters.
pub fn run<S: EdgeSource>(src: &S, cfg: &PipelineConfig) -> Result<BuildStats> {
    let num_buckets = src.num_buckets();
    let num_threads = cfg.num_cpu_threads.max(1);
    let kmer_k = src.kmer_k();
    let wps = words_per_substring(kmer_k, src.multi_bits());
    let wpd = words_per_dummy_node(kmer_k);
    let pool = Arc::new(
        rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .build()
            .context("failed to build the worker pool")?,
    );

    // --- phase 1: bucket histogram ---
    let timer = Instant::now();
    let seq_ranges = partition_items(src.num_seqs(), num_threads);
    let thread_sizes: Vec<Vec<u64>> = pool.install(|| {
        seq_ranges
            .par_iter()
            .map(|range| {
                let mut sizes = vec![0u64; num_buckets];
                src.count_buckets(range.clone(), &mut sizes);
                sizes
            })
            .collect()
    });
    let mut bucket_sizes = vec![0u64; num_buckets];
    for sizes in &thread_sizes {
        for (total, s) in bucket_sizes.iter_mut().zip(sizes) {
            *total += s;
        }
    }
    let max_bucket_size = bucket_sizes.iter().copied().max().unwrap_or(0);
    let tot_bucket_size: u64 = bucket_sizes.iter().sum();
    info!(
        tot_bucket_size,
        max_bucket_size,
        elapsed = ?timer.elapsed(),
        "bucket histogram done"
    );

    // --- phase 2: memory sizing ---
    // Double-buffered substrings + permutations, the sorter scratch, and the
    // per-item aux/count bytes on the emitter side
    let lv2_bytes_per_item = (wps as u64 * 4 + 4) * 2 + 16 + 3;
    let plan = plan_memory(
        cfg,
        num_buckets,
        tot_bucket_size,
        max_bucket_size,
        lv2_bytes_per_item,
    )?;
    info!(
        max_lv1_items = plan.max_lv1_items,
        max_lv2_items = plan.max_lv2_items,
        words_per_substring = wps,
        "memory plan settled"
    );

    // --- allocate once, reuse across batches ---
    let max_lv2 = plan.max_lv2_items as usize;
    let mut lv1_items = vec![0i32; plan.max_lv1_items as usize];
    let mut sorter = CpuSorter::with_capacity(max_lv2);
    let special: Mutex<Vec<i64>> = Mutex::new(Vec::new());
    let diff_base: Vec<i64> = seq_ranges
        .iter()
        .map(|range| src.lv1_diff_base(range.start))
        .collect();

    // --- emitter thread, fed in bucket order through rotating buffers ---
    let writer = SdbgWriter::create(&cfg.output_prefix, wpd)?;
    let mut emitter = Emitter::new(
        EmitterConfig {
            kmer_k,
            words_per_substring: wps,
            words_per_dummy_node: wpd,
            multi_bits: src.multi_bits(),
            count_mode: src.count_mode(),
            num_output_threads: cfg.num_output_threads.max(1),
        },
        writer,
    );
    let (batch_tx, batch_rx) = bounded::<SortedBatch>(1);
    let (free_tx, free_rx) = bounded::<(Vec<u32>, Vec<u32>)>(2);
    for _ in 0..2 {
        free_tx
            .send((vec![0u32; max_lv2 * wps], vec![0u32; max_lv2]))
            .expect("buffer channel seeded before use");
    }
    let emit_pool = pool.clone();
    let emitter_thread = thread::spawn(move || -> Result<BuildStats> {
        while let Ok(batch) = batch_rx.recv() {
            let view = StridedView {
                buf: &batch.substrings[..batch.n_items * wps],
                stride: batch.n_items,
                words_per_substring: wps,
            };
            emitter.emit_batch(view, &batch.permutation[..batch.n_items], &emit_pool)?;
            if free_tx.send((batch.substrings, batch.permutation)).is_err() {
                break;
            }
        }
        emitter.finish(kmer_k)
    });

    // --- phases 3-5: lv1 fill, lv2 extract + sort, hand off to emitter ---
    let run_result: Result<()> = (|| {
        let mut lv1_start = 0usize;
        while lv1_start < num_buckets {
            let mut lv1_end = lv1_start;
            let mut lv1_size = 0u64;
            while lv1_end < num_buckets
                && lv1_size + bucket_sizes[lv1_end] <= plan.max_lv1_items
            {
                lv1_size += bucket_sizes[lv1_end];
                lv1_end += 1;
            }
            ensure!(
                lv1_end > lv1_start,
                "bucket {lv1_start} holds {} items and overflows the lv1 budget",
                bucket_sizes[lv1_start]
            );
            debug!(lv1_start, lv1_end, lv1_size, "lv1 batch");

            // Slot base of each bucket within this batch
            let mut batch_base = vec![0u64; lv1_end - lv1_start + 1];
            for b in lv1_start..lv1_end {
                batch_base[b - lv1_start + 1] = batch_base[b - lv1_start] + bucket_sizes[b];
            }

            special.lock().expect("lv1 overflow lock").clear();
            let timer = Instant::now();
            {
                let lv1_slice = SharedSlice::new(&mut lv1_items[..lv1_size as usize]);
                pool.install(|| {
                    seq_ranges.par_iter().enumerate().for_each(|(t, range)| {
                        let mut cursors = vec![0u64; num_buckets];
                        for b in lv1_start..lv1_end {
                            cursors[b] = batch_base[b - lv1_start]
                                + (0..t).map(|u| thread_sizes[u][b]).sum::<u64>();
                        }
                        let mut prev_full = vec![diff_base[t]; num_buckets];
                        let mut sink = OffsetSink::new(
                            lv1_start..lv1_end,
                            &mut cursors,
                            &mut prev_full,
                            &lv1_slice,
                            &special,
                        );
                        src.fill_offsets(range.clone(), &mut sink);
                    });
                });
            }
            debug!(elapsed = ?timer.elapsed(), "lv1 fill done");
            let special_snapshot = special.lock().expect("lv1 overflow lock").clone();

            let mut b2_start = lv1_start;
            while b2_start < lv1_end {
                let mut b2_end = b2_start;
                let mut n_items = 0u64;
                while b2_end < lv1_end
                    && n_items + bucket_sizes[b2_end] <= plan.max_lv2_items
                {
                    n_items += bucket_sizes[b2_end];
                    b2_end += 1;
                }
                ensure!(
                    b2_end > b2_start,
                    "bucket {b2_start} holds {} items and overflows the lv2 budget",
                    bucket_sizes[b2_start]
                );
                if n_items == 0 {
                    b2_start = b2_end;
                    continue;
                }
                let n = n_items as usize;

                let (mut substrings, mut permutation) =
                    free_rx.recv().map_err(|_| anyhow!("emitter terminated early"))?;

                let timer = Instant::now();
                {
                    let shared = SharedSlice::new(&mut substrings[..n * wps]);
                    let slot0 = batch_base[b2_start - lv1_start] as usize;
                    let tasks = partition_buckets(&bucket_sizes, b2_start..b2_end, num_threads);
                    pool.install(|| {
                        tasks.par_iter().for_each(|bucket_range| {
                            for b in bucket_range.clone() {
                                let mut slot = batch_base[b - lv1_start] as usize;
                                for (t, sizes) in thread_sizes.iter().enumerate() {
                                    let mut full_offset = diff_base[t];
                                    for _ in 0..sizes[b] {
                                        let v = lv1_items[slot];
                                        full_offset = if v >= 0 {
                                            full_offset + v as i64
                                        } else {
                                            special_snapshot[(-1 - v) as usize]
                                        };
                                        let slot_writer = SubstringSlot {
                                            buf: &shared,
                                            item: slot - slot0,
                                            stride: n,
                                            words_per_substring: wps,
                                        };
                                        src.extract_one(full_offset, &slot_writer);
                                        slot += 1;
                                    }
                                }
                            }
                        });
                    });
                }
                debug!(b2_start, b2_end, n_items, elapsed = ?timer.elapsed(), "lv2 extract done");

                let timer = Instant::now();
                pool.install(|| sorter.sort(&substrings[..n * wps], &mut permutation, wps, n));
                debug!(elapsed = ?timer.elapsed(), "lv2 sort done");

                batch_tx
                    .send(SortedBatch {
                        substrings,
                        permutation,
                        n_items: n,
                    })
                    .map_err(|_| anyhow!("emitter terminated early"))?;
                b2_start = b2_end;
            }
            lv1_start = lv1_end;
        }
        Ok(())
    })();

    drop(batch_tx);
    drop(free_rx);
    let emit_result = emitter_thread
        .join()
        .map_err(|_| anyhow!("emitter thread panicked"))?;
    match emit_result {
        Err(e) => Err(e),
        Ok(stats) => {
            run_result?;
            Ok(stats)
        }
    }
}
