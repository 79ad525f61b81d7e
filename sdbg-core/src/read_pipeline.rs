// Read pipeline: solid (k+1)-mers of short reads -> SdBG
// Every solid edge contributes its forward and reverse-complement windows;
// runs of consecutive solid positions additionally contribute boundary
// windows carrying the `$` terminus.

use crate::config::SdbgConfig;
use crate::emitter::{BuildStats, CountMode};
use crate::mercy;
use crate::packed_seq::SequencePackage;
use crate::pipeline::{self, EdgeSource, OffsetSink, PipelineConfig};
use crate::substring::{copy_substring, copy_substring_rc, SubstringSlot};
use anyhow::{ensure, Result};
use sdbg_common::{
    AtomicBitVector, BITS_PER_CHAR, BUCKET_PREFIX_LEN, CHARS_PER_WORD, NUM_BUCKETS_READ, SENTINEL,
    W_CHAR_BITS,
};
use std::cmp::Ordering;
use std::ops::Range;
use tracing::info;

/// Shift turning the first packed word of an edge window into its bucket
const BUCKET_SHIFT: usize = (CHARS_PER_WORD - BUCKET_PREFIX_LEN) * BITS_PER_CHAR;

const EDGE_LEFT_DOLLAR: u8 = 0;
const EDGE_SOLID: u8 = 1;
const EDGE_RIGHT_DOLLAR: u8 = 2;

/// Frozen inputs of a read-based build: the packed reads and the per-edge
/// solid bitmap with stride `max_read_length - k + 1`.
pub struct ReadsInput {
    pub package: SequencePackage,
    pub is_solid: AtomicBitVector,
}

pub(crate) struct ReadEdgeSource<'a> {
    package: &'a SequencePackage,
    is_solid: &'a AtomicBitVector,
    kmer_k: usize,
    offset_bits: u32,
    num_k1_per_read: usize,
}

impl<'a> ReadEdgeSource<'a> {
    pub(crate) fn new(
        package: &'a SequencePackage,
        is_solid: &'a AtomicBitVector,
        kmer_k: usize,
        max_read_length: usize,
        offset_bits: u32,
    ) -> Self {
        ReadEdgeSource {
            package,
            is_solid,
            kmer_k,
            offset_bits,
            num_k1_per_read: max_read_length - kmer_k + 1,
        }
    }

    #[inline]
    fn encode_offset(&self, read_id: u64, offset: usize, strand: u8, edge_type: u8) -> i64 {
        ((read_id << (self.offset_bits + 3))
            | ((offset as u64) << 3)
            | ((edge_type as u64) << 1)
            | strand as u64) as i64
    }

    /// Walk the solid edges of one read, reporting each window's bucket keys.
    /// `visit(strand, edge_type, bucket, offset)` is called in the slot order
    /// the lv1 fill relies on.
    fn scan_read<F: FnMut(u8, u8, usize, usize)>(&self, read_id: u64, mut visit: F) {
        let k = self.kmer_k;
        let read_len = self.package.length(read_id);
        if read_len < k + 1 {
            return;
        }

        let mut edge = self.package.kmer_at(read_id, 0, k + 1);
        let mut rev_edge = edge;
        rev_edge.reverse_complement(k + 1);

        let mut last_char_offset = k;
        let mut solid_idx = self.num_k1_per_read * read_id as usize;
        loop {
            if self.is_solid.get(solid_idx) {
                let offset = last_char_offset - k;
                let is_palindrome = rev_edge.cmp_k(&edge, k + 1) == Ordering::Equal;
                let first_solid = last_char_offset == k || !self.is_solid.get(solid_idx - 1);
                let last_solid =
                    last_char_offset == read_len - 1 || !self.is_solid.get(solid_idx + 1);

                if first_solid {
                    visit(
                        0,
                        EDGE_LEFT_DOLLAR,
                        (edge.data[0] >> BUCKET_SHIFT) as usize,
                        offset,
                    );
                    if !is_palindrome {
                        visit(
                            1,
                            EDGE_LEFT_DOLLAR,
                            ((rev_edge.data[0] << 4) >> BUCKET_SHIFT) as usize,
                            offset,
                        );
                    }
                }

                visit(
                    0,
                    EDGE_SOLID,
                    ((edge.data[0] << 2) >> BUCKET_SHIFT) as usize,
                    offset,
                );
                if !is_palindrome {
                    visit(
                        1,
                        EDGE_SOLID,
                        ((rev_edge.data[0] << 2) >> BUCKET_SHIFT) as usize,
                        offset,
                    );
                }

                if last_solid {
                    visit(
                        0,
                        EDGE_RIGHT_DOLLAR,
                        ((edge.data[0] << 4) >> BUCKET_SHIFT) as usize,
                        offset,
                    );
                    if !is_palindrome {
                        visit(
                            1,
                            EDGE_RIGHT_DOLLAR,
                            (rev_edge.data[0] >> BUCKET_SHIFT) as usize,
                            offset,
                        );
                    }
                }
            }

            solid_idx += 1;
            last_char_offset += 1;
            if last_char_offset >= read_len {
                break;
            }
            let c = self.package.get_base(read_id, last_char_offset);
            edge.shift_append(c, k + 1);
            rev_edge.shift_preappend(3 - c, k + 1);
        }
    }
}

impl EdgeSource for ReadEdgeSource<'_> {
    fn num_buckets(&self) -> usize {
        NUM_BUCKETS_READ
    }

    fn num_seqs(&self) -> u64 {
        self.package.size()
    }

    fn kmer_k(&self) -> usize {
        self.kmer_k
    }

    fn multi_bits(&self) -> u32 {
        0
    }

    fn count_mode(&self) -> CountMode {
        CountMode::RunLength
    }

    fn count_buckets(&self, seqs: Range<u64>, sizes: &mut [u64]) {
        for read_id in seqs {
            self.scan_read(read_id, |_, _, bucket, _| sizes[bucket] += 1);
        }
    }

    fn lv1_diff_base(&self, seq_id: u64) -> i64 {
        self.encode_offset(seq_id, 0, 0, 0)
    }

    fn fill_offsets(&self, seqs: Range<u64>, sink: &mut OffsetSink<'_, '_>) {
        for read_id in seqs {
            self.scan_read(read_id, |strand, edge_type, bucket, offset| {
                sink.save(bucket, self.encode_offset(read_id, offset, strand, edge_type));
            });
        }
    }

    fn extract_one(&self, full_offset: i64, slot: &SubstringSlot<'_, '_>) {
        let k = self.kmer_k;
        let full = full_offset as u64;
        let offset_mask = (1u64 << self.offset_bits) - 1;
        let read_id = full >> (self.offset_bits + 3);
        let mut offset = ((full >> 3) & offset_mask) as usize;
        let strand = (full & 1) as u8;
        let edge_type = ((full >> 1) & 3) as u8;

        let start = self.package.start_index(read_id) as usize;
        let words = self.package.packed_words();
        let mut num_chars = k;
        let prev;

        if strand == 0 {
            match edge_type {
                EDGE_LEFT_DOLLAR => prev = SENTINEL,
                EDGE_SOLID => {
                    prev = self.package.get_base(read_id, offset);
                    offset += 1;
                }
                _ => {
                    prev = self.package.get_base(read_id, offset + 1);
                    offset += 2;
                    num_chars -= 1;
                }
            }
            copy_substring(slot, words, start + offset, num_chars);
        } else {
            match edge_type {
                EDGE_LEFT_DOLLAR => {
                    num_chars -= 1;
                    prev = 3 - self.package.get_base(read_id, offset + k - 1);
                }
                EDGE_SOLID => {
                    prev = 3 - self.package.get_base(read_id, offset + k);
                }
                _ => {
                    prev = SENTINEL;
                    offset += 1;
                }
            }
            copy_substring_rc(slot, words, start + offset, num_chars);
        }
        slot.or_last_word((u32::from(num_chars == k) << W_CHAR_BITS) | prev as u32);
    }
}

/// Build the SdBG of a read set. Runs mercy recovery over the candidate
/// files first when the config asks for it.
pub fn build_sdbg_from_reads(cfg: &SdbgConfig, input: &mut ReadsInput) -> Result<BuildStats> {
    cfg.validate()?;
    ensure!(
        cfg.max_read_length >= cfg.kmer_k + 1,
        "max_read_length {} cannot hold a (k+1)-mer with k = {}",
        cfg.max_read_length,
        cfg.kmer_k
    );
    let num_k1_per_read = cfg.max_read_length - cfg.kmer_k + 1;
    ensure!(
        input.is_solid.len() >= input.package.size() as usize * num_k1_per_read,
        "solid bitmap too small for {} reads with stride {}",
        input.package.size(),
        num_k1_per_read
    );

    let num_mercy = if cfg.need_mercy {
        mercy::resolve_read_mercy(
            &input.package,
            &input.is_solid,
            cfg.kmer_k,
            cfg.max_read_length,
            &cfg.output_prefix,
            cfg.num_mercy_files,
        )?
    } else {
        0
    };

    input.package.build_lookup();
    info!(
        num_reads = input.package.size(),
        num_bases = input.package.num_bases(),
        "read package frozen"
    );

    let src = ReadEdgeSource::new(
        &input.package,
        &input.is_solid,
        cfg.kmer_k,
        cfg.max_read_length,
        mercy::offset_num_bits(cfg.max_read_length),
    );
    let mem_packed_seq = input.package.size_in_bytes() + input.is_solid.len().div_ceil(8);
    let pipeline_cfg = PipelineConfig {
        num_cpu_threads: cfg.num_cpu_threads,
        num_output_threads: cfg.num_output_threads,
        host_mem: cfg.host_mem,
        gpu_mem: cfg.gpu_mem,
        mem_flag: cfg.mem_flag,
        mem_packed_seq,
        output_prefix: cfg.output_prefix.clone(),
    };
    let mut stats = pipeline::run(&src, &pipeline_cfg)?;
    stats.num_mercy = num_mercy;
    Ok(stats)
}
