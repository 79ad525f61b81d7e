// Sequence pipeline: edge/contig packages with multiplicities -> SdBG
// Every window of every sequence contributes both strands; windows at the
// sequence ends are shortened and carry the `$` terminus. The bucket key is
// a rolling base-5 digit string so shortened windows order before real
// bases.

use crate::config::SdbgConfig;
use crate::emitter::{BuildStats, CountMode};
use crate::mercy::{self, ReadBatchSource};
use crate::packed_seq::SequencePackage;
use crate::pipeline::{self, EdgeSource, OffsetSink, PipelineConfig};
use crate::substring::{copy_substring, copy_substring_rc, SubstringSlot};
use anyhow::{ensure, Result};
use sdbg_common::{
    Multiplicity, BITS_PER_MULTI, BUCKET_BASE_SEQ, BUCKET_PREFIX_LEN, MAX_MULTI, NUM_BUCKETS_SEQ,
    SENTINEL, W_CHAR_BITS,
};
use std::ops::Range;
use tracing::info;

/// Frozen inputs of a sequence-based build: a package of sequences of at
/// least k+1 bases (sorted edges, contigs, or both) and one multiplicity
/// per sequence.
pub struct SeqInput {
    pub package: SequencePackage,
    pub multiplicity: Vec<Multiplicity>,
}

pub(crate) struct SeqEdgeSource<'a> {
    package: &'a SequencePackage,
    multiplicity: &'a [Multiplicity],
    kmer_k: usize,
}

impl<'a> SeqEdgeSource<'a> {
    pub(crate) fn new(
        package: &'a SequencePackage,
        multiplicity: &'a [Multiplicity],
        kmer_k: usize,
    ) -> Self {
        SeqEdgeSource {
            package,
            multiplicity,
            kmer_k,
        }
    }

    /// Roll the base-5 bucket keys over both strands of one sequence.
    /// `visit(strand, bucket, offset)`, forward before reverse per position.
    fn scan_seq<F: FnMut(u8, usize, usize)>(&self, seq_id: u64, mut visit: F) {
        let k = self.kmer_k;
        let seq_len = self.package.length(seq_id);
        if seq_len < k + 1 {
            return;
        }

        let mut key = 0usize;
        let mut rev_key = 0usize;
        for i in 0..BUCKET_PREFIX_LEN - 1 {
            key = key * BUCKET_BASE_SEQ + self.package.get_base(seq_id, i) as usize + 1;
            rev_key = rev_key * BUCKET_BASE_SEQ
                + (3 - self.package.get_base(seq_id, seq_len - 1 - i)) as usize
                + 1;
        }
        // windows: $-prefixed, every full k-mer, then the $-suffixed one
        let mut i = BUCKET_PREFIX_LEN - 1;
        while i + k <= seq_len + BUCKET_PREFIX_LEN {
            key = (key * BUCKET_BASE_SEQ + self.package.get_base(seq_id, i) as usize + 1)
                % NUM_BUCKETS_SEQ;
            rev_key = (rev_key * BUCKET_BASE_SEQ
                + (3 - self.package.get_base(seq_id, seq_len - 1 - i)) as usize
                + 1)
                % NUM_BUCKETS_SEQ;
            let offset = i + 1 - BUCKET_PREFIX_LEN;
            visit(0, key, offset);
            visit(1, rev_key, offset);
            i += 1;
        }
    }
}

impl EdgeSource for SeqEdgeSource<'_> {
    fn num_buckets(&self) -> usize {
        NUM_BUCKETS_SEQ
    }

    fn num_seqs(&self) -> u64 {
        self.package.size()
    }

    fn kmer_k(&self) -> usize {
        self.kmer_k
    }

    fn multi_bits(&self) -> u32 {
        BITS_PER_MULTI
    }

    fn count_mode(&self) -> CountMode {
        CountMode::Stored
    }

    fn count_buckets(&self, seqs: Range<u64>, sizes: &mut [u64]) {
        for seq_id in seqs {
            self.scan_seq(seq_id, |_, bucket, _| sizes[bucket] += 1);
        }
    }

    fn lv1_diff_base(&self, seq_id: u64) -> i64 {
        (self.package.start_index(seq_id) << 1) as i64
    }

    fn fill_offsets(&self, seqs: Range<u64>, sink: &mut OffsetSink<'_, '_>) {
        for seq_id in seqs {
            let start = self.package.start_index(seq_id);
            self.scan_seq(seq_id, |strand, bucket, offset| {
                sink.save(bucket, (((start + offset as u64) << 1) | strand as u64) as i64);
            });
        }
    }

    fn extract_one(&self, full_offset: i64, slot: &SubstringSlot<'_, '_>) {
        let k = self.kmer_k;
        let full = full_offset as u64;
        let seq_id = self.package.get_id(full >> 1);
        let mut offset = ((full >> 1) - self.package.start_index(seq_id)) as usize;
        let strand = (full & 1) as u8;
        let seq_len = self.package.length(seq_id);

        let num_chars = k - usize::from(offset + k > seq_len);
        let counting = if offset > 0 && offset + k <= seq_len {
            self.multiplicity[seq_id as usize]
        } else {
            0
        };

        let start = self.package.start_index(seq_id) as usize;
        let words = self.package.packed_words();
        let prev;

        if strand == 0 {
            prev = if offset == 0 {
                SENTINEL
            } else {
                self.package.get_base(seq_id, offset - 1)
            };
            copy_substring(slot, words, start + offset, num_chars);
        } else {
            prev = if offset == 0 {
                SENTINEL
            } else {
                3 - self.package.get_base(seq_id, seq_len - offset)
            };
            // switch to the forward strand coordinates of the window
            let fwd = seq_len as i64 - 1 - offset as i64 - (k as i64 - 1);
            offset = fwd.max(0) as usize;
            copy_substring_rc(slot, words, start + offset, num_chars);
        }

        slot.or_last_word(
            (u32::from(num_chars == k) << (W_CHAR_BITS + BITS_PER_MULTI))
                | ((prev as u32) << BITS_PER_MULTI)
                | (MAX_MULTI - counting) as u32,
        );
    }
}

/// Build the SdBG of an edge/contig package. When the config asks for mercy
/// recovery and a read stream is supplied, bridging (k+1)-mers are appended
/// to the package (multiplicity 1) before bucketing.
pub fn build_sdbg_from_seqs(
    cfg: &SdbgConfig,
    input: &mut SeqInput,
    mercy_reads: Option<Box<dyn ReadBatchSource>>,
) -> Result<BuildStats> {
    cfg.validate()?;
    ensure!(
        cfg.kmer_k > BUCKET_PREFIX_LEN,
        "the sequence pipeline requires k > {BUCKET_PREFIX_LEN}"
    );
    ensure!(
        input.multiplicity.len() as u64 == input.package.size(),
        "one multiplicity per sequence required: {} sequences, {} multiplicities",
        input.package.size(),
        input.multiplicity.len()
    );

    // Pre-flight low bound: the frozen input plus bucket bookkeeping must
    // leave room before any lv1/lv2 sizing happens
    let mem_packed_seq =
        input.package.size_in_bytes() + input.multiplicity.len() * std::mem::size_of::<Multiplicity>();
    let bookkeeping = NUM_BUCKETS_SEQ * 8 * (cfg.num_cpu_threads * 3 + 1);
    let mem_low_bound = (mem_packed_seq + bookkeeping) as f64 * 1.05;
    ensure!(
        mem_low_bound <= cfg.host_mem as f64,
        "{} bytes of host memory cannot hold the sequence package; \
         raise the budget to at least {}",
        cfg.host_mem,
        mem_low_bound as u64
    );

    let num_mercy = match (cfg.need_mercy, mercy_reads) {
        (true, Some(reads)) => {
            mercy::gen_mercy_edges(&mut input.package, &mut input.multiplicity, cfg.kmer_k, reads)?
        }
        _ => 0,
    };

    input.package.build_lookup();
    info!(
        num_seqs = input.package.size(),
        num_bases = input.package.num_bases(),
        "sequence package frozen"
    );

    let mem_packed_seq =
        input.package.size_in_bytes() + input.multiplicity.len() * std::mem::size_of::<Multiplicity>();
    let src = SeqEdgeSource::new(&input.package, &input.multiplicity, cfg.kmer_k);
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
