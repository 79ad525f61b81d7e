// Build configuration
// One plain struct covers both pipeline variants; the front-ends validate
// the fields they actually consume.

use crate::kmer::MAX_KMER_K;
use anyhow::{ensure, Result};
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct SdbgConfig {
    /// Graph k; edges are (k+1)-mers.
    pub kmer_k: usize,
    /// k of the previous iteration when re-encoding contigs (consumed by
    /// the external contig reader; carried here so one config describes a
    /// whole build step).
    pub kmer_from: usize,
    /// Worker pool size for the data-parallel passes.
    pub num_cpu_threads: usize,
    /// Emission partitions; at most `num_cpu_threads`.
    pub num_output_threads: usize,
    /// Byte budget for the lv1/lv2 buffers and scratch.
    pub host_mem: usize,
    /// Non-zero enables the device-sorter memory clamp.
    pub gpu_mem: usize,
    /// 0 = minimum memory, 1 = automatic, 2 = use everything.
    pub mem_flag: u8,
    /// Run mercy recovery before bucketing.
    pub need_mercy: bool,
    /// Stem of every output stream.
    pub output_prefix: PathBuf,
    /// Stem of auxiliary inputs (candidate read streams).
    pub input_prefix: PathBuf,
    /// Number of `.mercy_cand.<fid>` files next to `output_prefix`.
    pub num_mercy_files: usize,
    /// Longest read in the package; fixes the solid-bitmap stride and the
    /// in-read offset width.
    pub max_read_length: usize,
}

impl Default for SdbgConfig {
    fn default() -> Self {
        let threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        SdbgConfig {
            kmer_k: 21,
            kmer_from: 0,
            num_cpu_threads: threads,
            num_output_threads: (threads / 3).max(1),
            host_mem: 2 << 30,
            gpu_mem: 0,
            mem_flag: 1,
            need_mercy: false,
            output_prefix: PathBuf::from("sdbg"),
            input_prefix: PathBuf::from("sdbg"),
            num_mercy_files: 0,
            max_read_length: 150,
        }
    }
}

impl SdbgConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.kmer_k >= 1 && self.kmer_k <= MAX_KMER_K,
            "kmer_k {} out of range 1..={MAX_KMER_K}",
            self.kmer_k
        );
        ensure!(self.num_cpu_threads >= 1, "need at least one worker thread");
        ensure!(
            self.num_output_threads >= 1 && self.num_output_threads <= self.num_cpu_threads,
            "num_output_threads must be in 1..={}",
            self.num_cpu_threads
        );
        ensure!(self.mem_flag <= 2, "mem_flag must be 0, 1 or 2");
        ensure!(self.host_mem > 0, "host_mem must be non-zero");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        SdbgConfig::default().validate().unwrap();
    }

    #[test]
    fn test_rejects_bad_fields() {
        let mut cfg = SdbgConfig::default();
        cfg.kmer_k = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = SdbgConfig::default();
        cfg.num_output_threads = cfg.num_cpu_threads + 1;
        assert!(cfg.validate().is_err());

        let mut cfg = SdbgConfig::default();
        cfg.mem_flag = 3;
        assert!(cfg.validate().is_err());
    }
}
