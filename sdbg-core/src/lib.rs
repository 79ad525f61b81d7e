//! Succinct de Bruijn graph construction and simplification engine.
//!
//! The construction half turns packed DNA sequences into a BWT-style
//! encoding of the (k+1)-mer edge set. Memory stays bounded well below the
//! key set through a two-level external sort: bucketed differential offsets
//! first, then full substring extraction and sorting of one batch of
//! buckets at a time.
//!
//! Two input variants share the engine: short reads with a solid-edge
//! bitmap ([`build_sdbg_from_reads`]) and edge/contig packages with
//! per-sequence multiplicities ([`build_sdbg_from_seqs`]). Mercy recovery
//! can rescue (k+1)-mers bridging solid stretches of one read in either
//! variant.
//!
//! The simplification half ([`Simplifier`], [`pop_bubbles`]) prunes tips
//! and low-depth bubble branches over the query contract of a completed
//! graph ([`SdbgAccess`]).
//!
//! ```no_run
//! use sdbg_core::{build_sdbg_from_reads, ReadsInput, SdbgConfig, SequencePackage};
//! use sdbg_common::AtomicBitVector;
//!
//! # fn main() -> anyhow::Result<()> {
//! let mut cfg = SdbgConfig::default();
//! cfg.kmer_k = 21;
//! cfg.output_prefix = "out/graph".into();
//!
//! let mut package = SequencePackage::new();
//! // ... append packed reads ...
//! let stride = cfg.max_read_length - cfg.kmer_k + 1;
//! let is_solid = AtomicBitVector::with_len(package.size() as usize * stride);
//! // ... external counter marks solid edges ...
//!
//! let mut input = ReadsInput { package, is_solid };
//! let stats = build_sdbg_from_reads(&cfg, &mut input)?;
//! println!("{} edges", stats.total_edges);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod emitter;
pub mod graph;
pub mod kmer;
pub mod mercy;
pub mod packed_seq;
pub mod pipeline;
pub mod read_pipeline;
pub mod sdbg_writer;
pub mod seq_pipeline;
mod shared;
pub mod simplify;
pub mod sorter;
pub mod substring;

pub use config::SdbgConfig;
pub use emitter::{BuildStats, CountMode};
pub use graph::{BranchGroup, SdbgAccess};
pub use kmer::{Kmer, MAX_KMER_K};
pub use mercy::{InMemoryBatchSource, ReadBatchSource};
pub use packed_seq::SequencePackage;
pub use read_pipeline::{build_sdbg_from_reads, ReadsInput};
pub use sdbg_writer::stream_path;
pub use seq_pipeline::{build_sdbg_from_seqs, SeqInput};
pub use simplify::{pop_bubbles, Simplifier};
pub use sorter::{CpuSorter, Lv2Sorter};
