// SdBG output streams
// One writer owns every file of a build: the packed `.w`/`.last`/`.isd`
// streams, the multiplicity pair `.mul`/`.mul2`, the ASCII prefix-sum table
// `.f` and the packed dummy-node stream `.dn`.

use anyhow::{Context, Result};
use sdbg_common::bytes::write_u64_le;
use sdbg_common::{MAX_SMALL_MULTI, MULTI_OVERFLOW};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// `prefix` + `ext` as a sibling path (the prefix is a file-name stem, not
/// a directory).
pub fn stream_path(prefix: &Path, ext: &str) -> PathBuf {
    let mut name = prefix.as_os_str().to_os_string();
    name.push(ext);
    PathBuf::from(name)
}

/// Fixed-width bit stream packed LSB-first into 32-bit words.
struct PackedStream {
    writer: BufWriter<File>,
    path: PathBuf,
    bits_per_item: u32,
    cur_word: u32,
    bits_filled: u32,
}

impl PackedStream {
    fn create(path: PathBuf, bits_per_item: u32) -> Result<Self> {
        let file = File::create(&path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        Ok(PackedStream {
            writer: BufWriter::new(file),
            path,
            bits_per_item,
            cur_word: 0,
            bits_filled: 0,
        })
    }

    #[inline]
    fn put(&mut self, value: u32) -> Result<()> {
        debug_assert!(value < (1 << self.bits_per_item));
        self.cur_word |= value << self.bits_filled;
        self.bits_filled += self.bits_per_item;
        if self.bits_filled == 32 {
            self.flush_word()?;
        }
        Ok(())
    }

    fn flush_word(&mut self) -> Result<()> {
        self.writer
            .write_all(&self.cur_word.to_le_bytes())
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        self.cur_word = 0;
        self.bits_filled = 0;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if self.bits_filled > 0 {
            self.flush_word()?;
        }
        self.writer
            .flush()
            .with_context(|| format!("failed to flush {}", self.path.display()))
    }
}

/// All output files of one SdBG build, append-only, written in key order.
pub struct SdbgWriter {
    w: PackedStream,
    last: PackedStream,
    is_dollar: PackedStream,
    mul: BufWriter<File>,
    mul2: BufWriter<File>,
    f: BufWriter<File>,
    dn: BufWriter<File>,
    prefix: PathBuf,
}

impl SdbgWriter {
    /// Create every stream under `prefix` and write the fixed headers: the
    /// leading `-1` line of `.f` and the words-per-dummy-node word of `.dn`.
    pub fn create(prefix: &Path, words_per_dummy_node: usize) -> Result<Self> {
        let open = |ext: &str| -> Result<BufWriter<File>> {
            let path = stream_path(prefix, ext);
            Ok(BufWriter::new(File::create(&path).with_context(|| {
                format!("failed to create {}", path.display())
            })?))
        };

        let mut writer = SdbgWriter {
            w: PackedStream::create(stream_path(prefix, ".w"), 4)?,
            last: PackedStream::create(stream_path(prefix, ".last"), 1)?,
            is_dollar: PackedStream::create(stream_path(prefix, ".isd"), 1)?,
            mul: open(".mul")?,
            mul2: open(".mul2")?,
            f: open(".f")?,
            dn: open(".dn")?,
            prefix: prefix.to_path_buf(),
        };
        writeln!(writer.f, "-1").context("failed to write .f header")?;
        writer.put_dummy_word(words_per_dummy_node as u32)?;
        Ok(writer)
    }

    #[inline]
    pub fn put_w(&mut self, w: u8) -> Result<()> {
        self.w.put(w as u32)
    }

    #[inline]
    pub fn put_last(&mut self, last: bool) -> Result<()> {
        self.last.put(last as u32)
    }

    #[inline]
    pub fn put_is_dollar(&mut self, is_dollar: bool) -> Result<()> {
        self.is_dollar.put(is_dollar as u32)
    }

    /// Record one edge multiplicity. Small counts go inline into `.mul`;
    /// larger ones leave the overflow sentinel there and append
    /// `count | edge_index << 16` to `.mul2`.
    pub fn put_multiplicity(&mut self, count: u16, edge_index: u64) -> Result<()> {
        if count <= MAX_SMALL_MULTI as u16 {
            self.mul
                .write_all(&[count as u8])
                .context("failed to write .mul")?;
        } else {
            write_u64_le(&mut self.mul2, count as u64 | (edge_index << 16))
                .context("failed to write .mul2")?;
            self.mul
                .write_all(&[MULTI_OVERFLOW])
                .context("failed to write .mul")?;
        }
        Ok(())
    }

    #[inline]
    pub fn put_dummy_word(&mut self, word: u32) -> Result<()> {
        self.dn
            .write_all(&word.to_le_bytes())
            .context("failed to write .dn")
    }

    /// One cumulative-edge-count line of the `.f` table.
    pub fn put_f_line(&mut self, total_edges: u64) -> Result<()> {
        writeln!(self.f, "{total_edges}").context("failed to write .f")
    }

    /// Write the `.f` trailer and flush every stream.
    pub fn finish(mut self, total_edges: u64, kmer_k: usize, num_dollar_nodes: u64) -> Result<()> {
        writeln!(self.f, "{total_edges}").context("failed to write .f trailer")?;
        writeln!(self.f, "{kmer_k}").context("failed to write .f trailer")?;
        writeln!(self.f, "{num_dollar_nodes}").context("failed to write .f trailer")?;

        self.w.finish()?;
        self.last.finish()?;
        self.is_dollar.finish()?;
        for (stream, ext) in [
            (&mut self.mul, ".mul"),
            (&mut self.mul2, ".mul2"),
            (&mut self.f, ".f"),
            (&mut self.dn, ".dn"),
        ] {
            stream.flush().with_context(|| {
                format!("failed to flush {}", stream_path(&self.prefix, ext).display())
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packed_stream_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("graph");
        let values: Vec<u32> = (0..23).map(|i| i % 9).collect();
        {
            let mut w = SdbgWriter::create(&prefix, 2).unwrap();
            for &v in &values {
                w.put_w(v as u8).unwrap();
                w.put_last(v % 2 == 0).unwrap();
                w.put_is_dollar(v % 3 == 0).unwrap();
            }
            w.finish(values.len() as u64, 21, 0).unwrap();
        }

        let w_bytes = std::fs::read(stream_path(&prefix, ".w")).unwrap();
        let words: Vec<u32> = w_bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        let decoded: Vec<u32> = (0..values.len())
            .map(|i| (words[i / 8] >> (4 * (i % 8))) & 0xF)
            .collect();
        assert_eq!(decoded, values);

        let f_text = std::fs::read_to_string(stream_path(&prefix, ".f")).unwrap();
        let lines: Vec<&str> = f_text.lines().collect();
        assert_eq!(lines.first(), Some(&"-1"));
        assert_eq!(&lines[lines.len() - 3..], &["23", "21", "0"]);
    }

    #[test]
    fn test_multiplicity_overflow_goes_to_side_channel() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("graph");
        {
            let mut w = SdbgWriter::create(&prefix, 1).unwrap();
            w.put_multiplicity(7, 0).unwrap();
            w.put_multiplicity(300, 1).unwrap();
            w.finish(2, 15, 0).unwrap();
        }
        let mul = std::fs::read(stream_path(&prefix, ".mul")).unwrap();
        assert_eq!(mul, vec![7, MULTI_OVERFLOW]);
        let mul2 = std::fs::read(stream_path(&prefix, ".mul2")).unwrap();
        let rec = u64::from_le_bytes(mul2[..8].try_into().unwrap());
        assert_eq!(rec & 0xFFFF, 300);
        assert_eq!(rec >> 16, 1);
    }
}
