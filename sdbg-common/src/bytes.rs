// Fixed-width little-endian integer I/O
// Small helpers shared by the candidate-file and multiplicity streams

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;

/// Write a fixed 8-byte little-endian unsigned integer
pub fn write_u64_le<W: Write>(writer: &mut W, value: u64) -> io::Result<()> {
    writer.write_all(&value.to_le_bytes())
}

/// Read a fixed 8-byte little-endian unsigned integer
pub fn read_u64_le<R: Read>(reader: &mut R) -> io::Result<u64> {
    let mut bytes = [0u8; 8];
    reader.read_exact(&mut bytes)?;
    Ok(u64::from_le_bytes(bytes))
}

/// Load a whole file of little-endian u64 records.
/// The file length must be a multiple of 8 bytes.
pub fn read_u64_array<P: AsRef<Path>>(path: P) -> Result<Vec<u64>> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut reader = BufReader::new(file);

    let mut values = Vec::new();
    let mut buf = [0u8; 8 * 4096];
    loop {
        let mut filled = 0;
        while filled < buf.len() {
            let n = reader
                .read(&mut buf[filled..])
                .with_context(|| format!("failed to read {}", path.display()))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            break;
        }
        anyhow::ensure!(
            filled % 8 == 0,
            "{}: truncated u64 record ({} trailing bytes)",
            path.display(),
            filled % 8
        );
        values.extend(
            buf[..filled]
                .chunks_exact(8)
                .map(|c| u64::from_le_bytes(c.try_into().unwrap())),
        );
        if filled < buf.len() {
            break;
        }
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_u64_roundtrip() {
        let values = [0u64, 1, 255, 65536, u64::MAX, 0x1234_5678_9abc_def0];
        let mut buf = Vec::new();
        for v in values {
            write_u64_le(&mut buf, v).unwrap();
        }
        let mut cursor = Cursor::new(&buf);
        for v in values {
            assert_eq!(read_u64_le(&mut cursor).unwrap(), v);
        }
    }

    #[test]
    fn test_read_u64_array() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records");
        let values: Vec<u64> = (0..10_000u64).map(|i| i.wrapping_mul(0x9e37_79b9)).collect();
        {
            let mut f = File::create(&path).unwrap();
            for &v in &values {
                write_u64_le(&mut f, v).unwrap();
            }
        }
        assert_eq!(read_u64_array(&path).unwrap(), values);
    }

    #[test]
    fn test_read_u64_array_rejects_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad");
        std::fs::write(&path, [1u8, 2, 3]).unwrap();
        assert!(read_u64_array(&path).is_err());
    }
}
