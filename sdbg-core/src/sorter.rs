// Lv2 substring sorting
// Produces a permutation ordering the strided substrings ascending by their
// full multi-word key, stable on ties. The column-major layout makes every
// radix pass a linear scan of one word column.

use rayon::prelude::*;

/// Sorting backend seam. The CPU implementation below is mandatory; a
/// device-accelerated key-value sorter can be slotted in as long as it
/// produces the identical permutation on equal keys.
pub trait Lv2Sorter: Send {
    /// Sort the first `n_items` substrings of `substrings` (stride =
    /// `n_items`, `words_per_substring` words each) into `permutation`.
    fn sort(
        &mut self,
        substrings: &[u32],
        permutation: &mut [u32],
        words_per_substring: usize,
        n_items: usize,
    );
}

/// LSD radix sort over 32-bit word columns, least significant word first.
/// Each pass packs `(column_word << 32) | position` into the scratch buffer
/// and sorts it; the position in the low bits keeps equal keys in their
/// current order, so the pass is stable and the final permutation breaks
/// full-key ties by original position.
pub struct CpuSorter {
    sort_space: Vec<u64>,
    scratch_perm: Vec<u32>,
}

impl CpuSorter {
    pub fn with_capacity(max_items: usize) -> Self {
        CpuSorter {
            sort_space: vec![0; max_items],
            scratch_perm: vec![0; max_items],
        }
    }
}

impl Lv2Sorter for CpuSorter {
    fn sort(
        &mut self,
        substrings: &[u32],
        permutation: &mut [u32],
        words_per_substring: usize,
        n_items: usize,
    ) {
        debug_assert!(self.sort_space.len() >= n_items);
        let perm = &mut permutation[..n_items];
        let space = &mut self.sort_space[..n_items];
        let scratch = &mut self.scratch_perm[..n_items];

        perm.par_iter_mut()
            .enumerate()
            .for_each(|(i, p)| *p = i as u32);

        for w in (0..words_per_substring).rev() {
            let column = &substrings[w * n_items..(w + 1) * n_items];
            space
                .par_iter_mut()
                .enumerate()
                .for_each(|(i, s)| *s = (column[perm[i] as usize] as u64) << 32 | i as u64);
            space.par_sort_unstable();
            scratch
                .par_iter_mut()
                .enumerate()
                .for_each(|(i, p)| *p = perm[(space[i] & 0xFFFF_FFFF) as usize]);
            perm.copy_from_slice(scratch);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Row-major reference item for comparison
    fn item_key(substrings: &[u32], stride: usize, words: usize, item: usize) -> Vec<u32> {
        (0..words).map(|w| substrings[w * stride + item]).collect()
    }

    fn strided_from_rows(rows: &[Vec<u32>]) -> Vec<u32> {
        let n = rows.len();
        let words = rows[0].len();
        let mut buf = vec![0u32; n * words];
        for (i, row) in rows.iter().enumerate() {
            for (w, &v) in row.iter().enumerate() {
                buf[w * n + i] = v;
            }
        }
        buf
    }

    #[test]
    fn test_sorts_multi_word_keys() {
        let rows: Vec<Vec<u32>> = vec![
            vec![2, 0, 9],
            vec![1, 5, 0],
            vec![2, 0, 3],
            vec![0, u32::MAX, 7],
            vec![1, 4, u32::MAX],
        ];
        let n = rows.len();
        let buf = strided_from_rows(&rows);
        let mut perm = vec![0u32; n];
        let mut sorter = CpuSorter::with_capacity(n);
        sorter.sort(&buf, &mut perm, 3, n);

        let mut expect: Vec<usize> = (0..n).collect();
        expect.sort_by_key(|&i| rows[i].clone());
        assert_eq!(perm.iter().map(|&p| p as usize).collect::<Vec<_>>(), expect);
        for pair in perm.windows(2) {
            let a = item_key(&buf, n, 3, pair[0] as usize);
            let b = item_key(&buf, n, 3, pair[1] as usize);
            assert!(a <= b);
        }
    }

    #[test]
    fn test_stable_on_equal_keys() {
        // Three identical keys interleaved with others: ties must keep
        // original item order.
        let rows: Vec<Vec<u32>> = vec![
            vec![7, 7],
            vec![1, 2],
            vec![7, 7],
            vec![0, 0],
            vec![7, 7],
        ];
        let n = rows.len();
        let buf = strided_from_rows(&rows);
        let mut perm = vec![0u32; n];
        let mut sorter = CpuSorter::with_capacity(n);
        sorter.sort(&buf, &mut perm, 2, n);
        assert_eq!(perm, vec![3, 1, 0, 2, 4]);
    }

    #[test]
    fn test_large_random_matches_comparison_sort() {
        let n = 5000;
        let words = 3;
        // Deterministic pseudo-random rows with many duplicate columns
        let mut state = 0x2545_f491_4f6c_dd1du64;
        let mut next = move || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state
        };
        let rows: Vec<Vec<u32>> = (0..n)
            .map(|_| (0..words).map(|_| (next() % 16) as u32).collect())
            .collect();
        let buf = strided_from_rows(&rows);
        let mut perm = vec![0u32; n];
        let mut sorter = CpuSorter::with_capacity(n);
        sorter.sort(&buf, &mut perm, words, n);

        let mut expect: Vec<usize> = (0..n).collect();
        expect.sort_by_key(|&i| (rows[i].clone(), i));
        assert_eq!(perm.iter().map(|&p| p as usize).collect::<Vec<_>>(), expect);
    }
}
