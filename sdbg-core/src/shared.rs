// Shared mutable slice for disjoint concurrent writes
// The bucket layout of the lv1 and lv2 buffers interleaves per-thread slots,
// so the regions owned by each worker are not contiguous and cannot be
// expressed with `split_at_mut`.

use std::marker::PhantomData;

/// A raw view over a mutable slice that several workers write at disjoint
/// indices. All access goes through `unsafe` methods; the caller asserts
/// the disjointness that the slot layout guarantees.
pub struct SharedSlice<'a, T> {
    ptr: *mut T,
    len: usize,
    _marker: PhantomData<&'a mut [T]>,
}

unsafe impl<T: Send> Send for SharedSlice<'_, T> {}
unsafe impl<T: Send> Sync for SharedSlice<'_, T> {}

impl<'a, T> SharedSlice<'a, T> {
    pub fn new(slice: &'a mut [T]) -> Self {
        SharedSlice {
            ptr: slice.as_mut_ptr(),
            len: slice.len(),
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Write `value` at `idx`.
    ///
    /// # Safety
    /// No other thread may read or write `idx` until the writers are joined.
    #[inline]
    pub unsafe fn write(&self, idx: usize, value: T) {
        debug_assert!(idx < self.len);
        *self.ptr.add(idx) = value;
    }

    /// Read the value at `idx`.
    ///
    /// # Safety
    /// No other thread may be writing `idx` concurrently.
    #[inline]
    pub unsafe fn read(&self, idx: usize) -> T
    where
        T: Copy,
    {
        debug_assert!(idx < self.len);
        *self.ptr.add(idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_disjoint_parallel_writes() {
        let mut data = vec![0u32; 1024];
        {
            let shared = SharedSlice::new(&mut data);
            thread::scope(|s| {
                for t in 0..4usize {
                    let shared = &shared;
                    s.spawn(move || {
                        // Strided ownership: thread t writes indices i with i % 4 == t.
                        for i in (t..1024).step_by(4) {
                            unsafe { shared.write(i, i as u32 + 1) };
                        }
                    });
                }
            });
        }
        assert!(data.iter().enumerate().all(|(i, &v)| v == i as u32 + 1));
    }
}
