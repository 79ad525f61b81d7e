// sdbg common library
// Shared types, constants and low-level primitives for the graph engine

pub mod bitvector;
pub mod bytes;
pub mod types;

// Re-export commonly used items
pub use bitvector::AtomicBitVector;
pub use bytes::{read_u64_array, read_u64_le, write_u64_le};
pub use types::{
    Base, Multiplicity, SmallMulti, BITS_PER_CHAR, BITS_PER_MULTI, BUCKET_BASE_SEQ,
    BUCKET_PREFIX_LEN, CHARS_PER_WORD, CHAR_MASK, MAX_DUMMY_EDGES, MAX_MULTI, MAX_SMALL_MULTI,
    MULTI_OVERFLOW, NUM_BUCKETS_READ, NUM_BUCKETS_SEQ, SENTINEL, TOP_CHAR_SHIFT, W_CHAR_BITS,
};
