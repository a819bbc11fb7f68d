//! Invertible permutations decoupling user block ids from internal ones.
//!
//! Without a permutation, a contiguous user-id range maps to one storage
//! range and therefore one holder set — a hotspot under skewed access. The
//! range-preserving Feistel permutation scatters coarse structure across
//! the whole id space while keeping runs of `bucket_size` consecutive ids
//! contiguous, so bulk transfers still move dense spans.

use xxhash_rust::xxh64::xxh64;

use crate::BlockId;

const NUM_ROUNDS: usize = 4;

/// Keyed pseudo-random permutation over `[0, max_value]`.
///
/// A balanced four-round Feistel network over the domain rounded up to an
/// even number of bits, with XXH64 as the round function and cycle-walking
/// to confine outputs to the domain. The inverse runs the rounds with the
/// key order reversed.
#[derive(Debug, Clone)]
pub struct Feistel {
    max_value: u64,
    keys: [u64; NUM_ROUNDS],
    bits_half: u32,
    right_mask: u64,
}

impl Feistel {
    pub fn new(max_value: u64, seed: u64) -> Self {
        let mut bits = 64 - max_value.leading_zeros();
        if bits == 0 {
            bits = 1;
        }
        // An odd width would need an unbalanced network; one extra bit
        // costs an expected factor of two more cycle walks instead.
        if bits % 2 == 1 {
            bits += 1;
        }
        let bits_half = bits / 2;
        let right_mask = (1u64 << bits_half) - 1;

        let mut keys = [0u64; NUM_ROUNDS];
        for (round, key) in keys.iter_mut().enumerate() {
            *key = xxh64(&(round as u64).to_le_bytes(), seed);
        }

        Self {
            max_value,
            keys,
            bits_half,
            right_mask,
        }
    }

    fn round(&self, half: u64, key: u64) -> u64 {
        xxh64(&half.to_le_bytes(), key) & self.right_mask
    }

    fn network(&self, n: u64, reverse: bool) -> u64 {
        let mut left = (n >> self.bits_half) & self.right_mask;
        let mut right = n & self.right_mask;
        if !reverse {
            for &key in &self.keys {
                let tmp = left ^ self.round(right, key);
                left = right;
                right = tmp;
            }
        } else {
            for &key in self.keys.iter().rev() {
                let tmp = right ^ self.round(left, key);
                right = left;
                left = tmp;
            }
        }
        (left << self.bits_half) | right
    }

    fn walk(&self, mut n: u64, reverse: bool) -> u64 {
        debug_assert!(n <= self.max_value);
        // The network permutes the padded power-of-four domain; iterating
        // stays inside the cycle of n, so it re-enters [0, max_value].
        loop {
            n = self.network(n, reverse);
            if n <= self.max_value {
                return n;
            }
        }
    }

    pub fn apply(&self, n: u64) -> u64 {
        self.walk(n, false)
    }

    pub fn inverse(&self, n: u64) -> u64 {
        self.walk(n, true)
    }
}

/// Range-preserving permutation over `[0, num_blocks)`.
///
/// User ids are grouped into buckets of `bucket_size` consecutive ids; the
/// Feistel network permutes bucket indices and the offset within a bucket
/// is kept, so `apply` is the identity on offsets and a bijection on
/// buckets.
#[derive(Debug, Clone)]
pub struct RangeFeistel {
    num_blocks: u64,
    bucket_size: u64,
    num_buckets: u64,
    feistel: Feistel,
    /// When the trailing bucket is partial it must land on the trailing
    /// image slot for the permutation to stay inside `[0, num_blocks)`.
    /// `(t, u)` swaps the images of `t = F⁻¹(last)` and `last`, where
    /// `u = F(last)`.
    pin: Option<(u64, u64)>,
}

impl RangeFeistel {
    pub fn new(num_blocks: u64, bucket_size: u64, seed: u64) -> Self {
        debug_assert!(num_blocks > 0);
        debug_assert!(bucket_size > 0);
        let num_buckets = num_blocks.div_ceil(bucket_size);
        let feistel = Feistel::new(num_buckets - 1, seed);
        let pin = if num_blocks % bucket_size != 0 && num_buckets > 1 {
            let last = num_buckets - 1;
            Some((feistel.inverse(last), feistel.apply(last)))
        } else {
            None
        };
        Self {
            num_blocks,
            bucket_size,
            num_buckets,
            feistel,
            pin,
        }
    }

    fn bucket_apply(&self, bucket: u64) -> u64 {
        let last = self.num_buckets - 1;
        match self.pin {
            Some(_) if bucket == last => last,
            Some((t, u)) if bucket == t => u,
            _ => self.feistel.apply(bucket),
        }
    }

    fn bucket_inverse(&self, bucket: u64) -> u64 {
        let last = self.num_buckets - 1;
        match self.pin {
            Some(_) if bucket == last => last,
            Some((t, u)) if bucket == u => t,
            _ => self.feistel.inverse(bucket),
        }
    }

    pub fn apply(&self, id: BlockId) -> BlockId {
        debug_assert!(id < self.num_blocks);
        self.bucket_apply(id / self.bucket_size) * self.bucket_size + id % self.bucket_size
    }

    pub fn inverse(&self, id: BlockId) -> BlockId {
        debug_assert!(id < self.num_blocks);
        self.bucket_inverse(id / self.bucket_size) * self.bucket_size + id % self.bucket_size
    }
}

/// The permutation applied between user ids and internal ids.
#[derive(Debug, Clone)]
pub enum Permutation {
    /// Internal ids equal user ids.
    Identity { num_blocks: u64 },
    /// Keyed bucket-scattering permutation.
    RangeFeistel(RangeFeistel),
}

impl Permutation {
    pub fn identity(num_blocks: u64) -> Self {
        Permutation::Identity { num_blocks }
    }

    pub fn range_feistel(num_blocks: u64, bucket_size: u64, seed: u64) -> Self {
        Permutation::RangeFeistel(RangeFeistel::new(num_blocks, bucket_size, seed))
    }

    pub fn num_blocks(&self) -> u64 {
        match self {
            Permutation::Identity { num_blocks } => *num_blocks,
            Permutation::RangeFeistel(p) => p.num_blocks,
        }
    }

    /// Length of the consecutive runs this permutation preserves. Requests
    /// are split at multiples of this length before projection.
    pub fn bucket_size(&self) -> u64 {
        match self {
            Permutation::Identity { num_blocks } => *num_blocks,
            Permutation::RangeFeistel(p) => p.bucket_size,
        }
    }

    /// User id to internal id.
    pub fn apply(&self, id: BlockId) -> BlockId {
        match self {
            Permutation::Identity { .. } => id,
            Permutation::RangeFeistel(p) => p.apply(id),
        }
    }

    /// Internal id back to user id.
    pub fn inverse(&self, id: BlockId) -> BlockId {
        match self {
            Permutation::Identity { .. } => id,
            Permutation::RangeFeistel(p) => p.inverse(id),
        }
    }
}
