//! The compile-time partitioning policy.
//!
//! A bias declares that one exponent class should receive a share of every
//! memory-map entry, and with which smallest-block exponent a buddy region
//! of that class is carved when sub-exponent requests arrive. Biases with
//! `ratio_num > 0` ("ratioed") take their fraction of each entry first, in
//! table order; biases with `ratio_num == 0` ("greedy") then absorb as much
//! aligned leftover as fits, keeping the residual page chain bounded.

use paging::PAGE_SHIFT;

#[derive(Debug, Clone, Copy)]
pub struct Bias {
    /// The exponent class served: blocks of `1 << exp` bytes.
    pub exp: usize,
    /// Entries shorter than `min_blocks << exp` are not worth a cut.
    pub min_blocks: usize,
    /// Share of the remaining entry taken by a ratioed bias; 0 marks the
    /// bias greedy.
    pub ratio_num: usize,
    pub ratio_den: usize,
    /// Smallest block exponent of buddy regions backed by this class.
    pub min_buddy_exp: usize,
}

impl Bias {
    pub const fn block_size(&self) -> usize {
        1 << self.exp
    }

    pub const fn is_greedy(&self) -> bool {
        self.ratio_num == 0
    }
}

/// Default policy for memory above the low-memory boundary: a slice of
/// 1 GiB blocks where an entry is large enough to afford them, a quarter of
/// the rest in 2 MiB blocks, then all aligned leftover as 2 MiB blocks.
pub static BIASES_HIGH: &[Bias] = &[
    Bias { exp: 30, min_blocks: 2, ratio_num: 1, ratio_den: 8, min_buddy_exp: 21 },
    Bias { exp: 21, min_blocks: 4, ratio_num: 1, ratio_den: 4, min_buddy_exp: PAGE_SHIFT },
    Bias { exp: 21, min_blocks: 1, ratio_num: 0, ratio_den: 1, min_buddy_exp: PAGE_SHIFT },
];

/// Default policy below the low-memory boundary. The zone is at most 1 MiB,
/// so a single greedy 64 KiB class suffices; the rest feeds the page chain.
pub static BIASES_LOW: &[Bias] = &[
    Bias { exp: 16, min_blocks: 1, ratio_num: 0, ratio_den: 1, min_buddy_exp: PAGE_SHIFT },
];
