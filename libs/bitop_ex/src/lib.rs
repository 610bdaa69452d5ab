#![no_std]

use core::mem;

use num_traits::{PrimInt, WrappingAdd, WrappingSub};

pub trait BitOpEx:
    PrimInt + WrappingAdd + WrappingSub
{
    const BIT_SIZE: usize = mem::size_of::<Self>() * 8;

    /// Round up to the next multiple of `1 << bit`.
    #[inline]
    fn round_up_bit(self, bit: usize) -> Self {
        let mask = (Self::one() << bit).wrapping_sub(&Self::one());
        (self.wrapping_sub(&Self::one()) | mask).wrapping_add(&Self::one())
    }

    /// Round down to the previous multiple of `1 << bit`.
    #[inline]
    fn round_down_bit(self, bit: usize) -> Self {
        let mask = (Self::one() << bit).wrapping_sub(&Self::one());
        self & !mask
    }

    #[inline]
    fn div_ceil_bit(self, bit: usize) -> Self {
        self.round_up_bit(bit) >> bit
    }

    #[inline]
    fn contains_bit(self, mask: Self) -> bool {
        self & mask != Self::zero()
    }

    /// Index of the lowest set bit. The value must not be zero.
    #[inline]
    fn lsb(self) -> usize {
        self.trailing_zeros() as usize
    }

    /// Index of the highest set bit. The value must not be zero.
    #[inline]
    fn msb(self) -> usize {
        Self::BIT_SIZE - 1 - self.leading_zeros() as usize
    }

    /// `floor(log2(self))`.
    #[inline]
    fn log2f(self) -> usize {
        self.msb()
    }

    /// `ceil(log2(self))`.
    #[inline]
    fn log2c(self) -> usize {
        self.msb() + (self.msb() != self.lsb()) as usize
    }
}

impl<T> BitOpEx for T where T: PrimInt + WrappingAdd + WrappingSub {}
