#![no_std]

pub const KERNEL_SPACE_START: usize = 0xFFFF_8000_0000_0000;

/// Base of the higher-half direct map; `linear = physical + ID_OFFSET`.
pub const ID_OFFSET: usize = KERNEL_SPACE_START;

/// Physical addresses below this belong to the low-memory zone.
pub const LOW_MEM_LIMIT: usize = 0x10_0000;
