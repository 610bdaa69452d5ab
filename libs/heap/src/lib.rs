//! # The kernel heap
//!
//! This crate carries the sub-page side of kernel memory: a slab of eight
//! power-of-two object classes fed by the physical memory manager, plus
//! the routing layer the kernel allocator is built on.
//!
//! ## Routing
//!
//! Requests above half a page go straight to the page-level manager,
//! which serves them in one power-of-two block; everything smaller is an
//! object of the matching slab class. On release the slab is probed
//! first — it recognizes its own addresses — and only a miss falls back
//! to the page-level manager, so neither side needs to know what the
//! other handed out.

#![no_std]

#[cfg(test)]
extern crate std;

mod slab;
pub mod stat;

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::null_mut;

use paging::{LAddr, PAGE_SIZE};
use spin::Mutex;
use static_assertions::const_assert;

pub use self::slab::{AllocPages, Pager, Slab, NR_LISTS};
pub use self::stat::Stat;

/// Requests past this go to the page-level manager.
pub const SLAB_CUTOFF: usize = PAGE_SIZE / 2;

// Class sizes are powers of two, so the boundary must be one for the
// routing to partition requests cleanly.
const_assert!(SLAB_CUTOFF.is_power_of_two());

/// The allocator the kernel mounts as its global one.
pub struct Allocator {
    slab: Slab,
    stat: Mutex<Stat>,
}

impl Allocator {
    /// Build the allocator and pre-grow every slab class.
    pub fn new(lowest_exp: usize, pages_per_list: usize, pager: Pager) -> Allocator {
        Allocator {
            slab: Slab::with_growth(lowest_exp, pager, pages_per_list),
            stat: Mutex::new(Stat::new()),
        }
    }

    pub fn stat(&self) -> Stat {
        self.stat.lock().clone()
    }

    fn account_size(layout: Layout) -> usize {
        layout.pad_to_align().size().max(layout.align())
    }
}

unsafe impl GlobalAlloc for Allocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let size = Self::account_size(layout);
        let addr = if size > SLAB_CUTOFF {
            pmm::alloc(size)
        } else {
            self.slab.alloc(size)
        };
        match addr {
            Some(addr) => {
                self.stat.lock().alloc(size);
                *addr
            }
            None => null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let addr = LAddr::new(ptr);
        let mut bytes = self.slab.free(addr);
        if bytes == 0 {
            bytes = pmm::free(addr);
        }
        if bytes == 0 {
            log::error!("heap: deallocating unknown address {:p}", ptr);
            return;
        }
        self.stat.lock().dealloc(Self::account_size(layout));
    }
}
