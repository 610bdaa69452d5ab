//! The slab layer: eight exponent classes of sub-page objects.
//!
//! Each class is one [`Freelist`] whose object size doubles from
//! `2^lowest_exp` upward. When a class runs dry the slab asks its pager
//! for fresh pages and puts a new range in service; the pager is a plain
//! function pointer so the slab works against the global manager in the
//! kernel and against private instances elsewhere.

use core::mem;

use array_macro::array;
use bitop_ex::BitOpEx;
use paging::{LAddr, PAGE_SHIFT, PAGE_SIZE};
use pmm::Freelist;

/// Number of exponent classes a slab carries.
pub const NR_LISTS: usize = 8;

/// Provider of `n` contiguous backing pages.
pub type AllocPages = fn(n: usize) -> Option<LAddr>;

pub struct Pager {
    alloc_pages: AllocPages,
}

impl Pager {
    pub const fn new(alloc_pages: AllocPages) -> Self {
        Pager { alloc_pages }
    }

    fn alloc_pages(&self, n: usize) -> Option<LAddr> {
        (self.alloc_pages)(n)
    }
}

pub struct Slab {
    lists: [Freelist; NR_LISTS],
    lowest_exp: usize,
    pager: Pager,
}

impl Slab {
    /// # Panics
    ///
    /// Panics when the class range cannot hold a link pointer or leaves
    /// the sub-page regime.
    pub fn new(lowest_exp: usize, pager: Pager) -> Slab {
        assert!(1 << lowest_exp >= mem::size_of::<usize>());
        assert!(lowest_exp + NR_LISTS - 1 < PAGE_SHIFT);
        Slab {
            lists: array![i => Freelist::new(1 << (lowest_exp + i)); NR_LISTS],
            lowest_exp,
            pager,
        }
    }

    /// Construct and grow every class by `pages_per_list` pages at once.
    pub fn with_growth(lowest_exp: usize, pager: Pager, pages_per_list: usize) -> Slab {
        let slab = Slab::new(lowest_exp, pager);
        slab.expand(pages_per_list);
        slab
    }

    pub fn lowest_exp(&self) -> usize {
        self.lowest_exp
    }

    /// Grow every class by `pages_per_list` pages.
    ///
    /// Returns the number of classes actually extended; a short count
    /// means the pager ran dry at that class and the caller decides
    /// between retrying and giving up.
    pub fn expand(&self, pages_per_list: usize) -> usize {
        if pages_per_list == 0 {
            return 0;
        }
        let bytes = pages_per_list * PAGE_SIZE;
        for (i, list) in self.lists.iter().enumerate() {
            match self.pager.alloc_pages(pages_per_list) {
                // SAFETY: the pages were just granted to us.
                Some(base) => unsafe {
                    list.init(base, base.add(bytes));
                },
                None => {
                    log::warn!("slab: pager ran dry extending class {}", i);
                    return i;
                }
            }
        }
        NR_LISTS
    }

    /// Serve `size` bytes from the smallest class that fits, growing once
    /// on demand.
    pub fn alloc(&self, size: usize) -> Option<LAddr> {
        if size == 0 || size > 1 << (self.lowest_exp + NR_LISTS - 1) {
            return None;
        }
        let i = size.log2c().max(self.lowest_exp) - self.lowest_exp;
        if let Some(addr) = self.lists[i].alloc() {
            return Some(addr);
        }
        if self.expand(1) > i {
            self.lists[i].alloc()
        } else {
            None
        }
    }

    /// Returns the object size of the owning class, or 0 when no class
    /// owns `addr` and the caller should try the next subsystem.
    pub fn free(&self, addr: LAddr) -> usize {
        self.lists
            .iter()
            .enumerate()
            .find_map(|(i, list)| {
                list.free(addr).map(|_| 1 << (self.lowest_exp + i))
            })
            .unwrap_or(0)
    }
}
