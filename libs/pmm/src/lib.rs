//! # The physical memory manager
//!
//! Starting from the firmware memory map, physical RAM is partitioned into
//! fixed-exponent pools and served back out at several granularities:
//!
//! - single pages come from a lock-free LIFO stack ([`fast::PageStack`]),
//!   the hot path;
//! - whole blocks of a biased exponent come from that exponent's
//!   [`freelist::Freelist`] in one pop;
//! - every other power of two is cut by a [`buddy::Buddy`] out of regions
//!   that are themselves lazily carved from the same-exponent freelist.
//!
//! Two independent instances of this machinery exist, split at the
//! low-memory boundary, so legacy devices can be fed from the zone below
//! it without contending with ordinary traffic.
//!
//! ## Bootstrap
//!
//! `init` picks the first usable memory-map entry that can hold the
//! manager's own control arrays, places a non-freeing [`watermark`]
//! allocator over it and carves the freelist and buddy tables from there.
//! It then walks the map and splits every available entry three ways: the
//! ratioed biases take their shares first, greedy biases absorb the
//! aligned leftover, and whatever remains joins the page stack as a chain
//! in address order. Ownership cycles are broken by construction: buddy
//! region headers come from a pool refilled off the page stack, never from
//! a buddy, and block metadata is allocated before the region it
//! describes exists.
//!
//! ## Addresses
//!
//! The memory map speaks physical addresses; everything after `init`
//! speaks linear ones. The direct-map offset is a parameter, as is the
//! physical address width probed by the architecture layer.

#![no_std]

extern crate alloc;
#[cfg(test)]
extern crate std;

pub mod bias;
pub mod boot;
pub mod buddy;
pub mod fast;
pub mod freelist;
pub mod watermark;

use core::mem;
use core::ptr::{self, NonNull};

use bitop_ex::BitOpEx;
use spin::Once;

pub use paging::{LAddr, PAddr, PAGE_SHIFT, PAGE_SIZE};

pub use self::bias::{Bias, BIASES_HIGH, BIASES_LOW};
pub use self::boot::{MemMapEntry, MemType};
pub use self::buddy::Buddy;
pub use self::fast::PageStack;
pub use self::freelist::Freelist;
pub use self::watermark::{VirtWatermark, Watermark};

/// One allocation zone: the full pool set for one side of the low-memory
/// boundary.
struct Zone {
    freelists: NonNull<Freelist>,
    buddies: NonNull<Buddy>,
    width: usize,
    biases: &'static [Bias],
    fast: PageStack,
}

// SAFETY: the arrays behind the pointers are initialized once at bootstrap
// and every component is internally synchronized.
unsafe impl Send for Zone {}
unsafe impl Sync for Zone {}

impl Zone {
    #[inline]
    fn freelist(&self, e: usize) -> &Freelist {
        debug_assert!(e < self.width);
        unsafe { &*self.freelists.as_ptr().add(e) }
    }

    #[inline]
    fn buddy(&self, e: usize) -> &Buddy {
        debug_assert!(e < self.width);
        unsafe { &*self.buddies.as_ptr().add(e) }
    }

    fn smallest_bias(&self, e: usize) -> Option<&'static Bias> {
        self.biases
            .iter()
            .filter(|bias| bias.exp >= e && bias.exp < self.width)
            .min_by_key(|bias| bias.exp)
    }

    fn alloc(&self, size: usize) -> Option<LAddr> {
        if size == 0 {
            return None;
        }
        let e = size.log2c().max(PAGE_SHIFT);
        if e >= self.width {
            return None;
        }
        if e == PAGE_SHIFT {
            // The stack is only ever seeded with whole residual pages, so a
            // dry stack falls through to the block pools instead of
            // fragmenting one of their blocks into it; a splintered block's
            // head page would later be indistinguishable from the block
            // itself on release.
            if let Some(page) = self.fast.pop() {
                return Some(page);
            }
        }

        if let Some(addr) = self.freelist(e).alloc() {
            return Some(addr);
        }

        let bias = self.smallest_bias(e)?;
        let buddy = self.buddy(bias.exp);
        if let Some(addr) = buddy.alloc(size) {
            return Some(addr);
        }
        self.grow_buddy(bias)?;
        buddy.alloc(size)
    }

    /// Returns the bytes released, 0 when nothing here owns `addr`.
    fn free(&self, addr: LAddr) -> usize {
        for bias in self.biases.iter().filter(|bias| bias.exp < self.width) {
            let bytes = self.buddy(bias.exp).free(addr);
            if bytes > 0 {
                return bytes;
            }
            if self.freelist(bias.exp).free(addr).is_some() {
                return bias.block_size();
            }
        }
        self.fast.push(addr)
    }

    /// Hand a fresh region to `bias`'s buddy, backed by one block of its
    /// freelist.
    fn grow_buddy(&self, bias: &Bias) -> Option<()> {
        let buddy = self.buddy(bias.exp);
        let backing = self.freelist(bias.exp).alloc()?;
        let metas = match self.alloc_meta_storage(buddy.meta_bytes()) {
            Some(metas) => metas,
            None => {
                self.freelist(bias.exp).free(backing);
                return None;
            }
        };
        // SAFETY: the backing block is exclusively ours and carved aligned
        // to its exponent; the meta storage was just allocated.
        match unsafe { buddy.grow(backing, metas, &self.fast) } {
            Some(_) => Some(()),
            None => {
                // The meta storage may already have donated its slack to the
                // page stack, so it cannot be returned whole; the backing
                // block can.
                self.freelist(bias.exp).free(backing);
                None
            }
        }
    }

    /// Storage for a region's out-of-band block metadata.
    ///
    /// Served from the page stack when it fits a page, otherwise carved
    /// from the smallest freelist class that can hold it, with the slack
    /// chained onto the page stack. Deliberately never routed through a
    /// buddy: region creation must not depend on the buddy being created.
    fn alloc_meta_storage(&self, bytes: usize) -> Option<LAddr> {
        let bytes = bytes.round_up_bit(PAGE_SHIFT);
        if bytes == PAGE_SIZE {
            if let Some(page) = self.fast.pop() {
                return Some(page);
            }
        }
        for e in PAGE_SHIFT + 1..self.width {
            if 1 << e < bytes {
                continue;
            }
            if let Some(block) = self.freelist(e).alloc() {
                if 1 << e > bytes {
                    // SAFETY: the tail of the block is unused and aligned.
                    unsafe { self.fast.seed(block.add(bytes), block.add(1 << e)) };
                }
                return Some(block);
            }
        }
        None
    }

    /// Partition one available stretch of linear memory; returns the bytes
    /// taken into service.
    fn carve(&self, base: LAddr, len: usize) -> usize {
        let mut cur = base.val();
        let mut len = len;
        let mut taken = 0;

        for bias in self.biases.iter().filter(|b| !b.is_greedy() && b.exp < self.width) {
            taken += self.carve_one(bias, &mut cur, &mut len);
        }
        for bias in self.biases.iter().filter(|b| b.is_greedy() && b.exp < self.width) {
            taken += self.carve_one(bias, &mut cur, &mut len);
        }

        let residual = len.round_down_bit(PAGE_SHIFT);
        if residual > 0 {
            // SAFETY: the leftover span is ours and page-aligned.
            let pages =
                unsafe { self.fast.seed(LAddr::from(cur), LAddr::from(cur + residual)) };
            taken += pages << PAGE_SHIFT;
        }
        taken
    }

    fn carve_one(&self, bias: &Bias, cur: &mut usize, len: &mut usize) -> usize {
        if *len < bias.min_blocks << bias.exp {
            return 0;
        }
        let aligned = cur.round_up_bit(bias.exp);
        let skip = aligned - *cur;
        if skip >= *len {
            return 0;
        }
        let avail = *len - skip;
        let share = if bias.is_greedy() {
            avail
        } else {
            avail * bias.ratio_num / bias.ratio_den
        };
        let range_len = share.round_down_bit(bias.exp);
        if range_len == 0 {
            return 0;
        }

        let mut taken = 0;
        if skip > 0 {
            // The alignment prefix joins the page chain instead of rotting.
            // SAFETY: the prefix is ours and page-aligned on both ends.
            let pages =
                unsafe { self.fast.seed(LAddr::from(*cur), LAddr::from(aligned)) };
            taken += pages << PAGE_SHIFT;
        }
        // SAFETY: the aligned stretch is ours exclusively.
        if unsafe {
            self.freelist(bias.exp)
                .init(LAddr::from(aligned), LAddr::from(aligned + range_len))
        }
        .is_some()
        {
            taken += range_len;
        }
        *cur = aligned + range_len;
        *len = avail - range_len;
        taken
    }

    fn stat(&self) -> ZoneStat {
        let mut stat = ZoneStat {
            fast_pages: self.fast.count(),
            freelist_free: 0,
            buddy_free: 0,
        };
        for e in 0..self.width {
            stat.freelist_free += self.freelist(e).free_bytes();
            stat.buddy_free += self.buddy(e).free_bytes();
        }
        stat
    }
}

#[derive(Debug, Default, Clone)]
pub struct ZoneStat {
    pub fast_pages: usize,
    pub freelist_free: usize,
    pub buddy_free: usize,
}

#[derive(Debug, Default, Clone)]
pub struct Stat {
    pub high: ZoneStat,
    pub low: ZoneStat,
}

/// The manager proper: one high zone, one low zone, and the direct-map
/// offset everything was converted with.
pub struct Pmm {
    id_off: usize,
    high: Zone,
    low: Zone,
    total: usize,
}

impl Pmm {
    /// Bring a manager up on the default bias tables.
    ///
    /// # Panics
    ///
    /// Panics when no memory-map entry can host the bootstrap metadata or
    /// when the map yields no usable memory at all; the kernel cannot
    /// continue either way.
    pub fn new(mmap: &[MemMapEntry], id_off: usize, paddr_width: usize) -> Pmm {
        Self::with_biases(mmap, id_off, paddr_width, bias::BIASES_HIGH, bias::BIASES_LOW)
    }

    pub fn with_biases(
        mmap: &[MemMapEntry],
        id_off: usize,
        paddr_width: usize,
        biases_high: &'static [Bias],
        biases_low: &'static [Bias],
    ) -> Pmm {
        assert!((PAGE_SHIFT + 1..=usize::BITS as usize).contains(&paddr_width));
        let width = paddr_width;

        let fl_bytes = (width * mem::size_of::<Freelist>()).round_up_bit(PAGE_SHIFT);
        let bd_bytes = (width * mem::size_of::<Buddy>()).round_up_bit(PAGE_SHIFT);
        let bootstrap = 2 * PAGE_SIZE + 2 * fl_bytes + 2 * bd_bytes;

        let (boot_idx, boot_base) = mmap
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.is_available())
            .find_map(|(i, entry)| {
                let (base, ceil) = entry.page_bounds();
                (*base >= minfo::LOW_MEM_LIMIT && *ceil - *base >= bootstrap)
                    .then_some((i, base))
            })
            .expect("pmm: no memory-map entry can hold the bootstrap metadata");

        let wm_base = boot_base.to_laddr(id_off);
        let wm = Watermark::new(wm_base, wm_base.add(bootstrap));
        let high = Self::make_zone(&wm, width, biases_high);
        let low = Self::make_zone(&wm, width, biases_low);

        let mut pmm = Pmm {
            id_off,
            high,
            low,
            total: 0,
        };

        let mut total = 0;
        for (i, entry) in mmap.iter().enumerate() {
            if !entry.is_available() {
                continue;
            }
            let (mut base, ceil) = entry.page_bounds();
            if i == boot_idx {
                // The watermark owns this entry's head for good.
                base = PAddr::new(*boot_base + bootstrap);
            }
            if *ceil <= *base {
                continue;
            }
            let zone = if *base < minfo::LOW_MEM_LIMIT {
                &pmm.low
            } else {
                &pmm.high
            };
            total += zone.carve(base.to_laddr(id_off), *ceil - *base);
        }
        assert!(total > 0, "pmm: the memory map yields no usable memory");
        pmm.total = total;

        log::info!(
            "pmm: managing {} KiB ({} KiB of bootstrap metadata)",
            total / 1024,
            wm.used() / 1024
        );
        pmm
    }

    fn make_zone(wm: &Watermark, width: usize, biases: &'static [Bias]) -> Zone {
        let freelists = wm
            .carve_array::<Freelist>(width)
            .expect("pmm: bootstrap watermark exhausted");
        let buddies = wm
            .carve_array::<Buddy>(width)
            .expect("pmm: bootstrap watermark exhausted");
        for e in 0..width {
            let min_exp = biases
                .iter()
                .find(|bias| bias.exp == e)
                .map_or(PAGE_SHIFT, |bias| bias.min_buddy_exp);
            // SAFETY: freshly carved, exclusively owned array slots.
            unsafe {
                ptr::write(freelists.as_ptr().add(e), Freelist::new(1 << e));
                ptr::write(buddies.as_ptr().add(e), Buddy::new(e, min_exp));
            }
        }
        Zone {
            freelists,
            buddies,
            width,
            biases,
            fast: PageStack::new(),
        }
    }

    /// Total bytes taken into service at bootstrap.
    pub fn total(&self) -> usize {
        self.total
    }

    #[inline]
    fn zone_of(&self, addr: LAddr) -> &Zone {
        if *addr.to_paddr(self.id_off) < minfo::LOW_MEM_LIMIT {
            &self.low
        } else {
            &self.high
        }
    }

    pub fn alloc(&self, size: usize) -> Option<LAddr> {
        self.high.alloc(size)
    }

    pub fn low_alloc(&self, size: usize) -> Option<LAddr> {
        self.low.alloc(size)
    }

    /// Returns the bytes released; 0 means no pool recognized `addr`.
    pub fn free(&self, addr: LAddr) -> usize {
        self.zone_of(addr).free(addr)
    }

    pub fn low_free(&self, addr: LAddr) -> usize {
        self.zone_of(addr).free(addr)
    }

    pub fn fast_page_alloc(&self) -> Option<LAddr> {
        self.high.alloc(PAGE_SIZE)
    }

    pub fn fast_page_free(&self, addr: LAddr) -> usize {
        self.zone_of(addr).fast.push(addr)
    }

    pub fn stat(&self) -> Stat {
        Stat {
            high: self.high.stat(),
            low: self.low.stat(),
        }
    }
}

static PMM: Once<Pmm> = Once::new();

/// Bring the global manager up. Returns the bytes under management.
///
/// # Panics
///
/// See [`Pmm::new`].
pub fn init(mmap: &[MemMapEntry], id_off: usize, paddr_width: usize) -> usize {
    PMM.call_once(|| Pmm::new(mmap, id_off, paddr_width)).total()
}

pub fn alloc(size: usize) -> Option<LAddr> {
    PMM.get().and_then(|pmm| pmm.alloc(size))
}

pub fn low_alloc(size: usize) -> Option<LAddr> {
    PMM.get().and_then(|pmm| pmm.low_alloc(size))
}

pub fn free(addr: LAddr) -> usize {
    PMM.get().map_or(0, |pmm| pmm.free(addr))
}

pub fn low_free(addr: LAddr) -> usize {
    PMM.get().map_or(0, |pmm| pmm.low_free(addr))
}

pub fn fast_page_alloc() -> Option<LAddr> {
    PMM.get().and_then(|pmm| pmm.fast_page_alloc())
}

pub fn fast_page_free(addr: LAddr) -> usize {
    PMM.get().map_or(0, |pmm| pmm.fast_page_free(addr))
}

pub fn stat() -> Stat {
    PMM.get().map(Pmm::stat).unwrap_or_default()
}
