//! Binary-buddy allocation over power-of-two regions.
//!
//! A [`Buddy`] serves one exponent class. It owns a list of [`Region`]s,
//! each spanning `2^exp` bytes carved out of the same-exponent freelist,
//! and splits them down to `2^min_exp` granularity on demand.
//!
//! ## Block bookkeeping
//!
//! Free blocks carry an in-band header: a link pointer fenced by two stamp
//! words. The stamps are written when a block goes onto a free list and
//! cleared when it leaves, so a merge candidate whose stamps do not match
//! is either allocated or damaged and is left alone either way.
//!
//! Out of band, one byte per smallest-granularity slot records the exponent
//! of the block currently starting there. Entries interior to a larger
//! block are stale until a split writes them again.
//!
//! ## Split and merge
//!
//! Allocation walks the per-order lists upward from the requested order,
//! pops the first servable block and halves it until it fits, parking each
//! upper half on the next list down. Deallocation reads the block's
//! exponent, then repeatedly absorbs the sibling at `addr ^ (1 << k)` while
//! that sibling is genuinely free, the lower address becoming the
//! representative of each union. Region bases are aligned to `2^exp`, which
//! is what makes the XOR jump land on the sibling in the first place.

use core::cmp::min;
use core::mem;
use core::ptr::{self, NonNull};

use bitop_ex::BitOpEx;
use intrusive_collections::{intrusive_adapter, LinkedList, LinkedListLink};
use paging::{LAddr, PAGE_SIZE};
use spin::Mutex;

use crate::fast::PageStack;
use crate::freelist::Freelist;

/// Widest split ladder a region may need: `exp - min_exp` never reaches
/// this in any sane bias table (1 GiB regions of page granularity need 19).
pub const MAX_REGION_ORDERS: usize = 20;

#[repr(C)]
struct BuddyNode {
    canary_low: u64,
    next: *mut BuddyNode,
    canary_high: u64,
}

impl BuddyNode {
    /// # Safety
    ///
    /// `node` must point into an owned free block.
    unsafe fn stamp(node: *mut BuddyNode, next: *mut BuddyNode) {
        ptr::write(node, BuddyNode {
            canary_low: canary::CANARY_LOW,
            next,
            canary_high: canary::CANARY_HIGH,
        });
    }

    /// # Safety
    ///
    /// `node` must point into an owned block.
    unsafe fn clear(node: *mut BuddyNode) {
        (*node).canary_low = canary::CLEARED;
        (*node).canary_high = canary::CLEARED;
    }

    /// # Safety
    ///
    /// `node` must be readable.
    unsafe fn is_stamped(node: *mut BuddyNode) -> bool {
        canary::check((*node).canary_low, (*node).canary_high)
    }
}

/// Exponent of the block currently starting at one smallest-exponent slot.
#[derive(Clone, Copy)]
#[repr(transparent)]
struct NodeMeta {
    exp: u8,
}

enum Unlink {
    Removed,
    NotFound,
    Corrupt,
}

struct RegionInner {
    metas: NonNull<NodeMeta>,
    free: [*mut BuddyNode; MAX_REGION_ORDERS],
    free_count: usize,
}

impl RegionInner {
    /// # Safety
    ///
    /// `idx` must be within the meta array.
    unsafe fn exp_at(&self, idx: usize) -> usize {
        (*self.metas.as_ptr().add(idx)).exp as usize
    }

    /// # Safety
    ///
    /// `idx` must be within the meta array.
    unsafe fn set_exp(&mut self, idx: usize, exp: usize) {
        ptr::write(self.metas.as_ptr().add(idx), NodeMeta { exp: exp as u8 });
    }

    /// # Safety
    ///
    /// `node` must be an owned free block start.
    unsafe fn push(&mut self, slot: usize, node: *mut BuddyNode) {
        BuddyNode::stamp(node, self.free[slot]);
        self.free[slot] = node;
        self.free_count += 1;
    }

    /// # Safety
    ///
    /// The chain of `free[slot]` must be readable.
    unsafe fn on_list(&self, slot: usize, node: *mut BuddyNode) -> bool {
        let mut cur = self.free[slot];
        while !cur.is_null() {
            if cur == node {
                return true;
            }
            cur = (*cur).next;
        }
        false
    }

    /// Remove `node` from `free[slot]` if it is a member with intact stamps.
    ///
    /// # Safety
    ///
    /// The chain of `free[slot]` must be readable and exclusively owned.
    unsafe fn unlink(&mut self, slot: usize, node: *mut BuddyNode) -> Unlink {
        let mut prev: *mut BuddyNode = ptr::null_mut();
        let mut cur = self.free[slot];
        while !cur.is_null() {
            if !BuddyNode::is_stamped(cur) {
                return Unlink::Corrupt;
            }
            if cur == node {
                let next = (*cur).next;
                if prev.is_null() {
                    self.free[slot] = next;
                } else {
                    (*prev).next = next;
                }
                self.free_count -= 1;
                return Unlink::Removed;
            }
            prev = cur;
            cur = (*cur).next;
        }
        Unlink::NotFound
    }
}

/// One `2^exp` span under buddy management. Headers live in the owning
/// [`Buddy`]'s meta pool, never inside the span itself.
#[repr(C)]
pub struct Region {
    link: LinkedListLink,
    base: LAddr,
    exp: usize,
    min_exp: usize,
    inner: Mutex<RegionInner>,
}

intrusive_adapter!(RegionAdapter = &'static Region: Region { link: LinkedListLink });

impl Region {
    /// Construct a region in place at `slot`, with the whole span as one
    /// free block.
    ///
    /// # Safety
    ///
    /// `slot` must be writable and sized for a `Region`; `[base,
    /// base + 2^exp)` must be valid, writable, exclusively owned and
    /// `2^exp`-aligned; `metas` must hold `2^(exp - min_exp)` entries.
    unsafe fn init_at(
        slot: NonNull<Region>,
        base: LAddr,
        exp: usize,
        min_exp: usize,
        metas: NonNull<NodeMeta>,
    ) -> &'static Region {
        debug_assert!(min_exp <= exp && exp - min_exp < MAX_REGION_ORDERS);
        debug_assert!(base.is_aligned_bit(exp));
        debug_assert!(1usize << min_exp >= mem::size_of::<BuddyNode>());

        let mut inner = RegionInner {
            metas,
            free: [ptr::null_mut(); MAX_REGION_ORDERS],
            free_count: 0,
        };
        inner.set_exp(0, exp);
        inner.push(exp - min_exp, base.cast());

        ptr::write(slot.as_ptr(), Region {
            link: LinkedListLink::new(),
            base,
            exp,
            min_exp,
            inner: Mutex::new(inner),
        });
        &*slot.as_ptr()
    }

    pub fn base(&self) -> LAddr {
        self.base
    }

    #[inline]
    fn contains(&self, addr: LAddr) -> bool {
        self.base <= addr && addr.val() - self.base.val() < 1 << self.exp
    }

    #[inline]
    fn idx(&self, addr: usize) -> usize {
        (addr - self.base.val()) >> self.min_exp
    }

    fn alloc(&self, e: usize) -> Option<LAddr> {
        let mut inner = self.inner.lock();
        let k = (e..=self.exp).find(|&k| !inner.free[k - self.min_exp].is_null())?;

        let node = inner.free[k - self.min_exp];
        // SAFETY: the head of a free list is an owned free block.
        unsafe {
            if !BuddyNode::is_stamped(node) {
                log::error!("buddy: stamp mismatch on {:p}, allocation refused", node);
                return None;
            }
            inner.free[k - self.min_exp] = (*node).next;
            inner.free_count -= 1;
            BuddyNode::clear(node);
        }

        // Split downward; the lower half stays, the upper half is parked.
        let base = node as usize;
        let mut level = k;
        while level > e {
            level -= 1;
            let upper = base ^ (1 << level);
            // SAFETY: both halves lie inside the popped block.
            unsafe {
                inner.set_exp(self.idx(upper), level);
                inner.set_exp(self.idx(base), level);
                inner.push(level - self.min_exp, upper as *mut BuddyNode);
            }
        }
        log::trace!("buddy: alloc {:#x} order {}", base, e);
        Some(LAddr::from(base))
    }

    /// Returns the bytes released, 0 when the request is refused.
    fn free(&self, addr: LAddr) -> usize {
        if !self.contains(addr) {
            return 0;
        }
        let a = addr.val();
        if (a - self.base.val()).contains_bit((1 << self.min_exp) - 1) {
            return 0;
        }

        let mut inner = self.inner.lock();
        // SAFETY: the index was bounds-checked above.
        let mut k = unsafe { inner.exp_at(self.idx(a)) };
        if !(self.min_exp..=self.exp).contains(&k)
            || (a - self.base.val()).contains_bit((1 << k) - 1)
        {
            log::warn!("buddy: {:#x} is not a block start", a);
            return 0;
        }
        // SAFETY: free-list chains are owned under the region lock.
        if unsafe { inner.on_list(k - self.min_exp, a as *mut BuddyNode) } {
            log::error!("buddy: double free of {:#x}", a);
            return 0;
        }

        let mut cur = a;
        while k < self.exp {
            let buddy = cur ^ (1 << k);
            // SAFETY: the sibling index lies inside the region.
            if unsafe { inner.exp_at(self.idx(buddy)) } != k {
                break;
            }
            match unsafe { inner.unlink(k - self.min_exp, buddy as *mut BuddyNode) } {
                Unlink::Removed => {
                    // SAFETY: the sibling is ours now; strip its stamps so a
                    // later merge never mistakes the absorbed half for free.
                    unsafe { BuddyNode::clear(buddy as *mut BuddyNode) };
                    cur = min(cur, buddy);
                    k += 1;
                    unsafe { inner.set_exp(self.idx(cur), k) };
                }
                Unlink::NotFound => break,
                Unlink::Corrupt => {
                    log::error!("buddy: stamp mismatch near {:#x}, merge refused", buddy);
                    break;
                }
            }
        }

        // SAFETY: `cur` is a fully owned block of order `k`.
        unsafe {
            inner.set_exp(self.idx(cur), k);
            inner.push(k - self.min_exp, cur as *mut BuddyNode);
        }
        log::trace!("buddy: free {:#x} order {}", cur, k);
        1 << k
    }

    fn free_bytes(&self) -> usize {
        let inner = self.inner.lock();
        (self.min_exp..=self.exp)
            .map(|k| {
                let mut n = 0;
                let mut cur = inner.free[k - self.min_exp];
                while !cur.is_null() {
                    n += 1;
                    cur = unsafe { (*cur).next };
                }
                n << k
            })
            .sum()
    }

    #[cfg(test)]
    fn free_nodes(&self, k: usize) -> std::vec::Vec<usize> {
        let inner = self.inner.lock();
        let mut nodes = std::vec::Vec::new();
        let mut cur = inner.free[k - self.min_exp];
        while !cur.is_null() {
            nodes.push(cur as usize);
            cur = unsafe { (*cur).next };
        }
        nodes
    }
}

// SAFETY: every raw chain and meta entry is only touched under the region
// lock; the intrusive link only under the owning `Buddy`'s region lock.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

/// All buddy regions of one exponent class.
pub struct Buddy {
    regions: Mutex<LinkedList<RegionAdapter>>,
    metas: Freelist,
    exp: usize,
    min_exp: usize,
}

unsafe impl Send for Buddy {}
unsafe impl Sync for Buddy {}

impl Buddy {
    pub fn new(exp: usize, min_exp: usize) -> Self {
        Buddy {
            regions: Mutex::new(LinkedList::new(RegionAdapter::new())),
            metas: Freelist::new(mem::size_of::<Region>().next_power_of_two()),
            exp,
            min_exp,
        }
    }

    pub fn exp(&self) -> usize {
        self.exp
    }

    pub fn min_exp(&self) -> usize {
        self.min_exp
    }

    /// Bytes of out-of-band block metadata one region needs.
    pub fn meta_bytes(&self) -> usize {
        (1 << (self.exp - self.min_exp)) * mem::size_of::<NodeMeta>()
    }

    pub fn alloc(&self, size: usize) -> Option<LAddr> {
        if size == 0 || size > 1 << self.exp {
            return None;
        }
        let e = size.log2c().max(self.min_exp);
        let regions = self.regions.lock();
        regions.iter().find_map(|region| region.alloc(e))
    }

    /// Returns the bytes released, 0 when no region owns `addr`.
    pub fn free(&self, addr: LAddr) -> usize {
        let regions = self.regions.lock();
        regions
            .iter()
            .find(|region| region.contains(addr))
            .map_or(0, |region| region.free(addr))
    }

    /// Bring the `2^exp` block at `base` into service as a new region.
    ///
    /// The region header comes from the meta pool, which tops itself up
    /// from the fast-page stack; `node_metas` must point at
    /// [`Self::meta_bytes`] writable bytes obtained beforehand.
    ///
    /// # Safety
    ///
    /// `base` must be a `2^exp`-aligned span owned by the caller, and
    /// `node_metas` exclusively owned storage of sufficient size.
    pub unsafe fn grow(&self, base: LAddr, node_metas: LAddr, fast: &PageStack) -> Option<&'static Region> {
        let slot = match self.metas.alloc() {
            Some(slot) => slot,
            None => {
                let page = fast.pop()?;
                self.metas.init(page, page.add(PAGE_SIZE))?;
                self.metas.alloc()?
            }
        };
        let metas = NonNull::new(node_metas.cast::<NodeMeta>())?;
        let region = Region::init_at(
            NonNull::new(slot.cast::<Region>())?,
            base,
            self.exp,
            self.min_exp,
            metas,
        );
        self.regions.lock().push_front(region);
        Some(region)
    }

    pub fn free_bytes(&self) -> usize {
        self.regions.lock().iter().map(Region::free_bytes).sum()
    }

    #[cfg(test)]
    fn with_first_region<R>(&self, f: impl FnOnce(&Region) -> R) -> R {
        let regions = self.regions.lock();
        f(regions.front().get().unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::alloc::Layout;
    use std::vec::Vec;

    const EXP: usize = 21;
    const MIN: usize = 12;

    struct Fixture {
        buddy: Buddy,
        base: LAddr,
        page: LAddr,
        layout: Layout,
        region_layout: Layout,
        _metas: Vec<u8>,
    }

    impl Fixture {
        fn new() -> Fixture {
            let region_layout =
                Layout::from_size_align(1 << EXP, 1 << EXP).unwrap();
            let buf = unsafe { std::alloc::alloc(region_layout) };
            assert!(!buf.is_null());
            let base = LAddr::new(buf);

            // One host page backs the meta pool.
            let layout = Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap();
            let page = unsafe { std::alloc::alloc(layout) };
            assert!(!page.is_null());
            let fast = PageStack::new();
            assert_eq!(fast.push(LAddr::new(page)), PAGE_SIZE);

            let buddy = Buddy::new(EXP, MIN);
            let mut metas = Vec::new();
            metas.resize(buddy.meta_bytes(), 0u8);
            let metas_addr = LAddr::new(metas.as_mut_ptr());
            unsafe { buddy.grow(base, metas_addr, &fast) }.unwrap();

            Fixture {
                buddy,
                base,
                page: LAddr::new(page),
                layout,
                region_layout,
                _metas: metas,
            }
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            // The meta-pool page is still referenced by `buddy`, but nothing
            // touches it past this point.
            unsafe {
                std::alloc::dealloc(*self.base, self.region_layout);
                std::alloc::dealloc(*self.page, self.layout);
            }
        }
    }

    #[test]
    fn split_serves_adjacent_siblings() {
        let fx = Fixture::new();
        let p = fx.buddy.alloc(1 << 16).unwrap();
        assert_eq!(p, fx.base);
        let q = fx.buddy.alloc(1 << 16).unwrap();
        assert_eq!(q, fx.base.add(0x10000));
        assert_eq!(fx.buddy.free(p), 0x10000);
        assert_eq!(fx.buddy.free(q), 1 << EXP);
    }

    #[test]
    fn allocations_are_size_aligned() {
        let fx = Fixture::new();
        for &size in &[0x1000usize, 0x3000, 0x10000, 0x4242] {
            let addr = fx.buddy.alloc(size).unwrap();
            let rounded = size.next_power_of_two().max(1 << MIN);
            assert_eq!(addr.val() % rounded, 0, "size {size:#x}");
            assert_eq!(fx.buddy.free(addr), rounded);
        }
    }

    #[test]
    fn merge_restores_the_whole_region() {
        let fx = Fixture::new();
        let a = fx.buddy.alloc(1 << 20).unwrap();
        let b = fx.buddy.alloc(1 << 20).unwrap();

        // Free in both orders; either way one top-order block remains.
        assert_eq!(fx.buddy.free(b), 1 << 20);
        assert_eq!(fx.buddy.free(a), 1 << EXP);
        let top = fx.buddy.with_first_region(|r| r.free_nodes(EXP));
        assert_eq!(top, [fx.base.val()]);

        let a = fx.buddy.alloc(1 << 20).unwrap();
        let b = fx.buddy.alloc(1 << 20).unwrap();
        assert_eq!(fx.buddy.free(a), 1 << 20);
        assert_eq!(fx.buddy.free(b), 1 << EXP);
        let top = fx.buddy.with_first_region(|r| r.free_nodes(EXP));
        assert_eq!(top, [fx.base.val()]);
    }

    #[test]
    fn no_sibling_pair_stays_free() {
        let fx = Fixture::new();
        let mut held: Vec<_> = (0..8).map(|_| fx.buddy.alloc(0x1000).unwrap()).collect();
        for addr in held.drain(..) {
            assert!(fx.buddy.free(addr) > 0);
        }
        fx.buddy.with_first_region(|region| {
            for k in MIN..=EXP {
                let nodes = region.free_nodes(k);
                for &node in &nodes {
                    // Every free block is aligned to its own order, its
                    // recorded exponent matches the list holding it, and
                    // its stamps are intact.
                    assert_eq!(node % (1 << k), 0);
                    let inner = region.inner.lock();
                    assert_eq!(unsafe { inner.exp_at(region.idx(node)) }, k);
                    drop(inner);
                    assert!(unsafe { BuddyNode::is_stamped(node as *mut BuddyNode) });

                    let sibling = node ^ (1 << k);
                    assert!(
                        !nodes.contains(&sibling),
                        "siblings {node:#x}/{sibling:#x} both free at order {k}"
                    );
                }
            }
        });
        // Everything merged back into the single top block.
        assert_eq!(fx.buddy.free_bytes(), 1 << EXP);
    }

    #[test]
    fn exhaustion_and_oversize_fail_cleanly() {
        let fx = Fixture::new();
        assert!(fx.buddy.alloc(0).is_none());
        assert!(fx.buddy.alloc((1 << EXP) + 1).is_none());
        let whole = fx.buddy.alloc(1 << EXP).unwrap();
        assert!(fx.buddy.alloc(0x1000).is_none());
        assert_eq!(fx.buddy.free(whole), 1 << EXP);
    }

    #[test]
    fn double_free_is_refused() {
        let fx = Fixture::new();
        let p = fx.buddy.alloc(0x1000).unwrap();
        assert_eq!(fx.buddy.free(p), 0x1000);
        assert_eq!(fx.buddy.free(p), 0);
        // The refused call must not have changed anything.
        assert_eq!(fx.buddy.alloc(0x1000), Some(p));
        fx.buddy.free(p);
    }

    #[test]
    fn foreign_and_interior_addresses_are_refused() {
        let fx = Fixture::new();
        let p = fx.buddy.alloc(0x2000).unwrap();
        assert_eq!(fx.buddy.free(LAddr::from(0x10usize)), 0);
        assert_eq!(fx.buddy.free(p.add(0x80)), 0);
        assert_eq!(fx.buddy.free(p), 0x2000);
    }

    #[test]
    #[cfg(feature = "check")]
    fn tampered_block_is_never_served() {
        let fx = Fixture::new();
        let p = fx.buddy.alloc(0x1000).unwrap();
        fx.buddy.free(p);

        // Smash the stamp of the freed block now heading its list.
        unsafe { ptr::write(p.cast::<u64>(), 0x1122_3344_5566_7788) };
        assert!(fx.buddy.alloc(0x1000).is_none());
    }

    #[test]
    #[cfg(feature = "check")]
    fn tampered_sibling_stops_the_merge() {
        let fx = Fixture::new();
        let a = fx.buddy.alloc(0x1000).unwrap();
        let b = fx.buddy.alloc(0x1000).unwrap();
        assert_eq!(fx.buddy.free(b), 0x1000);

        unsafe { ptr::write(b.cast::<u64>(), 0) };
        // The damaged sibling must not be absorbed; `a` is still released
        // at its own order.
        assert_eq!(fx.buddy.free(a), 0x1000);
    }
}
