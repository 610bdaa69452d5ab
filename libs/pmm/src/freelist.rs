//! Exponent freelists.
//!
//! A [`Freelist`] serves equally-sized power-of-two objects out of one or
//! more contiguous spans. Each span is headed by an in-band [`Range`]
//! descriptor that consumes the span's first objects; the remaining objects
//! are chained through in-band [`FreeNode`] links in ascending address
//! order. The range list is kept under an ordering lock and the range that
//! served most recently is rotated to its head, so the common case finds a
//! usable range in one step; the object chain itself is popped and pushed
//! with compare-exchange on the head pointer.

use core::mem;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering::*};

use intrusive_collections::{intrusive_adapter, LinkedList, LinkedListLink};
use paging::LAddr;
use spin::Mutex;
use static_assertions::const_assert;

/// In-band link at the start of every free object.
///
/// The fast-page stack reuses this layout, so the two structures stay
/// interchangeable at the byte level.
#[repr(C)]
pub(crate) struct FreeNode {
    pub(crate) next: AtomicPtr<FreeNode>,
}

// A free object must be able to hold its own link.
const_assert!(mem::size_of::<FreeNode>() <= mem::size_of::<usize>());

/// In-band header of one contiguous span of objects.
#[repr(C)]
pub struct Range {
    link: LinkedListLink,
    base: LAddr,
    ceil: LAddr,
    first: LAddr,
    obj_size: usize,
    head: AtomicPtr<FreeNode>,
    free_count: AtomicUsize,
}

intrusive_adapter!(RangeAdapter = &'static Range: Range { link: LinkedListLink });

impl Range {
    /// Construct a range in place at `base`, chaining every object after
    /// the header in address order.
    ///
    /// # Safety
    ///
    /// `[base, ceil)` must be valid, writable and exclusively owned by the
    /// new range.
    unsafe fn init(base: LAddr, ceil: LAddr, obj_size: usize) -> Option<&'static Range> {
        if !obj_size.is_power_of_two()
            || obj_size < mem::size_of::<usize>()
            || base.val() % obj_size != 0
            || ceil <= base
        {
            return None;
        }

        let header_objs = mem::size_of::<Range>().div_ceil(obj_size);
        let first = base.val() + header_objs * obj_size;
        if first + obj_size > ceil.val() {
            return None;
        }

        let mut count = 0;
        let mut addr = first;
        while addr + obj_size <= ceil.val() {
            let next = addr + obj_size;
            let link = if next + obj_size <= ceil.val() {
                next as *mut FreeNode
            } else {
                ptr::null_mut()
            };
            ptr::write(addr as *mut FreeNode, FreeNode {
                next: AtomicPtr::new(link),
            });
            count += 1;
            addr = next;
        }

        let header = base.cast::<Range>();
        ptr::write(header, Range {
            link: LinkedListLink::new(),
            base,
            ceil,
            first: LAddr::from(first),
            obj_size,
            head: AtomicPtr::new(first as *mut FreeNode),
            free_count: AtomicUsize::new(count),
        });
        Some(&*header)
    }

    #[inline]
    fn owns(&self, addr: LAddr) -> bool {
        self.first <= addr
            && addr < self.ceil
            && (addr.val() - self.base.val()) % self.obj_size == 0
    }

    fn pop(&self) -> Option<LAddr> {
        let mut head = self.head.load(Acquire);
        loop {
            let node = NonNull::new(head)?;
            let next = unsafe { node.as_ref().next.load(Relaxed) };
            match self.head.compare_exchange(head, next, AcqRel, Acquire) {
                Ok(_) => {
                    self.free_count.fetch_sub(1, AcqRel);
                    return Some(LAddr::new(node.as_ptr().cast()));
                }
                Err(cur) => head = cur,
            }
        }
    }

    fn push(&self, addr: LAddr) {
        let node = addr.cast::<FreeNode>();
        let mut head = self.head.load(Acquire);
        loop {
            unsafe {
                ptr::write(node, FreeNode {
                    next: AtomicPtr::new(head),
                })
            };
            match self.head.compare_exchange(head, node, AcqRel, Acquire) {
                Ok(_) => {
                    self.free_count.fetch_add(1, AcqRel);
                    return;
                }
                Err(cur) => head = cur,
            }
        }
    }

    pub fn free_count(&self) -> usize {
        self.free_count.load(Acquire)
    }

    pub fn capacity(&self) -> usize {
        (self.ceil.val() - self.first.val()) / self.obj_size
    }

    pub fn span(&self) -> (LAddr, LAddr) {
        (self.base, self.ceil)
    }
}

/// A list of interchangeable [`Range`]s of one object size.
pub struct Freelist {
    ranges: Mutex<LinkedList<RangeAdapter>>,
    obj_size: usize,
}

// SAFETY: the intrusive links are only mutated under the `ranges` lock, and
// every in-band header is exclusively owned by this list.
unsafe impl Send for Freelist {}
unsafe impl Sync for Freelist {}

impl Freelist {
    pub fn new(obj_size: usize) -> Self {
        Freelist {
            ranges: Mutex::new(LinkedList::new(RangeAdapter::new())),
            obj_size,
        }
    }

    pub fn obj_size(&self) -> usize {
        self.obj_size
    }

    /// Put `[base, ceil)` in service as a new range.
    ///
    /// Returns the number of objects the range contributes, or `None` if
    /// the span cannot hold its own header plus at least one object.
    ///
    /// # Safety
    ///
    /// The span must be valid, writable and handed over exclusively.
    pub unsafe fn init(&self, base: LAddr, ceil: LAddr) -> Option<usize> {
        let range = Range::init(base, ceil, self.obj_size)?;
        let count = range.free_count();
        self.ranges.lock().push_front(range);
        Some(count)
    }

    /// Pop one object, preferring the most recently useful range.
    pub fn alloc(&self) -> Option<LAddr> {
        let mut ranges = self.ranges.lock();
        let mut taken = None;
        let mut rotate = None;
        {
            let mut cursor = ranges.front_mut();
            let mut at_front = true;
            while let Some(range) = cursor.get() {
                if range.free_count() > 0 {
                    if let Some(addr) = range.pop() {
                        taken = Some(addr);
                        if !at_front {
                            rotate = cursor.remove();
                        }
                        break;
                    }
                }
                cursor.move_next();
                at_front = false;
            }
        }
        if let Some(range) = rotate {
            ranges.push_front(range);
        }
        taken
    }

    /// Return `addr` to its owning range; `None` if no range owns it.
    pub fn free(&self, addr: LAddr) -> Option<LAddr> {
        let ranges = self.ranges.lock();
        let range = ranges.iter().find(|range| range.owns(addr))?;
        range.push(addr);
        Some(addr)
    }

    pub fn free_objects(&self) -> usize {
        self.ranges.lock().iter().map(Range::free_count).sum()
    }

    pub fn free_bytes(&self) -> usize {
        self.free_objects() * self.obj_size
    }

    /// Total objects across all ranges, free or not.
    pub fn capacity(&self) -> usize {
        self.ranges.lock().iter().map(Range::capacity).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::alloc::Layout;
    use std::collections::BTreeSet;
    use std::vec::Vec;

    fn backing(bytes: usize) -> (LAddr, Layout) {
        let layout = Layout::from_size_align(bytes, paging::PAGE_SIZE).unwrap();
        let buf = unsafe { std::alloc::alloc(layout) };
        assert!(!buf.is_null());
        (LAddr::new(buf), layout)
    }

    #[test]
    fn bijection_over_one_range() {
        let (base, layout) = backing(paging::PAGE_SIZE);
        let list = Freelist::new(64);
        let count = unsafe { list.init(base, base.add(paging::PAGE_SIZE)) }.unwrap();

        let header_objs = core::mem::size_of::<Range>().div_ceil(64);
        assert_eq!(count, paging::PAGE_SIZE / 64 - header_objs);

        // Draining must yield each object address exactly once, all aligned.
        let mut seen = BTreeSet::new();
        while let Some(addr) = list.alloc() {
            assert_eq!((addr.val() - base.val()) % 64, 0);
            assert!(addr.val() >= base.val() + header_objs * 64);
            assert!(addr.val() + 64 <= base.val() + paging::PAGE_SIZE);
            assert!(seen.insert(addr.val()));
        }
        assert_eq!(seen.len(), count);
        assert_eq!(list.free_objects(), 0);

        // Full refill restores the fresh free count.
        for addr in &seen {
            assert!(list.free(LAddr::from(*addr)).is_some());
        }
        assert_eq!(list.free_objects(), count);

        unsafe { std::alloc::dealloc(*base, layout) };
    }

    #[test]
    fn first_objects_feed_the_header() {
        let (base, layout) = backing(paging::PAGE_SIZE);
        let list = Freelist::new(512);
        unsafe { list.init(base, base.add(paging::PAGE_SIZE)) }.unwrap();

        // The header consumed the first object, so it is never served and
        // cannot be freed back.
        assert!(list.free(base).is_none());
        let lowest = core::iter::from_fn(|| list.alloc())
            .map(LAddr::val)
            .min()
            .unwrap();
        assert_eq!(lowest, base.val() + 512);

        unsafe { std::alloc::dealloc(*base, layout) };
    }

    #[test]
    fn ascending_service_order() {
        let (base, layout) = backing(paging::PAGE_SIZE);
        let list = Freelist::new(256);
        unsafe { list.init(base, base.add(paging::PAGE_SIZE)) }.unwrap();

        let addrs: Vec<_> = core::iter::from_fn(|| list.alloc()).collect();
        for pair in addrs.windows(2) {
            assert_eq!(pair[1].val(), pair[0].val() + 256);
        }

        unsafe { std::alloc::dealloc(*base, layout) };
    }

    #[test]
    fn linked_ranges_do_not_overlap_and_all_serve() {
        let (a, la) = backing(paging::PAGE_SIZE);
        let (b, lb) = backing(paging::PAGE_SIZE);
        let list = Freelist::new(128);
        let ca = unsafe { list.init(a, a.add(paging::PAGE_SIZE)) }.unwrap();
        let cb = unsafe { list.init(b, b.add(paging::PAGE_SIZE)) }.unwrap();

        let mut served = 0;
        while let Some(addr) = list.alloc() {
            let in_a = a <= addr && addr < a.add(paging::PAGE_SIZE);
            let in_b = b <= addr && addr < b.add(paging::PAGE_SIZE);
            assert!(in_a ^ in_b);
            served += 1;
        }
        assert_eq!(served, ca + cb);

        unsafe { std::alloc::dealloc(*a, la) };
        unsafe { std::alloc::dealloc(*b, lb) };
    }

    #[test]
    fn free_rejects_foreign_and_misaligned() {
        let (base, layout) = backing(paging::PAGE_SIZE);
        let list = Freelist::new(64);
        unsafe { list.init(base, base.add(paging::PAGE_SIZE)) }.unwrap();

        let addr = list.alloc().unwrap();
        assert!(list.free(addr.add(8)).is_none());
        assert!(list.free(base.add(paging::PAGE_SIZE)).is_none());
        assert!(list.free(addr).is_some());

        unsafe { std::alloc::dealloc(*base, layout) };
    }

    #[test]
    fn rejects_degenerate_spans() {
        let (base, layout) = backing(paging::PAGE_SIZE);
        let list = Freelist::new(64);
        // Too small to hold the header plus one object.
        assert!(unsafe { list.init(base, base.add(64)) }.is_none());
        // Misaligned base.
        assert!(unsafe { list.init(base.add(8), base.add(paging::PAGE_SIZE)) }.is_none());

        unsafe { std::alloc::dealloc(*base, layout) };
    }
}
