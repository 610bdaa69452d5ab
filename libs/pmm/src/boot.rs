use paging::PAddr;

/// Classification of one bootloader memory-map entry.
///
/// The allocator only ever carves [`MemType::Available`] entries; everything
/// else is skipped untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MemType {
    /// Free usable memory.
    Available = 0,
    /// Firmware-reserved addresses.
    Reserved = 1,
    /// Memory that holds ACPI tables; reclaimable after they are parsed.
    AcpiReclaim = 2,
    /// ACPI non-volatile storage.
    AcpiNonVolatile = 3,
    /// A region used for memory-mapped I/O.
    Mmio = 4,
    /// Memory in which errors have been detected.
    BadMemory = 5,
    /// The loaded kernel image and boot modules.
    KernelAndModules = 6,
}

/// One entry of the firmware-supplied memory map.
///
/// Entries are not assumed sorted, page-aligned, or non-adjacent; the
/// allocator rounds `base` up and `base + len` down to page granularity
/// when it carves ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct MemMapEntry {
    pub base: PAddr,
    pub len: usize,
    pub ty: MemType,
}

impl MemMapEntry {
    pub const fn new(base: PAddr, len: usize, ty: MemType) -> Self {
        MemMapEntry { base, len, ty }
    }

    #[inline]
    pub fn is_available(&self) -> bool {
        self.ty == MemType::Available
    }

    /// Page-aligned `(base, ceil)` of this entry, both physical.
    pub fn page_bounds(&self) -> (PAddr, PAddr) {
        let base = self.base.round_up_to_page();
        let ceil = PAddr::new(*self.base + self.len).round_down_to_page();
        (base, ceil)
    }
}
