use super::{
    frame::FrameAllocator,
    mmu::{Perm, PhysAddr, PhysPageNum, PteFlags, VirtAddr, PAGE_SIZE, PGSHIFT},
};
use crate::err::Error;

/// Page table entry, wrapped type.
/// Directory entries and table entries share the same layout, so `Pte`
/// stands for both.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default)]
#[repr(C)]
pub struct Pte(u32);

impl Pte {
    #[inline]
    pub const fn new(pte: u32) -> Self {
        Self(pte)
    }
    #[inline]
    pub fn new_from_ppn(ppn: PhysPageNum, flags: PteFlags) -> Self {
        Self(((ppn.as_usize() as u32) << PGSHIFT) | flags.bits())
    }
    /// get pte as raw value.
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
    /// ppn of this entry.
    #[inline]
    pub const fn ppn(self) -> PhysPageNum {
        PhysPageNum::new((self.0 >> PGSHIFT) as usize)
    }
    /// flags of this entry.
    #[inline]
    pub const fn flags(self) -> PteFlags {
        PteFlags::from_bits_retain(self.0 & 0xfff)
    }
    #[inline]
    pub fn perm(self) -> Result<Perm, Error> {
        Perm::try_from(self.flags())
    }
    #[inline]
    pub const fn valid(self) -> bool {
        self.0 & PteFlags::PRESENT.bits() != 0
    }
}

/// A two-level page table rooted at a directory frame.
///
/// The entries live inside physical frames, so every operation goes through
/// the frame allocator that owns them.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PageTable {
    root: PhysPageNum,
}

/// directory entry bits for a freshly created page table.
const PDE_TABLE: PteFlags = PteFlags::PRESENT.union(PteFlags::WRITABLE).union(PteFlags::USER);

#[inline]
fn entry_addr(table: PhysPageNum, index: usize) -> PhysAddr {
    PhysAddr::from(table) + index * 4
}

impl PageTable {
    #[inline]
    pub const fn new(root: PhysPageNum) -> Self {
        Self { root }
    }

    #[inline]
    pub const fn root(self) -> PhysPageNum {
        self.root
    }

    /// directory entry `pdx`.
    #[inline]
    pub fn entry(self, fa: &FrameAllocator, pdx: usize) -> Pte {
        Pte(fa.read_u32(entry_addr(self.root, pdx)))
    }

    #[inline]
    pub fn set_entry(self, fa: &mut FrameAllocator, pdx: usize, pte: Pte) {
        fa.write_u32(entry_addr(self.root, pdx), pte.0);
    }

    /// entry `ptx` of the page table `table`.
    #[inline]
    pub fn table_entry(fa: &FrameAllocator, table: PhysPageNum, ptx: usize) -> Pte {
        Pte(fa.read_u32(entry_addr(table, ptx)))
    }

    #[inline]
    fn walk(self, fa: &FrameAllocator, va: VirtAddr) -> Option<PhysAddr> {
        let pde = self.entry(fa, va.pdx());
        if !pde.valid() {
            return None;
        }
        Some(entry_addr(pde.ppn(), va.ptx()))
    }

    fn walk_or_create(self, fa: &mut FrameAllocator, va: VirtAddr, create: bool) -> Result<Option<PhysAddr>, Error> {
        if let Some(slot) = self.walk(fa, va) {
            return Ok(Some(slot));
        }
        if !create {
            return Ok(None);
        }
        let ppn = fa.alloc()?;
        fa.incref(ppn);
        self.set_entry(fa, va.pdx(), Pte::new_from_ppn(ppn, PDE_TABLE));
        Ok(Some(entry_addr(ppn, va.ptx())))
    }

    /// the frame mapped at `va` and the entry that maps it.
    #[inline]
    pub fn lookup(self, fa: &FrameAllocator, va: VirtAddr) -> Option<(PhysPageNum, Pte)> {
        let slot = self.walk(fa, va)?;
        let pte = Pte(fa.read_u32(slot));
        if pte.valid() {
            Some((pte.ppn(), pte))
        } else {
            None
        }
    }

    /// unmap `va`; nothing happens if it is not mapped.
    pub fn remove(self, fa: &mut FrameAllocator, va: VirtAddr) {
        let Some(slot) = self.walk(fa, va) else {
            return;
        };
        let pte = Pte(fa.read_u32(slot));
        if pte.valid() {
            fa.write_u32(slot, 0);
            fa.decref(pte.ppn());
        }
    }

    /// map `ppn` at `va`, replacing whatever was there.
    ///
    /// The new frame is referenced before the old mapping is dropped, so
    /// re-inserting the frame already mapped at `va` only changes its
    /// permission.
    pub fn insert(self, fa: &mut FrameAllocator, ppn: PhysPageNum, va: VirtAddr, perm: Perm) -> Result<(), Error> {
        let slot = self.walk_or_create(fa, va, true)?.ok_or(Error::NoMem)?;
        fa.incref(ppn);
        if Pte(fa.read_u32(slot)).valid() {
            self.remove(fa, va);
        }
        fa.write_u32(slot, Pte::new_from_ppn(ppn, perm.flags()).0);
        Ok(())
    }

    /// map `[va, va+size)` to `[pa, pa+size)` without touching reference
    /// counts; only meant for the static kernel region.
    pub fn boot_map_region(self, fa: &mut FrameAllocator, va: VirtAddr, size: usize, pa: PhysAddr, perm: Perm) -> Result<(), Error> {
        for off in (0..size).step_by(PAGE_SIZE) {
            let slot = self.walk_or_create(fa, va + off, true)?.ok_or(Error::NoMem)?;
            fa.write_u32(slot, Pte::new_from_ppn(PhysPageNum::from(pa + off), perm.flags()).0);
        }
        Ok(())
    }

    #[inline]
    pub fn translate(self, fa: &FrameAllocator, va: VirtAddr) -> Option<PhysAddr> {
        self.lookup(fa, va)
            .map(|(ppn, _)| PhysAddr::from(ppn) + va.page_offset())
    }
}
