use core::{fmt, ops::{Add, AddAssign, Sub}};

use bitflags::bitflags;

use crate::err::Error;

/// page size
pub const PAGE_SIZE: usize = 4096;
/// bytes mapped by one page directory entry
pub const PTSIZE: usize = PAGE_SIZE * PAGE_TABLE_ENTRIES;
/// entries per page directory / page table
pub const PAGE_TABLE_ENTRIES: usize = 1024;
/// page shift
pub const PGSHIFT: usize = 12;
/// page directory shift
pub const PDSHIFT: usize = 22;

/// all of physical memory is mapped here, kernel only
pub const KERNBASE: usize = 0xF000_0000;
pub const ULIM: usize = 0xEF80_0000;
/// user read-only self-map of the current page tables
pub const UVPT: VirtAddr = VirtAddr::new(ULIM - PTSIZE);
pub const UPAGES: VirtAddr = VirtAddr::new(UVPT.0 - PTSIZE);
pub const UENVS: VirtAddr = VirtAddr::new(UPAGES.0 - PTSIZE);
/// top of user-accessible memory
pub const UTOP: VirtAddr = UENVS;
/// top of the one-page user exception stack
pub const UXSTACKTOP: VirtAddr = UTOP;
/// top of the normal user stack, one empty guard page below the exception stack
pub const USTACKTOP: VirtAddr = VirtAddr::new(UTOP.0 - 2 * PAGE_SIZE);
pub const UTEXT: VirtAddr = VirtAddr::new(2 * PTSIZE);
pub const UTEMP: VirtAddr = VirtAddr::new(PTSIZE);
/// temporary window used by the copy-on-write fault handler
pub const PFTEMP: VirtAddr = VirtAddr::new(UTEMP.0 + PTSIZE - PAGE_SIZE);
/// process-local words of the user runtime
pub const ULOCALS: VirtAddr = VirtAddr::new(PFTEMP.0 - PAGE_SIZE);

bitflags! {
    /// Hardware bits of a page directory / page table entry.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct PteFlags: u32 {
        const PRESENT = 0x001;
        const WRITABLE = 0x002;
        const USER = 0x004;
        const PWT = 0x008;
        const PCD = 0x010;
        const ACCESSED = 0x020;
        const DIRTY = 0x040;
        const PS = 0x080;
        const GLOBAL = 0x100;
        /// one of the software-available bits
        const COW = 0x800;
    }
}

/// What a present mapping lets its owner do with the page.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Access {
    ReadOnly,
    ReadWrite,
    /// read-only until the first write, which the owner resolves with a private copy
    CopyOnWrite,
}

/// Permission of a present mapping.
///
/// Absence of a mapping is `None` at the call sites; a `Perm` always
/// describes a present entry and can never be writable and copy-on-write at
/// the same time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Perm {
    access: Access,
    user: bool,
}

impl Perm {
    #[inline]
    pub const fn new(access: Access, user: bool) -> Self {
        Self { access, user }
    }
    /// user-accessible mapping.
    #[inline]
    pub const fn user(access: Access) -> Self {
        Self::new(access, true)
    }
    /// supervisor-only mapping.
    #[inline]
    pub const fn kernel(access: Access) -> Self {
        Self::new(access, false)
    }
    #[inline]
    pub const fn access(self) -> Access {
        self.access
    }
    #[inline]
    pub const fn is_user(self) -> bool {
        self.user
    }
    #[inline]
    pub fn is_writable(self) -> bool {
        self.access == Access::ReadWrite
    }
    #[inline]
    pub fn is_cow(self) -> bool {
        self.access == Access::CopyOnWrite
    }
    /// the same mapping with write access replaced by copy-on-write.
    #[inline]
    pub fn to_cow(self) -> Self {
        match self.access {
            Access::ReadWrite | Access::CopyOnWrite => Self::new(Access::CopyOnWrite, self.user),
            Access::ReadOnly => self,
        }
    }
    /// entry bits, `PRESENT` included.
    pub fn flags(self) -> PteFlags {
        let mut flags = PteFlags::PRESENT;
        if self.user {
            flags |= PteFlags::USER;
        }
        match self.access {
            Access::ReadOnly => {}
            Access::ReadWrite => flags |= PteFlags::WRITABLE,
            Access::CopyOnWrite => flags |= PteFlags::COW,
        }
        flags
    }
}

impl TryFrom<PteFlags> for Perm {
    type Error = Error;

    fn try_from(flags: PteFlags) -> Result<Self, Self::Error> {
        if !flags.contains(PteFlags::PRESENT) {
            return Err(Error::Inval);
        }
        let access = match (flags.contains(PteFlags::WRITABLE), flags.contains(PteFlags::COW)) {
            (false, false) => Access::ReadOnly,
            (true, false) => Access::ReadWrite,
            (false, true) => Access::CopyOnWrite,
            (true, true) => return Err(Error::Inval),
        };
        Ok(Self::new(access, flags.contains(PteFlags::USER)))
    }
}

/// Physical address, wrapped numeric value.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[repr(C)]
pub struct PhysAddr(usize);

/// Virtual address, wrapped numeric value.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default)]
#[repr(C)]
pub struct VirtAddr(usize);

/// Physical page number, wrapped numeric value.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[repr(C)]
pub struct PhysPageNum(usize);

impl VirtAddr {
    /// create a new virtual address from numeric value.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }
    #[inline]
    pub const fn zero() -> Self {
        Self(0)
    }
    /// the address of page directory slot `pdx`, table slot `ptx`.
    #[inline]
    pub const fn from_indexes(pdx: usize, ptx: usize, offset: usize) -> Self {
        Self((pdx << PDSHIFT) | (ptx << PGSHIFT) | offset)
    }
    /// the raw value of virtual address.
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }
    /// page directory index
    #[inline]
    pub const fn pdx(self) -> usize {
        (self.0 >> PDSHIFT) & 0x3ff
    }
    /// page table index
    #[inline]
    pub const fn ptx(self) -> usize {
        (self.0 >> PGSHIFT) & 0x3ff
    }
    /// virtual page number, the index into `UVPT`
    #[inline]
    pub const fn vpn(self) -> usize {
        self.0 >> PGSHIFT
    }
    #[inline]
    pub const fn page_align_down(self) -> Self {
        Self::new(self.0 & !(PAGE_SIZE - 1))
    }
    #[inline]
    pub const fn page_align_up(self) -> Self {
        Self::new((self.0 + PAGE_SIZE - 1) & !(PAGE_SIZE - 1))
    }
    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 & (PAGE_SIZE - 1)
    }
    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 % PAGE_SIZE == 0
    }
}

impl fmt::LowerHex for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl Add<usize> for VirtAddr {
    type Output = VirtAddr;

    fn add(self, rhs: usize) -> Self::Output {
        Self::Output::new(self.0 + rhs)
    }
}

impl AddAssign<usize> for VirtAddr {
    fn add_assign(&mut self, rhs: usize) {
        self.0 += rhs;
    }
}

impl Sub<usize> for VirtAddr {
    type Output = VirtAddr;

    fn sub(self, rhs: usize) -> Self::Output {
        Self::Output::new(self.0 - rhs)
    }
}

impl PhysAddr {
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }
    /// kernel virtual address of this physical address.
    #[inline]
    pub const fn into_kva(self) -> VirtAddr {
        VirtAddr::new(self.0 + KERNBASE)
    }
    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 & (PAGE_SIZE - 1)
    }
}

impl Add<usize> for PhysAddr {
    type Output = PhysAddr;

    fn add(self, rhs: usize) -> Self::Output {
        Self::Output::new(self.0 + rhs)
    }
}

impl fmt::LowerHex for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl PhysPageNum {
    #[inline]
    pub const fn new(ppn: usize) -> Self {
        Self(ppn)
    }
    /// the raw value of ppn.
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }
}

impl From<PhysAddr> for PhysPageNum {
    /// convert physical address to ppn
    fn from(value: PhysAddr) -> Self {
        Self::new(value.0 >> PGSHIFT)
    }
}

impl From<PhysPageNum> for PhysAddr {
    /// convert ppn to physical address
    fn from(value: PhysPageNum) -> Self {
        Self::new(value.0 << PGSHIFT)
    }
}
