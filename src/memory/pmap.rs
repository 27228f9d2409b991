use core::cmp::{max, min};

use log::warn;

use super::{
    frame::FrameAllocator,
    mmu::{Access, Perm, PhysAddr, PhysPageNum, PteFlags, VirtAddr, KERNBASE, PAGE_SIZE, ULIM, UVPT},
    page_table::{PageTable, Pte},
};
use crate::{err::Error, exception::traps::FaultReason};

/// Physical memory plus the MMU state of the single CPU.
pub struct Pmap {
    frames: FrameAllocator,
    kern_pgdir: PageTable,
    cur_pgdir: PageTable,
}

impl Pmap {
    /// Build the kernel directory: the `UVPT` self-map and every physical
    /// frame mapped at `KERNBASE`, supervisor read/write.
    pub fn new(nframes: usize) -> Result<Self, Error> {
        let mut frames = FrameAllocator::new(nframes);
        let root = frames.alloc()?;
        frames.incref(root);
        let kern_pgdir = PageTable::new(root);
        kern_pgdir.set_entry(&mut frames, UVPT.pdx(), Pte::new_from_ppn(root, PteFlags::PRESENT | PteFlags::USER));
        kern_pgdir.boot_map_region(
            &mut frames,
            VirtAddr::new(KERNBASE),
            nframes * PAGE_SIZE,
            PhysAddr::new(0),
            Perm::kernel(Access::ReadWrite),
        )?;
        Ok(Self {
            frames,
            kern_pgdir,
            cur_pgdir: kern_pgdir,
        })
    }

    #[inline]
    pub fn frames(&self) -> &FrameAllocator {
        &self.frames
    }

    #[inline]
    pub fn frames_mut(&mut self) -> &mut FrameAllocator {
        &mut self.frames
    }

    #[inline]
    pub fn kern_pgdir(&self) -> PageTable {
        self.kern_pgdir
    }

    /// switch the active address space.
    #[inline]
    pub fn lcr3(&mut self, pgdir: PageTable) {
        self.cur_pgdir = pgdir;
    }

    /// the active address space.
    #[inline]
    pub fn rcr3(&self) -> PageTable {
        self.cur_pgdir
    }

    #[inline]
    pub fn page_alloc(&mut self) -> Result<PhysPageNum, Error> {
        self.frames.alloc()
    }

    #[inline]
    pub fn page_insert(&mut self, pgdir: PageTable, ppn: PhysPageNum, va: VirtAddr, perm: Perm) -> Result<(), Error> {
        pgdir.insert(&mut self.frames, ppn, va, perm)
    }

    #[inline]
    pub fn page_lookup(&self, pgdir: PageTable, va: VirtAddr) -> Option<(PhysPageNum, Pte)> {
        pgdir.lookup(&self.frames, va)
    }

    #[inline]
    pub fn page_remove(&mut self, pgdir: PageTable, va: VirtAddr) {
        pgdir.remove(&mut self.frames, va)
    }

    /// Translate a user-mode access through the active directory.
    ///
    /// Both levels must grant `USER`, and `WRITABLE` as well for a write.
    /// The error carries the bits the CPU would push as the fault code.
    pub fn user_translate(&self, va: VirtAddr, write: bool) -> Result<PhysAddr, FaultReason> {
        let mut err = FaultReason::USER;
        if write {
            err |= FaultReason::WRITE;
        }
        if va.as_usize() > u32::MAX as usize {
            return Err(err);
        }
        let pde = self.cur_pgdir.entry(&self.frames, va.pdx());
        if !pde.valid() {
            return Err(err);
        }
        let pte = PageTable::table_entry(&self.frames, pde.ppn(), va.ptx());
        if !pte.valid() {
            return Err(err);
        }
        let mut need = PteFlags::USER;
        if write {
            need |= PteFlags::WRITABLE;
        }
        if !pde.flags().contains(need) || !pte.flags().contains(need) {
            return Err(err | FaultReason::PROTECTION);
        }
        Ok(PhysAddr::from(pte.ppn()) + va.page_offset())
    }

    /// user-mode read; the error names the faulting address and cause.
    pub fn user_read(&self, va: VirtAddr, buf: &mut [u8]) -> Result<(), (VirtAddr, FaultReason)> {
        let mut done = 0;
        while done < buf.len() {
            let cur = va + done;
            let pa = self.user_translate(cur, false).map_err(|err| (cur, err))?;
            let n = min(PAGE_SIZE - cur.page_offset(), buf.len() - done);
            buf[done..done + n].copy_from_slice(self.bytes_at(pa, n));
            done += n;
        }
        Ok(())
    }

    pub fn user_write(&mut self, va: VirtAddr, data: &[u8]) -> Result<(), (VirtAddr, FaultReason)> {
        let mut done = 0;
        while done < data.len() {
            let cur = va + done;
            let pa = self.user_translate(cur, true).map_err(|err| (cur, err))?;
            let n = min(PAGE_SIZE - cur.page_offset(), data.len() - done);
            self.bytes_at_mut(pa, n).copy_from_slice(&data[done..done + n]);
            done += n;
        }
        Ok(())
    }

    /// supervisor translation through the active directory; ignores `USER`.
    fn kernel_translate(&self, va: VirtAddr, write: bool) -> Result<PhysAddr, Error> {
        let (ppn, pte) = self.cur_pgdir.lookup(&self.frames, va).ok_or(Error::Fault)?;
        if write && !pte.flags().contains(PteFlags::WRITABLE) {
            return Err(Error::Fault);
        }
        Ok(PhysAddr::from(ppn) + va.page_offset())
    }

    pub fn kernel_read(&self, va: VirtAddr, buf: &mut [u8]) -> Result<(), Error> {
        let mut done = 0;
        while done < buf.len() {
            let cur = va + done;
            let pa = self.kernel_translate(cur, false)?;
            let n = min(PAGE_SIZE - cur.page_offset(), buf.len() - done);
            buf[done..done + n].copy_from_slice(self.bytes_at(pa, n));
            done += n;
        }
        Ok(())
    }

    pub fn kernel_write(&mut self, va: VirtAddr, data: &[u8]) -> Result<(), Error> {
        let mut done = 0;
        while done < data.len() {
            let cur = va + done;
            let pa = self.kernel_translate(cur, true)?;
            let n = min(PAGE_SIZE - cur.page_offset(), data.len() - done);
            self.bytes_at_mut(pa, n).copy_from_slice(&data[done..done + n]);
            done += n;
        }
        Ok(())
    }

    pub fn kernel_memset(&mut self, va: VirtAddr, value: u8, len: usize) -> Result<(), Error> {
        let mut done = 0;
        while done < len {
            let cur = va + done;
            let pa = self.kernel_translate(cur, true)?;
            let n = min(PAGE_SIZE - cur.page_offset(), len - done);
            self.bytes_at_mut(pa, n).fill(value);
            done += n;
        }
        Ok(())
    }

    /// Check that `[va, va+len)` is mapped in `pgdir` with at least `perm`
    /// and lies below `ULIM`. On failure returns the first bad address.
    pub fn user_mem_check(&self, pgdir: PageTable, va: VirtAddr, len: usize, perm: PteFlags) -> Result<(), VirtAddr> {
        let need = perm | PteFlags::PRESENT;
        let end = (va + len).page_align_up();
        let mut addr = va.page_align_down();
        while addr < end {
            let ok = addr.as_usize() < ULIM
                && self
                    .page_lookup(pgdir, addr)
                    .is_some_and(|(_, pte)| pte.flags().contains(need));
            if !ok {
                let bad = max(addr, va);
                warn!("user_mem_check: va {:08x} lacks {:?}", bad, need);
                return Err(bad);
            }
            addr += PAGE_SIZE;
        }
        Ok(())
    }

    #[inline]
    fn bytes_at(&self, pa: PhysAddr, len: usize) -> &[u8] {
        let off = pa.page_offset();
        &self.frames.bytes(PhysPageNum::from(pa))[off..off + len]
    }

    #[inline]
    fn bytes_at_mut(&mut self, pa: PhysAddr, len: usize) -> &mut [u8] {
        let off = pa.page_offset();
        &mut self.frames.bytes_mut(PhysPageNum::from(pa))[off..off + len]
    }
}
