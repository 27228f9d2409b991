use log::debug;

use super::EnvManager;
use crate::{
    err::Error,
    memory::mmu::{Access, Perm, VirtAddr, PAGE_SIZE, USTACKTOP, UTOP},
    util::elf::{elf_from, Elf, Elf32Phdr},
};

impl EnvManager {
    /// Back `[va, va+len)` of environment `ind` with fresh zeroed pages,
    /// user read/write. Running out of memory here is fatal.
    pub fn region_alloc(&mut self, ind: usize, va: VirtAddr, len: usize) {
        if len == 0 {
            return;
        }
        let Some(pgdir) = self.envs[ind].env_pgdir else {
            panic!("region_alloc: env {:08x} has no page directory", self.envs[ind].env_id);
        };
        let end = (va + len).page_align_up();
        let mut addr = va.page_align_down();
        while addr < end {
            let ppn = match self.pmap.page_alloc() {
                Ok(ppn) => ppn,
                Err(e) => panic!("region_alloc: {}", e),
            };
            if let Err(e) = self.pmap.page_insert(pgdir, ppn, addr, Perm::user(Access::ReadWrite)) {
                panic!("region_alloc: {}", e);
            }
            addr += PAGE_SIZE;
        }
    }

    /// Load the program image into environment `ind` and give it a stack.
    ///
    /// Every loadable segment is checked before anything is mapped, so a
    /// rejected image leaves the address space untouched.
    pub fn load_icode(&mut self, ind: usize, binary: &[u8]) -> Result<(), Error> {
        let elf = elf_from(binary)?;
        for ph in elf.phdr_iter().filter(Elf32Phdr::is_load) {
            let fits_file = ph.file_range().end <= binary.len();
            let fits_user = ph.p_vaddr as usize + ph.p_memsz as usize <= UTOP.as_usize();
            if ph.p_filesz > ph.p_memsz || !fits_file || !fits_user {
                return Err(Error::BadImage);
            }
        }
        let pgdir = self.envs[ind].env_pgdir.ok_or(Error::BadEnv)?;
        self.envs[ind].env_tf.eip = elf.header().e_entry;

        // segments are written through the new environment's own mappings
        self.pmap.lcr3(pgdir);
        let loaded = self.load_segments(ind, &elf);
        let kern = self.pmap.kern_pgdir();
        self.pmap.lcr3(kern);
        loaded?;

        self.region_alloc(ind, USTACKTOP - PAGE_SIZE, PAGE_SIZE);
        Ok(())
    }

    fn load_segments(&mut self, ind: usize, elf: &Elf<'_>) -> Result<(), Error> {
        let binary = elf.binary();
        for ph in elf.phdr_iter().filter(Elf32Phdr::is_load) {
            let va = ph.va();
            self.region_alloc(ind, va, ph.p_memsz as usize);
            self.pmap.kernel_memset(va, 0, ph.p_memsz as usize)?;
            self.pmap.kernel_write(va, &binary[ph.file_range()])?;
            debug!(
                "load segment {:08x} filesz {:#x} memsz {:#x} flags {:#x}",
                va, ph.p_filesz, ph.p_memsz, ph.p_flags
            );
        }
        Ok(())
    }
}
