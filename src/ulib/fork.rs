//! User-level copy-on-write fork.

use log::debug;

use super::{
    pgfault::{pgfault_upcall, set_pgfault_handler},
    pte_of, set_thisenv,
    syscall::UserEnv,
};
use crate::{
    env::{EnvId, EnvStatus},
    err::Error,
    exception::traps::{FaultReason, UTrapframe},
    memory::mmu::{Access, Perm, PteFlags, VirtAddr, PAGE_SIZE, PAGE_TABLE_ENTRIES, PFTEMP, PGSHIFT, USTACKTOP, UXSTACKTOP},
    user_panic,
};

/// Copy-on-write fault handler: give the faulting page a private writable
/// copy. Anything other than a write to a COW page is fatal.
pub fn pgfault(u: &mut UserEnv<'_>, utf: &UTrapframe) -> Result<(), Error> {
    let addr = VirtAddr::new(utf.fault_va as usize);
    if !utf.err.contains(FaultReason::WRITE) {
        return Err(user_panic!(u, "pgfault: not a write at va {:08x} ip {:08x}", addr, utf.eip));
    }
    let pte = match pte_of(u, addr) {
        Ok(pte) => pte,
        Err(e) => return Err(user_panic!(u, "pgfault: uvpt {:08x}: {}", addr, e)),
    };
    let cow = pte.and_then(|pte| pte.perm().ok()).is_some_and(Perm::is_cow);
    if !cow {
        return Err(user_panic!(u, "pgfault: va {:08x} is not copy-on-write, ip {:08x}", addr, utf.eip));
    }

    let page = addr.page_align_down();
    let rw = Perm::user(Access::ReadWrite);
    if let Err(e) = u.sys_page_alloc(EnvId::zero(), PFTEMP, rw) {
        return Err(user_panic!(u, "pgfault: sys_page_alloc: {}", e));
    }
    let mut buf = vec![0u8; PAGE_SIZE];
    if let Err(e) = u.read(page, &mut buf).and_then(|()| u.write(PFTEMP, &buf)) {
        return Err(user_panic!(u, "pgfault: copy of {:08x}: {}", page, e));
    }
    if let Err(e) = u.sys_page_map(EnvId::zero(), PFTEMP, EnvId::zero(), page, rw) {
        return Err(user_panic!(u, "pgfault: sys_page_map: {}", e));
    }
    if let Err(e) = u.sys_page_unmap(EnvId::zero(), PFTEMP) {
        return Err(user_panic!(u, "pgfault: sys_page_unmap: {}", e));
    }
    debug!("[{:08x}] private copy of {:08x}", u.envid(), page);
    Ok(())
}

/// Map our page into the child, copy-on-write if it is writable or COW.
/// Returns the permission used.
fn install_child_mapping(u: &mut UserEnv<'_>, child: EnvId, va: VirtAddr, perm: Perm) -> Result<Perm, Error> {
    let perm = perm.to_cow();
    u.sys_page_map(EnvId::zero(), va, child, va, perm)?;
    Ok(perm)
}

/// Re-mark our own mapping, even one that is COW already.
fn downgrade_own_mapping(u: &mut UserEnv<'_>, va: VirtAddr, perm: Perm) -> Result<(), Error> {
    u.sys_page_map(EnvId::zero(), va, EnvId::zero(), va, perm)
}

/// Duplicate page `pn` into `child`: child first, then ourselves.
pub fn duppage(u: &mut UserEnv<'_>, child: EnvId, pn: usize) -> Result<(), Error> {
    let va = VirtAddr::new(pn << PGSHIFT);
    let perm = u.uvpt(pn)?.perm()?;
    let perm = install_child_mapping(u, child, va, perm)?;
    if perm.is_cow() {
        downgrade_own_mapping(u, va, perm)?;
    }
    Ok(())
}

/// Fork with copy-on-write sharing of everything below the user stack top.
///
/// Returns the child's id in the parent. The child sees zero once it is run
/// and continues through [`resume_forked_child`].
pub fn fork(u: &mut UserEnv<'_>) -> Result<EnvId, Error> {
    set_pgfault_handler(u, pgfault)?;
    let who = u.sys_exofork()?;
    finish_fork(u, who)
}

/// The child's side of [`fork`]: its saved `eax` holds the zero that
/// `sys_exofork` returned to it.
pub fn resume_forked_child(u: &mut UserEnv<'_>) -> Result<EnvId, Error> {
    let who = EnvId::from_raw(u.trapframe().regs.eax as i32);
    finish_fork(u, who)
}

fn finish_fork(u: &mut UserEnv<'_>, who: EnvId) -> Result<EnvId, Error> {
    if who.is_zero() {
        let me = u.sys_getenvid()?;
        set_thisenv(u, me)?;
        return Ok(EnvId::zero());
    }
    let child = who;

    let present_user = PteFlags::PRESENT | PteFlags::USER;
    for pdx in 0..=USTACKTOP.pdx() {
        if !u.uvpd(pdx)?.valid() {
            continue;
        }
        for ptx in 0..PAGE_TABLE_ENTRIES {
            let va = VirtAddr::from_indexes(pdx, ptx, 0);
            if va >= USTACKTOP {
                break;
            }
            if !u.uvpt(va.vpn())?.flags().contains(present_user) {
                continue;
            }
            if let Err(e) = duppage(u, child, va.vpn()) {
                return Err(user_panic!(u, "fork: duppage {:08x}: {}", va, e));
            }
        }
    }

    let rw = Perm::user(Access::ReadWrite);
    if let Err(e) = u.sys_page_alloc(child, UXSTACKTOP - PAGE_SIZE, rw) {
        return Err(user_panic!(u, "fork: sys_page_alloc: {}", e));
    }
    if let Err(e) = u.sys_env_set_pgfault_upcall(child, pgfault_upcall) {
        return Err(user_panic!(u, "fork: sys_env_set_pgfault_upcall: {}", e));
    }
    if let Err(e) = u.sys_env_set_status(child, EnvStatus::Runnable) {
        return Err(user_panic!(u, "fork: sys_env_set_status: {}", e));
    }
    Ok(child)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::KernelConfig,
        env::{EnvType, Kernel},
        memory::mmu::UTEXT,
        ulib::libmain,
        util::elf::{ImageBuilder, PF_R, PF_W, PF_X},
    };

    fn boot(kernel: &Kernel) -> EnvId {
        let image = ImageBuilder::new(UTEXT)
            .segment(UTEXT, b"\x90\xc3", 2, PF_R | PF_X)
            .segment(UTEXT + PAGE_SIZE, b"data", 8, PF_R | PF_W)
            .build();
        kernel.create(&image, EnvType::User)
    }

    #[test]
    fn duppage_marks_child_then_parent() {
        let kernel = Kernel::new(KernelConfig::default().with_nenv(4).with_nframes(256)).unwrap();
        let id = boot(&kernel);
        let mut u = kernel.run(id).unwrap();
        let child = u.sys_exofork().unwrap();

        let ro = UTEXT + 2 * PAGE_SIZE;
        u.sys_page_alloc(EnvId::zero(), ro, Perm::user(Access::ReadOnly)).unwrap();
        duppage(&mut u, child, ro.vpn()).unwrap();
        duppage(&mut u, child, (UTEXT + PAGE_SIZE).vpn()).unwrap();

        let cow = Perm::user(Access::CopyOnWrite);
        let rdonly = Perm::user(Access::ReadOnly);
        let (pp, perm) = kernel.page_lookup(id, UTEXT + PAGE_SIZE).unwrap().unwrap();
        assert_eq!(perm, cow);
        assert_eq!(kernel.page_lookup(child, UTEXT + PAGE_SIZE).unwrap(), Some((pp, cow)));
        assert_eq!(kernel.frame_ref(pp), 2);
        assert_eq!(kernel.page_lookup(id, ro).unwrap().map(|(_, p)| p), Some(rdonly));
        assert_eq!(kernel.page_lookup(child, ro).unwrap().map(|(_, p)| p), Some(rdonly));
    }

    #[test]
    fn read_fault_is_fatal_to_the_handler() {
        let kernel = Kernel::new(KernelConfig::default().with_nenv(4).with_nframes(256)).unwrap();
        let id = boot(&kernel);
        let mut u = kernel.run(id).unwrap();
        libmain(&mut u).unwrap();
        set_pgfault_handler(&mut u, pgfault).unwrap();
        let mut word = [0u8; 4];
        assert_eq!(u.read(UTEXT + 0x40_0000, &mut word), Err(Error::Halted));
        assert_eq!(kernel.status(id), Err(Error::BadEnv));
    }

    #[test]
    fn cow_fault_without_memory_is_fatal() {
        let kernel = Kernel::new(KernelConfig::default().with_nenv(4).with_nframes(256)).unwrap();
        let id = boot(&kernel);
        let mut u = kernel.run(id).unwrap();
        libmain(&mut u).unwrap();
        fork(&mut u).unwrap();

        // fill the frames left over using the text page table, which already exists
        let rw = Perm::user(Access::ReadWrite);
        let mut va = UTEXT + 16 * PAGE_SIZE;
        while u.sys_page_alloc(EnvId::zero(), va, rw).is_ok() {
            va += PAGE_SIZE;
        }
        assert_eq!(kernel.free_frames(), 0);

        assert_eq!(u.write(UTEXT + PAGE_SIZE, b"DATA"), Err(Error::Halted));
        assert_eq!(kernel.status(id), Err(Error::BadEnv));
        assert!(kernel.free_frames() > 0);
    }

    #[test]
    fn fork_shares_frames_copy_on_write() {
        let kernel = Kernel::new(KernelConfig::default().with_nenv(4).with_nframes(256)).unwrap();
        let id = boot(&kernel);
        let mut u = kernel.run(id).unwrap();
        libmain(&mut u).unwrap();
        let child = fork(&mut u).unwrap();
        assert_eq!(kernel.status(child), Ok(EnvStatus::Runnable));
        assert_eq!(kernel.parent_id(child), Ok(id));

        let data = UTEXT + PAGE_SIZE;
        let (pp, _) = kernel.page_lookup(id, data).unwrap().unwrap();
        assert_eq!(kernel.frame_ref(pp), 2);
        u.write(data, b"DATA").unwrap();
        assert_eq!(kernel.frame_ref(pp), 1);
        let (mine, perm) = kernel.page_lookup(id, data).unwrap().unwrap();
        assert_ne!(mine, pp);
        assert_eq!(perm, Perm::user(Access::ReadWrite));
        // the temporary window is gone again
        assert_eq!(kernel.page_lookup(id, PFTEMP), Ok(None));
    }
}
