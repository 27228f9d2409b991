use log::info;

use super::{EnvId, EnvManager, EnvStatus};
use crate::{
    err::Error,
    exception::traps::UpcallEntry,
    memory::mmu::{Perm, VirtAddr, UTOP},
};

/// syscall id, passed in `eax` on entry
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum SyscallID {
    GetEnvID,
    EnvDestroy,
    Exofork,
    EnvSetStatus,
    EnvSetPgfaultUpcall,
    PageAlloc,
    PageMap,
    PageUnmap,
}

/// A privileged call with its arguments.
#[derive(Clone, Copy)]
pub enum Syscall {
    GetEnvId,
    EnvDestroy(EnvId),
    Exofork,
    EnvSetStatus(EnvId, EnvStatus),
    EnvSetPgfaultUpcall(EnvId, UpcallEntry),
    PageAlloc(EnvId, VirtAddr, Perm),
    PageMap {
        srcid: EnvId,
        srcva: VirtAddr,
        dstid: EnvId,
        dstva: VirtAddr,
        perm: Perm,
    },
    PageUnmap(EnvId, VirtAddr),
}

impl Syscall {
    pub fn id(&self) -> SyscallID {
        match self {
            Syscall::GetEnvId => SyscallID::GetEnvID,
            Syscall::EnvDestroy(_) => SyscallID::EnvDestroy,
            Syscall::Exofork => SyscallID::Exofork,
            Syscall::EnvSetStatus(..) => SyscallID::EnvSetStatus,
            Syscall::EnvSetPgfaultUpcall(..) => SyscallID::EnvSetPgfaultUpcall,
            Syscall::PageAlloc(..) => SyscallID::PageAlloc,
            Syscall::PageMap { .. } => SyscallID::PageMap,
            Syscall::PageUnmap(..) => SyscallID::PageUnmap,
        }
    }
}

/// user page address below `UTOP`
#[inline]
fn check_user_page(va: VirtAddr) -> Result<(), Error> {
    if va >= UTOP || !va.is_page_aligned() {
        return Err(Error::Inval);
    }
    Ok(())
}

/// privileged calls only hand out user mappings
#[inline]
fn check_perm(perm: Perm) -> Result<(), Error> {
    if !perm.is_user() {
        return Err(Error::Inval);
    }
    Ok(())
}

impl EnvManager {
    /// Dispatch a call made by the current environment.
    pub fn syscall(&mut self, call: Syscall) -> Result<i32, Error> {
        match call {
            Syscall::GetEnvId => Ok(self.sys_getenvid().as_i32()),
            Syscall::EnvDestroy(envid) => self.sys_env_destroy(envid).map(|_| 0),
            Syscall::Exofork => self.sys_exofork().map(EnvId::as_i32),
            Syscall::EnvSetStatus(envid, status) => self.sys_env_set_status(envid, status).map(|_| 0),
            Syscall::EnvSetPgfaultUpcall(envid, func) => self.sys_env_set_pgfault_upcall(envid, func).map(|_| 0),
            Syscall::PageAlloc(envid, va, perm) => self.sys_page_alloc(envid, va, perm).map(|_| 0),
            Syscall::PageMap { srcid, srcva, dstid, dstva, perm } => {
                self.sys_page_map(srcid, srcva, dstid, dstva, perm).map(|_| 0)
            }
            Syscall::PageUnmap(envid, va) => self.sys_page_unmap(envid, va).map(|_| 0),
        }
    }

    /// get current env id
    fn sys_getenvid(&self) -> EnvId {
        self.curenv_id()
    }

    /// destroy env
    fn sys_env_destroy(&mut self, envid: EnvId) -> Result<(), Error> {
        let ind = self.envid2env(envid, true)?;
        let cur = self.curenv_id();
        let target = self.envs[ind].env_id;
        if target == cur {
            info!("[{:08x}] exiting gracefully", cur);
        } else {
            info!("[{:08x}] destroying {:08x}", cur, target);
        }
        self.env_destroy(ind);
        Ok(())
    }

    /// Blank child: parent's registers with a zero return value, no user
    /// mappings, not runnable until the parent says so.
    fn sys_exofork(&mut self) -> Result<EnvId, Error> {
        let cur = self.cur_env_ind.ok_or(Error::BadEnv)?;
        let parent_id = self.envs[cur].env_id;
        let child = self.env_alloc(parent_id)?;
        let ind = child.envx(self.nenv);
        let tf = self.envs[cur].env_tf;
        let e = &mut self.envs[ind];
        e.env_status = EnvStatus::NotRunnable;
        e.env_tf = tf;
        e.env_tf.regs.eax = 0;
        Ok(child)
    }

    /// set env status of env
    fn sys_env_set_status(&mut self, envid: EnvId, status: EnvStatus) -> Result<(), Error> {
        if status != EnvStatus::Runnable && status != EnvStatus::NotRunnable {
            return Err(Error::Inval);
        }
        let ind = self.envid2env(envid, true)?;
        self.envs[ind].env_status = status;
        Ok(())
    }

    fn sys_env_set_pgfault_upcall(&mut self, envid: EnvId, func: UpcallEntry) -> Result<(), Error> {
        let ind = self.envid2env(envid, true)?;
        self.envs[ind].env_pgfault_upcall = Some(func);
        Ok(())
    }

    /// map a fresh zeroed page at `va`
    fn sys_page_alloc(&mut self, envid: EnvId, va: VirtAddr, perm: Perm) -> Result<(), Error> {
        check_user_page(va)?;
        check_perm(perm)?;
        let ind = self.envid2env(envid, true)?;
        let pgdir = self.envs[ind].env_pgdir.ok_or(Error::BadEnv)?;
        let ppn = self.pmap.page_alloc()?;
        if self.pmap.page_insert(pgdir, ppn, va, perm).is_err() {
            self.pmap.frames_mut().dealloc(ppn);
            return Err(Error::NoMem);
        }
        Ok(())
    }

    /// map the page at `srcva` in `srcid` into `dstid` at `dstva`
    fn sys_page_map(&mut self, srcid: EnvId, srcva: VirtAddr, dstid: EnvId, dstva: VirtAddr, perm: Perm) -> Result<(), Error> {
        check_user_page(srcva)?;
        check_user_page(dstva)?;
        let srcind = self.envid2env(srcid, true)?;
        let dstind = self.envid2env(dstid, true)?;
        let (ppn, pte) = self.env_page_lookup(srcind, srcva).ok_or(Error::Inval)?;
        check_perm(perm)?;
        if perm.is_writable() && !pte.perm()?.is_writable() {
            return Err(Error::Inval);
        }
        let pgdir = self.envs[dstind].env_pgdir.ok_or(Error::BadEnv)?;
        self.pmap.page_insert(pgdir, ppn, dstva, perm)
    }

    /// unmap `va`; unmapping nothing succeeds
    fn sys_page_unmap(&mut self, envid: EnvId, va: VirtAddr) -> Result<(), Error> {
        check_user_page(va)?;
        let ind = self.envid2env(envid, true)?;
        let pgdir = self.envs[ind].env_pgdir.ok_or(Error::BadEnv)?;
        self.pmap.page_remove(pgdir, va);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::KernelConfig,
        memory::mmu::{Access, UTEXT},
    };

    /// a manager with env 0 running and env 1 its child
    fn running() -> (EnvManager, EnvId, EnvId) {
        let mut em = EnvManager::new(&KernelConfig::default().with_nenv(4).with_nframes(128)).unwrap();
        let parent = em.env_alloc(EnvId::zero()).unwrap();
        em.prepare_run(parent.envx(4));
        let child = em.env_alloc(parent).unwrap();
        (em, parent, child)
    }

    fn rw() -> Perm {
        Perm::user(Access::ReadWrite)
    }

    #[test]
    fn exofork_copies_registers() {
        let (mut em, parent, _) = running();
        em.envs[0].env_tf.regs.eax = 99;
        em.envs[0].env_tf.eip = 0x0080_0040;
        let raw = em.syscall(Syscall::Exofork).unwrap();
        let child = EnvId::from_raw(raw);
        let ind = child.envx(4);
        assert_eq!(em.env(ind).parent_id(), parent);
        assert_eq!(em.env(ind).status(), EnvStatus::NotRunnable);
        assert_eq!(em.env(ind).trapframe().regs.eax, 0);
        assert_eq!(em.env(ind).trapframe().eip, 0x0080_0040);
        assert!(em.env_page_lookup(ind, UTEXT).is_none());
    }

    #[test]
    fn set_status_accepts_only_runnable_states() {
        let (mut em, _, child) = running();
        assert_eq!(em.syscall(Syscall::EnvSetStatus(child, EnvStatus::Running)), Err(Error::Inval));
        assert_eq!(em.syscall(Syscall::EnvSetStatus(child, EnvStatus::Free)), Err(Error::Inval));
        assert_eq!(em.syscall(Syscall::EnvSetStatus(child, EnvStatus::NotRunnable)), Ok(0));
        assert_eq!(em.env(child.envx(4)).status(), EnvStatus::NotRunnable);
    }

    #[test]
    fn page_calls_validate_arguments() {
        let (mut em, _, child) = running();
        let me = EnvId::zero();
        let kernel_only = Perm::kernel(Access::ReadWrite);
        assert_eq!(em.syscall(Syscall::PageAlloc(me, UTEXT + 1, rw())), Err(Error::Inval));
        assert_eq!(em.syscall(Syscall::PageAlloc(me, UTOP, rw())), Err(Error::Inval));
        assert_eq!(em.syscall(Syscall::PageAlloc(me, UTEXT, kernel_only)), Err(Error::Inval));
        assert_eq!(em.syscall(Syscall::PageUnmap(me, UTEXT + 4)), Err(Error::Inval));

        let unmapped = Syscall::PageMap { srcid: me, srcva: UTEXT, dstid: child, dstva: UTEXT, perm: rw() };
        assert_eq!(em.syscall(unmapped), Err(Error::Inval));

        let ro = Perm::user(Access::ReadOnly);
        em.syscall(Syscall::PageAlloc(me, UTEXT, ro)).unwrap();
        let upgrade = Syscall::PageMap { srcid: me, srcva: UTEXT, dstid: child, dstva: UTEXT, perm: rw() };
        assert_eq!(em.syscall(upgrade), Err(Error::Inval));
        let cow = Syscall::PageMap { srcid: me, srcva: UTEXT, dstid: child, dstva: UTEXT, perm: ro.to_cow() };
        assert_eq!(em.syscall(cow), Ok(0));
    }

    #[test]
    fn page_map_shares_the_frame() {
        let (mut em, _, child) = running();
        let me = EnvId::zero();
        em.syscall(Syscall::PageAlloc(me, UTEXT, rw())).unwrap();
        let cow = rw().to_cow();
        let map = Syscall::PageMap { srcid: me, srcva: UTEXT, dstid: child, dstva: UTEXT + 0x1000, perm: cow };
        em.syscall(map).unwrap();

        let (ppn, _) = em.env_page_lookup(0, UTEXT).unwrap();
        let (cppn, cpte) = em.env_page_lookup(child.envx(4), UTEXT + 0x1000).unwrap();
        assert_eq!(ppn, cppn);
        assert_eq!(cpte.perm(), Ok(cow));
        assert_eq!(em.pmap.frames().frame_ref(ppn), 2);

        // re-marking our own mapping keeps the count
        let own = Syscall::PageMap { srcid: me, srcva: UTEXT, dstid: me, dstva: UTEXT, perm: cow };
        em.syscall(own).unwrap();
        assert_eq!(em.pmap.frames().frame_ref(ppn), 2);

        em.syscall(Syscall::PageUnmap(child, UTEXT + 0x1000)).unwrap();
        em.syscall(Syscall::PageUnmap(child, UTEXT + 0x1000)).unwrap();
        assert_eq!(em.pmap.frames().frame_ref(ppn), 1);
    }

    #[test]
    fn strangers_are_off_limits() {
        let (mut em, _, _) = running();
        let stranger = em.env_alloc(EnvId::zero()).unwrap();
        assert_eq!(em.syscall(Syscall::EnvDestroy(stranger)), Err(Error::BadEnv));
        assert_eq!(em.syscall(Syscall::PageAlloc(stranger, UTEXT, rw())), Err(Error::BadEnv));
        assert_eq!(em.syscall(Syscall::GetEnvId), Ok(em.curenv_id().as_i32()));
    }
}
