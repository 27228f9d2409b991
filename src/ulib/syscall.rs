use core::fmt;

use spin::MutexGuard;

use crate::{
    env::{syscall::Syscall, EnvId, EnvManager, EnvStatus, Kernel},
    err::Error,
    exception::traps::{FaultReason, Trapframe, UTrapframe, UpcallEntry, T_PGFLT, T_SYSCALL},
    memory::{
        mmu::{Perm, VirtAddr, PGSHIFT, UVPT},
        page_table::Pte,
    },
};

/// An environment executing in user mode on the CPU.
///
/// Holds its live registers; the kernel lock is not held. Every privileged
/// call or fault enters the kernel through the owning [`Kernel`], and once
/// the environment has been switched away from or destroyed the handle only
/// yields [`Error::Halted`].
pub struct UserEnv<'k> {
    kernel: &'k Kernel,
    id: EnvId,
    tf: Trapframe,
}

impl<'k> UserEnv<'k> {
    pub(crate) fn new(kernel: &'k Kernel, id: EnvId, tf: Trapframe) -> Self {
        Self { kernel, id, tf }
    }

    #[inline]
    pub fn envid(&self) -> EnvId {
        self.id
    }

    #[inline]
    pub fn trapframe(&self) -> &Trapframe {
        &self.tf
    }

    #[inline]
    pub fn trapframe_mut(&mut self) -> &mut Trapframe {
        &mut self.tf
    }

    #[inline]
    pub fn kernel(&self) -> &'k Kernel {
        self.kernel
    }

    /// Trap into the kernel with `call`. The result comes back in `eax`,
    /// negative on failure.
    pub fn syscall(&mut self, call: Syscall) -> Result<i32, Error> {
        self.tf.regs.eax = call.id() as u32;
        self.tf.trapno = T_SYSCALL;
        let mut em = self.kernel.trap_enter(self.id, &self.tf)?;
        let ret = em.syscall(call).unwrap_or_else(i32::from);
        if let Some(ind) = em.cur_env_ind {
            em.envs[ind].env_tf.regs.eax = ret as u32;
        }
        self.resume(em)?;
        match self.tf.regs.eax as i32 {
            code if code < 0 => Err(Error::from_code(code)),
            v => Ok(v),
        }
    }

    /// Take a page fault: the kernel either pushes a `UTrapframe` and sends
    /// us to the registered upcall, or destroys us.
    pub fn page_fault(&mut self, fault_va: VirtAddr, err: FaultReason) -> Result<(), Error> {
        self.tf.trapno = T_PGFLT;
        self.tf.err = err.bits();
        let mut em = self.kernel.trap_enter(self.id, &self.tf)?;
        let upcall = em.page_fault_handler(fault_va, err);
        self.resume(em)?;
        match upcall {
            Some(upcall) => upcall(self),
            None => Err(Error::Halted),
        }
    }

    /// pop back to user mode, or report that we no longer run.
    fn resume(&mut self, em: MutexGuard<'k, EnvManager>) -> Result<(), Error> {
        match self.kernel.trap_exit(em) {
            Some(resumed) if resumed.id == self.id => {
                *self = resumed;
                Ok(())
            }
            _ => Err(Error::Halted),
        }
    }

    /// the kernel lock, provided we are still the one on the CPU.
    fn on_cpu(&self) -> Result<MutexGuard<'k, EnvManager>, Error> {
        let em = self.kernel.lock();
        match em.curenv() {
            Some(env) if env.id() == self.id && env.status() == EnvStatus::Running => Ok(em),
            _ => Err(Error::Halted),
        }
    }

    /// Load from user memory, faulting and retrying as the hardware would.
    pub fn read(&mut self, va: VirtAddr, buf: &mut [u8]) -> Result<(), Error> {
        loop {
            let (fault_va, err) = match self.on_cpu()?.pmap.user_read(va, buf) {
                Ok(()) => return Ok(()),
                Err(fault) => fault,
            };
            self.page_fault(fault_va, err)?;
        }
    }

    /// Store to user memory.
    pub fn write(&mut self, va: VirtAddr, data: &[u8]) -> Result<(), Error> {
        loop {
            let (fault_va, err) = match self.on_cpu()?.pmap.user_write(va, data) {
                Ok(()) => return Ok(()),
                Err(fault) => fault,
            };
            self.page_fault(fault_va, err)?;
        }
    }

    pub fn read_u32(&mut self, va: VirtAddr) -> Result<u32, Error> {
        let mut word = [0u8; 4];
        self.read(va, &mut word)?;
        Ok(u32::from_le_bytes(word))
    }

    pub fn write_u32(&mut self, va: VirtAddr, value: u32) -> Result<(), Error> {
        self.write(va, &value.to_le_bytes())
    }

    /// Page table entry for page number `pn`, read through the self-map.
    /// Faults unless the covering directory entry is present.
    pub fn uvpt(&mut self, pn: usize) -> Result<Pte, Error> {
        self.read_u32(UVPT + pn * 4).map(Pte::new)
    }

    /// Page directory entry `pdx`, read through the self-map.
    pub fn uvpd(&mut self, pdx: usize) -> Result<Pte, Error> {
        let uvpd = UVPT + (UVPT.pdx() << PGSHIFT);
        self.read_u32(uvpd + pdx * 4).map(Pte::new)
    }

    /// Return from an exception upcall to the interrupted context.
    pub fn resume_from(&mut self, utf: &UTrapframe) {
        self.tf.regs = utf.regs;
        self.tf.eip = utf.eip;
        self.tf.eflags = utf.eflags;
        self.tf.esp = utf.esp;
    }

    pub fn sys_getenvid(&mut self) -> Result<EnvId, Error> {
        self.syscall(Syscall::GetEnvId).map(EnvId::from_raw)
    }

    pub fn sys_env_destroy(&mut self, envid: EnvId) -> Result<(), Error> {
        self.syscall(Syscall::EnvDestroy(envid)).map(|_| ())
    }

    pub fn sys_exofork(&mut self) -> Result<EnvId, Error> {
        self.syscall(Syscall::Exofork).map(EnvId::from_raw)
    }

    pub fn sys_env_set_status(&mut self, envid: EnvId, status: EnvStatus) -> Result<(), Error> {
        self.syscall(Syscall::EnvSetStatus(envid, status)).map(|_| ())
    }

    pub fn sys_env_set_pgfault_upcall(&mut self, envid: EnvId, func: UpcallEntry) -> Result<(), Error> {
        self.syscall(Syscall::EnvSetPgfaultUpcall(envid, func)).map(|_| ())
    }

    pub fn sys_page_alloc(&mut self, envid: EnvId, va: VirtAddr, perm: Perm) -> Result<(), Error> {
        self.syscall(Syscall::PageAlloc(envid, va, perm)).map(|_| ())
    }

    pub fn sys_page_map(&mut self, srcid: EnvId, srcva: VirtAddr, dstid: EnvId, dstva: VirtAddr, perm: Perm) -> Result<(), Error> {
        self.syscall(Syscall::PageMap {
            srcid,
            srcva,
            dstid,
            dstva,
            perm,
        })
        .map(|_| ())
    }

    pub fn sys_page_unmap(&mut self, envid: EnvId, va: VirtAddr) -> Result<(), Error> {
        self.syscall(Syscall::PageUnmap(envid, va)).map(|_| ())
    }
}

impl fmt::Debug for UserEnv<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserEnv")
            .field("id", &format_args!("{:08x}", self.id))
            .field("eip", &format_args!("{:08x}", self.tf.eip))
            .field("esp", &format_args!("{:08x}", self.tf.esp))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::KernelConfig,
        env::EnvType,
        memory::mmu::{Access, PAGE_SIZE, USTACKTOP, UTEXT},
        util::elf::{ImageBuilder, PF_R, PF_W, PF_X},
    };

    fn boot() -> (Kernel, EnvId) {
        let kernel = Kernel::new(KernelConfig::default().with_nenv(8).with_nframes(512)).unwrap();
        let image = ImageBuilder::new(UTEXT)
            .segment(UTEXT, b"\x90\x90\xc3", 3, PF_R | PF_X)
            .segment(UTEXT + PAGE_SIZE, b"hello", 64, PF_R | PF_W)
            .build();
        let id = kernel.create(&image, EnvType::User);
        (kernel, id)
    }

    #[test]
    fn memory_goes_through_user_mappings() {
        let (kernel, id) = boot();
        let mut u = kernel.run(id).unwrap();
        let mut buf = [0u8; 5];
        u.read(UTEXT + PAGE_SIZE, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        u.write_u32(USTACKTOP - 4, 0xfeed_f00d).unwrap();
        assert_eq!(u.read_u32(USTACKTOP - 4), Ok(0xfeed_f00d));
        assert_eq!(u.sys_getenvid(), Ok(id));
    }

    #[test]
    fn self_map_is_read_only() {
        let (kernel, id) = boot();
        let mut u = kernel.run(id).unwrap();
        let pde = u.uvpd(UTEXT.pdx()).unwrap();
        assert!(pde.valid());
        let pte = u.uvpt(UTEXT.vpn()).unwrap();
        assert_eq!(pte.perm(), Ok(Perm::user(Access::ReadWrite)));
        // no upcall: the write to the self-map kills us
        assert_eq!(u.write_u32(UVPT + UTEXT.vpn() * 4, 0), Err(Error::Halted));
        assert_eq!(kernel.status(id), Err(Error::BadEnv));
        assert_eq!(kernel.current(), None);
    }

    #[test]
    fn failed_call_reports_error_and_keeps_running() {
        let (kernel, id) = boot();
        let mut u = kernel.run(id).unwrap();
        let rw = Perm::user(Access::ReadWrite);
        assert_eq!(u.sys_page_alloc(EnvId::zero(), UTEXT + 1, rw), Err(Error::Inval));
        assert_eq!(u.sys_env_destroy(EnvId::from_raw(0x7000_0001)), Err(Error::BadEnv));
        assert_eq!(u.sys_getenvid(), Ok(id));
    }

    #[test]
    fn switched_out_handle_halts() {
        let (kernel, id) = boot();
        let image = ImageBuilder::new(UTEXT).segment(UTEXT, b"\xc3", 1, PF_R | PF_X).build();
        let other = kernel.create(&image, EnvType::User);
        let mut u = kernel.run(id).unwrap();
        let _v = kernel.run(other).unwrap();
        assert_eq!(u.sys_getenvid(), Err(Error::Halted));
        assert_eq!(kernel.status(id), Ok(EnvStatus::Runnable));
        let mut again = kernel.run(id).unwrap();
        assert_eq!(kernel.runs(id), Ok(2));
        // every return to user mode counts as a run
        assert_eq!(again.sys_getenvid(), Ok(id));
        assert_eq!(kernel.runs(id), Ok(3));
    }
}
