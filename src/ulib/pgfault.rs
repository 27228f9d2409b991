use lazy_static::lazy_static;
use spin::Mutex;

use super::{ensure_locals, syscall::UserEnv, PGFAULT_HANDLER_SLOT};
use crate::{
    env::EnvId,
    err::Error,
    exception::traps::{UTrapframe, UTRAPFRAME_SIZE},
    memory::mmu::{Access, Perm, VirtAddr, PAGE_SIZE, UXSTACKTOP},
    user_panic,
};

/// User-level page fault handler, called on the exception stack.
pub type PgfaultHandler = fn(&mut UserEnv<'_>, &UTrapframe) -> Result<(), Error>;

lazy_static! {
    /// Handlers by slot; slot `n` is entry `n - 1`. User memory only stores
    /// the slot number.
    static ref HANDLERS: Mutex<Vec<PgfaultHandler>> = Mutex::new(Vec::new());
}

fn handler_slot(handler: PgfaultHandler) -> u32 {
    let mut handlers = HANDLERS.lock();
    let ind = match handlers.iter().position(|&h| h as usize == handler as usize) {
        Some(ind) => ind,
        None => {
            handlers.push(handler);
            handlers.len() - 1
        }
    };
    ind as u32 + 1
}

fn handler_at(slot: u32) -> Option<PgfaultHandler> {
    let ind = (slot as usize).checked_sub(1)?;
    HANDLERS.lock().get(ind).copied()
}

/// Route this environment's page faults to `handler`.
///
/// The first registration allocates the exception stack and installs
/// [`pgfault_upcall`] with the kernel.
pub fn set_pgfault_handler(u: &mut UserEnv<'_>, handler: PgfaultHandler) -> Result<(), Error> {
    ensure_locals(u)?;
    if u.read_u32(PGFAULT_HANDLER_SLOT)? == 0 {
        let xstack = UXSTACKTOP - PAGE_SIZE;
        if let Err(e) = u.sys_page_alloc(EnvId::zero(), xstack, Perm::user(Access::ReadWrite)) {
            return Err(user_panic!(u, "set_pgfault_handler: sys_page_alloc: {}", e));
        }
        if let Err(e) = u.sys_env_set_pgfault_upcall(EnvId::zero(), pgfault_upcall) {
            return Err(user_panic!(u, "set_pgfault_handler: sys_env_set_pgfault_upcall: {}", e));
        }
    }
    u.write_u32(PGFAULT_HANDLER_SLOT, handler_slot(handler))
}

/// Entry point the kernel sends page faults to. Calls the registered handler
/// with the record at `esp`, then returns to the faulting context.
pub fn pgfault_upcall(u: &mut UserEnv<'_>) -> Result<(), Error> {
    let esp = VirtAddr::new(u.trapframe().esp as usize);
    let mut raw = [0u8; UTRAPFRAME_SIZE];
    u.read(esp, &mut raw)?;
    let utf = UTrapframe::from_bytes(&raw);

    let slot = u.read_u32(PGFAULT_HANDLER_SLOT)?;
    let Some(handler) = handler_at(slot) else {
        return Err(user_panic!(u, "pgfault_upcall: no handler in slot {}", slot));
    };
    handler(u, &utf)?;
    u.resume_from(&utf);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::KernelConfig,
        env::{EnvType, Kernel},
        exception::traps::FaultReason,
        memory::mmu::{USTACKTOP, UTEXT},
        util::elf::{ImageBuilder, PF_R, PF_X},
    };

    /// maps the faulting page, so the access is retried successfully
    fn map_on_demand(u: &mut UserEnv<'_>, utf: &UTrapframe) -> Result<(), Error> {
        assert!(utf.err.contains(FaultReason::USER));
        let page = VirtAddr::new(utf.fault_va as usize).page_align_down();
        u.sys_page_alloc(EnvId::zero(), page, Perm::user(Access::ReadWrite))
    }

    #[test]
    fn handler_resolves_fault_and_context_returns() {
        let kernel = Kernel::new(KernelConfig::default().with_nenv(4).with_nframes(256)).unwrap();
        let image = ImageBuilder::new(UTEXT).segment(UTEXT, b"\xc3", 1, PF_R | PF_X).build();
        let id = kernel.create(&image, EnvType::User);
        let mut u = kernel.run(id).unwrap();
        set_pgfault_handler(&mut u, map_on_demand).unwrap();
        assert!(kernel.lock().curenv().unwrap().has_pgfault_upcall());

        let target = UTEXT + 0x10_0008;
        let before = *u.trapframe();
        u.write_u32(target, 42).unwrap();
        assert_eq!(u.read_u32(target), Ok(42));
        assert_eq!(u.trapframe().esp, before.esp);
        assert_eq!(u.trapframe().eip, before.eip);
        assert_eq!(u.trapframe().esp as usize, USTACKTOP.as_usize());

        // registering again reuses the exception stack
        let free = kernel.free_frames();
        set_pgfault_handler(&mut u, map_on_demand).unwrap();
        assert_eq!(kernel.free_frames(), free);
    }

    #[test]
    fn slots_are_stable() {
        let a = handler_slot(map_on_demand);
        assert!(a >= 1);
        assert_eq!(handler_slot(map_on_demand), a);
        assert!(handler_at(a).is_some());
        assert!(handler_at(0).is_none());
    }
}
