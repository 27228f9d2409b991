//! User-mode runtime linked into every environment.

pub mod fork;
pub mod pgfault;
pub mod syscall;

use core::fmt;

use log::error;

use crate::{
    env::EnvId,
    err::Error,
    memory::{
        mmu::{Access, Perm, VirtAddr, ULOCALS},
        page_table::Pte,
    },
};
use syscall::UserEnv;

/// process-local word holding this environment's id
pub const THISENV_SLOT: VirtAddr = ULOCALS;
/// process-local word naming the registered page fault handler, 0 if none
pub const PGFAULT_HANDLER_SLOT: VirtAddr = VirtAddr::new(ULOCALS.as_usize() + 4);

/// Log and destroy the calling environment. Returns the error the caller
/// should propagate to stop.
pub fn user_panic(u: &mut UserEnv<'_>, args: fmt::Arguments<'_>) -> Error {
    error!("[{:08x}] user panic: {}", u.envid(), args);
    // destroying ourselves never comes back
    let _ = u.sys_env_destroy(EnvId::zero());
    Error::Halted
}

#[macro_export]
macro_rules! user_panic {
    ($u:expr, $($arg:tt)*) => {
        $crate::ulib::user_panic($u, format_args!($($arg)*))
    };
}

/// Map the process-local page if it is not there yet.
pub fn ensure_locals(u: &mut UserEnv<'_>) -> Result<(), Error> {
    if pte_of(u, ULOCALS)?.is_none() {
        u.sys_page_alloc(EnvId::zero(), ULOCALS, Perm::user(Access::ReadWrite))?;
    }
    Ok(())
}

/// Runtime start-up: process-local page and `thisenv`.
pub fn libmain(u: &mut UserEnv<'_>) -> Result<(), Error> {
    ensure_locals(u)?;
    let me = u.sys_getenvid()?;
    set_thisenv(u, me)
}

pub fn thisenv(u: &mut UserEnv<'_>) -> Result<EnvId, Error> {
    u.read_u32(THISENV_SLOT).map(|raw| EnvId::from_raw(raw as i32))
}

pub fn set_thisenv(u: &mut UserEnv<'_>, id: EnvId) -> Result<(), Error> {
    u.write_u32(THISENV_SLOT, id.as_i32() as u32)
}

/// Present entry mapping `va`, looked up through `uvpd` first so that an
/// absent page table never faults.
pub fn pte_of(u: &mut UserEnv<'_>, va: VirtAddr) -> Result<Option<Pte>, Error> {
    if !u.uvpd(va.pdx())?.valid() {
        return Ok(None);
    }
    let pte = u.uvpt(va.vpn())?;
    Ok(Some(pte).filter(|pte| pte.valid()))
}
