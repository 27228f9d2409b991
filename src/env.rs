pub mod loader;
pub mod schedule;
pub mod syscall;

use core::fmt;

use log::{debug, info};
use spin::{Mutex, MutexGuard};

use crate::{
    config::KernelConfig,
    err::Error,
    exception::traps::{Trapframe, UpcallEntry, FL_IF, FL_IOPL_3, GD_UD, GD_UT},
    memory::{
        mmu::{Perm, PhysPageNum, PteFlags, VirtAddr, PAGE_TABLE_ENTRIES, USTACKTOP, UTOP, UVPT},
        page_table::{PageTable, Pte},
        pmap::Pmap,
    },
    ulib::syscall::UserEnv,
    util::queue::IndexLink,
};

/// bits above the slot index hold the generation
pub const ENVGENSHIFT: usize = 12;

/// Environment id: generation in the high bits, table slot in the low ones.
/// Zero always means "the current environment".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default)]
#[repr(transparent)]
pub struct EnvId(i32);

impl EnvId {
    #[inline]
    pub const fn zero() -> Self {
        Self(0)
    }
    #[inline]
    pub const fn from_raw(v: i32) -> Self {
        Self(v)
    }
    #[inline]
    pub const fn as_i32(self) -> i32 {
        self.0
    }
    #[inline]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
    /// table slot of this id in a table of `nenv` entries.
    #[inline]
    pub const fn envx(self, nenv: usize) -> usize {
        (self.0 as usize) & (nenv - 1)
    }
}

impl fmt::LowerHex for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum EnvStatus {
    Free,
    /// destroyed while running elsewhere, freed on its next kernel entry
    Dying,
    Runnable,
    Running,
    NotRunnable,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum EnvType {
    User,
    /// file system server, runs with I/O privilege
    Fs,
}

/// Environment control block.
pub struct Env {
    pub(crate) env_tf: Trapframe,
    pub(crate) env_id: EnvId,
    pub(crate) env_parent_id: EnvId,
    pub(crate) env_type: EnvType,
    pub(crate) env_status: EnvStatus,
    pub(crate) env_runs: u32,
    pub(crate) env_cpunum: usize,
    pub(crate) env_pgdir: Option<PageTable>,
    pub(crate) env_pgfault_upcall: Option<UpcallEntry>,
}

impl Env {
    pub fn new() -> Self {
        Env {
            env_tf: Trapframe::new(),
            env_id: EnvId::zero(),
            env_parent_id: EnvId::zero(),
            env_type: EnvType::User,
            env_status: EnvStatus::Free,
            env_runs: 0,
            env_cpunum: 0,
            env_pgdir: None,
            env_pgfault_upcall: None,
        }
    }

    #[inline]
    pub fn id(&self) -> EnvId {
        self.env_id
    }
    #[inline]
    pub fn parent_id(&self) -> EnvId {
        self.env_parent_id
    }
    #[inline]
    pub fn status(&self) -> EnvStatus {
        self.env_status
    }
    #[inline]
    pub fn env_type(&self) -> EnvType {
        self.env_type
    }
    #[inline]
    pub fn runs(&self) -> u32 {
        self.env_runs
    }
    #[inline]
    pub fn cpunum(&self) -> usize {
        self.env_cpunum
    }
    #[inline]
    pub fn trapframe(&self) -> &Trapframe {
        &self.env_tf
    }
    #[inline]
    pub fn pgdir(&self) -> Option<PageTable> {
        self.env_pgdir
    }
    #[inline]
    pub fn has_pgfault_upcall(&self) -> bool {
        self.env_pgfault_upcall.is_some()
    }
}

impl Default for Env {
    fn default() -> Self {
        Self::new()
    }
}

/// The environment table, physical memory and the CPU state the kernel
/// keeps about them.
pub struct EnvManager {
    pub(crate) envs: Vec<Env>,
    env_free_list: IndexLink,
    pub(crate) cur_env_ind: Option<usize>,
    nenv: usize,
    pub(crate) pmap: Pmap,
}

impl EnvManager {
    pub fn new(config: &KernelConfig) -> Result<Self, Error> {
        config.validate()?;
        let mut em = EnvManager {
            envs: Vec::new(),
            env_free_list: IndexLink::new(),
            cur_env_ind: None,
            nenv: config.nenv,
            pmap: Pmap::new(config.nframes)?,
        };
        em.env_init();
        Ok(em)
    }

    /// Mark every slot free and thread them onto the free list so that the
    /// first allocation returns slot 0.
    pub fn env_init(&mut self) {
        self.envs.clear();
        self.envs.resize_with(self.nenv, Env::new);
        self.env_free_list.init(self.nenv);
        for i in (0..self.nenv).rev() {
            self.envs[i].env_status = EnvStatus::Free;
            self.envs[i].env_id = EnvId::zero();
            self.env_free_list.insert_head(i);
        }
        self.cur_env_ind = None;
    }

    #[inline]
    pub fn nenv(&self) -> usize {
        self.nenv
    }

    #[inline]
    pub fn env(&self, ind: usize) -> &Env {
        &self.envs[ind]
    }

    #[inline]
    pub fn curenv(&self) -> Option<&Env> {
        self.cur_env_ind.map(|ind| &self.envs[ind])
    }

    /// id of the current environment, zero in kernel context.
    #[inline]
    pub fn curenv_id(&self) -> EnvId {
        self.curenv().map_or(EnvId::zero(), Env::id)
    }

    #[inline]
    pub fn pmap(&self) -> &Pmap {
        &self.pmap
    }

    #[inline]
    pub fn nfree_envs(&self) -> usize {
        self.env_free_list.len()
    }

    /// Give slot `ind` a fresh directory sharing the kernel's page tables
    /// above `UTOP`, with its own read-only self-map at `UVPT`.
    fn setup_vm(&mut self, ind: usize) -> Result<(), Error> {
        let kern = self.pmap.kern_pgdir();
        let fa = self.pmap.frames_mut();
        let ppn = fa.alloc()?;
        let pgdir = PageTable::new(ppn);
        for pdx in UTOP.pdx()..PAGE_TABLE_ENTRIES {
            let pde = kern.entry(fa, pdx);
            pgdir.set_entry(fa, pdx, pde);
        }
        pgdir.set_entry(fa, UVPT.pdx(), Pte::new_from_ppn(ppn, PteFlags::PRESENT | PteFlags::USER));
        fa.incref(ppn);
        self.envs[ind].env_pgdir = Some(pgdir);
        Ok(())
    }

    fn mkenvid(&self, ind: usize) -> EnvId {
        let old = self.envs[ind].env_id.0;
        let mut generation = old.wrapping_add(1 << ENVGENSHIFT) & !((self.nenv as i32) - 1);
        if generation <= 0 {
            generation = 1 << ENVGENSHIFT;
        }
        EnvId(generation | ind as i32)
    }

    /// Take the first free slot and build its address space. The new
    /// environment is runnable but has no program yet.
    pub fn env_alloc(&mut self, parent_id: EnvId) -> Result<EnvId, Error> {
        let ind = self.env_free_list.first().ok_or(Error::NoFreeEnv)?;
        self.setup_vm(ind)?;
        let envid = self.mkenvid(ind);
        let e = &mut self.envs[ind];
        e.env_id = envid;
        e.env_parent_id = parent_id;
        e.env_type = EnvType::User;
        e.env_status = EnvStatus::Runnable;
        e.env_runs = 0;
        e.env_pgfault_upcall = None;

        e.env_tf = Trapframe::new();
        e.env_tf.ds = GD_UD | 3;
        e.env_tf.es = GD_UD | 3;
        e.env_tf.ss = GD_UD | 3;
        e.env_tf.esp = USTACKTOP.as_usize() as u32;
        e.env_tf.cs = GD_UT | 3;
        e.env_tf.eflags = FL_IF;

        self.env_free_list.remove(ind);
        info!("[{:08x}] new env {:08x}", self.curenv_id(), envid);
        Ok(envid)
    }

    /// Resolve `id` to a table slot. With `checkperm`, the target must be
    /// the current environment or one of its children.
    pub fn envid2env(&self, id: EnvId, checkperm: bool) -> Result<usize, Error> {
        if id.is_zero() {
            return self.cur_env_ind.ok_or(Error::BadEnv);
        }
        let ind = id.envx(self.nenv);
        let e = &self.envs[ind];
        if e.env_status == EnvStatus::Free || e.env_id != id {
            return Err(Error::BadEnv);
        }
        if checkperm && self.cur_env_ind != Some(ind) {
            let cur_id = self.curenv().map(Env::id);
            if cur_id != Some(e.env_parent_id) {
                return Err(Error::BadEnv);
            }
        }
        Ok(ind)
    }

    /// Release every user mapping, the page tables and the directory, then
    /// return the slot to the free list.
    pub fn env_free(&mut self, ind: usize) {
        let envid = self.envs[ind].env_id;
        info!("[{:08x}] free env {:08x}", self.curenv_id(), envid);
        assert!(self.envs[ind].env_status != EnvStatus::Free, "env_free: env {:08x} already free", envid);

        if self.cur_env_ind == Some(ind) {
            let kern = self.pmap.kern_pgdir();
            self.pmap.lcr3(kern);
        }

        if let Some(pgdir) = self.envs[ind].env_pgdir.take() {
            let fa = self.pmap.frames_mut();
            for pdx in 0..UTOP.pdx() {
                let pde = pgdir.entry(fa, pdx);
                if !pde.valid() {
                    continue;
                }
                for ptx in 0..PAGE_TABLE_ENTRIES {
                    if PageTable::table_entry(fa, pde.ppn(), ptx).valid() {
                        pgdir.remove(fa, VirtAddr::from_indexes(pdx, ptx, 0));
                    }
                }
                pgdir.set_entry(fa, pdx, Pte::default());
                fa.decref(pde.ppn());
            }
            fa.decref(pgdir.root());
        }

        let e = &mut self.envs[ind];
        e.env_status = EnvStatus::Free;
        e.env_pgfault_upcall = None;
        self.env_free_list.insert_head(ind);
    }

    /// Free the environment, or mark it dying if it is running but not
    /// current. Destroying the current environment leaves the CPU idle.
    pub fn env_destroy(&mut self, ind: usize) {
        if self.envs[ind].env_status == EnvStatus::Running && self.cur_env_ind != Some(ind) {
            self.envs[ind].env_status = EnvStatus::Dying;
            return;
        }
        self.env_free(ind);
        if self.cur_env_ind == Some(ind) {
            self.cur_env_ind = None;
        }
    }

    /// Context switch bookkeeping: demote the previous environment if it was
    /// running, promote `ind` and load its directory.
    pub fn prepare_run(&mut self, ind: usize) {
        if let Some(cur) = self.cur_env_ind {
            if self.envs[cur].env_status == EnvStatus::Running {
                self.envs[cur].env_status = EnvStatus::Runnable;
            }
        }
        self.cur_env_ind = Some(ind);
        let e = &mut self.envs[ind];
        e.env_status = EnvStatus::Running;
        e.env_runs += 1;
        e.env_cpunum = 0;
        debug!("run env {:08x} at ip {:08x}", e.env_id, e.env_tf.eip);
        if let Some(pgdir) = e.env_pgdir {
            self.pmap.lcr3(pgdir);
        }
    }

    /// The mapping of `va` in environment `ind`.
    pub fn env_page_lookup(&self, ind: usize, va: VirtAddr) -> Option<(PhysPageNum, Pte)> {
        let pgdir = self.envs[ind].env_pgdir?;
        self.pmap.page_lookup(pgdir, va)
    }
}

/// One kernel instance. The mutex is the big kernel lock: held for every
/// kernel-side operation and released when control drops to user mode.
pub struct Kernel {
    em: Mutex<EnvManager>,
}

impl Kernel {
    pub fn new(config: KernelConfig) -> Result<Self, Error> {
        Ok(Self {
            em: Mutex::new(EnvManager::new(&config)?),
        })
    }

    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, EnvManager> {
        self.em.lock()
    }

    /// Allocate an environment and load `binary` into it. Boot-time path:
    /// every failure is a kernel panic.
    pub fn create(&self, binary: &[u8], env_type: EnvType) -> EnvId {
        let mut em = self.lock();
        let envid = match em.env_alloc(EnvId::zero()) {
            Ok(envid) => envid,
            Err(e) => panic!("env_create: env_alloc: {}", e),
        };
        let ind = envid.envx(em.nenv());
        if let Err(e) = em.load_icode(ind, binary) {
            panic!("env_create: load_icode: {}", e);
        }
        let env = &mut em.envs[ind];
        env.env_type = env_type;
        if env_type == EnvType::Fs {
            env.env_tf.eflags |= FL_IOPL_3;
        }
        envid
    }

    /// Dispatch `id` from kernel context.
    ///
    /// Only `Runnable` and `Running` environments can be dispatched; a child
    /// still being set up by `sys_exofork` is `NotRunnable` and gets `BadEnv`.
    pub fn run(&self, id: EnvId) -> Result<UserEnv<'_>, Error> {
        let em = self.lock();
        let ind = em.envid2env(id, false)?;
        if !matches!(em.envs[ind].env_status, EnvStatus::Runnable | EnvStatus::Running) {
            return Err(Error::BadEnv);
        }
        Ok(self.env_run(em, ind))
    }

    /// Switch to `ind`, drop the kernel lock and pop its registers into a
    /// user-mode context.
    pub(crate) fn env_run<'k>(&'k self, mut em: MutexGuard<'k, EnvManager>, ind: usize) -> UserEnv<'k> {
        em.prepare_run(ind);
        let env = &em.envs[ind];
        let (envid, tf) = (env.env_id, env.env_tf);
        drop(em);
        UserEnv::new(self, envid, tf)
    }

    /// Kernel entry from user mode on behalf of `id`: save its registers.
    /// A dying environment is freed here instead.
    pub(crate) fn trap_enter(&self, id: EnvId, tf: &Trapframe) -> Result<MutexGuard<'_, EnvManager>, Error> {
        let mut em = self.lock();
        let ind = id.envx(em.nenv());
        if em.cur_env_ind != Some(ind) || em.envs[ind].env_id != id {
            return Err(Error::Halted);
        }
        if em.envs[ind].env_status == EnvStatus::Dying {
            em.env_free(ind);
            em.cur_env_ind = None;
            return Err(Error::Halted);
        }
        em.envs[ind].env_tf = *tf;
        Ok(em)
    }

    /// Return to the current environment if it can still run; otherwise the
    /// CPU idles on the kernel directory.
    pub(crate) fn trap_exit<'k>(&'k self, mut em: MutexGuard<'k, EnvManager>) -> Option<UserEnv<'k>> {
        match em.cur_env_ind {
            Some(ind) if matches!(em.envs[ind].env_status, EnvStatus::Running | EnvStatus::Runnable) => {
                Some(self.env_run(em, ind))
            }
            _ => {
                em.cur_env_ind = None;
                let kern = em.pmap.kern_pgdir();
                em.pmap.lcr3(kern);
                None
            }
        }
    }

    pub fn destroy(&self, id: EnvId) -> Result<(), Error> {
        let mut em = self.lock();
        let ind = em.envid2env(id, false)?;
        em.env_destroy(ind);
        Ok(())
    }

    pub fn status(&self, id: EnvId) -> Result<EnvStatus, Error> {
        let em = self.lock();
        let ind = em.envid2env(id, false)?;
        Ok(em.envs[ind].env_status)
    }

    pub fn parent_id(&self, id: EnvId) -> Result<EnvId, Error> {
        let em = self.lock();
        let ind = em.envid2env(id, false)?;
        Ok(em.envs[ind].env_parent_id)
    }

    pub fn runs(&self, id: EnvId) -> Result<u32, Error> {
        let em = self.lock();
        let ind = em.envid2env(id, false)?;
        Ok(em.envs[ind].env_runs)
    }

    /// the current environment, if the CPU is not idle.
    pub fn current(&self) -> Option<EnvId> {
        self.lock().curenv().map(Env::id)
    }

    /// The frame and permission mapped at `va` in `id`'s address space.
    pub fn page_lookup(&self, id: EnvId, va: VirtAddr) -> Result<Option<(PhysPageNum, Perm)>, Error> {
        let em = self.lock();
        let ind = em.envid2env(id, false)?;
        match em.env_page_lookup(ind, va) {
            Some((ppn, pte)) => Ok(Some((ppn, pte.perm()?))),
            None => Ok(None),
        }
    }

    pub fn frame_ref(&self, ppn: PhysPageNum) -> u16 {
        self.lock().pmap.frames().frame_ref(ppn)
    }

    pub fn free_frames(&self) -> usize {
        self.lock().pmap.frames().nfree()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::mmu::{Access, ULIM, UTEXT};

    fn manager(nenv: usize) -> EnvManager {
        EnvManager::new(&KernelConfig::default().with_nenv(nenv).with_nframes(256)).unwrap()
    }

    #[test]
    fn first_alloc_takes_slot_zero() {
        let mut em = manager(8);
        let a = em.env_alloc(EnvId::zero()).unwrap();
        let b = em.env_alloc(a).unwrap();
        assert_eq!(a.envx(8), 0);
        assert_eq!(b.envx(8), 1);
        assert_eq!(a.as_i32(), 1 << ENVGENSHIFT);
        assert_eq!(em.env(1).parent_id(), a);
        assert_eq!(em.env(0).status(), EnvStatus::Runnable);
        let tf = em.env(0).trapframe();
        assert_eq!(tf.esp as usize, USTACKTOP.as_usize());
        assert_eq!(tf.cs, GD_UT | 3);
        assert_eq!(tf.ds, GD_UD | 3);
        assert_eq!(tf.eflags & FL_IOPL_3, 0);
    }

    #[test]
    fn capacity_then_reuse() {
        let mut em = manager(4);
        let ids: Vec<_> = (0..4).map(|_| em.env_alloc(EnvId::zero()).unwrap()).collect();
        assert_eq!(em.env_alloc(EnvId::zero()), Err(Error::NoFreeEnv));

        let ind = em.envid2env(ids[2], false).unwrap();
        em.env_free(ind);
        let again = em.env_alloc(EnvId::zero()).unwrap();
        assert_eq!(again.envx(4), 2);
        assert_ne!(again, ids[2]);
        assert_eq!(em.envid2env(ids[2], false), Err(Error::BadEnv));
        assert_eq!(em.envid2env(again, false), Ok(2));
    }

    #[test]
    fn envid2env_checks() {
        let mut em = manager(8);
        assert_eq!(em.envid2env(EnvId::zero(), false), Err(Error::BadEnv));
        let parent = em.env_alloc(EnvId::zero()).unwrap();
        let child = em.env_alloc(parent).unwrap();
        let other = em.env_alloc(EnvId::zero()).unwrap();

        em.prepare_run(parent.envx(8));
        assert_eq!(em.envid2env(EnvId::zero(), true), Ok(0));
        assert_eq!(em.envid2env(child, true), Ok(1));
        assert_eq!(em.envid2env(other, true), Err(Error::BadEnv));
        assert_eq!(em.envid2env(other, false), Ok(2));
        // wrong generation for a live slot
        let forged = EnvId::from_raw(child.as_i32() + (1 << ENVGENSHIFT));
        assert_eq!(em.envid2env(forged, false), Err(Error::BadEnv));
    }

    #[test]
    fn generation_wraps_to_first() {
        let mut em = manager(8);
        em.envs[3].env_id = EnvId::from_raw(0x7fff_f003);
        let mut first = Vec::new();
        for _ in 0..4 {
            first.push(em.env_alloc(EnvId::zero()).unwrap());
        }
        assert_eq!(first[3], EnvId::from_raw((1 << ENVGENSHIFT) | 3));
        assert!(first.iter().all(|id| id.as_i32() > 0));
    }

    #[test]
    fn kernel_region_is_shared() {
        let mut em = manager(4);
        let a = em.env_alloc(EnvId::zero()).unwrap();
        let b = em.env_alloc(EnvId::zero()).unwrap();
        let kern = em.pmap.kern_pgdir();
        let fa = em.pmap.frames();
        for id in [a, b] {
            let pgdir = em.env(id.envx(4)).pgdir().unwrap();
            for pdx in VirtAddr::new(ULIM).pdx()..PAGE_TABLE_ENTRIES {
                assert_eq!(pgdir.entry(fa, pdx), kern.entry(fa, pdx));
            }
            let selfmap = pgdir.entry(fa, UVPT.pdx());
            assert_eq!(selfmap.ppn(), pgdir.root());
            assert_eq!(selfmap.flags(), PteFlags::PRESENT | PteFlags::USER);
            assert_eq!(fa.frame_ref(pgdir.root()), 1);
            for pdx in 0..UTOP.pdx() {
                assert!(!pgdir.entry(fa, pdx).valid());
            }
        }
    }

    #[test]
    fn free_returns_every_frame() {
        let mut em = manager(4);
        let before = em.pmap.frames().nfree();
        let id = em.env_alloc(EnvId::zero()).unwrap();
        let ind = id.envx(4);
        let pgdir = em.env(ind).pgdir().unwrap();
        for va in [UTEXT, UTEXT + 0x1000, USTACKTOP - 0x1000] {
            let pp = em.pmap.page_alloc().unwrap();
            em.pmap.page_insert(pgdir, pp, va, Perm::user(Access::ReadWrite)).unwrap();
        }
        assert!(em.pmap.frames().nfree() < before);
        em.env_free(ind);
        assert_eq!(em.pmap.frames().nfree(), before);
        assert!(em.env(ind).pgdir().is_none());
        assert_eq!(em.env(ind).status(), EnvStatus::Free);
    }

    #[test]
    fn run_demotes_only_running() {
        let mut em = manager(4);
        let a = em.env_alloc(EnvId::zero()).unwrap().envx(4);
        let b = em.env_alloc(EnvId::zero()).unwrap().envx(4);
        let c = em.env_alloc(EnvId::zero()).unwrap().envx(4);

        em.prepare_run(a);
        assert_eq!(em.env(a).status(), EnvStatus::Running);
        assert_eq!(em.env(a).runs(), 1);
        assert_eq!(em.pmap.rcr3(), em.env(a).pgdir().unwrap());
        em.prepare_run(b);
        assert_eq!(em.env(a).status(), EnvStatus::Runnable);
        assert_eq!(em.env(b).status(), EnvStatus::Running);

        em.envs[b].env_status = EnvStatus::Dying;
        em.prepare_run(c);
        assert_eq!(em.env(b).status(), EnvStatus::Dying);
        assert_eq!(em.env(c).status(), EnvStatus::Running);
        assert_eq!(em.curenv_id(), em.env(c).id());
    }

    #[test]
    fn destroy_running_elsewhere_marks_dying() {
        let mut em = manager(4);
        let a = em.env_alloc(EnvId::zero()).unwrap().envx(4);
        let b = em.env_alloc(EnvId::zero()).unwrap().envx(4);
        em.prepare_run(a);
        em.envs[b].env_status = EnvStatus::Running;
        em.env_destroy(b);
        assert_eq!(em.env(b).status(), EnvStatus::Dying);

        em.env_destroy(a);
        assert_eq!(em.env(a).status(), EnvStatus::Free);
        assert!(em.curenv().is_none());
        assert_eq!(em.pmap.rcr3(), em.pmap.kern_pgdir());
    }

    #[test]
    fn dying_env_is_freed_on_kernel_entry() {
        let kernel = Kernel::new(KernelConfig::default().with_nenv(4).with_nframes(256)).unwrap();
        let id = kernel.lock().env_alloc(EnvId::zero()).unwrap();
        let u = kernel.run(id).unwrap();
        kernel.lock().envs[id.envx(4)].env_status = EnvStatus::Dying;
        assert!(matches!(kernel.trap_enter(id, u.trapframe()), Err(Error::Halted)));
        assert_eq!(kernel.status(id), Err(Error::BadEnv));
        assert_eq!(kernel.current(), None);
        assert!(matches!(kernel.run(id), Err(Error::BadEnv)));
    }

    #[test]
    fn exofork_child_waits_for_runnable() {
        let kernel = Kernel::new(KernelConfig::default().with_nenv(4).with_nframes(256)).unwrap();
        let id = kernel.lock().env_alloc(EnvId::zero()).unwrap();
        let mut u = kernel.run(id).unwrap();
        let child = u.sys_exofork().unwrap();
        assert_eq!(kernel.status(child), Ok(EnvStatus::NotRunnable));
        assert!(matches!(kernel.run(child), Err(Error::BadEnv)));
        assert_eq!(kernel.current(), Some(id));

        u.sys_env_set_status(child, EnvStatus::Runnable).unwrap();
        let c = kernel.run(child).unwrap();
        assert_eq!(c.trapframe().regs.eax, 0);
        assert_eq!(kernel.status(id), Ok(EnvStatus::Runnable));
    }
}
