use bitflags::bitflags;
use log::warn;

use crate::{
    env::EnvManager,
    err::Error,
    memory::mmu::{PteFlags, VirtAddr, PAGE_SIZE, UXSTACKTOP},
    ulib::syscall::UserEnv,
};

/// user text segment selector
pub const GD_UT: u16 = 0x18;
/// user data segment selector
pub const GD_UD: u16 = 0x20;

/// interrupt enable
pub const FL_IF: u32 = 0x0000_0200;
/// I/O privilege level 3
pub const FL_IOPL_3: u32 = 0x0000_3000;

pub const T_PGFLT: u32 = 14;
pub const T_SYSCALL: u32 = 48;

bitflags! {
    /// Page fault error code.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct FaultReason: u32 {
        /// the page was present, the access violated its protection
        const PROTECTION = 0x1;
        const WRITE = 0x2;
        const USER = 0x4;
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct PushRegs {
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub oesp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
}

impl PushRegs {
    fn to_words(self) -> [u32; 8] {
        [self.edi, self.esi, self.ebp, self.oesp, self.ebx, self.edx, self.ecx, self.eax]
    }

    fn from_words(w: [u32; 8]) -> Self {
        Self {
            edi: w[0],
            esi: w[1],
            ebp: w[2],
            oesp: w[3],
            ebx: w[4],
            edx: w[5],
            ecx: w[6],
            eax: w[7],
        }
    }
}

/// Saved user registers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct Trapframe {
    pub regs: PushRegs,
    pub es: u16,
    pub ds: u16,
    pub trapno: u32,
    pub err: u32,
    pub eip: u32,
    pub cs: u16,
    pub eflags: u32,
    pub esp: u32,
    pub ss: u16,
}

impl Trapframe {
    pub fn new() -> Self {
        Self::default()
    }

    /// privilege level the frame was saved from
    #[inline]
    pub fn cpl(&self) -> u16 {
        self.cs & 3
    }
}

/// The record pushed on the user exception stack for a page fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UTrapframe {
    pub fault_va: u32,
    pub err: FaultReason,
    pub regs: PushRegs,
    pub eip: u32,
    pub eflags: u32,
    pub esp: u32,
}

/// bytes of a `UTrapframe` on the exception stack.
pub const UTRAPFRAME_SIZE: usize = 52;

impl UTrapframe {
    pub fn to_bytes(&self) -> [u8; UTRAPFRAME_SIZE] {
        let mut words = [0u32; UTRAPFRAME_SIZE / 4];
        words[0] = self.fault_va;
        words[1] = self.err.bits();
        words[2..10].copy_from_slice(&self.regs.to_words());
        words[10] = self.eip;
        words[11] = self.eflags;
        words[12] = self.esp;
        let mut out = [0u8; UTRAPFRAME_SIZE];
        for (chunk, w) in out.chunks_exact_mut(4).zip(words) {
            chunk.copy_from_slice(&w.to_le_bytes());
        }
        out
    }

    pub fn from_bytes(raw: &[u8; UTRAPFRAME_SIZE]) -> Self {
        let mut words = [0u32; UTRAPFRAME_SIZE / 4];
        for (w, chunk) in words.iter_mut().zip(raw.chunks_exact(4)) {
            *w = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        let mut regs = [0u32; 8];
        regs.copy_from_slice(&words[2..10]);
        Self {
            fault_va: words[0],
            err: FaultReason::from_bits_retain(words[1]),
            regs: PushRegs::from_words(regs),
            eip: words[10],
            eflags: words[11],
            esp: words[12],
        }
    }
}

/// User-mode entry point the kernel resumes into after pushing a
/// `UTrapframe`; it finds the record at `esp`.
pub type UpcallEntry = fn(&mut UserEnv<'_>) -> Result<(), Error>;

impl EnvManager {
    /// Page fault taken by the current environment.
    ///
    /// Returns the upcall to resume into with the fault record pushed on the
    /// exception stack, or `None` once the environment has been destroyed.
    pub fn page_fault_handler(&mut self, fault_va: VirtAddr, err: FaultReason) -> Option<UpcallEntry> {
        let ind = self.cur_env_ind?;
        let tf = self.envs[ind].env_tf;
        if tf.cpl() == 0 {
            panic!("kernel page fault at va {:08x} ip {:08x}", fault_va, tf.eip);
        }
        let envid = self.envs[ind].env_id;

        let Some(upcall) = self.envs[ind].env_pgfault_upcall else {
            warn!("[{:08x}] user fault va {:08x} ip {:08x}", envid, fault_va, tf.eip);
            self.env_destroy(ind);
            return None;
        };

        let esp = tf.esp as usize;
        let xstack = (UXSTACKTOP - PAGE_SIZE).as_usize()..UXSTACKTOP.as_usize();
        let utf_va = if xstack.contains(&esp) {
            // recursive fault: leave one scratch word below the old frame
            VirtAddr::new(esp - UTRAPFRAME_SIZE - 4)
        } else {
            UXSTACKTOP - UTRAPFRAME_SIZE
        };

        let pgdir = self.envs[ind].pgdir()?;
        let need = PteFlags::USER | PteFlags::WRITABLE;
        if self.pmap.user_mem_check(pgdir, utf_va, UTRAPFRAME_SIZE, need).is_err() {
            warn!("[{:08x}] user_mem_check assertion failure for va {:08x}", envid, utf_va);
            self.env_destroy(ind);
            return None;
        }

        let utf = UTrapframe {
            fault_va: fault_va.as_usize() as u32,
            err,
            regs: tf.regs,
            eip: tf.eip,
            eflags: tf.eflags,
            esp: tf.esp,
        };
        if let Err(e) = self.pmap.kernel_write(utf_va, &utf.to_bytes()) {
            panic!("page_fault_handler: exception stack write: {}", e);
        }
        self.envs[ind].env_tf.esp = utf_va.as_usize() as u32;
        Some(upcall)
    }
}
