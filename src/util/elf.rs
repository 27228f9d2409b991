use core::ops::Range;

use crate::{err::Error, memory::mmu::VirtAddr};

type Elf32Half = u16;
type Elf32Word = u32;
type Elf32Addr = u32;
type Elf32Off = u32;

/// "\x7FELF" read as a little-endian word
pub const ELF_MAGIC: u32 = 0x464C_457F;

/// bytes of the file header
pub const ELF_HDR_SIZE: usize = 52;
/// bytes of one program header
pub const ELF_PHDR_SIZE: usize = 32;

/* Legal values for p_type (segment type).  */

pub const PT_LOAD: u32 = 1; /* Loadable program segment */
pub const PT_NOTE: u32 = 4; /* Auxiliary information */

/* Legal values for p_flags (segment flags).  */

pub const PF_X: u32 = 1 << 0; /* Segment is executable */
pub const PF_W: u32 = 1 << 1; /* Segment is writable */
pub const PF_R: u32 = 1 << 2; /* Segment is readable */

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Elf32Ehdr {
    pub e_magic: Elf32Word,
    pub e_elf: [u8; 12],
    pub e_type: Elf32Half,
    pub e_machine: Elf32Half,
    pub e_version: Elf32Word,
    pub e_entry: Elf32Addr,
    pub e_phoff: Elf32Off,
    pub e_shoff: Elf32Off,
    pub e_flags: Elf32Word,
    pub e_ehsize: Elf32Half,
    pub e_phentsize: Elf32Half,
    pub e_phnum: Elf32Half,
    pub e_shentsize: Elf32Half,
    pub e_shnum: Elf32Half,
    pub e_shstrndx: Elf32Half,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Elf32Phdr {
    pub p_type: Elf32Word,
    pub p_offset: Elf32Off,
    pub p_vaddr: Elf32Addr,
    /// ignored by the loader
    pub p_paddr: Elf32Addr,
    pub p_filesz: Elf32Word,
    pub p_memsz: Elf32Word,
    pub p_flags: Elf32Word,
    pub p_align: Elf32Word,
}

#[inline]
fn u16_at(b: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([b[off], b[off + 1]])
}

#[inline]
fn u32_at(b: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}

impl Elf32Ehdr {
    /// `b` holds at least `ELF_HDR_SIZE` bytes.
    fn parse(b: &[u8]) -> Self {
        let mut e_elf = [0u8; 12];
        e_elf.copy_from_slice(&b[4..16]);
        Self {
            e_magic: u32_at(b, 0),
            e_elf,
            e_type: u16_at(b, 16),
            e_machine: u16_at(b, 18),
            e_version: u32_at(b, 20),
            e_entry: u32_at(b, 24),
            e_phoff: u32_at(b, 28),
            e_shoff: u32_at(b, 32),
            e_flags: u32_at(b, 36),
            e_ehsize: u16_at(b, 40),
            e_phentsize: u16_at(b, 42),
            e_phnum: u16_at(b, 44),
            e_shentsize: u16_at(b, 46),
            e_shnum: u16_at(b, 48),
            e_shstrndx: u16_at(b, 50),
        }
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.e_magic.to_le_bytes());
        out.extend_from_slice(&self.e_elf);
        for h in [self.e_type, self.e_machine] {
            out.extend_from_slice(&h.to_le_bytes());
        }
        for w in [self.e_version, self.e_entry, self.e_phoff, self.e_shoff, self.e_flags] {
            out.extend_from_slice(&w.to_le_bytes());
        }
        for h in [
            self.e_ehsize,
            self.e_phentsize,
            self.e_phnum,
            self.e_shentsize,
            self.e_shnum,
            self.e_shstrndx,
        ] {
            out.extend_from_slice(&h.to_le_bytes());
        }
    }
}

impl Elf32Phdr {
    fn parse(b: &[u8]) -> Self {
        Self {
            p_type: u32_at(b, 0),
            p_offset: u32_at(b, 4),
            p_vaddr: u32_at(b, 8),
            p_paddr: u32_at(b, 12),
            p_filesz: u32_at(b, 16),
            p_memsz: u32_at(b, 20),
            p_flags: u32_at(b, 24),
            p_align: u32_at(b, 28),
        }
    }

    fn write(&self, out: &mut Vec<u8>) {
        for w in [
            self.p_type,
            self.p_offset,
            self.p_vaddr,
            self.p_paddr,
            self.p_filesz,
            self.p_memsz,
            self.p_flags,
            self.p_align,
        ] {
            out.extend_from_slice(&w.to_le_bytes());
        }
    }

    #[inline]
    pub fn is_load(&self) -> bool {
        self.p_type == PT_LOAD
    }

    #[inline]
    pub fn va(&self) -> VirtAddr {
        VirtAddr::new(self.p_vaddr as usize)
    }

    /// bytes of the image copied into memory.
    #[inline]
    pub fn file_range(&self) -> Range<usize> {
        let start = self.p_offset as usize;
        start..start + self.p_filesz as usize
    }
}

/// A parsed program image borrowing its bytes.
pub struct Elf<'a> {
    binary: &'a [u8],
    ehdr: Elf32Ehdr,
}

pub struct PhdrIterator<'a> {
    elf: &'a Elf<'a>,
    ind: usize,
}

/// Check the magic and that the program header table lies inside `binary`.
pub fn elf_from(binary: &[u8]) -> Result<Elf<'_>, Error> {
    if binary.len() < ELF_HDR_SIZE {
        return Err(Error::BadImage);
    }
    let ehdr = Elf32Ehdr::parse(binary);
    if ehdr.e_magic != ELF_MAGIC {
        return Err(Error::BadImage);
    }
    let phnum = ehdr.e_phnum as usize;
    if phnum > 0 {
        if (ehdr.e_phentsize as usize) < ELF_PHDR_SIZE {
            return Err(Error::BadImage);
        }
        let table_end = ehdr.e_phoff as usize + (phnum - 1) * ehdr.e_phentsize as usize + ELF_PHDR_SIZE;
        if table_end > binary.len() {
            return Err(Error::BadImage);
        }
    }
    Ok(Elf { binary, ehdr })
}

impl<'a> Elf<'a> {
    #[inline]
    pub fn header(&self) -> &Elf32Ehdr {
        &self.ehdr
    }

    #[inline]
    pub fn entry(&self) -> VirtAddr {
        VirtAddr::new(self.ehdr.e_entry as usize)
    }

    #[inline]
    pub fn binary(&self) -> &'a [u8] {
        self.binary
    }

    pub fn phdr_iter(&self) -> PhdrIterator<'_> {
        PhdrIterator { elf: self, ind: 0 }
    }
}

impl Iterator for PhdrIterator<'_> {
    type Item = Elf32Phdr;

    fn next(&mut self) -> Option<Self::Item> {
        let ehdr = &self.elf.ehdr;
        if self.ind >= ehdr.e_phnum as usize {
            return None;
        }
        let off = ehdr.e_phoff as usize + self.ind * ehdr.e_phentsize as usize;
        self.ind += 1;
        Some(Elf32Phdr::parse(&self.elf.binary[off..off + ELF_PHDR_SIZE]))
    }
}

/// Assembles program images: a header, the program header table, then the
/// segment contents in order.
pub struct ImageBuilder {
    entry: VirtAddr,
    segments: Vec<(Elf32Phdr, Vec<u8>)>,
}

impl ImageBuilder {
    pub fn new(entry: VirtAddr) -> Self {
        Self {
            entry,
            segments: Vec::new(),
        }
    }

    /// A loadable segment at `va` holding `data` followed by
    /// `memsz - data.len()` zero bytes. `memsz` is taken as given, so a
    /// segment smaller than its file contents can be built on purpose.
    pub fn segment(mut self, va: VirtAddr, data: &[u8], memsz: usize, flags: u32) -> Self {
        let phdr = Elf32Phdr {
            p_type: PT_LOAD,
            p_vaddr: va.as_usize() as u32,
            p_paddr: va.as_usize() as u32,
            p_filesz: data.len() as u32,
            p_memsz: memsz as u32,
            p_flags: flags,
            p_align: 0x1000,
            ..Elf32Phdr::default()
        };
        self.segments.push((phdr, data.to_vec()));
        self
    }

    /// a program header the loader must skip.
    pub fn note(mut self, data: &[u8]) -> Self {
        let phdr = Elf32Phdr {
            p_type: PT_NOTE,
            p_filesz: data.len() as u32,
            ..Elf32Phdr::default()
        };
        self.segments.push((phdr, data.to_vec()));
        self
    }

    pub fn build(self) -> Vec<u8> {
        let phnum = self.segments.len();
        let mut offset = ELF_HDR_SIZE + phnum * ELF_PHDR_SIZE;
        let ehdr = Elf32Ehdr {
            e_magic: ELF_MAGIC,
            e_elf: [1, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0],
            e_type: 2,
            e_machine: 3,
            e_version: 1,
            e_entry: self.entry.as_usize() as u32,
            e_phoff: ELF_HDR_SIZE as u32,
            e_ehsize: ELF_HDR_SIZE as u16,
            e_phentsize: ELF_PHDR_SIZE as u16,
            e_phnum: phnum as u16,
            ..Elf32Ehdr::default()
        };
        let mut out = Vec::with_capacity(offset);
        ehdr.write(&mut out);
        for (phdr, data) in &self.segments {
            let phdr = Elf32Phdr {
                p_offset: offset as u32,
                ..*phdr
            };
            phdr.write(&mut out);
            offset += data.len();
        }
        for (_, data) in &self.segments {
            out.extend_from_slice(data);
        }
        out
    }
}
