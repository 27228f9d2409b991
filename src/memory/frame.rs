use super::mmu::{PhysAddr, PhysPageNum, PAGE_SIZE};
use crate::err::Error;

type PhysFrameLink = Option<PhysPageNum>;

pub struct PhysFrame {
    pf_link: PhysFrameLink,
    pf_ref: u16,
}

pub struct PhysFrameList {
    head: PhysFrameLink,
}

/// Physical memory: the frame descriptors plus the bytes they describe.
///
/// Frame 0 is reserved and never handed out, so a zero ppn in an entry can
/// never alias a live page.
pub struct FrameAllocator {
    frames: Vec<PhysFrame>,
    memory: Vec<u8>,
    frames_free_list: PhysFrameList,
}

impl FrameAllocator {
    pub fn new(nframes: usize) -> Self {
        let mut fa = Self {
            frames: (0..nframes).map(|_| PhysFrame { pf_link: None, pf_ref: 0 }).collect(),
            memory: vec![0; nframes * PAGE_SIZE],
            frames_free_list: PhysFrameList { head: None },
        };
        if nframes > 0 {
            fa.frames[0].pf_ref = 1;
        }
        for ppn in 1..nframes {
            fa.push(PhysPageNum::new(ppn));
        }
        fa
    }

    #[inline]
    pub fn nframes(&self) -> usize {
        self.frames.len()
    }

    #[inline]
    fn get_frame_mut_by_ppn(&mut self, ppn: PhysPageNum) -> &mut PhysFrame {
        &mut self.frames[ppn.as_usize()]
    }

    #[inline]
    fn get_frame_by_ppn(&self, ppn: PhysPageNum) -> &PhysFrame {
        &self.frames[ppn.as_usize()]
    }

    /// pop a frame off the free list and zero it.
    pub fn alloc(&mut self) -> Result<PhysPageNum, Error> {
        match self.pop() {
            Some(ppn) => {
                self.bytes_mut(ppn).fill(0);
                Ok(ppn)
            }
            None => Err(Error::NoMem),
        }
    }

    #[inline]
    pub fn dealloc(&mut self, ppn: PhysPageNum) {
        assert!(self.get_frame_by_ppn(ppn).pf_ref == 0);
        self.push(ppn);
    }

    #[inline]
    pub fn incref(&mut self, ppn: PhysPageNum) {
        self.get_frame_mut_by_ppn(ppn).pf_ref += 1;
    }

    /// drop one reference, returning the frame to the free list at zero.
    #[inline]
    pub fn decref(&mut self, ppn: PhysPageNum) {
        let frame = self.get_frame_mut_by_ppn(ppn);
        assert!(frame.pf_ref > 0);
        frame.pf_ref -= 1;
        if frame.pf_ref == 0 {
            self.dealloc(ppn);
        }
    }

    #[inline]
    pub fn frame_ref(&self, ppn: PhysPageNum) -> u16 {
        self.get_frame_by_ppn(ppn).pf_ref
    }

    /// number of frames on the free list.
    pub fn nfree(&self) -> usize {
        let mut count = 0;
        let mut p = self.frames_free_list.head;
        while let Some(ppn) = p {
            count += 1;
            p = self.get_frame_by_ppn(ppn).pf_link;
        }
        count
    }

    #[inline]
    pub fn bytes(&self, ppn: PhysPageNum) -> &[u8] {
        let base = PhysAddr::from(ppn).as_usize();
        &self.memory[base..base + PAGE_SIZE]
    }

    #[inline]
    pub fn bytes_mut(&mut self, ppn: PhysPageNum) -> &mut [u8] {
        let base = PhysAddr::from(ppn).as_usize();
        &mut self.memory[base..base + PAGE_SIZE]
    }

    /// little-endian word at a 4-byte aligned physical address.
    #[inline]
    pub fn read_u32(&self, pa: PhysAddr) -> u32 {
        let off = pa.as_usize();
        let mut word = [0u8; 4];
        word.copy_from_slice(&self.memory[off..off + 4]);
        u32::from_le_bytes(word)
    }

    #[inline]
    pub fn write_u32(&mut self, pa: PhysAddr, value: u32) {
        let off = pa.as_usize();
        self.memory[off..off + 4].copy_from_slice(&value.to_le_bytes());
    }

    #[inline]
    fn push(&mut self, ppn: PhysPageNum) {
        let head = self.frames_free_list.head;
        self.get_frame_mut_by_ppn(ppn).pf_link = head;
        self.frames_free_list.head = Some(ppn);
    }

    #[inline]
    fn pop(&mut self) -> Option<PhysPageNum> {
        let head = self.frames_free_list.head?;
        self.frames_free_list.head = self.get_frame_by_ppn(head).pf_link;
        self.get_frame_mut_by_ppn(head).pf_link = None;
        Some(head)
    }
}
