/// trap frames and page fault delivery
pub mod traps;
