/// address types, layout and entry bits
pub mod mmu;
/// physical frames
pub mod frame;
pub mod page_table;
/// kernel directory and the active address space
pub mod pmap;
