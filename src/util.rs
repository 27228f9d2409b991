/// index linked list
pub mod queue;
/// elf utils
pub mod elf;
