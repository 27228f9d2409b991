//! Environment management for a two-level paged kernel, with a user-mode
//! runtime that forks copy-on-write.
//!
//! Physical memory and the MMU are simulated on the host; page tables are
//! real little-endian words inside frames, so the `UVPT` self-map works as
//! it would on hardware.

extern crate lazy_static;
extern crate spin;

/// kernel error codes.
pub mod err;
/// kernel configuration.
pub mod config;
/// memory management.
pub mod memory;
/// handle exception
pub mod exception;
/// environments
pub mod env;
/// user-mode runtime
pub mod ulib;
pub mod util;

pub use config::KernelConfig;
pub use env::{EnvId, EnvStatus, EnvType, Kernel};
pub use err::Error;
