use crate::{env::ENVGENSHIFT, err::Error, memory::mmu::{KERNBASE, PAGE_SIZE}};

/// default size of the environment table.
pub const NENV: usize = 1 << 10;
/// default number of physical frames (32 MiB).
pub const NFRAMES: usize = 8192;
const MIN_FRAMES: usize = 16;

/// Boot-time parameters of a kernel instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KernelConfig {
    /// number of environment slots, a power of two.
    pub nenv: usize,
    /// number of physical frames.
    pub nframes: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            nenv: NENV,
            nframes: NFRAMES,
        }
    }
}

impl KernelConfig {
    #[inline]
    pub fn with_nenv(mut self, nenv: usize) -> Self {
        self.nenv = nenv;
        self
    }

    #[inline]
    pub fn with_nframes(mut self, nframes: usize) -> Self {
        self.nframes = nframes;
        self
    }

    /// Slot indexes must fit under the generation bits and all of physical
    /// memory must fit in the window above `KERNBASE`.
    pub fn validate(&self) -> Result<(), Error> {
        if !self.nenv.is_power_of_two() || self.nenv > 1 << ENVGENSHIFT {
            return Err(Error::Inval);
        }
        let max_frames = (u32::MAX as usize - KERNBASE + 1) / PAGE_SIZE;
        if self.nframes < MIN_FRAMES || self.nframes > max_frames {
            return Err(Error::Inval);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(KernelConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_bad_table_sizes() {
        let base = KernelConfig::default();
        assert_eq!(base.with_nenv(0).validate(), Err(Error::Inval));
        assert_eq!(base.with_nenv(12).validate(), Err(Error::Inval));
        assert_eq!(base.with_nenv(1 << 13).validate(), Err(Error::Inval));
        assert_eq!(base.with_nframes(4).validate(), Err(Error::Inval));
        assert_eq!(base.with_nframes(1 << 20).validate(), Err(Error::Inval));
        assert!(base.with_nenv(1).with_nframes(65536).validate().is_ok());
    }
}
