/// Kernel error codes.
///
/// The discriminants double as the syscall ABI: a failing privileged call
/// leaves the negated code in `eax`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
#[repr(i32)]
pub enum Error {
    #[error("unspecified error")]
    Unspecified = 1,
    #[error("bad environment")]
    BadEnv = 2,
    #[error("invalid parameter")]
    Inval = 3,
    #[error("out of memory")]
    NoMem = 4,
    #[error("out of environments")]
    NoFreeEnv = 5,
    #[error("segmentation fault")]
    Fault = 6,
    #[error("not an executable image")]
    BadImage = 13,
    #[error("environment halted")]
    Halted = 15,
}

impl Error {
    /// decode a negative syscall return value.
    pub fn from_code(code: i32) -> Self {
        match -code {
            2 => Error::BadEnv,
            3 => Error::Inval,
            4 => Error::NoMem,
            5 => Error::NoFreeEnv,
            6 => Error::Fault,
            13 => Error::BadImage,
            15 => Error::Halted,
            _ => Error::Unspecified,
        }
    }
}

impl From<Error> for i32 {
    fn from(value: Error) -> Self {
        -(value as i32)
    }
}
