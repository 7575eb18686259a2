use crate::space::{MemorySpace, TransferKind};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("allocation of {bytes} bytes in {space} memory failed")]
    AllocationFailure { space: MemorySpace, bytes: usize },
    #[error("backend `{backend}` cannot allocate {space} memory")]
    UnsupportedSpace {
        backend: &'static str,
        space: MemorySpace,
    },
    #[error("matrix of {cols}x{rows} elements overflows the address space")]
    CapacityOverflow { cols: usize, rows: usize },
    #[error("{op} is not possible on {space} memory from host code")]
    InvalidSpaceForOperation {
        op: &'static str,
        space: MemorySpace,
    },
    #[error("shape mismatch: destination holds {dst} elements, source holds {src}")]
    ShapeMismatch { dst: usize, src: usize },
    #[error("{kind} transfer between handles owned by different backends")]
    BackendMismatch { kind: TransferKind },
    #[error("invalid {kind} transfer: {reason}")]
    InvalidTransfer { kind: TransferKind, reason: String },
    #[error("release of {addr:#x} which is not a live {space} allocation")]
    UnknownAllocation { space: MemorySpace, addr: usize },
    #[error("accelerator driver: {0}")]
    Driver(String),
    #[error("Unexpected: {0}")]
    Unexpected(String),
}

impl From<&str> for Error {
    fn from(e: &str) -> Self {
        Error::Unexpected(e.to_string())
    }
}

impl From<String> for Error {
    fn from(e: String) -> Self {
        Error::Unexpected(e)
    }
}

#[cfg(feature = "cuda")]
impl From<cudarc::driver::DriverError> for Error {
    fn from(e: cudarc::driver::DriverError) -> Self {
        Error::Driver(e.to_string())
    }
}

impl From<Error> for String {
    fn from(e: Error) -> Self {
        format!("{}", e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let e = Error::AllocationFailure {
            space: MemorySpace::Device,
            bytes: 64,
        };
        assert_eq!(e.to_string(), "allocation of 64 bytes in device memory failed");

        let e = Error::BackendMismatch {
            kind: TransferKind::HostToDevice,
        };
        assert_eq!(
            e.to_string(),
            "host-to-device transfer between handles owned by different backends"
        );

        let s: String = Error::from("boom").into();
        assert_eq!(s, "Unexpected: boom");
    }
}
