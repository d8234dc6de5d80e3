//! Error types for compute resource management

use core::fmt;

/// Result type for compute operations
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Compute error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Buffer or address range exhausted
    AllocationFailure,
    /// CPU-visible mapping could not be established
    MappingFailure,
    /// Hardware generation not recognized
    UnsupportedHardware,
    /// Invalid parameter
    InvalidParameter,
    /// No device at the requested index
    DeviceNotFound,
    /// Resource still referenced
    ResourceInUse,
    /// No free slot in a command ring
    RingFull,
    /// Compute backend rejected the operation
    BackendFailure,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::AllocationFailure => write!(f, "Allocation failure"),
            Error::MappingFailure => write!(f, "Mapping failure"),
            Error::UnsupportedHardware => write!(f, "Unsupported hardware"),
            Error::InvalidParameter => write!(f, "Invalid parameter"),
            Error::DeviceNotFound => write!(f, "Device not found"),
            Error::ResourceInUse => write!(f, "Resource in use"),
            Error::RingFull => write!(f, "Ring full"),
            Error::BackendFailure => write!(f, "Backend failure"),
        }
    }
}

impl std::error::Error for Error {}
