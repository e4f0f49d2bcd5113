use thiserror::Error;

use crate::bootstrap::BootstrapError;
use crate::transport::setup::TransportConnectError;

/// Coarse result codes surfaced through the communicator's sticky
/// async-error slot. Keep the discriminants stable: they are stored in an
/// `AtomicU32` and read back with `from_u32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    Success = 0,
    SystemError = 1,
    InternalError = 2,
    InvalidArgument = 3,
    InvalidUsage = 4,
    TransportError = 5,
}

impl ErrorCode {
    pub(crate) fn from_u32(v: u32) -> ErrorCode {
        match v {
            0 => ErrorCode::Success,
            1 => ErrorCode::SystemError,
            2 => ErrorCode::InternalError,
            3 => ErrorCode::InvalidArgument,
            4 => ErrorCode::InvalidUsage,
            5 => ErrorCode::TransportError,
            _ => ErrorCode::InternalError,
        }
    }
}

#[derive(Debug, Error)]
pub enum CommError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("duplicate device: rank {0} and rank {1} both use device {2:#x} on the same host")]
    DuplicateDevice(usize, usize, u64),
    #[error("bootstrap error: {0}")]
    Bootstrap(#[from] BootstrapError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportConnectError),
    #[error("topology service error: {0}")]
    Topology(#[source] anyhow::Error),
    #[error("internal inconsistency: {0}")]
    Internal(String),
    #[error("usage error: {0}")]
    Usage(&'static str),
}

impl CommError {
    pub fn code(&self) -> ErrorCode {
        match self {
            CommError::Config(_) | CommError::DuplicateDevice(..) => ErrorCode::InvalidArgument,
            CommError::Bootstrap(_) | CommError::Transport(_) => ErrorCode::TransportError,
            CommError::Topology(_) => ErrorCode::SystemError,
            CommError::Internal(_) => ErrorCode::InternalError,
            CommError::Usage(_) => ErrorCode::InvalidUsage,
        }
    }
}
