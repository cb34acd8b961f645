use gvon_wire::{FrameError, WireError};
use std::fmt;

#[derive(Clone, Debug)]
pub enum CommError {
    /// Connection loss, unreachable peer or signaling service.
    Transport(String),
    /// Operation on an unknown or mismatched context, or a sub-context
    /// request with addresses outside the parent.
    InvalidContext(String),
    /// Corrupt or unexpected control data.
    Protocol(String),
    /// A required transport option is missing or unusable.
    Configuration(String),
    /// A delivered message does not fit the receive buffer.
    SizeMismatch { expected: usize, actual: usize },
}

impl fmt::Display for CommError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(reason) => write!(f, "transport error: {reason}"),
            Self::InvalidContext(reason) => write!(f, "invalid context: {reason}"),
            Self::Protocol(reason) => write!(f, "protocol error: {reason}"),
            Self::Configuration(reason) => write!(f, "configuration error: {reason}"),
            Self::SizeMismatch { expected, actual } => {
                write!(
                    f,
                    "receive buffer of {expected} bytes cannot hold {actual} bytes"
                )
            }
        }
    }
}

impl std::error::Error for CommError {}

impl From<WireError> for CommError {
    fn from(value: WireError) -> Self {
        Self::Protocol(value.to_string())
    }
}

impl From<FrameError> for CommError {
    fn from(value: FrameError) -> Self {
        Self::Protocol(value.to_string())
    }
}

impl From<std::io::Error> for CommError {
    fn from(value: std::io::Error) -> Self {
        Self::Transport(value.to_string())
    }
}
