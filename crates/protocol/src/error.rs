//! Protocol error types

use thiserror::Error;

/// USBTMC wire format errors
///
/// Any of these on an inbound bulk frame means the bulk-IN pipe is in an
/// undefined state and must be recovered with the abort sequence; the port
/// layer never drops a malformed frame silently.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame shorter than the fixed USBTMC bulk header
    #[error("Frame too short: {actual} bytes (header needs {expected})")]
    FrameTooShort { expected: usize, actual: usize },

    /// bTag and its inverse do not match on an inbound frame
    #[error("bTag consistency check failed: bTag={btag:#04x}, bTagInverse={btag_inverse:#04x}")]
    BTagMismatch { btag: u8, btag_inverse: u8 },

    /// Reply carries a bTag that does not answer the oldest open request
    #[error("Unexpected reply bTag: expected {expected:#04x}, got {actual:#04x}")]
    UnexpectedBTag { expected: u8, actual: u8 },

    /// MsgID not in the supported set
    #[error("Unsupported MsgID: {0:#04x}")]
    UnsupportedMsgId(u8),

    /// Declared TransferSize exceeds the bytes actually present
    #[error("Truncated payload: header declares {declared} bytes, frame carries {available}")]
    TruncatedPayload { declared: usize, available: usize },

    /// Control response shorter or longer than the request defines
    #[error("Unexpected control response size: expected {expected}, got {actual}")]
    UnexpectedResponseSize { expected: usize, actual: usize },

    /// Status byte outside the values defined by the USBTMC specification
    #[error("Unknown USBTMC status: {0:#04x}")]
    UnknownStatus(u8),
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;
