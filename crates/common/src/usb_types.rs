//! Transfer roles and the port error taxonomy
//!
//! These types are shared between the port engine and the application side
//! of the channel bridge: every error event the engine raises, and every
//! handled-error notification the application observes, is one of these.

use protocol::ProtocolError;
use thiserror::Error;

/// The four endpoint roles the engine drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferRole {
    /// Default control endpoint
    Control,
    /// Bulk (or interrupt) IN data endpoint
    BulkIn,
    /// Bulk (or interrupt) OUT data endpoint
    BulkOut,
    /// Optional secondary interrupt-IN message channel
    MessageIn,
}

/// Port error taxonomy
///
/// Produced by transfer completion classification, consumed by the driving
/// loop. Timeouts and cancellations on bulk endpoints route into the
/// matching abort sequence and are then reported as handled, non-fatal
/// notifications; `Disconnected` triggers a bounded reconnect;
/// `Unhandled` stops the worker.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PortError {
    /// Device is gone; takes priority over every other outcome
    #[error("Device disconnected")]
    Disconnected,

    #[error("Control transfer timed out")]
    ControlTimeout,
    #[error("Read transfer timed out")]
    ReadTimeout,
    #[error("Write transfer timed out")]
    WriteTimeout,
    #[error("Message-in transfer timed out")]
    MessageInTimeout,

    #[error("Control transfer canceled")]
    ControlCanceled,
    #[error("Read transfer canceled")]
    ReadCanceled,
    #[error("Write transfer canceled")]
    WriteCanceled,
    #[error("Message-in transfer canceled")]
    MessageInCanceled,

    /// Endpoint reported a halt condition
    #[error("Endpoint stalled")]
    Stall,

    /// Generic transfer failure reported by the native layer
    #[error("Transfer error")]
    TransferError,

    /// Device sent more data than the transfer buffer could take
    #[error("Transfer overflow")]
    Overflow,

    /// Short packet received where the transfer forbids it
    #[error("Short packet not permitted")]
    ShortPacketNotPermitted,

    /// A frame pool was empty when a frame was needed
    #[error("Frame pool empty")]
    PoolEmpty,

    /// Bad device selection string or no matching endpoint
    #[error("Setup error: {0}")]
    Setup(String),

    /// USBTMC framing validation failure; recovered via abort-bulk-in
    #[error("Framing error: {0}")]
    Frame(#[from] ProtocolError),

    /// Native error with no mapping; fatal, stops the worker
    #[error("Unhandled error: {0}")]
    Unhandled(String),
}

impl PortError {
    /// Timeout variant for the given role
    pub fn timeout(role: TransferRole) -> Self {
        match role {
            TransferRole::Control => PortError::ControlTimeout,
            TransferRole::BulkIn => PortError::ReadTimeout,
            TransferRole::BulkOut => PortError::WriteTimeout,
            TransferRole::MessageIn => PortError::MessageInTimeout,
        }
    }

    /// Cancellation variant for the given role
    pub fn canceled(role: TransferRole) -> Self {
        match role {
            TransferRole::Control => PortError::ControlCanceled,
            TransferRole::BulkIn => PortError::ReadCanceled,
            TransferRole::BulkOut => PortError::WriteCanceled,
            TransferRole::MessageIn => PortError::MessageInCanceled,
        }
    }

    /// True for the per-role timeout variants
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            PortError::ControlTimeout
                | PortError::ReadTimeout
                | PortError::WriteTimeout
                | PortError::MessageInTimeout
        )
    }

    /// True for the per-role cancellation variants
    pub fn is_canceled(&self) -> bool {
        matches!(
            self,
            PortError::ControlCanceled
                | PortError::ReadCanceled
                | PortError::WriteCanceled
                | PortError::MessageInCanceled
        )
    }

    /// True when the error is recovered in place (abort sequence or
    /// reconnect) and reported as a non-fatal notification
    pub fn is_handled(&self) -> bool {
        !matches!(self, PortError::Unhandled(_))
    }
}
