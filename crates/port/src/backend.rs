//! Native USB backend abstraction
//!
//! The transfer engine drives any [`UsbHost`]. The production backend is
//! [`crate::LibusbHost`]; tests drive the engine with a scripted host. A
//! host owns one native transfer per role, reports completions through
//! [`Completion`] records drained by `handle_events`, and maps its native
//! status codes to [`HostStatus`] so classification into the error
//! taxonomy happens in exactly one place.

use common::{PortError, TransferRole};
use protocol::ControlSetup;
use std::time::Duration;

/// Native completion status of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostStatus {
    Completed,
    TimedOut,
    Cancelled,
    Stall,
    NoDevice,
    Error,
    Overflow,
    ShortPacketNotOk,
}

/// One finished transfer, as drained from the host
#[derive(Debug, Clone)]
pub struct Completion {
    pub role: TransferRole,
    pub status: HostStatus,
    /// Received bytes for IN transfers that completed
    pub data: Vec<u8>,
    /// Bytes actually transferred, valid for OUT completions too
    pub actual_length: usize,
}

/// Kind of the data endpoints behind the bulk roles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Bulk,
    Interrupt,
}

/// One endpoint of the claimed interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointInfo {
    /// Endpoint address including the direction bit
    pub address: u8,
    pub max_packet_size: usize,
    pub kind: TransferKind,
}

/// A transfer submission, one variant per role
#[derive(Debug)]
pub enum SubmitRequest<'a> {
    Control {
        setup: ControlSetup,
        /// Payload for OUT requests; empty for IN requests
        data: &'a [u8],
        timeout: Duration,
    },
    BulkOut {
        data: &'a [u8],
        timeout: Duration,
    },
    BulkIn {
        max_len: usize,
        timeout: Duration,
    },
    MessageIn {
        max_len: usize,
        timeout: Duration,
    },
}

/// Native USB layer as seen by the transfer engine
///
/// Implementations own the device handle, the per-role native transfers and
/// their buffers. All methods are called from the worker thread only.
pub trait UsbHost {
    /// Submit the transfer for `role`; the caller guarantees the role is
    /// not already in flight
    fn submit(&mut self, role: TransferRole, request: SubmitRequest<'_>) -> Result<(), PortError>;

    /// Ask the native layer to cancel the in-flight transfer for `role`
    ///
    /// Completion is reported later through `handle_events`; a transfer
    /// that already finished is not an error.
    fn cancel(&mut self, role: TransferRole) -> Result<(), PortError>;

    /// Pump native events for at most `timeout`, appending finished
    /// transfers to `completions`
    fn handle_events(
        &mut self,
        timeout: Duration,
        completions: &mut Vec<Completion>,
    ) -> Result<(), PortError>;

    /// Close and reopen the device after a disconnect
    fn reconnect(&mut self, delay: Duration) -> Result<(), PortError>;

    /// Endpoint behind `role`, if the interface has one
    fn endpoint(&self, role: TransferRole) -> Option<EndpointInfo>;
}

/// Map a native completion status to the error taxonomy
///
/// `None` means the transfer completed. Disconnection wins over every
/// other status; cancellation is checked before timeout because a
/// cancelled transfer may also carry an expired deadline.
pub fn classify_status(role: TransferRole, status: HostStatus) -> Option<PortError> {
    match status {
        HostStatus::Completed => None,
        HostStatus::NoDevice => Some(PortError::Disconnected),
        HostStatus::Cancelled => Some(PortError::canceled(role)),
        HostStatus::TimedOut => Some(PortError::timeout(role)),
        HostStatus::Stall => Some(PortError::Stall),
        HostStatus::Error => Some(PortError::TransferError),
        HostStatus::Overflow => Some(PortError::Overflow),
        HostStatus::ShortPacketNotOk => Some(PortError::ShortPacketNotPermitted),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completed_is_not_an_error() {
        assert_eq!(classify_status(TransferRole::BulkIn, HostStatus::Completed), None);
    }

    #[test]
    fn test_role_specific_variants() {
        assert_eq!(
            classify_status(TransferRole::BulkIn, HostStatus::TimedOut),
            Some(PortError::ReadTimeout)
        );
        assert_eq!(
            classify_status(TransferRole::BulkOut, HostStatus::Cancelled),
            Some(PortError::WriteCanceled)
        );
        assert_eq!(
            classify_status(TransferRole::Control, HostStatus::TimedOut),
            Some(PortError::ControlTimeout)
        );
        assert_eq!(
            classify_status(TransferRole::MessageIn, HostStatus::Cancelled),
            Some(PortError::MessageInCanceled)
        );
    }

    #[test]
    fn test_role_independent_variants() {
        for role in [
            TransferRole::Control,
            TransferRole::BulkIn,
            TransferRole::BulkOut,
            TransferRole::MessageIn,
        ] {
            assert_eq!(
                classify_status(role, HostStatus::NoDevice),
                Some(PortError::Disconnected)
            );
            assert_eq!(classify_status(role, HostStatus::Stall), Some(PortError::Stall));
            assert_eq!(
                classify_status(role, HostStatus::Overflow),
                Some(PortError::Overflow)
            );
        }
    }
}
