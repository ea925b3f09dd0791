//! USBTMC abort protocol control requests
//!
//! The abort protocol recovers a stuck bulk pipe without resetting the whole
//! device. It is a strict sequence of class control requests addressed to
//! the bulk endpoint (USBTMC Revision 1.0, section 4.2.1):
//!
//! - INITIATE_ABORT_BULK_OUT (1) / INITIATE_ABORT_BULK_IN (3): 2-byte
//!   response, `[USBTMC_status, bTag]`
//! - CHECK_ABORT_BULK_OUT_STATUS (2) / CHECK_ABORT_BULK_IN_STATUS (4):
//!   8-byte response, `[USBTMC_status, bmAbortBulkIn, reserved x2, NBYTES x4]`

use crate::control::ControlSetup;
use crate::error::{ProtocolError, Result};

/// bRequest: abort the current Bulk-OUT transfer
pub const INITIATE_ABORT_BULK_OUT: u8 = 1;
/// bRequest: query the state of a Bulk-OUT abort
pub const CHECK_ABORT_BULK_OUT_STATUS: u8 = 2;
/// bRequest: abort the current Bulk-IN transfer
pub const INITIATE_ABORT_BULK_IN: u8 = 3;
/// bRequest: query the state of a Bulk-IN abort
pub const CHECK_ABORT_BULK_IN_STATUS: u8 = 4;

/// Response length of the INITIATE_* requests
pub const INITIATE_RESPONSE_SIZE: usize = 2;
/// Response length of the CHECK_*_STATUS requests
pub const CHECK_RESPONSE_SIZE: usize = 8;

/// USBTMC_status values (USBTMC table 16)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbtmcStatus {
    /// Request completed
    Success,
    /// Request received, processing not finished
    Pending,
    /// Failure for an unspecified reason
    Failed,
    /// INITIATE_ABORT received but the named transfer is not in progress
    TransferNotInProgress,
    /// CHECK_STATUS without a matching INITIATE
    SplitNotInProgress,
    /// INITIATE received while another one is being processed
    SplitInProgress,
}

impl UsbtmcStatus {
    /// Map a wire status byte
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0x01 => Ok(UsbtmcStatus::Success),
            0x02 => Ok(UsbtmcStatus::Pending),
            0x80 => Ok(UsbtmcStatus::Failed),
            0x81 => Ok(UsbtmcStatus::TransferNotInProgress),
            0x82 => Ok(UsbtmcStatus::SplitNotInProgress),
            0x83 => Ok(UsbtmcStatus::SplitInProgress),
            other => Err(ProtocolError::UnknownStatus(other)),
        }
    }
}

/// Builders for the four abort control requests
pub struct AbortRequest;

impl AbortRequest {
    /// INITIATE_ABORT_BULK_IN for the transfer identified by `btag` on the
    /// given bulk-IN endpoint
    pub fn initiate_bulk_in(btag: u8, endpoint: u8) -> ControlSetup {
        ControlSetup::class_endpoint_in(
            INITIATE_ABORT_BULK_IN,
            u16::from(btag),
            endpoint,
            INITIATE_RESPONSE_SIZE as u16,
        )
    }

    /// CHECK_ABORT_BULK_IN_STATUS on the given bulk-IN endpoint
    pub fn check_bulk_in_status(endpoint: u8) -> ControlSetup {
        ControlSetup::class_endpoint_in(
            CHECK_ABORT_BULK_IN_STATUS,
            0,
            endpoint,
            CHECK_RESPONSE_SIZE as u16,
        )
    }

    /// INITIATE_ABORT_BULK_OUT for the transfer identified by `btag` on the
    /// given bulk-OUT endpoint
    pub fn initiate_bulk_out(btag: u8, endpoint: u8) -> ControlSetup {
        ControlSetup::class_endpoint_in(
            INITIATE_ABORT_BULK_OUT,
            u16::from(btag),
            endpoint,
            INITIATE_RESPONSE_SIZE as u16,
        )
    }

    /// CHECK_ABORT_BULK_OUT_STATUS on the given bulk-OUT endpoint
    pub fn check_bulk_out_status(endpoint: u8) -> ControlSetup {
        ControlSetup::class_endpoint_in(
            CHECK_ABORT_BULK_OUT_STATUS,
            0,
            endpoint,
            CHECK_RESPONSE_SIZE as u16,
        )
    }

    /// Parse an INITIATE_ABORT_BULK_* 2-byte response
    pub fn parse_initiate_response(data: &[u8]) -> Result<UsbtmcStatus> {
        if data.len() != INITIATE_RESPONSE_SIZE {
            return Err(ProtocolError::UnexpectedResponseSize {
                expected: INITIATE_RESPONSE_SIZE,
                actual: data.len(),
            });
        }
        UsbtmcStatus::from_byte(data[0])
    }

    /// Parse a CHECK_ABORT_BULK_*_STATUS 8-byte response
    pub fn parse_check_response(data: &[u8]) -> Result<CheckAbortStatus> {
        if data.len() != CHECK_RESPONSE_SIZE {
            return Err(ProtocolError::UnexpectedResponseSize {
                expected: CHECK_RESPONSE_SIZE,
                actual: data.len(),
            });
        }
        Ok(CheckAbortStatus {
            status: UsbtmcStatus::from_byte(data[0])?,
            // bmAbortBulkIn.D0: device FIFO still holds data for the host
            fifo_has_data: data[1] & 0x01 != 0,
        })
    }
}

/// Parsed CHECK_ABORT_BULK_*_STATUS response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckAbortStatus {
    pub status: UsbtmcStatus,
    /// Only meaningful for bulk-IN: the device FIFO still has data and the
    /// host must keep draining before re-checking.
    pub fifo_has_data: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initiate_bulk_in_setup() {
        let setup = AbortRequest::initiate_bulk_in(42, 0x81);
        let bytes = setup.encode();
        assert_eq!(bytes, [0xA2, 3, 42, 0, 0x81, 0, 2, 0]);
    }

    #[test]
    fn test_check_bulk_in_setup() {
        let setup = AbortRequest::check_bulk_in_status(0x81);
        let bytes = setup.encode();
        assert_eq!(bytes, [0xA2, 4, 0, 0, 0x81, 0, 8, 0]);
    }

    #[test]
    fn test_initiate_bulk_out_setup() {
        let setup = AbortRequest::initiate_bulk_out(7, 0x02);
        let bytes = setup.encode();
        assert_eq!(bytes, [0xA2, 1, 7, 0, 0x02, 0, 2, 0]);
    }

    #[test]
    fn test_parse_initiate_response() {
        assert_eq!(
            AbortRequest::parse_initiate_response(&[0x01, 42]).unwrap(),
            UsbtmcStatus::Success
        );
        assert_eq!(
            AbortRequest::parse_initiate_response(&[0x81, 42]).unwrap(),
            UsbtmcStatus::TransferNotInProgress
        );
        assert_eq!(
            AbortRequest::parse_initiate_response(&[0x80, 42]).unwrap(),
            UsbtmcStatus::Failed
        );
    }

    #[test]
    fn test_parse_initiate_response_wrong_size() {
        let err = AbortRequest::parse_initiate_response(&[0x01]).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::UnexpectedResponseSize {
                expected: 2,
                actual: 1
            }
        );
    }

    #[test]
    fn test_parse_check_response() {
        let parsed =
            AbortRequest::parse_check_response(&[0x02, 0x01, 0, 0, 0, 0, 0, 0]).unwrap();
        assert_eq!(parsed.status, UsbtmcStatus::Pending);
        assert!(parsed.fifo_has_data);

        let parsed =
            AbortRequest::parse_check_response(&[0x01, 0x00, 0, 0, 0, 0, 0, 0]).unwrap();
        assert_eq!(parsed.status, UsbtmcStatus::Success);
        assert!(!parsed.fifo_has_data);
    }

    #[test]
    fn test_parse_check_response_unknown_status() {
        let err = AbortRequest::parse_check_response(&[0x7F, 0, 0, 0, 0, 0, 0, 0]).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownStatus(0x7F));
    }
}
