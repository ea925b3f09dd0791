//! USB control setup packet
//!
//! Every control transfer starts with an 8-byte setup packet:
//!
//! ```text
//! [bmRequestType: u8][bRequest: u8][wValue: u16 LE][wIndex: u16 LE][wLength: u16 LE]
//! ```
//!
//! bmRequestType packs the transfer direction (bit 7), the request kind
//! (bits 6..5) and the recipient (bits 4..0). See Table 9-2 in the USB 2.0
//! specification, section 9.3.

use crate::error::{ProtocolError, Result};
use byteorder::{ByteOrder, LittleEndian};

/// Size of the setup packet that precedes every control transfer
pub const SETUP_PACKET_SIZE: usize = 8;

/// Transfer direction, bmRequestType bit D7
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Host to device
    Out = 0,
    /// Device to host
    In = 1,
}

/// Request kind, bmRequestType bits D6..D5
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Standard = 0,
    Class = 1,
    Vendor = 2,
}

/// Request recipient, bmRequestType bits D4..D0
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    Device = 0,
    Interface = 1,
    Endpoint = 2,
    Other = 3,
}

/// Standard request code CLEAR_FEATURE (USB 2.0 section 9.4.1)
pub const REQUEST_CLEAR_FEATURE: u8 = 1;
/// Feature selector ENDPOINT_HALT (USB 2.0 table 9-6)
pub const FEATURE_ENDPOINT_HALT: u16 = 0;

/// Decomposed control setup packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlSetup {
    pub direction: Direction,
    pub kind: RequestKind,
    pub recipient: Recipient,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl ControlSetup {
    /// A class request addressed to an endpoint, as used by the USBTMC
    /// abort protocol.
    pub fn class_endpoint_in(request: u8, value: u16, endpoint: u8, length: u16) -> Self {
        Self {
            direction: Direction::In,
            kind: RequestKind::Class,
            recipient: Recipient::Endpoint,
            request,
            value,
            index: u16::from(endpoint),
            length,
        }
    }

    /// CLEAR_FEATURE(ENDPOINT_HALT) for the given endpoint address
    pub fn clear_endpoint_halt(endpoint: u8) -> Self {
        Self {
            direction: Direction::Out,
            kind: RequestKind::Standard,
            recipient: Recipient::Endpoint,
            request: REQUEST_CLEAR_FEATURE,
            value: FEATURE_ENDPOINT_HALT,
            index: u16::from(endpoint),
            length: 0,
        }
    }

    /// Packed bmRequestType byte
    pub fn request_type(&self) -> u8 {
        ((self.direction as u8) << 7) | ((self.kind as u8) << 5) | (self.recipient as u8)
    }

    /// Encode into the 8-byte wire form
    pub fn encode(&self) -> [u8; SETUP_PACKET_SIZE] {
        let mut buf = [0u8; SETUP_PACKET_SIZE];
        buf[0] = self.request_type();
        buf[1] = self.request;
        LittleEndian::write_u16(&mut buf[2..4], self.value);
        LittleEndian::write_u16(&mut buf[4..6], self.index);
        LittleEndian::write_u16(&mut buf[6..8], self.length);
        buf
    }

    /// Decode from the 8-byte wire form
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < SETUP_PACKET_SIZE {
            return Err(ProtocolError::FrameTooShort {
                expected: SETUP_PACKET_SIZE,
                actual: buf.len(),
            });
        }
        let bm = buf[0];
        let direction = if bm & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        };
        let kind = match (bm >> 5) & 0x03 {
            0 => RequestKind::Standard,
            1 => RequestKind::Class,
            _ => RequestKind::Vendor,
        };
        let recipient = match bm & 0x1F {
            0 => Recipient::Device,
            1 => Recipient::Interface,
            2 => Recipient::Endpoint,
            _ => Recipient::Other,
        };
        Ok(Self {
            direction,
            kind,
            recipient,
            request: buf[1],
            value: LittleEndian::read_u16(&buf[2..4]),
            index: LittleEndian::read_u16(&buf[4..6]),
            length: LittleEndian::read_u16(&buf[6..8]),
        })
    }
}
