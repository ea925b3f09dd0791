//! USBTMC bulk transfer framing
//!
//! Every bulk transfer starts with a 12-byte header:
//!
//! ```text
//! [MsgID: u8][bTag: u8][bTagInverse: u8][reserved: u8][message specific: 8 bytes]
//! ```
//!
//! For DEV_DEP_MSG_OUT the message specific part is the TransferSize (u32 LE),
//! bmTransferAttributes (bit 0 = EOM) and three reserved bytes, followed by
//! the payload padded to a 4-byte boundary. For REQUEST_DEV_DEP_MSG_IN only
//! the requested TransferSize is meaningful. See Table 1 and Tables 3/4/9 in
//! USBTMC Revision 1.0.

use crate::btag::btag_inverse;
use crate::error::{ProtocolError, Result};
use byteorder::{ByteOrder, LittleEndian};

/// Size of the fixed USBTMC bulk header
pub const BULK_HEADER_SIZE: usize = 12;

/// USBTMC bulk MsgID values (USBTMC table 2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgId {
    /// Device dependent command message (host to device)
    DevDepMsgOut = 1,
    /// Device dependent response message; REQUEST_DEV_DEP_MSG_IN when sent
    /// by the host
    DevDepMsgIn = 2,
    /// Vendor specific command message
    VendorSpecificOut = 126,
    /// Vendor specific response message
    VendorSpecificIn = 127,
}

impl MsgId {
    /// Map a wire byte to a supported MsgID
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            1 => Ok(MsgId::DevDepMsgOut),
            2 => Ok(MsgId::DevDepMsgIn),
            126 => Ok(MsgId::VendorSpecificOut),
            127 => Ok(MsgId::VendorSpecificIn),
            other => Err(ProtocolError::UnsupportedMsgId(other)),
        }
    }
}

/// Write the common first four header bytes
fn write_header_prefix(buf: &mut [u8], msg_id: MsgId, btag: u8) {
    buf[0] = msg_id as u8;
    buf[1] = btag;
    buf[2] = btag_inverse(btag);
    buf[3] = 0;
}

/// Encode a DEV_DEP_MSG_OUT frame carrying a command payload
///
/// The returned buffer is header + payload, zero padded so its total length
/// is a multiple of 4 as the specification requires.
pub fn encode_dev_dep_msg_out(btag: u8, data: &[u8], eom: bool) -> Vec<u8> {
    let padded_len = (BULK_HEADER_SIZE + data.len() + 3) & !3;
    let mut buf = vec![0u8; padded_len];
    write_header_prefix(&mut buf, MsgId::DevDepMsgOut, btag);
    LittleEndian::write_u32(&mut buf[4..8], data.len() as u32);
    if eom {
        buf[8] = 0x01;
    }
    buf[BULK_HEADER_SIZE..BULK_HEADER_SIZE + data.len()].copy_from_slice(data);
    buf
}

/// Encode a REQUEST_DEV_DEP_MSG_IN frame asking the device for up to
/// `requested_size` response bytes
pub fn encode_request_dev_dep_msg_in(btag: u8, requested_size: u32) -> Vec<u8> {
    let mut buf = vec![0u8; BULK_HEADER_SIZE];
    write_header_prefix(&mut buf, MsgId::DevDepMsgIn, btag);
    LittleEndian::write_u32(&mut buf[4..8], requested_size);
    buf
}

/// A decoded inbound bulk message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkInMessage {
    pub msg_id: MsgId,
    pub btag: u8,
    /// End-of-message flag (bmTransferAttributes bit 0)
    pub eom: bool,
    /// Payload bytes, exactly TransferSize long
    pub data: Vec<u8>,
}

/// Decode and validate a DEV_DEP_MSG_IN reply
///
/// Checks, in order: minimum length, bTag/bTagInverse consistency, MsgID
/// membership, and that the declared TransferSize fits the bytes present.
/// Any violation leaves the bulk-IN pipe in an undefined state; the caller
/// must run the abort-bulk-in sequence, never drop the frame silently.
pub fn decode_dev_dep_msg_in(frame: &[u8]) -> Result<BulkInMessage> {
    if frame.len() < BULK_HEADER_SIZE {
        return Err(ProtocolError::FrameTooShort {
            expected: BULK_HEADER_SIZE,
            actual: frame.len(),
        });
    }
    let btag = frame[1];
    if frame[2] != btag_inverse(btag) {
        return Err(ProtocolError::BTagMismatch {
            btag,
            btag_inverse: frame[2],
        });
    }
    let msg_id = MsgId::from_byte(frame[0])?;
    let declared = LittleEndian::read_u32(&frame[4..8]) as usize;
    let available = frame.len() - BULK_HEADER_SIZE;
    if declared > available {
        return Err(ProtocolError::TruncatedPayload {
            declared,
            available,
        });
    }
    Ok(BulkInMessage {
        msg_id,
        btag,
        eom: frame[8] & 0x01 != 0,
        data: frame[BULK_HEADER_SIZE..BULK_HEADER_SIZE + declared].to_vec(),
    })
}
