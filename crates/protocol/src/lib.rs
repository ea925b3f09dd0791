//! USBTMC wire format for rust-usbtmc
//!
//! This crate defines the USB Test and Measurement Class wire format used by
//! the port engine: the 8-byte control setup packet, the 12-byte bulk
//! transfer header, bTag generation, and the abort-protocol control requests
//! with their status responses.
//!
//! References:
//! - USBTMC Revision 1.0, <http://www.usb.org/developers/devclass_docs>
//! - USB 2.0 specification, section 9.3 (control setup packet)
//!
//! # Example
//!
//! ```
//! use protocol::{BTagGenerator, encode_dev_dep_msg_out, decode_dev_dep_msg_in};
//!
//! let mut btags = BTagGenerator::new();
//! let btag = btags.next();
//! let frame = encode_dev_dep_msg_out(btag, b"*IDN?\n", true);
//! assert_eq!(frame.len() % 4, 0);
//! ```

pub mod abort;
pub mod btag;
pub mod bulk;
pub mod control;
pub mod error;

pub use abort::{
    AbortRequest, CheckAbortStatus, UsbtmcStatus, CHECK_ABORT_BULK_IN_STATUS,
    CHECK_ABORT_BULK_OUT_STATUS, INITIATE_ABORT_BULK_IN, INITIATE_ABORT_BULK_OUT,
};
pub use btag::BTagGenerator;
pub use bulk::{
    decode_dev_dep_msg_in, encode_dev_dep_msg_out, encode_request_dev_dep_msg_in, BulkInMessage,
    MsgId, BULK_HEADER_SIZE,
};
pub use control::{
    ControlSetup, Direction, Recipient, RequestKind, FEATURE_ENDPOINT_HALT, REQUEST_CLEAR_FEATURE,
    SETUP_PACKET_SIZE,
};
pub use error::{ProtocolError, Result};

/// USBTMC interface class code
pub const USBTMC_CLASS: u8 = 0xFE;
/// USBTMC interface subclass code
pub const USBTMC_SUBCLASS: u8 = 0x03;
