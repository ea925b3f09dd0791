//! Common utilities for rust-usbtmc
//!
//! This crate provides the pieces shared between the port engine and the
//! application: the transfer role / port error taxonomy, the channel bridge
//! used to talk to the port worker thread, and logging setup.

pub mod channel;
pub mod error;
pub mod logging;
pub mod usb_types;

pub use channel::{
    create_port_bridge, PortBridge, PortCommand, PortNotification, PortWorkerLink, Response,
};
pub use error::{Error, Result};
pub use logging::setup_logging;
pub use usb_types::{PortError, TransferRole};
