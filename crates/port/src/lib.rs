//! USBTMC port engine
//!
//! This crate drives a USBTMC device over a USB interface: it owns the
//! per-endpoint asynchronous transfer lifecycle, the frame pools and queues
//! that hand buffers between the I/O driver and the protocol layer, the
//! driving loop that multiplexes control/read/write/message-in progress, and
//! the USBTMC abort-bulk-in / abort-bulk-out recovery sequences.
//!
//! The native USB layer is abstracted behind the [`UsbHost`] trait;
//! [`LibusbHost`] is the libusb-1.0 implementation built on `rusb`. The
//! application talks to the worker through the channel bridge from the
//! `common` crate, via the [`UsbtmcPort`] facade.

pub mod abort;
pub mod address;
pub mod backend;
pub mod config;
pub mod engine;
pub mod frame;
pub mod libusb;
pub mod manager;
pub mod pool;
pub mod worker;

#[cfg(test)]
pub(crate) mod mock;

pub use address::DeviceAddress;
pub use backend::{classify_status, Completion, EndpointInfo, HostStatus, SubmitRequest, TransferKind, UsbHost};
pub use common::{PortError, TransferRole};
pub use config::PortConfig;
pub use engine::{SubmitResult, TransferEngine, TransferOutcome};
pub use frame::{Frame, UsbtmcMeta};
pub use libusb::LibusbHost;
pub use manager::UsbtmcPort;
pub use pool::{FramePool, Pools, QueueSet};
pub use worker::{spawn_port_worker, PortWorker};
