//! Channel bridge between the application and the port worker thread
//!
//! The port worker owns every frame, pool and transfer; the application
//! talks to it exclusively through these bounded channels. Commands flow in,
//! notifications and decoded responses flow out. The worker side never
//! blocks on the bridge; the application side may use either the blocking
//! or the async operations.

use crate::usb_types::PortError;
use async_channel::{bounded, Receiver, Sender};

/// Commands from the application to the port worker
#[derive(Debug, Clone)]
pub enum PortCommand {
    /// Send a device dependent command message, no reply expected
    SendCommand {
        /// Message payload
        data: Vec<u8>,
        /// End-of-message flag on the final bulk frame
        eom: bool,
    },

    /// Send a command and immediately request the device's reply
    SendQuery {
        /// Message payload
        data: Vec<u8>,
    },

    /// Request a reply for a previously sent command
    SendReadRequest,

    /// Stop the worker; pending transfers are cancelled first
    Stop,
}

/// Notifications from the port worker to the application
///
/// Replies are asynchronous: a response may be preceded by any number of
/// recovery notifications, and there is no 1:1 pairing between a sent
/// request and the next notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortNotification {
    /// Port is open and the pipes are usable
    Ready,

    /// An abort sequence or reconnect is in progress on the port
    Recovering,

    /// An error occurred and was recovered in place
    HandledError(PortError),

    /// Device is gone; the worker is attempting to reconnect
    Disconnected,

    /// Fatal error; the worker has stopped
    UnhandledError(PortError),

    /// Worker exited after a stop request
    Stopped,
}

/// A decoded device reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// bTag of the request this reply answers
    pub btag: u8,
    /// End-of-message flag from the final bulk-IN frame
    pub eom: bool,
    /// Message payload with framing stripped
    pub data: Vec<u8>,
}

/// Application-side handle
#[derive(Clone)]
pub struct PortBridge {
    cmd_tx: Sender<PortCommand>,
    note_rx: Receiver<PortNotification>,
    resp_rx: Receiver<Response>,
}

impl PortBridge {
    /// Send a command to the worker (blocking)
    pub fn send_command(&self, cmd: PortCommand) -> crate::Result<()> {
        self.cmd_tx
            .send_blocking(cmd)
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Send a command to the worker (async)
    pub async fn send_command_async(&self, cmd: PortCommand) -> crate::Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Wait for the next notification (blocking)
    pub fn recv_notification(&self) -> crate::Result<PortNotification> {
        self.note_rx
            .recv_blocking()
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Next notification if one is ready
    pub fn try_recv_notification(&self) -> Option<PortNotification> {
        self.note_rx.try_recv().ok()
    }

    /// Wait for the next decoded response (blocking)
    pub fn recv_response(&self) -> crate::Result<Response> {
        self.resp_rx
            .recv_blocking()
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Next response if one is ready
    pub fn try_recv_response(&self) -> Option<Response> {
        self.resp_rx.try_recv().ok()
    }
}

/// Worker-side handle
pub struct PortWorkerLink {
    cmd_rx: Receiver<PortCommand>,
    note_tx: Sender<PortNotification>,
    resp_tx: Sender<Response>,
}

impl PortWorkerLink {
    /// Next command without blocking; the worker polls this between event
    /// pumps
    pub fn try_recv_command(&self) -> Option<PortCommand> {
        self.cmd_rx.try_recv().ok()
    }

    /// Publish a notification; a full or closed channel is not fatal for
    /// the worker
    pub fn notify(&self, note: PortNotification) {
        let _ = self.note_tx.try_send(note);
    }

    /// Deliver a decoded response to the application without blocking
    ///
    /// The worker must never park behind an application that stopped
    /// draining replies; a full or closed channel is reported to the
    /// caller and the response is dropped.
    pub fn deliver_response(&self, response: Response) -> crate::Result<()> {
        self.resp_tx
            .try_send(response)
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Create the channel bridge between application and port worker
///
/// Returns (PortBridge for the application, PortWorkerLink for the worker).
pub fn create_port_bridge() -> (PortBridge, PortWorkerLink) {
    let (cmd_tx, cmd_rx) = bounded(64);
    let (note_tx, note_rx) = bounded(256);
    let (resp_tx, resp_rx) = bounded(64);

    (
        PortBridge {
            cmd_tx,
            note_rx,
            resp_rx,
        },
        PortWorkerLink {
            cmd_rx,
            note_tx,
            resp_tx,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_roundtrip() {
        let (bridge, link) = create_port_bridge();

        bridge
            .send_command(PortCommand::SendCommand {
                data: b"*RST\n".to_vec(),
                eom: true,
            })
            .unwrap();

        match link.try_recv_command() {
            Some(PortCommand::SendCommand { data, eom }) => {
                assert_eq!(data, b"*RST\n");
                assert!(eom);
            }
            other => panic!("unexpected command: {:?}", other),
        }
        assert!(link.try_recv_command().is_none());
    }

    #[test]
    fn test_notification_and_response_flow() {
        let (bridge, link) = create_port_bridge();

        link.notify(PortNotification::Ready);
        link.deliver_response(Response {
            btag: 3,
            eom: true,
            data: b"1.0\n".to_vec(),
        })
        .unwrap();

        assert_eq!(bridge.recv_notification().unwrap(), PortNotification::Ready);
        let resp = bridge.recv_response().unwrap();
        assert_eq!(resp.btag, 3);
        assert_eq!(resp.data, b"1.0\n");
    }

    #[test]
    fn test_deliver_response_errors_instead_of_blocking_when_full() {
        let (_bridge, link) = create_port_bridge();
        let response = Response {
            btag: 1,
            eom: true,
            data: b"1\n".to_vec(),
        };
        // Fill the bounded response channel without anyone draining it
        while link.deliver_response(response.clone()).is_ok() {}
        // The call above returned instead of parking the worker
        assert!(link.deliver_response(response).is_err());
    }

    #[test]
    fn test_notify_never_blocks_when_app_is_gone() {
        let (bridge, link) = create_port_bridge();
        drop(bridge);
        // Must not panic or block
        link.notify(PortNotification::Stopped);
    }
}
