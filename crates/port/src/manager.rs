//! Application-facing port handle
//!
//! `UsbtmcPort` opens a device from a selection string, spawns the worker
//! thread and wraps the channel bridge in a small blocking API. All USB
//! work happens on the worker; these calls only move messages across the
//! bridge.

use crate::address::DeviceAddress;
use crate::backend::UsbHost;
use crate::config::PortConfig;
use crate::libusb::LibusbHost;
use crate::worker::spawn_port_worker;
use common::{create_port_bridge, PortBridge, PortCommand, PortError, PortNotification, Response};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

pub struct UsbtmcPort {
    bridge: PortBridge,
    handle: Option<thread::JoinHandle<Result<(), PortError>>>,
}

impl UsbtmcPort {
    /// Open the device named by a `VID=..:PID=..` selection string
    pub fn open(selection: &str, config: PortConfig) -> Result<Self, PortError> {
        let address = DeviceAddress::parse(selection)?;
        let host = LibusbHost::open(&address, &config)?;
        Ok(Self::with_host(host, config))
    }

    /// Spawn the worker over an already constructed backend
    pub fn with_host<H: UsbHost + Send + 'static>(host: H, config: PortConfig) -> Self {
        let (bridge, link) = create_port_bridge();
        let handle = spawn_port_worker(host, link, config);
        Self {
            bridge,
            handle: Some(handle),
        }
    }

    /// Send a device dependent command without expecting a reply
    pub fn send_command(&self, data: &[u8], eom: bool) -> Result<(), PortError> {
        self.bridge
            .send_command(PortCommand::SendCommand {
                data: data.to_vec(),
                eom,
            })
            .map_err(|e| PortError::Unhandled(e.to_string()))
    }

    /// Send a command and ask the device for its reply
    pub fn send_query(&self, data: &[u8]) -> Result<(), PortError> {
        self.bridge
            .send_command(PortCommand::SendQuery {
                data: data.to_vec(),
            })
            .map_err(|e| PortError::Unhandled(e.to_string()))
    }

    /// Ask for the reply of a previously sent command
    pub fn send_read_request(&self) -> Result<(), PortError> {
        self.bridge
            .send_command(PortCommand::SendReadRequest)
            .map_err(|e| PortError::Unhandled(e.to_string()))
    }

    /// Wait for the next decoded reply frame
    ///
    /// Handled-error notifications arriving meanwhile are logged and
    /// skipped; a fatal notification ends the wait.
    pub fn read_response(&self, timeout: Duration) -> Result<Response, PortError> {
        let deadline = Instant::now() + timeout;
        loop {
            while let Some(note) = self.bridge.try_recv_notification() {
                match note {
                    PortNotification::UnhandledError(e) => return Err(e),
                    PortNotification::Stopped => {
                        return Err(PortError::Unhandled("port worker stopped".into()))
                    }
                    PortNotification::HandledError(e) => {
                        debug!(error = %e, "port recovered while waiting for a reply")
                    }
                    _ => {}
                }
            }
            if let Some(response) = self.bridge.try_recv_response() {
                return Ok(response);
            }
            if Instant::now() >= deadline {
                return Err(PortError::ReadTimeout);
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Send a query and collect the reply until its end-of-message frame
    pub fn query(&self, data: &[u8], timeout: Duration) -> Result<Vec<u8>, PortError> {
        self.send_query(data)?;
        let mut out = Vec::new();
        loop {
            let response = self.read_response(timeout)?;
            out.extend_from_slice(&response.data);
            if response.eom {
                return Ok(out);
            }
        }
    }

    /// Block until the worker reports the port ready
    pub fn wait_ready(&self, timeout: Duration) -> Result<(), PortError> {
        let deadline = Instant::now() + timeout;
        loop {
            while let Some(note) = self.bridge.try_recv_notification() {
                match note {
                    PortNotification::Ready => return Ok(()),
                    PortNotification::UnhandledError(e) => return Err(e),
                    PortNotification::Stopped => {
                        return Err(PortError::Unhandled("port worker stopped".into()))
                    }
                    _ => {}
                }
            }
            if Instant::now() >= deadline {
                return Err(PortError::Unhandled("port never became ready".into()));
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Next notification, if one arrived
    pub fn try_recv_notification(&self) -> Option<PortNotification> {
        self.bridge.try_recv_notification()
    }

    /// Stop the worker and wait for it to exit
    pub fn close(mut self) -> Result<(), PortError> {
        let _ = self.bridge.send_command(PortCommand::Stop);
        match self.handle.take() {
            Some(handle) => match handle.join() {
                Ok(result) => result,
                Err(_) => Err(PortError::Unhandled("port worker panicked".into())),
            },
            None => Ok(()),
        }
    }
}

impl Drop for UsbtmcPort {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.bridge.send_command(PortCommand::Stop);
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{device_reply, ScriptedHost, ScriptedReply};
    use common::TransferRole;

    fn fast_config() -> PortConfig {
        let mut config = PortConfig::default();
        config.event_wait_ms = 1;
        config.abort_retry_delay_ms = 0;
        config
    }

    #[test]
    fn test_query_through_the_worker_thread() {
        let mut host = ScriptedHost::new();
        host.script(
            TransferRole::BulkIn,
            ScriptedReply::Data(device_reply(2, b"ok\n", true)),
        );
        let port = UsbtmcPort::with_host(host, fast_config());

        port.wait_ready(Duration::from_secs(5)).unwrap();
        let reply = port.query(b"*IDN?\n", Duration::from_secs(5)).unwrap();
        assert_eq!(reply, b"ok\n");

        port.close().unwrap();
    }

    #[test]
    fn test_close_is_clean_without_traffic() {
        let port = UsbtmcPort::with_host(ScriptedHost::new(), fast_config());
        port.wait_ready(Duration::from_secs(5)).unwrap();
        port.close().unwrap();
    }
}
