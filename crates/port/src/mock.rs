//! Scripted host for driving the engine and worker in tests
//!
//! Each role has a script of replies consumed in submission order. A
//! submitted transfer either resolves into a completion delivered at the
//! next `handle_events`, or is held in flight until cancelled. Unscripted
//! writes complete fully; unscripted reads are held, which matches a
//! device with nothing to send.

use crate::backend::{Completion, EndpointInfo, HostStatus, SubmitRequest, TransferKind, UsbHost};
use common::{PortError, TransferRole};
use protocol::ControlSetup;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

/// Encoded DEV_DEP_MSG_IN frame as a device would send it
pub fn device_reply(btag: u8, data: &[u8], eom: bool) -> Vec<u8> {
    let mut frame = vec![0x02, btag, !btag, 0x00];
    frame.extend_from_slice(&(data.len() as u32).to_le_bytes());
    frame.push(if eom { 0x01 } else { 0x00 });
    frame.extend_from_slice(&[0, 0, 0]);
    frame.extend_from_slice(data);
    while frame.len() % 4 != 0 {
        frame.push(0);
    }
    frame
}

#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// Complete with the given received bytes
    Data(Vec<u8>),
    /// Complete an OUT transfer with this many bytes sent
    Sent(usize),
    /// Complete with a non-success status
    Status(HostStatus),
    /// Stay in flight until cancelled
    Hold,
}

#[derive(Default)]
pub struct ScriptedHost {
    scripts: HashMap<TransferRole, VecDeque<ScriptedReply>>,
    ready: Vec<Completion>,
    held: HashSet<TransferRole>,
    submit_counts: HashMap<TransferRole, usize>,
    cancel_counts: HashMap<TransferRole, usize>,
    control_setups: Vec<ControlSetup>,
    writes: Vec<Vec<u8>>,
    reconnect_results: VecDeque<Result<(), PortError>>,
    reconnect_calls: usize,
    message_in_endpoint: bool,
}

impl ScriptedHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_message_in(mut self) -> Self {
        self.message_in_endpoint = true;
        self
    }

    /// Append a reply to the script of `role`
    pub fn script(&mut self, role: TransferRole, reply: ScriptedReply) {
        self.scripts.entry(role).or_default().push_back(reply);
    }

    /// Queue the outcome of a future reconnect call
    pub fn script_reconnect(&mut self, result: Result<(), PortError>) {
        self.reconnect_results.push_back(result);
    }

    pub fn submit_count(&self, role: TransferRole) -> usize {
        self.submit_counts.get(&role).copied().unwrap_or(0)
    }

    pub fn cancel_count(&self, role: TransferRole) -> usize {
        self.cancel_counts.get(&role).copied().unwrap_or(0)
    }

    /// Every control setup packet submitted so far, in order
    pub fn control_setups(&self) -> &[ControlSetup] {
        &self.control_setups
    }

    /// Payloads of every bulk-OUT submission, including resubmissions
    pub fn writes(&self) -> &[Vec<u8>] {
        &self.writes
    }

    pub fn reconnect_calls(&self) -> usize {
        self.reconnect_calls
    }

    fn resolve(&mut self, role: TransferRole, reply: ScriptedReply, out_len: usize) {
        match reply {
            ScriptedReply::Data(data) => {
                let actual_length = data.len();
                self.ready.push(Completion {
                    role,
                    status: HostStatus::Completed,
                    data,
                    actual_length,
                });
            }
            ScriptedReply::Sent(n) => self.ready.push(Completion {
                role,
                status: HostStatus::Completed,
                data: Vec::new(),
                actual_length: n.min(out_len),
            }),
            ScriptedReply::Status(status) => self.ready.push(Completion {
                role,
                status,
                data: Vec::new(),
                actual_length: 0,
            }),
            ScriptedReply::Hold => {
                self.held.insert(role);
            }
        }
    }
}

impl UsbHost for ScriptedHost {
    fn submit(&mut self, role: TransferRole, request: SubmitRequest<'_>) -> Result<(), PortError> {
        *self.submit_counts.entry(role).or_default() += 1;

        let out_len = match request {
            SubmitRequest::Control { setup, data, .. } => {
                self.control_setups.push(setup);
                data.len()
            }
            SubmitRequest::BulkOut { data, .. } => {
                self.writes.push(data.to_vec());
                data.len()
            }
            SubmitRequest::BulkIn { .. } | SubmitRequest::MessageIn { .. } => 0,
        };

        let reply = self.scripts.entry(role).or_default().pop_front();
        match reply {
            Some(reply) => self.resolve(role, reply, out_len),
            // Unscripted writes complete fully, everything else is held
            None if role == TransferRole::BulkOut => {
                self.resolve(role, ScriptedReply::Sent(out_len), out_len)
            }
            None => {
                self.held.insert(role);
            }
        }
        Ok(())
    }

    fn cancel(&mut self, role: TransferRole) -> Result<(), PortError> {
        *self.cancel_counts.entry(role).or_default() += 1;
        if self.held.remove(&role) {
            self.ready.push(Completion {
                role,
                status: HostStatus::Cancelled,
                data: Vec::new(),
                actual_length: 0,
            });
        }
        Ok(())
    }

    fn handle_events(
        &mut self,
        _timeout: Duration,
        completions: &mut Vec<Completion>,
    ) -> Result<(), PortError> {
        completions.append(&mut self.ready);
        Ok(())
    }

    fn reconnect(&mut self, _delay: Duration) -> Result<(), PortError> {
        self.reconnect_calls += 1;
        self.held.clear();
        self.ready.clear();
        self.reconnect_results.pop_front().unwrap_or(Ok(()))
    }

    fn endpoint(&self, role: TransferRole) -> Option<EndpointInfo> {
        match role {
            TransferRole::Control => Some(EndpointInfo {
                address: 0x00,
                max_packet_size: 64,
                kind: TransferKind::Bulk,
            }),
            TransferRole::BulkIn => Some(EndpointInfo {
                address: 0x81,
                max_packet_size: 512,
                kind: TransferKind::Bulk,
            }),
            TransferRole::BulkOut => Some(EndpointInfo {
                address: 0x02,
                max_packet_size: 512,
                kind: TransferKind::Bulk,
            }),
            TransferRole::MessageIn => {
                if self.message_in_endpoint {
                    Some(EndpointInfo {
                        address: 0x83,
                        max_packet_size: 64,
                        kind: TransferKind::Interrupt,
                    })
                } else {
                    None
                }
            }
        }
    }
}
