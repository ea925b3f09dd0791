//! USBTMC abort-bulk-in / abort-bulk-out recovery sequences
//!
//! A failed bulk transfer leaves the device-side transaction in an
//! undefined state; the USBTMC abort protocol tears it down with class
//! control requests so the pipes come back usable without resetting the
//! device. Both sequences run inline on the worker thread and own the
//! control pipe exclusively until they finish: queued control work is
//! flushed first and any in-flight transfer on an involved pipe is
//! cancelled synchronously.
//!
//! INITIATE and CHECK are each bounded by `abort_max_retry`; draining the
//! device FIFO is bounded by `flush_max_transfers`. Whatever the device
//! answers, the sequences end by reporting the triggering error as handled
//! and the port as ready again.

use crate::backend::UsbHost;
use crate::engine::{SubmitResult, TransferOutcome};
use crate::worker::PortWorker;
use common::{PortError, PortNotification, TransferRole};
use protocol::{AbortRequest, ControlSetup, UsbtmcStatus};
use std::thread;
use tracing::{debug, warn};

impl<H: UsbHost> PortWorker<H> {
    /// Recover the bulk-IN pipe after a failed read of transaction `btag`
    pub(crate) fn abort_bulk_in(&mut self, btag: u8, cause: PortError) -> Result<(), PortError> {
        warn!(btag, cause = %cause, "starting abort-bulk-in");
        self.link.notify(PortNotification::Recovering);

        // A write feeding the aborted transaction must not keep its pipe
        // busy while the device processes the abort
        self.engine.cancel(TransferRole::BulkOut)?;
        self.engine.cancel(TransferRole::BulkIn)?;
        self.absorb_outcomes();
        self.queues.flush_control(&mut self.pools);
        self.engine.cancel(TransferRole::Control)?;
        self.absorb_outcomes();

        let endpoint = self.endpoint_address(TransferRole::BulkIn);
        let mut initiated = false;
        for attempt in 1..=self.config.abort_max_retry {
            let data = self.control_roundtrip(AbortRequest::initiate_bulk_in(btag, endpoint))?;
            match AbortRequest::parse_initiate_response(&data).map_err(PortError::Frame)? {
                UsbtmcStatus::Success => {
                    initiated = true;
                    break;
                }
                UsbtmcStatus::TransferNotInProgress => {
                    debug!(attempt, "transfer not in progress yet, retrying INITIATE");
                    thread::sleep(self.config.abort_retry_delay());
                }
                status => {
                    debug!(?status, "device reports nothing to abort");
                    self.finish_abort(cause);
                    return Ok(());
                }
            }
        }
        if !initiated {
            warn!("INITIATE_ABORT_BULK_IN retries exhausted, reporting as handled");
            self.finish_abort(cause);
            return Ok(());
        }

        self.flush_read_fifo()?;

        for _ in 1..=self.config.abort_max_retry {
            let data = self.control_roundtrip(AbortRequest::check_bulk_in_status(endpoint))?;
            let check = AbortRequest::parse_check_response(&data).map_err(PortError::Frame)?;
            if check.status != UsbtmcStatus::Pending {
                break;
            }
            if check.fifo_has_data {
                self.flush_read_fifo()?;
            }
            thread::sleep(self.config.abort_retry_delay());
        }

        self.finish_abort(cause);
        Ok(())
    }

    /// Recover the bulk-OUT pipe after a failed write of transaction `btag`
    pub(crate) fn abort_bulk_out(&mut self, btag: u8, cause: PortError) -> Result<(), PortError> {
        warn!(btag, cause = %cause, "starting abort-bulk-out");
        self.link.notify(PortNotification::Recovering);

        self.engine.cancel(TransferRole::BulkOut)?;
        self.absorb_outcomes();
        self.queues.flush_control(&mut self.pools);
        self.engine.cancel(TransferRole::Control)?;
        self.absorb_outcomes();
        // The outbound message stream is broken mid-message; queued frames
        // would arrive as garbage
        self.queues.flush_write(&mut self.pools);

        let endpoint = self.endpoint_address(TransferRole::BulkOut);
        let mut initiated = false;
        for attempt in 1..=self.config.abort_max_retry {
            let data = self.control_roundtrip(AbortRequest::initiate_bulk_out(btag, endpoint))?;
            match AbortRequest::parse_initiate_response(&data).map_err(PortError::Frame)? {
                UsbtmcStatus::Success => {
                    initiated = true;
                    break;
                }
                UsbtmcStatus::TransferNotInProgress => {
                    debug!(attempt, "transfer not in progress yet, retrying INITIATE");
                    thread::sleep(self.config.abort_retry_delay());
                }
                status => {
                    debug!(?status, "device reports nothing to abort");
                    break;
                }
            }
        }

        if initiated {
            for _ in 1..=self.config.abort_max_retry {
                let data =
                    self.control_roundtrip(AbortRequest::check_bulk_out_status(endpoint))?;
                let check = AbortRequest::parse_check_response(&data).map_err(PortError::Frame)?;
                if check.status != UsbtmcStatus::Pending {
                    break;
                }
                thread::sleep(self.config.abort_retry_delay());
            }
        }

        // The abort leaves the OUT endpoint halted; clear it so the pipe
        // accepts traffic again
        self.control_roundtrip(ControlSetup::clear_endpoint_halt(endpoint))?;

        self.finish_abort(cause);
        Ok(())
    }

    /// One control request and its response, run to completion
    ///
    /// Outcomes of other roles completing meanwhile are put aside for the
    /// driving loop.
    pub(crate) fn control_roundtrip(&mut self, setup: ControlSetup) -> Result<Vec<u8>, PortError> {
        let mut frame = self.pools.control.take()?;
        frame.set_setup(setup);
        match self.engine.submit_control(frame) {
            SubmitResult::Submitted => {}
            SubmitResult::Busy(frame) => {
                self.pools.control.give_back(frame);
                return Err(PortError::Unhandled(
                    "Control pipe busy during recovery".into(),
                ));
            }
            SubmitResult::Failed { error, frame } => {
                self.pools.control.give_back(frame);
                return Err(error);
            }
        }

        for _ in 0..self.wait_bound(self.config.control_timeout_ms) {
            self.engine.pump(self.config.event_wait())?;
            while let Some(outcome) = self.engine.pop_outcome() {
                match outcome {
                    TransferOutcome::Completed {
                        role: TransferRole::Control,
                        frame,
                    } => {
                        let data = frame.data().to_vec();
                        self.pools.control.give_back(frame);
                        return Ok(data);
                    }
                    TransferOutcome::Failed {
                        role: TransferRole::Control,
                        error,
                        frame,
                    } => {
                        self.pools.control.give_back(frame);
                        return Err(error);
                    }
                    other => self.deferred.push_back(other),
                }
            }
        }
        Err(PortError::Unhandled(
            "Control transfer never completed".into(),
        ))
    }

    /// Read the bulk-IN pipe until the device answers with a short packet
    ///
    /// A read timeout counts as drained. Bounded by `flush_max_transfers`
    /// for devices that keep streaming.
    fn flush_read_fifo(&mut self) -> Result<(), PortError> {
        let max_packet = self
            .engine
            .host()
            .endpoint(TransferRole::BulkIn)
            .map(|e| e.max_packet_size)
            .unwrap_or(512);

        for _ in 0..self.config.flush_max_transfers {
            let frame = self.pools.read.take()?;
            match self.engine.submit_read(frame) {
                SubmitResult::Submitted => {}
                SubmitResult::Busy(frame) => {
                    self.pools.read.give_back(frame);
                    return Err(PortError::Unhandled(
                        "Read pipe busy during recovery".into(),
                    ));
                }
                SubmitResult::Failed { error, frame } => {
                    self.pools.read.give_back(frame);
                    return Err(error);
                }
            }

            let mut full_packet = false;
            'wait: for _ in 0..self.wait_bound(self.config.read_timeout_ms) {
                self.engine.pump(self.config.event_wait())?;
                while let Some(outcome) = self.engine.pop_outcome() {
                    match outcome {
                        TransferOutcome::Completed {
                            role: TransferRole::BulkIn,
                            frame,
                        } => {
                            let len = frame.len();
                            self.pools.read.give_back(frame);
                            if len < max_packet {
                                return Ok(());
                            }
                            full_packet = true;
                            break 'wait;
                        }
                        TransferOutcome::Failed {
                            role: TransferRole::BulkIn,
                            error,
                            frame,
                        } => {
                            self.pools.read.give_back(frame);
                            return match error {
                                PortError::ReadTimeout => Ok(()),
                                e => Err(e),
                            };
                        }
                        other => self.deferred.push_back(other),
                    }
                }
            }
            if !full_packet {
                return Err(PortError::Unhandled(
                    "Flush read never completed".into(),
                ));
            }
        }
        warn!(
            bound = self.config.flush_max_transfers,
            "device FIFO not drained within the transfer bound"
        );
        Ok(())
    }

    /// Drain engine outcomes produced by the synchronous cancels and put
    /// their frames back; nothing here needs further routing
    fn absorb_outcomes(&mut self) {
        while let Some(outcome) = self.engine.pop_outcome() {
            match outcome {
                TransferOutcome::Completed { role, frame }
                | TransferOutcome::Failed { role, frame, .. } => {
                    self.pools.give_back(role, frame)
                }
            }
        }
    }

    fn finish_abort(&mut self, cause: PortError) {
        // The aborted transaction will never answer
        self.expected.clear();
        self.link.notify(PortNotification::HandledError(cause));
        self.link.notify(PortNotification::Ready);
    }

    fn endpoint_address(&self, role: TransferRole) -> u8 {
        self.engine
            .host()
            .endpoint(role)
            .map(|e| e.address)
            .unwrap_or(0)
    }

    /// Event pump iterations that cover a native timeout of `ms`
    pub(crate) fn wait_bound(&self, ms: u64) -> u64 {
        ms / self.config.event_wait_ms.max(1) + 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HostStatus;
    use crate::config::PortConfig;
    use crate::mock::{device_reply, ScriptedHost, ScriptedReply};
    use common::{create_port_bridge, PortBridge, PortCommand};
    use protocol::{
        CHECK_ABORT_BULK_IN_STATUS, CHECK_ABORT_BULK_OUT_STATUS, INITIATE_ABORT_BULK_IN,
        INITIATE_ABORT_BULK_OUT, REQUEST_CLEAR_FEATURE,
    };

    const INITIATE_SUCCESS: [u8; 2] = [0x01, 0x00];
    const INITIATE_NOT_IN_PROGRESS: [u8; 2] = [0x81, 0x00];
    const CHECK_SUCCESS: [u8; 8] = [0x01, 0, 0, 0, 0, 0, 0, 0];
    const CHECK_PENDING: [u8; 8] = [0x02, 0, 0, 0, 0, 0, 0, 0];

    fn worker_with(host: ScriptedHost) -> (PortWorker<ScriptedHost>, PortBridge) {
        let (bridge, link) = create_port_bridge();
        let mut config = PortConfig::default();
        config.event_wait_ms = 1;
        config.abort_retry_delay_ms = 0;
        (PortWorker::new(host, link, config), bridge)
    }

    fn drive(worker: &mut PortWorker<ScriptedHost>, n: usize) {
        for _ in 0..n {
            worker.run_once().unwrap();
        }
    }

    fn requests_of(worker: &PortWorker<ScriptedHost>) -> Vec<u8> {
        worker
            .engine
            .host()
            .control_setups()
            .iter()
            .map(|s| s.request)
            .collect()
    }

    #[test]
    fn test_read_timeout_aborts_in_two_control_roundtrips() {
        let mut host = ScriptedHost::new();
        host.script(TransferRole::BulkIn, ScriptedReply::Status(HostStatus::TimedOut));
        // FIFO drain answers with one short packet
        host.script(TransferRole::BulkIn, ScriptedReply::Data(b"x".to_vec()));
        host.script(TransferRole::Control, ScriptedReply::Data(INITIATE_SUCCESS.to_vec()));
        host.script(TransferRole::Control, ScriptedReply::Data(CHECK_SUCCESS.to_vec()));
        let (mut worker, bridge) = worker_with(host);

        bridge
            .send_command(PortCommand::SendQuery {
                data: b"*IDN?\n".to_vec(),
            })
            .unwrap();
        drive(&mut worker, 6);

        assert_eq!(
            requests_of(&worker),
            vec![INITIATE_ABORT_BULK_IN, CHECK_ABORT_BULK_IN_STATUS]
        );
        // The aborted transaction carried bTag 2 (the read request frame)
        assert_eq!(worker.engine.host().control_setups()[0].value, 2);
        assert!(!worker.engine.is_pending(TransferRole::BulkIn));
        assert!(worker.expected.is_empty());
        assert_eq!(worker.pools.read.available(), worker.config.read_pool_size);
        assert_eq!(worker.pools.control.available(), worker.config.control_pool_size);

        let mut notes = Vec::new();
        while let Some(note) = bridge.try_recv_notification() {
            notes.push(note);
        }
        assert!(notes.contains(&PortNotification::Recovering));
        assert!(notes.contains(&PortNotification::HandledError(PortError::ReadTimeout)));
        assert_eq!(notes.last(), Some(&PortNotification::Ready));
    }

    #[test]
    fn test_pending_status_bounds_check_roundtrips() {
        let mut host = ScriptedHost::new();
        host.script(TransferRole::BulkIn, ScriptedReply::Status(HostStatus::TimedOut));
        host.script(TransferRole::BulkIn, ScriptedReply::Data(b"x".to_vec()));
        host.script(TransferRole::Control, ScriptedReply::Data(INITIATE_SUCCESS.to_vec()));
        for _ in 0..3 {
            host.script(TransferRole::Control, ScriptedReply::Data(CHECK_PENDING.to_vec()));
        }
        host.script(TransferRole::Control, ScriptedReply::Data(CHECK_SUCCESS.to_vec()));
        let (mut worker, bridge) = worker_with(host);

        bridge
            .send_command(PortCommand::SendQuery {
                data: b"MEAS?\n".to_vec(),
            })
            .unwrap();
        drive(&mut worker, 6);

        let requests = requests_of(&worker);
        assert_eq!(requests[0], INITIATE_ABORT_BULK_IN);
        assert_eq!(
            requests
                .iter()
                .filter(|&&r| r == CHECK_ABORT_BULK_IN_STATUS)
                .count(),
            4
        );
        assert_eq!(requests.len(), 5);
    }

    #[test]
    fn test_initiate_retries_while_not_in_progress() {
        let mut host = ScriptedHost::new();
        host.script(TransferRole::BulkIn, ScriptedReply::Status(HostStatus::TimedOut));
        host.script(TransferRole::BulkIn, ScriptedReply::Data(b"x".to_vec()));
        for _ in 0..2 {
            host.script(
                TransferRole::Control,
                ScriptedReply::Data(INITIATE_NOT_IN_PROGRESS.to_vec()),
            );
        }
        host.script(TransferRole::Control, ScriptedReply::Data(INITIATE_SUCCESS.to_vec()));
        host.script(TransferRole::Control, ScriptedReply::Data(CHECK_SUCCESS.to_vec()));
        let (mut worker, bridge) = worker_with(host);

        bridge
            .send_command(PortCommand::SendQuery {
                data: b"*OPC?\n".to_vec(),
            })
            .unwrap();
        drive(&mut worker, 6);

        let requests = requests_of(&worker);
        assert_eq!(
            requests
                .iter()
                .filter(|&&r| r == INITIATE_ABORT_BULK_IN)
                .count(),
            3
        );
        assert_eq!(*requests.last().unwrap(), CHECK_ABORT_BULK_IN_STATUS);
    }

    #[test]
    fn test_initiate_exhaustion_is_reported_handled() {
        let mut host = ScriptedHost::new();
        host.script(TransferRole::BulkIn, ScriptedReply::Status(HostStatus::TimedOut));
        for _ in 0..5 {
            host.script(
                TransferRole::Control,
                ScriptedReply::Data(INITIATE_NOT_IN_PROGRESS.to_vec()),
            );
        }
        let (mut worker, bridge) = worker_with(host);

        bridge
            .send_command(PortCommand::SendQuery {
                data: b"*IDN?\n".to_vec(),
            })
            .unwrap();
        drive(&mut worker, 6);

        let requests = requests_of(&worker);
        assert_eq!(requests.len(), 5);
        assert!(requests.iter().all(|&r| r == INITIATE_ABORT_BULK_IN));

        let mut notes = Vec::new();
        while let Some(note) = bridge.try_recv_notification() {
            notes.push(note);
        }
        assert!(notes.contains(&PortNotification::HandledError(PortError::ReadTimeout)));
        assert_eq!(notes.last(), Some(&PortNotification::Ready));
    }

    #[test]
    fn test_write_timeout_runs_abort_bulk_out_and_clears_halt() {
        let mut host = ScriptedHost::new();
        host.script(TransferRole::BulkOut, ScriptedReply::Status(HostStatus::TimedOut));
        host.script(TransferRole::Control, ScriptedReply::Data(INITIATE_SUCCESS.to_vec()));
        host.script(TransferRole::Control, ScriptedReply::Data(CHECK_SUCCESS.to_vec()));
        // CLEAR_FEATURE has no data stage
        host.script(TransferRole::Control, ScriptedReply::Data(Vec::new()));
        let (mut worker, bridge) = worker_with(host);

        bridge
            .send_command(PortCommand::SendCommand {
                data: b"*RST\n".to_vec(),
                eom: true,
            })
            .unwrap();
        drive(&mut worker, 6);

        let setups = worker.engine.host().control_setups().to_vec();
        assert_eq!(setups.len(), 3);
        assert_eq!(setups[0].request, INITIATE_ABORT_BULK_OUT);
        assert_eq!(setups[0].value, 1);
        assert_eq!(setups[1].request, CHECK_ABORT_BULK_OUT_STATUS);
        assert_eq!(setups[2].request, REQUEST_CLEAR_FEATURE);
        assert_eq!(setups[2].kind, protocol::RequestKind::Standard);
        assert_eq!(setups[2].index, 0x02);

        assert!(worker.queues.bulk_write.is_empty());
        assert_eq!(
            worker.pools.write.available(),
            worker.config.write_pool_size
        );

        let mut notes = Vec::new();
        while let Some(note) = bridge.try_recv_notification() {
            notes.push(note);
        }
        assert!(notes.contains(&PortNotification::HandledError(PortError::WriteTimeout)));
    }

    #[test]
    fn test_mismatched_reply_btag_triggers_abort() {
        let mut host = ScriptedHost::new();
        host.script(
            TransferRole::BulkIn,
            ScriptedReply::Data(device_reply(99, b"stale\n", true)),
        );
        host.script(TransferRole::BulkIn, ScriptedReply::Data(b"x".to_vec()));
        host.script(TransferRole::Control, ScriptedReply::Data(INITIATE_SUCCESS.to_vec()));
        host.script(TransferRole::Control, ScriptedReply::Data(CHECK_SUCCESS.to_vec()));
        let (mut worker, bridge) = worker_with(host);

        bridge
            .send_command(PortCommand::SendQuery {
                data: b"*IDN?\n".to_vec(),
            })
            .unwrap();
        drive(&mut worker, 6);

        // No response reaches the application; the abort targets the bTag
        // the device actually answered with
        assert!(bridge.try_recv_response().is_none());
        assert_eq!(worker.engine.host().control_setups()[0].value, 99);
        assert!(worker.expected.is_empty());
    }

    #[test]
    fn test_corrupt_frame_triggers_abort() {
        let mut host = ScriptedHost::new();
        // bTag inverse check fails
        host.script(
            TransferRole::BulkIn,
            ScriptedReply::Data(vec![0x02, 5, 5, 0, 0, 0, 0, 0, 1, 0, 0, 0]),
        );
        host.script(TransferRole::BulkIn, ScriptedReply::Data(b"x".to_vec()));
        host.script(TransferRole::Control, ScriptedReply::Data(INITIATE_SUCCESS.to_vec()));
        host.script(TransferRole::Control, ScriptedReply::Data(CHECK_SUCCESS.to_vec()));
        let (mut worker, bridge) = worker_with(host);

        bridge
            .send_command(PortCommand::SendQuery {
                data: b"*IDN?\n".to_vec(),
            })
            .unwrap();
        drive(&mut worker, 6);

        assert_eq!(requests_of(&worker)[0], INITIATE_ABORT_BULK_IN);
        // The abort targets the oldest outstanding transaction
        assert_eq!(worker.engine.host().control_setups()[0].value, 2);

        let mut saw_frame_error = false;
        while let Some(note) = bridge.try_recv_notification() {
            if matches!(note, PortNotification::HandledError(PortError::Frame(_))) {
                saw_frame_error = true;
            }
        }
        assert!(saw_frame_error);
    }

    #[test]
    fn test_fifo_flag_forces_another_drain() {
        let mut host = ScriptedHost::new();
        host.script(TransferRole::BulkIn, ScriptedReply::Status(HostStatus::TimedOut));
        // First drain, then a second one forced by bmAbortBulkIn.D0
        host.script(TransferRole::BulkIn, ScriptedReply::Data(b"x".to_vec()));
        host.script(TransferRole::BulkIn, ScriptedReply::Data(b"y".to_vec()));
        host.script(TransferRole::Control, ScriptedReply::Data(INITIATE_SUCCESS.to_vec()));
        let pending_with_fifo: [u8; 8] = [0x02, 0x01, 0, 0, 0, 0, 0, 0];
        host.script(
            TransferRole::Control,
            ScriptedReply::Data(pending_with_fifo.to_vec()),
        );
        host.script(TransferRole::Control, ScriptedReply::Data(CHECK_SUCCESS.to_vec()));
        let (mut worker, bridge) = worker_with(host);

        bridge
            .send_command(PortCommand::SendQuery {
                data: b"*IDN?\n".to_vec(),
            })
            .unwrap();
        drive(&mut worker, 6);

        // The triggering read is followed by two drain reads
        assert_eq!(worker.engine.host().submit_count(TransferRole::BulkIn), 3);
        assert_eq!(
            requests_of(&worker),
            vec![
                INITIATE_ABORT_BULK_IN,
                CHECK_ABORT_BULK_IN_STATUS,
                CHECK_ABORT_BULK_IN_STATUS
            ]
        );
    }
}
