//! The port worker thread and its driving loop
//!
//! The worker owns the engine, pools and queues outright; the application
//! reaches it only through the channel bridge. Every loop iteration drains
//! commands, pumps native events with a bounded wait, routes finished
//! transfers, feeds the write pipe from the FIFO, and re-arms the read and
//! message pipes when a transfer is expected. Errors classified as handled
//! route into the abort sequences or the reconnect path and surface as
//! notifications; an unhandled error stops the worker.

use crate::backend::UsbHost;
use crate::config::PortConfig;
use crate::engine::{SubmitResult, TransferEngine, TransferOutcome};
use crate::frame::UsbtmcMeta;
use crate::pool::{FramePool, Pools, QueueSet};
use common::{PortCommand, PortNotification, PortError, PortWorkerLink, Response, TransferRole};
use protocol::{
    decode_dev_dep_msg_in, encode_dev_dep_msg_out, encode_request_dev_dep_msg_in, BTagGenerator,
    ProtocolError, BULK_HEADER_SIZE,
};
use std::collections::VecDeque;
use std::thread;
use tracing::{debug, error, info, warn};

/// Control frames only ever carry abort protocol responses
const CONTROL_FRAME_SIZE: usize = 64;

pub struct PortWorker<H: UsbHost> {
    pub(crate) engine: TransferEngine<H>,
    pub(crate) pools: Pools,
    pub(crate) queues: QueueSet,
    pub(crate) link: PortWorkerLink,
    pub(crate) config: PortConfig,
    pub(crate) btags: BTagGenerator,
    /// bTags of sent requests still waiting for their reply, oldest first
    pub(crate) expected: VecDeque<u8>,
    /// Outcomes put aside by an abort sequence for the next iteration
    pub(crate) deferred: VecDeque<TransferOutcome>,
    pub(crate) running: bool,
}

impl<H: UsbHost> PortWorker<H> {
    pub fn new(host: H, link: PortWorkerLink, config: PortConfig) -> Self {
        let message_frame_size = host
            .endpoint(TransferRole::MessageIn)
            .map(|e| e.max_packet_size)
            .unwrap_or(CONTROL_FRAME_SIZE);
        let pools = Pools {
            control: FramePool::new(config.control_pool_size, CONTROL_FRAME_SIZE),
            read: FramePool::new(config.read_pool_size, config.read_frame_size),
            write: FramePool::new(config.write_pool_size, config.write_frame_size),
            message_in: FramePool::new(config.message_in_pool_size, message_frame_size),
        };
        let engine = TransferEngine::new(host, &config);
        Self {
            engine,
            pools,
            queues: QueueSet::default(),
            link,
            config,
            btags: BTagGenerator::new(),
            expected: VecDeque::new(),
            deferred: VecDeque::new(),
            running: true,
        }
    }

    /// Run until a stop command or an unrecoverable error
    pub fn run(&mut self) -> Result<(), PortError> {
        self.link.notify(PortNotification::Ready);
        while self.running {
            if let Err(e) = self.run_once() {
                match e {
                    PortError::Disconnected => {
                        if let Err(fatal) = self.handle_disconnect() {
                            self.link.notify(PortNotification::UnhandledError(fatal.clone()));
                            return Err(fatal);
                        }
                    }
                    fatal => {
                        error!(error = %fatal, "port worker stopping");
                        self.link.notify(PortNotification::UnhandledError(fatal.clone()));
                        return Err(fatal);
                    }
                }
            }
        }
        self.shutdown();
        Ok(())
    }

    /// One driving loop iteration
    pub(crate) fn run_once(&mut self) -> Result<(), PortError> {
        while let Some(cmd) = self.link.try_recv_command() {
            self.handle_command(cmd)?;
            if !self.running {
                return Ok(());
            }
        }

        self.engine.pump(self.config.event_wait())?;

        while let Some(outcome) = self.deferred.pop_front() {
            self.handle_outcome(outcome)?;
        }
        while let Some(outcome) = self.engine.pop_outcome() {
            self.handle_outcome(outcome)?;
        }

        self.progress_write()?;
        self.arm_read()?;
        self.arm_message_in();
        Ok(())
    }

    fn handle_command(&mut self, cmd: PortCommand) -> Result<(), PortError> {
        match cmd {
            PortCommand::SendCommand { data, eom } => {
                self.enqueue_message_out(&data, eom, false)
            }
            PortCommand::SendQuery { data } => self.enqueue_query(&data),
            PortCommand::SendReadRequest => self.enqueue_read_request(),
            PortCommand::Stop => {
                self.running = false;
                Ok(())
            }
        }
        .or_else(|e| match e {
            // Pool exhaustion is back-pressure, not a failure of the port
            PortError::PoolEmpty => {
                warn!("write pool exhausted, command dropped");
                self.link
                    .notify(PortNotification::HandledError(PortError::PoolEmpty));
                Ok(())
            }
            other => Err(other),
        })
    }

    /// Take `n` write frames, or none at all when the pool runs out
    fn take_write_frames(&mut self, n: usize) -> Result<Vec<crate::frame::Frame>, PortError> {
        let mut frames = Vec::with_capacity(n);
        for _ in 0..n {
            match self.pools.write.take() {
                Ok(frame) => frames.push(frame),
                Err(e) => {
                    for frame in frames {
                        self.pools.write.give_back(frame);
                    }
                    return Err(e);
                }
            }
        }
        Ok(frames)
    }

    /// Encode a device dependent message into one or more write frames
    ///
    /// A message larger than one frame is split; only the final frame
    /// carries the caller's EOM flag, and only the final frame can expect
    /// a reply. The message is queued whole or not at all: transmitting a
    /// head without its EOM tail would leave the device inside an
    /// unterminated message, with the next command parsed as its
    /// continuation.
    fn enqueue_message_out(
        &mut self,
        data: &[u8],
        eom: bool,
        wait_answer: bool,
    ) -> Result<(), PortError> {
        let max_chunk = (self.pools.write.frame_size() - BULK_HEADER_SIZE) & !3;
        let chunks: Vec<&[u8]> = if data.is_empty() {
            vec![&[]]
        } else {
            data.chunks(max_chunk).collect()
        };
        let frames = self.take_write_frames(chunks.len())?;
        let last_index = chunks.len() - 1;
        for (i, (chunk, mut frame)) in chunks.into_iter().zip(frames).enumerate() {
            let last = i == last_index;
            let btag = self.btags.next();
            frame.set_data(&encode_dev_dep_msg_out(btag, chunk, eom && last));
            frame.set_meta(UsbtmcMeta {
                btag,
                eom: eom && last,
                wait_answer: wait_answer && last,
            });
            self.queues.bulk_write.push_back(frame);
        }
        Ok(())
    }

    /// Queue a command message followed by the read request for its reply
    ///
    /// The read request frame is reserved up front, so the command cannot
    /// be sent with no reply ever requested.
    fn enqueue_query(&mut self, data: &[u8]) -> Result<(), PortError> {
        let mut read_frame = self.pools.write.take()?;
        if let Err(e) = self.enqueue_message_out(data, true, false) {
            self.pools.write.give_back(read_frame);
            return Err(e);
        }
        let btag = self.btags.next();
        let requested = self.pools.read.frame_size() as u32;
        read_frame.set_data(&encode_request_dev_dep_msg_in(btag, requested));
        read_frame.set_meta(UsbtmcMeta {
            btag,
            eom: false,
            wait_answer: true,
        });
        self.queues.bulk_write.push_back(read_frame);
        Ok(())
    }

    /// Enqueue a REQUEST_DEV_DEP_MSG_IN frame asking the device to send
    /// its pending reply
    fn enqueue_read_request(&mut self) -> Result<(), PortError> {
        let mut frame = self.pools.write.take()?;
        let btag = self.btags.next();
        let requested = self.pools.read.frame_size() as u32;
        frame.set_data(&encode_request_dev_dep_msg_in(btag, requested));
        frame.set_meta(UsbtmcMeta {
            btag,
            eom: false,
            wait_answer: true,
        });
        self.queues.bulk_write.push_back(frame);
        Ok(())
    }

    fn handle_outcome(&mut self, outcome: TransferOutcome) -> Result<(), PortError> {
        match outcome {
            TransferOutcome::Completed { role, frame } => match role {
                TransferRole::BulkOut => {
                    let meta = frame.meta().copied();
                    self.pools.write.give_back(frame);
                    if let Some(meta) = meta {
                        if meta.wait_answer {
                            self.expected.push_back(meta.btag);
                        }
                    }
                    Ok(())
                }
                TransferRole::BulkIn => self.handle_read_completion(frame),
                TransferRole::MessageIn => {
                    debug!(len = frame.len(), "message channel frame received");
                    if self.queues.message_in.len() >= self.config.message_in_pool_size {
                        if let Some(oldest) = self.queues.message_in.pop_front() {
                            self.pools.message_in.give_back(oldest);
                        }
                    }
                    self.queues.message_in.push_back(frame);
                    Ok(())
                }
                TransferRole::Control => {
                    // Control traffic belongs to the abort sequences, which
                    // consume their responses inline
                    debug!("stray control completion outside a recovery sequence");
                    self.pools.control.give_back(frame);
                    Ok(())
                }
            },
            TransferOutcome::Failed { role, error, frame } => {
                let btag = frame.meta().map(|m| m.btag);
                self.pools.give_back(role, frame);
                self.handle_error(role, error, btag)
            }
        }
    }

    fn handle_read_completion(&mut self, frame: crate::frame::Frame) -> Result<(), PortError> {
        let decoded = decode_dev_dep_msg_in(frame.data());
        self.pools.read.give_back(frame);
        match decoded {
            Ok(msg) => match self.expected.front().copied() {
                Some(expected) if expected == msg.btag => {
                    if msg.eom {
                        self.expected.pop_front();
                    }
                    let delivered = self.link.deliver_response(Response {
                        btag: msg.btag,
                        eom: msg.eom,
                        data: msg.data,
                    });
                    if let Err(e) = delivered {
                        warn!(error = %e, "response dropped, application is not draining replies");
                    }
                    Ok(())
                }
                expected => {
                    warn!(got = msg.btag, ?expected, "reply does not answer the oldest request");
                    let cause = PortError::Frame(ProtocolError::UnexpectedBTag {
                        expected: expected.unwrap_or(0),
                        actual: msg.btag,
                    });
                    self.abort_bulk_in(msg.btag, cause)
                }
            },
            Err(e) => {
                warn!(error = %e, "malformed bulk-IN frame");
                let btag = self.abort_target_btag();
                self.abort_bulk_in(btag, PortError::Frame(e))
            }
        }
    }

    /// bTag of the transaction an abort should target
    pub(crate) fn abort_target_btag(&self) -> u8 {
        self.expected
            .front()
            .copied()
            .or_else(|| self.btags.current())
            .unwrap_or(1)
    }

    /// Route a classified transfer error
    ///
    /// Bulk pipe errors recover through the matching abort sequence;
    /// control and message channel errors are reported and the pipe is
    /// simply re-armed. Disconnection propagates to the reconnect path.
    fn handle_error(
        &mut self,
        role: TransferRole,
        error: PortError,
        btag: Option<u8>,
    ) -> Result<(), PortError> {
        match error {
            PortError::Disconnected => Err(PortError::Disconnected),
            e if !e.is_handled() => Err(e),
            e => match role {
                TransferRole::BulkIn => {
                    let btag = btag.unwrap_or_else(|| self.abort_target_btag());
                    self.abort_bulk_in(btag, e)
                }
                TransferRole::BulkOut => {
                    let btag = btag.unwrap_or_else(|| self.abort_target_btag());
                    self.abort_bulk_out(btag, e)
                }
                TransferRole::Control | TransferRole::MessageIn => {
                    warn!(?role, error = %e, "transfer error on auxiliary pipe");
                    self.link.notify(PortNotification::HandledError(e));
                    Ok(())
                }
            },
        }
    }

    /// Feed the write pipe from the FIFO when it is idle
    fn progress_write(&mut self) -> Result<(), PortError> {
        if self.engine.is_pending(TransferRole::BulkOut) {
            return Ok(());
        }
        let Some(frame) = self.queues.bulk_write.pop_front() else {
            return Ok(());
        };
        match self.engine.submit_write(frame) {
            SubmitResult::Submitted => Ok(()),
            SubmitResult::Busy(frame) => {
                self.queues.bulk_write.push_front(frame);
                Ok(())
            }
            SubmitResult::Failed { error, frame } => {
                let btag = frame.meta().map(|m| m.btag);
                self.pools.write.give_back(frame);
                self.handle_error(TransferRole::BulkOut, error, btag)
            }
        }
    }

    /// Keep a read armed while a reply is outstanding
    fn arm_read(&mut self) -> Result<(), PortError> {
        if self.expected.is_empty() || self.engine.is_pending(TransferRole::BulkIn) {
            return Ok(());
        }
        let frame = match self.pools.read.take() {
            Ok(frame) => frame,
            Err(PortError::PoolEmpty) => {
                warn!("read pool exhausted, read pipe not re-armed");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        match self.engine.submit_read(frame) {
            SubmitResult::Submitted => Ok(()),
            SubmitResult::Busy(frame) => {
                self.pools.read.give_back(frame);
                Ok(())
            }
            SubmitResult::Failed { error, frame } => {
                self.pools.read.give_back(frame);
                let btag = self.expected.front().copied();
                self.handle_error(TransferRole::BulkIn, error, btag)
            }
        }
    }

    /// Keep the interrupt message channel armed when the interface has one
    fn arm_message_in(&mut self) {
        if self.engine.host().endpoint(TransferRole::MessageIn).is_none()
            || self.engine.is_pending(TransferRole::MessageIn)
        {
            return;
        }
        let frame = match self.pools.message_in.take() {
            Ok(frame) => frame,
            // Recycle the oldest queued frame rather than starve the pipe
            Err(_) => match self.queues.message_in.pop_front() {
                Some(mut frame) => {
                    frame.clear();
                    frame
                }
                None => return,
            },
        };
        match self.engine.submit_message_in(frame) {
            SubmitResult::Submitted => {}
            SubmitResult::Busy(frame) => self.pools.message_in.give_back(frame),
            SubmitResult::Failed { error, frame } => {
                self.pools.message_in.give_back(frame);
                warn!(error = %error, "message channel submission failed");
            }
        }
    }

    /// Recover from a disconnect with a bounded number of reopen attempts
    pub(crate) fn handle_disconnect(&mut self) -> Result<(), PortError> {
        warn!("device disconnected");
        self.link.notify(PortNotification::Disconnected);

        // Native transfers are gone; recover every frame they held
        for (role, frame) in self.engine.reset() {
            self.pools.give_back(role, frame);
        }
        while let Some(outcome) = self.deferred.pop_front() {
            match outcome {
                TransferOutcome::Completed { role, frame }
                | TransferOutcome::Failed { role, frame, .. } => {
                    self.pools.give_back(role, frame)
                }
            }
        }
        self.queues.flush_control(&mut self.pools);
        self.queues.flush_write(&mut self.pools);
        self.expected.clear();

        for attempt in 1..=self.config.reconnect_max_retry {
            info!(attempt, "attempting to reopen the device");
            match self
                .engine
                .host_mut()
                .reconnect(self.config.reconnect_delay())
            {
                Ok(()) => {
                    info!("device reopened");
                    self.link.notify(PortNotification::Ready);
                    return Ok(());
                }
                Err(e) => debug!(attempt, error = %e, "reopen attempt failed"),
            }
        }
        Err(PortError::Unhandled(format!(
            "Reconnect failed after {} attempts",
            self.config.reconnect_max_retry
        )))
    }

    /// Finish queued writes before stopping so a command sent right before
    /// a stop request still reaches the device
    fn drain_writes(&mut self) {
        let mut budget = self
            .wait_bound(self.config.write_timeout_ms)
            .saturating_mul(self.queues.bulk_write.len() as u64 + 1);
        while !self.queues.bulk_write.is_empty()
            || self.engine.is_pending(TransferRole::BulkOut)
        {
            if budget == 0 {
                warn!("write queue not drained before stop");
                return;
            }
            budget -= 1;

            if self.engine.pump(self.config.event_wait()).is_err() {
                return;
            }
            while let Some(outcome) = self.engine.pop_outcome() {
                let failed_write = matches!(
                    outcome,
                    TransferOutcome::Failed {
                        role: TransferRole::BulkOut,
                        ..
                    }
                );
                match outcome {
                    TransferOutcome::Completed { role, frame }
                    | TransferOutcome::Failed { role, frame, .. } => {
                        self.pools.give_back(role, frame)
                    }
                }
                if failed_write {
                    return;
                }
            }
            if !self.engine.is_pending(TransferRole::BulkOut) {
                if let Some(frame) = self.queues.bulk_write.pop_front() {
                    match self.engine.submit_write(frame) {
                        SubmitResult::Submitted => {}
                        SubmitResult::Busy(frame) | SubmitResult::Failed { frame, .. } => {
                            self.pools.write.give_back(frame);
                            return;
                        }
                    }
                }
            }
        }
    }

    fn shutdown(&mut self) {
        info!("port worker stopping");
        self.drain_writes();
        let _ = self.engine.cancel_all();
        for (role, frame) in self.engine.reset() {
            self.pools.give_back(role, frame);
        }
        self.queues.flush_control(&mut self.pools);
        self.queues.flush_write(&mut self.pools);
        self.link.notify(PortNotification::Stopped);
    }
}

/// Spawn the worker on its own thread
pub fn spawn_port_worker<H>(
    host: H,
    link: PortWorkerLink,
    config: PortConfig,
) -> thread::JoinHandle<Result<(), PortError>>
where
    H: UsbHost + Send + 'static,
{
    thread::spawn(move || {
        let mut worker = PortWorker::new(host, link, config);
        worker.run()
    })
}
