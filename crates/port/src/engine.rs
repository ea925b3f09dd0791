//! Per-role transfer lifecycle
//!
//! The engine owns one [`Transfer`] slot per role. A slot is a pending
//! flag, the frame attached to the in-flight native transfer and the
//! role's timeout. Submitting into a busy slot is a no-op that hands the
//! frame straight back; completions are drained from the host, classified
//! once, and queued as [`TransferOutcome`]s for the driving loop.
//! Cancellation is synchronous: it pumps native events until the
//! completion callback has fired and the slot is idle again.

use crate::backend::{classify_status, Completion, SubmitRequest, UsbHost};
use crate::config::PortConfig;
use crate::frame::Frame;
use common::{PortError, TransferRole};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, warn};

/// Waits of `CANCEL_WAIT` while a cancelled transfer settles
const CANCEL_MAX_WAITS: u32 = 100;
const CANCEL_WAIT: Duration = Duration::from_millis(100);

/// Result of a submit call
#[derive(Debug)]
pub enum SubmitResult {
    /// Transfer is in flight; the engine owns the frame until completion
    Submitted,
    /// Slot was already pending; the frame comes back untouched
    Busy(Frame),
    /// Native submission failed; the slot stays idle
    Failed { error: PortError, frame: Frame },
}

/// A finished transfer, ready for the driving loop
#[derive(Debug)]
pub enum TransferOutcome {
    Completed {
        role: TransferRole,
        frame: Frame,
    },
    Failed {
        role: TransferRole,
        error: PortError,
        frame: Frame,
    },
}

#[derive(Debug)]
struct Transfer {
    pending: bool,
    frame: Option<Frame>,
    timeout: Duration,
}

impl Transfer {
    fn new(timeout: Duration) -> Self {
        Self {
            pending: false,
            frame: None,
            timeout,
        }
    }
}

pub struct TransferEngine<H: UsbHost> {
    host: H,
    control: Transfer,
    read: Transfer,
    write: Transfer,
    message_in: Transfer,
    outcomes: VecDeque<TransferOutcome>,
    scratch: Vec<Completion>,
}

impl<H: UsbHost> TransferEngine<H> {
    pub fn new(host: H, config: &PortConfig) -> Self {
        Self {
            host,
            control: Transfer::new(config.control_timeout()),
            read: Transfer::new(config.read_timeout()),
            write: Transfer::new(config.write_timeout()),
            message_in: Transfer::new(config.message_in_timeout()),
            outcomes: VecDeque::new(),
            scratch: Vec::new(),
        }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    fn transfer(&self, role: TransferRole) -> &Transfer {
        match role {
            TransferRole::Control => &self.control,
            TransferRole::BulkIn => &self.read,
            TransferRole::BulkOut => &self.write,
            TransferRole::MessageIn => &self.message_in,
        }
    }

    fn transfer_mut(&mut self, role: TransferRole) -> &mut Transfer {
        match role {
            TransferRole::Control => &mut self.control,
            TransferRole::BulkIn => &mut self.read,
            TransferRole::BulkOut => &mut self.write,
            TransferRole::MessageIn => &mut self.message_in,
        }
    }

    pub fn is_pending(&self, role: TransferRole) -> bool {
        self.transfer(role).pending
    }

    /// Submit a control frame; the frame must carry its setup packet
    pub fn submit_control(&mut self, frame: Frame) -> SubmitResult {
        if self.control.pending {
            return SubmitResult::Busy(frame);
        }
        let Some(setup) = frame.setup().copied() else {
            return SubmitResult::Failed {
                error: PortError::Setup("Control frame without setup packet".into()),
                frame,
            };
        };
        let timeout = self.control.timeout;
        match self.host.submit(
            TransferRole::Control,
            SubmitRequest::Control {
                setup,
                data: frame.data(),
                timeout,
            },
        ) {
            Ok(()) => {
                self.control.frame = Some(frame);
                self.control.pending = true;
                SubmitResult::Submitted
            }
            Err(error) => SubmitResult::Failed { error, frame },
        }
    }

    /// Arm a bulk-IN transfer into an empty frame
    pub fn submit_read(&mut self, frame: Frame) -> SubmitResult {
        if self.read.pending {
            return SubmitResult::Busy(frame);
        }
        let timeout = self.read.timeout;
        match self.host.submit(
            TransferRole::BulkIn,
            SubmitRequest::BulkIn {
                max_len: frame.capacity(),
                timeout,
            },
        ) {
            Ok(()) => {
                self.read.frame = Some(frame);
                self.read.pending = true;
                SubmitResult::Submitted
            }
            Err(error) => SubmitResult::Failed { error, frame },
        }
    }

    /// Submit the unsent remainder of an encoded write frame
    pub fn submit_write(&mut self, frame: Frame) -> SubmitResult {
        if self.write.pending {
            return SubmitResult::Busy(frame);
        }
        let timeout = self.write.timeout;
        match self.host.submit(
            TransferRole::BulkOut,
            SubmitRequest::BulkOut {
                data: frame.remaining(),
                timeout,
            },
        ) {
            Ok(()) => {
                self.write.frame = Some(frame);
                self.write.pending = true;
                SubmitResult::Submitted
            }
            Err(error) => SubmitResult::Failed { error, frame },
        }
    }

    /// Arm the interrupt message channel
    pub fn submit_message_in(&mut self, frame: Frame) -> SubmitResult {
        if self.message_in.pending {
            return SubmitResult::Busy(frame);
        }
        let timeout = self.message_in.timeout;
        match self.host.submit(
            TransferRole::MessageIn,
            SubmitRequest::MessageIn {
                max_len: frame.capacity(),
                timeout,
            },
        ) {
            Ok(()) => {
                self.message_in.frame = Some(frame);
                self.message_in.pending = true;
                SubmitResult::Submitted
            }
            Err(error) => SubmitResult::Failed { error, frame },
        }
    }

    /// Pump native events and turn completions into outcomes
    pub fn pump(&mut self, timeout: Duration) -> Result<(), PortError> {
        let mut completions = std::mem::take(&mut self.scratch);
        completions.clear();
        let result = self.host.handle_events(timeout, &mut completions);
        for completion in completions.drain(..) {
            self.dispatch(completion);
        }
        self.scratch = completions;
        result
    }

    fn dispatch(&mut self, completion: Completion) {
        let role = completion.role;
        let transfer = self.transfer_mut(role);
        // The flag drops before classification so a cancel loop observing
        // it sees the callback as delivered.
        transfer.pending = false;
        let Some(mut frame) = transfer.frame.take() else {
            warn!(?role, "completion for an idle transfer slot, dropped");
            return;
        };

        match classify_status(role, completion.status) {
            None => match role {
                TransferRole::BulkOut => {
                    frame.advance(completion.actual_length);
                    if frame.is_fully_sent() {
                        frame.set_complete(true);
                        self.outcomes.push_back(TransferOutcome::Completed { role, frame });
                    } else {
                        debug!(
                            sent = completion.actual_length,
                            left = frame.remaining().len(),
                            "partial write, resubmitting remainder"
                        );
                        match self.submit_write(frame) {
                            SubmitResult::Submitted => {}
                            SubmitResult::Busy(frame) | SubmitResult::Failed { frame, .. } => {
                                self.outcomes.push_back(TransferOutcome::Failed {
                                    role,
                                    error: PortError::Unhandled(
                                        "write remainder resubmission failed".into(),
                                    ),
                                    frame,
                                });
                            }
                        }
                    }
                }
                TransferRole::Control | TransferRole::BulkIn | TransferRole::MessageIn => {
                    frame.set_data(&completion.data);
                    frame.set_complete(true);
                    self.outcomes.push_back(TransferOutcome::Completed { role, frame });
                }
            },
            Some(error) => {
                self.outcomes.push_back(TransferOutcome::Failed { role, error, frame });
            }
        }
    }

    /// Next finished transfer, if any
    pub fn pop_outcome(&mut self) -> Option<TransferOutcome> {
        self.outcomes.pop_front()
    }

    /// Cancel the in-flight transfer for `role` and wait for its callback
    ///
    /// Returns once the slot is idle; the cancelled frame surfaces as a
    /// `Failed` outcome with the role's cancellation error.
    pub fn cancel(&mut self, role: TransferRole) -> Result<(), PortError> {
        if !self.transfer(role).pending {
            return Ok(());
        }
        self.host.cancel(role)?;
        for _ in 0..CANCEL_MAX_WAITS {
            if !self.transfer(role).pending {
                return Ok(());
            }
            self.pump(CANCEL_WAIT)?;
        }
        Err(PortError::Unhandled(format!(
            "Cancellation of {:?} transfer never completed",
            role
        )))
    }

    /// Cancel every in-flight transfer
    pub fn cancel_all(&mut self) -> Result<(), PortError> {
        self.cancel(TransferRole::BulkOut)?;
        self.cancel(TransferRole::BulkIn)?;
        self.cancel(TransferRole::MessageIn)?;
        self.cancel(TransferRole::Control)?;
        Ok(())
    }

    /// Drop every pending flag and detach the attached frames
    ///
    /// Used after a reconnect, when the native transfers are gone and no
    /// callbacks will fire. Queued outcomes are discarded as well; their
    /// frames are returned with the rest.
    pub fn reset(&mut self) -> Vec<(TransferRole, Frame)> {
        let mut frames = Vec::new();
        for role in [
            TransferRole::Control,
            TransferRole::BulkIn,
            TransferRole::BulkOut,
            TransferRole::MessageIn,
        ] {
            let transfer = self.transfer_mut(role);
            transfer.pending = false;
            if let Some(frame) = transfer.frame.take() {
                frames.push((role, frame));
            }
        }
        while let Some(outcome) = self.outcomes.pop_front() {
            match outcome {
                TransferOutcome::Completed { role, frame }
                | TransferOutcome::Failed { role, frame, .. } => frames.push((role, frame)),
            }
        }
        frames
    }
}
