//! Frame pools and queues
//!
//! Every frame is owned by exactly one place at a time: a pool's free list,
//! a queue, or an in-flight transfer. Pools are bounded; taking from an
//! empty pool is an error rather than an allocation, which keeps memory
//! bounded and surfaces back-pressure to the driving loop.

use crate::frame::Frame;
use common::{PortError, TransferRole};
use std::collections::VecDeque;

/// Bounded free list of frames with a common capacity
#[derive(Debug)]
pub struct FramePool {
    free: Vec<Frame>,
    frame_size: usize,
    pool_size: usize,
}

impl FramePool {
    /// Create a pool of `pool_size` frames of `frame_size` bytes each
    pub fn new(pool_size: usize, frame_size: usize) -> Self {
        let free = (0..pool_size).map(|_| Frame::new(frame_size)).collect();
        Self {
            free,
            frame_size,
            pool_size,
        }
    }

    /// Take a frame, or `PoolEmpty` when every frame is checked out
    pub fn take(&mut self) -> Result<Frame, PortError> {
        self.free.pop().ok_or(PortError::PoolEmpty)
    }

    /// Return a frame; it is cleared before rejoining the free list
    pub fn give_back(&mut self, mut frame: Frame) {
        frame.clear();
        if self.free.len() < self.pool_size {
            self.free.push(frame);
        }
    }

    /// Frames currently available
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Capacity of the frames in this pool
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }
}

/// One pool per transfer role
#[derive(Debug)]
pub struct Pools {
    pub control: FramePool,
    pub read: FramePool,
    pub write: FramePool,
    pub message_in: FramePool,
}

impl Pools {
    pub fn pool_for(&mut self, role: TransferRole) -> &mut FramePool {
        match role {
            TransferRole::Control => &mut self.control,
            TransferRole::BulkIn => &mut self.read,
            TransferRole::BulkOut => &mut self.write,
            TransferRole::MessageIn => &mut self.message_in,
        }
    }

    /// Return a frame to the pool of its role
    pub fn give_back(&mut self, role: TransferRole, frame: Frame) {
        self.pool_for(role).give_back(frame);
    }
}

/// The four frame queues between the protocol layer and the I/O driver
#[derive(Debug, Default)]
pub struct QueueSet {
    /// Outbound control requests waiting for the control pipe
    pub control_query: VecDeque<Frame>,
    /// Completed control responses waiting for consumption
    pub control_response: VecDeque<Frame>,
    /// Encoded bulk-OUT frames waiting for the write pipe, strict FIFO
    pub bulk_write: VecDeque<Frame>,
    /// Completed message channel frames
    pub message_in: VecDeque<Frame>,
}

impl QueueSet {
    /// Move every queued control frame back to the control pool
    ///
    /// Used by the abort sequences, which must own the control pipe
    /// exclusively until recovery finishes.
    pub fn flush_control(&mut self, pools: &mut Pools) {
        for frame in self.control_query.drain(..) {
            pools.control.give_back(frame);
        }
        for frame in self.control_response.drain(..) {
            pools.control.give_back(frame);
        }
    }

    /// Move every queued write frame back to the write pool
    pub fn flush_write(&mut self, pools: &mut Pools) {
        for frame in self.bulk_write.drain(..) {
            pools.write.give_back(frame);
        }
    }
}
