//! Reusable transfer frames
//!
//! A frame is a fixed-capacity byte buffer that travels between a pool, a
//! queue and an in-flight transfer, always owned by exactly one of them.
//! Write frames keep a consumption cursor so a partially sent frame can be
//! resubmitted from where the last transfer stopped; USBTMC write frames
//! additionally carry their bTag, EOM flag and whether a reply is expected.
//! Control frames carry the 8-byte setup packet alongside the payload.

use protocol::ControlSetup;

/// USBTMC metadata attached to an encoded bulk-OUT frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbtmcMeta {
    /// bTag used in the frame header
    pub btag: u8,
    /// End-of-message flag
    pub eom: bool,
    /// True when a device reply must be read back after this frame
    pub wait_answer: bool,
}

#[derive(Debug)]
pub struct Frame {
    data: Vec<u8>,
    capacity: usize,
    cursor: usize,
    complete: bool,
    setup: Option<ControlSetup>,
    meta: Option<UsbtmcMeta>,
}

impl Frame {
    /// Create an empty frame with the given byte capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            capacity,
            cursor: 0,
            complete: false,
            setup: None,
            meta: None,
        }
    }

    /// Byte capacity of the frame
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current content
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Replace the content; panics in debug builds past capacity
    pub fn set_data(&mut self, bytes: &[u8]) {
        debug_assert!(bytes.len() <= self.capacity);
        self.data.clear();
        self.data.extend_from_slice(bytes);
    }

    /// Append to the content
    pub fn append(&mut self, bytes: &[u8]) {
        debug_assert!(self.data.len() + bytes.len() <= self.capacity);
        self.data.extend_from_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Unsent remainder of a write frame
    pub fn remaining(&self) -> &[u8] {
        &self.data[self.cursor..]
    }

    /// Advance the consumption cursor after a partial write completion
    pub fn advance(&mut self, n: usize) {
        self.cursor = (self.cursor + n).min(self.data.len());
    }

    /// True once the cursor has consumed the whole content
    pub fn is_fully_sent(&self) -> bool {
        self.cursor >= self.data.len()
    }

    pub fn set_complete(&mut self, complete: bool) {
        self.complete = complete;
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Attach the control setup packet for a control frame
    pub fn set_setup(&mut self, setup: ControlSetup) {
        self.setup = Some(setup);
    }

    pub fn setup(&self) -> Option<&ControlSetup> {
        self.setup.as_ref()
    }

    /// Encoded control frame: 8 setup bytes followed by the payload
    pub fn encode_control(&self) -> Option<Vec<u8>> {
        let setup = self.setup.as_ref()?;
        let mut out = Vec::with_capacity(protocol::SETUP_PACKET_SIZE + self.data.len());
        out.extend_from_slice(&setup.encode());
        out.extend_from_slice(&self.data);
        Some(out)
    }

    pub fn set_meta(&mut self, meta: UsbtmcMeta) {
        self.meta = Some(meta);
    }

    pub fn meta(&self) -> Option<&UsbtmcMeta> {
        self.meta.as_ref()
    }

    /// Reset the frame for reuse from a pool
    pub fn clear(&mut self) {
        self.data.clear();
        self.cursor = 0;
        self.complete = false;
        self.setup = None;
        self.meta = None;
    }
}
