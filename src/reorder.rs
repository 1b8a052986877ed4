//! Frame reordering buffer for B-frame support.
//!
//! Frames arrive in input (display) order but B-frames must be encoded after
//! the future anchor they predict from. With 2 B-frames between anchors:
//! - Input order:  IDR(0), P(1), B(2), B(3), P(4), ...
//! - Encode order: IDR(0), P(1), P(4), B(2), B(3), ...
//!
//! The buffer also fills in the reference hints of every frame: anchors
//! predict from the previous anchor, B-frames from the anchors on both sides.

use crate::frame::FrameState;
use crate::gop::GopFrameType;

/// Frame reorder buffer for B-frame encoding.
#[derive(Debug, Default)]
pub struct FrameReorderBuffer {
    /// Frames waiting for their future anchor.
    buffer: Vec<FrameState>,
    /// Input order of the last anchor frame (I, IDR or P).
    last_anchor: Option<u64>,
}

impl FrameReorderBuffer {
    /// Create a new frame reorder buffer.
    ///
    /// `b_frame_count` only sizes the buffer.
    pub fn new(b_frame_count: u32) -> Self {
        Self {
            buffer: Vec::with_capacity((b_frame_count + 2) as usize),
            last_anchor: None,
        }
    }

    /// Submit a frame in input order.
    ///
    /// Returns frames ready to encode, in encode order (may be empty).
    pub fn submit_frame(&mut self, frame: FrameState) -> Vec<FrameState> {
        self.buffer.push(frame);
        self.frames_to_encode(false)
    }

    /// Flush remaining frames when input ends.
    pub fn flush(&mut self) -> Vec<FrameState> {
        self.frames_to_encode(true)
    }

    fn frames_to_encode(&mut self, flushing: bool) -> Vec<FrameState> {
        let mut result = Vec::new();

        loop {
            let anchor_pos = self
                .buffer
                .iter()
                .position(|f| f.frame_type() != GopFrameType::B);

            match anchor_pos {
                Some(pos) => {
                    // The anchor goes first, then the B-frames in front of it.
                    let mut anchor = self.buffer.remove(pos);
                    let previous_anchor = if anchor.is_idr() { None } else { self.last_anchor };
                    anchor.forward_reference = if anchor.is_intra() {
                        None
                    } else {
                        previous_anchor
                    };
                    anchor.backward_reference = None;

                    let backward = (!anchor.is_idr()).then_some(anchor.input_order);
                    self.last_anchor = Some(anchor.input_order);
                    result.push(anchor);

                    for mut b_frame in self.buffer.drain(..pos) {
                        b_frame.forward_reference = previous_anchor;
                        b_frame.backward_reference = backward;
                        result.push(b_frame);
                    }
                }
                None if flushing && !self.buffer.is_empty() => {
                    // No future anchor: the B-frames only predict from the past.
                    for mut frame in self.buffer.drain(..) {
                        frame.forward_reference = self.last_anchor;
                        frame.backward_reference = None;
                        result.push(frame);
                    }
                }
                _ => break,
            }
        }

        result
    }

    /// Check if buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Get number of buffered frames.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Hand back the buffered frames without reordering them.
    pub fn drain(&mut self) -> Vec<FrameState> {
        self.buffer.drain(..).collect()
    }
}
