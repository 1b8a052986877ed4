//! Per-frame encode state.

use std::fmt;

use parking_lot::Mutex;

use crate::config::RateControlParams;
use crate::control::ControlCommandChain;
use crate::device::{BitstreamBufferResource, CommandBufferResource, ImageResource, ReferenceSlot};
use crate::gop::{GopFrameType, GopPosition};
use crate::pool::PoolNode;

/// Where a frame is in its lifecycle. Stages only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum FrameStage {
    /// Raw picture written to staging resources.
    #[default]
    Loaded,
    /// Copy to the encode input submitted on the transfer queue.
    Staged,
    /// Encode order assigned.
    EncodeOrderResolved,
    /// DPB setup and reference slots assigned.
    ReferencesResolved,
    /// Encode command buffer recorded.
    CommandRecorded,
    /// Encode command buffer submitted.
    Submitted,
    /// Header and coded data written to the sink.
    BitstreamAssembled,
    /// Resources returned to their pools.
    Released,
}

/// One picture in flight, from loading to release.
pub struct FrameState {
    slot: usize,
    /// Lifecycle stage.
    pub stage: FrameStage,
    /// Position in the input stream.
    pub input_order: u64,
    /// Position in the encoded stream, set by the encode order stage.
    pub encode_order: Option<u64>,
    /// Picture type and GOP placement.
    pub gop_position: GopPosition,
    /// Final frame of the stream.
    pub is_last: bool,
    /// Input order of the past anchor this frame predicts from.
    pub forward_reference: Option<u64>,
    /// Input order of the future anchor this B-frame predicts from.
    pub backward_reference: Option<u64>,
    /// Temporal pattern position.
    pub temporal_position: usize,
    /// Temporal layer of that position.
    pub temporal_layer: u8,
    /// Control directives applied before this frame is encoded.
    pub control: ControlCommandChain,
    /// Rate control carried by this frame's begin-coding call.
    pub begin_rate_control: Option<RateControlParams>,
    pub staging: Option<PoolNode<ImageResource>>,
    pub encode_input: Option<PoolNode<ImageResource>>,
    pub qp_staging: Option<PoolNode<ImageResource>>,
    pub qp_map: Option<PoolNode<ImageResource>>,
    /// Transfer command buffer carrying the staging copies.
    pub input_command: Option<PoolNode<CommandBufferResource>>,
    /// Separate transfer command buffer for a linear quantization map.
    pub qp_command: Option<PoolNode<CommandBufferResource>>,
    pub encode_command: Option<PoolNode<CommandBufferResource>>,
    pub bitstream: Option<PoolNode<BitstreamBufferResource>>,
    /// DPB slot the reconstructed picture is written to.
    pub setup_slot: Option<ReferenceSlot>,
    /// DPB slots this frame predicts from.
    pub reference_slots: Vec<ReferenceSlot>,
    /// Non-VCL bytes written ahead of the coded picture.
    pub header: Vec<u8>,
    /// Encode feedback query used for this frame.
    pub query_slot: u32,
}

impl FrameState {
    /// Create an empty record for free-list slot `slot`.
    pub fn new(slot: usize) -> Self {
        Self {
            slot,
            stage: FrameStage::Loaded,
            input_order: 0,
            encode_order: None,
            gop_position: GopPosition::default(),
            is_last: false,
            forward_reference: None,
            backward_reference: None,
            temporal_position: 0,
            temporal_layer: 0,
            control: ControlCommandChain::default(),
            begin_rate_control: None,
            staging: None,
            encode_input: None,
            qp_staging: None,
            qp_map: None,
            input_command: None,
            qp_command: None,
            encode_command: None,
            bitstream: None,
            setup_slot: None,
            reference_slots: Vec::new(),
            header: Vec::new(),
            query_slot: 0,
        }
    }

    /// Free-list slot of this record.
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn frame_type(&self) -> GopFrameType {
        self.gop_position.frame_type
    }

    pub fn is_idr(&self) -> bool {
        self.gop_position.frame_type.is_idr()
    }

    pub fn is_intra(&self) -> bool {
        self.gop_position.frame_type.is_intra()
    }

    /// Whether later frames may predict from this one.
    pub fn is_reference(&self) -> bool {
        self.gop_position.is_reference
    }

    /// Move to `stage`. Stages never go backwards.
    pub fn advance(&mut self, stage: FrameStage) {
        debug_assert!(stage >= self.stage, "{:?} -> {:?}", self.stage, stage);
        self.stage = stage;
    }

    /// Whether the record still holds a pool node.
    pub fn holds_resources(&self) -> bool {
        self.staging.is_some()
            || self.encode_input.is_some()
            || self.qp_staging.is_some()
            || self.qp_map.is_some()
            || self.input_command.is_some()
            || self.qp_command.is_some()
            || self.encode_command.is_some()
            || self.bitstream.is_some()
    }

    fn clear(&mut self) {
        let mut reference_slots = std::mem::take(&mut self.reference_slots);
        let mut header = std::mem::take(&mut self.header);
        reference_slots.clear();
        header.clear();
        *self = Self {
            reference_slots,
            header,
            ..Self::new(self.slot)
        };
    }
}

impl fmt::Debug for FrameState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameState")
            .field("slot", &self.slot)
            .field("stage", &self.stage)
            .field("input_order", &self.input_order)
            .field("encode_order", &self.encode_order)
            .field("frame_type", &self.gop_position.frame_type)
            .field("temporal_position", &self.temporal_position)
            .field("forward_reference", &self.forward_reference)
            .field("backward_reference", &self.backward_reference)
            .field("setup_slot", &self.setup_slot.map(|slot| slot.slot_index))
            .field(
                "reference_slots",
                &self
                    .reference_slots
                    .iter()
                    .map(|slot| slot.slot_index)
                    .collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

/// Free list of frame records.
///
/// Records keep their allocations between frames; the pool never blocks
/// because the resource pools already bound the number of frames in flight.
#[derive(Default)]
pub struct FrameStatePool {
    free: Mutex<Vec<FrameState>>,
    created: Mutex<usize>,
}

impl FrameStatePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a cleared record, creating one when the free list is empty.
    pub fn acquire(&self) -> FrameState {
        if let Some(frame) = self.free.lock().pop() {
            return frame;
        }
        let mut created = self.created.lock();
        let frame = FrameState::new(*created);
        *created += 1;
        frame
    }

    /// Clear a record and put it back on the free list.
    ///
    /// Pool nodes must already be released.
    pub fn release(&self, mut frame: FrameState) {
        debug_assert!(!frame.holds_resources(), "frame {} still holds nodes", frame.input_order);
        frame.clear();
        self.free.lock().push(frame);
    }

    /// Number of records on the free list.
    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }

    /// Number of records created so far.
    pub fn created_count(&self) -> usize {
        *self.created.lock()
    }
}

/// Frames in encode order waiting for a batch boundary.
#[derive(Debug, Default)]
pub struct DeferredBatch {
    frames: Vec<FrameState>,
}

impl DeferredBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, frame: FrameState) {
        self.frames.push(frame);
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frames(&self) -> &[FrameState] {
        &self.frames
    }

    pub fn frames_mut(&mut self) -> &mut [FrameState] {
        &mut self.frames
    }

    /// Take the frames out, leaving the batch empty.
    pub fn take(&mut self) -> DeferredBatch {
        std::mem::take(self)
    }

    pub fn into_frames(self) -> Vec<FrameState> {
        self.frames
    }
}

impl From<Vec<FrameState>> for DeferredBatch {
    fn from(frames: Vec<FrameState>) -> Self {
        Self { frames }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_list_reuses_records() {
        let pool = FrameStatePool::new();
        let first = pool.acquire();
        let second = pool.acquire();
        assert_eq!((first.slot(), second.slot()), (0, 1));

        let mut first = first;
        first.input_order = 7;
        first.header.extend_from_slice(b"hdr");
        first.advance(FrameStage::Staged);
        pool.release(first);
        assert_eq!(pool.free_count(), 1);

        let reused = pool.acquire();
        assert_eq!(reused.slot(), 0);
        assert_eq!(reused.input_order, 0);
        assert_eq!(reused.stage, FrameStage::Loaded);
        assert!(reused.header.is_empty());
        assert_eq!(pool.created_count(), 2);
    }

    #[test]
    fn test_stages_are_ordered() {
        assert!(FrameStage::Loaded < FrameStage::Staged);
        assert!(FrameStage::CommandRecorded < FrameStage::Submitted);
        assert!(FrameStage::BitstreamAssembled < FrameStage::Released);
    }

    #[test]
    fn test_deferred_batch_take() {
        let mut batch = DeferredBatch::new();
        batch.push(FrameState::new(0));
        batch.push(FrameState::new(1));
        let taken = batch.take();
        assert!(batch.is_empty());
        assert_eq!(taken.len(), 2);
        assert_eq!(taken.frames()[1].slot(), 1);
    }
}
