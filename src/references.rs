//! DPB slot and reference picture assignment.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::config::{video_format, PipelineConfig};
use crate::device::{EncodeDevice, ImageDescriptor, ImageResource, ImageRole, ReferenceSlot};
use crate::error::{PipelineError, Result};
use crate::frame::FrameState;
use crate::temporal::TemporalLayers;

/// Slots and header bytes for one frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferenceAssignment {
    /// Slot the reconstructed picture is written to, if it is kept.
    pub setup_slot: Option<ReferenceSlot>,
    /// Slots the frame predicts from.
    pub reference_slots: Vec<ReferenceSlot>,
    /// Non-VCL bytes written ahead of the frame.
    pub header: Vec<u8>,
}

/// Decides which DPB slots a frame reads and writes.
///
/// Frames are presented in encode order.
pub trait ReferenceManager: Send {
    fn assign(&mut self, frame: &FrameState, temporal: &TemporalLayers)
        -> Result<ReferenceAssignment>;
}

#[derive(Debug, Clone, Copy)]
struct DpbEntry {
    input_order: u64,
    temporal_position: usize,
    last_used: u64,
}

/// Reference manager that keeps the most recently used reference pictures.
///
/// The manager owns one DPB image per slot. IDR frames empty the DPB; a
/// reference frame takes a free slot or evicts the least recently used
/// picture it does not itself read from.
pub struct SlidingWindowReferences {
    device: Arc<dyn EncodeDevice>,
    images: Vec<ImageResource>,
    entries: Vec<Option<DpbEntry>>,
    max_active_references: usize,
    parameter_sets: Vec<u8>,
    clock: u64,
}

impl SlidingWindowReferences {
    /// Create the DPB images for `config`.
    ///
    /// `parameter_sets` is written ahead of every IDR frame.
    pub fn new(
        device: Arc<dyn EncodeDevice>,
        config: &PipelineConfig,
        parameter_sets: Vec<u8>,
    ) -> Result<Self> {
        let capabilities = device.capabilities();
        let wanted = if config.consecutive_b_frames > 0 { 3 } else { 2 }
            + if config.temporal_layer_count > 1 { 1 } else { 0 };
        let slot_count = wanted.min(capabilities.max_dpb_slots);
        if slot_count < 2 {
            return Err(PipelineError::Capability(format!(
                "device reports max_dpb_slots={}; need at least 2",
                capabilities.max_dpb_slots
            )));
        }
        let max_active_references = capabilities.max_active_references.max(1) as usize;

        let descriptor = ImageDescriptor {
            role: ImageRole::Dpb,
            format: video_format(config.pixel_format, config.bit_depth),
            extent: config.dimensions.into(),
            pixel_format: config.pixel_format,
            linear: false,
        };

        let mut references = Self {
            device,
            images: Vec::with_capacity(slot_count as usize),
            entries: vec![None; slot_count as usize],
            max_active_references,
            parameter_sets,
            clock: 0,
        };
        for _ in 0..slot_count {
            // On error, drop destroys the images created so far.
            let image = references.device.create_image(&descriptor)?;
            references.images.push(image);
        }

        debug!(
            "DPB: {} slots, {} active references",
            slot_count, max_active_references
        );
        Ok(references)
    }

    /// Number of DPB slots.
    pub fn slot_count(&self) -> usize {
        self.images.len()
    }

    fn slot(&self, index: usize, entry: &DpbEntry) -> ReferenceSlot {
        ReferenceSlot {
            slot_index: index as i32,
            image: self.images[index],
            input_order: entry.input_order,
            temporal_position: entry.temporal_position,
        }
    }

    /// Slot holding `input_order`, if it is legal to read from `position`.
    fn find_legal(
        &self,
        input_order: u64,
        position: usize,
        temporal: &TemporalLayers,
    ) -> Option<usize> {
        self.entries.iter().position(|entry| {
            entry.is_some_and(|entry| {
                entry.input_order == input_order
                    && temporal.can_reference(position, entry.temporal_position)
            })
        })
    }

    /// Most recent picture before `input_order` that `position` may read.
    fn most_recent_legal(
        &self,
        input_order: u64,
        position: usize,
        temporal: &TemporalLayers,
    ) -> Option<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| entry.map(|entry| (index, entry)))
            .filter(|(_, entry)| {
                entry.input_order < input_order
                    && temporal.can_reference(position, entry.temporal_position)
            })
            .max_by_key(|(_, entry)| entry.input_order)
            .map(|(index, _)| index)
    }

    fn pick_setup_slot(&self, references: &[usize]) -> Option<usize> {
        if let Some(free) = self.entries.iter().position(Option::is_none) {
            return Some(free);
        }
        self.entries
            .iter()
            .enumerate()
            .filter(|(index, _)| !references.contains(index))
            .filter_map(|(index, entry)| entry.map(|entry| (index, entry.last_used)))
            .min_by_key(|(_, last_used)| *last_used)
            .map(|(index, _)| index)
    }
}

impl ReferenceManager for SlidingWindowReferences {
    fn assign(
        &mut self,
        frame: &FrameState,
        temporal: &TemporalLayers,
    ) -> Result<ReferenceAssignment> {
        self.clock += 1;
        if frame.is_idr() {
            self.entries.iter_mut().for_each(|entry| *entry = None);
        }

        let mut references: Vec<usize> = Vec::new();
        if !frame.is_intra() {
            let position = frame.temporal_position;
            for hint in [frame.forward_reference, frame.backward_reference]
                .into_iter()
                .flatten()
            {
                if let Some(index) = self.find_legal(hint, position, temporal) {
                    if !references.contains(&index) {
                        references.push(index);
                    }
                }
            }
            if references.is_empty() {
                if let Some(index) = self.most_recent_legal(frame.input_order, position, temporal) {
                    references.push(index);
                }
            }
            if references.is_empty() {
                return Err(PipelineError::ReferenceOrder(format!(
                    "no legal reference in the DPB for frame {} at temporal position {}",
                    frame.input_order, position
                )));
            }
            references.truncate(self.max_active_references);
        }

        let mut reference_slots = Vec::with_capacity(references.len());
        for &index in &references {
            if let Some(entry) = self.entries[index].as_mut() {
                entry.last_used = self.clock;
                let entry = *entry;
                reference_slots.push(self.slot(index, &entry));
            }
        }

        let setup_slot = if frame.is_reference()
            && temporal.can_be_referenced(frame.temporal_position)
        {
            let index = self.pick_setup_slot(&references).ok_or_else(|| {
                PipelineError::ReferenceOrder(format!(
                    "no DPB slot available for frame {}",
                    frame.input_order
                ))
            })?;
            let entry = DpbEntry {
                input_order: frame.input_order,
                temporal_position: frame.temporal_position,
                last_used: self.clock,
            };
            self.entries[index] = Some(entry);
            Some(self.slot(index, &entry))
        } else {
            None
        };

        trace!(
            input_order = frame.input_order,
            setup = ?setup_slot.map(|slot: ReferenceSlot| slot.slot_index),
            references = ?references,
            "Assigned DPB slots"
        );

        Ok(ReferenceAssignment {
            setup_slot,
            reference_slots,
            header: if frame.is_idr() {
                self.parameter_sets.clone()
            } else {
                Vec::new()
            },
        })
    }
}

impl Drop for SlidingWindowReferences {
    fn drop(&mut self) {
        for image in self.images.drain(..) {
            self.device.destroy_image(&image);
        }
    }
}
