//! Per-frame stage work.
//!
//! Loading and staging run on the producer side, in input order. Everything
//! after the reorder buffer runs inside a batch driver, in encode order.

use std::collections::HashMap;
use std::io::Write;

use ash::vk;
use tracing::{debug, trace, warn};

use super::batch::{Stage, StageRunner};
use super::PipelineShared;
use crate::device::{QueryStatus, QueueKind, SubmitInfo, VideoCommand};
use crate::error::{PipelineError, Result};
use crate::frame::{DeferredBatch, FrameStage, FrameState};
use crate::references::ReferenceManager;
use crate::temporal::TemporalLayers;

/// Consumer-side state. Exactly one batch runs against it at a time.
pub(crate) struct StageState {
    encode_counter: u64,
    /// Encode order of reference frames still reachable by later frames.
    resolved: HashMap<u64, u64>,
    temporal: TemporalLayers,
    references: Box<dyn ReferenceManager>,
    sink: Box<dyn Write + Send>,
}

impl StageState {
    pub(crate) fn new(
        temporal: TemporalLayers,
        references: Box<dyn ReferenceManager>,
        sink: Box<dyn Write + Send>,
    ) -> Self {
        Self {
            encode_counter: 0,
            resolved: HashMap::new(),
            temporal,
            references,
            sink,
        }
    }

    pub(crate) fn flush_sink(&mut self) -> Result<()> {
        self.sink.flush()?;
        Ok(())
    }
}

impl PipelineShared {
    /// Copy the staged picture into an encode input image on the transfer
    /// queue, and attach pending control directives.
    pub(crate) fn stage_frame(&self, frame: &mut FrameState) -> Result<()> {
        let staging = *frame.staging.as_deref().ok_or_else(|| {
            PipelineError::InvalidInput(format!("frame {} was not loaded", frame.input_order))
        })?;

        let encode_input = self.pools.encode_input.acquire()?;
        let extent = encode_input.descriptor.extent;
        frame.encode_input = Some(encode_input);
        let input_command = self.pools.input_commands.acquire()?;
        let command_buffer = input_command.command_buffer;
        let semaphore = input_command.semaphore;
        let fence = input_command.fence;
        frame.input_command = Some(input_command);

        let device = &*self.device;
        device.begin_command_buffer(command_buffer)?;
        if let Some(dst) = frame.encode_input.as_deref() {
            device.record(
                command_buffer,
                &VideoCommand::CopyImage {
                    src: &staging,
                    dst,
                    extent,
                },
            )?;
        }

        if let Some(qp_staging) = frame.qp_staging.as_deref().copied() {
            let qp_pool = self.pools.qp_map.as_ref().ok_or_else(|| {
                PipelineError::InvalidInput("quantization map is not enabled".to_string())
            })?;
            frame.qp_map = Some(qp_pool.acquire()?);
            let qp_map = frame.qp_map.as_deref().copied();

            match (&self.pools.qp_commands, qp_map) {
                // Linear maps go through a submission of their own.
                (Some(qp_commands), Some(qp_map)) => {
                    let qp_command = qp_commands.acquire()?;
                    let qp_buffer = qp_command.command_buffer;
                    let qp_semaphore = qp_command.semaphore;
                    let qp_fence = qp_command.fence;
                    frame.qp_command = Some(qp_command);

                    device.begin_command_buffer(qp_buffer)?;
                    device.record(
                        qp_buffer,
                        &VideoCommand::CopyImage {
                            src: &qp_staging,
                            dst: &qp_map,
                            extent: qp_map.descriptor.extent,
                        },
                    )?;
                    device.end_command_buffer(qp_buffer)?;
                    device.submit(
                        QueueKind::Transfer,
                        &SubmitInfo {
                            command_buffer: qp_buffer,
                            wait_semaphores: Vec::new(),
                            signal_semaphore: Some(qp_semaphore),
                            fence: Some(qp_fence),
                        },
                    )?;
                    if let Some(node) = frame.qp_command.as_ref() {
                        qp_commands.mark_submitted(node);
                    }
                }
                (None, Some(qp_map)) => {
                    device.record(
                        command_buffer,
                        &VideoCommand::CopyImage {
                            src: &qp_staging,
                            dst: &qp_map,
                            extent: qp_map.descriptor.extent,
                        },
                    )?;
                }
                (_, None) => {}
            }
        }

        device.end_command_buffer(command_buffer)?;
        device.submit(
            QueueKind::Transfer,
            &SubmitInfo {
                command_buffer,
                wait_semaphores: Vec::new(),
                signal_semaphore: Some(semaphore),
                fence: Some(fence),
            },
        )?;
        if let Some(node) = frame.input_command.as_ref() {
            self.pools.input_commands.mark_submitted(node);
        }

        if self.control.lock().build_for(frame) {
            debug!(
                input_order = frame.input_order,
                commands = ?frame.control.commands(),
                "Attached control commands"
            );
        }

        frame.advance(FrameStage::Staged);
        Ok(())
    }

    /// Run the consumer-side stages over a batch, then release its frames.
    pub(crate) fn process_batch(&self, mut batch: DeferredBatch) -> Result<()> {
        let result = {
            let mut state = self.stage.lock();
            let mut context = StageContext {
                shared: self,
                state: &mut *state,
            };
            let result = self.driver.drive(batch.frames_mut(), &mut context);
            result.and_then(|()| state.flush_sink())
        };
        self.release_batch(batch);
        result
    }

    pub(crate) fn release_batch(&self, batch: DeferredBatch) {
        for frame in batch.into_frames() {
            self.release_frame(frame);
        }
    }

    /// Return every node the frame holds to its pool and recycle the record.
    ///
    /// GPU work the frame still has queued is waited out first, so the
    /// resources go back to their pools idle.
    pub(crate) fn release_frame(&self, mut frame: FrameState) {
        self.settle_frame(&frame);
        let pools = &self.pools;
        if let Some(node) = frame.staging.take() {
            pools.staging.release(node);
        }
        if let Some(node) = frame.encode_input.take() {
            pools.encode_input.release(node);
        }
        if let Some(node) = frame.qp_staging.take() {
            if let Some(pool) = &pools.qp_staging {
                pool.release(node);
            }
        }
        if let Some(node) = frame.qp_map.take() {
            if let Some(pool) = &pools.qp_map {
                pool.release(node);
            }
        }
        if let Some(node) = frame.input_command.take() {
            pools.input_commands.release(node);
        }
        if let Some(node) = frame.qp_command.take() {
            if let Some(pool) = &pools.qp_commands {
                pool.release(node);
            }
        }
        if let Some(node) = frame.encode_command.take() {
            pools.encode_commands.release(node);
        }
        if let Some(node) = frame.bitstream.take() {
            pools.bitstream.release(node);
        }
        trace!(input_order = frame.input_order, stage = ?frame.stage, "Released frame");
        frame.advance(FrameStage::Released);
        self.frames.release(frame);
    }
}

impl PipelineShared {
    /// Wait for the submissions the frame made that nothing has waited on yet.
    ///
    /// An assembled frame already waited on its encode fence. A submitted one
    /// only needs its encode fence, since the encode waited on the transfer
    /// semaphores. A staged one still has its transfer work.
    fn settle_frame(&self, frame: &FrameState) {
        let fences: Vec<vk::Fence> = match frame.stage {
            FrameStage::Loaded | FrameStage::BitstreamAssembled | FrameStage::Released => {
                Vec::new()
            }
            FrameStage::Submitted => frame.encode_command.iter().map(|node| node.fence).collect(),
            FrameStage::Staged
            | FrameStage::EncodeOrderResolved
            | FrameStage::ReferencesResolved
            | FrameStage::CommandRecorded => frame
                .input_command
                .iter()
                .chain(frame.qp_command.iter())
                .map(|node| node.fence)
                .collect(),
        };

        for fence in fences {
            if let Err(err) = self.device.wait_for_fence(fence, self.fence_timeout_ns) {
                warn!(
                    input_order = frame.input_order,
                    stage = ?frame.stage,
                    "Frame work did not finish ({}), waiting for the device",
                    err
                );
                if let Err(err) = self.device.wait_idle() {
                    warn!("Device did not go idle: {}", err);
                }
                return;
            }
        }
    }
}

/// A batch in progress: shared pools plus the locked consumer state.
struct StageContext<'a> {
    shared: &'a PipelineShared,
    state: &'a mut StageState,
}

impl StageRunner for StageContext<'_> {
    fn run(&mut self, stage: Stage, frame: &mut FrameState) -> Result<()> {
        match stage {
            Stage::ResolveEncodeOrder => self.resolve_encode_order(frame)?,
            Stage::ResolveReferences => self.resolve_references(frame)?,
            Stage::RecordCommands => self.record_commands(frame)?,
            Stage::Submit => self.submit(frame)?,
            Stage::AssembleBitstream => self.assemble_bitstream(frame)?,
        }
        frame.advance(stage.frame_stage());
        Ok(())
    }
}

impl StageContext<'_> {
    fn resolve_encode_order(&mut self, frame: &mut FrameState) -> Result<()> {
        let encode_order = self.state.encode_counter;
        if frame.is_idr() {
            self.state.resolved.clear();
        }

        for reference in [frame.forward_reference, frame.backward_reference]
            .into_iter()
            .flatten()
        {
            match self.state.resolved.get(&reference) {
                Some(&order) if order < encode_order => {}
                _ => {
                    return Err(PipelineError::ReferenceOrder(format!(
                        "frame {} (encode order {}) references frame {} which is not encoded yet",
                        frame.input_order, encode_order, reference
                    )))
                }
            }
        }

        frame.encode_order = Some(encode_order);
        self.state.encode_counter += 1;
        if frame.is_reference() {
            // Later frames never look past this anchor's own reference.
            if let Some(oldest) = frame.forward_reference {
                self.state.resolved.retain(|&input, _| input >= oldest);
            }
            self.state.resolved.insert(frame.input_order, encode_order);
        }

        frame.temporal_position = self.state.temporal.advance(frame.is_intra());
        frame.temporal_layer = self
            .state
            .temporal
            .layer_of(frame.temporal_position)
            .unwrap_or_default();
        self.shared.control.lock().apply_begin_state(frame);

        trace!(
            input_order = frame.input_order,
            encode_order,
            frame_type = ?frame.frame_type(),
            temporal_position = frame.temporal_position,
            "Resolved encode order"
        );
        Ok(())
    }

    fn resolve_references(&mut self, frame: &mut FrameState) -> Result<()> {
        let assignment = self.state.references.assign(frame, &self.state.temporal)?;
        frame.setup_slot = assignment.setup_slot;
        frame.reference_slots = assignment.reference_slots;
        frame.header = assignment.header;
        Ok(())
    }

    fn record_commands(&mut self, frame: &mut FrameState) -> Result<()> {
        let shared = self.shared;
        let query_slot = frame
            .encode_input
            .as_ref()
            .map(|node| node.index() as u32)
            .ok_or_else(|| {
                PipelineError::CommandBuffer(format!(
                    "frame {} has no encode input image",
                    frame.input_order
                ))
            })?;
        frame.query_slot = query_slot;
        frame.bitstream = Some(shared.pools.bitstream.acquire()?);
        let encode_command = shared.pools.encode_commands.acquire()?;
        let command_buffer = encode_command.command_buffer;
        frame.encode_command = Some(encode_command);

        let frame: &FrameState = frame;
        let device = &*shared.device;
        device.begin_command_buffer(command_buffer)?;
        device.record(
            command_buffer,
            &VideoCommand::ResetQueries {
                first: query_slot,
                count: 1,
            },
        )?;
        if let Some(setup) = frame.setup_slot.as_ref() {
            device.record(command_buffer, &VideoCommand::DpbBarrier(setup))?;
        }
        device.record(
            command_buffer,
            &VideoCommand::BeginCoding {
                setup: frame.setup_slot.as_ref(),
                references: &frame.reference_slots,
                rate_control: frame.begin_rate_control.as_ref(),
            },
        )?;
        if !frame.control.is_empty() {
            device.record(command_buffer, &VideoCommand::ControlCoding(&frame.control))?;
        }
        if shared.inline_queries {
            device.record(
                command_buffer,
                &VideoCommand::Encode {
                    frame,
                    inline_query: Some(query_slot),
                },
            )?;
        } else {
            device.record(command_buffer, &VideoCommand::BeginQuery(query_slot))?;
            device.record(
                command_buffer,
                &VideoCommand::Encode {
                    frame,
                    inline_query: None,
                },
            )?;
            device.record(command_buffer, &VideoCommand::EndQuery(query_slot))?;
        }
        device.record(command_buffer, &VideoCommand::EndCoding)?;
        device.end_command_buffer(command_buffer)
    }

    fn submit(&mut self, frame: &mut FrameState) -> Result<()> {
        let shared = self.shared;
        let encode_command = frame.encode_command.as_ref().ok_or_else(|| {
            PipelineError::Submission(format!("frame {} was not recorded", frame.input_order))
        })?;

        if shared.device.fence_status(encode_command.fence)? {
            return Err(PipelineError::Synchronization(format!(
                "encode fence of frame {} is already signalled",
                frame.input_order
            )));
        }

        let wait_semaphores = frame
            .input_command
            .iter()
            .chain(frame.qp_command.iter())
            .map(|node| node.semaphore)
            .collect();
        shared.device.submit(
            QueueKind::Encode,
            &SubmitInfo {
                command_buffer: encode_command.command_buffer,
                wait_semaphores,
                signal_semaphore: None,
                fence: Some(encode_command.fence),
            },
        )?;
        shared.pools.encode_commands.mark_submitted(encode_command);
        shared.record_submitted();
        Ok(())
    }

    fn assemble_bitstream(&mut self, frame: &mut FrameState) -> Result<()> {
        let shared = self.shared;
        let (Some(encode_command), Some(bitstream)) =
            (frame.encode_command.as_ref(), frame.bitstream.as_ref())
        else {
            return Err(PipelineError::InvalidInput(format!(
                "frame {} was not submitted",
                frame.input_order
            )));
        };

        shared
            .device
            .wait_for_fence(encode_command.fence, shared.fence_timeout_ns)?;
        let feedback = shared.device.encode_feedback(frame.query_slot)?;
        if feedback.status != QueryStatus::Complete {
            return Err(PipelineError::QueryIncomplete(format!(
                "frame {} (encode order {:?}) finished with {:?}",
                frame.input_order, frame.encode_order, feedback.status
            )));
        }
        if feedback.offset + feedback.bytes_written >= bitstream.size {
            warn!(
                input_order = frame.input_order,
                "Bitstream buffer of {} bytes filled up, growing new buffers",
                bitstream.size
            );
            shared.pools.bitstream.raise_high_water(&(bitstream.size * 2));
        }

        let data = shared
            .device
            .read_bitstream(bitstream, feedback.offset, feedback.bytes_written)?;
        self.state.sink.write_all(&frame.header)?;
        self.state.sink.write_all(&data)?;
        shared.record_assembled();

        trace!(
            input_order = frame.input_order,
            encode_order = ?frame.encode_order,
            bytes = data.len() + frame.header.len(),
            "Assembled bitstream"
        );
        Ok(())
    }
}
