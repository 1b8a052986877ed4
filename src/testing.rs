//! In-memory device, source and sink for unit tests.

use std::collections::{HashMap, HashSet};
use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ash::vk::{self, Handle};
use parking_lot::Mutex;

use crate::config::{Codec, RateControlParams};
use crate::control::ControlCommandChain;
use crate::device::{
    BitstreamBufferResource, CommandBufferResource, CommandKind, DeviceCapabilities,
    EncodeDevice, EncodeFeedback, ImageDescriptor, ImageResource, QueryStatus, QueueKind,
    SubmitInfo, VideoCommand,
};
use crate::error::{PipelineError, Result};
use crate::source::FrameSource;

/// Install a test log writer once per process.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Owned copy of a recorded [`VideoCommand`].
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Recorded {
    CopyImage {
        dst: vk::Image,
    },
    ResetQueries {
        first: u32,
        count: u32,
    },
    BeginCoding {
        setup: Option<i32>,
        references: Vec<u64>,
        rate_control: Option<RateControlParams>,
    },
    ControlCoding(ControlCommandChain),
    Encode {
        input_order: u64,
        encode_order: Option<u64>,
        inline_query: Option<u32>,
        bitstream: Option<vk::Buffer>,
        qp_map: Option<vk::Image>,
    },
    BeginQuery(u32),
    EndQuery(u32),
    DpbBarrier(i32),
    EndCoding,
}

impl Recorded {
    fn from_command(command: &VideoCommand<'_>) -> Self {
        match *command {
            VideoCommand::CopyImage { dst, .. } => Self::CopyImage { dst: dst.image },
            VideoCommand::ResetQueries { first, count } => Self::ResetQueries { first, count },
            VideoCommand::BeginCoding {
                setup,
                references,
                rate_control,
            } => Self::BeginCoding {
                setup: setup.map(|slot| slot.slot_index),
                references: references.iter().map(|slot| slot.input_order).collect(),
                rate_control: rate_control.copied(),
            },
            VideoCommand::ControlCoding(chain) => Self::ControlCoding(chain.clone()),
            VideoCommand::Encode {
                frame,
                inline_query,
            } => Self::Encode {
                input_order: frame.input_order,
                encode_order: frame.encode_order,
                inline_query,
                bitstream: frame.bitstream.as_ref().map(|node| node.buffer),
                qp_map: frame.qp_map.as_ref().map(|node| node.image),
            },
            VideoCommand::BeginQuery(slot) => Self::BeginQuery(slot),
            VideoCommand::EndQuery(slot) => Self::EndQuery(slot),
            VideoCommand::DpbBarrier(slot) => Self::DpbBarrier(slot.slot_index),
            VideoCommand::EndCoding => Self::EndCoding,
        }
    }

    pub(crate) fn kind(&self) -> CommandKind {
        match self {
            Self::CopyImage { .. } => CommandKind::CopyImage,
            Self::ResetQueries { .. } => CommandKind::ResetQueries,
            Self::BeginCoding { .. } => CommandKind::BeginCoding,
            Self::ControlCoding(_) => CommandKind::ControlCoding,
            Self::Encode { .. } => CommandKind::Encode,
            Self::BeginQuery(_) => CommandKind::BeginQuery,
            Self::EndQuery(_) => CommandKind::EndQuery,
            Self::DpbBarrier(_) => CommandKind::DpbBarrier,
            Self::EndCoding => CommandKind::EndCoding,
        }
    }
}

/// One queue submission seen by the mock.
#[derive(Debug, Clone)]
pub(crate) struct Submission {
    pub queue: QueueKind,
    pub wait_semaphores: usize,
    pub signals: bool,
    pub commands: Vec<Recorded>,
}

#[derive(Default)]
struct MockState {
    images: HashSet<vk::Image>,
    staging: HashMap<vk::Image, Vec<u8>>,
    buffers: HashMap<vk::Buffer, Vec<u8>>,
    command_buffers: HashSet<vk::CommandBuffer>,
    recordings: HashMap<vk::CommandBuffer, Vec<Recorded>>,
    fences: HashMap<vk::Fence, bool>,
    feedback: HashMap<u32, EncodeFeedback>,
    submissions: Vec<Submission>,
    recorded_encodes: Vec<u64>,
    incomplete_inputs: HashSet<u64>,
    /// Encode fences stay unsignalled until waited on.
    defer_encode_fences: bool,
    pending_fences: HashSet<vk::Fence>,
}

/// [`EncodeDevice`] that "encodes" a picture as `F<input>E<encode>;`.
///
/// Submissions complete synchronously: fences are signalled and feedback is
/// written inside `submit`.
pub(crate) struct MockDevice {
    capabilities: DeviceCapabilities,
    state: Mutex<MockState>,
    next_handle: AtomicU64,
}

impl MockDevice {
    pub(crate) fn new() -> Self {
        Self {
            capabilities: DeviceCapabilities {
                codecs: vec![Codec::H264, Codec::H265, Codec::AV1],
                inline_queries: true,
                quantization_map: true,
                quantization_map_linear: false,
                quantization_map_texel_size: vk::Extent2D {
                    width: 16,
                    height: 16,
                },
                max_dpb_slots: 16,
                max_active_references: 2,
                max_quality_levels: 4,
                max_b_frames: 4,
            },
            state: Mutex::new(MockState::default()),
            next_handle: AtomicU64::new(1),
        }
    }

    pub(crate) fn update_capabilities(&mut self, f: impl FnOnce(&mut DeviceCapabilities)) {
        f(&mut self.capabilities);
    }

    fn handle<H: Handle>(&self) -> H {
        H::from_raw(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    /// Make the feedback query of `input_order` report an error.
    pub(crate) fn fail_query_for(&self, input_order: u64) {
        self.state.lock().incomplete_inputs.insert(input_order);
    }

    /// Leave encode work running after submit. It finishes when its fence
    /// is waited on.
    pub(crate) fn complete_encodes_on_wait(&self) {
        self.state.lock().defer_encode_fences = true;
    }

    /// Encode fences submitted but never waited on.
    pub(crate) fn pending_fences(&self) -> usize {
        self.state.lock().pending_fences.len()
    }

    pub(crate) fn is_fence_signaled(&self, fence: vk::Fence) -> bool {
        self.state.lock().fences.get(&fence).copied().unwrap_or(false)
    }

    pub(crate) fn live_images(&self) -> usize {
        self.state.lock().images.len()
    }

    pub(crate) fn live_bitstream_buffers(&self) -> usize {
        self.state.lock().buffers.len()
    }

    pub(crate) fn live_command_buffers(&self) -> usize {
        self.state.lock().command_buffers.len()
    }

    pub(crate) fn staging_data(&self, image: &ImageResource) -> Option<Vec<u8>> {
        self.state.lock().staging.get(&image.image).cloned()
    }

    pub(crate) fn submissions(&self) -> Vec<Submission> {
        self.state.lock().submissions.clone()
    }

    /// Input orders of encode commands in the order they were recorded.
    pub(crate) fn recorded_encodes(&self) -> Vec<u64> {
        self.state.lock().recorded_encodes.clone()
    }

    /// Commands of every encode queue submission, in submission order.
    pub(crate) fn encode_submissions(&self) -> Vec<Vec<Recorded>> {
        self.state
            .lock()
            .submissions
            .iter()
            .filter(|submission| submission.queue == QueueKind::Encode)
            .map(|submission| submission.commands.clone())
            .collect()
    }
}

impl EncodeDevice for MockDevice {
    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn create_image(&self, descriptor: &ImageDescriptor) -> Result<ImageResource> {
        let image = ImageResource {
            image: self.handle(),
            view: self.handle(),
            memory: self.handle(),
            descriptor: *descriptor,
        };
        self.state.lock().images.insert(image.image);
        Ok(image)
    }

    fn destroy_image(&self, image: &ImageResource) {
        let mut state = self.state.lock();
        state.images.remove(&image.image);
        state.staging.remove(&image.image);
    }

    fn write_staging(&self, image: &ImageResource, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        if !state.images.contains(&image.image) {
            return Err(PipelineError::InvalidInput(
                "write to a destroyed staging image".to_string(),
            ));
        }
        state.staging.insert(image.image, data.to_vec());
        Ok(())
    }

    fn create_command_buffer(&self, queue: QueueKind) -> Result<CommandBufferResource> {
        let resource = CommandBufferResource {
            pool: self.handle(),
            command_buffer: self.handle(),
            fence: self.handle(),
            semaphore: self.handle(),
            queue,
        };
        let mut state = self.state.lock();
        state.command_buffers.insert(resource.command_buffer);
        state.fences.insert(resource.fence, false);
        Ok(resource)
    }

    fn destroy_command_buffer(&self, command_buffer: &CommandBufferResource) {
        let mut state = self.state.lock();
        state.command_buffers.remove(&command_buffer.command_buffer);
        state.recordings.remove(&command_buffer.command_buffer);
        state.fences.remove(&command_buffer.fence);
    }

    fn create_bitstream_buffer(&self, size: u64) -> Result<BitstreamBufferResource> {
        let resource = BitstreamBufferResource {
            buffer: self.handle(),
            memory: self.handle(),
            size,
        };
        self.state.lock().buffers.insert(resource.buffer, Vec::new());
        Ok(resource)
    }

    fn destroy_bitstream_buffer(&self, buffer: &BitstreamBufferResource) {
        self.state.lock().buffers.remove(&buffer.buffer);
    }

    fn fence_status(&self, fence: vk::Fence) -> Result<bool> {
        Ok(self.is_fence_signaled(fence))
    }

    fn wait_for_fence(&self, fence: vk::Fence, _timeout_ns: u64) -> Result<()> {
        let mut state = self.state.lock();
        if state.pending_fences.remove(&fence) {
            state.fences.insert(fence, true);
        }
        if state.fences.get(&fence).copied().unwrap_or(false) {
            Ok(())
        } else {
            Err(PipelineError::PoolTimeout(format!(
                "fence {:#x} never signalled",
                fence.as_raw()
            )))
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        self.state.lock().fences.insert(fence, false);
        Ok(())
    }

    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<()> {
        self.state.lock().recordings.insert(command_buffer, Vec::new());
        Ok(())
    }

    fn record(&self, command_buffer: vk::CommandBuffer, command: &VideoCommand<'_>) -> Result<()> {
        let recorded = Recorded::from_command(command);
        let mut state = self.state.lock();
        if let Recorded::Encode { input_order, .. } = recorded {
            state.recorded_encodes.push(input_order);
        }
        state
            .recordings
            .get_mut(&command_buffer)
            .ok_or_else(|| {
                PipelineError::CommandBuffer("recording into a buffer that was not begun".to_string())
            })?
            .push(recorded);
        Ok(())
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<()> {
        if self.state.lock().recordings.contains_key(&command_buffer) {
            Ok(())
        } else {
            Err(PipelineError::CommandBuffer(
                "ending a buffer that was not begun".to_string(),
            ))
        }
    }

    fn submit(&self, queue: QueueKind, info: &SubmitInfo) -> Result<()> {
        let mut state = self.state.lock();
        let commands = state
            .recordings
            .get(&info.command_buffer)
            .cloned()
            .unwrap_or_default();

        if queue == QueueKind::Encode {
            let mut active_query = None;
            for command in &commands {
                match command {
                    Recorded::BeginQuery(slot) => active_query = Some(*slot),
                    Recorded::EndQuery(_) => active_query = None,
                    Recorded::Encode {
                        input_order,
                        encode_order,
                        inline_query,
                        bitstream,
                        ..
                    } => {
                        let bytes = format!(
                            "F{}E{};",
                            input_order,
                            encode_order.map_or(-1, |order| order as i64)
                        )
                        .into_bytes();
                        let status = if state.incomplete_inputs.contains(input_order) {
                            QueryStatus::Error(-1)
                        } else {
                            QueryStatus::Complete
                        };
                        if let Some(slot) = inline_query.or(active_query) {
                            state.feedback.insert(
                                slot,
                                EncodeFeedback {
                                    offset: 0,
                                    bytes_written: bytes.len() as u64,
                                    status,
                                },
                            );
                        }
                        if let Some(contents) = bitstream.and_then(|b| state.buffers.get_mut(&b)) {
                            *contents = bytes;
                        }
                    }
                    _ => {}
                }
            }
        }

        if let Some(fence) = info.fence {
            if state.fences.get(&fence).copied().unwrap_or(false) {
                return Err(PipelineError::Synchronization(format!(
                    "fence {:#x} submitted while signalled",
                    fence.as_raw()
                )));
            }
            if state.defer_encode_fences && queue == QueueKind::Encode {
                state.pending_fences.insert(fence);
            } else {
                state.fences.insert(fence, true);
            }
        }

        state.submissions.push(Submission {
            queue,
            wait_semaphores: info.wait_semaphores.len(),
            signals: info.signal_semaphore.is_some(),
            commands,
        });
        Ok(())
    }

    fn encode_feedback(&self, slot: u32) -> Result<EncodeFeedback> {
        self.state.lock().feedback.get(&slot).copied().ok_or_else(|| {
            PipelineError::QueryIncomplete(format!("query {slot} was never written"))
        })
    }

    fn read_bitstream(
        &self,
        buffer: &BitstreamBufferResource,
        offset: u64,
        len: u64,
    ) -> Result<Vec<u8>> {
        let state = self.state.lock();
        let contents = state.buffers.get(&buffer.buffer).ok_or_else(|| {
            PipelineError::InvalidInput("read from a destroyed bitstream buffer".to_string())
        })?;
        let start = offset as usize;
        let end = start + len as usize;
        contents.get(start..end).map(<[u8]>::to_vec).ok_or_else(|| {
            PipelineError::InvalidInput(format!(
                "bitstream range {start}..{end} outside {} bytes",
                contents.len()
            ))
        })
    }

    fn wait_idle(&self) -> Result<()> {
        Ok(())
    }
}

/// Source that writes one marker byte per picture and remembers what it loaded.
#[derive(Clone, Default)]
pub(crate) struct PatternSource {
    pub loaded: Arc<Mutex<Vec<u64>>>,
    pub qp_maps: Arc<Mutex<Vec<u64>>>,
}

impl FrameSource for PatternSource {
    fn load_frame(
        &mut self,
        device: &dyn EncodeDevice,
        input_order: u64,
        staging: &ImageResource,
    ) -> Result<()> {
        self.loaded.lock().push(input_order);
        device.write_staging(staging, &[input_order as u8])
    }

    fn load_qp_map(
        &mut self,
        device: &dyn EncodeDevice,
        input_order: u64,
        staging: &ImageResource,
    ) -> Result<()> {
        self.qp_maps.lock().push(input_order);
        device.write_staging(staging, &[0])
    }
}

/// Cloneable in-memory sink.
#[derive(Clone, Default)]
pub(crate) struct SharedSink(pub Arc<Mutex<Vec<u8>>>);

impl SharedSink {
    pub(crate) fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
