//! Device abstraction the pipeline drives.
//!
//! [`EncodeDevice`] is the narrow surface the pipeline needs from a video
//! encode capable GPU: resource creation, fences, command recording, queue
//! submission and encode feedback. [`VulkanDevice`] implements it on top of
//! Vulkan Video.

mod resources;
mod vulkan;

pub use vulkan::{
    CodecChain, CodecPictureInfo, CodecRateControl, QuantizationMapSupport, VideoContext,
    VideoContextBuilder, VideoSessionHandles, VulkanDevice,
};

use ash::vk;

use crate::config::{Codec, PixelFormat, RateControlParams};
use crate::control::ControlCommandChain;
use crate::error::Result;
use crate::frame::FrameState;

/// Hardware queue a submission targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// Queue used for staging copies.
    Transfer,
    /// Video encode queue.
    Encode,
}

/// Device features queried once when the pipeline is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCapabilities {
    /// Codecs the device can encode.
    pub codecs: Vec<Codec>,
    /// Queries can be attached to the encode call itself.
    pub inline_queries: bool,
    /// Quantization maps are supported.
    pub quantization_map: bool,
    /// Quantization map images use linear tiling.
    pub quantization_map_linear: bool,
    /// Texel size of one quantization map entry.
    pub quantization_map_texel_size: vk::Extent2D,
    /// Maximum number of DPB slots.
    pub max_dpb_slots: u32,
    /// Maximum number of active reference pictures.
    pub max_active_references: u32,
    /// Number of encoder quality levels.
    pub max_quality_levels: u32,
    /// Longest supported run of consecutive B-frames.
    pub max_b_frames: u32,
}

/// What an image is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageRole {
    /// Host-writable linear image the source fills.
    Staging,
    /// Encoder input picture.
    EncodeInput,
    /// Reconstructed reference picture.
    Dpb,
    /// Host-writable quantization map.
    QpMapStaging,
    /// Quantization map read by the encoder.
    QpMap,
}

impl ImageRole {
    /// Whether images of this role hold a single plane.
    pub fn is_single_plane(&self) -> bool {
        matches!(self, Self::QpMapStaging | Self::QpMap)
    }
}

/// Everything needed to create one pool image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDescriptor {
    pub role: ImageRole,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub pixel_format: PixelFormat,
    pub linear: bool,
}

/// Image plus its memory and view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageResource {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub memory: vk::DeviceMemory,
    pub descriptor: ImageDescriptor,
}

/// Command buffer with the fence and semaphore signalled by its submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandBufferResource {
    pub pool: vk::CommandPool,
    pub command_buffer: vk::CommandBuffer,
    pub fence: vk::Fence,
    pub semaphore: vk::Semaphore,
    pub queue: QueueKind,
}

/// Host-visible buffer receiving encoded bitstream data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitstreamBufferResource {
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub size: u64,
}

/// A DPB slot bound to its reconstructed picture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceSlot {
    /// DPB slot index.
    pub slot_index: i32,
    /// Picture stored in the slot.
    pub image: ImageResource,
    /// Input order of the picture that owns the slot.
    pub input_order: u64,
    /// Temporal pattern position of that picture.
    pub temporal_position: usize,
}

/// One command recorded into a command buffer.
#[derive(Debug, Clone, Copy)]
pub enum VideoCommand<'a> {
    /// Copy the content of `src` into `dst`, leaving `dst` ready for encoding.
    CopyImage {
        src: &'a ImageResource,
        dst: &'a ImageResource,
        extent: vk::Extent2D,
    },
    /// Reset a range of encode feedback queries.
    ResetQueries { first: u32, count: u32 },
    /// Begin a video coding scope.
    BeginCoding {
        setup: Option<&'a ReferenceSlot>,
        references: &'a [ReferenceSlot],
        rate_control: Option<&'a RateControlParams>,
    },
    /// Apply a control chain.
    ControlCoding(&'a ControlCommandChain),
    /// Encode one picture. `inline_query` attaches the feedback query to the call.
    Encode {
        frame: &'a FrameState,
        inline_query: Option<u32>,
    },
    /// Begin an explicit feedback query.
    BeginQuery(u32),
    /// End an explicit feedback query.
    EndQuery(u32),
    /// Bring the setup slot picture into the DPB layout before coding begins.
    DpbBarrier(&'a ReferenceSlot),
    /// End the video coding scope.
    EndCoding,
}

/// Discriminant of a [`VideoCommand`], handy for logs and assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    CopyImage,
    ResetQueries,
    BeginCoding,
    ControlCoding,
    Encode,
    BeginQuery,
    EndQuery,
    DpbBarrier,
    EndCoding,
}

impl VideoCommand<'_> {
    /// Kind of this command.
    pub fn kind(&self) -> CommandKind {
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

/// A queue submission of one command buffer.
#[derive(Debug, Clone, Default)]
pub struct SubmitInfo {
    pub command_buffer: vk::CommandBuffer,
    pub wait_semaphores: Vec<vk::Semaphore>,
    pub signal_semaphore: Option<vk::Semaphore>,
    pub fence: Option<vk::Fence>,
}

/// Completion status of an encode feedback query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    Complete,
    NotReady,
    Error(i32),
}

impl From<vk::QueryResultStatusKHR> for QueryStatus {
    fn from(status: vk::QueryResultStatusKHR) -> Self {
        match status {
            vk::QueryResultStatusKHR::COMPLETE => Self::Complete,
            vk::QueryResultStatusKHR::NOT_READY => Self::NotReady,
            other => Self::Error(other.as_raw()),
        }
    }
}

/// Encode feedback for one picture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeFeedback {
    /// Offset of the coded data in the bitstream buffer.
    pub offset: u64,
    /// Number of coded bytes.
    pub bytes_written: u64,
    pub status: QueryStatus,
}

/// Operations the pipeline needs from the GPU.
///
/// Implementations must be safe to call from the producer thread and the
/// consumer thread at the same time; submissions to one queue are serialized
/// by the implementation.
pub trait EncodeDevice: Send + Sync {
    /// Capabilities for the configured profile.
    fn capabilities(&self) -> &DeviceCapabilities;

    fn create_image(&self, descriptor: &ImageDescriptor) -> Result<ImageResource>;
    fn destroy_image(&self, image: &ImageResource);

    /// Copy tightly packed plane data into a host-visible staging image.
    fn write_staging(&self, image: &ImageResource, data: &[u8]) -> Result<()>;

    /// Create a command buffer with an unsignalled fence and a semaphore.
    fn create_command_buffer(&self, queue: QueueKind) -> Result<CommandBufferResource>;
    fn destroy_command_buffer(&self, command_buffer: &CommandBufferResource);

    fn create_bitstream_buffer(&self, size: u64) -> Result<BitstreamBufferResource>;
    fn destroy_bitstream_buffer(&self, buffer: &BitstreamBufferResource);

    /// Whether `fence` is signalled.
    fn fence_status(&self, fence: vk::Fence) -> Result<bool>;

    /// Block until `fence` is signalled, failing with
    /// [`PoolTimeout`](crate::PipelineError::PoolTimeout) after `timeout_ns`.
    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<()>;

    fn reset_fence(&self, fence: vk::Fence) -> Result<()>;

    /// Reset and begin recording a one-time-submit command buffer.
    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<()>;

    fn record(&self, command_buffer: vk::CommandBuffer, command: &VideoCommand<'_>) -> Result<()>;

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<()>;

    fn submit(&self, queue: QueueKind, info: &SubmitInfo) -> Result<()>;

    /// Read the feedback of query `slot`, waiting for it to become available.
    fn encode_feedback(&self, slot: u32) -> Result<EncodeFeedback>;

    /// Copy `len` bytes at `offset` out of a bitstream buffer.
    fn read_bitstream(
        &self,
        buffer: &BitstreamBufferResource,
        offset: u64,
        len: u64,
    ) -> Result<Vec<u8>>;

    /// Wait until every queue is idle.
    fn wait_idle(&self) -> Result<()>;
}
