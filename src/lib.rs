//! Frame-encode pipeline for Vulkan Video hardware encoders.
//!
//! The crate moves raw pictures through a fixed sequence of stages: load
//! into staging images, copy to encode inputs on the transfer queue, decide
//! encode order and DPB references, record and submit encode command
//! buffers, and write the coded bytes to a sink. GPU resources come from
//! reusable pools, B-frames are reordered ahead of submission, and batches
//! can be processed on a consumer thread while the producer keeps loading.
//!
//! The entry point is [`EncodePipeline`]. It talks to the GPU through the
//! [`EncodeDevice`] trait; [`VulkanDevice`] implements it on top of an
//! existing Vulkan Video encode session.

pub mod config;
pub mod control;
pub mod device;
pub mod error;
pub mod frame;
pub mod gop;
pub mod pipeline;
pub mod pool;
pub mod references;
pub mod reorder;
pub mod source;
pub mod temporal;

#[cfg(test)]
mod testing;

pub use config::{
    BitDepth, Codec, Dimensions, PipelineConfig, PixelFormat, QpMapMode, RateControlMode,
    RateControlParams,
};
pub use control::{ControlCoalescer, ControlCommand, ControlCommandChain};
pub use device::{
    CodecChain, CodecPictureInfo, CodecRateControl, DeviceCapabilities, EncodeDevice,
    QuantizationMapSupport, QueueKind, VideoContext, VideoContextBuilder, VideoSessionHandles,
    VulkanDevice,
};
pub use error::{PipelineError, Result};
pub use frame::{DeferredBatch, FrameStage, FrameState};
pub use gop::{GopFrameType, GopPosition, GopStructure};
pub use pipeline::{BatchDriver, BoundedQueue, EncodePipeline, PushError, Stage, StageRunner};
pub use pool::{PoolNode, PoolResource, ResourcePool};
pub use references::{ReferenceAssignment, ReferenceManager, SlidingWindowReferences};
pub use reorder::FrameReorderBuffer;
pub use source::{FrameSource, RawLayout, RawYuvSource};
pub use temporal::TemporalLayers;
