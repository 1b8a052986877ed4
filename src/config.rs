//! Pipeline configuration and shared encoder types.

use std::time::Duration;

use ash::vk;

use crate::error::{PipelineError, Result};

/// Default number of input images (and therefore frames) in flight.
pub const DEFAULT_INPUT_IMAGES_IN_FLIGHT: u32 = 8;

/// Default GOP size in frames.
pub const DEFAULT_GOP_FRAME_COUNT: u32 = 16;

/// Default size of one bitstream buffer (2 MiB).
pub const DEFAULT_BITSTREAM_BUFFER_SIZE: u64 = 2 * 1024 * 1024;

/// Default number of bitstream buffers created up front.
pub const DEFAULT_BITSTREAM_PREALLOCATE: u32 = 4;

/// Default timeout for any fence or pool wait.
pub const DEFAULT_FENCE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default target bitrate in bits per second (4 Mbps).
pub const DEFAULT_TARGET_BITRATE: u32 = 4_000_000;

/// Default maximum bitrate in bits per second (6 Mbps).
pub const DEFAULT_MAX_BITRATE: u32 = 6_000_000;

/// Video codec types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    /// H.264/AVC codec.
    H264,
    /// H.265/HEVC codec.
    H265,
    /// AV1 codec.
    AV1,
}

impl Codec {
    /// The Vulkan codec operation used for encode sessions of this codec.
    pub fn encode_operation(&self) -> vk::VideoCodecOperationFlagsKHR {
        match self {
            Codec::H264 => vk::VideoCodecOperationFlagsKHR::ENCODE_H264,
            Codec::H265 => vk::VideoCodecOperationFlagsKHR::ENCODE_H265,
            Codec::AV1 => vk::VideoCodecOperationFlagsKHR::ENCODE_AV1,
        }
    }
}

/// Pixel format / chroma subsampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PixelFormat {
    /// YUV 4:2:0.
    #[default]
    Yuv420,
    /// YUV 4:4:4.
    Yuv444,
}

impl PixelFormat {
    /// Size of each chroma plane for a picture of `extent`.
    pub fn chroma_extent(&self, extent: vk::Extent2D) -> vk::Extent2D {
        match self {
            PixelFormat::Yuv420 => vk::Extent2D {
                width: extent.width.div_ceil(2),
                height: extent.height.div_ceil(2),
            },
            PixelFormat::Yuv444 => extent,
        }
    }
}

impl From<PixelFormat> for vk::VideoChromaSubsamplingFlagsKHR {
    fn from(format: PixelFormat) -> Self {
        match format {
            PixelFormat::Yuv420 => vk::VideoChromaSubsamplingFlagsKHR::TYPE_420,
            PixelFormat::Yuv444 => vk::VideoChromaSubsamplingFlagsKHR::TYPE_444,
        }
    }
}

/// Bit depth for video encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BitDepth {
    /// 8-bit per component.
    #[default]
    Eight,
    /// 10-bit per component.
    Ten,
}

impl From<BitDepth> for vk::VideoComponentBitDepthFlagsKHR {
    fn from(depth: BitDepth) -> Self {
        match depth {
            BitDepth::Eight => vk::VideoComponentBitDepthFlagsKHR::TYPE_8,
            BitDepth::Ten => vk::VideoComponentBitDepthFlagsKHR::TYPE_10,
        }
    }
}

/// Get the Vulkan format for the encode input and DPB images.
pub fn video_format(pixel_format: PixelFormat, bit_depth: BitDepth) -> vk::Format {
    match (pixel_format, bit_depth) {
        (PixelFormat::Yuv420, BitDepth::Eight) => vk::Format::G8_B8R8_2PLANE_420_UNORM,
        (PixelFormat::Yuv420, BitDepth::Ten) => {
            vk::Format::G10X6_B10X6R10X6_2PLANE_420_UNORM_3PACK16
        }
        (PixelFormat::Yuv444, BitDepth::Eight) => vk::Format::G8_B8R8_2PLANE_444_UNORM,
        (PixelFormat::Yuv444, BitDepth::Ten) => {
            vk::Format::G10X6_B10X6R10X6_2PLANE_444_UNORM_3PACK16
        }
    }
}

/// Rate control modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RateControlMode {
    /// Driver default rate control.
    #[default]
    Default,
    /// Rate control disabled, constant QP.
    Disabled,
    /// Constant bitrate.
    Cbr,
    /// Variable bitrate.
    Vbr,
}

impl From<RateControlMode> for vk::VideoEncodeRateControlModeFlagsKHR {
    fn from(mode: RateControlMode) -> Self {
        match mode {
            RateControlMode::Default => vk::VideoEncodeRateControlModeFlagsKHR::DEFAULT,
            RateControlMode::Disabled => vk::VideoEncodeRateControlModeFlagsKHR::DISABLED,
            RateControlMode::Cbr => vk::VideoEncodeRateControlModeFlagsKHR::CBR,
            RateControlMode::Vbr => vk::VideoEncodeRateControlModeFlagsKHR::VBR,
        }
    }
}

/// Rate control parameters carried by a rate-control directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateControlParams {
    /// Rate control mode.
    pub mode: RateControlMode,
    /// Average bitrate in bits per second.
    pub average_bitrate: u32,
    /// Peak bitrate in bits per second.
    pub max_bitrate: u32,
    /// Frame rate numerator.
    pub frame_rate_numerator: u32,
    /// Frame rate denominator.
    pub frame_rate_denominator: u32,
    /// Number of rate control layers (one per temporal layer).
    pub layer_count: u32,
    /// Leaky bucket size in milliseconds.
    pub virtual_buffer_size_ms: u32,
    /// Initial leaky bucket fullness in milliseconds.
    pub initial_virtual_buffer_size_ms: u32,
}

impl Default for RateControlParams {
    fn default() -> Self {
        Self {
            mode: RateControlMode::Default,
            average_bitrate: DEFAULT_TARGET_BITRATE,
            max_bitrate: DEFAULT_MAX_BITRATE,
            frame_rate_numerator: 30,
            frame_rate_denominator: 1,
            layer_count: 1,
            virtual_buffer_size_ms: 1000,
            initial_virtual_buffer_size_ms: 1000,
        }
    }
}

/// How a quantization map is interpreted by the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpMapMode {
    /// Per-region QP delta.
    DeltaQp,
    /// Per-region emphasis.
    Emphasis,
}

impl QpMapMode {
    /// Image format of a map in this mode.
    pub fn format(&self) -> vk::Format {
        match self {
            QpMapMode::DeltaQp => vk::Format::R8_SINT,
            QpMapMode::Emphasis => vk::Format::R8_UNORM,
        }
    }
}

/// Video dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl From<Dimensions> for vk::Extent2D {
    fn from(d: Dimensions) -> Self {
        vk::Extent2D {
            width: d.width,
            height: d.height,
        }
    }
}

/// Pipeline configuration.
#[derive(Debug, Clone)]
#[must_use]
pub struct PipelineConfig {
    /// Video codec to use.
    pub codec: Codec,
    /// Coded picture dimensions.
    pub dimensions: Dimensions,
    /// Pixel format (chroma subsampling).
    pub pixel_format: PixelFormat,
    /// Bit depth per component.
    pub bit_depth: BitDepth,
    /// Total number of frames the run will encode.
    pub total_frames: u64,
    /// Frames per GOP; also the deferred batch boundary.
    pub gop_frame_count: u32,
    /// Distance between IDR frames (0 means every GOP starts with an IDR).
    pub idr_period: u32,
    /// Number of consecutive B-frames between anchors.
    pub consecutive_b_frames: u32,
    /// Number of temporal layers, 1 or 3.
    pub temporal_layer_count: u32,
    /// Encoder quality level sent with the first frame.
    pub quality_level: u32,
    /// Rate control sent with the first frame.
    pub rate_control: RateControlParams,
    /// Quantization map mode, `None` when disabled.
    pub qp_map: Option<QpMapMode>,
    /// Process batches on a dedicated consumer thread.
    pub async_processing: bool,
    /// Record encode command buffers in reverse order (testing only).
    pub out_of_order_recording: bool,
    /// Size of the fixed image and command buffer pools.
    pub num_input_images_in_flight: u32,
    /// Bitstream buffers created at initialization.
    pub bitstream_buffer_preallocate_count: u32,
    /// Hard cap of the growable bitstream buffer pool.
    pub max_bitstream_buffers: u32,
    /// Size of each bitstream buffer in bytes.
    pub bitstream_buffer_size: u64,
    /// Upper bound for fence and pool waits.
    pub fence_timeout: Duration,
}

impl PipelineConfig {
    /// Create a configuration for the given codec and size with default settings.
    pub fn new(codec: Codec, width: u32, height: u32) -> Self {
        Self {
            codec,
            dimensions: Dimensions { width, height },
            pixel_format: PixelFormat::Yuv420,
            bit_depth: BitDepth::Eight,
            total_frames: 0,
            gop_frame_count: DEFAULT_GOP_FRAME_COUNT,
            idr_period: 0,
            consecutive_b_frames: 0,
            temporal_layer_count: 1,
            quality_level: 0,
            rate_control: RateControlParams::default(),
            qp_map: None,
            async_processing: false,
            out_of_order_recording: false,
            num_input_images_in_flight: DEFAULT_INPUT_IMAGES_IN_FLIGHT,
            bitstream_buffer_preallocate_count: DEFAULT_BITSTREAM_PREALLOCATE,
            max_bitstream_buffers: DEFAULT_INPUT_IMAGES_IN_FLIGHT * 2,
            bitstream_buffer_size: DEFAULT_BITSTREAM_BUFFER_SIZE,
            fence_timeout: DEFAULT_FENCE_TIMEOUT,
        }
    }

    /// Create an H.264 configuration.
    pub fn h264(width: u32, height: u32) -> Self {
        Self::new(Codec::H264, width, height)
    }

    /// Create an H.265 configuration.
    pub fn h265(width: u32, height: u32) -> Self {
        Self::new(Codec::H265, width, height)
    }

    /// Create an AV1 configuration.
    pub fn av1(width: u32, height: u32) -> Self {
        Self::new(Codec::AV1, width, height)
    }

    /// Set the total number of frames to encode.
    pub fn with_total_frames(mut self, frames: u64) -> Self {
        self.total_frames = frames;
        self
    }

    /// Set the GOP frame count.
    pub fn with_gop_frame_count(mut self, count: u32) -> Self {
        self.gop_frame_count = count;
        self
    }

    /// Set the IDR period.
    pub fn with_idr_period(mut self, period: u32) -> Self {
        self.idr_period = period;
        self
    }

    /// Set the number of consecutive B-frames.
    pub fn with_b_frames(mut self, count: u32) -> Self {
        self.consecutive_b_frames = count;
        self
    }

    /// Set the temporal layer count (1 or 3).
    pub fn with_temporal_layers(mut self, count: u32) -> Self {
        self.temporal_layer_count = count;
        self
    }

    /// Set the encoder quality level.
    pub fn with_quality_level(mut self, level: u32) -> Self {
        self.quality_level = level;
        self
    }

    /// Set the rate control parameters.
    pub fn with_rate_control(mut self, params: RateControlParams) -> Self {
        self.rate_control = params;
        self
    }

    /// Enable a quantization map.
    pub fn with_qp_map(mut self, mode: QpMapMode) -> Self {
        self.qp_map = Some(mode);
        self
    }

    /// Set the pixel format.
    pub fn with_pixel_format(mut self, format: PixelFormat) -> Self {
        self.pixel_format = format;
        self
    }

    /// Set the bit depth.
    pub fn with_bit_depth(mut self, depth: BitDepth) -> Self {
        self.bit_depth = depth;
        self
    }

    /// Process batches on a consumer thread.
    pub fn with_async_processing(mut self, enable: bool) -> Self {
        self.async_processing = enable;
        self
    }

    /// Record encode command buffers in reverse order. Testing only.
    pub fn with_out_of_order_recording(mut self, enable: bool) -> Self {
        self.out_of_order_recording = enable;
        self
    }

    /// Set the number of input images in flight.
    ///
    /// A bitstream pool cap still at its default follows at twice `count`,
    /// since every frame of a batch holds a bitstream buffer.
    pub fn with_input_images_in_flight(mut self, count: u32) -> Self {
        if self.max_bitstream_buffers == self.num_input_images_in_flight.saturating_mul(2) {
            self.max_bitstream_buffers = count.saturating_mul(2);
            self.bitstream_buffer_preallocate_count = self
                .bitstream_buffer_preallocate_count
                .min(self.max_bitstream_buffers);
        }
        self.num_input_images_in_flight = count;
        self
    }

    /// Set how many bitstream buffers are created up front and the pool cap.
    pub fn with_bitstream_buffers(mut self, preallocate: u32, max: u32) -> Self {
        self.bitstream_buffer_preallocate_count = preallocate;
        self.max_bitstream_buffers = max;
        self
    }

    /// Set the bitstream buffer size in bytes.
    pub fn with_bitstream_buffer_size(mut self, size: u64) -> Self {
        self.bitstream_buffer_size = size;
        self
    }

    /// Set the fence wait timeout.
    pub fn with_fence_timeout(mut self, timeout: Duration) -> Self {
        self.fence_timeout = timeout;
        self
    }

    /// Capacity of the async batch queue.
    pub fn max_pending_batches(&self) -> usize {
        const MAX_PENDING_BATCHES: u32 = 2;
        (self.gop_frame_count + 1).min(MAX_PENDING_BATCHES) as usize
    }

    /// Fence timeout in nanoseconds, as Vulkan expects it.
    pub fn fence_timeout_ns(&self) -> u64 {
        u64::try_from(self.fence_timeout.as_nanos()).unwrap_or(u64::MAX)
    }

    /// Check the configuration for values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.dimensions.width == 0 || self.dimensions.height == 0 {
            return Err(PipelineError::InvalidInput(format!(
                "dimensions must be non-zero, got {}x{}",
                self.dimensions.width, self.dimensions.height
            )));
        }
        if self.total_frames == 0 {
            return Err(PipelineError::InvalidInput(
                "total_frames must be at least 1".to_string(),
            ));
        }
        if self.gop_frame_count == 0 {
            return Err(PipelineError::InvalidInput(
                "gop_frame_count must be at least 1".to_string(),
            ));
        }
        if !matches!(self.temporal_layer_count, 1 | 3) {
            return Err(PipelineError::InvalidInput(format!(
                "temporal_layer_count must be 1 or 3, got {}",
                self.temporal_layer_count
            )));
        }
        if self.num_input_images_in_flight == 0 {
            return Err(PipelineError::InvalidInput(
                "num_input_images_in_flight must be at least 1".to_string(),
            ));
        }
        if self.consecutive_b_frames + 1 > self.num_input_images_in_flight {
            return Err(PipelineError::InvalidInput(format!(
                "{} consecutive B-frames need more than {} input images in flight",
                self.consecutive_b_frames, self.num_input_images_in_flight
            )));
        }
        if self.max_bitstream_buffers == 0
            || self.bitstream_buffer_preallocate_count > self.max_bitstream_buffers
        {
            return Err(PipelineError::InvalidInput(format!(
                "bitstream buffer preallocation {} exceeds the pool cap {}",
                self.bitstream_buffer_preallocate_count, self.max_bitstream_buffers
            )));
        }
        if self.max_bitstream_buffers < self.num_input_images_in_flight {
            return Err(PipelineError::InvalidInput(format!(
                "bitstream buffer cap {} is below the {} input images in flight",
                self.max_bitstream_buffers, self.num_input_images_in_flight
            )));
        }
        if self.bitstream_buffer_size == 0 {
            return Err(PipelineError::InvalidInput(
                "bitstream_buffer_size must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> PipelineConfig {
        PipelineConfig::h264(320, 240).with_total_frames(10)
    }

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::h265(1920, 1080);
        assert_eq!(config.codec, Codec::H265);
        assert_eq!(config.temporal_layer_count, 1);
        assert!(!config.async_processing);
        assert!(!config.out_of_order_recording);
        assert_eq!(config.num_input_images_in_flight, DEFAULT_INPUT_IMAGES_IN_FLIGHT);
    }

    #[test]
    fn test_validate_accepts_defaults() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_layer_count() {
        let err = valid().with_temporal_layers(2).validate().unwrap_err();
        assert!(matches!(err, PipelineError::InvalidInput(_)));
    }

    #[test]
    fn test_validate_rejects_zero_frames() {
        assert!(PipelineConfig::h264(320, 240).validate().is_err());
    }

    #[test]
    fn test_validate_rejects_preallocate_over_cap() {
        assert!(valid().with_bitstream_buffers(5, 4).validate().is_err());
    }

    #[test]
    fn test_validate_rejects_b_run_larger_than_pool() {
        let config = valid().with_input_images_in_flight(3);
        assert!(config.clone().with_b_frames(2).validate().is_ok());
        assert!(config.with_b_frames(3).validate().is_err());
    }

    #[test]
    fn test_bitstream_cap_follows_images_in_flight() {
        let config = valid().with_input_images_in_flight(20);
        assert_eq!(config.max_bitstream_buffers, 40);
        assert!(config.validate().is_ok());

        let config = valid().with_input_images_in_flight(1);
        assert_eq!(config.max_bitstream_buffers, 2);
        assert_eq!(config.bitstream_buffer_preallocate_count, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_explicit_bitstream_cap_is_kept() {
        let config = valid()
            .with_bitstream_buffers(2, 12)
            .with_input_images_in_flight(10);
        assert_eq!(config.max_bitstream_buffers, 12);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bitstream_cap_below_images_in_flight() {
        let err = valid()
            .with_input_images_in_flight(12)
            .with_bitstream_buffers(4, 10)
            .validate()
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidInput(_)));
    }

    #[test]
    fn test_max_pending_batches() {
        assert_eq!(valid().with_gop_frame_count(30).max_pending_batches(), 2);
        assert_eq!(valid().with_gop_frame_count(0).max_pending_batches(), 1);
    }

    #[test]
    fn test_rate_control_mode_conversion() {
        let mode: vk::VideoEncodeRateControlModeFlagsKHR = RateControlMode::Cbr.into();
        assert_eq!(mode, vk::VideoEncodeRateControlModeFlagsKHR::CBR);
    }
}
