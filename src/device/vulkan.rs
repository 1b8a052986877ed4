//! Vulkan Video implementation of [`EncodeDevice`].
//!
//! Note: Vulkan p_next chaining requires creating default structs and then assigning p_next,
//! which triggers clippy::field_reassign_with_default. This is the correct pattern for Vulkan.
#![allow(clippy::field_reassign_with_default)]

use std::collections::HashSet;
use std::ffi::c_void;
use std::ptr;
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::resources::{self, quantization_map};
use super::{
    BitstreamBufferResource, CommandBufferResource, DeviceCapabilities, EncodeDevice,
    EncodeFeedback, ImageDescriptor, ImageResource, QueryStatus, QueueKind, SubmitInfo,
    VideoCommand,
};
use crate::config::{
    BitDepth, Codec, PipelineConfig, PixelFormat, QpMapMode, RateControlMode, RateControlParams,
};
use crate::control::ControlCommandChain;
use crate::error::{PipelineError, Result};
use crate::frame::FrameState;

/// Builder for a [`VideoContext`] wrapping an already created device.
///
/// Instance and device creation, extension selection and queue family
/// discovery stay with the application; the builder only collects the handles.
#[must_use]
pub struct VideoContextBuilder {
    entry: ash::Entry,
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    encode_queue: (u32, u32),
    transfer_queue: Option<(u32, u32)>,
}

impl VideoContextBuilder {
    /// Start from the application's handles. The context takes ownership of
    /// `instance` and `device` and destroys them when the last clone drops.
    pub fn new(
        entry: ash::Entry,
        instance: ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: ash::Device,
    ) -> Self {
        Self {
            entry,
            instance,
            physical_device,
            device,
            encode_queue: (0, 0),
            transfer_queue: None,
        }
    }

    /// Queue family and index of the video encode queue.
    pub fn encode_queue(mut self, family: u32, index: u32) -> Self {
        self.encode_queue = (family, index);
        self
    }

    /// Queue family and index of the transfer queue. Defaults to the encode queue.
    pub fn transfer_queue(mut self, family: u32, index: u32) -> Self {
        self.transfer_queue = Some((family, index));
        self
    }

    /// Build the VideoContext.
    pub fn build(self) -> VideoContext {
        let (encode_family, encode_index) = self.encode_queue;
        let (transfer_family, transfer_index) = self.transfer_queue.unwrap_or(self.encode_queue);

        let encode_queue = unsafe { self.device.get_device_queue(encode_family, encode_index) };
        let transfer_queue =
            unsafe { self.device.get_device_queue(transfer_family, transfer_index) };
        let memory_properties = unsafe {
            self.instance
                .get_physical_device_memory_properties(self.physical_device)
        };

        debug!(
            "Video context: encode queue family {}, transfer queue family {}",
            encode_family, transfer_family
        );

        VideoContext {
            inner: Arc::new(VideoContextInner {
                entry: self.entry,
                instance: self.instance,
                physical_device: self.physical_device,
                device: self.device,
                encode_queue_family: encode_family,
                encode_queue,
                transfer_queue_family: transfer_family,
                transfer_queue,
                memory_properties,
            }),
        }
    }
}

/// Inner struct holding the actual Vulkan resources.
struct VideoContextInner {
    entry: ash::Entry,
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    encode_queue_family: u32,
    encode_queue: vk::Queue,
    transfer_queue_family: u32,
    transfer_queue: vk::Queue,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
}

impl Drop for VideoContextInner {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// Holds the Vulkan context for video operations.
///
/// This type is cheaply cloneable - clones share the same underlying Vulkan resources.
#[derive(Clone)]
pub struct VideoContext {
    inner: Arc<VideoContextInner>,
}

impl VideoContext {
    /// Get the Vulkan entry point.
    pub fn entry(&self) -> &ash::Entry {
        &self.inner.entry
    }

    /// Get the Vulkan instance.
    pub fn instance(&self) -> &ash::Instance {
        &self.inner.instance
    }

    /// Get the physical device.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.inner.physical_device
    }

    /// Get the Vulkan device.
    pub fn device(&self) -> &ash::Device {
        &self.inner.device
    }

    pub(crate) fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.inner.memory_properties
    }

    pub(crate) fn queue_family(&self, queue: QueueKind) -> u32 {
        match queue {
            QueueKind::Transfer => self.inner.transfer_queue_family,
            QueueKind::Encode => self.inner.encode_queue_family,
        }
    }

    pub(crate) fn queue(&self, queue: QueueKind) -> vk::Queue {
        match queue {
            QueueKind::Transfer => self.inner.transfer_queue,
            QueueKind::Encode => self.inner.encode_queue,
        }
    }
}

/// Video session and session parameters created by the application.
///
/// Ownership moves to the [`VulkanDevice`], which destroys the objects (and
/// the memory bound to the session) on drop.
#[derive(Debug, Clone, Default)]
pub struct VideoSessionHandles {
    pub session: vk::VideoSessionKHR,
    pub parameters: vk::VideoSessionParametersKHR,
    pub memory: Vec<vk::DeviceMemory>,
    /// The session was created with `VK_VIDEO_SESSION_CREATE_INLINE_QUERIES_BIT_KHR`.
    pub inline_queries: bool,
}

/// Codec specific structures for one encode call.
///
/// Pointers must stay valid for the duration of the callback they are passed
/// to. `reference_slots` is parallel to the frame's reference slots.
pub struct CodecChain {
    /// Codec picture info chained into the encode info.
    pub picture: *const c_void,
    /// Codec DPB slot info of the setup slot.
    pub setup_slot: *const c_void,
    /// Codec DPB slot info of each reference slot.
    pub reference_slots: Vec<*const c_void>,
}

impl Default for CodecChain {
    fn default() -> Self {
        Self {
            picture: ptr::null(),
            setup_slot: ptr::null(),
            reference_slots: Vec::new(),
        }
    }
}

/// Codec specific rate control structures.
pub struct CodecRateControl {
    /// Chained into the rate control info.
    pub info: *const c_void,
    /// Chained into each rate control layer, parallel to the layers.
    pub layers: Vec<*const c_void>,
}

impl Default for CodecRateControl {
    fn default() -> Self {
        Self {
            info: ptr::null(),
            layers: Vec::new(),
        }
    }
}

/// Quantization map support reported by the codec layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuantizationMapSupport {
    pub linear: bool,
    pub texel_size: vk::Extent2D,
}

/// Codec layer hook that supplies the codec specific parts of encode calls.
///
/// Slice headers, picture order counts and parameter sets are codec business;
/// the device only chains what the hook hands over. The quantization map and
/// its encode flag are added by the device.
pub trait CodecPictureInfo: Send + Sync {
    /// Build the codec structures for `frame` and pass them to `record`.
    fn with_picture_info(&self, frame: &FrameState, record: &mut dyn FnMut(&CodecChain));

    /// Build codec rate control structures for `params`.
    fn with_rate_control_info(
        &self,
        _params: &RateControlParams,
        record: &mut dyn FnMut(&CodecRateControl),
    ) {
        record(&CodecRateControl::default());
    }

    /// Longest run of consecutive B-frames the codec profile supports.
    fn max_consecutive_b_frames(&self) -> u32 {
        0
    }

    /// Quantization map support, `None` when unavailable.
    fn quantization_map(&self) -> Option<QuantizationMapSupport> {
        None
    }
}

/// Build the video profile for a codec and call `f` with it.
///
/// The codec profile struct lives on the stack for the duration of `f`.
fn with_profile<R>(
    codec: Codec,
    pixel_format: PixelFormat,
    bit_depth: BitDepth,
    f: impl FnOnce(&vk::VideoProfileInfoKHR) -> R,
) -> R {
    let mut profile_info = vk::VideoProfileInfoKHR::default()
        .video_codec_operation(codec.encode_operation())
        .chroma_subsampling(pixel_format.into())
        .luma_bit_depth(bit_depth.into())
        .chroma_bit_depth(bit_depth.into());

    match codec {
        Codec::H264 => {
            let profile_idc = match pixel_format {
                PixelFormat::Yuv444 => {
                    ash::vk::native::StdVideoH264ProfileIdc_STD_VIDEO_H264_PROFILE_IDC_HIGH_444_PREDICTIVE
                }
                PixelFormat::Yuv420 => {
                    ash::vk::native::StdVideoH264ProfileIdc_STD_VIDEO_H264_PROFILE_IDC_HIGH
                }
            };
            let mut h264_profile =
                vk::VideoEncodeH264ProfileInfoKHR::default().std_profile_idc(profile_idc);
            profile_info.p_next =
                (&mut h264_profile as *mut vk::VideoEncodeH264ProfileInfoKHR).cast();
            f(&profile_info)
        }
        Codec::H265 => {
            let profile_idc = match (pixel_format, bit_depth) {
                (PixelFormat::Yuv420, BitDepth::Eight) => {
                    ash::vk::native::StdVideoH265ProfileIdc_STD_VIDEO_H265_PROFILE_IDC_MAIN
                }
                (PixelFormat::Yuv420, BitDepth::Ten) => {
                    ash::vk::native::StdVideoH265ProfileIdc_STD_VIDEO_H265_PROFILE_IDC_MAIN_10
                }
                (PixelFormat::Yuv444, _) => {
                    ash::vk::native::StdVideoH265ProfileIdc_STD_VIDEO_H265_PROFILE_IDC_FORMAT_RANGE_EXTENSIONS
                }
            };
            let mut h265_profile =
                vk::VideoEncodeH265ProfileInfoKHR::default().std_profile_idc(profile_idc);
            profile_info.p_next =
                (&mut h265_profile as *mut vk::VideoEncodeH265ProfileInfoKHR).cast();
            f(&profile_info)
        }
        Codec::AV1 => {
            let std_profile = match pixel_format {
                PixelFormat::Yuv420 => ash::vk::native::StdVideoAV1Profile_STD_VIDEO_AV1_PROFILE_MAIN,
                PixelFormat::Yuv444 => ash::vk::native::StdVideoAV1Profile_STD_VIDEO_AV1_PROFILE_HIGH,
            };
            let mut av1_profile =
                vk::VideoEncodeAV1ProfileInfoKHR::default().std_profile(std_profile);
            profile_info.p_next =
                (&mut av1_profile as *mut vk::VideoEncodeAV1ProfileInfoKHR).cast();
            f(&profile_info)
        }
    }
}

/// Capabilities the pipeline reads, copied out of the query structures.
struct QueriedCapabilities {
    max_dpb_slots: u32,
    max_active_references: u32,
    max_quality_levels: u32,
}

fn query_capabilities(
    context: &VideoContext,
    codec: Codec,
    profile_info: &vk::VideoProfileInfoKHR,
) -> std::result::Result<QueriedCapabilities, vk::Result> {
    let video_queue = ash::khr::video_queue::Instance::new(context.entry(), context.instance());

    let mut h264_capabilities = vk::VideoEncodeH264CapabilitiesKHR::default();
    let mut h265_capabilities = vk::VideoEncodeH265CapabilitiesKHR::default();
    let mut av1_capabilities = vk::VideoEncodeAV1CapabilitiesKHR::default();

    let mut encode_capabilities = vk::VideoEncodeCapabilitiesKHR::default();
    encode_capabilities.p_next = match codec {
        Codec::H264 => (&mut h264_capabilities as *mut vk::VideoEncodeH264CapabilitiesKHR).cast(),
        Codec::H265 => (&mut h265_capabilities as *mut vk::VideoEncodeH265CapabilitiesKHR).cast(),
        Codec::AV1 => (&mut av1_capabilities as *mut vk::VideoEncodeAV1CapabilitiesKHR).cast(),
    };
    let mut capabilities = vk::VideoCapabilitiesKHR::default();
    capabilities.p_next =
        (&mut encode_capabilities as *mut vk::VideoEncodeCapabilitiesKHR).cast();

    let result = unsafe {
        (video_queue.fp().get_physical_device_video_capabilities_khr)(
            context.physical_device(),
            profile_info,
            &mut capabilities,
        )
    };
    if result != vk::Result::SUCCESS {
        return Err(result);
    }

    debug!(
        "{:?} encode supported: max {}x{}, {} DPB slots, {} quality levels",
        codec,
        capabilities.max_coded_extent.width,
        capabilities.max_coded_extent.height,
        capabilities.max_dpb_slots,
        encode_capabilities.max_quality_levels
    );

    Ok(QueriedCapabilities {
        max_dpb_slots: capabilities.max_dpb_slots,
        max_active_references: capabilities.max_active_reference_pictures,
        max_quality_levels: encode_capabilities.max_quality_levels,
    })
}

/// Feedback layout requested from the query pool.
#[repr(C)]
#[derive(Default, Clone, Copy)]
struct FeedbackResult {
    offset: u32,
    bytes_written: u32,
    status: i32,
}

/// [`EncodeDevice`] backed by a Vulkan Video encode session.
pub struct VulkanDevice {
    context: VideoContext,
    codec: Codec,
    pixel_format: PixelFormat,
    bit_depth: BitDepth,
    coded_extent: vk::Extent2D,
    qp_map: Option<QpMapMode>,
    session: VideoSessionHandles,
    codec_info: Box<dyn CodecPictureInfo>,
    video_queue_fn: ash::khr::video_queue::Device,
    video_encode_fn: ash::khr::video_encode_queue::Device,
    query_pool: vk::QueryPool,
    capabilities: DeviceCapabilities,
    encode_queue_lock: Mutex<()>,
    transfer_queue_lock: Mutex<()>,
    // DPB images that already left the undefined layout.
    initialized_dpb_images: Mutex<HashSet<vk::Image>>,
}

impl VulkanDevice {
    /// Wrap an encode session created for `config`.
    ///
    /// Queries the profile capabilities and creates one encode feedback query
    /// per input image in flight. With a quantization map configured the
    /// session must allow that map kind, and its parameters must carry the
    /// map texel size.
    pub fn new(
        context: VideoContext,
        session: VideoSessionHandles,
        codec_info: Box<dyn CodecPictureInfo>,
        config: &PipelineConfig,
    ) -> Result<Self> {
        let video_queue_fn = ash::khr::video_queue::Device::new(context.instance(), context.device());
        let video_encode_fn =
            ash::khr::video_encode_queue::Device::new(context.instance(), context.device());

        let queried = with_profile(config.codec, config.pixel_format, config.bit_depth, |profile| {
            query_capabilities(&context, config.codec, profile)
        });
        let (codecs, queried) = match queried {
            Ok(queried) => (vec![config.codec], queried),
            Err(vk::Result::ERROR_VIDEO_PROFILE_CODEC_NOT_SUPPORTED_KHR) => {
                debug!("{:?} encode not supported on this device", config.codec);
                (
                    Vec::new(),
                    QueriedCapabilities {
                        max_dpb_slots: 0,
                        max_active_references: 0,
                        max_quality_levels: 0,
                    },
                )
            }
            Err(err) => {
                return Err(PipelineError::Capability(format!(
                    "failed to query {:?} encode capabilities: {:?}",
                    config.codec, err
                )))
            }
        };

        let quantization_map = codec_info.quantization_map();
        let capabilities = DeviceCapabilities {
            codecs,
            inline_queries: session.inline_queries,
            quantization_map: quantization_map.is_some(),
            quantization_map_linear: quantization_map.is_some_and(|support| support.linear),
            quantization_map_texel_size: quantization_map
                .map(|support| support.texel_size)
                .unwrap_or_default(),
            max_dpb_slots: queried.max_dpb_slots,
            max_active_references: queried.max_active_references,
            max_quality_levels: queried.max_quality_levels,
            max_b_frames: codec_info.max_consecutive_b_frames(),
        };

        let query_pool = with_profile(config.codec, config.pixel_format, config.bit_depth, |profile| {
            let mut profile_info_query = *profile;
            let mut encode_feedback_create = vk::QueryPoolVideoEncodeFeedbackCreateInfoKHR::default()
                .encode_feedback_flags(
                    vk::VideoEncodeFeedbackFlagsKHR::BITSTREAM_BUFFER_OFFSET
                        | vk::VideoEncodeFeedbackFlagsKHR::BITSTREAM_BYTES_WRITTEN,
                );
            encode_feedback_create.p_next =
                (&mut profile_info_query as *mut vk::VideoProfileInfoKHR).cast();

            let mut query_pool_create_info = vk::QueryPoolCreateInfo::default()
                .query_type(vk::QueryType::VIDEO_ENCODE_FEEDBACK_KHR)
                .query_count(config.num_input_images_in_flight);
            query_pool_create_info.p_next = (&mut encode_feedback_create
                as *mut vk::QueryPoolVideoEncodeFeedbackCreateInfoKHR)
                .cast();

            unsafe {
                context
                    .device()
                    .create_query_pool(&query_pool_create_info, None)
            }
        })
        .map_err(|e| PipelineError::ResourceCreation(format!("query pool: {}", e)))?;

        info!(
            "Vulkan encode device ready: {:?} {}x{}, {} DPB slots, inline queries {}",
            config.codec,
            config.dimensions.width,
            config.dimensions.height,
            capabilities.max_dpb_slots,
            capabilities.inline_queries
        );

        Ok(Self {
            context,
            codec: config.codec,
            pixel_format: config.pixel_format,
            bit_depth: config.bit_depth,
            coded_extent: config.dimensions.into(),
            qp_map: config.qp_map,
            session,
            codec_info,
            video_queue_fn,
            video_encode_fn,
            query_pool,
            capabilities,
            encode_queue_lock: Mutex::new(()),
            transfer_queue_lock: Mutex::new(()),
            initialized_dpb_images: Mutex::new(HashSet::new()),
        })
    }

    /// The shared Vulkan context.
    pub fn context(&self) -> &VideoContext {
        &self.context
    }

    fn with_profile<R>(&self, f: impl FnOnce(&vk::VideoProfileInfoKHR) -> R) -> R {
        with_profile(self.codec, self.pixel_format, self.bit_depth, f)
    }

    fn picture_resource(&self, view: vk::ImageView) -> vk::VideoPictureResourceInfoKHR<'static> {
        vk::VideoPictureResourceInfoKHR::default()
            .coded_offset(vk::Offset2D { x: 0, y: 0 })
            .coded_extent(self.coded_extent)
            .base_array_layer(0)
            .image_view_binding(view)
    }

    /// Build the rate control info for `params` and call `f` with it.
    fn with_rate_control(
        &self,
        params: &RateControlParams,
        f: &mut dyn FnMut(&mut vk::VideoEncodeRateControlInfoKHR),
    ) {
        self.codec_info.with_rate_control_info(params, &mut |codec| {
            let layer_count = if params.mode == RateControlMode::Disabled {
                0
            } else {
                params.layer_count as usize
            };
            let layers: Vec<_> = (0..layer_count)
                .map(|index| {
                    let mut layer = vk::VideoEncodeRateControlLayerInfoKHR::default()
                        .average_bitrate(u64::from(params.average_bitrate))
                        .max_bitrate(u64::from(params.max_bitrate))
                        .frame_rate_numerator(params.frame_rate_numerator)
                        .frame_rate_denominator(params.frame_rate_denominator);
                    layer.p_next = codec.layers.get(index).copied().unwrap_or(ptr::null());
                    layer
                })
                .collect();

            let mut rc_info =
                vk::VideoEncodeRateControlInfoKHR::default().rate_control_mode(params.mode.into());
            if !layers.is_empty() {
                rc_info = rc_info
                    .layers(&layers)
                    .virtual_buffer_size_in_ms(params.virtual_buffer_size_ms)
                    .initial_virtual_buffer_size_in_ms(params.initial_virtual_buffer_size_ms);
            }
            rc_info.p_next = codec.info;
            f(&mut rc_info);
        });
    }

    fn record_begin_coding(
        &self,
        command_buffer: vk::CommandBuffer,
        setup: Option<&super::ReferenceSlot>,
        references: &[super::ReferenceSlot],
        rate_control: Option<&RateControlParams>,
    ) {
        // The setup slot joins the begin info as inactive (slot index -1).
        let resources: Vec<_> = setup
            .into_iter()
            .chain(references)
            .map(|slot| self.picture_resource(slot.image.view))
            .collect();
        let mut slots = Vec::with_capacity(resources.len());
        let mut resources_iter = resources.iter();
        if setup.is_some() {
            if let Some(resource) = resources_iter.next() {
                slots.push(
                    vk::VideoReferenceSlotInfoKHR::default()
                        .slot_index(-1)
                        .picture_resource(resource),
                );
            }
        }
        for (slot, resource) in references.iter().zip(resources_iter) {
            slots.push(
                vk::VideoReferenceSlotInfoKHR::default()
                    .slot_index(slot.slot_index)
                    .picture_resource(resource),
            );
        }

        let mut record = |rc_info: Option<&mut vk::VideoEncodeRateControlInfoKHR>| {
            let mut begin_info = vk::VideoBeginCodingInfoKHR::default()
                .video_session(self.session.session)
                .video_session_parameters(self.session.parameters)
                .reference_slots(&slots);
            if let Some(rc_info) = rc_info {
                begin_info.p_next = (rc_info as *mut vk::VideoEncodeRateControlInfoKHR).cast();
            }
            unsafe {
                (self.video_queue_fn.fp().cmd_begin_video_coding_khr)(command_buffer, &begin_info);
            }
        };

        match rate_control {
            Some(params) => self.with_rate_control(params, &mut |rc_info| record(Some(rc_info))),
            None => record(None),
        }
    }

    fn record_control(&self, command_buffer: vk::CommandBuffer, chain: &ControlCommandChain) {
        let mut record = |rc_info: Option<&mut vk::VideoEncodeRateControlInfoKHR>| {
            let mut quality_info = vk::VideoEncodeQualityLevelInfoKHR::default()
                .quality_level(chain.quality_level().unwrap_or_default());
            let mut control_info = vk::VideoCodingControlInfoKHR::default().flags(chain.flags());

            // control -> quality level -> rate control -> codec rate control
            let rc_ptr: *mut c_void = match rc_info {
                Some(rc_info) => (rc_info as *mut vk::VideoEncodeRateControlInfoKHR).cast(),
                None => ptr::null_mut(),
            };
            if chain.quality_level().is_some() {
                quality_info.p_next = rc_ptr;
                control_info.p_next =
                    (&mut quality_info as *mut vk::VideoEncodeQualityLevelInfoKHR).cast();
            } else {
                control_info.p_next = rc_ptr;
            }

            unsafe {
                (self.video_queue_fn.fp().cmd_control_video_coding_khr)(
                    command_buffer,
                    &control_info,
                );
            }
        };

        match chain.rate_control() {
            Some(params) => self.with_rate_control(params, &mut |rc_info| record(Some(rc_info))),
            None => record(None),
        }
    }

    fn record_encode(
        &self,
        command_buffer: vk::CommandBuffer,
        frame: &FrameState,
        inline_query: Option<u32>,
    ) -> Result<()> {
        let input = frame.encode_input.as_ref().ok_or_else(|| {
            PipelineError::CommandBuffer("frame has no encode input image".to_string())
        })?;
        let bitstream = frame.bitstream.as_ref().ok_or_else(|| {
            PipelineError::CommandBuffer("frame has no bitstream buffer".to_string())
        })?;

        let src_picture_resource = self.picture_resource(input.view);
        let setup_resource = frame
            .setup_slot
            .as_ref()
            .map(|slot| self.picture_resource(slot.image.view));
        let reference_resources: Vec<_> = frame
            .reference_slots
            .iter()
            .map(|slot| self.picture_resource(slot.image.view))
            .collect();
        let qp_map = self.qp_map.zip(frame.qp_map.as_deref()).map(|(mode, map)| {
            (
                quantization_map::encode_flags(mode),
                quantization_map::QuantizationMapInfo::new(map),
            )
        });

        self.codec_info.with_picture_info(frame, &mut |chain| {
            let setup_slot = frame.setup_slot.as_ref().zip(setup_resource.as_ref()).map(
                |(slot, resource)| {
                    let mut info = vk::VideoReferenceSlotInfoKHR::default()
                        .slot_index(slot.slot_index)
                        .picture_resource(resource);
                    info.p_next = chain.setup_slot;
                    info
                },
            );
            let reference_slots: Vec<_> = frame
                .reference_slots
                .iter()
                .zip(&reference_resources)
                .enumerate()
                .map(|(index, (slot, resource))| {
                    let mut info = vk::VideoReferenceSlotInfoKHR::default()
                        .slot_index(slot.slot_index)
                        .picture_resource(resource);
                    info.p_next = chain
                        .reference_slots
                        .get(index)
                        .copied()
                        .unwrap_or(ptr::null());
                    info
                })
                .collect();

            let mut encode_info = vk::VideoEncodeInfoKHR::default()
                .dst_buffer(bitstream.buffer)
                .dst_buffer_offset(0)
                .dst_buffer_range(bitstream.size)
                .src_picture_resource(src_picture_resource)
                .reference_slots(&reference_slots);
            if let Some(setup_slot) = setup_slot.as_ref() {
                encode_info = encode_info.setup_reference_slot(setup_slot);
            }

            // encode -> inline query -> quantization map -> codec picture info
            let mut next = chain.picture;
            let mut qp_map_info = None;
            if let Some((flags, info)) = qp_map {
                encode_info = encode_info.flags(flags);
                qp_map_info = Some(info);
            }
            if let Some(info) = qp_map_info.as_mut() {
                info.p_next = next;
                next = (info as *const quantization_map::QuantizationMapInfo).cast();
            }
            let mut inline_query_info = vk::VideoInlineQueryInfoKHR::default()
                .query_pool(self.query_pool)
                .first_query(inline_query.unwrap_or_default())
                .query_count(1);
            if inline_query.is_some() {
                inline_query_info.p_next = next;
                next = (&inline_query_info as *const vk::VideoInlineQueryInfoKHR).cast();
            }
            encode_info.p_next = next;

            unsafe {
                (self.video_encode_fn.fp().cmd_encode_video_khr)(command_buffer, &encode_info);
            }
        });

        Ok(())
    }

    fn queue_lock(&self, queue: QueueKind) -> &Mutex<()> {
        match queue {
            QueueKind::Transfer => &self.transfer_queue_lock,
            QueueKind::Encode => &self.encode_queue_lock,
        }
    }
}

impl EncodeDevice for VulkanDevice {
    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn create_image(&self, descriptor: &ImageDescriptor) -> Result<ImageResource> {
        self.with_profile(|profile| resources::create_image(&self.context, descriptor, profile))
    }

    fn destroy_image(&self, image: &ImageResource) {
        self.initialized_dpb_images.lock().remove(&image.image);
        resources::destroy_image(&self.context, image);
    }

    fn write_staging(&self, image: &ImageResource, data: &[u8]) -> Result<()> {
        resources::write_planes(&self.context, image, data)
    }

    fn create_command_buffer(&self, queue: QueueKind) -> Result<CommandBufferResource> {
        resources::create_command_buffer(&self.context, queue)
    }

    fn destroy_command_buffer(&self, command_buffer: &CommandBufferResource) {
        resources::destroy_command_buffer(&self.context, command_buffer);
    }

    fn create_bitstream_buffer(&self, size: u64) -> Result<BitstreamBufferResource> {
        self.with_profile(|profile| resources::create_bitstream_buffer(&self.context, size, profile))
    }

    fn destroy_bitstream_buffer(&self, buffer: &BitstreamBufferResource) {
        resources::destroy_bitstream_buffer(&self.context, buffer);
    }

    fn fence_status(&self, fence: vk::Fence) -> Result<bool> {
        unsafe { self.context.device().get_fence_status(fence) }
            .map_err(|e| PipelineError::Synchronization(format!("fence status: {}", e)))
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<()> {
        match unsafe {
            self.context
                .device()
                .wait_for_fences(&[fence], true, timeout_ns)
        } {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => Err(PipelineError::PoolTimeout(format!(
                "fence not signalled within {} ns",
                timeout_ns
            ))),
            Err(e) => Err(PipelineError::Synchronization(format!("fence wait: {}", e))),
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        unsafe { self.context.device().reset_fences(&[fence]) }
            .map_err(|e| PipelineError::Synchronization(format!("fence reset: {}", e)))
    }

    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<()> {
        let device = self.context.device();
        unsafe { device.reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty()) }
            .map_err(|e| PipelineError::CommandBuffer(e.to_string()))?;

        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { device.begin_command_buffer(command_buffer, &begin_info) }
            .map_err(|e| PipelineError::CommandBuffer(e.to_string()))
    }

    fn record(&self, command_buffer: vk::CommandBuffer, command: &VideoCommand<'_>) -> Result<()> {
        match *command {
            VideoCommand::CopyImage { src, dst, extent } => {
                resources::record_copy(&self.context, command_buffer, src, dst, extent);
            }
            VideoCommand::ResetQueries { first, count } => unsafe {
                self.context
                    .device()
                    .cmd_reset_query_pool(command_buffer, self.query_pool, first, count);
            },
            VideoCommand::BeginCoding {
                setup,
                references,
                rate_control,
            } => self.record_begin_coding(command_buffer, setup, references, rate_control),
            VideoCommand::ControlCoding(chain) => self.record_control(command_buffer, chain),
            VideoCommand::Encode {
                frame,
                inline_query,
            } => self.record_encode(command_buffer, frame, inline_query)?,
            VideoCommand::BeginQuery(slot) => unsafe {
                self.context.device().cmd_begin_query(
                    command_buffer,
                    self.query_pool,
                    slot,
                    vk::QueryControlFlags::empty(),
                );
            },
            VideoCommand::EndQuery(slot) => unsafe {
                self.context
                    .device()
                    .cmd_end_query(command_buffer, self.query_pool, slot);
            },
            VideoCommand::DpbBarrier(slot) => {
                let first_use = self.initialized_dpb_images.lock().insert(slot.image.image);
                resources::record_dpb_barrier(&self.context, command_buffer, &slot.image, first_use);
            }
            VideoCommand::EndCoding => {
                let end_info = vk::VideoEndCodingInfoKHR::default();
                unsafe {
                    (self.video_queue_fn.fp().cmd_end_video_coding_khr)(command_buffer, &end_info);
                }
            }
        }
        Ok(())
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<()> {
        unsafe { self.context.device().end_command_buffer(command_buffer) }
            .map_err(|e| PipelineError::CommandBuffer(e.to_string()))
    }

    fn submit(&self, queue: QueueKind, info: &SubmitInfo) -> Result<()> {
        let wait_stages = vec![vk::PipelineStageFlags::ALL_COMMANDS; info.wait_semaphores.len()];
        let signal_semaphores: Vec<_> = info.signal_semaphore.into_iter().collect();
        let submit_info = vk::SubmitInfo::default()
            .command_buffers(std::slice::from_ref(&info.command_buffer))
            .wait_semaphores(&info.wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .signal_semaphores(&signal_semaphores);

        let _guard = self.queue_lock(queue).lock();
        unsafe {
            self.context.device().queue_submit(
                self.context.queue(queue),
                &[submit_info],
                info.fence.unwrap_or_default(),
            )
        }
        .map_err(|e| PipelineError::Submission(format!("{:?} queue: {}", queue, e)))
    }

    fn encode_feedback(&self, slot: u32) -> Result<EncodeFeedback> {
        let mut results = [FeedbackResult::default()];
        unsafe {
            self.context.device().get_query_pool_results(
                self.query_pool,
                slot,
                &mut results,
                vk::QueryResultFlags::WAIT | vk::QueryResultFlags::WITH_STATUS_KHR,
            )
        }
        .map_err(|e| PipelineError::QueryIncomplete(format!("query {}: {}", slot, e)))?;

        let result = results[0];
        debug!(
            "Encode feedback slot {}: offset={}, bytes_written={}, status={}",
            slot, result.offset, result.bytes_written, result.status
        );
        Ok(EncodeFeedback {
            offset: u64::from(result.offset),
            bytes_written: u64::from(result.bytes_written),
            status: vk::QueryResultStatusKHR::from_raw(result.status).into(),
        })
    }

    fn read_bitstream(
        &self,
        buffer: &BitstreamBufferResource,
        offset: u64,
        len: u64,
    ) -> Result<Vec<u8>> {
        if offset.saturating_add(len) > buffer.size {
            return Err(PipelineError::InvalidInput(format!(
                "bitstream range {}+{} exceeds buffer size {}",
                offset, len, buffer.size
            )));
        }
        if len == 0 {
            return Ok(Vec::new());
        }

        let device = self.context.device();
        let data_ptr = unsafe {
            device.map_memory(buffer.memory, offset, len, vk::MemoryMapFlags::empty())
        }
        .map_err(|e| PipelineError::ResourceCreation(format!("bitstream map: {}", e)))?;

        let data =
            unsafe { std::slice::from_raw_parts(data_ptr.cast::<u8>(), len as usize) }.to_vec();
        unsafe { device.unmap_memory(buffer.memory) };
        Ok(data)
    }

    fn wait_idle(&self) -> Result<()> {
        unsafe { self.context.device().device_wait_idle() }
            .map_err(|e| PipelineError::Synchronization(format!("device wait idle: {}", e)))
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        if let Err(e) = unsafe { self.context.device().device_wait_idle() } {
            warn!("Device wait idle failed during drop: {}", e);
        }
        let device = self.context.device();
        unsafe {
            device.destroy_query_pool(self.query_pool, None);
            if self.session.parameters != vk::VideoSessionParametersKHR::null() {
                (self.video_queue_fn.fp().destroy_video_session_parameters_khr)(
                    device.handle(),
                    self.session.parameters,
                    ptr::null(),
                );
            }
            if self.session.session != vk::VideoSessionKHR::null() {
                (self.video_queue_fn.fp().destroy_video_session_khr)(
                    device.handle(),
                    self.session.session,
                    ptr::null(),
                );
            }
            for memory in self.session.memory.drain(..) {
                device.free_memory(memory, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_matches_config() {
        with_profile(Codec::H265, PixelFormat::Yuv420, BitDepth::Ten, |profile| {
            assert_eq!(
                profile.video_codec_operation,
                vk::VideoCodecOperationFlagsKHR::ENCODE_H265
            );
            assert_eq!(
                profile.luma_bit_depth,
                vk::VideoComponentBitDepthFlagsKHR::TYPE_10
            );
            assert!(!profile.p_next.is_null());
        });
    }

    #[test]
    fn test_default_codec_chain_is_empty() {
        let chain = CodecChain::default();
        assert!(chain.picture.is_null());
        assert!(chain.setup_slot.is_null());
        assert!(chain.reference_slots.is_empty());
    }
}
