//! Vulkan resource helpers for the pool-backed encode resources.

use ash::vk;

use super::{
    BitstreamBufferResource, CommandBufferResource, ImageDescriptor, ImageResource, ImageRole,
    QueueKind,
};
use crate::config::QpMapMode;
use crate::error::{PipelineError, Result};

use super::vulkan::VideoContext;

pub(super) fn find_memory_type(
    memory_props: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..memory_props.memory_type_count).find(|&i| {
        (type_filter & (1 << i)) != 0
            && memory_props.memory_types[i as usize]
                .property_flags
                .contains(properties)
    })
}

/// Pieces of `VK_KHR_video_encode_quantization_map`, which is newer than the
/// ash bindings. Values are from the Vulkan registry.
pub(super) mod quantization_map {
    use std::ffi::c_void;
    use std::ptr;

    use ash::vk;

    use crate::config::QpMapMode;
    use crate::device::ImageResource;

    const STRUCTURE_TYPE_INFO: vk::StructureType = vk::StructureType::from_raw(1_000_553_002);

    /// `VK_IMAGE_LAYOUT_VIDEO_ENCODE_QUANTIZATION_MAP_KHR`
    pub const LAYOUT: vk::ImageLayout = vk::ImageLayout::from_raw(1_000_553_000);

    /// `VK_IMAGE_USAGE_VIDEO_ENCODE_QUANTIZATION_DELTA_MAP_BIT_KHR`
    pub const USAGE_DELTA_MAP: vk::ImageUsageFlags = vk::ImageUsageFlags::from_raw(0x0200_0000);
    /// `VK_IMAGE_USAGE_VIDEO_ENCODE_EMPHASIS_MAP_BIT_KHR`
    pub const USAGE_EMPHASIS_MAP: vk::ImageUsageFlags = vk::ImageUsageFlags::from_raw(0x0400_0000);

    /// `VK_VIDEO_ENCODE_WITH_QUANTIZATION_DELTA_MAP_BIT_KHR`
    pub const ENCODE_WITH_DELTA_MAP: vk::VideoEncodeFlagsKHR =
        vk::VideoEncodeFlagsKHR::from_raw(0x1);
    /// `VK_VIDEO_ENCODE_WITH_EMPHASIS_MAP_BIT_KHR`
    pub const ENCODE_WITH_EMPHASIS_MAP: vk::VideoEncodeFlagsKHR =
        vk::VideoEncodeFlagsKHR::from_raw(0x2);

    pub fn usage(mode: QpMapMode) -> vk::ImageUsageFlags {
        match mode {
            QpMapMode::DeltaQp => USAGE_DELTA_MAP,
            QpMapMode::Emphasis => USAGE_EMPHASIS_MAP,
        }
    }

    pub fn encode_flags(mode: QpMapMode) -> vk::VideoEncodeFlagsKHR {
        match mode {
            QpMapMode::DeltaQp => ENCODE_WITH_DELTA_MAP,
            QpMapMode::Emphasis => ENCODE_WITH_EMPHASIS_MAP,
        }
    }

    /// `VkVideoEncodeQuantizationMapInfoKHR`
    #[repr(C)]
    #[derive(Debug, Clone, Copy)]
    pub struct QuantizationMapInfo {
        pub s_type: vk::StructureType,
        pub p_next: *const c_void,
        pub quantization_map: vk::ImageView,
        pub quantization_map_extent: vk::Extent2D,
    }

    impl QuantizationMapInfo {
        pub fn new(map: &ImageResource) -> Self {
            Self {
                s_type: STRUCTURE_TYPE_INFO,
                p_next: ptr::null(),
                quantization_map: map.view,
                quantization_map_extent: map.descriptor.extent,
            }
        }
    }
}

fn image_usage(descriptor: &ImageDescriptor) -> vk::ImageUsageFlags {
    match descriptor.role {
        ImageRole::Staging | ImageRole::QpMapStaging => vk::ImageUsageFlags::TRANSFER_SRC,
        ImageRole::EncodeInput => {
            vk::ImageUsageFlags::VIDEO_ENCODE_SRC_KHR | vk::ImageUsageFlags::TRANSFER_DST
        }
        ImageRole::Dpb => vk::ImageUsageFlags::VIDEO_ENCODE_DPB_KHR,
        ImageRole::QpMap => {
            let mode = if descriptor.format == QpMapMode::Emphasis.format() {
                QpMapMode::Emphasis
            } else {
                QpMapMode::DeltaQp
            };
            quantization_map::usage(mode) | vk::ImageUsageFlags::TRANSFER_DST
        }
    }
}

fn is_host_visible(role: ImageRole) -> bool {
    matches!(role, ImageRole::Staging | ImageRole::QpMapStaging)
}

/// Create an image (with memory and view) for one of the pipeline roles.
///
/// Encoder-facing images carry the video profile list so the driver can pick
/// a compatible layout. Staging images are linear and host visible.
pub(super) fn create_image(
    context: &VideoContext,
    descriptor: &ImageDescriptor,
    profile_info: &vk::VideoProfileInfoKHR,
) -> Result<ImageResource> {
    let device = context.device();
    let profiles = [*profile_info];
    let mut profile_list = vk::VideoProfileListInfoKHR::default().profiles(&profiles);

    let tiling = if descriptor.linear {
        vk::ImageTiling::LINEAR
    } else {
        vk::ImageTiling::OPTIMAL
    };
    let initial_layout = if descriptor.linear {
        vk::ImageLayout::PREINITIALIZED
    } else {
        vk::ImageLayout::UNDEFINED
    };

    let mut create_info = vk::ImageCreateInfo::default()
        .image_type(vk::ImageType::TYPE_2D)
        .format(descriptor.format)
        .extent(vk::Extent3D {
            width: descriptor.extent.width,
            height: descriptor.extent.height,
            depth: 1,
        })
        .mip_levels(1)
        .array_layers(1)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(tiling)
        .usage(image_usage(descriptor))
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(initial_layout);
    if !is_host_visible(descriptor.role) {
        create_info.p_next = (&mut profile_list as *mut vk::VideoProfileListInfoKHR).cast();
    }

    let image = unsafe { device.create_image(&create_info, None) }
        .map_err(|e| PipelineError::ResourceCreation(format!("image creation: {}", e)))?;

    let mem_requirements = unsafe { device.get_image_memory_requirements(image) };
    let properties = if is_host_visible(descriptor.role) {
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
    } else {
        vk::MemoryPropertyFlags::DEVICE_LOCAL
    };
    let Some(memory_type_index) = find_memory_type(
        context.memory_properties(),
        mem_requirements.memory_type_bits,
        properties,
    ) else {
        unsafe { device.destroy_image(image, None) };
        return Err(PipelineError::ResourceCreation(format!(
            "no suitable memory type for {:?} image",
            descriptor.role
        )));
    };

    let alloc_info = vk::MemoryAllocateInfo::default()
        .allocation_size(mem_requirements.size)
        .memory_type_index(memory_type_index);
    let memory = match unsafe { device.allocate_memory(&alloc_info, None) } {
        Ok(memory) => memory,
        Err(e) => {
            unsafe { device.destroy_image(image, None) };
            return Err(PipelineError::ResourceCreation(format!("image memory: {}", e)));
        }
    };

    let bound = unsafe { device.bind_image_memory(image, memory, 0) }
        .map_err(|e| PipelineError::ResourceCreation(format!("image memory bind: {}", e)))
        .and_then(|_| {
            let view_create_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(descriptor.format)
                .components(vk::ComponentMapping::default())
                .subresource_range(color_range(vk::ImageAspectFlags::COLOR));
            unsafe { device.create_image_view(&view_create_info, None) }.map_err(|e| {
                PipelineError::ResourceCreation(format!("image view creation: {}", e))
            })
        });

    match bound {
        Ok(view) => Ok(ImageResource {
            image,
            view,
            memory,
            descriptor: *descriptor,
        }),
        Err(err) => {
            unsafe {
                device.destroy_image(image, None);
                device.free_memory(memory, None);
            }
            Err(err)
        }
    }
}

pub(super) fn destroy_image(context: &VideoContext, image: &ImageResource) {
    let device = context.device();
    unsafe {
        device.destroy_image_view(image.view, None);
        device.destroy_image(image.image, None);
        device.free_memory(image.memory, None);
    }
}

/// Create a host-visible bitstream buffer usable as encode destination.
pub(super) fn create_bitstream_buffer(
    context: &VideoContext,
    size: u64,
    profile_info: &vk::VideoProfileInfoKHR,
) -> Result<BitstreamBufferResource> {
    let device = context.device();
    let profiles = [*profile_info];
    let mut profile_list = vk::VideoProfileListInfoKHR::default().profiles(&profiles);

    let mut create_info = vk::BufferCreateInfo::default()
        .size(size)
        .usage(vk::BufferUsageFlags::VIDEO_ENCODE_DST_KHR)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);
    create_info.p_next = (&mut profile_list as *mut vk::VideoProfileListInfoKHR).cast();

    let buffer = unsafe { device.create_buffer(&create_info, None) }
        .map_err(|e| PipelineError::ResourceCreation(format!("buffer creation: {}", e)))?;

    let mem_requirements = unsafe { device.get_buffer_memory_requirements(buffer) };
    let Some(memory_type_index) = find_memory_type(
        context.memory_properties(),
        mem_requirements.memory_type_bits,
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
    ) else {
        unsafe { device.destroy_buffer(buffer, None) };
        return Err(PipelineError::ResourceCreation(
            "no suitable memory type for bitstream buffer".to_string(),
        ));
    };

    let alloc_info = vk::MemoryAllocateInfo::default()
        .allocation_size(mem_requirements.size)
        .memory_type_index(memory_type_index);
    let memory = match unsafe { device.allocate_memory(&alloc_info, None) } {
        Ok(memory) => memory,
        Err(e) => {
            unsafe { device.destroy_buffer(buffer, None) };
            return Err(PipelineError::ResourceCreation(format!("buffer memory: {}", e)));
        }
    };

    if let Err(e) = unsafe { device.bind_buffer_memory(buffer, memory, 0) } {
        unsafe {
            device.destroy_buffer(buffer, None);
            device.free_memory(memory, None);
        }
        return Err(PipelineError::ResourceCreation(format!("buffer memory bind: {}", e)));
    }

    Ok(BitstreamBufferResource {
        buffer,
        memory,
        size,
    })
}

pub(super) fn destroy_bitstream_buffer(context: &VideoContext, buffer: &BitstreamBufferResource) {
    unsafe {
        context.device().destroy_buffer(buffer.buffer, None);
        context.device().free_memory(buffer.memory, None);
    }
}

/// Create a command pool with one primary command buffer, an unsignalled
/// fence and a binary semaphore.
pub(super) fn create_command_buffer(
    context: &VideoContext,
    queue: QueueKind,
) -> Result<CommandBufferResource> {
    let device = context.device();
    let pool_create_info = vk::CommandPoolCreateInfo::default()
        .queue_family_index(context.queue_family(queue))
        .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

    let pool = unsafe { device.create_command_pool(&pool_create_info, None) }
        .map_err(|e| PipelineError::CommandBuffer(e.to_string()))?;

    let created = (|| {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffer = unsafe { device.allocate_command_buffers(&alloc_info) }
            .map_err(|e| PipelineError::CommandBuffer(e.to_string()))?
            .first()
            .copied()
            .ok_or_else(|| PipelineError::CommandBuffer("no command buffer allocated".into()))?;

        let fence = unsafe { device.create_fence(&vk::FenceCreateInfo::default(), None) }
            .map_err(|e| PipelineError::ResourceCreation(format!("fence: {}", e)))?;
        let semaphore =
            match unsafe { device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None) } {
                Ok(semaphore) => semaphore,
                Err(e) => {
                    unsafe { device.destroy_fence(fence, None) };
                    return Err(PipelineError::ResourceCreation(format!("semaphore: {}", e)));
                }
            };
        Ok((command_buffer, fence, semaphore))
    })();

    match created {
        Ok((command_buffer, fence, semaphore)) => Ok(CommandBufferResource {
            pool,
            command_buffer,
            fence,
            semaphore,
            queue,
        }),
        Err(err) => {
            unsafe { device.destroy_command_pool(pool, None) };
            Err(err)
        }
    }
}

pub(super) fn destroy_command_buffer(context: &VideoContext, resource: &CommandBufferResource) {
    let device = context.device();
    unsafe {
        device.destroy_semaphore(resource.semaphore, None);
        device.destroy_fence(resource.fence, None);
        // Destroying the pool frees its command buffer.
        device.destroy_command_pool(resource.pool, None);
    }
}

fn color_range(aspect_mask: vk::ImageAspectFlags) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

fn layers(aspect_mask: vk::ImageAspectFlags) -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers {
        aspect_mask,
        mip_level: 0,
        base_array_layer: 0,
        layer_count: 1,
    }
}

/// Record a staging to encode-ready copy, with the layout transitions
/// around it.
///
/// Two-plane pictures are copied plane by plane; quantization maps are a
/// single color plane.
pub(super) fn record_copy(
    context: &VideoContext,
    command_buffer: vk::CommandBuffer,
    src: &ImageResource,
    dst: &ImageResource,
    extent: vk::Extent2D,
) {
    let device = context.device();
    let final_layout = match dst.descriptor.role {
        ImageRole::EncodeInput => vk::ImageLayout::VIDEO_ENCODE_SRC_KHR,
        ImageRole::QpMap => quantization_map::LAYOUT,
        _ => vk::ImageLayout::GENERAL,
    };

    let src_barrier = vk::ImageMemoryBarrier::default()
        .old_layout(vk::ImageLayout::UNDEFINED)
        .new_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(src.image)
        .subresource_range(color_range(vk::ImageAspectFlags::COLOR))
        .src_access_mask(vk::AccessFlags::HOST_WRITE)
        .dst_access_mask(vk::AccessFlags::TRANSFER_READ);

    let dst_barrier = vk::ImageMemoryBarrier::default()
        .old_layout(vk::ImageLayout::UNDEFINED)
        .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(dst.image)
        .subresource_range(color_range(vk::ImageAspectFlags::COLOR))
        .src_access_mask(vk::AccessFlags::empty())
        .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE);

    unsafe {
        device.cmd_pipeline_barrier(
            command_buffer,
            vk::PipelineStageFlags::HOST,
            vk::PipelineStageFlags::TRANSFER,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[src_barrier, dst_barrier],
        );
    }

    let region = |aspect_mask, extent: vk::Extent2D| vk::ImageCopy {
        src_subresource: layers(aspect_mask),
        src_offset: vk::Offset3D::default(),
        dst_subresource: layers(aspect_mask),
        dst_offset: vk::Offset3D::default(),
        extent: vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        },
    };

    let regions = if dst.descriptor.role.is_single_plane() {
        vec![region(vk::ImageAspectFlags::COLOR, extent)]
    } else {
        vec![
            region(vk::ImageAspectFlags::PLANE_0, extent),
            region(
                vk::ImageAspectFlags::PLANE_1,
                dst.descriptor.pixel_format.chroma_extent(extent),
            ),
        ]
    };

    unsafe {
        device.cmd_copy_image(
            command_buffer,
            src.image,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            dst.image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &regions,
        );
    }

    let ready_barrier = vk::ImageMemoryBarrier::default()
        .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
        .new_layout(final_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(dst.image)
        .subresource_range(color_range(vk::ImageAspectFlags::COLOR))
        .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
        .dst_access_mask(vk::AccessFlags::empty());

    unsafe {
        device.cmd_pipeline_barrier(
            command_buffer,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[ready_barrier],
        );
    }
}

/// Move a DPB picture into the DPB layout before the encoder writes it.
///
/// Only the first use of an image transitions from the undefined layout;
/// later barriers keep the reconstructed content.
pub(super) fn record_dpb_barrier(
    context: &VideoContext,
    command_buffer: vk::CommandBuffer,
    image: &ImageResource,
    first_use: bool,
) {
    let old_layout = if first_use {
        vk::ImageLayout::UNDEFINED
    } else {
        vk::ImageLayout::VIDEO_ENCODE_DPB_KHR
    };
    let barrier = vk::ImageMemoryBarrier::default()
        .old_layout(old_layout)
        .new_layout(vk::ImageLayout::VIDEO_ENCODE_DPB_KHR)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image.image)
        .subresource_range(color_range(vk::ImageAspectFlags::COLOR))
        .src_access_mask(vk::AccessFlags::MEMORY_WRITE)
        .dst_access_mask(vk::AccessFlags::MEMORY_READ);

    unsafe {
        context.device().cmd_pipeline_barrier(
            command_buffer,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            // VIDEO_ENCODE stages need synchronization2.
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }
}

/// Copy tightly packed planes into a linear, host-visible image.
pub(super) fn write_planes(context: &VideoContext, image: &ImageResource, data: &[u8]) -> Result<()> {
    let device = context.device();
    let descriptor = &image.descriptor;
    let bytes_per_sample = match descriptor.format {
        vk::Format::G8_B8R8_2PLANE_420_UNORM
        | vk::Format::G8_B8R8_2PLANE_444_UNORM
        | vk::Format::R8_UNORM
        | vk::Format::R8_SINT => 1,
        _ => 2,
    };

    // (aspect, row bytes, rows)
    let planes: Vec<(vk::ImageAspectFlags, usize, usize)> = if descriptor.role.is_single_plane() {
        vec![(
            vk::ImageAspectFlags::COLOR,
            descriptor.extent.width as usize * bytes_per_sample,
            descriptor.extent.height as usize,
        )]
    } else {
        let chroma = descriptor.pixel_format.chroma_extent(descriptor.extent);
        vec![
            (
                vk::ImageAspectFlags::PLANE_0,
                descriptor.extent.width as usize * bytes_per_sample,
                descriptor.extent.height as usize,
            ),
            (
                vk::ImageAspectFlags::PLANE_1,
                chroma.width as usize * 2 * bytes_per_sample,
                chroma.height as usize,
            ),
        ]
    };

    let expected: usize = planes.iter().map(|(_, row, rows)| row * rows).sum();
    if data.len() < expected {
        return Err(PipelineError::InvalidInput(format!(
            "staging data too small: expected {} bytes, got {}",
            expected,
            data.len()
        )));
    }

    let data_ptr = unsafe {
        device.map_memory(image.memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
    }
    .map_err(|e| PipelineError::ResourceCreation(format!("staging map: {}", e)))?
    .cast::<u8>();

    let mut src_offset = 0usize;
    for (aspect_mask, row_bytes, rows) in planes {
        let subresource = vk::ImageSubresource {
            aspect_mask,
            mip_level: 0,
            array_layer: 0,
        };
        let layout = unsafe { device.get_image_subresource_layout(image.image, subresource) };
        for row in 0..rows {
            let dst_offset = layout.offset as usize + row * layout.row_pitch as usize;
            unsafe {
                std::ptr::copy_nonoverlapping(
                    data.as_ptr().add(src_offset),
                    data_ptr.add(dst_offset),
                    row_bytes,
                );
            }
            src_offset += row_bytes;
        }
    }

    unsafe { device.unmap_memory(image.memory) };
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use crate::config::PixelFormat;

    fn qp_descriptor(mode: QpMapMode) -> ImageDescriptor {
        ImageDescriptor {
            role: ImageRole::QpMap,
            format: mode.format(),
            extent: vk::Extent2D {
                width: 4,
                height: 4,
            },
            pixel_format: PixelFormat::Yuv420,
            linear: false,
        }
    }

    #[test]
    fn test_qp_map_images_are_encoder_readable() {
        let usage = image_usage(&qp_descriptor(QpMapMode::DeltaQp));
        assert!(usage.contains(quantization_map::USAGE_DELTA_MAP));
        assert!(usage.contains(vk::ImageUsageFlags::TRANSFER_DST));
        assert!(!usage.contains(quantization_map::USAGE_EMPHASIS_MAP));

        let usage = image_usage(&qp_descriptor(QpMapMode::Emphasis));
        assert!(usage.contains(quantization_map::USAGE_EMPHASIS_MAP));
    }

    #[test]
    fn test_encode_flags_follow_mode() {
        assert_eq!(
            quantization_map::encode_flags(QpMapMode::DeltaQp).as_raw(),
            0x1
        );
        assert_eq!(
            quantization_map::encode_flags(QpMapMode::Emphasis).as_raw(),
            0x2
        );
    }

    #[test]
    fn test_quantization_map_info_points_at_the_map() {
        let map = ImageResource {
            image: vk::Image::null(),
            view: vk::ImageView::from_raw(7),
            memory: vk::DeviceMemory::null(),
            descriptor: qp_descriptor(QpMapMode::DeltaQp),
        };
        let info = quantization_map::QuantizationMapInfo::new(&map);
        assert_eq!(info.s_type.as_raw(), 1_000_553_002);
        assert!(info.p_next.is_null());
        assert_eq!(info.quantization_map, map.view);
        assert_eq!(info.quantization_map_extent, map.descriptor.extent);
    }
}
