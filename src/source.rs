//! Raw picture sources.
//!
//! A [`FrameSource`] fills the host-visible staging images of a frame. The
//! staging layout is semi-planar: a luma plane followed by one interleaved
//! chroma plane, 8-bit samples or 16-bit samples with the value in the high
//! bits (P010 style).

use std::io::Read;

use ash::vk;
use tracing::trace;

use crate::device::{EncodeDevice, ImageResource};
use crate::error::Result;

/// Producer of raw pictures and quantization maps.
pub trait FrameSource: Send {
    /// Write picture `input_order` into `staging`.
    fn load_frame(
        &mut self,
        device: &dyn EncodeDevice,
        input_order: u64,
        staging: &ImageResource,
    ) -> Result<()>;

    /// Write the quantization map of picture `input_order` into `staging`.
    ///
    /// Only called when the pipeline runs with a quantization map.
    fn load_qp_map(
        &mut self,
        _device: &dyn EncodeDevice,
        _input_order: u64,
        _staging: &ImageResource,
    ) -> Result<()> {
        Ok(())
    }
}

/// Sample layout of a raw input stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawLayout {
    /// Three planes (Y, U, V). 10-bit streams carry little-endian samples in
    /// the low bits (yuv420p10le style).
    Planar,
    /// Luma plane plus interleaved chroma, already in the staging layout.
    SemiPlanar,
}

fn bytes_per_sample(format: vk::Format) -> usize {
    match format {
        vk::Format::G8_B8R8_2PLANE_420_UNORM
        | vk::Format::G8_B8R8_2PLANE_444_UNORM
        | vk::Format::R8_UNORM
        | vk::Format::R8_SINT => 1,
        _ => 2,
    }
}

/// Reads fixed-size raw pictures from a byte stream.
pub struct RawYuvSource<R> {
    reader: R,
    layout: RawLayout,
    raw: Vec<u8>,
    packed: Vec<u8>,
    qp_value: u8,
}

impl<R: Read + Send> RawYuvSource<R> {
    pub fn new(reader: R, layout: RawLayout) -> Self {
        Self {
            reader,
            layout,
            raw: Vec::new(),
            packed: Vec::new(),
            qp_value: 0,
        }
    }

    /// Fill every quantization map entry with `value`.
    pub fn with_qp_value(mut self, value: u8) -> Self {
        self.qp_value = value;
        self
    }
}

impl<R: Read + Send> FrameSource for RawYuvSource<R> {
    fn load_frame(
        &mut self,
        device: &dyn EncodeDevice,
        input_order: u64,
        staging: &ImageResource,
    ) -> Result<()> {
        let geometry = PlaneGeometry::of(staging);
        self.raw.resize(geometry.frame_bytes(), 0);
        self.reader.read_exact(&mut self.raw)?;

        let data = match self.layout {
            RawLayout::SemiPlanar => &self.raw,
            RawLayout::Planar => {
                geometry.interleave(&self.raw, &mut self.packed);
                &self.packed
            }
        };
        trace!(input_order, bytes = data.len(), "Loaded raw picture");
        device.write_staging(staging, data)
    }

    fn load_qp_map(
        &mut self,
        device: &dyn EncodeDevice,
        _input_order: u64,
        staging: &ImageResource,
    ) -> Result<()> {
        let extent = staging.descriptor.extent;
        let len = extent.width as usize
            * extent.height as usize
            * bytes_per_sample(staging.descriptor.format);
        self.packed.clear();
        self.packed.resize(len, self.qp_value);
        device.write_staging(staging, &self.packed)
    }
}

/// Sample counts of one picture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PlaneGeometry {
    luma_samples: usize,
    chroma_samples: usize,
    bytes_per_sample: usize,
}

impl PlaneGeometry {
    fn of(image: &ImageResource) -> Self {
        let descriptor = &image.descriptor;
        let chroma = descriptor.pixel_format.chroma_extent(descriptor.extent);
        Self {
            luma_samples: descriptor.extent.width as usize * descriptor.extent.height as usize,
            chroma_samples: chroma.width as usize * chroma.height as usize,
            bytes_per_sample: bytes_per_sample(descriptor.format),
        }
    }

    fn frame_bytes(&self) -> usize {
        (self.luma_samples + 2 * self.chroma_samples) * self.bytes_per_sample
    }

    /// Convert planar samples to the staging layout.
    ///
    /// 10-bit samples move from the low bits to the high bits of each word.
    fn interleave(&self, planar: &[u8], out: &mut Vec<u8>) {
        out.clear();
        out.reserve(self.frame_bytes());

        let y_size = self.luma_samples * self.bytes_per_sample;
        let c_size = self.chroma_samples * self.bytes_per_sample;
        let (y_plane, chroma) = planar.split_at(y_size);
        let (u_plane, v_plane) = chroma.split_at(c_size);

        match self.bytes_per_sample {
            1 => {
                out.extend_from_slice(y_plane);
                for (u, v) in u_plane.iter().zip(v_plane) {
                    out.push(*u);
                    out.push(*v);
                }
            }
            _ => {
                let shift = |sample: &[u8]| {
                    (u16::from_le_bytes([sample[0], sample[1]]) << 6).to_le_bytes()
                };
                for sample in y_plane.chunks_exact(2) {
                    out.extend_from_slice(&shift(sample));
                }
                for (u, v) in u_plane.chunks_exact(2).zip(v_plane.chunks_exact(2)) {
                    out.extend_from_slice(&shift(u));
                    out.extend_from_slice(&shift(v));
                }
            }
        }
    }
}
