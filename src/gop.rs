//! GOP (Group of Pictures) structure.
//!
//! The GOP structure decides the picture type of each input frame. With
//! B-frames the pattern inside a GOP is `IDR P B B P B B P ...`: the frame
//! after the GOP start is an anchor and every `b + 1` frames after it another
//! one. GOPs are closed, so a GOP never ends on a B-frame and nothing refers
//! across a GOP boundary.

/// Frame type in GOP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GopFrameType {
    /// IDR frame.
    #[default]
    Idr,
    /// I frame (intra).
    I,
    /// P frame (predicted).
    P,
    /// B frame (bidirectional).
    B,
}

impl GopFrameType {
    /// Whether this frame type is a reference.
    pub fn is_reference(&self) -> bool {
        matches!(self, Self::Idr | Self::I | Self::P)
    }

    /// Whether this is an IDR frame.
    pub fn is_idr(&self) -> bool {
        matches!(self, Self::Idr)
    }

    /// Whether this is an intra frame (I or IDR).
    pub fn is_intra(&self) -> bool {
        matches!(self, Self::Idr | Self::I)
    }
}

/// Position in the GOP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GopPosition {
    /// Frame number within the GOP (0-based).
    pub gop_frame_num: u32,
    /// Overall frame index in the sequence.
    pub frame_index: u64,
    /// Frame type.
    pub frame_type: GopFrameType,
    /// POC (Picture Order Count), reset at every IDR.
    pub pic_order_cnt: i32,
    /// Whether this frame is a reference.
    pub is_reference: bool,
    /// Last frame of its GOP (or of the stream).
    pub end_of_gop: bool,
}

/// GOP structure manager.
pub struct GopStructure {
    /// GOP size in frames.
    gop_size: u32,
    /// Number of B-frames between anchors.
    b_frame_count: u32,
    /// IDR period in frames (0: every GOP starts with an IDR).
    idr_period: u32,
    /// Current frame index.
    frame_index: u64,
    /// Frame index of the last IDR.
    last_idr_index: u64,
}

impl GopStructure {
    /// Create a new GOP structure.
    ///
    /// # Arguments
    /// * `gop_size` - Number of frames in each GOP.
    /// * `b_frame_count` - Number of B-frames between anchors (0 for I-P only).
    /// * `idr_period` - Period between IDR frames (0 means every GOP starts with an IDR).
    pub fn new(gop_size: u32, b_frame_count: u32, idr_period: u32) -> Self {
        Self {
            gop_size: gop_size.max(1),
            b_frame_count,
            idr_period,
            frame_index: 0,
            last_idr_index: 0,
        }
    }

    /// Get the next frame position in the GOP.
    ///
    /// `is_last` marks the final frame of the stream, which closes the GOP.
    pub fn get_next_frame(&mut self, is_last: bool) -> GopPosition {
        let gop_frame_num = (self.frame_index % self.gop_size as u64) as u32;
        let end_of_gop = is_last || gop_frame_num + 1 == self.gop_size;

        let frame_type = if gop_frame_num == 0 {
            let is_idr = self.frame_index == 0
                || self.idr_period == 0
                || self.frame_index.is_multiple_of(self.idr_period as u64);
            if is_idr {
                GopFrameType::Idr
            } else {
                GopFrameType::I
            }
        } else if self.b_frame_count == 0
            || (gop_frame_num - 1).is_multiple_of(self.b_frame_count + 1)
            || end_of_gop
        {
            GopFrameType::P
        } else {
            GopFrameType::B
        };

        if frame_type.is_idr() {
            self.last_idr_index = self.frame_index;
        }

        let position = GopPosition {
            gop_frame_num,
            frame_index: self.frame_index,
            frame_type,
            pic_order_cnt: ((self.frame_index - self.last_idr_index) * 2) as i32,
            is_reference: frame_type.is_reference(),
            end_of_gop,
        };

        self.frame_index += 1;
        position
    }
}
