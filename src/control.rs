//! Coalescing of one-shot session control directives.
//!
//! Reset, quality level and rate control requests accumulate here until the
//! next frame is staged. That frame then carries all of them in a single
//! [`ControlCommandChain`] consumed by one control call.

use ash::vk;

use crate::config::{RateControlMode, RateControlParams};
use crate::error::{PipelineError, Result};
use crate::frame::FrameState;

/// One session control directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// Reset the coding session state.
    Reset,
    /// Switch the encoder quality level.
    QualityLevel(u32),
    /// Replace the rate control state.
    RateControl(RateControlParams),
}

/// At most one directive of each kind, emitted in the order reset, quality
/// level, rate control.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControlCommandChain {
    reset: bool,
    quality_level: Option<u32>,
    rate_control: Option<RateControlParams>,
}

impl ControlCommandChain {
    /// Build a chain, checking each payload.
    pub fn new(
        reset: bool,
        quality_level: Option<u32>,
        rate_control: Option<RateControlParams>,
    ) -> Result<Self> {
        if let Some(params) = &rate_control {
            validate_rate_control(params)?;
        }
        Ok(Self {
            reset,
            quality_level,
            rate_control,
        })
    }

    /// Whether the chain carries no directive.
    pub fn is_empty(&self) -> bool {
        !self.reset && self.quality_level.is_none() && self.rate_control.is_none()
    }

    /// Whether the chain resets the session.
    pub fn has_reset(&self) -> bool {
        self.reset
    }

    /// Quality level directive, if any.
    pub fn quality_level(&self) -> Option<u32> {
        self.quality_level
    }

    /// Rate control directive, if any.
    pub fn rate_control(&self) -> Option<&RateControlParams> {
        self.rate_control.as_ref()
    }

    /// Directives in emission order.
    pub fn commands(&self) -> Vec<ControlCommand> {
        let mut commands = Vec::with_capacity(3);
        if self.reset {
            commands.push(ControlCommand::Reset);
        }
        if let Some(level) = self.quality_level {
            commands.push(ControlCommand::QualityLevel(level));
        }
        if let Some(params) = self.rate_control {
            commands.push(ControlCommand::RateControl(params));
        }
        commands
    }

    /// Vulkan control flags matching the directives in the chain.
    pub fn flags(&self) -> vk::VideoCodingControlFlagsKHR {
        let mut flags = vk::VideoCodingControlFlagsKHR::empty();
        if self.reset {
            flags |= vk::VideoCodingControlFlagsKHR::RESET;
        }
        if self.quality_level.is_some() {
            flags |= vk::VideoCodingControlFlagsKHR::ENCODE_QUALITY_LEVEL;
        }
        if self.rate_control.is_some() {
            flags |= vk::VideoCodingControlFlagsKHR::ENCODE_RATE_CONTROL;
        }
        flags
    }
}

fn validate_rate_control(params: &RateControlParams) -> Result<()> {
    if params.frame_rate_numerator == 0 || params.frame_rate_denominator == 0 {
        return Err(PipelineError::InvalidInput(format!(
            "frame rate {}/{} is not valid",
            params.frame_rate_numerator, params.frame_rate_denominator
        )));
    }
    if params.layer_count == 0 {
        return Err(PipelineError::InvalidInput(
            "rate control needs at least one layer".to_string(),
        ));
    }
    if params.mode == RateControlMode::Vbr && params.average_bitrate > params.max_bitrate {
        return Err(PipelineError::InvalidInput(format!(
            "average bitrate {} exceeds max bitrate {}",
            params.average_bitrate, params.max_bitrate
        )));
    }
    Ok(())
}

/// Pending control directives and the rate control state that begin-coding
/// calls carry between directives.
#[derive(Debug)]
pub struct ControlCoalescer {
    pending: ControlCommandChain,
    begin_rate_control: Option<RateControlParams>,
    max_quality_levels: u32,
}

impl ControlCoalescer {
    /// Create a coalescer accepting quality levels below `max_quality_levels`.
    pub fn new(max_quality_levels: u32) -> Self {
        Self {
            pending: ControlCommandChain::default(),
            begin_rate_control: None,
            max_quality_levels: max_quality_levels.max(1),
        }
    }

    /// Request a session reset on the next staged frame.
    pub fn request_reset(&mut self) {
        self.pending.reset = true;
    }

    /// Request a quality level change. The last request before a frame wins.
    pub fn request_quality_level(&mut self, level: u32) -> Result<()> {
        if level >= self.max_quality_levels {
            return Err(PipelineError::InvalidInput(format!(
                "quality level {level} out of range, device supports {}",
                self.max_quality_levels
            )));
        }
        self.pending.quality_level = Some(level);
        Ok(())
    }

    /// Request new rate control parameters. The last request before a frame wins.
    pub fn request_rate_control(&mut self, params: RateControlParams) -> Result<()> {
        validate_rate_control(&params)?;
        self.pending.rate_control = Some(params);
        Ok(())
    }

    /// Whether any directive waits for a frame.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Move every pending directive onto `frame`.
    ///
    /// Returns `true` when the frame now carries a control chain.
    pub fn build_for(&mut self, frame: &mut FrameState) -> bool {
        if self.pending.is_empty() {
            return false;
        }
        frame.control = std::mem::take(&mut self.pending);
        true
    }

    /// Decide the rate control carried by `frame`'s begin-coding call.
    ///
    /// Frames are visited in encode order. A frame with a control chain
    /// begins coding without rate control state; the chain then becomes the
    /// state later frames begin with.
    pub fn apply_begin_state(&mut self, frame: &mut FrameState) {
        if frame.control.is_empty() {
            frame.begin_rate_control = self.begin_rate_control;
            return;
        }
        frame.begin_rate_control = None;
        if let Some(params) = frame.control.rate_control() {
            self.begin_rate_control = Some(*params);
        } else if frame.control.has_reset() {
            self.begin_rate_control = None;
        }
    }

    /// Rate control that begin-coding calls currently carry.
    pub fn begin_rate_control(&self) -> Option<&RateControlParams> {
        self.begin_rate_control.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameState;

    fn cbr(bitrate: u32) -> RateControlParams {
        RateControlParams {
            mode: RateControlMode::Cbr,
            average_bitrate: bitrate,
            max_bitrate: bitrate,
            ..Default::default()
        }
    }

    #[test]
    fn test_reset_requested_twice_is_attached_once() {
        let mut coalescer = ControlCoalescer::new(4);
        coalescer.request_reset();
        coalescer.request_reset();

        let mut first = FrameState::new(0);
        assert!(coalescer.build_for(&mut first));
        assert_eq!(first.control.commands(), vec![ControlCommand::Reset]);

        let mut second = FrameState::new(1);
        assert!(!coalescer.build_for(&mut second));
        assert!(second.control.is_empty());
    }

    #[test]
    fn test_last_writer_wins() {
        let mut coalescer = ControlCoalescer::new(8);
        coalescer.request_quality_level(1).unwrap();
        coalescer.request_quality_level(3).unwrap();
        coalescer.request_rate_control(cbr(1_000_000)).unwrap();
        coalescer.request_rate_control(cbr(2_000_000)).unwrap();

        let mut frame = FrameState::new(0);
        coalescer.build_for(&mut frame);
        assert_eq!(
            frame.control.commands(),
            vec![
                ControlCommand::QualityLevel(3),
                ControlCommand::RateControl(cbr(2_000_000)),
            ]
        );
        assert!(!coalescer.has_pending());
    }

    #[test]
    fn test_chain_order_and_flags() {
        let chain = ControlCommandChain::new(true, Some(2), Some(cbr(500_000))).unwrap();
        assert_eq!(
            chain.commands(),
            vec![
                ControlCommand::Reset,
                ControlCommand::QualityLevel(2),
                ControlCommand::RateControl(cbr(500_000)),
            ]
        );
        assert_eq!(
            chain.flags(),
            vk::VideoCodingControlFlagsKHR::RESET
                | vk::VideoCodingControlFlagsKHR::ENCODE_QUALITY_LEVEL
                | vk::VideoCodingControlFlagsKHR::ENCODE_RATE_CONTROL
        );
    }

    #[test]
    fn test_rejects_invalid_payloads() {
        let mut coalescer = ControlCoalescer::new(2);
        assert!(coalescer.request_quality_level(2).is_err());

        let bad = RateControlParams {
            frame_rate_denominator: 0,
            ..Default::default()
        };
        assert!(coalescer.request_rate_control(bad).is_err());

        let inverted = RateControlParams {
            mode: RateControlMode::Vbr,
            average_bitrate: 10,
            max_bitrate: 5,
            ..Default::default()
        };
        assert!(ControlCommandChain::new(false, None, Some(inverted)).is_err());
        assert!(!coalescer.has_pending());
    }

    #[test]
    fn test_begin_state_follows_rate_control_directive() {
        let mut coalescer = ControlCoalescer::new(4);
        coalescer.request_reset();
        coalescer.request_rate_control(cbr(3_000_000)).unwrap();

        let mut first = FrameState::new(0);
        coalescer.build_for(&mut first);
        coalescer.apply_begin_state(&mut first);
        assert_eq!(first.begin_rate_control, None);
        assert_eq!(coalescer.begin_rate_control(), Some(&cbr(3_000_000)));

        let mut second = FrameState::new(1);
        coalescer.build_for(&mut second);
        coalescer.apply_begin_state(&mut second);
        assert_eq!(second.begin_rate_control, Some(cbr(3_000_000)));

        coalescer.request_reset();
        let mut third = FrameState::new(2);
        coalescer.build_for(&mut third);
        coalescer.apply_begin_state(&mut third);
        assert_eq!(third.begin_rate_control, None);
        assert_eq!(coalescer.begin_rate_control(), None);
    }
}
