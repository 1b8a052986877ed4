//! Batch drivers.
//!
//! A driver walks a deferred batch through the consumer-side stages. Each
//! stage visits every frame of the batch before the next stage starts, so
//! the recording of one frame overlaps with the GPU work of the previous
//! ones.

use tracing::debug;

use crate::config::PipelineConfig;
use crate::error::Result;
use crate::frame::{FrameStage, FrameState};

/// Consumer-side stages, in the order a batch goes through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    ResolveEncodeOrder,
    ResolveReferences,
    RecordCommands,
    Submit,
    AssembleBitstream,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::ResolveEncodeOrder,
        Stage::ResolveReferences,
        Stage::RecordCommands,
        Stage::Submit,
        Stage::AssembleBitstream,
    ];

    /// Stage a frame reaches once this stage ran on it.
    pub fn frame_stage(&self) -> FrameStage {
        match self {
            Stage::ResolveEncodeOrder => FrameStage::EncodeOrderResolved,
            Stage::ResolveReferences => FrameStage::ReferencesResolved,
            Stage::RecordCommands => FrameStage::CommandRecorded,
            Stage::Submit => FrameStage::Submitted,
            Stage::AssembleBitstream => FrameStage::BitstreamAssembled,
        }
    }
}

/// Runs one stage on one frame.
pub trait StageRunner {
    fn run(&mut self, stage: Stage, frame: &mut FrameState) -> Result<()>;
}

/// Order in which a batch visits its frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchDriver {
    /// Every stage walks the batch front to back.
    #[default]
    Ordered,
    /// Command recording walks back to front; everything else front to back.
    ///
    /// Recording order must not matter because every reference decision is
    /// made before recording starts.
    OutOfOrder,
}

impl BatchDriver {
    pub fn from_config(config: &PipelineConfig) -> Self {
        if config.out_of_order_recording {
            BatchDriver::OutOfOrder
        } else {
            BatchDriver::Ordered
        }
    }

    fn walks_backwards(&self, stage: Stage) -> bool {
        *self == BatchDriver::OutOfOrder && stage == Stage::RecordCommands
    }

    /// Run every stage over `frames`, stopping at the first failure.
    ///
    /// Frames are left in place either way; the caller releases them.
    pub fn drive(&self, frames: &mut [FrameState], runner: &mut dyn StageRunner) -> Result<()> {
        for stage in Stage::ALL {
            if self.walks_backwards(stage) {
                for frame in frames.iter_mut().rev() {
                    runner.run(stage, frame)?;
                }
            } else {
                for frame in frames.iter_mut() {
                    runner.run(stage, frame)?;
                }
            }
            debug!(stage = ?stage, frames = frames.len(), "Batch stage complete");
        }
        Ok(())
    }
}
