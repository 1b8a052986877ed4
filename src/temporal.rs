//! Temporal layer pattern and reference legality.
//!
//! With three temporal layers the encoder cycles through the fixed pattern
//! `[0, 2, 1, 2]`; with a single layer every picture sits on layer 0.
//! Dropping layer 2 halves the frame rate, dropping layers 1 and 2 quarters it,
//! so a picture may only reference pictures on its own layer or below.

use crate::error::{PipelineError, Result};

/// Largest supported number of temporal layers.
pub const MAX_TEMPORAL_LAYERS: u32 = 3;

const FLAT_PATTERN: [u8; 1] = [0];
const THREE_LAYER_PATTERN: [u8; 4] = [0, 2, 1, 2];

/// Cyclic temporal layer pattern plus the current pattern cursor.
#[derive(Debug, Clone)]
pub struct TemporalLayers {
    pattern: &'static [u8],
    position: usize,
}

impl TemporalLayers {
    /// Create a pattern for `layer_count` layers (1 or 3).
    pub fn new(layer_count: u32) -> Result<Self> {
        let mut layers = Self {
            pattern: &FLAT_PATTERN,
            position: 0,
        };
        layers.set_layer_count(layer_count)?;
        Ok(layers)
    }

    /// Select the flat or the three-layer pattern and rewind the cursor.
    pub fn set_layer_count(&mut self, layer_count: u32) -> Result<()> {
        self.pattern = match layer_count {
            1 => &FLAT_PATTERN,
            3 => &THREE_LAYER_PATTERN,
            other => {
                return Err(PipelineError::InvalidInput(format!(
                    "unsupported temporal layer count {other}, expected 1 or {MAX_TEMPORAL_LAYERS}"
                )))
            }
        };
        self.position = 0;
        Ok(())
    }

    /// Number of distinct layers in the active pattern.
    pub fn layer_count(&self) -> u32 {
        if self.pattern.len() == 1 {
            1
        } else {
            MAX_TEMPORAL_LAYERS
        }
    }

    /// Length of the active pattern.
    pub fn pattern_len(&self) -> usize {
        self.pattern.len()
    }

    /// Current pattern position.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Move to the next pattern position and return it.
    ///
    /// Keyframes restart the pattern at position 0.
    pub fn advance(&mut self, is_keyframe: bool) -> usize {
        self.position = if is_keyframe {
            0
        } else {
            (self.position + 1) % self.pattern.len()
        };
        self.position
    }

    /// Layer of a pattern position, `None` when out of range.
    pub fn layer_of(&self, position: usize) -> Option<u8> {
        self.pattern.get(position).copied()
    }

    /// Whether a picture at `current` may reference a picture at `other`.
    ///
    /// Position 3 may only reference position 2. Any other position may
    /// reference position 0. Everything else is illegal.
    pub fn can_reference(&self, current: usize, other: usize) -> bool {
        if current >= self.pattern.len() || other >= self.pattern.len() {
            return false;
        }
        if current == 3 {
            return other == 2;
        }
        other == 0
    }

    /// Whether a picture at `position` may be kept as a reference.
    pub fn can_be_referenced(&self, position: usize) -> bool {
        self.layer_of(position).is_some_and(|layer| layer < 2)
    }
}
