//! Brightness/Contrast filter.
//!
//! Standard formula on the color channels, alpha untouched:
//! `output = (input - 0.5) * (1 + contrast) + 0.5 + brightness`
//!
//! # Parameters
//!
//! - `brightness`: -1.0 (black) to 1.0 (white), 0.0 = no change
//! - `contrast`: -1.0 (flat gray) to 1.0 (high contrast), 0.0 = no change
//!
//! Float samples are not clamped, so HDR values survive.

use std::hash::{Hash, Hasher};

use crate::entities::error::RowError;
use crate::entities::frame::{Channel, Row};
use crate::entities::node::{Node, RowContext};

pub struct BrightnessNode {
    name: String,
    brightness: f32,
    contrast: f32,
}

impl BrightnessNode {
    pub fn new(name: impl Into<String>, brightness: f32, contrast: f32) -> Self {
        Self { name: name.into(), brightness, contrast }
    }

    pub fn brightness(&self) -> f32 {
        self.brightness
    }

    pub fn contrast(&self) -> f32 {
        self.contrast
    }

    fn is_identity(&self) -> bool {
        self.brightness.abs() < 0.0001 && self.contrast.abs() < 0.0001
    }
}

impl Node for BrightnessNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn node_type(&self) -> &'static str {
        "BrightnessContrast"
    }

    fn arity(&self) -> usize {
        1
    }

    fn hash(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.brightness.to_bits().hash(&mut hasher);
        self.contrast.to_bits().hash(&mut hasher);
        hasher.finish()
    }

    fn render(&self, ctx: &RowContext<'_>, out: &mut Row) -> Result<(), RowError> {
        let input = ctx.input(0)?;
        out.copy_from(&input);
        if self.is_identity() {
            return Ok(());
        }

        let cf = 1.0 + self.contrast;
        for ch in [Channel::Red, Channel::Green, Channel::Blue] {
            if let Some(plane) = out.channel_mut(ch) {
                for v in plane.iter_mut() {
                    *v = (*v - 0.5) * cf + 0.5 + self.brightness;
                }
            }
        }
        Ok(())
    }
}
