//! Built-in image nodes.
//!
//! | Node | Inputs | Parameters |
//! |------|--------|------------|
//! | [`ColorNode`] | 0 | `color: [r, g, b, a]`, format, frame range |
//! | [`BrightnessNode`] | 1 | `brightness: -1..1`, `contrast: -1..1` |
//!
//! # Adding New Nodes
//!
//! 1. Create the implementation file with a struct implementing [`Node`]
//! 2. Return a stable `node_type` and hash every parameter affecting pixels
//! 3. Add the module and re-export here
//!
//! [`Node`]: crate::entities::node::Node

pub mod brightness;
pub mod color;

pub use brightness::BrightnessNode;
pub use color::ColorNode;
