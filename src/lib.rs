//! graphplay - render scheduler for node-graph image pipelines
//!
//! Re-exports all modules for use by binary targets.

// Render engine (DAG, scheduling, caches, workers)
pub mod core;

// App modules
pub mod cli;
pub mod config;
pub mod entities;

#[cfg(test)]
mod test_utils;

// Re-export commonly used types from core
pub use core::cache_man::CacheManager;
pub use core::engine::{Command, Engine, EngineError, EngineEvent, EngineHandle, EngineState};
pub use core::frame_cache::FrameCache;

// Re-export entities
pub use entities::{Frame, Node, NodeGraph, OutputKind, OutputSink};
