//! Render engine - DAG, scheduling, caching, row workers
//!
//! These modules drive node graphs frame by frame, independent of any UI.

pub mod cache_man;
pub mod dag;
pub mod decode_buffer;
pub mod engine;
pub mod frame_cache;
pub mod player;
pub mod render;
pub mod task_queue;
pub mod timer;

// Re-exports for convenience
pub use cache_man::CacheManager;
pub use dag::{Dag, DagError};
pub use decode_buffer::{DecodeBuffer, DecodeDecision, DecodeKind};
pub use engine::{Command, Engine, EngineError, EngineEvent, EngineHandle, EngineState, ViewParams};
pub use frame_cache::{CacheStats, FrameCache};
pub use player::Playhead;
pub use render::{FrameJob, FrameOutcome, RowDispatcher};
pub use task_queue::{FrameCount, Task, TaskKind, TaskQueue};
pub use timer::PlaybackTimer;
