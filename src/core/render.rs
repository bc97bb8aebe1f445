//! Parallel row evaluation for one frame.
//!
//! The rows of a frame are split into row-groups and spawned on a rayon
//! pool inside a `scope_fifo`; the end of the scope is the single aggregate
//! completion the control thread waits on. Each group writes a disjoint
//! slice of the output, so no locking is needed on the result.
//!
//! Abort is a shared flag checked before every row and, through the DAG
//! evaluator, before every node invocation. Panics inside a row are caught
//! at the row boundary and reported as a failed frame.

use log::{debug, trace, warn};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use super::dag::Dag;
use crate::entities::error::{DecodeError, RowError};
use crate::entities::frame::{ChannelSet, Row};
use crate::entities::node::{NodeId, RowRequest};

/// Rows to compute for one frame.
#[derive(Debug, Clone)]
pub struct FrameJob {
    pub frame: i32,
    /// Scanlines in output order.
    pub rows: Vec<i32>,
    pub x: i32,
    pub r: i32,
    pub channels: ChannelSet,
}

#[derive(Debug)]
pub enum FrameOutcome {
    /// All rows, in `FrameJob::rows` order.
    Complete(Vec<Row>),
    Failed(RowError),
    Aborted,
}

/// Worker pool running row-groups.
pub struct RowDispatcher {
    pool: ThreadPool,
    rows_per_group: usize,
}

impl RowDispatcher {
    /// `threads == 0` uses every core; more than the core count is capped.
    pub fn new(threads: usize, rows_per_group: usize) -> Result<Self, rayon::ThreadPoolBuildError> {
        let cores = num_cpus::get();
        let threads = if threads == 0 { cores } else { threads.min(cores) };
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("graphplay-row-{}", i))
            .build()?;
        debug!("RowDispatcher: {} threads, {} rows per group", threads, rows_per_group.max(1));
        Ok(Self { pool, rows_per_group: rows_per_group.max(1) })
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Prepare all sources of `dag` for `frame` in parallel.
    pub fn prepare_sources(&self, dag: &Dag, frame: i32) -> Result<(), DecodeError> {
        use rayon::prelude::*;
        self.pool.install(|| {
            dag.sources().par_iter().try_for_each(|id| match dag.node(*id) {
                Some(node) => node.prepare(frame),
                None => Ok(()),
            })
        })
    }

    /// Evaluate `sink` for every row of `job`. Blocks until all row-groups
    /// finish or stop.
    pub fn render(&self, dag: &Dag, sink: NodeId, job: &FrameJob, abort: &AtomicBool) -> FrameOutcome {
        let mut slots: Vec<Option<Row>> = vec![None; job.rows.len()];
        let failed = AtomicBool::new(false);
        let failure: Mutex<Option<RowError>> = Mutex::new(None);
        let eval = dag.evaluator(abort);

        self.pool.scope_fifo(|scope| {
            for (ys, out) in job.rows.chunks(self.rows_per_group).zip(slots.chunks_mut(self.rows_per_group)) {
                let (eval, failed, failure) = (&eval, &failed, &failure);
                scope.spawn_fifo(move |_| {
                    for (y, slot) in ys.iter().zip(out.iter_mut()) {
                        if abort.load(Ordering::Relaxed) || failed.load(Ordering::Relaxed) {
                            return;
                        }
                        let req = RowRequest { frame: job.frame, y: *y, x: job.x, r: job.r, channels: job.channels };
                        let result = panic::catch_unwind(AssertUnwindSafe(|| eval.pull(sink, &req)))
                            .unwrap_or_else(|payload| {
                                let reason = payload
                                    .downcast_ref::<&str>()
                                    .map(|s| s.to_string())
                                    .or_else(|| payload.downcast_ref::<String>().cloned())
                                    .unwrap_or_else(|| "panic".to_string());
                                Err(RowError::Failed { node: sink.to_string(), y: *y, reason })
                            });
                        match result {
                            Ok(row) => *slot = Some(row),
                            Err(RowError::Aborted) => return,
                            Err(err) => {
                                failed.store(true, Ordering::Relaxed);
                                let mut first = failure.lock().unwrap_or_else(|e| e.into_inner());
                                first.get_or_insert(err);
                                return;
                            }
                        }
                    }
                });
            }
        });

        if abort.load(Ordering::Relaxed) {
            trace!("Frame {}: rows aborted", job.frame);
            return FrameOutcome::Aborted;
        }
        if let Some(err) = failure.into_inner().unwrap_or_else(|e| e.into_inner()) {
            warn!("Frame {} failed: {}", job.frame, err);
            return FrameOutcome::Failed(err);
        }
        match slots.into_iter().collect::<Option<Vec<Row>>>() {
            Some(rows) => FrameOutcome::Complete(rows),
            // A row unit stopped without a result: only abort does that
            None => FrameOutcome::Aborted,
        }
    }
}
