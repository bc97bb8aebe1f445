//! Memory budget for the result cache.
//!
//! Tracks bytes held by cached frames and the limit derived from available
//! system memory. The cache asks `check_memory_limit` after each insert and
//! evicts until it is back under budget.

use log::{debug, info};
use std::sync::atomic::{AtomicUsize, Ordering};
use sysinfo::System;

const GB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Debug)]
pub struct CacheManager {
    /// Atomically tracked memory usage (bytes)
    memory_usage: AtomicUsize,
    /// Maximum allowed memory (bytes)
    max_memory_bytes: AtomicUsize,
}

/// Bytes usable for caching given the current system state.
fn budget_from_system(mem_fraction: f64, reserve_gb: f64) -> (usize, usize) {
    let mut sys = System::new();
    sys.refresh_memory();

    let available = sys.available_memory() as usize;
    let reserve = (reserve_gb * GB) as usize;
    let usable = available.saturating_sub(reserve);
    (available, (usable as f64 * mem_fraction.clamp(0.0, 1.0)) as usize)
}

impl CacheManager {
    /// Create cache manager with memory limit
    ///
    /// * `mem_fraction` - Fraction of available memory (0.0-1.0)
    /// * `reserve_gb` - Memory left to the system (GB)
    pub fn new(mem_fraction: f64, reserve_gb: f64) -> Self {
        let (available, limit) = budget_from_system(mem_fraction, reserve_gb);
        info!(
            "CacheManager init: available={} MB, limit={} MB ({}%)",
            available / 1024 / 1024,
            limit / 1024 / 1024,
            (mem_fraction * 100.0) as u32
        );
        Self::with_limit(limit)
    }

    /// Fixed limit in bytes, independent of the system.
    pub fn with_limit(bytes: usize) -> Self {
        Self {
            memory_usage: AtomicUsize::new(0),
            max_memory_bytes: AtomicUsize::new(bytes),
        }
    }

    /// Check if memory limit exceeded
    pub fn check_memory_limit(&self) -> bool {
        self.memory_usage.load(Ordering::Relaxed) > self.max_memory_bytes.load(Ordering::Relaxed)
    }

    /// Memory statistics (usage, limit)
    pub fn mem(&self) -> (usize, usize) {
        (
            self.memory_usage.load(Ordering::Relaxed),
            self.max_memory_bytes.load(Ordering::Relaxed),
        )
    }

    pub fn add_memory(&self, bytes: usize) {
        let new_usage = self.memory_usage.fetch_add(bytes, Ordering::Relaxed) + bytes;
        let limit = self.max_memory_bytes.load(Ordering::Relaxed);
        if new_usage > limit {
            debug!(
                "Memory limit exceeded: {} KB / {} KB",
                new_usage / 1024,
                limit / 1024
            );
        }
    }

    /// Free memory usage (saturating)
    pub fn free_memory(&self, bytes: usize) {
        let _ = self
            .memory_usage
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_sub(bytes))
            });
    }

    /// Forget all tracked usage (cache cleared).
    pub fn reset_usage(&self) {
        self.memory_usage.store(0, Ordering::Relaxed);
    }

    pub fn set_limit_bytes(&self, bytes: usize) {
        self.max_memory_bytes.store(bytes, Ordering::Relaxed);
        info!("Memory limit updated: {} MB", bytes / 1024 / 1024);
    }

    /// Recompute the limit from the system (e.g. from settings)
    pub fn set_memory_limit(&self, mem_fraction: f64, reserve_gb: f64) {
        let (_, limit) = budget_from_system(mem_fraction, reserve_gb);
        self.set_limit_bytes(limit);
    }
}
