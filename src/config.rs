//! Engine settings and where they live on disk.
//!
//! Path priority:
//! 1. CLI `--config-dir` argument
//! 2. `GRAPHPLAY_CONFIG_DIR` environment variable
//! 3. Local folder IF a config file exists there (`graphplay.json`)
//! 4. Platform-specific directory from dirs-next
//!
//! Platform paths:
//! - Linux: ~/.config/graphplay/{name}
//! - macOS: ~/Library/Application Support/graphplay/{name}
//! - Windows: %APPDATA%\graphplay\{name}

use anyhow::{Context, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "graphplay.json";
pub const LOG_FILE: &str = "graphplay.log";
const APP_DIR: &str = "graphplay";
const ENV_CONFIG_DIR: &str = "GRAPHPLAY_CONFIG_DIR";

/// Tunables of the render engine. Missing JSON fields take defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Viewer playback rate; `<= 0` renders as fast as possible.
    pub fps: f64,
    pub loop_mode: bool,
    /// Playhead position before the first command.
    pub start_frame: i32,
    /// Row workers; 0 = one per core.
    pub worker_threads: usize,
    /// Scanlines per work unit.
    pub rows_per_group: usize,
    /// Fraction of available memory the result cache may use.
    pub cache_mem_fraction: f64,
    /// Memory kept free for the rest of the system, in GB.
    pub cache_reserve_gb: f64,
    /// Explicit cache limit in bytes; overrides the fraction.
    pub cache_max_bytes: Option<usize>,
    /// Frames tracked by each reader's decode buffer.
    pub decode_buffer_capacity: usize,
    /// Frames between two `FpsChanged` reports.
    pub fps_report_interval: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fps: 24.0,
            loop_mode: true,
            start_frame: 0,
            worker_threads: 0,
            rows_per_group: 16,
            cache_mem_fraction: 0.5,
            cache_reserve_gb: 2.0,
            cache_max_bytes: None,
            decode_buffer_capacity: 16,
            fps_report_interval: 24,
        }
    }
}

impl EngineConfig {
    /// Read `path`; a missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let config = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, text).with_context(|| format!("Failed to write config: {}", path.display()))?;
        debug!("Saved config to {}", path.display());
        Ok(())
    }
}

/// Configuration for overriding default application paths
#[derive(Debug, Clone, Default)]
pub struct PathConfig {
    /// Custom config directory (from CLI or ENV)
    pub config_dir: Option<PathBuf>,
}

impl PathConfig {
    /// Priority: CLI args → ENV var (GRAPHPLAY_CONFIG_DIR) → None (use defaults)
    pub fn from_env_and_cli(cli_dir: Option<PathBuf>) -> Self {
        let config_dir = cli_dir.or_else(|| std::env::var(ENV_CONFIG_DIR).ok().map(PathBuf::from));
        Self { config_dir }
    }
}

/// Path to a configuration file.
pub fn config_file(name: &str, config: &PathConfig) -> PathBuf {
    get_config_dir(config).join(name)
}

/// Path to a data file (logs, output).
pub fn data_file(name: &str, config: &PathConfig) -> PathBuf {
    get_data_dir(config).join(name)
}

/// Create the configuration and data directories if missing.
pub fn ensure_dirs(config: &PathConfig) -> Result<()> {
    let config_dir = get_config_dir(config);
    let data_dir = get_data_dir(config);

    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir)
            .with_context(|| format!("Failed to create config directory: {}", config_dir.display()))?;
    }
    if data_dir != config_dir && !data_dir.exists() {
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;
    }
    Ok(())
}

fn local_dir() -> Option<PathBuf> {
    let dir = std::env::current_dir().ok()?;
    dir.join(CONFIG_FILE).exists().then_some(dir)
}

fn get_config_dir(config: &PathConfig) -> PathBuf {
    if let Some(dir) = &config.config_dir {
        return dir.clone();
    }
    if let Some(dir) = local_dir() {
        return dir;
    }
    dirs_next::config_dir()
        .map(|d| d.join(APP_DIR))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn get_data_dir(config: &PathConfig) -> PathBuf {
    if let Some(dir) = &config.config_dir {
        return dir.clone();
    }
    if let Some(dir) = local_dir() {
        return dir;
    }
    dirs_next::data_dir()
        .map(|d| d.join(APP_DIR))
        .unwrap_or_else(|| PathBuf::from("."))
}
