use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use log::{debug, error, info, warn};

use graphplay::cli::Args;
use graphplay::config::{self, EngineConfig, PathConfig};
use graphplay::core::task_queue::FrameCount;
use graphplay::core::{CacheManager, Engine, EngineEvent, EngineState, FrameCache};
use graphplay::entities::effects::{BrightnessNode, ColorNode};
use graphplay::entities::loader::{detect_range, save_png, SequenceDecoder};
use graphplay::entities::{
    Frame, FrameRange, NodeGraph, NodeId, OutputKind, OutputSink, ReaderNode, ResultCache, SequenceMask,
    ViewerNode, WriterNode,
};

/// Logs viewer frames, writes writer frames as PNG.
struct DemoSink {
    output: Option<SequenceMask>,
}

impl OutputSink for DemoSink {
    fn present(&mut self, frame: Arc<Frame>) {
        let region = frame.region();
        info!(
            "Frame {}: {}x{}, {} rows",
            frame.number(),
            region.width(),
            region.height(),
            frame.rows().len()
        );
    }

    fn write_to_disk(&mut self, frame: Arc<Frame>, number: i32) -> Result<()> {
        let Some(mask) = &self.output else {
            self.present(frame);
            return Ok(());
        };
        let path = mask.path(number);
        save_png(&frame, &path)?;
        info!("Wrote {}", path.display());
        Ok(())
    }

    fn present_error(&mut self, number: i32, message: &str) {
        warn!("Frame {} failed: {}", number, message);
    }
}

fn init_logging(args: &Args, path_config: &PathConfig) -> Result<()> {
    // 0 (default) = warn, 1 (-v) = info, 2 (-vv) = debug, 3+ (-vvv) = trace
    let log_level = match args.verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    if let Some(log_path_opt) = &args.log_file {
        let log_path = log_path_opt
            .clone()
            .unwrap_or_else(|| config::data_file(config::LOG_FILE, path_config));
        let file = std::fs::File::create(&log_path)
            .with_context(|| format!("Failed to create log file: {}", log_path.display()))?;

        env_logger::Builder::new()
            .filter_level(log_level)
            .format_timestamp_millis()
            .target(env_logger::Target::Pipe(Box::new(file)))
            .init();
        info!("Logging to file: {} (level: {:?})", log_path.display(), log_level);
    } else {
        // Respects RUST_LOG if set
        let default_level = match args.verbosity {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
            .format_timestamp_millis()
            .init();
    }
    Ok(())
}

/// Source node and its frame range.
fn add_source(graph: &mut NodeGraph, args: &Args, config: &EngineConfig) -> Result<(NodeId, FrameRange)> {
    match &args.file_path {
        Some(path) => {
            let Some((mask, found)) = SequenceMask::from_path(path) else {
                bail!("Not a numbered sequence frame: {}", path.display());
            };
            let (first, last) = match args.range() {
                Some(range) => range,
                None => detect_range(&mask)?.map_or((found, found), |r| (r.first, r.last)),
            };
            info!("Input sequence: {}{}{} [{}..{}]", mask.prefix, "#".repeat(mask.padding), mask.suffix, first, last);
            let decoder = SequenceDecoder::new(mask, first, last);
            let id = graph.add(ReaderNode::new("read", decoder, config.decode_buffer_capacity));
            Ok((id, FrameRange::new(first, last)))
        }
        None => {
            let (first, last) = args.range().unwrap_or((1, 24));
            info!("No input file, using {}x{} color generator", args.width, args.height);
            let color = ColorNode::new("color", [0.18, 0.18, 0.18, 1.0], args.width, args.height).with_range(first, last);
            Ok((graph.add(color), FrameRange::new(first, last)))
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let path_config = PathConfig::from_env_and_cli(args.config_dir.clone());
    if let Err(e) = config::ensure_dirs(&path_config) {
        eprintln!("Warning: Failed to create application directories: {}", e);
    }
    init_logging(&args, &path_config)?;

    info!("graphplay {} starting...", env!("CARGO_PKG_VERSION"));
    debug!("Command-line args: {:?}", args);

    let config_path = config::config_file(config::CONFIG_FILE, &path_config);
    info!("Config path: {}", config_path.display());
    let mut engine_config = EngineConfig::load(&config_path)?;
    if let Some(fps) = args.fps {
        engine_config.fps = fps;
    }
    if let Some(workers) = args.workers {
        engine_config.worker_threads = workers;
    }
    if let Some(frame) = args.start_frame {
        engine_config.start_frame = frame;
    }
    if let Some(enabled) = args.loop_playback {
        engine_config.loop_mode = enabled != 0;
    }

    let manager = match (args.mem_percent, engine_config.cache_max_bytes) {
        (Some(percent), _) => CacheManager::new(percent / 100.0, engine_config.cache_reserve_gb),
        (None, Some(bytes)) => CacheManager::with_limit(bytes),
        (None, None) => CacheManager::new(engine_config.cache_mem_fraction, engine_config.cache_reserve_gb),
    };
    let cache = Arc::new(FrameCache::new(0, Arc::new(manager)));

    let mut graph = NodeGraph::new();
    let (source, range) = add_source(&mut graph, &args, &engine_config)?;
    let grade = graph.add(BrightnessNode::new("grade", args.brightness, args.contrast));
    graph.try_connect(source, grade, 0)?;

    let (output, kind, sink) = match &args.write_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
            let pattern: PathBuf = dir.join("frame.*.png");
            let mask = SequenceMask::parse(&pattern.to_string_lossy(), 4)
                .ok_or_else(|| anyhow!("Bad output pattern: {}", pattern.display()))?;
            (graph.add(WriterNode::new("write")), OutputKind::Writer, DemoSink { output: Some(mask) })
        }
        None => (graph.add(ViewerNode::new("viewer")), OutputKind::Viewer, DemoSink { output: None }),
    };
    graph.try_connect(grade, output, 0)?;

    let graph = Arc::new(RwLock::new(graph));
    let engine = Engine::new(engine_config, graph, cache.clone(), Box::new(sink))?;
    let handle = engine.handle();
    let events = engine.events();
    let control = engine.spawn().context("Failed to start engine thread")?;

    handle.set_output(Some(output), kind)?;
    let frames = args.frames.unwrap_or(range.len() as u32);
    handle.play(FrameCount::Finite(frames), !args.reverse)?;

    let mut started = false;
    for event in events.iter() {
        debug!("Event: {:?}", event);
        match event {
            EngineEvent::StateChanged(EngineState::Running) => started = true,
            EngineEvent::StateChanged(EngineState::Idle) if started => break,
            EngineEvent::FpsChanged(fps) => info!("Playback: {:.1} fps", fps),
            EngineEvent::Error(message) => {
                error!("{}", message);
                break;
            }
            _ => {}
        }
    }

    let stats = cache.stats_snapshot();
    let (usage, limit) = cache.manager().mem();
    info!(
        "Cache: {} frames, {} hits, {} misses ({:.0}%), {} / {} MB",
        stats.size,
        stats.hits,
        stats.misses,
        stats.hit_rate() * 100.0,
        usage / 1024 / 1024,
        limit / 1024 / 1024
    );

    handle.shutdown()?;
    control.join().map_err(|_| anyhow!("Engine thread panicked"))?;
    Ok(())
}
