use clap::Parser;
use std::path::PathBuf;

/// Render an image sequence through a node graph
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// One frame of an image sequence (e.g. shot.0001.exr); a color generator is used when omitted
    #[arg(value_name = "FILE")]
    pub file_path: Option<PathBuf>,

    /// Sequence range (defaults to the frames of FILE's sequence on disk, or 1..24 for the generator)
    #[arg(long = "range", value_names = ["START", "END"], num_args = 2)]
    pub range: Option<Vec<i32>>,

    /// Start frame for viewer playback
    #[arg(long = "frame", value_name = "N")]
    pub start_frame: Option<i32>,

    /// Frames to play in viewer mode (default: the whole range once)
    #[arg(short = 'n', long = "frames", value_name = "N")]
    pub frames: Option<u32>,

    /// Play backward
    #[arg(short = 'r', long = "reverse")]
    pub reverse: bool,

    /// Enable looping (default: from config, which defaults to true)
    #[arg(short = 'o', long = "loop", value_name = "0|1")]
    pub loop_playback: Option<u8>,

    /// Playback rate (0 = as fast as possible)
    #[arg(long = "fps", value_name = "FPS")]
    pub fps: Option<f64>,

    /// Write frames as PNG into DIR instead of viewing them
    #[arg(short = 'w', long = "write", value_name = "DIR")]
    pub write_dir: Option<PathBuf>,

    /// Generator width
    #[arg(long = "width", value_name = "PX", default_value = "640")]
    pub width: i32,

    /// Generator height
    #[arg(long = "height", value_name = "PX", default_value = "360")]
    pub height: i32,

    /// Brightness offset (-1..1)
    #[arg(short = 'b', long = "brightness", value_name = "B", default_value = "0", allow_negative_numbers = true)]
    pub brightness: f32,

    /// Contrast (-1..1)
    #[arg(long = "contrast", value_name = "C", default_value = "0", allow_negative_numbers = true)]
    pub contrast: f32,

    /// Row worker threads (0 = one per core)
    #[arg(long = "workers", value_name = "N")]
    pub workers: Option<usize>,

    /// Cache memory budget in percent of available memory
    #[arg(long = "mem", value_name = "PERCENT")]
    pub mem_percent: Option<f64>,

    /// Enable debug logging to file (default: graphplay.log)
    #[arg(short = 'l', long = "log", value_name = "LOG_FILE")]
    pub log_file: Option<Option<PathBuf>>,

    /// Increase logging verbosity (default: warn, -v: info, -vv: debug, -vvv+: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbosity: u8,

    /// Custom configuration directory (overrides default platform paths)
    #[arg(short = 'c', long = "config-dir", value_name = "DIR")]
    pub config_dir: Option<PathBuf>,
}

impl Args {
    /// Explicit `--range`, if given.
    pub fn range(&self) -> Option<(i32, i32)> {
        match self.range.as_deref() {
            Some([start, end]) => Some((*start, *end)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["graphplay"]);
        assert!(args.file_path.is_none());
        assert_eq!(args.loop_playback, None);
        assert_eq!(args.verbosity, 0);
        assert!(args.log_file.is_none());
        assert_eq!(args.range(), None);
    }

    #[test]
    fn test_flags() {
        let args = Args::parse_from([
            "graphplay", "shot.0001.png", "--range", "1", "10", "-vv", "-o", "0", "--log", "-w", "out", "-b", "-0.25",
        ]);
        assert_eq!(args.file_path, Some(PathBuf::from("shot.0001.png")));
        assert_eq!(args.range(), Some((1, 10)));
        assert_eq!(args.verbosity, 2);
        assert_eq!(args.loop_playback, Some(0));
        assert_eq!(args.log_file, Some(None));
        assert_eq!(args.write_dir, Some(PathBuf::from("out")));
        assert_eq!(args.brightness, -0.25);
    }
}
