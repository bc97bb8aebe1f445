//! Image file I/O through the `image` crate.
//!
//! [`SequenceDecoder`] reads numbered image sequences (EXR, PNG, JPEG, TIFF,
//! TGA, HDR) as a [`Decoder`]. These formats are decoded whole, so readers
//! built on it use full-frame deduplication. [`save_png`] writes a rendered
//! frame as 8-bit sRGB. [`detect_range`] finds the frames of a sequence on
//! disk.

use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};
use std::path::Path;

use log::{debug, info};

use super::error::DecodeError;
use super::frame::{Channel, ChannelSet, Frame, FrameRange, Region, Row};
use super::reader::{linear_to_srgb8, Decoder, SequenceMask, SourceHeader};

/// Image sequence on disk: `mask` expanded for every frame of `range`.
#[derive(Debug, Clone)]
pub struct SequenceDecoder {
    mask: SequenceMask,
    range: FrameRange,
}

impl SequenceDecoder {
    pub fn new(mask: SequenceMask, first: i32, last: i32) -> Self {
        Self { mask, range: FrameRange::new(first, last) }
    }

    pub fn mask(&self) -> &SequenceMask {
        &self.mask
    }
}

impl Decoder for SequenceDecoder {
    fn identity(&self, frame: i32) -> String {
        self.mask.path(frame).to_string_lossy().to_string()
    }

    fn frame_range(&self) -> FrameRange {
        self.range
    }

    fn header(&self, frame: i32) -> Result<SourceHeader, DecodeError> {
        let path = self.mask.path(frame);
        debug!("Reading image header: {}", path.display());
        let (width, height) = image::image_dimensions(&path).map_err(|e| DecodeError::Header {
            identity: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Ok(SourceHeader {
            format: Region::with_size(width as i32, height as i32),
            channels: ChannelSet::RGBA,
        })
    }

    fn supports_scanlines(&self) -> bool {
        false
    }

    fn decode_rows(
        &self,
        frame: i32,
        header: &SourceHeader,
        rows: &BTreeSet<i32>,
    ) -> Result<Vec<Row>, DecodeError> {
        let all = self.decode_full(frame, header)?;
        Ok(all.into_iter().filter(|r| rows.contains(&r.y())).collect())
    }

    fn decode_full(&self, frame: i32, header: &SourceHeader) -> Result<Vec<Row>, DecodeError> {
        let path = self.mask.path(frame);
        debug!("Loading image: {}", path.display());
        let img = image::open(&path)
            .map_err(|e| DecodeError::Data { identity: path.display().to_string(), reason: e.to_string() })?
            .to_rgba32f();

        let format = header.format;
        let mut rows = Vec::with_capacity(img.height() as usize);
        for (y, pixels) in img.rows().enumerate() {
            let mut row = Row::new(format.y + y as i32, format.x, format.r, header.channels);
            for (x, px) in pixels.enumerate() {
                for ch in Channel::ALL {
                    if let Some(plane) = row.channel_mut(ch) {
                        if let Some(dst) = plane.get_mut(x) {
                            *dst = px.0[ch.index()];
                        }
                    }
                }
            }
            rows.push(row);
        }
        Ok(rows)
    }

    fn settings_hash(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.mask.hash(&mut hasher);
        self.range.hash(&mut hasher);
        hasher.finish()
    }
}

/// First and last frame of `mask` found on disk; `None` when nothing matches.
///
/// Numbers shorter than the mask padding are ignored, longer ones only
/// without leading zeros (frame 10000 of a 4-digit sequence).
pub fn detect_range(mask: &SequenceMask) -> anyhow::Result<Option<FrameRange>> {
    let prefix = mask.prefix.replace('\\', "/");
    let suffix = mask.suffix.replace('\\', "/");
    let pattern = format!("{}*{}", glob::Pattern::escape(&prefix), glob::Pattern::escape(&suffix));
    let paths = glob_paths(&pattern)?;

    let (prefix, suffix) = (prefix.to_ascii_lowercase(), suffix.to_ascii_lowercase());
    let range = paths
        .iter()
        .filter_map(|path| {
            let name = path.to_string_lossy().replace('\\', "/").to_ascii_lowercase();
            let digits = name.strip_prefix(&prefix)?.strip_suffix(&suffix)?;
            let padded = digits.len() == mask.padding || (digits.len() > mask.padding && !digits.starts_with('0'));
            if !padded || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            digits.parse::<i32>().ok()
        })
        .fold(None, |acc: Option<FrameRange>, n| {
            Some(acc.map_or(FrameRange::single(n), |r| r.union(&FrameRange::single(n))))
        });

    match range {
        Some(r) => info!("Detected frames {}..{} for {}", r.first, r.last, pattern),
        None => debug!("No frames on disk for {}", pattern),
    }
    Ok(range)
}

/// Expand a glob pattern into a list of paths.
fn glob_paths(pattern: &str) -> anyhow::Result<Vec<std::path::PathBuf>> {
    use anyhow::Context;

    // Case-insensitive for Windows (TGA vs tga)
    let options = glob::MatchOptions { case_sensitive: false, ..Default::default() };
    let mut paths = Vec::new();
    for entry in glob::glob_with(pattern, options).with_context(|| format!("Bad glob pattern: {}", pattern))? {
        paths.push(entry.context("Glob entry error")?);
    }
    debug!("glob_paths: {} files for {}", paths.len(), pattern);
    Ok(paths)
}

/// Write `frame` as an 8-bit sRGB PNG. Rows missing from a subsampled
/// frame stay black.
pub fn save_png(frame: &Frame, path: &Path) -> anyhow::Result<()> {
    use anyhow::Context;

    let region = frame.region();
    let (width, height) = (region.width().max(0) as u32, region.height().max(0) as u32);
    let mut img = image::RgbaImage::new(width, height);

    for row in frame.rows() {
        let y = row.y() - region.y;
        if y < 0 || y as u32 >= height {
            continue;
        }
        for i in 0..row.width() {
            let x = row.x() - region.x + i as i32;
            if x < 0 || x as u32 >= width {
                continue;
            }
            let sample = |ch: Channel| row.channel(ch).map(|p| p[i]);
            let px = [
                linear_to_srgb8(sample(Channel::Red).unwrap_or(0.0)),
                linear_to_srgb8(sample(Channel::Green).unwrap_or(0.0)),
                linear_to_srgb8(sample(Channel::Blue).unwrap_or(0.0)),
                (sample(Channel::Alpha).unwrap_or(1.0).clamp(0.0, 1.0) * 255.0).round() as u8,
            ];
            img.put_pixel(x as u32, y as u32, image::Rgba(px));
        }
    }
    img.save(path).with_context(|| format!("Failed to write {}", path.display()))?;
    debug!("Wrote frame {} to {}", frame.number(), path.display());
    Ok(())
}
