//! ReaderNode - source node reading image sequences through a [`Decoder`].
//!
//! The node has no inputs. `prepare` reads the header of the frame about to
//! be rendered; `render` pulls the requested scanline out of a shared
//! [`DecodeBuffer`] so that workers rendering neighbouring rows (or the
//! same row through two branches of the graph) decode each scanline once.
//!
//! Decoders that can only produce whole images (`supports_scanlines() ==
//! false`) are decoded once per frame by whichever worker asks first; the
//! others wait on the buffer.

use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use log::{debug, trace};

use super::error::{DecodeError, RowError, ValidationError};
use super::frame::{Channel, ChannelSet, FrameRange, Region, Row};
use super::node::{Node, NodeInfo, RowContext};
use crate::core::decode_buffer::{DecodeBuffer, DecodeDecision, DecodeKind};

/// Data window and channels of one frame on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceHeader {
    pub format: Region,
    pub channels: ChannelSet,
}

/// Format-specific reading. Implementations are shared between workers.
pub trait Decoder: Send + Sync {
    /// Stable identity of one frame's data, usually the resolved file path.
    fn identity(&self, frame: i32) -> String;

    fn frame_range(&self) -> FrameRange;

    fn header(&self, frame: i32) -> Result<SourceHeader, DecodeError>;

    fn supports_scanlines(&self) -> bool {
        true
    }

    /// Scanlines decoded together (e.g. EXR chunk height). Requests are
    /// widened to whole blocks.
    fn rows_per_block(&self) -> i32 {
        1
    }

    /// Decode the given scanlines. Must return one row per requested `y`.
    fn decode_rows(
        &self,
        frame: i32,
        header: &SourceHeader,
        rows: &BTreeSet<i32>,
    ) -> Result<Vec<Row>, DecodeError>;

    /// Decode the whole data window.
    fn decode_full(&self, frame: i32, header: &SourceHeader) -> Result<Vec<Row>, DecodeError> {
        let all = (header.format.y..header.format.t).collect::<BTreeSet<_>>();
        self.decode_rows(frame, header, &all)
    }

    /// Hash of decoder settings affecting pixels.
    fn settings_hash(&self) -> u64 {
        0
    }
}

/// File name pattern of an image sequence: `prefix` + padded number + `suffix`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SequenceMask {
    pub prefix: String,
    pub padding: usize,
    pub suffix: String,
}

impl SequenceMask {
    /// Parse `"shot.*.exr"` (or `"shot.####.exr"`, padding = number of `#`).
    pub fn parse(mask: &str, default_padding: usize) -> Option<Self> {
        if let Some((prefix, suffix)) = mask.split_once('*') {
            return Some(Self {
                prefix: prefix.to_string(),
                padding: default_padding,
                suffix: suffix.to_string(),
            });
        }
        let start = mask.find('#')?;
        let padding = mask[start..].chars().take_while(|c| *c == '#').count();
        Some(Self {
            prefix: mask[..start].to_string(),
            padding,
            suffix: mask[start + padding..].to_string(),
        })
    }

    /// Split a concrete frame path into mask and frame number.
    ///
    /// `/path/seq.0001.exr` -> (`/path/seq.` + 4 digits + `.exr`, 1)
    pub fn from_path(path: &Path) -> Option<(Self, i32)> {
        let ext = path.extension().and_then(|s| s.to_str())?;
        let stem = path.file_stem().and_then(|s| s.to_str())?;

        let digits = stem.chars().rev().take_while(|c| c.is_ascii_digit()).count();
        if digits == 0 {
            return None;
        }
        let split = stem.len() - digits;
        let number = stem[split..].parse::<i32>().ok()?;

        let prefix = match path.parent().map(|p| p.to_string_lossy().to_string()) {
            Some(p) if !p.is_empty() => format!("{}/{}", p, &stem[..split]),
            _ => stem[..split].to_string(),
        };
        Some((Self { prefix, padding: digits, suffix: format!(".{}", ext) }, number))
    }

    pub fn path(&self, frame: i32) -> PathBuf {
        let padding = self.padding;
        PathBuf::from(format!("{}{:0padding$}{}", self.prefix, frame, self.suffix))
    }
}

/// 8-bit sRGB thumbnail of one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preview {
    pub width: usize,
    pub height: usize,
    /// Packed RGB, row-major.
    pub rgb: Vec<u8>,
}

pub fn linear_to_srgb8(v: f32) -> u8 {
    let v = v.clamp(0.0, 1.0);
    let s = if v <= 0.003_130_8 { 12.92 * v } else { 1.055 * v.powf(1.0 / 2.4) - 0.055 };
    (s * 255.0).round().clamp(0.0, 255.0) as u8
}

/// Source node backed by a [`Decoder`] and a decode deduplication buffer.
pub struct ReaderNode<D> {
    name: String,
    decoder: D,
    buffer: DecodeBuffer<Row>,
    header: RwLock<Option<(i32, SourceHeader)>>,
}

impl<D: Decoder> ReaderNode<D> {
    /// `buffer_capacity` bounds the number of frames tracked at once.
    pub fn new(name: impl Into<String>, decoder: D, buffer_capacity: usize) -> Self {
        Self {
            name: name.into(),
            decoder,
            buffer: DecodeBuffer::new(buffer_capacity),
            header: RwLock::new(None),
        }
    }

    pub fn decoder(&self) -> &D {
        &self.decoder
    }

    pub fn buffer(&self) -> &DecodeBuffer<Row> {
        &self.buffer
    }

    /// Header for `frame`, reading it if `prepare` was not called for it.
    fn header_for(&self, frame: i32) -> Result<SourceHeader, DecodeError> {
        if let Some((f, header)) = *self.header.read().unwrap_or_else(|e| e.into_inner()) {
            if f == frame {
                return Ok(header);
            }
        }
        let header = self.decoder.header(frame)?;
        *self.header.write().unwrap_or_else(|e| e.into_inner()) = Some((frame, header));
        Ok(header)
    }

    /// Rows to claim when `y` is needed: its whole block, clipped to the data window.
    fn block_of(&self, y: i32, format: Region) -> BTreeSet<i32> {
        let block = self.decoder.rows_per_block().max(1);
        let start = format.y + (y - format.y).div_euclid(block) * block;
        (start.max(format.y)..(start + block).min(format.t)).collect()
    }

    fn decode_into_buffer(
        &self,
        frame: i32,
        identity: &str,
        header: &SourceHeader,
        decision: DecodeDecision,
    ) -> Result<(), DecodeError> {
        match decision {
            DecodeDecision::MustDecodeFull => match self.decoder.decode_full(frame, header) {
                Ok(rows) => {
                    trace!("{}: decoded full {}", self.name, identity);
                    self.buffer.commit_full(identity, rows.into_iter().map(|r| (r.y(), r)));
                    Ok(())
                }
                Err(e) => {
                    self.buffer.abandon(identity, &BTreeSet::new());
                    Err(e)
                }
            },
            DecodeDecision::MustDecode(rows) | DecodeDecision::MustDecodePartial(rows) => {
                match self.decoder.decode_rows(frame, header, &rows) {
                    Ok(decoded) => {
                        trace!("{}: decoded {} rows of {}", self.name, decoded.len(), identity);
                        // Rows the decoder skipped stay claimed otherwise
                        let missing = rows
                            .iter()
                            .filter(|y| !decoded.iter().any(|r| r.y() == **y))
                            .copied()
                            .collect::<BTreeSet<_>>();
                        self.buffer.commit_rows(identity, decoded.into_iter().map(|r| (r.y(), r)));
                        if !missing.is_empty() {
                            self.buffer.abandon(identity, &missing);
                            return Err(DecodeError::Data {
                                identity: identity.to_string(),
                                reason: format!("decoder skipped {} rows", missing.len()),
                            });
                        }
                        Ok(())
                    }
                    Err(e) => {
                        self.buffer.abandon(identity, &rows);
                        Err(e)
                    }
                }
            }
            DecodeDecision::AlreadySatisfied | DecodeDecision::InProgress => Ok(()),
        }
    }

    /// Decode a subsampled sRGB thumbnail of `frame`, every `stride`-th
    /// pixel in both directions. Leaves the decode buffer empty.
    pub fn preview(&self, frame: i32, stride: usize) -> Result<Preview, DecodeError> {
        let stride = stride.max(1);
        let header = self.decoder.header(frame)?;
        let format = header.format;
        let ys = (format.y..format.t).step_by(stride).collect::<BTreeSet<_>>();
        let rows = if self.decoder.supports_scanlines() {
            self.decoder.decode_rows(frame, &header, &ys)?
        } else {
            self.decoder
                .decode_full(frame, &header)?
                .into_iter()
                .filter(|r| ys.contains(&r.y()))
                .collect()
        };

        let width = (format.width().max(0) as usize).div_ceil(stride);
        let mut rgb = Vec::with_capacity(width * rows.len() * 3);
        for row in &rows {
            for i in (0..row.width()).step_by(stride) {
                for ch in [Channel::Red, Channel::Green, Channel::Blue] {
                    let v = row.channel(ch).map(|p| p[i]).unwrap_or(0.0);
                    rgb.push(linear_to_srgb8(v));
                }
            }
        }
        self.buffer.clear();
        debug!("{}: preview of frame {} ({}x{})", self.name, frame, width, rows.len());
        Ok(Preview { width, height: rows.len(), rgb })
    }
}

impl<D: Decoder> Node for ReaderNode<D> {
    fn name(&self) -> &str {
        &self.name
    }

    fn node_type(&self) -> &'static str {
        "Reader"
    }

    fn arity(&self) -> usize {
        0
    }

    fn hash(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.decoder.identity(self.decoder.frame_range().first).hash(&mut hasher);
        self.decoder.settings_hash().hash(&mut hasher);
        hasher.finish()
    }

    fn prepare(&self, frame: i32) -> Result<(), DecodeError> {
        let frame = self.decoder.frame_range().clamp(frame);
        self.header_for(frame).map(|_| ())
    }

    fn frame_range(&self, _inputs: &[FrameRange]) -> Result<FrameRange, ValidationError> {
        Ok(self.decoder.frame_range())
    }

    fn info(&self, _inputs: &[NodeInfo]) -> Result<NodeInfo, ValidationError> {
        let prepared = *self.header.read().unwrap_or_else(|e| e.into_inner());
        let (_, header) = prepared.ok_or_else(|| ValidationError::Invalid {
            node: self.name.clone(),
            reason: "no header has been read".into(),
        })?;
        Ok(NodeInfo {
            range: self.decoder.frame_range(),
            format: header.format,
            channels: header.channels,
        })
    }

    fn render(&self, ctx: &RowContext<'_>, out: &mut Row) -> Result<(), RowError> {
        // Outside the sequence: hold the nearest frame
        let frame = self.decoder.frame_range().clamp(ctx.frame());
        let header = self.header_for(frame).map_err(|e| RowError::failed(e.to_string()))?;
        let y = ctx.y();
        if !header.format.contains_row(y) {
            return Ok(());
        }

        let identity = self.decoder.identity(frame);
        let kind = if self.decoder.supports_scanlines() {
            DecodeKind::Scanline
        } else {
            DecodeKind::FullFrame
        };
        let wanted = self.block_of(y, header.format);
        let mut retried = false;

        loop {
            if ctx.is_aborted() {
                return Err(RowError::Aborted);
            }
            if let Some(row) = self.buffer.row(&identity, y) {
                out.copy_from(&row);
                return Ok(());
            }
            match self.buffer.request_decode(&identity, kind, &wanted) {
                DecodeDecision::AlreadySatisfied if retried => {
                    return Err(RowError::failed(format!("row {} missing from decoded {}", y, identity)));
                }
                DecodeDecision::AlreadySatisfied => {
                    // Evicted and redecoded between the two lookups
                    retried = true;
                }
                DecodeDecision::InProgress => {
                    let single = BTreeSet::from([y]);
                    self.buffer.wait_for(&identity, &single, || ctx.is_aborted());
                }
                decision => {
                    self.decode_into_buffer(frame, &identity, &header, decision)
                        .map_err(|e| RowError::failed(e.to_string()))?;
                }
            }
        }
    }
}
