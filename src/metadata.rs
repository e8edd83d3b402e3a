//! Parser for the `.inf` sidecar that describes a `.dax` movie.
//!
//! The sidecar is line oriented `key = value` text. Only a handful of keys
//! matter for decoding; every other line is ignored so newer acquisition
//! software can add fields freely.

use crate::error::{DaxError, Result};

use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Frame edge used when the sidecar does not declare dimensions.
pub const DEFAULT_FRAME_SIZE: usize = 256;

/// Display scale reported when the sidecar lacks `scalemin`/`scalemax`.
pub const DEFAULT_SCALE: (i64, i64) = (100, 2000);

pub const SIDECAR_EXTENSION: &str = "inf";

/// Non-fatal findings recorded while parsing a sidecar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MetadataWarning {
    /// No usable `frame dimensions` line; the default size was assumed.
    DefaultFrameSize { width: usize, height: usize },
}

impl fmt::Display for MetadataWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataWarning::DefaultFrameSize { width, height } => write!(
                f,
                "could not determine image size, assuming {}x{}",
                width, height
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MovieMetadata {
    pub frame_width: usize,
    pub frame_height: usize,
    /// `None` when the sidecar never declared `number of frames`.
    pub frame_count: Option<usize>,
    pub big_endian: bool,
    pub stage_x: Option<f64>,
    pub stage_y: Option<f64>,
    pub lock_target: Option<f64>,
    pub scale_min: Option<i64>,
    pub scale_max: Option<i64>,
    pub warnings: Vec<MetadataWarning>,
}

impl MovieMetadata {
    /// `None` when the geometry does not fit in memory arithmetic.
    pub fn samples_per_frame(&self) -> Option<usize> {
        self.frame_width.checked_mul(self.frame_height)
    }

    pub fn bytes_per_frame(&self) -> Option<usize> {
        self.samples_per_frame()?.checked_mul(2)
    }

    /// Byte offset of `frame` from the start of the raw file.
    pub fn frame_offset(&self, frame: usize) -> Option<u64> {
        let per_frame = u64::try_from(self.bytes_per_frame()?).ok()?;
        u64::try_from(frame).ok()?.checked_mul(per_frame)
    }

    /// Byte offset one past the end of `frame`.
    pub fn frame_end(&self, frame: usize) -> Option<u64> {
        self.frame_offset(frame.checked_add(1)?)
    }

    pub fn used_default_size(&self) -> bool {
        self.warnings
            .iter()
            .any(|w| matches!(w, MetadataWarning::DefaultFrameSize { .. }))
    }
}

/// Sidecar path for a raw movie: same directory and stem, `.inf` extension.
pub fn sidecar_path(raw_path: &Path) -> PathBuf {
    raw_path.with_extension(SIDECAR_EXTENSION)
}

/// Parse the sidecar at `path`. Warnings are recorded on the result and also
/// emitted through `log`.
pub fn parse_sidecar(path: &Path) -> Result<MovieMetadata> {
    let file = File::open(path).map_err(|e| DaxError::io(path, e))?;
    let meta = parse_reader(BufReader::new(file)).map_err(|e| DaxError::io(path, e))?;
    for warning in &meta.warnings {
        log::warn!("{}: {}", path.display(), warning);
    }
    log::debug!(
        "{}: {}x{} frames={:?} big_endian={}",
        path.display(),
        meta.frame_width,
        meta.frame_height,
        meta.frame_count,
        meta.big_endian
    );
    Ok(meta)
}

/// Parse sidecar text from any buffered reader. Does not log.
pub fn parse_reader<R: BufRead>(mut reader: R) -> io::Result<MovieMetadata> {
    let patterns = Patterns::new();
    let mut fields = Fields::default();
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        let line = String::from_utf8_lossy(&buf);
        fields.apply(&patterns, line.trim_end_matches(&['\n', '\r'][..]));
    }
    Ok(fields.finish())
}

struct Patterns {
    size: Regex,
    length: Regex,
    endian: Regex,
    stage_x: Regex,
    stage_y: Regex,
    lock_target: Regex,
    scale_max: Regex,
    scale_min: Regex,
}

impl Patterns {
    fn new() -> Self {
        // Literal patterns; compilation cannot fail.
        let re = |p: &str| Regex::new(p).expect("valid sidecar pattern");
        Self {
            size: re(r"^frame dimensions = (\d+) x (\d+)"),
            length: re(r"^number of frames = (\d+)"),
            endian: re(r" (big|little) endian"),
            stage_x: re(r"^Stage X = ([\d.\-]+)"),
            stage_y: re(r"^Stage Y = ([\d.\-]+)"),
            lock_target: re(r"^Lock Target = ([\d.\-]+)"),
            scale_max: re(r"^scalemax = ([\d.\-]+)"),
            scale_min: re(r"^scalemin = ([\d.\-]+)"),
        }
    }
}

#[derive(Default)]
struct Fields {
    width: Option<usize>,
    height: Option<usize>,
    frame_count: Option<usize>,
    big_endian: Option<bool>,
    stage_x: Option<f64>,
    stage_y: Option<f64>,
    lock_target: Option<f64>,
    scale_min: Option<i64>,
    scale_max: Option<i64>,
}

impl Fields {
    // Every pattern is tried on every line; later lines overwrite earlier ones.
    fn apply(&mut self, p: &Patterns, line: &str) {
        if let Some(caps) = p.size.captures(line) {
            if let (Ok(w), Ok(h)) = (caps[1].parse::<usize>(), caps[2].parse::<usize>()) {
                self.width = Some(w);
                self.height = Some(h);
            }
        }
        if let Some(n) = capture::<usize>(&p.length, line) {
            self.frame_count = Some(n);
        }
        if let Some(caps) = p.endian.captures(line) {
            self.big_endian = Some(&caps[1] == "big");
        }
        if let Some(v) = capture::<f64>(&p.stage_x, line) {
            self.stage_x = Some(v);
        }
        if let Some(v) = capture::<f64>(&p.stage_y, line) {
            self.stage_y = Some(v);
        }
        if let Some(v) = capture::<f64>(&p.lock_target, line) {
            self.lock_target = Some(v);
        }
        if let Some(v) = capture_truncated(&p.scale_max, line) {
            self.scale_max = Some(v);
        }
        if let Some(v) = capture_truncated(&p.scale_min, line) {
            self.scale_min = Some(v);
        }
    }

    fn finish(self) -> MovieMetadata {
        let mut warnings = Vec::new();
        let (frame_width, frame_height) = match (self.width, self.height) {
            (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
            _ => {
                warnings.push(MetadataWarning::DefaultFrameSize {
                    width: DEFAULT_FRAME_SIZE,
                    height: DEFAULT_FRAME_SIZE,
                });
                (DEFAULT_FRAME_SIZE, DEFAULT_FRAME_SIZE)
            }
        };
        MovieMetadata {
            frame_width,
            frame_height,
            frame_count: self.frame_count,
            big_endian: self.big_endian.unwrap_or(false),
            stage_x: self.stage_x,
            stage_y: self.stage_y,
            lock_target: self.lock_target,
            scale_min: self.scale_min,
            scale_max: self.scale_max,
            warnings,
        }
    }
}

fn capture<T: FromStr>(re: &Regex, line: &str) -> Option<T> {
    re.captures(line).and_then(|caps| caps[1].parse::<T>().ok())
}

fn capture_truncated(re: &Regex, line: &str) -> Option<i64> {
    capture::<f64>(re, line)
        .filter(|v| v.is_finite())
        .map(|v| v.trunc() as i64)
}
