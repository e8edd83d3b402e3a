//! Batch conversion of `.dax` movies into multi-page 16-bit TIFF stacks.

use crate::metadata::MovieMetadata;
use crate::progress::{ConvertSummary, ProgressConfig, ProgressReporter};
use crate::reader::{DaxReader, MovieReader, ReaderOptions};
use crate::util::{self, RAW_EXTENSION};

use anyhow::{bail, Context, Result};
use clap::ValueEnum;
use std::fs::{self, File};
use std::io::{BufWriter, Seek, Write};
use std::path::{Path, PathBuf};
use tiff::encoder::{colortype, TiffEncoder};

/// What to do when one movie in a batch fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "lower")]
pub enum ErrorPolicy {
    /// Stop the batch at the first failure.
    Abort,
    /// Record the failure and continue with the next movie.
    Skip,
}

#[derive(Debug, Clone)]
pub struct ConvertConfig {
    /// Defaults to writing each TIFF next to its movie.
    pub output_dir: Option<PathBuf>,
    pub recursive: bool,
    pub policy: ErrorPolicy,
    pub progress: ProgressConfig,
    pub reader: ReaderOptions,
}

impl Default for ConvertConfig {
    fn default() -> Self {
        Self {
            output_dir: None,
            recursive: false,
            policy: ErrorPolicy::Abort,
            progress: ProgressConfig::default(),
            reader: ReaderOptions { verbose: true },
        }
    }
}

pub fn convert_folder(input_dir: &Path, cfg: &ConvertConfig) -> Result<ConvertSummary> {
    if !input_dir.is_dir() {
        bail!("input path {:?} is not a directory", input_dir);
    }

    let movies = util::list_by_extension(input_dir, RAW_EXTENSION, cfg.recursive)?;
    if movies.is_empty() {
        bail!("No .{} files found in {:?}", RAW_EXTENSION, input_dir);
    }
    let mut progress = ProgressReporter::new("convert", movies.len(), cfg.progress);
    progress.log(format!("Found {} movies in {}", movies.len(), input_dir.display()));

    let mut outputs = Vec::new();
    let mut failed = Vec::new();
    let mut frames_written = 0u64;

    for raw in &movies {
        let out = util::tiff_output_path(raw, input_dir, cfg.output_dir.as_deref());
        let result = convert_movie(raw, &out, cfg.reader, Some(&mut progress));
        progress.end_movie(result.is_ok());
        match result {
            Ok(frames) => {
                frames_written += frames;
                outputs.push(out);
            }
            Err(e) => match cfg.policy {
                ErrorPolicy::Abort => {
                    return Err(e.context(format!("converting {}", raw.display())));
                }
                ErrorPolicy::Skip => {
                    progress.warn(format!("skipped {}: {:#}", raw.display(), e));
                    failed.push(raw.clone());
                }
            },
        }
    }

    let outcome = progress.finish(format!(
        "{} of {} movies converted",
        outputs.len(),
        movies.len()
    ));

    Ok(ConvertSummary {
        input_dir: input_dir.to_path_buf(),
        movie_count: movies.len(),
        converted: outputs.len(),
        outputs,
        failed,
        frames_written,
        elapsed: outcome.elapsed,
        avg_frames_per_sec: outcome.avg_frames_per_sec,
        warning_count: outcome.warning_count,
        warnings: outcome.warnings,
    })
}

/// Convert one movie to a TIFF stack, one page per frame in index order.
/// Output is written to a temporary name and only renamed into place once
/// every frame decoded.
pub fn convert_movie(
    raw: &Path,
    out: &Path,
    options: ReaderOptions,
    mut progress: Option<&mut ProgressReporter>,
) -> Result<u64> {
    let mut reader = DaxReader::open_with(raw, options)?;
    if !reader.has_frame_data() {
        bail!("raw frame data missing for {}", raw.display());
    }
    let frame_count = match reader.metadata().frame_count {
        Some(0) | None => bail!("{} declares no frames", reader.sidecar_path().display()),
        Some(n) => n,
    };
    if let Some(p) = progress.as_deref_mut() {
        let name = raw
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        p.begin_movie(name, frame_count);
    }

    if let Some(parent) = out.parent() {
        fs::create_dir_all(parent)?;
    }
    let partial = partial_path(out);
    let written = write_stack(&mut reader, &partial, progress);
    reader.close();

    match written {
        Ok(frames) => {
            fs::rename(&partial, out)
                .with_context(|| format!("rename {:?} -> {:?}", partial, out))?;
            Ok(frames)
        }
        Err(e) => {
            let _ = fs::remove_file(&partial);
            Err(e)
        }
    }
}

fn write_stack(
    reader: &mut DaxReader,
    path: &Path,
    mut progress: Option<&mut ProgressReporter>,
) -> Result<u64> {
    let (width, height) = tiff_dims(reader.metadata())?;

    let file = File::create(path).with_context(|| format!("create {:?}", path))?;
    let mut writer = BufWriter::new(file);
    let mut frames = 0u64;
    {
        let mut encoder = TiffEncoder::new(&mut writer)?;
        for item in reader.frames(None, None) {
            let (_, frame) = item?;
            let samples = frame.as_slice().context("frame is not contiguous")?;
            encoder.write_image::<colortype::Gray16>(width, height, samples)?;
            frames += 1;
            if let Some(p) = progress.as_deref_mut() {
                p.frame_done();
            }
        }
    }
    writer.flush()?;
    Ok(frames)
}

/// Write the mean of frames `start..end` as a single-page 32-bit float TIFF.
pub fn write_average(
    raw: &Path,
    out: &Path,
    start: Option<usize>,
    end: Option<usize>,
    options: ReaderOptions,
) -> Result<usize> {
    let mut reader = DaxReader::open_with(raw, options)?;
    let (width, height) = tiff_dims(reader.metadata())?;
    let average = reader.average_frames(start, end)?;
    let samples: Vec<f32> = average.iter().map(|v| *v as f32).collect();

    if let Some(parent) = out.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = File::create(out).with_context(|| format!("create {:?}", out))?;
    let mut writer = BufWriter::new(file);
    write_float_page(&mut writer, width, height, &samples)?;
    writer.flush()?;
    Ok(samples.len())
}

fn write_float_page<W: Write + Seek>(w: &mut W, width: u32, height: u32, data: &[f32]) -> Result<()> {
    let mut encoder = TiffEncoder::new(w)?;
    encoder.write_image::<colortype::Gray32Float>(width, height, data)?;
    Ok(())
}

fn tiff_dims(meta: &MovieMetadata) -> Result<(u32, u32)> {
    let width = u32::try_from(meta.frame_width).context("frame width exceeds TIFF limits")?;
    let height = u32::try_from(meta.frame_height).context("frame height exceeds TIFF limits")?;
    Ok((width, height))
}

fn partial_path(out: &Path) -> PathBuf {
    let mut name = out.file_name().map(|s| s.to_os_string()).unwrap_or_default();
    name.push(".partial");
    out.with_file_name(name)
}
