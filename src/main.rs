use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use daxkit::convert::{self, ConvertConfig, ErrorPolicy};
use daxkit::progress::{format_duration, ConvertSummary, ProgressConfig, ProgressMode};
use daxkit::{DaxReader, MovieMetadata, MovieReader, ReaderOptions};
use env_logger::Env;
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(
    name = "daxkit",
    version,
    about = "Read .dax/.inf raw microscopy movies and convert them to TIFF stacks"
)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert every .dax movie in a folder into a multi-page 16-bit TIFF
    Convert {
        input_dir: PathBuf,

        /// Write TIFFs here instead of next to each movie
        #[arg(long)]
        output_dir: Option<PathBuf>,

        /// Also convert movies in subdirectories
        #[arg(long, default_value_t = false)]
        recursive: bool,

        /// Skip movies that fail instead of stopping the batch
        #[arg(long, default_value_t = false)]
        keep_going: bool,

        /// Progress display mode: auto (TTY-aware), rich, plain, quiet.
        #[arg(long, value_enum, default_value_t = ProgressMode::Auto)]
        progress: ProgressMode,
    },

    /// Print the metadata parsed from a movie's sidecar
    Info {
        movie: PathBuf,

        /// Emit JSON instead of text
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Average a range of frames into a 32-bit float TIFF
    Average {
        movie: PathBuf,
        output: PathBuf,

        /// First frame (inclusive). Default: 0.
        #[arg(long)]
        start: Option<usize>,

        /// Last frame (exclusive). Default: frame count.
        #[arg(long)]
        end: Option<usize>,
    },

    /// Print the fingerprint of a movie (hash of its first frame)
    Hash { movie: PathBuf },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    match cli.cmd {
        Commands::Convert {
            input_dir,
            output_dir,
            recursive,
            keep_going,
            progress,
        } => {
            let cfg = ConvertConfig {
                output_dir,
                recursive,
                policy: if keep_going {
                    ErrorPolicy::Skip
                } else {
                    ErrorPolicy::Abort
                },
                progress: ProgressConfig::new(progress),
                reader: ReaderOptions { verbose: true },
            };
            let summary = convert::convert_folder(&input_dir, &cfg)?;
            print_convert_summary(&summary);
            if !summary.failed.is_empty() {
                bail!(
                    "{} of {} movies failed to convert",
                    summary.failed.len(),
                    summary.movie_count
                );
            }
        }

        Commands::Info { movie, json } => {
            let reader = DaxReader::open(&movie)
                .with_context(|| format!("reading metadata for {}", movie.display()))?;
            let report = InfoReport {
                movie: reader.path(),
                sidecar: reader.sidecar_path(),
                has_frame_data: reader.has_frame_data(),
                film_size: reader.film_size(),
                film_location: reader.film_location(),
                film_scale: reader.film_scale(),
                lock_target: reader.lock_target(),
                metadata: reader.metadata(),
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_info(&report);
            }
        }

        Commands::Average {
            movie,
            output,
            start,
            end,
        } => {
            let pixels = convert::write_average(&movie, &output, start, end, ReaderOptions::default())
                .with_context(|| format!("averaging {}", movie.display()))?;
            println!("Average written: {} ({} pixels)", output.display(), pixels);
        }

        Commands::Hash { movie } => {
            let mut reader = DaxReader::open(&movie)
                .with_context(|| format!("opening {}", movie.display()))?;
            println!("{}", reader.hash_id()?);
        }
    }

    Ok(())
}

#[derive(Serialize)]
struct InfoReport<'a> {
    movie: &'a Path,
    sidecar: &'a Path,
    has_frame_data: bool,
    film_size: [usize; 3],
    film_location: (f64, f64),
    film_scale: (i64, i64),
    lock_target: f64,
    metadata: &'a MovieMetadata,
}

fn print_info(report: &InfoReport<'_>) {
    let m = report.metadata;
    println!("movie: {}", report.movie.display());
    println!("sidecar: {}", report.sidecar.display());
    println!("frame data: {}", if report.has_frame_data { "present" } else { "missing" });
    println!("size: {} x {}", m.frame_width, m.frame_height);
    match m.frame_count {
        Some(n) => println!("frames: {}", n),
        None => println!("frames: unknown"),
    }
    println!("byte order: {}", if m.big_endian { "big endian" } else { "little endian" });
    println!(
        "stage: x={} y={}",
        report.film_location.0, report.film_location.1
    );
    println!("scale: {} .. {}", report.film_scale.0, report.film_scale.1);
    println!("lock target: {}", report.lock_target);
    for warning in &m.warnings {
        println!("  warning: {}", warning);
    }
}

fn print_convert_summary(summary: &ConvertSummary) {
    println!(
        "Convert summary: input={} movies={} converted={} failed={} frames={} duration={} throughput={:.1} frames/s warnings={}",
        summary.input_dir.display(),
        summary.movie_count,
        summary.converted,
        summary.failed.len(),
        summary.frames_written,
        format_duration(summary.elapsed),
        summary.avg_frames_per_sec,
        summary.warning_count,
    );
    for output in &summary.outputs {
        println!("  wrote: {}", output.display());
    }
    for warning in &summary.warnings {
        println!("  warning: {}", warning);
    }
}
