use clap::ValueEnum;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::time::{Duration, Instant};

const MAX_STORED_WARNINGS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "lower")]
pub enum ProgressMode {
    Auto,
    Rich,
    Plain,
    Quiet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedProgressMode {
    Rich,
    Plain,
    Quiet,
}

#[derive(Debug, Clone, Copy)]
pub struct ProgressConfig {
    pub mode: ProgressMode,
    /// Minimum gap between per-frame lines in plain mode.
    pub plain_interval: Duration,
    tty_override: Option<bool>,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            mode: ProgressMode::Auto,
            plain_interval: Duration::from_secs(2),
            tty_override: None,
        }
    }
}

impl ProgressConfig {
    pub fn new(mode: ProgressMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    pub fn quiet() -> Self {
        Self::new(ProgressMode::Quiet)
    }

    #[cfg(test)]
    pub fn with_tty_override(mut self, is_tty: bool) -> Self {
        self.tty_override = Some(is_tty);
        self
    }

    pub fn resolve_mode(self) -> ResolvedProgressMode {
        self.mode.resolve(
            self.tty_override
                .unwrap_or_else(|| std::io::stderr().is_terminal()),
        )
    }
}

impl ProgressMode {
    fn resolve(self, stderr_is_tty: bool) -> ResolvedProgressMode {
        match self {
            ProgressMode::Auto => {
                if stderr_is_tty {
                    ResolvedProgressMode::Rich
                } else {
                    ResolvedProgressMode::Plain
                }
            }
            ProgressMode::Rich => ResolvedProgressMode::Rich,
            ProgressMode::Plain => ResolvedProgressMode::Plain,
            ProgressMode::Quiet => ResolvedProgressMode::Quiet,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConvertSummary {
    pub input_dir: PathBuf,
    pub outputs: Vec<PathBuf>,
    pub movie_count: usize,
    pub converted: usize,
    pub failed: Vec<PathBuf>,
    pub frames_written: u64,
    pub elapsed: Duration,
    pub avg_frames_per_sec: f64,
    pub warning_count: usize,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ProgressOutcome {
    pub elapsed: Duration,
    pub movies_done: usize,
    pub frames_done: u64,
    pub avg_frames_per_sec: f64,
    /// Every warning raised, including ones dropped from `warnings`.
    pub warning_count: usize,
    /// The most recent warnings, capped.
    pub warnings: Vec<String>,
}

struct CurrentMovie {
    name: String,
    frame_count: usize,
    frames_done: usize,
}

struct RichUi {
    _multi: MultiProgress,
    movies: ProgressBar,
    frames: ProgressBar,
}

/// Reports batch conversion on stderr: one movies counter for the batch and
/// a frame counter for the movie being written.
pub struct ProgressReporter {
    label: String,
    mode: ResolvedProgressMode,
    plain_interval: Duration,
    started: Instant,
    last_plain_emit: Option<Instant>,
    movie_total: usize,
    movies_done: usize,
    frames_done: u64,
    current: Option<CurrentMovie>,
    warning_count: usize,
    warnings: Vec<String>,
    rich: Option<RichUi>,
    finished: bool,
}

impl ProgressReporter {
    pub fn new(label: impl Into<String>, movie_total: usize, config: ProgressConfig) -> Self {
        let label = label.into();
        let mode = config.resolve_mode();
        let rich = (mode == ResolvedProgressMode::Rich).then(|| RichUi::new(&label, movie_total));
        Self {
            label,
            mode,
            plain_interval: config.plain_interval,
            started: Instant::now(),
            last_plain_emit: None,
            movie_total,
            movies_done: 0,
            frames_done: 0,
            current: None,
            warning_count: 0,
            warnings: Vec::new(),
            rich,
            finished: false,
        }
    }

    pub fn begin_movie(&mut self, name: impl Into<String>, frame_count: usize) {
        let name = name.into();
        match self.mode {
            ResolvedProgressMode::Quiet => {}
            ResolvedProgressMode::Plain => eprintln!(
                "[PROGRESS] {} movie {}/{} {} ({} frames)",
                self.label,
                self.movies_done + 1,
                self.movie_total,
                name,
                frame_count
            ),
            ResolvedProgressMode::Rich => {
                if let Some(rich) = &self.rich {
                    rich.frames.reset();
                    rich.frames.set_length(frame_count as u64);
                    rich.frames.set_prefix(name.clone());
                }
            }
        }
        self.last_plain_emit = Some(Instant::now());
        self.current = Some(CurrentMovie {
            name,
            frame_count,
            frames_done: 0,
        });
    }

    pub fn frame_done(&mut self) {
        self.frames_done += 1;
        let Some(current) = self.current.as_mut() else {
            return;
        };
        current.frames_done += 1;
        match self.mode {
            ResolvedProgressMode::Quiet => {}
            ResolvedProgressMode::Rich => {
                if let Some(rich) = &self.rich {
                    rich.frames.inc(1);
                }
            }
            ResolvedProgressMode::Plain => {
                let now = Instant::now();
                let last_frame = current.frames_done == current.frame_count;
                if last_frame || plain_due(now, self.last_plain_emit, self.plain_interval) {
                    self.last_plain_emit = Some(now);
                    eprintln!(
                        "[PROGRESS] {} {} frame {}/{} elapsed={}",
                        self.label,
                        current.name,
                        current.frames_done,
                        current.frame_count,
                        format_duration(self.started.elapsed())
                    );
                }
            }
        }
    }

    /// Close out the current movie. Also counts movies that failed before
    /// `begin_movie`.
    pub fn end_movie(&mut self, converted: bool) {
        self.movies_done += 1;
        let current = self.current.take();
        match self.mode {
            ResolvedProgressMode::Quiet => {}
            ResolvedProgressMode::Plain => {
                if let Some(current) = current {
                    eprintln!(
                        "[PROGRESS] {} {} {} ({}/{} frames)",
                        self.label,
                        current.name,
                        if converted { "done" } else { "failed" },
                        current.frames_done,
                        current.frame_count
                    );
                }
            }
            ResolvedProgressMode::Rich => {
                if let Some(rich) = &self.rich {
                    rich.movies.inc(1);
                    rich.frames.set_prefix("");
                }
            }
        }
    }

    pub fn log(&self, message: impl Into<String>) {
        self.emit_message("INFO", &message.into());
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        self.warning_count += 1;
        if self.warnings.len() >= MAX_STORED_WARNINGS {
            self.warnings.remove(0);
        }
        self.warnings.push(message.clone());
        self.emit_message("WARN", &message);
    }

    pub fn finish(mut self, final_message: impl Into<String>) -> ProgressOutcome {
        let elapsed = self.started.elapsed();
        let final_message = final_message.into();
        match self.mode {
            ResolvedProgressMode::Quiet => {}
            ResolvedProgressMode::Plain => {
                eprintln!(
                    "[DONE] {}: {} ({} frames in {})",
                    self.label,
                    final_message,
                    self.frames_done,
                    format_duration(elapsed)
                );
            }
            ResolvedProgressMode::Rich => {
                if let Some(rich) = &self.rich {
                    rich.frames.finish_and_clear();
                    rich.movies.finish_with_message(final_message);
                }
            }
        }
        self.finished = true;

        ProgressOutcome {
            elapsed,
            movies_done: self.movies_done,
            frames_done: self.frames_done,
            avg_frames_per_sec: average_rate(self.frames_done, elapsed),
            warning_count: self.warning_count,
            warnings: std::mem::take(&mut self.warnings),
        }
    }

    fn emit_message(&self, level: &str, message: &str) {
        match self.mode {
            ResolvedProgressMode::Quiet => {}
            ResolvedProgressMode::Plain => {
                eprintln!("[{}] {}: {}", level, self.label, message);
            }
            ResolvedProgressMode::Rich => match &self.rich {
                Some(rich) => rich
                    .movies
                    .println(format!("[{}] {}: {}", level, self.label, message)),
                None => eprintln!("[{}] {}: {}", level, self.label, message),
            },
        }
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Some(rich) = &self.rich {
            rich.frames.finish_and_clear();
            rich.movies.abandon();
        }
    }
}

impl RichUi {
    fn new(label: &str, movie_total: usize) -> Self {
        let multi = MultiProgress::new();
        let movies = multi.add(ProgressBar::new(movie_total as u64));
        let frames = multi.add(ProgressBar::new(0));

        movies.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} [{elapsed_precise}] {wide_bar:.cyan/blue} {pos}/{len} movies | {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        movies.enable_steady_tick(Duration::from_millis(120));
        movies.set_message(label.to_string());

        frames.set_style(
            ProgressStyle::with_template(
                "  {prefix:.bold} {bar:30.magenta/blue} {pos}/{len} frames {per_sec} ETA {eta}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );

        Self {
            _multi: multi,
            movies,
            frames,
        }
    }
}

fn plain_due(now: Instant, last_emit: Option<Instant>, interval: Duration) -> bool {
    match last_emit {
        Some(last) => now.duration_since(last) >= interval,
        None => true,
    }
}

pub fn average_rate(count: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64().max(1e-6);
    count as f64 / secs
}

pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let h = secs / 3600;
    let m = (secs % 3600) / 60;
    let s = secs % 60;
    if h > 0 {
        format!("{:02}:{:02}:{:02}", h, m, s)
    } else {
        format!("{:02}:{:02}", m, s)
    }
}
