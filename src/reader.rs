//! Random access to the frames of a raw `.dax` movie.
//!
//! The raw file has no header: frame `i` is `height * width` unsigned 16-bit
//! samples, row-major, starting at byte `i * height * width * 2`. Byte order
//! is declared only by the sidecar.

use crate::error::{DaxError, FrameBound, Result};
use crate::metadata::{self, MovieMetadata, DEFAULT_SCALE};

use ndarray::Array2;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// One decoded frame, indexed `[row, column]`.
pub type Frame = Array2<u16>;

#[derive(Debug, Clone, Copy, Default)]
pub struct ReaderOptions {
    /// Report a missing raw file at `warn` level instead of `debug`.
    pub verbose: bool,
}

/// Operations shared by every movie format. Implementors provide metadata
/// and single-frame decoding; iteration, averaging and fingerprinting are
/// built on top of `load_frame`.
pub trait MovieReader {
    fn path(&self) -> &Path;

    fn metadata(&self) -> &MovieMetadata;

    /// Decode frame `frame_number`. Every call re-reads from storage.
    fn load_frame(&mut self, frame_number: i64) -> Result<Frame>;

    /// Declared frame count, or 0 if the sidecar never stated one.
    fn frame_count(&self) -> usize {
        self.metadata().frame_count.unwrap_or(0)
    }

    /// `[width, height, frame_count]`
    fn film_size(&self) -> [usize; 3] {
        let m = self.metadata();
        [m.frame_width, m.frame_height, self.frame_count()]
    }

    /// Stage position, `(0.0, 0.0)` unless both coordinates are recorded.
    fn film_location(&self) -> (f64, f64) {
        let m = self.metadata();
        match (m.stage_x, m.stage_y) {
            (Some(x), Some(y)) => (x, y),
            _ => (0.0, 0.0),
        }
    }

    /// Display scale `(min, max)`; the default pair unless both are recorded.
    fn film_scale(&self) -> (i64, i64) {
        let m = self.metadata();
        match (m.scale_min, m.scale_max) {
            (Some(lo), Some(hi)) => (lo, hi),
            _ => DEFAULT_SCALE,
        }
    }

    fn lock_target(&self) -> f64 {
        self.metadata().lock_target.unwrap_or(0.0)
    }

    /// Lazily yields `(index, frame)` for `start..end`, defaulting to the
    /// whole movie. Only one frame is held at a time.
    fn frames(&mut self, start: Option<usize>, end: Option<usize>) -> FrameIter<'_, Self> {
        let next = start.unwrap_or(0);
        let end = end.unwrap_or_else(|| self.frame_count());
        FrameIter {
            reader: self,
            next,
            end,
        }
    }

    /// Mean of the frames in `start..end`. An empty range yields zeros of the
    /// frame shape.
    fn average_frames(&mut self, start: Option<usize>, end: Option<usize>) -> Result<Array2<f64>> {
        let shape = {
            let m = self.metadata();
            (m.frame_height, m.frame_width)
        };
        let total = self.frame_count();
        let mut sum: Option<Array2<f64>> = None;
        let mut visited = 0usize;
        for item in self.frames(start, end) {
            let (index, frame) = item?;
            if index % 10 == 0 {
                log::debug!("averaging frame {} of {}", index, total);
            }
            let frame = frame.mapv(f64::from);
            match sum.as_mut() {
                Some(acc) => *acc += &frame,
                None => sum = Some(frame),
            }
            visited += 1;
        }
        match sum {
            Some(mut acc) => {
                acc /= visited as f64;
                Ok(acc)
            }
            None => {
                // Nothing was decoded, so the shape is unchecked against the file.
                let fits = shape
                    .0
                    .checked_mul(shape.1)
                    .and_then(|n| n.checked_mul(std::mem::size_of::<f64>()))
                    .is_some_and(|bytes| bytes <= isize::MAX as usize);
                if !fits {
                    return Err(DaxError::GeometryOverflow {
                        path: self.path().to_path_buf(),
                        width: shape.1,
                        height: shape.0,
                        frame: start.unwrap_or(0),
                    });
                }
                Ok(Array2::zeros(shape))
            }
        }
    }

    /// Hex SHA-256 of frame 0's samples (little-endian). Movies sharing an
    /// identical first frame share a fingerprint.
    fn hash_id(&mut self) -> Result<String> {
        let frame = self.load_frame(0)?;
        let mut hasher = Sha256::new();
        for sample in frame.iter() {
            hasher.update(sample.to_le_bytes());
        }
        Ok(format!("{:x}", hasher.finalize()))
    }
}

pub struct FrameIter<'a, R: MovieReader + ?Sized> {
    reader: &'a mut R,
    next: usize,
    end: usize,
}

impl<R: MovieReader + ?Sized> Iterator for FrameIter<'_, R> {
    type Item = Result<(usize, Frame)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.end {
            return None;
        }
        let index = self.next;
        self.next += 1;
        match self.reader.load_frame(index as i64) {
            Ok(frame) => Some(Ok((index, frame))),
            Err(e) => {
                // Stop after the first failure.
                self.next = self.end;
                Some(Err(e))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.end.saturating_sub(self.next);
        (0, Some(n))
    }
}

/// Validate `frame_number` against `[0, frame_count)`.
pub fn check_frame_number(meta: &MovieMetadata, path: &Path, frame_number: i64) -> Result<usize> {
    if frame_number < 0 {
        return Err(DaxError::FrameOutOfRange {
            bound: FrameBound::Lower,
            frame: frame_number,
            limit: meta.frame_count.unwrap_or(0),
        });
    }
    let count = meta.frame_count.ok_or_else(|| DaxError::FrameCountUnknown {
        path: path.to_path_buf(),
    })?;
    match usize::try_from(frame_number) {
        Ok(index) if index < count => Ok(index),
        _ => Err(DaxError::FrameOutOfRange {
            bound: FrameBound::Upper,
            frame: frame_number,
            limit: count,
        }),
    }
}

enum Source {
    Open(File),
    /// Raw file was absent at open time; metadata is still available.
    MetadataOnly,
    Closed,
}

/// Reader for the `.dax` raw format paired with an `.inf` sidecar.
///
/// The raw file handle is owned exclusively and released on `close` or drop.
pub struct DaxReader {
    path: PathBuf,
    sidecar: PathBuf,
    metadata: MovieMetadata,
    source: Source,
}

impl DaxReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, ReaderOptions::default())
    }

    /// Parse the sidecar, then open the raw file. A missing raw file is not
    /// an error: the reader comes back metadata-only.
    pub fn open_with(path: impl AsRef<Path>, options: ReaderOptions) -> Result<Self> {
        let path = path.as_ref();
        let sidecar = metadata::sidecar_path(path);
        let meta = metadata::parse_sidecar(&sidecar)?;
        Self::with_metadata(path, sidecar, meta, options)
    }

    pub fn with_metadata(
        path: impl AsRef<Path>,
        sidecar: impl Into<PathBuf>,
        metadata: MovieMetadata,
        options: ReaderOptions,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let source = match File::open(&path) {
            Ok(file) => Source::Open(file),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if options.verbose {
                    log::warn!("dax data not found: {}", path.display());
                } else {
                    log::debug!("dax data not found: {}", path.display());
                }
                Source::MetadataOnly
            }
            Err(e) => return Err(DaxError::io(path, e)),
        };
        Ok(Self {
            path,
            sidecar: sidecar.into(),
            metadata,
            source,
        })
    }

    pub fn sidecar_path(&self) -> &Path {
        &self.sidecar
    }

    pub fn has_frame_data(&self) -> bool {
        matches!(self.source, Source::Open(_))
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.source, Source::Closed)
    }

    /// Release the raw file. Further decodes fail with `DaxError::Closed`.
    pub fn close(&mut self) {
        self.source = Source::Closed;
    }
}

impl MovieReader for DaxReader {
    fn path(&self) -> &Path {
        &self.path
    }

    fn metadata(&self) -> &MovieMetadata {
        &self.metadata
    }

    fn load_frame(&mut self, frame_number: i64) -> Result<Frame> {
        let index = check_frame_number(&self.metadata, &self.path, frame_number)?;
        let m = &self.metadata;
        let (expected, offset, end) =
            match (m.bytes_per_frame(), m.frame_offset(index), m.frame_end(index)) {
                (Some(len), Some(offset), Some(end)) => (len, offset, end),
                _ => {
                    return Err(DaxError::GeometryOverflow {
                        path: self.path.clone(),
                        width: m.frame_width,
                        height: m.frame_height,
                        frame: index,
                    })
                }
            };

        let file = match &mut self.source {
            Source::Open(file) => file,
            Source::MetadataOnly => {
                return Err(DaxError::NoFrameData {
                    path: self.path.clone(),
                })
            }
            Source::Closed => {
                return Err(DaxError::Closed {
                    path: self.path.clone(),
                })
            }
        };

        // Check the length first so a bogus geometry never sizes a buffer.
        let available = file
            .metadata()
            .map_err(|e| DaxError::io(&self.path, e))?
            .len();
        if available < end {
            let actual = usize::try_from(available.saturating_sub(offset)).unwrap_or(expected);
            return Err(DaxError::Truncated {
                path: self.path.clone(),
                frame: index,
                expected_bytes: expected,
                actual_bytes: actual.min(expected),
            });
        }

        let bytes = read_frame_bytes(file, offset, expected)
            .map_err(|e| DaxError::io(&self.path, e))?;
        if bytes.len() < expected {
            return Err(DaxError::Truncated {
                path: self.path.clone(),
                frame: index,
                expected_bytes: expected,
                actual_bytes: bytes.len(),
            });
        }

        let samples = decode_samples(&bytes, self.metadata.big_endian);
        let frame = Array2::from_shape_vec(
            (self.metadata.frame_height, self.metadata.frame_width),
            samples,
        )?;
        Ok(frame)
    }
}

fn read_frame_bytes(file: &mut File, offset: u64, len: usize) -> io::Result<Vec<u8>> {
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = Vec::new();
    file.by_ref().take(len as u64).read_to_end(&mut buf)?;
    Ok(buf)
}

/// Interpret `bytes` as 16-bit samples in the declared order.
pub fn decode_samples(bytes: &[u8], big_endian: bool) -> Vec<u16> {
    let pairs = bytes.chunks_exact(2);
    if big_endian {
        pairs.map(|b| u16::from_be_bytes([b[0], b[1]])).collect()
    } else {
        pairs.map(|b| u16::from_le_bytes([b[0], b[1]])).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::{Mutex, Once};
    use tempfile::TempDir;

    static CAPTURED: Mutex<Vec<(log::Level, String)>> = Mutex::new(Vec::new());

    struct CaptureLog;

    impl log::Log for CaptureLog {
        fn enabled(&self, _: &log::Metadata<'_>) -> bool {
            true
        }

        fn log(&self, record: &log::Record<'_>) {
            if let Ok(mut v) = CAPTURED.lock() {
                v.push((record.level(), record.args().to_string()));
            }
        }

        fn flush(&self) {}
    }

    static LOGGER: CaptureLog = CaptureLog;

    /// Log records mentioning `needle`, captured since the process started.
    fn logged(needle: &str) -> Vec<(log::Level, String)> {
        static INSTALL: Once = Once::new();
        INSTALL.call_once(|| {
            let _ = log::set_logger(&LOGGER);
            log::set_max_level(log::LevelFilter::Trace);
        });
        CAPTURED
            .lock()
            .map(|v| v.iter().filter(|(_, m)| m.contains(needle)).cloned().collect())
            .unwrap_or_default()
    }

    fn write_sidecar_only(dir: &Path, stem: &str, body: &str, raw_len: usize) -> PathBuf {
        let raw = dir.join(format!("{stem}.dax"));
        fs::write(&raw, vec![0u8; raw_len]).expect("write raw");
        fs::write(raw.with_extension("inf"), body).expect("write sidecar");
        raw
    }

    fn write_movie(dir: &Path, w: usize, h: usize, frames: usize, extra: &str) -> PathBuf {
        let raw = dir.join("movie.dax");
        let mut data = Vec::new();
        for f in 0..frames {
            for i in 0..w * h {
                data.extend_from_slice(&((f * 1000 + i) as u16).to_le_bytes());
            }
        }
        fs::write(&raw, data).expect("write raw");
        fs::write(
            dir.join("movie.inf"),
            format!(
                "frame dimensions = {} x {}\nnumber of frames = {}\n{}",
                w, h, frames, extra
            ),
        )
        .expect("write sidecar");
        raw
    }

    #[test]
    fn loads_frame_with_declared_shape() {
        let tmp = TempDir::new().expect("tempdir");
        let raw = write_movie(tmp.path(), 4, 3, 2, "");
        let mut reader = DaxReader::open(&raw).expect("open");
        let frame = reader.load_frame(1).expect("frame 1");
        assert_eq!(frame.dim(), (3, 4));
        assert_eq!(frame[[0, 0]], 1000);
        assert_eq!(frame[[2, 3]], 1011);
    }

    #[test]
    fn bounds_are_checked_on_both_sides() {
        let tmp = TempDir::new().expect("tempdir");
        let raw = write_movie(tmp.path(), 2, 2, 3, "");
        let mut reader = DaxReader::open(&raw).expect("open");
        match reader.load_frame(-1) {
            Err(DaxError::FrameOutOfRange { bound, frame, .. }) => {
                assert_eq!(bound, FrameBound::Lower);
                assert_eq!(frame, -1);
            }
            other => panic!("unexpected {:?}", other.map(|f| f.dim())),
        }
        match reader.load_frame(3) {
            Err(DaxError::FrameOutOfRange { bound, limit, .. }) => {
                assert_eq!(bound, FrameBound::Upper);
                assert_eq!(limit, 3);
            }
            other => panic!("unexpected {:?}", other.map(|f| f.dim())),
        }
        assert!(reader.load_frame(2).is_ok());
    }

    #[test]
    fn missing_raw_file_opens_metadata_only() {
        let tmp = TempDir::new().expect("tempdir");
        let raw = write_movie(tmp.path(), 2, 2, 1, "");
        fs::remove_file(&raw).expect("remove raw");
        let mut reader = DaxReader::open_with(&raw, ReaderOptions { verbose: true }).expect("open");
        assert!(!reader.has_frame_data());
        assert_eq!(reader.film_size(), [2, 2, 1]);
        assert!(matches!(reader.load_frame(0), Err(DaxError::NoFrameData { .. })));
    }

    #[test]
    fn missing_raw_file_diagnostic_level_follows_verbose() {
        let loud = TempDir::new().expect("tempdir");
        let quiet = TempDir::new().expect("tempdir");
        let loud_raw = loud.path().join("loud_missing.dax");
        let quiet_raw = quiet.path().join("quiet_missing.dax");
        fs::write(loud_raw.with_extension("inf"), "number of frames = 1\n").expect("write inf");
        fs::write(quiet_raw.with_extension("inf"), "number of frames = 1\n").expect("write inf");
        logged("");

        DaxReader::open_with(&loud_raw, ReaderOptions { verbose: true }).expect("open");
        DaxReader::open_with(&quiet_raw, ReaderOptions { verbose: false }).expect("open");

        let loud_records = logged(&loud_raw.display().to_string());
        assert_eq!(loud_records.len(), 1, "{loud_records:?}");
        assert_eq!(loud_records[0].0, log::Level::Warn);
        assert!(loud_records[0].1.contains("dax data not found"));

        let quiet_records = logged(&quiet_raw.display().to_string());
        assert_eq!(quiet_records.len(), 1, "{quiet_records:?}");
        assert_eq!(quiet_records[0].0, log::Level::Debug);
    }

    #[test]
    fn overflowing_geometry_is_a_typed_error() {
        let tmp = TempDir::new().expect("tempdir");
        let raw = write_sidecar_only(
            tmp.path(),
            "huge",
            "frame dimensions = 4294967296 x 4294967296\nnumber of frames = 2\n",
            16,
        );
        let mut reader = DaxReader::open(&raw).expect("open");
        for i in 0..2 {
            match reader.load_frame(i) {
                Err(DaxError::GeometryOverflow { width, frame, .. }) => {
                    assert_eq!(width, 4_294_967_296);
                    assert_eq!(frame, i as usize);
                }
                other => panic!("unexpected {:?}", other.map(|f| f.dim())),
            }
        }
        assert!(matches!(
            reader.average_frames(Some(1), Some(1)),
            Err(DaxError::GeometryOverflow { .. })
        ));
        assert!(matches!(
            reader.average_frames(None, None),
            Err(DaxError::GeometryOverflow { .. })
        ));
    }

    #[test]
    fn frame_larger_than_file_is_truncated_before_reading() {
        let tmp = TempDir::new().expect("tempdir");
        let raw = write_sidecar_only(
            tmp.path(),
            "vast",
            "frame dimensions = 2000000000 x 2000000000\nnumber of frames = 1\n",
            16,
        );
        let mut reader = DaxReader::open(&raw).expect("open");
        match reader.load_frame(0) {
            Err(DaxError::Truncated {
                frame,
                expected_bytes,
                actual_bytes,
                ..
            }) => {
                assert_eq!(frame, 0);
                assert_eq!(expected_bytes, 8_000_000_000_000_000_000);
                assert_eq!(actual_bytes, 16);
            }
            other => panic!("unexpected {:?}", other.map(|f| f.dim())),
        }
        assert!(matches!(reader.hash_id(), Err(DaxError::Truncated { .. })));
    }

    #[test]
    fn frame_past_end_of_file_reads_nothing() {
        let tmp = TempDir::new().expect("tempdir");
        let raw = write_sidecar_only(
            tmp.path(),
            "short",
            "frame dimensions = 4 x 4\nnumber of frames = 5\n",
            32,
        );
        let mut reader = DaxReader::open(&raw).expect("open");
        assert!(reader.load_frame(0).is_ok());
        assert!(matches!(
            reader.load_frame(4),
            Err(DaxError::Truncated {
                frame: 4,
                actual_bytes: 0,
                ..
            })
        ));
    }

    #[test]
    fn closed_reader_refuses_to_decode() {
        let tmp = TempDir::new().expect("tempdir");
        let raw = write_movie(tmp.path(), 2, 2, 1, "");
        let mut reader = DaxReader::open(&raw).expect("open");
        reader.close();
        assert!(reader.is_closed());
        assert!(matches!(reader.load_frame(0), Err(DaxError::Closed { .. })));
    }

    #[test]
    fn unknown_frame_count_blocks_decoding() {
        let tmp = TempDir::new().expect("tempdir");
        let raw = tmp.path().join("bare.dax");
        fs::write(&raw, [0u8; 8]).expect("write raw");
        fs::write(tmp.path().join("bare.inf"), "frame dimensions = 2 x 2\n").expect("write inf");
        let mut reader = DaxReader::open(&raw).expect("open");
        assert_eq!(reader.frame_count(), 0);
        assert!(matches!(
            reader.load_frame(0),
            Err(DaxError::FrameCountUnknown { .. })
        ));
        assert_eq!(reader.frames(None, None).count(), 0);
    }

    #[test]
    fn optional_fields_fall_back() {
        let tmp = TempDir::new().expect("tempdir");
        let raw = write_movie(tmp.path(), 2, 2, 1, "scalemax = 500\n");
        let reader = DaxReader::open(&raw).expect("open");
        assert_eq!(reader.film_location(), (0.0, 0.0));
        assert_eq!(reader.film_scale(), DEFAULT_SCALE);
        assert_eq!(reader.lock_target(), 0.0);
    }

    #[test]
    fn recorded_optional_fields_are_reported() {
        let tmp = TempDir::new().expect("tempdir");
        let raw = write_movie(
            tmp.path(),
            2,
            2,
            1,
            "Stage X = 1.5\nStage Y = -2.0\nscalemin = 10\nscalemax = 90\nLock Target = 0.75\n",
        );
        let reader = DaxReader::open(&raw).expect("open");
        assert_eq!(reader.film_location(), (1.5, -2.0));
        assert_eq!(reader.film_scale(), (10, 90));
        assert_eq!(reader.lock_target(), 0.75);
    }

    #[test]
    fn location_needs_both_coordinates() {
        let tmp = TempDir::new().expect("tempdir");
        let raw = write_movie(tmp.path(), 2, 2, 1, "Stage X = 7.5\n");
        let reader = DaxReader::open(&raw).expect("open");
        assert_eq!(reader.metadata().stage_x, Some(7.5));
        assert_eq!(reader.film_location(), (0.0, 0.0));
    }

    #[test]
    fn iterator_is_restartable_and_ordered() {
        let tmp = TempDir::new().expect("tempdir");
        let raw = write_movie(tmp.path(), 2, 1, 4, "");
        let mut reader = DaxReader::open(&raw).expect("open");
        let first: Vec<usize> = reader
            .frames(Some(1), None)
            .map(|r| r.expect("frame").0)
            .collect();
        let second: Vec<usize> = reader
            .frames(Some(1), None)
            .map(|r| r.expect("frame").0)
            .collect();
        assert_eq!(first, vec![1, 2, 3]);
        assert_eq!(first, second);
    }

    #[test]
    fn average_of_empty_range_is_zero() {
        let tmp = TempDir::new().expect("tempdir");
        let raw = write_movie(tmp.path(), 3, 2, 6, "");
        let mut reader = DaxReader::open(&raw).expect("open");
        let avg = reader.average_frames(Some(5), Some(5)).expect("average");
        assert_eq!(avg.dim(), (2, 3));
        assert!(avg.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn average_divides_by_visited_frames() {
        let tmp = TempDir::new().expect("tempdir");
        let raw = write_movie(tmp.path(), 1, 1, 3, "");
        let mut reader = DaxReader::open(&raw).expect("open");
        // samples are 0, 1000, 2000
        let avg = reader.average_frames(None, None).expect("average");
        assert_eq!(avg[[0, 0]], 1000.0);
        let avg = reader.average_frames(Some(1), None).expect("average");
        assert_eq!(avg[[0, 0]], 1500.0);
    }

    #[test]
    fn decode_samples_honours_byte_order() {
        assert_eq!(decode_samples(&[0x01, 0x02], false), vec![0x0201]);
        assert_eq!(decode_samples(&[0x01, 0x02], true), vec![0x0102]);
    }
}
