use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Which side of `[0, frame_count)` a frame request fell outside of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameBound {
    Lower,
    Upper,
}

impl fmt::Display for FrameBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameBound::Lower => f.write_str("lower"),
            FrameBound::Upper => f.write_str("upper"),
        }
    }
}

#[derive(Debug, Error)]
pub enum DaxError {
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("frame number {frame} violates the {bound} bound of [0, {limit})")]
    FrameOutOfRange {
        bound: FrameBound,
        frame: i64,
        limit: usize,
    },

    #[error(
        "{}: truncated data for frame {frame}: expected {expected_bytes} bytes, read {actual_bytes}",
        path.display()
    )]
    Truncated {
        path: PathBuf,
        frame: usize,
        expected_bytes: usize,
        actual_bytes: usize,
    },

    #[error(
        "{}: frame {frame} of a {width}x{height} movie lies beyond addressable file offsets",
        path.display()
    )]
    GeometryOverflow {
        path: PathBuf,
        width: usize,
        height: usize,
        frame: usize,
    },

    #[error("{}: sidecar does not declare the number of frames", path.display())]
    FrameCountUnknown { path: PathBuf },

    #[error("{}: raw frame data not found, movie opened metadata-only", path.display())]
    NoFrameData { path: PathBuf },

    #[error("{}: movie already closed", path.display())]
    Closed { path: PathBuf },

    #[error("frame reshape failed: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

impl DaxError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DaxError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, DaxError>;
