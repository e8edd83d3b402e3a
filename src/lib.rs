//! Reading and converting `.dax` raw microscopy movies.
//!
//! A movie is a headerless stack of 16-bit frames (`.dax`) described by a
//! text sidecar (`.inf`) carrying the frame geometry, frame count and byte
//! order. [`reader::DaxReader`] decodes frames on demand;
//! [`convert`] turns whole folders of movies into TIFF stacks.

pub mod convert;
pub mod error;
pub mod metadata;
pub mod progress;
pub mod reader;
pub mod util;

pub use error::{DaxError, FrameBound};
pub use metadata::{MetadataWarning, MovieMetadata};
pub use reader::{DaxReader, Frame, FrameIter, MovieReader, ReaderOptions};
