//! COPC output: an LAS 1.4 / PDRF 6-8 file whose points are stored as one
//! LAZ chunk per octree node, with the COPC info VLR and the EPT hierarchy
//! EVLR back-patched when the writer closes.

mod compressor;
mod ept;
mod lax;
mod octant;
mod writer;

pub use ept::{EptKey, EptOctree};
pub use lax::{write_lax, LaxIndex};
pub use writer::{CopcOptions, CopcWriter, HierarchyEntry};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CopcError {
    #[error("the writer is already closed")]
    ClosedWriter,

    #[error("a COPC file cannot be empty")]
    EmptyFile,

    #[error("point ({0}, {1}, {2}) is outside the octree bounding cube")]
    PointOutsideOctree(f64, f64, f64),

    #[error("unsupported point data record format {0}")]
    UnsupportedFormat(u8),

    #[error("invalid bounds for the octree cube")]
    InvalidBounds,

    #[error(transparent)]
    Las(#[from] las::Error),

    #[error(transparent)]
    Laz(#[from] laz::LasZipError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CopcError>;
