use std::path::PathBuf;

use thiserror::Error;

/// Errors produced by the core data model and the file catalog.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Unknown file type: {0}")]
    UnknownFileType(PathBuf),

    #[error("Virtual point cloud file detected mixed with other content")]
    MixedManifest,

    #[error("The virtual point cloud must have the extension '.vpc'")]
    VpcExtension,

    #[error("Malformed virtual point cloud file: {0}")]
    MalformedVpc(String),

    #[error("Unsupported STAC version: {0}")]
    StacVersion(String),

    #[error("chunk request out of bounds: {0}")]
    ChunkOutOfBounds(usize),

    #[error("cannot find any file in [{0:.1}, {1:.1}, {2:.1}, {3:.1}]")]
    EmptyQuery(f64, f64, f64, f64),

    #[error("malformed filter token '{0}'")]
    FilterToken(String),

    #[error("unknown attribute '{0}' in filter")]
    FilterAttribute(String),

    #[error("cannot open '{path}': {source}")]
    LasOpen {
        path: PathBuf,
        source: las::Error,
    },

    #[error(transparent)]
    Las(#[from] las::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;
