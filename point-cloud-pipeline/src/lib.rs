//! Declarative pipelines over chunked point cloud processing.
//!
//! A pipeline is an ordered list of stages declared in JSON (either the
//! native array form or the drawflow graph form). The engine partitions the
//! input coverage into buffered chunks and drives every chunk through the
//! stages, streamed point by point when every stage supports it and loaded
//! in memory otherwise. Chunks run in parallel on per-worker pipeline
//! clones; outputs are merged and reordered so parallel runs are
//! indistinguishable from serial ones on disk.

/// Graph-form linearisation.
mod drawflow;

/// Execution engine.
mod engine;

/// Error types.
mod error;

/// Global processing options.
mod options;

/// JSON parsing and the stage registry.
mod parser;

/// The `reader_las` stage.
mod reader;

/// Stage contract and per-chunk exchange.
mod stage;

/// The glue stages.
mod stages;

pub use engine::Engine;
pub use error::{PipelineError, Result};
pub use options::{ProcessingOptions, Strategy};
pub use parser::{parse, ParsedPipeline};
pub use stage::{Artifact, ChunkContext, Flow, Stage, StageCommon};

/// Parse and execute a pipeline document in one call.
pub fn execute(doc: &serde_json::Value) -> Result<()> {
    let mut engine = Engine::from_json(doc)?;
    engine.execute()
}
