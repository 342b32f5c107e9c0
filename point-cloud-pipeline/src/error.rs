use thiserror::Error;

/// Errors raised while parsing or executing a pipeline. The engine wraps
/// stage failures with the stage name so the user-visible message names the
/// failing stage and the lowest-level reason.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("in '{stage}' while {phase}: {source}")]
    Stage {
        stage: String,
        phase: &'static str,
        #[source]
        source: Box<PipelineError>,
    },

    #[error("Cannot find stage with this uid")]
    UnknownUid,

    #[error("unknown stage '{0}'")]
    UnknownStage(String),

    #[error("The reader must always be the first stage of the pipeline")]
    ReaderNotFirst,

    #[error("missing key '{0}' in the pipeline")]
    MissingKey(&'static str),

    #[error("invalid value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("Incompatible stage combination for {0}")]
    IncompatibleConnection(&'static str),

    #[error("Using nested strategy requires an array of two numbers in 'ncores'")]
    NestedCores,

    #[error("Execution interrupted. Output files have been created on disk with partial results and were not cleaned.")]
    Interrupted,

    #[error(transparent)]
    Core(#[from] point_cloud_core::CoreError),

    #[error(transparent)]
    Ground(#[from] point_cloud_ground::GroundError),

    #[error(transparent)]
    Copc(#[from] point_cloud_copc::CopcError),

    #[error(transparent)]
    Las(#[from] las::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Prefix an error with the failing stage and lifecycle phase.
    pub fn in_stage(self, stage: &str, phase: &'static str) -> Self {
        PipelineError::Stage {
            stage: stage.to_string(),
            phase,
            source: Box::new(self),
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
