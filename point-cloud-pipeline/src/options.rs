//! Global processing options parsed from the `processing` block.

use std::path::PathBuf;

use serde_json::Value;

use crate::error::{PipelineError, Result};

/// How the two parallel loops split the available cores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    /// One chunk at a time, stages parallelize internally.
    #[default]
    ConcurrentPoints,
    /// Several chunks at a time, no intra-stage parallelism.
    ConcurrentFiles,
    /// Both loops parallel with explicit counts.
    Nested,
}

#[derive(Debug, Clone)]
pub struct ProcessingOptions {
    pub files: Vec<PathBuf>,
    pub ncores: Vec<usize>,
    pub strategy: Strategy,
    pub buffer: f64,
    pub chunk: f64,
    pub progress: bool,
    pub verbose: bool,
    pub profiling: Option<PathBuf>,
}

impl Default for ProcessingOptions {
    fn default() -> Self {
        Self {
            files: Vec::new(),
            ncores: vec![default_cores()],
            strategy: Strategy::default(),
            buffer: 0.0,
            chunk: 0.0,
            progress: true,
            verbose: false,
            profiling: None,
        }
    }
}

/// Half of the machine, rounded up.
fn default_cores() -> usize {
    let available = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    available.div_ceil(2)
}

impl ProcessingOptions {
    pub fn from_json(value: &Value) -> Result<Self> {
        let mut options = Self::default();
        let Some(obj) = value.as_object() else {
            return Ok(options);
        };

        if let Some(files) = obj.get("files").and_then(|v| v.as_array()) {
            options.files = files
                .iter()
                .filter_map(|f| f.as_str())
                .map(PathBuf::from)
                .collect();
        }

        if let Some(ncores) = obj.get("ncores") {
            options.ncores = match ncores {
                Value::Number(n) => vec![n.as_u64().unwrap_or(1).max(1) as usize],
                Value::Array(a) => a
                    .iter()
                    .filter_map(|v| v.as_u64())
                    .map(|v| v.max(1) as usize)
                    .collect(),
                _ => {
                    return Err(PipelineError::InvalidValue {
                        key: "ncores".to_string(),
                        reason: "expected a number or an array of numbers".to_string(),
                    })
                }
            };
            if options.ncores.is_empty() {
                options.ncores = vec![default_cores()];
            }
        }

        if let Some(strategy) = obj.get("strategy").and_then(|v| v.as_str()) {
            options.strategy = match strategy {
                "concurrent-points" => Strategy::ConcurrentPoints,
                "concurrent-files" => Strategy::ConcurrentFiles,
                "nested" => Strategy::Nested,
                other => {
                    return Err(PipelineError::InvalidValue {
                        key: "strategy".to_string(),
                        reason: format!("unknown strategy '{other}'"),
                    })
                }
            };
        }

        options.buffer = obj.get("buffer").and_then(|v| v.as_f64()).unwrap_or(0.0).max(0.0);
        options.chunk = obj.get("chunk").and_then(|v| v.as_f64()).unwrap_or(0.0).max(0.0);
        options.progress = obj.get("progress").and_then(|v| v.as_bool()).unwrap_or(true);
        options.verbose = obj.get("verbose").and_then(|v| v.as_bool()).unwrap_or(false);
        options.profiling = obj
            .get("profiling")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        if options.strategy == Strategy::Nested && options.ncores.len() < 2 {
            return Err(PipelineError::NestedCores);
        }

        Ok(options)
    }

    /// Thread counts `(outer, inner)` for the chunk loop and the intra-stage
    /// regions.
    pub fn thread_counts(&self) -> (usize, usize) {
        match self.strategy {
            Strategy::ConcurrentPoints => (1, self.ncores[0]),
            Strategy::ConcurrentFiles => (self.ncores[0], 1),
            Strategy::Nested => (self.ncores[0], self.ncores[1]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults() {
        let o = ProcessingOptions::from_json(&json!({})).unwrap();
        assert_eq!(o.strategy, Strategy::ConcurrentPoints);
        assert!(o.progress);
        assert_eq!(o.buffer, 0.0);
    }

    #[test]
    fn full_block() {
        let o = ProcessingOptions::from_json(&json!({
            "files": ["a.laz", "b.laz"],
            "ncores": [4, 2],
            "strategy": "nested",
            "buffer": 25.0,
            "chunk": 500.0,
            "progress": false,
            "profiling": "prof.txt",
        }))
        .unwrap();
        assert_eq!(o.files.len(), 2);
        assert_eq!(o.thread_counts(), (4, 2));
        assert_eq!(o.buffer, 25.0);
        assert_eq!(o.chunk, 500.0);
        assert_eq!(o.profiling, Some(PathBuf::from("prof.txt")));
    }

    #[test]
    fn nested_needs_two_counts() {
        let r = ProcessingOptions::from_json(&json!({"ncores": 4, "strategy": "nested"}));
        assert!(matches!(r, Err(PipelineError::NestedCores)));
    }

    #[test]
    fn strategy_thread_split() {
        let o = ProcessingOptions::from_json(&json!({"ncores": 8})).unwrap();
        assert_eq!(o.thread_counts(), (1, 8));
        let o =
            ProcessingOptions::from_json(&json!({"ncores": 8, "strategy": "concurrent-files"}))
                .unwrap();
        assert_eq!(o.thread_counts(), (8, 1));
    }
}
