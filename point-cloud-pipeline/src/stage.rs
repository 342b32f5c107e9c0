//! The contract every stage implements and the per-chunk context through
//! which connected stages exchange their products.
//!
//! Stages reference each other by uid. Rather than holding pointers that
//! would need re-wiring on every thread clone, a producing stage deposits
//! its artifact (triangulation, raster, detected maxima) into the chunk
//! context under its own uid, and consumers resolve the uid at run time.
//! Stages run in declared order, so a producer always runs before its
//! consumers within a chunk.

use std::any::Any;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use point_cloud_core::{
    Chunk, Crs, FileCollection, Header, Point, PointCloud, PointFilter, PointXYZ, Progress,
    Raster,
};
use point_cloud_delaunay::Triangulation;

use crate::error::Result;

/// Signal returned by loaded-mode processing: keep going or short-circuit
/// the remaining stages for this chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Break,
}

/// A product deposited by a stage for stages connected to it.
#[derive(Clone)]
pub enum Artifact {
    /// A triangulation and the z values used to build it.
    Triangulation(Arc<Triangulation>),
    /// A raster (e.g. a canopy height model).
    Raster(Arc<Raster>),
    /// Detected local maxima with their ids.
    Maxima(Arc<Vec<(u32, PointXYZ)>>),
}

/// Per-chunk exchange between stages, keyed by producer uid.
#[derive(Default)]
pub struct ChunkContext {
    pub artifacts: HashMap<String, Artifact>,
}

impl ChunkContext {
    pub fn triangulation(&self, uid: &str) -> Option<Arc<Triangulation>> {
        match self.artifacts.get(uid) {
            Some(Artifact::Triangulation(t)) => Some(Arc::clone(t)),
            _ => None,
        }
    }

    pub fn raster(&self, uid: &str) -> Option<Arc<Raster>> {
        match self.artifacts.get(uid) {
            Some(Artifact::Raster(r)) => Some(Arc::clone(r)),
            _ => None,
        }
    }

    pub fn maxima(&self, uid: &str) -> Option<Arc<Vec<(u32, PointXYZ)>>> {
        match self.artifacts.get(uid) {
            Some(Artifact::Maxima(m)) => Some(Arc::clone(m)),
            _ => None,
        }
    }
}

/// State shared by every stage implementation.
#[derive(Clone, Default)]
pub struct StageCommon {
    pub uid: String,
    pub filter: PointFilter,
    /// Output template; a `*` expands to the chunk name (one file per
    /// chunk), otherwise the path receives the merged output.
    pub output: String,
    pub crs: Crs,
    pub chunk: Chunk,
    pub ncpu: usize,
    pub progress: Progress,
}

impl StageCommon {
    pub fn with_uid(uid: &str) -> Self {
        Self { uid: uid.to_string(), ncpu: 1, ..Default::default() }
    }

    /// Whether the template asks for one file per chunk.
    pub fn per_chunk_output(&self) -> bool {
        self.output.contains('*')
    }

    /// Resolve the output template for the current chunk, `None` when the
    /// stage has no output configured.
    pub fn output_path(&self) -> Option<PathBuf> {
        if self.output.is_empty() {
            return None;
        }
        Some(PathBuf::from(self.output.replace('*', &self.chunk.name)))
    }

    /// The merged output path (template without chunk expansion).
    pub fn merged_output_path(&self) -> Option<PathBuf> {
        if self.output.is_empty() || self.per_chunk_output() {
            return None;
        }
        Some(PathBuf::from(self.output.clone()))
    }
}

/// The uniform contract consumed by the pipeline engine.
#[allow(unused_variables)]
pub trait Stage: Send {
    fn name(&self) -> &'static str;
    fn common(&self) -> &StageCommon;
    fn common_mut(&mut self) -> &mut StageCommon;

    fn uid(&self) -> &str {
        &self.common().uid
    }

    // ---- capabilities ------------------------------------------------

    /// Can this stage consume points one by one?
    fn is_streamable(&self) -> bool {
        false
    }

    /// Can several chunks run this stage concurrently (clone per worker)?
    fn is_parallelizable(&self) -> bool {
        true
    }

    /// Does this stage parallelize internally over points?
    fn is_parallelized(&self) -> bool {
        false
    }

    /// Does this stage need point payloads at all?
    fn need_points(&self) -> bool {
        true
    }

    /// Buffer, in meters, this stage needs around each chunk.
    fn need_buffer(&self) -> f64 {
        0.0
    }

    /// The stage embeds user callbacks that must not run concurrently.
    fn uses_foreign_callback(&self) -> bool {
        false
    }

    // ---- lifecycle ---------------------------------------------------

    /// One-time pass over the catalog before any chunk (pre-run).
    fn process_collection(&mut self, catalog: &mut FileCollection) -> Result<()> {
        Ok(())
    }

    /// Receive the current chunk.
    fn set_chunk(&mut self, chunk: &Chunk) -> Result<()> {
        self.common_mut().chunk = chunk.clone();
        Ok(())
    }

    fn set_crs(&mut self, crs: &Crs) {
        self.common_mut().crs = crs.clone();
    }

    /// Initialise against the incoming header; the reader populates it.
    fn init(&mut self, header: &mut Option<Header>) -> Result<()> {
        Ok(())
    }

    /// Streamed mode: consume one point. The reader yields the next point
    /// into `point` and sets it to `None` at end of stream; later stages may
    /// set `None` to drop the point from the stream.
    fn process_point(&mut self, point: &mut Option<Point>, header: &Header) -> Result<()> {
        Ok(())
    }

    /// Loaded mode: operate on the chunk in memory. The reader fills the
    /// cloud. May return [`Flow::Break`] to short-circuit the chunk.
    fn process_cloud(&mut self, cloud: &mut PointCloud, ctx: &mut ChunkContext) -> Result<Flow> {
        Ok(Flow::Continue)
    }

    /// Flush buffered outputs after a chunk.
    fn write(&mut self) -> Result<()> {
        Ok(())
    }

    /// Release per-chunk state; `last` closes merged outputs.
    fn clear(&mut self, last: bool) -> Result<()> {
        Ok(())
    }

    // ---- threading ---------------------------------------------------

    /// Deep copy for a worker thread. Shared sinks stay shared; per-chunk
    /// state must be private to the clone.
    fn clone_stage(&self) -> Box<dyn Stage>;

    /// Fold a finished worker clone back into this stage. Implementations
    /// downcast through `as_any_mut` and take the clone's buffered state.
    fn merge(&mut self, other: &mut dyn Stage) -> Result<()> {
        Ok(())
    }

    /// Reorder buffered per-chunk outputs by compacted chunk rank so
    /// parallel runs produce the same files as serial ones.
    fn sort(&mut self, order: &[usize]) {}

    fn as_any_mut(&mut self) -> &mut dyn Any;
}
