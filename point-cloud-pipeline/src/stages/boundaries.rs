//! Coverage boundaries: the contour of a connected triangulation, or the
//! chunk rectangle when no mesh is available.

use std::any::Any;

use point_cloud_core::{Edge, PointCloud, PointXY, PolygonXY, Vector};
use serde_json::json;

use crate::error::Result;
use crate::stage::{ChunkContext, Flow, Stage, StageCommon};
use crate::stages::triangulate::sort_by_rank;

enum ChunkBoundary {
    Edges(Vec<Edge>),
    Bbox(PolygonXY),
}

pub struct BoundariesStage {
    common: StageCommon,
    connect: Option<String>,
    collected: Vec<(usize, ChunkBoundary)>,
}

impl BoundariesStage {
    pub fn new(common: StageCommon, connect: Option<String>) -> Self {
        Self { common, connect, collected: Vec::new() }
    }

    fn write_into(&self, vector: &mut Vector, id: usize, boundary: &ChunkBoundary) {
        match boundary {
            ChunkBoundary::Edges(edges) => vector.write_edges(edges, json!({"chunk": id})),
            ChunkBoundary::Bbox(ring) => vector.write_polygon(ring, json!({"chunk": id})),
        }
    }
}

impl Stage for BoundariesStage {
    fn name(&self) -> &'static str {
        "boundaries"
    }

    fn common(&self) -> &StageCommon {
        &self.common
    }

    fn common_mut(&mut self) -> &mut StageCommon {
        &mut self.common
    }

    fn need_points(&self) -> bool {
        self.connect.is_some()
    }

    fn process_cloud(&mut self, _cloud: &mut PointCloud, ctx: &mut ChunkContext) -> Result<Flow> {
        let boundary = match &self.connect {
            Some(uid) => match ctx.triangulation(uid) {
                Some(tin) => ChunkBoundary::Edges(tin.contour()),
                None => ChunkBoundary::Bbox(chunk_ring(&self.common)),
            },
            None => ChunkBoundary::Bbox(chunk_ring(&self.common)),
        };

        if self.common.per_chunk_output() {
            if let Some(path) = self.common.output_path() {
                let mut vector = Vector::new();
                self.write_into(&mut vector, self.common.chunk.id, &boundary);
                vector.set_path(path);
                vector.write()?;
            }
        } else {
            self.collected.push((self.common.chunk.id, boundary));
        }
        Ok(Flow::Continue)
    }

    fn clear(&mut self, last: bool) -> Result<()> {
        if last {
            if let Some(path) = self.common.merged_output_path() {
                let mut vector = Vector::new();
                for (id, boundary) in &self.collected {
                    self.write_into(&mut vector, *id, boundary);
                }
                vector.set_path(path);
                vector.write()?;
            }
            self.collected.clear();
        }
        Ok(())
    }

    fn merge(&mut self, other: &mut dyn Stage) -> Result<()> {
        if let Some(other) = other.as_any_mut().downcast_mut::<Self>() {
            self.collected.append(&mut other.collected);
        }
        Ok(())
    }

    fn sort(&mut self, order: &[usize]) {
        sort_by_rank(&mut self.collected, order);
    }

    fn clone_stage(&self) -> Box<dyn Stage> {
        Box::new(BoundariesStage {
            common: self.common.clone(),
            connect: self.connect.clone(),
            collected: Vec::new(),
        })
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

fn chunk_ring(common: &StageCommon) -> PolygonXY {
    let bb = common.chunk.bbox();
    let mut ring = PolygonXY::new(vec![
        PointXY::new(bb.xmin, bb.ymin),
        PointXY::new(bb.xmax, bb.ymin),
        PointXY::new(bb.xmax, bb.ymax),
        PointXY::new(bb.xmin, bb.ymax),
    ]);
    ring.close();
    ring
}
