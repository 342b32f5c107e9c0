//! Delaunay triangulation stage. Produces a triangulation artifact for
//! connected stages (rasterize, transform_with, boundaries) and can dump
//! the mesh into a vector sink.

use std::any::Any;
use std::sync::Arc;

use point_cloud_core::{PointCloud, PointXYZ, TriangleXYZ, Vector};
use point_cloud_delaunay::Triangulation;
use serde_json::json;

use crate::error::Result;
use crate::stage::{Artifact, ChunkContext, Flow, Stage, StageCommon};

pub struct TriangulateStage {
    common: StageCommon,
    /// Squared edge length above which triangles are trimmed from outputs;
    /// zero keeps everything.
    max_edge_sq: f64,
    /// Attribute interpolated as z (defaults to the elevation).
    use_attribute: String,
    /// Mesh dumps buffered per chunk rank for the merged vector output.
    dumps: Vec<(usize, Vec<TriangleXYZ>)>,
}

impl TriangulateStage {
    pub fn new(common: StageCommon, max_edge: f64, use_attribute: String) -> Self {
        Self {
            common,
            max_edge_sq: if max_edge > 0.0 { max_edge * max_edge } else { 0.0 },
            use_attribute,
            dumps: Vec::new(),
        }
    }

    pub fn max_edge_sq(&self) -> f64 {
        self.max_edge_sq
    }
}

impl Stage for TriangulateStage {
    fn name(&self) -> &'static str {
        "triangulate"
    }

    fn common(&self) -> &StageCommon {
        &self.common
    }

    fn common_mut(&mut self) -> &mut StageCommon {
        &mut self.common
    }

    fn need_buffer(&self) -> f64 {
        50.0
    }

    fn process_cloud(&mut self, cloud: &mut PointCloud, ctx: &mut ChunkContext) -> Result<Flow> {
        let bbox = self.common.chunk.buffered_bbox();
        let mut tin = Triangulation::new(&bbox);

        let header = cloud.header.clone();
        let use_z = self.use_attribute.eq_ignore_ascii_case("z");
        for (i, p) in cloud.iter_live() {
            if !self.common.filter.is_empty() && !self.common.filter.keep(p, &header)? {
                continue;
            }
            let z = if use_z {
                p.z
            } else {
                p.attribute(&self.use_attribute, &header).unwrap_or(p.z)
            };
            tin.insert(PointXYZ::new(p.x, p.y, z), i as u32);
        }
        self.common.filter.reset();

        let tin = Arc::new(tin);
        if !self.common.output.is_empty() {
            let triangles: Vec<TriangleXYZ> = tin
                .triangles()
                .filter(|t| self.max_edge_sq <= 0.0 || t.square_max_edge_size() <= self.max_edge_sq)
                .collect();
            if self.common.per_chunk_output() {
                if let Some(path) = self.common.output_path() {
                    let mut vector = Vector::new();
                    vector.write_triangulation(&triangles, json!({"chunk": self.common.chunk.name}));
                    vector.set_path(path);
                    vector.write()?;
                }
            } else {
                self.dumps.push((self.common.chunk.id, triangles));
            }
        }

        ctx.artifacts
            .insert(self.common.uid.clone(), Artifact::Triangulation(tin));
        Ok(Flow::Continue)
    }

    fn clear(&mut self, last: bool) -> Result<()> {
        if last {
            if let Some(path) = self.common.merged_output_path() {
                let mut vector = Vector::new();
                for (id, triangles) in &self.dumps {
                    vector.write_triangulation(triangles, json!({"chunk": id}));
                }
                vector.set_path(path);
                vector.write()?;
            }
            self.dumps.clear();
        }
        Ok(())
    }

    fn merge(&mut self, other: &mut dyn Stage) -> Result<()> {
        if let Some(other) = other.as_any_mut().downcast_mut::<Self>() {
            self.dumps.append(&mut other.dumps);
        }
        Ok(())
    }

    fn sort(&mut self, order: &[usize]) {
        sort_by_rank(&mut self.dumps, order);
    }

    fn clone_stage(&self) -> Box<dyn Stage> {
        Box::new(TriangulateStage {
            common: self.common.clone(),
            max_edge_sq: self.max_edge_sq,
            use_attribute: self.use_attribute.clone(),
            dumps: Vec::new(),
        })
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Order chunk-keyed buffers by the compacted rank of their chunk id.
pub(crate) fn sort_by_rank<T>(items: &mut Vec<(usize, T)>, order: &[usize]) {
    use std::collections::HashMap;
    let rank: HashMap<usize, usize> =
        order.iter().enumerate().map(|(rank, &id)| (id, rank)).collect();
    items.sort_by_key(|(id, _)| rank.get(id).copied().unwrap_or(usize::MAX));
}
