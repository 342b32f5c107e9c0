//! Local maximum finder: a point is a maximum when nothing in its window is
//! strictly higher. Ids are drawn from a counter shared between worker
//! clones, keyed by quantised coordinates so a maximum found in the buffer
//! of two neighbouring chunks receives the same id in both.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use point_cloud_core::{Circle, PointCloud, PointXYZ, Shape, Vector};
use rayon::prelude::*;
use serde_json::json;

use crate::error::Result;
use crate::stage::{Artifact, ChunkContext, Flow, Stage, StageCommon};
use crate::stages::triangulate::sort_by_rank;

/// Coordinate quantum of the shared id map (millimeters).
const QUANTUM: f64 = 1000.0;

pub struct LocalMaximumStage {
    common: StageCommon,
    /// Window diameter: the query circle has radius `ws / 2`.
    ws: f64,
    min_height: f64,
    /// Shared across clones: (quantised x, quantised y) -> id.
    ids: Arc<Mutex<HashMap<(i64, i64), u32>>>,
    next_id: Arc<AtomicU32>,
    /// Maxima of the chunk core, buffered per chunk for the merged output.
    found: Vec<(usize, Vec<(u32, PointXYZ)>)>,
}

impl LocalMaximumStage {
    pub fn new(common: StageCommon, ws: f64, min_height: f64) -> Self {
        Self {
            common,
            ws,
            min_height,
            ids: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU32::new(1)),
            found: Vec::new(),
        }
    }

    fn id_for(&self, x: f64, y: f64) -> u32 {
        let key = ((x * QUANTUM).round() as i64, (y * QUANTUM).round() as i64);
        let mut ids = self.ids.lock().unwrap();
        match ids.get(&key) {
            Some(&id) => id,
            None => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                ids.insert(key, id);
                id
            }
        }
    }
}

impl Stage for LocalMaximumStage {
    fn name(&self) -> &'static str {
        "local_maximum"
    }

    fn common(&self) -> &StageCommon {
        &self.common
    }

    fn common_mut(&mut self) -> &mut StageCommon {
        &mut self.common
    }

    fn is_parallelized(&self) -> bool {
        true
    }

    fn need_buffer(&self) -> f64 {
        self.ws
    }

    fn process_cloud(&mut self, cloud: &mut PointCloud, ctx: &mut ChunkContext) -> Result<Flow> {
        let header = cloud.header.clone();
        let mut candidates: Vec<usize> = Vec::with_capacity(cloud.len());
        for (i, p) in cloud.iter_live() {
            if p.z < self.min_height {
                continue;
            }
            if !self.common.filter.is_empty() && !self.common.filter.keep(p, &header)? {
                continue;
            }
            candidates.push(i);
        }
        self.common.filter.reset();

        let radius = self.ws / 2.0;
        let maxima: Vec<usize> = candidates
            .par_iter()
            .copied()
            .filter(|&i| {
                let p = &cloud.points[i];
                let shape = Shape::Circle(Circle::new(p.x, p.y, radius));
                for j in cloud.query(&shape) {
                    let q = &cloud.points[j as usize];
                    if q.z > p.z {
                        return false;
                    }
                    // Equal heights tie-break on coordinates so exactly one
                    // of the two wins.
                    if q.z == p.z && (q.x, q.y) > (p.x, p.y) {
                        return false;
                    }
                }
                true
            })
            .collect();

        let detected: Vec<(usize, u32, PointXYZ)> = maxima
            .iter()
            .map(|&i| {
                let p = &cloud.points[i];
                (i, self.id_for(p.x, p.y), PointXYZ::new(p.x, p.y, p.z))
            })
            .collect();

        // The artifact carries every maximum (buffer included) so consumers
        // grow identical regions on both sides of a chunk boundary; outputs
        // keep only the chunk core.
        let mut all: Vec<(u32, PointXYZ)> =
            detected.iter().map(|&(_, id, p)| (id, p)).collect();
        all.sort_by_key(|(id, _)| *id);
        ctx.artifacts
            .insert(self.common.uid.clone(), Artifact::Maxima(Arc::new(all)));

        let mut core: Vec<(u32, PointXYZ)> = detected
            .iter()
            .filter(|&&(i, _, _)| !cloud.points[i].is_buffer)
            .map(|&(_, id, p)| (id, p))
            .collect();
        core.sort_by_key(|(id, _)| *id);

        if self.common.per_chunk_output() {
            if let Some(path) = self.common.output_path() {
                let mut vector = Vector::new();
                for (id, p) in &core {
                    vector.write_point(p, json!({"id": id}));
                }
                vector.set_path(path);
                vector.write()?;
            }
        } else {
            self.found.push((self.common.chunk.id, core));
        }
        Ok(Flow::Continue)
    }

    fn clear(&mut self, last: bool) -> Result<()> {
        if last {
            if let Some(path) = self.common.merged_output_path() {
                let mut vector = Vector::new();
                for (_, maxima) in &self.found {
                    for (id, p) in maxima {
                        vector.write_point(p, json!({"id": id}));
                    }
                }
                vector.set_path(path);
                vector.write()?;
            }
            self.found.clear();
        }
        Ok(())
    }

    fn merge(&mut self, other: &mut dyn Stage) -> Result<()> {
        if let Some(other) = other.as_any_mut().downcast_mut::<Self>() {
            self.found.append(&mut other.found);
        }
        Ok(())
    }

    fn sort(&mut self, order: &[usize]) {
        sort_by_rank(&mut self.found, order);
    }

    fn clone_stage(&self) -> Box<dyn Stage> {
        Box::new(LocalMaximumStage {
            common: self.common.clone(),
            ws: self.ws,
            min_height: self.min_height,
            ids: Arc::clone(&self.ids),
            next_id: Arc::clone(&self.next_id),
            found: Vec::new(),
        })
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
