//! Crown segmentation by region growing over a canopy height model.
//!
//! Seeded by the maxima of a connected `local_maximum` stage, regions
//! expand by rook adjacency while the pixel value stays above the adaptive
//! threshold `max(h_seed·th_seed, mh_crown·th_crown, th_tree)` and the
//! pixel lies within `max_cr` of the seed.

use std::any::Any;
use std::collections::VecDeque;

use point_cloud_core::{raster::write_raster_file, Contiguity, PointCloud, Raster};

use crate::error::{PipelineError, Result};
use crate::stage::{ChunkContext, Flow, Stage, StageCommon};
use crate::stages::triangulate::sort_by_rank;

pub struct RegionGrowingStage {
    common: StageCommon,
    th_tree: f64,
    th_seed: f64,
    th_crown: f64,
    /// Maximum crown radius (meters).
    max_cr: f64,
    /// Uid of the seeding local-maximum stage.
    connect_seeds: String,
    /// Uid of the rasterize stage providing the height model.
    connect_chm: String,
    labelled: Vec<(usize, Raster)>,
}

impl RegionGrowingStage {
    pub fn new(
        common: StageCommon,
        th_tree: f64,
        th_seed: f64,
        th_crown: f64,
        max_cr: f64,
        connect_seeds: String,
        connect_chm: String,
    ) -> Self {
        Self {
            common,
            th_tree,
            th_seed,
            th_crown,
            max_cr,
            connect_seeds,
            connect_chm,
            labelled: Vec::new(),
        }
    }
}

impl Stage for RegionGrowingStage {
    fn name(&self) -> &'static str {
        "region_growing"
    }

    fn common(&self) -> &StageCommon {
        &self.common
    }

    fn common_mut(&mut self) -> &mut StageCommon {
        &mut self.common
    }

    fn need_points(&self) -> bool {
        false
    }

    fn need_buffer(&self) -> f64 {
        self.max_cr
    }

    fn process_cloud(&mut self, _cloud: &mut PointCloud, ctx: &mut ChunkContext) -> Result<Flow> {
        let seeds = ctx
            .maxima(&self.connect_seeds)
            .ok_or(PipelineError::IncompatibleConnection("region_growing"))?;
        let chm = ctx
            .raster(&self.connect_chm)
            .ok_or(PipelineError::IncompatibleConnection("region_growing"))?;

        let grid = chm.grid.clone();
        let mut labels = Raster::new(grid.clone(), 1);
        let mut crown_sum = vec![0.0f64; grid.ncells];
        let mut crown_n = vec![0u32; grid.ncells];
        let mut seed_of = vec![0u32; grid.ncells];

        // Highest seeds claim their pixels first.
        let mut ordered: Vec<(u32, point_cloud_core::PointXYZ)> = seeds.to_vec();
        ordered.sort_by(|a, b| b.1.z.partial_cmp(&a.1.z).unwrap_or(std::cmp::Ordering::Equal));

        let mut queue = VecDeque::new();
        let mut seed_height = std::collections::HashMap::new();
        let mut seed_pos = std::collections::HashMap::new();

        for (id, p) in &ordered {
            let Some(cell) = grid.cell_from_xy(p.x, p.y) else { continue };
            if labels.get(0, cell) != labels.nodata {
                continue;
            }
            labels.set(0, cell, *id as f32);
            seed_of[cell] = *id;
            crown_sum[cell] = p.z;
            crown_n[cell] = 1;
            seed_height.insert(*id, p.z);
            seed_pos.insert(*id, (p.x, p.y));
            queue.push_back(cell);
        }

        let max_cr_sq = self.max_cr * self.max_cr;
        while let Some(cell) = queue.pop_front() {
            let id = seed_of[cell];
            let h_seed = seed_height[&id];
            let (sx, sy) = seed_pos[&id];

            for next in grid.adjacent_cells(cell, Contiguity::Rook) {
                if labels.get(0, next) != labels.nodata {
                    continue;
                }
                let Some(value) = chm
                    .value_at(0, grid.xy_from_cell(next).0, grid.xy_from_cell(next).1)
                else {
                    continue;
                };
                let value = value as f64;

                let mh_crown = crown_sum[cell] / crown_n[cell].max(1) as f64;
                let threshold = (h_seed * self.th_seed)
                    .max(mh_crown * self.th_crown)
                    .max(self.th_tree);
                if value <= threshold {
                    continue;
                }

                let (x, y) = grid.xy_from_cell(next);
                let dx = x - sx;
                let dy = y - sy;
                if dx * dx + dy * dy >= max_cr_sq {
                    continue;
                }

                labels.set(0, next, id as f32);
                seed_of[next] = id;
                crown_sum[next] = crown_sum[cell] + value;
                crown_n[next] = crown_n[cell] + 1;
                queue.push_back(next);
            }
        }

        if self.common.per_chunk_output() {
            if let Some(path) = self.common.output_path() {
                write_raster_file(&labels, &path)?;
            }
        }
        self.labelled.push((self.common.chunk.id, labels));
        Ok(Flow::Continue)
    }

    fn clear(&mut self, last: bool) -> Result<()> {
        if last {
            if let Some(path) = self.common.merged_output_path() {
                if let Some((_, first)) = self.labelled.first() {
                    let mut extent = first.grid.bbox();
                    for (_, r) in &self.labelled {
                        extent.merge(&r.grid.bbox());
                    }
                    let mut master = Raster::from_extent(&extent, first.grid.xres, 1);
                    for (_, r) in &self.labelled {
                        master.merge_from(r);
                    }
                    write_raster_file(&master, &path)?;
                }
            }
            self.labelled.clear();
        }
        Ok(())
    }

    fn merge(&mut self, other: &mut dyn Stage) -> Result<()> {
        if let Some(other) = other.as_any_mut().downcast_mut::<Self>() {
            self.labelled.append(&mut other.labelled);
        }
        Ok(())
    }

    fn sort(&mut self, order: &[usize]) {
        sort_by_rank(&mut self.labelled, order);
    }

    fn clone_stage(&self) -> Box<dyn Stage> {
        Box::new(RegionGrowingStage {
            common: self.common.clone(),
            th_tree: self.th_tree,
            th_seed: self.th_seed,
            th_crown: self.th_crown,
            max_cr: self.max_cr,
            connect_seeds: self.connect_seeds.clone(),
            connect_chm: self.connect_chm.clone(),
            labelled: Vec::new(),
        })
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
