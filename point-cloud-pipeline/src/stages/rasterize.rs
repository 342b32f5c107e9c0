//! Rasterisation of point metrics or of a connected triangulation.
//!
//! With per-cell streamable metrics (min, max, count) the stage consumes
//! the stream point by point; mean requires loaded mode, as does mesh
//! interpolation. Each chunk accumulates its own raster covering the chunk
//! core (buffer points contribute to core cells through the window), and
//! the merged output mosaics the chunk rasters in chunk order.

use std::any::Any;
use std::sync::Arc;

use point_cloud_core::{
    raster::write_raster_file, FileCollection, Header, Point, PointCloud, Raster, Rectangle,
};

use crate::error::{PipelineError, Result};
use crate::stage::{Artifact, ChunkContext, Flow, Stage, StageCommon};
use crate::stages::triangulate::sort_by_rank;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    Max,
    Min,
    Count,
    Mean,
}

impl Metric {
    pub fn parse(name: &str) -> Result<Self> {
        Ok(match name {
            "max" => Metric::Max,
            "min" => Metric::Min,
            "count" => Metric::Count,
            "mean" => Metric::Mean,
            other => {
                return Err(PipelineError::InvalidValue {
                    key: "method".to_string(),
                    reason: format!("unknown metric '{other}'"),
                })
            }
        })
    }

    fn streamable(self) -> bool {
        !matches!(self, Metric::Mean)
    }

    fn band_name(self) -> &'static str {
        match self {
            Metric::Max => "max",
            Metric::Min => "min",
            Metric::Count => "count",
            Metric::Mean => "mean",
        }
    }
}

pub struct RasterizeStage {
    common: StageCommon,
    res: f64,
    /// Contribution window; points feed every cell within `window / 2`.
    window: f64,
    metrics: Vec<Metric>,
    /// Uid of a triangulation stage to interpolate instead of metrics.
    connect: Option<String>,
    /// Full coverage extent captured during pre-run.
    full_extent: Option<Rectangle>,
    // Per-chunk accumulation.
    acc: Option<Raster>,
    counts: Vec<u32>,
    finalized: bool,
    // Finished chunk rasters awaiting the merged mosaic.
    finished: Vec<(usize, Raster)>,
}

impl RasterizeStage {
    pub fn new(
        common: StageCommon,
        res: f64,
        window: f64,
        metrics: Vec<Metric>,
        connect: Option<String>,
    ) -> Self {
        Self {
            common,
            res,
            window: window.max(res),
            metrics,
            connect,
            full_extent: None,
            acc: None,
            counts: Vec::new(),
            finalized: false,
            finished: Vec::new(),
        }
    }

    fn chunk_raster(&mut self) -> &mut Raster {
        if self.acc.is_none() {
            let bbox = self.common.chunk.bbox();
            let mut raster = Raster::from_extent(&bbox, self.res, self.metrics.len().max(1));
            raster.band_names = self.metrics.iter().map(|m| m.band_name().to_string()).collect();
            self.counts = vec![0; raster.grid.ncells];
            self.acc = Some(raster);
        }
        self.acc.as_mut().unwrap()
    }

    fn accumulate(&mut self, p: &Point) {
        let window = self.window;
        let res = self.res;
        let metrics = self.metrics.clone();
        self.chunk_raster();
        let raster = self.acc.as_mut().unwrap();

        // A point feeds only its own cell unless a larger window was
        // requested, in which case it covers every cell within window / 2.
        let cells = if window > res {
            raster.grid.cells_in(&Rectangle::new(
                p.x - window / 2.0,
                p.y - window / 2.0,
                p.x + window / 2.0,
                p.y + window / 2.0,
            ))
        } else {
            raster.grid.cell_from_xy(p.x, p.y).into_iter().collect()
        };

        let z = p.z as f32;
        for cell in cells {
            for (band, metric) in metrics.iter().enumerate() {
                match metric {
                    Metric::Max => raster.set_max(band, cell, z),
                    Metric::Min => raster.set_min(band, cell, z),
                    Metric::Count => {
                        let old = raster.get(band, cell);
                        let base = if old == raster.nodata { 0.0 } else { old };
                        raster.set(band, cell, base + 1.0);
                    }
                    Metric::Mean => {
                        let old = raster.get(band, cell);
                        let base = if old == raster.nodata { 0.0 } else { old };
                        raster.set(band, cell, base + z);
                        self.counts[cell] += 1;
                    }
                }
            }
        }
    }

    /// Turn mean sums into means once the chunk is complete.
    fn finalize_chunk(&mut self) {
        if self.finalized {
            return;
        }
        self.finalized = true;
        let Some(raster) = self.acc.as_mut() else { return };
        for (band, metric) in self.metrics.iter().enumerate() {
            if *metric != Metric::Mean {
                continue;
            }
            for cell in 0..raster.grid.ncells {
                let n = self.counts[cell];
                if n > 0 {
                    let sum = raster.get(band, cell);
                    raster.set(band, cell, sum / n as f32);
                }
            }
        }
    }
}

impl Stage for RasterizeStage {
    fn name(&self) -> &'static str {
        "rasterize"
    }

    fn common(&self) -> &StageCommon {
        &self.common
    }

    fn common_mut(&mut self) -> &mut StageCommon {
        &mut self.common
    }

    fn is_streamable(&self) -> bool {
        self.connect.is_none() && self.metrics.iter().all(|m| m.streamable())
    }

    fn is_parallelized(&self) -> bool {
        // Mesh interpolation fans out over triangles.
        self.connect.is_some()
    }

    fn process_collection(&mut self, catalog: &mut FileCollection) -> Result<()> {
        self.full_extent = Some(catalog.bbox());
        Ok(())
    }

    fn set_chunk(&mut self, chunk: &point_cloud_core::Chunk) -> Result<()> {
        self.common.chunk = chunk.clone();
        self.acc = None;
        self.counts.clear();
        self.finalized = false;
        self.common.filter.reset();
        Ok(())
    }

    fn process_point(&mut self, point: &mut Option<Point>, header: &Header) -> Result<()> {
        if let Some(p) = point {
            if !self.common.filter.is_empty() && !self.common.filter.keep(p, header)? {
                return Ok(());
            }
            let p = p.clone();
            self.accumulate(&p);
        }
        Ok(())
    }

    fn process_cloud(&mut self, cloud: &mut PointCloud, ctx: &mut ChunkContext) -> Result<Flow> {
        match self.connect.clone() {
            Some(uid) => {
                let tin = ctx
                    .triangulation(&uid)
                    .ok_or(PipelineError::IncompatibleConnection("rasterize"))?;
                self.chunk_raster();
                let raster = self.acc.as_mut().unwrap();
                tin.interpolate_raster(raster, 0, 0.0);
            }
            None => {
                let header = cloud.header.clone();
                let indices: Vec<usize> = cloud.iter_live().map(|(i, _)| i).collect();
                for i in indices {
                    let p = cloud.points[i].clone();
                    if !self.common.filter.is_empty() && !self.common.filter.keep(&p, &header)? {
                        continue;
                    }
                    self.accumulate(&p);
                }
                self.common.filter.reset();
            }
        }

        // Consumers connected to this stage (e.g. region growing over a
        // canopy height model) read the finished chunk raster.
        self.finalize_chunk();
        if let Some(raster) = &self.acc {
            ctx.artifacts
                .insert(self.common.uid.clone(), Artifact::Raster(Arc::new(raster.clone())));
        }
        Ok(Flow::Continue)
    }

    fn write(&mut self) -> Result<()> {
        self.finalize_chunk();
        let Some(raster) = self.acc.take() else { return Ok(()) };
        self.counts.clear();

        if self.common.per_chunk_output() {
            if let Some(path) = self.common.output_path() {
                write_raster_file(&raster, &path)?;
            }
        }
        self.finished.push((self.common.chunk.id, raster));
        Ok(())
    }

    fn clear(&mut self, last: bool) -> Result<()> {
        self.acc = None;
        self.counts.clear();
        if last {
            if let Some(path) = self.common.merged_output_path() {
                let extent = self
                    .full_extent
                    .unwrap_or_else(|| self.common.chunk.bbox());
                let mut master = Raster::from_extent(&extent, self.res, self.metrics.len().max(1));
                master.band_names =
                    self.metrics.iter().map(|m| m.band_name().to_string()).collect();
                for (_, raster) in &self.finished {
                    master.merge_from(raster);
                }
                write_raster_file(&master, &path)?;
            }
            self.finished.clear();
        }
        Ok(())
    }

    fn merge(&mut self, other: &mut dyn Stage) -> Result<()> {
        if let Some(other) = other.as_any_mut().downcast_mut::<Self>() {
            self.finished.append(&mut other.finished);
        }
        Ok(())
    }

    fn sort(&mut self, order: &[usize]) {
        sort_by_rank(&mut self.finished, order);
    }

    fn clone_stage(&self) -> Box<dyn Stage> {
        Box::new(RasterizeStage {
            common: self.common.clone(),
            res: self.res,
            window: self.window,
            metrics: self.metrics.clone(),
            connect: self.connect.clone(),
            full_extent: self.full_extent,
            acc: None,
            counts: Vec::new(),
            finalized: false,
            finished: Vec::new(),
        })
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
