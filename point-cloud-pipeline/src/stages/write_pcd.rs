//! PCD writer stage: the simple ASCII flavour of the Point Cloud Data
//! format, one file per chunk or one merged file.

use std::any::Any;
use std::fs::File;
use std::io::{BufWriter, Write as _};
use std::path::Path;

use point_cloud_core::{Header, Point, PointCloud};

use crate::error::Result;
use crate::stage::{ChunkContext, Flow, Stage, StageCommon};
use crate::stages::triangulate::sort_by_rank;

pub struct WritePcdStage {
    common: StageCommon,
    current: Vec<Point>,
    chunks: Vec<(usize, Vec<Point>)>,
}

impl WritePcdStage {
    pub fn new(common: StageCommon) -> Self {
        Self { common, current: Vec::new(), chunks: Vec::new() }
    }

    fn write_file(path: &Path, batches: &[Vec<Point>]) -> Result<()> {
        let n: usize = batches.iter().map(|b| b.len()).sum();
        let mut out = BufWriter::new(File::create(path)?);
        writeln!(out, "# .PCD v0.7 - Point Cloud Data file format")?;
        writeln!(out, "VERSION 0.7")?;
        writeln!(out, "FIELDS x y z intensity")?;
        writeln!(out, "SIZE 8 8 8 2")?;
        writeln!(out, "TYPE F F F U")?;
        writeln!(out, "COUNT 1 1 1 1")?;
        writeln!(out, "WIDTH {n}")?;
        writeln!(out, "HEIGHT 1")?;
        writeln!(out, "VIEWPOINT 0 0 0 1 0 0 0")?;
        writeln!(out, "POINTS {n}")?;
        writeln!(out, "DATA ascii")?;
        for batch in batches {
            for p in batch {
                writeln!(out, "{} {} {} {}", p.x, p.y, p.z, p.intensity)?;
            }
        }
        out.flush()?;
        Ok(())
    }
}

impl Stage for WritePcdStage {
    fn name(&self) -> &'static str {
        "write_pcd"
    }

    fn common(&self) -> &StageCommon {
        &self.common
    }

    fn common_mut(&mut self) -> &mut StageCommon {
        &mut self.common
    }

    fn is_streamable(&self) -> bool {
        true
    }

    fn set_chunk(&mut self, chunk: &point_cloud_core::Chunk) -> Result<()> {
        self.common.chunk = chunk.clone();
        self.current.clear();
        self.common.filter.reset();
        Ok(())
    }

    fn process_point(&mut self, point: &mut Option<Point>, header: &Header) -> Result<()> {
        if let Some(p) = point {
            if p.is_buffer {
                return Ok(());
            }
            if !self.common.filter.is_empty() && !self.common.filter.keep(p, header)? {
                return Ok(());
            }
            self.current.push(p.clone());
        }
        Ok(())
    }

    fn process_cloud(&mut self, cloud: &mut PointCloud, _ctx: &mut ChunkContext) -> Result<Flow> {
        let header = cloud.header.clone();
        let indices: Vec<usize> = cloud.iter_live().map(|(i, _)| i).collect();
        for i in indices {
            let p = cloud.points[i].clone();
            if p.is_buffer {
                continue;
            }
            if !self.common.filter.is_empty() && !self.common.filter.keep(&p, &header)? {
                continue;
            }
            self.current.push(p);
        }
        self.common.filter.reset();
        Ok(Flow::Continue)
    }

    fn write(&mut self) -> Result<()> {
        let points = std::mem::take(&mut self.current);
        if self.common.per_chunk_output() {
            if let Some(path) = self.common.output_path() {
                Self::write_file(&path, &[points])?;
            }
        } else {
            self.chunks.push((self.common.chunk.id, points));
        }
        Ok(())
    }

    fn clear(&mut self, last: bool) -> Result<()> {
        self.current.clear();
        if last {
            if let Some(path) = self.common.merged_output_path() {
                let batches: Vec<Vec<Point>> =
                    self.chunks.drain(..).map(|(_, points)| points).collect();
                Self::write_file(&path, &batches)?;
            }
            self.chunks.clear();
        }
        Ok(())
    }

    fn merge(&mut self, other: &mut dyn Stage) -> Result<()> {
        if let Some(other) = other.as_any_mut().downcast_mut::<Self>() {
            self.chunks.append(&mut other.chunks);
        }
        Ok(())
    }

    fn sort(&mut self, order: &[usize]) {
        sort_by_rank(&mut self.chunks, order);
    }

    fn clone_stage(&self) -> Box<dyn Stage> {
        Box::new(WritePcdStage {
            common: self.common.clone(),
            current: Vec::new(),
            chunks: Vec::new(),
        })
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
