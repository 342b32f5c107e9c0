//! COPC writer stage: buffers the chunks and hands the merged cloud to the
//! octree writer when the last chunk clears.

use std::any::Any;

use point_cloud_core::{Header, Point, PointCloud};
use point_cloud_copc::{CopcOptions, CopcWriter};

use crate::error::Result;
use crate::stage::{ChunkContext, Flow, Stage, StageCommon};
use crate::stages::triangulate::sort_by_rank;
use crate::stages::write_las::build_las_header;

pub struct WriteCopcStage {
    common: StageCommon,
    options: CopcOptions,
    header: Option<Header>,
    current: Vec<Point>,
    chunks: Vec<(usize, Vec<Point>)>,
}

impl WriteCopcStage {
    pub fn new(common: StageCommon, options: CopcOptions) -> Self {
        Self { common, options, header: None, current: Vec::new(), chunks: Vec::new() }
    }
}

impl Stage for WriteCopcStage {
    fn name(&self) -> &'static str {
        "write_copc"
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

    fn init(&mut self, header: &mut Option<Header>) -> Result<()> {
        if let Some(h) = header {
            if self.header.is_none() {
                self.header = Some(h.clone());
            }
        }
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
        self.header = Some(cloud.header.clone());
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
        self.chunks.push((self.common.chunk.id, points));
        Ok(())
    }

    fn clear(&mut self, last: bool) -> Result<()> {
        self.current.clear();
        if last {
            let path = self
                .common
                .merged_output_path()
                .or_else(|| self.common.output_path());
            if let (Some(path), Some(header)) = (path, self.header.clone()) {
                let las_header = build_las_header(&header, true)?;
                let mut writer =
                    CopcWriter::from_path(&path, las_header, self.options.clone())?;
                for (_, points) in self.chunks.drain(..) {
                    for p in points {
                        writer.write_point(p.to_las(&header))?;
                    }
                }
                writer.close()?;
            }
            self.chunks.clear();
        }
        Ok(())
    }

    fn merge(&mut self, other: &mut dyn Stage) -> Result<()> {
        if let Some(other) = other.as_any_mut().downcast_mut::<Self>() {
            if self.header.is_none() {
                self.header = other.header.clone();
            }
            self.chunks.append(&mut other.chunks);
        }
        Ok(())
    }

    fn sort(&mut self, order: &[usize]) {
        sort_by_rank(&mut self.chunks, order);
    }

    fn clone_stage(&self) -> Box<dyn Stage> {
        Box::new(WriteCopcStage {
            common: self.common.clone(),
            options: self.options.clone(),
            header: self.header.clone(),
            current: Vec::new(),
            chunks: Vec::new(),
        })
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
