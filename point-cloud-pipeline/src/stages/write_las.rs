//! LAS/LAZ writer stage. A `*` in the output template writes one file per
//! chunk; otherwise chunks are buffered, reordered by chunk rank and
//! written into a single merged file when the last chunk clears.

use std::any::Any;
use std::path::Path;

use point_cloud_core::{Header, Point, PointCloud};

use crate::error::Result;
use crate::stage::{ChunkContext, Flow, Stage, StageCommon};
use crate::stages::triangulate::sort_by_rank;

/// Build the output header for the `las` crate from the engine header.
/// Everything is written as LAS 1.4 with a modern point record format; the
/// extra-byte schema is described by its VLR so readers can decode it.
pub(crate) fn build_las_header(header: &Header, compressed: bool) -> Result<las::Header> {
    let mut builder = las::Builder::from((1, 4));

    let target = match header.point_format {
        7 => 7,
        8 => 8,
        2 | 3 | 5 => 7,
        _ => 6,
    };
    let mut format = las::point::Format::new(target)?;
    format.is_compressed = compressed;
    format.extra_bytes = header.extra_bytes_len() as u16;
    builder.point_format = format;

    builder.transforms = las::Vector {
        x: las::Transform { scale: header.scale.0, offset: header.offset.0 },
        y: las::Transform { scale: header.scale.1, offset: header.offset.1 },
        z: las::Transform { scale: header.scale.2, offset: header.offset.2 },
    };

    if !header.crs.wkt.is_empty() {
        builder.vlrs.push(las::Vlr {
            user_id: "LASF_Projection".to_string(),
            record_id: 2112,
            description: "OGC WKT CRS".to_string(),
            data: header.crs.wkt.as_bytes().to_vec(),
        });
    }

    if !header.schema.is_empty() {
        builder.vlrs.push(extra_bytes_vlr(header));
    }

    Ok(builder.into_header()?)
}

/// The LAS extra-bytes VLR: one 192-byte descriptor per attribute.
fn extra_bytes_vlr(header: &Header) -> las::Vlr {
    let mut data = Vec::with_capacity(header.schema.len() * 192);
    for attr in &header.schema {
        let mut record = [0u8; 192];
        record[2] = attr.kind.to_code();
        let mut options = 0u8;
        if attr.scale.is_some() {
            options |= 0b1000;
        }
        if attr.offset.is_some() {
            options |= 0b10000;
        }
        record[3] = options;
        let name = attr.name.as_bytes();
        let n = name.len().min(32);
        record[4..4 + n].copy_from_slice(&name[..n]);
        if let Some(scale) = attr.scale {
            record[112..120].copy_from_slice(&scale.to_le_bytes());
        }
        if let Some(offset) = attr.offset {
            record[136..144].copy_from_slice(&offset.to_le_bytes());
        }
        data.extend_from_slice(&record);
    }
    las::Vlr {
        user_id: "LASF_Spec".to_string(),
        record_id: 4,
        description: "extra bytes".to_string(),
        data,
    }
}

fn is_laz(path: &Path) -> bool {
    path.extension()
        .map(|e| e.eq_ignore_ascii_case("laz"))
        .unwrap_or(false)
}

pub struct WriteLasStage {
    common: StageCommon,
    header: Option<Header>,
    /// Points of the current chunk (streamed mode).
    current: Vec<Point>,
    /// Finished chunks awaiting the merged write.
    chunks: Vec<(usize, Vec<Point>)>,
}

impl WriteLasStage {
    pub fn new(common: StageCommon) -> Self {
        Self { common, header: None, current: Vec::new(), chunks: Vec::new() }
    }

    fn write_file(&self, path: &Path, header: &Header, points: &[Vec<Point>]) -> Result<()> {
        let las_header = build_las_header(header, is_laz(path))?;
        let mut writer = las::Writer::from_path(path, las_header)?;
        for batch in points {
            for p in batch {
                writer.write_point(p.to_las(header))?;
            }
        }
        writer.close()?;
        Ok(())
    }
}

impl Stage for WriteLasStage {
    fn name(&self) -> &'static str {
        "write_las"
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
        if self.common.per_chunk_output() {
            if let Some(path) = self.common.output_path() {
                if let Some(header) = &self.header {
                    self.write_file(&path, header, &[points])?;
                }
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
                if let Some(header) = self.header.clone() {
                    let batches: Vec<Vec<Point>> =
                        self.chunks.drain(..).map(|(_, points)| points).collect();
                    self.write_file(&path, &header, &batches)?;
                }
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
        Box::new(WriteLasStage {
            common: self.common.clone(),
            header: self.header.clone(),
            current: Vec::new(),
            chunks: Vec::new(),
        })
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
