//! The `reader_las` stage: first stage of every pipeline, yields the points
//! of the current chunk from its main and neighbour files.
//!
//! Streamed mode pulls batches of raw records and hands them out one by
//! one; only plain cursor state (file index, record position) lives in the
//! stage between calls, so clones stay cheap and worker-thread safe.

use std::any::Any;
use std::collections::VecDeque;
use std::path::PathBuf;

use point_cloud_core::{Header, Point, PointCloud};

use crate::error::Result;
use crate::stage::{ChunkContext, Flow, Stage, StageCommon};

/// Number of records decoded per refill.
const BATCH: usize = 65_536;

/// Cursor over the chunk's files.
struct Stream {
    files: Vec<PathBuf>,
    /// Index of the file currently being read.
    file: usize,
    /// Next record to read within the current file.
    position: u64,
    /// Records of the current file, or `None` before the first refill.
    npoints: Option<u64>,
    pending: VecDeque<Point>,
}

pub struct ReaderStage {
    common: StageCommon,
    header: Option<Header>,
    stream: Option<Stream>,
}

impl ReaderStage {
    pub fn new(common: StageCommon) -> Self {
        Self { common, header: None, stream: None }
    }

    /// All files contributing to the current chunk, main files first.
    fn chunk_files(&self) -> Vec<PathBuf> {
        let chunk = &self.common.chunk;
        chunk
            .main_files
            .iter()
            .chain(chunk.neighbour_files.iter())
            .cloned()
            .collect()
    }

    /// Merge the headers of the chunk's files.
    fn merged_header(&self) -> Result<Header> {
        let mut merged: Option<Header> = None;
        for path in self.chunk_files() {
            let reader = open(&path)?;
            let header = Header::from_las(reader.header());
            match &mut merged {
                Some(m) => m.merge(&header),
                None => merged = Some(header),
            }
        }
        Ok(merged.unwrap_or_default())
    }

    /// Convert, clip and flag one raw point; `None` when it falls outside
    /// the chunk plus its buffer or the stage filter rejects it.
    fn accept(&mut self, las_point: &las::Point, header: &Header, id: u32) -> Result<Option<Point>> {
        let chunk = &self.common.chunk;
        if !chunk.contains_buffered(las_point.x, las_point.y) {
            return Ok(None);
        }
        let mut point = Point::from_las(las_point, header, id);
        point.is_buffer = !chunk.contains(point.x, point.y);
        if !self.common.filter.is_empty() && !self.common.filter.keep(&point, header)? {
            return Ok(None);
        }
        Ok(Some(point))
    }

    /// Decode the next batch of the current file into `pending`, advancing
    /// files when one is exhausted. Returns false at end of stream.
    fn refill(&mut self) -> Result<bool> {
        loop {
            let (path, position, cached_total) = {
                let Some(stream) = &mut self.stream else { return Ok(false) };
                if !stream.pending.is_empty() {
                    return Ok(true);
                }
                if stream.file >= stream.files.len() {
                    return Ok(false);
                }
                (stream.files[stream.file].clone(), stream.position, stream.npoints)
            };

            let mut reader = open(&path)?;
            let total = cached_total.unwrap_or_else(|| reader.header().number_of_points());
            if cached_total.is_none() {
                self.stream.as_mut().unwrap().npoints = Some(total);
            }

            if position >= total {
                let stream = self.stream.as_mut().unwrap();
                stream.file += 1;
                stream.position = 0;
                stream.npoints = None;
                continue;
            }

            if position > 0 {
                reader.seek(position).map_err(point_cloud_core::CoreError::from)?;
            }
            let file_header = Header::from_las(reader.header());

            let mut batch = Vec::with_capacity(BATCH.min((total - position) as usize));
            for _ in 0..BATCH {
                match reader.read_point().map_err(point_cloud_core::CoreError::from)? {
                    Some(p) => batch.push(p),
                    None => break,
                }
            }
            drop(reader);
            let read = batch.len() as u64;

            let base = position as u32;
            let mut accepted = VecDeque::with_capacity(batch.len());
            for (k, las_point) in batch.iter().enumerate() {
                if let Some(p) = self.accept(las_point, &file_header, base + k as u32)? {
                    accepted.push_back(p);
                }
            }

            let stream = self.stream.as_mut().unwrap();
            stream.position += read;
            stream.pending = accepted;
            if read == 0 {
                stream.file += 1;
                stream.position = 0;
                stream.npoints = None;
            }
        }
    }
}

fn open(path: &PathBuf) -> Result<las::Reader> {
    las::Reader::from_path(path).map_err(|source| {
        point_cloud_core::CoreError::LasOpen { path: path.clone(), source }.into()
    })
}

impl Stage for ReaderStage {
    fn name(&self) -> &'static str {
        "reader_las"
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
        self.header = None;
        self.stream = None;
        self.common.filter.reset();
        Ok(())
    }

    fn init(&mut self, header: &mut Option<Header>) -> Result<()> {
        if self.header.is_none() {
            self.header = Some(self.merged_header()?);
            self.stream = Some(Stream {
                files: self.chunk_files(),
                file: 0,
                position: 0,
                npoints: None,
                pending: VecDeque::new(),
            });
        }
        *header = self.header.clone();
        Ok(())
    }

    /// Yield the next surviving point, or `None` at end of stream.
    fn process_point(&mut self, point: &mut Option<Point>, _header: &Header) -> Result<()> {
        if let Some(stream) = &mut self.stream {
            if let Some(p) = stream.pending.pop_front() {
                *point = Some(p);
                return Ok(());
            }
        }
        if self.refill()? {
            *point = self.stream.as_mut().unwrap().pending.pop_front();
        } else {
            *point = None;
        }
        Ok(())
    }

    /// Loaded mode: materialise the whole chunk.
    fn process_cloud(&mut self, cloud: &mut PointCloud, _ctx: &mut ChunkContext) -> Result<Flow> {
        let merged = self.header.clone().unwrap_or_default();
        *cloud = PointCloud::new(merged);

        for path in self.chunk_files() {
            let mut reader = open(&path)?;
            let file_header = Header::from_las(reader.header());
            let mut id = 0u32;
            for las_point in reader.points() {
                let las_point = las_point.map_err(point_cloud_core::CoreError::from)?;
                if let Some(p) = self.accept(&las_point, &file_header, id)? {
                    cloud.push(p);
                }
                id += 1;
            }
        }

        // Re-number so ids match positions in the materialised cloud.
        for (i, p) in cloud.points.iter_mut().enumerate() {
            p.file_id = i as u32;
        }
        cloud.header.npoints = cloud.len() as u64;
        cloud.build_index();
        Ok(Flow::Continue)
    }

    fn clear(&mut self, _last: bool) -> Result<()> {
        self.header = None;
        self.stream = None;
        Ok(())
    }

    fn clone_stage(&self) -> Box<dyn Stage> {
        Box::new(ReaderStage {
            common: self.common.clone(),
            header: None,
            stream: None,
        })
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
