//! A spatial partition of the catalog handed to worker threads.

use std::path::PathBuf;

use crate::shapes::{Circle, PolygonXY, Rectangle, Shape};

/// Geometry of the region a chunk covers. Regular chunks are rectangles;
/// query-driven chunks may be circles or polygons.
#[derive(Debug, Clone)]
pub enum ChunkShape {
    Rectangle,
    Circle(Circle),
    Polygon(PolygonXY),
}

/// One unit of work: a bounding box, the buffer around it, the files that
/// cover it and the neighbour files that only contribute buffer points.
///
/// A chunk with `process == false` is read-only: its points only serve as
/// buffer for adjacent chunks and no output is produced for it.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: usize,
    pub name: String,
    pub xmin: f64,
    pub ymin: f64,
    pub xmax: f64,
    pub ymax: f64,
    pub buffer: f64,
    pub shape: ChunkShape,
    pub main_files: Vec<PathBuf>,
    pub neighbour_files: Vec<PathBuf>,
    pub process: bool,
}

impl Default for Chunk {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            xmin: 0.0,
            ymin: 0.0,
            xmax: 0.0,
            ymax: 0.0,
            buffer: 0.0,
            shape: ChunkShape::Rectangle,
            main_files: Vec::new(),
            neighbour_files: Vec::new(),
            process: true,
        }
    }
}

impl Chunk {
    pub fn bbox(&self) -> Rectangle {
        Rectangle::new(self.xmin, self.ymin, self.xmax, self.ymax)
    }

    /// The bbox inflated by the buffer.
    pub fn buffered_bbox(&self) -> Rectangle {
        self.bbox().buffered(self.buffer)
    }

    pub fn is_empty(&self) -> bool {
        self.main_files.is_empty()
    }

    /// Whether (x, y) lies in the chunk proper (not in its buffer ring).
    pub fn contains(&self, x: f64, y: f64) -> bool {
        match &self.shape {
            ChunkShape::Rectangle => self.bbox().contains(x, y),
            ChunkShape::Circle(c) => c.contains(x, y),
            ChunkShape::Polygon(p) => p.contains(x, y),
        }
    }

    /// Whether (x, y) lies in the chunk or its buffer ring.
    pub fn contains_buffered(&self, x: f64, y: f64) -> bool {
        match &self.shape {
            ChunkShape::Rectangle => self.buffered_bbox().contains(x, y),
            ChunkShape::Circle(c) => {
                Circle::new(c.center.x, c.center.y, c.radius + self.buffer).contains(x, y)
            }
            ChunkShape::Polygon(p) => {
                p.contains(x, y) || self.buffered_bbox().contains(x, y)
            }
        }
    }

    /// The query shape of the chunk, for reader-side filtering.
    pub fn query_shape(&self) -> Shape {
        match &self.shape {
            ChunkShape::Rectangle => Shape::Rectangle(self.bbox()),
            ChunkShape::Circle(c) => Shape::Circle(*c),
            ChunkShape::Polygon(p) => Shape::Polygon(p.clone()),
        }
    }
}
