//! A chunk materialised in memory for loaded-mode stages.
//!
//! Loaded stages need random access and spatial queries over the chunk's
//! points. The occupancy index is a spatial hash on a regular grid: each
//! cell lists the indices of the points it contains, and circle/rectangle
//! queries scan the cells covered by the query bbox.

use crate::grid::Grid;
use crate::header::Header;
use crate::point::Point;
use crate::shapes::{Rectangle, Shape};

const INDEX_RES: f64 = 2.0;

/// Spatial hash over point indices.
#[derive(Debug, Clone)]
pub struct GridPartition {
    grid: Grid,
    cells: Vec<Vec<u32>>,
}

impl GridPartition {
    pub fn build(bbox: &Rectangle, points: &[Point]) -> Self {
        let grid = Grid::new(bbox.xmin, bbox.ymin, bbox.xmax, bbox.ymax, INDEX_RES);
        let mut cells = vec![Vec::new(); grid.ncells];
        for (i, p) in points.iter().enumerate() {
            if let Some(cell) = grid.cell_from_xy(p.x, p.y) {
                cells[cell].push(i as u32);
            }
        }
        Self { grid, cells }
    }

    /// Indices of points whose cell intersects the query bbox. Callers must
    /// re-test exact containment.
    pub fn candidates(&self, bbox: &Rectangle) -> impl Iterator<Item = u32> + '_ {
        self.grid
            .cells_in(bbox)
            .into_iter()
            .flat_map(move |cell| self.cells[cell].iter().copied())
    }
}

/// The materialised point cloud of one chunk.
#[derive(Debug, Clone, Default)]
pub struct PointCloud {
    pub header: Header,
    pub points: Vec<Point>,
    index: Option<GridPartition>,
    deleted: Vec<bool>,
}

impl PointCloud {
    pub fn new(header: Header) -> Self {
        Self { header, points: Vec::new(), index: None, deleted: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn push(&mut self, point: Point) {
        self.points.push(point);
    }

    /// Build (or rebuild) the occupancy index over the current points.
    pub fn build_index(&mut self) {
        if self.points.is_empty() {
            self.index = None;
            return;
        }
        let mut bbox = Rectangle::empty();
        for p in &self.points {
            bbox.grow(p.x, p.y);
        }
        self.index = Some(GridPartition::build(&bbox, &self.points));
        self.deleted = vec![false; self.points.len()];
    }

    pub fn has_index(&self) -> bool {
        self.index.is_some()
    }

    /// Indices of live points inside the shape.
    pub fn query(&self, shape: &Shape) -> Vec<u32> {
        let bbox = shape.bbox();
        let mut out = Vec::new();
        match &self.index {
            Some(index) => {
                for i in index.candidates(&bbox) {
                    let p = &self.points[i as usize];
                    if !self.is_deleted(i as usize) && shape.contains(p.x, p.y) {
                        out.push(i);
                    }
                }
            }
            None => {
                for (i, p) in self.points.iter().enumerate() {
                    if !self.is_deleted(i) && shape.contains(p.x, p.y) {
                        out.push(i as u32);
                    }
                }
            }
        }
        out
    }

    /// Mark a point deleted without disturbing indices (sampling stages).
    pub fn delete(&mut self, i: usize) {
        if self.deleted.len() != self.points.len() {
            self.deleted = vec![false; self.points.len()];
        }
        self.deleted[i] = true;
    }

    pub fn is_deleted(&self, i: usize) -> bool {
        self.deleted.get(i).copied().unwrap_or(false)
    }

    /// Iterate over live points.
    pub fn iter_live(&self) -> impl Iterator<Item = (usize, &Point)> {
        self.points
            .iter()
            .enumerate()
            .filter(move |(i, _)| !self.is_deleted(*i))
    }

    /// Drop deleted points for good, renumbering indices.
    pub fn compact(&mut self) {
        if self.deleted.iter().any(|&d| d) {
            let deleted = std::mem::take(&mut self.deleted);
            let mut keep = deleted.iter().map(|d| !d);
            self.points.retain(|_| keep.next().unwrap_or(true));
            self.index = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shapes::Circle;

    fn cloud(n: usize) -> PointCloud {
        let mut pc = PointCloud::new(Header::default());
        for i in 0..n {
            pc.push(Point {
                x: (i % 10) as f64,
                y: (i / 10) as f64,
                z: i as f64,
                ..Default::default()
            });
        }
        pc.build_index();
        pc
    }

    #[test]
    fn circle_query_matches_linear_scan() {
        let pc = cloud(100);
        let shape = Shape::Circle(Circle::new(4.5, 4.5, 3.0));
        let mut indexed = pc.query(&shape);
        indexed.sort_unstable();

        let mut scanned: Vec<u32> = pc
            .points
            .iter()
            .enumerate()
            .filter(|(_, p)| shape.contains(p.x, p.y))
            .map(|(i, _)| i as u32)
            .collect();
        scanned.sort_unstable();
        assert_eq!(indexed, scanned);
        assert!(!indexed.is_empty());
    }

    #[test]
    fn delete_and_compact() {
        let mut pc = cloud(10);
        pc.delete(3);
        pc.delete(7);
        assert_eq!(pc.iter_live().count(), 8);
        pc.compact();
        assert_eq!(pc.len(), 8);
        assert!(pc.points.iter().all(|p| p.z != 3.0 && p.z != 7.0));
    }
}
