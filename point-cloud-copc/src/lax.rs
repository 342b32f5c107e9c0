//! Spatial-index sidecar (`.lax`).
//!
//! A quadtree over the file extent whose leaves carry sorted runs of point
//! ids. The top-level tile side is picked from {10, 100, 1000, 10000,
//! 100000} meters by the file span; leaves subdivide down to roughly 50 m.
//! The container starts with the `LASX` magic. Readers only need the
//! interval runs to pre-filter point ids for a spatial query.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::Result;

const MAGIC: u32 = u32::from_le_bytes(*b"LASX");
const VERSION: u32 = 0;
const TILE_SIDES: [f64; 5] = [10.0, 100.0, 1000.0, 10_000.0, 100_000.0];
const TARGET_LEAF: f64 = 50.0;

/// A quadtree of point-id intervals.
#[derive(Debug, Clone, PartialEq)]
pub struct LaxIndex {
    pub xmin: f64,
    pub ymin: f64,
    pub side: f64,
    pub levels: u32,
    /// Leaf cell -> sorted, disjoint id intervals (inclusive).
    cells: BTreeMap<u32, Vec<(u32, u32)>>,
}

impl LaxIndex {
    /// Choose the tile side from the span and the depth so leaves end up
    /// around 50 m.
    pub fn new(xmin: f64, ymin: f64, xmax: f64, ymax: f64) -> Self {
        let span = (xmax - xmin).max(ymax - ymin).max(1.0);
        let side = TILE_SIDES
            .iter()
            .copied()
            .find(|&s| s >= span)
            .unwrap_or(100_000.0);

        let mut levels = 0u32;
        while side / (1u64 << levels) as f64 > TARGET_LEAF && levels < 8 {
            levels += 1;
        }

        Self { xmin, ymin, side, levels, cells: BTreeMap::new() }
    }

    fn ncells_per_axis(&self) -> u32 {
        1 << self.levels
    }

    /// Leaf cell of a coordinate, clamped into the tile.
    pub fn cell_of(&self, x: f64, y: f64) -> u32 {
        let n = self.ncells_per_axis();
        let res = self.side / n as f64;
        let cx = (((x - self.xmin) / res).floor() as i64).clamp(0, n as i64 - 1) as u32;
        let cy = (((y - self.ymin) / res).floor() as i64).clamp(0, n as i64 - 1) as u32;
        cy * n + cx
    }

    /// Register points in file order; consecutive ids landing in the same
    /// cell extend the current run.
    pub fn build<I: IntoIterator<Item = (f64, f64)>>(&mut self, points: I) {
        for (id, (x, y)) in points.into_iter().enumerate() {
            let id = id as u32;
            let cell = self.cell_of(x, y);
            let runs = self.cells.entry(cell).or_default();
            match runs.last_mut() {
                Some(last) if last.1 + 1 == id => last.1 = id,
                _ => runs.push((id, id)),
            }
        }
    }

    /// Merged, sorted id intervals of every leaf intersecting the bbox.
    pub fn intervals(&self, xmin: f64, ymin: f64, xmax: f64, ymax: f64) -> Vec<(u32, u32)> {
        let n = self.ncells_per_axis();
        let res = self.side / n as f64;
        let cx0 = (((xmin - self.xmin) / res).floor() as i64).clamp(0, n as i64 - 1) as u32;
        let cx1 = (((xmax - self.xmin) / res).floor() as i64).clamp(0, n as i64 - 1) as u32;
        let cy0 = (((ymin - self.ymin) / res).floor() as i64).clamp(0, n as i64 - 1) as u32;
        let cy1 = (((ymax - self.ymin) / res).floor() as i64).clamp(0, n as i64 - 1) as u32;

        let mut out = Vec::new();
        for cy in cy0..=cy1 {
            for cx in cx0..=cx1 {
                if let Some(runs) = self.cells.get(&(cy * n + cx)) {
                    out.extend_from_slice(runs);
                }
            }
        }
        out.sort_unstable();

        // Merge overlapping or adjacent runs.
        let mut merged: Vec<(u32, u32)> = Vec::with_capacity(out.len());
        for run in out {
            match merged.last_mut() {
                Some(last) if run.0 <= last.1.saturating_add(1) => {
                    last.1 = last.1.max(run.1)
                }
                _ => merged.push(run),
            }
        }
        merged
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        out.write_all(&MAGIC.to_le_bytes())?;
        out.write_all(&VERSION.to_le_bytes())?;
        out.write_all(&self.xmin.to_le_bytes())?;
        out.write_all(&self.ymin.to_le_bytes())?;
        out.write_all(&self.side.to_le_bytes())?;
        out.write_all(&self.levels.to_le_bytes())?;
        out.write_all(&(self.cells.len() as u32).to_le_bytes())?;
        for (cell, runs) in &self.cells {
            out.write_all(&cell.to_le_bytes())?;
            out.write_all(&(runs.len() as u32).to_le_bytes())?;
            for (start, end) in runs {
                out.write_all(&start.to_le_bytes())?;
                out.write_all(&end.to_le_bytes())?;
            }
        }
        out.flush()?;
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self> {
        let mut input = BufReader::new(File::open(path)?);

        let magic = read_u32(&mut input)?;
        let version = read_u32(&mut input)?;
        if magic != MAGIC || version != VERSION {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "not a lax spatial index",
            )
            .into());
        }

        let xmin = read_f64(&mut input)?;
        let ymin = read_f64(&mut input)?;
        let side = read_f64(&mut input)?;
        let levels = read_u32(&mut input)?;
        let ncells = read_u32(&mut input)?;

        let mut cells = BTreeMap::new();
        for _ in 0..ncells {
            let cell = read_u32(&mut input)?;
            let nruns = read_u32(&mut input)?;
            let mut runs = Vec::with_capacity(nruns as usize);
            for _ in 0..nruns {
                runs.push((read_u32(&mut input)?, read_u32(&mut input)?));
            }
            cells.insert(cell, runs);
        }

        Ok(Self { xmin, ymin, side, levels, cells })
    }
}

/// Write the sidecar of a LAS/LAZ file from its point coordinates.
pub fn write_lax<I: IntoIterator<Item = (f64, f64)>>(
    las_path: &Path,
    bbox: (f64, f64, f64, f64),
    points: I,
) -> Result<()> {
    let mut index = LaxIndex::new(bbox.0, bbox.1, bbox.2, bbox.3);
    index.build(points);
    index.write(&las_path.with_extension("lax"))
}

fn read_u32<R: Read>(r: &mut R) -> std::io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_f64<R: Read>(r: &mut R) -> std::io::Result<f64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(f64::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tile_side_follows_span() {
        assert_eq!(LaxIndex::new(0.0, 0.0, 5.0, 5.0).side, 10.0);
        assert_eq!(LaxIndex::new(0.0, 0.0, 900.0, 400.0).side, 1000.0);
        assert_eq!(LaxIndex::new(0.0, 0.0, 2e6, 10.0).side, 100_000.0);
    }

    #[test]
    fn intervals_select_the_right_points() {
        let mut index = LaxIndex::new(0.0, 0.0, 1000.0, 1000.0);
        // 100 points on a diagonal: id i at (i*10, i*10).
        index.build((0..100).map(|i| (i as f64 * 10.0, i as f64 * 10.0)));

        let intervals = index.intervals(0.0, 0.0, 99.0, 99.0);
        assert!(!intervals.is_empty());
        let covered: Vec<u32> = intervals.iter().flat_map(|&(a, b)| a..=b).collect();
        // Everything in the lower-left corner is covered.
        for i in 0..10u32 {
            assert!(covered.contains(&i));
        }
        // The far end of the diagonal is not.
        assert!(!covered.contains(&99));
    }

    #[test]
    fn round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tile.lax");
        let mut index = LaxIndex::new(0.0, 0.0, 500.0, 500.0);
        index.build((0..1000).map(|i| ((i % 50) as f64 * 10.0, (i / 50) as f64 * 25.0)));
        index.write(&path).unwrap();

        let read = LaxIndex::read(&path).unwrap();
        assert_eq!(read, index);
    }

    #[test]
    fn sidecar_lands_next_to_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let las = dir.path().join("tile.laz");
        write_lax(&las, (0.0, 0.0, 100.0, 100.0), vec![(5.0, 5.0), (6.0, 6.0)]).unwrap();
        assert!(dir.path().join("tile.lax").exists());
    }
}
