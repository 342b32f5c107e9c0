//! Raster sink: a grid plus flat multi-band storage.
//!
//! The in-memory layout is one f32 slab per band. On disk we write ESRI
//! ASCII grids, one file per band; richer drivers (GeoTIFF through GDAL)
//! are external collaborators that implement [`RasterSink`].

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::grid::Grid;
use crate::shapes::Rectangle;

pub const NODATA: f32 = -99999.0;

/// Contract every raster destination implements (spec'd collaborator
/// surface: GDAL-backed sinks plug in here).
pub trait RasterSink {
    /// Persist the raster; called once per chunk or once merged.
    fn write_raster(&mut self, raster: &Raster) -> Result<()>;
}

/// A multi-band float raster over a regular grid.
#[derive(Debug, Clone)]
pub struct Raster {
    pub grid: Grid,
    pub nbands: usize,
    /// Band-major storage: `data[band * ncells + cell]`.
    pub data: Vec<f32>,
    pub nodata: f32,
    /// Width, in cells, of the ring used by focal operators so buffered
    /// chunks overwrite each other consistently.
    pub buffer_cells: usize,
    pub path: Option<PathBuf>,
    pub band_names: Vec<String>,
}

impl Raster {
    pub fn new(grid: Grid, nbands: usize) -> Self {
        let ncells = grid.ncells;
        Self {
            grid,
            nbands,
            data: vec![NODATA; ncells * nbands],
            nodata: NODATA,
            buffer_cells: 0,
            path: None,
            band_names: Vec::new(),
        }
    }

    pub fn from_extent(bbox: &Rectangle, res: f64, nbands: usize) -> Self {
        Self::new(Grid::new(bbox.xmin, bbox.ymin, bbox.xmax, bbox.ymax, res), nbands)
    }

    pub fn set_path(&mut self, path: impl Into<PathBuf>) {
        self.path = Some(path.into());
    }

    #[inline]
    pub fn get(&self, band: usize, cell: usize) -> f32 {
        self.data[band * self.grid.ncells + cell]
    }

    #[inline]
    pub fn set(&mut self, band: usize, cell: usize, value: f32) {
        self.data[band * self.grid.ncells + cell] = value;
    }

    #[inline]
    pub fn is_nodata(&self, band: usize, cell: usize) -> bool {
        self.get(band, cell) == self.nodata
    }

    /// Value at a coordinate, `None` outside the grid or on NODATA.
    pub fn value_at(&self, band: usize, x: f64, y: f64) -> Option<f32> {
        let cell = self.grid.cell_from_xy(x, y)?;
        let v = self.get(band, cell);
        (v != self.nodata).then_some(v)
    }

    /// Fold a value into a cell keeping the maximum.
    pub fn set_max(&mut self, band: usize, cell: usize, value: f32) {
        let old = self.get(band, cell);
        if old == self.nodata || value > old {
            self.set(band, cell, value);
        }
    }

    /// Fold a value into a cell keeping the minimum.
    pub fn set_min(&mut self, band: usize, cell: usize, value: f32) {
        let old = self.get(band, cell);
        if old == self.nodata || value < old {
            self.set(band, cell, value);
        }
    }

    /// Overwrite our cells with the non-NODATA cells of `other`, which must
    /// be defined on the same resolution and alignment. Cells of `other`
    /// falling outside our extent are ignored. This is the chunk-merge
    /// primitive used by the engine.
    pub fn merge_from(&mut self, other: &Raster) {
        debug_assert_eq!(self.nbands, other.nbands);
        for cell in 0..other.grid.ncells {
            let (x, y) = other.grid.xy_from_cell(cell);
            let Some(own) = self.grid.cell_from_xy(x, y) else { continue };
            for band in 0..self.nbands {
                let v = other.get(band, cell);
                if v != other.nodata {
                    self.set(band, own, v);
                }
            }
        }
    }
}

impl RasterSink for Raster {
    /// Write every band as `<stem>.asc` / `<stem>_<band>.asc`.
    fn write_raster(&mut self, raster: &Raster) -> Result<()> {
        let Some(path) = &self.path else { return Ok(()) };
        for band in 0..raster.nbands {
            let band_path = band_path(path, band, raster.nbands, &raster.band_names);
            write_asc(raster, band, &band_path)?;
        }
        Ok(())
    }
}

fn band_path(path: &Path, band: usize, nbands: usize, names: &[String]) -> PathBuf {
    if nbands == 1 {
        return path.to_path_buf();
    }
    let stem = path.file_stem().unwrap_or_default().to_string_lossy();
    let ext = path.extension().map(|e| e.to_string_lossy().to_string()).unwrap_or_else(|| "asc".into());
    let suffix = names.get(band).cloned().unwrap_or_else(|| band.to_string());
    path.with_file_name(format!("{stem}_{suffix}.{ext}"))
}

fn write_asc(raster: &Raster, band: usize, path: &Path) -> Result<()> {
    let grid = &raster.grid;
    let mut out = BufWriter::new(File::create(path)?);
    writeln!(out, "ncols {}", grid.ncols)?;
    writeln!(out, "nrows {}", grid.nrows)?;
    writeln!(out, "xllcorner {}", grid.xmin)?;
    writeln!(out, "yllcorner {}", grid.ymin)?;
    writeln!(out, "cellsize {}", grid.xres)?;
    writeln!(out, "NODATA_value {}", raster.nodata)?;
    for row in 0..grid.nrows {
        for col in 0..grid.ncols {
            if col > 0 {
                write!(out, " ")?;
            }
            write!(out, "{}", raster.get(band, grid.cell_from_row_col(row, col)))?;
        }
        writeln!(out)?;
    }
    out.flush()?;
    Ok(())
}

/// Standalone writer used by stages that do not keep a sink around.
pub fn write_raster_file(raster: &Raster, path: &Path) -> Result<()> {
    for band in 0..raster.nbands {
        let band_file = band_path(path, band, raster.nbands, &raster.band_names);
        write_asc(raster, band, &band_file)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_max_folding() {
        let mut r = Raster::from_extent(&Rectangle::new(0.0, 0.0, 10.0, 10.0), 1.0, 1);
        let cell = r.grid.cell_from_xy(5.0, 5.0).unwrap();
        assert!(r.is_nodata(0, cell));
        r.set_max(0, cell, 3.0);
        r.set_max(0, cell, 1.0);
        assert_eq!(r.get(0, cell), 3.0);
        r.set_min(0, cell, 2.0);
        assert_eq!(r.get(0, cell), 2.0);
    }

    #[test]
    fn merge_overwrites_only_valid_cells() {
        let mut a = Raster::from_extent(&Rectangle::new(0.0, 0.0, 20.0, 10.0), 1.0, 1);
        let mut b = Raster::from_extent(&Rectangle::new(10.0, 0.0, 20.0, 10.0), 1.0, 1);
        let cell_b = b.grid.cell_from_xy(15.5, 5.5).unwrap();
        b.set(0, cell_b, 7.0);
        a.merge_from(&b);
        assert_eq!(a.value_at(0, 15.5, 5.5), Some(7.0));
        assert_eq!(a.value_at(0, 5.5, 5.5), None);
    }

    #[test]
    fn asc_round_trip_header() {
        let dir = tempfile::tempdir().unwrap();
        let mut r = Raster::from_extent(&Rectangle::new(0.0, 0.0, 2.0, 2.0), 1.0, 1);
        r.set(0, 0, 1.5);
        let path = dir.path().join("out.asc");
        write_raster_file(&r, &path).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("ncols 2"));
        assert!(content.contains("NODATA_value -99999"));
        assert!(content.contains("1.5"));
    }
}
