//! Regular grid arithmetic.
//!
//! The grid is aligned on multiples of the resolution so that two rasters
//! built over overlapping extents share cell boundaries and can be merged
//! cell-for-cell.

use crate::shapes::Rectangle;

/// Neighbourhood connectivity for adjacency queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Contiguity {
    Rook,
    Queen,
}

/// A regular raster definition.
#[derive(Debug, Clone, PartialEq)]
pub struct Grid {
    pub xmin: f64,
    pub ymin: f64,
    pub xmax: f64,
    pub ymax: f64,
    pub xres: f64,
    pub yres: f64,
    pub nrows: usize,
    pub ncols: usize,
    pub ncells: usize,
}

fn round_any(x: f64, accuracy: f64) -> f64 {
    (x / accuracy).round() * accuracy
}

impl Grid {
    /// Build a grid covering the extent, expanded outward so its origin is a
    /// multiple of the resolution.
    pub fn new(xmin: f64, ymin: f64, xmax: f64, ymax: f64, res: f64) -> Self {
        let axmin = round_any(xmin - 0.5 * res, res);
        let axmax = round_any(xmax - 0.5 * res, res) + res;
        let aymin = round_any(ymin - 0.5 * res, res);
        let aymax = round_any(ymax - 0.5 * res, res) + res;

        let ncols = ((axmax - axmin) / res).round() as usize;
        let nrows = ((aymax - aymin) / res).round() as usize;

        Self {
            xmin: axmin,
            ymin: aymin,
            xmax: axmax,
            ymax: aymax,
            xres: res,
            yres: res,
            nrows,
            ncols,
            ncells: nrows * ncols,
        }
    }

    /// Build a grid with an exact shape, no alignment.
    pub fn with_shape(xmin: f64, ymin: f64, xmax: f64, ymax: f64, nrows: usize, ncols: usize) -> Self {
        Self {
            xmin,
            ymin,
            xmax,
            ymax,
            xres: (xmax - xmin) / ncols as f64,
            yres: (ymax - ymin) / nrows as f64,
            nrows,
            ncols,
            ncells: nrows * ncols,
        }
    }

    pub fn bbox(&self) -> Rectangle {
        Rectangle::new(self.xmin, self.ymin, self.xmax, self.ymax)
    }

    /// Cell index for a coordinate, or `None` outside the extent. Points on
    /// the max edges belong to the last row/column.
    pub fn cell_from_xy(&self, x: f64, y: f64) -> Option<usize> {
        if x < self.xmin || x > self.xmax || y < self.ymin || y > self.ymax {
            return None;
        }
        let mut col = ((x - self.xmin) / self.xres).floor() as usize;
        let mut row = ((self.ymax - y) / self.yres).floor() as usize;
        if y == self.ymin {
            row = self.nrows - 1;
        }
        if x == self.xmax {
            col = self.ncols - 1;
        }
        Some(row * self.ncols + col)
    }

    pub fn row_from_cell(&self, cell: usize) -> usize {
        cell / self.ncols
    }

    pub fn col_from_cell(&self, cell: usize) -> usize {
        cell % self.ncols
    }

    pub fn cell_from_row_col(&self, row: usize, col: usize) -> usize {
        row * self.ncols + col
    }

    /// Cell center coordinates. Rows count from the top (ymax).
    pub fn xy_from_cell(&self, cell: usize) -> (f64, f64) {
        let row = self.row_from_cell(cell);
        let col = self.col_from_cell(cell);
        let x = self.xmin + col as f64 * self.xres + self.xres / 2.0;
        let y = self.ymax - row as f64 * self.yres - self.yres / 2.0;
        (x, y)
    }

    /// Every cell whose extent intersects the rectangle, clamped to the grid.
    pub fn cells_in(&self, bbox: &Rectangle) -> Vec<usize> {
        let colmin = ((bbox.xmin - self.xmin) / self.xres).floor() as i64;
        let colmax = ((bbox.xmax - self.xmin) / self.xres).ceil() as i64;
        let rowmin = ((self.ymax - bbox.ymax) / self.yres).floor() as i64;
        let rowmax = ((self.ymax - bbox.ymin) / self.yres).ceil() as i64;

        let mut cells = Vec::new();
        for col in colmin.max(0)..=colmax.min(self.ncols as i64 - 1) {
            for row in rowmin.max(0)..=rowmax.min(self.nrows as i64 - 1) {
                cells.push(row as usize * self.ncols + col as usize);
            }
        }
        cells
    }

    /// Neighbouring cells under rook or queen contiguity, clamped to the grid.
    pub fn adjacent_cells(&self, cell: usize, contiguity: Contiguity) -> Vec<usize> {
        let row = self.row_from_cell(cell) as i64;
        let col = self.col_from_cell(cell) as i64;
        let mut cells = Vec::with_capacity(8);

        for i in -1i64..=1 {
            for j in -1i64..=1 {
                if i == 0 && j == 0 {
                    continue;
                }
                if contiguity == Contiguity::Rook && i != 0 && j != 0 {
                    continue;
                }
                let r = row + i;
                let c = col + j;
                if r < 0 || r >= self.nrows as i64 || c < 0 || c >= self.ncols as i64 {
                    continue;
                }
                cells.push(r as usize * self.ncols + c as usize);
            }
        }
        cells
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_expands_to_resolution_multiples() {
        let g = Grid::new(0.4, 0.4, 99.2, 49.6, 10.0);
        assert_eq!(g.xmin, 0.0);
        assert_eq!(g.ymin, 0.0);
        assert_eq!(g.xmax, 100.0);
        assert_eq!(g.ymax, 50.0);
        assert_eq!(g.ncols, 10);
        assert_eq!(g.nrows, 5);
        assert_eq!(g.ncells, 50);
    }

    #[test]
    fn cell_round_trips_and_edge_clamping() {
        let g = Grid::new(0.0, 0.0, 100.0, 50.0, 10.0);
        // Top-left corner is cell 0.
        assert_eq!(g.cell_from_xy(0.5, 49.5), Some(0));
        // Max edges belong to the last row/column.
        assert_eq!(g.cell_from_xy(100.0, 0.0), Some(g.ncells - 1));
        assert_eq!(g.cell_from_xy(-0.1, 0.0), None);

        let cell = g.cell_from_xy(35.0, 25.0).unwrap();
        let (x, y) = g.xy_from_cell(cell);
        assert_eq!(g.cell_from_xy(x, y), Some(cell));
    }

    #[test]
    fn adjacency_rook_vs_queen() {
        let g = Grid::new(0.0, 0.0, 30.0, 30.0, 10.0);
        let center = g.cell_from_row_col(1, 1);
        assert_eq!(g.adjacent_cells(center, Contiguity::Rook).len(), 4);
        assert_eq!(g.adjacent_cells(center, Contiguity::Queen).len(), 8);
        // Corner cell has fewer neighbours.
        assert_eq!(g.adjacent_cells(0, Contiguity::Queen).len(), 3);
    }

    #[test]
    fn cells_in_bbox() {
        let g = Grid::new(0.0, 0.0, 100.0, 100.0, 10.0);
        let cells = g.cells_in(&Rectangle::new(5.0, 5.0, 25.0, 25.0));
        assert_eq!(cells.len(), 9);
    }
}
