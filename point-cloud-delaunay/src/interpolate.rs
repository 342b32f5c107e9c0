//! Output queries over the triangulation: live triangles, boundary contour
//! and rasterisation of the linear interpolant.

use std::collections::HashMap;

use point_cloud_core::{Edge, PointXYZ, Raster, TriangleXYZ};
use rayon::prelude::*;

use crate::triangulation::{LocateResult, Triangulation};

impl Triangulation {
    /// Ids of live triangles whose three vertices are real (non-ghost).
    pub fn live_triangle_ids(&self) -> Vec<u32> {
        (0..self.num_triangles() as u32)
            .filter(|&t| self.is_live(t) && !self.is_ghost_triangle(t))
            .collect()
    }

    /// Geometry of one triangle.
    pub fn triangle(&self, t: u32) -> TriangleXYZ {
        let [a, b, c] = self.triangle_vertices(t);
        TriangleXYZ::new(*self.vertex(a), *self.vertex(b), *self.vertex(c))
    }

    /// Every live, fully real triangle.
    pub fn triangles(&self) -> impl Iterator<Item = TriangleXYZ> + '_ {
        self.live_triangle_ids().into_iter().map(move |t| self.triangle(t))
    }

    /// Boundary of the real mesh: edges appearing in exactly one live
    /// non-ghost triangle after orientation normalisation.
    pub fn contour(&self) -> Vec<Edge> {
        let mut counts: HashMap<Edge, usize> = HashMap::new();
        for t in self.live_triangle_ids() {
            let tri = self.triangle(t);
            for (p, q) in [(tri.a, tri.b), (tri.b, tri.c), (tri.c, tri.a)] {
                *counts.entry(Edge::new(p.xy(), q.xy())).or_insert(0) += 1;
            }
        }
        counts
            .into_iter()
            .filter_map(|(edge, count)| (count == 1).then_some(edge))
            .collect()
    }

    /// Interpolated z of the mesh at (x, y), or `None` outside the real mesh
    /// or inside a trimmed triangle. `trim_sq` is a squared edge length;
    /// zero or negative disables trimming.
    pub fn interpolate_xy(&self, x: f64, y: f64, trim_sq: f64) -> Option<f64> {
        let mut p = PointXYZ::new(x, y, 0.0);
        let t = match self.locate_dag(&p)? {
            LocateResult::Inside(t) => t,
            LocateResult::Duplicate(v) => return Some(self.vertex(v).z),
        };
        if self.is_ghost_triangle(t) {
            return None;
        }
        let tri = self.triangle(t);
        if trim_sq > 0.0 && tri.square_max_edge_size() > trim_sq {
            return None;
        }
        tri.linear_interpolation(&mut p);
        Some(p.z)
    }

    /// Rasterise the linear interpolant into a raster band. Cells covered by
    /// several triangles (along shared edges) receive the same plane value,
    /// so the write order does not matter.
    pub fn interpolate_raster(&self, raster: &mut Raster, band: usize, trim_sq: f64) {
        let grid = raster.grid.clone();
        let ids = self.live_triangle_ids();

        let cells: Vec<(usize, f32)> = ids
            .par_iter()
            .flat_map_iter(|&t| {
                let tri = self.triangle(t);
                let mut out = Vec::new();
                if trim_sq > 0.0 && tri.square_max_edge_size() > trim_sq {
                    return out.into_iter();
                }
                for cell in grid.cells_in(&tri.bbox()) {
                    let (x, y) = grid.xy_from_cell(cell);
                    if tri.contains(x, y) {
                        let mut p = PointXYZ::new(x, y, 0.0);
                        tri.linear_interpolation(&mut p);
                        out.push((cell, p.z as f32));
                    }
                }
                out.into_iter()
            })
            .collect();

        for (cell, z) in cells {
            raster.set(band, cell, z);
        }
    }

    /// Interpolate the mesh at each point's (x, y), writing into `z`. Points
    /// outside the mesh or inside trimmed triangles are left untouched and
    /// reported as `false`.
    pub fn interpolate_points(&self, points: &mut [PointXYZ], trim_sq: f64) -> Vec<bool> {
        let results: Vec<Option<f64>> = points
            .par_iter()
            .map(|p| self.interpolate_xy(p.x, p.y, trim_sq))
            .collect();

        let mut hit = vec![false; points.len()];
        for (i, z) in results.into_iter().enumerate() {
            if let Some(z) = z {
                points[i].z = z;
                hit[i] = true;
            }
        }
        hit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use point_cloud_core::Rectangle;

    /// A 100 m square of points on the plane z = x / 10.
    fn sloped_tin() -> Triangulation {
        let mut tin = Triangulation::new(&Rectangle::new(0.0, 0.0, 100.0, 100.0));
        for i in 0..=10 {
            for j in 0..=10 {
                let x = i as f64 * 10.0;
                let y = j as f64 * 10.0;
                tin.insert(PointXYZ::new(x, y, x / 10.0), (i * 11 + j) as u32);
            }
        }
        tin
    }

    #[test]
    fn interpolation_reproduces_the_plane() {
        let tin = sloped_tin();
        for (x, y) in [(5.0, 5.0), (42.0, 61.0), (99.0, 1.0)] {
            let z = tin.interpolate_xy(x, y, 0.0).expect("inside the mesh");
            assert!((z - x / 10.0).abs() < 1e-9, "at ({x}, {y}): {z}");
        }
        // Outside the real mesh there is no value.
        assert!(tin.interpolate_xy(-5.0, -5.0, 0.0).is_none());
    }

    #[test]
    fn raster_interpolation_matches_pointwise() {
        let tin = sloped_tin();
        let mut raster = Raster::from_extent(&Rectangle::new(0.0, 0.0, 100.0, 100.0), 5.0, 1);
        tin.interpolate_raster(&mut raster, 0, 0.0);

        let cell = raster.grid.cell_from_xy(32.5, 47.5).unwrap();
        let (x, _) = raster.grid.xy_from_cell(cell);
        let v = raster.get(0, cell);
        assert!((v as f64 - x / 10.0).abs() < 1e-6);
    }

    #[test]
    fn trim_threshold_drops_large_triangles() {
        let mut tin = Triangulation::new(&Rectangle::new(0.0, 0.0, 100.0, 100.0));
        tin.insert(PointXYZ::new(0.0, 0.0, 0.0), 0);
        tin.insert(PointXYZ::new(100.0, 0.0, 0.0), 1);
        tin.insert(PointXYZ::new(0.0, 100.0, 0.0), 2);
        // Edges are ~100 m: a 50 m trim rejects everything.
        assert!(tin.interpolate_xy(10.0, 10.0, 50.0 * 50.0).is_none());
        assert!(tin.interpolate_xy(10.0, 10.0, 0.0).is_some());
    }

    #[test]
    fn contour_of_a_square_has_boundary_edges_only() {
        let mut tin = Triangulation::new(&Rectangle::new(0.0, 0.0, 10.0, 10.0));
        tin.insert(PointXYZ::new(0.0, 0.0, 0.0), 0);
        tin.insert(PointXYZ::new(10.0, 0.0, 0.0), 1);
        tin.insert(PointXYZ::new(10.0, 10.0, 0.0), 2);
        tin.insert(PointXYZ::new(0.0, 10.0, 0.0), 3);
        tin.insert(PointXYZ::new(5.0, 5.0, 0.0), 4);

        let contour = tin.contour();
        assert_eq!(contour.len(), 4);
        // None of the contour edges touches the interior vertex.
        for edge in &contour {
            assert!(!(edge.a.x == 5.0 && edge.a.y == 5.0));
            assert!(!(edge.b.x == 5.0 && edge.b.y == 5.0));
        }
    }
}
