//! Ground classification by Progressive TIN Densification.
//!
//! A TIN is grown from low seed points. Each pass inserts the remaining
//! candidates that satisfy the Axelsson criteria against their containing
//! triangle (perpendicular distance and maximum subtended angle below the
//! thresholds); small triangles freeze so already dense regions stop
//! attracting points. A virtual ring of seeds beyond the bounding box keeps
//! real points near the edge inside a triangle. Inserted vertices that stick
//! out of a locally fitted plane are reported as spikes.

use point_cloud_core::{Grid, PointXYZ, Rectangle};
use point_cloud_delaunay::{Triangulation, GHOST_VERTICES};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rstar::primitives::GeomWithData;
use rstar::RTree;
use thiserror::Error;

/// Fraction of the vertex count below which a densification pass stops the
/// loop (0.05 %).
const STOP_RATIO: f64 = 0.5 / 1000.0;

/// Nearest neighbours used by the spike plane fit.
const SPIKE_NEIGHBORS: usize = 8;

/// Perpendicular residual, in meters, above which a vertex is a spike.
const SPIKE_THRESHOLD: f64 = 0.75;

#[derive(Debug, Error)]
pub enum GroundError {
    #[error("seed_resolution must be > 0")]
    SeedResolution,
    #[error("max_iteration_angle must be in [0, 90] degrees")]
    AngleRange,
    #[error("max_iteration_distance must be > 0")]
    DistanceRange,
    #[error("min_triangle_size must be >= 0")]
    TriangleSize,
    #[error("buffer_size must be >= 0")]
    BufferSize,
    #[error("0 point to process")]
    NoPoints,
    #[error("0 seed to process")]
    NoSeeds,
    #[error("internal error: virtual seed point not inserted")]
    VirtualSeed,
}

/// Tuning of the densification.
#[derive(Debug, Clone)]
pub struct PtdParameters {
    /// Grid spacing used to pick the initial ground seeds (m).
    pub seed_resolution: f64,
    /// Axelsson maximum angle (degrees, in [0, 90]).
    pub max_iteration_angle: f64,
    /// Axelsson maximum perpendicular distance (m, > 0).
    pub max_iteration_distance: f64,
    /// Edge length below which triangles freeze (m, >= 0).
    pub min_triangle_size: f64,
    /// Width of the virtual seed ring beyond the bbox (m, >= 0).
    pub buffer_size: f64,
    /// Maximum number of densification passes.
    pub max_iter: usize,
    /// Seed of the jitter RNG; fixed seed gives identical outputs.
    pub rng_seed: u64,
}

impl Default for PtdParameters {
    fn default() -> Self {
        Self {
            seed_resolution: 5.0,
            max_iteration_angle: 30.0,
            max_iteration_distance: 1.0,
            min_triangle_size: 0.5,
            buffer_size: 30.0,
            max_iter: 100,
            rng_seed: 0,
        }
    }
}

impl PtdParameters {
    fn validate(&self) -> Result<(), GroundError> {
        if self.seed_resolution <= 0.0 {
            return Err(GroundError::SeedResolution);
        }
        if !(0.0..=90.0).contains(&self.max_iteration_angle) {
            return Err(GroundError::AngleRange);
        }
        if self.max_iteration_distance <= 0.0 {
            return Err(GroundError::DistanceRange);
        }
        if self.min_triangle_size < 0.0 {
            return Err(GroundError::TriangleSize);
        }
        if self.buffer_size < 0.0 {
            return Err(GroundError::BufferSize);
        }
        Ok(())
    }
}

/// One input point: position plus its id in the source file.
#[derive(Debug, Clone, Copy)]
pub struct GroundPoint {
    pub pos: PointXYZ,
    pub fid: u32,
}

/// Result of a classification: ids of detected ground points and of spikes.
#[derive(Debug, Clone, Default)]
pub struct GroundResult {
    pub ground: Vec<u32>,
    pub spikes: Vec<u32>,
}

/// The classifier. One instance per chunk; `run` consumes the chunk points.
pub struct PtdClassifier {
    params: PtdParameters,
    min_size_sq: f64,
}

impl PtdClassifier {
    pub fn new(params: PtdParameters) -> Result<Self, GroundError> {
        params.validate()?;
        let min_size_sq = params.min_triangle_size * params.min_triangle_size;
        Ok(Self { params, min_size_sq })
    }

    /// Classify. Points may arrive in any order.
    pub fn run(&self, points: &[GroundPoint]) -> Result<GroundResult, GroundError> {
        if points.is_empty() {
            return Err(GroundError::NoPoints);
        }

        let bbox = bounds(points);

        // Candidate thinning: lowest point per min_triangle_size cell. This
        // shrinks the working set without losing possible ground points.
        let mut candidates = if self.params.min_triangle_size > 0.0 {
            lowest_per_cell(points, &bbox, self.params.min_triangle_size)
        } else {
            points.to_vec()
        };

        // Process bottom to top.
        candidates.sort_by(|a, b| {
            a.pos
                .z
                .partial_cmp(&b.pos.z)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.fid.cmp(&b.fid))
        });

        // Initial seeds: lowest candidate per seed_resolution cell.
        let seeds = lowest_per_cell(&candidates, &bbox, self.params.seed_resolution);
        if seeds.is_empty() {
            return Err(GroundError::NoSeeds);
        }

        let ring = self.make_virtual_ring(&seeds, &bbox);

        let bs = self.params.buffer_size;
        let tin_extent = bbox.buffered(bs);
        let mut tin = Triangulation::new(&tin_extent);
        tin.set_dirty_grid(Grid::new(
            tin_extent.xmin,
            tin_extent.ymin,
            tin_extent.xmax,
            tin_extent.ymax,
            1.0,
        ));

        // The first triangles are huge, so the hint-based walk would thrash;
        // bootstrap through the DAG, then switch to the fast walk.
        for p in &ring {
            if !tin.insert(*p, u32::MAX) {
                return Err(GroundError::VirtualSeed);
            }
        }

        let mut inserted = vec![false; candidates.len()];
        let fid_to_index: std::collections::HashMap<u32, usize> =
            candidates.iter().enumerate().map(|(i, c)| (c.fid, i)).collect();

        for seed in &seeds {
            if tin.insert(seed.pos, seed.fid) {
                if let Some(&i) = fid_to_index.get(&seed.fid) {
                    inserted[i] = true;
                }
            }
        }

        tin.set_fast_locate(true);
        self.densify(&mut tin, &candidates, &mut inserted);

        let spikes = detect_spikes(&tin, self.params.max_iter);

        // Collect outputs: every vertex after the ghosts and the ring came
        // from the point cloud.
        let offset = GHOST_VERTICES as usize + ring.len();
        let mut result = GroundResult::default();
        for (i, v) in tin.vertices().iter().enumerate().skip(offset) {
            if spikes[i] {
                result.spikes.push(v.source);
            } else {
                result.ground.push(v.source);
            }
        }
        Ok(result)
    }

    /// Ring points at `buffer_size` beyond the bbox, jittered, with z taken
    /// from the nearest real seed.
    fn make_virtual_ring(&self, seeds: &[GroundPoint], bbox: &Rectangle) -> Vec<PointXYZ> {
        if self.params.buffer_size <= 0.0 {
            return Vec::new();
        }

        let mut rng = StdRng::seed_from_u64(self.params.rng_seed);
        let mut jitter = move || -> f64 { rng.gen_range(-0.5..0.5) };

        let d = self.params.buffer_size - 1.0;
        let xmin = bbox.xmin - d;
        let ymin = bbox.ymin - d;
        let xmax = bbox.xmax + d;
        let ymax = bbox.ymax + d;

        let dx = xmax - xmin;
        let dy = ymax - ymin;
        let nx = ((dx / self.params.seed_resolution).round() as usize).max(1);
        let ny = ((dy / self.params.seed_resolution).round() as usize).max(1);
        let sx = dx / nx as f64;
        let sy = dy / ny as f64;

        let mut ring = Vec::with_capacity(2 * (nx + ny) + 4);

        // Bottom and top edges.
        for i in 0..=nx {
            let x = xmin + i as f64 * sx;
            ring.push(PointXYZ::new(x + jitter(), ymin + jitter(), 0.0));
            ring.push(PointXYZ::new(x + jitter(), ymax + jitter(), 0.0));
        }
        // Left and right edges, corners skipped.
        for j in 1..ny {
            let y = ymin + j as f64 * sy;
            ring.push(PointXYZ::new(xmin + jitter(), y + jitter(), 0.0));
            ring.push(PointXYZ::new(xmax + jitter(), y + jitter(), 0.0));
        }

        let index: RTree<GeomWithData<[f64; 2], usize>> = RTree::bulk_load(
            seeds
                .iter()
                .enumerate()
                .map(|(i, s)| GeomWithData::new([s.pos.x, s.pos.y], i))
                .collect(),
        );
        for p in &mut ring {
            if let Some(nearest) = index.nearest_neighbor(&[p.x, p.y]) {
                p.z = seeds[nearest.data].pos.z;
            }
        }
        ring
    }

    /// The densification loop.
    fn densify(&self, tin: &mut Triangulation, candidates: &[GroundPoint], inserted: &mut [bool]) {
        let mut iteration = 0;
        // The first pass visits every candidate; later passes only those in
        // regions the previous pass modified.
        let mut first_pass = true;

        loop {
            if iteration >= self.params.max_iter {
                break;
            }
            iteration += 1;

            // Snapshot the regions dirtied by the previous pass before
            // clearing the tracker for this one.
            let active: Vec<(f64, f64, bool)> = if first_pass {
                Vec::new()
            } else {
                candidates
                    .iter()
                    .map(|c| (c.pos.x, c.pos.y, tin.is_cell_dirty(c.pos.x, c.pos.y)))
                    .collect()
            };
            tin.reset_dirty_cells();

            let mut count = 0usize;
            for (i, candidate) in candidates.iter().enumerate() {
                if inserted[i] {
                    continue;
                }
                if !first_pass && !active[i].2 {
                    continue;
                }

                let p = candidate.pos;
                let Some(result) = tin.locate(&p) else { continue };
                let t = match result {
                    point_cloud_delaunay::LocateResult::Inside(t) => t,
                    point_cloud_delaunay::LocateResult::Duplicate(_) => {
                        inserted[i] = true;
                        continue;
                    }
                };

                let triangle = tin.triangle(t);

                // Frozen region: the triangle is already small enough.
                if triangle.square_max_edge_size() < self.min_size_sq {
                    inserted[i] = true;
                    continue;
                }

                let Some((dist, angle)) = axelsson_metrics(&p, &triangle) else {
                    continue;
                };

                if angle < self.params.max_iteration_angle
                    && dist < self.params.max_iteration_distance
                    && tin.insert(p, candidate.fid)
                {
                    inserted[i] = true;
                    count += 1;
                }
            }

            first_pass = false;

            if count == 0 {
                break;
            }
            let ratio = count as f64 / tin.num_vertices() as f64;
            if ratio < STOP_RATIO {
                break;
            }
        }

        log::debug!(
            "densification finished after {iteration} pass(es), {} vertices",
            tin.num_vertices()
        );
    }
}

fn bounds(points: &[GroundPoint]) -> Rectangle {
    let mut bbox = Rectangle::empty();
    for p in points {
        bbox.grow(p.pos.x, p.pos.y);
    }
    bbox
}

/// Keep the lowest point of each grid cell.
fn lowest_per_cell(points: &[GroundPoint], bbox: &Rectangle, res: f64) -> Vec<GroundPoint> {
    let grid = Grid::new(bbox.xmin, bbox.ymin, bbox.xmax, bbox.ymax, res);
    let mut best: Vec<Option<GroundPoint>> = vec![None; grid.ncells];
    for p in points {
        let Some(cell) = grid.cell_from_xy(p.pos.x, p.pos.y) else { continue };
        match &best[cell] {
            Some(current) if current.pos.z <= p.pos.z => {}
            _ => best[cell] = Some(*p),
        }
    }
    best.into_iter().flatten().collect()
}

/// Axelsson criteria of a point against its containing triangle: the
/// perpendicular distance to the plane and the maximum of the angles the
/// distance subtends at the three vertices. `None` when the projection of
/// the point falls outside the triangle.
fn axelsson_metrics(p: &PointXYZ, triangle: &point_cloud_core::TriangleXYZ) -> Option<(f64, f64)> {
    let n = triangle.normal();
    let a = triangle.a;

    let vx = p.x - a.x;
    let vy = p.y - a.y;
    let vz = p.z - a.z;
    let dot = vx * n.x + vy * n.y + vz * n.z;
    let dist = dot.abs();

    let proj = PointXYZ::new(p.x - n.x * dot, p.y - n.y * dot, p.z - n.z * dot);
    if !triangle.contains(proj.x, proj.y) {
        return None;
    }

    let h0 = proj.distance_3d(&triangle.a);
    let h1 = proj.distance_3d(&triangle.b);
    let h2 = proj.distance_3d(&triangle.c);

    let alpha = dist.atan2(h0).to_degrees();
    let beta = dist.atan2(h1).to_degrees();
    let gamma = dist.atan2(h2).to_degrees();

    Some((dist, alpha.max(beta).max(gamma)))
}

/// Flag inserted vertices whose perpendicular residual against the plane
/// fitted through their 8 nearest neighbours exceeds the threshold.
fn detect_spikes(tin: &Triangulation, max_iter: usize) -> Vec<bool> {
    let n = tin.num_vertices();
    let mut spikes = vec![false; n];
    if max_iter == 0 {
        return spikes;
    }

    let index: RTree<GeomWithData<[f64; 2], usize>> = RTree::bulk_load(
        tin.vertices()
            .iter()
            .enumerate()
            .map(|(i, v)| GeomWithData::new([v.pos.x, v.pos.y], i))
            .collect(),
    );

    for i in 0..n {
        let query = tin.vertices()[i].pos;
        let neighbors: Vec<usize> = index
            .nearest_neighbor_iter(&[query.x, query.y])
            .filter(|e| e.data != i)
            .take(SPIKE_NEIGHBORS)
            .map(|e| e.data)
            .collect();
        if neighbors.len() < 3 {
            continue;
        }

        let positions: Vec<PointXYZ> =
            neighbors.iter().map(|&j| tin.vertices()[j].pos).collect();
        let residual = distance_to_fitted_plane(&query, &positions);
        if residual.abs() > SPIKE_THRESHOLD {
            spikes[i] = true;
        }
    }
    spikes
}

/// Perpendicular residual of `query` against the least-squares plane
/// `z = a·x + b·y + c` through `neighbors`, fitted in centered coordinates.
fn distance_to_fitted_plane(query: &PointXYZ, neighbors: &[PointXYZ]) -> f64 {
    if neighbors.len() < 3 {
        return 0.0;
    }

    let k = neighbors.len() as f64;
    let (mut cx, mut cy, mut cz) = (0.0, 0.0, 0.0);
    for p in neighbors {
        cx += p.x;
        cy += p.y;
        cz += p.z;
    }
    cx /= k;
    cy /= k;
    cz /= k;

    let (mut sxx, mut sxy, mut syy, mut sxz, mut syz) = (0.0, 0.0, 0.0, 0.0, 0.0);
    for p in neighbors {
        let dx = p.x - cx;
        let dy = p.y - cy;
        let dz = p.z - cz;
        sxx += dx * dx;
        sxy += dx * dy;
        syy += dy * dy;
        sxz += dx * dz;
        syz += dy * dz;
    }

    let det = sxx * syy - sxy * sxy;
    if det.abs() < 1e-9 {
        return 0.0;
    }

    let a = (syy * sxz - sxy * syz) / det;
    let b = (sxx * syz - sxy * sxz) / det;

    let predicted = a * (query.x - cx) + b * (query.y - cy) + cz;
    let vertical_residual = query.z - predicted;
    vertical_residual / (a * a + b * b + 1.0).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Flat ground at z = 0 with a grid of points, plus outliers 5 m up.
    fn synthetic_scene() -> Vec<GroundPoint> {
        let mut points = Vec::new();
        let mut fid = 0;
        for i in 0..40 {
            for j in 0..40 {
                let x = i as f64 * 2.5;
                let y = j as f64 * 2.5;
                // Gentle terrain undulation.
                let z = (x / 30.0).sin() * 0.3 + (y / 25.0).cos() * 0.3;
                points.push(GroundPoint { pos: PointXYZ::new(x, y, z), fid });
                fid += 1;
            }
        }
        // Outliers well above the surface.
        for k in 0..30 {
            let x = 5.0 + (k as f64 * 3.1) % 90.0;
            let y = 5.0 + (k as f64 * 7.3) % 90.0;
            points.push(GroundPoint { pos: PointXYZ::new(x, y, 5.0), fid });
            fid += 1;
        }
        points
    }

    #[test]
    fn parameters_are_validated() {
        let bad = PtdParameters { max_iteration_angle: 120.0, ..Default::default() };
        assert!(matches!(PtdClassifier::new(bad), Err(GroundError::AngleRange)));
        let bad = PtdParameters { max_iteration_distance: 0.0, ..Default::default() };
        assert!(matches!(PtdClassifier::new(bad), Err(GroundError::DistanceRange)));
        let bad = PtdParameters { seed_resolution: 0.0, ..Default::default() };
        assert!(matches!(PtdClassifier::new(bad), Err(GroundError::SeedResolution)));
    }

    #[test]
    fn flat_terrain_is_ground_and_outliers_are_not() {
        let points = synthetic_scene();
        let n_ground_truth = 1600;

        let classifier = PtdClassifier::new(PtdParameters {
            seed_resolution: 10.0,
            max_iteration_distance: 1.0,
            max_iteration_angle: 30.0,
            min_triangle_size: 0.5,
            buffer_size: 10.0,
            ..Default::default()
        })
        .unwrap();
        let result = classifier.run(&points).unwrap();

        // Most of the true ground is recovered.
        let ground_hits = result.ground.iter().filter(|&&fid| fid < n_ground_truth).count();
        assert!(
            ground_hits as f64 > 0.9 * n_ground_truth as f64,
            "only {ground_hits} of {n_ground_truth} ground points classified"
        );

        // No outlier sneaks into the ground set.
        let outlier_hits = result.ground.iter().filter(|&&fid| fid >= n_ground_truth).count();
        assert_eq!(outlier_hits, 0, "outliers classified as ground");
    }

    #[test]
    fn same_seed_gives_identical_results() {
        let points = synthetic_scene();
        let params = PtdParameters { rng_seed: 1234, ..Default::default() };

        let a = PtdClassifier::new(params.clone()).unwrap().run(&points).unwrap();
        let b = PtdClassifier::new(params).unwrap().run(&points).unwrap();
        assert_eq!(a.ground, b.ground);
        assert_eq!(a.spikes, b.spikes);
    }

    #[test]
    fn axelsson_rejects_projection_outside() {
        let t = point_cloud_core::TriangleXYZ::new(
            PointXYZ::new(0.0, 0.0, 0.0),
            PointXYZ::new(10.0, 0.0, 0.0),
            PointXYZ::new(0.0, 10.0, 0.0),
        );
        assert!(axelsson_metrics(&PointXYZ::new(20.0, 20.0, 1.0), &t).is_none());

        let (d, angle) = axelsson_metrics(&PointXYZ::new(2.0, 2.0, 1.0), &t).unwrap();
        assert!((d - 1.0).abs() < 1e-12);
        assert!(angle > 0.0 && angle < 90.0);
    }

    #[test]
    fn plane_fit_residual() {
        // Neighbours on the plane z = x.
        let neighbors: Vec<PointXYZ> = (0..8)
            .map(|i| {
                let x = (i % 4) as f64;
                let y = (i / 4) as f64 * 2.0;
                PointXYZ::new(x, y, x)
            })
            .collect();
        let on_plane = PointXYZ::new(1.5, 1.0, 1.5);
        assert!(distance_to_fitted_plane(&on_plane, &neighbors).abs() < 1e-9);

        let above = PointXYZ::new(1.5, 1.0, 3.5);
        let r = distance_to_fitted_plane(&above, &neighbors);
        assert!((r - 2.0 / 2f64.sqrt()).abs() < 1e-9);
    }
}
