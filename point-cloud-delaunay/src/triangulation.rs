//! The triangulation arena, insertion and legalisation.

use point_cloud_core::{Grid, PointXYZ, Rectangle};
use robust::{incircle, orient2d, Coord};

use crate::dag::LocationDag;

/// Marker for "no neighbour" (a hull edge of the ghost square).
pub const NO_NEIGHBOR: i32 = -1;

/// The four bounding-square vertices occupy indices `0..4` and must never
/// appear in outputs.
pub const GHOST_VERTICES: u32 = 4;

/// Tolerance of the point-on-edge and duplicate-vertex tests.
pub const IN_TRIANGLE_EPS: f64 = 2e-8;

/// A vertex: position, the id it carries from its source file, and a guard
/// triangle known to be incident.
#[derive(Debug, Clone)]
pub struct Vertex {
    pub pos: PointXYZ,
    pub source: u32,
    guard: u32,
}

/// A triangle: three vertex indices and three neighbour indices, where
/// `n[k]` is the triangle opposite vertex `v[k]` and `-1` marks a hull edge.
#[derive(Debug, Clone)]
struct Triangle {
    v: [u32; 3],
    n: [i32; 3],
    dead: bool,
}

impl Triangle {
    fn new(v: [u32; 3], n: [i32; 3]) -> Self {
        Self { v, n, dead: false }
    }

    fn index_of_vertex(&self, vertex: u32) -> Option<usize> {
        self.v.iter().position(|&x| x == vertex)
    }

    fn index_of_neighbor(&self, tri: u32) -> Option<usize> {
        self.n.iter().position(|&x| x == tri as i32)
    }
}

/// Outcome of a point location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocateResult {
    /// The live triangle containing the query.
    Inside(u32),
    /// The query coincides with an existing vertex.
    Duplicate(u32),
}

/// Incremental Delaunay triangulation with ghost bounding square and
/// DAG-based point location.
pub struct Triangulation {
    vertices: Vec<Vertex>,
    triangles: Vec<Triangle>,
    dag: LocationDag,
    /// Hint used by the local walk.
    last_triangle: u32,
    /// When set, locate from the hint instead of the DAG root.
    fast_locate: bool,
    /// Coarse grid tracking which regions changed since the last reset.
    dirty_grid: Option<(Grid, Vec<bool>)>,
}

impl Triangulation {
    /// Build the two ghost triangles over a square slightly larger than the
    /// given extent. All later inserted points must lie strictly inside it.
    pub fn new(bbox: &Rectangle) -> Self {
        let a = bbox.width().max(bbox.height()).max(1.0);
        let pad = a / 10.0;
        let x0 = bbox.xmin - pad;
        let y0 = bbox.ymin - pad;
        let side = a + 2.0 * pad;

        let vertices = vec![
            Vertex { pos: PointXYZ::new(x0, y0, 0.0), source: u32::MAX, guard: 0 },
            Vertex { pos: PointXYZ::new(x0 + side, y0, 0.0), source: u32::MAX, guard: 0 },
            Vertex { pos: PointXYZ::new(x0 + side, y0 + side, 0.0), source: u32::MAX, guard: 0 },
            Vertex { pos: PointXYZ::new(x0, y0 + side, 0.0), source: u32::MAX, guard: 1 },
        ];

        let triangles = vec![
            Triangle::new([0, 1, 2], [NO_NEIGHBOR, 1, NO_NEIGHBOR]),
            Triangle::new([0, 2, 3], [NO_NEIGHBOR, NO_NEIGHBOR, 0]),
        ];

        let mut dag = LocationDag::default();
        dag.push_node();
        dag.push_node();

        Self {
            vertices,
            triangles,
            dag,
            last_triangle: 0,
            fast_locate: false,
            dirty_grid: None,
        }
    }

    /// Enable or disable the hint-based local walk. Worth enabling once the
    /// mesh is dense and insertions are spatially coherent.
    pub fn set_fast_locate(&mut self, enabled: bool) {
        self.fast_locate = enabled;
    }

    /// Track modified regions on a coarse grid (used by the densification
    /// loop of the ground classifier).
    pub fn set_dirty_grid(&mut self, grid: Grid) {
        let ncells = grid.ncells;
        self.dirty_grid = Some((grid, vec![false; ncells]));
    }

    pub fn reset_dirty_cells(&mut self) {
        if let Some((_, dirty)) = &mut self.dirty_grid {
            dirty.iter_mut().for_each(|d| *d = false);
        }
    }

    pub fn is_cell_dirty(&self, x: f64, y: f64) -> bool {
        match &self.dirty_grid {
            Some((grid, dirty)) => grid
                .cell_from_xy(x, y)
                .map(|c| dirty[c])
                .unwrap_or(true),
            None => true,
        }
    }

    fn mark_dirty(&mut self, tri: usize) {
        let Some((grid, dirty)) = &mut self.dirty_grid else { return };
        let t = &self.triangles[tri];
        let mut bbox = Rectangle::empty();
        for &v in &t.v {
            let p = &self.vertices[v as usize].pos;
            bbox.grow(p.x, p.y);
        }
        for cell in grid.cells_in(&bbox) {
            dirty[cell] = true;
        }
    }

    // -----------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------

    pub fn num_vertices(&self) -> usize {
        self.vertices.len()
    }

    pub fn num_triangles(&self) -> usize {
        self.triangles.len()
    }

    pub fn vertices(&self) -> &[Vertex] {
        &self.vertices
    }

    pub fn vertex(&self, i: u32) -> &PointXYZ {
        &self.vertices[i as usize].pos
    }

    pub fn is_ghost_vertex(&self, i: u32) -> bool {
        i < GHOST_VERTICES
    }

    /// Whether the triangle touches a ghost vertex.
    pub fn is_ghost_triangle(&self, t: u32) -> bool {
        self.triangles[t as usize].v.iter().any(|&v| v < GHOST_VERTICES)
    }

    pub fn is_live(&self, t: u32) -> bool {
        !self.triangles[t as usize].dead
    }

    pub fn triangle_vertices(&self, t: u32) -> [u32; 3] {
        self.triangles[t as usize].v
    }

    pub fn triangle_neighbors(&self, t: u32) -> [i32; 3] {
        self.triangles[t as usize].n
    }

    fn corner(&self, t: usize, k: usize) -> Coord<f64> {
        let p = &self.vertices[self.triangles[t].v[k] as usize].pos;
        Coord { x: p.x, y: p.y }
    }

    // -----------------------------------------------------------------
    // Point location
    // -----------------------------------------------------------------

    fn contains_inclusive(&self, t: usize, p: Coord<f64>) -> bool {
        let a = self.corner(t, 0);
        let b = self.corner(t, 1);
        let c = self.corner(t, 2);
        orient2d(a, b, p) >= 0.0 && orient2d(b, c, p) >= 0.0 && orient2d(c, a, p) >= 0.0
    }

    fn duplicate_of(&self, t: usize, p: &PointXYZ) -> Option<u32> {
        for &v in &self.triangles[t].v {
            let q = &self.vertices[v as usize].pos;
            if (p.x - q.x).abs() < IN_TRIANGLE_EPS && (p.y - q.y).abs() < IN_TRIANGLE_EPS {
                return Some(v);
            }
        }
        None
    }

    /// Locate the live triangle containing `p` by walking the DAG from the
    /// ghost roots.
    pub fn locate_dag(&self, p: &PointXYZ) -> Option<LocateResult> {
        let q = Coord { x: p.x, y: p.y };

        let mut current: u32 = if self.contains_inclusive(0, q) {
            0
        } else if self.contains_inclusive(1, q) {
            1
        } else {
            return None; // outside the ghost square
        };

        loop {
            if !self.triangles[current as usize].dead {
                if let Some(v) = self.duplicate_of(current as usize, p) {
                    return Some(LocateResult::Duplicate(v));
                }
                return Some(LocateResult::Inside(current));
            }

            let mut next = None;
            for child in self.dag.children(current) {
                if self.contains_inclusive(child as usize, q) {
                    next = Some(child);
                    break;
                }
            }
            current = next?;
        }
    }

    /// Locate by walking live triangles from a hint. The walk leaves the
    /// current triangle through the edge whose supporting line separates the
    /// centroid from the query.
    pub fn locate_walk(&self, p: &PointXYZ, hint: u32) -> Option<LocateResult> {
        let q = Coord { x: p.x, y: p.y };
        let mut t = hint as usize;
        if self.triangles[t].dead {
            return self.locate_dag(p);
        }

        // Bounded walk; a cycle means numerical trouble, fall back to the DAG.
        for _ in 0..self.triangles.len() {
            if self.contains_inclusive(t, q) {
                if let Some(v) = self.duplicate_of(t, p) {
                    return Some(LocateResult::Duplicate(v));
                }
                return Some(LocateResult::Inside(t as u32));
            }

            let a = self.corner(t, 0);
            let b = self.corner(t, 1);
            let c = self.corner(t, 2);
            let centroid = Coord {
                x: (a.x + b.x + c.x) / 3.0,
                y: (a.y + b.y + c.y) / 3.0,
            };

            let mut moved = false;
            for k in 0..3 {
                let f = self.triangles[t].n[k];
                if f == NO_NEIGHBOR {
                    continue;
                }
                let e1 = self.corner(t, (k + 1) % 3);
                let e2 = self.corner(t, (k + 2) % 3);
                let crosses = orient2d(centroid, q, e1) * orient2d(centroid, q, e2) < 0.0
                    && orient2d(e1, e2, q) * orient2d(e1, e2, centroid) < 0.0;
                if crosses && !self.triangles[f as usize].dead {
                    t = f as usize;
                    moved = true;
                    break;
                }
            }
            if !moved {
                return self.locate_dag(p);
            }
        }
        self.locate_dag(p)
    }

    /// Locate with the configured strategy, using the last touched triangle
    /// as hint in fast mode.
    pub fn locate(&self, p: &PointXYZ) -> Option<LocateResult> {
        if self.fast_locate {
            self.locate_walk(p, self.last_triangle)
        } else {
            self.locate_dag(p)
        }
    }

    /// Exhaustive scan, for debugging only.
    pub fn locate_linear(&self, p: &PointXYZ) -> Option<u32> {
        let q = Coord { x: p.x, y: p.y };
        (0..self.triangles.len())
            .filter(|&t| !self.triangles[t].dead)
            .find(|&t| self.contains_inclusive(t, q))
            .map(|t| t as u32)
    }

    // -----------------------------------------------------------------
    // Insertion
    // -----------------------------------------------------------------

    /// Insert a point. Returns `false` when the point duplicates an existing
    /// vertex (expected and silently ignored by callers).
    pub fn insert(&mut self, p: PointXYZ, source: u32) -> bool {
        let Some(result) = self.locate(&p) else { return false };
        let t = match result {
            LocateResult::Duplicate(_) => return false,
            LocateResult::Inside(t) => t as usize,
        };

        // On-edge test against the three edges of the containing triangle.
        let mut on_edge = None;
        for k in 0..3 {
            let a = self.vertices[self.triangles[t].v[(k + 1) % 3] as usize].pos;
            let b = self.vertices[self.triangles[t].v[(k + 2) % 3] as usize].pos;
            if point_on_segment(&p, &a, &b) {
                on_edge = Some(k);
                break;
            }
        }

        let vid = self.vertices.len() as u32;
        self.vertices.push(Vertex { pos: p, source, guard: t as u32 });

        let created = match on_edge {
            None => self.split_interior(t, vid),
            Some(k) => {
                let neighbor = self.triangles[t].n[k];
                if neighbor == NO_NEIGHBOR {
                    self.split_hull_edge(t, k, vid)
                } else {
                    self.split_shared_edge(t, k, vid)
                }
            }
        };

        for tri in created {
            self.legalize(tri);
        }
        true
    }

    /// Append a triangle, its DAG node, and refresh its vertices' guards.
    fn push_triangle(&mut self, v: [u32; 3], n: [i32; 3]) -> u32 {
        let id = self.triangles.len() as u32;
        self.triangles.push(Triangle::new(v, n));
        self.dag.push_node();
        for vertex in v {
            self.vertices[vertex as usize].guard = id;
        }
        self.last_triangle = id;
        id
    }

    fn kill(&mut self, t: usize) {
        self.mark_dirty(t);
        self.triangles[t].dead = true;
    }

    /// Redirect `old`'s slot in the external neighbour `ext` to `new`.
    fn patch_neighbor(&mut self, ext: i32, old: u32, new: u32) {
        if ext == NO_NEIGHBOR {
            return;
        }
        let ext = ext as usize;
        if let Some(k) = self.triangles[ext].index_of_neighbor(old) {
            self.triangles[ext].n[k] = new as i32;
        }
    }

    /// `p` strictly inside `t`: replace it with three triangles fanning
    /// around `p`.
    fn split_interior(&mut self, t: usize, p: u32) -> Vec<u32> {
        let [a, b, c] = self.triangles[t].v;
        let [na, nb, nc] = self.triangles[t].n;

        let t1 = self.triangles.len() as u32; // (p, a, b)
        let t2 = t1 + 1; // (p, b, c)
        let t3 = t1 + 2; // (p, c, a)

        self.push_triangle([p, a, b], [nc, t2 as i32, t3 as i32]);
        self.push_triangle([p, b, c], [na, t3 as i32, t1 as i32]);
        self.push_triangle([p, c, a], [nb, t1 as i32, t2 as i32]);

        self.patch_neighbor(nc, t as u32, t1);
        self.patch_neighbor(na, t as u32, t2);
        self.patch_neighbor(nb, t as u32, t3);

        self.kill(t);
        for child in [t1, t2, t3] {
            self.dag.add_child(t as u32, child);
        }
        vec![t1, t2, t3]
    }

    /// `p` on the edge of `t` opposite `v[k]`, shared with a live neighbour:
    /// both triangles are split, four new triangles appear.
    fn split_shared_edge(&mut self, t: usize, k: usize, p: u32) -> Vec<u32> {
        let tn = self.triangles[t].n[k] as usize;

        // Edge endpoints in t's frame: the edge opposite v[k] is (a, b).
        let c = self.triangles[t].v[k];
        let a = self.triangles[t].v[(k + 1) % 3];
        let b = self.triangles[t].v[(k + 2) % 3];

        // d is tn's vertex that is not on the shared edge.
        let kd = self.triangles[tn]
            .v
            .iter()
            .position(|&v| v != a && v != b)
            .expect("neighbour does not share the edge");
        let d = self.triangles[tn].v[kd];

        // External neighbours. In t: across (b, c) is n[(k+1)%3]'s... the
        // neighbour opposite a, and across (c, a) the one opposite b.
        let na = self.triangles[t].n[self.triangles[t].index_of_vertex(a).unwrap()];
        let nb = self.triangles[t].n[self.triangles[t].index_of_vertex(b).unwrap()];
        // In tn: across (a, d) lies the neighbour opposite b, across (d, b)
        // the one opposite a.
        let ma = self.triangles[tn].n[self.triangles[tn].index_of_vertex(a).unwrap()];
        let mb = self.triangles[tn].n[self.triangles[tn].index_of_vertex(b).unwrap()];

        let u1 = self.triangles.len() as u32; // (p, b, c)
        let u2 = u1 + 1; // (p, c, a)
        let u3 = u1 + 2; // (p, a, d)
        let u4 = u1 + 3; // (p, d, b)

        self.push_triangle([p, b, c], [na, u2 as i32, u4 as i32]);
        self.push_triangle([p, c, a], [nb, u3 as i32, u1 as i32]);
        self.push_triangle([p, a, d], [mb, u4 as i32, u2 as i32]);
        self.push_triangle([p, d, b], [ma, u1 as i32, u3 as i32]);

        self.patch_neighbor(na, t as u32, u1);
        self.patch_neighbor(nb, t as u32, u2);
        self.patch_neighbor(mb, tn as u32, u3);
        self.patch_neighbor(ma, tn as u32, u4);

        self.kill(t);
        self.kill(tn);
        self.dag.add_child(t as u32, u1);
        self.dag.add_child(t as u32, u2);
        self.dag.add_child(tn as u32, u3);
        self.dag.add_child(tn as u32, u4);
        vec![u1, u2, u3, u4]
    }

    /// `p` on a hull edge of `t` (no neighbour across): split into two.
    fn split_hull_edge(&mut self, t: usize, k: usize, p: u32) -> Vec<u32> {
        let c = self.triangles[t].v[k];
        let a = self.triangles[t].v[(k + 1) % 3];
        let b = self.triangles[t].v[(k + 2) % 3];

        let na = self.triangles[t].n[self.triangles[t].index_of_vertex(a).unwrap()];
        let nb = self.triangles[t].n[self.triangles[t].index_of_vertex(b).unwrap()];

        let u1 = self.triangles.len() as u32; // (p, b, c)
        let u2 = u1 + 1; // (p, c, a)

        self.push_triangle([p, b, c], [na, u2 as i32, NO_NEIGHBOR]);
        self.push_triangle([p, c, a], [nb, NO_NEIGHBOR, u1 as i32]);

        self.patch_neighbor(na, t as u32, u1);
        self.patch_neighbor(nb, t as u32, u2);

        self.kill(t);
        self.dag.add_child(t as u32, u1);
        self.dag.add_child(t as u32, u2);
        vec![u1, u2]
    }

    // -----------------------------------------------------------------
    // Legalisation
    // -----------------------------------------------------------------

    /// Restore the empty-circumcircle property across the edge opposite the
    /// apex `v[0]` of a freshly created triangle, flipping recursively.
    fn legalize(&mut self, t: u32) {
        if self.triangles[t as usize].dead {
            return;
        }
        let opposite = self.triangles[t as usize].n[0];
        if opposite == NO_NEIGHBOR {
            return;
        }
        let n = opposite as usize;
        if self.triangles[n].dead {
            return;
        }

        let p = self.triangles[t as usize].v[0];
        let pc = {
            let q = &self.vertices[p as usize].pos;
            Coord { x: q.x, y: q.y }
        };
        let a = self.corner(n, 0);
        let b = self.corner(n, 1);
        let c = self.corner(n, 2);

        // p inside the circumcircle of the CCW neighbour: the edge is illegal.
        if incircle(a, b, c, pc) > 0.0 {
            let (w1, w2) = self.flip(t as usize, n);
            self.legalize(w1);
            self.legalize(w2);
        }
    }

    /// Flip the edge shared by `t = (p, i, j)` and its neighbour `n`,
    /// producing `(p, i, k)` and `(p, k, j)` where `k` is the vertex of `n`
    /// across the edge. Both originals die and parent both replacements.
    fn flip(&mut self, t: usize, n: usize) -> (u32, u32) {
        let p = self.triangles[t].v[0];
        let i = self.triangles[t].v[1];
        let j = self.triangles[t].v[2];

        let kk = self.triangles[n]
            .v
            .iter()
            .position(|&v| v != i && v != j)
            .expect("flip neighbour does not share the edge");
        let k = self.triangles[n].v[kk];

        // External neighbours of t across (p, j) and (p, i).
        let ti = self.triangles[t].n[1];
        let tj = self.triangles[t].n[2];
        // External neighbours of n across (i, k) and (k, j).
        let nj = self.triangles[n].n[self.triangles[n].index_of_vertex(j).unwrap()];
        let ni = self.triangles[n].n[self.triangles[n].index_of_vertex(i).unwrap()];

        let w1 = self.triangles.len() as u32; // (p, i, k)
        let w2 = w1 + 1; // (p, k, j)

        self.push_triangle([p, i, k], [nj, w2 as i32, tj]);
        self.push_triangle([p, k, j], [ni, ti, w1 as i32]);

        self.patch_neighbor(tj, t as u32, w1);
        self.patch_neighbor(ti, t as u32, w2);
        self.patch_neighbor(nj, n as u32, w1);
        self.patch_neighbor(ni, n as u32, w2);

        self.kill(t);
        self.kill(n);
        self.dag.add_child(t as u32, w1);
        self.dag.add_child(t as u32, w2);
        self.dag.add_child(n as u32, w1);
        self.dag.add_child(n as u32, w2);
        (w1, w2)
    }

    // -----------------------------------------------------------------
    // Neighborhood queries
    // -----------------------------------------------------------------

    /// Triangles incident to a vertex, walking from its guard.
    pub fn incident_triangles(&self, vertex: u32) -> Vec<u32> {
        let mut out = Vec::new();
        let mut stack = vec![self.vertices[vertex as usize].guard];
        let mut seen = std::collections::HashSet::new();

        while let Some(t) = stack.pop() {
            if !seen.insert(t) || self.triangles[t as usize].dead {
                continue;
            }
            if let Some(k) = self.triangles[t as usize].index_of_vertex(vertex) {
                out.push(t);
                for adj in [(k + 1) % 3, (k + 2) % 3] {
                    let f = self.triangles[t as usize].n[adj];
                    if f != NO_NEIGHBOR {
                        stack.push(f as u32);
                    }
                }
            }
        }
        out
    }

    /// Vertex ids adjacent to a vertex in the mesh.
    pub fn vertex_neighbors(&self, vertex: u32) -> Vec<u32> {
        let mut out = std::collections::BTreeSet::new();
        for t in self.incident_triangles(vertex) {
            for &v in &self.triangles[t as usize].v {
                if v != vertex {
                    out.insert(v);
                }
            }
        }
        out.into_iter().collect()
    }

    /// Fixed-radius nearest neighbours through the mesh: vertices within
    /// `radius` (2D) of `vertex`, found by flooding the edge graph outward
    /// while it stays inside the radius.
    pub fn frnn(&self, vertex: u32, radius: f64) -> Vec<(u32, f64)> {
        let origin = self.vertices[vertex as usize].pos;
        let r_sq = radius * radius;

        let mut out = Vec::new();
        let mut seen = std::collections::HashSet::new();
        let mut stack = vec![vertex];
        seen.insert(vertex);

        while let Some(v) = stack.pop() {
            for n in self.vertex_neighbors(v) {
                if !seen.insert(n) {
                    continue;
                }
                let p = self.vertices[n as usize].pos;
                let dx = p.x - origin.x;
                let dy = p.y - origin.y;
                let d_sq = dx * dx + dy * dy;
                if d_sq <= r_sq {
                    if n >= GHOST_VERTICES {
                        out.push((n, d_sq.sqrt()));
                    }
                    stack.push(n);
                }
            }
        }
        out.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        out
    }

    // -----------------------------------------------------------------
    // Structural checks (used by the test-suite)
    // -----------------------------------------------------------------

    /// Verify CCW orientation, adjacency symmetry and the empty-circle
    /// property over every live triangle. Expensive; tests only.
    pub fn check_structure(&self) -> Result<(), String> {
        for (ti, tri) in self.triangles.iter().enumerate() {
            if tri.dead {
                continue;
            }

            let a = self.corner(ti, 0);
            let b = self.corner(ti, 1);
            let c = self.corner(ti, 2);
            if orient2d(a, b, c) <= 0.0 {
                return Err(format!("triangle {ti} is not CCW"));
            }

            for k in 0..3 {
                let f = tri.n[k];
                if f == NO_NEIGHBOR {
                    continue;
                }
                let other = &self.triangles[f as usize];
                if other.dead {
                    return Err(format!("triangle {ti} points to dead neighbour {f}"));
                }
                if other.index_of_neighbor(ti as u32).is_none() {
                    return Err(format!("adjacency between {ti} and {f} is not symmetric"));
                }

                // Empty circle: the vertex of the neighbour across edge k
                // must not fall inside our circumcircle.
                let shared: Vec<u32> = tri
                    .v
                    .iter()
                    .enumerate()
                    .filter(|&(i, _)| i != k)
                    .map(|(_, &v)| v)
                    .collect();
                let opposite = other
                    .v
                    .iter()
                    .find(|&&v| !shared.contains(&v))
                    .copied()
                    .ok_or_else(|| format!("{ti}/{f} share no edge"))?;
                let q = &self.vertices[opposite as usize].pos;
                if incircle(a, b, c, Coord { x: q.x, y: q.y }) > 0.0 {
                    return Err(format!("edge between {ti} and {f} is illegal"));
                }
            }
        }
        Ok(())
    }
}

/// Point-on-segment with the engine-wide tolerance: collinear by distance
/// sum, which also keeps the point between the endpoints.
fn point_on_segment(p: &PointXYZ, a: &PointXYZ, b: &PointXYZ) -> bool {
    let ab = a.distance_2d(b);
    if ab == 0.0 {
        return false;
    }
    a.distance_2d(p) + p.distance_2d(b) - ab < IN_TRIANGLE_EPS
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_box() -> Rectangle {
        Rectangle::new(0.0, 0.0, 100.0, 100.0)
    }

    #[test]
    fn insert_one_point_splits_a_ghost_triangle() {
        let mut tin = Triangulation::new(&unit_box());
        assert!(tin.insert(PointXYZ::new(50.0, 40.0, 1.0), 0));
        assert_eq!(tin.num_vertices(), 5);
        tin.check_structure().unwrap();
    }

    #[test]
    fn duplicates_are_rejected() {
        let mut tin = Triangulation::new(&unit_box());
        assert!(tin.insert(PointXYZ::new(50.0, 40.0, 1.0), 0));
        assert!(!tin.insert(PointXYZ::new(50.0, 40.0, 2.0), 1));
        assert!(!tin.insert(PointXYZ::new(50.0 + 1e-9, 40.0, 2.0), 2));
        assert_eq!(tin.num_vertices(), 5);
    }

    #[test]
    fn structure_holds_for_random_insertions() {
        let mut tin = Triangulation::new(&unit_box());
        // Deterministic pseudo-random points.
        let mut state: u64 = 42;
        let mut next = move || {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (state >> 11) as f64 / (1u64 << 53) as f64
        };
        for i in 0..300 {
            let x = next() * 100.0;
            let y = next() * 100.0;
            tin.insert(PointXYZ::new(x, y, 0.0), i);
        }
        tin.check_structure().unwrap();
        assert_eq!(tin.num_vertices(), 304);
    }

    #[test]
    fn on_edge_insertion_keeps_structure() {
        let mut tin = Triangulation::new(&unit_box());
        tin.insert(PointXYZ::new(20.0, 20.0, 0.0), 0);
        tin.insert(PointXYZ::new(80.0, 20.0, 0.0), 1);
        tin.insert(PointXYZ::new(50.0, 80.0, 0.0), 2);
        // Midpoint of the (20,20)-(80,20) edge.
        assert!(tin.insert(PointXYZ::new(50.0, 20.0, 0.0), 3));
        tin.check_structure().unwrap();
    }

    #[test]
    fn dag_location_agrees_with_linear_scan() {
        let mut tin = Triangulation::new(&unit_box());
        let mut state: u64 = 7;
        let mut next = move || {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (state >> 11) as f64 / (1u64 << 53) as f64
        };
        for i in 0..200 {
            tin.insert(PointXYZ::new(next() * 100.0, next() * 100.0, 0.0), i);
        }

        for _ in 0..100 {
            let p = PointXYZ::new(next() * 100.0, next() * 100.0, 0.0);
            let dag = tin.locate_dag(&p);
            let linear = tin.locate_linear(&p);
            match dag {
                Some(LocateResult::Inside(t)) => {
                    // The linear scan may find a different triangle only when
                    // the point is exactly on an edge; both must contain p.
                    let lt = linear.expect("linear scan found nothing");
                    assert!(tin.contains_inclusive(t as usize, Coord { x: p.x, y: p.y }));
                    assert!(tin.contains_inclusive(lt as usize, Coord { x: p.x, y: p.y }));
                }
                Some(LocateResult::Duplicate(_)) => {}
                None => panic!("point inside the square must be locatable"),
            }
        }
    }

    #[test]
    fn fast_walk_agrees_with_dag() {
        let mut tin = Triangulation::new(&unit_box());
        let mut state: u64 = 3;
        let mut next = move || {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (state >> 11) as f64 / (1u64 << 53) as f64
        };
        for i in 0..200 {
            tin.insert(PointXYZ::new(next() * 100.0, next() * 100.0, 0.0), i);
        }
        tin.set_fast_locate(true);
        for i in 200..260 {
            assert!(tin.insert(PointXYZ::new(next() * 100.0, next() * 100.0, 0.0), i));
        }
        tin.check_structure().unwrap();
    }

    #[test]
    fn frnn_finds_grid_neighbours() {
        let mut tin = Triangulation::new(&unit_box());
        for i in 0..10 {
            for j in 0..10 {
                tin.insert(
                    PointXYZ::new(5.0 + i as f64 * 10.0, 5.0 + j as f64 * 10.0, 0.0),
                    (i * 10 + j) as u32,
                );
            }
        }
        // The center vertex has four rook neighbours at distance 10 and
        // four diagonal ones within 15.
        let center = tin
            .vertices()
            .iter()
            .position(|v| v.pos.x == 55.0 && v.pos.y == 55.0)
            .unwrap() as u32;
        let within = tin.frnn(center, 15.0);
        assert_eq!(within.len(), 8);
        assert!((within[0].1 - 10.0).abs() < 1e-9);
    }

    #[test]
    fn dirty_cells_track_insertions() {
        let mut tin = Triangulation::new(&unit_box());
        tin.set_dirty_grid(Grid::new(0.0, 0.0, 100.0, 100.0, 1.0));
        tin.insert(PointXYZ::new(10.0, 10.0, 0.0), 0);
        tin.reset_dirty_cells();
        assert!(!tin.is_cell_dirty(10.0, 10.0));
        tin.insert(PointXYZ::new(10.5, 10.5, 0.0), 1);
        assert!(tin.is_cell_dirty(10.0, 10.0));
    }
}
