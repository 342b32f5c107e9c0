//! Geometric primitives shared across the engine.
//!
//! All shapes expose an axis-aligned bounding box, point containment and a
//! centroid. Triangles additionally carry the orientation helpers and the
//! squared-edge metrics used by the triangulation and the ground classifier.

use serde::{Deserialize, Serialize};

/// A 2D point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PointXY {
    pub x: f64,
    pub y: f64,
}

impl PointXY {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// A 3D point. Ordering compares (x, y) only so that planimetric containers
/// behave consistently regardless of elevation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PointXYZ {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl PointXYZ {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn xy(&self) -> PointXY {
        PointXY::new(self.x, self.y)
    }

    pub fn distance_2d(&self, other: &PointXYZ) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }

    pub fn distance_3d(&self, other: &PointXYZ) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }
}

/// Axis-aligned rectangle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Rectangle {
    pub xmin: f64,
    pub ymin: f64,
    pub xmax: f64,
    pub ymax: f64,
}

impl Rectangle {
    pub fn new(xmin: f64, ymin: f64, xmax: f64, ymax: f64) -> Self {
        Self { xmin, ymin, xmax, ymax }
    }

    /// An empty rectangle ready to grow around added geometry.
    pub fn empty() -> Self {
        Self {
            xmin: f64::INFINITY,
            ymin: f64::INFINITY,
            xmax: f64::NEG_INFINITY,
            ymax: f64::NEG_INFINITY,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.xmin > self.xmax || self.ymin > self.ymax
    }

    pub fn width(&self) -> f64 {
        self.xmax - self.xmin
    }

    pub fn height(&self) -> f64 {
        self.ymax - self.ymin
    }

    pub fn grow(&mut self, x: f64, y: f64) {
        self.xmin = self.xmin.min(x);
        self.ymin = self.ymin.min(y);
        self.xmax = self.xmax.max(x);
        self.ymax = self.ymax.max(y);
    }

    pub fn merge(&mut self, other: &Rectangle) {
        self.xmin = self.xmin.min(other.xmin);
        self.ymin = self.ymin.min(other.ymin);
        self.xmax = self.xmax.max(other.xmax);
        self.ymax = self.ymax.max(other.ymax);
    }

    /// The rectangle inflated by `d` on every side.
    pub fn buffered(&self, d: f64) -> Rectangle {
        Rectangle::new(self.xmin - d, self.ymin - d, self.xmax + d, self.ymax + d)
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.xmin && x <= self.xmax && y >= self.ymin && y <= self.ymax
    }

    pub fn overlaps(&self, other: &Rectangle) -> bool {
        self.xmin <= other.xmax
            && self.xmax >= other.xmin
            && self.ymin <= other.ymax
            && self.ymax >= other.ymin
    }

    pub fn centroid(&self) -> PointXYZ {
        PointXYZ::new((self.xmin + self.xmax) / 2.0, (self.ymin + self.ymax) / 2.0, 0.0)
    }
}

/// Circle described by center and radius.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Circle {
    pub center: PointXY,
    pub radius: f64,
}

impl Circle {
    pub fn new(x: f64, y: f64, radius: f64) -> Self {
        Self { center: PointXY::new(x, y), radius }
    }

    pub fn bbox(&self) -> Rectangle {
        Rectangle::new(
            self.center.x - self.radius,
            self.center.y - self.radius,
            self.center.x + self.radius,
            self.center.y + self.radius,
        )
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        let dx = self.center.x - x;
        let dy = self.center.y - y;
        dx * dx + dy * dy < self.radius * self.radius
    }

    pub fn centroid(&self) -> PointXYZ {
        PointXYZ::new(self.center.x, self.center.y, 0.0)
    }
}

/// A 3D triangle used for TIN queries and rasterisation.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TriangleXYZ {
    pub a: PointXYZ,
    pub b: PointXYZ,
    pub c: PointXYZ,
}

impl TriangleXYZ {
    pub fn new(a: PointXYZ, b: PointXYZ, c: PointXYZ) -> Self {
        Self { a, b, c }
    }

    pub fn bbox(&self) -> Rectangle {
        Rectangle::new(
            self.a.x.min(self.b.x).min(self.c.x),
            self.a.y.min(self.b.y).min(self.c.y),
            self.a.x.max(self.b.x).max(self.c.x),
            self.a.y.max(self.b.y).max(self.c.y),
        )
    }

    pub fn centroid(&self) -> PointXYZ {
        PointXYZ::new(
            (self.a.x + self.b.x + self.c.x) / 3.0,
            (self.a.y + self.b.y + self.c.y) / 3.0,
            (self.a.z + self.b.z + self.c.z) / 3.0,
        )
    }

    fn signed_area(&self) -> f64 {
        (self.b.x - self.a.x) * (self.c.y - self.a.y)
            - (self.c.x - self.a.x) * (self.b.y - self.a.y)
    }

    pub fn is_counter_clockwise(&self) -> bool {
        self.signed_area() > 0.0
    }

    pub fn make_counter_clockwise(&mut self) {
        if !self.is_counter_clockwise() {
            std::mem::swap(&mut self.b, &mut self.c);
        }
    }

    /// Planimetric containment with inclusive edges.
    pub fn contains(&self, x: f64, y: f64) -> bool {
        let sign = |p1: &PointXYZ, p2: &PointXYZ| -> f64 {
            (x - p2.x) * (p1.y - p2.y) - (p1.x - p2.x) * (y - p2.y)
        };

        let d1 = sign(&self.a, &self.b);
        let d2 = sign(&self.b, &self.c);
        let d3 = sign(&self.c, &self.a);

        let has_neg = d1 < 0.0 || d2 < 0.0 || d3 < 0.0;
        let has_pos = d1 > 0.0 || d2 > 0.0 || d3 > 0.0;
        !(has_neg && has_pos)
    }

    /// Squared length of the longest edge.
    pub fn square_max_edge_size(&self) -> f64 {
        let ab = square_distance_2d(&self.a, &self.b);
        let bc = square_distance_2d(&self.b, &self.c);
        let ca = square_distance_2d(&self.c, &self.a);
        ab.max(bc).max(ca)
    }

    /// Unit normal of the supporting plane.
    pub fn normal(&self) -> PointXYZ {
        let ux = self.b.x - self.a.x;
        let uy = self.b.y - self.a.y;
        let uz = self.b.z - self.a.z;
        let vx = self.c.x - self.a.x;
        let vy = self.c.y - self.a.y;
        let vz = self.c.z - self.a.z;

        let nx = uy * vz - uz * vy;
        let ny = uz * vx - ux * vz;
        let nz = ux * vy - uy * vx;
        let len = (nx * nx + ny * ny + nz * nz).sqrt();
        if len == 0.0 {
            PointXYZ::new(0.0, 0.0, 1.0)
        } else {
            PointXYZ::new(nx / len, ny / len, nz / len)
        }
    }

    /// Interpolate the plane's z at the point's (x, y), writing into `p.z`.
    pub fn linear_interpolation(&self, p: &mut PointXYZ) {
        let n = self.normal();
        if n.z.abs() < 1e-12 {
            return;
        }
        let d = n.x * self.a.x + n.y * self.a.y + n.z * self.a.z;
        p.z = (d - n.x * p.x - n.y * p.y) / n.z;
    }
}

fn square_distance_2d(p: &PointXYZ, q: &PointXYZ) -> f64 {
    let dx = p.x - q.x;
    let dy = p.y - q.y;
    dx * dx + dy * dy
}

/// An undirected edge. Equality and hashing are endpoint-order independent.
#[derive(Debug, Clone, Copy)]
pub struct Edge {
    pub a: PointXY,
    pub b: PointXY,
}

impl Edge {
    pub fn new(a: PointXY, b: PointXY) -> Self {
        Self { a, b }
    }

    fn normalized(&self) -> (u64, u64, u64, u64) {
        let ka = (self.a.x.to_bits(), self.a.y.to_bits());
        let kb = (self.b.x.to_bits(), self.b.y.to_bits());
        if ka <= kb {
            (ka.0, ka.1, kb.0, kb.1)
        } else {
            (kb.0, kb.1, ka.0, ka.1)
        }
    }
}

impl PartialEq for Edge {
    fn eq(&self, other: &Self) -> bool {
        self.normalized() == other.normalized()
    }
}

impl Eq for Edge {}

impl std::hash::Hash for Edge {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.normalized().hash(state);
    }
}

/// A polygon ring in the XY plane.
#[derive(Debug, Clone, Default)]
pub struct PolygonXY {
    pub coordinates: Vec<PointXY>,
}

impl PolygonXY {
    pub fn new(coords: Vec<PointXY>) -> Self {
        Self { coordinates: coords }
    }

    pub fn push(&mut self, p: PointXY) {
        self.coordinates.push(p);
    }

    pub fn is_closed(&self) -> bool {
        match (self.coordinates.first(), self.coordinates.last()) {
            (Some(a), Some(b)) => a == b && self.coordinates.len() > 1,
            _ => false,
        }
    }

    pub fn close(&mut self) {
        if !self.is_closed() {
            if let Some(first) = self.coordinates.first().copied() {
                self.coordinates.push(first);
            }
        }
    }

    fn signed_area(&self) -> f64 {
        let n = self.coordinates.len();
        if n < 3 {
            return 0.0;
        }
        let mut area = 0.0;
        for i in 0..n {
            let p = &self.coordinates[i];
            let q = &self.coordinates[(i + 1) % n];
            area += p.x * q.y - q.x * p.y;
        }
        area / 2.0
    }

    pub fn is_clockwise(&self) -> bool {
        self.signed_area() < 0.0
    }

    pub fn bbox(&self) -> Rectangle {
        let mut bb = Rectangle::empty();
        for p in &self.coordinates {
            bb.grow(p.x, p.y);
        }
        bb
    }

    /// Even-odd point in polygon.
    pub fn contains(&self, x: f64, y: f64) -> bool {
        let n = self.coordinates.len();
        if n < 3 {
            return false;
        }
        let mut inside = false;
        let mut j = n - 1;
        for i in 0..n {
            let pi = &self.coordinates[i];
            let pj = &self.coordinates[j];
            if (pi.y > y) != (pj.y > y)
                && x < (pj.x - pi.x) * (y - pi.y) / (pj.y - pi.y) + pi.x
            {
                inside = !inside;
            }
            j = i;
        }
        inside
    }

    pub fn centroid(&self) -> PointXYZ {
        let bb = self.bbox();
        bb.centroid()
    }
}

/// Any region of interest the catalog or a stage can be queried with.
#[derive(Debug, Clone)]
pub enum Shape {
    Rectangle(Rectangle),
    Circle(Circle),
    Polygon(PolygonXY),
}

impl Shape {
    pub fn bbox(&self) -> Rectangle {
        match self {
            Shape::Rectangle(r) => *r,
            Shape::Circle(c) => c.bbox(),
            Shape::Polygon(p) => p.bbox(),
        }
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        match self {
            Shape::Rectangle(r) => r.contains(x, y),
            Shape::Circle(c) => c.contains(x, y),
            Shape::Polygon(p) => p.contains(x, y),
        }
    }

    pub fn centroid(&self) -> PointXYZ {
        match self {
            Shape::Rectangle(r) => r.centroid(),
            Shape::Circle(c) => c.centroid(),
            Shape::Polygon(p) => p.centroid(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rectangle_buffer_and_overlap() {
        let a = Rectangle::new(0.0, 0.0, 10.0, 10.0);
        let b = Rectangle::new(12.0, 0.0, 20.0, 10.0);
        assert!(!a.overlaps(&b));
        assert!(a.buffered(2.0).overlaps(&b));
        assert!(a.contains(10.0, 10.0));
        assert!(!a.contains(10.1, 10.0));
    }

    #[test]
    fn circle_containment_is_strict() {
        let c = Circle::new(0.0, 0.0, 5.0);
        assert!(c.contains(3.0, 3.0));
        assert!(!c.contains(5.0, 0.0));
        assert_eq!(c.bbox(), Rectangle::new(-5.0, -5.0, 5.0, 5.0));
    }

    #[test]
    fn triangle_orientation_and_interpolation() {
        let mut t = TriangleXYZ::new(
            PointXYZ::new(0.0, 0.0, 0.0),
            PointXYZ::new(0.0, 4.0, 4.0),
            PointXYZ::new(4.0, 0.0, 0.0),
        );
        assert!(!t.is_counter_clockwise());
        t.make_counter_clockwise();
        assert!(t.is_counter_clockwise());

        let mut p = PointXYZ::new(1.0, 2.0, 0.0);
        t.linear_interpolation(&mut p);
        assert!((p.z - 2.0).abs() < 1e-12);
        assert!(t.contains(1.0, 1.0));
        assert!(!t.contains(4.0, 4.0));
        assert_eq!(t.square_max_edge_size(), 32.0);
    }

    #[test]
    fn edge_equality_ignores_direction() {
        let e1 = Edge::new(PointXY::new(0.0, 0.0), PointXY::new(1.0, 1.0));
        let e2 = Edge::new(PointXY::new(1.0, 1.0), PointXY::new(0.0, 0.0));
        assert_eq!(e1, e2);

        let mut set = std::collections::HashSet::new();
        set.insert(e1);
        assert!(!set.insert(e2));
    }

    #[test]
    fn polygon_containment() {
        let mut p = PolygonXY::new(vec![
            PointXY::new(0.0, 0.0),
            PointXY::new(10.0, 0.0),
            PointXY::new(10.0, 10.0),
            PointXY::new(0.0, 10.0),
        ]);
        p.close();
        assert!(p.is_closed());
        assert!(p.contains(5.0, 5.0));
        assert!(!p.contains(11.0, 5.0));
        assert!(!p.is_clockwise());
    }
}
