//! Vector sink writing points, polygons and triangulations as GeoJSON.
//!
//! The GeoJSON rendition is the in-tree collaborator for the vector
//! contract; OGR-backed drivers would implement [`VectorSink`] the same way.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::{json, Value};

use crate::error::Result;
use crate::shapes::{PointXYZ, PolygonXY, Rectangle, TriangleXYZ};

/// Contract every vector destination implements.
pub trait VectorSink {
    fn write_vector(&mut self, vector: &Vector, path: &Path) -> Result<()>;
}

#[derive(Debug, Clone, Serialize)]
struct Feature {
    #[serde(rename = "type")]
    kind: &'static str,
    geometry: Value,
    properties: Value,
}

/// An accumulating vector destination with a writable extent and optional
/// per-feature attributes.
#[derive(Debug, Clone, Default)]
pub struct Vector {
    features: Vec<Feature>,
    pub extent: Rectangle,
    pub path: Option<PathBuf>,
}

impl Vector {
    pub fn new() -> Self {
        Self { features: Vec::new(), extent: Rectangle::empty(), path: None }
    }

    pub fn set_path(&mut self, path: impl Into<PathBuf>) {
        self.path = Some(path.into());
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn write_point(&mut self, p: &PointXYZ, properties: Value) {
        self.extent.grow(p.x, p.y);
        self.features.push(Feature {
            kind: "Feature",
            geometry: json!({ "type": "Point", "coordinates": [p.x, p.y, p.z] }),
            properties,
        });
    }

    pub fn write_polygon(&mut self, ring: &PolygonXY, properties: Value) {
        let bb = ring.bbox();
        self.extent.merge(&bb);
        let coords: Vec<[f64; 2]> = ring.coordinates.iter().map(|p| [p.x, p.y]).collect();
        self.features.push(Feature {
            kind: "Feature",
            geometry: json!({ "type": "Polygon", "coordinates": [coords] }),
            properties,
        });
    }

    /// Write a set of edges as one MultiLineString feature.
    pub fn write_edges(&mut self, edges: &[crate::shapes::Edge], properties: Value) {
        let mut lines: Vec<[[f64; 2]; 2]> = Vec::with_capacity(edges.len());
        for e in edges {
            self.extent.grow(e.a.x, e.a.y);
            self.extent.grow(e.b.x, e.b.y);
            lines.push([[e.a.x, e.a.y], [e.b.x, e.b.y]]);
        }
        self.features.push(Feature {
            kind: "Feature",
            geometry: json!({ "type": "MultiLineString", "coordinates": lines }),
            properties,
        });
    }

    /// Write a triangulation as one MultiPolygon feature.
    pub fn write_triangulation(&mut self, triangles: &[TriangleXYZ], properties: Value) {
        let mut polys: Vec<Vec<Vec<[f64; 3]>>> = Vec::with_capacity(triangles.len());
        for t in triangles {
            self.extent.merge(&t.bbox());
            polys.push(vec![vec![
                [t.a.x, t.a.y, t.a.z],
                [t.b.x, t.b.y, t.b.z],
                [t.c.x, t.c.y, t.c.z],
                [t.a.x, t.a.y, t.a.z],
            ]]);
        }
        self.features.push(Feature {
            kind: "Feature",
            geometry: json!({ "type": "MultiPolygon", "coordinates": polys }),
            properties,
        });
    }

    /// Append all features of another vector (chunk merge).
    pub fn merge_from(&mut self, other: &Vector) {
        self.extent.merge(&other.extent);
        self.features.extend(other.features.iter().cloned());
    }

    pub fn clear(&mut self) {
        self.features.clear();
        self.extent = Rectangle::empty();
    }

    /// Serialise as a GeoJSON FeatureCollection.
    pub fn to_geojson(&self) -> Result<String> {
        let doc = json!({
            "type": "FeatureCollection",
            "features": self.features,
        });
        Ok(serde_json::to_string_pretty(&doc)?)
    }

    /// Write to the configured path, if any.
    pub fn write(&self) -> Result<()> {
        if let Some(path) = &self.path {
            fs::write(path, self.to_geojson()?)?;
        }
        Ok(())
    }
}

impl VectorSink for Vector {
    fn write_vector(&mut self, vector: &Vector, path: &Path) -> Result<()> {
        fs::write(path, vector.to_geojson()?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn points_and_extent() {
        let mut v = Vector::new();
        v.write_point(&PointXYZ::new(1.0, 2.0, 3.0), json!({"id": 1}));
        v.write_point(&PointXYZ::new(-1.0, 5.0, 0.0), json!({"id": 2}));
        assert_eq!(v.len(), 2);
        assert_eq!(v.extent, Rectangle::new(-1.0, 2.0, 1.0, 5.0));

        let doc: Value = serde_json::from_str(&v.to_geojson().unwrap()).unwrap();
        assert_eq!(doc["type"], "FeatureCollection");
        assert_eq!(doc["features"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn triangulation_is_one_multipolygon() {
        let mut v = Vector::new();
        let t = TriangleXYZ::new(
            PointXYZ::new(0.0, 0.0, 0.0),
            PointXYZ::new(1.0, 0.0, 0.0),
            PointXYZ::new(0.0, 1.0, 0.0),
        );
        v.write_triangulation(&[t, t], json!({}));
        assert_eq!(v.len(), 1);
        let doc: Value = serde_json::from_str(&v.to_geojson().unwrap()).unwrap();
        let geom = &doc["features"][0]["geometry"];
        assert_eq!(geom["type"], "MultiPolygon");
        assert_eq!(geom["coordinates"].as_array().unwrap().len(), 2);
    }
}
