//! Core data model and ambient services for the point cloud engine.
//!
//! Everything the processing stages share lives here: the semantic point
//! record and header, geometric primitives, the regular grid and its raster
//! and vector sinks, the attribute filter language, progress reporting with
//! cooperative cancellation, and the file catalog that partitions a coverage
//! into buffered chunks.

/// File catalog, spatial tile index and chunk partitioner.
pub mod catalog;

/// Spatial partition of the coverage handed to worker threads.
pub mod chunk;

/// Coordinate reference system carried as EPSG code and/or WKT string.
pub mod crs;

/// Crate-wide error type.
pub mod error;

/// Attribute predicate language (`-keep_below Z 10 ...`).
pub mod filter;

/// Regular grid arithmetic shared by rasters and spatial hashing.
pub mod grid;

/// Point cloud header: bounds, counts, CRS, scale/offset, schema.
pub mod header;

/// Semantic point record with extra attribute payload.
pub mod point;

/// Materialised chunk with occupancy index for loaded-mode stages.
pub mod point_cloud;

/// Progress reporting and cooperative cancellation.
pub mod progress;

/// Raster sink: grid plus flat band storage.
pub mod raster;

/// Geometric primitives: rectangles, circles, triangles, edges, polygons.
pub mod shapes;

/// Vector sink writing points, polygons and triangulations.
pub mod vector;

/// Virtual point cloud manifest (STAC FeatureCollection) reader/writer.
pub mod vpc;

pub use catalog::{FileCollection, FileInfo};
pub use chunk::{Chunk, ChunkShape};
pub use crs::Crs;
pub use error::{CoreError, Result};
pub use filter::PointFilter;
pub use grid::{Contiguity, Grid};
pub use header::{Attribute, AttributeKind, Header};
pub use point::Point;
pub use point_cloud::PointCloud;
pub use progress::Progress;
pub use raster::Raster;
pub use shapes::{Circle, Edge, PointXY, PointXYZ, PolygonXY, Rectangle, Shape, TriangleXYZ};
pub use vector::Vector;
