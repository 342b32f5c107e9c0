//! Incremental 2D Delaunay triangulation.
//!
//! The triangulation is stored in flat arenas addressed by indices. Four
//! ghost vertices form a square strictly enclosing every input point, so
//! insertion never has to deal with points outside the hull. Point location
//! walks a history DAG rooted at the two initial ghost triangles; a local
//! walk from a hint triangle is available once the mesh is dense enough that
//! the last touched triangle is a good starting point.
//!
//! Triangles are never removed: subdivision and flips mark the old triangles
//! dead and append replacements, which is exactly the shape the location DAG
//! needs.

mod dag;
mod interpolate;
mod triangulation;

pub use dag::LocationDag;
pub use triangulation::{
    LocateResult, Triangulation, Vertex, GHOST_VERTICES, IN_TRIANGLE_EPS, NO_NEIGHBOR,
};
