//! The glue stages: thin drivers over the core primitives.

pub mod boundaries;
pub mod classify_ptd;
pub mod local_maximum;
pub mod rasterize;
pub mod region_growing;
pub mod sampling;
pub mod stop_if;
pub mod summary;
pub mod transform_with;
pub mod triangulate;
pub mod write_copc;
pub mod write_las;
pub mod write_lax;
pub mod write_pcd;
pub mod write_vpc;
