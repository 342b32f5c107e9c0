//! Spatial-index writer: a pre-run pass producing a `.lax` sidecar for
//! every file that lacks one. The engine prepends this stage automatically
//! when a workload needs indexing and files are missing it.

use std::any::Any;

use point_cloud_core::FileCollection;
use point_cloud_copc::write_lax;

use crate::error::Result;
use crate::stage::{Stage, StageCommon};

pub struct WriteLaxStage {
    common: StageCommon,
}

impl WriteLaxStage {
    pub fn new(common: StageCommon) -> Self {
        Self { common }
    }
}

impl Stage for WriteLaxStage {
    fn name(&self) -> &'static str {
        "write_lax"
    }

    fn common(&self) -> &StageCommon {
        &self.common
    }

    fn common_mut(&mut self) -> &mut StageCommon {
        &mut self.common
    }

    fn is_streamable(&self) -> bool {
        true
    }

    fn need_points(&self) -> bool {
        false
    }

    fn process_collection(&mut self, catalog: &mut FileCollection) -> Result<()> {
        let todo: Vec<_> = catalog
            .files()
            .iter()
            .filter(|f| !f.indexed)
            .map(|f| (f.path.clone(), f.bbox))
            .collect();

        for (path, bbox) in todo {
            log::info!("writing spatial index for {}", path.display());
            let mut reader = las::Reader::from_path(&path).map_err(|source| {
                point_cloud_core::CoreError::LasOpen { path: path.clone(), source }
            })?;
            let coords: Vec<(f64, f64)> = reader
                .points()
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(point_cloud_core::CoreError::from)?
                .into_iter()
                .map(|p| (p.x, p.y))
                .collect();
            write_lax(&path, (bbox.xmin, bbox.ymin, bbox.xmax, bbox.ymax), coords)?;
            catalog.set_indexed(&path);
        }
        Ok(())
    }

    fn clone_stage(&self) -> Box<dyn Stage> {
        Box::new(WriteLaxStage { common: self.common.clone() })
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
