//! Virtual point cloud writer: a pre-run pass serialising the catalog as a
//! STAC manifest. No point payload is needed.

use std::any::Any;

use point_cloud_core::FileCollection;

use crate::error::Result;
use crate::stage::{Stage, StageCommon};

pub struct WriteVpcStage {
    common: StageCommon,
}

impl WriteVpcStage {
    pub fn new(common: StageCommon) -> Self {
        Self { common }
    }
}

impl Stage for WriteVpcStage {
    fn name(&self) -> &'static str {
        "write_vpc"
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
        if let Some(path) = self.common.merged_output_path() {
            catalog.write_vpc(&path)?;
        }
        Ok(())
    }

    fn clone_stage(&self) -> Box<dyn Stage> {
        Box::new(WriteVpcStage { common: self.common.clone() })
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
