//! Conditional short-circuit: stop the pipeline for chunks outside a
//! rectangle. The break is an explicit flow signal, not an error.

use std::any::Any;

use point_cloud_core::{PointCloud, Rectangle};

use crate::error::Result;
use crate::stage::{ChunkContext, Flow, Stage, StageCommon};

pub struct StopIfOutsideStage {
    common: StageCommon,
    bbox: Rectangle,
}

impl StopIfOutsideStage {
    pub fn new(common: StageCommon, bbox: Rectangle) -> Self {
        Self { common, bbox }
    }
}

impl Stage for StopIfOutsideStage {
    fn name(&self) -> &'static str {
        "stop_if_outside"
    }

    fn common(&self) -> &StageCommon {
        &self.common
    }

    fn common_mut(&mut self) -> &mut StageCommon {
        &mut self.common
    }

    fn need_points(&self) -> bool {
        false
    }

    fn process_cloud(&mut self, _cloud: &mut PointCloud, _ctx: &mut ChunkContext) -> Result<Flow> {
        if self.common.chunk.bbox().overlaps(&self.bbox) {
            Ok(Flow::Continue)
        } else {
            Ok(Flow::Break)
        }
    }

    fn clone_stage(&self) -> Box<dyn Stage> {
        Box::new(StopIfOutsideStage { common: self.common.clone(), bbox: self.bbox })
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
