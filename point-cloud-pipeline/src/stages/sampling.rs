//! Decimation stages: keep one point per voxel or per pixel.

use std::any::Any;
use std::collections::HashSet;

use point_cloud_core::PointCloud;

use crate::error::Result;
use crate::stage::{ChunkContext, Flow, Stage, StageCommon};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingMode {
    Voxel,
    Pixel,
}

pub struct SamplingStage {
    common: StageCommon,
    mode: SamplingMode,
    res: f64,
}

impl SamplingStage {
    pub fn new(common: StageCommon, mode: SamplingMode, res: f64) -> Self {
        Self { common, mode, res }
    }
}

impl Stage for SamplingStage {
    fn name(&self) -> &'static str {
        match self.mode {
            SamplingMode::Voxel => "sampling_voxel",
            SamplingMode::Pixel => "sampling_pixel",
        }
    }

    fn common(&self) -> &StageCommon {
        &self.common
    }

    fn common_mut(&mut self) -> &mut StageCommon {
        &mut self.common
    }

    fn process_cloud(&mut self, cloud: &mut PointCloud, _ctx: &mut ChunkContext) -> Result<Flow> {
        let mut seen: HashSet<(i64, i64, i64)> = HashSet::new();
        let res = self.res;

        for i in 0..cloud.points.len() {
            if cloud.is_deleted(i) {
                continue;
            }
            let p = &cloud.points[i];
            let key = match self.mode {
                SamplingMode::Voxel => (
                    (p.x / res).floor() as i64,
                    (p.y / res).floor() as i64,
                    (p.z / res).floor() as i64,
                ),
                SamplingMode::Pixel => {
                    ((p.x / res).floor() as i64, (p.y / res).floor() as i64, 0)
                }
            };
            // First point of the cell wins; file order makes it stable.
            if !seen.insert(key) {
                cloud.delete(i);
            }
        }

        cloud.compact();
        cloud.build_index();
        Ok(Flow::Continue)
    }

    fn clone_stage(&self) -> Box<dyn Stage> {
        Box::new(SamplingStage {
            common: self.common.clone(),
            mode: self.mode,
            res: self.res,
        })
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
