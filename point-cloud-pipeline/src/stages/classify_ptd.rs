//! Ground classification stage over the progressive TIN densification core.

use std::any::Any;

use point_cloud_core::PointCloud;
use point_cloud_ground::{GroundPoint, PtdClassifier, PtdParameters};

/// Standard LAS class for noise/outliers.
const NOISE_CLASS: u8 = 18;

use crate::error::Result;
use crate::stage::{ChunkContext, Flow, Stage, StageCommon};

pub struct ClassifyPtdStage {
    common: StageCommon,
    params: PtdParameters,
    class_code: u8,
}

impl ClassifyPtdStage {
    pub fn new(common: StageCommon, params: PtdParameters, class_code: u8) -> Self {
        Self { common, params, class_code }
    }
}

impl Stage for ClassifyPtdStage {
    fn name(&self) -> &'static str {
        "classify_ptd"
    }

    fn common(&self) -> &StageCommon {
        &self.common
    }

    fn common_mut(&mut self) -> &mut StageCommon {
        &mut self.common
    }

    fn need_buffer(&self) -> f64 {
        30.0
    }

    fn process_cloud(&mut self, cloud: &mut PointCloud, _ctx: &mut ChunkContext) -> Result<Flow> {
        let header = cloud.header.clone();
        let mut input = Vec::with_capacity(cloud.len());
        for (i, p) in cloud.iter_live() {
            if !self.common.filter.is_empty() && !self.common.filter.keep(p, &header)? {
                continue;
            }
            input.push(GroundPoint {
                pos: point_cloud_core::PointXYZ::new(p.x, p.y, p.z),
                fid: i as u32,
            });
        }
        self.common.filter.reset();
        if input.is_empty() {
            return Ok(Flow::Continue);
        }

        let classifier = PtdClassifier::new(self.params.clone())?;
        let result = classifier.run(&input)?;

        // Overwrite classifications in place; untouched points keep theirs.
        for fid in result.ground {
            cloud.points[fid as usize].classification = self.class_code;
        }
        for fid in result.spikes {
            cloud.points[fid as usize].classification = NOISE_CLASS;
        }
        Ok(Flow::Continue)
    }

    fn clone_stage(&self) -> Box<dyn Stage> {
        Box::new(ClassifyPtdStage {
            common: self.common.clone(),
            params: self.params.clone(),
            class_code: self.class_code,
        })
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
