//! Subtract or add a connected surface (triangulation or raster) at each
//! point's position. Points over NODATA are dropped; the result can land in
//! an extra attribute instead of replacing z.

use std::any::Any;

use point_cloud_core::header::{Attribute, AttributeKind};
use point_cloud_core::PointCloud;

use crate::error::{PipelineError, Result};
use crate::stage::{ChunkContext, Flow, Stage, StageCommon};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Subtract,
    Add,
}

impl Operator {
    pub fn parse(token: &str) -> Result<Self> {
        match token {
            "-" => Ok(Operator::Subtract),
            "+" => Ok(Operator::Add),
            other => Err(PipelineError::InvalidValue {
                key: "operator".to_string(),
                reason: format!("expected '-' or '+', got '{other}'"),
            }),
        }
    }
}

pub struct TransformWithStage {
    common: StageCommon,
    connect: String,
    operator: Operator,
    /// When set, the transformed value goes into this extra attribute and
    /// the point keeps its original z.
    store_in_attribute: String,
}

impl TransformWithStage {
    pub fn new(
        common: StageCommon,
        connect: String,
        operator: Operator,
        store_in_attribute: String,
    ) -> Self {
        Self { common, connect, operator, store_in_attribute }
    }
}

impl Stage for TransformWithStage {
    fn name(&self) -> &'static str {
        "transform_with"
    }

    fn common(&self) -> &StageCommon {
        &self.common
    }

    fn common_mut(&mut self) -> &mut StageCommon {
        &mut self.common
    }

    fn process_cloud(&mut self, cloud: &mut PointCloud, ctx: &mut ChunkContext) -> Result<Flow> {
        let tin = ctx.triangulation(&self.connect);
        let raster = ctx.raster(&self.connect);
        if tin.is_none() && raster.is_none() {
            return Err(PipelineError::IncompatibleConnection("transform_with"));
        }

        // Register the destination attribute once.
        let attr_index = if self.store_in_attribute.is_empty() {
            None
        } else {
            let index = match cloud
                .header
                .schema
                .iter()
                .position(|a| a.name == self.store_in_attribute)
            {
                Some(i) => i,
                None => {
                    cloud.header.schema.push(Attribute {
                        name: self.store_in_attribute.clone(),
                        kind: AttributeKind::F64,
                        scale: None,
                        offset: None,
                    });
                    let n = cloud.header.schema.len();
                    for p in cloud.points.iter_mut() {
                        p.extra.resize(n, 0.0);
                    }
                    n - 1
                }
            };
            Some(index)
        };

        for i in 0..cloud.points.len() {
            if cloud.is_deleted(i) {
                continue;
            }
            let (x, y, z) = {
                let p = &cloud.points[i];
                (p.x, p.y, p.z)
            };
            let surface = match (&tin, &raster) {
                (Some(tin), _) => tin.interpolate_xy(x, y, 0.0),
                (None, Some(raster)) => raster.value_at(0, x, y).map(|v| v as f64),
                (None, None) => unreachable!(),
            };

            match surface {
                Some(value) => {
                    let transformed = match self.operator {
                        Operator::Subtract => z - value,
                        Operator::Add => z + value,
                    };
                    let p = &mut cloud.points[i];
                    match attr_index {
                        Some(k) => p.extra[k] = transformed,
                        None => p.z = transformed,
                    }
                }
                // NODATA below the point: drop it.
                None => cloud.delete(i),
            }
        }

        cloud.compact();
        cloud.build_index();
        Ok(Flow::Continue)
    }

    fn clone_stage(&self) -> Box<dyn Stage> {
        Box::new(TransformWithStage {
            common: self.common.clone(),
            connect: self.connect.clone(),
            operator: self.operator,
            store_in_attribute: self.store_in_attribute.clone(),
        })
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
