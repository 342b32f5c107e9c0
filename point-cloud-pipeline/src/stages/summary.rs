//! Streamable summary: point counts per return and class, z and intensity
//! histograms. Worker clones merge by summing.

use std::any::Any;
use std::collections::BTreeMap;

use point_cloud_core::{Header, Point, PointCloud};
use serde_json::json;

use crate::error::Result;
use crate::stage::{ChunkContext, Flow, Stage, StageCommon};

pub struct SummaryStage {
    common: StageCommon,
    /// Bin width of the elevation histogram.
    zwbin: f64,
    /// Bin width of the intensity histogram.
    iwbin: f64,
    npoints: u64,
    npoints_per_return: [u64; 15],
    npoints_per_class: BTreeMap<u8, u64>,
    z_histogram: BTreeMap<i64, u64>,
    i_histogram: BTreeMap<i64, u64>,
}

impl SummaryStage {
    pub fn new(common: StageCommon, zwbin: f64, iwbin: f64) -> Self {
        Self {
            common,
            zwbin: if zwbin > 0.0 { zwbin } else { 2.0 },
            iwbin: if iwbin > 0.0 { iwbin } else { 64.0 },
            npoints: 0,
            npoints_per_return: [0; 15],
            npoints_per_class: BTreeMap::new(),
            z_histogram: BTreeMap::new(),
            i_histogram: BTreeMap::new(),
        }
    }

    fn account(&mut self, p: &Point) {
        if p.is_buffer {
            return;
        }
        self.npoints += 1;
        if (1..=15).contains(&p.return_number) {
            self.npoints_per_return[p.return_number as usize - 1] += 1;
        }
        *self.npoints_per_class.entry(p.classification).or_insert(0) += 1;
        *self
            .z_histogram
            .entry((p.z / self.zwbin).floor() as i64)
            .or_insert(0) += 1;
        *self
            .i_histogram
            .entry((p.intensity as f64 / self.iwbin).floor() as i64)
            .or_insert(0) += 1;
    }

    fn report(&self) -> serde_json::Value {
        json!({
            "npoints": self.npoints,
            "npoints_per_return": self.npoints_per_return,
            "npoints_per_class": self
                .npoints_per_class
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect::<BTreeMap<String, u64>>(),
            "z_histogram": self
                .z_histogram
                .iter()
                .map(|(bin, n)| (format!("{}", *bin as f64 * self.zwbin), *n))
                .collect::<BTreeMap<String, u64>>(),
            "i_histogram": self
                .i_histogram
                .iter()
                .map(|(bin, n)| (format!("{}", *bin as f64 * self.iwbin), *n))
                .collect::<BTreeMap<String, u64>>(),
        })
    }
}

impl Stage for SummaryStage {
    fn name(&self) -> &'static str {
        "summary"
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

    fn process_point(&mut self, point: &mut Option<Point>, header: &Header) -> Result<()> {
        if let Some(p) = point {
            if !self.common.filter.is_empty() && !self.common.filter.keep(p, header)? {
                return Ok(());
            }
            let p = p.clone();
            self.account(&p);
        }
        Ok(())
    }

    fn process_cloud(&mut self, cloud: &mut PointCloud, _ctx: &mut ChunkContext) -> Result<Flow> {
        let header = cloud.header.clone();
        let indices: Vec<usize> = cloud.iter_live().map(|(i, _)| i).collect();
        for i in indices {
            let p = cloud.points[i].clone();
            if !self.common.filter.is_empty() && !self.common.filter.keep(&p, &header)? {
                continue;
            }
            self.account(&p);
        }
        self.common.filter.reset();
        Ok(Flow::Continue)
    }

    fn clear(&mut self, last: bool) -> Result<()> {
        if last {
            if let Some(path) = self.common.merged_output_path() {
                std::fs::write(&path, serde_json::to_string_pretty(&self.report())?)?;
            } else if self.common.output.is_empty() {
                log::info!("summary: {}", self.report());
            }
        }
        Ok(())
    }

    fn merge(&mut self, other: &mut dyn Stage) -> Result<()> {
        if let Some(other) = other.as_any_mut().downcast_mut::<Self>() {
            self.npoints += other.npoints;
            for (a, b) in self
                .npoints_per_return
                .iter_mut()
                .zip(other.npoints_per_return.iter())
            {
                *a += b;
            }
            for (k, v) in &other.npoints_per_class {
                *self.npoints_per_class.entry(*k).or_insert(0) += v;
            }
            for (k, v) in &other.z_histogram {
                *self.z_histogram.entry(*k).or_insert(0) += v;
            }
            for (k, v) in &other.i_histogram {
                *self.i_histogram.entry(*k).or_insert(0) += v;
            }
        }
        Ok(())
    }

    fn clone_stage(&self) -> Box<dyn Stage> {
        Box::new(SummaryStage {
            common: self.common.clone(),
            zwbin: self.zwbin,
            iwbin: self.iwbin,
            npoints: 0,
            npoints_per_return: [0; 15],
            npoints_per_class: BTreeMap::new(),
            z_histogram: BTreeMap::new(),
            i_histogram: BTreeMap::new(),
        })
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
