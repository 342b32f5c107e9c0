//! Pipeline parsing: the JSON stage list becomes a vector of stage objects
//! plus the catalog configuration carried by the reader.

use std::path::PathBuf;

use point_cloud_core::{Circle, PointFilter, Rectangle};
use point_cloud_ground::PtdParameters;
use serde_json::Value;

use crate::drawflow;
use crate::error::{PipelineError, Result};
use crate::options::ProcessingOptions;
use crate::reader::ReaderStage;
use crate::stage::{Stage, StageCommon};
use crate::stages::boundaries::BoundariesStage;
use crate::stages::classify_ptd::ClassifyPtdStage;
use crate::stages::local_maximum::LocalMaximumStage;
use crate::stages::rasterize::{Metric, RasterizeStage};
use crate::stages::region_growing::RegionGrowingStage;
use crate::stages::sampling::{SamplingMode, SamplingStage};
use crate::stages::stop_if::StopIfOutsideStage;
use crate::stages::summary::SummaryStage;
use crate::stages::transform_with::{Operator, TransformWithStage};
use crate::stages::triangulate::TriangulateStage;
use crate::stages::write_copc::WriteCopcStage;
use crate::stages::write_las::WriteLasStage;
use crate::stages::write_lax::WriteLaxStage;
use crate::stages::write_pcd::WritePcdStage;
use crate::stages::write_vpc::WriteVpcStage;

/// What the catalog needs from the reader entry.
#[derive(Debug, Default, Clone)]
pub struct CatalogConfig {
    pub files: Vec<PathBuf>,
    pub buffer: f64,
    pub rect_queries: Vec<Rectangle>,
    pub circle_queries: Vec<Circle>,
}

pub struct ParsedPipeline {
    pub stages: Vec<Box<dyn Stage>>,
    pub options: ProcessingOptions,
    pub catalog: CatalogConfig,
}

impl std::fmt::Debug for ParsedPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParsedPipeline")
            .field("stages", &self.stages.len())
            .field("options", &self.options)
            .field("catalog", &self.catalog)
            .finish()
    }
}

pub fn parse(doc: &Value) -> Result<ParsedPipeline> {
    // The graph form is converted before anything else.
    let linearized;
    let doc = if doc.get("drawflow").is_some() {
        linearized = drawflow::linearize(doc)?;
        &linearized
    } else {
        doc
    };

    let options = ProcessingOptions::from_json(doc.get("processing").unwrap_or(&Value::Null))?;
    let pipeline = doc
        .get("pipeline")
        .and_then(|v| v.as_array())
        .ok_or(PipelineError::MissingKey("pipeline"))?;

    let mut catalog = CatalogConfig {
        files: options.files.clone(),
        buffer: options.buffer,
        ..Default::default()
    };

    let mut stages: Vec<Box<dyn Stage>> = Vec::with_capacity(pipeline.len());
    // (uid, algoname) of parsed stages, for connection checks.
    let mut seen: Vec<(String, String)> = Vec::new();

    for (i, entry) in pipeline.iter().enumerate() {
        let name = entry
            .get("algoname")
            .and_then(|v| v.as_str())
            .ok_or(PipelineError::MissingKey("algoname"))?;

        // The implicit catalog builder only carries the file list and the
        // user buffer; it does not become a stage object.
        if name == "build_catalog" {
            if let Some(files) = entry.get("files").and_then(|v| v.as_array()) {
                catalog.files = files
                    .iter()
                    .filter_map(|f| f.as_str())
                    .map(PathBuf::from)
                    .collect();
            }
            catalog.buffer = get_f64(entry, "buffer", catalog.buffer);
            continue;
        }

        let is_first = stages.is_empty();
        if is_first && name != "reader_las" {
            return Err(PipelineError::ReaderNotFirst);
        }
        if !is_first && name == "reader_las" {
            return Err(PipelineError::ReaderNotFirst);
        }

        let uid = entry
            .get("uid")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("stage_{i}"));

        let mut common = StageCommon::with_uid(&uid);
        common.output = entry
            .get("output")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        common.filter = parse_filter(entry)?;

        let stage: Box<dyn Stage> = match name {
            "reader_las" => {
                catalog.buffer = get_f64(entry, "buffer", catalog.buffer);
                if let Some(files) = entry.get("files").and_then(|v| v.as_array()) {
                    catalog.files = files
                        .iter()
                        .filter_map(|f| f.as_str())
                        .map(PathBuf::from)
                        .collect();
                }
                parse_queries(entry, &mut catalog);
                Box::new(ReaderStage::new(common))
            }
            "rasterize" => {
                let res = get_f64(entry, "res", 1.0);
                let window = get_f64(entry, "window", res);
                let connect = match entry.get("connect").and_then(|v| v.as_str()) {
                    Some(target) => {
                        let producer = resolve(&seen, target)?;
                        if producer != "triangulate" {
                            return Err(PipelineError::IncompatibleConnection("rasterize"));
                        }
                        Some(target.to_string())
                    }
                    None => None,
                };
                let metrics = match entry.get("method") {
                    Some(Value::Array(a)) => a
                        .iter()
                        .filter_map(|v| v.as_str())
                        .map(Metric::parse)
                        .collect::<Result<Vec<_>>>()?,
                    Some(Value::String(s)) => vec![Metric::parse(s)?],
                    _ => vec![Metric::Max],
                };
                Box::new(RasterizeStage::new(common, res, window, metrics, connect))
            }
            "triangulate" => {
                let max_edge = get_f64(entry, "max_edge", 0.0);
                let use_attribute = entry
                    .get("use_attribute")
                    .and_then(|v| v.as_str())
                    .unwrap_or("Z")
                    .to_string();
                Box::new(TriangulateStage::new(common, max_edge, use_attribute))
            }
            "classify_ptd" => {
                let params = PtdParameters {
                    seed_resolution: get_f64(entry, "res", 5.0),
                    max_iteration_angle: get_f64(entry, "angle", 30.0),
                    max_iteration_distance: get_f64(entry, "distance", 1.0),
                    min_triangle_size: get_f64(entry, "min_size", 0.5),
                    buffer_size: get_f64(entry, "buffer_size", 30.0),
                    max_iter: get_f64(entry, "max_iter", 100.0) as usize,
                    rng_seed: get_f64(entry, "seed", 0.0) as u64,
                };
                let class_code = get_f64(entry, "class", 2.0) as u8;
                Box::new(ClassifyPtdStage::new(common, params, class_code))
            }
            "local_maximum" => {
                let ws = get_f64(entry, "ws", 5.0);
                let min_height = get_f64(entry, "min_height", 2.0);
                Box::new(LocalMaximumStage::new(common, ws, min_height))
            }
            "region_growing" => {
                let seeds = entry
                    .get("connect1")
                    .or_else(|| entry.get("connect"))
                    .and_then(|v| v.as_str())
                    .ok_or(PipelineError::MissingKey("connect1"))?;
                if resolve(&seen, seeds)? != "local_maximum" {
                    return Err(PipelineError::IncompatibleConnection("region_growing"));
                }
                let chm = entry
                    .get("connect2")
                    .and_then(|v| v.as_str())
                    .ok_or(PipelineError::MissingKey("connect2"))?;
                if resolve(&seen, chm)? != "rasterize" {
                    return Err(PipelineError::IncompatibleConnection("region_growing"));
                }
                Box::new(RegionGrowingStage::new(
                    common,
                    get_f64(entry, "th_tree", 2.0),
                    get_f64(entry, "th_seed", 0.45),
                    get_f64(entry, "th_crown", 0.55),
                    get_f64(entry, "max_cr", 20.0),
                    seeds.to_string(),
                    chm.to_string(),
                ))
            }
            "transform_with" => {
                let connect = entry
                    .get("connect")
                    .and_then(|v| v.as_str())
                    .ok_or(PipelineError::MissingKey("connect"))?;
                let producer = resolve(&seen, connect)?;
                if producer != "triangulate" && producer != "rasterize" {
                    return Err(PipelineError::IncompatibleConnection("transform_with"));
                }
                let operator =
                    Operator::parse(entry.get("operator").and_then(|v| v.as_str()).unwrap_or("-"))?;
                let store = entry
                    .get("store_in_attribute")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();
                Box::new(TransformWithStage::new(common, connect.to_string(), operator, store))
            }
            "sampling_voxel" => {
                Box::new(SamplingStage::new(common, SamplingMode::Voxel, get_f64(entry, "res", 2.0)))
            }
            "sampling_pixel" => {
                Box::new(SamplingStage::new(common, SamplingMode::Pixel, get_f64(entry, "res", 2.0)))
            }
            "summary" => Box::new(SummaryStage::new(
                common,
                get_f64(entry, "zwbin", 2.0),
                get_f64(entry, "iwbin", 64.0),
            )),
            "boundaries" => {
                let connect = match entry.get("connect").and_then(|v| v.as_str()) {
                    Some(target) => {
                        if resolve(&seen, target)? != "triangulate" {
                            return Err(PipelineError::IncompatibleConnection("boundaries"));
                        }
                        Some(target.to_string())
                    }
                    None => None,
                };
                Box::new(BoundariesStage::new(common, connect))
            }
            "stop_if_outside" => {
                let bbox = Rectangle::new(
                    get_f64(entry, "xmin", f64::NEG_INFINITY),
                    get_f64(entry, "ymin", f64::NEG_INFINITY),
                    get_f64(entry, "xmax", f64::INFINITY),
                    get_f64(entry, "ymax", f64::INFINITY),
                );
                Box::new(StopIfOutsideStage::new(common, bbox))
            }
            "write_las" => Box::new(WriteLasStage::new(common)),
            "write_pcd" => Box::new(WritePcdStage::new(common)),
            "write_copc" => {
                let mut copc = point_cloud_copc::CopcOptions::default();
                if let Some(depth) = entry.get("max_depth").and_then(|v| v.as_i64()) {
                    copc.max_depth = depth as i32;
                }
                if let Some(density) = entry.get("density").and_then(|v| v.as_u64()) {
                    copc.grid_size = density as usize;
                }
                Box::new(WriteCopcStage::new(common, copc))
            }
            "write_vpc" => Box::new(WriteVpcStage::new(common)),
            "write_lax" => Box::new(WriteLaxStage::new(common)),
            other => return Err(PipelineError::UnknownStage(other.to_string())),
        };

        seen.push((uid, name.to_string()));
        stages.push(stage);
    }

    if stages.is_empty() {
        return Err(PipelineError::MissingKey("pipeline"));
    }

    Ok(ParsedPipeline { stages, options, catalog })
}

/// Resolve a `connect` uid against the stages parsed so far; the reference
/// must point backwards.
fn resolve<'a>(seen: &'a [(String, String)], uid: &str) -> Result<&'a str> {
    seen.iter()
        .find(|(u, _)| u == uid)
        .map(|(_, name)| name.as_str())
        .ok_or(PipelineError::UnknownUid)
}

fn get_f64(entry: &Value, key: &str, default: f64) -> f64 {
    entry.get(key).and_then(|v| v.as_f64()).unwrap_or(default)
}

fn parse_filter(entry: &Value) -> Result<PointFilter> {
    let expr = match entry.get("filter") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(a)) => a
            .iter()
            .filter_map(|v| v.as_str())
            .collect::<Vec<_>>()
            .join(" "),
        _ => String::new(),
    };
    Ok(PointFilter::parse(&expr)?)
}

/// Queries attached to the reader: circles (`xcenter`/`ycenter`/`radius`)
/// and rectangles (`xmin`/`ymin`/`xmax`/`ymax`), element-wise.
fn parse_queries(entry: &Value, catalog: &mut CatalogConfig) {
    let vec_of = |key: &str| -> Vec<f64> {
        match entry.get(key) {
            Some(Value::Array(a)) => a.iter().filter_map(|v| v.as_f64()).collect(),
            Some(Value::Number(n)) => n.as_f64().map(|v| vec![v]).unwrap_or_default(),
            _ => Vec::new(),
        }
    };

    let xc = vec_of("xcenter");
    let yc = vec_of("ycenter");
    let r = vec_of("radius");
    for i in 0..xc.len().min(yc.len()).min(r.len()) {
        catalog.circle_queries.push(Circle::new(xc[i], yc[i], r[i]));
    }

    let xmin = vec_of("xmin");
    let ymin = vec_of("ymin");
    let xmax = vec_of("xmax");
    let ymax = vec_of("ymax");
    let n = xmin.len().min(ymin.len()).min(xmax.len()).min(ymax.len());
    for i in 0..n {
        catalog
            .rect_queries
            .push(Rectangle::new(xmin[i], ymin[i], xmax[i], ymax[i]));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn minimal_pipeline() {
        let doc = json!({
            "processing": { "files": ["a.laz"] },
            "pipeline": [
                { "algoname": "reader_las", "uid": "aaa", "output": "", "filter": "" },
                { "algoname": "write_las", "uid": "bbb", "output": "out.laz", "filter": "" }
            ]
        });
        let parsed = parse(&doc).unwrap();
        assert_eq!(parsed.stages.len(), 2);
        assert_eq!(parsed.stages[0].name(), "reader_las");
        assert_eq!(parsed.catalog.files, vec![PathBuf::from("a.laz")]);
    }

    #[test]
    fn reader_must_come_first() {
        let doc = json!({
            "pipeline": [
                { "algoname": "write_las", "uid": "bbb", "output": "out.laz" }
            ]
        });
        assert!(matches!(parse(&doc), Err(PipelineError::ReaderNotFirst)));
    }

    #[test]
    fn unknown_uid_is_reported_verbatim() {
        let doc = json!({
            "pipeline": [
                { "algoname": "reader_las", "uid": "aaa" },
                { "algoname": "triangulate", "uid": "t1" },
                { "algoname": "rasterize", "uid": "r1", "res": 5.0, "connect": "nope" }
            ]
        });
        let err = parse(&doc).unwrap_err();
        assert_eq!(err.to_string(), "Cannot find stage with this uid");
    }

    #[test]
    fn forward_references_are_rejected() {
        let doc = json!({
            "pipeline": [
                { "algoname": "reader_las", "uid": "aaa" },
                { "algoname": "rasterize", "uid": "r1", "res": 5.0, "connect": "t1" },
                { "algoname": "triangulate", "uid": "t1" }
            ]
        });
        assert!(matches!(parse(&doc), Err(PipelineError::UnknownUid)));
    }

    #[test]
    fn incompatible_connection() {
        let doc = json!({
            "pipeline": [
                { "algoname": "reader_las", "uid": "aaa" },
                { "algoname": "write_las", "uid": "w1", "output": "x.laz" },
                { "algoname": "rasterize", "uid": "r1", "res": 5.0, "connect": "w1" }
            ]
        });
        assert!(matches!(
            parse(&doc),
            Err(PipelineError::IncompatibleConnection("rasterize"))
        ));
    }

    #[test]
    fn queries_on_the_reader() {
        let doc = json!({
            "pipeline": [
                { "algoname": "reader_las", "uid": "aaa",
                  "xcenter": [100.0], "ycenter": [100.0], "radius": [25.0] }
            ]
        });
        let parsed = parse(&doc).unwrap();
        assert_eq!(parsed.catalog.circle_queries.len(), 1);
        assert_eq!(parsed.catalog.circle_queries[0].radius, 25.0);
    }

    #[test]
    fn unknown_stage_name() {
        let doc = json!({
            "pipeline": [
                { "algoname": "reader_las", "uid": "aaa" },
                { "algoname": "frobnicate", "uid": "zzz" }
            ]
        });
        assert!(matches!(parse(&doc), Err(PipelineError::UnknownStage(_))));
    }
}
