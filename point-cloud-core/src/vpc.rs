//! Virtual point cloud manifest: a STAC-compatible FeatureCollection that
//! lists point cloud files with their bounding boxes, counts, CRS and
//! indexing state, so a catalog can be built without opening the files.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::catalog::FileInfo;
use crate::crs::Crs;
use crate::error::{CoreError, Result};
use crate::shapes::Rectangle;

const STAC_VERSION: &str = "1.0.0";
const POINTCLOUD_EXTENSION: &str =
    "https://stac-extensions.github.io/pointcloud/v1.0.0/schema.json";
const PROJECTION_EXTENSION: &str =
    "https://stac-extensions.github.io/projection/v1.1.0/schema.json";

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    #[serde(rename = "type")]
    kind: String,
    features: Vec<Feature>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Feature {
    #[serde(rename = "type")]
    kind: String,
    stac_version: String,
    #[serde(default)]
    stac_extensions: Vec<String>,
    id: String,
    #[serde(default)]
    links: Vec<Value>,
    assets: Assets,
    properties: Properties,
}

#[derive(Debug, Serialize, Deserialize)]
struct Assets {
    data: Asset,
}

#[derive(Debug, Serialize, Deserialize)]
struct Asset {
    href: String,
    #[serde(default)]
    roles: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Properties {
    datetime: String,
    #[serde(rename = "pc:count")]
    count: u64,
    #[serde(rename = "pc:type")]
    pc_type: String,
    #[serde(rename = "proj:bbox")]
    bbox: Vec<f64>,
    #[serde(rename = "proj:epsg", skip_serializing_if = "Option::is_none")]
    epsg: Option<u32>,
    #[serde(rename = "proj:wkt2", skip_serializing_if = "Option::is_none")]
    wkt2: Option<String>,
    #[serde(rename = "index:indexed", default)]
    indexed: bool,
}

/// Read a manifest into file descriptors. Relative hrefs are resolved
/// against the manifest's directory.
pub fn read_vpc(path: &Path) -> Result<Vec<FileInfo>> {
    let text = fs::read_to_string(path)?;
    let manifest: Manifest =
        serde_json::from_str(&text).map_err(|e| CoreError::MalformedVpc(e.to_string()))?;

    if manifest.kind != "FeatureCollection" {
        return Err(CoreError::MalformedVpc(
            "the input file is not a virtual point cloud file".to_string(),
        ));
    }

    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let mut files = Vec::with_capacity(manifest.features.len());

    for feature in &manifest.features {
        if feature.kind != "Feature" {
            return Err(CoreError::MalformedVpc(
                "'type' is not equal to 'Feature'".to_string(),
            ));
        }
        if feature.stac_version != STAC_VERSION {
            return Err(CoreError::StacVersion(feature.stac_version.clone()));
        }

        let bbox = &feature.properties.bbox;
        let rect = match bbox.len() {
            4 => Rectangle::new(bbox[0], bbox[1], bbox[2], bbox[3]),
            6 => Rectangle::new(bbox[0], bbox[1], bbox[3], bbox[4]),
            _ => {
                return Err(CoreError::MalformedVpc(
                    "proj:bbox should be 2D or 3D".to_string(),
                ))
            }
        };

        let mut crs = Crs::default();
        if let Some(epsg) = feature.properties.epsg {
            crs.epsg = epsg;
        }
        if let Some(wkt) = &feature.properties.wkt2 {
            crs.wkt = wkt.clone();
        }

        files.push(FileInfo {
            path: normalize(parent, &feature.assets.data.href),
            bbox: rect,
            npoints: feature.properties.count,
            crs,
            indexed: feature.properties.indexed,
            noprocess: false,
        });
    }

    Ok(files)
}

/// Serialise a catalog as a manifest next to `path`. File hrefs are written
/// relative to the manifest with forward slashes, bboxes with 3 decimals.
pub fn write_vpc(path: &Path, files: &[FileInfo], crs: &Crs) -> Result<()> {
    if path.extension().map(|e| e.to_ascii_lowercase()) != Some("vpc".into()) {
        return Err(CoreError::VpcExtension);
    }

    let parent = path.parent().unwrap_or_else(|| Path::new("."));

    let features = files
        .iter()
        .map(|f| {
            let stem = f.path.file_stem().unwrap_or_default().to_string_lossy().to_string();
            Feature {
                kind: "Feature".to_string(),
                stac_version: STAC_VERSION.to_string(),
                stac_extensions: vec![
                    POINTCLOUD_EXTENSION.to_string(),
                    PROJECTION_EXTENSION.to_string(),
                ],
                id: stem,
                links: Vec::new(),
                assets: Assets {
                    data: Asset {
                        href: relative_href(parent, &f.path),
                        roles: vec!["data".to_string()],
                    },
                },
                properties: Properties {
                    datetime: "0-01-01T00:00:00Z".to_string(),
                    count: f.npoints,
                    pc_type: "lidar".to_string(),
                    bbox: vec![
                        round3(f.bbox.xmin),
                        round3(f.bbox.ymin),
                        round3(f.bbox.xmax),
                        round3(f.bbox.ymax),
                    ],
                    epsg: (crs.epsg != 0).then_some(crs.epsg),
                    wkt2: (crs.epsg == 0 && !crs.wkt.is_empty()).then(|| crs.wkt.clone()),
                    indexed: f.indexed,
                },
            }
        })
        .collect();

    let manifest = Manifest { kind: "FeatureCollection".to_string(), features };
    fs::write(path, serde_json::to_string_pretty(&manifest)?)?;
    Ok(())
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

fn normalize(parent: &Path, href: &str) -> PathBuf {
    let p = Path::new(href);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        let mut out = parent.to_path_buf();
        for comp in p.components() {
            match comp {
                std::path::Component::CurDir => {}
                std::path::Component::ParentDir => {
                    out.pop();
                }
                other => out.push(other),
            }
        }
        out
    }
}

fn relative_href(parent: &Path, file: &Path) -> String {
    let rel = file.strip_prefix(parent).unwrap_or(file);
    let joined = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect::<Vec<_>>()
        .join("/");
    format!("./{joined}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(dir: &Path, name: &str) -> FileInfo {
        FileInfo {
            path: dir.join(name),
            bbox: Rectangle::new(0.12345, 1.0, 1000.98765, 999.5),
            npoints: 123456,
            crs: Crs::default(),
            indexed: true,
            noprocess: false,
        }
    }

    #[test]
    fn round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let vpc = dir.path().join("catalog.vpc");
        let files = vec![descriptor(dir.path(), "tile_a.laz"), descriptor(dir.path(), "tile_b.laz")];

        write_vpc(&vpc, &files, &Crs::from_epsg(2154)).unwrap();
        let text = fs::read_to_string(&vpc).unwrap();
        assert!(text.contains("\"proj:epsg\": 2154"));
        assert!(text.contains("./tile_a.laz"));
        // bbox has been rounded to 3 decimals
        assert!(text.contains("1000.988"));

        let read = read_vpc(&vpc).unwrap();
        assert_eq!(read.len(), 2);
        assert_eq!(read[0].npoints, 123456);
        assert!(read[0].indexed);
        assert_eq!(read[0].crs.epsg, 2154);
        assert_eq!(read[0].path, dir.path().join("tile_a.laz"));
    }

    #[test]
    fn wrong_extension_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = write_vpc(&dir.path().join("catalog.json"), &[], &Crs::default());
        assert!(matches!(err, Err(CoreError::VpcExtension)));
    }

    #[test]
    fn wrong_stac_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let vpc = dir.path().join("catalog.vpc");
        fs::write(
            &vpc,
            r#"{"type":"FeatureCollection","features":[{"type":"Feature",
                "stac_version":"0.9.0","id":"x","links":[],
                "assets":{"data":{"href":"./x.laz","roles":["data"]}},
                "properties":{"datetime":"0","pc:count":1,"pc:type":"lidar",
                              "proj:bbox":[0,0,1,1]}}]}"#,
        )
        .unwrap();
        assert!(matches!(read_vpc(&vpc), Err(CoreError::StacVersion(_))));
    }
}
