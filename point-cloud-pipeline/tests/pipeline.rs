//! End-to-end pipeline scenarios over synthetic LAS tiles.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::json;

/// Write a square tile of points on a regular grid. `z` receives world
/// coordinates.
fn write_tile(
    path: &Path,
    x0: f64,
    y0: f64,
    side: f64,
    spacing: f64,
    z: impl Fn(f64, f64) -> f64,
) {
    let mut builder = las::Builder::from((1, 4));
    builder.point_format = las::point::Format::new(6).unwrap();
    let header = builder.into_header().unwrap();
    let mut writer = las::Writer::from_path(path, header).unwrap();

    let n = (side / spacing) as usize;
    let mut t = 0.0;
    for i in 0..n {
        for j in 0..n {
            let x = x0 + spacing / 2.0 + i as f64 * spacing;
            let y = y0 + spacing / 2.0 + j as f64 * spacing;
            writer
                .write_point(las::Point {
                    x,
                    y,
                    z: z(x, y),
                    gps_time: Some(t),
                    return_number: 1,
                    number_of_returns: 1,
                    ..Default::default()
                })
                .unwrap();
            t += 0.001;
        }
    }
    writer.close().unwrap();
}

fn read_asc(path: &Path) -> (usize, usize, Vec<f32>) {
    let text = fs::read_to_string(path).unwrap();
    let mut ncols = 0;
    let mut nrows = 0;
    let mut values = Vec::new();
    for line in text.lines() {
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("ncols") => ncols = parts.next().unwrap().parse().unwrap(),
            Some("nrows") => nrows = parts.next().unwrap().parse().unwrap(),
            Some("xllcorner") | Some("yllcorner") | Some("cellsize")
            | Some("NODATA_value") => {}
            Some(first) => {
                values.push(first.parse().unwrap());
                for v in parts {
                    values.push(v.parse().unwrap());
                }
            }
            None => {}
        }
    }
    (nrows, ncols, values)
}

fn read_points(path: &Path) -> Vec<las::Point> {
    let mut reader = las::Reader::from_path(path).unwrap();
    reader.points().map(|p| p.unwrap()).collect()
}

/// Two tiles, one chunk per file, per-cell maximum (scenario S1).
#[test]
fn two_tiles_rasterize_max() {
    let dir = tempfile::tempdir().unwrap();
    let tile_a = dir.path().join("tile_a.las");
    let tile_b = dir.path().join("tile_b.las");
    write_tile(&tile_a, 0.0, 0.0, 1000.0, 5.0, |_, _| 1.0);
    write_tile(&tile_b, 1000.0, 0.0, 1000.0, 5.0, |_, _| 2.0);
    let out = dir.path().join("chm.asc");

    let doc = json!({
        "processing": {
            "files": [tile_a.to_str().unwrap(), tile_b.to_str().unwrap()],
            "progress": false,
        },
        "pipeline": [
            { "algoname": "reader_las", "uid": "r" },
            { "algoname": "rasterize", "uid": "z", "res": 10.0, "method": ["max"],
              "output": out.to_str().unwrap() }
        ]
    });

    point_cloud_pipeline::execute(&doc).unwrap();

    let (nrows, ncols, values) = read_asc(&out);
    assert_eq!(nrows, 100);
    assert_eq!(ncols, 200);
    // Left half of the mosaic comes from tile A (z = 1), right from B.
    assert_eq!(values[0], 1.0);
    assert_eq!(values[ncols - 1], 2.0);
    assert!(values.iter().all(|&v| v == 1.0 || v == 2.0));
}

/// Triangulation feeding a rasterizer across a tile boundary with buffer
/// (scenario S2): the mesh interpolant reproduces the plane on both sides.
#[test]
fn triangulate_then_rasterize_connected() {
    let dir = tempfile::tempdir().unwrap();
    let tile_a = dir.path().join("a.las");
    let tile_b = dir.path().join("b.las");
    write_tile(&tile_a, 0.0, 0.0, 200.0, 5.0, |x, _| x / 10.0);
    write_tile(&tile_b, 200.0, 0.0, 200.0, 5.0, |x, _| x / 10.0);
    let out = dir.path().join("dtm.asc");

    let doc = json!({
        "processing": {
            "files": [tile_a.to_str().unwrap(), tile_b.to_str().unwrap()],
            "buffer": 50.0,
            "progress": false,
        },
        "pipeline": [
            { "algoname": "reader_las", "uid": "r" },
            { "algoname": "triangulate", "uid": "t" },
            { "algoname": "rasterize", "uid": "z", "res": 5.0, "connect": "t",
              "output": out.to_str().unwrap() }
        ]
    });

    point_cloud_pipeline::execute(&doc).unwrap();

    let (nrows, ncols, values) = read_asc(&out);
    assert_eq!((nrows, ncols), (40, 80));
    // Cells near the shared edge x = 200 are interpolated seamlessly.
    let row = 20;
    for col in 35..45 {
        let v = values[row * ncols + col] as f64;
        let x = col as f64 * 5.0 + 2.5;
        assert!((v - x / 10.0).abs() < 0.2, "cell ({row}, {col}) = {v}");
    }
}

/// Ground classification end to end (scenario S3): flat terrain with
/// elevated outliers; ground gets the requested class, outliers become
/// noise.
#[test]
fn classify_ground_marks_outliers_as_noise() {
    let dir = tempfile::tempdir().unwrap();
    let tile = dir.path().join("ground.las");

    {
        let mut builder = las::Builder::from((1, 4));
        builder.point_format = las::point::Format::new(6).unwrap();
        let header = builder.into_header().unwrap();
        let mut writer = las::Writer::from_path(&tile, header).unwrap();
        let mut t = 0.0;
        for i in 0..50 {
            for j in 0..50 {
                let x = 1.0 + i as f64 * 2.0;
                let y = 1.0 + j as f64 * 2.0;
                // 2 % outliers hover five meters above the surface.
                let is_outlier = (i * 50 + j) % 50 == 25;
                let z = if is_outlier { 5.0 } else { (x / 30.0).sin() * 0.2 };
                writer
                    .write_point(las::Point {
                        x,
                        y,
                        z,
                        gps_time: Some(t),
                        return_number: 1,
                        number_of_returns: 1,
                        ..Default::default()
                    })
                    .unwrap();
                t += 0.001;
            }
        }
        writer.close().unwrap();
    }

    let out = dir.path().join("classified.las");
    let doc = json!({
        "processing": { "files": [tile.to_str().unwrap()], "progress": false },
        "pipeline": [
            { "algoname": "reader_las", "uid": "r" },
            { "algoname": "classify_ptd", "uid": "g",
              "distance": 1.0, "angle": 30.0, "res": 5.0, "min_size": 0.5, "class": 2 },
            { "algoname": "write_las", "uid": "w", "output": out.to_str().unwrap() }
        ]
    });

    point_cloud_pipeline::execute(&doc).unwrap();

    let points = read_points(&out);
    assert_eq!(points.len(), 2500);
    let ground_truth = points.iter().filter(|p| p.z < 1.0).count();
    let classified_ground = points
        .iter()
        .filter(|p| p.z < 1.0 && u8::from(p.classification) == 2)
        .count();
    assert!(
        classified_ground as f64 >= 0.95 * ground_truth as f64,
        "{classified_ground} of {ground_truth} ground points classified"
    );

    let outliers: Vec<_> = points.iter().filter(|p| p.z > 4.0).collect();
    let flagged = outliers
        .iter()
        .filter(|p| u8::from(p.classification) != 2)
        .count();
    assert!(
        flagged as f64 >= 0.9 * outliers.len() as f64,
        "{flagged} of {} outliers kept out of the ground class",
        outliers.len()
    );
}

/// Query-driven run (scenario S4): one circular query, one output file,
/// all points within the radius.
#[test]
fn circular_query_extracts_one_file() {
    let dir = tempfile::tempdir().unwrap();
    let tile = dir.path().join("tile.las");
    write_tile(&tile, 0.0, 0.0, 500.0, 2.0, |x, y| (x + y) / 100.0);
    let out = dir.path().join("extract_*.las");

    let doc = json!({
        "processing": { "files": [tile.to_str().unwrap()], "progress": false },
        "pipeline": [
            { "algoname": "reader_las", "uid": "r",
              "xcenter": [100.0], "ycenter": [100.0], "radius": [25.0] },
            { "algoname": "write_las", "uid": "w", "output": out.to_str().unwrap() }
        ]
    });

    point_cloud_pipeline::execute(&doc).unwrap();

    // The query chunk is named after the file containing its centroid.
    let produced: Vec<PathBuf> = fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .map(|n| n.to_string_lossy().starts_with("extract_"))
                .unwrap_or(false)
        })
        .collect();
    assert_eq!(produced.len(), 1);

    let points = read_points(&produced[0]);
    assert!(!points.is_empty());
    for p in &points {
        let d = ((p.x - 100.0).powi(2) + (p.y - 100.0).powi(2)).sqrt();
        assert!(d < 25.0, "point at {d:.2} m from the query center");
    }

    // The missing spatial index was written on the fly.
    assert!(tile.with_extension("lax").exists());
}

/// Unknown uid in a connection (scenario S6): parsing fails with the
/// documented message and nothing is written.
#[test]
fn unknown_uid_fails_before_any_output() {
    let dir = tempfile::tempdir().unwrap();
    let tile = dir.path().join("tile.las");
    write_tile(&tile, 0.0, 0.0, 100.0, 5.0, |_, _| 0.0);
    let out = dir.path().join("never.asc");

    let doc = json!({
        "processing": { "files": [tile.to_str().unwrap()], "progress": false },
        "pipeline": [
            { "algoname": "reader_las", "uid": "r" },
            { "algoname": "triangulate", "uid": "t" },
            { "algoname": "rasterize", "uid": "z", "res": 5.0, "connect": "missing",
              "output": out.to_str().unwrap() }
        ]
    });

    let err = point_cloud_pipeline::execute(&doc).unwrap_err();
    assert_eq!(err.to_string(), "Cannot find stage with this uid");
    assert!(!out.exists());
}

/// Chunk-order determinism (property 6): a parallel run with two workers
/// produces byte-identical merged output to a serial run.
#[test]
fn parallel_and_serial_outputs_match() {
    let dir = tempfile::tempdir().unwrap();
    let mut files = Vec::new();
    for i in 0..4 {
        let tile = dir.path().join(format!("t{i}.las"));
        write_tile(&tile, i as f64 * 100.0, 0.0, 100.0, 2.0, |x, y| (x * 0.01 + y * 0.02) % 7.0);
        files.push(tile.to_str().unwrap().to_string());
    }

    let run = |ncores: usize, out: &Path| {
        let doc = json!({
            "processing": {
                "files": files,
                "ncores": ncores,
                "strategy": "concurrent-files",
                "progress": false,
            },
            "pipeline": [
                { "algoname": "reader_las", "uid": "r" },
                { "algoname": "write_las", "uid": "w", "output": out.to_str().unwrap() }
            ]
        });
        point_cloud_pipeline::execute(&doc).unwrap();
    };

    let serial = dir.path().join("serial.las");
    let parallel = dir.path().join("parallel.las");
    run(1, &serial);
    run(3, &parallel);

    let a = fs::read(&serial).unwrap();
    let b = fs::read(&parallel).unwrap();
    assert_eq!(a, b, "parallel output differs from serial output");
}

/// Streamed summary over two tiles.
#[test]
fn summary_counts_points() {
    let dir = tempfile::tempdir().unwrap();
    let tile = dir.path().join("tile.las");
    write_tile(&tile, 0.0, 0.0, 100.0, 2.0, |_, _| 3.0);
    let out = dir.path().join("summary.json");

    let doc = json!({
        "processing": { "files": [tile.to_str().unwrap()], "progress": false },
        "pipeline": [
            { "algoname": "reader_las", "uid": "r" },
            { "algoname": "summary", "uid": "s", "output": out.to_str().unwrap() }
        ]
    });

    point_cloud_pipeline::execute(&doc).unwrap();

    let report: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&out).unwrap()).unwrap();
    assert_eq!(report["npoints"], 2500);
    assert_eq!(report["npoints_per_return"][0], 2500);
}

/// The drawflow graph form runs the same as the native form.
#[test]
fn drawflow_pipeline_executes() {
    let dir = tempfile::tempdir().unwrap();
    let tile = dir.path().join("tile.las");
    write_tile(&tile, 0.0, 0.0, 100.0, 5.0, |_, _| 1.0);
    let out = dir.path().join("chm.asc");

    let doc = json!({
        "processing": { "files": [tile.to_str().unwrap()], "progress": false },
        "drawflow": { "Home": { "data": {
            "1": { "name": "reader_las", "data": { "uid": "r" }, "inputs": {}, "outputs": {
                "output_1": { "connections": [ {"node": "2", "output": "input_1"} ] } } },
            "2": { "name": "rasterize",
                   "data": { "uid": "z", "res": 10.0, "output": out.to_str().unwrap() },
                   "inputs": { "input_1": { "connections": [ {"node": "1", "input": "output_1"} ] } },
                   "outputs": {} }
        }}}
    });

    point_cloud_pipeline::execute(&doc).unwrap();
    assert!(out.exists());
}
