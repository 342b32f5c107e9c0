//! End-to-end checks of the COPC writer: write a cloud, read it back with a
//! stock LAS reader, compare the point multiset and audit the hierarchy.

use std::collections::HashMap;

use point_cloud_copc::{CopcOptions, CopcWriter};

fn header_pdrf6() -> las::Header {
    let mut builder = las::Builder::from((1, 4));
    builder.point_format = las::point::Format::new(6).unwrap();
    builder.into_header().unwrap()
}

/// Deterministic pseudo-random coordinates.
fn lcg(state: &mut u64) -> f64 {
    *state = state
        .wrapping_mul(6364136223846793005)
        .wrapping_add(1442695040888963407);
    (*state >> 11) as f64 / (1u64 << 53) as f64
}

fn synthetic_points(n: usize) -> Vec<las::Point> {
    let mut state = 99u64;
    (0..n)
        .map(|i| las::Point {
            x: (lcg(&mut state) * 1000.0 * 1000.0).round() / 1000.0,
            y: (lcg(&mut state) * 1000.0 * 1000.0).round() / 1000.0,
            z: (lcg(&mut state) * 50.0 * 1000.0).round() / 1000.0,
            gps_time: Some(i as f64 * 0.001),
            return_number: 1,
            number_of_returns: 1,
            ..Default::default()
        })
        .collect()
}

fn key_of(p: &las::Point) -> (i64, i64, i64) {
    (
        (p.x * 1000.0).round() as i64,
        (p.y * 1000.0).round() as i64,
        (p.z * 1000.0).round() as i64,
    )
}

#[test]
fn write_then_read_back_same_multiset() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cloud.copc.laz");

    let points = synthetic_points(5000);
    let mut expected: HashMap<(i64, i64, i64), usize> = HashMap::new();
    for p in &points {
        *expected.entry(key_of(p)).or_insert(0) += 1;
    }

    let mut writer =
        CopcWriter::from_path(&path, header_pdrf6(), CopcOptions::default()).unwrap();
    for p in points {
        writer.write_point(p).unwrap();
    }
    writer.close().unwrap();

    // Hierarchy bookkeeping: counts add up, data offsets strictly increase.
    let hierarchy = writer.hierarchy();
    let total: i64 = hierarchy.iter().map(|e| e.point_count as i64).sum();
    assert_eq!(total, 5000);
    let mut offsets: Vec<u64> = hierarchy
        .iter()
        .filter(|e| e.byte_size > 0)
        .map(|e| e.offset)
        .collect();
    let sorted = {
        let mut s = offsets.clone();
        s.sort_unstable();
        s.dedup();
        s
    };
    offsets.sort_unstable();
    assert_eq!(offsets, sorted, "chunk offsets must be distinct");

    // Read back with the stock reader and compare the multiset.
    let mut reader = las::Reader::from_path(&path).unwrap();
    let mut seen: HashMap<(i64, i64, i64), usize> = HashMap::new();
    let mut n = 0usize;
    for p in reader.points() {
        let p = p.unwrap();
        *seen.entry(key_of(&p)).or_insert(0) += 1;
        n += 1;
    }
    assert_eq!(n, 5000);
    assert_eq!(seen, expected);
}

#[test]
fn per_octant_points_are_time_sorted() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sorted.copc.laz");

    // Shuffle-resistant check: gps times are distinct, so after the writer
    // shuffles and re-sorts per octant, a single-octant file must come back
    // in time order.
    let points = synthetic_points(500);
    let mut writer = CopcWriter::from_path(
        &path,
        header_pdrf6(),
        CopcOptions { max_depth: 0, ..Default::default() },
    )
    .unwrap();
    for p in points {
        writer.write_point(p).unwrap();
    }
    writer.close().unwrap();
    assert_eq!(writer.hierarchy().len(), 1);

    let mut reader = las::Reader::from_path(&path).unwrap();
    let times: Vec<f64> = reader
        .points()
        .map(|p| p.unwrap().gps_time.unwrap())
        .collect();
    assert!(times.windows(2).all(|w| w[0] <= w[1]));
}

#[test]
fn small_octant_promotion_keeps_zero_entries_internal() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("promoted.copc.laz");

    // A tiny occupancy grid forces points down the tree; small deep octants
    // are then folded back up. Zero-sized entries stand in for erased
    // internal octants so readers can still navigate child pointers.
    let points = synthetic_points(3000);
    let mut writer = CopcWriter::from_path(
        &path,
        header_pdrf6(),
        CopcOptions {
            grid_size: 2,
            max_depth: 2,
            min_points_per_octant: 100,
            ..Default::default()
        },
    )
    .unwrap();
    for p in points {
        writer.write_point(p).unwrap();
    }
    writer.close().unwrap();

    let hierarchy = writer.hierarchy();
    let total: i64 = hierarchy.iter().map(|e| e.point_count as i64).sum();
    assert_eq!(total, 3000, "promotion must not lose points");
    for entry in hierarchy.iter().filter(|e| e.byte_size == 0) {
        assert!(
            entry.key.depth < 2,
            "zero-sized entries only stand in for internal octants"
        );
        assert_eq!(entry.point_count, 0);
    }

    // The file still reads in full.
    let mut reader = las::Reader::from_path(&path).unwrap();
    assert_eq!(reader.points().count(), 3000);
}
