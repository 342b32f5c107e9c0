//! File catalog and chunk partitioner.
//!
//! The catalog discovers the input files, harvests their headers (or reads a
//! virtual point cloud manifest instead), indexes their rectangles in an
//! R-tree and partitions the coverage into buffered chunks: one per file,
//! one per tile of a regular grid, or one per spatial query.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use rstar::{RTree, RTreeObject, AABB};

use crate::chunk::{Chunk, ChunkShape};
use crate::crs::Crs;
use crate::error::{CoreError, Result};
use crate::grid::Grid;
use crate::header::Header;
use crate::progress::Progress;
use crate::shapes::{Circle, Rectangle, Shape};
use crate::vpc;

/// Descriptor of one input file.
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub path: PathBuf,
    pub bbox: Rectangle,
    pub npoints: u64,
    pub crs: Crs,
    /// Whether a spatial index is available (`.lax` sidecar or COPC).
    pub indexed: bool,
    /// Buffer-only flag: the file is read but never processed.
    pub noprocess: bool,
}

/// R-tree entry: a file rectangle remembering its catalog position.
#[derive(Debug, Clone)]
struct TileEntry {
    index: usize,
    bbox: Rectangle,
}

impl RTreeObject for TileEntry {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_corners(
            [self.bbox.xmin, self.bbox.ymin],
            [self.bbox.xmax, self.bbox.ymax],
        )
    }
}

#[derive(Debug)]
enum PathKind {
    LasFile,
    VpcFile,
    LaxFile,
    Directory,
    Missing,
    Other,
}

fn classify(path: &Path) -> PathKind {
    if !path.exists() {
        return PathKind::Missing;
    }
    if path.is_dir() {
        return PathKind::Directory;
    }
    match path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .as_deref()
    {
        Some("las") | Some("laz") => PathKind::LasFile,
        Some("vpc") => PathKind::VpcFile,
        Some("lax") => PathKind::LaxFile,
        _ => PathKind::Other,
    }
}

/// The catalog of input files and the chunk partitioner built over it.
#[derive(Debug, Default)]
pub struct FileCollection {
    files: Vec<FileInfo>,
    pub crs: Crs,
    epsg_set: BTreeSet<u32>,
    wkt_set: BTreeSet<String>,
    bbox: Rectangle,
    buffer: f64,
    chunk_size: f64,
    queries: Vec<Shape>,
    rtree: Option<RTree<TileEntry>>,
    tiles: Vec<Rectangle>,
}

impl FileCollection {
    pub fn new() -> Self {
        Self { bbox: Rectangle::empty(), ..Default::default() }
    }

    /// Discover the inputs. Directories are scanned for las/laz files, a
    /// manifest replaces header scanning, anything else is an error. A
    /// manifest mixed with other inputs is rejected.
    pub fn read(&mut self, paths: &[PathBuf], progress: &Progress) -> Result<()> {
        let pb = progress.subprocess(paths.len() as u64, "Read file headers");

        for path in paths {
            pb.inc(1);
            match classify(path) {
                PathKind::LasFile => self.add_file(path.clone(), false)?,
                PathKind::VpcFile => {
                    if paths.len() > 1 {
                        return Err(CoreError::MixedManifest);
                    }
                    for info in vpc::read_vpc(path)? {
                        self.add_epsg(info.crs.epsg);
                        self.add_wkt(&info.crs.wkt);
                        self.bbox.merge(&info.bbox);
                        self.files.push(info);
                    }
                }
                PathKind::LaxFile => {} // sidecar of a las file, nothing to do
                PathKind::Directory => {
                    let mut entries: Vec<PathBuf> = std::fs::read_dir(path)?
                        .filter_map(|e| e.ok())
                        .map(|e| e.path())
                        .filter(|p| matches!(classify(p), PathKind::LasFile))
                        .collect();
                    entries.sort();
                    for entry in entries {
                        self.add_file(entry, false)?;
                    }
                }
                PathKind::Missing => return Err(CoreError::FileNotFound(path.clone())),
                PathKind::Other => return Err(CoreError::UnknownFileType(path.clone())),
            }
        }

        pb.done();
        self.resolve_crs();
        Ok(())
    }

    /// Open one LAS/LAZ header and register the file.
    pub fn add_file(&mut self, path: PathBuf, noprocess: bool) -> Result<()> {
        let reader = las::Reader::from_path(&path)
            .map_err(|source| CoreError::LasOpen { path: path.clone(), source })?;
        let header = Header::from_las(reader.header());

        let is_copc = reader
            .header()
            .vlrs()
            .iter()
            .any(|v| v.user_id.eq_ignore_ascii_case("copc") && v.record_id == 1);
        let has_lax = path.with_extension("lax").exists();

        self.add_epsg(header.crs.epsg);
        self.add_wkt(&header.crs.wkt);
        self.bbox.merge(&header.bbox);
        self.files.push(FileInfo {
            path,
            bbox: header.bbox,
            npoints: header.npoints,
            crs: header.crs,
            indexed: is_copc || has_lax,
            noprocess,
        });
        Ok(())
    }

    fn add_epsg(&mut self, epsg: u32) {
        if epsg != 0 {
            self.epsg_set.insert(epsg);
        }
    }

    fn add_wkt(&mut self, wkt: &str) {
        if !wkt.is_empty() {
            self.wkt_set.insert(wkt.to_string());
        }
    }

    /// Keep the first CRS, warn about conflicts; EPSG takes precedence.
    fn resolve_crs(&mut self) {
        if self.epsg_set.len() > 1 {
            log::warn!("mix epsg found. First one retained");
        }
        if self.wkt_set.len() > 1 {
            log::warn!("mix wkt crs found. First one retained");
        }
        if let Some(&epsg) = self.epsg_set.iter().next() {
            self.crs = Crs::from_epsg(epsg);
        } else if let Some(wkt) = self.wkt_set.iter().next() {
            self.crs = Crs::from_wkt(wkt.clone());
        }
    }

    pub fn set_buffer(&mut self, buffer: f64) {
        self.buffer = buffer.max(0.0);
    }

    pub fn buffer(&self) -> f64 {
        self.buffer
    }

    /// `0` means one chunk per file; a positive size tiles the coverage into
    /// squares of that side.
    pub fn set_chunk_size(&mut self, size: f64) {
        self.chunk_size = size.max(0.0);
        self.tiles.clear();
    }

    /// Mark files as buffer-only.
    pub fn set_noprocess(&mut self, flags: &[bool]) -> Result<()> {
        if flags.len() != self.files.len() {
            return Err(CoreError::MalformedVpc(
                "the buffer-only flag vector does not match the number of files".to_string(),
            ));
        }
        for (file, &flag) in self.files.iter_mut().zip(flags) {
            file.noprocess = flag;
        }
        Ok(())
    }

    pub fn add_query_rect(&mut self, rect: Rectangle) {
        self.queries.push(Shape::Rectangle(rect));
    }

    pub fn add_query_circle(&mut self, circle: Circle) {
        self.queries.push(Shape::Circle(circle));
    }

    pub fn has_queries(&self) -> bool {
        !self.queries.is_empty()
    }

    pub fn bbox(&self) -> Rectangle {
        self.bbox
    }

    pub fn files(&self) -> &[FileInfo] {
        &self.files
    }

    pub fn num_files(&self) -> usize {
        self.files.len()
    }

    pub fn num_indexed_files(&self) -> usize {
        self.files.iter().filter(|f| f.indexed).count()
    }

    /// Mark a file as indexed after its sidecar has been written.
    pub fn set_indexed(&mut self, path: &Path) {
        if let Some(file) = self.files.iter_mut().find(|f| f.path == path) {
            file.indexed = true;
        }
    }

    /// Build the static R-tree over file rectangles and, when tiling, the
    /// non-empty tile list.
    pub fn build_index(&mut self) {
        let entries: Vec<TileEntry> = self
            .files
            .iter()
            .enumerate()
            .map(|(index, f)| TileEntry { index, bbox: f.bbox })
            .collect();
        self.rtree = Some(RTree::bulk_load(entries));

        self.tiles.clear();
        if self.chunk_size > 0.0 && !self.bbox.is_empty() {
            let grid = Grid::new(
                self.bbox.xmin,
                self.bbox.ymin,
                self.bbox.xmax,
                self.bbox.ymax,
                self.chunk_size,
            );
            for cell in 0..grid.ncells {
                let (cx, cy) = grid.xy_from_cell(cell);
                let tile = Rectangle::new(
                    cx - grid.xres / 2.0,
                    cy - grid.yres / 2.0,
                    cx + grid.xres / 2.0,
                    cy + grid.yres / 2.0,
                );
                if !self.overlapping(&tile).is_empty() {
                    self.tiles.push(tile);
                }
            }
        }
    }

    /// Indices of files whose bbox overlaps the rectangle.
    fn overlapping(&self, bbox: &Rectangle) -> Vec<usize> {
        let Some(rtree) = &self.rtree else { return Vec::new() };
        let envelope = AABB::from_corners([bbox.xmin, bbox.ymin], [bbox.xmax, bbox.ymax]);
        let mut out: Vec<usize> = rtree
            .locate_in_envelope_intersecting(&envelope)
            .map(|e| e.index)
            .collect();
        out.sort_unstable();
        out
    }

    pub fn num_chunks(&self) -> usize {
        if !self.queries.is_empty() {
            self.queries.len()
        } else if self.chunk_size > 0.0 {
            self.tiles.len()
        } else {
            self.files.len()
        }
    }

    /// Produce the i-th chunk.
    pub fn get_chunk(&self, i: usize) -> Result<Chunk> {
        if i >= self.num_chunks() {
            return Err(CoreError::ChunkOutOfBounds(i));
        }
        debug_assert!(self.rtree.is_some(), "spatial index of tiles not built");

        if !self.queries.is_empty() {
            self.get_chunk_with_query(i)
        } else if self.chunk_size > 0.0 {
            self.get_chunk_tiled(i)
        } else {
            self.get_chunk_regular(i)
        }
    }

    fn get_chunk_regular(&self, i: usize) -> Result<Chunk> {
        let file = &self.files[i];
        let mut chunk = Chunk {
            id: i,
            name: stem(&file.path),
            xmin: file.bbox.xmin,
            ymin: file.bbox.ymin,
            xmax: file.bbox.xmax,
            ymax: file.bbox.ymax,
            main_files: vec![file.path.clone()],
            process: !file.noprocess,
            ..Default::default()
        };

        if self.buffer <= 0.0 {
            return Ok(chunk);
        }

        chunk.buffer = self.buffer;
        for idx in self.overlapping(&file.bbox.buffered(self.buffer)) {
            if idx != i {
                chunk.neighbour_files.push(self.files[idx].path.clone());
            }
        }
        Ok(chunk)
    }

    fn get_chunk_tiled(&self, i: usize) -> Result<Chunk> {
        let tile = self.tiles[i];
        let main = self.overlapping(&tile);
        let mut chunk = Chunk {
            id: i,
            xmin: tile.xmin,
            ymin: tile.ymin,
            xmax: tile.xmax,
            ymax: tile.ymax,
            buffer: self.buffer,
            process: main.iter().any(|&idx| !self.files[idx].noprocess),
            ..Default::default()
        };
        chunk.name = main
            .first()
            .map(|&idx| format!("{}_{}", stem(&self.files[idx].path), i))
            .unwrap_or_else(|| format!("tile_{i}"));

        for &idx in &main {
            chunk.main_files.push(self.files[idx].path.clone());
        }
        if self.buffer > 0.0 {
            for idx in self.overlapping(&tile.buffered(self.buffer)) {
                if !main.contains(&idx) {
                    chunk.neighbour_files.push(self.files[idx].path.clone());
                }
            }
        }
        Ok(chunk)
    }

    fn get_chunk_with_query(&self, i: usize) -> Result<Chunk> {
        let query = &self.queries[i];
        let bbox = query.bbox();

        let main = self.overlapping(&bbox);
        if main.is_empty() {
            return Err(CoreError::EmptyQuery(bbox.xmin, bbox.ymin, bbox.xmax, bbox.ymax));
        }

        let mut chunk = Chunk {
            id: i,
            xmin: bbox.xmin,
            ymin: bbox.ymin,
            xmax: bbox.xmax,
            ymax: bbox.ymax,
            buffer: self.buffer,
            shape: match query {
                Shape::Circle(c) => ChunkShape::Circle(*c),
                Shape::Polygon(p) => ChunkShape::Polygon(p.clone()),
                Shape::Rectangle(_) => ChunkShape::Rectangle,
            },
            process: main.iter().any(|&idx| !self.files[idx].noprocess),
            ..Default::default()
        };

        for &idx in &main {
            chunk.main_files.push(self.files[idx].path.clone());
        }

        // Name after the file containing the query centroid, if any.
        let centroid = query.centroid();
        let named = main
            .iter()
            .find(|&&idx| self.files[idx].bbox.contains(centroid.x, centroid.y))
            .or(main.first());
        chunk.name = named
            .map(|&idx| format!("{}_{}", stem(&self.files[idx].path), i))
            .unwrap_or_else(|| format!("query_{i}"));

        if self.buffer > 0.0 {
            for idx in self.overlapping(&bbox.buffered(self.buffer)) {
                if !main.contains(&idx) {
                    chunk.neighbour_files.push(self.files[idx].path.clone());
                }
            }
        }
        Ok(chunk)
    }

    /// False when the workload needs a spatial index but at least one file
    /// lacks one (multi-file with buffer, or any spatial query).
    pub fn check_spatial_index(&self) -> bool {
        let multi_files = self.num_files() > 1;
        let use_buffer = self.buffer > 0.0;
        let no_index = self.num_indexed_files() != self.num_files();
        let has_queries = !self.queries.is_empty();
        let missing = (multi_files && use_buffer && no_index) || (has_queries && no_index);
        if missing {
            log::warn!(
                "the processing requires spatial indexing but {} of {} files are not indexed",
                self.num_files() - self.num_indexed_files(),
                self.num_files()
            );
        }
        !missing
    }

    /// Serialise the catalog as a virtual point cloud manifest.
    pub fn write_vpc(&self, path: &Path) -> Result<()> {
        vpc::write_vpc(path, &self.files, &self.crs)
    }
}

fn stem(path: &Path) -> String {
    path.file_stem().unwrap_or_default().to_string_lossy().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collection(bboxes: &[Rectangle]) -> FileCollection {
        let mut c = FileCollection::new();
        for (i, bb) in bboxes.iter().enumerate() {
            c.bbox.merge(bb);
            c.files.push(FileInfo {
                path: PathBuf::from(format!("tile_{i}.laz")),
                bbox: *bb,
                npoints: 1000,
                crs: Crs::default(),
                indexed: true,
                noprocess: false,
            });
        }
        c
    }

    fn two_tiles() -> FileCollection {
        collection(&[
            Rectangle::new(0.0, 0.0, 1000.0, 1000.0),
            Rectangle::new(1000.0, 0.0, 2000.0, 1000.0),
        ])
    }

    #[test]
    fn one_chunk_per_file_without_buffer() {
        let mut c = two_tiles();
        c.build_index();
        assert_eq!(c.num_chunks(), 2);

        let chunk = c.get_chunk(0).unwrap();
        assert_eq!(chunk.main_files.len(), 1);
        assert!(chunk.neighbour_files.is_empty());
        assert_eq!(chunk.name, "tile_0");
        assert!(chunk.process);
    }

    #[test]
    fn buffer_pulls_in_neighbours() {
        let mut c = two_tiles();
        c.set_buffer(50.0);
        c.build_index();

        let chunk = c.get_chunk(0).unwrap();
        assert_eq!(chunk.buffer, 50.0);
        assert_eq!(chunk.neighbour_files, vec![PathBuf::from("tile_1.laz")]);

        // Buffer symmetry: the neighbour's bbox intersects ours inflated.
        let inflated = chunk.bbox().buffered(chunk.buffer);
        assert!(inflated.overlaps(&c.files()[1].bbox));
    }

    #[test]
    fn tiled_chunks_cover_catalog() {
        let mut c = two_tiles();
        c.set_chunk_size(500.0);
        c.build_index();
        assert_eq!(c.num_chunks(), 8);

        let mut cover = Rectangle::empty();
        for i in 0..c.num_chunks() {
            let chunk = c.get_chunk(i).unwrap();
            assert!(!chunk.main_files.is_empty());
            cover.merge(&chunk.bbox());
        }
        assert!(cover.xmin <= 0.0 && cover.xmax >= 2000.0);
        assert!(cover.ymin <= 0.0 && cover.ymax >= 1000.0);
    }

    #[test]
    fn query_chunks() {
        let mut c = two_tiles();
        c.set_buffer(10.0);
        c.add_query_circle(Circle::new(1500.0, 500.0, 25.0));
        c.build_index();
        assert_eq!(c.num_chunks(), 1);

        let chunk = c.get_chunk(0).unwrap();
        assert!(matches!(chunk.shape, ChunkShape::Circle(_)));
        assert_eq!(chunk.main_files, vec![PathBuf::from("tile_1.laz")]);
        assert_eq!(chunk.name, "tile_1_0");
    }

    #[test]
    fn query_outside_coverage_fails() {
        let mut c = two_tiles();
        c.add_query_rect(Rectangle::new(9000.0, 9000.0, 9100.0, 9100.0));
        c.build_index();
        assert!(matches!(c.get_chunk(0), Err(CoreError::EmptyQuery(..))));
    }

    #[test]
    fn spatial_index_policy() {
        let mut c = two_tiles();
        c.build_index();
        assert!(c.check_spatial_index());

        c.files[0].indexed = false;
        // Multi-file but no buffer: advisory only.
        assert!(c.check_spatial_index());
        c.set_buffer(10.0);
        assert!(!c.check_spatial_index());
    }

    #[test]
    fn noprocess_propagates() {
        let mut c = two_tiles();
        c.set_noprocess(&[true, false]).unwrap();
        c.build_index();
        assert!(!c.get_chunk(0).unwrap().process);
        assert!(c.get_chunk(1).unwrap().process);
    }
}
