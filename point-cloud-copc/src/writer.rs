//! The COPC writer lifecycle: open (header surgery + placeholder records),
//! buffered point intake, and the close step that builds the octree, writes
//! the chunks and back-patches the header, the info VLR and the hierarchy.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Cursor, Seek, SeekFrom, Write};
use std::path::Path;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::compressor::CopcCompressor;
use crate::ept::{EptKey, EptOctree};
use crate::octant::Octant;
use crate::{CopcError, Result};

/// LAS 1.4 header size; the COPC info VLR payload sits right after the
/// header and its own 54-byte VLR header.
const HEADER_SIZE: u64 = 375;
const VLR_HEADER_SIZE: u64 = 54;
const EVLR_HEADER_SIZE: u64 = 60;
const COPC_INFO_SIZE: usize = 160;
const HIERARCHY_ENTRY_SIZE: usize = 32;

/// One record of the hierarchy EVLR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HierarchyEntry {
    pub key: EptKey,
    pub offset: u64,
    pub byte_size: i32,
    pub point_count: i32,
}

/// Writer options beyond the defaults.
#[derive(Debug, Clone)]
pub struct CopcOptions {
    /// Occupancy grid resolution per octant.
    pub grid_size: usize,
    /// Octree depth; negative derives it from the point count.
    pub max_depth: i32,
    /// Average octant population targeted by the automatic depth.
    pub max_points_per_octant: u64,
    /// Octants at or below this size are promoted into an ancestor.
    pub min_points_per_octant: usize,
    /// Seed of the shuffle RNG.
    pub shuffle_seed: u64,
}

impl Default for CopcOptions {
    fn default() -> Self {
        Self {
            grid_size: 256,
            max_depth: -1,
            max_points_per_octant: 100_000,
            min_points_per_octant: 100,
            shuffle_seed: 0,
        }
    }
}

/// COPC file writer over any seekable sink.
pub struct CopcWriter<W: Write + Seek + Send + Sync> {
    write: Option<W>,
    header: las::Header,
    options: CopcOptions,
    start: u64,
    points: Vec<las::Point>,
    // Running statistics patched into the header at close.
    bounds: ([f64; 3], [f64; 3]),
    points_by_return: [u64; 15],
    gpstime_minimum: f64,
    gpstime_maximum: f64,
    hierarchy: Vec<HierarchyEntry>,
    closed: bool,
}

impl CopcWriter<BufWriter<File>> {
    /// Create `path` and write a COPC stream into it.
    pub fn from_path<P: AsRef<Path>>(
        path: P,
        header: las::Header,
        options: CopcOptions,
    ) -> Result<Self> {
        let file = File::create(path)?;
        Self::new(BufWriter::new(file), header, options)
    }
}

impl<W: Write + Seek + Send + Sync> CopcWriter<W> {
    /// Upgrade the header to LAS 1.4 / PDRF 6-8, install the zeroed COPC
    /// info VLR and the LAZ VLR, and write the header block. Points are
    /// accumulated in memory until [`close`](Self::close).
    pub fn new(mut write: W, header: las::Header, options: CopcOptions) -> Result<Self> {
        let start = write.stream_position()?;

        // Forward the VLRs we do not rewrite ourselves.
        let mut forward_vlrs = Vec::with_capacity(header.vlrs().len());
        for vlr in header.vlrs() {
            match (vlr.user_id.to_lowercase().as_str(), vlr.record_id) {
                ("copc", 1 | 1000) => {}
                ("laszip encoded", 22204) => {}
                _ => forward_vlrs.push(vlr.clone()),
            }
        }
        let forward_evlrs: Vec<las::Vlr> = header
            .evlrs()
            .iter()
            .filter(|vlr| {
                !matches!(
                    (vlr.user_id.to_lowercase().as_str(), vlr.record_id),
                    ("copc", 1 | 1000) | ("laszip encoded", 22204)
                )
            })
            .cloned()
            .collect();

        let mut raw_head = header.into_raw()?;

        // Upgrade the point record format, keeping any extra bytes.
        let pdrf = raw_head.point_data_record_format & 0b0011_1111;
        let (target, base_old): (u8, u16) = match pdrf {
            0 => (6, 20),
            1 => (6, 28),
            2 => (7, 26),
            3 => (7, 34),
            6 => (6, 30),
            7 => (7, 36),
            8 => (8, 38),
            other => return Err(CopcError::UnsupportedFormat(other)),
        };
        let extra_bytes = raw_head.point_data_record_length.saturating_sub(base_old);
        let base_new: u16 = match target {
            6 => 30,
            7 => 36,
            _ => 38,
        };

        raw_head.version = las::Version::new(1, 4);
        raw_head.point_data_record_format = target | 0b1100_0000; // compressed
        raw_head.point_data_record_length = base_new + extra_bytes;
        raw_head.global_encoding |= 0b10000; // WKT CRS bit, mandatory for 6-8
        raw_head.number_of_point_records = 0;
        raw_head.number_of_points_by_return = [0; 5];
        raw_head.large_file = None;
        raw_head.evlr = None;
        raw_head.padding = vec![];

        let mut software = [0u8; 32];
        for (i, b) in b"point-cloud-copc".iter().enumerate() {
            software[i] = *b;
        }
        raw_head.generating_software = software;

        let mut builder = las::Builder::new(raw_head)?;

        // The COPC info VLR must be the first record; its payload is zeroed
        // here and resolved when the writer closes.
        builder.vlrs.push(las::Vlr {
            user_id: "copc".to_string(),
            record_id: 1,
            description: "COPC info VLR".to_string(),
            data: vec![0; COPC_INFO_SIZE],
        });

        // LAZ VLR with variable-size chunking, one chunk per octant.
        let point_format = builder.point_format;
        let mut items = laz::laszip::LazItemRecordBuilder::new();
        items.add_item(laz::LazItemType::Point14);
        if point_format.has_color {
            if point_format.has_nir {
                items.add_item(laz::LazItemType::RGBNIR14);
            } else {
                items.add_item(laz::LazItemType::RGB14);
            }
        }
        if point_format.extra_bytes > 0 {
            items.add_item(laz::LazItemType::Byte14(point_format.extra_bytes));
        }
        let laz_vlr = laz::LazVlrBuilder::new(items.build())
            .with_variable_chunk_size()
            .build();
        let mut cursor = Cursor::new(Vec::<u8>::new());
        laz_vlr.write_to(&mut cursor)?;
        builder.vlrs.push(las::Vlr {
            user_id: laz::LazVlr::USER_ID.to_string(),
            record_id: laz::LazVlr::RECORD_ID,
            description: laz::LazVlr::DESCRIPTION.to_string(),
            data: cursor.into_inner(),
        });

        builder.vlrs.extend(forward_vlrs);
        builder.evlrs.extend(forward_evlrs);

        let header = builder.into_header()?;

        // Reserve the header + VLR space on disk.
        header.write_to(&mut write)?;

        Ok(Self {
            write: Some(write),
            header,
            options,
            start,
            points: Vec::new(),
            bounds: ([f64::INFINITY; 3], [f64::NEG_INFINITY; 3]),
            points_by_return: [0; 15],
            gpstime_minimum: f64::MAX,
            gpstime_maximum: f64::MIN,
            hierarchy: Vec::new(),
            closed: false,
        })
    }

    pub fn header(&self) -> &las::Header {
        &self.header
    }

    pub fn hierarchy(&self) -> &[HierarchyEntry] {
        &self.hierarchy
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Buffer one point. Nothing reaches the disk before `close`.
    pub fn write_point(&mut self, point: las::Point) -> Result<()> {
        if self.closed {
            return Err(CopcError::ClosedWriter);
        }

        let gps = point.gps_time.unwrap_or(0.0);
        self.gpstime_minimum = self.gpstime_minimum.min(gps);
        self.gpstime_maximum = self.gpstime_maximum.max(gps);

        self.bounds.0[0] = self.bounds.0[0].min(point.x);
        self.bounds.0[1] = self.bounds.0[1].min(point.y);
        self.bounds.0[2] = self.bounds.0[2].min(point.z);
        self.bounds.1[0] = self.bounds.1[0].max(point.x);
        self.bounds.1[1] = self.bounds.1[1].max(point.y);
        self.bounds.1[2] = self.bounds.1[2].max(point.z);

        let ret = (point.return_number as usize).clamp(1, 15) - 1;
        self.points_by_return[ret] += 1;

        self.points.push(point);
        Ok(())
    }

    /// Build the octree, write every octant as a LAZ chunk and back-patch
    /// the header, the COPC info VLR and the hierarchy EVLR.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(CopcError::ClosedWriter);
        }
        if self.points.is_empty() {
            return Err(CopcError::EmptyFile);
        }
        self.closed = true;

        let npoints = self.points.len() as u64;
        let max_depth = if self.options.max_depth < 0 {
            EptOctree::compute_max_depth(npoints, self.options.max_points_per_octant)
        } else {
            self.options.max_depth.min(10)
        };

        let octree = EptOctree::new(
            (
                self.bounds.0[0],
                self.bounds.0[1],
                self.bounds.0[2],
                self.bounds.1[0],
                self.bounds.1[1],
                self.bounds.1[2],
            ),
            self.options.grid_size,
            max_depth,
        )
        .ok_or(CopcError::InvalidBounds)?;

        // Shuffle so every octree level is a statistically representative
        // subsample of the cloud; COPC readers rely on it.
        let mut rng = StdRng::seed_from_u64(self.options.shuffle_seed);
        for i in (1..self.points.len()).rev() {
            let j = rng.gen_range(0..=i);
            self.points.swap(i, j);
        }

        let transforms = self.header.transforms().clone();
        let point_format = *self.header.point_format();
        let point_size = point_format.len() as usize;

        // Occupancy-gated placement: a point sinks until it finds an octant
        // whose voxel cell is still free; the deepest level takes anything.
        let mut registry: HashMap<EptKey, Octant> = HashMap::new();
        let mut record = Cursor::new(Vec::with_capacity(point_size));
        for point in self.points.drain(..) {
            if !octree.contains(point.x, point.y, point.z) {
                return Err(CopcError::PointOutsideOctree(point.x, point.y, point.z));
            }
            let (x, y, z) = (point.x, point.y, point.z);

            record.get_mut().clear();
            record.set_position(0);
            point.into_raw(&transforms)?.write_to(&mut record, &point_format)?;

            let mut depth = 0;
            loop {
                let key = octree.key_at(x, y, z, depth);
                let cell = if depth == max_depth {
                    -1
                } else {
                    octree.occupancy_cell(x, y, z, &key)
                };
                let octant = registry
                    .entry(key)
                    .or_insert_with(|| Octant::new(point_size));
                if depth == max_depth || !octant.is_occupied(cell) {
                    octant.insert(record.get_ref(), cell);
                    break;
                }
                depth += 1;
            }
        }

        // Small octants are folded into their nearest surviving ancestor.
        // Internal ones leave a zero-sized hierarchy entry behind so child
        // pointers remain navigable.
        let mut keys: Vec<EptKey> = registry.keys().copied().collect();
        keys.sort_by(|a, b| b.depth.cmp(&a.depth).then(a.cmp(b)));
        for key in keys {
            let count = registry.get(&key).map(|o| o.npoints()).unwrap_or(0);
            if count > self.options.min_points_per_octant {
                continue;
            }
            let mut ancestor = key;
            let target = loop {
                if ancestor.depth == 0 {
                    break None;
                }
                ancestor = ancestor.parent();
                if registry.contains_key(&ancestor) {
                    break Some(ancestor);
                }
            };
            let Some(target) = target else { continue };

            let small = registry.remove(&key).unwrap();
            let dest = registry.get_mut(&target).unwrap();
            for chunk in small.buffer.chunks_exact(point_size) {
                dest.insert(chunk, -1);
            }
            if key.depth < max_depth {
                self.hierarchy.push(HierarchyEntry {
                    key,
                    offset: 0,
                    byte_size: 0,
                    point_count: 0,
                });
            }
        }

        // Write the chunks in octree traversal order.
        let mut write_keys: Vec<EptKey> = registry.keys().copied().collect();
        write_keys.sort();

        let write = self.write.take().expect("writer stream already taken");
        let laz_vlr = self.header.laz_vlr()?;
        let mut compressor = CopcCompressor::new(write, laz_vlr)?;

        for key in write_keys {
            let mut octant = registry.remove(&key).unwrap();
            octant.sort();
            let (entry, offset) = compressor.compress_chunk(&octant.buffer)?;
            self.hierarchy.push(HierarchyEntry {
                key,
                offset,
                byte_size: entry.byte_count as i32,
                point_count: entry.point_count as i32,
            });
        }

        let mut write = compressor.done()?;

        // Hierarchy EVLR.
        self.hierarchy.sort_by_key(|e| e.key);
        let evlr_start = write.stream_position()?;
        write_hierarchy_evlr(&mut write, &self.hierarchy)?;

        // Back-patch the raw header.
        let mut raw = self.header.clone().into_raw()?;
        raw.min_x = self.bounds.0[0];
        raw.min_y = self.bounds.0[1];
        raw.min_z = self.bounds.0[2];
        raw.max_x = self.bounds.1[0];
        raw.max_y = self.bounds.1[1];
        raw.max_z = self.bounds.1[2];
        raw.number_of_point_records = 0;
        raw.number_of_points_by_return = [0; 5];
        raw.large_file = Some(las::raw::header::LargeFile {
            number_of_point_records: npoints,
            number_of_points_by_return: self.points_by_return,
        });
        raw.evlr = Some(las::raw::header::Evlr {
            start_of_first_evlr: evlr_start,
            number_of_evlrs: 1 + self.header.evlrs().len() as u32,
        });
        write.seek(SeekFrom::Start(self.start))?;
        raw.write_to(&mut write)?;

        // Back-patch the COPC info VLR payload.
        let info_offset = self.start + HEADER_SIZE + VLR_HEADER_SIZE;
        write.seek(SeekFrom::Start(info_offset))?;
        let (cx, cy, cz) = octree.center();
        let spacing = octree.halfsize() * 2.0 / octree.grid_size() as f64;
        let mut info = Vec::with_capacity(COPC_INFO_SIZE);
        info.extend(cx.to_le_bytes());
        info.extend(cy.to_le_bytes());
        info.extend(cz.to_le_bytes());
        info.extend(octree.halfsize().to_le_bytes());
        info.extend(spacing.to_le_bytes());
        info.extend((evlr_start + EVLR_HEADER_SIZE).to_le_bytes());
        info.extend(((self.hierarchy.len() * HIERARCHY_ENTRY_SIZE) as u64).to_le_bytes());
        info.extend(self.gpstime_minimum.to_le_bytes());
        info.extend(self.gpstime_maximum.to_le_bytes());
        info.resize(COPC_INFO_SIZE, 0);
        write.write_all(&info)?;

        // Remaining forwarded EVLRs follow the hierarchy.
        write.seek(SeekFrom::End(0))?;
        for evlr in self.header.evlrs() {
            evlr.clone().into_raw(true)?.write_to(&mut write)?;
        }

        write.flush()?;
        Ok(())
    }
}

impl<W: Write + Seek + Send + Sync> Drop for CopcWriter<W> {
    fn drop(&mut self) {
        if !self.closed && !self.points.is_empty() {
            if let Err(e) = self.close() {
                log::error!("COPC writer dropped without close: {e}");
            }
        }
    }
}

fn write_hierarchy_evlr<W: Write>(write: &mut W, entries: &[HierarchyEntry]) -> Result<()> {
    // EVLR header.
    write.write_all(&0u16.to_le_bytes())?; // reserved
    let mut user_id = [0u8; 16];
    user_id[..4].copy_from_slice(b"copc");
    write.write_all(&user_id)?;
    write.write_all(&1000u16.to_le_bytes())?;
    write.write_all(&((entries.len() * HIERARCHY_ENTRY_SIZE) as u64).to_le_bytes())?;
    let mut description = [0u8; 32];
    description[..13].copy_from_slice(b"EPT hierarchy");
    write.write_all(&description)?;

    for e in entries {
        write.write_all(&e.key.depth.to_le_bytes())?;
        write.write_all(&e.key.x.to_le_bytes())?;
        write.write_all(&e.key.y.to_le_bytes())?;
        write.write_all(&e.key.z.to_le_bytes())?;
        write.write_all(&e.offset.to_le_bytes())?;
        write.write_all(&e.byte_size.to_le_bytes())?;
        write.write_all(&e.point_count.to_le_bytes())?;
    }
    Ok(())
}
