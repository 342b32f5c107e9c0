//! Point cloud header and the extra-attribute schema.

use crate::crs::Crs;
use crate::shapes::Rectangle;

/// Data type of an extra attribute, matching the LAS extra-bytes type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeKind {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    F32,
    F64,
}

impl AttributeKind {
    /// LAS extra-bytes `data_type` code.
    pub fn to_code(self) -> u8 {
        match self {
            AttributeKind::U8 => 1,
            AttributeKind::I8 => 2,
            AttributeKind::U16 => 3,
            AttributeKind::I16 => 4,
            AttributeKind::U32 => 5,
            AttributeKind::I32 => 6,
            AttributeKind::U64 => 7,
            AttributeKind::I64 => 8,
            AttributeKind::F32 => 9,
            AttributeKind::F64 => 10,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => AttributeKind::U8,
            2 => AttributeKind::I8,
            3 => AttributeKind::U16,
            4 => AttributeKind::I16,
            5 => AttributeKind::U32,
            6 => AttributeKind::I32,
            7 => AttributeKind::U64,
            8 => AttributeKind::I64,
            9 => AttributeKind::F32,
            10 => AttributeKind::F64,
            _ => return None,
        })
    }

    pub fn size(self) -> usize {
        match self {
            AttributeKind::U8 | AttributeKind::I8 => 1,
            AttributeKind::U16 | AttributeKind::I16 => 2,
            AttributeKind::U32 | AttributeKind::I32 | AttributeKind::F32 => 4,
            AttributeKind::U64 | AttributeKind::I64 | AttributeKind::F64 => 8,
        }
    }
}

/// One extra attribute described by the LAS extra-bytes VLR.
#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub name: String,
    pub kind: AttributeKind,
    pub scale: Option<f64>,
    pub offset: Option<f64>,
}

impl Attribute {
    fn decode(&self, bytes: &[u8]) -> f64 {
        let raw = match self.kind {
            AttributeKind::U8 => bytes[0] as f64,
            AttributeKind::I8 => bytes[0] as i8 as f64,
            AttributeKind::U16 => u16::from_le_bytes([bytes[0], bytes[1]]) as f64,
            AttributeKind::I16 => i16::from_le_bytes([bytes[0], bytes[1]]) as f64,
            AttributeKind::U32 => u32::from_le_bytes(bytes[..4].try_into().unwrap()) as f64,
            AttributeKind::I32 => i32::from_le_bytes(bytes[..4].try_into().unwrap()) as f64,
            AttributeKind::U64 => u64::from_le_bytes(bytes[..8].try_into().unwrap()) as f64,
            AttributeKind::I64 => i64::from_le_bytes(bytes[..8].try_into().unwrap()) as f64,
            AttributeKind::F32 => f32::from_le_bytes(bytes[..4].try_into().unwrap()) as f64,
            AttributeKind::F64 => f64::from_le_bytes(bytes[..8].try_into().unwrap()),
        };
        raw * self.scale.unwrap_or(1.0) + self.offset.unwrap_or(0.0)
    }

    fn encode(&self, value: f64, out: &mut Vec<u8>) {
        let raw = (value - self.offset.unwrap_or(0.0)) / self.scale.unwrap_or(1.0);
        match self.kind {
            AttributeKind::U8 => out.push(raw as u8),
            AttributeKind::I8 => out.push(raw as i8 as u8),
            AttributeKind::U16 => out.extend((raw as u16).to_le_bytes()),
            AttributeKind::I16 => out.extend((raw as i16).to_le_bytes()),
            AttributeKind::U32 => out.extend((raw as u32).to_le_bytes()),
            AttributeKind::I32 => out.extend((raw as i32).to_le_bytes()),
            AttributeKind::U64 => out.extend((raw as u64).to_le_bytes()),
            AttributeKind::I64 => out.extend((raw as i64).to_le_bytes()),
            AttributeKind::F32 => out.extend((raw as f32).to_le_bytes()),
            AttributeKind::F64 => out.extend(raw.to_le_bytes()),
        }
    }
}

/// Header of a point cloud chunk or file.
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    pub bbox: Rectangle,
    pub zmin: f64,
    pub zmax: f64,
    pub npoints: u64,
    pub crs: Crs,
    pub scale: (f64, f64, f64),
    pub offset: (f64, f64, f64),
    pub point_format: u8,
    pub schema: Vec<Attribute>,
    pub has_index: bool,
}

impl Default for Header {
    fn default() -> Self {
        Self {
            bbox: Rectangle::empty(),
            zmin: f64::INFINITY,
            zmax: f64::NEG_INFINITY,
            npoints: 0,
            crs: Crs::default(),
            scale: (0.001, 0.001, 0.001),
            offset: (0.0, 0.0, 0.0),
            point_format: 6,
            schema: Vec::new(),
            has_index: false,
        }
    }
}

impl Header {
    /// Harvest the fields we care about from a `las` header.
    pub fn from_las(h: &las::Header) -> Self {
        let bounds = h.bounds();
        let t = h.transforms();
        Self {
            bbox: Rectangle::new(bounds.min.x, bounds.min.y, bounds.max.x, bounds.max.y),
            zmin: bounds.min.z,
            zmax: bounds.max.z,
            npoints: h.number_of_points(),
            crs: crs_from_vlrs(h),
            scale: (t.x.scale, t.y.scale, t.z.scale),
            offset: (t.x.offset, t.y.offset, t.z.offset),
            point_format: h.point_format().to_u8().unwrap_or(6),
            schema: schema_from_vlrs(h),
            has_index: false,
        }
    }

    /// Grow the bounds and count with one point.
    pub fn add_point(&mut self, x: f64, y: f64, z: f64) {
        self.bbox.grow(x, y);
        self.zmin = self.zmin.min(z);
        self.zmax = self.zmax.max(z);
        self.npoints += 1;
    }

    /// Merge bounds and counts from another header, keeping our CRS.
    pub fn merge(&mut self, other: &Header) {
        self.bbox.merge(&other.bbox);
        self.zmin = self.zmin.min(other.zmin);
        self.zmax = self.zmax.max(other.zmax);
        self.npoints += other.npoints;
        if self.schema.is_empty() {
            self.schema = other.schema.clone();
        }
    }

    /// Total byte width of the extra attributes.
    pub fn extra_bytes_len(&self) -> usize {
        self.schema.iter().map(|a| a.kind.size()).sum()
    }

    pub(crate) fn decode_extra_bytes(&self, bytes: &[u8]) -> Vec<f64> {
        let mut values = Vec::with_capacity(self.schema.len());
        let mut cursor = 0;
        for attr in &self.schema {
            let size = attr.kind.size();
            if cursor + size > bytes.len() {
                values.push(0.0);
                continue;
            }
            values.push(attr.decode(&bytes[cursor..cursor + size]));
            cursor += size;
        }
        values
    }

    pub(crate) fn encode_extra_bytes(&self, values: &[f64]) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.extra_bytes_len());
        for (attr, value) in self.schema.iter().zip(values) {
            attr.encode(*value, &mut out);
        }
        out
    }
}

/// Extract the CRS from the WKT VLR (2112) or the GeoTIFF key directory
/// (34735, key 3072 = projected CS).
fn crs_from_vlrs(h: &las::Header) -> Crs {
    let mut crs = Crs::default();
    for vlr in h.vlrs().iter().chain(h.evlrs().iter()) {
        if !vlr.user_id.eq_ignore_ascii_case("LASF_Projection") {
            continue;
        }
        match vlr.record_id {
            2112 => {
                let wkt = String::from_utf8_lossy(&vlr.data);
                crs.wkt = wkt.trim_end_matches('\0').to_string();
            }
            34735 => {
                // sGeoKeys: 4 u16 of header then 4 u16 per key entry.
                let data = &vlr.data;
                if data.len() < 8 {
                    continue;
                }
                let nkeys = u16::from_le_bytes([data[6], data[7]]) as usize;
                for k in 0..nkeys {
                    let at = 8 + k * 8;
                    if at + 8 > data.len() {
                        break;
                    }
                    let key_id = u16::from_le_bytes([data[at], data[at + 1]]);
                    let value = u16::from_le_bytes([data[at + 6], data[at + 7]]);
                    if key_id == 3072 {
                        crs.epsg = value as u32;
                    }
                }
            }
            _ => {}
        }
    }
    crs
}

/// Parse the extra-bytes VLR (record id 4): 192-byte descriptors with the
/// data type at offset 2, the name at 4..36 and scale/offset at 112/136.
fn schema_from_vlrs(h: &las::Header) -> Vec<Attribute> {
    let mut schema = Vec::new();
    for vlr in h.vlrs() {
        if !(vlr.user_id.eq_ignore_ascii_case("LASF_Spec") && vlr.record_id == 4) {
            continue;
        }
        for record in vlr.data.chunks_exact(192) {
            let Some(kind) = AttributeKind::from_code(record[2]) else {
                continue;
            };
            let name = String::from_utf8_lossy(&record[4..36]);
            let name = name.trim_end_matches('\0').to_string();
            let options = record[3];
            let scale = (options & 0b1000 != 0)
                .then(|| f64::from_le_bytes(record[112..120].try_into().unwrap()));
            let offset = (options & 0b10000 != 0)
                .then(|| f64::from_le_bytes(record[136..144].try_into().unwrap()));
            schema.push(Attribute { name, kind, scale, offset });
        }
    }
    schema
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extra_bytes_round_trip() {
        let header = Header {
            schema: vec![
                Attribute {
                    name: "hag".into(),
                    kind: AttributeKind::F32,
                    scale: None,
                    offset: None,
                },
                Attribute {
                    name: "amp".into(),
                    kind: AttributeKind::U16,
                    scale: Some(0.5),
                    offset: None,
                },
            ],
            ..Default::default()
        };

        let bytes = header.encode_extra_bytes(&[1.5, 21.0]);
        assert_eq!(bytes.len(), header.extra_bytes_len());
        let values = header.decode_extra_bytes(&bytes);
        assert_eq!(values, vec![1.5, 21.0]);
    }

    #[test]
    fn add_point_grows_bounds() {
        let mut h = Header::default();
        h.add_point(1.0, 2.0, 3.0);
        h.add_point(-1.0, 5.0, -3.0);
        assert_eq!(h.npoints, 2);
        assert_eq!(h.bbox.xmin, -1.0);
        assert_eq!(h.bbox.ymax, 5.0);
        assert_eq!(h.zmin, -3.0);
    }
}
