//! The semantic point record flowing through pipelines.

use crate::header::Header;

/// One LiDAR return with its standard attributes and the extra attribute
/// payload described by the header schema.
///
/// Coordinates are carried as f64; the scaled-integer storage they originate
/// from is described by the header's scale/offset triplets. `file_id` is the
/// position of the record in its source file and `is_buffer` tells whether
/// the point belongs to the buffer ring of its chunk rather than the chunk
/// itself.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub intensity: u16,
    pub return_number: u8,
    pub number_of_returns: u8,
    pub classification: u8,
    pub scan_angle: f32,
    pub gps_time: f64,
    pub rgb: Option<(u16, u16, u16)>,
    pub nir: Option<u16>,
    pub user_data: u8,
    pub point_source_id: u16,
    pub scanner_channel: u8,
    pub withheld: bool,
    pub synthetic: bool,
    pub file_id: u32,
    pub is_buffer: bool,
    /// Extra attribute values, in schema order, already scaled.
    pub extra: Vec<f64>,
}

impl Point {
    /// Look up an attribute by its filter-language name. Standard names are
    /// case-insensitive; anything else is resolved against the schema.
    pub fn attribute(&self, name: &str, header: &Header) -> Option<f64> {
        match name.to_ascii_lowercase().as_str() {
            "x" => Some(self.x),
            "y" => Some(self.y),
            "z" => Some(self.z),
            "intensity" => Some(self.intensity as f64),
            "returnnumber" | "return_number" => Some(self.return_number as f64),
            "numberofreturns" | "number_of_returns" => Some(self.number_of_returns as f64),
            "classification" | "class" => Some(self.classification as f64),
            "scanangle" | "scan_angle" => Some(self.scan_angle as f64),
            "gpstime" | "gps_time" => Some(self.gps_time),
            "userdata" | "user_data" => Some(self.user_data as f64),
            "pointsourceid" | "point_source_id" => Some(self.point_source_id as f64),
            "channel" | "scanner_channel" => Some(self.scanner_channel as f64),
            "r" | "red" => self.rgb.map(|c| c.0 as f64),
            "g" | "green" => self.rgb.map(|c| c.1 as f64),
            "b" | "blue" => self.rgb.map(|c| c.2 as f64),
            "nir" => self.nir.map(|v| v as f64),
            _ => {
                let idx = header.schema.iter().position(|a| a.name == name)?;
                self.extra.get(idx).copied()
            }
        }
    }

    /// Convert from the `las` crate record. Extra bytes are decoded against
    /// the schema so stages see scaled values.
    pub fn from_las(p: &las::Point, header: &Header, file_id: u32) -> Self {
        let extra = header.decode_extra_bytes(&p.extra_bytes);
        Self {
            x: p.x,
            y: p.y,
            z: p.z,
            intensity: p.intensity,
            return_number: p.return_number,
            number_of_returns: p.number_of_returns,
            classification: u8::from(p.classification),
            scan_angle: p.scan_angle,
            gps_time: p.gps_time.unwrap_or(0.0),
            rgb: p.color.map(|c| (c.red, c.green, c.blue)),
            nir: p.nir,
            user_data: p.user_data,
            point_source_id: p.point_source_id,
            scanner_channel: p.scanner_channel,
            withheld: p.is_withheld,
            synthetic: p.is_synthetic,
            file_id,
            is_buffer: false,
            extra,
        }
    }

    /// Convert back to a `las` crate record for writing.
    pub fn to_las(&self, header: &Header) -> las::Point {
        las::Point {
            x: self.x,
            y: self.y,
            z: self.z,
            intensity: self.intensity,
            return_number: self.return_number,
            number_of_returns: self.number_of_returns,
            classification: las::point::Classification::new(self.classification)
                .unwrap_or(las::point::Classification::Unclassified),
            scan_angle: self.scan_angle,
            gps_time: Some(self.gps_time),
            color: self.rgb.map(|(r, g, b)| las::Color::new(r, g, b)),
            nir: self.nir,
            user_data: self.user_data,
            point_source_id: self.point_source_id,
            scanner_channel: self.scanner_channel,
            is_withheld: self.withheld,
            is_synthetic: self.synthetic,
            extra_bytes: header.encode_extra_bytes(&self.extra),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{Attribute, AttributeKind};

    #[test]
    fn attribute_lookup_standard_and_extra() {
        let mut header = Header::default();
        header.schema.push(Attribute {
            name: "HAG".to_string(),
            kind: AttributeKind::F32,
            scale: None,
            offset: None,
        });

        let p = Point {
            x: 1.0,
            z: 12.5,
            intensity: 42,
            extra: vec![3.25],
            ..Default::default()
        };

        assert_eq!(p.attribute("Z", &header), Some(12.5));
        assert_eq!(p.attribute("Intensity", &header), Some(42.0));
        assert_eq!(p.attribute("HAG", &header), Some(3.25));
        assert_eq!(p.attribute("nope", &header), None);
    }
}
