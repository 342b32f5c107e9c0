use serde::{Deserialize, Serialize};

/// Coordinate reference system carried as an EPSG code, a WKT string, or
/// both. When both are present the EPSG code takes precedence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Crs {
    pub epsg: u32,
    pub wkt: String,
}

impl Crs {
    pub fn from_epsg(epsg: u32) -> Self {
        Self { epsg, wkt: String::new() }
    }

    pub fn from_wkt(wkt: impl Into<String>) -> Self {
        Self { epsg: 0, wkt: wkt.into() }
    }

    pub fn is_empty(&self) -> bool {
        self.epsg == 0 && self.wkt.is_empty()
    }
}
