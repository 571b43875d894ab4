//! Coordinate Reference System handling
//!
//! Rasters carry their CRS as part of [`RasterMetadata`](crate::RasterMetadata).
//! The band algebra never interprets it; it is only compared (regions vs
//! grids) and written back out by the GeoTIFF codec.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Coordinate Reference System representation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CRS {
    /// EPSG code if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    epsg: Option<u32>,
    /// WKT representation, or a free-form citation read from GeoAsciiParams
    #[serde(default, skip_serializing_if = "Option::is_none")]
    wkt: Option<String>,
    /// PROJ string if available
    #[serde(default, skip_serializing_if = "Option::is_none")]
    proj: Option<String>,
}

/// Codes in the EPSG 4xxx block that are not latitude/longitude systems:
/// World Equidistant Cylindrical (4087, 4088) and the WGS 84 / ETRS89
/// geocentric systems (4328, 4936, 4978).
const NON_GEOGRAPHIC_4XXX: [u32; 5] = [4087, 4088, 4328, 4936, 4978];

impl CRS {
    /// Create a CRS from an EPSG code
    pub fn from_epsg(code: u32) -> Self {
        Self {
            epsg: Some(code),
            wkt: None,
            proj: None,
        }
    }

    /// Create a CRS from a WKT string
    pub fn from_wkt(wkt: impl Into<String>) -> Self {
        Self {
            epsg: None,
            wkt: Some(wkt.into()),
            proj: None,
        }
    }

    /// Create a CRS from a PROJ string
    pub fn from_proj(proj: impl Into<String>) -> Self {
        Self {
            epsg: None,
            wkt: None,
            proj: Some(proj.into()),
        }
    }

    /// Parse a user supplied identifier: `EPSG:32633`, a bare code, a PROJ
    /// string (`+proj=...`) or anything else as WKT.
    pub fn parse(s: &str) -> Self {
        let trimmed = s.trim();
        let code = trimmed
            .strip_prefix("EPSG:")
            .or_else(|| trimmed.strip_prefix("epsg:"))
            .unwrap_or(trimmed);
        if let Ok(code) = code.parse::<u32>() {
            return Self::from_epsg(code);
        }
        if trimmed.starts_with("+proj") {
            return Self::from_proj(trimmed);
        }
        Self::from_wkt(trimmed)
    }

    /// WGS84 geographic CRS (EPSG:4326)
    pub fn wgs84() -> Self {
        Self::from_epsg(4326)
    }

    /// Get EPSG code if known
    pub fn epsg(&self) -> Option<u32> {
        self.epsg
    }

    /// Get WKT representation
    pub fn wkt(&self) -> Option<&str> {
        self.wkt.as_deref()
    }

    /// Get PROJ string
    pub fn proj(&self) -> Option<&str> {
        self.proj.as_deref()
    }

    /// Whether this is a geographic (lat/lon) CRS.
    ///
    /// EPSG geographic systems live in the 4000-4999 block, apart from the
    /// projected and geocentric codes listed in `NON_GEOGRAPHIC_4XXX`;
    /// everything else with a code is treated as projected.
    pub fn is_geographic(&self) -> bool {
        match self.epsg {
            Some(code) => (4000..5000).contains(&code) && !NON_GEOGRAPHIC_4XXX.contains(&code),
            None => self
                .proj
                .as_deref()
                .map(|p| p.contains("+proj=longlat") || p.contains("+proj=latlong"))
                .unwrap_or(false),
        }
    }

    /// Check if two CRS are equivalent
    pub fn is_equivalent(&self, other: &CRS) -> bool {
        if let (Some(a), Some(b)) = (self.epsg, other.epsg) {
            return a == b;
        }
        if let (Some(a), Some(b)) = (&self.wkt, &other.wkt) {
            return a.trim() == b.trim();
        }
        if let (Some(a), Some(b)) = (&self.proj, &other.proj) {
            return a.trim() == b.trim();
        }
        false
    }

    /// Get a string identifier for this CRS
    pub fn identifier(&self) -> String {
        if let Some(code) = self.epsg {
            return format!("EPSG:{}", code);
        }
        if let Some(proj) = &self.proj {
            return proj.clone();
        }
        if let Some(wkt) = &self.wkt {
            let head: String = wkt.chars().take(50).collect();
            return format!("WKT:{}", head);
        }
        "Unknown".to_string()
    }
}

impl fmt::Display for CRS {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.identifier())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crs_parse() {
        assert_eq!(CRS::parse("EPSG:32633").epsg(), Some(32633));
        assert_eq!(CRS::parse("4326").epsg(), Some(4326));
        assert_eq!(CRS::parse("+proj=longlat +datum=WGS84").proj(), Some("+proj=longlat +datum=WGS84"));
        assert!(CRS::parse("GEOGCS[\"WGS 84\"]").wkt().is_some());
    }

    #[test]
    fn test_crs_geographic() {
        assert!(CRS::wgs84().is_geographic());
        assert!(!CRS::from_epsg(32633).is_geographic());
        assert!(CRS::from_proj("+proj=longlat +datum=WGS84").is_geographic());
        assert!(CRS::from_epsg(4269).is_geographic());
    }

    #[test]
    fn test_crs_4xxx_projected_and_geocentric() {
        assert!(!CRS::from_epsg(4087).is_geographic());
        assert!(!CRS::from_epsg(4978).is_geographic());
        assert!(!CRS::from_epsg(4936).is_geographic());
    }

    #[test]
    fn test_crs_equivalence() {
        let a = CRS::from_epsg(4326);
        let b = CRS::wgs84();
        assert!(a.is_equivalent(&b));
        assert!(!a.is_equivalent(&CRS::from_epsg(3857)));
        assert!(!a.is_equivalent(&CRS::from_wkt("LOCAL_CS[]")));
    }
}
