//! GeoJSON reader for regions of interest
//!
//! Accepts a FeatureCollection, a single Feature, or a bare Polygon /
//! MultiPolygon / GeometryCollection. Features without geometry are
//! skipped; any other geometry type is rejected. A legacy `crs` member
//! (`{"type": "name", "properties": {"name": ...}}`) is honoured.

use super::RegionOfInterest;
use crate::crs::CRS;
use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::Path;
use tracing::debug;

type Position = Vec<f64>;
type Ring = Vec<Position>;

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum GeoJson {
    FeatureCollection {
        features: Vec<Feature>,
        #[serde(default)]
        crs: Option<NamedCrs>,
    },
    Feature(Feature),
    Polygon {
        coordinates: Vec<Ring>,
        #[serde(default)]
        crs: Option<NamedCrs>,
    },
    MultiPolygon {
        coordinates: Vec<Vec<Ring>>,
        #[serde(default)]
        crs: Option<NamedCrs>,
    },
    GeometryCollection {
        geometries: Vec<Geometry>,
        #[serde(default)]
        crs: Option<NamedCrs>,
    },
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Deserialize)]
struct Feature {
    geometry: Option<Geometry>,
    #[serde(default)]
    crs: Option<NamedCrs>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum Geometry {
    Polygon { coordinates: Vec<Ring> },
    MultiPolygon { coordinates: Vec<Vec<Ring>> },
    GeometryCollection { geometries: Vec<Geometry> },
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Deserialize)]
struct NamedCrs {
    properties: NamedCrsProperties,
}

#[derive(Debug, Deserialize)]
struct NamedCrsProperties {
    name: String,
}

/// Read a region of interest from a GeoJSON file
pub fn read_geojson<P: AsRef<Path>>(path: P) -> Result<RegionOfInterest> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)?;
    let roi = parse_geojson(&text)?;
    debug!(path = %path.display(), polygons = roi.len(), "read region");
    Ok(roi)
}

/// Parse a region of interest from GeoJSON text
pub fn parse_geojson(text: &str) -> Result<RegionOfInterest> {
    let doc: GeoJson = serde_json::from_str(text)
        .map_err(|e| Error::InvalidRegion(format!("invalid GeoJSON: {}", e)))?;

    let mut polygons = Vec::new();
    let crs = match doc {
        GeoJson::FeatureCollection { features, crs } => {
            let mut feature_crs = None;
            for feature in features {
                feature_crs = feature_crs.or(feature.crs);
                if let Some(geometry) = feature.geometry {
                    collect(geometry, &mut polygons)?;
                }
            }
            crs.or(feature_crs)
        }
        GeoJson::Feature(feature) => {
            if let Some(geometry) = feature.geometry {
                collect(geometry, &mut polygons)?;
            }
            feature.crs
        }
        GeoJson::Polygon { coordinates, crs } => {
            collect(Geometry::Polygon { coordinates }, &mut polygons)?;
            crs
        }
        GeoJson::MultiPolygon { coordinates, crs } => {
            collect(Geometry::MultiPolygon { coordinates }, &mut polygons)?;
            crs
        }
        GeoJson::GeometryCollection { geometries, crs } => {
            collect(Geometry::GeometryCollection { geometries }, &mut polygons)?;
            crs
        }
        GeoJson::Unsupported => {
            return Err(Error::InvalidRegion(
                "expected a FeatureCollection, Feature, Polygon or MultiPolygon".into(),
            ))
        }
    };

    let roi = RegionOfInterest::from_rings(polygons)?;
    Ok(match crs {
        Some(named) => roi.with_crs(crs_from_name(&named.properties.name)),
        None => roi,
    })
}

fn collect(geometry: Geometry, out: &mut Vec<Vec<Vec<[f64; 2]>>>) -> Result<()> {
    match geometry {
        Geometry::Polygon { coordinates } => out.push(polygon_rings(coordinates)?),
        Geometry::MultiPolygon { coordinates } => {
            for polygon in coordinates {
                out.push(polygon_rings(polygon)?);
            }
        }
        Geometry::GeometryCollection { geometries } => {
            for geometry in geometries {
                collect(geometry, out)?;
            }
        }
        Geometry::Unsupported => {
            return Err(Error::InvalidRegion(
                "only Polygon and MultiPolygon geometries can describe a region".into(),
            ))
        }
    }
    Ok(())
}

fn polygon_rings(rings: Vec<Ring>) -> Result<Vec<Vec<[f64; 2]>>> {
    rings
        .into_iter()
        .map(|ring| {
            ring.into_iter()
                .map(|pos| match pos.as_slice() {
                    [x, y, ..] => Ok([*x, *y]),
                    _ => Err(Error::InvalidRegion(format!(
                        "position {:?} needs at least two coordinates",
                        pos
                    ))),
                })
                .collect()
        })
        .collect()
}

/// `EPSG:32633`, `urn:ogc:def:crs:EPSG::32633` and `urn:ogc:def:crs:OGC:1.3:CRS84`
fn crs_from_name(name: &str) -> CRS {
    let name = name.trim();
    if name.ends_with("CRS84") {
        return CRS::wgs84();
    }
    if let Some(rest) = name.strip_prefix("urn:ogc:def:crs:EPSG:") {
        if let Ok(code) = rest.trim_start_matches(':').rsplit(':').next().unwrap_or("").parse() {
            return CRS::from_epsg(code);
        }
    }
    CRS::parse(name)
}
