//! Regions of interest and the GeoJSON region codec

mod geojson;

pub use geojson::{parse_geojson, read_geojson};

use crate::crs::CRS;
use crate::error::{Error, Result};
use geo_types::{Coord, LineString, MultiPolygon, Polygon};

/// Polygonal region used to clip or mask a raster.
///
/// Holds one or more polygons (exterior ring plus holes) in the coordinate
/// system of the grid it will be applied to. Regions are validated on
/// construction: at least one polygon, finite coordinates, and every ring
/// closed with at least four positions.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionOfInterest {
    polygons: MultiPolygon<f64>,
    crs: Option<CRS>,
}

impl RegionOfInterest {
    /// Build a region from `geo-types` polygons.
    pub fn new(polygons: Vec<Polygon<f64>>) -> Result<Self> {
        if polygons.is_empty() {
            return Err(Error::InvalidRegion("region has no polygons".into()));
        }
        for (i, polygon) in polygons.iter().enumerate() {
            for ring in std::iter::once(polygon.exterior()).chain(polygon.interiors()) {
                check_ring(i, &ring.0)?;
            }
        }
        Ok(Self {
            polygons: MultiPolygon::new(polygons),
            crs: None,
        })
    }

    /// Build a region from raw rings: `polygons[i][0]` is the exterior of
    /// polygon `i`, any further rings are holes. Rings must be closed (first
    /// position equal to the last).
    pub fn from_rings(polygons: Vec<Vec<Vec<[f64; 2]>>>) -> Result<Self> {
        let mut built = Vec::with_capacity(polygons.len());

        for (i, rings) in polygons.into_iter().enumerate() {
            let mut rings = rings.into_iter().map(|ring| -> Result<LineString<f64>> {
                let coords: Vec<Coord<f64>> =
                    ring.into_iter().map(|[x, y]| Coord { x, y }).collect();
                check_ring(i, &coords)?;
                Ok(LineString::new(coords))
            });
            let exterior = rings.next().ok_or_else(|| {
                Error::InvalidRegion(format!("polygon {} has no exterior ring", i))
            })??;
            let interiors = rings.collect::<Result<Vec<_>>>()?;
            built.push(Polygon::new(exterior, interiors));
        }

        Self::new(built)
    }

    /// Axis-aligned rectangle covering `[min_x, max_x] x [min_y, max_y]`
    pub fn from_bounds(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Result<Self> {
        if !(min_x < max_x && min_y < max_y) {
            return Err(Error::InvalidRegion(format!(
                "degenerate bounds ({}, {}, {}, {})",
                min_x, min_y, max_x, max_y
            )));
        }
        Self::from_rings(vec![vec![vec![
            [min_x, min_y],
            [max_x, min_y],
            [max_x, max_y],
            [min_x, max_y],
            [min_x, min_y],
        ]]])
    }

    /// Attach the coordinate system the region is expressed in
    pub fn with_crs(mut self, crs: CRS) -> Self {
        self.crs = Some(crs);
        self
    }

    pub fn crs(&self) -> Option<&CRS> {
        self.crs.as_ref()
    }

    pub fn polygons(&self) -> &[Polygon<f64>] {
        &self.polygons.0
    }

    pub fn as_multi_polygon(&self) -> &MultiPolygon<f64> {
        &self.polygons
    }

    /// Number of polygons
    pub fn len(&self) -> usize {
        self.polygons.0.len()
    }

    /// Always false for a validated region
    pub fn is_empty(&self) -> bool {
        self.polygons.0.is_empty()
    }

    /// Bounding box (min_x, min_y, max_x, max_y) of all exterior rings
    pub fn bounds(&self) -> (f64, f64, f64, f64) {
        self.polygons
            .0
            .iter()
            .flat_map(|p| p.exterior().0.iter())
            .fold(
                (f64::INFINITY, f64::INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY),
                |(min_x, min_y, max_x, max_y), c| {
                    (min_x.min(c.x), min_y.min(c.y), max_x.max(c.x), max_y.max(c.y))
                },
            )
    }
}

fn check_ring(polygon: usize, coords: &[Coord<f64>]) -> Result<()> {
    if coords.len() < 4 {
        return Err(Error::InvalidRegion(format!(
            "polygon {}: a ring needs at least 4 positions, got {}",
            polygon,
            coords.len()
        )));
    }
    if coords.iter().any(|c| !c.x.is_finite() || !c.y.is_finite()) {
        return Err(Error::InvalidRegion(format!(
            "polygon {}: ring has non-finite coordinates",
            polygon
        )));
    }
    if coords.first() != coords.last() {
        return Err(Error::InvalidRegion(format!(
            "polygon {}: ring is not closed",
            polygon
        )));
    }
    Ok(())
}
