//! Clipping rasters to a region of interest
//!
//! The output covers the smallest pixel window containing the region's
//! bounding box (clamped to the grid). Pixels whose centre falls outside
//! every polygon of the region are set to the grid's nodata value, or NaN
//! when the grid has none. The input grid is never modified.

use crate::maybe_rayon::*;
use bandstack_core::{Error, GeoTransform, RasterGrid, RasterMetadata, RegionOfInterest, Result};
use geo::{BoundingRect, Intersects, Point, Polygon, Rect};
use ndarray::{s, Array2, Array3, Axis, Zip};
use tracing::debug;

/// Fractional pixel coordinates this close to an integer are snapped to it,
/// so region edges lying on pixel boundaries select exactly those pixels.
const SNAP_TOLERANCE: f64 = 1e-6;

/// Parameters for region clipping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClipParams {
    /// Shrink the output to the region's pixel window. When false the full
    /// extent is kept and only the pixels outside the region are masked.
    pub crop: bool,
}

impl Default for ClipParams {
    fn default() -> Self {
        Self { crop: true }
    }
}

/// Crop `grid` to the region's window and mask pixels outside the region.
pub fn clip(grid: &RasterGrid, roi: &RegionOfInterest) -> Result<RasterGrid> {
    clip_to_region(grid, roi, ClipParams::default())
}

/// Mask pixels outside the region, keeping the full extent.
pub fn mask(grid: &RasterGrid, roi: &RegionOfInterest) -> Result<RasterGrid> {
    clip_to_region(grid, roi, ClipParams { crop: false })
}

/// Clip or mask `grid` with `roi`.
///
/// # Errors
/// - `CrsMismatch` if region and grid both carry a CRS and they differ
/// - `EmptyIntersection` if the region's bounds do not overlap the grid
pub fn clip_to_region(
    grid: &RasterGrid,
    roi: &RegionOfInterest,
    params: ClipParams,
) -> Result<RasterGrid> {
    if let (Some(grid_crs), Some(roi_crs)) = (grid.crs(), roi.crs()) {
        if !grid_crs.is_equivalent(roi_crs) {
            return Err(Error::CrsMismatch(
                grid_crs.identifier(),
                roi_crs.identifier(),
            ));
        }
    }

    let (bands, rows, cols) = grid.shape();
    let transform = grid.transform();

    let (col_off, row_off, win_cols, win_rows) = region_window(transform, cols, rows, roi)?;
    let (col_off, row_off, win_cols, win_rows) = if params.crop {
        (col_off, row_off, win_cols, win_rows)
    } else {
        (0, 0, cols, rows)
    };

    let inside = coverage(transform, roi, col_off, row_off, win_rows, win_cols)?;
    let fill = grid.metadata().fill_value();

    let window = grid.pixels().slice_move(s![
        ..,
        row_off..row_off + win_rows,
        col_off..col_off + win_cols
    ]);
    let mut pixels = Array3::from_elem((bands, win_rows, win_cols), fill);
    for (out, band) in pixels.axis_iter_mut(Axis(0)).zip(window.axis_iter(Axis(0))) {
        Zip::from(out)
            .and(band)
            .and(&inside)
            .for_each(|o, &v, &keep| {
                if keep {
                    *o = v;
                }
            });
    }

    let metadata = RasterMetadata {
        width: win_cols,
        height: win_rows,
        transform: transform.window(col_off, row_off),
        ..grid.metadata().clone()
    };

    debug!(
        col_off,
        row_off,
        rows = win_rows,
        cols = win_cols,
        masked = inside.iter().filter(|&&keep| !keep).count(),
        "clipped raster to region"
    );

    RasterGrid::new(pixels, metadata)
}

/// Pixel window `(col_off, row_off, cols, rows)` covering the region's
/// bounding box, clamped to the grid.
fn region_window(
    transform: &GeoTransform,
    cols: usize,
    rows: usize,
    roi: &RegionOfInterest,
) -> Result<(usize, usize, usize, usize)> {
    let (min_x, min_y, max_x, max_y) = roi.bounds();
    let (gx0, gy0, gx1, gy1) = transform.bounds(cols, rows);

    if max_x <= gx0 || min_x >= gx1 || max_y <= gy0 || min_y >= gy1 {
        return Err(Error::EmptyIntersection);
    }
    // The parts of a multipolygon may straddle the grid without touching it
    let extent = Rect::new((gx0, gy0), (gx1, gy1));
    if !roi.polygons().iter().any(|p| overlaps_extent(p, &extent)) {
        return Err(Error::EmptyIntersection);
    }

    let corners = [
        transform.geo_to_pixel(min_x, min_y),
        transform.geo_to_pixel(min_x, max_y),
        transform.geo_to_pixel(max_x, min_y),
        transform.geo_to_pixel(max_x, max_y),
    ];
    if corners.iter().any(|(c, r)| !c.is_finite() || !r.is_finite()) {
        return Err(Error::InvalidParameter {
            name: "transform",
            value: format!("{:?}", transform.to_gdal()),
            reason: "geotransform is not invertible".into(),
        });
    }

    let (c_min, r_min, c_max, r_max) = corners.iter().fold(
        (f64::INFINITY, f64::INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY),
        |(c0, r0, c1, r1), &(c, r)| (c0.min(c), r0.min(r), c1.max(c), r1.max(r)),
    );

    let col_start = snap(c_min).floor().clamp(0.0, cols as f64) as usize;
    let col_end = snap(c_max).ceil().clamp(0.0, cols as f64) as usize;
    let row_start = snap(r_min).floor().clamp(0.0, rows as f64) as usize;
    let row_end = snap(r_max).ceil().clamp(0.0, rows as f64) as usize;

    if col_end <= col_start || row_end <= row_start {
        return Err(Error::EmptyIntersection);
    }

    Ok((col_start, row_start, col_end - col_start, row_end - row_start))
}

/// Whether `polygon` shares more than a boundary with `extent`
fn overlaps_extent(polygon: &Polygon<f64>, extent: &Rect<f64>) -> bool {
    let Some(rect) = polygon.bounding_rect() else {
        return false;
    };
    let apart = rect.max().x <= extent.min().x
        || rect.min().x >= extent.max().x
        || rect.max().y <= extent.min().y
        || rect.min().y >= extent.max().y;
    !apart && polygon.intersects(&extent.to_polygon())
}

fn snap(v: f64) -> f64 {
    let r = v.round();
    if (v - r).abs() < SNAP_TOLERANCE {
        r
    } else {
        v
    }
}

/// Whether each pixel centre of the window lies in (or on the boundary of)
/// any polygon of the region.
fn coverage(
    transform: &GeoTransform,
    roi: &RegionOfInterest,
    col_off: usize,
    row_off: usize,
    rows: usize,
    cols: usize,
) -> Result<Array2<bool>> {
    let polygons: Vec<(Rect<f64>, &Polygon<f64>)> = roi
        .polygons()
        .iter()
        .filter_map(|p| p.bounding_rect().map(|rect| (rect, p)))
        .collect();

    let data: Vec<bool> = (0..rows)
        .into_par_iter()
        .flat_map(|row| {
            let mut row_data = vec![false; cols];
            for (col, keep) in row_data.iter_mut().enumerate() {
                let (x, y) = transform.pixel_center(col_off + col, row_off + row);
                let point = Point::new(x, y);
                *keep = polygons.iter().any(|(rect, polygon)| {
                    in_rect(rect, x, y) && polygon.intersects(&point)
                });
            }
            row_data
        })
        .collect();

    Ok(Array2::from_shape_vec((rows, cols), data)?)
}

fn in_rect(rect: &Rect<f64>, x: f64, y: f64) -> bool {
    x >= rect.min().x && x <= rect.max().x && y >= rect.min().y && y <= rect.max().y
}
