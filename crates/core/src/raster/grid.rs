//! Multiband raster grid

use crate::error::{Error, Result};
use crate::raster::{DataType, GeoTransform, Layer, RasterMetadata};
use crate::CRS;
use ndarray::{Array2, Array3, ArrayView2, ArrayView3, Axis};
use std::path::Path;

/// An in-memory multiband raster with its georeferencing profile.
///
/// Pixels are stored as one `(bands, rows, cols)` array of `f64`, whatever
/// the on-disk sample type. A grid is immutable once built: operations that
/// change pixels or metadata return a new grid.
///
/// # Example
///
/// ```ignore
/// use bandstack_core::RasterGrid;
///
/// let grid = RasterGrid::load("scene_2021.tif")?;
/// let (bands, rows, cols) = grid.shape();
/// let nir = grid.band(3)?;
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RasterGrid {
    /// Raster data as (band, row, col)
    pixels: Array3<f64>,
    metadata: RasterMetadata,
}

impl RasterGrid {
    /// Build a grid, checking that `metadata` describes `pixels`.
    pub fn new(pixels: Array3<f64>, metadata: RasterMetadata) -> Result<Self> {
        let (bands, rows, cols) = pixels.dim();

        if bands == 0 || rows == 0 || cols == 0 {
            return Err(Error::InvalidParameter {
                name: "pixels",
                value: format!("{:?}", pixels.dim()),
                reason: "a raster needs at least one band, row and column".into(),
            });
        }
        if metadata.count != bands {
            return Err(Error::MetadataConsistency {
                key: "count",
                declared: metadata.count,
                actual: bands,
            });
        }
        if metadata.height != rows {
            return Err(Error::MetadataConsistency {
                key: "height",
                declared: metadata.height,
                actual: rows,
            });
        }
        if metadata.width != cols {
            return Err(Error::MetadataConsistency {
                key: "width",
                declared: metadata.width,
                actual: cols,
            });
        }

        Ok(Self { pixels, metadata })
    }

    /// Build a grid from separate bands, which must all share one shape.
    ///
    /// `metadata` width, height and count are taken from the bands.
    pub fn from_bands(bands: Vec<Array2<f64>>, metadata: RasterMetadata) -> Result<Self> {
        let first = bands.first().ok_or_else(|| Error::InvalidParameter {
            name: "bands",
            value: "[]".into(),
            reason: "at least one band is required".into(),
        })?;
        let (rows, cols) = first.dim();

        for band in &bands {
            if band.dim() != (rows, cols) {
                let (r, c) = band.dim();
                return Err(Error::ShapeMismatch {
                    expected: (bands.len(), rows, cols),
                    actual: (bands.len(), r, c),
                });
            }
        }

        let views: Vec<ArrayView2<'_, f64>> = bands.iter().map(|b| b.view()).collect();
        let pixels = ndarray::stack(Axis(0), &views)?;
        let metadata = RasterMetadata {
            count: bands.len(),
            height: rows,
            width: cols,
            ..metadata
        };

        Self::new(pixels, metadata)
    }

    /// Wrap an algebra result as a grid georeferenced like `template`.
    ///
    /// The band count follows the layer and samples are declared as
    /// float32, the type derived products are written with. Nodata becomes
    /// NaN: a sentinel of the source (often 0 for integer scenes) can be a
    /// genuine value of the derived layer.
    pub fn from_layer(layer: Layer, template: &RasterMetadata) -> Result<Self> {
        let pixels = layer.into_stack();
        let (bands, rows, cols) = pixels.dim();

        if (rows, cols) != (template.height, template.width) {
            return Err(Error::ShapeMismatch {
                expected: (bands, template.height, template.width),
                actual: (bands, rows, cols),
            });
        }

        let metadata = RasterMetadata {
            count: bands,
            dtype: DataType::F32,
            nodata: Some(f64::NAN),
            ..template.clone()
        };
        Self::new(pixels, metadata)
    }

    /// Read every band of a GeoTIFF into memory.
    ///
    /// The file is open only for the duration of the call.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        crate::io::read_geotiff(path)
    }

    // Dimensions

    /// `(band_count, height, width)`
    pub fn shape(&self) -> (usize, usize, usize) {
        self.pixels.dim()
    }

    pub fn band_count(&self) -> usize {
        self.pixels.len_of(Axis(0))
    }

    /// Number of rows
    pub fn height(&self) -> usize {
        self.pixels.len_of(Axis(1))
    }

    /// Number of columns
    pub fn width(&self) -> usize {
        self.pixels.len_of(Axis(2))
    }

    // Data access

    /// View of band `index` (0-based)
    pub fn band(&self, index: usize) -> Result<ArrayView2<'_, f64>> {
        let count = self.band_count();
        if index >= count {
            return Err(Error::BandIndex { index, count });
        }
        Ok(self.pixels.index_axis(Axis(0), index))
    }

    /// Iterate over the bands in order
    pub fn bands(&self) -> impl Iterator<Item = ArrayView2<'_, f64>> {
        self.pixels.axis_iter(Axis(0))
    }

    /// All pixels as (band, row, col)
    pub fn pixels(&self) -> ArrayView3<'_, f64> {
        self.pixels.view()
    }

    /// Consume the grid and return the pixel array and profile
    pub fn into_parts(self) -> (Array3<f64>, RasterMetadata) {
        (self.pixels, self.metadata)
    }

    // Metadata

    pub fn metadata(&self) -> &RasterMetadata {
        &self.metadata
    }

    pub fn transform(&self) -> &GeoTransform {
        &self.metadata.transform
    }

    pub fn crs(&self) -> Option<&CRS> {
        self.metadata.crs.as_ref()
    }

    pub fn nodata(&self) -> Option<f64> {
        self.metadata.nodata
    }

    /// Geographic bounds (min_x, min_y, max_x, max_y)
    pub fn bounds(&self) -> (f64, f64, f64, f64) {
        self.metadata.transform.bounds(self.width(), self.height())
    }

    /// Whether `value` is NaN or equal to the nodata value
    pub fn is_nodata(&self, value: f64) -> bool {
        if value.is_nan() {
            return true;
        }
        match self.metadata.nodata {
            Some(nd) => (value - nd).abs() < f64::EPSILON * 100.0,
            None => false,
        }
    }

    // Statistics

    /// Basic statistics of one band, skipping NaN and nodata cells
    pub fn statistics(&self, band: usize) -> Result<BandStatistics> {
        let data = self.band(band)?;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        let mut sum = 0.0;
        let mut count = 0usize;

        for &value in data.iter() {
            if self.is_nodata(value) {
                continue;
            }
            min = min.min(value);
            max = max.max(value);
            sum += value;
            count += 1;
        }

        Ok(BandStatistics {
            min: (count > 0).then_some(min),
            max: (count > 0).then_some(max),
            mean: (count > 0).then(|| sum / count as f64),
            valid_count: count,
            nodata_count: data.len() - count,
        })
    }
}

/// Basic statistics for one band
#[derive(Debug, Clone, PartialEq)]
pub struct BandStatistics {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub mean: Option<f64>,
    pub valid_count: usize,
    pub nodata_count: usize,
}
