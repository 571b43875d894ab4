//! # bandstack core
//!
//! Core types and I/O for pixel-wise band algebra on co-registered rasters.
//!
//! This crate provides:
//! - `RasterGrid`: immutable multiband raster plus its georeferencing profile
//! - `RasterMetadata` / `MetadataOverride`: profile record and key-by-key merge
//! - `Layer` / `LayerView`: algebra results and operands
//! - `GeoTransform` and `CRS`: georeferencing
//! - `RegionOfInterest`: polygonal region used for clipping
//! - GeoTIFF and GeoJSON codecs, and the raster exporter

pub mod crs;
pub mod error;
pub mod io;
pub mod raster;
pub mod vector;

pub use crs::CRS;
pub use error::{Error, Result};
pub use raster::{
    DataType, GeoTransform, Layer, LayerView, MetadataOverride, RasterGrid, RasterMetadata,
};
pub use vector::RegionOfInterest;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::crs::CRS;
    pub use crate::error::{Error, Result};
    pub use crate::io::{read_geotiff, write_band, write_grid};
    pub use crate::raster::{
        DataType, GeoTransform, Layer, LayerView, MetadataOverride, RasterGrid, RasterMetadata,
    };
    pub use crate::vector::{read_geojson, RegionOfInterest};
}
