//! Raster data structures: grids, profiles, transforms and algebra layers

mod geotransform;
mod grid;
mod layer;
mod metadata;

pub use geotransform::GeoTransform;
pub use grid::{BandStatistics, RasterGrid};
pub use layer::{Layer, LayerView};
pub use metadata::{DataType, MetadataOverride, RasterMetadata, GTIFF_DRIVER};
