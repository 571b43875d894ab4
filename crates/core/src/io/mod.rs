//! I/O operations for reading and writing geospatial data

mod export;
mod native;

pub use export::{write_band, write_geotiff, write_grid};
pub use native::read_geotiff;

// Buffer-based I/O (no filesystem dependency)
pub use native::{read_geotiff_from_buffer, write_geotiff_to_buffer};
