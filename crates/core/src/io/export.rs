//! Raster export: profile merging, consistency checks and atomic writes
//!
//! Every write goes to a temporary file next to the destination and is
//! renamed into place only once the whole image has been encoded and
//! flushed, so a failed export never leaves a partial file behind.

use super::native::encode_geotiff;
use crate::error::{Error, Result};
use crate::raster::{MetadataOverride, RasterGrid, RasterMetadata};
use ndarray::{Array3, ArrayView2, Axis};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::debug;

/// Write all bands of `grid` to `path`.
///
/// The grid's profile is merged with `overrides` first; the merged profile
/// must still describe the grid (band count, height, width), otherwise
/// [`Error::MetadataConsistency`] is returned and nothing is written.
pub fn write_grid<P: AsRef<Path>>(
    path: P,
    grid: &RasterGrid,
    overrides: &MetadataOverride,
) -> Result<()> {
    let path = path.as_ref();
    let meta = grid.metadata().merge(overrides);
    let (bands, rows, cols) = grid.shape();

    check_consistency(&meta, bands, rows, cols)?;

    persist(path, |writer| encode_geotiff(grid.pixels(), &meta, writer))?;
    debug!(
        path = %path.display(),
        bands,
        rows,
        cols,
        dtype = %meta.dtype,
        "wrote raster"
    );
    Ok(())
}

/// Write a grid with its own profile, unchanged
pub fn write_geotiff<P: AsRef<Path>>(path: P, grid: &RasterGrid) -> Result<()> {
    write_grid(path, grid, &MetadataOverride::default())
}

/// Write a single array into band `band_index` (0-based) of a new file
/// described by `template` merged with `overrides`.
///
/// All other bands are filled with the profile's nodata value, or NaN
/// when it has none.
pub fn write_band<P: AsRef<Path>>(
    path: P,
    band: ArrayView2<'_, f64>,
    band_index: usize,
    template: &RasterMetadata,
    overrides: &MetadataOverride,
) -> Result<()> {
    let path = path.as_ref();
    let meta = template.merge(overrides);

    if meta.count == 0 || meta.width == 0 || meta.height == 0 {
        return Err(Error::InvalidParameter {
            name: "metadata",
            value: format!("{}x{}x{}", meta.count, meta.height, meta.width),
            reason: "the output profile describes an empty raster".into(),
        });
    }
    if band_index >= meta.count {
        return Err(Error::BandIndex {
            index: band_index,
            count: meta.count,
        });
    }
    let (rows, cols) = band.dim();
    if (rows, cols) != (meta.height, meta.width) {
        return Err(Error::ShapeMismatch {
            expected: (meta.count, meta.height, meta.width),
            actual: (meta.count, rows, cols),
        });
    }

    let mut pixels = Array3::from_elem((meta.count, rows, cols), meta.fill_value());
    pixels.index_axis_mut(Axis(0), band_index).assign(&band);

    persist(path, |writer| encode_geotiff(pixels.view(), &meta, writer))?;
    debug!(
        path = %path.display(),
        band_index,
        count = meta.count,
        "wrote band"
    );
    Ok(())
}

fn check_consistency(meta: &RasterMetadata, bands: usize, rows: usize, cols: usize) -> Result<()> {
    let checks = [
        ("count", meta.count, bands),
        ("height", meta.height, rows),
        ("width", meta.width, cols),
    ];
    for (key, declared, actual) in checks {
        if declared != actual {
            return Err(Error::MetadataConsistency {
                key,
                declared,
                actual,
            });
        }
    }
    Ok(())
}

/// Encode into a temporary file in the destination directory, then rename
/// it over `path`. The temporary file is removed if anything fails.
fn persist<F>(path: &Path, encode: F) -> Result<()>
where
    F: FnOnce(&mut BufWriter<&mut File>) -> Result<()>,
{
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut tmp = tempfile::Builder::new()
        .prefix(".bandstack-")
        .suffix(".part")
        .tempfile_in(dir)?;

    {
        let mut writer = BufWriter::new(tmp.as_file_mut());
        encode(&mut writer)?;
        writer.flush()?;
    }
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}
