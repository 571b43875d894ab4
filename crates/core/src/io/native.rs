//! Native GeoTIFF reading/writing (without GDAL dependency)
//!
//! Uses the `tiff` crate for TIFF structure and handles the GeoTIFF tags
//! directly: pixel scale + tiepoint or a full transformation matrix, the
//! GeoKey directory (EPSG code or citation), GDAL_NODATA and GDAL_METADATA.
//!
//! Multiband rasters are written as a single chunky (pixel-interleaved)
//! image with one sample per band, the layout GDAL uses for GTiff.

use crate::crs::CRS;
use crate::error::{Error, Result};
use crate::raster::{DataType, GeoTransform, RasterGrid, RasterMetadata, GTIFF_DRIVER};
use ndarray::{Array3, ArrayView3};
use num_traits::{NumCast, ToPrimitive, Zero};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Cursor, Read, Seek, Write};
use std::path::Path;
use tiff::decoder::{Decoder, DecodingResult};
use tiff::encoder::{DirectoryEncoder, TiffEncoder, TiffKind};
use tiff::tags::Tag;
use tiff::ColorType;
use tracing::debug;

const MODEL_PIXEL_SCALE: u16 = 33550;
const MODEL_TIEPOINT: u16 = 33922;
const MODEL_TRANSFORMATION: u16 = 34264;
const GEO_KEY_DIRECTORY: u16 = 34735;
const GEO_ASCII_PARAMS: u16 = 34737;
const GDAL_METADATA: u16 = 42112;
const GDAL_NODATA: u16 = 42113;

const GT_MODEL_TYPE_GEO_KEY: u16 = 1024;
const GT_RASTER_TYPE_GEO_KEY: u16 = 1025;
const GT_CITATION_GEO_KEY: u16 = 1026;
const GEOGRAPHIC_TYPE_GEO_KEY: u16 = 2048;
const PROJECTED_CS_TYPE_GEO_KEY: u16 = 3072;

const MODEL_TYPE_PROJECTED: u16 = 1;
const MODEL_TYPE_GEOGRAPHIC: u16 = 2;
const RASTER_PIXEL_IS_AREA: u16 = 1;

fn tiff_err(context: &str) -> impl Fn(tiff::TiffError) -> Error + '_ {
    move |e| Error::invalid_data(format!("{}: {}", context, e))
}

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

/// Read every band of a GeoTIFF file into a [`RasterGrid`].
///
/// Fails with [`Error::Io`] when the file cannot be opened or is not a
/// valid TIFF, and with [`Error::Format`] when the band layout or sample
/// type is not supported.
pub fn read_geotiff<P: AsRef<Path>>(path: P) -> Result<RasterGrid> {
    let path = path.as_ref();
    let file = File::open(path)?;
    let grid = decode_geotiff(BufReader::new(file))?;
    debug!(
        path = %path.display(),
        bands = grid.band_count(),
        rows = grid.height(),
        cols = grid.width(),
        dtype = %grid.metadata().dtype,
        "read GeoTIFF"
    );
    Ok(grid)
}

/// Read a GeoTIFF from an in-memory buffer
pub fn read_geotiff_from_buffer(data: &[u8]) -> Result<RasterGrid> {
    decode_geotiff(Cursor::new(data))
}

fn decode_geotiff<R: Read + Seek>(reader: R) -> Result<RasterGrid> {
    let mut decoder = Decoder::new(reader).map_err(tiff_err("TIFF decode error"))?;

    let (width, height) = decoder
        .dimensions()
        .map_err(tiff_err("Cannot read dimensions"))?;
    let rows = height as usize;
    let cols = width as usize;
    let bands = band_layout(&mut decoder)?;

    let result = decoder
        .read_image()
        .map_err(tiff_err("Cannot read image data"))?;

    let (dtype, samples) = match result {
        DecodingResult::U8(buf) => (DataType::U8, widen(buf)),
        DecodingResult::U16(buf) => (DataType::U16, widen(buf)),
        DecodingResult::U32(buf) => (DataType::U32, widen(buf)),
        DecodingResult::I8(buf) => (DataType::I8, widen(buf)),
        DecodingResult::I16(buf) => (DataType::I16, widen(buf)),
        DecodingResult::I32(buf) => (DataType::I32, widen(buf)),
        DecodingResult::F32(buf) => (DataType::F32, widen(buf)),
        DecodingResult::F64(buf) => (DataType::F64, buf),
        _ => {
            return Err(Error::Format(
                "unsupported TIFF sample type (64-bit integers are not handled)".into(),
            ))
        }
    };

    if samples.len() != bands * rows * cols {
        return Err(Error::Format(format!(
            "expected {} samples for {} band(s) of {}x{}, decoded {}",
            bands * rows * cols,
            bands,
            cols,
            rows,
            samples.len()
        )));
    }

    // Chunky layout: samples of one pixel are adjacent
    let pixels = Array3::from_shape_fn((bands, rows, cols), |(b, r, c)| {
        samples[(r * cols + c) * bands + b]
    });

    let metadata = RasterMetadata {
        driver: GTIFF_DRIVER.to_string(),
        dtype,
        width: cols,
        height: rows,
        count: bands,
        crs: read_crs(&mut decoder),
        transform: read_geotransform(&mut decoder).unwrap_or_default(),
        nodata: read_nodata(&mut decoder),
        tags: read_gdal_metadata(&mut decoder),
    };

    RasterGrid::new(pixels, metadata)
}

/// Number of bands in the current image, rejecting layouts that are not a
/// plain stack of sample planes.
fn band_layout<R: Read + Seek>(decoder: &mut Decoder<R>) -> Result<usize> {
    let planar = decoder
        .find_tag(Tag::PlanarConfiguration)
        .ok()
        .flatten()
        .and_then(|v| v.into_u16().ok())
        .unwrap_or(1);
    if planar != 1 {
        return Err(Error::Format(format!(
            "planar configuration {} is not supported (only chunky = 1)",
            planar
        )));
    }

    let colortype = decoder
        .colortype()
        .map_err(|e| Error::Format(format!("cannot determine band layout: {}", e)))?;

    match colortype {
        ColorType::Gray(_) => Ok(1),
        ColorType::GrayA(_) => Ok(2),
        ColorType::RGB(_) => Ok(3),
        ColorType::RGBA(_) => Ok(4),
        ColorType::Multiband { num_samples, .. } => Ok(num_samples as usize),
        other => Err(Error::Format(format!(
            "unsupported band layout: {:?}",
            other
        ))),
    }
}

fn widen<T: ToPrimitive>(buf: Vec<T>) -> Vec<f64> {
    buf.into_iter()
        .map(|v| v.to_f64().unwrap_or(f64::NAN))
        .collect()
}

/// GeoTransform from ModelPixelScale + ModelTiepoint, or from the
/// ModelTransformation matrix.
fn read_geotransform<R: Read + Seek>(decoder: &mut Decoder<R>) -> Option<GeoTransform> {
    let scale = decoder.get_tag_f64_vec(Tag::Unknown(MODEL_PIXEL_SCALE)).ok();
    let tiepoint = decoder.get_tag_f64_vec(Tag::Unknown(MODEL_TIEPOINT)).ok();

    if let (Some(scale), Some(tiepoint)) = (&scale, &tiepoint) {
        if scale.len() >= 2 && tiepoint.len() >= 6 {
            // tiepoint: [I, J, K, X, Y, Z], scale: [ScaleX, ScaleY, ScaleZ]
            let origin_x = tiepoint[3] - tiepoint[0] * scale[0];
            let origin_y = tiepoint[4] + tiepoint[1] * scale[1];
            return Some(GeoTransform::new(origin_x, origin_y, scale[0], -scale[1]));
        }
    }

    let matrix = decoder
        .get_tag_f64_vec(Tag::Unknown(MODEL_TRANSFORMATION))
        .ok()?;
    if matrix.len() < 16 {
        return None;
    }
    // Row-major 4x4: x = m[3] + col * m[0] + row * m[1], y = m[7] + col * m[4] + row * m[5]
    Some(GeoTransform {
        origin_x: matrix[3],
        origin_y: matrix[7],
        pixel_width: matrix[0],
        pixel_height: matrix[5],
        row_rotation: matrix[1],
        col_rotation: matrix[4],
    })
}

/// CRS from the GeoKey directory: the projected EPSG code when present,
/// then the geographic one, otherwise the GTCitation string.
fn read_crs<R: Read + Seek>(decoder: &mut Decoder<R>) -> Option<CRS> {
    let keys = decoder.get_tag_u16_vec(Tag::Unknown(GEO_KEY_DIRECTORY)).ok()?;
    if keys.len() < 4 {
        return None;
    }
    let ascii = decoder
        .get_tag_ascii_string(Tag::Unknown(GEO_ASCII_PARAMS))
        .unwrap_or_default();

    let num_keys = keys[3] as usize;
    let mut projected = None;
    let mut geographic = None;
    let mut citation = None;

    // 0 is undefined and 32767 user-defined
    let usable = |location: u16, value: u16| location == 0 && value > 0 && value != 32767;

    for entry in keys[4..].chunks_exact(4).take(num_keys) {
        let (key_id, location, count, value) = (entry[0], entry[1], entry[2], entry[3]);
        match key_id {
            PROJECTED_CS_TYPE_GEO_KEY if usable(location, value) => projected = Some(value),
            GEOGRAPHIC_TYPE_GEO_KEY if usable(location, value) => geographic = Some(value),
            GT_CITATION_GEO_KEY if location == GEO_ASCII_PARAMS => {
                let start = value as usize;
                let end = (start + count as usize).min(ascii.len());
                if let Some(text) = ascii.get(start..end) {
                    let text = text.trim_end_matches(['|', '\0']).trim();
                    if !text.is_empty() {
                        citation = Some(text.to_string());
                    }
                }
            }
            _ => {}
        }
    }

    match projected.or(geographic) {
        Some(code) => Some(CRS::from_epsg(code as u32)),
        None => citation.map(|c| CRS::parse(&c)),
    }
}

fn read_nodata<R: Read + Seek>(decoder: &mut Decoder<R>) -> Option<f64> {
    decoder
        .get_tag_ascii_string(Tag::Unknown(GDAL_NODATA))
        .ok()?
        .trim_end_matches('\0')
        .trim()
        .parse::<f64>()
        .ok()
}

fn read_gdal_metadata<R: Read + Seek>(decoder: &mut Decoder<R>) -> BTreeMap<String, String> {
    decoder
        .get_tag_ascii_string(Tag::Unknown(GDAL_METADATA))
        .map(|xml| parse_gdal_metadata(&xml))
        .unwrap_or_default()
}

/// Dataset-level `<Item name="...">value</Item>` entries of a GDAL_METADATA
/// document. Per-band items (with a `sample` attribute) are skipped.
fn parse_gdal_metadata(xml: &str) -> BTreeMap<String, String> {
    let mut items = BTreeMap::new();
    let mut rest = xml;

    while let Some(start) = rest.find("<Item") {
        rest = &rest[start + "<Item".len()..];
        let Some(open_end) = rest.find('>') else { break };
        let attrs = &rest[..open_end];
        rest = &rest[open_end + 1..];
        let Some(close) = rest.find("</Item>") else { break };
        let value = &rest[..close];
        rest = &rest[close + "</Item>".len()..];

        if attrs.contains("sample=") {
            continue;
        }
        if let Some(name) = attribute(attrs, "name") {
            items.insert(xml_unescape(name), xml_unescape(value));
        }
    }

    items
}

fn attribute<'a>(attrs: &'a str, key: &str) -> Option<&'a str> {
    let pattern = format!("{}=\"", key);
    let start = attrs.find(&pattern)? + pattern.len();
    let len = attrs[start..].find('"')?;
    Some(&attrs[start..start + len])
}

fn xml_unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

// ---------------------------------------------------------------------------
// Writing
// ---------------------------------------------------------------------------

/// Encode a grid with its own metadata into an in-memory GeoTIFF
pub fn write_geotiff_to_buffer(grid: &RasterGrid) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    encode_geotiff(grid.pixels(), grid.metadata(), Cursor::new(&mut buf))?;
    Ok(buf)
}

/// Encode `pixels` as a GeoTIFF described by `meta` into any `Write + Seek`
/// sink. `meta` must already agree with the pixel shape.
pub(crate) fn encode_geotiff<W: Write + Seek>(
    pixels: ArrayView3<'_, f64>,
    meta: &RasterMetadata,
    writer: W,
) -> Result<()> {
    if !meta.driver.eq_ignore_ascii_case(GTIFF_DRIVER) {
        return Err(Error::Format(format!(
            "driver '{}' is not supported, only {}",
            meta.driver, GTIFF_DRIVER
        )));
    }

    let (bands, rows, cols) = pixels.dim();
    let dtype = meta.dtype;

    let mut encoder = TiffEncoder::new(writer).map_err(tiff_err("TIFF encoder error"))?;
    let mut dir = encoder
        .image_directory()
        .map_err(tiff_err("Cannot create TIFF image"))?;

    let write_err = tiff_err("Cannot write TIFF tag");
    dir.write_tag(Tag::ImageWidth, cols as u32).map_err(&write_err)?;
    dir.write_tag(Tag::ImageLength, rows as u32).map_err(&write_err)?;
    dir.write_tag(Tag::BitsPerSample, vec![dtype.bits(); bands].as_slice())
        .map_err(&write_err)?;
    dir.write_tag(Tag::Compression, 1u16).map_err(&write_err)?;
    // BlackIsZero: plain sample planes, no colour semantics
    dir.write_tag(Tag::PhotometricInterpretation, 1u16).map_err(&write_err)?;
    dir.write_tag(Tag::SamplesPerPixel, bands as u16).map_err(&write_err)?;
    dir.write_tag(Tag::SampleFormat, vec![dtype.sample_format(); bands].as_slice())
        .map_err(&write_err)?;
    dir.write_tag(Tag::PlanarConfiguration, 1u16).map_err(&write_err)?;
    dir.write_tag(Tag::RowsPerStrip, rows as u32).map_err(&write_err)?;
    if bands > 1 {
        dir.write_tag(Tag::ExtraSamples, vec![0u16; bands - 1].as_slice())
            .map_err(&write_err)?;
    }

    write_geo_tags(&mut dir, meta)?;

    let bytes = encode_samples(pixels, meta);
    let offset = dir
        .write_data(bytes.as_slice())
        .map_err(tiff_err("Cannot write image data"))?;
    dir.write_tag(Tag::StripOffsets, classic_u32(offset)?).map_err(&write_err)?;
    dir.write_tag(Tag::StripByteCounts, classic_u32(bytes.len() as u64)?)
        .map_err(&write_err)?;

    dir.finish().map_err(tiff_err("Cannot finish TIFF image"))?;
    Ok(())
}

/// Offsets and byte counts of a classic TIFF are 32-bit
fn classic_u32(value: u64) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| Error::Format("raster exceeds the 4 GiB classic TIFF limit".into()))
}

fn write_geo_tags<W: Write + Seek, K: TiffKind>(
    dir: &mut DirectoryEncoder<'_, W, K>,
    meta: &RasterMetadata,
) -> Result<()> {
    let write_err = tiff_err("Cannot write GeoTIFF tag");
    let gt = &meta.transform;

    if gt.is_north_up() {
        let scale = [gt.pixel_width, -gt.pixel_height, 0.0];
        dir.write_tag(Tag::Unknown(MODEL_PIXEL_SCALE), &scale[..])
            .map_err(&write_err)?;
        let tiepoint = [0.0, 0.0, 0.0, gt.origin_x, gt.origin_y, 0.0];
        dir.write_tag(Tag::Unknown(MODEL_TIEPOINT), &tiepoint[..])
            .map_err(&write_err)?;
    } else {
        let matrix = [
            gt.pixel_width, gt.row_rotation, 0.0, gt.origin_x,
            gt.col_rotation, gt.pixel_height, 0.0, gt.origin_y,
            0.0, 0.0, 0.0, 0.0,
            0.0, 0.0, 0.0, 1.0,
        ];
        dir.write_tag(Tag::Unknown(MODEL_TRANSFORMATION), &matrix[..])
            .map_err(&write_err)?;
    }

    let (keys, ascii) = geokey_directory(meta.crs.as_ref());
    dir.write_tag(Tag::Unknown(GEO_KEY_DIRECTORY), keys.as_slice())
        .map_err(&write_err)?;
    if let Some(ascii) = ascii {
        dir.write_tag(Tag::Unknown(GEO_ASCII_PARAMS), ascii.as_str())
            .map_err(&write_err)?;
    }

    if let Some(nodata) = meta.nodata {
        let text = if nodata.is_nan() {
            "nan".to_string()
        } else {
            format!("{}", nodata)
        };
        dir.write_tag(Tag::Unknown(GDAL_NODATA), text.as_str())
            .map_err(&write_err)?;
    }

    if !meta.tags.is_empty() {
        let mut xml = String::from("<GDALMetadata>");
        for (key, value) in &meta.tags {
            xml.push_str(&format!(
                "<Item name=\"{}\">{}</Item>",
                xml_escape(key),
                xml_escape(value)
            ));
        }
        xml.push_str("</GDALMetadata>");
        dir.write_tag(Tag::Unknown(GDAL_METADATA), xml.as_str())
            .map_err(&write_err)?;
    }

    Ok(())
}

/// GeoKeyDirectory entries (sorted by key id) and the GeoAsciiParams text
/// they reference, if any.
fn geokey_directory(crs: Option<&CRS>) -> (Vec<u16>, Option<String>) {
    let mut entries: Vec<[u16; 4]> = vec![[GT_RASTER_TYPE_GEO_KEY, 0, 1, RASTER_PIXEL_IS_AREA]];
    let mut ascii = None;

    if let Some(crs) = crs {
        let model = if crs.is_geographic() {
            MODEL_TYPE_GEOGRAPHIC
        } else {
            MODEL_TYPE_PROJECTED
        };
        entries.push([GT_MODEL_TYPE_GEO_KEY, 0, 1, model]);

        match crs.epsg().and_then(|code| u16::try_from(code).ok()) {
            Some(code) => {
                let key = if crs.is_geographic() {
                    GEOGRAPHIC_TYPE_GEO_KEY
                } else {
                    PROJECTED_CS_TYPE_GEO_KEY
                };
                entries.push([key, 0, 1, code]);
            }
            None => {
                let citation = crs
                    .wkt()
                    .or(crs.proj())
                    .map(str::to_string)
                    .unwrap_or_else(|| crs.identifier());
                let text = format!("{}|", citation);
                entries.push([GT_CITATION_GEO_KEY, GEO_ASCII_PARAMS, text.len() as u16, 0]);
                ascii = Some(text);
            }
        }
    }

    entries.sort_by_key(|e| e[0]);

    let mut keys = vec![1, 1, 0, entries.len() as u16];
    for entry in entries {
        keys.extend_from_slice(&entry);
    }
    (keys, ascii)
}

/// Pixel-interleaved sample bytes in the platform byte order, which is the
/// order the encoder declares in the TIFF header.
fn encode_samples(pixels: ArrayView3<'_, f64>, meta: &RasterMetadata) -> Vec<u8> {
    let (bands, rows, cols) = pixels.dim();
    let fill = meta.nodata.unwrap_or(0.0);
    let mut out = Vec::with_capacity(bands * rows * cols * (meta.dtype.bits() as usize / 8));

    for r in 0..rows {
        for c in 0..cols {
            for b in 0..bands {
                let v = pixels[(b, r, c)];
                match meta.dtype {
                    DataType::F32 => out.extend_from_slice(&(v as f32).to_ne_bytes()),
                    DataType::F64 => out.extend_from_slice(&v.to_ne_bytes()),
                    DataType::U8 => out.extend_from_slice(&to_int::<u8>(v, fill).to_ne_bytes()),
                    DataType::U16 => out.extend_from_slice(&to_int::<u16>(v, fill).to_ne_bytes()),
                    DataType::U32 => out.extend_from_slice(&to_int::<u32>(v, fill).to_ne_bytes()),
                    DataType::I8 => out.extend_from_slice(&to_int::<i8>(v, fill).to_ne_bytes()),
                    DataType::I16 => out.extend_from_slice(&to_int::<i16>(v, fill).to_ne_bytes()),
                    DataType::I32 => out.extend_from_slice(&to_int::<i32>(v, fill).to_ne_bytes()),
                }
            }
        }
    }

    out
}

/// Round to the nearest integer sample; NaN and out-of-range values become
/// the nodata value (or zero when that does not fit either).
fn to_int<T: NumCast + Zero>(value: f64, fill: f64) -> T {
    let value = if value.is_nan() { fill } else { value.round() };
    num_traits::cast(value)
        .or_else(|| num_traits::cast(fill))
        .unwrap_or_else(T::zero)
}
