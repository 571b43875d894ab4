//! Raster profile metadata and key-by-key overrides

use crate::crs::CRS;
use crate::raster::GeoTransform;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Driver name written into every profile produced by the native codec
pub const GTIFF_DRIVER: &str = "GTiff";

/// Storage type of raster samples on disk.
///
/// In memory every grid holds `f64`; the data type only decides how samples
/// are decoded and encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    U8,
    U16,
    U32,
    I8,
    I16,
    I32,
    F32,
    F64,
}

impl DataType {
    /// Size of one sample in bits
    pub fn bits(self) -> u16 {
        match self {
            DataType::U8 | DataType::I8 => 8,
            DataType::U16 | DataType::I16 => 16,
            DataType::U32 | DataType::I32 | DataType::F32 => 32,
            DataType::F64 => 64,
        }
    }

    /// TIFF SampleFormat code (1 = unsigned, 2 = signed, 3 = IEEE float)
    pub fn sample_format(self) -> u16 {
        match self {
            DataType::U8 | DataType::U16 | DataType::U32 => 1,
            DataType::I8 | DataType::I16 | DataType::I32 => 2,
            DataType::F32 | DataType::F64 => 3,
        }
    }

    /// Whether NaN is representable
    pub fn is_float(self) -> bool {
        matches!(self, DataType::F32 | DataType::F64)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::U8 => "uint8",
            DataType::U16 => "uint16",
            DataType::U32 => "uint32",
            DataType::I8 => "int8",
            DataType::I16 => "int16",
            DataType::I32 => "int32",
            DataType::F32 => "float32",
            DataType::F64 => "float64",
        };
        f.write_str(name)
    }
}

/// Georeferencing profile of a raster: everything needed to write the grid
/// back out losslessly.
///
/// Treated as an immutable record. Changes are expressed as a
/// [`MetadataOverride`] and applied with [`RasterMetadata::merge`], which
/// returns a new profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RasterMetadata {
    pub driver: String,
    pub dtype: DataType,
    pub width: usize,
    pub height: usize,
    /// Number of bands
    pub count: usize,
    pub crs: Option<CRS>,
    pub transform: GeoTransform,
    pub nodata: Option<f64>,
    /// Free-form keys carried through the GDAL_METADATA tag
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl RasterMetadata {
    /// Profile for a `count` x `height` x `width` float32 grid with a default transform
    pub fn new(count: usize, height: usize, width: usize) -> Self {
        Self {
            driver: GTIFF_DRIVER.to_string(),
            dtype: DataType::F32,
            width,
            height,
            count,
            crs: None,
            transform: GeoTransform::default(),
            nodata: None,
            tags: BTreeMap::new(),
        }
    }

    pub fn with_crs(mut self, crs: CRS) -> Self {
        self.crs = Some(crs);
        self
    }

    pub fn with_transform(mut self, transform: GeoTransform) -> Self {
        self.transform = transform;
        self
    }

    pub fn with_nodata(mut self, nodata: Option<f64>) -> Self {
        self.nodata = nodata;
        self
    }

    pub fn with_dtype(mut self, dtype: DataType) -> Self {
        self.dtype = dtype;
        self
    }

    /// Apply `overrides` on top of this profile. Every key present in the
    /// override wins; tags are merged key by key. `self` is left untouched.
    pub fn merge(&self, overrides: &MetadataOverride) -> RasterMetadata {
        let mut merged = self.clone();

        if let Some(driver) = &overrides.driver {
            merged.driver = driver.clone();
        }
        if let Some(dtype) = overrides.dtype {
            merged.dtype = dtype;
        }
        if let Some(width) = overrides.width {
            merged.width = width;
        }
        if let Some(height) = overrides.height {
            merged.height = height;
        }
        if let Some(count) = overrides.count {
            merged.count = count;
        }
        if let Some(crs) = &overrides.crs {
            merged.crs = Some(crs.clone());
        }
        if let Some(transform) = overrides.transform {
            merged.transform = transform;
        }
        if let Some(nodata) = overrides.nodata {
            merged.nodata = nodata;
        }
        for (key, value) in &overrides.tags {
            merged.tags.insert(key.clone(), value.clone());
        }

        merged
    }

    /// Geographic bounds (min_x, min_y, max_x, max_y)
    pub fn bounds(&self) -> (f64, f64, f64, f64) {
        self.transform.bounds(self.width, self.height)
    }

    /// Value used to fill cells that hold no valid data
    pub fn fill_value(&self) -> f64 {
        self.nodata.unwrap_or(f64::NAN)
    }
}

/// Partial profile: any key set here replaces the corresponding key of the
/// base profile on [`RasterMetadata::merge`].
///
/// `nodata` is doubly optional so an override can clear the nodata value
/// (`Some(None)`) as well as set it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataOverride {
    pub driver: Option<String>,
    pub dtype: Option<DataType>,
    pub width: Option<usize>,
    pub height: Option<usize>,
    pub count: Option<usize>,
    pub crs: Option<CRS>,
    pub transform: Option<GeoTransform>,
    #[serde(with = "double_option", skip_serializing_if = "Option::is_none")]
    pub nodata: Option<Option<f64>>,
    pub tags: BTreeMap<String, String>,
}

impl MetadataOverride {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn dtype(mut self, dtype: DataType) -> Self {
        self.dtype = Some(dtype);
        self
    }

    pub fn count(mut self, count: usize) -> Self {
        self.count = Some(count);
        self
    }

    pub fn crs(mut self, crs: CRS) -> Self {
        self.crs = Some(crs);
        self
    }

    pub fn transform(mut self, transform: GeoTransform) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn nodata(mut self, nodata: Option<f64>) -> Self {
        self.nodata = Some(nodata);
        self
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

/// `"nodata": null` clears the value, a missing key leaves it alone.
mod double_option {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(value: &Option<Option<f64>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(inner) => inner.serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Option<f64>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<f64>::deserialize(deserializer).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> RasterMetadata {
        RasterMetadata::new(3, 20, 10)
            .with_crs(CRS::from_epsg(32633))
            .with_transform(GeoTransform::new(1000.0, 2000.0, 10.0, -10.0))
            .with_nodata(Some(-9999.0))
            .with_dtype(DataType::U16)
    }

    #[test]
    fn test_merge_override_wins() {
        let meta = base();
        let merged = meta.merge(
            &MetadataOverride::new()
                .dtype(DataType::F32)
                .count(1)
                .tag("band_1", "ndvi"),
        );

        assert_eq!(merged.dtype, DataType::F32);
        assert_eq!(merged.count, 1);
        assert_eq!(merged.tags.get("band_1").map(String::as_str), Some("ndvi"));
        assert_eq!(merged.crs, meta.crs);
        assert_eq!(merged.transform, meta.transform);
        assert_eq!(merged.nodata, Some(-9999.0));
    }

    #[test]
    fn test_merge_leaves_base_untouched() {
        let meta = base();
        let snapshot = meta.clone();
        let _ = meta.merge(&MetadataOverride::new().count(7).nodata(None));
        assert_eq!(meta, snapshot);
    }

    #[test]
    fn test_override_can_clear_nodata() {
        let merged = base().merge(&MetadataOverride::new().nodata(None));
        assert_eq!(merged.nodata, None);
        assert!(merged.fill_value().is_nan());
    }

    #[test]
    fn test_override_from_json() {
        let missing: MetadataOverride = serde_json::from_str(r#"{"count": 1}"#).unwrap();
        assert_eq!(missing.nodata, None);
        assert_eq!(missing.count, Some(1));

        let cleared: MetadataOverride = serde_json::from_str(r#"{"nodata": null}"#).unwrap();
        assert_eq!(cleared.nodata, Some(None));

        let set: MetadataOverride =
            serde_json::from_str(r#"{"nodata": 0.0, "dtype": "f64"}"#).unwrap();
        assert_eq!(set.nodata, Some(Some(0.0)));
        assert_eq!(set.dtype, Some(DataType::F64));
    }

    #[test]
    fn test_empty_override_is_identity() {
        let meta = base();
        assert!(MetadataOverride::new().is_empty());
        assert_eq!(meta.merge(&MetadataOverride::new()), meta);
    }
}
