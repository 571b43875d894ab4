//! JSON pipeline configuration
//!
//! ```json
//! {
//!   "inputs": { "early": "scene_2020.tif", "late": "scene_2021.tif" },
//!   "constants": { "p": 0.5, "c": 1.0 },
//!   "layers": [
//!     { "name": "ndvi_early", "formula": "(early[3] - early[2]) / (early[3] + early[2])" },
//!     { "name": "ndvi_late",  "formula": "(late[3] - late[2]) / (late[3] + late[2])" },
//!     { "name": "change",     "formula": "(ndvi_late - ndvi_early) / ndvi_early * 100" }
//!   ],
//!   "outputs": [
//!     { "layer": "change", "path": "change.tif", "region": "field.geojson" },
//!     { "layer": "ndvi_late", "path": "ndvi.tif", "band": 3, "metadata": { "nodata": -9999.0 } }
//!   ],
//!   "zero_division": "nan"
//! }
//! ```
//!
//! Relative paths are resolved against the directory of the configuration
//! file. Inputs are registered in name order, so derived grids take their
//! georeferencing from the input whose name sorts first.

use super::Pipeline;
use crate::algebra::{NumericPolicy, ZeroDivision};
use crate::clip::{clip_to_region, ClipParams};
use bandstack_core::io::{write_band, write_grid};
use bandstack_core::vector::read_geojson;
use bandstack_core::{Error, MetadataOverride, RasterGrid, RasterMetadata, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// A pipeline described as data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    /// Source name → GeoTIFF path
    pub inputs: BTreeMap<String, PathBuf>,
    #[serde(default)]
    pub constants: BTreeMap<String, f64>,
    pub layers: Vec<LayerSpec>,
    #[serde(default)]
    pub outputs: Vec<OutputSpec>,
    #[serde(default)]
    pub zero_division: ZeroDivision,
}

/// A derived layer given by formula text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LayerSpec {
    pub name: String,
    pub formula: String,
}

/// Where and how to write one layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputSpec {
    pub layer: String,
    pub path: PathBuf,
    /// Write the (single-band) layer into this band of a file shaped like
    /// the inputs; the other bands hold nodata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub band: Option<usize>,
    /// GeoJSON region to clip to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<PathBuf>,
    /// With a region: crop to its window (true) or only mask (false)
    #[serde(default = "default_crop")]
    pub crop: bool,
    #[serde(default, skip_serializing_if = "MetadataOverride::is_empty")]
    pub metadata: MetadataOverride,
}

fn default_crop() -> bool {
    true
}

impl PipelineConfig {
    /// Read a configuration file, resolving relative paths against its
    /// directory
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let mut config = Self::from_json(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        Ok(config)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    /// Make every relative path absolute with respect to `base`
    pub fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        self.inputs.values_mut().for_each(resolve);
        for output in &mut self.outputs {
            resolve(&mut output.path);
            if let Some(region) = output.region.as_mut() {
                resolve(region);
            }
        }
    }

    pub fn policy(&self) -> NumericPolicy {
        NumericPolicy::new(self.zero_division)
    }

    /// Load the inputs and build the pipeline
    pub fn pipeline(&self) -> Result<Pipeline> {
        let mut builder = Pipeline::builder().policy(self.policy());

        for (name, path) in &self.inputs {
            debug!(source = %name, path = %path.display(), "loading input");
            builder = builder.add_source(name.clone(), RasterGrid::load(path)?);
        }
        for (name, value) in &self.constants {
            builder = builder.add_constant(name.clone(), *value);
        }
        for layer in &self.layers {
            builder = builder.add_formula_layer(layer.name.clone(), layer.formula.clone());
        }

        builder.build()
    }

    /// Build the pipeline and write every output in order.
    ///
    /// Returns the paths written.
    pub fn run(&self) -> Result<Vec<PathBuf>> {
        let mut pipeline = self.pipeline()?;
        let mut written = Vec::with_capacity(self.outputs.len());

        for output in &self.outputs {
            write_output(&mut pipeline, output)?;
            written.push(output.path.clone());
        }

        Ok(written)
    }
}

/// Evaluate, optionally clip, and write one output
pub fn write_output(pipeline: &mut Pipeline, output: &OutputSpec) -> Result<()> {
    let mut grid = pipeline.grid(&output.layer)?;

    if let Some(region) = &output.region {
        let roi = read_geojson(region)?;
        grid = clip_to_region(&grid, &roi, ClipParams { crop: output.crop })?;
    }

    match output.band {
        None => write_grid(&output.path, &grid, &output.metadata)?,
        Some(index) => {
            if grid.band_count() != 1 {
                return Err(Error::ShapeMismatch {
                    expected: (1, grid.height(), grid.width()),
                    actual: grid.shape(),
                });
            }
            let count = pipeline.template().map(|t| t.count).unwrap_or(1);
            let template = RasterMetadata {
                count,
                ..grid.metadata().clone()
            };
            write_band(&output.path, grid.band(0)?, index, &template, &output.metadata)?;
        }
    }

    debug!(layer = %output.layer, path = %output.path.display(), "wrote output");
    Ok(())
}
