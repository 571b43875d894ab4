//! End-to-end tests: GeoTIFF in, band algebra and pipelines, clipping,
//! GeoTIFF out.
//!
//! Every test builds its own small scenes in a temporary directory, so no
//! fixtures are needed.

use approx::assert_relative_eq;
use bandstack_algorithms::prelude::*;
use ndarray::Array3;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const ORIGIN_X: f64 = 500_000.0;
const ORIGIN_Y: f64 = 4_000_000.0;

/// 4-band 20 x 20 scene of 10 m pixels. Band 2 is red, band 3 is NIR.
fn scene(nir_base: f64) -> RasterGrid {
    let pixels = Array3::from_shape_fn((4, 20, 20), |(b, r, c)| match b {
        2 => 10.0 + r as f64,
        3 => nir_base + c as f64,
        _ => (b * 100 + r * 20 + c) as f64,
    });
    let meta = RasterMetadata::new(4, 20, 20)
        .with_transform(GeoTransform::new(ORIGIN_X, ORIGIN_Y, 10.0, -10.0))
        .with_crs(CRS::from_epsg(32633))
        .with_nodata(Some(-9999.0))
        .with_dtype(DataType::U16);
    RasterGrid::new(pixels, meta).unwrap()
}

fn ndvi_at(nir_base: f64, r: usize, c: usize) -> f64 {
    let red = 10.0 + r as f64;
    let nir = nir_base + c as f64;
    (nir - red) / (nir + red)
}

fn write_scenes(dir: &TempDir) -> (PathBuf, PathBuf) {
    let early = dir.path().join("early.tif");
    let late = dir.path().join("late.tif");
    write_grid(&early, &scene(50.0), &MetadataOverride::new()).unwrap();
    write_grid(&late, &scene(60.0), &MetadataOverride::new()).unwrap();
    (early, late)
}

/// Rectangle covering columns 5..15 and rows 5..10 exactly
fn write_region(dir: &Path) -> PathBuf {
    let (x0, x1) = (ORIGIN_X + 50.0, ORIGIN_X + 150.0);
    let (y0, y1) = (ORIGIN_Y - 100.0, ORIGIN_Y - 50.0);
    let geojson = format!(
        r#"{{"type": "FeatureCollection", "features": [{{
            "type": "Feature", "properties": {{"name": "field"}},
            "geometry": {{"type": "Polygon", "coordinates": [[
                [{x0}, {y0}], [{x1}, {y0}], [{x1}, {y1}], [{x0}, {y1}], [{x0}, {y0}]
            ]]}}
        }}]}}"#
    );
    let path = dir.join("field.geojson");
    std::fs::write(&path, geojson).unwrap();
    path
}

#[test]
fn ndvi_from_files_survives_export() {
    let dir = TempDir::new().unwrap();
    let (early, _) = write_scenes(&dir);

    let grid = RasterGrid::load(&early).unwrap();
    assert_eq!(grid.shape(), (4, 20, 20));
    assert_eq!(grid.metadata().dtype, DataType::U16);

    let ndvi = normalized_difference(grid.band(3).unwrap(), grid.band(2).unwrap(), NumericPolicy::default())
        .unwrap();
    let out = RasterGrid::from_layer(ndvi, grid.metadata()).unwrap();
    let path = dir.path().join("ndvi.tif");
    write_grid(&path, &out, &MetadataOverride::new()).unwrap();

    let reloaded = RasterGrid::load(&path).unwrap();
    assert_eq!(reloaded.shape(), (1, 20, 20));
    assert_eq!(reloaded.metadata().dtype, DataType::F32);
    assert_eq!(reloaded.transform(), grid.transform());
    assert!(reloaded.nodata().is_some_and(f64::is_nan));
    assert!(reloaded.crs().unwrap().is_equivalent(&CRS::from_epsg(32633)));

    let band = reloaded.band(0).unwrap();
    for r in [0, 7, 19] {
        for c in [0, 11, 19] {
            assert_relative_eq!(band[(r, c)], ndvi_at(50.0, r, c), max_relative = 1e-6);
        }
    }
}

#[test]
fn pipeline_change_detection_and_clip() {
    let dir = TempDir::new().unwrap();
    let (early, late) = write_scenes(&dir);
    let region = read_geojson(write_region(dir.path())).unwrap();

    let mut pipeline = Pipeline::builder()
        .add_source("early", RasterGrid::load(&early).unwrap())
        .add_source("late", RasterGrid::load(&late).unwrap())
        .add_formula_layer("ndvi_early", "(early[3] - early[2]) / (early[3] + early[2])")
        .add_formula_layer("ndvi_late", "(late[3] - late[2]) / (late[3] + late[2])")
        .add_formula_layer("change", "(ndvi_late - ndvi_early) / ndvi_early * 100")
        .build()
        .unwrap();

    let change = pipeline.grid("change").unwrap();
    assert!(pipeline.is_cached("ndvi_early"));
    assert!(pipeline.is_cached("ndvi_late"));

    let clipped = clip(&change, &region).unwrap();
    assert_eq!(clipped.shape(), (1, 5, 10));
    assert_eq!(clipped.transform().origin_x, ORIGIN_X + 50.0);
    assert_eq!(clipped.transform().origin_y, ORIGIN_Y - 50.0);

    let path = dir.path().join("change.tif");
    write_grid(&path, &clipped, &MetadataOverride::new()).unwrap();
    let reloaded = RasterGrid::load(&path).unwrap();
    assert_eq!(reloaded.shape(), (1, 5, 10));

    let band = reloaded.band(0).unwrap();
    for r in 0..5 {
        for c in 0..10 {
            let (before, after) = (ndvi_at(50.0, r + 5, c + 5), ndvi_at(60.0, r + 5, c + 5));
            let expected = (after - before) / before * 100.0;
            assert_relative_eq!(band[(r, c)], expected, max_relative = 1e-5);
        }
    }
}

#[test]
fn config_run_writes_every_output() {
    let dir = TempDir::new().unwrap();
    write_scenes(&dir);
    write_region(dir.path());

    let config_path = dir.path().join("pipeline.json");
    std::fs::write(
        &config_path,
        r#"{
            "inputs": {"early": "early.tif", "late": "late.tif"},
            "constants": {"scale": 100.0},
            "layers": [
                {"name": "ndvi_early", "formula": "(early[3] - early[2]) / (early[3] + early[2])"},
                {"name": "ndvi_late", "formula": "(late[3] - late[2]) / (late[3] + late[2])"},
                {"name": "change", "formula": "(ndvi_late - ndvi_early) / ndvi_early * scale"}
            ],
            "outputs": [
                {"layer": "change", "path": "out/change.tif", "region": "field.geojson"},
                {"layer": "change", "path": "out/change_masked.tif", "region": "field.geojson", "crop": false},
                {"layer": "ndvi_late", "path": "out/ndvi_stack.tif", "band": 1},
                {"layer": "ndvi_early", "path": "out/ndvi_f64.tif", "metadata": {"dtype": "f64", "nodata": null}}
            ]
        }"#,
    )
    .unwrap();
    std::fs::create_dir(dir.path().join("out")).unwrap();

    let config = PipelineConfig::from_path(&config_path).unwrap();
    let written = config.run().unwrap();
    assert_eq!(written.len(), 4);
    assert!(written.iter().all(|p| p.exists()));

    let cropped = RasterGrid::load(&written[0]).unwrap();
    assert_eq!(cropped.shape(), (1, 5, 10));

    let masked = RasterGrid::load(&written[1]).unwrap();
    assert_eq!(masked.shape(), (1, 20, 20));
    assert!(masked.band(0).unwrap()[(0, 0)].is_nan());
    assert!(!masked.band(0).unwrap()[(7, 7)].is_nan());

    // Band mode: shaped like the inputs, other bands hold nodata
    let stack = RasterGrid::load(&written[2]).unwrap();
    assert_eq!(stack.shape(), (4, 20, 20));
    assert!(stack.band(0).unwrap().iter().all(|v| v.is_nan()));
    assert_relative_eq!(stack.band(1).unwrap()[(3, 4)], ndvi_at(60.0, 3, 4), max_relative = 1e-6);

    let full = RasterGrid::load(&written[3]).unwrap();
    assert_eq!(full.metadata().dtype, DataType::F64);
    assert_eq!(full.nodata(), None);
    assert_eq!(full.band(0).unwrap()[(2, 9)], ndvi_at(50.0, 2, 9));
}

#[test]
fn config_with_cycle_is_rejected() {
    let config = PipelineConfig::from_json(
        r#"{
            "inputs": {},
            "layers": [
                {"name": "x", "formula": "y + 1"},
                {"name": "y", "formula": "x * 2"}
            ]
        }"#,
    )
    .unwrap();

    match config.pipeline() {
        Err(Error::CyclicDependency(path)) => {
            assert_eq!(path.first(), path.last());
            assert!(path.contains(&"x".to_string()) && path.contains(&"y".to_string()));
        }
        Err(other) => panic!("expected a cycle, got {}", other),
        Ok(_) => panic!("expected a cycle"),
    }
}

#[test]
fn config_output_for_unknown_layer_fails() {
    let dir = TempDir::new().unwrap();
    write_scenes(&dir);

    let mut config = PipelineConfig::from_json(
        r#"{"inputs": {"early": "early.tif"}, "layers": [],
            "outputs": [{"layer": "missing", "path": "missing.tif"}]}"#,
    )
    .unwrap();
    config.resolve_paths(dir.path());

    assert!(matches!(config.run(), Err(Error::UnknownLayer(name)) if name == "missing"));
    assert!(!dir.path().join("missing.tif").exists());
}

#[test]
fn band_output_of_stack_layer_is_rejected() {
    let dir = TempDir::new().unwrap();
    write_scenes(&dir);

    let mut config = PipelineConfig::from_json(
        r#"{"inputs": {"early": "early.tif"},
            "layers": [{"name": "double", "formula": "early * 2"}],
            "outputs": [{"layer": "double", "path": "double.tif", "band": 0}]}"#,
    )
    .unwrap();
    config.resolve_paths(dir.path());

    assert!(matches!(config.run(), Err(Error::ShapeMismatch { .. })));
}

#[test]
fn clip_outside_the_scene_is_empty() {
    let grid = scene(50.0);
    let region = RegionOfInterest::from_bounds(0.0, 0.0, 10.0, 10.0)
        .unwrap()
        .with_crs(CRS::from_epsg(32633));
    assert!(matches!(clip(&grid, &region), Err(Error::EmptyIntersection)));
}
