//! bandstack CLI - pixel-wise band algebra on co-registered rasters

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, Level};
use tracing_subscriber::FmtSubscriber;

use bandstack_algorithms::algebra::{
    evaluate_formula, normalized_difference, normalized_difference_band, percent_change,
    scalar_ratio, scalar_ratio_shifted, NumericPolicy, ZeroDivision,
};
use bandstack_algorithms::clip::{clip_to_region, ClipParams};
use bandstack_algorithms::pipeline::PipelineConfig;
use bandstack_core::io::{read_geotiff, write_grid};
use bandstack_core::vector::read_geojson;
use bandstack_core::{DataType, Layer, LayerView, MetadataOverride, RasterGrid};

// ─── CLI structure ──────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "bandstack")]
#[command(author, version, about = "Band algebra on co-registered rasters", long_about = None)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show information about a raster file
    Info {
        /// Input raster file
        input: PathBuf,
    },
    /// Normalized difference (x - y) / (x + y)
    Ndi {
        /// Raster providing x
        x: PathBuf,
        /// Raster providing y
        y: PathBuf,
        /// Output file
        output: PathBuf,
        /// Use only this band (0-based) of both inputs
        #[arg(short, long)]
        band: Option<usize>,
        #[command(flatten)]
        opts: AlgebraOpts,
    },
    /// Scalar ratio (1 + p*c + x) / (y + p + c)
    Ratio {
        /// Raster providing x
        x: PathBuf,
        /// Raster providing y
        y: PathBuf,
        /// Output file
        output: PathBuf,
        #[arg(short, long, default_value = "0.5")]
        p: f64,
        #[arg(short, long, default_value = "1.0")]
        c: f64,
        /// Use (1 + (p + c) + x) / (y + p*c) instead
        #[arg(long)]
        shifted: bool,
        #[command(flatten)]
        opts: AlgebraOpts,
    },
    /// Percent change (b - a) / a * 100
    Change {
        /// Earlier raster
        a: PathBuf,
        /// Later raster
        b: PathBuf,
        /// Output file
        output: PathBuf,
        #[command(flatten)]
        opts: AlgebraOpts,
    },
    /// Evaluate a formula over named rasters
    Calc {
        /// Formula, e.g. "(nir - red) / (nir + red)" or "(s[3] - s[2]) / (s[3] + s[2])"
        #[arg(short, long)]
        formula: String,
        /// Named input as name=path (repeatable)
        #[arg(short, long = "input", value_parser = parse_named_path, required = true)]
        inputs: Vec<(String, PathBuf)>,
        /// Named constant as name=value (repeatable)
        #[arg(long = "const", value_parser = parse_named_value)]
        constants: Vec<(String, f64)>,
        /// Output file
        output: PathBuf,
        #[command(flatten)]
        opts: AlgebraOpts,
    },
    /// Clip a raster to a GeoJSON region
    Clip {
        /// Input raster file
        input: PathBuf,
        /// GeoJSON polygon or multipolygon
        region: PathBuf,
        /// Output file
        output: PathBuf,
        /// Keep the full extent and only mask outside pixels
        #[arg(long)]
        mask_only: bool,
        #[command(flatten)]
        out: OutputOpts,
    },
    /// Run a JSON pipeline configuration
    Run {
        /// Pipeline configuration file
        config: PathBuf,
        /// Validate the pipeline without writing outputs
        #[arg(long)]
        check: bool,
    },
}

/// Options shared by the algebra subcommands
#[derive(clap::Args)]
struct AlgebraOpts {
    /// Let division by zero follow IEEE-754 (±inf) instead of yielding NaN
    #[arg(long)]
    ieee: bool,
    #[command(flatten)]
    out: OutputOpts,
}

impl AlgebraOpts {
    fn policy(&self) -> NumericPolicy {
        if self.ieee {
            NumericPolicy::new(ZeroDivision::Ieee)
        } else {
            NumericPolicy::default()
        }
    }
}

/// Profile overrides applied when writing
#[derive(clap::Args)]
struct OutputOpts {
    /// Output sample type: u8, u16, u32, i8, i16, i32, f32, f64
    #[arg(long, value_parser = parse_dtype)]
    dtype: Option<DataType>,
    /// Output nodata value
    #[arg(long, conflicts_with = "no_nodata")]
    nodata: Option<f64>,
    /// Write without a nodata value
    #[arg(long)]
    no_nodata: bool,
}

impl OutputOpts {
    fn overrides(&self) -> MetadataOverride {
        let mut overrides = MetadataOverride::new();
        if let Some(dtype) = self.dtype {
            overrides = overrides.dtype(dtype);
        }
        if self.no_nodata {
            overrides = overrides.nodata(None);
        } else if let Some(nodata) = self.nodata {
            overrides = overrides.nodata(Some(nodata));
        }
        overrides
    }
}

// ─── Helpers ────────────────────────────────────────────────────────────

fn setup_logging(verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")
}

fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb
}

fn read_raster(path: &Path) -> Result<RasterGrid> {
    let pb = spinner("Reading raster...");
    let grid = read_geotiff(path)
        .with_context(|| format!("Failed to read raster {}", path.display()))?;
    pb.finish_and_clear();
    let (bands, rows, cols) = grid.shape();
    info!("Input: {} x {} x {} band(s)", cols, rows, bands);
    Ok(grid)
}

/// Wrap an algebra result with the georeferencing of `template` and write it
fn write_layer(layer: Layer, template: &RasterGrid, path: &Path, out: &OutputOpts) -> Result<()> {
    let grid = RasterGrid::from_layer(layer, template.metadata())
        .context("Failed to georeference result")?;
    write_result(&grid, path, out)
}

fn write_result(grid: &RasterGrid, path: &Path, out: &OutputOpts) -> Result<()> {
    let pb = spinner("Writing output...");
    write_grid(path, grid, &out.overrides()).context("Failed to write output")?;
    pb.finish_and_clear();
    Ok(())
}

fn done(name: &str, path: &Path, elapsed: std::time::Duration) {
    println!("{} saved to: {}", name, path.display());
    println!("  Processing time: {:.2?}", elapsed);
}

fn parse_named_path(s: &str) -> std::result::Result<(String, PathBuf), String> {
    let (name, path) = s
        .split_once('=')
        .ok_or_else(|| format!("expected name=path, got: {}", s))?;
    Ok((name.trim().to_string(), PathBuf::from(path.trim())))
}

fn parse_named_value(s: &str) -> std::result::Result<(String, f64), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got: {}", s))?;
    let value = value
        .trim()
        .parse()
        .map_err(|_| format!("invalid number: {}", value))?;
    Ok((name.trim().to_string(), value))
}

fn parse_dtype(s: &str) -> std::result::Result<DataType, String> {
    match s.to_lowercase().as_str() {
        "u8" | "byte" => Ok(DataType::U8),
        "u16" | "uint16" => Ok(DataType::U16),
        "u32" | "uint32" => Ok(DataType::U32),
        "i8" | "int8" => Ok(DataType::I8),
        "i16" | "int16" => Ok(DataType::I16),
        "i32" | "int32" => Ok(DataType::I32),
        "f32" | "float32" => Ok(DataType::F32),
        "f64" | "float64" => Ok(DataType::F64),
        _ => Err(format!(
            "unknown data type: {}. Use u8, u16, u32, i8, i16, i32, f32 or f64.",
            s
        )),
    }
}

// ─── Main ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose)?;

    match cli.command {
        // ── Info ─────────────────────────────────────────────────────
        Commands::Info { input } => {
            let grid = read_raster(&input)?;
            let meta = grid.metadata();
            let bounds = grid.bounds();
            let t = grid.transform();

            println!("File: {}", input.display());
            println!(
                "Dimensions: {} x {}, {} band(s) of {}",
                grid.width(),
                grid.height(),
                grid.band_count(),
                meta.dtype
            );
            println!("Pixel size: {} x {}", t.pixel_width, t.pixel_height);
            println!(
                "Bounds: ({:.6}, {:.6}) - ({:.6}, {:.6})",
                bounds.0, bounds.1, bounds.2, bounds.3
            );
            if let Some(crs) = grid.crs() {
                println!("CRS: {}", crs);
            }
            if let Some(nodata) = grid.nodata() {
                println!("NoData: {}", nodata);
            }
            for (key, value) in &meta.tags {
                println!("Tag {}: {}", key, value);
            }

            let cells = (grid.width() * grid.height()).max(1);
            for band in 0..grid.band_count() {
                let stats = grid.statistics(band)?;
                println!("\nBand {}:", band);
                if let Some(min) = stats.min {
                    println!("  Min: {:.4}", min);
                }
                if let Some(max) = stats.max {
                    println!("  Max: {:.4}", max);
                }
                if let Some(mean) = stats.mean {
                    println!("  Mean: {:.4}", mean);
                }
                println!(
                    "  Valid cells: {} ({:.1}%)",
                    stats.valid_count,
                    100.0 * stats.valid_count as f64 / cells as f64
                );
            }
        }

        // ── Algebra ──────────────────────────────────────────────────
        Commands::Ndi {
            x,
            y,
            output,
            band,
            opts,
        } => {
            let x = read_raster(&x)?;
            let y = read_raster(&y)?;
            let start = Instant::now();
            let result = match band {
                Some(band) => normalized_difference_band(&x, &y, band, opts.policy()),
                None => normalized_difference(&x, &y, opts.policy()),
            }
            .context("Failed to compute normalized difference")?;
            let elapsed = start.elapsed();
            write_layer(result, &x, &output, &opts.out)?;
            done("Normalized difference", &output, elapsed);
        }

        Commands::Ratio {
            x,
            y,
            output,
            p,
            c,
            shifted,
            opts,
        } => {
            let x = read_raster(&x)?;
            let y = read_raster(&y)?;
            let start = Instant::now();
            let result = if shifted {
                scalar_ratio_shifted(&x, &y, p, c, opts.policy())
            } else {
                scalar_ratio(&x, &y, p, c, opts.policy())
            }
            .context("Failed to compute scalar ratio")?;
            let elapsed = start.elapsed();
            write_layer(result, &x, &output, &opts.out)?;
            done("Scalar ratio", &output, elapsed);
        }

        Commands::Change { a, b, output, opts } => {
            let a = read_raster(&a)?;
            let b = read_raster(&b)?;
            let start = Instant::now();
            let result =
                percent_change(&a, &b, opts.policy()).context("Failed to compute change")?;
            let elapsed = start.elapsed();
            write_layer(result, &a, &output, &opts.out)?;
            done("Percent change", &output, elapsed);
        }

        Commands::Calc {
            formula,
            inputs,
            constants,
            output,
            opts,
        } => {
            let grids = inputs
                .iter()
                .map(|(name, path)| Ok((name.as_str(), read_raster(path)?)))
                .collect::<Result<Vec<_>>>()?;
            let constants: BTreeMap<String, f64> = constants.into_iter().collect();

            let start = Instant::now();
            let operands: Vec<(&str, LayerView<'_>)> = grids
                .iter()
                .map(|(name, grid)| (*name, LayerView::from(grid)))
                .collect();
            let result = evaluate_formula(&formula, &operands, &constants, opts.policy())
                .context("Failed to evaluate formula")?;
            let elapsed = start.elapsed();

            // Inputs are non-empty (required by clap)
            let template = &grids[0].1;
            write_layer(result, template, &output, &opts.out)?;
            done("Formula", &output, elapsed);
        }

        // ── Clipping ─────────────────────────────────────────────────
        Commands::Clip {
            input,
            region,
            output,
            mask_only,
            out,
        } => {
            let grid = read_raster(&input)?;
            let roi = read_geojson(&region)
                .with_context(|| format!("Failed to read region {}", region.display()))?;
            let start = Instant::now();
            let result = clip_to_region(&grid, &roi, ClipParams { crop: !mask_only })
                .context("Failed to clip raster")?;
            let elapsed = start.elapsed();
            info!("Output: {} x {}", result.width(), result.height());
            write_result(&result, &output, &out)?;
            done("Clipped raster", &output, elapsed);
        }

        // ── Pipelines ────────────────────────────────────────────────
        Commands::Run { config, check } => {
            let config = PipelineConfig::from_path(&config)
                .with_context(|| format!("Failed to load {}", config.display()))?;

            if check {
                let pb = spinner("Loading inputs...");
                let pipeline = config.pipeline().context("Failed to build pipeline")?;
                pb.finish_and_clear();
                for name in pipeline.layer_names() {
                    debug!("layer {}", name);
                }
                println!(
                    "Pipeline OK: {} input(s), {} layer(s), {} output(s)",
                    config.inputs.len(),
                    config.layers.len(),
                    config.outputs.len()
                );
                return Ok(());
            }

            let pb = spinner("Running pipeline...");
            let start = Instant::now();
            let written = config.run().context("Failed to run pipeline")?;
            let elapsed = start.elapsed();
            pb.finish_and_clear();

            for (output, path) in config.outputs.iter().zip(&written) {
                println!("{} saved to: {}", output.layer, path.display());
            }
            println!("  Processing time: {:.2?}", elapsed);
        }
    }

    Ok(())
}
