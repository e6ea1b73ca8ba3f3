use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use cdwtrace::augment::{augment_with_nodata, DEFAULT_AUGMENT_FRACTION};
use cdwtrace::export_csv::export_csv;
use cdwtrace::export_geojson::export_geojson;
use cdwtrace::segmentation::{SegmentationPredictor, DEFAULT_INPUT_SIZE};
use cdwtrace::training::summarize_dataset;
use cdwtrace::{
    CdwConfig, DataPreparer, Detector, GeoRaster, LabelSet, ProjTransform, RasterSource, WindowGrid,
};
use cdwtrace_common::OutputFormat;
use clap::{Parser, Subcommand};

/// Detect fallen logs (coarse woody debris) in LiDAR height rasters
#[derive(Parser, Debug)]
#[command(name = "cdwtrace")]
#[command(about = "Prepare CDW training data and detect CDW in height rasters", long_about = None)]
struct Cli {
    /// Config file (defaults to ./cdwtrace.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log library diagnostics (repeat for more)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Tile a raster and its labels into a YOLO segmentation dataset
    Prepare(PrepareArgs),
    /// Run a segmentation model over a raster and export detections
    Detect(DetectArgs),
    /// Copy a dataset and blank random regions of training images
    Augment(AugmentArgs),
    /// Write the trainer config next to a dataset
    TrainConfig(TrainConfigArgs),
    /// Summarize a dataset directory or a raster
    Inspect(InspectArgs),
}

#[derive(clap::Args, Debug)]
struct PrepareArgs {
    /// Height raster (GeoTIFF)
    #[arg(short, long)]
    raster: PathBuf,

    /// CDW line or polygon labels (GeoJSON)
    #[arg(short, long)]
    labels: PathBuf,

    /// Dataset directory
    #[arg(short, long, default_value = "dataset")]
    output: PathBuf,

    #[arg(long)]
    tile_size: Option<u32>,

    /// Fraction of a tile shared with its neighbour
    #[arg(long)]
    overlap: Option<f64>,

    /// Label buffer half-width in map units
    #[arg(long)]
    buffer_width: Option<f64>,

    #[arg(long)]
    min_log_pixels: Option<usize>,

    #[arg(long)]
    val_split: Option<f64>,

    #[arg(long)]
    max_nodata: Option<f64>,

    /// Seed for the train/val draw
    #[arg(long)]
    seed: Option<u64>,

    /// Add windows so the last row and column reach the raster edge
    #[arg(long)]
    extend_to_edges: bool,

    /// Also write `<output>_robust` with no-data augmentation
    #[arg(long)]
    augment_nodata: bool,
}

#[derive(clap::Args, Debug)]
struct DetectArgs {
    /// Height raster (GeoTIFF)
    #[arg(short, long)]
    raster: PathBuf,

    /// Segmentation model (ONNX)
    #[arg(short, long)]
    model: Option<PathBuf>,

    /// Output file path (without extension)
    #[arg(short, long, default_value = "detections")]
    output: String,

    /// Output format
    #[arg(short, long, value_enum, default_value = "both")]
    format: FormatArg,

    #[arg(long)]
    tile_size: Option<u32>,

    #[arg(long)]
    stride: Option<u32>,

    #[arg(long)]
    confidence: Option<f32>,

    #[arg(long)]
    iou: Option<f32>,

    /// Smallest polygon kept, square map units
    #[arg(long)]
    min_area: Option<f64>,

    /// Polygon IoU for cross-tile deduplication
    #[arg(long)]
    nms_iou: Option<f64>,

    #[arg(long)]
    extend_to_edges: bool,

    /// Model input edge length
    #[arg(long, default_value_t = DEFAULT_INPUT_SIZE)]
    imgsz: u32,
}

#[derive(clap::Args, Debug)]
struct AugmentArgs {
    /// Source dataset directory
    #[arg(short, long)]
    dataset: PathBuf,

    /// Augmented copy (replaced if present)
    #[arg(short, long)]
    output: PathBuf,

    #[arg(long)]
    fraction: Option<f64>,

    #[arg(long)]
    seed: Option<u64>,
}

#[derive(clap::Args, Debug)]
struct TrainConfigArgs {
    /// Dataset directory containing dataset.yaml
    #[arg(short, long)]
    dataset: PathBuf,

    #[arg(long)]
    model: Option<String>,

    #[arg(long)]
    epochs: Option<u32>,

    #[arg(long)]
    batch: Option<u32>,

    #[arg(long)]
    device: Option<String>,
}

#[derive(clap::Args, Debug)]
struct InspectArgs {
    /// Dataset directory or GeoTIFF
    path: PathBuf,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum FormatArg {
    #[value(name = "geojson")]
    GeoJson,
    Csv,
    Both,
}

impl From<FormatArg> for OutputFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::GeoJson => OutputFormat::GeoJson,
            FormatArg::Csv => OutputFormat::Csv,
            FormatArg::Both => OutputFormat::Both,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let config = CdwConfig::load(cli.config.as_deref()).context("failed to load config")?;
    if let Some(source) = &config.source {
        println!("Config: {}", source.display());
    }

    match cli.command {
        Command::Prepare(args) => run_prepare(&config, args),
        Command::Detect(args) => run_detect(&config, args),
        Command::Augment(args) => run_augment(&config, args),
        Command::TrainConfig(args) => run_train_config(&config, args),
        Command::Inspect(args) => run_inspect(&config, &args.path),
    }
}

fn run_prepare(config: &CdwConfig, args: PrepareArgs) -> Result<()> {
    let mut cfg = config.prepare_config();
    if let Some(v) = args.tile_size {
        cfg.tile_size = v;
    }
    if let Some(v) = args.overlap {
        cfg.overlap = v;
    }
    if let Some(v) = args.buffer_width {
        cfg.buffer_width = v;
    }
    if let Some(v) = args.min_log_pixels {
        cfg.min_log_pixels = v;
    }
    if let Some(v) = args.val_split {
        cfg.val_split = v;
    }
    if let Some(v) = args.max_nodata {
        cfg.max_nodata_fraction = v;
    }
    if args.seed.is_some() {
        cfg.seed = args.seed;
    }
    cfg.extend_to_edges |= args.extend_to_edges;

    println!("CDW Trace - Dataset Preparation");
    println!("===============================");
    println!("Raster: {}", args.raster.display());
    println!("Labels: {}", args.labels.display());
    println!("Output: {}", args.output.display());
    println!("Tile size: {} px, stride {} px", cfg.tile_size, cfg.stride());
    println!("Buffer width: {}", cfg.buffer_width);
    println!();

    let preparer = DataPreparer::new(&args.output, cfg).context("invalid preparation settings")?;

    println!("Step 1: Reading raster and labels...");
    let raster = GeoRaster::open(&args.raster)
        .with_context(|| format!("failed to open raster {}", args.raster.display()))?;
    let labels = LabelSet::from_geojson_file(&args.labels)
        .with_context(|| format!("failed to read labels {}", args.labels.display()))?;
    println!(
        "  {}x{} pixels, CRS {}, {} label features",
        raster.width(),
        raster.height(),
        raster.crs().unwrap_or("unknown"),
        labels.len()
    );

    println!("\nStep 2: Writing tiles...");
    let reprojection = ProjTransform::new();
    let stats = preparer
        .prepare(&raster, labels, Some(&reprojection))
        .context("dataset preparation failed")?;
    println!("  Total tiles:       {}", stats.total);
    println!("  With CDW:          {}", stats.with_cdw);
    println!("  Empty:             {}", stats.empty);
    println!("  Skipped (nodata):  {}", stats.skipped);
    println!("  Skipped (flat):    {}", stats.skipped_flat);

    if args.augment_nodata {
        let mut robust = args.output.clone().into_os_string();
        robust.push("_robust");
        let robust = PathBuf::from(robust);
        println!("\nStep 3: No-data augmentation into {}...", robust.display());
        let fraction = config.augment.fraction.unwrap_or(DEFAULT_AUGMENT_FRACTION);
        let seed = config.augment.seed.or(preparer.config().seed);
        let augmented = augment_with_nodata(&args.output, &robust, fraction, seed)
            .context("no-data augmentation failed")?;
        println!(
            "  Augmented {} of {} training images",
            augmented.augmented, augmented.train_images
        );
    }

    println!("\nDataset written to {}", args.output.display());
    Ok(())
}

fn run_detect(config: &CdwConfig, args: DetectArgs) -> Result<()> {
    let mut cfg = config.detector_config();
    if let Some(v) = args.tile_size {
        cfg.tile_size = v;
    }
    if let Some(v) = args.stride {
        cfg.stride = v;
    }
    if let Some(v) = args.confidence {
        cfg.confidence = v;
    }
    if let Some(v) = args.iou {
        cfg.iou_threshold = v;
    }
    if let Some(v) = args.min_area {
        cfg.min_area_m2 = v;
    }
    if let Some(v) = args.nms_iou {
        cfg.nms_iou = v;
    }
    cfg.extend_to_edges |= args.extend_to_edges;

    let model = args
        .model
        .or_else(|| config.detect.model.clone())
        .context("no model given; pass --model or set detect.model in the config")?;
    let format = OutputFormat::from(args.format);

    println!("CDW Trace - Detection");
    println!("=====================");
    println!("Raster: {}", args.raster.display());
    println!("Model: {}", model.display());
    println!("Output: {}", args.output);
    println!("Format: {:?}", args.format);
    println!("Tile size: {} px, stride {} px", cfg.tile_size, cfg.stride);
    println!("Confidence: {}, min area: {} m²", cfg.confidence, cfg.min_area_m2);
    println!();

    let detector = Detector::new(cfg).context("invalid detection settings")?;

    println!("Step 1: Reading raster...");
    let raster = GeoRaster::open(&args.raster)
        .with_context(|| format!("failed to open raster {}", args.raster.display()))?;
    println!(
        "  {}x{} pixels at {} m, CRS {}",
        raster.width(),
        raster.height(),
        raster.pixel_size(),
        raster.crs().unwrap_or("unknown")
    );

    println!("\nStep 2: Running inference...");
    // the model is released before deduplication starts
    let (detections, mut stats) = {
        let mut predictor = load_predictor(&model, args.imgsz)?;
        detector
            .detect_tiles(&raster, &mut *predictor)
            .context("inference failed")?
    };
    println!("  Windows:           {}", stats.windows);
    println!("  Skipped (nodata):  {}", stats.skipped_nodata);
    println!("  Skipped (flat):    {}", stats.skipped_flat);
    println!("  Raw detections:    {}", stats.raw_detections);

    println!("\nStep 3: Merging detections across tiles...");
    let objects = detector.finalize(detections);
    stats.final_detections = objects.len();
    println!("  Final detections:  {}", stats.final_detections);

    println!("\nStep 4: Exporting...");
    let crs = detector.output_crs(&raster);
    if format.writes_geojson() {
        let path = format!("{}.geojson", args.output);
        export_geojson(&objects, crs.as_deref(), Path::new(&path))
            .with_context(|| format!("failed to write {}", path))?;
        println!("Saved GeoJSON to: {}", path);
    }
    if format.writes_csv() {
        let path = format!("{}.csv", args.output);
        export_csv(&objects, crs.as_deref(), Path::new(&path)).with_context(|| format!("failed to write {}", path))?;
        println!("Saved CSV to: {}", path);
    }

    Ok(())
}

#[cfg(feature = "onnx")]
fn load_predictor(model: &Path, input_size: u32) -> Result<Box<dyn SegmentationPredictor>> {
    let segmenter = cdwtrace::segmentation::OnnxSegmenter::load(model, input_size)
        .with_context(|| format!("failed to load model {}", model.display()))?;
    Ok(Box::new(segmenter))
}

#[cfg(not(feature = "onnx"))]
fn load_predictor(model: &Path, _input_size: u32) -> Result<Box<dyn SegmentationPredictor>> {
    anyhow::bail!(
        "cannot load {}: cdwtrace was built without the `onnx` feature",
        model.display()
    )
}

fn run_augment(config: &CdwConfig, args: AugmentArgs) -> Result<()> {
    let fraction = args
        .fraction
        .or(config.augment.fraction)
        .unwrap_or(DEFAULT_AUGMENT_FRACTION);
    let seed = args.seed.or(config.augment.seed);

    println!("CDW Trace - No-data Augmentation");
    println!("================================");
    println!("Dataset: {}", args.dataset.display());
    println!("Output: {}", args.output.display());
    println!("Fraction: {}", fraction);
    println!();

    let stats = augment_with_nodata(&args.dataset, &args.output, fraction, seed).context("augmentation failed")?;
    println!("Copied {} files", stats.files_copied);
    println!("Augmented {} of {} training images", stats.augmented, stats.train_images);
    Ok(())
}

fn run_train_config(config: &CdwConfig, args: TrainConfigArgs) -> Result<()> {
    let mut training = config.train.clone();
    if let Some(v) = args.model {
        training.model = v;
    }
    if let Some(v) = args.epochs {
        training.epochs = v;
    }
    if let Some(v) = args.batch {
        training.batch = v;
    }
    if let Some(v) = args.device {
        training.device = v;
    }

    let summary = summarize_dataset(&args.dataset)
        .with_context(|| format!("dataset {} is not usable for training", args.dataset.display()))?;
    println!(
        "Dataset: {} train / {} val images, {} annotations",
        summary.train.images,
        summary.val.images,
        summary.annotations()
    );

    let path = training.write(&args.dataset).context("failed to write trainer config")?;
    println!("Saved trainer config to: {}", path.display());
    println!("Train with: yolo cfg={}", path.display());
    Ok(())
}

fn run_inspect(config: &CdwConfig, path: &Path) -> Result<()> {
    if path.is_dir() {
        let summary =
            summarize_dataset(path).with_context(|| format!("failed to inspect dataset {}", path.display()))?;
        println!("Dataset: {}", path.display());
        for (name, split) in [("train", summary.train), ("val", summary.val)] {
            println!(
                "  {:<5} {} images, {} with CDW, {} annotations",
                name, split.images, split.with_cdw, split.annotations
            );
        }
        return Ok(());
    }

    let raster = GeoRaster::open(path).with_context(|| format!("failed to open raster {}", path.display()))?;
    let transform = raster.transform();
    println!("Raster: {}", path.display());
    println!("  Size: {}x{}", raster.width(), raster.height());
    println!("  CRS: {}", raster.crs().unwrap_or("unknown"));
    println!(
        "  Origin: ({}, {}), pixel {} x {}",
        transform.origin_x, transform.origin_y, transform.pixel_width, transform.pixel_height
    );
    println!("  No-data: {:?}", raster.nodata());
    let detect = config.detector_config();
    let grid = WindowGrid::with_edges(
        raster.width(),
        raster.height(),
        detect.tile_size,
        detect.stride,
        detect.extend_to_edges,
    )?;
    println!(
        "  Detection grid: {} windows ({}x{})",
        grid.len(),
        grid.n_cols(),
        grid.n_rows()
    );
    Ok(())
}
