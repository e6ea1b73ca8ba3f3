// Training dataset preparation
// Tiles a height raster, burns buffered labels into polygon annotations and writes a YOLO dataset

use std::fs;
use std::path::{Path, PathBuf};

use cdwtrace_common::{Split, CDW_CLASS_NAME};
use image::ImageFormat;
use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::error::{CdwError, Result};
use crate::labels::{CoordinateTransform, LabelSet, DEFAULT_BUFFER_WIDTH};
use crate::normalize::{SkipReason, TileNormalizer, TileOutcome, DEFAULT_MAX_NODATA_FRACTION};
use crate::raster::RasterSource;
use crate::rasterize::{LabelRasterizer, DEFAULT_MIN_LOG_PIXELS};
use crate::windowing::WindowGrid;

pub const DATASET_MANIFEST: &str = "dataset.yaml";
pub const TILE_METADATA: &str = "tile_metadata.csv";

#[derive(Debug, Clone, PartialEq)]
pub struct PrepareConfig {
    pub tile_size: u32,
    /// Fraction of a tile shared with its neighbour
    pub overlap: f64,
    /// Half-width in map units applied to label lines
    pub buffer_width: f64,
    pub min_log_pixels: usize,
    /// Probability that a tile lands in the validation split
    pub val_split: f64,
    pub max_nodata_fraction: f64,
    /// Fixed seed for the split draw; entropy when unset
    pub seed: Option<u64>,
    pub extend_to_edges: bool,
}

impl Default for PrepareConfig {
    fn default() -> Self {
        Self {
            tile_size: 640,
            overlap: 0.2,
            buffer_width: DEFAULT_BUFFER_WIDTH,
            min_log_pixels: DEFAULT_MIN_LOG_PIXELS,
            val_split: 0.2,
            max_nodata_fraction: DEFAULT_MAX_NODATA_FRACTION,
            seed: None,
            extend_to_edges: false,
        }
    }
}

impl PrepareConfig {
    /// `floor(tile_size * (1 - overlap))`
    pub fn stride(&self) -> u32 {
        (self.tile_size as f64 * (1.0 - self.overlap)).floor() as u32
    }

    pub fn validate(&self) -> Result<()> {
        if self.tile_size == 0 {
            return Err(CdwError::invalid("tile size must be positive"));
        }
        if !(0.0..1.0).contains(&self.overlap) {
            return Err(CdwError::invalid(format!("overlap {} must lie in [0, 1)", self.overlap)));
        }
        if self.stride() == 0 {
            return Err(CdwError::invalid(format!(
                "overlap {} leaves no stride for {} px tiles",
                self.overlap, self.tile_size
            )));
        }
        if !(0.0..=1.0).contains(&self.val_split) {
            return Err(CdwError::invalid(format!("val split {} must lie in [0, 1]", self.val_split)));
        }
        if !(0.0..=1.0).contains(&self.max_nodata_fraction) {
            return Err(CdwError::invalid("max nodata fraction must lie in [0, 1]"));
        }
        Ok(())
    }
}

/// Tile counts of one preparation run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DatasetStats {
    /// Tiles written
    pub total: usize,
    pub with_cdw: usize,
    pub empty: usize,
    /// Tiles dropped for excess no-data
    pub skipped: usize,
    /// Tiles dropped because every valid sample was equal
    pub skipped_flat: usize,
}

/// One row of `tile_metadata.csv`
#[derive(Debug, Clone, Serialize)]
struct TileRecord {
    tile: String,
    split: Split,
    col_off: u32,
    row_off: u32,
    minx: f64,
    miny: f64,
    maxx: f64,
    maxy: f64,
    crs: String,
    has_cdw: &'static str,
}

pub struct DataPreparer {
    output_dir: PathBuf,
    config: PrepareConfig,
}

impl DataPreparer {
    pub fn new(output_dir: impl Into<PathBuf>, config: PrepareConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            output_dir: output_dir.into(),
            config,
        })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn config(&self) -> &PrepareConfig {
        &self.config
    }

    /// Write the dataset for one raster and its labels
    ///
    /// Labels are reconciled to the raster CRS and buffered before any tile
    /// is written. Tiles are numbered in window order from 0; a window
    /// without annotations is written as a negative example.
    pub fn prepare<R: RasterSource + ?Sized>(
        &self,
        raster: &R,
        labels: LabelSet,
        reprojection: Option<&dyn CoordinateTransform>,
    ) -> Result<DatasetStats> {
        let cfg = &self.config;
        let (labels, crs) = labels.reconcile_crs(raster.crs(), reprojection)?;
        let polygons = labels.buffered(cfg.buffer_width);
        info!(
            "{} labels buffered by {} into {} polygons",
            labels.len(),
            cfg.buffer_width,
            polygons.len()
        );
        let rasterizer = LabelRasterizer::new(polygons, cfg.min_log_pixels);

        let grid = WindowGrid::with_edges(
            raster.width(),
            raster.height(),
            cfg.tile_size,
            cfg.stride(),
            cfg.extend_to_edges,
        )?;
        let normalizer = TileNormalizer::new(raster.nodata(), cfg.max_nodata_fraction);
        let transform = raster.transform();
        let mut rng = match cfg.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        self.create_directories()?;
        info!(
            "tiling {}x{} raster into {} windows of {} px, stride {}",
            raster.width(),
            raster.height(),
            grid.len(),
            cfg.tile_size,
            cfg.stride()
        );

        let crs_name = crs.clone().unwrap_or_else(|| "None".to_string());
        let mut stats = DatasetStats::default();
        let mut records = Vec::new();
        for window in grid.iter() {
            let samples = raster.read_window(&window)?;
            let tile = match normalizer.normalize(samples.view()) {
                TileOutcome::Ready(tile) => tile,
                TileOutcome::Skipped(SkipReason::ExcessNodata { .. }) => {
                    stats.skipped += 1;
                    continue;
                }
                TileOutcome::Skipped(SkipReason::Flat) => {
                    stats.skipped_flat += 1;
                    continue;
                }
            };

            let annotations = rasterizer.annotate(&transform, &window);
            let split = if rng.gen::<f64>() < cfg.val_split {
                Split::Val
            } else {
                Split::Train
            };

            let name = format!("tile_{:05}", records.len());
            let image_path = self.split_dir("images", split).join(format!("{}.png", name));
            tile.image
                .save_with_format(&image_path, ImageFormat::Png)
                .map_err(|source| CdwError::Image {
                    path: image_path.clone(),
                    source,
                })?;

            let lines: Vec<String> = annotations.iter().map(|a| a.to_label_line()).collect();
            let label_path = self.split_dir("labels", split).join(format!("{}.txt", name));
            fs::write(&label_path, lines.join("\n")).map_err(|e| CdwError::io(&label_path, e))?;

            let has_cdw = !annotations.is_empty();
            debug!("{} {} {}: {} annotations", name, split, window, annotations.len());
            let bounds = transform.window_bounds(&window);
            records.push(TileRecord {
                tile: name,
                split,
                col_off: window.col_off,
                row_off: window.row_off,
                minx: bounds.min_x,
                miny: bounds.min_y,
                maxx: bounds.max_x,
                maxy: bounds.max_y,
                crs: crs_name.clone(),
                has_cdw: if has_cdw { "True" } else { "False" },
            });

            stats.total += 1;
            if has_cdw {
                stats.with_cdw += 1;
            } else {
                stats.empty += 1;
            }
        }

        self.write_manifest()?;
        self.write_metadata(&records)?;
        info!(
            "dataset written: {} tiles, {} with cdw, {} skipped",
            stats.total,
            stats.with_cdw,
            stats.skipped + stats.skipped_flat
        );
        Ok(stats)
    }

    fn split_dir(&self, kind: &str, split: Split) -> PathBuf {
        self.output_dir.join(kind).join(split.as_str())
    }

    fn create_directories(&self) -> Result<()> {
        for split in Split::ALL {
            for kind in ["images", "labels"] {
                let dir = self.split_dir(kind, split);
                fs::create_dir_all(&dir).map_err(|e| CdwError::io(&dir, e))?;
            }
        }
        Ok(())
    }

    fn write_manifest(&self) -> Result<()> {
        let root = fs::canonicalize(&self.output_dir).map_err(|e| CdwError::io(&self.output_dir, e))?;
        let path = self.output_dir.join(DATASET_MANIFEST);
        fs::write(&path, dataset_manifest(&root)).map_err(|e| CdwError::io(&path, e))
    }

    fn write_metadata(&self, records: &[TileRecord]) -> Result<()> {
        let path = self.output_dir.join(TILE_METADATA);
        let csv_err = |source| CdwError::Csv {
            path: path.clone(),
            source,
        };
        let mut writer = csv::Writer::from_path(&path).map_err(csv_err)?;
        if records.is_empty() {
            writer
                .write_record([
                    "tile", "split", "col_off", "row_off", "minx", "miny", "maxx", "maxy", "crs",
                    "has_cdw",
                ])
                .map_err(csv_err)?;
        }
        for record in records {
            writer.serialize(record).map_err(csv_err)?;
        }
        writer.flush().map_err(|e| CdwError::io(&path, e))
    }
}

/// Ultralytics dataset manifest for a dataset rooted at `root`
pub fn dataset_manifest(root: &Path) -> String {
    format!(
        "path: {}\ntrain: images/train\nval: images/val\n\nnames:\n  0: {}\n",
        root.display(),
        CDW_CLASS_NAME
    )
}
