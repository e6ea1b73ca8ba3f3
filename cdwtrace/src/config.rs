// Configuration file
// Optional cdwtrace.toml with per-command sections layered under CLI flags

use std::path::{Path, PathBuf};

use log::debug;
use serde::Deserialize;

use crate::detection::DetectorConfig;
use crate::error::{CdwError, Result};
use crate::prepare::PrepareConfig;
use crate::training::TrainingConfig;

pub const DEFAULT_CONFIG_NAME: &str = "cdwtrace.toml";
/// Environment variable naming a config file
pub const CONFIG_ENV: &str = "CDWTRACE_CONFIG";

/// Parsed config file; every key is optional
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CdwConfig {
    #[serde(default)]
    pub prepare: PrepareSection,
    #[serde(default)]
    pub detect: DetectSection,
    #[serde(default)]
    pub augment: AugmentSection,
    #[serde(default)]
    pub train: TrainingConfig,
    /// File the values came from
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PrepareSection {
    pub tile_size: Option<u32>,
    pub overlap: Option<f64>,
    pub buffer_width: Option<f64>,
    pub min_log_pixels: Option<usize>,
    pub val_split: Option<f64>,
    pub max_nodata_fraction: Option<f64>,
    pub seed: Option<u64>,
    pub extend_to_edges: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DetectSection {
    pub model: Option<PathBuf>,
    pub tile_size: Option<u32>,
    pub stride: Option<u32>,
    pub confidence: Option<f32>,
    pub iou: Option<f32>,
    pub min_area_m2: Option<f64>,
    pub mask_threshold: Option<f32>,
    pub nms_iou: Option<f64>,
    pub max_nodata_fraction: Option<f64>,
    pub extend_to_edges: Option<bool>,
    pub fallback_crs: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AugmentSection {
    pub fraction: Option<f64>,
    pub seed: Option<u64>,
}

impl CdwConfig {
    /// Resolve the config file: an explicit path, then `$CDWTRACE_CONFIG`,
    /// then `cdwtrace.toml` in the working directory
    ///
    /// An explicit or environment path must exist. Without any file the
    /// defaults apply.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::from_path(path);
        }
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Self::from_path(Path::new(&path));
        }
        let default = Path::new(DEFAULT_CONFIG_NAME);
        if default.is_file() {
            return Self::from_path(default);
        }
        debug!("no {}, using defaults", DEFAULT_CONFIG_NAME);
        Ok(Self::default())
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| CdwError::io(path, e))?;
        let mut config: Self = toml::from_str(&raw).map_err(|source| CdwError::Config {
            path: path.to_path_buf(),
            source,
        })?;
        config.source = Some(path.to_path_buf());
        debug!("config loaded from {}", path.display());
        Ok(config)
    }

    /// Preparation settings with file values over the defaults
    pub fn prepare_config(&self) -> PrepareConfig {
        let file = &self.prepare;
        let defaults = PrepareConfig::default();
        PrepareConfig {
            tile_size: file.tile_size.unwrap_or(defaults.tile_size),
            overlap: file.overlap.unwrap_or(defaults.overlap),
            buffer_width: file.buffer_width.unwrap_or(defaults.buffer_width),
            min_log_pixels: file.min_log_pixels.unwrap_or(defaults.min_log_pixels),
            val_split: file.val_split.unwrap_or(defaults.val_split),
            max_nodata_fraction: file.max_nodata_fraction.unwrap_or(defaults.max_nodata_fraction),
            seed: file.seed.or(defaults.seed),
            extend_to_edges: file.extend_to_edges.unwrap_or(defaults.extend_to_edges),
        }
    }

    /// Inference settings with file values over the defaults
    pub fn detector_config(&self) -> DetectorConfig {
        let file = &self.detect;
        let defaults = DetectorConfig::default();
        DetectorConfig {
            tile_size: file.tile_size.unwrap_or(defaults.tile_size),
            stride: file.stride.unwrap_or(defaults.stride),
            confidence: file.confidence.unwrap_or(defaults.confidence),
            iou_threshold: file.iou.unwrap_or(defaults.iou_threshold),
            min_area_m2: file.min_area_m2.unwrap_or(defaults.min_area_m2),
            mask_threshold: file.mask_threshold.unwrap_or(defaults.mask_threshold),
            nms_iou: file.nms_iou.unwrap_or(defaults.nms_iou),
            max_nodata_fraction: file.max_nodata_fraction.unwrap_or(defaults.max_nodata_fraction),
            extend_to_edges: file.extend_to_edges.unwrap_or(defaults.extend_to_edges),
            fallback_crs: file.fallback_crs.clone().or(defaults.fallback_crs),
        }
    }
}
