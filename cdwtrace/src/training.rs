// Trainer configuration
// Ultralytics cfg file for the external trainer and a sanity check of the dataset it reads

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use cdwtrace_common::{Split, CDW_CLASS_ID};
use log::info;
use serde::{Deserialize, Serialize};

use crate::augment::list_pngs;
use crate::error::{CdwError, Result};
use crate::prepare::DATASET_MANIFEST;

/// File name of the generated trainer config
pub const TRAIN_CONFIG: &str = "train.yaml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Optimizer {
    Auto,
    Sgd,
    Adam,
    #[default]
    AdamW,
}

impl Optimizer {
    /// Spelling the trainer expects
    pub fn as_str(&self) -> &'static str {
        match self {
            Optimizer::Auto => "auto",
            Optimizer::Sgd => "SGD",
            Optimizer::Adam => "Adam",
            Optimizer::AdamW => "AdamW",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
    None,
    Ram,
    #[default]
    Disk,
}

/// Hyperparameters handed to the trainer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Base weights to fine-tune
    pub model: String,
    pub epochs: u32,
    pub batch: u32,
    pub imgsz: u32,
    /// Epochs without improvement before stopping
    pub patience: u32,
    pub project: String,
    pub name: String,
    /// `cpu`, a CUDA index like `0`, or `cuda`
    pub device: String,
    pub optimizer: Optimizer,
    pub lr0: f64,
    pub lrf: f64,
    pub hsv_h: f64,
    pub hsv_s: f64,
    pub hsv_v: f64,
    pub degrees: f64,
    pub translate: f64,
    pub scale: f64,
    pub flipud: f64,
    pub fliplr: f64,
    pub mosaic: f64,
    pub cache: CacheMode,
    pub workers: u32,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            model: "yolo11n-seg.pt".to_string(),
            epochs: 50,
            batch: 4,
            imgsz: 640,
            patience: 15,
            project: "runs/cdw_detect".to_string(),
            name: "train".to_string(),
            device: "cpu".to_string(),
            optimizer: Optimizer::AdamW,
            lr0: 0.001,
            lrf: 0.01,
            hsv_h: 0.015,
            hsv_s: 0.4,
            hsv_v: 0.2,
            // logs lie in any direction
            degrees: 90.0,
            translate: 0.1,
            scale: 0.2,
            flipud: 0.5,
            fliplr: 0.5,
            mosaic: 0.5,
            cache: CacheMode::Disk,
            workers: 0,
        }
    }
}

impl TrainingConfig {
    /// Mixed precision only pays off on a GPU
    pub fn amp(&self) -> bool {
        !self.device.eq_ignore_ascii_case("cpu")
    }

    pub fn validate(&self) -> Result<()> {
        if self.epochs == 0 || self.batch == 0 || self.imgsz == 0 {
            return Err(CdwError::invalid("epochs, batch and imgsz must be positive"));
        }
        if self.imgsz % 32 != 0 {
            return Err(CdwError::invalid(format!("imgsz {} is not a multiple of 32", self.imgsz)));
        }
        if self.lr0 <= 0.0 || self.lrf <= 0.0 {
            return Err(CdwError::invalid("learning rates must be positive"));
        }
        for (key, value) in [
            ("hsv_h", self.hsv_h),
            ("hsv_s", self.hsv_s),
            ("hsv_v", self.hsv_v),
            ("translate", self.translate),
            ("flipud", self.flipud),
            ("fliplr", self.fliplr),
            ("mosaic", self.mosaic),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(CdwError::invalid(format!("{} = {} must lie in [0, 1]", key, value)));
            }
        }
        Ok(())
    }

    /// Trainer cfg file contents for the dataset manifest at `data`
    pub fn to_yaml(&self, data: &Path) -> String {
        let cache = match self.cache {
            CacheMode::None => "false",
            CacheMode::Ram => "ram",
            CacheMode::Disk => "disk",
        };
        let mut yaml = String::new();
        let _ = writeln!(yaml, "task: segment");
        let _ = writeln!(yaml, "mode: train");
        let _ = writeln!(yaml, "data: {}", data.display());
        let _ = writeln!(yaml, "model: {}", self.model);
        let _ = writeln!(yaml, "epochs: {}", self.epochs);
        let _ = writeln!(yaml, "batch: {}", self.batch);
        let _ = writeln!(yaml, "imgsz: {}", self.imgsz);
        let _ = writeln!(yaml, "patience: {}", self.patience);
        let _ = writeln!(yaml, "project: {}", self.project);
        let _ = writeln!(yaml, "name: {}", self.name);
        let _ = writeln!(yaml, "exist_ok: true");
        let _ = writeln!(yaml, "device: '{}'", self.device);
        let _ = writeln!(yaml, "workers: {}", self.workers);
        let _ = writeln!(yaml, "cache: {}", cache);
        let _ = writeln!(yaml, "amp: {}", self.amp());
        let _ = writeln!(yaml, "optimizer: {}", self.optimizer.as_str());
        let _ = writeln!(yaml, "lr0: {}", self.lr0);
        let _ = writeln!(yaml, "lrf: {}", self.lrf);
        let _ = writeln!(yaml, "hsv_h: {}", self.hsv_h);
        let _ = writeln!(yaml, "hsv_s: {}", self.hsv_s);
        let _ = writeln!(yaml, "hsv_v: {}", self.hsv_v);
        let _ = writeln!(yaml, "degrees: {}", self.degrees);
        let _ = writeln!(yaml, "translate: {}", self.translate);
        let _ = writeln!(yaml, "scale: {}", self.scale);
        let _ = writeln!(yaml, "flipud: {}", self.flipud);
        let _ = writeln!(yaml, "fliplr: {}", self.fliplr);
        let _ = writeln!(yaml, "mosaic: {}", self.mosaic);
        yaml
    }

    /// Write `train.yaml` beside the dataset manifest and return its path
    pub fn write(&self, dataset_dir: &Path) -> Result<PathBuf> {
        self.validate()?;
        let manifest = dataset_dir.join(DATASET_MANIFEST);
        if !manifest.is_file() {
            return Err(CdwError::Dataset {
                path: dataset_dir.to_path_buf(),
                reason: format!("no {}", DATASET_MANIFEST),
            });
        }
        let manifest = fs::canonicalize(&manifest).map_err(|e| CdwError::io(&manifest, e))?;
        let path = dataset_dir.join(TRAIN_CONFIG);
        fs::write(&path, self.to_yaml(&manifest)).map_err(|e| CdwError::io(&path, e))?;
        info!("trainer config written to {}", path.display());
        Ok(path)
    }
}

/// Counts for one split of a dataset
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SplitSummary {
    pub images: usize,
    pub with_cdw: usize,
    pub annotations: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DatasetSummary {
    pub train: SplitSummary,
    pub val: SplitSummary,
}

impl DatasetSummary {
    pub fn images(&self) -> usize {
        self.train.images + self.val.images
    }

    pub fn annotations(&self) -> usize {
        self.train.annotations + self.val.annotations
    }
}

/// Check a dataset the way the trainer will read it
///
/// Every image needs a label file and every label line must be the cdw
/// class followed by at least three normalized points.
pub fn summarize_dataset(root: &Path) -> Result<DatasetSummary> {
    let mut summary = DatasetSummary::default();
    for split in Split::ALL {
        let images_dir = root.join("images").join(split.as_str());
        if !images_dir.is_dir() {
            return Err(CdwError::Dataset {
                path: root.to_path_buf(),
                reason: format!("missing images/{}", split),
            });
        }
        let counts = match split {
            Split::Train => &mut summary.train,
            Split::Val => &mut summary.val,
        };
        for image in list_pngs(&images_dir)? {
            let stem = image.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
            let label_path = root.join("labels").join(split.as_str()).join(format!("{}.txt", stem));
            let text = fs::read_to_string(&label_path).map_err(|e| CdwError::io(&label_path, e))?;
            let mut annotations = 0;
            for (line_no, line) in text.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                check_label_line(line).map_err(|reason| CdwError::Dataset {
                    path: label_path.clone(),
                    reason: format!("line {}: {}", line_no + 1, reason),
                })?;
                annotations += 1;
            }
            counts.images += 1;
            counts.annotations += annotations;
            if annotations > 0 {
                counts.with_cdw += 1;
            }
        }
    }
    Ok(summary)
}

fn check_label_line(line: &str) -> std::result::Result<(), String> {
    let mut fields = line.split_whitespace();
    let class: u32 = fields
        .next()
        .and_then(|f| f.parse().ok())
        .ok_or("missing class id")?;
    if class != CDW_CLASS_ID {
        return Err(format!("unknown class {}", class));
    }
    let values = fields
        .map(|f| f.parse::<f64>().map_err(|_| format!("bad coordinate {:?}", f)))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    if values.len() % 2 != 0 {
        return Err("odd number of coordinates".to_string());
    }
    if values.len() < 6 {
        return Err(format!("{} points, need at least 3", values.len() / 2));
    }
    if let Some(v) = values.iter().find(|v| !(0.0..=1.0).contains(*v)) {
        return Err(format!("coordinate {} outside [0, 1]", v));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::GrayImage;
    use tempfile::TempDir;

    fn write_tile(root: &Path, split: &str, name: &str, label: &str) {
        let images = root.join("images").join(split);
        let labels = root.join("labels").join(split);
        fs::create_dir_all(&images).unwrap();
        fs::create_dir_all(&labels).unwrap();
        GrayImage::new(8, 8).save(images.join(format!("{}.png", name))).unwrap();
        fs::write(labels.join(format!("{}.txt", name)), label).unwrap();
    }

    #[test]
    fn test_defaults_and_amp() {
        let config = TrainingConfig::default();
        assert!(config.validate().is_ok());
        assert!(!config.amp());
        let gpu = TrainingConfig {
            device: "0".to_string(),
            ..TrainingConfig::default()
        };
        assert!(gpu.amp());
    }

    #[test]
    fn test_yaml_contents() {
        let yaml = TrainingConfig::default().to_yaml(Path::new("/data/cdw/dataset.yaml"));
        assert!(yaml.starts_with("task: segment\n"));
        assert!(yaml.contains("data: /data/cdw/dataset.yaml\n"));
        assert!(yaml.contains("optimizer: AdamW\n"));
        assert!(yaml.contains("cache: disk\n"));
        assert!(yaml.contains("amp: false\n"));
        assert!(yaml.contains("device: 'cpu'\n"));
        assert!(yaml.contains("degrees: 90\n"));
    }

    #[test]
    fn test_optimizer_from_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            train: TrainingConfig,
        }
        let parsed: Wrapper = toml::from_str("[train]\noptimizer = \"sgd\"\ncache = \"none\"\nepochs = 3\n").unwrap();
        assert_eq!(parsed.train.optimizer, Optimizer::Sgd);
        assert_eq!(parsed.train.cache, CacheMode::None);
        assert_eq!(parsed.train.epochs, 3);
        assert_eq!(parsed.train.batch, 4);
        assert!(parsed.train.to_yaml(Path::new("d.yaml")).contains("cache: false\n"));
    }

    #[test]
    fn test_invalid_imgsz() {
        let config = TrainingConfig {
            imgsz: 500,
            ..TrainingConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_write_requires_manifest() {
        let dir = TempDir::new().unwrap();
        assert!(TrainingConfig::default().write(dir.path()).is_err());
        fs::write(dir.path().join(DATASET_MANIFEST), "path: x\n").unwrap();
        let path = TrainingConfig::default().write(dir.path()).unwrap();
        assert!(fs::read_to_string(path).unwrap().contains("epochs: 50\n"));
    }

    #[test]
    fn test_summarize_dataset() {
        let dir = TempDir::new().unwrap();
        write_tile(dir.path(), "train", "tile_00000", "0 0.1 0.1 0.5 0.1 0.5 0.5\n0 0 0 1 0 1 1");
        write_tile(dir.path(), "train", "tile_00001", "");
        write_tile(dir.path(), "val", "tile_00002", "0 0.2 0.2 0.4 0.2 0.3 0.6");

        let summary = summarize_dataset(dir.path()).unwrap();
        assert_eq!(summary.train.images, 2);
        assert_eq!(summary.train.with_cdw, 1);
        assert_eq!(summary.train.annotations, 2);
        assert_eq!(summary.val.with_cdw, 1);
        assert_eq!(summary.images(), 3);
        assert_eq!(summary.annotations(), 3);
    }

    #[test]
    fn test_bad_label_lines() {
        for bad in ["0 0.1 0.1 0.2 0.2", "1 0 0 1 0 1 1", "0 0 0 1 0 1 1.5", "0 0.1 0.2 0.3", "x 0 0 1 0 1 1"] {
            assert!(check_label_line(bad).is_err(), "{}", bad);
        }
    }

    #[test]
    fn test_missing_label_file() {
        let dir = TempDir::new().unwrap();
        write_tile(dir.path(), "train", "tile_00000", "");
        fs::create_dir_all(dir.path().join("images/val")).unwrap();
        fs::remove_file(dir.path().join("labels/train/tile_00000.txt")).unwrap();
        assert!(summarize_dataset(dir.path()).is_err());
    }
}
