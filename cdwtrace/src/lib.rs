//! Coarse woody debris detection on LiDAR height rasters.
//!
//! Two pipelines share one tiling scheme: [`prepare::DataPreparer`] turns a
//! raster and line labels into a YOLO segmentation dataset, and
//! [`detection::Detector`] runs a [`segmentation::SegmentationPredictor`]
//! over the same windows and merges the per-tile polygons with
//! [`nms::suppress_duplicates`].

pub mod augment;
pub mod config;
pub mod detection;
pub mod error;
pub mod export_csv;
pub mod export_geojson;
pub mod geometry;
pub mod labels;
pub mod nms;
pub mod normalize;
pub mod prepare;
pub mod projection;
pub mod raster;
pub mod rasterize;
pub mod segmentation;
pub mod tracing;
pub mod training;
pub mod windowing;

pub use config::CdwConfig;
pub use detection::{DetectedObject, Detection, DetectionRun, Detector, DetectorConfig};
pub use error::{CdwError, Result};
pub use labels::{CoordinateTransform, LabelSet};
pub use prepare::{DataPreparer, DatasetStats, PrepareConfig};
pub use projection::ProjTransform;
pub use raster::{GeoRaster, RasterSource};
pub use segmentation::{MaskPrediction, SegmentationPredictor};
pub use windowing::WindowGrid;
