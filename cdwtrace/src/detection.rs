// Sliding-window inference
// Runs the segmentation predictor over every usable tile and maps masks to world polygons

use std::borrow::Cow;

use cdwtrace_common::{GeoTransform, Window};
use geo::{Area, Polygon};
use image::{ImageBuffer, Luma};
use log::{debug, info, warn};
use ndarray::Array2;

use crate::error::{CdwError, Result};
use crate::geometry::{boundary_length, build_polygon, contour_to_world, perimeter, simplify_polygon};
use crate::nms::{suppress_duplicates, DEFAULT_NMS_IOU};
use crate::normalize::{SkipReason, TileNormalizer, TileOutcome, DEFAULT_MAX_NODATA_FRACTION};
use crate::raster::RasterSource;
use crate::segmentation::SegmentationPredictor;
use crate::tracing::{binarize, external_contours};
use crate::windowing::WindowGrid;

/// Inference settings
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorConfig {
    pub tile_size: u32,
    pub stride: u32,
    /// Minimum predictor confidence
    pub confidence: f32,
    /// Box IoU handed to the predictor's own NMS
    pub iou_threshold: f32,
    pub min_area_m2: f64,
    pub mask_threshold: f32,
    /// Polygon IoU above which cross-tile duplicates are suppressed
    pub nms_iou: f64,
    pub max_nodata_fraction: f64,
    pub extend_to_edges: bool,
    /// CRS reported when the raster declares none
    pub fallback_crs: Option<String>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            tile_size: 640,
            stride: 480,
            confidence: 0.15,
            iou_threshold: 0.5,
            min_area_m2: 0.5,
            mask_threshold: 0.5,
            nms_iou: DEFAULT_NMS_IOU,
            max_nodata_fraction: DEFAULT_MAX_NODATA_FRACTION,
            extend_to_edges: false,
            fallback_crs: Some("EPSG:3301".to_string()),
        }
    }
}

impl DetectorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.tile_size == 0 || self.stride == 0 {
            return Err(CdwError::invalid("tile size and stride must be positive"));
        }
        if !(0.0..=1.0).contains(&self.confidence) || !(0.0..=1.0).contains(&self.iou_threshold) {
            return Err(CdwError::invalid("confidence and iou must lie in [0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.nms_iou) {
            return Err(CdwError::invalid("nms iou must lie in [0, 1]"));
        }
        if self.min_area_m2 < 0.0 {
            return Err(CdwError::invalid("minimum area cannot be negative"));
        }
        if !(0.0..=1.0).contains(&self.max_nodata_fraction) {
            return Err(CdwError::invalid("max nodata fraction must lie in [0, 1]"));
        }
        Ok(())
    }
}

/// A polygon found in one tile, before cross-tile deduplication
#[derive(Debug, Clone)]
pub struct Detection {
    /// World coordinates, simplified to one pixel width
    pub polygon: Polygon<f64>,
    pub confidence: f32,
    /// Area of the polygon before simplification
    pub area_m2: f64,
}

/// Final detection with shape metrics
#[derive(Debug, Clone)]
pub struct DetectedObject {
    pub polygon: Polygon<f64>,
    pub confidence: f32,
    pub area_m2: f64,
    /// Length of every ring of the polygon
    pub length_m: f64,
    /// Length of the exterior ring
    pub perimeter_m: f64,
}

impl From<Detection> for DetectedObject {
    fn from(d: Detection) -> Self {
        let length_m = boundary_length(&d.polygon);
        let perimeter_m = perimeter(&d.polygon);
        Self {
            polygon: d.polygon,
            confidence: d.confidence,
            area_m2: d.area_m2,
            length_m,
            perimeter_m,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DetectStats {
    pub windows: usize,
    pub skipped_nodata: usize,
    pub skipped_flat: usize,
    pub raw_detections: usize,
    pub final_detections: usize,
}

#[derive(Debug, Clone)]
pub struct DetectionRun {
    pub objects: Vec<DetectedObject>,
    pub stats: DetectStats,
    pub crs: Option<String>,
}

pub struct Detector {
    config: DetectorConfig,
}

impl Detector {
    pub fn new(config: DetectorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Predict every window and collect per-tile detections
    ///
    /// Windows are visited in grid order. A predictor error aborts the run.
    pub fn detect_tiles<R, P>(&self, raster: &R, predictor: &mut P) -> Result<(Vec<Detection>, DetectStats)>
    where
        R: RasterSource + ?Sized,
        P: SegmentationPredictor + ?Sized,
    {
        let cfg = &self.config;
        let grid = WindowGrid::with_edges(
            raster.width(),
            raster.height(),
            cfg.tile_size,
            cfg.stride,
            cfg.extend_to_edges,
        )?;
        let normalizer = TileNormalizer::new(raster.nodata(), cfg.max_nodata_fraction);
        let transform = raster.transform();
        info!(
            "running inference on {} windows ({}x{} grid)",
            grid.len(),
            grid.n_cols(),
            grid.n_rows()
        );

        let mut stats = DetectStats::default();
        let mut detections = Vec::new();
        for window in grid.iter() {
            stats.windows += 1;
            let samples = raster.read_window(&window)?;
            let tile = match normalizer.normalize(samples.view()) {
                TileOutcome::Ready(tile) => tile,
                TileOutcome::Skipped(SkipReason::ExcessNodata { fraction }) => {
                    debug!("skip {}: {:.0}% nodata", window, fraction * 100.0);
                    stats.skipped_nodata += 1;
                    continue;
                }
                TileOutcome::Skipped(SkipReason::Flat) => {
                    debug!("skip {}: flat", window);
                    stats.skipped_flat += 1;
                    continue;
                }
            };

            let predictions = predictor.predict(&tile.image, cfg.confidence, cfg.iou_threshold)?;
            let mut found = Vec::new();
            for prediction in &predictions {
                found.extend(self.mask_to_detections(
                    &prediction.mask,
                    prediction.confidence,
                    &window,
                    &transform,
                ));
            }
            debug!("{}: {} masks, {} polygons", window, predictions.len(), found.len());
            stats.raw_detections += found.len();
            detections.extend(found);
        }

        Ok((detections, stats))
    }

    /// Convert one predicted mask into world polygons
    ///
    /// The mask is resized to the window if needed, binarized, traced, and
    /// every polygon smaller than `min_area_m2` is dropped.
    pub fn mask_to_detections(
        &self,
        mask: &Array2<f32>,
        confidence: f32,
        window: &Window,
        transform: &GeoTransform,
    ) -> Vec<Detection> {
        let shape = (window.height as usize, window.width as usize);
        let probabilities = if mask.dim() == shape {
            Cow::Borrowed(mask)
        } else {
            match resize_mask(mask, window.width, window.height) {
                Some(resized) => Cow::Owned(resized),
                None => {
                    warn!("could not resize {:?} mask to {}", mask.dim(), window);
                    return Vec::new();
                }
            }
        };

        let binary = binarize(&probabilities, self.config.mask_threshold);
        let tolerance = transform.pixel_width.abs();
        external_contours(&binary)
            .iter()
            .filter_map(|contour| {
                let polygon = build_polygon(contour_to_world(contour, transform, window))?;
                let area_m2 = polygon.unsigned_area();
                if area_m2 < self.config.min_area_m2 {
                    return None;
                }
                Some(Detection {
                    polygon: simplify_polygon(&polygon, tolerance),
                    confidence,
                    area_m2,
                })
            })
            .collect()
    }

    /// Deduplicate per-tile detections and attach shape metrics
    pub fn finalize(&self, detections: Vec<Detection>) -> Vec<DetectedObject> {
        suppress_duplicates(detections, self.config.nms_iou)
            .into_iter()
            .map(DetectedObject::from)
            .collect()
    }

    /// Full run: tiles, predictor, deduplication
    pub fn detect<R, P>(&self, raster: &R, predictor: &mut P) -> Result<DetectionRun>
    where
        R: RasterSource + ?Sized,
        P: SegmentationPredictor + ?Sized,
    {
        let (detections, mut stats) = self.detect_tiles(raster, predictor)?;
        let objects = self.finalize(detections);
        stats.final_detections = objects.len();
        Ok(DetectionRun {
            objects,
            stats,
            crs: self.output_crs(raster),
        })
    }

    /// CRS of the detections: the raster's, else the configured fallback
    pub fn output_crs<R: RasterSource + ?Sized>(&self, raster: &R) -> Option<String> {
        raster
            .crs()
            .map(str::to_string)
            .or_else(|| self.config.fallback_crs.clone())
    }
}

/// Bilinear resize of a probability map
fn resize_mask(mask: &Array2<f32>, width: u32, height: u32) -> Option<Array2<f32>> {
    let (rows, cols) = mask.dim();
    let buffer: ImageBuffer<Luma<f32>, Vec<f32>> =
        ImageBuffer::from_raw(cols as u32, rows as u32, mask.iter().copied().collect())?;
    let resized = image::imageops::resize(&buffer, width, height, image::imageops::FilterType::Triangle);
    Array2::from_shape_vec((height as usize, width as usize), resized.into_raw()).ok()
}
