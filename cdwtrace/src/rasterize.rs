// Label rasterization
// Burns label polygons into per-window masks and traces them back as annotations

use std::fmt::Write as _;

use cdwtrace_common::{GeoTransform, Point2D, Window, CDW_CLASS_ID};
use geo::{Area, BooleanOps, BoundingRect, Coord, MultiPolygon, Polygon, Rect};
use image::{GrayImage, Luma};
use log::debug;
use rstar::{RTree, RTreeObject, AABB};

use crate::tracing::external_contours;

/// Default minimum mask size in pixels for a label to count as a log
pub const DEFAULT_MIN_LOG_PIXELS: usize = 50;

/// One polygon of a training label file, coordinates normalized to [0, 1]
#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    pub class_id: u32,
    pub points: Vec<Point2D>,
}

impl Annotation {
    /// `class x1 y1 x2 y2 ...` with six decimals per coordinate
    pub fn to_label_line(&self) -> String {
        let mut line = self.class_id.to_string();
        for p in &self.points {
            let _ = write!(line, " {:.6} {:.6}", p.x, p.y);
        }
        line
    }
}

#[derive(Clone)]
struct LabelBox {
    idx: usize,
    env: AABB<[f64; 2]>,
}

impl RTreeObject for LabelBox {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.env
    }
}

/// Turns buffered label polygons into per-window annotations
pub struct LabelRasterizer {
    labels: Vec<Polygon<f64>>,
    tree: RTree<LabelBox>,
    min_log_pixels: usize,
}

impl LabelRasterizer {
    pub fn new(labels: Vec<Polygon<f64>>, min_log_pixels: usize) -> Self {
        let boxes = labels
            .iter()
            .enumerate()
            .filter_map(|(idx, label)| {
                label.bounding_rect().map(|r| LabelBox {
                    idx,
                    env: AABB::from_corners([r.min().x, r.min().y], [r.max().x, r.max().y]),
                })
            })
            .collect();

        Self {
            labels,
            tree: RTree::bulk_load(boxes),
            min_log_pixels,
        }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Annotations for one window of a raster with the given transform
    ///
    /// Each label is clipped to the window, rasterized on its own and kept
    /// only if it covers at least `min_log_pixels` pixels. Outer contours
    /// are normalized by the window width and height.
    pub fn annotate(&self, transform: &GeoTransform, window: &Window) -> Vec<Annotation> {
        let bounds = transform.window_bounds(window);
        let tile_box = Rect::new(
            Coord { x: bounds.min_x, y: bounds.min_y },
            Coord { x: bounds.max_x, y: bounds.max_y },
        )
        .to_polygon();
        let local = transform.for_window(window);

        let query = AABB::from_corners([bounds.min_x, bounds.min_y], [bounds.max_x, bounds.max_y]);
        let mut candidates: Vec<usize> = self
            .tree
            .locate_in_envelope_intersecting(&query)
            .map(|b| b.idx)
            .collect();
        candidates.sort_unstable();

        let mut annotations = Vec::new();
        for idx in candidates {
            let clipped = self.labels[idx].intersection(&tile_box);
            if clipped.0.is_empty() || clipped.unsigned_area() <= 0.0 {
                continue;
            }

            let mask = rasterize(&clipped, &local, window.width, window.height);
            let pixels = mask.pixels().filter(|p| p[0] > 0).count();
            if pixels < self.min_log_pixels {
                debug!("label {} covers {} px in {}, below minimum", idx, pixels, window);
                continue;
            }

            for contour in external_contours(&mask) {
                annotations.push(Annotation {
                    class_id: CDW_CLASS_ID,
                    points: contour
                        .points
                        .iter()
                        .map(|p| {
                            Point2D::new(p.x / window.width as f64, p.y / window.height as f64)
                        })
                        .collect(),
                });
            }
        }
        annotations
    }
}

/// Burn a polygon set into a `width x height` mask with foreground value 1
///
/// A pixel is set when its centre lies inside the shape under the even-odd
/// rule, so holes stay empty. `transform` maps mask pixels to world space.
pub fn rasterize(shape: &MultiPolygon<f64>, transform: &GeoTransform, width: u32, height: u32) -> GrayImage {
    let rings: Vec<Vec<(f64, f64)>> = shape
        .iter()
        .flat_map(|p| std::iter::once(p.exterior()).chain(p.interiors()))
        .map(|ring| ring.coords().map(|c| transform.world_to_pixel(c.x, c.y)).collect())
        .collect();

    let mut mask = GrayImage::new(width, height);
    let mut crossings: Vec<f64> = Vec::new();
    for row in 0..height {
        let yc = row as f64 + 0.5;
        crossings.clear();
        for ring in &rings {
            for edge in ring.windows(2) {
                let ((x0, y0), (x1, y1)) = (edge[0], edge[1]);
                if (y0 <= yc) != (y1 <= yc) {
                    crossings.push(x0 + (yc - y0) * (x1 - x0) / (y1 - y0));
                }
            }
        }
        crossings.sort_by(|a, b| a.total_cmp(b));

        for span in crossings.chunks_exact(2) {
            let start = (span[0] - 0.5).ceil().max(0.0) as u32;
            let end = (span[1] - 0.5).ceil().min(width as f64).max(0.0) as u32;
            for col in start..end {
                mask.put_pixel(col, row, Luma([1]));
            }
        }
    }
    mask
}
