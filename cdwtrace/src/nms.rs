// Cross-tile duplicate suppression
// Greedy polygon NMS over an R-tree of detection envelopes

use geo::{Area, BooleanOps, BoundingRect, Polygon};
use log::debug;
use rstar::{RTree, RTreeObject, AABB};

use crate::detection::Detection;

/// Default polygon IoU above which two detections are duplicates
pub const DEFAULT_NMS_IOU: f64 = 0.4;

#[derive(Clone)]
struct DetectionBox {
    idx: usize,
    env: AABB<[f64; 2]>,
}

impl RTreeObject for DetectionBox {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.env
    }
}

fn envelope(polygon: &Polygon<f64>) -> Option<AABB<[f64; 2]>> {
    polygon
        .bounding_rect()
        .map(|r| AABB::from_corners([r.min().x, r.min().y], [r.max().x, r.max().y]))
}

/// Intersection over union of two polygons
pub fn polygon_iou(a: &Polygon<f64>, b: &Polygon<f64>) -> f64 {
    let intersection = a.intersection(b).unsigned_area();
    let union = a.unsigned_area() + b.unsigned_area() - intersection;
    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

/// Drop detections that overlap a more confident one
///
/// Every detection `i` still kept is compared with each kept neighbour `j`
/// whose envelope touches it. Above `iou_threshold` the less confident of
/// the two is dropped, `j` on a tie, and once `i` is dropped it is not
/// compared further. The index is built once and never updated. Survivors
/// keep their input order.
pub fn suppress_duplicates(detections: Vec<Detection>, iou_threshold: f64) -> Vec<Detection> {
    let n = detections.len();
    let envelopes: Vec<Option<AABB<[f64; 2]>>> = detections.iter().map(|d| envelope(&d.polygon)).collect();
    let tree = RTree::bulk_load(
        envelopes
            .iter()
            .enumerate()
            .filter_map(|(idx, env)| env.map(|env| DetectionBox { idx, env }))
            .collect(),
    );

    let mut kept = vec![true; n];
    for i in 0..n {
        if !kept[i] {
            continue;
        }
        let Some(env) = envelopes[i] else {
            continue;
        };
        let mut candidates: Vec<usize> = tree.locate_in_envelope_intersecting(&env).map(|b| b.idx).collect();
        candidates.sort_unstable();

        for j in candidates {
            if j == i || !kept[j] {
                continue;
            }
            let iou = polygon_iou(&detections[i].polygon, &detections[j].polygon);
            if iou <= iou_threshold {
                continue;
            }
            if detections[j].confidence > detections[i].confidence {
                kept[i] = false;
                break;
            }
            kept[j] = false;
        }
    }

    let survivors: Vec<Detection> = detections
        .into_iter()
        .zip(kept)
        .filter_map(|(d, keep)| keep.then_some(d))
        .collect();
    debug!("nms kept {} of {} detections", survivors.len(), n);
    survivors
}
