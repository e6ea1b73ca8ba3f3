// Instance segmentation model boundary
// Predictor trait plus YOLO-seg output decoding (boxes, NMS, prototype masks)

use image::GrayImage;
use log::debug;
use ndarray::{s, Array2, ArrayView3, ArrayView4};

use crate::error::{CdwError, Result};

/// Input edge length of the exported detection model
pub const DEFAULT_INPUT_SIZE: u32 = 640;

/// One object returned by a predictor
#[derive(Debug, Clone)]
pub struct MaskPrediction {
    /// Per-pixel foreground probability; any resolution, covering the whole tile
    pub mask: Array2<f32>,
    pub confidence: f32,
}

/// Opaque segmentation model
///
/// Takes an 8-bit tile and returns one mask per detected object. Model
/// resources live as long as the predictor value.
pub trait SegmentationPredictor {
    fn predict(&mut self, tile: &GrayImage, confidence: f32, iou: f32) -> Result<Vec<MaskPrediction>>;
}

/// Axis-aligned box, corner form, in model input pixels
#[derive(Debug, Clone, Copy, PartialEq)]
struct BoxXyxy {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
}

impl BoxXyxy {
    fn from_center(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self {
            x1: cx - w / 2.0,
            y1: cy - h / 2.0,
            x2: cx + w / 2.0,
            y2: cy + h / 2.0,
        }
    }

    fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }
}

/// Intersection over union of two boxes
fn box_iou(a: &BoxXyxy, b: &BoxXyxy) -> f32 {
    let ix1 = a.x1.max(b.x1);
    let iy1 = a.y1.max(b.y1);
    let ix2 = a.x2.min(b.x2);
    let iy2 = a.y2.min(b.y2);

    if ix1 >= ix2 || iy1 >= iy2 {
        return 0.0;
    }

    let intersection = (ix2 - ix1) * (iy2 - iy1);
    let union = a.area() + b.area() - intersection;
    if union <= 0.0 {
        0.0
    } else {
        intersection / union
    }
}

struct Candidate {
    bbox: BoxXyxy,
    confidence: f32,
    anchor: usize,
}

/// Decode raw YOLO segmentation outputs
///
/// `detections` is `[1, 4 + classes + coeffs, anchors]` with boxes as
/// (cx, cy, w, h) in input pixels; `prototypes` is `[1, coeffs, h, w]`.
/// Anchors scoring above `confidence` on their best class go through
/// greedy box NMS at `iou`. Each survivor's mask is
/// `sigmoid(coeffs . prototypes)` at prototype resolution, zeroed outside
/// its box.
pub fn decode_yolo_seg(
    detections: ArrayView3<f32>,
    prototypes: ArrayView4<f32>,
    confidence: f32,
    iou: f32,
    input_size: (u32, u32),
) -> Result<Vec<MaskPrediction>> {
    let (_, channels, anchors) = detections.dim();
    let (_, n_coeffs, proto_h, proto_w) = prototypes.dim();
    if channels < 4 + n_coeffs + 1 {
        return Err(CdwError::Predictor(format!(
            "detection tensor has {} channels, need 4 box + classes + {} mask coefficients",
            channels, n_coeffs
        )));
    }
    let n_classes = channels - 4 - n_coeffs;

    let mut candidates = Vec::new();
    for i in 0..anchors {
        let score = (0..n_classes)
            .map(|c| detections[[0, 4 + c, i]])
            .fold(f32::NEG_INFINITY, f32::max);
        if score > confidence {
            candidates.push(Candidate {
                bbox: BoxXyxy::from_center(
                    detections[[0, 0, i]],
                    detections[[0, 1, i]],
                    detections[[0, 2, i]],
                    detections[[0, 3, i]],
                ),
                confidence: score,
                anchor: i,
            });
        }
    }
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut suppressed = vec![false; candidates.len()];
    let mut kept = Vec::new();
    for idx in 0..candidates.len() {
        if suppressed[idx] {
            continue;
        }
        kept.push(idx);
        for other in idx + 1..candidates.len() {
            if !suppressed[other] && box_iou(&candidates[idx].bbox, &candidates[other].bbox) > iou {
                suppressed[other] = true;
            }
        }
    }
    debug!(
        "{} anchors above {:.2}, {} after box NMS",
        candidates.len(),
        confidence,
        kept.len()
    );

    let sx = proto_w as f32 / input_size.0 as f32;
    let sy = proto_h as f32 / input_size.1 as f32;
    let predictions = kept
        .into_iter()
        .map(|idx| {
            let cand = &candidates[idx];
            let mut logits = Array2::<f32>::zeros((proto_h, proto_w));
            for k in 0..n_coeffs {
                let coeff = detections[[0, 4 + n_classes + k, cand.anchor]];
                logits.scaled_add(coeff, &prototypes.slice(s![0, k, .., ..]));
            }

            let (bx1, by1) = (cand.bbox.x1 * sx, cand.bbox.y1 * sy);
            let (bx2, by2) = (cand.bbox.x2 * sx, cand.bbox.y2 * sy);
            let mask = Array2::from_shape_fn((proto_h, proto_w), |(y, x)| {
                let (px, py) = (x as f32 + 0.5, y as f32 + 0.5);
                if px < bx1 || px > bx2 || py < by1 || py > by2 {
                    0.0
                } else {
                    sigmoid(logits[[y, x]])
                }
            });

            MaskPrediction {
                mask,
                confidence: cand.confidence,
            }
        })
        .collect();

    Ok(predictions)
}

fn sigmoid(v: f32) -> f32 {
    1.0 / (1.0 + (-v).exp())
}

#[cfg(feature = "onnx")]
pub use onnx::OnnxSegmenter;

#[cfg(feature = "onnx")]
mod onnx {
    use std::path::Path;

    use image::GrayImage;
    use log::info;
    use ndarray::{Array4, ArrayView3, ArrayView4};
    use ort::session::Session;
    use ort::value::TensorRef;

    use super::{decode_yolo_seg, MaskPrediction, SegmentationPredictor};
    use crate::error::{CdwError, Result};

    fn predictor_err(e: impl std::fmt::Display) -> CdwError {
        CdwError::Predictor(e.to_string())
    }

    /// YOLO segmentation model exported to ONNX
    ///
    /// The runtime session is released when the segmenter is dropped.
    pub struct OnnxSegmenter {
        session: Session,
        input_size: u32,
    }

    impl OnnxSegmenter {
        pub fn load(model_path: &Path, input_size: u32) -> Result<Self> {
            info!("loading segmentation model {}", model_path.display());
            let session = Session::builder()
                .and_then(|b| b.with_intra_threads(4))
                .and_then(|b| b.commit_from_file(model_path))
                .map_err(|e| CdwError::Predictor(format!("{}: {}", model_path.display(), e)))?;
            Ok(Self {
                session,
                input_size,
            })
        }
    }

    impl SegmentationPredictor for OnnxSegmenter {
        fn predict(&mut self, tile: &GrayImage, confidence: f32, iou: f32) -> Result<Vec<MaskPrediction>> {
            let size = self.input_size;
            let resized = image::imageops::resize(tile, size, size, image::imageops::FilterType::Triangle);

            // gray replicated into the three CHW channels the model was trained on
            let mut input = Array4::<f32>::zeros((1, 3, size as usize, size as usize));
            for (x, y, pixel) in resized.enumerate_pixels() {
                let v = pixel[0] as f32 / 255.0;
                for c in 0..3 {
                    input[[0, c, y as usize, x as usize]] = v;
                }
            }

            let tensor = TensorRef::from_array_view(&input).map_err(predictor_err)?;
            let outputs = self
                .session
                .run(ort::inputs!["images" => tensor])
                .map_err(predictor_err)?;
            if outputs.len() < 2 {
                return Err(CdwError::Predictor(format!(
                    "expected detection and prototype outputs, got {}",
                    outputs.len()
                )));
            }

            let (det_shape, det_data) = outputs[0].try_extract_tensor::<f32>().map_err(predictor_err)?;
            let (proto_shape, proto_data) = outputs[1].try_extract_tensor::<f32>().map_err(predictor_err)?;
            if det_shape.len() != 3 || proto_shape.len() != 4 {
                return Err(CdwError::Predictor(format!(
                    "unexpected output shapes {:?} and {:?}",
                    det_shape, proto_shape
                )));
            }

            let det = ArrayView3::from_shape(
                (det_shape[0] as usize, det_shape[1] as usize, det_shape[2] as usize),
                det_data,
            )
            .map_err(predictor_err)?;
            let protos = ArrayView4::from_shape(
                (
                    proto_shape[0] as usize,
                    proto_shape[1] as usize,
                    proto_shape[2] as usize,
                    proto_shape[3] as usize,
                ),
                proto_data,
            )
            .map_err(predictor_err)?;

            decode_yolo_seg(det, protos, confidence, iou, (size, size))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array3, Array4};

    const COEFFS: usize = 2;

    // one class, two mask coefficients, 8x8 prototypes for a 32 px input
    fn outputs(anchors: &[([f32; 4], f32, [f32; COEFFS])]) -> (Array3<f32>, Array4<f32>) {
        let mut det = Array3::<f32>::zeros((1, 4 + 1 + COEFFS, anchors.len()));
        for (i, (bbox, score, coeffs)) in anchors.iter().enumerate() {
            for (c, v) in bbox.iter().enumerate() {
                det[[0, c, i]] = *v;
            }
            det[[0, 4, i]] = *score;
            for (k, v) in coeffs.iter().enumerate() {
                det[[0, 5 + k, i]] = *v;
            }
        }
        // prototype 0 is strongly positive everywhere, prototype 1 negative
        let mut protos = Array4::<f32>::zeros((1, COEFFS, 8, 8));
        protos.slice_mut(s![0, 0, .., ..]).fill(4.0);
        protos.slice_mut(s![0, 1, .., ..]).fill(-4.0);
        (det, protos)
    }

    #[test]
    fn test_low_scores_are_dropped() {
        let (det, protos) = outputs(&[([16.0, 16.0, 8.0, 8.0], 0.1, [1.0, 0.0])]);
        let preds = decode_yolo_seg(det.view(), protos.view(), 0.15, 0.5, (32, 32)).unwrap();
        assert!(preds.is_empty());
    }

    #[test]
    fn test_overlapping_boxes_keep_highest_score() {
        let (det, protos) = outputs(&[
            ([16.0, 16.0, 8.0, 8.0], 0.6, [1.0, 0.0]),
            ([16.5, 16.0, 8.0, 8.0], 0.9, [1.0, 0.0]),
            ([4.0, 4.0, 4.0, 4.0], 0.5, [1.0, 0.0]),
        ]);
        let preds = decode_yolo_seg(det.view(), protos.view(), 0.15, 0.5, (32, 32)).unwrap();

        assert_eq!(preds.len(), 2);
        assert_eq!(preds[0].confidence, 0.9);
        assert_eq!(preds[1].confidence, 0.5);
    }

    #[test]
    fn test_mask_is_cropped_to_box() {
        // box covers input pixels 8..24, prototype cells 2..6
        let (det, protos) = outputs(&[([16.0, 16.0, 16.0, 16.0], 0.8, [1.0, 0.0])]);
        let preds = decode_yolo_seg(det.view(), protos.view(), 0.15, 0.5, (32, 32)).unwrap();
        let mask = &preds[0].mask;

        assert_eq!(mask.dim(), (8, 8));
        assert!(mask[[4, 4]] > 0.95);
        assert_eq!(mask[[0, 0]], 0.0);
        assert_eq!(mask[[4, 7]], 0.0);
        assert_eq!(mask.iter().filter(|&&v| v > 0.5).count(), 16);
    }

    #[test]
    fn test_negative_coefficients_give_background() {
        let (det, protos) = outputs(&[([16.0, 16.0, 32.0, 32.0], 0.8, [0.0, 1.0])]);
        let preds = decode_yolo_seg(det.view(), protos.view(), 0.15, 0.5, (32, 32)).unwrap();
        assert!(preds[0].mask.iter().all(|&v| v < 0.5));
    }

    #[test]
    fn test_malformed_tensor_is_an_error() {
        let det = Array3::<f32>::zeros((1, 5, 3));
        let protos = Array4::<f32>::zeros((1, 32, 4, 4));
        assert!(decode_yolo_seg(det.view(), protos.view(), 0.1, 0.5, (32, 32)).is_err());
    }

    #[test]
    fn test_box_iou() {
        let a = BoxXyxy::from_center(5.0, 5.0, 10.0, 10.0);
        let b = BoxXyxy::from_center(10.0, 5.0, 10.0, 10.0);
        assert!((box_iou(&a, &b) - 50.0 / 150.0).abs() < 1e-6);
        let far = BoxXyxy::from_center(50.0, 50.0, 2.0, 2.0);
        assert_eq!(box_iou(&a, &far), 0.0);
    }
}
