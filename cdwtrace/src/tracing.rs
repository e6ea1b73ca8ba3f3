// Contour tracing module
// Extracts outer boundaries from binary masks

use cdwtrace_common::{Contour, Point2D};
use image::GrayImage;
use imageproc::contours::{find_contours, BorderType};

/// Outer boundaries of every foreground blob that is not nested in a hole
///
/// Foreground is any non-zero pixel, including blobs that touch the image
/// border. Straight runs are compressed to their end points and contours with
/// fewer than 3 points are dropped.
pub fn external_contours(mask: &GrayImage) -> Vec<Contour> {
    find_contours::<i32>(&pad_with_background(mask))
        .into_iter()
        .filter(|c| c.border_type == BorderType::Outer && c.parent.is_none())
        .filter_map(|c| {
            // undo the 1 px frame
            let raw: Vec<(i32, i32)> = c.points.iter().map(|p| (p.x - 1, p.y - 1)).collect();
            let compressed = compress_straight_runs(&raw);
            if compressed.len() < 3 {
                return None;
            }
            Some(Contour {
                points: compressed
                    .into_iter()
                    .map(|(x, y)| Point2D::new(x as f64, y as f64))
                    .collect(),
            })
        })
        .collect()
}

/// Copy of `mask` inside a 1 px background frame
///
/// The border follower reports blobs touching the image edge as holes of the
/// frame, so every blob needs background on all sides.
fn pad_with_background(mask: &GrayImage) -> GrayImage {
    let (w, h) = mask.dimensions();
    let mut padded = GrayImage::new(w + 2, h + 2);
    for (x, y, pixel) in mask.enumerate_pixels() {
        padded.put_pixel(x + 1, y + 1, *pixel);
    }
    padded
}

/// Drop points that continue the previous step in the same direction
///
/// The contour is treated as closed, so the run wrapping around the start is
/// compressed too.
pub fn compress_straight_runs(points: &[(i32, i32)]) -> Vec<(i32, i32)> {
    let mut points = points.to_vec();
    points.dedup();
    while points.len() > 1 && points.first() == points.last() {
        points.pop();
    }

    let n = points.len();
    if n < 3 {
        return points;
    }

    let mut kept = Vec::with_capacity(n);
    for i in 0..n {
        let prev = points[(i + n - 1) % n];
        let cur = points[i];
        let next = points[(i + 1) % n];
        let incoming = ((cur.0 - prev.0).signum(), (cur.1 - prev.1).signum());
        let outgoing = ((next.0 - cur.0).signum(), (next.1 - cur.1).signum());
        if incoming != outgoing {
            kept.push(cur);
        }
    }
    kept
}

/// Binary mask from a probability map, foreground where value > threshold
pub fn binarize(probabilities: &ndarray::Array2<f32>, threshold: f32) -> GrayImage {
    let (rows, cols) = probabilities.dim();
    GrayImage::from_fn(cols as u32, rows as u32, |x, y| {
        if probabilities[[y as usize, x as usize]] > threshold {
            image::Luma([255])
        } else {
            image::Luma([0])
        }
    })
}
