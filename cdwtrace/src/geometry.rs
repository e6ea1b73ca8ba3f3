// Polygon construction and shape metrics
// Turns pixel contours into world-space polygons and measures them

use cdwtrace_common::{Contour, GeoTransform, Window};
use geo::{Area, Coord, Euclidean, Length, LineString, Polygon, Simplify};

/// Map a tile-pixel contour to world coordinates
///
/// Pixel (px, py) of `window` lands at
/// `origin + (window offset + p) * pixel size` on each axis.
pub fn contour_to_world(contour: &Contour, transform: &GeoTransform, window: &Window) -> Vec<Coord<f64>> {
    contour
        .points
        .iter()
        .map(|p| {
            let (x, y) = transform.pixel_to_world(
                window.col_off as f64 + p.x,
                window.row_off as f64 + p.y,
            );
            Coord { x, y }
        })
        .collect()
}

/// Closed polygon from an exterior ring, or None if the ring is degenerate
///
/// Degenerate means non-finite coordinates, fewer than three distinct
/// vertices, or zero enclosed area.
pub fn build_polygon(mut coords: Vec<Coord<f64>>) -> Option<Polygon<f64>> {
    if coords.iter().any(|c| !c.x.is_finite() || !c.y.is_finite()) {
        return None;
    }
    coords.dedup();
    if coords.len() > 1 && coords.first() == coords.last() {
        coords.pop();
    }
    if coords.len() < 3 {
        return None;
    }

    let polygon = Polygon::new(LineString::from(coords), vec![]);
    if polygon.unsigned_area() > 0.0 {
        Some(polygon)
    } else {
        None
    }
}

/// Douglas-Peucker simplification that never collapses the ring
///
/// If simplifying would leave fewer than three vertices or no area the
/// input polygon is returned unchanged.
pub fn simplify_polygon(polygon: &Polygon<f64>, tolerance: f64) -> Polygon<f64> {
    if tolerance <= 0.0 {
        return polygon.clone();
    }
    let simplified = polygon.simplify(tolerance);
    // closed ring: three vertices plus the repeated first one
    if simplified.exterior().0.len() < 4 || simplified.unsigned_area() <= 0.0 {
        polygon.clone()
    } else {
        simplified
    }
}

pub fn ring_length(ring: &LineString<f64>) -> f64 {
    Euclidean.length(ring)
}

/// Length of the exterior ring
pub fn perimeter(polygon: &Polygon<f64>) -> f64 {
    ring_length(polygon.exterior())
}

/// Length of every ring, exterior and holes
pub fn boundary_length(polygon: &Polygon<f64>) -> f64 {
    perimeter(polygon) + polygon.interiors().iter().map(ring_length).sum::<f64>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdwtrace_common::Point2D;
    use geo::coord;

    fn square(size: f64) -> Vec<Coord<f64>> {
        vec![
            coord! { x: 0.0, y: 0.0 },
            coord! { x: size, y: 0.0 },
            coord! { x: size, y: size },
            coord! { x: 0.0, y: size },
        ]
    }

    #[test]
    fn test_contour_maps_with_window_offset() {
        let transform = GeoTransform::new(100.0, 0.5, 200.0, -0.5);
        let window = Window::new(10, 4, 16, 16);
        let contour = Contour {
            points: vec![Point2D::new(0.0, 0.0), Point2D::new(2.0, 6.0)],
        };

        let coords = contour_to_world(&contour, &transform, &window);
        assert_eq!(coords[0], coord! { x: 105.0, y: 198.0 });
        assert_eq!(coords[1], coord! { x: 106.0, y: 195.0 });
    }

    #[test]
    fn test_build_polygon_rejects_degenerate_rings() {
        assert!(build_polygon(vec![coord! { x: 0.0, y: 0.0 }, coord! { x: 1.0, y: 1.0 }]).is_none());
        let collinear = vec![
            coord! { x: 0.0, y: 0.0 },
            coord! { x: 1.0, y: 1.0 },
            coord! { x: 2.0, y: 2.0 },
        ];
        assert!(build_polygon(collinear).is_none());
        let mut with_nan = square(2.0);
        with_nan[1].x = f64::NAN;
        assert!(build_polygon(with_nan).is_none());
    }

    #[test]
    fn test_build_polygon_area() {
        let polygon = build_polygon(square(3.0)).unwrap();
        assert!((polygon.unsigned_area() - 9.0).abs() < 1e-12);
    }

    #[test]
    fn test_simplify_removes_near_collinear_vertices() {
        let mut coords = square(10.0);
        coords.insert(1, coord! { x: 5.0, y: 0.05 });
        let polygon = build_polygon(coords).unwrap();

        let simplified = simplify_polygon(&polygon, 0.5);
        assert_eq!(simplified.exterior().0.len(), 5);
    }

    #[test]
    fn test_simplify_never_collapses() {
        let tiny = build_polygon(vec![
            coord! { x: 0.0, y: 0.0 },
            coord! { x: 0.1, y: 0.0 },
            coord! { x: 0.1, y: 0.1 },
        ])
        .unwrap();
        let simplified = simplify_polygon(&tiny, 5.0);
        assert!(simplified.unsigned_area() > 0.0);
    }

    #[test]
    fn test_lengths() {
        let exterior = LineString::from(square(4.0));
        let hole = LineString::from(vec![
            coord! { x: 1.0, y: 1.0 },
            coord! { x: 2.0, y: 1.0 },
            coord! { x: 2.0, y: 2.0 },
            coord! { x: 1.0, y: 2.0 },
        ]);
        let polygon = Polygon::new(exterior, vec![hole]);

        assert!((perimeter(&polygon) - 16.0).abs() < 1e-12);
        assert!((boundary_length(&polygon) - 20.0).abs() < 1e-12);

        let diagonal = LineString::from(vec![coord! { x: 0.0, y: 0.0 }, coord! { x: 3.0, y: 4.0 }]);
        assert!((ring_length(&diagonal) - 5.0).abs() < 1e-12);
    }
}
