use serde::{Deserialize, Serialize};
use std::fmt;

/// Class name of the single detection target
pub const CDW_CLASS_NAME: &str = "cdw";

/// Class id written in the first column of every label line
pub const CDW_CLASS_ID: u32 = 0;

/// North-up affine transform from pixel (col, row) to world (x, y)
///
/// Matches the GDAL layout without the rotation terms:
/// `x = origin_x + col * pixel_width`, `y = origin_y + row * pixel_height`.
/// `pixel_height` is negative for the usual north-up raster.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub origin_x: f64,
    pub pixel_width: f64,
    pub origin_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    pub fn new(origin_x: f64, pixel_width: f64, origin_y: f64, pixel_height: f64) -> Self {
        Self {
            origin_x,
            pixel_width,
            origin_y,
            pixel_height,
        }
    }

    /// World coordinates of a (fractional) pixel position
    pub fn pixel_to_world(&self, col: f64, row: f64) -> (f64, f64) {
        (
            self.origin_x + col * self.pixel_width,
            self.origin_y + row * self.pixel_height,
        )
    }

    /// Fractional pixel position of a world coordinate
    pub fn world_to_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        (
            (x - self.origin_x) / self.pixel_width,
            (y - self.origin_y) / self.pixel_height,
        )
    }

    /// Transform whose pixel (0, 0) is the top-left corner of `window`
    pub fn for_window(&self, window: &Window) -> Self {
        let (origin_x, origin_y) =
            self.pixel_to_world(window.col_off as f64, window.row_off as f64);
        Self {
            origin_x,
            pixel_width: self.pixel_width,
            origin_y,
            pixel_height: self.pixel_height,
        }
    }

    /// World bounding box covered by `window`
    pub fn window_bounds(&self, window: &Window) -> Bounds {
        let (x0, y0) = self.pixel_to_world(window.col_off as f64, window.row_off as f64);
        let (x1, y1) = self.pixel_to_world(
            (window.col_off + window.width) as f64,
            (window.row_off + window.height) as f64,
        );
        Bounds {
            min_x: x0.min(x1),
            min_y: y0.min(y1),
            max_x: x0.max(x1),
            max_y: y0.max(y1),
        }
    }
}

impl Default for GeoTransform {
    fn default() -> Self {
        Self::new(0.0, 1.0, 0.0, -1.0)
    }
}

/// Axis-aligned world bounding box
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

/// Pixel window into a raster, always inside the raster bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Window {
    pub col_off: u32,
    pub row_off: u32,
    pub width: u32,
    pub height: u32,
}

impl Window {
    pub fn new(col_off: u32, row_off: u32, width: u32, height: u32) -> Self {
        Self {
            col_off,
            row_off,
            width,
            height,
        }
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{}@({}, {})",
            self.width, self.height, self.col_off, self.row_off
        )
    }
}

/// Dataset split a tile is assigned to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    Train,
    Val,
}

impl Split {
    pub const ALL: [Split; 2] = [Split::Train, Split::Val];

    pub fn as_str(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Val => "val",
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 2D point in pixel space
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point2D {
    pub x: f64,
    pub y: f64,
}

impl Point2D {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Closed contour as a sequence of pixel positions, first point not repeated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contour {
    pub points: Vec<Point2D>,
}

/// Output format for detected geometries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    GeoJson,
    Csv,
    Both,
}

impl OutputFormat {
    pub fn writes_geojson(&self) -> bool {
        matches!(self, OutputFormat::GeoJson | OutputFormat::Both)
    }

    pub fn writes_csv(&self) -> bool {
        matches!(self, OutputFormat::Csv | OutputFormat::Both)
    }
}
