// Tile normalization
// Converts raw elevation samples to an 8-bit intensity image with a no-data mask

use image::GrayImage;
use ndarray::{Array2, ArrayView2, Zip};

/// Nodata sentinel used when the raster does not declare one
pub const DEFAULT_NODATA: f64 = -9999.0;

/// Default maximum share of no-data pixels before a tile is dropped
pub const DEFAULT_MAX_NODATA_FRACTION: f64 = 0.5;

/// Why a tile was not handed to downstream stages
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SkipReason {
    /// More than the allowed fraction of pixels were no-data
    ExcessNodata { fraction: f64 },
    /// All valid pixels share the same value
    Flat,
}

/// A tile ready for rasterization or inference
#[derive(Debug, Clone)]
pub struct NormalizedTile {
    pub image: GrayImage,
    /// true where the source sample was NaN, the sentinel, or negative
    pub nodata_mask: Array2<bool>,
    pub nodata_fraction: f64,
}

#[derive(Debug, Clone)]
pub enum TileOutcome {
    Ready(NormalizedTile),
    Skipped(SkipReason),
}

impl TileOutcome {
    pub fn is_skipped(&self) -> bool {
        matches!(self, TileOutcome::Skipped(_))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TileNormalizer {
    nodata: f64,
    max_nodata_fraction: f64,
}

impl Default for TileNormalizer {
    fn default() -> Self {
        Self::new(None, DEFAULT_MAX_NODATA_FRACTION)
    }
}

impl TileNormalizer {
    pub fn new(nodata: Option<f64>, max_nodata_fraction: f64) -> Self {
        Self {
            nodata: nodata.unwrap_or(DEFAULT_NODATA),
            max_nodata_fraction,
        }
    }

    pub fn nodata(&self) -> f64 {
        self.nodata
    }

    /// No-data mask for a raw tile
    pub fn nodata_mask(&self, tile: ArrayView2<f32>) -> Array2<bool> {
        let sentinel = self.nodata as f32;
        tile.mapv(|v| v.is_nan() || v == sentinel || v < 0.0)
    }

    /// Rescale a raw tile to 0..=255, or report why it must be skipped
    ///
    /// Statistics come from unmasked pixels only and the mask is re-applied
    /// after rescaling, so masked output pixels are always exactly 0.
    pub fn normalize(&self, tile: ArrayView2<f32>) -> TileOutcome {
        let (rows, cols) = tile.dim();
        let mask = self.nodata_mask(tile);
        let total = rows * cols;
        let masked = mask.iter().filter(|&&m| m).count();
        let fraction = if total == 0 {
            1.0
        } else {
            masked as f64 / total as f64
        };

        if fraction > self.max_nodata_fraction {
            return TileOutcome::Skipped(SkipReason::ExcessNodata { fraction });
        }

        let mut min = f32::INFINITY;
        let mut max = f32::NEG_INFINITY;
        Zip::from(tile).and(&mask).for_each(|&v, &m| {
            if !m {
                min = min.min(v);
                max = max.max(v);
            }
        });

        if !(max > min) {
            return TileOutcome::Skipped(SkipReason::Flat);
        }

        let range = (max - min) as f64;
        let mut image = GrayImage::new(cols as u32, rows as u32);
        for ((row, col), &v) in tile.indexed_iter() {
            let value = if mask[[row, col]] {
                0
            } else {
                // truncates toward zero, like a numpy uint8 cast
                let scaled = ((v - min) as f64 / range).clamp(0.0, 1.0) * 255.0;
                scaled as u8
            };
            image.put_pixel(col as u32, row as u32, image::Luma([value]));
        }

        TileOutcome::Ready(NormalizedTile {
            image,
            nodata_mask: mask,
            nodata_fraction: fraction,
        })
    }
}
