// No-data augmentation
// Copies a dataset and blanks random regions of training images to mimic raster gaps

use std::fs;
use std::path::{Path, PathBuf};

use cdwtrace_common::Split;
use image::{GrayImage, ImageFormat, Luma};
use log::{debug, info};
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::{Rng, SeedableRng};
use walkdir::WalkDir;

use crate::error::{CdwError, Result};

/// Default share of training images that receive a pattern
pub const DEFAULT_AUGMENT_FRACTION: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Top,
    Bottom,
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Corner {
    TopLeft,
    TopRight,
    BottomLeft,
    BottomRight,
}

/// Region of an image forced to no-data (0)
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NodataPattern {
    /// Band of `size` pixels along one side
    Edge { side: Side, size: u32 },
    /// Square of `size` pixels in one corner
    Corner { corner: Corner, size: u32 },
    /// Full-height column band
    VerticalStrip { start: u32, width: u32 },
    /// Full-width row band
    HorizontalStrip { start: u32, height: u32 },
    /// Each pixel independently with the given probability
    Speckle { probability: f64 },
}

/// Uniform draw from `lo..hi`, or `lo` when the range is empty
fn range<R: Rng>(rng: &mut R, lo: u32, hi: u32) -> u32 {
    if hi > lo {
        rng.gen_range(lo..hi)
    } else {
        lo
    }
}

impl NodataPattern {
    /// One of the four pattern families, equally likely, sized for a `w x h` image
    pub fn random<R: Rng>(rng: &mut R, width: u32, height: u32) -> Self {
        match rng.gen_range(0..4) {
            0 => {
                let side = [Side::Top, Side::Bottom, Side::Left, Side::Right][rng.gen_range(0..4)];
                NodataPattern::Edge {
                    side,
                    size: range(rng, height / 4, height / 2),
                }
            }
            1 => {
                let corner = [
                    Corner::TopLeft,
                    Corner::TopRight,
                    Corner::BottomLeft,
                    Corner::BottomRight,
                ][rng.gen_range(0..4)];
                NodataPattern::Corner {
                    corner,
                    size: range(rng, height / 3, height / 2),
                }
            }
            2 => {
                if rng.gen::<f64>() > 0.5 {
                    NodataPattern::VerticalStrip {
                        start: range(rng, 0, width - width / 4),
                        width: range(rng, width / 6, width / 3),
                    }
                } else {
                    NodataPattern::HorizontalStrip {
                        start: range(rng, 0, height - height / 4),
                        height: range(rng, height / 6, height / 3),
                    }
                }
            }
            _ => NodataPattern::Speckle { probability: 0.3 },
        }
    }

    /// Zero the pattern's pixels; regions are clipped to the image
    pub fn apply<R: Rng>(&self, image: &mut GrayImage, rng: &mut R) {
        if let NodataPattern::Speckle { probability } = *self {
            for pixel in image.pixels_mut() {
                if rng.gen::<f64>() < probability {
                    *pixel = Luma([0]);
                }
            }
            return;
        }

        let (w, h) = image.dimensions();
        let mut blank = |x0: u32, y0: u32, x1: u32, y1: u32| {
            for y in y0..y1.min(h) {
                for x in x0..x1.min(w) {
                    image.put_pixel(x, y, Luma([0]));
                }
            }
        };
        match *self {
            NodataPattern::Edge { side, size } => match side {
                Side::Top => blank(0, 0, w, size),
                Side::Bottom => blank(0, h.saturating_sub(size), w, h),
                Side::Left => blank(0, 0, size, h),
                Side::Right => blank(w.saturating_sub(size), 0, w, h),
            },
            NodataPattern::Corner { corner, size } => {
                let (x0, y0) = match corner {
                    Corner::TopLeft => (0, 0),
                    Corner::TopRight => (w.saturating_sub(size), 0),
                    Corner::BottomLeft => (0, h.saturating_sub(size)),
                    Corner::BottomRight => (w.saturating_sub(size), h.saturating_sub(size)),
                };
                blank(x0, y0, x0 + size, y0 + size);
            }
            NodataPattern::VerticalStrip { start, width } => blank(start, 0, start + width, h),
            NodataPattern::HorizontalStrip { start, height } => blank(0, start, w, start + height),
            NodataPattern::Speckle { .. } => {}
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AugmentStats {
    pub files_copied: usize,
    pub train_images: usize,
    pub augmented: usize,
}

/// Copy `source` to `target` and add no-data patterns to training images
///
/// `target` is replaced if it exists. `floor(n_train * fraction)` distinct
/// training images are modified in place in the copy; validation images and
/// all labels are untouched.
pub fn augment_with_nodata(
    source: &Path,
    target: &Path,
    fraction: f64,
    seed: Option<u64>,
) -> Result<AugmentStats> {
    if !(0.0..=1.0).contains(&fraction) {
        return Err(CdwError::invalid(format!("augment fraction {} must lie in [0, 1]", fraction)));
    }
    let train_dir = source.join("images").join(Split::Train.as_str());
    if !train_dir.is_dir() {
        return Err(CdwError::Dataset {
            path: source.to_path_buf(),
            reason: "missing images/train".to_string(),
        });
    }
    let same = target.exists() && fs::canonicalize(source).ok() == fs::canonicalize(target).ok();
    if same || target.starts_with(source) {
        return Err(CdwError::invalid("augmentation target must lie outside the source dataset"));
    }
    if target.exists() {
        fs::remove_dir_all(target).map_err(|e| CdwError::io(target, e))?;
    }

    let mut stats = AugmentStats {
        files_copied: copy_tree(source, target)?,
        ..AugmentStats::default()
    };

    let images = list_pngs(&target.join("images").join(Split::Train.as_str()))?;
    stats.train_images = images.len();
    let count = (images.len() as f64 * fraction).floor() as usize;

    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    for idx in sample(&mut rng, images.len(), count).into_vec() {
        let path = &images[idx];
        let image_err = |source| CdwError::Image {
            path: path.clone(),
            source,
        };
        let mut image = image::open(path).map_err(image_err)?.to_luma8();
        let pattern = NodataPattern::random(&mut rng, image.width(), image.height());
        pattern.apply(&mut image, &mut rng);
        image.save_with_format(path, ImageFormat::Png).map_err(image_err)?;
        debug!("{}: {:?}", path.display(), pattern);
        stats.augmented += 1;
    }

    info!(
        "augmented {} of {} training images into {}",
        stats.augmented,
        stats.train_images,
        target.display()
    );
    Ok(stats)
}

fn copy_tree(source: &Path, target: &Path) -> Result<usize> {
    let mut copied = 0;
    for entry in WalkDir::new(source) {
        let entry = entry.map_err(|e| CdwError::io(source, e.into()))?;
        let rel = entry.path().strip_prefix(source).unwrap_or(entry.path());
        let dest = target.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&dest).map_err(|e| CdwError::io(&dest, e))?;
        } else {
            fs::copy(entry.path(), &dest).map_err(|e| CdwError::io(&dest, e))?;
            copied += 1;
        }
    }
    Ok(copied)
}

/// PNG files directly inside `dir`, sorted by name
pub(crate) fn list_pngs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut pngs = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| CdwError::io(dir, e))? {
        let path = entry.map_err(|e| CdwError::io(dir, e))?.path();
        if path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("png")) {
            pngs.push(path);
        }
    }
    pngs.sort();
    Ok(pngs)
}
