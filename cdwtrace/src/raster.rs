// Raster input
// Single-band GeoTIFF reader with the geo tags needed for windowed processing

use std::cell::RefCell;
use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use cdwtrace_common::{GeoTransform, Window};
use log::{debug, warn};
use ndarray::{s, Array2};
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::encoder::{colortype, TiffEncoder};
use tiff::tags::Tag;

use crate::error::{CdwError, Result};

const TAG_MODEL_PIXEL_SCALE: u16 = 33550;
const TAG_MODEL_TIEPOINT: u16 = 33922;
const TAG_MODEL_TRANSFORMATION: u16 = 34264;
const TAG_GEO_KEY_DIRECTORY: u16 = 34735;
const TAG_GDAL_NODATA: u16 = 42113;

const KEY_GEOGRAPHIC_TYPE: u16 = 2048;
const KEY_PROJECTED_CS_TYPE: u16 = 3072;
const USER_DEFINED: u16 = 32767;

/// Read-only raster the pipeline tiles over
pub trait RasterSource {
    fn width(&self) -> u32;
    fn height(&self) -> u32;
    fn transform(&self) -> GeoTransform;
    /// Declared no-data sentinel, if any
    fn nodata(&self) -> Option<f64>;
    /// Coordinate reference, as `EPSG:nnnn` when known
    fn crs(&self) -> Option<&str>;
    /// Samples of band 1 inside `window`, shape (height, width)
    fn read_window(&self, window: &Window) -> Result<Array2<f32>>;

    /// Ground size of one pixel along x
    fn pixel_size(&self) -> f64 {
        self.transform().pixel_width.abs()
    }
}

/// Band 1 of a GeoTIFF
///
/// Files stay open and each window decodes only the strips or tiles it
/// overlaps. [`GeoRaster::from_array`] builds an in-memory raster instead.
pub struct GeoRaster {
    path: Option<PathBuf>,
    width: u32,
    height: u32,
    samples: Samples,
    transform: GeoTransform,
    nodata: Option<f64>,
    crs: Option<String>,
}

enum Samples {
    Memory(Array2<f32>),
    Chunked(RefCell<ChunkReader>),
}

/// Strip or tile layout of an open TIFF
struct ChunkReader {
    decoder: Decoder<BufReader<File>>,
    chunk_width: u32,
    chunk_height: u32,
    chunks_across: u32,
}

impl ChunkReader {
    /// Band 1 of one chunk with its width and height in pixels
    fn read(&mut self, index: u32) -> std::result::Result<(Vec<f32>, u32, u32), ChunkError> {
        let (width, height) = self.decoder.chunk_data_dimensions(index);
        let samples = samples_to_f32(self.decoder.read_chunk(index)?).ok_or(ChunkError::SampleFormat)?;
        let pixels = width as usize * height as usize;
        if pixels == 0 || samples.len() % pixels != 0 {
            return Err(ChunkError::Shape(samples.len(), width, height));
        }
        // interleaved bands: keep the first
        let bands = samples.len() / pixels;
        let band = if bands > 1 {
            samples.into_iter().step_by(bands).collect()
        } else {
            samples
        };
        Ok((band, width, height))
    }
}

enum ChunkError {
    Tiff(tiff::TiffError),
    SampleFormat,
    Shape(usize, u32, u32),
}

impl From<tiff::TiffError> for ChunkError {
    fn from(e: tiff::TiffError) -> Self {
        ChunkError::Tiff(e)
    }
}

fn samples_to_f32(result: DecodingResult) -> Option<Vec<f32>> {
    Some(match result {
        DecodingResult::F32(v) => v,
        DecodingResult::F64(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::U8(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::U16(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::U32(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::I8(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::I16(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::I32(v) => v.into_iter().map(|x| x as f32).collect(),
        _ => return None,
    })
}

/// Indices of the chunks a window overlaps, row-major
///
/// Strips are chunks as wide as the image, so one formula covers both layouts.
fn chunks_for(window: &Window, chunk_width: u32, chunk_height: u32, chunks_across: u32) -> Vec<u32> {
    if window.width == 0 || window.height == 0 {
        return Vec::new();
    }
    let cols = window.col_off / chunk_width..=(window.col_off + window.width - 1) / chunk_width;
    let rows = window.row_off / chunk_height..=(window.row_off + window.height - 1) / chunk_height;
    rows.flat_map(|r| cols.clone().map(move |c| r * chunks_across + c))
        .collect()
}

impl GeoRaster {
    pub fn open(path: &Path) -> Result<Self> {
        let tiff_err = |source| CdwError::Tiff {
            path: path.to_path_buf(),
            source,
        };
        let unsupported = |reason: String| CdwError::UnsupportedRaster {
            path: path.to_path_buf(),
            reason,
        };

        let file = File::open(path).map_err(|e| CdwError::io(path, e))?;
        let mut decoder = Decoder::new(BufReader::new(file))
            .map_err(tiff_err)?
            .with_limits(Limits::unlimited());
        let (width, height) = decoder.dimensions().map_err(tiff_err)?;
        if width == 0 || height == 0 {
            return Err(unsupported(format!("empty {}x{} raster", width, height)));
        }

        let transform = read_transform(&mut decoder).map_err(unsupported)?;
        let crs = read_epsg(&mut decoder).map(|code| format!("EPSG:{}", code));
        let nodata = read_nodata(&mut decoder);

        let (chunk_width, chunk_height) = decoder.chunk_dimensions();
        if chunk_width == 0 || chunk_height == 0 {
            return Err(unsupported(format!("chunk size {}x{}", chunk_width, chunk_height)));
        }
        let chunks_across = width.div_ceil(chunk_width);
        debug!(
            "{}: {}x{} in {:?} chunks of {}x{}",
            path.display(),
            width,
            height,
            decoder.get_chunk_type(),
            chunk_width,
            chunk_height
        );

        Ok(Self {
            path: Some(path.to_path_buf()),
            width,
            height,
            samples: Samples::Chunked(RefCell::new(ChunkReader {
                decoder,
                chunk_width,
                chunk_height,
                chunks_across,
            })),
            transform,
            nodata,
            crs,
        })
    }

    /// In-memory raster, rows first
    pub fn from_array(
        data: Array2<f32>,
        transform: GeoTransform,
        nodata: Option<f64>,
        crs: Option<String>,
    ) -> Self {
        Self {
            path: None,
            width: data.ncols() as u32,
            height: data.nrows() as u32,
            samples: Samples::Memory(data),
            transform,
            nodata,
            crs,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn read_chunked(&self, reader: &RefCell<ChunkReader>, window: &Window) -> Result<Array2<f32>> {
        let path = self.path.clone().unwrap_or_default();
        let mut reader = reader.borrow_mut();
        let (cw, ch, across) = (reader.chunk_width, reader.chunk_height, reader.chunks_across);
        let mut out = Array2::<f32>::zeros((window.height as usize, window.width as usize));

        for index in chunks_for(window, cw, ch, across) {
            let (band, data_width, data_height) = reader.read(index).map_err(|e| match e {
                ChunkError::Tiff(source) => CdwError::Tiff {
                    path: path.clone(),
                    source,
                },
                ChunkError::SampleFormat => CdwError::UnsupportedRaster {
                    path: path.clone(),
                    reason: "unsupported sample format".to_string(),
                },
                ChunkError::Shape(len, w, h) => CdwError::UnsupportedRaster {
                    path: path.clone(),
                    reason: format!("{} samples do not fit a {}x{} chunk", len, w, h),
                },
            })?;
            let chunk_col = (index % across) * cw;
            let chunk_row = (index / across) * ch;

            // overlap of chunk and window in raster pixels
            let c0 = chunk_col.max(window.col_off);
            let c1 = (chunk_col + data_width).min(window.col_off + window.width);
            let r0 = chunk_row.max(window.row_off);
            let r1 = (chunk_row + data_height).min(window.row_off + window.height);
            for row in r0..r1 {
                let src = ((row - chunk_row) * data_width + (c0 - chunk_col)) as usize;
                let dst_row = (row - window.row_off) as usize;
                for (i, col) in (c0..c1).enumerate() {
                    out[[dst_row, (col - window.col_off) as usize]] = band[src + i];
                }
            }
        }
        Ok(out)
    }
}

impl fmt::Debug for GeoRaster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeoRaster")
            .field("path", &self.path)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("transform", &self.transform)
            .field("nodata", &self.nodata)
            .field("crs", &self.crs)
            .finish_non_exhaustive()
    }
}

impl RasterSource for GeoRaster {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn transform(&self) -> GeoTransform {
        self.transform
    }

    fn nodata(&self) -> Option<f64> {
        self.nodata
    }

    fn crs(&self) -> Option<&str> {
        self.crs.as_deref()
    }

    fn read_window(&self, window: &Window) -> Result<Array2<f32>> {
        let (width, height) = (self.width, self.height);
        if window.col_off + window.width > width || window.row_off + window.height > height {
            return Err(CdwError::WindowOutOfBounds {
                window: *window,
                width,
                height,
            });
        }
        match &self.samples {
            Samples::Memory(data) => {
                let (r0, c0) = (window.row_off as usize, window.col_off as usize);
                Ok(data
                    .slice(s![r0..r0 + window.height as usize, c0..c0 + window.width as usize])
                    .to_owned())
            }
            Samples::Chunked(reader) => self.read_chunked(reader, window),
        }
    }
}

fn read_f64s<R: std::io::Read + std::io::Seek>(decoder: &mut Decoder<R>, tag: u16) -> Option<Vec<f64>> {
    decoder
        .find_tag(Tag::from_u16_exhaustive(tag))
        .ok()
        .flatten()
        .and_then(|v| v.into_f64_vec().ok())
}

/// Affine transform from ModelTransformation, or ModelPixelScale + ModelTiepoint
fn read_transform<R: std::io::Read + std::io::Seek>(
    decoder: &mut Decoder<R>,
) -> std::result::Result<GeoTransform, String> {
    if let Some(m) = read_f64s(decoder, TAG_MODEL_TRANSFORMATION).filter(|m| m.len() >= 8) {
        if m[1] != 0.0 || m[4] != 0.0 {
            return Err("rotated rasters are not supported".to_string());
        }
        return Ok(GeoTransform::new(m[3], m[0], m[7], m[5]));
    }

    let scale = read_f64s(decoder, TAG_MODEL_PIXEL_SCALE).filter(|s| s.len() >= 2);
    let tie = read_f64s(decoder, TAG_MODEL_TIEPOINT).filter(|t| t.len() >= 6);
    match (scale, tie) {
        (Some(scale), Some(tie)) => {
            let (sx, sy) = (scale[0], scale[1]);
            // tiepoint maps raster (i, j) to model (x, y)
            Ok(GeoTransform::new(tie[3] - tie[0] * sx, sx, tie[4] + tie[1] * sy, -sy))
        }
        _ => {
            warn!("no georeferencing tags, using pixel coordinates");
            Ok(GeoTransform::default())
        }
    }
}

/// EPSG code from the GeoKey directory, projected CRS first
fn read_epsg<R: std::io::Read + std::io::Seek>(decoder: &mut Decoder<R>) -> Option<u16> {
    let keys = decoder
        .find_tag(Tag::from_u16_exhaustive(TAG_GEO_KEY_DIRECTORY))
        .ok()
        .flatten()
        .and_then(|v| v.into_u16_vec().ok())?;
    epsg_from_geo_keys(&keys)
}

pub(crate) fn epsg_from_geo_keys(keys: &[u16]) -> Option<u16> {
    let count = *keys.get(3)? as usize;
    let entries: Vec<&[u16]> = keys.get(4..)?.chunks_exact(4).take(count).collect();
    let lookup = |id: u16| {
        entries
            .iter()
            .find(|e| e[0] == id && e[1] == 0)
            .map(|e| e[3])
            .filter(|&code| code != 0 && code != USER_DEFINED)
    };
    lookup(KEY_PROJECTED_CS_TYPE).or_else(|| lookup(KEY_GEOGRAPHIC_TYPE))
}

fn read_nodata<R: std::io::Read + std::io::Seek>(decoder: &mut Decoder<R>) -> Option<f64> {
    let text = decoder
        .find_tag(Tag::from_u16_exhaustive(TAG_GDAL_NODATA))
        .ok()
        .flatten()
        .and_then(|v| v.into_string().ok())?;
    let value = text.trim_matches(|c: char| c == '\0' || c.is_whitespace());
    match value.parse::<f64>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("ignoring unparseable GDAL_NODATA value {:?}", value);
            None
        }
    }
}

/// Write a single-band float GeoTIFF with scale, tiepoint, EPSG and nodata tags
pub fn write_geotiff(
    path: &Path,
    data: &Array2<f32>,
    transform: &GeoTransform,
    epsg: Option<u16>,
    nodata: Option<f64>,
) -> Result<()> {
    let tiff_err = |source| CdwError::Tiff {
        path: path.to_path_buf(),
        source,
    };
    let (rows, cols) = data.dim();
    let file = File::create(path).map_err(|e| CdwError::io(path, e))?;
    let mut encoder = TiffEncoder::new(BufWriter::new(file)).map_err(tiff_err)?;
    let mut image = encoder
        .new_image::<colortype::Gray32Float>(cols as u32, rows as u32)
        .map_err(tiff_err)?;

    let scale = [transform.pixel_width, -transform.pixel_height, 0.0];
    let tie = [0.0, 0.0, 0.0, transform.origin_x, transform.origin_y, 0.0];
    image
        .encoder()
        .write_tag(Tag::from_u16_exhaustive(TAG_MODEL_PIXEL_SCALE), &scale[..])
        .map_err(tiff_err)?;
    image
        .encoder()
        .write_tag(Tag::from_u16_exhaustive(TAG_MODEL_TIEPOINT), &tie[..])
        .map_err(tiff_err)?;
    if let Some(code) = epsg {
        let keys: [u16; 8] = [1, 1, 0, 1, KEY_PROJECTED_CS_TYPE, 0, 1, code];
        image
            .encoder()
            .write_tag(Tag::from_u16_exhaustive(TAG_GEO_KEY_DIRECTORY), &keys[..])
            .map_err(tiff_err)?;
    }
    if let Some(value) = nodata {
        let text = value.to_string();
        image
            .encoder()
            .write_tag(Tag::from_u16_exhaustive(TAG_GDAL_NODATA), text.as_str())
            .map_err(tiff_err)?;
    }

    let samples: Vec<f32> = data.iter().copied().collect();
    image.write_data(&samples).map_err(tiff_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ramp(rows: usize, cols: usize) -> Array2<f32> {
        Array2::from_shape_fn((rows, cols), |(r, c)| (r * cols + c) as f32)
    }

    #[test]
    fn test_geotiff_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chm.tif");
        let transform = GeoTransform::new(380000.0, 0.5, 6700000.0, -0.5);
        write_geotiff(&path, &ramp(30, 40), &transform, Some(3067), Some(-9999.0)).unwrap();

        let raster = GeoRaster::open(&path).unwrap();
        assert_eq!(raster.width(), 40);
        assert_eq!(raster.height(), 30);
        assert_eq!(raster.transform(), transform);
        assert_eq!(raster.crs(), Some("EPSG:3067"));
        assert_eq!(raster.nodata(), Some(-9999.0));
        assert_eq!(raster.pixel_size(), 0.5);
        let tile = raster.read_window(&Window::new(3, 2, 1, 1)).unwrap();
        assert_eq!(tile[[0, 0]], 83.0);
    }

    #[test]
    fn test_windows_span_strip_boundaries() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("large.tif");
        // enough rows for several strips
        let data = ramp(300, 260);
        write_geotiff(&path, &data, &GeoTransform::default(), None, None).unwrap();
        let raster = GeoRaster::open(&path).unwrap();

        for window in [
            Window::new(0, 0, 260, 300),
            Window::new(17, 5, 64, 64),
            Window::new(200, 230, 60, 70),
            Window::new(259, 299, 1, 1),
        ] {
            let expected = raster_slice(&data, &window);
            assert_eq!(raster.read_window(&window).unwrap(), expected, "window {}", window);
        }
    }

    fn raster_slice(data: &Array2<f32>, w: &Window) -> Array2<f32> {
        let (r0, c0) = (w.row_off as usize, w.col_off as usize);
        data.slice(s![r0..r0 + w.height as usize, c0..c0 + w.width as usize])
            .to_owned()
    }

    #[test]
    fn test_chunks_for_tiled_layout() {
        // 100 px wide image in 32x32 tiles, four tiles across
        assert_eq!(chunks_for(&Window::new(0, 0, 32, 32), 32, 32, 4), vec![0]);
        assert_eq!(chunks_for(&Window::new(30, 30, 4, 4), 32, 32, 4), vec![0, 1, 4, 5]);
        assert_eq!(chunks_for(&Window::new(96, 64, 4, 10), 32, 32, 4), vec![11]);
        // strips: one chunk per row band
        assert_eq!(chunks_for(&Window::new(10, 5, 50, 20), 100, 8, 1), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_missing_geo_tags_fall_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("plain.tif");
        let file = File::create(&path).unwrap();
        let mut encoder = TiffEncoder::new(file).unwrap();
        encoder
            .write_image::<colortype::Gray16>(4, 2, &[1, 2, 3, 4, 5, 6, 7, 8])
            .unwrap();

        let raster = GeoRaster::open(&path).unwrap();
        assert_eq!(raster.transform(), GeoTransform::default());
        assert_eq!(raster.crs(), None);
        assert_eq!(raster.nodata(), None);
        let all = raster.read_window(&Window::new(0, 0, 4, 2)).unwrap();
        assert_eq!(all[[1, 0]], 5.0);
    }

    #[test]
    fn test_read_window() {
        let raster = GeoRaster::from_array(ramp(10, 10), GeoTransform::default(), None, None);
        let tile = raster.read_window(&Window::new(2, 3, 4, 2)).unwrap();
        assert_eq!(tile.dim(), (2, 4));
        assert_eq!(tile[[0, 0]], 32.0);
        assert_eq!(tile[[1, 3]], 45.0);
    }

    #[test]
    fn test_window_outside_raster_is_rejected() {
        let raster = GeoRaster::from_array(ramp(10, 10), GeoTransform::default(), None, None);
        let err = raster.read_window(&Window::new(8, 0, 4, 4)).unwrap_err();
        assert!(matches!(err, CdwError::WindowOutOfBounds { .. }));
    }

    #[test]
    fn test_geo_keys_prefer_projected() {
        let keys = [1, 1, 0, 3, 1024, 0, 1, 1, 2048, 0, 1, 4326, 3072, 0, 1, 25832];
        assert_eq!(epsg_from_geo_keys(&keys), Some(25832));
        let geographic = [1, 1, 0, 1, 2048, 0, 1, 4326];
        assert_eq!(epsg_from_geo_keys(&geographic), Some(4326));
        let user_defined = [1, 1, 0, 1, 3072, 0, 1, 32767];
        assert_eq!(epsg_from_geo_keys(&user_defined), None);
        assert_eq!(epsg_from_geo_keys(&[1, 1]), None);
    }
}
