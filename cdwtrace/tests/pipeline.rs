// End-to-end runs over synthetic GeoTIFFs written to scratch directories

use std::fs;
use std::path::Path;

use cdwtrace::export_csv::export_csv;
use cdwtrace::export_geojson::export_geojson;
use cdwtrace::raster::write_geotiff;
use cdwtrace::training::summarize_dataset;
use cdwtrace::{
    CdwError, CoordinateTransform, DataPreparer, Detector, DetectorConfig, GeoRaster, LabelSet, MaskPrediction,
    PrepareConfig, ProjTransform, RasterSource, SegmentationPredictor,
};
use cdwtrace_common::GeoTransform;
use image::GrayImage;
use ndarray::Array2;
use tempfile::TempDir;

const ORIGIN_X: f64 = 500_000.0;
const ORIGIN_Y: f64 = 6_500_000.0;
const PIXEL: f64 = 0.5;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// 200x200 gentle ramp at 0.5 m with optional raised blocks (rows, cols)
fn write_raster(path: &Path, blocks: &[(std::ops::Range<usize>, std::ops::Range<usize>)]) {
    let mut data = Array2::from_shape_fn((200, 200), |(r, c)| (r + c) as f32 * 0.01);
    for (rows, cols) in blocks {
        for r in rows.clone() {
            for c in cols.clone() {
                data[[r, c]] = 30.0;
            }
        }
    }
    let transform = GeoTransform::new(ORIGIN_X, PIXEL, ORIGIN_Y, -PIXEL);
    write_geotiff(path, &data, &transform, Some(3301), Some(-9999.0)).unwrap();
}

fn labels_json(crs: &str) -> String {
    // a 30 m log along row 50, from column 20 to column 80
    format!(
        r#"{{
  "type": "FeatureCollection",
  "crs": {{ "type": "name", "properties": {{ "name": "{crs}" }} }},
  "features": [
    {{
      "type": "Feature",
      "properties": {{ "id": 1 }},
      "geometry": {{ "type": "LineString", "coordinates": [[500010.0, 6499975.0], [500040.0, 6499975.0]] }}
    }},
    {{
      "type": "Feature",
      "properties": {{ "id": 2 }},
      "geometry": {{ "type": "Point", "coordinates": [500010.0, 6499975.0] }}
    }}
  ]
}}"#
    )
}

fn prepare_config() -> PrepareConfig {
    PrepareConfig {
        tile_size: 100,
        overlap: 0.2,
        val_split: 0.0,
        seed: Some(1),
        ..PrepareConfig::default()
    }
}

#[test]
fn test_prepare_writes_dataset_layout() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let raster_path = dir.path().join("chm.tif");
    let labels_path = dir.path().join("cdw.geojson");
    let out = dir.path().join("dataset");
    write_raster(&raster_path, &[]);
    fs::write(&labels_path, labels_json("urn:ogc:def:crs:EPSG::3301")).unwrap();

    let raster = GeoRaster::open(&raster_path).unwrap();
    assert_eq!(raster.crs(), Some("EPSG:3301"));
    let labels = LabelSet::from_geojson_file(&labels_path).unwrap();
    assert_eq!(labels.len(), 1);

    let stats = DataPreparer::new(&out, prepare_config())
        .unwrap()
        .prepare(&raster, labels, None)
        .unwrap();

    // stride 80 gives two windows per axis
    assert_eq!(stats.total, 4);
    assert_eq!(stats.with_cdw, 1);
    assert_eq!(stats.empty, 3);
    assert_eq!(stats.skipped, 0);

    for i in 0..4 {
        let png = out.join(format!("images/train/tile_{:05}.png", i));
        let tile = image::open(&png).unwrap().to_luma8();
        assert_eq!(tile.dimensions(), (100, 100));
        assert!(out.join(format!("labels/train/tile_{:05}.txt", i)).exists());
    }

    let label = fs::read_to_string(out.join("labels/train/tile_00000.txt")).unwrap();
    assert_eq!(label.lines().count(), 1);
    assert!(!label.ends_with('\n'));
    let fields: Vec<&str> = label.split(' ').collect();
    assert_eq!(fields[0], "0");
    assert!(fields.len() >= 7);
    for value in &fields[1..] {
        assert_eq!(value.split('.').nth(1).map(str::len), Some(6));
        let v: f64 = value.parse().unwrap();
        assert!((0.0..=1.0).contains(&v));
    }
    // the label touches the next window by less than min_log_pixels
    assert_eq!(fs::read_to_string(out.join("labels/train/tile_00001.txt")).unwrap(), "");

    let manifest = fs::read_to_string(out.join("dataset.yaml")).unwrap();
    assert!(manifest.starts_with("path: /"));
    assert!(manifest.ends_with("train: images/train\nval: images/val\n\nnames:\n  0: cdw\n"));

    let metadata = fs::read_to_string(out.join("tile_metadata.csv")).unwrap();
    let mut lines = metadata.lines();
    assert_eq!(
        lines.next(),
        Some("tile,split,col_off,row_off,minx,miny,maxx,maxy,crs,has_cdw")
    );
    let first: Vec<&str> = lines.next().unwrap().split(',').collect();
    assert_eq!(&first[..4], &["tile_00000", "train", "0", "0"]);
    assert_eq!(first[4].parse::<f64>().unwrap(), ORIGIN_X);
    assert_eq!(first[7].parse::<f64>().unwrap(), ORIGIN_Y);
    assert_eq!(first[8], "EPSG:3301");
    assert_eq!(first[9], "True");
    let second: Vec<&str> = lines.next().unwrap().split(',').collect();
    assert_eq!(&second[..4], &["tile_00001", "train", "80", "0"]);
    assert_eq!(second[9], "False");
    assert_eq!(lines.count(), 2);

    let summary = summarize_dataset(&out).unwrap();
    assert_eq!(summary.train.images, 4);
    assert_eq!(summary.train.with_cdw, 1);
    assert_eq!(summary.val.images, 0);
}

fn line_json(crs: &str, from: (f64, f64), to: (f64, f64)) -> String {
    format!(
        r#"{{
  "type": "FeatureCollection",
  "crs": {{ "type": "name", "properties": {{ "name": "{crs}" }} }},
  "features": [
    {{
      "type": "Feature",
      "properties": {{}},
      "geometry": {{ "type": "LineString", "coordinates": [[{:.12}, {:.12}], [{:.12}, {:.12}]] }}
    }}
  ]
}}"#,
        from.0, from.1, to.0, to.1
    )
}

#[test]
fn test_labels_crossing_window_edges_are_kept() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let raster_path = dir.path().join("chm.tif");
    let out = dir.path().join("dataset");
    write_raster(&raster_path, &[]);
    let raster = GeoRaster::open(&raster_path).unwrap();

    // row 30, columns 60 to 120: cut by the right edge of the first window
    // and the left edge of the second
    let labels = LabelSet::from_geojson_str(&line_json(
        "EPSG:3301",
        (ORIGIN_X + 30.0, ORIGIN_Y - 15.0),
        (ORIGIN_X + 60.0, ORIGIN_Y - 15.0),
    ))
    .unwrap();
    let stats = DataPreparer::new(&out, prepare_config())
        .unwrap()
        .prepare(&raster, labels, None)
        .unwrap();
    assert_eq!(stats.with_cdw, 2);

    let xs = |tile: usize| -> Vec<f64> {
        let label = fs::read_to_string(out.join(format!("labels/train/tile_{:05}.txt", tile))).unwrap();
        assert_eq!(label.lines().count(), 1);
        label
            .split(' ')
            .skip(1)
            .step_by(2)
            .map(|v| v.parse().unwrap())
            .collect()
    };
    let first = xs(0);
    assert_eq!(first.iter().cloned().fold(0.0, f64::max), 0.99);
    let second = xs(1);
    assert_eq!(second.iter().cloned().fold(1.0, f64::min), 0.0);
}

#[test]
fn test_prepare_reprojects_geographic_labels() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let raster_path = dir.path().join("chm.tif");
    write_raster(&raster_path, &[]);
    let raster = GeoRaster::open(&raster_path).unwrap();

    let proj = ProjTransform::new();
    let from = (ORIGIN_X + 10.0, ORIGIN_Y - 25.0);
    let to = (ORIGIN_X + 40.0, ORIGIN_Y - 25.0);
    let lonlat = |(x, y): (f64, f64)| {
        let c = proj
            .transform("EPSG:3301", "EPSG:4326", geo::Coord { x, y })
            .unwrap();
        (c.x, c.y)
    };
    let geographic = line_json("EPSG:4326", lonlat(from), lonlat(to));
    let projected = line_json("EPSG:3301", from, to);

    let mut labels_written = Vec::new();
    for (name, json) in [("projected", projected), ("geographic", geographic)] {
        let out = dir.path().join(name);
        let labels = LabelSet::from_geojson_str(&json).unwrap();
        let stats = DataPreparer::new(&out, prepare_config())
            .unwrap()
            .prepare(&raster, labels, Some(&proj))
            .unwrap();
        assert_eq!(stats.with_cdw, 1);
        labels_written.push(fs::read_to_string(out.join("labels/train/tile_00000.txt")).unwrap());
    }
    assert!(!labels_written[0].is_empty());
    assert_eq!(labels_written[0], labels_written[1]);
}

#[test]
fn test_prepare_rejects_unknown_label_crs_before_writing() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let raster_path = dir.path().join("chm.tif");
    let out = dir.path().join("dataset");
    write_raster(&raster_path, &[]);

    let raster = GeoRaster::open(&raster_path).unwrap();
    let labels = LabelSet::from_geojson_str(&labels_json("EPSG:2154")).unwrap();
    let err = DataPreparer::new(&out, prepare_config())
        .unwrap()
        .prepare(&raster, labels, Some(&ProjTransform::new()))
        .unwrap_err();

    assert!(matches!(err, CdwError::Reprojection { .. }));
    assert!(!out.join("images").exists());
}

#[test]
fn test_seeded_split_is_reproducible() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let raster_path = dir.path().join("chm.tif");
    write_raster(&raster_path, &[]);
    let raster = GeoRaster::open(&raster_path).unwrap();

    let config = PrepareConfig {
        val_split: 0.5,
        seed: Some(99),
        tile_size: 40,
        ..prepare_config()
    };
    let mut metadata = Vec::new();
    for name in ["a", "b"] {
        let out = dir.path().join(name);
        let labels = LabelSet::from_geojson_str(&labels_json("EPSG:3301")).unwrap();
        DataPreparer::new(&out, config.clone())
            .unwrap()
            .prepare(&raster, labels, None)
            .unwrap();
        metadata.push(fs::read_to_string(out.join("tile_metadata.csv")).unwrap());
    }
    assert_eq!(metadata[0], metadata[1]);
}

/// Foreground wherever the tile is near its maximum
///
/// A window holding only the background ramp would light up its top corner,
/// so detect tests give every window a raised block or a single-pixel peak.
/// A lone pixel traces to fewer than three points and yields nothing.
struct BrightSpots;

impl SegmentationPredictor for BrightSpots {
    fn predict(&mut self, tile: &GrayImage, _confidence: f32, _iou: f32) -> cdwtrace::Result<Vec<MaskPrediction>> {
        let (w, h) = tile.dimensions();
        let mask = Array2::from_shape_fn((h as usize, w as usize), |(r, c)| {
            if tile.get_pixel(c as u32, r as u32)[0] > 200 {
                1.0
            } else {
                0.0
            }
        });
        if mask.iter().all(|&v| v == 0.0) {
            return Ok(Vec::new());
        }
        Ok(vec![MaskPrediction { mask, confidence: 0.8 }])
    }
}

#[test]
fn test_detect_merges_overlap_and_drops_small_objects() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let raster_path = dir.path().join("chm.tif");
    // a log inside the overlap of the first two windows, a 2x2 px speck,
    // and a one-pixel peak so the bottom-left window is not bare ramp
    write_raster(&raster_path, &[(20..60, 85..95), (150..152, 150..152), (170..171, 10..11)]);
    let raster = GeoRaster::open(&raster_path).unwrap();

    let detector = Detector::new(DetectorConfig {
        tile_size: 100,
        stride: 80,
        ..DetectorConfig::default()
    })
    .unwrap();
    let run = detector.detect(&raster, &mut BrightSpots).unwrap();

    assert_eq!(run.stats.windows, 4);
    // the speck spans 1x1 px between contour points, 0.25 m² < 0.5 m²
    assert_eq!(run.stats.raw_detections, 2);
    assert_eq!(run.stats.final_detections, 1);
    assert_eq!(run.crs.as_deref(), Some("EPSG:3301"));

    let log = &run.objects[0];
    assert_eq!(log.confidence, 0.8);
    // 9 x 39 px between contour corners
    assert!((log.area_m2 - 9.0 * 39.0 * PIXEL * PIXEL).abs() < 1e-6);
    assert!((log.perimeter_m - 2.0 * (9.0 + 39.0) * PIXEL).abs() < 1e-6);
    assert_eq!(log.length_m, log.perimeter_m);

    let geojson = dir.path().join("detections.geojson");
    let csv = dir.path().join("detections.csv");
    export_geojson(&run.objects, run.crs.as_deref(), &geojson).unwrap();
    export_csv(&run.objects, run.crs.as_deref(), &csv).unwrap();

    let back = LabelSet::from_geojson_file(&geojson).unwrap();
    assert_eq!(back.len(), 1);
    assert_eq!(back.crs.as_deref(), Some("EPSG:3301"));
    let rows = fs::read_to_string(&csv).unwrap();
    assert_eq!(rows.lines().count(), 2);
    assert!(rows.lines().nth(1).unwrap().contains("POLYGON"));
}

#[test]
fn test_detect_keeps_objects_on_the_raster_edge() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let raster_path = dir.path().join("chm.tif");
    // 40 x 10 px log against the left edge of the raster, one-pixel peaks in
    // the other three windows
    write_raster(
        &raster_path,
        &[(20..60, 0..10), (10..11, 170..171), (170..171, 10..11), (170..171, 170..171)],
    );
    let raster = GeoRaster::open(&raster_path).unwrap();

    let detector = Detector::new(DetectorConfig {
        tile_size: 100,
        stride: 80,
        ..DetectorConfig::default()
    })
    .unwrap();
    let run = detector.detect(&raster, &mut BrightSpots).unwrap();

    assert_eq!(run.stats.raw_detections, 1);
    assert_eq!(run.stats.final_detections, 1);
    assert!((run.objects[0].area_m2 - 9.0 * 39.0 * PIXEL * PIXEL).abs() < 1e-6);
}
