// CSV export module
// One row per detection with attributes and WKT geometry

use std::path::Path;

use geo::Polygon;
use serde::Serialize;
use wkt::ToWkt;

use crate::detection::DetectedObject;
use crate::error::{CdwError, Result};

#[derive(Serialize)]
struct Row {
    id: usize,
    confidence: f32,
    area_m2: f64,
    length_m: f64,
    perimeter_m: f64,
    crs: String,
    wkt: String,
}

/// Polygon as WKT, holes included
pub fn polygon_wkt(polygon: &Polygon<f64>) -> String {
    polygon.wkt_string()
}

/// Export detections to a CSV table
pub fn export_csv(objects: &[DetectedObject], crs: Option<&str>, output_path: &Path) -> Result<()> {
    let csv_err = |source| CdwError::Csv {
        path: output_path.to_path_buf(),
        source,
    };
    let mut writer = csv::Writer::from_path(output_path).map_err(csv_err)?;
    let crs = crs.unwrap_or("None");
    if objects.is_empty() {
        writer
            .write_record(["id", "confidence", "area_m2", "length_m", "perimeter_m", "crs", "wkt"])
            .map_err(csv_err)?;
    }
    for (id, obj) in objects.iter().enumerate() {
        writer
            .serialize(Row {
                id,
                confidence: obj.confidence,
                area_m2: obj.area_m2,
                length_m: obj.length_m,
                perimeter_m: obj.perimeter_m,
                crs: crs.to_string(),
                wkt: polygon_wkt(&obj.polygon),
            })
            .map_err(csv_err)?;
    }
    writer.flush().map_err(|e| CdwError::io(output_path, e))
}
