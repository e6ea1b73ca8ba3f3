// GeoJSON export module
// Writes final detections as a FeatureCollection in map coordinates

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use geo::{LineString, Polygon};
use serde::Serialize;

use crate::detection::DetectedObject;
use crate::error::{CdwError, Result};

#[derive(Serialize)]
struct FeatureCollection<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    crs: Option<NamedCrs<'a>>,
    features: Vec<Feature>,
}

#[derive(Serialize)]
struct NamedCrs<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    properties: CrsName<'a>,
}

#[derive(Serialize)]
struct CrsName<'a> {
    name: &'a str,
}

#[derive(Serialize)]
struct Feature {
    #[serde(rename = "type")]
    kind: &'static str,
    id: usize,
    geometry: PolygonGeometry,
    properties: Properties,
}

#[derive(Serialize)]
struct PolygonGeometry {
    #[serde(rename = "type")]
    kind: &'static str,
    coordinates: Vec<Vec<[f64; 2]>>,
}

#[derive(Serialize)]
struct Properties {
    confidence: f32,
    area_m2: f64,
    length_m: f64,
    perimeter_m: f64,
}

fn ring(line: &LineString<f64>) -> Vec<[f64; 2]> {
    line.coords().map(|c| [c.x, c.y]).collect()
}

fn rings(polygon: &Polygon<f64>) -> Vec<Vec<[f64; 2]>> {
    std::iter::once(polygon.exterior())
        .chain(polygon.interiors())
        .map(ring)
        .collect()
}

/// Export detections to a GeoJSON file
///
/// `crs` is written as a legacy named CRS member so GIS tools pick up the
/// projected coordinates.
pub fn export_geojson(objects: &[DetectedObject], crs: Option<&str>, output_path: &Path) -> Result<()> {
    let collection = FeatureCollection {
        kind: "FeatureCollection",
        crs: crs.map(|name| NamedCrs {
            kind: "name",
            properties: CrsName { name },
        }),
        features: objects
            .iter()
            .enumerate()
            .map(|(id, obj)| Feature {
                kind: "Feature",
                id,
                geometry: PolygonGeometry {
                    kind: "Polygon",
                    coordinates: rings(&obj.polygon),
                },
                properties: Properties {
                    confidence: obj.confidence,
                    area_m2: obj.area_m2,
                    length_m: obj.length_m,
                    perimeter_m: obj.perimeter_m,
                },
            })
            .collect(),
    };

    let io_err = |e: std::io::Error| CdwError::io(output_path, e);
    let file = File::create(output_path).map_err(io_err)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, &collection).map_err(|e| io_err(e.into()))?;
    writeln!(writer).map_err(io_err)?;
    writer.flush().map_err(io_err)
}
