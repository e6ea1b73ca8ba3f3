// Vector label input
// GeoJSON line/polygon labels, CRS reconciliation against the raster, buffering

use std::fs;
use std::path::Path;

use geo::{Buffer, Coord, Geometry, LineString, MapCoords, MultiLineString, MultiPolygon, Polygon};
use log::{debug, warn};
use serde::Deserialize;

use crate::error::{CdwError, Result};

/// Default half-width in map units used to turn label lines into polygons
pub const DEFAULT_BUFFER_WIDTH: f64 = 0.5;

/// Label geometries with the coordinate reference they are expressed in
#[derive(Debug, Clone, Default)]
pub struct LabelSet {
    pub geometries: Vec<Geometry<f64>>,
    pub crs: Option<String>,
}

/// Converts coordinates between two coordinate reference systems
///
/// [`crate::projection::ProjTransform`] is the proj4rs implementation.
pub trait CoordinateTransform {
    fn transform(&self, from: &str, to: &str, coord: Coord<f64>) -> Result<Coord<f64>>;
}

#[derive(Deserialize)]
struct RawCollection {
    #[serde(default)]
    crs: Option<RawCrs>,
    #[serde(default)]
    features: Vec<RawFeature>,
}

#[derive(Deserialize)]
struct RawCrs {
    #[serde(default)]
    properties: Option<RawCrsProperties>,
}

#[derive(Deserialize)]
struct RawCrsProperties {
    name: Option<String>,
}

#[derive(Deserialize)]
struct RawFeature {
    geometry: Option<RawGeometry>,
}

#[derive(Deserialize)]
struct RawGeometry {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    coordinates: serde_json::Value,
}

type Positions = Vec<Vec<f64>>;

impl LabelSet {
    /// Read a GeoJSON FeatureCollection
    ///
    /// LineString, MultiLineString, Polygon and MultiPolygon features are
    /// kept; everything else is skipped with a debug message. The CRS comes
    /// from the legacy `crs` member when present.
    pub fn from_geojson_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| CdwError::io(path, e))?;
        Self::from_geojson_str(&text).map_err(|source| CdwError::Labels {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_geojson_str(text: &str) -> std::result::Result<Self, serde_json::Error> {
        let raw: RawCollection = serde_json::from_str(text)?;
        let crs = raw
            .crs
            .and_then(|c| c.properties)
            .and_then(|p| p.name)
            .map(|name| normalize_crs_name(&name));

        let mut geometries = Vec::with_capacity(raw.features.len());
        for feature in raw.features {
            let Some(geometry) = feature.geometry else {
                continue;
            };
            match geometry.kind.as_str() {
                "LineString" => {
                    let coords: Positions = serde_json::from_value(geometry.coordinates)?;
                    geometries.push(Geometry::LineString(line(&coords)));
                }
                "MultiLineString" => {
                    let lines: Vec<Positions> = serde_json::from_value(geometry.coordinates)?;
                    geometries.push(Geometry::MultiLineString(MultiLineString::new(
                        lines.iter().map(|l| line(l)).collect(),
                    )));
                }
                "Polygon" => {
                    let rings: Vec<Positions> = serde_json::from_value(geometry.coordinates)?;
                    if let Some(polygon) = polygon(&rings) {
                        geometries.push(Geometry::Polygon(polygon));
                    }
                }
                "MultiPolygon" => {
                    let parts: Vec<Vec<Positions>> = serde_json::from_value(geometry.coordinates)?;
                    geometries.push(Geometry::MultiPolygon(MultiPolygon::new(
                        parts.iter().filter_map(|rings| polygon(rings)).collect(),
                    )));
                }
                other => debug!("skipping unsupported label geometry {}", other),
            }
        }

        Ok(Self { geometries, crs })
    }

    pub fn len(&self) -> usize {
        self.geometries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.geometries.is_empty()
    }

    /// Bring the labels into the raster's CRS and return the CRS of the run
    ///
    /// - both defined and different: reproject, which needs `transform`
    /// - raster undefined: the labels' CRS becomes authoritative
    /// - labels undefined: they are assumed to be in the raster's CRS
    pub fn reconcile_crs(
        self,
        raster_crs: Option<&str>,
        transform: Option<&dyn CoordinateTransform>,
    ) -> Result<(Self, Option<String>)> {
        let labels_crs = self.crs.clone();
        match (raster_crs, labels_crs.as_deref()) {
            (Some(raster), Some(labels)) if !same_crs(raster, labels) => {
                let Some(transform) = transform else {
                    return Err(CdwError::CrsMismatch {
                        labels: labels.to_string(),
                        raster: raster.to_string(),
                    });
                };
                let from = labels.to_string();
                let geometries = self
                    .geometries
                    .iter()
                    .map(|g| g.try_map_coords(|c| transform.transform(&from, raster, c)))
                    .collect::<Result<Vec<_>>>()?;
                Ok((
                    Self {
                        geometries,
                        crs: Some(raster.to_string()),
                    },
                    Some(raster.to_string()),
                ))
            }
            (Some(raster), None) => {
                warn!("labels declare no CRS, assuming raster CRS {}", raster);
                let crs = Some(raster.to_string());
                Ok((
                    Self {
                        geometries: self.geometries,
                        crs: crs.clone(),
                    },
                    crs,
                ))
            }
            (None, labels) => {
                let crs = labels.map(str::to_string);
                Ok((self, crs))
            }
            (Some(raster), Some(_)) => {
                let crs = Some(raster.to_string());
                Ok((self, crs))
            }
        }
    }

    /// Buffer every geometry by `width` map units into plain polygons
    ///
    /// A width of zero or less keeps polygon labels as they are and drops
    /// line labels, which have no area without a buffer.
    pub fn buffered(&self, width: f64) -> Vec<Polygon<f64>> {
        let mut polygons = Vec::new();
        for geometry in &self.geometries {
            if width > 0.0 {
                polygons.extend(geometry.buffer(width).0);
                continue;
            }
            match geometry {
                Geometry::Polygon(p) => polygons.push(p.clone()),
                Geometry::MultiPolygon(mp) => polygons.extend(mp.0.iter().cloned()),
                _ => warn!("line label dropped: buffer width {} leaves no area", width),
            }
        }
        polygons
    }
}

fn line(coords: &Positions) -> LineString<f64> {
    coords
        .iter()
        .filter(|p| p.len() >= 2)
        .map(|p| Coord { x: p[0], y: p[1] })
        .collect()
}

fn polygon(rings: &[Positions]) -> Option<Polygon<f64>> {
    let (exterior, interiors) = rings.split_first()?;
    Some(Polygon::new(line(exterior), interiors.iter().map(line).collect()))
}

/// Canonical `EPSG:nnnn` form for EPSG names, anything else unchanged
///
/// Accepts `EPSG:25832`, `epsg:25832` and the OGC URN form
/// `urn:ogc:def:crs:EPSG::25832`.
pub fn normalize_crs_name(name: &str) -> String {
    let trimmed = name.trim();
    if trimmed.to_ascii_uppercase().contains("EPSG") {
        if let Some(code) = trimmed.rsplit(':').next() {
            if !code.is_empty() && code.chars().all(|c| c.is_ascii_digit()) {
                return format!("EPSG:{}", code);
            }
        }
    }
    trimmed.to_string()
}

fn same_crs(a: &str, b: &str) -> bool {
    normalize_crs_name(a).eq_ignore_ascii_case(&normalize_crs_name(b))
}
