// Label reprojection
// EPSG codes resolved to proj strings and transformed with proj4rs

use std::cell::RefCell;

use geo::Coord;
use log::debug;
use proj4rs::proj::Proj;
use proj4rs::transform::transform;

use crate::error::{CdwError, Result};
use crate::labels::{normalize_crs_name, CoordinateTransform};

/// proj string for the EPSG codes the pipeline knows about
///
/// Geographic WGS84/ETRS89, the Estonian and Finnish national grids, and the
/// ETRS89 and WGS84 UTM zones.
pub fn proj_string(epsg: u32) -> Option<String> {
    let known = match epsg {
        4326 => "+proj=longlat +datum=WGS84 +no_defs",
        4258 => "+proj=longlat +ellps=GRS80 +towgs84=0,0,0,0,0,0,0 +no_defs",
        3301 => {
            "+proj=lcc +lat_0=57.5175539305556 +lon_0=24 +lat_1=59.3333333333333 +lat_2=58 \
             +x_0=500000 +y_0=6375000 +ellps=GRS80 +towgs84=0,0,0,0,0,0,0 +units=m +no_defs"
        }
        3067 => "+proj=utm +zone=35 +ellps=GRS80 +towgs84=0,0,0,0,0,0,0 +units=m +no_defs",
        25828..=25838 => {
            return Some(format!(
                "+proj=utm +zone={} +ellps=GRS80 +towgs84=0,0,0,0,0,0,0 +units=m +no_defs",
                epsg - 25800
            ))
        }
        32601..=32660 => {
            return Some(format!("+proj=utm +zone={} +datum=WGS84 +units=m +no_defs", epsg - 32600))
        }
        32701..=32760 => {
            return Some(format!(
                "+proj=utm +zone={} +south +datum=WGS84 +units=m +no_defs",
                epsg - 32700
            ))
        }
        _ => return None,
    };
    Some(known.to_string())
}

/// EPSG code of a CRS name; the OGC CRS84 alias counts as 4326
pub fn epsg_code(crs: &str) -> Option<u32> {
    if crs.to_ascii_uppercase().ends_with("CRS84") {
        return Some(4326);
    }
    normalize_crs_name(crs).strip_prefix("EPSG:")?.parse().ok()
}

fn is_geographic(epsg: u32) -> bool {
    matches!(epsg, 4326 | 4258)
}

struct ProjPair {
    from: String,
    to: String,
    source: Proj,
    target: Proj,
    source_geographic: bool,
    target_geographic: bool,
}

impl ProjPair {
    fn new(from: &str, to: &str) -> Result<Self> {
        let fail = |reason: String| CdwError::Reprojection {
            from: from.to_string(),
            to: to.to_string(),
            reason,
        };
        let resolve = |crs: &str| -> Result<(Proj, bool)> {
            let epsg = epsg_code(crs).ok_or_else(|| fail(format!("{} is not an EPSG code", crs)))?;
            let definition =
                proj_string(epsg).ok_or_else(|| fail(format!("EPSG:{} has no known definition", epsg)))?;
            let proj = Proj::from_proj_string(&definition)
                .map_err(|e| fail(format!("invalid projection EPSG:{}: {:?}", epsg, e)))?;
            Ok((proj, is_geographic(epsg)))
        };

        let (source, source_geographic) = resolve(from)?;
        let (target, target_geographic) = resolve(to)?;
        debug!("reprojecting {} -> {}", from, to);
        Ok(Self {
            from: from.to_string(),
            to: to.to_string(),
            source,
            target,
            source_geographic,
            target_geographic,
        })
    }

    fn matches(&self, from: &str, to: &str) -> bool {
        self.from == from && self.to == to
    }

    fn apply(&self, coord: Coord<f64>) -> Result<Coord<f64>> {
        let mut point = if self.source_geographic {
            (coord.x.to_radians(), coord.y.to_radians(), 0.0)
        } else {
            (coord.x, coord.y, 0.0)
        };
        transform(&self.source, &self.target, &mut point).map_err(|e| CdwError::Reprojection {
            from: self.from.clone(),
            to: self.to.clone(),
            reason: format!("{:?} at ({}, {})", e, coord.x, coord.y),
        })?;
        if self.target_geographic {
            point.0 = point.0.to_degrees();
            point.1 = point.1.to_degrees();
        }
        if !(point.0.is_finite() && point.1.is_finite()) {
            return Err(CdwError::Reprojection {
                from: self.from.clone(),
                to: self.to.clone(),
                reason: format!("({}, {}) has no finite image", coord.x, coord.y),
            });
        }
        Ok(Coord {
            x: point.0,
            y: point.1,
        })
    }
}

/// [`CoordinateTransform`] backed by proj4rs
///
/// The parsed projections of the last CRS pair are kept, so transforming a
/// whole label set parses each definition once.
#[derive(Default)]
pub struct ProjTransform {
    cached: RefCell<Option<ProjPair>>,
}

impl ProjTransform {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CoordinateTransform for ProjTransform {
    fn transform(&self, from: &str, to: &str, coord: Coord<f64>) -> Result<Coord<f64>> {
        let mut cached = self.cached.borrow_mut();
        if !cached.as_ref().is_some_and(|pair| pair.matches(from, to)) {
            *cached = Some(ProjPair::new(from, to)?);
        }
        match cached.as_ref() {
            Some(pair) => pair.apply(coord),
            None => Err(CdwError::Reprojection {
                from: from.to_string(),
                to: to.to_string(),
                reason: "no projection pair".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epsg_codes() {
        assert_eq!(epsg_code("EPSG:3301"), Some(3301));
        assert_eq!(epsg_code("urn:ogc:def:crs:EPSG::25832"), Some(25832));
        assert_eq!(epsg_code("urn:ogc:def:crs:OGC:1.3:CRS84"), Some(4326));
        assert_eq!(epsg_code("LOCAL_CS"), None);
        assert!(proj_string(25835).unwrap().contains("+zone=35"));
        assert!(proj_string(32734).unwrap().contains("+south"));
        assert!(proj_string(2154).is_none());
    }

    #[test]
    fn test_lest97_false_origin() {
        let proj = ProjTransform::new();
        let origin = proj
            .transform("EPSG:4326", "EPSG:3301", Coord { x: 24.0, y: 57.5175539305556 })
            .unwrap();
        assert!((origin.x - 500_000.0).abs() < 0.01, "x = {}", origin.x);
        assert!((origin.y - 6_375_000.0).abs() < 0.01, "y = {}", origin.y);
    }

    #[test]
    fn test_round_trip_through_geographic() {
        let proj = ProjTransform::new();
        let start = Coord { x: 540_000.0, y: 6_590_000.0 };
        let lonlat = proj.transform("EPSG:3301", "EPSG:4326", start).unwrap();
        assert!(lonlat.x > 21.0 && lonlat.x < 29.0);
        assert!(lonlat.y > 57.0 && lonlat.y < 60.0);

        let back = proj.transform("EPSG:4326", "EPSG:3301", lonlat).unwrap();
        assert!((back.x - start.x).abs() < 1e-3);
        assert!((back.y - start.y).abs() < 1e-3);
    }

    #[test]
    fn test_unknown_crs_is_a_reprojection_error() {
        let proj = ProjTransform::new();
        let err = proj
            .transform("EPSG:2154", "EPSG:3301", Coord { x: 0.0, y: 0.0 })
            .unwrap_err();
        assert!(matches!(err, CdwError::Reprojection { .. }));
    }
}
