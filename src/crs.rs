use gdal::spatial_ref::SpatialRef;
use log::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CrsUnits {
    Meters,
    Degrees,
    /// Projected with a non-metric linear unit (feet, ...).
    OtherLinear,
    Unknown,
}

impl CrsUnits {
    pub fn is_metric(&self) -> bool {
        matches!(self, CrsUnits::Meters)
    }
}

/// Detect the linear unit of the raster CRS
///
/// Processing resolution is given in cm/px, so anything but a metric
/// projected CRS produces tiles of a meaningless ground size.
pub fn detect_crs_units(projection_wkt: &str) -> CrsUnits {
    let spatial_ref = match SpatialRef::from_wkt(projection_wkt) {
        Ok(sr) => sr,
        Err(e) => {
            warn!("Failed to parse projection WKT: {}", e);
            return CrsUnits::Unknown;
        }
    };

    if spatial_ref.is_geographic() {
        return CrsUnits::Degrees;
    }

    if spatial_ref.is_projected() {
        let linear_units = spatial_ref.linear_units();
        if (linear_units - 1.0).abs() < 0.01 {
            return CrsUnits::Meters;
        }
        return CrsUnits::OtherLinear;
    }

    CrsUnits::Unknown
}

/// Logs whether resolutions in meters make sense for `projection_wkt`.
pub fn check_metric_crs(projection_wkt: &str) -> CrsUnits {
    let units = detect_crs_units(projection_wkt);
    match units {
        CrsUnits::Meters => info!("Projected CRS with meter units detected"),
        CrsUnits::Degrees => warn!(
            "Geographic CRS detected (lat/lon), processing resolution will be read as degrees; reproject to a metric CRS"
        ),
        CrsUnits::OtherLinear => {
            warn!("Projected CRS with non-meter units detected, processing resolution is not in cm/px")
        }
        CrsUnits::Unknown => warn!("Unknown CRS type, assuming meter units"),
    }
    units
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_wkt_is_unknown() {
        assert_eq!(detect_crs_units(""), CrsUnits::Unknown);
        assert!(!CrsUnits::Unknown.is_metric());
    }

    #[test]
    fn test_utm_is_metric() {
        let utm = SpatialRef::from_epsg(32633).unwrap().to_wkt().unwrap();
        assert_eq!(detect_crs_units(&utm), CrsUnits::Meters);
    }

    #[test]
    fn test_wgs84_is_geographic() {
        let wgs84 = SpatialRef::from_epsg(4326).unwrap().to_wkt().unwrap();
        assert_eq!(check_metric_crs(&wgs84), CrsUnits::Degrees);
    }
}
