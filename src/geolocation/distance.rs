//! Great-circle distance and travel speed checks

use serde::{Deserialize, Serialize};

const EARTH_RADIUS_KM: f64 = 6371.0;
const MS_PER_HOUR: f64 = 3_600_000.0;

/// Geographic coordinates for an IP location
///
/// Either coordinate may be missing when the address could not be located
/// (private ranges, unknown addresses).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl GeoLocation {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        GeoLocation {
            latitude: Some(latitude),
            longitude: Some(longitude),
        }
    }

    pub fn unknown() -> Self {
        GeoLocation::default()
    }

    /// Both coordinates, if known
    pub fn coordinates(&self) -> Option<(f64, f64)> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) => Some((lat, lon)),
            _ => None,
        }
    }

    pub fn is_known(&self) -> bool {
        self.coordinates().is_some()
    }
}

/// Calculate the great-circle distance between two points using the Haversine formula
///
/// Returns distance in kilometers, or `None` when either point lacks a coordinate.
pub fn distance_km(a: &GeoLocation, b: &GeoLocation) -> Option<f64> {
    let (lat1, lon1) = a.coordinates()?;
    let (lat2, lon2) = b.coordinates()?;

    if lat1 == lat2 && lon1 == lon2 {
        return Some(0.0);
    }

    let lat1_rad = lat1.to_radians();
    let lat2_rad = lat2.to_radians();
    let delta_lat = (lat2 - lat1).to_radians();
    let delta_lon = (lon2 - lon1).to_radians();

    let h = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lon / 2.0).sin().powi(2);
    // Rounding can push h a hair past 1.0 for antipodal points
    let c = 2.0 * h.min(1.0).sqrt().asin();

    Some(EARTH_RADIUS_KM * c)
}

/// Speed in km/h needed to cover `distance` in `elapsed_ms`
///
/// Returns `None` for non-positive elapsed time.
pub fn speed_kmh(distance: f64, elapsed_ms: i64) -> Option<f64> {
    if elapsed_ms <= 0 {
        return None;
    }
    Some(distance / (elapsed_ms as f64 / MS_PER_HOUR))
}

/// Check whether moving between two locations in `elapsed_ms` is physically implausible
///
/// Missing coordinates never count as impossible. A nonzero distance with no
/// elapsed time (or a negative one) is teleportation and always counts.
pub fn is_impossible_travel(
    a: &GeoLocation,
    b: &GeoLocation,
    elapsed_ms: i64,
    max_speed_kmh: f64,
) -> bool {
    let distance = match distance_km(a, b) {
        Some(d) => d,
        None => return false,
    };

    if distance <= 0.0 {
        return false;
    }

    match speed_kmh(distance, elapsed_ms) {
        Some(speed) => speed > max_speed_kmh,
        None => true,
    }
}
