use serde_json::json;

use super::location_evidence;
use super::params::SimultaneousLocationsParams;
use crate::geolocation::distance_km;
use crate::models::Session;

/// Flag playback from two distant places at once
///
/// Only other sessions that are currently playing count; paused and stopped
/// sessions are ignored.
pub fn check(
    session: &Session,
    pool: &[&Session],
    params: &SimultaneousLocationsParams,
) -> Option<serde_json::Value> {
    let current = session.location();
    if !current.is_known() {
        return None;
    }

    let conflicts: Vec<(&Session, f64)> = pool
        .iter()
        .filter(|other| other.is_playing())
        .filter_map(|other| {
            distance_km(&other.location(), &current)
                .filter(|d| *d > params.min_distance_km)
                .map(|d| (*other, d))
        })
        .collect();

    if conflicts.is_empty() {
        return None;
    }

    let max_distance = conflicts.iter().map(|(_, d)| *d).fold(0.0_f64, f64::max);

    Some(json!({
        "currentLocation": location_evidence(session),
        "conflictingSessions": conflicts
            .iter()
            .map(|(other, distance)| json!({
                "sessionId": other.id,
                "location": location_evidence(other),
                "distance": (distance * 10.0).round() / 10.0,
            }))
            .collect::<Vec<_>>(),
        "maxDistance": (max_distance * 10.0).round() / 10.0,
        "minDistanceKm": params.min_distance_km,
    }))
}
