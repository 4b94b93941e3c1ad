use serde_json::json;

use super::params::ImpossibleTravelParams;
use super::location_evidence;
use crate::geolocation::{distance_km, is_impossible_travel, speed_kmh};
use crate::models::Session;

/// Check the session against every other located session of the account
///
/// Elapsed time is measured between the two start times, in either order.
/// The first implausible pair is reported.
pub fn check(
    session: &Session,
    pool: &[&Session],
    params: &ImpossibleTravelParams,
) -> Option<serde_json::Value> {
    let current = session.location();
    if !current.is_known() {
        return None;
    }

    for other in pool {
        let previous = other.location();
        let distance = match distance_km(&previous, &current) {
            Some(d) => d,
            None => continue,
        };

        let elapsed_ms = (session.started_at - other.started_at).num_milliseconds().abs();

        if is_impossible_travel(&previous, &current, elapsed_ms, params.max_speed_kmh) {
            return Some(json!({
                "previousSessionId": other.id,
                "previousLocation": location_evidence(other),
                "currentLocation": location_evidence(session),
                "distance": round1(distance),
                "timeDiffHours": elapsed_ms as f64 / 3_600_000.0,
                "calculatedSpeed": speed_kmh(distance, elapsed_ms).map(round1),
                "maxAllowedSpeed": params.max_speed_kmh,
            }));
        }
    }

    None
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::session::fixtures::{located, session, t0};
    use chrono::Duration;

    fn params(max: f64) -> ImpossibleTravelParams {
        ImpossibleTravelParams {
            max_speed_kmh: max,
            ignore_private_ips: false,
        }
    }

    #[test]
    fn test_nyc_to_london_two_hours() {
        let nyc = located("alice", "k1", 40.7128, -74.0060, t0());
        let london = located("alice", "k2", 51.5074, -0.1278, t0() + Duration::hours(2));

        let data = check(&london, &[&nyc], &params(500.0)).expect("should violate");
        assert!(data["calculatedSpeed"].as_f64().unwrap() > 500.0);
        assert_eq!(data["previousSessionId"], nyc.id.to_string());
        assert!((data["timeDiffHours"].as_f64().unwrap() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_nyc_to_london_eight_hours_by_plane() {
        let nyc = located("alice", "k1", 40.7128, -74.0060, t0());
        let london = located("alice", "k2", 51.5074, -0.1278, t0() + Duration::hours(8));
        assert!(check(&london, &[&nyc], &params(900.0)).is_none());
    }

    #[test]
    fn test_simultaneous_start_is_teleportation() {
        let nyc = located("alice", "k1", 40.7128, -74.0060, t0());
        let london = located("alice", "k2", 51.5074, -0.1278, t0());

        let data = check(&london, &[&nyc], &params(500.0)).expect("should violate");
        assert!(data["calculatedSpeed"].is_null());
    }

    #[test]
    fn test_same_place_never_violates() {
        let a = located("alice", "k1", 40.7128, -74.0060, t0());
        let b = located("alice", "k2", 40.7128, -74.0060, t0());
        assert!(check(&b, &[&a], &params(1.0)).is_none());
    }

    #[test]
    fn test_missing_coordinates_skipped() {
        let nyc = located("alice", "k1", 40.7128, -74.0060, t0());
        let unknown = session("alice", "k2", "8.8.8.8", t0());

        assert!(check(&unknown, &[&nyc], &params(1.0)).is_none());
        assert!(check(&nyc, &[&unknown], &params(1.0)).is_none());
    }

    #[test]
    fn test_later_session_in_pool_uses_absolute_gap() {
        let nyc = located("alice", "k1", 40.7128, -74.0060, t0());
        let london = located("alice", "k2", 51.5074, -0.1278, t0() + Duration::hours(20));
        // Evaluating the older session against a newer one 20h later is plausible
        assert!(check(&nyc, &[&london], &params(500.0)).is_none());
    }
}
