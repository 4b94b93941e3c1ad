use serde_json::json;

use super::params::{GeoMode, GeoRestrictionParams};
use crate::models::Session;

/// Match the session's country against the rule's list
///
/// An unknown country, or an empty list, never violates.
pub fn check(session: &Session, params: &GeoRestrictionParams) -> Option<serde_json::Value> {
    let country = session.geo.country.as_deref()?;
    if params.countries.is_empty() {
        return None;
    }

    let listed = params.countries.iter().any(|c| c == country);
    let violates = match params.mode {
        GeoMode::Blocklist => listed,
        GeoMode::Allowlist => !listed,
    };

    if !violates {
        return None;
    }

    Some(json!({
        "country": country,
        "mode": params.mode,
        "countries": params.countries,
        "ipAddress": session.ip_address,
    }))
}
