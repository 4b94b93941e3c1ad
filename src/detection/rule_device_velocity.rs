use chrono::Duration;
use serde_json::json;
use std::collections::BTreeSet;

use super::params::DeviceVelocityParams;
use crate::models::Session;

/// Count distinct network origins (or devices) in the trailing window
///
/// The window ends at the session's own start and includes the session itself.
pub fn check(
    session: &Session,
    pool: &[&Session],
    params: &DeviceVelocityParams,
) -> Option<serde_json::Value> {
    let window_start = Duration::try_milliseconds((params.window_hours * 3_600_000.0) as i64)
        .and_then(|window| session.started_at.checked_sub_signed(window))?;

    let key = |s: &Session| -> Option<String> {
        let value = if params.group_by_device {
            s.device.device_id.clone()
        } else {
            Some(s.ip_address.clone())
        };
        value.filter(|v| !v.is_empty())
    };

    let mut unique: BTreeSet<String> = pool
        .iter()
        .copied()
        .filter(|s| s.started_at >= window_start && s.started_at <= session.started_at)
        .filter_map(key)
        .collect();
    unique.extend(key(session));

    if unique.len() <= params.max_ips {
        return None;
    }

    let values: Vec<String> = unique.into_iter().collect();
    let data = if params.group_by_device {
        json!({
            "uniqueDeviceCount": values.len(),
            "deviceIds": values,
            "maxIps": params.max_ips,
            "windowHours": params.window_hours,
        })
    } else {
        json!({
            "uniqueIpCount": values.len(),
            "ips": values,
            "maxIps": params.max_ips,
            "windowHours": params.window_hours,
        })
    };
    Some(data)
}
