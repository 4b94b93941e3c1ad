use serde_json::json;

use super::params::ConcurrentStreamsParams;
use crate::models::Session;

/// Count playing streams for the account
///
/// The session under evaluation always counts as one stream, even before it
/// reports itself as playing.
pub fn check(
    session: &Session,
    pool: &[&Session],
    params: &ConcurrentStreamsParams,
) -> Option<serde_json::Value> {
    let others: Vec<&Session> = pool.iter().copied().filter(|s| s.is_playing()).collect();
    let total = others.len() + 1;

    if total <= params.max_streams {
        return None;
    }

    Some(json!({
        "activeStreamCount": total,
        "maxStreams": params.max_streams,
        "sessionIds": others
            .iter()
            .map(|s| s.id)
            .chain(std::iter::once(session.id))
            .collect::<Vec<_>>(),
    }))
}
