use chrono::{DateTime, Duration, Utc};

use crate::models::event::EtaUpdate;

/// Reported speeds below this (km/h) are treated as standing still.
pub const MIN_REPORTED_SPEED_KMH: f64 = 5.0;
pub const DEFAULT_SPEED_KMH: f64 = 40.0;

pub fn effective_speed(reported_kmh: f64) -> f64 {
    if reported_kmh.is_finite() && reported_kmh >= MIN_REPORTED_SPEED_KMH {
        reported_kmh
    } else {
        DEFAULT_SPEED_KMH
    }
}

/// Travel time to cover `distance_km`, truncated to whole minutes.
pub fn duration_minutes(distance_km: f64, reported_kmh: f64) -> i64 {
    let hours = distance_km / effective_speed(reported_kmh);
    (hours * 60.0) as i64
}

pub fn estimate(
    delivery_id: &str,
    distance_km: f64,
    reported_kmh: f64,
    now: DateTime<Utc>,
) -> EtaUpdate {
    let minutes = duration_minutes(distance_km, reported_kmh);

    EtaUpdate {
        delivery_id: delivery_id.to_string(),
        estimated_arrival: now + Duration::minutes(minutes),
        distance_km,
        duration_minutes: minutes,
    }
}
