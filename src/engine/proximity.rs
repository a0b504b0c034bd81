use crate::models::delivery::DeliveryStatus;
use crate::models::event::AlertLevel;

pub const ARRIVED_RADIUS_M: f64 = 50.0;
pub const ARRIVING_RADIUS_M: f64 = 100.0;
pub const NEARBY_RADIUS_M: f64 = 500.0;

#[derive(Debug, Clone, PartialEq)]
pub struct ProximityOutcome {
    pub level: AlertLevel,
    pub message: String,
    /// Status the delivery should move to, if any.
    pub new_status: Option<DeliveryStatus>,
}

/// Classifies a driver's distance to the dropoff, nearest band first.
///
/// Status only ever moves forward along nearby → arriving → delivered: a
/// delivery already `arriving` is never pulled back to `nearby`.
pub fn evaluate(distance_m: f64, current: DeliveryStatus) -> Option<ProximityOutcome> {
    if distance_m <= ARRIVED_RADIUS_M {
        return Some(ProximityOutcome {
            level: AlertLevel::Arrived,
            message: "Driver has arrived at your location".to_string(),
            new_status: Some(DeliveryStatus::Delivered),
        });
    }

    if distance_m <= ARRIVING_RADIUS_M {
        return Some(ProximityOutcome {
            level: AlertLevel::Arriving,
            message: format!("Driver is arriving ({distance_m:.0}m away)"),
            new_status: (current != DeliveryStatus::Arriving).then_some(DeliveryStatus::Arriving),
        });
    }

    if distance_m <= NEARBY_RADIUS_M {
        let already_close = matches!(current, DeliveryStatus::Nearby | DeliveryStatus::Arriving);
        return Some(ProximityOutcome {
            level: AlertLevel::Nearby,
            message: format!("Driver is nearby ({distance_m:.0}m away)"),
            new_status: (!already_close).then_some(DeliveryStatus::Nearby),
        });
    }

    None
}
