use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::location::GeoPoint;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Assigned,
    PickedUp,
    InTransit,
    Nearby,
    Arriving,
    Delivered,
    Cancelled,
}

impl DeliveryStatus {
    pub const ALL: [DeliveryStatus; 8] = [
        DeliveryStatus::Pending,
        DeliveryStatus::Assigned,
        DeliveryStatus::PickedUp,
        DeliveryStatus::InTransit,
        DeliveryStatus::Nearby,
        DeliveryStatus::Arriving,
        DeliveryStatus::Delivered,
        DeliveryStatus::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Assigned => "assigned",
            DeliveryStatus::PickedUp => "picked_up",
            DeliveryStatus::InTransit => "in_transit",
            DeliveryStatus::Nearby => "nearby",
            DeliveryStatus::Arriving => "arriving",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, DeliveryStatus::Delivered | DeliveryStatus::Cancelled)
    }

    /// A driver is out on this delivery and its location reports are tracked.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            DeliveryStatus::Assigned
                | DeliveryStatus::PickedUp
                | DeliveryStatus::InTransit
                | DeliveryStatus::Nearby
                | DeliveryStatus::Arriving
        )
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        DeliveryStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == raw)
            .ok_or_else(|| format!("unknown delivery status: {raw}"))
    }
}

/// Serialized flat, with coordinates as `pickup_lat`/`pickup_lon` and
/// `dropoff_lat`/`dropoff_lon` and the ETA as `estimated_time`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "DeliveryRecord", into = "DeliveryRecord")]
pub struct Delivery {
    pub id: String,
    pub driver_id: String,
    pub customer_id: String,
    pub pickup: GeoPoint,
    pub dropoff: GeoPoint,
    pub status: DeliveryStatus,
    pub estimated_arrival: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct DeliveryRecord {
    id: String,
    driver_id: String,
    customer_id: String,
    pickup_lat: f64,
    pickup_lon: f64,
    dropoff_lat: f64,
    dropoff_lon: f64,
    status: DeliveryStatus,
    estimated_time: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<DeliveryRecord> for Delivery {
    fn from(record: DeliveryRecord) -> Self {
        Self {
            id: record.id,
            driver_id: record.driver_id,
            customer_id: record.customer_id,
            pickup: GeoPoint {
                lat: record.pickup_lat,
                lon: record.pickup_lon,
            },
            dropoff: GeoPoint {
                lat: record.dropoff_lat,
                lon: record.dropoff_lon,
            },
            status: record.status,
            estimated_arrival: record.estimated_time,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

impl From<Delivery> for DeliveryRecord {
    fn from(delivery: Delivery) -> Self {
        Self {
            id: delivery.id,
            driver_id: delivery.driver_id,
            customer_id: delivery.customer_id,
            pickup_lat: delivery.pickup.lat,
            pickup_lon: delivery.pickup.lon,
            dropoff_lat: delivery.dropoff.lat,
            dropoff_lon: delivery.dropoff.lon,
            status: delivery.status,
            estimated_time: delivery.estimated_arrival,
            created_at: delivery.created_at,
            updated_at: delivery.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::{Delivery, DeliveryStatus};
    use crate::models::location::GeoPoint;

    #[test]
    fn status_strings_round_trip_through_from_str() {
        for status in DeliveryStatus::ALL {
            assert_eq!(status.as_str().parse::<DeliveryStatus>(), Ok(status));
        }
        assert!("lost".parse::<DeliveryStatus>().is_err());
    }

    #[test]
    fn delivery_json_uses_flat_coordinates() {
        let now = Utc::now();
        let delivery = Delivery {
            id: "d-1".to_string(),
            driver_id: "driver-1".to_string(),
            customer_id: "customer-1".to_string(),
            pickup: GeoPoint {
                lat: 40.05,
                lon: -74.05,
            },
            dropoff: GeoPoint {
                lat: 40.0005,
                lon: -74.0,
            },
            status: DeliveryStatus::InTransit,
            estimated_arrival: Some(now),
            created_at: now,
            updated_at: now,
        };

        let json = serde_json::to_value(&delivery).unwrap();
        assert_eq!(json["pickup_lat"], 40.05);
        assert_eq!(json["dropoff_lon"], -74.0);
        assert_eq!(json["status"], "in_transit");
        assert!(json.get("pickup").is_none());
        assert!(json["estimated_time"].is_string());

        let back: Delivery = serde_json::from_value(json).unwrap();
        assert_eq!(back.dropoff, delivery.dropoff);
    }

    #[test]
    fn serde_uses_snake_case_names() {
        let json = serde_json::to_string(&DeliveryStatus::PickedUp).unwrap();
        assert_eq!(json, "\"picked_up\"");
    }

    #[test]
    fn only_en_route_statuses_are_active() {
        let active: Vec<_> = DeliveryStatus::ALL
            .into_iter()
            .filter(|status| status.is_active())
            .collect();

        assert_eq!(
            active,
            vec![
                DeliveryStatus::Assigned,
                DeliveryStatus::PickedUp,
                DeliveryStatus::InTransit,
                DeliveryStatus::Nearby,
                DeliveryStatus::Arriving,
            ]
        );
        assert!(DeliveryStatus::Delivered.is_terminal());
        assert!(DeliveryStatus::Cancelled.is_terminal());
        assert!(!DeliveryStatus::Pending.is_terminal());
    }
}
