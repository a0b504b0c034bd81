use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::delivery::DeliveryStatus;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    LocationUpdate,
    StatusChange,
    EtaUpdate,
    ProximityAlert,
    DeliveryAssigned,
    DeliveryCompleted,
}

/// Every frame exchanged over a session, in both directions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Envelope {
    pub fn new<T: Serialize>(kind: MessageType, payload: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            kind,
            timestamp: Utc::now(),
            data: serde_json::to_value(payload)?,
        })
    }

    /// Wraps `payload` and serializes the whole envelope to a text frame.
    pub fn encode<T: Serialize>(
        kind: MessageType,
        payload: &T,
    ) -> Result<String, serde_json::Error> {
        serde_json::to_string(&Self::new(kind, payload)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EtaUpdate {
    pub delivery_id: String,
    pub estimated_arrival: DateTime<Utc>,
    pub distance_km: f64,
    pub duration_minutes: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Nearby,
    Arriving,
    Arrived,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProximityAlert {
    pub delivery_id: String,
    pub driver_id: String,
    pub distance_m: f64,
    pub alert_level: AlertLevel,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusChangeEvent {
    pub delivery_id: String,
    pub old_status: DeliveryStatus,
    pub new_status: DeliveryStatus,
    pub message: String,
}
