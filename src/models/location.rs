use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

/// A single coordinate report as captured by the driver's device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lon: f64,
    #[serde(default)]
    pub altitude: f64,
    /// km/h
    #[serde(default)]
    pub speed: f64,
    #[serde(default)]
    pub bearing: f64,
    #[serde(default)]
    pub accuracy: f64,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Location {
    pub fn point(&self) -> GeoPoint {
        GeoPoint {
            lat: self.lat,
            lon: self.lon,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverLocation {
    pub driver_id: String,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub delivery_id: Option<String>,
    pub location: Location,
}

fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.filter(|value| !value.is_empty()))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::DriverLocation;

    #[test]
    fn optional_fields_default_when_absent() {
        let parsed: DriverLocation = serde_json::from_value(json!({
            "driver_id": "driver-1",
            "location": { "lat": 40.0, "lon": -74.0, "timestamp": "2024-05-01T12:00:00Z" }
        }))
        .unwrap();

        assert_eq!(parsed.delivery_id, None);
        assert_eq!(parsed.location.speed, 0.0);
        assert_eq!(parsed.location.accuracy, 0.0);
    }

    #[test]
    fn empty_delivery_id_is_treated_as_absent() {
        let parsed: DriverLocation = serde_json::from_value(json!({
            "driver_id": "driver-1",
            "delivery_id": "",
            "location": { "lat": 40.0, "lon": -74.0, "speed": 12.5 }
        }))
        .unwrap();

        assert_eq!(parsed.delivery_id, None);
        assert_eq!(parsed.location.speed, 12.5);
    }
}
