use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::engine::{eta, proximity};
use crate::error::AppError;
use crate::geo::haversine_km;
use crate::hub::{Frame, Hub};
use crate::models::delivery::{Delivery, DeliveryStatus};
use crate::models::event::{Envelope, EtaUpdate, MessageType, ProximityAlert, StatusChangeEvent};
use crate::models::location::DriverLocation;
use crate::observability::metrics::Metrics;
use crate::storage::{Storage, StorageError};

#[derive(Default)]
struct TrackerState {
    deliveries: HashMap<String, Delivery>,
    last_locations: HashMap<String, DriverLocation>,
}

/// In-memory delivery state plus the location pipeline that turns driver
/// reports into ETA, proximity and status events for delivery watchers.
pub struct Tracker {
    storage: Arc<dyn Storage>,
    hub: Arc<Hub>,
    state: RwLock<TrackerState>,
    metrics: Metrics,
}

impl Tracker {
    pub fn new(storage: Arc<dyn Storage>, hub: Arc<Hub>, metrics: Metrics) -> Self {
        Self {
            storage,
            hub,
            state: RwLock::new(TrackerState::default()),
            metrics,
        }
    }

    /// Pulls every non-terminal delivery from storage into memory.
    pub async fn load_active_deliveries(&self) -> Result<usize, StorageError> {
        let deliveries = self.storage.load_active_deliveries().await?;
        let count = deliveries.len();

        let mut state = self.state.write().await;
        for delivery in deliveries {
            state.deliveries.insert(delivery.id.clone(), delivery);
        }

        info!(count, "active deliveries loaded");
        Ok(count)
    }

    pub async fn track_delivery(&self, delivery: Delivery) {
        self.state
            .write()
            .await
            .deliveries
            .insert(delivery.id.clone(), delivery);
    }

    pub async fn delivery(&self, delivery_id: &str) -> Option<Delivery> {
        self.state.read().await.deliveries.get(delivery_id).cloned()
    }

    pub async fn deliveries(&self) -> Vec<Delivery> {
        let mut deliveries: Vec<Delivery> =
            self.state.read().await.deliveries.values().cloned().collect();
        deliveries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        deliveries
    }

    pub async fn last_location(&self, driver_id: &str) -> Option<DriverLocation> {
        self.state.read().await.last_locations.get(driver_id).cloned()
    }

    /// The delivery this driver is currently out on. Should more than one
    /// qualify, the most recently updated wins.
    pub async fn active_delivery_for_driver(&self, driver_id: &str) -> Option<Delivery> {
        self.state
            .read()
            .await
            .deliveries
            .values()
            .filter(|delivery| delivery.driver_id == driver_id && delivery.status.is_active())
            .max_by_key(|delivery| delivery.updated_at)
            .cloned()
    }

    pub async fn process_location_update(&self, report: DriverLocation) {
        self.state
            .write()
            .await
            .last_locations
            .insert(report.driver_id.clone(), report.clone());

        if let Err(err) = self.storage.save_raw_location(&report).await {
            error!(driver_id = %report.driver_id, error = %err, "failed to save driver location");
            self.metrics
                .persistence_errors_total
                .with_label_values(&["save_location"])
                .inc();
        }

        let Some(delivery) = self.active_delivery_for_driver(&report.driver_id).await else {
            debug!(driver_id = %report.driver_id, "no active delivery for driver");
            self.metrics
                .location_updates_total
                .with_label_values(&["untracked"])
                .inc();
            return;
        };
        self.metrics
            .location_updates_total
            .with_label_values(&["tracked"])
            .inc();

        let distance_km = haversine_km(&report.location.point(), &delivery.dropoff);
        let eta = eta::estimate(&delivery.id, distance_km, report.location.speed, Utc::now());
        self.record_eta(&delivery.id, &eta).await;

        if let Some(outcome) = proximity::evaluate(distance_km * 1000.0, delivery.status) {
            let alert = ProximityAlert {
                delivery_id: delivery.id.clone(),
                driver_id: report.driver_id.clone(),
                distance_m: distance_km * 1000.0,
                alert_level: outcome.level,
                message: outcome.message,
            };
            self.broadcast(&delivery.id, MessageType::ProximityAlert, &alert)
                .await;

            if let Some(new_status) = outcome.new_status {
                let applied = self
                    .apply_status(&delivery.id, Some(delivery.status), new_status)
                    .await;
                if let Err(AppError::Conflict(reason)) = applied {
                    debug!(delivery_id = %delivery.id, %reason, "proximity status change skipped");
                }
            }
        }

        self.broadcast(&delivery.id, MessageType::LocationUpdate, &report)
            .await;
        self.broadcast(&delivery.id, MessageType::EtaUpdate, &eta)
            .await;
    }

    /// Moves a delivery to `new_status`, persists it and tells its watchers.
    ///
    /// Deliveries already `delivered` or `cancelled` are left as they are. The
    /// in-memory change stands even if persisting fails; in that case no
    /// `status_change` event is sent and memory and storage disagree until the
    /// next successful write.
    pub async fn update_delivery_status(
        &self,
        delivery_id: &str,
        new_status: DeliveryStatus,
    ) -> Result<StatusChangeEvent, AppError> {
        self.apply_status(delivery_id, None, new_status).await
    }

    /// `expected` makes the write a compare-and-set against the status the
    /// caller decided on.
    async fn apply_status(
        &self,
        delivery_id: &str,
        expected: Option<DeliveryStatus>,
        new_status: DeliveryStatus,
    ) -> Result<StatusChangeEvent, AppError> {
        let (old_status, updated_at) = {
            let mut state = self.state.write().await;
            let delivery = state
                .deliveries
                .get_mut(delivery_id)
                .ok_or_else(|| AppError::NotFound(format!("delivery {delivery_id} not found")))?;

            let old_status = delivery.status;
            if old_status.is_terminal() {
                return Err(AppError::Conflict(format!(
                    "delivery {delivery_id} is already {old_status}"
                )));
            }
            if let Some(expected) = expected.filter(|expected| *expected != old_status) {
                return Err(AppError::Conflict(format!(
                    "delivery {delivery_id} moved from {expected} to {old_status}"
                )));
            }

            delivery.status = new_status;
            delivery.updated_at = Utc::now();
            (old_status, delivery.updated_at)
        };

        if let Err(err) = self
            .storage
            .persist_status(delivery_id, new_status, updated_at)
            .await
        {
            error!(
                delivery_id,
                status = %new_status,
                error = %err,
                "failed to persist delivery status"
            );
            self.metrics
                .persistence_errors_total
                .with_label_values(&["persist_status"])
                .inc();
            return Err(AppError::Internal(format!(
                "status of delivery {delivery_id} could not be persisted"
            )));
        }

        info!(delivery_id, from = %old_status, to = %new_status, "delivery status changed");
        self.metrics
            .status_transitions_total
            .with_label_values(&[new_status.as_str()])
            .inc();

        let event = StatusChangeEvent {
            delivery_id: delivery_id.to_string(),
            old_status,
            new_status,
            message: format!("Delivery status changed to {new_status}"),
        };
        self.broadcast(delivery_id, MessageType::StatusChange, &event)
            .await;

        Ok(event)
    }

    async fn record_eta(&self, delivery_id: &str, eta: &EtaUpdate) {
        if let Some(delivery) = self.state.write().await.deliveries.get_mut(delivery_id) {
            delivery.estimated_arrival = Some(eta.estimated_arrival);
        }
    }

    async fn broadcast<T: Serialize>(&self, delivery_id: &str, kind: MessageType, payload: &T) {
        match Envelope::encode(kind, payload) {
            Ok(text) => {
                self.hub
                    .send_to_watchers(delivery_id, Frame::from(text))
                    .await;
            }
            Err(err) => {
                warn!(delivery_id, kind = ?kind, error = %err, "failed to encode event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use serde_json::Value;
    use tokio::sync::mpsc::{self, error::TryRecvError};

    use super::Tracker;
    use crate::error::AppError;
    use crate::hub::{Frame, Hub, Role, Session};
    use crate::models::delivery::{Delivery, DeliveryStatus};
    use crate::models::location::{DriverLocation, GeoPoint, Location};
    use crate::observability::metrics::Metrics;
    use crate::storage::MemoryStorage;

    const DROPOFF: GeoPoint = GeoPoint {
        lat: 40.0005,
        lon: -74.0,
    };

    fn delivery(id: &str, driver_id: &str, status: DeliveryStatus) -> Delivery {
        Delivery {
            id: id.to_string(),
            driver_id: driver_id.to_string(),
            customer_id: "customer-1".to_string(),
            pickup: GeoPoint { lat: 40.05, lon: -74.05 },
            dropoff: DROPOFF,
            status,
            estimated_arrival: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn report(driver_id: &str, lat: f64, lon: f64, speed: f64) -> DriverLocation {
        DriverLocation {
            driver_id: driver_id.to_string(),
            delivery_id: Some("d-1".to_string()),
            location: Location {
                lat,
                lon,
                altitude: 0.0,
                speed,
                bearing: 0.0,
                accuracy: 5.0,
                timestamp: Utc::now(),
            },
        }
    }

    struct Fixture {
        tracker: Tracker,
        storage: Arc<MemoryStorage>,
        watcher: mpsc::Receiver<Frame>,
    }

    async fn fixture(status: DeliveryStatus) -> Fixture {
        let storage = Arc::new(MemoryStorage::with_deliveries([delivery(
            "d-1", "driver-1", status,
        )]));
        let hub = Arc::new(Hub::new(Metrics::new()));
        let (session, watcher) =
            Session::new("customer-1", Role::Customer, Some("d-1".to_string()), 64);
        hub.register(session).await;

        let tracker = Tracker::new(storage.clone(), hub, Metrics::new());
        tracker.load_active_deliveries().await.unwrap();

        Fixture {
            tracker,
            storage,
            watcher,
        }
    }

    fn drain(rx: &mut mpsc::Receiver<Frame>) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(serde_json::from_str(&frame).unwrap());
        }
        frames
    }

    fn types(frames: &[Value]) -> Vec<&str> {
        frames.iter().map(|f| f["type"].as_str().unwrap()).collect()
    }

    #[tokio::test]
    async fn driver_at_dropoff_is_delivered() {
        let mut fx = fixture(DeliveryStatus::InTransit).await;

        fx.tracker
            .process_location_update(report("driver-1", DROPOFF.lat, DROPOFF.lon, 20.0))
            .await;

        let frames = drain(&mut fx.watcher);
        assert_eq!(
            types(&frames),
            vec!["proximity_alert", "status_change", "location_update", "eta_update"]
        );
        assert_eq!(frames[0]["data"]["alert_level"], "arrived");
        assert_eq!(frames[1]["data"]["old_status"], "in_transit");
        assert_eq!(frames[1]["data"]["new_status"], "delivered");

        let stored = fx.storage.delivery("d-1").unwrap();
        assert_eq!(stored.status, DeliveryStatus::Delivered);
        assert_eq!(
            fx.tracker.delivery("d-1").await.unwrap().status,
            DeliveryStatus::Delivered
        );
    }

    #[tokio::test]
    async fn fifty_six_meters_out_is_arriving_with_zero_minute_eta() {
        let mut fx = fixture(DeliveryStatus::InTransit).await;

        fx.tracker
            .process_location_update(report("driver-1", 40.0, -74.0, 20.0))
            .await;

        let frames = drain(&mut fx.watcher);
        assert_eq!(
            types(&frames),
            vec!["proximity_alert", "status_change", "location_update", "eta_update"]
        );
        assert_eq!(frames[0]["data"]["alert_level"], "arriving");
        assert_eq!(frames[1]["data"]["new_status"], "arriving");

        let eta = &frames[3]["data"];
        assert_eq!(eta["duration_minutes"], 0);
        assert!((eta["distance_km"].as_f64().unwrap() - 0.0556).abs() < 0.001);
    }

    #[tokio::test]
    async fn arriving_delivery_does_not_fall_back_to_nearby() {
        let mut fx = fixture(DeliveryStatus::InTransit).await;

        // ~78 m out
        fx.tracker
            .process_location_update(report("driver-1", 39.9998, -74.0, 20.0))
            .await;
        // ~300 m out
        fx.tracker
            .process_location_update(report("driver-1", 39.9978, -74.0, 20.0))
            .await;

        assert_eq!(
            fx.tracker.delivery("d-1").await.unwrap().status,
            DeliveryStatus::Arriving
        );

        let frames = drain(&mut fx.watcher);
        let status_changes: Vec<_> = frames
            .iter()
            .filter(|f| f["type"] == "status_change")
            .collect();
        assert_eq!(status_changes.len(), 1);

        let alerts: Vec<_> = frames
            .iter()
            .filter(|f| f["type"] == "proximity_alert")
            .map(|f| f["data"]["alert_level"].as_str().unwrap())
            .collect();
        assert_eq!(alerts, vec!["arriving", "nearby"]);
    }

    #[tokio::test]
    async fn far_away_driver_only_gets_location_and_eta() {
        let mut fx = fixture(DeliveryStatus::PickedUp).await;

        // ~10 km south, crawling
        fx.tracker
            .process_location_update(report("driver-1", 39.91, -74.0, 2.0))
            .await;

        let frames = drain(&mut fx.watcher);
        assert_eq!(types(&frames), vec!["location_update", "eta_update"]);
        // 10 km at the 40 km/h floor, not 2 km/h
        assert_eq!(frames[1]["data"]["duration_minutes"], 15);
        assert_eq!(
            fx.tracker.delivery("d-1").await.unwrap().status,
            DeliveryStatus::PickedUp
        );
        assert!(
            fx.tracker
                .delivery("d-1")
                .await
                .unwrap()
                .estimated_arrival
                .is_some()
        );
    }

    #[tokio::test]
    async fn unrelated_driver_produces_no_events() {
        let mut fx = fixture(DeliveryStatus::InTransit).await;

        fx.tracker
            .process_location_update(report("driver-2", DROPOFF.lat, DROPOFF.lon, 20.0))
            .await;

        assert_eq!(fx.watcher.try_recv(), Err(TryRecvError::Empty));
        assert_eq!(
            fx.tracker.delivery("d-1").await.unwrap().status,
            DeliveryStatus::InTransit
        );
        assert_eq!(fx.storage.locations_for("driver-2").len(), 1);
        assert!(fx.tracker.last_location("driver-2").await.is_some());
    }

    #[tokio::test]
    async fn cancelled_delivery_is_left_alone() {
        let storage = Arc::new(MemoryStorage::new());
        let hub = Arc::new(Hub::new(Metrics::new()));
        let (session, mut watcher) =
            Session::new("customer-1", Role::Customer, Some("d-1".to_string()), 64);
        hub.register(session).await;
        let tracker = Tracker::new(storage, hub, Metrics::new());
        tracker
            .track_delivery(delivery("d-1", "driver-1", DeliveryStatus::Cancelled))
            .await;

        tracker
            .process_location_update(report("driver-1", DROPOFF.lat, DROPOFF.lon, 20.0))
            .await;

        assert_eq!(watcher.try_recv(), Err(TryRecvError::Empty));
        assert_eq!(
            tracker.delivery("d-1").await.unwrap().status,
            DeliveryStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn failed_status_write_keeps_memory_and_skips_broadcast() {
        let mut fx = fixture(DeliveryStatus::InTransit).await;
        fx.storage.set_failing(true);

        fx.tracker
            .process_location_update(report("driver-1", DROPOFF.lat, DROPOFF.lon, 20.0))
            .await;

        let frames = drain(&mut fx.watcher);
        assert_eq!(
            types(&frames),
            vec!["proximity_alert", "location_update", "eta_update"]
        );
        assert_eq!(
            fx.tracker.delivery("d-1").await.unwrap().status,
            DeliveryStatus::Delivered
        );
        assert_eq!(
            fx.storage.delivery("d-1").unwrap().status,
            DeliveryStatus::InTransit
        );
    }

    #[tokio::test]
    async fn loaded_delivery_waits_for_its_driver() {
        let mut fx = fixture(DeliveryStatus::InTransit).await;

        assert!(fx.tracker.last_location("driver-1").await.is_none());
        assert_eq!(fx.watcher.try_recv(), Err(TryRecvError::Empty));

        fx.tracker
            .process_location_update(report("driver-1", 40.1, -74.0, 30.0))
            .await;

        assert_eq!(
            types(&drain(&mut fx.watcher)),
            vec!["location_update", "eta_update"]
        );
        assert_eq!(fx.storage.locations_for("driver-1").len(), 1);
    }

    #[tokio::test]
    async fn unknown_delivery_status_update_is_not_found() {
        let fx = fixture(DeliveryStatus::InTransit).await;
        let result = fx
            .tracker
            .update_delivery_status("missing", DeliveryStatus::Delivered)
            .await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn terminal_delivery_cannot_be_revived() {
        let mut fx = fixture(DeliveryStatus::InTransit).await;
        fx.tracker
            .update_delivery_status("d-1", DeliveryStatus::Cancelled)
            .await
            .unwrap();
        drain(&mut fx.watcher);

        let result = fx
            .tracker
            .update_delivery_status("d-1", DeliveryStatus::Pending)
            .await;

        assert!(matches!(result, Err(AppError::Conflict(_))));
        assert_eq!(
            fx.tracker.delivery("d-1").await.unwrap().status,
            DeliveryStatus::Cancelled
        );
        assert_eq!(
            fx.storage.delivery("d-1").unwrap().status,
            DeliveryStatus::Cancelled
        );
        assert_eq!(fx.watcher.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test]
    async fn proximity_change_decided_on_a_stale_status_is_dropped() {
        let mut fx = fixture(DeliveryStatus::InTransit).await;

        // cancelled after the pipeline read in_transit
        fx.tracker
            .update_delivery_status("d-1", DeliveryStatus::Cancelled)
            .await
            .unwrap();
        drain(&mut fx.watcher);

        let result = fx
            .tracker
            .apply_status("d-1", Some(DeliveryStatus::InTransit), DeliveryStatus::Delivered)
            .await;

        assert!(matches!(result, Err(AppError::Conflict(_))));
        assert_eq!(
            fx.tracker.delivery("d-1").await.unwrap().status,
            DeliveryStatus::Cancelled
        );
        assert_eq!(fx.watcher.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test]
    async fn late_nearby_decision_does_not_undo_arriving() {
        let mut fx = fixture(DeliveryStatus::InTransit).await;

        // ~78 m out moves the delivery to arriving
        fx.tracker
            .process_location_update(report("driver-1", 39.9998, -74.0, 20.0))
            .await;
        drain(&mut fx.watcher);

        let result = fx
            .tracker
            .apply_status("d-1", Some(DeliveryStatus::InTransit), DeliveryStatus::Nearby)
            .await;

        assert!(matches!(result, Err(AppError::Conflict(_))));
        assert_eq!(
            fx.tracker.delivery("d-1").await.unwrap().status,
            DeliveryStatus::Arriving
        );
        assert_eq!(fx.watcher.try_recv(), Err(TryRecvError::Empty));
    }
}
