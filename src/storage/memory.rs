use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::models::delivery::{Delivery, DeliveryStatus};
use crate::models::location::DriverLocation;
use crate::storage::{Storage, StorageError};

/// Process-local storage. Writes can be made to fail on demand, which lets
/// callers observe how the tracker degrades when persistence is down.
#[derive(Default)]
pub struct MemoryStorage {
    deliveries: DashMap<String, Delivery>,
    locations: DashMap<String, Vec<DriverLocation>>,
    failing: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deliveries(deliveries: impl IntoIterator<Item = Delivery>) -> Self {
        let storage = Self::new();
        for delivery in deliveries {
            storage.deliveries.insert(delivery.id.clone(), delivery);
        }
        storage
    }

    /// While set, every write returns `StorageError::Database`.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn delivery(&self, id: &str) -> Option<Delivery> {
        self.deliveries.get(id).map(|entry| entry.value().clone())
    }

    pub fn locations_for(&self, driver_id: &str) -> Vec<DriverLocation> {
        self.locations
            .get(driver_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    fn check_writable(&self) -> Result<(), StorageError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::Database("storage unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn load_active_deliveries(&self) -> Result<Vec<Delivery>, StorageError> {
        Ok(self
            .deliveries
            .iter()
            .filter(|entry| !entry.value().status.is_terminal())
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn save_raw_location(&self, location: &DriverLocation) -> Result<(), StorageError> {
        self.check_writable()?;
        self.locations
            .entry(location.driver_id.clone())
            .or_default()
            .push(location.clone());
        Ok(())
    }

    async fn persist_status(
        &self,
        delivery_id: &str,
        status: DeliveryStatus,
        updated_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.check_writable()?;
        let mut delivery = self
            .deliveries
            .get_mut(delivery_id)
            .ok_or_else(|| StorageError::NotFound(delivery_id.to_string()))?;

        delivery.status = status;
        delivery.updated_at = updated_at;
        Ok(())
    }

    async fn insert_delivery(&self, delivery: &Delivery) -> Result<(), StorageError> {
        self.check_writable()?;
        match self.deliveries.entry(delivery.id.clone()) {
            Entry::Occupied(_) => Err(StorageError::Duplicate(delivery.id.clone())),
            Entry::Vacant(slot) => {
                slot.insert(delivery.clone());
                Ok(())
            }
        }
    }
}
