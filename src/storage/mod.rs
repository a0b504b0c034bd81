//! Persistence for deliveries and raw driver location reports.
//!
//! The tracker keeps its own in-memory view of every delivery; a [`Storage`]
//! implementation is the durable mirror of that view plus an append-only log
//! of location reports.

mod error;
mod memory;
mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use error::StorageError;
pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

use crate::models::delivery::{Delivery, DeliveryStatus};
use crate::models::location::DriverLocation;

#[async_trait]
pub trait Storage: Send + Sync + 'static {
    /// Every delivery that is neither delivered nor cancelled.
    async fn load_active_deliveries(&self) -> Result<Vec<Delivery>, StorageError>;

    /// Appends one raw report to the location log.
    async fn save_raw_location(&self, location: &DriverLocation) -> Result<(), StorageError>;

    /// Overwrites the stored status of a delivery.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if no delivery with that id is stored.
    async fn persist_status(
        &self,
        delivery_id: &str,
        status: DeliveryStatus,
        updated_at: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    /// Stores a new delivery record.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Duplicate` if the id is already taken.
    async fn insert_delivery(&self, delivery: &Delivery) -> Result<(), StorageError>;
}
