use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::info;

use crate::models::delivery::{Delivery, DeliveryStatus};
use crate::models::location::{DriverLocation, GeoPoint};
use crate::storage::{Storage, StorageError};

const SCHEMA: [&str; 8] = [
    "CREATE TABLE IF NOT EXISTS deliveries (
        id TEXT PRIMARY KEY,
        driver_id TEXT NOT NULL,
        customer_id TEXT NOT NULL,
        pickup_lat REAL NOT NULL,
        pickup_lon REAL NOT NULL,
        dropoff_lat REAL NOT NULL,
        dropoff_lon REAL NOT NULL,
        status TEXT NOT NULL,
        estimated_time DATETIME,
        created_at DATETIME NOT NULL,
        updated_at DATETIME NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS driver_locations (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        driver_id TEXT NOT NULL,
        delivery_id TEXT,
        lat REAL NOT NULL,
        lon REAL NOT NULL,
        altitude REAL,
        speed REAL,
        bearing REAL,
        accuracy REAL,
        timestamp DATETIME NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_driver_locations_driver ON driver_locations(driver_id)",
    "CREATE INDEX IF NOT EXISTS idx_driver_locations_delivery ON driver_locations(delivery_id)",
    "CREATE INDEX IF NOT EXISTS idx_driver_locations_timestamp ON driver_locations(timestamp)",
    "CREATE INDEX IF NOT EXISTS idx_deliveries_driver ON deliveries(driver_id)",
    "CREATE INDEX IF NOT EXISTS idx_deliveries_customer ON deliveries(customer_id)",
    "CREATE INDEX IF NOT EXISTS idx_deliveries_status ON deliveries(status)",
];

#[derive(Debug, sqlx::FromRow)]
struct DeliveryRow {
    id: String,
    driver_id: String,
    customer_id: String,
    pickup_lat: f64,
    pickup_lon: f64,
    dropoff_lat: f64,
    dropoff_lon: f64,
    status: String,
    estimated_time: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<DeliveryRow> for Delivery {
    type Error = StorageError;

    fn try_from(row: DeliveryRow) -> Result<Self, Self::Error> {
        let status = DeliveryStatus::from_str(&row.status)
            .map_err(|err| StorageError::Corrupt(format!("delivery {}: {err}", row.id)))?;

        Ok(Delivery {
            id: row.id,
            driver_id: row.driver_id,
            customer_id: row.customer_id,
            pickup: GeoPoint {
                lat: row.pickup_lat,
                lon: row.pickup_lon,
            },
            dropoff: GeoPoint {
                lat: row.dropoff_lat,
                lon: row.dropoff_lon,
            },
            status,
            estimated_arrival: row.estimated_time,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// SQLite-backed storage. The schema is created on connect.
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let storage = Self { pool };
        storage.migrate().await?;
        info!(database_url, "storage ready");
        Ok(storage)
    }

    /// A private database that lives as long as the returned value.
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        // every pooled connection to :memory: would get its own database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let storage = Self { pool };
        storage.migrate().await?;
        Ok(storage)
    }

    async fn migrate(&self) -> Result<(), StorageError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Number of stored location reports for a driver.
    pub async fn location_count(&self, driver_id: &str) -> Result<i64, StorageError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM driver_locations WHERE driver_id = ?")
                .bind(driver_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn load_active_deliveries(&self) -> Result<Vec<Delivery>, StorageError> {
        let rows: Vec<DeliveryRow> = sqlx::query_as(
            "SELECT id, driver_id, customer_id, pickup_lat, pickup_lon,
                    dropoff_lat, dropoff_lon, status, estimated_time, created_at, updated_at
             FROM deliveries
             WHERE status NOT IN ('delivered', 'cancelled')",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Delivery::try_from).collect()
    }

    async fn save_raw_location(&self, location: &DriverLocation) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO driver_locations
             (driver_id, delivery_id, lat, lon, altitude, speed, bearing, accuracy, timestamp)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&location.driver_id)
        .bind(location.delivery_id.as_deref())
        .bind(location.location.lat)
        .bind(location.location.lon)
        .bind(location.location.altitude)
        .bind(location.location.speed)
        .bind(location.location.bearing)
        .bind(location.location.accuracy)
        .bind(location.location.timestamp)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn persist_status(
        &self,
        delivery_id: &str,
        status: DeliveryStatus,
        updated_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let result = sqlx::query("UPDATE deliveries SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(updated_at)
            .bind(delivery_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(delivery_id.to_string()));
        }
        Ok(())
    }

    async fn insert_delivery(&self, delivery: &Delivery) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO deliveries
             (id, driver_id, customer_id, pickup_lat, pickup_lon, dropoff_lat, dropoff_lon,
              status, estimated_time, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&delivery.id)
        .bind(&delivery.driver_id)
        .bind(&delivery.customer_id)
        .bind(delivery.pickup.lat)
        .bind(delivery.pickup.lon)
        .bind(delivery.dropoff.lat)
        .bind(delivery.dropoff.lon)
        .bind(delivery.status.as_str())
        .bind(delivery.estimated_arrival)
        .bind(delivery.created_at)
        .bind(delivery.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|err| match StorageError::from(err) {
            StorageError::Duplicate(_) => StorageError::Duplicate(delivery.id.clone()),
            other => other,
        })?;

        Ok(())
    }
}
