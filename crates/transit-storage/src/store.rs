//! Station persistence contract and the in-memory implementation.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::Mutex;
use transit_core::{NewStation, PersistedStation};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("station {0} not found")]
    NotFound(i64),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("invalid row: {0}")]
    InvalidRow(String),
}

/// Everything the pipeline needs from a station store.
///
/// Implementations recompute `has_coordinates` on every write.
#[async_trait]
pub trait StationStore: Send + Sync {
    /// Rows whose name equals `canonical_name`, one per line label.
    async fn find_by_canonical_name(
        &self,
        canonical_name: &str,
    ) -> Result<Vec<PersistedStation>, StoreError>;

    /// Rows without a valid coordinate, ordered by id.
    async fn find_missing_coordinates(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<PersistedStation>, StoreError>;

    async fn count_missing_coordinates(&self) -> Result<usize, StoreError>;

    async fn count_all(&self) -> Result<usize, StoreError>;

    async fn find_page(&self, offset: usize, limit: usize)
        -> Result<Vec<PersistedStation>, StoreError>;

    async fn insert(&self, station: NewStation) -> Result<PersistedStation, StoreError>;

    async fn update(&self, station: &PersistedStation) -> Result<PersistedStation, StoreError>;

    async fn update_coordinates(
        &self,
        id: i64,
        latitude: f64,
        longitude: f64,
    ) -> Result<PersistedStation, StoreError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: i64,
    rows: BTreeMap<i64, PersistedStation>,
}

/// `BTreeMap`-backed store used by tests and fixture runs.
#[derive(Debug, Default)]
pub struct MemoryStationStore {
    state: Mutex<MemoryState>,
}

impl MemoryStationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> Vec<PersistedStation> {
        self.state.lock().await.rows.values().cloned().collect()
    }

    pub async fn get(&self, id: i64) -> Option<PersistedStation> {
        self.state.lock().await.rows.get(&id).cloned()
    }
}

#[async_trait]
impl StationStore for MemoryStationStore {
    async fn find_by_canonical_name(
        &self,
        canonical_name: &str,
    ) -> Result<Vec<PersistedStation>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .rows
            .values()
            .filter(|row| row.name == canonical_name)
            .cloned()
            .collect())
    }

    async fn find_missing_coordinates(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<PersistedStation>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .rows
            .values()
            .filter(|row| !row.has_coordinates)
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn count_missing_coordinates(&self) -> Result<usize, StoreError> {
        let state = self.state.lock().await;
        Ok(state.rows.values().filter(|row| !row.has_coordinates).count())
    }

    async fn count_all(&self) -> Result<usize, StoreError> {
        Ok(self.state.lock().await.rows.len())
    }

    async fn find_page(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<PersistedStation>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .rows
            .values()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn insert(&self, station: NewStation) -> Result<PersistedStation, StoreError> {
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let row = PersistedStation::from_new(state.next_id, station, Utc::now());
        state.rows.insert(row.id, row.clone());
        Ok(row)
    }

    async fn update(&self, station: &PersistedStation) -> Result<PersistedStation, StoreError> {
        let mut state = self.state.lock().await;
        let row = state
            .rows
            .get_mut(&station.id)
            .ok_or(StoreError::NotFound(station.id))?;
        let created_at = row.created_at;
        *row = station.clone();
        row.created_at = created_at;
        row.updated_at = Utc::now();
        row.refresh_has_coordinates();
        Ok(row.clone())
    }

    async fn update_coordinates(
        &self,
        id: i64,
        latitude: f64,
        longitude: f64,
    ) -> Result<PersistedStation, StoreError> {
        let mut state = self.state.lock().await;
        let row = state.rows.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        row.latitude = Some(latitude);
        row.longitude = Some(longitude);
        row.updated_at = Utc::now();
        row.refresh_has_coordinates();
        Ok(row.clone())
    }
}
