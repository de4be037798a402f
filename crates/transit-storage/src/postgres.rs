//! Postgres-backed station store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::info;
use transit_core::{has_valid_coordinates, NewStation, PersistedStation, SourceTag};

use crate::store::{StationStore, StoreError};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations");

const STATION_COLUMNS: &str = "id, name, line_label, latitude, longitude, address, region, city, \
     data_source, has_coordinates, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PgStationStore {
    pool: PgPool,
}

impl PgStationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        info!("station migrations applied");
        Ok(())
    }
}

fn station_from_row(row: &PgRow) -> Result<PersistedStation, StoreError> {
    let data_source: String = row.try_get("data_source")?;
    let data_source = SourceTag::parse(&data_source)
        .ok_or_else(|| StoreError::InvalidRow(format!("unknown data_source {data_source}")))?;
    let created_at: DateTime<Utc> = row.try_get("created_at")?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at")?;
    Ok(PersistedStation {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        line_label: row.try_get("line_label")?,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
        address: row.try_get("address")?,
        region: row.try_get("region")?,
        city: row.try_get("city")?,
        data_source,
        has_coordinates: row.try_get("has_coordinates")?,
        created_at,
        updated_at,
    })
}

fn sql_offset(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[async_trait]
impl StationStore for PgStationStore {
    async fn find_by_canonical_name(
        &self,
        canonical_name: &str,
    ) -> Result<Vec<PersistedStation>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {STATION_COLUMNS} FROM stations WHERE name = $1 ORDER BY id"
        ))
        .bind(canonical_name)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(station_from_row).collect()
    }

    async fn find_missing_coordinates(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<PersistedStation>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {STATION_COLUMNS} FROM stations WHERE has_coordinates = FALSE \
             ORDER BY id OFFSET $1 LIMIT $2"
        ))
        .bind(sql_offset(offset))
        .bind(sql_offset(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(station_from_row).collect()
    }

    async fn count_missing_coordinates(&self) -> Result<usize, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM stations WHERE has_coordinates = FALSE")
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n.max(0) as usize)
    }

    async fn count_all(&self) -> Result<usize, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM stations")
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n.max(0) as usize)
    }

    async fn find_page(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<PersistedStation>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {STATION_COLUMNS} FROM stations ORDER BY id OFFSET $1 LIMIT $2"
        ))
        .bind(sql_offset(offset))
        .bind(sql_offset(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(station_from_row).collect()
    }

    async fn insert(&self, station: NewStation) -> Result<PersistedStation, StoreError> {
        let has_coordinates = station.has_coordinates();
        let row = sqlx::query(&format!(
            "INSERT INTO stations \
             (name, line_label, latitude, longitude, address, region, city, data_source, has_coordinates) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             RETURNING {STATION_COLUMNS}"
        ))
        .bind(&station.name)
        .bind(&station.line_label)
        .bind(station.latitude)
        .bind(station.longitude)
        .bind(&station.address)
        .bind(&station.region)
        .bind(&station.city)
        .bind(station.data_source.as_str())
        .bind(has_coordinates)
        .fetch_one(&self.pool)
        .await?;
        station_from_row(&row)
    }

    async fn update(&self, station: &PersistedStation) -> Result<PersistedStation, StoreError> {
        let has_coordinates = has_valid_coordinates(station.latitude, station.longitude);
        let row = sqlx::query(&format!(
            "UPDATE stations SET name = $2, line_label = $3, latitude = $4, longitude = $5, \
             address = $6, region = $7, city = $8, data_source = $9, has_coordinates = $10, \
             updated_at = NOW() WHERE id = $1 RETURNING {STATION_COLUMNS}"
        ))
        .bind(station.id)
        .bind(&station.name)
        .bind(&station.line_label)
        .bind(station.latitude)
        .bind(station.longitude)
        .bind(&station.address)
        .bind(&station.region)
        .bind(&station.city)
        .bind(station.data_source.as_str())
        .bind(has_coordinates)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound(station.id))?;
        station_from_row(&row)
    }

    async fn update_coordinates(
        &self,
        id: i64,
        latitude: f64,
        longitude: f64,
    ) -> Result<PersistedStation, StoreError> {
        let has_coordinates = has_valid_coordinates(Some(latitude), Some(longitude));
        let row = sqlx::query(&format!(
            "UPDATE stations SET latitude = $2, longitude = $3, has_coordinates = $4, \
             updated_at = NOW() WHERE id = $1 RETURNING {STATION_COLUMNS}"
        ))
        .bind(id)
        .bind(latitude)
        .bind(longitude)
        .bind(has_coordinates)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound(id))?;
        station_from_row(&row)
    }
}
