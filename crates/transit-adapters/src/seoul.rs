//! Seoul Metro station-name registry.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use transit_core::{RawStationObservation, SourceClass, SourceTag};
use tracing::debug;
use transit_storage::HttpFetcher;

use crate::{parse_numeric, parse_text, AdapterError, NameSource};

const SERVICE: &str = "SearchInfoBySubwayNameService";
const NO_DATA_CODE: &str = "INFO-200";

pub struct SeoulMetroNameClient {
    http: Arc<HttpFetcher>,
    base_url: String,
    api_key: Option<String>,
}

impl SeoulMetroNameClient {
    pub fn new(http: Arc<HttpFetcher>, base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
        }
    }

    /// Indices are 1-based and inclusive on this API.
    fn page_path(offset: usize, limit: usize) -> String {
        let start = offset + 1;
        let end = offset + limit.max(1);
        format!("json/{SERVICE}/{start}/{end}/")
    }
}

#[async_trait]
impl NameSource for SeoulMetroNameClient {
    fn source_id(&self) -> &'static str {
        "seoul-metro"
    }

    fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    async fn list_names(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<RawStationObservation>, AdapterError> {
        let Some(key) = &self.api_key else {
            return Ok(Vec::new());
        };
        let path = Self::page_path(offset, limit);
        let url = format!("{}/{key}/{path}", self.base_url);
        let log_url = format!("{}/<key>/{path}", self.base_url);
        let body: JsonValue = self
            .http
            .fetch_json(SourceClass::NameRegistry, &url, &log_url)
            .await?;
        parse_seoul_response(&body)
    }
}

/// Extracts observations from a `SearchInfoBySubwayNameService` payload.
///
/// The "no data" result code yields an empty page rather than an error.
pub fn parse_seoul_response(body: &JsonValue) -> Result<Vec<RawStationObservation>, AdapterError> {
    let Some(service) = body.get(SERVICE) else {
        let code = body
            .pointer("/RESULT/CODE")
            .and_then(JsonValue::as_str)
            .unwrap_or_default();
        if code == NO_DATA_CODE {
            return Ok(Vec::new());
        }
        let message = body
            .pointer("/RESULT/MESSAGE")
            .and_then(JsonValue::as_str)
            .unwrap_or("missing service envelope");
        return Err(AdapterError::Malformed {
            source_id: "seoul-metro",
            detail: format!("{code} {message}").trim().to_string(),
        });
    };

    let Some(rows) = service.get("row").and_then(JsonValue::as_array) else {
        return Ok(Vec::new());
    };

    Ok(rows.iter().filter_map(observation_from_row).collect())
}

fn observation_from_row(row: &JsonValue) -> Option<RawStationObservation> {
    let Some(name) = parse_text(row.get("STATION_NM")) else {
        debug!(source = "seoul-metro", "skipping row without a station name");
        return None;
    };
    let line = parse_text(row.get("LINE_NUM")).unwrap_or_default();
    let mut observation = RawStationObservation::new(name, line, SourceTag::NameRegistry);
    if let Some(code) = parse_text(row.get("STATION_CD")) {
        observation = observation.with_station_id(code);
    }
    if let (Some(lat), Some(lon)) = (
        parse_numeric(row.get("YPOINT_WGS")),
        parse_numeric(row.get("XPOINT_WGS")),
    ) {
        observation = observation.with_coordinate(lat, lon);
    }
    if let Some(address) = parse_text(row.get("ADRES")) {
        observation = observation.with_address(address);
    }
    Some(observation)
}
