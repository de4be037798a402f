//! Source contracts for the three station registries, their HTTP clients and
//! fixture-backed stand-ins.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;
use transit_core::{CoordinateCandidate, RawStationObservation};
use transit_storage::FetchError;

pub mod fixtures;
pub mod molit;
pub mod nominatim;
pub mod seoul;

pub use fixtures::{load_fixture_sources, FixtureDetailSource, FixtureGeocoder, FixtureNameSource, FixtureSources};
pub use molit::{parse_molit_response, MolitDetailClient};
pub use nominatim::{pick_best_result, NominatimGeocoder, NominatimResult};
pub use seoul::{parse_seoul_response, SeoulMetroNameClient};

pub const CRATE_NAME: &str = "transit-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed {source_id} payload: {detail}")]
    Malformed {
        source_id: &'static str,
        detail: String,
    },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Municipal registry that lists every station name, page by page.
#[async_trait]
pub trait NameSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    fn is_configured(&self) -> bool;

    /// A page shorter than `limit` means there is nothing after it.
    async fn list_names(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<RawStationObservation>, AdapterError>;
}

/// National registry with per-line detail for a station name.
#[async_trait]
pub trait DetailSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    fn is_configured(&self) -> bool;

    async fn lookup_by_name(&self, name: &str) -> Result<Vec<RawStationObservation>, AdapterError>;
}

#[async_trait]
pub trait GeocodeSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    fn is_configured(&self) -> bool;

    async fn search(&self, query: &str) -> Result<Option<CoordinateCandidate>, AdapterError>;
}

/// Reads a numeric field that may arrive as a string or a number.
/// Blank, unparseable, non-finite and zero values are treated as absent.
pub fn parse_numeric(value: Option<&JsonValue>) -> Option<f64> {
    let parsed = match value? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    (parsed.is_finite() && parsed != 0.0).then_some(parsed)
}

/// Reads a string field, returning `None` when it is missing or blank.
pub fn parse_text(value: Option<&JsonValue>) -> Option<String> {
    let text = match value? {
        JsonValue::String(s) => s.trim().to_string(),
        JsonValue::Number(n) => n.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}
