//! OpenStreetMap Nominatim geocoder.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::debug;
use transit_core::{is_coordinate_valid, CoordinateCandidate, SourceClass, SourceTag};
use transit_storage::HttpFetcher;

use crate::{AdapterError, GeocodeSource};

const RESULT_LIMIT: &str = "10";
const COUNTRY_CODES: &str = "kr";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NominatimResult {
    pub lat: String,
    pub lon: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default, alias = "category")]
    pub class: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub importance: Option<f64>,
    #[serde(default)]
    pub extratags: Option<BTreeMap<String, JsonValue>>,
}

impl NominatimResult {
    fn looks_like_station(&self) -> bool {
        let name = self.display_name.to_lowercase();
        let rail_class = matches!(self.class.as_deref(), Some("railway" | "public_transport"))
            || matches!(self.kind.as_deref(), Some("station" | "subway_entrance" | "halt"));
        let rail_tags = self.extratags.as_ref().is_some_and(|tags| {
            tags.contains_key("railway") || tags.contains_key("subway")
        });
        rail_class
            || rail_tags
            || name.contains("subway")
            || name.contains("station")
            || name.contains("metro")
            || name.contains("지하철")
    }

    fn mentions_station_suffix(&self) -> bool {
        self.display_name.contains('역')
    }

    fn candidate(&self) -> Option<CoordinateCandidate> {
        let lat = self.lat.trim().parse::<f64>().ok()?;
        let lon = self.lon.trim().parse::<f64>().ok()?;
        is_coordinate_valid(lat, lon).then(|| CoordinateCandidate::new(lat, lon, SourceTag::Geocoder))
    }
}

/// Picks the first valid coordinate from, in order: rail/subway results,
/// results whose name carries the 역 suffix, then any result at all.
pub fn pick_best_result(results: &[NominatimResult]) -> Option<CoordinateCandidate> {
    let tiers: [(&str, fn(&NominatimResult) -> bool); 3] = [
        ("station", NominatimResult::looks_like_station),
        ("station_suffix", NominatimResult::mentions_station_suffix),
        ("any", |_| true),
    ];
    tiers.into_iter().find_map(|(tier, accepts)| {
        let picked = results
            .iter()
            .filter(|r| accepts(r))
            .find_map(NominatimResult::candidate)?;
        debug!(tier, results = results.len(), "picked geocoder result");
        Some(picked)
    })
}

pub struct NominatimGeocoder {
    http: Arc<HttpFetcher>,
    base_url: String,
}

impl NominatimGeocoder {
    pub fn new(http: Arc<HttpFetcher>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn search_url(&self, query: &str) -> Result<Url, AdapterError> {
        Url::parse_with_params(
            &format!("{}/search", self.base_url),
            &[
                ("q", query),
                ("format", "json"),
                ("limit", RESULT_LIMIT),
                ("countrycodes", COUNTRY_CODES),
                ("addressdetails", "1"),
                ("extratags", "1"),
            ],
        )
        .map_err(|err| AdapterError::Message(format!("building Nominatim url: {err}")))
    }
}

#[async_trait]
impl GeocodeSource for NominatimGeocoder {
    fn source_id(&self) -> &'static str {
        "nominatim"
    }

    fn is_configured(&self) -> bool {
        !self.base_url.is_empty()
    }

    async fn search(&self, query: &str) -> Result<Option<CoordinateCandidate>, AdapterError> {
        if !self.is_configured() {
            return Ok(None);
        }
        let url = self.search_url(query)?.to_string();
        let results: Vec<NominatimResult> = self
            .http
            .fetch_json(SourceClass::Geocoder, &url, &url)
            .await?;
        Ok(pick_best_result(&results))
    }
}
