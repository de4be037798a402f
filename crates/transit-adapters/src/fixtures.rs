//! Fixture-backed sources. Each file holds payloads in the live wire format so
//! the same parsers run offline.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use transit_core::{CoordinateCandidate, RawStationObservation};

use crate::{
    parse_molit_response, parse_seoul_response, pick_best_result, AdapterError, DetailSource,
    GeocodeSource, NameSource, NominatimResult,
};

pub const NAMES_FILE: &str = "seoul_names.json";
pub const DETAILS_FILE: &str = "molit_details.json";
pub const GEOCODER_FILE: &str = "nominatim_search.json";

#[derive(Debug, Clone)]
pub struct FixtureNameSource {
    rows: Vec<RawStationObservation>,
}

impl FixtureNameSource {
    pub fn new(rows: Vec<RawStationObservation>) -> Self {
        Self { rows }
    }
}

#[async_trait]
impl NameSource for FixtureNameSource {
    fn source_id(&self) -> &'static str {
        "seoul-metro-fixture"
    }

    fn is_configured(&self) -> bool {
        true
    }

    async fn list_names(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<RawStationObservation>, AdapterError> {
        Ok(self.rows.iter().skip(offset).take(limit).cloned().collect())
    }
}

/// Detail payloads keyed by the station name they answer.
#[derive(Debug, Clone, Default)]
pub struct FixtureDetailSource {
    by_name: BTreeMap<String, Vec<RawStationObservation>>,
}

impl FixtureDetailSource {
    pub fn new(by_name: BTreeMap<String, Vec<RawStationObservation>>) -> Self {
        Self { by_name }
    }
}

#[async_trait]
impl DetailSource for FixtureDetailSource {
    fn source_id(&self) -> &'static str {
        "molit-fixture"
    }

    fn is_configured(&self) -> bool {
        true
    }

    async fn lookup_by_name(&self, name: &str) -> Result<Vec<RawStationObservation>, AdapterError> {
        Ok(self.by_name.get(name).cloned().unwrap_or_default())
    }
}

/// Geocoder answers keyed by lower-cased query text.
#[derive(Debug, Clone, Default)]
pub struct FixtureGeocoder {
    by_query: BTreeMap<String, Option<CoordinateCandidate>>,
}

impl FixtureGeocoder {
    pub fn new(by_query: BTreeMap<String, Option<CoordinateCandidate>>) -> Self {
        Self {
            by_query: by_query
                .into_iter()
                .map(|(k, v)| (k.trim().to_lowercase(), v))
                .collect(),
        }
    }
}

#[async_trait]
impl GeocodeSource for FixtureGeocoder {
    fn source_id(&self) -> &'static str {
        "nominatim-fixture"
    }

    fn is_configured(&self) -> bool {
        true
    }

    async fn search(&self, query: &str) -> Result<Option<CoordinateCandidate>, AdapterError> {
        Ok(self
            .by_query
            .get(&query.trim().to_lowercase())
            .copied()
            .flatten())
    }
}

pub struct FixtureSources {
    pub names: Arc<FixtureNameSource>,
    pub details: Arc<FixtureDetailSource>,
    pub geocoder: Arc<FixtureGeocoder>,
}

/// Loads all three fixture sources from `dir`. Missing detail or geocoder
/// files give empty sources; the names file is required.
pub fn load_fixture_sources(dir: impl AsRef<Path>) -> Result<FixtureSources> {
    let dir = dir.as_ref();

    let names_body: JsonValue = read_json_file(dir.join(NAMES_FILE))?;
    let rows = parse_seoul_response(&names_body)
        .with_context(|| format!("parsing {}", dir.join(NAMES_FILE).display()))?;

    let mut details = BTreeMap::new();
    let details_path = dir.join(DETAILS_FILE);
    if details_path.exists() {
        let payloads: BTreeMap<String, JsonValue> = read_json_file(&details_path)?;
        for (name, payload) in payloads {
            let parsed = parse_molit_response(&payload)
                .with_context(|| format!("parsing {} entry {name}", details_path.display()))?;
            details.insert(name, parsed);
        }
    }

    let mut geocoded = BTreeMap::new();
    let geocoder_path = dir.join(GEOCODER_FILE);
    if geocoder_path.exists() {
        let payloads: BTreeMap<String, Vec<NominatimResult>> = read_json_file(&geocoder_path)?;
        for (query, results) in payloads {
            geocoded.insert(query, pick_best_result(&results));
        }
    }

    Ok(FixtureSources {
        names: Arc::new(FixtureNameSource::new(rows)),
        details: Arc::new(FixtureDetailSource::new(details)),
        geocoder: Arc::new(FixtureGeocoder::new(geocoded)),
    })
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}
