//! Coordinate validation, clustering and geocoder fallback.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use transit_adapters::GeocodeSource;
use transit_core::{
    is_coordinate_valid, Coordinate, CoordinateCandidate, CoordinateStatistics, SourceClass,
    SourceTag, StationInfo,
};
use transit_storage::RateLimiter;

use crate::error::{guard_call, SyncError};
use crate::names::{is_same_station_group, NameResolver};

pub const GEOCODER_CONFIDENCE: u8 = 70;
pub const MANUAL_CONFIDENCE: u8 = 90;
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
pub const DEFAULT_CACHE_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "source", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultSource {
    Resolved(SourceTag),
    NoData,
    InvalidData,
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CoordinateResult {
    pub coordinate: Option<Coordinate>,
    pub source: ResultSource,
    pub confidence: u8,
}

impl CoordinateResult {
    pub fn resolved(coordinate: Coordinate, source: SourceTag, confidence: u8) -> Self {
        Self {
            coordinate: Some(coordinate),
            source: ResultSource::Resolved(source),
            confidence: confidence.min(100),
        }
    }

    fn unresolved(source: ResultSource) -> Self {
        Self {
            coordinate: None,
            source,
            confidence: 0,
        }
    }

    pub fn no_data() -> Self {
        Self::unresolved(ResultSource::NoData)
    }

    pub fn invalid_data() -> Self {
        Self::unresolved(ResultSource::InvalidData)
    }

    pub fn not_found() -> Self {
        Self::unresolved(ResultSource::NotFound)
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self.source, ResultSource::Resolved(_)) && self.coordinate.is_some()
    }

    pub fn source_tag(&self) -> Option<SourceTag> {
        match self.source {
            ResultSource::Resolved(tag) => Some(tag),
            _ => None,
        }
    }
}

/// Greedy single-pass clustering: the first unclustered candidate seeds a
/// cluster that absorbs every remaining candidate within transfer distance of
/// the seed. Clusters and their members keep input order.
pub fn cluster_candidates(candidates: &[CoordinateCandidate]) -> Vec<Vec<CoordinateCandidate>> {
    let mut remaining: Vec<CoordinateCandidate> = candidates.to_vec();
    let mut clusters = Vec::new();
    while !remaining.is_empty() {
        let seed = remaining.remove(0);
        let (members, rest): (Vec<_>, Vec<_>) = remaining.into_iter().partition(|c| {
            is_same_station_group(
                seed.coordinate.latitude,
                seed.coordinate.longitude,
                c.coordinate.latitude,
                c.coordinate.longitude,
            )
        });
        let mut cluster = Vec::with_capacity(members.len() + 1);
        cluster.push(seed);
        cluster.extend(members);
        clusters.push(cluster);
        remaining = rest;
    }
    clusters
}

fn priority_sum(cluster: &[CoordinateCandidate]) -> u32 {
    cluster.iter().map(CoordinateCandidate::priority).sum()
}

/// Picks one representative coordinate for a station group.
pub fn determine_group_coordinate(candidates: &[CoordinateCandidate]) -> CoordinateResult {
    if candidates.is_empty() {
        return CoordinateResult::no_data();
    }

    let valid: Vec<CoordinateCandidate> = candidates
        .iter()
        .copied()
        .filter(|c| c.coordinate.is_valid())
        .collect();
    if valid.is_empty() {
        return CoordinateResult::invalid_data();
    }

    let clusters = cluster_candidates(&valid);

    // Strict comparisons keep the first-seen cluster and candidate on ties.
    let mut primary = &clusters[0];
    for cluster in &clusters[1..] {
        if priority_sum(cluster) > priority_sum(primary) {
            primary = cluster;
        }
    }
    let mut representative = primary[0];
    for candidate in &primary[1..] {
        if candidate.priority() > representative.priority() {
            representative = *candidate;
        }
    }

    let size_bonus = (10 * primary.len() as u32).min(30);
    let agreement_bonus = if clusters.len() == 1 { 20 } else { 0 };
    let confidence = (50 + size_bonus + agreement_bonus + representative.priority()).min(100);

    CoordinateResult::resolved(
        representative.coordinate,
        representative.source,
        confidence as u8,
    )
}

pub fn coordinate_statistics<'a, I, S>(stations: I) -> CoordinateStatistics
where
    I: IntoIterator<Item = &'a S>,
    S: StationInfo + 'a,
{
    CoordinateStatistics::collect(stations)
}

#[derive(Debug, Clone, Copy)]
pub struct CacheSettings {
    pub ttl: Duration,
    pub capacity: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_CACHE_TTL,
            capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    result: CoordinateResult,
    inserted_at: Instant,
}

/// Resolves coordinates that no registry supplied, through the rate-limited
/// geocoder, with a short-lived cache in front of it.
pub struct CoordinateReconciler {
    geocoder: Arc<dyn GeocodeSource>,
    limiter: Arc<RateLimiter>,
    resolver: Arc<NameResolver>,
    cache: Mutex<HashMap<String, CacheEntry>>,
    cache_settings: CacheSettings,
    call_timeout: Duration,
}

impl CoordinateReconciler {
    pub fn new(
        geocoder: Arc<dyn GeocodeSource>,
        limiter: Arc<RateLimiter>,
        resolver: Arc<NameResolver>,
        cache_settings: CacheSettings,
        call_timeout: Duration,
    ) -> Self {
        Self {
            geocoder,
            limiter,
            resolver,
            cache: Mutex::new(HashMap::new()),
            cache_settings,
            call_timeout,
        }
    }

    pub fn determine_group_coordinate(&self, candidates: &[CoordinateCandidate]) -> CoordinateResult {
        determine_group_coordinate(candidates)
    }

    fn cache_key(clean_name: &str, region: &str) -> String {
        format!("{clean_name}_{region}")
    }

    fn geocoder_query(clean_name: &str, region: &str) -> String {
        format!("{clean_name} station {region}").trim().to_string()
    }

    /// The full query, then the bare name when the first finds nothing.
    fn geocoder_queries(clean_name: &str, region: &str) -> Vec<String> {
        let full = Self::geocoder_query(clean_name, region);
        if clean_name.is_empty() || full == clean_name {
            vec![full]
        } else {
            vec![full, clean_name.to_string()]
        }
    }

    async fn cached(&self, key: &str) -> Option<CoordinateResult> {
        let mut cache = self.cache.lock().await;
        match cache.get(key) {
            Some(entry) if entry.inserted_at.elapsed() < self.cache_settings.ttl => Some(entry.result),
            Some(_) => {
                cache.remove(key);
                None
            }
            None => None,
        }
    }

    async fn remember(&self, key: String, result: CoordinateResult) {
        let capacity = self.cache_settings.capacity.max(1);
        let ttl = self.cache_settings.ttl;
        let mut cache = self.cache.lock().await;
        if !cache.contains_key(&key) && cache.len() >= capacity {
            cache.retain(|_, entry| entry.inserted_at.elapsed() < ttl);
            if cache.len() >= capacity {
                let oldest = cache
                    .iter()
                    .min_by_key(|(_, entry)| entry.inserted_at)
                    .map(|(k, _)| k.clone());
                if let Some(oldest) = oldest {
                    cache.remove(&oldest);
                }
            }
        }
        cache.insert(
            key,
            CacheEntry {
                result,
                inserted_at: Instant::now(),
            },
        );
    }

    pub async fn cache_len(&self) -> usize {
        self.cache.lock().await.len()
    }

    /// Looks a station up in the geocoder. Every failure other than
    /// cancellation comes back as `NotFound`.
    pub async fn supplement_coordinate(
        &self,
        name: &str,
        region: Option<&str>,
        city: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<CoordinateResult, SyncError> {
        let clean = self.resolver.clean_name(name);
        let region = region.map(str::trim).unwrap_or_default();
        let key = Self::cache_key(&clean, region);

        if let Some(hit) = self.cached(&key).await {
            debug!(station = %clean, region, "coordinate cache hit");
            return Ok(hit);
        }

        if !self.geocoder.is_configured() {
            return Ok(CoordinateResult::not_found());
        }

        for query in Self::geocoder_queries(&clean, region) {
            self.limiter.acquire(SourceClass::Geocoder, cancel).await?;
            let outcome = guard_call(
                cancel,
                "geocoder search",
                self.call_timeout,
                self.geocoder.search(&query),
            )
            .await;

            match outcome {
                Ok(Some(candidate)) if candidate.coordinate.is_valid() => {
                    let result = CoordinateResult::resolved(
                        candidate.coordinate,
                        SourceTag::Geocoder,
                        GEOCODER_CONFIDENCE,
                    );
                    self.remember(key, result).await;
                    debug!(station = %clean, region, city, %query, "geocoder resolved coordinate");
                    return Ok(result);
                }
                Ok(_) => debug!(station = %clean, region, %query, "geocoder returned nothing usable"),
                Err(SyncError::Cancelled) => return Err(SyncError::Cancelled),
                Err(err) => {
                    warn!(station = %clean, region, error = %err, "geocoder lookup failed");
                    return Ok(CoordinateResult::not_found());
                }
            }
        }
        Ok(CoordinateResult::not_found())
    }

    /// Seeds the cache with an operator-supplied coordinate.
    /// Returns `None` when the coordinate fails validation.
    pub async fn record_manual_coordinate(
        &self,
        name: &str,
        region: Option<&str>,
        latitude: f64,
        longitude: f64,
    ) -> Option<CoordinateResult> {
        if !is_coordinate_valid(latitude, longitude) {
            warn!(station = name, latitude, longitude, "rejected manual coordinate");
            return None;
        }
        let clean = self.resolver.clean_name(name);
        let key = Self::cache_key(&clean, region.map(str::trim).unwrap_or_default());
        let result = CoordinateResult::resolved(
            Coordinate::new(latitude, longitude),
            SourceTag::Manual,
            MANUAL_CONFIDENCE,
        );
        self.remember(key, result).await;
        Some(result)
    }
}
