use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use transit_adapters::{
    load_fixture_sources, AdapterError, DetailSource, GeocodeSource, NameSource,
};
use transit_core::{
    CoordinateCandidate, NewStation, PersistedStation, RawStationObservation, SourceTag,
};
use transit_storage::{
    MemoryStationStore, RateLimitConfig, RateLimiter, StationStore, StoreError,
};
use transit_sync::{
    determine_group_coordinate, group_observations, Collaborators, NameResolver, PipelineSettings,
    ReconciliationOrchestrator, RunState, SyncError,
};

struct StaticNames {
    rows: Vec<RawStationObservation>,
    delay: Option<Duration>,
}

#[async_trait]
impl NameSource for StaticNames {
    fn source_id(&self) -> &'static str {
        "static_names"
    }

    fn is_configured(&self) -> bool {
        true
    }

    async fn list_names(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<RawStationObservation>, AdapterError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.rows.iter().skip(offset).take(limit).cloned().collect())
    }
}

#[derive(Default)]
struct StaticDetails {
    by_name: HashMap<String, Vec<RawStationObservation>>,
}

#[async_trait]
impl DetailSource for StaticDetails {
    fn source_id(&self) -> &'static str {
        "static_details"
    }

    fn is_configured(&self) -> bool {
        !self.by_name.is_empty()
    }

    async fn lookup_by_name(&self, name: &str) -> Result<Vec<RawStationObservation>, AdapterError> {
        Ok(self.by_name.get(name).cloned().unwrap_or_default())
    }
}

/// Replays scripted answers in order, then answers `None`.
#[derive(Default)]
struct ScriptedGeocoder {
    script: Mutex<VecDeque<Result<Option<CoordinateCandidate>, String>>>,
    calls: AtomicUsize,
}

impl ScriptedGeocoder {
    fn with(script: Vec<Result<Option<CoordinateCandidate>, String>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl GeocodeSource for ScriptedGeocoder {
    fn source_id(&self) -> &'static str {
        "scripted_geocoder"
    }

    fn is_configured(&self) -> bool {
        true
    }

    async fn search(&self, _query: &str) -> Result<Option<CoordinateCandidate>, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().expect("script").pop_front();
        match next {
            Some(Ok(answer)) => Ok(answer),
            Some(Err(message)) => Err(AdapterError::Message(message)),
            None => Ok(None),
        }
    }
}

fn detail(name: &str, line: &str, region: &str, city: &str) -> RawStationObservation {
    RawStationObservation::new(name, line, SourceTag::DetailRegistry)
        .with_region(region, Some(city.to_string()))
}

fn orchestrator(
    names: Arc<dyn NameSource>,
    details: Arc<dyn DetailSource>,
    geocoder: Arc<dyn GeocodeSource>,
    store: Arc<dyn StationStore>,
    settings: PipelineSettings,
) -> Arc<ReconciliationOrchestrator> {
    Arc::new(ReconciliationOrchestrator::new(
        Collaborators {
            names,
            details,
            geocoder,
            store,
            limiter: Arc::new(RateLimiter::new(RateLimitConfig::uniform(Duration::from_millis(1)))),
            resolver: Arc::new(NameResolver::new().expect("patterns")),
        },
        settings,
    ))
}

fn city_hall_details() -> StaticDetails {
    let mut by_name = HashMap::new();
    by_name.insert(
        "City Hall".to_string(),
        vec![
            detail("City Hall", "Seoul Line 1", "Seoul", "Jung-gu").with_coordinate(37.5657, 126.9769),
            detail("City Hall", "Seoul Line 2", "Seoul", "Jung-gu").with_coordinate(37.5662, 126.9772),
            detail("City Hall", "Daejeon Line 1", "Daejeon", "Seo-gu")
                .with_coordinate(36.3504, 127.3845),
        ],
    );
    StaticDetails { by_name }
}

#[tokio::test]
async fn same_name_in_two_cities_persists_as_two_stations() {
    let store = Arc::new(MemoryStationStore::new());
    let names = StaticNames {
        rows: vec![RawStationObservation::new("City Hall", "01호선", SourceTag::NameRegistry)],
        delay: None,
    };
    let orch = orchestrator(
        Arc::new(names),
        Arc::new(city_hall_details()),
        Arc::new(ScriptedGeocoder::default()),
        store.clone(),
        PipelineSettings::default(),
    );

    let summary = orch
        .run_full_sync(CancellationToken::new())
        .await
        .expect("sync");
    assert_eq!(summary.names_collected, 1);
    assert_eq!(summary.groups, 2);
    assert_eq!(summary.unresolved, 0);
    assert_eq!(summary.inserted, 3);

    let rows = store.snapshot().await;
    let seoul: Vec<_> = rows.iter().filter(|r| r.name == "City Hall(Seoul)").collect();
    let daejeon: Vec<_> = rows.iter().filter(|r| r.name == "City Hall(Daejeon)").collect();
    assert_eq!(seoul.len(), 2);
    assert_eq!(daejeon.len(), 1);
    assert!(rows.iter().all(|r| r.has_coordinates));
    assert_eq!(
        daejeon[0].region.as_deref(),
        Some("Daejeon Metropolitan City")
    );
    assert_eq!(orch.status().state, RunState::Completed);
}

#[tokio::test]
async fn transfer_lines_fifty_meters_apart_share_one_group() {
    let resolver = NameResolver::new().expect("patterns");
    let observations = vec![
        detail("Wangsimni", "Seoul Line 2", "Seoul", "Seongdong-gu").with_coordinate(37.5612, 127.0371),
        detail("Wangsimni", "Seoul Line 5", "Seoul", "Seongdong-gu").with_coordinate(37.5615, 127.0375),
    ];
    let groups = group_observations(&resolver, observations, "Seoul");
    assert_eq!(groups.len(), 1);

    let group = &groups["Wangsimni"];
    assert_eq!(group.line_labels(), vec!["2".to_string(), "5".to_string()]);
    let result = determine_group_coordinate(&group.candidates());
    assert!(result.is_resolved());
    assert!(result.confidence >= 70, "confidence {}", result.confidence);
}

#[tokio::test]
async fn maintenance_run_fills_coordinate_after_geocoder_recovers() {
    let store = Arc::new(MemoryStationStore::new());
    let geocoder = Arc::new(ScriptedGeocoder::with(vec![
        Err("upstream 503".to_string()),
        Ok(Some(CoordinateCandidate::new(37.5443, 126.9515, SourceTag::Geocoder))),
    ]));
    let names = StaticNames {
        rows: vec![RawStationObservation::new("Gongdeok", "05호선", SourceTag::NameRegistry)],
        delay: None,
    };
    let orch = orchestrator(
        Arc::new(names),
        Arc::new(StaticDetails::default()),
        geocoder.clone(),
        store.clone(),
        PipelineSettings::default(),
    );

    let sync = orch
        .run_full_sync(CancellationToken::new())
        .await
        .expect("sync");
    assert_eq!(sync.unresolved, 1);
    assert_eq!(sync.inserted, 1);
    assert_eq!(sync.skipped_sources, vec!["static_details".to_string()]);
    assert_eq!(store.count_missing_coordinates().await.expect("count"), 1);

    let supplement = orch
        .supplement_missing_coordinates(CancellationToken::new())
        .await
        .expect("supplement");
    assert_eq!(supplement.total, 1);
    assert_eq!(supplement.updated, 1);
    assert_eq!(geocoder.calls.load(Ordering::SeqCst), 2);

    let rows = store.snapshot().await;
    assert_eq!(rows[0].latitude, Some(37.5443));
    assert!(rows[0].has_coordinates);
    assert_eq!(store.count_missing_coordinates().await.expect("count"), 0);
}

#[tokio::test]
async fn maintenance_run_reaches_every_missing_row_across_pages() {
    let store = Arc::new(MemoryStationStore::new());
    for i in 0..5 {
        store
            .insert(NewStation {
                name: format!("Station {i}"),
                line_label: "1".to_string(),
                latitude: None,
                longitude: None,
                address: None,
                region: Some("Seoul Special City".to_string()),
                city: None,
                data_source: SourceTag::NameRegistry,
            })
            .await
            .expect("insert");
    }
    let script = (0..5)
        .map(|i| {
            Ok(Some(CoordinateCandidate::new(
                37.50 + i as f64 * 0.01,
                127.0,
                SourceTag::Geocoder,
            )))
        })
        .collect();
    let settings = PipelineSettings {
        supplement_page_size: 2,
        ..Default::default()
    };
    let orch = orchestrator(
        Arc::new(StaticNames { rows: Vec::new(), delay: None }),
        Arc::new(StaticDetails::default()),
        Arc::new(ScriptedGeocoder::with(script)),
        store.clone(),
        settings,
    );

    let summary = orch
        .supplement_missing_coordinates(CancellationToken::new())
        .await
        .expect("supplement");
    assert_eq!(summary.total, 5);
    assert_eq!(summary.updated, 5);
    assert!((summary.success_rate - 100.0).abs() < f64::EPSILON);
    assert_eq!(store.count_missing_coordinates().await.expect("count"), 0);
}

#[tokio::test]
async fn existing_values_are_never_overwritten() {
    let store = Arc::new(MemoryStationStore::new());
    let existing = store
        .insert(NewStation {
            name: "Sadang".to_string(),
            line_label: "2".to_string(),
            latitude: Some(37.4765),
            longitude: Some(126.9816),
            address: None,
            region: None,
            city: None,
            data_source: SourceTag::Manual,
        })
        .await
        .expect("insert");

    let mut by_name = HashMap::new();
    by_name.insert(
        "Sadang".to_string(),
        vec![detail("Sadang", "Seoul Line 2", "Seoul", "Dongjak-gu")
            .with_coordinate(37.4768, 126.9820)
            .with_address("Dongjak-daero, Dongjak-gu")],
    );
    let orch = orchestrator(
        Arc::new(StaticNames {
            rows: vec![RawStationObservation::new("Sadang", "02호선", SourceTag::NameRegistry)],
            delay: None,
        }),
        Arc::new(StaticDetails { by_name }),
        Arc::new(ScriptedGeocoder::default()),
        store.clone(),
        PipelineSettings::default(),
    );

    let summary = orch
        .run_full_sync(CancellationToken::new())
        .await
        .expect("sync");
    assert_eq!(summary.inserted, 0);
    assert_eq!(summary.updated, 1);

    let row = store.get(existing.id).await.expect("row");
    assert_eq!(row.latitude, Some(37.4765));
    assert_eq!(row.longitude, Some(126.9816));
    assert_eq!(row.address.as_deref(), Some("Dongjak-daero, Dongjak-gu"));
    assert_eq!(row.region.as_deref(), Some("Seoul Special City"));
    assert_eq!(row.city.as_deref(), Some("Dongjak-gu"));
}

fn slow_orchestrator(store: Arc<MemoryStationStore>) -> Arc<ReconciliationOrchestrator> {
    let names = StaticNames {
        rows: vec![RawStationObservation::new("Gongdeok", "05호선", SourceTag::NameRegistry)],
        delay: Some(Duration::from_secs(60)),
    };
    orchestrator(
        Arc::new(names),
        Arc::new(StaticDetails::default()),
        Arc::new(ScriptedGeocoder::default()),
        store,
        PipelineSettings {
            call_timeout: Duration::from_secs(120),
            ..Default::default()
        },
    )
}

#[tokio::test]
async fn cancelling_a_background_run_stops_it() {
    let store = Arc::new(MemoryStationStore::new());
    let orch = slow_orchestrator(store.clone());

    let handle = orch.start_full_sync().expect("start");
    let run_id = handle.run_id;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(orch.active_run(), Some(run_id));
    assert_eq!(orch.cancel_active(), Some(run_id));

    let outcome = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("run ends promptly");
    assert!(matches!(outcome, Err(SyncError::Cancelled)));
    assert_eq!(orch.status().state, RunState::Cancelled);
    assert_eq!(orch.active_run(), None);
    assert!(store.snapshot().await.is_empty());
}

#[tokio::test]
async fn only_one_run_may_be_active() {
    let orch = slow_orchestrator(Arc::new(MemoryStationStore::new()));

    let first = orch.start_full_sync().expect("start");
    match orch.start_supplement() {
        Err(SyncError::AlreadyRunning(active)) => assert_eq!(active, first.run_id),
        Err(other) => panic!("unexpected error {other}"),
        Ok(_) => panic!("second run started"),
    }

    first.cancel();
    let _ = first.wait().await;

    let second = orch.start_supplement().expect("slot released");
    let outcome = second.wait().await.expect("supplement");
    assert!(matches!(outcome, transit_sync::RunOutcome::CoordinateSupplement(_)));
}

#[tokio::test]
async fn workspace_fixtures_reconcile_end_to_end() {
    let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures");
    let sources = load_fixture_sources(&dir).expect("fixtures");
    let store = Arc::new(MemoryStationStore::new());
    let orch = orchestrator(
        sources.names,
        sources.details,
        sources.geocoder,
        store.clone(),
        PipelineSettings::default(),
    );

    let summary = orch
        .run_full_sync(CancellationToken::new())
        .await
        .expect("sync");
    assert_eq!(summary.names_collected, 5);
    assert_eq!(summary.groups, 6);
    assert_eq!(summary.resolved_from_sources, 4);
    assert_eq!(summary.resolved_by_geocoder, 2);
    assert_eq!(summary.unresolved, 0);
    assert_eq!(summary.inserted, 10);
    assert_eq!(summary.suspected_duplicates, vec!["Seoul".to_string()]);
    assert_eq!(store.count_missing_coordinates().await.expect("count"), 0);

    let stats = orch.coordinate_statistics().await.expect("stats");
    assert_eq!(stats.total, 10);
    assert_eq!(stats.with_coordinates, 10);

    let again = orch
        .run_full_sync(CancellationToken::new())
        .await
        .expect("second sync");
    assert_eq!(again.inserted, 0);
    assert_eq!(again.updated, 0);
    assert_eq!(again.unchanged, 10);
}

/// Tracks how many calls are in flight at once.
#[derive(Default)]
struct InFlight {
    now: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
}

impl InFlight {
    async fn hold(&self, duration: Duration) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let current = self.now.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(current, Ordering::SeqCst);
        tokio::time::sleep(duration).await;
        self.now.fetch_sub(1, Ordering::SeqCst);
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct SlowDetails {
    gauge: InFlight,
}

#[async_trait]
impl DetailSource for SlowDetails {
    fn source_id(&self) -> &'static str {
        "slow_details"
    }

    fn is_configured(&self) -> bool {
        true
    }

    async fn lookup_by_name(&self, name: &str) -> Result<Vec<RawStationObservation>, AdapterError> {
        self.gauge.hold(Duration::from_millis(25)).await;
        Ok(vec![detail(name, "Seoul Line 3", "Seoul", "Gangnam-gu").with_coordinate(37.49, 127.03)])
    }
}

#[derive(Default)]
struct SlowGeocoder {
    gauge: InFlight,
}

#[async_trait]
impl GeocodeSource for SlowGeocoder {
    fn source_id(&self) -> &'static str {
        "slow_geocoder"
    }

    fn is_configured(&self) -> bool {
        true
    }

    async fn search(&self, _query: &str) -> Result<Option<CoordinateCandidate>, AdapterError> {
        self.gauge.hold(Duration::from_millis(25)).await;
        Ok(Some(CoordinateCandidate::new(37.51, 127.06, SourceTag::Geocoder)))
    }
}

fn numbered_names(count: usize) -> StaticNames {
    StaticNames {
        rows: (0..count)
            .map(|i| RawStationObservation::new(format!("Stop {i}"), "03호선", SourceTag::NameRegistry))
            .collect(),
        delay: None,
    }
}

#[tokio::test]
async fn detail_lookups_never_exceed_three_in_flight() {
    let details = Arc::new(SlowDetails::default());
    let orch = orchestrator(
        Arc::new(numbered_names(10)),
        details.clone(),
        Arc::new(ScriptedGeocoder::default()),
        Arc::new(MemoryStationStore::new()),
        PipelineSettings::default(),
    );

    let summary = orch
        .run_full_sync(CancellationToken::new())
        .await
        .expect("sync");
    assert_eq!(summary.detail_lookups, 10);
    assert_eq!(details.gauge.calls.load(Ordering::SeqCst), 10);
    let peak = details.gauge.peak();
    assert!((2..=3).contains(&peak), "peak {peak}");
}

#[tokio::test]
async fn geocoder_fallbacks_never_exceed_three_in_flight() {
    let geocoder = Arc::new(SlowGeocoder::default());
    let orch = orchestrator(
        Arc::new(numbered_names(10)),
        Arc::new(StaticDetails::default()),
        geocoder.clone(),
        Arc::new(MemoryStationStore::new()),
        PipelineSettings::default(),
    );

    let summary = orch
        .run_full_sync(CancellationToken::new())
        .await
        .expect("sync");
    assert_eq!(summary.resolved_by_geocoder, 10);
    assert_eq!(geocoder.gauge.calls.load(Ordering::SeqCst), 10);
    let peak = geocoder.gauge.peak();
    assert!((2..=3).contains(&peak), "peak {peak}");
}

/// Serves `rows` page by page but fails the page starting at `failing_offset`.
struct FlakyNames {
    rows: Vec<RawStationObservation>,
    failing_offset: usize,
}

#[async_trait]
impl NameSource for FlakyNames {
    fn source_id(&self) -> &'static str {
        "flaky_names"
    }

    fn is_configured(&self) -> bool {
        true
    }

    async fn list_names(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<RawStationObservation>, AdapterError> {
        if offset == self.failing_offset {
            return Err(AdapterError::Message("gateway timeout".into()));
        }
        Ok(self.rows.iter().skip(offset).take(limit).cloned().collect())
    }
}

#[tokio::test]
async fn failed_name_page_is_skipped_and_collection_continues() {
    let names = FlakyNames {
        rows: numbered_names(6).rows,
        failing_offset: 2,
    };
    let orch = orchestrator(
        Arc::new(names),
        Arc::new(StaticDetails::default()),
        Arc::new(ScriptedGeocoder::default()),
        Arc::new(MemoryStationStore::new()),
        PipelineSettings {
            name_page_size: 2,
            ..Default::default()
        },
    );

    let summary = orch
        .run_full_sync(CancellationToken::new())
        .await
        .expect("sync");
    assert_eq!(summary.name_pages, 4);
    assert_eq!(summary.names_collected, 4);
    assert_eq!(summary.groups, 4);
    assert_eq!(orch.status().state, RunState::Completed);
}

/// Memory store whose missing-coordinate count always fails.
struct CountFailingStore {
    inner: MemoryStationStore,
}

#[async_trait]
impl StationStore for CountFailingStore {
    async fn find_by_canonical_name(
        &self,
        canonical_name: &str,
    ) -> Result<Vec<PersistedStation>, StoreError> {
        self.inner.find_by_canonical_name(canonical_name).await
    }

    async fn find_missing_coordinates(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<PersistedStation>, StoreError> {
        self.inner.find_missing_coordinates(offset, limit).await
    }

    async fn count_missing_coordinates(&self) -> Result<usize, StoreError> {
        Err(StoreError::InvalidRow("db down".into()))
    }

    async fn count_all(&self) -> Result<usize, StoreError> {
        self.inner.count_all().await
    }

    async fn find_page(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<PersistedStation>, StoreError> {
        self.inner.find_page(offset, limit).await
    }

    async fn insert(&self, station: NewStation) -> Result<PersistedStation, StoreError> {
        self.inner.insert(station).await
    }

    async fn update(&self, station: &PersistedStation) -> Result<PersistedStation, StoreError> {
        self.inner.update(station).await
    }

    async fn update_coordinates(
        &self,
        id: i64,
        latitude: f64,
        longitude: f64,
    ) -> Result<PersistedStation, StoreError> {
        self.inner.update_coordinates(id, latitude, longitude).await
    }
}

#[tokio::test]
async fn store_failure_ends_the_maintenance_run_in_error() {
    let orch = orchestrator(
        Arc::new(StaticNames { rows: Vec::new(), delay: None }),
        Arc::new(StaticDetails::default()),
        Arc::new(ScriptedGeocoder::default()),
        Arc::new(CountFailingStore {
            inner: MemoryStationStore::new(),
        }),
        PipelineSettings::default(),
    );

    let err = orch
        .supplement_missing_coordinates(CancellationToken::new())
        .await
        .expect_err("count fails");
    assert!(matches!(&err, SyncError::RunFailure(m) if m.contains("db down")), "{err}");

    let status = orch.status();
    assert_eq!(status.state, RunState::Error);
    assert!(status.message.as_deref().is_some_and(|m| m.contains("db down")));
    assert!(status.outcome.is_none());
    assert_eq!(orch.active_run(), None);
}

struct PanickingNames;

#[async_trait]
impl NameSource for PanickingNames {
    fn source_id(&self) -> &'static str {
        "panicking_names"
    }

    fn is_configured(&self) -> bool {
        true
    }

    async fn list_names(
        &self,
        _offset: usize,
        _limit: usize,
    ) -> Result<Vec<RawStationObservation>, AdapterError> {
        panic!("name registry exploded");
    }
}

#[tokio::test]
async fn panic_inside_background_run_is_reported_as_error() {
    let orch = orchestrator(
        Arc::new(PanickingNames),
        Arc::new(StaticDetails::default()),
        Arc::new(ScriptedGeocoder::default()),
        Arc::new(MemoryStationStore::new()),
        PipelineSettings::default(),
    );

    let handle = orch.start_full_sync().expect("start");
    let err = handle.wait().await.expect_err("panicked");
    assert!(matches!(&err, SyncError::RunFailure(m) if m.contains("exploded")), "{err}");

    let status = orch.status();
    assert_eq!(status.state, RunState::Error);
    assert!(status.message.as_deref().is_some_and(|m| m.contains("exploded")));
    assert_eq!(orch.active_run(), None);
    assert!(orch.start_supplement().is_ok());
}

struct Unconfigured;

#[async_trait]
impl NameSource for Unconfigured {
    fn source_id(&self) -> &'static str {
        "unkeyed_names"
    }

    fn is_configured(&self) -> bool {
        false
    }

    async fn list_names(
        &self,
        _offset: usize,
        _limit: usize,
    ) -> Result<Vec<RawStationObservation>, AdapterError> {
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn full_sync_without_any_registry_key_fails() {
    let orch = orchestrator(
        Arc::new(Unconfigured),
        Arc::new(StaticDetails::default()),
        Arc::new(ScriptedGeocoder::default()),
        Arc::new(MemoryStationStore::new()),
        PipelineSettings::default(),
    );

    let err = orch
        .run_full_sync(CancellationToken::new())
        .await
        .expect_err("nothing configured");
    match &err {
        SyncError::ConfigurationMissing(sources) => {
            assert!(sources.contains("unkeyed_names"));
            assert!(sources.contains("static_details"));
        }
        other => panic!("unexpected error {other}"),
    }
    let status = orch.status();
    assert_eq!(status.state, RunState::Error);
    assert!(status
        .message
        .as_deref()
        .is_some_and(|m| m.starts_with("configuration missing")));
}

