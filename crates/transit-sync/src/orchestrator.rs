//! End-to-end reconciliation runs: collect names, fetch details, group,
//! enrich coordinates, persist.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use transit_adapters::{DetailSource, GeocodeSource, NameSource};
use transit_core::{
    CoordinateStatistics, NewStation, PersistedStation, RawStationObservation, SourceClass,
    SourceTag, StationGroup,
};
use transit_storage::{RateLimiter, StationStore};
use uuid::Uuid;

use crate::batch::{BatchProgress, StreamingBatchProcessor};
use crate::coordinates::{cluster_candidates, CacheSettings, CoordinateReconciler};
use crate::error::{guard_call, SyncError};
use crate::names::NameResolver;
use crate::status::{
    RunKind, RunOutcome, RunState, RunStatus, SupplementSummary, SyncHandle, SyncRunSummary,
};

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub name_page_size: usize,
    pub max_name_pages: usize,
    pub detail_concurrency: usize,
    pub enrich_concurrency: usize,
    pub supplement_page_size: usize,
    pub stats_page_size: usize,
    pub call_timeout: Duration,
    pub cache: CacheSettings,
    /// Region assumed for name-registry rows that carry no hints.
    pub default_region: String,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            name_page_size: 1000,
            max_name_pages: 10,
            detail_concurrency: 3,
            enrich_concurrency: 3,
            supplement_page_size: 20,
            stats_page_size: 500,
            call_timeout: Duration::from_secs(30),
            cache: CacheSettings::default(),
            default_region: "Seoul".to_string(),
        }
    }
}

/// Everything a run talks to. All shared, none global.
#[derive(Clone)]
pub struct Collaborators {
    pub names: Arc<dyn NameSource>,
    pub details: Arc<dyn DetailSource>,
    pub geocoder: Arc<dyn GeocodeSource>,
    pub store: Arc<dyn StationStore>,
    pub limiter: Arc<RateLimiter>,
    pub resolver: Arc<NameResolver>,
}

/// Partitions observations by canonical name, normalizing line labels on the way.
pub fn group_observations(
    resolver: &NameResolver,
    observations: impl IntoIterator<Item = RawStationObservation>,
    default_region: &str,
) -> BTreeMap<String, StationGroup> {
    let mut groups: BTreeMap<String, StationGroup> = BTreeMap::new();
    for mut observation in observations {
        let region = match (&observation.region_hint, &observation.city_hint) {
            (Some(region), _) => Some(region.as_str()),
            (None, Some(_)) => None,
            (None, None) => Some(default_region),
        };
        let standardized =
            resolver.standardize(&observation.name, region, observation.city_hint.as_deref());
        observation.line_label = resolver.normalize_line_label(&observation.line_label);

        match groups.get_mut(&standardized.canonical_name) {
            Some(group) => group.push(observation),
            None => {
                groups.insert(
                    standardized.canonical_name.clone(),
                    StationGroup::new(standardized, observation),
                );
            }
        }
    }
    groups
}

/// Groups outside the duplicate-name list whose member coordinates disagree
/// by more than transfer distance.
pub fn suspected_duplicates<'a>(groups: impl IntoIterator<Item = &'a StationGroup>) -> Vec<String> {
    groups
        .into_iter()
        .filter(|group| !group.standardized.is_duplicate_candidate)
        .filter(|group| {
            let valid: Vec<_> = group
                .candidates()
                .into_iter()
                .filter(|c| c.coordinate.is_valid())
                .collect();
            cluster_candidates(&valid).len() > 1
        })
        .map(|group| group.canonical_name.clone())
        .collect()
}

#[derive(Debug, Clone)]
struct ActiveRun {
    run_id: Uuid,
    cancel: CancellationToken,
}

/// Releases the single active-run slot when a run ends, however it ends.
struct RunGuard {
    slot: Arc<Mutex<Option<ActiveRun>>>,
    run_id: Uuid,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|active| active.run_id == self.run_id) {
            *slot = None;
        }
    }
}

pub struct ReconciliationOrchestrator {
    names: Arc<dyn NameSource>,
    details: Arc<dyn DetailSource>,
    store: Arc<dyn StationStore>,
    limiter: Arc<RateLimiter>,
    resolver: Arc<NameResolver>,
    reconciler: Arc<CoordinateReconciler>,
    settings: PipelineSettings,
    progress: Arc<BatchProgress>,
    status_tx: watch::Sender<RunStatus>,
    active: Arc<Mutex<Option<ActiveRun>>>,
}

impl ReconciliationOrchestrator {
    pub fn new(collaborators: Collaborators, settings: PipelineSettings) -> Self {
        let reconciler = Arc::new(CoordinateReconciler::new(
            collaborators.geocoder,
            Arc::clone(&collaborators.limiter),
            Arc::clone(&collaborators.resolver),
            settings.cache,
            settings.call_timeout,
        ));
        let (status_tx, _) = watch::channel(RunStatus::idle());
        Self {
            names: collaborators.names,
            details: collaborators.details,
            store: collaborators.store,
            limiter: collaborators.limiter,
            resolver: collaborators.resolver,
            reconciler,
            settings,
            progress: Arc::new(BatchProgress::default()),
            status_tx,
            active: Arc::new(Mutex::new(None)),
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn reconciler(&self) -> &Arc<CoordinateReconciler> {
        &self.reconciler
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn resolver(&self) -> &Arc<NameResolver> {
        &self.resolver
    }

    pub fn store(&self) -> &Arc<dyn StationStore> {
        &self.store
    }

    pub fn progress(&self) -> &Arc<BatchProgress> {
        &self.progress
    }

    pub fn subscribe(&self) -> watch::Receiver<RunStatus> {
        self.status_tx.subscribe()
    }

    /// Latest status with live progress counters.
    pub fn status(&self) -> RunStatus {
        let mut status = self.status_tx.borrow().clone();
        if !status.state.is_terminal() && status.state != RunState::Idle {
            status.progress = self.progress.snapshot();
        }
        status
    }

    pub fn active_run(&self) -> Option<Uuid> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|run| run.run_id)
    }

    /// Cancels the active run, if any, and returns its id.
    pub fn cancel_active(&self) -> Option<Uuid> {
        let slot = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        slot.as_ref().map(|run| {
            run.cancel.cancel();
            run.run_id
        })
    }

    fn claim(&self, kind: RunKind, cancel: CancellationToken) -> Result<(Uuid, RunGuard), SyncError> {
        let mut slot = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(active) = slot.as_ref() {
            return Err(SyncError::AlreadyRunning(active.run_id));
        }
        let run_id = Uuid::new_v4();
        *slot = Some(ActiveRun { run_id, cancel });
        drop(slot);

        self.progress.reset(0);
        let first_state = match kind {
            RunKind::FullSync => RunState::CollectingNames,
            RunKind::CoordinateSupplement => RunState::EnrichingCoordinates,
        };
        self.status_tx
            .send_replace(RunStatus::started(run_id, kind, first_state));
        Ok((
            run_id,
            RunGuard {
                slot: Arc::clone(&self.active),
                run_id,
            },
        ))
    }

    fn enter_state(&self, state: RunState) {
        info!(stage = ?state, "stage started");
        self.status_tx.send_modify(|status| status.state = state);
    }

    fn finish<T>(&self, run_id: Uuid, result: &Result<T, SyncError>, outcome: Option<RunOutcome>) {
        let progress = self.progress.snapshot();
        self.status_tx.send_if_modified(|status| {
            if status.run_id != Some(run_id) {
                return false;
            }
            status.finished_at = Some(Utc::now());
            status.progress = progress;
            match result {
                Ok(_) => {
                    status.state = RunState::Completed;
                    status.message = None;
                    status.outcome = outcome;
                }
                Err(SyncError::Cancelled) => {
                    status.state = RunState::Cancelled;
                    status.message = Some("cancelled".to_string());
                }
                Err(err) => {
                    status.state = RunState::Error;
                    status.message = Some(err.to_string());
                }
            }
            true
        });
        match result {
            Ok(_) => info!("run completed"),
            Err(SyncError::Cancelled) => warn!("run cancelled"),
            Err(err) => warn!(error = %err, "run failed"),
        }
    }

    /// Runs the full pipeline to completion on the current task.
    pub async fn run_full_sync(&self, cancel: CancellationToken) -> Result<SyncRunSummary, SyncError> {
        let (run_id, guard) = self.claim(RunKind::FullSync, cancel.clone())?;
        self.execute_full_sync(run_id, cancel, guard).await
    }

    async fn execute_full_sync(
        &self,
        run_id: Uuid,
        cancel: CancellationToken,
        guard: RunGuard,
    ) -> Result<SyncRunSummary, SyncError> {
        let span = info_span!("sync_run", %run_id, kind = "full_sync");
        let result = self.full_sync_stages(run_id, &cancel).instrument(span.clone()).await;
        // The slot is free before a terminal status becomes visible.
        drop(guard);
        let outcome = result
            .as_ref()
            .ok()
            .map(|summary| RunOutcome::FullSync(summary.clone()));
        span.in_scope(|| self.finish(run_id, &result, outcome));
        result
    }

    /// Runs the maintenance supplement to completion on the current task.
    pub async fn supplement_missing_coordinates(
        &self,
        cancel: CancellationToken,
    ) -> Result<SupplementSummary, SyncError> {
        let (run_id, guard) = self.claim(RunKind::CoordinateSupplement, cancel.clone())?;
        self.execute_supplement(run_id, cancel, guard).await
    }

    async fn execute_supplement(
        &self,
        run_id: Uuid,
        cancel: CancellationToken,
        guard: RunGuard,
    ) -> Result<SupplementSummary, SyncError> {
        let span = info_span!("sync_run", %run_id, kind = "coordinate_supplement");
        let result = self.supplement_stage(run_id, &cancel).instrument(span.clone()).await;
        drop(guard);
        let outcome = result
            .as_ref()
            .ok()
            .map(|summary| RunOutcome::CoordinateSupplement(summary.clone()));
        span.in_scope(|| self.finish(run_id, &result, outcome));
        result
    }

    /// Starts a full sync in the background. Fails if a run is active.
    pub fn start_full_sync(self: &Arc<Self>) -> Result<SyncHandle, SyncError> {
        let cancel = CancellationToken::new();
        let (run_id, guard) = self.claim(RunKind::FullSync, cancel.clone())?;
        let this = Arc::clone(self);
        let task_cancel = cancel.clone();
        let run = async move {
            this.execute_full_sync(run_id, task_cancel, guard)
                .await
                .map(RunOutcome::FullSync)
        };
        Ok(self.spawn_run(run_id, cancel, run))
    }

    /// Starts the coordinate supplement in the background. Fails if a run is active.
    pub fn start_supplement(self: &Arc<Self>) -> Result<SyncHandle, SyncError> {
        let cancel = CancellationToken::new();
        let (run_id, guard) = self.claim(RunKind::CoordinateSupplement, cancel.clone())?;
        let this = Arc::clone(self);
        let task_cancel = cancel.clone();
        let run = async move {
            this.execute_supplement(run_id, task_cancel, guard)
                .await
                .map(RunOutcome::CoordinateSupplement)
        };
        Ok(self.spawn_run(run_id, cancel, run))
    }

    /// Spawns a claimed run. A panic inside it is published as `ERROR`.
    fn spawn_run<F>(self: &Arc<Self>, run_id: Uuid, cancel: CancellationToken, run: F) -> SyncHandle
    where
        F: Future<Output = Result<RunOutcome, SyncError>> + Send + 'static,
    {
        let this = Arc::clone(self);
        let join = tokio::spawn(async move {
            // The run future, and its slot guard, are dropped once this resolves.
            let outcome = AssertUnwindSafe(run).catch_unwind().await;
            match outcome {
                Ok(result) => result,
                Err(panic) => {
                    let message = format!("run panicked: {}", panic_message(&*panic));
                    let failure: Result<(), SyncError> = Err(SyncError::RunFailure(message.clone()));
                    info_span!("sync_run", %run_id).in_scope(|| this.finish(run_id, &failure, None));
                    Err(SyncError::RunFailure(message))
                }
            }
        });
        SyncHandle {
            run_id,
            status: self.status_tx.subscribe(),
            progress: Arc::clone(&self.progress),
            cancel,
            join,
        }
    }

    async fn full_sync_stages(
        &self,
        run_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<SyncRunSummary, SyncError> {
        let mut summary = SyncRunSummary {
            run_id,
            started_at: Utc::now(),
            ..Default::default()
        };

        summary.skipped_sources = self.unconfigured_sources()?;

        self.enter_state(RunState::CollectingNames);
        let (names, name_observations, pages) = self.collect_names(cancel).await?;
        summary.name_pages = pages;
        summary.names_collected = names.len();

        self.enter_state(RunState::FetchingDetails);
        let (details, failures) = self.fetch_details(&names, cancel).await?;
        summary.detail_lookups = names.len();
        summary.detail_failures = failures;

        self.enter_state(RunState::Grouping);
        summary.observations = details.len() + name_observations.len();
        let mut groups = group_observations(
            &self.resolver,
            details.into_iter().chain(name_observations),
            &self.settings.default_region,
        );
        summary.groups = groups.len();
        summary.suspected_duplicates = suspected_duplicates(groups.values());
        for name in &summary.suspected_duplicates {
            warn!(station = %name, "member coordinates disagree; possible same-name stations");
        }

        self.enter_state(RunState::EnrichingCoordinates);
        self.enrich_groups(&mut groups, &mut summary, cancel).await?;

        self.enter_state(RunState::Persisting);
        self.persist_groups(&groups, &mut summary, cancel).await?;

        summary.finished_at = Utc::now();
        info!(
            groups = summary.groups,
            inserted = summary.inserted,
            updated = summary.updated,
            unresolved = summary.unresolved,
            "reconciliation finished"
        );
        Ok(summary)
    }

    /// Registries whose key is unset. With neither configured there is
    /// nothing to reconcile, and the run fails.
    fn unconfigured_sources(&self) -> Result<Vec<String>, SyncError> {
        let sources = [
            (self.names.source_id(), self.names.is_configured()),
            (self.details.source_id(), self.details.is_configured()),
        ];
        let missing: Vec<String> = sources
            .iter()
            .filter(|(_, configured)| !configured)
            .map(|(source, _)| source.to_string())
            .collect();
        if missing.len() == sources.len() {
            return Err(SyncError::ConfigurationMissing(missing.join(", ")));
        }
        for source in &missing {
            let skipped = SyncError::ConfigurationMissing(source.clone());
            warn!(%source, error = %skipped, "source skipped for this run");
        }
        Ok(missing)
    }

    async fn collect_names(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(BTreeSet<String>, Vec<RawStationObservation>, usize), SyncError> {
        let mut names = BTreeSet::new();
        let mut observations = Vec::new();
        if !self.names.is_configured() {
            warn!(source = self.names.source_id(), "name registry not configured; skipping");
            return Ok((names, observations, 0));
        }

        let page_size = self.settings.name_page_size.max(1);
        let mut pages = 0;
        for page in 0..self.settings.max_name_pages {
            let offset = page * page_size;
            self.limiter.acquire(SourceClass::NameRegistry, cancel).await?;
            let fetched = guard_call(
                cancel,
                "name registry page",
                self.settings.call_timeout,
                self.names.list_names(offset, page_size),
            )
            .await;
            pages += 1;
            match fetched {
                Ok(rows) => {
                    let short = rows.len() < page_size;
                    for row in rows {
                        let clean = self.resolver.clean_name(&row.name);
                        if !clean.is_empty() {
                            names.insert(clean);
                        }
                        observations.push(row);
                    }
                    if short {
                        break;
                    }
                }
                Err(SyncError::Cancelled) => return Err(SyncError::Cancelled),
                Err(err) => warn!(page, error = %err, "name page failed; skipping"),
            }
        }
        info!(names = names.len(), pages, "collected station names");
        Ok((names, observations, pages))
    }

    async fn fetch_details(
        &self,
        names: &BTreeSet<String>,
        cancel: &CancellationToken,
    ) -> Result<(Vec<RawStationObservation>, usize), SyncError> {
        if !self.details.is_configured() {
            warn!(source = self.details.source_id(), "detail registry not configured; skipping");
            return Ok((Vec::new(), 0));
        }

        let total = names.len();
        self.progress.reset(total);
        let log_every = (total / 10).max(1);
        let failures = AtomicUsize::new(0);

        let mut lookups = stream::iter(names.iter().cloned())
            .map(|name| {
                let failures = &failures;
                async move {
                    self.limiter.acquire(SourceClass::DetailRegistry, cancel).await?;
                    match guard_call(
                        cancel,
                        "detail lookup",
                        self.settings.call_timeout,
                        self.details.lookup_by_name(&name),
                    )
                    .await
                    {
                        Ok(rows) => Ok::<_, SyncError>((rows, true)),
                        Err(SyncError::Cancelled) => Err(SyncError::Cancelled),
                        Err(err) => {
                            warn!(station = %name, error = %err, "detail lookup failed; continuing without it");
                            failures.fetch_add(1, Ordering::Relaxed);
                            Ok((Vec::new(), false))
                        }
                    }
                }
            })
            .buffer_unordered(self.settings.detail_concurrency.max(1));

        let mut observations = Vec::new();
        let mut done = 0;
        while let Some(result) = lookups.next().await {
            let (rows, found) = result?;
            observations.extend(rows);
            done += 1;
            if found {
                self.progress.record_success();
            } else {
                self.progress.record_failure();
            }
            if done % log_every == 0 || done == total {
                info!(done, total, "detail lookups progress");
            }
        }
        drop(lookups);
        Ok((observations, failures.load(Ordering::Relaxed)))
    }

    async fn enrich_groups(
        &self,
        groups: &mut BTreeMap<String, StationGroup>,
        summary: &mut SyncRunSummary,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        let mut pending = Vec::new();
        for (key, group) in groups.iter_mut() {
            let result = self.reconciler.determine_group_coordinate(&group.candidates());
            match (result.coordinate, result.source_tag()) {
                (Some(coordinate), Some(source)) => {
                    group.set_representative(coordinate, source, result.confidence);
                    summary.resolved_from_sources += 1;
                }
                _ => pending.push((
                    key.clone(),
                    group.standardized.original_name.clone(),
                    group.standardized.region.clone(),
                    group.standardized.city.clone(),
                )),
            }
        }

        self.progress.reset(pending.len());
        let mut lookups = stream::iter(pending)
            .map(|(key, name, region, city)| async move {
                let result = self
                    .reconciler
                    .supplement_coordinate(&name, Some(&region), city.as_deref(), cancel)
                    .await?;
                Ok::<_, SyncError>((key, result))
            })
            .buffer_unordered(self.settings.enrich_concurrency.max(1));

        while let Some(outcome) = lookups.next().await {
            let (key, result) = outcome?;
            match (result.coordinate, result.source_tag(), groups.get_mut(&key)) {
                (Some(coordinate), Some(source), Some(group)) => {
                    group.set_representative(coordinate, source, result.confidence);
                    summary.resolved_by_geocoder += 1;
                    self.progress.record_success();
                }
                _ => {
                    summary.unresolved += 1;
                    self.progress.record_failure();
                }
            }
        }
        Ok(())
    }

    async fn persist_groups(
        &self,
        groups: &BTreeMap<String, StationGroup>,
        summary: &mut SyncRunSummary,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        self.progress.reset(groups.len());
        for group in groups.values() {
            self.persist_group(group, summary, cancel).await?;
            self.progress.record_success();
        }
        Ok(())
    }

    async fn persist_group(
        &self,
        group: &StationGroup,
        summary: &mut SyncRunSummary,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        let timeout = self.settings.call_timeout;
        let existing = guard_call(
            cancel,
            "store lookup",
            timeout,
            self.store.find_by_canonical_name(&group.canonical_name),
        )
        .await
        .map_err(|err| err.halting("looking up persisted stations"))?;

        let region = &group.standardized.region;
        let data_source = group
            .representative_source
            .or_else(|| group.members().first().map(|m| m.source))
            .unwrap_or(SourceTag::Calculated);

        for line in group.line_labels() {
            let incoming = NewStation {
                name: group.canonical_name.clone(),
                line_label: line.clone(),
                latitude: group.representative_coordinate.map(|c| c.latitude),
                longitude: group.representative_coordinate.map(|c| c.longitude),
                address: group.address_for_line(&line),
                region: Some(region.clone()),
                city: group.standardized.city.clone(),
                data_source,
            };

            let matching = existing.iter().find(|row| {
                row.line_label == line && row.region.as_deref().map_or(true, |r| r == region)
            });

            let written = match matching {
                None => guard_call(cancel, "store insert", timeout, self.store.insert(incoming))
                    .await
                    .map(|_| summary.inserted += 1),
                Some(row) => {
                    let mut merged: PersistedStation = row.clone();
                    if merged.fill_missing_from(&incoming) {
                        guard_call(cancel, "store update", timeout, self.store.update(&merged))
                            .await
                            .map(|_| summary.updated += 1)
                    } else {
                        summary.unchanged += 1;
                        Ok(())
                    }
                }
            };

            match written {
                Ok(()) => {}
                Err(SyncError::Cancelled) => return Err(SyncError::Cancelled),
                Err(err) => {
                    warn!(station = %group.canonical_name, line = %line, error = %err, "writing station row failed");
                    summary.persist_failures += 1;
                }
            }
        }
        Ok(())
    }

    async fn supplement_stage(
        &self,
        run_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<SupplementSummary, SyncError> {
        let started_at = Utc::now();
        let timeout = self.settings.call_timeout;
        let processor = StreamingBatchProcessor::new(Arc::clone(&self.progress), cancel.clone());
        // Fixed rows leave the missing set, so later offsets shift back by this much.
        let fixed = AtomicUsize::new(0);
        let not_found = AtomicUsize::new(0);

        let count = guard_call(
            cancel,
            "count missing coordinates",
            timeout,
            self.store.count_missing_coordinates(),
        );
        let results = processor.for_each_page(
            async move {
                count
                    .await
                    .map_err(|err| err.halting("counting stations without coordinates"))
            },
            |offset, limit| {
                let adjusted = offset.saturating_sub(fixed.load(Ordering::Acquire));
                let page = guard_call(
                    cancel,
                    "find missing coordinates",
                    timeout,
                    self.store.find_missing_coordinates(adjusted, limit),
                );
                async move {
                    page.await
                        .map_err(|err| err.halting("reading stations without coordinates"))
                }
            },
            self.settings.supplement_page_size,
            |station: PersistedStation| {
                let fixed = &fixed;
                let not_found = &not_found;
                async move {
                    let result = self
                        .reconciler
                        .supplement_coordinate(
                            &station.name,
                            station.region.as_deref(),
                            station.city.as_deref(),
                            cancel,
                        )
                        .await?;
                    let Some(coordinate) = result.coordinate.filter(|_| result.is_resolved()) else {
                        not_found.fetch_add(1, Ordering::Relaxed);
                        return Ok::<bool, SyncError>(false);
                    };
                    guard_call(
                        cancel,
                        "update coordinates",
                        timeout,
                        self.store.update_coordinates(
                            station.id,
                            coordinate.latitude,
                            coordinate.longitude,
                        ),
                    )
                    .await?;
                    fixed.fetch_add(1, Ordering::AcqRel);
                    info!(station = %station.name, line = %station.line_label, "coordinate supplemented");
                    Ok::<bool, SyncError>(true)
                }
            },
        );
        futures::pin_mut!(results);

        let mut summary = SupplementSummary {
            run_id,
            started_at,
            ..Default::default()
        };
        while let Some(result) = results.next().await {
            summary.total += 1;
            match result {
                Ok(true) => summary.updated += 1,
                Ok(false) => {}
                Err(err @ (SyncError::Cancelled | SyncError::RunFailure(_))) => return Err(err),
                Err(err) => {
                    warn!(error = %err, "supplementing station failed");
                    summary.failed += 1;
                }
            }
        }
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        summary.not_found = not_found.load(Ordering::Relaxed);
        summary.success_rate = if summary.total == 0 {
            0.0
        } else {
            summary.updated as f64 / summary.total as f64 * 100.0
        };
        summary.finished_at = Utc::now();
        info!(
            total = summary.total,
            updated = summary.updated,
            not_found = summary.not_found,
            "coordinate supplement finished"
        );
        Ok(summary)
    }

    /// Coverage figures, paged through the store so the table is never loaded whole.
    pub async fn coordinate_statistics(&self) -> Result<CoordinateStatistics, SyncError> {
        let processor = StreamingBatchProcessor::new(
            Arc::new(BatchProgress::default()),
            CancellationToken::new(),
        );
        let batch = processor
            .run_batch(
                |offset, limit| async move {
                    self.store
                        .find_page(offset, limit)
                        .await
                        .map_err(SyncError::from)
                },
                self.settings.stats_page_size,
                |page: Vec<PersistedStation>| async move {
                    CoordinateStatistics::collect(&page).with_coordinates
                },
            )
            .await?;
        let stats = CoordinateStatistics {
            total: batch.total,
            with_coordinates: batch.processed,
            missing_coordinates: batch.total - batch.processed,
        };
        info!(
            total = stats.total,
            with_coordinates = stats.with_coordinates,
            completion_rate = stats.completion_rate(),
            "coordinate coverage"
        );
        Ok(stats)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
