use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::json;
use tracing::{debug, info};

use crate::completion::{GeminiClient, TextCompletion};
use crate::config::AppConfig;
use crate::diagnostics::{Diagnostics, Stage};
use crate::errors::AppResult;
use crate::geocoding::{GeocodingService, GoogleGeocodingClient};
use crate::normalizer::AddressNormalizer;
use crate::quota::{QuotaState, QuotaStore};
use crate::refiner::CoordinateRefiner;
use crate::resolver::{CoordinateResolver, Resolution};
use crate::table::AddressRecord;

/// Terminal state of one record after a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOutcome {
    Done,
    SkippedQuota,
    SkippedNotFound,
    NotReached,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutputRecord {
    pub record: AddressRecord,
    pub normalized_address: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub outcome: RecordOutcome,
}

impl OutputRecord {
    fn pending(record: &AddressRecord) -> Self {
        Self {
            record: record.clone(),
            normalized_address: None,
            latitude: None,
            longitude: None,
            outcome: RecordOutcome::NotReached,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunStats {
    pub elapsed: Duration,
    pub success_count: usize,
    pub fail_count: usize,
    pub skipped_quota: usize,
    pub interrupted: usize,
    pub monthly_count: u32,
    pub halted_on_quota: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub outputs: Vec<OutputRecord>,
    pub stats: RunStats,
}

#[derive(Debug, Clone, Copy)]
pub struct RunProgress {
    pub total: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
}

pub type ProgressObserver = Arc<dyn Fn(RunProgress) + Send + Sync>;

/// External collaborators the pipeline talks to.
pub struct PipelineServices {
    pub normalize: Arc<dyn TextCompletion>,
    pub refine: Arc<dyn TextCompletion>,
    pub geocoder: Arc<dyn GeocodingService>,
}

pub struct GeocodePipeline {
    normalizer: AddressNormalizer,
    resolver: CoordinateResolver,
    refiner: CoordinateRefiner,
    quota_store: Arc<dyn QuotaStore>,
    request_limit: u32,
    diagnostics: Diagnostics,
}

impl GeocodePipeline {
    pub fn new(
        services: PipelineServices,
        quota_store: Arc<dyn QuotaStore>,
        country: &str,
        request_limit: u32,
        diagnostics: Diagnostics,
    ) -> Self {
        Self {
            normalizer: AddressNormalizer::new(services.normalize, diagnostics.clone()),
            resolver: CoordinateResolver::new(services.geocoder, country, diagnostics.clone()),
            refiner: CoordinateRefiner::new(services.refine, diagnostics.clone()),
            quota_store,
            request_limit,
            diagnostics,
        }
    }

    /// Builds the HTTP-backed pipeline. Fails only when credentials are missing
    /// or an HTTP client cannot be constructed.
    pub fn from_config(
        config: &AppConfig,
        quota_store: Arc<dyn QuotaStore>,
        diagnostics: Diagnostics,
    ) -> AppResult<Self> {
        let (gemini_key, maps_key) = config.require_credentials()?;
        let services = PipelineServices {
            normalize: Arc::new(GeminiClient::for_model(
                config,
                &config.normalize_model,
                gemini_key.clone(),
            )?),
            refine: Arc::new(GeminiClient::for_model(
                config,
                &config.refine_model,
                gemini_key,
            )?),
            geocoder: Arc::new(GoogleGeocodingClient::from_config(config, maps_key)?),
        };
        Ok(Self::new(
            services,
            quota_store,
            &config.country,
            config.request_limit,
            diagnostics,
        ))
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn quota(&self) -> QuotaState {
        self.quota_store.load()
    }

    /// Processes records strictly in order, one external call at a time.
    ///
    /// The quota counter is persisted after every geocoding attempt. Reaching
    /// the ceiling stops the run and leaves the remaining records untouched;
    /// `cancel` does the same between records.
    pub async fn run(
        &self,
        records: &[AddressRecord],
        observer: Option<ProgressObserver>,
        cancel: Option<Arc<AtomicBool>>,
    ) -> RunReport {
        let started = Instant::now();
        let mut quota = self.quota_store.load();
        let mut outputs: Vec<OutputRecord> = records.iter().map(OutputRecord::pending).collect();
        let mut stats = RunStats {
            elapsed: Duration::ZERO,
            success_count: 0,
            fail_count: 0,
            skipped_quota: 0,
            interrupted: 0,
            monthly_count: quota.count,
            halted_on_quota: false,
        };

        self.diagnostics.journal_event(
            "run_started",
            json!({
                "records": records.len(),
                "month": quota.month,
                "count": quota.count,
                "limit": self.request_limit,
            }),
        );
        info!(
            records = records.len(),
            month = %quota.month,
            count = quota.count,
            limit = self.request_limit,
            "starting geocoding run"
        );

        let total = records.len();
        for (position, record) in records.iter().enumerate() {
            if cancel
                .as_ref()
                .map(|flag| flag.load(Ordering::SeqCst))
                .unwrap_or(false)
            {
                stats.interrupted = total - position;
                info!(remaining = stats.interrupted, "run interrupted between records");
                break;
            }

            if quota.is_exhausted(self.request_limit) {
                for output in &mut outputs[position..] {
                    output.outcome = RecordOutcome::SkippedQuota;
                }
                stats.skipped_quota = total - position;
                stats.halted_on_quota = true;
                self.diagnostics.warn(
                    Stage::Quota,
                    format!(
                        "monthly geocoding request limit ({}) reached; {} record(s) left unprocessed",
                        self.request_limit, stats.skipped_quota
                    ),
                );
                break;
            }

            self.diagnostics.begin_row(record.index);
            let output = &mut outputs[position];
            self.process_record(record, output, &mut quota).await;
            match output.outcome {
                RecordOutcome::Done => stats.success_count += 1,
                RecordOutcome::SkippedNotFound => stats.fail_count += 1,
                RecordOutcome::SkippedQuota | RecordOutcome::NotReached => {}
            }
            self.diagnostics.end_row();

            if let Some(callback) = &observer {
                callback(RunProgress {
                    total,
                    processed: position + 1,
                    succeeded: stats.success_count,
                    failed: stats.fail_count,
                });
            }
        }

        stats.monthly_count = quota.count;
        stats.elapsed = started.elapsed();

        info!(
            success = stats.success_count,
            failed = stats.fail_count,
            skipped_quota = stats.skipped_quota,
            interrupted = stats.interrupted,
            monthly_count = stats.monthly_count,
            elapsed_ms = stats.elapsed.as_millis() as u64,
            "geocoding run finished"
        );
        self.diagnostics.journal_event(
            "run_completed",
            json!({
                "success_count": stats.success_count,
                "fail_count": stats.fail_count,
                "skipped_quota": stats.skipped_quota,
                "interrupted": stats.interrupted,
                "monthly_count": stats.monthly_count,
                "halted_on_quota": stats.halted_on_quota,
                "elapsed_ms": stats.elapsed.as_millis() as u64,
            }),
        );
        self.diagnostics.flush();

        RunReport { outputs, stats }
    }

    async fn process_record(
        &self,
        record: &AddressRecord,
        output: &mut OutputRecord,
        quota: &mut QuotaState,
    ) {
        let normalized = self.normalizer.normalize(&record.raw_address).await;
        info!(
            row = record.index,
            original = %record.raw_address,
            corrected = %normalized,
            "address corrected"
        );

        let resolution = self.resolver.resolve(&normalized).await;
        quota.increment();
        if let Err(err) = self.quota_store.save(quota) {
            self.diagnostics.error(
                Stage::Persistence,
                format!("failed to persist request count: {err}"),
            );
        }

        match resolution {
            Resolution::NotFound => {
                output.outcome = RecordOutcome::SkippedNotFound;
            }
            Resolution::Found(location) => {
                let (lat, lng) = self
                    .refiner
                    .refine(&record.raw_address, &normalized, location.lat, location.lng)
                    .await;
                debug!(
                    row = record.index,
                    geocoded_lat = location.lat,
                    geocoded_lng = location.lng,
                    lat,
                    lng,
                    "coordinates refined"
                );
                output.latitude = Some(lat);
                output.longitude = Some(lng);
                output.outcome = RecordOutcome::Done;
            }
        }
        output.normalized_address = Some(normalized);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::diagnostics::Severity;
    use crate::errors::{AppError, AppResult};
    use crate::geocoding::{GeocodeCandidate, LocationType};
    use crate::quota::{current_month, MemoryQuotaStore};

    struct EchoCompletion {
        reply: String,
        calls: Mutex<usize>,
    }

    impl EchoCompletion {
        fn new(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: reply.to_string(),
                calls: Mutex::new(0),
            })
        }

        fn calls(&self) -> usize {
            *self.calls.lock()
        }
    }

    #[async_trait]
    impl TextCompletion for EchoCompletion {
        async fn complete(&self, _prompt: &str) -> AppResult<String> {
            *self.calls.lock() += 1;
            Ok(self.reply.clone())
        }
    }

    struct QueuedGeocoder {
        replies: Mutex<VecDeque<AppResult<Vec<GeocodeCandidate>>>>,
        addresses: Mutex<Vec<String>>,
    }

    impl QueuedGeocoder {
        fn new(replies: Vec<AppResult<Vec<GeocodeCandidate>>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                addresses: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.addresses.lock().len()
        }
    }

    #[async_trait]
    impl GeocodingService for QueuedGeocoder {
        async fn geocode(
            &self,
            address: &str,
            _country: &str,
        ) -> AppResult<Vec<GeocodeCandidate>> {
            self.addresses.lock().push(address.to_string());
            self.replies
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(vec![rooftop(35.0, 139.0)]))
        }
    }

    fn rooftop(lat: f64, lng: f64) -> GeocodeCandidate {
        GeocodeCandidate::new(LocationType::Rooftop, lat, lng)
    }

    fn records(addresses: &[&str]) -> Vec<AddressRecord> {
        addresses
            .iter()
            .enumerate()
            .map(|(index, address)| AddressRecord {
                index,
                raw_address: address.to_string(),
            })
            .collect()
    }

    struct Harness {
        pipeline: GeocodePipeline,
        normalize: Arc<EchoCompletion>,
        refine: Arc<EchoCompletion>,
        geocoder: Arc<QueuedGeocoder>,
        store: Arc<MemoryQuotaStore>,
        diagnostics: Diagnostics,
    }

    fn harness(
        refine_reply: &str,
        replies: Vec<AppResult<Vec<GeocodeCandidate>>>,
        starting_count: u32,
        limit: u32,
    ) -> Harness {
        let normalize = EchoCompletion::new("");
        let refine = EchoCompletion::new(refine_reply);
        let geocoder = QueuedGeocoder::new(replies);
        let store = Arc::new(MemoryQuotaStore::with_state(QuotaState {
            month: current_month(),
            count: starting_count,
        }));
        let diagnostics = Diagnostics::new();
        let pipeline = GeocodePipeline::new(
            PipelineServices {
                normalize: normalize.clone(),
                refine: refine.clone(),
                geocoder: geocoder.clone(),
            },
            store.clone(),
            "JP",
            limit,
            diagnostics.clone(),
        );
        Harness {
            pipeline,
            normalize,
            refine,
            geocoder,
            store,
            diagnostics,
        }
    }

    #[tokio::test]
    async fn preserves_order_and_counts_each_call() {
        let h = harness(
            r#"{"lat": 1.5, "lng": 2.5}"#,
            vec![
                Ok(vec![rooftop(1.0, 2.0)]),
                Ok(Vec::new()),
                Err(AppError::Service {
                    service: "geocoding",
                    status: "UNKNOWN_ERROR".into(),
                    message: "try again".into(),
                }),
            ],
            10,
            9800,
        );

        let report = h.pipeline.run(&records(&["a", "b", "c", "d"]), None, None).await;

        let outcomes: Vec<_> = report.outputs.iter().map(|o| o.outcome).collect();
        assert_eq!(
            outcomes,
            vec![
                RecordOutcome::Done,
                RecordOutcome::SkippedNotFound,
                RecordOutcome::SkippedNotFound,
                RecordOutcome::Done,
            ]
        );
        let indexes: Vec<_> = report.outputs.iter().map(|o| o.record.index).collect();
        assert_eq!(indexes, vec![0, 1, 2, 3]);
        assert_eq!(report.outputs[0].latitude, Some(1.5));
        assert_eq!(report.outputs[1].latitude, None);
        assert_eq!(report.stats.success_count, 2);
        assert_eq!(report.stats.fail_count, 2);
        assert_eq!(report.stats.monthly_count, 14);
        assert_eq!(h.store.snapshot().unwrap().count, 14);
        assert_eq!(h.store.save_count(), 4);
        assert_eq!(h.refine.calls(), 2);
        assert_eq!(h.normalize.calls(), 4);
        assert_eq!(h.diagnostics.count(Severity::Error), 1);
    }

    #[tokio::test]
    async fn falls_back_to_raw_address_when_correction_is_empty() {
        let h = harness("not json", vec![Ok(vec![rooftop(35.6895, 139.6917)])], 0, 9800);

        let report = h.pipeline.run(&records(&["東京都千代田区1-1"]), None, None).await;

        assert_eq!(h.geocoder.addresses.lock()[0], "東京都千代田区1-1");
        assert_eq!(
            report.outputs[0].normalized_address.as_deref(),
            Some("東京都千代田区1-1")
        );
        assert_eq!(report.outputs[0].latitude, Some(35.6895));
        assert_eq!(report.outputs[0].longitude, Some(139.6917));
        assert!(h.diagnostics.is_empty());
    }

    #[tokio::test]
    async fn halts_when_quota_runs_out_mid_run() {
        let h = harness(r#"{"lat": 1.0, "lng": 1.0}"#, Vec::new(), 9798, 9800);

        let report = h.pipeline.run(&records(&["a", "b", "c", "d"]), None, None).await;

        assert_eq!(h.geocoder.calls(), 2);
        assert_eq!(h.normalize.calls(), 2);
        assert!(report.stats.halted_on_quota);
        assert_eq!(report.stats.skipped_quota, 2);
        assert_eq!(report.stats.monthly_count, 9800);
        assert_eq!(report.outputs[2].outcome, RecordOutcome::SkippedQuota);
        assert_eq!(report.outputs[3].outcome, RecordOutcome::SkippedQuota);
        assert!(report.outputs[3].latitude.is_none());
        let quota_warnings = h
            .diagnostics
            .entries()
            .into_iter()
            .filter(|entry| entry.stage == Stage::Quota)
            .count();
        assert_eq!(quota_warnings, 1);
    }

    #[tokio::test]
    async fn exhausted_quota_makes_no_calls() {
        let h = harness("", Vec::new(), 9800, 9800);

        let report = h.pipeline.run(&records(&["a", "b"]), None, None).await;

        assert_eq!(h.geocoder.calls(), 0);
        assert_eq!(h.normalize.calls(), 0);
        assert_eq!(h.refine.calls(), 0);
        assert_eq!(h.store.save_count(), 0);
        assert!(report
            .outputs
            .iter()
            .all(|o| o.latitude.is_none() && o.outcome == RecordOutcome::SkippedQuota));
    }

    #[tokio::test]
    async fn persistence_failures_do_not_stop_the_run() {
        let h = harness(r#"{"lat": 1.0, "lng": 1.0}"#, Vec::new(), 0, 9800);
        h.store.fail_saves(true);

        let report = h.pipeline.run(&records(&["a", "b"]), None, None).await;

        assert_eq!(report.stats.success_count, 2);
        assert_eq!(report.stats.monthly_count, 2);
        let persistence_errors = h
            .diagnostics
            .entries()
            .into_iter()
            .filter(|entry| entry.stage == Stage::Persistence)
            .count();
        assert_eq!(persistence_errors, 2);
    }

    #[tokio::test]
    async fn cancellation_stops_between_records() {
        let h = harness(r#"{"lat": 1.0, "lng": 1.0}"#, Vec::new(), 0, 9800);
        let cancel = Arc::new(AtomicBool::new(false));
        let trigger = cancel.clone();
        let observer: ProgressObserver = Arc::new(move |progress: RunProgress| {
            if progress.processed == 1 {
                trigger.store(true, Ordering::SeqCst);
            }
        });

        let report = h
            .pipeline
            .run(&records(&["a", "b", "c"]), Some(observer), Some(cancel))
            .await;

        assert_eq!(h.geocoder.calls(), 1);
        assert_eq!(report.stats.interrupted, 2);
        assert_eq!(report.outputs[1].outcome, RecordOutcome::NotReached);
        assert!(!report.stats.halted_on_quota);
    }

    #[tokio::test]
    async fn reports_progress_after_each_record() {
        let h = harness(r#"{"lat": 1.0, "lng": 1.0}"#, vec![Ok(Vec::new())], 0, 9800);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let observer: ProgressObserver = Arc::new(move |progress: RunProgress| {
            sink.lock()
                .push((progress.processed, progress.succeeded, progress.failed));
        });

        h.pipeline
            .run(&records(&["a", "b"]), Some(observer), None)
            .await;

        assert_eq!(seen.lock().clone(), vec![(1, 0, 1), (2, 1, 1)]);
    }

    #[tokio::test]
    async fn empty_input_touches_nothing() {
        let h = harness("", Vec::new(), 5, 9800);
        let report = h.pipeline.run(&[], None, None).await;
        assert!(report.outputs.is_empty());
        assert_eq!(report.stats.monthly_count, 5);
        assert_eq!(h.store.save_count(), 0);
    }
}
