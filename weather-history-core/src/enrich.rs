//! Batch enrichment: find the locations the store does not know yet and fetch
//! weather for them one at a time.
//!
//! There is no run-wide transaction. Each append is durable on its own, so an
//! interrupted run loses nothing and the next run resumes from the store.
//! A stored record is final even when some of its fields are missing.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use std::collections::HashSet;
use tracing::{info, warn};

use crate::{
    archive::RawArchive,
    model::{LocationSummary, WeatherSummary},
    provider::WeatherSource,
    rate::{RateController, RateError},
    store::WeatherStore,
};

/// Counts from one [`Enricher::run`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    /// Locations handed to the run.
    pub locations: usize,
    pub already_enriched: usize,
    /// Distinct locations missing from the store at the start of the run.
    pub pending: usize,
    /// Provider calls made (bounded by the iteration cutoff).
    pub attempted: usize,
    pub enriched: usize,
    /// Enriched locations stored with at least one field missing.
    pub partial: usize,
    pub failed: usize,
    /// Locations still missing from the store after the run.
    pub remaining: usize,
    pub cancelled: bool,
}

#[derive(Debug)]
pub struct Enricher<S: WeatherStore> {
    store: S,
    source: Box<dyn WeatherSource>,
    rate: RateController,
    max_iterations: Option<usize>,
    archive: Option<RawArchive>,
}

impl<S: WeatherStore> Enricher<S> {
    pub fn new(store: S, source: Box<dyn WeatherSource>, rate: RateController) -> Self {
        Self {
            store,
            source,
            rate,
            max_iterations: None,
            archive: None,
        }
    }

    /// Stop after this many provider calls; the rest stays pending.
    pub fn with_max_iterations(mut self, max_iterations: Option<usize>) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_archive(mut self, archive: Option<RawArchive>) -> Self {
        self.archive = archive;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Locations the store has no record for, in input order, each key once.
    pub fn pending(&self, locations: &[LocationSummary]) -> Result<Vec<LocationSummary>> {
        Ok(self.split(locations)?.0)
    }

    /// Pending locations plus the number of input locations already stored.
    fn split(&self, locations: &[LocationSummary]) -> Result<(Vec<LocationSummary>, usize)> {
        let keys = self.store.keys()?;
        let stored: HashSet<KeyId> = keys.iter().map(KeyId::from).collect();

        let mut queued = HashSet::new();
        let mut pending = Vec::new();
        let mut already_enriched = 0;
        for location in locations {
            let id = KeyId::from(location);
            if stored.contains(&id) {
                already_enriched += 1;
            } else if queued.insert(id) {
                pending.push(location.clone());
            }
        }

        Ok((pending, already_enriched))
    }

    pub async fn run(&mut self, locations: &[LocationSummary]) -> Result<RunReport> {
        let (pending, already_enriched) = self.split(locations)?;

        info!(
            provider = %self.source.id(),
            locations = locations.len(),
            already_enriched,
            pending = pending.len(),
            "starting enrichment run"
        );

        let mut report = RunReport {
            locations: locations.len(),
            already_enriched,
            pending: pending.len(),
            ..Default::default()
        };

        for key in &pending {
            if self.max_iterations.is_some_and(|max| report.attempted >= max) {
                info!(attempted = report.attempted, "iteration cutoff reached");
                break;
            }

            if let Err(RateError::Cancelled) = self.rate.acquire().await {
                info!(attempted = report.attempted, "enrichment run cancelled");
                report.cancelled = true;
                break;
            }

            report.attempted += 1;

            let summary = match self.fetch(key).await {
                Ok(summary) => summary,
                Err(err) => {
                    warn!(location = %key, error = %format!("{err:#}"), "fetch failed, location stays pending");
                    report.failed += 1;
                    continue;
                }
            };

            self.store
                .append(&summary, key)
                .with_context(|| format!("Failed to store weather for {key}"))?;
            report.enriched += 1;

            let missing = summary.missing_fields();
            if !missing.is_empty() {
                report.partial += 1;
                info!(location = %key, ?missing, "stored partial weather summary");
            }
        }

        report.remaining = report.pending - report.enriched;

        info!(
            attempted = report.attempted,
            enriched = report.enriched,
            partial = report.partial,
            failed = report.failed,
            remaining = report.remaining,
            "enrichment run finished"
        );

        Ok(report)
    }

    async fn fetch(&self, key: &LocationSummary) -> Result<WeatherSummary> {
        let Some(archive) = &self.archive else {
            return self.source.fetch_and_normalize(key).await;
        };

        let raw = self.source.fetch_raw(key).await?;
        if let Err(err) = archive.store(key, &raw) {
            warn!(location = %key, error = %format!("{err:#}"), "could not archive raw payload");
        }

        self.source.parse_and_normalize(&raw)
    }
}

/// Hashable view of a store key. Coordinates compare like `f64` does for
/// the finite values a store holds.
#[derive(PartialEq, Eq, Hash)]
struct KeyId<'a> {
    subject_id: &'a str,
    latitude: u64,
    longitude: u64,
    date: NaiveDate,
}

impl<'a> From<&'a LocationSummary> for KeyId<'a> {
    fn from(key: &'a LocationSummary) -> Self {
        // -0.0 == 0.0, so both map to the same bits.
        let bits = |value: f64| if value == 0.0 { 0 } else { value.to_bits() };

        Self {
            subject_id: &key.subject_id,
            latitude: bits(key.latitude),
            longitude: bits(key.longitude),
            date: key.date,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        provider::ProviderId,
        rate::RateLimits,
        store::CsvWeatherStore,
    };
    use anyhow::bail;
    use async_trait::async_trait;
    use reqwest::Url;
    use serde_json::Value;
    use std::{
        cell::Cell,
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
    };
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    /// Serves canned bodies; subjects starting with `fail` get a transport error.
    #[derive(Debug, Clone)]
    struct FakeSource {
        calls: Arc<AtomicUsize>,
        body: &'static str,
    }

    impl FakeSource {
        fn new(body: &'static str) -> Self {
            Self {
                calls: Arc::new(AtomicUsize::new(0)),
                body,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl WeatherSource for FakeSource {
        fn id(&self) -> ProviderId {
            ProviderId::DarkSky
        }

        fn build_request(&self, key: &LocationSummary) -> Result<Url> {
            Ok(Url::parse(&format!("http://fake/{}", key.subject_id))?)
        }

        fn normalize(&self, body: &Value) -> WeatherSummary {
            crate::provider::darksky::normalize(body)
        }

        async fn fetch_raw(&self, key: &LocationSummary) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if key.subject_id.starts_with("fail") {
                bail!("connection reset");
            }
            Ok(self.body.to_string())
        }
    }

    const FULL: &str = r#"{
        "daily": { "data": [{ "temperatureHigh": 90.4, "temperatureLow": 63.9,
                              "apparentTemperatureHigh": 96.4, "apparentTemperatureLow": 63.4 }] },
        "hourly": { "data": [{ "temperature": 75.0, "apparentTemperature": 80.0, "precipIntensity": 0.1 }] }
    }"#;

    const DAILY_ONLY: &str = r#"{ "daily": { "data": [{ "temperatureHigh": 90.4, "temperatureLow": 63.9 }] } }"#;

    fn loc(subject: &str, day: u32) -> LocationSummary {
        LocationSummary::new(subject, 40.7, -73.9, NaiveDate::from_ymd_opt(2018, 9, day).unwrap())
    }

    fn enricher(dir: &TempDir, source: &FakeSource) -> Enricher<CsvWeatherStore> {
        let store = CsvWeatherStore::open(dir.path().join("weather.csv")).unwrap();
        Enricher::new(store, Box::new(source.clone()), RateController::new(RateLimits::unlimited()))
    }

    #[tokio::test]
    async fn enriches_pending_and_skips_them_on_rerun() {
        let dir = TempDir::new().unwrap();
        let source = FakeSource::new(FULL);
        let locations = vec![loc("1", 12), loc("1", 13), loc("2", 12)];

        let report = enricher(&dir, &source).run(&locations).await.unwrap();
        assert_eq!(report.pending, 3);
        assert_eq!(report.enriched, 3);
        assert_eq!(report.remaining, 0);
        assert_eq!(source.calls(), 3);

        let mut second = enricher(&dir, &source);
        let report = second.run(&locations).await.unwrap();
        assert_eq!(report.already_enriched, 3);
        assert_eq!(report.pending, 0);
        assert_eq!(source.calls(), 3);
        assert_eq!(second.store().records().unwrap().count(), 3);

        let stored = second.store().lookup(&loc("1", 13)).unwrap().unwrap();
        assert_eq!(stored.max_temp, Some(90.4));
        assert_eq!(stored.mean_temp, Some(75.0));
    }

    /// Counts how the enricher reads the store.
    #[derive(Debug)]
    struct CountingStore {
        inner: CsvWeatherStore,
        lookups: Cell<usize>,
        key_scans: Cell<usize>,
    }

    impl WeatherStore for CountingStore {
        fn lookup(&self, key: &LocationSummary) -> Result<Option<WeatherSummary>> {
            self.lookups.set(self.lookups.get() + 1);
            self.inner.lookup(key)
        }

        fn keys(&self) -> Result<Vec<LocationSummary>> {
            self.key_scans.set(self.key_scans.get() + 1);
            self.inner.keys()
        }

        fn append(&mut self, summary: &WeatherSummary, key: &LocationSummary) -> Result<()> {
            self.inner.append(summary, key)
        }
    }

    #[tokio::test]
    async fn pending_reads_the_store_once() {
        let dir = TempDir::new().unwrap();
        let mut inner = CsvWeatherStore::open(dir.path().join("weather.csv")).unwrap();
        inner.append(&WeatherSummary::default(), &loc("1", 12)).unwrap();
        inner.append(&WeatherSummary::default(), &loc("1", 13)).unwrap();

        let store = CountingStore {
            inner,
            lookups: Cell::new(0),
            key_scans: Cell::new(0),
        };
        let source = FakeSource::new(FULL);
        let mut enricher = Enricher::new(
            store,
            Box::new(source.clone()),
            RateController::new(RateLimits::unlimited()),
        );

        let locations = vec![loc("1", 12), loc("2", 12), loc("1", 13), loc("2", 12), loc("1", 12)];
        let report = enricher.run(&locations).await.unwrap();

        assert_eq!(report.already_enriched, 3);
        assert_eq!(report.pending, 1);
        assert_eq!(source.calls(), 1);
        assert_eq!(enricher.store().key_scans.get(), 1);
        assert_eq!(enricher.store().lookups.get(), 0);
    }

    #[test]
    fn signed_zero_coordinates_are_one_key() {
        let date = NaiveDate::from_ymd_opt(2018, 9, 12).unwrap();
        let positive = LocationSummary::new("1", 0.0, 10.0, date);
        let negative = LocationSummary::new("1", -0.0, 10.0, date);

        assert_eq!(positive, negative);
        assert!(KeyId::from(&positive) == KeyId::from(&negative));
    }

    #[tokio::test]
    async fn repeated_input_key_is_fetched_once() {
        let dir = TempDir::new().unwrap();
        let source = FakeSource::new(FULL);
        let locations = vec![loc("1", 12), loc("1", 12)];

        let mut enricher = enricher(&dir, &source);
        let report = enricher.run(&locations).await.unwrap();

        assert_eq!(report.pending, 1);
        assert_eq!(source.calls(), 1);
        assert_eq!(enricher.store().records().unwrap().count(), 1);
    }

    #[tokio::test]
    async fn failed_fetch_stays_pending_for_next_run() {
        let dir = TempDir::new().unwrap();
        let source = FakeSource::new(FULL);
        let locations = vec![loc("fail-1", 12), loc("2", 12)];

        let report = enricher(&dir, &source).run(&locations).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.enriched, 1);
        assert_eq!(report.remaining, 1);

        let mut retry = enricher(&dir, &source);
        assert_eq!(retry.pending(&locations).unwrap(), vec![loc("fail-1", 12)]);
        let report = retry.run(&locations).await.unwrap();
        assert_eq!(report.attempted, 1);
    }

    #[tokio::test]
    async fn partial_summary_is_stored_and_never_refetched() {
        let dir = TempDir::new().unwrap();
        let source = FakeSource::new(DAILY_ONLY);
        let locations = vec![loc("1", 12)];

        let report = enricher(&dir, &source).run(&locations).await.unwrap();
        assert_eq!(report.partial, 1);

        let mut second = enricher(&dir, &source);
        second.run(&locations).await.unwrap();
        assert_eq!(source.calls(), 1);

        let stored = second.store().lookup(&loc("1", 12)).unwrap().unwrap();
        assert_eq!(stored.max_temp, Some(90.4));
        assert_eq!(stored.min_temp, Some(63.9));
        assert_eq!(stored.mean_temp, None);
    }

    #[tokio::test]
    async fn iteration_cutoff_allows_resuming() {
        let dir = TempDir::new().unwrap();
        let source = FakeSource::new(FULL);
        let locations: Vec<_> = (1..=5).map(|day| loc("1", day)).collect();

        let report = enricher(&dir, &source)
            .with_max_iterations(Some(2))
            .run(&locations)
            .await
            .unwrap();
        assert_eq!(report.attempted, 2);
        assert_eq!(report.remaining, 3);

        let report = enricher(&dir, &source).run(&locations).await.unwrap();
        assert_eq!(report.already_enriched, 2);
        assert_eq!(report.enriched, 3);
        assert_eq!(source.calls(), 5);
    }

    #[tokio::test]
    async fn cancelled_run_stops_before_fetching() {
        let dir = TempDir::new().unwrap();
        let source = FakeSource::new(FULL);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let store = CsvWeatherStore::open(dir.path().join("weather.csv")).unwrap();
        let rate = RateController::new(RateLimits::unlimited()).with_cancellation(cancel);
        let mut enricher = Enricher::new(store, Box::new(source.clone()), rate);

        let report = enricher.run(&[loc("1", 12)]).await.unwrap();

        assert!(report.cancelled);
        assert_eq!(report.remaining, 1);
        assert_eq!(source.calls(), 0);
    }

    #[tokio::test]
    async fn unparseable_body_counts_as_failure() {
        let dir = TempDir::new().unwrap();
        let source = FakeSource::new("<html>502 Bad Gateway</html>");

        let mut enricher = enricher(&dir, &source);
        let report = enricher.run(&[loc("1", 12)]).await.unwrap();

        assert_eq!(report.failed, 1);
        assert!(enricher.store().lookup(&loc("1", 12)).unwrap().is_none());
    }

    #[tokio::test]
    async fn archives_raw_payloads() {
        let dir = TempDir::new().unwrap();
        let source = FakeSource::new(FULL);
        let archive = RawArchive::new(dir.path().join("raw"));

        let mut enricher = enricher(&dir, &source).with_archive(Some(archive.clone()));
        enricher.run(&[loc("1", 12)]).await.unwrap();

        let saved = std::fs::read_to_string(archive.file_for(&loc("1", 12))).unwrap();
        assert_eq!(saved, FULL);
        assert!(enricher.store().lookup(&loc("1", 12)).unwrap().is_some());
    }
}
