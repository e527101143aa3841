//! Cache-first, retried lookups of every unique place against both sources.

use futures::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, warn, Instrument};
use vinloc_adapters::SourcePair;
use vinloc_core::{Coordinate, GeoSource, LookupStatus, PlaceName, SourceLookup};
use vinloc_storage::{retry_with_backoff, BackoffPolicy, CacheError, CacheLookup, Clock, GeocodeCache};

#[derive(Debug, Clone, Copy)]
pub struct ResolverConfig {
    /// Places resolved concurrently.
    pub workers: usize,
    pub backoff: BackoffPolicy,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// A source that stayed unreachable for a place after every retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupFailure {
    pub place: String,
    pub source: GeoSource,
    pub backend: String,
    pub attempts: usize,
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct PlaceResolution {
    pub place: PlaceName,
    pub primary: Option<Coordinate>,
    pub secondary: Option<Coordinate>,
    pub primary_lookup: SourceLookup,
    pub secondary_lookup: SourceLookup,
    pub failures: Vec<LookupFailure>,
}

#[derive(Debug, Clone, Default)]
pub struct ResolveOutcome {
    /// Same order as the input places.
    pub resolutions: Vec<PlaceResolution>,
    pub cache_hits: usize,
    pub source_queries: usize,
}

impl ResolveOutcome {
    pub fn failures(&self) -> impl Iterator<Item = &LookupFailure> {
        self.resolutions.iter().flat_map(|r| r.failures.iter())
    }
}

struct SourceAnswer {
    coord: Option<Coordinate>,
    lookup: SourceLookup,
    failure: Option<LookupFailure>,
}

/// Resolve every place against both sources.
///
/// Lookup failures are recorded per place and never stop the run. A cache
/// read or write failure aborts immediately; in-flight lookups are dropped.
pub async fn resolve_places(
    places: &[PlaceName],
    sources: &SourcePair,
    cache: &Mutex<GeocodeCache>,
    clock: &dyn Clock,
    config: &ResolverConfig,
) -> Result<ResolveOutcome, CacheError> {
    let backoff = config.backoff;
    let mut indexed: Vec<(usize, PlaceResolution)> = stream::iter(places.iter().enumerate().map(
        |(idx, place)| async move {
            resolve_place(place, sources, cache, clock, backoff)
                .await
                .map(|r| (idx, r))
        },
    ))
    .buffer_unordered(config.workers.max(1))
    .try_collect()
    .await?;
    indexed.sort_by_key(|(idx, _)| *idx);

    let mut outcome = ResolveOutcome::default();
    for (_, resolution) in indexed {
        for lookup in [resolution.primary_lookup, resolution.secondary_lookup] {
            if lookup.from_cache {
                outcome.cache_hits += 1;
            } else {
                outcome.source_queries += 1;
            }
        }
        outcome.resolutions.push(resolution);
    }

    info!(
        places = places.len(),
        cache_hits = outcome.cache_hits,
        source_queries = outcome.source_queries,
        failures = outcome.failures().count(),
        "resolved places"
    );
    Ok(outcome)
}

async fn resolve_place(
    place: &PlaceName,
    sources: &SourcePair,
    cache: &Mutex<GeocodeCache>,
    clock: &dyn Clock,
    backoff: BackoffPolicy,
) -> Result<PlaceResolution, CacheError> {
    let span = info_span!("geocode", place = place.as_str());
    async move {
        let primary = resolve_source(place, GeoSource::Primary, sources, cache, clock, backoff).await?;
        let secondary =
            resolve_source(place, GeoSource::Secondary, sources, cache, clock, backoff).await?;

        Ok(PlaceResolution {
            place: place.clone(),
            primary: primary.coord,
            secondary: secondary.coord,
            primary_lookup: primary.lookup,
            secondary_lookup: secondary.lookup,
            failures: primary.failure.into_iter().chain(secondary.failure).collect(),
        })
    }
    .instrument(span)
    .await
}

async fn resolve_source(
    place: &PlaceName,
    source: GeoSource,
    sources: &SourcePair,
    cache: &Mutex<GeocodeCache>,
    clock: &dyn Clock,
    backoff: BackoffPolicy,
) -> Result<SourceAnswer, CacheError> {
    let cached = cache.lock().await.get(place, source);
    if let CacheLookup::Hit(coord) = cached {
        debug!(%source, hit = coord.is_some(), "cache hit");
        return Ok(SourceAnswer {
            coord,
            lookup: SourceLookup {
                status: status_for(coord),
                from_cache: true,
            },
            failure: None,
        });
    }

    let adapter = sources.get(source);
    let result = retry_with_backoff(backoff, clock, |attempt| async move {
        debug!(%source, backend = adapter.backend(), attempt, "querying source");
        adapter.resolve(place).await
    })
    .await;

    match result {
        Ok(coord) => {
            cache.lock().await.put(place, source, coord).await?;
            if coord.is_none() {
                debug!(%source, backend = adapter.backend(), "source has no result");
            }
            Ok(SourceAnswer {
                coord,
                lookup: SourceLookup {
                    status: status_for(coord),
                    from_cache: false,
                },
                failure: None,
            })
        }
        Err(exhausted) => {
            warn!(
                %source,
                backend = adapter.backend(),
                attempts = exhausted.attempts,
                error = %exhausted.last_error,
                "source unavailable after retries"
            );
            Ok(SourceAnswer {
                coord: None,
                lookup: SourceLookup::unavailable(),
                failure: Some(LookupFailure {
                    place: place.as_str().to_string(),
                    source,
                    backend: adapter.backend().to_string(),
                    attempts: exhausted.attempts,
                    error: exhausted.last_error.to_string(),
                }),
            })
        }
    }
}

fn status_for(coord: Option<Coordinate>) -> LookupStatus {
    if coord.is_some() {
        LookupStatus::Resolved
    } else {
        LookupStatus::NoResult
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use tempfile::tempdir;
    use vinloc_adapters::{CoordinateSource, FixtureSource, LookupError};
    use vinloc_storage::{CachePolicy, RecordingClock};

    /// Fails the first `failures` calls per place, then answers from `answers`.
    struct FlakySource {
        answers: HashMap<String, Option<Coordinate>>,
        failures: usize,
        calls: Arc<AtomicUsize>,
        seen: std::sync::Mutex<HashMap<String, usize>>,
    }

    impl FlakySource {
        fn new(answers: &[(&str, Option<Coordinate>)], failures: usize, calls: Arc<AtomicUsize>) -> Self {
            Self {
                answers: answers
                    .iter()
                    .map(|(p, c)| (p.to_lowercase(), *c))
                    .collect(),
                failures,
                calls,
                seen: std::sync::Mutex::new(HashMap::new()),
            }
        }
    }

    #[async_trait]
    impl CoordinateSource for FlakySource {
        fn backend(&self) -> &str {
            "flaky"
        }

        async fn resolve(&self, place: &PlaceName) -> Result<Option<Coordinate>, LookupError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let n = {
                let mut seen = self.seen.lock().expect("lock");
                let n = seen.entry(place.key().to_string()).or_default();
                *n += 1;
                *n
            };
            if n <= self.failures {
                return Err(LookupError::MalformedPayload(format!("flake {n}")));
            }
            Ok(self.answers.get(place.key()).copied().flatten())
        }
    }

    fn coord(lat: f64, lon: f64) -> Coordinate {
        Coordinate::new(lat, lon).expect("coordinate")
    }

    fn place(name: &str) -> PlaceName {
        PlaceName::new(name).expect("place")
    }

    fn policy() -> ResolverConfig {
        ResolverConfig {
            workers: 2,
            backoff: BackoffPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(50),
                max_delay: Duration::from_secs(1),
            },
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried_and_results_cached() {
        let dir = tempdir().expect("tempdir");
        let cache = Mutex::new(
            GeocodeCache::open(dir.path().join("cache.jsonl"), CachePolicy::default())
                .await
                .expect("open"),
        );
        let primary_calls = Arc::new(AtomicUsize::new(0));
        let sources = SourcePair::new(
            Box::new(FlakySource::new(
                &[("Douro, Portugal", Some(coord(41.16, -7.78)))],
                2,
                primary_calls.clone(),
            )),
            Box::new(FixtureSource::new("fixture", Vec::<(String, Option<Coordinate>)>::new())),
        );
        let clock = RecordingClock::new();
        let places = vec![place("Douro, Portugal")];

        let outcome = resolve_places(&places, &sources, &cache, &clock, &policy())
            .await
            .expect("resolve");
        let r = &outcome.resolutions[0];
        assert_eq!(r.primary, Some(coord(41.16, -7.78)));
        assert_eq!(r.primary_lookup.status, LookupStatus::Resolved);
        assert_eq!(r.secondary_lookup.status, LookupStatus::NoResult);
        assert!(r.failures.is_empty());
        assert_eq!(primary_calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_millis(50), Duration::from_millis(100)]
        );

        let again = resolve_places(&places, &sources, &cache, &clock, &policy())
            .await
            .expect("resolve again");
        assert_eq!(primary_calls.load(Ordering::SeqCst), 3);
        assert_eq!(again.cache_hits, 2);
        assert_eq!(again.source_queries, 0);
        assert!(again.resolutions[0].primary_lookup.from_cache);

        cache.into_inner().close().await.expect("close");
    }

    #[tokio::test]
    async fn exhausted_sources_are_unavailable_and_not_cached() {
        let dir = tempdir().expect("tempdir");
        let cache = Mutex::new(
            GeocodeCache::open(dir.path().join("cache.jsonl"), CachePolicy::default())
                .await
                .expect("open"),
        );
        let calls = Arc::new(AtomicUsize::new(0));
        let sources = SourcePair::new(
            Box::new(FlakySource::new(&[], usize::MAX, calls.clone())),
            Box::new(FixtureSource::new(
                "fixture",
                vec![("Mosel, Germany".to_string(), Some(coord(49.97, 7.11)))],
            )),
        );
        let clock = RecordingClock::new();
        let places = vec![place("Mosel, Germany"), place("Atlantis")];

        let outcome = resolve_places(&places, &sources, &cache, &clock, &policy())
            .await
            .expect("resolve");
        assert_eq!(outcome.resolutions.len(), 2);
        assert_eq!(outcome.resolutions[0].place.as_str(), "Mosel, Germany");
        assert_eq!(outcome.resolutions[0].secondary, Some(coord(49.97, 7.11)));
        assert_eq!(
            outcome.resolutions[0].primary_lookup.status,
            LookupStatus::Unavailable
        );
        assert_eq!(outcome.failures().count(), 2);
        assert!(outcome.failures().all(|f| f.attempts == 3 && f.source == GeoSource::Primary));
        assert_eq!(calls.load(Ordering::SeqCst), 6);

        let guard = cache.lock().await;
        assert_eq!(guard.get(&places[0], GeoSource::Primary), CacheLookup::Miss);
        assert_eq!(guard.get(&places[1], GeoSource::Secondary), CacheLookup::Hit(None));
        drop(guard);
        cache.into_inner().close().await.expect("close");
    }

    #[tokio::test]
    async fn definitive_nulls_are_not_retried() {
        let dir = tempdir().expect("tempdir");
        let cache = Mutex::new(
            GeocodeCache::open(dir.path().join("cache.jsonl"), CachePolicy::default())
                .await
                .expect("open"),
        );
        let calls = Arc::new(AtomicUsize::new(0));
        let sources = SourcePair::new(
            Box::new(FlakySource::new(&[], 0, calls.clone())),
            Box::new(FixtureSource::new("fixture", Vec::<(String, Option<Coordinate>)>::new())),
        );
        let clock = RecordingClock::new();

        resolve_places(&[place("Nowhere")], &sources, &cache, &clock, &policy())
            .await
            .expect("resolve");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(clock.sleeps().is_empty());
        cache.into_inner().close().await.expect("close");
    }

    #[tokio::test]
    async fn cache_write_failure_aborts_resolution() {
        let dir = tempdir().expect("tempdir");
        let journal = dir.path().join("cache.jsonl");
        let cache = Mutex::new(
            GeocodeCache::open(&journal, CachePolicy::default())
                .await
                .expect("open"),
        );
        std::fs::create_dir(&journal).expect("replace journal with a directory");

        let sources = SourcePair::new(
            Box::new(FixtureSource::new(
                "fixture",
                vec![("Rioja, Spain".to_string(), Some(coord(42.46, -2.44)))],
            )),
            Box::new(FixtureSource::new("fixture", Vec::<(String, Option<Coordinate>)>::new())),
        );
        let clock = RecordingClock::new();

        let err = resolve_places(&[place("Rioja, Spain")], &sources, &cache, &clock, &policy())
            .await
            .expect_err("write failure must abort");
        match err {
            CacheError::Io { path, action, .. } => {
                assert_eq!(path, journal);
                assert_eq!(action, "opening cache journal");
            }
            other => panic!("unexpected cache error: {other}"),
        }
    }
}
