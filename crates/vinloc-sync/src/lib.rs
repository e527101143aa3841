//! Run pipeline: dedupe, resolve, reconcile, summarize, report.

pub mod dedup;
pub mod quality;
pub mod reconcile;
pub mod reports;
pub mod resolve;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;
use vinloc_adapters::{fixture_source_pair, live_source_pair, SourcePair, SourceSettings, DEFAULT_USER_AGENT};
use vinloc_core::{RawWineInput, RawWineRecord};
use vinloc_storage::{BackoffPolicy, CachePolicy, CacheStats, Clock, GeocodeCache, TokioClock};

pub use dedup::{dedupe, unique_places, DedupConfig, DedupOutcome, Deduplicator, PlaceReviewItem};
pub use quality::{country_breakdown, summarize, CountryStats, QualityConfig, QualityReport};
pub use reconcile::{ReconcileConfig, Reconciler, DEFAULT_DIVERGENCE_THRESHOLD_KM};
pub use reports::{report_markdown, write_reports, ReportPaths, RunOutput, RunRecord};
pub use resolve::{resolve_places, LookupFailure, ResolveOutcome, ResolverConfig};

pub const CRATE_NAME: &str = "vinloc-sync";

pub const DEFAULT_FIXTURE_SOURCES_DIR: &str = "fixtures/sources";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceMode {
    /// Gazetteer + encyclopedia over HTTP.
    Live,
    /// `primary.json` / `secondary.json` fixture maps in this directory.
    Fixtures(PathBuf),
}

impl SourceMode {
    pub fn label(&self) -> &'static str {
        match self {
            SourceMode::Live => "live",
            SourceMode::Fixtures(_) => "fixtures",
        }
    }
}

#[derive(Debug, Clone)]
pub struct GeocodeConfig {
    pub input_path: PathBuf,
    pub cache_path: PathBuf,
    pub workspace_root: PathBuf,
    pub user_agent: String,
    /// Overrides the per-source timeouts when set.
    pub http_timeout_secs: Option<u64>,
    pub divergence_threshold_km: f64,
    pub top_k: usize,
    pub workers: usize,
    /// `None` keeps cached "no result" answers forever.
    pub null_ttl_days: Option<i64>,
    pub source_mode: SourceMode,
}

impl GeocodeConfig {
    pub fn from_env() -> Self {
        let workspace_root = std::env::var("VINLOC_WORKSPACE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        let source_mode = match std::env::var("VINLOC_SOURCES").as_deref() {
            Ok("live") => SourceMode::Live,
            Ok("fixtures") | Err(_) => {
                SourceMode::Fixtures(workspace_root.join(DEFAULT_FIXTURE_SOURCES_DIR))
            }
            Ok(other) => {
                warn!(value = other, "unknown VINLOC_SOURCES value; using fixtures");
                SourceMode::Fixtures(workspace_root.join(DEFAULT_FIXTURE_SOURCES_DIR))
            }
        };
        Self {
            input_path: std::env::var("VINLOC_INPUT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| workspace_root.join("fixtures").join("wines.json")),
            cache_path: std::env::var("VINLOC_CACHE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| workspace_root.join("cache").join("geocode_cache.jsonl")),
            user_agent: std::env::var("VINLOC_USER_AGENT")
                .unwrap_or_else(|_| DEFAULT_USER_AGENT.to_string()),
            http_timeout_secs: env_parse("VINLOC_HTTP_TIMEOUT_SECS"),
            divergence_threshold_km: env_parse("VINLOC_DIVERGENCE_KM")
                .unwrap_or(DEFAULT_DIVERGENCE_THRESHOLD_KM),
            top_k: env_parse("VINLOC_TOP_K").unwrap_or(QualityConfig::default().top_k),
            workers: env_parse("VINLOC_WORKERS").unwrap_or(ResolverConfig::default().workers),
            null_ttl_days: env_parse("VINLOC_NULL_TTL_DAYS"),
            source_mode,
            workspace_root,
        }
    }

    pub fn cache_policy(&self) -> Result<CachePolicy> {
        let null_ttl = match self.null_ttl_days {
            None => None,
            Some(days) if days < 0 => {
                anyhow::bail!("VINLOC_NULL_TTL_DAYS must not be negative (got {days})")
            }
            Some(days) => Some(chrono::TimeDelta::try_days(days).with_context(|| {
                format!("VINLOC_NULL_TTL_DAYS is out of range (got {days})")
            })?),
        };
        Ok(CachePolicy { null_ttl })
    }

    /// Rejects settings that would make a run meaningless or panic later.
    pub fn validate(&self) -> Result<()> {
        let km = self.divergence_threshold_km;
        if !km.is_finite() || km <= 0.0 {
            anyhow::bail!("divergence threshold must be a finite number of km above zero (got {km})");
        }
        self.cache_policy()?;
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Optional `sources.yaml` at the workspace root. Every field is optional and
/// falls back to the built-in defaults for that source.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SourcesFile {
    #[serde(default)]
    pub primary: SourceOverride,
    #[serde(default)]
    pub secondary: SourceOverride,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SourceOverride {
    pub endpoint: Option<String>,
    pub min_interval_ms: Option<u64>,
    pub timeout_secs: Option<u64>,
}

impl SourceOverride {
    fn apply(&self, mut base: SourceSettings, timeout_secs: Option<u64>) -> SourceSettings {
        if let Some(endpoint) = &self.endpoint {
            base.endpoint = endpoint.clone();
        }
        if let Some(ms) = self.min_interval_ms {
            base.min_interval_ms = ms;
        }
        if let Some(secs) = self.timeout_secs.or(timeout_secs) {
            base.timeout_secs = secs;
        }
        base
    }
}

impl SourcesFile {
    pub fn from_workspace_root(root: &Path) -> Result<Self> {
        let path = root.join("sources.yaml");
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Effective (primary, secondary) settings. The per-file timeout wins over
    /// the global one.
    pub fn settings(&self, timeout_secs: Option<u64>) -> (SourceSettings, SourceSettings) {
        (
            self.primary
                .apply(SourceSettings::gazetteer_default(), timeout_secs),
            self.secondary
                .apply(SourceSettings::encyclopedia_default(), timeout_secs),
        )
    }
}

/// An input entry skipped before deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvalidRecord {
    pub index: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct WineInput {
    pub records: Vec<RawWineRecord>,
    pub input_records: usize,
    pub invalid: Vec<InvalidRecord>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum InputDocument {
    Wrapped { wines: Vec<Value> },
    Bare(Vec<Value>),
}

/// Parse `{"wines": [...]}` or a bare array. Entries failing to decode or
/// validate are skipped and reported, not fatal.
pub fn parse_wine_input(text: &str) -> Result<WineInput> {
    let doc: InputDocument =
        serde_json::from_str(text).context("input must be a JSON array or an object with a 'wines' array")?;
    let entries = match doc {
        InputDocument::Wrapped { wines } => wines,
        InputDocument::Bare(wines) => wines,
    };

    let mut input = WineInput {
        input_records: entries.len(),
        ..Default::default()
    };
    for (index, entry) in entries.into_iter().enumerate() {
        let decoded = serde_json::from_value::<RawWineInput>(entry)
            .map_err(|e| e.to_string())
            .and_then(|raw| raw.validate().map_err(|e| e.to_string()));
        match decoded {
            Ok(record) => input.records.push(record),
            Err(reason) => {
                warn!(index, %reason, "skipping invalid wine record");
                input.invalid.push(InvalidRecord { index, reason });
            }
        }
    }
    Ok(input)
}

pub async fn load_wine_input(path: &Path) -> Result<WineInput> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    parse_wine_input(&text).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub input_records: usize,
    pub invalid_records: usize,
    pub canonical_records: usize,
    pub unique_places: usize,
    pub located_places: usize,
    pub lookup_failures: usize,
    pub cache_hits: usize,
    pub source_queries: usize,
    pub cache: CacheStats,
    pub reports_dir: String,
    pub parquet_manifest: String,
}

pub struct GeocodePipeline {
    config: GeocodeConfig,
    sources: Option<SourcePair>,
    clock: Box<dyn Clock>,
    backoff: BackoffPolicy,
}

impl GeocodePipeline {
    pub fn new(config: GeocodeConfig) -> Self {
        Self {
            config,
            sources: None,
            clock: Box::new(TokioClock),
            backoff: BackoffPolicy::default(),
        }
    }

    /// Use these sources instead of building them from `source_mode`.
    pub fn with_sources(mut self, sources: SourcePair) -> Self {
        self.sources = Some(sources);
        self
    }

    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn config(&self) -> &GeocodeConfig {
        &self.config
    }

    fn build_sources(&self) -> Result<SourcePair> {
        match &self.config.source_mode {
            SourceMode::Live => {
                let file = SourcesFile::from_workspace_root(&self.config.workspace_root)?;
                let (primary, secondary) = file.settings(self.config.http_timeout_secs);
                live_source_pair(&primary, &secondary, &self.config.user_agent)
            }
            SourceMode::Fixtures(dir) => fixture_source_pair(dir)
                .with_context(|| format!("loading fixture sources from {}", dir.display())),
        }
    }

    /// Everything after input loading, without touching the reports directory.
    pub async fn run_records(&self, input: WineInput) -> Result<(RunOutput, CacheStats)> {
        self.config.validate()?;
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();

        let dedup = Deduplicator::default().dedupe(input.records);
        let places = unique_places(&dedup.records);

        let built;
        let sources = match &self.sources {
            Some(sources) => sources,
            None => {
                built = self.build_sources()?;
                &built
            }
        };

        let cache = GeocodeCache::open(&self.config.cache_path, self.config.cache_policy()?)
            .await
            .context("opening geocode cache")?;
        let cache = Mutex::new(cache);
        let resolver = ResolverConfig {
            workers: self.config.workers.max(1),
            backoff: self.backoff,
        };
        let resolved = resolve_places(&places, sources, &cache, self.clock.as_ref(), &resolver)
            .await
            .context("geocoding aborted: geocode cache storage failure")?;
        let cache_stats = cache
            .into_inner()
            .close()
            .await
            .context("closing geocode cache")?;

        let reconciler = Reconciler::new(ReconcileConfig {
            divergence_threshold_km: self.config.divergence_threshold_km,
        });
        let locations: Vec<_> = resolved
            .resolutions
            .iter()
            .map(|r| {
                let mut loc = reconciler.reconcile(&r.place, r.primary, r.secondary);
                loc.primary_lookup = Some(r.primary_lookup);
                loc.secondary_lookup = Some(r.secondary_lookup);
                loc
            })
            .collect();

        let quality = summarize(
            &locations,
            &QualityConfig {
                top_k: self.config.top_k,
                ..Default::default()
            },
        );

        let run = RunRecord {
            run_id,
            started_at,
            finished_at: Utc::now(),
            input: self.config.input_path.display().to_string(),
            source_mode: self.config.source_mode.label().to_string(),
            divergence_threshold_km: reconciler.threshold_km(),
            input_records: input.input_records,
            invalid_records: input.invalid.len(),
            canonical_records: dedup.records.len(),
            duplicates_removed: dedup.duplicates_removed,
            unique_places: places.len(),
            cache_hits: resolved.cache_hits,
            source_queries: resolved.source_queries,
        };
        info!(
            run_id = %run.run_id,
            places = quality.total_places,
            located = quality.located_places,
            "geocoding run finished"
        );

        Ok((
            RunOutput {
                run,
                lookup_failures: resolved.failures().cloned().collect(),
                wines: dedup.records,
                locations,
                quality,
                near_duplicate_places: dedup.near_duplicate_places,
            },
            cache_stats,
        ))
    }

    pub async fn run_once(&self) -> Result<RunSummary> {
        let input = load_wine_input(&self.config.input_path).await?;
        let (output, cache) = self.run_records(input).await?;
        let paths = write_reports(&self.config.workspace_root, &output).await?;

        Ok(RunSummary {
            run_id: output.run.run_id,
            input_records: output.run.input_records,
            invalid_records: output.run.invalid_records,
            canonical_records: output.run.canonical_records,
            unique_places: output.run.unique_places,
            located_places: output.quality.located_places,
            lookup_failures: output.lookup_failures.len(),
            cache_hits: output.run.cache_hits,
            source_queries: output.run.source_queries,
            cache,
            reports_dir: paths.reports_dir.display().to_string(),
            parquet_manifest: paths.manifest.display().to_string(),
        })
    }
}

pub async fn run_once_from_env() -> Result<RunSummary> {
    GeocodePipeline::new(GeocodeConfig::from_env()).run_once().await
}

/// Dedupe an input file without geocoding; returns the outcome and the
/// number of skipped entries.
pub async fn dedupe_file(path: &Path) -> Result<(DedupOutcome, Vec<InvalidRecord>)> {
    let input = load_wine_input(path).await?;
    Ok((Deduplicator::default().dedupe(input.records), input.invalid))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_wrapped_and_bare_inputs() {
        let wrapped = r#"{"wines": [{"vineyard": "Muga", "name": "Reserva", "place": "Rioja, Spain"}]}"#;
        let bare = r#"[{"vineyard": "Muga", "name": "Reserva", "place": "Rioja, Spain"}]"#;
        for text in [wrapped, bare] {
            let input = parse_wine_input(text).expect("parse");
            assert_eq!(input.input_records, 1);
            assert_eq!(input.records.len(), 1);
            assert!(input.invalid.is_empty());
        }
    }

    #[test]
    fn invalid_entries_are_skipped_and_counted() {
        let text = r#"[
            {"vineyard": "Muga", "name": "Reserva", "place": "Rioja, Spain", "rating": "4,3"},
            {"vineyard": "  ", "name": "Blank", "place": "Rioja, Spain"},
            {"name": "No vineyard", "place": "Rioja, Spain"},
            {"vineyard": "No place", "name": "Wine"},
            "not an object"
        ]"#;
        let input = parse_wine_input(text).expect("parse");
        assert_eq!(input.input_records, 5);
        assert_eq!(input.records.len(), 1);
        assert_eq!(input.records[0].rating, Some(4.3));
        let indexes: Vec<_> = input.invalid.iter().map(|i| i.index).collect();
        assert_eq!(indexes, vec![1, 2, 3, 4]);
        assert!(input.invalid[0].reason.contains("vineyard"));
    }

    #[test]
    fn rejects_non_list_documents() {
        assert!(parse_wine_input(r#"{"records": []}"#).is_err());
        assert!(parse_wine_input("42").is_err());
    }

    #[test]
    fn sources_yaml_overrides_only_given_fields() {
        let file: SourcesFile = serde_yaml::from_str(
            "primary:\n  endpoint: http://localhost:8080/search\nsecondary:\n  min_interval_ms: 0\n",
        )
        .expect("yaml");
        let (primary, secondary) = file.settings(Some(5));
        assert_eq!(primary.endpoint, "http://localhost:8080/search");
        assert_eq!(primary.min_interval_ms, 1100);
        assert_eq!(primary.timeout_secs, 5);
        assert_eq!(secondary.endpoint, SourceSettings::encyclopedia_default().endpoint);
        assert_eq!(secondary.min_interval_ms, 0);
    }

    #[test]
    fn missing_sources_yaml_means_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = SourcesFile::from_workspace_root(dir.path()).expect("load");
        let (primary, secondary) = file.settings(None);
        assert_eq!(primary, SourceSettings::gazetteer_default());
        assert_eq!(secondary, SourceSettings::encyclopedia_default());
    }

    fn config_in(root: &Path) -> GeocodeConfig {
        GeocodeConfig {
            input_path: root.join("wines.json"),
            cache_path: root.join("cache").join("geocode_cache.jsonl"),
            workspace_root: root.to_path_buf(),
            user_agent: "vinloc-tests".to_string(),
            http_timeout_secs: None,
            divergence_threshold_km: DEFAULT_DIVERGENCE_THRESHOLD_KM,
            top_k: 15,
            workers: 2,
            null_ttl_days: None,
            source_mode: SourceMode::Fixtures(root.join("sources")),
        }
    }

    #[test]
    fn null_ttl_days_must_be_non_negative_and_in_range() {
        let mut config = config_in(Path::new("."));
        assert_eq!(config.cache_policy().expect("no ttl").null_ttl, None);

        config.null_ttl_days = Some(30);
        assert_eq!(
            config.cache_policy().expect("30 days").null_ttl,
            Some(chrono::TimeDelta::days(30))
        );

        config.null_ttl_days = Some(-1);
        let err = config.cache_policy().expect_err("negative ttl");
        assert!(err.to_string().contains("must not be negative"));

        config.null_ttl_days = Some(i64::MAX);
        let err = config.cache_policy().expect_err("huge ttl");
        assert!(err.to_string().contains("out of range"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn divergence_threshold_must_be_finite_and_positive() {
        let mut config = config_in(Path::new("."));
        config.validate().expect("default threshold");
        for km in [0.0, -5.0, f64::NAN, f64::INFINITY] {
            config.divergence_threshold_km = km;
            let err = config.validate().expect_err("bad threshold");
            assert!(err.to_string().contains("divergence threshold"), "{km}: {err}");
        }
    }

    #[tokio::test]
    async fn invalid_config_fails_before_opening_the_cache() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = config_in(dir.path());
        config.divergence_threshold_km = -1.0;
        let input = parse_wine_input(
            r#"[{"vineyard": "Muga", "name": "Reserva", "place": "Rioja, Spain"}]"#,
        )
        .expect("parse");

        let err = GeocodePipeline::new(config.clone())
            .run_records(input)
            .await
            .expect_err("negative threshold");
        assert!(err.to_string().contains("divergence threshold"));
        assert!(!config.cache_path.exists());
    }
}
