//! Coordinate source contracts + gazetteer, encyclopedia and fixture adapters.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use vinloc_core::{fold_key_fragment, normalize_whitespace, Coordinate, CoordinateError, GeoSource, PlaceName};
use vinloc_storage::{FetchError, HttpClientConfig, HttpFetcher, TokenBucketConfig};

pub const CRATE_NAME: &str = "vinloc-adapters";

pub const DEFAULT_GAZETTEER_ENDPOINT: &str = "https://nominatim.openstreetmap.org/search";
pub const DEFAULT_ENCYCLOPEDIA_ENDPOINT: &str = "https://en.wikipedia.org/w/api.php";
pub const DEFAULT_USER_AGENT: &str = "vinloc/0.1 (wine location reconciler)";

/// A lookup that failed for transport or payload reasons. "Nothing found" is
/// `Ok(None)`, never this.
#[derive(Debug, Error)]
pub enum LookupError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("source returned an out-of-range coordinate for '{place}': {source}")]
    InvalidCoordinate {
        place: String,
        #[source]
        source: CoordinateError,
    },
    #[error("malformed source payload: {0}")]
    MalformedPayload(String),
}

#[async_trait]
pub trait CoordinateSource: Send + Sync {
    /// Short backend name used in logs, e.g. `nominatim`.
    fn backend(&self) -> &str;

    async fn resolve(&self, place: &PlaceName) -> Result<Option<Coordinate>, LookupError>;
}

/// Endpoint and politeness settings for one live source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSettings {
    pub endpoint: String,
    /// Minimum spacing between requests to this source.
    pub min_interval_ms: u64,
    pub timeout_secs: u64,
}

impl SourceSettings {
    pub fn gazetteer_default() -> Self {
        Self {
            endpoint: DEFAULT_GAZETTEER_ENDPOINT.to_string(),
            min_interval_ms: 1100,
            timeout_secs: 10,
        }
    }

    pub fn encyclopedia_default() -> Self {
        Self {
            endpoint: DEFAULT_ENCYCLOPEDIA_ENDPOINT.to_string(),
            min_interval_ms: 200,
            timeout_secs: 20,
        }
    }

    fn http_config(&self, user_agent: &str) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.timeout_secs.max(1)),
            user_agent: Some(user_agent.to_string()),
            concurrency: 1,
            token_bucket: (self.min_interval_ms > 0).then(|| TokenBucketConfig {
                capacity: 1,
                refill_every: Duration::from_millis(self.min_interval_ms),
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GazetteerHit {
    lat: String,
    lon: String,
}

/// Free-text search against a Nominatim-compatible gazetteer.
#[derive(Debug)]
pub struct GazetteerAdapter {
    http: HttpFetcher,
    endpoint: String,
}

impl GazetteerAdapter {
    pub fn new(settings: &SourceSettings, user_agent: &str) -> Result<Self> {
        Ok(Self {
            http: HttpFetcher::new(settings.http_config(user_agent))
                .context("building gazetteer http client")?,
            endpoint: settings.endpoint.clone(),
        })
    }
}

fn parse_gazetteer_hits(place: &str, hits: &[GazetteerHit]) -> Result<Option<Coordinate>, LookupError> {
    let Some(hit) = hits.first() else {
        return Ok(None);
    };
    let lat = hit
        .lat
        .trim()
        .parse::<f64>()
        .map_err(|e| LookupError::MalformedPayload(format!("gazetteer lat '{}': {e}", hit.lat)))?;
    let lon = hit
        .lon
        .trim()
        .parse::<f64>()
        .map_err(|e| LookupError::MalformedPayload(format!("gazetteer lon '{}': {e}", hit.lon)))?;
    Coordinate::new(lat, lon)
        .map(Some)
        .map_err(|source| LookupError::InvalidCoordinate {
            place: place.to_string(),
            source,
        })
}

#[async_trait]
impl CoordinateSource for GazetteerAdapter {
    fn backend(&self) -> &str {
        "nominatim"
    }

    async fn resolve(&self, place: &PlaceName) -> Result<Option<Coordinate>, LookupError> {
        let hits: Vec<GazetteerHit> = self
            .http
            .get_json(
                &self.endpoint,
                &[("q", place.as_str()), ("format", "json"), ("limit", "1")],
            )
            .await?;
        parse_gazetteer_hits(place.as_str(), &hits)
    }
}

#[derive(Debug, Deserialize)]
struct EncyclopediaResponse {
    query: Option<EncyclopediaQuery>,
}

#[derive(Debug, Deserialize)]
struct EncyclopediaQuery {
    #[serde(default)]
    pages: Vec<EncyclopediaPage>,
}

#[derive(Debug, Deserialize)]
struct EncyclopediaPage {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    missing: bool,
    #[serde(default)]
    invalid: bool,
    #[serde(default)]
    coordinates: Vec<PageCoordinate>,
}

#[derive(Debug, Deserialize)]
struct PageCoordinate {
    lat: f64,
    lon: f64,
}

/// Primary coordinates of the encyclopedia article titled after the place.
#[derive(Debug)]
pub struct EncyclopediaAdapter {
    http: HttpFetcher,
    endpoint: String,
}

impl EncyclopediaAdapter {
    pub fn new(settings: &SourceSettings, user_agent: &str) -> Result<Self> {
        Ok(Self {
            http: HttpFetcher::new(settings.http_config(user_agent))
                .context("building encyclopedia http client")?,
            endpoint: settings.endpoint.clone(),
        })
    }
}

/// Article title guess: first comma segment, parenthesised text dropped.
///
/// `"Cafayate Valley (Calchaquí), Salta, Argentina"` becomes `"Cafayate Valley"`.
pub fn clean_place_label(place: &str) -> String {
    let head = place.split(',').next().unwrap_or_default();
    let mut out = String::with_capacity(head.len());
    let mut depth = 0usize;
    for ch in head.chars() {
        match ch {
            '(' => {
                depth += 1;
                out.push(' ');
            }
            ')' if depth > 0 => {
                depth -= 1;
                out.push(' ');
            }
            _ if depth == 0 => out.push(ch),
            _ => {}
        }
    }
    normalize_whitespace(&out)
}

fn parse_encyclopedia_response(
    place: &str,
    response: EncyclopediaResponse,
) -> Result<Option<Coordinate>, LookupError> {
    let query = response
        .query
        .ok_or_else(|| LookupError::MalformedPayload("encyclopedia response has no 'query'".into()))?;
    let Some(page) = query.pages.into_iter().next() else {
        return Ok(None);
    };
    if page.missing || page.invalid {
        return Ok(None);
    }
    let Some(first) = page.coordinates.first() else {
        return Ok(None);
    };
    debug!(place, title = page.title.as_deref().unwrap_or_default(), "encyclopedia page matched");
    Coordinate::new(first.lat, first.lon)
        .map(Some)
        .map_err(|source| LookupError::InvalidCoordinate {
            place: place.to_string(),
            source,
        })
}

#[async_trait]
impl CoordinateSource for EncyclopediaAdapter {
    fn backend(&self) -> &str {
        "wikipedia"
    }

    async fn resolve(&self, place: &PlaceName) -> Result<Option<Coordinate>, LookupError> {
        let label = clean_place_label(place.as_str());
        if label.is_empty() {
            return Ok(None);
        }
        let response: EncyclopediaResponse = self
            .http
            .get_json(
                &self.endpoint,
                &[
                    ("action", "query"),
                    ("format", "json"),
                    ("formatversion", "2"),
                    ("prop", "coordinates"),
                    ("titles", label.as_str()),
                    ("colimit", "1"),
                    ("coprimary", "primary"),
                ],
            )
            .await?;
        parse_encyclopedia_response(place.as_str(), response)
    }
}

/// Offline source answering from a JSON map of `place -> {lat, lon} | null`.
/// Places absent from the map resolve to `None`.
#[derive(Debug, Clone)]
pub struct FixtureSource {
    backend: String,
    entries: HashMap<String, Option<Coordinate>>,
}

impl FixtureSource {
    pub fn new(
        backend: impl Into<String>,
        entries: impl IntoIterator<Item = (String, Option<Coordinate>)>,
    ) -> Self {
        Self {
            backend: backend.into(),
            entries: entries
                .into_iter()
                .map(|(place, coord)| (fold_key_fragment(&place), coord))
                .collect(),
        }
    }

    pub fn load(backend: impl Into<String>, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let entries: HashMap<String, Option<Coordinate>> =
            serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self::new(backend, entries))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CoordinateSource for FixtureSource {
    fn backend(&self) -> &str {
        &self.backend
    }

    async fn resolve(&self, place: &PlaceName) -> Result<Option<Coordinate>, LookupError> {
        Ok(self.entries.get(place.key()).copied().flatten())
    }
}

/// The closed pair of sources the reconciler works over.
pub struct SourcePair {
    primary: Box<dyn CoordinateSource>,
    secondary: Box<dyn CoordinateSource>,
}

impl SourcePair {
    pub fn new(primary: Box<dyn CoordinateSource>, secondary: Box<dyn CoordinateSource>) -> Self {
        Self { primary, secondary }
    }

    pub fn get(&self, source: GeoSource) -> &dyn CoordinateSource {
        match source {
            GeoSource::Primary => self.primary.as_ref(),
            GeoSource::Secondary => self.secondary.as_ref(),
        }
    }
}

impl std::fmt::Debug for SourcePair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourcePair")
            .field("primary", &self.primary.backend())
            .field("secondary", &self.secondary.backend())
            .finish()
    }
}

pub fn live_source_pair(
    primary: &SourceSettings,
    secondary: &SourceSettings,
    user_agent: &str,
) -> Result<SourcePair> {
    Ok(SourcePair::new(
        Box::new(GazetteerAdapter::new(primary, user_agent)?),
        Box::new(EncyclopediaAdapter::new(secondary, user_agent)?),
    ))
}

/// Loads `primary.json` and `secondary.json` from `dir`.
pub fn fixture_source_pair(dir: impl AsRef<Path>) -> Result<SourcePair> {
    let dir = dir.as_ref();
    Ok(SourcePair::new(
        Box::new(FixtureSource::load("fixture-primary", dir.join("primary.json"))?),
        Box::new(FixtureSource::load("fixture-secondary", dir.join("secondary.json"))?),
    ))
}
