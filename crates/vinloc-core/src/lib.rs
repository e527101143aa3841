//! Core domain model for scraped wine records, places and coordinates.

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "vinloc-core";

/// Mean Earth radius (IUGG) used for every distance in the pipeline.
pub const EARTH_MEAN_RADIUS_KM: f64 = 6371.0088;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoordinateError {
    #[error("latitude {0} is outside [-90, 90]")]
    LatitudeOutOfRange(f64),
    #[error("longitude {0} is outside [-180, 180]")]
    LongitudeOutOfRange(f64),
}

/// A validated WGS84 point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "CoordinateRepr", into = "CoordinateRepr")]
pub struct Coordinate {
    latitude: f64,
    longitude: f64,
}

#[derive(Serialize, Deserialize)]
struct CoordinateRepr {
    lat: f64,
    lon: f64,
}

impl TryFrom<CoordinateRepr> for Coordinate {
    type Error = CoordinateError;

    fn try_from(repr: CoordinateRepr) -> Result<Self, Self::Error> {
        Coordinate::new(repr.lat, repr.lon)
    }
}

impl From<Coordinate> for CoordinateRepr {
    fn from(coord: Coordinate) -> Self {
        Self {
            lat: coord.latitude,
            lon: coord.longitude,
        }
    }
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, CoordinateError> {
        if !(-90.0..=90.0).contains(&latitude) {
            return Err(CoordinateError::LatitudeOutOfRange(latitude));
        }
        if !(-180.0..=180.0).contains(&longitude) {
            return Err(CoordinateError::LongitudeOutOfRange(longitude));
        }
        Ok(Self {
            latitude,
            longitude,
        })
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }

    /// Great-circle distance in kilometres.
    pub fn distance_km(&self, other: &Coordinate) -> f64 {
        haversine_km(self, other)
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.5}, {:.5})", self.latitude, self.longitude)
    }
}

pub fn haversine_km(a: &Coordinate, b: &Coordinate) -> f64 {
    let p1 = a.latitude.to_radians();
    let p2 = b.latitude.to_radians();
    let dp = (b.latitude - a.latitude).to_radians();
    let dl = (b.longitude - a.longitude).to_radians();
    let h = (dp / 2.0).sin().powi(2) + p1.cos() * p2.cos() * (dl / 2.0).sin().powi(2);
    2.0 * EARTH_MEAN_RADIUS_KM * h.sqrt().min(1.0).asin()
}

/// Trim and collapse internal whitespace runs to a single space.
pub fn normalize_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Whitespace-normalized, case-folded form used for identity comparisons.
pub fn fold_key_fragment(input: &str) -> String {
    normalize_whitespace(input).to_lowercase()
}

/// The two coordinate sources. Reconciliation is defined over exactly this pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeoSource {
    /// Gazetteer search.
    Primary,
    /// Encyclopedia article coordinates.
    Secondary,
}

impl GeoSource {
    pub const BOTH: [GeoSource; 2] = [GeoSource::Primary, GeoSource::Secondary];

    pub fn source_id(&self) -> &'static str {
        match self {
            GeoSource::Primary => "primary",
            GeoSource::Secondary => "secondary",
        }
    }
}

impl fmt::Display for GeoSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.source_id())
    }
}

/// Normalized `(vineyard, name, place)` identity of a wine record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentityKey {
    pub vineyard: String,
    pub name: String,
    pub place: String,
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} | {} | {}", self.vineyard, self.name, self.place)
    }
}

/// Place text as it will be geocoded.
///
/// Equality, hashing and cache keying go through [`PlaceName::key`]; the
/// display form keeps the first-seen spelling so external lookups get the
/// original capitalisation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceName {
    display: String,
    key: String,
}

impl PlaceName {
    /// Returns `None` for places that are empty after normalization.
    pub fn new(raw: &str) -> Option<Self> {
        let display = normalize_whitespace(raw);
        if display.is_empty() {
            return None;
        }
        let key = display.to_lowercase();
        Some(Self { display, key })
    }

    pub fn as_str(&self) -> &str {
        &self.display
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Last comma-separated segment, which the scraped data uses for the country.
    pub fn country(&self) -> Option<&str> {
        self.display
            .rsplit(',')
            .next()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

impl PartialEq for PlaceName {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for PlaceName {}

impl Hash for PlaceName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl fmt::Display for PlaceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("required field '{field}' is missing")]
    MissingField { field: &'static str },
    #[error("required field '{field}' is blank")]
    BlankField { field: &'static str },
}

/// Wire shape produced by the scraping collaborator, before validation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawWineInput {
    #[serde(default)]
    pub vineyard: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub place: Option<String>,
    #[serde(default, deserialize_with = "deserialize_lenient_number")]
    pub rating: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_lenient_number")]
    pub price: Option<f64>,
    #[serde(default)]
    pub grapes: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default, alias = "wine_style")]
    pub style: Option<String>,
    #[serde(default)]
    pub allergens: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, alias = "teneur_en_alcool")]
    pub alcohol_content: Option<String>,
    #[serde(default)]
    pub food_pairings: Option<Vec<String>>,
}

impl RawWineInput {
    pub fn validate(self) -> Result<RawWineRecord, ValidationError> {
        let vineyard = required_text(self.vineyard, "vineyard")?;
        let name = required_text(self.name, "name")?;
        let place = self
            .place
            .ok_or(ValidationError::MissingField { field: "place" })?;

        Ok(RawWineRecord {
            vineyard,
            name,
            place,
            rating: self.rating,
            price: self.price,
            grapes: self.grapes,
            region: self.region,
            style: self.style,
            allergens: self.allergens,
            description: self.description,
            url: self.url,
            alcohol_content: self.alcohol_content,
            food_pairings: self.food_pairings.unwrap_or_default(),
        })
    }
}

fn required_text(value: Option<String>, field: &'static str) -> Result<String, ValidationError> {
    let value = value.ok_or(ValidationError::MissingField { field })?;
    if value.trim().is_empty() {
        return Err(ValidationError::BlankField { field });
    }
    Ok(value)
}

/// Scraped wine entry after validation. Never mutated once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawWineRecord {
    pub vineyard: String,
    pub name: String,
    pub place: String,
    pub rating: Option<f64>,
    pub price: Option<f64>,
    pub grapes: Option<String>,
    pub region: Option<String>,
    pub style: Option<String>,
    pub allergens: Option<String>,
    pub description: Option<String>,
    pub url: Option<String>,
    pub alcohol_content: Option<String>,
    #[serde(default)]
    pub food_pairings: Vec<String>,
}

impl RawWineRecord {
    pub fn identity_key(&self) -> IdentityKey {
        IdentityKey {
            vineyard: fold_key_fragment(&self.vineyard),
            name: fold_key_fragment(&self.name),
            place: fold_key_fragment(&self.place),
        }
    }

    pub fn place_name(&self) -> Option<PlaceName> {
        PlaceName::new(&self.place)
    }

    /// Number of optional fields carrying a usable value.
    pub fn richness(&self) -> usize {
        let numbers = [self.rating, self.price]
            .iter()
            .filter(|v| v.is_some())
            .count();
        let texts = [
            &self.grapes,
            &self.region,
            &self.style,
            &self.allergens,
            &self.description,
            &self.url,
            &self.alcohol_content,
        ]
        .iter()
        .filter(|v| v.as_deref().is_some_and(|s| !s.trim().is_empty()))
        .count();
        let pairings = usize::from(self.food_pairings.iter().any(|p| !p.trim().is_empty()));
        numbers + texts + pairings
    }

    /// Label used in map popups: `name (vineyard)`.
    pub fn label(&self) -> String {
        format!("{} ({})", self.name.trim(), self.vineyard.trim())
    }
}

/// Survivor of deduplication for one identity key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalWineRecord {
    pub key: IdentityKey,
    pub record: RawWineRecord,
    /// Raw records collapsed into this one, including itself.
    pub merged_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChosenSource {
    Primary,
    Secondary,
    OnlyPrimary,
    OnlySecondary,
    None,
}

impl ChosenSource {
    pub const ALL: [ChosenSource; 5] = [
        ChosenSource::Primary,
        ChosenSource::Secondary,
        ChosenSource::OnlyPrimary,
        ChosenSource::OnlySecondary,
        ChosenSource::None,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChosenSource::Primary => "PRIMARY",
            ChosenSource::Secondary => "SECONDARY",
            ChosenSource::OnlyPrimary => "ONLY_PRIMARY",
            ChosenSource::OnlySecondary => "ONLY_SECONDARY",
            ChosenSource::None => "NONE",
        }
    }
}

impl fmt::Display for ChosenSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a single source answered for a place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupStatus {
    Resolved,
    NoResult,
    /// Lookup errors exhausted the retry budget.
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLookup {
    pub status: LookupStatus,
    pub from_cache: bool,
}

impl SourceLookup {
    pub fn unavailable() -> Self {
        Self {
            status: LookupStatus::Unavailable,
            from_cache: false,
        }
    }
}

/// Reconciled coordinates for one place, with provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciledLocation {
    pub place_name: String,
    pub country: Option<String>,
    pub primary_coord: Option<Coordinate>,
    pub secondary_coord: Option<Coordinate>,
    pub chosen_coord: Option<Coordinate>,
    pub chosen_source: ChosenSource,
    pub disagreement_km: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_lookup: Option<SourceLookup>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_lookup: Option<SourceLookup>,
}

impl ReconciledLocation {
    pub fn is_located(&self) -> bool {
        self.chosen_coord.is_some()
    }
}

/// Accepts `4.2`, `"4,2"`, `"€ 12,50"` or null. Unparseable text becomes `None`.
pub fn deserialize_lenient_number<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrText {
        Number(f64),
        Text(String),
    }

    Ok(match Option::<NumberOrText>::deserialize(deserializer)? {
        Some(NumberOrText::Number(v)) => Some(v),
        Some(NumberOrText::Text(text)) => first_number(&text),
        None => None,
    })
}

/// First decimal number in free text; `,` is accepted as the decimal separator.
pub fn first_number(text: &str) -> Option<f64> {
    let mut current = String::new();
    let mut seen_sep = false;
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            current.push(ch);
            continue;
        }
        if (ch == '.' || ch == ',') && !seen_sep && !current.is_empty() {
            current.push('.');
            seen_sep = true;
            continue;
        }
        if !current.is_empty() {
            break;
        }
    }
    current.trim_end_matches('.').parse::<f64>().ok()
}
