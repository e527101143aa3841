//! Coverage and disagreement statistics over reconciled locations.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use vinloc_core::{CanonicalWineRecord, ChosenSource, LookupStatus, PlaceName, ReconciledLocation};

/// Country bucket for places whose text yields no country segment.
pub const UNKNOWN_COUNTRY: &str = "Unknown";

#[derive(Debug, Clone, Copy)]
pub struct QualityConfig {
    pub top_k: usize,
    pub histogram_bins: usize,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            top_k: 15,
            histogram_bins: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisagreementStats {
    pub count: usize,
    pub min_km: f64,
    pub max_km: f64,
    pub mean_km: f64,
    pub median_km: f64,
    pub p90_km: f64,
    pub p95_km: f64,
    pub p99_km: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramBin {
    pub lower_km: f64,
    pub upper_km: f64,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outlier {
    pub place_name: String,
    pub disagreement_km: f64,
    pub chosen_source: ChosenSource,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCoverage {
    pub found: usize,
    pub no_result: usize,
    pub unavailable: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub total_places: usize,
    pub located_places: usize,
    /// `located_places / total_places`, 0 for an empty run.
    pub coverage: f64,
    pub source_counts: BTreeMap<ChosenSource, usize>,
    pub primary: SourceCoverage,
    pub secondary: SourceCoverage,
    pub disagreement: Option<DisagreementStats>,
    pub histogram: Vec<HistogramBin>,
    pub top_outliers: Vec<Outlier>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CountryStats {
    pub places: usize,
    pub located: usize,
    pub wines: usize,
    /// Mean over wines that carry a rating.
    pub avg_rating: Option<f64>,
}

impl QualityReport {
    pub fn count(&self, source: ChosenSource) -> usize {
        self.source_counts.get(&source).copied().unwrap_or(0)
    }
}

pub fn summarize(locations: &[ReconciledLocation], config: &QualityConfig) -> QualityReport {
    let total_places = locations.len();
    let located_places = locations.iter().filter(|l| l.is_located()).count();
    let coverage = if total_places == 0 {
        0.0
    } else {
        located_places as f64 / total_places as f64
    };

    let mut source_counts: BTreeMap<ChosenSource, usize> =
        ChosenSource::ALL.iter().map(|s| (*s, 0)).collect();
    for loc in locations {
        *source_counts.entry(loc.chosen_source).or_default() += 1;
    }

    let primary = source_coverage(locations.iter().map(|l| {
        (
            l.primary_coord.is_some(),
            l.primary_lookup.map(|lk| lk.status),
        )
    }));
    let secondary = source_coverage(locations.iter().map(|l| {
        (
            l.secondary_coord.is_some(),
            l.secondary_lookup.map(|lk| lk.status),
        )
    }));

    let mut distances: Vec<f64> = locations
        .iter()
        .filter(|l| l.primary_coord.is_some() && l.secondary_coord.is_some())
        .filter_map(|l| l.disagreement_km)
        .collect();
    distances.sort_by(|a, b| a.total_cmp(b));

    let disagreement = disagreement_stats(&distances);
    let histogram = histogram(&distances, config.histogram_bins);

    let mut outliers: Vec<Outlier> = locations
        .iter()
        .filter_map(|l| {
            l.disagreement_km.map(|d| Outlier {
                place_name: l.place_name.clone(),
                disagreement_km: d,
                chosen_source: l.chosen_source,
            })
        })
        .collect();
    outliers.sort_by(|a, b| {
        b.disagreement_km
            .total_cmp(&a.disagreement_km)
            .then_with(|| a.place_name.cmp(&b.place_name))
    });
    outliers.truncate(config.top_k);

    QualityReport {
        total_places,
        located_places,
        coverage,
        source_counts,
        primary,
        secondary,
        disagreement,
        histogram,
        top_outliers: outliers,
    }
}

/// Places, located places, wines and mean rating per country.
///
/// Wines are attributed through their place; wines whose place was not
/// resolved in this run (including empty places) are left out.
pub fn country_breakdown(
    locations: &[ReconciledLocation],
    wines: &[CanonicalWineRecord],
) -> BTreeMap<String, CountryStats> {
    let mut countries: BTreeMap<String, CountryStats> = BTreeMap::new();
    let mut place_country: HashMap<String, String> = HashMap::new();
    for loc in locations {
        let country = loc
            .country
            .clone()
            .unwrap_or_else(|| UNKNOWN_COUNTRY.to_string());
        let stats = countries.entry(country.clone()).or_default();
        stats.places += 1;
        if loc.is_located() {
            stats.located += 1;
        }
        if let Some(place) = PlaceName::new(&loc.place_name) {
            place_country.insert(place.key().to_string(), country);
        }
    }

    let mut rating_sums: HashMap<String, (f64, usize)> = HashMap::new();
    for wine in wines {
        let Some(place) = wine.record.place_name() else {
            continue;
        };
        let Some(country) = place_country.get(place.key()) else {
            continue;
        };
        if let Some(stats) = countries.get_mut(country) {
            stats.wines += 1;
        }
        if let Some(rating) = wine.record.rating {
            let sum = rating_sums.entry(country.clone()).or_default();
            sum.0 += rating;
            sum.1 += 1;
        }
    }
    for (country, (total, n)) in rating_sums {
        if let Some(stats) = countries.get_mut(&country) {
            stats.avg_rating = Some(total / n as f64);
        }
    }
    countries
}

fn source_coverage(items: impl Iterator<Item = (bool, Option<LookupStatus>)>) -> SourceCoverage {
    let mut cov = SourceCoverage::default();
    for (found, status) in items {
        if found {
            cov.found += 1;
        } else if status == Some(LookupStatus::Unavailable) {
            cov.unavailable += 1;
        } else {
            cov.no_result += 1;
        }
    }
    cov
}

fn disagreement_stats(sorted: &[f64]) -> Option<DisagreementStats> {
    let (first, last) = (sorted.first()?, sorted.last()?);
    let mean = sorted.iter().sum::<f64>() / sorted.len() as f64;
    Some(DisagreementStats {
        count: sorted.len(),
        min_km: *first,
        max_km: *last,
        mean_km: mean,
        median_km: percentile(sorted, 0.5),
        p90_km: percentile(sorted, 0.9),
        p95_km: percentile(sorted, 0.95),
        p99_km: percentile(sorted, 0.99),
    })
}

/// Linear interpolation between closest ranks over an ascending slice.
pub fn percentile(sorted: &[f64], q: f64) -> f64 {
    match sorted.len() {
        0 => f64::NAN,
        1 => sorted[0],
        n => {
            let rank = q.clamp(0.0, 1.0) * (n - 1) as f64;
            let lo = rank.floor() as usize;
            let hi = rank.ceil() as usize;
            let frac = rank - lo as f64;
            sorted[lo] + (sorted[hi] - sorted[lo]) * frac
        }
    }
}

fn histogram(sorted: &[f64], bins: usize) -> Vec<HistogramBin> {
    let (Some(&min), Some(&max)) = (sorted.first(), sorted.last()) else {
        return Vec::new();
    };
    if bins == 0 {
        return Vec::new();
    }
    if max <= min {
        return vec![HistogramBin {
            lower_km: min,
            upper_km: max,
            count: sorted.len(),
        }];
    }

    let width = (max - min) / bins as f64;
    let mut out: Vec<HistogramBin> = (0..bins)
        .map(|i| HistogramBin {
            lower_km: min + width * i as f64,
            upper_km: if i + 1 == bins {
                max
            } else {
                min + width * (i + 1) as f64
            },
            count: 0,
        })
        .collect();
    for &v in sorted {
        let idx = (((v - min) / width).floor() as usize).min(bins - 1);
        out[idx].count += 1;
    }
    out
}
