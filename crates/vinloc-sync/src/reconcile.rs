//! Distance-based choice between primary and secondary coordinates.

use vinloc_core::{haversine_km, ChosenSource, Coordinate, PlaceName, ReconciledLocation};

pub const DEFAULT_DIVERGENCE_THRESHOLD_KM: f64 = 50.0;

#[derive(Debug, Clone, Copy)]
pub struct ReconcileConfig {
    /// At or beyond this distance the sources are treated as having matched
    /// different entities and the secondary wins.
    pub divergence_threshold_km: f64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            divergence_threshold_km: DEFAULT_DIVERGENCE_THRESHOLD_KM,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Reconciler {
    config: ReconcileConfig,
}

impl Reconciler {
    pub fn new(config: ReconcileConfig) -> Self {
        Self { config }
    }

    pub fn threshold_km(&self) -> f64 {
        self.config.divergence_threshold_km
    }

    pub fn reconcile(
        &self,
        place: &PlaceName,
        primary: Option<Coordinate>,
        secondary: Option<Coordinate>,
    ) -> ReconciledLocation {
        let (chosen_coord, chosen_source, disagreement_km) = match (primary, secondary) {
            (Some(p), Some(s)) => {
                let d = haversine_km(&p, &s);
                if d < self.config.divergence_threshold_km {
                    (Some(p), ChosenSource::Primary, Some(d))
                } else {
                    (Some(s), ChosenSource::Secondary, Some(d))
                }
            }
            (Some(p), None) => (Some(p), ChosenSource::OnlyPrimary, None),
            (None, Some(s)) => (Some(s), ChosenSource::OnlySecondary, None),
            (None, None) => (None, ChosenSource::None, None),
        };

        ReconciledLocation {
            place_name: place.as_str().to_string(),
            country: place.country().map(str::to_string),
            primary_coord: primary,
            secondary_coord: secondary,
            chosen_coord,
            chosen_source,
            disagreement_km,
            primary_lookup: None,
            secondary_lookup: None,
        }
    }
}
