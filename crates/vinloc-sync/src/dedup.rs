//! Identity-key deduplication of scraped wine records.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;
use tracing::info;
use vinloc_core::{CanonicalWineRecord, IdentityKey, PlaceName, RawWineRecord};

#[derive(Debug, Clone, Copy)]
pub struct DedupConfig {
    /// Jaro-Winkler score at or above which two distinct places are queued for review.
    pub near_duplicate_threshold: f64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            near_duplicate_threshold: 0.90,
        }
    }
}

/// Two place spellings that look like the same place but were not merged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceReviewItem {
    pub place_a: String,
    pub place_b: String,
    pub similarity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DedupOutcome {
    pub records: Vec<CanonicalWineRecord>,
    pub input_records: usize,
    pub duplicates_removed: usize,
    pub near_duplicate_places: Vec<PlaceReviewItem>,
}

pub struct Deduplicator {
    config: DedupConfig,
}

impl Deduplicator {
    pub fn new(config: DedupConfig) -> Self {
        Self { config }
    }

    /// Collapse records sharing an identity key.
    ///
    /// The survivor is the record with the most populated optional fields;
    /// ties keep the first one seen. Output follows first-seen key order.
    pub fn dedupe(&self, records: Vec<RawWineRecord>) -> DedupOutcome {
        let input_records = records.len();
        let mut index: HashMap<IdentityKey, usize> = HashMap::new();
        let mut out: Vec<CanonicalWineRecord> = Vec::new();

        for record in records {
            let key = record.identity_key();
            match index.get(&key) {
                Some(&pos) => {
                    let existing = &mut out[pos];
                    existing.merged_count += 1;
                    if record.richness() > existing.record.richness() {
                        existing.record = record;
                    }
                }
                None => {
                    index.insert(key.clone(), out.len());
                    out.push(CanonicalWineRecord {
                        key,
                        record,
                        merged_count: 1,
                    });
                }
            }
        }

        let duplicates_removed = input_records - out.len();
        let places = unique_places(&out);
        let near_duplicate_places = self.near_duplicate_places(&places);
        info!(
            input_records,
            canonical_records = out.len(),
            duplicates_removed,
            near_duplicate_places = near_duplicate_places.len(),
            "deduplicated wine records"
        );

        DedupOutcome {
            records: out,
            input_records,
            duplicates_removed,
            near_duplicate_places,
        }
    }

    fn near_duplicate_places(&self, places: &[PlaceName]) -> Vec<PlaceReviewItem> {
        let mut items = Vec::new();
        for i in 0..places.len() {
            for j in (i + 1)..places.len() {
                let score = jaro_winkler(places[i].key(), places[j].key());
                if score >= self.config.near_duplicate_threshold {
                    items.push(PlaceReviewItem {
                        place_a: places[i].as_str().to_string(),
                        place_b: places[j].as_str().to_string(),
                        similarity: score,
                    });
                }
            }
        }
        items.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then_with(|| a.place_a.cmp(&b.place_a))
                .then_with(|| a.place_b.cmp(&b.place_b))
        });
        items
    }
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new(DedupConfig::default())
    }
}

pub fn dedupe(records: Vec<RawWineRecord>) -> Vec<CanonicalWineRecord> {
    Deduplicator::default().dedupe(records).records
}

/// Distinct non-empty places in first-seen order.
pub fn unique_places(records: &[CanonicalWineRecord]) -> Vec<PlaceName> {
    let mut seen = std::collections::HashSet::new();
    records
        .iter()
        .filter_map(|c| c.record.place_name())
        .filter(|p| seen.insert(p.key().to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use vinloc_core::RawWineInput;

    fn wine(vineyard: &str, name: &str, place: &str) -> RawWineRecord {
        RawWineInput {
            vineyard: Some(vineyard.into()),
            name: Some(name.into()),
            place: Some(place.into()),
            ..Default::default()
        }
        .validate()
        .expect("valid")
    }

    fn rich(vineyard: &str, name: &str, place: &str) -> RawWineRecord {
        RawWineRecord {
            rating: Some(4.1),
            grapes: Some("Tempranillo".into()),
            ..wine(vineyard, name, place)
        }
    }

    fn sample() -> Vec<RawWineRecord> {
        vec![
            wine("Bodegas Muga", "Reserva", "Rioja, Spain"),
            wine("Penfolds", "Bin 389", "South Australia, Australia"),
            rich("bodegas  muga", "RESERVA", " Rioja, spain"),
            wine("Penfolds", "Bin 389", "South Australia, Australia"),
            wine("Catena", "Malbec", ""),
        ]
    }

    #[test]
    fn empty_input_gives_empty_output() {
        let outcome = Deduplicator::default().dedupe(Vec::new());
        assert!(outcome.records.is_empty());
        assert_eq!(outcome.duplicates_removed, 0);
    }

    #[test]
    fn richer_duplicate_wins_and_counts_are_reported() {
        let outcome = Deduplicator::default().dedupe(sample());
        assert_eq!(outcome.input_records, 5);
        assert_eq!(outcome.records.len(), 3);
        assert_eq!(outcome.duplicates_removed, 2);

        let muga = &outcome.records[0];
        assert_eq!(muga.merged_count, 2);
        assert_eq!(muga.record.vineyard, "bodegas  muga");
        assert_eq!(muga.record.rating, Some(4.1));

        let penfolds = &outcome.records[1];
        assert_eq!(penfolds.merged_count, 2);
    }

    #[test]
    fn equally_rich_duplicates_keep_the_first_seen() {
        let first = RawWineRecord {
            description: Some("first".into()),
            ..wine("Zind-Humbrecht", "Riesling", "Alsace, France")
        };
        let second = RawWineRecord {
            description: Some("second".into()),
            ..wine("ZIND-HUMBRECHT", "riesling", "alsace, france")
        };
        let records = dedupe(vec![first, second]);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].record.description.as_deref(), Some("first"));
    }

    #[test]
    fn dedupe_is_idempotent() {
        let once = dedupe(sample());
        let twice = dedupe(once.iter().map(|c| c.record.clone()).collect());
        assert_eq!(
            once.iter().map(|c| (&c.key, &c.record)).collect::<Vec<_>>(),
            twice.iter().map(|c| (&c.key, &c.record)).collect::<Vec<_>>()
        );
    }

    #[test]
    fn retained_key_set_is_order_independent() {
        let forward = dedupe(sample());
        let mut reversed_input = sample();
        reversed_input.reverse();
        let reversed = dedupe(reversed_input);

        let a: BTreeSet<_> = forward.iter().map(|c| c.key.clone()).collect();
        let b: BTreeSet<_> = reversed.iter().map(|c| c.key.clone()).collect();
        assert_eq!(a, b);

        let muga_key = wine("Bodegas Muga", "Reserva", "Rioja, Spain").identity_key();
        let pick = |records: &[CanonicalWineRecord]| {
            records
                .iter()
                .find(|c| c.key == muga_key)
                .map(|c| c.record.rating)
                .expect("muga retained")
        };
        assert_eq!(pick(&forward), Some(4.1));
        assert_eq!(pick(&reversed), Some(4.1));
    }

    #[test]
    fn empty_places_are_kept_but_not_geocoded() {
        let records = dedupe(sample());
        assert!(records.iter().any(|c| c.record.place.is_empty()));
        let places = unique_places(&records);
        assert_eq!(places.len(), 2);
        assert_eq!(places[0].key(), "rioja, spain");
    }

    #[test]
    fn near_duplicate_places_are_flagged_not_merged() {
        let outcome = Deduplicator::default().dedupe(vec![
            wine("A", "One", "Barossa Valley, Australia"),
            wine("B", "Two", "Barossa Valey, Australia"),
            wine("C", "Three", "Mosel, Germany"),
            wine("D", "Four", "South Australia, Australia"),
        ]);
        assert_eq!(outcome.records.len(), 4);
        assert_eq!(outcome.near_duplicate_places.len(), 1);
        let item = &outcome.near_duplicate_places[0];
        assert_eq!(item.place_a, "Barossa Valley, Australia");
        assert_eq!(item.place_b, "Barossa Valey, Australia");
        assert!(item.similarity >= DedupConfig::default().near_duplicate_threshold);
    }

    #[test]
    fn distinct_places_sharing_a_country_are_not_flagged() {
        let outcome = Deduplicator::default().dedupe(vec![
            wine("A", "One", "South Australia, Australia"),
            wine("B", "Two", "Barossa Valley, Australia"),
            wine("C", "Three", "Rioja, Spain"),
        ]);
        assert!(outcome.near_duplicate_places.is_empty());
    }
}
