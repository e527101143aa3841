//! Per-run report files and the Parquet handoff for the relational loader.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Float64Array, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::info;
use uuid::Uuid;
use vinloc_core::{CanonicalWineRecord, ChosenSource, PlaceName, ReconciledLocation};

use crate::dedup::PlaceReviewItem;
use crate::quality::{country_breakdown, CountryStats, QualityReport};
use crate::resolve::LookupFailure;

/// Wine labels listed per map feature.
pub const MAX_LABELS_PER_PLACE: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub input: String,
    pub source_mode: String,
    pub divergence_threshold_km: f64,
    pub input_records: usize,
    pub invalid_records: usize,
    pub canonical_records: usize,
    pub duplicates_removed: usize,
    pub unique_places: usize,
    pub cache_hits: usize,
    pub source_queries: usize,
}

/// Everything one run produced, in memory.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub run: RunRecord,
    pub wines: Vec<CanonicalWineRecord>,
    pub locations: Vec<ReconciledLocation>,
    pub quality: QualityReport,
    pub lookup_failures: Vec<LookupFailure>,
    pub near_duplicate_places: Vec<PlaceReviewItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub run_id: Uuid,
    pub files: Vec<SnapshotManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct ReportPaths {
    pub reports_dir: PathBuf,
    pub manifest: PathBuf,
}

pub async fn write_reports(workspace_root: &Path, output: &RunOutput) -> Result<ReportPaths> {
    let reports_dir = workspace_root
        .join("reports")
        .join(output.run.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let by_country = country_breakdown(&output.locations, &output.wines);
    write_json(&reports_dir.join("reconciled_locations.json"), &output.locations).await?;
    write_json(
        &reports_dir.join("quality_report.json"),
        &json!({
            "run": output.run,
            "quality": output.quality,
            "by_country": by_country,
            "lookup_failures": output.lookup_failures,
            "near_duplicate_places": output.near_duplicate_places,
        }),
    )
    .await?;
    write_json(&reports_dir.join("canonical_wines.json"), &output.wines).await?;
    write_json(
        &reports_dir.join("wines_map.geojson"),
        &wines_geojson(&output.locations, &output.wines),
    )
    .await?;
    fs::write(reports_dir.join("run_brief.md"), run_brief(output, &by_country))
        .await
        .context("writing run_brief.md")?;

    let manifest = export_parquet_snapshots(&reports_dir, output).await?;
    info!(
        run_id = %output.run.run_id,
        reports_dir = %reports_dir.display(),
        "wrote run reports"
    );
    Ok(ReportPaths {
        reports_dir,
        manifest,
    })
}

async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)
        .with_context(|| format!("serializing {}", path.display()))?;
    fs::write(path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))
}

/// GeoJSON FeatureCollection with one point per located place.
pub fn wines_geojson(locations: &[ReconciledLocation], wines: &[CanonicalWineRecord]) -> Value {
    let mut by_place: HashMap<String, Vec<&CanonicalWineRecord>> = HashMap::new();
    for wine in wines {
        if let Some(place) = wine.record.place_name() {
            by_place.entry(place.key().to_string()).or_default().push(wine);
        }
    }

    let features: Vec<Value> = locations
        .iter()
        .filter_map(|loc| {
            let coord = loc.chosen_coord?;
            let here = place_key(&loc.place_name)
                .and_then(|k| by_place.get(&k))
                .map(Vec::as_slice)
                .unwrap_or_default();
            let labels: Vec<String> = here
                .iter()
                .take(MAX_LABELS_PER_PLACE)
                .map(|w| w.record.label())
                .collect();
            Some(json!({
                "type": "Feature",
                "geometry": {
                    "type": "Point",
                    "coordinates": [coord.longitude(), coord.latitude()],
                },
                "properties": {
                    "place": loc.place_name,
                    "country": loc.country,
                    "chosen_source": loc.chosen_source,
                    "disagreement_km": loc.disagreement_km,
                    "primary_lat": loc.primary_coord.map(|c| c.latitude()),
                    "primary_lon": loc.primary_coord.map(|c| c.longitude()),
                    "secondary_lat": loc.secondary_coord.map(|c| c.latitude()),
                    "secondary_lon": loc.secondary_coord.map(|c| c.longitude()),
                    "wine_count": here.len(),
                    "wines": labels,
                },
            }))
        })
        .collect();

    json!({
        "type": "FeatureCollection",
        "features": features,
    })
}

fn place_key(display: &str) -> Option<String> {
    PlaceName::new(display).map(|p| p.key().to_string())
}

fn run_brief(output: &RunOutput, by_country: &BTreeMap<String, CountryStats>) -> String {
    let run = &output.run;
    let quality = &output.quality;
    let mut lines = vec![
        "# Wine Location Run Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", run.run_id),
        format!("- Started: {}", run.started_at),
        format!("- Finished: {}", run.finished_at),
        format!("- Input: `{}` ({} sources)", run.input, run.source_mode),
        format!(
            "- Records: {} read, {} invalid, {} canonical ({} duplicates removed)",
            run.input_records, run.invalid_records, run.canonical_records, run.duplicates_removed
        ),
        format!(
            "- Places: {} unique, {} located ({:.1}% coverage)",
            quality.total_places,
            quality.located_places,
            quality.coverage * 100.0
        ),
        format!(
            "- Lookups: {} from cache, {} from sources, {} failed",
            run.cache_hits,
            run.source_queries,
            output.lookup_failures.len()
        ),
        format!("- Divergence threshold: {} km", run.divergence_threshold_km),
        String::new(),
        "## Chosen Sources".to_string(),
    ];
    for source in ChosenSource::ALL {
        lines.push(format!("- {}: {}", source, quality.count(source)));
    }

    if let Some(stats) = &quality.disagreement {
        lines.push(String::new());
        lines.push("## Disagreement".to_string());
        lines.push(format!(
            "- {} places with both sources; mean {:.2} km, median {:.2} km, p95 {:.2} km, max {:.2} km",
            stats.count, stats.mean_km, stats.median_km, stats.p95_km, stats.max_km
        ));
    }

    if !quality.top_outliers.is_empty() {
        lines.push(String::new());
        lines.push("## Top Outliers".to_string());
        for outlier in &quality.top_outliers {
            lines.push(format!(
                "- {}: {:.1} km ({})",
                outlier.place_name, outlier.disagreement_km, outlier.chosen_source
            ));
        }
    }

    if !by_country.is_empty() {
        lines.push(String::new());
        lines.push("## By Country".to_string());
        let mut countries: Vec<_> = by_country.iter().collect();
        countries.sort_by(|a, b| b.1.wines.cmp(&a.1.wines).then_with(|| a.0.cmp(b.0)));
        for (country, stats) in countries {
            let rating = stats
                .avg_rating
                .map(|r| format!("{r:.2}"))
                .unwrap_or_else(|| "n/a".to_string());
            lines.push(format!(
                "- {}: {} places ({} located), {} wines, avg rating {}",
                country, stats.places, stats.located, stats.wines, rating
            ));
        }
    }

    if !output.near_duplicate_places.is_empty() {
        lines.push(String::new());
        lines.push("## Places To Review".to_string());
        for item in &output.near_duplicate_places {
            lines.push(format!(
                "- `{}` vs `{}` ({:.3})",
                item.place_a, item.place_b, item.similarity
            ));
        }
    }

    lines.push(String::new());
    lines.join("\n")
}

async fn export_parquet_snapshots(reports_dir: &Path, output: &RunOutput) -> Result<PathBuf> {
    let snapshot_dir = reports_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let places_path = snapshot_dir.join("places.parquet");
    let wines_path = snapshot_dir.join("wines.parquet");

    let place_ids = write_places_parquet(&places_path, &output.locations)?;
    write_wines_parquet(&wines_path, &output.wines, &place_ids)?;

    let manifest = SnapshotManifest {
        schema_version: 1,
        run_id: output.run.run_id,
        files: vec![
            manifest_entry("places", reports_dir, &places_path)?,
            manifest_entry("wines", reports_dir, &wines_path)?,
        ],
    };

    let manifest_path = snapshot_dir.join("manifest.json");
    write_json(&manifest_path, &manifest).await?;
    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

/// Writes one row per place and returns `place key -> place_id` (1-based).
fn write_places_parquet(path: &Path, locations: &[ReconciledLocation]) -> Result<HashMap<String, u32>> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("place_id", DataType::UInt32, false),
        ArrowField::new("place_name", DataType::Utf8, false),
        ArrowField::new("country", DataType::Utf8, true),
        ArrowField::new("latitude", DataType::Float64, true),
        ArrowField::new("longitude", DataType::Float64, true),
        ArrowField::new("chosen_source", DataType::Utf8, false),
        ArrowField::new("disagreement_km", DataType::Float64, true),
        ArrowField::new("primary_latitude", DataType::Float64, true),
        ArrowField::new("primary_longitude", DataType::Float64, true),
        ArrowField::new("secondary_latitude", DataType::Float64, true),
        ArrowField::new("secondary_longitude", DataType::Float64, true),
    ]));

    let mut ids = HashMap::new();
    let mut id_column = Vec::with_capacity(locations.len());
    for (idx, loc) in locations.iter().enumerate() {
        let id = u32::try_from(idx + 1).context("too many places for a u32 place_id")?;
        if let Some(key) = place_key(&loc.place_name) {
            ids.entry(key).or_insert(id);
        }
        id_column.push(id);
    }

    let names = StringArray::from(
        locations
            .iter()
            .map(|l| Some(l.place_name.as_str()))
            .collect::<Vec<_>>(),
    );
    let countries = StringArray::from(
        locations
            .iter()
            .map(|l| l.country.as_deref())
            .collect::<Vec<_>>(),
    );
    let lat = |c: Option<vinloc_core::Coordinate>| c.map(|c| c.latitude());
    let lon = |c: Option<vinloc_core::Coordinate>| c.map(|c| c.longitude());
    let chosen_sources = StringArray::from(
        locations
            .iter()
            .map(|l| Some(l.chosen_source.as_str()))
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(UInt32Array::from(id_column)),
            Arc::new(names),
            Arc::new(countries),
            Arc::new(Float64Array::from(
                locations.iter().map(|l| lat(l.chosen_coord)).collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(
                locations.iter().map(|l| lon(l.chosen_coord)).collect::<Vec<_>>(),
            )),
            Arc::new(chosen_sources),
            Arc::new(Float64Array::from(
                locations.iter().map(|l| l.disagreement_km).collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(
                locations.iter().map(|l| lat(l.primary_coord)).collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(
                locations.iter().map(|l| lon(l.primary_coord)).collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(
                locations.iter().map(|l| lat(l.secondary_coord)).collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(
                locations.iter().map(|l| lon(l.secondary_coord)).collect::<Vec<_>>(),
            )),
        ],
    )
    .context("building places record batch")?;
    write_parquet(path, batch)?;
    Ok(ids)
}

fn write_wines_parquet(
    path: &Path,
    wines: &[CanonicalWineRecord],
    place_ids: &HashMap<String, u32>,
) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("vineyard", DataType::Utf8, false),
        ArrowField::new("name", DataType::Utf8, false),
        ArrowField::new("place_id", DataType::UInt32, true),
        ArrowField::new("rating", DataType::Float64, true),
        ArrowField::new("price", DataType::Float64, true),
        ArrowField::new("grapes", DataType::Utf8, true),
        ArrowField::new("region", DataType::Utf8, true),
        ArrowField::new("style", DataType::Utf8, true),
        ArrowField::new("allergens", DataType::Utf8, true),
        ArrowField::new("description", DataType::Utf8, true),
        ArrowField::new("url", DataType::Utf8, true),
        ArrowField::new("merged_count", DataType::UInt32, false),
    ]));

    let text = |f: fn(&CanonicalWineRecord) -> Option<&str>| {
        StringArray::from(wines.iter().map(f).collect::<Vec<_>>())
    };
    let ids = UInt32Array::from(
        wines
            .iter()
            .map(|w| {
                w.record
                    .place_name()
                    .and_then(|p| place_ids.get(p.key()).copied())
            })
            .collect::<Vec<_>>(),
    );
    let merged = UInt32Array::from(
        wines
            .iter()
            .map(|w| u32::try_from(w.merged_count).unwrap_or(u32::MAX))
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(text(|w| Some(w.record.vineyard.as_str()))),
            Arc::new(text(|w| Some(w.record.name.as_str()))),
            Arc::new(ids),
            Arc::new(Float64Array::from(
                wines.iter().map(|w| w.record.rating).collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(
                wines.iter().map(|w| w.record.price).collect::<Vec<_>>(),
            )),
            Arc::new(text(|w| w.record.grapes.as_deref())),
            Arc::new(text(|w| w.record.region.as_deref())),
            Arc::new(text(|w| w.record.style.as_deref())),
            Arc::new(text(|w| w.record.allergens.as_deref())),
            Arc::new(text(|w| w.record.description.as_deref())),
            Arc::new(text(|w| w.record.url.as_deref())),
            Arc::new(merged),
        ],
    )
    .context("building wines record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, reports_dir: &Path, path: &Path) -> Result<SnapshotManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(reports_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(SnapshotManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}

/// Markdown digest of the most recent `runs` report directories.
pub fn report_markdown(runs: usize, workspace_root: Option<PathBuf>) -> Result<String> {
    let root = workspace_root.unwrap_or_else(|| PathBuf::from("."));
    let reports_root = root.join("reports");
    let mut dirs = std::fs::read_dir(&reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .map(|entry| {
            let path = entry.path();
            let finished = read_run_record(&path).map(|r| r.finished_at).ok();
            (finished, path)
        })
        .collect::<Vec<_>>();
    dirs.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));

    let mut lines = vec!["# Wine Location Runs".to_string(), String::new()];
    for (_, dir) in dirs.into_iter().take(runs.max(1)) {
        let quality_path = dir.join("quality_report.json");
        let value: Value = serde_json::from_str(
            &std::fs::read_to_string(&quality_path)
                .with_context(|| format!("reading {}", quality_path.display()))?,
        )
        .with_context(|| format!("parsing {}", quality_path.display()))?;
        let quality = value.get("quality");
        let number = |key: &str| {
            quality
                .and_then(|q| q.get(key))
                .and_then(Value::as_f64)
                .unwrap_or(0.0)
        };
        let failures = value
            .get("lookup_failures")
            .and_then(Value::as_array)
            .map(Vec::len)
            .unwrap_or(0);

        let run_id = dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        lines.push(format!("## Run `{run_id}`"));
        lines.push(format!(
            "- places: {} ({} located, {:.1}% coverage)",
            number("total_places"),
            number("located_places"),
            number("coverage") * 100.0
        ));
        lines.push(format!("- lookup failures: {failures}"));
        lines.push(format!("- quality report: `{}`", quality_path.display()));
        let manifest_path = dir.join("snapshots").join("manifest.json");
        if manifest_path.exists() {
            lines.push(format!("- parquet manifest: `{}`", manifest_path.display()));
        }
        let brief_path = dir.join("run_brief.md");
        if brief_path.exists() {
            lines.push(format!("- run brief: `{}`", brief_path.display()));
        }
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}

fn read_run_record(dir: &Path) -> Result<RunRecord> {
    let path = dir.join("quality_report.json");
    let value: Value = serde_json::from_str(
        &std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?,
    )
    .with_context(|| format!("parsing {}", path.display()))?;
    let run = value.get("run").cloned().unwrap_or(Value::Null);
    serde_json::from_value(run).with_context(|| format!("decoding run record in {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quality::{summarize, QualityConfig};
    use crate::reconcile::Reconciler;
    use chrono::TimeZone;
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use tempfile::tempdir;
    use vinloc_core::{Coordinate, RawWineInput};

    fn coord(lat: f64, lon: f64) -> Coordinate {
        Coordinate::new(lat, lon).expect("coordinate")
    }

    fn wine(vineyard: &str, name: &str, place: &str) -> CanonicalWineRecord {
        let record = RawWineInput {
            vineyard: Some(vineyard.into()),
            name: Some(name.into()),
            place: Some(place.into()),
            ..Default::default()
        }
        .validate()
        .expect("valid");
        CanonicalWineRecord {
            key: record.identity_key(),
            record,
            merged_count: 1,
        }
    }

    fn sample_output() -> RunOutput {
        let reconciler = Reconciler::default();
        let douro = PlaceName::new("Douro, Portugal").expect("place");
        let atlantis = PlaceName::new("Atlantis").expect("place");
        let locations = vec![
            reconciler.reconcile(&douro, Some(coord(41.16, -7.78)), Some(coord(41.10, -7.80))),
            reconciler.reconcile(&atlantis, None, None),
        ];
        let mut wines: Vec<_> = (0..12)
            .map(|i| wine("Quinta do Crasto", &format!("Cuvee {i}"), "Douro, Portugal"))
            .collect();
        wines.push(wine("Lost", "Myth", "Atlantis"));
        wines.push(wine("Nomad", "Blend", ""));

        let started = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).single().expect("ts");
        RunOutput {
            run: RunRecord {
                run_id: Uuid::new_v4(),
                started_at: started,
                finished_at: started,
                input: "fixtures/wines.json".into(),
                source_mode: "fixtures".into(),
                divergence_threshold_km: 50.0,
                input_records: 14,
                invalid_records: 0,
                canonical_records: 14,
                duplicates_removed: 0,
                unique_places: 2,
                cache_hits: 0,
                source_queries: 4,
            },
            quality: summarize(&locations, &QualityConfig::default()),
            wines,
            locations,
            lookup_failures: Vec::new(),
            near_duplicate_places: Vec::new(),
        }
    }

    #[test]
    fn geojson_lists_located_places_with_capped_labels() {
        let output = sample_output();
        let geo = wines_geojson(&output.locations, &output.wines);
        let features = geo["features"].as_array().expect("features");
        assert_eq!(features.len(), 1);
        let props = &features[0]["properties"];
        assert_eq!(props["wine_count"], 12);
        assert_eq!(props["wines"].as_array().map(Vec::len), Some(MAX_LABELS_PER_PLACE));
        assert_eq!(props["wines"][0], "Cuvee 0 (Quinta do Crasto)");
        assert_eq!(props["country"], "Portugal");
        assert_eq!(features[0]["geometry"]["coordinates"][0], -7.78);
        assert_eq!(props["primary_lat"], 41.16);
        assert_eq!(props["primary_lon"], -7.78);
        assert_eq!(props["secondary_lat"], 41.10);
        assert_eq!(props["secondary_lon"], -7.80);
    }

    #[test]
    fn geojson_leaves_missing_source_coordinates_null() {
        let reconciler = Reconciler::default();
        let mosel = PlaceName::new("Mosel, Germany").expect("place");
        let locations = vec![reconciler.reconcile(&mosel, Some(coord(49.95, 7.1)), None)];
        let geo = wines_geojson(&locations, &[wine("Loosen", "Riesling", "Mosel, Germany")]);
        let props = &geo["features"][0]["properties"];
        assert_eq!(props["primary_lat"], 49.95);
        assert!(props["secondary_lat"].is_null());
        assert!(props["secondary_lon"].is_null());
    }

    #[tokio::test]
    async fn country_breakdown_lands_in_quality_report_and_brief() {
        let dir = tempdir().expect("tempdir");
        let mut output = sample_output();
        output.wines[0].record.rating = Some(4.0);
        output.wines[1].record.rating = Some(4.5);
        let paths = write_reports(dir.path(), &output).await.expect("reports");

        let report: Value = serde_json::from_str(
            &std::fs::read_to_string(paths.reports_dir.join("quality_report.json")).expect("report"),
        )
        .expect("decode report");
        let portugal = &report["by_country"]["Portugal"];
        assert_eq!(portugal["places"], 1);
        assert_eq!(portugal["located"], 1);
        assert_eq!(portugal["wines"], 12);
        assert_eq!(portugal["avg_rating"], 4.25);
        let atlantis = &report["by_country"]["Atlantis"];
        assert_eq!(atlantis["located"], 0);
        assert_eq!(atlantis["wines"], 1);
        assert!(atlantis["avg_rating"].is_null());

        let brief = std::fs::read_to_string(paths.reports_dir.join("run_brief.md")).expect("brief");
        assert!(brief.contains("## By Country"));
        assert!(brief.contains("- Portugal: 1 places (1 located), 12 wines, avg rating 4.25"));
        assert!(brief.contains("- Atlantis: 1 places (0 located), 1 wines, avg rating n/a"));
        let portugal_at = brief.find("- Portugal:").expect("portugal line");
        let atlantis_at = brief.find("- Atlantis:").expect("atlantis line");
        assert!(portugal_at < atlantis_at);
    }

    #[tokio::test]
    async fn writes_all_report_files_and_manifest() {
        let dir = tempdir().expect("tempdir");
        let output = sample_output();
        let paths = write_reports(dir.path(), &output).await.expect("reports");

        for name in [
            "reconciled_locations.json",
            "quality_report.json",
            "canonical_wines.json",
            "wines_map.geojson",
            "run_brief.md",
            "snapshots/places.parquet",
            "snapshots/wines.parquet",
        ] {
            assert!(paths.reports_dir.join(name).exists(), "missing {name}");
        }

        let manifest: SnapshotManifest = serde_json::from_str(
            &std::fs::read_to_string(&paths.manifest).expect("manifest"),
        )
        .expect("decode manifest");
        assert_eq!(manifest.files.len(), 2);
        for file in &manifest.files {
            let bytes = std::fs::read(paths.reports_dir.join(&file.path)).expect("snapshot");
            assert_eq!(file.bytes, bytes.len() as u64);
            assert_eq!(file.sha256, hex::encode(Sha256::digest(&bytes)));
        }

        let rows = |name: &str| {
            let file = File::open(paths.reports_dir.join("snapshots").join(name)).expect("open");
            ParquetRecordBatchReaderBuilder::try_new(file)
                .expect("reader")
                .metadata()
                .file_metadata()
                .num_rows()
        };
        assert_eq!(rows("places.parquet"), 2);
        assert_eq!(rows("wines.parquet"), 14);

        let brief = std::fs::read_to_string(paths.reports_dir.join("run_brief.md")).expect("brief");
        assert!(brief.contains("- PRIMARY: 1"));
        assert!(brief.contains("- NONE: 1"));
    }

    #[tokio::test]
    async fn report_markdown_summarizes_latest_runs() {
        let dir = tempdir().expect("tempdir");
        let output = sample_output();
        write_reports(dir.path(), &output).await.expect("reports");

        let md = report_markdown(5, Some(dir.path().to_path_buf())).expect("markdown");
        assert!(md.contains(&format!("## Run `{}`", output.run.run_id)));
        assert!(md.contains("- places: 2 (1 located, 50.0% coverage)"));
        assert!(md.contains("- lookup failures: 0"));
    }
}
