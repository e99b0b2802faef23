//! Snapshot, index and per-metro shard files for the static site.

use std::{
    fs::File,
    io::Write,
    path::{Path, PathBuf},
};

use csv::Writer;
use itertools::Itertools;
use rayon::prelude::*;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::{config::BuildConfig, error::Result, metro::MetroRecord};

const LOG_TARGET: &str = "output";

/// Column names of a finished metro row, in output order.
#[derive(Debug, Clone)]
pub struct MetroColumns {
    pub numerical: Vec<String>,
    pub per_capita: Vec<String>,
}

impl MetroColumns {
    pub fn new(config: &BuildConfig) -> Self {
        Self {
            numerical: config.numerical_columns.clone(),
            per_capita: config.per_capita_columns(),
        }
    }

    pub fn header(&self, with_county_names: bool) -> Vec<String> {
        let mut header = vec!["metro_name".to_owned(), "year".to_owned()];
        header.extend(self.numerical.iter().cloned());
        if with_county_names {
            header.push("county_names".to_owned());
        }
        header.push("population".to_owned());
        header.push("metro_type".to_owned());
        header.extend(self.per_capita.iter().cloned());
        header.push("path".to_owned());
        header.push("name".to_owned());
        header
    }

    pub fn row(&self, metro: &MetroRecord, with_county_names: bool) -> Map<String, Value> {
        let mut row = Map::new();
        row.insert("metro_name".to_owned(), Value::from(metro.metro_name.as_str()));
        row.insert("year".to_owned(), Value::from(metro.year.as_str()));
        for (col, value) in self.numerical.iter().zip(&metro.indicators) {
            row.insert(col.clone(), Value::from(*value));
        }
        if with_county_names {
            row.insert("county_names".to_owned(), Value::from(metro.county_names.clone()));
        }
        row.insert("population".to_owned(), Value::from(metro.population));
        row.insert("metro_type".to_owned(), Value::from(metro.metro_type.as_str()));
        for (i, col) in self.per_capita.iter().enumerate() {
            let value = metro.per_capita.get(i).copied().flatten();
            row.insert(col.clone(), optional_number(value));
        }
        row.insert("path".to_owned(), Value::from(metro.path.as_str()));
        row.insert("name".to_owned(), Value::from(metro.metro_name.as_str()));
        row
    }
}

fn optional_number(value: Option<f64>) -> Value {
    // Non-finite floats become null as well.
    value.map(Value::from).unwrap_or(Value::Null)
}

/// Text of a JSON value as it appears in a snapshot cell.
pub fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Array(items) => items.iter().map(cell_text).join("; "),
        other => other.to_string(),
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub metro_name: String,
    pub metro_type: String,
    pub path: String,
    pub county_names: Vec<String>,
}

/// One entry per distinct (name, type, path), sorted by metro name.
pub fn index_entries(metros: &[MetroRecord]) -> Vec<IndexEntry> {
    let mut entries: Vec<IndexEntry> = metros
        .iter()
        .unique_by(|m| (m.metro_name.as_str(), m.metro_type, m.path.as_str()))
        .map(|m| IndexEntry {
            metro_name: m.metro_name.clone(),
            metro_type: m.metro_type.to_string(),
            path: m.path.clone(),
            county_names: m.county_names.clone(),
        })
        .collect();
    entries.sort_by(|a, b| a.metro_name.cmp(&b.metro_name));
    entries
}

/// Rows grouped by path, paths in sorted order, rows in input order.
pub fn shard_rows(metros: &[MetroRecord], columns: &MetroColumns) -> Vec<(String, Vec<Map<String, Value>>)> {
    metros
        .iter()
        .into_group_map_by(|m| m.path.clone())
        .into_iter()
        .sorted_by(|a, b| a.0.cmp(&b.0))
        .map(|(path, group)| {
            let rows = group.into_iter().map(|m| columns.row(m, false)).collect();
            (path, rows)
        })
        .collect()
}

pub fn snapshot_csv(metros: &[MetroRecord], columns: &MetroColumns) -> Result<Vec<u8>> {
    let header = columns.header(true);
    let mut writer = Writer::from_writer(Vec::new());
    writer.write_record(&header)?;

    for metro in metros {
        let row = columns.row(metro, true);
        writer.write_record(header.iter().map(|col| row.get(col).map(cell_text).unwrap_or_default()))?;
    }

    writer.into_inner().map_err(|e| e.into_error().into())
}

/// Hidden name next to `path`, unique to this process.
fn hidden_sibling(path: &Path, suffix: &str) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{}.{}", file_name, std::process::id(), suffix))
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut f = File::create(path)?;
    f.write_all(bytes)?;
    f.sync_all()?;
    Ok(())
}

/// A build's artifacts, written beside their final locations.
///
/// The published outputs do not change until `commit`. Dropping an
/// uncommitted `Staging` removes whatever was written.
struct Staging {
    shard_dir: PathBuf,
    staged_shard_dir: PathBuf,
    // (temporary, final)
    files: Vec<(PathBuf, PathBuf)>,
}

impl Staging {
    fn new(shard_dir: PathBuf) -> Result<Self> {
        let staged_shard_dir = hidden_sibling(&shard_dir, "staging");
        if staged_shard_dir.exists() {
            std::fs::remove_dir_all(&staged_shard_dir)?;
        }
        std::fs::create_dir_all(&staged_shard_dir)?;
        Ok(Self {
            shard_dir,
            staged_shard_dir,
            files: Vec::new(),
        })
    }

    fn shard_path(&self, path: &str) -> PathBuf {
        self.staged_shard_dir.join(format!("{}.json", path))
    }

    fn stage_file(&mut self, path: PathBuf, bytes: &[u8]) -> Result<()> {
        let tmp = hidden_sibling(&path, "tmp");
        self.files.push((tmp.clone(), path));
        write_synced(&tmp, bytes)
    }

    /// Swaps the staged shard directory in, then renames each staged file
    /// over its target.
    fn commit(self) -> Result<()> {
        let previous = hidden_sibling(&self.shard_dir, "previous");
        let had_previous = self.shard_dir.exists();
        if had_previous {
            std::fs::rename(&self.shard_dir, &previous)?;
        }
        if let Err(e) = std::fs::rename(&self.staged_shard_dir, &self.shard_dir) {
            if had_previous {
                let _ = std::fs::rename(&previous, &self.shard_dir);
            }
            return Err(e.into());
        }

        for (tmp, path) in &self.files {
            std::fs::rename(tmp, path)?;
        }

        if had_previous {
            if let Err(e) = std::fs::remove_dir_all(&previous) {
                log::warn!(target: LOG_TARGET, "Could not remove old shards at {}: {}", previous.display(), e);
            }
        }
        Ok(())
    }
}

impl Drop for Staging {
    fn drop(&mut self) {
        // After a commit these paths no longer exist.
        let _ = std::fs::remove_dir_all(&self.staged_shard_dir);
        for (tmp, _) in &self.files {
            let _ = std::fs::remove_file(tmp);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputSummary {
    pub rows: usize,
    pub index_entries: usize,
    pub shards: usize,
}

/// Writes the snapshot, the index and one shard per metro path under `out_dir`.
///
/// Every artifact is staged first. A failed build leaves the previous outputs
/// as they were, and a successful one replaces the whole shard directory, so
/// shards of metros that no longer exist disappear.
pub fn write_outputs(out_dir: &Path, config: &BuildConfig, metros: &[MetroRecord]) -> Result<OutputSummary> {
    config.validate()?;
    let columns = MetroColumns::new(config);

    let shard_dir = out_dir.join(&config.shard_dir);
    if let Some(parent) = shard_dir.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut staging = Staging::new(shard_dir)?;

    let shards = shard_rows(metros, &columns);
    shards
        .par_iter()
        .map(|(path, rows)| -> Result<()> {
            let file = staging.shard_path(path);
            write_synced(&file, &serde_json::to_vec(rows)?)?;
            log::debug!(target: LOG_TARGET, "Staged {} rows in {}", rows.len(), file.display());
            Ok(())
        })
        .collect::<Result<()>>()?;

    let snapshot_path = out_dir.join(&config.snapshot_file);
    staging.stage_file(snapshot_path.clone(), &snapshot_csv(metros, &columns)?)?;

    let index = index_entries(metros);
    let index_path = out_dir.join(&config.index_file);
    staging.stage_file(index_path.clone(), &serde_json::to_vec(&index)?)?;

    staging.commit()?;

    log::info!(target: LOG_TARGET, "Wrote {} rows to {}", metros.len(), snapshot_path.display());
    log::info!(target: LOG_TARGET, "Wrote {} metros to {}", index.len(), index_path.display());
    log::info!(
        target: LOG_TARGET,
        "Wrote {} shards to {}",
        shards.len(),
        out_dir.join(&config.shard_dir).display()
    );

    Ok(OutputSummary {
        rows: metros.len(),
        index_entries: index.len(),
        shards: shards.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metro::{metro_path, MetroType};

    fn metro(name: &str, metro_type: MetroType, year: &str, value: f64, population: f64) -> MetroRecord {
        MetroRecord {
            metro_name: name.to_owned(),
            metro_type,
            year: year.to_owned(),
            indicators: vec![value],
            population,
            county_names: vec!["A County".to_owned(), "B County".to_owned()],
            per_capita: vec![Some(population).filter(|p| *p > 0.0).map(|p| value / p)],
            path: metro_path(name),
        }
    }

    fn config() -> BuildConfig {
        BuildConfig {
            numerical_columns: vec!["units".to_owned()],
            ..Default::default()
        }
    }

    fn sample() -> Vec<MetroRecord> {
        vec![
            metro("Winston/Salem", MetroType::Cbsa, "2019", 4.0, 8.0),
            metro("Winston/Salem", MetroType::Cbsa, "2020", 6.0, 0.0),
            metro("Albany", MetroType::Cbsa, "2020", 1.0, 2.0),
            metro("Albany", MetroType::Csa, "2020", 3.0, 0.0),
        ]
    }

    /// Staged or temporary files left in `dir`.
    fn hidden_entries(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with('.'))
            .collect()
    }

    #[test]
    fn row_columns_in_order() {
        let columns = MetroColumns::new(&config());
        let row = columns.row(&sample()[0], true);
        let keys: Vec<&str> = row.keys().map(|k| k.as_str()).collect();
        assert_eq!(keys, columns.header(true));
        assert_eq!(
            keys,
            vec![
                "metro_name",
                "year",
                "units",
                "county_names",
                "population",
                "metro_type",
                "units_per_capita",
                "path",
                "name"
            ]
        );
        assert_eq!(row["path"], "Winston-Salem");
        assert_eq!(row["name"], "Winston/Salem");
        assert_eq!(row["units_per_capita"], 0.5);

        let row = columns.row(&sample()[1], false);
        assert!(row.get("county_names").is_none());
        assert_eq!(row["units_per_capita"], Value::Null);
        assert_eq!(row["units"], 6.0);
    }

    #[test]
    fn index_is_unique_and_sorted() {
        let index = index_entries(&sample());
        let keys: Vec<(&str, &str)> = index
            .iter()
            .map(|e| (e.metro_name.as_str(), e.metro_type.as_str()))
            .collect();
        assert_eq!(
            keys,
            vec![("Albany", "cbsa"), ("Albany", "csa"), ("Winston/Salem", "cbsa")]
        );
        assert_eq!(index[2].path, "Winston-Salem");
        assert_eq!(index[2].county_names, vec!["A County", "B County"]);
    }

    #[test]
    fn shards_group_every_year_of_a_path() {
        let columns = MetroColumns::new(&config());
        let shards = shard_rows(&sample(), &columns);
        let paths: Vec<&str> = shards.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(paths, vec!["Albany", "Winston-Salem"]);
        assert_eq!(shards[0].1.len(), 2);
        let years: Vec<&Value> = shards[1].1.iter().map(|r| &r["year"]).collect();
        assert_eq!(years, vec!["2019", "2020"]);
    }

    #[test]
    fn writes_all_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let summary = write_outputs(dir.path(), &config(), &sample()).unwrap();
        assert_eq!(
            summary,
            OutputSummary {
                rows: 4,
                index_entries: 3,
                shards: 2
            }
        );

        let index: Value =
            serde_json::from_slice(&std::fs::read(dir.path().join("metros_list.json")).unwrap()).unwrap();
        assert_eq!(index.as_array().unwrap().len(), 3);
        assert_eq!(index[0]["metro_name"], "Albany");
        assert_eq!(index[0]["county_names"][1], "B County");

        let shard: Value = serde_json::from_slice(
            &std::fs::read(dir.path().join("metros_data").join("Winston-Salem.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(shard.as_array().unwrap().len(), 2);
        assert!(shard[0].get("county_names").is_none());

        assert_eq!(hidden_entries(dir.path()), Vec::<String>::new());
        assert_eq!(hidden_entries(&dir.path().join("metros_data")), Vec::<String>::new());
    }

    #[test]
    fn shards_round_trip_to_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let config = config();
        write_outputs(dir.path(), &config, &sample()).unwrap();
        let columns = MetroColumns::new(&config);
        let header = columns.header(false);

        let mut rdr = csv::Reader::from_path(dir.path().join("metros_annual.csv")).unwrap();
        let snapshot_header: Vec<String> = rdr.headers().unwrap().iter().map(|h| h.to_owned()).collect();
        assert_eq!(snapshot_header, columns.header(true));
        let mut from_snapshot: Vec<Vec<String>> = rdr
            .records()
            .map(|r| {
                let r = r.unwrap();
                snapshot_header
                    .iter()
                    .zip(r.iter())
                    .filter(|(col, _)| col.as_str() != "county_names")
                    .map(|(_, cell)| cell.to_owned())
                    .collect()
            })
            .collect();

        let mut from_shards: Vec<Vec<String>> = Vec::new();
        for entry in std::fs::read_dir(dir.path().join("metros_data")).unwrap() {
            let rows: Vec<Map<String, Value>> =
                serde_json::from_slice(&std::fs::read(entry.unwrap().path()).unwrap()).unwrap();
            for row in rows {
                from_shards.push(header.iter().map(|col| cell_text(&row[col.as_str()])).collect());
            }
        }

        from_snapshot.sort();
        from_shards.sort();
        assert_eq!(from_snapshot.len(), 4);
        assert_eq!(from_snapshot, from_shards);
    }

    #[test]
    fn stale_shards_are_removed() {
        let dir = tempfile::tempdir().unwrap();
        let shard_dir = dir.path().join("metros_data");
        std::fs::create_dir_all(&shard_dir).unwrap();
        std::fs::write(shard_dir.join("Gone.json"), "[]").unwrap();

        write_outputs(dir.path(), &config(), &sample()).unwrap();
        assert!(!shard_dir.join("Gone.json").exists());
        assert!(shard_dir.join("Albany.json").exists());
    }

    #[test]
    fn snapshot_joins_county_names() {
        let columns = MetroColumns::new(&config());
        let bytes = snapshot_csv(&sample()[..1], &columns).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            "metro_name,year,units,county_names,population,metro_type,units_per_capita,path,name"
        );
        assert_eq!(
            lines.next().unwrap(),
            "Winston/Salem,2019,4.0,A County; B County,8.0,cbsa,0.5,Winston-Salem,Winston/Salem"
        );
    }

    #[test]
    fn missing_population_is_written_as_zero() {
        let columns = MetroColumns::new(&config());
        let row = columns.row(&sample()[3], true);
        assert_eq!(row["population"], 0.0);
        assert_eq!(row["units_per_capita"], Value::Null);
    }

    #[test]
    fn failed_shard_write_keeps_previous_outputs() {
        let dir = tempfile::tempdir().unwrap();
        write_outputs(dir.path(), &config(), &sample()).unwrap();
        let shard_dir = dir.path().join("metros_data");
        std::fs::write(shard_dir.join("Gone.json"), "[]").unwrap();
        let snapshot = std::fs::read(dir.path().join("metros_annual.csv")).unwrap();
        let index = std::fs::read(dir.path().join("metros_list.json")).unwrap();

        // A NUL byte cannot appear in a file name, so this shard fails to write.
        let mut next = vec![metro("Zed", MetroType::Cbsa, "2020", 9.0, 3.0)];
        next.push(metro("Bad\0Name", MetroType::Cbsa, "2020", 1.0, 1.0));
        assert!(write_outputs(dir.path(), &config(), &next).is_err());

        assert_eq!(std::fs::read(dir.path().join("metros_annual.csv")).unwrap(), snapshot);
        assert_eq!(std::fs::read(dir.path().join("metros_list.json")).unwrap(), index);
        assert!(shard_dir.join("Gone.json").exists());
        assert!(shard_dir.join("Albany.json").exists());
        assert!(!shard_dir.join("Zed.json").exists());
        assert_eq!(hidden_entries(dir.path()), Vec::<String>::new());
    }

    #[test]
    fn shard_dir_cannot_be_the_output_dir() {
        let dir = tempfile::tempdir().unwrap();
        write_outputs(dir.path(), &config(), &sample()).unwrap();

        for shard_dir in ["", ".", "./"] {
            let config = BuildConfig {
                shard_dir: shard_dir.to_owned(),
                ..config()
            };
            assert!(matches!(
                write_outputs(dir.path(), &config, &sample()),
                Err(crate::error::BuildError::Config(_))
            ));
            assert!(dir.path().join("metros_list.json").exists());
            assert!(dir.path().join("metros_annual.csv").exists());
        }
    }
}
