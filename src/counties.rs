use std::{io, path::Path};

use csv::{ReaderBuilder, StringRecord, Trim};
use regex::Regex;

use crate::{
    config::BuildConfig,
    crosswalk::{check_columns, parse_fips},
    error::{BuildError, Result},
};

const LOG_TARGET: &str = "counties";
const TABLE: &str = "counties";

const IDENTITY_COLUMNS: [&str; 5] = ["county_name", "fips_state", "fips_county", "year", "population"];

// Present in the county dataset but meaningless once counties are merged.
const IGNORED_COLUMNS: [&str; 3] = ["region_code", "division_code", "survey_date"];

/// One county's statistics for one year.
///
/// `indicators` follows the order of `BuildConfig::numerical_columns`.
#[derive(Debug, Clone, PartialEq)]
pub struct CountyRecord {
    pub county_name: String,
    pub fips_state: u32,
    pub fips_county: u32,
    pub year: String,
    pub population: Option<f64>,
    pub indicators: Vec<Option<f64>>,
}

fn per_capita_pattern() -> Result<Regex> {
    Ok(Regex::new(r"_per_capita$")?)
}

pub fn load_counties_path<P: AsRef<Path>>(path: P, config: &BuildConfig) -> Result<Vec<CountyRecord>> {
    let file = std::fs::File::open(path)?;
    load_counties(file, config)
}

/// Reads county rows, keeping only the columns the metro build needs.
///
/// Per-capita columns on the input are stripped; they are recomputed from the
/// metro sums, never carried over.
pub fn load_counties<R: io::Read>(reader: R, config: &BuildConfig) -> Result<Vec<CountyRecord>> {
    let per_capita = per_capita_pattern()?;
    if let Some(col) = config.numerical_columns.iter().find(|c| per_capita.is_match(c)) {
        return Err(BuildError::Config(format!(
            "numerical column '{}' is a per-capita column",
            col
        )));
    }

    let mut rdr = ReaderBuilder::new()
        .has_headers(true)
        .trim(Trim::Headers)
        .from_reader(reader);
    let headers = rdr.headers()?.clone();

    check_columns(TABLE, &headers, &IDENTITY_COLUMNS)?;
    let required: Vec<&str> = config.numerical_columns.iter().map(|c| c.as_str()).collect();
    check_columns(TABLE, &headers, &required)?;

    let stripped: Vec<&str> = headers
        .iter()
        .filter(|h| per_capita.is_match(h.trim()) || IGNORED_COLUMNS.contains(&h.trim()))
        .collect();
    log::debug!(target: LOG_TARGET, "Dropping input columns: {:?}", stripped);

    let position = |name: &str| -> usize {
        // check_columns guarantees presence.
        headers.iter().position(|h| h.trim() == name).unwrap_or_default()
    };
    let county_name_idx = position("county_name");
    let fips_state_idx = position("fips_state");
    let fips_county_idx = position("fips_county");
    let year_idx = position("year");
    let population_idx = position("population");
    let indicator_idx: Vec<(usize, &str)> = required.iter().map(|c| (position(c), *c)).collect();

    let mut counties = Vec::new();
    let mut record = StringRecord::new();

    while rdr.read_record(&mut record)? {
        let line = record.position().map(|p| p.line()).unwrap_or_default();

        let year = record.get(year_idx).unwrap_or("").trim();
        if year.is_empty() {
            return Err(invalid(line, "year", year));
        }

        let mut indicators = Vec::with_capacity(indicator_idx.len());
        for (idx, column) in &indicator_idx {
            indicators.push(parse_number(line, column, record.get(*idx))?);
        }

        counties.push(CountyRecord {
            county_name: record.get(county_name_idx).unwrap_or("").trim().to_owned(),
            fips_state: parse_fips(TABLE, "fips_state", line, record.get(fips_state_idx))?,
            fips_county: parse_fips(TABLE, "fips_county", line, record.get(fips_county_idx))?,
            year: year.to_owned(),
            population: parse_number(line, "population", record.get(population_idx))?,
            indicators,
        });
    }

    log::info!(target: LOG_TARGET, "Loaded {} county rows", counties.len());
    Ok(counties)
}

/// Empty cells are missing values, anything else must parse to a finite number.
fn parse_number(line: u64, column: &str, value: Option<&str>) -> Result<Option<f64>> {
    let raw = value.unwrap_or("").trim();
    if raw.is_empty() || raw.eq_ignore_ascii_case("nan") {
        return Ok(None);
    }
    match raw.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(Some(v)),
        _ => Err(invalid(line, column, raw)),
    }
}

fn invalid(line: u64, column: &str, value: &str) -> BuildError {
    BuildError::InvalidValue {
        table: TABLE.to_owned(),
        column: column.to_owned(),
        line,
        value: value.to_owned(),
    }
}
