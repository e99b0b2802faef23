//! Joining counties onto metros and reducing them to one row per metro and year.
//!
//! Both metro types run through the same code. The type only decides which
//! crosswalk name a county is grouped under.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt,
    str::FromStr,
};

use crate::{
    counties::CountyRecord,
    crosswalk::Crosswalk,
    error::{BuildError, Result},
};

const LOG_TARGET: &str = "metro";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MetroType {
    Cbsa,
    Csa,
}

impl MetroType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetroType::Cbsa => "cbsa",
            MetroType::Csa => "csa",
        }
    }
}

impl fmt::Display for MetroType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetroType {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cbsa" => Ok(MetroType::Cbsa),
            "csa" => Ok(MetroType::Csa),
            other => Err(BuildError::UnknownMetroType(other.to_owned())),
        }
    }
}

/// County rows keyed by county identity, checked for repeated years.
#[derive(Debug)]
pub struct CountyIndex<'a> {
    by_county: HashMap<(u32, u32), Vec<&'a CountyRecord>>,
}

impl<'a> CountyIndex<'a> {
    pub fn new(counties: &'a [CountyRecord]) -> Result<Self> {
        let mut by_county: HashMap<(u32, u32), Vec<&'a CountyRecord>> = HashMap::new();
        let mut seen: HashSet<(u32, u32, &str)> = HashSet::new();

        for county in counties {
            if !seen.insert((county.fips_state, county.fips_county, county.year.as_str())) {
                return Err(BuildError::DuplicateCountyYear {
                    fips_state: county.fips_state,
                    fips_county: county.fips_county,
                    year: county.year.clone(),
                });
            }
            by_county
                .entry((county.fips_state, county.fips_county))
                .or_default()
                .push(county);
        }

        Ok(Self { by_county })
    }

    /// Counties with data but no crosswalk entry. They belong to no metro.
    pub fn unmapped(&self, crosswalk: &Crosswalk) -> Vec<(u32, u32)> {
        let mut unmapped: Vec<(u32, u32)> = self
            .by_county
            .keys()
            .filter(|(state, county)| crosswalk.lookup(*state, *county).is_none())
            .copied()
            .collect();
        unmapped.sort();
        unmapped
    }
}

/// A county year carrying the name of the metro it belongs to for one pass.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinedRow<'a> {
    pub metro_name: &'a str,
    pub county: &'a CountyRecord,
}

#[derive(Debug)]
pub struct JoinedRows<'a> {
    pub metro_type: MetroType,
    pub rows: Vec<JoinedRow<'a>>,
}

/// Joins the crosswalk to the county data for one metro type.
///
/// Rows follow crosswalk order. Crosswalk counties without data and counties
/// without a name for this metro type produce no rows.
pub fn join_metro_rows<'a>(
    index: &CountyIndex<'a>,
    crosswalk: &'a Crosswalk,
    metro_type: MetroType,
) -> JoinedRows<'a> {
    let mut rows = Vec::new();

    for entry in crosswalk.entries() {
        let metro_name = match entry.metro_name(metro_type) {
            Some(name) => name,
            None => continue,
        };
        if let Some(records) = index.by_county.get(&(entry.fips_state, entry.fips_county)) {
            rows.extend(records.iter().map(|&county| JoinedRow { metro_name, county }));
        }
    }

    log::debug!(target: LOG_TARGET, "Joined {} {} county rows", rows.len(), metro_type);
    JoinedRows { metro_type, rows }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reducer {
    Sum,
    CollectList,
    Count,
}

/// Input column a rule reads from a joined row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Indicator(usize),
    Population,
    CountyName,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateRule {
    pub output: String,
    pub field: Field,
    pub reducer: Reducer,
}

impl AggregateRule {
    fn new(output: &str, field: Field, reducer: Reducer) -> Self {
        Self {
            output: output.to_owned(),
            field,
            reducer,
        }
    }
}

/// How every aggregated column is produced.
pub fn aggregate_rules(numerical_columns: &[String]) -> Vec<AggregateRule> {
    let mut rules: Vec<AggregateRule> = numerical_columns
        .iter()
        .enumerate()
        .map(|(i, col)| AggregateRule::new(col, Field::Indicator(i), Reducer::Sum))
        .collect();

    rules.push(AggregateRule::new("county_names", Field::CountyName, Reducer::CollectList));
    rules.push(AggregateRule::new("population", Field::Population, Reducer::Sum));
    // Lets the completeness check see whether every county reported.
    rules.push(AggregateRule::new("num_observed_counties", Field::CountyName, Reducer::Count));

    rules
}

enum FieldValue<'a> {
    Number(Option<f64>),
    Text(&'a str),
}

fn field_value<'a>(row: &JoinedRow<'a>, field: Field) -> FieldValue<'a> {
    match field {
        Field::Indicator(i) => FieldValue::Number(row.county.indicators.get(i).copied().flatten()),
        Field::Population => FieldValue::Number(row.county.population),
        Field::CountyName => FieldValue::Text(row.county.county_name.as_str()),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Accumulator {
    // Missing values are skipped.
    Sum(f64),
    List(Vec<String>),
    Count(usize),
}

impl Accumulator {
    fn new(reducer: Reducer) -> Self {
        match reducer {
            Reducer::Sum => Accumulator::Sum(0.0),
            Reducer::CollectList => Accumulator::List(Vec::new()),
            Reducer::Count => Accumulator::Count(0),
        }
    }

    fn add(&mut self, value: FieldValue<'_>) {
        match (self, value) {
            (Accumulator::Sum(total), FieldValue::Number(Some(v))) => *total += v,
            (Accumulator::Sum(_), _) => {}
            (Accumulator::List(items), FieldValue::Text(s)) => items.push(s.to_owned()),
            (Accumulator::List(items), FieldValue::Number(v)) => {
                items.push(v.map(|v| v.to_string()).unwrap_or_default())
            }
            (Accumulator::Count(n), _) => *n += 1,
        }
    }
}

/// A metro year straight out of the aggregator, before the completeness check.
///
/// Sums skip missing county values, so an indicator or population nobody
/// reported comes out as `0`.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedMetro {
    pub metro_name: String,
    pub metro_type: MetroType,
    pub year: String,
    pub indicators: Vec<f64>,
    pub population: f64,
    pub county_names: Vec<String>,
    pub observed_county_count: usize,
}

/// Groups joined rows by (metro name, year) and applies the rules.
///
/// Output is sorted by metro name, then year.
pub fn aggregate_metros(joined: &JoinedRows<'_>, rules: &[AggregateRule]) -> Vec<AggregatedMetro> {
    let mut groups: BTreeMap<(&str, &str), Vec<Accumulator>> = BTreeMap::new();

    for row in &joined.rows {
        let accumulators = groups
            .entry((row.metro_name, row.county.year.as_str()))
            .or_insert_with(|| rules.iter().map(|r| Accumulator::new(r.reducer)).collect());

        for (rule, acc) in rules.iter().zip(accumulators.iter_mut()) {
            acc.add(field_value(row, rule.field));
        }
    }

    let n_indicators = rules
        .iter()
        .filter(|r| matches!(r.field, Field::Indicator(_)))
        .count();

    groups
        .into_iter()
        .map(|((metro_name, year), accumulators)| {
            let mut metro = AggregatedMetro {
                metro_name: metro_name.to_owned(),
                metro_type: joined.metro_type,
                year: year.to_owned(),
                indicators: vec![0.0; n_indicators],
                population: 0.0,
                county_names: Vec::new(),
                observed_county_count: 0,
            };

            for (rule, acc) in rules.iter().zip(accumulators) {
                match (rule.field, acc) {
                    (_, Accumulator::Count(n)) => metro.observed_county_count = n,
                    (Field::Indicator(i), Accumulator::Sum(total)) => {
                        if let Some(slot) = metro.indicators.get_mut(i) {
                            *slot = total;
                        }
                    }
                    (Field::Population, Accumulator::Sum(total)) => metro.population = total,
                    (_, Accumulator::List(names)) => metro.county_names = names,
                    (Field::CountyName, Accumulator::Sum(_)) => {}
                }
            }

            metro
        })
        .collect()
}

/// A finished metro year. Per-capita values are empty until derived.
#[derive(Debug, Clone, PartialEq)]
pub struct MetroRecord {
    pub metro_name: String,
    pub metro_type: MetroType,
    pub year: String,
    pub indicators: Vec<f64>,
    pub population: f64,
    pub county_names: Vec<String>,
    pub per_capita: Vec<Option<f64>>,
    pub path: String,
}

impl MetroRecord {
    fn from_aggregated(metro: AggregatedMetro) -> Self {
        let path = metro_path(&metro.metro_name);
        Self {
            metro_name: metro.metro_name,
            metro_type: metro.metro_type,
            year: metro.year,
            indicators: metro.indicators,
            population: metro.population,
            county_names: metro.county_names,
            per_capita: Vec::new(),
            path,
        }
    }
}

/// URL-safe form of a metro name.
pub fn metro_path(metro_name: &str) -> String {
    metro_name.replace('/', "-")
}

/// Drops partial-year metro rows that are missing counties.
///
/// Only rows for `partial_year` are checked: they survive when every county
/// the crosswalk puts in the metro reported. Other years always survive.
pub fn filter_complete(
    metros: Vec<AggregatedMetro>,
    county_totals: &HashMap<String, usize>,
    partial_year: &str,
) -> Vec<MetroRecord> {
    let before = metros.len();

    let kept: Vec<MetroRecord> = metros
        .into_iter()
        .filter(|metro| {
            if metro.year != partial_year {
                return true;
            }
            let total = county_totals.get(&metro.metro_name).copied();
            let complete = total == Some(metro.observed_county_count);
            if !complete {
                log::debug!(
                    target: LOG_TARGET,
                    "Dropping {} {} {}: {} of {:?} counties reported",
                    metro.metro_type,
                    metro.metro_name,
                    metro.year,
                    metro.observed_county_count,
                    total
                );
            }
            complete
        })
        .map(MetroRecord::from_aggregated)
        .collect();

    log::info!(
        target: LOG_TARGET,
        "Completeness check dropped {} of {} metro rows for {}",
        before - kept.len(),
        before,
        partial_year
    );

    kept
}

/// Runs one metro-type pass: join, aggregate, completeness check.
pub fn combine_metro_rows(
    index: &CountyIndex<'_>,
    crosswalk: &Crosswalk,
    metro_type: MetroType,
    numerical_columns: &[String],
    partial_year: &str,
) -> Vec<MetroRecord> {
    let joined = join_metro_rows(index, crosswalk, metro_type);
    let rules = aggregate_rules(numerical_columns);
    let aggregated = aggregate_metros(&joined, &rules);
    let totals = crosswalk.county_totals(metro_type);
    let metros = filter_complete(aggregated, &totals, partial_year);

    log::info!(target: LOG_TARGET, "Built {} {} rows", metros.len(), metro_type);
    metros
}
