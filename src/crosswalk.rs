use std::{
    collections::{hash_map::Entry, HashMap},
    io,
    path::Path,
};

use csv::{ReaderBuilder, StringRecord, Trim};

use crate::{
    error::{BuildError, Result},
    metro::MetroType,
};

const LOG_TARGET: &str = "crosswalk";
const TABLE: &str = "crosswalk";

/// Raw row of the NBER cbsa2fipsxw layout.
#[derive(serde::Deserialize)]
struct CrosswalkRow {
    #[serde(rename = "fipsstatecode")]
    fips_state: Option<String>,
    #[serde(rename = "fipscountycode")]
    fips_county: Option<String>,
    #[serde(rename = "csatitle")]
    csa_name: Option<String>,
    #[serde(rename = "cbsatitle")]
    cbsa_name: Option<String>,
}

const REQUIRED_COLUMNS: [&str; 4] = ["fipsstatecode", "fipscountycode", "csatitle", "cbsatitle"];

#[derive(Debug, Clone, PartialEq)]
pub struct CrosswalkEntry {
    pub fips_state: u32,
    pub fips_county: u32,
    pub csa_name: Option<String>,
    pub cbsa_name: String,
}

impl CrosswalkEntry {
    pub fn metro_name(&self, metro_type: MetroType) -> Option<&str> {
        match metro_type {
            MetroType::Cbsa => Some(self.cbsa_name.as_str()),
            MetroType::Csa => self.csa_name.as_deref(),
        }
    }
}

/// County to metro mapping, one entry per county, every entry with a CBSA.
#[derive(Debug, Default)]
pub struct Crosswalk {
    entries: Vec<CrosswalkEntry>,
    index: HashMap<(u32, u32), usize>,
}

impl Crosswalk {
    pub fn new(entries: Vec<CrosswalkEntry>) -> Self {
        let mut crosswalk = Crosswalk::default();
        for entry in entries {
            crosswalk.push(entry);
        }
        crosswalk
    }

    fn push(&mut self, entry: CrosswalkEntry) {
        match self.index.entry((entry.fips_state, entry.fips_county)) {
            Entry::Occupied(_) => {
                log::warn!(
                    target: LOG_TARGET,
                    "Ignoring repeated crosswalk entry for county {}/{}",
                    entry.fips_state,
                    entry.fips_county
                );
            }
            Entry::Vacant(slot) => {
                slot.insert(self.entries.len());
                self.entries.push(entry);
            }
        }
    }

    pub fn entries(&self) -> &[CrosswalkEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn lookup(&self, fips_state: u32, fips_county: u32) -> Option<&CrosswalkEntry> {
        self.index
            .get(&(fips_state, fips_county))
            .map(|&i| &self.entries[i])
    }

    /// Number of counties the crosswalk assigns to each metro of the given type.
    pub fn county_totals(&self, metro_type: MetroType) -> HashMap<String, usize> {
        let mut totals: HashMap<String, usize> = HashMap::new();
        for name in self.entries.iter().filter_map(|e| e.metro_name(metro_type)) {
            *totals.entry(name.to_owned()).or_default() += 1;
        }
        totals
    }
}

pub fn load_crosswalk_path<P: AsRef<Path>>(path: P) -> Result<Crosswalk> {
    let file = std::fs::File::open(path)?;
    load_crosswalk(file)
}

/// Reads the crosswalk, dropping rows without a CBSA title.
pub fn load_crosswalk<R: io::Read>(reader: R) -> Result<Crosswalk> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(true)
        .trim(Trim::Headers)
        .from_reader(reader);

    let headers = rdr.headers()?.clone();
    check_columns(TABLE, &headers, &REQUIRED_COLUMNS)?;

    let mut crosswalk = Crosswalk::default();
    let mut without_cbsa = 0;
    let mut record = StringRecord::new();

    while rdr.read_record(&mut record)? {
        let line = record.position().map(|p| p.line()).unwrap_or_default();
        let row: CrosswalkRow = record.deserialize(Some(&headers))?;

        let cbsa_name = match normalize_name(row.cbsa_name) {
            Some(name) => name,
            None => {
                without_cbsa += 1;
                continue;
            }
        };

        crosswalk.push(CrosswalkEntry {
            fips_state: parse_fips(TABLE, "fipsstatecode", line, row.fips_state.as_deref())?,
            fips_county: parse_fips(TABLE, "fipscountycode", line, row.fips_county.as_deref())?,
            csa_name: normalize_name(row.csa_name),
            cbsa_name,
        });
    }

    if crosswalk.is_empty() && without_cbsa > 0 {
        log::warn!(target: LOG_TARGET, "None of the {} crosswalk rows has a CBSA title", without_cbsa);
    }
    log::info!(
        target: LOG_TARGET,
        "Loaded {} crosswalk entries ({} without a CBSA dropped)",
        crosswalk.len(),
        without_cbsa
    );

    Ok(crosswalk)
}

fn normalize_name(name: Option<String>) -> Option<String> {
    name.map(|n| n.trim().to_owned()).filter(|n| !n.is_empty())
}

pub(crate) fn check_columns(table: &str, headers: &StringRecord, required: &[&str]) -> Result<()> {
    for column in required {
        if !headers.iter().any(|h| h.trim() == *column) {
            return Err(BuildError::SchemaMismatch {
                table: table.to_owned(),
                column: (*column).to_owned(),
            });
        }
    }
    Ok(())
}

/// FIPS codes are compared numerically so "001" and "1" name the same county.
pub(crate) fn parse_fips(table: &str, column: &str, line: u64, value: Option<&str>) -> Result<u32> {
    let raw = value.unwrap_or("").trim();
    // Some exports write integer columns as floats.
    let digits = raw.strip_suffix(".0").unwrap_or(raw);
    digits.parse::<u32>().map_err(|_| BuildError::InvalidValue {
        table: table.to_owned(),
        column: column.to_owned(),
        line,
        value: raw.to_owned(),
    })
}
