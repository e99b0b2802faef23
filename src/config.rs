use std::{
    collections::HashSet,
    path::{Component, Path},
};

use serde::{Deserialize, Serialize};

use crate::{
    error::{BuildError, Result},
    metro::MetroType,
};

/// Building permit indicators, summed across counties.
pub const NUMERICAL_COLUMNS: [&str; 12] = [
    "1_unit_bldgs",
    "1_unit_units",
    "1_unit_value",
    "2_units_bldgs",
    "2_units_units",
    "2_units_value",
    "3_to_4_units_bldgs",
    "3_to_4_units_units",
    "3_to_4_units_value",
    "5_plus_units_bldgs",
    "5_plus_units_units",
    "5_plus_units_value",
];

// Monthly surveys have not caught up with the annual ones for this year yet.
pub const PARTIAL_YEAR: &str = "2021";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct BuildConfig {
    pub numerical_columns: Vec<String>,
    /// Year whose metro rows are only kept when every county reported.
    pub partial_year: String,
    pub metro_types: Vec<String>,
    pub snapshot_file: String,
    pub index_file: String,
    pub shard_dir: String,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            numerical_columns: NUMERICAL_COLUMNS.iter().map(|c| c.to_string()).collect(),
            partial_year: PARTIAL_YEAR.to_owned(),
            metro_types: vec![MetroType::Cbsa.to_string(), MetroType::Csa.to_string()],
            snapshot_file: "metros_annual.csv".to_owned(),
            index_file: "metros_list.json".to_owned(),
            shard_dir: "metros_data".to_owned(),
        }
    }
}

impl BuildConfig {
    /// Reads a JSON config file. Missing keys fall back to the defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: BuildConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.numerical_columns.is_empty() {
            return Err(BuildError::Config("numerical_columns is empty".to_owned()));
        }

        let mut seen = HashSet::new();
        for col in &self.numerical_columns {
            if !seen.insert(col.as_str()) {
                return Err(BuildError::Config(format!("duplicate numerical column '{}'", col)));
            }
        }

        if self.partial_year.trim().is_empty() {
            return Err(BuildError::Config("partial_year is empty".to_owned()));
        }

        let metro_types = self.metro_types()?;
        if metro_types.iter().collect::<HashSet<_>>().len() != metro_types.len() {
            return Err(BuildError::Config("metro_types lists a type twice".to_owned()));
        }

        self.validate_output_names()
    }

    /// The shard directory is replaced wholesale on every build, so it must be
    /// a proper subdirectory of the output directory that holds neither the
    /// snapshot nor the index.
    fn validate_output_names(&self) -> Result<()> {
        check_output_name("snapshot_file", &self.snapshot_file, false)?;
        check_output_name("index_file", &self.index_file, false)?;
        check_output_name("shard_dir", &self.shard_dir, true)?;

        if self.snapshot_file == self.index_file {
            return Err(BuildError::Config(format!(
                "snapshot_file and index_file are both '{}'",
                self.index_file
            )));
        }

        let shard_dir = Path::new(&self.shard_dir);
        for (key, file) in [("snapshot_file", &self.snapshot_file), ("index_file", &self.index_file)] {
            if shard_dir.starts_with(file) {
                return Err(BuildError::Config(format!(
                    "{} '{}' collides with shard_dir '{}'",
                    key, file, self.shard_dir
                )));
            }
        }
        Ok(())
    }

    pub fn metro_types(&self) -> Result<Vec<MetroType>> {
        self.metro_types.iter().map(|t| t.parse()).collect()
    }

    pub fn per_capita_columns(&self) -> Vec<String> {
        self.numerical_columns
            .iter()
            .map(|c| format!("{}_per_capita", c))
            .collect()
    }
}

/// Relative path below the output directory made of plain names only.
fn check_output_name(key: &str, value: &str, nested: bool) -> Result<()> {
    let path = Path::new(value);
    let count = path.components().count();
    let plain = path.components().all(|c| matches!(c, Component::Normal(_)));
    if count == 0 || !plain || (!nested && count > 1) {
        return Err(BuildError::Config(format!(
            "{} '{}' must name an entry inside the output directory",
            key, value
        )));
    }
    Ok(())
}
