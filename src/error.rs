//! Error types for the metro build.

use thiserror::Error;

/// Errors that can abort a build.
#[derive(Error, Debug)]
pub enum BuildError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("regex error: {0}")]
    Regex(#[from] regex::Error),

    /// An expected column is missing from an input table
    #[error("schema mismatch: table '{table}' has no column '{column}'")]
    SchemaMismatch { table: String, column: String },

    /// A cell could not be parsed into the type its column requires
    #[error("invalid value '{value}' in table '{table}', column '{column}', line {line}")]
    InvalidValue {
        table: String,
        column: String,
        line: u64,
        value: String,
    },

    /// Only `cbsa` and `csa` exist
    #[error("unknown metro type: {0}")]
    UnknownMetroType(String),

    /// The same county reported twice for one year; summing would double count it
    #[error("county {fips_state}/{fips_county} appears more than once for year {year}")]
    DuplicateCountyYear {
        fips_state: u32,
        fips_county: u32,
        year: String,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Result type alias for build operations.
pub type Result<T> = std::result::Result<T, BuildError>;
