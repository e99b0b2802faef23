use std::path::Path;

use rayon::prelude::*;

use crate::{
    config::BuildConfig,
    counties::{load_counties_path, CountyRecord},
    crosswalk::{load_crosswalk_path, Crosswalk},
    error::Result,
    metro::{combine_metro_rows, CountyIndex, MetroRecord},
    output::{write_outputs, OutputSummary},
    per_capita::add_per_capita_columns,
};

const LOG_TARGET: &str = "build";

/// Every metro year for every configured metro type, per-capita columns filled.
///
/// CBSA rows come first, then CSA rows.
pub fn build_metros(
    counties: &[CountyRecord],
    crosswalk: &Crosswalk,
    config: &BuildConfig,
) -> Result<Vec<MetroRecord>> {
    config.validate()?;
    let metro_types = config.metro_types()?;

    let index = CountyIndex::new(counties)?;
    let unmapped = index.unmapped(crosswalk);
    if !unmapped.is_empty() {
        log::info!(target: LOG_TARGET, "{} counties have no crosswalk entry and belong to no metro", unmapped.len());
        log::debug!(target: LOG_TARGET, "Unmapped counties: {:?}", unmapped);
    }

    // The passes share nothing but read-only inputs.
    let passes: Vec<Vec<MetroRecord>> = metro_types
        .par_iter()
        .map(|&metro_type| {
            combine_metro_rows(
                &index,
                crosswalk,
                metro_type,
                &config.numerical_columns,
                &config.partial_year,
            )
        })
        .collect();

    let mut metros: Vec<MetroRecord> = passes.into_iter().flatten().collect();
    add_per_capita_columns(&mut metros);

    Ok(metros)
}

/// Loads both inputs, builds the metros and writes every artifact to `out_dir`.
pub fn run_build(
    counties_path: &Path,
    crosswalk_path: &Path,
    out_dir: &Path,
    config: &BuildConfig,
) -> Result<OutputSummary> {
    config.validate()?;
    let crosswalk = load_crosswalk_path(crosswalk_path)?;
    let counties = load_counties_path(counties_path, config)?;

    let metros = build_metros(&counties, &crosswalk, config)?;
    write_outputs(out_dir, config, &metros)
}

#[cfg(test)]
pub(crate) mod fixtures {
    use crate::{
        config::BuildConfig,
        counties::CountyRecord,
        crosswalk::{Crosswalk, CrosswalkEntry},
    };

    pub fn config() -> BuildConfig {
        BuildConfig {
            numerical_columns: vec!["units".to_owned()],
            partial_year: "2021".to_owned(),
            ..Default::default()
        }
    }

    pub fn county(name: &str, fips: (u32, u32), year: &str, population: f64, units: f64) -> CountyRecord {
        CountyRecord {
            county_name: name.to_owned(),
            fips_state: fips.0,
            fips_county: fips.1,
            year: year.to_owned(),
            population: Some(population),
            indicators: vec![Some(units)],
        }
    }

    pub fn entry(fips: (u32, u32), cbsa: &str, csa: Option<&str>) -> CrosswalkEntry {
        CrosswalkEntry {
            fips_state: fips.0,
            fips_county: fips.1,
            csa_name: csa.map(|c| c.to_owned()),
            cbsa_name: cbsa.to_owned(),
        }
    }

    /// Metroville is counties 1001 and 1002, part of Greater Metro CSA with Sidetown (1003).
    pub fn crosswalk() -> Crosswalk {
        Crosswalk::new(vec![
            entry((1, 1), "Metroville", Some("Greater Metro CSA")),
            entry((1, 2), "Metroville", Some("Greater Metro CSA")),
            entry((1, 3), "Sidetown", Some("Greater Metro CSA")),
            entry((2, 5), "Lone Pine/Oak", None),
        ])
    }
}
