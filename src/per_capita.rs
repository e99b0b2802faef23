use crate::metro::MetroRecord;

/// `value / population`, or `None` when there is no population to divide by.
pub fn per_capita(value: f64, population: f64) -> Option<f64> {
    if population > 0.0 && population.is_finite() {
        Some(value / population)
    } else {
        None
    }
}

/// Fills the per-capita column of every indicator from the metro's own sums.
pub fn add_per_capita_columns(metros: &mut [MetroRecord]) {
    for metro in metros.iter_mut() {
        let population = metro.population;
        metro.per_capita = metro
            .indicators
            .iter()
            .map(|&value| per_capita(value, population))
            .collect();
    }
}
