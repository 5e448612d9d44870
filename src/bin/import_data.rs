use qu::ick_use::*;
use uro_telemed_analysis::{enrich::ZipIncomes, AnalysisConfig, Demographics, Encounters, Surgeries};

/// Parse the csv extracts and write the binary caches the analysis binaries
/// load.
#[qu::ick]
pub fn main() -> Result {
    let config = AnalysisConfig::default();

    let encounters = Encounters::load_orig("encounters.csv", &config)?;
    event!(Level::INFO, "imported {} encounter rows", encounters.len());
    encounters.save("encounters.bin")?;

    let demographics = Demographics::load_orig("demographics.csv")?;
    event!(Level::INFO, "imported {} demographic rows", demographics.len());
    demographics.save("demographics.bin")?;

    let surgeries = Surgeries::load_orig("surgeries.csv")?;
    event!(Level::INFO, "imported {} surgery rows", surgeries.len());
    surgeries.save("surgeries.bin")?;

    // incomes are small and load fast, so they stay csv; just verify the
    // extract parses
    let incomes = ZipIncomes::load_orig("zip_incomes.csv")?;
    event!(Level::INFO, "zip income table covers {} zips", incomes.len());

    Ok(())
}
