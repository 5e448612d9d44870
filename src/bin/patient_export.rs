use clap::Parser;
use qu::ick_use::*;
use std::path::PathBuf;
use uro_telemed_analysis::{
    aggregate::aggregate_all,
    enrich::{enrich_all, NoResolver, ZipDistanceCache, ZipIncomes},
    report::{write_encounter_csv, write_patient_csv},
    AnalysisConfig, Demographics, Encounters, Surgeries,
};

#[derive(Parser)]
struct Opt {
    /// Where to write the per-patient rows.
    #[clap(long, default_value = "patients_flat.csv")]
    patients: PathBuf,
    /// Where to write the per-encounter rows.
    #[clap(long, default_value = "encounters_flat.csv")]
    encounters: PathBuf,
}

#[qu::ick]
pub fn main(opt: Opt) -> Result {
    let config = AnalysisConfig::default();
    let encounters = Encounters::load("encounters.bin")?;
    let demographics = Demographics::load("demographics.bin")?;
    let surgeries = Surgeries::load("surgeries.bin")?;
    let incomes = ZipIncomes::load_orig("zip_incomes.csv")?;
    let mut distances = ZipDistanceCache::load("zip_distances.bin")?;

    let mut profiles = aggregate_all(&encounters)?;
    enrich_all(
        &mut profiles,
        &demographics,
        &surgeries,
        &mut distances,
        &NoResolver,
        &incomes,
        &config,
    )?;
    distances.save("zip_distances.bin")?;

    write_patient_csv(&profiles, &opt.patients)?;
    event!(
        Level::INFO,
        "wrote {} patient rows to \"{}\"",
        profiles.len(),
        opt.patients.display()
    );
    write_encounter_csv(&encounters, &opt.encounters)?;
    event!(
        Level::INFO,
        "wrote {} encounter rows to \"{}\"",
        encounters.len(),
        opt.encounters.display()
    );
    Ok(())
}
