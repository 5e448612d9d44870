use qu::ick_use::*;
use uro_telemed_analysis::{
    aggregate::aggregate_all,
    cohort::{assign_cohorts, CohortKey, CohortStats},
    enrich::{enrich_all, NoResolver, ZipDistanceCache, ZipIncomes},
    header, report, AnalysisConfig, Demographics, Encounters, Surgeries,
};
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
struct Opt {
    /// Optional TOML file overriding the built-in lookup tables.
    #[clap(long, short)]
    config: Option<PathBuf>,
}

#[qu::ick]
pub fn main(opt: Opt) -> Result {
    let config = match &opt.config {
        Some(path) => AnalysisConfig::load(path)?,
        None => AnalysisConfig::default(),
    };
    let encounters = Encounters::load("encounters.bin")?;
    let demographics = Demographics::load("demographics.bin")?;
    let surgeries = Surgeries::load("surgeries.bin")?;
    let incomes = ZipIncomes::load_orig("zip_incomes.csv")?;
    let mut distances = ZipDistanceCache::load("zip_distances.bin")?;

    header("Data stats");
    println!("total encounter rows: {}", encounters.len());
    println!("total demographic rows: {}", demographics.len());
    println!("total surgery rows: {}", surgeries.len());
    if let Some(date) = encounters.iter().map(|enc| enc.date).min() {
        println!("earliest encounter date: {}", date);
    }
    if let Some(date) = encounters.iter().map(|enc| enc.date).max() {
        println!("latest encounter date: {}", date);
    }

    let mut profiles = aggregate_all(&encounters)?;
    // geocoding runs offline before analysis; a miss here just leaves the
    // distance empty
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

    let flagged = profiles.iter().filter(|p| p.dx_needs_review).count();
    if flagged > 0 {
        event!(
            Level::WARN,
            "{} patients have a presenting diagnosis flagged for manual review",
            flagged
        );
    }

    let assignment = assign_cohorts(profiles);
    let stats: Vec<(CohortKey, CohortStats)> = CohortKey::ALL
        .iter()
        .map(|key| (*key, CohortStats::summarize(assignment.cohort(*key))))
        .collect();
    let by_key: Vec<(CohortKey, &CohortStats)> =
        stats.iter().map(|(key, s)| (*key, s)).collect();
    let office = &stats[0].1;
    let virtual_ = &stats[1].1;

    header("Cohort sizes");
    println!(
        "{}",
        report::cohort_size_table(&by_key, assignment.excluded.len())
    );

    header("Encounters by modality");
    println!("{}", report::modality_tally_table(&by_key));

    header("Demographics, office vs virtual");
    println!(
        "{}",
        report::demographic_comparison_table("office", office, "virtual", virtual_)
    );
    if let Some(outcome) = report::age_anova(&by_key) {
        println!(
            "age across all cohorts: F = {:.3}, p = {:.4}",
            outcome.statistic, outcome.p
        );
    }

    header("Age bands, office vs virtual");
    println!(
        "{}",
        report::age_band_table("office", office, "virtual", virtual_)
    );

    header("Timing intervals, office vs virtual");
    println!(
        "{}",
        report::timing_comparison_table("office", office, "virtual", virtual_)
    );

    header("Modality conversions, office vs virtual");
    println!(
        "{}",
        report::conversion_table("office", office, "virtual", virtual_)
    );

    header("Diagnosis categories, office vs virtual");
    println!(
        "{}",
        report::dx_category_table("office", office, "virtual", virtual_)
    );

    header("Procedure outcomes, office vs virtual");
    println!(
        "{}",
        report::procedure_outcome_table("office", office, "virtual", virtual_)
    );

    Ok(())
}
