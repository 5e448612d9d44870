//! Rendering for the reporting collaborator: cohort comparison tables and
//! the flat per-patient / per-encounter CSV exports.
//!
//! Export fields are enumerated explicitly here; nothing is derived from the
//! profile's shape at runtime.

use crate::{
    cohort::{CohortKey, CohortStats},
    stats::{self, TestOutcome},
    ArcStr, Encounter, Encounters, Mrn, PatientProfile, Result,
};
use chrono::NaiveDate;
use serde::Serialize;
use std::{collections::BTreeSet, path::Path};
use term_data_table::{Cell, Row, Table};

fn fmt_p(outcome: Option<TestOutcome>) -> String {
    match outcome {
        Some(o) => format!("{:.4}", o.p),
        None => "-".to_string(),
    }
}

fn fmt_mean_sd(xs: &[f64]) -> String {
    match (stats::mean(xs), stats::sd(xs)) {
        (Some(mean), Some(sd)) => format!("{:.1} ({:.1})", mean, sd),
        (Some(mean), None) => format!("{:.1}", mean),
        _ => "-".to_string(),
    }
}

fn fmt_count_pct(count: usize, denom: usize) -> String {
    match stats::rate(count, denom) {
        Some(rate) => format!("{} ({:.1}%)", count, rate * 100.),
        None => format!("{}", count),
    }
}

fn fmt_rate(count: usize, denom: usize) -> String {
    match stats::rate(count, denom) {
        Some(rate) => format!("{:.1}%", rate * 100.),
        None => "-".to_string(),
    }
}

fn header_row(cells: &[&str]) -> Row<'static> {
    let mut row = Row::new();
    for cell in cells {
        row = row.with_cell(Cell::from(cell.to_string()));
    }
    row
}

fn data_row(cells: Vec<String>) -> Row<'static> {
    let mut row = Row::new();
    for cell in cells {
        row = row.with_cell(Cell::from(cell));
    }
    row
}

/// Cohort sizes, including the patients excluded before partitioning.
pub fn cohort_size_table(
    cohorts: &[(CohortKey, &CohortStats)],
    excluded: usize,
) -> Table<'static> {
    let mut table = Table::new().with_row(header_row(&["Cohort", "Patients"]));
    for (key, stats) in cohorts {
        table.add_row(data_row(vec![key.to_string(), stats.n.to_string()]));
    }
    table.add_row(data_row(vec![
        "excluded (inconsistent surgical timing)".to_string(),
        excluded.to_string(),
    ]));
    table
}

/// Encounter tallies per modality, one column set per cohort.
pub fn modality_tally_table(cohorts: &[(CohortKey, &CohortStats)]) -> Table<'static> {
    let mut headers = vec!["Modality".to_string()];
    for (key, _) in cohorts {
        headers.push(format!("{} completed", key));
        headers.push(format!("{} canceled", key));
        headers.push(format!("{} total", key));
    }
    let mut table = Table::new().with_row(data_row(headers));
    for modality in crate::Modality::ALL {
        let mut cells = vec![modality.to_string()];
        for (_, stats) in cohorts {
            let tally = &stats.by_modality[modality];
            cells.push(tally.completed.to_string());
            cells.push(tally.canceled.to_string());
            cells.push(tally.total.to_string());
        }
        table.add_row(data_row(cells));
    }
    table
}

/// Timing-gap comparison between two cohorts: mean (sd) per series and the
/// Welch t-test p-value.
pub fn timing_comparison_table(
    a_name: &str,
    a: &CohortStats,
    b_name: &str,
    b: &CohortStats,
) -> Table<'static> {
    let mut table = Table::new().with_row(header_row(&[
        "Interval (days)",
        a_name,
        b_name,
        "p-value",
    ]));
    for ((label, series_a), (_, series_b)) in
        itertools::zip_eq(a.deltas.labeled(), b.deltas.labeled())
    {
        let xs = stats::days_to_f64(series_a);
        let ys = stats::days_to_f64(series_b);
        table.add_row(data_row(vec![
            label.to_string(),
            fmt_mean_sd(&xs),
            fmt_mean_sd(&ys),
            fmt_p(stats::welch_t_test(&xs, &ys)),
        ]));
    }
    table
}

fn categorical_section<K: std::fmt::Display>(
    table: &mut Table<'static>,
    section: &str,
    a: Vec<(K, usize)>,
    b: Vec<(K, usize)>,
    n_a: usize,
    n_b: usize,
) {
    let counts_a: Vec<u64> = a.iter().map(|(_, c)| *c as u64).collect();
    let counts_b: Vec<u64> = b.iter().map(|(_, c)| *c as u64).collect();
    table.add_row(data_row(vec![
        section.to_string(),
        String::new(),
        String::new(),
        fmt_p(stats::chi_square_2xk(&counts_a, &counts_b)),
    ]));
    for ((label, count_a), (_, count_b)) in a.into_iter().zip(b) {
        table.add_row(data_row(vec![
            format!("  {}", label),
            fmt_count_pct(count_a, n_a),
            fmt_count_pct(count_b, n_b),
            String::new(),
        ]));
    }
}

/// Demographic comparison between two cohorts: age by Welch t-test, each
/// categorical by chi-square over its full seeded label set.
pub fn demographic_comparison_table(
    a_name: &str,
    a: &CohortStats,
    b_name: &str,
    b: &CohortStats,
) -> Table<'static> {
    let mut table = Table::new().with_row(header_row(&[
        "Characteristic",
        a_name,
        b_name,
        "p-value",
    ]));
    table.add_row(data_row(vec![
        "patients".to_string(),
        a.n.to_string(),
        b.n.to_string(),
        String::new(),
    ]));
    table.add_row(data_row(vec![
        "missing demographics".to_string(),
        a.missing_demographics.to_string(),
        b.missing_demographics.to_string(),
        String::new(),
    ]));
    table.add_row(data_row(vec![
        "age, mean (sd)".to_string(),
        fmt_mean_sd(&a.ages),
        fmt_mean_sd(&b.ages),
        fmt_p(stats::welch_t_test(&a.ages, &b.ages)),
    ]));
    table.add_row(data_row(vec![
        "distance to clinic mi, mean (sd)".to_string(),
        fmt_mean_sd(&a.distances_miles),
        fmt_mean_sd(&b.distances_miles),
        fmt_p(stats::welch_t_test(&a.distances_miles, &b.distances_miles)),
    ]));
    table.add_row(data_row(vec![
        "median household income, mean (sd)".to_string(),
        fmt_mean_sd(&a.incomes),
        fmt_mean_sd(&b.incomes),
        fmt_p(stats::welch_t_test(&a.incomes, &b.incomes)),
    ]));

    let demo_n_a = a.n - a.missing_demographics;
    let demo_n_b = b.n - b.missing_demographics;
    categorical_section(
        &mut table,
        "legal sex",
        a.sexes.iter().map(|(k, v)| (*k, *v)).collect(),
        b.sexes.iter().map(|(k, v)| (*k, *v)).collect(),
        demo_n_a,
        demo_n_b,
    );
    categorical_section(
        &mut table,
        "race",
        a.races.iter().map(|(k, v)| (*k, *v)).collect(),
        b.races.iter().map(|(k, v)| (*k, *v)).collect(),
        demo_n_a,
        demo_n_b,
    );
    categorical_section(
        &mut table,
        "ethnicity",
        a.ethnicities.iter().map(|(k, v)| (*k, *v)).collect(),
        b.ethnicities.iter().map(|(k, v)| (*k, *v)).collect(),
        demo_n_a,
        demo_n_b,
    );
    categorical_section(
        &mut table,
        "language",
        a.languages.iter().map(|(k, v)| (*k, *v)).collect(),
        b.languages.iter().map(|(k, v)| (*k, *v)).collect(),
        demo_n_a,
        demo_n_b,
    );
    categorical_section(
        &mut table,
        "marital status",
        a.marital_statuses.iter().map(|(k, v)| (*k, *v)).collect(),
        b.marital_statuses.iter().map(|(k, v)| (*k, *v)).collect(),
        demo_n_a,
        demo_n_b,
    );
    categorical_section(
        &mut table,
        "payor",
        a.payors.iter().map(|(k, v)| (*k, *v)).collect(),
        b.payors.iter().map(|(k, v)| (*k, *v)).collect(),
        a.n,
        b.n,
    );
    table
}

/// Age distribution cross-tab over fixed bands, compared by chi-square.
pub fn age_band_table(
    a_name: &str,
    a: &CohortStats,
    b_name: &str,
    b: &CohortStats,
) -> Table<'static> {
    const BANDS: &[(u16, Option<u16>)] = &[
        (0, Some(40)),
        (40, Some(55)),
        (55, Some(70)),
        (70, Some(85)),
        (85, None),
    ];
    fn band_label(band: (u16, Option<u16>)) -> String {
        match band.1 {
            Some(hi) => format!("{} - {}", band.0, hi),
            None => format!("{}+", band.0),
        }
    }
    fn bucket(ages: &[f64], bands: &[(u16, Option<u16>)]) -> Vec<u64> {
        let mut counts = vec![0u64; bands.len()];
        for age in ages {
            for (idx, (lo, hi)) in bands.iter().enumerate() {
                let lo = *lo as f64;
                let in_band = match hi {
                    Some(hi) => *age >= lo && *age < *hi as f64,
                    None => *age >= lo,
                };
                if in_band {
                    counts[idx] += 1;
                }
            }
        }
        counts
    }

    let counts_a = bucket(&a.ages, BANDS);
    let counts_b = bucket(&b.ages, BANDS);
    let mut table = Table::new().with_row(header_row(&["Age band", a_name, b_name, "p-value"]));
    table.add_row(data_row(vec![
        "all bands".to_string(),
        String::new(),
        String::new(),
        fmt_p(stats::chi_square_2xk(&counts_a, &counts_b)),
    ]));
    for (idx, band) in BANDS.iter().enumerate() {
        table.add_row(data_row(vec![
            band_label(*band),
            counts_a[idx].to_string(),
            counts_b[idx].to_string(),
            String::new(),
        ]));
    }
    table
}

/// Conversion flags per direction, each compared with a 2x2 chi-square
/// (converted vs not, by cohort).
pub fn conversion_table(
    a_name: &str,
    a: &CohortStats,
    b_name: &str,
    b: &CohortStats,
) -> Table<'static> {
    let mut table = Table::new().with_row(header_row(&["Conversion", a_name, b_name, "p-value"]));
    for (label, count_a) in &a.conversion_counts {
        let count_b = b.conversion_counts.get(label).copied().unwrap_or(0);
        let outcome = stats::chi_square_2xk(
            &[*count_a as u64, (a.n - count_a) as u64],
            &[count_b as u64, (b.n - count_b) as u64],
        );
        table.add_row(data_row(vec![
            label.to_string(),
            fmt_count_pct(*count_a, a.n),
            fmt_count_pct(count_b, b.n),
            fmt_p(outcome),
        ]));
    }
    table
}

/// Diagnosis-category mix plus per-category procedure/surgery rates.
///
/// Rates reuse the category population as the denominator; an empty
/// category renders "-" rather than dividing by zero.
pub fn dx_category_table(
    a_name: &str,
    a: &CohortStats,
    b_name: &str,
    b: &CohortStats,
) -> Table<'static> {
    let categories: BTreeSet<ArcStr> = a
        .dx_categories
        .keys()
        .chain(b.dx_categories.keys())
        .cloned()
        .collect();
    let counts = |stats: &CohortStats| -> Vec<u64> {
        categories
            .iter()
            .map(|c| stats.dx_categories.get(c).copied().unwrap_or(0) as u64)
            .collect()
    };
    let mut table = Table::new().with_row(header_row(&[
        "Diagnosis category",
        a_name,
        b_name,
        "p-value",
    ]));
    table.add_row(data_row(vec![
        "all categories".to_string(),
        String::new(),
        String::new(),
        fmt_p(stats::chi_square_2xk(&counts(a), &counts(b))),
    ]));
    for category in &categories {
        let empty = Default::default();
        let out_a = a.dx_outcomes.get(category).unwrap_or(&empty);
        let out_b = b.dx_outcomes.get(category).unwrap_or(&empty);
        table.add_row(data_row(vec![
            category.to_string(),
            fmt_count_pct(out_a.patients, a.n),
            fmt_count_pct(out_b.patients, b.n),
            String::new(),
        ]));
        table.add_row(data_row(vec![
            "  procedure rate".to_string(),
            fmt_rate(out_a.completed_procedures, out_a.patients),
            fmt_rate(out_b.completed_procedures, out_b.patients),
            String::new(),
        ]));
        table.add_row(data_row(vec![
            "  surgery rate".to_string(),
            fmt_rate(out_a.surgeries, out_a.patients),
            fmt_rate(out_b.surgeries, out_b.patients),
            String::new(),
        ]));
    }
    table
}

/// Completed vs canceled procedures, 2x2 across two cohorts.
pub fn procedure_outcome_table(
    a_name: &str,
    a: &CohortStats,
    b_name: &str,
    b: &CohortStats,
) -> Table<'static> {
    let (completed_a, canceled_a) = a.procedure_outcome_counts();
    let (completed_b, canceled_b) = b.procedure_outcome_counts();
    let outcome = stats::chi_square_2xk(&[completed_a, canceled_a], &[completed_b, canceled_b]);
    let mut table = Table::new().with_row(header_row(&[
        "Procedure outcome",
        a_name,
        b_name,
        "p-value",
    ]));
    table.add_row(data_row(vec![
        "completed".to_string(),
        completed_a.to_string(),
        completed_b.to_string(),
        fmt_p(outcome),
    ]));
    table.add_row(data_row(vec![
        "canceled".to_string(),
        canceled_a.to_string(),
        canceled_b.to_string(),
        String::new(),
    ]));
    table
}

/// Age compared across all cohorts at once.
pub fn age_anova(cohorts: &[(CohortKey, &CohortStats)]) -> Option<TestOutcome> {
    let groups: Vec<&[f64]> = cohorts.iter().map(|(_, s)| s.ages.as_slice()).collect();
    stats::one_way_anova(&groups)
}

/// One flat row per patient for CSV export. The field list is the export
/// schema; extending the profile means extending this struct by hand.
#[derive(Debug, Serialize)]
pub struct FlatPatientRecord {
    pub mrn: Mrn,
    pub name: ArcStr,
    pub total_encounters: u32,
    pub completed_encounters: u32,
    pub canceled_encounters: u32,
    pub new_patient_visits: u32,
    pub completed_new_patient_visits: u32,
    pub office_completed: u32,
    pub office_canceled: u32,
    pub virtual_completed: u32,
    pub virtual_canceled: u32,
    pub phone_completed: u32,
    pub phone_canceled: u32,
    pub procedure_completed: u32,
    pub procedure_canceled: u32,
    pub earliest_encounter_date: Option<NaiveDate>,
    pub earliest_completed_date: Option<NaiveDate>,
    pub earliest_completed_modality: Option<String>,
    pub earliest_referral_date: Option<NaiveDate>,
    pub earliest_scheduling_date: Option<NaiveDate>,
    pub presenting_dx: Option<ArcStr>,
    pub dx_category: Option<ArcStr>,
    pub dx_needs_review: bool,
    pub conv_virtual_to_office: bool,
    pub conv_office_to_virtual: bool,
    pub conv_phone_to_office: bool,
    pub conv_office_to_phone: bool,
    pub conv_phone_to_virtual: bool,
    pub conv_virtual_to_phone: bool,
    pub referral_to_first_visit: Option<i64>,
    pub referral_to_first_completed: Option<i64>,
    pub scheduling_to_first_visit: Option<i64>,
    pub scheduling_to_first_procedure: Option<i64>,
    pub first_visit_to_first_procedure: Option<i64>,
    pub scheduling_to_surgery: Option<i64>,
    pub first_visit_to_surgery: Option<i64>,
    pub age: Option<u16>,
    pub legal_sex: Option<String>,
    pub marital_status: Option<String>,
    pub ethnicity: Option<String>,
    pub race: Option<String>,
    pub language: Option<String>,
    pub zip: Option<ArcStr>,
    pub payor_category: Option<String>,
    pub surgery_date: Option<NaiveDate>,
    pub zip_distance_miles: Option<f64>,
    pub zip_income: Option<u32>,
}

impl FlatPatientRecord {
    pub fn from_profile(profile: &PatientProfile) -> Self {
        use crate::Modality::*;
        let demo = profile.demographics.as_ref();
        FlatPatientRecord {
            mrn: profile.mrn,
            name: profile.name.clone(),
            total_encounters: profile.tally.total,
            completed_encounters: profile.tally.completed,
            canceled_encounters: profile.tally.canceled,
            new_patient_visits: profile.tally.new_patient,
            completed_new_patient_visits: profile.tally.completed_new_patient,
            office_completed: profile.by_modality[Office].tally.completed,
            office_canceled: profile.by_modality[Office].tally.canceled,
            virtual_completed: profile.by_modality[Virtual].tally.completed,
            virtual_canceled: profile.by_modality[Virtual].tally.canceled,
            phone_completed: profile.by_modality[Phone].tally.completed,
            phone_canceled: profile.by_modality[Phone].tally.canceled,
            procedure_completed: profile.by_modality[Procedure].tally.completed,
            procedure_canceled: profile.by_modality[Procedure].tally.canceled,
            earliest_encounter_date: profile.earliest_encounter.as_ref().map(|e| e.date),
            earliest_completed_date: profile.earliest_completed.as_ref().map(|e| e.date),
            earliest_completed_modality: profile
                .earliest_completed_visit()
                .map(|(m, _)| m.to_string()),
            earliest_referral_date: profile.earliest_referral,
            earliest_scheduling_date: profile.earliest_scheduling,
            presenting_dx: profile.presenting_dx.clone(),
            dx_category: profile.dx_category.clone(),
            dx_needs_review: profile.dx_needs_review,
            conv_virtual_to_office: profile.conversions.virtual_to_office,
            conv_office_to_virtual: profile.conversions.office_to_virtual,
            conv_phone_to_office: profile.conversions.phone_to_office,
            conv_office_to_phone: profile.conversions.office_to_phone,
            conv_phone_to_virtual: profile.conversions.phone_to_virtual,
            conv_virtual_to_phone: profile.conversions.virtual_to_phone,
            referral_to_first_visit: profile.deltas.referral_to_first_visit,
            referral_to_first_completed: profile.deltas.referral_to_first_completed,
            scheduling_to_first_visit: profile.deltas.scheduling_to_first_visit,
            scheduling_to_first_procedure: profile.deltas.scheduling_to_first_procedure,
            first_visit_to_first_procedure: profile.deltas.first_visit_to_first_procedure,
            scheduling_to_surgery: profile.deltas.scheduling_to_surgery,
            first_visit_to_surgery: profile.deltas.first_visit_to_surgery,
            age: demo.and_then(|d| d.age),
            legal_sex: demo.map(|d| d.sex.to_string()),
            marital_status: demo.map(|d| d.marital_status.to_string()),
            ethnicity: demo.map(|d| d.ethnicity.to_string()),
            race: demo.map(|d| d.race.to_string()),
            language: demo.map(|d| d.language.to_string()),
            zip: demo.and_then(|d| d.zip.clone()),
            payor_category: profile.payor_category.map(|p| p.to_string()),
            surgery_date: profile.surgery.as_ref().map(|s| s.date),
            zip_distance_miles: profile.zip_distance.map(|d| d.miles),
            zip_income: profile.zip_income,
        }
    }
}

pub fn write_patient_csv(profiles: &[PatientProfile], path: impl AsRef<Path>) -> Result {
    let mut writer = csv::Writer::from_path(path.as_ref())?;
    for profile in profiles {
        writer.serialize(FlatPatientRecord::from_profile(profile))?;
    }
    writer.flush()?;
    Ok(())
}

/// One flat row per encounter, with the per-row referral and scheduling
/// gaps.
#[derive(Debug, Serialize)]
pub struct FlatEncounterRecord {
    pub mrn: Mrn,
    pub encounter_id: u32,
    pub date: NaiveDate,
    pub modality: String,
    pub status: String,
    pub new_patient: bool,
    pub provider: ArcStr,
    pub department: ArcStr,
    pub visit_type: ArcStr,
    pub icd: Option<ArcStr>,
    pub icd_name: Option<ArcStr>,
    pub payor: Option<ArcStr>,
    pub cancel_reason: Option<ArcStr>,
    pub referral_to_encounter: Option<i64>,
    pub creation_to_encounter: Option<i64>,
}

impl FlatEncounterRecord {
    pub fn from_encounter(enc: &Encounter) -> Self {
        FlatEncounterRecord {
            mrn: enc.mrn,
            encounter_id: enc.encounter_id,
            date: enc.date,
            modality: enc.modality.to_string(),
            status: enc.status.to_string(),
            new_patient: enc.new_patient,
            provider: enc.provider.clone(),
            department: enc.department.clone(),
            visit_type: enc.visit_type.clone(),
            icd: enc.icd.clone(),
            icd_name: enc.icd_name.clone(),
            payor: enc.payor.clone(),
            cancel_reason: enc.cancel_reason.clone(),
            referral_to_encounter: enc.referral_date.map(|d| (enc.date - d).num_days()),
            creation_to_encounter: enc.creation_date.map(|d| (enc.date - d).num_days()),
        }
    }
}

pub fn write_encounter_csv(encounters: &Encounters, path: impl AsRef<Path>) -> Result {
    let mut writer = csv::Writer::from_path(path.as_ref())?;
    for enc in encounters {
        writer.serialize(FlatEncounterRecord::from_encounter(enc))?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::FlatPatientRecord;
    use crate::{aggregate::aggregate, ArcStr, Encounter, Modality, Status};
    use chrono::NaiveDate;

    #[test]
    fn flat_record_reflects_profile() {
        let enc = Encounter {
            mrn: 9,
            encounter_id: 0,
            name: ArcStr::from("DOE, JANE"),
            provider: ArcStr::from("SMITH, ALEX"),
            department: ArcStr::from("UROLOGY CLINIC"),
            visit_type: ArcStr::from("NEW VIRTUAL VISIT"),
            modality: Modality::Virtual,
            status: Status::Completed,
            new_patient: true,
            date: NaiveDate::from_ymd_opt(2021, 1, 5).unwrap(),
            creation_date: None,
            referral_date: Some(NaiveDate::from_ymd_opt(2020, 12, 1).unwrap()),
            icd: None,
            icd_name: None,
            payor: None,
            cancel_reason: None,
        };
        let profile = aggregate(9, &[enc]).unwrap();
        let flat = FlatPatientRecord::from_profile(&profile);
        assert_eq!(flat.mrn, 9);
        assert_eq!(flat.virtual_completed, 1);
        assert_eq!(flat.referral_to_first_completed, Some(35));
        assert_eq!(flat.earliest_completed_modality.as_deref(), Some("virtual"));
        // no demographics merged, so the block stays empty
        assert_eq!(flat.age, None);
        assert_eq!(flat.race, None);
    }
}
