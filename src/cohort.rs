//! Cohort partitioning and per-cohort aggregate statistics.

use crate::{
    aggregate::{ByModality, PatientProfile, Tally},
    enrich::{Ethnicity, Language, MaritalStatus, PayorCategory, Race, Sex},
    ArcStr, Modality, PipelineError,
};
use qu::ick_use::*;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};

/// The named patient partitions under comparison.
///
/// Patients are keyed by the modality of their earliest completed visit;
/// patients with no completed new-patient visit (or no completed visit at
/// all) form their own group.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum CohortKey {
    Office,
    Virtual,
    Phone,
    NoNewVisit,
}

impl CohortKey {
    pub const ALL: [CohortKey; 4] = [
        CohortKey::Office,
        CohortKey::Virtual,
        CohortKey::Phone,
        CohortKey::NoNewVisit,
    ];
}

impl fmt::Display for CohortKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CohortKey::Office => f.write_str("office"),
            CohortKey::Virtual => f.write_str("virtual"),
            CohortKey::Phone => f.write_str("phone"),
            CohortKey::NoNewVisit => f.write_str("no new visit"),
        }
    }
}

/// The result of partitioning: every non-excluded patient lands in exactly
/// one cohort.
pub struct CohortAssignment {
    pub cohorts: BTreeMap<CohortKey, Vec<PatientProfile>>,
    /// Patients with internally inconsistent surgical timing, removed before
    /// partitioning so the aggregates never see them.
    pub excluded: Vec<PatientProfile>,
}

impl CohortAssignment {
    pub fn cohort(&self, key: CohortKey) -> &[PatientProfile] {
        self.cohorts.get(&key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn assigned_total(&self) -> usize {
        self.cohorts.values().map(Vec::len).sum()
    }
}

/// A surgery recorded before its own scheduling event or first visit is a
/// data-entry artifact, not a treatment pathway.
fn inconsistent_surgery_delta(profile: &PatientProfile) -> Option<(&'static str, i64)> {
    if let Some(days) = profile.deltas.scheduling_to_surgery {
        if days < 0 {
            return Some(("its scheduling event", days));
        }
    }
    if let Some(days) = profile.deltas.first_visit_to_surgery {
        if days < 0 {
            return Some(("the first visit", days));
        }
    }
    None
}

fn classify(profile: &PatientProfile) -> CohortKey {
    if profile.tally.completed_new_patient == 0 {
        return CohortKey::NoNewVisit;
    }
    match profile.earliest_completed_visit() {
        Some((Modality::Office, _)) => CohortKey::Office,
        Some((Modality::Virtual, _)) => CohortKey::Virtual,
        Some((Modality::Phone, _)) => CohortKey::Phone,
        // completed new-patient visits are always office/virtual/phone rows,
        // but a procedure-only record set still needs a home
        Some((Modality::Procedure, _)) | None => CohortKey::NoNewVisit,
    }
}

/// Partition profiles into cohorts, applying the surgical-timing exclusion
/// first so excluded patients never reach any aggregate.
pub fn assign_cohorts(profiles: Vec<PatientProfile>) -> CohortAssignment {
    let mut cohorts: BTreeMap<CohortKey, Vec<PatientProfile>> = CohortKey::ALL
        .iter()
        .map(|key| (*key, Vec::new()))
        .collect();
    let mut excluded = Vec::new();
    for profile in profiles {
        if let Some((reference, days)) = inconsistent_surgery_delta(&profile) {
            let err = PipelineError::InconsistentTiming {
                mrn: profile.mrn,
                reference,
                days,
            };
            event!(Level::WARN, "excluding from cohorts: {}", err);
            excluded.push(profile);
            continue;
        }
        cohorts
            .get_mut(&classify(&profile))
            .expect("all cohort keys seeded")
            .push(profile);
    }
    CohortAssignment { cohorts, excluded }
}

/// The timing-gap distributions for one cohort, in days. Each series holds
/// only the patients for whom the gap was defined.
#[derive(Debug, Clone, Default)]
pub struct DeltaSeries {
    pub referral_to_first_visit: Vec<i64>,
    pub referral_to_first_completed: Vec<i64>,
    pub scheduling_to_first_visit: Vec<i64>,
    pub scheduling_to_first_procedure: Vec<i64>,
    pub first_visit_to_first_procedure: Vec<i64>,
    pub scheduling_to_surgery: Vec<i64>,
    pub first_visit_to_surgery: Vec<i64>,
}

impl DeltaSeries {
    fn push(&mut self, profile: &PatientProfile) {
        let deltas = &profile.deltas;
        let slots: [(&mut Vec<i64>, Option<i64>); 7] = [
            (&mut self.referral_to_first_visit, deltas.referral_to_first_visit),
            (
                &mut self.referral_to_first_completed,
                deltas.referral_to_first_completed,
            ),
            (
                &mut self.scheduling_to_first_visit,
                deltas.scheduling_to_first_visit,
            ),
            (
                &mut self.scheduling_to_first_procedure,
                deltas.scheduling_to_first_procedure,
            ),
            (
                &mut self.first_visit_to_first_procedure,
                deltas.first_visit_to_first_procedure,
            ),
            (&mut self.scheduling_to_surgery, deltas.scheduling_to_surgery),
            (&mut self.first_visit_to_surgery, deltas.first_visit_to_surgery),
        ];
        for (series, value) in slots {
            if let Some(days) = value {
                series.push(days);
            }
        }
    }

    pub fn labeled(&self) -> [(&'static str, &[i64]); 7] {
        [
            ("referral to first visit", &self.referral_to_first_visit),
            (
                "referral to first completed visit",
                &self.referral_to_first_completed,
            ),
            ("scheduling to first visit", &self.scheduling_to_first_visit),
            (
                "scheduling to first procedure",
                &self.scheduling_to_first_procedure,
            ),
            (
                "first visit to first procedure",
                &self.first_visit_to_first_procedure,
            ),
            ("scheduling to surgery", &self.scheduling_to_surgery),
            ("first visit to surgery", &self.first_visit_to_surgery),
        ]
    }
}

/// Procedure and surgery outcomes within one diagnosis category.
///
/// `patients` is the category population, kept alongside the counts so rate
/// computations share one denominator.
#[derive(Debug, Clone, Copy, Default)]
pub struct CategoryOutcomes {
    pub patients: usize,
    pub completed_procedures: usize,
    pub canceled_procedures: usize,
    pub surgeries: usize,
}

/// Aggregate distributions for one cohort, ready for comparison.
#[derive(Debug, Clone, Default)]
pub struct CohortStats {
    pub n: usize,
    /// Patients with no demographic linkage; they are absent from the
    /// demographic tables below.
    pub missing_demographics: usize,
    pub by_modality: ByModality<Tally>,
    pub conversion_counts: BTreeMap<&'static str, usize>,
    pub deltas: DeltaSeries,
    pub ages: Vec<f64>,
    pub sexes: BTreeMap<Sex, usize>,
    pub marital_statuses: BTreeMap<MaritalStatus, usize>,
    pub ethnicities: BTreeMap<Ethnicity, usize>,
    pub races: BTreeMap<Race, usize>,
    pub languages: BTreeMap<Language, usize>,
    pub payors: BTreeMap<PayorCategory, usize>,
    pub dx_categories: BTreeMap<ArcStr, usize>,
    pub dx_outcomes: BTreeMap<ArcStr, CategoryOutcomes>,
    pub distances_miles: Vec<f64>,
    pub incomes: Vec<f64>,
}

impl CohortStats {
    pub fn summarize(profiles: &[PatientProfile]) -> Self {
        let mut stats = CohortStats {
            n: profiles.len(),
            ..Default::default()
        };
        // seed every category so the tables always carry the full label set,
        // whatever this extract happens to contain
        for sex in Sex::ALL {
            stats.sexes.insert(sex, 0);
        }
        for status in MaritalStatus::ALL {
            stats.marital_statuses.insert(status, 0);
        }
        for ethnicity in Ethnicity::ALL {
            stats.ethnicities.insert(ethnicity, 0);
        }
        for race in Race::ALL {
            stats.races.insert(race, 0);
        }
        for language in Language::ALL {
            stats.languages.insert(language, 0);
        }
        for payor in PayorCategory::ALL {
            stats.payors.insert(payor, 0);
        }
        for (label, _) in crate::aggregate::Conversions::default().labeled() {
            stats.conversion_counts.insert(label, 0);
        }

        for profile in profiles {
            for (modality, record) in profile.by_modality.iter() {
                stats.by_modality[modality].absorb(&record.tally);
            }
            for (label, set) in profile.conversions.labeled() {
                if set {
                    *stats.conversion_counts.get_mut(label).expect("seeded") += 1;
                }
            }
            stats.deltas.push(profile);

            match &profile.demographics {
                Some(demo) => {
                    if let Some(age) = demo.age {
                        stats.ages.push(age as f64);
                    }
                    *stats.sexes.get_mut(&demo.sex).expect("seeded") += 1;
                    *stats
                        .marital_statuses
                        .get_mut(&demo.marital_status)
                        .expect("seeded") += 1;
                    *stats.ethnicities.get_mut(&demo.ethnicity).expect("seeded") += 1;
                    *stats.races.get_mut(&demo.race).expect("seeded") += 1;
                    *stats.languages.get_mut(&demo.language).expect("seeded") += 1;
                }
                None => stats.missing_demographics += 1,
            }
            if let Some(payor) = profile.payor_category {
                *stats.payors.get_mut(&payor).expect("seeded") += 1;
            }
            if let Some(distance) = profile.zip_distance {
                stats.distances_miles.push(distance.miles);
            }
            if let Some(income) = profile.zip_income {
                stats.incomes.push(income as f64);
            }

            if let Some(category) = &profile.dx_category {
                *stats.dx_categories.entry(category.clone()).or_default() += 1;
                let outcomes = stats.dx_outcomes.entry(category.clone()).or_default();
                outcomes.patients += 1;
                let procedures = &profile.by_modality[Modality::Procedure].tally;
                if procedures.completed > 0 {
                    outcomes.completed_procedures += 1;
                }
                if procedures.canceled > 0 {
                    outcomes.canceled_procedures += 1;
                }
                if profile.surgery.is_some() {
                    outcomes.surgeries += 1;
                }
            }
        }
        stats
    }

    /// Completed/canceled procedure patients across every diagnosis
    /// category, for the 2x2 procedure-outcome comparison.
    pub fn procedure_outcome_counts(&self) -> (u64, u64) {
        let completed = self
            .dx_outcomes
            .values()
            .map(|o| o.completed_procedures as u64)
            .sum();
        let canceled = self
            .dx_outcomes
            .values()
            .map(|o| o.canceled_procedures as u64)
            .sum();
        (completed, canceled)
    }
}

#[cfg(test)]
mod test {
    use super::{assign_cohorts, CohortKey, CohortStats};
    use crate::{
        aggregate::aggregate, ArcStr, Encounter, Modality, PatientProfile, Status,
    };
    use chrono::NaiveDate;
    use std::collections::BTreeSet;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn enc(
        mrn: u64,
        id: u32,
        modality: Modality,
        status: Status,
        new_patient: bool,
        day: NaiveDate,
    ) -> Encounter {
        Encounter {
            mrn,
            encounter_id: id,
            name: ArcStr::from("DOE, JANE"),
            provider: ArcStr::from("SMITH, ALEX"),
            department: ArcStr::from("UROLOGY CLINIC"),
            visit_type: ArcStr::from("VISIT"),
            modality,
            status,
            new_patient,
            date: day,
            creation_date: None,
            referral_date: None,
            icd: None,
            icd_name: None,
            payor: None,
            cancel_reason: None,
        }
    }

    fn profile(mrn: u64, encounters: &[Encounter]) -> PatientProfile {
        let mut sorted = encounters.to_vec();
        sorted.sort_by_key(|e| (e.date, e.encounter_id));
        aggregate(mrn, &sorted).unwrap()
    }

    fn sample_profiles() -> Vec<PatientProfile> {
        vec![
            // earliest completed visit is virtual
            profile(
                1,
                &[
                    enc(1, 0, Modality::Virtual, Status::Completed, true, date(2021, 1, 5)),
                    enc(1, 1, Modality::Office, Status::Completed, false, date(2021, 2, 1)),
                ],
            ),
            // office first
            profile(
                2,
                &[enc(2, 2, Modality::Office, Status::Completed, true, date(2021, 1, 8))],
            ),
            // no completed new-patient visit
            profile(
                3,
                &[enc(3, 3, Modality::Office, Status::Canceled, true, date(2021, 1, 9))],
            ),
        ]
    }

    #[test]
    fn partition_is_total_and_disjoint() {
        let profiles = sample_profiles();
        let mrns: BTreeSet<u64> = profiles.iter().map(|p| p.mrn).collect();
        let assignment = assign_cohorts(profiles);
        assert_eq!(assignment.assigned_total() + assignment.excluded.len(), 3);
        let mut seen = BTreeSet::new();
        for patients in assignment.cohorts.values() {
            for p in patients {
                assert!(seen.insert(p.mrn), "patient {} in two cohorts", p.mrn);
            }
        }
        assert_eq!(seen, mrns);
        assert_eq!(assignment.cohort(CohortKey::Virtual).len(), 1);
        assert_eq!(assignment.cohort(CohortKey::Office).len(), 1);
        assert_eq!(assignment.cohort(CohortKey::NoNewVisit).len(), 1);
        assert_eq!(assignment.cohort(CohortKey::Phone).len(), 0);
    }

    #[test]
    fn inconsistent_surgery_timing_excludes_entirely() {
        let mut p = profile(
            4,
            &[enc(4, 4, Modality::Office, Status::Completed, true, date(2021, 3, 1))],
        );
        // surgery recorded 10 days before the scheduling event
        p.deltas.scheduling_to_surgery = Some(-10);
        let assignment = assign_cohorts(vec![p]);
        assert_eq!(assignment.assigned_total(), 0);
        assert_eq!(assignment.excluded.len(), 1);
        for key in CohortKey::ALL {
            assert!(assignment.cohort(key).is_empty());
        }
    }

    #[test]
    fn delta_series_skip_undefined_patients() {
        let stats = CohortStats::summarize(&sample_profiles());
        // nobody has a referral date or a procedure, so those series are
        // empty rather than zero-filled
        assert!(stats.deltas.referral_to_first_visit.is_empty());
        assert!(stats.deltas.first_visit_to_first_procedure.is_empty());
        assert_eq!(stats.n, 3);
    }

    #[test]
    fn conversion_counts_follow_flags() {
        let stats = CohortStats::summarize(&sample_profiles());
        assert_eq!(stats.conversion_counts["virtual to office"], 1);
        assert_eq!(stats.conversion_counts["office to virtual"], 0);
    }
}
