//! The per-patient fold.
//!
//! One pass over a patient's encounters (pre-sorted ascending by date, with
//! encounter id as the tie-break) builds a [`PatientProfile`]: earliest
//! occurrence of each event type, running tallies, modality-conversion flags
//! and timing deltas. The fold never revises an earliest date upward, and a
//! delta whose precondition is absent stays `None`, never zero.

use crate::{
    enrich::{PatientDemographics, PayorCategory, ZipDistance},
    ArcStr, Encounter, Encounters, Modality, Mrn, PipelineError, Surgery,
};
use chrono::NaiveDate;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::ops::{Index, IndexMut};

/// The earliest sighting of some event type: when, which encounter, and the
/// diagnosis it carried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EarliestEvent {
    pub date: NaiveDate,
    pub encounter_id: u32,
    pub diagnosis: Option<ArcStr>,
}

impl EarliestEvent {
    fn from_encounter(enc: &Encounter) -> Self {
        EarliestEvent {
            date: enc.date,
            encounter_id: enc.encounter_id,
            diagnosis: enc.icd_name.clone(),
        }
    }
}

/// Keep the earlier of the stored event and `enc`.
///
/// With sorted input the first write wins, but the explicit comparison keeps
/// the slot monotone even for equal dates.
fn update_earliest(slot: &mut Option<EarliestEvent>, enc: &Encounter) {
    match slot {
        None => *slot = Some(EarliestEvent::from_encounter(enc)),
        Some(cur) if enc.date < cur.date => *slot = Some(EarliestEvent::from_encounter(enc)),
        _ => (),
    }
}

fn update_earliest_date(slot: &mut Option<NaiveDate>, date: NaiveDate) {
    match slot {
        None => *slot = Some(date),
        Some(cur) if date < *cur => *slot = Some(date),
        _ => (),
    }
}

/// Running encounter counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    pub total: u32,
    pub completed: u32,
    pub canceled: u32,
    pub new_patient: u32,
    pub completed_new_patient: u32,
}

impl Tally {
    /// Add another tally's counts into this one. Used when rolling patient
    /// tallies up to a cohort.
    pub fn absorb(&mut self, other: &Tally) {
        self.total += other.total;
        self.completed += other.completed;
        self.canceled += other.canceled;
        self.new_patient += other.new_patient;
        self.completed_new_patient += other.completed_new_patient;
    }

    fn record(&mut self, enc: &Encounter) {
        self.total += 1;
        if enc.is_completed() {
            self.completed += 1;
        }
        if enc.is_canceled() {
            self.canceled += 1;
        }
        if enc.is_new() {
            self.new_patient += 1;
            if enc.is_completed() {
                self.completed_new_patient += 1;
            }
        }
    }
}

/// A value per modality, indexable by [`Modality`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ByModality<T>([T; 4]);

impl<T> ByModality<T> {
    pub fn iter(&self) -> impl Iterator<Item = (Modality, &T)> {
        Modality::ALL.iter().map(|m| (*m, &self.0[m.idx()]))
    }
}

impl<T> Index<Modality> for ByModality<T> {
    type Output = T;
    fn index(&self, m: Modality) -> &T {
        &self.0[m.idx()]
    }
}

impl<T> IndexMut<Modality> for ByModality<T> {
    fn index_mut(&mut self, m: Modality) -> &mut T {
        &mut self.0[m.idx()]
    }
}

/// Per-modality accumulation: counts plus the earliest completed encounter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModalityRecord {
    pub tally: Tally,
    pub earliest_completed: Option<EarliestEvent>,
}

/// Which modality came first, for each ordered pair with at least one
/// completed encounter on both sides.
///
/// A flag and its reverse are never both set; an exact date tie records no
/// conversion in either direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversions {
    pub virtual_to_office: bool,
    pub office_to_virtual: bool,
    pub phone_to_office: bool,
    pub office_to_phone: bool,
    pub phone_to_virtual: bool,
    pub virtual_to_phone: bool,
}

impl Conversions {
    pub fn labeled(&self) -> [(&'static str, bool); 6] {
        [
            ("virtual to office", self.virtual_to_office),
            ("office to virtual", self.office_to_virtual),
            ("phone to office", self.phone_to_office),
            ("office to phone", self.office_to_phone),
            ("phone to virtual", self.phone_to_virtual),
            ("virtual to phone", self.virtual_to_phone),
        ]
    }
}

/// Day gaps between milestone events. `None` whenever either endpoint is
/// missing for the patient.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingDeltas {
    pub referral_to_first_visit: Option<i64>,
    pub referral_to_first_completed: Option<i64>,
    pub scheduling_to_first_visit: Option<i64>,
    pub scheduling_to_first_procedure: Option<i64>,
    pub first_visit_to_first_procedure: Option<i64>,
    pub scheduling_to_surgery: Option<i64>,
    pub first_visit_to_surgery: Option<i64>,
}

impl TimingDeltas {
    pub fn labeled(&self) -> [(&'static str, Option<i64>); 7] {
        [
            ("referral to first visit", self.referral_to_first_visit),
            (
                "referral to first completed visit",
                self.referral_to_first_completed,
            ),
            ("scheduling to first visit", self.scheduling_to_first_visit),
            (
                "scheduling to first procedure",
                self.scheduling_to_first_procedure,
            ),
            (
                "first visit to first procedure",
                self.first_visit_to_first_procedure,
            ),
            ("scheduling to surgery", self.scheduling_to_surgery),
            ("first visit to surgery", self.first_visit_to_surgery),
        ]
    }
}

/// The accumulated longitudinal record for one patient.
///
/// Built by [`aggregate`], enriched exactly once by
/// [`enrich::enrich`](crate::enrich::enrich), read-only afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientProfile {
    pub mrn: Mrn,
    pub name: ArcStr,

    pub tally: Tally,
    pub by_modality: ByModality<ModalityRecord>,

    /// Earliest encounter of any status or category.
    pub earliest_encounter: Option<EarliestEvent>,
    /// Earliest completed encounter of any category. Its diagnosis is the
    /// presenting diagnosis and is fixed once set.
    pub earliest_completed: Option<EarliestEvent>,
    pub earliest_new_visit: Option<EarliestEvent>,
    pub earliest_completed_new_visit: Option<EarliestEvent>,
    /// Earliest referral / scheduling action, tracked regardless of the
    /// owning encounter's status.
    pub earliest_referral: Option<NaiveDate>,
    pub earliest_scheduling: Option<NaiveDate>,

    /// Diagnosis at presentation, from the earliest completed encounter.
    pub presenting_dx: Option<ArcStr>,
    /// Payor from the earliest completed encounter that names one.
    pub payor: Option<ArcStr>,

    pub conversions: Conversions,
    pub deltas: TimingDeltas,

    // Enrichment, populated once after the fold. `demographics == None`
    // means the linkage was missing, a common condition rather than an
    // error; statistics must skip such patients in the affected
    // denominators.
    pub demographics: Option<PatientDemographics>,
    pub payor_category: Option<PayorCategory>,
    pub dx_category: Option<ArcStr>,
    pub dx_needs_review: bool,
    pub surgery: Option<Surgery>,
    pub zip_distance: Option<ZipDistance>,
    pub zip_income: Option<u32>,
}

impl PatientProfile {
    fn new(mrn: Mrn, name: ArcStr) -> Self {
        PatientProfile {
            mrn,
            name,
            tally: Tally::default(),
            by_modality: ByModality::default(),
            earliest_encounter: None,
            earliest_completed: None,
            earliest_new_visit: None,
            earliest_completed_new_visit: None,
            earliest_referral: None,
            earliest_scheduling: None,
            presenting_dx: None,
            payor: None,
            conversions: Conversions::default(),
            deltas: TimingDeltas::default(),
            demographics: None,
            payor_category: None,
            dx_category: None,
            dx_needs_review: false,
            surgery: None,
            zip_distance: None,
            zip_income: None,
        }
    }

    pub fn has_any(&self, modality: Modality) -> bool {
        self.by_modality[modality].tally.total > 0
    }

    pub fn has_completed(&self, modality: Modality) -> bool {
        self.by_modality[modality].tally.completed > 0
    }

    pub fn has_any_completed_visit(&self) -> bool {
        Modality::VISITS.iter().any(|m| self.has_completed(*m))
    }

    /// The earliest completed office/virtual/phone encounter, with its
    /// modality. Ties between modalities go to the lower encounter id.
    pub fn earliest_completed_visit(&self) -> Option<(Modality, &EarliestEvent)> {
        Modality::VISITS
            .iter()
            .filter_map(|m| self.by_modality[*m].earliest_completed.as_ref().map(|e| (*m, e)))
            .min_by_key(|(_, e)| (e.date, e.encounter_id))
    }
}

/// Fold one patient's encounters into a profile.
///
/// Precondition: `encounters` is sorted ascending by (date, encounter id).
/// [`Encounters::patient_groups`] produces groups in exactly this order.
pub fn aggregate(mrn: Mrn, encounters: &[Encounter]) -> Result<PatientProfile, PipelineError> {
    let first = encounters.first().ok_or(PipelineError::EmptyGroup { mrn })?;
    debug_assert!(
        encounters
            .windows(2)
            .all(|w| (w[0].date, w[0].encounter_id) <= (w[1].date, w[1].encounter_id)),
        "aggregate requires date-sorted encounters"
    );
    let mut profile = PatientProfile::new(mrn, first.name.clone());

    for enc in encounters {
        profile.tally.record(enc);
        let slot = &mut profile.by_modality[enc.modality];
        slot.tally.record(enc);

        update_earliest(&mut profile.earliest_encounter, enc);
        if enc.is_new() {
            update_earliest(&mut profile.earliest_new_visit, enc);
        }
        if enc.is_completed() {
            if profile.earliest_completed.is_none() {
                // first completed encounter in sorted order; fixes the
                // presenting diagnosis for good
                profile.earliest_completed = Some(EarliestEvent::from_encounter(enc));
                profile.presenting_dx = enc.icd_name.clone();
            }
            update_earliest(&mut slot.earliest_completed, enc);
            if enc.is_new() {
                update_earliest(&mut profile.earliest_completed_new_visit, enc);
            }
            if profile.payor.is_none() {
                profile.payor = enc.payor.clone();
            }
        }
        // referral and scheduling apply to canceled rows too
        if let Some(date) = enc.referral_date {
            update_earliest_date(&mut profile.earliest_referral, date);
        }
        if let Some(date) = enc.creation_date {
            update_earliest_date(&mut profile.earliest_scheduling, date);
        }
    }

    profile.conversions = detect_conversions(&profile.by_modality);
    profile.deltas = compute_deltas(&profile);
    Ok(profile)
}

/// Aggregate every patient group. Groups are independent, so this runs
/// data-parallel across patients; each group keeps its internal date order.
pub fn aggregate_all(encounters: &Encounters) -> Result<Vec<PatientProfile>, PipelineError> {
    encounters
        .patient_groups()
        .into_par_iter()
        .map(|(mrn, group)| aggregate(mrn, &group))
        .collect()
}

/// `true` when modality `a` was completed strictly before modality `b`.
fn precedes(a: &Option<EarliestEvent>, b: &Option<EarliestEvent>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.date < b.date,
        _ => false,
    }
}

fn detect_conversions(by_modality: &ByModality<ModalityRecord>) -> Conversions {
    let office = &by_modality[Modality::Office].earliest_completed;
    let virt = &by_modality[Modality::Virtual].earliest_completed;
    let phone = &by_modality[Modality::Phone].earliest_completed;
    Conversions {
        virtual_to_office: precedes(virt, office),
        office_to_virtual: precedes(office, virt),
        phone_to_office: precedes(phone, office),
        office_to_phone: precedes(office, phone),
        phone_to_virtual: precedes(phone, virt),
        virtual_to_phone: precedes(virt, phone),
    }
}

fn days_between(from: Option<NaiveDate>, to: Option<NaiveDate>) -> Option<i64> {
    Some((to? - from?).num_days())
}

fn compute_deltas(profile: &PatientProfile) -> TimingDeltas {
    let first_visit = profile.earliest_encounter.as_ref().map(|e| e.date);
    let first_completed = profile.earliest_completed.as_ref().map(|e| e.date);
    let first_completed_visit = profile.earliest_completed_visit().map(|(_, e)| e.date);
    let first_procedure = profile.by_modality[Modality::Procedure]
        .earliest_completed
        .as_ref()
        .map(|e| e.date);
    TimingDeltas {
        referral_to_first_visit: days_between(profile.earliest_referral, first_visit),
        referral_to_first_completed: days_between(profile.earliest_referral, first_completed),
        scheduling_to_first_visit: days_between(profile.earliest_scheduling, first_visit),
        scheduling_to_first_procedure: days_between(profile.earliest_scheduling, first_procedure),
        first_visit_to_first_procedure: days_between(first_completed_visit, first_procedure),
        // surgery linkage arrives at enrichment
        scheduling_to_surgery: None,
        first_visit_to_surgery: None,
    }
}

#[cfg(test)]
mod test {
    use super::{aggregate, PatientProfile};
    use crate::{ArcStr, Encounter, Modality, PipelineError, Status};
    use chrono::NaiveDate;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn enc(id: u32, modality: Modality, status: Status, day: NaiveDate) -> Encounter {
        Encounter {
            mrn: 1,
            encounter_id: id,
            name: ArcStr::from("DOE, JANE"),
            provider: ArcStr::from("SMITH, ALEX"),
            department: ArcStr::from("UROLOGY CLINIC"),
            visit_type: ArcStr::from("VISIT"),
            modality,
            status,
            new_patient: false,
            date: day,
            creation_date: None,
            referral_date: None,
            icd: None,
            icd_name: None,
            payor: None,
            cancel_reason: None,
        }
    }

    fn run(encounters: &[Encounter]) -> PatientProfile {
        let mut sorted = encounters.to_vec();
        sorted.sort_by_key(|e| (e.date, e.encounter_id));
        aggregate(1, &sorted).unwrap()
    }

    #[test]
    fn virtual_then_office_conversion() {
        let mut virt = enc(0, Modality::Virtual, Status::Completed, date(2021, 1, 5));
        virt.referral_date = Some(date(2020, 12, 1));
        virt.creation_date = Some(date(2020, 12, 15));
        virt.new_patient = true;
        virt.icd_name = Some(ArcStr::from("Elevated PSA"));
        let office = enc(1, Modality::Office, Status::Completed, date(2021, 1, 20));

        let profile = run(&[virt, office]);
        let (modality, earliest) = profile.earliest_completed_visit().unwrap();
        assert_eq!(modality, Modality::Virtual);
        assert_eq!(earliest.date, date(2021, 1, 5));
        assert_eq!(profile.deltas.referral_to_first_completed, Some(35));
        assert!(profile.conversions.virtual_to_office);
        assert!(!profile.conversions.office_to_virtual);
        assert_eq!(profile.presenting_dx.as_deref(), Some("Elevated PSA"));
    }

    #[test]
    fn canceled_procedure_only() {
        let proc = enc(0, Modality::Procedure, Status::Canceled, date(2021, 3, 1));
        let profile = run(&[proc]);
        assert!(!profile.has_any_completed_visit());
        assert!(profile.earliest_completed.is_none());
        assert!(profile.has_any(Modality::Procedure));
        assert!(!profile.has_completed(Modality::Procedure));
        // absent preconditions leave deltas unset, never zero
        assert_eq!(profile.deltas.referral_to_first_completed, None);
        assert_eq!(profile.deltas.first_visit_to_first_procedure, None);
    }

    #[test]
    fn same_day_modalities_record_no_conversion() {
        let virt = enc(0, Modality::Virtual, Status::Completed, date(2021, 2, 2));
        let office = enc(1, Modality::Office, Status::Completed, date(2021, 2, 2));
        let profile = run(&[virt, office]);
        assert!(!profile.conversions.virtual_to_office);
        assert!(!profile.conversions.office_to_virtual);
    }

    #[test]
    fn earliest_fields_are_monotone() {
        let encounters = vec![
            enc(0, Modality::Office, Status::Canceled, date(2021, 1, 2)),
            enc(1, Modality::Office, Status::Completed, date(2021, 1, 10)),
            enc(2, Modality::Office, Status::Completed, date(2021, 2, 1)),
            enc(3, Modality::Virtual, Status::Completed, date(2021, 3, 1)),
        ];
        let profile = run(&encounters);
        assert_eq!(profile.earliest_encounter.as_ref().unwrap().date, date(2021, 1, 2));
        assert_eq!(profile.earliest_completed.as_ref().unwrap().date, date(2021, 1, 10));
        assert_eq!(
            profile.by_modality[Modality::Office]
                .earliest_completed
                .as_ref()
                .unwrap()
                .date,
            date(2021, 1, 10)
        );
        assert_eq!(profile.tally.total, 4);
        assert_eq!(profile.tally.completed, 3);
        assert_eq!(profile.tally.canceled, 1);
        assert!(profile.conversions.office_to_virtual);
    }

    #[test]
    fn tied_dates_aggregate_identically_in_either_order() {
        let a = enc(0, Modality::Office, Status::Completed, date(2021, 5, 1));
        let b = enc(1, Modality::Virtual, Status::Completed, date(2021, 5, 1));
        // both inputs are date-ascending; the encounter-id tie-break makes
        // the fold order deterministic
        let forward = run(&[a.clone(), b.clone()]);
        let reversed = run(&[b, a]);
        assert_eq!(forward, reversed);
    }

    #[test]
    fn empty_group_is_an_error() {
        match aggregate(7, &[]) {
            Err(PipelineError::EmptyGroup { mrn }) => assert_eq!(mrn, 7),
            other => panic!("expected EmptyGroup, got {:?}", other.map(|p| p.mrn)),
        }
    }
}
