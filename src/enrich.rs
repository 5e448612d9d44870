//! Post-fold enrichment: demographic and surgical linkage, categorical
//! normalization, and the zip-code lookups.
//!
//! Enrichment is a pure merge applied exactly once per profile. A patient
//! with no demographic or surgical match is flagged by leaving the field
//! `None`; downstream statistics drop such patients from the affected
//! denominators instead of crashing.

use crate::{
    util::{optional_string, path_exists},
    AnalysisConfig, ArcStr, Demographics, PatientProfile, Result, Surgeries,
};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, path::Path};

/// Legal sex as recorded; anything else in the extract becomes `Unknown`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Sex {
    Male,
    Female,
    Unknown,
}

impl Sex {
    pub const ALL: [Sex; 3] = [Sex::Male, Sex::Female, Sex::Unknown];
}

impl fmt::Display for Sex {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Sex::Male => f.write_str("Male"),
            Sex::Female => f.write_str("Female"),
            Sex::Unknown => f.write_str("Unknown"),
        }
    }
}

/// Consolidated race categories.
///
/// Rare single categories collapse into `Other`; any multi-entry value is
/// `Multiracial`; "White" cross-references the ethnic group so that
/// Hispanic-identifying patients are not counted in the White stratum.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Race {
    White,
    Black,
    Asian,
    Multiracial,
    Other,
    DeclinedUnknown,
}

impl Race {
    pub const ALL: [Race; 6] = [
        Race::White,
        Race::Black,
        Race::Asian,
        Race::Multiracial,
        Race::Other,
        Race::DeclinedUnknown,
    ];
}

impl fmt::Display for Race {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Race::White => f.write_str("White"),
            Race::Black => f.write_str("Black or African American"),
            Race::Asian => f.write_str("Asian"),
            Race::Multiracial => f.write_str("Multiracial"),
            Race::Other => f.write_str("Other"),
            Race::DeclinedUnknown => f.write_str("Declined / Unknown"),
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Ethnicity {
    Hispanic,
    NonHispanic,
    DeclinedUnknown,
}

impl Ethnicity {
    pub const ALL: [Ethnicity; 3] = [
        Ethnicity::Hispanic,
        Ethnicity::NonHispanic,
        Ethnicity::DeclinedUnknown,
    ];
}

impl fmt::Display for Ethnicity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Ethnicity::Hispanic => f.write_str("Hispanic or Latino"),
            Ethnicity::NonHispanic => f.write_str("Non-Hispanic"),
            Ethnicity::DeclinedUnknown => f.write_str("Declined / Unknown"),
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Language {
    English,
    Spanish,
    Other,
    DeclinedUnknown,
}

impl Language {
    pub const ALL: [Language; 4] = [
        Language::English,
        Language::Spanish,
        Language::Other,
        Language::DeclinedUnknown,
    ];
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Language::English => f.write_str("English"),
            Language::Spanish => f.write_str("Spanish"),
            Language::Other => f.write_str("Other"),
            Language::DeclinedUnknown => f.write_str("Declined / Unknown"),
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum MaritalStatus {
    Partnered,
    Single,
    Divorced,
    Widowed,
    Other,
    DeclinedUnknown,
}

impl MaritalStatus {
    pub const ALL: [MaritalStatus; 6] = [
        MaritalStatus::Partnered,
        MaritalStatus::Single,
        MaritalStatus::Divorced,
        MaritalStatus::Widowed,
        MaritalStatus::Other,
        MaritalStatus::DeclinedUnknown,
    ];
}

impl fmt::Display for MaritalStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MaritalStatus::Partnered => f.write_str("Married / Partnered"),
            MaritalStatus::Single => f.write_str("Single"),
            MaritalStatus::Divorced => f.write_str("Divorced / Separated"),
            MaritalStatus::Widowed => f.write_str("Widowed"),
            MaritalStatus::Other => f.write_str("Other"),
            MaritalStatus::DeclinedUnknown => f.write_str("Declined / Unknown"),
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum PayorCategory {
    Medicare,
    Medicaid,
    Commercial,
    SelfPay,
    Other,
}

impl PayorCategory {
    pub const ALL: [PayorCategory; 5] = [
        PayorCategory::Medicare,
        PayorCategory::Medicaid,
        PayorCategory::Commercial,
        PayorCategory::SelfPay,
        PayorCategory::Other,
    ];
}

impl fmt::Display for PayorCategory {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PayorCategory::Medicare => f.write_str("Medicare"),
            PayorCategory::Medicaid => f.write_str("Medicaid"),
            PayorCategory::Commercial => f.write_str("Commercial"),
            PayorCategory::SelfPay => f.write_str("Self-pay"),
            PayorCategory::Other => f.write_str("Other"),
        }
    }
}

/// The normalized demographic block carried by an enriched profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientDemographics {
    pub age: Option<u16>,
    pub sex: Sex,
    pub marital_status: MaritalStatus,
    pub ethnicity: Ethnicity,
    pub race: Race,
    pub language: Language,
    pub zip: Option<ArcStr>,
}

fn is_missing(s: &str) -> bool {
    let s = s.trim();
    s.is_empty()
        || s.eq_ignore_ascii_case("null")
        || s.to_lowercase().contains("declin")
        || s.to_lowercase().contains("unknown")
        || s.to_lowercase().contains("refused")
}

pub fn normalize_sex(raw: Option<&str>) -> Sex {
    let Some(raw) = raw else { return Sex::Unknown };
    let raw = raw.trim().to_lowercase();
    match raw.as_str() {
        "m" | "male" => Sex::Male,
        "f" | "female" => Sex::Female,
        _ => Sex::Unknown,
    }
}

pub fn normalize_ethnicity(raw: Option<&str>) -> Ethnicity {
    let Some(raw) = raw else {
        return Ethnicity::DeclinedUnknown;
    };
    if is_missing(raw) {
        return Ethnicity::DeclinedUnknown;
    }
    let raw = raw.to_lowercase();
    if raw.starts_with("non") || raw.starts_with("not") {
        Ethnicity::NonHispanic
    } else if raw.contains("hispanic") || raw.contains("latino") || raw.contains("latina") {
        Ethnicity::Hispanic
    } else {
        Ethnicity::NonHispanic
    }
}

/// Consolidate a raw race value, cross-referencing ethnicity.
///
/// Multiple recorded races merge into `Multiracial`. A "White" entry for a
/// Hispanic-identifying patient is counted as `Other` so the White stratum
/// stays non-Hispanic White.
pub fn normalize_race(raw: Option<&str>, ethnicity: Ethnicity) -> Race {
    let Some(raw) = raw else {
        return Race::DeclinedUnknown;
    };
    if is_missing(raw) {
        return Race::DeclinedUnknown;
    }
    if raw.contains(';') || raw.contains(" and ") {
        return Race::Multiracial;
    }
    let raw = raw.to_lowercase();
    if raw.contains("white") || raw.contains("caucasian") {
        if ethnicity == Ethnicity::Hispanic {
            Race::Other
        } else {
            Race::White
        }
    } else if raw.contains("black") || raw.contains("african") {
        Race::Black
    } else if raw.contains("asian") {
        Race::Asian
    } else {
        // American Indian / Alaska Native, Pacific Islander and free-text
        // entries are too rare to compare on their own
        Race::Other
    }
}

pub fn normalize_language(raw: Option<&str>) -> Language {
    let Some(raw) = raw else {
        return Language::DeclinedUnknown;
    };
    if is_missing(raw) {
        return Language::DeclinedUnknown;
    }
    let raw = raw.to_lowercase();
    if raw.contains("english") {
        Language::English
    } else if raw.contains("spanish") {
        Language::Spanish
    } else {
        Language::Other
    }
}

pub fn normalize_marital_status(raw: Option<&str>) -> MaritalStatus {
    let Some(raw) = raw else {
        return MaritalStatus::DeclinedUnknown;
    };
    if is_missing(raw) {
        return MaritalStatus::DeclinedUnknown;
    }
    let raw = raw.to_lowercase();
    if raw.contains("married") || raw.contains("partner") || raw.contains("significant other") {
        MaritalStatus::Partnered
    } else if raw.contains("single") {
        MaritalStatus::Single
    } else if raw.contains("divorc") || raw.contains("separat") {
        MaritalStatus::Divorced
    } else if raw.contains("widow") {
        MaritalStatus::Widowed
    } else {
        MaritalStatus::Other
    }
}

pub fn payor_category(payor: &str) -> PayorCategory {
    let payor = payor.to_lowercase();
    if payor.contains("medicare") {
        PayorCategory::Medicare
    } else if payor.contains("medicaid") || payor.contains("health plan") {
        PayorCategory::Medicaid
    } else if payor.contains("self") {
        PayorCategory::SelfPay
    } else if payor.contains("workers") || payor.contains("veteran") {
        PayorCategory::Other
    } else {
        PayorCategory::Commercial
    }
}

/// Driving distance and duration from the clinic for one zip code.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ZipDistance {
    pub miles: f64,
    pub minutes: f64,
}

/// An external service that can resolve a zip code to a driving distance.
///
/// The real implementation talks to a geocoding API; the pipeline only sees
/// this trait, injected into enrichment next to the cache.
pub trait DistanceResolver {
    fn resolve(&self, zip: &str) -> Result<Option<ZipDistance>>;
}

/// Resolver for offline runs: every cache miss stays a miss.
pub struct NoResolver;

impl DistanceResolver for NoResolver {
    fn resolve(&self, _zip: &str) -> Result<Option<ZipDistance>> {
        Ok(None)
    }
}

/// Read-through cache for zip-code driving distances.
///
/// Lookups hit the local table first; misses go to the injected resolver and
/// successful answers are retained, so a later [`save`](Self::save) persists
/// them and repeat runs avoid re-querying the service.
#[derive(Default)]
pub struct ZipDistanceCache {
    table: BTreeMap<ArcStr, ZipDistance>,
    dirty: bool,
}

impl ZipDistanceCache {
    /// Load the persisted cache, or start empty on the first run.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path_exists(&crate::cache_path(path))? {
            return Ok(Self::default());
        }
        let entries: Vec<(ArcStr, ZipDistance)> = crate::load(path)?;
        Ok(ZipDistanceCache {
            table: entries.into_iter().collect(),
            dirty: false,
        })
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result {
        if !self.dirty {
            return Ok(());
        }
        let entries: Vec<(ArcStr, ZipDistance)> = self
            .table
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        crate::save(&entries, path)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn lookup_or_resolve(
        &mut self,
        zip: &str,
        resolver: &dyn DistanceResolver,
    ) -> Result<Option<ZipDistance>> {
        if let Some(hit) = self.table.get(zip) {
            return Ok(Some(*hit));
        }
        match resolver.resolve(zip)? {
            Some(distance) => {
                self.table.insert(zip.into(), distance);
                self.dirty = true;
                Ok(Some(distance))
            }
            None => Ok(None),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ZipIncomeRaw {
    #[serde(rename = "Zip Code")]
    zip: String,
    #[serde(rename = "Median Household Income", deserialize_with = "optional_string")]
    income: Option<ArcStr>,
}

/// Zip code -> median household income, from the census extract.
#[derive(Default)]
pub struct ZipIncomes {
    table: BTreeMap<ArcStr, u32>,
}

impl ZipIncomes {
    pub fn load_orig(path: impl AsRef<Path>) -> Result<Self> {
        let raw: Vec<ZipIncomeRaw> = crate::load_orig(path)?;
        let mut table = BTreeMap::new();
        for row in raw {
            let Some(income) = row.income else { continue };
            let income = income
                .trim_start_matches('$')
                .replace(',', "")
                .parse::<u32>()
                .with_context(|| format!("bad income for zip {}", row.zip))?;
            table.insert(ArcStr::from(row.zip.trim()), income);
        }
        Ok(ZipIncomes { table })
    }

    pub fn find(&self, zip: &str) -> Option<u32> {
        self.table.get(zip).copied()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

/// Merge external linkage data onto one profile. Called exactly once, after
/// the aggregation fold; the profile is read-only afterwards.
pub fn enrich(
    profile: &mut PatientProfile,
    demographics: &Demographics,
    surgeries: &Surgeries,
    distances: &mut ZipDistanceCache,
    resolver: &dyn DistanceResolver,
    incomes: &ZipIncomes,
    config: &AnalysisConfig,
) -> Result {
    if let Some(row) = demographics.find_by_mrn(profile.mrn) {
        let ethnicity = normalize_ethnicity(row.ethnic_group.as_deref());
        profile.demographics = Some(PatientDemographics {
            age: row.age,
            sex: normalize_sex(row.legal_sex.as_deref()),
            marital_status: normalize_marital_status(row.marital_status.as_deref()),
            ethnicity,
            race: normalize_race(row.race.as_deref(), ethnicity),
            language: normalize_language(row.language.as_deref()),
            zip: row.zip.clone(),
        });
        if let Some(zip) = &row.zip {
            profile.zip_distance = distances.lookup_or_resolve(zip, resolver)?;
            profile.zip_income = incomes.find(zip);
        }
    }

    if let Some(surgery) = surgeries.earliest_for_patient(profile.mrn) {
        profile.deltas.scheduling_to_surgery = profile
            .earliest_scheduling
            .map(|date| (surgery.date - date).num_days());
        profile.deltas.first_visit_to_surgery = profile
            .earliest_encounter
            .as_ref()
            .map(|e| (surgery.date - e.date).num_days());
        profile.surgery = Some(surgery.clone());
    }

    if let Some(payor) = &profile.payor {
        profile.payor_category = Some(payor_category(payor));
    }
    if let Some(dx) = &profile.presenting_dx {
        let (category, needs_review) = config.dx_category(dx);
        profile.dx_category = Some(category);
        profile.dx_needs_review = needs_review;
    }
    Ok(())
}

/// Enrich every profile against the same lookup tables.
pub fn enrich_all(
    profiles: &mut [PatientProfile],
    demographics: &Demographics,
    surgeries: &Surgeries,
    distances: &mut ZipDistanceCache,
    resolver: &dyn DistanceResolver,
    incomes: &ZipIncomes,
    config: &AnalysisConfig,
) -> Result {
    for profile in profiles {
        enrich(
            profile,
            demographics,
            surgeries,
            distances,
            resolver,
            incomes,
            config,
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn race_consolidation() {
        assert_eq!(
            normalize_race(Some("White or Caucasian"), Ethnicity::NonHispanic),
            Race::White
        );
        // the ethnicity cross-reference keeps the White stratum non-Hispanic
        assert_eq!(
            normalize_race(Some("White"), Ethnicity::Hispanic),
            Race::Other
        );
        assert_eq!(
            normalize_race(Some("White; Asian"), Ethnicity::NonHispanic),
            Race::Multiracial
        );
        assert_eq!(
            normalize_race(Some("Native Hawaiian or Other Pacific Islander"), Ethnicity::NonHispanic),
            Race::Other
        );
        assert_eq!(
            normalize_race(Some("Patient Refused"), Ethnicity::NonHispanic),
            Race::DeclinedUnknown
        );
        assert_eq!(normalize_race(None, Ethnicity::NonHispanic), Race::DeclinedUnknown);
    }

    #[test]
    fn ethnicity_parsing() {
        assert_eq!(
            normalize_ethnicity(Some("Hispanic or Latino")),
            Ethnicity::Hispanic
        );
        assert_eq!(
            normalize_ethnicity(Some("Non-Hispanic")),
            Ethnicity::NonHispanic
        );
        assert_eq!(
            normalize_ethnicity(Some("Declined / Unknown")),
            Ethnicity::DeclinedUnknown
        );
    }

    #[test]
    fn marital_consolidation() {
        assert_eq!(
            normalize_marital_status(Some("Significant Other")),
            MaritalStatus::Partnered
        );
        assert_eq!(
            normalize_marital_status(Some("Legally Separated")),
            MaritalStatus::Divorced
        );
        assert_eq!(normalize_marital_status(Some("Unknown")), MaritalStatus::DeclinedUnknown);
    }

    #[test]
    fn payor_buckets() {
        assert_eq!(payor_category("MEDICARE ADVANTAGE"), PayorCategory::Medicare);
        assert_eq!(payor_category("STATE MEDICAID"), PayorCategory::Medicaid);
        assert_eq!(payor_category("SELF PAY"), PayorCategory::SelfPay);
        assert_eq!(payor_category("BLUE CROSS"), PayorCategory::Commercial);
    }

    struct CountingResolver(std::cell::Cell<usize>);

    impl DistanceResolver for CountingResolver {
        fn resolve(&self, zip: &str) -> crate::Result<Option<ZipDistance>> {
            self.0.set(self.0.get() + 1);
            if zip == "97201" {
                Ok(Some(ZipDistance {
                    miles: 3.2,
                    minutes: 11.0,
                }))
            } else {
                Ok(None)
            }
        }
    }

    #[test]
    fn distance_cache_reads_through_once() {
        let resolver = CountingResolver(std::cell::Cell::new(0));
        let mut cache = ZipDistanceCache::default();
        let first = cache.lookup_or_resolve("97201", &resolver).unwrap();
        assert_eq!(first.map(|d| d.miles), Some(3.2));
        // second lookup is served from the table
        cache.lookup_or_resolve("97201", &resolver).unwrap();
        assert_eq!(resolver.0.get(), 1);
        // unresolvable zips are asked again next time
        assert!(cache.lookup_or_resolve("00000", &resolver).unwrap().is_none());
        assert_eq!(resolver.0.get(), 2);
        assert_eq!(cache.len(), 1);
    }
}
