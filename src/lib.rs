pub mod aggregate;
pub mod cohort;
pub mod config;
pub mod enrich;
pub mod report;
pub mod stats;
mod util;

pub use anyhow::{Context, Error};
use chrono::NaiveDate;
use qu::ick_use::*;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt, fs, io,
    ops::Deref,
    path::{Path, PathBuf},
    sync::Arc,
};

pub use crate::{
    aggregate::{aggregate, aggregate_all, EarliestEvent, PatientProfile},
    cohort::{assign_cohorts, CohortAssignment, CohortKey, CohortStats},
    config::AnalysisConfig,
    util::{header, parse_extract_date},
};
use crate::util::{opt_extract_date, optional_string, yes_no};

pub type ArcStr = Arc<str>;
pub type Result<T = (), E = anyhow::Error> = std::result::Result<T, E>;

/// Medical record number; identifies the same patient across every dataset.
pub type Mrn = u64;

/// The failure modes the pipeline distinguishes.
///
/// Ingestion and aggregation problems abort the run; everything softer
/// (missing enrichment data, empty denominators) is a flag handled by the
/// statistics layer, not an error.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("row {row}: missing or unparseable required field `{field}`")]
    MalformedRecord { row: usize, field: &'static str },
    #[error("patient {mrn} reached aggregation with no encounters")]
    EmptyGroup { mrn: Mrn },
    #[error("patient {mrn}: surgery precedes {reference} ({days} day delta)")]
    InconsistentTiming {
        mrn: Mrn,
        reference: &'static str,
        days: i64,
    },
}

/// Delivery channel of an encounter.
///
/// `Procedure` is a visit category, not a channel: a procedure row is always
/// `Procedure` no matter how it was delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Modality {
    Office,
    Virtual,
    Phone,
    Procedure,
}

impl Modality {
    pub const ALL: [Modality; 4] = [
        Modality::Office,
        Modality::Virtual,
        Modality::Phone,
        Modality::Procedure,
    ];

    /// The three channels that count as visits.
    pub const VISITS: [Modality; 3] = [Modality::Office, Modality::Virtual, Modality::Phone];

    pub(crate) fn idx(self) -> usize {
        match self {
            Modality::Office => 0,
            Modality::Virtual => 1,
            Modality::Phone => 2,
            Modality::Procedure => 3,
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Modality::Office => f.write_str("office"),
            Modality::Virtual => f.write_str("virtual"),
            Modality::Phone => f.write_str("phone"),
            Modality::Procedure => f.write_str("procedure"),
        }
    }
}

/// Terminal status of a scheduled encounter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Status {
    Completed,
    Canceled,
    Other,
}

impl Status {
    pub fn from_label(label: &str) -> Self {
        if label.eq_ignore_ascii_case("completed") {
            Status::Completed
        } else if label.eq_ignore_ascii_case("canceled") || label.eq_ignore_ascii_case("cancelled")
        {
            Status::Canceled
        } else {
            Status::Other
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Status::Completed => f.write_str("completed"),
            Status::Canceled => f.write_str("canceled"),
            Status::Other => f.write_str("other"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct EncounterRaw {
    #[serde(rename = "Patient MRN")]
    mrn: String,
    #[serde(rename = "Patient Name")]
    name: String,
    #[serde(rename = "Visit Type")]
    visit_type: String,
    #[serde(rename = "Visit Type Category Name")]
    visit_category: String,
    #[serde(rename = "Appointment Status")]
    status: String,
    #[serde(rename = "Reason Appointment was Canceled", deserialize_with = "optional_string")]
    cancel_reason: Option<ArcStr>,
    #[serde(rename = "Is New Patient Visit Type?", deserialize_with = "yes_no")]
    new_patient: bool,
    #[serde(rename = "Encounter Date")]
    date: String,
    #[serde(rename = "Appointment Creation Date", deserialize_with = "opt_extract_date")]
    creation_date: Option<NaiveDate>,
    #[serde(rename = "Referral Creation Date", deserialize_with = "opt_extract_date")]
    referral_date: Option<NaiveDate>,
    #[serde(rename = "Primary Diagnosis ICD-10 Code", deserialize_with = "optional_string")]
    icd: Option<ArcStr>,
    #[serde(rename = "Primary Diagnosis ICD-10 Description", deserialize_with = "optional_string")]
    icd_name: Option<ArcStr>,
    #[serde(rename = "Primary Visit Provider Name")]
    provider: String,
    #[serde(rename = "Visit Department Name")]
    department: String,
    #[serde(rename = "Payor Name", deserialize_with = "optional_string")]
    payor: Option<ArcStr>,
}

/// One clinical encounter or procedure event, classified at construction.
///
/// Immutable once built; the aggregation fold only reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Encounter {
    pub mrn: Mrn,
    /// Unique within the dataset, assigned by ingestion order. Used as the
    /// tie-break when two encounters share a date.
    pub encounter_id: u32,
    pub name: ArcStr,
    pub provider: ArcStr,
    pub department: ArcStr,
    /// The raw visit type label, kept for auditing the modality mapping.
    pub visit_type: ArcStr,
    pub modality: Modality,
    pub status: Status,
    pub new_patient: bool,
    pub date: NaiveDate,
    /// When the appointment was created (the scheduling action).
    pub creation_date: Option<NaiveDate>,
    pub referral_date: Option<NaiveDate>,
    pub icd: Option<ArcStr>,
    pub icd_name: Option<ArcStr>,
    pub payor: Option<ArcStr>,
    pub cancel_reason: Option<ArcStr>,
}

impl Encounter {
    /// Validate and classify one raw row.
    ///
    /// `row` is the 1-based position in the extract, used for error reporting.
    fn from_raw(
        raw: EncounterRaw,
        row: usize,
        encounter_id: u32,
        config: &AnalysisConfig,
    ) -> Result<Self, PipelineError> {
        let mrn = raw
            .mrn
            .trim()
            .parse::<Mrn>()
            .map_err(|_| PipelineError::MalformedRecord { row, field: "Patient MRN" })?;
        let date = parse_extract_date(raw.date.trim()).ok_or(PipelineError::MalformedRecord {
            row,
            field: "Encounter Date",
        })?;
        if raw.status.trim().is_empty() {
            return Err(PipelineError::MalformedRecord {
                row,
                field: "Appointment Status",
            });
        }
        if raw.visit_category.trim().is_empty() {
            return Err(PipelineError::MalformedRecord {
                row,
                field: "Visit Type Category Name",
            });
        }
        let modality = config.classify_visit(&raw.visit_category, &raw.visit_type);
        Ok(Encounter {
            mrn,
            encounter_id,
            name: raw.name.into(),
            provider: raw.provider.into(),
            department: raw.department.into(),
            visit_type: raw.visit_type.into(),
            modality,
            status: Status::from_label(raw.status.trim()),
            new_patient: raw.new_patient,
            date,
            creation_date: raw.creation_date,
            referral_date: raw.referral_date,
            icd: raw.icd,
            icd_name: raw.icd_name,
            payor: raw.payor,
            cancel_reason: raw.cancel_reason,
        })
    }

    pub fn is_completed(&self) -> bool {
        self.status == Status::Completed
    }

    pub fn is_canceled(&self) -> bool {
        self.status == Status::Canceled
    }

    pub fn is_new(&self) -> bool {
        self.new_patient
    }

    pub fn is_virtual(&self) -> bool {
        self.modality == Modality::Virtual
    }

    pub fn is_phone(&self) -> bool {
        self.modality == Modality::Phone
    }

    /// Office is derived: a visit row that is neither virtual nor phone.
    pub fn is_office(&self) -> bool {
        self.modality == Modality::Office
    }

    pub fn is_procedure(&self) -> bool {
        self.modality == Modality::Procedure
    }

    pub fn is_visit(&self) -> bool {
        self.modality != Modality::Procedure
    }
}

/// The parsed encounter list, with a pre-built index for the `mrn` field.
pub struct Encounters {
    els: Arc<Vec<Encounter>>,
    mrn_idx: BTreeMap<Mrn, Vec<usize>>,
}

impl Encounters {
    /// Load the original extract, dropping rows from excluded providers and
    /// failing fast on a malformed row.
    pub fn load_orig(path: impl AsRef<Path>, config: &AnalysisConfig) -> Result<Self> {
        let raw: Vec<EncounterRaw> = load_orig(path)?;
        let mut els = Vec::with_capacity(raw.len());
        let mut next_id = 0u32;
        for (idx, row) in raw.into_iter().enumerate() {
            if config.is_excluded_provider(&row.provider) {
                continue;
            }
            let enc = Encounter::from_raw(row, idx + 1, next_id, config)?;
            next_id += 1;
            els.push(enc);
        }
        Ok(Self::new(els))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(load(path)?))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result {
        save(&self.els, path)
    }

    pub fn encounters_for_patient(&self, mrn: Mrn) -> Vec<&Encounter> {
        match self.mrn_idx.get(&mrn) {
            Some(idxs) => idxs.iter().map(|idx| &self.els[*idx]).collect(),
            None => vec![],
        }
    }

    /// All distinct patient identifiers, ascending.
    pub fn mrns(&self) -> impl Iterator<Item = Mrn> + '_ {
        self.mrn_idx.keys().copied()
    }

    /// One group per patient, each sorted ascending by encounter date with
    /// encounter id as the tie-break. This sort is the precondition of the
    /// aggregation fold and happens nowhere else.
    pub fn patient_groups(&self) -> Vec<(Mrn, Vec<Encounter>)> {
        self.mrn_idx
            .iter()
            .map(|(mrn, idxs)| {
                let mut group: Vec<Encounter> =
                    idxs.iter().map(|idx| self.els[*idx].clone()).collect();
                group.sort_by_key(|enc| (enc.date, enc.encounter_id));
                (*mrn, group)
            })
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = Encounter> + '_ {
        self.els.iter().cloned()
    }

    pub fn filter(&self, f: impl Fn(&Encounter) -> bool) -> Self {
        Self::new(self.iter().filter(f).collect())
    }

    pub fn retain(&mut self, f: impl Fn(&Encounter) -> bool) {
        Arc::make_mut(&mut self.els).retain(f);
        self.rebuild_index();
    }

    fn new(els: Vec<Encounter>) -> Self {
        let mut this = Encounters {
            els: els.into(),
            mrn_idx: BTreeMap::new(),
        };
        this.rebuild_index();
        this
    }

    fn rebuild_index(&mut self) {
        self.mrn_idx.clear();
        for (idx, enc) in self.els.iter().enumerate() {
            self.mrn_idx.entry(enc.mrn).or_insert_with(Vec::new).push(idx);
        }
    }
}

impl Deref for Encounters {
    type Target = [Encounter];
    fn deref(&self) -> &Self::Target {
        &self.els
    }
}

impl<'a> IntoIterator for &'a Encounters {
    type IntoIter = <&'a [Encounter] as IntoIterator>::IntoIter;
    type Item = &'a Encounter;
    fn into_iter(self) -> Self::IntoIter {
        self.els.iter()
    }
}

impl FromIterator<Encounter> for Encounters {
    fn from_iter<T>(iter: T) -> Self
    where
        T: IntoIterator<Item = Encounter>,
    {
        Self::new(iter.into_iter().collect())
    }
}

#[derive(Debug, Clone, Deserialize)]
struct DemographicRaw {
    #[serde(rename = "Patient MRN")]
    mrn: String,
    #[serde(rename = "Race", deserialize_with = "optional_string")]
    race: Option<ArcStr>,
    #[serde(rename = "Ethnic Group", deserialize_with = "optional_string")]
    ethnic_group: Option<ArcStr>,
    #[serde(rename = "Zip Code", deserialize_with = "optional_string")]
    zip: Option<ArcStr>,
    #[serde(rename = "Marital Status", deserialize_with = "optional_string")]
    marital_status: Option<ArcStr>,
    #[serde(rename = "Preferred Language", deserialize_with = "optional_string")]
    language: Option<ArcStr>,
    #[serde(rename = "Gender Identity", deserialize_with = "optional_string")]
    gender_identity: Option<ArcStr>,
    #[serde(rename = "Legal Sex", deserialize_with = "optional_string")]
    legal_sex: Option<ArcStr>,
    #[serde(rename = "Age", deserialize_with = "optional_string")]
    age: Option<ArcStr>,
}

/// A row in the demographics dataset, as extracted.
///
/// Categorical fields stay raw here; normalization into the fixed category
/// sets happens during enrichment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Demographic {
    pub mrn: Mrn,
    pub race: Option<ArcStr>,
    pub ethnic_group: Option<ArcStr>,
    pub zip: Option<ArcStr>,
    pub marital_status: Option<ArcStr>,
    pub language: Option<ArcStr>,
    pub gender_identity: Option<ArcStr>,
    pub legal_sex: Option<ArcStr>,
    pub age: Option<u16>,
}

impl Demographic {
    fn from_raw(raw: DemographicRaw, row: usize) -> Result<Self, PipelineError> {
        let mrn = raw
            .mrn
            .trim()
            .parse::<Mrn>()
            .map_err(|_| PipelineError::MalformedRecord { row, field: "Patient MRN" })?;
        let age = match raw.age {
            Some(s) => Some(s.trim().parse::<u16>().map_err(|_| {
                PipelineError::MalformedRecord { row, field: "Age" }
            })?),
            None => None,
        };
        Ok(Demographic {
            mrn,
            race: raw.race,
            ethnic_group: raw.ethnic_group,
            zip: raw.zip,
            marital_status: raw.marital_status,
            language: raw.language,
            gender_identity: raw.gender_identity,
            legal_sex: raw.legal_sex,
            age,
        })
    }
}

/// The parsed demographics list, with a pre-built index for the `mrn` field.
pub struct Demographics {
    els: Vec<Demographic>,
    mrn_idx: BTreeMap<Mrn, usize>,
}

impl Demographics {
    pub fn load_orig(path: impl AsRef<Path>) -> Result<Self> {
        let raw: Vec<DemographicRaw> = load_orig(path)?;
        let els = raw
            .into_iter()
            .enumerate()
            .map(|(idx, row)| Demographic::from_raw(row, idx + 1))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(els))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(load(path)?))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result {
        save(&self.els, path)
    }

    pub fn find_by_mrn(&self, mrn: Mrn) -> Option<&Demographic> {
        let idx = self.mrn_idx.get(&mrn)?;
        self.els.get(*idx)
    }

    fn new(els: Vec<Demographic>) -> Self {
        let mut this = Self {
            els,
            mrn_idx: BTreeMap::new(),
        };
        this.rebuild_index();
        this
    }

    fn rebuild_index(&mut self) {
        self.mrn_idx = self
            .els
            .iter()
            .enumerate()
            .map(|(idx, el)| (el.mrn, idx))
            .collect();
    }
}

impl Deref for Demographics {
    type Target = [Demographic];
    fn deref(&self) -> &Self::Target {
        &self.els
    }
}

impl FromIterator<Demographic> for Demographics {
    fn from_iter<T>(iter: T) -> Self
    where
        T: IntoIterator<Item = Demographic>,
    {
        Self::new(iter.into_iter().collect())
    }
}

#[derive(Debug, Clone, Deserialize)]
struct SurgeryRaw {
    #[serde(rename = "Patient MRN")]
    mrn: String,
    #[serde(rename = "Surgery Date")]
    date: String,
    #[serde(rename = "Procedure Names")]
    procedure_names: String,
    #[serde(rename = "Procedure Codes")]
    procedure_codes: String,
    #[serde(rename = "Lead Surgeon")]
    surgeon: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurgicalProcedure {
    pub name: ArcStr,
    pub code: ArcStr,
}

/// One dated surgery event with its billed procedure set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Surgery {
    pub mrn: Mrn,
    pub date: NaiveDate,
    pub procedures: Vec<SurgicalProcedure>,
    pub surgeon: ArcStr,
}

impl Surgery {
    fn from_raw(raw: SurgeryRaw, row: usize) -> Result<Self, PipelineError> {
        let mrn = raw
            .mrn
            .trim()
            .parse::<Mrn>()
            .map_err(|_| PipelineError::MalformedRecord { row, field: "Patient MRN" })?;
        let date = parse_extract_date(raw.date.trim()).ok_or(PipelineError::MalformedRecord {
            row,
            field: "Surgery Date",
        })?;
        // Names and codes arrive as parallel semicolon-separated lists; a
        // ragged pair just leaves the trailing entries without codes.
        let names = raw.procedure_names.split(';').map(str::trim);
        let mut codes = raw.procedure_codes.split(';').map(str::trim);
        let procedures = names
            .filter(|name| !name.is_empty())
            .map(|name| SurgicalProcedure {
                name: name.into(),
                code: codes.next().unwrap_or("").into(),
            })
            .collect();
        Ok(Surgery {
            mrn,
            date,
            procedures,
            surgeon: raw.surgeon.into(),
        })
    }
}

/// The parsed surgery list, with a pre-built index for the `mrn` field.
///
/// A patient can have any number of surgery events.
pub struct Surgeries {
    els: Vec<Surgery>,
    mrn_idx: BTreeMap<Mrn, Vec<usize>>,
}

impl Surgeries {
    pub fn load_orig(path: impl AsRef<Path>) -> Result<Self> {
        let raw: Vec<SurgeryRaw> = load_orig(path)?;
        let els = raw
            .into_iter()
            .enumerate()
            .map(|(idx, row)| Surgery::from_raw(row, idx + 1))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(els))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(load(path)?))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result {
        save(&self.els, path)
    }

    pub fn surgeries_for_patient(&self, mrn: Mrn) -> Vec<&Surgery> {
        match self.mrn_idx.get(&mrn) {
            Some(idxs) => idxs.iter().map(|idx| &self.els[*idx]).collect(),
            None => vec![],
        }
    }

    /// The patient's first surgery on record, if any.
    pub fn earliest_for_patient(&self, mrn: Mrn) -> Option<&Surgery> {
        self.surgeries_for_patient(mrn)
            .into_iter()
            .min_by_key(|s| s.date)
    }

    fn new(els: Vec<Surgery>) -> Self {
        let mut this = Self {
            els,
            mrn_idx: BTreeMap::new(),
        };
        this.rebuild_index();
        this
    }

    fn rebuild_index(&mut self) {
        self.mrn_idx.clear();
        for (idx, el) in self.els.iter().enumerate() {
            self.mrn_idx.entry(el.mrn).or_insert_with(Vec::new).push(idx);
        }
    }
}

impl Deref for Surgeries {
    type Target = [Surgery];
    fn deref(&self) -> &Self::Target {
        &self.els
    }
}

impl FromIterator<Surgery> for Surgeries {
    fn from_iter<T>(iter: T) -> Self
    where
        T: IntoIterator<Item = Surgery>,
    {
        Self::new(iter.into_iter().collect())
    }
}

/// Load data into memory from the binary cache.
fn load<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<Vec<T>> {
    fn inner<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
        let path = cache_path(path);
        let reader = io::BufReader::new(fs::File::open(path)?);
        bincode::deserialize_from(reader).map_err(Into::into)
    }
    let path = path.as_ref();
    check_extension(path, "bin")?;

    inner(path).with_context(|| format!("unable to load data from \"{}\"", path.display()))
}

/// Save data to the binary cache.
fn save<T: Serialize>(contents: &[T], path: impl AsRef<Path>) -> Result {
    fn inner<T: Serialize>(contents: &[T], path: &Path) -> Result {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("could not create parent")?;
        }
        if util::path_exists(path)? {
            event!(
                Level::WARN,
                "overwriting existing file at \"{}\"",
                path.display()
            );
        }
        let mut out = io::BufWriter::new(fs::File::create(path)?);
        bincode::serialize_into(&mut out, contents)?;
        Ok(())
    }
    let path = path.as_ref();
    let path = cache_path(path);
    check_extension(&path, "bin")?;

    inner(contents, &path).with_context(|| format!("unable to save data to \"{}\"", path.display()))
}

/// Load rows from an original csv extract.
fn load_orig<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<Vec<T>> {
    let path = path.as_ref();
    let path = extract_path(path);
    csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(&path)?
        .into_deserialize()
        .collect::<Result<Vec<T>, _>>()
        .with_context(|| format!("while loading \"{}\"", path.display()))
}

/// Note: No protection from escaping the root directory.
pub fn extract_path(input: &Path) -> PathBuf {
    Path::new("data/extract").join(input)
}

/// Note: No protection from escaping the root directory.
pub fn cache_path(input: &Path) -> PathBuf {
    Path::new("data/cache").join(input)
}

pub fn check_extension(path: &Path, ext: &str) -> Result<()> {
    ensure!(
        matches!(path.extension(), Some(p) if p == ext),
        "filename should end with `.{}`",
        ext
    );
    Ok(())
}
