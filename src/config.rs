//! The fixed lookup tables driving classification.
//!
//! Everything here is loaded once (from TOML, or the built-in defaults) and
//! passed by reference into the components that need it. Nothing is global
//! and nothing mutates after construction.

use crate::{ArcStr, Modality, Result};
use anyhow::Context;
use serde::Deserialize;
use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::Path,
};

/// Raw visit-type labels that map to the virtual modality.
const VIRTUAL_VISIT_TYPES: &[&str] = &[
    "NEW VIRTUAL VISIT",
    "VIRTUAL VISIT",
    "TELEMED HOME",
    "TELEMEDICINE",
    "VIRTUAL VIDEO VISIT",
];

/// Raw visit-type labels that map to the phone modality.
const PHONE_VISIT_TYPES: &[&str] = &["PHONE VISIT", "NEW PHONE VISIT", "TELEPHONE VISIT"];

/// Visit category labels that mark a procedure row.
const PROCEDURE_CATEGORIES: &[&str] = &["Procedure", "Surgical Procedure"];

/// Mid-level providers removed before analysis; the comparison is between
/// physician visits only.
const EXCLUDED_PROVIDERS: &[&str] = &["URO RN", "SCULL, DORIAN", "KEESLAR, MATTHEW", "OLSON, ASHLEY J"];

/// Diagnosis description -> coarse category, lowercased keyword matching.
const DX_CATEGORIES: &[(&str, &str)] = &[
    ("prostate cancer", "Oncology"),
    ("neoplasm", "Oncology"),
    ("elevated psa", "Oncology"),
    ("elevated prostate specific antigen", "Oncology"),
    ("bladder cancer", "Oncology"),
    ("renal mass", "Oncology"),
    ("calculus", "Stones"),
    ("kidney stone", "Stones"),
    ("ureteral stone", "Stones"),
    ("nephrolithiasis", "Stones"),
    ("urolithiasis", "Stones"),
    ("benign prostatic hyperplasia", "BPH/LUTS"),
    ("enlarged prostate", "BPH/LUTS"),
    ("urinary frequency", "BPH/LUTS"),
    ("nocturia", "BPH/LUTS"),
    ("retention of urine", "BPH/LUTS"),
    ("incontinence", "Incontinence"),
    ("overactive bladder", "Incontinence"),
    ("erectile dysfunction", "Sexual Medicine"),
    ("hypogonadism", "Sexual Medicine"),
    ("low testosterone", "Sexual Medicine"),
    ("peyronie", "Sexual Medicine"),
    ("infertility", "Infertility"),
    ("vasectomy", "Infertility"),
    ("hematuria", "Hematuria"),
    ("urinary tract infection", "Infection"),
    ("cystitis", "Infection"),
    ("prostatitis", "Infection"),
    ("epididymitis", "Infection"),
];

/// Diagnosis keywords whose categorization is ambiguous enough to need a
/// manual look before publication.
const DX_NEEDS_REVIEW: &[&str] = &["unspecified", "other specified", "encounter for"];

pub const DX_OTHER: &str = "Other";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default)]
    virtual_visit_types: Vec<String>,
    #[serde(default)]
    phone_visit_types: Vec<String>,
    #[serde(default)]
    procedure_categories: Vec<String>,
    #[serde(default)]
    excluded_providers: Vec<String>,
    #[serde(default)]
    dx_categories: BTreeMap<String, String>,
    #[serde(default)]
    dx_needs_review: Vec<String>,
}

/// The classification rules for one analysis run.
#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    virtual_visit_types: BTreeSet<String>,
    phone_visit_types: BTreeSet<String>,
    procedure_categories: BTreeSet<String>,
    excluded_providers: BTreeSet<String>,
    /// Keyword (lowercase) -> category name. Checked in order of descending
    /// keyword length so the most specific match wins.
    dx_categories: Vec<(String, ArcStr)>,
    dx_needs_review: Vec<String>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self::from_parts(
            VIRTUAL_VISIT_TYPES.iter().map(|s| s.to_string()).collect(),
            PHONE_VISIT_TYPES.iter().map(|s| s.to_string()).collect(),
            PROCEDURE_CATEGORIES.iter().map(|s| s.to_string()).collect(),
            EXCLUDED_PROVIDERS.iter().map(|s| s.to_string()).collect(),
            DX_CATEGORIES
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            DX_NEEDS_REVIEW.iter().map(|s| s.to_string()).collect(),
        )
    }
}

impl AnalysisConfig {
    /// Load overrides from a TOML file. Any section left empty falls back to
    /// the built-in table.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("unable to read config \"{}\"", path.display()))?;
        Self::from_toml(&text)
            .with_context(|| format!("unable to parse config \"{}\"", path.display()))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(text)?;
        let defaults = Self::default();
        Ok(Self::from_parts(
            if file.virtual_visit_types.is_empty() {
                defaults.virtual_visit_types.into_iter().collect()
            } else {
                file.virtual_visit_types
            },
            if file.phone_visit_types.is_empty() {
                defaults.phone_visit_types.into_iter().collect()
            } else {
                file.phone_visit_types
            },
            if file.procedure_categories.is_empty() {
                defaults.procedure_categories.into_iter().collect()
            } else {
                file.procedure_categories
            },
            if file.excluded_providers.is_empty() {
                defaults.excluded_providers.into_iter().collect()
            } else {
                file.excluded_providers
            },
            if file.dx_categories.is_empty() {
                defaults
                    .dx_categories
                    .into_iter()
                    .map(|(k, v)| (k, v.to_string()))
                    .collect()
            } else {
                file.dx_categories.into_iter().collect()
            },
            if file.dx_needs_review.is_empty() {
                defaults.dx_needs_review
            } else {
                file.dx_needs_review
            },
        ))
    }

    fn from_parts(
        virtual_visit_types: Vec<String>,
        phone_visit_types: Vec<String>,
        procedure_categories: Vec<String>,
        excluded_providers: Vec<String>,
        dx_categories: Vec<(String, String)>,
        dx_needs_review: Vec<String>,
    ) -> Self {
        let mut dx_categories: Vec<(String, ArcStr)> = dx_categories
            .into_iter()
            .map(|(k, v)| (k.to_lowercase(), ArcStr::from(v)))
            .collect();
        // longest keyword first, so "elevated prostate specific antigen"
        // beats "prostate".
        dx_categories.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));
        AnalysisConfig {
            virtual_visit_types: normalize_set(virtual_visit_types),
            phone_visit_types: normalize_set(phone_visit_types),
            procedure_categories: normalize_set(procedure_categories),
            excluded_providers: normalize_set(excluded_providers),
            dx_categories,
            dx_needs_review: dx_needs_review
                .into_iter()
                .map(|s| s.to_lowercase())
                .collect(),
        }
    }

    /// Modality of a row, from its visit category and raw visit-type label.
    ///
    /// A procedure-category row is a procedure regardless of delivery
    /// channel. Office is the fall-through for visit rows: anything not in
    /// the virtual or phone label sets.
    pub fn classify_visit(&self, visit_category: &str, visit_type: &str) -> Modality {
        if self.procedure_categories.contains(&normalize(visit_category)) {
            return Modality::Procedure;
        }
        let visit_type = normalize(visit_type);
        if self.virtual_visit_types.contains(&visit_type) {
            Modality::Virtual
        } else if self.phone_visit_types.contains(&visit_type) {
            Modality::Phone
        } else {
            Modality::Office
        }
    }

    pub fn is_excluded_provider(&self, provider: &str) -> bool {
        self.excluded_providers.contains(&normalize(provider))
    }

    /// Category for a diagnosis description, plus whether it should be
    /// flagged for manual review. Unmatched descriptions land in
    /// [`DX_OTHER`].
    pub fn dx_category(&self, icd_name: &str) -> (ArcStr, bool) {
        let name = icd_name.to_lowercase();
        let needs_review = self.dx_needs_review.iter().any(|kw| name.contains(kw));
        for (keyword, category) in &self.dx_categories {
            if name.contains(keyword.as_str()) {
                return (category.clone(), needs_review);
            }
        }
        (ArcStr::from(DX_OTHER), needs_review)
    }
}

fn normalize(s: &str) -> String {
    s.trim().to_uppercase()
}

fn normalize_set(els: Vec<String>) -> BTreeSet<String> {
    els.into_iter().map(|s| normalize(&s)).collect()
}

#[cfg(test)]
mod test {
    use super::AnalysisConfig;
    use crate::Modality;

    #[test]
    fn visit_classification() {
        let config = AnalysisConfig::default();
        assert_eq!(
            config.classify_visit("Office Visit", "NEW VIRTUAL VISIT"),
            Modality::Virtual
        );
        assert_eq!(
            config.classify_visit("Office Visit", "PHONE VISIT"),
            Modality::Phone
        );
        assert_eq!(
            config.classify_visit("Office Visit", "RETURN PATIENT VISIT"),
            Modality::Office
        );
        // procedures win over the channel label
        assert_eq!(
            config.classify_visit("Procedure", "TELEMED HOME"),
            Modality::Procedure
        );
    }

    #[test]
    fn dx_categories_longest_match() {
        let config = AnalysisConfig::default();
        let (category, _) = config.dx_category("Elevated prostate specific antigen [PSA]");
        assert_eq!(&*category, "Oncology");
        let (category, review) = config.dx_category("Unspecified renal colic");
        assert_eq!(&*category, "Other");
        assert!(review);
    }

    #[test]
    fn toml_overrides() {
        let config = AnalysisConfig::from_toml(
            r#"
            virtual_visit_types = ["VIDEO VISIT"]
            "#,
        )
        .unwrap();
        assert_eq!(
            config.classify_visit("Office Visit", "video visit"),
            Modality::Virtual
        );
        // unlisted sections keep the defaults
        assert_eq!(
            config.classify_visit("Office Visit", "PHONE VISIT"),
            Modality::Phone
        );
    }
}
