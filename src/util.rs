use crate::ArcStr;
use chrono::NaiveDate;
use serde::{de, Deserialize, Deserializer};
use std::{fs, io, path::Path};

/// Converts a not found error to Ok(false)
pub fn path_exists(path: &Path) -> io::Result<bool> {
    match fs::metadata(path) {
        Ok(_) => Ok(true),
        Err(e) if matches!(e.kind(), io::ErrorKind::NotFound) => Ok(false),
        Err(e) => Err(e),
    }
}

// Helpers for serde to parse fields with quirks.

/// Parse a date as written by the reporting database.
///
/// Extracts arrive either ISO (`2021-01-05`) or US-style (`01/05/2021`)
/// depending on which tool wrote the sheet, so both are accepted.
pub fn parse_extract_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(s, "%m/%d/%Y"))
        .ok()
}

/// Parse a date, mapping the empty string, "null" and "NA" to `None`.
pub fn opt_extract_date<'de, D>(d: D) -> Result<Option<NaiveDate>, D::Error>
where
    D: Deserializer<'de>,
{
    let s: &str = Deserialize::deserialize(d)?;
    if s.is_empty() || s.eq_ignore_ascii_case("null") || s.eq_ignore_ascii_case("na") {
        return Ok(None);
    }
    match parse_extract_date(s) {
        Some(date) => Ok(Some(date)),
        None => Err(de::Error::custom(format!("unparseable date \"{}\"", s))),
    }
}

/// Parse a string, but map "null" to `None` (in addition to the default "" -> None mapping)
pub fn optional_string<'de, D>(d: D) -> Result<Option<ArcStr>, D::Error>
where
    D: Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(d)?;
    if s.eq_ignore_ascii_case("null") || s.is_empty() {
        Ok(None)
    } else {
        Ok(Some(s.into()))
    }
}

/// Parse the "Is New Patient Visit Type?" style flags ("Yes"/"No", "Y"/"N", "1"/"0").
pub fn yes_no<'de, D>(d: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let s: &str = Deserialize::deserialize(d)?;
    match s.trim() {
        "Yes" | "yes" | "YES" | "Y" | "y" | "1" | "TRUE" | "True" | "true" => Ok(true),
        "No" | "no" | "NO" | "N" | "n" | "0" | "FALSE" | "False" | "false" | "" => Ok(false),
        other => Err(de::Error::custom(format!(
            "expected a yes/no flag, got \"{}\"",
            other
        ))),
    }
}

pub fn header(header: &str) {
    let len = header.len();
    print!("\n{}\n", header);
    for _ in 0..len {
        print!("=");
    }
    println!("\n")
}

#[cfg(test)]
mod test {
    use super::parse_extract_date;
    use chrono::NaiveDate;

    #[test]
    fn dates_both_formats() {
        let expected = NaiveDate::from_ymd_opt(2021, 1, 5).unwrap();
        assert_eq!(parse_extract_date("2021-01-05"), Some(expected));
        assert_eq!(parse_extract_date("01/05/2021"), Some(expected));
        assert_eq!(parse_extract_date("not a date"), None);
    }
}
