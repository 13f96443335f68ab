//! Phone number normalization
//!
//! Normalization exists only to build stable cache keys and routing prefixes.
//! It does not try to validate numbering plans.

use lazy_static::lazy_static;
use regex::Regex;
use std::path::Path;

use crate::error::{Error, Result};

lazy_static! {
    static ref E164_RE: Regex = Regex::new(r"^\+[0-9]{10,15}$").expect("valid E.164 pattern");
}

/// Normalize a raw phone string to `+<digits>` form.
///
/// Russian domestic formats are rewritten to the `+7` country code:
/// `8XXXXXXXXXX` and `7XXXXXXXXXX` (11 digits) and bare 10-digit numbers not
/// starting with `7`. Everything else only gains a leading `+`.
pub fn normalize(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '+')
        .collect();

    if cleaned.starts_with('+') {
        return cleaned;
    }

    match (cleaned.len(), cleaned.chars().next()) {
        (11, Some('8')) => format!("+7{}", &cleaned[1..]),
        (11, Some('7')) => format!("+{cleaned}"),
        (10, Some(first)) if first != '7' => format!("+7{cleaned}"),
        _ => format!("+{cleaned}"),
    }
}

/// Normalize and check the result looks like an international number.
pub fn normalize_strict(raw: &str) -> Result<String> {
    let normalized = normalize(raw);
    if E164_RE.is_match(&normalized) {
        Ok(normalized)
    } else {
        Err(Error::invalid_input(format!(
            "invalid phone number '{raw}' (normalized to '{normalized}')"
        )))
    }
}

/// Read one raw number per line, skipping blank lines.
pub fn read_phone_list(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect())
}
