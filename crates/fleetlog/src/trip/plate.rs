//! License plate and description validation.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Legacy (`ABC1234`) and Mercosur (`ABC1D23`) plate layouts, with an
/// optional dash or space between the letters and the rest.
const PLATE_PATTERN: &str = r"^([A-Z]{3})[- ]?([0-9][0-9A-Z][0-9]{2})$";

fn plate_regex() -> &'static Regex {
    static PLATE: OnceLock<Regex> = OnceLock::new();
    PLATE.get_or_init(|| Regex::new(PLATE_PATTERN).expect("plate pattern is valid"))
}

/// A normalized, validated vehicle license plate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LicensePlate(String);

impl LicensePlate {
    /// Normalize and validate a plate.
    ///
    /// Surrounding whitespace is trimmed and letters are upper-cased. A single
    /// dash or space after the three leading letters is accepted and dropped.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the plate does not match a known layout.
    pub fn parse(input: &str) -> Result<Self> {
        let upper = input.trim().to_uppercase();
        match plate_regex().captures(&upper) {
            Some(caps) => Ok(Self(format!("{}{}", &caps[1], &caps[2]))),
            None => Err(Error::validation(
                "license_plate",
                format!("'{}' is not a valid plate (expected e.g. ABC1234)", input.trim()),
            )),
        }
    }

    /// The normalized plate text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LicensePlate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for LicensePlate {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<LicensePlate> for String {
    fn from(plate: LicensePlate) -> Self {
        plate.0
    }
}

/// Validate a trip description, returning it trimmed.
///
/// # Errors
///
/// Returns a validation error if the description is empty or whitespace-only.
pub fn validate_description(input: &str) -> Result<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(Error::validation(
            "description",
            "a description of the trip purpose is required",
        ));
    }
    Ok(trimmed.to_string())
}
