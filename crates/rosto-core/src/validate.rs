//! Metadata rules checked before an identity is persisted.

use crate::types::Metadata;
use regex::Regex;
use std::fmt;
use std::sync::OnceLock;
use thiserror::Error;

/// `local@domain.tld`, with at least a two-letter top-level label.
const EMAIL_PATTERN: &str = r"^[A-Za-z0-9._%+-]+@[A-Za-z0-9-]+(\.[A-Za-z0-9-]+)*\.[A-Za-z]{2,}$";

static EMAIL_RE: OnceLock<Regex> = OnceLock::new();

fn email_re() -> &'static Regex {
    EMAIL_RE.get_or_init(|| Regex::new(EMAIL_PATTERN).expect("EMAIL_PATTERN is a valid regex"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Name,
    Email,
    Telephone,
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Field::Name => "name",
            Field::Email => "email",
            Field::Telephone => "telephone",
        })
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{0} must not be empty")]
    EmptyField(Field),
    #[error("email {0:?} is not of the form local@domain.tld")]
    MalformedEmail(String),
}

/// Check every field and return the trimmed metadata.
///
/// Fields are checked in order name, email, telephone; the first failure is
/// reported.
pub fn validate_metadata(metadata: &Metadata) -> Result<Metadata, ValidationError> {
    let trimmed = metadata.trimmed();

    for (field, value) in [
        (Field::Name, &trimmed.name),
        (Field::Email, &trimmed.email),
        (Field::Telephone, &trimmed.telephone),
    ] {
        if value.is_empty() {
            return Err(ValidationError::EmptyField(field));
        }
    }

    if !email_re().is_match(&trimmed.email) {
        return Err(ValidationError::MalformedEmail(trimmed.email));
    }

    Ok(trimmed)
}

/// Form used to compare emails for uniqueness.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}
