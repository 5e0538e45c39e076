//! Persistent flat lifecycle and session storage.
//!
//! The store owns the relational schema and every query against it. All flat
//! ids crossing this boundary are canonicalized first.

pub mod db;
pub mod flats;
pub mod sessions;

use std::error::Error;
use std::fmt;

use chrono::{DateTime, Utc};

/// Identity-store failures.
///
/// One variant per user-visible error code, plus internal variants that
/// surface as a generic HTTP 500 without detail.
#[derive(Debug)]
pub enum IdentityError {
    MissingFields,
    MissingFlatId,
    PinMustBe4Digits,
    InvalidPin,
    FlatNotFound,
    FlatDisabled,
    NoValidCode,
    InvalidCode,
    Banned { until: DateTime<Utc> },
    AdminRevokeRequired,
    PinNotSet,
    PasswordRequired,
    InvalidCredentials,
    Database(sqlx::Error),
    Hashing(String),
}

impl IdentityError {
    /// Wire error code for `{ok:false, error:"CODE"}` bodies.
    pub fn code(&self) -> &'static str {
        match self {
            IdentityError::MissingFields => "MISSING_FIELDS",
            IdentityError::MissingFlatId => "MISSING_FLAT_ID",
            IdentityError::PinMustBe4Digits => "PIN_MUST_BE_4_DIGITS",
            IdentityError::InvalidPin => "INVALID_PIN",
            IdentityError::FlatNotFound => "FLAT_NOT_FOUND",
            IdentityError::FlatDisabled => "FLAT_DISABLED",
            IdentityError::NoValidCode => "NO_VALID_CODE",
            IdentityError::InvalidCode => "INVALID_CODE",
            IdentityError::Banned { .. } => "BANNED",
            IdentityError::AdminRevokeRequired => "ADMIN_REVOKE_REQUIRED",
            IdentityError::PinNotSet => "PIN_NOT_SET",
            IdentityError::PasswordRequired => "PASSWORD_REQUIRED",
            IdentityError::InvalidCredentials => "INVALID_CREDENTIALS",
            IdentityError::Database(_) | IdentityError::Hashing(_) => "INTERNAL",
        }
    }

    /// Whether this is an internal failure rather than a client-caused one.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            IdentityError::Database(_) | IdentityError::Hashing(_)
        )
    }
}

impl fmt::Display for IdentityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityError::Database(e) => write!(f, "database error: {}", e),
            IdentityError::Hashing(msg) => write!(f, "hashing error: {}", msg),
            IdentityError::Banned { until } => write!(f, "BANNED until {}", until),
            other => f.write_str(other.code()),
        }
    }
}

impl Error for IdentityError {}

impl From<sqlx::Error> for IdentityError {
    fn from(e: sqlx::Error) -> Self {
        IdentityError::Database(e)
    }
}
