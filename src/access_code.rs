//! Session access codes
//!
//! A session is addressed by a four-digit access code. Codes are normally
//! issued by the match-configuration collaborator; [`AccessCode::generate`]
//! is offered for callers that need a fresh one.

use std::{fmt::Display, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// Number of distinct access codes (`0000` through `9999`)
const CODE_SPACE: u16 = 10_000;
/// Number of digits in the textual form
const CODE_DIGITS: usize = 4;

/// The identifier of a live session
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AccessCode(u16);

/// Errors produced while parsing an access code
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// The code does not have exactly four characters
    #[error("access code must have {CODE_DIGITS} digits")]
    Length,
    /// The code contains something other than ASCII digits
    #[error("access code must only contain digits")]
    NotDigits,
}

impl AccessCode {
    /// Creates a random access code
    pub fn generate() -> Self {
        Self(fastrand::u16(0..CODE_SPACE))
    }

    /// Creates an access code from its numeric value, if in range
    pub fn new(value: u16) -> Option<Self> {
        (value < CODE_SPACE).then_some(Self(value))
    }
}

impl Display for AccessCode {
    /// Formats the code as four zero-padded digits
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04}", self.0)
    }
}

impl FromStr for AccessCode {
    type Err = ParseError;

    /// Parses a four-digit access code
    ///
    /// # Errors
    ///
    /// Returns a [`ParseError`] if the string is not exactly four ASCII digits.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != CODE_DIGITS {
            return Err(ParseError::Length);
        }
        if !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParseError::NotDigits);
        }
        s.parse::<u16>()
            .map(Self)
            .map_err(|_| ParseError::NotDigits)
    }
}

impl Serialize for AccessCode {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for AccessCode {
    fn deserialize<D>(deserializer: D) -> Result<AccessCode, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        AccessCode::from_str(&s).map_err(serde::de::Error::custom)
    }
}
