//! Core telephony domain types used across ACM services

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MsisdnError {
    #[error("MSISDN is empty")]
    Empty,
    #[error("MSISDN contains invalid characters: {0}")]
    InvalidCharacters(String),
    #[error("MSISDN has invalid length or prefix: {0}")]
    InvalidFormat(String),
}

/// A Nigerian mobile subscriber number in canonical `+234XXXXXXXXXX` form.
///
/// Accepted input forms are `0XXXXXXXXXX`, `234XXXXXXXXXX` and
/// `+234XXXXXXXXXX`; whitespace and dashes are stripped before parsing.
/// Anything else is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Msisdn(String);

impl Msisdn {
    pub fn parse(input: &str) -> Result<Self, MsisdnError> {
        let cleaned: String = input
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '-')
            .collect();
        if cleaned.is_empty() {
            return Err(MsisdnError::Empty);
        }

        let (plus, digits) = match cleaned.strip_prefix('+') {
            Some(rest) => (true, rest),
            None => (false, cleaned.as_str()),
        };
        if !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(MsisdnError::InvalidCharacters(input.to_string()));
        }

        let national = if plus || digits.starts_with("234") {
            let rest = digits
                .strip_prefix("234")
                .ok_or_else(|| MsisdnError::InvalidFormat(input.to_string()))?;
            rest.to_string()
        } else if let Some(rest) = digits.strip_prefix('0') {
            rest.to_string()
        } else {
            return Err(MsisdnError::InvalidFormat(input.to_string()));
        };

        // National significant number: 10 digits, mobile ranges 7x/8x/9x.
        if national.len() != 10 {
            return Err(MsisdnError::InvalidFormat(input.to_string()));
        }
        let mut chars = national.chars();
        let first = chars.next().unwrap();
        let second = chars.next().unwrap();
        if !matches!(first, '7' | '8' | '9') || !matches!(second, '0' | '1') {
            return Err(MsisdnError::InvalidFormat(input.to_string()));
        }

        Ok(Self(format!("+234{national}")))
    }

    /// Canonical `+234XXXXXXXXXX` representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Local `0XXXXXXXXXX` representation.
    pub fn local(&self) -> String {
        format!("0{}", &self.0[4..])
    }

    /// Leading digits of the national number, used for prefix fingerprints.
    pub fn prefix(&self, len: usize) -> &str {
        let national = &self.0[4..];
        &national[..len.min(national.len())]
    }

    pub fn operator(&self) -> Operator {
        Operator::from_msisdn(&self.0)
    }
}

impl fmt::Display for Msisdn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for Msisdn {
    type Error = MsisdnError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Msisdn::parse(&value)
    }
}

impl From<Msisdn> for String {
    fn from(value: Msisdn) -> Self {
        value.0
    }
}

/// Nigerian mobile network operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    Mtn,
    Airtel,
    Glo,
    NineMobile,
    Unknown,
}

impl Operator {
    /// Detect the home operator from the number's allocation prefix.
    ///
    /// This is the pre-porting allocation; the MNP clearinghouse is
    /// authoritative for the current host network.
    pub fn from_msisdn(msisdn: &str) -> Self {
        let digits: String = msisdn.chars().filter(|c| c.is_ascii_digit()).collect();
        let national = if let Some(rest) = digits.strip_prefix("234") {
            rest
        } else if let Some(rest) = digits.strip_prefix('0') {
            rest
        } else {
            &digits
        };
        if national.len() < 3 {
            return Self::Unknown;
        }

        match &national[..3] {
            "803" | "806" | "703" | "706" | "813" | "816" | "810" | "814" | "903" | "906"
            | "913" | "916" => Self::Mtn,
            "805" | "807" | "705" | "815" | "811" | "905" | "915" => Self::Glo,
            "802" | "808" | "708" | "812" | "701" | "902" | "901" | "907" | "912" => Self::Airtel,
            "809" | "817" | "818" | "908" | "909" => Self::NineMobile,
            _ => Self::Unknown,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Mtn => "MTN",
            Self::Airtel => "Airtel",
            Self::Glo => "Glo",
            Self::NineMobile => "9mobile",
            Self::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
