//! Remote attribute lookups.
//!
//! A lookup resolves one derived attribute (age, gender or nationality) for a
//! first name. The three services are independent and stateless; the
//! [`AttributeLookup`] trait is the seam the enricher depends on.

mod http;

pub use http::HttpLookupClient;

use crate::error::LookupError;
use async_trait::async_trait;
use std::fmt;

/// Which attribute to look up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Attribute {
    Age,
    Gender,
    Nationality,
}

impl Attribute {
    /// Lookup order used by the sequential strategy.
    pub const ALL: [Attribute; 3] = [Attribute::Age, Attribute::Gender, Attribute::Nationality];

    /// JSON field name in the service response, also used as a label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Attribute::Age => "age",
            Attribute::Gender => "gender",
            Attribute::Nationality => "nationality",
        }
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resolved attribute value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeValue {
    Age(u32),
    Gender(String),
    Nationality(String),
}

impl AttributeValue {
    pub fn attribute(&self) -> Attribute {
        match self {
            AttributeValue::Age(_) => Attribute::Age,
            AttributeValue::Gender(_) => Attribute::Gender,
            AttributeValue::Nationality(_) => Attribute::Nationality,
        }
    }

    pub fn into_age(self) -> Result<u32, LookupError> {
        match self {
            AttributeValue::Age(age) => Ok(age),
            other => Err(mismatch(Attribute::Age, &other)),
        }
    }

    pub fn into_gender(self) -> Result<String, LookupError> {
        match self {
            AttributeValue::Gender(gender) => Ok(gender),
            other => Err(mismatch(Attribute::Gender, &other)),
        }
    }

    pub fn into_nationality(self) -> Result<String, LookupError> {
        match self {
            AttributeValue::Nationality(nationality) => Ok(nationality),
            other => Err(mismatch(Attribute::Nationality, &other)),
        }
    }
}

fn mismatch(expected: Attribute, got: &AttributeValue) -> LookupError {
    LookupError::Decode(format!(
        "expected {} value, got {}",
        expected,
        got.attribute()
    ))
}

/// Result of a single attribute fetch.
pub type LookupResult = Result<AttributeValue, LookupError>;

/// A source of attribute values.
#[async_trait]
pub trait AttributeLookup: Send + Sync {
    /// Resolve `attribute` for `name`.
    async fn fetch(&self, attribute: Attribute, name: &str) -> LookupResult;
}
