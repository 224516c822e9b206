//! Record shapes shared by the consumer, enricher and publisher.
//!
//! An [`EnrichedOutcome`] is either fully enriched or failed. The state is an
//! enum, so an outcome carrying both attributes and an error cannot be built.
//! On the wire both states share one flat JSON object; conversion goes through
//! [`OutcomeWire`], which rejects mixed or half-populated objects on decode.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// The inbound name/surname/patronymic triple.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub surname: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patronymic: Option<String>,
}

/// Why an inbound payload could not be turned into an [`Identity`].
///
/// `partial` holds whichever fields were present as strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeFailure {
    pub partial: Identity,
    pub message: String,
}

impl Identity {
    /// Create an identity without a patronymic.
    pub fn new(name: impl Into<String>, surname: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            surname: surname.into(),
            patronymic: None,
        }
    }

    /// Set the patronymic.
    pub fn with_patronymic(mut self, patronymic: impl Into<String>) -> Self {
        self.patronymic = Some(patronymic.into());
        self
    }

    /// Decode an inbound message payload.
    ///
    /// `None` is a tombstone and always fails. The payload must be a JSON
    /// object; name and surname must be non-empty and an empty patronymic
    /// is treated as absent.
    pub fn decode(payload: Option<&[u8]>) -> Result<Self, DecodeFailure> {
        let bytes = payload.ok_or_else(|| DecodeFailure {
            partial: Identity::default(),
            message: "message has no payload".to_string(),
        })?;

        let value: Value = serde_json::from_slice(bytes).map_err(|e| DecodeFailure {
            partial: Identity::default(),
            message: e.to_string(),
        })?;

        // Derived Deserialize would also accept a positional array
        let map = match value {
            Value::Object(map) => map,
            other => {
                return Err(DecodeFailure {
                    partial: Identity::default(),
                    message: format!("expected a JSON object, got {}", json_type(&other)),
                })
            }
        };

        let partial = Self::salvage(&map);
        let mut identity: Identity = serde_json::from_value(Value::Object(map))
            .map_err(|e| DecodeFailure {
                partial,
                message: e.to_string(),
            })?;

        if identity.patronymic.as_deref() == Some("") {
            identity.patronymic = None;
        }

        let missing = match (identity.name.is_empty(), identity.surname.is_empty()) {
            (true, true) => Some("fields `name` and `surname` are required"),
            (true, false) => Some("field `name` is required"),
            (false, true) => Some("field `surname` is required"),
            (false, false) => None,
        };

        match missing {
            Some(message) => Err(DecodeFailure {
                partial: identity,
                message: message.to_string(),
            }),
            None => Ok(identity),
        }
    }

    /// Pull out string fields from a payload that failed strict decoding.
    fn salvage(map: &Map<String, Value>) -> Identity {
        let field = |key: &str| map.get(key).and_then(Value::as_str).map(str::to_string);

        Identity {
            name: field("name").unwrap_or_default(),
            surname: field("surname").unwrap_or_default(),
            patronymic: field("patronymic").filter(|p| !p.is_empty()),
        }
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// The three derived attributes, always present together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attributes {
    pub age: u32,
    pub gender: String,
    pub nationality: String,
}

/// Error kinds carried in the `error` field of failed records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Inbound payload is not well-formed identity JSON
    InvalidMessage,
    /// One of the lookups failed
    EnrichmentFailed,
    /// The broker did not accept the outcome (dead-letter records only)
    DeliveryError,
}

impl ErrorKind {
    /// Wire name of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidMessage => "invalid_message",
            ErrorKind::EnrichmentFailed => "enrichment_failed",
            ErrorKind::DeliveryError => "delivery_error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of an outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutcomeState {
    Enriched(Attributes),
    Failed { kind: ErrorKind, message: String },
}

/// The outbound record derived from one inbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "OutcomeWire", try_from = "OutcomeWire")]
pub struct EnrichedOutcome {
    identity: Identity,
    state: OutcomeState,
}

impl EnrichedOutcome {
    /// A fully enriched outcome.
    pub fn enriched(identity: Identity, attributes: Attributes) -> Self {
        Self {
            identity,
            state: OutcomeState::Enriched(attributes),
        }
    }

    /// A failed outcome for a payload that could not be decoded.
    pub fn invalid_message(failure: DecodeFailure) -> Self {
        Self {
            identity: failure.partial,
            state: OutcomeState::Failed {
                kind: ErrorKind::InvalidMessage,
                message: failure.message,
            },
        }
    }

    /// A failed outcome for an identity whose lookups did not all succeed.
    pub fn enrichment_failed(identity: Identity, message: impl Into<String>) -> Self {
        Self {
            identity,
            state: OutcomeState::Failed {
                kind: ErrorKind::EnrichmentFailed,
                message: message.into(),
            },
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn state(&self) -> &OutcomeState {
        &self.state
    }

    /// Attributes, when enriched.
    pub fn attributes(&self) -> Option<&Attributes> {
        match &self.state {
            OutcomeState::Enriched(attributes) => Some(attributes),
            OutcomeState::Failed { .. } => None,
        }
    }

    /// Error kind, when failed.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match &self.state {
            OutcomeState::Enriched(_) => None,
            OutcomeState::Failed { kind, .. } => Some(*kind),
        }
    }

    /// Error message, when failed.
    pub fn error_message(&self) -> Option<&str> {
        match &self.state {
            OutcomeState::Enriched(_) => None,
            OutcomeState::Failed { message, .. } => Some(message),
        }
    }

    pub fn is_enriched(&self) -> bool {
        matches!(self.state, OutcomeState::Enriched(_))
    }

    /// Label used for metrics and logs: `enriched` or the error kind.
    pub fn result_label(&self) -> &'static str {
        match &self.state {
            OutcomeState::Enriched(_) => "enriched",
            OutcomeState::Failed { kind, .. } => kind.as_str(),
        }
    }

    /// Encode as the JSON record published to the output topic.
    pub fn to_json_bytes(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Flat JSON representation of an [`EnrichedOutcome`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutcomeWire {
    #[serde(flatten)]
    identity: Identity,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    age: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    gender: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    nationality: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<ErrorKind>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    error_message: Option<String>,
}

impl From<EnrichedOutcome> for OutcomeWire {
    fn from(outcome: EnrichedOutcome) -> Self {
        let mut wire = OutcomeWire {
            identity: outcome.identity,
            ..Default::default()
        };
        match outcome.state {
            OutcomeState::Enriched(attributes) => {
                // 0 is a real age, unlike empty strings
                wire.age = Some(attributes.age);
                wire.gender = Some(attributes.gender).filter(|g| !g.is_empty());
                wire.nationality = Some(attributes.nationality).filter(|n| !n.is_empty());
            }
            OutcomeState::Failed { kind, message } => {
                wire.error = Some(kind);
                wire.error_message = Some(message).filter(|m| !m.is_empty());
            }
        }
        wire
    }
}

impl TryFrom<OutcomeWire> for EnrichedOutcome {
    type Error = String;

    fn try_from(wire: OutcomeWire) -> Result<Self, Self::Error> {
        let has_attributes =
            wire.age.is_some() || wire.gender.is_some() || wire.nationality.is_some();

        let state = match (wire.error, has_attributes) {
            (Some(_), true) => {
                return Err("record carries both an error and enrichment attributes".into())
            }
            (Some(kind), false) => OutcomeState::Failed {
                kind,
                message: wire.error_message.unwrap_or_default(),
            },
            (None, _) => {
                if wire.error_message.is_some() {
                    return Err("record has `error_message` without `error`".into());
                }
                let age = wire.age.ok_or("enriched record is missing `age`")?;
                OutcomeState::Enriched(Attributes {
                    age,
                    gender: wire.gender.unwrap_or_default(),
                    nationality: wire.nationality.unwrap_or_default(),
                })
            }
        };

        Ok(EnrichedOutcome {
            identity: wire.identity,
            state,
        })
    }
}
