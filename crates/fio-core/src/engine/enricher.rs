//! Enrichment orchestration for a single identity.
//!
//! The three lookups are joined into an [`Enrichment`]: either every
//! attribute resolved, or the first failure in canonical order. Values
//! resolved before a failure are dropped with the partial state, so a failed
//! record never carries attributes.

use crate::config::LookupStrategy;
use crate::error::LookupError;
use crate::lookup::{Attribute, AttributeLookup, LookupResult};
use crate::model::{Attributes, EnrichedOutcome, Identity};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// A failed lookup and the attribute it was for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupFailure {
    pub attribute: Attribute,
    pub error: LookupError,
}

impl fmt::Display for LookupFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Failed to get {}: {}", self.attribute, self.error)
    }
}

/// Joined result of the three lookups for one name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Enrichment {
    AllSucceeded(Attributes),
    AnyFailed(LookupFailure),
}

/// Runs the lookups for a record and builds its outcome.
#[derive(Clone)]
pub struct Enricher {
    lookup: Arc<dyn AttributeLookup>,
    strategy: LookupStrategy,
}

impl Enricher {
    /// Create an enricher over a lookup source.
    pub fn new(lookup: Arc<dyn AttributeLookup>, strategy: LookupStrategy) -> Self {
        Self { lookup, strategy }
    }

    pub fn strategy(&self) -> LookupStrategy {
        self.strategy
    }

    /// Enrich an identity into an enriched or `enrichment_failed` outcome.
    pub async fn enrich(&self, identity: Identity) -> EnrichedOutcome {
        let enrichment = self.resolve(&identity.name).await;
        Self::into_outcome(identity, enrichment)
    }

    /// Build the outcome for an identity from its joined lookups.
    pub fn into_outcome(identity: Identity, enrichment: Enrichment) -> EnrichedOutcome {
        match enrichment {
            Enrichment::AllSucceeded(attributes) => EnrichedOutcome::enriched(identity, attributes),
            Enrichment::AnyFailed(failure) => {
                EnrichedOutcome::enrichment_failed(identity, failure.to_string())
            }
        }
    }

    /// Resolve all three attributes for `name`.
    pub async fn resolve(&self, name: &str) -> Enrichment {
        let joined = match self.strategy {
            LookupStrategy::Sequential => self.resolve_sequential(name).await,
            LookupStrategy::Concurrent => self.resolve_concurrent(name).await,
        };

        match joined {
            Ok(attributes) => Enrichment::AllSucceeded(attributes),
            Err(failure) => {
                debug!(name = %name, attribute = %failure.attribute, error = %failure.error, "Enrichment failed");
                Enrichment::AnyFailed(failure)
            }
        }
    }

    async fn resolve_sequential(&self, name: &str) -> Result<Attributes, LookupFailure> {
        let age = self
            .fetch(Attribute::Age, name)
            .await
            .and_then(|v| v.into_age())
            .map_err(|error| failed(Attribute::Age, error))?;

        let gender = self
            .fetch(Attribute::Gender, name)
            .await
            .and_then(|v| v.into_gender())
            .map_err(|error| failed(Attribute::Gender, error))?;

        let nationality = self
            .fetch(Attribute::Nationality, name)
            .await
            .and_then(|v| v.into_nationality())
            .map_err(|error| failed(Attribute::Nationality, error))?;

        Ok(Attributes {
            age,
            gender,
            nationality,
        })
    }

    async fn resolve_concurrent(&self, name: &str) -> Result<Attributes, LookupFailure> {
        let (age, gender, nationality) = tokio::join!(
            self.fetch(Attribute::Age, name),
            self.fetch(Attribute::Gender, name),
            self.fetch(Attribute::Nationality, name),
        );

        // Checked in canonical order so the reported failure is deterministic.
        Ok(Attributes {
            age: age
                .and_then(|v| v.into_age())
                .map_err(|error| failed(Attribute::Age, error))?,
            gender: gender
                .and_then(|v| v.into_gender())
                .map_err(|error| failed(Attribute::Gender, error))?,
            nationality: nationality
                .and_then(|v| v.into_nationality())
                .map_err(|error| failed(Attribute::Nationality, error))?,
        })
    }

    async fn fetch(&self, attribute: Attribute, name: &str) -> LookupResult {
        self.lookup.fetch(attribute, name).await
    }
}

fn failed(attribute: Attribute, error: LookupError) -> LookupFailure {
    LookupFailure { attribute, error }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::AttributeValue;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::time::Duration;

    /// Lookup double with a scripted answer per attribute and a call log.
    #[derive(Default)]
    struct ScriptedLookup {
        failures: HashMap<Attribute, LookupError>,
        delays: HashMap<Attribute, Duration>,
        calls: Mutex<Vec<(Attribute, String)>>,
    }

    impl ScriptedLookup {
        fn failing(mut self, attribute: Attribute, error: LookupError) -> Self {
            self.failures.insert(attribute, error);
            self
        }

        fn delayed(mut self, attribute: Attribute, delay: Duration) -> Self {
            self.delays.insert(attribute, delay);
            self
        }

        fn calls(&self) -> Vec<Attribute> {
            self.calls.lock().iter().map(|(a, _)| *a).collect()
        }
    }

    #[async_trait]
    impl AttributeLookup for ScriptedLookup {
        async fn fetch(&self, attribute: Attribute, name: &str) -> LookupResult {
            self.calls.lock().push((attribute, name.to_string()));
            if let Some(delay) = self.delays.get(&attribute) {
                tokio::time::sleep(*delay).await;
            }
            if let Some(err) = self.failures.get(&attribute) {
                return Err(err.clone());
            }
            Ok(match attribute {
                Attribute::Age => AttributeValue::Age(30),
                Attribute::Gender => AttributeValue::Gender("female".into()),
                Attribute::Nationality => AttributeValue::Nationality("RU".into()),
            })
        }
    }

    fn enricher(lookup: &Arc<ScriptedLookup>, strategy: LookupStrategy) -> Enricher {
        Enricher::new(Arc::clone(lookup) as Arc<dyn AttributeLookup>, strategy)
    }

    #[tokio::test]
    async fn test_all_lookups_succeed() {
        let lookup = Arc::new(ScriptedLookup::default());
        let outcome = enricher(&lookup, LookupStrategy::Sequential)
            .enrich(Identity::new("Anna", "Ivanova"))
            .await;

        assert_eq!(
            outcome.attributes(),
            Some(&Attributes {
                age: 30,
                gender: "female".into(),
                nationality: "RU".into(),
            })
        );
        assert!(outcome.error_kind().is_none());
        assert_eq!(
            lookup.calls(),
            vec![Attribute::Age, Attribute::Gender, Attribute::Nationality]
        );
        assert!(lookup.calls.lock().iter().all(|(_, name)| name == "Anna"));
    }

    #[tokio::test]
    async fn test_age_failure_short_circuits() {
        let lookup = Arc::new(
            ScriptedLookup::default().failing(Attribute::Age, LookupError::Timeout(2000)),
        );
        let enrichment = enricher(&lookup, LookupStrategy::Sequential)
            .resolve("Bob")
            .await;

        assert_eq!(
            enrichment,
            Enrichment::AnyFailed(LookupFailure {
                attribute: Attribute::Age,
                error: LookupError::Timeout(2000),
            })
        );
        assert_eq!(lookup.calls(), vec![Attribute::Age]);
    }

    #[tokio::test]
    async fn test_gender_failure_discards_age() {
        let lookup = Arc::new(ScriptedLookup::default().failing(
            Attribute::Gender,
            LookupError::Transport("connection refused".into()),
        ));
        let outcome = enricher(&lookup, LookupStrategy::Sequential)
            .enrich(Identity::new("Bob", "Lee"))
            .await;

        assert!(outcome.attributes().is_none());
        assert_eq!(
            outcome.error_kind(),
            Some(crate::model::ErrorKind::EnrichmentFailed)
        );
        assert_eq!(
            outcome.error_message(),
            Some("Failed to get gender: transport error: connection refused")
        );
        assert_eq!(lookup.calls(), vec![Attribute::Age, Attribute::Gender]);

        let wire: serde_json::Value =
            serde_json::from_slice(&outcome.to_json_bytes().unwrap()).unwrap();
        assert!(wire.get("age").is_none());
        assert_eq!(wire["name"], "Bob");
        assert_eq!(wire["surname"], "Lee");
    }

    #[tokio::test]
    async fn test_concurrent_issues_all_lookups() {
        let lookup = Arc::new(ScriptedLookup::default());
        let enrichment = enricher(&lookup, LookupStrategy::Concurrent)
            .resolve("Anna")
            .await;

        assert!(matches!(enrichment, Enrichment::AllSucceeded(_)));
        let mut calls = lookup.calls();
        calls.sort_by_key(|a| a.as_str());
        assert_eq!(
            calls,
            vec![Attribute::Age, Attribute::Gender, Attribute::Nationality]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_reports_first_failure_in_order() {
        // nationality fails first in time, gender fails later; gender is reported
        let lookup = Arc::new(
            ScriptedLookup::default()
                .failing(Attribute::Gender, LookupError::Timeout(100))
                .delayed(Attribute::Gender, Duration::from_millis(100))
                .failing(Attribute::Nationality, LookupError::Decode("bad".into())),
        );
        let enrichment = enricher(&lookup, LookupStrategy::Concurrent)
            .resolve("Bob")
            .await;

        assert_eq!(
            enrichment,
            Enrichment::AnyFailed(LookupFailure {
                attribute: Attribute::Gender,
                error: LookupError::Timeout(100),
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_latency_is_bounded_by_slowest() {
        let lookup = Arc::new(
            ScriptedLookup::default()
                .delayed(Attribute::Age, Duration::from_millis(100))
                .delayed(Attribute::Gender, Duration::from_millis(100))
                .delayed(Attribute::Nationality, Duration::from_millis(100)),
        );
        let start = tokio::time::Instant::now();
        let enrichment = enricher(&lookup, LookupStrategy::Concurrent)
            .resolve("Anna")
            .await;

        assert!(matches!(enrichment, Enrichment::AllSucceeded(_)));
        assert!(start.elapsed() < Duration::from_millis(300));
    }

    #[test]
    fn test_lookup_failure_message() {
        let failure = LookupFailure {
            attribute: Attribute::Nationality,
            error: LookupError::Decode("response has no `nationality` field".into()),
        };
        assert_eq!(
            failure.to_string(),
            "Failed to get nationality: decode error: response has no `nationality` field"
        );
    }
}
