//! HTTP lookup client for the agify/genderize/nationalize style services.
//!
//! Each service takes `?name=<name>` and answers with a JSON object holding a
//! single field named after the attribute. Calls are bounded by the client
//! timeout, transient failures are retried with backoff, and each service has
//! its own circuit breaker.

use super::{Attribute, AttributeLookup, AttributeValue, LookupResult};
use crate::circuit_breaker::CircuitBreaker;
use crate::config::LookupConfig;
use crate::error::LookupError;
use crate::retry::RetryConfig;
use crate::{Error, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use tracing::{debug, info};

/// Longest error body kept in a `Status` error.
const MAX_ERROR_BODY: usize = 256;

struct Endpoint {
    attribute: Attribute,
    url: Url,
    breaker: CircuitBreaker,
}

/// Lookup client backed by three HTTP services.
pub struct HttpLookupClient {
    client: Client,
    endpoints: [Endpoint; 3],
    retry: RetryConfig,
    timeout_ms: u64,
}

impl HttpLookupClient {
    /// Create a client for the services named in `config`.
    pub fn new(config: &LookupConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .pool_max_idle_per_host(4)
            .user_agent(concat!("fio-enricher/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        let endpoint = |attribute: Attribute, url: &str| -> Result<Endpoint> {
            let url = Url::parse(url).map_err(|e| {
                Error::Config(format!("Invalid {} lookup URL '{}': {}", attribute, url, e))
            })?;
            Ok(Endpoint {
                attribute,
                url,
                breaker: CircuitBreaker::new(
                    format!("{}-lookup", attribute),
                    config.circuit_failure_threshold,
                    config.circuit_reset_timeout(),
                ),
            })
        };

        let endpoints = [
            endpoint(Attribute::Age, &config.age_url)?,
            endpoint(Attribute::Gender, &config.gender_url)?,
            endpoint(Attribute::Nationality, &config.nationality_url)?,
        ];

        info!(
            age = %endpoints[0].url,
            gender = %endpoints[1].url,
            nationality = %endpoints[2].url,
            timeout_ms = config.request_timeout_ms,
            "Lookup client initialized"
        );

        Ok(Self {
            client,
            endpoints,
            retry: config.retry.clone(),
            timeout_ms: config.request_timeout_ms,
        })
    }

    fn endpoint(&self, attribute: Attribute) -> &Endpoint {
        match attribute {
            Attribute::Age => &self.endpoints[0],
            Attribute::Gender => &self.endpoints[1],
            Attribute::Nationality => &self.endpoints[2],
        }
    }

    async fn fetch_once(&self, endpoint: &Endpoint, name: &str) -> LookupResult {
        let response = self
            .client
            .get(endpoint.url.clone())
            .query(&[("name", name)])
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        let body = response.text().await.map_err(|e| self.transport_error(e))?;

        if !status.is_success() {
            let mut body = body;
            if body.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            return Err(LookupError::Status {
                status: status.as_u16(),
                body,
            });
        }

        decode_body(endpoint.attribute, &body)
    }

    fn transport_error(&self, err: reqwest::Error) -> LookupError {
        if err.is_timeout() {
            LookupError::Timeout(self.timeout_ms)
        } else {
            LookupError::Transport(err.to_string())
        }
    }
}

#[async_trait]
impl AttributeLookup for HttpLookupClient {
    async fn fetch(&self, attribute: Attribute, name: &str) -> LookupResult {
        let endpoint = self.endpoint(attribute);

        if !endpoint.breaker.try_acquire() {
            return Err(LookupError::CircuitOpen(endpoint.breaker.name().to_string()));
        }

        let result = self
            .retry
            .run(
                endpoint.breaker.name(),
                || self.fetch_once(endpoint, name),
                LookupError::is_retryable,
            )
            .await;

        match result {
            Ok(value) => {
                endpoint.breaker.record_success();
                Ok(value)
            }
            Err((err, attempts)) => {
                // The service answered; a bad body or 4xx says nothing about availability.
                if err.is_retryable() {
                    endpoint.breaker.record_failure();
                } else {
                    endpoint.breaker.record_success();
                }
                debug!(
                    attribute = %attribute,
                    attempts = attempts,
                    error = %err,
                    "Lookup failed"
                );
                Err(err)
            }
        }
    }
}

/// Extract the attribute field from a service response body.
fn decode_body(attribute: Attribute, body: &str) -> LookupResult {
    let json: serde_json::Value =
        serde_json::from_str(body).map_err(|e| LookupError::Decode(e.to_string()))?;

    let field = json.get(attribute.as_str()).ok_or_else(|| {
        LookupError::Decode(format!("response has no `{}` field", attribute))
    })?;

    let value = match attribute {
        Attribute::Age => field
            .as_u64()
            .and_then(|age| u32::try_from(age).ok())
            .map(AttributeValue::Age),
        Attribute::Gender => field
            .as_str()
            .filter(|s| !s.is_empty())
            .map(|s| AttributeValue::Gender(s.to_string())),
        Attribute::Nationality => field
            .as_str()
            .filter(|s| !s.is_empty())
            .map(|s| AttributeValue::Nationality(s.to_string())),
    };

    value.ok_or_else(|| {
        LookupError::Decode(format!("field `{}` has unexpected value {}", attribute, field))
    })
}
