//! HTTP client for the external quote/conversion service.
//!
//! Both operations share one retry protocol: attempts are numbered from 1 up to
//! `max_retries`, the delay before the next attempt starts at
//! `initial_backoff_ms` and doubles after every failure, and nothing is slept
//! after the final attempt. A "Request body validation failed" response is
//! permanent and raised on the attempt that produced it.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::Client;
use rust_decimal::{Decimal, RoundingStrategy};
use serde_json::{json, Value};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::SettlementConfig;
use crate::domain::{ApiCredentials, Conversion, ConversionRequest, Quote, QuoteRequest};
use crate::engine::SettlementApi;
use crate::error::{RatewatchError, Result, SettlementError};

const VALIDATION_FAILED_TITLE: &str = "Request body validation failed";

/// Outcome of a single failed attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptError {
    /// Stop immediately
    Permanent(SettlementError),
    /// Consumes one attempt
    Transient(String),
}

/// Bounded exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
        }
    }

    pub fn from_config(config: &SettlementConfig) -> Self {
        Self::new(
            config.max_retries,
            Duration::from_millis(config.initial_backoff_ms),
        )
    }

    /// Delay slept after failed attempt `attempt` (1-based): 500, 1000, 2000, ...
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.initial_backoff.saturating_mul(1u32 << exp)
    }

    /// Run `attempt_fn` until it succeeds, fails permanently or runs out of attempts.
    pub async fn run<T, F, Fut>(
        &self,
        operation: &'static str,
        mut attempt_fn: F,
    ) -> std::result::Result<T, SettlementError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = std::result::Result<T, AttemptError>>,
    {
        let mut last_error = String::new();

        for attempt in 1..=self.max_attempts {
            match attempt_fn(attempt).await {
                Ok(value) => return Ok(value),
                Err(AttemptError::Permanent(err)) => {
                    error!(operation, attempt, error = %err, "Settlement call failed permanently");
                    return Err(err);
                }
                Err(AttemptError::Transient(reason)) => {
                    warn!(operation, attempt, error = %reason, "Settlement attempt failed");
                    last_error = reason;

                    if attempt < self.max_attempts {
                        let delay = self.backoff_after(attempt);
                        debug!(operation, attempt, delay_ms = delay.as_millis() as u64, "Retrying");
                        sleep(delay).await;
                    }
                }
            }
        }

        error!(operation, attempts = self.max_attempts, "Settlement call failed after max retries");
        Err(SettlementError::RetriesExhausted {
            operation,
            attempts: self.max_attempts,
            last_error,
        })
    }
}

/// Quote/conversion client
#[derive(Clone)]
pub struct SettlementClient {
    http: Client,
    base_url: String,
    purpose: String,
    policy: RetryPolicy,
}

impl SettlementClient {
    pub fn new(config: &SettlementConfig) -> Result<Self> {
        let http = Client::builder()
            .user_agent("ratewatch/0.1")
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| {
                RatewatchError::Internal(format!("failed to build settlement HTTP client: {}", e))
            })?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            purpose: config.purpose.clone(),
            policy: RetryPolicy::from_config(config),
        })
    }

    fn auth_headers(
        credentials: &ApiCredentials,
    ) -> std::result::Result<HeaderMap, SettlementError> {
        let header = |value: &str, name: &str| {
            HeaderValue::from_str(value).map_err(|e| SettlementError::Validation {
                details: format!("invalid {} header: {}", name, e),
            })
        };

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            HeaderName::from_static("x-api-key"),
            header(&credentials.api_key, "x-api-key")?,
        );
        headers.insert(
            HeaderName::from_static("x-api-secret"),
            header(&credentials.api_secret, "x-api-secret")?,
        );
        Ok(headers)
    }

    /// One POST attempt, classified for the retry loop
    async fn post_once(
        &self,
        path: &str,
        body: &Value,
        headers: HeaderMap,
    ) -> std::result::Result<Value, AttemptError> {
        let url = format!("{}{}", self.base_url, path);

        let resp = self
            .http
            .post(&url)
            .headers(headers)
            .json(body)
            .send()
            .await
            .map_err(|e| AttemptError::Transient(format!("POST {} failed: {}", path, e)))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| AttemptError::Transient(format!("reading {} response: {}", path, e)))?;

        if !status.is_success() {
            return Err(classify_error_body(status.as_u16(), &text));
        }

        info!(path, status = status.as_u16(), "Settlement call succeeded");
        serde_json::from_str(&text).map_err(|e| {
            AttemptError::Permanent(SettlementError::MalformedResponse(format!(
                "invalid JSON from {}: {}",
                path, e
            )))
        })
    }

    async fn post_with_retry(
        &self,
        operation: &'static str,
        path: &str,
        body: Value,
        credentials: &ApiCredentials,
    ) -> std::result::Result<Value, SettlementError> {
        let headers = Self::auth_headers(credentials)?;
        self.policy
            .run(operation, |_| self.post_once(path, &body, headers.clone()))
            .await
    }
}

#[async_trait]
impl SettlementApi for SettlementClient {
    async fn get_quote(
        &self,
        request: &QuoteRequest,
        credentials: &ApiCredentials,
    ) -> std::result::Result<Quote, SettlementError> {
        info!(from = %request.from_currency, to = %request.to_currency, "Starting getQuote operation");
        let body = quote_body(request);
        let response = self
            .post_with_retry("getQuote", "/quotes", body, credentials)
            .await?;
        parse_quote(&response)
    }

    async fn create_conversion(
        &self,
        request: &ConversionRequest,
        credentials: &ApiCredentials,
    ) -> std::result::Result<Conversion, SettlementError> {
        info!(quote_id = %request.quote_id, "Starting createConversion operation");
        let body = json!({
            "type": "conversion",
            "quote": request.quote_id,
            "purpose": self.purpose,
            "source": request.source_account,
            "destination": request.destination_account,
        });
        let response = self
            .post_with_retry("createConversion", "/transactions", body, credentials)
            .await?;
        parse_conversion(&response)
    }
}

fn quote_body(request: &QuoteRequest) -> Value {
    let amount = request
        .amount
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    json!({
        "source": {
            "asset": request.from_currency,
            "network": request.from_network,
            "amount": format!("{:.2}", amount),
        },
        "target": {
            "asset": request.to_currency,
            "network": request.to_network,
        },
    })
}

/// Map a non-2xx response to permanent (validation) or transient
fn classify_error_body(status: u16, text: &str) -> AttemptError {
    let parsed: Option<Value> = serde_json::from_str(text).ok();

    if let Some(body) = parsed.as_ref() {
        if body.get("title").and_then(Value::as_str) == Some(VALIDATION_FAILED_TITLE) {
            let details = body
                .get("errors")
                .and_then(Value::as_array)
                .map(|errors| {
                    errors
                        .iter()
                        .filter_map(|e| e.get("details").and_then(Value::as_str))
                        .collect::<Vec<_>>()
                        .join(",")
                })
                .unwrap_or_default();
            return AttemptError::Permanent(SettlementError::Validation { details });
        }
    }

    let message = parsed
        .as_ref()
        .and_then(|b| b.get("message").and_then(Value::as_str))
        .unwrap_or(text);
    AttemptError::Transient(format!("status={} {}", status, message))
}

fn parse_decimalish(value: Option<&Value>) -> Option<Decimal> {
    let text = match value? {
        Value::String(s) => s.trim().to_string(),
        // serde_json prints large or tiny floats in exponent form, e.g. `1e21`
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    Decimal::from_str_exact(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .ok()
}

fn parse_quote(body: &Value) -> std::result::Result<Quote, SettlementError> {
    let malformed = |what: &str| SettlementError::MalformedResponse(format!("quote {}", what));

    let quote_id = body
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("missing id"))?;
    let source = parse_decimalish(body.pointer("/source/amount"))
        .ok_or_else(|| malformed("missing source.amount"))?;
    let target = parse_decimalish(body.pointer("/target/amount"))
        .ok_or_else(|| malformed("missing target.amount"))?;

    let rate = target
        .checked_div(source)
        .filter(|_| !source.is_zero())
        .ok_or_else(|| malformed("has zero source.amount"))?;

    Ok(Quote {
        quote_id: quote_id.to_string(),
        rate,
    })
}

fn parse_conversion(body: &Value) -> std::result::Result<Conversion, SettlementError> {
    let transaction_id = body
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| SettlementError::MalformedResponse("transaction missing id".to_string()))?;

    Ok(Conversion {
        transaction_id: transaction_id.to_string(),
        status: body
            .get("status")
            .and_then(Value::as_str)
            .map(ToString::to_string),
    })
}
