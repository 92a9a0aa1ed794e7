//! Thin Alpha Vantage client with conservative backoff for the free tier.

use crate::{check_status, ProviderError};
use reqwest::Client;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_BASE_URL: &str = "https://www.alphavantage.co/query";

#[derive(Debug, Clone)]
pub struct AvConfig {
    pub api_key: String,
    pub base_url: String,
    /// Pause after a throttle notice. The free tier allows ~5 requests/min.
    pub rate_limit_sleep: Duration,
    pub max_attempts: u32,
    pub timeout: Duration,
}

impl Default for AvConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            rate_limit_sleep: Duration::from_secs(13),
            max_attempts: 5,
            timeout: Duration::from_secs(30),
        }
    }
}

/// What a decoded response body means for the retry loop.
#[derive(Debug, PartialEq)]
pub enum Payload {
    Data(Value),
    Throttled(String),
    Error(String),
}

/// Throttle notices come back as HTTP 200 with a `Note` field; bad symbols
/// or functions come back as HTTP 200 with `Error Message`.
pub fn classify_payload(data: Value) -> Payload {
    if let Some(obj) = data.as_object() {
        if let Some((_, note)) = obj.iter().find(|(k, _)| k.eq_ignore_ascii_case("note")) {
            return Payload::Throttled(note.as_str().unwrap_or_default().to_string());
        }
        if let Some(msg) = obj.get("Error Message") {
            let msg = msg
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| msg.to_string());
            return Payload::Error(msg);
        }
    }
    Payload::Data(data)
}

#[derive(Clone)]
pub struct AvClient {
    client: Client,
    cfg: Arc<AvConfig>,
}

impl AvClient {
    pub fn new(cfg: AvConfig) -> Result<Self, ProviderError> {
        if cfg.api_key.trim().is_empty() {
            return Err(ProviderError::MissingApiKey);
        }
        let client = Client::builder()
            .timeout(cfg.timeout)
            .build()
            .map_err(|e| ProviderError::RequestFailed(e.to_string()))?;
        Ok(Self {
            client,
            cfg: Arc::new(cfg),
        })
    }

    async fn get(&self, params: &[(&str, &str)]) -> Result<Value, ProviderError> {
        let function = params
            .iter()
            .find(|(k, _)| *k == "function")
            .map(|(_, v)| *v)
            .unwrap_or_default();
        for attempt in 1..=self.cfg.max_attempts {
            debug!(function, attempt, "alpha vantage request");
            let resp = self
                .client
                .get(&self.cfg.base_url)
                .query(params)
                .query(&[("apikey", self.cfg.api_key.as_str())])
                .send()
                .await
                .map_err(|e| ProviderError::RequestFailed(e.to_string()))?;
            let resp = check_status(resp).await?;
            let data: Value = resp
                .json()
                .await
                .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
            match classify_payload(data) {
                Payload::Data(v) => return Ok(v),
                Payload::Error(msg) => return Err(ProviderError::Api(msg)),
                Payload::Throttled(note) => {
                    warn!(function, attempt, %note, "alpha vantage throttled, backing off");
                    tokio::time::sleep(self.cfg.rate_limit_sleep).await;
                }
            }
        }
        Err(ProviderError::RateLimited(
            "Alpha Vantage rate limit: retries exceeded".into(),
        ))
    }

    // ------------ Stock endpoints ------------

    pub async fn daily_adjusted(
        &self,
        symbol: &str,
        outputsize: &str,
    ) -> Result<Value, ProviderError> {
        self.get(&[
            ("function", "TIME_SERIES_DAILY_ADJUSTED"),
            ("symbol", symbol),
            ("outputsize", outputsize),
        ])
        .await
    }

    pub async fn overview(&self, symbol: &str) -> Result<Value, ProviderError> {
        self.get(&[("function", "OVERVIEW"), ("symbol", symbol)]).await
    }

    pub async fn earnings(&self, symbol: &str) -> Result<Value, ProviderError> {
        self.get(&[("function", "EARNINGS"), ("symbol", symbol)]).await
    }

    // ------------ Crypto endpoints ------------

    pub async fn crypto_daily(&self, symbol: &str, market: &str) -> Result<Value, ProviderError> {
        self.get(&[
            ("function", "DIGITAL_CURRENCY_DAILY"),
            ("symbol", symbol),
            ("market", market),
        ])
        .await
    }

    pub async fn news(&self, tickers_csv: &str, limit: u32) -> Result<Value, ProviderError> {
        let limit = limit.to_string();
        self.get(&[
            ("function", "NEWS_SENTIMENT"),
            ("tickers", tickers_csv),
            ("limit", limit.as_str()),
        ])
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn note_in_any_case_is_a_throttle() {
        let payload = classify_payload(json!({"NOTE": "Thank you for using Alpha Vantage!"}));
        assert_eq!(
            payload,
            Payload::Throttled("Thank you for using Alpha Vantage!".into())
        );
    }

    #[test]
    fn error_message_is_surfaced() {
        let payload = classify_payload(json!({"Error Message": "Invalid API call."}));
        assert_eq!(payload, Payload::Error("Invalid API call.".into()));
    }

    #[test]
    fn regular_payload_passes_through() {
        let body = json!({"Symbol": "AAPL", "Name": "Apple Inc"});
        assert_eq!(classify_payload(body.clone()), Payload::Data(body));
    }

    #[test]
    fn empty_key_is_rejected() {
        let err = AvClient::new(AvConfig::default()).err();
        assert!(matches!(err, Some(ProviderError::MissingApiKey)));
    }
}
