//! Account balance from the billing `credit_grants` endpoint.

use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize)]
pub struct CreditGrants {
    #[serde(default)]
    pub total_granted: f64,
    #[serde(default)]
    pub total_used: f64,
    #[serde(default)]
    pub total_available: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    /// Non-200 answer; the body is kept verbatim for the user.
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("{0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected billing payload: {0}")]
    Decode(String),
}

impl BillingError {
    pub fn kind(&self) -> &'static str {
        match self {
            BillingError::Http { .. } => "HttpError",
            BillingError::Transport(err) if err.is_timeout() => "Timeout",
            BillingError::Transport(_) => "TransportError",
            BillingError::Decode(_) => "DecodeError",
        }
    }
}

#[async_trait::async_trait]
pub trait BillingSource: Send + Sync {
    async fn credit_grants(&self) -> Result<CreditGrants, BillingError>;
}

pub struct OpenAIBilling {
    client: Client,
    api_key: String,
    url: String,
}

impl OpenAIBilling {
    pub fn new(api_key: String, url: String, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_key,
            url,
        })
    }

    fn parse(body: &str) -> Result<CreditGrants, BillingError> {
        serde_json::from_str(body).map_err(|e| BillingError::Decode(e.to_string()))
    }
}

#[async_trait::async_trait]
impl BillingSource for OpenAIBilling {
    async fn credit_grants(&self) -> Result<CreditGrants, BillingError> {
        let response = self
            .client
            .get(&self.url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if status.as_u16() != 200 {
            return Err(BillingError::Http {
                status: status.as_u16(),
                body,
            });
        }
        Self::parse(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::{BillingError, CreditGrants, OpenAIBilling};

    #[test]
    fn parses_credit_grants_with_missing_fields_as_zero() {
        let grants = OpenAIBilling::parse(
            r#"{"object":"credit_summary","total_granted":18.0,"total_used":2.5}"#,
        )
        .expect("parse");
        assert_eq!(
            grants,
            CreditGrants {
                total_granted: 18.0,
                total_used: 2.5,
                total_available: 0.0,
            }
        );
    }

    #[test]
    fn invalid_payload_is_decode_error() {
        let err = OpenAIBilling::parse("<html>").expect_err("must fail");
        assert_eq!(err.kind(), "DecodeError");
    }

    #[test]
    fn http_error_displays_status_and_body() {
        let err = BillingError::Http {
            status: 403,
            body: "{\"error\":\"session key required\"}".to_string(),
        };
        assert_eq!(err.to_string(), "HTTP 403: {\"error\":\"session key required\"}");
        assert_eq!(err.kind(), "HttpError");
    }
}
