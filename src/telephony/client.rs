//! # Telephony Control-API Client
//!
//! REST client for the telephony provider's call-control API: placing
//! calls, redirecting live calls, and querying call status.
//!
//! ## Credential Hygiene:
//! Account id and secret are sanitized of whitespace and invisible
//! characters (a surprisingly common copy/paste artifact) and validated for
//! exact length and charset BEFORE any request is made, so credential
//! problems surface as upfront `Auth` errors rather than mid-call 401s.

use crate::error::{AppError, AppResult};
use crate::resilience::fallback::CallControl;
use crate::telephony::webhook;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

/// Exact shape required of a provider account id.
const ACCOUNT_ID_LEN: usize = 34;
const ACCOUNT_ID_PREFIX: &str = "AC";
/// Exact length of a provider API secret.
const SECRET_LEN: usize = 32;

/// Validated, sanitized provider credentials.
#[derive(Debug, Clone)]
pub struct TelephonyCredentials {
    pub account_id: String,
    secret: String,
}

impl TelephonyCredentials {
    /// Sanitize then validate raw credential strings.
    pub fn validate(account_id: &str, secret: &str) -> AppResult<Self> {
        let account_id = sanitize_credential(account_id);
        let secret = sanitize_credential(secret);

        if account_id.len() != ACCOUNT_ID_LEN {
            return Err(AppError::Auth(format!(
                "Account id must be exactly {} characters",
                ACCOUNT_ID_LEN
            )));
        }
        if !account_id.starts_with(ACCOUNT_ID_PREFIX) {
            return Err(AppError::Auth(format!(
                "Account id must start with '{}'",
                ACCOUNT_ID_PREFIX
            )));
        }
        if !account_id.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(AppError::Auth(
                "Account id contains invalid characters".to_string(),
            ));
        }

        if secret.len() != SECRET_LEN {
            return Err(AppError::Auth(format!(
                "API secret must be exactly {} characters",
                SECRET_LEN
            )));
        }
        if !secret.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(AppError::Auth(
                "API secret contains invalid characters".to_string(),
            ));
        }

        Ok(Self { account_id, secret })
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }
}

/// Strip whitespace and invisible characters that sneak into pasted
/// credentials (zero-width spaces, BOMs, control characters).
fn sanitize_credential(raw: &str) -> String {
    raw.chars()
        .filter(|c| {
            !c.is_whitespace()
                && !c.is_control()
                && !matches!(c, '\u{200B}'..='\u{200D}' | '\u{2060}' | '\u{FEFF}')
        })
        .collect()
}

/// Parameters for placing an outbound call.
#[derive(Debug, Clone)]
pub struct OutboundCallConfig {
    pub to: String,
    pub from: String,
    /// Webhook the provider fetches for call instructions once answered.
    pub webhook_url: String,
}

/// Provider's view of a call, as returned by the control API.
#[derive(Debug, Clone)]
pub struct CallHandle {
    pub call_id: String,
    pub status: String,
}

#[derive(Debug, Deserialize)]
struct CallResource {
    sid: String,
    status: String,
}

/// REST client for the provider call-control API.
pub struct TelephonyClient {
    http: reqwest::Client,
    base_url: String,
    credentials: TelephonyCredentials,
}

impl TelephonyClient {
    pub fn new(base_url: &str, credentials: TelephonyCredentials) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
        }
    }

    /// Place an outbound call; the provider calls back `webhook_url` for
    /// instructions when the callee answers.
    pub async fn initiate_call(&self, config: OutboundCallConfig) -> AppResult<CallHandle> {
        let url = format!(
            "{}/Accounts/{}/Calls.json",
            self.base_url, self.credentials.account_id
        );

        let params = [
            ("To", config.to.as_str()),
            ("From", config.from.as_str()),
            ("Url", config.webhook_url.as_str()),
        ];

        let response = self
            .http
            .post(&url)
            .basic_auth(&self.credentials.account_id, Some(self.credentials.secret()))
            .form(&params)
            .send()
            .await?;

        let resource = Self::parse_call_resource(response).await?;
        info!(call_id = %resource.sid, status = %resource.status, "Outbound call placed");
        Ok(CallHandle {
            call_id: resource.sid,
            status: resource.status,
        })
    }

    /// Replace a live call's instructions with new markup, moving it off
    /// its current media stream.
    pub async fn redirect_call(&self, call_id: &str, markup: &str) -> AppResult<()> {
        let url = format!(
            "{}/Accounts/{}/Calls/{}.json",
            self.base_url, self.credentials.account_id, call_id
        );

        let params = [("Twiml", markup)];

        let response = self
            .http
            .post(&url)
            .basic_auth(&self.credentials.account_id, Some(self.credentials.secret()))
            .form(&params)
            .send()
            .await?;

        Self::parse_call_resource(response).await?;
        debug!(call_id, "Call redirected");
        Ok(())
    }

    /// Current provider-side status of a call.
    pub async fn get_call_status(&self, call_id: &str) -> AppResult<String> {
        let url = format!(
            "{}/Accounts/{}/Calls/{}.json",
            self.base_url, self.credentials.account_id, call_id
        );

        let response = self
            .http
            .get(&url)
            .basic_auth(&self.credentials.account_id, Some(self.credentials.secret()))
            .send()
            .await?;

        let resource = Self::parse_call_resource(response).await?;
        Ok(resource.status)
    }

    async fn parse_call_resource(response: reqwest::Response) -> AppResult<CallResource> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<CallResource>().await?);
        }

        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response.text().await.unwrap_or_default();

        Err(match status.as_u16() {
            401 | 403 => AppError::Auth(format!("Provider rejected credentials: {}", body)),
            404 => AppError::NotFound(format!("Call not found: {}", body)),
            429 => AppError::RateLimit {
                message: format!("Provider throttled request: {}", body),
                retry_after,
            },
            400 => AppError::BadRequest(format!("Provider rejected request: {}", body)),
            s if s >= 500 => AppError::Service(format!("Provider error {}: {}", s, body)),
            s => AppError::Service(format!("Unexpected provider status {}: {}", s, body)),
        })
    }
}

#[async_trait]
impl CallControl for TelephonyClient {
    async fn redirect_to_conference(&self, call_id: &str, room: &str) -> AppResult<()> {
        self.redirect_call(call_id, &webhook::conference_response(room))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_account_id() -> String {
        format!("AC{}", "a1b2c3d4".repeat(4))
    }

    fn valid_secret() -> String {
        "f".repeat(32)
    }

    #[test]
    fn test_valid_credentials_pass() {
        let creds = TelephonyCredentials::validate(&valid_account_id(), &valid_secret());
        assert!(creds.is_ok());
    }

    /// Whitespace and invisible characters are stripped before validation,
    /// so a padded-but-correct credential still passes.
    #[test]
    fn test_sanitization_strips_invisible_characters() {
        let padded = format!("  {}\u{200B}\n", valid_account_id());
        let creds = TelephonyCredentials::validate(&padded, &valid_secret()).unwrap();
        assert_eq!(creds.account_id, valid_account_id());
    }

    #[test]
    fn test_length_and_charset_enforced() {
        // Too short
        assert!(TelephonyCredentials::validate("AC123", &valid_secret()).is_err());
        // Wrong prefix
        let wrong_prefix = format!("XX{}", "a".repeat(32));
        assert!(TelephonyCredentials::validate(&wrong_prefix, &valid_secret()).is_err());
        // Bad charset in account id
        let bad_chars = format!("AC{}!", "a".repeat(31));
        assert!(TelephonyCredentials::validate(&bad_chars, &valid_secret()).is_err());
        // Bad secret length
        assert!(TelephonyCredentials::validate(&valid_account_id(), "short").is_err());
        // Bad secret charset
        let bad_secret = format!("{}-", "f".repeat(31));
        assert!(TelephonyCredentials::validate(&valid_account_id(), &bad_secret).is_err());
    }

    #[test]
    fn test_validation_errors_are_auth_errors() {
        let err = TelephonyCredentials::validate("nope", &valid_secret()).unwrap_err();
        assert!(matches!(err, AppError::Auth(_)));
        assert!(!err.retryable());
    }
}
