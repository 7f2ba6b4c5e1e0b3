//! License gate: HTTPS validation with a cached subscription token.
//!
//! The engine only ever touches the lock-guarded cache (`is_token_valid`);
//! network validation runs in its own task so a slow endpoint can never stall
//! trade-event dispatch. Semantics mirror the terminal-side license layer:
//! cache hit short-circuits, a failed validation clears the cache, transport
//! failures retry with doubling delays.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::LicenseError;

const VALIDATE_PATH: &str = "/v1/license/validate";
const MAX_ATTEMPTS: u32 = 3;
const BASE_RETRY_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_TTL_SECS: u64 = 900;
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Identity sent with every validation request.
#[derive(Debug, Clone)]
pub struct LicenseCredentials {
    pub key: String,
    pub account_id: String,
    pub broker: String,
    pub device_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ValidateRequest<'a> {
    license_key: &'a str,
    account_id: &'a str,
    broker: &'a str,
    device_id: &'a str,
    platform: &'a str,
    version: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ValidateResponse {
    valid: bool,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    ttl_seconds: Option<u64>,
    #[serde(default)]
    plan: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// A validated token held in the cache.
#[derive(Debug, Clone)]
pub struct CachedToken {
    pub token: String,
    pub plan: String,
    pub ttl_seconds: u64,
    pub expires_at: DateTime<Utc>,
}

impl CachedToken {
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// Owns the token cache and the validation endpoint. One value per process,
/// injected into whatever needs gating; no global state.
pub struct LicenseManager {
    http: Client,
    endpoint: String,
    credentials: LicenseCredentials,
    cache: Mutex<Option<CachedToken>>,
}

impl LicenseManager {
    pub fn new(endpoint: String, credentials: LicenseCredentials) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| anyhow::anyhow!("failed to create HTTP client: {e}"))?;

        Ok(Self {
            http,
            endpoint,
            credentials,
            cache: Mutex::new(None),
        })
    }

    /// Build from environment: HEDGESYNC_LICENSE_KEY, HEDGESYNC_LICENSE_URL,
    /// HEDGESYNC_DEVICE_ID.
    pub fn from_env(account_id: &str, broker: &str) -> anyhow::Result<Self> {
        let key = std::env::var("HEDGESYNC_LICENSE_KEY")
            .map_err(|_| anyhow::anyhow!("HEDGESYNC_LICENSE_KEY not set"))?;
        let endpoint = std::env::var("HEDGESYNC_LICENSE_URL")
            .unwrap_or_else(|_| "https://api.hedgesync.io".to_string());
        let device_id =
            std::env::var("HEDGESYNC_DEVICE_ID").unwrap_or_else(|_| "unknown-device".to_string());

        Self::new(
            endpoint,
            LicenseCredentials {
                key,
                account_id: account_id.to_string(),
                broker: broker.to_string(),
                device_id,
            },
        )
    }

    /// Delay before retry `attempt` (0-based): 1s, 2s, 4s.
    fn retry_delay(attempt: u32) -> Duration {
        BASE_RETRY_DELAY * (1u32 << attempt)
    }

    /// Validate the license, returning the cached token when it is still
    /// fresh and hitting the endpoint otherwise.
    pub async fn validate(&self, platform: &str) -> Result<CachedToken, LicenseError> {
        // Fast path: unexpired cache, zero network calls.
        {
            let cache = self.cache.lock().expect("license cache poisoned");
            if let Some(cached) = cache.as_ref() {
                if !cached.is_expired() {
                    debug!("license cache hit");
                    return Ok(cached.clone());
                }
            }
        }

        let url = format!("{}{}", self.endpoint, VALIDATE_PATH);
        let body = ValidateRequest {
            license_key: &self.credentials.key,
            account_id: &self.credentials.account_id,
            broker: &self.credentials.broker,
            device_id: &self.credentials.device_id,
            platform,
            version: env!("CARGO_PKG_VERSION"),
        };

        // Transport failures retry with doubling delay; HTTP-level rejections
        // are final.
        let mut last_err = String::new();
        let mut response = None;
        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                let delay = Self::retry_delay(attempt - 1);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying license validation");
                tokio::time::sleep(delay).await;
            }

            match self.http.post(&url).json(&body).send().await {
                Ok(resp) => {
                    response = Some(resp);
                    break;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "license endpoint unreachable");
                    last_err = e.to_string();
                }
            }
        }

        let response = response.ok_or(LicenseError::Network(last_err))?;

        let status = response.status();
        if status.as_u16() != 200 {
            let text = response.text().await.unwrap_or_default();
            self.clear_cache();
            return Err(LicenseError::Http {
                status: status.as_u16(),
                body: text,
            });
        }

        let parsed: ValidateResponse = response
            .json()
            .await
            .map_err(|e| LicenseError::Network(format!("malformed response: {e}")))?;

        if !parsed.valid {
            self.clear_cache();
            let message = parsed
                .message
                .unwrap_or_else(|| "license invalid".to_string());
            if message.to_lowercase().contains("expired") {
                return Err(LicenseError::Expired);
            }
            return Err(LicenseError::Invalid(message));
        }

        let ttl = parsed.ttl_seconds.filter(|t| *t > 0).unwrap_or(DEFAULT_TTL_SECS);
        let cached = CachedToken {
            token: parsed.token.unwrap_or_default(),
            plan: parsed.plan.unwrap_or_else(|| "standard".to_string()),
            ttl_seconds: ttl,
            expires_at: Utc::now() + chrono::Duration::seconds(ttl as i64),
        };

        info!(plan = %cached.plan, ttl = ttl, "license validated");

        let mut cache = self.cache.lock().expect("license cache poisoned");
        *cache = Some(cached.clone());
        Ok(cached)
    }

    pub fn credentials(&self) -> &LicenseCredentials {
        &self.credentials
    }

    /// Current cached token, expired or not.
    pub fn cached_token(&self) -> Option<CachedToken> {
        self.cache.lock().expect("license cache poisoned").clone()
    }

    /// Lock-only fast path consulted by the engine before every dispatch.
    pub fn is_token_valid(&self) -> bool {
        self.cache
            .lock()
            .expect("license cache poisoned")
            .as_ref()
            .map(|t| !t.is_expired())
            .unwrap_or(false)
    }

    /// Seconds until the cached token expires, zero if absent or expired.
    pub fn token_ttl(&self) -> u64 {
        self.cache
            .lock()
            .expect("license cache poisoned")
            .as_ref()
            .map(|t| (t.expires_at - Utc::now()).num_seconds().max(0) as u64)
            .unwrap_or(0)
    }

    pub fn clear_cache(&self) {
        let mut cache = self.cache.lock().expect("license cache poisoned");
        *cache = None;
    }

    #[cfg(test)]
    pub(crate) fn seed_cache(&self, token: CachedToken) {
        *self.cache.lock().unwrap() = Some(token);
    }
}
