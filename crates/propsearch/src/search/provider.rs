//! Outbound property-data provider contract and its HTTP implementation.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::domain::Coordinates;
use crate::config::ProviderConfig;

/// Body returned by a provider that answered the request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderLookup {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProviderLookup {
    pub fn found(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn not_found(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(reason.into()),
        }
    }
}

/// The provider could not be reached or did not answer usefully.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("provider transport failure: {0}")]
    Transport(String),
    #[error("provider timed out after {0:?}")]
    Timeout(Duration),
    #[error("provider returned status {status}: {detail}")]
    Status { status: u16, detail: String },
}

/// Property-data lookup used by smart searches.
#[async_trait]
pub trait PropertyDataProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn lookup(
        &self,
        address: &str,
        coordinates: Coordinates,
    ) -> Result<ProviderLookup, ProviderError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StatusClass {
    Answered,
    Rejected,
    Unavailable,
}

/// Statuses that say nothing about the address itself are treated as outages.
pub(crate) fn classify_status(status: u16) -> StatusClass {
    match status {
        200..=299 => StatusClass::Answered,
        401 | 403 | 408 | 429 => StatusClass::Unavailable,
        400..=499 => StatusClass::Rejected,
        _ => StatusClass::Unavailable,
    }
}

/// `reqwest` client for a JSON property-data API exposing `GET /v1/properties/lookup`.
#[derive(Debug, Clone)]
pub struct HttpPropertyProvider {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl HttpPropertyProvider {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| ProviderError::Transport(err.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            timeout,
        })
    }

    /// Returns `None` when no provider endpoint is configured.
    pub fn from_config(config: &ProviderConfig) -> Result<Option<Self>, ProviderError> {
        match &config.base_url {
            Some(base_url) => {
                Self::new(base_url.clone(), config.api_key.clone(), config.timeout).map(Some)
            }
            None => Ok(None),
        }
    }

    fn lookup_url(&self) -> String {
        format!("{}/v1/properties/lookup", self.base_url)
    }
}

#[async_trait]
impl PropertyDataProvider for HttpPropertyProvider {
    fn name(&self) -> &str {
        "http"
    }

    async fn lookup(
        &self,
        address: &str,
        coordinates: Coordinates,
    ) -> Result<ProviderLookup, ProviderError> {
        let latitude = coordinates.latitude.to_string();
        let longitude = coordinates.longitude.to_string();
        let mut request = self.client.get(self.lookup_url()).query(&[
            ("address", address),
            ("lat", latitude.as_str()),
            ("lon", longitude.as_str()),
        ]);
        if let Some(key) = &self.api_key {
            request = request.header("x-api-key", key);
        }

        let response = request.send().await.map_err(|err| {
            if err.is_timeout() {
                ProviderError::Timeout(self.timeout)
            } else {
                ProviderError::Transport(err.to_string())
            }
        })?;

        let status = response.status().as_u16();
        match classify_status(status) {
            StatusClass::Answered => response
                .json::<ProviderLookup>()
                .await
                .map_err(|err| ProviderError::Transport(format!("malformed response: {err}"))),
            StatusClass::Rejected => {
                let body = response.text().await.unwrap_or_default();
                Ok(rejected_lookup(status, &body))
            }
            StatusClass::Unavailable => Err(ProviderError::Status {
                status,
                detail: response.text().await.unwrap_or_default(),
            }),
        }
    }
}

fn rejected_lookup(status: u16, body: &str) -> ProviderLookup {
    match serde_json::from_str::<ProviderLookup>(body) {
        Ok(mut lookup) => {
            lookup.success = false;
            if lookup.error.is_none() {
                lookup.error = Some(format!("provider rejected lookup ({status})"));
            }
            lookup
        }
        Err(_) if body.trim().is_empty() => {
            ProviderLookup::not_found(format!("provider rejected lookup ({status})"))
        }
        Err(_) => ProviderLookup::not_found(body.trim().to_string()),
    }
}
