use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};

use super::domain::{normalize_address, Coordinates, SearchType};
use super::provider::{PropertyDataProvider, ProviderError};

/// Three-way outcome of a lookup. Only `ProviderSuccess` may be recorded.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutorResult {
    ProviderSuccess { payload: Value },
    /// The provider answered but found nothing usable for the address.
    ProviderReportedFailure { reason: String },
    /// Transport fault, timeout, or outage status. Safe to retry.
    ProviderUnavailable { reason: String },
}

/// Runs basic (local) and smart (provider-backed) lookups.
pub struct SearchExecutor<P: ?Sized> {
    provider: Arc<P>,
    timeout: Duration,
}

impl<P> SearchExecutor<P>
where
    P: PropertyDataProvider + ?Sized,
{
    pub fn new(provider: Arc<P>, timeout: Duration) -> Self {
        Self { provider, timeout }
    }

    pub async fn execute(
        &self,
        search_type: SearchType,
        address: &str,
        coordinates: Coordinates,
    ) -> ExecutorResult {
        match search_type {
            SearchType::Basic => self.basic(address, coordinates),
            SearchType::Smart => self.smart(address, coordinates).await,
        }
    }

    /// Free lookup derived from the request alone.
    pub fn basic(&self, address: &str, coordinates: Coordinates) -> ExecutorResult {
        ExecutorResult::ProviderSuccess {
            payload: json!({
                "tier": SearchType::Basic.as_str(),
                "address": address.trim(),
                "normalized_address": normalize_address(address),
                "coordinates": coordinates,
                "components": address_components(address),
            }),
        }
    }

    /// Paid lookup against the external provider, bounded by the executor timeout.
    pub async fn smart(&self, address: &str, coordinates: Coordinates) -> ExecutorResult {
        let lookup = tokio::time::timeout(self.timeout, self.provider.lookup(address, coordinates))
            .await
            .unwrap_or(Err(ProviderError::Timeout(self.timeout)));

        match lookup {
            Ok(lookup) if lookup.success => match lookup.data {
                Some(data) => ExecutorResult::ProviderSuccess {
                    payload: json!({
                        "tier": SearchType::Smart.as_str(),
                        "address": address.trim(),
                        "coordinates": coordinates,
                        "provider": self.provider.name(),
                        "property": data,
                    }),
                },
                None => ExecutorResult::ProviderReportedFailure {
                    reason: "provider returned no property data".to_string(),
                },
            },
            Ok(lookup) => ExecutorResult::ProviderReportedFailure {
                reason: lookup
                    .error
                    .unwrap_or_else(|| "provider found no property for this address".to_string()),
            },
            Err(err) => ExecutorResult::ProviderUnavailable {
                reason: err.to_string(),
            },
        }
    }
}

/// Splits "street, city, REGION POSTAL" into its parts when the shape allows.
fn address_components(address: &str) -> Value {
    let parts: Vec<&str> = address
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect();

    let mut components = Map::new();
    if let Some(street) = parts.first() {
        components.insert("street".to_string(), json!(street));
    }
    if parts.len() >= 3 {
        components.insert("city".to_string(), json!(parts[1]));
        let mut tail = parts[2].split_whitespace();
        if let Some(region) = tail.next() {
            components.insert("region".to_string(), json!(region.to_uppercase()));
        }
        if let Some(postal_code) = tail.next() {
            components.insert("postal_code".to_string(), json!(postal_code));
        }
    } else if let Some(city) = parts.get(1) {
        components.insert("city".to_string(), json!(city));
    }
    Value::Object(components)
}
