use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Credits charged for one smart search.
pub const SMART_SEARCH_COST: u32 = 1;

/// Identifier wrapper for a billing account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountId(pub String);

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier wrapper for a search history record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HistoryId(pub String);

impl HistoryId {
    pub fn generate() -> Self {
        Self(format!("srch-{}", uuid::Uuid::new_v4().simple()))
    }
}

impl fmt::Display for HistoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier wrapper for a credit transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId(pub String);

impl TransactionId {
    pub fn generate() -> Self {
        Self(format!("ctx-{}", uuid::Uuid::new_v4().simple()))
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Search tier requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchType {
    Basic,
    Smart,
}

impl SearchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchType::Basic => "basic",
            SearchType::Smart => "smart",
        }
    }

    /// Credits a completed search of this tier costs.
    pub fn cost(&self) -> u32 {
        match self {
            SearchType::Basic => 0,
            SearchType::Smart => SMART_SEARCH_COST,
        }
    }
}

impl fmt::Display for SearchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SearchType {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "basic" => Ok(SearchType::Basic),
            "smart" => Ok(SearchType::Smart),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Reason a ledger entry was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    SmartSearch,
    Purchase,
    SubscriptionRenewal,
    Refund,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::SmartSearch => "smart_search",
            ActionType::Purchase => "purchase",
            ActionType::SubscriptionRenewal => "subscription_renewal",
            ActionType::Refund => "refund",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionType {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "smart_search" => Ok(ActionType::SmartSearch),
            "purchase" => Ok(ActionType::Purchase),
            "subscription_renewal" => Ok(ActionType::SubscriptionRenewal),
            "refund" => Ok(ActionType::Refund),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown variant '{0}'")]
pub struct UnknownVariant(pub String);

/// Already-geocoded position supplied by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

/// Spendable balance for one account.
///
/// `available_credits == total_earned - total_spent` holds for every committed state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditBalance {
    pub account_id: AccountId,
    pub available_credits: u64,
    pub total_earned: u64,
    pub total_spent: u64,
    pub last_updated: DateTime<Utc>,
}

impl CreditBalance {
    pub fn is_consistent(&self) -> bool {
        self.total_earned
            .checked_sub(self.total_spent)
            .is_some_and(|net| net == self.available_credits)
    }
}

/// Append-only ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditTransaction {
    pub id: TransactionId,
    pub account_id: AccountId,
    pub action_type: ActionType,
    pub credits_consumed: u32,
    pub credits_added: u32,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_id: Option<String>,
    pub transaction_hash: String,
    pub created_at: DateTime<Utc>,
}

/// Durable record of a completed search. Upgrades rewrite the tier and payload in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHistoryRecord {
    pub id: HistoryId,
    pub account_id: AccountId,
    pub address: String,
    pub coordinates: Coordinates,
    pub search_type: SearchType,
    pub credits_used: u32,
    pub result_payload: Value,
    pub transaction_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Inbound request from the search UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub address: String,
    pub search_type: SearchType,
    pub latitude: f64,
    pub longitude: f64,
}

impl SearchRequest {
    pub fn new(
        address: impl Into<String>,
        search_type: SearchType,
        latitude: f64,
        longitude: f64,
    ) -> Self {
        Self {
            address: address.into(),
            search_type,
            latitude,
            longitude,
        }
    }

    pub fn coordinates(&self) -> Coordinates {
        Coordinates {
            latitude: self.latitude,
            longitude: self.longitude,
        }
    }
}

/// Outcome handed back to the caller after a consistent run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub success: bool,
    pub search_type: SearchType,
    pub credits_used: u32,
    pub history_id: HistoryId,
    pub data: Value,
    /// Set when the request matched an already recorded search and nothing new was charged.
    pub replayed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_credits: Option<u64>,
}

/// Collapses whitespace and case so equivalent spellings fingerprint the same.
pub fn normalize_address(address: &str) -> String {
    address
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_address_collapses_whitespace_and_case() {
        assert_eq!(
            normalize_address("  123 Main   St,\tMinneapolis, MN 55401 "),
            "123 main st, minneapolis, mn 55401"
        );
    }

    #[test]
    fn coordinates_reject_out_of_range_values() {
        assert!(Coordinates {
            latitude: 44.9778,
            longitude: -93.265
        }
        .is_valid());
        assert!(!Coordinates {
            latitude: 91.0,
            longitude: 0.0
        }
        .is_valid());
        assert!(!Coordinates {
            latitude: f64::NAN,
            longitude: 0.0
        }
        .is_valid());
    }

    #[test]
    fn balance_consistency_tracks_earned_minus_spent() {
        let mut balance = CreditBalance {
            account_id: AccountId("acct-1".to_string()),
            available_credits: 4,
            total_earned: 5,
            total_spent: 1,
            last_updated: Utc::now(),
        };
        assert!(balance.is_consistent());
        balance.available_credits = 5;
        assert!(!balance.is_consistent());
    }

    #[test]
    fn search_type_serializes_as_snake_case() {
        let json = serde_json::to_value(SearchType::Smart).expect("serializes");
        assert_eq!(json, serde_json::json!("smart"));
        assert_eq!("basic".parse::<SearchType>(), Ok(SearchType::Basic));
        assert!("premium".parse::<SearchType>().is_err());
        assert_eq!(
            "subscription_renewal".parse::<ActionType>(),
            Ok(ActionType::SubscriptionRenewal)
        );
    }
}
