//! Interfaces of the services the pipeline consumes but does not own.

use crate::batch::RetryClassify;
use crate::enrichment::EnrichmentJob;
use crate::VectorType;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use retry_utils::RetryableError;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenBalance {
    pub mint: String,
    pub amount: Decimal,
    pub usd_value: Option<Decimal>,
}

/// Token holdings of one wallet at a point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub wallet: String,
    pub tokens: Vec<TokenBalance>,
    pub fetched_at: DateTime<Utc>,
}

impl BalanceSnapshot {
    pub fn total_usd_value(&self) -> Decimal {
        self.tokens.iter().filter_map(|t| t.usd_value).sum()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncOptions {
    /// Re-sync even if the wallet is fresh
    pub force: bool,
    /// Incremental sync starting point, if the wallet was synced before
    pub since: Option<DateTime<Utc>>,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChainClientError {
    #[error("Rate limited: {0}")]
    RateLimited(String),
    #[error("Data source unavailable: {0}")]
    Unavailable(String),
    #[error("Invalid wallet {wallet}: {reason}")]
    InvalidSubject { wallet: String, reason: String },
    #[error("{0}")]
    Other(String),
}

impl RetryClassify for ChainClientError {
    fn retry_class(&self) -> RetryableError {
        match self {
            ChainClientError::RateLimited(_) => RetryableError::RateLimit,
            ChainClientError::InvalidSubject { .. } => RetryableError::Permanent,
            ChainClientError::Unavailable(_) | ChainClientError::Other(_) => {
                RetryableError::Transient
            }
        }
    }
}

/// Failure reported by the similarity engine or metadata enricher
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{0}")]
pub struct CollaboratorError(pub String);

#[async_trait]
pub trait BlockchainDataClient: Send + Sync {
    async fn fetch_balances(
        &self,
        wallets: &[String],
    ) -> std::result::Result<HashMap<String, BalanceSnapshot>, ChainClientError>;

    async fn sync_history(
        &self,
        wallet: &str,
        options: &SyncOptions,
    ) -> std::result::Result<(), ChainClientError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletPairScore {
    pub wallet_a: String,
    pub wallet_b: String,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityResult {
    pub vector_type: VectorType,
    pub pairs: Vec<WalletPairScore>,
    /// Engine-specific extras (clusters, shared tokens, ...)
    #[serde(default)]
    pub details: serde_json::Value,
}

#[async_trait]
pub trait SimilarityEngine: Send + Sync {
    /// `Ok(None)` means the balances did not carry enough signal to score.
    async fn compute(
        &self,
        wallets: &[String],
        vector_type: VectorType,
        balances: &HashMap<String, BalanceSnapshot>,
    ) -> std::result::Result<Option<SimilarityResult>, CollaboratorError>;
}

#[async_trait]
pub trait MetadataEnricher: Send + Sync {
    async fn enrich(&self, job: &EnrichmentJob) -> std::result::Result<(), CollaboratorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_errors_map_to_retry_classes() {
        assert_eq!(
            ChainClientError::RateLimited("429".into()).retry_class(),
            RetryableError::RateLimit
        );
        assert_eq!(
            ChainClientError::InvalidSubject {
                wallet: "w".into(),
                reason: "not a wallet".into()
            }
            .retry_class(),
            RetryableError::Permanent
        );
        assert_eq!(
            ChainClientError::Unavailable("503".into()).retry_class(),
            RetryableError::Transient
        );
    }

    #[test]
    fn test_snapshot_total_ignores_unpriced_tokens() {
        let snapshot = BalanceSnapshot {
            wallet: "w".to_string(),
            tokens: vec![
                TokenBalance {
                    mint: "a".to_string(),
                    amount: Decimal::new(15, 1),
                    usd_value: Some(Decimal::new(300, 2)),
                },
                TokenBalance {
                    mint: "b".to_string(),
                    amount: Decimal::ONE,
                    usd_value: None,
                },
            ],
            fetched_at: Utc::now(),
        };
        assert_eq!(snapshot.total_usd_value(), Decimal::new(3, 0));
    }
}
