pub mod truelayer;

use std::time::Duration;

use axum::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("authorization code is invalid or already used")]
    InvalidOrExpiredCode,
    #[error("access token is invalid or revoked; reconnect the bank")]
    TokenInvalid,
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    #[error("provider rate limit reached, retry in {}s", reset_in.as_secs())]
    RateLimited { reset_in: Duration },
}

impl Error {
    /// Transient errors may be retried with backoff; everything else
    /// requires caller intervention.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Unavailable(_))
    }
}

/// Token pair returned by the authorization-code exchange.
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub connection_id: String,
}

/// An account as reported by the provider, validated at the boundary.
#[derive(Debug, Clone)]
pub struct ProviderAccount {
    pub external_id: String,
    pub name: String,
    pub institution: String,
    pub currency: String,
}

#[derive(Debug, Clone)]
pub struct ProviderBalance {
    pub current: Decimal,
    pub available: Option<Decimal>,
    pub currency: String,
}

#[derive(Debug, Clone)]
pub struct ProviderTransaction {
    pub external_id: String,
    pub payee: String,
    pub amount: Decimal,
    pub date: NaiveDate,
}

/// One page of transaction history. `total_count` covers the whole range
/// so partial ingestion can report requested versus persisted counts.
#[derive(Debug, Clone)]
pub struct TransactionsPage {
    pub results: Vec<ProviderTransaction>,
    pub total_count: usize,
    pub next_page: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct DateRange {
    /// Inclusive start; `None` requests the provider's full history.
    pub from: Option<NaiveDate>,
    pub to: NaiveDate,
}

#[async_trait]
pub trait TokenSource {
    async fn exchange_code(&self, code: &str) -> Result<TokenGrant, Error>;
    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenGrant, Error>;
}

#[async_trait]
pub trait AccountSource {
    async fn accounts(&self, access_token: &str) -> Result<Vec<ProviderAccount>, Error>;
    async fn balance(&self, access_token: &str, external_id: &str)
        -> Result<ProviderBalance, Error>;
}

#[async_trait]
pub trait TransactionSource {
    async fn transactions(
        &self,
        access_token: &str,
        external_id: &str,
        range: &DateRange,
        page: Option<&str>,
    ) -> Result<TransactionsPage, Error>;
}
