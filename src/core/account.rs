use chrono::{DateTime, Utc};

/// A financial account owned by a user. At most one row exists per
/// (user_id, external_id) pair; discovery updates display fields only.
#[derive(Debug, Clone)]
pub struct Account {
    pub id: String,
    pub user_id: String,
    pub external_id: String,
    pub name: String,
    pub institution: String,
    pub currency: String,
    pub last_synced_at: Option<DateTime<Utc>>,
}

/// A timestamped balance snapshot. Rows are append-only; the newest
/// `as_of` per account is the authoritative current balance.
#[derive(Debug, Clone)]
pub struct BalanceSnapshot {
    pub account_id: String,
    pub current_miliunits: i64,
    pub available_miliunits: Option<i64>,
    pub currency: String,
    pub as_of: DateTime<Utc>,
}
