use std::time::Duration;

use chrono::{NaiveDate, Utc};
use thiserror::Error;
use tracing::{info, warn};
use ulid::Ulid;

use crate::core::{money, Account, BalanceSnapshot, Connection, ConnectionStatus, NewTransaction};
use crate::provider::{
    self, AccountSource, DateRange, ProviderAccount, TokenGrant, TokenSource, TransactionSource,
    TransactionsPage,
};
use crate::store::{Error as StoreError, SqliteStore};

const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Provider(#[from] provider::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// How far back an ingestion run should look.
#[derive(Debug, Clone, Copy)]
pub enum RefreshWindow {
    /// Since the account's last successful sync; full history when the
    /// account has never synced.
    Incremental,
    /// Re-walk the provider's full history, still honoring de-duplication.
    Full,
    /// An explicit caller-supplied range.
    Range(DateRange),
}

impl RefreshWindow {
    fn resolve(&self, account: &Account) -> DateRange {
        match self {
            RefreshWindow::Incremental => DateRange {
                from: account.last_synced_at.map(|at| at.naive_utc().date()),
                to: today(),
            },
            RefreshWindow::Full => DateRange {
                from: None,
                to: today(),
            },
            RefreshWindow::Range(range) => *range,
        }
    }
}

fn today() -> NaiveDate {
    Utc::now().naive_utc().date()
}

/// Result of reconciling the provider's account list.
#[derive(Debug)]
pub struct Discovery {
    pub accounts: Vec<Account>,
    pub created: usize,
    pub updated: usize,
}

/// Per-account ingestion accounting. `requested` is the total the provider
/// reported for the range, so a mid-run failure still tells the caller how
/// much work remains. Persisted rows stay committed regardless of `error`.
#[derive(Debug, Default)]
pub struct IngestOutcome {
    pub requested: usize,
    pub ingested: usize,
    pub skipped: usize,
    pub error: Option<SyncError>,
}

impl IngestOutcome {
    pub fn succeeded(&self) -> usize {
        self.ingested + self.skipped
    }
}

#[derive(Debug, Default)]
pub struct SyncReport {
    pub accounts_synced: usize,
    pub accounts_created: usize,
    pub transactions_ingested: usize,
    pub transactions_skipped: usize,
    pub errors: Vec<String>,
}

pub struct Engine<P> {
    provider: P,
}

impl<P> Engine<P>
where
    P: TokenSource + AccountSource + TransactionSource,
{
    pub fn new(provider: P) -> Self {
        Self { provider }
    }

    /// Exchanges a one-time authorization code and persists the resulting
    /// connection for the user.
    ///
    /// The redirect callback is known to fire twice on remount; when the
    /// second exchange fails with `InvalidOrExpiredCode` but the user
    /// already holds a live connection, that connection is returned instead
    /// of the error.
    #[tracing::instrument(skip(self, store, code))]
    pub async fn exchange_token(
        &self,
        store: &mut SqliteStore,
        user_id: &str,
        code: &str,
    ) -> Result<Connection, SyncError> {
        match self.provider.exchange_code(code).await {
            Ok(grant) => Ok(self.persist_grant(store, user_id, grant).await?),
            Err(provider::Error::InvalidOrExpiredCode) => {
                match store.connections().active_for_user(user_id).await? {
                    Some(existing) => {
                        info!(
                            connection = %existing.provider_connection_id,
                            "duplicate exchange for an already-linked user, returning existing connection"
                        );
                        Ok(existing)
                    }
                    None => Err(provider::Error::InvalidOrExpiredCode.into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    pub(crate) async fn persist_grant(
        &self,
        store: &mut SqliteStore,
        user_id: &str,
        grant: TokenGrant,
    ) -> Result<Connection, StoreError> {
        let existing = store
            .connections()
            .by_provider_id(user_id, &grant.connection_id)
            .await?;

        match existing {
            Some(mut connection) => {
                connection.access_token = grant.access_token;
                if grant.refresh_token.is_some() {
                    connection.refresh_token = grant.refresh_token;
                }
                connection.expires_at = grant.expires_at;
                connection.status = ConnectionStatus::Active;
                store.connections().update(&connection).await?;

                Ok(connection)
            }
            None => {
                let connection = Connection {
                    id: Ulid::new().to_string(),
                    user_id: user_id.to_string(),
                    provider_connection_id: grant.connection_id,
                    access_token: grant.access_token,
                    refresh_token: grant.refresh_token,
                    expires_at: grant.expires_at,
                    status: ConnectionStatus::Active,
                };
                store.connections().save(&connection).await?;

                Ok(connection)
            }
        }
    }

    /// Rotates the access token through the refresh grant when the stored
    /// one has expired.
    pub async fn ensure_fresh_token(
        &self,
        store: &mut SqliteStore,
        connection: &Connection,
    ) -> Result<Connection, SyncError> {
        if !connection.token_expired(Utc::now()) {
            return Ok(connection.clone());
        }

        let refresh_token = match &connection.refresh_token {
            Some(token) => token.clone(),
            None => return Err(provider::Error::TokenInvalid.into()),
        };

        let grant = self.provider.refresh_token(&refresh_token).await?;
        let refreshed = self
            .persist_grant(store, &connection.user_id, grant)
            .await?;

        Ok(refreshed)
    }

    /// Fetches the provider's account list and reconciles it against local
    /// rows. Reconciliation is order-independent; the (user, external id)
    /// unique index serializes racing writers.
    #[tracing::instrument(skip(self, store, connection), fields(connection = %connection.provider_connection_id))]
    pub async fn discover_accounts(
        &self,
        store: &mut SqliteStore,
        connection: &Connection,
    ) -> Result<Discovery, SyncError> {
        let external = match self.fetch_accounts(&connection.access_token).await {
            Ok(accounts) => accounts,
            Err(provider::Error::TokenInvalid) => {
                // Reconnection is a user decision; record the degradation
                // and surface the error instead of retrying.
                let mut degraded = connection.clone();
                degraded.status = ConnectionStatus::Degraded("access token rejected".into());
                store.connections().update(&degraded).await?;

                return Err(provider::Error::TokenInvalid.into());
            }
            Err(e) => return Err(e.into()),
        };

        let mut discovery = Discovery {
            accounts: Vec::with_capacity(external.len()),
            created: 0,
            updated: 0,
        };

        for account in external {
            let candidate = Account {
                id: Ulid::new().to_string(),
                user_id: connection.user_id.clone(),
                external_id: account.external_id.clone(),
                name: account.name.clone(),
                institution: account.institution.clone(),
                currency: account.currency.clone(),
                last_synced_at: None,
            };

            let reconciled = store.accounts().upsert(&candidate).await?;
            if reconciled.created {
                discovery.created += 1;
            } else {
                discovery.updated += 1;
            }

            self.snapshot_balance(store, connection, &account, &reconciled.account)
                .await;

            discovery.accounts.push(reconciled.account);
        }

        Ok(discovery)
    }

    /// Balance snapshots are best-effort; a failed read must not abort
    /// discovery of the remaining accounts.
    async fn snapshot_balance(
        &self,
        store: &mut SqliteStore,
        connection: &Connection,
        external: &ProviderAccount,
        account: &Account,
    ) {
        let balance = match self
            .provider
            .balance(&connection.access_token, &external.external_id)
            .await
        {
            Ok(balance) => balance,
            Err(e) => {
                warn!(account = %external.external_id, error = %e, "skipping balance snapshot");
                return;
            }
        };

        let current = money::to_miliunits(balance.current);
        let available = balance.available.and_then(money::to_miliunits);
        let current = match current {
            Some(units) => units,
            None => {
                warn!(account = %external.external_id, "balance out of range, skipping snapshot");
                return;
            }
        };

        let snapshot = BalanceSnapshot {
            account_id: account.id.clone(),
            current_miliunits: current,
            available_miliunits: available,
            currency: balance.currency,
            as_of: Utc::now(),
        };

        if let Err(e) = store.accounts().record_balance(&snapshot).await {
            warn!(account = %account.id, error = %e, "failed to record balance snapshot");
        }
    }

    /// Pulls the account's transaction history page by page, normalizing
    /// amounts to miliunits and de-duplicating on external id. Earlier
    /// pages stay committed when a later page fails; `last_synced_at` is
    /// only stamped after a clean run.
    #[tracing::instrument(skip(self, store, connection, account), fields(account = %account.external_id))]
    pub async fn ingest_transactions(
        &self,
        store: &mut SqliteStore,
        connection: &Connection,
        account: &Account,
        window: RefreshWindow,
    ) -> IngestOutcome {
        let range = window.resolve(account);
        let mut outcome = IngestOutcome::default();
        let mut page_token: Option<String> = None;

        loop {
            let page = match self
                .fetch_transactions_page(connection, account, &range, page_token.as_deref())
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    outcome.error = Some(e.into());
                    return outcome;
                }
            };

            if outcome.requested == 0 {
                outcome.requested = page.total_count.max(page.results.len());
            }

            for txn in &page.results {
                let amount = match money::to_miliunits(txn.amount) {
                    Some(units) => units,
                    None => {
                        outcome.error = Some(
                            provider::Error::Unavailable(format!(
                                "transaction {} amount out of range",
                                txn.external_id
                            ))
                            .into(),
                        );
                        return outcome;
                    }
                };

                let record = NewTransaction {
                    account_id: account.id.clone(),
                    external_id: Some(txn.external_id.clone()),
                    amount_miliunits: amount,
                    payee: txn.payee.clone(),
                    date: txn.date,
                    notes: None,
                };

                match store.txns().save(&record).await {
                    Ok(_) => outcome.ingested += 1,
                    Err(StoreError::AlreadyExists) => {
                        info!(external_id = %txn.external_id, "transaction already present, skipping");
                        outcome.skipped += 1;
                    }
                    Err(e) => {
                        outcome.error = Some(e.into());
                        return outcome;
                    }
                }
            }

            match page.next_page {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }

        if let Err(e) = store.accounts().mark_synced(&account.id, Utc::now()).await {
            outcome.error = Some(e.into());
        }

        outcome
    }

    /// The full pipeline for one connection: discovery, then per-account
    /// ingestion, strictly in that order. A failing account does not stop
    /// the others; its error lands in the report.
    #[tracing::instrument(skip(self, store, connection), fields(connection = %connection.provider_connection_id))]
    pub async fn sync(
        &self,
        store: &mut SqliteStore,
        connection: &Connection,
        window: RefreshWindow,
    ) -> Result<SyncReport, SyncError> {
        let connection = self.ensure_fresh_token(store, connection).await?;
        let discovery = self.discover_accounts(store, &connection).await?;

        let mut report = SyncReport {
            accounts_synced: discovery.accounts.len(),
            accounts_created: discovery.created,
            ..SyncReport::default()
        };

        for account in &discovery.accounts {
            let outcome = self
                .ingest_transactions(store, &connection, account, window)
                .await;

            report.transactions_ingested += outcome.ingested;
            report.transactions_skipped += outcome.skipped;
            if let Some(ref e) = outcome.error {
                report.errors.push(format!(
                    "{}: {} ({} of {} ingested)",
                    account.name,
                    e,
                    outcome.succeeded(),
                    outcome.requested
                ));
            }
        }

        Ok(report)
    }

    async fn fetch_accounts(
        &self,
        access_token: &str,
    ) -> Result<Vec<ProviderAccount>, provider::Error> {
        let mut attempt = 0;
        loop {
            match self.provider.accounts(access_token).await {
                Ok(accounts) => return Ok(accounts),
                Err(e) if e.is_transient() && attempt + 1 < MAX_ATTEMPTS => {
                    attempt += 1;
                    warn!(error = %e, attempt, "account fetch failed, backing off");
                    tokio::time::sleep(BACKOFF_BASE * 2u32.pow(attempt - 1)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fetch_transactions_page(
        &self,
        connection: &Connection,
        account: &Account,
        range: &DateRange,
        page: Option<&str>,
    ) -> Result<TransactionsPage, provider::Error> {
        let mut attempt = 0;
        loop {
            match self
                .provider
                .transactions(&connection.access_token, &account.external_id, range, page)
                .await
            {
                Ok(page) => return Ok(page),
                Err(e) if e.is_transient() && attempt + 1 < MAX_ATTEMPTS => {
                    attempt += 1;
                    warn!(error = %e, attempt, "transaction page fetch failed, backing off");
                    tokio::time::sleep(BACKOFF_BASE * 2u32.pow(attempt - 1)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
