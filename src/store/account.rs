use chrono::{DateTime, Utc};
use sea_query::{Expr, Iden, Order, Query, SqliteQueryBuilder};
use sea_query_binder::SqlxBinder;
use sqlx::{FromRow, Row};
use ulid::Ulid;

use super::{map_insert_error, parse_timestamp, Error, Result, SqliteStore};
use crate::core::{Account, BalanceSnapshot};

#[derive(Iden)]
enum Accounts {
    Table,
    Id,
    UserId,
    ExternalId,
    Name,
    Institution,
    Currency,
    LastSyncedAt,
}

#[derive(Iden)]
enum AccountBalances {
    Table,
    Id,
    AccountId,
    CurrentMiliunits,
    AvailableMiliunits,
    Currency,
    AsOf,
}

const COLUMNS: [Accounts; 7] = [
    Accounts::Id,
    Accounts::UserId,
    Accounts::ExternalId,
    Accounts::Name,
    Accounts::Institution,
    Accounts::Currency,
    Accounts::LastSyncedAt,
];

/// Result of reconciling one external account against local state.
#[derive(Debug, Clone)]
pub struct Reconciled {
    pub account: Account,
    pub created: bool,
}

pub struct Store<'a>(&'a mut SqliteStore);

impl<'a> Store<'a> {
    pub fn new(store: &'a mut SqliteStore) -> Self {
        Self(store)
    }

    /// Create-or-update keyed on (user_id, external_id). The insert runs
    /// first; losing the race to the unique index downgrades to an update
    /// of the display fields. Ownership is never reassigned.
    pub async fn upsert(&mut self, candidate: &Account) -> Result<Reconciled> {
        match self.insert(candidate).await {
            Ok(()) => Ok(Reconciled {
                account: candidate.clone(),
                created: true,
            }),
            Err(Error::AlreadyExists) => {
                self.update_display(candidate).await?;

                let account = self
                    .by_external_id(&candidate.user_id, &candidate.external_id)
                    .await?
                    .ok_or(Error::NotFound)?;

                Ok(Reconciled {
                    account,
                    created: false,
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn insert(&mut self, account: &Account) -> Result<()> {
        let (query, values) = Query::insert()
            .into_table(Accounts::Table)
            .columns(COLUMNS)
            .values_panic(vec![
                account.id.as_str().into(),
                account.user_id.as_str().into(),
                account.external_id.as_str().into(),
                account.name.as_str().into(),
                account.institution.as_str().into(),
                account.currency.as_str().into(),
                account.last_synced_at.map(|at| at.to_rfc3339()).into(),
            ])
            .build_sqlx(SqliteQueryBuilder);

        sqlx::query_with(&query, values)
            .execute(&mut self.0.conn.acquire().await?)
            .await
            .map_err(map_insert_error)?;

        Ok(())
    }

    async fn update_display(&mut self, account: &Account) -> Result<()> {
        let (query, values) = Query::update()
            .table(Accounts::Table)
            .values(vec![
                (Accounts::Name, account.name.as_str().into()),
                (Accounts::Institution, account.institution.as_str().into()),
            ])
            .and_where(Expr::col(Accounts::UserId).eq(account.user_id.as_str()))
            .and_where(Expr::col(Accounts::ExternalId).eq(account.external_id.as_str()))
            .build_sqlx(SqliteQueryBuilder);

        sqlx::query_with(&query, values)
            .execute(&mut self.0.conn.acquire().await?)
            .await?;

        Ok(())
    }

    pub async fn by_external_id(
        &mut self,
        user_id: &str,
        external_id: &str,
    ) -> Result<Option<Account>> {
        let (query, values) = Query::select()
            .columns(COLUMNS)
            .from(Accounts::Table)
            .and_where(Expr::col(Accounts::UserId).eq(user_id))
            .and_where(Expr::col(Accounts::ExternalId).eq(external_id))
            .build_sqlx(SqliteQueryBuilder);

        let row = sqlx::query_with(&query, values)
            .fetch_optional(&mut self.0.conn.acquire().await?)
            .await?;

        row.map(|row| Account::from_row(&row).map_err(Into::into))
            .transpose()
    }

    pub async fn by_id(&mut self, id: &str) -> Result<Option<Account>> {
        let (query, values) = Query::select()
            .columns(COLUMNS)
            .from(Accounts::Table)
            .and_where(Expr::col(Accounts::Id).eq(id))
            .build_sqlx(SqliteQueryBuilder);

        let row = sqlx::query_with(&query, values)
            .fetch_optional(&mut self.0.conn.acquire().await?)
            .await?;

        row.map(|row| Account::from_row(&row).map_err(Into::into))
            .transpose()
    }

    pub async fn list(&mut self, user_id: &str) -> Result<Vec<Account>> {
        let (query, values) = Query::select()
            .columns(COLUMNS)
            .from(Accounts::Table)
            .and_where(Expr::col(Accounts::UserId).eq(user_id))
            .order_by(Accounts::Name, Order::Asc)
            .build_sqlx(SqliteQueryBuilder);

        let rows = sqlx::query_with(&query, values)
            .fetch_all(&mut self.0.conn.acquire().await?)
            .await?;

        let mut accounts = Vec::with_capacity(rows.len());
        for row in rows {
            accounts.push(Account::from_row(&row)?);
        }

        Ok(accounts)
    }

    pub async fn mark_synced(&mut self, id: &str, at: DateTime<Utc>) -> Result<()> {
        let (query, values) = Query::update()
            .table(Accounts::Table)
            .values(vec![(Accounts::LastSyncedAt, at.to_rfc3339().into())])
            .and_where(Expr::col(Accounts::Id).eq(id))
            .build_sqlx(SqliteQueryBuilder);

        sqlx::query_with(&query, values)
            .execute(&mut self.0.conn.acquire().await?)
            .await?;

        Ok(())
    }

    /// Balance snapshots are append-only; callers never update in place.
    pub async fn record_balance(&mut self, snapshot: &BalanceSnapshot) -> Result<()> {
        let (query, values) = Query::insert()
            .into_table(AccountBalances::Table)
            .columns([
                AccountBalances::Id,
                AccountBalances::AccountId,
                AccountBalances::CurrentMiliunits,
                AccountBalances::AvailableMiliunits,
                AccountBalances::Currency,
                AccountBalances::AsOf,
            ])
            .values_panic(vec![
                Ulid::new().to_string().into(),
                snapshot.account_id.as_str().into(),
                snapshot.current_miliunits.into(),
                snapshot.available_miliunits.into(),
                snapshot.currency.as_str().into(),
                snapshot.as_of.to_rfc3339().into(),
            ])
            .build_sqlx(SqliteQueryBuilder);

        sqlx::query_with(&query, values)
            .execute(&mut self.0.conn.acquire().await?)
            .await?;

        Ok(())
    }

    pub async fn latest_balance(&mut self, account_id: &str) -> Result<Option<BalanceSnapshot>> {
        let (query, values) = Query::select()
            .columns([
                AccountBalances::AccountId,
                AccountBalances::CurrentMiliunits,
                AccountBalances::AvailableMiliunits,
                AccountBalances::Currency,
                AccountBalances::AsOf,
            ])
            .from(AccountBalances::Table)
            .and_where(Expr::col(AccountBalances::AccountId).eq(account_id))
            .order_by(AccountBalances::AsOf, Order::Desc)
            .limit(1)
            .build_sqlx(SqliteQueryBuilder);

        let row = sqlx::query_with(&query, values)
            .fetch_optional(&mut self.0.conn.acquire().await?)
            .await?;

        match row {
            Some(row) => Ok(Some(BalanceSnapshot {
                account_id: row.try_get("account_id")?,
                current_miliunits: row.try_get("current_miliunits")?,
                available_miliunits: row.try_get("available_miliunits")?,
                currency: row.try_get("currency")?,
                as_of: parse_timestamp(row.try_get("as_of")?)?,
            })),
            None => Ok(None),
        }
    }
}

impl<'r, R: sqlx::Row> sqlx::FromRow<'r, R> for Account
where
    std::string::String: sqlx::Decode<'r, <R as Row>::Database> + sqlx::Type<<R as Row>::Database>,
    Option<String>: sqlx::Decode<'r, <R as Row>::Database> + sqlx::Type<<R as Row>::Database>,
    &'static str: sqlx::ColumnIndex<R>,
{
    fn from_row(row: &'r R) -> ::std::result::Result<Self, sqlx::Error> {
        let last_synced_at = row
            .try_get::<'_, Option<String>, _>("last_synced_at")?
            .map(|raw| {
                parse_timestamp(&raw).map_err(|e| sqlx::Error::ColumnDecode {
                    index: "last_synced_at".into(),
                    source: e.into(),
                })
            })
            .transpose()?;

        Ok(Account {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            external_id: row.try_get("external_id")?,
            name: row.try_get("name")?,
            institution: row.try_get("institution")?,
            currency: row.try_get("currency")?,
            last_synced_at,
        })
    }
}
