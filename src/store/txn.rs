use chrono::NaiveDate;
use sea_query::{Expr, Iden, Order, Query, SqliteQueryBuilder};
use sea_query_binder::SqlxBinder;
use sqlx::{FromRow, Row};
use ulid::Ulid;

use super::{map_insert_error, Error, Result, SqliteStore};
use crate::core::{CategoryRef, NewTransaction, PredefinedCategory, Transaction};

#[derive(Iden)]
enum Transactions {
    Table,
    Id,
    AccountId,
    ExternalId,
    AmountMiliunits,
    Payee,
    Date,
    CategoryId,
    PredefinedCategory,
    Notes,
}

const COLUMNS: [Transactions; 9] = [
    Transactions::Id,
    Transactions::AccountId,
    Transactions::ExternalId,
    Transactions::AmountMiliunits,
    Transactions::Payee,
    Transactions::Date,
    Transactions::CategoryId,
    Transactions::PredefinedCategory,
    Transactions::Notes,
];

#[derive(Debug, Clone)]
pub struct PendingCount {
    pub account_id: String,
    pub pending: i64,
}

pub struct Store<'a>(&'a mut SqliteStore);

impl<'a> Store<'a> {
    pub fn new(store: &'a mut SqliteStore) -> Self {
        Self(store)
    }

    /// Atomic check-and-insert: the UNIQUE index on external_id is the
    /// de-duplication arbiter, so concurrent syncs cannot double-insert.
    /// A duplicate surfaces as `AlreadyExists`.
    pub async fn save(&mut self, record: &NewTransaction) -> Result<Transaction> {
        let id = Ulid::new().to_string();

        let (query, values) = Query::insert()
            .into_table(Transactions::Table)
            .columns(COLUMNS)
            .values_panic(vec![
                id.as_str().into(),
                record.account_id.as_str().into(),
                record.external_id.as_deref().into(),
                record.amount_miliunits.into(),
                record.payee.as_str().into(),
                record.date.format("%Y-%m-%d").to_string().into(),
                Option::<String>::None.into(),
                Option::<String>::None.into(),
                record.notes.as_deref().into(),
            ])
            .build_sqlx(SqliteQueryBuilder);

        sqlx::query_with(&query, values)
            .execute(&mut self.0.conn.acquire().await?)
            .await
            .map_err(map_insert_error)?;

        Ok(Transaction {
            id,
            account_id: record.account_id.clone(),
            external_id: record.external_id.clone(),
            amount_miliunits: record.amount_miliunits,
            payee: record.payee.clone(),
            date: record.date,
            category: None,
            notes: record.notes.clone(),
        })
    }

    pub async fn by_external_id(&mut self, external_id: &str) -> Result<Option<Transaction>> {
        let (query, values) = Query::select()
            .columns(COLUMNS)
            .from(Transactions::Table)
            .and_where(Expr::col(Transactions::ExternalId).eq(external_id))
            .build_sqlx(SqliteQueryBuilder);

        let row = sqlx::query_with(&query, values)
            .fetch_optional(&mut self.0.conn.acquire().await?)
            .await?;

        row.map(|row| Transaction::from_row(&row).map_err(Into::into))
            .transpose()
    }

    pub async fn list_by_account(&mut self, account_id: &str) -> Result<Vec<Transaction>> {
        let (query, values) = Query::select()
            .columns(COLUMNS)
            .from(Transactions::Table)
            .and_where(Expr::col(Transactions::AccountId).eq(account_id))
            .order_by(Transactions::Date, Order::Asc)
            .build_sqlx(SqliteQueryBuilder);

        let rows = sqlx::query_with(&query, values)
            .fetch_all(&mut self.0.conn.acquire().await?)
            .await?;

        let mut txns = Vec::with_capacity(rows.len());
        for row in rows {
            txns.push(Transaction::from_row(&row)?);
        }

        Ok(txns)
    }

    /// Exactly one of the two category kinds is written; the other column
    /// is cleared so the row never carries both.
    pub async fn assign_category(&mut self, id: &str, category: &CategoryRef) -> Result<()> {
        let (user_category, predefined) = match category {
            CategoryRef::User(category_id) => (Some(category_id.as_str()), None),
            CategoryRef::Predefined(predefined) => (None, Some(predefined.as_str())),
        };

        let (query, values) = Query::update()
            .table(Transactions::Table)
            .values(vec![
                (Transactions::CategoryId, user_category.into()),
                (Transactions::PredefinedCategory, predefined.into()),
            ])
            .and_where(Expr::col(Transactions::Id).eq(id))
            .build_sqlx(SqliteQueryBuilder);

        let result = sqlx::query_with(&query, values)
            .execute(&mut self.0.conn.acquire().await?)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound);
        }

        Ok(())
    }

    /// A bounded batch of transactions with no category of either kind,
    /// oldest first, for the categorization worker.
    pub async fn pending_batch(&mut self, limit: usize) -> Result<Vec<Transaction>> {
        let (query, values) = Query::select()
            .columns(COLUMNS)
            .from(Transactions::Table)
            .and_where(Expr::col(Transactions::CategoryId).is_null())
            .and_where(Expr::col(Transactions::PredefinedCategory).is_null())
            .order_by(Transactions::Date, Order::Asc)
            .limit(limit as u64)
            .build_sqlx(SqliteQueryBuilder);

        let rows = sqlx::query_with(&query, values)
            .fetch_all(&mut self.0.conn.acquire().await?)
            .await?;

        let mut txns = Vec::with_capacity(rows.len());
        for row in rows {
            txns.push(Transaction::from_row(&row)?);
        }

        Ok(txns)
    }

    pub async fn pending_count(&mut self, account_id: &str) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(id) AS pending FROM transactions \
             WHERE account_id = $1 AND category_id IS NULL AND predefined_category IS NULL",
        )
        .bind(account_id)
        .fetch_one(&mut self.0.conn.acquire().await?)
        .await?;

        Ok(row.try_get("pending")?)
    }

    /// Per-account pending totals for one user, accounts with nothing
    /// pending omitted.
    pub async fn pending_counts(&mut self, user_id: &str) -> Result<Vec<PendingCount>> {
        let rows = sqlx::query(
            "SELECT t.account_id AS account_id, COUNT(t.id) AS pending \
             FROM transactions t \
             JOIN accounts a ON a.id = t.account_id \
             WHERE a.user_id = $1 \
               AND t.category_id IS NULL \
               AND t.predefined_category IS NULL \
             GROUP BY t.account_id \
             ORDER BY t.account_id",
        )
        .bind(user_id)
        .fetch_all(&mut self.0.conn.acquire().await?)
        .await?;

        let mut counts = Vec::with_capacity(rows.len());
        for row in rows {
            counts.push(PendingCount {
                account_id: row.try_get("account_id")?,
                pending: row.try_get("pending")?,
            });
        }

        Ok(counts)
    }
}

impl<'r, R: sqlx::Row> sqlx::FromRow<'r, R> for Transaction
where
    std::string::String: sqlx::Decode<'r, <R as Row>::Database> + sqlx::Type<<R as Row>::Database>,
    Option<String>: sqlx::Decode<'r, <R as Row>::Database> + sqlx::Type<<R as Row>::Database>,
    i64: sqlx::Decode<'r, <R as Row>::Database> + sqlx::Type<<R as Row>::Database>,
    &'static str: sqlx::ColumnIndex<R>,
{
    fn from_row(row: &'r R) -> ::std::result::Result<Self, sqlx::Error> {
        let date = NaiveDate::parse_from_str(row.try_get::<'_, String, _>("date")?.as_str(), "%Y-%m-%d")
            .map_err(|e| sqlx::Error::ColumnDecode {
                index: "date".into(),
                source: Box::new(e),
            })?;

        let category = match (
            row.try_get::<'_, Option<String>, _>("category_id")?,
            row.try_get::<'_, Option<String>, _>("predefined_category")?,
        ) {
            (Some(category_id), _) => Some(CategoryRef::User(category_id)),
            (None, Some(label)) => {
                let predefined =
                    PredefinedCategory::parse(&label).ok_or_else(|| sqlx::Error::ColumnDecode {
                        index: "predefined_category".into(),
                        source: format!("unknown predefined category {label:?}").into(),
                    })?;
                Some(CategoryRef::Predefined(predefined))
            }
            (None, None) => None,
        };

        Ok(Transaction {
            id: row.try_get("id")?,
            account_id: row.try_get("account_id")?,
            external_id: row.try_get("external_id")?,
            amount_miliunits: row.try_get("amount_miliunits")?,
            payee: row.try_get("payee")?,
            date,
            category,
            notes: row.try_get("notes")?,
        })
    }
}
