use sea_query::{Expr, Iden, Query, SqliteQueryBuilder};
use sea_query_binder::SqlxBinder;
use sqlx::{FromRow, Row};

use super::{map_insert_error, parse_timestamp, Result, SqliteStore};
use crate::core::{Connection, ConnectionStatus};

#[derive(Iden)]
enum Connections {
    Table,
    Id,
    UserId,
    ProviderConnectionId,
    AccessToken,
    RefreshToken,
    ExpiresAt,
    Status,
}

const COLUMNS: [Connections; 7] = [
    Connections::Id,
    Connections::UserId,
    Connections::ProviderConnectionId,
    Connections::AccessToken,
    Connections::RefreshToken,
    Connections::ExpiresAt,
    Connections::Status,
];

pub struct Store<'a>(&'a mut SqliteStore);

impl<'a> Store<'a> {
    pub fn new(store: &'a mut SqliteStore) -> Self {
        Self(store)
    }

    pub async fn save(&mut self, connection: &Connection) -> Result<()> {
        let (query, values) = Query::insert()
            .into_table(Connections::Table)
            .columns(COLUMNS)
            .values_panic(vec![
                connection.id.as_str().into(),
                connection.user_id.as_str().into(),
                connection.provider_connection_id.as_str().into(),
                connection.access_token.as_str().into(),
                connection.refresh_token.as_deref().into(),
                connection.expires_at.map(|at| at.to_rfc3339()).into(),
                to_status_enum(&connection.status).into(),
            ])
            .build_sqlx(SqliteQueryBuilder);

        sqlx::query_with(&query, values)
            .execute(&mut self.0.conn.acquire().await?)
            .await
            .map_err(map_insert_error)?;

        Ok(())
    }

    pub async fn update(&mut self, connection: &Connection) -> Result<()> {
        let (query, values) = Query::update()
            .table(Connections::Table)
            .values(vec![
                (Connections::AccessToken, connection.access_token.as_str().into()),
                (Connections::RefreshToken, connection.refresh_token.as_deref().into()),
                (
                    Connections::ExpiresAt,
                    connection.expires_at.map(|at| at.to_rfc3339()).into(),
                ),
                (Connections::Status, to_status_enum(&connection.status).into()),
            ])
            .and_where(Expr::col(Connections::Id).eq(connection.id.as_str()))
            .build_sqlx(SqliteQueryBuilder);

        sqlx::query_with(&query, values)
            .execute(&mut self.0.conn.acquire().await?)
            .await?;

        Ok(())
    }

    pub async fn by_provider_id(
        &mut self,
        user_id: &str,
        provider_connection_id: &str,
    ) -> Result<Option<Connection>> {
        let (query, values) = Query::select()
            .columns(COLUMNS)
            .from(Connections::Table)
            .and_where(Expr::col(Connections::UserId).eq(user_id))
            .and_where(Expr::col(Connections::ProviderConnectionId).eq(provider_connection_id))
            .build_sqlx(SqliteQueryBuilder);

        let row = sqlx::query_with(&query, values)
            .fetch_optional(&mut self.0.conn.acquire().await?)
            .await?;

        row.map(|row| Connection::from_row(&row).map_err(Into::into))
            .transpose()
    }

    pub async fn list(&mut self, user_id: &str) -> Result<Vec<Connection>> {
        let (query, values) = Query::select()
            .columns(COLUMNS)
            .from(Connections::Table)
            .and_where(Expr::col(Connections::UserId).eq(user_id))
            .build_sqlx(SqliteQueryBuilder);

        let rows = sqlx::query_with(&query, values)
            .fetch_all(&mut self.0.conn.acquire().await?)
            .await?;

        let mut connections = Vec::with_capacity(rows.len());
        for row in rows {
            connections.push(Connection::from_row(&row)?);
        }

        Ok(connections)
    }

    /// A usable connection for the user, if any.
    pub async fn active_for_user(&mut self, user_id: &str) -> Result<Option<Connection>> {
        Ok(self
            .list(user_id)
            .await?
            .into_iter()
            .find(Connection::is_active))
    }

    /// Soft disconnect: the row is kept, the status flips. Connections are
    /// never hard-deleted.
    pub async fn disconnect(&mut self, id: &str) -> Result<()> {
        let (query, values) = Query::update()
            .table(Connections::Table)
            .values(vec![(
                Connections::Status,
                to_status_enum(&ConnectionStatus::Disconnected).into(),
            )])
            .and_where(Expr::col(Connections::Id).eq(id))
            .build_sqlx(SqliteQueryBuilder);

        sqlx::query_with(&query, values)
            .execute(&mut self.0.conn.acquire().await?)
            .await?;

        Ok(())
    }
}

impl<'r, R: sqlx::Row> sqlx::FromRow<'r, R> for Connection
where
    std::string::String: sqlx::Decode<'r, <R as Row>::Database> + sqlx::Type<<R as Row>::Database>,
    Option<String>: sqlx::Decode<'r, <R as Row>::Database> + sqlx::Type<<R as Row>::Database>,
    &'r str: sqlx::Decode<'r, <R as Row>::Database> + sqlx::Type<<R as Row>::Database>,
    &'static str: sqlx::ColumnIndex<R>,
{
    fn from_row(row: &'r R) -> ::std::result::Result<Self, sqlx::Error> {
        let expires_at = row
            .try_get::<'_, Option<String>, _>("expires_at")?
            .map(|raw| {
                parse_timestamp(&raw).map_err(|e| sqlx::Error::ColumnDecode {
                    index: "expires_at".into(),
                    source: e.into(),
                })
            })
            .transpose()?;

        Ok(Connection {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            provider_connection_id: row.try_get("provider_connection_id")?,
            access_token: row.try_get("access_token")?,
            refresh_token: row.try_get("refresh_token")?,
            expires_at,
            status: from_status_enum(row.try_get("status")?).map_err(|e| {
                sqlx::Error::ColumnDecode {
                    index: "status".into(),
                    source: e.into(),
                }
            })?,
        })
    }
}

fn to_status_enum(status: &ConnectionStatus) -> String {
    match *status {
        ConnectionStatus::Active => "ACTIVE".into(),
        ConnectionStatus::Degraded(_) => "DEGRADED".into(),
        ConnectionStatus::Disconnected => "DISCONNECTED".into(),
    }
}

fn from_status_enum(status: &str) -> anyhow::Result<ConnectionStatus> {
    match status {
        "ACTIVE" => Ok(ConnectionStatus::Active),
        "DEGRADED" => Ok(ConnectionStatus::Degraded("requires reconnection".to_string())),
        "DISCONNECTED" => Ok(ConnectionStatus::Disconnected),
        s => Err(anyhow::anyhow!("unknown connection status {}", s)),
    }
}
