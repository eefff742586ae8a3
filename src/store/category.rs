use sea_query::{Expr, Iden, Order, Query, SqliteQueryBuilder};
use sea_query_binder::SqlxBinder;
use sqlx::{Connection as _, Row};
use ulid::Ulid;

use super::{map_insert_error, Error, Result, SqliteStore};
use crate::core::Category;

#[derive(Iden)]
enum Categories {
    Table,
    Id,
    UserId,
    Name,
}

pub struct Store<'a>(&'a mut SqliteStore);

impl<'a> Store<'a> {
    pub fn new(store: &'a mut SqliteStore) -> Self {
        Self(store)
    }

    pub async fn create(&mut self, user_id: &str, name: &str) -> Result<Category> {
        let category = Category {
            id: Ulid::new().to_string(),
            user_id: user_id.to_string(),
            name: name.to_string(),
        };

        let (query, values) = Query::insert()
            .into_table(Categories::Table)
            .columns([Categories::Id, Categories::UserId, Categories::Name])
            .values_panic(vec![
                category.id.as_str().into(),
                category.user_id.as_str().into(),
                category.name.as_str().into(),
            ])
            .build_sqlx(SqliteQueryBuilder);

        sqlx::query_with(&query, values)
            .execute(&mut self.0.conn.acquire().await?)
            .await
            .map_err(map_insert_error)?;

        Ok(category)
    }

    pub async fn list(&mut self, user_id: &str) -> Result<Vec<Category>> {
        let (query, values) = Query::select()
            .columns([Categories::Id, Categories::UserId, Categories::Name])
            .from(Categories::Table)
            .and_where(Expr::col(Categories::UserId).eq(user_id))
            .order_by(Categories::Name, Order::Asc)
            .build_sqlx(SqliteQueryBuilder);

        let rows = sqlx::query_with(&query, values)
            .fetch_all(&mut self.0.conn.acquire().await?)
            .await?;

        let mut categories = Vec::with_capacity(rows.len());
        for row in rows {
            categories.push(Category {
                id: row.try_get("id")?,
                user_id: row.try_get("user_id")?,
                name: row.try_get("name")?,
            });
        }

        Ok(categories)
    }

    pub async fn rename(&mut self, id: &str, name: &str) -> Result<()> {
        let (query, values) = Query::update()
            .table(Categories::Table)
            .values(vec![(Categories::Name, name.into())])
            .and_where(Expr::col(Categories::Id).eq(id))
            .build_sqlx(SqliteQueryBuilder);

        let result = sqlx::query_with(&query, values)
            .execute(&mut self.0.conn.acquire().await?)
            .await
            .map_err(map_insert_error)?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound);
        }

        Ok(())
    }

    /// Deleting a category returns its transactions to the pending pool
    /// rather than orphaning references.
    pub async fn delete(&mut self, id: &str) -> Result<()> {
        let id = id.to_string();

        self.0
            .conn
            .acquire()
            .await?
            .transaction(|conn| {
                Box::pin(async move {
                    sqlx::query("UPDATE transactions SET category_id = NULL WHERE category_id = $1")
                        .bind(&id)
                        .execute(&mut *conn)
                        .await?;

                    let result = sqlx::query("DELETE FROM categories WHERE id = $1")
                        .bind(&id)
                        .execute(&mut *conn)
                        .await?;

                    if result.rows_affected() == 0 {
                        return Err(Error::NotFound);
                    }

                    Ok(())
                })
            })
            .await
    }
}
