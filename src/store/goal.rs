use chrono::{DateTime, Utc};
use sea_query::{Expr, Iden, Order, Query, SqliteQueryBuilder};
use sea_query_binder::SqlxBinder;
use sqlx::{Connection as _, Row};
use ulid::Ulid;

use super::{map_insert_error, parse_timestamp, Error, Result, SqliteStore};
use crate::core::goal::{
    crossed_milestones, progress_percent, Goal, GoalStatus, Milestone, MILESTONE_PERCENTS,
};

#[derive(Iden)]
enum SavingsGoals {
    Table,
    Id,
    UserId,
    Name,
    TargetMiliunits,
    CurrentMiliunits,
    Status,
    CreatedAt,
}

#[derive(Iden)]
enum SavingsMilestones {
    Table,
    Id,
    GoalId,
    Percent,
    CompletedAt,
}

const GOAL_COLUMNS: [SavingsGoals; 7] = [
    SavingsGoals::Id,
    SavingsGoals::UserId,
    SavingsGoals::Name,
    SavingsGoals::TargetMiliunits,
    SavingsGoals::CurrentMiliunits,
    SavingsGoals::Status,
    SavingsGoals::CreatedAt,
];

/// What a single contribution did to its goal.
#[derive(Debug, Clone)]
pub struct ContributionOutcome {
    pub goal: Goal,
    /// Milestone percents newly completed by this contribution.
    pub crossed: Vec<u32>,
}

pub struct Store<'a>(&'a mut SqliteStore);

impl<'a> Store<'a> {
    pub fn new(store: &'a mut SqliteStore) -> Self {
        Self(store)
    }

    /// Creates the goal together with its milestone rows.
    pub async fn create(
        &mut self,
        user_id: &str,
        name: &str,
        target_miliunits: i64,
        now: DateTime<Utc>,
    ) -> Result<Goal> {
        let goal = Goal {
            id: Ulid::new().to_string(),
            user_id: user_id.to_string(),
            name: name.to_string(),
            target_miliunits,
            current_miliunits: 0,
            status: GoalStatus::Active,
            created_at: now,
        };

        let inserted = goal.clone();
        self.0
            .conn
            .acquire()
            .await?
            .transaction(|conn| {
                Box::pin(async move {
                    let result = sqlx::query(
                        "INSERT INTO savings_goals (
                            id,
                            user_id,
                            name,
                            target_miliunits,
                            current_miliunits,
                            status,
                            created_at
                        ) VALUES ($1, $2, $3, $4, $5, $6, $7)",
                    )
                    .bind(&inserted.id)
                    .bind(&inserted.user_id)
                    .bind(&inserted.name)
                    .bind(inserted.target_miliunits)
                    .bind(inserted.current_miliunits)
                    .bind("ACTIVE")
                    .bind(inserted.created_at.to_rfc3339())
                    .execute(&mut *conn)
                    .await;

                    if let Err(e) = result {
                        return Err(map_insert_error(e));
                    }

                    for percent in MILESTONE_PERCENTS {
                        sqlx::query(
                            "INSERT INTO savings_milestones (id, goal_id, percent, completed_at)
                             VALUES ($1, $2, $3, NULL)",
                        )
                        .bind(Ulid::new().to_string())
                        .bind(&inserted.id)
                        .bind(percent as i64)
                        .execute(&mut *conn)
                        .await?;
                    }

                    Ok(())
                })
            })
            .await?;

        Ok(goal)
    }

    pub async fn get(&mut self, id: &str) -> Result<Option<Goal>> {
        let (query, values) = Query::select()
            .columns(GOAL_COLUMNS)
            .from(SavingsGoals::Table)
            .and_where(Expr::col(SavingsGoals::Id).eq(id))
            .build_sqlx(SqliteQueryBuilder);

        let row = sqlx::query_with(&query, values)
            .fetch_optional(&mut self.0.conn.acquire().await?)
            .await?;

        row.map(|row| goal_from_row(&row)).transpose()
    }

    pub async fn list(&mut self, user_id: &str) -> Result<Vec<Goal>> {
        let (query, values) = Query::select()
            .columns(GOAL_COLUMNS)
            .from(SavingsGoals::Table)
            .and_where(Expr::col(SavingsGoals::UserId).eq(user_id))
            .order_by(SavingsGoals::CreatedAt, Order::Asc)
            .build_sqlx(SqliteQueryBuilder);

        let rows = sqlx::query_with(&query, values)
            .fetch_all(&mut self.0.conn.acquire().await?)
            .await?;

        rows.iter().map(goal_from_row).collect()
    }

    pub async fn milestones(&mut self, goal_id: &str) -> Result<Vec<Milestone>> {
        let (query, values) = Query::select()
            .columns([
                SavingsMilestones::Id,
                SavingsMilestones::GoalId,
                SavingsMilestones::Percent,
                SavingsMilestones::CompletedAt,
            ])
            .from(SavingsMilestones::Table)
            .and_where(Expr::col(SavingsMilestones::GoalId).eq(goal_id))
            .order_by(SavingsMilestones::Percent, Order::Asc)
            .build_sqlx(SqliteQueryBuilder);

        let rows = sqlx::query_with(&query, values)
            .fetch_all(&mut self.0.conn.acquire().await?)
            .await?;

        let mut milestones = Vec::with_capacity(rows.len());
        for row in rows {
            let completed_at = row
                .try_get::<'_, Option<String>, _>("completed_at")?
                .map(|raw| parse_timestamp(&raw))
                .transpose()?;

            milestones.push(Milestone {
                id: row.try_get("id")?,
                goal_id: row.try_get("goal_id")?,
                percent: row.try_get::<'_, i64, _>("percent")? as u32,
                completed_at,
            });
        }

        Ok(milestones)
    }

    /// Appends a contribution, bumps the running total, completes any
    /// milestones the new total crosses, and flips the goal to completed
    /// once current >= target. All of it commits atomically.
    pub async fn contribute(
        &mut self,
        goal_id: &str,
        amount_miliunits: i64,
        at: DateTime<Utc>,
    ) -> Result<ContributionOutcome> {
        let goal_id = goal_id.to_string();

        self.0
            .conn
            .acquire()
            .await?
            .transaction(|conn| {
                Box::pin(async move {
                    let row = sqlx::query(
                        "SELECT id, user_id, name, target_miliunits, current_miliunits, status, created_at
                         FROM savings_goals WHERE id = $1",
                    )
                    .bind(&goal_id)
                    .fetch_optional(&mut *conn)
                    .await?;

                    let mut goal = match row {
                        Some(row) => goal_from_row(&row)?,
                        None => return Err(Error::NotFound),
                    };

                    sqlx::query(
                        "INSERT INTO savings_contributions (id, goal_id, amount_miliunits, contributed_at)
                         VALUES ($1, $2, $3, $4)",
                    )
                    .bind(Ulid::new().to_string())
                    .bind(&goal_id)
                    .bind(amount_miliunits)
                    .bind(at.to_rfc3339())
                    .execute(&mut *conn)
                    .await?;

                    let previous = goal.progress_percent();
                    goal.current_miliunits += amount_miliunits;
                    let next = progress_percent(goal.current_miliunits, goal.target_miliunits);

                    let crossed = crossed_milestones(previous, next);
                    for percent in &crossed {
                        sqlx::query(
                            "UPDATE savings_milestones SET completed_at = $1
                             WHERE goal_id = $2 AND percent = $3 AND completed_at IS NULL",
                        )
                        .bind(at.to_rfc3339())
                        .bind(&goal_id)
                        .bind(*percent as i64)
                        .execute(&mut *conn)
                        .await?;
                    }

                    if goal.is_completed() {
                        goal.status = GoalStatus::Completed;
                    }

                    sqlx::query(
                        "UPDATE savings_goals SET current_miliunits = $1, status = $2 WHERE id = $3",
                    )
                    .bind(goal.current_miliunits)
                    .bind(match goal.status {
                        GoalStatus::Active => "ACTIVE",
                        GoalStatus::Completed => "COMPLETED",
                    })
                    .bind(&goal_id)
                    .execute(&mut *conn)
                    .await?;

                    Ok(ContributionOutcome { goal, crossed })
                })
            })
            .await
    }
}

fn goal_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Goal> {
    let status = match row.try_get::<'_, String, _>("status")?.as_str() {
        "ACTIVE" => GoalStatus::Active,
        "COMPLETED" => GoalStatus::Completed,
        s => return Err(Error::Unknown(anyhow::anyhow!("unknown goal status {}", s))),
    };

    Ok(Goal {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        name: row.try_get("name")?,
        target_miliunits: row.try_get("target_miliunits")?,
        current_miliunits: row.try_get("current_miliunits")?,
        status,
        created_at: parse_timestamp(row.try_get("created_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use crate::core::goal::GoalStatus;
    use crate::store::tests::TestStore;
    use crate::store::Error;

    #[tokio::test]
    async fn create_seeds_incomplete_milestones() {
        let mut store = TestStore::new().await;

        let goal = store
            .db()
            .goals()
            .create("user-1", "Emergency Fund", 1_000_000, Utc::now())
            .await
            .unwrap();

        let milestones = store.db().goals().milestones(&goal.id).await.unwrap();
        assert_eq!(milestones.len(), 4);
        assert!(milestones.iter().all(|m| m.completed_at.is_none()));
        assert_eq!(
            milestones.iter().map(|m| m.percent).collect::<Vec<_>>(),
            vec![25, 50, 75, 100]
        );
    }

    #[tokio::test]
    async fn contribution_progress_completes_milestones_in_order() {
        let mut store = TestStore::new().await;
        let goal = store
            .db()
            .goals()
            .create("user-1", "Holiday", 100_000, Utc::now())
            .await
            .unwrap();

        let first = store
            .db()
            .goals()
            .contribute(&goal.id, 30_000, Utc::now())
            .await
            .unwrap();
        assert_eq!(first.crossed, vec![25]);
        assert_eq!(first.goal.current_miliunits, 30_000);
        assert_eq!(first.goal.status, GoalStatus::Active);

        let second = store
            .db()
            .goals()
            .contribute(&goal.id, 50_000, Utc::now())
            .await
            .unwrap();
        assert_eq!(second.crossed, vec![50, 75]);

        let completed: Vec<u32> = store
            .db()
            .goals()
            .milestones(&goal.id)
            .await
            .unwrap()
            .into_iter()
            .filter(|m| m.completed_at.is_some())
            .map(|m| m.percent)
            .collect();
        assert_eq!(completed, vec![25, 50, 75]);
    }

    #[tokio::test]
    async fn goal_completes_when_target_reached() {
        let mut store = TestStore::new().await;
        let goal = store
            .db()
            .goals()
            .create("user-1", "Bike", 50_000, Utc::now())
            .await
            .unwrap();

        let outcome = store
            .db()
            .goals()
            .contribute(&goal.id, 60_000, Utc::now())
            .await
            .unwrap();

        assert_eq!(outcome.goal.status, GoalStatus::Completed);
        assert_eq!(outcome.crossed, vec![25, 50, 75, 100]);

        let fetched = store.db().goals().get(&goal.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, GoalStatus::Completed);
        assert_eq!(fetched.current_miliunits, 60_000);
    }

    #[tokio::test]
    async fn contributing_to_missing_goal_is_not_found() {
        let mut store = TestStore::new().await;

        let err = store
            .db()
            .goals()
            .contribute("missing", 1_000, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound));
    }
}
