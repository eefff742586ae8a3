use chrono::{DateTime, Utc};

/// Milestone thresholds checked after every contribution.
pub const MILESTONE_PERCENTS: [u32; 4] = [25, 50, 75, 100];

#[derive(Debug, Clone)]
pub struct Goal {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub target_miliunits: i64,
    pub current_miliunits: i64,
    pub status: GoalStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoalStatus {
    Active,
    Completed,
}

#[derive(Debug, Clone)]
pub struct Contribution {
    pub id: String,
    pub goal_id: String,
    pub amount_miliunits: i64,
    pub contributed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Milestone {
    pub id: String,
    pub goal_id: String,
    pub percent: u32,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Goal {
    /// Progress toward the target, clamped to [0, 100].
    pub fn progress_percent(&self) -> u32 {
        progress_percent(self.current_miliunits, self.target_miliunits)
    }

    pub fn is_completed(&self) -> bool {
        self.current_miliunits >= self.target_miliunits
    }
}

pub fn progress_percent(current_miliunits: i64, target_miliunits: i64) -> u32 {
    if target_miliunits <= 0 {
        return 100;
    }

    let current = current_miliunits.max(0) as i128;
    let percent = current * 100 / target_miliunits as i128;
    percent.min(100) as u32
}

/// Milestones newly crossed when progress moves from `previous` to `next`.
pub fn crossed_milestones(previous: u32, next: u32) -> Vec<u32> {
    MILESTONE_PERCENTS
        .into_iter()
        .filter(|p| previous < *p && next >= *p)
        .collect()
}
