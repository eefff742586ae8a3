use chrono::NaiveDate;

/// A single ledger entry. Immutable after insert except for category
/// assignment. `external_id` is the de-duplication key when present.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub id: String,
    pub account_id: String,
    pub external_id: Option<String>,
    /// Signed miliunits: income >= 0, expenses < 0.
    pub amount_miliunits: i64,
    pub payee: String,
    pub date: NaiveDate,
    pub category: Option<CategoryRef>,
    pub notes: Option<String>,
}

impl Transaction {
    pub fn is_pending_categorization(&self) -> bool {
        self.category.is_none()
    }
}

/// Insert payload for a transaction row.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub account_id: String,
    pub external_id: Option<String>,
    pub amount_miliunits: i64,
    pub payee: String,
    pub date: NaiveDate,
    pub notes: Option<String>,
}

/// A transaction references at most one category: either a user-defined
/// row or one of the predefined labels, never both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CategoryRef {
    User(String),
    Predefined(PredefinedCategory),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredefinedCategory {
    Income,
    Groceries,
    Dining,
    Transport,
    Housing,
    Utilities,
    Entertainment,
    Shopping,
    Health,
    Transfer,
    Other,
}

impl PredefinedCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            PredefinedCategory::Income => "INCOME",
            PredefinedCategory::Groceries => "GROCERIES",
            PredefinedCategory::Dining => "DINING",
            PredefinedCategory::Transport => "TRANSPORT",
            PredefinedCategory::Housing => "HOUSING",
            PredefinedCategory::Utilities => "UTILITIES",
            PredefinedCategory::Entertainment => "ENTERTAINMENT",
            PredefinedCategory::Shopping => "SHOPPING",
            PredefinedCategory::Health => "HEALTH",
            PredefinedCategory::Transfer => "TRANSFER",
            PredefinedCategory::Other => "OTHER",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "INCOME" => Some(PredefinedCategory::Income),
            "GROCERIES" => Some(PredefinedCategory::Groceries),
            "DINING" => Some(PredefinedCategory::Dining),
            "TRANSPORT" => Some(PredefinedCategory::Transport),
            "HOUSING" => Some(PredefinedCategory::Housing),
            "UTILITIES" => Some(PredefinedCategory::Utilities),
            "ENTERTAINMENT" => Some(PredefinedCategory::Entertainment),
            "SHOPPING" => Some(PredefinedCategory::Shopping),
            "HEALTH" => Some(PredefinedCategory::Health),
            "TRANSFER" => Some(PredefinedCategory::Transfer),
            "OTHER" => Some(PredefinedCategory::Other),
            _ => None,
        }
    }
}

/// A user-defined category.
#[derive(Debug, Clone)]
pub struct Category {
    pub id: String,
    pub user_id: String,
    pub name: String,
}
