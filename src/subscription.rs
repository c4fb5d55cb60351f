//! Subscription snapshot and the lookup collaborator.
//!
//! Subscriptions are owned by an external store; this crate only reads them.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use thiserror::Error;

use crate::substrate::StepError;

/// Status of a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Active,
    #[serde(alias = "cancelled")]
    Canceled,
    Expired,
    /// Any status this crate does not know about. Never eligible.
    #[serde(other)]
    Unknown,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Canceled => "canceled",
            Self::Expired => "expired",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Self::Active,
            "canceled" | "cancelled" => Self::Canceled,
            "expired" => Self::Expired,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Owner of a subscription, denormalized into the snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionUser {
    pub name: String,
    pub email: String,
}

/// Read-only snapshot of a subscription as seen by one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub id: String,
    pub name: String,
    pub status: SubscriptionStatus,
    pub renewal_date: DateTime<Utc>,
    pub user: SubscriptionUser,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub frequency: Option<String>,
    #[serde(default)]
    pub payment_method: Option<String>,
}

impl Subscription {
    pub fn is_active(&self) -> bool {
        self.status == SubscriptionStatus::Active
    }
}

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("subscription store unavailable: {0}")]
    Unavailable(String),

    #[error("malformed subscription record: {0}")]
    Malformed(String),

    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

// Lookup failures are worth retrying with the whole run.
impl From<LookupError> for StepError {
    fn from(err: LookupError) -> Self {
        match err {
            LookupError::Malformed(_) => StepError::fatal(err.to_string()),
            LookupError::Unavailable(_) | LookupError::Sqlx(_) => {
                StepError::retryable(err.to_string())
            }
        }
    }
}

/// Fetches subscriptions by id.
#[async_trait]
pub trait SubscriptionLookup: Send + Sync {
    /// `Ok(None)` when no subscription has this id.
    async fn find_by_id(&self, id: &str) -> Result<Option<Subscription>, LookupError>;
}

// ============================================================================
// In-memory lookup
// ============================================================================

/// Lookup over a process-local map, optionally seeded from a JSON file.
#[derive(Debug, Default)]
pub struct InMemorySubscriptions {
    records: RwLock<HashMap<String, Subscription>>,
}

impl InMemorySubscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a JSON array of subscriptions.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, LookupError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|err| LookupError::Unavailable(format!("{}: {err}", path.display())))?;
        let subscriptions: Vec<Subscription> = serde_json::from_str(&raw)
            .map_err(|err| LookupError::Malformed(format!("{}: {err}", path.display())))?;

        let lookup = Self::new();
        for subscription in subscriptions {
            lookup.upsert(subscription);
        }
        Ok(lookup)
    }

    pub fn upsert(&self, subscription: Subscription) {
        self.records
            .write()
            .insert(subscription.id.clone(), subscription);
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl SubscriptionLookup for InMemorySubscriptions {
    async fn find_by_id(&self, id: &str) -> Result<Option<Subscription>, LookupError> {
        Ok(self.records.read().get(id).cloned())
    }
}

// ============================================================================
// Postgres lookup
// ============================================================================

/// Read-only lookup against the application's `subscriptions` and `users`
/// tables.
#[derive(Clone)]
pub struct PgSubscriptionLookup {
    pool: PgPool,
}

impl PgSubscriptionLookup {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SubscriptionLookup for PgSubscriptionLookup {
    async fn find_by_id(&self, id: &str) -> Result<Option<Subscription>, LookupError> {
        let row = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            SELECT s.id::text AS id,
                   s.name,
                   s.status,
                   s.renewal_date,
                   s.price::float8 AS price,
                   s.currency,
                   s.frequency,
                   s.payment_method,
                   u.name AS user_name,
                   u.email AS user_email
            FROM subscriptions s
            JOIN users u ON u.id = s.user_id
            WHERE s.id::text = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Subscription::from))
    }
}

// Internal row type for sqlx
#[derive(FromRow)]
struct SubscriptionRow {
    id: String,
    name: String,
    status: String,
    renewal_date: DateTime<Utc>,
    price: Option<f64>,
    currency: Option<String>,
    frequency: Option<String>,
    payment_method: Option<String>,
    user_name: String,
    user_email: String,
}

impl From<SubscriptionRow> for Subscription {
    fn from(row: SubscriptionRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            status: SubscriptionStatus::parse(&row.status),
            renewal_date: row.renewal_date,
            user: SubscriptionUser {
                name: row.user_name,
                email: row.user_email,
            },
            price: row.price,
            currency: row.currency,
            frequency: row.frequency,
            payment_method: row.payment_method,
        }
    }
}
