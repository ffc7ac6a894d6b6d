use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;

use crate::srs::{CardScheduleState, SchedulerError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deck {
    pub id: String,
    #[serde(skip)]
    pub user_id: String,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::sqlite::SqliteRow> for Deck {
    fn from_row(row: &'r sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Deck {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Card {
    pub id: String,
    pub deck_id: String,
    #[serde(skip)]
    pub user_id: String,
    pub front: String,
    pub back: String,
    #[serde(flatten)]
    pub schedule: CardScheduleState,
    /// Bumped on every write; guards review read-modify-write cycles.
    #[serde(skip)]
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A `cards` row as stored. Scheduling columns are checked when turned
/// into a [`Card`].
pub struct CardRow {
    id: String,
    deck_id: String,
    user_id: String,
    front: String,
    back: String,
    stage: i64,
    ease_factor: f64,
    interval: i64,
    next_review: DateTime<Utc>,
    last_reviewed_at: Option<DateTime<Utc>>,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::sqlite::SqliteRow> for CardRow {
    fn from_row(row: &'r sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(CardRow {
            id: row.try_get("id")?,
            deck_id: row.try_get("deck_id")?,
            user_id: row.try_get("user_id")?,
            front: row.try_get("front")?,
            back: row.try_get("back")?,
            stage: row.try_get("stage")?,
            ease_factor: row.try_get("ease_factor")?,
            interval: row.try_get("interval")?,
            next_review: row.try_get("next_review")?,
            last_reviewed_at: row.try_get("last_reviewed_at")?,
            version: row.try_get("version")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<CardRow> for Card {
    type Error = SchedulerError;

    fn try_from(row: CardRow) -> Result<Self, Self::Error> {
        let schedule = CardScheduleState::from_stored(
            row.stage,
            row.ease_factor,
            row.interval,
            row.next_review,
            row.last_reviewed_at,
        )
        .map_err(|e| match e {
            SchedulerError::InvalidState(msg) => {
                SchedulerError::InvalidState(format!("card {}: {msg}", row.id))
            }
            other => other,
        })?;

        Ok(Card {
            id: row.id,
            deck_id: row.deck_id,
            user_id: row.user_id,
            front: row.front,
            back: row.back,
            schedule,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chat {
    pub id: String,
    #[serde(skip)]
    pub user_id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::sqlite::SqliteRow> for Chat {
    fn from_row(row: &'r sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Chat {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            title: row.try_get("title")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub chat_id: String,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::sqlite::SqliteRow> for ChatMessage {
    fn from_row(row: &'r sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        let role: String = row.try_get("role")?;
        let role = match role.as_str() {
            "user" => Role::User,
            "assistant" => Role::Assistant,
            other => {
                return Err(sqlx::Error::ColumnDecode {
                    index: "role".to_string(),
                    source: format!("unknown chat role '{other}'").into(),
                })
            }
        };

        Ok(ChatMessage {
            id: row.try_get("id")?,
            chat_id: row.try_get("chat_id")?,
            role,
            content: row.try_get("content")?,
            created_at: row.try_get("created_at")?,
        })
    }
}
