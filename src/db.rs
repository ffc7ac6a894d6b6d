use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    ConnectOptions, Pool, Sqlite,
};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{Card, CardRow, Chat, ChatMessage, Deck, Role};
use crate::srs::{compute_next_review, CardScheduleState, Grade, SchedulerError};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("card {0} was modified by another review")]
    Conflict(String),
    #[error(transparent)]
    InvalidState(#[from] SchedulerError),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS decks (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        name TEXT NOT NULL,
        description TEXT,
        created_at DATETIME NOT NULL,
        updated_at DATETIME NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS cards (
        id TEXT PRIMARY KEY,
        deck_id TEXT NOT NULL REFERENCES decks(id) ON DELETE CASCADE,
        user_id TEXT NOT NULL,
        front TEXT NOT NULL,
        back TEXT NOT NULL,
        stage INTEGER NOT NULL DEFAULT 0,
        ease_factor REAL NOT NULL DEFAULT 2.5,
        interval INTEGER NOT NULL DEFAULT 0,
        next_review DATETIME NOT NULL,
        last_reviewed_at DATETIME,
        version INTEGER NOT NULL DEFAULT 0,
        created_at DATETIME NOT NULL,
        updated_at DATETIME NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS cards_due ON cards (user_id, next_review)",
    "CREATE INDEX IF NOT EXISTS cards_deck ON cards (deck_id)",
    r#"
    CREATE TABLE IF NOT EXISTS chats (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        title TEXT NOT NULL,
        created_at DATETIME NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS chat_messages (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        chat_id TEXT NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
        role TEXT NOT NULL,
        content TEXT NOT NULL,
        created_at DATETIME NOT NULL
    )
    "#,
];

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

impl Db {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .log_statements(log::LevelFilter::Trace);

        // Every connection to `sqlite::memory:` opens its own database, so the
        // pool must hold exactly one and never recycle it.
        let pool_options = if url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options.connect_with(options).await?;

        let db = Db { pool };
        db.migrate().await?;
        Ok(db)
    }

    #[cfg(test)]
    pub async fn in_memory() -> Self {
        Self::connect("sqlite::memory:").await.unwrap()
    }

    async fn migrate(&self) -> anyhow::Result<()> {
        for statement in MIGRATIONS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    // --- Decks ---

    pub async fn create_deck(
        &self,
        user_id: &str,
        name: &str,
        description: Option<&str>,
    ) -> StoreResult<Deck> {
        let now = Utc::now();
        let deck = Deck {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            name: name.to_string(),
            description: description.map(str::to_string),
            created_at: now,
            updated_at: now,
        };

        sqlx::query(
            "INSERT INTO decks (id, user_id, name, description, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&deck.id)
        .bind(&deck.user_id)
        .bind(&deck.name)
        .bind(&deck.description)
        .bind(deck.created_at)
        .bind(deck.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(deck)
    }

    pub async fn list_decks(&self, user_id: &str) -> StoreResult<Vec<Deck>> {
        let decks = sqlx::query_as::<_, Deck>(
            "SELECT * FROM decks WHERE user_id = ? ORDER BY created_at, id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(decks)
    }

    pub async fn get_deck(&self, user_id: &str, id: &str) -> StoreResult<Deck> {
        sqlx::query_as::<_, Deck>("SELECT * FROM decks WHERE id = ? AND user_id = ?")
            .bind(id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound("deck"))
    }

    pub async fn update_deck(
        &self,
        user_id: &str,
        id: &str,
        name: &str,
        description: Option<&str>,
    ) -> StoreResult<Deck> {
        let result = sqlx::query(
            "UPDATE decks SET name = ?, description = ?, updated_at = ? WHERE id = ? AND user_id = ?",
        )
        .bind(name)
        .bind(description)
        .bind(Utc::now())
        .bind(id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound("deck"));
        }
        self.get_deck(user_id, id).await
    }

    pub async fn delete_deck(&self, user_id: &str, id: &str) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM decks WHERE id = ? AND user_id = ?")
            .bind(id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound("deck"));
        }
        Ok(())
    }

    // --- Cards ---

    pub async fn create_card(
        &self,
        user_id: &str,
        deck_id: &str,
        front: &str,
        back: &str,
    ) -> StoreResult<Card> {
        let mut cards = self
            .create_cards(user_id, deck_id, &[(front.to_string(), back.to_string())])
            .await?;
        cards.pop().ok_or(StoreError::NotFound("card"))
    }

    /// Inserts all cards into `deck_id` in one transaction.
    pub async fn create_cards(
        &self,
        user_id: &str,
        deck_id: &str,
        sides: &[(String, String)],
    ) -> StoreResult<Vec<Card>> {
        let mut tx = self.pool.begin().await?;

        let owned: Option<i64> = sqlx::query_scalar("SELECT 1 FROM decks WHERE id = ? AND user_id = ?")
            .bind(deck_id)
            .bind(user_id)
            .fetch_optional(&mut *tx)
            .await?;
        if owned.is_none() {
            return Err(StoreError::NotFound("deck"));
        }

        let now = Utc::now();
        let mut cards = Vec::with_capacity(sides.len());
        for (front, back) in sides {
            let card = Card {
                id: Uuid::new_v4().to_string(),
                deck_id: deck_id.to_string(),
                user_id: user_id.to_string(),
                front: front.clone(),
                back: back.clone(),
                schedule: CardScheduleState::new(now),
                version: 0,
                created_at: now,
                updated_at: now,
            };

            sqlx::query(
                r#"
                INSERT INTO cards (id, deck_id, user_id, front, back, stage, ease_factor, interval,
                                   next_review, last_reviewed_at, version, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&card.id)
            .bind(&card.deck_id)
            .bind(&card.user_id)
            .bind(&card.front)
            .bind(&card.back)
            .bind(i64::from(card.schedule.stage))
            .bind(card.schedule.ease_factor)
            .bind(i64::from(card.schedule.interval))
            .bind(card.schedule.next_review)
            .bind(card.schedule.last_reviewed_at)
            .bind(card.version)
            .bind(card.created_at)
            .bind(card.updated_at)
            .execute(&mut *tx)
            .await?;

            cards.push(card);
        }

        tx.commit().await?;
        Ok(cards)
    }

    pub async fn list_cards(&self, user_id: &str, deck_id: &str) -> StoreResult<Vec<Card>> {
        self.get_deck(user_id, deck_id).await?;

        let rows = sqlx::query_as::<_, CardRow>(
            "SELECT * FROM cards WHERE deck_id = ? AND user_id = ? ORDER BY created_at, id",
        )
        .bind(deck_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        into_cards(rows)
    }

    pub async fn get_card(&self, user_id: &str, id: &str) -> StoreResult<Card> {
        let row = sqlx::query_as::<_, CardRow>("SELECT * FROM cards WHERE id = ? AND user_id = ?")
            .bind(id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound("card"))?;
        Ok(Card::try_from(row)?)
    }

    /// Edits the text of a card. Scheduling is left untouched.
    pub async fn update_card(
        &self,
        user_id: &str,
        id: &str,
        front: &str,
        back: &str,
    ) -> StoreResult<Card> {
        let result = sqlx::query(
            "UPDATE cards SET front = ?, back = ?, version = version + 1, updated_at = ? WHERE id = ? AND user_id = ?",
        )
        .bind(front)
        .bind(back)
        .bind(Utc::now())
        .bind(id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound("card"));
        }
        self.get_card(user_id, id).await
    }

    pub async fn delete_card(&self, user_id: &str, id: &str) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM cards WHERE id = ? AND user_id = ?")
            .bind(id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound("card"));
        }
        Ok(())
    }

    /// Cards due at `now`, most overdue first.
    pub async fn list_due_cards(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
        limit: u32,
    ) -> StoreResult<Vec<Card>> {
        let rows = sqlx::query_as::<_, CardRow>(
            r#"
            SELECT * FROM cards
            WHERE user_id = ? AND next_review <= ?
            ORDER BY next_review ASC, id
            LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(now)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        into_cards(rows)
    }

    pub async fn count_due(&self, user_id: &str, now: DateTime<Utc>) -> StoreResult<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT count(*) FROM cards WHERE user_id = ? AND next_review <= ?")
                .bind(user_id)
                .bind(now)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    /// Applies a review to a card and persists the new schedule.
    ///
    /// The card is read without holding a transaction. The conditional update
    /// is the only write, so a review that lands in between is reported as
    /// [`StoreError::Conflict`] instead of overwriting it.
    pub async fn review_card(
        &self,
        user_id: &str,
        id: &str,
        grade: Grade,
        now: DateTime<Utc>,
    ) -> StoreResult<Card> {
        let card = self.get_card(user_id, id).await?;
        let reviewed = self.write_review(card, grade, now).await?;

        log::debug!(
            "card {} graded {} -> interval {}d, ease {:.2}, stage {}",
            reviewed.id,
            grade.value(),
            reviewed.schedule.interval,
            reviewed.schedule.ease_factor,
            reviewed.schedule.stage
        );
        Ok(reviewed)
    }

    /// Writes the review of `card` if its stored version still matches.
    async fn write_review(&self, card: Card, grade: Grade, now: DateTime<Utc>) -> StoreResult<Card> {
        let next = compute_next_review(&card.schedule, grade, now)?;

        let result = sqlx::query(
            r#"
            UPDATE cards
            SET stage = ?, ease_factor = ?, interval = ?, next_review = ?, last_reviewed_at = ?,
                version = version + 1, updated_at = ?
            WHERE id = ? AND user_id = ? AND version = ?
            "#,
        )
        .bind(i64::from(next.stage))
        .bind(next.ease_factor)
        .bind(i64::from(next.interval))
        .bind(next.next_review)
        .bind(next.last_reviewed_at)
        .bind(now)
        .bind(&card.id)
        .bind(&card.user_id)
        .bind(card.version)
        .execute(&self.pool)
        .await;

        let lost_race = match &result {
            Ok(done) => done.rows_affected() == 0,
            Err(e) => is_busy(e),
        };
        if lost_race {
            log::warn!("review of card {} lost a concurrent update race", card.id);
            return Err(StoreError::Conflict(card.id));
        }
        result?;

        Ok(Card {
            schedule: next,
            version: card.version + 1,
            updated_at: now,
            ..card
        })
    }

    // --- Chats ---

    pub async fn create_chat(&self, user_id: &str, title: &str) -> StoreResult<Chat> {
        let chat = Chat {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            title: title.to_string(),
            created_at: Utc::now(),
        };

        sqlx::query("INSERT INTO chats (id, user_id, title, created_at) VALUES (?, ?, ?, ?)")
            .bind(&chat.id)
            .bind(&chat.user_id)
            .bind(&chat.title)
            .bind(chat.created_at)
            .execute(&self.pool)
            .await?;

        Ok(chat)
    }

    pub async fn list_chats(&self, user_id: &str) -> StoreResult<Vec<Chat>> {
        let chats = sqlx::query_as::<_, Chat>(
            "SELECT * FROM chats WHERE user_id = ? ORDER BY created_at DESC, id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(chats)
    }

    pub async fn get_chat(&self, user_id: &str, id: &str) -> StoreResult<Chat> {
        sqlx::query_as::<_, Chat>("SELECT * FROM chats WHERE id = ? AND user_id = ?")
            .bind(id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound("chat"))
    }

    pub async fn delete_chat(&self, user_id: &str, id: &str) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM chats WHERE id = ? AND user_id = ?")
            .bind(id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound("chat"));
        }
        Ok(())
    }

    /// Stores a user message and the assistant's reply together, so a chat
    /// never keeps a question without its answer. Ownership of the chat is
    /// checked by the caller.
    pub async fn append_exchange(
        &self,
        chat_id: &str,
        content: &str,
        reply: &str,
    ) -> StoreResult<(ChatMessage, ChatMessage)> {
        let mut tx = self.pool.begin().await?;
        let message = insert_message(&mut *tx, chat_id, Role::User, content).await?;
        let reply = insert_message(&mut *tx, chat_id, Role::Assistant, reply).await?;
        tx.commit().await?;
        Ok((message, reply))
    }

    pub async fn list_messages(&self, chat_id: &str) -> StoreResult<Vec<ChatMessage>> {
        let messages = sqlx::query_as::<_, ChatMessage>(
            "SELECT * FROM chat_messages WHERE chat_id = ? ORDER BY seq",
        )
        .bind(chat_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(messages)
    }
}

async fn insert_message<'e, E>(
    executor: E,
    chat_id: &str,
    role: Role,
    content: &str,
) -> StoreResult<ChatMessage>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let message = ChatMessage {
        id: Uuid::new_v4().to_string(),
        chat_id: chat_id.to_string(),
        role,
        content: content.to_string(),
        created_at: Utc::now(),
    };

    sqlx::query(
        "INSERT INTO chat_messages (id, chat_id, role, content, created_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&message.id)
    .bind(&message.chat_id)
    .bind(message.role.as_str())
    .bind(&message.content)
    .bind(message.created_at)
    .execute(executor)
    .await?;

    Ok(message)
}

/// SQLITE_BUSY and its extended codes, e.g. BUSY_SNAPSHOT (517).
fn is_busy(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(e) => e
            .code()
            .and_then(|code| code.parse::<i32>().ok())
            .is_some_and(|code| code & 0xff == 5),
        _ => false,
    }
}

fn into_cards(rows: Vec<CardRow>) -> StoreResult<Vec<Card>> {
    rows.into_iter()
        .map(|row| Card::try_from(row).map_err(StoreError::from))
        .collect()
}

#[cfg(test)]
#[path = "db_tests.rs"]
mod tests;
