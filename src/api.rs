use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Json, Path, Query, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;

use crate::auth::{AuthUser, IdentityProvider};
use crate::db::Db;
use crate::error::ApiError;
use crate::llm::{generate_flashcards, CompletionProvider, Turn, CHAT_SYSTEM_PROMPT};
use crate::models::{Card, Chat, ChatMessage, Deck};
use crate::srs::Grade;

const DEFAULT_DUE_LIMIT: u32 = 20;
const MAX_DUE_LIMIT: u32 = 200;
const DEFAULT_GENERATED_CARDS: usize = 5;
const MAX_GENERATED_CARDS: usize = 20;

#[derive(Clone)]
pub struct ApiState {
    pub db: Db,
    pub identity: Arc<dyn IdentityProvider>,
    /// `None` when no completion API is configured; chat endpoints then answer 503.
    pub llm: Option<Arc<dyn CompletionProvider>>,
}

impl ApiState {
    fn llm(&self) -> Result<&dyn CompletionProvider, ApiError> {
        self.llm
            .as_deref()
            .ok_or_else(|| ApiError::Unavailable("chat is not configured on this server".to_string()))
    }
}

pub fn app_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/decks", get(list_decks).post(create_deck))
        .route("/decks/:id", get(get_deck).put(update_deck).delete(delete_deck))
        .route("/decks/:id/cards", get(list_cards).post(create_card))
        .route("/cards/due", get(due_cards))
        .route("/cards/:id", get(get_card).put(update_card).delete(delete_card))
        .route("/cards/:id/review", post(review_card))
        .route("/chats", get(list_chats).post(create_chat))
        .route("/chats/:id", get(get_chat).delete(delete_chat))
        .route("/chats/:id/messages", post(post_message))
        .route("/chats/:id/flashcards", post(generate_cards))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

fn required(field: &str, value: &str) -> Result<String, ApiError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ApiError::BadRequest(format!("{field} must not be empty")));
    }
    Ok(value.to_string())
}

// --- Decks ---

#[derive(Deserialize)]
struct DeckRequest {
    name: String,
    description: Option<String>,
}

async fn list_decks(
    State(state): State<ApiState>,
    user: AuthUser,
) -> Result<Json<Vec<Deck>>, ApiError> {
    Ok(Json(state.db.list_decks(&user.id).await?))
}

async fn create_deck(
    State(state): State<ApiState>,
    user: AuthUser,
    payload: Result<Json<DeckRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(payload) = payload?;
    let name = required("name", &payload.name)?;
    let deck = state
        .db
        .create_deck(&user.id, &name, payload.description.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(deck)))
}

async fn get_deck(
    State(state): State<ApiState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Deck>, ApiError> {
    Ok(Json(state.db.get_deck(&user.id, &id).await?))
}

async fn update_deck(
    State(state): State<ApiState>,
    user: AuthUser,
    Path(id): Path<String>,
    payload: Result<Json<DeckRequest>, JsonRejection>,
) -> Result<Json<Deck>, ApiError> {
    let Json(payload) = payload?;
    let name = required("name", &payload.name)?;
    let deck = state
        .db
        .update_deck(&user.id, &id, &name, payload.description.as_deref())
        .await?;
    Ok(Json(deck))
}

async fn delete_deck(
    State(state): State<ApiState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.db.delete_deck(&user.id, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// --- Cards ---

#[derive(Deserialize)]
struct CardRequest {
    front: String,
    back: String,
}

async fn list_cards(
    State(state): State<ApiState>,
    user: AuthUser,
    Path(deck_id): Path<String>,
) -> Result<Json<Vec<Card>>, ApiError> {
    Ok(Json(state.db.list_cards(&user.id, &deck_id).await?))
}

async fn create_card(
    State(state): State<ApiState>,
    user: AuthUser,
    Path(deck_id): Path<String>,
    payload: Result<Json<CardRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(payload) = payload?;
    let front = required("front", &payload.front)?;
    let back = required("back", &payload.back)?;
    let card = state.db.create_card(&user.id, &deck_id, &front, &back).await?;
    Ok((StatusCode::CREATED, Json(card)))
}

async fn get_card(
    State(state): State<ApiState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Card>, ApiError> {
    Ok(Json(state.db.get_card(&user.id, &id).await?))
}

async fn update_card(
    State(state): State<ApiState>,
    user: AuthUser,
    Path(id): Path<String>,
    payload: Result<Json<CardRequest>, JsonRejection>,
) -> Result<Json<Card>, ApiError> {
    let Json(payload) = payload?;
    let front = required("front", &payload.front)?;
    let back = required("back", &payload.back)?;
    Ok(Json(state.db.update_card(&user.id, &id, &front, &back).await?))
}

async fn delete_card(
    State(state): State<ApiState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.db.delete_card(&user.id, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct ReviewRequest {
    // Kept wide so out-of-range grades reach validation instead of failing to parse.
    grade: i64,
}

async fn review_card(
    State(state): State<ApiState>,
    user: AuthUser,
    Path(id): Path<String>,
    payload: Result<Json<ReviewRequest>, JsonRejection>,
) -> Result<Json<Card>, ApiError> {
    let Json(payload) = payload?;
    let grade = Grade::try_from(payload.grade)?;
    let card = state.db.review_card(&user.id, &id, grade, Utc::now()).await?;
    Ok(Json(card))
}

#[derive(Deserialize)]
struct DueQuery {
    limit: Option<u32>,
}

#[derive(Serialize)]
struct DueResponse {
    due_count: i64,
    cards: Vec<Card>,
}

async fn due_cards(
    State(state): State<ApiState>,
    user: AuthUser,
    query: Result<Query<DueQuery>, QueryRejection>,
) -> Result<Json<DueResponse>, ApiError> {
    let Query(query) = query?;
    let limit = query.limit.unwrap_or(DEFAULT_DUE_LIMIT).clamp(1, MAX_DUE_LIMIT);
    let now = Utc::now();

    let cards = state.db.list_due_cards(&user.id, now, limit).await?;
    let due_count = state.db.count_due(&user.id, now).await?;
    Ok(Json(DueResponse { due_count, cards }))
}

// --- Chats ---

#[derive(Deserialize, Default)]
struct ChatRequest {
    title: Option<String>,
}

#[derive(Serialize)]
struct ChatWithMessages {
    #[serde(flatten)]
    chat: Chat,
    messages: Vec<ChatMessage>,
}

async fn list_chats(
    State(state): State<ApiState>,
    user: AuthUser,
) -> Result<Json<Vec<Chat>>, ApiError> {
    Ok(Json(state.db.list_chats(&user.id).await?))
}

async fn create_chat(
    State(state): State<ApiState>,
    user: AuthUser,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    // The body is optional, but when present it has to be a valid request.
    let payload: ChatRequest = if body.iter().all(u8::is_ascii_whitespace) {
        ChatRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::BadRequest(format!("invalid chat request: {e}")))?
    };
    let title = payload
        .title
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| "New chat".to_string());
    let chat = state.db.create_chat(&user.id, &title).await?;
    Ok((StatusCode::CREATED, Json(chat)))
}

async fn get_chat(
    State(state): State<ApiState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<ChatWithMessages>, ApiError> {
    let chat = state.db.get_chat(&user.id, &id).await?;
    let messages = state.db.list_messages(&chat.id).await?;
    Ok(Json(ChatWithMessages { chat, messages }))
}

async fn delete_chat(
    State(state): State<ApiState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.db.delete_chat(&user.id, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct MessageRequest {
    content: String,
}

#[derive(Serialize)]
struct MessageExchange {
    message: ChatMessage,
    reply: ChatMessage,
}

async fn post_message(
    State(state): State<ApiState>,
    user: AuthUser,
    Path(id): Path<String>,
    payload: Result<Json<MessageRequest>, JsonRejection>,
) -> Result<Json<MessageExchange>, ApiError> {
    let Json(payload) = payload?;
    let content = required("content", &payload.content)?;
    let llm = state.llm()?;
    let chat = state.db.get_chat(&user.id, &id).await?;

    let history = state.db.list_messages(&chat.id).await?;
    let mut turns: Vec<Turn> = history.iter().map(Turn::from).collect();
    turns.push(Turn::user(content.as_str()));

    // Nothing is stored unless the model answered.
    let text = llm.complete(CHAT_SYSTEM_PROMPT, &turns).await?;
    let (message, reply) = state.db.append_exchange(&chat.id, &content, &text).await?;

    Ok(Json(MessageExchange { message, reply }))
}

#[derive(Deserialize)]
struct GenerateRequest {
    deck_id: String,
    count: Option<usize>,
}

async fn generate_cards(
    State(state): State<ApiState>,
    user: AuthUser,
    Path(id): Path<String>,
    payload: Result<Json<GenerateRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(payload) = payload?;
    let count = payload
        .count
        .unwrap_or(DEFAULT_GENERATED_CARDS)
        .clamp(1, MAX_GENERATED_CARDS);
    let llm = state.llm()?;
    let chat = state.db.get_chat(&user.id, &id).await?;
    // The deck is checked before the completion call.
    state.db.get_deck(&user.id, &payload.deck_id).await?;

    let history = state.db.list_messages(&chat.id).await?;
    if history.is_empty() {
        return Err(ApiError::BadRequest("chat has no messages to generate from".to_string()));
    }
    let turns: Vec<Turn> = history.iter().map(Turn::from).collect();

    let generated = generate_flashcards(llm, &turns, count).await?;
    let sides: Vec<(String, String)> = generated.into_iter().map(|c| (c.front, c.back)).collect();
    let cards = state.db.create_cards(&user.id, &payload.deck_id, &sides).await?;

    log::info!("generated {} cards from chat {} into deck {}", cards.len(), chat.id, payload.deck_id);
    Ok((StatusCode::CREATED, Json(cards)))
}

#[cfg(test)]
#[path = "api_tests.rs"]
mod tests;
