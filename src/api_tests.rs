use super::*;
use std::collections::HashMap;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE},
        Method, Request,
    },
};
use serde_json::Value;
use tower::ServiceExt;

use crate::auth::StaticTokens;
use crate::llm::LlmError;
use crate::models::Role;

struct ScriptedLlm {
    reply: Result<String, u16>,
}

#[async_trait]
impl CompletionProvider for ScriptedLlm {
    async fn complete(&self, _system: &str, turns: &[Turn]) -> Result<String, LlmError> {
        // Every call ends with the message being answered.
        assert_eq!(turns.last().map(|t| t.role), Some(Role::User));
        match &self.reply {
            Ok(text) => Ok(text.clone()),
            Err(status) => Err(LlmError::Api {
                status: *status,
                body: "quota exceeded".to_string(),
            }),
        }
    }
}

async fn app(llm: Option<ScriptedLlm>) -> Router {
    let tokens = HashMap::from([
        ("alice-token".to_string(), "alice".to_string()),
        ("bob-token".to_string(), "bob".to_string()),
    ]);
    let state = ApiState {
        db: Db::in_memory().await,
        identity: Arc::new(StaticTokens::new(tokens)),
        llm: llm.map(|l| Arc::new(l) as Arc<dyn CompletionProvider>),
    };
    app_router(state)
}

async fn send(
    app: &Router,
    method: Method,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut req = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        req = req.header(AUTHORIZATION, format!("Bearer {token}"));
    }
    let req = match body {
        Some(body) => req
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => req.body(Body::empty()).unwrap(),
    };

    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn deck_with_card(app: &Router) -> (String, String) {
    let (status, deck) = send(
        app,
        Method::POST,
        "/decks",
        Some("alice-token"),
        Some(json!({ "name": "Vocab" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let deck_id = deck["id"].as_str().unwrap().to_string();

    let (status, card) = send(
        app,
        Method::POST,
        &format!("/decks/{deck_id}/cards"),
        Some("alice-token"),
        Some(json!({ "front": "食べる", "back": "to eat" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    (deck_id, card["id"].as_str().unwrap().to_string())
}

#[tokio::test]
async fn test_health_needs_no_token() {
    let app = app(None).await;
    let (status, body) = send(&app, Method::GET, "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_rejects_missing_or_unknown_token() {
    let app = app(None).await;

    let (status, body) = send(&app, Method::GET, "/decks", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "unauthorized");

    let (status, _) = send(&app, Method::GET, "/decks", Some("mallory"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_new_card_json_shape() {
    let app = app(None).await;
    let (_, card_id) = deck_with_card(&app).await;

    let (status, card) = send(&app, Method::GET, &format!("/cards/{card_id}"), Some("alice-token"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(card["front"], "食べる");
    assert_eq!(card["stage"], 0);
    assert_eq!(card["interval"], 0);
    assert_eq!(card["ease_factor"], 2.5);
    assert!(card["next_review"].is_string());
    assert!(card["last_reviewed_at"].is_null());
    assert!(card.get("user_id").is_none());
    assert!(card.get("version").is_none());
}

#[tokio::test]
async fn test_review_updates_schedule() {
    let app = app(None).await;
    let (_, card_id) = deck_with_card(&app).await;
    let uri = format!("/cards/{card_id}/review");

    let (status, card) = send(&app, Method::POST, &uri, Some("alice-token"), Some(json!({ "grade": 3 }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(card["interval"], 1);
    assert_eq!(card["stage"], 1);
    assert!((card["ease_factor"].as_f64().unwrap() - 2.36).abs() < 1e-9);
    assert!(card["last_reviewed_at"].is_string());

    let (_, card) = send(&app, Method::POST, &uri, Some("alice-token"), Some(json!({ "grade": 4 }))).await;
    assert_eq!(card["interval"], 6);
    assert_eq!(card["stage"], 2);

    let (_, card) = send(&app, Method::POST, &uri, Some("alice-token"), Some(json!({ "grade": 1 }))).await;
    assert_eq!(card["interval"], 0);
    assert_eq!(card["stage"], 0);
}

#[tokio::test]
async fn test_review_rejects_bad_grades() {
    let app = app(None).await;
    let (_, card_id) = deck_with_card(&app).await;
    let uri = format!("/cards/{card_id}/review");

    for grade in [0, 5, -1] {
        let (status, body) =
            send(&app, Method::POST, &uri, Some("alice-token"), Some(json!({ "grade": grade }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_grade");
    }

    let (status, body) =
        send(&app, Method::POST, &uri, Some("alice-token"), Some(json!({ "grade": "good" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "bad_request");

    // Nothing was applied.
    let (_, card) = send(&app, Method::GET, &format!("/cards/{card_id}"), Some("alice-token"), None).await;
    assert_eq!(card["stage"], 0);
    assert!(card["last_reviewed_at"].is_null());
}

#[tokio::test]
async fn test_review_of_foreign_card_is_not_found() {
    let app = app(None).await;
    let (_, card_id) = deck_with_card(&app).await;

    let (status, body) = send(
        &app,
        Method::POST,
        &format!("/cards/{card_id}/review"),
        Some("bob-token"),
        Some(json!({ "grade": 3 })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");
}

#[tokio::test]
async fn test_due_listing() {
    let app = app(None).await;
    let (deck_id, card_id) = deck_with_card(&app).await;
    send(
        &app,
        Method::POST,
        &format!("/decks/{deck_id}/cards"),
        Some("alice-token"),
        Some(json!({ "front": "見る", "back": "to see" })),
    )
    .await;

    let (status, due) = send(&app, Method::GET, "/cards/due", Some("alice-token"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(due["due_count"], 2);
    assert_eq!(due["cards"].as_array().unwrap().len(), 2);

    send(
        &app,
        Method::POST,
        &format!("/cards/{card_id}/review"),
        Some("alice-token"),
        Some(json!({ "grade": 4 })),
    )
    .await;

    let (_, due) = send(&app, Method::GET, "/cards/due?limit=5", Some("alice-token"), None).await;
    assert_eq!(due["due_count"], 1);
    assert_eq!(due["cards"][0]["front"], "見る");
}

#[tokio::test]
async fn test_due_limit_is_clamped() {
    let app = app(None).await;
    let (deck_id, _) = deck_with_card(&app).await;
    for front in ["見る", "飲む"] {
        send(
            &app,
            Method::POST,
            &format!("/decks/{deck_id}/cards"),
            Some("alice-token"),
            Some(json!({ "front": front, "back": "verb" })),
        )
        .await;
    }

    // Zero still returns one card.
    let (status, due) = send(&app, Method::GET, "/cards/due?limit=0", Some("alice-token"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(due["due_count"], 3);
    assert_eq!(due["cards"].as_array().unwrap().len(), 1);

    let (status, due) = send(&app, Method::GET, "/cards/due?limit=1000", Some("alice-token"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(due["cards"].as_array().unwrap().len(), 3);

    let (status, _) = send(&app, Method::GET, "/cards/due?limit=many", Some("alice-token"), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_deck_and_card_editing() {
    let app = app(None).await;
    let (deck_id, card_id) = deck_with_card(&app).await;

    let (status, body) = send(
        &app,
        Method::POST,
        "/decks",
        Some("alice-token"),
        Some(json!({ "name": "  " })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "bad_request");

    let (status, card) = send(
        &app,
        Method::PUT,
        &format!("/cards/{card_id}"),
        Some("alice-token"),
        Some(json!({ "front": "食べる", "back": "to eat (ichidan)" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(card["back"], "to eat (ichidan)");

    let (_, cards) = send(&app, Method::GET, &format!("/decks/{deck_id}/cards"), Some("alice-token"), None).await;
    assert_eq!(cards.as_array().unwrap().len(), 1);

    let (status, _) = send(&app, Method::DELETE, &format!("/decks/{deck_id}"), Some("alice-token"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = send(&app, Method::GET, &format!("/cards/{card_id}"), Some("alice-token"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_chat_round_trip() {
    let app = app(Some(ScriptedLlm {
        reply: Ok("Taberu means to eat.".to_string()),
    }))
    .await;

    let (status, chat) = send(&app, Method::POST, "/chats", Some("alice-token"), Some(json!({}))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(chat["title"], "New chat");
    let chat_id = chat["id"].as_str().unwrap().to_string();

    let (status, exchange) = send(
        &app,
        Method::POST,
        &format!("/chats/{chat_id}/messages"),
        Some("alice-token"),
        Some(json!({ "content": "What does taberu mean?" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(exchange["message"]["role"], "user");
    assert_eq!(exchange["reply"]["role"], "assistant");
    assert_eq!(exchange["reply"]["content"], "Taberu means to eat.");

    let (_, chat) = send(&app, Method::GET, &format!("/chats/{chat_id}"), Some("alice-token"), None).await;
    assert_eq!(chat["messages"].as_array().unwrap().len(), 2);

    let (status, _) = send(&app, Method::GET, &format!("/chats/{chat_id}"), Some("bob-token"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_chat_without_llm_is_unavailable() {
    let app = app(None).await;
    let (_, chat) = send(&app, Method::POST, "/chats", Some("alice-token"), Some(json!({ "title": "x" }))).await;
    let chat_id = chat["id"].as_str().unwrap();

    let (status, body) = send(
        &app,
        Method::POST,
        &format!("/chats/{chat_id}/messages"),
        Some("alice-token"),
        Some(json!({ "content": "hello" })),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "unavailable");
}

#[tokio::test]
async fn test_upstream_failure_is_bad_gateway() {
    let app = app(Some(ScriptedLlm { reply: Err(429) })).await;
    let (_, chat) = send(&app, Method::POST, "/chats", Some("alice-token"), None).await;
    let chat_id = chat["id"].as_str().unwrap();

    let (status, body) = send(
        &app,
        Method::POST,
        &format!("/chats/{chat_id}/messages"),
        Some("alice-token"),
        Some(json!({ "content": "hello" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"], "upstream_error");
}

#[tokio::test]
async fn test_failed_reply_stores_nothing() {
    let app = app(Some(ScriptedLlm { reply: Err(503) })).await;
    let (_, chat) = send(&app, Method::POST, "/chats", Some("alice-token"), None).await;
    let chat_id = chat["id"].as_str().unwrap().to_string();

    // A client retrying after the failure must not pile up copies of the message.
    for _ in 0..2 {
        let (status, _) = send(
            &app,
            Method::POST,
            &format!("/chats/{chat_id}/messages"),
            Some("alice-token"),
            Some(json!({ "content": "hello" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
    }

    let (status, chat) = send(&app, Method::GET, &format!("/chats/{chat_id}"), Some("alice-token"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(chat["messages"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_create_chat_body_is_validated() {
    let app = app(None).await;

    let (status, chat) = send(&app, Method::POST, "/chats", Some("alice-token"), None).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(chat["title"], "New chat");

    let (status, chat) = send(
        &app,
        Method::POST,
        "/chats",
        Some("alice-token"),
        Some(json!({ "title": "  Particles " })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(chat["title"], "Particles");

    let req = Request::builder()
        .method(Method::POST)
        .uri("/chats")
        .header(AUTHORIZATION, "Bearer alice-token")
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from("{\"title\": "))
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let (status, body) = send(
        &app,
        Method::POST,
        "/chats",
        Some("alice-token"),
        Some(json!({ "title": 7 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "bad_request");

    let (_, chats) = send(&app, Method::GET, "/chats", Some("alice-token"), None).await;
    assert_eq!(chats.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_generate_cards_from_chat() {
    let app = app(Some(ScriptedLlm {
        reply: Ok("```json\n[{\"front\":\"neko\",\"back\":\"cat\"},{\"front\":\"inu\",\"back\":\"dog\"}]\n```".to_string()),
    }))
    .await;
    let (deck_id, _) = deck_with_card(&app).await;
    let (_, chat) = send(&app, Method::POST, "/chats", Some("alice-token"), Some(json!({ "title": "Animals" }))).await;
    let chat_id = chat["id"].as_str().unwrap().to_string();
    let uri = format!("/chats/{chat_id}/flashcards");

    // Nothing to generate from yet.
    let (status, _) = send(&app, Method::POST, &uri, Some("alice-token"), Some(json!({ "deck_id": deck_id }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    send(
        &app,
        Method::POST,
        &format!("/chats/{chat_id}/messages"),
        Some("alice-token"),
        Some(json!({ "content": "animal words please" })),
    )
    .await;

    let (status, cards) = send(
        &app,
        Method::POST,
        &uri,
        Some("alice-token"),
        Some(json!({ "deck_id": deck_id, "count": 5 })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let cards = cards.as_array().unwrap();
    assert_eq!(cards.len(), 2);
    assert_eq!(cards[0]["front"], "neko");
    assert_eq!(cards[0]["interval"], 0);

    let (_, listed) = send(&app, Method::GET, &format!("/decks/{deck_id}/cards"), Some("alice-token"), None).await;
    assert_eq!(listed.as_array().unwrap().len(), 3);

    let (status, _) = send(
        &app,
        Method::POST,
        &uri,
        Some("alice-token"),
        Some(json!({ "deck_id": "no-such-deck" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
