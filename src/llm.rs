use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::models::{ChatMessage, Role};

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const COMPLETION_TIMEOUT: Duration = Duration::from_secs(60);

pub const CHAT_SYSTEM_PROMPT: &str =
    "You are a study assistant. Answer questions about the material the user is learning concisely.";

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("completion request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("completion API returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("completion API returned no text")]
    Empty,
    #[error("could not extract flashcards: {0}")]
    Extraction(String),
}

/// One turn of a conversation sent to the model.
#[derive(Debug, Clone, PartialEq)]
pub struct Turn {
    pub role: Role,
    pub text: String,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }
}

impl From<&ChatMessage> for Turn {
    fn from(message: &ChatMessage) -> Self {
        Self {
            role: message.role,
            text: message.content.clone(),
        }
    }
}

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(&self, system: &str, turns: &[Turn]) -> Result<String, LlmError>;
}

#[derive(Clone)]
pub struct GeminiClient {
    api_key: String,
    model: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct GeminiResponse {
    candidates: Option<Vec<Candidate>>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

impl GeminiClient {
    pub fn new(api_key: String, model: String) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder().timeout(COMPLETION_TIMEOUT).build()?;
        Ok(Self {
            api_key,
            model,
            client,
        })
    }
}

#[async_trait]
impl CompletionProvider for GeminiClient {
    async fn complete(&self, system: &str, turns: &[Turn]) -> Result<String, LlmError> {
        let contents: Vec<_> = turns
            .iter()
            .map(|turn| {
                let role = match turn.role {
                    Role::User => "user",
                    Role::Assistant => "model",
                };
                json!({ "role": role, "parts": [{ "text": turn.text }] })
            })
            .collect();

        let body = json!({
            "systemInstruction": { "parts": [{ "text": system }] },
            "contents": contents,
        });

        let url = format!("{}/{}:generateContent", GEMINI_BASE_URL, self.model);

        let resp = self
            .client
            .post(&url)
            .query(&[("key", &self.api_key)])
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await?;
            return Err(LlmError::Api { status, body });
        }

        let gemini_resp: GeminiResponse = resp.json().await?;

        let text: String = gemini_resp
            .candidates
            .unwrap_or_default()
            .into_iter()
            .next()
            .and_then(|candidate| candidate.content)
            .map(|content| content.parts.into_iter().map(|p| p.text).collect())
            .unwrap_or_default();

        if text.trim().is_empty() {
            return Err(LlmError::Empty);
        }
        Ok(text)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedCard {
    pub front: String,
    pub back: String,
}

/// Asks the model for up to `count` flashcards covering `transcript`.
pub async fn generate_flashcards(
    provider: &dyn CompletionProvider,
    transcript: &[Turn],
    count: usize,
) -> Result<Vec<GeneratedCard>, LlmError> {
    let system = format!(
        "Create at most {count} flashcards from the conversation. Reply with only a JSON array \
         of objects with string fields \"front\" and \"back\"."
    );

    let mut turns = transcript.to_vec();
    turns.push(Turn::user("Generate the flashcards now."));

    let reply = provider.complete(&system, &turns).await?;
    extract_flashcards(&reply, count)
}

/// Pulls the JSON array of cards out of a model reply, tolerating code fences
/// and prose around it.
pub fn extract_flashcards(reply: &str, max: usize) -> Result<Vec<GeneratedCard>, LlmError> {
    let start = reply
        .find('[')
        .ok_or_else(|| LlmError::Extraction("reply contains no JSON array".to_string()))?;
    let end = reply
        .rfind(']')
        .filter(|end| *end > start)
        .ok_or_else(|| LlmError::Extraction("reply contains no JSON array".to_string()))?;

    let cards: Vec<GeneratedCard> = serde_json::from_str(&reply[start..=end])
        .map_err(|e| LlmError::Extraction(e.to_string()))?;

    let cards: Vec<GeneratedCard> = cards
        .into_iter()
        .map(|card| GeneratedCard {
            front: card.front.trim().to_string(),
            back: card.back.trim().to_string(),
        })
        .filter(|card| !card.front.is_empty() && !card.back.is_empty())
        .take(max)
        .collect();

    if cards.is_empty() {
        return Err(LlmError::Extraction("reply contained no usable cards".to_string()));
    }
    Ok(cards)
}
