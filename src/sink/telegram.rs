//! Telegram Bot API sink.
//!
//! Uses `sendMessage` to create and `editMessageText` to update. The Bot API
//! reports failures as `{"ok": false, "description": "..."}` with a 4xx status,
//! so the body is decoded regardless of status and the description is matched
//! to tell "message gone" and "nothing changed" apart from real failures.

use std::time::Duration;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::debug;

use super::{CreateError, EditError, NotificationSink};
use crate::error::Result;
use crate::types::{NotificationHandle, SubscriberId};

const NOT_FOUND: &str = "message to edit not found";
const NOT_MODIFIED: &str = "message is not modified";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

pub struct TelegramSink {
    client: reqwest::Client,
    /// `<api>/bot<token>`; never logged.
    base: String,
}

#[derive(Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Deserialize)]
struct SentMessage {
    message_id: i64,
}

impl TelegramSink {
    pub fn new(api_url: &str, token: &str) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            base: format!("{}/bot{token}", api_url.trim_end_matches('/')),
        })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        body: serde_json::Value,
    ) -> std::result::Result<ApiResponse<T>, String> {
        let response = self
            .client
            .post(format!("{}/{method}", self.base))
            .json(&body)
            .send()
            .await
            .map_err(|e| e.without_url().to_string())?;
        let status = response.status();
        let parsed = response
            .json::<ApiResponse<T>>()
            .await
            .map_err(|e| format!("{status}: {}", e.without_url()))?;
        debug!(method, %status, ok = parsed.ok, "bot api call");
        Ok(parsed)
    }
}

/// Map a failed edit description onto the three edit outcomes.
fn classify_edit_failure(description: &str) -> EditError {
    let lower = description.to_lowercase();
    if lower.contains(NOT_FOUND) {
        EditError::NotFound
    } else if lower.contains(NOT_MODIFIED) {
        EditError::Unchanged
    } else {
        EditError::Other(description.to_string())
    }
}

impl NotificationSink for TelegramSink {
    async fn create(
        &self,
        recipient: SubscriberId,
        text: &str,
    ) -> std::result::Result<NotificationHandle, CreateError> {
        let body = json!({ "chat_id": recipient.0, "text": text });
        let response = self
            .call::<SentMessage>("sendMessage", body)
            .await
            .map_err(CreateError)?;
        match response {
            ApiResponse { ok: true, result: Some(sent), .. } => {
                Ok(NotificationHandle(sent.message_id))
            }
            ApiResponse { description, .. } => Err(CreateError(
                description.unwrap_or_else(|| "sendMessage returned no message".into()),
            )),
        }
    }

    async fn edit(
        &self,
        recipient: SubscriberId,
        handle: NotificationHandle,
        text: &str,
    ) -> std::result::Result<(), EditError> {
        let body = json!({ "chat_id": recipient.0, "message_id": handle.0, "text": text });
        let response = self
            .call::<serde_json::Value>("editMessageText", body)
            .await
            .map_err(EditError::Other)?;
        if response.ok {
            return Ok(());
        }
        Err(classify_edit_failure(
            response.description.as_deref().unwrap_or("editMessageText failed"),
        ))
    }
}
