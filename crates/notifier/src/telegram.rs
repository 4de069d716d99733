//! Telegram Bot API dispatcher.
//!
//! Each outbox row maps to one Bot API call. Responses are classified into the closed
//! `DispatchResult` set; throttling is reported back to the caller, never slept on here.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};

use courier_common::types::{MediaItem, MessageContent, SendMethod};

use crate::dispatcher::{DispatchFailure, DispatchResult, Dispatcher};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error_code: Option<u16>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    #[serde(default)]
    retry_after: Option<u64>,
}

/// Classify a Bot API response.
///
/// HTTP 429 or a positive `retry_after` means throttled, 5xx is retryable and every other
/// error is permanent. A body that is not a Bot API response is judged by status alone.
pub fn classify_response(status: StatusCode, body: &str) -> DispatchResult {
    let parsed: Option<ApiResponse> = serde_json::from_str(body).ok();

    if let Some(resp) = &parsed
        && resp.ok
    {
        return DispatchResult::Ok(message_id(resp.result.as_ref()));
    }

    let code = parsed
        .as_ref()
        .and_then(|r| r.error_code)
        .and_then(|c| StatusCode::from_u16(c).ok())
        .unwrap_or(status);
    let retry_after = parsed
        .as_ref()
        .and_then(|r| r.parameters.as_ref())
        .and_then(|p| p.retry_after)
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs);

    if code == StatusCode::TOO_MANY_REQUESTS || retry_after.is_some() {
        return DispatchResult::RateLimited(retry_after);
    }

    if status.is_success() && parsed.is_none() {
        return DispatchResult::Failed(DispatchFailure::retryable(format!(
            "unreadable response body: {}",
            truncate(body)
        )));
    }

    let description = parsed
        .and_then(|r| r.description)
        .unwrap_or_else(|| truncate(body).to_string());
    let reason = format!("code={} desc={}", code.as_u16(), description);

    if code.is_server_error() {
        DispatchResult::Failed(DispatchFailure::retryable(reason))
    } else {
        DispatchResult::Failed(DispatchFailure::permanent(reason))
    }
}

/// `result` is a message for single sends and an array of messages for media groups.
fn message_id(result: Option<&Value>) -> Option<i64> {
    let message = match result? {
        Value::Array(messages) => messages.first()?,
        other => other,
    };
    message.get("message_id")?.as_i64()
}

fn truncate(body: &str) -> &str {
    match body.char_indices().nth(200) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

/// Request body for a Bot API method, or `None` when the content does not fit the method.
pub fn build_request(
    method: SendMethod,
    chat_id: i64,
    content: &MessageContent,
    thread_id: Option<i32>,
) -> Option<(&'static str, Value)> {
    let mut body = json!({ "chat_id": chat_id });
    let map = body.as_object_mut()?;

    let api_method = match method {
        SendMethod::Text => {
            map.insert("text".into(), json!(content.text.as_deref()?));
            "sendMessage"
        }
        SendMethod::Photo => {
            map.insert("photo".into(), json!(content.photo.as_deref()?));
            if let Some(caption) = &content.caption {
                map.insert("caption".into(), json!(caption));
            }
            "sendPhoto"
        }
        SendMethod::MediaGroup => {
            if content.media.is_empty() {
                return None;
            }
            let media: Vec<Value> = content
                .media
                .iter()
                .map(|item| {
                    let mut photo = json!({ "type": "photo", "media": item.url });
                    if let Some(caption) = &item.caption
                        && let Some(obj) = photo.as_object_mut()
                    {
                        obj.insert("caption".into(), json!(caption));
                    }
                    photo
                })
                .collect();
            map.insert("media".into(), Value::Array(media));
            "sendMediaGroup"
        }
    };

    if let Some(thread_id) = thread_id {
        map.insert("message_thread_id".into(), json!(thread_id));
    }
    if let Some(parse_mode) = &content.parse_mode {
        map.insert("parse_mode".into(), json!(parse_mode));
    }
    // Media groups do not accept reply markup.
    if method != SendMethod::MediaGroup
        && let Some(markup) = &content.reply_markup
    {
        map.insert("reply_markup".into(), markup.clone());
    }

    Some((api_method, body))
}

/// Dispatcher backed by the Telegram Bot HTTP API.
pub struct TelegramDispatcher {
    client: reqwest::Client,
    base_url: String,
}

impl TelegramDispatcher {
    pub fn new(api_url: &str, bot_token: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base_url: format!("{}/bot{}", api_url.trim_end_matches('/'), bot_token),
        })
    }

    async fn call(&self, api_method: &str, body: &Value) -> DispatchResult {
        let url = format!("{}/{}", self.base_url, api_method);
        let response = match self.client.post(&url).json(body).send().await {
            Ok(response) => response,
            Err(e) => {
                return DispatchResult::Failed(DispatchFailure::retryable(format!(
                    "transport error: {}",
                    e.without_url()
                )));
            }
        };

        let status = response.status();
        match response.text().await {
            Ok(text) => classify_response(status, &text),
            Err(e) => DispatchResult::Failed(DispatchFailure::retryable(format!(
                "failed to read response: {}",
                e.without_url()
            ))),
        }
    }

    /// Send the photos of a failed media group one by one. Stops at the first photo that
    /// does not go through and reports its outcome.
    async fn send_photos_individually(
        &self,
        chat_id: i64,
        media: &[MediaItem],
        content: &MessageContent,
        thread_id: Option<i32>,
    ) -> DispatchResult {
        let mut first_id = None;
        for item in media {
            let photo = MessageContent {
                parse_mode: content.parse_mode.clone(),
                ..MessageContent::photo(item.url.clone(), item.caption.clone())
            };
            let Some((api_method, body)) =
                build_request(SendMethod::Photo, chat_id, &photo, thread_id)
            else {
                continue;
            };
            match self.call(api_method, &body).await {
                DispatchResult::Ok(id) => {
                    first_id = first_id.or(id);
                }
                other => return other,
            }
        }
        DispatchResult::Ok(first_id)
    }
}

#[async_trait]
impl Dispatcher for TelegramDispatcher {
    async fn send(
        &self,
        method: SendMethod,
        chat_id: i64,
        content: &MessageContent,
        thread_id: Option<i32>,
    ) -> DispatchResult {
        let Some((api_method, body)) = build_request(method, chat_id, content, thread_id) else {
            return DispatchResult::Failed(DispatchFailure::permanent(format!(
                "payload does not fit method {}",
                method
            )));
        };

        let result = self.call(api_method, &body).await;

        match (method, result) {
            (SendMethod::MediaGroup, DispatchResult::Failed(failure)) => {
                tracing::warn!(
                    chat_id,
                    photos = content.media.len(),
                    reason = %failure.reason,
                    "Media group rejected, sending photos individually"
                );
                self.send_photos_individually(chat_id, &content.media, content, thread_id)
                    .await
            }
            (_, result) => result,
        }
    }
}
