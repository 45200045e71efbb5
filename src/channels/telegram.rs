//! Telegram sink — delivers units through the Bot API.
//!
//! Text units go out as `sendMessage` with HTML parse mode and link
//! previews disabled. Media go out as multipart `sendPhoto`,
//! `sendDocument` or `sendMediaGroup` (with `attach://` references).
//!
//! Requests Telegram rejects for their content are retried once in a
//! simpler shape (plain text, or photo as document), so a unit it can
//! never accept does not stall its channel forever.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::config::TelegramConfig;
use crate::error::DeliveryError;
use crate::pipeline::format::{escape_html, html_to_plain, split_html};
use crate::pipeline::types::{
    DeliverySink, DeliveryUnit, FRAGMENT_SEPARATOR, ResolvedAttachment, UnitPayload,
};

/// Maximum message length for Telegram's sendMessage API.
const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

/// Telegram accepts albums of 2..=10 items.
const MEDIA_GROUP_MAX: usize = 10;

const SINK_NAME: &str = "telegram";

/// Bot API response envelope.
#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
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

/// Telegram sink bound to one destination chat.
pub struct TelegramSink {
    bot_token: SecretString,
    chat_id: String,
    api_base: String,
    client: reqwest::Client,
}

impl TelegramSink {
    pub fn new(config: &TelegramConfig) -> Self {
        Self::with_client(config, reqwest::Client::new())
    }

    pub fn with_client(config: &TelegramConfig, client: reqwest::Client) -> Self {
        Self {
            bot_token: config.bot_token.clone(),
            chat_id: config.chat_id.clone(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            client,
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{method}",
            self.api_base,
            self.bot_token.expose_secret()
        )
    }

    /// Send HTML chunks in order; each rejected chunk is retried as plain text.
    async fn send_message(&self, chunks: &[String]) -> Result<(), DeliveryError> {
        for chunk in chunks {
            match self.post_message(chunk, true).await {
                Err(DeliveryError::Rejected { description, .. }) => {
                    tracing::warn!(
                        error = %description,
                        "Telegram HTML send failed, retrying as plain text"
                    );
                    self.post_message(&html_to_plain(chunk), false).await?;
                }
                other => other?,
            }
        }
        Ok(())
    }

    async fn post_message(&self, text: &str, html: bool) -> Result<(), DeliveryError> {
        let mut body = serde_json::json!({
            "chat_id": self.chat_id,
            "text": text,
            "disable_web_page_preview": true,
        });
        if html {
            body["parse_mode"] = serde_json::Value::String("HTML".into());
        }
        let resp = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&body)
            .send()
            .await;
        check_response("sendMessage", resp).await
    }

    /// A rejected photo (too big, bad dimensions) is re-sent as a document.
    async fn send_photo_or_document(
        &self,
        image: &ResolvedAttachment,
        caption: &str,
    ) -> Result<(), DeliveryError> {
        match self.send_photo(image, caption).await {
            Err(DeliveryError::Rejected { description, .. }) => {
                tracing::debug!(
                    filename = %image.filename,
                    error = %description,
                    "Photo rejected, retrying as document"
                );
                self.send_document(image, caption).await
            }
            other => other,
        }
    }

    async fn send_photo(&self, image: &ResolvedAttachment, caption: &str) -> Result<(), DeliveryError> {
        let form = with_caption(
            Form::new()
                .text("chat_id", self.chat_id.clone())
                .part("photo", file_part(image)),
            caption,
        );
        self.post_multipart("sendPhoto", form).await?;
        tracing::info!(filename = %image.filename, "Telegram photo sent");
        Ok(())
    }

    async fn send_document(&self, file: &ResolvedAttachment, caption: &str) -> Result<(), DeliveryError> {
        let form = with_caption(
            Form::new()
                .text("chat_id", self.chat_id.clone())
                .part("document", file_part(file)),
            caption,
        );
        self.post_multipart("sendDocument", form).await?;
        tracing::info!(filename = %file.filename, "Telegram document sent");
        Ok(())
    }

    /// Send 2..=10 photos as one album; the caption rides on the first.
    async fn send_media_group(
        &self,
        images: &[ResolvedAttachment],
        caption: &str,
    ) -> Result<(), DeliveryError> {
        let media: Vec<serde_json::Value> = images
            .iter()
            .enumerate()
            .map(|(i, _)| {
                let mut entry = serde_json::json!({
                    "type": "photo",
                    "media": format!("attach://photo{i}"),
                });
                if i == 0 && !caption.is_empty() {
                    entry["caption"] = serde_json::Value::String(caption.to_string());
                }
                entry
            })
            .collect();

        let mut form = Form::new()
            .text("chat_id", self.chat_id.clone())
            .text("media", serde_json::Value::Array(media).to_string());
        for (i, image) in images.iter().enumerate() {
            form = form.part(format!("photo{i}"), file_part(image));
        }

        match self.post_multipart("sendMediaGroup", form).await {
            Err(DeliveryError::Rejected { description, .. }) => {
                tracing::warn!(
                    count = images.len(),
                    error = %description,
                    "Media group rejected, sending items one by one"
                );
                for (i, image) in images.iter().enumerate() {
                    let caption = if i == 0 { caption } else { "" };
                    self.send_photo_or_document(image, caption).await?;
                }
            }
            other => other?,
        }
        tracing::info!(count = images.len(), "Telegram media group sent");
        Ok(())
    }

    async fn post_multipart(&self, method: &str, form: Form) -> Result<(), DeliveryError> {
        let resp = self
            .client
            .post(self.api_url(method))
            .multipart(form)
            .send()
            .await;
        check_response(method, resp).await
    }
}

#[async_trait]
impl DeliverySink for TelegramSink {
    fn name(&self) -> &str {
        SINK_NAME
    }

    async fn deliver(&self, unit: &DeliveryUnit) -> Result<(), DeliveryError> {
        match &unit.payload {
            UnitPayload::Text {
                fragments,
                placeholder_notes,
            } => {
                let html = unit.rendered_text().unwrap_or_default();
                if html.trim().is_empty() {
                    return Err(DeliveryError::InvalidUnit("empty text unit".into()));
                }
                let chunks = if html.chars().count() <= TELEGRAM_MAX_MESSAGE_LENGTH {
                    vec![html]
                } else {
                    message_chunks(fragments, placeholder_notes, TELEGRAM_MAX_MESSAGE_LENGTH)
                };
                self.send_message(&chunks).await
            }
            UnitPayload::Photo { image, caption } => self.send_photo_or_document(image, caption).await,
            UnitPayload::Document { file, caption } => self.send_document(file, caption).await,
            UnitPayload::PhotoGroup { images, caption } => match images.len() {
                0 => Err(DeliveryError::InvalidUnit("empty photo group".into())),
                1 => self.send_photo_or_document(&images[0], caption).await,
                n if n > MEDIA_GROUP_MAX => Err(DeliveryError::InvalidUnit(format!(
                    "photo group of {n} exceeds {MEDIA_GROUP_MAX}"
                ))),
                _ => self.send_media_group(images, caption).await,
            },
        }
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn file_part(file: &ResolvedAttachment) -> Part {
    Part::bytes(file.bytes.clone()).file_name(file.filename.clone())
}

fn with_caption(form: Form, caption: &str) -> Form {
    if caption.is_empty() {
        form
    } else {
        form.text("caption", caption.to_string())
    }
}

/// Map a Bot API response to accept/reject. The error text never carries
/// the request URL, since it embeds the bot token.
async fn check_response(
    method: &str,
    resp: Result<reqwest::Response, reqwest::Error>,
) -> Result<(), DeliveryError> {
    let resp = resp.map_err(|e| DeliveryError::Network {
        sink: SINK_NAME.into(),
        reason: e.without_url().to_string(),
    })?;
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    let parsed: Option<ApiResponse> = serde_json::from_str(&body).ok();

    if status.as_u16() == 429 {
        let retry_after = parsed
            .as_ref()
            .and_then(|r| r.parameters.as_ref())
            .and_then(|p| p.retry_after)
            .map(std::time::Duration::from_secs);
        tracing::warn!(method, ?retry_after, "Telegram rate limited");
        return Err(DeliveryError::RateLimited {
            sink: SINK_NAME.into(),
            retry_after,
        });
    }

    let accepted = status.is_success() && parsed.as_ref().is_none_or(|r| r.ok);
    if accepted {
        return Ok(());
    }

    let description = parsed
        .and_then(|r| r.description)
        .unwrap_or_else(|| format!("HTTP {status}"));
    tracing::warn!(method, status = %status, description = %description, "Telegram rejected request");
    Err(DeliveryError::Rejected {
        sink: SINK_NAME.into(),
        method: method.to_string(),
        description,
    })
}

/// Chunks of at most `max_chars` for a text unit too long for one message.
/// Fragments stay whole where they fit; an oversized fragment is cut in its
/// body and every piece repeats its header line.
fn message_chunks(fragments: &[String], notes: &[String], max_chars: usize) -> Vec<String> {
    let mut pieces: Vec<String> = Vec::new();
    for fragment in fragments {
        pieces.extend(split_fragment(fragment, max_chars));
    }
    if !notes.is_empty() {
        let notes: Vec<String> = notes.iter().map(|n| escape_html(n)).collect();
        pieces.extend(split_html(&notes.join("\n"), max_chars));
    }

    let sep = FRAGMENT_SEPARATOR.chars().count();
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;
    for piece in pieces {
        let len = piece.chars().count();
        if !current.is_empty() && current_len + sep + len > max_chars {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if !current.is_empty() {
            current.push_str(FRAGMENT_SEPARATOR);
            current_len += sep;
        }
        current.push_str(&piece);
        current_len += len;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

fn split_fragment(fragment: &str, max_chars: usize) -> Vec<String> {
    if fragment.chars().count() <= max_chars {
        return vec![fragment.to_string()];
    }
    if let Some((header, body)) = fragment.split_once(FRAGMENT_SEPARATOR) {
        let prefix = header.chars().count() + FRAGMENT_SEPARATOR.chars().count();
        if prefix < max_chars / 2 {
            return split_html(body, max_chars - prefix)
                .into_iter()
                .map(|part| format!("{header}{FRAGMENT_SEPARATOR}{part}"))
                .collect();
        }
    }
    split_html(fragment, max_chars)
}

// ── Tests ───────────────────────────────────────────────────────────
