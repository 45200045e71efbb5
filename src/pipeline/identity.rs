//! Item identity — derives the dedup key for each raw item.
//!
//! Items carrying a native id hash `(channel, id)` so edits never
//! re-trigger delivery. Items without one hash their normalized text plus
//! ordered attachment fingerprints, so an edited untitled item is new.

use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::pipeline::types::{AttachmentRef, RawItem, SeenKey};

/// How much the normalizer trusts its own stripping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confidence {
    High,
    /// Stripping was not applied because it looked wrong.
    Low,
}

/// Normalized body text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Normalized {
    pub text: String,
    pub confidence: Confidence,
}

/// Removes header information (sender, time) that the scraping layer may
/// have concatenated into an item's body.
pub trait TextNormalizer: Send + Sync {
    fn normalize(&self, text: &str, sender: Option<&str>) -> Normalized;
}

/// Default normalizer: whitespace collapsing plus header-line stripping.
pub struct HeaderStripNormalizer {
    leading_time: Regex,
    leading_date: Regex,
    time_line: Regex,
    badges: Vec<String>,
}

impl HeaderStripNormalizer {
    pub fn new() -> Self {
        Self {
            leading_time: Regex::new(r"^[0-2]?\d:[0-5]\d\s*[-—–:]*\s*").expect("valid regex"),
            leading_date: Regex::new(r"^\d{1,2}\s+[А-Яа-яёЁ]+\s+\d{4}\s*г\.?\s*").expect("valid regex"),
            time_line: Regex::new(r"(?i)^[0-2]?\d:[0-5]\d(\s+(ред\.?|edited))?$")
                .expect("valid regex"),
            badges: vec!["владелец".into(), "owner".into(), "admin".into()],
        }
    }

    fn is_badge(&self, line: &str) -> bool {
        self.badges.iter().any(|b| line.eq_ignore_ascii_case(b) || line == b.as_str())
    }

    fn is_header_line(&self, line: &str, sender: Option<&str>) -> bool {
        sender.is_some_and(|s| !s.trim().is_empty() && line == s.trim())
            || self.time_line.is_match(line)
            || self.is_badge(line)
    }
}

impl Default for HeaderStripNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl TextNormalizer for HeaderStripNormalizer {
    fn normalize(&self, text: &str, sender: Option<&str>) -> Normalized {
        let collapsed = collapse_whitespace(text);
        let mut lines: Vec<&str> = collapsed.lines().collect();

        while lines.first().is_some_and(|l| self.is_header_line(l, sender)) {
            lines.remove(0);
        }
        while lines
            .last()
            .is_some_and(|l| self.time_line.is_match(l) || self.is_badge(l))
        {
            lines.pop();
        }

        let mut stripped = lines.join("\n");
        if let Some(m) = self.leading_time.find(&stripped) {
            stripped = stripped[m.end()..].to_string();
        }
        if let Some(m) = self.leading_date.find(&stripped) {
            stripped = stripped[m.end()..].to_string();
        }
        let stripped = stripped.trim().to_string();

        if stripped.is_empty() && !collapsed.is_empty() {
            return Normalized {
                text: collapsed,
                confidence: Confidence::Low,
            };
        }

        Normalized {
            text: stripped,
            confidence: Confidence::High,
        }
    }
}

/// CRLF → LF, trim every line, drop blank lines, collapse space/tab runs.
pub fn collapse_whitespace(text: &str) -> String {
    text.replace("\r\n", "\n")
        .lines()
        .map(|line| line.split([' ', '\t']).filter(|w| !w.is_empty()).collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Identity of one raw item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemIdentity {
    pub key: SeenKey,
    /// Normalized body used for rendering.
    pub body: String,
    pub confidence: Confidence,
}

/// Computes seen keys. Pure: no I/O, no state.
pub struct IdentityResolver {
    normalizer: Box<dyn TextNormalizer>,
}

impl IdentityResolver {
    pub fn new(normalizer: Box<dyn TextNormalizer>) -> Self {
        Self { normalizer }
    }

    pub fn resolve(&self, item: &RawItem) -> ItemIdentity {
        let normalized = self.normalizer.normalize(&item.text, item.sender.as_deref());
        if normalized.confidence == Confidence::Low {
            debug!(
                channel = %item.channel_key,
                native_id = ?item.native_id,
                "Header stripping skipped (low confidence), keeping body as-is"
            );
        }

        let key = match item.native_id.as_deref().filter(|id| !id.is_empty()) {
            Some(id) => native_key(&item.channel_key, id),
            None => {
                let fingerprints: Vec<String> =
                    item.attachments.iter().map(attachment_fingerprint).collect();
                content_key(&item.channel_key, &normalized.text, &fingerprints)
            }
        };

        ItemIdentity {
            key,
            body: normalized.text,
            confidence: normalized.confidence,
        }
    }
}

impl Default for IdentityResolver {
    fn default() -> Self {
        Self::new(Box::new(HeaderStripNormalizer::new()))
    }
}

/// Key of an item with a native id.
pub fn native_key(channel_key: &str, native_id: &str) -> SeenKey {
    hash_canonical(&serde_json::json!(["id", channel_key, native_id]))
}

/// Key of an item identified by its content.
pub fn content_key(channel_key: &str, normalized_text: &str, fingerprints: &[String]) -> SeenKey {
    hash_canonical(&serde_json::json!([
        "content",
        channel_key,
        normalized_text,
        fingerprints
    ]))
}

/// Fingerprint of an attachment before it is fetched.
pub fn attachment_fingerprint(attachment: &AttachmentRef) -> String {
    match (&attachment.url, &attachment.display_title) {
        (Some(url), _) => format!("url:{url}"),
        (None, Some(title)) => format!("title:{title}"),
        (None, None) => "none".to_string(),
    }
}

/// SHA-256 hex digest of arbitrary bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn hash_canonical(value: &serde_json::Value) -> SeenKey {
    SeenKey::from_hex(sha256_hex(value.to_string().as_bytes()))
}
