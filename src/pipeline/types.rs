//! Shared types for the relay pipeline.

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};

use crate::error::{ChannelError, DeliveryError};

// ── Channels and raw items ──────────────────────────────────────────

/// A conversation stream tracked independently for deduplication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    /// Stable key; becomes the seen-state bucket name.
    pub key: String,
    /// Human-readable title rendered in delivered content.
    pub display_name: String,
}

impl Channel {
    pub fn new(key: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            display_name: display_name.into(),
        }
    }
}

/// Whether an item was authored by a participant or emitted by the service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    #[default]
    Regular,
    /// Service notices ("X joined the chat").
    System,
}

/// A pointer to attached content that has not been fetched yet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, alias = "title")]
    pub display_title: Option<String>,
}

impl AttachmentRef {
    pub fn url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            display_title: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.display_title = Some(title.into());
        self
    }
}

/// One content item as captured from a channel. Immutable once captured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawItem {
    pub native_id: Option<String>,
    pub channel_key: String,
    pub text: String,
    pub timestamp_raw: Option<String>,
    pub sender: Option<String>,
    pub kind: ItemKind,
    pub attachments: Vec<AttachmentRef>,
}

impl RawItem {
    pub fn new(channel_key: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            native_id: None,
            channel_key: channel_key.into(),
            text: text.into(),
            timestamp_raw: None,
            sender: None,
            kind: ItemKind::Regular,
            attachments: Vec::new(),
        }
    }

    pub fn with_native_id(mut self, id: impl Into<String>) -> Self {
        self.native_id = Some(id.into());
        self
    }

    pub fn with_timestamp(mut self, raw: impl Into<String>) -> Self {
        self.timestamp_raw = Some(raw.into());
        self
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn with_kind(mut self, kind: ItemKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_attachment(mut self, attachment: AttachmentRef) -> Self {
        self.attachments.push(attachment);
        self
    }

    /// Items with neither text nor attachments carry nothing to deliver.
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty() && self.attachments.is_empty()
    }
}

// ── Identity ────────────────────────────────────────────────────────

/// Stable identity hash used to detect previously delivered content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SeenKey(String);

impl SeenKey {
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for SeenKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Attachments ─────────────────────────────────────────────────────

/// Fetched attachment bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct ResolvedAttachment {
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub filename: String,
    pub size_bytes: u64,
}

impl ResolvedAttachment {
    pub fn is_image(&self) -> bool {
        self.content_type.starts_with("image/")
    }
}

impl fmt::Debug for ResolvedAttachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedAttachment")
            .field("filename", &self.filename)
            .field("content_type", &self.content_type)
            .field("size_bytes", &self.size_bytes)
            .finish()
    }
}

/// Why an attachment was replaced by a placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderReason {
    TooLarge,
    Unavailable,
}

/// Stand-in for an attachment that could not be safely fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placeholder {
    pub filename: String,
    pub reason: PlaceholderReason,
    /// Declared or observed size, when known.
    pub size_bytes: Option<u64>,
}

impl Placeholder {
    pub fn unavailable(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            reason: PlaceholderReason::Unavailable,
            size_bytes: None,
        }
    }

    pub fn too_large(filename: impl Into<String>, size_bytes: u64) -> Self {
        Self {
            filename: filename.into(),
            reason: PlaceholderReason::TooLarge,
            size_bytes: Some(size_bytes),
        }
    }

    /// Plain-text note appended to the channel's final text unit.
    pub fn note(&self) -> String {
        match (self.reason, self.size_bytes) {
            (PlaceholderReason::TooLarge, Some(size)) => format!(
                "[File too large ({:.1} MB): {}]",
                size as f64 / (1024.0 * 1024.0),
                self.filename
            ),
            (PlaceholderReason::TooLarge, None) => format!("[File too large: {}]", self.filename),
            (PlaceholderReason::Unavailable, _) => format!("[File unavailable: {}]", self.filename),
        }
    }
}

/// Outcome of resolving one `AttachmentRef`. Every ref yields exactly one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentOutcome {
    Resolved(ResolvedAttachment),
    Placeholder(Placeholder),
}

// ── Delivery units ──────────────────────────────────────────────────

/// Shape of one atomic sink call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitPayload {
    /// HTML text fragments plus trailing plain placeholder notes.
    Text {
        fragments: Vec<String>,
        placeholder_notes: Vec<String>,
    },
    /// One photo with a plain caption.
    Photo {
        image: ResolvedAttachment,
        caption: String,
    },
    /// Up to ten photos; the caption goes on the first one.
    PhotoGroup {
        images: Vec<ResolvedAttachment>,
        caption: String,
    },
    /// One non-image file with a plain caption.
    Document {
        file: ResolvedAttachment,
        caption: String,
    },
}

/// One atomic call to the downstream sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryUnit {
    pub payload: UnitPayload,
    /// Items whose content is complete once this unit is accepted.
    pub completes: Vec<SeenKey>,
}

impl DeliveryUnit {
    pub fn kind(&self) -> &'static str {
        match self.payload {
            UnitPayload::Text { .. } => "text",
            UnitPayload::Photo { .. } => "photo",
            UnitPayload::PhotoGroup { .. } => "photo_group",
            UnitPayload::Document { .. } => "document",
        }
    }

    /// Render a text unit's body: fragments separated by a blank line,
    /// then one note per line.
    pub fn rendered_text(&self) -> Option<String> {
        match &self.payload {
            UnitPayload::Text {
                fragments,
                placeholder_notes,
            } => Some(render_text(fragments, placeholder_notes)),
            _ => None,
        }
    }
}

/// Separator placed between fragments of one text unit.
pub const FRAGMENT_SEPARATOR: &str = "\n\n";

pub(crate) fn render_text(fragments: &[String], notes: &[String]) -> String {
    let mut out = fragments.join(FRAGMENT_SEPARATOR);
    for note in notes {
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(&crate::pipeline::format::escape_html(note));
    }
    out
}

// ── Session context ─────────────────────────────────────────────────

/// Opaque session handoff consumed by the enumerator.
///
/// The relay only checks whether it exists; its contents belong to the
/// enumerator, which may refresh it.
#[derive(Debug, Clone)]
pub struct SessionContext {
    path: PathBuf,
}

impl SessionContext {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }
}

// ── Collaborator traits ─────────────────────────────────────────────

/// Produces the channels to watch and their current items.
#[async_trait]
pub trait ChannelEnumerator: Send + Sync {
    /// Enumerator name for logging.
    fn name(&self) -> &str;

    /// List channels to visit this cycle.
    async fn list_channels(&self, session: &SessionContext) -> Result<Vec<Channel>, ChannelError>;

    /// Fetch a channel's recent items, oldest first.
    async fn fetch_items(
        &self,
        session: &SessionContext,
        channel: &Channel,
    ) -> Result<Vec<RawItem>, ChannelError>;

    /// Headers attachment fetches should carry (cookies, auth).
    fn attachment_headers(&self) -> HeaderMap {
        HeaderMap::new()
    }
}

/// Accepts delivery units. A failure is never fatal to a cycle.
#[async_trait]
pub trait DeliverySink: Send + Sync {
    /// Sink name for logging.
    fn name(&self) -> &str;

    /// Deliver one unit in a single call.
    async fn deliver(&self, unit: &DeliveryUnit) -> Result<(), DeliveryError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_unit(fragments: &[&str], notes: &[&str]) -> DeliveryUnit {
        DeliveryUnit {
            payload: UnitPayload::Text {
                fragments: fragments.iter().map(|s| s.to_string()).collect(),
                placeholder_notes: notes.iter().map(|s| s.to_string()).collect(),
            },
            completes: vec![],
        }
    }

    #[test]
    fn rendered_text_joins_fragments_and_notes() {
        let unit = text_unit(&["<b>a</b>", "<b>b</b>"], &["[File unavailable: x.pdf]"]);
        assert_eq!(
            unit.rendered_text().unwrap(),
            "<b>a</b>\n\n<b>b</b>\n[File unavailable: x.pdf]"
        );
    }

    #[test]
    fn rendered_text_escapes_notes() {
        let unit = text_unit(&["x"], &["[File unavailable: <a>.txt]"]);
        assert!(unit.rendered_text().unwrap().contains("&lt;a&gt;.txt"));
    }

    #[test]
    fn placeholder_notes() {
        assert_eq!(
            Placeholder::unavailable("doc.pdf").note(),
            "[File unavailable: doc.pdf]"
        );
        assert_eq!(
            Placeholder::too_large("big.zip", 60 * 1024 * 1024).note(),
            "[File too large (60.0 MB): big.zip]"
        );
    }

    #[test]
    fn empty_item_detection() {
        assert!(RawItem::new("c", "   ").is_empty());
        assert!(!RawItem::new("c", "").with_attachment(AttachmentRef::url("http://x/a")).is_empty());
        assert!(!RawItem::new("c", "hi").is_empty());
    }

    #[test]
    fn resolved_attachment_debug_omits_bytes() {
        let a = ResolvedAttachment {
            bytes: vec![1, 2, 3],
            content_type: "image/png".into(),
            filename: "a.png".into(),
            size_bytes: 3,
        };
        let dbg = format!("{a:?}");
        assert!(dbg.contains("a.png"));
        assert!(!dbg.contains("[1, 2, 3]"));
        assert!(a.is_image());
    }

    #[test]
    fn item_kind_deserializes_snake_case() {
        let kind: ItemKind = serde_json::from_str("\"system\"").unwrap();
        assert_eq!(kind, ItemKind::System);
    }
}
