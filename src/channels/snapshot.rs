//! Snapshot enumerator — reads channels and items from a scraper sidecar.
//!
//! The sidecar owns the browser session. It is handed the session file
//! path on every call and answers with JSON snapshots:
//!
//! - `GET {base}/channels?session=<path>`
//!   → `{"channels": [{"key"?, "display_name"}], "fetch_headers"?: {...}}`
//! - `GET {base}/channels/{key}/items?limit=N&session=<path>`
//!   → `{"items": [{"id"?, "text", "time"?, "sender"?, "kind"?, "attachments"}]}`

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use url::Url;

use crate::error::ChannelError;
use crate::pipeline::identity::sha256_hex;
use crate::pipeline::types::{
    AttachmentRef, Channel, ChannelEnumerator, ItemKind, RawItem, SessionContext,
};

#[derive(Debug, Deserialize)]
struct ChannelList {
    #[serde(default)]
    channels: Vec<ChannelEntry>,
    #[serde(default)]
    fetch_headers: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct ChannelEntry {
    #[serde(default)]
    key: Option<serde_json::Value>,
    #[serde(default, alias = "title")]
    display_name: String,
}

#[derive(Debug, Deserialize)]
struct ItemList {
    #[serde(default)]
    items: Vec<ItemEntry>,
}

#[derive(Debug, Deserialize)]
struct ItemEntry {
    #[serde(default)]
    id: Option<serde_json::Value>,
    #[serde(default)]
    text: String,
    #[serde(default)]
    time: Option<serde_json::Value>,
    #[serde(default)]
    sender: Option<String>,
    #[serde(default)]
    kind: ItemKind,
    #[serde(default)]
    attachments: Vec<AttachmentRef>,
}

/// Scalar JSON (string or number) as a trimmed string.
fn scalar(value: Option<serde_json::Value>) -> Option<String> {
    match value? {
        serde_json::Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Key for a channel the sidecar could not give a native id for.
pub fn fallback_channel_key(display_name: &str) -> String {
    format!("title:{}", &sha256_hex(display_name.trim().as_bytes())[..16])
}

/// Channel enumerator backed by the scraper sidecar's HTTP API.
pub struct SnapshotEnumerator {
    base: Url,
    max_items: usize,
    client: reqwest::Client,
    fetch_headers: RwLock<HeaderMap>,
}

impl SnapshotEnumerator {
    pub fn new(base_url: &str, max_items: usize) -> Result<Self, ChannelError> {
        let base = Url::parse(base_url)
            .map_err(|e| ChannelError::InvalidPayload(format!("invalid source URL {base_url}: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(ChannelError::InvalidPayload(format!(
                "source URL {base_url} cannot carry a path"
            )));
        }
        Ok(Self {
            base,
            max_items,
            client: reqwest::Client::new(),
            fetch_headers: RwLock::new(HeaderMap::new()),
        })
    }

    fn endpoint(&self, segments: &[&str], session: &SessionContext) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url.query_pairs_mut()
            .append_pair("session", &session.path().to_string_lossy());
        url
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, String> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| e.without_url().to_string())?;
        let status = resp.status();
        if !status.is_success() {
            return Err(format!("sidecar returned {status}"));
        }
        resp.json::<T>()
            .await
            .map_err(|e| format!("invalid JSON: {}", e.without_url()))
    }

    fn remember_headers(&self, raw: BTreeMap<String, String>) {
        let mut headers = HeaderMap::new();
        for (name, value) in raw {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(&value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => tracing::warn!(header = %name, "Ignoring invalid fetch header from sidecar"),
            }
        }
        if let Ok(mut slot) = self.fetch_headers.write() {
            *slot = headers;
        }
    }
}

#[async_trait]
impl ChannelEnumerator for SnapshotEnumerator {
    fn name(&self) -> &str {
        "snapshot"
    }

    async fn list_channels(&self, session: &SessionContext) -> Result<Vec<Channel>, ChannelError> {
        let url = self.endpoint(&["channels"], session);
        let list: ChannelList = self
            .get_json(url)
            .await
            .map_err(|reason| ChannelError::ListUnavailable { reason })?;

        self.remember_headers(list.fetch_headers);

        let mut channels = Vec::with_capacity(list.channels.len());
        for entry in list.channels {
            let display_name = entry.display_name.trim().to_string();
            let key = match scalar(entry.key) {
                Some(key) => key,
                None if !display_name.is_empty() => fallback_channel_key(&display_name),
                None => {
                    tracing::warn!("Sidecar listed a channel with neither key nor title, skipping");
                    continue;
                }
            };
            channels.push(Channel::new(key, display_name));
        }
        tracing::debug!(channels = channels.len(), "Channels listed");
        Ok(channels)
    }

    async fn fetch_items(
        &self,
        session: &SessionContext,
        channel: &Channel,
    ) -> Result<Vec<RawItem>, ChannelError> {
        let mut url = self.endpoint(&["channels", &channel.key, "items"], session);
        url.query_pairs_mut()
            .append_pair("limit", &self.max_items.to_string());

        let list: ItemList = self.get_json(url).await.map_err(|reason| ChannelError::Unavailable {
            key: channel.key.clone(),
            reason,
        })?;

        let mut items: Vec<RawItem> = list
            .items
            .into_iter()
            .map(|entry| RawItem {
                native_id: scalar(entry.id),
                channel_key: channel.key.clone(),
                text: entry.text,
                timestamp_raw: scalar(entry.time),
                sender: entry.sender.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()),
                kind: entry.kind,
                attachments: entry.attachments,
            })
            .collect();
        if items.len() > self.max_items {
            items.drain(..items.len() - self.max_items);
        }
        Ok(items)
    }

    fn attachment_headers(&self) -> HeaderMap {
        self.fetch_headers
            .read()
            .map(|h| h.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use mockito::Matcher;

    use super::*;

    fn session() -> SessionContext {
        SessionContext::new("state/storageState.json")
    }

    #[tokio::test]
    async fn lists_channels_with_fallback_keys() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/channels")
            .match_query(Matcher::UrlEncoded(
                "session".into(),
                "state/storageState.json".into(),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{
                    "channels": [
                        {"key": "-100123", "display_name": "Team"},
                        {"key": 777, "display_name": "Numbers"},
                        {"display_name": "Untitled chat"},
                        {"display_name": ""}
                    ],
                    "fetch_headers": {"cookie": "sid=abc"}
                }"#,
            )
            .create_async()
            .await;

        let enumerator = SnapshotEnumerator::new(&server.url(), 20).unwrap();
        let channels = enumerator.list_channels(&session()).await.unwrap();
        assert_eq!(channels.len(), 3);
        assert_eq!(channels[0], Channel::new("-100123", "Team"));
        assert_eq!(channels[1].key, "777");
        assert_eq!(channels[2].key, fallback_channel_key("Untitled chat"));
        assert!(channels[2].key.starts_with("title:"));
        assert_eq!(channels[2].key.len(), "title:".len() + 16);

        let headers = enumerator.attachment_headers();
        assert_eq!(headers.get("cookie").unwrap(), "sid=abc");
    }

    #[tokio::test]
    async fn list_failure_is_list_unavailable() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/channels")
            .match_query(Matcher::Any)
            .with_status(503)
            .create_async()
            .await;

        let enumerator = SnapshotEnumerator::new(&server.url(), 20).unwrap();
        let err = enumerator.list_channels(&session()).await.unwrap_err();
        assert!(matches!(err, ChannelError::ListUnavailable { .. }));
    }

    #[tokio::test]
    async fn fetches_items_oldest_first_and_capped() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/api/channels/c1/items")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("limit".into(), "2".into()),
                Matcher::UrlEncoded("session".into(), "state/storageState.json".into()),
            ]))
            .with_status(200)
            .with_body(
                r#"{"items": [
                    {"id": 1, "text": "old"},
                    {"id": "2", "text": "mid", "time": 1717236000, "sender": " Bob "},
                    {"text": "Alice joined", "kind": "system",
                     "attachments": [{"url": "http://h/a.png", "title": "a.png"}]}
                ]}"#,
            )
            .create_async()
            .await;

        let enumerator = SnapshotEnumerator::new(&format!("{}/api/", server.url()), 2).unwrap();
        let items = enumerator
            .fetch_items(&session(), &Channel::new("c1", "C"))
            .await
            .unwrap();

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].native_id.as_deref(), Some("2"));
        assert_eq!(items[0].timestamp_raw.as_deref(), Some("1717236000"));
        assert_eq!(items[0].sender.as_deref(), Some("Bob"));
        assert_eq!(items[0].channel_key, "c1");
        assert_eq!(items[1].native_id, None);
        assert_eq!(items[1].kind, ItemKind::System);
        assert_eq!(
            items[1].attachments,
            vec![AttachmentRef::url("http://h/a.png").with_title("a.png")]
        );
    }

    #[tokio::test]
    async fn item_failure_is_channel_unavailable() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/channels/c1/items")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body("<html>login</html>")
            .create_async()
            .await;

        let enumerator = SnapshotEnumerator::new(&server.url(), 20).unwrap();
        let err = enumerator
            .fetch_items(&session(), &Channel::new("c1", "C"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Unavailable { ref key, .. } if key == "c1"));
    }

    #[test]
    fn rejects_unusable_base() {
        assert!(SnapshotEnumerator::new("not a url", 20).is_err());
        assert!(SnapshotEnumerator::new("mailto:x@y", 20).is_err());
    }
}
