//! Attachment resolver — fetches attachment bytes under a size policy.
//!
//! Every `AttachmentRef` yields exactly one outcome. Anything that cannot be
//! fetched safely becomes a placeholder note, never an error.

use reqwest::header::{CONTENT_DISPOSITION, CONTENT_TYPE, HeaderMap};
use tracing::{debug, warn};
use url::Url;

use crate::config::AttachmentLimits;
use crate::pipeline::identity::sha256_hex;
use crate::pipeline::types::{AttachmentOutcome, AttachmentRef, Placeholder, ResolvedAttachment};

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Fetches attachments over HTTP.
pub struct AttachmentResolver {
    client: reqwest::Client,
    limits: AttachmentLimits,
}

impl AttachmentResolver {
    pub fn new(limits: AttachmentLimits) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(limits.timeout).build()?;
        Ok(Self::with_client(client, limits))
    }

    pub fn with_client(client: reqwest::Client, limits: AttachmentLimits) -> Self {
        Self { client, limits }
    }

    /// Resolve one attachment. `headers` are the enumerator's session headers.
    pub async fn resolve(&self, attachment: &AttachmentRef, headers: &HeaderMap) -> AttachmentOutcome {
        let title = attachment
            .display_title
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty());

        let Some(url) = attachment.url.as_deref().and_then(parse_http_url) else {
            debug!(url = ?attachment.url, title = ?title, "Attachment has no fetchable URL");
            return AttachmentOutcome::Placeholder(Placeholder::unavailable(title.unwrap_or("file")));
        };

        let url_name = filename_from_url(&url);
        let hint = url_name.as_deref().or(title).unwrap_or("file").to_string();

        let mut resp = match self.client.get(url.clone()).headers(headers.clone()).send().await {
            Ok(resp) => resp,
            Err(e) => {
                warn!(url = %url, error = %e, "Attachment fetch failed");
                return AttachmentOutcome::Placeholder(Placeholder::unavailable(hint));
            }
        };

        let status = resp.status();
        if !status.is_success() {
            warn!(url = %url, status = %status, "Attachment fetch rejected");
            return AttachmentOutcome::Placeholder(Placeholder::unavailable(hint));
        }

        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(';').next())
            .map(|v| v.trim().to_ascii_lowercase())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());

        let named = resp
            .headers()
            .get(CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(filename_from_disposition)
            .or(url_name)
            .or_else(|| title.map(str::to_string));

        let max = self.limits.max_bytes;
        if let Some(declared) = resp.content_length().filter(|len| *len > max) {
            warn!(url = %url, declared, max, "Attachment too large, not downloading");
            let name = named.unwrap_or(hint);
            return AttachmentOutcome::Placeholder(Placeholder::too_large(name, declared));
        }

        let mut bytes = Vec::new();
        let mut total: u64 = 0;
        loop {
            match resp.chunk().await {
                Ok(Some(chunk)) => {
                    total += chunk.len() as u64;
                    if total <= max {
                        bytes.extend_from_slice(&chunk);
                    } else if !bytes.is_empty() {
                        bytes = Vec::new();
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(url = %url, error = %e, "Attachment body read failed");
                    return AttachmentOutcome::Placeholder(Placeholder::unavailable(named.unwrap_or(hint)));
                }
            }
        }

        if total > max {
            warn!(url = %url, size = total, max, "Attachment too large after download");
            return AttachmentOutcome::Placeholder(Placeholder::too_large(named.unwrap_or(hint), total));
        }

        let filename = named.unwrap_or_else(|| generated_name(&bytes, &content_type));
        debug!(url = %url, filename = %filename, size = total, "Attachment resolved");
        AttachmentOutcome::Resolved(ResolvedAttachment {
            bytes,
            content_type,
            filename,
            size_bytes: total,
        })
    }
}

fn parse_http_url(raw: &str) -> Option<Url> {
    Url::parse(raw.trim())
        .ok()
        .filter(|u| matches!(u.scheme(), "http" | "https"))
}

fn filename_from_url(url: &Url) -> Option<String> {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .map(percent_decode)
        .map(|s| sanitize_filename(&s))
        .filter(|s| !s.is_empty())
}

/// `filename*=` (RFC 5987) wins over a plain `filename=`.
fn filename_from_disposition(value: &str) -> Option<String> {
    let mut plain = None;
    for (name, raw) in disposition_params(value) {
        match name.to_ascii_lowercase().as_str() {
            "filename*" => {
                let encoded = raw.splitn(3, '\'').nth(2).unwrap_or(raw.as_str());
                let decoded = sanitize_filename(&percent_decode(encoded));
                if !decoded.is_empty() {
                    return Some(decoded);
                }
            }
            "filename" => plain = Some(sanitize_filename(&raw)),
            _ => {}
        }
    }
    plain.filter(|p| !p.is_empty())
}

/// `name=value` pairs of a header value. `;` inside a quoted string is data.
fn disposition_params(value: &str) -> Vec<(String, String)> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut escaped = false;
    for c in value.chars() {
        match c {
            _ if escaped => escaped = false,
            '\\' if quoted => escaped = true,
            '"' => quoted = !quoted,
            ';' if !quoted => {
                segments.push(std::mem::take(&mut current));
                continue;
            }
            _ => {}
        }
        current.push(c);
    }
    segments.push(current);

    segments
        .iter()
        .filter_map(|segment| segment.split_once('='))
        .map(|(name, raw)| (name.trim().to_string(), unquote(raw.trim())))
        .collect()
}

fn unquote(raw: &str) -> String {
    let Some(inner) = raw.strip_prefix('"') else {
        return raw.to_string();
    };
    let inner = inner.strip_suffix('"').unwrap_or(inner);
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => out.extend(chars.next()),
            _ => out.push(c),
        }
    }
    out
}

/// Keep only the last path component.
fn sanitize_filename(name: &str) -> String {
    name.rsplit(['/', '\\']).next().unwrap_or("").trim().to_string()
}

fn percent_decode(input: &str) -> String {
    String::from_utf8_lossy(&urlencoding::decode_binary(input.as_bytes())).into_owned()
}

fn generated_name(bytes: &[u8], content_type: &str) -> String {
    let hash = sha256_hex(bytes);
    let ext = mime_guess::get_mime_extensions_str(content_type)
        .and_then(|exts| exts.first())
        .copied()
        .unwrap_or("bin");
    format!("attachment-{}.{ext}", &hash[..8])
}
