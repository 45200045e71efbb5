//! Content formatter — renders one item as an HTML fragment for the sink.
//!
//! Layout: bold channel title, italic time label, quoted sender, body.
//! All user text is HTML-escaped. Time labels are always rendered in one
//! fixed target zone regardless of where the raw value came from.

use std::sync::LazyLock;

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use regex::Regex;

use crate::pipeline::types::{Channel, ItemKind, RawItem};

static ISO_LIKE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d{4}-\d{2}-\d{2}T\d{2}:\d{2}").expect("valid regex"));
static BARE_HM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([01]?\d|2[0-3]):([0-5]\d)$").expect("valid regex"));
static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").expect("valid regex"));
static ANY_HM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|\D)([01]?\d|2[0-3]):([0-5]\d)(?:$|\D)").expect("valid regex"));

/// How far in the future a bare `HH:MM` may land before it is read as yesterday.
const FUTURE_TOLERANCE_MINUTES: i64 = 5;

/// Rendered label format.
const LABEL_FORMAT: &str = "%Y-%m-%d %H:%M";

const NAIVE_DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%d.%m.%Y %H:%M:%S",
    "%d.%m.%Y %H:%M",
    "%d.%m.%Y, %H:%M",
    "%d/%m/%Y %H:%M",
];

const NAIVE_DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d.%m.%Y", "%d/%m/%Y"];

/// Escape text for Telegram-style HTML: `&`, `<`, `>`, `"`.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(ch),
        }
    }
    out
}

/// Tag and entity tracking for [`split_html`].
#[derive(Default)]
struct Markup {
    in_tag: bool,
    in_entity: bool,
    tag: String,
    depth: usize,
}

impl Markup {
    /// Not inside a tag, an entity or an open element.
    fn at_boundary(&self) -> bool {
        !self.in_tag && !self.in_entity && self.depth == 0
    }

    fn advance(&mut self, c: char) {
        if self.in_tag {
            if c == '>' {
                self.in_tag = false;
                if self.tag.starts_with('/') {
                    self.depth = self.depth.saturating_sub(1);
                } else if !self.tag.ends_with('/') {
                    self.depth += 1;
                }
                self.tag.clear();
            } else {
                self.tag.push(c);
            }
        } else if self.in_entity {
            if c == ';' || c.is_whitespace() {
                self.in_entity = false;
            }
        } else if c == '<' {
            self.in_tag = true;
        } else if c == '&' {
            self.in_entity = true;
        }
    }
}

/// Last position in `chunk` where a cut leaves both sides well-formed:
/// a newline, then a space, then any boundary.
fn html_split_point(chunk: &str) -> Option<usize> {
    let mut markup = Markup::default();
    let (mut newline, mut space, mut any) = (None, None, None);
    for (i, c) in chunk.char_indices() {
        if i > 0 && markup.at_boundary() {
            match c {
                '\n' => newline = Some(i),
                ' ' => space = Some(i),
                _ => {}
            }
            any = Some(i);
        }
        markup.advance(c);
    }
    if markup.at_boundary() {
        any = Some(chunk.len());
    }
    newline.or(space).or(any)
}

/// Split rendered HTML into chunks of at most `max_chars` characters,
/// never inside a tag, an entity or an element. Markup with no such
/// boundary within the limit is hard-cut.
pub fn split_html(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut remaining = text;
    while !remaining.is_empty() {
        let Some((limit, _)) = remaining.char_indices().nth(max_chars) else {
            chunks.push(remaining.to_string());
            break;
        };
        let split_at = html_split_point(&remaining[..limit]).unwrap_or(limit);
        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }
    chunks
}

/// Strip tags and decode the entities [`escape_html`] produces.
pub fn html_to_plain(html: &str) -> String {
    TAG.replace_all(html, "")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

/// A rendered time label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeLabel {
    pub text: String,
    /// False when the raw value was not understood and "now" was used.
    pub parsed: bool,
}

/// Parse an opaque raw time value into the target zone.
///
/// Tried in order: ISO-8601-like, epoch digits, bare `HH:MM`, relative day
/// words, then generic date formats.
pub fn parse_time(raw: &str, now: DateTime<Utc>, tz: Tz) -> Option<DateTime<Tz>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if ISO_LIKE.is_match(raw) {
        if let Some(dt) = parse_absolute(raw, tz) {
            return Some(dt);
        }
    }

    if raw.chars().all(|c| c.is_ascii_digit()) {
        return parse_epoch(raw).map(|dt| dt.with_timezone(&tz));
    }

    if let Some(caps) = BARE_HM.captures(raw) {
        let (hour, minute) = (caps[1].parse().ok()?, caps[2].parse().ok()?);
        return anchor_bare_time(hour, minute, now, tz);
    }

    let lower = raw.to_lowercase();
    let days_back = if lower.contains("yesterday") || lower.contains("вчера") {
        Some(1)
    } else if lower.contains("today") || lower.contains("сегодня") {
        Some(0)
    } else {
        None
    };
    if let Some(days_back) = days_back {
        let time = ANY_HM
            .captures(raw)
            .and_then(|c| NaiveTime::from_hms_opt(c[1].parse().ok()?, c[2].parse().ok()?, 0))
            .unwrap_or(NaiveTime::MIN);
        let date = now.with_timezone(&tz).date_naive() - Duration::days(days_back);
        return local(tz, date.and_time(time));
    }

    parse_absolute(raw, tz)
}

fn parse_epoch(digits: &str) -> Option<DateTime<Utc>> {
    let n: i64 = digits.parse().ok()?;
    if digits.len() < 13 {
        DateTime::from_timestamp(n, 0)
    } else {
        DateTime::from_timestamp_millis(n)
    }
}

fn anchor_bare_time(hour: u32, minute: u32, now: DateTime<Utc>, tz: Tz) -> Option<DateTime<Tz>> {
    let today = now.with_timezone(&tz).date_naive();
    let time = NaiveTime::from_hms_opt(hour, minute, 0)?;
    let candidate = local(tz, today.and_time(time))?;
    if candidate.with_timezone(&Utc) > now + Duration::minutes(FUTURE_TOLERANCE_MINUTES) {
        let yesterday = today.pred_opt()?;
        return local(tz, yesterday.and_time(time));
    }
    Some(candidate)
}

/// Absolute formats: zoned first, then naive values read in the target zone.
fn parse_absolute(raw: &str, tz: Tz) -> Option<DateTime<Tz>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&tz));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(raw) {
        return Some(dt.with_timezone(&tz));
    }
    if let Ok(dt) = DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Some(dt.with_timezone(&tz));
    }
    for fmt in NAIVE_DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return local(tz, naive);
        }
    }
    for fmt in NAIVE_DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(raw, fmt) {
            return local(tz, date.and_time(NaiveTime::MIN));
        }
    }
    None
}

/// Local wall time in `tz`; the earlier instant wins on DST overlaps and a
/// gap shifts forward by an hour.
fn local(tz: Tz, naive: NaiveDateTime) -> Option<DateTime<Tz>> {
    tz.from_local_datetime(&naive)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(naive + Duration::hours(1))).earliest())
}

/// Renders items into HTML fragments.
#[derive(Debug, Clone)]
pub struct ContentFormatter {
    tz: Tz,
}

impl ContentFormatter {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    /// Label for a raw time value; unparsed values fall back to `now`.
    pub fn time_label(&self, raw: Option<&str>, now: DateTime<Utc>) -> Option<TimeLabel> {
        let raw = raw.map(str::trim).filter(|r| !r.is_empty())?;
        Some(match parse_time(raw, now, self.tz) {
            Some(dt) => TimeLabel {
                text: dt.format(LABEL_FORMAT).to_string(),
                parsed: true,
            },
            None => TimeLabel {
                text: now.with_timezone(&self.tz).format(LABEL_FORMAT).to_string(),
                parsed: false,
            },
        })
    }

    /// Render one item. `body` is the normalized text from identity resolution.
    pub fn render(&self, channel: &Channel, item: &RawItem, body: &str, now: DateTime<Utc>) -> String {
        // One line, so the header never spans a chunk boundary.
        let title = channel.display_name.split_whitespace().collect::<Vec<_>>().join(" ");
        let title = if title.is_empty() { "—" } else { title.as_str() };

        let mut out = format!("<b>{}</b>", escape_html(title));
        if let Some(label) = self.time_label(item.timestamp_raw.as_deref(), now) {
            if !label.parsed {
                tracing::debug!(
                    channel = %channel.key,
                    raw = ?item.timestamp_raw,
                    "Unparsed time label, substituting now"
                );
            }
            out.push_str(&format!(" <i>{}</i>", escape_html(&label.text)));
        }
        out.push_str("\n\n");

        let body = if body.trim().is_empty() {
            attachment_summary(item.attachments.len())
        } else {
            escape_html(body)
        };

        match item.kind {
            ItemKind::System => out.push_str(&format!("<i>[system]</i> {body}")),
            ItemKind::Regular => match item.sender.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
                Some(sender) => out.push_str(&format!("&quot;{}&quot;: {body}", escape_html(sender))),
                None => out.push_str(&body),
            },
        }
        out
    }

    /// Plain caption for media units.
    pub fn media_caption(&self, channel: &Channel, detail: Option<&str>) -> String {
        let title = channel.display_name.trim();
        match detail {
            Some(detail) if !title.is_empty() => format!("{title} · {detail}"),
            Some(detail) => detail.to_string(),
            None => title.to_string(),
        }
    }
}

fn attachment_summary(count: usize) -> String {
    match count {
        0 => String::new(),
        1 => "[attachment]".to_string(),
        n => format!("[{n} attachments]"),
    }
}
