//! Delivery batcher — packs one channel's new items into sink-sized units.
//!
//! Unit order is text, then photos, then documents. Each item's seen key
//! rides on the last unit carrying any of its content, so it is committed
//! only after everything the item contributed has been accepted.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::config::BatchLimits;
use crate::pipeline::format::ContentFormatter;
use crate::pipeline::identity::sha256_hex;
use crate::pipeline::types::{
    AttachmentOutcome, Channel, DeliveryUnit, FRAGMENT_SEPARATOR, ResolvedAttachment, SeenKey,
    UnitPayload, render_text,
};

/// One new item, formatted and with its attachments resolved.
#[derive(Debug, Clone)]
pub struct BatchItem {
    pub key: SeenKey,
    /// Rendered HTML fragment.
    pub fragment: String,
    pub attachments: Vec<AttachmentOutcome>,
}

/// A pooled attachment and the items that referenced it.
struct Pooled {
    file: ResolvedAttachment,
    owners: Vec<usize>,
}

#[derive(Default)]
struct Pool {
    entries: Vec<Pooled>,
    by_hash: HashMap<String, usize>,
}

impl Pool {
    fn add(&mut self, file: ResolvedAttachment, owner: usize) {
        let hash = sha256_hex(&file.bytes);
        match self.by_hash.get(&hash) {
            Some(&i) => {
                debug!(filename = %file.filename, "Duplicate attachment dropped");
                if !self.entries[i].owners.contains(&owner) {
                    self.entries[i].owners.push(owner);
                }
            }
            None => {
                self.by_hash.insert(hash, self.entries.len());
                self.entries.push(Pooled {
                    file,
                    owners: vec![owner],
                });
            }
        }
    }
}

pub struct DeliveryBatcher {
    limits: BatchLimits,
}

impl DeliveryBatcher {
    pub fn new(limits: BatchLimits) -> Self {
        Self {
            limits: BatchLimits {
                max_group_size: limits.max_group_size.max(1),
                ..limits
            },
        }
    }

    /// Pack `items` (chronological) for `channel`.
    pub fn batch(
        &self,
        formatter: &ContentFormatter,
        channel: &Channel,
        items: Vec<BatchItem>,
    ) -> Vec<DeliveryUnit> {
        let mut payloads: Vec<UnitPayload> = Vec::new();
        let mut last_unit: Vec<Option<usize>> = vec![None; items.len()];

        let mut keys = Vec::with_capacity(items.len());
        let mut notes: Vec<(usize, String)> = Vec::new();
        let mut photos = Pool::default();
        let mut documents = Pool::default();
        let mut fragments: Vec<(usize, String)> = Vec::new();

        for (idx, item) in items.into_iter().enumerate() {
            keys.push(item.key);
            if !item.fragment.is_empty() {
                fragments.push((idx, item.fragment));
            }
            for outcome in item.attachments {
                match outcome {
                    AttachmentOutcome::Resolved(file)
                        if file.is_image() && file.size_bytes <= self.limits.max_photo_bytes =>
                    {
                        photos.add(file, idx)
                    }
                    AttachmentOutcome::Resolved(file) => documents.add(file, idx),
                    AttachmentOutcome::Placeholder(p) => notes.push((idx, p.note())),
                }
            }
        }

        // Text units.
        let max = self.limits.max_text_len;
        let sep = FRAGMENT_SEPARATOR.chars().count();
        let mut current: Vec<String> = Vec::new();
        let mut current_len = 0;
        for (idx, fragment) in fragments {
            let len = fragment.chars().count();
            if len > max {
                warn!(channel = %channel.key, len, max, "Fragment exceeds text limit, sending alone");
            }
            if !current.is_empty() && current_len + sep + len > max {
                payloads.push(text_payload(std::mem::take(&mut current), Vec::new()));
                current_len = 0;
            }
            current_len = if current.is_empty() { len } else { current_len + sep + len };
            current.push(fragment);
            touch(&mut last_unit, idx, payloads.len());
        }
        if !current.is_empty() {
            payloads.push(text_payload(current, Vec::new()));
        }

        // Placeholder notes trail the final text unit.
        if !notes.is_empty() {
            let note_lines: Vec<String> = notes.iter().map(|(_, n)| n.clone()).collect();
            let fits = match payloads.last() {
                Some(UnitPayload::Text { fragments, .. }) => {
                    render_text(fragments, &note_lines).chars().count() <= max
                }
                _ => false,
            };
            if fits {
                if let Some(UnitPayload::Text {
                    placeholder_notes, ..
                }) = payloads.last_mut()
                {
                    *placeholder_notes = note_lines;
                }
            } else {
                payloads.push(text_payload(Vec::new(), note_lines));
            }
            let notes_unit = payloads.len() - 1;
            for (idx, _) in &notes {
                touch(&mut last_unit, *idx, notes_unit);
            }
        }

        // Photo units.
        let group_size = self.limits.max_group_size;
        let mut entries = photos.entries.into_iter().peekable();
        while entries.peek().is_some() {
            let chunk: Vec<Pooled> = entries.by_ref().take(group_size).collect();
            let unit = payloads.len();
            for pooled in &chunk {
                for owner in &pooled.owners {
                    touch(&mut last_unit, *owner, unit);
                }
            }
            let mut images: Vec<ResolvedAttachment> = chunk.into_iter().map(|p| p.file).collect();
            if images.len() == 1 {
                let caption = self.caption(channel, formatter.media_caption(channel, None));
                payloads.push(UnitPayload::Photo {
                    image: images.remove(0),
                    caption,
                });
            } else {
                let detail = format!("{} photos", images.len());
                let caption = self.caption(channel, formatter.media_caption(channel, Some(&detail)));
                payloads.push(UnitPayload::PhotoGroup { images, caption });
            }
        }

        // Document units.
        for pooled in documents.entries {
            let unit = payloads.len();
            for owner in &pooled.owners {
                touch(&mut last_unit, *owner, unit);
            }
            let caption = self.caption(
                channel,
                formatter.media_caption(channel, Some(&pooled.file.filename)),
            );
            payloads.push(UnitPayload::Document {
                file: pooled.file,
                caption,
            });
        }

        let mut units: Vec<DeliveryUnit> = payloads
            .into_iter()
            .map(|payload| DeliveryUnit {
                payload,
                completes: Vec::new(),
            })
            .collect();

        let Some(final_unit) = units.len().checked_sub(1) else {
            return units;
        };
        for (idx, key) in keys.into_iter().enumerate() {
            let unit = last_unit[idx].unwrap_or(final_unit);
            units[unit].completes.push(key);
        }

        debug!(channel = %channel.key, units = units.len(), "Batched channel items");
        units
    }

    /// Truncate a media caption, logging what was dropped.
    fn caption(&self, channel: &Channel, caption: String) -> String {
        let max = self.limits.max_caption_len;
        let len = caption.chars().count();
        if len <= max {
            return caption;
        }
        warn!(
            channel = %channel.key,
            dropped = len - max,
            "Caption over limit, truncating"
        );
        caption.chars().take(max).collect()
    }
}

/// Record that `item` has content in `unit`.
fn touch(last: &mut [Option<usize>], item: usize, unit: usize) {
    last[item] = Some(last[item].map_or(unit, |u| u.max(unit)));
}

fn text_payload(fragments: Vec<String>, placeholder_notes: Vec<String>) -> UnitPayload {
    UnitPayload::Text {
        fragments,
        placeholder_notes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::Placeholder;

    fn formatter() -> ContentFormatter {
        ContentFormatter::new(chrono_tz::Europe::Helsinki)
    }

    fn channel() -> Channel {
        Channel::new("alpha", "Alpha")
    }

    fn key(n: usize) -> SeenKey {
        SeenKey::from_hex(format!("k{n}"))
    }

    fn text_item(n: usize, fragment: &str) -> BatchItem {
        BatchItem {
            key: key(n),
            fragment: fragment.to_string(),
            attachments: vec![],
        }
    }

    fn image(bytes: &[u8], name: &str) -> AttachmentOutcome {
        AttachmentOutcome::Resolved(ResolvedAttachment {
            bytes: bytes.to_vec(),
            content_type: "image/png".into(),
            filename: name.into(),
            size_bytes: bytes.len() as u64,
        })
    }

    fn document(bytes: &[u8], name: &str) -> AttachmentOutcome {
        AttachmentOutcome::Resolved(ResolvedAttachment {
            bytes: bytes.to_vec(),
            content_type: "application/pdf".into(),
            filename: name.into(),
            size_bytes: bytes.len() as u64,
        })
    }

    fn batcher(max_text_len: usize) -> DeliveryBatcher {
        DeliveryBatcher::new(BatchLimits {
            max_text_len,
            max_caption_len: 20,
            max_group_size: 10,
            max_photo_bytes: 1024,
        })
    }

    fn fragments(unit: &DeliveryUnit) -> Vec<String> {
        match &unit.payload {
            UnitPayload::Text { fragments, .. } => fragments.clone(),
            other => panic!("expected text unit, got {other:?}"),
        }
    }

    #[test]
    fn packs_fragments_under_limit() {
        let items = vec![
            text_item(1, &"a".repeat(4)),
            text_item(2, &"b".repeat(4)),
            text_item(3, &"c".repeat(4)),
        ];
        // 4 + 2 + 4 = 10 fits; adding 2 + 4 more does not.
        let units = batcher(10).batch(&formatter(), &channel(), items);
        assert_eq!(units.len(), 2);
        assert_eq!(fragments(&units[0]), vec!["aaaa", "bbbb"]);
        assert_eq!(fragments(&units[1]), vec!["cccc"]);
        assert_eq!(units[0].completes, vec![key(1), key(2)]);
        assert_eq!(units[1].completes, vec![key(3)]);
        for unit in &units {
            assert!(unit.rendered_text().unwrap().chars().count() <= 10);
        }
    }

    #[test]
    fn oversized_fragment_sent_alone_unmodified() {
        let long = "x".repeat(25);
        let items = vec![text_item(1, "a"), text_item(2, &long), text_item(3, "b")];
        let units = batcher(10).batch(&formatter(), &channel(), items);
        assert_eq!(units.len(), 3);
        assert_eq!(fragments(&units[1]), vec![long]);
    }

    #[test]
    fn photos_dedup_and_chunk_by_ten() {
        let mut attachments: Vec<AttachmentOutcome> =
            (0..12u8).map(|n| image(&[n], &format!("{n}.png"))).collect();
        attachments.push(image(&[0], "dup.png"));
        let items = vec![BatchItem {
            key: key(1),
            fragment: "pics".into(),
            attachments,
        }];

        let units = batcher(100).batch(&formatter(), &channel(), items);
        let kinds: Vec<&str> = units.iter().map(|u| u.kind()).collect();
        assert_eq!(kinds, vec!["text", "photo_group", "photo_group"]);
        match &units[1].payload {
            UnitPayload::PhotoGroup { images, caption } => {
                assert_eq!(images.len(), 10);
                assert_eq!(caption, "Alpha · 10 photos");
            }
            other => panic!("unexpected {other:?}"),
        }
        match &units[2].payload {
            UnitPayload::PhotoGroup { images, .. } => assert_eq!(images.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
        // Key rides on the last unit carrying the item's content.
        assert!(units[0].completes.is_empty());
        assert_eq!(units[2].completes, vec![key(1)]);
    }

    #[test]
    fn single_photo_caption_is_truncated() {
        let ch = Channel::new("alpha", "A channel with a very long title");
        let items = vec![BatchItem {
            key: key(1),
            fragment: "x".into(),
            attachments: vec![image(b"png", "a.png")],
        }];
        let units = batcher(100).batch(&formatter(), &ch, items);
        match &units[1].payload {
            UnitPayload::Photo { caption, .. } => {
                assert_eq!(caption.chars().count(), 20);
                assert!(ch.display_name.starts_with(caption.as_str()));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn placeholder_notes_go_on_final_text_unit() {
        let items = vec![
            text_item(1, "first"),
            BatchItem {
                key: key(2),
                fragment: "second".into(),
                attachments: vec![AttachmentOutcome::Placeholder(Placeholder::unavailable("a.pdf"))],
            },
        ];
        let units = batcher(100).batch(&formatter(), &channel(), items);
        assert_eq!(units.len(), 1);
        assert_eq!(
            units[0].rendered_text().unwrap(),
            "first\n\nsecond\n[File unavailable: a.pdf]"
        );
        assert_eq!(units[0].completes, vec![key(1), key(2)]);
    }

    #[test]
    fn overflowing_notes_open_trailing_unit() {
        let items = vec![BatchItem {
            key: key(1),
            fragment: "y".repeat(95),
            attachments: vec![AttachmentOutcome::Placeholder(Placeholder::unavailable("a.pdf"))],
        }];
        let units = batcher(100).batch(&formatter(), &channel(), items);
        assert_eq!(units.len(), 2);
        assert!(units[0].completes.is_empty());
        assert_eq!(units[1].rendered_text().unwrap(), "[File unavailable: a.pdf]");
        assert_eq!(units[1].completes, vec![key(1)]);
    }

    #[test]
    fn documents_follow_photos_one_per_unit() {
        let items = vec![
            BatchItem {
                key: key(1),
                fragment: "docs".into(),
                attachments: vec![document(b"pdf1", "a.pdf"), image(b"img", "i.png")],
            },
            BatchItem {
                key: key(2),
                fragment: "more".into(),
                attachments: vec![document(b"pdf2", "b.pdf"), document(b"pdf1", "copy.pdf")],
            },
        ];
        let units = batcher(100).batch(&formatter(), &channel(), items);
        let kinds: Vec<&str> = units.iter().map(|u| u.kind()).collect();
        assert_eq!(kinds, vec!["text", "photo", "document", "document"]);
        match &units[2].payload {
            UnitPayload::Document { file, caption } => {
                assert_eq!(file.filename, "a.pdf");
                assert_eq!(caption, "Alpha · a.pdf");
            }
            other => panic!("unexpected {other:?}"),
        }
        // a.pdf also belongs to item 2 through its duplicate, but item 2's
        // last unit is b.pdf.
        assert_eq!(units[2].completes, vec![key(1)]);
        assert_eq!(units[3].completes, vec![key(2)]);
    }

    #[test]
    fn images_over_photo_limit_go_as_documents() {
        let big = vec![9u8; 2048];
        let items = vec![BatchItem {
            key: key(1),
            fragment: "scan".into(),
            attachments: vec![image(&big, "scan.png"), image(b"small", "thumb.png")],
        }];
        let units = batcher(100).batch(&formatter(), &channel(), items);
        let kinds: Vec<&str> = units.iter().map(|u| u.kind()).collect();
        assert_eq!(kinds, vec!["text", "photo", "document"]);
        match &units[2].payload {
            UnitPayload::Document { file, .. } => assert_eq!(file.filename, "scan.png"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(units[2].completes, vec![key(1)]);
    }

    #[test]
    fn empty_input_yields_no_units() {
        assert!(batcher(100).batch(&formatter(), &channel(), vec![]).is_empty());
    }
}
