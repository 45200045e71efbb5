//! Relay pipeline.
//!
//! Every channel visited in a cycle flows through:
//! 1. `ChannelEnumerator::fetch_items()` — channel-specific I/O
//! 2. `IdentityResolver::resolve()` — seen-key derivation, no I/O
//! 3. `AttachmentResolver::resolve()` — size-bounded fetches
//! 4. `ContentFormatter::render()` — HTML fragments
//! 5. `DeliveryBatcher::batch()` — sink-sized units
//! 6. `DeliverySink::deliver()` — one call per unit, then persist
//!
//! **Keys are only committed after the sink accepts their unit.**

pub mod attachments;
pub mod batcher;
pub mod format;
pub mod identity;
pub mod relay;
pub mod types;

pub use relay::{ChannelOutcome, ChannelReport, CycleReport, CycleStage, Relay, spawn_relay};
