//! Relay orchestration — one poll cycle over every channel, and the loop
//! that repeats it.
//!
//! Per channel: fetch → dedup → resolve attachments → format → batch →
//! deliver sequentially → persist. A delivery failure halts the channel
//! for this cycle; keys of units already accepted are still persisted.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::channels::{SnapshotEnumerator, TelegramSink};
use crate::config::{BatchLimits, CycleConfig, RelayConfig};
use crate::error::{self, PipelineError};
use crate::pipeline::attachments::AttachmentResolver;
use crate::pipeline::batcher::{BatchItem, DeliveryBatcher};
use crate::pipeline::format::ContentFormatter;
use crate::pipeline::identity::{IdentityResolver, ItemIdentity};
use crate::pipeline::types::{
    Channel, ChannelEnumerator, DeliverySink, RawItem, SessionContext,
};
use crate::store::{SeenStore, StateStore};

/// `tokio::time::interval` panics on a zero period.
const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Where a channel got to in the current cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CycleStage {
    Idle,
    ItemsFetched,
    Deduplicated,
    AttachmentsResolved,
    Batched,
    Delivering,
    Persisted,
}

impl fmt::Display for CycleStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::ItemsFetched => "items_fetched",
            Self::Deduplicated => "deduplicated",
            Self::AttachmentsResolved => "attachments_resolved",
            Self::Batched => "batched",
            Self::Delivering => "delivering",
            Self::Persisted => "persisted",
        };
        f.write_str(s)
    }
}

/// How a channel's visit ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelOutcome {
    /// Nothing new since the last cycle.
    NothingNew,
    /// Every unit was accepted.
    Delivered,
    /// The sink rejected a unit; later units were not attempted.
    Halted { reason: String },
    /// The enumerator or state backend failed; nothing was mutated.
    Skipped { reason: String },
    /// Units were accepted but the seen state could not be written.
    PersistFailed { reason: String },
}

/// Result of one channel visit.
#[derive(Debug, Clone)]
pub struct ChannelReport {
    pub channel: String,
    pub stage: CycleStage,
    pub fetched: usize,
    pub new_items: usize,
    pub units_total: usize,
    pub units_sent: usize,
    pub keys_committed: usize,
    pub outcome: ChannelOutcome,
}

impl ChannelReport {
    fn new(channel: &Channel) -> Self {
        Self {
            channel: channel.key.clone(),
            stage: CycleStage::Idle,
            fetched: 0,
            new_items: 0,
            units_total: 0,
            units_sent: 0,
            keys_committed: 0,
            outcome: ChannelOutcome::NothingNew,
        }
    }

    fn advance(&mut self, stage: CycleStage) {
        debug!(channel = %self.channel, from = %self.stage, to = %stage, "Channel stage");
        self.stage = stage;
    }
}

/// Result of one full cycle.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub id: Uuid,
    pub channels: Vec<ChannelReport>,
}

impl CycleReport {
    pub fn units_sent(&self) -> usize {
        self.channels.iter().map(|c| c.units_sent).sum()
    }

    pub fn keys_committed(&self) -> usize {
        self.channels.iter().map(|c| c.keys_committed).sum()
    }

    pub fn channel(&self, key: &str) -> Option<&ChannelReport> {
        self.channels.iter().find(|c| c.channel == key)
    }
}

/// Owns the seen state and drives collaborators through each cycle.
pub struct Relay {
    enumerator: Arc<dyn ChannelEnumerator>,
    sink: Arc<dyn DeliverySink>,
    seen: SeenStore,
    identity: IdentityResolver,
    attachments: AttachmentResolver,
    formatter: ContentFormatter,
    batcher: DeliveryBatcher,
    cycle: CycleConfig,
}

impl Relay {
    pub fn new(
        enumerator: Arc<dyn ChannelEnumerator>,
        sink: Arc<dyn DeliverySink>,
        seen: SeenStore,
        attachments: AttachmentResolver,
        cycle: CycleConfig,
    ) -> Self {
        Self {
            enumerator,
            sink,
            seen,
            identity: IdentityResolver::default(),
            attachments,
            formatter: ContentFormatter::new(chrono_tz::Europe::Helsinki),
            batcher: DeliveryBatcher::new(BatchLimits::default()),
            cycle,
        }
    }

    /// Production wiring: sidecar enumerator, Telegram sink, configured limits.
    pub fn from_config(config: &RelayConfig, backend: Arc<dyn StateStore>) -> error::Result<Self> {
        let enumerator = SnapshotEnumerator::new(&config.source_url, config.cycle.max_items_per_channel)?;
        let sink = TelegramSink::new(&config.telegram);
        let attachments = AttachmentResolver::new(config.attachments)?;
        let seen = SeenStore::new(backend, config.cycle.seen_cap);

        Ok(Self::new(Arc::new(enumerator), Arc::new(sink), seen, attachments, config.cycle)
            .with_formatter(ContentFormatter::new(config.timezone))
            .with_batcher(DeliveryBatcher::new(config.batch)))
    }

    pub fn with_formatter(mut self, formatter: ContentFormatter) -> Self {
        self.formatter = formatter;
        self
    }

    pub fn with_batcher(mut self, batcher: DeliveryBatcher) -> Self {
        self.batcher = batcher;
        self
    }

    /// Visit every channel once, strictly sequentially.
    pub async fn run_cycle(&mut self, session: &SessionContext) -> Result<CycleReport, PipelineError> {
        let id = Uuid::new_v4();
        let span = info_span!("cycle", id = %id);
        async move {
            if !session.exists() {
                warn!(
                    path = %session.path().display(),
                    "Session context missing, enumerator may fail"
                );
            }

            let mut channels = self.enumerator.list_channels(session).await?;
            if channels.len() > self.cycle.max_channels {
                warn!(
                    listed = channels.len(),
                    max = self.cycle.max_channels,
                    "Channel list over cap, visiting the first ones only"
                );
                channels.truncate(self.cycle.max_channels);
            }
            info!(
                enumerator = %self.enumerator.name(),
                channels = channels.len(),
                "Cycle started"
            );

            let mut reports = Vec::with_capacity(channels.len());
            for (i, channel) in channels.iter().enumerate() {
                if i > 0 {
                    pause(self.cycle.channel_pause).await;
                }
                reports.push(self.process_channel(session, channel).await);
            }

            let report = CycleReport { id, channels: reports };
            info!(
                channels = report.channels.len(),
                units_sent = report.units_sent(),
                keys_committed = report.keys_committed(),
                "Cycle finished"
            );
            Ok(report)
        }
        .instrument(span)
        .await
    }

    /// Process one channel end to end. Never fails the cycle.
    pub async fn process_channel(&mut self, session: &SessionContext, channel: &Channel) -> ChannelReport {
        let mut report = ChannelReport::new(channel);

        if let Err(e) = self.seen.load(&channel.key).await {
            warn!(channel = %channel.key, error = %e, "Seen state unavailable, skipping channel");
            report.outcome = ChannelOutcome::Skipped { reason: e.to_string() };
            return report;
        }

        let mut items = match self.enumerator.fetch_items(session, channel).await {
            Ok(items) => items,
            Err(e) => {
                warn!(channel = %channel.key, error = %e, "Channel unavailable, retrying next cycle");
                report.outcome = ChannelOutcome::Skipped { reason: e.to_string() };
                return report;
            }
        };
        let cap = self.cycle.max_items_per_channel;
        if items.len() > cap {
            items.drain(..items.len() - cap);
        }
        report.fetched = items.len();
        report.advance(CycleStage::ItemsFetched);

        let fresh = self.deduplicate(channel, items);
        report.new_items = fresh.len();
        report.advance(CycleStage::Deduplicated);
        if fresh.is_empty() {
            debug!(channel = %channel.key, "Nothing new");
            return report;
        }
        info!(channel = %channel.key, new_items = fresh.len(), "New items found");

        let headers = self.enumerator.attachment_headers();
        let now = Utc::now();
        let mut batch = Vec::with_capacity(fresh.len());
        for (item, identity) in fresh {
            let mut outcomes = Vec::with_capacity(item.attachments.len());
            for attachment in &item.attachments {
                outcomes.push(self.attachments.resolve(attachment, &headers).await);
            }
            batch.push(BatchItem {
                fragment: self.formatter.render(channel, &item, &identity.body, now),
                key: identity.key,
                attachments: outcomes,
            });
        }
        report.advance(CycleStage::AttachmentsResolved);

        let units = self.batcher.batch(&self.formatter, channel, batch);
        report.units_total = units.len();
        report.advance(CycleStage::Batched);

        report.advance(CycleStage::Delivering);
        report.outcome = ChannelOutcome::Delivered;
        for (i, unit) in units.iter().enumerate() {
            if i > 0 {
                pause(self.cycle.unit_pause).await;
            }
            match self.sink.deliver(unit).await {
                Ok(()) => {
                    report.units_sent += 1;
                    for key in &unit.completes {
                        self.seen.add(&channel.key, key.clone());
                        report.keys_committed += 1;
                    }
                    debug!(channel = %channel.key, unit = i, kind = unit.kind(), "Unit delivered");
                }
                Err(e) => {
                    let err = PipelineError::PartialDelivery {
                        sent: report.units_sent,
                        total: units.len(),
                        source: e,
                    };
                    warn!(
                        channel = %channel.key,
                        sink = %self.sink.name(),
                        unit = i,
                        kind = unit.kind(),
                        error = %err,
                        "Delivery failed, halting channel for this cycle"
                    );
                    report.outcome = ChannelOutcome::Halted { reason: err.to_string() };
                    break;
                }
            }
        }

        if report.keys_committed > 0 {
            if let Err(e) = self.seen.persist().await {
                let err = PipelineError::from(e);
                error!(channel = %channel.key, error = %err, "Failed to persist seen state");
                report.outcome = ChannelOutcome::PersistFailed { reason: err.to_string() };
                return report;
            }
        }
        report.advance(CycleStage::Persisted);
        info!(
            channel = %channel.key,
            units_sent = report.units_sent,
            units_total = report.units_total,
            keys_committed = report.keys_committed,
            "Channel done"
        );
        report
    }

    /// Drop empty items, already-seen items, and repeats within this fetch.
    fn deduplicate(&self, channel: &Channel, items: Vec<RawItem>) -> Vec<(RawItem, ItemIdentity)> {
        let mut batch_keys = HashSet::new();
        let mut fresh = Vec::new();
        for item in items {
            if item.is_empty() {
                debug!(channel = %channel.key, native_id = ?item.native_id, "Empty item skipped");
                continue;
            }
            let identity = self.identity.resolve(&item);
            if self.seen.contains(&channel.key, &identity.key) || !batch_keys.insert(identity.key.clone()) {
                continue;
            }
            fresh.push((item, identity));
        }
        fresh
    }
}

async fn pause(duration: Duration) {
    if !duration.is_zero() {
        tokio::time::sleep(duration).await;
    }
}

/// Spawn the poll loop. The first cycle runs immediately.
///
/// Returns the task handle and a shutdown sender. Sending `true` stops the
/// loop after the in-flight cycle finishes.
pub fn spawn_relay(
    mut relay: Relay,
    session: SessionContext,
    interval: Duration,
) -> (JoinHandle<()>, watch::Sender<bool>) {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let interval = interval.max(MIN_POLL_INTERVAL);

    let handle = tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "Relay poller started");

        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {}
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        info!("Shutdown handle dropped, relay poller stopping");
                        return;
                    }
                }
            }

            if *shutdown_rx.borrow() {
                info!("Relay poller shutting down");
                return;
            }

            if let Err(e) = relay.run_cycle(&session).await {
                warn!(error = %e, "Cycle aborted, retrying next interval");
            }
        }
    });

    (handle, shutdown_tx)
}
