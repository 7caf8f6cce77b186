//! Replayable live subscriptions.
//!
//! A subscription first replays the history of its scope (one stream or the
//! global log) from an effective start offset, then keeps delivering records
//! as they are appended. Each delivered record is an [`AckableEventRecord`]:
//! acknowledging it advances the consumer group's checkpoint so that a later
//! subscription of the same group resumes after it.
//!
//! # Example
//!
//! ```ignore
//! let mut subscription = store
//!     .subscribe(Some("orders-1"), SubscribeOptions::from_start().consumer_group("billing"))
//!     .await?;
//!
//! while let Some(record) = subscription.next().await {
//!     let record = record?;
//!     handle(&record);
//!     record.ack().await?;
//! }
//! ```
use std::{
    fmt,
    ops::Deref,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures::{Stream, stream::BoxStream};
use thiserror::Error;
use tokio::sync::{
    broadcast::{self, error::RecvError},
    mpsc,
};

use crate::{
    checkpoint::{CheckpointKey, CheckpointStore},
    store::{EventRecord, StoreError, StreamPosition, validate_offset},
};

/// Where a subscription starts and which consumer group it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Start offset used when the group has no checkpoint. `-1` is live only.
    pub offset: i64,
    pub consumer_group: Option<String>,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            offset: StreamPosition::END_OF_STREAM,
            consumer_group: None,
        }
    }
}

impl SubscribeOptions {
    /// Live records only.
    #[must_use]
    pub fn live() -> Self {
        Self::default()
    }

    /// Replay everything, then go live.
    #[must_use]
    pub fn from_start() -> Self {
        Self::from_offset(StreamPosition::START_OF_STREAM)
    }

    #[must_use]
    pub fn from_offset(offset: i64) -> Self {
        Self {
            offset,
            consumer_group: None,
        }
    }

    #[must_use]
    pub fn consumer_group(mut self, group: impl Into<String>) -> Self {
        self.consumer_group = Some(group.into());
        self
    }
}

/// Errors yielded by a [`Subscription`].
#[derive(Debug, Error)]
pub enum SubscriptionError {
    /// The subscriber fell behind the live buffer and records were dropped.
    /// The subscription ends after yielding this error.
    #[error("subscriber lagged behind the live buffer, {skipped} records skipped")]
    Lagged { skipped: u64 },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Handle carried by records delivered to a consumer group.
#[derive(Clone)]
pub(crate) struct Acknowledger {
    key: CheckpointKey,
    cursor: u64,
    checkpoints: Arc<dyn CheckpointStore>,
}

/// A record delivered by a subscription.
///
/// Dereferences to the underlying [`EventRecord`].
#[derive(Clone)]
pub struct AckableEventRecord {
    record: EventRecord,
    /// `None` without a consumer group; otherwise whether this record's cursor
    /// is at or below the group's acknowledged high-water mark.
    pub replayed: Option<bool>,
    acknowledger: Option<Acknowledger>,
    redelivery: Option<mpsc::UnboundedSender<AckableEventRecord>>,
}

impl fmt::Debug for AckableEventRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AckableEventRecord")
            .field("record", &self.record)
            .field("replayed", &self.replayed)
            .field(
                "consumer_group",
                &self.acknowledger.as_ref().map(|a| &a.key.consumer_group),
            )
            .finish()
    }
}

impl AckableEventRecord {
    #[must_use]
    pub fn record(&self) -> &EventRecord {
        &self.record
    }

    #[must_use]
    pub fn into_record(self) -> EventRecord {
        self.record
    }

    #[must_use]
    pub fn consumer_group(&self) -> Option<&str> {
        self.acknowledger
            .as_ref()
            .map(|a| a.key.consumer_group.as_str())
    }

    /// Advance the consumer group's checkpoint to this record.
    ///
    /// Writes the record's offset for stream-scoped subscriptions and its
    /// position for global-log subscriptions. No-op without a consumer group.
    ///
    /// # Errors
    ///
    /// Propagates failures of the checkpoint store.
    pub async fn ack(&self) -> Result<(), StoreError> {
        let Some(ack) = &self.acknowledger else {
            return Ok(());
        };
        let offset = i64::try_from(ack.cursor).unwrap_or(i64::MAX);
        ack.checkpoints.save(&ack.key, offset).await?;
        tracing::trace!(key = %ack.key, offset, "acknowledged");
        Ok(())
    }

    /// Reject this record without touching the checkpoint.
    ///
    /// On a consumer group subscription configured to redeliver on nack, the
    /// record is emitted again on the same subscription.
    pub fn nack(&self, reason: Option<&str>) {
        tracing::debug!(
            stream_id = %self.record.stream_id,
            offset = self.record.offset,
            reason = reason.unwrap_or("unspecified"),
            "record nacked"
        );
        if let Some(tx) = &self.redelivery
            && tx.send(self.clone()).is_err()
        {
            tracing::trace!("subscription dropped before redelivery");
        }
    }
}

impl Deref for AckableEventRecord {
    type Target = EventRecord;

    fn deref(&self) -> &Self::Target {
        &self.record
    }
}

/// Stream of [`AckableEventRecord`]s produced by
/// [`EventStore::subscribe`](crate::store::EventStore::subscribe).
///
/// Ends when the stream is deleted or the store is closed. Dropping it
/// unregisters the subscriber.
pub struct Subscription {
    inner: BoxStream<'static, Result<AckableEventRecord, SubscriptionError>>,
}

impl Subscription {
    /// Wrap a record stream built by a backend.
    ///
    /// Backends that replay from a snapshot and then follow a broadcast bus
    /// should prefer [`replay_then_live`].
    pub fn new(inner: BoxStream<'static, Result<AckableEventRecord, SubscriptionError>>) -> Self {
        Self { inner }
    }
}

impl Stream for Subscription {
    type Item = Result<AckableEventRecord, SubscriptionError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

/// Per-subscription delivery settings: scope, effective start and the
/// consumer group checkpoint handle.
///
/// Build it with [`Delivery::resolve`], which applies the checkpoint rules
/// shared by every backend, then hand it to [`replay_then_live`].
pub struct Delivery {
    stream_scoped: bool,
    start: Option<u64>,
    key: Option<CheckpointKey>,
    high_water: Option<u64>,
    checkpoints: Arc<dyn CheckpointStore>,
    redeliver_on_nack: bool,
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("stream_scoped", &self.stream_scoped)
            .field("start", &self.start)
            .field("key", &self.key)
            .field("high_water", &self.high_water)
            .field("redeliver_on_nack", &self.redeliver_on_nack)
            .finish_non_exhaustive()
    }
}

impl Delivery {
    /// Work out where a subscription starts.
    ///
    /// A persisted checkpoint `c` of the consumer group wins over
    /// `options.offset`: `c >= 0` resumes at `c + 1`, `c == -1` is live only.
    /// Without a checkpoint `options.offset` applies, `-1` meaning live only.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidOffset`] for offsets below `-1`,
    /// [`StoreError::InvalidConsumerGroup`] for a blank group, and propagates
    /// checkpoint store failures.
    pub async fn resolve(
        stream_id: Option<&str>,
        options: &SubscribeOptions,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Result<Self, StoreError> {
        validate_offset(options.offset)?;
        let key = options
            .consumer_group
            .as_deref()
            .map(|group| CheckpointKey::new(group, stream_id))
            .transpose()?;
        let checkpoint = match &key {
            Some(key) => checkpoints.load(key).await?,
            None => None,
        };
        let start = match checkpoint {
            Some(checkpoint) if checkpoint.offset >= 0 => checkpoint.offset + 1,
            Some(_) => StreamPosition::END_OF_STREAM,
            None => options.offset,
        };
        tracing::trace!(?key, ?checkpoint, start, "subscription start resolved");
        Ok(Self {
            stream_scoped: stream_id.is_some(),
            start: u64::try_from(start).ok(),
            key,
            high_water: checkpoint.and_then(|c| c.high_water),
            checkpoints,
            redeliver_on_nack: true,
        })
    }

    /// Re-emit nacked records on the same subscription. On by default; only
    /// consumer group subscriptions redeliver.
    #[must_use]
    pub const fn redeliver_on_nack(mut self, redeliver: bool) -> Self {
        self.redeliver_on_nack = redeliver;
        self
    }

    /// Lowest cursor to deliver, `None` for live only.
    #[must_use]
    pub const fn start(&self) -> Option<u64> {
        self.start
    }

    #[must_use]
    pub const fn is_stream_scoped(&self) -> bool {
        self.stream_scoped
    }

    fn wrap(
        &self,
        record: &EventRecord,
        redelivery: &mpsc::UnboundedSender<AckableEventRecord>,
    ) -> AckableEventRecord {
        let cursor = record.cursor(self.stream_scoped);
        let acknowledger = self.key.as_ref().map(|key| Acknowledger {
            key: key.clone(),
            cursor,
            checkpoints: Arc::clone(&self.checkpoints),
        });
        AckableEventRecord {
            record: record.clone(),
            replayed: self
                .key
                .as_ref()
                .map(|_| self.high_water.is_some_and(|hw| cursor <= hw)),
            acknowledger,
            redelivery: (self.redeliver_on_nack && self.key.is_some())
                .then(|| redelivery.clone()),
        }
    }

    fn admits(&self, record: &EventRecord) -> bool {
        self.start
            .is_none_or(|start| record.cursor(self.stream_scoped) >= start)
    }
}

enum Next {
    Redelivery(AckableEventRecord),
    Live(Result<Arc<EventRecord>, RecvError>),
}

/// Build the replay-then-live stream.
///
/// `history` and `live` must have been captured atomically with respect to
/// appends: every record is either in `history` or will arrive on `live`.
/// Live records below [`Delivery::start`] are dropped.
pub fn replay_then_live(
    delivery: Delivery,
    history: Vec<Arc<EventRecord>>,
    mut live: broadcast::Receiver<Arc<EventRecord>>,
) -> Subscription {
    let (redelivery_tx, mut redelivery_rx) = mpsc::unbounded_channel();
    let stream = async_stream::stream! {
        tracing::debug!(records = history.len(), "replaying history");
        for record in history {
            while let Ok(redelivered) = redelivery_rx.try_recv() {
                yield Ok(redelivered);
            }
            yield Ok(delivery.wrap(&record, &redelivery_tx));
        }
        tracing::debug!("subscription is live");
        loop {
            let next = tokio::select! {
                biased;
                Some(redelivered) = redelivery_rx.recv() => Next::Redelivery(redelivered),
                received = live.recv() => Next::Live(received),
            };
            match next {
                Next::Redelivery(redelivered) => yield Ok(redelivered),
                Next::Live(Ok(record)) => {
                    if delivery.admits(&record) {
                        yield Ok(delivery.wrap(&record, &redelivery_tx));
                    }
                }
                Next::Live(Err(RecvError::Lagged(skipped))) => {
                    tracing::debug!(skipped, "subscriber lagged, ending subscription");
                    yield Err(SubscriptionError::Lagged { skipped });
                    break;
                }
                Next::Live(Err(RecvError::Closed)) => {
                    tracing::debug!("live bus closed, ending subscription");
                    break;
                }
            }
        }
    };
    Subscription::new(Box::pin(stream))
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use tokio_stream::StreamExt as _;

    use super::*;
    use crate::checkpoint::Checkpoints;

    fn record(offset: u64) -> Arc<EventRecord> {
        Arc::new(EventRecord {
            stream_id: "s".into(),
            id: format!("id-{offset}"),
            offset,
            position: offset + 100,
            timestamp: Utc::now(),
            kind: "tick".into(),
            data: serde_json::json!(offset),
            metadata: None,
        })
    }

    fn delivery(key: Option<CheckpointKey>, high_water: Option<u64>) -> Delivery {
        Delivery {
            stream_scoped: true,
            start: Some(0),
            key,
            high_water,
            checkpoints: Arc::new(Checkpoints::new()),
            redeliver_on_nack: true,
        }
    }

    #[test]
    fn options_builders() {
        assert_eq!(SubscribeOptions::live().offset, -1);
        assert_eq!(SubscribeOptions::from_start().offset, 0);
        let options = SubscribeOptions::from_offset(3).consumer_group("g");
        assert_eq!(options.consumer_group.as_deref(), Some("g"));
    }

    #[test]
    fn replayed_is_none_without_group() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let wrapped = delivery(None, Some(10)).wrap(&record(1), &tx);
        assert_eq!(wrapped.replayed, None);
        assert_eq!(wrapped.consumer_group(), None);
    }

    #[test]
    fn replayed_follows_high_water() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let key = CheckpointKey::new("g", Some("s")).unwrap();
        let d = delivery(Some(key), Some(2));
        assert_eq!(d.wrap(&record(2), &tx).replayed, Some(true));
        assert_eq!(d.wrap(&record(3), &tx).replayed, Some(false));
    }

    #[test]
    fn live_records_below_start_are_filtered() {
        let mut d = delivery(None, None);
        d.start = Some(5);
        assert!(!d.admits(&record(4)));
        assert!(d.admits(&record(5)));
        d.start = None;
        assert!(d.admits(&record(0)));
    }

    #[tokio::test]
    async fn history_precedes_live_records() {
        let (tx, rx) = broadcast::channel(8);
        let subscription = replay_then_live(delivery(None, None), vec![record(0), record(1)], rx);
        tx.send(record(2)).unwrap();
        drop(tx);

        let offsets: Vec<u64> = subscription.map(|r| r.unwrap().offset).collect().await;
        assert_eq!(offsets, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn nacked_record_is_delivered_again_before_the_next_one() {
        let (_tx, rx) = broadcast::channel(8);
        let key = CheckpointKey::new("g", Some("s")).unwrap();
        let mut subscription =
            replay_then_live(delivery(Some(key), None), vec![record(0), record(1)], rx);

        let first = subscription.next().await.unwrap().unwrap();
        first.nack(Some("retry"));
        let again = subscription.next().await.unwrap().unwrap();
        let second = subscription.next().await.unwrap().unwrap();
        assert_eq!((again.offset, second.offset), (0, 1));
    }

    #[tokio::test]
    async fn nack_without_group_is_not_redelivered() {
        let (tx, rx) = broadcast::channel(8);
        let mut subscription =
            replay_then_live(delivery(None, None), vec![record(0), record(1)], rx);

        let first = subscription.next().await.unwrap().unwrap();
        first.nack(None);
        let second = subscription.next().await.unwrap().unwrap();
        drop(tx);
        assert_eq!(second.offset, 1);
        assert!(subscription.next().await.is_none());
    }

    #[tokio::test]
    async fn resolve_prefers_checkpoint_over_requested_offset() {
        let checkpoints = Arc::new(Checkpoints::new());
        let key = CheckpointKey::new("g", Some("s")).unwrap();
        checkpoints.put(&key, 4);
        let options = SubscribeOptions::from_start().consumer_group("g");

        let resumed = Delivery::resolve(Some("s"), &options, checkpoints.clone())
            .await
            .unwrap();
        assert_eq!(resumed.start(), Some(5));
        assert!(resumed.is_stream_scoped());

        checkpoints.put(&key, -1);
        let live = Delivery::resolve(Some("s"), &options, checkpoints.clone())
            .await
            .unwrap();
        assert_eq!(live.start(), None);

        let fresh = Delivery::resolve(None, &options, checkpoints).await.unwrap();
        assert_eq!(fresh.start(), Some(0));
    }

    #[tokio::test]
    async fn resolve_validates_options() {
        let checkpoints: Arc<dyn CheckpointStore> = Arc::new(Checkpoints::new());
        assert!(matches!(
            Delivery::resolve(None, &SubscribeOptions::from_offset(-3), checkpoints.clone()).await,
            Err(StoreError::InvalidOffset(-3))
        ));
        assert!(matches!(
            Delivery::resolve(None, &SubscribeOptions::live().consumer_group(" "), checkpoints)
                .await,
            Err(StoreError::InvalidConsumerGroup)
        ));
    }

    #[tokio::test]
    async fn ack_without_group_is_a_noop() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let wrapped = delivery(None, None).wrap(&record(0), &tx);
        assert!(wrapped.ack().await.is_ok());
    }

    #[tokio::test]
    async fn lagging_receiver_ends_with_error() {
        let (tx, rx) = broadcast::channel(1);
        let mut subscription = replay_then_live(delivery(None, None), Vec::new(), rx);
        tx.send(record(0)).unwrap();
        tx.send(record(1)).unwrap();

        let first = subscription.next().await.unwrap();
        assert!(matches!(first, Err(SubscriptionError::Lagged { skipped: 1 })));
        assert!(subscription.next().await.is_none());
    }
}
