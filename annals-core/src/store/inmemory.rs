//! In-memory event store implementation.
//!
//! This module provides [`Store`], a thread-safe in-memory implementation of
//! [`EventStore`](super::EventStore) suitable for tests, examples and
//! single-process deployments that do not need durability.
//!
//! # Example
//!
//! ```
//! use annals_core::store::inmemory;
//!
//! let store = inmemory::Store::new();
//! let tuned = inmemory::Store::with_config(
//!     inmemory::StoreConfig::default().live_buffer_capacity(16),
//! );
//! # drop((store, tuned));
//! ```
//!
//! Checkpoints live in an in-memory [`Checkpoints`] registry unless another
//! [`CheckpointStore`] is supplied through [`Store::with_checkpoints`].

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    future::Future,
    sync::Arc,
};

use chrono::Utc;
use nonempty::NonEmpty;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::{
    checkpoint::{CheckpointKey, CheckpointStore, Checkpoints},
    concurrency::ExpectedVersion,
    store::{
        ALL_STREAMS, AppendResult, EventDescriptor, EventRecord, EventStore,
        EventStreamDescriptor, ReadDirection, RecordStream, StoreError, validate_offset,
        validate_stream_id,
    },
    subscription::{self, Delivery, SubscribeOptions, Subscription},
};

/// Tuning knobs for [`Store`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreConfig {
    /// Number of live records buffered per subscriber before it is considered
    /// lagging.
    pub live_buffer_capacity: usize,
    /// Re-emit records nacked on a consumer group subscription.
    pub redeliver_on_nack: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            live_buffer_capacity: 1024,
            redeliver_on_nack: true,
        }
    }
}

impl StoreConfig {
    #[must_use]
    pub const fn live_buffer_capacity(mut self, capacity: usize) -> Self {
        self.live_buffer_capacity = capacity;
        self
    }

    #[must_use]
    pub const fn redeliver_on_nack(mut self, redeliver: bool) -> Self {
        self.redeliver_on_nack = redeliver;
        self
    }
}

type LiveBus = broadcast::Sender<Arc<EventRecord>>;
type LiveReceiver = broadcast::Receiver<Arc<EventRecord>>;

/// Records fetched per lock acquisition while a read is polled.
const READ_PAGE: usize = 256;

/// In-memory event store that keeps streams in a hash map.
///
/// A single write lock is the serialization point for offsets and positions:
/// appends assign both, store the records and publish them to live
/// subscribers before releasing it. Subscribing takes the write lock to
/// capture history and register on the live bus in one step.
///
/// Cloning is cheap and yields a handle to the same store.
#[derive(Clone)]
pub struct Store {
    inner: Arc<RwLock<Inner>>,
    checkpoints: Arc<dyn CheckpointStore>,
    config: StoreConfig,
}

struct Inner {
    streams: HashMap<String, StreamState>,
    /// Global log keyed by position. Sparse once streams are truncated or
    /// deleted.
    log: BTreeMap<u64, Arc<EventRecord>>,
    next_position: u64,
    /// `None` once the store is closed.
    live: Option<LiveBus>,
}

#[derive(Default)]
struct StreamState {
    records: VecDeque<Arc<EventRecord>>,
    next_offset: u64,
    /// Created by the first stream-scoped subscriber, dropped by the first
    /// append that finds no receiver left.
    live: Option<LiveBus>,
}

impl StreamState {
    fn last_offset(&self) -> Option<u64> {
        self.next_offset.checked_sub(1)
    }
}

impl Store {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    #[must_use]
    pub fn with_config(config: StoreConfig) -> Self {
        let config = StoreConfig {
            live_buffer_capacity: config.live_buffer_capacity.max(1),
            ..config
        };
        Self {
            inner: Arc::new(RwLock::new(Inner {
                streams: HashMap::new(),
                log: BTreeMap::new(),
                next_position: 0,
                live: Some(broadcast::channel(config.live_buffer_capacity).0),
            })),
            checkpoints: Arc::new(Checkpoints::new()),
            config,
        }
    }

    /// Keep consumer group checkpoints in `checkpoints` instead of the
    /// built-in registry. Stores sharing a checkpoint store share progress.
    #[must_use]
    pub fn with_checkpoints(mut self, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = checkpoints;
        self
    }

    #[must_use]
    pub const fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Shut down the live bus.
    ///
    /// Active subscriptions end once they have drained what was already
    /// published; later appends and subscriptions fail with
    /// [`StoreError::Closed`]. Reads keep working.
    #[tracing::instrument(skip(self))]
    pub fn close(&self) {
        let mut inner = self.inner.write();
        inner.live = None;
        for stream in inner.streams.values_mut() {
            stream.live = None;
        }
        tracing::debug!("event store closed");
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.read().live.is_none()
    }

    fn append_now(
        &self,
        stream_id: &str,
        events: NonEmpty<EventDescriptor>,
        expected_version: ExpectedVersion,
    ) -> Result<AppendResult, StoreError> {
        validate_stream_id(stream_id)?;
        let mut inner = self.inner.write();
        let Inner {
            streams,
            log,
            next_position,
            live,
        } = &mut *inner;
        let Some(all) = live.as_ref() else {
            return Err(StoreError::Closed);
        };

        let current = streams.get(stream_id).and_then(StreamState::last_offset);
        expected_version.check(current).inspect_err(|conflict| {
            tracing::debug!(
                expected = ?conflict.expected,
                actual = ?conflict.actual,
                "version mismatch, rejecting append"
            );
        })?;

        let stream = streams.entry(stream_id.to_owned()).or_default();
        let first_offset = stream.next_offset;
        let mut last_position = *next_position;

        for descriptor in events {
            let record = Arc::new(EventRecord {
                stream_id: stream_id.to_owned(),
                id: Uuid::new_v4().to_string(),
                offset: stream.next_offset,
                position: *next_position,
                timestamp: Utc::now(),
                kind: descriptor.kind,
                data: descriptor.data,
                metadata: descriptor.metadata,
            });
            stream.next_offset += 1;
            last_position = *next_position;
            *next_position += 1;

            stream.records.push_back(Arc::clone(&record));
            log.insert(record.position, Arc::clone(&record));
            // A send only fails when nobody is subscribed.
            if stream
                .live
                .as_ref()
                .is_some_and(|bus| bus.send(Arc::clone(&record)).is_err())
            {
                stream.live = None;
            }
            let _ = all.send(record);
        }

        let result = AppendResult {
            first_offset,
            last_offset: stream.next_offset - 1,
            last_position,
        };
        tracing::debug!(
            first_offset = result.first_offset,
            last_offset = result.last_offset,
            last_position = result.last_position,
            "events appended to stream"
        );
        Ok(result)
    }

    /// One page of a read, taken under a short read lock.
    fn page(
        &self,
        stream_id: Option<&str>,
        direction: ReadDirection,
        from: u64,
        limit: usize,
    ) -> Result<Vec<Arc<EventRecord>>, StoreError> {
        let inner = self.inner.read();
        match stream_id {
            Some(id) => {
                let stream = inner
                    .streams
                    .get(id)
                    .ok_or_else(|| StoreError::stream_not_found(id))?;
                Ok(stream_page(&stream.records, direction, from, limit))
            }
            None => Ok(log_page(&inner.log, direction, from, limit)),
        }
    }

    /// Lazily page through a scope, re-taking the read lock for every
    /// [`READ_PAGE`] records. Appends made while the stream is polled may be
    /// included; a stream deleted meanwhile ends the read with
    /// [`StoreError::StreamNotFound`].
    fn paged<'a>(
        &'a self,
        stream_id: Option<&'a str>,
        direction: ReadDirection,
        offset: i64,
        length: Option<u64>,
    ) -> RecordStream<'a> {
        let scoped = stream_id.is_some();
        let mut remaining =
            length.map_or(usize::MAX, |n| usize::try_from(n).unwrap_or(usize::MAX));
        let mut cursor = match (direction, u64::try_from(offset).ok()) {
            (ReadDirection::Forwards, None) | (ReadDirection::Backwards, Some(0)) => None,
            (ReadDirection::Forwards, Some(from)) | (ReadDirection::Backwards, Some(from)) => {
                Some(from)
            }
            (ReadDirection::Backwards, None) => Some(u64::MAX),
        };
        let records = async_stream::stream! {
            while let Some(from) = cursor {
                if remaining == 0 {
                    break;
                }
                let wanted = remaining.min(READ_PAGE);
                let page = match self.page(stream_id, direction, from, wanted) {
                    Ok(page) => page,
                    Err(error) => {
                        yield Err(error);
                        break;
                    }
                };
                tracing::trace!(from, records = page.len(), "read page fetched");
                cursor = match page.last() {
                    Some(last) if page.len() == wanted => {
                        let last = last.cursor(scoped);
                        match direction {
                            ReadDirection::Forwards => last.checked_add(1),
                            ReadDirection::Backwards => last.checked_sub(1),
                        }
                    }
                    _ => None,
                };
                remaining -= page.len();
                for record in page {
                    yield Ok(EventRecord::clone(&record));
                }
            }
        };
        Box::pin(records)
    }

    /// Capture history and register a live receiver under one write lock, so
    /// no append can fall between them.
    fn register(
        &self,
        stream_id: Option<&str>,
        start: Option<u64>,
    ) -> Result<(Vec<Arc<EventRecord>>, LiveReceiver), StoreError> {
        let mut inner = self.inner.write();
        let Inner {
            streams, log, live, ..
        } = &mut *inner;
        let Some(all) = live.as_ref() else {
            return Err(StoreError::Closed);
        };
        match stream_id {
            Some(id) => {
                let stream = streams
                    .get_mut(id)
                    .ok_or_else(|| StoreError::stream_not_found(id))?;
                let capacity = self.config.live_buffer_capacity;
                let receiver = stream
                    .live
                    .get_or_insert_with(|| broadcast::channel(capacity).0)
                    .subscribe();
                let history = start.map_or_else(Vec::new, |from| {
                    stream_page(&stream.records, ReadDirection::Forwards, from, usize::MAX)
                });
                Ok((history, receiver))
            }
            None => {
                let history = start.map_or_else(Vec::new, |from| {
                    log_page(log, ReadDirection::Forwards, from, usize::MAX)
                });
                Ok((history, all.subscribe()))
            }
        }
    }

    fn ensure_stream(&self, stream_id: &str) -> Result<(), StoreError> {
        if self.inner.read().streams.contains_key(stream_id) {
            Ok(())
        } else {
            Err(StoreError::stream_not_found(stream_id))
        }
    }

    fn truncate_now(&self, stream_id: &str, before_offset: Option<u64>) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let Inner { streams, log, .. } = &mut *inner;
        let stream = streams
            .get_mut(stream_id)
            .ok_or_else(|| StoreError::stream_not_found(stream_id))?;
        let Some(before) = before_offset.or_else(|| stream.records.back().map(|r| r.offset))
        else {
            return Ok(());
        };

        let mut removed = 0_usize;
        while stream.records.front().is_some_and(|r| r.offset < before) {
            if let Some(record) = stream.records.pop_front() {
                log.remove(&record.position);
                removed += 1;
            }
        }
        tracing::debug!(before, removed, "stream truncated");
        Ok(())
    }

    fn delete_now(&self, stream_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let stream = inner
            .streams
            .remove(stream_id)
            .ok_or_else(|| StoreError::stream_not_found(stream_id))?;
        for record in &stream.records {
            inner.log.remove(&record.position);
        }
        tracing::debug!(removed = stream.records.len(), "stream deleted");
        Ok(())
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

/// Records of one stream starting at offset `from` in delivery order.
fn stream_page(
    records: &VecDeque<Arc<EventRecord>>,
    direction: ReadDirection,
    from: u64,
    limit: usize,
) -> Vec<Arc<EventRecord>> {
    match direction {
        ReadDirection::Forwards => {
            let first = records.partition_point(|r| r.offset < from);
            records.range(first..).take(limit).cloned().collect()
        }
        ReadDirection::Backwards => {
            let end = records.partition_point(|r| r.offset <= from);
            records.range(..end).rev().take(limit).cloned().collect()
        }
    }
}

/// Records of the global log starting at position `from` in delivery order.
fn log_page(
    log: &BTreeMap<u64, Arc<EventRecord>>,
    direction: ReadDirection,
    from: u64,
    limit: usize,
) -> Vec<Arc<EventRecord>> {
    match direction {
        ReadDirection::Forwards => log
            .range(from..)
            .take(limit)
            .map(|(_, r)| Arc::clone(r))
            .collect(),
        ReadDirection::Backwards => log
            .range(..=from)
            .rev()
            .take(limit)
            .map(|(_, r)| Arc::clone(r))
            .collect(),
    }
}

impl EventStore for Store {
    #[tracing::instrument(skip(self, events), fields(event_count = events.len()))]
    fn append<'a>(
        &'a self,
        stream_id: &'a str,
        events: NonEmpty<EventDescriptor>,
        expected_version: ExpectedVersion,
    ) -> impl Future<Output = Result<AppendResult, StoreError>> + Send + 'a {
        std::future::ready(self.append_now(stream_id, events, expected_version))
    }

    #[tracing::instrument(skip(self))]
    fn get<'a>(
        &'a self,
        stream_id: &'a str,
    ) -> impl Future<Output = Result<EventStreamDescriptor, StoreError>> + Send + 'a {
        let result = {
            let inner = self.inner.read();
            inner
                .streams
                .get(stream_id)
                .map(|stream| EventStreamDescriptor {
                    stream_id: stream_id.to_owned(),
                    length: stream.records.len() as u64,
                    first_event_at: stream.records.front().map(|r| r.timestamp),
                    last_event_at: stream.records.back().map(|r| r.timestamp),
                })
                .ok_or_else(|| StoreError::stream_not_found(stream_id))
        };
        std::future::ready(result)
    }

    #[tracing::instrument(skip(self), fields(scope = stream_id.unwrap_or(ALL_STREAMS)))]
    fn read<'a>(
        &'a self,
        stream_id: Option<&'a str>,
        direction: ReadDirection,
        offset: i64,
        length: Option<u64>,
    ) -> impl Future<Output = Result<RecordStream<'a>, StoreError>> + Send + 'a {
        let result = validate_offset(offset)
            .and_then(|()| stream_id.map_or(Ok(()), |id| self.ensure_stream(id)))
            .map(|()| self.paged(stream_id, direction, offset, length));
        std::future::ready(result)
    }

    #[tracing::instrument(skip(self), fields(scope = stream_id.unwrap_or(ALL_STREAMS)))]
    fn subscribe<'a>(
        &'a self,
        stream_id: Option<&'a str>,
        options: SubscribeOptions,
    ) -> impl Future<Output = Result<Subscription, StoreError>> + Send + 'a {
        async move {
            let delivery = Delivery::resolve(stream_id, &options, Arc::clone(&self.checkpoints))
                .await?
                .redeliver_on_nack(self.config.redeliver_on_nack);
            let (history, receiver) = self.register(stream_id, delivery.start())?;
            tracing::debug!(
                start = ?delivery.start(),
                replay = history.len(),
                "subscription registered"
            );
            Ok(subscription::replay_then_live(delivery, history, receiver))
        }
    }

    #[tracing::instrument(skip(self))]
    fn set_offset<'a>(
        &'a self,
        consumer_group: &'a str,
        offset: i64,
        stream_id: Option<&'a str>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send + 'a {
        async move {
            validate_offset(offset)?;
            let key = CheckpointKey::new(consumer_group, stream_id)?;
            if let Some(id) = stream_id {
                self.ensure_stream(id)?;
            }
            self.checkpoints.save(&key, offset).await?;
            tracing::debug!(%key, offset, "checkpoint set");
            Ok(())
        }
    }

    #[tracing::instrument(skip(self))]
    fn get_offset<'a>(
        &'a self,
        consumer_group: &'a str,
        stream_id: Option<&'a str>,
    ) -> impl Future<Output = Result<Option<i64>, StoreError>> + Send + 'a {
        async move {
            let key = CheckpointKey::new(consumer_group, stream_id)?;
            let checkpoint = self.checkpoints.load(&key).await?;
            Ok(checkpoint.map(|c| c.offset))
        }
    }

    #[tracing::instrument(skip(self))]
    fn truncate<'a>(
        &'a self,
        stream_id: &'a str,
        before_offset: Option<u64>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send + 'a {
        std::future::ready(self.truncate_now(stream_id, before_offset))
    }

    #[tracing::instrument(skip(self))]
    fn delete<'a>(
        &'a self,
        stream_id: &'a str,
    ) -> impl Future<Output = Result<(), StoreError>> + Send + 'a {
        std::future::ready(self.delete_now(stream_id))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio_stream::StreamExt as _;

    use super::*;

    fn event(n: u64) -> EventDescriptor {
        EventDescriptor::new("tick", json!({ "n": n }))
    }

    fn batch(count: u64) -> NonEmpty<EventDescriptor> {
        let mut events = NonEmpty::new(event(0));
        for n in 1..count {
            events.push(event(n));
        }
        events
    }

    async fn offsets(
        store: &Store,
        stream_id: Option<&str>,
        direction: ReadDirection,
        offset: i64,
    ) -> Vec<u64> {
        store
            .read(stream_id, direction, offset, None)
            .await
            .unwrap()
            .map(|r| r.unwrap().cursor(stream_id.is_some()))
            .collect()
            .await
    }

    #[tokio::test]
    async fn append_assigns_consecutive_offsets() {
        let store = Store::new();
        let first = store.append("s", batch(3), ExpectedVersion::Any).await.unwrap();
        let second = store.append("s", batch(2), ExpectedVersion::Exact(2)).await.unwrap();

        assert_eq!((first.first_offset, first.last_offset), (0, 2));
        assert_eq!((second.first_offset, second.last_offset), (3, 4));
        assert_eq!(second.last_position, 4);
    }

    #[tokio::test]
    async fn no_stream_expectation_rejects_existing_stream() {
        let store = Store::new();
        store.append("s", batch(1), ExpectedVersion::NoStream).await.unwrap();
        let err = store
            .append("s", batch(1), ExpectedVersion::NoStream)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(c) if c.actual == Some(0)));
    }

    #[tokio::test]
    async fn rejected_append_leaves_stream_untouched() {
        let store = Store::new();
        store.append("s", batch(2), ExpectedVersion::Any).await.unwrap();
        let _ = store.append("s", batch(5), ExpectedVersion::Exact(0)).await;
        assert_eq!(store.get("s").await.unwrap().length, 2);
    }

    #[tokio::test]
    async fn blank_stream_id_is_rejected() {
        let store = Store::new();
        let err = store.append("", batch(1), ExpectedVersion::Any).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidStreamId));
    }

    #[tokio::test]
    async fn get_describes_stream() {
        let store = Store::new();
        store.append("s", batch(3), ExpectedVersion::Any).await.unwrap();
        let descriptor = store.get("s").await.unwrap();
        assert_eq!(descriptor.length, 3);
        assert!(descriptor.first_event_at <= descriptor.last_event_at);
        assert!(matches!(
            store.get("missing").await,
            Err(StoreError::StreamNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn read_sentinels() {
        let store = Store::new();
        store.append("s", batch(4), ExpectedVersion::Any).await.unwrap();

        assert!(offsets(&store, Some("s"), ReadDirection::Forwards, -1).await.is_empty());
        assert!(offsets(&store, Some("s"), ReadDirection::Backwards, 0).await.is_empty());
        assert_eq!(
            offsets(&store, Some("s"), ReadDirection::Backwards, -1).await,
            vec![3, 2, 1, 0]
        );
        assert_eq!(
            offsets(&store, Some("s"), ReadDirection::Forwards, 2).await,
            vec![2, 3]
        );
        assert_eq!(
            offsets(&store, Some("s"), ReadDirection::Backwards, 2).await,
            vec![2, 1, 0]
        );
    }

    #[tokio::test]
    async fn read_length_caps_results() {
        let store = Store::new();
        store.append("s", batch(5), ExpectedVersion::Any).await.unwrap();
        let records: Vec<_> = store
            .read(Some("s"), ReadDirection::Forwards, 1, Some(2))
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    async fn read_rejects_invalid_offset_and_missing_stream() {
        let store = Store::new();
        assert!(matches!(
            store.read(None, ReadDirection::Forwards, -2, None).await,
            Err(StoreError::InvalidOffset(-2))
        ));
        assert!(matches!(
            store.read(Some("nope"), ReadDirection::Forwards, 0, None).await,
            Err(StoreError::StreamNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn global_log_interleaves_streams() {
        let store = Store::new();
        store.append("a", batch(1), ExpectedVersion::Any).await.unwrap();
        store.append("b", batch(1), ExpectedVersion::Any).await.unwrap();
        store.append("a", batch(1), ExpectedVersion::Any).await.unwrap();

        let records: Vec<EventRecord> = store
            .read(None, ReadDirection::Forwards, 0, None)
            .await
            .unwrap()
            .map(Result::unwrap)
            .collect()
            .await;
        let streams: Vec<_> = records.iter().map(|r| r.stream_id.as_str()).collect();
        assert_eq!(streams, vec!["a", "b", "a"]);
        assert_eq!(
            records.iter().map(|r| r.position).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[tokio::test]
    async fn truncate_defaults_to_keeping_last_event() {
        let store = Store::new();
        store.append("s", batch(4), ExpectedVersion::Any).await.unwrap();
        store.truncate("s", None).await.unwrap();

        assert_eq!(
            offsets(&store, Some("s"), ReadDirection::Forwards, 0).await,
            vec![3]
        );
        let next = store.append("s", batch(1), ExpectedVersion::Exact(3)).await.unwrap();
        assert_eq!(next.first_offset, 4);
    }

    #[tokio::test]
    async fn truncate_scrubs_global_log() {
        let store = Store::new();
        store.append("a", batch(3), ExpectedVersion::Any).await.unwrap();
        store.append("b", batch(1), ExpectedVersion::Any).await.unwrap();
        store.truncate("a", Some(2)).await.unwrap();

        assert_eq!(
            offsets(&store, None, ReadDirection::Forwards, 0).await,
            vec![2, 3]
        );
    }

    #[tokio::test]
    async fn delete_then_append_restarts_stream() {
        let store = Store::new();
        store.append("s", batch(3), ExpectedVersion::Any).await.unwrap();
        store.delete("s").await.unwrap();

        assert!(matches!(
            store.get("s").await,
            Err(StoreError::StreamNotFound { .. })
        ));
        assert!(matches!(
            store.delete("s").await,
            Err(StoreError::StreamNotFound { .. })
        ));
        let result = store.append("s", batch(1), ExpectedVersion::NoStream).await.unwrap();
        assert_eq!(result.first_offset, 0);
        assert_eq!(result.last_position, 3, "positions are never reused");
    }

    #[tokio::test]
    async fn set_offset_validates_inputs() {
        let store = Store::new();
        assert!(matches!(
            store.set_offset("g", 0, Some("missing")).await,
            Err(StoreError::StreamNotFound { .. })
        ));
        assert!(matches!(
            store.set_offset("", 0, None).await,
            Err(StoreError::InvalidConsumerGroup)
        ));
        assert!(matches!(
            store.set_offset("g", -5, None).await,
            Err(StoreError::InvalidOffset(-5))
        ));
        store.set_offset("g", 7, None).await.unwrap();
        assert_eq!(store.get_offset("g", None).await.unwrap(), Some(7));
        assert_eq!(store.get_offset("other", None).await.unwrap(), None);
    }

    #[tokio::test]
    async fn subscribe_to_missing_stream_fails() {
        let store = Store::new();
        assert!(matches!(
            store.subscribe(Some("missing"), SubscribeOptions::live()).await,
            Err(StoreError::StreamNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn closed_store_rejects_writes_and_subscribers() {
        let store = Store::new();
        store.append("s", batch(1), ExpectedVersion::Any).await.unwrap();
        store.close();

        assert!(store.is_closed());
        assert!(matches!(
            store.append("s", batch(1), ExpectedVersion::Any).await,
            Err(StoreError::Closed)
        ));
        assert!(matches!(
            store.subscribe(None, SubscribeOptions::from_start()).await,
            Err(StoreError::Closed)
        ));
        assert_eq!(
            offsets(&store, Some("s"), ReadDirection::Forwards, 0).await,
            vec![0]
        );
    }

    #[tokio::test]
    async fn reads_page_through_long_streams() {
        let store = Store::new();
        let total = READ_PAGE as u64 * 2 + 7;
        store.append("s", batch(total), ExpectedVersion::Any).await.unwrap();

        let forwards = offsets(&store, Some("s"), ReadDirection::Forwards, 0).await;
        assert_eq!(forwards, (0..total).collect::<Vec<_>>());
        let backwards = offsets(&store, None, ReadDirection::Backwards, -1).await;
        assert_eq!(backwards, (0..total).rev().collect::<Vec<_>>());

        let capped: Vec<_> = store
            .read(Some("s"), ReadDirection::Forwards, 3, Some(READ_PAGE as u64 + 1))
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(capped.len(), READ_PAGE + 1);
    }

    #[tokio::test]
    async fn read_fetches_pages_as_it_is_polled() {
        let store = Store::new();
        store
            .append("s", batch(READ_PAGE as u64 + 1), ExpectedVersion::Any)
            .await
            .unwrap();
        let mut records = store
            .read(Some("s"), ReadDirection::Forwards, 0, None)
            .await
            .unwrap();
        for _ in 0..READ_PAGE {
            records.next().await.unwrap().unwrap();
        }

        store.delete("s").await.unwrap();
        assert!(matches!(
            records.next().await,
            Some(Err(StoreError::StreamNotFound { .. }))
        ));
        assert!(records.next().await.is_none());
    }

    #[tokio::test]
    async fn stream_bus_exists_only_while_subscribed() {
        let store = Store::new();
        store.append("s", batch(1), ExpectedVersion::Any).await.unwrap();
        let has_bus = |store: &Store| store.inner.read().streams["s"].live.is_some();
        assert!(!has_bus(&store));

        let subscription = store.subscribe(Some("s"), SubscribeOptions::live()).await.unwrap();
        assert!(has_bus(&store));

        drop(subscription);
        store.append("s", batch(1), ExpectedVersion::Any).await.unwrap();
        assert!(!has_bus(&store));

        store.subscribe(None, SubscribeOptions::live()).await.unwrap();
        assert!(!has_bus(&store), "global subscribers use the store-wide bus");
    }

    #[tokio::test]
    async fn checkpoints_go_to_the_supplied_store() {
        let checkpoints = Arc::new(Checkpoints::new());
        let store = Store::new().with_checkpoints(checkpoints.clone());
        store.set_offset("g", 3, None).await.unwrap();

        let key = CheckpointKey::new("g", None).unwrap();
        assert_eq!(checkpoints.get(&key).map(|c| c.offset), Some(3));
        assert_eq!(store.get_offset("g", None).await.unwrap(), Some(3));
    }

    #[test]
    fn zero_capacity_is_raised_to_one() {
        let store = Store::with_config(StoreConfig::default().live_buffer_capacity(0));
        assert_eq!(store.config().live_buffer_capacity, 1);
    }
}
