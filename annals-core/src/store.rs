//! Persistence layer abstractions.
//!
//! This module describes the storage contract ([`EventStore`]), the record
//! shapes exchanged with it ([`EventDescriptor`], [`EventRecord`],
//! [`EventStreamDescriptor`]) and a reference in-memory implementation.
//! Positions, sentinels and read directions live here to keep storage
//! concerns together.
use std::{collections::BTreeMap, future::Future};

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
pub use nonempty::NonEmpty;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    concurrency::{ConcurrencyConflict, ExpectedVersion},
    subscription::{SubscribeOptions, Subscription},
};

pub mod inmemory;

/// Free-form key/value metadata attached to an event.
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Identifier used in logs and checkpoint keys for the global log.
pub const ALL_STREAMS: &str = "$all";

/// Well-known offsets.
///
/// [`StreamPosition::END_OF_STREAM`] doubles as "nothing yet" when reading
/// and as "stream must not exist" when used as an expected version.
#[derive(Debug, Clone, Copy)]
pub struct StreamPosition;

impl StreamPosition {
    pub const START_OF_STREAM: i64 = 0;
    pub const END_OF_STREAM: i64 = -1;
}

/// Direction in which [`EventStore::read`] walks a stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReadDirection {
    #[default]
    Forwards,
    Backwards,
}

/// Event data ready to be appended.
///
/// This is the boundary between callers and the [`EventStore`]: the caller
/// names the event kind and supplies its payload, the store adds identity,
/// offsets and timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDescriptor {
    pub kind: String,
    pub data: serde_json::Value,
    pub metadata: Option<Metadata>,
}

impl EventDescriptor {
    #[must_use]
    pub fn new(kind: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            data,
            metadata: None,
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Event materialized from the store.
///
/// Within one stream `offset` starts at 0 and increases by exactly one per
/// appended event. `position` orders records across every stream of the
/// store and is never reused. Records are immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub stream_id: String,
    pub id: String,
    pub offset: u64,
    pub position: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: String,
    pub data: serde_json::Value,
    pub metadata: Option<Metadata>,
}

impl EventRecord {
    /// The cursor used for this record within a subscription or read scope:
    /// the stream offset when scoped to one stream, the global position
    /// otherwise.
    #[must_use]
    pub const fn cursor(&self, stream_scoped: bool) -> u64 {
        if stream_scoped {
            self.offset
        } else {
            self.position
        }
    }
}

/// Summary of a stream returned by [`EventStore::get`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventStreamDescriptor {
    pub stream_id: String,
    /// Number of events currently held by the stream.
    pub length: u64,
    pub first_event_at: Option<DateTime<Utc>>,
    pub last_event_at: Option<DateTime<Utc>>,
}

/// Result of a successful append operation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AppendResult {
    /// Offset of the first event written in the batch.
    pub first_offset: u64,
    /// Offset of the last event written in the batch.
    pub last_offset: u64,
    /// Global position of the last event written in the batch.
    pub last_position: u64,
}

/// Errors raised by [`EventStore`] operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The stream was never appended to, or has been deleted.
    #[error("stream `{stream_id}` not found")]
    StreamNotFound { stream_id: String },
    /// Expected version did not match the stream's last offset.
    #[error(transparent)]
    Conflict(#[from] ConcurrencyConflict),
    /// An offset below [`StreamPosition::END_OF_STREAM`] was supplied.
    #[error("invalid offset {0}: must be -1 (end of stream) or non-negative")]
    InvalidOffset(i64),
    #[error("stream id must not be blank")]
    InvalidStreamId,
    #[error("consumer group must not be blank")]
    InvalidConsumerGroup,
    /// The store has been closed and no longer accepts writes or subscribers.
    #[error("event store is closed")]
    Closed,
}

impl StoreError {
    pub fn stream_not_found(stream_id: impl Into<String>) -> Self {
        Self::StreamNotFound {
            stream_id: stream_id.into(),
        }
    }
}

/// Lazily produced, finite, one-shot sequence of records returned by
/// [`EventStore::read`].
///
/// Backends fetch records as the stream is polled rather than collecting the
/// whole range up front. Records appended during iteration may or may not be
/// included.
pub type RecordStream<'a> = BoxStream<'a, Result<EventRecord, StoreError>>;

pub(crate) fn validate_stream_id(stream_id: &str) -> Result<(), StoreError> {
    if stream_id.trim().is_empty() {
        Err(StoreError::InvalidStreamId)
    } else {
        Ok(())
    }
}

pub(crate) fn validate_offset(offset: i64) -> Result<(), StoreError> {
    if offset < StreamPosition::END_OF_STREAM {
        Err(StoreError::InvalidOffset(offset))
    } else {
        Ok(())
    }
}

/// Abstraction over the persistence layer for event streams.
///
/// A backend owns two serialization points: the per-stream offset counter and
/// the store-wide position counter. Both must be advanced atomically with
/// making the new record visible, so that no reader observes a record before
/// its offset and position are assigned and no two records ever share either.
///
/// Operations are cancelled by dropping the returned future or stream.
// ANCHOR: event_store_trait
pub trait EventStore: Send + Sync {
    /// Append events to a stream, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] when `expected_version` does not hold,
    /// [`StoreError::InvalidStreamId`] for a blank id, or
    /// [`StoreError::Closed`] once the store is shut down.
    fn append<'a>(
        &'a self,
        stream_id: &'a str,
        events: NonEmpty<EventDescriptor>,
        expected_version: ExpectedVersion,
    ) -> impl Future<Output = Result<AppendResult, StoreError>> + Send + 'a;

    /// Describe a stream.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::StreamNotFound`] if the stream does not exist.
    fn get<'a>(
        &'a self,
        stream_id: &'a str,
    ) -> impl Future<Output = Result<EventStreamDescriptor, StoreError>> + Send + 'a;

    /// Read a stream, or the global log when `stream_id` is `None`.
    ///
    /// For the global log `offset` is a position. Reading forwards from
    /// [`StreamPosition::END_OF_STREAM`] or backwards from
    /// [`StreamPosition::START_OF_STREAM`] yields nothing; reading backwards
    /// from `END_OF_STREAM` starts at the last record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::StreamNotFound`] before any record is produced
    /// if the stream does not exist.
    fn read<'a>(
        &'a self,
        stream_id: Option<&'a str>,
        direction: ReadDirection,
        offset: i64,
        length: Option<u64>,
    ) -> impl Future<Output = Result<RecordStream<'a>, StoreError>> + Send + 'a;

    /// Subscribe to a stream, or the global log when `stream_id` is `None`.
    ///
    /// History from the effective start offset is replayed first, then live
    /// records are delivered in append order with no gap or duplicate between
    /// the two phases.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::StreamNotFound`] if the stream does not exist.
    fn subscribe<'a>(
        &'a self,
        stream_id: Option<&'a str>,
        options: SubscribeOptions,
    ) -> impl Future<Output = Result<Subscription, StoreError>> + Send + 'a;

    /// Write a consumer group checkpoint out of band.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::StreamNotFound`] when `stream_id` names a missing
    /// stream.
    fn set_offset<'a>(
        &'a self,
        consumer_group: &'a str,
        offset: i64,
        stream_id: Option<&'a str>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send + 'a;

    /// Read a consumer group checkpoint, `None` if never written.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidConsumerGroup`] for a blank group.
    fn get_offset<'a>(
        &'a self,
        consumer_group: &'a str,
        stream_id: Option<&'a str>,
    ) -> impl Future<Output = Result<Option<i64>, StoreError>> + Send + 'a;

    /// Remove every event whose offset is below `before_offset`.
    ///
    /// When `before_offset` is `None`, everything before the last event is
    /// removed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::StreamNotFound`] if the stream does not exist.
    fn truncate<'a>(
        &'a self,
        stream_id: &'a str,
        before_offset: Option<u64>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send + 'a;

    /// Remove a stream entirely.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::StreamNotFound`] if the stream does not exist.
    fn delete<'a>(
        &'a self,
        stream_id: &'a str,
    ) -> impl Future<Output = Result<(), StoreError>> + Send + 'a;
}
// ANCHOR_END: event_store_trait
