//! Consumer group checkpoints.
//!
//! A checkpoint records how far a consumer group has progressed through a
//! stream (by offset) or through the global log (by position). Checkpoints are
//! written by acknowledging subscription records or out of band through
//! [`EventStore::set_offset`](crate::store::EventStore::set_offset).
use std::{collections::HashMap, fmt, sync::Arc};

use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::store::{ALL_STREAMS, StoreError, StreamPosition};

/// Identity of a checkpoint: one consumer group on one stream, or on the
/// global log when `stream_id` is `None`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckpointKey {
    pub consumer_group: String,
    pub stream_id: Option<String>,
}

impl CheckpointKey {
    /// Build a key, rejecting blank consumer groups.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidConsumerGroup`] when `consumer_group` is
    /// empty or whitespace.
    pub fn new(consumer_group: &str, stream_id: Option<&str>) -> Result<Self, StoreError> {
        if consumer_group.trim().is_empty() {
            return Err(StoreError::InvalidConsumerGroup);
        }
        Ok(Self {
            consumer_group: consumer_group.to_owned(),
            stream_id: stream_id.map(str::to_owned),
        })
    }

    #[must_use]
    pub const fn is_stream_scoped(&self) -> bool {
        self.stream_id.is_some()
    }
}

impl fmt::Display for CheckpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stream = self.stream_id.as_deref().unwrap_or(ALL_STREAMS);
        write!(f, "{}@{stream}", self.consumer_group)
    }
}

/// Persisted state of one checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Last written offset. `-1` means "start from live".
    pub offset: i64,
    /// Highest non-negative offset ever written for this key.
    ///
    /// Subscription records at or below this mark are reported as replayed.
    pub high_water: Option<u64>,
}

impl Checkpoint {
    fn advance(&mut self, offset: i64) {
        self.offset = offset;
        if let Ok(offset) = u64::try_from(offset) {
            self.high_water = Some(self.high_water.map_or(offset, |hw| hw.max(offset)));
        }
    }
}

/// Storage for consumer group checkpoints.
///
/// Object safe so that acknowledgement handles can carry it as
/// `Arc<dyn CheckpointStore>`.
pub trait CheckpointStore: Send + Sync {
    /// Load a checkpoint, `None` if it was never written.
    fn load<'a>(
        &'a self,
        key: &'a CheckpointKey,
    ) -> BoxFuture<'a, Result<Option<Checkpoint>, StoreError>>;

    /// Write `offset` for `key`, raising its high-water mark.
    ///
    /// The store does not enforce monotonicity: writing a lower offset
    /// rewinds the group.
    fn save<'a>(
        &'a self,
        key: &'a CheckpointKey,
        offset: i64,
    ) -> BoxFuture<'a, Result<(), StoreError>>;
}

/// In-memory checkpoint registry.
///
/// The map lock is only held for lookup and insertion; each key has its own
/// slot so different consumer groups never contend on writes.
#[derive(Debug, Default)]
pub struct Checkpoints {
    slots: RwLock<HashMap<CheckpointKey, Arc<Mutex<Checkpoint>>>>,
}

impl Checkpoints {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Synchronous form of [`CheckpointStore::load`].
    #[must_use]
    pub fn get(&self, key: &CheckpointKey) -> Option<Checkpoint> {
        let slot = self.slots.read().get(key).cloned()?;
        let checkpoint = *slot.lock();
        Some(checkpoint)
    }

    /// Synchronous form of [`CheckpointStore::save`].
    pub fn put(&self, key: &CheckpointKey, offset: i64) {
        let slot = self.slot(key);
        let mut checkpoint = slot.lock();
        checkpoint.advance(offset);
        tracing::trace!(%key, offset, high_water = ?checkpoint.high_water, "checkpoint written");
    }

    fn slot(&self, key: &CheckpointKey) -> Arc<Mutex<Checkpoint>> {
        if let Some(slot) = self.slots.read().get(key) {
            return Arc::clone(slot);
        }
        let mut slots = self.slots.write();
        Arc::clone(slots.entry(key.clone()).or_insert_with(|| {
            Arc::new(Mutex::new(Checkpoint {
                offset: StreamPosition::END_OF_STREAM,
                high_water: None,
            }))
        }))
    }
}

impl CheckpointStore for Checkpoints {
    fn load<'a>(
        &'a self,
        key: &'a CheckpointKey,
    ) -> BoxFuture<'a, Result<Option<Checkpoint>, StoreError>> {
        Box::pin(std::future::ready(Ok(self.get(key))))
    }

    fn save<'a>(
        &'a self,
        key: &'a CheckpointKey,
        offset: i64,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        self.put(key, offset);
        Box::pin(std::future::ready(Ok(())))
    }
}
