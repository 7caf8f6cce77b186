//! Aggregate persistence on top of an [`EventStore`].
//!
//! `Repository` maps aggregate ids to streams named `"{prefix}-{id}"`,
//! rebuilds state by reading a stream forwards, decoding each record,
//! migrating it to the latest version and folding it with an
//! [`EventAggregator`], and appends new events with optimistic concurrency.
//!
//! Snapshot support is opt-in via [`Repository::with_snapshots`]. Without it
//! there is no snapshot work on load or append and no serde bounds on the
//! aggregate state.

use std::{convert::Infallible, fmt::Display};

use futures::TryStreamExt as _;
use nonempty::NonEmpty;
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

use crate::{
    aggregate::{Aggregate, AggregateError, EventAggregator},
    codec::{CodecError, EventCodec},
    concurrency::{ConcurrencyConflict, ExpectedVersion},
    event::{AnyEvent, DomainEvent},
    migration::{EventMigrationManager, MigrationError},
    snapshot::{NoSnapshots, OfferSnapshotError, Snapshot, SnapshotStore},
    store::{AppendResult, EventDescriptor, EventRecord, EventStore, ReadDirection, StoreError},
};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error(transparent)]
    Conflict(ConcurrencyConflict),
    #[error("failed to access event store: {0}")]
    Store(#[source] StoreError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Migration(#[from] MigrationError),
    #[error("failed to rebuild aggregate state: {0}")]
    Aggregate(#[from] AggregateError),
    #[error("snapshot operation failed: {0}")]
    Snapshot(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
    #[error("no events to append")]
    EmptyAppend,
}

impl From<StoreError> for RepositoryError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::Conflict(conflict) => Self::Conflict(conflict),
            other => Self::Store(other),
        }
    }
}

/// State rebuilt from a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Loaded<T> {
    pub state: T,
    /// Offset of the last applied event, `None` when the stream retains no
    /// events.
    pub version: Option<u64>,
}

impl<T> Loaded<T> {
    /// Expected version to use when appending on top of this state.
    #[must_use]
    pub fn expected_version(&self) -> ExpectedVersion {
        self.version.map_or(ExpectedVersion::Any, ExpectedVersion::Exact)
    }
}

/// Snapshot-enabled mode marker for [`Repository`].
pub struct Snapshots<SS>(pub SS);

/// A fold over part of a stream.
struct Replayed<T> {
    loaded: Loaded<T>,
    /// Events applied on top of the starting state.
    applied: u64,
}

pub struct Repository<S, T, Ctx = (), M = NoSnapshots> {
    store: S,
    prefix: String,
    codec: EventCodec,
    migrations: EventMigrationManager<Ctx>,
    aggregator: EventAggregator<T>,
    snapshots: M,
}

impl<S, T> Repository<S, T, ()>
where
    S: EventStore,
    T: Aggregate,
{
    pub fn new(
        store: S,
        prefix: impl Into<String>,
        codec: EventCodec,
        aggregator: EventAggregator<T>,
    ) -> Self {
        Self::with_migrations(store, prefix, codec, EventMigrationManager::new(), aggregator)
    }
}

impl<S, T, Ctx> Repository<S, T, Ctx>
where
    S: EventStore,
    T: Aggregate,
    Ctx: 'static,
{
    pub fn with_migrations(
        store: S,
        prefix: impl Into<String>,
        codec: EventCodec,
        migrations: EventMigrationManager<Ctx>,
        aggregator: EventAggregator<T>,
    ) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            codec,
            migrations,
            aggregator,
            snapshots: NoSnapshots,
        }
    }

    /// Restore state from `snapshots` on load and offer a snapshot after
    /// every append.
    pub fn with_snapshots<SS>(self, snapshots: SS) -> Repository<S, T, Ctx, Snapshots<SS>>
    where
        SS: SnapshotStore,
    {
        Repository {
            store: self.store,
            prefix: self.prefix,
            codec: self.codec,
            migrations: self.migrations,
            aggregator: self.aggregator,
            snapshots: Snapshots(snapshots),
        }
    }

    /// Rebuild the current state, `None` if the stream does not exist.
    ///
    /// # Errors
    ///
    /// Fails when a record cannot be decoded, migrated or applied.
    #[tracing::instrument(skip_all, fields(stream_id = %self.stream_id(id)))]
    pub async fn load(&self, id: &impl Display) -> Result<Option<Loaded<T>>, RepositoryError> {
        let replayed = self.replay(&self.stream_id(id), None, None).await?;
        Ok(replayed.map(|r| r.loaded))
    }

    /// Rebuild the state as of `version` (inclusive).
    ///
    /// # Errors
    ///
    /// Fails when a record cannot be decoded, migrated or applied.
    #[tracing::instrument(skip_all, fields(stream_id = %self.stream_id(id), version = version))]
    pub async fn load_at(
        &self,
        id: &impl Display,
        version: u64,
    ) -> Result<Option<Loaded<T>>, RepositoryError> {
        let replayed = self.replay(&self.stream_id(id), None, Some(version)).await?;
        Ok(replayed.map(|r| r.loaded))
    }

    /// Append the first events of a new aggregate.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::Conflict`] if the stream already exists.
    pub async fn add(
        &self,
        id: &impl Display,
        events: Vec<EventDescriptor>,
    ) -> Result<AppendResult, RepositoryError> {
        self.update(id, events, ExpectedVersion::NoStream).await
    }

    /// Append events on top of `expected_version`.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::Conflict`] when another writer got there
    /// first, and [`RepositoryError::EmptyAppend`] for an empty batch.
    #[tracing::instrument(skip_all, fields(stream_id = %self.stream_id(id), ?expected_version))]
    pub async fn update(
        &self,
        id: &impl Display,
        events: Vec<EventDescriptor>,
        expected_version: ExpectedVersion,
    ) -> Result<AppendResult, RepositoryError> {
        self.append(&self.stream_id(id), events, expected_version)
            .await
    }

    /// Delete the stream for `id`. Returns `false` if there was none.
    ///
    /// # Errors
    ///
    /// Propagates store failures other than a missing stream.
    pub async fn remove(&self, id: &impl Display) -> Result<bool, RepositoryError> {
        self.delete(&self.stream_id(id)).await
    }
}

impl<S, T, Ctx, SS> Repository<S, T, Ctx, Snapshots<SS>>
where
    S: EventStore,
    T: Aggregate + Serialize + DeserializeOwned + Send,
    Ctx: 'static,
    SS: SnapshotStore,
{
    pub const fn snapshot_store(&self) -> &SS {
        &self.snapshots.0
    }

    /// Rebuild the current state from the latest snapshot and the events
    /// after it, `None` if the stream does not exist.
    ///
    /// A snapshot that fails to load is logged and replaced by a full replay.
    ///
    /// # Errors
    ///
    /// Fails when a record cannot be decoded, migrated or applied.
    #[tracing::instrument(skip_all, fields(stream_id = %self.stream_id(id)))]
    pub async fn load(&self, id: &impl Display) -> Result<Option<Loaded<T>>, RepositoryError> {
        let replayed = self.replay_from_snapshot(&self.stream_id(id), None).await?;
        Ok(replayed.map(|r| r.loaded))
    }

    /// Rebuild the state as of `version` (inclusive). The snapshot is only
    /// used when it is not newer than `version`.
    ///
    /// # Errors
    ///
    /// Fails when a record cannot be decoded, migrated or applied.
    #[tracing::instrument(skip_all, fields(stream_id = %self.stream_id(id), version = version))]
    pub async fn load_at(
        &self,
        id: &impl Display,
        version: u64,
    ) -> Result<Option<Loaded<T>>, RepositoryError> {
        let replayed = self
            .replay_from_snapshot(&self.stream_id(id), Some(version))
            .await?;
        Ok(replayed.map(|r| r.loaded))
    }

    /// Append the first events of a new aggregate, then offer a snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::Conflict`] if the stream already exists.
    pub async fn add(
        &self,
        id: &impl Display,
        events: Vec<EventDescriptor>,
    ) -> Result<AppendResult, RepositoryError> {
        self.update(id, events, ExpectedVersion::NoStream).await
    }

    /// Append events on top of `expected_version`, then offer a snapshot of
    /// the resulting state.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::Conflict`] when another writer got there
    /// first, [`RepositoryError::EmptyAppend`] for an empty batch and
    /// [`RepositoryError::Snapshot`] when the snapshot store fails. In the
    /// last case the events are already committed.
    #[tracing::instrument(skip_all, fields(stream_id = %self.stream_id(id), ?expected_version))]
    pub async fn update(
        &self,
        id: &impl Display,
        events: Vec<EventDescriptor>,
        expected_version: ExpectedVersion,
    ) -> Result<AppendResult, RepositoryError> {
        let stream_id = self.stream_id(id);
        let result = self.append(&stream_id, events, expected_version).await?;
        self.take_snapshot(&stream_id).await?;
        Ok(result)
    }

    /// Delete the stream for `id` and its snapshot. Returns `false` if there
    /// was no stream.
    ///
    /// # Errors
    ///
    /// Propagates store failures other than a missing stream, and snapshot
    /// store failures.
    pub async fn remove(&self, id: &impl Display) -> Result<bool, RepositoryError> {
        let stream_id = self.stream_id(id);
        let removed = self.delete(&stream_id).await?;
        self.snapshots
            .0
            .remove(&stream_id)
            .await
            .map_err(|e| RepositoryError::Snapshot(Box::new(e)))?;
        Ok(removed)
    }

    async fn replay_from_snapshot(
        &self,
        stream_id: &str,
        up_to: Option<u64>,
    ) -> Result<Option<Replayed<T>>, RepositoryError> {
        let snapshot = self
            .snapshots
            .0
            .load::<T>(stream_id)
            .await
            .inspect_err(|error| {
                tracing::error!(
                    error = %error,
                    "failed to load snapshot, falling back to full replay"
                );
            })
            .ok()
            .flatten()
            .filter(|snapshot| up_to.is_none_or(|v| snapshot.version <= v));
        if let Some(snapshot) = &snapshot {
            tracing::trace!(version = snapshot.version, "restoring from snapshot");
        }
        self.replay(stream_id, snapshot, up_to).await
    }

    async fn take_snapshot(&self, stream_id: &str) -> Result<(), RepositoryError> {
        let Some(Replayed { loaded, applied }) = self.replay_from_snapshot(stream_id, None).await?
        else {
            return Ok(());
        };
        let Some(version) = loaded.version else {
            return Ok(());
        };
        let state = loaded.state;
        self.snapshots
            .0
            .offer_snapshot(stream_id, applied, move || {
                Ok::<_, Infallible>(Snapshot {
                    version,
                    data: state,
                })
            })
            .await
            .map_err(|error| match error {
                OfferSnapshotError::Create(never) => match never {},
                OfferSnapshotError::Snapshot(error) => RepositoryError::Snapshot(Box::new(error)),
            })?;
        Ok(())
    }
}

impl<S, T, Ctx, M> Repository<S, T, Ctx, M>
where
    S: EventStore,
    T: Aggregate,
    Ctx: 'static,
{
    pub const fn store(&self) -> &S {
        &self.store
    }

    pub const fn codec(&self) -> &EventCodec {
        &self.codec
    }

    pub fn stream_id(&self, id: &impl Display) -> String {
        format!("{}-{id}", self.prefix)
    }

    /// Encode a typed event with this repository's codec.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::Codec`] when serialization fails.
    pub fn encode<E>(&self, event: &E) -> Result<EventDescriptor, RepositoryError>
    where
        E: DomainEvent + Serialize,
    {
        Ok(self.codec.encode(event)?)
    }

    /// Whether a stream exists for `id`.
    ///
    /// # Errors
    ///
    /// Propagates store failures other than a missing stream.
    pub async fn contains(&self, id: &impl Display) -> Result<bool, RepositoryError> {
        match self.store.get(&self.stream_id(id)).await {
            Ok(_) => Ok(true),
            Err(StoreError::StreamNotFound { .. }) => Ok(false),
            Err(error) => Err(error.into()),
        }
    }

    /// Fold the events after `snapshot` (or the whole stream) up to `up_to`.
    async fn replay(
        &self,
        stream_id: &str,
        snapshot: Option<Snapshot<T>>,
        up_to: Option<u64>,
    ) -> Result<Option<Replayed<T>>, RepositoryError> {
        let from = snapshot.as_ref().map_or(0, |s| s.version.saturating_add(1));
        let records: Vec<EventRecord> = match self
            .store
            .read(
                Some(stream_id),
                ReadDirection::Forwards,
                i64::try_from(from).unwrap_or(i64::MAX),
                None,
            )
            .await
        {
            Ok(stream) => {
                stream
                    .try_take_while(|record| {
                        std::future::ready(Ok(up_to.is_none_or(|v| record.offset <= v)))
                    })
                    .try_collect()
                    .await?
            }
            Err(StoreError::StreamNotFound { .. }) => return Ok(None),
            Err(error) => return Err(error.into()),
        };

        let snapshot_version = snapshot.as_ref().map(|s| s.version);
        let version = records.last().map(|r| r.offset).or(snapshot_version);
        let events = records
            .iter()
            .map(|record| -> Result<AnyEvent, RepositoryError> {
                let event = self.codec.decode(record)?;
                Ok(self.migrations.migrate_to_latest(event)?)
            })
            .collect::<Result<Vec<_>, _>>()?;
        let state = self
            .aggregator
            .aggregate(&events, snapshot.map(|s| s.data))?;
        tracing::debug!(
            events = events.len(),
            ?snapshot_version,
            ?version,
            "aggregate rebuilt"
        );
        Ok(Some(Replayed {
            loaded: Loaded { state, version },
            applied: events.len() as u64,
        }))
    }

    async fn append(
        &self,
        stream_id: &str,
        events: Vec<EventDescriptor>,
        expected_version: ExpectedVersion,
    ) -> Result<AppendResult, RepositoryError> {
        let events = NonEmpty::from_vec(events).ok_or(RepositoryError::EmptyAppend)?;
        Ok(self.store.append(stream_id, events, expected_version).await?)
    }

    async fn delete(&self, stream_id: &str) -> Result<bool, RepositoryError> {
        match self.store.delete(stream_id).await {
            Ok(()) => Ok(true),
            Err(StoreError::StreamNotFound { .. }) => Ok(false),
            Err(error) => Err(error.into()),
        }
    }
}
