//! Snapshot support for faster aggregate loading.
//!
//! A snapshot stores aggregate state as of a stream version, so a load only
//! replays the events appended after it. This module provides:
//!
//! - [`Snapshot`] - State at a stream version
//! - [`SnapshotStore`] - Trait for snapshot persistence with policy
//! - [`NoSnapshots`] - No-op implementation; this is the default when
//!   [`Repository::with_snapshots`](crate::repository::Repository::with_snapshots)
//!   is not called
//! - [`inmemory`] - In-memory reference implementation with configurable policy

use std::{convert::Infallible, future::Future};

use serde::{Serialize, de::DeserializeOwned};

pub mod inmemory;

/// Aggregate state as of `version`, the offset of the last event folded into
/// it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Snapshot<Data> {
    pub version: u64,
    pub data: Data,
}

/// Snapshot persistence keyed by stream id, with a built-in policy.
///
/// The repository offers a snapshot after every successful append and lets
/// the store decide whether to take it.
// ANCHOR: snapshot_store_trait
pub trait SnapshotStore: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Load the latest snapshot of a stream, `None` if there is none.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage fails or the stored data
    /// does not deserialize as `T`.
    fn load<T>(
        &self,
        stream_id: &str,
    ) -> impl Future<Output = Result<Option<Snapshot<T>>, Self::Error>> + Send
    where
        T: DeserializeOwned;

    /// Offer a snapshot, created lazily only if the policy accepts it.
    ///
    /// Implementations decline snapshots that are not newer than the one
    /// already stored.
    ///
    /// # Errors
    ///
    /// Returns [`OfferSnapshotError::Create`] if `create_snapshot` fails and
    /// [`OfferSnapshotError::Snapshot`] if persistence fails.
    fn offer_snapshot<CE, T, Create>(
        &self,
        stream_id: &str,
        events_since_last_snapshot: u64,
        create_snapshot: Create,
    ) -> impl Future<Output = Result<SnapshotOffer, OfferSnapshotError<Self::Error, CE>>> + Send
    where
        CE: std::error::Error + Send + Sync + 'static,
        T: Serialize,
        Create: FnOnce() -> Result<Snapshot<T>, CE> + Send;

    /// Forget the snapshot of a stream. Removing a missing snapshot succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage fails.
    fn remove(&self, stream_id: &str) -> impl Future<Output = Result<(), Self::Error>> + Send;
}
// ANCHOR_END: snapshot_store_trait

/// Result of offering a snapshot to a store.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SnapshotOffer {
    Declined,
    Stored,
}

/// Error returned by [`SnapshotStore::offer_snapshot`].
#[derive(Debug, thiserror::Error)]
pub enum OfferSnapshotError<SnapshotError, CreateError>
where
    SnapshotError: std::error::Error + 'static,
    CreateError: std::error::Error + 'static,
{
    #[error("failed to create snapshot: {0}")]
    Create(#[source] CreateError),
    #[error("snapshot operation failed: {0}")]
    Snapshot(#[source] SnapshotError),
}

/// No-op snapshot store: loads nothing and declines every offer.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoSnapshots;

impl SnapshotStore for NoSnapshots {
    type Error = Infallible;

    async fn load<T>(&self, _stream_id: &str) -> Result<Option<Snapshot<T>>, Self::Error>
    where
        T: DeserializeOwned,
    {
        Ok(None)
    }

    async fn offer_snapshot<CE, T, Create>(
        &self,
        _stream_id: &str,
        _events_since_last_snapshot: u64,
        _create_snapshot: Create,
    ) -> Result<SnapshotOffer, OfferSnapshotError<Self::Error, CE>>
    where
        CE: std::error::Error + Send + Sync + 'static,
        T: Serialize,
        Create: FnOnce() -> Result<Snapshot<T>, CE> + Send,
    {
        Ok(SnapshotOffer::Declined)
    }

    async fn remove(&self, _stream_id: &str) -> Result<(), Self::Error> {
        Ok(())
    }
}
