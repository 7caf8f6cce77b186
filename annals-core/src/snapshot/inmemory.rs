//! In-memory snapshot store implementation.

use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;
use serde::{Serialize, de::DeserializeOwned};

use super::{OfferSnapshotError, Snapshot, SnapshotOffer, SnapshotStore};

/// When a snapshot store accepts offers.
///
/// - [`SnapshotPolicy::Always`]: after every append
/// - [`SnapshotPolicy::EveryNEvents`]: once `n` events were replayed on top of
///   the previous snapshot
/// - [`SnapshotPolicy::Never`]: load-only, for snapshots managed elsewhere
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SnapshotPolicy {
    Always,
    EveryNEvents(u64),
    Never,
}

impl SnapshotPolicy {
    #[must_use]
    pub const fn should_snapshot(&self, events_since: u64) -> bool {
        match self {
            Self::Always => true,
            Self::EveryNEvents(threshold) => events_since >= *threshold,
            Self::Never => false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[source] serde_json::Error),
    #[error("deserialization error: {0}")]
    Deserialization(#[source] serde_json::Error),
}

type SharedSnapshots = Arc<RwLock<HashMap<String, Snapshot<serde_json::Value>>>>;

/// In-memory snapshot store holding JSON state per stream id.
///
/// Cloning is cheap and yields a handle to the same snapshots.
///
/// ```
/// use annals_core::snapshot::inmemory;
///
/// let snapshots = inmemory::Store::every(100);
/// # drop(snapshots);
/// ```
#[derive(Clone, Debug)]
pub struct Store {
    snapshots: SharedSnapshots,
    policy: SnapshotPolicy,
}

impl Store {
    #[must_use]
    pub fn with_policy(policy: SnapshotPolicy) -> Self {
        Self {
            snapshots: Arc::default(),
            policy,
        }
    }

    /// Snapshot after every append.
    #[must_use]
    pub fn always() -> Self {
        Self::with_policy(SnapshotPolicy::Always)
    }

    /// Snapshot once `n` events accumulated since the last snapshot.
    #[must_use]
    pub fn every(n: u64) -> Self {
        Self::with_policy(SnapshotPolicy::EveryNEvents(n))
    }

    /// Never store offered snapshots.
    #[must_use]
    pub fn never() -> Self {
        Self::with_policy(SnapshotPolicy::Never)
    }

    #[must_use]
    pub const fn policy(&self) -> &SnapshotPolicy {
        &self.policy
    }

    /// Version of the stored snapshot for `stream_id`, if any.
    #[must_use]
    pub fn version(&self, stream_id: &str) -> Option<u64> {
        self.snapshots.read().get(stream_id).map(|s| s.version)
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::always()
    }
}

impl SnapshotStore for Store {
    type Error = Error;

    #[tracing::instrument(skip(self))]
    async fn load<T>(&self, stream_id: &str) -> Result<Option<Snapshot<T>>, Self::Error>
    where
        T: DeserializeOwned,
    {
        let stored = self.snapshots.read().get(stream_id).cloned();
        let snapshot = match stored {
            Some(snapshot) => Some(Snapshot {
                version: snapshot.version,
                data: serde_json::from_value(snapshot.data).map_err(Error::Deserialization)?,
            }),
            None => None,
        };
        tracing::trace!(found = snapshot.is_some(), "snapshot lookup");
        Ok(snapshot)
    }

    #[tracing::instrument(skip(self, create_snapshot))]
    async fn offer_snapshot<CE, T, Create>(
        &self,
        stream_id: &str,
        events_since_last_snapshot: u64,
        create_snapshot: Create,
    ) -> Result<SnapshotOffer, OfferSnapshotError<Self::Error, CE>>
    where
        CE: std::error::Error + Send + Sync + 'static,
        T: Serialize,
        Create: FnOnce() -> Result<Snapshot<T>, CE> + Send,
    {
        if !self.policy.should_snapshot(events_since_last_snapshot) {
            return Ok(SnapshotOffer::Declined);
        }

        let snapshot = create_snapshot().map_err(OfferSnapshotError::Create)?;
        let data = serde_json::to_value(&snapshot.data)
            .map_err(|e| OfferSnapshotError::Snapshot(Error::Serialization(e)))?;
        let stored = Snapshot {
            version: snapshot.version,
            data,
        };

        let offer = {
            let mut snapshots = self.snapshots.write();
            match snapshots.get(stream_id) {
                Some(existing) if existing.version >= stored.version => SnapshotOffer::Declined,
                _ => {
                    snapshots.insert(stream_id.to_owned(), stored);
                    SnapshotOffer::Stored
                }
            }
        };

        tracing::debug!(
            events_since_last_snapshot,
            ?offer,
            "snapshot offer evaluated"
        );
        Ok(offer)
    }

    #[tracing::instrument(skip(self))]
    async fn remove(&self, stream_id: &str) -> Result<(), Self::Error> {
        let removed = self.snapshots.write().remove(stream_id).is_some();
        tracing::trace!(removed, "snapshot removed");
        Ok(())
    }
}
