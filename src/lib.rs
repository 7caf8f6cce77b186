#![doc = include_str!("../README.md")]

pub use annals_core::{
    aggregate,
    aggregate::{Aggregate, AggregatorOptions, EventAggregator, Handlers, UnknownEvents},
    checkpoint,
    codec,
    codec::EventCodec,
    concurrency,
    concurrency::{ConcurrencyConflict, ExpectedVersion},
    event,
    event::{AnyEvent, DomainEvent},
    migration,
    migration::EventMigrationManager,
    repository,
    repository::{Repository, Snapshots},
    snapshot,
    snapshot::{NoSnapshots, Snapshot, SnapshotStore},
    subscription,
    subscription::{
        AckableEventRecord, Delivery, SubscribeOptions, Subscription, SubscriptionError,
        replay_then_live,
    },
};

pub mod store {
    pub use annals_core::store::{
        ALL_STREAMS, AppendResult, EventDescriptor, EventRecord, EventStore,
        EventStreamDescriptor, Metadata, NonEmpty, ReadDirection, RecordStream, StoreError,
        StreamPosition,
    };

    pub use annals_core::store::inmemory;
}
