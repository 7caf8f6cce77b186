//! Core traits and types for the annals event-sourcing library.
//!
//! - [`store`] - Event persistence abstraction (`EventStore`) and the
//!   in-memory backend
//! - [`subscription`] - Replay-then-live subscriptions with ackable records
//! - [`checkpoint`] - Consumer group checkpoints
//! - [`concurrency`] - Expected versions and conflict errors
//! - [`event`] - Event marker trait and type-erased events
//! - [`aggregate`] - State reconstruction (`Aggregate`, `EventAggregator`)
//! - [`migration`] - Upcasting of old event versions
//! - [`codec`] - JSON encoding and kind-based decoding of events
//! - [`repository`] - Aggregate load/append on top of a store
//! - [`snapshot`] - Aggregate state snapshots for faster loads
//!
//! # Example
//!
//! ```
//! use annals_core::{concurrency::ExpectedVersion, store::{inmemory, EventDescriptor, EventStore, NonEmpty}};
//!
//! # tokio_test_block(async {
//! let store = inmemory::Store::new();
//! let event = EventDescriptor::new("order-created", serde_json::json!({ "id": 1 }));
//! let result = store
//!     .append("orders-1", NonEmpty::new(event), ExpectedVersion::NoStream)
//!     .await
//!     .unwrap();
//! assert_eq!(result.last_offset, 0);
//! # });
//! # fn tokio_test_block(f: impl std::future::Future<Output = ()>) {
//! #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
//! # }
//! ```
//!
//! Most users should depend on the `annals` crate, which re-exports these
//! types.

pub mod aggregate;
pub mod checkpoint;
pub mod codec;
pub mod concurrency;
pub mod event;
pub mod migration;
pub mod repository;
pub mod snapshot;
pub mod store;
pub mod subscription;
