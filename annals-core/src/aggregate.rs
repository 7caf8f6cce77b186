//! State reconstruction from ordered events.
//!
//! An [`Aggregate`] registers one handler per event type it understands. The
//! [`EventAggregator`] builds that dispatch table once and folds event
//! sequences over a state value, matching each event to the handler for its
//! exact runtime type.
//!
//! ```
//! use annals_core::aggregate::{Aggregate, EventAggregator, Handlers};
//! use annals_core::event::{AnyEvent, DomainEvent};
//!
//! #[derive(Default, Debug, PartialEq)]
//! struct Counter {
//!     value: i64,
//! }
//!
//! struct Incremented(i64);
//!
//! impl DomainEvent for Incremented {
//!     const KIND: &'static str = "incremented";
//! }
//!
//! impl Aggregate for Counter {
//!     fn register(_convention: &str, handlers: &mut Handlers<Self>) {
//!         handlers.on(|state: &mut Self, e: &Incremented| state.value += e.0);
//!     }
//! }
//!
//! let aggregator = EventAggregator::<Counter>::new();
//! let events = [AnyEvent::new(Incremented(2)), AnyEvent::new(Incremented(3))];
//! let state = aggregator.aggregate(&events, None).unwrap();
//! assert_eq!(state, Counter { value: 5 });
//! ```

use std::{any::TypeId, borrow::Borrow, collections::HashMap, fmt};

use thiserror::Error;

use crate::event::{AnyEvent, DomainEvent};

/// Handler naming convention used when none is configured.
pub const DEFAULT_CONVENTION: &str = "On";

/// State types that can be rebuilt from events.
// ANCHOR: aggregate_trait
pub trait Aggregate: Sized + 'static {
    /// Register event handlers.
    ///
    /// `convention` is the handler family the aggregator was configured with
    /// ([`DEFAULT_CONVENTION`] unless overridden). Types exposing a single
    /// family can ignore it.
    fn register(convention: &str, handlers: &mut Handlers<Self>);
}
// ANCHOR_END: aggregate_trait

type Handler<T> = Box<dyn Fn(T, &AnyEvent) -> T + Send + Sync>;

struct Registered<T> {
    type_name: &'static str,
    apply: Handler<T>,
}

/// Dispatch table from event type to handler.
pub struct Handlers<T> {
    table: HashMap<TypeId, Registered<T>>,
}

impl<T> Default for Handlers<T> {
    fn default() -> Self {
        Self {
            table: HashMap::new(),
        }
    }
}

impl<T> fmt::Debug for Handlers<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set()
            .entries(self.table.values().map(|r| r.type_name))
            .finish()
    }
}

impl<T: 'static> Handlers<T> {
    /// Handle `E` by mutating the state in place.
    pub fn on<E: DomainEvent>(&mut self, handler: fn(&mut T, &E)) -> &mut Self {
        self.insert::<E>(Box::new(move |mut state: T, event: &AnyEvent| {
            if let Some(event) = event.downcast_ref::<E>() {
                handler(&mut state, event);
            }
            state
        }))
    }

    /// Handle `E` by producing a replacement state.
    pub fn on_replace<E: DomainEvent>(&mut self, handler: fn(T, &E) -> T) -> &mut Self {
        self.insert::<E>(Box::new(move |state: T, event: &AnyEvent| {
            match event.downcast_ref::<E>() {
                Some(event) => handler(state, event),
                None => state,
            }
        }))
    }

    fn insert<E: DomainEvent>(&mut self, apply: Handler<T>) -> &mut Self {
        let replaced = self
            .table
            .insert(
                TypeId::of::<E>(),
                Registered {
                    type_name: std::any::type_name::<E>(),
                    apply,
                },
            )
            .is_some();
        if replaced {
            tracing::trace!(event = std::any::type_name::<E>(), "handler replaced");
        }
        self
    }

    #[must_use]
    pub fn handles<E: DomainEvent>(&self) -> bool {
        self.table.contains_key(&TypeId::of::<E>())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

/// What to do with an event that has no registered handler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UnknownEvents {
    /// Fail with [`AggregateError::NoHandlerFound`].
    #[default]
    Reject,
    /// Leave the state unchanged and continue.
    Skip,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatorOptions {
    pub convention: String,
    pub unknown_events: UnknownEvents,
}

impl Default for AggregatorOptions {
    fn default() -> Self {
        Self {
            convention: DEFAULT_CONVENTION.to_owned(),
            unknown_events: UnknownEvents::default(),
        }
    }
}

impl AggregatorOptions {
    #[must_use]
    pub fn convention(mut self, convention: impl Into<String>) -> Self {
        self.convention = convention.into();
        self
    }

    #[must_use]
    pub const fn unknown_events(mut self, policy: UnknownEvents) -> Self {
        self.unknown_events = policy;
        self
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AggregateError {
    #[error("no handler found for event type `{event_type}` (kind `{kind}`)")]
    NoHandlerFound {
        event_type: &'static str,
        kind: &'static str,
    },
}

/// Folds event sequences into state of type `T`.
///
/// The dispatch table is built once at construction; an aggregator is
/// immutable afterwards and can be shared between threads.
pub struct EventAggregator<T> {
    handlers: Handlers<T>,
    options: AggregatorOptions,
    factory: Box<dyn Fn() -> T + Send + Sync>,
}

impl<T: Aggregate + Default> EventAggregator<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::with_options(AggregatorOptions::default())
    }

    #[must_use]
    pub fn with_options(options: AggregatorOptions) -> Self {
        Self::with_factory(options, T::default)
    }
}

impl<T: Aggregate + Default> Default for EventAggregator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Aggregate> EventAggregator<T> {
    /// Build an aggregator for a state type without a meaningful `Default`.
    #[must_use]
    pub fn with_factory(
        options: AggregatorOptions,
        factory: impl Fn() -> T + Send + Sync + 'static,
    ) -> Self {
        let mut handlers = Handlers::default();
        T::register(&options.convention, &mut handlers);
        tracing::trace!(
            state = std::any::type_name::<T>(),
            convention = %options.convention,
            handlers = handlers.len(),
            "aggregator built"
        );
        Self {
            handlers,
            options,
            factory: Box::new(factory),
        }
    }

    #[must_use]
    pub const fn options(&self) -> &AggregatorOptions {
        &self.options
    }

    #[must_use]
    pub const fn handlers(&self) -> &Handlers<T> {
        &self.handlers
    }

    /// Apply `events` in order, starting from `state` or a fresh one.
    ///
    /// # Errors
    ///
    /// Returns [`AggregateError::NoHandlerFound`] for the first event without
    /// a handler when unknown events are rejected.
    pub fn aggregate<I>(&self, events: I, state: Option<T>) -> Result<T, AggregateError>
    where
        I: IntoIterator,
        I::Item: Borrow<AnyEvent>,
    {
        let mut state = state.unwrap_or_else(|| (self.factory)());
        for event in events {
            let event = event.borrow();
            match self.handlers.table.get(&event.event_type_id()) {
                Some(handler) => state = (handler.apply)(state, event),
                None if self.options.unknown_events == UnknownEvents::Skip => {
                    tracing::trace!(event = event.type_name(), "skipping unhandled event");
                }
                None => {
                    return Err(AggregateError::NoHandlerFound {
                        event_type: event.type_name(),
                        kind: event.kind(),
                    });
                }
            }
        }
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Order {
        items: Vec<String>,
        shipped: bool,
    }

    struct ItemAdded(&'static str);
    struct Shipped;
    struct Audited;

    impl DomainEvent for ItemAdded {
        const KIND: &'static str = "item-added";
    }
    impl DomainEvent for Shipped {
        const KIND: &'static str = "shipped";
    }
    impl DomainEvent for Audited {
        const KIND: &'static str = "audited";
    }

    impl Aggregate for Order {
        fn register(convention: &str, handlers: &mut Handlers<Self>) {
            handlers.on(|order: &mut Self, e: &ItemAdded| order.items.push(e.0.to_owned()));
            if convention == "Apply" {
                handlers.on_replace(|order: Self, _: &Shipped| Self {
                    shipped: true,
                    ..order
                });
            }
        }
    }

    fn events() -> Vec<AnyEvent> {
        vec![
            AnyEvent::new(ItemAdded("book")),
            AnyEvent::new(ItemAdded("pen")),
        ]
    }

    #[test]
    fn same_events_yield_equal_states() {
        let aggregator = EventAggregator::<Order>::new();
        let a = aggregator.aggregate(&events(), None).unwrap();
        let b = aggregator.aggregate(&events(), None).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.items, ["book", "pen"]);
    }

    #[test]
    fn continues_from_supplied_state() {
        let aggregator = EventAggregator::<Order>::new();
        let start = Order {
            items: vec!["mug".into()],
            shipped: false,
        };
        let state = aggregator
            .aggregate([AnyEvent::new(ItemAdded("cup"))], Some(start))
            .unwrap();
        assert_eq!(state.items, ["mug", "cup"]);
    }

    #[test]
    fn unknown_event_is_rejected_by_default() {
        let aggregator = EventAggregator::<Order>::new();
        let err = aggregator
            .aggregate([AnyEvent::new(Audited)], None)
            .unwrap_err();
        assert_eq!(
            err,
            AggregateError::NoHandlerFound {
                event_type: std::any::type_name::<Audited>(),
                kind: "audited",
            }
        );
    }

    #[test]
    fn unknown_event_can_be_skipped() {
        let aggregator = EventAggregator::<Order>::with_options(
            AggregatorOptions::default().unknown_events(UnknownEvents::Skip),
        );
        let mut stream = events();
        stream.insert(1, AnyEvent::new(Audited));
        let state = aggregator.aggregate(&stream, None).unwrap();
        assert_eq!(state.items, ["book", "pen"]);
    }

    #[test]
    fn convention_selects_handler_family() {
        let default = EventAggregator::<Order>::new();
        assert!(!default.handlers().handles::<Shipped>());

        let apply =
            EventAggregator::<Order>::with_options(AggregatorOptions::default().convention("Apply"));
        assert!(apply.handlers().handles::<Shipped>());
        let state = apply.aggregate([AnyEvent::new(Shipped)], None).unwrap();
        assert!(state.shipped);
    }

    #[test]
    fn factory_supplies_initial_state() {
        struct Balance(i64);
        struct Deposited(i64);
        impl DomainEvent for Deposited {
            const KIND: &'static str = "deposited";
        }
        impl Aggregate for Balance {
            fn register(_: &str, handlers: &mut Handlers<Self>) {
                handlers.on_replace(|b: Self, e: &Deposited| Self(b.0 + e.0));
            }
        }

        let aggregator = EventAggregator::with_factory(AggregatorOptions::default(), || Balance(100));
        let state = aggregator
            .aggregate([AnyEvent::new(Deposited(5))], None)
            .unwrap();
        assert_eq!(state.0, 105);
    }
}
