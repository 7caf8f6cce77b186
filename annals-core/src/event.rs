//! Domain event marker and type-erased event container.
//!
//! `DomainEvent` is the lightweight trait every concrete event struct
//! implements. It avoids persistence concerns; serialization is handled by
//! the [`codec`](crate::codec). [`AnyEvent`] carries an event of any
//! registered type through the migration and aggregation pipeline, which
//! dispatch on its runtime type.

use std::{
    any::{Any, TypeId},
    fmt,
};

/// Marker trait for events that can be persisted by the event store.
///
/// Each event carries a unique [`Self::KIND`] identifier so the codec can
/// route stored payloads back to the correct type. Versioned events use
/// distinct kinds, e.g. `"order-placed"` and `"order-placed.v2"`.
pub trait DomainEvent: Any + Send + Sync {
    const KIND: &'static str;
}

/// An owned event whose concrete type is only known at runtime.
pub struct AnyEvent {
    kind: &'static str,
    type_name: &'static str,
    inner: Box<dyn Any + Send + Sync>,
}

impl AnyEvent {
    pub fn new<E: DomainEvent>(event: E) -> Self {
        Self {
            kind: E::KIND,
            type_name: std::any::type_name::<E>(),
            inner: Box::new(event),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> &'static str {
        self.kind
    }

    /// Rust type name of the wrapped event, for diagnostics.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        self.type_name
    }

    #[must_use]
    pub fn event_type_id(&self) -> TypeId {
        (*self.inner).type_id()
    }

    #[must_use]
    pub fn is<E: DomainEvent>(&self) -> bool {
        self.inner.is::<E>()
    }

    #[must_use]
    pub fn downcast_ref<E: DomainEvent>(&self) -> Option<&E> {
        self.inner.downcast_ref()
    }

    /// Take the concrete event out.
    ///
    /// # Errors
    ///
    /// Gives `self` back unchanged when the event is not an `E`.
    pub fn downcast<E: DomainEvent>(self) -> Result<E, Self> {
        if self.inner.is::<E>() {
            self.inner
                .downcast::<E>()
                .map(|event| *event)
                .map_err(|inner| Self {
                    kind: self.kind,
                    type_name: self.type_name,
                    inner,
                })
        } else {
            Err(self)
        }
    }
}

impl fmt::Debug for AnyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnyEvent")
            .field("kind", &self.kind)
            .field("type", &self.type_name)
            .finish_non_exhaustive()
    }
}

impl<E: DomainEvent> From<E> for AnyEvent {
    fn from(event: E) -> Self {
        Self::new(event)
    }
}
