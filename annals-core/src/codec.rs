//! Serialization boundary between typed events and stored records.
//!
//! Payloads are JSON values. An [`EventCodec`] knows which Rust type each
//! event kind decodes into; encoding only needs the event itself.

use std::collections::HashMap;

use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

use crate::{
    event::{AnyEvent, DomainEvent},
    store::{EventDescriptor, EventRecord},
};

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("no decoder registered for event kind `{kind}`")]
    UnknownKind { kind: String },
    #[error("failed to serialize event `{kind}`: {source}")]
    Serialization {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to deserialize event `{kind}`: {source}")]
    Deserialization {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

type Decoder = fn(serde_json::Value) -> Result<AnyEvent, serde_json::Error>;

/// Registry of event kinds and the types they decode into.
#[derive(Debug, Clone, Default)]
pub struct EventCodec {
    decoders: HashMap<&'static str, Decoder>,
}

impl EventCodec {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make records of kind `E::KIND` decode into `E`.
    pub fn register<E>(&mut self) -> &mut Self
    where
        E: DomainEvent + DeserializeOwned,
    {
        self.decoders.insert(E::KIND, |data| {
            serde_json::from_value::<E>(data).map(AnyEvent::new)
        });
        self
    }

    #[must_use]
    pub fn is_registered(&self, kind: &str) -> bool {
        self.decoders.contains_key(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.decoders.keys().copied()
    }

    /// Turn a typed event into a descriptor ready for appending.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Serialization`] when the event cannot be
    /// represented as JSON.
    pub fn encode<E>(&self, event: &E) -> Result<EventDescriptor, CodecError>
    where
        E: DomainEvent + Serialize,
    {
        let data = serde_json::to_value(event).map_err(|source| CodecError::Serialization {
            kind: E::KIND,
            source,
        })?;
        Ok(EventDescriptor::new(E::KIND, data))
    }

    /// Decode a record into the type registered for its kind.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::UnknownKind`] for unregistered kinds and
    /// [`CodecError::Deserialization`] when the payload does not match.
    pub fn decode(&self, record: &EventRecord) -> Result<AnyEvent, CodecError> {
        let decoder = self
            .decoders
            .get(record.kind.as_str())
            .ok_or_else(|| CodecError::UnknownKind {
                kind: record.kind.clone(),
            })?;
        decoder(record.data.clone()).map_err(|source| CodecError::Deserialization {
            kind: record.kind.clone(),
            source,
        })
    }
}
