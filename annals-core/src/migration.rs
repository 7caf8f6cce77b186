//! Upcasting of historical event versions.
//!
//! Each registration maps one source event type to the next version. Chains
//! such as `V1 -> V2 -> V3` are two registrations resolved transitively by
//! [`EventMigrationManager::migrate_to_latest`]. Types without a registration
//! are already current and pass through unchanged.

use std::{
    any::TypeId,
    collections::{HashMap, HashSet},
    fmt,
};

use thiserror::Error;

use crate::event::{AnyEvent, DomainEvent};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MigrationError {
    /// Following registrations revisited a type.
    #[error("event migration cycle: {}", .path.join(" -> "))]
    Cycle { path: Vec<&'static str> },
}

type Migrate<Ctx> = Box<dyn Fn(&Ctx, AnyEvent) -> AnyEvent + Send + Sync>;

struct Step<Ctx> {
    from: &'static str,
    migrate: Migrate<Ctx>,
}

/// Registry of single-step event migrations.
///
/// `Ctx` is handed to every migration, e.g. lookup tables needed to fill in
/// fields that older versions lack.
pub struct EventMigrationManager<Ctx = ()> {
    steps: HashMap<TypeId, Step<Ctx>>,
    context: Ctx,
}

impl EventMigrationManager<()> {
    #[must_use]
    pub fn new() -> Self {
        Self::with_context(())
    }
}

impl Default for EventMigrationManager<()> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Ctx> fmt::Debug for EventMigrationManager<Ctx> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventMigrationManager")
            .field("migrations", &self.steps.values().map(|s| s.from).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl<Ctx: 'static> EventMigrationManager<Ctx> {
    pub fn with_context(context: Ctx) -> Self {
        Self {
            steps: HashMap::new(),
            context,
        }
    }

    /// Register the migration from `Src` to its next version `Dst`.
    ///
    /// Registering `Src` again replaces the previous migration.
    pub fn register<Src, Dst>(
        &mut self,
        migrate: impl Fn(&Ctx, Src) -> Dst + Send + Sync + 'static,
    ) -> &mut Self
    where
        Src: DomainEvent,
        Dst: DomainEvent,
    {
        let step = Step {
            from: std::any::type_name::<Src>(),
            migrate: Box::new(move |ctx: &Ctx, event: AnyEvent| {
                match event.downcast::<Src>() {
                    Ok(source) => AnyEvent::new(migrate(ctx, source)),
                    Err(event) => event,
                }
            }),
        };
        if self.steps.insert(TypeId::of::<Src>(), step).is_some() {
            tracing::trace!(
                from = std::any::type_name::<Src>(),
                "event migration replaced"
            );
        }
        self
    }

    #[must_use]
    pub fn is_registered<E: DomainEvent>(&self) -> bool {
        self.steps.contains_key(&TypeId::of::<E>())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    #[must_use]
    pub const fn context(&self) -> &Ctx {
        &self.context
    }

    /// Apply registered migrations until the event reaches a type with none.
    ///
    /// # Errors
    ///
    /// Returns [`MigrationError::Cycle`] when the chain revisits a type.
    pub fn migrate_to_latest(&self, event: AnyEvent) -> Result<AnyEvent, MigrationError> {
        let mut event = event;
        let mut visited = HashSet::new();
        let mut path = Vec::new();
        while let Some(step) = self.steps.get(&event.event_type_id()) {
            path.push(event.type_name());
            if !visited.insert(event.event_type_id()) {
                return Err(MigrationError::Cycle { path });
            }
            event = (step.migrate)(&self.context, event);
        }
        if !path.is_empty() {
            tracing::trace!(
                from = path[0],
                to = event.type_name(),
                steps = path.len(),
                "event migrated"
            );
        }
        Ok(event)
    }
}
