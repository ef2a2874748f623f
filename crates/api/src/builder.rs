//! Builder-related types.

use crate::*;
use std::sync::Arc;

/// The general torii builder.
/// This contains the settings store and the factory instances,
/// allowing construction of runtime module instances.
pub struct Builder {
    /// The layered settings store modules read their configuration
    /// from. Loaded from disk (or ephemeral) before building.
    pub settings: SettingsStore,

    /// The [registry::NodeRegistryFactory] to be used for creating
    /// [registry::NodeRegistry] instances.
    pub registry: registry::DynNodeRegistryFactory,

    /// The [datagrams::DatagramsFactory] to be used for creating
    /// [datagrams::Datagrams] instances.
    pub datagrams: datagrams::DynDatagramsFactory,
}

impl Builder {
    /// Seed default settings from the configured module factories.
    /// Note, this should be called before freezing the Builder
    /// instance in an Arc<>.
    pub fn set_default_config(&mut self) -> ToriiResult<()> {
        let Self {
            settings,
            registry,
            datagrams,
        } = self;

        registry.default_config(settings)?;
        datagrams.default_config(settings)?;

        Ok(())
    }

    /// Validate settings against the configured module factories.
    pub fn validate_config(&self) -> ToriiResult<()> {
        let Self {
            settings,
            registry,
            datagrams,
        } = self;

        registry.validate_config(settings)?;
        datagrams.validate_config(settings)?;

        Ok(())
    }

    /// Freeze this builder for module construction.
    pub fn build(self) -> Arc<Self> {
        Arc::new(self)
    }
}
