//! Connector registry: provider name → connector.
//!
//! Built once at startup and then shared read-only, so lookups need no locking.

use crate::connector::Connector;
use crate::error::{ConnectorError, ConnectorResult};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Default, Clone)]
pub struct ConnectorRegistry {
    connectors: BTreeMap<String, Arc<dyn Connector>>,
}

impl fmt::Debug for ConnectorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectorRegistry")
            .field("providers", &self.connectors.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ConnectorRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connector under its own name.
    ///
    /// Returns `true` if the name was new, `false` if it replaced an existing connector.
    pub fn register(&mut self, connector: Arc<dyn Connector>) -> bool {
        let name = connector.name().to_string();
        debug!(provider = %name, "Registering connector");

        let replaced = self.connectors.insert(name.clone(), connector).is_some();
        if replaced {
            warn!(provider = %name, "Connector replaced in registry");
        }
        !replaced
    }

    /// Builder-style [`register`](Self::register).
    #[must_use]
    pub fn with(mut self, connector: Arc<dyn Connector>) -> Self {
        self.register(connector);
        self
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Connector>> {
        self.connectors.get(name).cloned()
    }

    /// Like [`get`](Self::get), but an unknown name is a reportable error.
    pub fn resolve(&self, name: &str) -> ConnectorResult<Arc<dyn Connector>> {
        self.get(name).ok_or_else(|| ConnectorError::UnknownProvider(name.to_string()))
    }

    /// Registered provider names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.connectors.keys().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.connectors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }

    /// Runs every connector's health check.
    pub async fn check_availability(&self) -> Vec<(String, ConnectorResult<()>)> {
        let mut out = Vec::with_capacity(self.connectors.len());
        for (name, connector) in &self.connectors {
            let result = connector.health_check().await;
            if let Err(e) = &result {
                warn!(provider = %name, error = %e, "Provider unavailable");
            }
            out.push((name.clone(), result));
        }
        out
    }
}
