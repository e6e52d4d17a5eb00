//! Provider connector abstraction for Kiln.
//!
//! A [`Connector`] is the capability set the orchestrator needs from a compute
//! provider: submit, poll, stream logs, cancel, and fetch the trained artifact.
//! Connectors are resolved by name through a [`ConnectorRegistry`] built once at
//! startup.

pub mod connector;
pub mod error;
pub mod local;
pub mod mock;
pub mod registry;

pub use connector::{Connector, ProviderState, ProviderStatus};
pub use error::{ConnectorError, ConnectorResult};
pub use local::{LocalConnector, LOCAL_PROVIDER};
pub use mock::{MockCallCounts, MockConnector};
pub use registry::ConnectorRegistry;
