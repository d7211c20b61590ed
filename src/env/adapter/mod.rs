//! Backend dialect adapters
//!
//! Callers describe what they want as an [`Operation`]; the active
//! [`BackendAdapter`] turns it into the wire payload of its dialect and turns
//! the backend's reply back into a dialect-independent result or a
//! normalized [`BackendError`](super::error::BackendError). The adapter is
//! chosen once, from configuration, when the environment is built.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::envelope::EnvelopeCodec;
use super::error::{ConfigError, EnvError, ProtocolError};

pub mod go;
pub mod python;

pub use go::GoAdapter;
pub use python::PythonAdapter;

/// Wire dialect spoken by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// `Type`/`Request`/`Params` requests with CapitalCase fields
    Go,
    /// Flat `op` requests with snake_case fields
    Python,
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dialect::Go => f.write_str("go"),
            Dialect::Python => f.write_str("python"),
        }
    }
}

impl FromStr for Dialect {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "go" => Ok(Dialect::Go),
            "python" => Ok(Dialect::Python),
            other => Err(ConfigError::UnknownDialect(other.to_string())),
        }
    }
}

/// One side of a relation: a service and, optionally, its relation name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Service name
    pub service: String,
    /// Relation name on that service
    pub relation: Option<String>,
}

impl Endpoint {
    /// Endpoint with a named relation.
    pub fn new(service: impl Into<String>, relation: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            relation: Some(relation.into()),
        }
    }

    /// Endpoint naming only the service.
    pub fn service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            relation: None,
        }
    }

    /// Wire name, `service:relation` or just `service`.
    pub fn name(&self) -> String {
        match &self.relation {
            Some(relation) if !relation.is_empty() => format!("{}:{}", self.service, relation),
            _ => self.service.clone(),
        }
    }
}

impl FromStr for Endpoint {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.split_once(':') {
            Some((service, relation)) => Endpoint::new(service, relation),
            None => Endpoint::service(s),
        })
    }
}

/// Abstract operations every dialect understands (or explicitly refuses)
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// Authenticate the connection
    Login {
        /// User name or tag
        user: String,
        /// Password
        password: String,
    },
    /// Deploy a charm as a new service
    Deploy {
        /// Charm URL, e.g. `cs:precise/mysql-1`
        charm_url: String,
        /// Service name
        service_name: String,
        /// Charm options
        config: Map<String, Value>,
        /// YAML options; takes precedence over `config` when present
        config_raw: Option<String>,
        /// Initial unit count
        num_units: u32,
    },
    /// Relate two endpoints
    AddRelation {
        /// First endpoint
        endpoint_a: Endpoint,
        /// Second endpoint
        endpoint_b: Endpoint,
    },
    /// Remove the relation between two endpoints
    RemoveRelation {
        /// First endpoint
        endpoint_a: Endpoint,
        /// Second endpoint
        endpoint_b: Endpoint,
    },
    /// Change service options
    SetConfig {
        /// Service name
        service_name: String,
        /// Options to set
        config: Map<String, Value>,
        /// YAML options; takes precedence over `config` when present
        config_raw: Option<String>,
    },
    /// Full environment status
    Status,
    /// Add units to a service
    AddUnit {
        /// Service name
        service_name: String,
        /// Units to add
        num_units: u32,
    },
    /// Remove units
    RemoveUnits {
        /// Unit names, e.g. `mysql/0`
        unit_names: Vec<String>,
    },
    /// Expose a service
    Expose {
        /// Service name
        service_name: String,
    },
    /// Unexpose a service
    Unexpose {
        /// Service name
        service_name: String,
    },
    /// Destroy a service
    DestroyService {
        /// Service name
        service_name: String,
    },
    /// Charm metadata
    GetCharm {
        /// Charm URL
        charm_url: String,
    },
    /// Service details
    GetService {
        /// Service name
        service_name: String,
    },
    /// Mark a unit error as resolved
    Resolved {
        /// Unit name
        unit_name: String,
        /// Relation in error, if the hook was a relation hook
        relation_name: Option<String>,
        /// Re-run the failed hook
        retry: bool,
    },
    /// Change service constraints
    SetConstraints {
        /// Service name
        service_name: String,
        /// Constraint key/value pairs
        constraints: Map<String, Value>,
    },
    /// Merge annotations into an entity
    UpdateAnnotations {
        /// Entity name or tag
        entity: String,
        /// Key/value pairs to set
        data: Map<String, Value>,
    },
    /// Remove annotation keys from an entity
    RemoveAnnotations {
        /// Entity name or tag
        entity: String,
        /// Keys to remove
        keys: Vec<String>,
    },
    /// Read an entity's annotations
    GetAnnotations {
        /// Entity name or tag
        entity: String,
    },
    /// Relation endpoints of services
    GetEndpoints {
        /// Services to inspect; empty means all
        service_names: Vec<String>,
    },
    /// Provider type and default series
    EnvironmentInfo,
    /// Keep-alive
    Ping,
    /// Start an all-watcher
    WatchAll,
    /// Next batch of deltas from an all-watcher
    WatcherNext {
        /// Watcher id returned by `WatchAll`
        watcher_id: String,
    },
    /// Stop an all-watcher
    WatcherStop {
        /// Watcher id returned by `WatchAll`
        watcher_id: String,
    },
}

impl Operation {
    /// Stable snake_case name.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Login { .. } => "login",
            Operation::Deploy { .. } => "deploy",
            Operation::AddRelation { .. } => "add_relation",
            Operation::RemoveRelation { .. } => "remove_relation",
            Operation::SetConfig { .. } => "set_config",
            Operation::Status => "status",
            Operation::AddUnit { .. } => "add_unit",
            Operation::RemoveUnits { .. } => "remove_units",
            Operation::Expose { .. } => "expose",
            Operation::Unexpose { .. } => "unexpose",
            Operation::DestroyService { .. } => "destroy_service",
            Operation::GetCharm { .. } => "get_charm",
            Operation::GetService { .. } => "get_service",
            Operation::Resolved { .. } => "resolved",
            Operation::SetConstraints { .. } => "set_constraints",
            Operation::UpdateAnnotations { .. } => "update_annotations",
            Operation::RemoveAnnotations { .. } => "remove_annotations",
            Operation::GetAnnotations { .. } => "get_annotations",
            Operation::GetEndpoints { .. } => "get_endpoints",
            Operation::EnvironmentInfo => "environment_info",
            Operation::Ping => "ping",
            Operation::WatchAll => "watch_all",
            Operation::WatcherNext { .. } => "watcher_next",
            Operation::WatcherStop { .. } => "watcher_stop",
        }
    }

    /// Whether the operation modifies the environment.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Operation::Deploy { .. }
                | Operation::AddRelation { .. }
                | Operation::RemoveRelation { .. }
                | Operation::SetConfig { .. }
                | Operation::AddUnit { .. }
                | Operation::RemoveUnits { .. }
                | Operation::Expose { .. }
                | Operation::Unexpose { .. }
                | Operation::DestroyService { .. }
                | Operation::Resolved { .. }
                | Operation::SetConstraints { .. }
                | Operation::UpdateAnnotations { .. }
                | Operation::RemoveAnnotations { .. }
        )
    }
}

/// One side of a normalized relation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationEndpoint {
    /// Service name
    pub service: String,
    /// Relation name
    pub name: String,
    /// `provider`, `requirer`, `peer`, or the backend's equivalent
    pub role: Option<String>,
}

/// Dialect-independent relation record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    /// Relation key
    pub id: String,
    /// Interface name
    pub interface: Option<String>,
    /// `global` or `container`
    pub scope: Option<String>,
    /// Both endpoints, in request order
    pub endpoints: Vec<RelationEndpoint>,
}

/// The adapter for the configured dialect
#[derive(Debug, Clone)]
pub enum BackendAdapter {
    /// Go backend
    Go(GoAdapter),
    /// Python backend
    Python(PythonAdapter),
}

impl BackendAdapter {
    /// Adapter for `dialect`.
    pub fn for_dialect(dialect: Dialect) -> Self {
        match dialect {
            Dialect::Go => BackendAdapter::Go(GoAdapter::new()),
            Dialect::Python => BackendAdapter::Python(PythonAdapter),
        }
    }

    /// Dialect this adapter speaks.
    pub fn dialect(&self) -> Dialect {
        match self {
            BackendAdapter::Go(_) => Dialect::Go,
            BackendAdapter::Python(_) => Dialect::Python,
        }
    }

    /// Envelope codec for this dialect's correlation key.
    pub fn codec(&self) -> EnvelopeCodec {
        match self {
            BackendAdapter::Go(_) => EnvelopeCodec::new(go::REQUEST_ID_KEY),
            BackendAdapter::Python(_) => EnvelopeCodec::new(python::REQUEST_ID_KEY),
        }
    }

    /// Wire payload for `operation`.
    pub fn encode(&self, operation: &Operation) -> Result<Value, EnvError> {
        match self {
            BackendAdapter::Go(adapter) => adapter.encode(operation),
            BackendAdapter::Python(adapter) => adapter.encode(operation),
        }
    }

    /// Normalized result of `operation` from the backend's reply.
    pub fn decode(&self, operation: &Operation, payload: Value) -> Result<Value, EnvError> {
        match self {
            BackendAdapter::Go(adapter) => adapter.decode(operation, payload),
            BackendAdapter::Python(adapter) => adapter.decode(operation, payload),
        }
    }

    /// Whether the dialect has an equivalent for `operation`.
    pub fn supports(&self, operation: &Operation) -> bool {
        !matches!(self.encode(operation), Err(EnvError::Unsupported { .. }))
    }

    /// Whether environment deltas must be pulled with an all-watcher rather
    /// than arriving as pushes.
    pub fn pulls_deltas(&self) -> bool {
        matches!(self, BackendAdapter::Go(_))
    }
}

pub(crate) fn unsupported(operation: &Operation, dialect: Dialect) -> EnvError {
    EnvError::Unsupported {
        operation: operation.name(),
        dialect,
    }
}

pub(crate) fn malformed(detail: impl Into<String>) -> EnvError {
    EnvError::Protocol(ProtocolError::MalformedResponse(detail.into()))
}
