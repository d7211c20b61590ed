//! Go backend dialect
//!
//! Requests name a facade (`Type`) and a method (`Request`) and carry their
//! arguments under `Params` with CapitalCase keys. Replies carry `Error` and
//! optionally `ErrorCode` on failure, `Response` on success. Every request
//! is stamped with the facade `Version` the server announced at login.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{Map, Value, json};

use super::{Dialect, Endpoint, Operation, Relation, RelationEndpoint, malformed, unsupported};
use crate::env::error::{BackendError, EnvError};

/// Envelope key carrying the correlation id
pub const REQUEST_ID_KEY: &str = "RequestId";

/// Ordering of delta entity kinds; parents before children.
const DELTA_HIERARCHY: &[(&str, i32)] = &[
    ("applicationInfo", 1),
    ("serviceInfo", 1),
    ("relationInfo", 2),
    ("unitInfo", 3),
    ("machineInfo", 4),
    ("annotationInfo", 5),
    ("remoteapplicationInfo", 100),
    ("remoteserviceInfo", 100),
];

/// Admin facade version taking `AuthTag`/`Password` login parameters.
/// Facade versions are only known after login, so Admin is never looked up.
const ADMIN_FACADE_VERSION: u32 = 0;

/// Facades assumed present even when login announces none
const DEFAULT_FACADES: &[(&str, &[u32])] = &[
    ("AllWatcher", &[0]),
    ("Client", &[0]),
    ("Pinger", &[0]),
];

/// Facade versions served by the backend
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FacadeVersions {
    announced: HashMap<String, Vec<u32>>,
}

impl FacadeVersions {
    /// Parse the `Facades` list of a login response (`facades` on newer servers).
    pub fn from_login_response(response: &Value) -> Self {
        let list = response
            .get("Facades")
            .or_else(|| response.get("facades"))
            .and_then(Value::as_array);
        let announced = list
            .into_iter()
            .flatten()
            .filter_map(|facade| {
                let name = facade.get("Name").and_then(Value::as_str)?;
                let versions = facade
                    .get("Versions")
                    .and_then(Value::as_array)?
                    .iter()
                    .filter_map(Value::as_u64)
                    .filter_map(|version| u32::try_from(version).ok())
                    .collect();
                Some((name.to_string(), versions))
            })
            .collect();
        Self { announced }
    }

    /// Version to use for facade `name`.
    ///
    /// With `version` set, that version if the server serves it; otherwise
    /// the newest served version. `None` means the facade is unavailable.
    pub fn find(&self, name: &str, version: Option<u32>) -> Option<u32> {
        let versions: &[u32] = match self.announced.get(name) {
            Some(versions) => versions,
            None => DEFAULT_FACADES
                .iter()
                .find(|(facade, _)| *facade == name)
                .map(|(_, versions)| *versions)
                .unwrap_or(&[]),
        };
        match version {
            None => versions.last().copied(),
            Some(version) => versions.contains(&version).then_some(version),
        }
    }
}

/// Adapter for the go backend
///
/// Clones share the facade table, which a successful login reply replaces.
#[derive(Debug, Clone, Default)]
pub struct GoAdapter {
    facades: Arc<RwLock<FacadeVersions>>,
}

impl GoAdapter {
    /// Adapter assuming only the default facades.
    pub fn new() -> Self {
        Self::default()
    }

    /// Facade versions currently in use.
    pub fn facades(&self) -> FacadeVersions {
        self.facades.read().clone()
    }

    /// Replace the facade table.
    pub fn set_facades(&self, facades: FacadeVersions) {
        *self.facades.write() = facades;
    }

    /// Wire payload for `operation`.
    ///
    /// Fails with [`EnvError::Unsupported`] when the server does not serve
    /// the facade, without anything reaching the wire.
    pub fn encode(&self, operation: &Operation) -> Result<Value, EnvError> {
        let facades = self.facades.read();
        let (facade, request, params) = match operation {
            Operation::Login { user, password } => (
                "Admin",
                "Login",
                json!({"AuthTag": user, "Password": password}),
            ),
            Operation::Deploy {
                charm_url,
                service_name,
                config,
                config_raw,
                num_units,
            } => (
                "Client",
                "ServiceDeploy",
                json!({
                    "ServiceName": service_name,
                    "CharmUrl": charm_url,
                    "NumUnits": num_units,
                    "Config": stringify_values(config),
                    "ConfigYAML": config_raw,
                    "Constraints": {},
                }),
            ),
            Operation::AddRelation {
                endpoint_a,
                endpoint_b,
            } => (
                "Client",
                "AddRelation",
                json!({"Endpoints": [endpoint_a.name(), endpoint_b.name()]}),
            ),
            Operation::RemoveRelation {
                endpoint_a,
                endpoint_b,
            } => (
                "Client",
                "DestroyRelation",
                json!({"Endpoints": [endpoint_a.name(), endpoint_b.name()]}),
            ),
            Operation::SetConfig {
                service_name,
                config_raw: Some(raw),
                ..
            } => (
                "Client",
                "ServiceSetYAML",
                json!({"ServiceName": service_name, "Config": raw}),
            ),
            Operation::SetConfig {
                service_name,
                config,
                config_raw: None,
            } => (
                "Client",
                "ServiceSet",
                json!({"ServiceName": service_name, "Options": stringify_values(config)}),
            ),
            Operation::Status => ("Client", "FullStatus", json!({})),
            Operation::AddUnit {
                service_name,
                num_units,
            } => (
                "Client",
                "AddServiceUnits",
                json!({"ServiceName": service_name, "NumUnits": num_units}),
            ),
            Operation::RemoveUnits { unit_names } => (
                "Client",
                "DestroyServiceUnits",
                json!({"UnitNames": unit_names}),
            ),
            Operation::Expose { service_name } => (
                "Client",
                "ServiceExpose",
                json!({"ServiceName": service_name}),
            ),
            Operation::Unexpose { service_name } => (
                "Client",
                "ServiceUnexpose",
                json!({"ServiceName": service_name}),
            ),
            Operation::DestroyService { service_name } => (
                "Client",
                "ServiceDestroy",
                json!({"ServiceName": service_name}),
            ),
            Operation::GetCharm { charm_url } => {
                ("Client", "CharmInfo", json!({"CharmURL": charm_url}))
            }
            Operation::GetService { service_name } => (
                "Client",
                "ServiceGet",
                json!({"ServiceName": service_name}),
            ),
            Operation::Resolved {
                unit_name, retry, ..
            } => (
                "Client",
                "Resolved",
                json!({"UnitName": unit_name, "Retry": retry}),
            ),
            Operation::SetConstraints {
                service_name,
                constraints,
            } => (
                "Client",
                "SetServiceConstraints",
                json!({"ServiceName": service_name, "Constraints": constraints}),
            ),
            Operation::UpdateAnnotations { entity, data } => (
                "Client",
                "SetAnnotations",
                json!({"Tag": entity, "Pairs": stringify_values(data)}),
            ),
            Operation::RemoveAnnotations { entity, keys } => {
                let pairs: Map<String, Value> = keys
                    .iter()
                    .map(|key| (key.clone(), Value::String(String::new())))
                    .collect();
                (
                    "Client",
                    "SetAnnotations",
                    json!({"Tag": entity, "Pairs": pairs}),
                )
            }
            Operation::GetAnnotations { entity } => {
                ("Client", "GetAnnotations", json!({"Tag": entity}))
            }
            Operation::EnvironmentInfo => {
                // Client version 0 predates the rename to models.
                let request = match facades.find("Client", None) {
                    Some(0) => "EnvironmentInfo",
                    _ => "ModelInfo",
                };
                ("Client", request, json!({}))
            }
            Operation::GetEndpoints { .. } => return Err(unsupported(operation, Dialect::Go)),
            Operation::Ping => ("Pinger", "Ping", json!({})),
            Operation::WatchAll => ("Client", "WatchAll", json!({})),
            Operation::WatcherNext { .. } => ("AllWatcher", "Next", json!({})),
            Operation::WatcherStop { .. } => ("AllWatcher", "Stop", json!({})),
        };

        let version = if facade == "Admin" {
            ADMIN_FACADE_VERSION
        } else {
            facades
                .find(facade, None)
                .ok_or_else(|| unsupported(operation, Dialect::Go))?
        };

        let mut payload = json!({
            "Type": facade,
            "Request": request,
            "Version": version,
            "Params": params,
        });
        if let Operation::WatcherNext { watcher_id } | Operation::WatcherStop { watcher_id } =
            operation
        {
            payload["Id"] = Value::String(watcher_id.clone());
        }
        Ok(payload)
    }

    /// Normalized result of `operation`.
    ///
    /// A successful login reply also replaces the facade table.
    pub fn decode(&self, operation: &Operation, payload: Value) -> Result<Value, EnvError> {
        if let Some(message) = payload.get("Error").and_then(Value::as_str) {
            if !message.is_empty() {
                let code = payload
                    .get("ErrorCode")
                    .and_then(Value::as_str)
                    .filter(|code| !code.is_empty())
                    .map(String::from);
                return Err(BackendError::classify(message, code).into());
            }
        }

        let response = match payload {
            Value::Object(mut map) => map.remove("Response").unwrap_or(Value::Object(Map::new())),
            _ => return Err(malformed("go reply is not an object")),
        };

        match operation {
            Operation::AddRelation {
                endpoint_a,
                endpoint_b,
            } => {
                let relation = relation_from_response(&response, endpoint_a, endpoint_b)?;
                serde_json::to_value(relation).map_err(|err| malformed(err.to_string()))
            }
            Operation::Login { .. } => {
                self.set_facades(FacadeVersions::from_login_response(&response));
                Ok(response)
            }
            Operation::EnvironmentInfo => {
                let field = |key: &str| response.get(key).cloned().unwrap_or(Value::Null);
                Ok(json!({
                    "provider_type": field("ProviderType"),
                    "default_series": field("DefaultSeries"),
                }))
            }
            Operation::WatcherNext { .. } => Ok(Value::Array(sort_deltas(&response)?)),
            _ => Ok(response),
        }
    }
}

/// The go backend only accepts string option values; nulls unset an option.
pub fn stringify_values(config: &Map<String, Value>) -> Map<String, Value> {
    config
        .iter()
        .map(|(key, value)| {
            let value = match value {
                Value::Null => Value::Null,
                Value::String(s) => Value::String(s.clone()),
                other => Value::String(other.to_string()),
            };
            (key.clone(), value)
        })
        .collect()
}

/// Relation key built from endpoint roles: `"<requirer> <provider>"`.
pub fn relation_key(endpoints: &[RelationEndpoint]) -> String {
    let by_role = |role: &str| {
        endpoints
            .iter()
            .find(|endpoint| endpoint.role.as_deref() == Some(role))
            .map(|endpoint| format!("{}:{}", endpoint.service, endpoint.name))
    };
    match (by_role("requirer"), by_role("provider")) {
        (Some(requirer), Some(provider)) => format!("{requirer} {provider}"),
        // Peer relations have a single endpoint and no requirer/provider pair.
        _ => endpoints
            .iter()
            .map(|endpoint| format!("{}:{}", endpoint.service, endpoint.name))
            .collect::<Vec<_>>()
            .join(" "),
    }
}

fn relation_from_response(
    response: &Value,
    endpoint_a: &Endpoint,
    endpoint_b: &Endpoint,
) -> Result<Relation, EnvError> {
    let endpoints_map = response
        .get("Endpoints")
        .and_then(Value::as_object)
        .ok_or_else(|| malformed("AddRelation response missing Endpoints"))?;

    let mut endpoints = Vec::with_capacity(2);
    let mut interface = None;
    let mut scope = None;
    for service in [&endpoint_a.service, &endpoint_b.service] {
        if endpoints
            .iter()
            .any(|existing: &RelationEndpoint| &existing.service == service)
        {
            continue;
        }
        let info = endpoints_map
            .get(service)
            .ok_or_else(|| malformed(format!("AddRelation response missing endpoint {service}")))?;
        let field = |key: &str| info.get(key).and_then(Value::as_str).map(String::from);
        if interface.is_none() {
            interface = field("Interface");
            scope = field("Scope");
        }
        endpoints.push(RelationEndpoint {
            service: service.clone(),
            name: field("Name").unwrap_or_default(),
            role: field("Role"),
        });
    }

    Ok(Relation {
        id: relation_key(&endpoints),
        interface,
        scope,
        endpoints,
    })
}

/// Turn an all-watcher `Next` response into `[kind+"Info", op, entity]`
/// triples, ordered so parents are added before children and removed after
/// them. Unknown kinds go last.
pub fn sort_deltas(response: &Value) -> Result<Vec<Value>, EnvError> {
    let deltas = response
        .get("Deltas")
        .and_then(Value::as_array)
        .ok_or_else(|| malformed("watcher response missing Deltas"))?;

    let mut triples = Vec::with_capacity(deltas.len());
    for delta in deltas {
        let parts = delta
            .as_array()
            .filter(|parts| parts.len() == 3)
            .ok_or_else(|| malformed(format!("bad delta {delta}")))?;
        let kind = parts[0]
            .as_str()
            .ok_or_else(|| malformed(format!("bad delta kind {}", parts[0])))?;
        triples.push(json!([format!("{kind}Info"), parts[1], parts[2]]));
    }

    triples.sort_by_key(|triple| {
        let kind = triple[0].as_str().unwrap_or_default();
        match DELTA_HIERARCHY.iter().find(|(name, _)| *name == kind) {
            Some((_, score)) if triple[1] == "remove" => (0, -score),
            Some((_, score)) => (0, *score),
            None => (1, 0),
        }
    });
    Ok(triples)
}
