//! Python backend dialect
//!
//! Requests are flat objects named by `op` with snake_case fields. Replies
//! echo the `op`, flag failures with `err` (a message or `true` plus an
//! `error` message) and carry the body in `result`. The backend pushes
//! environment deltas on its own, so watcher and ping operations have no
//! equivalent here.

use serde_json::{Value, json};

use super::{Dialect, Operation, Relation, RelationEndpoint, malformed, unsupported};
use crate::env::error::{BackendError, BackendErrorKind, EnvError};

/// Envelope key carrying the correlation id
pub const REQUEST_ID_KEY: &str = "request_id";

/// Adapter for the python backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PythonAdapter;

impl PythonAdapter {
    /// Wire payload for `operation`.
    pub fn encode(&self, operation: &Operation) -> Result<Value, EnvError> {
        let op = operation.name();
        let payload = match operation {
            Operation::Login { user, password } => {
                json!({"op": op, "user": user, "password": password})
            }
            Operation::Deploy {
                charm_url,
                service_name,
                config,
                config_raw,
                num_units,
            } => json!({
                "op": op,
                "service_name": service_name,
                "config": config,
                "config_raw": config_raw,
                "charm_url": charm_url,
                "num_units": num_units,
            }),
            Operation::AddRelation {
                endpoint_a,
                endpoint_b,
            }
            | Operation::RemoveRelation {
                endpoint_a,
                endpoint_b,
            } => json!({
                "op": op,
                "endpoint_a": endpoint_a.name(),
                "endpoint_b": endpoint_b.name(),
            }),
            Operation::SetConfig {
                service_name,
                config,
                config_raw,
            } => json!({
                "op": op,
                "service_name": service_name,
                "config": config,
                "data": config_raw,
            }),
            Operation::Status => json!({"op": op}),
            Operation::AddUnit {
                service_name,
                num_units,
            } => json!({"op": op, "service_name": service_name, "num_units": num_units}),
            Operation::RemoveUnits { unit_names } => {
                json!({"op": op, "unit_names": unit_names})
            }
            Operation::Expose { service_name }
            | Operation::Unexpose { service_name }
            | Operation::DestroyService { service_name }
            | Operation::GetService { service_name } => {
                json!({"op": op, "service_name": service_name})
            }
            Operation::GetCharm { charm_url } => json!({"op": op, "charm_url": charm_url}),
            Operation::Resolved {
                unit_name,
                relation_name,
                retry,
            } => json!({
                "op": op,
                "unit_name": unit_name,
                "relation_name": relation_name,
                "retry": retry,
            }),
            Operation::SetConstraints {
                service_name,
                constraints,
            } => json!({"op": op, "service_name": service_name, "constraints": constraints}),
            Operation::UpdateAnnotations { entity, data } => {
                json!({"op": op, "entity": entity, "data": data})
            }
            Operation::RemoveAnnotations { entity, keys } => {
                json!({"op": op, "entity": entity, "keys": keys})
            }
            Operation::GetAnnotations { entity } => json!({"op": op, "entity": entity}),
            Operation::GetEndpoints { service_names } => {
                json!({"op": op, "service_names": service_names})
            }
            Operation::EnvironmentInfo
            | Operation::Ping
            | Operation::WatchAll
            | Operation::WatcherNext { .. }
            | Operation::WatcherStop { .. } => {
                return Err(unsupported(operation, Dialect::Python));
            }
        };
        Ok(payload)
    }

    /// Normalized result of `operation`.
    pub fn decode(&self, operation: &Operation, payload: Value) -> Result<Value, EnvError> {
        if let Some(err) = reply_error(&payload) {
            return Err(err.into());
        }

        let result = match payload {
            Value::Object(mut map) => map.remove("result").unwrap_or(Value::Null),
            _ => return Err(malformed("python reply is not an object")),
        };

        match operation {
            Operation::Login { .. } if result != Value::Bool(true) => Err(BackendError {
                kind: BackendErrorKind::Unauthorized,
                message: "invalid user or password".to_string(),
                code: None,
            }
            .into()),
            Operation::AddRelation { .. } => {
                let relation = relation_from_result(&result)?;
                serde_json::to_value(relation).map_err(|err| malformed(err.to_string()))
            }
            _ => Ok(result),
        }
    }
}

fn reply_error(payload: &Value) -> Option<BackendError> {
    let message = match payload.get("err")? {
        Value::Null | Value::Bool(false) => return None,
        Value::String(message) => message.clone(),
        _ => payload
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("request failed")
            .to_string(),
    };
    Some(BackendError::classify(message, None))
}

/// The python backend reports endpoints as `[{service: {name, role}}, ...]`.
fn relation_from_result(result: &Value) -> Result<Relation, EnvError> {
    let field = |key: &str| result.get(key).and_then(Value::as_str).map(String::from);
    let id = field("id").ok_or_else(|| malformed("add_relation result missing id"))?;
    let entries = result
        .get("endpoints")
        .and_then(Value::as_array)
        .ok_or_else(|| malformed("add_relation result missing endpoints"))?;

    let mut endpoints = Vec::with_capacity(entries.len());
    for entry in entries {
        let (service, info) = entry
            .as_object()
            .and_then(|map| map.iter().next())
            .ok_or_else(|| malformed(format!("bad relation endpoint {entry}")))?;
        endpoints.push(RelationEndpoint {
            service: service.clone(),
            name: info
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            role: info.get("role").and_then(Value::as_str).map(String::from),
        });
    }

    Ok(Relation {
        id,
        interface: field("interface"),
        scope: field("scope"),
        endpoints,
    })
}
