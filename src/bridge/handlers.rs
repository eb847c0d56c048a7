use std::collections::BTreeMap;
use std::sync::Arc;

use bevy::prelude::*;
use serde::Deserialize;
use serde_json::{json, Value};

use super::Bridge;
use crate::buffers::{LogRecord, Severity};
use crate::error::HandlerError;

pub type HandlerResult = Result<Value, HandlerError>;
pub type AuthorizedFn = dyn Fn(&mut World, Value) -> HandlerResult + Send + Sync;
pub type InlineFn = dyn Fn(&Bridge, Value) -> HandlerResult + Send + Sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Route {
    Tool,
    Resource,
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Tool => "tool",
            Self::Resource => "resource",
        })
    }
}

#[derive(Clone)]
pub enum Handler {
    /// Must run on the authorized context; goes through the work queue.
    Authorized(Arc<AuthorizedFn>),
    /// Only touches thread-safe state; runs on the request worker.
    Inline(Arc<InlineFn>),
}

/// Name -> handler table, filled at startup and read-only afterwards.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    entries: BTreeMap<(Route, String), Handler>,
}

impl HandlerRegistry {
    pub fn tool_on_world(
        mut self,
        name: &str,
        f: impl Fn(&mut World, Value) -> HandlerResult + Send + Sync + 'static,
    ) -> Self {
        self.entries
            .insert((Route::Tool, name.to_string()), Handler::Authorized(Arc::new(f)));
        self
    }

    pub fn tool_inline(
        mut self,
        name: &str,
        f: impl Fn(&Bridge, Value) -> HandlerResult + Send + Sync + 'static,
    ) -> Self {
        self.entries
            .insert((Route::Tool, name.to_string()), Handler::Inline(Arc::new(f)));
        self
    }

    pub fn resource_on_world(
        mut self,
        name: &str,
        f: impl Fn(&mut World, Value) -> HandlerResult + Send + Sync + 'static,
    ) -> Self {
        self.entries.insert(
            (Route::Resource, name.to_string()),
            Handler::Authorized(Arc::new(f)),
        );
        self
    }

    pub fn resource_inline(
        mut self,
        name: &str,
        f: impl Fn(&Bridge, Value) -> HandlerResult + Send + Sync + 'static,
    ) -> Self {
        self.entries
            .insert((Route::Resource, name.to_string()), Handler::Inline(Arc::new(f)));
        self
    }

    pub fn get(&self, route: Route, name: &str) -> Option<Handler> {
        self.entries.get(&(route, name.to_string())).cloned()
    }

    pub fn names(&self, route: Route) -> Vec<String> {
        self.entries
            .keys()
            .filter(|(r, _)| *r == route)
            .map(|(_, name)| name.clone())
            .collect()
    }

    /// Tools and resources every bridge ships with.
    pub fn builtin() -> Self {
        Self::default()
            .tool_on_world("echo", |_world, params| Ok(params))
            .tool_inline("log", log_message)
            .tool_inline("clear_logs", |bridge, _params| {
                Ok(json!({ "cleared": bridge.buffers().clear_logs() }))
            })
            .tool_on_world("rename_entity", rename_entity)
            .resource_inline("status", |bridge, _params| {
                serde_json::to_value(bridge.status()).map_err(internal)
            })
            .resource_inline("logs", |bridge, params| {
                let limit = optional_usize(&params, "limit")?;
                serde_json::to_value(bridge.buffers().logs(limit)).map_err(internal)
            })
            .resource_inline("compilation", |bridge, _params| {
                let mut value =
                    serde_json::to_value(bridge.buffers().compilations()).map_err(internal)?;
                value["compiling"] = json!(bridge.is_compiling());
                Ok(value)
            })
            .resource_inline("handlers", |bridge, _params| {
                Ok(json!({
                    "tools": bridge.handlers().names(Route::Tool),
                    "resources": bridge.handlers().names(Route::Resource),
                }))
            })
            .resource_on_world("scene", describe_scene)
    }
}

/// Parses a params object into a typed request.
pub fn parse_params<T: for<'de> Deserialize<'de>>(params: Value) -> Result<T, HandlerError> {
    serde_json::from_value(params).map_err(|e| HandlerError::invalid_params(e.to_string()))
}

fn internal(err: serde_json::Error) -> HandlerError {
    HandlerError::new("internal", err.to_string())
}

/// Resource params arrive as query strings, tool params as JSON numbers.
fn optional_usize(params: &Value, key: &str) -> Result<Option<usize>, HandlerError> {
    let not_a_count =
        || HandlerError::invalid_params(format!("'{key}' must be a positive integer"));
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(|n| Some(n as usize))
            .ok_or_else(not_a_count),
        Some(Value::String(s)) => s
            .trim()
            .parse::<usize>()
            .map(Some)
            .map_err(|_| not_a_count()),
        Some(_) => Err(not_a_count()),
    }
}

#[derive(Deserialize)]
struct LogRequest {
    message: String,
    #[serde(default)]
    detail: String,
    #[serde(default = "default_severity")]
    severity: Severity,
}

fn default_severity() -> Severity {
    Severity::Info
}

fn log_message(bridge: &Bridge, params: Value) -> HandlerResult {
    let req: LogRequest = parse_params(params)?;
    let record = LogRecord::new(req.severity, req.message, req.detail);
    bridge.signals().notify_log(&record);
    Ok(json!({ "logged": true, "timestamp": record.timestamp }))
}

#[derive(Deserialize)]
struct RenameRequest {
    entity: u64,
    name: String,
}

fn rename_entity(world: &mut World, params: Value) -> HandlerResult {
    let req: RenameRequest = parse_params(params)?;
    let entity = Entity::try_from_bits(req.entity)
        .map_err(|_| HandlerError::invalid_params(format!("{} is not an entity id", req.entity)))?;
    if !world.entities().contains(entity) {
        return Err(HandlerError::not_found(format!("entity {} does not exist", req.entity)));
    }
    let previous = match world.get_mut::<Name>(entity) {
        Some(mut name) => {
            let previous = name.as_str().to_string();
            name.set(req.name.clone());
            Some(previous)
        }
        None => {
            world.entity_mut(entity).insert(Name::new(req.name.clone()));
            None
        }
    };
    Ok(json!({ "entity": req.entity, "name": req.name, "previous": previous }))
}

fn describe_scene(world: &mut World, _params: Value) -> HandlerResult {
    let mut query = world.query::<(Entity, &Name)>();
    let mut entities: Vec<_> = query
        .iter(world)
        .map(|(entity, name)| (entity.to_bits(), name.as_str().to_string()))
        .collect();
    entities.sort();
    let entities: Vec<_> = entities
        .into_iter()
        .map(|(id, name)| json!({ "id": id, "name": name }))
        .collect();
    Ok(json!({ "count": entities.len(), "entities": entities }))
}
