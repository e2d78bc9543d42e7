//! HTTP-style routes bound to plug functions.

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;
use serde_json::{json, Map, Value};

use crate::error::{Error, Result};
use crate::lifecycle::LifecycleState;
use crate::manifest::Manifest;
use crate::plug::PlugHandle;

use super::Hook;

/// Inbound request, independent of any HTTP stack.
#[derive(Debug, Clone, Default)]
pub struct EndpointRequest {
    /// Request method, matched case-insensitively.
    pub method: String,
    /// Full request path including the hook prefix.
    pub path: String,
    /// Query parameters.
    pub query: BTreeMap<String, String>,
    /// Request headers.
    pub headers: BTreeMap<String, String>,
    /// Request body.
    pub body: Value,
}

impl EndpointRequest {
    /// Create a request with an empty body.
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            body: Value::Null,
            ..Default::default()
        }
    }

    /// Set the body.
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = body;
        self
    }

    /// Add a query parameter.
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }

    /// Add a header.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// Outbound response.
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointResponse {
    /// Status code.
    pub status: u16,
    /// Response headers.
    pub headers: BTreeMap<String, String>,
    /// Response body.
    pub body: Value,
}

impl EndpointResponse {
    fn new(status: u16, body: Value) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body,
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(404, Value::String(message.into()))
    }

    /// Interpret a function's return value.
    ///
    /// An object carrying a numeric `status` is a full response; anything
    /// else becomes the body of a 200.
    fn from_value(value: Value) -> Self {
        match value {
            Value::Object(mut map) if map.get("status").map_or(false, Value::is_u64) => {
                let status = map
                    .remove("status")
                    .and_then(|s| s.as_u64())
                    .and_then(|s| u16::try_from(s).ok())
                    .unwrap_or(200);
                let headers = match map.remove("headers") {
                    Some(Value::Object(headers)) => headers
                        .into_iter()
                        .map(|(k, v)| match v {
                            Value::String(s) => (k, s),
                            other => (k, other.to_string()),
                        })
                        .collect(),
                    _ => BTreeMap::new(),
                };
                let body = map.remove("body").unwrap_or(Value::Null);
                Self {
                    status,
                    headers,
                    body,
                }
            }
            other => Self::new(200, other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Route {
    method: String,
    path: String,
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.method, self.path)
    }
}

struct Binding {
    plug: PlugHandle,
    function: String,
}

/// Exclusive routes beneath a fixed prefix. The first plug to claim a route
/// owns it until it unloads.
pub struct EndpointHook {
    prefix: String,
    routes: RwLock<HashMap<Route, Binding>>,
}

impl EndpointHook {
    /// Create a hook serving routes beneath `prefix`.
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let prefix = prefix.trim_end_matches('/');
        let prefix = if prefix.starts_with('/') || prefix.is_empty() {
            prefix.to_string()
        } else {
            format!("/{}", prefix)
        };
        Self {
            prefix,
            routes: RwLock::new(HashMap::new()),
        }
    }

    /// Path prefix, without trailing slash.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Full path a route is reachable under.
    pub fn full_path(&self, route_path: &str) -> String {
        format!("{}{}", self.prefix, route_path)
    }

    /// Plug owning `method path`, if any.
    pub fn owner(&self, method: &str, path: &str) -> Option<String> {
        let route = Route {
            method: method.to_ascii_uppercase(),
            path: path.to_string(),
        };
        self.routes
            .read()
            .get(&route)
            .map(|b| b.plug.name().to_string())
    }

    /// Every bound route as `METHOD path`, sorted.
    pub fn routes(&self) -> Vec<String> {
        let mut routes: Vec<String> = self.routes.read().keys().map(Route::to_string).collect();
        routes.sort();
        routes
    }

    /// Serve `request`.
    ///
    /// Returns `None` when the request is outside the prefix or no route
    /// matches, so other routing can take it.
    pub async fn handle(&self, request: EndpointRequest) -> Option<EndpointResponse> {
        let route_path = request.path.strip_prefix(self.prefix.as_str())?;
        if !route_path.starts_with('/') {
            return None;
        }
        let route = Route {
            method: request.method.to_ascii_uppercase(),
            path: route_path.to_string(),
        };

        let (plug, function) = {
            let routes = self.routes.read();
            let binding = routes.get(&route)?;
            (binding.plug.clone(), binding.function.clone())
        };

        tracing::debug!(route = %route, plug = %plug.name(), function = %function, "endpoint request");

        let args = vec![request_value(&request, &route.path)];
        let response = match plug.invoke(&function, args).await {
            Ok(value) => EndpointResponse::from_value(value),
            Err(Error::SandboxStopped) if plug.state() == LifecycleState::Failed => {
                EndpointResponse::new(503, Value::String(format!("plug {} has failed", plug.name())))
            }
            Err(Error::SandboxStopped) | Err(Error::PlugNotFound(_)) => {
                EndpointResponse::not_found(format!("plug {} is not loaded", plug.name()))
            }
            Err(e) => {
                tracing::warn!(route = %route, plug = %plug.name(), error = %e, "endpoint handler failed");
                EndpointResponse::new(500, Value::String(e.to_string()))
            }
        };
        Some(response)
    }

    fn manifest_routes(manifest: &Manifest) -> Vec<(Route, String)> {
        manifest
            .endpoint_bindings()
            .map(|(endpoint, function)| {
                (
                    Route {
                        method: endpoint.method.to_ascii_uppercase(),
                        path: endpoint.path.clone(),
                    },
                    function.to_string(),
                )
            })
            .collect()
    }
}

fn request_value(request: &EndpointRequest, route_path: &str) -> Value {
    let strings = |m: &BTreeMap<String, String>| -> Value {
        Value::Object(
            m.iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect::<Map<String, Value>>(),
        )
    };
    json!({
        "method": request.method.to_ascii_uppercase(),
        "path": route_path,
        "query": strings(&request.query),
        "headers": strings(&request.headers),
        "body": request.body,
    })
}

impl Hook for EndpointHook {
    fn name(&self) -> &'static str {
        "endpoint"
    }

    fn validate_manifest(&self, manifest: &Manifest) -> Vec<String> {
        manifest
            .endpoint_bindings()
            .filter(|(endpoint, _)| !endpoint.path.starts_with('/'))
            .map(|(endpoint, function)| {
                format!(
                    "function {}: http path '{}' must start with '/'",
                    function, endpoint.path
                )
            })
            .collect()
    }

    fn check(&self, manifest: &Manifest) -> Result<()> {
        let routes = self.routes.read();
        let mut claimed = Vec::new();
        for (route, _) in Self::manifest_routes(manifest) {
            if claimed.contains(&route) {
                return Err(Error::HookConflict {
                    route: route.to_string(),
                    owner: manifest.name.clone(),
                });
            }
            if let Some(binding) = routes.get(&route) {
                if binding.plug.name() != manifest.name {
                    tracing::warn!(
                        route = %route,
                        owner = %binding.plug.name(),
                        plug = %manifest.name,
                        "endpoint already owned"
                    );
                    return Err(Error::HookConflict {
                        route: route.to_string(),
                        owner: binding.plug.name().to_string(),
                    });
                }
            }
            claimed.push(route);
        }
        Ok(())
    }

    fn install(&self, plug: &PlugHandle) {
        let mut routes = self.routes.write();
        for (route, function) in Self::manifest_routes(plug.manifest()) {
            routes.insert(
                route,
                Binding {
                    plug: plug.clone(),
                    function,
                },
            );
        }
    }

    fn uninstall(&self, plug: &str) {
        self.routes.write().retain(|_, b| b.plug.name() != plug);
    }

    fn registrations(&self, plug: &str) -> usize {
        self.routes
            .read()
            .values()
            .filter(|b| b.plug.name() == plug)
            .count()
    }
}

impl Default for EndpointHook {
    fn default() -> Self {
        Self::new("/_")
    }
}

impl std::fmt::Debug for EndpointHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointHook")
            .field("prefix", &self.prefix)
            .field("route_count", &self.routes.read().len())
            .finish()
    }
}
