//! Transport-agnostic request handling for the host's HTTP surface.
//!
//! Maps `POST /plug/<plug>/syscall/<name>` and `POST /plug/<plug>/function/<name>`
//! onto the system, `/fs/<page>` onto the document store and everything else
//! onto the endpoint hook. Any HTTP server can sit in front of it.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use crate::error::Error;
use crate::hooks::{EndpointHook, EndpointRequest, EndpointResponse};
use crate::syscalls::DocumentStore;
use crate::system::System;

/// Response produced by the gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayResponse {
    /// Status code.
    pub status: u16,
    /// Response headers.
    pub headers: BTreeMap<String, String>,
    /// Response body.
    pub body: Value,
}

impl GatewayResponse {
    fn new(status: u16, body: impl Into<Value>) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }

    fn ok(body: impl Into<Value>) -> Self {
        Self::new(200, body)
    }

    fn with_header(mut self, key: &str, value: impl ToString) -> Self {
        self.headers.insert(key.to_string(), value.to_string());
        self
    }

    fn error(e: &Error) -> Self {
        Self::new(e.status_code(), e.to_string())
    }

    // Missing pages answer 200 with the real status in `X-Status`.
    fn soft_not_found(body: &str) -> Self {
        Self::ok(body).with_header("X-Status", 404)
    }

    /// Header value by name.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }
}

impl From<EndpointResponse> for GatewayResponse {
    fn from(response: EndpointResponse) -> Self {
        Self {
            status: response.status,
            headers: response.headers,
            body: response.body,
        }
    }
}

/// Plug and document routes in front of a [`System`].
pub struct PlugGateway {
    system: System,
    store: Option<Arc<dyn DocumentStore>>,
    endpoints: Option<Arc<EndpointHook>>,
}

impl PlugGateway {
    /// Create a gateway for `system`.
    pub fn new(system: System) -> Self {
        Self {
            system,
            store: None,
            endpoints: None,
        }
    }

    /// Serve `/fs` routes from `store`.
    pub fn with_store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Fall back to `endpoints` for unmatched requests.
    pub fn with_endpoints(mut self, endpoints: Arc<EndpointHook>) -> Self {
        self.endpoints = Some(endpoints);
        self
    }

    fn plug_missing(&self, plug: &str) -> Option<GatewayResponse> {
        if self.system.is_loaded(plug) {
            None
        } else {
            Some(GatewayResponse::new(404, format!("Plug {} not found", plug)))
        }
    }

    /// `POST /plug/<plug>/syscall/<name>` with a JSON argument list.
    pub async fn call_syscall(&self, plug: &str, name: &str, args: Value) -> GatewayResponse {
        if let Some(missing) = self.plug_missing(plug) {
            return missing;
        }
        match self.system.syscall(plug, name, arg_list(args)).await {
            Ok(result) => GatewayResponse::ok(result),
            Err(e) => {
                tracing::debug!(plug, syscall = name, error = %e, "gateway syscall failed");
                GatewayResponse::error(&e)
            }
        }
    }

    /// `POST /plug/<plug>/function/<name>` with a JSON argument list.
    pub async fn invoke_function(&self, plug: &str, name: &str, args: Value) -> GatewayResponse {
        if let Some(missing) = self.plug_missing(plug) {
            return missing;
        }
        match self.system.invoke(plug, name, arg_list(args)).await {
            Ok(result) => GatewayResponse::ok(result),
            Err(e) => {
                tracing::warn!(plug, function = name, error = %e, "gateway invocation failed");
                GatewayResponse::error(&e)
            }
        }
    }

    fn store(&self) -> Result<&Arc<dyn DocumentStore>, GatewayResponse> {
        self.store
            .as_ref()
            .ok_or_else(|| GatewayResponse::new(404, "no document store"))
    }

    /// `GET /fs/`: every page, with the store clock in `Now-Timestamp`.
    pub async fn list_pages(&self) -> GatewayResponse {
        let store = match self.store() {
            Ok(store) => store,
            Err(response) => return response,
        };
        match store.fetch_list().await {
            Ok(list) => match serde_json::to_value(&list.pages) {
                Ok(pages) => GatewayResponse::ok(pages).with_header("Now-Timestamp", list.now_timestamp),
                Err(e) => GatewayResponse::error(&Error::from(e)),
            },
            Err(e) => GatewayResponse::error(&e),
        }
    }

    /// `GET /fs/<name>`.
    pub async fn get_page(&self, name: &str) -> GatewayResponse {
        let store = match self.store() {
            Ok(store) => store,
            Err(response) => return response,
        };
        match store.read(name).await {
            Ok(page) => GatewayResponse::ok(page.text)
                .with_header("Last-Modified", page.meta.last_modified)
                .with_header("Content-Type", "text/markdown"),
            Err(_) => GatewayResponse::soft_not_found(""),
        }
    }

    /// `PUT /fs/<name>`, optionally guarded by the client's `Last-Modified`.
    pub async fn put_page(
        &self,
        name: &str,
        text: &str,
        last_modified: Option<u64>,
    ) -> GatewayResponse {
        let store = match self.store() {
            Ok(store) => store,
            Err(response) => return response,
        };
        match store.write(name, text, false, last_modified).await {
            Ok(meta) => GatewayResponse::ok("OK").with_header("Last-Modified", meta.last_modified),
            Err(e) => {
                tracing::error!(page = name, error = %e, "page write failed");
                GatewayResponse::new(500, "Write failed")
            }
        }
    }

    /// `OPTIONS /fs/<name>`: metadata only.
    pub async fn page_meta(&self, name: &str) -> GatewayResponse {
        let store = match self.store() {
            Ok(store) => store,
            Err(response) => return response,
        };
        match store.get_meta(name).await {
            Ok(meta) => GatewayResponse::ok("")
                .with_header("Last-Modified", meta.last_modified)
                .with_header("Content-Type", "text/markdown"),
            Err(_) => GatewayResponse::soft_not_found("Not found"),
        }
    }

    /// `DELETE /fs/<name>`.
    pub async fn delete_page(&self, name: &str) -> GatewayResponse {
        let store = match self.store() {
            Ok(store) => store,
            Err(response) => return response,
        };
        match store.delete(name).await {
            Ok(()) => GatewayResponse::ok("OK"),
            Err(e) => {
                tracing::error!(page = name, error = %e, "page delete failed");
                GatewayResponse::new(500, "Delete failed")
            }
        }
    }

    /// Route a request to the matching handler.
    pub async fn handle(&self, request: EndpointRequest) -> GatewayResponse {
        let method = request.method.to_ascii_uppercase();

        if let Some(rest) = request.path.strip_prefix("/plug/") {
            let parts: Vec<&str> = rest.splitn(3, '/').collect();
            if let (true, &[plug, kind, name]) = (method == "POST", parts.as_slice()) {
                match kind {
                    "syscall" => return self.call_syscall(plug, name, request.body).await,
                    "function" => return self.invoke_function(plug, name, request.body).await,
                    _ => {}
                }
            }
        }

        if let Some(page) = request.path.strip_prefix("/fs/") {
            return match (method.as_str(), page) {
                ("GET", "") => self.list_pages().await,
                ("GET", page) => self.get_page(page).await,
                ("PUT", page) if !page.is_empty() => {
                    let text = match request.body {
                        Value::String(ref s) => s.clone(),
                        Value::Null => String::new(),
                        ref other => other.to_string(),
                    };
                    let last_modified = request
                        .headers
                        .get("Last-Modified")
                        .and_then(|v| v.parse().ok());
                    self.put_page(page, &text, last_modified).await
                }
                ("OPTIONS", page) if !page.is_empty() => self.page_meta(page).await,
                ("DELETE", page) if !page.is_empty() => self.delete_page(page).await,
                _ => GatewayResponse::new(405, "method not allowed"),
            };
        }

        if let Some(ref endpoints) = self.endpoints {
            if let Some(response) = endpoints.handle(request).await {
                return response.into();
            }
        }
        GatewayResponse::new(404, "not found")
    }
}

fn arg_list(args: Value) -> Vec<Value> {
    match args {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        other => vec![other],
    }
}

impl std::fmt::Debug for PlugGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlugGateway")
            .field("system", &self.system)
            .field("has_store", &self.store.is_some())
            .field("has_endpoints", &self.endpoints.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syscalls::MemoryStore;
    use serde_json::json;

    fn gateway() -> PlugGateway {
        PlugGateway::new(System::default()).with_store(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn test_arg_list() {
        assert_eq!(arg_list(json!([1, 2])), vec![json!(1), json!(2)]);
        assert!(arg_list(Value::Null).is_empty());
        assert_eq!(arg_list(json!({"a": 1})), vec![json!({"a": 1})]);
    }

    #[tokio::test]
    async fn test_unknown_plug_is_404() {
        let gateway = gateway();
        let response = gateway.call_syscall("ghost", "space.listPages", json!([])).await;
        assert_eq!(response.status, 404);
        assert_eq!(response.body, json!("Plug ghost not found"));

        let response = gateway.invoke_function("ghost", "main", json!([])).await;
        assert_eq!(response.status, 404);
    }

    #[tokio::test]
    async fn test_page_routes() {
        let gateway = gateway();

        let missing = gateway.get_page("nope").await;
        assert_eq!(missing.status, 200);
        assert_eq!(missing.header("X-Status"), Some("404"));
        assert_eq!(gateway.page_meta("nope").await.header("X-Status"), Some("404"));

        let put = gateway.put_page("index", "# Hi", None).await;
        assert_eq!(put.status, 200);
        let stamp: u64 = put.header("Last-Modified").unwrap().parse().unwrap();

        let page = gateway.get_page("index").await;
        assert_eq!(page.body, json!("# Hi"));
        assert_eq!(page.header("Content-Type"), Some("text/markdown"));

        let stale = gateway.put_page("index", "x", Some(stamp - 1)).await;
        assert_eq!(stale.status, 500);
        assert_eq!(stale.body, json!("Write failed"));

        let list = gateway.list_pages().await;
        assert_eq!(list.body.as_array().unwrap().len(), 1);
        assert!(list.header("Now-Timestamp").is_some());

        assert_eq!(gateway.delete_page("index").await.status, 200);
        assert_eq!(gateway.delete_page("index").await.status, 500);
    }

    #[tokio::test]
    async fn test_handle_routes() {
        let gateway = gateway();

        let put = gateway
            .handle(EndpointRequest::new("PUT", "/fs/notes").with_body(json!("text")))
            .await;
        assert_eq!(put.status, 200);

        let get = gateway.handle(EndpointRequest::new("get", "/fs/notes")).await;
        assert_eq!(get.body, json!("text"));

        let list = gateway.handle(EndpointRequest::new("GET", "/fs/")).await;
        assert_eq!(list.body[0]["name"], json!("notes"));

        let plug = gateway
            .handle(EndpointRequest::new("POST", "/plug/ghost/function/main"))
            .await;
        assert_eq!(plug.status, 404);

        let other = gateway.handle(EndpointRequest::new("GET", "/elsewhere")).await;
        assert_eq!(other.status, 404);
    }

    #[tokio::test]
    async fn test_no_store() {
        let gateway = PlugGateway::new(System::default());
        assert_eq!(gateway.list_pages().await.status, 404);
    }
}
