//! Plug manifest schema and validation.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

fn default_version() -> String {
    "0.0.0".to_string()
}

fn default_method() -> String {
    "GET".to_string()
}

/// HTTP binding of an exported function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDef {
    /// HTTP method, matched case-insensitively.
    #[serde(default = "default_method")]
    pub method: String,
    /// Route below the endpoint prefix, starting with `/`.
    pub path: String,
}

impl EndpointDef {
    /// Create a new endpoint binding.
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into().to_ascii_uppercase(),
            path: path.into(),
        }
    }
}

/// Declaration of one exported plug function and what triggers it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionDef {
    /// Events this function handles.
    #[serde(default)]
    pub events: Vec<String>,
    /// Schedule expressions that fire this function.
    #[serde(default)]
    pub cron: Vec<String>,
    /// HTTP route bound to this function.
    #[serde(default)]
    pub http: Option<EndpointDef>,
}

/// Plug manifest: identity, required namespaces and trigger bindings.
///
/// A manifest is immutable once its plug is loaded; a changed manifest means
/// the plug is unloaded and loaded again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Plug name (unique within a system).
    pub name: String,

    /// Plug version.
    #[serde(default = "default_version")]
    pub version: String,

    /// Human-readable description.
    #[serde(default)]
    pub description: Option<String>,

    /// Code module backing this plug; defaults to the plug name.
    #[serde(default)]
    pub module: Option<String>,

    /// Syscall namespaces the plug needs.
    #[serde(default)]
    pub requires: Vec<String>,

    /// Exported functions keyed by name.
    #[serde(default)]
    pub functions: BTreeMap<String, FunctionDef>,

    /// Custom metadata.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Manifest {
    /// Create a new manifest with required fields.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: default_version(),
            description: None,
            module: None,
            requires: Vec::new(),
            functions: BTreeMap::new(),
            metadata: HashMap::new(),
        }
    }

    /// Parse manifest from TOML string.
    #[cfg(feature = "toml")]
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::ManifestParse(e.to_string()))
    }

    /// Serialize to TOML string.
    #[cfg(feature = "toml")]
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::ManifestParse(e.to_string()))
    }

    /// Parse manifest from JSON string.
    pub fn from_json(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Validate the manifest.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::missing_field("name"));
        }
        if self.name.contains(['/', ' ', '\t', '\n']) {
            return Err(Error::invalid_manifest(format!(
                "plug name may not contain '/' or whitespace: {:?}",
                self.name
            )));
        }

        for ns in &self.requires {
            if ns.is_empty() || ns.contains('.') {
                return Err(Error::invalid_manifest(format!(
                    "invalid namespace: {:?}",
                    ns
                )));
            }
        }

        for (function, def) in &self.functions {
            if function.is_empty() {
                return Err(Error::invalid_manifest("empty function name"));
            }
            if def.events.iter().any(String::is_empty) {
                return Err(Error::invalid_manifest(format!(
                    "function {} declares an empty event name",
                    function
                )));
            }
            if let Some(ref http) = def.http {
                if !http.path.starts_with('/') {
                    return Err(Error::invalid_manifest(format!(
                        "function {}: http path must start with '/': {}",
                        function, http.path
                    )));
                }
                if http.method.is_empty() {
                    return Err(Error::invalid_manifest(format!(
                        "function {}: empty http method",
                        function
                    )));
                }
            }
        }

        Ok(())
    }

    /// Check if this manifest requires a namespace.
    pub fn requires_namespace(&self, ns: &str) -> bool {
        self.requires.iter().any(|n| n == ns)
    }

    /// Name of the code module backing this plug.
    pub fn module_name(&self) -> &str {
        self.module.as_deref().unwrap_or(&self.name)
    }

    /// Check if the plug exports a function.
    pub fn exports(&self, function: &str) -> bool {
        self.functions.contains_key(function)
    }

    /// `(event, function)` pairs in declaration order.
    pub fn event_bindings(&self) -> impl Iterator<Item = (&str, &str)> {
        self.functions.iter().flat_map(|(f, def)| {
            def.events.iter().map(move |e| (e.as_str(), f.as_str()))
        })
    }

    /// `(schedule expression, function)` pairs.
    pub fn cron_bindings(&self) -> impl Iterator<Item = (&str, &str)> {
        self.functions.iter().flat_map(|(f, def)| {
            def.cron.iter().map(move |c| (c.as_str(), f.as_str()))
        })
    }

    /// `(endpoint, function)` pairs.
    pub fn endpoint_bindings(&self) -> impl Iterator<Item = (&EndpointDef, &str)> {
        self.functions
            .iter()
            .filter_map(|(f, def)| def.http.as_ref().map(|h| (h, f.as_str())))
    }
}

/// Builder for creating manifests.
pub struct ManifestBuilder {
    manifest: Manifest,
}

impl ManifestBuilder {
    /// Create a new manifest builder.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            manifest: Manifest::new(name),
        }
    }

    /// Set the version.
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.manifest.version = version.into();
        self
    }

    /// Set the description.
    pub fn description(mut self, desc: impl Into<String>) -> Self {
        self.manifest.description = Some(desc.into());
        self
    }

    /// Set the backing module.
    pub fn module(mut self, module: impl Into<String>) -> Self {
        self.manifest.module = Some(module.into());
        self
    }

    /// Require a syscall namespace.
    pub fn requires(mut self, ns: impl Into<String>) -> Self {
        self.manifest.requires.push(ns.into());
        self
    }

    /// Export a function without any trigger.
    pub fn function(mut self, name: impl Into<String>) -> Self {
        self.manifest.functions.entry(name.into()).or_default();
        self
    }

    /// Bind a function to an event.
    pub fn on_event(mut self, function: impl Into<String>, event: impl Into<String>) -> Self {
        self.manifest
            .functions
            .entry(function.into())
            .or_default()
            .events
            .push(event.into());
        self
    }

    /// Bind a function to a schedule expression.
    pub fn on_cron(mut self, function: impl Into<String>, expr: impl Into<String>) -> Self {
        self.manifest
            .functions
            .entry(function.into())
            .or_default()
            .cron
            .push(expr.into());
        self
    }

    /// Bind a function to an HTTP route.
    pub fn on_http(
        mut self,
        function: impl Into<String>,
        method: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        self.manifest.functions.entry(function.into()).or_default().http =
            Some(EndpointDef::new(method, path));
        self
    }

    /// Add metadata.
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.manifest.metadata.insert(key.into(), value.into());
        self
    }

    /// Build and validate the manifest.
    pub fn build(self) -> Result<Manifest> {
        self.manifest.validate()?;
        Ok(self.manifest)
    }

    /// Build without validation.
    pub fn build_unchecked(self) -> Manifest {
        self.manifest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_builder() {
        let manifest = ManifestBuilder::new("greeter")
            .version("1.0.0")
            .requires("fs")
            .on_event("hello", "user:join")
            .on_cron("tick", "@every 5s")
            .on_http("hello_http", "get", "/hello")
            .build()
            .unwrap();

        assert_eq!(manifest.name, "greeter");
        assert!(manifest.requires_namespace("fs"));
        assert!(manifest.exports("hello"));
        assert_eq!(manifest.module_name(), "greeter");

        let events: Vec<_> = manifest.event_bindings().collect();
        assert_eq!(events, vec![("user:join", "hello")]);

        let (endpoint, function) = manifest.endpoint_bindings().next().unwrap();
        assert_eq!(endpoint.method, "GET");
        assert_eq!(function, "hello_http");
    }

    #[test]
    fn test_manifest_validation() {
        assert!(Manifest::new("").validate().is_err());
        assert!(Manifest::new("bad/name").validate().is_err());

        let manifest = ManifestBuilder::new("p").requires("fs.read").build_unchecked();
        assert!(manifest.validate().is_err());

        let manifest = ManifestBuilder::new("p")
            .on_http("f", "GET", "no-slash")
            .build_unchecked();
        assert!(manifest.validate().is_err());

        let manifest = ManifestBuilder::new("p").on_event("f", "").build_unchecked();
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_module_override() {
        let manifest = ManifestBuilder::new("p").module("shared").build_unchecked();
        assert_eq!(manifest.module_name(), "shared");
    }

    #[test]
    fn test_manifest_json() {
        let json = r#"{
            "name": "reader",
            "requires": ["fs"],
            "functions": { "read": { "events": ["page:open"] } }
        }"#;
        let manifest = Manifest::from_json(json).unwrap();
        assert_eq!(manifest.version, "0.0.0");
        assert!(manifest.requires_namespace("fs"));
        assert_eq!(manifest.functions["read"].events, vec!["page:open"]);
    }

    #[cfg(feature = "toml")]
    #[test]
    fn test_manifest_toml() {
        let toml = r#"
name = "greeter"
version = "1.0.0"
requires = ["shell"]

[functions.hello]
events = ["user:join"]

[functions.api]
http = { method = "POST", path = "/greet" }

[functions.tick]
cron = ["@hourly"]
"#;

        let manifest = Manifest::from_toml(toml).unwrap();
        assert_eq!(manifest.name, "greeter");
        assert_eq!(manifest.functions.len(), 3);
        assert_eq!(manifest.cron_bindings().count(), 1);
        assert_eq!(
            manifest.functions["api"].http,
            Some(EndpointDef::new("POST", "/greet"))
        );
        manifest.validate().unwrap();
    }
}
