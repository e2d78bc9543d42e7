//! Plug bundles and loading them from disk.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::manifest::Manifest;

/// Everything needed to load a plug: its manifest and where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct PlugBundle {
    /// Parsed manifest.
    pub manifest: Manifest,
    /// File the bundle was read from, if any.
    pub origin: Option<PathBuf>,
}

impl PlugBundle {
    /// Wrap an in-memory manifest.
    pub fn new(manifest: Manifest) -> Self {
        Self {
            manifest,
            origin: None,
        }
    }

    /// Record the file this bundle came from.
    pub fn with_origin(mut self, origin: impl Into<PathBuf>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Plug name declared by the manifest.
    pub fn name(&self) -> &str {
        &self.manifest.name
    }

    /// Parse a bundle from a TOML manifest.
    #[cfg(feature = "toml")]
    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(Self::new(Manifest::from_toml(content)?))
    }

    /// Parse a bundle from a JSON manifest.
    pub fn from_json(content: &str) -> Result<Self> {
        Ok(Self::new(Manifest::from_json(content)?))
    }

    /// Read a bundle from a `.toml` or `.json` manifest file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let bundle = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&content)?,
            #[cfg(feature = "toml")]
            Some("toml") => Self::from_toml(&content)?,
            _ => {
                return Err(Error::ManifestParse(format!(
                    "unsupported manifest format: {}",
                    path.display()
                )))
            }
        };
        Ok(bundle.with_origin(path))
    }
}

impl From<Manifest> for PlugBundle {
    fn from(manifest: Manifest) -> Self {
        Self::new(manifest)
    }
}

/// Configuration for the bundle loader.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Base path for resolving relative paths.
    pub base_path: Option<PathBuf>,
    /// File name suffixes recognized as plug bundles.
    pub suffixes: Vec<String>,
    /// Whether to validate manifests while loading.
    pub strict_validation: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        let mut suffixes = vec![".plug.json".to_string()];
        if cfg!(feature = "toml") {
            suffixes.insert(0, ".plug.toml".to_string());
        }
        Self {
            base_path: None,
            suffixes,
            strict_validation: true,
        }
    }
}

impl LoaderConfig {
    /// Create a new loader configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the base path.
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Replace the recognized suffixes.
    pub fn with_suffixes(mut self, suffixes: Vec<String>) -> Self {
        self.suffixes = suffixes;
        self
    }

    /// Set strict validation.
    pub fn with_strict_validation(mut self, strict: bool) -> Self {
        self.strict_validation = strict;
        self
    }
}

/// Reads plug bundles from manifest files.
pub struct BundleLoader {
    config: LoaderConfig,
}

impl BundleLoader {
    /// Create a new bundle loader.
    pub fn new(config: LoaderConfig) -> Self {
        Self { config }
    }

    /// Get the loader configuration.
    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Whether `path` names a plug bundle.
    pub fn is_bundle(&self, path: &Path) -> bool {
        path.file_name()
            .and_then(|n| n.to_str())
            .map_or(false, |name| {
                self.config.suffixes.iter().any(|s| name.ends_with(s.as_str()))
            })
    }

    /// Load one bundle.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<PlugBundle> {
        let path = self.resolve_path(path.as_ref());
        let bundle = PlugBundle::from_file(&path)?;
        if self.config.strict_validation {
            bundle.manifest.validate()?;
        }
        Ok(bundle)
    }

    /// Load every bundle directly inside `dir`, sorted by path.
    ///
    /// Unreadable or invalid bundles are logged and skipped.
    pub fn scan(&self, dir: impl AsRef<Path>) -> Result<Vec<PlugBundle>> {
        let dir = self.resolve_path(dir.as_ref());
        let mut paths: Vec<PathBuf> = std::fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && self.is_bundle(p))
            .collect();
        paths.sort();

        let mut bundles = Vec::with_capacity(paths.len());
        for path in paths {
            match self.load(&path) {
                Ok(bundle) => bundles.push(bundle),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping plug bundle");
                }
            }
        }
        Ok(bundles)
    }

    fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else if let Some(ref base) = self.config.base_path {
            base.join(path)
        } else {
            path.to_path_buf()
        }
    }
}

impl Default for BundleLoader {
    fn default() -> Self {
        Self::new(LoaderConfig::default())
    }
}

impl std::fmt::Debug for BundleLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BundleLoader")
            .field("config", &self.config)
            .finish()
    }
}
