//! Task handlers and the handler registry.
//!
//! Handlers are registered in code at startup; the optional manifest file
//! only enables and documents task types. A manifest entry naming a type
//! nobody registered fails the whole load, so configuration drift is caught
//! before the first claim.
//!
//! # Example
//!
//! ```
//! use prismq_core::{HandlerRegistry, HandlerResult, Task};
//!
//! fn handle_echo(task: &Task) -> HandlerResult {
//!     tracing::info!(task_id = task.id, "echo: {}", task.payload);
//!     Ok(())
//! }
//!
//! let registry = HandlerRegistry::new();
//! registry.register_fn("echo", handle_echo).unwrap();
//! assert!(registry.has("echo"));
//! ```

use std::path::Path;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;

use crate::error::{HandlerConfigError, HandlerResult, RegistryError};
use crate::model::Task;

/// A callable that executes one task.
///
/// The task snapshot is immutable; outcomes are reported through the return
/// value, never by writing queue tables.
pub trait TaskHandler: Send + Sync {
    fn handle(&self, task: &Task) -> HandlerResult;
}

impl<F> TaskHandler for F
where
    F: Fn(&Task) -> HandlerResult + Send + Sync,
{
    fn handle(&self, task: &Task) -> HandlerResult {
        self(task)
    }
}

/// Metadata describing a registration.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct HandlerInfo {
    pub task_type: String,
    pub description: String,
    pub version: String,
}

#[derive(Clone)]
struct RegistryEntry {
    handler: Arc<dyn TaskHandler>,
    info: HandlerInfo,
    /// Set once a manifest has enabled this type; guards duplicate manifest
    /// application without `allow_override`.
    configured: bool,
}

/// A handler resolved for dispatch.
#[derive(Clone)]
pub struct RegisteredHandler {
    pub handler: Arc<dyn TaskHandler>,
    pub info: HandlerInfo,
}

impl std::fmt::Debug for RegisteredHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredHandler")
            .field("info", &self.info)
            .finish()
    }
}

/// Name-to-handler map for task types.
///
/// Read-mostly: registration is bounded to startup and reload, dispatch is
/// concurrent lookups.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<String, RegistryEntry>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a task type.
    ///
    /// Fails with [`RegistryError::AlreadyRegistered`] when the type already
    /// has a handler and `allow_override` is false.
    pub fn register(
        &self,
        task_type: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
        description: impl Into<String>,
        version: impl Into<String>,
        allow_override: bool,
    ) -> Result<(), RegistryError> {
        let task_type = task_type.into();
        let entry = RegistryEntry {
            handler,
            info: HandlerInfo {
                task_type: task_type.clone(),
                description: description.into(),
                version: version.into(),
            },
            configured: false,
        };

        match self.handlers.entry(task_type) {
            Entry::Occupied(mut occupied) => {
                if !allow_override {
                    return Err(RegistryError::AlreadyRegistered {
                        task_type: occupied.key().clone(),
                    });
                }
                occupied.insert(entry);
                Ok(())
            }
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
                Ok(())
            }
        }
    }

    /// Register a plain function or closure with default metadata.
    pub fn register_fn<F>(&self, task_type: &str, handler: F) -> Result<(), RegistryError>
    where
        F: Fn(&Task) -> HandlerResult + Send + Sync + 'static,
    {
        self.register(task_type, Arc::new(handler), "", "1.0.0", false)
    }

    /// Resolve the handler for a task type.
    pub fn get(&self, task_type: &str) -> Result<RegisteredHandler, RegistryError> {
        self.handlers
            .get(task_type)
            .map(|entry| RegisteredHandler {
                handler: Arc::clone(&entry.handler),
                info: entry.info.clone(),
            })
            .ok_or_else(|| RegistryError::NotRegistered {
                task_type: task_type.to_string(),
            })
    }

    pub fn has(&self, task_type: &str) -> bool {
        self.handlers.contains_key(task_type)
    }

    /// Enumerate registrations, sorted by task type.
    pub fn list(&self) -> Vec<HandlerInfo> {
        let mut infos: Vec<HandlerInfo> = self
            .handlers
            .iter()
            .map(|entry| entry.info.clone())
            .collect();
        infos.sort_by(|a, b| a.task_type.cmp(&b.task_type));
        infos
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Apply a manifest: every entry must name a registered type; metadata
    /// from the manifest replaces the registration's metadata.
    ///
    /// Any failure leaves already-applied entries in place but reports the
    /// load as failed, matching the all-or-nothing contract at the call site
    /// (callers treat a failed load as fatal).
    pub fn apply_manifest(
        &self,
        manifest: &HandlerManifest,
        allow_override: bool,
    ) -> Result<usize, HandlerConfigError> {
        let mut seen: Vec<&str> = Vec::with_capacity(manifest.handlers.len());

        for entry in &manifest.handlers {
            if seen.contains(&entry.task_type.as_str()) && !allow_override {
                return Err(RegistryError::AlreadyRegistered {
                    task_type: entry.task_type.clone(),
                }
                .into());
            }
            seen.push(&entry.task_type);

            let mut registered = self.handlers.get_mut(&entry.task_type).ok_or_else(|| {
                HandlerConfigError::UnknownTaskType {
                    task_type: entry.task_type.clone(),
                }
            })?;

            if registered.configured && !allow_override {
                return Err(RegistryError::AlreadyRegistered {
                    task_type: entry.task_type.clone(),
                }
                .into());
            }

            registered.info.description = entry.description.clone();
            registered.info.version = entry.version.clone();
            registered.configured = true;
        }

        tracing::info!(
            handlers = manifest.handlers.len(),
            "applied handler manifest"
        );
        Ok(manifest.handlers.len())
    }

    /// Load a manifest file and apply it.
    pub fn apply_manifest_file(
        &self,
        path: impl AsRef<Path>,
        allow_override: bool,
    ) -> Result<usize, HandlerConfigError> {
        let manifest = load_handler_manifest(path)?;
        self.apply_manifest(&manifest, allow_override)
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field(
                "registered_types",
                &self
                    .handlers
                    .iter()
                    .map(|e| e.key().clone())
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// One manifest entry enabling a task type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerManifestEntry {
    pub task_type: String,
    pub description: String,
    pub version: String,
}

/// Parsed handler manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandlerManifest {
    pub handlers: Vec<HandlerManifestEntry>,
}

/// Load a handler manifest from a JSON, YAML or TOML file, chosen by
/// extension.
pub fn load_handler_manifest(
    path: impl AsRef<Path>,
) -> Result<HandlerManifest, HandlerConfigError> {
    let path = path.as_ref();
    let display = path.display().to_string();

    if !path.exists() {
        return Err(HandlerConfigError::NotFound { path: display });
    }

    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let raw = std::fs::read_to_string(path).map_err(|source| HandlerConfigError::Io {
        path: display.clone(),
        source,
    })?;

    let document: Value = match extension.as_str() {
        "json" => serde_json::from_str(&raw).map_err(|e| HandlerConfigError::Parse {
            path: display.clone(),
            message: e.to_string(),
        })?,
        "yaml" | "yml" => serde_yaml::from_str(&raw).map_err(|e| HandlerConfigError::Parse {
            path: display.clone(),
            message: e.to_string(),
        })?,
        "toml" => toml::from_str(&raw).map_err(|e| HandlerConfigError::Parse {
            path: display.clone(),
            message: e.to_string(),
        })?,
        other => {
            return Err(HandlerConfigError::UnsupportedFormat {
                extension: other.to_string(),
            })
        }
    };

    parse_manifest_document(&document, &display)
}

fn parse_manifest_document(
    document: &Value,
    path: &str,
) -> Result<HandlerManifest, HandlerConfigError> {
    let entries = document
        .get("handlers")
        .and_then(Value::as_array)
        .ok_or_else(|| HandlerConfigError::Parse {
            path: path.to_string(),
            message: "manifest must contain a 'handlers' list".to_string(),
        })?;

    let mut handlers = Vec::with_capacity(entries.len());
    for (index, entry) in entries.iter().enumerate() {
        let task_type = required_string(entry, index, "task_type")?;
        let description = entry
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let version = entry
            .get("version")
            .and_then(Value::as_str)
            .unwrap_or("1.0.0")
            .to_string();
        handlers.push(HandlerManifestEntry {
            task_type,
            description,
            version,
        });
    }

    Ok(HandlerManifest { handlers })
}

fn required_string(
    entry: &Value,
    index: usize,
    field: &'static str,
) -> Result<String, HandlerConfigError> {
    entry
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or(HandlerConfigError::MissingField { index, field })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerError;

    fn ok_handler(_task: &Task) -> HandlerResult {
        Ok(())
    }

    fn failing_handler(_task: &Task) -> HandlerResult {
        Err(HandlerError::msg("always fails"))
    }

    fn registry_with(types: &[&str]) -> HandlerRegistry {
        let registry = HandlerRegistry::new();
        for task_type in types {
            registry.register_fn(task_type, ok_handler).unwrap();
        }
        registry
    }

    #[test]
    fn test_register_and_get() {
        let registry = registry_with(&["echo"]);
        let resolved = registry.get("echo").unwrap();
        assert_eq!(resolved.info.task_type, "echo");
        assert!(registry.has("echo"));
        assert!(!registry.has("other"));
    }

    #[test]
    fn test_duplicate_registration_fails_without_override() {
        let registry = registry_with(&["echo"]);
        let err = registry.register_fn("echo", failing_handler).unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyRegistered { .. }));
    }

    #[test]
    fn test_duplicate_registration_allowed_with_override() {
        let registry = registry_with(&["echo"]);
        registry
            .register("echo", Arc::new(failing_handler), "v2", "2.0.0", true)
            .unwrap();
        let info = registry.get("echo").unwrap().info;
        assert_eq!(info.version, "2.0.0");
    }

    #[test]
    fn test_get_unknown_type_is_not_registered() {
        let registry = HandlerRegistry::new();
        let err = registry.get("ghost").unwrap_err();
        assert!(matches!(err, RegistryError::NotRegistered { .. }));
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_list_is_sorted() {
        let registry = registry_with(&["zeta", "alpha", "mid"]);
        let types: Vec<String> = registry.list().into_iter().map(|i| i.task_type).collect();
        assert_eq!(types, vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn test_manifest_json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("handlers.json");
        std::fs::write(
            &path,
            r#"{ "handlers": [
                { "task_type": "echo", "description": "echoes", "version": "1.2.0" },
                { "task_type": "transcode" }
            ]}"#,
        )
        .unwrap();

        let manifest = load_handler_manifest(&path).unwrap();
        assert_eq!(manifest.handlers.len(), 2);
        assert_eq!(manifest.handlers[0].version, "1.2.0");
        assert_eq!(manifest.handlers[1].version, "1.0.0");
    }

    #[test]
    fn test_manifest_yaml_and_toml() {
        let dir = tempfile::tempdir().unwrap();

        let yaml = dir.path().join("handlers.yaml");
        std::fs::write(
            &yaml,
            "handlers:\n  - task_type: echo\n    description: echoes\n",
        )
        .unwrap();
        let manifest = load_handler_manifest(&yaml).unwrap();
        assert_eq!(manifest.handlers[0].task_type, "echo");

        let toml_path = dir.path().join("handlers.toml");
        std::fs::write(
            &toml_path,
            "[[handlers]]\ntask_type = \"echo\"\nversion = \"3.0.0\"\n",
        )
        .unwrap();
        let manifest = load_handler_manifest(&toml_path).unwrap();
        assert_eq!(manifest.handlers[0].version, "3.0.0");
    }

    #[test]
    fn test_manifest_missing_task_type_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("handlers.json");
        std::fs::write(&path, r#"{ "handlers": [ { "description": "nope" } ] }"#).unwrap();

        let err = load_handler_manifest(&path).unwrap_err();
        assert!(matches!(
            err,
            HandlerConfigError::MissingField {
                index: 0,
                field: "task_type"
            }
        ));
    }

    #[test]
    fn test_manifest_unsupported_extension_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("handlers.ini");
        std::fs::write(&path, "").unwrap();
        let err = load_handler_manifest(&path).unwrap_err();
        assert!(matches!(err, HandlerConfigError::UnsupportedFormat { .. }));
    }

    #[test]
    fn test_apply_manifest_unknown_type_fails() {
        let registry = registry_with(&["echo"]);
        let manifest = HandlerManifest {
            handlers: vec![HandlerManifestEntry {
                task_type: "ghost".to_string(),
                description: String::new(),
                version: "1.0.0".to_string(),
            }],
        };
        let err = registry.apply_manifest(&manifest, false).unwrap_err();
        assert!(matches!(err, HandlerConfigError::UnknownTaskType { .. }));
    }

    #[test]
    fn test_apply_manifest_twice_with_override_is_idempotent() {
        let registry = registry_with(&["echo", "transcode"]);
        let manifest = HandlerManifest {
            handlers: vec![
                HandlerManifestEntry {
                    task_type: "echo".to_string(),
                    description: "echoes".to_string(),
                    version: "2.0.0".to_string(),
                },
                HandlerManifestEntry {
                    task_type: "transcode".to_string(),
                    description: String::new(),
                    version: "1.0.0".to_string(),
                },
            ],
        };

        registry.apply_manifest(&manifest, true).unwrap();
        let first = registry.list();
        registry.apply_manifest(&manifest, true).unwrap();
        assert_eq!(registry.list(), first);
    }

    #[test]
    fn test_apply_manifest_twice_without_override_fails() {
        let registry = registry_with(&["echo"]);
        let manifest = HandlerManifest {
            handlers: vec![HandlerManifestEntry {
                task_type: "echo".to_string(),
                description: String::new(),
                version: "1.0.0".to_string(),
            }],
        };
        registry.apply_manifest(&manifest, false).unwrap();
        let err = registry.apply_manifest(&manifest, false).unwrap_err();
        assert!(matches!(err, HandlerConfigError::Registry(_)));
    }

    #[test]
    fn test_manifest_duplicate_entries_fail_without_override() {
        let registry = registry_with(&["echo"]);
        let entry = HandlerManifestEntry {
            task_type: "echo".to_string(),
            description: String::new(),
            version: "1.0.0".to_string(),
        };
        let manifest = HandlerManifest {
            handlers: vec![entry.clone(), entry],
        };
        assert!(registry.apply_manifest(&manifest, false).is_err());
    }
}
