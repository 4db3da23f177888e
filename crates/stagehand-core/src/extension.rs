//! Extension registry built from a static manifest.
//!
//! Packages, their test registries and the advices they contribute are
//! declared in a TOML manifest that is loaded once at startup. Advice
//! identifiers are resolved into [`Advice`] values before any pipeline runs,
//! so nothing inside the pipeline dispatches on strings.
//!
//! ```toml
//! [[registry]]
//! name = "example.tests"
//! modules = ["tests/test_main.js"]
//!
//! [[advice]]
//! name = "bundle-fixtures"
//! command = ["node", "scripts/fixtures.js"]
//!
//! [[package]]
//! name = "example"
//! registries = ["example.tests"]
//! advices = [{ event = "before_karma", advice = "bundle-fixtures" }]
//! ```

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info};

use crate::advice::Advice;
use crate::error::{AdviceError, AdviceResult, LaunchFailure, ManifestError};
use crate::event::Event;
use crate::spec::Spec;

/// Environment variable exported to command advices and runners.
pub const BUILD_DIR_ENV: &str = "STAGEHAND_BUILD_DIR";

/// Top-level manifest document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtensionManifest {
    #[serde(default, rename = "registry")]
    pub registries: Vec<RegistryEntry>,

    #[serde(default, rename = "package")]
    pub packages: Vec<PackageEntry>,

    #[serde(default, rename = "advice")]
    pub advices: Vec<AdviceEntry>,
}

/// A named collection of test modules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub name: String,

    #[serde(default)]
    pub modules: Vec<PathBuf>,
}

/// A package that contributes registries and advices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageEntry {
    pub name: String,

    #[serde(default)]
    pub registries: Vec<String>,

    #[serde(default)]
    pub advices: Vec<PackageAdvice>,
}

/// An advice a package binds to an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageAdvice {
    pub event: Event,
    pub advice: String,

    #[serde(default)]
    pub priority: Option<i64>,
}

/// An advice implemented by an external command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdviceEntry {
    pub name: String,

    /// Command to execute (first element is executable).
    pub command: Vec<String>,

    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

impl ExtensionManifest {
    pub fn from_toml_str(source: &str) -> Result<Self, ManifestError> {
        Ok(toml::from_str(source)?)
    }

    /// Read a manifest file; relative paths inside it are resolved against
    /// the manifest's directory.
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let source = std::fs::read_to_string(path).map_err(|source| ManifestError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let mut manifest = Self::from_toml_str(&source)?;
        if let Some(base) = path.parent() {
            manifest.rebase(base);
        }
        Ok(manifest)
    }

    fn rebase(&mut self, base: &Path) {
        for registry in &mut self.registries {
            for module in &mut registry.modules {
                if module.is_relative() {
                    *module = base.join(&*module);
                }
            }
        }
        for advice in &mut self.advices {
            if let Some(cwd) = advice.cwd.as_mut() {
                if cwd.is_relative() {
                    *cwd = base.join(&*cwd);
                }
            }
        }
    }
}

/// An advice resolved from a package declaration.
#[derive(Clone)]
pub struct ResolvedAdvice {
    pub event: Event,
    pub priority: Option<i64>,
    pub advice: Arc<dyn Advice>,
}

/// Lookup table of registries, packages and advices.
#[derive(Clone, Default)]
pub struct ExtensionRegistry {
    registries: IndexMap<String, Vec<PathBuf>>,
    packages: IndexMap<String, PackageEntry>,
    advices: IndexMap<String, Arc<dyn Advice>>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_manifest(manifest: ExtensionManifest) -> Result<Self, ManifestError> {
        let mut registry = Self::new();

        for entry in manifest.registries {
            if registry.registries.contains_key(&entry.name) {
                return Err(ManifestError::Duplicate {
                    kind: "registry",
                    name: entry.name,
                });
            }
            registry.registries.insert(entry.name, entry.modules);
        }

        for entry in manifest.advices {
            if entry.command.is_empty() {
                return Err(ManifestError::EmptyCommand(entry.name));
            }
            if registry.advices.contains_key(&entry.name) {
                return Err(ManifestError::Duplicate {
                    kind: "advice",
                    name: entry.name,
                });
            }
            let name = entry.name.clone();
            registry
                .advices
                .insert(name, Arc::new(CommandAdvice::from_entry(entry)));
        }

        for package in manifest.packages {
            if registry.packages.contains_key(&package.name) {
                return Err(ManifestError::Duplicate {
                    kind: "package",
                    name: package.name,
                });
            }
            if let Some(missing) = package
                .registries
                .iter()
                .find(|name| !registry.registries.contains_key(*name))
            {
                return Err(ManifestError::UnknownRegistry {
                    package: package.name.clone(),
                    registry: missing.clone(),
                });
            }
            registry.packages.insert(package.name.clone(), package);
        }

        info!(
            registries = registry.registries.len(),
            packages = registry.packages.len(),
            advices = registry.advices.len(),
            "Loaded extension manifest"
        );
        Ok(registry)
    }

    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        Self::from_manifest(ExtensionManifest::load(path)?)
    }

    /// Add a built-in advice under `name`, replacing any previous one.
    pub fn insert_advice(&mut self, name: impl Into<String>, advice: Arc<dyn Advice>) {
        self.advices.insert(name.into(), advice);
    }

    pub fn resolve_advice(&self, name: &str) -> Result<Arc<dyn Advice>, ManifestError> {
        self.advices
            .get(name)
            .cloned()
            .ok_or_else(|| ManifestError::UnknownAdvice(name.to_string()))
    }

    pub fn package(&self, name: &str) -> Result<&PackageEntry, ManifestError> {
        self.packages
            .get(name)
            .ok_or_else(|| ManifestError::UnknownPackage(name.to_string()))
    }

    /// Resolve every advice a package contributes, in declaration order.
    pub fn package_advices(&self, name: &str) -> Result<Vec<ResolvedAdvice>, ManifestError> {
        self.package(name)?
            .advices
            .iter()
            .map(|binding| {
                Ok(ResolvedAdvice {
                    event: binding.event,
                    priority: binding.priority,
                    advice: self.resolve_advice(&binding.advice)?,
                })
            })
            .collect()
    }

    /// Registry names declared by `packages`, flattened in first-seen order.
    ///
    /// Unknown packages contribute nothing.
    pub fn registries_for_packages(&self, packages: &[String]) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for package in packages {
            let Some(entry) = self.packages.get(package) else {
                debug!(package = %package, "Package not declared in manifest");
                continue;
            };
            for registry in &entry.registries {
                if !names.contains(registry) {
                    names.push(registry.clone());
                }
            }
        }
        names
    }

    /// Test modules of a registry; empty for unknown registries.
    pub fn registry_modules(&self, name: &str) -> &[PathBuf] {
        self.registries
            .get(name)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn advice_names(&self) -> impl Iterator<Item = &str> {
        self.advices.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for ExtensionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionRegistry")
            .field("registries", &self.registries)
            .field("packages", &self.packages.keys().collect::<Vec<_>>())
            .field("advices", &self.advices.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// An advice that runs an external command.
///
/// The build directory, when known, is exported as `STAGEHAND_BUILD_DIR`.
#[derive(Debug, Clone)]
pub struct CommandAdvice {
    name: String,
    command: Vec<String>,
    cwd: Option<PathBuf>,
}

impl CommandAdvice {
    pub fn new(name: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            name: name.into(),
            command,
            cwd: None,
        }
    }

    fn from_entry(entry: AdviceEntry) -> Self {
        Self {
            name: entry.name,
            command: entry.command,
            cwd: entry.cwd,
        }
    }
}

#[async_trait]
impl Advice for CommandAdvice {
    fn name(&self) -> &str {
        &self.name
    }

    async fn apply(&self, spec: &mut Spec) -> AdviceResult {
        let Some((program, args)) = self.command.split_first() else {
            return Err(AdviceError::Failed(anyhow!(
                "advice {} has an empty command",
                self.name
            )));
        };

        let mut command = Command::new(program);
        command.args(args).stdin(Stdio::null());
        if let Some(dir) = spec.build_dir() {
            command.env(BUILD_DIR_ENV, dir);
        }
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }

        debug!(advice = %self.name, command = ?self.command, "Running advice command");
        let status = command.status().await.map_err(|source| LaunchFailure {
            program: program.clone(),
            source,
        })?;

        if !status.success() {
            return Err(AdviceError::Failed(anyhow!(
                "advice command '{}' exited with code {}",
                self.name,
                status.code().unwrap_or(-1)
            )));
        }
        Ok(())
    }
}
