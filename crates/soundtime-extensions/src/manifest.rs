//! Extension manifest parsing and validation.
//!
//! Every extension directory carries a `package.json` whose
//! `soundtimeExtension` marker opts it into discovery.

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ExtensionError;

/// File name looked up inside every extension directory.
pub const MANIFEST_FILE: &str = "package.json";

/// `author` is either a plain string or an npm-style `{ "name": ... }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Author {
    Name(String),
    Person {
        name: String,
    },
}

impl Author {
    pub fn name(&self) -> &str {
        match self {
            Self::Name(name) | Self::Person { name } => name,
        }
    }
}

/// On-disk `package.json`, only the fields the host cares about.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageManifest {
    #[serde(default)]
    pub soundtime_extension: bool,
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub author: Option<Author>,
    pub version: String,
    pub extension_entry: String,
    #[serde(default)]
    pub icon: Option<String>,
}

/// Validated manifest with paths resolved against the extension directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Manifest {
    pub package_name: String,
    pub display_name: String,
    pub description: Option<String>,
    pub author: Option<String>,
    pub version: String,
    pub entry: PathBuf,
    pub extension_path: PathBuf,
    pub icon: Option<PathBuf>,
}

// ─── Validation helpers ─────────────────────────────────────────────

/// Reject absolute paths and `..` components.
fn validate_path_safety(path: &str, field_name: &str) -> Result<(), ExtensionError> {
    let p = Path::new(path);
    if p.is_absolute() || p.has_root() {
        return Err(ExtensionError::InvalidManifest(format!(
            "{field_name} must be a relative path, got absolute: '{path}'"
        )));
    }
    if p.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(ExtensionError::InvalidManifest(format!(
            "{field_name} must not contain '..': '{path}'"
        )));
    }
    Ok(())
}

fn validate_package_name(name: &str) -> Result<(), ExtensionError> {
    if name.trim().is_empty() {
        return Err(ExtensionError::InvalidManifest(
            "name must not be empty".into(),
        ));
    }
    if name.len() > 214 {
        return Err(ExtensionError::InvalidManifest(format!(
            "name must be at most 214 characters, got {}",
            name.len()
        )));
    }
    if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(ExtensionError::InvalidManifest(format!(
            "name must not contain whitespace: '{name}'"
        )));
    }
    Ok(())
}

impl PackageManifest {
    /// Parse a manifest from JSON text.
    pub fn parse(json: &str) -> Result<Self, ExtensionError> {
        serde_json::from_str(json).map_err(|e| ExtensionError::Manifest(e.to_string()))
    }

    /// Whether the package opted into discovery.
    pub fn is_extension(&self) -> bool {
        self.soundtime_extension
    }

    pub fn validate(&self) -> Result<(), ExtensionError> {
        validate_package_name(&self.name)?;

        if self.version.trim().is_empty() {
            return Err(ExtensionError::InvalidManifest(
                "version must not be empty".into(),
            ));
        }

        if self.extension_entry.trim().is_empty() {
            return Err(ExtensionError::InvalidManifest(
                "extensionEntry must not be empty".into(),
            ));
        }
        validate_path_safety(&self.extension_entry, "extensionEntry")?;

        if let Some(ref icon) = self.icon {
            validate_path_safety(icon, "icon")?;
        }

        Ok(())
    }

    /// Validate and resolve relative paths against `dir`.
    pub fn resolve(self, dir: &Path) -> Result<Manifest, ExtensionError> {
        self.validate()?;
        Ok(Manifest {
            display_name: self
                .display_name
                .filter(|d| !d.trim().is_empty())
                .unwrap_or_else(|| self.name.clone()),
            entry: dir.join(&self.extension_entry),
            icon: self.icon.as_deref().map(|icon| dir.join(icon)),
            extension_path: dir.to_path_buf(),
            author: self.author.map(|a| a.name().to_string()),
            description: self.description,
            version: self.version,
            package_name: self.name,
        })
    }
}

impl Manifest {
    /// Parse, validate and resolve the manifest stored in `dir`.
    ///
    /// Returns `Ok(None)` when the package is not marked as an extension.
    pub async fn load(dir: &Path) -> Result<Option<Self>, ExtensionError> {
        let text = tokio::fs::read_to_string(dir.join(MANIFEST_FILE)).await?;
        let package = PackageManifest::parse(&text)?;
        if !package.is_extension() {
            return Ok(None);
        }
        package.resolve(dir).map(Some)
    }

    /// Integer form of the version used for duplicate resolution.
    ///
    /// All dots are removed and the rest parsed as an integer, so `1.2.3`
    /// becomes `123`. Anything unparsable counts as `0`.
    pub fn numeric_version(&self) -> u64 {
        numeric_version(&self.version)
    }
}

/// Dots removed, then the leading run of digits. No digits means 0.
pub fn numeric_version(version: &str) -> u64 {
    let stripped = version.replace('.', "");
    let stripped = stripped.trim_start();
    let end = stripped
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(stripped.len());
    match &stripped[..end] {
        "" => 0,
        digits => digits.parse().unwrap_or(u64::MAX),
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
