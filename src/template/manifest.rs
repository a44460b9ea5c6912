//! Template manifest (`manifest.yaml`)

use crate::error::{manifest_error, AppResult};
use serde::{Deserialize, Deserializer, Serialize};
use std::fs;
use std::path::Path;
use tracing::debug;

pub const MANIFEST_FILE: &str = "manifest.yaml";

pub const SUPPORTED_MANIFEST_VERSION: u32 = 1;

/// Checked in this order; the first missing one is reported
pub const REQUIRED_FIELDS: [&str; 4] = ["version", "name", "description", "category"];

/// Directories a template may ship
pub const CONTENT_DIRS: [&str; 3] = ["migrations", "functions", "assets"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateManifest {
    pub version: serde_yaml::Value,
    pub name: String,
    pub description: String,
    pub category: String,
    #[serde(default, deserialize_with = "deserialize_platform_version", skip_serializing_if = "Option::is_none")]
    pub min_platform_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default)]
    pub contents: TemplateContents,
}

/// Declared content directories and, optionally, the files inside them
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemplateContents {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migrations: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub functions: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assets: Option<Vec<String>>,
}

impl TemplateContents {
    /// `(dir, listed files)` for every declared directory
    pub fn declared(&self) -> Vec<(&'static str, &[String])> {
        CONTENT_DIRS
            .iter()
            .zip([&self.migrations, &self.functions, &self.assets])
            .filter_map(|(dir, files)| files.as_deref().map(|f| (*dir, f)))
            .collect()
    }
}

/// `minPlatformVersion: 1.2` arrives as a number; keep it as dotted text
fn deserialize_platform_version<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_yaml::Value>::deserialize(deserializer)?;
    Ok(value.filter(|v| !is_blank(v)).map(|v| version_text(&v)))
}

fn version_text(value: &serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::String(s) => s.trim().to_string(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim().to_string())
            .unwrap_or_default(),
    }
}

fn is_blank(value: &serde_yaml::Value) -> bool {
    match value {
        serde_yaml::Value::Null => true,
        serde_yaml::Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

impl TemplateManifest {
    /// Parse and check required fields and version
    pub fn parse(text: &str) -> AppResult<Self> {
        let doc: serde_yaml::Value = serde_yaml::from_str(text)
            .map_err(|e| manifest_error(format!("Manifest is not valid YAML: {}", e)))?;
        let map = doc
            .as_mapping()
            .ok_or_else(|| manifest_error("Manifest must be a YAML mapping"))?;

        for field in REQUIRED_FIELDS {
            match map.get(field) {
                Some(value) if !is_blank(value) => {}
                _ => return Err(manifest_error(format!("Manifest is missing required field: {}", field))),
            }
        }

        let manifest: TemplateManifest = serde_yaml::from_value(doc.clone())
            .map_err(|e| manifest_error(format!("Manifest is malformed: {}", e)))?;

        let version = version_text(&manifest.version);
        if version != SUPPORTED_MANIFEST_VERSION.to_string() {
            return Err(manifest_error(format!("Unsupported manifest version: {}", version)));
        }
        Ok(manifest)
    }

    pub fn load(dir: &Path) -> AppResult<Self> {
        let path = dir.join(MANIFEST_FILE);
        let text = fs::read_to_string(&path)
            .map_err(|e| manifest_error(format!("Cannot read {}: {}", path.display(), e)))?;
        Self::parse(&text)
    }

    /// Every declared content directory (and listed file) must exist under `dir`
    pub fn check_contents(&self, dir: &Path) -> AppResult<()> {
        for (name, files) in self.contents.declared() {
            let content_dir = dir.join(name);
            if !content_dir.is_dir() {
                return Err(manifest_error(format!(
                    "Manifest declares contents.{} but the {}/ directory is missing",
                    name, name
                )));
            }
            for file in files {
                if !content_dir.join(file).exists() {
                    return Err(manifest_error(format!(
                        "Manifest lists {}/{} but the file is missing",
                        name, file
                    )));
                }
            }
            debug!("Template contents.{} ok ({} files listed)", name, files.len());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;

    fn message(text: &str) -> String {
        match TemplateManifest::parse(text).unwrap_err() {
            AppError::Manifest(msg) => msg,
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_required_fields_checked_in_order() {
        assert_eq!(message("name: x\n"), "Manifest is missing required field: version");
        assert_eq!(message("version: 1\n"), "Manifest is missing required field: name");
        assert_eq!(
            message("version: 1\nname: todo\ncategory: starter\n"),
            "Manifest is missing required field: description"
        );
        assert_eq!(
            message("version: 1\nname: todo\ndescription: Todos\ncategory: \"\"\n"),
            "Manifest is missing required field: category"
        );
    }

    #[test]
    fn test_unsupported_version() {
        assert_eq!(
            message("version: 2\nname: todo\ndescription: Todos\ncategory: starter\n"),
            "Unsupported manifest version: 2"
        );
    }

    #[test]
    fn test_declared_contents() {
        let manifest = TemplateManifest::parse(
            "version: \"1\"\nname: todo\ndescription: Todos\ncategory: starter\nminPlatformVersion: 1.2\n\
             contents:\n  migrations: [001_todos.sql]\n  assets: []\n",
        )
        .unwrap();
        let declared: Vec<&str> = manifest.contents.declared().iter().map(|(d, _)| *d).collect();
        assert_eq!(declared, vec!["migrations", "assets"]);
        assert_eq!(manifest.min_platform_version.as_deref(), Some("1.2"));
    }
}
