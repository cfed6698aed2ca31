//! Static registry of rollback units
//!
//! ```toml
//! [[unit]]
//! id = "1.2"
//! featureToggle = "dashboard_v2"
//! script = "scripts/rollback-1.2.sh"
//! files = ["models/dashboard_v2.sql"]
//! dependencies = ["1.1"]
//! validationScript = "scripts/validate-1.2.sh"
//! ```
//!
//! Relative paths are resolved against the registry file's directory.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use warden_core::ConfigError;

/// One deployed unit that can be rolled back
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitDefinition {
    /// Unit id, e.g. `"1.2"`
    pub id: String,
    /// Toggle gating the unit's functionality
    pub feature_toggle: String,
    /// Compensating script
    pub script: PathBuf,
    /// Files the unit added; absent after rollback
    #[serde(default)]
    pub files: Vec<PathBuf>,
    /// Units this one depends on
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Extra post-rollback check
    #[serde(default)]
    pub validation_script: Option<PathBuf>,
}

#[derive(Deserialize)]
struct RegistryFile {
    #[serde(default)]
    unit: Vec<UnitDefinition>,
}

/// Units by id
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitRegistry {
    units: BTreeMap<String, UnitDefinition>,
}

impl UnitRegistry {
    /// Empty registry
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a registry document; paths stay as written
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let file: RegistryFile = toml::from_str(source)?;
        let mut registry = Self::new();
        for unit in file.unit {
            if registry.units.contains_key(&unit.id) {
                return Err(ConfigError::Invalid {
                    field: "unit.id",
                    reason: format!("duplicate unit {}", unit.id),
                });
            }
            registry.insert(unit);
        }
        Ok(registry)
    }

    /// Read a registry file, resolving relative paths against its directory
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let mut registry = Self::from_toml_str(&source)?;
        if let Some(base) = path.parent() {
            registry.resolve_against(base);
        }
        Ok(registry)
    }

    fn resolve_against(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        for unit in self.units.values_mut() {
            resolve(&mut unit.script);
            unit.files.iter_mut().for_each(resolve);
            if let Some(v) = unit.validation_script.as_mut() {
                resolve(v);
            }
        }
    }

    /// Add or replace a unit
    pub fn insert(&mut self, unit: UnitDefinition) {
        self.units.insert(unit.id.clone(), unit);
    }

    /// Look up a unit
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&UnitDefinition> {
        self.units.get(id)
    }

    /// Known unit ids, sorted
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.units.keys().map(String::as_str)
    }

    /// Number of units
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// Whether the registry is empty
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGISTRY: &str = r#"
        [[unit]]
        id = "1.2"
        featureToggle = "dashboard_v2"
        script = "scripts/rollback-1.2.sh"
        files = ["models/dashboard_v2.sql"]
        dependencies = ["1.1"]

        [[unit]]
        id = "2.0"
        featureToggle = "exports"
        script = "/opt/rollback/2.0.sh"
        validationScript = "scripts/validate-2.0.sh"
    "#;

    #[test]
    fn parses_units() {
        let registry = UnitRegistry::from_toml_str(REGISTRY).unwrap();
        assert_eq!(registry.ids().collect::<Vec<_>>(), vec!["1.2", "2.0"]);
        let unit = registry.get("1.2").unwrap();
        assert_eq!(unit.feature_toggle, "dashboard_v2");
        assert_eq!(unit.dependencies, vec!["1.1".to_string()]);
        assert!(registry.get("2.0").unwrap().files.is_empty());
    }

    #[test]
    fn rejects_duplicates() {
        let doc = "[[unit]]\nid='a'\nfeatureToggle='t'\nscript='s'\n[[unit]]\nid='a'\nfeatureToggle='t'\nscript='s'\n";
        assert!(matches!(
            UnitRegistry::from_toml_str(doc),
            Err(ConfigError::Invalid { field: "unit.id", .. })
        ));
    }

    #[test]
    fn load_resolves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("units.toml");
        std::fs::write(&path, REGISTRY).unwrap();

        let registry = UnitRegistry::load(&path).unwrap();
        let unit = registry.get("1.2").unwrap();
        assert_eq!(unit.script, dir.path().join("scripts/rollback-1.2.sh"));
        assert_eq!(unit.files[0], dir.path().join("models/dashboard_v2.sql"));
        assert_eq!(registry.get("2.0").unwrap().script, PathBuf::from("/opt/rollback/2.0.sh"));
    }
}
