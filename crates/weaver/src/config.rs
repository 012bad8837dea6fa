//! Weaver configuration.
//!
//! A small knob set controlling the pass's output surface: JSON
//! formatting for the CLI and the names of the synthetic entities the
//! injector introduces. Front ends embedding the weaver can rename those
//! when a source program already uses the defaults.
//!
//! Configuration loads from TOML:
//!
//! ```toml
//! pretty = true
//!
//! [names]
//! counter = "_ic"
//! dynamic = "_perms"
//! ```

use serde::Deserialize;
use std::path::Path;

use crate::injector::Names;

/// Synthetic-name overrides. Unset entries keep the defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NameOverrides {
    pub counter: Option<String>,
    pub dynamic: Option<String>,
    #[serde(rename = "static")]
    pub statics: Option<String>,
    pub condition_prefix: Option<String>,
    pub result: Option<String>,
    pub id_field: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WeaverConfig {
    /// Pretty-print the woven program JSON
    #[serde(default)]
    pub pretty: bool,
    #[serde(default)]
    pub names: NameOverrides,
}

impl WeaverConfig {
    pub fn new() -> WeaverConfig {
        WeaverConfig::default()
    }

    /// Parse a TOML configuration string.
    pub fn from_toml(content: &str) -> Result<WeaverConfig, String> {
        toml::from_str(content).map_err(|e| format!("invalid weaver config: {}", e))
    }

    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<WeaverConfig, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read config '{}': {}", path.display(), e))?;
        WeaverConfig::from_toml(&content)
    }

    pub fn with_pretty(mut self, pretty: bool) -> WeaverConfig {
        self.pretty = pretty;
        self
    }

    pub(crate) fn names(&self) -> Names {
        let mut names = Names::default();
        if let Some(counter) = &self.names.counter {
            names.counter = counter.clone();
        }
        if let Some(dynamic) = &self.names.dynamic {
            names.dynamic = dynamic.clone();
        }
        if let Some(statics) = &self.names.statics {
            names.statics = statics.clone();
        }
        if let Some(prefix) = &self.names.condition_prefix {
            names.cond_prefix = prefix.clone();
        }
        if let Some(result) = &self.names.result {
            names.result = result.clone();
        }
        if let Some(id_field) = &self.names.id_field {
            names.id_field = id_field.clone();
        }
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_keeps_default_names() {
        let config = WeaverConfig::new();
        let names = config.names();
        assert_eq!(names.counter, "_instance_counter");
        assert_eq!(names.dynamic, "_dyn_fields");
        assert_eq!(names.statics, "_static_fields");
        assert_eq!(names.cond_prefix, "_cond_");
    }

    #[test]
    fn toml_overrides_apply() {
        let config = WeaverConfig::from_toml(
            r#"
            pretty = true

            [names]
            counter = "_ic"
            static = "_grant"
            "#,
        )
        .unwrap();
        assert!(config.pretty);
        let names = config.names();
        assert_eq!(names.counter, "_ic");
        assert_eq!(names.statics, "_grant");
        assert_eq!(names.dynamic, "_dyn_fields");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(WeaverConfig::from_toml("verbose = 3").is_err());
    }
}
