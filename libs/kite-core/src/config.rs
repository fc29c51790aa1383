use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use serde::Deserialize;

use crate::error::ConfigError;

/// One plugin's entry under `plugins:` in the controller config document.
///
/// `enabled` gates whether the plugin is constructed at all; everything
/// else in the entry is the plugin's own opaque settings object and is
/// handed to the plugin unexamined.
#[derive(Debug, Clone, Deserialize)]
pub struct PluginConfigEntry {
    #[serde(default)]
    pub enabled: bool,
    #[serde(flatten)]
    pub settings: serde_json::Value,
}

/// The decoded `data["config"]` document of the controller's ConfigMap.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ControllerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(rename = "controller-id", default)]
    pub controller_id: Option<String>,
    #[serde(default)]
    pub plugins: BTreeMap<String, PluginConfigEntry>,
}

/// Pulls `data["config"]` out of `cm` and decodes it as YAML.
///
/// A ConfigMap with no such key is a configuration error, not an
/// "unconfigured" state: the key must be present even if its document
/// only sets `enabled: false`.
pub fn parse_controller_config(
    namespace: &str,
    name: &str,
    cm: &ConfigMap,
) -> Result<ControllerConfig, ConfigError> {
    let raw = cm
        .data
        .as_ref()
        .and_then(|data| data.get("config"))
        .ok_or_else(|| ConfigError::MissingKey {
            namespace: namespace.to_string(),
            name: name.to_string(),
        })?;

    Ok(serde_yaml::from_str(raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap as Map;

    fn cm_with(data: Option<Map<String, String>>) -> ConfigMap {
        ConfigMap {
            data,
            ..Default::default()
        }
    }

    #[test]
    fn missing_data_key_is_an_error() {
        let cm = cm_with(None);
        let err = parse_controller_config("ns", "name", &cm).unwrap_err();
        assert!(matches!(err, ConfigError::MissingKey { .. }));
    }

    #[test]
    fn missing_config_entry_is_an_error() {
        let mut data = Map::new();
        data.insert("other".to_string(), "x".to_string());
        let cm = cm_with(Some(data));
        let err = parse_controller_config("ns", "name", &cm).unwrap_err();
        assert!(matches!(err, ConfigError::MissingKey { .. }));
    }

    #[test]
    fn parses_plugin_entries_with_opaque_settings() {
        let mut data = Map::new();
        data.insert(
            "config".to_string(),
            r#"
enabled: true
controller-id: prod-1
plugins:
  replicator:
    enabled: true
    targetNamespace: backup
    retries: 3
  noop:
    enabled: false
"#
            .to_string(),
        );
        let cm = cm_with(Some(data));
        let cfg = parse_controller_config("ns", "name", &cm).unwrap();
        assert!(cfg.enabled);
        assert_eq!(cfg.controller_id.as_deref(), Some("prod-1"));
        assert_eq!(cfg.plugins.len(), 2);
        let replicator = &cfg.plugins["replicator"];
        assert!(replicator.enabled);
        assert_eq!(replicator.settings["targetNamespace"], "backup");
        assert_eq!(replicator.settings["retries"], 3);
        assert!(!cfg.plugins["noop"].enabled);
    }

    #[test]
    fn invalid_yaml_is_an_error() {
        let mut data = Map::new();
        data.insert("config".to_string(), "not: valid: yaml: here:".to_string());
        let cm = cm_with(Some(data));
        let err = parse_controller_config("ns", "name", &cm).unwrap_err();
        assert!(matches!(err, ConfigError::Yaml(_)));
    }
}
