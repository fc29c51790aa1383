use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config map {namespace}/{name} has no 'config' entry in data")]
    MissingKey { namespace: String, name: String },

    #[error("failed to parse config YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("failed to decode stored value for key '{key}': {source}")]
    Decode {
        key: String,
        source: serde_json::Error,
    },

    #[error("failed to encode value for key '{key}': {source}")]
    Encode {
        key: String,
        source: serde_json::Error,
    },

    #[error("store has not completed initial load")]
    NotInitialized,
}

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("plugin '{0}' failed to initialize: {1}")]
    Init(String, #[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Top level error for anything that can terminate the controller's run loop.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("watch stream error: {0}")]
    Watch(#[from] kube::runtime::watcher::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("plugin id '{0}' is already registered")]
    PluginRegistration(String),
}
