pub mod config;
pub mod controller;
pub mod error;
pub mod metrics;
pub mod plugin;
pub mod registry;
pub mod store;
pub mod telemetry;
pub mod watch;

pub use config::{ControllerConfig, PluginConfigEntry};
pub use controller::{Controller, ControllerOptions};
pub use error::{ConfigError, ControllerError, PluginError, StoreError};
pub use plugin::{Plugin, PluginDescriptor, PluginHandle};
pub use registry::{Registry, RegistryView};
pub use store::Store;
pub use watch::{DynWatch, WatchHandle};
