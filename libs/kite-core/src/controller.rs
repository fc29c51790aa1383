use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::runtime::watcher::{self, Event};
use kube::{Api, Client};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::{parse_controller_config, ControllerConfig};
use crate::error::ControllerError;
use crate::metrics::ControllerMetrics;
use crate::plugin::{invoke_action, Plugin, PluginDescriptor, PluginHandle, PluginSchedulerState};
use crate::registry::Registry;
use crate::store::Store;
use crate::watch::{DynWatch, WatchHandle};

/// Construction-time options for a [`Controller`]; see `spec.md` §6.
pub struct ControllerOptions {
    pub controller_id: String,
    pub config_map_namespace: String,
    pub config_map_name: String,
    pub store_enabled: bool,
    pub store_namespace: String,
    pub store_name: String,
}

enum ConfigEvent {
    Loaded(ControllerConfig),
    Unloaded,
}

struct PluginRuntime {
    id: String,
    plugin: Box<dyn Plugin>,
    state: Arc<Mutex<PluginSchedulerState>>,
    watches: Arc<Mutex<Vec<Box<dyn DynWatch>>>>,
}

/// Orchestrates the config watch, the store, and the set of active plugins.
/// See `spec.md` §4.1 for the tick contract this implements.
pub struct Controller {
    client: Client,
    controller_id: String,
    store_enabled: bool,
    store_namespace: String,
    store_name: String,
    store: Option<Arc<Store>>,
    registered: Vec<PluginDescriptor>,
    active: Vec<PluginRuntime>,
    config: Option<ControllerConfig>,
    config_pending: Arc<StdMutex<Option<ConfigEvent>>>,
    config_watch: WatchHandle<ConfigMap>,
    registry: Registry,
    metrics: Arc<ControllerMetrics>,
    stop: Arc<AtomicBool>,
}

impl Controller {
    pub fn new(client: Client, options: ControllerOptions, metrics: Arc<ControllerMetrics>) -> Self {
        let config_pending: Arc<StdMutex<Option<ConfigEvent>>> = Arc::new(StdMutex::new(None));
        let cm_api: Api<ConfigMap> = Api::namespaced(client.clone(), &options.config_map_namespace);

        let pending_for_callback = config_pending.clone();
        let namespace_for_callback = options.config_map_namespace.clone();
        let name_for_callback = options.config_map_name.clone();
        let config_watch = WatchHandle::new(
            cm_api,
            watcher::Config::default().fields(&format!("metadata.name={}", options.config_map_name)),
            move |event| {
                stage_config_event(
                    &pending_for_callback,
                    &namespace_for_callback,
                    &name_for_callback,
                    event,
                )
            },
        );

        Self {
            client,
            controller_id: options.controller_id,
            store_enabled: options.store_enabled,
            store_namespace: options.store_namespace,
            store_name: options.store_name,
            store: None,
            registered: Vec::new(),
            active: Vec::new(),
            config: None,
            config_pending,
            config_watch,
            registry: Registry::new(),
            metrics,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Registers a plugin implementation under its descriptor's id. Must be
    /// called before [`Self::run`]; a duplicate id is a registration error,
    /// raised synchronously rather than discovered later at config load.
    pub fn register_plugin(&mut self, descriptor: PluginDescriptor) -> Result<(), ControllerError> {
        if self.registered.iter().any(|d| d.id == descriptor.id) {
            return Err(ControllerError::PluginRegistration(descriptor.id.to_string()));
        }
        self.registered.push(descriptor);
        Ok(())
    }

    pub fn set_registry_item(&self, key: impl Into<String>, value: Arc<dyn Any + Send + Sync>) {
        self.registry.set(key, value);
    }

    pub fn get_registry_item(&self, key: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.registry.get(key)
    }

    pub fn is_config_loaded(&self) -> bool {
        self.config.is_some()
    }

    pub fn active_plugin_ids(&self) -> Vec<String> {
        self.active.iter().map(|r| r.id.clone()).collect()
    }

    /// Runs the main loop until a termination signal arrives or a fatal
    /// cluster API error propagates out of a tick.
    pub async fn run(&mut self) -> Result<(), ControllerError> {
        let stop = self.stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                stop.store(true, Ordering::SeqCst);
            }
        });

        let result = self.run_loop().await;
        self.deinit_all_active_plugins().await;
        result
    }

    async fn run_loop(&mut self) -> Result<(), ControllerError> {
        loop {
            if self.stop.load(Ordering::SeqCst) {
                tracing::info!(controller_id = %self.controller_id, "termination signal received, shutting down");
                return Ok(());
            }

            let tick_start = Instant::now();
            self.tick().await?;
            self.metrics.observe_tick(tick_start.elapsed());
        }
    }

    /// Runs a single tick. Exposed so tests can drive the controller
    /// deterministically against a mocked client without going through the
    /// SIGINT-handling `run` loop.
    pub async fn tick(&mut self) -> Result<(), ControllerError> {
        // 1. bound CPU use when idle.
        tokio::time::sleep(Duration::from_millis(100)).await;

        // 2. advance the config watch; a staged event (if any) is applied
        // before plugin iteration below, per the ordering guarantee in
        // spec.md §5.
        self.config_watch.advance(Duration::from_secs(1)).await?;
        self.apply_pending_config_event().await;

        // 3. nothing to do until config has loaded at least once.
        if self.config.is_none() {
            tracing::info!(controller_id = %self.controller_id, "waiting for controller config");
            tokio::time::sleep(Duration::from_secs(5)).await;
            return Ok(());
        }

        // 4. the store, if enabled, must finish its initial load before
        // plugin work proceeds. An init attempt always defers plugin work to
        // the next tick, whether it succeeds or fails, mirroring step 3's
        // wait-for-config behavior.
        if self.store_enabled && self.store.is_none() {
            match Store::init(
                self.client.clone(),
                self.store_namespace.clone(),
                self.store_name.clone(),
            )
            .await
            {
                Ok(store) => {
                    tracing::info!(controller_id = %self.controller_id, "store initialized");
                    self.store = Some(store);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "store initialization failed, retrying");
                }
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
            return Ok(());
        }

        // 5. refresh the store's cache ahead of plugin work.
        if let Some(store) = &self.store {
            store.advance(Duration::from_secs(1)).await?;
        }

        // 6. service every active plugin, in registration order.
        let now = Utc::now();
        for runtime in &mut self.active {
            runtime.plugin.pre_read_watches().await;

            {
                let mut watches = runtime.watches.lock().await;
                for watch in watches.iter_mut() {
                    watch.advance(Duration::from_secs(1)).await?;
                }
            }

            runtime.plugin.post_read_watches().await;

            let should_act = {
                let state = runtime.state.lock().await;
                state.should_act(
                    now,
                    runtime.plugin.settle_time(),
                    runtime.plugin.throttle_time(),
                    runtime.plugin.failed_action_wait_time(),
                )
            };

            if should_act {
                let mut measurer = self.metrics.measure_action(&runtime.id);
                invoke_action(runtime.plugin.as_mut(), &runtime.state, now).await;
                measurer.success = runtime.state.lock().await.last_action_success;
            }
        }

        // 7. a post-action drain so a write made during doAction is
        // reflected before the next tick's predicate evaluation.
        if let Some(store) = &self.store {
            store.advance(Duration::from_secs(1)).await?;
        }

        Ok(())
    }

    async fn apply_pending_config_event(&mut self) {
        let event = self.config_pending.lock().expect("config pending lock poisoned").take();
        let Some(event) = event else { return };
        match event {
            ConfigEvent::Loaded(cfg) => self.on_config_loaded(cfg).await,
            ConfigEvent::Unloaded => self.on_config_unloaded().await,
        }
    }

    async fn on_config_loaded(&mut self, config: ControllerConfig) {
        self.deinit_all_active_plugins().await;
        let enabled = config.enabled;
        self.controller_id = config
            .controller_id
            .clone()
            .unwrap_or_else(|| self.controller_id.clone());
        self.config = Some(config.clone());

        if !enabled {
            tracing::info!(controller_id = %self.controller_id, "controller config is disabled, no plugins active");
            return;
        }

        for (plugin_id, entry) in &config.plugins {
            if !entry.enabled {
                continue;
            }
            let Some(descriptor) = self.registered.iter().find(|d| d.id == plugin_id) else {
                tracing::warn!(plugin_id = %plugin_id, "no registered plugin for config entry, skipping");
                continue;
            };

            let state = Arc::new(Mutex::new(PluginSchedulerState::default()));
            let watches = Arc::new(Mutex::new(Vec::new()));
            let handle = PluginHandle {
                plugin_id: plugin_id.clone(),
                settings: entry.settings.clone(),
                client: self.client.clone(),
                store: self.store.clone(),
                registry: self.registry.view(),
                watches: watches.clone(),
                scheduler_state: state.clone(),
            };

            let mut plugin = (descriptor.factory)(handle.clone());
            if let Err(e) = plugin.init(&handle).await {
                tracing::warn!(plugin_id = %plugin_id, error = %e, "plugin failed to initialize, skipping");
                continue;
            }

            self.metrics.plugin_activated(plugin_id);
            self.active.push(PluginRuntime {
                id: plugin_id.clone(),
                plugin,
                state,
                watches,
            });
        }
    }

    async fn on_config_unloaded(&mut self) {
        self.deinit_all_active_plugins().await;
        self.config = None;
    }

    async fn deinit_all_active_plugins(&mut self) {
        for mut runtime in self.active.drain(..) {
            runtime.plugin.deinit().await;
        }
    }
}

fn stage_config_event(
    pending: &Arc<StdMutex<Option<ConfigEvent>>>,
    namespace: &str,
    name: &str,
    event: Event<ConfigMap>,
) {
    let staged = match event {
        Event::Applied(cm) => match parse_controller_config(namespace, name, &cm) {
            Ok(cfg) => Some(ConfigEvent::Loaded(cfg)),
            Err(e) => {
                tracing::warn!(error = %e, "failed to decode controller config, ignoring event");
                None
            }
        },
        Event::Deleted(_) => Some(ConfigEvent::Unloaded),
        Event::Restarted(list) => match list.last() {
            Some(cm) => match parse_controller_config(namespace, name, cm) {
                Ok(cfg) => Some(ConfigEvent::Loaded(cfg)),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to decode controller config, ignoring event");
                    None
                }
            },
            None => Some(ConfigEvent::Unloaded),
        },
    };

    if let Some(event) = staged {
        *pending.lock().expect("config pending lock poisoned") = Some(event);
    }
}
