use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::{counter::Counter, family::Family, histogram::Histogram};
use prometheus_client::registry::Registry;
use tokio::time::Instant;

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug, Default)]
pub struct PluginLabel {
    pub plugin_id: String,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug, Default)]
pub struct PluginActionLabel {
    pub plugin_id: String,
    pub success: bool,
}

/// Metrics for the controller's own scheduler loop, separate from the
/// per-request metrics [`kite_k8s_util::metrics::MetricsLayer`] attaches to
/// the Kubernetes client.
pub struct ControllerMetrics {
    tick_duration: Histogram,
    actions_total: Family<PluginActionLabel, Counter>,
    action_duration: Family<PluginLabel, Histogram>,
    active_plugins: Family<PluginLabel, Counter>,
}

impl ControllerMetrics {
    pub fn new(registry: &mut Registry) -> Self {
        let tick_duration = Histogram::new([0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0].into_iter());
        let actions_total = Family::<PluginActionLabel, Counter>::default();
        let action_duration = Family::<PluginLabel, Histogram>::new_with_constructor(|| {
            Histogram::new([0.001, 0.01, 0.1, 1.0, 10.0].into_iter())
        });
        let active_plugins = Family::<PluginLabel, Counter>::default();

        registry.register(
            "kite_tick_duration_seconds",
            "Time spent in a single controller scheduler tick.",
            tick_duration.clone(),
        );
        registry.register(
            "kite_plugin_actions_total",
            "Number of times a plugin's do_action was invoked, by outcome.",
            actions_total.clone(),
        );
        registry.register(
            "kite_plugin_action_duration_seconds",
            "Time spent inside a plugin's do_action.",
            action_duration.clone(),
        );
        registry.register(
            "kite_plugin_active",
            "Whether a plugin is currently constructed (1) or not (0); incremented on construction.",
            active_plugins.clone(),
        );

        Self {
            tick_duration,
            actions_total,
            action_duration,
            active_plugins,
        }
    }

    pub fn observe_tick(&self, duration: std::time::Duration) {
        self.tick_duration.observe(duration.as_secs_f64());
    }

    pub fn plugin_activated(&self, plugin_id: &str) {
        self.active_plugins
            .get_or_create(&PluginLabel {
                plugin_id: plugin_id.to_string(),
            })
            .inc();
    }

    pub fn record_action(&self, plugin_id: &str, success: bool, duration: std::time::Duration) {
        self.actions_total
            .get_or_create(&PluginActionLabel {
                plugin_id: plugin_id.to_string(),
                success,
            })
            .inc();
        self.action_duration
            .get_or_create(&PluginLabel {
                plugin_id: plugin_id.to_string(),
            })
            .observe(duration.as_secs_f64());
    }

    pub fn measure_action(&self, plugin_id: &str) -> ActionMeasurer<'_> {
        ActionMeasurer {
            metrics: self,
            plugin_id: plugin_id.to_string(),
            start: Instant::now(),
            success: false,
        }
    }
}

/// Records a plugin action's duration and outcome when dropped, mirroring
/// how a deferred stopwatch is used around a reconcile call: set `success`
/// once you know it, then let the drop record the metric.
pub struct ActionMeasurer<'a> {
    metrics: &'a ControllerMetrics,
    plugin_id: String,
    start: Instant,
    pub success: bool,
}

impl Drop for ActionMeasurer<'_> {
    fn drop(&mut self) {
        self.metrics
            .record_action(&self.plugin_id, self.success, self.start.elapsed());
    }
}
