use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube::Client;
use tokio::sync::Mutex;

use crate::error::PluginError;
use crate::registry::RegistryView;
use crate::store::Store;
use crate::watch::DynWatch;

/// The six lifecycle and scheduling hooks a plugin implements.
///
/// Only `do_action` is required; the rest default to no-ops, mirroring how
/// little most plugins need to override. A plugin is constructed fresh
/// every time its configuration (re)appears and is dropped, via `deinit`,
/// the moment that configuration disappears or changes -- there is no
/// partial-update path, so implementations can treat their own fields as
/// fixed for the instance's whole lifetime.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Called once right after construction, before the plugin is ever
    /// scheduled. Watches the plugin wants advanced on its behalf should be
    /// registered here via [`PluginHandle::add_watch`].
    async fn init(&mut self, _handle: &PluginHandle) -> Result<(), PluginError> {
        Ok(())
    }

    /// Called once when the plugin is about to be dropped, either because
    /// its configuration was removed or because the controller is
    /// shutting down. No further hooks are called afterwards.
    async fn deinit(&mut self) {}

    /// Runs before this tick's watches are advanced.
    async fn pre_read_watches(&mut self) {}

    /// Runs after this tick's watches are advanced, and after any events
    /// from them have been dispatched to this plugin's watch callbacks.
    async fn post_read_watches(&mut self) {}

    /// Performs the plugin's reconciling action. Returns whether it
    /// succeeded; a `false` return leaves `action_required` latched so the
    /// scheduler retries after the configured failure back-off.
    async fn do_action(&mut self) -> bool;

    /// Minimum time the scheduler waits after `action_required` is first
    /// latched before calling `do_action`, letting a burst of watch events
    /// settle into one action instead of many.
    fn settle_time(&self) -> Duration {
        Duration::ZERO
    }

    /// Minimum time the scheduler waits between successive `do_action`
    /// calls for this plugin, regardless of how many times
    /// `action_required` is re-latched in between.
    fn throttle_time(&self) -> Duration {
        Duration::ZERO
    }

    /// Minimum time the scheduler waits after a failed `do_action` before
    /// retrying it.
    fn failed_action_wait_time(&self) -> Duration {
        Duration::from_secs(30)
    }
}

/// Registers a plugin implementation under a stable id so the controller
/// can construct it on demand as plugin configuration comes and goes.
pub struct PluginDescriptor {
    pub id: &'static str,
    pub factory: fn(PluginHandle) -> Box<dyn Plugin>,
}

/// Everything a plugin instance needs from the controller: its own decoded
/// settings, a Kubernetes client, the shared store and registry, and a way
/// to register watches the scheduler will advance on its behalf.
#[derive(Clone)]
pub struct PluginHandle {
    pub(crate) plugin_id: String,
    pub(crate) settings: serde_json::Value,
    pub(crate) client: Client,
    pub(crate) store: Option<Arc<Store>>,
    pub(crate) registry: RegistryView,
    pub(crate) watches: Arc<Mutex<Vec<Box<dyn DynWatch>>>>,
    pub(crate) scheduler_state: Arc<Mutex<PluginSchedulerState>>,
}

impl PluginHandle {
    pub fn id(&self) -> &str {
        &self.plugin_id
    }

    /// This plugin's own settings object, as written under
    /// `plugins.<id>` in the controller config (minus `enabled`).
    pub fn settings(&self) -> &serde_json::Value {
        &self.settings
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn registry(&self) -> &RegistryView {
        &self.registry
    }

    /// Registers a watch the scheduler will advance once per tick, before
    /// calling `post_read_watches`. Typically called from `init`.
    pub async fn add_watch(&self, watch: Box<dyn DynWatch>) {
        self.watches.lock().await.push(watch);
    }

    /// Reads a value this plugin previously saved via [`Self::save_store`].
    /// Returns `None` if the store is disabled or unset for this key.
    pub async fn get_store(&self, key: &str) -> Option<serde_json::Value> {
        let store = self.store.as_ref()?;
        store.get(&self.namespaced_key(key))
    }

    /// Persists a value into the shared store under a key namespaced to
    /// this plugin, so two plugins can't collide on the same key.
    pub async fn save_store(
        &self,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), crate::error::StoreError> {
        let store = self
            .store
            .as_ref()
            .ok_or(crate::error::StoreError::NotInitialized)?;
        store.set(self.namespaced_key(key), value).await
    }

    fn namespaced_key(&self, key: &str) -> String {
        format!("{}/{}", self.plugin_id, key)
    }

    /// Marks this plugin as needing `do_action` called. Idempotent while
    /// already latched: `action_required_time` only moves on the rising
    /// edge, so a burst of calls settles to one action, not one per call.
    pub async fn mark_action_required(&self, now: DateTime<Utc>) {
        self.scheduler_state.lock().await.mark_action_required(now);
    }

    /// Logs an event tagged with this plugin's id, so operators can filter
    /// `tracing` output by plugin without every plugin repeating the field.
    pub fn log_event(&self, message: &str) {
        tracing::info!(plugin = %self.plugin_id, "{message}");
    }
}

/// Tracks everything the reconcile scheduler needs to decide, each tick,
/// whether a plugin's `do_action` should run.
#[derive(Debug, Clone)]
pub struct PluginSchedulerState {
    pub action_required: bool,
    pub action_required_time: Option<DateTime<Utc>>,
    pub last_action_attempt_time: Option<DateTime<Utc>>,
    pub last_action_success_time: Option<DateTime<Utc>>,
    pub last_action_fail_time: Option<DateTime<Utc>>,
    pub last_action_success: bool,
}

impl Default for PluginSchedulerState {
    fn default() -> Self {
        Self {
            action_required: false,
            action_required_time: None,
            last_action_attempt_time: None,
            last_action_success_time: None,
            last_action_fail_time: None,
            last_action_success: true,
        }
    }
}

impl PluginSchedulerState {
    pub fn mark_action_required(&mut self, now: DateTime<Utc>) {
        if !self.action_required {
            self.action_required = true;
            self.action_required_time = Some(now);
        }
    }

    /// Whether the scheduler should call `do_action` for this plugin right
    /// now, given its settle/throttle/failure-backoff gates.
    pub fn should_act(
        &self,
        now: DateTime<Utc>,
        settle: Duration,
        throttle: Duration,
        failed_wait: Duration,
    ) -> bool {
        if !self.action_required {
            return false;
        }

        if !self.last_action_success {
            if let Some(t) = self.last_action_attempt_time {
                if elapsed(now, t) <= failed_wait {
                    return false;
                }
            }
        }

        if !settle.is_zero() {
            match self.action_required_time {
                Some(t) if elapsed(now, t) <= settle => return false,
                None => return false,
                _ => {}
            }
        }

        if !throttle.is_zero() {
            if let Some(t) = self.last_action_attempt_time {
                if elapsed(now, t) <= throttle {
                    return false;
                }
            }
        }

        true
    }

    pub fn record_attempt(&mut self, now: DateTime<Utc>) {
        self.last_action_attempt_time = Some(now);
    }

    pub fn record_result(&mut self, now: DateTime<Utc>, success: bool) {
        self.last_action_success = success;
        if success {
            self.action_required = false;
            self.last_action_success_time = Some(now);
        } else {
            self.last_action_fail_time = Some(now);
        }
    }
}

fn elapsed(now: DateTime<Utc>, since: DateTime<Utc>) -> Duration {
    now.signed_duration_since(since)
        .to_std()
        .unwrap_or(Duration::ZERO)
}

/// Invokes `plugin.do_action()` and folds the result back into `state`,
/// recording the attempt before the call so a `do_action` that itself
/// checks `last_action_attempt_time` sees the current attempt, not the
/// previous one.
pub async fn invoke_action(
    plugin: &mut dyn Plugin,
    state: &Mutex<PluginSchedulerState>,
    now: DateTime<Utc>,
) {
    {
        let mut s = state.lock().await;
        s.record_attempt(now);
    }
    let success = plugin.do_action().await;
    state.lock().await.record_result(now, success);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(seconds, 0).unwrap()
    }

    #[test]
    fn inactive_plugin_never_acts() {
        let state = PluginSchedulerState::default();
        assert!(!state.should_act(at(100), Duration::ZERO, Duration::ZERO, Duration::ZERO));
    }

    #[test]
    fn re_latching_while_already_required_does_not_move_the_clock() {
        let mut state = PluginSchedulerState::default();
        state.mark_action_required(at(10));
        state.mark_action_required(at(20));
        assert_eq!(state.action_required_time, Some(at(10)));
    }

    #[test]
    fn settle_gate_blocks_until_elapsed() {
        let mut state = PluginSchedulerState::default();
        state.mark_action_required(at(0));
        let settle = Duration::from_secs(5);
        assert!(!state.should_act(at(3), settle, Duration::ZERO, Duration::ZERO));
        assert!(state.should_act(at(6), settle, Duration::ZERO, Duration::ZERO));
    }

    #[test]
    fn throttle_gate_blocks_repeat_actions() {
        let mut state = PluginSchedulerState::default();
        state.mark_action_required(at(0));
        state.record_attempt(at(0));
        state.record_result(at(0), true);
        state.mark_action_required(at(1));

        let throttle = Duration::from_secs(10);
        assert!(!state.should_act(at(5), Duration::ZERO, throttle, Duration::ZERO));
        assert!(state.should_act(at(11), Duration::ZERO, throttle, Duration::ZERO));
    }

    #[test]
    fn failed_action_backs_off_before_retry() {
        let mut state = PluginSchedulerState::default();
        state.mark_action_required(at(0));
        state.record_attempt(at(0));
        state.record_result(at(0), false);
        assert!(state.action_required, "failed action stays latched");

        let failed_wait = Duration::from_secs(30);
        assert!(!state.should_act(at(10), Duration::ZERO, Duration::ZERO, failed_wait));
        assert!(state.should_act(at(31), Duration::ZERO, Duration::ZERO, failed_wait));
    }

    #[test]
    fn success_clears_required_but_keeps_required_time_untouched_on_failure() {
        let mut state = PluginSchedulerState::default();
        state.mark_action_required(at(0));
        state.record_attempt(at(0));
        state.record_result(at(0), false);
        assert_eq!(state.action_required_time, Some(at(0)));
        assert!(state.action_required);

        state.record_attempt(at(40));
        state.record_result(at(40), true);
        assert!(!state.action_required);
    }
}
