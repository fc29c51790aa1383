use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use kube::runtime::watcher::{self, Event};
use kube::{Api, Resource};
use serde::de::DeserializeOwned;
use tokio::time::timeout;

/// Object-safe handle so a plugin's heterogeneous watches (Pods here,
/// CustomResource there) can live together in one `Vec<Box<dyn DynWatch>>`.
///
/// `advance` is the only operation the scheduler needs: pull events off the
/// underlying watch stream for up to `budget`, dispatching each to its
/// callback as it arrives, and return once the budget is spent or the
/// stream falls idle.
#[async_trait]
pub trait DynWatch: Send {
    async fn advance(&mut self, budget: Duration) -> Result<(), watcher::Error>;
}

/// A single watch on resources of kind `K`, paired with the callback that
/// consumes its events.
///
/// The callback runs synchronously on the scheduler's own task while
/// `advance` is polling -- there is no other task it could run on, so
/// whatever it mutates is safe to touch without further synchronization
/// from the scheduler's point of view. Callbacks that share state with a
/// plugin's own hooks still need interior mutability, since the handle and
/// the plugin both hold a reference to it.
pub struct WatchHandle<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    stream: BoxStream<'static, Result<Event<K>, watcher::Error>>,
    callback: Box<dyn FnMut(Event<K>) + Send>,
}

impl<K> WatchHandle<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    pub fn new(
        api: Api<K>,
        config: watcher::Config,
        callback: impl FnMut(Event<K>) + Send + 'static,
    ) -> Self {
        Self {
            stream: kube::runtime::watcher(api, config).boxed(),
            callback: Box::new(callback),
        }
    }
}

#[async_trait]
impl<K> DynWatch for WatchHandle<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    async fn advance(&mut self, budget: Duration) -> Result<(), watcher::Error> {
        drive(&mut self.stream, &mut self.callback, budget).await
    }
}

/// Pulls events off `stream` for up to `budget`, dispatching each to
/// `callback`, returning as soon as the budget is exhausted or the stream
/// goes idle (or ends). Factored out of [`WatchHandle`] so the budgeted
/// pull logic can be exercised directly in tests against a plain stream.
async fn drive<K>(
    stream: &mut BoxStream<'static, Result<Event<K>, watcher::Error>>,
    callback: &mut (dyn FnMut(Event<K>) + Send),
    budget: Duration,
) -> Result<(), watcher::Error> {
    let deadline = tokio::time::Instant::now() + budget;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return Ok(());
        }
        match timeout(remaining, stream.next()).await {
            Err(_elapsed) => return Ok(()),
            Ok(None) => return Ok(()),
            Ok(Some(Err(e))) => return Err(e),
            Ok(Some(Ok(event))) => callback(event),
        }
    }
}
