//! Group manager
//!
//! Maps stream keys to groups, creates groups on first use, ticks every group
//! once per second and drops groups that have become inactive.
//!
//! A tick can remove an empty group between [`GroupManager::get_or_create`]
//! and the caller's attach. The `attach_*` methods close that window by
//! attaching while the group map is locked; callers that attach directly
//! must retry on [`HubError::Disposed`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::group::StreamGroup;
use super::ingest::IngestHandle;
use super::observer::{GroupObserver, NoopObserver};
use super::stat::GroupStat;
use super::stream_key::StreamKey;
use crate::config::HubConfig;
use crate::error::HubError;
use crate::relay::RelayConnector;
use crate::session::{Consumer, CustomizePubSession, Producer};

pub struct GroupManager {
    groups: Mutex<HashMap<StreamKey, Arc<StreamGroup>>>,
    config: Arc<HubConfig>,
    observer: Arc<dyn GroupObserver>,
    connector: Option<Arc<dyn RelayConnector>>,
    tick_count: AtomicU32,
}

impl GroupManager {
    pub fn new(config: HubConfig) -> Self {
        Self {
            groups: Mutex::new(HashMap::new()),
            config: Arc::new(config),
            observer: Arc::new(NoopObserver),
            connector: None,
            tick_count: AtomicU32::new(0),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn GroupObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_connector(mut self, connector: Arc<dyn RelayConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Existing group for the stream, or a new one
    ///
    /// A new group's run loop is spawned when called inside a tokio runtime.
    /// The returned group may be disposed by a concurrent tick before the
    /// caller attaches to it.
    pub fn get_or_create(&self, app: &str, stream: &str) -> Arc<StreamGroup> {
        let mut groups = self.groups.lock();
        self.entry(&mut groups, StreamKey::new(app, stream))
    }

    /// Attach a producer to the stream's group, creating it if needed
    pub fn attach_producer(
        &self,
        app: &str,
        stream: &str,
        producer: Producer,
    ) -> Result<(Arc<StreamGroup>, IngestHandle), HubError> {
        let mut groups = self.groups.lock();
        let group = self.entry(&mut groups, StreamKey::new(app, stream));
        let handle = group.attach_producer(producer)?;
        Ok((group, handle))
    }

    /// Attach a programmatic producer to the stream's group
    pub fn attach_customize_pub(
        &self,
        app: &str,
        stream: &str,
    ) -> Result<(Arc<StreamGroup>, Arc<CustomizePubSession>), HubError> {
        let mut groups = self.groups.lock();
        let group = self.entry(&mut groups, StreamKey::new(app, stream));
        let session = group.attach_customize_pub()?;
        Ok((group, session))
    }

    /// Attach a consumer to the stream's group, creating it if needed
    pub fn attach_consumer(
        &self,
        app: &str,
        stream: &str,
        consumer: Consumer,
    ) -> Result<Arc<StreamGroup>, HubError> {
        let mut groups = self.groups.lock();
        let group = self.entry(&mut groups, StreamKey::new(app, stream));
        group.attach_consumer(consumer)?;
        Ok(group)
    }

    fn entry(
        &self,
        groups: &mut HashMap<StreamKey, Arc<StreamGroup>>,
        key: StreamKey,
    ) -> Arc<StreamGroup> {
        if let Some(group) = groups.get(&key) {
            if !group.is_disposed() {
                return Arc::clone(group);
            }
            tracing::debug!(stream = %key, group = %group.unique_key(), "Disposed group replaced");
        }

        let group = StreamGroup::new(
            key.clone(),
            Arc::clone(&self.config),
            Arc::clone(&self.observer),
            self.connector.clone(),
        );
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let run = Arc::clone(&group);
            runtime.spawn(async move { run.run_loop().await });
        }
        groups.insert(key, Arc::clone(&group));
        group
    }

    pub fn find(&self, app: &str, stream: &str) -> Option<Arc<StreamGroup>> {
        self.groups.lock().get(&StreamKey::new(app, stream)).cloned()
    }

    pub fn group_count(&self) -> usize {
        self.groups.lock().len()
    }

    /// Dispose inactive groups and tick the rest
    pub fn tick(&self, tick: u32) {
        let mut live = Vec::new();
        {
            let mut groups = self.groups.lock();
            groups.retain(|key, group| {
                if group.is_inactive() {
                    tracing::info!(stream = %key, group = %group.unique_key(), "Group removed (inactive)");
                    group.dispose();
                    false
                } else {
                    live.push(Arc::clone(group));
                    true
                }
            });
        }
        for group in live {
            group.tick(tick);
        }
    }

    /// Advance the internal tick counter by one and run [`GroupManager::tick`]
    pub fn tick_once(&self) -> u32 {
        let tick = self.tick_count.fetch_add(1, Ordering::Relaxed) + 1;
        self.tick(tick);
        tick
    }

    /// Spawn the once-per-second tick task
    ///
    /// Returns a handle that can be used to abort the task.
    pub fn spawn_ticker(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                manager.tick_once();
            }
        })
    }

    pub fn stats(&self, max_per_family: usize) -> Vec<GroupStat> {
        let groups: Vec<_> = self.groups.lock().values().cloned().collect();
        groups.iter().map(|g| g.get_stat(max_per_family)).collect()
    }

    pub fn dispose_all(&self) {
        let groups: Vec<_> = self.groups.lock().drain().map(|(_, g)| g).collect();
        for group in groups {
            group.dispose();
        }
    }
}

impl std::fmt::Debug for GroupManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupManager")
            .field("groups", &self.group_count())
            .finish()
    }
}
