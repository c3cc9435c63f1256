// Shared harness: a simulated cluster, an in-memory queue and a tracker
// wired into one run context.
#![allow(dead_code)]

use std::sync::Arc;

use fleet_provisioner::config::{generate_default_config, ProjectSettings, Settings, TimeoutSettings};
use fleet_provisioner::core::queue::{InMemoryQueueStore, QueueItem, QueueStore};
use fleet_provisioner::core::simulator::SimulatedCluster;
use fleet_provisioner::monitoring::tracker::TaskEntry;
use fleet_provisioner::monitoring::{EventBus, TaskTracker, TracingSink};
use fleet_provisioner::provision::{
    CancellationFlag, CloudInitPayloadBuilder, ProvisioningPipeline, RunContext, RunSummary,
    SequentialIdentityPatcher,
};

pub const TEMPLATE_ID: u32 = 9000;

pub fn test_settings() -> Settings {
    let mut settings = generate_default_config();
    settings.timeouts = TimeoutSettings::fast();
    settings.storage.enabled = vec!["local-lvm".to_string()];
    settings.projects.insert(
        "wow_tbc".to_string(),
        ProjectSettings {
            cores: Some(4),
            memory: Some(8192),
            profile_id: Some("wow-tbc".to_string()),
            ..Default::default()
        },
    );
    settings
}

pub fn test_cluster() -> SimulatedCluster {
    SimulatedCluster::new("pve")
        .with_template(TEMPLATE_ID, 2, 4096, 64)
        .with_pool("local-lvm", 500)
}

pub struct Harness {
    pub store: Arc<InMemoryQueueStore>,
    pub cluster: Arc<SimulatedCluster>,
    pub tracker: Arc<TaskTracker>,
    pub cancel: CancellationFlag,
    pub settings: Arc<Settings>,
}

impl Harness {
    pub fn new(cluster: SimulatedCluster, items: Vec<QueueItem>) -> Self {
        Self::with_settings(cluster, items, test_settings())
    }

    pub fn with_settings(cluster: SimulatedCluster, items: Vec<QueueItem>, settings: Settings) -> Self {
        Self {
            store: Arc::new(InMemoryQueueStore::with_items(items)),
            cluster: Arc::new(cluster),
            tracker: Arc::new(TaskTracker::default()),
            cancel: CancellationFlag::new(),
            settings: Arc::new(settings),
        }
    }

    pub fn context(&self) -> RunContext {
        RunContext {
            store: self.store.clone(),
            gateway: self.cluster.clone(),
            settings: self.settings.clone(),
            cancel: self.cancel.clone(),
            events: EventBus::new()
                .with_sink(Arc::new(TracingSink))
                .with_sink(self.tracker.clone()),
            identity: Arc::new(SequentialIdentityPatcher::default()),
            iso: Arc::new(CloudInitPayloadBuilder::default()),
        }
    }

    pub async fn run(&self) -> RunSummary {
        ProvisioningPipeline::new(self.context()).run().await
    }

    pub async fn item(&self, id: &str) -> QueueItem {
        self.store
            .get(id)
            .await
            .unwrap_or_else(|| panic!("queue item {id} missing"))
    }

    /// Rows of the named table in an item's task log, latest first match.
    pub fn table(&self, item_id: &str, title: &str) -> Option<Vec<(String, String)>> {
        let record = self.tracker.task(item_id)?;
        record.entries.into_iter().rev().find_map(|entry| match entry {
            TaskEntry::Table { title: t, rows, .. } if t == title => Some(rows),
            _ => None,
        })
    }
}
