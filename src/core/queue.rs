use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::errors::{FleetResult, QueueError};

// The queue: one row per requested mutation to the fleet.

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueAction {
    #[default]
    Create,
    Delete,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    #[default]
    Pending,
    Deleting,
    Cloning,
    Cloned,
    Configuring,
    Provisioning,
    Done,
    Error,
}

impl QueueStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, QueueStatus::Done | QueueStatus::Error)
    }

    /// Position in the lifecycle of `action`. `None` means the status does
    /// not belong to that lifecycle at all.
    fn rank(self, action: QueueAction) -> Option<u8> {
        match (action, self) {
            (_, QueueStatus::Pending) => Some(0),
            (QueueAction::Delete, QueueStatus::Deleting) => Some(1),
            (QueueAction::Delete, QueueStatus::Done) => Some(2),
            (QueueAction::Create, QueueStatus::Cloning) => Some(1),
            (QueueAction::Create, QueueStatus::Cloned) => Some(2),
            (QueueAction::Create, QueueStatus::Configuring) => Some(3),
            (QueueAction::Create, QueueStatus::Provisioning) => Some(4),
            (QueueAction::Create, QueueStatus::Done) => Some(5),
            _ => None,
        }
    }

    /// Forward-only transitions; `error` is reachable from any non-terminal
    /// state. Re-asserting the current status is allowed.
    pub fn can_transition(self, to: QueueStatus, action: QueueAction) -> bool {
        if self == to {
            return true;
        }
        if self.is_terminal() {
            return false;
        }
        if to == QueueStatus::Error {
            return true;
        }
        match (self.rank(action), to.rank(action)) {
            (Some(from), Some(next)) => next > from,
            _ => false,
        }
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Deleting => "deleting",
            QueueStatus::Cloning => "cloning",
            QueueStatus::Cloned => "cloned",
            QueueStatus::Configuring => "configuring",
            QueueStatus::Provisioning => "provisioning",
            QueueStatus::Done => "done",
            QueueStatus::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    #[default]
    Auto,
    Manual,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceMode {
    /// Keep whatever the template carries right now.
    #[default]
    Original,
    /// Use the project preset.
    Project,
    /// Use the values on the item itself.
    Custom,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub id: String,
    #[serde(default)]
    pub action: QueueAction,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: QueueStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_vm_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_mode: Option<StorageMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_mode: Option<ResourceMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cores: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_gib: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QueueItem {
    pub fn create(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            action: QueueAction::Create,
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn delete(target_vm_id: u32, name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            action: QueueAction::Delete,
            name: name.into(),
            target_vm_id: Some(i64::from(target_vm_id)),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn with_resources(mut self, mode: ResourceMode) -> Self {
        self.resource_mode = Some(mode);
        self
    }

    pub fn with_storage(mut self, mode: StorageMode, storage: Option<&str>) -> Self {
        self.storage_mode = Some(mode);
        self.storage = storage.map(str::to_string);
        self
    }

    pub fn storage_mode(&self) -> StorageMode {
        self.storage_mode.unwrap_or_default()
    }

    pub fn resource_mode(&self) -> ResourceMode {
        self.resource_mode.unwrap_or_default()
    }

    /// A delete target is valid only when it is a positive id that fits the
    /// hypervisor's id space.
    pub fn valid_target(&self) -> Option<u32> {
        self.target_vm_id
            .filter(|id| *id > 0)
            .and_then(|id| u32::try_from(id).ok())
    }

    /// Checks the shape invariants of a freshly enqueued item.
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.id.trim().is_empty() {
            return Err(QueueError::Invalid("item id must not be empty".into()));
        }
        if self.action == QueueAction::Delete {
            check_delete_fields(&self.id, self.storage.is_some(), self.format.is_some(), self.has_resource_fields())?;
        }
        Ok(())
    }

    fn has_resource_fields(&self) -> bool {
        self.resource_mode.is_some()
            || self.cores.is_some()
            || self.memory.is_some()
            || self.disk_gib.is_some()
    }

    /// Applies `update` after checking every invariant; on error the item is
    /// left untouched.
    pub fn apply(&mut self, update: &ItemUpdate) -> Result<(), QueueError> {
        if let Some(to) = update.status {
            if !self.status.can_transition(to, self.action) {
                return Err(QueueError::IllegalTransition {
                    id: self.id.clone(),
                    from: self.status,
                    to,
                });
            }
        }
        if let (Some(current), Some(requested)) = (self.vm_id, update.vm_id) {
            if current != requested {
                return Err(QueueError::VmIdReassigned {
                    id: self.id.clone(),
                    current,
                    requested,
                });
            }
        }
        if self.action == QueueAction::Delete {
            check_delete_fields(
                &self.id,
                update.storage.is_some() || update.storage_mode.is_some(),
                update.format.is_some(),
                update.cores.is_some() || update.memory.is_some() || update.disk_gib.is_some(),
            )?;
        }

        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(name) = &update.name {
            self.name = name.clone();
        }
        if let Some(vm_id) = update.vm_id {
            self.vm_id = Some(vm_id);
        }
        if let Some(storage) = &update.storage {
            self.storage = Some(storage.clone());
        }
        if let Some(mode) = update.storage_mode {
            self.storage_mode = Some(mode);
        }
        if let Some(format) = &update.format {
            self.format = Some(format.clone());
        }
        if let Some(cores) = update.cores {
            self.cores = Some(cores);
        }
        if let Some(memory) = update.memory {
            self.memory = Some(memory);
        }
        if let Some(disk) = update.disk_gib {
            self.disk_gib = Some(disk);
        }
        if let Some(ip) = &update.ip {
            self.ip = Some(ip.clone());
        }
        if let Some(uuid) = &update.uuid {
            self.uuid = Some(uuid.clone());
        }
        match &update.error {
            Some(message) => self.error = Some(message.clone()),
            None if update.clear_error => self.error = None,
            None => {}
        }
        Ok(())
    }
}

fn check_delete_fields(id: &str, storage: bool, format: bool, resources: bool) -> Result<(), QueueError> {
    let field = if storage {
        "storage"
    } else if format {
        "format"
    } else if resources {
        "resource fields"
    } else {
        return Ok(());
    };
    Err(QueueError::DeleteItemField {
        id: id.to_string(),
        field,
    })
}

/// Partial update for one queue item. `id` is deliberately absent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemUpdate {
    pub status: Option<QueueStatus>,
    pub name: Option<String>,
    pub vm_id: Option<u32>,
    pub storage: Option<String>,
    pub storage_mode: Option<StorageMode>,
    pub format: Option<String>,
    pub cores: Option<u32>,
    pub memory: Option<u64>,
    pub disk_gib: Option<u64>,
    pub ip: Option<String>,
    pub uuid: Option<String>,
    pub error: Option<String>,
    pub clear_error: bool,
}

impl ItemUpdate {
    pub fn status(status: QueueStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: Some(QueueStatus::Error),
            error: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: QueueStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_vm_id(mut self, vm_id: u32) -> Self {
        self.vm_id = Some(vm_id);
        self
    }

    pub fn with_storage(mut self, storage: impl Into<String>) -> Self {
        self.storage = Some(storage.into());
        self
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    pub fn with_resources(mut self, cores: u32, memory: u64) -> Self {
        self.cores = Some(cores);
        self.memory = Some(memory);
        self
    }

    pub fn with_disk(mut self, disk_gib: u64) -> Self {
        self.disk_gib = Some(disk_gib);
        self
    }

    pub fn with_identity(mut self, ip: Option<String>, uuid: Option<String>) -> Self {
        self.ip = ip;
        self.uuid = uuid;
        self
    }

    pub fn clearing_error(mut self) -> Self {
        self.clear_error = true;
        self
    }
}

/// Owner of the queue list. The pipeline only ever goes through
/// `update_item`; nobody replaces the list wholesale.
#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn snapshot(&self) -> Vec<QueueItem>;

    async fn get(&self, id: &str) -> Option<QueueItem>;

    /// Atomically applies `update` to the item `id` and returns the result.
    async fn update_item(&self, id: &str, update: ItemUpdate) -> Result<QueueItem, QueueError>;

    async fn enqueue(&self, item: QueueItem) -> Result<QueueItem, QueueError>;

    async fn pending(&self) -> Vec<QueueItem> {
        self.snapshot()
            .await
            .into_iter()
            .filter(|item| item.status == QueueStatus::Pending)
            .collect()
    }
}

/// In-process queue store backed by a `RwLock<Vec<_>>`.
#[derive(Debug, Clone, Default)]
pub struct InMemoryQueueStore {
    items: Arc<RwLock<Vec<QueueItem>>>,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_items(items: Vec<QueueItem>) -> Self {
        Self {
            items: Arc::new(RwLock::new(items)),
        }
    }

    /// Loads a queue previously written by [`InMemoryQueueStore::save_json`].
    pub async fn load_json(path: &Path) -> FleetResult<Self> {
        let raw = tokio::fs::read_to_string(path).await?;
        let items: Vec<QueueItem> = serde_json::from_str(&raw)?;
        for item in &items {
            item.validate()?;
        }
        info!(path = %path.display(), items = items.len(), "queue loaded");
        Ok(Self::with_items(items))
    }

    pub async fn save_json(&self, path: &Path) -> FleetResult<()> {
        let items = self.items.read().await;
        let raw = serde_json::to_string_pretty(&*items)?;
        tokio::fs::write(path, raw).await?;
        debug!(path = %path.display(), items = items.len(), "queue saved");
        Ok(())
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn snapshot(&self) -> Vec<QueueItem> {
        self.items.read().await.clone()
    }

    async fn get(&self, id: &str) -> Option<QueueItem> {
        self.items.read().await.iter().find(|item| item.id == id).cloned()
    }

    async fn update_item(&self, id: &str, update: ItemUpdate) -> Result<QueueItem, QueueError> {
        let mut items = self.items.write().await;
        let item = items
            .iter_mut()
            .find(|item| item.id == id)
            .ok_or_else(|| QueueError::NotFound { id: id.to_string() })?;
        item.apply(&update)?;
        Ok(item.clone())
    }

    async fn enqueue(&self, mut item: QueueItem) -> Result<QueueItem, QueueError> {
        if item.id.is_empty() {
            item.id = Uuid::new_v4().to_string();
        }
        item.validate()?;
        let mut items = self.items.write().await;
        if items.iter().any(|existing| existing.id == item.id) {
            return Err(QueueError::Duplicate { id: item.id });
        }
        item.status = QueueStatus::Pending;
        items.push(item.clone());
        Ok(item)
    }
}
