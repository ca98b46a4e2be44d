//! Persistence collaborator
//!
//! The streaming core only reads channel/scenario relations and mirrors
//! status back. Storage, validation and CRUD live elsewhere.

mod postgres;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::models::{ChannelId, ChannelRecord, ChannelStatus, ScenarioId};

pub use postgres::PgChannelDirectory;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("channel not found: {0}")]
    ChannelNotFound(ChannelId),
}

pub type DirectoryResult<T> = Result<T, DirectoryError>;

/// Channel and scenario lookups plus status mirroring
#[async_trait]
pub trait ChannelDirectory: Send + Sync {
    async fn find_channel(&self, id: &ChannelId) -> DirectoryResult<Option<ChannelRecord>>;

    /// Scenario currently active on the channel
    async fn active_scenario(&self, id: &ChannelId) -> DirectoryResult<Option<ScenarioId>>;

    /// Channel that owns the scenario
    async fn channel_for_scenario(&self, id: &ScenarioId) -> DirectoryResult<Option<ChannelId>>;

    async fn update_status(&self, id: &ChannelId, status: ChannelStatus) -> DirectoryResult<()>;
}

#[derive(Debug, Clone)]
struct ScenarioEntry {
    channel_id: ChannelId,
    is_active: bool,
}

#[derive(Default)]
struct Tables {
    channels: HashMap<ChannelId, ChannelRecord>,
    scenarios: HashMap<ScenarioId, ScenarioEntry>,
}

/// Directory kept in process memory
#[derive(Default, Clone)]
pub struct InMemoryChannelDirectory {
    inner: Arc<RwLock<Tables>>,
}

impl InMemoryChannelDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_channel(&self, channel: ChannelRecord) {
        let mut tables = self.inner.write().await;
        tables.channels.insert(channel.id.clone(), channel);
    }

    pub async fn insert_scenario(&self, id: ScenarioId, channel_id: ChannelId, is_active: bool) {
        let mut tables = self.inner.write().await;
        if is_active {
            for entry in tables.scenarios.values_mut() {
                if entry.channel_id == channel_id {
                    entry.is_active = false;
                }
            }
        }
        tables.scenarios.insert(
            id,
            ScenarioEntry {
                channel_id,
                is_active,
            },
        );
    }

    pub async fn status_of(&self, id: &ChannelId) -> Option<ChannelStatus> {
        let tables = self.inner.read().await;
        tables.channels.get(id).map(|c| c.status)
    }
}

#[async_trait]
impl ChannelDirectory for InMemoryChannelDirectory {
    async fn find_channel(&self, id: &ChannelId) -> DirectoryResult<Option<ChannelRecord>> {
        let tables = self.inner.read().await;
        Ok(tables.channels.get(id).cloned())
    }

    async fn active_scenario(&self, id: &ChannelId) -> DirectoryResult<Option<ScenarioId>> {
        let tables = self.inner.read().await;
        Ok(tables
            .scenarios
            .iter()
            .find(|(_, entry)| entry.is_active && &entry.channel_id == id)
            .map(|(scenario_id, _)| scenario_id.clone()))
    }

    async fn channel_for_scenario(&self, id: &ScenarioId) -> DirectoryResult<Option<ChannelId>> {
        let tables = self.inner.read().await;
        Ok(tables.scenarios.get(id).map(|entry| entry.channel_id.clone()))
    }

    async fn update_status(&self, id: &ChannelId, status: ChannelStatus) -> DirectoryResult<()> {
        let mut tables = self.inner.write().await;
        let channel = tables
            .channels
            .get_mut(id)
            .ok_or_else(|| DirectoryError::ChannelNotFound(id.clone()))?;
        channel.status = status;
        Ok(())
    }
}
