// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2024 Jonathan Lee
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License version 3
// as published by the Free Software Foundation.
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.
// See the GNU Affero General Public License for more details.
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see https://www.gnu.org/licenses/.

use agent_contracts::{AgentResponse, AgentType};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::fs;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store write failed: {0}")]
    WriteFailed(String),

    #[error("Store read failed: {0}")]
    ReadFailed(String),

    #[error("Store configuration error: {0}")]
    Configuration(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Durable side-channel for agent results, keyed by (scene id, agent type).
/// Nodes may run in independent invocation contexts, so each node's result
/// must be durably visible here before the next node starts; later nodes
/// fall back to this store when in-memory state propagation is lost. Scene
/// ids give each concurrent run a disjoint key namespace.
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn put(
        &self,
        scene_id: &str,
        agent_type: AgentType,
        response: &AgentResponse,
    ) -> StoreResult<()>;

    async fn get(
        &self,
        scene_id: &str,
        agent_type: AgentType,
    ) -> StoreResult<Option<AgentResponse>>;
}

/// One JSON file per (scene, agent type) under a per-scene directory.
pub struct FileResultStore {
    root: PathBuf,
}

impl FileResultStore {
    pub async fn new(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await.map_err(|e| {
            StoreError::Configuration(format!("failed to create store directory: {e}"))
        })?;
        Ok(Self { root })
    }

    fn path_for(&self, scene_id: &str, agent_type: AgentType) -> PathBuf {
        self.root
            .join(scene_id)
            .join(format!("{}.json", agent_type.as_str()))
    }
}

#[async_trait]
impl ResultStore for FileResultStore {
    async fn put(
        &self,
        scene_id: &str,
        agent_type: AgentType,
        response: &AgentResponse,
    ) -> StoreResult<()> {
        let path = self.path_for(scene_id, agent_type);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                StoreError::WriteFailed(format!("failed to create scene directory: {e}"))
            })?;
        }
        let body = serde_json::to_string_pretty(response)
            .map_err(|e| StoreError::WriteFailed(format!("failed to serialise response: {e}")))?;
        fs::write(path, body)
            .await
            .map_err(|e| StoreError::WriteFailed(format!("failed to write response file: {e}")))?;
        Ok(())
    }

    async fn get(
        &self,
        scene_id: &str,
        agent_type: AgentType,
    ) -> StoreResult<Option<AgentResponse>> {
        let path = self.path_for(scene_id, agent_type);
        let body = match fs::read_to_string(path).await {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StoreError::ReadFailed(format!(
                    "failed to read response file: {e}"
                )))
            }
        };
        let response = serde_json::from_str(&body)
            .map_err(|e| StoreError::ReadFailed(format!("failed to deserialise response: {e}")))?;
        Ok(Some(response))
    }
}

/// In-process store for tests and single-process runs.
#[derive(Default, Clone)]
pub struct MemoryResultStore {
    entries: Arc<RwLock<HashMap<(String, AgentType), AgentResponse>>>,
}

impl MemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn put(
        &self,
        scene_id: &str,
        agent_type: AgentType,
        response: &AgentResponse,
    ) -> StoreResult<()> {
        let mut entries = self.entries.write().await;
        entries.insert((scene_id.to_string(), agent_type), response.clone());
        Ok(())
    }

    async fn get(
        &self,
        scene_id: &str,
        agent_type: AgentType,
    ) -> StoreResult<Option<AgentResponse>> {
        let entries = self.entries.read().await;
        Ok(entries.get(&(scene_id.to_string(), agent_type)).cloned())
    }
}
