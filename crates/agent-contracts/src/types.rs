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

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Placeholder used upstream when a scene id could not be determined.
/// Never valid on a completed response.
pub const SENTINEL_SCENE_ID: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    Coordinator,
    SceneUnderstanding,
    AnomalyDetection,
    SimilaritySearch,
}

impl AgentType {
    /// The fixed sequential execution order of the analysis chain.
    pub fn pipeline() -> [AgentType; 4] {
        [
            AgentType::Coordinator,
            AgentType::SceneUnderstanding,
            AgentType::AnomalyDetection,
            AgentType::SimilaritySearch,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::Coordinator => "coordinator",
            AgentType::SceneUnderstanding => "scene_understanding",
            AgentType::AnomalyDetection => "anomaly_detection",
            AgentType::SimilaritySearch => "similarity_search",
        }
    }

    pub fn parse(value: &str) -> Option<AgentType> {
        match value {
            "coordinator" => Some(AgentType::Coordinator),
            "scene_understanding" => Some(AgentType::SceneUnderstanding),
            "anomaly_detection" => Some(AgentType::AnomalyDetection),
            "similarity_search" => Some(AgentType::SimilaritySearch),
            _ => None,
        }
    }
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One scene's input to the pipeline. Immutable once handed to a cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scene {
    pub id: String,
    /// Per-modality embedding vectors keyed by modality name.
    pub embeddings: HashMap<String, Vec<f32>>,
    /// Scalar behavioural metrics extracted by the upstream analysis stage.
    pub metrics: HashMap<String, f64>,
}

impl Scene {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            embeddings: HashMap::new(),
            metrics: HashMap::new(),
        }
    }

    pub fn with_embedding(mut self, modality: impl Into<String>, vector: Vec<f32>) -> Self {
        self.embeddings.insert(modality.into(), vector);
        self
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }

    /// The embedding used for cross-scene similarity queries. The fused
    /// vector wins when present; otherwise the lexicographically first
    /// modality, so the choice is stable across runs.
    pub fn primary_embedding(&self) -> Option<&Vec<f32>> {
        if let Some(fused) = self.embeddings.get("fused") {
            return Some(fused);
        }
        self.embeddings
            .iter()
            .min_by(|a, b| a.0.cmp(b.0))
            .map(|(_, v)| v)
    }

    pub fn has_valid_id(&self) -> bool {
        !self.id.trim().is_empty() && self.id != SENTINEL_SCENE_ID
    }
}

/// Isolation verdict produced once per scene before the graph runs and
/// injected into every node's request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyContext {
    pub is_anomaly: bool,
    /// Distance metric: 0 = identical, larger = more isolated. Not a
    /// similarity score.
    pub anomaly_score: f64,
    pub closest_similarity: Option<f64>,
    pub reason: String,
}

impl AnomalyContext {
    pub fn cold_start() -> Self {
        Self {
            is_anomaly: true,
            anomaly_score: 1.0,
            closest_similarity: None,
            reason: "reference index is empty; scene is trivially novel".to_string(),
        }
    }

    pub fn fail_open(reason: impl Into<String>) -> Self {
        Self {
            is_anomaly: false,
            anomaly_score: 0.0,
            closest_similarity: None,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ContractError {
    #[error("Invalid scene id: {0}")]
    InvalidSceneId(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Malformed field '{field}': {detail}")]
    MalformedField { field: String, detail: String },

    #[error("Serialisation error: {0}")]
    Serialisation(String),
}

pub type ContractResult<T> = Result<T, ContractError>;
