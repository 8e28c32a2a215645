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

use crate::responses::AgentResponse;
use crate::types::{AgentType, AnomalyContext, ContractError, ContractResult, Scene};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// One similar-scene hit carried into later cycles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimilarSceneSummary {
    pub scene_id: String,
    pub similarity: f64,
    pub metadata: Value,
}

/// The bounded slice of a previous cycle's output re-fed to an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCarryover {
    pub agent_type: AgentType,
    pub insights: Vec<String>,
    pub recommendations: Vec<String>,
}

/// Payload for one agent invocation. Serialises as a plain JSON object
/// with no wrapper key; the invocation service forwards it verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRequest {
    pub agent_type: AgentType,
    pub scene_id: String,
    pub session_id: String,
    pub cycle: u32,
    pub objective: Option<String>,
    pub embeddings: HashMap<String, Vec<f32>>,
    pub metrics: HashMap<String, f64>,
    pub anomaly: Option<AnomalyContext>,
    pub similar_scenes: Vec<SimilarSceneSummary>,
    pub pattern_insights: Vec<String>,
    /// Normalised results of every node that completed before this one.
    pub prior_results: Vec<AgentResponse>,
    pub carryover: Vec<AgentCarryover>,
}

impl AgentRequest {
    pub fn for_scene(agent_type: AgentType, scene: &Scene, session_id: impl Into<String>) -> Self {
        Self {
            agent_type,
            scene_id: scene.id.clone(),
            session_id: session_id.into(),
            cycle: 1,
            objective: None,
            embeddings: scene.embeddings.clone(),
            metrics: scene.metrics.clone(),
            anomaly: None,
            similar_scenes: Vec::new(),
            pattern_insights: Vec::new(),
            prior_results: Vec::new(),
            carryover: Vec::new(),
        }
    }

    pub fn to_payload(&self) -> ContractResult<Value> {
        serde_json::to_value(self).map_err(|e| ContractError::Serialisation(e.to_string()))
    }
}
