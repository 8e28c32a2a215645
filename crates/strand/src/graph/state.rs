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

use agent_contracts::{AgentResponse, AgentType, AnomalyContext, Scene, SimilarSceneSummary};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("Result for agent '{0}' already recorded; agent_results is append-only")]
    ResultAlreadyRecorded(AgentType),
}

/// Cross-reference material accumulated for the scene: free-text context
/// assembled from earlier cycles plus the similarity hits that produced it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnhancedIntelligence {
    pub cross_reference: String,
    pub prior_similarity_hits: Vec<SimilarSceneSummary>,
}

/// Shared mutable record passed by reference through one graph run.
/// Only the currently-running node mutates it, so no locking is needed
/// within a run. Lifetime is one run; the cycle controller summarises it
/// afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionState {
    pub scene_id: String,
    pub session_id: String,
    pub embeddings: HashMap<String, Vec<f32>>,
    pub metrics: HashMap<String, f64>,
    pub anomaly_context: AnomalyContext,
    pub enhanced_intelligence: EnhancedIntelligence,
    agent_results: HashMap<AgentType, AgentResponse>,
    execution_order: Vec<AgentType>,
}

impl ExecutionState {
    pub fn new(scene: &Scene, session_id: impl Into<String>, anomaly: AnomalyContext) -> Self {
        Self {
            scene_id: scene.id.clone(),
            session_id: session_id.into(),
            embeddings: scene.embeddings.clone(),
            metrics: scene.metrics.clone(),
            anomaly_context: anomaly,
            enhanced_intelligence: EnhancedIntelligence::default(),
            agent_results: HashMap::new(),
            execution_order: Vec::new(),
        }
    }

    /// Appends a completed node's result. Once written an entry is frozen;
    /// a second write for the same agent is an invariant violation.
    pub fn record_result(&mut self, response: AgentResponse) -> Result<(), StateError> {
        let agent_type = response.agent_type;
        if self.agent_results.contains_key(&agent_type) {
            return Err(StateError::ResultAlreadyRecorded(agent_type));
        }
        self.agent_results.insert(agent_type, response);
        self.execution_order.push(agent_type);
        Ok(())
    }

    pub fn result(&self, agent_type: AgentType) -> Option<&AgentResponse> {
        self.agent_results.get(&agent_type)
    }

    pub fn results(&self) -> &HashMap<AgentType, AgentResponse> {
        &self.agent_results
    }

    pub fn execution_order(&self) -> &[AgentType] {
        &self.execution_order
    }

    pub fn completed_count(&self) -> usize {
        self.execution_order.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> ExecutionState {
        let scene = Scene::new("scene-0042").with_embedding("fused", vec![0.5, 0.5]);
        ExecutionState::new(&scene, "session-1", AnomalyContext::fail_open("n/a"))
    }

    #[test]
    fn record_result_appends_in_order() {
        let mut state = state();
        state
            .record_result(AgentResponse::empty(AgentType::Coordinator, "scene-0042"))
            .unwrap();
        state
            .record_result(AgentResponse::empty(
                AgentType::SceneUnderstanding,
                "scene-0042",
            ))
            .unwrap();

        assert_eq!(
            state.execution_order(),
            &[AgentType::Coordinator, AgentType::SceneUnderstanding]
        );
        assert_eq!(state.completed_count(), 2);
    }

    #[test]
    fn second_write_for_same_agent_is_refused() {
        let mut state = state();
        state
            .record_result(AgentResponse::empty(AgentType::Coordinator, "scene-0042"))
            .unwrap();
        let err = state
            .record_result(AgentResponse::empty(AgentType::Coordinator, "scene-0042"))
            .unwrap_err();
        assert!(matches!(err, StateError::ResultAlreadyRecorded(_)));
        // The original entry and ordering are untouched.
        assert_eq!(state.completed_count(), 1);
    }
}
