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

use super::state::ExecutionState;
use crate::invoke::{AgentInvoker, InvokeError};
use crate::normalise;
use crate::store::ResultStore;
use agent_contracts::{
    AgentCarryover, AgentRequest, AgentResponse, AgentType, SimilarSceneSummary,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Maps a pipeline position to the remote agent that serves it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentBinding {
    pub agent_type: AgentType,
    pub agent_ref: String,
}

impl AgentBinding {
    /// One binding per pipeline stage, in execution order, using the agent
    /// type name as the reference. Deployments override the references.
    pub fn defaults() -> Vec<AgentBinding> {
        AgentType::pipeline()
            .into_iter()
            .map(|agent_type| AgentBinding {
                agent_type,
                agent_ref: agent_type.as_str().to_string(),
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct GraphConfig {
    pub node_timeout: Duration,
    pub graph_timeout: Duration,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            node_timeout: Duration::from_secs(300),
            graph_timeout: Duration::from_secs(900),
        }
    }
}

/// Cross-cycle enrichment handed into one graph run.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub cycle: u32,
    pub objective: Option<String>,
    pub similar_scenes: Vec<SimilarSceneSummary>,
    pub pattern_insights: Vec<String>,
    pub carryover: Vec<AgentCarryover>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphRunStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeOutcome {
    pub agent_type: AgentType,
    pub duration_ms: u64,
    /// True when an empty-but-valid response was substituted for an
    /// unusable invocation result.
    pub substituted: bool,
    pub issue_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphRunReport {
    pub status: GraphRunStatus,
    pub error: Option<String>,
    pub node_outcomes: Vec<NodeOutcome>,
    pub duration_ms: u64,
}

/// Runs the fixed sequential agent chain. The chain is an explicit ordered
/// stage list: each stage sees the shared state plus every prior stage's
/// result, with the durable store as the fallback read path when in-memory
/// propagation is lost between invocation contexts. The executor never
/// retries a node; a node failure is a graph failure for the caller to
/// retry as a whole.
pub struct GraphExecutor {
    invoker: Arc<dyn AgentInvoker>,
    store: Arc<dyn ResultStore>,
    bindings: Vec<AgentBinding>,
    config: GraphConfig,
}

impl GraphExecutor {
    pub fn new(
        invoker: Arc<dyn AgentInvoker>,
        store: Arc<dyn ResultStore>,
        bindings: Vec<AgentBinding>,
        config: GraphConfig,
    ) -> Self {
        Self {
            invoker,
            store,
            bindings,
            config,
        }
    }

    pub async fn run(&self, state: &mut ExecutionState, context: &RunContext) -> GraphRunReport {
        let started = Instant::now();
        let mut node_outcomes = Vec::with_capacity(self.bindings.len());

        for (position, binding) in self.bindings.iter().enumerate() {
            let elapsed = started.elapsed();
            if elapsed >= self.config.graph_timeout {
                return self.fail(
                    node_outcomes,
                    started,
                    format!(
                        "graph timeout after {}s before node '{}'",
                        elapsed.as_secs(),
                        binding.agent_type
                    ),
                );
            }
            let node_budget = self
                .config
                .node_timeout
                .min(self.config.graph_timeout - elapsed);

            match self
                .run_node(state, context, binding, position, node_budget)
                .await
            {
                Ok(outcome) => node_outcomes.push(outcome),
                Err(cause) => {
                    error!(
                        agent = %binding.agent_type,
                        cause = %cause,
                        "Node failed, halting chain"
                    );
                    return self.fail(node_outcomes, started, cause);
                }
            }
        }

        info!(
            scene = %state.scene_id,
            nodes = node_outcomes.len(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Graph run completed"
        );
        GraphRunReport {
            status: GraphRunStatus::Completed,
            error: None,
            node_outcomes,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    fn fail(
        &self,
        node_outcomes: Vec<NodeOutcome>,
        started: Instant,
        cause: String,
    ) -> GraphRunReport {
        GraphRunReport {
            status: GraphRunStatus::Failed,
            error: Some(cause),
            node_outcomes,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    async fn run_node(
        &self,
        state: &mut ExecutionState,
        context: &RunContext,
        binding: &AgentBinding,
        position: usize,
        budget: Duration,
    ) -> Result<NodeOutcome, String> {
        let node_started = Instant::now();
        let request = self.build_request(state, context, binding, position).await;
        let payload = request
            .to_payload()
            .map_err(|e| format!("failed to serialise request for '{}': {e}", binding.agent_type))?;

        let invocation = tokio::time::timeout(
            budget,
            self.invoker
                .invoke(&binding.agent_ref, &state.session_id, &payload),
        )
        .await;

        let (raw, substituted) = match invocation {
            Err(_) => {
                return Err(format!(
                    "node '{}' timed out after {}s",
                    binding.agent_type,
                    budget.as_secs()
                ))
            }
            Ok(Ok(raw)) => (raw, false),
            Ok(Err(InvokeError::BadStatus {
                agent_ref, status, ..
            })) => {
                // A bad status is a response, not an outage; the chain
                // continues on an empty-but-valid result.
                warn!(
                    agent = %agent_ref,
                    status,
                    "Agent returned bad status, substituting empty response"
                );
                (serde_json::Value::Null, true)
            }
            Ok(Err(e @ InvokeError::InvocationFailed(_))) => {
                // Transport-level failure: surfaced so the outer workflow
                // engine can retry the whole invocation.
                return Err(format!("node '{}' invocation failed: {e}", binding.agent_type));
            }
        };

        let mut response = if raw.is_null() {
            let mut empty = AgentResponse::empty(binding.agent_type, state.scene_id.clone());
            if substituted {
                empty
                    .validation
                    .push_issue("agent invocation returned a non-success status");
            }
            empty
        } else {
            normalise::normalise(binding.agent_type, &state.scene_id, &raw)
                .map_err(|e| format!("node '{}' schema violation: {e}", binding.agent_type))?
        };

        response.metadata.invoked_agent = Some(binding.agent_ref.clone());
        response.metadata.duration_ms = node_started.elapsed().as_millis() as u64;

        let outcome = NodeOutcome {
            agent_type: binding.agent_type,
            duration_ms: response.metadata.duration_ms,
            substituted: substituted || raw.is_null(),
            issue_count: response.validation.issue_count,
        };

        // Both writes are attempted even if one fails: the store keeps the
        // next node's fallback read path alive, the in-memory state keeps
        // this process's fast path alive.
        if let Err(e) = self
            .store
            .put(&state.scene_id, binding.agent_type, &response)
            .await
        {
            warn!(
                agent = %binding.agent_type,
                error = %e,
                "Durable store write failed, continuing with in-memory state"
            );
        }
        if let Err(e) = state.record_result(response) {
            warn!(
                agent = %binding.agent_type,
                error = %e,
                "In-memory state write refused, continuing with durable store"
            );
        }

        Ok(outcome)
    }

    /// Assembles the node payload. Non-entry nodes carry every previously
    /// completed response, read from shared state when present and from the
    /// durable store when propagation across invocation contexts lost it.
    async fn build_request(
        &self,
        state: &ExecutionState,
        context: &RunContext,
        binding: &AgentBinding,
        position: usize,
    ) -> AgentRequest {
        let mut prior_results = Vec::with_capacity(position);
        for earlier in &self.bindings[..position] {
            if let Some(result) = state.result(earlier.agent_type) {
                prior_results.push(result.clone());
                continue;
            }
            debug!(
                agent = %earlier.agent_type,
                "Result missing from shared state, falling back to durable store"
            );
            match self.store.get(&state.scene_id, earlier.agent_type).await {
                Ok(Some(result)) => prior_results.push(result),
                Ok(None) => warn!(
                    agent = %earlier.agent_type,
                    "No durable result to fall back to; prior result omitted"
                ),
                Err(e) => warn!(
                    agent = %earlier.agent_type,
                    error = %e,
                    "Durable store read failed; prior result omitted"
                ),
            }
        }

        AgentRequest {
            agent_type: binding.agent_type,
            scene_id: state.scene_id.clone(),
            session_id: state.session_id.clone(),
            cycle: context.cycle,
            objective: context.objective.clone(),
            embeddings: state.embeddings.clone(),
            metrics: state.metrics.clone(),
            anomaly: Some(state.anomaly_context.clone()),
            similar_scenes: context.similar_scenes.clone(),
            pattern_insights: context.pattern_insights.clone(),
            prior_results,
            carryover: context.carryover.clone(),
        }
    }
}
