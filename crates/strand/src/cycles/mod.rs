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

pub mod context;
pub mod convergence;

pub use context::{enrich, CrossSceneConfig, CrossSceneContext};
pub use convergence::ConvergenceConfig;

use crate::graph::{ExecutionState, GraphExecutor, GraphRunReport, GraphRunStatus, RunContext};
use crate::index::VectorIndex;
use agent_contracts::{
    AgentCarryover, AgentResponse, AgentType, AnomalyContext, Scene, WorkflowParams,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("Cycle {cycle} failed on the final allowed attempt: {cause}")]
    FinalCycleFailed {
        cycle: u32,
        cause: String,
        /// Completed cycles are never lost, even when the run fails.
        history: Vec<CycleResult>,
    },

    #[error("Workflow allows zero cycles")]
    NoCyclesAllowed,
}

pub type CycleControllerResult<T> = Result<T, CycleError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleConfig {
    /// Sliding window of retained cycle results.
    pub history_limit: usize,
    /// Most-recent insights/recommendations carried per agent into the
    /// next cycle's payload, bounding payload growth.
    pub carryover_limit: usize,
    pub convergence: ConvergenceConfig,
    pub cross_scene: CrossSceneConfig,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            history_limit: 10,
            carryover_limit: 5,
            convergence: ConvergenceConfig::default(),
            cross_scene: CrossSceneConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    ConvergenceAchieved,
    EarlyTerminationNoNewInsights,
    MaxCyclesReached,
}

impl TerminationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationReason::ConvergenceAchieved => "convergence_achieved",
            TerminationReason::EarlyTerminationNoNewInsights => {
                "early_termination_no_new_insights"
            }
            TerminationReason::MaxCyclesReached => "max_cycles_reached",
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One graph run's output plus cycle metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleResult {
    pub cycle: u32,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub agent_results: HashMap<AgentType, AgentResponse>,
    pub report: GraphRunReport,
    pub cross_scene_size: usize,
}

/// One line of the per-cycle progression summary kept for auditing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleProgress {
    pub cycle: u32,
    pub agent_count: usize,
    pub first_finding: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedResult {
    pub scene_id: String,
    pub session_id: String,
    pub termination: TerminationReason,
    pub cycles_completed: u32,
    /// Final-cycle results are authoritative.
    pub final_results: HashMap<AgentType, AgentResponse>,
    /// All-time union across cycles, kept for observability only.
    pub all_insights: Vec<String>,
    pub all_recommendations: Vec<String>,
    pub convergence_score: Option<f64>,
    pub progression: Vec<CycleProgress>,
    pub history: Vec<CycleResult>,
}

/// Repeatedly runs the agent graph for one scene, enriching each cycle
/// with cross-cycle and cross-scene context, until results stabilise or
/// no new insight appears.
pub struct CycleController {
    executor: GraphExecutor,
    index: Arc<dyn VectorIndex>,
    config: CycleConfig,
}

impl CycleController {
    pub fn new(executor: GraphExecutor, index: Arc<dyn VectorIndex>, config: CycleConfig) -> Self {
        Self {
            executor,
            index,
            config,
        }
    }

    pub async fn run(
        &self,
        params: &WorkflowParams,
        scene: &Scene,
        session_id: &str,
        anomaly: AnomalyContext,
    ) -> CycleControllerResult<AggregatedResult> {
        if params.max_cycles == 0 {
            return Err(CycleError::NoCyclesAllowed);
        }

        let mut history: Vec<CycleResult> = Vec::new();
        let mut previous_results: Option<HashMap<AgentType, AgentResponse>> = None;
        let mut cross_scene = CrossSceneContext::default();
        let mut carryover: Vec<AgentCarryover> = Vec::new();
        let mut termination = TerminationReason::MaxCyclesReached;
        let mut convergence_score = None;
        let mut cycles_completed = 0u32;

        for cycle in 1..=params.max_cycles {
            let mut state = ExecutionState::new(scene, session_id, anomaly.clone());
            state.enhanced_intelligence.cross_reference = cross_scene.cross_reference_text();
            state.enhanced_intelligence.prior_similarity_hits =
                cross_scene.similar_scenes.clone();

            let run_context = RunContext {
                cycle,
                objective: Some(params.objective.clone()).filter(|o| !o.is_empty()),
                similar_scenes: cross_scene.similar_scenes.clone(),
                pattern_insights: cross_scene.pattern_insights.clone(),
                carryover: std::mem::take(&mut carryover),
            };

            let report = self.executor.run(&mut state, &run_context).await;
            let failed = report.status == GraphRunStatus::Failed;
            let cause = report.error.clone();

            self.push_history(
                &mut history,
                CycleResult {
                    cycle,
                    timestamp: chrono::Utc::now(),
                    agent_results: state.results().clone(),
                    report,
                    cross_scene_size: cross_scene.size(),
                },
            );

            if failed {
                let cause = cause.unwrap_or_else(|| "unknown graph failure".to_string());
                warn!(cycle, cause = %cause, "Cycle failed");
                if cycle == params.max_cycles {
                    return Err(CycleError::FinalCycleFailed {
                        cycle,
                        cause,
                        history,
                    });
                }
                // Next cycle starts from the last successful cycle's
                // context; a failed cycle contributes nothing.
                carryover = previous_results
                    .as_ref()
                    .map(|results| self.build_carryover(results))
                    .unwrap_or_default();
                continue;
            }

            let results = state.results().clone();
            cycles_completed = cycle;

            if let Some(previous) = &previous_results {
                // Convergence is evaluated before early termination; both
                // only make sense with a completed previous cycle.
                if let Some(score) =
                    convergence::cycle_similarity(&self.config.convergence, previous, &results)
                {
                    convergence_score = Some(score);
                    if score >= params.convergence_threshold {
                        info!(cycle, score, "Convergence achieved");
                        termination = TerminationReason::ConvergenceAchieved;
                        previous_results = Some(results);
                        break;
                    }
                }
                if !convergence::new_insights_exist(previous, &results) {
                    info!(cycle, "No new insights, terminating early");
                    termination = TerminationReason::EarlyTerminationNoNewInsights;
                    previous_results = Some(results);
                    break;
                }
            }

            carryover = self.build_carryover(&results);
            previous_results = Some(results);

            if cycle < params.max_cycles {
                cross_scene = enrich(
                    self.index.as_ref(),
                    &self.config.cross_scene,
                    scene,
                    &params.filters,
                )
                .await;
            }
        }

        let final_results = previous_results.unwrap_or_default();
        Ok(self.aggregate(
            scene,
            session_id,
            termination,
            cycles_completed,
            final_results,
            convergence_score,
            history,
        ))
    }

    fn push_history(&self, history: &mut Vec<CycleResult>, result: CycleResult) {
        history.push(result);
        while history.len() > self.config.history_limit {
            history.remove(0);
        }
    }

    /// The most recent N insights/recommendations per agent; the full lists
    /// never travel between cycles.
    fn build_carryover(
        &self,
        results: &HashMap<AgentType, AgentResponse>,
    ) -> Vec<AgentCarryover> {
        let mut carryover: Vec<AgentCarryover> = results
            .values()
            .map(|response| AgentCarryover {
                agent_type: response.agent_type,
                insights: tail(&response.insights, self.config.carryover_limit),
                recommendations: tail(&response.recommendations, self.config.carryover_limit),
            })
            .collect();
        carryover.sort_by_key(|c| c.agent_type.as_str());
        carryover
    }

    #[allow(clippy::too_many_arguments)]
    fn aggregate(
        &self,
        scene: &Scene,
        session_id: &str,
        termination: TerminationReason,
        cycles_completed: u32,
        final_results: HashMap<AgentType, AgentResponse>,
        convergence_score: Option<f64>,
        history: Vec<CycleResult>,
    ) -> AggregatedResult {
        let mut all_insights = Vec::new();
        let mut all_recommendations = Vec::new();
        for result in &history {
            for response in result.agent_results.values() {
                for insight in &response.insights {
                    if !all_insights.contains(insight) {
                        all_insights.push(insight.clone());
                    }
                }
                for recommendation in &response.recommendations {
                    if !all_recommendations.contains(recommendation) {
                        all_recommendations.push(recommendation.clone());
                    }
                }
            }
        }

        let progression = history
            .iter()
            .map(|result| CycleProgress {
                cycle: result.cycle,
                agent_count: result.agent_results.len(),
                first_finding: AgentType::pipeline()
                    .iter()
                    .find_map(|agent_type| {
                        result
                            .agent_results
                            .get(agent_type)
                            .and_then(|r| r.analysis.key_findings.first())
                    })
                    .map(|finding| snippet(finding, 80)),
                duration_ms: result.report.duration_ms,
            })
            .collect();

        AggregatedResult {
            scene_id: scene.id.clone(),
            session_id: session_id.to_string(),
            termination,
            cycles_completed,
            final_results,
            all_insights,
            all_recommendations,
            convergence_score,
            progression,
            history,
        }
    }
}

fn tail(items: &[String], limit: usize) -> Vec<String> {
    let start = items.len().saturating_sub(limit);
    items[start..].to_vec()
}

fn snippet(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut cut = limit;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…", &text[..cut])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_keeps_most_recent_entries() {
        let items: Vec<String> = (1..=8).map(|i| format!("i{i}")).collect();
        assert_eq!(tail(&items, 5), items[3..].to_vec());
        assert_eq!(tail(&items, 20), items);
    }

    #[test]
    fn snippet_respects_char_boundaries() {
        let text = "ääääääääää";
        let cut = snippet(text, 5);
        assert!(cut.ends_with('…'));
    }
}
