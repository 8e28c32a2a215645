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

pub mod anomaly;
pub mod config;
pub mod cycles;
pub mod graph;
pub mod index;
pub mod invoke;
pub mod normalise;
pub mod objective;
pub mod orchestrator;
pub mod sanitise;
pub mod store;

pub use anomaly::{AnomalyDetector, DEFAULT_ANOMALY_THRESHOLD};
pub use config::PipelineConfig;
pub use cycles::{
    AggregatedResult, CrossSceneConfig, CrossSceneContext, CycleConfig, CycleController,
    CycleError, CycleProgress, CycleResult, TerminationReason,
};
pub use graph::{
    AgentBinding, ExecutionState, GraphConfig, GraphExecutor, GraphRunReport, GraphRunStatus,
    NodeOutcome, RunContext,
};
pub use index::{HttpVectorIndex, IndexError, MemoryVectorIndex, QueryMatch, VectorIndex};
pub use invoke::{AgentInvoker, HttpAgentInvoker, InvokeError, ScriptedInvoker};
pub use normalise::{normalise, NormaliseError, RawShape};
pub use objective::{
    HttpTextGenerator, InterpreterConfig, ObjectiveError, ObjectiveInterpreter, ScriptedGenerator,
    TextGenerator,
};
pub use orchestrator::{
    HttpTaskReporter, LoggingTaskReporter, Orchestrator, OrchestratorError, OrchestratorResult,
    SceneTask, TaskFailure, TaskReporter, TaskSuccess,
};
pub use store::{FileResultStore, MemoryResultStore, ResultStore, StoreError};

use agent_contracts::{Scene, WorkflowParams};
use std::sync::Arc;

/// Builds a fully wired orchestrator from a pipeline configuration and the
/// four service seams, then processes one scene task.
pub async fn run_scene_pipeline(
    config: PipelineConfig,
    index: Arc<dyn VectorIndex>,
    invoker: Arc<dyn AgentInvoker>,
    store: Arc<dyn ResultStore>,
    reporter: Arc<dyn TaskReporter>,
    task: &SceneTask,
    scene: &Scene,
    params: &WorkflowParams,
) -> OrchestratorResult<AggregatedResult> {
    let detector = AnomalyDetector::new(index.clone(), config.reference_index.clone());
    let executor = GraphExecutor::new(invoker, store, config.bindings.clone(), config.graph.clone());
    let controller = CycleController::new(executor, index, config.cycles.clone());
    let orchestrator = Orchestrator::new(detector, controller, reporter, config.anomaly_threshold);
    orchestrator.process_scene(task, scene, params).await
}
