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

//! Explicit per-run configuration. Constructed once and passed by
//! reference; nothing here lives in module or class-level static state, so
//! concurrent scene runs stay independent and testable.

use crate::anomaly::DEFAULT_ANOMALY_THRESHOLD;
use crate::cycles::CycleConfig;
use crate::graph::{AgentBinding, GraphConfig};
use crate::objective::InterpreterConfig;
use agent_contracts::AgentType;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Reference index the anomaly detector scores against.
    pub reference_index: String,
    pub anomaly_threshold: f64,
    pub bindings: Vec<AgentBinding>,
    pub graph: GraphConfig,
    pub cycles: CycleConfig,
    pub interpreter: InterpreterConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            reference_index: "scene-reference".to_string(),
            anomaly_threshold: DEFAULT_ANOMALY_THRESHOLD,
            bindings: AgentBinding::defaults(),
            graph: GraphConfig::default(),
            cycles: CycleConfig::default(),
            interpreter: InterpreterConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Environment overrides on top of the defaults. Unset variables leave
    /// the default in place; malformed values do too.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(index) = std::env::var("REFERENCE_INDEX") {
            config.reference_index = index;
        }
        if let Ok(index) = std::env::var("SCENE_INDEX") {
            config.cycles.cross_scene.index_name = index;
        }
        if let Some(threshold) = env_f64("ANOMALY_THRESHOLD") {
            config.anomaly_threshold = threshold;
        }
        if let Some(cutoff) = env_f64("CROSS_SCENE_CUTOFF") {
            config.cycles.cross_scene.similarity_cutoff = cutoff;
        }
        if let Some(secs) = env_u64("NODE_TIMEOUT_SECS") {
            config.graph.node_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("GRAPH_TIMEOUT_SECS") {
            config.graph.graph_timeout = Duration::from_secs(secs);
        }

        for binding in &mut config.bindings {
            let var = format!(
                "AGENT_REF_{}",
                binding.agent_type.as_str().to_uppercase()
            );
            if let Ok(agent_ref) = std::env::var(&var) {
                binding.agent_ref = agent_ref;
            }
        }

        config
    }

    pub fn binding_for(&self, agent_type: AgentType) -> Option<&AgentBinding> {
        self.bindings.iter().find(|b| b.agent_type == agent_type)
    }
}

fn env_f64(name: &str) -> Option<f64> {
    std::env::var(name).ok()?.parse().ok()
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok()?.parse().ok()
}
