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

//! Word-overlap convergence test between consecutive cycles.

use agent_contracts::{AgentResponse, AgentType};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Weighting of the two text channels. The 0.6/0.4 split has no documented
/// derivation upstream, so it stays configurable rather than constant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvergenceConfig {
    pub insights_weight: f64,
    pub recommendations_weight: f64,
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        Self {
            insights_weight: 0.6,
            recommendations_weight: 0.4,
        }
    }
}

fn word_set(texts: &[String]) -> HashSet<String> {
    texts
        .iter()
        .flat_map(|text| text.split_whitespace())
        .map(|word| {
            word.trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .filter(|word| !word.is_empty())
        .collect()
}

/// Jaccard overlap of the word sets of two text lists. Two empty lists are
/// identical, hence 1.0.
pub fn overlap(a: &[String], b: &[String]) -> f64 {
    let set_a = word_set(a);
    let set_b = word_set(b);
    if set_a.is_empty() && set_b.is_empty() {
        return 1.0;
    }
    let intersection = set_a.intersection(&set_b).count() as f64;
    let union = set_a.union(&set_b).count() as f64;
    intersection / union
}

/// Weighted similarity between two consecutive cycles, averaged across the
/// agents present in both. `None` when no agent appears in both cycles.
pub fn cycle_similarity(
    config: &ConvergenceConfig,
    previous: &HashMap<AgentType, AgentResponse>,
    current: &HashMap<AgentType, AgentResponse>,
) -> Option<f64> {
    let mut total = 0.0;
    let mut agents = 0usize;

    for (agent_type, current_response) in current {
        let Some(previous_response) = previous.get(agent_type) else {
            continue;
        };
        let insights_sim = overlap(&previous_response.insights, &current_response.insights);
        let recommendations_sim = overlap(
            &previous_response.recommendations,
            &current_response.recommendations,
        );
        total += config.insights_weight * insights_sim
            + config.recommendations_weight * recommendations_sim;
        agents += 1;
    }

    if agents == 0 {
        return None;
    }
    Some(total / agents as f64)
}

/// True when the current cycle produced at least one insight string absent
/// from the previous cycle's combined insight set.
pub fn new_insights_exist(
    previous: &HashMap<AgentType, AgentResponse>,
    current: &HashMap<AgentType, AgentResponse>,
) -> bool {
    let previous_set: HashSet<&str> = previous
        .values()
        .flat_map(|r| r.insights.iter())
        .map(String::as_str)
        .collect();

    current
        .values()
        .flat_map(|r| r.insights.iter())
        .any(|insight| !previous_set.contains(insight.as_str()))
}
