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

//! Parses heterogeneous agent output into the canonical [`AgentResponse`].
//! Each known output shape has its own variant and parser; a single
//! classification function selects the variant. Parse failure is always
//! recoverable (recorded as a validation issue, never an error); only a
//! missing or sentinel scene id raises, because cross-scene joins key on it.

use crate::sanitise::{sanitise_strings, sanitise_value, SuspiciousCategory};
use agent_contracts::{
    AgentResponse, AgentType, Analysis, ResponseMetadata, ResponseStatus, ValidationReport,
    SENTINEL_SCENE_ID,
};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum NormaliseError {
    #[error("Invalid scene id '{0}'")]
    InvalidSceneId(String),
}

pub type NormaliseResult<T> = Result<T, NormaliseError>;

/// Field names whose presence marks an analysis object as already parsed.
const STRUCTURED_FIELDS: [&str; 5] = [
    "key_findings",
    "insights",
    "recommendations",
    "metrics",
    "confidence",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodedForm {
    /// `"{\"summary\": ...}"`: the summary field holds serialised JSON.
    DoubleQuotedJson,
    /// `"{'summary': ...}"`: a dict-literal rendering with single quotes.
    SingleQuotedLiteral,
    /// JSON escaped one or more extra times (`{\\\"summary\\\": ...}`).
    NestedEscaped,
}

/// Tagged union of the known agent-output shapes.
#[derive(Debug, Clone)]
pub enum RawShape {
    /// A JSON object whose analysis fields are directly usable.
    StructuredDirect(Map<String, Value>),
    /// A JSON object whose `analysis.summary` is itself encoded JSON.
    StringEncodedJson {
        container: Map<String, Value>,
        encoded: String,
        form: EncodedForm,
    },
    /// Summary wrapped in a markdown code fence.
    MarkdownFenced {
        container: Map<String, Value>,
        encoded: String,
    },
    /// Anything else: salvage what the text offers.
    FreeText(String),
}

/// Selects the parser for a raw output. This is the only place shape
/// detection happens.
pub fn classify(raw: &Value) -> RawShape {
    match raw {
        Value::Object(map) => {
            if let Some(summary) = map
                .get("analysis")
                .and_then(|a| a.get("summary"))
                .and_then(Value::as_str)
            {
                let trimmed = summary.trim();
                if trimmed.starts_with("```") {
                    return RawShape::MarkdownFenced {
                        container: map.clone(),
                        encoded: trimmed.to_string(),
                    };
                }
                if trimmed.starts_with("{'") {
                    return RawShape::StringEncodedJson {
                        container: map.clone(),
                        encoded: trimmed.to_string(),
                        form: EncodedForm::SingleQuotedLiteral,
                    };
                }
                if trimmed.starts_with('{') && trimmed.contains("\\\"") {
                    return RawShape::StringEncodedJson {
                        container: map.clone(),
                        encoded: trimmed.to_string(),
                        form: EncodedForm::NestedEscaped,
                    };
                }
                if trimmed.starts_with('{') && trimmed.ends_with('}') {
                    return RawShape::StringEncodedJson {
                        container: map.clone(),
                        encoded: trimmed.to_string(),
                        form: EncodedForm::DoubleQuotedJson,
                    };
                }
            }
            let has_structure = |obj: &Map<String, Value>| {
                obj.contains_key("summary")
                    || STRUCTURED_FIELDS.iter().any(|f| obj.contains_key(*f))
            };
            let analysis_structured = map
                .get("analysis")
                .and_then(Value::as_object)
                .map(has_structure)
                .unwrap_or(false);
            if analysis_structured || has_structure(map) {
                return RawShape::StructuredDirect(map.clone());
            }
            // Bare wrapper objects ({"response": "..."} and friends) carry
            // nothing but prose; salvage the text instead of recording an
            // empty analysis.
            for key in ["response", "output", "text", "message"] {
                if let Some(text) = map.get(key).and_then(Value::as_str) {
                    return RawShape::FreeText(text.to_string());
                }
            }
            RawShape::StructuredDirect(map.clone())
        }
        Value::String(text) => {
            let trimmed = text.trim();
            if trimmed.starts_with("```") {
                return RawShape::MarkdownFenced {
                    container: Map::new(),
                    encoded: trimmed.to_string(),
                };
            }
            if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(trimmed) {
                return classify(&Value::Object(map));
            }
            RawShape::FreeText(text.clone())
        }
        _ => RawShape::FreeText(String::new()),
    }
}

/// Intermediate extraction result shared by the per-variant parsers.
#[derive(Debug, Default)]
struct Draft {
    scene_id: Option<String>,
    failed: bool,
    summary: String,
    key_findings: Vec<String>,
    metrics: HashMap<String, Value>,
    confidence: Option<f64>,
    insights: Vec<String>,
    recommendations: Vec<String>,
    parse_issues: Vec<String>,
}

pub fn normalise(
    agent_type: AgentType,
    fallback_scene_id: &str,
    raw: &Value,
) -> NormaliseResult<AgentResponse> {
    let mut draft = match classify(raw) {
        RawShape::StructuredDirect(map) => parse_structured(&map),
        RawShape::StringEncodedJson {
            container,
            encoded,
            form,
        } => parse_string_encoded(&container, &encoded, form),
        RawShape::MarkdownFenced { container, encoded } => parse_markdown_fenced(&container, &encoded),
        RawShape::FreeText(text) => parse_free_text(&text),
    };

    let scene_id = resolve_scene_id(draft.scene_id.take(), fallback_scene_id)?;

    if let Some(confidence) = draft.confidence {
        if !(0.0..=1.0).contains(&confidence) {
            draft.confidence = Some(confidence.clamp(0.0, 1.0));
            draft
                .parse_issues
                .push("confidence clamped to [0, 1]".to_string());
        }
    }

    // Sanitation over every leaf string before anything is recorded.
    let mut categories: BTreeSet<SuspiciousCategory> = BTreeSet::new();
    let (summary, summary_matches) = crate::sanitise::sanitise_text(&draft.summary);
    categories.extend(summary_matches);
    draft.summary = summary;
    sanitise_strings(&mut draft.key_findings, &mut categories);
    sanitise_strings(&mut draft.insights, &mut categories);
    sanitise_strings(&mut draft.recommendations, &mut categories);
    for value in draft.metrics.values_mut() {
        sanitise_value(value, &mut categories);
    }

    let mut issues = draft.parse_issues;
    for category in &categories {
        issues.push(category.issue_text().to_string());
    }

    let mentions_scene = draft.summary.contains(&scene_id)
        || draft
            .key_findings
            .iter()
            .chain(draft.insights.iter())
            .chain(draft.recommendations.iter())
            .any(|s| s.contains(&scene_id));

    debug!(
        agent = %agent_type,
        scene = %scene_id,
        findings = draft.key_findings.len(),
        issues = issues.len(),
        "Normalised agent output"
    );

    Ok(AgentResponse {
        agent_type,
        scene_id,
        status: if draft.failed {
            ResponseStatus::Failed
        } else {
            ResponseStatus::Success
        },
        analysis: Analysis {
            summary: draft.summary,
            key_findings: draft.key_findings,
            metrics: draft.metrics,
            confidence: draft.confidence,
        },
        insights: draft.insights,
        recommendations: draft.recommendations,
        validation: ValidationReport::with_issues(issues, mentions_scene),
        metadata: ResponseMetadata::default(),
    })
}

fn resolve_scene_id(reported: Option<String>, fallback: &str) -> NormaliseResult<String> {
    match reported {
        Some(id) => {
            // An explicitly reported sentinel raises rather than silently
            // passing through to cross-scene joins.
            if id.trim().is_empty() || id == SENTINEL_SCENE_ID {
                return Err(NormaliseError::InvalidSceneId(id));
            }
            Ok(id)
        }
        None => {
            if fallback.trim().is_empty() || fallback == SENTINEL_SCENE_ID {
                return Err(NormaliseError::InvalidSceneId(fallback.to_string()));
            }
            Ok(fallback.to_string())
        }
    }
}

fn parse_structured(map: &Map<String, Value>) -> Draft {
    let analysis = map.get("analysis").and_then(Value::as_object);

    let summary = analysis
        .and_then(|a| a.get("summary"))
        .or_else(|| map.get("summary"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    Draft {
        scene_id: map
            .get("scene_id")
            .and_then(Value::as_str)
            .map(str::to_string),
        failed: map.get("status").and_then(Value::as_str) == Some("failed"),
        summary,
        key_findings: string_list(analysis, map, "key_findings"),
        metrics: analysis
            .and_then(|a| a.get("metrics"))
            .or_else(|| map.get("metrics"))
            .and_then(Value::as_object)
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default(),
        confidence: analysis
            .and_then(|a| a.get("confidence"))
            .or_else(|| map.get("confidence"))
            .and_then(Value::as_f64),
        insights: string_list(analysis, map, "insights"),
        recommendations: string_list(analysis, map, "recommendations"),
        parse_issues: Vec::new(),
    }
}

/// Reads a string list from the top level or the analysis object,
/// whichever has it.
fn string_list(
    analysis: Option<&Map<String, Value>>,
    map: &Map<String, Value>,
    field: &str,
) -> Vec<String> {
    map.get(field)
        .or_else(|| analysis.and_then(|a| a.get(field)))
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn parse_string_encoded(
    container: &Map<String, Value>,
    encoded: &str,
    form: EncodedForm,
) -> Draft {
    let decoded = match form {
        EncodedForm::DoubleQuotedJson => serde_json::from_str::<Value>(encoded)
            .map_err(|e| format!("double-quoted summary failed to parse: {e}")),
        EncodedForm::SingleQuotedLiteral => {
            let rewritten = normalise_quotes(encoded);
            serde_json::from_str::<Value>(&rewritten)
                .map_err(|e| format!("single-quoted summary failed to parse: {e}"))
        }
        EncodedForm::NestedEscaped => decode_nested(encoded),
    };

    match decoded {
        Ok(Value::Object(inner)) => merge_container_and_inner(container, &inner),
        Ok(other) => {
            let mut draft = parse_structured(container);
            draft.summary = other.to_string();
            draft
                .parse_issues
                .push("embedded summary decoded to a non-object".to_string());
            draft
        }
        Err(issue) => {
            // Irrecoverable decode: keep the run, surface the failure.
            let mut draft = parse_structured(container);
            draft.summary = encoded.to_string();
            draft.parse_issues.push(issue);
            draft
        }
    }
}

fn parse_markdown_fenced(container: &Map<String, Value>, encoded: &str) -> Draft {
    let body = strip_code_fence(encoded);
    let parsed = serde_json::from_str::<Value>(&body)
        .or_else(|_| serde_json::from_str::<Value>(&normalise_quotes(&body)));

    match parsed {
        Ok(Value::Object(inner)) => merge_container_and_inner(container, &inner),
        _ => {
            let mut draft = if container.is_empty() {
                parse_free_text(&body)
            } else {
                parse_structured(container)
            };
            draft
                .parse_issues
                .push("markdown-fenced summary failed to parse as JSON".to_string());
            draft
        }
    }
}

fn parse_free_text(text: &str) -> Draft {
    let mut draft = Draft {
        summary: text.trim().to_string(),
        ..Draft::default()
    };

    if draft.summary.is_empty() {
        draft.parse_issues.push("agent returned no output".to_string());
        return draft;
    }

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let lower = line.to_lowercase();
        if lower.contains("recommend") || lower.contains("should") {
            draft.recommendations.push(strip_bullet(line).to_string());
        } else if is_bullet(line) {
            draft.key_findings.push(strip_bullet(line).to_string());
        }
    }
    draft
}

/// Inner structured fields win; the container still supplies identity,
/// status and whatever lists the inner object omits.
fn merge_container_and_inner(container: &Map<String, Value>, inner: &Map<String, Value>) -> Draft {
    let outer = parse_structured(container);
    let mut merged = parse_structured(inner);

    // The inner blob rarely repeats the scene id; never let it override a
    // container-level one.
    merged.scene_id = outer.scene_id.or(merged.scene_id);
    merged.failed = outer.failed || merged.failed;
    if merged.insights.is_empty() {
        merged.insights = outer.insights;
    }
    if merged.recommendations.is_empty() {
        merged.recommendations = outer.recommendations;
    }
    if merged.key_findings.is_empty() {
        merged.key_findings = outer.key_findings;
    }
    merged
}

/// Rewrites a single-quoted dict literal into parseable JSON. Apostrophes
/// inside prose will break the strict parse and fall through to the issue
/// path, which is the accepted trade-off.
fn normalise_quotes(text: &str) -> String {
    text.replace('\'', "\"")
        .replace(": True", ": true")
        .replace(": False", ": false")
        .replace(": None", ": null")
}

fn decode_nested(encoded: &str) -> Result<Value, String> {
    let mut candidate = encoded.to_string();
    for _ in 0..3 {
        match serde_json::from_str::<Value>(&candidate) {
            Ok(Value::String(inner)) => candidate = inner,
            Ok(value) => return Ok(value),
            Err(_) if candidate.contains("\\\"") => {
                candidate = candidate.replace("\\\"", "\"");
            }
            Err(e) => return Err(format!("nested-escaped summary failed to parse: {e}")),
        }
    }
    serde_json::from_str::<Value>(&candidate)
        .map_err(|e| format!("nested-escaped summary failed to parse: {e}"))
}

fn strip_code_fence(text: &str) -> String {
    let mut lines = text.lines();
    let mut body = Vec::new();
    for line in lines.by_ref() {
        if line.trim().starts_with("```") {
            break;
        }
    }
    for line in lines {
        if line.trim().starts_with("```") {
            break;
        }
        body.push(line);
    }
    body.join("\n")
}

fn is_bullet(line: &str) -> bool {
    if let Some(first) = line.chars().next() {
        if matches!(first, '-' | '*' | '•') {
            return true;
        }
    }
    // Numbered bullets: "1." / "2)" prefixes.
    let digits: String = line.chars().take_while(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return false;
    }
    matches!(
        line[digits.len()..].chars().next(),
        Some('.') | Some(')')
    )
}

fn strip_bullet(line: &str) -> &str {
    let line = line.trim_start_matches(['-', '*', '•']).trim_start();
    let digits: String = line.chars().take_while(char::is_ascii_digit).collect();
    if !digits.is_empty() {
        let rest = &line[digits.len()..];
        if let Some(stripped) = rest.strip_prefix('.').or_else(|| rest.strip_prefix(')')) {
            return stripped.trim_start();
        }
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classify_picks_each_variant() {
        let direct = json!({"analysis": {"summary": "plain text", "key_findings": []}});
        assert!(matches!(classify(&direct), RawShape::StructuredDirect(_)));

        let double = json!({"analysis": {"summary": "{\"summary\": \"inner\"}"}});
        assert!(matches!(
            classify(&double),
            RawShape::StringEncodedJson {
                form: EncodedForm::DoubleQuotedJson,
                ..
            }
        ));

        let single = json!({"analysis": {"summary": "{'summary': 'inner'}"}});
        assert!(matches!(
            classify(&single),
            RawShape::StringEncodedJson {
                form: EncodedForm::SingleQuotedLiteral,
                ..
            }
        ));

        let fenced = json!({"analysis": {"summary": "```json\n{}\n```"}});
        assert!(matches!(classify(&fenced), RawShape::MarkdownFenced { .. }));

        let text = json!("just words");
        assert!(matches!(classify(&text), RawShape::FreeText(_)));
    }

    #[test]
    fn double_quoted_summary_is_unwrapped() {
        let raw = json!({
            "scene_id": "scene-0042",
            "analysis": {
                "summary": "{\"summary\": \"hard braking cluster\", \"key_findings\": [\"f1\"]}"
            },
            "insights": ["outer insight"]
        });
        let response = normalise(AgentType::SceneUnderstanding, "scene-0042", &raw).unwrap();
        assert_eq!(response.analysis.summary, "hard braking cluster");
        assert_eq!(response.analysis.key_findings, vec!["f1".to_string()]);
        assert_eq!(response.insights, vec!["outer insight".to_string()]);
    }

    #[test]
    fn single_quoted_literal_is_rewritten_and_parsed() {
        let raw = json!({
            "analysis": {
                "summary": "{'summary': 'lane change near miss', 'confidence': 0.8}"
            }
        });
        let response = normalise(AgentType::SceneUnderstanding, "scene-0001", &raw).unwrap();
        assert_eq!(response.analysis.summary, "lane change near miss");
        assert_eq!(response.analysis.confidence, Some(0.8));
        assert_eq!(response.validation.issue_count, 0);
    }

    #[test]
    fn markdown_fence_is_stripped() {
        let raw = json!({
            "analysis": {
                "summary": "```json\n{\"summary\": \"fenced\", \"recommendations\": [\"slow down\"]}\n```"
            }
        });
        let response = normalise(AgentType::Coordinator, "scene-0001", &raw).unwrap();
        assert_eq!(response.analysis.summary, "fenced");
        assert_eq!(response.recommendations, vec!["slow down".to_string()]);
    }

    #[test]
    fn nested_escaped_summary_is_decoded() {
        let inner = "{\\\"summary\\\": \\\"deep\\\"}";
        let raw = json!({"analysis": {"summary": inner}});
        let response = normalise(AgentType::Coordinator, "scene-0001", &raw).unwrap();
        assert_eq!(response.analysis.summary, "deep");
    }

    #[test]
    fn free_text_bullets_become_findings_and_recommendations() {
        let raw = json!(
            "Observed heavy rain.\n- wet road surface\n- reduced visibility\nDrivers should increase following distance."
        );
        let response = normalise(AgentType::SceneUnderstanding, "scene-0001", &raw).unwrap();
        assert_eq!(
            response.analysis.key_findings,
            vec!["wet road surface".to_string(), "reduced visibility".to_string()]
        );
        assert_eq!(
            response.recommendations,
            vec!["Drivers should increase following distance.".to_string()]
        );
    }

    #[test]
    fn unparseable_embedded_summary_is_an_issue_not_an_error() {
        let raw = json!({
            "analysis": {"summary": "{\"summary\": broken"}
        });
        let shape = classify(&raw);
        // Starts with '{' but never closes: still free of panics either way.
        let response = normalise(AgentType::Coordinator, "scene-0001", &raw).unwrap();
        assert_eq!(response.status, ResponseStatus::Success);
        match shape {
            RawShape::StructuredDirect(_) => {
                // No distinguishing suffix, treated as direct text summary.
                assert_eq!(response.validation.issue_count, 0);
            }
            _ => assert!(response.validation.issue_count >= 1),
        }
    }

    #[test]
    fn sentinel_scene_id_raises() {
        let raw = json!({"scene_id": "unknown", "analysis": {"summary": "x"}});
        let err = normalise(AgentType::Coordinator, "scene-0001", &raw).unwrap_err();
        assert!(matches!(err, NormaliseError::InvalidSceneId(_)));
    }

    #[test]
    fn missing_scene_id_falls_back_to_caller() {
        let raw = json!({"analysis": {"summary": "x"}});
        let response = normalise(AgentType::Coordinator, "scene-0042", &raw).unwrap();
        assert_eq!(response.scene_id, "scene-0042");

        let err = normalise(AgentType::Coordinator, SENTINEL_SCENE_ID, &raw).unwrap_err();
        assert!(matches!(err, NormaliseError::InvalidSceneId(_)));
    }

    #[test]
    fn confidence_is_clamped_with_issue() {
        let raw = json!({"analysis": {"summary": "x", "confidence": 1.7}});
        let response = normalise(AgentType::Coordinator, "scene-0001", &raw).unwrap();
        assert_eq!(response.analysis.confidence, Some(1.0));
        assert!(response
            .validation
            .issues
            .iter()
            .any(|i| i.contains("clamped")));
    }

    #[test]
    fn normalisation_is_idempotent_on_canonical_output() {
        for raw in [
            json!({
                "scene_id": "scene-0042",
                "analysis": {"summary": "{\"summary\": \"s\", \"key_findings\": [\"a\", \"b\"]}"},
                "insights": ["i1"],
                "recommendations": ["r1"]
            }),
            json!({
                "analysis": {"summary": "{'summary': 's', 'key_findings': ['a']}"}
            }),
            json!({
                "analysis": {"summary": "```json\n{\"summary\": \"s\", \"insights\": [\"i\"]}\n```"}
            }),
        ] {
            let first = normalise(AgentType::SceneUnderstanding, "scene-0042", &raw).unwrap();
            let reparsed = serde_json::to_value(&first).unwrap();
            let second = normalise(AgentType::SceneUnderstanding, "scene-0042", &reparsed).unwrap();
            assert_eq!(first.analysis.key_findings, second.analysis.key_findings);
            assert_eq!(first.insights, second.insights);
            assert_eq!(first.recommendations, second.recommendations);
        }
    }

    #[test]
    fn bare_wrapper_objects_are_salvaged_as_text() {
        let raw = json!({"response": "- unexpected pedestrian crossing"});
        let response = normalise(AgentType::SceneUnderstanding, "scene-0001", &raw).unwrap();
        assert_eq!(
            response.analysis.key_findings,
            vec!["unexpected pedestrian crossing".to_string()]
        );
    }

    #[test]
    fn mentions_scene_is_detected() {
        let raw = json!({"analysis": {"summary": "scene-0042 shows a cut-in"}});
        let response = normalise(AgentType::Coordinator, "scene-0042", &raw).unwrap();
        assert!(response.validation.mentions_scene);
    }
}
