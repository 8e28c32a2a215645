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

//! Fabricated-reference sanitation. Remote agents occasionally invent
//! links to corporate tools, internal hosts and tracking tickets that do
//! not exist; every leaf string of a normalised response passes through
//! here before the response is recorded.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeSet;

pub const REDACTION_PLACEHOLDER: &str = "[redacted]";

/// Token prefixes that look like ticket ids but are public standards and
/// must never be redacted.
const STANDARD_PREFIXES: [&str; 3] = ["ISO-", "FMVSS-", "UN-ECE-"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SuspiciousCategory {
    CorporateToolUrl,
    InternalDomainUrl,
    DocumentLink,
    TicketId,
}

impl SuspiciousCategory {
    pub fn issue_text(&self) -> &'static str {
        match self {
            SuspiciousCategory::CorporateToolUrl => {
                "redacted fabricated corporate tool link"
            }
            SuspiciousCategory::InternalDomainUrl => {
                "redacted fabricated internal domain reference"
            }
            SuspiciousCategory::DocumentLink => "redacted fabricated document link",
            SuspiciousCategory::TicketId => "redacted fabricated ticket reference",
        }
    }
}

static CORPORATE_TOOL_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"https?://\S*(?:atlassian\.net|jira\.|confluence\.|sharepoint\.com|\.slack\.com)\S*",
    )
    .expect("corporate tool pattern")
});

static INTERNAL_DOMAIN_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"https?://[A-Za-z0-9.-]+\.(?:internal|corp|intranet|local)(?:/\S*)?")
        .expect("internal domain pattern")
});

static DOCUMENT_LINK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"https?://(?:docs|drive)\.google\.com\S*|https?://\S+\.(?:docx?|xlsx?|pdf)\b")
        .expect("document link pattern")
});

static TICKET_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:UN-ECE-|[A-Z]{2,10}-)\d{1,6}\b").expect("ticket pattern"));

fn is_standard_token(token: &str) -> bool {
    STANDARD_PREFIXES
        .iter()
        .any(|prefix| token.starts_with(prefix))
}

/// Redacts every suspicious span in `text`. Returns the cleaned text and
/// the set of categories that matched; the set drives issue recording (one
/// issue per category, not per occurrence).
pub fn sanitise_text(text: &str) -> (String, BTreeSet<SuspiciousCategory>) {
    let mut categories = BTreeSet::new();
    let mut cleaned = text.to_string();

    for (pattern, category) in [
        (&*CORPORATE_TOOL_URL, SuspiciousCategory::CorporateToolUrl),
        (&*INTERNAL_DOMAIN_URL, SuspiciousCategory::InternalDomainUrl),
        (&*DOCUMENT_LINK, SuspiciousCategory::DocumentLink),
    ] {
        if pattern.is_match(&cleaned) {
            categories.insert(category);
            cleaned = pattern.replace_all(&cleaned, REDACTION_PLACEHOLDER).into_owned();
        }
    }

    if TICKET_ID.is_match(&cleaned) {
        let mut redacted_any = false;
        cleaned = TICKET_ID
            .replace_all(&cleaned, |caps: &regex::Captures<'_>| {
                let token = &caps[0];
                if is_standard_token(token) {
                    token.to_string()
                } else {
                    redacted_any = true;
                    REDACTION_PLACEHOLDER.to_string()
                }
            })
            .into_owned();
        if redacted_any {
            categories.insert(SuspiciousCategory::TicketId);
        }
    }

    (cleaned, categories)
}

/// Applies `sanitise_text` to every string leaf of a JSON tree in place,
/// accumulating matched categories across the whole tree.
pub fn sanitise_value(value: &mut Value, categories: &mut BTreeSet<SuspiciousCategory>) {
    match value {
        Value::String(text) => {
            let (cleaned, matched) = sanitise_text(text);
            if !matched.is_empty() {
                *text = cleaned;
                categories.extend(matched);
            }
        }
        Value::Array(items) => {
            for item in items {
                sanitise_value(item, categories);
            }
        }
        Value::Object(map) => {
            for (_, item) in map.iter_mut() {
                sanitise_value(item, categories);
            }
        }
        _ => {}
    }
}

/// Convenience wrapper for plain string lists.
pub fn sanitise_strings(
    items: &mut [String],
    categories: &mut BTreeSet<SuspiciousCategory>,
) {
    for item in items {
        let (cleaned, matched) = sanitise_text(item);
        if !matched.is_empty() {
            *item = cleaned;
            categories.extend(matched);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn clean_text_is_untouched() {
        let input = "Vehicle decelerated at 0.42 g before the junction; visibility was clear.";
        let (cleaned, categories) = sanitise_text(input);
        assert_eq!(cleaned, input);
        assert!(categories.is_empty());
    }

    #[test]
    fn ticket_ids_are_redacted() {
        let (cleaned, categories) = sanitise_text("Tracked as SAFE-1234 and PERC-99.");
        assert!(!cleaned.contains("SAFE-1234"));
        assert!(!cleaned.contains("PERC-99"));
        assert_eq!(cleaned.matches(REDACTION_PLACEHOLDER).count(), 2);
        // One category entry despite two occurrences.
        assert_eq!(categories.len(), 1);
        assert!(categories.contains(&SuspiciousCategory::TicketId));
    }

    #[test]
    fn standards_are_never_redacted() {
        let input = "Complies with ISO-26262, FMVSS-126 and UN-ECE-155.";
        let (cleaned, categories) = sanitise_text(input);
        assert_eq!(cleaned, input);
        assert!(categories.is_empty());
    }

    #[test]
    fn corporate_and_internal_urls_are_redacted() {
        let input =
            "See https://team.atlassian.net/browse/x and https://wiki.corp/page for details.";
        let (cleaned, categories) = sanitise_text(input);
        assert!(!cleaned.contains("atlassian"));
        assert!(!cleaned.contains("wiki.corp"));
        assert_eq!(categories.len(), 2);
    }

    #[test]
    fn document_links_are_redacted() {
        let (cleaned, categories) =
            sanitise_text("Full report at https://docs.google.com/document/d/abc123");
        assert!(cleaned.contains(REDACTION_PLACEHOLDER));
        assert!(categories.contains(&SuspiciousCategory::DocumentLink));
    }

    #[test]
    fn value_tree_leaves_are_sanitised() {
        let mut value = json!({
            "summary": "Logged as BUG-42",
            "nested": {"items": ["ok", "see https://x.sharepoint.com/doc"]},
            "count": 3
        });
        let mut categories = BTreeSet::new();
        sanitise_value(&mut value, &mut categories);
        assert_eq!(value["summary"], format!("Logged as {REDACTION_PLACEHOLDER}"));
        assert!(value["nested"]["items"][1]
            .as_str()
            .unwrap()
            .contains(REDACTION_PLACEHOLDER));
        assert_eq!(categories.len(), 2);
    }
}
