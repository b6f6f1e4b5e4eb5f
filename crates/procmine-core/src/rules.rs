// Extraction rules
//
// A rule scans selected text fields of an event with a regex whose named
// capture groups feed a name template and a data mapping. Rules carry
// usage counters and a confidence that ontology feedback adjusts over time.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, Result};

/// Where a rule came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub enum RuleProvenance {
    /// Shipped with the default ontology
    Seed,
    /// Created through the API
    User,
    /// Proposed by correction-driven generalisation
    Learned,
}

impl RuleProvenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleProvenance::Seed => "seed",
            RuleProvenance::User => "user",
            RuleProvenance::Learned => "learned",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "seed" => RuleProvenance::Seed,
            "learned" => RuleProvenance::Learned,
            _ => RuleProvenance::User,
        }
    }
}

/// An extraction rule as persisted
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ExtractionRule {
    pub id: Uuid,
    pub name: String,
    /// Target object type (stable name)
    pub object_type: String,
    /// Event data fields scanned, in order, e.g. ["title", "url", "ocr_text"]
    pub source_fields: Vec<String>,
    /// Regex with named capture groups
    pub pattern: String,
    /// Object name template referencing capture groups, e.g. "PO-{po_number}"
    pub name_template: String,
    /// Capture group name -> object data key
    pub data_mapping: BTreeMap<String, String>,
    pub enabled: bool,
    /// Higher priority rules are applied first; ordering only, never dedup
    pub priority: i32,
    pub provenance: RuleProvenance,
    pub match_count: i64,
    pub confirm_count: i64,
    pub reject_count: i64,
    /// 0..1, adjusted by confirm/reject feedback
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One object binding produced by applying a rule to a single match
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedMatch {
    pub name: String,
    pub data: serde_json::Map<String, serde_json::Value>,
}

/// A rule with its regex compiled and its template validated
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub rule: ExtractionRule,
    regex: Regex,
}

impl CompiledRule {
    /// Compile and validate a rule.
    ///
    /// Fails with `invalid_argument` when the regex does not compile or a
    /// template placeholder resolves to neither a named capture group nor a
    /// mapped data key.
    pub fn compile(rule: ExtractionRule) -> Result<Self> {
        let regex = Regex::new(&rule.pattern)
            .map_err(|e| EngineError::invalid(format!("rule '{}': {e}", rule.name)))?;

        let groups: Vec<&str> = regex.capture_names().flatten().collect();
        for placeholder in template_placeholders(&rule.name_template) {
            let is_group = groups.contains(&placeholder.as_str());
            let is_data_key = rule.data_mapping.values().any(|k| *k == placeholder);
            if !is_group && !is_data_key {
                return Err(EngineError::invalid(format!(
                    "rule '{}': template placeholder '{{{placeholder}}}' matches no capture group or data key",
                    rule.name
                )));
            }
        }
        for group in rule.data_mapping.keys() {
            if !groups.contains(&group.as_str()) {
                return Err(EngineError::invalid(format!(
                    "rule '{}': data mapping references unknown group '{group}'",
                    rule.name
                )));
            }
        }

        Ok(Self { rule, regex })
    }

    /// Apply the rule to the concatenated source text, returning one
    /// rendered match per non-overlapping regex match.
    pub fn apply(&self, text: &str) -> Vec<RenderedMatch> {
        let mut out = Vec::new();
        for caps in self.regex.captures_iter(text) {
            let mut data = serde_json::Map::new();
            for (group, key) in &self.rule.data_mapping {
                if let Some(m) = caps.name(group) {
                    data.insert(key.clone(), serde_json::Value::String(m.as_str().to_string()));
                }
            }
            let name = render_template(&self.rule.name_template, &caps, &self.rule.data_mapping);
            if name.is_empty() {
                continue;
            }
            out.push(RenderedMatch { name, data });
        }
        out
    }

    /// Concatenate the rule's source fields from an event, single space
    /// separated; missing fields contribute an empty string.
    pub fn source_text(&self, event: &crate::event::WatchedEvent) -> String {
        self.rule
            .source_fields
            .iter()
            .map(|f| event.field_text(f))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Extract `{placeholder}` names from a template
pub fn template_placeholders(template: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) => {
                let name = &after[..close];
                if !name.is_empty() {
                    out.push(name.to_string());
                }
                rest = &after[close + 1..];
            }
            None => break,
        }
    }
    out
}

fn render_template(
    template: &str,
    caps: &regex::Captures<'_>,
    data_mapping: &BTreeMap<String, String>,
) -> String {
    let mut rendered = template.to_string();
    for placeholder in template_placeholders(template) {
        let value = caps
            .name(&placeholder)
            .map(|m| m.as_str())
            .or_else(|| {
                // Placeholder may name a mapped data key; resolve via its group
                data_mapping
                    .iter()
                    .find(|(_, key)| **key == placeholder)
                    .and_then(|(group, _)| caps.name(group))
                    .map(|m| m.as_str())
            })
            .unwrap_or("");
        rendered = rendered.replace(&format!("{{{placeholder}}}"), value);
    }
    rendered.trim().to_string()
}

/// Deterministic generalisation of a sample text into a candidate pattern.
///
/// Literals are escaped, digit runs become `\d+`, uppercase-letter runs
/// become `[A-Z]+`; the whole text is captured as a single `id` group.
pub fn generalize_pattern(sample: &str) -> String {
    #[derive(PartialEq)]
    enum Run {
        Digit,
        Upper,
        Literal,
    }

    let mut body = String::new();
    let mut current: Option<Run> = None;
    for c in sample.chars() {
        let class = if c.is_ascii_digit() {
            Run::Digit
        } else if c.is_ascii_uppercase() {
            Run::Upper
        } else {
            Run::Literal
        };
        match class {
            Run::Digit => {
                if current != Some(Run::Digit) {
                    body.push_str("\\d+");
                }
            }
            Run::Upper => {
                if current != Some(Run::Upper) {
                    body.push_str("[A-Z]+");
                }
            }
            Run::Literal => {
                body.push_str(&regex::escape(&c.to_string()));
            }
        }
        current = Some(class);
    }
    format!("(?P<id>{body})")
}

/// Build the disabled candidate rule proposed after repeated corrections
pub fn propose_learned_rule(
    object_type: &str,
    sample_text: &str,
    source_fields: Vec<String>,
    now: DateTime<Utc>,
) -> ExtractionRule {
    ExtractionRule {
        id: Uuid::now_v7(),
        name: format!("learned: {object_type} from corrections"),
        object_type: object_type.to_string(),
        source_fields,
        pattern: generalize_pattern(sample_text),
        name_template: "{id}".to_string(),
        data_mapping: BTreeMap::new(),
        enabled: false,
        priority: 0,
        provenance: RuleProvenance::Learned,
        match_count: 0,
        confirm_count: 0,
        reject_count: 0,
        confidence: 0.5,
        created_at: now,
        updated_at: now,
    }
}
