//! `%name%` placeholder handling for workflow templates.
//!
//! Everything here is pure: templates are walked as `serde_json::Value`
//! trees, tokens are found in string leaves only, and substitution always
//! builds a fresh tree so the loaded template is never touched.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Number, Value};

use crate::catalogue::{default_value, PlaceholderCategory};

/// One or more non-`%` characters between two `%`, never across a line break.
fn token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"%([^%\r\n]+)%").expect("static token pattern"))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceholderToken {
    pub key: String,
    /// Dotted location of the string leaf, e.g. `6.inputs.text`.
    pub path: String,
    pub category: PlaceholderCategory,
    pub default_value: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Categorized {
    pub agent_generated: Vec<PlaceholderToken>,
    pub user_configurable: Vec<PlaceholderToken>,
    pub unknown: Vec<PlaceholderToken>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceholderReport {
    /// Distinct keys in order of first discovery.
    pub keys: Vec<String>,
    /// One record per occurrence.
    pub categorized: Categorized,
}

impl PlaceholderReport {
    pub fn total(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Depth-first walk over every string leaf, in document key order.
pub fn visit_strings<F>(value: &Value, visit: &mut F)
where
    F: FnMut(&[String], &str),
{
    fn walk<F>(value: &Value, path: &mut Vec<String>, visit: &mut F)
    where
        F: FnMut(&[String], &str),
    {
        match value {
            Value::String(s) => visit(path, s),
            Value::Array(items) => {
                for (index, item) in items.iter().enumerate() {
                    path.push(index.to_string());
                    walk(item, path, visit);
                    path.pop();
                }
            }
            Value::Object(map) => {
                for (key, item) in map {
                    path.push(key.clone());
                    walk(item, path, visit);
                    path.pop();
                }
            }
            Value::Null | Value::Bool(_) | Value::Number(_) => {}
        }
    }

    let mut path = Vec::new();
    walk(value, &mut path, visit);
}

/// Rebuilds `value` with every string leaf passed through `rewrite`.
/// Numbers, booleans, nulls and the array/object shape are kept as they are.
pub fn map_strings<F>(value: &Value, rewrite: &F) -> Value
where
    F: Fn(&str) -> String,
{
    match value {
        Value::String(s) => Value::String(rewrite(s)),
        Value::Array(items) => Value::Array(items.iter().map(|v| map_strings(v, rewrite)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, v)| (key.clone(), map_strings(v, rewrite)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Keys of every placeholder occurring in `text`, left to right.
pub fn tokens_in(text: &str) -> impl Iterator<Item = &str> {
    token_pattern()
        .captures_iter(text)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
}

pub fn extract(template: &Value) -> PlaceholderReport {
    let mut report = PlaceholderReport::default();
    let mut seen = HashSet::new();

    visit_strings(template, &mut |path, text| {
        if !text.contains('%') {
            return;
        }
        for key in tokens_in(text) {
            if seen.insert(key.to_string()) {
                report.keys.push(key.to_string());
            }
            let category = PlaceholderCategory::of(key);
            let token = PlaceholderToken {
                key: key.to_string(),
                path: path.join("."),
                category,
                default_value: match category {
                    PlaceholderCategory::Unknown => None,
                    _ => default_value(key),
                },
            };
            match category {
                PlaceholderCategory::AgentGenerated => report.categorized.agent_generated.push(token),
                PlaceholderCategory::UserConfigurable => {
                    report.categorized.user_configurable.push(token)
                }
                PlaceholderCategory::Unknown => report.categorized.unknown.push(token),
            }
        }
    });

    report
}

fn number_to_string(n: &Number) -> String {
    if let Some(i) = n.as_i64() {
        return i.to_string();
    }
    if let Some(u) = n.as_u64() {
        return u.to_string();
    }
    match n.as_f64() {
        Some(f) if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", f as i64),
        Some(f) => f.to_string(),
        None => n.to_string(),
    }
}

/// Text a value takes when spliced into a template string.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => number_to_string(n),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

fn is_token_key(key: &str) -> bool {
    !key.is_empty() && !key.contains(['\r', '\n'])
}

/// One left-to-right pass over `text`. Inserted values are never scanned
/// again, and a `%` that does not open a known token is kept as is.
fn splice(text: &str, values: &Map<String, Value>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(open) = rest.find('%') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let Some(close) = after.find('%') else {
            out.push_str(&rest[open..]);
            return out;
        };
        let key = &after[..close];
        match values.get(key).filter(|_| is_token_key(key)) {
            Some(value) => {
                out.push_str(&stringify(value));
                rest = &after[close + 1..];
            }
            None => {
                out.push('%');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Returns a new tree in which every `%key%` for a key present in `values`
/// is replaced. Tokens whose key is absent stay verbatim.
pub fn substitute(template: &Value, values: &Map<String, Value>) -> Value {
    map_strings(template, &|text: &str| {
        if text.contains('%') {
            splice(text, values)
        } else {
            text.to_string()
        }
    })
}

/// Keys the template references that `values` does not supply.
pub fn unresolved(template: &Value, values: &Map<String, Value>) -> Vec<String> {
    extract(template)
        .keys
        .into_iter()
        .filter(|key| !values.contains_key(key))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Validation {
    pub valid: bool,
    pub reason: String,
}

#[derive(Debug, Clone, Copy)]
enum Rule {
    Integer { min: f64, max: f64 },
    Decimal { min: f64, max: f64, min_inclusive: bool },
    NonEmpty,
    NonBlank,
    AnyString,
}

fn rule_for(key: &str) -> Option<Rule> {
    let rule = match key {
        "seed" => Rule::Integer { min: 0.0, max: f64::INFINITY },
        "steps" => Rule::Integer { min: 1.0, max: 150.0 },
        "cfg_scale" => Rule::Decimal { min: 0.0, max: 30.0, min_inclusive: false },
        "width" | "height" => Rule::Integer { min: 64.0, max: 4096.0 },
        "denoise" => Rule::Decimal { min: 0.0, max: 1.0, min_inclusive: true },
        "batch_size" => Rule::Integer { min: 1.0, max: 10.0 },
        "sampler_name" | "scheduler" | "MODEL_NAME" => Rule::NonEmpty,
        "prompt" => Rule::NonBlank,
        "negative_prompt" => Rule::AnyString,
        _ => return None,
    };
    Some(rule)
}

/// Numbers, and strings that parse as numbers, count as numeric.
fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                trimmed.parse::<f64>().ok().filter(|f| f.is_finite())
            }
        }
        _ => None,
    }
}

impl Rule {
    fn accepts(self, value: &Value) -> bool {
        match self {
            Rule::Integer { min, max } => numeric(value)
                .map(|n| n.fract() == 0.0 && n >= min && n <= max)
                .unwrap_or(false),
            Rule::Decimal { min, max, min_inclusive } => numeric(value)
                .map(|n| (if min_inclusive { n >= min } else { n > min }) && n <= max)
                .unwrap_or(false),
            Rule::NonEmpty => value.as_str().map(|s| !s.is_empty()).unwrap_or(false),
            Rule::NonBlank => value.as_str().map(|s| !s.trim().is_empty()).unwrap_or(false),
            Rule::AnyString => value.is_string(),
        }
    }
}

/// Checks `value` against the domain rule for `key`. Keys without a rule
/// are accepted.
pub fn validate(key: &str, value: &Value) -> Validation {
    let Some(rule) = rule_for(key) else {
        return Validation {
            valid: true,
            reason: "No validation rule defined".into(),
        };
    };
    if rule.accepts(value) {
        Validation {
            valid: true,
            reason: "Valid".into(),
        }
    } else {
        Validation {
            valid: false,
            reason: format!("Invalid value for {}: {}", key, stringify(value)),
        }
    }
}

/// Every entry of `values` that fails its rule, as `(key, reason)`.
pub fn invalid_entries(values: &Map<String, Value>) -> Vec<(String, String)> {
    values
        .iter()
        .filter_map(|(key, value)| {
            let verdict = validate(key, value);
            (!verdict.valid).then(|| (key.clone(), verdict.reason))
        })
        .collect()
}
