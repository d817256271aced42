//! `{{source.name}}` substitution in action settings

use crate::context::{Context, ContextError};
use regex::{Captures, Regex};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").expect("Invalid placeholder regex")
});

/// Replace every placeholder inside the string values of `settings`
///
/// Each distinct reference is resolved once. Absent references become the
/// empty string. Object keys are left alone.
pub async fn substitute(settings: &Value, ctx: &Context<'_>) -> Result<Value, ContextError> {
    let mut references = BTreeSet::new();
    collect(settings, &mut references);
    if references.is_empty() {
        return Ok(settings.clone());
    }

    let mut resolved = HashMap::with_capacity(references.len());
    for reference in references {
        let value = ctx.resolve_reference(&reference).await?.unwrap_or_default();
        resolved.insert(reference, value);
    }

    Ok(replace(settings, &resolved))
}

fn collect(value: &Value, references: &mut BTreeSet<String>) {
    match value {
        Value::String(text) => {
            for caps in PLACEHOLDER.captures_iter(text) {
                references.insert(caps[1].to_string());
            }
        }
        Value::Array(items) => items.iter().for_each(|item| collect(item, references)),
        Value::Object(map) => map.values().for_each(|item| collect(item, references)),
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
}

fn replace(value: &Value, resolved: &HashMap<String, String>) -> Value {
    match value {
        Value::String(text) => {
            let replaced = PLACEHOLDER.replace_all(text, |caps: &Captures<'_>| {
                resolved.get(&caps[1]).cloned().unwrap_or_default()
            });
            Value::String(replaced.into_owned())
        }
        Value::Array(items) => {
            Value::Array(items.iter().map(|item| replace(item, resolved)).collect())
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, item)| (key.clone(), replace(item, resolved)))
                .collect(),
        ),
        other => other.clone(),
    }
}
