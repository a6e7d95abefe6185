//! Prompt template rendering.
//!
//! Templates reference content-block fields as `{name}`. Substitution is
//! literal per placeholder: `{A}` is replaced everywhere it occurs, and text
//! that is not a placeholder is left untouched.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

static RE_PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([^{}]+)\}").unwrap());

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PromptError {
    #[error("Prompt placeholder '{{{0}}}' has no matching field")]
    MissingPlaceholderValue(String),
}

/// Placeholder names in order of first appearance, without duplicates.
pub fn placeholders(template: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for cap in RE_PLACEHOLDER.captures_iter(template) {
        let name = cap[1].trim().to_string();
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

/// Renders `template` against `fields`.
///
/// Field names and values are trimmed first. Every placeholder must have a
/// field. A template without placeholders given exactly one field gets the
/// value appended after a blank line.
pub fn render(template: &str, fields: &BTreeMap<String, String>) -> Result<String, PromptError> {
    let fields: BTreeMap<&str, &str> = fields
        .iter()
        .map(|(name, value)| (name.trim(), value.trim()))
        .collect();

    let mut missing = None;
    let rendered = RE_PLACEHOLDER.replace_all(template, |cap: &regex::Captures<'_>| {
        let name = cap[1].trim();
        match fields.get(name) {
            Some(value) => (*value).to_string(),
            None => {
                if missing.is_none() {
                    missing = Some(name.to_string());
                }
                String::new()
            }
        }
    });

    if let Some(name) = missing {
        return Err(PromptError::MissingPlaceholderValue(name));
    }

    if !RE_PLACEHOLDER.is_match(template) && fields.len() == 1 {
        let value = fields.values().next().copied().unwrap_or_default();
        return Ok(format!("{}\n\n{}", template, value));
    }

    Ok(rendered.into_owned())
}
