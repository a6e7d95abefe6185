//! Per-job run configuration stored in the `jobs.configs` column.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Rejected job configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid job configuration field '{field}': {reason}")]
pub struct InvalidJobConfig {
    pub field: &'static str,
    pub reason: String,
}

/// How PDF pages are turned into unit content.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentMode {
    /// Extracted page text becomes a `text` field.
    #[default]
    Text,
    /// Pages are rendered to PNG and attached to the unit.
    Image,
}

/// Typed replacement for the free-form configuration map.
///
/// Every field is optional so a job can be configured incrementally; the
/// prompt becomes mandatory only when the job is run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Pages per unit for paged documents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_unit: Option<u32>,
    /// Columns kept from tabular documents. `None` keeps all of them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_fields: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_mode: Option<DocumentMode>,
}

impl JobConfig {
    /// Checks the fields that are present. Called when a job enters CONFIGURED.
    pub fn validate(&self) -> Result<(), InvalidJobConfig> {
        if let Some(prompt) = &self.prompt {
            if prompt.trim().is_empty() {
                return Err(InvalidJobConfig {
                    field: "prompt",
                    reason: "must not be blank".to_string(),
                });
            }
        }

        if let Some(model) = &self.model {
            if model.trim().is_empty() {
                return Err(InvalidJobConfig {
                    field: "model",
                    reason: "must not be blank".to_string(),
                });
            }
        }

        if self.work_unit == Some(0) {
            return Err(InvalidJobConfig {
                field: "workUnit",
                reason: "must be at least 1".to_string(),
            });
        }

        if let Some(fields) = &self.selected_fields {
            if fields.iter().any(|f| f.trim().is_empty()) {
                return Err(InvalidJobConfig {
                    field: "selectedFields",
                    reason: "field names must not be blank".to_string(),
                });
            }
        }

        Ok(())
    }

    /// The prompt template, if one is set and not blank.
    pub fn prompt(&self) -> Option<&str> {
        self.prompt.as_deref().filter(|p| !p.trim().is_empty())
    }

    pub fn model_or<'a>(&'a self, default_model: &'a str) -> &'a str {
        self.model.as_deref().unwrap_or(default_model)
    }

    pub fn work_unit(&self) -> u32 {
        self.work_unit.unwrap_or(1).max(1)
    }

    pub fn document_mode(&self) -> DocumentMode {
        self.document_mode.unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_camel_case_keys() {
        let json = r#"{
            "prompt": "Summarize {text}",
            "workUnit": 3,
            "selectedFields": ["name", "city"],
            "documentMode": "image"
        }"#;
        let config: JobConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.prompt(), Some("Summarize {text}"));
        assert_eq!(config.work_unit(), 3);
        assert_eq!(config.document_mode(), DocumentMode::Image);
        assert_eq!(
            config.selected_fields,
            Some(vec!["name".to_string(), "city".to_string()])
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_defaults() {
        let config = JobConfig::default();
        assert_eq!(config.prompt(), None);
        assert_eq!(config.work_unit(), 1);
        assert_eq!(config.document_mode(), DocumentMode::Text);
        assert_eq!(config.model_or("gpt-4o-mini"), "gpt-4o-mini");
        assert_eq!(serde_json::to_string(&config).unwrap(), "{}");
    }

    #[test]
    fn test_validate_rejects_zero_work_unit() {
        let config = JobConfig {
            work_unit: Some(0),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert_eq!(err.field, "workUnit");
    }

    #[test]
    fn test_validate_rejects_blank_prompt() {
        let config = JobConfig {
            prompt: Some("   ".to_string()),
            ..Default::default()
        };
        assert_eq!(config.validate().unwrap_err().field, "prompt");
        assert_eq!(config.prompt(), None);
    }

    #[test]
    fn test_validate_rejects_blank_selected_field() {
        let config = JobConfig {
            selected_fields: Some(vec!["a".to_string(), " ".to_string()]),
            ..Default::default()
        };
        assert_eq!(config.validate().unwrap_err().field, "selectedFields");
    }
}
