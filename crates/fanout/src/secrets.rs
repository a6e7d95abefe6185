//! Secret resolution for credentials named in the engine config.
//!
//! A secret can be given inline, as a file to read (Docker secrets), or as
//! the name of an environment variable. The first non-empty source wins.

use std::fs;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("No secret source provided (need one of: direct value, file path, or env var name)")]
    NoSourceProvided,

    #[error("Failed to read secret from file '{path}': {source}")]
    FileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Environment variable '{name}' not set")]
    EnvVarNotSet { name: String },

    #[error("Environment variable '{name}' contains invalid UTF-8")]
    EnvVarNotUnicode { name: String },
}

/// Where to find a secret. Field names follow the config file keys
/// (`api_key`, `api_key_file`, `api_key_env_var`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretSource {
    #[serde(default, rename = "api_key", skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, rename = "api_key_file", skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, rename = "api_key_env_var", skip_serializing_if = "Option::is_none")]
    pub env_var: Option<String>,
}

impl SecretSource {
    pub fn is_configured(&self) -> bool {
        [&self.value, &self.file, &self.env_var]
            .iter()
            .any(|s| s.as_deref().is_some_and(|s| !s.is_empty()))
    }

    /// Resolves the secret: inline value, then file contents, then env var.
    /// File and env var contents are trimmed.
    pub fn resolve(&self) -> Result<SecretString, SecretError> {
        if let Some(value) = non_empty(&self.value) {
            return Ok(SecretString::from(value.to_string()));
        }

        if let Some(path) = non_empty(&self.file) {
            let expanded = expand_home(path);
            let content = fs::read_to_string(&expanded).map_err(|e| SecretError::FileRead {
                path: expanded.clone(),
                source: e,
            })?;
            return Ok(SecretString::from(content.trim().to_string()));
        }

        if let Some(name) = non_empty(&self.env_var) {
            return match std::env::var(name) {
                Ok(value) => Ok(SecretString::from(value.trim().to_string())),
                Err(std::env::VarError::NotPresent) => Err(SecretError::EnvVarNotSet {
                    name: name.to_string(),
                }),
                Err(std::env::VarError::NotUnicode(_)) => Err(SecretError::EnvVarNotUnicode {
                    name: name.to_string(),
                }),
            };
        }

        Err(SecretError::NoSourceProvided)
    }

    /// Like [`resolve`](Self::resolve) but an unconfigured source is `None`.
    pub fn resolve_optional(&self) -> Result<Option<SecretString>, SecretError> {
        match self.resolve() {
            Ok(secret) => Ok(Some(secret)),
            Err(SecretError::NoSourceProvided) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.is_empty())
}

/// Expands a leading `~` to the home directory.
fn expand_home(path: &str) -> String {
    if path == "~" || path.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            return path.replacen('~', &home.to_string_lossy(), 1);
        }
    }
    path.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use serial_test::serial;
    use std::io::Write;

    fn source(value: Option<&str>, file: Option<&str>, env_var: Option<&str>) -> SecretSource {
        SecretSource {
            value: value.map(String::from),
            file: file.map(String::from),
            env_var: env_var.map(String::from),
        }
    }

    #[test]
    #[serial]
    fn test_inline_value_wins() {
        std::env::set_var("FANOUT_TEST_KEY", "from-env");
        let secret = source(Some("inline"), None, Some("FANOUT_TEST_KEY"))
            .resolve()
            .unwrap();
        assert_eq!(secret.expose_secret(), "inline");
        std::env::remove_var("FANOUT_TEST_KEY");
    }

    #[test]
    #[serial]
    fn test_file_before_env_and_trimmed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "  from-file  ").unwrap();
        std::env::set_var("FANOUT_TEST_KEY", "from-env");

        let path = file.path().to_string_lossy().to_string();
        let secret = source(None, Some(&path), Some("FANOUT_TEST_KEY"))
            .resolve()
            .unwrap();
        assert_eq!(secret.expose_secret(), "from-file");
        std::env::remove_var("FANOUT_TEST_KEY");
    }

    #[test]
    #[serial]
    fn test_env_var_fallback() {
        std::env::set_var("FANOUT_TEST_KEY", "from-env\n");
        let secret = source(Some(""), Some(""), Some("FANOUT_TEST_KEY"))
            .resolve()
            .unwrap();
        assert_eq!(secret.expose_secret(), "from-env");
        std::env::remove_var("FANOUT_TEST_KEY");
    }

    #[test]
    fn test_errors() {
        assert!(matches!(
            SecretSource::default().resolve(),
            Err(SecretError::NoSourceProvided)
        ));
        assert!(matches!(
            source(None, Some("/nonexistent/key"), None).resolve(),
            Err(SecretError::FileRead { .. })
        ));
        assert!(matches!(
            source(None, None, Some("FANOUT_SURELY_UNSET_VAR")).resolve(),
            Err(SecretError::EnvVarNotSet { .. })
        ));
    }

    #[test]
    fn test_resolve_optional_and_is_configured() {
        assert!(SecretSource::default().resolve_optional().unwrap().is_none());
        assert!(!SecretSource::default().is_configured());
        assert!(source(Some("k"), None, None).is_configured());
        assert!(source(None, None, Some("FANOUT_SURELY_UNSET_VAR"))
            .resolve_optional()
            .is_err());
    }

    #[test]
    fn test_deserialize_config_keys() {
        let parsed: SecretSource =
            serde_json::from_str(r#"{"api_key_env_var": "OPENAI_API_KEY"}"#).unwrap();
        assert_eq!(parsed.env_var.as_deref(), Some("OPENAI_API_KEY"));
        assert!(parsed.value.is_none());
    }
}
