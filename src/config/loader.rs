//! Configuration loading from disk.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::config::schema::ProxyConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<ProxyConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(&content)
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<ProxyConfig, ConfigError> {
    let config: ProxyConfig = toml::from_str(content)?;
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_file() {
        let config = parse_config(
            r#"
            [listener]
            bind_address = "127.0.0.1:8080"

            [[upstreams]]
            address = "127.0.0.1:8000"
            weight = 2

            [health_check]
            interval_ms = 2000
            timeout_ms = 500
            "#,
        )
        .unwrap();

        assert_eq!(config.upstreams[0].weight, 2);
        assert_eq!(config.health_check.timeout_ms, 500);
    }

    #[test]
    fn reports_validation_errors() {
        let err = parse_config("[listener]\nbind_address = \"127.0.0.1:8080\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(ref errors) if errors == &[ValidationError::NoUpstreams]));
        assert_eq!(err.to_string(), "validation failed: no upstreams configured");
    }

    #[test]
    fn reports_syntax_errors() {
        let err = parse_config("[[upstreams]\naddress = ").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = load_config(Path::new("/nonexistent/upstream-router.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn loads_from_disk() {
        let path = std::env::temp_dir().join(format!("upstream-router-{}.toml", uuid::Uuid::new_v4()));
        fs::write(&path, "[[upstreams]]\naddress = \"10.0.0.1:80\"\n").unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.upstreams[0].address, "10.0.0.1:80");
        let _ = fs::remove_file(&path);
    }
}
