//! Configuration file loading and parsing.

use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Config loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {path}")]
    NotFound { path: PathBuf },

    #[error("failed to read config: {source}")]
    ReadError {
        #[from]
        source: std::io::Error,
    },

    #[error("invalid YAML at line {}: {message}", line.map(|l| l.to_string()).unwrap_or_else(|| "unknown".to_string()))]
    ParseError { line: Option<usize>, message: String },

    #[error("environment variable not found: {var}")]
    EnvVarNotFound { var: String },
}

/// Loads YAML configuration files into any deserializable type.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    path: PathBuf,
}

impl ConfigLoader {
    /// Create a loader for the given config file.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Load the file, failing if it does not exist.
    pub fn load<T: DeserializeOwned>(&self) -> Result<T, ConfigError> {
        if !self.path.exists() {
            return Err(ConfigError::NotFound {
                path: self.path.clone(),
            });
        }

        let contents = std::fs::read_to_string(&self.path)?;
        Self::parse(&contents)
    }

    /// Parse YAML text after expanding environment variables.
    pub fn parse<T: DeserializeOwned>(contents: &str) -> Result<T, ConfigError> {
        let expanded = expand_env_vars(contents)?;

        serde_yaml::from_str(&expanded).map_err(|e| ConfigError::ParseError {
            line: e.location().map(|l| l.line()),
            message: e.to_string(),
        })
    }
}

/// Expand environment variables in the form `${VAR}` or `${VAR:-default}`.
pub fn expand_env_vars(content: &str) -> Result<String, ConfigError> {
    let re = regex::Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").map_err(|e| {
        ConfigError::ParseError {
            line: None,
            message: e.to_string(),
        }
    })?;

    let mut result = content.to_string();
    for cap in re.captures_iter(content) {
        let full_match = &cap[0];
        let var_name = &cap[1];
        let default = cap.get(2).map(|m| m.as_str());

        let value = match std::env::var(var_name) {
            Ok(v) => v,
            Err(_) => match default {
                Some(d) => d.to_string(),
                None => {
                    return Err(ConfigError::EnvVarNotFound {
                        var: var_name.to_string(),
                    })
                }
            },
        };

        result = result.replace(full_match, &value);
    }

    Ok(result)
}
