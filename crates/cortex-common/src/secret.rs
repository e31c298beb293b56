use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Config value supplied either inline or via an environment variable.
///
/// ```yaml
/// secret:
///   fromEnv: OPENAI_TOKEN
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Secret {
    pub value: Option<String>,
    pub from_env: Option<String>,
}

impl Secret {
    pub fn literal(value: impl Into<String>) -> Self {
        Self {
            value: Some(value.into()),
            from_env: None,
        }
    }

    pub fn from_env(name: impl Into<String>) -> Self {
        Self {
            value: None,
            from_env: Some(name.into()),
        }
    }

    /// Resolve the value. An unset secret is an empty string (some providers
    /// need none); a named but missing environment variable is a config
    /// error.
    pub fn get(&self) -> Result<String> {
        if let Some(value) = &self.value {
            return Ok(value.clone());
        }
        match &self.from_env {
            Some(name) => std::env::var(name)
                .map_err(|_| Error::Config(format!("environment variable {name} is not set"))),
            None => Ok(String::new()),
        }
    }
}

/// Named header or parameter whose value resolves like a [`Secret`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedSecret {
    pub name: String,
    #[serde(flatten)]
    pub secret: Secret,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_wins() {
        let secret = Secret::literal("token");
        assert_eq!(secret.get().unwrap(), "token");
    }

    #[test]
    fn test_empty_secret_is_empty_string() {
        assert_eq!(Secret::default().get().unwrap(), "");
    }

    #[test]
    fn test_missing_env_is_config_error() {
        let secret = Secret::from_env("CORTEX_TEST_SECRET_THAT_DOES_NOT_EXIST");
        assert!(matches!(secret.get(), Err(Error::Config(_))));
    }

    #[test]
    fn test_env_resolution() {
        std::env::set_var("CORTEX_TEST_SECRET", "from-env");
        let secret = Secret::from_env("CORTEX_TEST_SECRET");
        assert_eq!(secret.get().unwrap(), "from-env");
        std::env::remove_var("CORTEX_TEST_SECRET");
    }
}
