use serde::{Deserialize, Serialize};
use std::env;

use crate::error::{IngestError, Result};

pub const DEFAULT_REGION: &str = "eu-west-2";

/// Connection settings for the S3-compatible object store
///
/// Static keys are optional; without them the default AWS credential chain
/// (environment, profile, instance role) is used.
#[derive(Clone, Serialize, Deserialize)]
pub struct S3Config {
    pub endpoint: Option<String>,
    pub region: String,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub path_style: bool,
}

impl S3Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load from any variable source; blank values count as unset
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let either = |primary: &str, fallback: &str| var(primary).or_else(|| var(fallback));

        let path_style = match var("S3_PATH_STYLE") {
            Some(v) => v
                .trim()
                .parse()
                .map_err(|_| IngestError::config(format!("Invalid S3_PATH_STYLE: {}", v)))?,
            None => false,
        };

        let config = Self {
            endpoint: var("S3_ENDPOINT"),
            region: either("S3_REGION", "AWS_REGION").unwrap_or_else(|| DEFAULT_REGION.to_string()),
            access_key: either("S3_ACCESS_KEY", "AWS_ACCESS_KEY_ID"),
            secret_key: either("S3_SECRET_KEY", "AWS_SECRET_ACCESS_KEY"),
            path_style,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn for_minio(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            region: "us-east-1".to_string(),
            access_key: Some("minioadmin".to_string()),
            secret_key: Some("minioadmin".to_string()),
            path_style: true,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.access_key.is_some() != self.secret_key.is_some() {
            return Err(IngestError::config(
                "S3 access key and secret key must be set together",
            ));
        }
        if self.region.trim().is_empty() {
            return Err(IngestError::config("S3 region must not be empty"));
        }
        Ok(())
    }

    pub fn static_credentials(&self) -> Option<(&str, &str)> {
        match (&self.access_key, &self.secret_key) {
            (Some(access), Some(secret)) => Some((access.as_str(), secret.as_str())),
            _ => None,
        }
    }
}

impl std::fmt::Debug for S3Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Config")
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("access_key", &self.access_key)
            .field("secret_key", &self.secret_key.as_ref().map(|_| "***"))
            .field("path_style", &self.path_style)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: [&str; 8] = [
        "S3_ENDPOINT",
        "S3_REGION",
        "AWS_REGION",
        "S3_ACCESS_KEY",
        "AWS_ACCESS_KEY_ID",
        "S3_SECRET_KEY",
        "AWS_SECRET_ACCESS_KEY",
        "S3_PATH_STYLE",
    ];

    fn clear_env() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    fn test_for_minio() {
        let config = S3Config::for_minio("http://localhost:9000");
        assert_eq!(config.endpoint.as_deref(), Some("http://localhost:9000"));
        assert!(config.path_style);
        assert_eq!(config.static_credentials(), Some(("minioadmin", "minioadmin")));
    }

    #[test]
    #[serial]
    fn test_from_env_defaults_to_credential_chain() {
        clear_env();

        let config = S3Config::from_env().unwrap();
        assert_eq!(config.endpoint, None);
        assert_eq!(config.region, DEFAULT_REGION);
        assert!(config.static_credentials().is_none());
        assert!(!config.path_style);
    }

    #[test]
    #[serial]
    fn test_from_env_falls_back_to_aws_names() {
        clear_env();
        env::set_var("AWS_ACCESS_KEY_ID", "key");
        env::set_var("AWS_SECRET_ACCESS_KEY", "secret");
        env::set_var("S3_PATH_STYLE", "true");

        let config = S3Config::from_env().unwrap();
        assert_eq!(config.static_credentials(), Some(("key", "secret")));
        assert!(config.path_style);

        clear_env();
    }

    #[test]
    #[serial]
    fn test_half_credentials_rejected() {
        clear_env();
        env::set_var("S3_ACCESS_KEY", "key");

        assert!(matches!(S3Config::from_env(), Err(IngestError::Configuration(_))));

        clear_env();
    }

    #[test]
    fn test_from_lookup_ignores_process_env() {
        let vars = [("S3_ENDPOINT", "http://minio:9000"), ("S3_REGION", " "), ("AWS_REGION", "us-east-1")];
        let lookup = |name: &str| {
            vars.iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| v.to_string())
        };

        let config = S3Config::from_lookup(lookup).unwrap();
        assert_eq!(config.endpoint.as_deref(), Some("http://minio:9000"));
        assert_eq!(config.region, "us-east-1");
        assert!(config.static_credentials().is_none());

        let bad = |name: &str| (name == "S3_PATH_STYLE").then(|| "sometimes".to_string());
        assert!(matches!(S3Config::from_lookup(bad), Err(IngestError::Configuration(_))));
    }

    #[test]
    fn test_debug_redacts_secret() {
        let rendered = format!("{:?}", S3Config::for_minio("http://localhost:9000"));
        assert_eq!(rendered.matches("minioadmin").count(), 1);
        assert!(rendered.contains("***"));
    }
}
