//! Authentication configuration.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::Role;

/// Value rejected outside dev mode even though it is long enough.
const INSECURE_DEFAULT_SECRET: &str = "parley-dev-secret-change-in-production";

/// Authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Enable development mode (`dev:<id>` tokens and the X-Dev-User header).
    pub dev_mode: bool,

    /// JWT secret for HS256. Accepts `env:VAR_NAME`.
    /// REQUIRED when dev_mode is false.
    pub jwt_secret: Option<String>,

    /// Development users (only used in dev mode).
    pub dev_users: Vec<DevUser>,

    /// Allowed CORS origins. If empty, CORS is disabled.
    pub allowed_origins: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            dev_mode: false,
            jwt_secret: None,
            dev_users: Vec::new(),
            allowed_origins: vec!["http://localhost:3000".to_string()],
        }
    }
}

impl AuthConfig {
    /// Resolve the JWT secret, expanding `env:VAR_NAME` syntax.
    pub fn resolve_jwt_secret(&self) -> Result<Option<String>, ConfigValidationError> {
        let Some(value) = &self.jwt_secret else {
            return Ok(None);
        };
        let Some(var_name) = value.strip_prefix("env:") else {
            return Ok(Some(value.clone()));
        };
        match std::env::var(var_name) {
            Ok(secret) if !secret.is_empty() => Ok(Some(secret)),
            Ok(_) => Err(ConfigValidationError::EnvVarEmpty(var_name.to_string())),
            Err(_) => Err(ConfigValidationError::EnvVarNotFound(var_name.to_string())),
        }
    }

    /// Validate the configuration for the current mode.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.dev_mode {
            return Ok(());
        }

        let secret = self
            .resolve_jwt_secret()?
            .ok_or(ConfigValidationError::MissingJwtSecret)?;
        if secret == INSECURE_DEFAULT_SECRET {
            return Err(ConfigValidationError::InsecureJwtSecret);
        }
        if secret.len() < 32 {
            return Err(ConfigValidationError::JwtSecretTooShort);
        }
        Ok(())
    }

    /// Generate a random 64 character JWT secret from the OS-backed RNG.
    pub fn generate_jwt_secret() -> String {
        use rand::Rng;

        const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
        const SECRET_LENGTH: usize = 64;

        let mut rng = rand::rng();
        (0..SECRET_LENGTH)
            .map(|_| CHARSET[rng.random_range(0..CHARSET.len())] as char)
            .collect()
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigValidationError {
    #[error(
        "JWT secret is required when dev_mode is false. Set PARLEY__AUTH__JWT_SECRET or auth.jwt_secret in config."
    )]
    MissingJwtSecret,

    #[error("JWT secret cannot be the default insecure value outside dev mode.")]
    InsecureJwtSecret,

    #[error("JWT secret must be at least 32 characters long.")]
    JwtSecretTooShort,

    #[error("Environment variable '{0}' not found (referenced via env:{0} in config).")]
    EnvVarNotFound(String),

    #[error("Environment variable '{0}' is empty (referenced via env:{0} in config).")]
    EnvVarEmpty(String),
}

/// Development user configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevUser {
    pub id: String,
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub role: Role,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dev_mode_skips_secret_checks() {
        let config = AuthConfig {
            dev_mode: true,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_secret_rejected() {
        let config = AuthConfig::default();
        assert_eq!(
            config.validate(),
            Err(ConfigValidationError::MissingJwtSecret)
        );
    }

    #[test]
    fn test_short_and_default_secrets_rejected() {
        let short = AuthConfig {
            jwt_secret: Some("too-short".to_string()),
            ..Default::default()
        };
        assert_eq!(
            short.validate(),
            Err(ConfigValidationError::JwtSecretTooShort)
        );

        let insecure = AuthConfig {
            jwt_secret: Some(INSECURE_DEFAULT_SECRET.to_string()),
            ..Default::default()
        };
        assert_eq!(
            insecure.validate(),
            Err(ConfigValidationError::InsecureJwtSecret)
        );
    }

    #[test]
    fn test_env_secret_missing_var() {
        let config = AuthConfig {
            jwt_secret: Some("env:PARLEY_TEST_SECRET_THAT_IS_NOT_SET".to_string()),
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigValidationError::EnvVarNotFound(
                "PARLEY_TEST_SECRET_THAT_IS_NOT_SET".to_string()
            ))
        );
    }

    #[test]
    fn test_generated_secret_passes_validation() {
        let secret = AuthConfig::generate_jwt_secret();
        assert_eq!(secret.len(), 64);
        let config = AuthConfig {
            jwt_secret: Some(secret),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }
}
