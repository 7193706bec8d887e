//! Venue credential handling.
//!
//! API keys are held in `Zeroizing` buffers so they are wiped from memory
//! when dropped, and never printed by `Debug`.

use base64::{engine::general_purpose, Engine as _};
use std::env;
use tracing::warn;
use zeroize::Zeroizing;

/// Error type for secret loading operations
#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("Environment variable not set: {0}")]
    EnvVarNotSet(String),

    #[error("Secret validation failed: {0}")]
    ValidationFailed(String),
}

/// Load a secret from an environment variable
pub fn load_from_env(env_var_name: &str) -> Result<Zeroizing<String>, SecretError> {
    let value = env::var(env_var_name)
        .map_err(|_| SecretError::EnvVarNotSet(env_var_name.to_string()))?;
    let value = Zeroizing::new(value);
    if value.trim().is_empty() {
        return Err(SecretError::ValidationFailed(format!(
            "{} is empty",
            env_var_name
        )));
    }
    Ok(value)
}

/// Key pair for signed (private) venue calls
#[derive(Clone)]
pub struct ApiCredentials {
    api_key: Zeroizing<String>,
    api_secret: Zeroizing<String>,
}

impl std::fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("api_key", &"<redacted>")
            .field("api_secret", &"<redacted>")
            .finish()
    }
}

impl ApiCredentials {
    /// Build credentials, checking the secret is valid base64
    pub fn new(api_key: Zeroizing<String>, api_secret: Zeroizing<String>) -> Result<Self, SecretError> {
        if api_key.trim().is_empty() {
            return Err(SecretError::ValidationFailed("API key is empty".to_string()));
        }
        general_purpose::STANDARD
            .decode(api_secret.trim())
            .map_err(|e| SecretError::ValidationFailed(format!("API secret is not base64: {}", e)))?;
        Ok(Self {
            api_key,
            api_secret,
        })
    }

    /// Read `KRAKEN_API_KEY` / `KRAKEN_API_SECRET`
    pub fn from_env() -> Result<Self, SecretError> {
        let api_key = load_from_env("KRAKEN_API_KEY")?;
        let api_secret = load_from_env("KRAKEN_API_SECRET")?;
        Self::new(api_key, api_secret)
    }

    /// Credentials when present; public-only mode otherwise
    pub fn from_env_optional() -> Option<Self> {
        match Self::from_env() {
            Ok(credentials) => Some(credentials),
            Err(SecretError::EnvVarNotSet(name)) => {
                warn!("{} not set; private endpoints are disabled", name);
                None
            }
            Err(e) => {
                warn!("Ignoring venue credentials: {}", e);
                None
            }
        }
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Decoded HMAC key
    pub fn secret_bytes(&self) -> Result<Zeroizing<Vec<u8>>, SecretError> {
        general_purpose::STANDARD
            .decode(self.api_secret.trim())
            .map(Zeroizing::new)
            .map_err(|e| SecretError::ValidationFailed(format!("API secret is not base64: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_non_base64_secret() {
        let result = ApiCredentials::new(
            Zeroizing::new("key".to_string()),
            Zeroizing::new("not base64!!".to_string()),
        );
        assert!(matches!(result, Err(SecretError::ValidationFailed(_))));
    }

    #[test]
    fn test_debug_redacts() {
        let credentials = ApiCredentials::new(
            Zeroizing::new("my-key".to_string()),
            Zeroizing::new("c2VjcmV0".to_string()),
        )
        .unwrap();
        let printed = format!("{:?}", credentials);
        assert!(!printed.contains("my-key"));
        assert!(!printed.contains("c2VjcmV0"));
        assert_eq!(credentials.secret_bytes().unwrap().as_slice(), b"secret");
    }

    #[test]
    fn test_missing_env_var() {
        assert!(matches!(
            load_from_env("RATCHET_CORE_SURELY_UNSET_VAR"),
            Err(SecretError::EnvVarNotSet(_))
        ));
    }
}
