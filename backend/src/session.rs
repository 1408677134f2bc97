use async_trait::async_trait;

use crate::Config;

/// Capability for obtaining the bearer credential sent to the backend.
///
/// The upload client never acquires credentials itself; it consumes whatever
/// session/license machinery the application provides. `refresh` exists for
/// callers that restart the conversion flow after an authorization failure.
///
#[async_trait]
pub trait SessionKeys: Send + Sync {
    /// The current credential for the `X-Session-Key` header.
    ///
    async fn key(&self) -> anyhow::Result<String>;

    /// Obtain a fresh credential, invalidating the previous one.
    ///
    async fn refresh(&self) -> anyhow::Result<String>;
}

/// Session credential sourced from the environment.
///
/// Refreshing re-reads the environment, which covers the common case of a
/// wrapper script provisioning a new key before retrying.
///
#[derive(Debug, Default)]
pub struct EnvSessionKeys;

#[async_trait]
impl SessionKeys for EnvSessionKeys {
    async fn key(&self) -> anyhow::Result<String> {
        Config
            .session_key()
            .ok_or_else(|| anyhow::anyhow!("CONVERT_SESSION_KEY is not set"))
    }

    async fn refresh(&self) -> anyhow::Result<String> {
        self.key().await
    }
}

/// A fixed credential, mainly for tests and one-shot tools.
///
#[derive(Debug, Clone)]
pub struct StaticSessionKeys {
    key: String,
}

impl StaticSessionKeys {
    /// Wrap an already-acquired credential.
    ///
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

#[async_trait]
impl SessionKeys for StaticSessionKeys {
    async fn key(&self) -> anyhow::Result<String> {
        Ok(self.key.clone())
    }

    async fn refresh(&self) -> anyhow::Result<String> {
        Ok(self.key.clone())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test]
    async fn test_env_refresh_rereads_environment() {
        std::env::set_var("CONVERT_SESSION_KEY", "first-key");
        assert_eq!(EnvSessionKeys.key().await.unwrap(), "first-key");

        // A wrapper provisioning a fresh key is visible on refresh.
        std::env::set_var("CONVERT_SESSION_KEY", "second-key");
        assert_eq!(EnvSessionKeys.refresh().await.unwrap(), "second-key");

        std::env::remove_var("CONVERT_SESSION_KEY");
        assert!(EnvSessionKeys.key().await.is_err());
    }

    #[tokio::test]
    async fn test_static_keys_survive_refresh() {
        let keys = StaticSessionKeys::new("fixed");
        assert_eq!(keys.key().await.unwrap(), "fixed");
        assert_eq!(keys.refresh().await.unwrap(), "fixed");
    }
}
