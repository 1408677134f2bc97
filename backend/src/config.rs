use std::path::PathBuf;

/// Environment-backed configuration for the upload client.
///
/// All values come from the process environment so the same binary works in
/// local development and in CI without a config file.
///
#[derive(Debug, Clone, Default)]
pub struct Config;

impl Config {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok().filter(|v| !v.is_empty())
    }

    /// Base URL of the conversion backend, e.g. `https://api.example.com/`.
    ///
    pub fn api_base_url(&self) -> Option<String> {
        self.get("CONVERT_API_BASE_URL")
    }

    /// Session credential presented in the `X-Session-Key` header.
    ///
    pub fn session_key(&self) -> Option<String> {
        self.get("CONVERT_SESSION_KEY")
    }

    /// Directory for persisted client state (session markers, speed cache).
    ///
    /// Defaults to `convert-upload` under the system temp directory.
    ///
    pub fn state_dir(&self) -> PathBuf {
        self.get("CONVERT_STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("convert-upload"))
    }

    /// Process-wide cap on simultaneously uploading parts across all jobs.
    ///
    pub fn concurrency_budget(&self) -> Option<usize> {
        self.get("CONVERT_CONCURRENCY_BUDGET")
            .and_then(|v| v.parse().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_dir_default() {
        std::env::remove_var("CONVERT_STATE_DIR");
        let dir = Config.state_dir();
        assert!(dir.ends_with("convert-upload"));
    }

    #[test]
    fn test_empty_var_treated_as_unset() {
        std::env::set_var("CONVERT_API_BASE_URL", "");
        assert_eq!(Config.api_base_url(), None);
        std::env::remove_var("CONVERT_API_BASE_URL");
    }
}
