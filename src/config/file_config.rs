use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub db_path: Option<String>,
    pub uploads_dir: Option<String>,
    pub top_artists_limit: Option<usize>,

    pub spotify: Option<SpotifyFileConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct SpotifyFileConfig {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub api_base_url: Option<String>,
    pub accounts_base_url: Option<String>,
    /// Path to a stored user grant; when set the client uses the
    /// refresh-token grant instead of client credentials.
    pub token_file: Option<String>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_partial_config() {
        let config: FileConfig = toml::from_str(
            r#"
            db_path = "/var/lib/wrapped/analytics.db"

            [spotify]
            client_id = "abc"
            client_secret = "def"
            "#,
        )
        .unwrap();
        assert_eq!(config.db_path.as_deref(), Some("/var/lib/wrapped/analytics.db"));
        let spotify = config.spotify.unwrap();
        assert_eq!(spotify.client_id.as_deref(), Some("abc"));
        assert!(spotify.api_base_url.is_none());
    }
}
