mod file_config;

pub use file_config::{FileConfig, SpotifyFileConfig};

use anyhow::Result;
use std::path::PathBuf;

pub const DEFAULT_API_BASE_URL: &str = "https://api.spotify.com/v1";
pub const DEFAULT_ACCOUNTS_BASE_URL: &str = "https://accounts.spotify.com";
pub const DEFAULT_TOP_ARTISTS_LIMIT: usize = 5;

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub db_path: Option<PathBuf>,
    pub uploads_dir: Option<PathBuf>,
    pub top_artists_limit: Option<usize>,
    pub spotify_client_id: Option<String>,
    pub spotify_client_secret: Option<String>,
    pub spotify_token_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: PathBuf,
    pub uploads_dir: PathBuf,
    pub top_artists_limit: usize,
    /// Absent when no API credentials were provided; commands that need the
    /// catalog API fail with a pointed error in that case.
    pub spotify: Option<SpotifySettings>,
}

#[derive(Debug, Clone)]
pub struct SpotifySettings {
    pub client_id: String,
    pub client_secret: String,
    pub api_base_url: String,
    pub accounts_base_url: String,
    pub token_file: Option<PathBuf>,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let db_path = file
            .db_path
            .map(PathBuf::from)
            .or_else(|| cli.db_path.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("db_path must be specified via --db-path or in config file")
            })?;

        let uploads_dir = file
            .uploads_dir
            .map(PathBuf::from)
            .or_else(|| cli.uploads_dir.clone())
            .unwrap_or_else(|| {
                db_path
                    .parent()
                    .map(|p| p.to_path_buf())
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("uploads")
            });

        let top_artists_limit = file
            .top_artists_limit
            .or(cli.top_artists_limit)
            .unwrap_or(DEFAULT_TOP_ARTISTS_LIMIT);

        let spotify_file = file.spotify.unwrap_or_default();
        let client_id = spotify_file
            .client_id
            .or_else(|| cli.spotify_client_id.clone());
        let client_secret = spotify_file
            .client_secret
            .or_else(|| cli.spotify_client_secret.clone());
        let spotify = match (client_id, client_secret) {
            (Some(client_id), Some(client_secret)) => Some(SpotifySettings {
                client_id,
                client_secret,
                api_base_url: spotify_file
                    .api_base_url
                    .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string()),
                accounts_base_url: spotify_file
                    .accounts_base_url
                    .unwrap_or_else(|| DEFAULT_ACCOUNTS_BASE_URL.to_string()),
                token_file: spotify_file
                    .token_file
                    .map(PathBuf::from)
                    .or_else(|| cli.spotify_token_file.clone()),
            }),
            _ => None,
        };

        Ok(AppConfig {
            db_path,
            uploads_dir,
            top_artists_limit,
            spotify,
        })
    }
}
