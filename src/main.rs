use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use wrapped_server::config::{AppConfig, CliConfig, FileConfig, SpotifySettings};
use wrapped_server::imports::{
    ImportJob, ImportRunner, ImportStore, Reconciler, SqliteImportStore, UploadFile, UploadService,
};
use wrapped_server::spotify::{
    HttpCatalogTransport, HttpTokenFetcher, JsonFileTokenStore, SpotifyClient, TokenProvider,
};
use wrapped_server::storage::{
    CatalogStore, Database, HistoryStore, SqliteCatalogStore, SqliteHistoryStore,
};

fn parse_path(s: &str) -> Result<PathBuf, String> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(format!("Error resolving path '{}': {}", s, msg));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir().map_err(|e| format!("Failed to get current dir: {}", e))?;
    Ok(cwd.join(original_path))
}

#[derive(Parser, Debug)]
#[command(name = "wrapped-server", about = "Streaming history import and analytics")]
struct CliArgs {
    /// Path to the SQLite analytics database file.
    #[clap(long, value_parser = parse_path)]
    db_path: Option<PathBuf>,

    /// Optional TOML config file; its values override CLI flags.
    #[clap(long, value_parser = parse_path)]
    config: Option<PathBuf>,

    /// Directory where uploaded archives are spooled.
    #[clap(long, value_parser = parse_path)]
    uploads_dir: Option<PathBuf>,

    /// Spotify application client id.
    #[clap(long)]
    spotify_client_id: Option<String>,

    /// Spotify application client secret.
    #[clap(long)]
    spotify_client_secret: Option<String>,

    /// Stored user grant file; enables the refresh-token grant.
    #[clap(long, value_parser = parse_path)]
    spotify_token_file: Option<PathBuf>,

    /// How many artists to list individually before the Other bucket.
    #[clap(long)]
    top_artists_limit: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Import one or more exported history archives and wait for completion.
    Import {
        /// User the listening history belongs to.
        #[clap(long)]
        user: String,
        /// Archive files (JSON arrays of listen records).
        #[clap(required = true, value_parser = parse_path)]
        files: Vec<PathBuf>,
    },
    /// Show import jobs for a user, or one job by id.
    Status {
        #[clap(long)]
        user: String,
        job_id: Option<String>,
    },
    /// Print aggregate listening analytics for a user.
    Overview {
        #[clap(long)]
        user: String,
    },
}

fn build_catalog_api(settings: &SpotifySettings) -> Result<Arc<SpotifyClient>> {
    let fetcher = Arc::new(HttpTokenFetcher::new(
        settings.accounts_base_url.clone(),
        settings.client_id.clone(),
        settings.client_secret.clone(),
    )?);
    let tokens = match &settings.token_file {
        Some(path) => Arc::new(TokenProvider::user_grant(
            fetcher,
            Arc::new(JsonFileTokenStore::new(path.clone())),
        )),
        None => Arc::new(TokenProvider::client_credentials(fetcher)),
    };
    let transport = Arc::new(HttpCatalogTransport::new(settings.api_base_url.clone())?);
    Ok(Arc::new(SpotifyClient::new(transport, tokens)))
}

fn print_job(job: &ImportJob) {
    if job.error.is_empty() {
        println!("{}  {:<10} {}", job.id, job.status.as_str(), job.source_file);
    } else {
        println!(
            "{}  {:<10} {}  error: {}",
            job.id,
            job.status.as_str(),
            job.source_file,
            job.error
        );
    }
}

async fn run_import(config: &AppConfig, user: &str, files: &[PathBuf]) -> Result<()> {
    let settings = config
        .spotify
        .as_ref()
        .context("Spotify credentials are required for import (set [spotify] in the config file or pass --spotify-client-id/--spotify-client-secret)")?;

    let database = Database::open(&config.db_path)?;
    let imports: Arc<SqliteImportStore> = Arc::new(SqliteImportStore::new(&database));
    let catalog: Arc<SqliteCatalogStore> = Arc::new(SqliteCatalogStore::new(&database));
    let history: Arc<SqliteHistoryStore> = Arc::new(SqliteHistoryStore::new(&database));

    let api = build_catalog_api(settings)?;
    let reconciler = Arc::new(Reconciler::new(
        imports.clone(),
        catalog.clone(),
        history.clone(),
        api,
    ));
    let runner = ImportRunner::new(imports.clone(), reconciler, config.uploads_dir.clone());
    let uploads = UploadService::new(imports.clone(), runner.clone());

    let mut upload_files = Vec::new();
    for path in files {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read archive {:?}", path))?;
        upload_files.push(UploadFile { name, content });
    }

    let outcome = uploads.accept(user, upload_files)?;
    for (name, reason) in &outcome.rejected {
        println!("rejected {}: {}", name, reason);
    }
    if outcome.job_ids.is_empty() {
        bail!("No files accepted");
    }

    info!("Waiting for {} import job(s)", outcome.job_ids.len());
    runner.wait_idle().await;

    for job_id in &outcome.job_ids {
        if let Some(job) = imports.get_job(job_id)? {
            print_job(&job);
        }
    }
    let (artists, albums, tracks) = catalog.entity_counts()?;
    println!("catalog: {} artists, {} albums, {} tracks", artists, albums, tracks);
    Ok(())
}

fn run_status(config: &AppConfig, user: &str, job_id: Option<&str>) -> Result<()> {
    let database = Database::open(&config.db_path)?;
    let imports = SqliteImportStore::new(&database);

    match job_id {
        Some(job_id) => {
            let job = imports
                .get_job(job_id)?
                .with_context(|| format!("Import job {} not found", job_id))?;
            print_job(&job);
        }
        None => {
            let jobs = imports.list_jobs_for_user(user)?;
            if jobs.is_empty() {
                println!("No import jobs for user {}", user);
            }
            for job in jobs {
                print_job(&job);
            }
        }
    }
    Ok(())
}

fn run_overview(config: &AppConfig, user: &str) -> Result<()> {
    let database = Database::open(&config.db_path)?;
    let history = SqliteHistoryStore::new(&database);

    let overview = history.overview(user)?;
    println!("streams:          {}", overview.total_streams);
    println!("minutes streamed: {}", overview.minutes_streamed);
    println!("hours streamed:   {}", overview.hours_streamed);
    println!("tracks:           {}", overview.different_tracks);
    println!("artists:          {}", overview.different_artists);
    println!("albums:           {}", overview.different_albums);

    println!("\nplatforms:");
    for stat in history.platform_stats(user)? {
        println!("  {:<24} {}", stat.platform, stat.count);
    }

    println!("\ntop artists:");
    for artist in history.top_artists(user, config.top_artists_limit)? {
        println!("  {:<24} {}", artist.name, artist.count);
    }

    println!("\nactivity by hour:");
    for slot in history.activity_by_hour(user)? {
        println!("  {:>2}:00  {:>6} streams  {:>6} min", slot.hour, slot.streams, slot.minutes);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .unwrap();

    let file_config = cli_args.config.as_deref().map(FileConfig::load).transpose()?;
    let cli_config = CliConfig {
        db_path: cli_args.db_path.clone(),
        uploads_dir: cli_args.uploads_dir.clone(),
        top_artists_limit: cli_args.top_artists_limit,
        spotify_client_id: cli_args.spotify_client_id.clone(),
        spotify_client_secret: cli_args.spotify_client_secret.clone(),
        spotify_token_file: cli_args.spotify_token_file.clone(),
    };
    let config = AppConfig::resolve(&cli_config, file_config)?;

    match &cli_args.command {
        Command::Import { user, files } => run_import(&config, user, files).await,
        Command::Status { user, job_id } => run_status(&config, user, job_id.as_deref()),
        Command::Overview { user } => run_overview(&config, user),
    }
}
