use crate::{
    models::{ResourceMetadata, Variant},
    providers::ProviderSettings,
    services::RetryPolicy,
};
use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{env, path::PathBuf, str::FromStr, time::Duration};

pub const SIGNED_PART_CHUNK_SIZE: u64 = 10 * 1024 * 1024;
pub const OFFSET_RESUMABLE_CHUNK_SIZE: u64 = 128 * 1024 * 1024;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub variant: Variant,
    pub provider_url: String,
    pub api_key: Option<String>,
    pub chunk_size: u64,
    pub retry: RetryPolicy,
    pub sweep_interval: Duration,
}

/// What the binary was asked to do.
#[derive(Debug, Clone, PartialEq)]
pub enum RunMode {
    Serve,
    Migrate,
    Upload {
        path: PathBuf,
        metadata: ResourceMetadata,
    },
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Resumable chunked media uploads")]
pub struct Args {
    /// Host to bind to (overrides MEDIA_UPLOAD_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides MEDIA_UPLOAD_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL (overrides MEDIA_UPLOAD_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Upload protocol: signed-part or offset-resumable (overrides MEDIA_UPLOAD_VARIANT)
    #[arg(long)]
    pub variant: Option<String>,

    /// Provider API base URL (overrides MEDIA_UPLOAD_PROVIDER_URL)
    #[arg(long)]
    pub provider_url: Option<String>,

    /// Provider API key (overrides MEDIA_UPLOAD_API_KEY)
    #[arg(long)]
    pub api_key: Option<String>,

    /// Bytes per chunk (overrides MEDIA_UPLOAD_CHUNK_SIZE)
    #[arg(long)]
    pub chunk_size: Option<u64>,

    /// Attempts per chunk, first one included (overrides MEDIA_UPLOAD_MAX_ATTEMPTS)
    #[arg(long)]
    pub max_attempts: Option<u32>,

    /// First retry delay in ms (overrides MEDIA_UPLOAD_BACKOFF_BASE_MS)
    #[arg(long)]
    pub backoff_base_ms: Option<u64>,

    /// Longest retry delay in ms (overrides MEDIA_UPLOAD_BACKOFF_CAP_MS)
    #[arg(long)]
    pub backoff_cap_ms: Option<u64>,

    /// Per-request timeout in seconds (overrides MEDIA_UPLOAD_ATTEMPT_TIMEOUT_SECS)
    #[arg(long)]
    pub attempt_timeout_secs: Option<u64>,

    /// Session lifetime in seconds (overrides MEDIA_UPLOAD_SESSION_TIMEOUT_SECS)
    #[arg(long)]
    pub session_timeout_secs: Option<u64>,

    /// Seconds between expiry sweeps (overrides MEDIA_UPLOAD_SWEEP_INTERVAL_SECS)
    #[arg(long)]
    pub sweep_interval_secs: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,

    /// Upload this file in-process, print the provider object reference and exit
    #[arg(long, requires = "name")]
    pub upload: Option<PathBuf>,

    /// Resource name for --upload
    #[arg(long)]
    pub name: Option<String>,

    /// Title sent to the provider for --upload (defaults to the name)
    #[arg(long)]
    pub title: Option<String>,

    /// Description sent to the provider for --upload
    #[arg(long)]
    pub description: Option<String>,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and the run mode.
    pub fn from_env_and_args() -> Result<(Self, RunMode)> {
        let args = Args::parse();
        Self::resolve(args, |key| env::var(key).ok())
    }

    /// Merge `args` over the variables `lookup` returns over defaults.
    pub fn resolve(
        args: Args,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(Self, RunMode)> {
        let mode = if args.migrate {
            RunMode::Migrate
        } else if let Some(path) = args.upload.clone() {
            let name = args.name.clone().context("--upload requires --name")?;
            RunMode::Upload {
                path,
                metadata: ResourceMetadata {
                    name,
                    title: args.title.clone(),
                    description: args.description.clone(),
                    mime_type: None,
                },
            }
        } else {
            RunMode::Serve
        };

        // --- Environment fallback ---
        let env_host = lookup("MEDIA_UPLOAD_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let env_port = env_parse(&lookup, "MEDIA_UPLOAD_PORT", 3000u16)?;
        let env_db = lookup("MEDIA_UPLOAD_DATABASE_URL")
            .unwrap_or_else(|| "sqlite://./data/meta/media_upload.db".into());

        let variant_raw = args
            .variant
            .clone()
            .or_else(|| lookup("MEDIA_UPLOAD_VARIANT"))
            .unwrap_or_else(|| Variant::SignedPart.as_str().into());
        let variant = Variant::from_str(&variant_raw).map_err(anyhow::Error::msg)?;

        let default_chunk = match variant {
            Variant::SignedPart => SIGNED_PART_CHUNK_SIZE,
            Variant::OffsetResumable => OFFSET_RESUMABLE_CHUNK_SIZE,
        };
        let chunk_size = match args.chunk_size {
            Some(v) => v,
            None => env_parse(&lookup, "MEDIA_UPLOAD_CHUNK_SIZE", default_chunk)?,
        };
        if chunk_size == 0 {
            bail!("chunk size must be greater than zero");
        }

        let defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            max_attempts_per_chunk: match args.max_attempts {
                Some(v) => v,
                None => env_parse(
                    &lookup,
                    "MEDIA_UPLOAD_MAX_ATTEMPTS",
                    defaults.max_attempts_per_chunk,
                )?,
            },
            backoff_base: Duration::from_millis(match args.backoff_base_ms {
                Some(v) => v,
                None => env_parse(
                    &lookup,
                    "MEDIA_UPLOAD_BACKOFF_BASE_MS",
                    defaults.backoff_base.as_millis() as u64,
                )?,
            }),
            backoff_cap: Duration::from_millis(match args.backoff_cap_ms {
                Some(v) => v,
                None => env_parse(
                    &lookup,
                    "MEDIA_UPLOAD_BACKOFF_CAP_MS",
                    defaults.backoff_cap.as_millis() as u64,
                )?,
            }),
            attempt_timeout: Duration::from_secs(match args.attempt_timeout_secs {
                Some(v) => v,
                None => env_parse(
                    &lookup,
                    "MEDIA_UPLOAD_ATTEMPT_TIMEOUT_SECS",
                    defaults.attempt_timeout.as_secs(),
                )?,
            }),
            session_timeout: Duration::from_secs(match args.session_timeout_secs {
                Some(v) => v,
                None => env_parse(
                    &lookup,
                    "MEDIA_UPLOAD_SESSION_TIMEOUT_SECS",
                    defaults.session_timeout.as_secs(),
                )?,
            }),
        };
        let sweep_interval = Duration::from_secs(match args.sweep_interval_secs {
            Some(v) => v,
            None => env_parse(&lookup, "MEDIA_UPLOAD_SWEEP_INTERVAL_SECS", 300u64)?,
        });
        if sweep_interval.is_zero() {
            bail!("sweep interval must be greater than zero");
        }

        let provider_url = args
            .provider_url
            .or_else(|| lookup("MEDIA_UPLOAD_PROVIDER_URL"))
            .unwrap_or_default();
        if provider_url.is_empty() && mode != RunMode::Migrate {
            bail!("provider URL is required (--provider-url or MEDIA_UPLOAD_PROVIDER_URL)");
        }

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            database_url: args.database_url.unwrap_or(env_db),
            variant,
            provider_url,
            api_key: args
                .api_key
                .or_else(|| lookup("MEDIA_UPLOAD_API_KEY"))
                .filter(|k| !k.is_empty()),
            chunk_size,
            retry,
            sweep_interval,
        };

        Ok((cfg, mode))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn provider_settings(&self) -> ProviderSettings {
        ProviderSettings {
            base_url: self.provider_url.clone(),
            api_key: self.api_key.clone(),
            chunk_size: self.chunk_size,
            request_timeout: self.retry.attempt_timeout,
        }
    }
}

fn env_parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        None => Ok(default),
    }
}
