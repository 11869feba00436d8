use anyhow::{Context, Result};
use clap::Parser;
use std::{env, path::PathBuf, str::FromStr, time::Duration};
use url::Url;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub store_dir: PathBuf,
    pub database_url: String,
    /// Base URL clients reach this service on; file locators hang off it.
    pub public_url: Url,
    /// Orchestrator base URL. Notifications are disabled when unset.
    pub orchestrator_url: Option<Url>,
    pub orchestrator_timeout: Duration,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Network-function artifact and descriptor store")]
pub struct Args {
    /// Host to bind to (overrides NF_STORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides NF_STORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where artifact files are stored (overrides NF_STORE_STORE_DIR)
    #[arg(long)]
    pub store_dir: Option<PathBuf>,

    /// Database URL (overrides NF_STORE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Public base URL used in file locators (overrides NF_STORE_PUBLIC_URL)
    #[arg(long)]
    pub public_url: Option<String>,

    /// Orchestrator base URL (overrides NF_STORE_ORCHESTRATOR_URL)
    #[arg(long)]
    pub orchestrator_url: Option<String>,

    /// Orchestrator request timeout in seconds (overrides NF_STORE_ORCHESTRATOR_TIMEOUT_SECS)
    #[arg(long)]
    pub orchestrator_timeout_secs: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        let cfg = Self::resolve(args, |key| env::var(key).ok())?;
        Ok((cfg, migrate))
    }

    /// Merge CLI args over values from `lookup`, then over defaults.
    fn resolve(args: Args, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let host = args
            .host
            .or_else(|| lookup("NF_STORE_HOST"))
            .unwrap_or_else(|| "0.0.0.0".into());
        let port = match args.port {
            Some(port) => port,
            None => parsed(&lookup, "NF_STORE_PORT")?.unwrap_or(8080),
        };
        let store_dir = args
            .store_dir
            .or_else(|| lookup("NF_STORE_STORE_DIR").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("./data/files"));
        let database_url = args
            .database_url
            .or_else(|| lookup("NF_STORE_DATABASE_URL"))
            .unwrap_or_else(|| "sqlite://./data/meta/nf_store.db".into());

        let public_url = args
            .public_url
            .or_else(|| lookup("NF_STORE_PUBLIC_URL"))
            .unwrap_or_else(|| "http://localhost:8080".into());
        let public_url = Url::parse(&public_url)
            .with_context(|| format!("parsing public URL `{}`", public_url))?;
        if public_url.cannot_be_a_base() {
            anyhow::bail!("public URL `{}` cannot be used as a base", public_url);
        }

        let orchestrator_url = match args
            .orchestrator_url
            .or_else(|| lookup("NF_STORE_ORCHESTRATOR_URL"))
            .filter(|v| !v.trim().is_empty())
        {
            Some(raw) => Some(
                Url::parse(&raw).with_context(|| format!("parsing orchestrator URL `{}`", raw))?,
            ),
            None => None,
        };
        let timeout_secs = match args.orchestrator_timeout_secs {
            Some(secs) => secs,
            None => parsed(&lookup, "NF_STORE_ORCHESTRATOR_TIMEOUT_SECS")?.unwrap_or(30),
        };

        Ok(Self {
            host,
            port,
            store_dir,
            database_url,
            public_url,
            orchestrator_url,
            orchestrator_timeout: Duration::from_secs(timeout_secs),
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(value) => value
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        None => Ok(None),
    }
}
