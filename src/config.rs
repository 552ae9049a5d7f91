use crate::services::doi::DataciteSettings;
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::{env, fmt, path::PathBuf, str::FromStr, time::Duration};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Clone)]
pub struct AppConfig {
    pub repository_url: Option<String>,
    pub token: String,
    pub journal_url: String,
    pub lock_timeout: Duration,
    pub http_timeout: Duration,
    pub preservation_creator: Option<String>,
    /// DOI registration, enabled by DEPOSITOR_DATACITE_URL.
    pub datacite: Option<DataciteSettings>,
}

// token stays out of logs
impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("repository_url", &self.repository_url)
            .field("token", &if self.token.is_empty() { "" } else { "***" })
            .field("journal_url", &self.journal_url)
            .field("lock_timeout", &self.lock_timeout)
            .field("http_timeout", &self.http_timeout)
            .field("preservation_creator", &self.preservation_creator)
            .field(
                "datacite",
                &self.datacite.as_ref().map(|d| (&d.url, &d.prefix, &d.user)),
            )
            .finish()
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Deposit BagIt packages into an InvenioRDM repository")]
pub struct Cli {
    /// Repository base URL (overrides DEPOSITOR_REPOSITORY_URL)
    #[arg(long, global = true)]
    pub repository_url: Option<String>,

    /// API token (overrides DEPOSITOR_TOKEN)
    #[arg(long, global = true)]
    pub token: Option<String>,

    /// Journal database URL (overrides DEPOSITOR_JOURNAL_URL)
    #[arg(long, global = true)]
    pub journal_url: Option<String>,

    /// Seconds to wait for the deposit lock (overrides DEPOSITOR_LOCK_TIMEOUT_SECS)
    #[arg(long, global = true)]
    pub lock_timeout_secs: Option<u64>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Deposit a package as a tree of records
    Deposit(DepositArgs),
    /// Download a published record tree
    Download(DownloadArgs),
    /// Delete drafts left behind by interrupted deposits
    Cleanup {
        /// Also delete every other unpublished draft of the user
        #[arg(long)]
        all: bool,
    },
    /// Serve an in-memory repository for local testing
    Sandbox {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, default_value_t = 5000)]
        port: u16,
    },
}

#[derive(Args, Debug)]
pub struct DepositArgs {
    /// Root of the BagIt package
    pub path: PathBuf,

    /// Make files public when no record map is given
    #[arg(long)]
    pub public_files: bool,

    /// Put private files into a child record of their own
    #[arg(long)]
    pub separate_private_records: bool,

    /// Update an existing record with the same title
    #[arg(long)]
    pub update: bool,

    /// Leave the records as drafts
    #[arg(long)]
    pub no_publish: bool,

    /// Write the JSON report to this file
    #[arg(long)]
    pub report: Option<PathBuf>,
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
pub struct RecordSelector {
    /// Id of the root record
    #[arg(long)]
    pub id: Option<String>,

    /// Exact title of the root record
    #[arg(long)]
    pub title: Option<String>,
}

#[derive(Args, Debug)]
pub struct DownloadArgs {
    #[command(flatten)]
    pub record: RecordSelector,

    /// Destination directory
    pub dest: PathBuf,

    /// Write the JSON report to this file
    #[arg(long)]
    pub report: Option<PathBuf>,
}

const DEFAULT_JOURNAL_URL: &str = "sqlite://./.depositor/journal.db";
const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 600;
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 60;

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and the command to run.
    pub fn from_env_and_args() -> Result<(Self, Command)> {
        // Parse CLI once
        let cli = Cli::parse();
        Self::resolve(cli, |key| env::var(key).ok())
    }

    /// Merge parsed arguments with variables from `lookup`. Arguments win.
    pub fn resolve(cli: Cli, lookup: impl Fn(&str) -> Option<String>) -> Result<(Self, Command)> {
        // --- Environment fallback ---
        let env_lock = parse_var(&lookup, "DEPOSITOR_LOCK_TIMEOUT_SECS", DEFAULT_LOCK_TIMEOUT_SECS)?;
        let env_http = parse_var(&lookup, "DEPOSITOR_HTTP_TIMEOUT_SECS", DEFAULT_HTTP_TIMEOUT_SECS)?;
        let env_journal =
            lookup("DEPOSITOR_JOURNAL_URL").unwrap_or_else(|| DEFAULT_JOURNAL_URL.into());

        // --- Merge ---
        let cfg = Self {
            repository_url: cli
                .repository_url
                .or_else(|| lookup("DEPOSITOR_REPOSITORY_URL")),
            token: cli
                .token
                .or_else(|| lookup("DEPOSITOR_TOKEN"))
                .unwrap_or_default(),
            journal_url: cli.journal_url.unwrap_or(env_journal),
            lock_timeout: Duration::from_secs(cli.lock_timeout_secs.unwrap_or(env_lock)),
            http_timeout: Duration::from_secs(env_http),
            preservation_creator: lookup("DEPOSITOR_PRESERVATION_CREATOR")
                .filter(|creator| !creator.trim().is_empty()),
            datacite: datacite_settings(&lookup)?,
        };

        Ok((cfg, cli.command))
    }

    pub fn repository_url(&self) -> Result<&str> {
        self.repository_url.as_deref().context(
            "no repository URL configured (use --repository-url or DEPOSITOR_REPOSITORY_URL)",
        )
    }
}

fn datacite_settings(lookup: &impl Fn(&str) -> Option<String>) -> Result<Option<DataciteSettings>> {
    let Some(url) = lookup("DEPOSITOR_DATACITE_URL").filter(|url| !url.trim().is_empty()) else {
        return Ok(None);
    };
    let required = |key: &str| {
        lookup(key).with_context(|| format!("{} is required with DEPOSITOR_DATACITE_URL", key))
    };
    Ok(Some(DataciteSettings {
        url,
        prefix: required("DEPOSITOR_DATACITE_PREFIX")?,
        user: required("DEPOSITOR_DATACITE_USER")?,
        password: lookup("DEPOSITOR_DATACITE_PASSWORD").unwrap_or_default(),
    }))
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        None => Ok(default),
    }
}
