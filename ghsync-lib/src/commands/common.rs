//! Shared setup of the commands that run sub-tasks.

use super::Host;
use super::ProgressReporter;
use super::config::{Config, validate_repo};
use crate::Result;
use crate::collect::{ApiClient, CollectContext, CollectOptions, Progress, RateLimitSettings, RequestTracker};
use crate::store::{CollectionParams, SqliteStore};
use crate::tasks::{SubtaskKind, SubtaskMeta, SubtaskOutcome, SubtaskReport, TaskTable};
use camino::Utf8PathBuf;
use clap::{Args, ValueEnum};
use core::time::Duration;
use directories::ProjectDirs;
use ohno::{EnrichableExt, IntoAppError, app_err, bail};
use owo_colors::OwoColorize;
use std::io::Write;
use std::sync::Arc;
use tokio::sync::watch;

const LOG_TARGET: &str = "    ghsync";

const DATABASE_FILE: &str = "ghsync.db";

/// Color mode configuration for output
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ColorMode {
    /// Always use colors
    Always,

    /// Never use colors
    Never,

    /// Use colors if the output is a terminal, otherwise don't use colors
    Auto,
}

impl ColorMode {
    #[must_use]
    pub fn enabled_for(self, stream: &impl std::io::IsTerminal) -> bool {
        match self {
            Self::Always => true,
            Self::Never => false,
            Self::Auto => stream.is_terminal(),
        }
    }
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    /// No logging output
    None,

    /// Only error messages
    Error,

    /// Warning and error messages
    Warn,

    /// Info, warning, and error messages
    Info,

    /// Debug, info, warning, and error messages
    Debug,

    /// Trace, debug, info, warning, and error messages
    Trace,
}

/// Arguments shared by every command that touches the store
#[derive(Args, Debug)]
pub struct CommonArgs {
    /// Path to configuration file (default is `ghsync.toml` in the current directory)
    #[arg(long, short = 'c', value_name = "PATH")]
    pub config: Option<Utf8PathBuf>,

    /// SQLite database file (default is a file in the platform data directory)
    #[arg(long, value_name = "PATH")]
    pub database: Option<Utf8PathBuf>,

    /// Control when to use colored output
    #[arg(long, value_name = "WHEN", default_value = "auto")]
    pub color: ColorMode,

    /// Set the logging level for diagnostic output
    #[arg(long, value_name = "LEVEL", default_value = "none", global = true)]
    pub log_level: LogLevel,
}

/// Which repository to process, and as whom
#[derive(Args, Debug)]
pub struct ScopeArgs {
    /// Repository to process, as `owner/name` (default comes from the configuration file)
    #[arg(long, short = 'r', value_name = "OWNER/NAME")]
    pub repo: Option<String>,

    /// Connection the collected rows belong to (default comes from the configuration file)
    #[arg(long, value_name = "ID")]
    pub connection_id: Option<u64>,

    /// GitHub access tokens, comma-separated, used in rotation
    #[arg(long = "token", value_name = "TOKEN", env = "GITHUB_TOKEN", value_delimiter = ',', hide_env_values = true)]
    pub tokens: Vec<String>,

    /// Run only the named sub-tasks (see `ghsync tasks`), comma-separated
    #[arg(long = "task", value_name = "NAME", value_delimiter = ',')]
    pub tasks: Vec<String>,
}

/// Everything needed to run sub-tasks against one repository.
pub struct Common<'a, H: Host> {
    pub config: Config,
    host: &'a mut H,
    store: SqliteStore,
    client: ApiClient,
    params: CollectionParams,
    progress: Arc<dyn Progress>,
    use_colors: bool,
}

impl<'a, H: Host> Common<'a, H> {
    /// Load the configuration, open the store, and build the API client
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, no repository is given, or the
    /// store cannot be opened
    pub fn new(host: &'a mut H, args: &CommonArgs, scope: &ScopeArgs) -> Result<Self> {
        init_logging(args.log_level);

        let config = Config::load(args.config.as_ref())?;

        let repo = scope
            .repo
            .clone()
            .or_else(|| config.repo.clone())
            .ok_or_else(|| app_err!("no repository given; pass --repo or set `repo` in the configuration file"))?;
        validate_repo(&repo)?;

        let params = CollectionParams::new(scope.connection_id.unwrap_or(config.connection_id), repo);

        let tokens = if scope.tokens.is_empty() { &config.tokens } else { &scope.tokens };
        let client = ApiClient::new(tokens, &config.base_url)?;
        if client.token_count() == 0 {
            log::warn!(target: LOG_TARGET, "No GitHub token configured, requests are unauthenticated and heavily rate limited");
        }

        let database = database_path(args.database.as_ref(), &config)?;
        log::info!(target: LOG_TARGET, "Using database '{database}'");
        let store = SqliteStore::open(&database)?;

        let delay = if args.log_level == LogLevel::None {
            Duration::from_millis(300)
        } else {
            Duration::from_hours(365 * 24)
        };

        let progress: Arc<dyn Progress> = Arc::new(ProgressReporter::new(delay, args.color.enabled_for(&std::io::stderr())));

        Ok(Self {
            config,
            host,
            store,
            client,
            params,
            progress,
            use_colors: args.color.enabled_for(&std::io::stdout()),
        })
    }

    /// Run the selected sub-tasks in table order, stopping at the first failure.
    ///
    /// Ctrl-C stops admitting new work; requests in flight complete, and the interrupted
    /// task reports an error without saving its progress.
    pub async fn run_tasks(&mut self, kind: Option<SubtaskKind>, names: &[String], full_sync: bool) -> Result<()> {
        let table = TaskTable::github();
        let selected = table.select(names, kind)?;
        if selected.is_empty() {
            let _ = writeln!(self.host.output(), "No tasks selected");
            return Ok(());
        }

        let (cancel_tx, cancel) = watch::channel(false);
        let ctrl_c = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::warn!(target: LOG_TARGET, "Interrupted, waiting for requests in flight");
                let _ = cancel_tx.send(true);
            }
        });

        let options = self.collect_options(full_sync);
        let result = self.run_selected(&selected, options, &cancel).await;

        ctrl_c.abort();
        self.progress.done();
        result
    }

    fn collect_options(&self, full_sync: bool) -> CollectOptions {
        CollectOptions {
            page_size: self.config.page_size,
            max_pages_per_item: self.config.max_pages_per_item,
            batch_size: self.config.batch_size,
            full_sync,
            limits: RateLimitSettings {
                concurrency: self.config.concurrency,
                rate_limit_per_hour: self.config.rate_limit_per_hour,
                default_rate_limit_per_hour: self.config.default_rate_limit_per_hour,
                max_rate_limit_wait: self.config.max_rate_limit_wait,
            },
        }
    }

    async fn run_selected(&mut self, selected: &[&SubtaskMeta], options: CollectOptions, cancel: &watch::Receiver<bool>) -> Result<()> {
        for (index, meta) in selected.iter().enumerate() {
            if *cancel.borrow() {
                bail!("cancelled before task '{}' started", meta.name);
            }

            let tracker = RequestTracker::new(&self.progress);
            match meta.kind {
                SubtaskKind::Collect => self.progress.set_phase("Collecting"),
                SubtaskKind::Extract => {
                    let name = meta.name;
                    self.progress.set_phase("Extracting");
                    self.progress.set_indeterminate(Box::new(move || name.to_string()));
                }
            }

            let ctx = CollectContext {
                store: self.store.clone(),
                client: self.client.clone(),
                params: self.params.clone(),
                options,
                cancel: cancel.clone(),
                tracker,
            };

            match (meta.entry_point)(&ctx).await {
                Ok(report) => self.print_report(&report),
                Err(e) => {
                    let _ = writeln!(self.host.error(), "{} of {} tasks completed before '{}' failed", index, selected.len(), meta.name);
                    return Err(e.enrich_with(|| format!("running task '{}' for {}", meta.name, self.params)));
                }
            }
        }

        Ok(())
    }

    fn print_report(&mut self, report: &SubtaskReport) {
        let verb = match report.outcome {
            SubtaskOutcome::Collected(_) => "Collected",
            SubtaskOutcome::Extracted(_) => "Extracted",
        };

        let verb = format!("{verb:>12}");
        let _ = if self.use_colors {
            writeln!(self.host.output(), "{} {report}", verb.bold().green())
        } else {
            writeln!(self.host.output(), "{verb} {report}")
        };
    }
}

/// Initialize logger based on log level
pub fn init_logging(log_level: LogLevel) {
    let level = match log_level {
        LogLevel::None => return,
        LogLevel::Error => "error",
        LogLevel::Warn => "warn",
        LogLevel::Info => "info",
        LogLevel::Debug => "debug",
        LogLevel::Trace => "trace",
    };

    let env = env_logger::Env::default().filter_or("RUST_LOG", level);

    // try_init: tests may run several commands in one process
    let _ = env_logger::Builder::from_env(env)
        .format_timestamp(None)
        .format_module_path(false)
        .format_target(true)
        .try_init();
}

/// The database file: `--database`, else the configuration, else the platform data directory.
fn database_path(cli: Option<&Utf8PathBuf>, config: &Config) -> Result<Utf8PathBuf> {
    if let Some(path) = cli.or(config.database.as_ref()) {
        return Ok(path.clone());
    }

    let dirs = ProjectDirs::from("", "", "ghsync").into_app_err("could not determine the data directory")?;
    Utf8PathBuf::from_path_buf(dirs.data_dir().join(DATABASE_FILE))
        .map_err(|path| app_err!("data directory '{}' is not valid UTF-8", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_database_wins() {
        let config = Config {
            database: Some("from-config.db".into()),
            ..Config::default()
        };

        let cli = Utf8PathBuf::from("from-cli.db");
        assert_eq!(database_path(Some(&cli), &config).unwrap(), cli);
        assert_eq!(database_path(None, &config).unwrap(), "from-config.db");
    }

    #[test]
    fn default_database_lives_in_data_dir() {
        if let Ok(path) = database_path(None, &Config::default()) {
            assert_eq!(path.file_name(), Some(DATABASE_FILE));
        }
    }

    #[test]
    fn color_mode_is_honored() {
        let stdout = std::io::stdout();
        assert!(ColorMode::Always.enabled_for(&stdout));
        assert!(!ColorMode::Never.enabled_for(&stdout));
    }
}
