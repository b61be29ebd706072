use clap::{Parser, Subcommand, ValueEnum};
use mirador_core::config::{load_engine_config, EngineConfig};
use mirador_core::error::AppError;
use std::path::PathBuf;
use tracing::Level;

/// CLI configuration parsed from command line arguments and environment variables
#[derive(Parser, Debug)]
#[command(name = "mirador")]
#[command(
    author,
    version,
    about = "Local mirror of an upstream real-estate listings API"
)]
#[command(after_help = "Examples:
  mirador serve
  mirador sync --force
  mirador cleanup
  mirador status
  mirador show 1042")]
pub struct Config {
    /// PostgreSQL database connection URL
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// Base URL of the upstream listings API (overrides the config file)
    #[arg(long, env = "UPSTREAM_BASE_URL")]
    pub upstream_base_url: Option<String>,

    /// Upstream API key (overrides the config file)
    #[arg(long, env = "UPSTREAM_API_KEY", hide_env_values = true)]
    pub upstream_api_key: Option<String>,

    /// Upstream API secret (overrides the config file)
    #[arg(long, env = "UPSTREAM_API_SECRET", hide_env_values = true)]
    pub upstream_api_secret: Option<String>,

    /// Custom path to config.toml
    #[arg(short, long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Log verbosity (logs go to stderr)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: LogLevel,

    #[command(subcommand)]
    pub command: Command,
}

impl Config {
    /// Loads the engine configuration file and applies command-line and
    /// environment overrides on top.
    pub fn engine_config(&self) -> Result<EngineConfig, AppError> {
        let mut engine = load_engine_config(self.config.as_deref())?;
        self.apply_overrides(&mut engine);
        Ok(engine)
    }

    fn apply_overrides(&self, engine: &mut EngineConfig) {
        if let Some(url) = &self.upstream_base_url {
            engine.upstream.base_url = Some(url.clone());
        }
        if let Some(key) = &self.upstream_api_key {
            engine.upstream.api_key = Some(key.clone());
        }
        if let Some(secret) = &self.upstream_api_secret {
            engine.upstream.api_secret = Some(secret.clone());
        }
    }
}

/// Available CLI commands
#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// Run the periodic sync scheduler until Ctrl-C
    Serve,
    /// Run one sync cycle and print its statistics
    #[command(after_help = "Examples:
  mirador sync          # Skipped if the schedule gate says the cache is fresh
  mirador sync --force  # Always run, like a manual trigger")]
    Sync {
        /// Bypass the schedule gate
        #[arg(short, long)]
        force: bool,
    },
    /// Flag long-expired listings for review and purge long-absent disabled ones
    Cleanup,
    /// Show the schedule gate decision and store statistics
    Status,
    /// Print one cached listing as JSON
    #[command(after_help = "Example: mirador show 1042")]
    Show {
        /// Upstream identifier of the listing
        id: i64,
    },
}

/// Supported log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn parse(args: &[&str]) -> Config {
        let mut argv = vec!["mirador", "--database-url", "postgres://localhost/mirador"];
        argv.extend_from_slice(args);
        Config::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_parse_sync_force() {
        let config = parse(&["sync", "--force"]);
        assert_eq!(config.command, Command::Sync { force: true });
        assert_eq!(config.log_level, LogLevel::Info);
    }

    #[test]
    fn test_parse_show_requires_numeric_id() {
        assert_eq!(parse(&["show", "1042"]).command, Command::Show { id: 1042 });

        let result = Config::try_parse_from([
            "mirador",
            "--database-url",
            "postgres://localhost/mirador",
            "show",
            "abc",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let config = parse(&["status", "--log-level", "debug"]);
        assert_eq!(config.command, Command::Status);
        assert_eq!(Level::from(config.log_level), Level::DEBUG);
    }

    #[test]
    fn test_overrides_win_over_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[upstream]\nbase_url = \"https://file.example.com\"\napi_key = \"file-key\"\n\n[sync]\nbatch_size = 20"
        )
        .unwrap();
        let path = file.path().to_str().unwrap();

        let config = parse(&[
            "--upstream-api-key",
            "cli-key",
            "--config",
            path,
            "cleanup",
        ]);
        let engine = config.engine_config().unwrap();

        assert_eq!(
            engine.upstream.base_url.as_deref(),
            Some("https://file.example.com")
        );
        assert_eq!(engine.upstream.api_key.as_deref(), Some("cli-key"));
        assert_eq!(engine.sync.batch_size, 20);
    }

    #[test]
    fn test_missing_explicit_config_file_is_error() {
        let config = parse(&["--config", "/nonexistent/mirador.toml", "status"]);
        assert!(matches!(
            config.engine_config(),
            Err(AppError::ConfigFile(_))
        ));
    }
}
