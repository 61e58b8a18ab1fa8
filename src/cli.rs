//! Command-line argument parsing for sqlsess.

use crate::config::{Config, OpenMode, SessionConfig};
use crate::db::{ExecuteOptions, RowMode, Value};
use crate::error::{Result, SessionError};
use crate::meta::MetaTable;
use clap::{ArgGroup, Parser};
use std::path::PathBuf;

/// What the binary was asked to do.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Execute one statement with positional parameters.
    Sql { sql: String, params: Vec<Value> },
    /// Query the metadata namespace, optionally for one table.
    Meta {
        table: MetaTable,
        filter: Option<String>,
    },
    /// Check that the database can be opened and queried.
    Test,
}

/// Run SQL or metadata queries against a SQLite database and print JSON.
#[derive(Parser, Debug)]
#[command(name = "sqlsess")]
#[command(version, about, long_about = None)]
#[command(group(ArgGroup::new("action").required(true).args(["sql", "meta", "test"])))]
pub struct Cli {
    /// Connection string (e.g., sqlite:///path/app.db?mode=ro) or a plain file path
    #[arg(value_name = "CONNECTION_STRING")]
    pub connection_string: Option<String>,

    /// Use named session from config
    #[arg(short = 'c', long, value_name = "NAME")]
    pub connection: Option<String>,

    /// Config file path
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Open mode: ro, rw or rwc
    #[arg(long, value_name = "MODE")]
    pub mode: Option<OpenMode>,

    /// Busy timeout in milliseconds
    #[arg(long, value_name = "MS", env = "SQLSESS_BUSY_TIMEOUT")]
    pub busy_timeout: Option<u64>,

    /// Print rows as objects keyed by field name
    #[arg(long)]
    pub objects: bool,

    /// Fetch at most N rows (0 = all)
    #[arg(long, value_name = "N", default_value = "0")]
    pub fetch: usize,

    /// SQL statement to execute
    #[arg(long, value_name = "SQL")]
    pub sql: Option<String>,

    /// Positional parameter for --sql (repeatable)
    #[arg(short = 'p', long = "param", value_name = "VALUE", requires = "sql")]
    pub params: Vec<String>,

    /// Metadata table: schemas, tables, columns, primary_keys or foreign_keys
    #[arg(long, value_name = "TABLE")]
    pub meta: Option<String>,

    /// Restrict --meta output to one table
    #[arg(long, value_name = "NAME", requires = "meta")]
    pub table: Option<String>,

    /// Open the database and run a trivial query
    #[arg(long)]
    pub test: bool,

    /// Write logs to a file instead of stderr (default location if PATH is omitted)
    #[arg(long, value_name = "PATH", num_args = 0..=1)]
    pub log_file: Option<Option<PathBuf>>,
}

impl Cli {
    /// Parses command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Returns the config file path to use.
    pub fn config_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(Config::default_path)
    }

    /// Returns the log file to write to, if file logging was requested.
    pub fn log_path(&self) -> Option<PathBuf> {
        self.log_file
            .as_ref()
            .map(|path| path.clone().unwrap_or_else(crate::logging::default_log_path))
    }

    /// Resolves the session config.
    ///
    /// Precedence: connection string argument, then the named session, then the
    /// `default` session from the config file, then an in-memory database.
    /// `--mode` and `--busy-timeout` override whatever was resolved, and
    /// environment defaults fill the rest.
    pub fn resolve_session(&self, config: &Config) -> Result<SessionConfig> {
        let mut session = match (&self.connection_string, &self.connection) {
            (Some(conn_str), _) => SessionConfig::from_connection_string(conn_str)?,
            (None, Some(name)) => config.get_session(Some(name)).cloned().ok_or_else(|| {
                SessionError::config(format!("Session '{name}' not found in config file"))
            })?,
            (None, None) => config.get_session(None).cloned().unwrap_or_default(),
        };

        if let Some(mode) = self.mode {
            session.mode = mode;
        }
        if self.busy_timeout.is_some() {
            session.busy_timeout_ms = self.busy_timeout;
        }
        session.apply_env_defaults();
        session.validate()?;
        Ok(session)
    }

    /// Returns the execute options implied by the output flags.
    pub fn execute_options(&self) -> ExecuteOptions {
        let row_mode = if self.objects {
            RowMode::Object
        } else {
            RowMode::Array
        };
        ExecuteOptions::default()
            .with_fetch_rows(self.fetch)
            .with_row_mode(row_mode)
    }

    /// Returns the requested action.
    pub fn action(&self) -> Result<Action> {
        if let Some(sql) = &self.sql {
            return Ok(Action::Sql {
                sql: sql.clone(),
                params: self.params.iter().map(|p| parse_param(p)).collect(),
            });
        }
        if let Some(name) = &self.meta {
            let table = MetaTable::parse(name)
                .ok_or_else(|| SessionError::config(format!("Unknown metadata table '{name}'")))?;
            return Ok(Action::Meta {
                table,
                filter: self.table.clone(),
            });
        }
        Ok(Action::Test)
    }
}

/// Binds integers and reals as numbers, `null` as NULL, anything else as text.
fn parse_param(raw: &str) -> Value {
    if raw.eq_ignore_ascii_case("null") {
        return Value::Null;
    }
    if let Ok(i) = raw.parse::<i64>() {
        return Value::Integer(i);
    }
    if let Ok(f) = raw.parse::<f64>() {
        return Value::Real(f);
    }
    Value::from(raw)
}
