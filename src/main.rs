//! sqlsess - run SQL or metadata queries against a SQLite database.

use serde_json::json;
use sqlite_session::cli::{Action, Cli};
use sqlite_session::config::Config;
use sqlite_session::db::{ExecuteRequest, ExecuteResult, Session};
use sqlite_session::logging;
use sqlite_session::meta::SchemaReflector;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    // A missing .env is fine
    let _ = dotenvy::dotenv();

    let cli = Cli::parse_args();
    match cli.log_path() {
        Some(path) => logging::init_file_logging(&path),
        None => logging::init_stderr_logging(),
    }

    if let Err(e) = run(cli).await {
        error!("{e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config_path = cli.config_path();
    info!("Loading config from: {}", config_path.display());
    let config = Config::load_from_file(&config_path)?;

    let session_config = cli.resolve_session(&config)?;
    let action = cli.action()?;
    let options = cli.execute_options();

    let session = Arc::new(Session::open(&session_config).await?);

    let output = match action {
        Action::Sql { sql, params } => {
            let result = session
                .execute(
                    ExecuteRequest::new(sql)
                        .with_values(params)
                        .with_options(options),
                )
                .await?;
            result_json(result)?
        }
        Action::Meta { table, filter } => {
            let reflector =
                SchemaReflector::with_namespace(session.clone(), &session_config.meta_namespace)?;
            let result = reflector.query(table, filter.as_deref(), options).await?;
            result_json(result)?
        }
        Action::Test => {
            session.test().await?;
            json!({ "ok": true, "database": session_config.display_string() })
        }
    };

    session.close().await?;

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn result_json(result: ExecuteResult) -> anyhow::Result<serde_json::Value> {
    let fields: Vec<String> = result.fields().iter().map(|f| f.name.clone()).collect();
    let rows = result
        .into_rows()
        .ok_or_else(|| anyhow::anyhow!("Expected materialized rows"))?;
    Ok(json!({ "fields": fields, "rows": rows }))
}
