//! mysql-gate - Policy-enforcing SQL gateway for MySQL.

use std::sync::Arc;

use anyhow::Context;
use mysql_gate::cli::{Cli, Command};
use mysql_gate::connection::SessionManager;
use mysql_gate::db::MySqlPoolFactory;
use mysql_gate::logging;
use mysql_gate::safety::Gate;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let cli = Cli::parse_args();

    match &cli.log_file {
        Some(path) => logging::init_file_logging(path.as_deref()),
        None => logging::init_stderr_logging(),
    }

    if let Err(e) = run(cli).await {
        error!("{e:#}");
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = cli.policy_config().context("Failed to load configuration")?;

    match &cli.command {
        Command::Check { sql, report } => {
            let gate = Gate::new();
            let json = if *report {
                serde_json::to_string_pretty(&gate.security_report(sql, &config))?
            } else {
                serde_json::to_string_pretty(&gate.check_operation(sql, &config))?
            };
            println!("{json}");
        }
        Command::Exec { sql, .. } => {
            let params = cli.command.query_params()?;
            let sessions = SessionManager::new(Arc::new(MySqlPoolFactory::new()));
            let session = sessions.create("cli", config).await;
            info!(session = session.id(), "Executing statement");

            let outcome = session.executor().execute_query(sql, params).await;
            sessions.close_all().await;

            let rows = outcome?;
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        Command::Info => {
            let sessions = SessionManager::new(Arc::new(MySqlPoolFactory::new()));
            let session = sessions.create("cli", config).await;
            let info = session.executor().get_database_info().await;
            sessions.close_all().await;

            println!("{}", serde_json::to_string_pretty(&info)?);
        }
    }

    Ok(())
}
