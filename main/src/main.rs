mod args;

use anyhow::{bail, Context};
use clap::Parser;
use common::{
    storage::{
        bootstrap::{run_bootstrap, BootstrapOptions},
        db::MongoDbClient,
        verify::verify_target_state,
    },
    utils::config::{get_config, get_config_from_file, LogFormat},
};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::args::{Cli, Command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Get config
    let mut config = match &cli.config_file {
        Some(path) => get_config_from_file(path),
        None => get_config(),
    }
    .context("loading configuration")?;
    cli.apply_overrides(&mut config);

    // Set up tracing
    init_tracing(config.log_format);

    let db = MongoDbClient::new(&config)
        .await
        .context("configuring MongoDB client")?;

    match cli.selected_command() {
        Command::Bootstrap => {
            let options = BootstrapOptions::from_config(&config);
            info!(
                database = %config.mongo_db_name,
                skip_replica_set_init = options.skip_replica_set_init,
                wait_for_indexes = options.wait_for_indexes,
                "Starting bootstrap"
            );

            match run_bootstrap(&db, &options).await {
                Ok(report) => println!("{report}"),
                Err(err) => {
                    error!(category = %err.category(), error = %err, "Bootstrap aborted");
                    return Err(err).context("bootstrap aborted; fix the cause and re-run");
                }
            }
        }
        Command::Verify { json } => {
            let report = verify_target_state(&db)
                .await
                .inspect_err(|err| {
                    error!(category = %err.category(), error = %err, "Verification failed");
                })
                .context("verifying target state")?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{report}");
            }

            if !report.is_ok() {
                bail!(
                    "database '{}' differs from the target state in {} places",
                    report.database,
                    report.issues.len()
                );
            }
        }
    }

    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
            .ok(),
        LogFormat::Pretty => registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init()
            .ok(),
    };
}
