use std::path::PathBuf;

use clap::{Parser, Subcommand};
use common::utils::config::AppConfig;

#[derive(Debug, Parser)]
#[command(
    name = "mongo-init",
    version,
    about = "Provision the agentic_os MongoDB deployment: replica set, collections, vector search and TTL indexes"
)]
pub struct Cli {
    /// Read configuration from this file instead of ./config.*
    #[arg(long, global = true, env = "MONGO_INIT_CONFIG")]
    pub config_file: Option<PathBuf>,

    /// Override the target database
    #[arg(long, global = true)]
    pub database: Option<String>,

    /// Leave replica set initiation to the hosting provider
    #[arg(long, global = true, action = clap::ArgAction::SetTrue)]
    pub skip_replica_set_init: bool,

    /// Block until every vector search index is queryable
    #[arg(long, global = true, action = clap::ArgAction::SetTrue)]
    pub wait_for_indexes: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Bring the database to its target state (default)
    Bootstrap,
    /// Compare the live database with the target state without changing it
    Verify {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
}

impl Cli {
    pub fn selected_command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Bootstrap)
    }

    /// Flags only ever switch behaviour on; an absent flag keeps the configured value.
    pub fn apply_overrides(&self, config: &mut AppConfig) {
        if let Some(database) = &self.database {
            config.mongo_db_name.clone_from(database);
        }
        if self.skip_replica_set_init {
            config.skip_replica_set_init = true;
        }
        if self.wait_for_indexes {
            config.wait_for_indexes = true;
        }
    }
}
