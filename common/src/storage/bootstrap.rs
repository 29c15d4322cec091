use std::{fmt, time::Duration};

use mongodb::bson::{doc, Document};
use tracing::{info, warn};

use super::{
    db::AdminOps,
    indexes::{search_index_specs, wait_for_search_indexes, SearchIndexSpec, TARGET_COLLECTIONS},
};
use crate::{
    error::{codes, AppError},
    utils::config::AppConfig,
};

#[derive(Debug, Clone, PartialEq)]
pub struct BootstrapOptions {
    pub skip_replica_set_init: bool,
    /// Explicit `replSetInitiate` config; `None` lets the server derive one.
    pub replica_set_config: Option<Document>,
    pub primary_wait_timeout: Duration,
    pub wait_for_indexes: bool,
    pub index_poll_interval: Duration,
    pub index_wait_timeout: Duration,
}

impl Default for BootstrapOptions {
    fn default() -> Self {
        Self {
            skip_replica_set_init: false,
            replica_set_config: None,
            primary_wait_timeout: Duration::from_secs(30),
            wait_for_indexes: false,
            index_poll_interval: Duration::from_secs(2),
            index_wait_timeout: Duration::from_secs(300),
        }
    }
}

impl BootstrapOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            skip_replica_set_init: config.skip_replica_set_init,
            replica_set_config: config
                .replica_set_member_host
                .as_deref()
                .map(|host| single_member_config(&config.replica_set_name, host)),
            primary_wait_timeout: config.primary_wait_timeout(),
            wait_for_indexes: config.wait_for_indexes,
            index_poll_interval: config.index_poll_interval(),
            index_wait_timeout: config.index_wait_timeout(),
        }
    }
}

/// `replSetInitiate` config for a one-member set.
pub fn single_member_config(set_name: &str, host: &str) -> Document {
    doc! {
        "_id": set_name,
        "members": [{ "_id": 0, "host": host }],
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Milestone {
    ReplicaSet,
    WritablePrimary,
    Database(String),
    Collection(&'static str),
    SearchIndex {
        collection: &'static str,
        index: &'static str,
    },
    TtlIndex {
        collection: &'static str,
        index: String,
    },
    SearchIndexesReady,
}

impl fmt::Display for Milestone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReplicaSet => f.write_str("replica set initiated"),
            Self::WritablePrimary => f.write_str("writable primary available"),
            Self::Database(name) => write!(f, "database '{name}' selected"),
            Self::Collection(name) => write!(f, "collection '{name}'"),
            Self::SearchIndex { collection, index } => {
                write!(f, "vector search index '{index}' on '{collection}'")
            }
            Self::TtlIndex { collection, index } => {
                write!(f, "TTL index '{index}' on '{collection}'")
            }
            Self::SearchIndexesReady => f.write_str("vector search indexes queryable"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Applied,
    AlreadyPresent,
    Skipped,
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Self::Applied => "applied",
            Self::AlreadyPresent => "present",
            Self::Skipped => "skipped",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRecord {
    pub milestone: Milestone,
    pub outcome: StepOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapReport {
    pub database: String,
    pub steps: Vec<StepRecord>,
}

impl BootstrapReport {
    fn record(&mut self, milestone: Milestone, outcome: StepOutcome) {
        info!(step = %milestone, outcome = %outcome, "Bootstrap step finished");
        self.steps.push(StepRecord { milestone, outcome });
    }

    pub fn outcome_of(&self, milestone: &Milestone) -> Option<StepOutcome> {
        self.steps
            .iter()
            .find(|step| &step.milestone == milestone)
            .map(|step| step.outcome)
    }
}

impl fmt::Display for BootstrapReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for step in &self.steps {
            writeln!(f, "[{:>7}] {}", step.outcome, step.milestone)?;
        }
        write!(
            f,
            "Bootstrap complete: database '{}' is ready for data.",
            self.database
        )
    }
}

/// Bring the deployment to its target state: replica set, collections, vector search indexes
/// and the cache TTL index.
///
/// Safe to re-run. Only the "already there" answer of each step is tolerated; any other
/// failure aborts with the original cause and leaves a state the next run continues from.
pub async fn run_bootstrap<A>(ops: &A, options: &BootstrapOptions) -> Result<BootstrapReport, AppError>
where
    A: AdminOps + ?Sized,
{
    let mut report = BootstrapReport {
        database: ops.database_name(),
        steps: Vec::new(),
    };

    if options.skip_replica_set_init {
        report.record(Milestone::ReplicaSet, StepOutcome::Skipped);
        report.record(Milestone::WritablePrimary, StepOutcome::Skipped);
    } else {
        let outcome = tolerate(
            ops.initiate_replica_set(options.replica_set_config.clone())
                .await
                .map(|()| StepOutcome::Applied),
            &[codes::ALREADY_INITIALIZED],
            &Milestone::ReplicaSet,
        )?;
        report.record(Milestone::ReplicaSet, outcome);

        ops.await_writable_primary(options.primary_wait_timeout)
            .await?;
        report.record(Milestone::WritablePrimary, StepOutcome::Applied);
    }

    report.record(
        Milestone::Database(report.database.clone()),
        StepOutcome::Applied,
    );

    for collection in TARGET_COLLECTIONS {
        let milestone = Milestone::Collection(collection.name);
        let outcome = tolerate(
            ops.create_collection(collection.name)
                .await
                .map(|()| StepOutcome::Applied),
            &[codes::NAMESPACE_EXISTS],
            &milestone,
        )?;
        report.record(milestone, outcome);

        for spec in collection.search_indexes {
            let milestone = Milestone::SearchIndex {
                collection: spec.collection,
                index: spec.index_name,
            };
            let outcome = tolerate(
                ops.create_search_index(spec)
                    .await
                    .map(|()| StepOutcome::Applied),
                &[codes::INDEX_ALREADY_EXISTS],
                &milestone,
            )?;
            report.record(milestone, outcome);
        }

        for spec in collection.ttl_indexes {
            let milestone = Milestone::TtlIndex {
                collection: spec.collection,
                index: spec.index_name(),
            };
            let outcome = tolerate(
                ops.create_ttl_index(spec).await.map(|created| {
                    if created {
                        StepOutcome::Applied
                    } else {
                        StepOutcome::AlreadyPresent
                    }
                }),
                &[codes::INDEX_ALREADY_EXISTS],
                &milestone,
            )?;
            report.record(milestone, outcome);
        }
    }

    if options.wait_for_indexes {
        let specs: Vec<SearchIndexSpec> = search_index_specs().copied().collect();
        wait_for_search_indexes(
            ops,
            &specs,
            options.index_poll_interval,
            options.index_wait_timeout,
        )
        .await?;
        report.record(Milestone::SearchIndexesReady, StepOutcome::Applied);
    } else {
        report.record(Milestone::SearchIndexesReady, StepOutcome::Skipped);
    }

    info!(database = %report.database, "Bootstrap sequence complete");
    Ok(report)
}

/// Map a step result onto its outcome, swallowing only the listed server codes.
fn tolerate(
    result: Result<StepOutcome, AppError>,
    tolerated: &[i32],
    milestone: &Milestone,
) -> Result<StepOutcome, AppError> {
    match result {
        Ok(outcome) => Ok(outcome),
        Err(err) if err.command_code().is_some_and(|code| tolerated.contains(&code)) => {
            info!(step = %milestone, reason = %err, "Already in place; continuing");
            Ok(StepOutcome::AlreadyPresent)
        }
        Err(err) => {
            warn!(
                step = %milestone,
                category = %err.category(),
                error = %err,
                "Bootstrap step failed"
            );
            Err(err)
        }
    }
}
