use std::{collections::BTreeMap, fmt};

use mongodb::bson::Document;
use serde::Serialize;
use tracing::{info, warn};

use super::{
    db::AdminOps,
    indexes::{
        bson_as_i64, parse_search_index, CollectionSpec, SearchIndexSnapshot, SearchIndexSpec,
        TtlIndexSpec, VectorDefinition, TARGET_COLLECTIONS,
    },
};
use crate::error::AppError;

const ID_INDEX: &str = "_id_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Issue {
    pub collection: String,
    pub subject: String,
    pub problem: String,
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}: {}", self.collection, self.subject, self.problem)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerificationReport {
    pub database: String,
    /// Target collections that exist.
    pub collections: Vec<String>,
    /// Regular and search index names found on each existing target collection.
    pub indexes: BTreeMap<String, Vec<String>>,
    pub issues: Vec<Issue>,
}

impl VerificationReport {
    pub fn is_ok(&self) -> bool {
        self.issues.is_empty()
    }

    fn push(&mut self, collection: &str, subject: &str, problem: String) {
        self.issues.push(Issue {
            collection: collection.to_string(),
            subject: subject.to_string(),
            problem,
        });
    }
}

impl fmt::Display for VerificationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Database '{}'", self.database)?;
        for (collection, names) in &self.indexes {
            writeln!(f, "  {collection}: {}", names.join(", "))?;
        }
        if self.is_ok() {
            return write!(f, "Target state verified, no discrepancies.");
        }
        for issue in &self.issues {
            writeln!(f, "  ! {issue}")?;
        }
        write!(f, "{} discrepancies found.", self.issues.len())
    }
}

/// Compare the live database against the target collections and indexes. Never mutates.
pub async fn verify_target_state<A>(ops: &A) -> Result<VerificationReport, AppError>
where
    A: AdminOps + ?Sized,
{
    let mut report = VerificationReport {
        database: ops.database_name(),
        ..VerificationReport::default()
    };
    let existing = ops.list_collection_names().await?;

    for collection in TARGET_COLLECTIONS {
        if !existing.iter().any(|name| name == collection.name) {
            report.push(collection.name, "collection", "missing".to_string());
            continue;
        }
        report.collections.push(collection.name.to_string());

        let indexes = ops.list_indexes(collection.name).await?;
        let snapshots: Vec<SearchIndexSnapshot> = ops
            .list_search_indexes(collection.name)
            .await?
            .iter()
            .filter_map(parse_search_index)
            .collect();

        let names = indexes
            .iter()
            .filter_map(|index| index.get_str("name").ok().map(str::to_string))
            .chain(snapshots.iter().map(|snapshot| snapshot.name.clone()))
            .collect();
        report.indexes.insert(collection.name.to_string(), names);

        for spec in collection.search_indexes {
            let snapshot = snapshots
                .iter()
                .find(|snapshot| snapshot.name == spec.index_name);
            for problem in check_search_index(spec, snapshot) {
                report.push(collection.name, spec.index_name, problem);
            }
        }

        for spec in collection.ttl_indexes {
            for problem in check_ttl_index(spec, &indexes) {
                report.push(collection.name, &spec.index_name(), problem);
            }
        }

        for index in &indexes {
            let name = index.get_str("name").unwrap_or_default();
            if !is_expected_index(collection, index) {
                report.push(collection.name, name, "unexpected index".to_string());
            }
        }
        for snapshot in &snapshots {
            if !collection
                .search_indexes
                .iter()
                .any(|spec| spec.index_name == snapshot.name)
            {
                report.push(
                    collection.name,
                    &snapshot.name,
                    "unexpected search index".to_string(),
                );
            }
        }
    }

    if report.is_ok() {
        info!(database = %report.database, "Target state verified");
    } else {
        for issue in &report.issues {
            warn!(
                collection = %issue.collection,
                subject = %issue.subject,
                problem = %issue.problem,
                "Target state discrepancy"
            );
        }
    }

    Ok(report)
}

/// Whether a regular index belongs to the target state: `_id_` or a TTL index, by name or key.
pub fn is_expected_index(collection: &CollectionSpec, index: &Document) -> bool {
    let name = index.get_str("name").unwrap_or_default();
    if name == ID_INDEX {
        return true;
    }

    collection.ttl_indexes.iter().any(|spec| {
        name == spec.index_name()
            || index
                .get_document("key")
                .is_ok_and(|key| key.len() == 1 && key.contains_key(spec.field))
    })
}

/// Differences between a listed search index and its specification.
pub fn check_search_index(
    spec: &SearchIndexSpec,
    snapshot: Option<&SearchIndexSnapshot>,
) -> Vec<String> {
    let Some(snapshot) = snapshot else {
        return vec!["missing".to_string()];
    };

    let mut problems = Vec::new();
    if let Some(index_type) = snapshot.index_type.as_deref() {
        if index_type != "vectorSearch" {
            problems.push(format!("type is {index_type}, expected vectorSearch"));
        }
    }
    if snapshot.has_failed() {
        problems.push(format!("build status is {}", snapshot.status));
    }

    let Some(definition) = snapshot.definition.as_ref() else {
        problems.push("definition not reported".to_string());
        return problems;
    };
    let actual = VectorDefinition::from_definition(definition);

    if actual.vector_path.as_deref() != Some(spec.vector_path) {
        problems.push(format!(
            "vector path is {:?}, expected {}",
            actual.vector_path, spec.vector_path
        ));
    }
    if actual.dimensions != Some(i64::from(spec.dimensions)) {
        problems.push(format!(
            "numDimensions is {:?}, expected {}",
            actual.dimensions, spec.dimensions
        ));
    }
    if actual.similarity.as_deref() != Some(spec.similarity.as_str()) {
        problems.push(format!(
            "similarity is {:?}, expected {}",
            actual.similarity,
            spec.similarity.as_str()
        ));
    }

    let mut filters = actual.filter_paths;
    filters.sort();
    let mut expected: Vec<&str> = spec.filter_paths.to_vec();
    expected.sort_unstable();
    if filters != expected {
        problems.push(format!(
            "filter paths are {filters:?}, expected {expected:?}"
        ));
    }

    problems
}

/// Differences between the listed regular indexes and a TTL specification.
pub fn check_ttl_index(spec: &TtlIndexSpec, indexes: &[Document]) -> Vec<String> {
    let name = spec.index_name();
    let on_field = |index: &&Document| {
        index
            .get_document("key")
            .is_ok_and(|key| key.len() == 1 && key.contains_key(spec.field))
    };

    let Some(index) = indexes
        .iter()
        .find(|index| index.get_str("name").ok() == Some(name.as_str()))
        .or_else(|| indexes.iter().find(on_field))
    else {
        return vec!["missing".to_string()];
    };

    let mut problems = Vec::new();
    let direction = index
        .get_document("key")
        .ok()
        .and_then(|key| key.get(spec.field))
        .and_then(bson_as_i64);
    if direction != Some(1) {
        problems.push(format!(
            "key is {:?}, expected {{ {}: 1 }}",
            index.get_document("key").ok(),
            spec.field
        ));
    }

    let expire_after = index.get("expireAfterSeconds").and_then(bson_as_i64);
    if expire_after != Some(spec.expire_after_secs()) {
        problems.push(format!(
            "expireAfterSeconds is {:?}, expected {}",
            expire_after,
            spec.expire_after_secs()
        ));
    }

    problems
}
