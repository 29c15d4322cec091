use std::time::{Duration, Instant};

use mongodb::bson::{doc, Bson, Document};
use tracing::{info, warn};

use super::db::AdminOps;
use crate::error::AppError;

/// Dimensionality of every embedding written into the vector-indexed fields.
pub const EMBEDDING_DIMENSIONS: u32 = 1536;
/// Expiry window of the semantic cache (30 days).
pub const CACHE_TTL: Duration = Duration::from_secs(2_592_000);

pub const KNOWLEDGE_BASE: &str = "knowledge_base";
pub const SEMANTIC_CACHE: &str = "semantic_cache";

const VECTOR_SEARCH_TYPE: &str = "vectorSearch";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Similarity {
    Cosine,
}

impl Similarity {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cosine => "cosine",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchIndexSpec {
    pub index_name: &'static str,
    pub collection: &'static str,
    pub vector_path: &'static str,
    pub dimensions: u32,
    pub similarity: Similarity,
    pub filter_paths: &'static [&'static str],
}

impl SearchIndexSpec {
    /// The `definition` body of the vector search index.
    pub fn definition(&self) -> Document {
        let mut fields = vec![Bson::Document(doc! {
            "type": "vector",
            "path": self.vector_path,
            "numDimensions": i64::from(self.dimensions),
            "similarity": self.similarity.as_str(),
        })];
        fields.extend(
            self.filter_paths
                .iter()
                .map(|path| Bson::Document(doc! { "type": "filter", "path": *path })),
        );

        doc! { "fields": fields }
    }

    pub fn create_command(&self) -> Document {
        doc! {
            "createSearchIndexes": self.collection,
            "indexes": [{
                "name": self.index_name,
                "type": VECTOR_SEARCH_TYPE,
                "definition": self.definition(),
            }],
        }
    }
}

/// Ascending single-field index whose documents expire `expire_after` past the field's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlIndexSpec {
    pub collection: &'static str,
    pub field: &'static str,
    pub expire_after: Duration,
}

impl TtlIndexSpec {
    /// Server-default name for an ascending single-field index.
    pub fn index_name(&self) -> String {
        format!("{}_1", self.field)
    }

    pub fn expire_after_secs(&self) -> i64 {
        i64::try_from(self.expire_after.as_secs()).unwrap_or(i64::MAX)
    }

    pub fn create_command(&self) -> Document {
        doc! {
            "createIndexes": self.collection,
            "indexes": [{
                "key": { self.field: 1 },
                "name": self.index_name(),
                "expireAfterSeconds": self.expire_after_secs(),
            }],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectionSpec {
    pub name: &'static str,
    pub search_indexes: &'static [SearchIndexSpec],
    pub ttl_indexes: &'static [TtlIndexSpec],
}

/// Target collections in creation order, each with the indexes defined on it.
pub const TARGET_COLLECTIONS: &[CollectionSpec] = &[
    CollectionSpec {
        name: KNOWLEDGE_BASE,
        search_indexes: &[SearchIndexSpec {
            index_name: "vector_index",
            collection: KNOWLEDGE_BASE,
            vector_path: "embedding",
            dimensions: EMBEDDING_DIMENSIONS,
            similarity: Similarity::Cosine,
            filter_paths: &["metadata.source"],
        }],
        ttl_indexes: &[],
    },
    CollectionSpec {
        name: SEMANTIC_CACHE,
        search_indexes: &[SearchIndexSpec {
            index_name: "cache_vector_index",
            collection: SEMANTIC_CACHE,
            vector_path: "query_embedding",
            dimensions: EMBEDDING_DIMENSIONS,
            similarity: Similarity::Cosine,
            filter_paths: &[],
        }],
        ttl_indexes: &[TtlIndexSpec {
            collection: SEMANTIC_CACHE,
            field: "created_at",
            expire_after: CACHE_TTL,
        }],
    },
];

pub fn search_index_specs() -> impl Iterator<Item = &'static SearchIndexSpec> {
    TARGET_COLLECTIONS
        .iter()
        .flat_map(|collection| collection.search_indexes.iter())
}

/// One entry of `$listSearchIndexes`.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchIndexSnapshot {
    pub name: String,
    pub index_type: Option<String>,
    pub status: String,
    pub queryable: bool,
    pub definition: Option<Document>,
}

impl SearchIndexSnapshot {
    pub fn is_ready(&self) -> bool {
        self.queryable || self.status.eq_ignore_ascii_case("ready")
    }

    pub fn has_failed(&self) -> bool {
        self.status.eq_ignore_ascii_case("failed")
    }
}

pub fn parse_search_index(entry: &Document) -> Option<SearchIndexSnapshot> {
    let name = entry.get_str("name").ok()?.to_string();

    Some(SearchIndexSnapshot {
        name,
        index_type: entry.get_str("type").ok().map(str::to_string),
        // A missing status means the build has not been reported yet.
        status: entry.get_str("status").unwrap_or("PENDING").to_string(),
        queryable: entry.get_bool("queryable").unwrap_or(false),
        definition: entry
            .get_document("latestDefinition")
            .or_else(|_| entry.get_document("definition"))
            .ok()
            .cloned(),
    })
}

/// The parts of a vector search definition the bootstrap cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VectorDefinition {
    pub vector_path: Option<String>,
    pub dimensions: Option<i64>,
    pub similarity: Option<String>,
    pub filter_paths: Vec<String>,
}

impl VectorDefinition {
    pub fn from_definition(definition: &Document) -> Self {
        let mut parsed = Self::default();
        let Ok(fields) = definition.get_array("fields") else {
            return parsed;
        };

        for field in fields.iter().filter_map(Bson::as_document) {
            let path = field.get_str("path").ok().map(str::to_string);
            match field.get_str("type") {
                Ok("vector") => {
                    parsed.vector_path = path;
                    parsed.dimensions = field.get("numDimensions").and_then(bson_as_i64);
                    parsed.similarity = field.get_str("similarity").ok().map(str::to_string);
                }
                Ok("filter") => parsed.filter_paths.extend(path),
                _ => {}
            }
        }

        parsed
    }
}

/// Integral value of a numeric BSON field, whichever width the server chose.
pub fn bson_as_i64(value: &Bson) -> Option<i64> {
    match value {
        Bson::Int32(v) => Some(i64::from(*v)),
        Bson::Int64(v) => Some(*v),
        #[allow(clippy::cast_possible_truncation)]
        Bson::Double(v) if v.fract() == 0.0 => Some(*v as i64),
        _ => None,
    }
}

/// Poll `$listSearchIndexes` until every given index is queryable.
///
/// Fails when an index reports `FAILED` or when `timeout` elapses across all indexes.
pub async fn wait_for_search_indexes<A>(
    ops: &A,
    specs: &[SearchIndexSpec],
    poll_every: Duration,
    timeout: Duration,
) -> Result<(), AppError>
where
    A: AdminOps + ?Sized,
{
    let waiting_since = Instant::now();

    for spec in specs {
        poll_search_index_status(ops, spec, poll_every, waiting_since, timeout).await?;
    }

    Ok(())
}

async fn poll_search_index_status<A>(
    ops: &A,
    spec: &SearchIndexSpec,
    poll_every: Duration,
    waiting_since: Instant,
    timeout: Duration,
) -> Result<(), AppError>
where
    A: AdminOps + ?Sized,
{
    let started_at = Instant::now();

    loop {
        let snapshot = ops
            .list_search_indexes(spec.collection)
            .await?
            .iter()
            .filter_map(parse_search_index)
            .find(|snapshot| snapshot.name == spec.index_name);

        match snapshot {
            Some(snapshot) if snapshot.is_ready() => {
                info!(
                    index = %spec.index_name,
                    collection = %spec.collection,
                    elapsed = ?started_at.elapsed(),
                    "Search index is queryable"
                );
                return Ok(());
            }
            Some(snapshot) if snapshot.has_failed() => {
                return Err(AppError::IndexBuild(format!(
                    "{} on {} reported status {}",
                    spec.index_name, spec.collection, snapshot.status
                )));
            }
            Some(snapshot) => info!(
                index = %spec.index_name,
                collection = %spec.collection,
                status = %snapshot.status,
                "Search index build status"
            ),
            None => warn!(
                index = %spec.index_name,
                collection = %spec.collection,
                "Search index not listed yet"
            ),
        }

        // Elapsed-based so an unbounded timeout never overflows `Instant`.
        if waiting_since.elapsed() >= timeout {
            return Err(AppError::Timeout(format!(
                "search index {} on {} not queryable before deadline",
                spec.index_name, spec.collection
            )));
        }

        tokio::time::sleep(poll_every).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::db::MockAdminOps;

    fn knowledge_base_index() -> &'static SearchIndexSpec {
        &TARGET_COLLECTIONS[0].search_indexes[0]
    }

    fn cache_index() -> &'static SearchIndexSpec {
        &TARGET_COLLECTIONS[1].search_indexes[0]
    }

    #[test]
    fn target_collections_are_ordered() {
        let names: Vec<_> = TARGET_COLLECTIONS.iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["knowledge_base", "semantic_cache"]);
        assert!(TARGET_COLLECTIONS[0].ttl_indexes.is_empty());
        assert_eq!(TARGET_COLLECTIONS[1].ttl_indexes.len(), 1);
        assert_eq!(search_index_specs().count(), 2);
    }

    #[test]
    fn knowledge_base_command_matches_wire_format() {
        let expected = doc! {
            "createSearchIndexes": "knowledge_base",
            "indexes": [{
                "name": "vector_index",
                "type": "vectorSearch",
                "definition": {
                    "fields": [
                        {
                            "type": "vector",
                            "path": "embedding",
                            "numDimensions": 1536_i64,
                            "similarity": "cosine",
                        },
                        { "type": "filter", "path": "metadata.source" },
                    ],
                },
            }],
        };

        assert_eq!(knowledge_base_index().create_command(), expected);
    }

    #[test]
    fn cache_definition_has_no_filters() {
        let expected = doc! {
            "fields": [{
                "type": "vector",
                "path": "query_embedding",
                "numDimensions": 1536_i64,
                "similarity": "cosine",
            }],
        };

        assert_eq!(cache_index().definition(), expected);
    }

    #[test]
    fn ttl_command_expires_after_thirty_days() {
        let ttl = &TARGET_COLLECTIONS[1].ttl_indexes[0];
        assert_eq!(ttl.index_name(), "created_at_1");
        assert_eq!(
            ttl.create_command(),
            doc! {
                "createIndexes": "semantic_cache",
                "indexes": [{
                    "key": { "created_at": 1 },
                    "name": "created_at_1",
                    "expireAfterSeconds": 2_592_000_i64,
                }],
            }
        );
    }

    #[test]
    fn parse_search_index_reads_listing_entry() {
        let entry = doc! {
            "id": "6650f0c1d2",
            "name": "cache_vector_index",
            "type": "vectorSearch",
            "status": "BUILDING",
            "queryable": false,
            "latestDefinition": cache_index().definition(),
        };

        let snapshot = parse_search_index(&entry).expect("snapshot");
        assert_eq!(snapshot.name, "cache_vector_index");
        assert_eq!(snapshot.index_type.as_deref(), Some("vectorSearch"));
        assert!(!snapshot.is_ready());
        assert!(!snapshot.has_failed());
        assert_eq!(snapshot.definition, Some(cache_index().definition()));
    }

    #[test]
    fn parse_search_index_defaults_to_pending() {
        let snapshot = parse_search_index(&doc! { "name": "vector_index" }).expect("snapshot");
        assert_eq!(snapshot.status, "PENDING");
        assert!(!snapshot.is_ready());
        assert!(parse_search_index(&doc! { "status": "READY" }).is_none());
    }

    #[test]
    fn vector_definition_extracts_contract() {
        let parsed = VectorDefinition::from_definition(&knowledge_base_index().definition());
        assert_eq!(
            parsed,
            VectorDefinition {
                vector_path: Some("embedding".into()),
                dimensions: Some(1536),
                similarity: Some("cosine".into()),
                filter_paths: vec!["metadata.source".into()],
            }
        );
    }

    #[test]
    fn bson_numbers_of_any_width() {
        assert_eq!(bson_as_i64(&Bson::Int32(1536)), Some(1536));
        assert_eq!(bson_as_i64(&Bson::Int64(2_592_000)), Some(2_592_000));
        assert_eq!(bson_as_i64(&Bson::Double(1536.0)), Some(1536));
        assert_eq!(bson_as_i64(&Bson::Double(1.5)), None);
        assert_eq!(bson_as_i64(&Bson::String("1536".into())), None);
    }

    #[tokio::test]
    async fn wait_returns_once_index_is_queryable() {
        let mut ops = MockAdminOps::new();
        let mut polls = 0;
        ops.expect_list_search_indexes()
            .withf(|collection| collection == "semantic_cache")
            .times(3)
            .returning(move |_| {
                polls += 1;
                let status = match polls {
                    1 => return Ok(Vec::new()),
                    2 => "BUILDING",
                    _ => "READY",
                };
                Ok(vec![doc! {
                    "name": "cache_vector_index",
                    "status": status,
                    "queryable": status == "READY",
                }])
            });

        wait_for_search_indexes(
            &ops,
            &[*cache_index()],
            Duration::from_millis(1),
            Duration::from_secs(5),
        )
        .await
        .expect("index becomes ready");
    }

    #[tokio::test]
    async fn wait_aborts_on_failed_build() {
        let mut ops = MockAdminOps::new();
        ops.expect_list_search_indexes().times(1).returning(|_| {
            Ok(vec![doc! { "name": "vector_index", "status": "FAILED", "queryable": false }])
        });

        let err = wait_for_search_indexes(
            &ops,
            &[*knowledge_base_index()],
            Duration::from_millis(1),
            Duration::from_secs(5),
        )
        .await
        .expect_err("failed build aborts");

        assert!(matches!(err, AppError::IndexBuild(_)));
    }

    #[tokio::test]
    async fn wait_accepts_unbounded_timeout() {
        let mut ops = MockAdminOps::new();
        let mut polls = 0;
        ops.expect_list_search_indexes().times(2).returning(move |_| {
            polls += 1;
            let ready = polls > 1;
            let status = if ready { "READY" } else { "BUILDING" };
            Ok(vec![doc! {
                "name": "vector_index",
                "status": status,
                "queryable": ready,
            }])
        });

        wait_for_search_indexes(
            &ops,
            &[*knowledge_base_index()],
            Duration::from_millis(1),
            Duration::from_secs(u64::MAX),
        )
        .await
        .expect("huge timeout waits instead of panicking");
    }

    #[tokio::test]
    async fn wait_times_out() {
        let mut ops = MockAdminOps::new();
        ops.expect_list_search_indexes().returning(|_| {
            Ok(vec![doc! { "name": "vector_index", "status": "PENDING" }])
        });

        let err = wait_for_search_indexes(
            &ops,
            &[*knowledge_base_index()],
            Duration::from_millis(1),
            Duration::from_millis(20),
        )
        .await
        .expect_err("never ready");

        assert!(matches!(err, AppError::Timeout(_)));
    }
}
