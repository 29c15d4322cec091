use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::{
    bson::{doc, Bson, Document},
    options::ClientOptions,
    Client, Database,
};
use tracing::{debug, info};

use super::indexes::{bson_as_i64, SearchIndexSpec, TtlIndexSpec};
use crate::{
    error::{codes, AppError},
    utils::config::AppConfig,
};

const PRIMARY_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Administrative operations the bootstrap issues against one deployment.
///
/// The working database is chosen when the implementor is constructed; collection and
/// index operations act on it, replica-set operations act on `admin`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AdminOps: Send + Sync {
    /// Name of the selected working database.
    fn database_name(&self) -> String;

    /// Send `replSetInitiate`; `None` lets the server derive a one-member config.
    async fn initiate_replica_set(&self, config: Option<Document>) -> Result<(), AppError>;

    /// Block until the connected node reports itself as a writable primary.
    async fn await_writable_primary(&self, timeout: Duration) -> Result<(), AppError>;

    async fn create_collection(&self, name: &str) -> Result<(), AppError>;

    async fn create_search_index(&self, spec: &SearchIndexSpec) -> Result<(), AppError>;

    /// Returns whether the index was built; `false` when an identical one already existed.
    async fn create_ttl_index(&self, spec: &TtlIndexSpec) -> Result<bool, AppError>;

    async fn list_collection_names(&self) -> Result<Vec<String>, AppError>;

    /// Raw `listIndexes` entries; empty when the collection does not exist.
    async fn list_indexes(&self, collection: &str) -> Result<Vec<Document>, AppError>;

    /// Raw `$listSearchIndexes` entries; empty when the collection does not exist.
    async fn list_search_indexes(&self, collection: &str) -> Result<Vec<Document>, AppError>;
}

#[derive(Clone)]
pub struct MongoDbClient {
    pub client: Client,
    pub database: Database,
}

impl MongoDbClient {
    /// # Initialize a new database client
    ///
    /// # Arguments
    /// * `config` - connection string, timeouts and target database
    ///
    /// # Returns
    /// * `MongoDbClient` with the working database selected
    pub async fn new(config: &AppConfig) -> Result<Self, AppError> {
        let mut options = ClientOptions::parse(&config.mongo_uri).await?;
        options.app_name = Some(config.app_name.clone());
        options.connect_timeout = Some(config.connect_timeout());
        options.server_selection_timeout = Some(config.server_selection_timeout());
        if let Some(direct) =
            resolve_direct_connection(&config.mongo_uri, config.direct_connection)
        {
            options.direct_connection = Some(direct);
        }

        let client = Client::with_options(options)?;

        // Set database
        let database = client.database(&config.mongo_db_name);

        info!(
            database = %config.mongo_db_name,
            app_name = %config.app_name,
            "MongoDB client configured"
        );

        Ok(MongoDbClient { client, database })
    }

    fn admin(&self) -> Database {
        self.client.database("admin")
    }
}

#[async_trait]
impl AdminOps for MongoDbClient {
    fn database_name(&self) -> String {
        self.database.name().to_string()
    }

    async fn initiate_replica_set(&self, config: Option<Document>) -> Result<(), AppError> {
        let config = config.map_or(Bson::Null, Bson::Document);
        self.admin()
            .run_command(doc! { "replSetInitiate": config })
            .await?;
        Ok(())
    }

    async fn await_writable_primary(&self, timeout: Duration) -> Result<(), AppError> {
        let started_at = Instant::now();

        loop {
            let reply = self.admin().run_command(doc! { "hello": 1 }).await?;
            if is_writable_primary(&reply) {
                info!(elapsed = ?started_at.elapsed(), "Node is a writable primary");
                return Ok(());
            }

            if started_at.elapsed() >= timeout {
                return Err(AppError::Timeout(format!(
                    "node did not become a writable primary within {timeout:?}"
                )));
            }

            debug!(
                set_name = reply.get_str("setName").unwrap_or("<none>"),
                "Waiting for primary election"
            );
            tokio::time::sleep(PRIMARY_POLL_INTERVAL).await;
        }
    }

    async fn create_collection(&self, name: &str) -> Result<(), AppError> {
        self.database.create_collection(name).await?;
        Ok(())
    }

    async fn create_search_index(&self, spec: &SearchIndexSpec) -> Result<(), AppError> {
        self.database.run_command(spec.create_command()).await?;
        Ok(())
    }

    async fn create_ttl_index(&self, spec: &TtlIndexSpec) -> Result<bool, AppError> {
        let reply = self.database.run_command(spec.create_command()).await?;
        Ok(index_was_created(&reply))
    }

    async fn list_collection_names(&self) -> Result<Vec<String>, AppError> {
        Ok(self.database.list_collection_names().await?)
    }

    async fn list_indexes(&self, collection: &str) -> Result<Vec<Document>, AppError> {
        let reply = match self
            .database
            .run_command(doc! { "listIndexes": collection })
            .await
            .map_err(AppError::from)
        {
            Ok(reply) => reply,
            Err(err) if err.command_code() == Some(codes::NAMESPACE_NOT_FOUND) => {
                return Ok(Vec::new())
            }
            Err(err) => return Err(err),
        };

        Ok(first_batch(&reply).with_context(|| format!("reading listIndexes for {collection}"))?)
    }

    async fn list_search_indexes(&self, collection: &str) -> Result<Vec<Document>, AppError> {
        let cursor = match self
            .database
            .collection::<Document>(collection)
            .aggregate([doc! { "$listSearchIndexes": {} }])
            .await
            .map_err(AppError::from)
        {
            Ok(cursor) => cursor,
            Err(err) if err.command_code() == Some(codes::NAMESPACE_NOT_FOUND) => {
                return Ok(Vec::new())
            }
            Err(err) => return Err(err),
        };

        let indexes: Vec<Document> = cursor.try_collect().await?;
        Ok(indexes)
    }
}

/// Whether a `hello` reply describes a node that accepts writes.
pub fn is_writable_primary(reply: &Document) -> bool {
    reply
        .get_bool("isWritablePrimary")
        .or_else(|_| reply.get_bool("ismaster"))
        .unwrap_or(false)
}

/// Whether a `createIndexes` reply built something. An identical index answers `ok` with
/// unchanged counts.
pub fn index_was_created(reply: &Document) -> bool {
    let count = |field: &str| reply.get(field).and_then(bson_as_i64);
    match (count("numIndexesBefore"), count("numIndexesAfter")) {
        (Some(before), Some(after)) => after > before,
        _ => !reply.contains_key("note"),
    }
}

/// Decide the driver's `directConnection` setting.
///
/// An explicit setting wins. Otherwise a single-host `mongodb://` URI that does not name a
/// replica set or direct mode connects directly, so a member whose replica set has not been
/// initiated yet is still selectable.
pub fn resolve_direct_connection(uri: &str, configured: Option<bool>) -> Option<bool> {
    if configured.is_some() {
        return configured;
    }

    let rest = uri.strip_prefix("mongodb://")?;
    let (authority, query) = match rest.split_once('/') {
        Some((authority, tail)) => (authority, tail.split_once('?').map(|(_, q)| q)),
        None => match rest.split_once('?') {
            Some((authority, q)) => (authority, Some(q)),
            None => (rest, None),
        },
    };
    let hosts = authority.rsplit_once('@').map_or(authority, |(_, hosts)| hosts);
    if hosts.contains(',') {
        return None;
    }

    let names_topology = query.is_some_and(|q| {
        q.split('&').any(|pair| {
            let key = pair.split('=').next().unwrap_or_default();
            key.eq_ignore_ascii_case("directConnection") || key.eq_ignore_ascii_case("replicaSet")
        })
    });

    if names_topology {
        None
    } else {
        Some(true)
    }
}

/// Documents of a command reply's `cursor.firstBatch`; index listings fit in one batch.
fn first_batch(reply: &Document) -> anyhow::Result<Vec<Document>> {
    let batch = reply
        .get_document("cursor")
        .context("reply has no cursor")?
        .get_array("firstBatch")
        .context("cursor has no firstBatch")?;

    batch
        .iter()
        .map(|entry| {
            entry
                .as_document()
                .cloned()
                .context("firstBatch entry is not a document")
        })
        .collect()
}
