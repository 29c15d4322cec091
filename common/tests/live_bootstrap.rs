//! Bootstrap against a live deployment. Vector search needs `mongot`, so point
//! `MONGO_TEST_URI` at a MongoDB Atlas Local container, e.g.
//! `docker run -p 27017:27017 mongodb/mongodb-atlas-local` with
//! `MONGO_TEST_URI=mongodb://localhost:27017/?directConnection=true`.
//! Skipped when the variable is unset.

use std::{collections::BTreeSet, panic::AssertUnwindSafe, time::Duration};

use common::{
    storage::{
        bootstrap::{run_bootstrap, BootstrapOptions, Milestone, StepOutcome},
        db::{AdminOps, MongoDbClient},
        verify::verify_target_state,
    },
    utils::config::AppConfig,
};
use futures::FutureExt;
use uuid::Uuid;

async fn live_client() -> Option<MongoDbClient> {
    let Ok(uri) = std::env::var("MONGO_TEST_URI") else {
        eprintln!("MONGO_TEST_URI not set; skipping live bootstrap test");
        return None;
    };

    let database = format!("agentic_os_test_{}", Uuid::new_v4().simple());
    let config: AppConfig = config::Config::builder()
        .set_override("mongo_uri", uri)
        .expect("uri override")
        .set_override("mongo_db_name", database)
        .expect("database override")
        .build()
        .expect("build config")
        .try_deserialize()
        .expect("deserialize config");

    Some(
        MongoDbClient::new(&config)
            .await
            .expect("Failed to configure MongoDB client"),
    )
}

#[tokio::test]
async fn bootstrap_twice_then_verify() {
    let Some(db) = live_client().await else {
        return;
    };

    // Drop the scratch database whether or not the assertions hold.
    let outcome = AssertUnwindSafe(bootstrap_twice_then_verify_on(&db))
        .catch_unwind()
        .await;
    db.database.drop().await.expect("drop test database");
    if let Err(panic) = outcome {
        std::panic::resume_unwind(panic);
    }
}

async fn bootstrap_twice_then_verify_on(db: &MongoDbClient) {
    let first = run_bootstrap(db, &BootstrapOptions::default())
        .await
        .expect("first bootstrap");
    assert_eq!(
        first.outcome_of(&Milestone::Collection("knowledge_base")),
        Some(StepOutcome::Applied)
    );

    let options = BootstrapOptions {
        wait_for_indexes: true,
        index_poll_interval: Duration::from_secs(1),
        index_wait_timeout: Duration::from_secs(180),
        ..BootstrapOptions::default()
    };
    let second = run_bootstrap(db, &options)
        .await
        .expect("second bootstrap is a no-op");
    for milestone in [
        Milestone::ReplicaSet,
        Milestone::Collection("knowledge_base"),
        Milestone::Collection("semantic_cache"),
        Milestone::SearchIndex {
            collection: "knowledge_base",
            index: "vector_index",
        },
        Milestone::TtlIndex {
            collection: "semantic_cache",
            index: "created_at_1".to_string(),
        },
    ] {
        assert_eq!(
            second.outcome_of(&milestone),
            Some(StepOutcome::AlreadyPresent),
            "{milestone}"
        );
    }

    let collections: BTreeSet<String> = db
        .list_collection_names()
        .await
        .expect("list collections")
        .into_iter()
        .filter(|name| !name.starts_with("system."))
        .collect();
    assert_eq!(
        collections,
        BTreeSet::from(["knowledge_base".to_string(), "semantic_cache".to_string()])
    );

    let report = verify_target_state(db).await.expect("verify");
    assert!(report.is_ok(), "{report}");
    let cache_indexes: BTreeSet<&str> = report.indexes["semantic_cache"]
        .iter()
        .map(String::as_str)
        .collect();
    assert_eq!(
        cache_indexes,
        BTreeSet::from(["_id_", "cache_vector_index", "created_at_1"])
    );
}
