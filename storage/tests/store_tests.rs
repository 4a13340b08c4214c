use std::sync::Arc;

use serde_json::json;
use storage::{DiffConfig, DiffEngine, DirectoryStore, Row};

fn sp(id: &str, app_id: &str, display_name: &str, key_creds: serde_json::Value) -> Row {
    Row::from_object(json!({
        "id": id,
        "appId": app_id,
        "displayName": display_name,
        "keyCredentials": key_creds,
        "passwordCredentials": []
    }))
}

async fn seeded_store(path: &std::path::Path) -> DirectoryStore {
    let store = DirectoryStore::open(path, None)
        .await
        .expect("Failed to open store");

    store
        .store_table(
            "service_principals",
            vec![
                sp("sp-1", "app-guid-1", "Primary SP", json!([{"keyId": "k1"}])),
                sp("sp-2", "resource-app-guid", "Resource SP", json!([])),
            ],
            false
        )
        .await
        .expect("Failed to store service_principals");

    store
        .store_table(
            "app_roles",
            vec![Row::from_object(json!({
                "id": "role-1",
                "value": "Data.Read",
                "description": "Read data",
                "service_principal_id": "sp-2"
            }))],
            false
        )
        .await
        .expect("Failed to store app_roles");

    store
        .store_table(
            "app_role_assigned_to",
            vec![Row::from_object(json!({
                "id": "ra-1",
                "principalId": "sp-1",
                "resourceId": "sp-2",
                "appRoleId": "ROLE-1"
            }))],
            false
        )
        .await
        .expect("Failed to store app_role_assigned_to");

    store
        .store_table(
            "app_role_assignments",
            vec![Row::from_object(json!({
                "id": "ra-2",
                "resourceId": "sp-1",
                "appRoleId": "role-x",
                "principalDisplayName": "Another Caller"
            }))],
            false
        )
        .await
        .expect("Failed to store app_role_assignments");

    store
        .store_table(
            "sp_oauth_grants",
            vec![Row::from_object(json!({
                "id": "g-1",
                "service_principal_id": "sp-1",
                "resourceId": "SP-2",
                "scope": "User.Read"
            }))],
            false
        )
        .await
        .expect("Failed to store sp_oauth_grants");

    store
        .store_table(
            "sp_member_of",
            vec![Row::from_object(json!({
                "id": "m-1",
                "service_principal_id": "sp-1",
                "displayName": "Directory Readers"
            }))],
            false
        )
        .await
        .expect("Failed to store sp_member_of");

    store
        .store_table(
            "applications",
            vec![Row::from_object(json!({
                "id": "appobj-1",
                "appId": "APP-GUID-1",
                "displayName": "App Reg",
                "requiredResourceAccess": [{
                    "resourceAppId": "RESOURCE-APP-GUID",
                    "resourceAccess": [{"id": "ROLE-1", "type": "Role"}]
                }]
            }))],
            false
        )
        .await
        .expect("Failed to store applications");

    store
}

#[tokio::test]
async fn test_store_and_query_round_trip() {
    let dir = tempfile::tempdir().expect("Failed to create tempdir");
    let store = DirectoryStore::open(dir.path().join("graph_data.db"), None)
        .await
        .expect("Failed to open store");

    let rows = vec![
        sp("sp-1", "a1", "One", json!([])),
        sp("sp-2", "a2", "Two", json!([])),
    ];
    store
        .store_table("service_principals", rows, false)
        .await
        .expect("Failed to store table");

    assert!(store.has_table("service_principals"));
    let fetched = store
        .query("SELECT * FROM service_principals ORDER BY id")
        .expect("Failed to query");
    assert_eq!(fetched.len(), 2);
    assert_eq!(fetched[0].get_str("displayName"), Some("One"));
}

#[tokio::test]
async fn test_query_missing_table_degrades_to_empty() {
    let dir = tempfile::tempdir().expect("Failed to create tempdir");
    let store = DirectoryStore::open(dir.path().join("graph_data.db"), None)
        .await
        .expect("Failed to open store");

    let rows = store
        .query("SELECT * FROM service_principals")
        .expect("Query should degrade, not fail");
    assert!(rows.is_empty());
}

#[tokio::test]
async fn test_empty_row_set_keeps_previous_snapshot() {
    let dir = tempfile::tempdir().expect("Failed to create tempdir");
    let store = DirectoryStore::open(dir.path().join("graph_data.db"), None)
        .await
        .expect("Failed to open store");

    store
        .store_table(
            "service_principals",
            vec![sp("sp-1", "a1", "One", json!([]))],
            false
        )
        .await
        .expect("Failed to store table");

    store
        .store_table("service_principals", vec![], false)
        .await
        .expect("Empty replacement should be a no-op");

    assert_eq!(
        store.row_count("service_principals").expect("count"),
        1,
        "previous snapshot must survive an empty replacement"
    );
}

#[tokio::test]
async fn test_atomic_replace_never_exposes_partial_counts() {
    let dir = tempfile::tempdir().expect("Failed to create tempdir");
    let store = Arc::new(
        DirectoryStore::open(dir.path().join("graph_data.db"), None)
            .await
            .expect("Failed to open store")
    );

    let small: Vec<Row> = (0..3)
        .map(|i| sp(&format!("s{i}"), "a", "n", json!([])))
        .collect();
    let large: Vec<Row> = (0..7)
        .map(|i| sp(&format!("l{i}"), "a", "n", json!([])))
        .collect();

    store
        .store_table("service_principals", small.clone(), false)
        .await
        .expect("Failed to store table");

    let reader = {
        let store = store.clone();
        tokio::spawn(async move {
            for _ in 0..200 {
                let count = store.row_count("service_principals").expect("count");
                assert!(
                    count == 3 || count == 7,
                    "observed intermediate row count {count}"
                );
                tokio::task::yield_now().await;
            }
        })
    };

    for _ in 0..10 {
        store
            .store_table("service_principals", large.clone(), false)
            .await
            .expect("Failed to store table");
        store
            .store_table("service_principals", small.clone(), false)
            .await
            .expect("Failed to store table");
    }

    reader.await.expect("reader task panicked");
}

#[tokio::test]
async fn test_duckdb_persistence_round_trip() {
    let dir = tempfile::tempdir().expect("Failed to create tempdir");
    let path = dir.path().join("graph_data.db");

    {
        let store = DirectoryStore::open(&path, None)
            .await
            .expect("Failed to open store");
        store
            .store_table(
                "service_principals",
                vec![sp("sp-1", "a1", "Persisted", json!([{"keyId": "k1"}]))],
                true
            )
            .await
            .expect("Failed to store table");
    }

    let reopened = DirectoryStore::open(&path, None)
        .await
        .expect("Failed to reopen store");
    assert!(reopened.has_table("service_principals"));
    let rows = reopened
        .query("SELECT * FROM service_principals")
        .expect("Failed to query");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get_str("displayName"), Some("Persisted"));
    assert_eq!(rows[0].get_str("keyCredentials"), Some(r#"[{"keyId":"k1"}]"#));
}

#[tokio::test]
async fn test_sqlite_mirror_bootstraps_store() {
    let dir = tempfile::tempdir().expect("Failed to create tempdir");
    let path = dir.path().join("graph_data.db");

    {
        let store = DirectoryStore::open(&path, None)
            .await
            .expect("Failed to open store");
        store
            .store_table(
                "service_principals",
                vec![sp("sp-1", "a1", "Mirrored", json!([]))],
                true
            )
            .await
            .expect("Failed to store table");
    }

    let mirror = dir.path().join("graph_data.db.sqlite");
    assert!(mirror.exists(), "sqlite mirror file should exist");

    let from_mirror = DirectoryStore::open(&mirror, None)
        .await
        .expect("Failed to open store from sqlite mirror");
    assert!(from_mirror.has_table("service_principals"));
    let rows = from_mirror
        .query("SELECT * FROM service_principals")
        .expect("Failed to query");
    assert_eq!(rows[0].get_str("displayName"), Some("Mirrored"));
}

#[tokio::test]
async fn test_unrecognized_signature_is_fatal() {
    let dir = tempfile::tempdir().expect("Failed to create tempdir");
    let path = dir.path().join("bogus.db");
    std::fs::write(&path, b"definitely not a database file").expect("write");

    let result = DirectoryStore::open(&path, None).await;
    assert!(matches!(
        result,
        Err(storage::StoreError::UnknownFormat { .. })
    ));
}

#[tokio::test]
async fn test_missing_store_file_starts_empty() {
    let dir = tempfile::tempdir().expect("Failed to create tempdir");
    let store = DirectoryStore::open(dir.path().join("absent.db"), None)
        .await
        .expect("Missing file must not be an error");
    assert!(!store.has_table("service_principals"));
    assert!(!store.fresh(7));
}

#[tokio::test]
async fn test_fresh_after_persist() {
    let dir = tempfile::tempdir().expect("Failed to create tempdir");
    let store = DirectoryStore::open(dir.path().join("graph_data.db"), None)
        .await
        .expect("Failed to open store");
    store
        .store_table(
            "service_principals",
            vec![sp("sp-1", "a1", "One", json!([]))],
            true
        )
        .await
        .expect("Failed to store table");

    assert!(store.fresh(7));
    assert!(!store.fresh(0));
}

#[tokio::test]
async fn test_get_by_id_enrichment() {
    let dir = tempfile::tempdir().expect("Failed to create tempdir");
    let store = seeded_store(&dir.path().join("graph_data.db")).await;

    let enriched = store
        .get_by_id(&["sp-1".to_string()])
        .expect("Failed to run enrichment lookup");
    assert_eq!(enriched.len(), 1);
    let sp = &enriched[0];

    assert_eq!(sp["displayName"], json!("Primary SP"));
    assert_eq!(sp["appRoleImports"][0]["scope"], json!("Data.Read"));
    assert_eq!(sp["appRoleExports"][0]["scope"], json!("No matching role"));
    assert_eq!(
        sp["oauth2PermissionGrants"][0]["resourceDisplayName"],
        json!("Resource SP")
    );
    assert_eq!(sp["member_of"][0]["displayName"], json!("Directory Readers"));

    let app = &sp["application"];
    assert_eq!(app["displayName"], json!("App Reg"));
    assert_eq!(app["service_principal_id"], json!("sp-1"));
    let rra = &app["requiredResourceAccess"][0];
    assert_eq!(rra["resourceDisplayName"], json!("Resource SP"));
    assert_eq!(rra["resourceAccess"][0]["scope"], json!("Data.Read"));
    assert_eq!(rra["resourceAccess"][0]["description"], json!("Read data"));
}

#[tokio::test]
async fn test_get_by_id_requires_dependent_tables() {
    let dir = tempfile::tempdir().expect("Failed to create tempdir");
    let store = DirectoryStore::open(dir.path().join("graph_data.db"), None)
        .await
        .expect("Failed to open store");

    let result = store.get_by_id(&["sp-1".to_string()]);
    assert!(matches!(
        result,
        Err(storage::StoreError::MissingTable { .. })
    ));
}

#[tokio::test]
async fn test_get_by_id_unknown_id_yields_empty() {
    let dir = tempfile::tempdir().expect("Failed to create tempdir");
    let store = seeded_store(&dir.path().join("graph_data.db")).await;

    let enriched = store
        .get_by_id(&["nope".to_string()])
        .expect("Unknown ids are not an error");
    assert!(enriched.is_empty());
}

#[tokio::test]
async fn test_diff_runs_before_replacement() {
    let dir = tempfile::tempdir().expect("Failed to create tempdir");
    let diff = DiffEngine::new(
        DiffConfig::new().watch("service_principals", ["keyCredentials", "passwordCredentials"])
    );
    let store = DirectoryStore::open(dir.path().join("graph_data.db"), Some(diff))
        .await
        .expect("Failed to open store");

    store
        .store_table(
            "service_principals",
            vec![sp("sp-1", "a1", "One", json!([{"keyId": "old"}]))],
            false
        )
        .await
        .expect("Failed to store table");

    store
        .store_table(
            "service_principals",
            vec![
                sp("sp-1", "a1", "One", json!([{"keyId": "rotated"}])),
                sp("sp-2", "a2", "Two", json!([{"keyId": "fresh"}])),
            ],
            false
        )
        .await
        .expect("Failed to store table");

    let result = store
        .diff()
        .expect("diff engine configured")
        .result("service_principals")
        .expect("comparison ran");
    assert_eq!(result.modified.len(), 1);
    assert_eq!(result.modified[0].id(), Some("sp-1"));
    assert_eq!(result.new.len(), 1);
    assert_eq!(result.new[0].id(), Some("sp-2"));
    assert!(result.deleted.is_empty());
}
