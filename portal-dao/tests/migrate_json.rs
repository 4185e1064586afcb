//! Document store to document store migrations.

use portal_core::{DaoOptions, OwnerRole, PortalDao};
use portal_dao::{MigrationConfig, MigrationError, Migrator, Severity};
use portal_json::{JsonDao, JsonStoreConfig};
use portal_test_utils::{fixtures, TempStoreDir};
use serde_json::{json, Value as JsonValue};

fn json_side(dir: &TempStoreDir) -> JsonValue {
    json!({ "type": "json", "config": { "basePath": dir.base_path() } })
}

fn migration_config(source: &TempStoreDir, target: &TempStoreDir, mappings: JsonValue) -> MigrationConfig {
    MigrationConfig::from_value(json!({
        "wipeTarget": true,
        "source": json_side(source),
        "target": json_side(target),
        "customIdMappings": mappings
    }))
    .unwrap()
}

async fn open(dir: &TempStoreDir) -> JsonDao {
    JsonDao::open(&JsonStoreConfig::new(dir.base_path()), DaoOptions::default())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_migration_skips_case_duplicate_applications() {
    let source_dir = TempStoreDir::new();
    let target_dir = TempStoreDir::new();
    {
        let source = open(&source_dir).await;
        for (id, email) in [("u1", "alice@example.test"), ("u2", "bob@example.test")] {
            source.users().create(fixtures::user(id, email)).await.unwrap();
        }
        source
            .registrations()
            .upsert("wicked", "u1", None, fixtures::registration("wicked", "u1", "Alice"))
            .await
            .unwrap();

        for id in ["Shop", "shop", "Other"] {
            source
                .applications()
                .create(fixtures::application(id), Some("u1"))
                .await
                .unwrap();
        }
        source
            .applications()
            .add_owner("Other", "u2", OwnerRole::Collaborator, Some("u1"))
            .await
            .unwrap();

        for (sub_id, app_id) in [("s1", "Shop"), ("s2", "shop"), ("s3", "Other")] {
            source
                .subscriptions()
                .create(fixtures::subscription(sub_id, app_id, "petstore"), None)
                .await
                .unwrap();
        }
        source
            .approvals()
            .create(fixtures::approval("a1", "s1", "Shop", "petstore"))
            .await
            .unwrap();
        source
            .approvals()
            .create(fixtures::approval("a3", "s3", "Other", "petstore"))
            .await
            .unwrap();
    }

    let mut migrator = Migrator::new(migration_config(&source_dir, &target_dir, json!(null)));
    let summary = migrator.migrate().await.unwrap();
    assert!(!migrator.is_legacy_migration());

    assert_eq!(summary.users, 2);
    assert_eq!(summary.registrations, 1);
    assert_eq!(summary.applications, 1);
    assert_eq!(summary.skipped_applications, 2);
    assert_eq!(summary.subscriptions, 1);
    assert_eq!(summary.skipped_subscriptions, 2);
    assert_eq!(summary.approvals, 1);
    assert_eq!(summary.skipped_approvals, 1);

    let app_warnings: Vec<_> = migrator
        .warnings()
        .iter()
        .filter(|w| w.message.starts_with("APPLICATION:"))
        .collect();
    assert_eq!(app_warnings.len(), 1);
    assert_eq!(app_warnings[0].severity, Severity::Warning);

    let target = open(&target_dir).await;
    assert!(target.applications().get_by_id("Shop").await.unwrap().is_none());
    assert!(target.applications().get_by_id("shop").await.unwrap().is_none());

    let other = target.applications().get_by_id("other").await.unwrap().unwrap();
    let mut owners: Vec<_> = other.owners.iter().map(|o| (o.user_id.as_str(), o.role)).collect();
    owners.sort_by(|a, b| a.0.cmp(b.0));
    assert_eq!(owners, vec![("u1", OwnerRole::Owner), ("u2", OwnerRole::Collaborator)]);

    let subs = target.subscriptions().get_by_app_id("other").await.unwrap();
    assert_eq!(subs.len(), 1);
    assert_eq!(subs[0].application, "other");

    let approvals = target.approvals().get_all().await.unwrap();
    assert_eq!(approvals.len(), 1);
    assert_eq!(approvals[0].application.id, "other");

    let alice = target.users().get_by_id("u1").await.unwrap().unwrap();
    assert_eq!(alice.applications.len(), 1);
    assert_eq!(alice.applications[0].id, "other");

    let regs = target.registrations().get_by_user("u1").await.unwrap();
    assert_eq!(regs.pools["wicked"][0].name, "Alice");
}

#[tokio::test]
async fn test_migration_leaves_source_untouched() {
    let source_dir = TempStoreDir::new();
    let target_dir = TempStoreDir::new();
    {
        let source = open(&source_dir).await;
        source.users().create(fixtures::user("u1", "alice@example.test")).await.unwrap();
    }
    let before = source_dir.read_json("users/u1.json");

    let mut migrator = Migrator::new(migration_config(&source_dir, &target_dir, json!(null)));
    migrator.migrate().await.unwrap();

    assert_eq!(source_dir.read_json("users/u1.json"), before);
    let target = open(&target_dir).await;
    assert_eq!(target.users().get_count().await.unwrap(), 1);
}

fn seed_legacy_users(dir: &TempStoreDir) {
    dir.seed_json(
        "users/_index.json",
        &json!([
            { "id": "u1", "email": "jane@example.test", "customId": "Google:123" },
            { "id": "u2", "email": "joe@example.test", "customId": "123" },
            { "id": "u3", "email": "admin@example.test" }
        ]),
    );
    dir.seed_json(
        "users/u1.json",
        &json!({
            "id": "u1", "email": "jane@example.test", "customId": "Google:123",
            "firstName": "Jane", "lastName": "Doe", "validated": true, "groups": []
        }),
    );
    dir.seed_json(
        "users/u2.json",
        &json!({ "id": "u2", "email": "joe@example.test", "customId": "123", "groups": [] }),
    );
    dir.seed_json(
        "users/u3.json",
        &json!({ "id": "u3", "email": "admin@example.test", "groups": ["admin"] }),
    );
}

#[tokio::test]
async fn test_legacy_migration_maps_custom_ids() {
    let source_dir = TempStoreDir::new();
    let target_dir = TempStoreDir::new();
    seed_legacy_users(&source_dir);

    let mappings = json!({ "defaultPrefix": "legacy", "prefixes": { "Google": "google" } });
    let mut migrator = Migrator::new(migration_config(&source_dir, &target_dir, mappings));
    let summary = migrator.migrate().await.unwrap();
    assert!(migrator.is_legacy_migration());
    assert_eq!(summary.users, 3);

    let target = open(&target_dir).await;
    let jane = target.users().get_by_id("u1").await.unwrap().unwrap();
    assert_eq!(jane.custom_id.as_deref(), Some("google:123"));
    let joe = target.users().get_by_id("u2").await.unwrap().unwrap();
    assert_eq!(joe.custom_id.as_deref(), Some("legacy:123"));
    let admin = target.users().get_by_id("u3").await.unwrap().unwrap();
    assert_eq!(admin.custom_id, None);

    let regs = target.registrations().get_by_user("u1").await.unwrap();
    assert_eq!(regs.pools["wicked"][0].name, "Jane Doe");
    let regs = target.registrations().get_by_user("u3").await.unwrap();
    assert_eq!(regs.pools["wicked"][0].name, "Unknown User");

    // The source was copied, not upgraded in place.
    assert!(!source_dir.exists("meta.json"));
}

#[tokio::test]
async fn test_legacy_migration_without_mappings_fails_validation() {
    let source_dir = TempStoreDir::new();
    let target_dir = TempStoreDir::new();
    seed_legacy_users(&source_dir);

    let mut migrator = Migrator::new(migration_config(&source_dir, &target_dir, json!(null)));
    let err = migrator.migrate().await.unwrap_err();
    assert!(matches!(err, MigrationError::Validation(_)));

    let errors: Vec<_> = migrator
        .warnings()
        .iter()
        .filter(|w| w.severity == Severity::Error)
        .collect();
    assert_eq!(errors.len(), 2);
    assert!(errors.iter().all(|w| w.payload.is_some()));

    let target = open(&target_dir).await;
    assert_eq!(target.users().get_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_legacy_migration_reports_each_unmapped_prefix() {
    let source_dir = TempStoreDir::new();
    let target_dir = TempStoreDir::new();
    seed_legacy_users(&source_dir);

    let mappings = json!({ "defaultPrefix": "legacy", "prefixes": { "Github": "github" } });
    let mut migrator = Migrator::new(migration_config(&source_dir, &target_dir, mappings));
    assert!(migrator.migrate().await.is_err());

    let messages: Vec<_> = migrator.warnings().iter().map(|w| w.message.as_str()).collect();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].contains("prefix Google"));
}

#[tokio::test]
async fn test_missing_source_directory_is_config_error() {
    let source_dir = TempStoreDir::new();
    let target_dir = TempStoreDir::new();
    let mut migrator = Migrator::new(migration_config(&source_dir, &target_dir, json!(null)));
    let err = migrator.migrate().await.unwrap_err();
    assert!(matches!(err, MigrationError::Config(_)));
}
