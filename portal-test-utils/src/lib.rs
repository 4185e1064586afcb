//! Portal DAO Test Utilities
//!
//! Centralized test infrastructure for the portal DAO workspace:
//! - Proptest generators for entity types and list data
//! - Test fixtures for common scenarios
//! - Temporary store directories
//! - Custom assertions for the `DaoError` taxonomy

pub use portal_core::{
    ApiGrant, Application, Approval, DaoError, DaoResult, EntityRef, IdRef, ListQuery, Owner,
    OwnerRole, Page, Registration, ScopeGrant, Subscription, User, Verification, WebhookEvent,
    WebhookListener,
};

use serde_json::{json, Value as JsonValue};

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for generating portal entity types.

    use super::*;
    use proptest::prelude::*;

    /// Lower-case entity id, safe to use as a file name.
    pub fn arb_id() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9_-]{0,15}"
    }

    pub fn arb_email() -> impl Strategy<Value = String> {
        ("[a-z]{1,8}", "[a-z]{1,8}").prop_map(|(local, domain)| format!("{}@{}.test", local, domain))
    }

    /// `authMethod:rawId`, optionally without a prefix as legacy data has it.
    pub fn arb_custom_id() -> impl Strategy<Value = String> {
        prop_oneof![
            ("[a-z]{3,8}", "[0-9]{1,10}").prop_map(|(m, id)| format!("{}:{}", m, id)),
            "[0-9]{1,10}",
        ]
    }

    pub fn arb_user() -> impl Strategy<Value = User> {
        (arb_id(), arb_email(), proptest::option::of(arb_custom_id())).prop_map(
            |(id, email, custom_id)| User {
                id,
                email,
                custom_id,
                ..Default::default()
            },
        )
    }

    pub fn arb_application() -> impl Strategy<Value = Application> {
        (arb_id(), ".{0,200}", any::<bool>()).prop_map(|(id, name, confidential)| Application {
            id,
            name,
            confidential,
            ..Default::default()
        })
    }

    pub fn arb_scope() -> impl Strategy<Value = String> {
        "[a-z]{1,6}(:[a-z]{1,6})?"
    }

    /// Scope list without duplicates, each without a grant date.
    pub fn arb_scope_grants() -> impl Strategy<Value = Vec<ScopeGrant>> {
        proptest::collection::btree_set(arb_scope(), 0..8).prop_map(|scopes| {
            scopes
                .into_iter()
                .map(|scope| ScopeGrant {
                    scope,
                    granted_date: None,
                })
                .collect()
        })
    }

    /// Scope list where every scope carries a grant date.
    pub fn arb_dated_scope_grants() -> impl Strategy<Value = Vec<ScopeGrant>> {
        proptest::collection::btree_map(arb_scope(), 2000i32..2030, 0..8).prop_map(|scopes| {
            scopes
                .into_iter()
                .map(|(scope, year)| ScopeGrant {
                    scope,
                    granted_date: Some(format!("{}-01-01T00:00:00.000Z", year)),
                })
                .collect()
        })
    }

    /// Flat JSON rows with a numeric `n`, a string `name` and an optional `tag`.
    pub fn arb_rows(max: usize) -> impl Strategy<Value = Vec<JsonValue>> {
        proptest::collection::vec(
            (0i64..1000, "[A-Za-z ]{0,12}", proptest::option::of("[a-z]{1,4}")),
            0..max,
        )
        .prop_map(|rows| {
            rows.into_iter()
                .enumerate()
                .map(|(i, (n, name, tag))| {
                    let mut row = json!({"id": format!("r{}", i), "n": n, "name": name});
                    if let Some(tag) = tag {
                        row["tag"] = JsonValue::String(tag);
                    }
                    row
                })
                .collect()
        })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built entities for common testing scenarios.

    use super::*;

    pub fn user(id: &str, email: &str) -> User {
        User {
            id: id.to_string(),
            email: email.to_string(),
            ..Default::default()
        }
    }

    /// User with first and last name, as the legacy data sets carry them.
    pub fn named_user(id: &str, email: &str, first: &str, last: &str) -> User {
        let mut u = user(id, email);
        u.extra.insert("firstName".into(), json!(first));
        u.extra.insert("lastName".into(), json!(last));
        u
    }

    pub fn application(id: &str) -> Application {
        Application {
            id: id.to_string(),
            name: format!("Application {}", id),
            redirect_uri: Some(format!("https://{}.example.test/callback", id)),
            ..Default::default()
        }
    }

    pub fn subscription(id: &str, app_id: &str, api_id: &str) -> Subscription {
        Subscription {
            id: id.to_string(),
            application: app_id.to_string(),
            api: api_id.to_string(),
            plan: "basic".to_string(),
            approved: true,
            ..Default::default()
        }
    }

    /// Subscription carrying OAuth credentials and an API key.
    pub fn subscription_with_credentials(id: &str, app_id: &str, api_id: &str) -> Subscription {
        Subscription {
            client_id: Some(format!("client-{}", id)),
            client_secret: Some(format!("secret-{}", id)),
            apikey: Some(format!("key-{}", id)),
            ..subscription(id, app_id, api_id)
        }
    }

    pub fn approval(id: &str, subscription_id: &str, app_id: &str, api_id: &str) -> Approval {
        Approval {
            id: id.to_string(),
            subscription_id: subscription_id.to_string(),
            application: EntityRef {
                id: app_id.to_string(),
                ..Default::default()
            },
            api: EntityRef {
                id: api_id.to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn verification(id: &str, user_id: &str, utc: i64) -> Verification {
        Verification {
            id: id.to_string(),
            kind: "email".to_string(),
            email: format!("{}@example.test", user_id),
            user_id: user_id.to_string(),
            utc,
            ..Default::default()
        }
    }

    pub fn listener(id: &str) -> WebhookListener {
        WebhookListener {
            id: id.to_string(),
            url: format!("http://{}.example.test/hook", id),
            ..Default::default()
        }
    }

    pub fn event(action: &str, entity: &str) -> WebhookEvent {
        WebhookEvent {
            action: action.to_string(),
            entity: entity.to_string(),
            data: json!({"source": "test"}),
            ..Default::default()
        }
    }

    pub fn registration(pool_id: &str, user_id: &str, name: &str) -> Registration {
        Registration {
            pool_id: pool_id.to_string(),
            user_id: user_id.to_string(),
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn grant(user_id: &str, app_id: &str, api_id: &str, scopes: &[&str]) -> ApiGrant {
        ApiGrant {
            user_id: user_id.to_string(),
            application_id: app_id.to_string(),
            api_id: api_id.to_string(),
            grants: scopes
                .iter()
                .map(|s| ScopeGrant {
                    scope: s.to_string(),
                    granted_date: None,
                })
                .collect(),
            ..Default::default()
        }
    }

    /// Ten rows `p0..p9` with `n` ascending and `name` descending.
    pub fn ten_rows() -> Vec<JsonValue> {
        (0..10)
            .map(|i| json!({"id": format!("p{}", i), "name": format!("Name {}", 9 - i), "n": i}))
            .collect()
    }
}

// ============================================================================
// TEMPORARY STORES
// ============================================================================

/// Temporary directory holding a document store under `dynamic/`.
///
/// The directory and everything in it is removed when the value drops.
pub struct TempStoreDir {
    dir: tempfile::TempDir,
}

impl TempStoreDir {
    pub fn new() -> Self {
        Self {
            dir: tempfile::TempDir::new().expect("failed to create temp dir"),
        }
    }

    /// Root of the temporary directory.
    pub fn root(&self) -> &std::path::Path {
        self.dir.path()
    }

    /// Base path for the document store.
    pub fn base_path(&self) -> std::path::PathBuf {
        self.dir.path().join("dynamic")
    }

    /// Write `value` to `<base>/<relative>`, creating parent directories.
    pub fn seed_json(&self, relative: &str, value: &JsonValue) {
        let path = self.base_path().join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("failed to create seed dir");
        }
        let text = serde_json::to_string_pretty(value).expect("failed to encode seed");
        std::fs::write(path, text).expect("failed to write seed");
    }

    /// Read `<base>/<relative>` as JSON.
    pub fn read_json(&self, relative: &str) -> JsonValue {
        let text = std::fs::read_to_string(self.base_path().join(relative))
            .expect("failed to read store file");
        serde_json::from_str(&text).expect("store file is not JSON")
    }

    pub fn exists(&self, relative: &str) -> bool {
        self.base_path().join(relative).exists()
    }
}

impl Default for TempStoreDir {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions over the `DaoError` taxonomy.

    use super::*;

    /// Assert that a result failed with the given HTTP-analog status.
    #[track_caller]
    pub fn assert_status<T: std::fmt::Debug>(result: &DaoResult<T>, status: u16) {
        match result {
            Err(e) => assert_eq!(e.status_code(), status, "unexpected error: {}", e),
            Ok(v) => panic!("Expected error with status {}, got Ok({:?})", status, v),
        }
    }

    #[track_caller]
    pub fn assert_locked<T: std::fmt::Debug>(result: &DaoResult<T>) {
        assert_status(result, 423);
    }

    #[track_caller]
    pub fn assert_not_found<T: std::fmt::Debug>(result: &DaoResult<T>) {
        assert_status(result, 404);
    }

    #[track_caller]
    pub fn assert_conflict<T: std::fmt::Debug>(result: &DaoResult<T>) {
        assert_status(result, 409);
    }

    #[track_caller]
    pub fn assert_not_implemented<T: std::fmt::Debug>(result: &DaoResult<T>) {
        assert_status(result, 501);
    }

    #[track_caller]
    pub fn assert_internal<T: std::fmt::Debug>(result: &DaoResult<T>) {
        assert_status(result, 500);
    }

    /// Ids of the rows of a page, in order.
    pub fn page_ids(page: &Page<JsonValue>) -> Vec<String> {
        page.rows
            .iter()
            .map(|r| r["id"].as_str().unwrap_or_default().to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_temp_store_dir_seed_and_read() {
        let tmp = TempStoreDir::new();
        tmp.seed_json("users/_index.json", &json!([{"id": "u1", "email": "a@b.c"}]));
        assert!(tmp.exists("users/_index.json"));
        assert_eq!(tmp.read_json("users/_index.json")[0]["id"], json!("u1"));
    }

    #[test]
    fn test_fixture_credentials() {
        let sub = fixtures::subscription_with_credentials("s1", "app", "petstore");
        assert_eq!(sub.client_id.as_deref(), Some("client-s1"));
        assert_eq!(sub.plan, "basic");
    }

    #[test]
    fn test_assert_status_matches() {
        let r: DaoResult<()> = Err(DaoError::locked("busy"));
        assertions::assert_locked(&r);
    }

    proptest! {
        #[test]
        fn prop_generated_ids_are_file_safe(id in generators::arb_id()) {
            prop_assert!(!id.contains('/'));
            prop_assert!(!id.starts_with('.'));
        }
    }
}
