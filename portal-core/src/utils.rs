//! Helpers shared by both backends.

use crate::entities::{ApiGrant, Application, ClientType, JsonMap, ScopeGrant, Subscription, User};
use crate::error::{DaoError, DaoResult};
use aes_gcm::aead::consts::U12;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use chrono::{SecondsFormat, Utc};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

/// Maximum stored length of an application name.
pub const MAX_APP_NAME_LENGTH: usize = 128;
/// Maximum stored length of an application description.
pub const MAX_APP_DESCRIPTION_LENGTH: usize = 1024;

// ============================================================================
// IDS & TIMESTAMPS
// ============================================================================

/// 20 random bytes, hex encoded.
pub fn create_random_id() -> String {
    hex::encode(rand::random::<[u8; 20]>())
}

/// Current time as an RFC 3339 string with millisecond precision.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Current time in epoch seconds.
pub fn now_utc_secs() -> i64 {
    Utc::now().timestamp()
}

/// Current time in epoch milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Stamp `changedDate` and set or remove `changedBy` on a record.
pub fn stamp_change(data: &mut JsonMap, changing_user_id: Option<&str>) {
    data.insert("changedDate".to_string(), JsonValue::String(now_iso()));
    match changing_user_id {
        Some(user_id) => {
            data.insert("changedBy".to_string(), JsonValue::String(user_id.to_string()));
        }
        None => {
            data.remove("changedBy");
        }
    }
}

// ============================================================================
// USERS & APPLICATIONS
// ============================================================================

/// Display name built from first and last name.
pub fn make_name(user: &User) -> String {
    let first = user.first_name().filter(|s| !s.is_empty());
    let last = user.last_name().filter(|s| !s.is_empty());
    match (first, last) {
        (Some(f), Some(l)) => format!("{} {}", f, l),
        (None, Some(l)) => l.to_string(),
        (Some(f), None) => f.to_string(),
        (None, None) => "Unknown User".to_string(),
    }
}

/// Reconcile `clientType` and `confidential` on read and on write.
///
/// An explicit client type wins; otherwise the legacy confidential flag
/// selects `confidential`, and everything else becomes a public SPA.
pub fn migrate_application_data(app: &mut Application) {
    match app.client_type {
        Some(ct) => app.confidential = ct == ClientType::Confidential,
        None => {
            app.client_type = Some(if app.confidential {
                ClientType::Confidential
            } else {
                ClientType::PublicSpa
            });
        }
    }
}

/// Trim the id and clamp name and description lengths of a new application.
pub fn normalize_new_application(app: &mut Application) {
    app.id = app.id.trim().to_string();
    if app.name.chars().count() > MAX_APP_NAME_LENGTH {
        app.name = app.name.chars().take(MAX_APP_NAME_LENGTH).collect();
    }
    if let Some(desc) = app.description.as_mut() {
        if desc.chars().count() > MAX_APP_DESCRIPTION_LENGTH {
            *desc = desc.chars().take(MAX_APP_DESCRIPTION_LENGTH).collect();
        }
    }
}

// ============================================================================
// GRANTS
// ============================================================================

/// Carry `grantedDate` over from a previous grant record.
///
/// Scopes present in both sets keep their previous date; all other scopes
/// are stamped with `now`.
pub fn merge_grant_data(prev: Option<&ApiGrant>, next: &mut ApiGrant, now: &str) {
    next.grants = next
        .grants
        .iter()
        .map(|g| {
            let granted_date = match prev {
                Some(p) => match p.grants.iter().find(|pg| pg.scope == g.scope) {
                    Some(pg) => pg.granted_date.clone(),
                    None => Some(now.to_string()),
                },
                None => Some(now.to_string()),
            };
            ScopeGrant {
                scope: g.scope.clone(),
                granted_date,
            }
        })
        .collect();
}

// ============================================================================
// CREDENTIAL CIPHER
// ============================================================================

/// Encrypts subscription secrets at rest.
///
/// Ciphertext is `'!' + hex(nonce || aes-256-gcm(plaintext))`. Values without
/// the `'!'` marker are returned unchanged on decrypt, so plaintext data
/// from older stores stays readable. In pass-through mode (used while
/// migrating between stores) values are copied verbatim in both directions.
#[derive(Clone)]
pub struct CredentialCipher {
    cipher: Option<Aes256Gcm>,
}

impl std::fmt::Debug for CredentialCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialCipher")
            .field("passthrough", &self.cipher.is_none())
            .finish()
    }
}

const NONCE_LEN: usize = 12;

impl CredentialCipher {
    /// Cipher keyed by the SHA-256 digest of `key`.
    pub fn new(key: &str) -> DaoResult<Self> {
        let digest = Sha256::digest(key.as_bytes());
        let cipher = Aes256Gcm::new_from_slice(&digest)
            .map_err(|e| DaoError::config(format!("invalid credential key: {}", e)))?;
        Ok(Self {
            cipher: Some(cipher),
        })
    }

    pub fn passthrough() -> Self {
        Self { cipher: None }
    }

    /// Read the key from `PORTAL_API_AESKEY`; without one, secrets are stored
    /// as given.
    pub fn from_env() -> DaoResult<Self> {
        match std::env::var("PORTAL_API_AESKEY") {
            Ok(key) if !key.is_empty() => Self::new(&key),
            _ => {
                tracing::warn!("PORTAL_API_AESKEY is not set, API credentials are stored unencrypted");
                Ok(Self::passthrough())
            }
        }
    }

    pub fn is_passthrough(&self) -> bool {
        self.cipher.is_none()
    }

    pub fn encrypt(&self, plain: &str) -> DaoResult<String> {
        let Some(cipher) = &self.cipher else {
            return Ok(plain.to_string());
        };
        let nonce_bytes = rand::random::<[u8; NONCE_LEN]>();
        let sealed = cipher
            .encrypt(Nonce::<U12>::from_slice(&nonce_bytes), plain.as_bytes())
            .map_err(|_| DaoError::internal("credential encryption failed"))?;
        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&sealed);
        Ok(format!("!{}", hex::encode(out)))
    }

    pub fn decrypt(&self, value: &str) -> DaoResult<String> {
        let Some(cipher) = &self.cipher else {
            return Ok(value.to_string());
        };
        let Some(encoded) = value.strip_prefix('!') else {
            return Ok(value.to_string());
        };
        let raw = hex::decode(encoded)
            .map_err(|e| DaoError::internal(format!("malformed credential: {}", e)))?;
        if raw.len() <= NONCE_LEN {
            return Err(DaoError::internal("malformed credential: too short"));
        }
        let (nonce, sealed) = raw.split_at(NONCE_LEN);
        let plain = cipher
            .decrypt(Nonce::<U12>::from_slice(nonce), sealed)
            .map_err(|_| DaoError::internal("credential decryption failed"))?;
        String::from_utf8(plain)
            .map_err(|e| DaoError::internal(format!("malformed credential: {}", e)))
    }

    /// Encrypt `apikey` and `clientSecret`. The client id stays readable since
    /// it is used as a lookup key.
    pub fn encrypt_subscription(&self, sub: &mut Subscription) -> DaoResult<()> {
        if let Some(v) = sub.apikey.as_deref() {
            sub.apikey = Some(self.encrypt(v)?);
        }
        if let Some(v) = sub.client_secret.as_deref() {
            sub.client_secret = Some(self.encrypt(v)?);
        }
        Ok(())
    }

    /// Decrypt `apikey`, `clientId` and `clientSecret`. Older stores kept the
    /// client id encrypted as well.
    pub fn decrypt_subscription(&self, sub: &mut Subscription) -> DaoResult<()> {
        if let Some(v) = sub.apikey.as_deref() {
            sub.apikey = Some(self.decrypt(v)?);
        }
        if let Some(v) = sub.client_id.as_deref() {
            sub.client_id = Some(self.decrypt(v)?);
        }
        if let Some(v) = sub.client_secret.as_deref() {
            sub.client_secret = Some(self.decrypt(v)?);
        }
        Ok(())
    }
}
