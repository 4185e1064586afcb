//! Options shared by every backend instance.

use crate::error::DaoResult;
use crate::utils::CredentialCipher;
use std::collections::BTreeMap;

/// Runtime options of a DAO instance.
#[derive(Debug, Clone)]
pub struct DaoOptions {
    /// Set while copying data between stores: credentials pass through
    /// untouched, legacy data is accepted and derived fields are not
    /// recomputed.
    pub migration_mode: bool,
    /// Required user group per API id, copied onto subscriptions after the
    /// relational schema gains its `api_group` column.
    pub api_groups: BTreeMap<String, String>,
    pub cipher: CredentialCipher,
}

impl Default for DaoOptions {
    fn default() -> Self {
        Self {
            migration_mode: false,
            api_groups: BTreeMap::new(),
            cipher: CredentialCipher::passthrough(),
        }
    }
}

impl DaoOptions {
    /// Options for a portal instance; the credential key comes from
    /// `PORTAL_API_AESKEY`.
    pub fn from_env() -> DaoResult<Self> {
        Ok(Self {
            cipher: CredentialCipher::from_env()?,
            ..Self::default()
        })
    }

    /// Options for a store opened by the migration pipeline.
    pub fn migration() -> Self {
        Self {
            migration_mode: true,
            ..Self::default()
        }
    }

    pub fn with_cipher(mut self, cipher: CredentialCipher) -> Self {
        self.cipher = cipher;
        self
    }

    pub fn with_api_groups(mut self, api_groups: BTreeMap<String, String>) -> Self {
        self.api_groups = api_groups;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_options_pass_credentials_through() {
        let opts = DaoOptions::migration();
        assert!(opts.migration_mode);
        assert!(opts.cipher.is_passthrough());
    }
}
