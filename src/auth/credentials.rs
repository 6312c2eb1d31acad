//! Credential files on disk.
//!
//! Shopify shop records live in `~/.data-connector/shopify_credentials.json`
//! with mode 0600 and ciphertext access tokens; Slack CLI defaults in
//! `slack_credentials.json` alongside. Legacy Shopify records that
//! predate the granted/requested scope split are upgraded on load.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::auth::crypto::TokenCipher;
use crate::error::{GatewayError, Result};

/// One shop's stored credentials. `access_token` is ciphertext.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ShopRecord {
    pub access_token: String,
    #[serde(default)]
    pub shop_info: serde_json::Value,
    /// Legacy field kept for compatibility; new writes mirror it into
    /// the split fields.
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub granted_scopes: Vec<String>,
    #[serde(default)]
    pub requested_scopes: Vec<String>,
    #[serde(default)]
    pub last_updated: String,
    #[serde(default)]
    pub api_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct ShopifyFile {
    shops: HashMap<String, ShopRecord>,
}

/// Encrypted at-rest store for Shopify shop tokens.
pub struct ShopifyCredentialStore {
    path: PathBuf,
    cipher: TokenCipher,
}

impl ShopifyCredentialStore {
    /// Opens the store at the default path.
    pub fn open_default(cipher: TokenCipher) -> Result<Self> {
        let dir = crate::config::Config::state_dir()?;
        Ok(Self::open(dir.join("shopify_credentials.json"), cipher))
    }

    /// Opens the store at an explicit path.
    pub fn open(path: PathBuf, cipher: TokenCipher) -> Self {
        Self { path, cipher }
    }

    /// Stores a shop's plaintext token (encrypted before write) and
    /// scope sets.
    pub fn store_shop(
        &self,
        shop_domain: &str,
        plaintext_token: &str,
        shop_info: serde_json::Value,
        granted_scopes: Vec<String>,
        requested_scopes: Vec<String>,
        api_version: &str,
    ) -> Result<()> {
        let mut file = self.load_file()?;
        file.shops.insert(
            shop_domain.to_string(),
            ShopRecord {
                access_token: self.cipher.encrypt(plaintext_token)?,
                shop_info,
                scopes: granted_scopes.clone(),
                granted_scopes,
                requested_scopes,
                last_updated: Utc::now().to_rfc3339(),
                api_version: api_version.to_string(),
            },
        );
        self.save_file(&file)
    }

    /// Loads a shop's record, upgrading legacy entries.
    pub fn get_shop(&self, shop_domain: &str) -> Result<Option<ShopRecord>> {
        let file = self.load_file()?;
        Ok(file.shops.get(shop_domain).cloned().map(upgrade_legacy))
    }

    /// Decrypts a shop's access token for one operation.
    pub fn decrypt_token(&self, record: &ShopRecord) -> Result<String> {
        self.cipher.decrypt(&record.access_token)
    }

    /// All known shop domains.
    pub fn shop_domains(&self) -> Result<Vec<String>> {
        let file = self.load_file()?;
        let mut domains: Vec<_> = file.shops.keys().cloned().collect();
        domains.sort();
        Ok(domains)
    }

    fn load_file(&self) -> Result<ShopifyFile> {
        if !self.path.exists() {
            return Ok(ShopifyFile::default());
        }
        let content = std::fs::read_to_string(&self.path)
            .map_err(|e| GatewayError::config(format!("cannot read credential file: {e}")))?;
        serde_json::from_str(&content)
            .map_err(|e| GatewayError::config(format!("credential file is corrupt: {e}")))
    }

    fn save_file(&self, file: &ShopifyFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| GatewayError::config(format!("cannot create state dir: {e}")))?;
        }
        let content = serde_json::to_string_pretty(file)
            .map_err(|e| GatewayError::internal(format!("credential serialization: {e}")))?;
        std::fs::write(&self.path, content)
            .map_err(|e| GatewayError::config(format!("cannot write credential file: {e}")))?;
        restrict_permissions(&self.path)?;
        Ok(())
    }
}

/// Seeds the scope split for records written before it existed:
/// the legacy `scopes` list becomes both requested and granted.
fn upgrade_legacy(mut record: ShopRecord) -> ShopRecord {
    if record.granted_scopes.is_empty() && record.requested_scopes.is_empty() && !record.scopes.is_empty()
    {
        info!("upgrading legacy shop credential record");
        record.granted_scopes = record.scopes.clone();
        record.requested_scopes = record.scopes.clone();
    }
    record
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| GatewayError::config(format!("cannot set credential file mode: {e}")))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

/// CLI-side Slack defaults.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SlackCredentials {
    pub user_id: i64,
    #[serde(default)]
    pub workspaces: Vec<SlackWorkspaceRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlackWorkspaceRef {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub is_default: bool,
}

impl SlackCredentials {
    /// Loads from the default path; a missing file yields None.
    pub fn load_default() -> Result<Option<Self>> {
        let dir = crate::config::Config::state_dir()?;
        Self::load(&dir.join("slack_credentials.json"))
    }

    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| GatewayError::config(format!("cannot read slack credentials: {e}")))?;
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| GatewayError::config(format!("slack credentials corrupt: {e}")))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| GatewayError::config(format!("cannot create state dir: {e}")))?;
        }
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| GatewayError::internal(format!("serialization: {e}")))?;
        std::fs::write(path, content)
            .map_err(|e| GatewayError::config(format!("cannot write slack credentials: {e}")))?;
        restrict_permissions(path)
    }

    /// The workspace marked default, or the first one.
    pub fn default_workspace(&self) -> Option<&SlackWorkspaceRef> {
        self.workspaces
            .iter()
            .find(|w| w.is_default)
            .or_else(|| self.workspaces.first())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store(dir: &tempfile::TempDir) -> ShopifyCredentialStore {
        ShopifyCredentialStore::open(
            dir.path().join("shopify_credentials.json"),
            TokenCipher::new("test-secret"),
        )
    }

    #[test]
    fn test_store_and_load_shop() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store
            .store_shop(
                "acme.myshopify.com",
                "shpat-plaintext",
                json!({"name": "Acme"}),
                vec!["read_products".to_string()],
                vec!["read_products".to_string(), "read_orders".to_string()],
                "2024-01",
            )
            .unwrap();

        let record = store.get_shop("acme.myshopify.com").unwrap().unwrap();
        assert_eq!(store.decrypt_token(&record).unwrap(), "shpat-plaintext");
        assert_eq!(record.granted_scopes, vec!["read_products"]);
        assert_eq!(record.requested_scopes.len(), 2);
        assert_eq!(record.api_version, "2024-01");
    }

    #[test]
    fn test_token_on_disk_is_ciphertext() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store
            .store_shop("acme.myshopify.com", "shpat-plaintext", json!({}), vec![], vec![], "2024-01")
            .unwrap();

        let raw = std::fs::read_to_string(dir.path().join("shopify_credentials.json")).unwrap();
        assert!(!raw.contains("shpat-plaintext"));
    }

    #[cfg(unix)]
    #[test]
    fn test_file_mode_is_0600() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store
            .store_shop("acme.myshopify.com", "t", json!({}), vec![], vec![], "2024-01")
            .unwrap();
        let mode = std::fs::metadata(dir.path().join("shopify_credentials.json"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_legacy_record_upgraded_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shopify_credentials.json");
        // A record written before the granted/requested split existed.
        std::fs::write(
            &path,
            r#"{"shops": {"legacy.myshopify.com": {
                "access_token": "enc",
                "scopes": ["read_products", "read_orders"],
                "last_updated": "2023-01-01T00:00:00Z",
                "api_version": "2023-01"
            }}}"#,
        )
        .unwrap();

        let store = ShopifyCredentialStore::open(path, TokenCipher::new("s"));
        let record = store.get_shop("legacy.myshopify.com").unwrap().unwrap();
        assert_eq!(record.requested_scopes, vec!["read_products", "read_orders"]);
        assert_eq!(record.granted_scopes, vec!["read_products", "read_orders"]);
    }

    #[test]
    fn test_slack_credentials_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slack_credentials.json");
        let credentials = SlackCredentials {
            user_id: 7,
            workspaces: vec![
                SlackWorkspaceRef {
                    id: 1,
                    name: "acme".to_string(),
                    is_default: false,
                },
                SlackWorkspaceRef {
                    id: 2,
                    name: "beta".to_string(),
                    is_default: true,
                },
            ],
        };
        credentials.save(&path).unwrap();

        let loaded = SlackCredentials::load(&path).unwrap().unwrap();
        assert_eq!(loaded.user_id, 7);
        assert_eq!(loaded.default_workspace().unwrap().id, 2);
    }

    #[test]
    fn test_missing_files_yield_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        assert!(store.get_shop("none.myshopify.com").unwrap().is_none());
        assert!(store.shop_domains().unwrap().is_empty());
        assert!(
            SlackCredentials::load(&dir.path().join("missing.json"))
                .unwrap()
                .is_none()
        );
    }
}
