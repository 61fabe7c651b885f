// Encrypted on-disk credential persistence

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{AuthError, Result};
use crate::secret::SecretCrypter;

/// File-backed store of encrypted credential records.
///
/// One file per `{strategy}_{id}` under the cache directory. Writes go through a
/// temp file in the same directory followed by a rename, so readers in other
/// processes never observe a partial record.
#[derive(Clone, Debug)]
pub struct DiskCredentialStore {
    dir: PathBuf,
}

impl DiskCredentialStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the record for a strategy and host or client id
    pub fn path_for(&self, strategy: &str, id: &str) -> PathBuf {
        self.dir.join(format!("{}_{}", strategy, sanitize(id)))
    }

    /// Encrypt and persist a record
    pub fn save<T: Serialize>(
        &self,
        strategy: &str,
        id: &str,
        record: &T,
        crypter: &SecretCrypter,
    ) -> Result<()> {
        std::fs::create_dir_all(&self.dir).map_err(|e| {
            AuthError::Cache(format!("Cannot create {}: {}", self.dir.display(), e))
        })?;

        let json = serde_json::to_string(record)
            .map_err(|e| AuthError::Cache(format!("Cannot serialize record: {}", e)))?;
        let encrypted = crypter.encode(&json)?;

        let path = self.path_for(strategy, id);
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(encrypted.as_bytes())?;
        tmp.flush()?;
        tmp.persist(&path)
            .map_err(|e| AuthError::Cache(format!("Cannot write {}: {}", path.display(), e)))?;

        tracing::debug!(path = %path.display(), "Saved credential record");
        Ok(())
    }

    /// Read and decrypt a record, surfacing the reason on failure
    pub fn try_load<T: DeserializeOwned>(
        &self,
        strategy: &str,
        id: &str,
        crypter: &SecretCrypter,
    ) -> Result<T> {
        let path = self.path_for(strategy, id);
        let encrypted = std::fs::read_to_string(&path)
            .map_err(|e| AuthError::Cache(format!("Cannot read {}: {}", path.display(), e)))?;
        let json = crypter
            .decode(&encrypted)
            .map_err(|e| AuthError::Cache(format!("Cannot decrypt {}: {}", path.display(), e)))?;
        serde_json::from_str(&json)
            .map_err(|e| AuthError::Cache(format!("Cannot parse {}: {}", path.display(), e)))
    }

    /// Read a record; missing or corrupt files count as a miss
    pub fn load<T: DeserializeOwned>(
        &self,
        strategy: &str,
        id: &str,
        crypter: &SecretCrypter,
    ) -> Option<T> {
        match self.try_load(strategy, id, crypter) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::debug!("Disk cache miss for {}_{}: {}", strategy, id, e);
                None
            }
        }
    }

    /// Remove a record; a missing file is not an error
    pub fn invalidate(&self, strategy: &str, id: &str) -> Result<()> {
        let path = self.path_for(strategy, id);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                tracing::debug!(path = %path.display(), "Removed credential record");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AuthError::Cache(format!(
                "Cannot remove {}: {}",
                path.display(),
                e
            ))),
        }
    }
}

/// Keep file names portable: anything outside [A-Za-z0-9._-] becomes '_'
fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Record {
        token: String,
        expires: i64,
    }

    fn crypter() -> SecretCrypter {
        SecretCrypter::new(Some("test"))
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskCredentialStore::new(dir.path());
        let record = Record {
            token: "abc".to_string(),
            expires: 42,
        };

        store.save("device", "client-id", &record, &crypter()).unwrap();
        let loaded: Record = store.load("device", "client-id", &crypter()).unwrap();
        assert_eq!(loaded, record);

        let raw = std::fs::read_to_string(store.path_for("device", "client-id")).unwrap();
        assert!(!raw.contains("abc"));
    }

    #[test]
    fn test_missing_record_is_miss() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskCredentialStore::new(dir.path());
        assert!(store.load::<Record>("device", "none", &crypter()).is_none());
    }

    #[test]
    fn test_corrupt_record_is_miss() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskCredentialStore::new(dir.path());
        std::fs::write(store.path_for("ondemand", "contoso.sharepoint.com"), "garbage").unwrap();
        assert!(store
            .load::<Record>("ondemand", "contoso.sharepoint.com", &crypter())
            .is_none());
        assert!(matches!(
            store.try_load::<Record>("ondemand", "contoso.sharepoint.com", &crypter()),
            Err(AuthError::Cache(_))
        ));
    }

    #[test]
    fn test_wrong_key_is_miss() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskCredentialStore::new(dir.path());
        let record = Record {
            token: "t".to_string(),
            expires: 1,
        };
        store.save("device", "id", &record, &crypter()).unwrap();
        assert!(store
            .load::<Record>("device", "id", &SecretCrypter::new(Some("other")))
            .is_none());
    }

    #[test]
    fn test_invalidate() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskCredentialStore::new(dir.path().join("nested"));
        let record = Record {
            token: "t".to_string(),
            expires: 1,
        };
        store.save("device", "id", &record, &crypter()).unwrap();
        store.invalidate("device", "id").unwrap();
        assert!(!store.path_for("device", "id").exists());
        // Second removal is a no-op
        store.invalidate("device", "id").unwrap();
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("contoso.sharepoint.com"), "contoso.sharepoint.com");
        assert_eq!(sanitize("a/b\\c:d"), "a_b_c_d");
    }
}
