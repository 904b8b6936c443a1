//! Content-addressed payload staging.
//!
//! Layout: `<root>/<bundleId>/<cacheId>/<payloadRelPath>` holds
//! verified files; `<root>/.unverified/<name>` holds staged files
//! awaiting verification. Completion verifies first and then places
//! the file atomically, so readers only ever see verified content
//! under the completed area.

use std::path::{Path, PathBuf};

use ember_utils::{
    fs::{atomic_move, clear_readonly, copy_file, ensure_dir_exists, safe_remove},
    hash::verify_checksum,
};
use tracing::{debug, warn};

use crate::{
    constants::CACHE_UNVERIFIED_DIR,
    error::{EmberError, EmberResult},
    manifest::Payload,
};

pub struct CacheStore {
    root: PathBuf,
    bundle_id: String,
}

impl CacheStore {
    pub fn new(root: impl Into<PathBuf>, bundle_id: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            bundle_id: bundle_id.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding this bundle's completed packages.
    pub fn bundle_dir(&self) -> PathBuf {
        self.root.join(&self.bundle_id)
    }

    /// Completed directory for one cache identity.
    pub fn completed_dir(&self, cache_id: &str) -> PathBuf {
        self.bundle_dir().join(cache_id)
    }

    /// Staging path for a not-yet-verified acquisition.
    pub fn unverified_path(&self, name: &str) -> PathBuf {
        let sanitized: String = name
            .chars()
            .map(|c| {
                if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.root.join(CACHE_UNVERIFIED_DIR).join(sanitized)
    }

    /// True when the payload already sits verified in the completed
    /// area.
    pub fn is_payload_cached(&self, cache_id: &str, payload: &Payload) -> bool {
        let path = self.completed_dir(cache_id).join(&payload.file_path);
        match path.metadata() {
            Ok(metadata) => payload.size == 0 || metadata.len() == payload.size,
            Err(_) => false,
        }
    }

    /// Verifies a staged file against the payload's metadata.
    ///
    /// Decision order: payload hash when present, then signing catalog,
    /// then size match. With no metadata at all the file passes.
    pub fn verify_payload(&self, payload: &Payload, staged: &Path) -> EmberResult<()> {
        if !staged.is_file() {
            return Err(EmberError::VerifyFailed {
                key: payload.key.clone(),
            });
        }

        if let Some(hash) = &payload.hash {
            if !verify_checksum(staged, hash)? {
                warn!(payload = %payload.key, "payload hash mismatch");
                return Err(EmberError::VerifyFailed {
                    key: payload.key.clone(),
                });
            }
            return Ok(());
        }

        if payload.catalog.is_some() {
            // signature policy belongs to the catalog collaborator;
            // the store only enforces the size it was told
            return self.verify_size(payload, staged);
        }

        self.verify_size(payload, staged)
    }

    fn verify_size(&self, payload: &Payload, staged: &Path) -> EmberResult<()> {
        if payload.size == 0 {
            return Ok(());
        }
        let actual = staged
            .metadata()
            .map_err(|_| EmberError::VerifyFailed {
                key: payload.key.clone(),
            })?
            .len();
        if actual != payload.size {
            warn!(
                payload = %payload.key,
                expected = payload.size,
                actual,
                "payload size mismatch"
            );
            return Err(EmberError::VerifyFailed {
                key: payload.key.clone(),
            });
        }
        Ok(())
    }

    /// Verifies `staged` and promotes it into the completed area for
    /// `cache_id`. `move_file` consumes the staged file; otherwise it
    /// is copied and left in place for a later layout.
    pub fn complete_payload(
        &self,
        payload: &Payload,
        cache_id: &str,
        staged: &Path,
        move_file: bool,
    ) -> EmberResult<()> {
        self.verify_payload(payload, staged)?;

        let destination = self.completed_dir(cache_id).join(&payload.file_path);
        self.place(staged, &destination, move_file)?;
        debug!(payload = %payload.key, cache_id, "payload cached");
        Ok(())
    }

    /// Verifies `staged` and places it under a caller-supplied layout
    /// directory instead of the completed area.
    pub fn layout_payload(
        &self,
        payload: &Payload,
        layout_dir: &Path,
        staged: &Path,
        move_file: bool,
    ) -> EmberResult<()> {
        self.verify_payload(payload, staged)?;

        let destination = layout_dir.join(&payload.file_path);
        self.place(staged, &destination, move_file)?;
        debug!(payload = %payload.key, layout = %layout_dir.display(), "payload laid out");
        Ok(())
    }

    /// Places the bundle executable itself into the layout directory.
    pub fn layout_bundle(
        &self,
        executable_name: &str,
        layout_dir: &Path,
        staged: &Path,
    ) -> EmberResult<()> {
        if !staged.is_file() {
            return Err(EmberError::NotFound(staged.display().to_string()));
        }
        let destination = layout_dir.join(executable_name);
        self.place(staged, &destination, false)?;
        debug!(bundle = executable_name, "bundle laid out");
        Ok(())
    }

    fn place(&self, staged: &Path, destination: &Path, move_file: bool) -> EmberResult<()> {
        if let Some(parent) = destination.parent() {
            ensure_dir_exists(parent)?;
        }
        clear_readonly(destination)?;
        if move_file {
            atomic_move(staged, destination)?;
        } else {
            copy_file(staged, destination)?;
        }
        Ok(())
    }

    /// Removes a package's completed directory.
    pub fn remove_package(&self, cache_id: &str) -> EmberResult<()> {
        debug!(cache_id, "removing cached package");
        safe_remove(self.completed_dir(cache_id))?;
        Ok(())
    }

    /// Removes staged leftovers; with `all` the bundle's completed
    /// area goes too.
    pub fn cleanup(&self, all: bool) -> EmberResult<()> {
        safe_remove(self.root.join(CACHE_UNVERIFIED_DIR))?;
        if all {
            safe_remove(self.bundle_dir())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ember_utils::{fs::write_file, hash::calculate_checksum};
    use tempfile::TempDir;

    use super::*;

    fn payload(key: &str, file_path: &str, size: u64, hash: Option<String>) -> Payload {
        Payload {
            key: key.to_string(),
            file_path: file_path.to_string(),
            size,
            hash,
            catalog: None,
            source_path: String::new(),
            download_url: None,
            container: None,
        }
    }

    fn store(dir: &TempDir) -> CacheStore {
        CacheStore::new(dir.path().join("cache"), "bundle.test")
    }

    #[test]
    fn test_complete_payload_with_hash() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let staged = store.unverified_path("L1");
        write_file(&staged, b"payload-bytes").unwrap();
        let hash = calculate_checksum(&staged).unwrap();

        let payload = payload("L1", "sub/file.bin", 13, Some(hash));
        store.complete_payload(&payload, "cache-1", &staged, true).unwrap();

        let completed = store.completed_dir("cache-1").join("sub/file.bin");
        assert_eq!(std::fs::read(&completed).unwrap(), b"payload-bytes");
        assert!(!staged.exists()); // moved
        assert!(store.is_payload_cached("cache-1", &payload));
    }

    #[test]
    fn test_complete_rejects_bad_hash() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let staged = store.unverified_path("L1");
        write_file(&staged, b"corrupted").unwrap();

        let payload = payload("L1", "file.bin", 0, Some("ab".repeat(32)));
        let result = store.complete_payload(&payload, "cache-1", &staged, true);
        assert!(matches!(result, Err(EmberError::VerifyFailed { .. })));
        assert!(!store.completed_dir("cache-1").join("file.bin").exists());
        assert!(staged.exists()); // left staged for a retry
    }

    #[test]
    fn test_size_check_when_no_hash() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let staged = store.unverified_path("L1");
        write_file(&staged, b"1234").unwrap();

        let wrong = payload("L1", "f", 5, None);
        assert!(store.verify_payload(&wrong, &staged).is_err());

        let right = payload("L1", "f", 4, None);
        store.verify_payload(&right, &staged).unwrap();
    }

    #[test]
    fn test_layout_payload_keeps_staged_copy() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let layout = dir.path().join("layout");

        let staged = store.unverified_path("L1");
        write_file(&staged, b"bits").unwrap();

        let payload = payload("L1", "out/file.bin", 4, None);
        store.layout_payload(&payload, &layout, &staged, false).unwrap();

        assert!(layout.join("out/file.bin").is_file());
        assert!(staged.exists());
    }

    #[test]
    fn test_overwrites_readonly_destination() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let destination = store.completed_dir("cache-1").join("file.bin");
        write_file(&destination, b"old").unwrap();
        let mut perms = std::fs::metadata(&destination).unwrap().permissions();
        perms.set_readonly(true);
        std::fs::set_permissions(&destination, perms).unwrap();

        let staged = store.unverified_path("L1");
        write_file(&staged, b"new").unwrap();
        let payload = payload("L1", "file.bin", 3, None);
        store.complete_payload(&payload, "cache-1", &staged, true).unwrap();
        assert_eq!(std::fs::read(&destination).unwrap(), b"new");
    }

    #[test]
    fn test_remove_and_cleanup() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let staged = store.unverified_path("L1");
        write_file(&staged, b"x").unwrap();
        let payload = payload("L1", "f", 1, None);
        store.complete_payload(&payload, "cache-1", &staged, false).unwrap();

        store.remove_package("cache-1").unwrap();
        assert!(!store.completed_dir("cache-1").exists());

        store.cleanup(false).unwrap();
        assert!(!store.root().join(CACHE_UNVERIFIED_DIR).exists());
    }
}
