//! Bundle registration and persisted engine state.
//!
//! Registration is a JSON document in the bundle's cache directory:
//! written at apply begin, finalized or removed at unregister, and
//! carrying the resume command line plus the suspended flag. The
//! persisted variable stream lives beside it.

use ember_core::{
    cache::CacheStore,
    constants::{REGISTRATION_STATE_FILE, VARIABLES_STATE_FILE},
    error::EmberResult,
    manifest::BundleInfo,
    variable::Variables,
    version::Version,
};
use ember_utils::fs::{read_file, safe_remove, write_file};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// On-disk registration record.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RegistrationState {
    pub bundle_id: String,
    pub version: String,
    pub provider_key: String,
    pub installed: bool,
    pub suspended: bool,
    pub restart_initiated: bool,
    pub resume_command: String,
}

/// Registration bookkeeping for the running bundle.
#[derive(Debug, Clone, Default)]
pub struct Registration {
    pub bundle_id: String,
    pub version: Version,
    pub provider_key: String,
    pub per_machine: bool,
    pub executable_name: String,
    /// True when a completed install is already registered.
    pub installed: bool,
    /// Set at plan time so an interrupted run can continue.
    pub resume_command: String,
}

impl Registration {
    pub fn from_bundle(bundle: &BundleInfo) -> Self {
        Self {
            bundle_id: bundle.id.clone(),
            version: bundle.version,
            provider_key: bundle.provider_key.clone(),
            per_machine: bundle.per_machine,
            executable_name: bundle.executable_name.clone(),
            installed: false,
            resume_command: String::new(),
        }
    }

    /// Reads any previous registration and adopts its installed flag.
    pub fn query(&mut self, cache: &CacheStore) -> EmberResult<()> {
        let path = cache.bundle_dir().join(REGISTRATION_STATE_FILE);
        if !path.is_file() {
            return Ok(());
        }
        let state: RegistrationState = serde_json::from_slice(&read_file(&path)?)?;
        self.installed = state.installed;
        debug!(
            bundle = %self.bundle_id,
            installed = self.installed,
            "previous registration found"
        );
        Ok(())
    }

    /// Writes the in-progress registration at apply begin.
    pub fn register(&self, cache: &CacheStore) -> EmberResult<()> {
        let state = RegistrationState {
            bundle_id: self.bundle_id.clone(),
            version: self.version.to_string(),
            provider_key: self.provider_key.clone(),
            installed: self.installed,
            suspended: false,
            restart_initiated: false,
            resume_command: self.resume_command.clone(),
        };
        self.write_state(cache, &state)?;
        info!(bundle = %self.bundle_id, "bundle registered");
        Ok(())
    }

    /// Finalizes registration at apply end. Keeping registration
    /// marks the bundle installed; a suspend or initiated restart
    /// records resumable state; otherwise the registration is
    /// removed.
    pub fn unregister(
        &self,
        cache: &CacheStore,
        keep: bool,
        suspended: bool,
        restart_initiated: bool,
    ) -> EmberResult<()> {
        if keep || suspended || restart_initiated {
            let state = RegistrationState {
                bundle_id: self.bundle_id.clone(),
                version: self.version.to_string(),
                provider_key: self.provider_key.clone(),
                installed: keep,
                suspended,
                restart_initiated,
                resume_command: self.resume_command.clone(),
            };
            self.write_state(cache, &state)?;
            info!(
                bundle = %self.bundle_id,
                installed = keep,
                suspended,
                "registration finalized"
            );
        } else {
            safe_remove(cache.bundle_dir().join(REGISTRATION_STATE_FILE))?;
            safe_remove(cache.bundle_dir().join(VARIABLES_STATE_FILE))?;
            info!(bundle = %self.bundle_id, "registration removed");
        }
        Ok(())
    }

    /// Persists the serialized variable stream beside the
    /// registration.
    pub fn save_variables(&self, cache: &CacheStore, variables: &Variables) -> EmberResult<()> {
        let bytes = variables.serialize(true)?;
        write_file(cache.bundle_dir().join(VARIABLES_STATE_FILE), &bytes)?;
        Ok(())
    }

    /// Restores persisted variables from a previous run, if any.
    pub fn load_variables(&self, cache: &CacheStore, variables: &Variables) -> EmberResult<()> {
        let path = cache.bundle_dir().join(VARIABLES_STATE_FILE);
        if path.is_file() {
            variables.deserialize(&read_file(&path)?)?;
        }
        Ok(())
    }

    fn write_state(&self, cache: &CacheStore, state: &RegistrationState) -> EmberResult<()> {
        let path = cache.bundle_dir().join(REGISTRATION_STATE_FILE);
        write_file(&path, &serde_json::to_vec_pretty(state)?)?;
        Ok(())
    }

    /// Adds this bundle to the ref-count list of a dependency
    /// provider key.
    pub fn register_provider(&self, cache: &CacheStore, key: &str) -> EmberResult<()> {
        let path = provider_path(cache, key);
        let mut holders = read_provider(&path);
        if !holders.iter().any(|h| h == &self.bundle_id) {
            holders.push(self.bundle_id.clone());
            write_file(&path, holders.join("\n").as_bytes())?;
        }
        debug!(provider = key, "dependency provider registered");
        Ok(())
    }

    /// Drops this bundle from a provider's ref-count list; the
    /// provider record disappears with its last holder.
    pub fn unregister_provider(&self, cache: &CacheStore, key: &str) -> EmberResult<()> {
        let path = provider_path(cache, key);
        let mut holders = read_provider(&path);
        holders.retain(|h| h != &self.bundle_id);
        if holders.is_empty() {
            safe_remove(&path)?;
        } else {
            write_file(&path, holders.join("\n").as_bytes())?;
        }
        debug!(provider = key, "dependency provider unregistered");
        Ok(())
    }

    /// Remaining holders of a provider key.
    pub fn provider_holders(cache: &CacheStore, key: &str) -> Vec<String> {
        read_provider(&provider_path(cache, key))
    }
}

fn provider_path(cache: &CacheStore, key: &str) -> std::path::PathBuf {
    let sanitized: String = key
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    cache.root().join(".providers").join(sanitized)
}

fn read_provider(path: &std::path::Path) -> Vec<String> {
    read_file(path)
        .ok()
        .map(|raw| {
            String::from_utf8_lossy(&raw)
                .lines()
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
