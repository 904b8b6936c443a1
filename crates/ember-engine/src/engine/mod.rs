//! Package engines.
//!
//! One engine per package kind. The engine detects current state and
//! executes forward or rollback operations, emitting messages the
//! applier translates into UX callbacks. Database-backed kinds are
//! opaque collaborators registered by the embedding process; the Exe
//! engine is concrete.

pub mod exe;
pub mod msi_progress;

use std::{collections::HashMap, path::PathBuf, sync::Arc};

use ember_core::{
    error::{EmberError, EmberResult},
    manifest::{Package, PackageKind},
    variable::Variables,
};
use ember_events::{ActionState, PackageState, Restart, UxAction};

/// Message emitted by an engine while executing.
#[derive(Debug, Clone)]
pub enum EngineMessage {
    /// Generic per-package progress, 0-100.
    Progress { percent: u8 },
    /// An installer error with a recommendation code.
    Error { code: i32, message: String },
    /// Files held open by other processes.
    FilesInUse { files: Vec<String> },
    /// Raw database-installer progress 4-tuple, translated by
    /// [`msi_progress::MsiProgressTranslator`] in the message pump.
    MsiProgress { fields: [i32; 4] },
    /// Database-installer action-data tick; advances the current
    /// phase by its step size.
    MsiActionData,
}

/// Callback handed to [`PackageEngine::execute`]; the returned
/// decision lets the UX cancel or retry from inside a run.
pub type EngineCallback<'a> = dyn FnMut(EngineMessage) -> UxAction + 'a;

pub struct DetectContext<'a> {
    pub package: &'a Package,
    pub variables: &'a Variables,
}

pub struct ExecuteContext<'a> {
    pub package: &'a Package,
    pub action: ActionState,
    /// True when this run is the rollback mirror of a forward action.
    pub rollback: bool,
    pub variables: &'a Variables,
    /// Completed cache directory holding the package's payloads.
    pub cached_dir: PathBuf,
    /// Relative path of the package's primary payload inside
    /// `cached_dir`, when it has one.
    pub primary_payload: Option<String>,
}

/// Contract every package engine implements.
pub trait PackageEngine: Send + Sync {
    fn detect(&self, ctx: &DetectContext<'_>) -> EmberResult<PackageState>;

    fn execute(
        &self,
        ctx: &ExecuteContext<'_>,
        callback: &mut EngineCallback<'_>,
    ) -> EmberResult<Restart>;
}

/// Discriminant for registry lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineKind {
    Exe,
    Msi,
    Msp,
    Msu,
}

impl EngineKind {
    pub fn of(package: &Package) -> Self {
        match package.kind {
            PackageKind::Exe(_) => EngineKind::Exe,
            PackageKind::Msi(_) => EngineKind::Msi,
            PackageKind::Msp(_) => EngineKind::Msp,
            PackageKind::Msu(_) => EngineKind::Msu,
        }
    }
}

/// Maps package kinds to their engines.
#[derive(Clone, Default)]
pub struct EngineRegistry {
    engines: HashMap<EngineKind, Arc<dyn PackageEngine>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the concrete Exe engine pre-registered.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(EngineKind::Exe, Arc::new(exe::ExeEngine));
        registry
    }

    pub fn register(&mut self, kind: EngineKind, engine: Arc<dyn PackageEngine>) {
        self.engines.insert(kind, engine);
    }

    pub fn engine_for(&self, package: &Package) -> EmberResult<Arc<dyn PackageEngine>> {
        let kind = EngineKind::of(package);
        self.engines.get(&kind).cloned().ok_or_else(|| {
            EmberError::Validation(format!(
                "no engine registered for {} package '{}'",
                package.kind.name(),
                package.id
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use ember_core::manifest::{ExePackage, MsiPackage, Package, PackageKind};

    use super::*;

    #[test]
    fn test_registry_lookup_by_kind() {
        let registry = EngineRegistry::with_defaults();
        let exe_package = Package {
            id: "p".into(),
            kind: PackageKind::Exe(ExePackage::default()),
            ..Package::default()
        };
        assert!(registry.engine_for(&exe_package).is_ok());

        let msi_package = Package {
            id: "m".into(),
            kind: PackageKind::Msi(MsiPackage::default()),
            ..Package::default()
        };
        assert!(registry.engine_for(&msi_package).is_err());
    }
}
