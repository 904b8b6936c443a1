//! Engine state shared across detect, plan, and apply.

use std::{path::PathBuf, sync::Arc};

use ember_core::{
    cache::CacheStore,
    constants::{
        VARIABLE_BUNDLE_INSTALLED, VARIABLE_BUNDLE_PROVIDER_KEY, VARIABLE_BUNDLE_TAG,
        VARIABLE_SOURCE_FOLDER,
    },
    error::EmberResult,
    manifest::{DeclaredType, Manifest},
    variable::{VariableValue, Variables},
    version::Version,
};
use ember_dl::types::CancelFlag;
use ember_events::{Display, PackageState, RelationType, RestartMode, UxHandle};

use crate::{
    elevation::ElevatedConnection,
    engine::EngineRegistry,
    extract::{ContainerExtractor, StreamContainerExtractor},
    plan::Plan,
    registration::Registration,
    ux::UxHost,
};

/// Per-package state filled by detect.
#[derive(Debug, Clone, Copy, Default)]
pub struct PackageDetectState {
    pub current_state: PackageState,
    pub cached: bool,
}

/// Another bundle found registered on the machine that relates to
/// this one.
#[derive(Debug, Clone)]
pub struct RelatedBundle {
    pub id: String,
    pub relation: RelationType,
    pub version: Version,
}

/// Everything the engine carries between operations.
pub struct EngineState {
    pub manifest: Manifest,
    pub variables: Variables,
    pub cache: CacheStore,
    pub registry: EngineRegistry,
    pub ux: UxHandle,
    pub ux_host: UxHost,
    pub registration: Registration,
    pub detect_states: Vec<PackageDetectState>,
    pub related_bundles: Vec<RelatedBundle>,
    pub plan: Plan,
    pub display: Display,
    pub restart_mode: RestartMode,
    pub relation_type: RelationType,
    /// When false the cache walk is fully joined before execute
    /// begins.
    pub parallel_cache_and_execute: bool,
    pub rollback_disabled: bool,
    pub cancel: Arc<CancelFlag>,
    pub extractor: Arc<dyn ContainerExtractor>,
    /// Control and cache pipes to the elevated helper, once
    /// established.
    pub elevated: Option<ElevatedConnection>,
    /// True when this process is itself the elevated helper.
    pub is_elevated_helper: bool,
}

impl EngineState {
    /// Builds engine state from a parsed manifest: registers
    /// variables, seeds the bundle built-ins, and queries previous
    /// registration.
    pub fn initialize(
        manifest: Manifest,
        cache_root: PathBuf,
        source_dir: PathBuf,
        ux: UxHandle,
    ) -> EmberResult<Self> {
        let variables = Variables::new();

        for decl in &manifest.variables {
            let value = match (&decl.value, decl.value_type) {
                (None, _) => VariableValue::None,
                (Some(raw), DeclaredType::String) => VariableValue::String(raw.clone()),
                (Some(raw), DeclaredType::Numeric) => {
                    VariableValue::Numeric(raw.trim().parse::<i64>().map_err(|_| {
                        ember_core::error::EmberError::Manifest(format!(
                            "variable '{}' has non-numeric value '{raw}'",
                            decl.name
                        ))
                    })?)
                }
                (Some(raw), DeclaredType::Version) => {
                    VariableValue::Version(raw.parse::<Version>()?)
                }
            };
            variables.declare(&decl.name, value, decl.hidden, decl.persisted)?;
        }

        variables.set_string(
            VARIABLE_BUNDLE_PROVIDER_KEY,
            &manifest.bundle.provider_key,
            true,
        )?;
        variables.set_string(VARIABLE_BUNDLE_TAG, &manifest.bundle.tag, true)?;
        variables.set_string(
            VARIABLE_SOURCE_FOLDER,
            &source_dir.display().to_string(),
            false,
        )?;

        let cache = CacheStore::new(cache_root, manifest.bundle.id.clone());
        let mut registration = Registration::from_bundle(&manifest.bundle);
        registration.query(&cache)?;
        registration.load_variables(&cache, &variables)?;
        variables.set_numeric(
            VARIABLE_BUNDLE_INSTALLED,
            i64::from(registration.installed),
            true,
        )?;

        let package_count = manifest.packages.len();
        Ok(Self {
            manifest,
            variables,
            cache,
            registry: EngineRegistry::with_defaults(),
            ux,
            ux_host: UxHost::new(),
            registration,
            detect_states: vec![PackageDetectState::default(); package_count],
            related_bundles: Vec::new(),
            plan: Plan::default(),
            display: Display::default(),
            restart_mode: RestartMode::default(),
            relation_type: RelationType::default(),
            parallel_cache_and_execute: true,
            rollback_disabled: false,
            cancel: Arc::new(CancelFlag::new()),
            extractor: Arc::new(StreamContainerExtractor),
            elevated: None,
            is_elevated_helper: false,
        })
    }
}
