//! Detection: fills per-package current state and cache state, and
//! discovers related bundles registered on the machine.

use ember_core::{
    constants::{REGISTRATION_STATE_FILE, VARIABLE_BUNDLE_INSTALLED},
    error::EmberResult,
};
use ember_events::RelationType;
use ember_utils::fs::read_file;
use tracing::{debug, info, warn};

use crate::{
    engine::DetectContext,
    registration::RegistrationState,
    state::{EngineState, RelatedBundle},
};

/// Runs detection across the chain. Terminal UX callbacks fire on
/// every path.
pub fn detect(state: &mut EngineState) -> EmberResult<()> {
    let _activation = state.ux_host.activate()?;

    info!(packages = state.manifest.packages.len(), "detect begin");
    if state
        .ux
        .on_detect_begin(state.manifest.packages.len())
        .is_cancel()
    {
        state.ux.on_detect_complete(false);
        return Err(ember_core::error::EmberError::UserExit);
    }

    let result = detect_inner(state);
    state.ux.on_detect_complete(result.is_ok());
    info!(success = result.is_ok(), "detect complete");
    result
}

fn detect_inner(state: &mut EngineState) -> EmberResult<()> {
    state.registration.query(&state.cache)?;
    state.variables.set_numeric(
        VARIABLE_BUNDLE_INSTALLED,
        i64::from(state.registration.installed),
        true,
    )?;

    detect_related_bundles(state)?;

    for index in 0..state.manifest.packages.len() {
        let package = &state.manifest.packages[index];

        if state.ux.on_detect_package_begin(&package.id).is_cancel() {
            return Err(ember_core::error::EmberError::UserExit);
        }

        let engine = state.registry.engine_for(package)?;
        let current_state = engine.detect(&DetectContext {
            package,
            variables: &state.variables,
        })?;

        let cached = !package.payloads.is_empty()
            && package.payloads.iter().all(|&p| {
                state
                    .cache
                    .is_payload_cached(&package.cache_id, &state.manifest.payloads[p])
            });

        debug!(
            package = %package.id,
            ?current_state,
            cached,
            "package detected"
        );

        state.detect_states[index].current_state = current_state;
        state.detect_states[index].cached = cached;
        state.ux.on_detect_package_complete(&package.id, current_state);
    }

    Ok(())
}

/// Scans the cache root for other bundles' registrations. A bundle
/// sharing our provider key relates as an upgrade; anything else is
/// reported as a plain detection.
fn detect_related_bundles(state: &mut EngineState) -> EmberResult<()> {
    state.related_bundles.clear();

    let root = state.cache.root().to_path_buf();
    let Ok(entries) = std::fs::read_dir(&root) else {
        return Ok(());
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name == state.registration.bundle_id || name.starts_with('.') {
            continue;
        }

        let state_path = path.join(REGISTRATION_STATE_FILE);
        if !state_path.is_file() {
            continue;
        }
        let registration: RegistrationState = match read_file(&state_path)
            .ok()
            .and_then(|raw| serde_json::from_slice(&raw).ok())
        {
            Some(registration) => registration,
            None => {
                warn!(bundle = name, "unreadable related registration");
                continue;
            }
        };
        if !registration.installed {
            continue;
        }

        let relation = if registration.provider_key == state.registration.provider_key {
            RelationType::Upgrade
        } else {
            RelationType::Detect
        };
        let version = registration.version.parse().unwrap_or_default();

        debug!(bundle = name, ?relation, %version, "related bundle detected");
        state.related_bundles.push(RelatedBundle {
            id: registration.bundle_id,
            relation,
            version,
        });
    }

    Ok(())
}
